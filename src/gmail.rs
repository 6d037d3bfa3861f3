//! Gmail REST access with a stored user token.

use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::{GmailSettings, GoogleClient, StoredToken, refresh_google_token, str_field, truncate_chars};

const GMAIL_TIMEOUT_MS: u64 = 30_000;
const MAX_LIST_RESULTS: u32 = 100;
const RECENT_BODY_CHARS: usize = 500;

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct GmailMessage {
    pub(crate) id: String,
    pub(crate) thread_id: String,
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) cc: String,
    pub(crate) subject: String,
    pub(crate) date: String,
    pub(crate) message_id: String,
    pub(crate) snippet: String,
    pub(crate) label_ids: Vec<String>,
    pub(crate) unread: bool,
    pub(crate) body_text: String,
    pub(crate) body_html: String,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct OutgoingMail<'a> {
    pub(crate) to: &'a str,
    pub(crate) subject: &'a str,
    pub(crate) body: &'a str,
    pub(crate) cc: Option<&'a str>,
    pub(crate) bcc: Option<&'a str>,
}

pub(crate) struct GmailClient {
    settings: GmailSettings,
    agent: ureq::Agent,
    token: Mutex<Option<StoredToken>>,
}

impl GmailClient {
    pub(crate) fn new(settings: GmailSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(GMAIL_TIMEOUT_MS))
            .timeout_read(Duration::from_millis(GMAIL_TIMEOUT_MS))
            .timeout_write(Duration::from_millis(GMAIL_TIMEOUT_MS))
            .build();
        Self {
            settings,
            agent,
            token: Mutex::new(None),
        }
    }

    /// Loads the token file on first use and refreshes it once expired.
    fn access_token(&self) -> Result<String> {
        let mut slot = self
            .token
            .lock()
            .map_err(|_| Error::Authentication("gmail token cache poisoned".into()))?;
        let current = match slot.take() {
            Some(token) => token,
            None => StoredToken::load(&self.settings.token_file)?,
        };
        let token = if current.expired(Utc::now().timestamp()) {
            let client = GoogleClient::resolve(&self.settings)?;
            let fresh = refresh_google_token(&self.settings.token_url, &client, &current)?;
            fresh.save(&self.settings.token_file)?;
            tracing::debug!("refreshed gmail access token");
            fresh
        } else {
            current
        };
        let value = token.access_token.clone();
        *slot = Some(token);
        Ok(value)
    }

    fn call(&self, method: &str, path: &str, query: &[(&str, String)], body: Option<Value>) -> Result<Value> {
        let token = self.access_token()?;
        let url = format!("{}/users/me/{}", self.settings.api_base, path.trim_start_matches('/'));
        let mut request = self
            .agent
            .request(method, &url)
            .set("Authorization", &format!("Bearer {token}"));
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        match response {
            Ok(resp) => {
                let text = resp.into_string()?;
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                Ok(serde_json::from_str(&text)?)
            }
            Err(ureq::Error::Status(401, resp)) => {
                if let Ok(mut slot) = self.token.lock() {
                    *slot = None;
                }
                let text = resp.into_string().unwrap_or_default();
                Err(Error::Authentication(format!("gmail rejected token: {text}")))
            }
            Err(ureq::Error::Status(status, resp)) => Err(Error::Provider {
                status,
                body: resp.into_string().unwrap_or_default(),
            }),
            Err(err) => Err(Error::Transport(format!("gmail {method} {path}: {err}"))),
        }
    }

    fn list_ids(&self, q: &str, max_results: u32) -> Result<Vec<String>> {
        let mut query = vec![("maxResults", max_results.clamp(1, MAX_LIST_RESULTS).to_string())];
        if !q.trim().is_empty() {
            query.push(("q", q.trim().to_string()));
        }
        let listing = self.call("GET", "messages", &query, None)?;
        Ok(listing
            .get("messages")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| str_field(m, "id").map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub(crate) fn get_message(&self, id: &str) -> Result<GmailMessage> {
        let raw = self.call(
            "GET",
            &format!("messages/{}", urlencoding::encode(id)),
            &[("format", "full".to_string())],
            None,
        )?;
        Ok(parse_message(&raw))
    }

    pub(crate) fn list_inbox(&self, max_results: u32, query: Option<&str>) -> Result<Vec<GmailMessage>> {
        let q = format!("in:inbox {}", query.unwrap_or(""));
        self.list_ids(&q, max_results)?
            .iter()
            .map(|id| self.get_message(id))
            .collect()
    }

    pub(crate) fn search(&self, query: &str, max_results: u32) -> Result<Vec<GmailMessage>> {
        self.list_ids(query, max_results)?
            .iter()
            .map(|id| self.get_message(id))
            .collect()
    }

    pub(crate) fn send(&self, mail: &OutgoingMail<'_>) -> Result<Value> {
        if mail.to.trim().is_empty() {
            return Err(Error::Validation("recipient is required".into()));
        }
        let raw = URL_SAFE_NO_PAD.encode(build_rfc822(mail));
        let sent = self.call("POST", "messages/send", &[], Some(json!({ "raw": raw })))?;
        tracing::info!(id = str_field(&sent, "id").unwrap_or(""), "gmail message sent");
        Ok(sent)
    }

    /// Compact projection for the knowledge tools.
    pub(crate) fn fetch_recent(&self, max_results: u32) -> Result<Vec<Value>> {
        Ok(self
            .list_inbox(max_results, None)?
            .into_iter()
            .map(|m| {
                let body = if m.body_text.is_empty() { &m.snippet } else { &m.body_text };
                json!({
                    "id": m.id,
                    "subject": m.subject,
                    "sender": m.from,
                    "date": m.date,
                    "body": truncate_chars(body, RECENT_BODY_CHARS),
                })
            })
            .collect())
    }
}

pub(crate) fn build_rfc822(mail: &OutgoingMail<'_>) -> String {
    let mut out = format!("To: {}\r\n", mail.to);
    if let Some(cc) = mail.cc.filter(|v| !v.trim().is_empty()) {
        out.push_str(&format!("Cc: {cc}\r\n"));
    }
    if let Some(bcc) = mail.bcc.filter(|v| !v.trim().is_empty()) {
        out.push_str(&format!("Bcc: {bcc}\r\n"));
    }
    out.push_str(&format!("Subject: {}\r\n", mail.subject));
    out.push_str("MIME-Version: 1.0\r\n");
    out.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n\r\n");
    out.push_str(mail.body);
    out
}

fn decode_body(data: &str) -> String {
    URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn collect_bodies(part: &Value, text: &mut String, html: &mut String) {
    let mime = str_field(part, "mimeType").unwrap_or("");
    if let Some(data) = part.get("body").and_then(|b| str_field(b, "data")) {
        match mime {
            "text/plain" if text.is_empty() => *text = decode_body(data),
            "text/html" if html.is_empty() => *html = decode_body(data),
            _ => {}
        }
    }
    if let Some(parts) = part.get("parts").and_then(|p| p.as_array()) {
        for child in parts {
            collect_bodies(child, text, html);
        }
    }
}

pub(crate) fn parse_message(raw: &Value) -> GmailMessage {
    let payload = raw.get("payload").cloned().unwrap_or(Value::Null);
    let header = |name: &str| -> String {
        payload
            .get("headers")
            .and_then(|h| h.as_array())
            .and_then(|headers| {
                headers.iter().find(|h| {
                    str_field(h, "name").is_some_and(|n| n.eq_ignore_ascii_case(name))
                })
            })
            .and_then(|h| str_field(h, "value"))
            .unwrap_or("")
            .to_string()
    };
    let label_ids: Vec<String> = raw
        .get("labelIds")
        .and_then(|v| v.as_array())
        .map(|labels| labels.iter().filter_map(|l| l.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let mut body_text = String::new();
    let mut body_html = String::new();
    collect_bodies(&payload, &mut body_text, &mut body_html);

    GmailMessage {
        id: str_field(raw, "id").unwrap_or("").to_string(),
        thread_id: str_field(raw, "threadId").unwrap_or("").to_string(),
        from: header("From"),
        to: header("To"),
        cc: header("Cc"),
        subject: header("Subject"),
        date: header("Date"),
        message_id: header("Message-ID"),
        snippet: str_field(raw, "snippet").unwrap_or("").to_string(),
        unread: label_ids.iter().any(|l| l == "UNREAD"),
        label_ids,
        body_text,
        body_html,
    }
}
