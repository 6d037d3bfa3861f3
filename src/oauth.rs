use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tiny_http::{Response, Server};
use url::form_urlencoded;

use crate::GmailSettings;
use crate::error::{ConfigError, Error, Result};

const OAUTH_TIMEOUT_MS: u64 = 30_000;
const EXPIRY_MARGIN_SECS: i64 = 60;

// ── OAuth ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct GoogleClient {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
}

impl GoogleClient {
    /// Environment wins; otherwise the `installed` or `web` block of the
    /// downloaded client secrets file.
    pub(crate) fn resolve(settings: &GmailSettings) -> Result<Self> {
        if let (Some(client_id), Some(client_secret)) =
            (settings.client_id.clone(), settings.client_secret.clone())
        {
            return Ok(Self {
                client_id,
                client_secret,
            });
        }
        let raw = fs::read_to_string(&settings.credentials_file)
            .map_err(|_| ConfigError::Missing("GOOGLE_CLIENT_ID"))?;
        let parsed: Value = serde_json::from_str(&raw)?;
        let block = parsed
            .get("installed")
            .or_else(|| parsed.get("web"))
            .unwrap_or(&parsed);
        let field = |name: &'static str, key: &str| -> Result<String> {
            block
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .ok_or(Error::Config(ConfigError::Missing(name)))
        };
        Ok(Self {
            client_id: field("GOOGLE_CLIENT_ID", "client_id")?,
            client_secret: field("GOOGLE_CLIENT_SECRET", "client_secret")?,
        })
    }
}

/// Persisted Gmail user token. `expires_at` is unix seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredToken {
    pub(crate) access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) expires_at: Option<i64>,
}

impl StoredToken {
    /// Build from a token endpoint response. Google omits `refresh_token` on
    /// refresh, so the previous one is carried over.
    pub(crate) fn from_response(response: &Value, previous_refresh: Option<&str>) -> Result<Self> {
        let access_token = response
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Authentication("token response missing access_token".into()))?
            .to_string();
        let refresh_token = response
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| previous_refresh.map(str::to_string));
        let expires_at = response
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .map(|secs| Utc::now().timestamp() + secs);
        Ok(Self {
            access_token,
            refresh_token,
            expires_at,
        })
    }

    pub(crate) fn expired(&self, now_unix: i64) -> bool {
        self.expires_at
            .is_some_and(|at| now_unix + EXPIRY_MARGIN_SECS >= at)
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            Error::Authentication(format!(
                "no gmail token at {} ({e}); run `inboxpilot connect google`",
                path.display()
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn oauth_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_millis(OAUTH_TIMEOUT_MS))
        .timeout_read(Duration::from_millis(OAUTH_TIMEOUT_MS))
        .timeout_write(Duration::from_millis(OAUTH_TIMEOUT_MS))
        .build()
}

pub(crate) fn build_oauth_redirect(base: &str, provider: &str) -> String {
    format!("{base}/oauth/{provider}/callback")
}

pub(crate) fn build_google_auth_url(client_id: &str, redirect_uri: &str, scope: &str, state: &str) -> String {
    format!(
        "https://accounts.google.com/o/oauth2/v2/auth?response_type=code&client_id={}&redirect_uri={}&scope={}&access_type=offline&prompt=consent&state={}",
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(scope),
        urlencoding::encode(state)
    )
}

fn post_token_form(token_url: &str, payload: &str) -> Result<Value> {
    let response = oauth_agent()
        .post(token_url)
        .set("content-type", "application/x-www-form-urlencoded")
        .send_string(payload);
    match response {
        Ok(resp) => resp
            .into_json()
            .map_err(|e| Error::Authentication(format!("token response: {e}"))),
        Err(ureq::Error::Status(code, resp)) => {
            let text = resp.into_string().unwrap_or_default();
            Err(Error::Authentication(format!("token error {code}: {text}")))
        }
        Err(err) => Err(Error::Authentication(format!("token request failed: {err}"))),
    }
}

pub(crate) fn exchange_oauth_code(
    token_url: &str,
    client: &GoogleClient,
    redirect_uri: &str,
    code: &str,
) -> Result<Value> {
    let payload = form_urlencoded::Serializer::new(String::new())
        .append_pair("client_id", &client.client_id)
        .append_pair("client_secret", &client.client_secret)
        .append_pair("grant_type", "authorization_code")
        .append_pair("code", code)
        .append_pair("redirect_uri", redirect_uri)
        .finish();
    post_token_form(token_url, &payload)
}

pub(crate) fn refresh_google_token(
    token_url: &str,
    client: &GoogleClient,
    token: &StoredToken,
) -> Result<StoredToken> {
    let refresh_token = token
        .refresh_token
        .as_deref()
        .ok_or_else(|| Error::Authentication("gmail token has no refresh_token".into()))?;
    let payload = form_urlencoded::Serializer::new(String::new())
        .append_pair("client_id", &client.client_id)
        .append_pair("client_secret", &client.client_secret)
        .append_pair("grant_type", "refresh_token")
        .append_pair("refresh_token", refresh_token)
        .finish();
    let refreshed = post_token_form(token_url, &payload)?;
    StoredToken::from_response(&refreshed, Some(refresh_token))
}

/// Serve the consent redirect once, exchange the code and write the token file.
pub(crate) fn run_oauth_broker(
    settings: &GmailSettings,
    bind: &str,
    port: u16,
    redirect_base: Option<String>,
) -> Result<()> {
    let client = GoogleClient::resolve(settings)?;
    let redirect_base = redirect_base.unwrap_or_else(|| format!("http://{bind}:{port}"));
    let redirect_uri = build_oauth_redirect(&redirect_base, "google");
    let state = crate::blake3_hash(format!("{}{}", client.client_id, Utc::now()).as_bytes())
        .to_hex()
        .to_string();
    let auth_url = build_google_auth_url(&client.client_id, &redirect_uri, &settings.scopes, &state);

    println!("Open this URL to authorize:\n{auth_url}");
    let addr = format!("{bind}:{port}");
    let server = Server::http(&addr).map_err(|e| Error::Transport(format!("oauth broker: {e}")))?;
    tracing::info!(%addr, "oauth broker listening");

    for request in server.incoming_requests() {
        let url = request.url().to_string();
        if !url.starts_with("/oauth/google/callback") {
            let _ = request.respond(Response::from_string("ok"));
            continue;
        }
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
        let params: HashMap<String, String> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        if params.get("state").map(String::as_str) != Some(state.as_str()) {
            let _ = request.respond(Response::from_string("state mismatch").with_status_code(400));
            continue;
        }
        let Some(code) = params.get("code") else {
            let _ = request.respond(Response::from_string("missing code").with_status_code(400));
            continue;
        };
        let response = exchange_oauth_code(&settings.token_url, &client, &redirect_uri, code)?;
        let token = StoredToken::from_response(&response, None)?;
        token.save(&settings.token_file)?;
        let _ = request.respond(Response::from_string("Authorized. You can close this tab."));
        println!("Stored gmail token in {}", settings.token_file.display());
        break;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockReply, MockServer};
    use serde_json::json;

    fn gmail_settings(dir: &Path) -> GmailSettings {
        let settings = crate::Settings::from_source(&crate::SettingsSource::from_pairs(&[])).unwrap();
        GmailSettings {
            token_file: dir.join("token.json"),
            credentials_file: dir.join("credentials.json"),
            ..settings.gmail
        }
    }

    #[test]
    fn auth_url_requests_offline_access() {
        let url = build_google_auth_url("cid", "http://127.0.0.1:8765/oauth/google/callback", "a b", "s1");
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("scope=a%20b"));
        assert!(url.contains("redirect_uri=http%3A%2F%2F127.0.0.1%3A8765%2Foauth%2Fgoogle%2Fcallback"));
    }

    #[test]
    fn client_from_installed_block() {
        let dir = tempfile::tempdir().unwrap();
        let settings = gmail_settings(dir.path());
        fs::write(
            &settings.credentials_file,
            json!({ "installed": { "client_id": "file-id", "client_secret": "file-secret" } }).to_string(),
        )
        .unwrap();
        let client = GoogleClient::resolve(&settings).unwrap();
        assert_eq!(client.client_id, "file-id");
        assert_eq!(client.client_secret, "file-secret");
    }

    #[test]
    fn env_client_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = gmail_settings(dir.path());
        settings.client_id = Some("env-id".into());
        settings.client_secret = Some("env-secret".into());
        assert_eq!(GoogleClient::resolve(&settings).unwrap().client_id, "env-id");
    }

    #[test]
    fn missing_client_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = gmail_settings(dir.path());
        assert!(matches!(GoogleClient::resolve(&settings), Err(Error::Config(_))));
    }

    #[test]
    fn refresh_keeps_previous_refresh_token() {
        let mock = MockServer::start(|_, _| {
            MockReply::json(200, json!({ "access_token": "fresh", "expires_in": 3599 }))
        });
        let client = GoogleClient {
            client_id: "cid".into(),
            client_secret: "sec".into(),
        };
        let old = StoredToken {
            access_token: "stale".into(),
            refresh_token: Some("rt-1".into()),
            expires_at: Some(0),
        };
        let token_url = format!("{}/token", mock.url());

        let fresh = refresh_google_token(&token_url, &client, &old).unwrap();

        assert_eq!(fresh.access_token, "fresh");
        assert_eq!(fresh.refresh_token.as_deref(), Some("rt-1"));
        assert!(!fresh.expired(Utc::now().timestamp()));
        let body = &mock.requests()[0].body;
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=rt-1"));
    }

    #[test]
    fn refresh_without_refresh_token_fails() {
        let client = GoogleClient {
            client_id: "cid".into(),
            client_secret: "sec".into(),
        };
        let token = StoredToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: None,
        };
        let err = refresh_google_token("http://127.0.0.1:1/token", &client, &token).unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[test]
    fn token_file_round_trip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/token.json");
        let token = StoredToken {
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            expires_at: Some(1_000),
        };
        token.save(&path).unwrap();
        let loaded = StoredToken::load(&path).unwrap();
        assert_eq!(loaded.refresh_token.as_deref(), Some("r"));
        assert!(loaded.expired(1_000));
        assert!(!loaded.expired(100));
        assert!(StoredToken::load(&dir.path().join("absent.json")).is_err());
    }
}
