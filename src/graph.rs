use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::{GraphSettings, TokenProvider, parse_retry_after, retry_delay};

const GRAPH_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Default, Clone)]
pub(crate) struct RequestOptions {
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: Option<Value>,
    pub(crate) headers: Vec<(String, String)>,
}

impl RequestOptions {
    pub(crate) fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub(crate) fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub(crate) fn header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.push((key.to_string(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GraphResponse {
    pub(crate) status: u16,
    pub(crate) body: Value,
}

fn retryable_status(status: u16) -> bool {
    matches!(status, 429 | 502 | 503 | 504)
}

fn parse_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

/// Authenticated Graph executor. Every higher-level Graph operation goes
/// through [`GraphClient::send`].
pub(crate) struct GraphClient {
    base_url: String,
    tokens: Arc<TokenProvider>,
    agent: ureq::Agent,
    attempts: u32,
}

impl GraphClient {
    pub(crate) fn new(settings: &GraphSettings, tokens: Arc<TokenProvider>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(GRAPH_TIMEOUT_MS))
            .timeout_read(Duration::from_millis(GRAPH_TIMEOUT_MS))
            .timeout_write(Duration::from_millis(GRAPH_TIMEOUT_MS))
            .build();
        Self {
            base_url: settings.base_url.clone(),
            tokens,
            agent,
            attempts: settings.request_attempts.max(1),
        }
    }

    pub(crate) fn url_for(&self, path: &str) -> String {
        if path.starts_with("https://") || path.starts_with("http://") {
            path.to_string()
        } else {
            crate::join_url(&self.base_url, path)
        }
    }

    /// Issue a request and return the parsed body. Non-2xx is an error.
    pub(crate) fn request(&self, method: &str, path: &str, options: &RequestOptions) -> Result<Value> {
        Ok(self.send(method, path, options)?.body)
    }

    pub(crate) fn get(&self, path: &str) -> Result<Value> {
        self.request("GET", path, &RequestOptions::default())
    }

    /// Issue a request with bounded retries on throttling, gateway errors and
    /// transport failures. A 401 drops the cached token and tries once more.
    pub(crate) fn send(&self, method: &str, path: &str, options: &RequestOptions) -> Result<GraphResponse> {
        let url = self.url_for(path);
        let mut last_error = Error::Transport(format!("{method} {url}: no attempt made"));
        let mut refreshed_token = false;
        let mut attempt = 0u32;

        while attempt < self.attempts {
            let token = self.tokens.access_token()?;
            let mut request = self
                .agent
                .request(method, &url)
                .set("authorization", &format!("Bearer {token}"))
                .set("accept", "application/json");
            for (key, value) in &options.query {
                request = request.query(key, value);
            }
            for (key, value) in &options.headers {
                request = request.set(key, value);
            }
            let result = match &options.body {
                Some(body) => request.send_json(body.clone()),
                None => request.call(),
            };

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.into_string().map_err(|e| Error::Transport(e.to_string()))?;
                    tracing::debug!(method, %url, status, attempt, "graph request completed");
                    return Ok(GraphResponse {
                        status,
                        body: parse_body(&text),
                    });
                }
                Err(ureq::Error::Status(401, resp)) if !refreshed_token => {
                    let text = resp.into_string().unwrap_or_default();
                    tracing::warn!(method, %url, "graph rejected bearer token; refreshing");
                    self.tokens.invalidate();
                    refreshed_token = true;
                    last_error = Error::Provider { status: 401, body: text };
                    // does not consume an attempt
                    continue;
                }
                Err(ureq::Error::Status(code, resp)) => {
                    let retry_after = parse_retry_after(&resp);
                    let text = resp.into_string().unwrap_or_default();
                    if !retryable_status(code) {
                        tracing::warn!(method, %url, status = code, "graph request failed");
                        return Err(Error::Provider { status: code, body: text });
                    }
                    last_error = Error::Provider { status: code, body: text };
                    attempt += 1;
                    if attempt < self.attempts {
                        let delay = retry_delay(attempt - 1, retry_after);
                        tracing::warn!(method, %url, status = code, attempt, delay_ms = delay.as_millis() as u64, "graph request throttled; retrying");
                        thread::sleep(delay);
                    }
                }
                Err(err) => {
                    last_error = Error::Transport(format!("{method} {url}: {err}"));
                    attempt += 1;
                    if attempt < self.attempts {
                        let delay = retry_delay(attempt - 1, None);
                        tracing::warn!(method, %url, error = %err, attempt, "graph transport error; retrying");
                        thread::sleep(delay);
                    }
                }
            }
        }

        Err(last_error)
    }

    // ── Resource helpers ────────────────────────────────────────────────

    pub(crate) fn get_email(&self, user_id: &str, message_id: &str) -> Result<Value> {
        self.get(&format!(
            "users/{}/messages/{}",
            urlencoding::encode(user_id),
            urlencoding::encode(message_id)
        ))
    }

    pub(crate) fn get_chat_message(&self, chat_id: &str, message_id: &str) -> Result<Value> {
        self.get(&format!(
            "chats/{}/messages/{}",
            urlencoding::encode(chat_id),
            urlencoding::encode(message_id)
        ))
    }

    pub(crate) fn get_channel_message(
        &self,
        team_id: &str,
        channel_id: &str,
        message_id: &str,
    ) -> Result<Value> {
        self.get(&format!(
            "teams/{}/channels/{}/messages/{}",
            urlencoding::encode(team_id),
            urlencoding::encode(channel_id),
            urlencoding::encode(message_id)
        ))
    }

    pub(crate) fn list_user_teams(&self, user_id: &str) -> Result<Vec<Value>> {
        let body = self.get(&format!("users/{}/joinedTeams", urlencoding::encode(user_id)))?;
        Ok(collection_values(&body))
    }

    pub(crate) fn list_team_channels(&self, team_id: &str) -> Result<Vec<Value>> {
        let body = self.get(&format!("teams/{}/channels", urlencoding::encode(team_id)))?;
        Ok(collection_values(&body))
    }
}

/// The `value` array of an OData collection response.
pub(crate) fn collection_values(body: &Value) -> Vec<Value> {
    body.get("value")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockReply, MockServer, is_token_request, settings_for, token_reply};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client_for(mock: &MockServer, extra: &[(&str, &str)]) -> GraphClient {
        let settings = settings_for(mock.url(), extra);
        let tokens = Arc::new(TokenProvider::new(&settings.graph).unwrap());
        GraphClient::new(&settings.graph, tokens)
    }

    #[test]
    fn attaches_bearer_and_parses_body() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            MockReply::json(200, serde_json::json!({ "id": "m1", "subject": "hi" }))
        });
        let client = client_for(&mock, &[]);

        let body = client
            .request(
                "GET",
                "users/u1/messages/m1",
                &RequestOptions::default().query("$select", "id,subject"),
            )
            .unwrap();

        assert_eq!(body["subject"], "hi");
        let graph_req = mock
            .requests()
            .into_iter()
            .find(|r| !is_token_request(r))
            .unwrap();
        assert_eq!(graph_req.path(), "/v1.0/users/u1/messages/m1");
        assert!(graph_req.url.contains("%24select=id%2Csubject") || graph_req.url.contains("$select=id,subject"));
        assert_eq!(graph_req.header("authorization"), Some("Bearer test-access-token"));
    }

    #[test]
    fn empty_body_becomes_empty_object() {
        let mock = MockServer::start(|req, _| {
            if is_token_request(req) {
                token_reply()
            } else {
                MockReply::empty(204)
            }
        });
        let client = client_for(&mock, &[]);
        let response = client
            .send("DELETE", "subscriptions/s1", &RequestOptions::default())
            .unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(response.body, serde_json::json!({}));
    }

    #[test]
    fn non_retryable_error_surfaces_immediately() {
        let graph_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&graph_calls);
        let mock = MockServer::start(move |req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            counter.fetch_add(1, Ordering::SeqCst);
            MockReply::json(400, serde_json::json!({ "error": { "message": "bad resource" } }))
        });
        let client = client_for(&mock, &[]);

        let err = client.get("subscriptions").unwrap_err();
        match err {
            Error::Provider { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("bad resource"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(graph_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn service_unavailable_is_retried() {
        let graph_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&graph_calls);
        let mock = MockServer::start(move |req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                MockReply::json(503, serde_json::json!({})).with_header("Retry-After", "0")
            } else {
                MockReply::json(200, serde_json::json!({ "value": [] }))
            }
        });
        let client = client_for(&mock, &[]);

        let body = client.get("subscriptions").unwrap();
        assert_eq!(body["value"], serde_json::json!([]));
        assert_eq!(graph_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retries_are_bounded() {
        let graph_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&graph_calls);
        let mock = MockServer::start(move |req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            counter.fetch_add(1, Ordering::SeqCst);
            MockReply::json(429, serde_json::json!({})).with_header("Retry-After", "0")
        });
        let client = client_for(&mock, &[("GRAPH_REQUEST_ATTEMPTS", "2")]);

        let err = client.get("subscriptions").unwrap_err();
        assert!(matches!(err, Error::Provider { status: 429, .. }));
        assert_eq!(graph_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unauthorized_refreshes_token_once() {
        let graph_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&graph_calls);
        let mock = MockServer::start(move |req, _| {
            if is_token_request(req) {
                return token_reply();
            }
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                MockReply::json(401, serde_json::json!({ "error": "expired" }))
            } else {
                MockReply::json(200, serde_json::json!({ "ok": true }))
            }
        });
        let client = client_for(&mock, &[("GRAPH_REQUEST_ATTEMPTS", "1")]);

        let body = client.get("me").unwrap();
        assert_eq!(body["ok"], true);
        let token_calls = mock.requests().iter().filter(|r| is_token_request(r)).count();
        assert_eq!(token_calls, 2);
    }

    #[test]
    fn absolute_next_links_are_used_verbatim() {
        let mock = MockServer::start(|_, _| token_reply());
        let client = client_for(&mock, &[]);
        assert_eq!(
            client.url_for("https://graph.microsoft.com/v1.0/subscriptions?$skiptoken=x"),
            "https://graph.microsoft.com/v1.0/subscriptions?$skiptoken=x"
        );
        assert!(client.url_for("subscriptions").ends_with("/v1.0/subscriptions"));
    }

    #[test]
    fn collection_values_reads_value_array() {
        let body = serde_json::json!({ "value": [{ "id": "a" }, { "id": "b" }] });
        assert_eq!(collection_values(&body).len(), 2);
        assert!(collection_values(&serde_json::json!({})).is_empty());
    }
}
