use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::{ClientCredentials, GRAPH_DEFAULT_SCOPE, GraphSettings};

const TOKEN_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub(crate) struct AccessToken {
    pub(crate) value: String,
    pub(crate) expires_at: Instant,
}

impl AccessToken {
    fn usable(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Client-credentials token source for Graph. One cached token per provider.
pub(crate) struct TokenProvider {
    token_url: String,
    credentials: ClientCredentials,
    scope: String,
    safety_margin: Duration,
    agent: ureq::Agent,
    cached: Mutex<Option<AccessToken>>,
}

impl TokenProvider {
    pub(crate) fn new(settings: &GraphSettings) -> Result<Self> {
        let credentials = settings.credentials()?;
        let token_url = settings.token_url(&credentials.tenant_id);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(TOKEN_TIMEOUT_MS))
            .timeout_read(Duration::from_millis(TOKEN_TIMEOUT_MS))
            .timeout_write(Duration::from_millis(TOKEN_TIMEOUT_MS))
            .build();
        Ok(Self {
            token_url,
            credentials,
            scope: GRAPH_DEFAULT_SCOPE.to_string(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            agent,
            cached: Mutex::new(None),
        })
    }

    /// Returns the cached token while it is outside the safety margin,
    /// otherwise exchanges the client credentials for a new one.
    ///
    /// The cache lock is held across the exchange so concurrent callers that
    /// find an expired token wait for a single refresh.
    pub(crate) fn access_token(&self) -> Result<String> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| Error::Authentication("token cache poisoned".to_string()))?;
        if let Some(token) = cached.as_ref() {
            if token.usable(self.safety_margin) {
                return Ok(token.value.clone());
            }
        }
        let token = self.exchange()?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token, e.g. after the provider rejected it.
    pub(crate) fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    fn exchange(&self) -> Result<AccessToken> {
        let payload = form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.credentials.client_id)
            .append_pair("client_secret", &self.credentials.client_secret)
            .append_pair("scope", &self.scope)
            .append_pair("grant_type", "client_credentials")
            .finish();
        let started = Instant::now();
        let response = self
            .agent
            .post(&self.token_url)
            .set("content-type", "application/x-www-form-urlencoded")
            .send_string(&payload);
        let parsed: TokenResponse = match response {
            Ok(resp) => resp
                .into_json()
                .map_err(|e| Error::Authentication(format!("token response: {e}")))?,
            Err(ureq::Error::Status(code, resp)) => {
                let text = resp.into_string().unwrap_or_default();
                tracing::warn!(status = code, "client credentials exchange rejected");
                return Err(Error::Authentication(format!("token error {code}: {text}")));
            }
            Err(err) => {
                return Err(Error::Authentication(format!("token request failed: {err}")));
            }
        };
        let value = parsed
            .access_token
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| Error::Authentication("token response missing access_token".into()))?;
        let lifetime = Duration::from_secs(parsed.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));
        tracing::debug!(expires_in = lifetime.as_secs(), "acquired graph access token");
        Ok(AccessToken {
            value,
            expires_at: started + lifetime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockReply, MockServer, settings_for, token_reply};

    #[test]
    fn token_is_reused_within_validity_window() {
        let mock = MockServer::start(|_, _| token_reply());
        let settings = settings_for(mock.url(), &[]);
        let provider = TokenProvider::new(&settings.graph).unwrap();

        let first = provider.access_token().unwrap();
        let second = provider.access_token().unwrap();

        assert_eq!(first, "test-access-token");
        assert_eq!(first, second);
        assert_eq!(mock.hits(), 1);
        let request = &mock.requests()[0];
        assert_eq!(request.path(), "/tenant-1/oauth2/v2.0/token");
        assert!(request.body.contains("grant_type=client_credentials"));
        assert!(request.body.contains("client_id=client-1"));
        assert!(request.body.contains("scope=https%3A%2F%2Fgraph.microsoft.com%2F.default"));
    }

    #[test]
    fn token_inside_safety_margin_is_refreshed() {
        let mock = MockServer::start(|_, _| {
            MockReply::json(200, serde_json::json!({ "access_token": "short", "expires_in": 30 }))
        });
        let settings = settings_for(mock.url(), &[]);
        let provider = TokenProvider::new(&settings.graph).unwrap();

        provider.access_token().unwrap();
        provider.access_token().unwrap();

        assert_eq!(mock.hits(), 2);
    }

    #[test]
    fn invalidate_forces_new_exchange() {
        let mock = MockServer::start(|_, _| token_reply());
        let settings = settings_for(mock.url(), &[]);
        let provider = TokenProvider::new(&settings.graph).unwrap();

        provider.access_token().unwrap();
        provider.invalidate();
        provider.access_token().unwrap();

        assert_eq!(mock.hits(), 2);
    }

    #[test]
    fn rejected_exchange_is_an_authentication_error() {
        let mock = MockServer::start(|_, _| {
            MockReply::json(400, serde_json::json!({ "error": "invalid_client" }))
        });
        let settings = settings_for(mock.url(), &[]);
        let provider = TokenProvider::new(&settings.graph).unwrap();

        let err = provider.access_token().unwrap_err();
        match err {
            Error::Authentication(text) => assert!(text.contains("invalid_client")),
            other => panic!("unexpected error: {other}"),
        }
        // no retry on token exchange
        assert_eq!(mock.hits(), 1);
    }

    #[test]
    fn missing_access_token_field_is_rejected() {
        let mock = MockServer::start(|_, _| MockReply::json(200, serde_json::json!({})));
        let settings = settings_for(mock.url(), &[]);
        let provider = TokenProvider::new(&settings.graph).unwrap();
        assert!(matches!(provider.access_token(), Err(Error::Authentication(_))));
    }
}
