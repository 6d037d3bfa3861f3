use std::thread;
use std::time::Duration;

use serde_json::Value;

use crate::error::ForwardingError;
use crate::{NotificationEvent, WorkflowSettings, retry_delay};

/// Posts normalized events to the workflow trigger (Langflow webhook).
pub(crate) struct WorkflowForwarder {
    url: String,
    api_key: Option<String>,
    attempts: u32,
    agent: ureq::Agent,
}

impl WorkflowForwarder {
    pub(crate) fn new(settings: &WorkflowSettings) -> Self {
        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: settings.url.clone(),
            api_key: settings.api_key.clone(),
            attempts: settings.attempts.max(1),
            agent,
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn forward(&self, event: &NotificationEvent) -> Result<Value, ForwardingError> {
        self.forward_value(&event.to_json())
    }

    /// Retries transport failures and 5xx; a 4xx is final.
    pub(crate) fn forward_value(&self, payload: &Value) -> Result<Value, ForwardingError> {
        let mut last_error = ForwardingError::Unreachable("no attempt made".to_string());
        for attempt in 0..self.attempts {
            if attempt > 0 {
                thread::sleep(retry_delay(attempt - 1, None));
            }
            let mut request = self
                .agent
                .post(&self.url)
                .set("content-type", "application/json");
            if let Some(key) = &self.api_key {
                request = request.set("x-api-key", key);
            }
            match request.send_json(payload.clone()) {
                Ok(resp) => {
                    let text = resp.into_string().unwrap_or_default();
                    tracing::info!(
                        kind = payload.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
                        attempt,
                        "workflow triggered"
                    );
                    return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
                }
                Err(ureq::Error::Status(code, resp)) => {
                    let body = resp.into_string().unwrap_or_default();
                    last_error = ForwardingError::Rejected { status: code, body };
                    if code < 500 {
                        break;
                    }
                    tracing::warn!(status = code, attempt, "workflow endpoint error");
                }
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "workflow endpoint unreachable");
                    last_error = ForwardingError::Unreachable(err.to_string());
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockReply, MockServer, settings_for};

    fn sample_event() -> NotificationEvent {
        let item = serde_json::from_value(serde_json::json!({
            "resource": "chats/C1/messages/M1", "changeType": "created", "subscriptionId": "s1"
        }))
        .unwrap();
        NotificationEvent::build(
            crate::NotificationKind::TeamsChat,
            &item,
            crate::extract_resource_ids("chats/C1/messages/M1"),
            serde_json::json!({ "body": "hello" }),
            "2025-01-01T00:00:00Z".to_string(),
        )
    }

    #[test]
    fn posts_event_json_with_api_key() {
        let mock = MockServer::start(|_, _| MockReply::json(200, serde_json::json!({ "status": "ok" })));
        let settings = settings_for(mock.url(), &[("LANGFLOW_API_KEY", "flow-key")]);
        let forwarder = WorkflowForwarder::new(&settings.workflow);

        let reply = forwarder.forward(&sample_event()).unwrap();

        assert_eq!(reply["status"], "ok");
        let request = &mock.requests()[0];
        assert_eq!(request.path(), "/flow");
        assert_eq!(request.header("x-api-key"), Some("flow-key"));
        let body = request.json();
        assert_eq!(body["type"], "teams_chat");
        assert_eq!(body["chat_id"], "C1");
        assert_eq!(body["message_details"]["body"], "hello");
    }

    #[test]
    fn server_errors_are_retried_then_reported() {
        let mock = MockServer::start(|_, _| MockReply::json(502, serde_json::json!({ "detail": "down" })));
        let settings = settings_for(mock.url(), &[("WORKFLOW_ATTEMPTS", "2")]);
        let forwarder = WorkflowForwarder::new(&settings.workflow);

        let err = forwarder.forward(&sample_event()).unwrap_err();

        assert!(matches!(err, ForwardingError::Rejected { status: 502, .. }));
        assert_eq!(mock.hits(), 2);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let mock = MockServer::start(|_, _| MockReply::json(404, serde_json::json!({})));
        let settings = settings_for(mock.url(), &[("WORKFLOW_ATTEMPTS", "3")]);
        let forwarder = WorkflowForwarder::new(&settings.workflow);

        assert!(forwarder.forward(&sample_event()).is_err());
        assert_eq!(mock.hits(), 1);
    }

    #[test]
    fn unreachable_endpoint_is_a_forwarding_error() {
        let settings = settings_for("http://127.0.0.1:1", &[("WORKFLOW_ATTEMPTS", "1")]);
        let forwarder = WorkflowForwarder::new(&settings.workflow);
        assert!(matches!(
            forwarder.forward(&sample_event()),
            Err(ForwardingError::Unreachable(_))
        ));
    }
}
