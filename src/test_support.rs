//! In-process HTTP stand-in for Graph, the token authority, Chroma and the
//! workflow endpoint.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tiny_http::{Header, Response, Server};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) method: String,
    pub(crate) url: String,
    pub(crate) body: String,
    pub(crate) headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub(crate) fn path(&self) -> &str {
        self.url.split('?').next().unwrap_or("")
    }

    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

pub(crate) struct MockReply {
    pub(crate) status: u16,
    pub(crate) body: String,
    pub(crate) headers: Vec<(String, String)>,
}

impl MockReply {
    pub(crate) fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            body: value.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        }
    }

    pub(crate) fn empty(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            headers: Vec::new(),
        }
    }

    pub(crate) fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

type Handler = dyn Fn(&RecordedRequest, usize) -> MockReply + Send + Sync;

pub(crate) struct MockServer {
    server: Arc<Server>,
    base_url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockServer {
    /// The handler receives each request and its zero-based arrival index.
    pub(crate) fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest, usize) -> MockReply + Send + Sync + 'static,
    {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind mock server"));
        let addr = server
            .server_addr()
            .to_ip()
            .expect("mock server has an ip address");
        let base_url = format!("http://{addr}");
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let worker_server = Arc::clone(&server);
        let worker_hits = Arc::clone(&hits);
        let worker_requests = Arc::clone(&requests);
        thread::spawn(move || {
            for mut request in worker_server.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let recorded = RecordedRequest {
                    method: request.method().as_str().to_string(),
                    url: request.url().to_string(),
                    body,
                    headers: request
                        .headers()
                        .iter()
                        .map(|h| (h.field.as_str().to_string(), h.value.as_str().to_string()))
                        .collect(),
                };
                let index = worker_hits.fetch_add(1, Ordering::SeqCst);
                let reply = handler(&recorded, index);
                worker_requests.lock().unwrap().push(recorded);
                let mut response = Response::from_string(reply.body).with_status_code(reply.status);
                for (name, value) in reply.headers {
                    if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
                        response = response.with_header(header);
                    }
                }
                let _ = request.respond(response);
            }
        });

        Self {
            server,
            base_url,
            hits,
            requests,
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

/// Settings pointed at a mock server for every HTTP collaborator.
pub(crate) fn settings_for(mock_url: &str, extra: &[(&str, &str)]) -> crate::Settings {
    let graph = format!("{mock_url}/v1.0");
    let workflow = format!("{mock_url}/flow");
    let mut pairs: Vec<(&str, &str)> = vec![
        ("MICROSOFT_TENANT_ID", "tenant-1"),
        ("MICROSOFT_CLIENT_ID", "client-1"),
        ("MICROSOFT_CLIENT_SECRET", "secret-1"),
        ("MICROSOFT_LOGIN_BASE_URL", mock_url),
        ("GRAPH_BASE_URL", graph.as_str()),
        ("WEBHOOK_BASE_URL", "https://hooks.example.com"),
        ("LANGFLOW_WEBHOOK_URL", workflow.as_str()),
        ("SUBSCRIPTION_CLIENT_STATE", "expected-state"),
    ];
    pairs.extend_from_slice(extra);
    crate::Settings::from_source(&crate::SettingsSource::from_pairs(&pairs))
        .expect("test settings")
}

/// Token endpoint reply used by most Graph-backed tests.
pub(crate) fn token_reply() -> MockReply {
    MockReply::json(
        200,
        serde_json::json!({
            "token_type": "Bearer",
            "expires_in": 3599,
            "access_token": "test-access-token"
        }),
    )
}

pub(crate) fn is_token_request(req: &RecordedRequest) -> bool {
    req.method == "POST" && req.path().ends_with("/oauth2/v2.0/token")
}
