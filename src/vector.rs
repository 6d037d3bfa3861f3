//! Chroma-backed store for the two knowledge collections.
//!
//! Each logical collection lives on its own Chroma server with its own on-disk
//! directory. Ranking and indexing are entirely the server's business; this
//! module only embeds text, shapes requests and flattens responses.

use std::collections::HashMap;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::{CollectionSettings, Embedder, OUTLOOK_COLLECTION_KEY, TEAMS_COLLECTION_KEY, VectorSettings, blake3_hash};

const CHROMA_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CollectionRecord {
    pub(crate) id: String,
    pub(crate) text: String,
    #[serde(default)]
    pub(crate) metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct QueryMatch {
    pub(crate) id: String,
    pub(crate) content: String,
    pub(crate) metadata: Value,
    pub(crate) distance: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CollectionHandle {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) metadata: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Value>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f64>>>>,
}

/// Thin client for one Chroma server's v1 REST API.
pub(crate) struct ChromaClient {
    base_url: String,
    client: Client,
}

impl ChromaClient {
    pub(crate) fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(CHROMA_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::VectorStore(format!("http client: {e}")))?;
        Ok(Self {
            base_url: crate::normalize_base_url(base_url),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn decode(&self, what: &str, resp: reqwest::Result<reqwest::blocking::Response>) -> Result<Value> {
        let resp = resp.map_err(|e| {
            Error::VectorStore(format!("{what}: chroma at {} unreachable: {e}", self.base_url))
        })?;
        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(Error::VectorStore(format!(
                "{what}: chroma returned {}: {text}",
                status.as_u16()
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| Error::VectorStore(format!("{what}: {e}")))
    }

    pub(crate) fn heartbeat(&self) -> Result<Value> {
        self.decode("heartbeat", self.client.get(self.url("heartbeat")).send())
    }

    pub(crate) fn get_or_create_collection(&self, name: &str, metadata: Value) -> Result<CollectionHandle> {
        let body = json!({ "name": name, "metadata": metadata, "get_or_create": true });
        let value = self.decode(
            "create collection",
            self.client.post(self.url("collections")).json(&body).send(),
        )?;
        serde_json::from_value(value).map_err(|e| Error::VectorStore(format!("collection handle: {e}")))
    }

    pub(crate) fn delete_collection(&self, name: &str) -> Result<()> {
        let url = self.url(&format!("collections/{}", urlencoding::encode(name)));
        self.decode("delete collection", self.client.delete(url).send())?;
        Ok(())
    }

    pub(crate) fn add(
        &self,
        collection_id: &str,
        records: &[CollectionRecord],
        embeddings: Vec<Vec<f32>>,
    ) -> Result<()> {
        let body = json!({
            "ids": records.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            "documents": records.iter().map(|r| r.text.as_str()).collect::<Vec<_>>(),
            "metadatas": records.iter().map(|r| Value::Object(sanitize_metadata(&r.metadata))).collect::<Vec<_>>(),
            "embeddings": embeddings,
        });
        let url = self.url(&format!("collections/{collection_id}/add"));
        self.decode("add", self.client.post(url).json(&body).send())?;
        Ok(())
    }

    pub(crate) fn query(
        &self,
        collection_id: &str,
        embedding: Vec<f32>,
        top_k: usize,
        filter: Option<&Value>,
    ) -> Result<Vec<QueryMatch>> {
        let mut body = json!({
            "query_embeddings": [embedding],
            "n_results": top_k.max(1),
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(filter) = filter.filter(|f| f.as_object().is_some_and(|o| !o.is_empty())) {
            body["where"] = filter.clone();
        }
        let url = self.url(&format!("collections/{collection_id}/query"));
        let value = self.decode("query", self.client.post(url).json(&body).send())?;
        let parsed: QueryResponse =
            serde_json::from_value(value).map_err(|e| Error::VectorStore(format!("query response: {e}")))?;
        Ok(flatten_query(parsed))
    }

    pub(crate) fn count(&self, collection_id: &str) -> Result<u64> {
        let url = self.url(&format!("collections/{collection_id}/count"));
        let value = self.decode("count", self.client.get(url).send())?;
        value
            .as_u64()
            .ok_or_else(|| Error::VectorStore(format!("count response was not a number: {value}")))
    }
}

/// Chroma accepts only scalar metadata values.
fn sanitize_metadata(metadata: &Map<String, Value>) -> Map<String, Value> {
    metadata
        .iter()
        .filter_map(|(k, v)| match v {
            Value::Null => None,
            Value::String(_) | Value::Number(_) | Value::Bool(_) => Some((k.clone(), v.clone())),
            other => Some((k.clone(), Value::String(other.to_string()))),
        })
        .collect()
}

/// The server answers one row per query embedding; only the first is used.
fn flatten_query(parsed: QueryResponse) -> Vec<QueryMatch> {
    let ids = parsed.ids.into_iter().next().unwrap_or_default();
    let documents = parsed.documents.and_then(|d| d.into_iter().next()).unwrap_or_default();
    let metadatas = parsed.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default();
    let distances = parsed.distances.and_then(|d| d.into_iter().next()).unwrap_or_default();
    ids.into_iter()
        .enumerate()
        .map(|(i, id)| QueryMatch {
            id,
            content: documents.get(i).cloned().flatten().unwrap_or_default(),
            metadata: metadatas
                .get(i)
                .cloned()
                .flatten()
                .unwrap_or_else(|| json!({})),
            distance: distances.get(i).copied().flatten(),
        })
        .collect()
}

pub(crate) struct VectorStoreManager {
    settings: VectorSettings,
    embedder: Box<dyn Embedder>,
    clients: HashMap<&'static str, ChromaClient>,
    handles: Mutex<HashMap<&'static str, CollectionHandle>>,
}

impl VectorStoreManager {
    pub(crate) fn new(settings: VectorSettings, embedder: Box<dyn Embedder>) -> Result<Self> {
        let mut clients = HashMap::new();
        for collection in &settings.collections {
            clients.insert(collection.key, ChromaClient::new(&collection.server_url())?);
        }
        Ok(Self {
            settings,
            embedder,
            clients,
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn resolve(&self, collection: &str) -> Result<(&CollectionSettings, &ChromaClient)> {
        let config = self
            .settings
            .collection(collection)
            .ok_or_else(|| Error::Validation(format!("unknown collection {collection}")))?;
        let client = self
            .clients
            .get(config.key)
            .ok_or_else(|| Error::VectorStore(format!("no client for {}", config.key)))?;
        Ok((config, client))
    }

    pub(crate) fn collection_keys(&self) -> Vec<&'static str> {
        self.settings.collections.iter().map(|c| c.key).collect()
    }

    /// Idempotent get-or-create. `metric` overrides the configured space.
    pub(crate) fn ensure_collection(&self, collection: &str, metric: Option<&str>) -> Result<CollectionHandle> {
        let (config, client) = self.resolve(collection)?;
        if metric.is_none() {
            if let Some(handle) = self.cached_handle(config.key) {
                return Ok(handle);
            }
        }
        let metadata = json!({
            "hnsw:space": metric.unwrap_or(&config.metric),
            "description": config.description,
        });
        let handle = client.get_or_create_collection(&config.name, metadata)?;
        tracing::debug!(collection = %config.name, id = %handle.id, "collection ready");
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(config.key, handle.clone());
        }
        Ok(handle)
    }

    fn cached_handle(&self, key: &str) -> Option<CollectionHandle> {
        self.handles.lock().ok()?.get(key).cloned()
    }

    pub(crate) fn init_all(&self) -> Result<Vec<CollectionHandle>> {
        self.settings
            .collections
            .iter()
            .map(|c| self.ensure_collection(c.key, None))
            .collect()
    }

    pub(crate) fn heartbeat(&self, collection: &str) -> Result<Value> {
        let (_, client) = self.resolve(collection)?;
        client.heartbeat()
    }

    /// No deduplication here; a reused id behaves as the server defines.
    pub(crate) fn add(&self, collection: &str, records: &[CollectionRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let handle = self.ensure_collection(collection, None)?;
        let (_, client) = self.resolve(collection)?;
        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts)?;
        client.add(&handle.id, records, embeddings)?;
        tracing::info!(collection = %handle.name, count = records.len(), "records added");
        Ok(())
    }

    pub(crate) fn query(
        &self,
        collection: &str,
        text: &str,
        top_k: usize,
        filter: Option<&Value>,
    ) -> Result<Vec<QueryMatch>> {
        let handle = self.ensure_collection(collection, None)?;
        let (_, client) = self.resolve(collection)?;
        let embedding = self.embedder.embed_one(text)?;
        client.query(&handle.id, embedding, top_k, filter)
    }

    pub(crate) fn stats(&self) -> Result<Value> {
        let mut stats = Map::new();
        for config in &self.settings.collections {
            let handle = self.ensure_collection(config.key, None)?;
            let (_, client) = self.resolve(config.key)?;
            stats.insert(
                config.key.to_string(),
                json!({
                    "name": config.name,
                    "count": client.count(&handle.id)?,
                    "url": config.server_url(),
                    "path": config.path.display().to_string(),
                }),
            );
        }
        Ok(Value::Object(stats))
    }

    /// Drop and recreate a collection, discarding its records.
    pub(crate) fn reset(&self, collection: &str) -> Result<CollectionHandle> {
        let (config, client) = self.resolve(collection)?;
        client.delete_collection(&config.name)?;
        if let Ok(mut handles) = self.handles.lock() {
            handles.remove(config.key);
        }
        tracing::warn!(collection = %config.name, "collection reset");
        self.ensure_collection(config.key, None)
    }

    pub(crate) fn store_email(
        &self,
        subject: &str,
        sender: &str,
        content: &str,
        email_type: &str,
        priority: &str,
    ) -> Result<String> {
        let text = format!("Subject: {subject}\nFrom: {sender}\n{content}");
        let id = record_id("email", &text);
        let mut metadata = Map::new();
        metadata.insert("sender".into(), json!(sender));
        metadata.insert("subject".into(), json!(subject));
        metadata.insert("type".into(), json!(email_type));
        metadata.insert("priority".into(), json!(priority));
        metadata.insert("timestamp".into(), json!(crate::now_rfc3339()));
        self.add(
            OUTLOOK_COLLECTION_KEY,
            &[CollectionRecord {
                id: id.clone(),
                text,
                metadata,
            }],
        )?;
        Ok(id)
    }

    pub(crate) fn store_chat(&self, message: &str, user: &str, channel: &str) -> Result<String> {
        let id = record_id("chat", message);
        let mut metadata = Map::new();
        metadata.insert("user".into(), json!(user));
        metadata.insert("channel".into(), json!(channel));
        metadata.insert("timestamp".into(), json!(crate::now_rfc3339()));
        self.add(
            TEAMS_COLLECTION_KEY,
            &[CollectionRecord {
                id: id.clone(),
                text: message.to_string(),
                metadata,
            }],
        )?;
        Ok(id)
    }
}

fn record_id(prefix: &str, text: &str) -> String {
    let digest = blake3_hash(text.as_bytes()).to_hex();
    format!(
        "{prefix}_{}_{}",
        Utc::now().format("%Y%m%dT%H%M%S%.6f"),
        &digest.as_str()[..12]
    )
}

// ── Server launcher ─────────────────────────────────────────────────────

/// Chroma server processes, one per collection. Killed on drop.
pub(crate) struct ChromaServers {
    children: Vec<(String, Child)>,
}

impl ChromaServers {
    pub(crate) fn launch(settings: &VectorSettings, program: &str, wait: Duration) -> Result<Self> {
        let mut servers = ChromaServers { children: Vec::new() };
        for config in &settings.collections {
            std::fs::create_dir_all(&config.path)?;
            let child = Command::new(program)
                .arg("run")
                .arg("--path")
                .arg(&config.path)
                .arg("--host")
                .arg(&config.host)
                .arg("--port")
                .arg(config.port.to_string())
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| Error::VectorStore(format!("spawn {program} for {}: {e}", config.key)))?;
            tracing::info!(collection = %config.name, port = config.port, path = %config.path.display(), pid = child.id(), "chroma server started");
            servers.children.push((config.key.to_string(), child));
        }

        for config in &settings.collections {
            let client = ChromaClient::new(&config.server_url())?;
            wait_for_heartbeat(&client, wait).map_err(|e| {
                Error::VectorStore(format!("{} did not become healthy: {e}", config.server_url()))
            })?;
        }
        Ok(servers)
    }

    pub(crate) fn len(&self) -> usize {
        self.children.len()
    }

    /// Block until stdin closes or every server exits. Ctrl-C reaches the
    /// children through the process group.
    pub(crate) fn wait(self) -> Result<()> {
        self.wait_until_closed(io::stdin())
    }

    /// Block until `input` reaches EOF or every server exits. Servers still
    /// running on return are killed.
    pub(crate) fn wait_until_closed<R: Read + Send + 'static>(mut self, mut input: R) -> Result<()> {
        let (closed_tx, closed_rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = io::copy(&mut input, &mut io::sink());
            let _ = closed_tx.send(());
        });

        while !self.children.is_empty() {
            match closed_rx.recv_timeout(Duration::from_millis(500)) {
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                _ => {
                    tracing::info!(running = self.children.len(), "input closed; stopping chroma servers");
                    return Ok(());
                }
            }
            let mut running = Vec::with_capacity(self.children.len());
            for (key, mut child) in self.children.drain(..) {
                match child.try_wait()? {
                    Some(status) => tracing::warn!(collection = %key, %status, "chroma server exited"),
                    None => running.push((key, child)),
                }
            }
            self.children = running;
        }
        Ok(())
    }
}

fn wait_for_heartbeat(client: &ChromaClient, wait: Duration) -> Result<()> {
    let deadline = Instant::now() + wait;
    loop {
        match client.heartbeat() {
            Ok(_) => return Ok(()),
            Err(err) if Instant::now() >= deadline => return Err(err),
            Err(_) => thread::sleep(Duration::from_millis(500)),
        }
    }
}

impl Drop for ChromaServers {
    fn drop(&mut self) {
        for (key, child) in &mut self.children {
            if let Err(err) = child.kill() {
                tracing::debug!(collection = %key, error = %err, "chroma server already stopped");
            }
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::tests::FixedEmbedder;
    use crate::test_support::{MockReply, MockServer, RecordedRequest};

    fn chroma(req: &RecordedRequest) -> MockReply {
        let path = req.path();
        if path == "/api/v1/collections" {
            let name = req.json()["name"].as_str().unwrap_or("").to_string();
            return MockReply::json(200, json!({ "id": format!("uuid-{name}"), "name": name, "metadata": req.json()["metadata"] }));
        }
        if path.ends_with("/add") {
            return MockReply::json(201, json!(true));
        }
        if path.ends_with("/query") {
            return MockReply::json(
                200,
                json!({
                    "ids": [["a", "b"]],
                    "documents": [["first doc", null]],
                    "metadatas": [[{ "priority": "high" }, null]],
                    "distances": [[0.12, 0.5]]
                }),
            );
        }
        if path.ends_with("/count") {
            return MockReply::json(200, json!(7));
        }
        if req.method == "DELETE" {
            return MockReply::json(200, Value::Null);
        }
        if path == "/api/v1/heartbeat" {
            return MockReply::json(200, json!({ "nanosecond heartbeat": 1 }));
        }
        MockReply::empty(404)
    }

    fn manager_for(mock: &MockServer) -> VectorStoreManager {
        let port = mock.url().rsplit(':').next().unwrap().to_string();
        let settings = crate::Settings::from_source(&crate::SettingsSource::from_pairs(&[
            ("CHROMADB_HOST", "127.0.0.1"),
            ("CHROMADB_OUTLOOK_PORT", port.as_str()),
            ("CHROMADB_TEAMS_PORT", port.as_str()),
        ]))
        .unwrap();
        VectorStoreManager::new(settings.vector, Box::new(FixedEmbedder)).unwrap()
    }

    #[test]
    fn ensure_collection_is_get_or_create_with_metric() {
        let mock = MockServer::start(|req, _| chroma(req));
        let store = manager_for(&mock);

        let handle = store.ensure_collection("outlookEmail", None).unwrap();
        let again = store.ensure_collection("outlookEmail", None).unwrap();

        assert_eq!(handle.id, "uuid-outlook_emails");
        assert_eq!(again.id, handle.id);
        let creates: Vec<_> = mock.requests().into_iter().filter(|r| r.path() == "/api/v1/collections").collect();
        assert_eq!(creates.len(), 1);
        let body = creates[0].json();
        assert_eq!(body["get_or_create"], true);
        assert_eq!(body["metadata"]["hnsw:space"], "cosine");
    }

    #[test]
    fn add_sends_embeddings_and_scalar_metadata() {
        let mock = MockServer::start(|req, _| chroma(req));
        let store = manager_for(&mock);
        let mut metadata = Map::new();
        metadata.insert("user".into(), json!("ana"));
        metadata.insert("tags".into(), json!(["x", "y"]));
        metadata.insert("missing".into(), Value::Null);

        store
            .add(
                "teamsChat",
                &[CollectionRecord { id: "m1".into(), text: "hello".into(), metadata }],
            )
            .unwrap();

        let add = mock.requests().into_iter().find(|r| r.path().ends_with("/add")).unwrap();
        assert_eq!(add.path(), "/api/v1/collections/uuid-teams_messages/add");
        let body = add.json();
        assert_eq!(body["ids"], json!(["m1"]));
        assert_eq!(body["embeddings"], json!([[5.0, 1.0, 0.0]]));
        assert_eq!(body["metadatas"][0]["tags"], "[\"x\",\"y\"]");
        assert!(body["metadatas"][0].get("missing").is_none());
    }

    #[test]
    fn query_flattens_first_row() {
        let mock = MockServer::start(|req, _| chroma(req));
        let store = manager_for(&mock);
        let filter = json!({ "priority": "high" });

        let matches = store.query("outlook_emails", "budget", 2, Some(&filter)).unwrap();

        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "a");
        assert_eq!(matches[0].content, "first doc");
        assert_eq!(matches[0].metadata["priority"], "high");
        assert_eq!(matches[0].distance, Some(0.12));
        assert_eq!(matches[1].content, "");
        assert_eq!(matches[1].metadata, json!({}));
        let query = mock.requests().into_iter().find(|r| r.path().ends_with("/query")).unwrap().json();
        assert_eq!(query["n_results"], 2);
        assert_eq!(query["where"]["priority"], "high");
    }

    #[test]
    fn empty_filter_is_omitted() {
        let mock = MockServer::start(|req, _| chroma(req));
        let store = manager_for(&mock);
        store.query("teamsChat", "hi", 5, Some(&json!({}))).unwrap();
        let query = mock.requests().into_iter().find(|r| r.path().ends_with("/query")).unwrap().json();
        assert!(query.get("where").is_none());
    }

    #[test]
    fn stats_counts_each_collection() {
        let mock = MockServer::start(|req, _| chroma(req));
        let store = manager_for(&mock);
        let stats = store.stats().unwrap();
        assert_eq!(stats["outlookEmail"]["count"], 7);
        assert_eq!(stats["teamsChat"]["name"], "teams_messages");
    }

    #[test]
    fn reset_deletes_and_recreates() {
        let mock = MockServer::start(|req, _| chroma(req));
        let store = manager_for(&mock);
        store.ensure_collection("teamsChat", None).unwrap();
        store.reset("teamsChat").unwrap();
        let requests = mock.requests();
        assert!(requests.iter().any(|r| r.method == "DELETE" && r.path() == "/api/v1/collections/teams_messages"));
        let creates = requests.iter().filter(|r| r.path() == "/api/v1/collections").count();
        assert_eq!(creates, 2);
    }

    #[test]
    fn store_email_formats_document() {
        let mock = MockServer::start(|req, _| chroma(req));
        let store = manager_for(&mock);
        let id = store.store_email("Budget", "cfo@example.com", "Numbers attached", "finance", "high").unwrap();
        assert!(id.starts_with("email_"));
        let add = mock.requests().into_iter().find(|r| r.path().ends_with("/add")).unwrap().json();
        assert_eq!(add["documents"][0], "Subject: Budget\nFrom: cfo@example.com\nNumbers attached");
        assert_eq!(add["metadatas"][0]["priority"], "high");
        assert_eq!(add["metadatas"][0]["sender"], "cfo@example.com");
    }

    #[test]
    fn unknown_collection_is_rejected() {
        let mock = MockServer::start(|req, _| chroma(req));
        let store = manager_for(&mock);
        assert!(matches!(store.query("nope", "x", 1, None), Err(Error::Validation(_))));
    }

    #[test]
    fn unreachable_server_is_a_vector_store_error() {
        let client = ChromaClient::new("http://127.0.0.1:1").unwrap();
        assert!(matches!(client.heartbeat(), Err(Error::VectorStore(_))));
    }

    #[cfg(unix)]
    fn servers_running(commands: &[(&str, &str)]) -> ChromaServers {
        let children = commands
            .iter()
            .map(|(program, arg)| {
                let child = Command::new(program).arg(arg).spawn().unwrap();
                (program.to_string(), child)
            })
            .collect();
        ChromaServers { children }
    }

    /// Never reaches EOF within a test's lifetime.
    #[cfg(unix)]
    struct OpenInput;

    #[cfg(unix)]
    impl Read for OpenInput {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_secs(300));
            Ok(0)
        }
    }

    #[cfg(unix)]
    #[test]
    fn closed_input_stops_running_servers() {
        let servers = servers_running(&[("sleep", "30")]);
        let started = Instant::now();

        servers.wait_until_closed(io::empty()).unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn wait_returns_when_every_server_exits() {
        let servers = servers_running(&[("true", "x"), ("false", "x")]);
        let started = Instant::now();

        servers.wait_until_closed(OpenInput).unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
