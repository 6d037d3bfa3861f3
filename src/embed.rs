use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::EmbeddingSettings;
use crate::error::{Error, Result};

const EMBED_TIMEOUT_SECS: u64 = 30;
const EMBED_MAX_RETRIES: u32 = 3;
const EMBED_INITIAL_BACKOFF_MS: u64 = 1000;

/// Text to vector. The vector server stores and ranks, it does not embed.
pub(crate) trait Embedder: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| Error::VectorStore("embedding response was empty".to_string()))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

/// OpenAI-compatible `/embeddings` endpoint.
pub(crate) struct ApiEmbedder {
    url: String,
    model: String,
    client: Client,
    headers: HeaderMap,
}

impl ApiEmbedder {
    pub(crate) fn new(settings: &EmbeddingSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .as_deref()
            .ok_or(crate::error::ConfigError::Missing("EMBEDDING_API_KEY"))?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))
                .map_err(|_| Error::VectorStore("invalid embedding api key format".to_string()))?,
        );
        let client = Client::builder()
            .timeout(Duration::from_secs(EMBED_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::VectorStore(format!("embedding client: {e}")))?;
        tracing::debug!(model = %settings.model, base = %settings.api_base, "embedder initialized");
        Ok(Self {
            url: format!("{}/embeddings", settings.api_base),
            model: settings.model.clone(),
            client,
            headers,
        })
    }
}

impl std::fmt::Debug for ApiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiEmbedder")
            .field("url", &self.url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl Embedder for ApiEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            encoding_format: "float",
        };

        let mut backoff_ms = EMBED_INITIAL_BACKOFF_MS;
        let mut last_error = Error::VectorStore("embedding retries exhausted".to_string());
        for attempt in 0..=EMBED_MAX_RETRIES {
            if attempt > 0 {
                tracing::warn!(attempt, backoff_ms, "retrying embedding request");
                std::thread::sleep(Duration::from_millis(backoff_ms));
                backoff_ms *= 2;
            }
            let response = self
                .client
                .post(&self.url)
                .headers(self.headers.clone())
                .json(&body)
                .send();
            match response {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: EmbeddingResponse = resp
                        .json()
                        .map_err(|e| Error::VectorStore(format!("embedding response: {e}")))?;
                    let mut data = parsed.data;
                    data.sort_by_key(|d| d.index);
                    if data.len() != texts.len() {
                        return Err(Error::VectorStore(format!(
                            "expected {} embeddings, got {}",
                            texts.len(),
                            data.len()
                        )));
                    }
                    return Ok(data.into_iter().map(|d| d.embedding).collect());
                }
                Ok(resp) if resp.status().as_u16() == 429 => {
                    last_error = Error::Provider {
                        status: 429,
                        body: "embedding rate limit exceeded".to_string(),
                    };
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().unwrap_or_default();
                    return Err(Error::Provider { status, body });
                }
                Err(err) if err.is_timeout() || err.is_connect() => {
                    last_error = Error::Transport(format!("embedding request: {err}"));
                }
                Err(err) => return Err(Error::Transport(format!("embedding request: {err}"))),
            }
        }
        Err(last_error)
    }
}

/// Stand-in used when no embedding key is configured. Collection management
/// still works; anything that needs a vector reports the missing key.
struct UnconfiguredEmbedder;

impl Embedder for UnconfiguredEmbedder {
    fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(crate::error::ConfigError::Missing("EMBEDDING_API_KEY").into())
    }
}

pub(crate) fn embedder_from_settings(settings: &EmbeddingSettings) -> Result<Box<dyn Embedder>> {
    if settings.api_key.is_none() {
        tracing::debug!("no embedding key configured; similarity operations are unavailable");
        return Ok(Box::new(UnconfiguredEmbedder));
    }
    Ok(Box::new(ApiEmbedder::new(settings)?))
}
