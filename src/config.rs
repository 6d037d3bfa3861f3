use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::{FileConfig, config_file_path, env_optional, load_file_config, normalize_base_url};

pub(crate) const DEFAULT_LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
pub(crate) const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub(crate) const GRAPH_DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";
pub(crate) const DEFAULT_CLIENT_STATE: &str = "InboxPilot-Secret-State";
pub(crate) const DEFAULT_WORKFLOW_URL: &str = "http://localhost:7860";
pub(crate) const DEFAULT_EMBEDDING_API_BASE: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub(crate) const DEFAULT_GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub(crate) const DEFAULT_GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";

/// Every key the settings loader reads. Used by `config show`.
pub(crate) const SETTING_KEYS: &[&str] = &[
    "MICROSOFT_TENANT_ID",
    "MICROSOFT_CLIENT_ID",
    "MICROSOFT_CLIENT_SECRET",
    "MICROSOFT_LOGIN_BASE_URL",
    "GRAPH_BASE_URL",
    "GRAPH_REQUEST_ATTEMPTS",
    "WEBHOOK_BASE_URL",
    "WEBHOOK_HOST",
    "WEBHOOK_PORT",
    "WEBHOOK_WORKERS",
    "EMAIL_WEBHOOK_PATH",
    "TEAMS_CHAT_WEBHOOK_PATH",
    "TEAMS_CHANNEL_WEBHOOK_PATH",
    "SUBSCRIPTION_CLIENT_STATE",
    "SUBSCRIPTION_EXPIRATION_HOURS",
    "SUBSCRIPTION_RENEW_INTERVAL_MINUTES",
    "SUBSCRIPTION_RENEW_MARGIN_MINUTES",
    "LANGFLOW_WEBHOOK_URL",
    "LANGFLOW_BASE_URL",
    "LANGFLOW_API_KEY",
    "WORKFLOW_TIMEOUT_SECS",
    "WORKFLOW_ATTEMPTS",
    "CHROMADB_HOST",
    "CHROMADB_BASE_PATH",
    "CHROMADB_OUTLOOK_PORT",
    "CHROMADB_OUTLOOK_PATH",
    "CHROMADB_TEAMS_PORT",
    "CHROMADB_TEAMS_PATH",
    "EMBEDDING_API_BASE",
    "EMBEDDING_API_KEY",
    "EMBEDDING_MODEL",
    "GMAIL_TOKEN_FILE",
    "GMAIL_CREDENTIALS_FILE",
    "GOOGLE_CLIENT_ID",
    "GOOGLE_CLIENT_SECRET",
    "GOOGLE_TOKEN_URL",
    "GOOGLE_SCOPES",
    "GMAIL_API_BASE",
];

const SECRET_KEYS: &[&str] = &[
    "MICROSOFT_CLIENT_SECRET",
    "SUBSCRIPTION_CLIENT_STATE",
    "LANGFLOW_API_KEY",
    "EMBEDDING_API_KEY",
    "GOOGLE_CLIENT_SECRET",
];

pub(crate) fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS.contains(&key)
}

/// Resolves setting names to values. Environment first, then the config file.
pub(crate) struct SettingsSource {
    lookup: Box<dyn Fn(&str) -> Option<String>>,
}

impl SettingsSource {
    pub(crate) fn from_env() -> Self {
        let file = load_file_config(&config_file_path());
        Self::layered(file)
    }

    pub(crate) fn layered(file: FileConfig) -> Self {
        Self {
            lookup: Box::new(move |name| env_optional(name).or_else(|| file.get(name))),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            lookup: Box::new(move |name| map.get(name).cloned()),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(name) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid { name, value }),
            None => Ok(default),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ClientCredentials {
    pub(crate) tenant_id: String,
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
}

#[derive(Debug, Clone)]
pub(crate) struct GraphSettings {
    pub(crate) tenant_id: Option<String>,
    pub(crate) client_id: Option<String>,
    pub(crate) client_secret: Option<String>,
    pub(crate) login_base_url: String,
    pub(crate) base_url: String,
    pub(crate) request_attempts: u32,
}

impl GraphSettings {
    pub(crate) fn credentials(&self) -> Result<ClientCredentials, ConfigError> {
        Ok(ClientCredentials {
            tenant_id: self
                .tenant_id
                .clone()
                .ok_or(ConfigError::Missing("MICROSOFT_TENANT_ID"))?,
            client_id: self
                .client_id
                .clone()
                .ok_or(ConfigError::Missing("MICROSOFT_CLIENT_ID"))?,
            client_secret: self
                .client_secret
                .clone()
                .ok_or(ConfigError::Missing("MICROSOFT_CLIENT_SECRET"))?,
        })
    }

    pub(crate) fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.login_base_url, tenant_id)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WebhookSettings {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) workers: usize,
    pub(crate) base_url: Option<String>,
    pub(crate) email_path: String,
    pub(crate) teams_chat_path: String,
    pub(crate) teams_channel_path: String,
    pub(crate) client_state: String,
    pub(crate) expiration_hours: i64,
    pub(crate) renew_interval_minutes: u64,
    pub(crate) renew_margin_minutes: i64,
}

impl WebhookSettings {
    pub(crate) fn notification_url(&self, webhook_path: &str) -> Result<String, ConfigError> {
        let base = self
            .base_url
            .as_deref()
            .ok_or(ConfigError::Missing("WEBHOOK_BASE_URL"))?;
        Ok(crate::join_url(base, webhook_path))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WorkflowSettings {
    pub(crate) url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) timeout_secs: u64,
    pub(crate) attempts: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct CollectionSettings {
    pub(crate) key: &'static str,
    pub(crate) name: String,
    pub(crate) description: &'static str,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) path: PathBuf,
    pub(crate) metric: String,
}

impl CollectionSettings {
    pub(crate) fn server_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EmbeddingSettings {
    pub(crate) api_base: String,
    pub(crate) api_key: Option<String>,
    pub(crate) model: String,
}

#[derive(Debug, Clone)]
pub(crate) struct VectorSettings {
    pub(crate) base_path: PathBuf,
    pub(crate) collections: Vec<CollectionSettings>,
    pub(crate) embedding: EmbeddingSettings,
}

impl VectorSettings {
    pub(crate) fn collection(&self, key: &str) -> Option<&CollectionSettings> {
        self.collections
            .iter()
            .find(|c| c.key.eq_ignore_ascii_case(key) || c.name == key)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct GmailSettings {
    pub(crate) token_file: PathBuf,
    pub(crate) credentials_file: PathBuf,
    pub(crate) client_id: Option<String>,
    pub(crate) client_secret: Option<String>,
    pub(crate) token_url: String,
    pub(crate) api_base: String,
    pub(crate) scopes: String,
}

#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) graph: GraphSettings,
    pub(crate) webhook: WebhookSettings,
    pub(crate) workflow: WorkflowSettings,
    pub(crate) vector: VectorSettings,
    pub(crate) gmail: GmailSettings,
}

pub(crate) const OUTLOOK_COLLECTION_KEY: &str = "outlookEmail";
pub(crate) const TEAMS_COLLECTION_KEY: &str = "teamsChat";

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        Self::from_source(&SettingsSource::from_env())
    }

    pub(crate) fn from_source(src: &SettingsSource) -> Result<Self, ConfigError> {
        let graph = GraphSettings {
            tenant_id: src.get("MICROSOFT_TENANT_ID"),
            client_id: src.get("MICROSOFT_CLIENT_ID"),
            client_secret: src.get("MICROSOFT_CLIENT_SECRET"),
            login_base_url: normalize_base_url(
                &src.string("MICROSOFT_LOGIN_BASE_URL", DEFAULT_LOGIN_BASE_URL),
            ),
            base_url: normalize_base_url(&src.string("GRAPH_BASE_URL", DEFAULT_GRAPH_BASE_URL)),
            request_attempts: src.parsed("GRAPH_REQUEST_ATTEMPTS", 3u32)?.max(1),
        };

        let webhook = WebhookSettings {
            host: src.string("WEBHOOK_HOST", "0.0.0.0"),
            port: src.parsed("WEBHOOK_PORT", 8000u16)?,
            workers: src.parsed("WEBHOOK_WORKERS", 8usize)?.max(1),
            base_url: src.get("WEBHOOK_BASE_URL").map(|v| normalize_base_url(&v)),
            email_path: crate::ensure_leading_slash(
                &src.string("EMAIL_WEBHOOK_PATH", "/webhooks/email"),
            ),
            teams_chat_path: crate::ensure_leading_slash(
                &src.string("TEAMS_CHAT_WEBHOOK_PATH", "/webhooks/teams/chat"),
            ),
            teams_channel_path: crate::ensure_leading_slash(
                &src.string("TEAMS_CHANNEL_WEBHOOK_PATH", "/webhooks/teams/channel"),
            ),
            client_state: src.string("SUBSCRIPTION_CLIENT_STATE", DEFAULT_CLIENT_STATE),
            expiration_hours: src.parsed("SUBSCRIPTION_EXPIRATION_HOURS", 24i64)?,
            renew_interval_minutes: src.parsed("SUBSCRIPTION_RENEW_INTERVAL_MINUTES", 0u64)?,
            renew_margin_minutes: src.parsed("SUBSCRIPTION_RENEW_MARGIN_MINUTES", 60i64)?,
        };
        if webhook.expiration_hours <= 0 {
            return Err(ConfigError::Invalid {
                name: "SUBSCRIPTION_EXPIRATION_HOURS",
                value: webhook.expiration_hours.to_string(),
            });
        }
        // both bounded by the longest subscription lifetime
        if webhook.renew_interval_minutes > crate::GRAPH_MAX_EXPIRATION_MINUTES as u64 {
            return Err(ConfigError::Invalid {
                name: "SUBSCRIPTION_RENEW_INTERVAL_MINUTES",
                value: webhook.renew_interval_minutes.to_string(),
            });
        }
        if !(0..=crate::GRAPH_MAX_EXPIRATION_MINUTES).contains(&webhook.renew_margin_minutes) {
            return Err(ConfigError::Invalid {
                name: "SUBSCRIPTION_RENEW_MARGIN_MINUTES",
                value: webhook.renew_margin_minutes.to_string(),
            });
        }

        let workflow = WorkflowSettings {
            url: src
                .get("LANGFLOW_WEBHOOK_URL")
                .or_else(|| src.get("LANGFLOW_BASE_URL"))
                .unwrap_or_else(|| DEFAULT_WORKFLOW_URL.to_string()),
            api_key: src.get("LANGFLOW_API_KEY"),
            timeout_secs: src.parsed("WORKFLOW_TIMEOUT_SECS", 30u64)?,
            attempts: src.parsed("WORKFLOW_ATTEMPTS", 2u32)?.max(1),
        };

        let host = src.string("CHROMADB_HOST", "localhost");
        let base_path = PathBuf::from(src.string("CHROMADB_BASE_PATH", "chromadb_data"));
        let collections = vec![
            CollectionSettings {
                key: OUTLOOK_COLLECTION_KEY,
                name: "outlook_emails".to_string(),
                description: "Outlook email storage and retrieval",
                host: host.clone(),
                port: src.parsed("CHROMADB_OUTLOOK_PORT", 8001u16)?,
                path: base_path.join(src.string("CHROMADB_OUTLOOK_PATH", "outlook_email")),
                metric: "cosine".to_string(),
            },
            CollectionSettings {
                key: TEAMS_COLLECTION_KEY,
                name: "teams_messages".to_string(),
                description: "Teams chat message storage and retrieval",
                host,
                port: src.parsed("CHROMADB_TEAMS_PORT", 8002u16)?,
                path: base_path.join(src.string("CHROMADB_TEAMS_PATH", "teams_chat")),
                metric: "cosine".to_string(),
            },
        ];
        let vector = VectorSettings {
            base_path,
            collections,
            embedding: EmbeddingSettings {
                api_base: normalize_base_url(
                    &src.string("EMBEDDING_API_BASE", DEFAULT_EMBEDDING_API_BASE),
                ),
                api_key: src.get("EMBEDDING_API_KEY").or_else(|| src.get("OPENAI_API_KEY")),
                model: src.string("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            },
        };

        let gmail = GmailSettings {
            token_file: PathBuf::from(src.string("GMAIL_TOKEN_FILE", "token.json")),
            credentials_file: PathBuf::from(src.string("GMAIL_CREDENTIALS_FILE", "credentials.json")),
            client_id: src.get("GOOGLE_CLIENT_ID"),
            client_secret: src.get("GOOGLE_CLIENT_SECRET"),
            token_url: src.string("GOOGLE_TOKEN_URL", DEFAULT_GOOGLE_TOKEN_URL),
            api_base: normalize_base_url(&src.string("GMAIL_API_BASE", DEFAULT_GMAIL_API_BASE)),
            scopes: src.string(
                "GOOGLE_SCOPES",
                "https://www.googleapis.com/auth/gmail.readonly https://www.googleapis.com/auth/gmail.send",
            ),
        };

        Ok(Settings {
            graph,
            webhook,
            workflow,
            vector,
            gmail,
        })
    }
}
