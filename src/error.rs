use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("missing configuration value {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub(crate) enum ForwardingError {
    #[error("workflow unreachable: {0}")]
    Unreachable(String),
    #[error("workflow returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("provider request failed with {status}: {body}")]
    Provider { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Forwarding(#[from] ForwardingError),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("vector store error: {0}")]
    VectorStore(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Status code used when the error is reported to an operator over HTTP.
    pub(crate) fn http_status(&self) -> u16 {
        match self {
            Error::Authentication(_) => 401,
            Error::Provider { .. } | Error::Transport(_) | Error::Forwarding(_) => 502,
            Error::Validation(_) => 422,
            Error::Subscription(_) => 400,
            Error::VectorStore(_) => 503,
            Error::Config(_) | Error::Io(_) | Error::Json(_) => 500,
        }
    }

    /// Provider body text, when the error carries one.
    pub(crate) fn detail(&self) -> Option<&str> {
        match self {
            Error::Provider { body, .. } => Some(body.as_str()),
            Error::Forwarding(ForwardingError::Rejected { body, .. }) => Some(body.as_str()),
            _ => None,
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        matches!(self, Error::Provider { status: 404, .. })
    }
}
