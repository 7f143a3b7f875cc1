use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Rate limited (retCode=10006 or HTTP 429). retry_after in seconds.
    #[error("rate limited (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },
    /// Transient error: network, HTTP 5xx, server overload (retCode=10016).
    #[error("transient error: {0}")]
    Transient(String),
    /// Permanent error: invalid params, insufficient balance, HTTP 4xx.
    #[error("permanent error: {0}")]
    Permanent(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExchangeError::Permanent(_))
    }

    /// The request may have reached the venue before the error, so a write
    /// could have taken effect.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ExchangeError::Timeout(_) | ExchangeError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} env var not set")]
    MissingEnv(&'static str),
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("no tradable symbols")]
    NoSymbols,
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),
}
