use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("transport failure for {url}: {detail}")]
    Transport { url: String, detail: String },

    #[error("http status {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("malformed page {url}: {detail}")]
    MalformedPage { url: String, detail: String },

    #[error("cannot derive a filename from {0}")]
    UnresolvableFilename(String),

    #[error("snapshot index query failed ({query}): {detail}")]
    IndexQuery { query: String, detail: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HarvestError {
    /// Network-level failures are retried; everything else fails fast.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::HttpStatus { .. })
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
