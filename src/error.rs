use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("missing subscription key: set ARTDATABANKEN_SUBSCRIPTION_KEY")]
    MissingApiKey,

    #[error("invalid configuration value for {key}: {value}")]
    InvalidConfig { key: String, value: String },

    #[error("could not uniquely resolve root taxon: {0}")]
    AmbiguousRoot(String),

    #[error("taxon service request failed: {0}")]
    ServiceHttp(String),

    #[error("taxon service returned status {status}\nURL: {url}\nBody:\n{body}")]
    ServiceStatus {
        status: u16,
        url: String,
        body: String,
    },

    #[error("unexpected payload from {url}: {detail}")]
    UnexpectedPayload { url: String, detail: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database state error: {0}")]
    DatabaseState(String),
}
