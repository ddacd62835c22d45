use thiserror::Error;

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum MetaError {
    #[error("io failure reading {path}: {detail}")]
    Io { path: String, detail: String },

    #[error("malformed metadata in {path}: {detail}")]
    Parse { path: String, detail: String },

    #[error("unknown session template: {0}")]
    UnknownSession(String),

    #[error("unknown commodity: {0}")]
    UnknownCommodity(String),

    #[error("unknown contract: {0}")]
    UnknownContract(String),
}
