use thiserror::Error;

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum DataError {
    /// The backing store is corrupt or unreachable. Absence of data is an
    /// empty slice, never this error.
    #[error("reader unavailable: {0}")]
    ReaderUnavailable(String),

    #[error("unknown session template for {0}")]
    UnknownSession(String),
}
