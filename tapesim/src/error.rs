use tapesim_data::error::DataError;
use tapesim_execution::error::MatchError;
use tapesim_instrument::error::MetaError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TapesimError {
    /// Missing or malformed configuration; aborts before the first event.
    #[error("config: {0}")]
    Config(String),

    #[error("metadata: {0}")]
    Meta(#[from] MetaError),

    /// Reader I/O failure: the affected instrument's cache is marked empty
    /// and replay continues for other instruments.
    #[error("data: {0}")]
    Data(#[from] DataError),

    #[error("matching: {0}")]
    Match(#[from] MatchError),

    /// Internal accounting inconsistency: the run terminates gracefully
    /// (outputs flushed) with a non-zero exit.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("output: {0}")]
    Output(String),
}
