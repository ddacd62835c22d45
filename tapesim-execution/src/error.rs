use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchError {
    /// No tick has been replayed for the code; the order cannot be priced.
    #[error("unknown code: {0}")]
    UnknownCode(String),

    /// A tick older than a live order's submission reached the engine;
    /// the replay stream is corrupt.
    #[error("tick at {tick_time} predates order {local_id} submitted at {order_time}")]
    TickPredatesOrder {
        local_id: u32,
        order_time: u64,
        tick_time: u64,
    },
}
