use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Buffer pool capacity must be greater than zero")]
    InvalidCapacity,

    #[error("Buffer size must be greater than zero")]
    InvalidBufferSize,

    #[error("No free buffer became available within the wait window")]
    Exhausted,

    #[error("Buffer pool has been closed")]
    Closed,
}
