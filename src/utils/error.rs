use thiserror::Error;

#[derive(Error, Debug)]
pub enum DArrayError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Distributed error: {0}")]
    Distributed(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Array already allocated with shape {0}")]
    AlreadyAllocated(String),

    #[error("Array not allocated: {0}")]
    NotAllocated(String),

    #[error("Reshape error: {0}")]
    Reshape(String),

    #[error("Collective mismatch on rank {rank}: {detail}")]
    CollectiveMismatch { rank: usize, detail: String },
}

pub type Result<T> = std::result::Result<T, DArrayError>;

/// Log `message` and panic with it.
///
/// Shape, volume and bounds violations corrupt the distributed layout if they
/// are tolerated, so they end the calling rank.
#[track_caller]
pub fn violation(message: String) -> ! {
    tracing::error!(target: "darray::precondition", "{}", message);
    panic!("precondition violated: {}", message);
}

/// Abort with [`violation`] unless `$cond` holds.
#[macro_export]
macro_rules! precondition {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::utils::error::violation(format!($($arg)+));
        }
    };
}
