use thiserror::Error;

/// Error kinds surfaced by the runtime core.
///
/// Every fallible operation in the serving crate reports one of these
/// kinds. Allocator misuse (double free, unknown id) is a programming
/// error and surfaces as `InvalidArgument` rather than being silently
/// corrected; configuration errors are fatal at startup.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("configuration unreadable: {0}")]
    SegmentFault(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("backpressure: {0}")]
    Backpressure(String),
    #[error("terminated: {0}")]
    Terminated(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl CoreError {
    /// Stable numeric code reported to clients. `Terminated` and
    /// `OutOfMemory` carry distinct codes.
    pub fn code(&self) -> u32 {
        match self {
            CoreError::InvalidArgument(_) => 1,
            CoreError::SegmentFault(_) => 2,
            CoreError::OutOfMemory(_) => 3,
            CoreError::Timeout(_) => 4,
            CoreError::Backpressure(_) => 5,
            CoreError::Terminated(_) => 6,
            CoreError::Runtime(_) => 7,
            CoreError::Unknown(_) => 255,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
