use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("invalid frame")]
    InvalidFrame,
    #[error("conversation mismatch: expected {expected}, got {got}")]
    ConversationMismatch { expected: u32, got: u32 },
    #[error("truncated segment")]
    Truncated,
    #[error("message of {0} bytes does not fit in one segment")]
    TooLarge(usize),
    #[error("segment retry ceiling exceeded")]
    Failed,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
