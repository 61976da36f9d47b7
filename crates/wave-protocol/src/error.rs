use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    FramingError(String),

    #[error("unsupported frame version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// A bad payload inside an intact frame. The stream stays aligned, so
    /// the reader may drop the frame and keep going.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrame(_) | Self::Deserialization(_) | Self::UnsupportedVersion(_)
        )
    }
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
