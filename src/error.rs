// ============================================================================
// ENGINE ERRORS — one taxonomy shared by every component
// ============================================================================

use thiserror::Error;

/// Every failure the engine can report.  Nothing is swallowed: each fallible
/// operation returns one of these to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation not valid for the current model state
    /// (undo with an empty stack, merge with nothing visible, …).
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Unknown layer id, region outside the buffer, bad parameter value.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// Unrecognized blend mode or filter kind.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A canvas or filter buffer could not be allocated.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// A preview job was superseded before it finished.
    #[error("cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] image::ImageError),
    /// Corrupt or incompatible project file.
    #[error("project file error: {0}")]
    Format(String),
}

/// Copyable tag for an [`EngineError`], used for CLI exit messages and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    OutOfRange,
    Unsupported,
    ResourceExhausted,
    Cancelled,
    Io,
    Codec,
    Format,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::OutOfRange => "OutOfRange",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Io => "Io",
            ErrorKind::Codec => "Codec",
            ErrorKind::Format => "Format",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidState(_) => ErrorKind::InvalidState,
            EngineError::OutOfRange(_) => ErrorKind::OutOfRange,
            EngineError::Unsupported(_) => ErrorKind::Unsupported,
            EngineError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Codec(_) => ErrorKind::Codec,
            EngineError::Format(_) => ErrorKind::Format,
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

impl From<Box<bincode::ErrorKind>> for EngineError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        EngineError::Format(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(EngineError::invalid_state("x").kind(), ErrorKind::InvalidState);
        assert_eq!(EngineError::out_of_range("x").kind(), ErrorKind::OutOfRange);
        assert_eq!(EngineError::unsupported("x").kind(), ErrorKind::Unsupported);
        assert_eq!(EngineError::Cancelled.kind(), ErrorKind::Cancelled);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(EngineError::from(io).kind(), ErrorKind::Io);
    }

    #[test]
    fn display_carries_message() {
        let e = EngineError::out_of_range("layer 7 not found");
        assert_eq!(e.to_string(), "out of range: layer 7 not found");
        assert_eq!(e.kind().to_string(), "OutOfRange");
    }
}
