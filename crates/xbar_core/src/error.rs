//! Engine Error Types

use thiserror::Error;

/// Sub-kind of an ALSA device error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlsaErrorKind {
    /// Buffer over-/underrun (EPIPE).
    Xrun,
    /// Device suspended (ESTRPIPE).
    Suspend,
    /// Any other device error.
    Other,
}

/// Errors that can occur on the engine core paths.
///
/// All results are value-returned; the real-time path never panics.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum XbarError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Component not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("ALSA device error ({0:?})")]
    Alsa(AlsaErrorKind),

    #[error("Timeout")]
    Timeout,

    #[error("Ring buffer error: {0}")]
    RingBuffer(String),

    #[error("Operation failed: {0}")]
    Failed(String),
}

impl XbarError {
    pub fn invalid_param(msg: impl Into<String>) -> Self {
        XbarError::InvalidParam(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        XbarError::Failed(msg.into())
    }

    /// True for the ALSA error kinds that make a sink device unrecoverable
    /// from the routing zone's point of view.
    pub fn is_device_error(&self) -> bool {
        matches!(self, XbarError::Alsa(_) | XbarError::RingBuffer(_))
    }
}

/// Result type alias for engine operations
pub type XbarResult<T> = Result<T, XbarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = XbarError::invalid_param("period size must not be 0");
        assert!(err.to_string().contains("period size"));

        let err = XbarError::Alsa(AlsaErrorKind::Xrun);
        assert!(err.to_string().contains("Xrun"));
    }

    #[test]
    fn test_device_error_classification() {
        assert!(XbarError::Alsa(AlsaErrorKind::Suspend).is_device_error());
        assert!(XbarError::RingBuffer("broken".into()).is_device_error());
        assert!(!XbarError::Timeout.is_device_error());
    }
}
