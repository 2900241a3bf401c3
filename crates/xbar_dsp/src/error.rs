//! DSP Error Types

use thiserror::Error;

/// Errors that can occur in the DSP components
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DspError {
    #[error("Invalid filter parameters: {0}")]
    InvalidFilterParams(String),

    #[error("Channel index {0} exceeds bundle width")]
    InvalidChannel(u32),

    #[error("Invalid ramp gradient: {0} dB/frame (must be 0.01..=6.0)")]
    InvalidRampGradient(f32),

    #[error("Unknown pin: {0}")]
    UnknownPin(String),

    #[error("Missing command property: {0}")]
    MissingProperty(&'static str),

    #[error("Property {0} has wrong type")]
    WrongPropertyType(&'static str),

    #[error("Unknown command id: {0}")]
    UnknownCommand(i32),

    #[error("Ramp time {0} ms out of range (1..=10000)")]
    InvalidRampTime(i32),

    #[error("Unsupported ramp shape: {0}")]
    InvalidRampShape(i32),

    #[error("Value out of range: {0}")]
    OutOfRange(String),
}

/// Result type alias for DSP operations
pub type DspResult<T> = Result<T, DspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DspError::InvalidChannel(7);
        assert!(err.to_string().contains('7'));

        let err = DspError::InvalidRampTime(20000);
        assert!(err.to_string().contains("20000"));
    }
}
