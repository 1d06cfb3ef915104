// Frame codec error types

use crate::error::ErrorCode;
use std::fmt;

/// Codec error code constants
///
/// Error code range: 3001-3002
pub struct CodecErrorCodes {}

impl CodecErrorCodes {
    pub const TOO_MANY_CHANNELS: i32 = 3001;
    pub const BUFFER_TOO_SMALL: i32 = 3002;
}

/// Errors raised by the interleave/deinterleave routines.
///
/// These never allocate, so they are safe to produce on the realtime thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Channel count is zero or exceeds `MAX_CHANNELS`
    TooManyChannels { channels: usize },

    /// A buffer cannot hold `needed` samples
    BufferTooSmall { needed: usize, available: usize },
}

impl ErrorCode for CodecError {
    fn code(&self) -> i32 {
        match self {
            CodecError::TooManyChannels { .. } => CodecErrorCodes::TOO_MANY_CHANNELS,
            CodecError::BufferTooSmall { .. } => CodecErrorCodes::BUFFER_TOO_SMALL,
        }
    }

    fn message(&self) -> String {
        match self {
            CodecError::TooManyChannels { channels } => {
                format!("Unsupported channel count {}", channels)
            }
            CodecError::BufferTooSmall { needed, available } => {
                format!("Buffer holds {} samples, {} needed", available, needed)
            }
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecError (code {}): {}", self.code(), self.message())
    }
}

impl std::error::Error for CodecError {}
