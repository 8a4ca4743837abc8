use core::fmt;

use crate::types::{PixelFormat, Size};

/// Platform-specific error details.
///
/// Native error objects (e.g. `NSError`) are rendered to text at the boundary
/// so errors can travel to the UI context from any thread.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PlatformError {
    Message(String),
    /// An `OSStatus` / `CVReturn` code.
    Status(i32),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => f.write_str(msg),
            Self::Status(code) => write!(f, "status {code}"),
        }
    }
}

impl core::error::Error for PlatformError {}

/// Top-level crate error.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A seek target that is negative, non-finite or unrepresentable.
    TimeInvalid,
    UnsupportedFormat,
    PoolCreation,
    ContextUnavailable,
    TextureCache,
    ProgramCreation(String),
    TextureBinding,
    DimensionMismatch {
        expected: Size,
        actual: Size,
    },
    PixelFormatMismatch {
        expected: PixelFormat,
        actual: PixelFormat,
    },
    /// `render` was called on a filter stage that was never prepared.
    NotPrepared,
    AssetUnplayable,
    KeyLoadFailed {
        key: String,
        reason: String,
    },
    Decode(String),
    Platform(PlatformError),
}

impl Error {
    /// Setup-time failures that retrying per frame would not fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedFormat
                | Self::PoolCreation
                | Self::ContextUnavailable
                | Self::TextureCache
                | Self::ProgramCreation(_)
                | Self::DimensionMismatch { .. }
                | Self::PixelFormatMismatch { .. }
                | Self::NotPrepared
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimeInvalid => f.write_str("time is not valid"),
            Self::UnsupportedFormat => f.write_str("unsupported pixel format"),
            Self::PoolCreation => f.write_str("could not create pixel buffer pool"),
            Self::ContextUnavailable => f.write_str("render context unavailable"),
            Self::TextureCache => f.write_str("could not create texture cache"),
            Self::ProgramCreation(name) => write!(f, "could not create program for filter {name:?}"),
            Self::TextureBinding => f.write_str("could not bind pixel buffer as texture"),
            Self::DimensionMismatch { expected, actual } => write!(
                f,
                "invalid pixel buffer dimensions: expected {}x{}, got {}x{}",
                expected.width, expected.height, actual.width, actual.height
            ),
            Self::PixelFormatMismatch { expected, actual } => write!(
                f,
                "invalid pixel buffer format: expected {expected:?}, got {actual:?}"
            ),
            Self::NotPrepared => f.write_str("filter stage used before prepare"),
            Self::AssetUnplayable => f.write_str("asset is not playable"),
            Self::KeyLoadFailed { key, reason } => {
                write!(f, "loading asset key {key:?} failed: {reason}")
            }
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::Platform(e) => write!(f, "platform error: {e}"),
        }
    }
}

impl core::error::Error for Error {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::Platform(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PlatformError> for Error {
    fn from(e: PlatformError) -> Self {
        Self::Platform(e)
    }
}

/// A pool has handed out every buffer it may allocate.
///
/// Transient: the caller drops the frame and carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolExhausted;

impl fmt::Display for PoolExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pixel buffer pool would exceed its allocation threshold")
    }
}

impl core::error::Error for PoolExhausted {}
