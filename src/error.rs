//! Error types shared across the crate.

use thiserror::Error;

use crate::transform::TransformKind;

/// Errors surfaced by device queries, stream control and transforms.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or missing required configuration or operation parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A named device is absent among the probed devices
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A reused transform state does not match the requested operation
    #[error("state type mismatch: expected {expected} state, found {found}")]
    TypeMismatch {
        expected: TransformKind,
        found: TransformKind,
    },

    /// A stream is already open on this engine
    #[error("stream already open")]
    AlreadyOpen,

    /// The underlying audio or codec backend reported a failure
    #[error("audio backend error: {0}")]
    Backend(String),
}

impl From<alsa::Error> for Error {
    fn from(e: alsa::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
