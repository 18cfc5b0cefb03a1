//! Error type shared by the bindings and every engine implementation.

use std::ffi::NulError;
use std::path::PathBuf;

use thiserror::Error;

use crate::shape::Shape;

/// Result alias used throughout the bindings.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An engine call returned a failure code. `message` is the engine's own
    /// last-error text, passed through unchanged.
    #[error("{call} failed: {message}")]
    Engine { call: &'static str, message: String },
    #[error("string passed to the engine contains an interior nul byte: {0}")]
    Nul(#[from] NulError),
    /// Handles from one engine instance were handed to another.
    #[error("handles belong to different engine instances")]
    EngineMismatch,
    #[error("failed to load engine library {}: {message}", path.display())]
    Library { path: PathBuf, message: String },
    #[error("{call} returned a string that is not valid utf-8")]
    Utf8 { call: &'static str },
    /// Host-side arithmetic over two arrays whose shapes disagree.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: Shape, actual: Shape },
}

impl Error {
    pub fn engine(call: &'static str, message: impl Into<String>) -> Self {
        Error::Engine {
            call,
            message: message.into(),
        }
    }

    /// Name of the engine call that failed, if this is an engine error.
    pub fn call(&self) -> Option<&'static str> {
        match self {
            Error::Engine { call, .. } | Error::Utf8 { call } => Some(call),
            _ => None,
        }
    }
}
