use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Cinder errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Persisted data failed validation: bad footer magic, an unsorted or
    /// duplicated table index, a count mismatch, or a payload whose hash does
    /// not match the requested address. Fatal for the affected table.
    Corruption(String),
    /// An IO error, surfaced verbatim. Retry policy belongs to the caller.
    IO(String),
    /// The manifest was written by an incompatible storage version.
    VersionMismatch { expected: String, actual: String },
    /// The store has been closed. No further operations are possible.
    Closed,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::VersionMismatch { expected, actual } => {
                write!(f, "storage version mismatch: expected {expected}, found {actual}")
            }
            Error::Closed => write!(f, "store is closed"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// A cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        Error::IO(err.to_string())
    }
}
