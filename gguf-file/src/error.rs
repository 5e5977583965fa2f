//! Error type shared by the GGUF writer and reader.

use thiserror::Error;

use crate::value::GgufValueType;
use crate::writer::WriterState;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GgufError>;

/// Everything that can go wrong while producing or reading a GGUF file.
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A writer call arrived in the wrong phase (e.g. KV data before the header).
    #[error("{operation} called out of order: writer is in state {state:?}")]
    OutOfOrder {
        operation: &'static str,
        state: WriterState,
    },

    #[error("duplicate metadata key '{0}'")]
    DuplicateKey(String),

    #[error("duplicate tensor name '{0}'")]
    DuplicateTensor(String),

    #[error("tensor name must not be empty")]
    EmptyTensorName,

    #[error("metadata array '{0}' must not be empty")]
    EmptyArray(String),

    #[error("bad magic 0x{0:08x}, not a GGUF file")]
    BadMagic(u32),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("unexpected end of data while reading {0}")]
    Truncated(&'static str),

    #[error("alignment {0} is not a non-zero power of two")]
    InvalidAlignment(u32),

    #[error("nested metadata arrays are not supported (key '{0}')")]
    NestedArray(String),

    #[error("unknown metadata value type {0}")]
    UnknownValueType(u32),

    #[error("unsupported ggml tensor type {0}")]
    UnsupportedTensorType(u32),

    #[error("invalid UTF-8 in string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("missing metadata key '{0}'")]
    MissingKey(String),

    #[error("metadata key '{key}' has type {actual:?}, expected {expected:?}")]
    TypeMismatch {
        key: String,
        expected: GgufValueType,
        actual: GgufValueType,
    },

    #[error("missing tensor '{0}'")]
    MissingTensor(String),

    #[error("data for tensor '{0}' lies outside the file")]
    TensorOutOfBounds(String),
}
