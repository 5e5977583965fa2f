//! GGUF container support: a three-stage writer and a memory-mapped reader.
//!
//! The writer mirrors the usual GGUF tooling API (`add_uint32`, `add_array`,
//! `add_tensor`, ... followed by header, KV and tensor flushes). The reader
//! is used to verify produced files.

#[cfg(not(target_endian = "little"))]
compile_error!(
    "gguf-file writes tensor payloads by casting host memory and requires a little-endian target"
);

pub mod error;
pub mod header;
pub mod keys;
pub mod reader;
pub mod tensor;
pub mod value;
pub mod writer;

pub use error::{GgufError, Result};
pub use reader::GgufFile;
pub use tensor::{GgmlType, TensorInfo};
pub use value::{GgufScalar, GgufValue, GgufValueType};
pub use writer::{GgufWriter, WriterState};
