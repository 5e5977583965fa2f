//! Buffered GGUF writer.
//!
//! Metadata values and every encoded tensor payload are held in memory until
//! the flush, so peak memory is roughly the size of the output file. The
//! flush runs in the three stages the format requires:
//!
//! ```text
//! write_header_to_file -> write_kv_data_to_file -> write_tensors_to_file -> close
//! ```
//!
//! Each stage checks the writer state first, so an out-of-order call fails
//! without touching the file.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use tracing::debug;

use crate::error::{GgufError, Result};
use crate::header::{RawHeader, GGUF_DEFAULT_ALIGNMENT};
use crate::keys::{GENERAL_ARCHITECTURE, TOKENIZER_TOKENS};
use crate::tensor::{align_offset, GgmlType};
use crate::value::{encode_string, GgufScalar, GgufValue};

/// Phase the writer has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Accepting metadata and tensors; nothing on disk yet.
    Empty,
    Header,
    KvData,
    Tensors,
    Closed,
}

struct PendingTensor {
    name: String,
    shape: Vec<usize>,
    ggml_type: GgmlType,
    data: Vec<u8>,
}

/// Builds a GGUF file bound to a single output path.
pub struct GgufWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    state: WriterState,
    kv: Vec<(String, GgufValue)>,
    keys: HashSet<String>,
    tensors: Vec<PendingTensor>,
    tensor_names: HashSet<String>,
    written: usize,
}

impl GgufWriter {
    /// Create a writer for `path`. `general.architecture` is recorded as the
    /// first metadata entry.
    pub fn new(path: impl Into<PathBuf>, arch: &str) -> Self {
        let mut writer = Self {
            path: path.into(),
            out: None,
            state: WriterState::Empty,
            kv: Vec::new(),
            keys: HashSet::new(),
            tensors: Vec::new(),
            tensor_names: HashSet::new(),
            written: 0,
        };
        writer.keys.insert(GENERAL_ARCHITECTURE.to_owned());
        writer.kv.push((
            GENERAL_ARCHITECTURE.to_owned(),
            GgufValue::String(arch.to_owned()),
        ));
        writer
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn kv_count(&self) -> usize {
        self.kv.len()
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    fn expect_state(&self, expected: WriterState, operation: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(GgufError::OutOfOrder {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Add an arbitrary metadata value.
    pub fn add_value(&mut self, key: &str, value: GgufValue) -> Result<()> {
        self.expect_state(WriterState::Empty, "add_value")?;
        if !self.keys.insert(key.to_owned()) {
            return Err(GgufError::DuplicateKey(key.to_owned()));
        }
        self.kv.push((key.to_owned(), value));
        Ok(())
    }

    pub fn add_uint32(&mut self, key: &str, value: u32) -> Result<()> {
        self.add_value(key, GgufValue::UInt32(value))
    }

    pub fn add_float32(&mut self, key: &str, value: f32) -> Result<()> {
        self.add_value(key, GgufValue::Float32(value))
    }

    pub fn add_bool(&mut self, key: &str, value: bool) -> Result<()> {
        self.add_value(key, GgufValue::Bool(value))
    }

    pub fn add_string(&mut self, key: &str, value: &str) -> Result<()> {
        self.add_value(key, GgufValue::String(value.to_owned()))
    }

    /// Add a homogeneous array. Empty arrays are rejected since the element
    /// type could not be checked by readers that infer it from the first item.
    pub fn add_array<T, I>(&mut self, key: &str, values: I) -> Result<()>
    where
        T: GgufScalar,
        I: IntoIterator<Item = T>,
    {
        let values: Vec<GgufValue> = values.into_iter().map(GgufScalar::into_value).collect();
        if values.is_empty() {
            return Err(GgufError::EmptyArray(key.to_owned()));
        }
        self.add_value(key, GgufValue::Array(T::VALUE_TYPE, values))
    }

    /// Store the vocabulary under `tokenizer.ggml.tokens`.
    pub fn add_token_list<S: AsRef<str>>(&mut self, tokens: &[S]) -> Result<()> {
        self.add_array(
            TOKENIZER_TOKENS,
            tokens.iter().map(|t| t.as_ref().to_owned()),
        )
    }

    /// Queue a tensor, encoded immediately as `ggml_type`.
    ///
    /// A rank-0 array is stored with a single dimension of size 1.
    pub fn add_tensor(
        &mut self,
        name: &str,
        array: &ArrayD<f32>,
        ggml_type: GgmlType,
    ) -> Result<()> {
        self.expect_state(WriterState::Empty, "add_tensor")?;
        if name.is_empty() {
            return Err(GgufError::EmptyTensorName);
        }
        if !self.tensor_names.insert(name.to_owned()) {
            return Err(GgufError::DuplicateTensor(name.to_owned()));
        }
        let mut shape = array.shape().to_vec();
        if shape.is_empty() {
            shape.push(1);
        }
        self.tensors.push(PendingTensor {
            name: name.to_owned(),
            shape,
            ggml_type,
            data: ggml_type.encode(array),
        });
        Ok(())
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        let out = self.out.as_mut().ok_or(GgufError::OutOfOrder {
            operation: "write",
            state: self.state,
        })?;
        out.write_all(bytes)?;
        self.written += bytes.len();
        Ok(())
    }

    fn pad_to_alignment(&mut self) -> Result<()> {
        let padding = align_offset(self.written, GGUF_DEFAULT_ALIGNMENT) - self.written;
        if padding > 0 {
            self.emit(&vec![0u8; padding])?;
        }
        Ok(())
    }

    /// Create the output file and write the fixed header.
    pub fn write_header_to_file(&mut self) -> Result<()> {
        self.expect_state(WriterState::Empty, "write_header_to_file")?;
        self.out = Some(BufWriter::new(File::create(&self.path)?));
        let header = RawHeader::new(self.tensors.len() as u64, self.kv.len() as u64);
        self.emit(bytemuck::bytes_of(&header))?;
        self.state = WriterState::Header;
        debug!(
            path = %self.path.display(),
            tensors = self.tensors.len(),
            kv = self.kv.len(),
            "wrote GGUF header"
        );
        Ok(())
    }

    /// Write every metadata entry in insertion order.
    pub fn write_kv_data_to_file(&mut self) -> Result<()> {
        self.expect_state(WriterState::Header, "write_kv_data_to_file")?;
        let mut buf = Vec::new();
        for (key, value) in &self.kv {
            encode_string(key, &mut buf);
            buf.extend_from_slice(&(value.value_type() as u32).to_le_bytes());
            value.encode(&mut buf);
        }
        self.emit(&buf)?;
        self.state = WriterState::KvData;
        debug!(bytes = buf.len(), "wrote GGUF metadata");
        Ok(())
    }

    /// Write tensor infos followed by the aligned tensor data section.
    pub fn write_tensors_to_file(&mut self) -> Result<()> {
        self.expect_state(WriterState::KvData, "write_tensors_to_file")?;

        let mut infos = Vec::new();
        let mut offset = 0usize;
        for tensor in &self.tensors {
            encode_string(&tensor.name, &mut infos);
            infos.extend_from_slice(&(tensor.shape.len() as u32).to_le_bytes());
            for &dim in tensor.shape.iter().rev() {
                infos.extend_from_slice(&(dim as u64).to_le_bytes());
            }
            infos.extend_from_slice(&(tensor.ggml_type as u32).to_le_bytes());
            infos.extend_from_slice(&(offset as u64).to_le_bytes());
            offset += align_offset(tensor.data.len(), GGUF_DEFAULT_ALIGNMENT);
        }
        self.emit(&infos)?;
        self.pad_to_alignment()?;

        let tensors = std::mem::take(&mut self.tensors);
        let mut data_bytes = 0usize;
        for tensor in tensors {
            self.emit(&tensor.data)?;
            self.pad_to_alignment()?;
            data_bytes += tensor.data.len();
        }
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        self.state = WriterState::Tensors;
        debug!(data_bytes, total_bytes = self.written, "wrote GGUF tensors");
        Ok(())
    }

    /// Flush and close the output file.
    pub fn close(&mut self) -> Result<()> {
        self.expect_state(WriterState::Tensors, "close")?;
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        self.state = WriterState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use tempfile::tempdir;

    fn vector(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn architecture_is_first_entry() {
        let writer = GgufWriter::new("unused.gguf", "clip");
        assert_eq!(writer.kv_count(), 1);
        assert_eq!(writer.kv[0].0, "general.architecture");
        assert_eq!(writer.kv[0].1, GgufValue::String("clip".into()));
    }

    #[test]
    fn duplicate_key_rejected() {
        let mut writer = GgufWriter::new("unused.gguf", "clip");
        writer.add_uint32("a.b", 1).unwrap();
        let err = writer.add_uint32("a.b", 2).unwrap_err();
        assert!(matches!(err, GgufError::DuplicateKey(k) if k == "a.b"));
    }

    #[test]
    fn duplicate_and_empty_tensor_names_rejected() {
        let mut writer = GgufWriter::new("unused.gguf", "clip");
        writer.add_tensor("w", &vector(&[1.0]), GgmlType::F32).unwrap();
        assert!(matches!(
            writer.add_tensor("w", &vector(&[1.0]), GgmlType::F32),
            Err(GgufError::DuplicateTensor(_))
        ));
        assert!(matches!(
            writer.add_tensor("", &vector(&[1.0]), GgmlType::F32),
            Err(GgufError::EmptyTensorName)
        ));
    }

    #[test]
    fn empty_array_rejected() {
        let mut writer = GgufWriter::new("unused.gguf", "clip");
        let err = writer.add_array::<f32, _>("m", Vec::new()).unwrap_err();
        assert!(matches!(err, GgufError::EmptyArray(_)));
    }

    #[test]
    fn stages_must_run_in_order() {
        let dir = tempdir().unwrap();
        let mut writer = GgufWriter::new(dir.path().join("o.gguf"), "clip");

        assert!(matches!(
            writer.write_kv_data_to_file(),
            Err(GgufError::OutOfOrder { state: WriterState::Empty, .. })
        ));
        assert!(matches!(
            writer.write_tensors_to_file(),
            Err(GgufError::OutOfOrder { .. })
        ));
        assert!(!dir.path().join("o.gguf").exists());

        writer.write_header_to_file().unwrap();
        assert!(matches!(
            writer.add_uint32("late", 1),
            Err(GgufError::OutOfOrder { state: WriterState::Header, .. })
        ));
        assert!(matches!(
            writer.write_header_to_file(),
            Err(GgufError::OutOfOrder { .. })
        ));
        writer.write_kv_data_to_file().unwrap();
        writer.write_tensors_to_file().unwrap();
        writer.close().unwrap();
        assert_eq!(writer.state(), WriterState::Closed);
    }

    #[test]
    fn scalar_tensor_gets_one_dimension() {
        let mut writer = GgufWriter::new("unused.gguf", "clip");
        let scalar = ArrayD::from_shape_vec(IxDyn(&[]), vec![3.0f32]).unwrap();
        writer.add_tensor("s", &scalar, GgmlType::F32).unwrap();
        assert_eq!(writer.tensors[0].shape, vec![1]);
    }
}
