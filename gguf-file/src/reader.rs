//! Memory-mapped GGUF reader.
//!
//! Parses the header, metadata and tensor infos up front. Tensor payloads stay
//! in the mapping and are handed out as byte slices.

use std::fs::File;
use std::ops::{Deref, Range};
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::error::{GgufError, Result};
use crate::header::{RawHeader, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC};
use crate::keys::GENERAL_ALIGNMENT;
use crate::tensor::{align_offset, GgmlType, TensorInfo};
use crate::value::{GgufValue, GgufValueType};

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Backing::Mapped(m) => &m[..],
            Backing::Owned(v) => &v[..],
        }
    }
}

/// A parsed GGUF file.
pub struct GgufFile {
    bytes: Backing,
    version: u32,
    metadata: Vec<(String, GgufValue)>,
    tensors: Vec<TensorInfo>,
    data_offset: usize,
}

impl GgufFile {
    /// Map `path` read-only and parse it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the mapping is read-only and the file is not modified while mapped.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Self::parse(Backing::Mapped(mmap))
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::parse(Backing::Owned(bytes))
    }

    fn parse(bytes: Backing) -> Result<Self> {
        let (version, metadata, tensors, data_offset) = {
            let mut cur = ByteCursor::new(&bytes);
            let header: RawHeader =
                bytemuck::pod_read_unaligned(cur.take(RawHeader::SIZE, "header")?);
            if header.magic != GGUF_MAGIC {
                return Err(GgufError::BadMagic(header.magic));
            }
            if !(2..=3).contains(&header.version) {
                return Err(GgufError::UnsupportedVersion(header.version));
            }

            let mut metadata = Vec::with_capacity(cur.bounded_capacity(header.kv_count));
            for _ in 0..header.kv_count {
                let key = cur.read_string()?;
                let value_type = GgufValueType::from_u32(cur.read_u32()?)?;
                let value = cur.read_value(value_type).map_err(|err| match err {
                    GgufError::NestedArray(_) => GgufError::NestedArray(key.clone()),
                    other => other,
                })?;
                metadata.push((key, value));
            }

            let mut tensors = Vec::with_capacity(cur.bounded_capacity(header.tensor_count));
            for _ in 0..header.tensor_count {
                let name = cur.read_string()?;
                let n_dims = cur.read_u32()? as usize;
                let mut shape = Vec::with_capacity(n_dims.min(8));
                for _ in 0..n_dims {
                    shape.push(cur.read_u64()? as usize);
                }
                shape.reverse();
                let ggml_type = GgmlType::from_u32(cur.read_u32()?)?;
                let offset = cur.read_u64()?;
                tensors.push(TensorInfo {
                    name,
                    shape,
                    ggml_type,
                    offset,
                });
            }

            let alignment = match metadata
                .iter()
                .find(|(k, _)| k == GENERAL_ALIGNMENT)
                .and_then(|(_, v)| v.as_u32())
            {
                Some(a) if !a.is_power_of_two() => {
                    return Err(GgufError::InvalidAlignment(a))
                }
                Some(a) => a as usize,
                None => GGUF_DEFAULT_ALIGNMENT,
            };
            let data_offset = align_offset(cur.pos, alignment);
            for info in &tensors {
                if payload_range(data_offset, info)?.end > cur.buf.len() {
                    return Err(GgufError::TensorOutOfBounds(info.name.clone()));
                }
            }
            (header.version, metadata, tensors, data_offset)
        };

        Ok(Self {
            bytes,
            version,
            metadata,
            tensors,
            data_offset,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Metadata entries in file order.
    pub fn metadata(&self) -> &[(String, GgufValue)] {
        &self.metadata
    }

    /// Tensor infos in file order.
    pub fn tensors(&self) -> &[TensorInfo] {
        &self.tensors
    }

    /// Absolute file offset of the tensor data section.
    pub fn data_offset(&self) -> usize {
        self.data_offset
    }

    pub fn get(&self, key: &str) -> Option<&GgufValue> {
        self.metadata
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn require(&self, key: &str, expected: GgufValueType) -> Result<&GgufValue> {
        let value = self
            .get(key)
            .ok_or_else(|| GgufError::MissingKey(key.to_owned()))?;
        if value.value_type() != expected {
            return Err(GgufError::TypeMismatch {
                key: key.to_owned(),
                expected,
                actual: value.value_type(),
            });
        }
        Ok(value)
    }

    pub fn get_u32(&self, key: &str) -> Result<u32> {
        let value = self.require(key, GgufValueType::UInt32)?;
        Ok(value.as_u32().unwrap_or_default())
    }

    pub fn get_f32(&self, key: &str) -> Result<f32> {
        let value = self.require(key, GgufValueType::Float32)?;
        Ok(value.as_f32().unwrap_or_default())
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        let value = self.require(key, GgufValueType::Bool)?;
        Ok(value.as_bool().unwrap_or_default())
    }

    pub fn get_str(&self, key: &str) -> Result<&str> {
        let value = self.require(key, GgufValueType::String)?;
        Ok(value.as_str().unwrap_or_default())
    }

    pub fn get_array(&self, key: &str) -> Result<&[GgufValue]> {
        let value = self.require(key, GgufValueType::Array)?;
        Ok(value.as_array().unwrap_or_default())
    }

    pub fn tensor(&self, name: &str) -> Result<&TensorInfo> {
        self.tensors
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| GgufError::MissingTensor(name.to_owned()))
    }

    /// Raw payload bytes of `name`.
    pub fn tensor_data(&self, name: &str) -> Result<&[u8]> {
        let info = self.tensor(name)?;
        self.bytes
            .get(payload_range(self.data_offset, info)?)
            .ok_or_else(|| GgufError::TensorOutOfBounds(name.to_owned()))
    }

    /// Sum of all tensor payload sizes, excluding padding.
    pub fn total_tensor_bytes(&self) -> Result<usize> {
        self.tensors.iter().try_fold(0usize, |total, info| {
            info.n_bytes()
                .and_then(|n| total.checked_add(n))
                .ok_or_else(|| GgufError::TensorOutOfBounds(info.name.clone()))
        })
    }
}

/// Absolute byte range of a tensor payload, or an error if it overflows.
fn payload_range(data_offset: usize, info: &TensorInfo) -> Result<Range<usize>> {
    let out_of_bounds = || GgufError::TensorOutOfBounds(info.name.clone());
    let start = usize::try_from(info.offset)
        .ok()
        .and_then(|offset| data_offset.checked_add(offset))
        .ok_or_else(out_of_bounds)?;
    let end = info
        .n_bytes()
        .and_then(|n| start.checked_add(n))
        .ok_or_else(out_of_bounds)?;
    Ok(start..end)
}

struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(GgufError::Truncated(what))?;
        let slice = self.buf.get(self.pos..end).ok_or(GgufError::Truncated(what))?;
        self.pos = end;
        Ok(slice)
    }

    /// Never preallocate more entries than there are bytes left.
    fn bounded_capacity(&self, count: u64) -> usize {
        (count as usize).min(self.buf.len() - self.pos)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2, "u16")?.try_into().unwrap_or_default()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4, "u32")?.try_into().unwrap_or_default()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8, "u64")?.try_into().unwrap_or_default()))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u64()?;
        let len = usize::try_from(len).map_err(|_| GgufError::Truncated("string"))?;
        let bytes = self.take(len, "string")?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn read_value(&mut self, value_type: GgufValueType) -> Result<GgufValue> {
        Ok(match value_type {
            GgufValueType::UInt8 => GgufValue::UInt8(self.read_u8()?),
            GgufValueType::Int8 => GgufValue::Int8(self.read_u8()? as i8),
            GgufValueType::UInt16 => GgufValue::UInt16(self.read_u16()?),
            GgufValueType::Int16 => GgufValue::Int16(self.read_u16()? as i16),
            GgufValueType::UInt32 => GgufValue::UInt32(self.read_u32()?),
            GgufValueType::Int32 => GgufValue::Int32(self.read_u32()? as i32),
            GgufValueType::Float32 => GgufValue::Float32(f32::from_bits(self.read_u32()?)),
            GgufValueType::Bool => GgufValue::Bool(self.read_u8()? != 0),
            GgufValueType::String => GgufValue::String(self.read_string()?),
            GgufValueType::Array => {
                let elem_type = GgufValueType::from_u32(self.read_u32()?)?;
                if elem_type == GgufValueType::Array {
                    return Err(GgufError::NestedArray(String::new()));
                }
                let count = self.read_u64()?;
                let mut values = Vec::with_capacity(self.bounded_capacity(count));
                for _ in 0..count {
                    values.push(self.read_value(elem_type)?);
                }
                GgufValue::Array(elem_type, values)
            }
            GgufValueType::UInt64 => GgufValue::UInt64(self.read_u64()?),
            GgufValueType::Int64 => GgufValue::Int64(self.read_u64()? as i64),
            GgufValueType::Float64 => GgufValue::Float64(f64::from_bits(self.read_u64()?)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = vec![0u8; RawHeader::SIZE];
        bytes[..4].copy_from_slice(b"GGML");
        assert!(matches!(
            GgufFile::from_bytes(bytes),
            Err(GgufError::BadMagic(_))
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let header = RawHeader {
            version: 1,
            ..RawHeader::new(0, 0)
        };
        let bytes = bytemuck::bytes_of(&header).to_vec();
        assert!(matches!(
            GgufFile::from_bytes(bytes),
            Err(GgufError::UnsupportedVersion(1))
        ));
    }

    #[test]
    fn truncated_metadata_is_an_error() {
        let header = RawHeader::new(0, 1);
        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        bytes.extend_from_slice(&100u64.to_le_bytes());
        bytes.extend_from_slice(b"short");
        assert!(matches!(
            GgufFile::from_bytes(bytes),
            Err(GgufError::Truncated("string"))
        ));
    }

    #[test]
    fn huge_counts_do_not_preallocate() {
        let header = RawHeader::new(u64::MAX, 0);
        let bytes = bytemuck::bytes_of(&header).to_vec();
        assert!(matches!(
            GgufFile::from_bytes(bytes),
            Err(GgufError::Truncated(_))
        ));
    }

    #[test]
    fn typed_lookup_reports_mismatch() {
        let header = RawHeader::new(0, 1);
        let mut bytes = bytemuck::bytes_of(&header).to_vec();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(b"k");
        bytes.extend_from_slice(&(GgufValueType::Bool as u32).to_le_bytes());
        bytes.push(1);
        let file = GgufFile::from_bytes(bytes).unwrap();
        assert!(file.get_bool("k").unwrap());
        assert!(matches!(
            file.get_u32("k"),
            Err(GgufError::TypeMismatch { .. })
        ));
        assert!(matches!(file.get_u32("nope"), Err(GgufError::MissingKey(_))));
    }

    fn with_kv(tensor_count: u64, key: &str, value: &GgufValue) -> Vec<u8> {
        let mut bytes = bytemuck::bytes_of(&RawHeader::new(tensor_count, 1)).to_vec();
        crate::value::encode_string(key, &mut bytes);
        bytes.extend_from_slice(&(value.value_type() as u32).to_le_bytes());
        value.encode(&mut bytes);
        bytes
    }

    #[test]
    fn zero_or_odd_alignment_is_rejected() {
        for alignment in [0, 3, 48] {
            let bytes = with_kv(0, GENERAL_ALIGNMENT, &GgufValue::UInt32(alignment));
            assert!(matches!(
                GgufFile::from_bytes(bytes),
                Err(GgufError::InvalidAlignment(a)) if a == alignment
            ));
        }
        let bytes = with_kv(0, GENERAL_ALIGNMENT, &GgufValue::UInt32(64));
        assert!(GgufFile::from_bytes(bytes).is_ok());
    }

    #[test]
    fn overflowing_dims_are_out_of_bounds() {
        let mut bytes = with_kv(1, "k", &GgufValue::Bool(true));
        crate::value::encode_string("t", &mut bytes);
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        bytes.extend_from_slice(&(GgmlType::F32 as u32).to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            GgufFile::from_bytes(bytes),
            Err(GgufError::TensorOutOfBounds(name)) if name == "t"
        ));
    }

    #[test]
    fn payload_past_end_of_file_is_rejected() {
        let mut bytes = with_kv(1, "k", &GgufValue::Bool(true));
        crate::value::encode_string("t", &mut bytes);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&4u64.to_le_bytes());
        bytes.extend_from_slice(&(GgmlType::F32 as u32).to_le_bytes());
        bytes.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            GgufFile::from_bytes(bytes),
            Err(GgufError::TensorOutOfBounds(_))
        ));
    }

    #[test]
    fn nested_arrays_are_rejected() {
        let inner = GgufValue::Array(GgufValueType::UInt8, vec![GgufValue::UInt8(1)]);
        let outer = GgufValue::Array(GgufValueType::Array, vec![inner]);
        let bytes = with_kv(0, "nested", &outer);
        assert!(matches!(
            GgufFile::from_bytes(bytes),
            Err(GgufError::NestedArray(key)) if key == "nested"
        ));
    }
}
