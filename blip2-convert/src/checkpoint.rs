//! Safetensors checkpoint loading.
//!
//! Shards are memory-mapped and their headers parsed once. Tensors are
//! decoded to f32 one at a time on demand; the caller decides what to keep.

use anyhow::{bail, Context, Result};
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use ndarray::{ArrayD, Axis, IxDyn};
use safetensors::{Dtype, SafeTensors};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::read_json;

pub const SINGLE_FILE: &str = "model.safetensors";
pub const INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Location and layout of one tensor inside a shard.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    shard: usize,
    range: Range<usize>,
}

struct Shard {
    path: PathBuf,
    mmap: Mmap,
}

/// All tensors of a model directory, in checkpoint order.
///
/// Order is shard by shard (shards sorted by file name), and within a shard by
/// data offset, which is the order the tensors were serialized in.
pub struct Checkpoint {
    shards: Vec<Shard>,
    entries: Vec<TensorEntry>,
}

impl Checkpoint {
    /// Discover and map the weight files in `model_dir`.
    pub fn open(model_dir: &Path) -> Result<Self> {
        let files = resolve_shards(model_dir)?;
        let mut shards = Vec::with_capacity(files.len());
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for (index, path) in files.into_iter().enumerate() {
            let file =
                File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
            // SAFETY: read-only mapping of a checkpoint nobody writes during conversion.
            let mmap = unsafe { MmapOptions::new().map(&file) }
                .with_context(|| format!("failed to map {}", path.display()))?;
            let mut shard_entries = read_entries(&mmap, index)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            shard_entries.sort_by(|a, b| (a.range.start, &a.name).cmp(&(b.range.start, &b.name)));
            for entry in &shard_entries {
                if !seen.insert(entry.name.clone()) {
                    bail!(
                        "tensor {} appears in more than one shard (again in {})",
                        entry.name,
                        path.display()
                    );
                }
            }
            debug!(shard = %path.display(), tensors = shard_entries.len(), "mapped shard");
            entries.extend(shard_entries);
            shards.push(Shard { path, mmap });
        }

        let checkpoint = Self { shards, entries };
        if checkpoint.is_empty() {
            bail!("no tensors found in {}", model_dir.display());
        }

        info!(
            "loaded {} tensors from {} shard(s) in {}",
            checkpoint.len(),
            checkpoint.shards.len(),
            model_dir.display()
        );
        Ok(checkpoint)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    /// Expose the data of `source` a second time under `alias`, appended
    /// after every other tensor. Used for tied weights that were
    /// deduplicated when the checkpoint was saved.
    pub fn add_alias(&mut self, alias: &str, source: &str) -> Result<()> {
        if self.contains(alias) {
            bail!("cannot alias {source} as {alias}: {alias} already exists");
        }
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == source)
            .with_context(|| format!("cannot alias missing tensor {source}"))?;
        let alias_entry = TensorEntry {
            name: alias.to_owned(),
            ..entry.clone()
        };
        self.entries.push(alias_entry);
        Ok(())
    }

    /// Decode every tensor in checkpoint order.
    pub fn tensors(&self) -> impl Iterator<Item = Result<(&str, ArrayD<f32>)>> + '_ {
        self.entries
            .iter()
            .map(move |entry| self.load(entry).map(|array| (entry.name.as_str(), array)))
    }

    /// Decode `entry` into an f32 array with its stored shape.
    pub fn load(&self, entry: &TensorEntry) -> Result<ArrayD<f32>> {
        let shard = &self.shards[entry.shard];
        let bytes = shard.mmap.get(entry.range.clone()).with_context(|| {
            format!(
                "tensor {} extends past the end of {}",
                entry.name,
                shard.path.display()
            )
        })?;
        let values = decode(entry.dtype, bytes).with_context(|| format!("tensor {}", entry.name))?;
        ArrayD::from_shape_vec(IxDyn(&entry.shape), values)
            .with_context(|| {
                format!(
                    "tensor {} has inconsistent shape {:?}",
                    entry.name, entry.shape
                )
            })
    }
}

fn read_entries(buffer: &[u8], shard: usize) -> Result<Vec<TensorEntry>> {
    let (header_len, metadata) = SafeTensors::read_metadata(buffer)?;
    let data_start = 8 + header_len;
    let entries = metadata
        .tensors()
        .into_iter()
        .map(|(name, info)| {
            let (begin, end) = info.data_offsets;
            TensorEntry {
                name,
                dtype: info.dtype,
                shape: info.shape.clone(),
                shard,
                range: data_start + begin..data_start + end,
            }
        })
        .collect();
    Ok(entries)
}

/// Find the weight files for `dir`: a single file, an index with shards, or
/// bare `model-*.safetensors` shards.
pub fn resolve_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("model directory {} does not exist", dir.display());
    }

    let single = dir.join(SINGLE_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }

    let index_path = dir.join(INDEX_FILE);
    if index_path.is_file() {
        let index: ShardIndex = read_json(&index_path)?;
        if index.weight_map.is_empty() {
            bail!("{} has an empty weight_map", index_path.display());
        }
        let names: BTreeSet<String> = index.weight_map.into_values().collect();
        let mut files = Vec::with_capacity(names.len());
        for name in names {
            let path = dir.join(&name);
            if !path.is_file() {
                bail!(
                    "shard {} referenced by {} does not exist",
                    path.display(),
                    index_path.display()
                );
            }
            files.push(path);
        }
        return Ok(files);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with("model-") && name.ends_with(".safetensors") && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    if files.is_empty() {
        bail!(
            "no {SINGLE_FILE}, {INDEX_FILE} or model-*.safetensors found in {}",
            dir.display()
        );
    }
    Ok(files)
}

/// Widen raw little-endian tensor bytes to f32.
pub fn decode(dtype: Dtype, bytes: &[u8]) -> Result<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Dtype::F64 => bytes
            .chunks_exact(8)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                f64::from_le_bytes(raw) as f32
            })
            .collect(),
        other => bail!("unsupported dtype {other:?}, only floating point tensors can be converted"),
    };
    Ok(values)
}

/// Drop every axis of length 1. A tensor of only unit axes becomes rank 0.
pub fn squeeze<A>(mut array: ArrayD<A>) -> ArrayD<A> {
    for axis in (0..array.ndim()).rev() {
        if array.shape()[axis] == 1 {
            array = array.index_axis_move(Axis(axis), 0);
        }
    }
    array
}
