//! A miniature BLIP-2 model directory for end-to-end tests.

#![allow(dead_code)]

use half::{bf16, f16};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;

pub const HIDDEN: usize = 8;
pub const QUERY_TOKENS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredAs {
    F32,
    F16,
    BF16,
    I64,
}

impl StoredAs {
    fn tag(self) -> &'static str {
        match self {
            Self::F32 => "F32",
            Self::F16 => "F16",
            Self::BF16 => "BF16",
            Self::I64 => "I64",
        }
    }

    fn encode(self, values: &[f32]) -> Vec<u8> {
        match self {
            Self::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            Self::F16 => values
                .iter()
                .flat_map(|v| f16::from_f32(*v).to_le_bytes())
                .collect(),
            Self::BF16 => values
                .iter()
                .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
                .collect(),
            Self::I64 => values
                .iter()
                .flat_map(|v| (*v as i64).to_le_bytes())
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FixtureTensor {
    pub name: String,
    pub stored_as: StoredAs,
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl FixtureTensor {
    /// Values are small multiples of 0.5 so they survive f16 and bf16 exactly.
    pub fn new(name: &str, stored_as: StoredAs, shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        let seed = name.len();
        let values = (0..n)
            .map(|i| ((i + seed) % 16) as f32 * 0.5 - 4.0)
            .collect();
        Self {
            name: name.to_owned(),
            stored_as,
            shape: shape.to_vec(),
            values,
        }
    }

    /// Shape after dropping unit axes.
    pub fn squeezed(&self) -> Vec<usize> {
        self.shape.iter().copied().filter(|&d| d != 1).collect()
    }
}

/// Write `tensors` to a safetensors file, payloads in slice order.
pub fn write_safetensors(path: &Path, tensors: &[FixtureTensor]) {
    let mut header = Map::new();
    header.insert("__metadata__".to_owned(), json!({ "format": "pt" }));
    let mut data = Vec::new();
    for t in tensors {
        let bytes = t.stored_as.encode(&t.values);
        let start = data.len();
        data.extend_from_slice(&bytes);
        header.insert(
            t.name.clone(),
            json!({
                "dtype": t.stored_as.tag(),
                "shape": t.shape,
                "data_offsets": [start, data.len()],
            }),
        );
    }
    let header = serde_json::to_vec(&Value::Object(header)).unwrap();
    let mut out = Vec::with_capacity(8 + header.len() + data.len());
    out.extend_from_slice(&(header.len() as u64).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&data);
    fs::write(path, out).unwrap();
}

pub fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
}

pub fn blip2_config() -> Value {
    json!({
        "model_type": "blip-2",
        "num_query_tokens": QUERY_TOKENS,
        "vision_config": {
            "image_size": 224,
            "patch_size": 14,
            "hidden_size": HIDDEN,
            "intermediate_size": 16,
            "projection_dim": 512,
            "num_attention_heads": 2,
            "layer_norm_eps": 1e-6,
            "num_hidden_layers": 1,
            "hidden_act": "gelu"
        },
        "qformer_config": {
            "cross_attention_frequency": 2,
            "encoder_hidden_size": HIDDEN,
            "hidden_size": 768,
            "intermediate_size": 3072,
            "layer_norm_eps": 1e-12,
            "max_position_embeddings": 512,
            "num_attention_heads": 12,
            "num_hidden_layers": 12,
            "hidden_act": "gelu_new"
        },
        "text_config": {
            "max_position_embeddings": 2048,
            "hidden_size": 2560,
            "word_embed_proj_dim": 2560,
            "num_attention_heads": 32,
            "num_hidden_layers": 32
        }
    })
}

pub fn preprocessor_config() -> Value {
    json!({
        "do_normalize": true,
        "image_mean": [0.5, 0.25, 0.125],
        "image_std": [0.25, 0.5, 1.0],
        "size": { "height": 224, "width": 224 }
    })
}

/// Every vision tensor the runtime needs for one layer, plus a few Q-Former
/// tensors, in the order they are serialized.
pub fn fixture_tensors() -> Vec<FixtureTensor> {
    use StoredAs::*;
    let layer = |part: &str| format!("vision_model.encoder.layers.0.{part}");
    vec![
        FixtureTensor::new("vision_model.embeddings.class_embedding", F32, &[1, 1, HIDDEN]),
        FixtureTensor::new(
            "vision_model.embeddings.patch_embedding.weight",
            F16,
            &[HIDDEN, 3, 2, 2],
        ),
        FixtureTensor::new("vision_model.embeddings.patch_embedding.bias", F32, &[HIDDEN]),
        FixtureTensor::new("vision_model.embeddings.position_embedding", F32, &[1, 5, HIDDEN]),
        FixtureTensor::new(&layer("self_attn.qkv.weight"), BF16, &[3 * HIDDEN, HIDDEN]),
        FixtureTensor::new(&layer("self_attn.qkv.bias"), F32, &[3 * HIDDEN]),
        FixtureTensor::new(&layer("self_attn.projection.weight"), F16, &[HIDDEN, HIDDEN]),
        FixtureTensor::new(&layer("self_attn.projection.bias"), F32, &[HIDDEN]),
        FixtureTensor::new(&layer("layer_norm1.weight"), F32, &[HIDDEN]),
        FixtureTensor::new(&layer("layer_norm1.bias"), F32, &[HIDDEN]),
        FixtureTensor::new(&layer("mlp.fc1.weight"), BF16, &[16, HIDDEN]),
        FixtureTensor::new(&layer("mlp.fc1.bias"), F32, &[16]),
        FixtureTensor::new(&layer("mlp.fc2.weight"), BF16, &[HIDDEN, 16]),
        FixtureTensor::new(&layer("mlp.fc2.bias"), F32, &[HIDDEN]),
        FixtureTensor::new(&layer("layer_norm2.weight"), F32, &[HIDDEN]),
        FixtureTensor::new(&layer("layer_norm2.bias"), F32, &[HIDDEN]),
        FixtureTensor::new("vision_model.post_layernorm.weight", F32, &[HIDDEN]),
        FixtureTensor::new("vision_model.post_layernorm.bias", F32, &[HIDDEN]),
        FixtureTensor::new("query_tokens", F32, &[1, QUERY_TOKENS, HIDDEN]),
        FixtureTensor::new("qformer.layernorm.weight", F16, &[HIDDEN]),
        FixtureTensor::new("language_projection.bias", F32, &[1]),
    ]
}

/// Populate `dir` as a single-file model directory and return its tensors.
pub fn write_model_dir(dir: &Path) -> Vec<FixtureTensor> {
    let tensors = fixture_tensors();
    write_model_files(dir);
    write_safetensors(&dir.join("model.safetensors"), &tensors);
    tensors
}

/// Everything except the weights.
pub fn write_model_files(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    write_json(&dir.join("config.json"), &blip2_config());
    write_json(&dir.join("preprocessor_config.json"), &preprocessor_config());
    fs::write(dir.join("vocab.json"), r#"{"a": 0, "b": 1, "c": 2}"#).unwrap();
}
