//! Read a converted file back the way the BLIP-2 runtime loader does.
//!
//! The runtime only binds the vision tower so far; its tensors and
//! hyperparameters are required, everything else is reported as found.

use anyhow::{bail, Context, Result};
use gguf_file::keys::{
    format_key, ATTENTION_HEAD_COUNT, ATTENTION_LAYERNORM_EPS, BLOCK_COUNT, EMBEDDING_LENGTH,
    FEED_FORWARD_LENGTH, GENERAL_ARCHITECTURE, TOKENIZER_TOKENS,
};
use gguf_file::{GgufFile, GgufValue};
use std::fmt;
use std::path::Path;

use crate::hparams::{
    KEY_CROSS_ATTENTION_FREQUENCY, KEY_IMAGE_MEAN, KEY_IMAGE_SIZE, KEY_IMAGE_STD,
    KEY_NUM_QUERY_TOKENS, KEY_PATCH_SIZE, KEY_QFORMER_USE_GELU, KEY_VISION_USE_GELU, VISION,
};

#[derive(Debug, Clone, PartialEq)]
pub struct VisionHparams {
    pub image_size: u32,
    pub patch_size: u32,
    pub hidden_size: u32,
    pub n_layer: u32,
    pub n_head: u32,
    pub n_intermediate: u32,
    pub eps: f32,
}

/// Summary of a converted BLIP-2 file.
#[derive(Debug, Clone, PartialEq)]
pub struct Blip2Report {
    pub architecture: String,
    pub vision: VisionHparams,
    pub vision_gelu: bool,
    pub qformer_gelu: bool,
    pub num_query_tokens: u32,
    pub cross_attention_frequency: u32,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub vocab_size: usize,
    pub tensor_count: usize,
    pub tensor_bytes: usize,
}

/// Names of every vision tensor the runtime looks up for `n_layer` blocks.
pub fn vision_tensor_names(n_layer: u32) -> Vec<String> {
    let mut names = vec![
        "vision_model.embeddings.patch_embedding.weight".to_owned(),
        "vision_model.embeddings.patch_embedding.bias".to_owned(),
        "vision_model.embeddings.class_embedding".to_owned(),
        "vision_model.embeddings.position_embedding".to_owned(),
    ];
    for i in 0..n_layer {
        for part in [
            "self_attn.qkv",
            "self_attn.projection",
            "layer_norm1",
            "mlp.fc1",
            "mlp.fc2",
            "layer_norm2",
        ] {
            for suffix in ["weight", "bias"] {
                names.push(format!("vision_model.encoder.layers.{i}.{part}.{suffix}"));
            }
        }
    }
    names.push("vision_model.post_layernorm.weight".to_owned());
    names.push("vision_model.post_layernorm.bias".to_owned());
    names
}

fn channel_triplet(file: &GgufFile, key: &str) -> Result<[f32; 3]> {
    let values: Vec<f32> = file
        .get_array(key)?
        .iter()
        .filter_map(GgufValue::as_f32)
        .collect();
    match values.as_slice() {
        [r, g, b] => Ok([*r, *g, *b]),
        _ => bail!("{key} must hold 3 float values, found {}", values.len()),
    }
}

fn read_vision(file: &GgufFile) -> Result<VisionHparams> {
    Ok(VisionHparams {
        image_size: file.get_u32(KEY_IMAGE_SIZE)?,
        patch_size: file.get_u32(KEY_PATCH_SIZE)?,
        hidden_size: file.get_u32(&format_key(EMBEDDING_LENGTH, VISION))?,
        n_layer: file.get_u32(&format_key(BLOCK_COUNT, VISION))?,
        n_head: file.get_u32(&format_key(ATTENTION_HEAD_COUNT, VISION))?,
        n_intermediate: file.get_u32(&format_key(FEED_FORWARD_LENGTH, VISION))?,
        eps: file.get_f32(&format_key(ATTENTION_LAYERNORM_EPS, VISION))?,
    })
}

/// Open `path`, read the runtime's required values and check that every
/// vision tensor is present.
pub fn inspect(path: &Path) -> Result<Blip2Report> {
    let file = GgufFile::open(path).with_context(|| format!("failed to read {}", path.display()))?;

    let vision = read_vision(&file)?;
    for name in vision_tensor_names(vision.n_layer) {
        file.tensor(&name)?;
    }

    let vocab_size = file
        .get(TOKENIZER_TOKENS)
        .and_then(GgufValue::as_array)
        .map_or(0, <[GgufValue]>::len);

    Ok(Blip2Report {
        architecture: file.get_str(GENERAL_ARCHITECTURE)?.to_owned(),
        vision_gelu: file.get_bool(KEY_VISION_USE_GELU)?,
        qformer_gelu: file.get_bool(KEY_QFORMER_USE_GELU)?,
        num_query_tokens: file.get_u32(KEY_NUM_QUERY_TOKENS)?,
        cross_attention_frequency: file.get_u32(KEY_CROSS_ATTENTION_FREQUENCY)?,
        image_mean: channel_triplet(&file, KEY_IMAGE_MEAN)?,
        image_std: channel_triplet(&file, KEY_IMAGE_STD)?,
        vocab_size,
        tensor_count: file.tensors().len(),
        tensor_bytes: file.total_tensor_bytes()?,
        vision,
    })
}

impl fmt::Display for Blip2Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = &self.vision;
        writeln!(f, "architecture:        {}", self.architecture)?;
        writeln!(f, "image size / patch:  {} / {}", v.image_size, v.patch_size)?;
        writeln!(f, "vision hidden:       {}", v.hidden_size)?;
        writeln!(f, "vision layers:       {}", v.n_layer)?;
        writeln!(f, "vision heads:        {}", v.n_head)?;
        writeln!(f, "vision ffn:          {}", v.n_intermediate)?;
        writeln!(f, "vision eps:          {:e}", v.eps)?;
        writeln!(f, "vision gelu:         {}", self.vision_gelu)?;
        writeln!(f, "q-former gelu:       {}", self.qformer_gelu)?;
        writeln!(f, "query tokens:        {}", self.num_query_tokens)?;
        writeln!(f, "cross-attn freq:     {}", self.cross_attention_frequency)?;
        writeln!(f, "image mean:          {:?}", self.image_mean)?;
        writeln!(f, "image std:           {:?}", self.image_std)?;
        writeln!(f, "vocab size:          {}", self.vocab_size)?;
        write!(
            f,
            "tensors:             {} ({:.2} MB)",
            self.tensor_count,
            self.tensor_bytes as f64 / 1_048_576.0
        )
    }
}
