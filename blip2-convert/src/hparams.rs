//! Hyperparameter → GGUF metadata mapping.
//!
//! The key names and their order are what the BLIP-2 runtime loader expects.
//! Do not rename or reorder entries.

use anyhow::Result;
use gguf_file::keys::{
    format_key, ATTENTION_HEAD_COUNT, ATTENTION_LAYERNORM_EPS, BLOCK_COUNT, CONTEXT_LENGTH,
    EMBEDDING_LENGTH, FEED_FORWARD_LENGTH,
};
use gguf_file::GgufWriter;

use crate::config::{Blip2Config, ImageProcessorConfig};
use crate::vocab::Vocab;

/// Architecture tag recorded in `general.architecture`.
pub const ARCH: &str = "clip";

pub const VISION: &str = "blip2.vision";
pub const Q_FORMER: &str = "blip2.q_former";
pub const TEXT: &str = "blip2.text";

pub const KEY_IMAGE_SIZE: &str = "blip2.vision.image_size";
pub const KEY_PATCH_SIZE: &str = "blip2.vision.patch_size";
pub const KEY_PROJECTION_DIM: &str = "blip2.vision.projection_dim";
pub const KEY_IMAGE_MEAN: &str = "blip2.vision.image_mean";
pub const KEY_IMAGE_STD: &str = "blip2.vision.image_std";
pub const KEY_VISION_USE_GELU: &str = "blip2.vision.use_gelu";
pub const KEY_NUM_QUERY_TOKENS: &str = "blip2.q_former.num_query_tokens";
pub const KEY_CROSS_ATTENTION_FREQUENCY: &str = "blip2.q_former.cross_attention_frequency";
pub const KEY_ENCODER_HIDDEN_SIZE: &str = "blip2.q_former.encoder_hidden_size";
pub const KEY_QFORMER_USE_GELU: &str = "blip2.q_former.use_gelu";
pub const KEY_WORD_EMBED_PROJ_DIM: &str = "blip2.text.word_embed_proj_dim";

/// Whether an activation name selects the exact GELU kernel.
pub fn uses_gelu(hidden_act: &str) -> bool {
    hidden_act == "gelu"
}

/// Write every hyperparameter, the normalization arrays and the vocabulary.
pub fn write_hparams(
    writer: &mut GgufWriter,
    config: &Blip2Config,
    image: &ImageProcessorConfig,
    vocab: &Vocab,
) -> Result<()> {
    let v = &config.vision_config;
    writer.add_uint32(KEY_IMAGE_SIZE, v.image_size)?;
    writer.add_uint32(KEY_PATCH_SIZE, v.patch_size)?;
    writer.add_uint32(&format_key(EMBEDDING_LENGTH, VISION), v.hidden_size)?;
    writer.add_uint32(&format_key(FEED_FORWARD_LENGTH, VISION), v.intermediate_size)?;
    writer.add_uint32(KEY_PROJECTION_DIM, v.projection_dim)?;
    writer.add_uint32(&format_key(ATTENTION_HEAD_COUNT, VISION), v.num_attention_heads)?;
    writer.add_float32(&format_key(ATTENTION_LAYERNORM_EPS, VISION), v.layer_norm_eps)?;
    writer.add_uint32(&format_key(BLOCK_COUNT, VISION), v.num_hidden_layers)?;

    writer.add_array(KEY_IMAGE_MEAN, image.image_mean.iter().copied())?;
    writer.add_array(KEY_IMAGE_STD, image.image_std.iter().copied())?;
    writer.add_bool(KEY_VISION_USE_GELU, uses_gelu(&v.hidden_act))?;

    let q = &config.qformer_config;
    writer.add_uint32(KEY_NUM_QUERY_TOKENS, config.num_query_tokens()?)?;
    writer.add_uint32(KEY_CROSS_ATTENTION_FREQUENCY, q.cross_attention_frequency)?;
    writer.add_uint32(KEY_ENCODER_HIDDEN_SIZE, q.encoder_hidden_size)?;
    writer.add_uint32(&format_key(EMBEDDING_LENGTH, Q_FORMER), q.hidden_size)?;
    writer.add_uint32(&format_key(FEED_FORWARD_LENGTH, Q_FORMER), q.intermediate_size)?;
    writer.add_float32(&format_key(ATTENTION_LAYERNORM_EPS, Q_FORMER), q.layer_norm_eps)?;
    writer.add_uint32(&format_key(CONTEXT_LENGTH, Q_FORMER), q.max_position_embeddings)?;
    writer.add_uint32(&format_key(ATTENTION_HEAD_COUNT, Q_FORMER), q.num_attention_heads)?;
    writer.add_uint32(&format_key(BLOCK_COUNT, Q_FORMER), q.num_hidden_layers)?;
    writer.add_bool(KEY_QFORMER_USE_GELU, uses_gelu(&q.hidden_act))?;

    let t = &config.text_config;
    writer.add_uint32(&format_key(CONTEXT_LENGTH, TEXT), t.max_position_embeddings)?;
    writer.add_uint32(&format_key(EMBEDDING_LENGTH, TEXT), t.hidden_size)?;
    writer.add_uint32(KEY_WORD_EMBED_PROJ_DIM, t.word_embed_proj_dim)?;
    writer.add_uint32(&format_key(ATTENTION_HEAD_COUNT, TEXT), t.num_attention_heads)?;
    writer.add_uint32(&format_key(BLOCK_COUNT, TEXT), t.num_hidden_layers)?;

    writer.add_token_list(vocab.tokens())?;
    Ok(())
}
