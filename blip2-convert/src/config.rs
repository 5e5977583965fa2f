//! Hyperparameters read from the Hugging Face model directory.
//!
//! Only the fields the converter copies are modelled; anything else in the
//! JSON is ignored. A missing field fails deserialization with the field name.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

pub const CONFIG_FILE: &str = "config.json";
pub const VOCAB_FILE: &str = "vocab.json";
pub const PREPROCESSOR_FILE: &str = "preprocessor_config.json";

/// CLIP normalization constants used by the BLIP image processor when the
/// preprocessor config leaves them out.
pub const CLIP_IMAGE_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_IMAGE_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Vision tower (`vision_config`).
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub image_size: u32,
    pub patch_size: u32,
    pub hidden_size: u32,
    pub intermediate_size: u32,
    pub projection_dim: u32,
    pub num_attention_heads: u32,
    pub layer_norm_eps: f32,
    pub num_hidden_layers: u32,
    pub hidden_act: String,
}

/// Query-former bridge (`qformer_config`).
#[derive(Debug, Clone, Deserialize)]
pub struct QFormerConfig {
    /// Falls back to the top-level `num_query_tokens` when absent.
    #[serde(default)]
    pub num_query_tokens: Option<u32>,
    pub cross_attention_frequency: u32,
    pub encoder_hidden_size: u32,
    pub hidden_size: u32,
    pub intermediate_size: u32,
    pub layer_norm_eps: f32,
    pub max_position_embeddings: u32,
    pub num_attention_heads: u32,
    pub num_hidden_layers: u32,
    pub hidden_act: String,
}

/// Text tower (`text_config`).
#[derive(Debug, Clone, Deserialize)]
pub struct TextConfig {
    pub max_position_embeddings: u32,
    pub hidden_size: u32,
    pub word_embed_proj_dim: u32,
    pub num_attention_heads: u32,
    pub num_hidden_layers: u32,
    /// Whether `lm_head` shares the input embedding matrix.
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
}

fn default_true() -> bool {
    true
}

/// Contents of `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Blip2Config {
    pub vision_config: VisionConfig,
    pub qformer_config: QFormerConfig,
    pub text_config: TextConfig,
    #[serde(default)]
    pub num_query_tokens: Option<u32>,
}

impl Blip2Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Query token count, preferring the Q-Former's own setting.
    pub fn num_query_tokens(&self) -> Result<u32> {
        self.qformer_config
            .num_query_tokens
            .or(self.num_query_tokens)
            .ok_or_else(|| {
                anyhow!("config has no num_query_tokens in qformer_config or at top level")
            })
    }
}

/// Image normalization from `preprocessor_config.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageProcessorConfig {
    #[serde(default = "default_image_mean")]
    pub image_mean: Vec<f32>,
    #[serde(default = "default_image_std")]
    pub image_std: Vec<f32>,
}

fn default_image_mean() -> Vec<f32> {
    CLIP_IMAGE_MEAN.to_vec()
}

fn default_image_std() -> Vec<f32> {
    CLIP_IMAGE_STD.to_vec()
}

impl ImageProcessorConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> serde_json::Value {
        json!({
            "num_query_tokens": 32,
            "vision_config": {
                "image_size": 224, "patch_size": 14, "hidden_size": 1408,
                "intermediate_size": 6144, "projection_dim": 512,
                "num_attention_heads": 16, "layer_norm_eps": 1e-6,
                "num_hidden_layers": 39, "hidden_act": "gelu",
                "model_type": "blip_2_vision_model"
            },
            "qformer_config": {
                "cross_attention_frequency": 2, "encoder_hidden_size": 1408,
                "hidden_size": 768, "intermediate_size": 3072,
                "layer_norm_eps": 1e-12, "max_position_embeddings": 512,
                "num_attention_heads": 12, "num_hidden_layers": 12,
                "hidden_act": "gelu"
            },
            "text_config": {
                "max_position_embeddings": 2048, "hidden_size": 2560,
                "word_embed_proj_dim": 2560, "num_attention_heads": 32,
                "num_hidden_layers": 32
            }
        })
    }

    #[test]
    fn query_tokens_fall_back_to_top_level() {
        let config: Blip2Config = serde_json::from_value(sample()).unwrap();
        assert_eq!(config.num_query_tokens().unwrap(), 32);
    }

    #[test]
    fn qformer_query_tokens_take_precedence() {
        let mut value = sample();
        value["qformer_config"]["num_query_tokens"] = json!(16);
        let config: Blip2Config = serde_json::from_value(value).unwrap();
        assert_eq!(config.num_query_tokens().unwrap(), 16);
    }

    #[test]
    fn missing_query_tokens_is_an_error() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("num_query_tokens");
        let config: Blip2Config = serde_json::from_value(value).unwrap();
        assert!(config.num_query_tokens().is_err());
    }

    #[test]
    fn missing_field_is_named() {
        let mut value = sample();
        value["vision_config"]
            .as_object_mut()
            .unwrap()
            .remove("patch_size");
        let err = serde_json::from_value::<Blip2Config>(value).unwrap_err();
        assert!(err.to_string().contains("patch_size"));
    }

    #[test]
    fn word_embeddings_are_tied_unless_disabled() {
        let config: Blip2Config = serde_json::from_value(sample()).unwrap();
        assert!(config.text_config.tie_word_embeddings);

        let mut value = sample();
        value["text_config"]["tie_word_embeddings"] = json!(false);
        let config: Blip2Config = serde_json::from_value(value).unwrap();
        assert!(!config.text_config.tie_word_embeddings);
    }

    #[test]
    fn image_processor_defaults_to_clip_constants() {
        let config: ImageProcessorConfig =
            serde_json::from_value(json!({ "image_mean": [0.5, 0.5, 0.5] })).unwrap();
        assert_eq!(config.image_mean, vec![0.5, 0.5, 0.5]);
        assert_eq!(config.image_std, CLIP_IMAGE_STD.to_vec());
    }
}
