//! Well-known GGUF metadata keys.
//!
//! Per-architecture keys are templates containing `{arch}`; expand them with
//! [`format_key`].

pub const GENERAL_ARCHITECTURE: &str = "general.architecture";
pub const GENERAL_ALIGNMENT: &str = "general.alignment";

pub const CONTEXT_LENGTH: &str = "{arch}.context_length";
pub const EMBEDDING_LENGTH: &str = "{arch}.embedding_length";
pub const BLOCK_COUNT: &str = "{arch}.block_count";
pub const FEED_FORWARD_LENGTH: &str = "{arch}.feed_forward_length";
pub const ATTENTION_HEAD_COUNT: &str = "{arch}.attention.head_count";
pub const ATTENTION_LAYERNORM_EPS: &str = "{arch}.attention.layer_norm_epsilon";

pub const TOKENIZER_TOKENS: &str = "tokenizer.ggml.tokens";

/// Substitute `arch` into a `{arch}` key template.
pub fn format_key(template: &str, arch: &str) -> String {
    template.replace("{arch}", arch)
}
