//! Token vocabulary from `vocab.json`.

use anyhow::{bail, Result};
use serde_json::Value;
use std::path::Path;

use crate::config::read_json;

/// Token strings in the order they appear in the source mapping.
///
/// The mapping's ids are ignored; position in the file is what counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocab {
    tokens: Vec<String>,
}

impl Vocab {
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_value(read_json(path)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            bail!("vocabulary must be a JSON object mapping tokens to ids");
        };
        let vocab = Self {
            tokens: map.into_iter().map(|(token, _)| token).collect(),
        };
        if vocab.is_empty() {
            bail!("vocabulary has no tokens");
        }
        Ok(vocab)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
