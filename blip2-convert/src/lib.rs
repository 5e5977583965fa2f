//! Conversion of Hugging Face BLIP-2 checkpoints into a single GGUF file.
//!
//! [`convert::convert`] drives the whole pipeline; the other modules are
//! its stages and are public so the pieces can be tested and reused.

pub mod checkpoint;
pub mod config;
pub mod convert;
pub mod hparams;
pub mod verify;
pub mod vocab;
