//! End-to-end conversion of a model directory into one GGUF file.

use anyhow::{Context, Result};
use gguf_file::{GgmlType, GgufWriter};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::checkpoint::{squeeze, Checkpoint};
use crate::config::{
    Blip2Config, ImageProcessorConfig, CONFIG_FILE, PREPROCESSOR_FILE, VOCAB_FILE,
};
use crate::hparams::{write_hparams, ARCH};
use crate::vocab::Vocab;

const FNAME_MIDDLE: &str = "two_tower_blip2";

/// Output projection of the language model.
pub const LM_HEAD: &str = "language_model.lm_head.weight";

/// Input embeddings `lm_head` may be tied to: OPT first, then T5.
pub const TIED_EMBEDDINGS: [&str; 2] = [
    "language_model.model.decoder.embed_tokens.weight",
    "language_model.shared.weight",
];

/// What to convert and where to put it.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub model_dir: PathBuf,
    /// Defaults to `model_dir`.
    pub output_dir: Option<PathBuf>,
    /// Write tensors as f32 instead of f16.
    pub use_f32: bool,
}

impl ConvertOptions {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            output_dir: None,
            use_f32: false,
        }
    }

    pub fn output_dir(&self) -> &Path {
        self.output_dir.as_deref().unwrap_or(&self.model_dir)
    }

    pub fn ftype(&self) -> GgmlType {
        if self.use_f32 {
            GgmlType::F32
        } else {
            GgmlType::F16
        }
    }

    /// `<output_dir>/<prefix>_ggml-two_tower_blip2-<ftype>.gguf`, where the
    /// prefix is the output directory's name with `ggml_` removed.
    pub fn output_path(&self) -> PathBuf {
        let dir = self.output_dir();
        let prefix = dir
            .file_name()
            .map(|name| name.to_string_lossy().replace("ggml_", ""))
            .unwrap_or_default();
        dir.join(format!(
            "{prefix}_ggml-{FNAME_MIDDLE}-{}.gguf",
            self.ftype().name()
        ))
    }
}

/// Numpy-style shape for log lines: `(768,)`, `(32, 768)`, `()`.
pub fn format_shape(shape: &[usize]) -> String {
    match shape {
        [] => "()".to_owned(),
        [n] => format!("({n},)"),
        dims => {
            let parts: Vec<String> = dims.iter().map(ToString::to_string).collect();
            format!("({})", parts.join(", "))
        }
    }
}

/// Squeeze every checkpoint tensor and queue it on `writer` under its
/// original name. Returns the number of tensors written.
pub fn dump_tensors(
    writer: &mut GgufWriter,
    checkpoint: &Checkpoint,
    ftype: GgmlType,
) -> Result<usize> {
    for tensor in checkpoint.tensors() {
        let (name, array) = tensor?;
        let array = squeeze(array);
        info!(
            "{} - {} - shape = {}",
            name,
            ftype.name(),
            format_shape(array.shape())
        );
        writer
            .add_tensor(name, &array, ftype)
            .with_context(|| format!("failed to add tensor {name}"))?;
    }
    Ok(checkpoint.len())
}

/// Restore a tied `lm_head` that was dropped when the checkpoint was saved,
/// so the output holds the full weight collection of the loaded model.
pub fn tie_lm_head(checkpoint: &mut Checkpoint, config: &Blip2Config) -> Result<()> {
    if !config.text_config.tie_word_embeddings || checkpoint.contains(LM_HEAD) {
        return Ok(());
    }
    match TIED_EMBEDDINGS.iter().find(|name| checkpoint.contains(name)) {
        Some(source) => {
            checkpoint.add_alias(LM_HEAD, source)?;
            info!("{LM_HEAD} is tied to {source}");
        }
        None => debug!("no input embedding found to tie {LM_HEAD} to"),
    }
    Ok(())
}

/// Run the conversion and return the path of the written file.
pub fn convert(options: &ConvertOptions) -> Result<PathBuf> {
    let model_dir = &options.model_dir;

    let mut checkpoint = Checkpoint::open(model_dir)?;
    let image = ImageProcessorConfig::from_file(&model_dir.join(PREPROCESSOR_FILE))?;
    let vocab = Vocab::from_file(&model_dir.join(VOCAB_FILE))?;
    let config = Blip2Config::from_file(&model_dir.join(CONFIG_FILE))?;
    tie_lm_head(&mut checkpoint, &config)?;

    let output_dir = options.output_dir();
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let path = options.output_path();

    let mut writer = GgufWriter::new(&path, ARCH);
    write_hparams(&mut writer, &config, &image, &vocab)?;
    dump_tensors(&mut writer, &checkpoint, options.ftype())?;

    info!(
        "writing {} metadata entries and {} tensors to {}",
        writer.kv_count(),
        writer.tensor_count(),
        writer.path().display()
    );
    writer.write_header_to_file()?;
    writer.write_kv_data_to_file()?;
    writer.write_tensors_to_file()?;
    writer.close()?;
    Ok(path)
}
