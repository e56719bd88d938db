//! Locating, loading and saving model checkpoints.
//!
//! A checkpoint is a directory (local, or a Hugging Face Hub repository)
//! holding `config.json`, `tokenizer.json` and the weights, either as
//! `model.safetensors` or as a PyTorch `pytorch_model.bin`.

use crate::pipeline::VqaPipeline;
use crate::processor::{ProcessorError, ViltProcessor};
use crate::vilt::{HEAD_PREFIX, ViltConfig, ViltForQuestionAnswering};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Pretrained question-answering model used when none is specified.
pub const DEFAULT_MODEL_ID: &str = "dandelin/vilt-b32-finetuned-vqa";

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const SAFETENSORS_FILE: &str = "model.safetensors";
pub const PICKLE_FILE: &str = "pytorch_model.bin";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("{0} not found in checkpoint directory {1}")]
    MissingFile(&'static str, PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("incompatible pretrained weights for {name}: {reason}")]
    IncompatibleWeights { name: String, reason: String },

    #[error("variable map lock poisoned")]
    Poisoned,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WeightsFile {
    SafeTensors(PathBuf),
    Pickle(PathBuf),
}

impl WeightsFile {
    pub fn path(&self) -> &Path {
        match self {
            WeightsFile::SafeTensors(p) | WeightsFile::Pickle(p) => p,
        }
    }

    /// Read-only variable builder for inference.
    pub fn var_builder(&self, device: &Device) -> Result<VarBuilder<'static>, CheckpointError> {
        let vb = match self {
            // SAFETY: the weights file is not modified while mapped.
            WeightsFile::SafeTensors(p) => unsafe {
                VarBuilder::from_mmaped_safetensors(&[p], DType::F32, device)?
            },
            WeightsFile::Pickle(p) => VarBuilder::from_pth(p, DType::F32, device)?,
        };
        Ok(vb)
    }

    /// Every tensor in the file, keyed by name.
    pub fn tensors(&self, device: &Device) -> Result<HashMap<String, Tensor>, CheckpointError> {
        match self {
            WeightsFile::SafeTensors(p) => Ok(candle_core::safetensors::load(p, device)?),
            WeightsFile::Pickle(p) => candle_core::pickle::read_all(p)?
                .into_iter()
                .map(|(name, t)| Ok((name, t.to_device(device)?)))
                .collect(),
        }
    }
}

/// Resolved paths of one checkpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: WeightsFile,
}

impl ModelFiles {
    /// Treats `model` as a local directory if one exists, else as a hub id.
    pub fn locate(model: &str) -> Result<Self, CheckpointError> {
        if Path::new(model).is_dir() {
            Self::from_dir(model)
        } else {
            Self::from_hub(model)
        }
    }

    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref();
        let require = |name: &'static str| {
            let path = dir.join(name);
            if path.is_file() {
                Ok(path)
            } else {
                Err(CheckpointError::MissingFile(name, dir.to_path_buf()))
            }
        };

        let weights = match require(SAFETENSORS_FILE) {
            Ok(path) => WeightsFile::SafeTensors(path),
            Err(_) => WeightsFile::Pickle(require(PICKLE_FILE)?),
        };

        Ok(Self {
            config: require(CONFIG_FILE)?,
            tokenizer: require(TOKENIZER_FILE)?,
            weights,
        })
    }

    /// Downloads (or reuses the cached copy of) a hub repository.
    pub fn from_hub(repo_id: &str) -> Result<Self, CheckpointError> {
        let api = hf_hub::api::sync::Api::new()?;
        let repo = api.model(repo_id.to_string());

        let config = repo.get(CONFIG_FILE)?;
        let tokenizer = repo.get(TOKENIZER_FILE)?;
        let weights = match repo.get(SAFETENSORS_FILE) {
            Ok(path) => WeightsFile::SafeTensors(path),
            Err(e) => {
                log::debug!("No {SAFETENSORS_FILE} in {repo_id} ({e}), using {PICKLE_FILE}");
                WeightsFile::Pickle(repo.get(PICKLE_FILE)?)
            }
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    pub fn load_config(&self) -> Result<ViltConfig, CheckpointError> {
        let content = std::fs::read_to_string(&self.config)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn load_processor(&self, config: &ViltConfig) -> Result<ViltProcessor, CheckpointError> {
        Ok(ViltProcessor::from_file(
            &self.tokenizer,
            config.image_size as u32,
            config.max_position_embeddings,
        )?)
    }
}

/// Uses the first CUDA device unless `cpu` is set or none is available.
pub fn select_device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        Device::cuda_if_available(0)
    }
}

/// Loads the checkpoint for answering questions.
pub fn load_pipeline(files: &ModelFiles, device: &Device) -> Result<VqaPipeline, CheckpointError> {
    let config = files.load_config()?;
    let processor = files.load_processor(&config)?;
    let vb = files.weights.var_builder(device)?;
    let model = ViltForQuestionAnswering::new(&config, vb)?;
    log::debug!(
        "Loaded {} with {} answer labels",
        files.weights.path().display(),
        model.labels().len()
    );
    Ok(VqaPipeline::new(model, processor, device.clone()))
}

/// Copies `pretrained` tensors into the matching variables of `varmap`.
///
/// Variables under `skip_prefix` keep their fresh initialization. Any other
/// variable that is missing from `pretrained` or has a different shape makes
/// the checkpoint incompatible. Returns the number of variables loaded.
pub fn transplant(
    varmap: &VarMap,
    pretrained: &HashMap<String, Tensor>,
    skip_prefix: &str,
) -> Result<usize, CheckpointError> {
    let skip = format!("{skip_prefix}.");
    let vars = varmap.data().lock().map_err(|_| CheckpointError::Poisoned)?;
    let mut loaded = 0;

    for (name, var) in vars.iter() {
        if name.starts_with(&skip) {
            continue;
        }
        let tensor = pretrained
            .get(name)
            .ok_or_else(|| CheckpointError::IncompatibleWeights {
                name: name.clone(),
                reason: "missing from checkpoint".to_string(),
            })?;
        if tensor.shape() != var.shape() {
            return Err(CheckpointError::IncompatibleWeights {
                name: name.clone(),
                reason: format!("expected {:?}, found {:?}", var.shape(), tensor.shape()),
            });
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
        loaded += 1;
    }
    Ok(loaded)
}

/// A pretrained model whose final classifier layer was replaced for a new
/// label set, ready for fine-tuning.
pub struct FinetuneSetup {
    pub model: ViltForQuestionAnswering,
    pub varmap: VarMap,
    pub processor: ViltProcessor,
}

/// Builds a trainable model for `labels`, initialised from the checkpoint
/// except for a fresh final classifier layer.
pub fn load_for_finetuning(
    files: &ModelFiles,
    labels: &[String],
    device: &Device,
) -> Result<FinetuneSetup, CheckpointError> {
    let config = files.load_config()?.with_labels(labels);
    let processor = files.load_processor(&config)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = ViltForQuestionAnswering::new(&config, vb)?;

    let pretrained = files.weights.tensors(device)?;
    let loaded = transplant(&varmap, &pretrained, HEAD_PREFIX)?;
    log::info!(
        "Loaded {loaded} pretrained tensors; new head has {} labels",
        labels.len()
    );

    Ok(FinetuneSetup {
        model,
        varmap,
        processor,
    })
}

/// Writes config, weights and tokenizer so `dir` can be served directly.
pub fn save_pretrained(
    dir: impl AsRef<Path>,
    config: &ViltConfig,
    varmap: &VarMap,
    processor: &ViltProcessor,
) -> Result<(), CheckpointError> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(config)?)?;
    varmap.save(dir.join(SAFETENSORS_FILE))?;
    processor
        .tokenizer()
        .save(dir.join(TOKENIZER_FILE), true)
        .map_err(|e| ProcessorError::Tokenizer(e.to_string()))?;
    log::info!("Saved checkpoint to {}", dir.display());
    Ok(())
}
