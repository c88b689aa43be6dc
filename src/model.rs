//! QaModel wrapper for span prediction under token masking
//!
//! Supports BERT and RoBERTa extractive-QA checkpoints with a unified
//! interface. Checkpoints are read from a local directory or downloaded
//! from the HuggingFace hub.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::info;

use crate::features::QaFeature;
use crate::forward_encoder::QaEncoder;
use crate::masks::create_position_ids;
use crate::prediction::SpanLogits;

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// BERT (Google)
    Bert,
    /// RoBERTa (Facebook AI)
    Roberta,
}

impl ModelArchitecture {
    /// Detect architecture from the `model_type` entry of config.json
    pub fn from_model_type(model_type: &str) -> Self {
        let lower = model_type.to_lowercase();
        if lower.contains("roberta") || lower.contains("camembert") {
            ModelArchitecture::Roberta
        } else {
            if lower != "bert" {
                info!(
                    "Unknown model type '{}', treating it as BERT",
                    model_type
                );
            }
            ModelArchitecture::Bert
        }
    }

    /// Prefix of the encoder weights inside the checkpoint
    pub fn weight_prefix(&self) -> &'static str {
        match self {
            ModelArchitecture::Bert => "bert",
            ModelArchitecture::Roberta => "roberta",
        }
    }
}

/// Unified backend trait for span-prediction models.
///
/// Implementing this trait is all the attribution pipeline needs from a
/// model: a batch-of-one forward pass that returns start and end logits.
pub trait QaBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn n_heads(&self) -> usize;
    fn max_positions(&self) -> usize;

    /// Padding index for offset position ids (None = absolute positions)
    fn padding_idx(&self) -> Option<u32>;

    // --- Forward pass ---

    /// Returns `(start_logits, end_logits)`, each of shape `[batch, seq]`
    fn forward_span_logits(
        &self,
        input_ids: &Tensor,
        type_ids: &Tensor,
        attention_mask: &Tensor,
        position_ids: &Tensor,
    ) -> Result<(Tensor, Tensor)>;
}

/// Files that make up a checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Sharded safetensors index (`model.safetensors.index.json`)
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

impl SafetensorsIndex {
    /// Unique shard file names, sorted
    fn shard_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.weight_map.values().cloned().collect();
        names.sort();
        names.dedup();
        names
    }
}

impl CheckpointFiles {
    /// Resolve a local checkpoint directory or a hub model id
    pub fn resolve(model: &str) -> Result<Self> {
        let path = Path::new(model);
        if path.is_dir() {
            Self::from_dir(path)
        } else {
            Self::from_hub(model)
        }
    }

    /// Read files from a local checkpoint directory
    pub fn from_dir(dir: &Path) -> Result<Self> {
        info!("Loading checkpoint from directory: {}", dir.display());

        let config = dir.join("config.json");
        let tokenizer = dir.join("tokenizer.json");
        anyhow::ensure!(config.is_file(), "Missing {}", config.display());
        anyhow::ensure!(tokenizer.is_file(), "Missing {}", tokenizer.display());

        let index_path = dir.join("model.safetensors.index.json");
        let weights = if index_path.is_file() {
            let index_str =
                std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
            index
                .shard_names()
                .into_iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            vec![dir.join("model.safetensors")]
        };
        for weight in &weights {
            anyhow::ensure!(weight.is_file(), "Missing {}", weight.display());
        }

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    /// Download files from the HuggingFace hub
    pub fn from_hub(model_id: &str) -> Result<Self> {
        info!("Downloading checkpoint from hub: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;

        let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            info!("Model is sharded, loading index...");
            let index_str =
                std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

            let shard_names = index.shard_names();
            info!("Downloading {} shard files...", shard_names.len());
            shard_names
                .iter()
                .map(|name| {
                    repo.get(name)
                        .with_context(|| format!("Failed to download {name}"))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

/// High-level QA model wrapper
pub struct QaModel {
    model: Box<dyn QaBackend>,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
}

impl QaModel {
    /// Load a model (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    ///
    /// `model` is either a local checkpoint directory or a hub model id.
    pub fn from_pretrained_with_device(model: &str, force_cpu: Option<bool>) -> Result<Self> {
        let device = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            Device::Cpu
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    dev
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    Device::Cpu
                }
            }
        };

        // Attribution compares small probability differences; keep full precision
        let dtype = DType::F32;

        info!("Loading model: {}", model);
        info!("Device: {:?}", device);

        let files = CheckpointFiles::resolve(model)?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        let backend = QaEncoder::load(&files, &device, dtype)?;
        info!("Architecture: {:?}", backend.config().architecture());

        Ok(Self::from_parts(Box::new(backend), tokenizer, device, model))
    }

    /// Assemble a model from an already constructed backend
    pub fn from_parts(
        model: Box<dyn QaBackend>,
        tokenizer: Tokenizer,
        device: Device,
        model_id: &str,
    ) -> Self {
        Self {
            model,
            tokenizer,
            device,
            model_id: model_id.to_string(),
        }
    }

    /// Get the model ID
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Look up the first of `candidates` present in the vocabulary
    fn special_token_id(&self, candidates: &[&str]) -> Option<u32> {
        let vocab = self.tokenizer.get_vocab(true);
        candidates.iter().find_map(|t| vocab.get(*t).copied())
    }

    /// ID of the token used to hide inactive positions
    pub fn mask_token_id(&self) -> Result<u32> {
        self.special_token_id(&["<mask>", "[MASK]"])
            .ok_or_else(|| anyhow::anyhow!("Tokenizer has no mask token"))
    }

    /// ID of the padding token, if the tokenizer has one
    pub fn pad_token_id(&self) -> Option<u32> {
        self.special_token_id(&["<pad>", "[PAD]"])
    }

    /// Number of layers in the model
    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    /// Hidden dimension of the model
    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    /// Vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    /// Number of attention heads
    pub fn n_heads(&self) -> usize {
        self.model.n_heads()
    }

    /// Position ids of the full (unmasked) input, shape `[1, seq]`
    pub fn position_ids(&self, input_ids: &[u32]) -> Result<Tensor> {
        create_position_ids(input_ids, self.model.padding_idx(), &self.device)
    }

    /// Span logits for a feature's own input ids
    pub fn span_logits(&self, feature: &QaFeature) -> Result<SpanLogits> {
        let position_ids = self.position_ids(&feature.encoding.ids)?;
        self.span_logits_with_ids(&feature.encoding.ids, &feature.encoding.type_ids, &position_ids)
    }

    /// Span logits for arbitrary input ids with fixed type and position ids
    pub fn span_logits_with_ids(
        &self,
        input_ids: &[u32],
        type_ids: &[u32],
        position_ids: &Tensor,
    ) -> Result<SpanLogits> {
        anyhow::ensure!(
            input_ids.len() == type_ids.len(),
            "input_ids ({}) and type_ids ({}) differ in length",
            input_ids.len(),
            type_ids.len()
        );
        // RoBERTa positions start past padding_idx
        let offset = self.model.padding_idx().map_or(0, |p| p as usize + 1);
        anyhow::ensure!(
            input_ids.len() + offset <= self.model.max_positions(),
            "Sequence of {} tokens (position offset {}) exceeds the model's {} positions",
            input_ids.len(),
            offset,
            self.model.max_positions()
        );

        let input_tensor = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let type_tensor = Tensor::new(type_ids, &self.device)?.unsqueeze(0)?;
        let attention_mask = input_tensor.ones_like()?;

        let (start, end) = self.model.forward_span_logits(
            &input_tensor,
            &type_tensor,
            &attention_mask,
            position_ids,
        )?;

        SpanLogits::from_tensors(&start, &end)
    }
}
