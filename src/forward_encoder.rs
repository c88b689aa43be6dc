//! BERT/RoBERTa encoder forward pass with a span-prediction head
//!
//! Custom implementation of the post-norm bidirectional encoder used by
//! extractive QA checkpoints, followed by the `qa_outputs` projection that
//! turns every hidden state into a (start, end) logit pair.
//!
//! BERT and RoBERTa share the layer layout and only differ in:
//! - weight prefix (`bert.` vs `roberta.`)
//! - position ids (absolute vs offset past `padding_idx`)
//! - default layer norm epsilon

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{
    embedding, layer_norm, linear, Activation, Embedding, LayerNorm, Linear, VarBuilder,
};
use tracing::info;

use crate::masks::create_attention_mask;
use crate::model::{CheckpointFiles, ModelArchitecture, QaBackend};

/// Model configuration (matches HuggingFace config.json for BERT/RoBERTa)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default)]
    pub pad_token_id: u32,
    /// `gelu` is the erf form, `gelu_new` the tanh approximation
    #[serde(default = "default_hidden_act")]
    pub hidden_act: Activation,
}

fn default_model_type() -> String {
    "bert".to_string()
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_hidden_act() -> Activation {
    Activation::Gelu
}

impl EncoderConfig {
    pub fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::from_model_type(&self.model_type)
    }
}

/// Word + position + token type embeddings, then LayerNorm
struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl Embeddings {
    fn load(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: embedding(
                config.type_vocab_size,
                config.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(
        &self,
        input_ids: &Tensor,
        type_ids: &Tensor,
        position_ids: &Tensor,
    ) -> Result<Tensor> {
        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(position_ids)?;
        let types = self.token_type_embeddings.forward(type_ids)?;
        let embeddings = ((words + positions)? + types)?;
        Ok(self.layer_norm.forward(&embeddings)?)
    }
}

/// Bidirectional multi-head self-attention with output projection
struct SelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl SelfAttention {
    fn load(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        let hidden = config.hidden_size;
        let self_vb = vb.pp("self");
        let out_vb = vb.pp("output");
        Ok(Self {
            query: linear(hidden, hidden, self_vb.pp("query"))?,
            key: linear(hidden, hidden, self_vb.pp("key"))?,
            value: linear(hidden, hidden, self_vb.pp("value"))?,
            output: linear(hidden, hidden, out_vb.pp("dense"))?,
            output_norm: layer_norm(hidden, config.layer_norm_eps, out_vb.pp("LayerNorm"))?,
            num_heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
        })
    }

    /// `mask` is the additive `[batch, 1, 1, seq]` padding mask
    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let split_heads = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((b, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split_heads(self.query.forward(x)?)?;
        let k = split_heads(self.key.forward(x)?)?;
        let v = split_heads(self.value.forward(x)?)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights.matmul(&v)?;
        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;

        let projected = self.output.forward(&attn_output)?;
        Ok(self.output_norm.forward(&(projected + x)?)?)
    }
}

/// Feed-forward block: dense -> activation -> dense, residual LayerNorm
struct FeedForward {
    intermediate: Linear,
    activation: Activation,
    output: Linear,
    output_norm: LayerNorm,
}

impl FeedForward {
    fn load(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        Ok(Self {
            intermediate: linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            activation: config.hidden_act,
            output: linear(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("output").pp("dense"),
            )?,
            output_norm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("output").pp("LayerNorm"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.activation.forward(&self.intermediate.forward(x)?)?;
        let hidden = self.output.forward(&hidden)?;
        Ok(self.output_norm.forward(&(hidden + x)?)?)
    }
}

/// Single encoder layer
struct EncoderLayer {
    attention: SelfAttention,
    feed_forward: FeedForward,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        Ok(Self {
            attention: SelfAttention::load(vb.pp("attention"), config)?,
            feed_forward: FeedForward::load(vb.clone(), config)?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let x = self.attention.forward(x, mask)?;
        self.feed_forward.forward(&x)
    }
}

/// Encoder with span-prediction head
pub struct QaEncoder {
    embeddings: Embeddings,
    layers: Vec<EncoderLayer>,
    qa_outputs: Linear,
    config: EncoderConfig,
    dtype: DType,
}

impl QaEncoder {
    /// Load weights for a resolved checkpoint
    pub fn load(files: &CheckpointFiles, device: &Device, dtype: DType) -> Result<Self> {
        let config_str =
            std::fs::read_to_string(&files.config).context("Failed to read config")?;
        let config: EncoderConfig = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} ({} layers, {} hidden, {} heads, {} vocab)",
            config.model_type,
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.vocab_size
        );

        info!("Loading weights from {} file(s)...", files.weights.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
        Self::new(config, vb)
    }

    /// Build the model from a config and a variable builder
    pub fn new(config: EncoderConfig, vb: VarBuilder) -> Result<Self> {
        anyhow::ensure!(
            config.hidden_size % config.num_attention_heads == 0,
            "hidden_size {} not divisible by num_attention_heads {}",
            config.hidden_size,
            config.num_attention_heads
        );

        let dtype = vb.dtype();
        let vb_model = vb.pp(config.architecture().weight_prefix());

        let embeddings = Embeddings::load(vb_model.pp("embeddings"), &config)?;
        let vb_layers = vb_model.pp("encoder").pp("layer");
        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::load(vb_layers.pp(i.to_string()), &config))
            .collect::<Result<Vec<_>>>()?;
        let qa_outputs = linear(config.hidden_size, 2, vb.pp("qa_outputs"))?;

        Ok(Self {
            embeddings,
            layers,
            qa_outputs,
            config,
            dtype,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

impl QaBackend for QaEncoder {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn n_heads(&self) -> usize {
        self.config.num_attention_heads
    }

    fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }

    fn padding_idx(&self) -> Option<u32> {
        match self.config.architecture() {
            ModelArchitecture::Roberta => Some(self.config.pad_token_id),
            ModelArchitecture::Bert => None,
        }
    }

    fn forward_span_logits(
        &self,
        input_ids: &Tensor,
        type_ids: &Tensor,
        attention_mask: &Tensor,
        position_ids: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let mask = create_attention_mask(attention_mask, self.dtype)?;

        let mut hidden = self
            .embeddings
            .forward(input_ids, type_ids, position_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask)?;
        }

        // [batch, seq, 2]
        let logits = self.qa_outputs.forward(&hidden)?;
        let start_logits = logits.i((.., .., 0))?.contiguous()?;
        let end_logits = logits.i((.., .., 1))?.contiguous()?;
        Ok((start_logits, end_logits))
    }
}
