//! Example to model-feature conversion
//!
//! Each example becomes exactly one feature: the question (capped at
//! `max_query_length` tokens) followed by as much of the context as fits in
//! `max_seq_length`. No sliding windows and no padding.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokenizers::{Tokenizer, TruncationParams, TruncationStrategy};
use tracing::debug;

use crate::positioning::EncodingWithOffsets;
use crate::squad::SquadExample;

/// First unique id handed out to a feature
pub const FIRST_UNIQUE_ID: u64 = 1_000_000_000;

/// Configuration for feature conversion
#[derive(Debug, Clone, Copy)]
pub struct FeatureConfig {
    /// Maximum total tokens including special tokens
    pub max_seq_length: usize,
    /// Maximum question tokens
    pub max_query_length: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            max_seq_length: 384,
            max_query_length: 64,
        }
    }
}

/// A tokenized example ready for the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaFeature {
    pub unique_id: u64,
    pub example_index: usize,
    pub qas_id: String,
    pub encoding: EncodingWithOffsets,
    /// Whether part of the context was cut off
    pub truncated: bool,
}

impl QaFeature {
    /// Token strings
    pub fn tokens(&self) -> &[String] {
        &self.encoding.tokens
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.encoding.len()
    }

    /// Check if the feature has no tokens
    pub fn is_empty(&self) -> bool {
        self.encoding.is_empty()
    }
}

/// Converts examples into features with a dedicated, truncating tokenizer
pub struct FeatureConverter {
    tokenizer: Tokenizer,
    config: FeatureConfig,
    next_unique_id: u64,
}

impl FeatureConverter {
    /// Create a converter; the tokenizer is cloned and reconfigured
    pub fn new(tokenizer: &Tokenizer, config: FeatureConfig) -> Result<Self> {
        anyhow::ensure!(config.max_query_length > 0, "max_query_length must be positive");
        anyhow::ensure!(
            config.max_query_length < config.max_seq_length,
            "max_query_length ({}) must be smaller than max_seq_length ({})",
            config.max_query_length,
            config.max_seq_length
        );

        let mut tokenizer = tokenizer.clone();
        tokenizer.with_padding(None);
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_seq_length,
                strategy: TruncationStrategy::OnlySecond,
                stride: 0,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Truncation setup error: {e}"))?;

        Ok(Self {
            tokenizer,
            config,
            next_unique_id: FIRST_UNIQUE_ID,
        })
    }

    /// Convert one example into its feature
    pub fn convert(&mut self, example: &SquadExample, example_index: usize) -> Result<QaFeature> {
        let question = self.truncate_question(&example.question)?;

        let encoding = self
            .tokenizer
            .encode((question, example.context.as_str()), true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))
            .with_context(|| format!("Failed to encode example {}", example.qas_id))?;

        let encoding = EncodingWithOffsets::new(
            encoding.get_ids().to_vec(),
            encoding.get_type_ids().to_vec(),
            encoding.get_tokens().to_vec(),
            encoding.get_offsets().to_vec(),
            encoding.get_sequence_ids(),
        );

        let truncated = match encoding.context_range() {
            Some((_, last)) => encoding.offsets[last].1 < example.context.trim_end().len(),
            None => !example.context.trim().is_empty(),
        };

        debug!(
            "Feature for {}: {} tokens (truncated: {})",
            example.qas_id,
            encoding.len(),
            truncated
        );

        let unique_id = self.next_unique_id;
        self.next_unique_id += 1;

        Ok(QaFeature {
            unique_id,
            example_index,
            qas_id: example.qas_id.clone(),
            encoding,
            truncated,
        })
    }

    /// Cut the question text after `max_query_length` tokens
    fn truncate_question<'a>(&self, question: &'a str) -> Result<&'a str> {
        let encoding = self
            .tokenizer
            .encode(question, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

        let offsets = encoding.get_offsets();
        if offsets.len() <= self.config.max_query_length {
            return Ok(question);
        }
        let (_, end) = offsets[self.config.max_query_length - 1];
        Ok(&question[..end])
    }
}
