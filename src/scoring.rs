//! Masked-input scoring for span predictions
//!
//! Fixes everything about a feature except which tokens are visible:
//! inactive positions are replaced by the mask token while type ids,
//! attention mask and position ids stay those of the full input. The score
//! then measures how much of the original prediction survives.

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::features::QaFeature;
use crate::model::QaModel;
use crate::prediction::{PrelimResult, SpanLogits};

/// What a masked query is scored by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreKind {
    /// `p_start[s] * p_end[e]` of the originally predicted span
    Probability,
    /// `start[s] + end[e]` of the originally predicted span
    Logit,
    /// Negated KL divergence from the unmasked start/end distributions
    NegKl,
}

impl FromStr for ScoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "probability" | "prob" => Ok(Self::Probability),
            "logit" => Ok(Self::Logit),
            "neg_kl" | "kl" => Ok(Self::NegKl),
            other => anyhow::bail!("Unknown score '{other}' (probability, logit, neg-kl)"),
        }
    }
}

impl fmt::Display for ScoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Probability => "probability",
            Self::Logit => "logit",
            Self::NegKl => "neg-kl",
        };
        f.write_str(name)
    }
}

/// Softmax over a logit vector
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// KL(P || Q) where P = softmax(baseline), Q = softmax(perturbed)
pub fn kl_divergence(baseline_logits: &[f32], perturbed_logits: &[f32]) -> f32 {
    let p = softmax(baseline_logits);
    let q = softmax(perturbed_logits);

    p.iter()
        .zip(q.iter())
        .filter(|(&pi, &qi)| pi > 1e-10 && qi > 1e-10)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum()
}

/// Score span logits against the predicted span and the unmasked logits
pub fn score_logits(
    kind: ScoreKind,
    logits: &SpanLogits,
    prelim: &PrelimResult,
    final_logits: &SpanLogits,
) -> f32 {
    let (s, e) = (prelim.start_index, prelim.end_index);
    match kind {
        ScoreKind::Probability => softmax(&logits.start)[s] * softmax(&logits.end)[e],
        ScoreKind::Logit => logits.start[s] + logits.end[e],
        ScoreKind::NegKl => -(kl_divergence(&final_logits.start, &logits.start)
            + kl_divergence(&final_logits.end, &logits.end)),
    }
}

/// Scoring function over active masks for one feature
pub struct MaskedSpanScorer<'a> {
    model: &'a QaModel,
    full_input_ids: Vec<u32>,
    type_ids: Vec<u32>,
    position_ids: Tensor,
    mask_token_id: u32,
    prelim: PrelimResult,
    final_logits: SpanLogits,
    kind: ScoreKind,
}

impl<'a> MaskedSpanScorer<'a> {
    pub fn new(
        model: &'a QaModel,
        feature: &QaFeature,
        prelim: PrelimResult,
        final_logits: SpanLogits,
        kind: ScoreKind,
    ) -> Result<Self> {
        anyhow::ensure!(
            final_logits.len() == feature.len(),
            "Got {} logits for a feature of {} tokens",
            final_logits.len(),
            feature.len()
        );
        let full_input_ids = feature.encoding.ids.clone();
        // Positions come from the unmasked input and never change
        let position_ids = model.position_ids(&full_input_ids)?;

        Ok(Self {
            model,
            full_input_ids,
            type_ids: feature.encoding.type_ids.clone(),
            position_ids,
            mask_token_id: model.mask_token_id()?,
            prelim,
            final_logits,
            kind,
        })
    }

    /// Number of maskable positions
    pub fn n_features(&self) -> usize {
        self.full_input_ids.len()
    }

    /// Input ids with inactive positions replaced by the mask token
    pub fn masked_input_ids(&self, active_mask: &[bool]) -> Result<Vec<u32>> {
        anyhow::ensure!(
            active_mask.len() == self.full_input_ids.len(),
            "Mask of length {} for {} tokens",
            active_mask.len(),
            self.full_input_ids.len()
        );
        Ok(self
            .full_input_ids
            .iter()
            .zip(active_mask)
            .map(|(&id, &active)| if active { id } else { self.mask_token_id })
            .collect())
    }

    /// Run the model on a masked variant and score it
    pub fn score(&self, active_mask: &[bool]) -> Result<f32> {
        let input_ids = self.masked_input_ids(active_mask)?;
        let logits = self
            .model
            .span_logits_with_ids(&input_ids, &self.type_ids, &self.position_ids)?;
        Ok(score_logits(self.kind, &logits, &self.prelim, &self.final_logits))
    }
}
