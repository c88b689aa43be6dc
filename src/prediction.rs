//! N-best answer span search over start/end logits

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::features::QaFeature;
use crate::squad::SquadExample;

/// Start and end logits of a single feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLogits {
    pub start: Vec<f32>,
    pub end: Vec<f32>,
}

impl SpanLogits {
    /// Extract logits from `[1, seq]` (or `[seq]`) tensors
    pub fn from_tensors(start: &Tensor, end: &Tensor) -> Result<Self> {
        let start: Vec<f32> = start.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let end: Vec<f32> = end.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        anyhow::ensure!(
            start.len() == end.len(),
            "start ({}) and end ({}) logits differ in length",
            start.len(),
            end.len()
        );
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        self.start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.start.is_empty()
    }
}

/// Best span in token space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrelimResult {
    pub feature_index: usize,
    pub start_index: usize,
    pub end_index: usize,
    pub start_logit: f32,
    pub end_logit: f32,
}

impl PrelimResult {
    /// Whether this result points at the null answer (CLS)
    pub fn is_null(&self) -> bool {
        self.start_index == 0 && self.end_index == 0
    }

    pub fn score(&self) -> f32 {
        self.start_logit + self.end_logit
    }
}

/// Predicted answer text for an example
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub qas_id: String,
    pub text: String,
    /// Character range in the context (None for the null answer)
    pub char_range: Option<(usize, usize)>,
    pub score: f32,
}

/// Configuration for span search
#[derive(Debug, Clone, Copy)]
pub struct PredictionConfig {
    /// Candidates considered for both start and end
    pub n_best_size: usize,
    /// Maximum span length in tokens
    pub max_answer_length: usize,
    /// Allow the null answer (SQuAD v2)
    pub version_2_with_negative: bool,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            n_best_size: 20,
            max_answer_length: 30,
            version_2_with_negative: false,
        }
    }
}

/// Indices of the `n` largest values, highest first
fn top_indices(values: &[f32], n: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..values.len()).collect();
    indices.sort_by(|&a, &b| values[b].total_cmp(&values[a]).then(a.cmp(&b)));
    indices.truncate(n);
    indices
}

/// Find the best answer span for one feature
pub fn best_span(
    feature: &QaFeature,
    feature_index: usize,
    logits: &SpanLogits,
    config: &PredictionConfig,
) -> Result<PrelimResult> {
    anyhow::ensure!(
        logits.len() == feature.len(),
        "Got {} logits for a feature of {} tokens",
        logits.len(),
        feature.len()
    );
    anyhow::ensure!(!logits.is_empty(), "Empty feature");

    let encoding = &feature.encoding;
    let mut best: Option<PrelimResult> = None;

    for &start in &top_indices(&logits.start, config.n_best_size) {
        for &end in &top_indices(&logits.end, config.n_best_size) {
            if !encoding.is_context(start) || !encoding.is_context(end) {
                continue;
            }
            if end < start || end - start + 1 > config.max_answer_length {
                continue;
            }
            let candidate = PrelimResult {
                feature_index,
                start_index: start,
                end_index: end,
                start_logit: logits.start[start],
                end_logit: logits.end[end],
            };
            if best.is_none_or(|b| candidate.score() > b.score()) {
                best = Some(candidate);
            }
        }
    }

    let null = PrelimResult {
        feature_index,
        start_index: 0,
        end_index: 0,
        start_logit: logits.start[0],
        end_logit: logits.end[0],
    };

    Ok(match best {
        Some(b) if !config.version_2_with_negative || b.score() >= null.score() => b,
        _ => null,
    })
}

/// Turn a prelim result into answer text sliced out of the context
pub fn decode_prediction(
    example: &SquadExample,
    feature: &QaFeature,
    prelim: &PrelimResult,
) -> Prediction {
    let byte_range = if prelim.is_null() {
        None
    } else {
        feature
            .encoding
            .token_span_to_byte_range(prelim.start_index, prelim.end_index)
    };
    let text = byte_range
        .and_then(|(s, e)| example.context.get(s..e))
        .unwrap_or_default()
        .to_string();
    let char_range = byte_range.and_then(|_| {
        feature.encoding.token_span_to_char_range(
            &example.context,
            prelim.start_index,
            prelim.end_index,
        )
    });

    Prediction {
        qas_id: example.qas_id.clone(),
        text,
        char_range,
        score: prelim.score(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positioning::EncodingWithOffsets;

    /// `[CLS] when ? [SEP] rust was released in 2015 [SEP]`
    fn feature() -> (SquadExample, QaFeature) {
        let example = SquadExample {
            qas_id: "q1".into(),
            question: "when?".into(),
            context: "rust was released in 2015".into(),
            answers: vec![],
            is_impossible: false,
        };
        let encoding = EncodingWithOffsets::new(
            vec![2, 5, 9, 3, 7, 6, 8, 11, 12, 3],
            vec![0, 0, 0, 0, 1, 1, 1, 1, 1, 1],
            ["[CLS]", "when", "?", "[SEP]", "rust", "was", "released", "in", "2015", "[SEP]"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            vec![
                (0, 0),
                (0, 4),
                (4, 5),
                (0, 0),
                (0, 4),
                (5, 8),
                (9, 17),
                (18, 20),
                (21, 25),
                (0, 0),
            ],
            vec![
                None,
                Some(0),
                Some(0),
                None,
                Some(1),
                Some(1),
                Some(1),
                Some(1),
                Some(1),
                None,
            ],
        );
        let feature = QaFeature {
            unique_id: 1,
            example_index: 0,
            qas_id: "q1".into(),
            encoding,
            truncated: false,
        };
        (example, feature)
    }

    fn logits(start_hot: usize, end_hot: usize) -> SpanLogits {
        let mut start = vec![0.0; 10];
        let mut end = vec![0.0; 10];
        start[start_hot] = 5.0;
        end[end_hot] = 5.0;
        SpanLogits { start, end }
    }

    #[test]
    fn test_best_span_in_context() {
        let (example, feature) = feature();
        let prelim = best_span(&feature, 0, &logits(7, 8), &PredictionConfig::default()).unwrap();
        assert_eq!((prelim.start_index, prelim.end_index), (7, 8));

        let prediction = decode_prediction(&example, &feature, &prelim);
        assert_eq!(prediction.text, "in 2015");
        assert_eq!(prediction.char_range, Some((18, 25)));
    }

    #[test]
    fn test_question_tokens_are_skipped() {
        let (_, feature) = feature();
        // Highest start lands in the question; must fall back to a context span
        let mut l = logits(1, 8);
        l.start[8] = 4.0;
        let prelim = best_span(&feature, 0, &l, &PredictionConfig::default()).unwrap();
        assert_eq!((prelim.start_index, prelim.end_index), (8, 8));
    }

    #[test]
    fn test_max_answer_length() {
        let (_, feature) = feature();
        let config = PredictionConfig {
            max_answer_length: 2,
            ..Default::default()
        };
        let mut l = logits(4, 8);
        l.end[5] = 1.0;
        let prelim = best_span(&feature, 0, &l, &config).unwrap();
        assert_eq!((prelim.start_index, prelim.end_index), (4, 5));
    }

    #[test]
    fn test_null_answer_v2() {
        let (example, feature) = feature();
        let mut l = logits(0, 0);
        l.start[0] = 10.0;
        l.end[0] = 10.0;
        l.start[6] = 1.0;
        l.end[6] = 1.0;
        let config = PredictionConfig {
            version_2_with_negative: true,
            ..Default::default()
        };
        let prelim = best_span(&feature, 0, &l, &config).unwrap();
        assert!(prelim.is_null());
        assert_eq!(decode_prediction(&example, &feature, &prelim).text, "");

        // Without v2 the best non-null span wins
        let prelim = best_span(&feature, 0, &l, &PredictionConfig::default()).unwrap();
        assert_eq!((prelim.start_index, prelim.end_index), (6, 6));
    }

    #[test]
    fn test_length_mismatch() {
        let (_, feature) = feature();
        let l = SpanLogits {
            start: vec![0.0; 3],
            end: vec![0.0; 3],
        };
        assert!(best_span(&feature, 0, &l, &PredictionConfig::default()).is_err());
    }
}
