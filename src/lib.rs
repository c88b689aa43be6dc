// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // s, e, k, n standard in math
#![allow(clippy::similar_names)] // related variables like `start`/`starts`
#![allow(clippy::module_name_repetitions)] // QaModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! QA-SHAP: Shapley token attribution for extractive question answering
//!
//! Explains the answers of a BERT/RoBERTa QA model on SQuAD-style data by
//! masking input tokens and measuring how the predicted span's score
//! changes.
//!
//! ## Architecture
//!
//! - `squad`: SQuAD v1.1/v2.0 dataset loading
//! - `positioning`: Token/character offset bookkeeping for question/context pairs
//! - `features`: One-feature-per-example tokenization with truncation
//! - `masks`: Padding masks and fixed position ids for encoders
//! - `forward_encoder`: BERT/RoBERTa encoder with a span-prediction head
//! - `model`: High-level QaModel wrapper and checkpoint resolution
//! - `prediction`: N-best answer span search
//! - `metrics`: SQuAD exact match / F1
//! - `shapley`: Exact and permutation-sampling Shapley estimation
//! - `scoring`: Masked-input scoring of the predicted span
//! - `interp`: Per-example interpretation records on disk
//! - `visualize`: Word-level HTML heatmaps of attributions
//! - `experiment`: Attribution run coordinating the full pipeline

pub mod experiment;
pub mod features;
pub mod forward_encoder;
pub mod interp;
pub mod masks;
pub mod metrics;
pub mod model;
pub mod positioning;
pub mod prediction;
pub mod scoring;
pub mod shapley;
pub mod squad;
pub mod visualize;

pub use experiment::{ExampleOutcome, ExperimentResults, ShapExperiment, ShapExperimentConfig};
pub use features::{FeatureConfig, FeatureConverter, QaFeature};
pub use forward_encoder::{EncoderConfig, QaEncoder};
pub use interp::{dump_record, load_records, InterpRecord};
pub use masks::{create_attention_mask, create_position_ids};
pub use metrics::{evaluate, EvalResults};
pub use model::{CheckpointFiles, ModelArchitecture, QaBackend, QaModel};
pub use positioning::EncodingWithOffsets;
pub use prediction::{best_span, decode_prediction, Prediction, PredictionConfig, PrelimResult, SpanLogits};
pub use scoring::{kl_divergence, MaskedSpanScorer, ScoreKind};
pub use shapley::{run_shap_attribution, ShapConfig, ShapMethod, ShapResult, ShapStats};
pub use squad::{Answer, SquadDataset, SquadExample};
pub use visualize::{merge_tokens_into_words, visualize_dir, visualize_token_attributions, MergedWord};
