//! Integration tests for QA-SHAP
//!
//! Note: Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

use anyhow::Result;
use candle_core::{Device, Tensor};
use qa_shap::{
    load_records, visualize_dir, QaBackend, QaModel, ScoreKind, ShapConfig, ShapExperiment,
    ShapExperimentConfig, ShapMethod, SquadDataset,
};
use std::io::Write;
use tempfile::NamedTempFile;
use tokenizers::Tokenizer;

const TOKENIZER: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/fixtures/word_level_tokenizer.json"
);

/// Token ids from the fixture vocabulary
const ID_2015: u32 = 12;
const ID_MOZILLA: u32 = 25;
const ID_MASK: u32 = 4;

/// Span model that only ever looks at one token: wherever `target` is
/// visible, both start and end logits spike.
struct SpotlightBackend {
    target: u32,
}

impl QaBackend for SpotlightBackend {
    fn n_layers(&self) -> usize {
        1
    }

    fn d_model(&self) -> usize {
        8
    }

    fn vocab_size(&self) -> usize {
        27
    }

    fn n_heads(&self) -> usize {
        1
    }

    fn max_positions(&self) -> usize {
        512
    }

    fn padding_idx(&self) -> Option<u32> {
        None
    }

    fn forward_span_logits(
        &self,
        input_ids: &Tensor,
        _type_ids: &Tensor,
        _attention_mask: &Tensor,
        position_ids: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let ids: Vec<u32> = input_ids.flatten_all()?.to_vec1()?;
        let positions: Vec<u32> = position_ids.flatten_all()?.to_vec1()?;
        anyhow::ensure!(positions.len() == ids.len(), "position ids out of sync");

        let logits: Vec<f32> = ids
            .iter()
            .map(|&id| if id == self.target { 8.0 } else { 0.0 })
            .collect();
        let start = Tensor::new(&logits[..], input_ids.device())?.unsqueeze(0)?;
        let end = start.clone();
        Ok((start, end))
    }
}

fn spotlight_model(target: u32) -> QaModel {
    let tokenizer = Tokenizer::from_file(TOKENIZER).unwrap();
    QaModel::from_parts(
        Box::new(SpotlightBackend { target }),
        tokenizer,
        Device::Cpu,
        "spotlight",
    )
}

fn write_dataset(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{json}").unwrap();
    file
}

const DATASET: &str = r#"{
    "version": "1.1",
    "data": [{
        "title": "Rust",
        "paragraphs": [
            {
                "context": "Rust was first released in 2015.",
                "qas": [{"id": "rust-year", "question": "When was Rust released?",
                         "answers": [{"text": "2015", "answer_start": 27}]}]
            },
            {
                "context": "Mozilla.",
                "qas": [{"id": "rust-sponsor", "question": "Who sponsored it?",
                         "answers": [{"text": "Mozilla", "answer_start": 0}]}]
            }
        ]
    }]
}"#;

/// Test dataset loading from JSON
#[test]
fn test_dataset_loading() {
    let file = write_dataset(DATASET);
    let dataset = SquadDataset::load(file.path()).unwrap();
    assert_eq!(dataset.len(), 2);
    assert_eq!(dataset.examples()[1].qas_id, "rust-sponsor");
    assert_eq!(dataset.impossible_count(), 0);
}

/// Test missing dataset file
#[test]
fn test_dataset_missing_file() {
    assert!(SquadDataset::load("does/not/exist.json").is_err());
}

/// Test experiment config defaults
#[test]
fn test_experiment_config_defaults() {
    let config = ShapExperimentConfig::default();
    assert_eq!(config.feature.max_seq_length, 384);
    assert_eq!(config.shap.seed, 42);
    assert_eq!(config.shap.method, ShapMethod::Auto);
}

/// Masked ids keep active positions and hide the rest
#[test]
fn test_masked_input_ids() {
    let model = spotlight_model(ID_2015);
    assert_eq!(model.mask_token_id().unwrap(), ID_MASK);
    assert_eq!(model.pad_token_id(), Some(0));

    let mut dataset = SquadDataset::from_json(DATASET).unwrap();
    dataset.truncate(1);
    let mut converter =
        qa_shap::FeatureConverter::new(model.tokenizer(), qa_shap::FeatureConfig::default())
            .unwrap();
    let feature = converter.convert(&dataset.examples()[0], 0).unwrap();
    let logits = model.span_logits(&feature).unwrap();
    let prelim = qa_shap::best_span(&feature, 0, &logits, &Default::default()).unwrap();

    let scorer =
        qa_shap::MaskedSpanScorer::new(&model, &feature, prelim, logits, ScoreKind::Logit)
            .unwrap();
    let mut mask = vec![true; feature.len()];
    mask[1] = false;
    let ids = scorer.masked_input_ids(&mask).unwrap();
    assert_eq!(ids[1], ID_MASK);
    assert_eq!(ids[2], feature.encoding.ids[2]);

    // Wrong mask length is rejected
    assert!(scorer.score(&mask[..3]).is_err());
    // Hiding the answer token removes its logit bonus
    assert!((scorer.score(&vec![true; feature.len()]).unwrap() - 16.0).abs() < 1e-6);
    assert!(scorer.score(&vec![false; feature.len()]).unwrap().abs() < 1e-6);
}

/// Full pipeline: predict, attribute, persist, evaluate, visualize
#[test]
fn test_attribution_pipeline() {
    let file = write_dataset(DATASET);
    let tmp = tempfile::tempdir().unwrap();
    let interp_dir = tmp.path().join("interp");
    let visual_dir = tmp.path().join("vis");

    let config = ShapExperimentConfig {
        predict_file: file.path().to_path_buf(),
        interp_dir: interp_dir.clone(),
        shap: ShapConfig {
            n_samples: 6,
            ..Default::default()
        },
        max_examples: Some(1),
        ..Default::default()
    };
    let experiment = ShapExperiment::new(spotlight_model(ID_2015), config);
    let results = experiment.run().unwrap();

    assert_eq!(results.predictions["rust-year"].text, "2015");
    assert_eq!(results.eval.total, 1);
    assert!((results.eval.exact - 100.0).abs() < 1e-9);

    let records = load_records(&interp_dir).unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.attribution.len(), record.feature.len());
    // 15 tokens > max_exact_features, so sampling was used
    assert_eq!(record.shap_stats.method, ShapMethod::Permutation);

    // Only the answer token carries attribution
    let answer_token = record.prelim_result.start_index;
    assert_eq!(record.feature.tokens()[answer_token], "2015");
    for (i, a) in record.attribution.iter().enumerate() {
        if i == answer_token {
            assert!(*a > 0.9);
        } else {
            assert!(a.abs() < 1e-6, "token {i} got {a}");
        }
    }
    let total: f32 = record.attribution.iter().sum();
    assert!((total - (record.full_score - record.empty_score)).abs() < 1e-5);

    let rendered = visualize_dir(&interp_dir, &visual_dir).unwrap();
    assert_eq!(rendered, 1);
    assert!(visual_dir.join("index.html").is_file());
    assert!(visual_dir.join("0-rust-year.html").is_file());
}

/// Short features are attributed exactly
#[test]
fn test_exact_attribution_on_short_feature() {
    let dataset = SquadDataset::from_json(DATASET).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let config = ShapExperimentConfig {
        interp_dir: tmp.path().to_path_buf(),
        score_kind: ScoreKind::Logit,
        ..Default::default()
    };
    let experiment = ShapExperiment::new(spotlight_model(ID_MOZILLA), config);

    let mut converter = qa_shap::FeatureConverter::new(
        experiment.model().tokenizer(),
        qa_shap::FeatureConfig::default(),
    )
    .unwrap();
    let example = &dataset.examples()[1];
    let feature = converter.convert(example, 1).unwrap();
    // [CLS] who sponsored it ? [SEP] mozilla . [SEP]
    assert_eq!(feature.len(), 9);

    let outcome = experiment.attribute_example(example, &feature, 1).unwrap();
    assert!(outcome.path.ends_with("1-rust-sponsor.json"));
    assert_eq!(outcome.record.shap_stats.method, ShapMethod::Exact);
    assert_eq!(outcome.record.shap_stats.evaluations, 1 << 9);
    assert_eq!(outcome.record.prediction.text, "Mozilla");
    assert!((outcome.record.attribution[6] - 16.0).abs() < 1e-4);
}

/// Answers after non-ASCII text keep character positions
#[test]
fn test_multibyte_context_positions() {
    let json = r#"{"data": [{"paragraphs": [{
        "context": "Café rust was released in 2015.",
        "qas": [{"id": "cafe", "question": "When was rust released?",
                 "answers": [{"text": "2015", "answer_start": 26}]}]
    }]}]}"#;
    let dataset = SquadDataset::from_json(json).unwrap();
    let example = &dataset.examples()[0];
    let tmp = tempfile::tempdir().unwrap();
    let config = ShapExperimentConfig {
        interp_dir: tmp.path().to_path_buf(),
        shap: ShapConfig {
            method: ShapMethod::Permutation,
            n_samples: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let experiment = ShapExperiment::new(spotlight_model(ID_2015), config);

    let mut converter = qa_shap::FeatureConverter::new(
        experiment.model().tokenizer(),
        qa_shap::FeatureConfig::default(),
    )
    .unwrap();
    let feature = converter.convert(example, 0).unwrap();
    let gold = feature
        .encoding
        .char_to_token(&example.context, example.answers[0].answer_start)
        .unwrap();
    assert_eq!(feature.tokens()[gold], "2015");

    let outcome = experiment.attribute_example(example, &feature, 0).unwrap();
    assert_eq!(outcome.record.prelim_result.start_index, gold);
    assert_eq!(outcome.record.prediction.text, "2015");
    assert_eq!(outcome.record.prediction.char_range, Some((26, 30)));
}

/// Forcing exact enumeration on long inputs fails before anything is written
#[test]
fn test_exact_method_rejects_long_inputs_up_front() {
    let json = r#"{"data": [{"paragraphs": [{
        "context": "rust was first released in 2015 . it is a fast language sponsored by mozilla and it is what the first language was in 2015 .",
        "qas": [{"id": "long", "question": "When was rust released?",
                 "answers": [{"text": "2015", "answer_start": 27}]}]
    }]}]}"#;
    let dataset = SquadDataset::from_json(json).unwrap();
    let tmp = tempfile::tempdir().unwrap();
    let interp_dir = tmp.path().join("interp");
    let config = ShapExperimentConfig {
        interp_dir: interp_dir.clone(),
        shap: ShapConfig {
            method: ShapMethod::Exact,
            ..Default::default()
        },
        ..Default::default()
    };
    let experiment = ShapExperiment::new(spotlight_model(ID_2015), config);

    let err = experiment.run_dataset(&dataset).unwrap_err();
    assert!(format!("{err:#}").contains("infeasible"));
    assert!(!interp_dir.exists());
}

/// Model-dependent test: checkpoint loading
#[test]
#[ignore = "requires model download"]
fn test_model_loading() {
    let model = QaModel::from_pretrained_with_device("deepset/roberta-base-squad2", Some(true))
        .unwrap();
    assert_eq!(model.n_layers(), 12);
    assert_eq!(model.d_model(), 768);
    assert!(model.mask_token_id().is_ok());
}
