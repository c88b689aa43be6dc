//! Attribution run over a SQuAD-style dataset
//!
//! Coordinates dataset loading, feature conversion, span prediction,
//! Shapley estimation and persistence. Examples are processed one at a time
//! (batch size 1) and every record is written as soon as it is computed.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info};

use crate::features::{FeatureConfig, FeatureConverter, QaFeature};
use crate::interp::{dump_record, prepare_dir, InterpRecord};
use crate::metrics::{evaluate, EvalResults};
use crate::model::QaModel;
use crate::prediction::{best_span, decode_prediction, Prediction, PredictionConfig};
use crate::scoring::{MaskedSpanScorer, ScoreKind};
use crate::shapley::{run_shap_attribution, ShapConfig};
use crate::squad::{SquadDataset, SquadExample};

/// Configuration for an attribution run
#[derive(Debug, Clone)]
pub struct ShapExperimentConfig {
    /// Path to the SQuAD JSON file
    pub predict_file: PathBuf,
    /// Directory receiving one record per example
    pub interp_dir: PathBuf,
    pub feature: FeatureConfig,
    pub prediction: PredictionConfig,
    pub shap: ShapConfig,
    pub score_kind: ScoreKind,
    /// Stop after this many examples (None = all)
    pub max_examples: Option<usize>,
}

impl Default for ShapExperimentConfig {
    fn default() -> Self {
        Self {
            predict_file: PathBuf::from("data/dev-v1.1.json"),
            interp_dir: PathBuf::from("interpretations/shap"),
            feature: FeatureConfig::default(),
            prediction: PredictionConfig::default(),
            shap: ShapConfig::default(),
            score_kind: ScoreKind::Probability,
            max_examples: None,
        }
    }
}

/// Results from a full attribution run
#[derive(Debug)]
pub struct ExperimentResults {
    /// Predictions keyed by question id
    pub predictions: HashMap<String, Prediction>,
    pub eval: EvalResults,
    /// Wall-clock seconds for the whole run
    pub elapsed_secs: f64,
}

/// Outcome of attributing a single example
#[derive(Debug)]
pub struct ExampleOutcome {
    pub record: InterpRecord,
    pub path: PathBuf,
}

/// Main experiment runner
pub struct ShapExperiment {
    config: ShapExperimentConfig,
    model: QaModel,
}

impl ShapExperiment {
    /// Create a new experiment
    pub fn new(model: QaModel, config: ShapExperimentConfig) -> Self {
        Self { config, model }
    }

    pub fn model(&self) -> &QaModel {
        &self.model
    }

    /// Load the dataset and run attribution over it
    pub fn run(&self) -> Result<ExperimentResults> {
        let mut dataset = SquadDataset::load(&self.config.predict_file)?;
        if let Some(limit) = self.config.max_examples {
            dataset.truncate(limit);
        }
        self.run_dataset(&dataset)
    }

    /// Run attribution over an already loaded dataset
    pub fn run_dataset(&self, dataset: &SquadDataset) -> Result<ExperimentResults> {
        info!("Starting Shapley attribution run");
        info!("Config: {:?}", self.config);
        self.config.shap.validate()?;

        let mut converter = FeatureConverter::new(self.model.tokenizer(), self.config.feature)?;
        let features = dataset
            .examples()
            .iter()
            .enumerate()
            .map(|(index, example)| converter.convert(example, index))
            .collect::<Result<Vec<_>>>()?;
        for feature in &features {
            self.config
                .shap
                .ensure_feasible(feature.len())
                .with_context(|| format!("Example {} has {} tokens", feature.qas_id, feature.len()))?;
        }
        prepare_dir(&self.config.interp_dir)?;

        info!("***** Running attribution *****");
        info!("  Num examples = {}", dataset.len());
        info!("  Batch size = 1");

        let start = Instant::now();
        let mut predictions = HashMap::with_capacity(dataset.len());

        for (index, (example, feature)) in dataset.examples().iter().zip(&features).enumerate() {
            let outcome = self
                .attribute_example(example, feature, index)
                .with_context(|| format!("Attribution failed for example {}", example.qas_id))?;

            info!(
                "[{}/{}] {}: \"{}\" ({} tokens, {} evaluations)",
                index + 1,
                dataset.len(),
                example.qas_id,
                outcome.record.prediction.text,
                feature.len(),
                outcome.record.shap_stats.evaluations
            );

            predictions.insert(example.qas_id.clone(), outcome.record.prediction);
        }

        let elapsed_secs = start.elapsed().as_secs_f64();
        let per_example = if dataset.is_empty() {
            0.0
        } else {
            elapsed_secs / dataset.len() as f64
        };
        info!(
            "  Attribution done in total {:.3} secs ({:.3} sec per example)",
            elapsed_secs, per_example
        );

        let eval = evaluate(dataset.examples(), &predictions);
        info!(
            "Exact match {:.2}, F1 {:.2} over {} examples",
            eval.exact, eval.f1, eval.total
        );

        Ok(ExperimentResults {
            predictions,
            eval,
            elapsed_secs,
        })
    }

    /// Predict, attribute and persist a single example
    pub fn attribute_example(
        &self,
        example: &SquadExample,
        feature: &QaFeature,
        feature_index: usize,
    ) -> Result<ExampleOutcome> {
        let final_logits = self.model.span_logits(feature)?;
        let prelim = best_span(feature, feature_index, &final_logits, &self.config.prediction)?;
        let prediction = decode_prediction(example, feature, &prelim);
        debug!(
            "Prediction for {}: tokens {}..={} \"{}\"",
            example.qas_id, prelim.start_index, prelim.end_index, prediction.text
        );

        let scorer = MaskedSpanScorer::new(
            &self.model,
            feature,
            prelim,
            final_logits,
            self.config.score_kind,
        )?;
        let shap = run_shap_attribution(scorer.n_features(), &self.config.shap, |mask| {
            scorer.score(mask)
        })?;

        let record = InterpRecord {
            example: example.clone(),
            feature: feature.clone(),
            prediction,
            prelim_result: prelim,
            attribution: shap.attributions,
            score_kind: self.config.score_kind,
            full_score: shap.full_score,
            empty_score: shap.empty_score,
            shap_stats: shap.stats,
        };
        let path = dump_record(&self.config.interp_dir, record.clone())?;

        Ok(ExampleOutcome { record, path })
    }
}
