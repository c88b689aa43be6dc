//! Example: Attribute a single question/context pair
//!
//! Run with: cargo run --release --example attribute_one -- --cpu
//! Custom input: cargo run --release --example attribute_one -- --cpu \
//!     --question "Who sponsored Rust?" --context "Rust was sponsored by Mozilla."

use anyhow::Result;
use clap::Parser;
use qa_shap::interp::prepare_dir;
use qa_shap::{
    merge_tokens_into_words, FeatureConfig, FeatureConverter, QaModel, ScoreKind, ShapConfig,
    ShapExperiment, ShapExperimentConfig, ShapMethod, SquadExample,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "attribute_one")]
#[command(about = "Shapley attribution for one question/context pair")]
struct Args {
    /// Checkpoint directory or HuggingFace model ID
    #[arg(short, long, default_value = "deepset/roberta-base-squad2")]
    model: String,

    #[arg(long, default_value = "When was Rust first released?")]
    question: String,

    #[arg(
        long,
        default_value = "Rust is a systems programming language. It was first released in 2015."
    )]
    context: String,

    /// Shapley estimator: auto, exact or permutation
    #[arg(long, default_value = "auto")]
    method: ShapMethod,

    /// Number of sampled permutations
    #[arg(long, default_value_t = 20)]
    n_samples: usize,

    /// Directory for the interpretation record
    #[arg(long, default_value = "interpretations/demo")]
    interp_dir: PathBuf,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    println!("Loading model: {}", args.model);
    let model = QaModel::from_pretrained_with_device(&args.model, Some(args.cpu))?;

    let example = SquadExample {
        qas_id: "demo".to_string(),
        question: args.question,
        context: args.context,
        answers: Vec::new(),
        is_impossible: false,
    };

    let config = ShapExperimentConfig {
        interp_dir: args.interp_dir,
        shap: ShapConfig {
            method: args.method,
            n_samples: args.n_samples,
            ..Default::default()
        },
        score_kind: ScoreKind::Probability,
        ..Default::default()
    };
    prepare_dir(&config.interp_dir)?;
    let experiment = ShapExperiment::new(model, config);

    let mut converter =
        FeatureConverter::new(experiment.model().tokenizer(), FeatureConfig::default())?;
    let feature = converter.convert(&example, 0)?;
    let outcome = experiment.attribute_example(&example, &feature, 0)?;
    let record = &outcome.record;

    println!("\nQuestion:   {}", example.question);
    println!("Prediction: \"{}\"", record.prediction.text);
    println!(
        "Score: full {:.4}, empty {:.4} ({} via {}, {} evaluations)",
        record.full_score,
        record.empty_score,
        record.score_kind,
        record.shap_stats.method,
        record.shap_stats.evaluations
    );

    let mut words = merge_tokens_into_words(
        &feature.encoding,
        &record.attribution,
        &example.question,
        &example.context,
    );
    words.sort_by(|a, b| b.attribution.abs().total_cmp(&a.attribution.abs()));

    println!("\nTop words:");
    for word in words.iter().take(10) {
        println!("  {:>9.4}  {}", word.attribution, word.text);
    }
    println!("\nRecord saved to {}", outcome.path.display());

    Ok(())
}
