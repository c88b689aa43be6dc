//! QA-SHAP CLI: Shapley token attribution for extractive QA

use anyhow::Result;
use clap::Parser;
use qa_shap::{
    visualize_dir, FeatureConfig, PredictionConfig, QaModel, ScoreKind, ShapConfig,
    ShapExperiment, ShapExperimentConfig, ShapMethod,
};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "qa-shap")]
#[command(about = "Shapley token attribution for extractive question answering")]
#[command(version)]
struct Cli {
    /// Checkpoint directory or `HuggingFace` model id (e.g. "deepset/roberta-base-squad2")
    #[arg(short, long, default_value = "deepset/roberta-base-squad2")]
    model: String,

    /// SQuAD-style JSON file to explain
    #[arg(short, long, default_value = "data/dev-v1.1.json")]
    predict_file: PathBuf,

    /// Directory for per-example interpretation records
    #[arg(long, default_value = "interpretations/shap")]
    interp_dir: PathBuf,

    /// Directory for rendered visualizations
    #[arg(long, default_value = "visualizations/shap")]
    visual_dir: PathBuf,

    /// Only render visualizations from existing interpretation records
    #[arg(long)]
    do_vis: bool,

    /// Maximum tokens per feature (question + context + special tokens)
    #[arg(long, default_value_t = 384)]
    max_seq_length: usize,

    /// Maximum question tokens
    #[arg(long, default_value_t = 64)]
    max_query_length: usize,

    /// Start/end candidates considered during span search
    #[arg(long, default_value_t = 20)]
    n_best_size: usize,

    /// Maximum answer length in tokens
    #[arg(long, default_value_t = 30)]
    max_answer_length: usize,

    /// Allow the null answer (SQuAD v2)
    #[arg(long)]
    version_2_with_negative: bool,

    /// Shapley estimator: auto, exact (inputs of at most 20 tokens) or permutation
    #[arg(long, default_value = "auto")]
    method: ShapMethod,

    /// Number of sampled permutations
    #[arg(long, default_value_t = 100)]
    n_samples: usize,

    /// Largest token count attributed exactly in auto mode
    #[arg(long, default_value_t = 10)]
    max_exact_features: usize,

    /// Disable antithetic (forward/reverse) permutation pairs
    #[arg(long)]
    no_antithetic: bool,

    /// Masked-query score: probability, logit or neg-kl
    #[arg(long, default_value = "probability")]
    score: ScoreKind,

    /// Random seed for reproducibility
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Stop after this many examples
    #[arg(long)]
    max_examples: Option<usize>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if cli.do_vis {
        println!("=== QA-SHAP: visualization ===");
        println!("Interpretations: {}", cli.interp_dir.display());
        println!("Output:          {}", cli.visual_dir.display());
        let count = visualize_dir(&cli.interp_dir, &cli.visual_dir)?;
        println!("Rendered {count} examples");
        return Ok(());
    }

    let shap = ShapConfig {
        method: cli.method,
        n_samples: cli.n_samples,
        max_exact_features: cli.max_exact_features,
        seed: cli.seed,
        antithetic: !cli.no_antithetic,
    };
    shap.validate()?;

    println!("=== QA-SHAP: Shapley attribution ===");
    println!("Model:   {}", cli.model);
    println!("Data:    {}", cli.predict_file.display());
    println!("Output:  {}", cli.interp_dir.display());
    println!("Method:  {} ({} samples), score: {}", shap.method, shap.n_samples, cli.score);
    if cli.cpu {
        println!("Mode:    CPU (forced)");
    }

    // Load model
    info!("Loading model...");
    let model = QaModel::from_pretrained_with_device(&cli.model, Some(cli.cpu))?;
    info!(
        "Model: {} layers, {} hidden, {} heads",
        model.n_layers(),
        model.d_model(),
        model.n_heads()
    );

    let config = ShapExperimentConfig {
        predict_file: cli.predict_file,
        interp_dir: cli.interp_dir.clone(),
        feature: FeatureConfig {
            max_seq_length: cli.max_seq_length,
            max_query_length: cli.max_query_length,
        },
        prediction: PredictionConfig {
            n_best_size: cli.n_best_size,
            max_answer_length: cli.max_answer_length,
            version_2_with_negative: cli.version_2_with_negative,
        },
        shap,
        score_kind: cli.score,
        max_examples: cli.max_examples,
    };

    let experiment = ShapExperiment::new(model, config);
    let results = experiment.run()?;

    // Print results
    println!("\n=== Results ===");
    println!("Examples:    {}", results.eval.total);
    println!("Exact match: {:.2}", results.eval.exact);
    println!("F1:          {:.2}", results.eval.f1);
    if results.eval.no_ans_total > 0 {
        println!(
            "HasAns EM/F1: {:.2}/{:.2} ({}), NoAns EM: {:.2} ({})",
            results.eval.has_ans_exact,
            results.eval.has_ans_f1,
            results.eval.has_ans_total,
            results.eval.no_ans_exact,
            results.eval.no_ans_total
        );
    }
    println!("Time:        {:.1}s", results.elapsed_secs);

    // Save results
    let eval_path = cli.interp_dir.join("eval_results.json");
    std::fs::write(&eval_path, serde_json::to_string_pretty(&results.eval)?)?;
    let predictions: std::collections::BTreeMap<&str, &str> = results
        .predictions
        .iter()
        .map(|(id, p)| (id.as_str(), p.text.as_str()))
        .collect();
    let predictions_path = cli.interp_dir.join("predictions.json");
    std::fs::write(&predictions_path, serde_json::to_string_pretty(&predictions)?)?;
    info!(
        "Results saved to {} and {}",
        eval_path.display(),
        predictions_path.display()
    );

    Ok(())
}
