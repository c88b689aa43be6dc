//! Shapley value estimation over token masks
//!
//! Treats a model as a black-box set function: `score_fn` receives an
//! "active" mask (true = token kept) and returns a scalar. The Shapley value
//! of token `i` is its average marginal contribution over all orderings in
//! which tokens can be switched on.
//!
//! Two estimators:
//!
//! - **Exact**: enumerates all `2^n` coalitions and weights each marginal
//!   contribution by `|S|! (n - |S| - 1)! / n!`. Only viable for small `n`.
//! - **Permutation sampling**: walks sampled permutations from the empty to
//!   the full coalition and credits each token with the score change it
//!   causes. Each walk telescopes to `f(all) - f(none)`, so the efficiency
//!   property holds exactly for every sample count. With `antithetic`
//!   sampling every permutation is followed by its reverse.
//!
//! Coalition scores are memoized, so a mask is never sent to the model twice.

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Hard cap for exact enumeration (2^20 model queries)
pub const MAX_EXACT_FEATURES: usize = 20;

/// Estimation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapMethod {
    /// Exact when `n <= max_exact_features`, permutation sampling otherwise
    Auto,
    /// All `2^n` coalitions; only for inputs of at most 20 tokens
    Exact,
    Permutation,
}

impl FromStr for ShapMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "exact" => Ok(Self::Exact),
            "permutation" | "sampling" => Ok(Self::Permutation),
            other => anyhow::bail!("Unknown Shapley method '{other}' (auto, exact, permutation)"),
        }
    }
}

impl fmt::Display for ShapMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Exact => "exact",
            Self::Permutation => "permutation",
        };
        f.write_str(name)
    }
}

/// Configuration for Shapley estimation
#[derive(Debug, Clone, Copy)]
pub struct ShapConfig {
    pub method: ShapMethod,
    /// Number of sampled permutations (permutation method)
    pub n_samples: usize,
    /// Largest feature count handled exactly by `Auto`
    pub max_exact_features: usize,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Pair every sampled permutation with its reverse
    pub antithetic: bool,
}

impl Default for ShapConfig {
    fn default() -> Self {
        Self {
            method: ShapMethod::Auto,
            n_samples: 100,
            max_exact_features: 10,
            seed: 42,
            antithetic: true,
        }
    }
}

impl ShapConfig {
    /// Method actually used for `n_features`
    pub fn resolve_method(&self, n_features: usize) -> ShapMethod {
        match self.method {
            ShapMethod::Auto if n_features <= self.max_exact_features.min(MAX_EXACT_FEATURES) => {
                ShapMethod::Exact
            }
            ShapMethod::Auto => ShapMethod::Permutation,
            other => other,
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.n_samples > 0, "n_samples must be positive");
        anyhow::ensure!(
            self.max_exact_features <= MAX_EXACT_FEATURES,
            "max_exact_features {} exceeds the limit of {}",
            self.max_exact_features,
            MAX_EXACT_FEATURES
        );
        Ok(())
    }

    /// Fail when `n_features` resolves to exact enumeration beyond the cap
    pub fn ensure_feasible(&self, n_features: usize) -> Result<()> {
        anyhow::ensure!(
            self.resolve_method(n_features) != ShapMethod::Exact
                || n_features <= MAX_EXACT_FEATURES,
            "Exact Shapley over {n_features} features is infeasible (limit {MAX_EXACT_FEATURES}); \
             use --method auto or permutation"
        );
        Ok(())
    }
}

/// Bookkeeping for one estimation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapStats {
    pub method: ShapMethod,
    /// Distinct coalitions sent to `score_fn`
    pub evaluations: usize,
    /// Coalition lookups answered from the memo
    pub cache_hits: usize,
    /// Permutations walked (0 for exact)
    pub permutations: usize,
}

/// Attributions plus the scores of the two extreme coalitions
#[derive(Debug, Clone)]
pub struct ShapResult {
    /// One value per feature
    pub attributions: Vec<f32>,
    /// Score with every feature active
    pub full_score: f32,
    /// Score with every feature inactive
    pub empty_score: f32,
    pub stats: ShapStats,
}

impl ShapResult {
    /// Sum of all attributions (equals `full_score - empty_score`)
    pub fn total(&self) -> f32 {
        self.attributions.iter().sum()
    }
}

/// Fixed-size bit set identifying a coalition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Coalition {
    words: Vec<u64>,
}

impl Coalition {
    fn empty(n: usize) -> Self {
        Self {
            words: vec![0; n.div_ceil(64)],
        }
    }

    fn from_index(index: u64, n: usize) -> Self {
        let mut coalition = Self::empty(n);
        if n > 0 {
            coalition.words[0] = index;
        }
        coalition
    }

    fn insert(&mut self, i: usize) {
        self.words[i / 64] |= 1 << (i % 64);
    }

    fn to_mask(&self, n: usize) -> Vec<bool> {
        (0..n)
            .map(|i| self.words[i / 64] & (1 << (i % 64)) != 0)
            .collect()
    }
}

/// Memoizing wrapper around the user's scoring function
struct CoalitionScorer<F> {
    score_fn: F,
    n_features: usize,
    cache: HashMap<Coalition, f64>,
    cache_hits: usize,
}

impl<F> CoalitionScorer<F>
where
    F: FnMut(&[bool]) -> Result<f32>,
{
    fn new(score_fn: F, n_features: usize) -> Self {
        Self {
            score_fn,
            n_features,
            cache: HashMap::new(),
            cache_hits: 0,
        }
    }

    fn score(&mut self, coalition: &Coalition) -> Result<f64> {
        if let Some(&cached) = self.cache.get(coalition) {
            self.cache_hits += 1;
            return Ok(cached);
        }
        let mask = coalition.to_mask(self.n_features);
        let value = f64::from((self.score_fn)(&mask)?);
        self.cache.insert(coalition.clone(), value);
        Ok(value)
    }

    fn full(&mut self) -> Result<f64> {
        let mut all = Coalition::empty(self.n_features);
        for i in 0..self.n_features {
            all.insert(i);
        }
        self.score(&all)
    }

    fn stats(&self, method: ShapMethod, permutations: usize) -> ShapStats {
        ShapStats {
            method,
            evaluations: self.cache.len(),
            cache_hits: self.cache_hits,
            permutations,
        }
    }
}

/// Shapley weights `w(k) = k! (n-k-1)! / n!` for `k = 0..n`
fn shapley_weights(n: usize) -> Vec<f64> {
    // w(k) = 1 / (n * C(n-1, k)), with C built incrementally
    let mut weights = Vec::with_capacity(n);
    let mut binom = 1.0_f64;
    for k in 0..n {
        weights.push(1.0 / (n as f64 * binom));
        binom = binom * (n - 1 - k) as f64 / (k + 1) as f64;
    }
    weights
}

/// Estimate per-feature Shapley values of `score_fn` over `n_features` features
pub fn run_shap_attribution<F>(
    n_features: usize,
    config: &ShapConfig,
    score_fn: F,
) -> Result<ShapResult>
where
    F: FnMut(&[bool]) -> Result<f32>,
{
    config.validate()?;
    config.ensure_feasible(n_features)?;
    let method = config.resolve_method(n_features);

    if n_features == 0 {
        return Ok(ShapResult {
            attributions: Vec::new(),
            full_score: 0.0,
            empty_score: 0.0,
            stats: ShapStats {
                method,
                evaluations: 0,
                cache_hits: 0,
                permutations: 0,
            },
        });
    }

    let mut scorer = CoalitionScorer::new(score_fn, n_features);
    let (attributions, permutations) = match method {
        ShapMethod::Exact => (exact_shapley(&mut scorer)?, 0),
        _ => permutation_shapley(&mut scorer, config)?,
    };

    let empty_score = scorer.score(&Coalition::empty(n_features))?;
    let full_score = scorer.full()?;
    let stats = scorer.stats(method, permutations);

    debug!(
        "Shapley ({}) over {} features: {} evaluations, {} cache hits",
        method, n_features, stats.evaluations, stats.cache_hits
    );

    Ok(ShapResult {
        attributions: attributions.into_iter().map(|v| v as f32).collect(),
        full_score: full_score as f32,
        empty_score: empty_score as f32,
        stats,
    })
}

fn exact_shapley<F>(scorer: &mut CoalitionScorer<F>) -> Result<Vec<f64>>
where
    F: FnMut(&[bool]) -> Result<f32>,
{
    let n = scorer.n_features;
    let n_coalitions = 1u64 << n;
    let values = (0..n_coalitions)
        .map(|index| scorer.score(&Coalition::from_index(index, n)))
        .collect::<Result<Vec<f64>>>()?;

    let weights = shapley_weights(n);
    let mut phi = vec![0.0; n];
    for (i, phi_i) in phi.iter_mut().enumerate() {
        let bit = 1u64 << i;
        for index in (0..n_coalitions).filter(|s| s & bit == 0) {
            let size = index.count_ones() as usize;
            let with = values[(index | bit) as usize];
            let without = values[index as usize];
            *phi_i += weights[size] * (with - without);
        }
    }
    Ok(phi)
}

fn permutation_shapley<F>(
    scorer: &mut CoalitionScorer<F>,
    config: &ShapConfig,
) -> Result<(Vec<f64>, usize)>
where
    F: FnMut(&[bool]) -> Result<f32>,
{
    let n = scorer.n_features;
    let mut rng = rand::rngs::StdRng::seed_from_u64(config.seed);
    let mut order: Vec<usize> = (0..n).collect();
    let mut phi = vec![0.0; n];

    for sample in 0..config.n_samples {
        if config.antithetic && sample % 2 == 1 {
            order.reverse();
        } else {
            order.shuffle(&mut rng);
        }

        let mut coalition = Coalition::empty(n);
        let mut previous = scorer.score(&coalition)?;
        for &feature in &order {
            coalition.insert(feature);
            let current = scorer.score(&coalition)?;
            phi[feature] += current - previous;
            previous = current;
        }

        if (sample + 1) % 10 == 0 {
            debug!(
                "Permutation {}/{} ({} evaluations)",
                sample + 1,
                config.n_samples,
                scorer.cache.len()
            );
        }
    }

    let n_samples = config.n_samples as f64;
    for v in &mut phi {
        *v /= n_samples;
    }
    Ok((phi, config.n_samples))
}
