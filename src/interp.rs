//! Persisted interpretation records
//!
//! One JSON file per example, named `{example_index}-{qas_id}.json`, holding
//! everything the visualization pass needs without re-running the model.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::features::QaFeature;
use crate::prediction::{PrelimResult, Prediction};
use crate::scoring::ScoreKind;
use crate::shapley::ShapStats;
use crate::squad::SquadExample;

/// Attribution of one example plus the context needed to read it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpRecord {
    pub example: SquadExample,
    pub feature: QaFeature,
    pub prediction: Prediction,
    pub prelim_result: PrelimResult,
    /// One value per feature token
    pub attribution: Vec<f32>,
    pub score_kind: ScoreKind,
    /// Score of the unmasked input
    pub full_score: f32,
    /// Score with every token masked
    pub empty_score: f32,
    pub shap_stats: ShapStats,
}

impl InterpRecord {
    /// File name inside the interpretation directory
    pub fn file_name(&self) -> String {
        format!("{}-{}.json", self.feature.example_index, self.feature.qas_id)
    }
}

/// Create a directory (and parents) if missing
pub fn prepare_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}

/// Remove a directory with all its contents and recreate it empty
pub fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to remove directory {}", dir.display()))?;
    }
    prepare_dir(dir)
}

/// Write a record, cutting the attribution to the feature's token count
pub fn dump_record(dir: &Path, mut record: InterpRecord) -> Result<PathBuf> {
    record.attribution.truncate(record.feature.len());
    let path = dir.join(record.file_name());
    let json = serde_json::to_string(&record)?;
    std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    debug!("Saved interpretation to {}", path.display());
    Ok(path)
}

/// Parse the numeric example index from a record file name
fn example_index_of(file_name: &str) -> Option<usize> {
    if !file_name.ends_with(".json") {
        return None;
    }
    file_name.split('-').next()?.parse().ok()
}

/// Load every record in `dir`, ordered by example index
pub fn load_records(dir: &Path) -> Result<Vec<InterpRecord>> {
    let mut files: Vec<(usize, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
    {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match example_index_of(&name) {
            Some(index) => files.push((index, path)),
            None => warn!("Skipping unrecognized file {}", path.display()),
        }
    }
    files.sort_by_key(|(index, _)| *index);

    files
        .into_iter()
        .map(|(_, path)| {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))
        })
        .collect()
}
