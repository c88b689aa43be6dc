//! SQuAD-style dataset loading
//!
//! Reads the v1.1 / v2.0 JSON layout and flattens every question into one
//! example, in file order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A gold answer span
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Character offset into the context
    pub answer_start: usize,
}

/// A single question over a context paragraph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquadExample {
    pub qas_id: String,
    pub question: String,
    pub context: String,
    pub answers: Vec<Answer>,
    #[serde(default)]
    pub is_impossible: bool,
}

impl SquadExample {
    /// Gold answer texts (empty for impossible questions)
    pub fn answer_texts(&self) -> Vec<&str> {
        self.answers.iter().map(|a| a.text.as_str()).collect()
    }
}

/// Raw JSON structure for loading
#[derive(Debug, Deserialize)]
struct SquadFile {
    data: Vec<Article>,
    #[allow(dead_code)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Article {
    #[allow(dead_code)]
    title: Option<String>,
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    context: String,
    qas: Vec<RawQa>,
}

#[derive(Debug, Deserialize)]
struct RawQa {
    id: String,
    question: String,
    #[serde(default)]
    answers: Vec<Answer>,
    #[serde(default)]
    is_impossible: bool,
}

/// Collection of QA examples
#[derive(Debug, Clone)]
pub struct SquadDataset {
    examples: Vec<SquadExample>,
}

impl SquadDataset {
    /// Load a dataset from a SQuAD JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse dataset {}", path.display()))
    }

    /// Parse a dataset from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        let file: SquadFile = serde_json::from_str(content)?;
        let examples = file
            .data
            .into_iter()
            .flat_map(|article| article.paragraphs)
            .flat_map(|paragraph| {
                let context = paragraph.context;
                paragraph
                    .qas
                    .into_iter()
                    .map(move |qa| SquadExample {
                        qas_id: qa.id,
                        question: qa.question,
                        context: context.clone(),
                        answers: qa.answers,
                        is_impossible: qa.is_impossible,
                    })
            })
            .collect();
        Ok(Self { examples })
    }

    /// Keep only the first `n` examples
    pub fn truncate(&mut self, n: usize) {
        self.examples.truncate(n);
    }

    /// Count questions that have no answer
    pub fn impossible_count(&self) -> usize {
        self.examples.iter().filter(|e| e.is_impossible).count()
    }

    /// Total number of examples
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    /// Check if dataset is empty
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Get all examples
    pub fn examples(&self) -> &[SquadExample] {
        &self.examples
    }
}
