//! SQuAD exact-match and F1 evaluation

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::prediction::Prediction;
use crate::squad::SquadExample;

/// Lowercase, strip punctuation and articles, collapse whitespace
pub fn normalize_answer(text: &str) -> String {
    let lowered = text.to_lowercase();
    let no_punct: String = lowered
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect();
    no_punct
        .split_whitespace()
        .filter(|w| !matches!(*w, "a" | "an" | "the"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// 1.0 when the normalized strings are identical
pub fn exact_match(prediction: &str, gold: &str) -> f64 {
    f64::from(u8::from(normalize_answer(prediction) == normalize_answer(gold)))
}

/// Token-overlap F1 between normalized strings
pub fn f1(prediction: &str, gold: &str) -> f64 {
    let pred_norm = normalize_answer(prediction);
    let gold_norm = normalize_answer(gold);
    let pred_tokens: Vec<&str> = pred_norm.split_whitespace().collect();
    let gold_tokens: Vec<&str> = gold_norm.split_whitespace().collect();

    // Empty answers only match each other
    if pred_tokens.is_empty() || gold_tokens.is_empty() {
        return f64::from(u8::from(pred_tokens == gold_tokens));
    }

    let mut gold_counts: HashMap<&str, usize> = HashMap::new();
    for t in &gold_tokens {
        *gold_counts.entry(*t).or_default() += 1;
    }
    let mut common = 0usize;
    for t in &pred_tokens {
        if let Some(count) = gold_counts.get_mut(t) {
            if *count > 0 {
                *count -= 1;
                common += 1;
            }
        }
    }
    if common == 0 {
        return 0.0;
    }

    let precision = common as f64 / pred_tokens.len() as f64;
    let recall = common as f64 / gold_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Best score over all gold answers; impossible questions compare against ""
fn max_over_gold(prediction: &str, example: &SquadExample, metric: fn(&str, &str) -> f64) -> f64 {
    let golds = example.answer_texts();
    if golds.is_empty() {
        return metric(prediction, "");
    }
    golds
        .iter()
        .map(|g| metric(prediction, g))
        .fold(0.0, f64::max)
}

/// Aggregate evaluation results (percentages)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResults {
    pub exact: f64,
    pub f1: f64,
    pub total: usize,
    pub has_ans_exact: f64,
    pub has_ans_f1: f64,
    pub has_ans_total: usize,
    pub no_ans_exact: f64,
    pub no_ans_total: usize,
}

/// Score predictions against the examples they were made for
///
/// Examples without a prediction are skipped, so a partial run is scored
/// only on what it processed.
pub fn evaluate(examples: &[SquadExample], predictions: &HashMap<String, Prediction>) -> EvalResults {
    let mut exact_sum = 0.0;
    let mut f1_sum = 0.0;
    let mut has_exact = 0.0;
    let mut has_f1 = 0.0;
    let mut no_exact = 0.0;
    let mut total = 0;
    let mut has_total = 0;
    let mut no_total = 0;

    for example in examples {
        let Some(prediction) = predictions.get(&example.qas_id) else {
            continue;
        };
        let em = max_over_gold(&prediction.text, example, exact_match);
        let f = max_over_gold(&prediction.text, example, f1);

        exact_sum += em;
        f1_sum += f;
        total += 1;
        if example.answers.is_empty() {
            no_exact += em;
            no_total += 1;
        } else {
            has_exact += em;
            has_f1 += f;
            has_total += 1;
        }
    }

    let pct = |sum: f64, n: usize| if n == 0 { 0.0 } else { 100.0 * sum / n as f64 };
    EvalResults {
        exact: pct(exact_sum, total),
        f1: pct(f1_sum, total),
        total,
        has_ans_exact: pct(has_exact, has_total),
        has_ans_f1: pct(has_f1, has_total),
        has_ans_total: has_total,
        no_ans_exact: pct(no_exact, no_total),
        no_ans_total: no_total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squad::Answer;

    fn example(id: &str, answers: &[&str]) -> SquadExample {
        SquadExample {
            qas_id: id.into(),
            question: String::new(),
            context: String::new(),
            answers: answers
                .iter()
                .map(|a| Answer {
                    text: (*a).into(),
                    answer_start: 0,
                })
                .collect(),
            is_impossible: answers.is_empty(),
        }
    }

    fn prediction(id: &str, text: &str) -> (String, Prediction) {
        (
            id.to_string(),
            Prediction {
                qas_id: id.into(),
                text: text.into(),
                char_range: None,
                score: 0.0,
            },
        )
    }

    #[test]
    fn test_normalize_answer() {
        assert_eq!(normalize_answer("The  Quick, brown fox!"), "quick brown fox");
        assert_eq!(normalize_answer("an apple"), "apple");
    }

    #[test]
    fn test_f1_partial_overlap() {
        // common = 1, precision 1/2, recall 1/1
        assert!((f1("in 2015", "2015") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(f1("", ""), 1.0);
        assert_eq!(f1("2015", ""), 0.0);
        assert_eq!(exact_match("The year 2015.", "year 2015"), 1.0);
    }

    #[test]
    fn test_evaluate() {
        let examples = vec![
            example("a", &["2015", "in 2015"]),
            example("b", &["Mozilla"]),
            example("c", &[]),
            example("d", &["skipped"]),
        ];
        let predictions: HashMap<_, _> = [
            prediction("a", "in 2015"),
            prediction("b", "Google"),
            prediction("c", ""),
        ]
        .into_iter()
        .collect();

        let results = evaluate(&examples, &predictions);
        assert_eq!(results.total, 3);
        assert_eq!(results.has_ans_total, 2);
        assert_eq!(results.no_ans_total, 1);
        assert!((results.exact - 200.0 / 3.0).abs() < 1e-9);
        assert!((results.has_ans_exact - 50.0).abs() < 1e-9);
        assert!((results.no_ans_exact - 100.0).abs() < 1e-9);
    }
}
