//! Token attribution rendering
//!
//! Sub-word tokens are merged back into words before rendering so the
//! heatmap reads like the original text. Each record becomes one standalone
//! HTML page; an `index.html` links them all.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use crate::interp::{load_records, reset_dir, InterpRecord};
use crate::positioning::EncodingWithOffsets;

/// Number of words listed in the "top attributions" table
const TOP_K_WORDS: usize = 10;

/// A word assembled from consecutive sub-word tokens
#[derive(Debug, Clone, PartialEq)]
pub struct MergedWord {
    pub text: String,
    /// 0 = question, 1 = context, None = special token
    pub segment: Option<usize>,
    /// Token indices `first..=last` making up the word
    pub first_token: usize,
    pub last_token: usize,
    /// Summed attribution of the word's tokens
    pub attribution: f32,
}

/// Merge sub-word tokens into words, summing their attributions
///
/// A token continues the previous word when both belong to the same
/// segment and the token starts exactly where the previous one ended.
/// Special tokens and punctuation pieces are never merged, so "rust?"
/// stays two words.
pub fn merge_tokens_into_words(
    encoding: &EncodingWithOffsets,
    attributions: &[f32],
    question: &str,
    context: &str,
) -> Vec<MergedWord> {
    let mut words: Vec<MergedWord> = Vec::new();
    let mut last_end: Option<usize> = None;
    let mut last_punct = false;

    for (idx, &attribution) in attributions.iter().enumerate().take(encoding.len()) {
        let segment = encoding.sequence_ids[idx];
        let (start, end) = encoding.offsets[idx];

        if segment.is_none() {
            words.push(MergedWord {
                text: encoding.tokens[idx].clone(),
                segment: None,
                first_token: idx,
                last_token: idx,
                attribution,
            });
            last_end = None;
            continue;
        }

        let source = if segment == Some(0) { question } else { context };
        let piece = source.get(start..end);
        let punct = piece.is_some_and(is_punctuation);
        let continues = match words.last() {
            Some(prev) => {
                prev.segment == segment && last_end == Some(start) && !punct && !last_punct
            }
            None => false,
        };

        if continues {
            if let Some(prev) = words.last_mut() {
                prev.last_token = idx;
                prev.attribution += attribution;
                prev.text.push_str(piece.unwrap_or_default());
            }
        } else {
            words.push(MergedWord {
                text: piece.map_or_else(|| encoding.tokens[idx].clone(), str::to_string),
                segment,
                first_token: idx,
                last_token: idx,
                attribution,
            });
        }
        last_end = Some(end);
        last_punct = punct;
    }

    words
}

fn is_punctuation(piece: &str) -> bool {
    !piece.is_empty() && piece.chars().all(|c| !c.is_alphanumeric() && !c.is_whitespace())
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Background color for an attribution normalized to [-1, 1]
fn attribution_color(normalized: f32) -> String {
    let alpha = normalized.abs().min(1.0);
    if normalized >= 0.0 {
        format!("rgba(0, 160, 0, {alpha:.3})")
    } else {
        format!("rgba(200, 0, 0, {alpha:.3})")
    }
}

fn render_words(html: &mut String, words: &[&MergedWord], max_abs: f32) {
    for word in words {
        let normalized = if max_abs > 0.0 {
            word.attribution / max_abs
        } else {
            0.0
        };
        let _ = write!(
            html,
            "<span class=\"w\" style=\"background:{}\" title=\"{:.4}\">{}</span> ",
            attribution_color(normalized),
            word.attribution,
            escape_html(&word.text)
        );
    }
}

/// Render one record as a standalone HTML page
pub fn render_record(record: &InterpRecord) -> String {
    let words = merge_tokens_into_words(
        &record.feature.encoding,
        &record.attribution,
        &record.example.question,
        &record.example.context,
    );
    let max_abs = words
        .iter()
        .map(|w| w.attribution.abs())
        .fold(0.0_f32, f32::max);

    let mut html = String::new();
    let _ = write!(
        html,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{id}</title>\
         <style>body{{font-family:sans-serif;max-width:60em;margin:2em auto}}\
         .w{{padding:1px 2px;border-radius:3px;line-height:1.9}}\
         td,th{{padding:2px 8px;text-align:left}}</style></head><body>\n\
         <h2>{id}</h2>\n",
        id = escape_html(&record.example.qas_id)
    );

    let _ = writeln!(html, "<h3>Question</h3><p>");
    let question: Vec<&MergedWord> = words.iter().filter(|w| w.segment == Some(0)).collect();
    render_words(&mut html, &question, max_abs);
    let _ = writeln!(html, "</p><h3>Context</h3><p>");
    let context: Vec<&MergedWord> = words.iter().filter(|w| w.segment == Some(1)).collect();
    render_words(&mut html, &context, max_abs);
    let _ = writeln!(html, "</p>");

    let gold = record.example.answer_texts();
    let _ = writeln!(
        html,
        "<p><b>Gold:</b> {}<br><b>Prediction:</b> {} (tokens {}..={})<br>\
         <b>Score ({}):</b> full {:.4}, empty {:.4}, attribution sum {:.4}</p>",
        if gold.is_empty() {
            "<i>no answer</i>".to_string()
        } else {
            escape_html(&gold.join(" | "))
        },
        escape_html(&record.prediction.text),
        record.prelim_result.start_index,
        record.prelim_result.end_index,
        record.score_kind,
        record.full_score,
        record.empty_score,
        record.attribution.iter().sum::<f32>()
    );

    let mut ranked: Vec<&MergedWord> = words.iter().collect();
    ranked.sort_by(|a, b| b.attribution.abs().total_cmp(&a.attribution.abs()));
    let _ = writeln!(html, "<h3>Top attributions</h3><table><tr><th>word</th><th>segment</th><th>value</th></tr>");
    for word in ranked.iter().take(TOP_K_WORDS) {
        let segment = match word.segment {
            Some(0) => "question",
            Some(_) => "context",
            None => "special",
        };
        let _ = writeln!(
            html,
            "<tr><td>{}</td><td>{}</td><td>{:.4}</td></tr>",
            escape_html(&word.text),
            segment,
            word.attribution
        );
    }
    let _ = writeln!(html, "</table></body></html>");
    html
}

/// Write the HTML page for one record into `out_dir`
pub fn visualize_token_attributions(record: &InterpRecord, out_dir: &Path) -> Result<()> {
    let path = out_dir.join(format!(
        "{}-{}.html",
        record.feature.example_index, record.feature.qas_id
    ));
    std::fs::write(&path, render_record(record))
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Render every record of `interp_dir` into a freshly reset `visual_dir`
///
/// Returns the number of rendered records.
pub fn visualize_dir(interp_dir: &Path, visual_dir: &Path) -> Result<usize> {
    let records = load_records(interp_dir)?;
    reset_dir(visual_dir)?;
    info!(
        "Visualizing {} interpretations into {}",
        records.len(),
        visual_dir.display()
    );

    let mut index = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Attributions</title></head><body>\n<table>\n\
         <tr><th>#</th><th>id</th><th>question</th><th>prediction</th></tr>\n",
    );
    for record in &records {
        visualize_token_attributions(record, visual_dir)?;
        let _ = writeln!(
            index,
            "<tr><td>{idx}</td><td><a href=\"{idx}-{id}.html\">{id}</a></td><td>{q}</td><td>{p}</td></tr>",
            idx = record.feature.example_index,
            id = escape_html(&record.feature.qas_id),
            q = escape_html(&record.example.question),
            p = escape_html(&record.prediction.text)
        );
    }
    index.push_str("</table></body></html>\n");
    std::fs::write(visual_dir.join("index.html"), index)
        .context("Failed to write visualization index")?;

    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `<s> who wrote rust ? </s> </s> mozil la sponsored rust </s>`
    fn encoding() -> EncodingWithOffsets {
        EncodingWithOffsets::new(
            vec![0; 12],
            vec![0; 12],
            [
                "<s>", "who", "wrote", "rust", "?", "</s>", "</s>", "mozil", "la", "sponsored",
                "rust", "</s>",
            ]
            .iter()
            .map(|s| (*s).to_string())
            .collect(),
            vec![
                (0, 0),
                (0, 3),
                (4, 9),
                (10, 14),
                (14, 15),
                (0, 0),
                (0, 0),
                (0, 5),
                (5, 7),
                (8, 17),
                (18, 22),
                (0, 0),
            ],
            vec![
                None,
                Some(0),
                Some(0),
                Some(0),
                Some(0),
                None,
                None,
                Some(1),
                Some(1),
                Some(1),
                Some(1),
                None,
            ],
        )
    }

    #[test]
    fn test_merge_subwords() {
        let attributions = [0.0, 0.1, 0.2, 0.3, 0.4, 0.0, 0.0, 1.0, 0.5, -0.25, 0.75, 0.0];
        let words = merge_tokens_into_words(
            &encoding(),
            &attributions,
            "who wrote rust?",
            "mozilla sponsored rust",
        );

        let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                "<s>", "who", "wrote", "rust", "?", "</s>", "</s>", "mozilla", "sponsored", "rust",
                "</s>"
            ]
        );
        assert!((words[4].attribution - 0.4).abs() < 1e-6);

        let mozilla = &words[7];
        assert_eq!((mozilla.first_token, mozilla.last_token), (7, 8));
        assert!((mozilla.attribution - 1.5).abs() < 1e-6);

        // Attribution mass is preserved by merging
        let total: f32 = words.iter().map(|w| w.attribution).sum();
        assert!((total - attributions.iter().sum::<f32>()).abs() < 1e-6);
    }

    #[test]
    fn test_punctuation_pieces() {
        assert!(is_punctuation("?"));
        assert!(is_punctuation("),"));
        assert!(!is_punctuation("la"));
        assert!(!is_punctuation("'s"));
        assert!(!is_punctuation(""));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a & \"b\">"), "&lt;a &amp; &quot;b&quot;&gt;");
    }

    #[test]
    fn test_attribution_color() {
        assert_eq!(attribution_color(1.0), "rgba(0, 160, 0, 1.000)");
        assert_eq!(attribution_color(-0.5), "rgba(200, 0, 0, 0.500)");
    }
}
