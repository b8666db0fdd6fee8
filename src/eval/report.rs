//! Metrics and samples report files

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::eval::metrics::CorpusScores;

/// JSON metrics report with fixed keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsReport {
    /// Corpus BLEU, 0-100
    pub sacrebleu: f64,
    /// Mean ROUGE-1 F1
    pub rouge1: f64,
    /// Mean ROUGE-2 F1
    pub rouge2: f64,
    /// Mean ROUGE-L F1
    #[serde(rename = "rougeL")]
    pub rouge_l: f64,
    /// Mean ROUGE-Lsum F1
    #[serde(rename = "rougeLsum")]
    pub rouge_lsum: f64,
    /// Number of scored pairs after filtering
    pub n: usize,
}

impl From<CorpusScores> for MetricsReport {
    fn from(scores: CorpusScores) -> Self {
        Self {
            sacrebleu: scores.bleu,
            rouge1: scores.rouge1,
            rouge2: scores.rouge2,
            rouge_l: scores.rouge_l,
            rouge_lsum: scores.rouge_lsum,
            n: scores.n,
        }
    }
}

/// One (image, reference, prediction) triple for the samples report.
#[derive(Debug, Clone)]
pub struct SampleRow {
    /// Image path of the pair
    pub image_path: String,
    /// Reference caption
    pub reference: String,
    /// Predicted caption
    pub prediction: String,
}

/// Write the metrics report as pretty JSON, creating parent directories.
pub fn save_metrics(path: &Path, report: &MetricsReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

/// Write up to `limit` sample triples as a Markdown document.
pub fn save_samples(path: &Path, rows: &[SampleRow], limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut doc = String::from("# Samples (reference vs prediction)\n\n");
    for (index, row) in rows.iter().take(limit).enumerate() {
        doc.push_str(&format!("## {}\n\n", index + 1));
        doc.push_str(&format!("- image_path: `{}`\n", row.image_path));
        doc.push_str(&format!("- reference: {}\n", row.reference));
        doc.push_str(&format!("- prediction: {}\n\n", row.prediction));
    }
    fs::write(path, doc)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_report_uses_the_fixed_key_names() {
        let report = MetricsReport {
            sacrebleu: 12.5,
            rouge1: 0.5,
            rouge2: 0.25,
            rouge_l: 0.4,
            rouge_lsum: 0.4,
            n: 7,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["rougeL"], 0.4);
        assert_eq!(json["rougeLsum"], 0.4);
        assert_eq!(json["n"], 7);
    }

    #[test]
    fn samples_report_respects_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("samples.md");
        let rows: Vec<SampleRow> = (0..5)
            .map(|i| SampleRow {
                image_path: format!("img_{i}.jpg"),
                reference: "ref".into(),
                prediction: "pred".into(),
            })
            .collect();
        save_samples(&path, &rows, 3).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("## 3"));
        assert!(!contents.contains("## 4"));
    }
}
