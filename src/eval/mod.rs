//! Scoring predictions against references

pub mod metrics;
pub mod report;

use std::path::Path;

use tracing::info;

use crate::data::jsonl;
use crate::error::Result;

pub use metrics::{score_corpus, CorpusScores};
pub use report::{MetricsReport, SampleRow};

/// Score a predictions JSONL file and write the two report files.
///
/// Rows carrying an `error`, or missing either the reference `text` or the
/// predicted `pred_text`, are filtered out; the reported `n` counts only
/// the surviving pairs.
pub fn evaluate_file(
    predictions_path: &Path,
    metrics_path: &Path,
    samples_path: &Path,
    max_samples: usize,
) -> Result<MetricsReport> {
    let rows = jsonl::read_values(predictions_path)?;

    let mut references = Vec::new();
    let mut predictions = Vec::new();
    let mut samples = Vec::new();
    for row in &rows {
        if row.get("error").map(|e| !e.is_null()).unwrap_or(false) {
            continue;
        }
        let reference = row.get("text").and_then(|v| v.as_str()).unwrap_or("");
        let prediction = row.get("pred_text").and_then(|v| v.as_str()).unwrap_or("");
        if reference.is_empty() || prediction.is_empty() {
            continue;
        }
        let image_path = row.get("image_path").and_then(|v| v.as_str()).unwrap_or("");
        references.push(reference.to_string());
        predictions.push(prediction.to_string());
        samples.push(SampleRow {
            image_path: image_path.to_string(),
            reference: reference.to_string(),
            prediction: prediction.to_string(),
        });
    }

    let report = MetricsReport::from(score_corpus(&references, &predictions));
    report::save_metrics(metrics_path, &report)?;
    report::save_samples(samples_path, &samples, max_samples)?;
    info!(
        n = report.n,
        metrics = %metrics_path.display(),
        samples = %samples_path.display(),
        "saved evaluation reports"
    );
    Ok(report)
}
