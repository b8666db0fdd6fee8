//! Caption dataset loading
//!
//! Datasets are JSONL files with one `{"image_path": ..., "text": ...}`
//! record per line. Ingestion is deliberately permissive: rows that are
//! unparseable, missing a field, or carrying an empty field are dropped
//! without raising; the store keeps a count of dropped rows so runs can
//! still observe how dirty their inputs were.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::jsonl;
use crate::error::Result;

/// One image/caption training pair. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sample {
    /// Path to the image file
    pub image_path: String,
    /// Reference caption
    pub text: String,
}

/// Ordered, indexable collection of clean samples.
pub struct CaptionDataset {
    samples: Vec<Sample>,
    dropped: usize,
}

impl CaptionDataset {
    /// Load a dataset from a JSONL file.
    ///
    /// A missing file is an error; individual bad rows are not.
    pub fn load(path: &Path) -> Result<Self> {
        let rows = jsonl::read_values(path)?;
        let total = rows.len();
        let mut samples = Vec::with_capacity(total);
        for row in rows {
            let image_path = row.get("image_path").and_then(|v| v.as_str()).unwrap_or("");
            let text = row.get("text").and_then(|v| v.as_str()).unwrap_or("");
            if image_path.is_empty() || text.is_empty() {
                continue;
            }
            samples.push(Sample {
                image_path: image_path.to_string(),
                text: text.to_string(),
            });
        }
        let dropped = total - samples.len();
        if dropped > 0 {
            debug!(path = %path.display(), dropped, "dropped incomplete dataset rows");
        }
        info!(path = %path.display(), samples = samples.len(), "loaded caption dataset");
        Ok(Self { samples, dropped })
    }

    /// Number of clean samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the dataset holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sample at `index`, in original file order.
    pub fn get(&self, index: usize) -> Option<&Sample> {
        self.samples.get(index)
    }

    /// All samples, in original file order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of rows excluded during load.
    pub fn dropped_rows(&self) -> usize {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_dataset(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn valid_rows_survive_in_order() {
        let file = write_dataset(&[
            r#"{"image_path": "a.jpg", "text": "first"}"#,
            r#"{"image_path": "b.jpg", "text": "second"}"#,
            r#"{"image_path": "c.jpg", "text": "third"}"#,
        ]);
        let ds = CaptionDataset::load(file.path()).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.get(0).unwrap().text, "first");
        assert_eq!(ds.get(2).unwrap().image_path, "c.jpg");
        assert_eq!(ds.dropped_rows(), 0);
    }

    #[test]
    fn incomplete_rows_are_dropped_silently() {
        // 3 valid rows, one missing text, one missing image_path
        let file = write_dataset(&[
            r#"{"image_path": "a.jpg", "text": "first"}"#,
            r#"{"image_path": "b.jpg"}"#,
            r#"{"image_path": "c.jpg", "text": "second"}"#,
            r#"{"text": "no image"}"#,
            r#"{"image_path": "d.jpg", "text": "third"}"#,
        ]);
        let ds = CaptionDataset::load(file.path()).unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.dropped_rows(), 2);
        let texts: Vec<&str> = ds.samples().iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[test]
    fn empty_fields_count_as_missing() {
        let file = write_dataset(&[
            r#"{"image_path": "", "text": "x"}"#,
            r#"{"image_path": "a.jpg", "text": ""}"#,
        ]);
        let ds = CaptionDataset::load(file.path()).unwrap();
        assert!(ds.is_empty());
        assert_eq!(ds.dropped_rows(), 2);
    }

    #[test]
    fn missing_dataset_file_fails() {
        assert!(CaptionDataset::load(Path::new("/no/such/train.jsonl")).is_err());
    }
}
