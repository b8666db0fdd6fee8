//! Dataset loading and batch collation

pub mod collator;
pub mod dataset;
pub mod jsonl;

pub use collator::{CaptionBatch, Collator};
pub use dataset::{CaptionDataset, Sample};
