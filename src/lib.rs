//! captune - LoRA fine-tuning for image-captioning models
//!
//! This crate fine-tunes a frozen BLIP-style captioning model with low-rank
//! adapters on a JSONL image/caption dataset, runs beam-search caption
//! inference, and scores predictions against references.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod infer;
pub mod model;
pub mod processor;
pub mod training;

// Re-exports
pub use config::{ComputeProfile, DeviceKind, DEFAULT_MODEL_ID};
pub use data::{CaptionBatch, CaptionDataset, Collator, Sample};
pub use error::{Error, Result};
pub use infer::{Captioner, GenerationParams, PredictionRecord};
pub use model::{CaptionConfig, CaptionModel, LoraConfig};
pub use processor::{CaptionProcessor, ProcessorConfig};
pub use training::{TrainConfig, TrainReport, Trainer};
