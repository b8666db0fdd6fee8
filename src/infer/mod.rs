//! Caption inference over trained or base models

pub mod captioner;

pub use captioner::{Captioner, GenerationParams, PredictionRecord, PredictionStats};
