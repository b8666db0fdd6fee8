//! Batch collation
//!
//! Turns a slice of raw samples into model-ready tensors: decoded and
//! normalised images, padded token ids, an attention mask, and a label
//! tensor. Image decoding fans out over rayon workers; everything the
//! workers touch is read-only.

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use rayon::prelude::*;

use crate::data::Sample;
use crate::error::Result;
use crate::processor::CaptionProcessor;

/// One training iteration's worth of encoded tensors.
///
/// Owned by exactly one training step and discarded after use.
#[derive(Debug)]
pub struct CaptionBatch {
    /// Normalised images, `(B, 3, S, S)` F32
    pub pixel_values: Tensor,
    /// Token ids, `(B, L)` U32
    pub input_ids: Tensor,
    /// Padding mask, `(B, L)` U32, 1 for real tokens
    pub attention_mask: Tensor,
    /// Training targets; an independent copy of `input_ids`
    pub labels: Tensor,
}

impl CaptionBatch {
    /// Number of samples in the batch.
    pub fn len(&self) -> usize {
        self.input_ids.dims2().map(|(b, _)| b).unwrap_or(0)
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move every tensor to `device`, casting pixels to `dtype`.
    pub fn to_device(&self, device: &Device, dtype: DType) -> Result<Self> {
        Ok(Self {
            pixel_values: self.pixel_values.to_device(device)?.to_dtype(dtype)?,
            input_ids: self.input_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }
}

/// Stateless sample-to-batch encoder.
#[derive(Clone)]
pub struct Collator {
    processor: Arc<CaptionProcessor>,
}

impl Collator {
    /// Build a collator around a shared processor.
    pub fn new(processor: Arc<CaptionProcessor>) -> Self {
        Self { processor }
    }

    /// Encode a slice of samples into one batch.
    ///
    /// Fails if any referenced image is missing or undecodable; text
    /// encoding pads to the longest caption in the batch.
    pub fn collate(&self, samples: &[Sample]) -> Result<CaptionBatch> {
        let pixels: Vec<Tensor> = samples
            .par_iter()
            .map(|sample| self.processor.preprocess_image(Path::new(&sample.image_path)))
            .collect::<Result<_>>()?;
        let pixel_values = Tensor::stack(&pixels, 0)?;

        let texts: Vec<&str> = samples.iter().map(|s| s.text.as_str()).collect();
        let (input_ids, attention_mask) = self.processor.encode_texts(&texts)?;
        // Decoupled storage: mutating labels later must never touch input_ids.
        let labels = input_ids.copy()?;

        Ok(CaptionBatch {
            pixel_values,
            input_ids,
            attention_mask,
            labels,
        })
    }
}
