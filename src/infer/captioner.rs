//! Caption generation
//!
//! Wraps a (possibly adapter-augmented) model with its processor and runs
//! beam-search decoding. Batch mode treats missing or undecodable images as
//! per-record failures carried in the output stream, never as aborts.

use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, IndexOp, Tensor, D};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ComputeProfile;
use crate::data::jsonl;
use crate::error::{Error, Result};
use crate::model::{adapter, AdapterBuilder, CaptionConfig, CaptionModel, ModelAssets};
use crate::processor::{CaptionProcessor, ProcessorConfig, PROCESSOR_CONFIG_FILE};

/// Error value recorded for a prediction whose image file is absent.
pub const ERROR_IMAGE_NOT_FOUND: &str = "image_not_found";
/// Error value recorded for a prediction whose image cannot be decoded.
pub const ERROR_IMAGE_DECODE: &str = "image_decode_error";

/// Generation policy.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Cap on newly generated tokens
    pub max_new_tokens: usize,
    /// Beam width
    pub num_beams: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 40,
            num_beams: 3,
        }
    }
}

/// One row of batch-inference output.
///
/// Exactly one of `pred_text` / `error` is populated; the original input
/// fields ride along unchanged in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Image the prediction refers to
    pub image_path: String,
    /// Generated caption, when inference succeeded
    pub pred_text: Option<String>,
    /// Failure marker, when it did not
    pub error: Option<String>,
    /// Remaining input fields, passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PredictionRecord {
    fn from_row(row: &Value) -> serde_json::Map<String, Value> {
        let mut extra = row.as_object().cloned().unwrap_or_default();
        extra.remove("image_path");
        extra.remove("pred_text");
        extra.remove("error");
        extra
    }

    /// Successful prediction.
    pub fn ok(row: &Value, image_path: &str, pred_text: String) -> Self {
        Self {
            image_path: image_path.to_string(),
            pred_text: Some(pred_text),
            error: None,
            extra: Self::from_row(row),
        }
    }

    /// Failed prediction.
    pub fn failed(row: &Value, image_path: &str, error: &str) -> Self {
        Self {
            image_path: image_path.to_string(),
            pred_text: None,
            error: Some(error.to_string()),
            extra: Self::from_row(row),
        }
    }
}

/// Counts from a batch-inference run.
#[derive(Debug, Clone, Copy)]
pub struct PredictionStats {
    /// Records written to the output file
    pub written: usize,
    /// Records with a generated caption
    pub succeeded: usize,
    /// Records carrying an error marker
    pub failed: usize,
}

/// Inference engine: one image in, one caption out.
pub struct Captioner {
    model: CaptionModel,
    processor: Arc<CaptionProcessor>,
    profile: ComputeProfile,
}

impl Captioner {
    /// Load a base model, optionally re-attaching a trained adapter.
    pub fn load(
        model_id: &str,
        adapter_dir: Option<&Path>,
        profile: ComputeProfile,
    ) -> Result<Self> {
        let assets = ModelAssets::resolve(model_id)?;
        let config = CaptionConfig::blip_base();
        let vb = assets.load_weights(profile.dtype, &profile.device)?;

        let (model, processor) = match adapter_dir {
            None => {
                let processor =
                    CaptionProcessor::from_files(&assets.tokenizer, ProcessorConfig::default())?;
                (CaptionModel::new(&config, vb, None)?, processor)
            }
            Some(dir) => {
                let metadata = adapter::load_adapter_metadata(dir)?;
                metadata.validate_against(&config.text)?;
                // Prefer the preprocessing configuration trained with the
                // adapter so encoding matches training exactly.
                let processor = if dir.join(PROCESSOR_CONFIG_FILE).exists() {
                    CaptionProcessor::load(dir)?
                } else {
                    CaptionProcessor::from_files(&assets.tokenizer, ProcessorConfig::default())?
                };
                let mut varmap = VarMap::new();
                let adapters =
                    AdapterBuilder::new(metadata.lora_config(), &varmap, &profile.device)?;
                let model = CaptionModel::new(&config, vb, Some(&adapters))?;
                adapter::load_adapter_weights(dir, &mut varmap)?;
                info!(adapter = %dir.display(), "attached trained adapter");
                (model, processor)
            }
        };
        Ok(Self {
            model,
            processor: Arc::new(processor),
            profile,
        })
    }

    /// Assemble a captioner from already-built parts.
    pub fn from_parts(
        model: CaptionModel,
        processor: Arc<CaptionProcessor>,
        profile: ComputeProfile,
    ) -> Self {
        Self {
            model,
            processor,
            profile,
        }
    }

    /// Generate a caption for a single image.
    pub fn caption(&self, image_path: &Path, params: &GenerationParams) -> Result<String> {
        let pixels = self
            .processor
            .preprocess_image(image_path)?
            .to_device(&self.profile.device)?
            .to_dtype(self.profile.dtype)?
            .unsqueeze(0)?;
        let image_embeds = self.model.encode_image(&pixels)?;
        let tokens = self.beam_search(&image_embeds, params)?;
        self.processor.decode(&tokens)
    }

    /// Caption every record of a JSONL prediction-input file.
    ///
    /// Rows without an `image_path` are skipped; rows whose image is
    /// missing or undecodable are emitted with the matching error marker
    /// and processing continues. `limit` caps successful captions.
    pub fn caption_file(
        &self,
        input: &Path,
        output: &Path,
        params: &GenerationParams,
        limit: Option<usize>,
    ) -> Result<PredictionStats> {
        let rows = jsonl::read_values(input)?;
        let mut records = Vec::new();
        let mut succeeded = 0usize;
        let mut failed = 0usize;

        for row in &rows {
            let image_path = row.get("image_path").and_then(|v| v.as_str()).unwrap_or("");
            if image_path.is_empty() {
                continue;
            }
            let path = Path::new(image_path);
            if !path.exists() {
                debug!(image = image_path, "image missing; recording error");
                records.push(PredictionRecord::failed(row, image_path, ERROR_IMAGE_NOT_FOUND));
                failed += 1;
                continue;
            }
            match self.caption(path, params) {
                Ok(text) => {
                    records.push(PredictionRecord::ok(row, image_path, text));
                    succeeded += 1;
                }
                Err(Error::ImageDecode { .. }) => {
                    debug!(image = image_path, "image undecodable; recording error");
                    records.push(PredictionRecord::failed(row, image_path, ERROR_IMAGE_DECODE));
                    failed += 1;
                    continue;
                }
                Err(other) => return Err(other),
            }
            if let Some(limit) = limit {
                if limit > 0 && succeeded >= limit {
                    break;
                }
            }
        }

        jsonl::write_records(output, &records)?;
        info!(
            written = records.len(),
            output = %output.display(),
            "saved predictions"
        );
        Ok(PredictionStats {
            written: records.len(),
            succeeded,
            failed,
        })
    }

    /// Beam-search decode against one image's features.
    fn beam_search(&self, image_embeds: &Tensor, params: &GenerationParams) -> Result<Vec<u32>> {
        let text_config = &self.model.config().text;
        let mut beams = BeamSet::new(
            text_config.bos_token_id,
            text_config.sep_token_id,
            params.num_beams.max(1),
        );

        let position_limit = text_config.max_position_embeddings;
        for _ in 0..params.max_new_tokens {
            if beams.all_finished() {
                break;
            }
            let prefixes = beams.unfinished_prefixes();
            let count = prefixes.len();
            let length = prefixes[0].len();
            if length >= position_limit {
                break;
            }
            let flat: Vec<u32> = prefixes.iter().flat_map(|p| p.iter().copied()).collect();
            let input_ids = Tensor::from_vec(flat, (count, length), &self.profile.device)?;
            let embeds = image_embeds.repeat((count, 1, 1))?;
            let logits = self
                .model
                .decode_text(&input_ids, None, &embeds, false)?;
            let last = logits
                .i((.., length - 1, ..))?
                .to_dtype(DType::F32)?;
            let log_probs = candle_nn::ops::log_softmax(&last, D::Minus1)?;
            beams.advance(&log_probs.to_vec2::<f32>()?);
        }

        Ok(beams.best_tokens())
    }
}

/// Beam bookkeeping, kept separate from the model so the expansion logic
/// can be exercised with synthetic log-probabilities.
#[derive(Debug, Clone)]
struct BeamHypothesis {
    tokens: Vec<u32>,
    score: f64,
    finished: bool,
}

#[derive(Debug)]
pub(crate) struct BeamSet {
    beams: Vec<BeamHypothesis>,
    bos: u32,
    eos: u32,
    width: usize,
}

impl BeamSet {
    pub(crate) fn new(bos: u32, eos: u32, width: usize) -> Self {
        Self {
            beams: vec![BeamHypothesis {
                tokens: vec![bos],
                score: 0.0,
                finished: false,
            }],
            bos,
            eos,
            width,
        }
    }

    pub(crate) fn all_finished(&self) -> bool {
        self.beams.iter().all(|b| b.finished)
    }

    /// Token prefixes of unfinished beams, all of equal length.
    pub(crate) fn unfinished_prefixes(&self) -> Vec<&[u32]> {
        self.beams
            .iter()
            .filter(|b| !b.finished)
            .map(|b| b.tokens.as_slice())
            .collect()
    }

    /// Expand with one row of vocabulary log-probabilities per unfinished
    /// beam (in [`BeamSet::unfinished_prefixes`] order), then keep the
    /// overall top `width` hypotheses.
    pub(crate) fn advance(&mut self, rows: &[Vec<f32>]) {
        let mut candidates: Vec<BeamHypothesis> =
            self.beams.iter().filter(|b| b.finished).cloned().collect();
        let mut row_index = 0usize;
        for beam in self.beams.iter().filter(|b| !b.finished) {
            let row = &rows[row_index];
            row_index += 1;
            let mut ranked: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
            ranked.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
            for &(token, log_prob) in ranked.iter().take(self.width) {
                let token = token as u32;
                let mut tokens = beam.tokens.clone();
                tokens.push(token);
                candidates.push(BeamHypothesis {
                    finished: token == self.eos,
                    tokens,
                    score: beam.score + f64::from(log_prob),
                });
            }
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(self.width);
        self.beams = candidates;
    }

    /// Best hypothesis by length-normalised score, with the leading bos and
    /// trailing eos stripped.
    pub(crate) fn best_tokens(&self) -> Vec<u32> {
        let best = self
            .beams
            .iter()
            .max_by(|a, b| {
                let norm_a = a.score / (a.tokens.len() - 1).max(1) as f64;
                let norm_b = b.score / (b.tokens.len() - 1).max(1) as f64;
                norm_a.total_cmp(&norm_b)
            })
            .expect("beam set is never empty");
        best.tokens
            .iter()
            .copied()
            .filter(|&t| t != self.bos && t != self.eos)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(vocab: usize, best: usize, value: f32) -> Vec<f32> {
        let mut row = vec![-10.0; vocab];
        row[best] = value;
        row
    }

    #[test]
    fn beams_widen_then_follow_the_best_path() {
        let mut beams = BeamSet::new(8, 9, 2);
        assert_eq!(beams.unfinished_prefixes(), vec![&[8u32][..]]);
        // Token 3 dominates the first step.
        beams.advance(&[row(10, 3, -0.1)]);
        let prefixes = beams.unfinished_prefixes();
        assert_eq!(prefixes.len(), 2);
        assert_eq!(prefixes[0], &[8, 3]);
        // Both beams then want the eos token.
        beams.advance(&[row(10, 9, -0.1), row(10, 9, -0.1)]);
        assert!(beams.all_finished());
        assert_eq!(beams.best_tokens(), vec![3]);
    }

    #[test]
    fn finished_beams_stop_growing_but_stay_ranked() {
        let mut beams = BeamSet::new(8, 9, 2);
        beams.advance(&[row(10, 9, -0.05)]);
        // One beam finished on eos; the runner-up is still alive.
        assert!(!beams.all_finished());
        assert_eq!(beams.unfinished_prefixes().len(), 1);
        let before = beams.beams.iter().filter(|b| b.finished).count();
        assert_eq!(before, 1);
        beams.advance(&[row(10, 2, -8.0)]);
        // The finished hypothesis was carried through unchanged.
        assert_eq!(beams.beams.iter().filter(|b| b.finished).count(), 1);
    }

    #[test]
    fn special_tokens_are_stripped_from_the_result() {
        let mut beams = BeamSet::new(8, 9, 1);
        beams.advance(&[row(10, 4, -0.1)]);
        beams.advance(&[row(10, 5, -0.1)]);
        beams.advance(&[row(10, 9, -0.1)]);
        assert_eq!(beams.best_tokens(), vec![4, 5]);
    }

    #[test]
    fn prediction_record_populates_exactly_one_side() {
        let source = serde_json::json!({"image_path": "x.jpg", "text": "a mug"});
        let ok = PredictionRecord::ok(&source, "x.jpg", "a cup".into());
        assert!(ok.pred_text.is_some() && ok.error.is_none());
        assert_eq!(ok.extra.get("text").unwrap(), "a mug");

        let failed = PredictionRecord::failed(&source, "x.jpg", ERROR_IMAGE_NOT_FOUND);
        assert!(failed.pred_text.is_none());
        assert_eq!(failed.error.as_deref(), Some(ERROR_IMAGE_NOT_FOUND));

        // Serialized form keeps explicit nulls for the empty side.
        let json = serde_json::to_value(&failed).unwrap();
        assert!(json.get("pred_text").unwrap().is_null());
    }
}
