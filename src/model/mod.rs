//! The caption model: frozen BLIP-style base plus optional LoRA adapters

pub mod adapter;
pub mod text;
pub mod vision;

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

use crate::data::CaptionBatch;
use crate::error::{Error, Result};

pub use adapter::{AdapterBuilder, AdapterMetadata, LoraConfig};
pub use text::{TextConfig, TextDecoder};
pub use vision::{VisionConfig, VisionModel};

/// Full model hyperparameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaptionConfig {
    /// Vision tower settings
    pub vision: VisionConfig,
    /// Text decoder settings
    pub text: TextConfig,
}

impl CaptionConfig {
    /// Configuration matching `Salesforce/blip-image-captioning-base`.
    pub fn blip_base() -> Self {
        Self::default()
    }
}

/// Image-conditioned caption generator.
///
/// The base weights come from a read-only `VarBuilder` and stay frozen for
/// the lifetime of the model; when an [`AdapterBuilder`] is supplied, the
/// targeted decoder sublayers gain trainable low-rank deltas and those
/// deltas are the model's entire trainable parameter set.
pub struct CaptionModel {
    vision: VisionModel,
    text: TextDecoder,
    config: CaptionConfig,
}

impl CaptionModel {
    /// Build the model, optionally attaching adapters to the text decoder.
    pub fn new(
        config: &CaptionConfig,
        vb: VarBuilder,
        adapters: Option<&AdapterBuilder>,
    ) -> Result<Self> {
        let vision = VisionModel::new(&config.vision, vb.pp("vision_model"))?;
        let text = TextDecoder::new(&config.text, vb.pp("text_decoder"), adapters)?;
        Ok(Self {
            vision,
            text,
            config: config.clone(),
        })
    }

    /// Model hyperparameters.
    pub fn config(&self) -> &CaptionConfig {
        &self.config
    }

    /// Encode images into the feature sequence the decoder attends over.
    pub fn encode_image(&self, pixel_values: &Tensor) -> Result<Tensor> {
        self.vision.forward(pixel_values)
    }

    /// Decoder logits for token ids conditioned on image features.
    pub fn decode_text(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        image_embeds: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        self.text.forward_t(input_ids, attention_mask, image_embeds, train)
    }

    /// Native sequence-generation loss for one batch.
    pub fn forward_train(&self, batch: &CaptionBatch, train: bool) -> Result<Tensor> {
        let image_embeds = self.encode_image(&batch.pixel_values)?;
        let logits = self.decode_text(
            &batch.input_ids,
            Some(&batch.attention_mask),
            &image_embeds,
            train,
        )?;
        generation_loss(&logits, &batch.labels, self.config.text.pad_token_id)
    }
}

/// Shifted next-token cross-entropy, averaged over non-pad targets.
///
/// Computed in F32 regardless of the forward dtype.
pub fn generation_loss(logits: &Tensor, labels: &Tensor, pad_token_id: u32) -> Result<Tensor> {
    let (batch, seq_len, vocab) = logits.dims3()?;
    if seq_len < 2 {
        return Err(Error::invalid_input(
            "caption batches must contain at least two tokens per row",
        ));
    }
    let span = seq_len - 1;
    let logits = logits.narrow(1, 0, span)?.to_dtype(DType::F32)?;
    let targets = labels.narrow(1, 1, span)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let flat = log_probs.reshape((batch * span, vocab))?;
    let target_flat = targets.reshape((batch * span, 1))?;
    let picked = flat.gather(&target_flat, 1)?.squeeze(1)?;

    let mask = targets
        .reshape((batch * span,))?
        .ne(pad_token_id)?
        .to_dtype(DType::F32)?;
    let count = mask.sum_all()?.to_scalar::<f32>()? as f64;
    Ok(((picked * mask)?.sum_all()? * (-1.0 / count.max(1.0)))?)
}

/// On-disk assets of a pretrained base model.
pub struct ModelAssets {
    /// Safetensors weight files
    pub weights: Vec<PathBuf>,
    /// Tokenizer definition
    pub tokenizer: PathBuf,
}

impl ModelAssets {
    /// Resolve assets for `model_id`: a local directory holding
    /// `model.safetensors` and `tokenizer.json`, or a hub model id to fetch.
    pub fn resolve(model_id: &str) -> Result<Self> {
        let dir = Path::new(model_id);
        if dir.is_dir() {
            let weights = dir.join("model.safetensors");
            let tokenizer = dir.join("tokenizer.json");
            for path in [&weights, &tokenizer] {
                if !path.exists() {
                    return Err(Error::NotFound(path.clone()));
                }
            }
            return Ok(Self {
                weights: vec![weights],
                tokenizer,
            });
        }
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| Error::model_loading(format!("hub api init failed: {e}")))?;
        let repo = api.model(model_id.to_string());
        let weights = repo
            .get("model.safetensors")
            .map_err(|e| Error::model_loading(format!("fetching {model_id} weights: {e}")))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .map_err(|e| Error::model_loading(format!("fetching {model_id} tokenizer: {e}")))?;
        Ok(Self {
            weights: vec![weights],
            tokenizer,
        })
    }

    /// Memory-map the weight files into a frozen `VarBuilder`.
    pub fn load_weights(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        Ok(unsafe { VarBuilder::from_mmaped_safetensors(&self.weights, dtype, device)? })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Model small enough for CPU unit tests.
    pub fn tiny_config() -> CaptionConfig {
        CaptionConfig {
            vision: VisionConfig {
                hidden_size: 8,
                intermediate_size: 16,
                num_hidden_layers: 1,
                num_attention_heads: 2,
                image_size: 16,
                patch_size: 8,
                ..Default::default()
            },
            text: TextConfig {
                vocab_size: 16,
                hidden_size: 8,
                num_hidden_layers: 2,
                num_attention_heads: 2,
                intermediate_size: 16,
                max_position_embeddings: 16,
                encoder_hidden_size: 8,
                bos_token_id: 14,
                sep_token_id: 15,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::tiny_config;
    use super::*;
    use candle_nn::VarMap;

    fn tiny_batch(device: &Device) -> CaptionBatch {
        let pixel_values = Tensor::zeros((2, 3, 16, 16), DType::F32, device).unwrap();
        let input_ids = Tensor::new(&[[14u32, 4, 5, 15], [14u32, 6, 15, 0]], device).unwrap();
        let attention_mask = Tensor::new(&[[1u32, 1, 1, 1], [1u32, 1, 1, 0]], device).unwrap();
        let labels = input_ids.copy().unwrap();
        CaptionBatch {
            pixel_values,
            input_ids,
            attention_mask,
            labels,
        }
    }

    #[test]
    fn zero_model_loss_is_log_vocab() {
        let config = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = CaptionModel::new(&config, vb, None).unwrap();
        let batch = tiny_batch(&Device::Cpu);
        let loss = model
            .forward_train(&batch, false)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // Uniform logits: cross-entropy equals ln(vocab).
        approx::assert_abs_diff_eq!(loss, (16f32).ln(), epsilon = 1e-4);
    }

    #[test]
    fn adapters_receive_gradients_and_base_has_none_to_give() {
        let config = tiny_config();
        let varmap = VarMap::new();
        let adapters =
            AdapterBuilder::new(LoraConfig::default(), &varmap, &Device::Cpu).unwrap();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = CaptionModel::new(&config, vb, Some(&adapters)).unwrap();

        // query + value, self + cross attention, 2 layers, A and B each.
        assert_eq!(varmap.all_vars().len(), 2 * 2 * 2 * 2);

        let batch = tiny_batch(&Device::Cpu);
        let loss = model.forward_train(&batch, false).unwrap();
        let grads = loss.backward().unwrap();
        for var in varmap.all_vars() {
            assert!(grads.get(&var).is_some(), "adapter var missing gradient");
        }
    }

    #[test]
    fn generation_loss_ignores_pad_targets() {
        let device = Device::Cpu;
        // Two timesteps of logits over a 4-token vocab.
        let logits = Tensor::new(
            &[[[0f32, 10., 0., 0.], [0., 10., 0., 0.], [0., 10., 0., 0.]]],
            &device,
        )
        .unwrap();
        let labels_all_real = Tensor::new(&[[3u32, 1, 1]], &device).unwrap();
        let full = generation_loss(&logits, &labels_all_real, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // Same targets but with the last position padded out.
        let labels_padded = Tensor::new(&[[3u32, 1, 0]], &device).unwrap();
        let masked = generation_loss(&logits, &labels_padded, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        // Both predict token 1 perfectly where it counts, so both are ~0,
        // and padding does not change that.
        assert!(full < 1e-3);
        assert!(masked < 1e-3);
    }
}
