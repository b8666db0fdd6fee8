//! Image and text preprocessing
//!
//! `CaptionProcessor` bundles the image normalisation settings and the
//! WordPiece tokenizer so that training and inference encode inputs the same
//! way. The configuration is persisted next to trained adapters and reloaded
//! from there at caption time.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tokenizers::{
    PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer, TruncationDirection,
    TruncationParams, TruncationStrategy,
};

use crate::error::{Error, Result};

/// Name of the persisted preprocessing configuration file.
pub const PROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";
/// Name of the persisted tokenizer file.
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Image/text preprocessing settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorConfig {
    /// Square target size images are resized to
    pub image_size: usize,
    /// Per-channel normalisation mean
    pub image_mean: [f32; 3],
    /// Per-channel normalisation standard deviation
    pub image_std: [f32; 3],
    /// Maximum token length; longer captions are truncated
    pub max_text_length: usize,
    /// Token id used for padding
    pub pad_token_id: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            image_size: 384,
            image_mean: [0.481_454_66, 0.457_827_5, 0.408_210_73],
            image_std: [0.268_629_54, 0.261_302_58, 0.275_777_11],
            max_text_length: 512,
            pad_token_id: 0,
        }
    }
}

/// Joint image/text encoder shared by collation and inference.
///
/// Holds no mutable state after construction, so it can be used from
/// parallel data workers.
pub struct CaptionProcessor {
    tokenizer: Tokenizer,
    config: ProcessorConfig,
}

impl CaptionProcessor {
    /// Build a processor from an already-loaded tokenizer.
    pub fn from_tokenizer(mut tokenizer: Tokenizer, config: ProcessorConfig) -> Result<Self> {
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Right,
            pad_to_multiple_of: None,
            pad_id: config.pad_token_id,
            pad_type_id: 0,
            pad_token: "[PAD]".to_string(),
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: config.max_text_length,
                strategy: TruncationStrategy::LongestFirst,
                stride: 0,
                direction: TruncationDirection::Right,
            }))
            .map_err(Error::tokenizer)?;
        Ok(Self { tokenizer, config })
    }

    /// Build a processor from a `tokenizer.json` file.
    pub fn from_files(tokenizer_path: &Path, config: ProcessorConfig) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_path).map_err(Error::tokenizer)?;
        Self::from_tokenizer(tokenizer, config)
    }

    /// Load a processor previously persisted with [`CaptionProcessor::save`].
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(PROCESSOR_CONFIG_FILE);
        if !config_path.exists() {
            return Err(Error::NotFound(config_path));
        }
        let config: ProcessorConfig = serde_json::from_str(&fs::read_to_string(&config_path)?)?;
        Self::from_files(&dir.join(TOKENIZER_FILE), config)
    }

    /// Persist the preprocessing configuration and tokenizer into `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(
            dir.join(PROCESSOR_CONFIG_FILE),
            serde_json::to_string_pretty(&self.config)?,
        )?;
        self.tokenizer
            .save(dir.join(TOKENIZER_FILE), false)
            .map_err(Error::tokenizer)?;
        Ok(())
    }

    /// Preprocessing settings in effect.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Decode an image file into a normalised `(3, S, S)` F32 tensor on CPU.
    pub fn preprocess_image(&self, path: &Path) -> Result<Tensor> {
        if !path.exists() {
            return Err(Error::NotFound(path.to_path_buf()));
        }
        let img = image::open(path).map_err(|e| Error::ImageDecode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let size = self.config.image_size;
        let img = img
            .resize_exact(size as u32, size as u32, FilterType::Triangle)
            .to_rgb8();
        let data = img.into_raw();
        let pixels = Tensor::from_vec(data, (size, size, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?
            .affine(1.0 / 255.0, 0.0)?;
        let mean = Tensor::new(&self.config.image_mean, &Device::Cpu)?.reshape((3, 1, 1))?;
        let std = Tensor::new(&self.config.image_std, &Device::Cpu)?.reshape((3, 1, 1))?;
        Ok(pixels.broadcast_sub(&mean)?.broadcast_div(&std)?)
    }

    /// Tokenize a batch of captions, padded to the longest in the batch and
    /// truncated to the model maximum. Returns `(input_ids, attention_mask)`
    /// as `(B, L)` U32 tensors on CPU.
    pub fn encode_texts(&self, texts: &[&str]) -> Result<(Tensor, Tensor)> {
        let inputs: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(Error::tokenizer)?;
        let batch = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);
        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }
        let input_ids = Tensor::from_vec(ids, (batch, seq_len), &Device::Cpu)?;
        let attention_mask = Tensor::from_vec(mask, (batch, seq_len), &Device::Cpu)?;
        Ok((input_ids, attention_mask))
    }

    /// Decode generated token ids into text, dropping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let text = self
            .tokenizer
            .decode(ids, true)
            .map_err(Error::tokenizer)?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Tiny in-memory tokenizer so unit tests never touch the network.

    use std::collections::HashMap;

    use tokenizers::models::wordpiece::WordPiece;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;
    use tokenizers::processors::template::TemplateProcessing;
    use tokenizers::{AddedToken, Tokenizer};

    use super::{CaptionProcessor, ProcessorConfig};

    /// Vocabulary shared by all processor tests.
    pub fn tiny_tokenizer() -> Tokenizer {
        let vocab: HashMap<String, u32> = [
            "[PAD]", "[UNK]", "[CLS]", "[SEP]", "a", "red", "blue", "mug", "shoe", "on", "table",
        ]
        .iter()
        .enumerate()
        .map(|(i, token)| (token.to_string(), i as u32))
        .collect();
        let model = WordPiece::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
        tokenizer.with_post_processor(Some(
            TemplateProcessing::builder()
                .try_single("[CLS] $A [SEP]")
                .unwrap()
                .special_tokens(vec![("[CLS]", 2), ("[SEP]", 3)])
                .build()
                .unwrap(),
        ));
        tokenizer.add_special_tokens(&[
            AddedToken::from("[PAD]", true),
            AddedToken::from("[UNK]", true),
            AddedToken::from("[CLS]", true),
            AddedToken::from("[SEP]", true),
        ]);
        tokenizer
    }

    /// Processor over the tiny vocabulary with a small image size.
    pub fn tiny_processor() -> CaptionProcessor {
        let config = ProcessorConfig {
            image_size: 32,
            max_text_length: 16,
            ..Default::default()
        };
        CaptionProcessor::from_tokenizer(tiny_tokenizer(), config).unwrap()
    }
}
