#![allow(dead_code)]

//! Shared fixtures for integration tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::processors::template::TemplateProcessing;
use tokenizers::{AddedToken, Tokenizer};

use captune::model::{TextConfig, VisionConfig};
use captune::{CaptionConfig, CaptionModel, CaptionProcessor, ProcessorConfig};

/// WordPiece tokenizer over a handful of product words.
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

/// Processor over the tiny vocabulary with small images.
pub fn tiny_processor() -> Arc<CaptionProcessor> {
    let config = ProcessorConfig {
        image_size: 16,
        max_text_length: 8,
        ..Default::default()
    };
    Arc::new(CaptionProcessor::from_tokenizer(tiny_tokenizer(), config).unwrap())
}

/// Model configuration small enough for CPU tests.
pub fn tiny_model_config() -> CaptionConfig {
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
            num_hidden_layers: 1,
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

/// Zero-weight caption model matching [`tiny_model_config`].
pub fn tiny_model() -> CaptionModel {
    let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
    CaptionModel::new(&tiny_model_config(), vb, None).unwrap()
}

/// Write a solid-colour PNG at `path`.
pub fn write_png(path: &Path, shade: u8) {
    image::RgbImage::from_pixel(16, 16, image::Rgb([shade, 60, 180]))
        .save(path)
        .unwrap();
}
