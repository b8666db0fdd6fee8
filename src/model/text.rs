//! Causal text decoder with cross-attention over image features
//!
//! BERT-style stack matching the BLIP text-decoder checkpoint layout:
//! every layer runs causal self-attention, cross-attention against the
//! vision tower output, and a feed-forward block, followed by a tied LM
//! head. Query/key/value projections are [`AdaptedLinear`]s so low-rank
//! adapters can be injected without touching the frozen weights.

use candle_core::{DType, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, VarBuilder};
use candle_transformers::models::with_tracing::{linear, Linear};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::adapter::{AdaptedLinear, AdapterBuilder};

/// Text decoder hyperparameters (defaults match BLIP base).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextConfig {
    /// Vocabulary size including the decoder bos token
    pub vocab_size: usize,
    /// Hidden width
    pub hidden_size: usize,
    /// Number of decoder layers
    pub num_hidden_layers: usize,
    /// Attention heads per layer
    pub num_attention_heads: usize,
    /// Feed-forward width
    pub intermediate_size: usize,
    /// Maximum sequence length supported by the position table
    pub max_position_embeddings: usize,
    /// LayerNorm epsilon
    pub layer_norm_eps: f64,
    /// Width of the cross-attended image features
    pub encoder_hidden_size: usize,
    /// Padding token id
    pub pad_token_id: u32,
    /// Decoder start-of-sequence token id
    pub bos_token_id: u32,
    /// End-of-sequence token id
    pub sep_token_id: u32,
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            vocab_size: 30524,
            hidden_size: 768,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            intermediate_size: 3072,
            max_position_embeddings: 512,
            layer_norm_eps: 1e-12,
            encoder_hidden_size: 768,
            pad_token_id: 0,
            bos_token_id: 30522,
            sep_token_id: 102,
        }
    }
}

struct TextEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
}

impl TextEmbeddings {
    fn new(config: &TextConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            word_embeddings: embedding(
                config.vocab_size,
                config.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            layer_norm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("LayerNorm"),
            )?,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(&positions)?;
        Ok(self.layer_norm.forward(&words.broadcast_add(&positions)?)?)
    }
}

/// Multi-head attention whose q/k/v projections accept adapter deltas.
struct TextSelfAttention {
    query: AdaptedLinear,
    key: AdaptedLinear,
    value: AdaptedLinear,
    num_heads: usize,
    head_dim: usize,
}

impl TextSelfAttention {
    fn new(
        config: &TextConfig,
        kv_width: usize,
        vb: VarBuilder,
        adapters: Option<&AdapterBuilder>,
        path: &str,
    ) -> Result<Self> {
        let hidden = config.hidden_size;
        let make = |module: &str, in_dim: usize| -> Result<AdaptedLinear> {
            let inner = linear(in_dim, hidden, vb.pp(module))?;
            let delta = match adapters {
                Some(builder) => {
                    builder.maybe_delta(module, &format!("{path}.{module}"), in_dim, hidden)?
                }
                None => None,
            };
            Ok(AdaptedLinear::new(inner, delta))
        };
        Ok(Self {
            query: make("query", hidden)?,
            key: make("key", kv_width)?,
            value: make("value", kv_width)?,
            num_heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        Ok(xs
            .reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn forward_t(
        &self,
        hidden: &Tensor,
        kv_input: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq_len, width) = hidden.dims3()?;
        let q = self.split_heads(&self.query.forward_t(hidden, train)?)?;
        let k = self.split_heads(&self.key.forward_t(kv_input, train)?)?;
        let v = self.split_heads(&self.value.forward_t(kv_input, train)?)?;

        let scale = (self.head_dim as f64).powf(-0.5);
        let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * scale)?;
        let scores = match attention_mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs.matmul(&v)?;
        Ok(context
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, width))?)
    }
}

struct TextSelfOutput {
    dense: Linear,
    layer_norm: LayerNorm,
}

impl TextSelfOutput {
    fn new(config: &TextConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear(config.hidden_size, config.hidden_size, vb.pp("dense"))?,
            layer_norm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("LayerNorm"),
            )?,
        })
    }

    fn forward(&self, hidden: &Tensor, residual: &Tensor) -> Result<Tensor> {
        Ok(self
            .layer_norm
            .forward(&(self.dense.forward(hidden)? + residual)?)?)
    }
}

struct TextAttention {
    attention: TextSelfAttention,
    output: TextSelfOutput,
}

impl TextAttention {
    fn new(
        config: &TextConfig,
        kv_width: usize,
        vb: VarBuilder,
        adapters: Option<&AdapterBuilder>,
        path: &str,
    ) -> Result<Self> {
        Ok(Self {
            attention: TextSelfAttention::new(
                config,
                kv_width,
                vb.pp("self"),
                adapters,
                &format!("{path}.self"),
            )?,
            output: TextSelfOutput::new(config, vb.pp("output"))?,
        })
    }

    fn forward_t(
        &self,
        hidden: &Tensor,
        kv_input: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let context = self
            .attention
            .forward_t(hidden, kv_input, attention_mask, train)?;
        self.output.forward(&context, hidden)
    }
}

struct TextLayer {
    attention: TextAttention,
    cross_attention: TextAttention,
    intermediate: Linear,
    output_dense: Linear,
    output_norm: LayerNorm,
}

impl TextLayer {
    fn new(
        config: &TextConfig,
        vb: VarBuilder,
        adapters: Option<&AdapterBuilder>,
        path: &str,
    ) -> Result<Self> {
        Ok(Self {
            attention: TextAttention::new(
                config,
                config.hidden_size,
                vb.pp("attention"),
                adapters,
                &format!("{path}.attention"),
            )?,
            cross_attention: TextAttention::new(
                config,
                config.encoder_hidden_size,
                vb.pp("crossattention"),
                adapters,
                &format!("{path}.crossattention"),
            )?,
            intermediate: linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            output_dense: linear(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("output").pp("dense"),
            )?,
            output_norm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("output").pp("LayerNorm"),
            )?,
        })
    }

    fn forward_t(
        &self,
        hidden: &Tensor,
        image_embeds: &Tensor,
        causal_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let hidden = self
            .attention
            .forward_t(hidden, hidden, Some(causal_mask), train)?;
        let hidden = self
            .cross_attention
            .forward_t(&hidden, image_embeds, None, train)?;
        let intermediate = self.intermediate.forward(&hidden)?.gelu_erf()?;
        Ok(self
            .output_norm
            .forward(&(self.output_dense.forward(&intermediate)? + hidden)?)?)
    }
}

struct TextLMHead {
    transform_dense: Linear,
    transform_norm: LayerNorm,
    decoder: candle_nn::Linear,
}

impl TextLMHead {
    fn new(config: &TextConfig, vb: VarBuilder) -> Result<Self> {
        // The vocabulary bias is stored beside the head, not inside the
        // decoder projection, in BLIP checkpoints.
        let weight = vb
            .pp("decoder")
            .get((config.vocab_size, config.hidden_size), "weight")?;
        let bias = vb.get(config.vocab_size, "bias")?;
        Ok(Self {
            transform_dense: linear(
                config.hidden_size,
                config.hidden_size,
                vb.pp("transform").pp("dense"),
            )?,
            transform_norm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("transform").pp("LayerNorm"),
            )?,
            decoder: candle_nn::Linear::new(weight, Some(bias)),
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let hidden = self.transform_dense.forward(hidden)?.gelu_erf()?;
        Ok(self.decoder.forward(&self.transform_norm.forward(&hidden)?)?)
    }
}

/// The full text decoder: embeddings, layer stack, LM head.
pub struct TextDecoder {
    embeddings: TextEmbeddings,
    layers: Vec<TextLayer>,
    lm_head: TextLMHead,
    config: TextConfig,
}

impl TextDecoder {
    /// Build the decoder under `vb` (rooted at `text_decoder`), wiring
    /// adapter deltas into targeted sublayers when `adapters` is given.
    pub fn new(
        config: &TextConfig,
        vb: VarBuilder,
        adapters: Option<&AdapterBuilder>,
    ) -> Result<Self> {
        let bert = vb.pp("bert");
        let embeddings = TextEmbeddings::new(config, bert.pp("embeddings"))?;
        let layer_vb = bert.pp("encoder").pp("layer");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for index in 0..config.num_hidden_layers {
            layers.push(TextLayer::new(
                config,
                layer_vb.pp(index.to_string()),
                adapters,
                &format!("text_decoder.bert.encoder.layer.{index}"),
            )?);
        }
        let lm_head = TextLMHead::new(config, vb.pp("cls").pp("predictions"))?;
        Ok(Self {
            embeddings,
            layers,
            lm_head,
            config: config.clone(),
        })
    }

    /// Decoder hyperparameters.
    pub fn config(&self) -> &TextConfig {
        &self.config
    }

    /// Next-token logits for `input_ids` conditioned on `image_embeds`.
    ///
    /// `attention_mask` is the `(B, L)` padding mask from collation; `None`
    /// means no padding (single-sequence generation).
    pub fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        image_embeds: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let hidden = self.embeddings.forward(input_ids)?;
        let mask = causal_attention_mask(
            batch,
            seq_len,
            attention_mask,
            hidden.dtype(),
            input_ids.device(),
        )?;
        let mut hidden = hidden;
        for layer in &self.layers {
            hidden = layer.forward_t(&hidden, image_embeds, &mask, train)?;
        }
        self.lm_head.forward(&hidden)
    }
}

/// Additive attention mask combining causality with key padding.
fn causal_attention_mask(
    batch: usize,
    seq_len: usize,
    padding_mask: Option<&Tensor>,
    dtype: DType,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let entries: Vec<f32> = (0..seq_len)
        .flat_map(|query| {
            (0..seq_len).map(move |key| if key <= query { 0.0 } else { f32::NEG_INFINITY })
        })
        .collect();
    let mut mask = Tensor::from_vec(entries, (1, 1, seq_len, seq_len), device)?;
    if let Some(padding) = padding_mask {
        // 1 for real tokens, 0 for pads; turn pads into a large negative bias.
        let inverted = ((padding.to_dtype(DType::F32)? * -1.0)? + 1.0)?;
        let bias = (inverted * -1e9)?.reshape((batch, 1, 1, seq_len))?;
        mask = mask.broadcast_add(&bias)?;
    }
    Ok(mask.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tiny_config() -> TextConfig {
        TextConfig {
            vocab_size: 32,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 16,
            encoder_hidden_size: 8,
            bos_token_id: 30,
            sep_token_id: 31,
            ..Default::default()
        }
    }

    #[test]
    fn forward_shapes_match_config() {
        let config = tiny_config();
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let decoder = TextDecoder::new(&config, vb.pp("text_decoder"), None).unwrap();
        let ids = Tensor::zeros((2, 5), DType::U32, &Device::Cpu).unwrap();
        let image_embeds = Tensor::zeros((2, 4, 8), DType::F32, &Device::Cpu).unwrap();
        let logits = decoder.forward_t(&ids, None, &image_embeds, false).unwrap();
        assert_eq!(logits.dims(), &[2, 5, 32]);
    }

    #[test]
    fn causal_mask_blocks_future_positions() {
        let mask = causal_attention_mask(1, 3, None, DType::F32, &Device::Cpu).unwrap();
        let rows = mask
            .reshape((3, 3))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite() && rows[0][1] < 0.0);
        assert_eq!(rows[2][2], 0.0);
    }

    #[test]
    fn padding_mask_is_folded_in() {
        let padding = Tensor::new(&[[1u32, 1, 0]], &Device::Cpu).unwrap();
        let mask =
            causal_attention_mask(1, 3, Some(&padding), DType::F32, &Device::Cpu).unwrap();
        let rows = mask
            .reshape((3, 3))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        // Last key column is padded: strongly negative even below the diagonal.
        assert!(rows[2][2] <= -1e8);
        assert_eq!(rows[2][0], 0.0);
    }
}
