//! ViT image encoder
//!
//! Patch-convolution embeddings with a class token and learned positions,
//! followed by pre-norm transformer blocks with fused qkv attention. Layout
//! matches the BLIP vision tower checkpoint; all weights stay frozen.

use candle_core::{IndexOp, Module, Tensor, D};
use candle_nn::{conv2d, layer_norm, Conv2d, Conv2dConfig, LayerNorm, VarBuilder};
use candle_transformers::models::with_tracing::{linear, Linear};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Vision tower hyperparameters (defaults match BLIP base, ViT-B/16 at 384).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionConfig {
    /// Hidden width
    pub hidden_size: usize,
    /// Feed-forward width
    pub intermediate_size: usize,
    /// Number of encoder blocks
    pub num_hidden_layers: usize,
    /// Attention heads per block
    pub num_attention_heads: usize,
    /// Input image side length
    pub image_size: usize,
    /// Patch side length
    pub patch_size: usize,
    /// LayerNorm epsilon
    pub layer_norm_eps: f64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            intermediate_size: 3072,
            num_hidden_layers: 12,
            num_attention_heads: 12,
            image_size: 384,
            patch_size: 16,
            layer_norm_eps: 1e-5,
        }
    }
}

impl VisionConfig {
    /// Sequence length produced by the tower: patches plus the class token.
    pub fn num_positions(&self) -> usize {
        (self.image_size / self.patch_size).pow(2) + 1
    }
}

struct VisionEmbeddings {
    class_embedding: Tensor,
    patch_embedding: Conv2d,
    position_embedding: Tensor,
}

impl VisionEmbeddings {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let conv_config = Conv2dConfig {
            stride: config.patch_size,
            ..Default::default()
        };
        Ok(Self {
            class_embedding: vb.get((1, 1, config.hidden_size), "class_embedding")?,
            patch_embedding: conv2d(
                3,
                config.hidden_size,
                config.patch_size,
                conv_config,
                vb.pp("patch_embedding"),
            )?,
            position_embedding: vb.get(
                (1, config.num_positions(), config.hidden_size),
                "position_embedding",
            )?,
        })
    }

    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let batch = pixel_values.dim(0)?;
        let patches = self.patch_embedding.forward(pixel_values)?;
        let patches = patches.flatten_from(2)?.transpose(1, 2)?;
        let class_embeds = self
            .class_embedding
            .expand((batch, 1, self.class_embedding.dim(2)?))?;
        let embeddings = Tensor::cat(&[&class_embeds.contiguous()?, &patches], 1)?;
        Ok(embeddings.broadcast_add(&self.position_embedding)?)
    }
}

struct VisionAttention {
    qkv: Linear,
    projection: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = config.hidden_size;
        Ok(Self {
            qkv: linear(hidden, hidden * 3, vb.pp("qkv"))?,
            projection: linear(hidden, hidden, vb.pp("projection"))?,
            num_heads: config.num_attention_heads,
            head_dim: hidden / config.num_attention_heads,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, width) = xs.dims3()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((batch, seq_len, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;
        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let scale = (self.head_dim as f64).powf(-0.5);
        let scores = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * scale)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_len, width))?;
        Ok(self.projection.forward(&context)?)
    }
}

struct VisionMlp {
    fc1: Linear,
    fc2: Linear,
}

impl VisionMlp {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(config.hidden_size, config.intermediate_size, vb.pp("fc1"))?,
            fc2: linear(config.intermediate_size, config.hidden_size, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.fc2.forward(&self.fc1.forward(xs)?.gelu_erf()?)?)
    }
}

struct VisionLayer {
    self_attn: VisionAttention,
    layer_norm1: LayerNorm,
    mlp: VisionMlp,
    layer_norm2: LayerNorm,
}

impl VisionLayer {
    fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: VisionAttention::new(config, vb.pp("self_attn"))?,
            layer_norm1: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("layer_norm1"),
            )?,
            mlp: VisionMlp::new(config, vb.pp("mlp"))?,
            layer_norm2: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("layer_norm2"),
            )?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = (self.self_attn.forward(&self.layer_norm1.forward(xs)?)? + xs)?;
        Ok((self.mlp.forward(&self.layer_norm2.forward(&xs)?)? + xs)?)
    }
}

/// The frozen image encoder.
pub struct VisionModel {
    embeddings: VisionEmbeddings,
    layers: Vec<VisionLayer>,
    post_layernorm: LayerNorm,
}

impl VisionModel {
    /// Build the tower under `vb` (rooted at `vision_model`).
    pub fn new(config: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = VisionEmbeddings::new(config, vb.pp("embeddings"))?;
        let layer_vb = vb.pp("encoder").pp("layers");
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for index in 0..config.num_hidden_layers {
            layers.push(VisionLayer::new(config, layer_vb.pp(index.to_string()))?);
        }
        Ok(Self {
            embeddings,
            layers,
            post_layernorm: layer_norm(
                config.hidden_size,
                config.layer_norm_eps,
                vb.pp("post_layernorm"),
            )?,
        })
    }

    /// Encode `(B, 3, S, S)` pixels into `(B, P + 1, H)` features.
    pub fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut hidden = self.embeddings.forward(pixel_values)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }
        Ok(self.post_layernorm.forward(&hidden)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn encodes_images_into_patch_sequence() {
        let config = VisionConfig {
            hidden_size: 8,
            intermediate_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            image_size: 16,
            patch_size: 8,
            ..Default::default()
        };
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = VisionModel::new(&config, vb.pp("vision_model")).unwrap();
        let pixels = Tensor::zeros((2, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
        let features = model.forward(&pixels).unwrap();
        // 4 patches + class token
        assert_eq!(features.dims(), &[2, 5, 8]);
    }
}
