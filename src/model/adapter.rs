//! Low-rank adapters
//!
//! The base model stays frozen: its weights are plain tensors for which no
//! gradient buffer ever exists. Only the low-rank factor pairs created here
//! are `Var`-backed and visible to the optimizer. An augmented sublayer
//! computes `frozen(x) + (alpha / rank) * dropout(x A^T B^T)`.

use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, Module, VarBuilder, VarMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::text::TextConfig;

/// File holding the adapter factor tensors.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
/// File holding the adapter structural metadata.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Sublayer names adapters can be injected into.
pub(crate) const INJECTABLE_MODULES: [&str; 3] = ["query", "key", "value"];

/// Low-rank adapter hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoraConfig {
    /// Rank of the factor pair
    pub rank: usize,
    /// Scaling numerator; effective scale is `alpha / rank`
    pub alpha: f64,
    /// Dropout applied to the adapter input during training
    pub dropout: f32,
    /// Attention sublayers to augment
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
            target_modules: vec!["query".to_string(), "value".to_string()],
        }
    }
}

impl LoraConfig {
    /// Effective scaling factor applied to the low-rank product.
    pub fn scaling(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    /// Validate hyperparameters.
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(Error::invalid_input("LoRA rank must be greater than 0"));
        }
        if self.rank > 512 {
            return Err(Error::invalid_input("LoRA rank should not exceed 512"));
        }
        if self.alpha <= 0.0 {
            return Err(Error::invalid_input("LoRA alpha must be positive"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::invalid_input("LoRA dropout must be in [0, 1)"));
        }
        if self.target_modules.is_empty() {
            return Err(Error::invalid_input(
                "at least one target module must be specified",
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for module in &self.target_modules {
            if !seen.insert(module.as_str()) {
                return Err(Error::invalid_input(format!(
                    "duplicate target module: {module}"
                )));
            }
        }
        Ok(())
    }
}

/// One trainable factor pair attached to a frozen linear sublayer.
#[derive(Debug)]
pub struct LoraDelta {
    a: Tensor,
    b: Tensor,
    scaling: f64,
    dropout: f32,
}

impl LoraDelta {
    /// Create factors under `vb`: `A` is Kaiming-initialised, `B` starts at
    /// zero so the augmented sublayer initially equals the frozen one.
    pub fn new(in_dim: usize, out_dim: usize, config: &LoraConfig, vb: VarBuilder) -> Result<Self> {
        let a = vb.get_with_hints(
            (config.rank, in_dim),
            "lora_a.weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let b = vb.get_with_hints((out_dim, config.rank), "lora_b.weight", Init::Const(0.0))?;
        Ok(Self {
            a,
            b,
            scaling: config.scaling(),
            dropout: config.dropout,
        })
    }

    /// Scaled low-rank contribution for `xs` of shape `(B, L, in_dim)`.
    ///
    /// Dropout fires only when `train` is set. The factor masters stay in
    /// F32 and are cast into the activation dtype here, so gradients flow
    /// back to full-precision parameters.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = if train && self.dropout > 0.0 {
            candle_nn::ops::dropout(xs, self.dropout)?
        } else {
            xs.clone()
        };
        let a = self.a.to_dtype(xs.dtype())?;
        let b = self.b.to_dtype(xs.dtype())?;
        let (batch, seq_len, in_dim) = xs.dims3()?;
        let flat = xs.reshape((batch * seq_len, in_dim))?;
        let delta = flat.matmul(&a.t()?)?.matmul(&b.t()?)?;
        Ok((delta.reshape((batch, seq_len, ()))? * self.scaling)?)
    }
}

/// A frozen linear sublayer, optionally augmented with a low-rank delta.
#[derive(Debug)]
pub struct AdaptedLinear {
    inner: candle_transformers::models::with_tracing::Linear,
    delta: Option<LoraDelta>,
}

impl AdaptedLinear {
    /// Wrap a frozen linear with an optional adapter.
    pub fn new(
        inner: candle_transformers::models::with_tracing::Linear,
        delta: Option<LoraDelta>,
    ) -> Self {
        Self { inner, delta }
    }

    /// Whether an adapter is attached.
    pub fn is_adapted(&self) -> bool {
        self.delta.is_some()
    }

    /// Frozen output plus the adapter contribution, if any.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let base = self.inner.forward(xs)?;
        match &self.delta {
            None => Ok(base),
            Some(delta) => Ok((base + delta.forward_t(xs, train)?)?),
        }
    }
}

/// Creates deltas for targeted sublayers while the model is being built.
///
/// All factors live in one `VarMap`, which is the complete trainable
/// parameter set handed to the optimizer and persisted at training end.
pub struct AdapterBuilder {
    config: LoraConfig,
    vb: VarBuilder<'static>,
}

impl std::fmt::Debug for AdapterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AdapterBuilder {
    /// Validate the config and prepare a builder writing into `varmap`.
    pub fn new(config: LoraConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        config.validate()?;
        for module in &config.target_modules {
            if !INJECTABLE_MODULES.contains(&module.as_str()) {
                return Err(Error::architecture_mismatch(format!(
                    "target sublayer '{module}' does not exist in the text decoder attention"
                )));
            }
        }
        Ok(Self {
            config,
            vb: VarBuilder::from_varmap(varmap, DType::F32, device),
        })
    }

    /// Adapter hyperparameters.
    pub fn config(&self) -> &LoraConfig {
        &self.config
    }

    /// Build a delta for `module` at `path` when it is targeted.
    pub(crate) fn maybe_delta(
        &self,
        module: &str,
        path: &str,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<Option<LoraDelta>> {
        if self.config.target_modules.iter().any(|t| t == module) {
            Ok(Some(LoraDelta::new(
                in_dim,
                out_dim,
                &self.config,
                self.vb.pp(path),
            )?))
        } else {
            Ok(None)
        }
    }
}

/// Structural metadata persisted alongside the adapter factors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterMetadata {
    /// Base checkpoint the adapter was trained on
    pub base_model: String,
    /// Factor rank
    pub rank: usize,
    /// Scaling numerator
    pub alpha: f64,
    /// Training-time dropout
    pub dropout: f32,
    /// Augmented sublayer names
    pub target_modules: Vec<String>,
    /// Decoder depth of the base model
    pub num_decoder_layers: usize,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl AdapterMetadata {
    /// Record the structure of a freshly trained adapter.
    pub fn new(base_model: &str, config: &LoraConfig, num_decoder_layers: usize) -> Self {
        Self {
            base_model: base_model.to_string(),
            rank: config.rank,
            alpha: config.alpha,
            dropout: config.dropout,
            target_modules: config.target_modules.clone(),
            num_decoder_layers,
            created_at: Utc::now(),
        }
    }

    /// Rebuild the adapter hyperparameters for re-attachment.
    pub fn lora_config(&self) -> LoraConfig {
        LoraConfig {
            rank: self.rank,
            alpha: self.alpha,
            dropout: self.dropout,
            target_modules: self.target_modules.clone(),
        }
    }

    /// Check that this adapter fits the given decoder architecture.
    pub fn validate_against(&self, text_config: &TextConfig) -> Result<()> {
        for module in &self.target_modules {
            if !INJECTABLE_MODULES.contains(&module.as_str()) {
                return Err(Error::architecture_mismatch(format!(
                    "stored target sublayer '{module}' is absent from this architecture"
                )));
            }
        }
        if self.num_decoder_layers != text_config.num_hidden_layers {
            return Err(Error::architecture_mismatch(format!(
                "adapter was trained on {} decoder layers, model has {}",
                self.num_decoder_layers, text_config.num_hidden_layers
            )));
        }
        Ok(())
    }
}

/// Persist the adapter factors and metadata into `dir`.
pub fn save_adapter(dir: &Path, varmap: &VarMap, metadata: &AdapterMetadata) -> Result<()> {
    fs::create_dir_all(dir)?;
    varmap.save(dir.join(ADAPTER_WEIGHTS_FILE))?;
    fs::write(
        dir.join(ADAPTER_CONFIG_FILE),
        serde_json::to_string_pretty(metadata)?,
    )?;
    Ok(())
}

/// Read adapter metadata from `dir`.
pub fn load_adapter_metadata(dir: &Path) -> Result<AdapterMetadata> {
    let path = dir.join(ADAPTER_CONFIG_FILE);
    if !path.exists() {
        return Err(Error::NotFound(path));
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// Load previously saved factors into the vars of a re-attached adapter.
pub fn load_adapter_weights(dir: &Path, varmap: &mut VarMap) -> Result<()> {
    let path = dir.join(ADAPTER_WEIGHTS_FILE);
    if !path.exists() {
        return Err(Error::NotFound(path));
    }
    varmap.load(&path).map_err(|e| {
        Error::architecture_mismatch(format!("saved adapter does not match this model: {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_transformers::models::with_tracing::linear;

    fn frozen_linear(in_dim: usize, out_dim: usize) -> candle_transformers::models::with_tracing::Linear {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        linear(in_dim, out_dim, vb.pp("dense")).unwrap()
    }

    #[test]
    fn fresh_adapter_contributes_nothing() {
        // B starts at zero, so the delta must be exactly zero.
        let varmap = VarMap::new();
        let builder =
            AdapterBuilder::new(LoraConfig::default(), &varmap, &Device::Cpu).unwrap();
        let delta = builder
            .maybe_delta("query", "layer.0.query", 16, 16)
            .unwrap()
            .unwrap();
        let layer = AdaptedLinear::new(frozen_linear(16, 16), Some(delta));
        let xs = Tensor::randn(0f32, 1f32, (2, 3, 16), &Device::Cpu).unwrap();
        let out = layer.forward_t(&xs, false).unwrap();
        let magnitude = out
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(magnitude, 0.0);
    }

    #[test]
    fn untargeted_modules_get_no_delta() {
        let varmap = VarMap::new();
        let builder =
            AdapterBuilder::new(LoraConfig::default(), &varmap, &Device::Cpu).unwrap();
        assert!(builder
            .maybe_delta("key", "layer.0.key", 16, 16)
            .unwrap()
            .is_none());
        // Only the query/value factors were registered.
        assert_eq!(varmap.all_vars().len(), 0);
    }

    #[test]
    fn unknown_target_module_is_a_mismatch() {
        let config = LoraConfig {
            target_modules: vec!["dense".to_string()],
            ..Default::default()
        };
        let varmap = VarMap::new();
        let err = AdapterBuilder::new(config, &varmap, &Device::Cpu).unwrap_err();
        assert!(matches!(err, Error::ArchitectureMismatch(_)));
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = LoraConfig {
            rank: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        config.rank = 8;
        config.dropout = 1.5;
        assert!(config.validate().is_err());
        config.dropout = 0.05;
        config.target_modules = vec!["query".into(), "query".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_and_reload_round_trips_factors() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let builder =
            AdapterBuilder::new(LoraConfig::default(), &varmap, &Device::Cpu).unwrap();
        let _delta = builder
            .maybe_delta("value", "layer.0.value", 8, 8)
            .unwrap()
            .unwrap();
        let metadata = AdapterMetadata::new("test-model", builder.config(), 1);
        save_adapter(dir.path(), &varmap, &metadata).unwrap();

        // Re-attach into a fresh varmap and load the stored factors.
        let mut reloaded = VarMap::new();
        let rebuilder = AdapterBuilder::new(
            load_adapter_metadata(dir.path()).unwrap().lora_config(),
            &reloaded,
            &Device::Cpu,
        )
        .unwrap();
        let _ = rebuilder
            .maybe_delta("value", "layer.0.value", 8, 8)
            .unwrap()
            .unwrap();
        load_adapter_weights(dir.path(), &mut reloaded).unwrap();

        let original = varmap.all_vars();
        let restored = reloaded.all_vars();
        assert_eq!(original.len(), restored.len());
        let sum = |vars: &[candle_core::Var]| -> f32 {
            vars.iter()
                .map(|v| v.as_tensor().abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap())
                .sum()
        };
        approx::assert_abs_diff_eq!(sum(&original), sum(&restored), epsilon = 1e-6);
    }

    #[test]
    fn metadata_mismatch_is_detected() {
        let metadata = AdapterMetadata::new("m", &LoraConfig::default(), 12);
        let config = TextConfig {
            num_hidden_layers: 6,
            ..Default::default()
        };
        assert!(metadata.validate_against(&config).is_err());
    }
}
