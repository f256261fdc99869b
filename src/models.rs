//! Sub-model construction for the Stable Diffusion 1.5 pipeline.
//!
//! This module builds every component the generator owns for its lifetime:
//! - CLIP text encoder + tokenizer (prompt conditioning)
//! - UNet denoiser (the model the adaptation weights specialize)
//! - VAE (image <-> latent codec)
//! - DDIM schedule configuration (source of the fixed inference timestep)
//!
//! Components are constructed from pre-partitioned checkpoint tensor maps,
//! so the UNet and text encoder can be rebuilt in place when the active
//! task changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::clip::{self, ClipTextTransformer};
use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::unet_2d::{
    BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig,
};
use candle_transformers::models::stable_diffusion::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Latent scaling factor of the SD 1.5 autoencoder.
pub const LATENT_SCALE: f64 = 0.18215;

/// Hub repository holding the CLIP tokenizer used by SD 1.5.
const TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";

/// Seed for the VAE posterior draw. The posterior is sampled through the
/// device RNG; pinning the seed makes repeated encodings of the same frame
/// bit-identical, which reprojection bakes rely on.
const POSTERIOR_SEED: u64 = 42;

/// Pick the inference device once for the generator's lifetime:
/// CUDA, else Metal, else CPU.
pub fn select_device() -> Result<Device> {
    if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        Ok(Device::Cpu)
    }
}

/// Companion config for offline operation. Supplying one switches the
/// loader to local-files-only mode: the tokenizer must then be readable
/// from the path named here and the hub is never contacted.
#[derive(Debug, Default, Deserialize)]
pub struct ModelConfig {
    /// Path to a CLIP `tokenizer.json`.
    pub tokenizer: Option<PathBuf>,
    /// Override for the training schedule length (defaults to 1000).
    pub train_timesteps: Option<usize>,
}

impl ModelConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read model config {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse model config {}", path.display()))
    }

    pub fn scheduler_config(&self) -> DDIMSchedulerConfig {
        let mut config = DDIMSchedulerConfig::default();
        if let Some(train_timesteps) = self.train_timesteps {
            config.train_timesteps = train_timesteps;
        }
        config
    }
}

/// Load the CLIP tokenizer, from disk in offline mode or from the hub
/// otherwise.
pub fn load_tokenizer(config: Option<&ModelConfig>) -> Result<Tokenizer> {
    let tokenizer_file = match config {
        Some(config) => {
            let path = config.tokenizer.as_ref().context(
                "offline operation requires a tokenizer path in the model config file",
            )?;
            info!(path = %path.display(), "Loading tokenizer (offline)");
            path.clone()
        }
        None => {
            info!(repo = TOKENIZER_REPO, "Fetching tokenizer from the hub");
            let api = hf_hub::api::sync::Api::new().context("failed to create hub API client")?;
            api.model(TOKENIZER_REPO.to_string())
                .get("tokenizer.json")
                .context("failed to fetch CLIP tokenizer")?
        }
    };
    Tokenizer::from_file(&tokenizer_file)
        .map_err(|e| anyhow::anyhow!("failed to load tokenizer {:?}: {e}", tokenizer_file))
}

/// SD 1.5 UNet hyperparameters. The deepest block carries no cross
/// attention.
pub fn unet_config() -> UNet2DConditionModelConfig {
    UNet2DConditionModelConfig {
        blocks: vec![
            BlockConfig {
                out_channels: 320,
                use_cross_attn: Some(1),
                attention_head_dim: 8,
            },
            BlockConfig {
                out_channels: 640,
                use_cross_attn: Some(1),
                attention_head_dim: 8,
            },
            BlockConfig {
                out_channels: 1280,
                use_cross_attn: Some(1),
                attention_head_dim: 8,
            },
            BlockConfig {
                out_channels: 1280,
                use_cross_attn: None,
                attention_head_dim: 8,
            },
        ],
        center_input_sample: false,
        cross_attention_dim: 768,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size: None,
        use_linear_projection: false,
    }
}

/// SD 1.5 autoencoder hyperparameters.
pub fn vae_config() -> AutoEncoderKLConfig {
    AutoEncoderKLConfig {
        block_out_channels: vec![128, 256, 512, 512],
        layers_per_block: 2,
        latent_channels: 4,
        norm_num_groups: 32,
        use_quant_conv: true,
        use_post_quant_conv: true,
    }
}

/// Build the UNet from a diffusers-layout tensor map.
pub fn build_unet(
    tensors: HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<UNet2DConditionModel> {
    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    UNet2DConditionModel::new(vb, 4, 4, false, unet_config()).context("failed to build UNet")
}

/// Build the text encoder from a diffusers-layout tensor map.
pub fn build_text_encoder(
    tensors: HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<ClipTextTransformer> {
    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    ClipTextTransformer::new(vb, &clip::Config::v1_5()).context("failed to build text encoder")
}

/// Build the autoencoder from a diffusers-layout tensor map.
pub fn build_vae(
    tensors: HashMap<String, Tensor>,
    dtype: DType,
    device: &Device,
) -> Result<AutoEncoderKL> {
    let vb = VarBuilder::from_tensors(tensors, dtype, device);
    AutoEncoderKL::new(vb, 3, 3, vae_config()).context("failed to build autoencoder")
}

/// CLIP tokenizer + text encoder pair producing prompt conditioning.
pub struct TextConditioner {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    device: Device,
    max_length: usize,
    pad_id: u32,
}

impl TextConditioner {
    pub fn new(tokenizer: Tokenizer, model: ClipTextTransformer, device: Device) -> Result<Self> {
        let clip_config = clip::Config::v1_5();
        let pad_token = clip_config
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = tokenizer
            .token_to_id(&pad_token)
            .with_context(|| format!("pad token {pad_token:?} missing from tokenizer vocabulary"))?;
        Ok(Self {
            tokenizer,
            model,
            device,
            max_length: clip_config.max_position_embeddings,
            pad_id,
        })
    }

    /// Replace the encoder model, keeping the tokenizer. Used when the
    /// active adaptation changes.
    pub fn swap_model(&mut self, model: ClipTextTransformer) {
        self.model = model;
    }

    /// Encode a prompt to conditioning embeddings of shape
    /// `[1, max_length, 768]`.
    pub fn encode(&self, prompt: &str) -> Result<Tensor> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        let tokens = pad_tokens(encoding.get_ids(), self.max_length, self.pad_id);
        debug!(prompt = prompt, tokens = tokens.len(), "Prompt tokenized");

        let token_ids = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&token_ids)?)
    }
}

/// Image <-> latent codec around the autoencoder.
pub struct LatentCodec {
    model: AutoEncoderKL,
    device: Device,
}

impl LatentCodec {
    pub fn new(model: AutoEncoderKL, device: Device) -> Self {
        Self { model, device }
    }

    /// Encode a `[1, 3, H, W]` image in `[-1, 1]` to scaled latents.
    ///
    /// The posterior draw goes through the device RNG, which is re-seeded
    /// with a fixed value first so the encoding is reproducible.
    pub fn encode(&self, image: &Tensor) -> Result<Tensor> {
        if let Err(e) = self.device.set_seed(POSTERIOR_SEED) {
            debug!(error = %e, "Could not seed device RNG");
        }
        let latent_dist = self.model.encode(image)?;
        Ok((latent_dist.sample()? * LATENT_SCALE)?)
    }

    /// Decode scaled latents back to a `[1, 3, H, W]` image tensor.
    pub fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        Ok(self.model.decode(&(latents / LATENT_SCALE)?)?)
    }
}

/// Truncate or pad token ids to exactly `max_length`.
fn pad_tokens(ids: &[u32], max_length: usize, pad_id: u32) -> Vec<u32> {
    let mut tokens = ids.to_vec();
    tokens.truncate(max_length);
    tokens.resize(max_length, pad_id);
    tokens
}
