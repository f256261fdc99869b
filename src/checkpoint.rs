//! Single-file Stable Diffusion checkpoint ingestion.
//!
//! Original-layout checkpoints (`v1-5-pruned-emaonly.safetensors` and
//! friends) store every sub-model in one file under the latent-diffusion
//! naming scheme. The candle `stable_diffusion` modules expect the
//! diffusers naming scheme instead, so loading is a partition + rename
//! pass: each tensor is routed to the UNet, VAE or text-encoder map under
//! its translated name, and training-only entries (EMA shadows, scheduler
//! buffers, position-id buffers) are dropped.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

const UNET_PREFIX: &str = "model.diffusion_model.";
const VAE_PREFIX: &str = "first_stage_model.";
const TEXT_ENCODER_PREFIX: &str = "cond_stage_model.transformer.";

/// Checkpoint tensors partitioned per sub-model, in diffusers naming.
pub struct CheckpointTensors {
    pub unet: HashMap<String, Tensor>,
    pub vae: HashMap<String, Tensor>,
    pub text_encoder: HashMap<String, Tensor>,
}

impl CheckpointTensors {
    /// Load and translate a single-file checkpoint.
    ///
    /// All tensors are converted to `dtype` on `device`. Fails if the file
    /// is unreadable or does not contain a diffusion UNet.
    pub fn load<P: AsRef<Path>>(path: P, dtype: DType, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading single-file checkpoint");

        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;

        let mut unet = HashMap::new();
        let mut vae = HashMap::new();
        let mut text_encoder = HashMap::new();

        for (name, tensor) in tensors {
            let Some(route) = route_key(&name) else {
                debug!(tensor = %name, "Skipping checkpoint entry");
                continue;
            };
            let mut tensor = tensor
                .to_dtype(dtype)
                .with_context(|| format!("failed to convert {name}"))?;
            if route.squeeze_to_matrix && tensor.dims().len() == 4 {
                // 1x1 convolution weights become plain linear weights in the
                // diffusers VAE attention block.
                tensor = tensor.squeeze(3)?.squeeze(2)?;
            }
            match route.sub_model {
                SubModel::Unet => unet.insert(route.name, tensor),
                SubModel::Vae => vae.insert(route.name, tensor),
                SubModel::TextEncoder => text_encoder.insert(route.name, tensor),
            };
        }

        if unet.is_empty() {
            anyhow::bail!(
                "{} does not look like a single-file Stable Diffusion checkpoint \
                 (no diffusion UNet tensors found)",
                path.display()
            );
        }

        info!(
            unet = unet.len(),
            vae = vae.len(),
            text_encoder = text_encoder.len(),
            "✓ Checkpoint tensors translated"
        );

        Ok(Self {
            unet,
            vae,
            text_encoder,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubModel {
    Unet,
    Vae,
    TextEncoder,
}

#[derive(Debug, PartialEq, Eq)]
struct RoutedKey {
    sub_model: SubModel,
    name: String,
    squeeze_to_matrix: bool,
}

impl RoutedKey {
    fn unet(name: String) -> Self {
        Self {
            sub_model: SubModel::Unet,
            name,
            squeeze_to_matrix: false,
        }
    }

    fn vae(name: String, squeeze_to_matrix: bool) -> Self {
        Self {
            sub_model: SubModel::Vae,
            name,
            squeeze_to_matrix,
        }
    }

    fn text_encoder(name: String) -> Self {
        Self {
            sub_model: SubModel::TextEncoder,
            name,
            squeeze_to_matrix: false,
        }
    }
}

/// Route one checkpoint key to its sub-model under the diffusers name.
/// Returns `None` for entries that have no inference-time counterpart.
fn route_key(name: &str) -> Option<RoutedKey> {
    if let Some(rest) = name.strip_prefix(UNET_PREFIX) {
        return rename_unet_key(rest).map(RoutedKey::unet);
    }
    if let Some(rest) = name.strip_prefix(VAE_PREFIX) {
        return rename_vae_key(rest).map(|(name, squeeze)| RoutedKey::vae(name, squeeze));
    }
    if let Some(rest) = name.strip_prefix(TEXT_ENCODER_PREFIX) {
        // The position-id buffer is an int64 arange the model recomputes.
        if rest.ends_with("position_ids") {
            return None;
        }
        return Some(RoutedKey::text_encoder(rest.to_string()));
    }
    // model_ema.*, betas, alphas_cumprod and other training state.
    None
}

/// Translate a UNet key from the latent-diffusion layout.
///
/// The down path stores `num_res_blocks + 1 = 3` entries per level in a
/// flat `input_blocks` list (two resnet/attention pairs, then the
/// downsampler); the up path mirrors it in `output_blocks` with three
/// resnets per level and the upsampler appended to the last entry.
fn rename_unet_key(rest: &str) -> Option<String> {
    if let Some(tail) = rest.strip_prefix("time_embed.0.") {
        return Some(format!("time_embedding.linear_1.{tail}"));
    }
    if let Some(tail) = rest.strip_prefix("time_embed.2.") {
        return Some(format!("time_embedding.linear_2.{tail}"));
    }
    if let Some(tail) = rest.strip_prefix("input_blocks.0.0.") {
        return Some(format!("conv_in.{tail}"));
    }
    if let Some(tail) = rest.strip_prefix("out.0.") {
        return Some(format!("conv_norm_out.{tail}"));
    }
    if let Some(tail) = rest.strip_prefix("out.2.") {
        return Some(format!("conv_out.{tail}"));
    }
    if let Some(tail) = rest.strip_prefix("middle_block.0.") {
        return Some(format!("mid_block.resnets.0.{}", rename_unet_resnet_key(tail)));
    }
    if let Some(tail) = rest.strip_prefix("middle_block.1.") {
        return Some(format!("mid_block.attentions.0.{tail}"));
    }
    if let Some(tail) = rest.strip_prefix("middle_block.2.") {
        return Some(format!("mid_block.resnets.1.{}", rename_unet_resnet_key(tail)));
    }

    if let Some((index, module, tail)) = split_indexed(rest, "input_blocks.") {
        // input_blocks.0 is conv_in, handled above.
        let block = (index - 1) / 3;
        let layer = (index - 1) % 3;
        if layer == 2 {
            let conv = tail.strip_prefix("op.")?;
            return Some(format!("down_blocks.{block}.downsamplers.0.conv.{conv}"));
        }
        return match module {
            0 => Some(format!(
                "down_blocks.{block}.resnets.{layer}.{}",
                rename_unet_resnet_key(tail)
            )),
            1 => Some(format!("down_blocks.{block}.attentions.{layer}.{tail}")),
            _ => None,
        };
    }

    if let Some((index, module, tail)) = split_indexed(rest, "output_blocks.") {
        let block = index / 3;
        let layer = index % 3;
        if module == 0 {
            return Some(format!(
                "up_blocks.{block}.resnets.{layer}.{}",
                rename_unet_resnet_key(tail)
            ));
        }
        // The upsampler shares the entry with the last resnet/attention
        // pair; it is the only non-resnet sub-module whose keys start with
        // a bare convolution.
        if let Some(conv) = tail.strip_prefix("conv.") {
            return Some(format!("up_blocks.{block}.upsamplers.0.conv.{conv}"));
        }
        if module == 1 {
            return Some(format!("up_blocks.{block}.attentions.{layer}.{tail}"));
        }
        return None;
    }

    debug!(tensor = %rest, "Unmapped UNet tensor name");
    None
}

/// Resnet sub-keys inside the diffusion UNet.
fn rename_unet_resnet_key(tail: &str) -> String {
    for (ldm, diffusers) in [
        ("in_layers.0.", "norm1."),
        ("in_layers.2.", "conv1."),
        ("emb_layers.1.", "time_emb_proj."),
        ("out_layers.0.", "norm2."),
        ("out_layers.3.", "conv2."),
        ("skip_connection.", "conv_shortcut."),
    ] {
        if let Some(rest) = tail.strip_prefix(ldm) {
            return format!("{diffusers}{rest}");
        }
    }
    tail.to_string()
}

/// Translate a VAE key. The second tuple element marks attention
/// projections whose 1x1-conv weights must be squeezed to matrices.
fn rename_vae_key(rest: &str) -> Option<(String, bool)> {
    for side in ["encoder", "decoder"] {
        let Some(tail) = rest.strip_prefix(side).and_then(|r| r.strip_prefix('.')) else {
            continue;
        };
        if let Some(conv) = tail.strip_prefix("conv_in.") {
            return Some((format!("{side}.conv_in.{conv}"), false));
        }
        if let Some(conv) = tail.strip_prefix("conv_out.") {
            return Some((format!("{side}.conv_out.{conv}"), false));
        }
        if let Some(norm) = tail.strip_prefix("norm_out.") {
            return Some((format!("{side}.conv_norm_out.{norm}"), false));
        }
        if let Some(mid) = tail.strip_prefix("mid.") {
            if let Some(resnet) = mid.strip_prefix("block_1.") {
                return Some((
                    format!("{side}.mid_block.resnets.0.{}", rename_vae_resnet_key(resnet)),
                    false,
                ));
            }
            if let Some(resnet) = mid.strip_prefix("block_2.") {
                return Some((
                    format!("{side}.mid_block.resnets.1.{}", rename_vae_resnet_key(resnet)),
                    false,
                ));
            }
            if let Some(attn) = mid.strip_prefix("attn_1.") {
                let (renamed, squeeze) = rename_vae_attention_key(attn)?;
                return Some((format!("{side}.mid_block.attentions.0.{renamed}"), squeeze));
            }
            return None;
        }
        if side == "encoder" {
            if let Some((level, sub)) = split_level(tail, "down.") {
                if let Some(resnet) = sub.strip_prefix("block.") {
                    let (idx, resnet_tail) = split_leading_index(resnet)?;
                    return Some((
                        format!(
                            "encoder.down_blocks.{level}.resnets.{idx}.{}",
                            rename_vae_resnet_key(resnet_tail)
                        ),
                        false,
                    ));
                }
                if let Some(conv) = sub.strip_prefix("downsample.conv.") {
                    return Some((
                        format!("encoder.down_blocks.{level}.downsamplers.0.conv.{conv}"),
                        false,
                    ));
                }
            }
        } else if let Some((level, sub)) = split_level(tail, "up.") {
            // The decoder enumerates levels deepest-last; diffusers
            // enumerates them deepest-first.
            let block = 3 - level;
            if let Some(resnet) = sub.strip_prefix("block.") {
                let (idx, resnet_tail) = split_leading_index(resnet)?;
                return Some((
                    format!(
                        "decoder.up_blocks.{block}.resnets.{idx}.{}",
                        rename_vae_resnet_key(resnet_tail)
                    ),
                    false,
                ));
            }
            if let Some(conv) = sub.strip_prefix("upsample.conv.") {
                return Some((
                    format!("decoder.up_blocks.{block}.upsamplers.0.conv.{conv}"),
                    false,
                ));
            }
        }
        return None;
    }

    if rest.starts_with("quant_conv.") || rest.starts_with("post_quant_conv.") {
        return Some((rest.to_string(), false));
    }

    debug!(tensor = %rest, "Unmapped VAE tensor name");
    None
}

fn rename_vae_resnet_key(tail: &str) -> String {
    match tail.strip_prefix("nin_shortcut.") {
        Some(rest) => format!("conv_shortcut.{rest}"),
        None => tail.to_string(),
    }
}

fn rename_vae_attention_key(tail: &str) -> Option<(String, bool)> {
    for (ldm, diffusers, squeeze) in [
        ("norm.", "group_norm.", false),
        ("q.", "query.", true),
        ("k.", "key.", true),
        ("v.", "value.", true),
        ("proj_out.", "proj_attn.", true),
    ] {
        if let Some(rest) = tail.strip_prefix(ldm) {
            // Biases are already one-dimensional; only weights carry the
            // spurious convolution dims.
            return Some((format!("{diffusers}{rest}"), squeeze && rest == "weight"));
        }
    }
    None
}

/// Split `"{prefix}{index}.{module}.{tail}"` into its parts.
fn split_indexed<'a>(rest: &'a str, prefix: &str) -> Option<(usize, usize, &'a str)> {
    let rest = rest.strip_prefix(prefix)?;
    let mut parts = rest.splitn(3, '.');
    let index = parts.next()?.parse().ok()?;
    let module = parts.next()?.parse().ok()?;
    let tail = parts.next()?;
    Some((index, module, tail))
}

/// Split `"{prefix}{level}.{sub}"` into its parts.
fn split_level<'a>(rest: &'a str, prefix: &str) -> Option<(usize, &'a str)> {
    let rest = rest.strip_prefix(prefix)?;
    split_leading_index(rest)
}

/// Split `"{index}.{tail}"` into its parts.
fn split_leading_index(rest: &str) -> Option<(usize, &str)> {
    let (index, tail) = rest.split_once('.')?;
    Some((index.parse().ok()?, tail))
}
