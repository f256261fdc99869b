//! LoRA (low-rank adaptation) weight loading and fusion.
//!
//! Each task ships one safetensors file whose entries specialize the UNet
//! and the text encoder: W' = W + (alpha/rank) * (B @ A). This module
//! parses such a file, resolves every weight pair to the base-model tensor
//! it patches, and fuses the deltas into checkpoint tensor maps before the
//! sub-models are rebuilt.
//!
//! Two on-disk naming conventions are understood: the diffusers attention-
//! processor layout (`unet.*.processor.to_q_lora.down.weight`,
//! `text_encoder.*.lora_linear_layer.up.weight`) and the underscore layout
//! (`lora_unet_*`/`lora_te_*` with `lora_down`/`lora_up`/`lora_A`/`lora_B`
//! suffixes and `.alpha` entries).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use tracing::{debug, info, warn};

/// Which sub-model a weight pair patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoraTarget {
    Unet,
    TextEncoder,
}

/// One low-rank weight pair, resolved to the base tensor it patches.
#[derive(Debug)]
pub struct LoraWeight {
    /// Base-model tensor name, e.g.
    /// `down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight`.
    pub target_key: String,
    /// Down projection (A), `[rank, in_features]`.
    pub down: Tensor,
    /// Up projection (B), `[out_features, rank]`.
    pub up: Tensor,
    /// Scaling numerator; defaults to the rank when the file carries no
    /// alpha entry, making the fused scale 1.
    pub alpha: f32,
    pub rank: usize,
}

impl LoraWeight {
    /// Dense delta this pair adds to its base tensor.
    fn delta(&self) -> Result<Tensor> {
        let scale = self.alpha / self.rank as f32;
        Ok((self.up.matmul(&self.down)? * scale as f64)?)
    }
}

/// A parsed adaptation file, partitioned per sub-model.
pub struct LoraAdapter {
    pub name: String,
    pub unet: HashMap<String, LoraWeight>,
    pub text_encoder: HashMap<String, LoraWeight>,
}

impl LoraAdapter {
    /// Load an adaptation file from disk.
    ///
    /// Fails when the file is unreadable, contains no usable weight pairs,
    /// or cannot be deserialized.
    pub fn load<P: AsRef<Path>>(
        path: P,
        name: String,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading adaptation weights");

        let file_data = std::fs::read(path)
            .with_context(|| format!("failed to read adaptation file {}", path.display()))?;
        let tensors = SafeTensors::deserialize(&file_data)
            .with_context(|| format!("failed to parse safetensors {}", path.display()))?;

        let mut downs: HashMap<(LoraTarget, String), Tensor> = HashMap::new();
        let mut ups: HashMap<(LoraTarget, String), Tensor> = HashMap::new();
        let mut alphas: HashMap<(LoraTarget, String), f32> = HashMap::new();

        // First pass: classify every entry by suffix and resolve the base
        // tensor it belongs to.
        for (key, _) in tensors.tensors() {
            let Some((kind, base)) = classify_entry(&key) else {
                debug!(key = %key, "Skipping unrecognized adaptation entry");
                continue;
            };
            let Some(resolved) = resolve_target(&base) else {
                warn!(key = %key, "Adaptation entry targets no known sub-model");
                continue;
            };
            match kind {
                EntryKind::Down => {
                    let tensor = load_tensor(&tensors, &key, device, dtype)?;
                    downs.insert(resolved, tensor);
                }
                EntryKind::Up => {
                    let tensor = load_tensor(&tensors, &key, device, dtype)?;
                    ups.insert(resolved, tensor);
                }
                EntryKind::Alpha => {
                    let alpha = load_tensor(&tensors, &key, device, DType::F32)?
                        .to_device(&Device::Cpu)?
                        .to_scalar::<f32>()?;
                    alphas.insert(resolved, alpha);
                }
            }
        }

        // Second pass: pair the projections.
        let mut unet = HashMap::new();
        let mut text_encoder = HashMap::new();
        for ((target, target_key), down) in downs {
            let Some(up) = ups.remove(&(target, target_key.clone())) else {
                warn!(layer = %target_key, "Down projection without matching up projection");
                continue;
            };
            let rank = down.dims()[0];
            let alpha = alphas
                .get(&(target, target_key.clone()))
                .copied()
                .unwrap_or(rank as f32);
            debug!(layer = %target_key, rank, alpha, "Paired adaptation weights");
            let weight = LoraWeight {
                target_key: target_key.clone(),
                down,
                up,
                alpha,
                rank,
            };
            match target {
                LoraTarget::Unet => unet.insert(target_key, weight),
                LoraTarget::TextEncoder => text_encoder.insert(target_key, weight),
            };
        }
        for (_, target_key) in ups.keys() {
            warn!(layer = %target_key, "Up projection without matching down projection");
        }

        if unet.is_empty() && text_encoder.is_empty() {
            anyhow::bail!(
                "{} contains no usable adaptation weight pairs",
                path.display()
            );
        }

        info!(
            name = %name,
            unet_pairs = unet.len(),
            text_encoder_pairs = text_encoder.len(),
            "✓ Adaptation weights loaded"
        );

        Ok(Self {
            name,
            unet,
            text_encoder,
        })
    }

    /// Fuse all deltas into the given base tensor maps. Returns the number
    /// of patched tensors; a pair whose base tensor is missing or shaped
    /// differently is a structural incompatibility and fails the call.
    pub fn fuse(
        &self,
        unet: &mut HashMap<String, Tensor>,
        text_encoder: &mut HashMap<String, Tensor>,
    ) -> Result<usize> {
        let mut fused = 0;
        for (map, weights) in [(unet, &self.unet), (text_encoder, &self.text_encoder)] {
            for weight in weights.values() {
                let base = map.get(&weight.target_key).with_context(|| {
                    format!(
                        "adaptation {} targets {} which the checkpoint does not contain",
                        self.name, weight.target_key
                    )
                })?;
                let delta = weight.delta()?.to_dtype(base.dtype())?;
                if base.dims() != delta.dims() {
                    anyhow::bail!(
                        "adaptation {} is incompatible with the checkpoint: {} is {:?}, delta is {:?}",
                        self.name,
                        weight.target_key,
                        base.dims(),
                        delta.dims()
                    );
                }
                let patched = (base + delta)?;
                map.insert(weight.target_key.clone(), patched);
                fused += 1;
            }
        }
        Ok(fused)
    }

    pub fn weight_count(&self) -> usize {
        self.unet.len() + self.text_encoder.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Down,
    Up,
    Alpha,
}

/// Classify one safetensors entry and strip its role suffix, leaving the
/// module path.
fn classify_entry(key: &str) -> Option<(EntryKind, String)> {
    for suffix in [".lora_down.weight", ".lora_A.weight", ".down.weight"] {
        if let Some(base) = key.strip_suffix(suffix) {
            return Some((EntryKind::Down, base.to_string()));
        }
    }
    for suffix in [".lora_up.weight", ".lora_B.weight", ".up.weight"] {
        if let Some(base) = key.strip_suffix(suffix) {
            return Some((EntryKind::Up, base.to_string()));
        }
    }
    key.strip_suffix(".alpha")
        .map(|base| (EntryKind::Alpha, base.to_string()))
}

/// Resolve a module path to the sub-model and the base tensor it patches.
fn resolve_target(base: &str) -> Option<(LoraTarget, String)> {
    if let Some(rest) = base.strip_prefix("unet.") {
        return Some((LoraTarget::Unet, unet_target_key(rest)));
    }
    if let Some(rest) = base.strip_prefix("text_encoder.") {
        return Some((LoraTarget::TextEncoder, text_encoder_target_key(rest)));
    }
    if let Some(rest) = base.strip_prefix("lora_unet_") {
        return Some((LoraTarget::Unet, unet_target_key(&join_underscore_key(rest))));
    }
    for prefix in ["lora_te1_", "lora_te_"] {
        if let Some(rest) = base.strip_prefix(prefix) {
            return Some((
                LoraTarget::TextEncoder,
                text_encoder_target_key(&join_underscore_key(rest)),
            ));
        }
    }
    None
}

/// Map a UNet module path to the tensor it patches. The attention-processor
/// convention wraps the projection names; `to_out` feeds a sequential whose
/// linear sits at index 0.
fn unet_target_key(module: &str) -> String {
    let mut name = module.replace(".processor", "");
    for (wrapped, plain) in [
        ("to_q_lora", "to_q"),
        ("to_k_lora", "to_k"),
        ("to_v_lora", "to_v"),
        ("to_out_lora", "to_out.0"),
    ] {
        if let Some(stem) = name.strip_suffix(wrapped) {
            name = format!("{stem}{plain}");
            break;
        }
    }
    if name.ends_with(".to_out") {
        name.push_str(".0");
    }
    format!("{name}.weight")
}

/// Map a text-encoder module path to the tensor it patches.
fn text_encoder_target_key(module: &str) -> String {
    let name = module.strip_suffix(".lora_linear_layer").unwrap_or(module);
    format!("{name}.weight")
}

/// Compound module names that must survive underscore-to-dot conversion.
const COMPOUND_ATOMS: [&str; 16] = [
    "down_blocks",
    "up_blocks",
    "mid_block",
    "transformer_blocks",
    "to_q",
    "to_k",
    "to_v",
    "to_out",
    "proj_in",
    "proj_out",
    "text_model",
    "self_attn",
    "q_proj",
    "k_proj",
    "v_proj",
    "out_proj",
];

/// Convert an underscore-layout module path to dotted form, keeping known
/// compound names intact: `down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_q`
/// becomes `down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q`.
fn join_underscore_key(key: &str) -> String {
    let parts: Vec<&str> = key.split('_').collect();
    let mut segments: Vec<String> = Vec::new();
    let mut i = 0;
    while i < parts.len() {
        if i + 1 < parts.len() {
            let pair = format!("{}_{}", parts[i], parts[i + 1]);
            if COMPOUND_ATOMS.contains(&pair.as_str()) {
                segments.push(pair);
                i += 2;
                continue;
            }
        }
        segments.push(parts[i].to_string());
        i += 1;
    }
    segments.join(".")
}

/// Read one tensor from a safetensors view and convert it to the requested
/// dtype on the requested device.
fn load_tensor(
    tensors: &SafeTensors,
    key: &str,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let view = tensors
        .tensor(key)
        .with_context(|| format!("tensor not found: {key}"))?;
    let shape: Vec<usize> = view.shape().to_vec();
    let data = view.data();

    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let floats: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(floats, shape.as_slice(), device)?
        }
        safetensors::Dtype::F16 => {
            let halfs: Vec<half::f16> = data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(halfs, shape.as_slice(), device)?
        }
        safetensors::Dtype::BF16 => {
            let bhalfs: Vec<half::bf16> = data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(bhalfs, shape.as_slice(), device)?
        }
        other => anyhow::bail!("unsupported adaptation tensor dtype: {other:?}"),
    };

    if tensor.dtype() != dtype {
        Ok(tensor.to_dtype(dtype)?)
    } else {
        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_entry() {
        assert_eq!(
            classify_entry("unet.a.processor.to_q_lora.down.weight"),
            Some((EntryKind::Down, "unet.a.processor.to_q_lora".to_string()))
        );
        assert_eq!(
            classify_entry("lora_unet_x.lora_up.weight"),
            Some((EntryKind::Up, "lora_unet_x".to_string()))
        );
        assert_eq!(
            classify_entry("layer.lora_A.weight"),
            Some((EntryKind::Down, "layer".to_string()))
        );
        assert_eq!(
            classify_entry("lora_unet_x.alpha"),
            Some((EntryKind::Alpha, "lora_unet_x".to_string()))
        );
        assert_eq!(classify_entry("unet.a.bias"), None);
    }

    #[test]
    fn test_resolve_processor_convention() {
        let (target, key) = resolve_target(
            "unet.down_blocks.0.attentions.0.transformer_blocks.0.attn1.processor.to_q_lora",
        )
        .unwrap();
        assert_eq!(target, LoraTarget::Unet);
        assert_eq!(
            key,
            "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight"
        );

        let (_, key) = resolve_target(
            "unet.mid_block.attentions.0.transformer_blocks.0.attn2.processor.to_out_lora",
        )
        .unwrap();
        assert_eq!(
            key,
            "mid_block.attentions.0.transformer_blocks.0.attn2.to_out.0.weight"
        );
    }

    #[test]
    fn test_resolve_text_encoder_convention() {
        let (target, key) = resolve_target(
            "text_encoder.text_model.encoder.layers.0.self_attn.q_proj.lora_linear_layer",
        )
        .unwrap();
        assert_eq!(target, LoraTarget::TextEncoder);
        assert_eq!(
            key,
            "text_model.encoder.layers.0.self_attn.q_proj.weight"
        );
    }

    #[test]
    fn test_resolve_underscore_convention() {
        let (target, key) = resolve_target(
            "lora_unet_down_blocks_0_attentions_0_transformer_blocks_0_attn1_to_q",
        )
        .unwrap();
        assert_eq!(target, LoraTarget::Unet);
        assert_eq!(
            key,
            "down_blocks.0.attentions.0.transformer_blocks.0.attn1.to_q.weight"
        );

        let (target, key) =
            resolve_target("lora_te_text_model_encoder_layers_3_self_attn_v_proj").unwrap();
        assert_eq!(target, LoraTarget::TextEncoder);
        assert_eq!(key, "text_model.encoder.layers.3.self_attn.v_proj.weight");
    }

    #[test]
    fn test_resolve_rejects_unknown_prefix() {
        assert!(resolve_target("vae.decoder.conv_in").is_none());
    }

    fn adapter_with_single_pair(target_key: &str, alpha: f32) -> LoraAdapter {
        let device = Device::Cpu;
        let down = Tensor::ones((1, 3), DType::F32, &device).unwrap();
        let up = Tensor::ones((2, 1), DType::F32, &device).unwrap();
        let mut unet = HashMap::new();
        unet.insert(
            target_key.to_string(),
            LoraWeight {
                target_key: target_key.to_string(),
                down,
                up,
                alpha,
                rank: 1,
            },
        );
        LoraAdapter {
            name: "test".to_string(),
            unet,
            text_encoder: HashMap::new(),
        }
    }

    #[test]
    fn test_fuse_adds_scaled_delta() {
        let device = Device::Cpu;
        let adapter = adapter_with_single_pair("layer.weight", 2.0);
        let mut unet = HashMap::new();
        unet.insert(
            "layer.weight".to_string(),
            Tensor::ones((2, 3), DType::F32, &device).unwrap(),
        );
        let mut te = HashMap::new();

        let fused = adapter.fuse(&mut unet, &mut te).unwrap();
        assert_eq!(fused, 1);
        // ones + (alpha/rank = 2) * ones = 3 everywhere.
        let patched = unet["layer.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(patched, vec![vec![3.0, 3.0, 3.0], vec![3.0, 3.0, 3.0]]);
    }

    #[test]
    fn test_fuse_rejects_missing_base() {
        let adapter = adapter_with_single_pair("absent.weight", 1.0);
        let mut unet = HashMap::new();
        let mut te = HashMap::new();
        assert!(adapter.fuse(&mut unet, &mut te).is_err());
    }

    #[test]
    fn test_fuse_rejects_shape_mismatch() {
        let device = Device::Cpu;
        let adapter = adapter_with_single_pair("layer.weight", 1.0);
        let mut unet = HashMap::new();
        unet.insert(
            "layer.weight".to_string(),
            Tensor::ones((4, 4), DType::F32, &device).unwrap(),
        );
        let mut te = HashMap::new();
        assert!(adapter.fuse(&mut unet, &mut te).is_err());
    }
}
