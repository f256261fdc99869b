//! Intrinsic image map generation for 3D texture baking
//!
//! Renders intrinsic-image maps (depth, surface normal, albedo, shading)
//! from a photograph of a 3D object using a Stable Diffusion 1.5 backbone
//! specialized by per-task LoRA weights, then drives a host application's
//! projector/bake sequence to transfer those maps into the object's own UV
//! texture space.
//!
//! ## How it works
//!
//! - **Single-file checkpoints**: the original-layout checkpoint is
//!   partitioned and renamed into the UNet/VAE/text-encoder maps the
//!   candle Stable Diffusion modules expect
//! - **Adaptation hot-swap**: each task's LoRA weights are fused into the
//!   base weights on demand; repeats of the active task skip the reload
//! - **Single-step translation**: one denoising pass at the highest
//!   timestep turns the denoiser into a deterministic image-to-image
//!   translator
//! - **Headless orchestration**: the host's render and bake primitives are
//!   trait collaborators, so the whole sequence runs against stubs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::path::Path;
//! use intrinsic_lora::{IntrinsicLoraGenerator, Task};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut generator =
//!         IntrinsicLoraGenerator::new("v1-5-pruned-emaonly.safetensors", None)?;
//!
//!     for task in Task::ALL {
//!         generator.generate_image(
//!             Path::new("renders/intrinsic_render.png"),
//!             Some(Path::new("renders")),
//!             task,
//!         )?;
//!     }
//!
//!     generator.close()
//! }
//! ```

pub mod checkpoint;
pub mod lora;
pub mod models;
pub mod pipeline;
pub mod postprocess;
pub mod tasks;
pub mod texture;

pub use pipeline::IntrinsicLoraGenerator;
pub use tasks::Task;
