//! The intrinsic-image generator facade.
//!
//! One `IntrinsicLoraGenerator` owns a loaded checkpoint's sub-models for
//! its whole lifetime and generates one map per call:
//! 1. Ensure the task's adaptation weights are the active ones
//! 2. Preprocess the input photograph to the backbone resolution
//! 3. Encode to latents, run one denoising step at the highest timestep,
//!    decode back to pixels
//! 4. Post-process per task semantics and persist when asked to
//!
//! Calls are synchronous and must not be interleaved: the swap-skip
//! optimization in [`IntrinsicLoraGenerator::ensure_task_weights`] assumes
//! strictly sequential use of one instance.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::ddim::DDIMSchedulerConfig;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use tracing::{debug, info};

use crate::checkpoint::CheckpointTensors;
use crate::lora::LoraAdapter;
use crate::models::{self, LatentCodec, ModelConfig, TextConditioner};
use crate::postprocess::postprocess;
use crate::tasks::Task;

/// Native inference resolution of the SD 1.5 backbone.
pub const RESOLUTION: u32 = 512;

/// Default location of the per-task adaptation weight files.
pub const DEFAULT_WEIGHTS_DIR: &str = "pretrained_weights";

/// Whether a requested task can reuse the active adaptation weights.
///
/// Swapping re-reads the full checkpoint state dict, so repeats of the
/// active task must not trigger a reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPlan {
    Keep,
    Swap,
}

impl SwapPlan {
    pub fn for_transition(active: Option<Task>, requested: Task) -> Self {
        if active == Some(requested) {
            SwapPlan::Keep
        } else {
            SwapPlan::Swap
        }
    }
}

/// Generator over one loaded checkpoint. Created per render invocation and
/// torn down with [`IntrinsicLoraGenerator::close`] once every requested
/// map has been produced.
pub struct IntrinsicLoraGenerator {
    device: Device,
    dtype: DType,
    checkpoint_path: PathBuf,
    weights_dir: PathBuf,
    scheduler: DDIMSchedulerConfig,
    conditioner: TextConditioner,
    unet: UNet2DConditionModel,
    codec: LatentCodec,
    active_task: Option<Task>,
}

impl IntrinsicLoraGenerator {
    /// Load a single-file checkpoint and build every sub-model on the best
    /// available device. Passing a config file selects offline operation.
    ///
    /// Any load failure aborts construction; no partially usable instance
    /// is produced.
    pub fn new<P: AsRef<Path>>(checkpoint: P, config: Option<&Path>) -> Result<Self> {
        let checkpoint_path = checkpoint.as_ref().to_path_buf();
        let config = config.map(ModelConfig::from_file).transpose()?;
        let device = models::select_device()?;
        let dtype = DType::F32;
        info!(device = ?device, "Initializing intrinsic map generator");

        let tensors = CheckpointTensors::load(&checkpoint_path, dtype, &device)?;
        let tokenizer = models::load_tokenizer(config.as_ref())?;
        let text_encoder = models::build_text_encoder(tensors.text_encoder, dtype, &device)?;
        let conditioner = TextConditioner::new(tokenizer, text_encoder, device.clone())?;
        let unet = models::build_unet(tensors.unet, dtype, &device)?;
        let vae = models::build_vae(tensors.vae, dtype, &device)?;
        let scheduler = config.unwrap_or_default().scheduler_config();

        info!("✓ Generator ready");
        Ok(Self {
            codec: LatentCodec::new(vae, device.clone()),
            device,
            dtype,
            checkpoint_path,
            weights_dir: PathBuf::from(DEFAULT_WEIGHTS_DIR),
            scheduler,
            conditioner,
            unet,
            active_task: None,
        })
    }

    /// Use a non-default directory for the adaptation weight files.
    pub fn with_weights_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.weights_dir = dir.into();
        self
    }

    /// Generate one intrinsic map from the photograph at
    /// `input_image_path`. When `output_dir` is given the map is also
    /// persisted as `<stem>_<task>.png`; the in-memory image is returned
    /// either way.
    pub fn generate_image(
        &mut self,
        input_image_path: &Path,
        output_dir: Option<&Path>,
        task: Task,
    ) -> Result<RgbImage> {
        self.ensure_task_weights(task)?;

        let raw = self.infer(input_image_path, task)?;
        let image = postprocess(&raw, task)?;

        if let Some(dir) = output_dir {
            let path = output_path(dir, input_image_path, task);
            image
                .save(&path)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Saved intrinsic map");
        }
        Ok(image)
    }

    /// Make `task`'s adaptation weights the active ones. A repeat of the
    /// active task is a no-op; anything else unloads the previous
    /// adaptation before the new one is fused in.
    pub fn ensure_task_weights(&mut self, task: Task) -> Result<()> {
        match SwapPlan::for_transition(self.active_task, task) {
            SwapPlan::Keep => {
                debug!(task = %task, "Adaptation already active, skipping reload");
                return Ok(());
            }
            SwapPlan::Swap => {}
        }
        info!(task = %task, "Swapping adaptation weights");

        // Unload first: two adaptations must never be active at once. If
        // anything past this point fails, the instance holds base weights
        // with no task recorded and the next call retries from that state.
        self.active_task = None;
        let tensors = CheckpointTensors::load(&self.checkpoint_path, self.dtype, &self.device)?;
        let mut unet_tensors = tensors.unet;
        let mut text_encoder_tensors = tensors.text_encoder;
        self.unet = models::build_unet(unet_tensors.clone(), self.dtype, &self.device)?;
        self.conditioner.swap_model(models::build_text_encoder(
            text_encoder_tensors.clone(),
            self.dtype,
            &self.device,
        )?);

        let weight_path = task.weight_path(&self.weights_dir);
        let adapter = LoraAdapter::load(&weight_path, task.to_string(), &self.device, self.dtype)?;
        let fused = adapter.fuse(&mut unet_tensors, &mut text_encoder_tensors)?;
        self.unet = models::build_unet(unet_tensors, self.dtype, &self.device)?;
        self.conditioner.swap_model(models::build_text_encoder(
            text_encoder_tensors,
            self.dtype,
            &self.device,
        )?);

        info!(task = %task, fused, "✓ Adaptation weights active");
        self.active_task = Some(task);
        Ok(())
    }

    /// One denoising pass at maximum noise level: the prediction of a
    /// single forward step is taken as the translated image rather than as
    /// one step of an iterative sampler.
    fn infer(&self, image_path: &Path, task: Task) -> Result<Tensor> {
        let image = load_input_image(image_path)?;
        let image = image_to_tensor(&image, &self.device)?.to_dtype(self.dtype)?;

        let timestep = fixed_timestep(&self.scheduler);
        debug!(timestep, task = %task, "Running single-step inference");

        let latents = self.codec.encode(&image)?;
        let conditioning = self.conditioner.encode(task.prompt())?;
        let prediction = self
            .unet
            .forward(&latents, timestep as f64, &conditioning)?;
        self.codec.decode(&prediction)
    }

    /// Tear the instance down, releasing adaptation state, the sub-models
    /// and, on an accelerator, cached device memory. Consuming `self`
    /// makes a second `close` (or a generation after close) a compile
    /// error rather than a runtime question.
    pub fn close(self) -> Result<()> {
        info!("Closing generator");
        let device = self.device.clone();
        drop(self);
        if !matches!(device, Device::Cpu) {
            device.synchronize()?;
        }
        Ok(())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn active_task(&self) -> Option<Task> {
        self.active_task
    }
}

/// The single highest-index timestep of the training schedule.
fn fixed_timestep(scheduler: &DDIMSchedulerConfig) -> usize {
    scheduler.train_timesteps - 1
}

/// `<output_dir>/<input stem>_<task>.png`
fn output_path(dir: &Path, input: &Path, task: Task) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("render");
    dir.join(format!("{stem}_{task}.png"))
}

/// Load the input photograph, force RGB, resize the shorter side to the
/// backbone resolution (bilinear) and center-crop square.
fn load_input_image(path: &Path) -> Result<RgbImage> {
    let image =
        image::open(path).with_context(|| format!("failed to read input image {}", path.display()))?;
    Ok(prepare_input(&image))
}

fn prepare_input(image: &DynamicImage) -> RgbImage {
    let (nw, nh) = resize_dims(image.width(), image.height(), RESOLUTION);
    let resized = image.resize_exact(nw, nh, FilterType::Triangle);
    let x = (nw - RESOLUTION) / 2;
    let y = (nh - RESOLUTION) / 2;
    resized.crop_imm(x, y, RESOLUTION, RESOLUTION).to_rgb8()
}

/// Scale so the shorter side lands exactly on `target`.
fn resize_dims(width: u32, height: u32, target: u32) -> (u32, u32) {
    if width <= height {
        let scaled = (height as f64 * target as f64 / width as f64).round() as u32;
        (target, scaled.max(target))
    } else {
        let scaled = (width as f64 * target as f64 / height as f64).round() as u32;
        (scaled.max(target), target)
    }
}

/// Interleaved 8-bit RGB to a `[1, 3, H, W]` tensor in `[-1, 1]`.
fn image_to_tensor(image: &RgbImage, device: &Device) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let tensor = Tensor::from_vec(
        image.as_raw().clone(),
        (height as usize, width as usize, 3),
        device,
    )?
    .permute((2, 0, 1))?
    .to_dtype(DType::F32)?;
    Ok(((tensor / 127.5)? - 1.0)?.unsqueeze(0)?)
}
