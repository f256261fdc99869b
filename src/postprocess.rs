//! Decoded latents to 8-bit intrinsic maps.
//!
//! Each task interprets the raw `[1, 3, H, W]` tensor the autoencoder
//! produced according to its own convention:
//! - depth: min-max normalized by the tensor's own range, channels
//!   averaged, replicated to three equal channels
//! - normal: clamped, scaled, then inverted per channel to match the
//!   target renderer's normal orientation
//! - albedo / shading: clamped and scaled, no inversion

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use image::RgbImage;

use crate::tasks::Task;

/// Convert a raw decoded tensor into the task's 8-bit RGB map.
pub fn postprocess(raw: &Tensor, task: Task) -> Result<RgbImage> {
    let image = raw.squeeze(0)?.to_dtype(DType::F32)?;
    match task {
        Task::Depth => depth_map(&image),
        Task::Normal => {
            let (width, height) = image_dims(&image)?;
            let inverted: Vec<u8> = rgb_bytes(&image)?.iter().map(|v| 255 - v).collect();
            into_image(width, height, inverted)
        }
        Task::Albedo | Task::Shading => {
            let (width, height) = image_dims(&image)?;
            into_image(width, height, rgb_bytes(&image)?)
        }
    }
}

/// Normalize by the tensor's own range, collapse channels by averaging and
/// replicate the result into three equal channels.
fn depth_map(image: &Tensor) -> Result<RgbImage> {
    let (width, height) = image_dims(image)?;
    let flat = image.flatten_all()?;
    let min = flat.min(0)?.to_scalar::<f32>()?;
    let max = flat.max(0)?.to_scalar::<f32>()?;
    let range = (max - min).max(f32::EPSILON);

    let normalized = ((image - min as f64)? / range as f64)?;
    let gray = (normalized.mean(0)? * 255.)?.to_dtype(DType::U8)?;
    let gray = gray.flatten_all()?.to_vec1::<u8>()?;

    let mut rgb = Vec::with_capacity(gray.len() * 3);
    for v in gray {
        rgb.extend_from_slice(&[v, v, v]);
    }
    into_image(width, height, rgb)
}

/// Clamp to `[-1, 1]`, map to `[0, 255]` and flatten to interleaved RGB.
fn rgb_bytes(image: &Tensor) -> Result<Vec<u8>> {
    let scaled = (((image.clamp(-1f32, 1f32)? * 0.5)? + 0.5)? * 255.)?;
    let bytes = scaled
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    Ok(bytes)
}

fn image_dims(image: &Tensor) -> Result<(u32, u32)> {
    let (_channels, height, width) = image.dims3()?;
    Ok((width as u32, height as u32))
}

fn into_image(width: u32, height: u32, data: Vec<u8>) -> Result<RgbImage> {
    RgbImage::from_raw(width, height, data).context("decoded tensor does not fill an RGB raster")
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(values: Vec<f32>, shape: (usize, usize, usize, usize)) -> Tensor {
        Tensor::from_vec(values, shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_depth_spans_full_range_with_equal_channels() {
        // One pixel at the tensor minimum in every channel, one at the
        // maximum: the normalized means must land on 0 and 255.
        let raw = tensor(vec![-1., 1., -1., 1., -1., 1.], (1, 3, 1, 2));
        let image = postprocess(&raw, Task::Depth).unwrap();
        assert_eq!(image.dimensions(), (2, 1));
        assert_eq!(image.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_depth_channels_always_equal() {
        let raw = tensor((0..12).map(|v| v as f32).collect(), (1, 3, 2, 2));
        let image = postprocess(&raw, Task::Depth).unwrap();
        for pixel in image.pixels() {
            assert_eq!(pixel.0[0], pixel.0[1]);
            assert_eq!(pixel.0[1], pixel.0[2]);
        }
    }

    #[test]
    fn test_normal_inverts_mid_gray() {
        let raw = tensor(vec![0.; 12], (1, 3, 2, 2));
        let image = postprocess(&raw, Task::Normal).unwrap();
        // 0 maps to 127 before inversion, 128 after.
        for pixel in image.pixels() {
            assert_eq!(pixel.0, [128, 128, 128]);
        }
    }

    #[test]
    fn test_albedo_applies_no_inversion() {
        let raw = tensor(vec![1., -1., 1., -1., 1., -1.], (1, 3, 1, 2));
        let image = postprocess(&raw, Task::Albedo).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_shading_clamps_out_of_range_values() {
        let raw = tensor(vec![5., -5., 5., -5., 5., -5.], (1, 3, 1, 2));
        let image = postprocess(&raw, Task::Shading).unwrap();
        assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_output_matches_input_resolution() {
        let raw = tensor(vec![0.; 3 * 4 * 6], (1, 3, 4, 6));
        let image = postprocess(&raw, Task::Albedo).unwrap();
        assert_eq!(image.dimensions(), (6, 4));
    }
}
