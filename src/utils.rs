use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Per-channel BGR means removed before the encoder.
pub const PIXEL_MEANS: [f32; 3] = [102.9801, 115.9465, 122.7717];

/// Subtract [`PIXEL_MEANS`] from a BCHW BGR batch in `[0, 255]`.
pub fn subtract_mean<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let means = Tensor::<B, 1>::from_data(TensorData::new(PIXEL_MEANS.to_vec(), [3]), &device)
        .reshape([1, 3, 1, 1]);
    images.sub(means)
}

/// Map `[0, 255]` pixels to `[-1, 1]`.
pub fn prep<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    images.div_scalar(255.0).mul_scalar(2.0).sub_scalar(1.0)
}

/// Map `[-1, 1]` back to `[0, 255]`. Stays differentiable; quantization happens
/// only when images are written out.
pub fn invprep<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    images.add_scalar(1.0).div_scalar(2.0).mul_scalar(255.0)
}

/// Map a `[-1, 1]` value to a `u8` pixel.
pub fn scale_back(value: f32) -> u8 {
    ((value + 1.0) * 0.5 * 255.0).clamp(0.0, 255.0) as u8
}

/// Convert a BCHW BGR tensor in `[-1, 1]` to RGB images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let data = tensor.to_data().convert::<f32>();
    let shape = data.shape.clone();
    if shape.len() != 4 {
        return Err(anyhow::anyhow!(
            "expected rank-4 tensor for images, got shape {shape:?}"
        ));
    }

    let batch = shape[0];
    let channels = shape[1];
    let height = shape[2];
    let width = shape[3];

    if channels != 3 {
        return Err(anyhow::anyhow!(
            "expected 3 channels for images, got {channels}"
        ));
    }

    let values = data
        .to_vec::<f32>()
        .context("failed to read tensor data as f32")?;
    let hw = height * width;
    let mut images = Vec::with_capacity(batch);

    for b in 0..batch {
        let base = b * channels * hw;
        let mut img = RgbImage::new(width as u32, height as u32);
        for y in 0..height {
            for x in 0..width {
                let idx = y * width + x;
                // Planes are stored B, G, R.
                let blue = scale_back(values[base + idx]);
                let green = scale_back(values[base + hw + idx]);
                let red = scale_back(values[base + 2 * hw + idx]);
                img.put_pixel(x as u32, y as u32, Rgb([red, green, blue]));
            }
        }
        images.push(img);
    }

    Ok(images)
}

/// Merge images into a fixed grid (rows x cols).
pub fn merge_images(images: &[RgbImage], rows: usize, cols: usize) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(anyhow::anyhow!("no images to merge"));
    }
    let width = images[0].width();
    let height = images[0].height();
    let mut out = RgbImage::new(width * cols as u32, height * rows as u32);

    for (idx, img) in images.iter().enumerate() {
        let row = idx / cols;
        let col = idx % cols;
        if row >= rows {
            break;
        }
        out.copy_from(img, (col as u32) * width, (row as u32) * height)
            .context("failed to copy image into grid")?;
    }

    Ok(out)
}

/// Lay a batch out as a single row and save it as PNG.
pub fn save_image_row(images: &[RgbImage], path: &Path) -> Result<()> {
    let row = merge_images(images, 1, images.len())?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    row.save(path)
        .with_context(|| format!("failed to save {}", path.display()))?;
    Ok(())
}
