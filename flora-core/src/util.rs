use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use tracing::{debug, warn};

use crate::DeviceMap;

/// Cargo feature that enables the GPU backend on this platform.
fn gpu_feature() -> &'static str {
    if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
        "metal"
    } else {
        "cuda"
    }
}

/// Resolves a [`DeviceMap`] to a candle device. Asking for a GPU in a build
/// without a GPU backend falls back to the CPU with a warning.
pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    let ordinal = match device_map {
        DeviceMap::ForceCpu => return Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) => ordinal,
    };
    let device = if cuda_is_available() {
        Device::new_cuda(ordinal).with_context(|| format!("failed to open CUDA device {ordinal}"))?
    } else if metal_is_available() {
        Device::new_metal(ordinal)
            .with_context(|| format!("failed to open Metal device {ordinal}"))?
    } else {
        warn!(
            feature = gpu_feature(),
            "No GPU backend compiled in, running on CPU"
        );
        Device::Cpu
    };
    debug!(?device, "Selected device");
    Ok(device)
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_cpu() {
        let device = select_best_device(DeviceMap::ForceCpu).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_gpu_feature() {
        let expected = if cfg!(target_os = "macos") && cfg!(target_arch = "aarch64") {
            "metal"
        } else {
            "cuda"
        };
        assert_eq!(gpu_feature(), expected);
    }

    #[test]
    fn test_tensor_to_image() {
        // Two pixels wide, one high: red then blue.
        let data: Vec<u8> = vec![255, 0, 0, 0, 0, 255];
        let tensor = Tensor::from_vec(data, (3, 1, 2), &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap().to_rgb8();
        assert_eq!((image.width(), image.height()), (2, 1));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 0, 255]);
    }

    #[test]
    fn test_tensor_to_image_rejects_grayscale() {
        let tensor = Tensor::zeros((1, 2, 2), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }
}
