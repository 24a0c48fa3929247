//! Face crop preprocessing for the emotion model
//!
//! Deterministic: channel normalization, bilinear resize to a square, scaling
//! to [0, 1], CHW layout with a leading batch axis.

use candle_core::{Device, Tensor};
use image::{imageops, DynamicImage, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;
use anyhow::Result;

use super::detector::BoundingBox;

/// Default side length of the emotion model input
pub const EMOTION_INPUT_SIZE: u32 = 256;

/// Resampling used for every resize in this module
pub const RESAMPLING: imageops::FilterType = imageops::FilterType::Triangle;

/// Bring any crop to three channels: grayscale is replicated, alpha dropped
pub fn to_three_channels(image: &DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb.clone(),
        DynamicImage::ImageLuma8(gray) => ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
            let v = gray.get_pixel(x, y).0[0];
            Rgb([v, v, v])
        }),
        DynamicImage::ImageRgba8(rgba) => ImageBuffer::from_fn(rgba.width(), rgba.height(), |x, y| {
            let [r, g, b, _] = rgba.get_pixel(x, y).0;
            Rgb([r, g, b])
        }),
        other => other.to_rgb8(),
    }
}

/// Cut `bbox` out of `image`. The box must already be clamped to the image.
pub fn crop(image: &RgbImage, bbox: &BoundingBox) -> RgbImage {
    imageops::crop_imm(
        image,
        bbox.x1.max(0) as u32,
        bbox.y1.max(0) as u32,
        bbox.width(),
        bbox.height(),
    )
    .to_image()
}

/// `[1, 3, H, W]` with values scaled from [0, 255] to [0, 1]
pub fn to_nchw(rgb: &RgbImage) -> Array4<f32> {
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }

    tensor
}

/// Normalize, resize and lay out a face crop as model input on `device`
pub fn preprocess(crop: &DynamicImage, target_size: u32, device: &Device) -> Result<Tensor> {
    let rgb = to_three_channels(crop);
    let resized = imageops::resize(&rgb, target_size, target_size, RESAMPLING);
    let array = to_nchw(&resized);

    let shape = array.dim();
    let data = array
        .as_slice()
        .ok_or_else(|| anyhow::anyhow!("preprocessed array is not contiguous"))?
        .to_vec();

    let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?.to_device(device)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgba, RgbaImage};

    fn gradient_gray(w: u32, h: u32) -> GrayImage {
        ImageBuffer::from_fn(w, h, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]))
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_shape_and_range() {
        let crop = DynamicImage::ImageRgb8(ImageBuffer::from_fn(100, 100, |x, y| {
            Rgb([(x * 2) as u8, (y * 2) as u8, 255])
        }));
        let tensor = preprocess(&crop, 256, &Device::Cpu).unwrap();

        assert_eq!(tensor.dims(), &[1, 3, 256, 256]);
        assert!(values(&tensor).iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_grayscale_matches_replicated_rgb() {
        let gray = gradient_gray(37, 53);
        let replicated = ImageBuffer::from_fn(37, 53, |x, y| {
            let v = gray.get_pixel(x, y).0[0];
            Rgb([v, v, v])
        });

        let a = preprocess(&DynamicImage::ImageLuma8(gray), 64, &Device::Cpu).unwrap();
        let b = preprocess(&DynamicImage::ImageRgb8(replicated), 64, &Device::Cpu).unwrap();
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn test_rgba_matches_alpha_dropped_rgb() {
        let rgba: RgbaImage = ImageBuffer::from_fn(40, 30, |x, y| {
            Rgba([x as u8, y as u8, (x + y) as u8, (x * y % 256) as u8])
        });
        let rgb = ImageBuffer::from_fn(40, 30, |x, y| {
            let [r, g, b, _] = rgba.get_pixel(x, y).0;
            Rgb([r, g, b])
        });

        let a = preprocess(&DynamicImage::ImageRgba8(rgba), 64, &Device::Cpu).unwrap();
        let b = preprocess(&DynamicImage::ImageRgb8(rgb), 64, &Device::Cpu).unwrap();
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn test_deterministic() {
        let crop = DynamicImage::ImageLuma8(gradient_gray(90, 120));
        let a = preprocess(&crop, 32, &Device::Cpu).unwrap();
        let b = preprocess(&crop, 32, &Device::Cpu).unwrap();
        assert_eq!(values(&a), values(&b));
    }

    #[test]
    fn test_channel_leading_layout() {
        let rgb = RgbImage::from_pixel(4, 4, Rgb([255, 0, 51]));
        let array = to_nchw(&rgb);
        assert_eq!(array.dim(), (1, 3, 4, 4));
        assert_eq!(array[[0, 0, 2, 1]], 1.0);
        assert_eq!(array[[0, 1, 2, 1]], 0.0);
        assert!((array[[0, 2, 2, 1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_crop_extracts_region() {
        let image = ImageBuffer::from_fn(10, 8, |x, y| Rgb([x as u8, y as u8, 0]));
        let face = crop(&image, &BoundingBox::new(2, 3, 6, 8));
        assert_eq!(face.dimensions(), (4, 5));
        assert_eq!(face.get_pixel(0, 0).0, [2, 3, 0]);
        assert_eq!(face.get_pixel(3, 4).0, [5, 7, 0]);
    }
}
