use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::face::{largest_detection, FaceDetector};

/// Smallest image side from which a face region can still be extracted
pub const MIN_IMAGE_SIDE: u32 = 16;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no usable face region in a {width}x{height} image")]
    NoFaceDetected { width: u32, height: u32 },
    #[error("tensor shape mismatch: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Fixed-size face tensor, height x width x RGB, values in [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceTensor {
    pub data: Array3<f32>,
}

impl FaceTensor {
    pub fn size(&self) -> usize {
        self.data.shape()[0]
    }
}

/// Region of the source image that was cropped, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct PreprocessedFace {
    pub tensor: FaceTensor,
    pub region: FaceRegion,
    /// False when the center-crop fallback was used
    pub detected: bool,
    pub quality: f32,
}

/// Decode → localize → crop → resize → normalize
#[derive(Clone)]
pub struct Preprocessor {
    detector: Arc<dyn FaceDetector>,
    input_size: u32,
    padding: u32,
}

impl Preprocessor {
    pub fn new(detector: Arc<dyn FaceDetector>, input_size: u32, padding: u32) -> Self {
        Self {
            detector,
            input_size,
            padding,
        }
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    /// Same detector and padding, different output size
    pub fn with_input_size(&self, input_size: u32) -> Self {
        Self {
            input_size,
            ..self.clone()
        }
    }

    pub fn preprocess(&self, bytes: &[u8]) -> Result<PreprocessedFace, PreprocessError> {
        let img = image::load_from_memory(bytes)?;
        self.preprocess_image(&img)
    }

    pub fn preprocess_image(&self, img: &DynamicImage) -> Result<PreprocessedFace, PreprocessError> {
        let img = DynamicImage::ImageRgb8(img.to_rgb8());
        let (width, height) = img.dimensions();
        if width < MIN_IMAGE_SIDE || height < MIN_IMAGE_SIDE {
            return Err(PreprocessError::NoFaceDetected { width, height });
        }

        // A failing detector degrades to the fallback crop, same as finding nothing
        let detections = self.detector.detect(&img).unwrap_or_else(|e| {
            log::warn!("face detector failed, using center crop: {e:#}");
            vec![]
        });

        let (region, detected, base_quality) = match largest_detection(&detections) {
            Some(det) => (
                padded_region(det.bbox, self.padding, width, height),
                true,
                0.6 + 0.4 * det.score.clamp(0.0, 1.0),
            ),
            None => (center_square(width, height), false, 0.3),
        };

        if region.width == 0 || region.height == 0 {
            return Err(PreprocessError::NoFaceDetected { width, height });
        }

        let crop = img
            .crop_imm(region.x, region.y, region.width, region.height)
            .resize_exact(self.input_size, self.input_size, FilterType::Triangle)
            .to_rgb8();

        let size = self.input_size as usize;
        let data: Vec<f32> = crop.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
        let tensor = FaceTensor {
            data: Array3::from_shape_vec((size, size, 3), data)?,
        };
        let quality = (base_quality * contrast_factor(&tensor)).clamp(0.0, 1.0);

        Ok(PreprocessedFace {
            tensor,
            region,
            detected,
            quality,
        })
    }
}

/// Expand a detection box by `padding` pixels on every side, clamped to the image
pub fn padded_region(bbox: [f32; 4], padding: u32, width: u32, height: u32) -> FaceRegion {
    let x0 = bbox[0].floor().max(0.0) as u32;
    let y0 = bbox[1].floor().max(0.0) as u32;
    let x1 = ((bbox[0] + bbox[2]).ceil().max(0.0) as u32).min(width);
    let y1 = ((bbox[1] + bbox[3]).ceil().max(0.0) as u32).min(height);

    let x = x0.min(width).saturating_sub(padding);
    let y = y0.min(height).saturating_sub(padding);
    let right = (x1 + padding).min(width);
    let bottom = (y1 + padding).min(height);

    FaceRegion {
        x,
        y,
        width: right.saturating_sub(x),
        height: bottom.saturating_sub(y),
    }
}

/// Centered square sized to the shorter side
pub fn center_square(width: u32, height: u32) -> FaceRegion {
    let side = width.min(height);
    FaceRegion {
        x: (width - side) / 2,
        y: (height - side) / 2,
        width: side,
        height: side,
    }
}

/// Luminance standard deviation relative to 0.25, capped at 1
fn contrast_factor(tensor: &FaceTensor) -> f32 {
    let luma: Vec<f32> = tensor
        .data
        .lanes(Axis(2))
        .into_iter()
        .map(|px| 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2])
        .collect();
    if luma.is_empty() {
        return 0.0;
    }
    let n = luma.len() as f32;
    let mean = luma.iter().sum::<f32>() / n;
    let var = luma.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (var.sqrt() / 0.25).min(1.0)
}
