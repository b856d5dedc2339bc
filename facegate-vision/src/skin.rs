//! Deterministic skin-region face localizer.
//!
//! Pixels are classified as skin in YCbCr space, grouped into 4-connected
//! components, and components with a plausible face shape become detections.
//! The detector holds no state, so one instance can serve concurrent callers.

use anyhow::Result;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use std::collections::VecDeque;

use crate::face::{nms, Detection, FaceDetector};

const WORK_SIZE: u32 = 160;
const CB_RANGE: (f32, f32) = (77.0, 127.0);
const CR_RANGE: (f32, f32) = (133.0, 173.0);

#[derive(Debug, Clone)]
pub struct SkinRegionDetector {
    /// Minimum component size as a fraction of the working image area
    pub min_area_fraction: f32,
    /// Accepted height/width ratio of a component's bounding box
    pub aspect_range: (f32, f32),
    /// Minimum share of the bounding box covered by skin pixels
    pub min_fill: f32,
    pub nms_threshold: f32,
}

impl Default for SkinRegionDetector {
    fn default() -> Self {
        Self {
            min_area_fraction: 0.01,
            aspect_range: (0.6, 2.2),
            min_fill: 0.4,
            nms_threshold: 0.3,
        }
    }
}

impl FaceDetector for SkinRegionDetector {
    fn detect(&self, img: &DynamicImage) -> Result<Vec<Detection>> {
        let (orig_width, orig_height) = img.dimensions();
        if orig_width == 0 || orig_height == 0 {
            return Ok(vec![]);
        }

        // Work on a bounded copy; scale maps working coords back to the source
        let max_dim = orig_width.max(orig_height);
        let (work, scale) = if max_dim > WORK_SIZE {
            let scale = WORK_SIZE as f32 / max_dim as f32;
            let w = ((orig_width as f32 * scale) as u32).max(1);
            let h = ((orig_height as f32 * scale) as u32).max(1);
            (img.resize_exact(w, h, FilterType::Triangle).to_rgb8(), scale)
        } else {
            (img.to_rgb8(), 1.0)
        };

        let (width, height) = work.dimensions();
        let mask: Vec<bool> = work
            .pixels()
            .map(|p| is_skin(p[0], p[1], p[2]))
            .collect();

        let min_pixels = (self.min_area_fraction * (width * height) as f32).max(1.0) as usize;
        let detections: Vec<Detection> = components(&mask, width as usize, height as usize)
            .into_iter()
            .filter(|c| c.pixels >= min_pixels)
            .filter_map(|c| {
                let w = (c.max_x - c.min_x + 1) as f32;
                let h = (c.max_y - c.min_y + 1) as f32;
                let aspect = h / w;
                if aspect < self.aspect_range.0 || aspect > self.aspect_range.1 {
                    return None;
                }
                let fill = c.pixels as f32 / (w * h);
                if fill < self.min_fill {
                    return None;
                }
                Some(Detection {
                    bbox: [
                        c.min_x as f32 / scale,
                        c.min_y as f32 / scale,
                        w / scale,
                        h / scale,
                    ],
                    score: fill.min(1.0),
                })
            })
            .collect();

        log::debug!("skin detector: {} candidate region(s)", detections.len());
        Ok(nms(&detections, self.nms_threshold))
    }
}

fn is_skin(r: u8, g: u8, b: u8) -> bool {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (CB_RANGE.0..=CB_RANGE.1).contains(&cb) && (CR_RANGE.0..=CR_RANGE.1).contains(&cr)
}

#[derive(Debug)]
struct Component {
    min_x: usize,
    min_y: usize,
    max_x: usize,
    max_y: usize,
    pixels: usize,
}

/// Label 4-connected components in raster order
fn components(mask: &[bool], width: usize, height: usize) -> Vec<Component> {
    let mut visited = vec![false; mask.len()];
    let mut found = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        queue.push_back(start);
        let mut comp = Component {
            min_x: start % width,
            min_y: start / width,
            max_x: start % width,
            max_y: start / width,
            pixels: 0,
        };

        while let Some(idx) = queue.pop_front() {
            let (x, y) = (idx % width, idx / width);
            comp.pixels += 1;
            comp.min_x = comp.min_x.min(x);
            comp.max_x = comp.max_x.max(x);
            comp.min_y = comp.min_y.min(y);
            comp.max_y = comp.max_y.max(y);

            let mut visit = |n: usize| {
                if mask[n] && !visited[n] {
                    visited[n] = true;
                    queue.push_back(n);
                }
            };
            if x > 0 {
                visit(idx - 1);
            }
            if x + 1 < width {
                visit(idx + 1);
            }
            if y > 0 {
                visit(idx - width);
            }
            if y + 1 < height {
                visit(idx + width);
            }
        }
        found.push(comp);
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    const SKIN: Rgb<u8> = Rgb([224, 172, 140]);
    const BACKGROUND: Rgb<u8> = Rgb([30, 60, 160]);

    fn ellipse_image(w: u32, h: u32, cx: f32, cy: f32, rx: f32, ry: f32) -> DynamicImage {
        let img = RgbImage::from_fn(w, h, |x, y| {
            let dx = (x as f32 - cx) / rx;
            let dy = (y as f32 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                SKIN
            } else {
                BACKGROUND
            }
        });
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn skin_color_classification() {
        assert!(is_skin(224, 172, 140));
        assert!(is_skin(141, 85, 36));
        assert!(!is_skin(30, 60, 160));
        assert!(!is_skin(0, 0, 0));
        assert!(!is_skin(255, 255, 255));
    }

    #[test]
    fn finds_single_face_shaped_region() -> Result<()> {
        let img = ellipse_image(120, 120, 60.0, 60.0, 20.0, 28.0);
        let dets = SkinRegionDetector::default().detect(&img)?;
        assert_eq!(dets.len(), 1);
        let [x, y, w, h] = dets[0].bbox;
        assert!((x - 40.0).abs() <= 1.0, "x = {x}");
        assert!((y - 32.0).abs() <= 1.0, "y = {y}");
        assert!((w - 41.0).abs() <= 2.0, "w = {w}");
        assert!((h - 57.0).abs() <= 2.0, "h = {h}");
        assert!(dets[0].score > 0.7 && dets[0].score <= 1.0);
        Ok(())
    }

    #[test]
    fn maps_back_to_source_coordinates_after_downscale() -> Result<()> {
        let img = ellipse_image(640, 320, 320.0, 160.0, 60.0, 90.0);
        let dets = SkinRegionDetector::default().detect(&img)?;
        assert_eq!(dets.len(), 1);
        let [x, y, w, h] = dets[0].bbox;
        assert!((x + w / 2.0 - 320.0).abs() < 8.0);
        assert!((y + h / 2.0 - 160.0).abs() < 8.0);
        assert!((h - 180.0).abs() < 12.0, "h = {h}");
        Ok(())
    }

    #[test]
    fn rejects_background_and_thin_strips() -> Result<()> {
        let plain = DynamicImage::ImageRgb8(RgbImage::from_pixel(100, 100, BACKGROUND));
        assert!(SkinRegionDetector::default().detect(&plain)?.is_empty());

        // a horizontal skin bar is far too wide to be a face
        let bar = RgbImage::from_fn(100, 100, |_, y| if (45..52).contains(&y) { SKIN } else { BACKGROUND });
        let dets = SkinRegionDetector::default().detect(&DynamicImage::ImageRgb8(bar))?;
        assert!(dets.is_empty());
        Ok(())
    }

    #[test]
    fn detection_is_deterministic() -> Result<()> {
        let img = ellipse_image(90, 110, 40.0, 55.0, 18.0, 25.0);
        let detector = SkinRegionDetector::default();
        assert_eq!(detector.detect(&img)?, detector.detect(&img)?);
        Ok(())
    }
}
