use anyhow::Result;
use image::DynamicImage;

/// Candidate face region in source-image pixel coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4], // x, y, w, h
    pub score: f32,
}

impl Detection {
    pub fn area(&self) -> f32 {
        self.bbox[2].max(0.0) * self.bbox[3].max(0.0)
    }
}

/// Locates candidate face regions in a decoded image.
///
/// Implementations must be deterministic: the same pixels yield the same
/// detections in the same order.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, img: &DynamicImage) -> Result<Vec<Detection>>;
}

/// Detector that never finds anything, forcing the center-crop fallback
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl FaceDetector for NullDetector {
    fn detect(&self, _img: &DynamicImage) -> Result<Vec<Detection>> {
        Ok(vec![])
    }
}

/// Pick the primary face: largest bounding-box area, earliest detection on ties
pub fn largest_detection(detections: &[Detection]) -> Option<&Detection> {
    let mut best: Option<&Detection> = None;
    for det in detections {
        match best {
            Some(b) if det.area() <= b.area() => {}
            _ => best = Some(det),
        }
    }
    best
}

/// Apply non-maximum suppression to remove overlapping detections
pub fn nms(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return vec![];
    }

    let mut sorted = detections.to_vec();
    // stable sort keeps input order among equal scores
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(sorted[i].clone());

        for j in (i + 1)..sorted.len() {
            if suppressed[j] {
                continue;
            }
            if compute_iou(&sorted[i].bbox, &sorted[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

pub fn compute_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = (a[0] + a[2]).min(b[0] + b[2]);
    let y2 = (a[1] + a[3]).min(b[1] + b[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let inter = (x2 - x1) * (y2 - y1);
    let area_a = a[2] * a[3];
    let area_b = b[2] * b[3];
    inter / (area_a + area_b - inter)
}
