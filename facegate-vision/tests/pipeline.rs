use anyhow::Result;
use facegate_vision::augment::Augmentation;
use facegate_vision::face::NullDetector;
use facegate_vision::{FaceDetector, PreprocessError, Preprocessor, SkinRegionDetector};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::{rngs::StdRng, SeedableRng};
use std::io::Cursor;
use std::sync::Arc;

/// Portrait-ish frame with one skin ellipse centered at (cx, cy)
fn portrait(width: u32, height: u32, cx: f32, cy: f32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        let dx = (x as f32 - cx) / (width as f32 * 0.15);
        let dy = (y as f32 - cy) / (height as f32 * 0.2);
        if dx * dx + dy * dy <= 1.0 {
            Rgb([224, 172, 140])
        } else {
            Rgb([40, 90, 50])
        }
    }))
}

fn png(img: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

#[test]
fn detects_an_off_center_face() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let img = portrait(320, 240, 220.0, 110.0);

    let detections = SkinRegionDetector::default().detect(&img)?;
    assert_eq!(detections.len(), 1);
    let [x, y, w, h] = detections[0].bbox;
    let (cx, cy) = (x + w / 2.0, y + h / 2.0);
    assert!((cx - 220.0).abs() < 6.0, "center x {cx}");
    assert!((cy - 110.0).abs() < 6.0, "center y {cy}");
    Ok(())
}

#[test]
fn preprocess_crops_the_detected_face() -> Result<()> {
    let pre = Preprocessor::new(Arc::new(SkinRegionDetector::default()), 64, 20);
    let face = pre.preprocess(&png(&portrait(320, 240, 220.0, 110.0)))?;

    assert!(face.detected);
    assert_eq!(face.tensor.data.shape(), &[64, 64, 3]);
    assert!(face.tensor.data.iter().all(|v| (0.0..=1.0).contains(v)));
    // crop stays around the face, well to the right of the frame center
    assert!(face.region.x > 100, "{:?}", face.region);
    assert!(face.quality > 0.3);

    // the center pixel of the crop is skin
    let center = face.tensor.data.slice(ndarray::s![32, 32, ..]).to_vec();
    assert!((center[0] - 224.0 / 255.0).abs() < 0.05, "{center:?}");
    Ok(())
}

#[test]
fn falls_back_to_center_crop_without_detection() -> Result<()> {
    let pre = Preprocessor::new(Arc::new(NullDetector), 32, 20);
    let face = pre.preprocess(&png(&portrait(200, 100, 100.0, 50.0)))?;
    assert!(!face.detected);
    assert_eq!(face.region.width, 100);
    assert_eq!(face.region.height, 100);
    assert_eq!(face.region.x, 50);
    assert!(face.quality <= 0.3);
    Ok(())
}

#[test]
fn rejects_garbage_and_tiny_images() {
    let pre = Preprocessor::new(Arc::new(SkinRegionDetector::default()), 32, 20);
    assert!(matches!(
        pre.preprocess(b"\x89PNG but not really"),
        Err(PreprocessError::Decode(_))
    ));
    assert!(matches!(
        pre.preprocess(&png(&portrait(8, 40, 4.0, 20.0))),
        Err(PreprocessError::NoFaceDetected { width: 8, height: 40 })
    ));
}

#[test]
fn augmentation_preserves_shape_and_range() -> Result<()> {
    let pre = Preprocessor::new(Arc::new(SkinRegionDetector::default()), 48, 20);
    let face = pre.preprocess_image(&portrait(160, 160, 80.0, 80.0))?;

    let aug = Augmentation::default();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..10 {
        let out = aug.apply(&face.tensor, &mut rng);
        assert_eq!(out.data.shape(), face.tensor.data.shape());
        assert!(out.data.iter().all(|v| (0.0..=1.0).contains(v)));
    }
    Ok(())
}
