use anyhow::Result;
use facegate::config::Config;
use facegate::storage::{BlobStore, FsStore, MemoryStore};
use facegate::{ClassifierKind, FaceGate, GateError, SampleSet, TrainingRequest};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

const BACKGROUND: [u8; 3] = [30, 60, 160];
const LIGHT: [u8; 3] = [224, 172, 140];
const DARK: [u8; 3] = [141, 85, 36];

/// 96x96 PNG with a face-shaped skin ellipse on a blue background
fn face_png(skin: [u8; 3], offset: i32) -> Vec<u8> {
    let (cx, cy) = (48.0 + offset as f32, 48.0 - offset as f32 * 0.5);
    let img = RgbImage::from_fn(96, 96, |x, y| {
        let dx = (x as f32 - cx) / 22.0;
        let dy = (y as f32 - cy) / 30.0;
        if dx * dx + dy * dy <= 1.0 {
            // faint vertical shading so the face is not perfectly flat
            let shade = (y % 8) as u8;
            Rgb([skin[0].saturating_sub(shade), skin[1].saturating_sub(shade), skin[2]])
        } else {
            Rgb(BACKGROUND)
        }
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// Uniform grey frame: no skin region and no contrast
fn flat_png() -> Vec<u8> {
    let img = RgbImage::from_pixel(64, 64, Rgb([128, 128, 128]));
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn test_config() -> Config {
    Config {
        input_size: 32,
        epochs: 20,
        batch_size: 8,
        learning_rate: 0.01,
        ..Config::default()
    }
}

fn enroll_pair(gate: &FaceGate) -> Result<()> {
    for offset in -3..3 {
        gate.enroll("alice", &face_png(LIGHT, offset))?;
        gate.enroll("bob", &face_png(DARK, offset))?;
    }
    Ok(())
}

fn trained_gate(config: Config) -> Result<FaceGate> {
    let gate = FaceGate::open(config, Arc::new(MemoryStore::new()))?;
    enroll_pair(&gate)?;
    gate.retrain(&TrainingRequest::default())?;
    Ok(gate)
}

#[test]
fn verify_before_training_is_not_ready() -> Result<()> {
    let gate = FaceGate::open(test_config(), Arc::new(MemoryStore::new()))?;
    enroll_pair(&gate)?;
    let err = gate.verify("alice", &face_png(LIGHT, 0)).unwrap_err();
    assert!(matches!(err, GateError::NotReady));

    let status = gate.model_status()?;
    assert!(!status.loaded);
    assert_eq!(status.model_key, None);
    assert_eq!(status.classifier, None);
    assert_eq!(status.class_count, 0);
    assert_eq!(status.enrolled_identities, 2);
    assert_eq!(status.enrolled_samples, 12);
    Ok(())
}

#[test]
fn accepts_genuine_and_rejects_impostor() -> Result<()> {
    let gate = trained_gate(test_config())?;

    let genuine = gate.verify("alice", &face_png(LIGHT, 1))?;
    assert!(genuine.accepted, "{genuine:?}");
    assert!(genuine.confidence >= 0.85);
    assert_eq!(genuine.predicted_identity_id.as_deref(), Some("alice"));
    assert_eq!(genuine.threshold_used, 0.85);

    let impostor = gate.verify("alice", &face_png(DARK, 1))?;
    assert!(!impostor.accepted, "{impostor:?}");
    assert_eq!(impostor.predicted_identity_id.as_deref(), Some("bob"));
    Ok(())
}

#[test]
fn centroid_classifier_separates_identities() -> Result<()> {
    let gate = trained_gate(Config {
        classifier: ClassifierKind::Centroid,
        ..test_config()
    })?;
    assert!(gate.verify("bob", &face_png(DARK, 0))?.accepted);
    assert!(!gate.verify("bob", &face_png(LIGHT, 0))?.accepted);
    Ok(())
}

#[test]
fn unknown_and_untrained_identities_have_no_enrollment() -> Result<()> {
    let gate = trained_gate(test_config())?;

    let err = gate.verify("carol", &face_png(LIGHT, 0)).unwrap_err();
    assert!(matches!(err, GateError::NoEnrollment(ref id) if id == "carol"));

    // enrolled but not yet part of a trained model
    gate.enroll("carol", &face_png(LIGHT, 2))?;
    let err = gate.verify("carol", &face_png(LIGHT, 2)).unwrap_err();
    assert!(matches!(err, GateError::NoEnrollment(_)));
    Ok(())
}

#[test]
fn undecodable_images_are_decode_errors() -> Result<()> {
    let gate = trained_gate(test_config())?;
    assert!(matches!(
        gate.verify("alice", b"not an image").unwrap_err(),
        GateError::Decode
    ));
    assert!(matches!(
        gate.enroll("alice", b"not an image").unwrap_err(),
        GateError::Decode
    ));
    Ok(())
}

#[test]
fn invalid_identity_ids_are_rejected() -> Result<()> {
    let gate = FaceGate::open(test_config(), Arc::new(MemoryStore::new()))?;
    for bad in ["", "../etc", "a/b"] {
        let err = gate.enroll(bad, &face_png(LIGHT, 0)).unwrap_err();
        assert!(matches!(err, GateError::InvalidIdentity(_)), "{bad:?}");
    }
    Ok(())
}

#[test]
fn failed_retrain_keeps_the_current_model() -> Result<()> {
    let gate = trained_gate(test_config())?;
    let before = gate.model_status()?;
    let history = gate.model_history()?;
    assert_eq!(history.len(), 1);

    assert_eq!(gate.purge_identity("bob")?, 6);
    let err = gate.retrain(&TrainingRequest::default()).unwrap_err();
    assert!(matches!(err, GateError::InsufficientData { identities: 1 }));

    let after = gate.model_status()?;
    assert!(after.loaded);
    assert_eq!(after.class_count, 2);
    assert_eq!(after.last_trained_at, before.last_trained_at);
    assert_eq!(gate.model_history()?, history);
    // the purged identity is still in the old model until a retrain succeeds
    assert!(gate.verify("alice", &face_png(LIGHT, 0))?.accepted);
    Ok(())
}

#[test]
fn excluded_samples_are_left_out_of_training() -> Result<()> {
    let gate = FaceGate::open(test_config(), Arc::new(MemoryStore::new()))?;
    enroll_pair(&gate)?;
    for sample in gate.samples_for("bob")? {
        gate.set_training_sample(&sample.id, false)?;
    }
    let err = gate.retrain(&TrainingRequest::default()).unwrap_err();
    assert!(matches!(err, GateError::InsufficientData { identities: 1 }));

    let first = gate.samples_for("bob")?.remove(0);
    assert!(!first.is_training_sample);
    gate.set_training_sample(&first.id, true)?;
    let report = gate.retrain(&TrainingRequest::default())?;
    assert_eq!(report.class_count, 2);
    assert_eq!(report.sample_count, 7);

    let err = gate.set_training_sample("no-such-sample", true).unwrap_err();
    assert!(matches!(err, GateError::UnknownSample(_)));
    Ok(())
}

#[test]
fn retrain_can_be_limited_to_identities() -> Result<()> {
    let gate = FaceGate::open(test_config(), Arc::new(MemoryStore::new()))?;
    enroll_pair(&gate)?;
    for offset in 0..3 {
        gate.enroll("carol", &face_png(LIGHT, offset))?;
    }
    let report = gate.retrain(&TrainingRequest {
        samples: SampleSet::Identities(vec!["alice".into(), "bob".into()]),
        epochs: Some(5),
        batch_size: None,
    })?;
    assert_eq!(report.class_count, 2);
    assert_eq!(report.sample_count, 12);
    assert_eq!(report.epochs.len(), 5);
    assert!(matches!(
        gate.verify("carol", &face_png(LIGHT, 0)).unwrap_err(),
        GateError::NoEnrollment(_)
    ));
    Ok(())
}

#[test]
fn report_reflects_stratified_split() -> Result<()> {
    let gate = FaceGate::open(test_config(), Arc::new(MemoryStore::new()))?;
    enroll_pair(&gate)?;
    let report = gate.retrain(&TrainingRequest::default())?;
    // round(6 * 0.3) = 2 held out per identity
    assert_eq!(report.test_count, 4);
    assert_eq!(report.train_count, 8);
    assert!(report.held_out_accuracy.is_some());

    let status = gate.model_status()?;
    assert_eq!(status.training_sample_count, Some(8));
    assert_eq!(status.input_size, Some(32));
    assert_eq!(status.classifier, Some(ClassifierKind::Softmax));
    assert_eq!(status.model_key.as_ref(), gate.model_history()?.last());
    Ok(())
}

#[test]
fn low_quality_enrollment_stores_nothing() -> Result<()> {
    let gate = FaceGate::open(
        Config {
            min_enroll_quality: 0.5,
            ..test_config()
        },
        Arc::new(MemoryStore::new()),
    )?;

    match gate.enroll("alice", &flat_png()).unwrap_err() {
        GateError::LowQuality { quality, minimum } => {
            assert!(quality < 0.5, "quality {quality}");
            assert_eq!(minimum, 0.5);
        }
        other => panic!("expected LowQuality, got {other:?}"),
    }
    assert!(gate.samples_for("alice")?.is_empty());
    assert_eq!(gate.model_status()?.enrolled_samples, 0);
    Ok(())
}

#[test]
fn bulk_enrollment_reports_each_image() -> Result<()> {
    let gate = FaceGate::open(
        Config {
            min_enroll_quality: 0.5,
            ..test_config()
        },
        Arc::new(MemoryStore::new()),
    )?;

    let images = vec![face_png(LIGHT, 0), b"junk".to_vec(), flat_png()];
    let outcomes = gate.enroll_batch("alice", &images)?;
    assert_eq!(outcomes.len(), 3);

    let accepted = outcomes[0].as_ref().expect("face image is accepted");
    assert_eq!(accepted.identity_id, "alice");
    assert!(accepted.face_detected);
    assert!(accepted.quality_score >= 0.5);
    assert!(matches!(outcomes[1], Err(GateError::Decode)));
    assert!(matches!(outcomes[2], Err(GateError::LowQuality { .. })));

    let stored = gate.samples_for("alice")?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, accepted.sample_id);

    assert!(matches!(
        gate.enroll_batch("../alice", &images).unwrap_err(),
        GateError::InvalidIdentity(_)
    ));
    Ok(())
}

/// Blocks the first `list` call until released, so a training run can be held open
struct GatedStore {
    inner: MemoryStore,
    gate: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl BlobStore for GatedStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let armed = self.gate.lock().unwrap().take();
        if let Some((entered, release)) = armed {
            entered.send(()).unwrap();
            release.recv().unwrap();
        }
        self.inner.list(prefix)
    }
}

#[test]
fn concurrent_training_is_rejected() -> Result<()> {
    let store = Arc::new(GatedStore {
        inner: MemoryStore::new(),
        gate: Mutex::new(None),
    });
    let gate = FaceGate::open(test_config(), store.clone())?;
    enroll_pair(&gate)?;

    let (entered_tx, entered_rx) = channel();
    let (release_tx, release_rx) = channel();
    *store.gate.lock().unwrap() = Some((entered_tx, release_rx));

    std::thread::scope(|s| -> Result<()> {
        let first = s.spawn(|| gate.retrain(&TrainingRequest::default()));
        entered_rx.recv()?;

        let err = gate.retrain(&TrainingRequest::default()).unwrap_err();
        assert!(matches!(err, GateError::TrainingInProgress));
        // verification never waits on training
        assert!(matches!(
            gate.verify("alice", &face_png(LIGHT, 0)).unwrap_err(),
            GateError::NotReady
        ));

        release_tx.send(())?;
        let report = first.join().unwrap()?;
        assert_eq!(report.class_count, 2);
        Ok(())
    })?;

    assert!(gate.verify("alice", &face_png(LIGHT, 0))?.accepted);
    Ok(())
}

#[test]
fn published_model_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = Config {
        store_path: dir.path().to_path_buf(),
        ..test_config()
    };

    let first_report = {
        let gate = FaceGate::open_fs(config.clone())?;
        enroll_pair(&gate)?;
        gate.retrain(&TrainingRequest::default())?
    };

    let gate = FaceGate::open(config.clone(), Arc::new(FsStore::open(dir.path())?))?;
    let status = gate.model_status()?;
    assert!(status.loaded);
    assert_eq!(status.class_count, 2);
    assert_eq!(status.held_out_accuracy, first_report.held_out_accuracy);
    assert!(gate.verify("bob", &face_png(DARK, -1))?.accepted);

    let history = gate.model_history()?;
    assert_eq!(history.len(), 1);
    assert_eq!(gate.training_report(&history[0])?, Some(first_report));
    Ok(())
}

#[test]
fn activate_rolls_back_to_an_earlier_model() -> Result<()> {
    let gate = FaceGate::open(test_config(), Arc::new(MemoryStore::new()))?;
    enroll_pair(&gate)?;
    gate.retrain(&TrainingRequest::default())?;

    for offset in 0..3 {
        gate.enroll("carol", &face_png([200, 120, 90], offset))?;
    }
    gate.retrain(&TrainingRequest::default())?;
    assert_eq!(gate.model_status()?.class_count, 3);

    let history = gate.model_history()?;
    assert_eq!(history.len(), 2);
    gate.activate_model(&history[0])?;
    assert_eq!(gate.model_status()?.class_count, 2);
    assert!(matches!(
        gate.verify("carol", &face_png([200, 120, 90], 0)).unwrap_err(),
        GateError::NoEnrollment(_)
    ));
    Ok(())
}
