//! Biometric verification engine.
//!
//! `FaceGate` is the inbound surface used by the API layer: enrollment,
//! verification, administrator-triggered retraining and model status.
//! Verification only reads a snapshot of the current model, so it never waits
//! on a training run; training is exclusive with itself.

use facegate_vision::{
    ClassifierKind, FaceDetector, IdentityClassifier, Preprocessor, SkinRegionDetector,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use crate::config::Config;
use crate::decision::{decide, VerificationResult};
use crate::error::{GateError, GateResult};
use crate::model::ModelStore;
use crate::storage::{is_valid_identity, BlobStore, FaceSample, FsStore, SampleStore};
use crate::training::{self, LabeledFace, TrainingOptions, TrainingReport};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub sample_id: String,
    pub identity_id: String,
    pub quality_score: f32,
    pub face_detected: bool,
}

/// Which enrolled samples a retraining run uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SampleSet {
    #[default]
    All,
    Identities(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct TrainingRequest {
    pub samples: SampleSet,
    /// Overrides the configured epoch count
    pub epochs: Option<usize>,
    /// Overrides the configured batch size
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub loaded: bool,
    /// Storage key of the published artifact currently loaded
    pub model_key: Option<String>,
    pub classifier: Option<ClassifierKind>,
    pub class_count: usize,
    pub threshold: f32,
    pub last_trained_at: Option<u64>,
    pub input_size: Option<u32>,
    pub training_sample_count: Option<usize>,
    pub held_out_accuracy: Option<f32>,
    pub enrolled_identities: usize,
    pub enrolled_samples: usize,
}

pub struct FaceGate {
    config: Config,
    store: Arc<dyn BlobStore>,
    preprocessor: Preprocessor,
    models: ModelStore,
    training: Mutex<()>,
    sample_writes: Mutex<()>,
}

impl FaceGate {
    /// Open with the built-in skin-region detector
    pub fn open(config: Config, store: Arc<dyn BlobStore>) -> GateResult<Self> {
        Self::with_detector(config, store, Arc::new(SkinRegionDetector::default()))
    }

    /// Open on a filesystem store at `config.store_path`
    pub fn open_fs(config: Config) -> GateResult<Self> {
        let store = FsStore::open(&config.store_path)?;
        Self::open(config, Arc::new(store))
    }

    pub fn with_detector(
        config: Config,
        store: Arc<dyn BlobStore>,
        detector: Arc<dyn FaceDetector>,
    ) -> GateResult<Self> {
        config.validate()?;
        let preprocessor = Preprocessor::new(detector, config.input_size, config.face_padding);
        let models = ModelStore::new(store.clone());
        // An unreadable published model leaves the engine unloaded (fail closed)
        if let Err(e) = models.load_current() {
            log::error!("could not load published model: {e:#}");
        }
        Ok(Self {
            config,
            store,
            preprocessor,
            models,
            training: Mutex::new(()),
            sample_writes: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn samples(&self) -> SampleStore<'_> {
        SampleStore::new(self.store.as_ref())
    }

    fn lock_sample_writes(&self) -> MutexGuard<'_, ()> {
        self.sample_writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_identity(identity_id: &str) -> GateResult<()> {
        if is_valid_identity(identity_id) {
            Ok(())
        } else {
            Err(GateError::InvalidIdentity(identity_id.to_string()))
        }
    }

    /// Store a face sample for later training.
    ///
    /// The identity does not become verifiable until a retraining run that
    /// includes it completes.
    pub fn enroll(&self, identity_id: &str, image: &[u8]) -> GateResult<Enrollment> {
        Self::check_identity(identity_id)?;
        let face = self.preprocessor.preprocess(image)?;
        if face.quality < self.config.min_enroll_quality {
            log::warn!(
                "enrollment rejected: identity={identity_id} quality={:.3} minimum={:.3}",
                face.quality,
                self.config.min_enroll_quality
            );
            return Err(GateError::LowQuality {
                quality: face.quality,
                minimum: self.config.min_enroll_quality,
            });
        }

        let sample = {
            let _guard = self.lock_sample_writes();
            self.samples()
                .add(identity_id, image, Some(&face.tensor), face.quality)?
        };
        log::info!(
            "enrolled sample {} for identity={identity_id} quality={:.3} detected={}",
            sample.id,
            face.quality,
            face.detected
        );
        Ok(Enrollment {
            sample_id: sample.id,
            identity_id: identity_id.to_string(),
            quality_score: face.quality,
            face_detected: face.detected,
        })
    }

    /// Bulk dataset upload; each image succeeds or fails on its own
    pub fn enroll_batch(
        &self,
        identity_id: &str,
        images: &[Vec<u8>],
    ) -> GateResult<Vec<GateResult<Enrollment>>> {
        Self::check_identity(identity_id)?;
        let outcomes: Vec<GateResult<Enrollment>> =
            images.iter().map(|img| self.enroll(identity_id, img)).collect();
        let accepted = outcomes.iter().filter(|o| o.is_ok()).count();
        log::info!(
            "bulk enrollment for identity={identity_id}: {accepted}/{} accepted",
            images.len()
        );
        Ok(outcomes)
    }

    /// Decide whether `image` shows `identity_id`
    pub fn verify(&self, identity_id: &str, image: &[u8]) -> GateResult<VerificationResult> {
        let Some(model) = self.models.current() else {
            log::warn!("verification refused for identity={identity_id}: no model loaded");
            return Err(GateError::NotReady);
        };
        if model.labels.index_of(identity_id).is_none() {
            log::warn!("verification refused for identity={identity_id}: not in trained model");
            return Err(GateError::NoEnrollment(identity_id.to_string()));
        }

        let face = self
            .preprocessor
            .with_input_size(model.input_size)
            .preprocess(image)?;
        let probabilities = model.classifier.predict(&face.tensor)?;
        let threshold = self.config.confidence_threshold;
        let result = decide(&probabilities, &model.labels, identity_id, threshold);

        let predicted = result.predicted_identity_id.as_deref().unwrap_or("-");
        if result.accepted {
            log::info!(
                "verification accepted: identity={identity_id} confidence={:.3} threshold={threshold:.3}",
                result.confidence
            );
        } else {
            log::warn!(
                "verification rejected: identity={identity_id} predicted={predicted} confidence={:.3} threshold={threshold:.3}",
                result.confidence
            );
        }
        Ok(result)
    }

    /// Train a new model from enrolled samples and publish it.
    ///
    /// On any failure the previously published model stays current.
    pub fn retrain(&self, request: &TrainingRequest) -> GateResult<TrainingReport> {
        let _guard = match self.training.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(GateError::TrainingInProgress),
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };

        let options = self.training_options(request)?;
        let samples = self.training_samples(&request.samples)?;
        log::info!("retraining on {} enrolled sample(s)", samples.len());

        let faces = self.load_faces(&samples, options.input_size);
        let (artifact, report) = training::train(faces, &options)?;
        self.models.publish(artifact, &report)?;
        Ok(report)
    }

    fn training_options(&self, request: &TrainingRequest) -> GateResult<TrainingOptions> {
        let epochs = request.epochs.unwrap_or(self.config.epochs);
        let batch_size = request.batch_size.unwrap_or(self.config.batch_size);
        if epochs == 0 || batch_size == 0 {
            return Err(GateError::Config(
                "epochs and batch_size must be positive".to_string(),
            ));
        }
        Ok(TrainingOptions {
            epochs,
            batch_size,
            learning_rate: self.config.learning_rate,
            test_ratio: self.config.test_ratio,
            seed: self.config.split_seed,
            classifier: self.config.classifier,
            augmentation: Default::default(),
            confidence_threshold: self.config.confidence_threshold,
            input_size: self.config.input_size,
        })
    }

    fn training_samples(&self, set: &SampleSet) -> GateResult<Vec<FaceSample>> {
        let samples = self.samples();
        let all = match set {
            SampleSet::All => samples.all_samples()?,
            SampleSet::Identities(ids) => {
                let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
                let mut out = Vec::new();
                for id in wanted {
                    out.extend(samples.samples_for(id)?);
                }
                out
            }
        };
        Ok(all.into_iter().filter(|s| s.is_training_sample).collect())
    }

    /// Cached tensors when their size matches, otherwise re-preprocess the raw image
    fn load_faces(&self, samples: &[FaceSample], input_size: u32) -> Vec<LabeledFace> {
        let store = self.samples();
        let preprocessor = self.preprocessor.with_input_size(input_size);
        let mut faces = Vec::with_capacity(samples.len());
        for sample in samples {
            let cached = match store.tensor(sample) {
                Ok(Some(t)) if t.size() == input_size as usize => Some(t),
                Ok(_) => None,
                Err(e) => {
                    log::warn!("ignoring tensor cache of sample {}: {e:#}", sample.id);
                    None
                }
            };
            let tensor = match cached {
                Some(t) => t,
                None => match store
                    .image(sample)
                    .map_err(GateError::from)
                    .and_then(|img| Ok(preprocessor.preprocess(&img)?.tensor))
                {
                    Ok(t) => t,
                    Err(e) => {
                        log::warn!("skipping sample {}: {e}", sample.id);
                        continue;
                    }
                },
            };
            faces.push(LabeledFace {
                identity_id: sample.identity_id.clone(),
                tensor,
            });
        }
        faces
    }

    pub fn model_status(&self) -> GateResult<ModelStatus> {
        let samples = self.samples();
        let identities = samples.identities()?;
        let mut enrolled_samples = 0;
        for id in &identities {
            enrolled_samples += samples.samples_for(id)?.len();
        }

        let model = self.models.current();
        let model_key = match model {
            Some(_) => self.models.current_key()?,
            None => None,
        };
        Ok(ModelStatus {
            loaded: model.is_some(),
            model_key,
            classifier: model.as_ref().map(|m| m.kind()),
            class_count: model.as_ref().map(|m| m.labels.len()).unwrap_or(0),
            threshold: self.config.confidence_threshold,
            last_trained_at: model.as_ref().map(|m| m.trained_at),
            input_size: model.as_ref().map(|m| m.input_size),
            training_sample_count: model.as_ref().map(|m| m.training_sample_count),
            held_out_accuracy: model.as_ref().and_then(|m| m.held_out_accuracy),
            enrolled_identities: identities.len(),
            enrolled_samples,
        })
    }

    /// Include or exclude a sample from future retraining without deleting it
    pub fn set_training_sample(&self, sample_id: &str, included: bool) -> GateResult<()> {
        let _guard = self.lock_sample_writes();
        if self.samples().set_training(sample_id, included)? {
            log::info!("sample {sample_id} training flag set to {included}");
            Ok(())
        } else {
            Err(GateError::UnknownSample(sample_id.to_string()))
        }
    }

    /// Delete every sample of an identity; the current model is unaffected until retraining
    pub fn purge_identity(&self, identity_id: &str) -> GateResult<usize> {
        Self::check_identity(identity_id)?;
        let _guard = self.lock_sample_writes();
        let removed = self.samples().purge(identity_id)?;
        log::info!("purged {removed} sample(s) for identity={identity_id}");
        Ok(removed)
    }

    pub fn samples_for(&self, identity_id: &str) -> GateResult<Vec<FaceSample>> {
        Self::check_identity(identity_id)?;
        Ok(self.samples().samples_for(identity_id)?)
    }

    /// Persisted model artifact keys, oldest first
    pub fn model_history(&self) -> GateResult<Vec<String>> {
        Ok(self.models.history()?)
    }

    pub fn training_report(&self, key: &str) -> GateResult<Option<TrainingReport>> {
        Ok(self.models.report(key)?)
    }

    /// Roll the current model back (or forward) to a persisted artifact
    pub fn activate_model(&self, key: &str) -> GateResult<()> {
        let _guard = match self.training.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(GateError::TrainingInProgress),
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
        };
        self.models.activate(key)?;
        Ok(())
    }
}
