//! Trained model artifacts and the process-wide "current model" slot.
//!
//! Artifacts are written under `models/` in the backing store and published
//! by rewriting the `models/CURRENT` pointer. The in-memory slot is only
//! swapped after the pointer write succeeds, so a failed publish leaves both
//! the durable and the in-memory model untouched.

use anyhow::{bail, Context, Result};
use facegate_vision::{Classifier, ClassifierKind, IdentityClassifier as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::storage::BlobStore;
use crate::training::TrainingReport;

const MODEL_PREFIX: &str = "models/";
const CURRENT_KEY: &str = "models/CURRENT";
const ARTIFACT_VERSION: u32 = 1;

/// Bidirectional identity <-> class index mapping, fixed at training time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelMap {
    classes: Vec<String>,
    index: BTreeMap<String, usize>,
}

impl LabelMap {
    /// Sorted, de-duplicated identities get contiguous indices from 0
    pub fn from_identities<I, S>(identities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut classes: Vec<String> = identities.into_iter().map(Into::into).collect();
        classes.sort();
        classes.dedup();
        let index = classes
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();
        Self { classes, index }
    }

    pub fn index_of(&self, identity_id: &str) -> Option<usize> {
        self.index.get(identity_id).copied()
    }

    pub fn identity_of(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn identities(&self) -> &[String] {
        &self.classes
    }
}

impl TryFrom<Vec<String>> for LabelMap {
    type Error = String;

    fn try_from(classes: Vec<String>) -> Result<Self, Self::Error> {
        let mut index = BTreeMap::new();
        for (i, id) in classes.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(format!("duplicate identity {id:?} in label map"));
            }
        }
        Ok(Self { classes, index })
    }
}

impl From<LabelMap> for Vec<String> {
    fn from(map: LabelMap) -> Self {
        map.classes
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub classifier: Classifier,
    pub labels: LabelMap,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub trained_at: u64,
    pub training_sample_count: usize,
    pub held_out_accuracy: Option<f32>,
}

impl ModelArtifact {
    pub fn kind(&self) -> ClassifierKind {
        self.classifier.kind()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredArtifact {
    version: u32,
    artifact: ModelArtifact,
}

pub fn encode_artifact(artifact: &ModelArtifact) -> Result<Vec<u8>> {
    Ok(postcard::to_allocvec(&StoredArtifact {
        version: ARTIFACT_VERSION,
        artifact: artifact.clone(),
    })?)
}

pub fn decode_artifact(data: &[u8]) -> Result<ModelArtifact> {
    let stored: StoredArtifact = postcard::from_bytes(data).context("decoding model artifact")?;
    if stored.version != ARTIFACT_VERSION {
        bail!("unsupported model artifact version {}", stored.version);
    }
    if stored.artifact.labels.len() != stored.artifact.classifier.num_classes() {
        bail!(
            "model artifact has {} classes but {} labels",
            stored.artifact.classifier.num_classes(),
            stored.artifact.labels.len()
        );
    }
    Ok(stored.artifact)
}

/// Persistence plus the single in-memory "current model" slot
pub struct ModelStore {
    store: Arc<dyn BlobStore>,
    current: RwLock<Option<Arc<ModelArtifact>>>,
}

impl ModelStore {
    /// Starts empty; call [`ModelStore::load_current`] to pick up a published model
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
        }
    }

    /// Snapshot of the current model; callers keep using it even if a swap follows
    pub fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn swap(&self, artifact: Arc<ModelArtifact>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(artifact);
    }

    /// Load whatever `models/CURRENT` points at into memory
    pub fn load_current(&self) -> Result<Option<Arc<ModelArtifact>>> {
        let Some(pointer) = self.store.get(CURRENT_KEY)? else {
            log::info!("no published model found");
            return Ok(None);
        };
        let key = String::from_utf8(pointer).context("model pointer is not utf-8")?;
        let artifact = Arc::new(self.read(key.trim())?);
        log::info!(
            "loaded model {} ({} classes)",
            key.trim(),
            artifact.labels.len()
        );
        self.swap(artifact.clone());
        Ok(Some(artifact))
    }

    fn read(&self, key: &str) -> Result<ModelArtifact> {
        let data = self
            .store
            .get(key)?
            .with_context(|| format!("model artifact {key} not found"))?;
        decode_artifact(&data).with_context(|| format!("loading {key}"))
    }

    /// Persist, point `CURRENT` at it, then swap it in; returns the artifact key
    pub fn publish(&self, artifact: ModelArtifact, report: &TrainingReport) -> Result<String> {
        // sequence prefix keeps `history` in publish order within the same second
        let sequence = self.last_sequence()? + 1;
        let stem = format!(
            "{MODEL_PREFIX}{sequence:06}-{:020}",
            artifact.trained_at
        );
        let key = format!("{stem}.bin");

        self.store.put(&key, &encode_artifact(&artifact)?)?;
        self.store
            .put(&format!("{stem}.history.json"), &serde_json::to_vec_pretty(report)?)?;
        self.store.put(CURRENT_KEY, key.as_bytes())?;

        self.swap(Arc::new(artifact));
        log::info!("published model {key}");
        Ok(key)
    }

    /// Persisted artifact keys, oldest first
    pub fn history(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list(MODEL_PREFIX)?
            .into_iter()
            .filter(|k| k.ends_with(".bin"))
            .collect())
    }

    /// Highest sequence number under `models/` (artifacts or reports), 0 when empty
    fn last_sequence(&self) -> Result<u64> {
        Ok(self
            .store
            .list(MODEL_PREFIX)?
            .iter()
            .filter_map(|key| {
                key.strip_prefix(MODEL_PREFIX)?
                    .split('-')
                    .next()?
                    .parse::<u64>()
                    .ok()
            })
            .max()
            .unwrap_or(0))
    }

    /// Training report stored next to an artifact
    pub fn report(&self, key: &str) -> Result<Option<TrainingReport>> {
        let Some(stem) = key.strip_suffix(".bin") else {
            return Ok(None);
        };
        match self.store.get(&format!("{stem}.history.json"))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Make a previously persisted artifact current (rollback or roll-forward)
    pub fn activate(&self, key: &str) -> Result<Arc<ModelArtifact>> {
        if !key.starts_with(MODEL_PREFIX) || !key.ends_with(".bin") {
            bail!("{key} is not a model artifact key");
        }
        let artifact = Arc::new(self.read(key)?);
        self.store.put(CURRENT_KEY, key.as_bytes())?;
        self.swap(artifact.clone());
        log::info!("activated model {key}");
        Ok(artifact)
    }

    /// Key of the published artifact, if any
    pub fn current_key(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(CURRENT_KEY)?
            .map(|p| String::from_utf8_lossy(&p).trim().to_string()))
    }
}
