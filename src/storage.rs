use anyhow::{Context, Result};
use facegate_vision::FaceTensor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Durable key/value surface. Keys are `/`-separated relative paths.
///
/// `put` is all-or-nothing: a reader sees either the previous value or the
/// new one in full.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    /// Keys starting with `prefix`, sorted
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Filesystem-backed store rooted at a directory
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating store at {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let mut p = self.root.clone();
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                anyhow::bail!("invalid storage key {key:?}");
            }
            p.push(part);
        }
        Ok(p)
    }

    fn collect(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            // in-flight temp files are not keys
            if name.starts_with(".tmp") {
                continue;
            }
            let key = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl BlobStore for FsStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .context("storage key has no parent directory")?;
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

        // The temp file is deleted on drop unless persisted
        let mut temp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(dir)
            .with_context(|| format!("creating temp file in {}", dir.display()))?;
        temp.write_all(value)?;
        temp.as_file().sync_all()?;
        temp.persist(&path)
            .with_context(|| format!("publishing {}", path.display()))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // only walk the directory the prefix names
        let (dir, rel) = match prefix.rfind('/') {
            Some(i) => (self.path_for(&prefix[..i])?, &prefix[..i]),
            None => (self.root.clone(), ""),
        };
        let mut keys = Vec::new();
        self.collect(&dir, rel, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}

/// In-process store, mainly for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries().remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One enrolled face image and its metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceSample {
    pub id: String,
    pub identity_id: String,
    /// Storage key of the raw image bytes
    pub image_key: String,
    /// Storage key of the cached preprocessed tensor, if any
    pub tensor_key: Option<String>,
    pub image_hash: String,
    pub quality_score: f32,
    pub is_training_sample: bool,
    pub enrolled_at: u64,
}

/// Accepts 1-128 characters from `[A-Za-z0-9._@-]`, not starting with a dot
pub fn is_valid_identity(identity_id: &str) -> bool {
    !identity_id.is_empty()
        && identity_id.len() <= 128
        && !identity_id.starts_with('.')
        && identity_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'))
}

pub fn image_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Face samples grouped per identity on top of a [`BlobStore`]
pub struct SampleStore<'a> {
    store: &'a dyn BlobStore,
}

const SAMPLE_PREFIX: &str = "samples/";

fn records_key(identity_id: &str) -> String {
    format!("{SAMPLE_PREFIX}{identity_id}.bin")
}

impl<'a> SampleStore<'a> {
    pub fn new(store: &'a dyn BlobStore) -> Self {
        Self { store }
    }

    pub fn samples_for(&self, identity_id: &str) -> Result<Vec<FaceSample>> {
        let key = records_key(identity_id);
        match self.store.get(&key)? {
            Some(data) => postcard::from_bytes(&data).with_context(|| format!("decoding {key}")),
            None => Ok(vec![]),
        }
    }

    fn write_samples(&self, identity_id: &str, samples: &[FaceSample]) -> Result<()> {
        let data = postcard::to_allocvec(samples)?;
        self.store.put(&records_key(identity_id), &data)
    }

    /// Store the image (and optional tensor cache) first, then the record
    pub fn add(
        &self,
        identity_id: &str,
        image: &[u8],
        tensor: Option<&FaceTensor>,
        quality_score: f32,
    ) -> Result<FaceSample> {
        let id = uuid::Uuid::new_v4().to_string();
        let image_key = format!("images/{id}");
        self.store.put(&image_key, image)?;

        let tensor_key = match tensor {
            Some(t) => {
                let key = format!("tensors/{id}");
                self.store.put(&key, &postcard::to_allocvec(t)?)?;
                Some(key)
            }
            None => None,
        };

        let sample = FaceSample {
            id,
            identity_id: identity_id.to_string(),
            image_key,
            tensor_key,
            image_hash: image_hash(image),
            quality_score,
            is_training_sample: true,
            enrolled_at: unix_now(),
        };

        let mut samples = self.samples_for(identity_id)?;
        samples.push(sample.clone());
        self.write_samples(identity_id, &samples)?;
        Ok(sample)
    }

    pub fn identities(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list(SAMPLE_PREFIX)?
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(SAMPLE_PREFIX)
                    .and_then(|rest| rest.strip_suffix(".bin"))
                    .map(str::to_string)
            })
            .collect())
    }

    /// Every sample, identities in sorted order, enrollment order within each
    pub fn all_samples(&self) -> Result<Vec<FaceSample>> {
        let mut out = Vec::new();
        for identity in self.identities()? {
            out.extend(self.samples_for(&identity)?);
        }
        Ok(out)
    }

    /// Flip the training flag; returns false when no sample has that id
    pub fn set_training(&self, sample_id: &str, included: bool) -> Result<bool> {
        for identity in self.identities()? {
            let mut samples = self.samples_for(&identity)?;
            if let Some(sample) = samples.iter_mut().find(|s| s.id == sample_id) {
                sample.is_training_sample = included;
                self.write_samples(&identity, &samples)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn image(&self, sample: &FaceSample) -> Result<Vec<u8>> {
        self.store
            .get(&sample.image_key)?
            .with_context(|| format!("image for sample {} is missing", sample.id))
    }

    pub fn tensor(&self, sample: &FaceSample) -> Result<Option<FaceTensor>> {
        let Some(key) = &sample.tensor_key else {
            return Ok(None);
        };
        match self.store.get(key)? {
            Some(data) => Ok(Some(
                postcard::from_bytes(&data).with_context(|| format!("decoding {key}"))?,
            )),
            None => Ok(None),
        }
    }

    /// Remove every sample of an identity; returns how many were removed
    pub fn purge(&self, identity_id: &str) -> Result<usize> {
        let samples = self.samples_for(identity_id)?;
        self.store.remove(&records_key(identity_id))?;
        for sample in &samples {
            self.store.remove(&sample.image_key)?;
            if let Some(key) = &sample.tensor_key {
                self.store.remove(key)?;
            }
        }
        Ok(samples.len())
    }
}
