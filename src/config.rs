use anyhow::{Context, Result};
use facegate_vision::ClassifierKind;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::GateError;

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEGATE_CONFIG_PATH").unwrap_or("/usr/local/etc/facegate/config.toml"))
});

pub static STORE_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("FACEGATE_STORE_PREFIX").unwrap_or("/var/lib/facegate"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum top-class probability for an accepted verification
    pub confidence_threshold: f32,
    /// Side length of the square face tensor
    pub input_size: u32,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// Pixels added around a detected face before cropping
    pub face_padding: u32,
    /// Share of each identity's samples held out for evaluation
    pub test_ratio: f32,
    pub split_seed: u64,
    pub classifier: ClassifierKind,
    pub min_enroll_quality: f32,
    pub store_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.85,
            input_size: 128,
            epochs: 50,
            batch_size: 32,
            learning_rate: 0.001,
            face_padding: 20,
            test_ratio: 0.3,
            split_seed: 42,
            classifier: ClassifierKind::Softmax,
            min_enroll_quality: 0.0,
            store_path: STORE_PREFIX.to_path_buf(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), GateError> {
        let invalid = |msg: String| Err(GateError::Config(msg));
        if !(self.confidence_threshold > 0.0 && self.confidence_threshold <= 1.0) {
            return invalid(format!(
                "confidence_threshold must be in (0, 1], got {}",
                self.confidence_threshold
            ));
        }
        if self.input_size < 16 {
            return invalid(format!("input_size must be at least 16, got {}", self.input_size));
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return invalid("epochs and batch_size must be positive".to_string());
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return invalid(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.test_ratio) {
            return invalid(format!("test_ratio must be in [0, 1), got {}", self.test_ratio));
        }
        if !(0.0..=1.0).contains(&self.min_enroll_quality) {
            return invalid(format!(
                "min_enroll_quality must be in [0, 1], got {}",
                self.min_enroll_quality
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data).with_context(|| format!("writing config {}", path.display()))?;
    Ok(())
}
