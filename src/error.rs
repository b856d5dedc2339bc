use facegate_vision::PreprocessError;
use thiserror::Error;

/// Failures surfaced by the engine facade.
///
/// A negative authentication outcome is not represented here: `verify`
/// returns it as a rejected `VerificationResult`.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("image could not be decoded")]
    Decode,
    #[error("no usable face region in the submitted image")]
    NoFaceDetected,
    #[error("face sample quality {quality:.3} is below the enrollment minimum {minimum:.3}")]
    LowQuality { quality: f32, minimum: f32 },
    #[error("insufficient training data: {identities} distinct identities, at least 2 required")]
    InsufficientData { identities: usize },
    #[error("face verification is unavailable: no model is loaded")]
    NotReady,
    #[error("identity {0} has no trained class; enroll and retrain first")]
    NoEnrollment(String),
    #[error("a training run is already in progress")]
    TrainingInProgress,
    #[error("invalid identity id {0:?}")]
    InvalidIdentity(String),
    #[error("unknown face sample {0}")]
    UnknownSample(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<PreprocessError> for GateError {
    fn from(err: PreprocessError) -> Self {
        match err {
            PreprocessError::Decode(e) => {
                log::debug!("decode failure: {e}");
                GateError::Decode
            }
            PreprocessError::NoFaceDetected { .. } => GateError::NoFaceDetected,
            PreprocessError::Shape(e) => GateError::Internal(e.into()),
        }
    }
}

pub type GateResult<T> = std::result::Result<T, GateError>;
