pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod model;
pub mod storage;
pub mod training;

// Re-export vision types for convenience
pub use facegate_vision::{
    augment, classifier, face, preprocess, skin, ClassifierKind, Detection, FaceDetector,
    FaceTensor, Preprocessor, SkinRegionDetector,
};

pub use decision::VerificationResult;
pub use engine::{Enrollment, FaceGate, ModelStatus, SampleSet, TrainingRequest};
pub use error::{GateError, GateResult};
pub use model::{LabelMap, ModelArtifact};
pub use training::TrainingReport;
