pub mod augment;
pub mod classifier;
pub mod face;
pub mod features;
pub mod preprocess;
pub mod skin;

// Re-export commonly used types
pub use classifier::{Classifier, ClassifierKind, IdentityClassifier};
pub use face::{Detection, FaceDetector};
pub use preprocess::{FaceTensor, PreprocessError, PreprocessedFace, Preprocessor};
pub use skin::SkinRegionDetector;
