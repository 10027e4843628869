//! Face detection, training and recognition for attendance.
//!
//! Detection runs SCRFD via ONNX Runtime. Enrolled faces are normalized to
//! fixed-size grayscale patches and classified with a Local Binary Patterns
//! Histograms model whose distance scores are lower-is-better.

pub mod detector;
pub mod face;
pub mod lbph;
pub mod model;
pub mod recognizer;
pub mod trainer;
pub mod types;

pub use detector::{DetectorError, FaceDetect, ScrfdDetector};
pub use face::{normalize_face, FaceError, NormalizedFace, FACE_SIZE};
pub use model::{LabelMap, ModelError, TrainedModel};
pub use recognizer::{ModelSlot, Recognition, Recognizer, DEFAULT_THRESHOLD};
pub use trainer::{train, train_and_save, EnrolledFaces, TrainError, TrainReport};
pub use types::{BoundingBox, DetectParams, Embedding};
