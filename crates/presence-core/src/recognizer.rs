//! Recognition engine and its hot-swappable holder.

use crate::face::NormalizedFace;
use crate::lbph::Prediction;
use crate::model::{ModelError, TrainedModel};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Default match cutoff in chi-square units. Distances strictly below it match.
pub const DEFAULT_THRESHOLD: f64 = 100.0;

/// Outcome of classifying one normalized face.
#[derive(Debug, Clone, PartialEq)]
pub enum Recognition {
    Known { user_id: String, confidence: f64 },
    Unknown,
}

impl Recognition {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Recognition::Known { user_id, .. } => Some(user_id),
            Recognition::Unknown => None,
        }
    }
}

/// Immutable classifier + label map with a match threshold.
///
/// Read-only after construction, so one instance is shared across capture
/// threads behind an `Arc`.
#[derive(Debug)]
pub struct Recognizer {
    model: TrainedModel,
    threshold: f64,
}

impl Recognizer {
    pub fn new(model: TrainedModel, threshold: f64) -> Self {
        Self { model, threshold }
    }

    pub fn load(path: &Path, threshold: f64) -> Result<Self, ModelError> {
        let model = TrainedModel::load(path)?;
        tracing::info!(
            path = %path.display(),
            users = model.label_map.len(),
            trained_at = %model.trained_at,
            threshold,
            "recognition model loaded"
        );
        Ok(Self::new(model, threshold))
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn model(&self) -> &TrainedModel {
        &self.model
    }

    /// Classify a normalized face patch.
    pub fn recognize(&self, face: &NormalizedFace) -> Recognition {
        match self.model.classifier.predict(face) {
            Some(prediction) => self.resolve(prediction),
            None => Recognition::Unknown,
        }
    }

    /// Apply the threshold and label map to a raw prediction.
    ///
    /// A distance equal to the threshold is rejected. A label missing from the
    /// map is rejected too, even though a validated model never produces one.
    pub fn resolve(&self, prediction: Prediction) -> Recognition {
        let matched = prediction.distance < self.threshold;
        if !matched {
            tracing::trace!(
                label = prediction.label,
                confidence = prediction.distance,
                "prediction above threshold"
            );
            return Recognition::Unknown;
        }
        match self.model.label_map.user_id(prediction.label) {
            Some(user_id) => Recognition::Known {
                user_id: user_id.to_string(),
                confidence: prediction.distance,
            },
            None => {
                tracing::warn!(label = prediction.label, "classifier label missing from label map");
                Recognition::Unknown
            }
        }
    }
}

/// Holder for the current [`Recognizer`], swappable while capture runs.
///
/// Callers take a [`snapshot`](Self::snapshot) per frame; a concurrent
/// [`reload`](Self::reload) only affects later snapshots, so an in-flight
/// frame finishes on the model it started with.
pub struct ModelSlot {
    path: PathBuf,
    threshold: f64,
    current: RwLock<Arc<Recognizer>>,
}

impl ModelSlot {
    /// Load the model at `path`. Fails with [`ModelError::ModelNotFound`] if
    /// no training has happened yet.
    pub fn open(path: impl Into<PathBuf>, threshold: f64) -> Result<Self, ModelError> {
        let path = path.into();
        let recognizer = Recognizer::load(&path, threshold)?;
        Ok(Self {
            path,
            threshold,
            current: RwLock::new(Arc::new(recognizer)),
        })
    }

    pub fn from_recognizer(path: impl Into<PathBuf>, recognizer: Recognizer) -> Self {
        Self {
            path: path.into(),
            threshold: recognizer.threshold(),
            current: RwLock::new(Arc::new(recognizer)),
        }
    }

    pub fn snapshot(&self) -> Arc<Recognizer> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Re-read the artifact and swap it in. On error the old model stays.
    pub fn reload(&self) -> Result<(), ModelError> {
        let fresh = Arc::new(Recognizer::load(&self.path, self.threshold)?);
        match self.current.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        tracing::info!(path = %self.path.display(), "recognition model reloaded");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::face::FACE_SIZE;
    use crate::lbph::{LbphClassifier, LbphParams};
    use crate::model::LabelMap;
    use chrono::Utc;
    use image::{GrayImage, Luma};

    fn face(seed: u32) -> NormalizedFace {
        NormalizedFace::from_image(GrayImage::from_fn(FACE_SIZE, FACE_SIZE, |x, y| {
            Luma([((x * x * seed + y * 7 * seed + x * y) % 251) as u8])
        }))
    }

    fn model(ids: &[(&str, u32)]) -> TrainedModel {
        let mut label_map = LabelMap::new();
        let faces: Vec<(u32, NormalizedFace)> =
            ids.iter().map(|(id, seed)| (label_map.assign(id), face(*seed))).collect();
        TrainedModel {
            classifier: LbphClassifier::train(
                LbphParams::default(),
                faces.iter().map(|(l, f)| (*l, f)),
            ),
            label_map,
            trained_at: Utc::now(),
        }
    }

    #[test]
    fn test_recognizes_training_face() {
        let r = Recognizer::new(model(&[("alice", 5), ("bob", 11)]), DEFAULT_THRESHOLD);
        match r.recognize(&face(5)) {
            Recognition::Known { user_id, confidence } => {
                assert_eq!(user_id, "alice");
                assert!(confidence < DEFAULT_THRESHOLD);
            }
            Recognition::Unknown => panic!("alice not recognized"),
        }
        assert_eq!(r.recognize(&face(11)).user_id(), Some("bob"));
    }

    #[test]
    fn test_threshold_boundary_is_unknown() {
        let r = Recognizer::new(model(&[("alice", 5)]), DEFAULT_THRESHOLD);
        let at = Prediction { label: 0, distance: 100.0 };
        assert_eq!(r.resolve(at), Recognition::Unknown);

        let below = Prediction { label: 0, distance: 99.999 };
        assert_eq!(
            r.resolve(below),
            Recognition::Known { user_id: "alice".into(), confidence: 99.999 }
        );

        let above = Prediction { label: 0, distance: 100.001 };
        assert_eq!(r.resolve(above), Recognition::Unknown);
    }

    #[test]
    fn test_nan_distance_is_unknown() {
        let r = Recognizer::new(model(&[("alice", 5)]), DEFAULT_THRESHOLD);
        assert_eq!(r.resolve(Prediction { label: 0, distance: f64::NAN }), Recognition::Unknown);
    }

    #[test]
    fn test_label_outside_map_is_unknown() {
        let r = Recognizer::new(model(&[("alice", 5)]), DEFAULT_THRESHOLD);
        assert_eq!(r.resolve(Prediction { label: 7, distance: 1.0 }), Recognition::Unknown);
    }

    #[test]
    fn test_threshold_equal_to_real_distance_rejects() {
        let query = face(6);
        let base = Recognizer::new(model(&[("alice", 5)]), f64::INFINITY);
        let distance = base.model().classifier.predict(&query).unwrap().distance;
        assert!(distance > 0.0);

        let exact = Recognizer::new(model(&[("alice", 5)]), distance);
        assert_eq!(exact.recognize(&query), Recognition::Unknown);
    }

    #[test]
    fn test_slot_reload_swaps_for_new_snapshots_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model(&[("alice", 5)]).save(&path).unwrap();

        let slot = ModelSlot::open(&path, DEFAULT_THRESHOLD).unwrap();
        let before = slot.snapshot();

        model(&[("bob", 5)]).save(&path).unwrap();
        slot.reload().unwrap();

        assert_eq!(before.recognize(&face(5)).user_id(), Some("alice"));
        assert_eq!(slot.snapshot().recognize(&face(5)).user_id(), Some("bob"));
    }

    #[test]
    fn test_slot_failed_reload_keeps_old_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        model(&[("alice", 5)]).save(&path).unwrap();
        let slot = ModelSlot::open(&path, DEFAULT_THRESHOLD).unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(slot.reload(), Err(ModelError::ModelNotFound(_))));
        assert_eq!(slot.snapshot().recognize(&face(5)).user_id(), Some("alice"));
    }

    #[test]
    fn test_slot_open_without_training_is_model_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelSlot::open(dir.path().join("model.json"), DEFAULT_THRESHOLD).err();
        assert!(matches!(err, Some(ModelError::ModelNotFound(_))));
    }
}
