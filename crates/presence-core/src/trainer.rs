//! Offline model training from the enrolled faces.

use crate::detector::{DetectorError, FaceDetect};
use crate::face::{normalize_face, NormalizedFace};
use crate::lbph::{LbphClassifier, LbphParams};
use crate::model::{LabelMap, ModelError, TrainedModel};
use crate::types::DetectParams;
use chrono::Utc;
use image::GrayImage;
use std::path::Path;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no enrolled user yielded a detectable face; enroll users first")]
    NoTrainableFaces,
    #[error("identity store: {0}")]
    Store(#[source] BoxError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("model: {0}")]
    Model(#[from] ModelError),
}

/// Read access to the enrolled users' canonical face images.
pub trait EnrolledFaces {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Enrolled user ids in the store's enumeration order.
    fn enrolled_ids(&self) -> Result<Vec<String>, Self::Error>;

    /// Canonical face image of one user, decoded to grayscale.
    fn face_image(&self, user_id: &str) -> Result<GrayImage, Self::Error>;
}

/// Summary of a successful training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub trained: usize,
    /// Users whose image was unreadable or had no detectable face.
    pub skipped: Vec<String>,
}

/// Build a fresh model from every enrolled user.
///
/// Users are visited in the store's order; each one whose image yields a face
/// under [`DetectParams::LENIENT`] gets the next sequential label. The first
/// detected region is used when an image holds several faces.
pub fn train<S, D>(store: &S, detector: &mut D) -> Result<(TrainedModel, TrainReport), TrainError>
where
    S: EnrolledFaces,
    D: FaceDetect + ?Sized,
{
    let ids = store
        .enrolled_ids()
        .map_err(|e| TrainError::Store(Box::new(e)))?;

    let mut label_map = LabelMap::new();
    let mut faces: Vec<(u32, NormalizedFace)> = Vec::with_capacity(ids.len());
    let mut skipped = Vec::new();

    for user_id in ids {
        let image = match store.face_image(&user_id) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "skipping user: face image unavailable");
                skipped.push(user_id);
                continue;
            }
        };

        let regions = detector.detect(&image, &DetectParams::LENIENT)?;
        let Some(region) = regions.first() else {
            tracing::warn!(user_id, "skipping user: no face detected in enrollment image");
            skipped.push(user_id);
            continue;
        };

        match normalize_face(&image, region) {
            Ok(face) => {
                let label = label_map.assign(&user_id);
                tracing::debug!(user_id, label, "training sample prepared");
                faces.push((label, face));
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "skipping user: face region unusable");
                skipped.push(user_id);
            }
        }
    }

    if faces.is_empty() {
        return Err(TrainError::NoTrainableFaces);
    }

    let classifier =
        LbphClassifier::train(LbphParams::default(), faces.iter().map(|(l, f)| (*l, f)));
    let report = TrainReport {
        trained: label_map.len(),
        skipped,
    };

    tracing::info!(
        trained = report.trained,
        skipped = report.skipped.len(),
        "training complete"
    );

    Ok((
        TrainedModel {
            classifier,
            label_map,
            trained_at: Utc::now(),
        },
        report,
    ))
}

/// Train and atomically replace the artifact at `path`.
///
/// Nothing is written unless training succeeds, so a failed run leaves the
/// previously persisted model untouched.
pub fn train_and_save<S, D>(
    store: &S,
    detector: &mut D,
    path: &Path,
) -> Result<TrainReport, TrainError>
where
    S: EnrolledFaces,
    D: FaceDetect + ?Sized,
{
    let (model, report) = train(store, detector)?;
    model.save(path)?;
    Ok(report)
}
