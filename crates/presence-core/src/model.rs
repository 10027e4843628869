//! Trained model artifact: LBPH classifier plus its label map.
//!
//! Both halves live in one JSON document that is replaced with a
//! write-temp-then-rename, so a reader can never pair a classifier with a
//! label map from a different training run.

use crate::lbph::LbphClassifier;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MODEL_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("no trained model at {0}; run training first")]
    ModelNotFound(PathBuf),
    #[error("model artifact {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Bijection between classifier labels `0..N` and user ids.
///
/// The label of a user is its index in the id list, so label lookup is a
/// slice index and user lookup is a hash lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
    by_label: Vec<String>,
    by_user: HashMap<String, u32>,
}

impl LabelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label for `user_id`, assigning the next sequential label on first sight.
    pub fn assign(&mut self, user_id: &str) -> u32 {
        if let Some(&label) = self.by_user.get(user_id) {
            return label;
        }
        let label = self.by_label.len() as u32;
        self.by_label.push(user_id.to_string());
        self.by_user.insert(user_id.to_string(), label);
        label
    }

    pub fn user_id(&self, label: u32) -> Option<&str> {
        self.by_label.get(label as usize).map(String::as_str)
    }

    pub fn label(&self, user_id: &str) -> Option<u32> {
        self.by_user.get(user_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_label.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_label.is_empty()
    }

    /// User ids in label order.
    pub fn user_ids(&self) -> &[String] {
        &self.by_label
    }

    /// Rebuild from a label-ordered id list, rejecting duplicates.
    fn from_ids(ids: Vec<String>) -> Result<Self, String> {
        let mut by_user = HashMap::with_capacity(ids.len());
        for (label, id) in ids.iter().enumerate() {
            if by_user.insert(id.clone(), label as u32).is_some() {
                return Err(format!("user id {id:?} appears under two labels"));
            }
        }
        Ok(Self {
            by_label: ids,
            by_user,
        })
    }
}

/// A classifier and the label map it was trained with.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub classifier: LbphClassifier,
    pub label_map: LabelMap,
    pub trained_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct ModelFile {
    format_version: u32,
    trained_at: DateTime<Utc>,
    /// User ids indexed by label.
    labels: Vec<String>,
    classifier: LbphClassifier,
}

impl TrainedModel {
    /// Atomically replace the artifact at `path`.
    ///
    /// The document is written to a uniquely named sibling, flushed to disk,
    /// then renamed over `path`. On failure the temp file is removed and the
    /// previous artifact is left as it was.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let io_err = |p: &Path| {
            let p = p.to_path_buf();
            move |source: std::io::Error| ModelError::Io { path: p, source }
        };

        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        if let Some(dir) = dir {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let doc = ModelFile {
            format_version: MODEL_FORMAT_VERSION,
            trained_at: self.trained_at,
            labels: self.label_map.user_ids().to_vec(),
            classifier: self.classifier.clone(),
        };

        let result = (|| -> Result<(), ModelError> {
            let file = File::create(&tmp).map_err(io_err(&tmp))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &doc)?;
            writer.flush().map_err(io_err(&tmp))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(io_err(&tmp))?;
            fs::rename(&tmp, path).map_err(io_err(path))
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result?;

        tracing::info!(
            path = %path.display(),
            users = self.label_map.len(),
            samples = self.classifier.samples().len(),
            "model artifact written"
        );
        Ok(())
    }

    /// Load and validate the artifact at `path`.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ModelError::ModelNotFound(path.to_path_buf()))
            }
            Err(source) => {
                return Err(ModelError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let corrupt = |reason: String| ModelError::Corrupt {
            path: path.to_path_buf(),
            reason,
        };

        let doc: ModelFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| corrupt(e.to_string()))?;

        if doc.format_version != MODEL_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported format version {}",
                doc.format_version
            )));
        }

        let label_map = LabelMap::from_ids(doc.labels).map_err(corrupt)?;
        let expected_len = doc.classifier.params().histogram_len();
        let mut trained = vec![false; label_map.len()];
        for sample in doc.classifier.samples() {
            match trained.get_mut(sample.label as usize) {
                Some(seen) => *seen = true,
                None => return Err(corrupt(format!("sample label {} has no user", sample.label))),
            }
            if sample.histogram.len() != expected_len {
                return Err(corrupt(format!(
                    "sample histogram has {} bins, expected {expected_len}",
                    sample.histogram.len()
                )));
            }
        }
        if let Some(label) = trained.iter().position(|seen| !seen) {
            return Err(corrupt(format!(
                "user {:?} has no training sample",
                label_map.user_id(label as u32).unwrap_or_default()
            )));
        }

        Ok(Self {
            classifier: doc.classifier,
            label_map,
            trained_at: doc.trained_at,
        })
    }
}
