//! Enrolled users and their canonical face images.

use crate::storage::{Storage, StoreError};
use chrono::{DateTime, SecondsFormat, Utc};
use image::{GrayImage, ImageFormat};
use presence_core::lbph::{spatial_histogram, LbphParams};
use presence_core::{
    normalize_face, DetectParams, DetectorError, EnrolledFaces, Embedding, FaceDetect, FaceError,
};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected in the enrollment image")]
    NoFaceDetected,
    #[error("invalid user id {0:?}: use letters, digits, '-', '_' or '.'")]
    InvalidUserId(String),
    #[error("display name must not be empty")]
    EmptyName,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("face: {0}")]
    Face(#[from] FaceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An enrolled identity.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub image_path: PathBuf,
    #[serde(skip)]
    pub embedding: Embedding,
    pub registered_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

const USER_COLUMNS: &str =
    "user_id, name, image_path, embedding, embedding_model, registered_at, last_updated";

struct UserRow {
    user_id: String,
    name: String,
    image_path: String,
    embedding: Vec<u8>,
    embedding_model: Option<String>,
    registered_at: String,
    last_updated: String,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            user_id: row.get(0)?,
            name: row.get(1)?,
            image_path: row.get(2)?,
            embedding: row.get(3)?,
            embedding_model: row.get(4)?,
            registered_at: row.get(5)?,
            last_updated: row.get(6)?,
        })
    }

    fn into_user(self) -> Result<User, StoreError> {
        let embedding = Embedding::from_bytes(&self.embedding, self.embedding_model).ok_or_else(
            || StoreError::Corrupt(format!("embedding of {} is not f32-aligned", self.user_id)),
        )?;
        Ok(User {
            registered_at: parse_utc(&self.registered_at)?,
            last_updated: parse_utc(&self.last_updated)?,
            image_path: PathBuf::from(self.image_path),
            embedding,
            name: self.name,
            user_id: self.user_id,
        })
    }
}

fn parse_utc(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

/// Fixed-width UTC stamp, so text order matches time order.
fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.len() <= 128
        && !user_id.starts_with('.')
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Sole writer of the users table and the enrollment image directory.
#[derive(Clone)]
pub struct IdentityStore {
    storage: Storage,
    image_dir: PathBuf,
}

impl IdentityStore {
    pub fn new(storage: Storage, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            image_dir: image_dir.into(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// Register `user_id` (or replace an existing enrollment) from `image`.
    ///
    /// The image must contain a face under [`DetectParams::LENIENT`]; when it
    /// holds several, the detector's first region is used. Nothing is written
    /// unless every step succeeds. Re-enrolling keeps `registered_at`.
    pub fn enroll<D>(
        &self,
        user_id: &str,
        name: &str,
        image: &GrayImage,
        detector: &mut D,
    ) -> Result<User, EnrollError>
    where
        D: FaceDetect + ?Sized,
    {
        if !valid_user_id(user_id) {
            return Err(EnrollError::InvalidUserId(user_id.to_string()));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(EnrollError::EmptyName);
        }

        let regions = detector.detect(image, &DetectParams::LENIENT)?;
        let Some(region) = regions.first() else {
            tracing::info!(user_id, "enrollment rejected: no face detected");
            return Err(EnrollError::NoFaceDetected);
        };
        if regions.len() > 1 {
            tracing::debug!(user_id, faces = regions.len(), "several faces; enrolling the first");
        }

        let face = normalize_face(image, region)?;
        let params = LbphParams::default();
        let embedding = Embedding {
            values: spatial_histogram(face.image(), &params),
            model_version: Some(params.descriptor()),
        };

        let mut encoded = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
            .map_err(|source| StoreError::Image {
                path: self.image_dir.clone(),
                source,
            })?;

        std::fs::create_dir_all(&self.image_dir)
            .map_err(|e| StoreError::io(&self.image_dir, e))?;
        let version = uuid::Uuid::new_v4().simple();
        let image_path = self.image_dir.join(format!("{user_id}.{version}.png"));
        let tmp_path = self.image_dir.join(format!(".{user_id}.{version}.tmp"));

        let result = write_synced(&tmp_path, &encoded)
            .and_then(|()| {
                std::fs::rename(&tmp_path, &image_path).map_err(|e| StoreError::io(&image_path, e))
            })
            .and_then(|()| self.commit_enrollment(user_id, name, &embedding, &image_path));
        let previous = match result {
            Ok(previous) => previous,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                let _ = std::fs::remove_file(&image_path);
                return Err(e.into());
            }
        };

        if let Some(old) = previous.filter(|old| *old != image_path) {
            if let Err(e) = std::fs::remove_file(&old) {
                tracing::warn!(user_id, path = %old.display(), error = %e, "stale enrollment image not removed");
            }
        }

        tracing::info!(user_id, name, "user enrolled");
        self.get(user_id)?
            .ok_or_else(|| EnrollError::Store(StoreError::UserNotFound(user_id.to_string())))
    }

    /// Upsert the row pointing at `image_path` and return the image path it
    /// replaced, if any. The new image file must already be in place.
    fn commit_enrollment(
        &self,
        user_id: &str,
        name: &str,
        embedding: &Embedding,
        image_path: &Path,
    ) -> Result<Option<PathBuf>, StoreError> {
        let now = timestamp_now();
        self.storage.with_conn(|conn| {
            let tx = conn.transaction()?;
            let previous: Option<String> = tx
                .query_row(
                    "SELECT image_path FROM users WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            tx.execute(
                "INSERT INTO users (user_id, name, image_path, embedding, embedding_model, registered_at, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                   name = excluded.name,
                   image_path = excluded.image_path,
                   embedding = excluded.embedding,
                   embedding_model = excluded.embedding_model,
                   last_updated = excluded.last_updated",
                params![
                    user_id,
                    name,
                    image_path.to_string_lossy().into_owned(),
                    embedding.to_bytes(),
                    embedding.model_version,
                    now,
                ],
            )?;
            tx.commit()?;
            Ok(previous.map(PathBuf::from))
        })
    }

    pub fn get(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let row = self.storage.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE user_id = ?1"),
                params![user_id],
                UserRow::from_row,
            )
            .optional()
        })?;
        row.map(UserRow::into_user).transpose()
    }

    pub fn exists(&self, user_id: &str) -> Result<bool, StoreError> {
        let found = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM users WHERE user_id = ?1",
                params![user_id],
                |_| Ok(()),
            )
            .optional()
        })?;
        Ok(found.is_some())
    }

    /// Every user, most recently registered first.
    pub fn list_all(&self) -> Result<Vec<User>, StoreError> {
        self.query_users(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY registered_at DESC, user_id ASC"
        ))?
        .into_iter()
        .map(UserRow::into_user)
        .collect()
    }

    pub fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = self
            .storage
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    /// Change a user's display name. Returns whether a user was updated.
    pub fn rename(&self, user_id: &str, name: &str) -> Result<bool, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(false);
        }
        let changed = self.storage.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET name = ?2, last_updated = ?3 WHERE user_id = ?1",
                params![user_id, name, timestamp_now()],
            )
        })?;
        if changed > 0 {
            tracing::info!(user_id, name, "user renamed");
        }
        Ok(changed > 0)
    }

    pub fn image_path(&self, user_id: &str) -> Result<Option<PathBuf>, StoreError> {
        let path: Option<String> = self.storage.with_conn(|conn| {
            conn.query_row(
                "SELECT image_path FROM users WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(path.map(PathBuf::from))
    }

    /// Decode a user's stored enrollment image to grayscale.
    pub fn load_face_image(&self, user_id: &str) -> Result<GrayImage, StoreError> {
        let path = self
            .image_path(user_id)?
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;
        let image = image::open(&path).map_err(|source| StoreError::Image {
            path: path.clone(),
            source,
        })?;
        Ok(image.to_luma8())
    }

    fn query_users(&self, sql: &str) -> Result<Vec<UserRow>, StoreError> {
        let rows = self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], UserRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        Ok(rows)
    }
}

impl EnrolledFaces for IdentityStore {
    type Error = StoreError;

    /// Oldest enrollment first, so labels stay stable as users are added.
    fn enrolled_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids = self.storage.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM users ORDER BY registered_at ASC, user_id ASC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
        })?;
        Ok(ids)
    }

    fn face_image(&self, user_id: &str) -> Result<GrayImage, StoreError> {
        self.load_face_image(user_id)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = File::create(path).map_err(|e| StoreError::io(path, e))?;
    file.write_all(bytes).map_err(|e| StoreError::io(path, e))?;
    file.sync_all().map_err(|e| StoreError::io(path, e))?;
    Ok(())
}
