use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Length of the shorter side.
    pub fn min_side(&self) -> f32 {
        self.width.min(self.height)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with `other`; 0.0 for disjoint or empty boxes.
    pub fn overlap(&self, other: &BoundingBox) -> f32 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        let shared = w.max(0.0) * h.max(0.0);
        let union = self.area() + other.area() - shared;
        if union > 0.0 {
            shared / union
        } else {
            0.0
        }
    }
}

/// Detection tuning for one call site.
///
/// Training and enrollment use [`DetectParams::LENIENT`] to maximize recall on
/// the single canonical portrait; live recognition uses
/// [`DetectParams::STRICT`] to keep false detections out of the ledger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectParams {
    /// Smallest accepted face side, in pixels.
    pub min_face_size: f32,
    /// Minimum detector score for a candidate to survive.
    pub min_confidence: f32,
}

impl DetectParams {
    pub const LENIENT: Self = Self {
        min_face_size: 30.0,
        min_confidence: 0.3,
    };

    pub const STRICT: Self = Self {
        min_face_size: 60.0,
        min_confidence: 0.5,
    };
}

impl Default for DetectParams {
    fn default() -> Self {
        Self::STRICT
    }
}

/// Face embedding vector stored alongside an enrolled user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Descriptor that produced this embedding (e.g., "lbph-r1-n8-g8x8").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Little-endian `f32` encoding used for BLOB storage.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a BLOB written by [`to_bytes`](Self::to_bytes).
    ///
    /// Returns `None` if the length is not a multiple of four.
    pub fn from_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            values,
            model_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_accepts_more_than_strict() {
        let lenient = DetectParams::LENIENT;
        let strict = DetectParams::STRICT;
        assert!(lenient.min_face_size < strict.min_face_size);
        assert!(lenient.min_confidence < strict.min_confidence);
    }

    #[test]
    fn test_embedding_bytes_preserve_values() {
        let e = Embedding {
            values: vec![0.0, 1.5, -2.25, f32::MIN_POSITIVE],
            model_version: Some("lbph".into()),
        };
        let decoded = Embedding::from_bytes(&e.to_bytes(), e.model_version.clone()).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn test_embedding_rejects_truncated_blob() {
        assert!(Embedding::from_bytes(&[0, 0, 0], None).is_none());
    }

    #[test]
    fn test_overlap() {
        let square = |x: f32| BoundingBox { x, y: 0.0, width: 10.0, height: 10.0, confidence: 1.0 };
        assert!((square(0.0).overlap(&square(0.0)) - 1.0).abs() < 1e-6);
        // Half-shifted squares share a third of their union.
        assert!((square(0.0).overlap(&square(5.0)) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(square(0.0).overlap(&square(20.0)), 0.0);
    }

    #[test]
    fn test_min_side() {
        let b = BoundingBox { x: 0.0, y: 0.0, width: 40.0, height: 70.0, confidence: 0.9 };
        assert_eq!(b.min_side(), 40.0);
    }
}
