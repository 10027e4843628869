//! Local Binary Patterns Histograms face classifier.
//!
//! Each normalized face is described by a grid of per-cell LBP histograms.
//! Prediction is nearest-neighbour over the training samples using the
//! chi-square distance, so an exact copy of a training face scores 0 and
//! scores grow as faces diverge (lower is better).

use crate::face::NormalizedFace;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// Operator and grid parameters. Training and prediction must agree on them,
/// so they travel inside the persisted model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: u32,
    pub neighbors: u32,
    pub grid_x: u32,
    pub grid_y: u32,
}

impl Default for LbphParams {
    fn default() -> Self {
        Self {
            radius: 1,
            neighbors: 8,
            grid_x: 8,
            grid_y: 8,
        }
    }
}

impl LbphParams {
    pub fn bins(&self) -> usize {
        1usize << self.neighbors
    }

    /// Length of a spatial histogram produced with these parameters.
    pub fn histogram_len(&self) -> usize {
        (self.grid_x * self.grid_y) as usize * self.bins()
    }

    /// Short descriptor used as an embedding's `model_version`.
    pub fn descriptor(&self) -> String {
        format!(
            "lbph-r{}-n{}-g{}x{}",
            self.radius, self.neighbors, self.grid_x, self.grid_y
        )
    }
}

/// Closest training sample for a query face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: u32,
    /// Chi-square distance to the closest sample. Lower is better.
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub label: u32,
    pub histogram: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LbphClassifier {
    params: LbphParams,
    samples: Vec<Sample>,
}

impl LbphClassifier {
    pub fn train<'a, I>(params: LbphParams, faces: I) -> Self
    where
        I: IntoIterator<Item = (u32, &'a NormalizedFace)>,
    {
        let samples = faces
            .into_iter()
            .map(|(label, face)| Sample {
                label,
                histogram: spatial_histogram(face.image(), &params),
            })
            .collect();
        Self { params, samples }
    }

    pub fn params(&self) -> &LbphParams {
        &self.params
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Spatial histogram of a face under this classifier's parameters.
    pub fn describe(&self, face: &NormalizedFace) -> Vec<f32> {
        spatial_histogram(face.image(), &self.params)
    }

    /// Nearest training sample, or `None` for an empty classifier.
    pub fn predict(&self, face: &NormalizedFace) -> Option<Prediction> {
        let query = self.describe(face);
        let mut best: Option<Prediction> = None;

        for sample in &self.samples {
            let distance = chi_square(&sample.histogram, &query);
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Prediction {
                    label: sample.label,
                    distance,
                });
            }
        }

        best
    }
}

/// Chi-square histogram distance: Σ 2(a−b)²/(a+b), skipping empty bins.
pub fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            let sum = x + y;
            if sum > 0.0 {
                2.0 * (x - y) * (x - y) / sum
            } else {
                0.0
            }
        })
        .sum()
}

/// Circular LBP codes with bilinear sampling.
///
/// The output is `(w - 2r) x (h - 2r)`; border pixels without a full
/// neighbourhood are dropped.
fn lbp_codes(image: &GrayImage, radius: u32, neighbors: u32) -> (Vec<u32>, usize, usize) {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let r = radius as usize;
    if w <= 2 * r || h <= 2 * r {
        return (Vec::new(), 0, 0);
    }
    let out_w = w - 2 * r;
    let out_h = h - 2 * r;
    let px = |x: usize, y: usize| image.as_raw()[y * w + x] as f32;

    let mut codes = vec![0u32; out_w * out_h];

    for n in 0..neighbors {
        let angle = 2.0 * PI * n as f32 / neighbors as f32;
        let sx = radius as f32 * angle.cos();
        let sy = -(radius as f32 * angle.sin());

        let fx = sx.floor();
        let fy = sy.floor();
        let tx = sx - fx;
        let ty = sy - fy;
        let w1 = (1.0 - tx) * (1.0 - ty);
        let w2 = tx * (1.0 - ty);
        let w3 = (1.0 - tx) * ty;
        let w4 = tx * ty;
        let (fx, fy) = (fx as isize, fy as isize);

        for y in r..h - r {
            for x in r..w - r {
                let at = |dx: isize, dy: isize| {
                    let xx = (x as isize + dx).clamp(0, w as isize - 1) as usize;
                    let yy = (y as isize + dy).clamp(0, h as isize - 1) as usize;
                    px(xx, yy)
                };
                let sample = w1 * at(fx, fy)
                    + w2 * at(fx + 1, fy)
                    + w3 * at(fx, fy + 1)
                    + w4 * at(fx + 1, fy + 1);
                // Tolerance keeps flat regions stable against interpolation noise.
                if sample - px(x, y) >= -1e-3 {
                    codes[(y - r) * out_w + (x - r)] |= 1 << n;
                }
            }
        }
    }

    (codes, out_w, out_h)
}

/// Concatenated per-cell LBP histograms, each cell normalized to sum 1.
pub fn spatial_histogram(image: &GrayImage, params: &LbphParams) -> Vec<f32> {
    let bins = params.bins();
    let mut hist = vec![0.0f32; params.histogram_len()];
    let (codes, w, h) = lbp_codes(image, params.radius, params.neighbors);

    let gx = params.grid_x as usize;
    let gy = params.grid_y as usize;
    let cell_w = w / gx.max(1);
    let cell_h = h / gy.max(1);
    if cell_w == 0 || cell_h == 0 {
        return hist;
    }

    for row in 0..gy {
        for col in 0..gx {
            let cell = &mut hist[(row * gx + col) * bins..(row * gx + col + 1) * bins];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    cell[codes[y * w + x] as usize] += 1.0;
                }
            }
            let total = (cell_w * cell_h) as f32;
            for v in cell.iter_mut() {
                *v /= total;
            }
        }
    }

    hist
}
