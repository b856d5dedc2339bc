use ndarray::{s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::preprocess::FaceTensor;

/// Cells per side of the average-pooling grid
pub const FEATURE_GRID: usize = 16;

/// Average-pool each channel onto a `grid` x `grid` lattice, row-major, channels innermost
pub fn pooled_features(tensor: &FaceTensor, grid: usize) -> Array1<f32> {
    let (h, w, channels) = tensor.data.dim();
    let mut out = Array1::<f32>::zeros(grid * grid * channels);
    if h == 0 || w == 0 {
        return out;
    }

    for gy in 0..grid {
        let y0 = gy * h / grid;
        let y1 = ((gy + 1) * h / grid).max(y0 + 1).min(h);
        for gx in 0..grid {
            let x0 = gx * w / grid;
            let x1 = ((gx + 1) * w / grid).max(x0 + 1).min(w);
            let cell = tensor.data.slice(s![y0..y1, x0..x1, ..]);
            let count = ((y1 - y0) * (x1 - x0)) as f32;
            for c in 0..channels {
                let sum: f32 = cell.index_axis(Axis(2), c).sum();
                out[(gy * grid + gx) * channels + c] = sum / count;
            }
        }
    }
    out
}

/// Per-feature mean/std fitted on training inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    pub mean: Array1<f32>,
    pub std: Array1<f32>,
}

impl Standardizer {
    /// Floor in pixel-intensity units; near-constant cells are not amplified
    const MIN_STD: f32 = 0.05;

    /// Fit on rows of `features`; an empty matrix yields an identity transform
    pub fn fit(features: &Array2<f32>) -> Self {
        let dim = features.ncols();
        if features.nrows() == 0 {
            return Self {
                mean: Array1::zeros(dim),
                std: Array1::ones(dim),
            };
        }
        let mean = features.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(dim));
        let std = features
            .std_axis(Axis(0), 0.0)
            .mapv(|v| v.max(Self::MIN_STD));
        Self { mean, std }
    }

    pub fn transform(&self, features: &Array1<f32>) -> Array1<f32> {
        (features - &self.mean) / &self.std
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }
}

/// Stack feature rows into a matrix
pub fn stack_rows(rows: &[Array1<f32>], dim: usize) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((rows.len(), dim));
    for (mut dst, row) in out.outer_iter_mut().zip(rows) {
        dst.assign(row);
    }
    out
}
