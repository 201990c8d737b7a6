// src/diagnostics.rs

use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

use crate::linalg::multiply;

/// Empirical-Bayes hyperpriors and solver outcome for one batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPriorDiagnostics {
    pub batch: String,
    pub samples: usize,
    /// Cross-feature mean of the location estimates.
    pub gamma_bar: f64,
    /// Cross-feature variance of the location estimates.
    pub tau_squared: f64,
    /// Inverse-gamma shape; `None` for the location-only model.
    pub a_prior: Option<f64>,
    /// Inverse-gamma scale; `None` for the location-only model.
    pub b_prior: Option<f64>,
    /// Joint solver iterations (0 when no iteration was needed).
    pub iterations: usize,
    pub converged: bool,
}

/// Numerical summary of a ComBat fit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub batches: Vec<BatchPriorDiagnostics>,
    /// Largest entry of `|(XᵗX)(XᵗX)⁻¹ - I|` for the batch design `X`.
    pub inverse_residual: f64,
}

impl FitDiagnostics {
    /// Most iterations any batch needed.
    pub fn max_iterations(&self) -> usize {
        self.batches.iter().map(|b| b.iterations).max().unwrap_or(0)
    }

    pub fn all_converged(&self) -> bool {
        self.batches.iter().all(|b| b.converged)
    }
}

/// Max-abs deviation of `matrix · inverse` from the identity.
pub fn inverse_residual(matrix: &ArrayView2<f64>, inverse: &ArrayView2<f64>) -> f64 {
    let product = multiply(matrix, inverse);
    product
        .indexed_iter()
        .map(|((i, j), &v)| if i == j { (v - 1.0).abs() } else { v.abs() })
        .fold(0.0, f64::max)
}
