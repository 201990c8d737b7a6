// src/pca.rs

//! Two-component PCA by power iteration on the sample Gram matrix.
//!
//! Used to visualize the sample structure before and after batch correction.
//! The Gram matrix `G = X·Xᵗ` of the column-centered sample×feature matrix is
//! used directly (no division by degrees of freedom), so that
//! `eigenvector · sqrt(eigenvalue)` gives the usual PCA sample scores.

use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::linalg::{multiply, transpose};
use crate::quant::SampleAnnotation;

/// Parameters of the power-iteration solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PowerIterationConfig {
    /// Fixed number of matrix-vector products per component.
    pub iterations: usize,
    /// Seed for the start vector, so repeated runs give identical scores.
    pub seed: u64,
    /// Vectors with a norm below this are left unnormalized.
    pub norm_floor: f64,
}

impl Default for PowerIterationConfig {
    fn default() -> Self {
        PowerIterationConfig {
            iterations: 100,
            seed: 42,
            norm_floor: 1e-10,
        }
    }
}

/// A sample projected onto the first two principal components.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaPoint {
    pub pc1: f64,
    pub pc2: f64,
    pub sample_id: u64,
    pub batch: String,
    pub display_name: String,
}

/// Scores and explained variance for one matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PcaResult {
    /// One point per sample, in input column order.
    pub points: Vec<PcaPoint>,
    /// Percent of total variance explained by PC1 and PC2, each in [0, 100].
    pub variance_explained: [f64; 2],
    /// Eigenvalues of the Gram matrix for PC1 and PC2.
    pub eigenvalues: [f64; 2],
    /// Set when the data had no usable variance, or a component collapsed
    /// to a near-zero vector. Scores are not meaningful in that case.
    pub degenerate: bool,
}

impl PcaResult {
    pub fn variance_explained_pc1(&self) -> f64 {
        self.variance_explained[0]
    }

    pub fn variance_explained_pc2(&self) -> f64 {
        self.variance_explained[1]
    }
}

/// Dominant eigenpair from power iteration.
#[derive(Clone, Debug)]
struct EigenPair {
    value: f64,
    vector: Array1<f64>,
    collapsed: bool,
}

/// Approximates the top two principal components of a feature×sample matrix.
#[derive(Clone, Debug, Default)]
pub struct PowerIterationPca {
    config: PowerIterationConfig,
}

impl PowerIterationPca {
    pub fn new(config: PowerIterationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PowerIterationConfig {
        &self.config
    }

    /// Projects every sample (column of `data`) onto PC1 and PC2.
    ///
    /// * `data` - feature×sample matrix, shape (n_features, n_samples).
    /// * `samples` - annotation for each column, in column order.
    ///
    /// # Panics
    /// Panics if `samples.len() != data.ncols()`.
    pub fn compute(&self, data: &ArrayView2<f64>, samples: &[SampleAnnotation]) -> PcaResult {
        assert_eq!(
            samples.len(),
            data.ncols(),
            "one annotation per sample column is required"
        );
        let n_samples = data.ncols();

        // Sample×feature, each feature centered across samples
        let mut centered = transpose(data);
        if let Some(feature_means) = centered.mean_axis(Axis(0)) {
            centered -= &feature_means;
        }

        let gram = multiply(&centered.view(), &transpose(&centered.view()).view());
        let total_variance: f64 = gram.diag().sum();

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let first = self.dominant_eigenpair(&gram, &mut rng);

        let mut deflated = gram;
        for i in 0..n_samples {
            for j in 0..n_samples {
                deflated[[i, j]] -= first.value * first.vector[i] * first.vector[j];
            }
        }
        let second = self.dominant_eigenpair(&deflated, &mut rng);

        let variance_explained = [
            percent_of_total(first.value, total_variance),
            percent_of_total(second.value, total_variance),
        ];
        let degenerate = total_variance <= 0.0 || first.collapsed || second.collapsed;
        if degenerate {
            warn!(
                "PCA input is degenerate (total variance {:e}); scores should not be trusted.",
                total_variance
            );
        }
        debug!(
            "PCA eigenvalues: {:.6e}, {:.6e}; explained {:.2}% / {:.2}%",
            first.value, second.value, variance_explained[0], variance_explained[1]
        );

        let scale1 = first.value.abs().sqrt();
        let scale2 = second.value.abs().sqrt();
        let points = samples
            .iter()
            .enumerate()
            .map(|(i, sample)| PcaPoint {
                pc1: first.vector[i] * scale1,
                pc2: second.vector[i] * scale2,
                sample_id: sample.sample_id,
                batch: sample.batch.clone(),
                display_name: sample.display_name.clone(),
            })
            .collect();

        PcaResult {
            points,
            variance_explained,
            eigenvalues: [first.value, second.value],
            degenerate,
        }
    }

    fn dominant_eigenpair(&self, matrix: &Array2<f64>, rng: &mut ChaCha8Rng) -> EigenPair {
        let n = matrix.nrows();
        let start: Array1<f64> = (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
        let (mut vector, mut collapsed) = self.normalize(start);

        for _ in 0..self.config.iterations {
            let next = matrix.dot(&vector);
            let (normalized, floor_hit) = self.normalize(next);
            vector = normalized;
            collapsed = floor_hit;
        }

        // Rayleigh quotient vᵗGv
        let value = vector.dot(&matrix.dot(&vector));
        EigenPair {
            value,
            vector,
            collapsed,
        }
    }

    /// Scales `v` to unit length unless its norm is below the floor, in which
    /// case it is returned unchanged and flagged.
    fn normalize(&self, mut v: Array1<f64>) -> (Array1<f64>, bool) {
        let norm = v.dot(&v).sqrt();
        if norm < self.config.norm_floor {
            return (v, true);
        }
        v.mapv_inplace(|x| x / norm);
        (v, false)
    }
}

fn percent_of_total(eigenvalue: f64, total_variance: f64) -> f64 {
    if total_variance <= 0.0 || !total_variance.is_finite() {
        return 0.0;
    }
    (100.0 * eigenvalue / total_variance).clamp(0.0, 100.0)
}
