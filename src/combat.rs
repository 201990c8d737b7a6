// src/combat.rs

//! ComBat batch-effect correction (one batch factor, no covariates).
//!
//! The data are standardized per feature, batch location (`gamma`) and scale
//! (`delta`) shifts are estimated per feature, and the estimates are shrunk
//! toward batch-level priors fitted across all features (parametric empirical
//! Bayes). The shrunk parameters are stored as a [`ComBatModel`], which can be
//! re-applied to new samples of already-seen batches without re-estimation.
//!
//! ## Variance conventions
//! The pooled variance used for standardization divides squared residuals by
//! the number of samples (population variance), while the per-batch scale
//! estimate `deltaHat` uses the `n - 1` sample variance. Both conventions match
//! the reference ComBat estimator and downstream results depend on them.

use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::diagnostics::{inverse_residual, BatchPriorDiagnostics, FitDiagnostics};
use crate::error::{CorrectionError, Result};
use crate::linalg::{invert, multiply, transpose};
use crate::quant::{batch_levels, ZERO_VARIANCE_THRESHOLD};

/// Which batch parameters are corrected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    /// Location only ("L"): removes the per-batch mean shift.
    #[serde(rename = "L")]
    Location,
    /// Location and scale ("L/S"): also removes per-batch variance scaling.
    #[serde(rename = "L/S")]
    LocationScale,
}

impl ModelType {
    pub fn mean_only(self) -> bool {
        matches!(self, ModelType::Location)
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::Location => write!(f, "L"),
            ModelType::LocationScale => write!(f, "L/S"),
        }
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "L" => Ok(ModelType::Location),
            "L/S" | "LS" => Ok(ModelType::LocationScale),
            other => Err(format!("Unknown model type '{}'; expected 'L' or 'L/S'.", other)),
        }
    }
}

/// Parameters of a ComBat fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComBatConfig {
    pub model_type: ModelType,
    /// Batch left untouched; all other batches are adjusted toward it.
    pub reference_batch: Option<String>,
    /// The joint empirical-Bayes solver stops once the largest relative
    /// parameter change drops to this value.
    pub convergence_tolerance: f64,
    /// Safety cap on solver iterations. Hitting it is logged as a warning.
    pub max_iterations: usize,
}

impl Default for ComBatConfig {
    fn default() -> Self {
        ComBatConfig {
            model_type: ModelType::LocationScale,
            reference_batch: None,
            convergence_tolerance: 1e-4,
            max_iterations: 5000,
        }
    }
}

/// Fitted ComBat parameters.
///
/// Shapes: `location` and `scale` have one entry per feature; `gamma_star` and
/// `delta_star` are (n_batches, n_features) with rows in `batch_levels` order.
/// `scale` holds the pooled variance (not the standard deviation).
#[derive(Clone, Debug, PartialEq)]
pub struct ComBatModel {
    location: Array1<f64>,
    scale: Array1<f64>,
    gamma_star: Array2<f64>,
    delta_star: Array2<f64>,
    batch_levels: Vec<String>,
}

impl Default for ComBatModel {
    fn default() -> Self {
        Self::empty()
    }
}

impl ComBatModel {
    /// A model with no batches and no features. Applying it fails with `EmptyModel`.
    pub fn empty() -> Self {
        Self {
            location: Array1::zeros(0),
            scale: Array1::zeros(0),
            gamma_star: Array2::zeros((0, 0)),
            delta_star: Array2::zeros((0, 0)),
            batch_levels: Vec::new(),
        }
    }

    /// Assembles a model from parts whose shapes have already been checked.
    pub(crate) fn from_parts(
        location: Array1<f64>,
        scale: Array1<f64>,
        gamma_star: Array2<f64>,
        delta_star: Array2<f64>,
        batch_levels: Vec<String>,
    ) -> Self {
        Self {
            location,
            scale,
            gamma_star,
            delta_star,
            batch_levels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.batch_levels.is_empty() || self.location.is_empty()
    }

    pub fn n_features(&self) -> usize {
        self.location.len()
    }

    pub fn n_batches(&self) -> usize {
        self.batch_levels.len()
    }

    /// Per-feature grand mean (`L`).
    pub fn location(&self) -> &Array1<f64> {
        &self.location
    }

    /// Per-feature pooled variance (`S`).
    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    pub fn gamma_star(&self) -> &Array2<f64> {
        &self.gamma_star
    }

    pub fn delta_star(&self) -> &Array2<f64> {
        &self.delta_star
    }

    pub fn batch_levels(&self) -> &[String] {
        &self.batch_levels
    }

    /// Corrects new data with the stored parameters.
    ///
    /// Each value is standardized with the stored location and pooled variance,
    /// the sample's batch shift and scale are removed, and the value is mapped
    /// back. Features whose stored variance is ~0 pass through unchanged.
    ///
    /// * `data` - feature×sample matrix with `n_features()` rows.
    /// * `batch_labels` - one label per column; every label must be a fitted level.
    pub fn apply(&self, data: &ArrayView2<f64>, batch_labels: &[String]) -> Result<Array2<f64>> {
        if self.is_empty() {
            return Err(CorrectionError::EmptyModel);
        }
        let (n_features, n_samples) = data.dim();
        if batch_labels.len() != n_samples {
            return Err(CorrectionError::DimensionMismatch {
                context: "batch labels vs samples",
                expected: n_samples,
                actual: batch_labels.len(),
            });
        }
        let batch_of = batch_labels
            .iter()
            .map(|label| {
                self.batch_levels
                    .iter()
                    .position(|level| level == label)
                    .ok_or_else(|| CorrectionError::UnknownBatchLevel {
                        batch: label.clone(),
                        known: self.batch_levels.clone(),
                    })
            })
            .collect::<Result<Vec<usize>>>()?;
        if n_features != self.n_features() {
            return Err(CorrectionError::DimensionMismatch {
                context: "features vs model",
                expected: self.n_features(),
                actual: n_features,
            });
        }

        let mut corrected = data.to_owned();
        for g in 0..n_features {
            let variance = self.scale[g];
            if variance < ZERO_VARIANCE_THRESHOLD {
                continue;
            }
            let sd = variance.sqrt();
            let mean = self.location[g];
            for (j, &b) in batch_of.iter().enumerate() {
                let z = (data[[g, j]] - mean) / sd;
                let adjusted = (z - self.gamma_star[[b, g]]) / self.delta_star[[b, g]].sqrt();
                corrected[[g, j]] = adjusted * sd + mean;
            }
        }
        Ok(corrected)
    }
}

/// Output of [`ComBat::fit`].
#[derive(Clone, Debug)]
pub struct ComBatFit {
    /// Corrected feature×sample matrix.
    pub corrected: Array2<f64>,
    pub model: ComBatModel,
    pub diagnostics: FitDiagnostics,
}

/// One-hot batch design used for the least-squares steps.
///
/// With a reference batch its column is all ones, so the reference acts as the
/// intercept and the other coefficients are offsets from it.
struct BatchDesign {
    matrix: Array2<f64>,
    /// Design column for each batch level; `None` if the column was dropped.
    column_of_level: Vec<Option<usize>>,
}

impl BatchDesign {
    fn new(batch_of: &[usize], n_batches: usize, reference: Option<usize>) -> Self {
        let n_samples = batch_of.len();
        let mut full = Array2::<f64>::zeros((n_samples, n_batches));
        for (j, &b) in batch_of.iter().enumerate() {
            full[[j, b]] = 1.0;
        }
        if let Some(r) = reference {
            full.column_mut(r).fill(1.0);
        }

        // Non-reference columns identical to the intercept are collinear with it
        let mut kept = Vec::with_capacity(n_batches);
        let mut column_of_level = vec![None; n_batches];
        for b in 0..n_batches {
            let is_intercept = reference.is_some() && Some(b) != reference && full.column(b).iter().all(|&x| x == 1.0);
            if !is_intercept {
                column_of_level[b] = Some(kept.len());
                kept.push(b);
            }
        }

        Self {
            matrix: full.select(Axis(1), &kept),
            column_of_level,
        }
    }
}

/// Least-squares coefficients against a fixed design, reusing `(XᵗX)⁻¹Xᵗ`.
struct LeastSquares {
    projector: Array2<f64>,
    inverse_residual: f64,
}

impl LeastSquares {
    fn new(design: &Array2<f64>) -> Result<Self> {
        let design_t = transpose(&design.view());
        let gram = multiply(&design_t.view(), &design.view());
        let gram_inv = invert(&gram.view())?;
        Ok(Self {
            projector: multiply(&gram_inv.view(), &design_t.view()),
            inverse_residual: inverse_residual(&gram.view(), &gram_inv.view()),
        })
    }

    /// Coefficients for feature×sample data: shape (n_columns, n_features).
    fn solve(&self, data: &ArrayView2<f64>) -> Array2<f64> {
        multiply(&self.projector.view(), &transpose(data).view())
    }
}

/// Fits ComBat models.
#[derive(Clone, Debug, Default)]
pub struct ComBat {
    config: ComBatConfig,
}

impl ComBat {
    pub fn new(config: ComBatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ComBatConfig {
        &self.config
    }

    /// Estimates batch parameters and returns the corrected data with the model.
    ///
    /// * `data` - feature×sample matrix with only finite values.
    /// * `batch_labels` - one batch label per column.
    ///
    /// # Errors
    /// - `DimensionMismatch` if the label count differs from the sample count.
    /// - `UnknownReferenceBatch` if the configured reference batch is not observed.
    /// - `InsufficientBatchSize` for a single-sample batch under the L/S model.
    /// - `InsufficientFeatures` with fewer than two features.
    /// - `ZeroVarianceFeature` (row indices) if a feature's pooled variance is ~0.
    /// - `NonFiniteVariance` (row indices) if a feature's variance or its fitted
    ///   batch parameters overflow.
    /// - `SingularMatrix` if the batch design cannot be inverted.
    pub fn fit(&self, data: &ArrayView2<f64>, batch_labels: &[String]) -> Result<ComBatFit> {
        let (n_features, n_samples) = data.dim();
        if n_features == 0 || n_samples == 0 {
            return Err(CorrectionError::EmptyMatrix);
        }
        if batch_labels.len() != n_samples {
            return Err(CorrectionError::DimensionMismatch {
                context: "batch labels vs samples",
                expected: n_samples,
                actual: batch_labels.len(),
            });
        }

        let levels = batch_levels(batch_labels);
        let n_batches = levels.len();
        let batch_of: Vec<usize> = batch_labels
            .iter()
            .map(|label| levels.binary_search(label).unwrap_or_default())
            .collect();
        let mut members: Vec<Vec<usize>> = vec![Vec::new(); n_batches];
        for (j, &b) in batch_of.iter().enumerate() {
            members[b].push(j);
        }

        let reference = match &self.config.reference_batch {
            Some(name) => Some(levels.iter().position(|l| l == name).ok_or_else(|| {
                CorrectionError::UnknownReferenceBatch {
                    batch: name.clone(),
                    observed: levels.clone(),
                }
            })?),
            None => None,
        };

        let mean_only = self.config.model_type.mean_only();
        if !mean_only {
            if let Some((b, m)) = members.iter().enumerate().find(|(_, m)| m.len() < 2) {
                return Err(CorrectionError::InsufficientBatchSize {
                    batch: levels[b].clone(),
                    samples: m.len(),
                });
            }
        }
        if n_features < 2 {
            return Err(CorrectionError::InsufficientFeatures {
                required: 2,
                found: n_features,
            });
        }

        info!(
            "Fitting ComBat ({} model). Features={}, Samples={}, Batches={}, Reference={:?}",
            self.config.model_type, n_features, n_samples, n_batches, self.config.reference_batch
        );
        let start_time = std::time::Instant::now();

        if n_batches == 1 {
            return self.fit_single_batch(data, levels);
        }

        // Batch means by least squares
        let design = BatchDesign::new(&batch_of, n_batches, reference);
        let least_squares = LeastSquares::new(&design.matrix)?;
        let b_hat = least_squares.solve(data);

        let grand_mean: Array1<f64> = match reference {
            Some(r) => match design.column_of_level[r] {
                Some(c) => b_hat.row(c).to_owned(),
                None => Array1::zeros(n_features),
            },
            None => {
                let mut mean = Array1::<f64>::zeros(n_features);
                for (b, m) in members.iter().enumerate() {
                    if let Some(c) = design.column_of_level[b] {
                        mean.scaled_add(m.len() as f64 / n_samples as f64, &b_hat.row(c));
                    }
                }
                mean
            }
        };

        // Pooled variance from residuals, divided by the sample count
        let fitted = transpose(&multiply(&design.matrix.view(), &b_hat.view()).view());
        let residuals = data - &fitted;
        let pooled_over: Vec<usize> = match reference {
            Some(r) => members[r].clone(),
            None => (0..n_samples).collect(),
        };
        let pooled_variance: Array1<f64> = residuals
            .axis_iter(Axis(0))
            .map(|row| pooled_over.iter().map(|&j| row[j] * row[j]).sum::<f64>() / pooled_over.len() as f64)
            .collect();

        let flat: Vec<u64> = pooled_variance
            .iter()
            .enumerate()
            .filter(|(_, v)| **v < ZERO_VARIANCE_THRESHOLD)
            .map(|(g, _)| g as u64)
            .collect();
        if !flat.is_empty() {
            return Err(CorrectionError::ZeroVarianceFeature { feature_ids: flat });
        }
        let overflowed = non_finite_rows(pooled_variance.iter().copied(), 1, n_features);
        if !overflowed.is_empty() {
            return Err(CorrectionError::NonFiniteVariance { feature_ids: overflowed });
        }

        // Standardize
        let pooled_sd = pooled_variance.mapv(f64::sqrt);
        let mut standardized = data.to_owned();
        for (g, mut row) in standardized.axis_iter_mut(Axis(0)).enumerate() {
            let (mean, sd) = (grand_mean[g], pooled_sd[g]);
            row.mapv_inplace(|y| (y - mean) / sd);
        }

        // Per-batch location and scale estimates on the standardized data
        let gamma_design = least_squares.solve(&standardized.view());
        let mut gamma_hat = Array2::<f64>::zeros((n_batches, n_features));
        for b in 0..n_batches {
            if let Some(c) = design.column_of_level[b] {
                gamma_hat.row_mut(b).assign(&gamma_design.row(c));
            }
        }
        let mut delta_hat = Array2::<f64>::ones((n_batches, n_features));
        for (b, m) in members.iter().enumerate() {
            if m.len() < 2 {
                continue;
            }
            let batch_values = standardized.select(Axis(1), m);
            delta_hat.row_mut(b).assign(&batch_values.var_axis(Axis(1), 1.0));
        }

        // Empirical-Bayes posterior estimates, batch by batch
        let mut gamma_star = Array2::<f64>::zeros((n_batches, n_features));
        let mut delta_star = Array2::<f64>::ones((n_batches, n_features));
        let mut batch_diagnostics = Vec::with_capacity(n_batches);
        for (b, m) in members.iter().enumerate() {
            let g_hat = gamma_hat.row(b);
            let d_hat = delta_hat.row(b);
            let gamma_bar = g_hat.mean().unwrap_or(0.0);
            let tau_squared = g_hat.var(1.0);

            let mut diag = BatchPriorDiagnostics {
                batch: levels[b].clone(),
                samples: m.len(),
                gamma_bar,
                tau_squared,
                a_prior: None,
                b_prior: None,
                iterations: 0,
                converged: true,
            };

            if mean_only {
                let posterior = g_hat.mapv(|g| posterior_mean(g, gamma_bar, 1.0, 1.0, tau_squared));
                gamma_star.row_mut(b).assign(&posterior);
            } else {
                let (a_prior, b_prior) = inverse_gamma_prior(&d_hat.to_owned());
                diag.a_prior = Some(a_prior);
                diag.b_prior = Some(b_prior);
                let batch_values = standardized.select(Axis(1), m);
                let solution = self.solve_posterior(
                    &batch_values.view(),
                    &g_hat.to_owned(),
                    &d_hat.to_owned(),
                    gamma_bar,
                    tau_squared,
                    a_prior,
                    b_prior,
                );
                gamma_star.row_mut(b).assign(&solution.gamma);
                delta_star.row_mut(b).assign(&solution.delta);
                diag.iterations = solution.iterations;
                diag.converged = solution.converged;
                if !solution.converged {
                    warn!(
                        "Empirical-Bayes solver for batch '{}' hit the {}-iteration cap without converging.",
                        levels[b], self.config.max_iterations
                    );
                }
            }
            debug!(
                "Batch '{}': n={}, gamma_bar={:.6}, tau^2={:.6}, a={:?}, b={:?}, iterations={}",
                diag.batch, diag.samples, diag.gamma_bar, diag.tau_squared, diag.a_prior, diag.b_prior, diag.iterations
            );
            batch_diagnostics.push(diag);
        }

        // The reference batch is the target distribution and is not adjusted
        if let Some(r) = reference {
            gamma_star.row_mut(r).fill(0.0);
            delta_star.row_mut(r).fill(1.0);
        }

        let unstable = non_finite_rows(
            gamma_star.iter().chain(delta_star.iter()).copied(),
            2 * n_batches,
            n_features,
        );
        if !unstable.is_empty() {
            return Err(CorrectionError::NonFiniteVariance { feature_ids: unstable });
        }

        let mut corrected = Array2::<f64>::zeros((n_features, n_samples));
        for g in 0..n_features {
            for (j, &b) in batch_of.iter().enumerate() {
                let adjusted = (standardized[[g, j]] - gamma_star[[b, g]]) / delta_star[[b, g]].sqrt();
                corrected[[g, j]] = adjusted * pooled_sd[g] + grand_mean[g];
            }
        }
        if let Some(r) = reference {
            for &j in &members[r] {
                corrected.column_mut(j).assign(&data.column(j));
            }
        }

        info!("ComBat fit completed in {:?}", start_time.elapsed());

        Ok(ComBatFit {
            corrected,
            model: ComBatModel::from_parts(grand_mean, pooled_variance, gamma_star, delta_star, levels),
            diagnostics: FitDiagnostics {
                batches: batch_diagnostics,
                inverse_residual: least_squares.inverse_residual,
            },
        })
    }

    /// With one batch there is no batch effect to remove: the data are returned
    /// as-is and the model carries neutral parameters.
    fn fit_single_batch(&self, data: &ArrayView2<f64>, levels: Vec<String>) -> Result<ComBatFit> {
        warn!(
            "Only one batch ('{}') present; returning data unchanged.",
            levels.first().map(String::as_str).unwrap_or_default()
        );
        let (n_features, n_samples) = data.dim();
        let location = data.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(n_features));
        let scale = data.var_axis(Axis(1), 0.0);
        let overflowed = non_finite_rows(scale.iter().copied(), 1, n_features);
        if !overflowed.is_empty() {
            return Err(CorrectionError::NonFiniteVariance { feature_ids: overflowed });
        }
        let diagnostics = FitDiagnostics {
            batches: vec![BatchPriorDiagnostics {
                batch: levels[0].clone(),
                samples: n_samples,
                converged: true,
                ..BatchPriorDiagnostics::default()
            }],
            inverse_residual: 0.0,
        };
        Ok(ComBatFit {
            corrected: data.to_owned(),
            model: ComBatModel::from_parts(
                location,
                scale,
                Array2::zeros((1, n_features)),
                Array2::ones((1, n_features)),
                levels,
            ),
            diagnostics,
        })
    }

    /// Alternates the posterior mean of gamma and posterior variance of delta
    /// until the largest relative change is within tolerance.
    #[allow(clippy::too_many_arguments)]
    fn solve_posterior(
        &self,
        batch_values: &ArrayView2<f64>,
        gamma_hat: &Array1<f64>,
        delta_hat: &Array1<f64>,
        gamma_bar: f64,
        tau_squared: f64,
        a_prior: f64,
        b_prior: f64,
    ) -> PosteriorSolution {
        let n = batch_values.ncols() as f64;

        if !(a_prior.is_finite() && b_prior.is_finite()) {
            // Zero spread of delta across features: the prior is a point mass at its mean
            let delta_mean = delta_hat.mean().unwrap_or(1.0);
            warn!("Scale prior is degenerate; using the mean scale estimate {:.6}.", delta_mean);
            let delta = Array1::from_elem(delta_hat.len(), delta_mean);
            let gamma = gamma_hat
                .iter()
                .zip(delta.iter())
                .map(|(&g, &d)| posterior_mean(g, gamma_bar, n, d, tau_squared))
                .collect();
            return PosteriorSolution {
                gamma,
                delta,
                iterations: 0,
                converged: true,
            };
        }

        let mut gamma_old = gamma_hat.clone();
        let mut delta_old = delta_hat.clone();
        let mut iterations = 0;
        loop {
            let gamma_new: Array1<f64> = gamma_hat
                .iter()
                .zip(delta_old.iter())
                .map(|(&g, &d)| posterior_mean(g, gamma_bar, n, d, tau_squared))
                .collect();
            let delta_new: Array1<f64> = batch_values
                .axis_iter(Axis(0))
                .zip(gamma_new.iter())
                .map(|(row, &g)| {
                    let sum_sq = row.iter().map(|&z| (z - g) * (z - g)).sum::<f64>();
                    posterior_variance(sum_sq, n, a_prior, b_prior)
                })
                .collect();

            let change = max_relative_change(&gamma_new, &gamma_old).max(max_relative_change(&delta_new, &delta_old));
            gamma_old = gamma_new;
            delta_old = delta_new;
            iterations += 1;

            if change <= self.config.convergence_tolerance {
                return PosteriorSolution {
                    gamma: gamma_old,
                    delta: delta_old,
                    iterations,
                    converged: true,
                };
            }
            if iterations >= self.config.max_iterations {
                return PosteriorSolution {
                    gamma: gamma_old,
                    delta: delta_old,
                    iterations,
                    converged: false,
                };
            }
        }
    }
}

struct PosteriorSolution {
    gamma: Array1<f64>,
    delta: Array1<f64>,
    iterations: usize,
    converged: bool,
}

/// Posterior mean of a batch location shift under a normal prior.
pub fn posterior_mean(gamma_hat: f64, gamma_bar: f64, n: f64, delta: f64, tau_squared: f64) -> f64 {
    (tau_squared * n * gamma_hat + delta * gamma_bar) / (tau_squared * n + delta)
}

/// Posterior scale of a batch under an inverse-gamma prior with shape `a`, scale `b`.
pub fn posterior_variance(sum_sq: f64, n: f64, a: f64, b: f64) -> f64 {
    (0.5 * sum_sq + b) / (n / 2.0 + a - 1.0)
}

/// Moment-matched inverse-gamma `(a, b)` from the cross-feature scale estimates.
///
/// Returns non-finite values when the estimates have no spread.
pub fn inverse_gamma_prior(delta_hat: &Array1<f64>) -> (f64, f64) {
    let m = delta_hat.mean().unwrap_or(f64::NAN);
    let s2 = delta_hat.var(1.0);
    if !(s2 > 0.0) {
        return (f64::INFINITY, f64::INFINITY);
    }
    ((2.0 * s2 + m * m) / s2, (m * s2 + m * m * m) / s2)
}

/// Feature indices with a non-finite value in any of `n_rows` per-feature
/// vectors laid out back to back.
fn non_finite_rows(values: impl Iterator<Item = f64>, n_rows: usize, n_features: usize) -> Vec<u64> {
    let mut bad = vec![false; n_features];
    for (k, v) in values.enumerate().take(n_rows * n_features) {
        if !v.is_finite() {
            bad[k % n_features] = true;
        }
    }
    bad.iter()
        .enumerate()
        .filter(|(_, b)| **b)
        .map(|(g, _)| g as u64)
        .collect()
}

/// Largest `|new - old| / |old|` over all entries.
///
/// A zero old value counts as no change when the new value is also zero and as
/// an unbounded change otherwise. Any NaN counts as an unbounded change.
pub(crate) fn max_relative_change(new: &Array1<f64>, old: &Array1<f64>) -> f64 {
    new.iter()
        .zip(old.iter())
        .map(|(&n, &o)| {
            let diff = (n - o).abs();
            if diff.is_nan() {
                f64::INFINITY
            } else if diff == 0.0 {
                0.0
            } else if o == 0.0 {
                f64::INFINITY
            } else {
                diff / o.abs()
            }
        })
        .fold(0.0, f64::max)
}
