// src/correction.rs

//! Entry point for a batch-correction run.
//!
//! A [`CorrectionRequest`] carries everything one run needs: the quantitation
//! matrix, the batch assignment, the model choice, and either a request to fit
//! or a saved model to apply. [`BatchCorrector`] validates the request, runs
//! ComBat, and projects the data before and after correction with the same PCA
//! settings so the two results can be plotted side by side.

use log::info;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::combat::{ComBat, ComBatConfig, ModelType};
use crate::diagnostics::FitDiagnostics;
use crate::error::{CorrectionError, Result};
use crate::model::SerializedModel;
use crate::pca::{PcaResult, PowerIterationConfig, PowerIterationPca};
use crate::quant::{batch_levels, batch_sizes, validate, BatchAssignment, QuantitationMatrix};

/// Whether to estimate a new model or reuse a saved one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectionMode {
    Fit,
    Apply,
}

/// Settings shared by every request a [`BatchCorrector`] handles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CorrectionConfig {
    pub pca: PowerIterationConfig,
    /// Convergence tolerance of the empirical-Bayes solver.
    pub convergence_tolerance: f64,
    /// Iteration cap of the empirical-Bayes solver.
    pub max_iterations: usize,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        let combat = ComBatConfig::default();
        CorrectionConfig {
            pca: PowerIterationConfig::default(),
            convergence_tolerance: combat.convergence_tolerance,
            max_iterations: combat.max_iterations,
        }
    }
}

/// Immutable input of one correction run.
#[derive(Clone, Debug)]
pub struct CorrectionRequest {
    pub matrix: QuantitationMatrix,
    pub samples: BatchAssignment,
    pub model_type: ModelType,
    pub reference_batch: Option<String>,
    pub mode: CorrectionMode,
    /// Required when `mode` is [`CorrectionMode::Apply`].
    pub saved_model: Option<SerializedModel>,
}

impl CorrectionRequest {
    /// A request to fit a new model.
    pub fn fit(matrix: QuantitationMatrix, samples: BatchAssignment, model_type: ModelType) -> Self {
        Self {
            matrix,
            samples,
            model_type,
            reference_batch: None,
            mode: CorrectionMode::Fit,
            saved_model: None,
        }
    }

    /// A request to apply a previously saved model.
    pub fn apply(
        matrix: QuantitationMatrix,
        samples: BatchAssignment,
        model_type: ModelType,
        saved_model: Option<SerializedModel>,
    ) -> Self {
        Self {
            matrix,
            samples,
            model_type,
            reference_batch: None,
            mode: CorrectionMode::Apply,
            saved_model,
        }
    }

    pub fn with_reference_batch(mut self, batch: impl Into<String>) -> Self {
        self.reference_batch = Some(batch.into());
        self
    }
}

/// Everything a run produces.
#[derive(Clone, Debug)]
pub struct CorrectionResult {
    /// PCA of the input matrix.
    pub before: PcaResult,
    /// PCA of the corrected matrix, same sample order and metadata as `before`.
    pub after: PcaResult,
    /// Sorted distinct batch labels of the input samples.
    pub batches: Vec<String>,
    /// Corrected values with the input's feature and sample orderings.
    pub corrected: QuantitationMatrix,
    /// The fitted model, for `Fit` runs.
    pub model: Option<SerializedModel>,
    /// Solver summary, for `Fit` runs.
    pub diagnostics: Option<FitDiagnostics>,
}

impl CorrectionResult {
    /// Feature id of each corrected row.
    pub fn feature_order(&self) -> &[u64] {
        self.corrected.feature_ids()
    }

    /// Sample id of each corrected column.
    pub fn sample_order(&self) -> &[u64] {
        self.corrected.sample_ids()
    }
}

/// Runs correction requests.
#[derive(Clone, Debug, Default)]
pub struct BatchCorrector {
    config: CorrectionConfig,
}

impl BatchCorrector {
    pub fn new(config: CorrectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrectionConfig {
        &self.config
    }

    /// Validates the request, fits or applies ComBat, and runs PCA before and after.
    ///
    /// # Errors
    /// Data problems (`MissingValues`, `ZeroVarianceFeature`, `NonFiniteVariance`,
    /// `UnassignedSample`) are reported before any model work, in both modes.
    /// `Fit` additionally fails with `InsufficientBatchSize`,
    /// `UnknownReferenceBatch` or `SingularMatrix`; `Apply` with `MissingModel`,
    /// `MalformedModel`, `EmptyModel`, `UnknownBatchLevel` or `DimensionMismatch`.
    ///
    /// A matrix with a single sample column has zero variance in every feature
    /// and is always rejected with `ZeroVarianceFeature`. To correct one held-out
    /// sample, convert the saved model with [`SerializedModel::into_model`] and
    /// call [`ComBatModel::apply`](crate::combat::ComBatModel::apply) directly.
    pub fn compute_correction(&self, request: &CorrectionRequest) -> Result<CorrectionResult> {
        let matrix = &request.matrix;
        info!(
            "Starting {:?} correction ({} model). Features={}, Samples={}",
            request.mode,
            request.model_type,
            matrix.n_features(),
            matrix.n_samples()
        );
        let start_time = std::time::Instant::now();

        validate(matrix)?;
        let annotations = request.samples.annotations_for(matrix)?;
        let labels: Vec<String> = annotations.iter().map(|a| a.batch.clone()).collect();

        let (corrected_values, model, diagnostics) = match request.mode {
            CorrectionMode::Fit => {
                if !request.model_type.mean_only() {
                    let sizes = batch_sizes(&labels);
                    if let Some((batch, samples)) = sizes.iter().find(|(_, n)| **n == 1) {
                        return Err(CorrectionError::InsufficientBatchSize {
                            batch: batch.clone(),
                            samples: *samples,
                        });
                    }
                }
                let combat = ComBat::new(ComBatConfig {
                    model_type: request.model_type,
                    reference_batch: request.reference_batch.clone(),
                    convergence_tolerance: self.config.convergence_tolerance,
                    max_iterations: self.config.max_iterations,
                });
                let fit = combat
                    .fit(&matrix.view(), &labels)
                    .map_err(|e| rows_to_feature_ids(e, matrix))?;
                let serialized = fit.model.to_serialized();
                (fit.corrected, Some(serialized), Some(fit.diagnostics))
            }
            CorrectionMode::Apply => {
                let saved = request.saved_model.as_ref().ok_or(CorrectionError::MissingModel)?;
                let model = saved.clone().into_model()?;
                (model.apply(&matrix.view(), &labels)?, None, None)
            }
        };

        let pca = PowerIterationPca::new(self.config.pca.clone());
        let before = pca.compute(&matrix.view(), &annotations);
        let after = pca.compute(&corrected_values.view(), &annotations);

        info!(
            "Correction finished in {:?}. PC1/PC2 explained before: {:.1}%/{:.1}%, after: {:.1}%/{:.1}%",
            start_time.elapsed(),
            before.variance_explained[0],
            before.variance_explained[1],
            after.variance_explained[0],
            after.variance_explained[1]
        );

        Ok(CorrectionResult {
            before,
            after,
            batches: batch_levels(&labels),
            corrected: matrix.with_values(corrected_values),
            model,
            diagnostics,
        })
    }

    /// Runs independent requests on the rayon thread pool.
    ///
    /// Each request gets its own model; results come back in request order.
    pub fn compute_many(&self, requests: &[CorrectionRequest]) -> Vec<Result<CorrectionResult>> {
        requests.par_iter().map(|request| self.compute_correction(request)).collect()
    }
}

/// Runs one request with default settings.
pub fn compute_correction(request: &CorrectionRequest) -> Result<CorrectionResult> {
    BatchCorrector::default().compute_correction(request)
}

/// ComBat reports flat or overflowing features by row index; callers know them by feature id.
fn rows_to_feature_ids(error: CorrectionError, matrix: &QuantitationMatrix) -> CorrectionError {
    match error {
        CorrectionError::ZeroVarianceFeature { feature_ids } => CorrectionError::ZeroVarianceFeature {
            feature_ids: lookup_feature_ids(feature_ids, matrix),
        },
        CorrectionError::NonFiniteVariance { feature_ids } => CorrectionError::NonFiniteVariance {
            feature_ids: lookup_feature_ids(feature_ids, matrix),
        },
        other => other,
    }
}

fn lookup_feature_ids(rows: Vec<u64>, matrix: &QuantitationMatrix) -> Vec<u64> {
    rows.into_iter()
        .filter_map(|row| matrix.feature_ids().get(row as usize).copied())
        .collect()
}
