// Batch-effect correction (ComBat) with before/after PCA

#![doc = include_str!("../README.md")]

pub mod combat;
pub mod correction;
pub mod diagnostics;
pub mod error;
pub mod linalg;
pub mod model;
pub mod pca;
pub mod quant;

pub use combat::{ComBat, ComBatConfig, ComBatFit, ComBatModel, ModelType};
pub use correction::{
    compute_correction, BatchCorrector, CorrectionConfig, CorrectionMode, CorrectionRequest, CorrectionResult,
};
pub use diagnostics::{BatchPriorDiagnostics, FitDiagnostics};
pub use error::{CorrectionError, Result};
pub use model::SerializedModel;
pub use pca::{PcaPoint, PcaResult, PowerIterationConfig, PowerIterationPca};
pub use quant::{BatchAssignment, QuantRecord, QuantitationMatrix, SampleAnnotation};

#[cfg(test)]
mod combat_tests;
