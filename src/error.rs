// src/error.rs

//! Error types for batch correction.

use thiserror::Error;

/// Every way a correction attempt can fail.
///
/// All variants are fatal to the current attempt; nothing is retried internally.
/// The `Display` text is the single message meant to be shown to the user.
#[derive(Error, Debug)]
pub enum CorrectionError {
    #[error("Input matrix has no features or no samples.")]
    EmptyMatrix,

    #[error(
        "Input matrix contains {count} missing or non-finite value(s); first at feature row {row}, sample column {col}."
    )]
    MissingValues { count: usize, row: usize, col: usize },

    #[error("{} feature(s) have zero variance across samples: {feature_ids:?}", .feature_ids.len())]
    ZeroVarianceFeature { feature_ids: Vec<u64> },

    #[error(
        "{} feature(s) have a variance too large to represent; rescale the input (e.g. log-transform): {feature_ids:?}",
        .feature_ids.len()
    )]
    NonFiniteVariance { feature_ids: Vec<u64> },

    #[error("At least {required} features are required, found {found}.")]
    InsufficientFeatures { required: usize, found: usize },

    #[error(
        "Batch '{batch}' has {samples} sample(s); the location/scale model needs at least 2 per batch. Use the location-only model or add samples."
    )]
    InsufficientBatchSize { batch: String, samples: usize },

    #[error("Reference batch '{batch}' is not among the observed batches {observed:?}.")]
    UnknownReferenceBatch { batch: String, observed: Vec<String> },

    #[error("The model has not been fit; there are no parameters to apply.")]
    EmptyModel,

    #[error("A saved model is required to apply a correction, but none was supplied.")]
    MissingModel,

    #[error("Batch '{batch}' was not seen when the model was fit (known batches: {known:?}).")]
    UnknownBatchLevel { batch: String, known: Vec<String> },

    #[error("Dimension mismatch for {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Matrix is singular (pivot {pivot:e} in column {column}); batches may be collinear.")]
    SingularMatrix { column: usize, pivot: f64 },

    #[error("Sample {sample_id} has no batch label.")]
    UnassignedSample { sample_id: u64 },

    #[error("Duplicate measurement for feature {feature_id}, sample {sample_id}.")]
    DuplicateMeasurement { feature_id: u64, sample_id: u64 },

    #[error("Malformed model: {0}")]
    MalformedModel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to encode model: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode model: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, CorrectionError>;
