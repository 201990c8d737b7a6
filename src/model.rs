// src/model.rs

//! Persisted form of a [`ComBatModel`].
//!
//! The record is flat and order-sensitive: `L`, `S`, `gammaStar`, `deltaStar`,
//! `batchLevels`. JSON text and bincode files are both supported; loading always
//! validates shapes and values before a model is handed out.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::combat::ComBatModel;
use crate::error::{CorrectionError, Result};

/// Serialized ComBat parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedModel {
    /// Per-feature grand mean.
    #[serde(rename = "L")]
    pub location: Vec<f64>,
    /// Per-feature pooled variance.
    #[serde(rename = "S")]
    pub scale: Vec<f64>,
    /// Adjusted batch location, `[batch][feature]`.
    #[serde(rename = "gammaStar")]
    pub gamma_star: Vec<Vec<f64>>,
    /// Adjusted batch scale, `[batch][feature]`.
    #[serde(rename = "deltaStar")]
    pub delta_star: Vec<Vec<f64>>,
    #[serde(rename = "batchLevels")]
    pub batch_levels: Vec<String>,
}

impl SerializedModel {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a record from JSON. Shapes are not checked until conversion
    /// into a [`ComBatModel`].
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Checks shapes and values, and builds the typed model.
    pub fn into_model(self) -> Result<ComBatModel> {
        ComBatModel::try_from(self)
    }
}

impl From<&ComBatModel> for SerializedModel {
    fn from(model: &ComBatModel) -> Self {
        SerializedModel {
            location: model.location().to_vec(),
            scale: model.scale().to_vec(),
            gamma_star: model.gamma_star().rows().into_iter().map(|r| r.to_vec()).collect(),
            delta_star: model.delta_star().rows().into_iter().map(|r| r.to_vec()).collect(),
            batch_levels: model.batch_levels().to_vec(),
        }
    }
}

impl TryFrom<SerializedModel> for ComBatModel {
    type Error = CorrectionError;

    fn try_from(record: SerializedModel) -> Result<Self> {
        let n_features = record.location.len();
        let n_batches = record.batch_levels.len();

        if record.scale.len() != n_features {
            return Err(malformed(format!(
                "S has {} entries but L has {}",
                record.scale.len(),
                n_features
            )));
        }
        let gamma_star = batch_matrix("gammaStar", record.gamma_star, n_batches, n_features)?;
        let delta_star = batch_matrix("deltaStar", record.delta_star, n_batches, n_features)?;

        if record.location.iter().chain(record.scale.iter()).any(|v| !v.is_finite()) {
            return Err(malformed("L and S must contain only finite values".to_string()));
        }
        if record.scale.iter().any(|&v| v < 0.0) {
            return Err(malformed("S (pooled variance) must be non-negative".to_string()));
        }
        if gamma_star.iter().any(|v| !v.is_finite()) {
            return Err(malformed("gammaStar must contain only finite values".to_string()));
        }
        if delta_star.iter().any(|&v| !v.is_finite() || v <= 0.0) {
            return Err(malformed("deltaStar must contain only finite, positive values".to_string()));
        }
        let mut seen = HashSet::with_capacity(n_batches);
        if let Some(duplicate) = record.batch_levels.iter().find(|level| !seen.insert(level.as_str())) {
            return Err(malformed(format!("batch level '{}' appears more than once", duplicate)));
        }

        Ok(ComBatModel::from_parts(
            Array1::from(record.location),
            Array1::from(record.scale),
            gamma_star,
            delta_star,
            record.batch_levels,
        ))
    }
}

impl ComBatModel {
    pub fn to_serialized(&self) -> SerializedModel {
        SerializedModel::from(self)
    }

    pub fn to_json(&self) -> Result<String> {
        self.to_serialized().to_json()
    }

    pub fn from_json(text: &str) -> Result<Self> {
        SerializedModel::from_json(text)?.into_model()
    }

    /// Saves the model to a file using bincode.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or encoding fails.
    pub fn save_model<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self.to_serialized(), &mut writer, bincode::config::standard())?;
        Ok(())
    }

    /// Loads a model previously written by [`ComBatModel::save_model`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or decoded, or if the
    /// decoded record is inconsistent (see [`SerializedModel::into_model`]).
    pub fn load_model<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mut reader = BufReader::new(file);
        let record: SerializedModel = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())?;
        record.into_model()
    }
}

fn malformed(message: String) -> CorrectionError {
    CorrectionError::MalformedModel(message)
}

/// Converts a `[batch][feature]` nested vector, rejecting ragged or missized input.
fn batch_matrix(name: &str, rows: Vec<Vec<f64>>, n_batches: usize, n_features: usize) -> Result<Array2<f64>> {
    if rows.len() != n_batches {
        return Err(malformed(format!(
            "{} has {} rows but there are {} batch levels",
            name,
            rows.len(),
            n_batches
        )));
    }
    if let Some((b, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != n_features) {
        return Err(malformed(format!(
            "{} row {} has {} entries but there are {} features",
            name,
            b,
            row.len(),
            n_features
        )));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_batches, n_features), flat).map_err(|e| malformed(format!("{}: {}", name, e)))
}
