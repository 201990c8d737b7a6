// src/quant.rs

//! Peptide-by-sample quantitation data, sample annotations, and input validation.

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{CorrectionError, Result};

/// Features whose variance across samples falls below this cannot be standardized.
pub const ZERO_VARIANCE_THRESHOLD: f64 = 1e-20;

/// One long-format measurement: the value of a feature in a sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuantRecord {
    pub feature_id: u64,
    pub sample_id: u64,
    pub value: f64,
}

/// Dense quantitation matrix.
///
/// Rows are features (peptides), columns are samples. The id vectors record
/// which source feature/sample each row/column holds, so results can be written
/// back in the same order they were read.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantitationMatrix {
    values: Array2<f64>,
    feature_ids: Vec<u64>,
    sample_ids: Vec<u64>,
}

impl QuantitationMatrix {
    /// Wraps a dense matrix with its row and column ids.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the id vectors do not match the matrix shape.
    pub fn new(values: Array2<f64>, feature_ids: Vec<u64>, sample_ids: Vec<u64>) -> Result<Self> {
        if feature_ids.len() != values.nrows() {
            return Err(CorrectionError::DimensionMismatch {
                context: "feature ids vs matrix rows",
                expected: values.nrows(),
                actual: feature_ids.len(),
            });
        }
        if sample_ids.len() != values.ncols() {
            return Err(CorrectionError::DimensionMismatch {
                context: "sample ids vs matrix columns",
                expected: values.ncols(),
                actual: sample_ids.len(),
            });
        }
        Ok(Self {
            values,
            feature_ids,
            sample_ids,
        })
    }

    /// Assembles a dense matrix from long-format records.
    ///
    /// Rows are the sorted distinct feature ids, columns the sorted distinct
    /// sample ids. Cells without a record are left as NaN, which validation
    /// later reports as missing values.
    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = QuantRecord>,
    {
        let records: Vec<QuantRecord> = records.into_iter().collect();
        let feature_ids: Vec<u64> = records
            .iter()
            .map(|r| r.feature_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let sample_ids: Vec<u64> = records
            .iter()
            .map(|r| r.sample_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let row_of: HashMap<u64, usize> = feature_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let col_of: HashMap<u64, usize> = sample_ids.iter().enumerate().map(|(j, &id)| (id, j)).collect();

        let mut values = Array2::from_elem((feature_ids.len(), sample_ids.len()), f64::NAN);
        let mut seen = Array2::from_elem(values.dim(), false);
        for record in &records {
            let cell = [row_of[&record.feature_id], col_of[&record.sample_id]];
            if seen[cell] {
                return Err(CorrectionError::DuplicateMeasurement {
                    feature_id: record.feature_id,
                    sample_id: record.sample_id,
                });
            }
            seen[cell] = true;
            values[cell] = record.value;
        }

        Ok(Self {
            values,
            feature_ids,
            sample_ids,
        })
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn feature_ids(&self) -> &[u64] {
        &self.feature_ids
    }

    pub fn sample_ids(&self) -> &[u64] {
        &self.sample_ids
    }

    pub fn n_features(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.values.ncols()
    }

    /// Same ids, different values. Used to carry the corrected matrix.
    pub(crate) fn with_values(&self, values: Array2<f64>) -> Self {
        debug_assert_eq!(values.dim(), self.values.dim());
        Self {
            values,
            feature_ids: self.feature_ids.clone(),
            sample_ids: self.sample_ids.clone(),
        }
    }

    /// Builds a matrix restricted to the given sample columns, in the given order.
    ///
    /// # Errors
    /// Returns `UnassignedSample` if a requested id is not a column of this matrix.
    pub fn select_samples(&self, sample_ids: &[u64]) -> Result<Self> {
        let col_of: HashMap<u64, usize> = self.sample_ids.iter().enumerate().map(|(j, &id)| (id, j)).collect();
        let columns = sample_ids
            .iter()
            .map(|id| {
                col_of
                    .get(id)
                    .copied()
                    .ok_or(CorrectionError::UnassignedSample { sample_id: *id })
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(Self {
            values: self.values.select(Axis(1), &columns),
            feature_ids: self.feature_ids.clone(),
            sample_ids: sample_ids.to_vec(),
        })
    }

    /// Long-format records in row-major order, for writing results back.
    pub fn to_records(&self) -> Vec<QuantRecord> {
        let mut records = Vec::with_capacity(self.values.len());
        for (row, &feature_id) in self.feature_ids.iter().enumerate() {
            for (col, &sample_id) in self.sample_ids.iter().enumerate() {
                records.push(QuantRecord {
                    feature_id,
                    sample_id,
                    value: self.values[[row, col]],
                });
            }
        }
        records
    }
}

/// Batch label and display name of one sample.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleAnnotation {
    pub sample_id: u64,
    pub batch: String,
    pub display_name: String,
}

impl SampleAnnotation {
    pub fn new(sample_id: u64, batch: impl Into<String>) -> Self {
        Self {
            sample_id,
            batch: batch.into(),
            display_name: sample_id.to_string(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

/// Maps each sample to exactly one batch label.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchAssignment {
    samples: BTreeMap<u64, SampleAnnotation>,
}

impl BatchAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the annotation for `annotation.sample_id`.
    pub fn insert(&mut self, annotation: SampleAnnotation) {
        self.samples.insert(annotation.sample_id, annotation);
    }

    pub fn get(&self, sample_id: u64) -> Option<&SampleAnnotation> {
        self.samples.get(&sample_id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Annotations for every column of `matrix`, in column order.
    ///
    /// # Errors
    /// Returns `UnassignedSample` for the first column without a label.
    pub fn annotations_for(&self, matrix: &QuantitationMatrix) -> Result<Vec<SampleAnnotation>> {
        matrix
            .sample_ids()
            .iter()
            .map(|&sample_id| {
                self.samples
                    .get(&sample_id)
                    .cloned()
                    .ok_or(CorrectionError::UnassignedSample { sample_id })
            })
            .collect()
    }

    /// One batch label per column of `matrix`, in column order.
    pub fn labels_for(&self, matrix: &QuantitationMatrix) -> Result<Vec<String>> {
        Ok(self
            .annotations_for(matrix)?
            .into_iter()
            .map(|a| a.batch)
            .collect())
    }
}

impl FromIterator<SampleAnnotation> for BatchAssignment {
    fn from_iter<T: IntoIterator<Item = SampleAnnotation>>(iter: T) -> Self {
        let mut assignment = Self::new();
        for annotation in iter {
            assignment.insert(annotation);
        }
        assignment
    }
}

/// Sorted distinct batch labels.
pub fn batch_levels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Sample count per batch label.
pub fn batch_sizes(labels: &[String]) -> BTreeMap<String, usize> {
    let mut sizes = BTreeMap::new();
    for label in labels {
        *sizes.entry(label.clone()).or_insert(0) += 1;
    }
    sizes
}

/// Rejects matrices that are empty or contain NaN/infinite entries.
pub fn check_finite(matrix: &QuantitationMatrix) -> Result<()> {
    if matrix.n_features() == 0 || matrix.n_samples() == 0 {
        return Err(CorrectionError::EmptyMatrix);
    }
    let mut count = 0;
    let mut first = None;
    for ((row, col), value) in matrix.values().indexed_iter() {
        if !value.is_finite() {
            count += 1;
            first.get_or_insert((row, col));
        }
    }
    match first {
        Some((row, col)) => Err(CorrectionError::MissingValues { count, row, col }),
        None => Ok(()),
    }
}

/// Rejects matrices with any feature whose variance across samples is ~0, or
/// so large that it overflows to infinity.
///
/// Assumes [`check_finite`] has already passed.
pub fn check_feature_variance(matrix: &QuantitationMatrix) -> Result<()> {
    let variances: Vec<(u64, f64)> = matrix
        .values()
        .axis_iter(Axis(0))
        .zip(matrix.feature_ids())
        .map(|(row, &id)| (id, row.var(0.0)))
        .collect();

    let flat: Vec<u64> = variances
        .iter()
        .filter(|(_, v)| *v < ZERO_VARIANCE_THRESHOLD)
        .map(|(id, _)| *id)
        .collect();
    if !flat.is_empty() {
        return Err(CorrectionError::ZeroVarianceFeature { feature_ids: flat });
    }

    let overflowed: Vec<u64> = variances
        .iter()
        .filter(|(_, v)| !v.is_finite())
        .map(|(id, _)| *id)
        .collect();
    if !overflowed.is_empty() {
        return Err(CorrectionError::NonFiniteVariance {
            feature_ids: overflowed,
        });
    }
    Ok(())
}

/// Runs all data checks in order: missing values first, then zero variance,
/// then overflowing variance.
pub fn validate(matrix: &QuantitationMatrix) -> Result<()> {
    check_finite(matrix)?;
    check_feature_variance(matrix)
}
