use crate::combat::{
    inverse_gamma_prior, max_relative_change, posterior_mean, posterior_variance, ComBat, ComBatConfig,
    ComBatModel, ModelType,
};
use crate::error::CorrectionError;
use crate::quant::batch_levels;
use approx::assert_abs_diff_eq;
use ndarray::{array, s, Array1, Array2, ArrayView2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// Features × samples with an additive and multiplicative effect per batch.
/// Batch `k` gets shift `3k` and noise scale `1 + k`.
fn generate_batched_data(n_features: usize, batch_sizes: &[usize], seed: u64) -> (Array2<f64>, Vec<String>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let n_samples: usize = batch_sizes.iter().sum();
    let mut labels = Vec::with_capacity(n_samples);
    for (k, &size) in batch_sizes.iter().enumerate() {
        let name = ((b'A' + k as u8) as char).to_string();
        labels.extend(std::iter::repeat(name).take(size));
    }
    let batch_index: Vec<usize> = batch_sizes
        .iter()
        .enumerate()
        .flat_map(|(k, &size)| std::iter::repeat(k).take(size))
        .collect();
    let baselines: Vec<f64> = (0..n_features).map(|_| rng.gen_range(5.0..15.0)).collect();
    let data = Array2::from_shape_fn((n_features, n_samples), |(g, j)| {
        let k = batch_index[j] as f64;
        let noise: f64 = rng.sample(StandardNormal);
        baselines[g] + 3.0 * k + (1.0 + k) * noise
    });
    (data, labels)
}

/// Mean of each batch's samples for each feature: shape (n_batches, n_features).
/// Rows follow the sorted batch levels.
fn batch_means(data: &ArrayView2<f64>, batch_labels: &[String]) -> (Vec<String>, Array2<f64>) {
    let levels = batch_levels(batch_labels);
    let mut means = Array2::<f64>::zeros((levels.len(), data.nrows()));
    for (b, level) in levels.iter().enumerate() {
        let columns: Vec<usize> = batch_labels
            .iter()
            .enumerate()
            .filter(|(_, l)| *l == level)
            .map(|(j, _)| j)
            .collect();
        let batch = data.select(Axis(1), &columns);
        if let Some(m) = batch.mean_axis(Axis(1)) {
            means.slice_mut(s![b, ..]).assign(&m);
        }
    }
    (levels, means)
}

fn labels(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn config(model_type: ModelType, reference: Option<&str>) -> ComBatConfig {
    ComBatConfig {
        model_type,
        reference_batch: reference.map(str::to_string),
        ..ComBatConfig::default()
    }
}

fn mean_gap(data: &Array2<f64>, batch_labels: &[String]) -> f64 {
    let (_, means) = batch_means(&data.view(), batch_labels);
    (&means.row(0) - &means.row(1)).mapv(f64::abs).mean().unwrap()
}

#[test]
fn test_fit_reduces_batch_mean_gap() {
    let (data, batch_labels) = generate_batched_data(30, &[6, 6], 11);
    let fit = ComBat::default().fit(&data.view(), &batch_labels).unwrap();
    let before = mean_gap(&data, &batch_labels);
    let after = mean_gap(&fit.corrected, &batch_labels);
    assert!(after < before / 2.0, "gap before {} after {}", before, after);
    assert_eq!(fit.model.batch_levels(), &["A".to_string(), "B".to_string()]);
    assert_eq!(fit.model.gamma_star().dim(), (2, 30));
}

#[test]
fn test_location_scale_equalizes_batch_spread() {
    let (data, batch_labels) = generate_batched_data(40, &[8, 8], 5);
    let fit = ComBat::default().fit(&data.view(), &batch_labels).unwrap();
    let spread = |m: &Array2<f64>, cols: std::ops::Range<usize>| {
        m.slice(s![.., cols]).var_axis(Axis(1), 1.0).mean().unwrap()
    };
    let ratio_before = spread(&data, 8..16) / spread(&data, 0..8);
    let ratio_after = spread(&fit.corrected, 8..16) / spread(&fit.corrected, 0..8);
    assert!(ratio_before > 2.0);
    assert!((ratio_after - 1.0).abs() < (ratio_before - 1.0).abs() / 2.0);
}

#[test]
fn test_mean_only_keeps_unit_scale() {
    let (data, batch_labels) = generate_batched_data(25, &[5, 4, 6], 3);
    let fit = ComBat::new(config(ModelType::Location, None))
        .fit(&data.view(), &batch_labels)
        .unwrap();
    assert!(fit.model.delta_star().iter().all(|&d| d == 1.0));
    assert!(fit.diagnostics.batches.iter().all(|b| b.a_prior.is_none() && b.iterations == 0));
}

#[test]
fn test_mean_only_matches_closed_form() {
    let data = array![
        [1.0, 2.0, 3.0, 6.0, 7.0, 8.0],
        [2.0, 2.5, 3.5, 4.0, 5.5, 5.0],
        [0.0, 1.0, 0.5, 2.0, 2.5, 1.5],
    ];
    let batch_labels = labels(&["A", "A", "A", "B", "B", "B"]);
    let fit = ComBat::new(config(ModelType::Location, None))
        .fit(&data.view(), &batch_labels)
        .unwrap();

    // Balanced batches: grand mean is the row mean, pooled variance the mean squared
    // deviation from each batch mean.
    let grand_mean = data.mean_axis(Axis(1)).unwrap();
    let a = data.slice(s![.., 0..3]);
    let b = data.slice(s![.., 3..6]);
    let mean_a = a.mean_axis(Axis(1)).unwrap();
    let mean_b = b.mean_axis(Axis(1)).unwrap();
    let pooled: Array1<f64> = (0..3)
        .map(|g| {
            let ss_a: f64 = a.row(g).iter().map(|y| (y - mean_a[g]).powi(2)).sum();
            let ss_b: f64 = b.row(g).iter().map(|y| (y - mean_b[g]).powi(2)).sum();
            (ss_a + ss_b) / 6.0
        })
        .collect();
    for g in 0..3 {
        assert_abs_diff_eq!(fit.model.location()[g], grand_mean[g], epsilon = 1e-12);
        assert_abs_diff_eq!(fit.model.scale()[g], pooled[g], epsilon = 1e-12);
    }

    let gamma_hat_a: Array1<f64> = (0..3).map(|g| (mean_a[g] - grand_mean[g]) / pooled[g].sqrt()).collect();
    let gamma_bar = gamma_hat_a.mean().unwrap();
    let tau_squared = gamma_hat_a.var(1.0);
    for g in 0..3 {
        let expected = (tau_squared * gamma_hat_a[g] + gamma_bar) / (tau_squared + 1.0);
        assert_abs_diff_eq!(fit.model.gamma_star()[[0, g]], expected, epsilon = 1e-10);
        let z = (data[[g, 0]] - grand_mean[g]) / pooled[g].sqrt();
        let corrected = (z - expected) * pooled[g].sqrt() + grand_mean[g];
        assert_abs_diff_eq!(fit.corrected[[g, 0]], corrected, epsilon = 1e-10);
    }
}

#[test]
fn test_reference_batch_is_unchanged() {
    let (data, batch_labels) = generate_batched_data(20, &[5, 5, 5], 21);
    let fit = ComBat::new(config(ModelType::LocationScale, Some("B")))
        .fit(&data.view(), &batch_labels)
        .unwrap();
    for j in 5..10 {
        for g in 0..20 {
            assert_eq!(fit.corrected[[g, j]], data[[g, j]]);
        }
    }
    assert!(fit.model.gamma_star().row(1).iter().all(|&v| v == 0.0));
    assert!(fit.model.delta_star().row(1).iter().all(|&v| v == 1.0));
    // Location is the reference batch mean
    let ref_mean = data.slice(s![.., 5..10]).mean_axis(Axis(1)).unwrap();
    for g in 0..20 {
        assert_abs_diff_eq!(fit.model.location()[g], ref_mean[g], epsilon = 1e-10);
    }
}

#[test]
fn test_reference_batch_pulls_others_toward_it() {
    let (data, batch_labels) = generate_batched_data(30, &[6, 6], 8);
    let fit = ComBat::new(config(ModelType::LocationScale, Some("A")))
        .fit(&data.view(), &batch_labels)
        .unwrap();
    let before = mean_gap(&data, &batch_labels);
    let after = mean_gap(&fit.corrected, &batch_labels);
    assert!(after < before / 2.0, "gap before {} after {}", before, after);
}

#[test]
fn test_unknown_reference_batch() {
    let (data, batch_labels) = generate_batched_data(10, &[3, 3], 1);
    let err = ComBat::new(config(ModelType::LocationScale, Some("Z")))
        .fit(&data.view(), &batch_labels)
        .unwrap_err();
    match err {
        CorrectionError::UnknownReferenceBatch { batch, observed } => {
            assert_eq!(batch, "Z");
            assert_eq!(observed, vec!["A", "B"]);
        }
        other => panic!("expected UnknownReferenceBatch, got {:?}", other),
    }
}

#[test]
fn test_single_sample_batch_needs_mean_only() {
    let (data, batch_labels) = generate_batched_data(12, &[1, 3], 2);
    let err = ComBat::default().fit(&data.view(), &batch_labels).unwrap_err();
    assert!(matches!(
        err,
        CorrectionError::InsufficientBatchSize { ref batch, samples: 1 } if batch == "A"
    ));

    let fit = ComBat::new(config(ModelType::Location, None))
        .fit(&data.view(), &batch_labels)
        .unwrap();
    assert!(fit.corrected.iter().all(|v| v.is_finite()));
}

#[test]
fn test_label_count_must_match_samples() {
    let (data, mut batch_labels) = generate_batched_data(6, &[3, 3], 4);
    batch_labels.pop();
    assert!(matches!(
        ComBat::default().fit(&data.view(), &batch_labels),
        Err(CorrectionError::DimensionMismatch { expected: 6, actual: 5, .. })
    ));
}

#[test]
fn test_flat_pooled_variance_is_reported_by_row() {
    // Row 1 is constant inside each batch, so its residual variance is zero
    let data = array![[1.0, 2.0, 3.0, 5.0], [4.0, 4.0, 9.0, 9.0], [0.5, 1.5, 1.0, 3.0]];
    let batch_labels = labels(&["A", "A", "B", "B"]);
    match ComBat::default().fit(&data.view(), &batch_labels) {
        Err(CorrectionError::ZeroVarianceFeature { feature_ids }) => assert_eq!(feature_ids, vec![1]),
        other => panic!("expected ZeroVarianceFeature, got {:?}", other),
    }
}

#[test]
fn test_single_batch_is_returned_unchanged() {
    let (data, batch_labels) = generate_batched_data(8, &[5], 9);
    let fit = ComBat::default().fit(&data.view(), &batch_labels).unwrap();
    assert_eq!(fit.corrected, data);
    assert!(fit.diagnostics.all_converged());
    assert!(fit.model.gamma_star().iter().all(|&v| v == 0.0));
    assert!(fit.model.delta_star().iter().all(|&v| v == 1.0));
}

#[test]
fn test_solver_converges_well_under_cap() {
    for seed in 0..5 {
        let (data, batch_labels) = generate_batched_data(50, &[4, 7, 5], seed);
        let fit = ComBat::default().fit(&data.view(), &batch_labels).unwrap();
        assert!(fit.diagnostics.all_converged());
        assert!(fit.diagnostics.max_iterations() < 500, "seed {}: {:?}", seed, fit.diagnostics);
        assert!(fit.diagnostics.inverse_residual < 1e-12);
    }
}

#[test]
fn test_iteration_cap_is_reported() {
    let (data, batch_labels) = generate_batched_data(30, &[5, 5], 6);
    let fit = ComBat::new(ComBatConfig {
        max_iterations: 1,
        convergence_tolerance: 0.0,
        ..ComBatConfig::default()
    })
    .fit(&data.view(), &batch_labels)
    .unwrap();
    assert!(!fit.diagnostics.all_converged());
    assert_eq!(fit.diagnostics.max_iterations(), 1);
}

#[test]
fn test_apply_reproduces_fit() {
    let (data, batch_labels) = generate_batched_data(30, &[6, 5], 13);
    let fit = ComBat::default().fit(&data.view(), &batch_labels).unwrap();
    let reapplied = fit.model.apply(&data.view(), &batch_labels).unwrap();
    for (a, b) in reapplied.iter().zip(fit.corrected.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
    }

    // One held-out column at a time gives the same values
    let column = data.slice(s![.., 7..8]).to_owned();
    let single = fit.model.apply(&column.view(), &batch_labels[7..8]).unwrap();
    for g in 0..30 {
        assert_abs_diff_eq!(single[[g, 0]], fit.corrected[[g, 7]], epsilon = 1e-10);
    }
}

#[test]
fn test_apply_rejects_unseen_batch() {
    let (data, batch_labels) = generate_batched_data(10, &[3, 3], 14);
    let fit = ComBat::default().fit(&data.view(), &batch_labels).unwrap();
    let mut new_labels = batch_labels.clone();
    new_labels[0] = "C".to_string();
    assert!(matches!(
        fit.model.apply(&data.view(), &new_labels),
        Err(CorrectionError::UnknownBatchLevel { ref batch, .. }) if batch == "C"
    ));
    assert!(matches!(
        fit.model.apply(&data.view(), &batch_labels[..4]),
        Err(CorrectionError::DimensionMismatch { .. })
    ));
    let fewer_features = data.slice(s![..5, ..]).to_owned();
    assert!(matches!(
        fit.model.apply(&fewer_features.view(), &batch_labels),
        Err(CorrectionError::DimensionMismatch { expected: 10, actual: 5, .. })
    ));
}

#[test]
fn test_apply_on_empty_model() {
    let data = Array2::<f64>::ones((2, 2));
    assert!(matches!(
        ComBatModel::empty().apply(&data.view(), &labels(&["A", "B"])),
        Err(CorrectionError::EmptyModel)
    ));
}

#[test]
fn test_apply_passes_zero_scale_features_through() {
    let model = ComBatModel::from_parts(
        array![1.0, 2.0],
        array![0.0, 4.0],
        array![[0.5, 0.5]],
        array![[4.0, 4.0]],
        labels(&["A"]),
    );
    let data = array![[3.0], [6.0]];
    let out = model.apply(&data.view(), &labels(&["A"])).unwrap();
    assert_eq!(out[[0, 0]], 3.0);
    // z = (6 - 2) / 2 = 2; (2 - 0.5) / 2 = 0.75; 0.75 * 2 + 2 = 3.5
    assert_abs_diff_eq!(out[[1, 0]], 3.5, epsilon = 1e-12);
}

#[test]
fn test_prior_formulas() {
    assert_abs_diff_eq!(posterior_mean(2.0, 0.0, 1.0, 1.0, 1.0), 1.0);
    assert_abs_diff_eq!(posterior_mean(2.0, 1.0, 3.0, 1.0, 0.0), 1.0);
    assert_abs_diff_eq!(posterior_variance(4.0, 4.0, 3.0, 2.0), 1.0);

    let delta_hat = array![1.0, 2.0, 3.0];
    let (a, b) = inverse_gamma_prior(&delta_hat);
    // m = 2, s2 = 1
    assert_abs_diff_eq!(a, 6.0);
    assert_abs_diff_eq!(b, 10.0);

    let (a, b) = inverse_gamma_prior(&array![1.0, 1.0, 1.0]);
    assert!(a.is_infinite() && b.is_infinite());
}

#[test]
fn test_model_type_parsing() {
    assert_eq!("L".parse::<ModelType>().unwrap(), ModelType::Location);
    assert_eq!("L/S".parse::<ModelType>().unwrap(), ModelType::LocationScale);
    assert!("X".parse::<ModelType>().is_err());
    assert_eq!(ModelType::LocationScale.to_string(), "L/S");
    assert_eq!(serde_json::to_string(&ModelType::Location).unwrap(), "\"L\"");
}

#[test]
fn test_overflowing_pooled_variance_is_rejected() {
    // Finite entries whose squared residuals exceed f64::MAX
    let (data, batch_labels) = generate_batched_data(10, &[4, 4], 31);
    let scaled = data.mapv(|v| v * 1e160);
    assert!(scaled.iter().all(|v| v.is_finite()));
    match ComBat::default().fit(&scaled.view(), &batch_labels) {
        Err(CorrectionError::NonFiniteVariance { feature_ids }) => {
            assert_eq!(feature_ids, (0..10).collect::<Vec<u64>>())
        }
        Err(other) => panic!("expected NonFiniteVariance, got {:?}", other),
        Ok(fit) => panic!(
            "expected NonFiniteVariance, got a fit with {} non-finite values",
            fit.corrected.iter().filter(|v| !v.is_finite()).count()
        ),
    }
}

#[test]
fn test_overflowing_single_batch_is_rejected() {
    let data = array![[1e160, -1e160, 3e160], [1.0, 2.0, 4.0]];
    assert!(matches!(
        ComBat::default().fit(&data.view(), &labels(&["A", "A", "A"])),
        Err(CorrectionError::NonFiniteVariance { ref feature_ids }) if feature_ids.as_slice() == &[0u64]
    ));
}

#[test]
fn test_relative_change_treats_nan_as_unconverged() {
    assert_eq!(max_relative_change(&array![f64::NAN, 1.0], &array![0.5, 1.0]), f64::INFINITY);
    assert_eq!(max_relative_change(&array![0.5, 1.0], &array![f64::NAN, 1.0]), f64::INFINITY);
    assert_abs_diff_eq!(max_relative_change(&array![1.1, 0.0], &array![1.0, 0.0]), 0.1, epsilon = 1e-12);
}
