// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: factored-matrix operations agree with the dense
//! product they stand for.
//!
//! Run:
//!   `cargo test --test factored_matrix`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    missing_docs
)]

use candle_core::{DType, Device, Tensor};
use candle_lens::{FactoredMatrix, HookedTransformer, HookedTransformerConfig, HookedWeights};

const TOLERANCE: f32 = 1e-4;

fn randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0f32, 1.0, shape, &Device::Cpu).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn scalar(t: &Tensor) -> f32 {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()[0]
}

/// A rank-3 `6 × 5` matrix as `[6, 3] @ [3, 5]`.
fn thin() -> (FactoredMatrix, Tensor) {
    let (a, b) = (randn(&[6, 3]), randn(&[3, 5]));
    let dense = a.matmul(&b).unwrap();
    (FactoredMatrix::new(a, b).unwrap(), dense)
}

#[test]
fn ab_is_the_dense_product() {
    let (fm, dense) = thin();
    assert!(max_abs_diff(&fm.ab().unwrap(), &dense) < TOLERANCE);
    assert_eq!(fm.shape(), vec![6, 5]);
    assert_eq!(fm.ndim(), 2);
}

#[test]
fn vector_products_match_dense() {
    let (fm, dense) = thin();
    let right = randn(&[5]);
    let got = fm.matmul(&right).unwrap().into_vector().unwrap();
    let want = dense.matmul(&right.unsqueeze(1).unwrap()).unwrap().squeeze(1).unwrap();
    assert_eq!(got.dims(), &[6]);
    assert!(max_abs_diff(&got, &want) < TOLERANCE);

    let left = randn(&[6]);
    let got = fm.rmatmul(&left).unwrap().into_vector().unwrap();
    let want = left.unsqueeze(0).unwrap().matmul(&dense).unwrap().squeeze(0).unwrap();
    assert_eq!(got.dims(), &[5]);
    assert!(max_abs_diff(&got, &want) < TOLERANCE);
}

#[test]
fn matrix_products_stay_factored() {
    let (fm, dense) = thin();
    let right = randn(&[5, 4]);
    let product = fm.matmul(&right).unwrap().into_matrix().unwrap();
    assert!(max_abs_diff(&product.ab().unwrap(), &dense.matmul(&right).unwrap()) < TOLERANCE);

    let left = randn(&[2, 6]);
    let product = fm.rmatmul(&left).unwrap().into_matrix().unwrap();
    assert!(max_abs_diff(&product.ab().unwrap(), &left.matmul(&dense).unwrap()) < TOLERANCE);
}

#[test]
fn compose_and_transpose_match_dense() {
    let (fm, dense) = thin();
    let other = FactoredMatrix::new(randn(&[5, 2]), randn(&[2, 7])).unwrap();
    let composed = fm.compose(&other).unwrap();
    let want = dense.matmul(&other.ab().unwrap()).unwrap();
    assert!(max_abs_diff(&composed.ab().unwrap(), &want) < TOLERANCE);

    let transposed = fm.t().unwrap().ab().unwrap();
    assert!(max_abs_diff(&transposed, &dense.t().unwrap()) < TOLERANCE);
}

#[test]
fn svd_reconstructs_the_product() {
    let (fm, dense) = thin();
    let v_t = fm.v().unwrap().t().unwrap();
    let rebuilt = fm.collapse_r().unwrap().matmul(&v_t).unwrap();
    assert!(max_abs_diff(&rebuilt, &dense) < TOLERANCE);
    assert_eq!(fm.s().unwrap().dims(), &[3]);

    let even = fm.make_even().unwrap();
    assert!(max_abs_diff(&even.ab().unwrap(), &dense) < TOLERANCE);
}

#[test]
fn norm_is_frobenius() {
    let (fm, dense) = thin();
    let frobenius = dense.sqr().unwrap().sum_all().unwrap().sqrt().unwrap();
    assert!((scalar(&fm.norm().unwrap()) - scalar(&frobenius)).abs() < 1e-3);
}

#[test]
fn eigenvalues_sum_to_the_trace() {
    let (a, b) = (randn(&[5, 2]), randn(&[2, 5]));
    let dense = a.matmul(&b).unwrap();
    let fm = FactoredMatrix::new(a, b).unwrap();
    let (re, im) = fm.eigenvalues().unwrap();
    assert_eq!(re.dims(), &[2]);
    let trace = (dense * Tensor::eye(5, DType::F32, &Device::Cpu).unwrap())
        .unwrap()
        .sum_all()
        .unwrap();
    assert!((scalar(&re.sum_all().unwrap()) - scalar(&trace)).abs() < 1e-3);
    assert!(scalar(&im.sum_all().unwrap()).abs() < 1e-3);
}

#[test]
fn model_circuits_match_dense_weights() {
    let mut cfg = HookedTransformerConfig::new(2, 8, 16, 4, 4, 11);
    cfg.n_key_value_heads = 2;
    let model = HookedTransformer::random(cfg).unwrap();

    let qk = model.qk().unwrap();
    assert_eq!(qk.shape(), vec![2, 4, 8, 8]);
    // Query head 3 shares key head 1.
    let w_q = model.w_q().unwrap().get(1).unwrap().get(3).unwrap();
    let w_k = model.w_k().unwrap().get(1).unwrap().get(1).unwrap();
    let want = w_q.matmul(&w_k.t().unwrap()).unwrap();
    let got = qk.index(1).unwrap().index(3).unwrap().ab().unwrap();
    assert!(max_abs_diff(&got, &want) < TOLERANCE);

    let ov = model.ov().unwrap();
    let w_v = model.w_v().unwrap().get(0).unwrap().get(0).unwrap();
    let w_o = model.w_o().unwrap().get(0).unwrap().get(1).unwrap();
    let got = ov.index(0).unwrap().index(1).unwrap().ab().unwrap();
    assert!(max_abs_diff(&got, &w_v.matmul(&w_o).unwrap()) < TOLERANCE);
}
