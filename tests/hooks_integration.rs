// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: hook dispatch, ordering, scoped removal and capture
//! on small randomly initialised models.
//!
//! Run:
//!   `cargo test --test hooks_integration`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    missing_docs
)]

use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};
use candle_lens::{
    Hook, HookFilter, HookLifetime, HookPoint, HookSpec, HookedRootModule, HookedTransformer,
    HookedTransformerConfig, Intervention, LensError, ReturnType,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn tiny() -> HookedTransformer {
    HookedTransformer::random(HookedTransformerConfig::new(2, 8, 16, 4, 2, 13)).unwrap()
}

fn tokens() -> Tensor {
    Tensor::new(&[[1_u32, 5, 9, 2]], &Device::Cpu).unwrap()
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

/// Observer that stores the last tensor it saw.
fn recorder() -> (Hook, Arc<Mutex<Option<Tensor>>>) {
    let slot = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    let hook = Hook::observe(move |t, _| {
        *sink.lock().unwrap() = Some(t.clone());
        Ok(())
    });
    (hook, slot)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[test]
fn empty_spec_matches_plain_forward() {
    let model = tiny();
    let plain = model.forward(&tokens(), ReturnType::Logits).unwrap();
    let hooked = model.run_with_spec(&tokens(), &HookSpec::new()).unwrap();
    assert!(max_abs_diff(plain.logits().unwrap(), hooked.output()) < 1e-6);
}

#[test]
fn persistent_hooks_run_before_per_call_hooks() {
    let model = tiny();
    let (_, cache) = model.run_with_cache(&tokens(), HookPoint::Embed).unwrap();
    let clean = cache.require(&HookPoint::Embed).unwrap().clone();

    model
        .add_hook(
            HookPoint::Embed,
            Hook::transform(|t, _| Ok((t + 1.0)?)),
            HookLifetime::Temporary,
        )
        .unwrap();
    let (observer, seen) = recorder();
    model
        .run_with_hooks(
            &tokens(),
            vec![
                (HookPoint::Embed.into(), Hook::Intervene(Intervention::Scale(2.0))),
                (HookPoint::Embed.into(), observer),
            ],
        )
        .unwrap();
    model.reset_hooks(false);

    let expected = ((clean + 1.0).unwrap() * 2.0).unwrap();
    let seen = seen.lock().unwrap().clone().unwrap();
    assert!(max_abs_diff(&seen, &expected) < 1e-6);
}

#[test]
fn captures_record_the_modified_activation() {
    let model = tiny();
    let mut spec = HookSpec::new();
    spec.intervene(HookPoint::resid_pre(1), Intervention::Zero);
    spec.capture(HookPoint::resid_pre(1));
    let out = model.run_with_spec(&tokens(), &spec).unwrap();
    let captured = out.require(&HookPoint::resid_pre(1)).unwrap();
    assert!(max_abs_diff(captured, &captured.zeros_like().unwrap()) < 1e-12);
}

#[test]
fn zeroing_every_head_silences_attention() {
    let model = tiny();
    let mut spec = HookSpec::new();
    spec.intervene(HookPoint::z(0), Intervention::ZeroHeads(vec![0, 1]));
    spec.capture(HookPoint::attn_out(0));
    let out = model.run_with_spec(&tokens(), &spec).unwrap();
    // Random weights have zero biases, so no head output leaves only b_O = 0.
    let attn_out = out.require(&HookPoint::attn_out(0)).unwrap();
    assert!(max_abs_diff(attn_out, &attn_out.zeros_like().unwrap()) < 1e-6);
}

#[test]
fn shape_changing_transform_is_rejected() {
    let model = tiny();
    let err = model
        .run_with_hooks(
            &tokens(),
            vec![(
                HookPoint::resid_post(0).into(),
                Hook::transform(|t, _| Ok(t.narrow(1, 0, 1)?)),
            )],
        )
        .unwrap_err();
    match err {
        LensError::Hook(msg) => assert!(msg.contains("blocks.0.hook_resid_post"), "{msg}"),
        other => panic!("unexpected error: {other}"),
    }
}

// ---------------------------------------------------------------------------
// Registration and removal
// ---------------------------------------------------------------------------

#[test]
fn filter_matching_nothing_is_an_error() {
    let model = tiny();
    assert!(matches!(
        model.add_hook(
            "blocks.9.hook_resid_pre",
            Hook::Intervene(Intervention::Zero),
            HookLifetime::Temporary
        ),
        Err(LensError::Hook(_))
    ));
    assert!(matches!(
        model.run_with_cache(&tokens(), "decoder.*.hook_resid_pre"),
        Err(LensError::Hook(_))
    ));
    assert!(model.registry().is_empty());
}

#[test]
fn guard_removes_hooks_after_failing_forward() {
    let model = tiny();
    {
        let _guard = model
            .hooks(vec![(
                HookPoint::Embed.into(),
                Hook::transform(|_, point| Err(LensError::Hook(format!("refused at {point}")))),
            )])
            .unwrap();
        assert_eq!(model.registry().len(), 1);
        assert!(model.forward(&tokens(), ReturnType::Logits).is_err());
    }
    assert!(model.registry().is_empty());
    assert!(model.forward(&tokens(), ReturnType::Logits).is_ok());
}

#[test]
fn reset_keeps_permanent_hooks() {
    let model = tiny();
    let permanent = model
        .add_hook(
            HookFilter::from("blocks.*.hook_resid_post"),
            Hook::observe(|_, _| Ok(())),
            HookLifetime::Permanent,
        )
        .unwrap();
    model
        .add_hook(HookPoint::Embed, Hook::observe(|_, _| Ok(())), HookLifetime::Temporary)
        .unwrap();
    model.reset_hooks(false);
    assert_eq!(model.registry().len(), 1);
    assert!(model.remove_hook(permanent));
    assert!(model.registry().is_empty());
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[test]
fn every_hook_point_is_captured() {
    let model = tiny();
    let (_, cache) = model.run_with_cache(&tokens(), HookFilter::All).unwrap();
    let points = model.hook_points();
    assert_eq!(cache.len(), points.len());
    for point in &points {
        assert!(cache.contains(point), "missing {point}");
    }
}

#[test]
fn pattern_capture_selects_one_point_per_layer() {
    let model = tiny();
    let (_, cache) = model
        .run_with_cache(&tokens(), "blocks.*.attn.hook_pattern")
        .unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.require(&HookPoint::pattern(1)).unwrap().dims(), &[1, 2, 4, 4]);
}

#[test]
fn hook_names_round_trip() {
    for point in tiny().hook_points() {
        let parsed: HookPoint = point.to_string().parse().unwrap();
        assert_eq!(parsed, point);
    }
}
