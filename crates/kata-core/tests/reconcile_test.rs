// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the scaling reconciler.

use std::collections::BTreeMap;

use kata_core::manifest::Manifest;
use kata_core::reconcile::{Deltas, ScaleError, reconcile};
use kata_core::topology::ScalingRecord;

fn web_only() -> Manifest {
    Manifest::from_commands([("web", "run-app")])
}

fn record(pairs: &[(&str, u32)]) -> ScalingRecord {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn deltas(pairs: &[(&str, i64)]) -> Deltas {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn ordinals(pairs: &[(&str, &[u32])]) -> BTreeMap<String, Vec<u32>> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect()
}

#[test]
fn test_fresh_deploy() {
    let plan = reconcile(&web_only(), &Deltas::new(), None).unwrap();
    assert_eq!(plan.to_create, ordinals(&[("web", &[1])]));
    assert!(plan.to_destroy.is_empty());
    assert_eq!(plan.new_counts, record(&[("web", 1)]));
}

#[test]
fn test_rerun_resubmits_everything_and_destroys_nothing() {
    let manifest = Manifest::from_commands([("web", "run-app"), ("worker", "jobs")]);
    let previous = record(&[("web", 3), ("worker", 2)]);

    let first = reconcile(&manifest, &Deltas::new(), Some(&previous)).unwrap();
    let second = reconcile(&manifest, &Deltas::new(), Some(&first.new_counts)).unwrap();

    assert_eq!(first, second);
    assert_eq!(second.to_create, ordinals(&[("web", &[1, 2, 3]), ("worker", &[1, 2])]));
    assert!(second.to_destroy.is_empty());
    assert_eq!(second.new_counts, previous);
}

#[test]
fn test_positive_delta_grows_from_baseline() {
    for n in 0..4u32 {
        for k in 1..4i64 {
            let previous = record(&[("web", n)]);
            let plan = reconcile(&web_only(), &deltas(&[("web", k)]), Some(&previous)).unwrap();
            let expected: Vec<u32> = (1..=n + k as u32).collect();
            assert_eq!(plan.to_create["web"], expected);
            assert!(plan.to_destroy.is_empty());
        }
    }
}

#[test]
fn test_negative_delta_removes_highest_ordinals_first() {
    for n in 1..5u32 {
        for k in 1..=n {
            let previous = record(&[("web", n)]);
            let plan =
                reconcile(&web_only(), &deltas(&[("web", -(k as i64))]), Some(&previous)).unwrap();
            let destroyed: Vec<u32> = (n - k + 1..=n).rev().collect();
            let kept: Vec<u32> = (1..=n - k).collect();
            assert_eq!(plan.to_destroy["web"], destroyed);
            assert_eq!(plan.to_create["web"], kept);
            assert_eq!(plan.new_counts["web"], n - k);
        }
    }
}

#[test]
fn test_over_scale_down_is_rejected() {
    let previous = record(&[("web", 2)]);
    let result = reconcile(&web_only(), &deltas(&[("web", -3)]), Some(&previous));
    assert_eq!(
        result,
        Err(ScaleError::BelowZero {
            role: "web".to_string(),
            requested: -1,
        })
    );

    // First deploy baseline is 1.
    assert!(reconcile(&web_only(), &deltas(&[("web", -2)]), None).is_err());
}

#[test]
fn test_unknown_role_is_rejected() {
    let result = reconcile(&web_only(), &deltas(&[("worker", 1)]), None);
    assert_eq!(result, Err(ScaleError::UnknownRole("worker".to_string())));
}

#[test]
fn test_scale_up_then_down() {
    let up = reconcile(&web_only(), &deltas(&[("web", 2)]), Some(&record(&[("web", 1)]))).unwrap();
    assert_eq!(up.to_create["web"], vec![1, 2, 3]);
    assert_eq!(up.new_counts, record(&[("web", 3)]));

    let down = reconcile(&web_only(), &deltas(&[("web", -2)]), Some(&up.new_counts)).unwrap();
    assert_eq!(down.to_destroy["web"], vec![3, 2]);
    assert_eq!(down.to_create["web"], vec![1]);
    assert_eq!(down.new_counts, record(&[("web", 1)]));
}

#[test]
fn test_zero_delta_is_ignored() {
    let previous = record(&[("web", 2)]);
    let plan = reconcile(&web_only(), &deltas(&[("web", 0)]), Some(&previous)).unwrap();
    assert_eq!(plan.to_create["web"], vec![1, 2]);
    assert!(plan.to_destroy.is_empty());
}

#[test]
fn test_cron_roles_count_like_any_other() {
    let manifest = Manifest::from_commands([("cron_nightly", "0 3 * * * ./job.sh")]);
    let plan = reconcile(&manifest, &deltas(&[("cron_nightly", 1)]), None).unwrap();
    assert_eq!(plan.to_create["cron_nightly"], vec![1, 2]);
}
