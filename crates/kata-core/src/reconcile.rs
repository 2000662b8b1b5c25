// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scaling reconciliation.
//!
//! Turns the declared roles, a signed per-role delta and the persisted scaling
//! record into the ordinals to (re)submit and the ordinals to tear down.
//!
//! - The baseline count of a role is its persisted count, or 1 on first deploy.
//! - Every ordinal `1..=new_count` is (re)submitted; the materializer is
//!   idempotent so unchanged workers are left alone.
//! - Scale-down removes the highest ordinals first.
//! - `static` roles are counted but never materialized.
//!
//! Requests are validated as a whole before anything is computed: a plan is
//! either produced for every role or not at all.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::manifest::{Manifest, RoleKind};
use crate::topology::ScalingRecord;

/// Signed per-role change in replica count.
pub type Deltas = BTreeMap<String, i64>;

/// Errors in a scale request.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ScaleError {
    /// A `name=count` token could not be parsed.
    #[error("malformed setting '{0}'")]
    Malformed(String),

    /// The resulting count would be negative.
    #[error("cannot scale type '{role}' below 0 (requested {requested})")]
    BelowZero {
        /// Role being scaled
        role: String,
        /// Resulting count that was requested
        requested: i64,
    },

    /// The resulting count does not fit a replica count.
    #[error("cannot scale type '{role}' to {requested}")]
    OutOfRange {
        /// Role being scaled
        role: String,
        /// Resulting count that was requested
        requested: i64,
    },

    /// The request names a role the app does not declare.
    #[error("worker type '{0}' not present in app")]
    UnknownRole(String),
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScalePlan {
    /// Ordinals to submit, ascending, per supervised role
    pub to_create: BTreeMap<String, Vec<u32>>,
    /// Ordinals to tear down, descending, per role
    pub to_destroy: BTreeMap<String, Vec<u32>>,
    /// Scaling record to persist before any side effect
    pub new_counts: ScalingRecord,
}

impl ScalePlan {
    /// Number of ordinals to submit.
    pub fn create_count(&self) -> usize {
        self.to_create.values().map(Vec::len).sum()
    }

    /// Number of ordinals to tear down.
    pub fn destroy_count(&self) -> usize {
        self.to_destroy.values().map(Vec::len).sum()
    }
}

fn resulting_count(role: &str, baseline: u32, delta: i64) -> Result<u32, ScaleError> {
    let requested = i64::from(baseline) + delta;
    if requested < 0 {
        return Err(ScaleError::BelowZero {
            role: role.to_string(),
            requested,
        });
    }
    u32::try_from(requested).map_err(|_| ScaleError::OutOfRange {
        role: role.to_string(),
        requested,
    })
}

/// Compute the create and destroy sets for an app.
///
/// Roles recorded in `previous` but no longer declared are torn down entirely
/// and dropped from the new record.
pub fn reconcile(
    desired: &Manifest,
    deltas: &Deltas,
    previous: Option<&ScalingRecord>,
) -> Result<ScalePlan, ScaleError> {
    let baseline = |role: &str| previous.and_then(|p| p.get(role)).copied().unwrap_or(1);

    for (role, delta) in deltas {
        if desired.role(role).is_none() {
            return Err(ScaleError::UnknownRole(role.clone()));
        }
        resulting_count(role, baseline(role), *delta)?;
    }

    let mut plan = ScalePlan::default();

    for role in desired.roles() {
        let current = baseline(&role.name);
        let delta = deltas.get(&role.name).copied().unwrap_or(0);
        let count = resulting_count(&role.name, current, delta)?;
        plan.new_counts.insert(role.name.clone(), count);

        if role.kind == RoleKind::Static {
            continue;
        }
        plan.to_create
            .insert(role.name.clone(), (1..=count).collect());
        if delta < 0 {
            plan.to_destroy
                .insert(role.name.clone(), (count + 1..=current).rev().collect());
        }
    }

    if let Some(previous) = previous {
        for (role, &count) in previous {
            let gone = desired.role(role).is_none();
            if gone && count > 0 && RoleKind::from_name(role) != RoleKind::Static {
                plan.to_destroy
                    .insert(role.clone(), (1..=count).rev().collect());
            }
        }
    }

    Ok(plan)
}

/// Turn absolute `name=count` tokens into deltas against `current`.
pub fn parse_scale_request<S: AsRef<str>>(
    tokens: &[S],
    current: &ScalingRecord,
) -> Result<Deltas, ScaleError> {
    let mut deltas = Deltas::new();

    for token in tokens {
        let token = token.as_ref();
        let (name, count) = token
            .split_once('=')
            .ok_or_else(|| ScaleError::Malformed(token.to_string()))?;
        let (name, count) = (name.trim(), count.trim());
        let count: i64 = count
            .parse()
            .map_err(|_| ScaleError::Malformed(token.to_string()))?;
        if count < 0 {
            return Err(ScaleError::BelowZero {
                role: name.to_string(),
                requested: count,
            });
        }
        let Some(&existing) = current.get(name) else {
            return Err(ScaleError::UnknownRole(name.to_string()));
        };
        deltas.insert(name.to_string(), count - i64::from(existing));
    }

    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, u32)]) -> ScalingRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_static_role_counted_but_not_materialized() {
        let manifest = Manifest::from_commands([("web", "run"), ("static", "public")]);
        let plan = reconcile(&manifest, &Deltas::new(), None).unwrap();
        assert_eq!(plan.new_counts, record(&[("static", 1), ("web", 1)]));
        assert!(!plan.to_create.contains_key("static"));
        assert_eq!(plan.to_create["web"], vec![1]);
    }

    #[test]
    fn test_removed_role_is_torn_down() {
        let manifest = Manifest::from_commands([("web", "run")]);
        let previous = record(&[("web", 1), ("worker", 3), ("static", 1)]);
        let plan = reconcile(&manifest, &Deltas::new(), Some(&previous)).unwrap();
        assert_eq!(plan.to_destroy["worker"], vec![3, 2, 1]);
        assert!(!plan.to_destroy.contains_key("static"));
        assert_eq!(plan.new_counts, record(&[("web", 1)]));
    }

    #[test]
    fn test_scale_to_zero() {
        let manifest = Manifest::from_commands([("worker", "run")]);
        let previous = record(&[("worker", 2)]);
        let deltas: Deltas = [("worker".to_string(), -2)].into_iter().collect();
        let plan = reconcile(&manifest, &deltas, Some(&previous)).unwrap();
        assert!(plan.to_create["worker"].is_empty());
        assert_eq!(plan.to_destroy["worker"], vec![2, 1]);
        assert_eq!(plan.new_counts["worker"], 0);
        assert_eq!(plan.create_count(), 0);
        assert_eq!(plan.destroy_count(), 2);
    }

    #[test]
    fn test_validation_happens_before_any_role() {
        let manifest = Manifest::from_commands([("a", "run"), ("b", "run")]);
        let deltas: Deltas = [("a".to_string(), 1), ("zzz".to_string(), 1)]
            .into_iter()
            .collect();
        assert_eq!(
            reconcile(&manifest, &deltas, None),
            Err(ScaleError::UnknownRole("zzz".to_string()))
        );
    }

    #[test]
    fn test_parse_scale_request_absolute_counts() {
        let current = record(&[("web", 2), ("worker", 1)]);
        let deltas = parse_scale_request(&["web=5", " worker = 0 "], &current).unwrap();
        assert_eq!(deltas["web"], 3);
        assert_eq!(deltas["worker"], -1);
    }

    #[test]
    fn test_parse_scale_request_errors() {
        let current = record(&[("web", 2)]);
        assert_eq!(
            parse_scale_request(&["web"], &current),
            Err(ScaleError::Malformed("web".to_string()))
        );
        assert_eq!(
            parse_scale_request(&["web=lots"], &current),
            Err(ScaleError::Malformed("web=lots".to_string()))
        );
        assert!(matches!(
            parse_scale_request(&["web=-1"], &current),
            Err(ScaleError::BelowZero { .. })
        ));
        assert_eq!(
            parse_scale_request(&["db=1"], &current),
            Err(ScaleError::UnknownRole("db".to_string()))
        );
    }
}
