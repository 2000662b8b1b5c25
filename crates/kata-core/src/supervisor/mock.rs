// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock supervisor for testing.
//!
//! Keeps installed units in memory and records every call, without touching
//! systemd.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::app::AppName;

/// A call made against the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCall {
    /// `apply` for a worker
    Apply(WorkerId),
    /// `remove` for a worker
    Remove(WorkerId),
    /// `stop_app`
    Stop(AppName),
    /// `restart_app`
    Restart(AppName),
}

/// Mock supervisor for testing.
#[derive(Default)]
pub struct MockSupervisor {
    installed: Arc<Mutex<BTreeMap<WorkerId, String>>>,
    calls: Arc<Mutex<Vec<SupervisorCall>>>,
    failing: HashSet<(String, u32)>,
}

impl MockSupervisor {
    /// Create a new mock supervisor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `apply` and `remove` fail for one ordinal of a role.
    pub fn failing_on(mut self, role: &str, ordinal: u32) -> Self {
        self.failing.insert((role.to_string(), ordinal));
        self
    }

    /// Install a worker as if a previous run had applied it.
    pub async fn preinstall(&self, worker: &WorkerDescriptor) {
        self.installed
            .lock()
            .await
            .insert(worker.id.clone(), worker.fingerprint());
    }

    /// Ids of installed workers, in order.
    pub async fn installed(&self) -> Vec<WorkerId> {
        self.installed.lock().await.keys().cloned().collect()
    }

    /// Calls made so far, in order.
    pub async fn calls(&self) -> Vec<SupervisorCall> {
        self.calls.lock().await.clone()
    }

    fn check(&self, id: &WorkerId) -> Result<()> {
        if self.failing.contains(&(id.role.clone(), id.ordinal)) {
            return Err(SupervisorError::Other(format!("mock failure for {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    fn backend(&self) -> &'static str {
        "mock"
    }

    async fn apply(&self, worker: &WorkerDescriptor) -> Result<ApplyOutcome> {
        self.calls
            .lock()
            .await
            .push(SupervisorCall::Apply(worker.id.clone()));
        self.check(&worker.id)?;

        let fingerprint = worker.fingerprint();
        let mut installed = self.installed.lock().await;
        let outcome = match installed.get(&worker.id) {
            Some(existing) if *existing == fingerprint => ApplyOutcome::Unchanged,
            Some(_) => ApplyOutcome::Replaced,
            None => ApplyOutcome::Created,
        };
        installed.insert(worker.id.clone(), fingerprint);
        Ok(outcome)
    }

    async fn remove(&self, id: &WorkerId) -> Result<bool> {
        self.calls
            .lock()
            .await
            .push(SupervisorCall::Remove(id.clone()));
        self.check(id)?;
        Ok(self.installed.lock().await.remove(id).is_some())
    }

    async fn list(&self, app: &AppName) -> Result<Vec<UnitStatus>> {
        Ok(self
            .installed
            .lock()
            .await
            .keys()
            .filter(|id| id.app == *app)
            .map(|id| UnitStatus {
                unit: format!("{}.service", id.unit_stem()),
                active: true,
            })
            .collect())
    }

    async fn stop_app(&self, app: &AppName) -> Result<usize> {
        self.calls
            .lock()
            .await
            .push(SupervisorCall::Stop(app.clone()));
        let mut installed = self.installed.lock().await;
        let before = installed.len();
        installed.retain(|id, _| id.app != *app);
        Ok(before - installed.len())
    }

    async fn restart_app(&self, app: &AppName) -> Result<usize> {
        self.calls
            .lock()
            .await
            .push(SupervisorCall::Restart(app.clone()));
        Ok(self
            .installed
            .lock()
            .await
            .keys()
            .filter(|id| id.app == *app)
            .count())
    }
}
