// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor module - worker supervision backends.

pub mod mock;
pub mod systemd;
mod traits;

pub use mock::{MockSupervisor, SupervisorCall};
pub use systemd::SystemdSupervisor;
pub use traits::*;
