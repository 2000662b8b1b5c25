// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! systemd supervision backend.
//!
//! Renders workers as user units (`.service`, `.timer`, podman quadlet
//! `.container`) and drives them through `systemctl --user`.

mod supervisor;
mod unit;

pub use supervisor::SystemdSupervisor;
pub use unit::{RenderedUnit, UnitFile, UnitKind, UnitSection, read_fingerprint, render_units};
