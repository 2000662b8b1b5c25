// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kata Core - single-host worker reconciliation
//!
//! This crate deploys applications onto one host. Given an app's process
//! manifest it decides which worker instances should exist, starts and stops
//! them through the host's supervision system, and exposes the app through a
//! shared reverse-proxy document.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     kata-ctl / git hooks (glue)                      │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Deployer (deploy)                           │
//! │  ┌────────────┐  ┌─────────────┐  ┌─────────────┐  ┌──────────────┐  │
//! │  │  Manifest  │─▶│  Reconciler │─▶│ Materializer│─▶│ Proxy patcher│  │
//! │  └────────────┘  └─────────────┘  └─────────────┘  └──────────────┘  │
//! │         │               │                │                 │         │
//! │         ▼               ▼                │                 │         │
//! │  ┌────────────┐  ┌─────────────┐         │                 │         │
//! │  │ Env builder│─▶│  Topology   │         │                 │         │
//! │  └────────────┘  │    store    │         │                 │         │
//! │                  └─────────────┘         │                 │         │
//! └──────────────────────────────────────────┼─────────────────┼─────────┘
//!                                            ▼                 ▼
//!                                  ┌──────────────────┐ ┌──────────────┐
//!                                  │ systemctl --user │ │ proxy admin  │
//!                                  │  units/quadlets  │ │ GET /config/ │
//!                                  └──────────────────┘ │ POST /load   │
//!                                                       └──────────────┘
//! ```
//!
//! # Records
//!
//! | File | Contents |
//! |------|----------|
//! | `envs/<app>/SCALING` | `role:count` per role |
//! | `envs/<app>/LIVE_ENV` | resolved environment of the last deploy |
//! | `envs/<app>/ENV` | operator overrides |
//! | `apps/<app>/ENV` | environment shipped with the app |
//! | `apps/<app>/Procfile` | process manifest |
//! | `apps/<app>/caddy.json` | optional routing document |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `HOME` | Yes | - | Home directory of the deploying user |
//! | `KATA_ROOT` | No | `$HOME/.kata` | Root of all kata state |
//! | `KATA_PROXY_ADMIN_URL` | No | `http://localhost:2019` | Proxy admin endpoint |
//! | `KATA_PROXY_TIMEOUT_SECS` | No | `5` | Timeout of each proxy request |
//! | `KATA_PROXY_SERVER_PREFIX` | No | empty | Prefix of the app's server key |
//! | `KATA_SYSTEMD_USER_DIR` | No | `$HOME/.config/systemd/user` | Where units are linked |
//! | `KATA_CLOUDFLARE_IPS_URL` | No | Cloudflare API | Range listing for `CADDY_CLOUDFLARE_ACL` |
//! | `SSH_CLIENT` | No | - | Operator address added to the Cloudflare ACL |
//!
//! # Modules
//!
//! - [`reconcile`]: create and destroy sets from counts and deltas
//! - [`env_builder`]: layered environment with `$VAR` expansion
//! - [`proxy`]: fragment synthesis and the read-merge-write patch protocol
//! - [`supervisor`]: supervision backends (systemd, mock)
//! - [`deploy`]: orchestration of whole operator requests

#![deny(missing_docs)]

/// Sanitized application names.
pub mod app;

/// Host configuration loaded once from environment variables.
pub mod config;

/// Deploy, scale, stop and destroy orchestration.
pub mod deploy;

/// Runtime detection by probing the app tree.
pub mod detect;

/// Layered environment assembly.
pub mod env_builder;

/// Error types for kata-core.
pub mod error;

/// `$VAR` / `${VAR}` expansion.
pub mod expand;

/// `preflight` and `release` deploy hooks.
pub mod hooks;

/// Process manifest parsing.
pub mod manifest;

/// Turning scale plans into supervisor calls.
pub mod materialize;

/// Operator-facing status lines.
pub mod notice;

/// Reverse proxy fragments and document patching.
pub mod proxy;

/// Scaling reconciliation.
pub mod reconcile;

/// Flat `KEY=VALUE` and `role:count` files.
pub mod settings;

/// Worker supervision backends.
pub mod supervisor;

/// Per-app scaling, live and override records.
pub mod topology;

pub use config::Config;
pub use deploy::{DeployReport, Deployer};
pub use error::{Error, Result};
