// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! kata - operator CLI
//!
//! Thin layer over `kata-core`: each subcommand is one core call rendered as
//! status lines. The exit status is non-zero when the operation did not fully
//! succeed.
//!
//! ```text
//! kata deploy shop
//! kata ps:scale shop web=3 worker=1
//! kata config:set shop CADDY_DOMAIN=shop.example.com
//! ```

mod render;

use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kata_core::app::AppName;
use kata_core::settings::render as render_settings;
use kata_core::{Config, DeployReport, Deployer};
use tracing::debug;

use render::{Color, Printer};

#[derive(Parser, Debug)]
#[command(name = "kata", version, about = "Single-host application deployment")]
struct Cli {
    /// Colour status lines.
    #[arg(long, value_enum, default_value_t = Color::Auto, global = true)]
    color: Color,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// List apps; running ones are marked with `*`.
    Apps,

    /// Show the operator settings of an app.
    Config { app: String },

    /// Show one operator setting.
    #[command(name = "config:get")]
    ConfigGet { app: String, key: String },

    /// Set operator settings and redeploy.
    #[command(name = "config:set")]
    ConfigSet {
        app: String,
        /// `KEY=VALUE` pairs
        #[arg(required = true)]
        settings: Vec<String>,
    },

    /// Remove operator settings and redeploy.
    #[command(name = "config:unset")]
    ConfigUnset {
        app: String,
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Show the resolved environment of the last deploy.
    #[command(name = "config:live")]
    ConfigLive { app: String },

    /// Deploy an app.
    Deploy { app: String },

    /// Remove an app, keeping its data and cache.
    Destroy {
        app: String,
        /// Confirm the removal.
        #[arg(long)]
        yes: bool,
    },

    /// Show worker counts and unit states.
    Ps { app: String },

    /// Scale roles to absolute counts and redeploy.
    #[command(name = "ps:scale")]
    PsScale {
        app: String,
        /// `role=count` pairs
        #[arg(required = true)]
        counts: Vec<String>,
    },

    /// Restart every worker of an app.
    Restart { app: String },

    /// Stop every worker of an app.
    Stop { app: String },

    /// Show the app's entry in the proxy document.
    #[command(name = "proxy:show")]
    ProxyShow { app: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Loaded before the filter is built so RUST_LOG may come from .env.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    let printer = Printer::new(cli.color);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kata_core=info,kata=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(printer.uses_color())
        .init();

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "Loaded .env"),
        Err(e) => debug!("No .env file loaded: {}", e),
    }

    match run(cli.command, &printer).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            printer.error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

fn deploy_outcome(printer: &Printer, report: &DeployReport) -> bool {
    printer.notices(&report.notices);
    report.is_success()
}

async fn run(command: Command, out: &Printer) -> anyhow::Result<bool> {
    let config = Config::from_env().context("loading configuration")?;
    let deployer = Deployer::builder(config).build()?;
    let app = |raw: &str| AppName::new(raw).map_err(anyhow::Error::from);

    match command {
        Command::Apps => {
            for listing in deployer.apps().await? {
                let marker = if listing.running { "*" } else { " " };
                println!("{marker}{}", listing.app);
            }
            Ok(true)
        }
        Command::Config { app: name } => {
            print!("{}", render_settings(&deployer.config_show(&app(&name)?).await?, '='));
            Ok(true)
        }
        Command::ConfigGet { app: name, key } => {
            match deployer.config_get(&app(&name)?, &key).await? {
                Some(value) => {
                    println!("{value}");
                    Ok(true)
                }
                None => {
                    out.warning(&format!("{key} is not set for '{name}'"));
                    Ok(false)
                }
            }
        }
        Command::ConfigSet { app: name, settings } => {
            let report = deployer.config_set(&app(&name)?, &settings).await?;
            Ok(deploy_outcome(out, &report))
        }
        Command::ConfigUnset { app: name, keys } => {
            let report = deployer.config_unset(&app(&name)?, &keys).await?;
            Ok(deploy_outcome(out, &report))
        }
        Command::ConfigLive { app: name } => {
            let live = deployer.config_live(&app(&name)?).await?;
            if live.is_empty() {
                out.warning(&format!("'{name}' has not been deployed yet"));
                return Ok(false);
            }
            print!("{}", render_settings(&live, '='));
            Ok(true)
        }
        Command::Deploy { app: name } => {
            let report = deployer.deploy(&app(&name)?, &Default::default()).await?;
            Ok(deploy_outcome(out, &report))
        }
        Command::Destroy { app: name, yes } => {
            if !yes {
                out.error(&format!("refusing to destroy '{name}' without --yes"));
                return Ok(false);
            }
            let notices = deployer.destroy(&app(&name)?).await?;
            out.notices(&notices);
            Ok(!notices.has_errors())
        }
        Command::Ps { app: name } => {
            let status = deployer.ps(&app(&name)?).await?;
            print!("{}", render_settings(&status.scaling, ':'));
            for unit in &status.units {
                let state = if unit.active { "active" } else { "inactive" };
                println!("{}\t{state}", unit.unit);
            }
            Ok(true)
        }
        Command::PsScale { app: name, counts } => {
            let report = deployer.scale(&app(&name)?, &counts).await?;
            Ok(deploy_outcome(out, &report))
        }
        Command::Restart { app: name } => {
            let notices = deployer.restart(&app(&name)?).await?;
            out.notices(&notices);
            Ok(!notices.has_errors())
        }
        Command::Stop { app: name } => {
            let notices = deployer.stop(&app(&name)?).await?;
            out.notices(&notices);
            Ok(!notices.has_errors())
        }
        Command::ProxyShow { app: name } => match deployer.proxy_show(&app(&name)?).await? {
            Some(entry) => {
                println!("{}", serde_json::to_string_pretty(&entry)?);
                Ok(true)
            }
            None => {
                out.warning(&format!("no proxy entry for '{name}'"));
                Ok(false)
            }
        },
    }
}
