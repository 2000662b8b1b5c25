// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status line rendering.

use clap::ValueEnum;
use kata_core::notice::{Notice, Notices, Severity};
use owo_colors::OwoColorize;
use supports_color::Stream;

/// When to colour status lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum Color {
    Always,
    Never,
    #[default]
    Auto,
}

/// Writes prefixed status lines to stdout.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    color: bool,
}

impl Printer {
    pub fn new(choice: Color) -> Self {
        let color = match choice {
            Color::Always => true,
            Color::Never => false,
            Color::Auto => supports_color::on_cached(Stream::Stdout).is_some(),
        };
        Self { color }
    }

    pub fn uses_color(&self) -> bool {
        self.color
    }

    pub fn format(&self, severity: Severity, message: &str) -> String {
        let prefix = match severity {
            Severity::Success => "----->",
            Severity::Warning => "=====>",
            Severity::Error => "Error:",
        };
        if !self.color {
            return format!("{prefix} {message}");
        }
        match severity {
            Severity::Success => format!("{} {message}", prefix.green()),
            Severity::Warning => format!("{} {message}", prefix.yellow()),
            Severity::Error => format!("{} {message}", prefix.red().bold()),
        }
    }

    pub fn notice(&self, notice: &Notice) {
        println!("{}", self.format(notice.severity, &notice.message));
    }

    pub fn notices(&self, notices: &Notices) {
        for notice in notices.iter() {
            self.notice(notice);
        }
    }

    pub fn warning(&self, message: &str) {
        println!("{}", self.format(Severity::Warning, message));
    }

    pub fn error(&self, message: &str) {
        println!("{}", self.format(Severity::Error, message));
    }
}
