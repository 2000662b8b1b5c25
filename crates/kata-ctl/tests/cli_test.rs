// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests that run the `kata` binary.

use std::process::Command;

use tempfile::TempDir;

#[test]
fn test_log_filter_comes_from_dotenv() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join(".env"),
        format!(
            "RUST_LOG=kata=debug\nHOME={home}\nKATA_ROOT={home}/kata\n",
            home = temp.path().display()
        ),
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_kata"))
        .args(["--color", "never", "apps"])
        .current_dir(temp.path())
        .env_remove("RUST_LOG")
        .output()
        .unwrap();

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Loaded .env"), "{stderr}");
}

#[test]
fn test_destroy_requires_confirmation() {
    let temp = TempDir::new().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_kata"))
        .args(["--color", "never", "destroy", "shop"])
        .current_dir(temp.path())
        .env("HOME", temp.path())
        .env("KATA_ROOT", temp.path().join("kata"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "Error: refusing to destroy 'shop' without --yes\n"
    );
}
