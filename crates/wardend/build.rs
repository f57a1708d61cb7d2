//! Build script for wardend.
//!
//! Sets:
//! - WARDEN_VERSION: release version (overridable from the environment)
//! - WARDEN_GIT_SHA: short git commit hash
//! - WARDEN_BUILD_DATE: UTC build date

use std::process::Command;

fn main() {
    let version =
        std::env::var("WARDEN_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());

    let git_sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let build_date = chrono::Utc::now().format("%Y-%m-%d").to_string();

    println!("cargo:rustc-env=WARDEN_VERSION={}", version);
    println!("cargo:rustc-env=WARDEN_GIT_SHA={}", git_sha);
    println!("cargo:rustc-env=WARDEN_BUILD_DATE={}", build_date);

    println!("cargo:rerun-if-changed=Cargo.toml");
    println!("cargo:rerun-if-env-changed=WARDEN_VERSION");
}
