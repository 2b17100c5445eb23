//! Captures build metadata for the `getVersionBanner` command.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    println!("cargo:rustc-env=DOCK_BUILD_TIMESTAMP={stamp}");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".into());
    let toolchain = Command::new(rustc)
        .arg("-V")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown toolchain".into());
    println!("cargo:rustc-env=DOCK_RUSTC_VERSION={toolchain}");
}
