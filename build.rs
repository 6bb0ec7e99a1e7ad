//! Embeds `BUILD_TIMESTAMP` and `BUILD_GIT_SHA` for `diagnostics::build_info`.

use chrono::{SecondsFormat, Utc};
use std::process::Command;

fn main() {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    println!("cargo:rustc-env=BUILD_TIMESTAMP={timestamp}");
    println!("cargo:rustc-env=BUILD_GIT_SHA={}", git_short_sha());

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}

fn git_short_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|sha| sha.trim().to_string())
        .filter(|sha| !sha.is_empty())
        .unwrap_or_else(|| "unknown".into())
}
