use std::env;
use std::process::Command;

fn main() {
    embuild::espidf::sysenv::output();

    // Full git version (e.g. "v0.3.0" or "v0.3.0-4-gabcdef") for the boot banner
    let git_version = Command::new("git")
        .args(["describe", "--tags", "--always"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .or_else(|| env::var("CARGO_PKG_VERSION").ok())
        .unwrap_or_default();
    println!("cargo:rustc-env=GIT_VERSION={}", git_version.trim());
    // Rebuild when HEAD moves or tags change
    println!("cargo:rerun-if-changed=../.git/HEAD");
    println!("cargo:rerun-if-changed=../.git/refs/tags");

    // Wi-Fi credentials baked into the default configuration
    println!("cargo:rerun-if-env-changed=ECOWATT_WIFI_SSID");
    println!("cargo:rerun-if-env-changed=ECOWATT_WIFI_PASSWORD");
    println!("cargo:rerun-if-env-changed=ECOWATT_API_BASE");
}
