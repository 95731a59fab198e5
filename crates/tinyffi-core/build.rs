//! Build script for tinyffi-core
//!
//! This script checks system requirements before compilation:
//! - Minimum Rust version (stable `asm!`/`global_asm!` and `let ... else`)
//! - Whether the host has a native call backend
//!
//! ## Requirements
//!
//! - **Rust**: 1.65.0 or newer
//! - **Backends**: x86-64 or AArch64 on a Unix-like OS

fn main()
{
    // asm!/global_asm! were stabilised in 1.59, let-else in 1.65
    if let Ok(rustc_version) = rustc_version::version() {
        let min_rust_version = rustc_version::Version::new(1, 65, 0);

        if rustc_version < min_rust_version {
            panic!(
                "tinyffi-core requires Rust {} or newer, found {}",
                min_rust_version, rustc_version
            );
        }
    } else {
        // If we can't get version (e.g., in some build environments), just warn
        println!("cargo:warning=could not verify Rust version");
    }

    check_native_backend();
}

fn check_native_backend()
{
    // Cargo describes the target (not the build host) through these variables
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let family = std::env::var("CARGO_CFG_TARGET_FAMILY").unwrap_or_default();

    let has_arch = matches!(arch.as_str(), "x86_64" | "aarch64");
    let has_platform = family.split(',').any(|f| f == "unix");

    if !(has_arch && has_platform) {
        println!(
            "cargo:warning=no native backend for {} ({}); only register maps and custom modules are available",
            arch, family
        );
    }
}
