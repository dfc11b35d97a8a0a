//! Build script for trapdoor-core
//!
//! This script checks build requirements before compilation:
//! - Minimum Rust version
//! - Target operating system (the engine drives Linux `ptrace`)
//! - Target architecture (x86-64, AArch64 and RISC-V 64 have profiles)
//!
//! Unsupported targets only produce warnings: the profile tables and the
//! classification logic are portable, and cross-checking them from another
//! host is useful.

use std::env;

/// `let ... else`, `Option::is_some_and`, `<*const T>::cast_mut`
const MIN_RUST_VERSION: &str = "1.70.0";

const PROFILED_ARCHITECTURES: [&str; 3] = ["x86_64", "aarch64", "riscv64"];

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    match (rustc_version::version(), rustc_version::Version::parse(MIN_RUST_VERSION)) {
        (Ok(found), Ok(minimum)) => {
            if found < minimum {
                panic!("trapdoor-core requires Rust {minimum} or newer, found {found}");
            }
        }
        // If we can't get version (e.g., in some build environments), just warn
        _ => println!("cargo:warning=could not verify Rust version"),
    }

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "linux" {
        println!("cargo:warning=trapdoor-core traces processes through Linux ptrace; target OS `{target_os}` is not supported");
    }

    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if !PROFILED_ARCHITECTURES.contains(&target_arch.as_str()) {
        println!("cargo:warning=no architecture profile for `{target_arch}`; only foreign tracees of a profiled ISA can be traced");
    }
}
