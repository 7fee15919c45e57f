use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

/// Environment variable the privileged tests read the sampler object path from
const OBJECT_ENV: &str = "EBPFSPY_BPF_OBJECT";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kernel-side sampler object loaded by `EbpfSampler`
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
    /// Build the sampler, then run the root-only session tests against it
    TestPrivileged {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target } => {
            let object = build_ebpf(&target)?;
            println!("✓ eBPF sampler built: {}", object.display());
        }
        Cmd::TestPrivileged { target } => {
            let object = build_ebpf(&target)?;
            test_privileged(&object)?;
        }
    }

    Ok(())
}

/// Always builds in release mode: debug builds pull in formatting code
/// (`LowerHex`) the BPF linker rejects.
fn build_ebpf(target: &str) -> Result<PathBuf> {
    let status = Command::new("cargo")
        .arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg("ebpfspy-ebpf")
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release")
        .status()
        .context("Failed to run cargo for the eBPF sampler")?;

    if !status.success() {
        anyhow::bail!("Failed to build eBPF sampler");
    }

    let object = PathBuf::from(format!("target/{target}/release/ebpfspy"));
    std::fs::canonicalize(&object)
        .with_context(|| format!("eBPF object missing after build: {}", object.display()))
}

fn test_privileged(object: &std::path::Path) -> Result<()> {
    let status = Command::new("cargo")
        .args(["test", "--package", "ebpfspy", "--test", "test_ebpf_session", "--", "--ignored"])
        .env(OBJECT_ENV, object)
        .status()
        .context("Failed to run privileged tests")?;

    if !status.success() {
        anyhow::bail!("Privileged tests failed (they must run as root)");
    }
    Ok(())
}
