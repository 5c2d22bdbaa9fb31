//! Bundle metadata inspection.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};

use slash_sysmap::SystemMap;

use super::RULE;
use crate::cli::InspectArgs;

/// Extracts the bundle into the cache directory and prints its metadata.
pub fn run(args: &InspectArgs) -> Result<()> {
    if !args.vrtbin.exists() {
        bail!("{} does not exist", args.vrtbin.display());
    }
    let cache = slash_rt::paths::cache_dir().context("resolving cache directory")?;

    let output = Command::new("tar")
        .arg("-xvf")
        .arg(&args.vrtbin)
        .arg("-C")
        .arg(&cache)
        .output()
        .context("running tar")?;
    if !output.status.success() {
        bail!(
            "extraction failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let map = SystemMap::load(&cache.join("system_map.xml")).context("parsing system map")?;

    println!("{RULE}");
    println!("VRTBIN Information");
    println!("{RULE}");
    println!("{:<28}| {:?}", "Platform", map.platform);
    println!("{:<28}| {:?}", "Type", map.bundle_type);
    println!("{:<28}| {} Hz", "Max clock frequency", map.clock_frequency);
    println!();

    print_version_info(&cache.join("version.json"));

    for kernel in map.kernels.values() {
        println!("{RULE}");
        println!("Kernel Information");
        println!("{RULE}");
        println!("{:<28}| {}", "Kernel name", kernel.name);
        println!("{:<28}| {:#x}", "Base address", kernel.base_addr);
        println!("{:<28}| {:#x}", "Range", kernel.range);
        println!("{:<28}| {}", "Registers", kernel.registers.len());
        println!();
    }

    if !map.qdma_connections.is_empty() {
        println!("{RULE}");
        println!("Stream Connections");
        println!("{RULE}");
        for connection in &map.qdma_connections {
            println!(
                "{:<28}| qid {} ({})",
                format!("{}/{}", connection.kernel, connection.interface),
                connection.qid,
                connection.direction,
            );
        }
    }
    Ok(())
}

/// Prints the key/value pairs of `version.json` line-wise. The file is an
/// external contract scanned the same way the runtime scans it for the
/// logic UUID, so a malformed file degrades to silence, not failure.
fn print_version_info(version_json: &Path) {
    let Ok(contents) = std::fs::read_to_string(version_json) else {
        return;
    };
    println!("{RULE}");
    println!("Version Information");
    println!("{RULE}");
    for line in contents.lines() {
        let line = line.trim().trim_end_matches(',');
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().trim_matches('"');
        let value = value.trim().trim_matches('"');
        if !key.is_empty() {
            println!("{key:<28}| {value}");
        }
    }
    println!();
}
