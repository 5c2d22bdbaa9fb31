//! Device discovery via sysfs.

use std::path::Path;

use anyhow::{Context, Result};

use super::RULE;

/// PCI vendor id of SLASH cards.
const VENDOR_ID: u16 = 0x10EE;
/// PCI device id of SLASH cards.
const DEVICE_ID: u16 = 0x50B4;

/// Lists matching devices under `/sys/bus/pci/devices`.
pub fn run() -> Result<()> {
    println!("{RULE}");
    println!("Listing SLASH devices");
    println!("{RULE}");
    scan(Path::new("/sys/bus/pci/devices"))
}

fn scan(sysfs: &Path) -> Result<()> {
    let entries = std::fs::read_dir(sysfs)
        .with_context(|| format!("reading {}", sysfs.display()))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(vendor) = read_id(&path.join("vendor")) else {
            continue;
        };
        let Some(device) = read_id(&path.join("device")) else {
            continue;
        };
        if vendor == VENDOR_ID && device == DEVICE_ID {
            println!(
                "SLASH device found with BDF: {}",
                entry.file_name().to_string_lossy()
            );
            println!("{RULE}");
        }
    }
    Ok(())
}

/// Reads a sysfs `0x....` id file.
fn read_id(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    let hex = text.strip_prefix("0x").unwrap_or(text);
    u16::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_files_parse_with_and_without_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vendor");
        std::fs::write(&path, "0x10ee\n").unwrap();
        assert_eq!(read_id(&path), Some(0x10EE));
        std::fs::write(&path, "50b4").unwrap();
        assert_eq!(read_id(&path), Some(0x50B4));
    }

    #[test]
    fn scan_skips_directories_without_id_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("0000:00:1f.0")).unwrap();
        scan(dir.path()).unwrap();
    }
}
