//! Accelerator bundle (vrtbin) management.
//!
//! A vrtbin is an uncompressed tar archive carrying `system_map.xml` plus,
//! depending on the platform it targets, the PDI and version metadata
//! (hardware) or a `vpp_emu`/`vpp_sim` executable. Opening a bundle
//! extracts it into the per-user cache directory, classifies the platform
//! from the extracted map, and for hardware persists the metadata under
//! `$AMI_HOME/<BDF>/` and captures the image's logic UUID.
//!
//! Extraction shells out to `tar`; the external tool is the archive
//! contract, and its exit code surfaces as `BundleInvalid`.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use slash_sysmap::{Platform, SystemMap};

use crate::bdf::Bdf;
use crate::error::{Error, Result};
use crate::paths;

/// Directory layout a [`Vrtbin`] extracts into and persists under.
///
/// Resolved from the environment by [`Dirs::from_env`]; tests construct it
/// directly.
#[derive(Debug, Clone)]
pub struct Dirs {
    /// Extraction target (the per-user cache directory).
    pub cache: PathBuf,
    /// Per-BDF metadata root (`$AMI_HOME`), when set.
    pub ami_home: Option<PathBuf>,
}

impl Dirs {
    /// Resolves the cache directory and `$AMI_HOME` from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            cache: paths::cache_dir()?,
            ami_home: paths::ami_home(),
        })
    }
}

/// An opened, extracted bundle.
#[derive(Debug)]
pub struct Vrtbin {
    platform: Platform,
    system_map: PathBuf,
    pdi: Option<PathBuf>,
    executable: Option<PathBuf>,
    uuid: String,
}

impl Vrtbin {
    /// Opens the bundle at `path` for device `bdf`.
    ///
    /// Extracts the archive, reads the system map to classify the
    /// platform, and performs the platform-specific bookkeeping. For
    /// hardware bundles `$AMI_HOME` must be set; emulation and simulation
    /// bundles never touch it.
    pub fn open(path: &Path, bdf: &Bdf, dirs: &Dirs) -> Result<Self> {
        if !path.exists() {
            return Err(Error::BundleInvalid {
                path: path.to_path_buf(),
                reason: "archive does not exist".into(),
            });
        }

        extract(path, &dirs.cache)?;

        let extracted_map = dirs.cache.join("system_map.xml");
        let map = SystemMap::load(&extracted_map)?;
        debug!(platform = ?map.platform, "bundle classified");

        match map.platform {
            Platform::Hardware => {
                let ami_home = dirs.ami_home.as_ref().ok_or_else(|| Error::BundleInvalid {
                    path: path.to_path_buf(),
                    reason: "AMI_HOME environment variable not set".into(),
                })?;
                let metadata_dir = ami_home.join(bdf.to_string());
                std::fs::create_dir_all(&metadata_dir).map_err(|e| {
                    Error::os(format!("creating {}", metadata_dir.display()), e)
                })?;

                for name in ["system_map.xml", "version.json", "report_utilization.xml"] {
                    copy(&dirs.cache.join(name), &metadata_dir.join(name))?;
                }

                let uuid = extract_uuid(&dirs.cache.join("version.json"));
                info!(%bdf, uuid, "hardware bundle opened");
                Ok(Self {
                    platform: map.platform,
                    system_map: metadata_dir.join("system_map.xml"),
                    pdi: Some(dirs.cache.join("design.pdi")),
                    executable: None,
                    uuid,
                })
            }
            Platform::Emulation | Platform::Simulation => {
                let exec = if map.platform == Platform::Emulation {
                    "vpp_emu"
                } else {
                    "vpp_sim"
                };
                Ok(Self {
                    platform: map.platform,
                    system_map: extracted_map,
                    pdi: None,
                    executable: Some(dirs.cache.join(exec)),
                    uuid: String::new(),
                })
            }
        }
    }

    /// Platform the bundle targets.
    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Path to the authoritative system map for this bundle.
    pub fn system_map_path(&self) -> &Path {
        &self.system_map
    }

    /// Path to the PDI (hardware bundles only).
    pub fn pdi_path(&self) -> Option<&Path> {
        self.pdi.as_deref()
    }

    /// Path to the emulation/simulation executable.
    pub fn executable_path(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    /// Logic UUID of the image, or empty when unknown.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Extracts the archive into `dest` via `tar -xvf`.
fn extract(archive: &Path, dest: &Path) -> Result<()> {
    debug!(archive = %archive.display(), dest = %dest.display(), "extracting bundle");
    let output = Command::new("tar")
        .arg("-xvf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .map_err(|e| Error::BundleInvalid {
            path: archive.to_path_buf(),
            reason: format!("failed to run tar: {e}"),
        })?;
    if !output.status.success() {
        return Err(Error::BundleInvalid {
            path: archive.to_path_buf(),
            reason: format!(
                "tar exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(())
}

fn copy(source: &Path, dest: &Path) -> Result<()> {
    debug!(source = %source.display(), dest = %dest.display(), "copying bundle file");
    std::fs::copy(source, dest)
        .map(drop)
        .map_err(|e| Error::os(format!("copying {} to {}", source.display(), dest.display()), e))
}

/// Scans `version.json` line-wise for the first `"logic_uuid"` and returns
/// the quoted value. Not a JSON parse; the file format is an external
/// contract and only this one key matters. Missing file or key yields an
/// empty UUID --- the device is then treated as carrying an unknown image.
fn extract_uuid(version_json: &Path) -> String {
    let Ok(file) = std::fs::File::open(version_json) else {
        return String::new();
    };
    for line in std::io::BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if let Some(pos) = line.find("\"logic_uuid\"") {
            let rest = &line[pos + "\"logic_uuid\"".len()..];
            let mut quotes = rest.split('"');
            quotes.next(); // before the opening quote
            if let Some(value) = quotes.next() {
                return value.to_string();
            }
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a tar archive holding the given (name, contents) entries and
    /// a `Dirs` rooted in fresh temp directories.
    fn bundle_with(entries: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf, Dirs) {
        let root = tempfile::tempdir().unwrap();
        let stage = root.path().join("stage");
        std::fs::create_dir_all(&stage).unwrap();
        for (name, contents) in entries {
            std::fs::write(stage.join(name), contents).unwrap();
        }

        let archive = root.path().join("design.vrtbin");
        let names: Vec<&str> = entries.iter().map(|(n, _)| *n).collect();
        let status = Command::new("tar")
            .arg("-cf")
            .arg(&archive)
            .arg("-C")
            .arg(&stage)
            .args(&names)
            .status()
            .unwrap();
        assert!(status.success());

        let cache = root.path().join("cache");
        let ami_home = root.path().join("ami");
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::create_dir_all(&ami_home).unwrap();
        let dirs = Dirs {
            cache,
            ami_home: Some(ami_home),
        };
        (root, archive, dirs)
    }

    fn hw_map() -> &'static str {
        "<SystemMap><Platform>Hardware</Platform><Type>Full</Type>\
         <ClockFrequency>300000000</ClockFrequency></SystemMap>"
    }

    #[test]
    fn hardware_bundle_persists_metadata_and_uuid() {
        let (_root, archive, dirs) = bundle_with(&[
            ("system_map.xml", hw_map()),
            ("design.pdi", "pdi-bytes"),
            (
                "version.json",
                "{\n  \"logic_uuid\": \"a94a8fe5ccb19ba61c4c0873d391e987\",\n  \"build\": 7\n}\n",
            ),
            ("report_utilization.xml", "<Report/>"),
        ]);
        let bdf = Bdf::parse("21:00.0").unwrap();

        let bundle = Vrtbin::open(&archive, &bdf, &dirs).unwrap();
        assert_eq!(bundle.platform(), Platform::Hardware);
        assert_eq!(bundle.uuid(), "a94a8fe5ccb19ba61c4c0873d391e987");
        assert!(bundle.pdi_path().unwrap().ends_with("design.pdi"));

        let metadata = dirs.ami_home.unwrap().join("21:00.0");
        for name in ["system_map.xml", "version.json", "report_utilization.xml"] {
            assert!(metadata.join(name).exists(), "missing {name}");
        }
        assert_eq!(bundle.system_map_path(), metadata.join("system_map.xml"));
    }

    #[test]
    fn hardware_bundle_without_ami_home_is_fatal() {
        let (_root, archive, mut dirs) = bundle_with(&[
            ("system_map.xml", hw_map()),
            ("design.pdi", ""),
            ("version.json", "{}"),
            ("report_utilization.xml", ""),
        ]);
        dirs.ami_home = None;
        let bdf = Bdf::parse("21:00.0").unwrap();
        let err = Vrtbin::open(&archive, &bdf, &dirs).unwrap_err();
        assert!(matches!(err, Error::BundleInvalid { .. }));
        assert!(err.to_string().contains("AMI_HOME"));
    }

    #[test]
    fn missing_logic_uuid_is_non_fatal() {
        let (_root, archive, dirs) = bundle_with(&[
            ("system_map.xml", hw_map()),
            ("design.pdi", ""),
            ("version.json", "{\n  \"build\": 9\n}\n"),
            ("report_utilization.xml", ""),
        ]);
        let bdf = Bdf::parse("21:00.0").unwrap();
        let bundle = Vrtbin::open(&archive, &bdf, &dirs).unwrap();
        assert_eq!(bundle.uuid(), "");
    }

    #[test]
    fn emulation_bundle_records_the_executable() {
        let (_root, archive, mut dirs) = bundle_with(&[
            (
                "system_map.xml",
                "<SystemMap><Platform>Emulation</Platform></SystemMap>",
            ),
            ("vpp_emu", "#!/bin/true"),
        ]);
        // Emulation never needs AMI_HOME.
        dirs.ami_home = None;
        let bdf = Bdf::parse("00:00.0").unwrap();

        let bundle = Vrtbin::open(&archive, &bdf, &dirs).unwrap();
        assert_eq!(bundle.platform(), Platform::Emulation);
        assert!(bundle.executable_path().unwrap().ends_with("vpp_emu"));
        assert!(bundle.pdi_path().is_none());
        assert_eq!(bundle.uuid(), "");
    }

    #[test]
    fn missing_archive_is_bundle_invalid() {
        let dirs = Dirs {
            cache: std::env::temp_dir(),
            ami_home: None,
        };
        let bdf = Bdf::parse("21:00.0").unwrap();
        let err = Vrtbin::open(Path::new("/nonexistent.vrtbin"), &bdf, &dirs).unwrap_err();
        assert!(matches!(err, Error::BundleInvalid { .. }));
    }

    #[test]
    fn corrupt_archive_is_bundle_invalid() {
        let root = tempfile::tempdir().unwrap();
        let archive = root.path().join("broken.vrtbin");
        std::fs::write(&archive, b"not a tar archive").unwrap();
        let cache = root.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        let dirs = Dirs {
            cache,
            ami_home: None,
        };
        let bdf = Bdf::parse("21:00.0").unwrap();
        let err = Vrtbin::open(&archive, &bdf, &dirs).unwrap_err();
        assert!(matches!(err, Error::BundleInvalid { .. }));
    }

    #[test]
    fn uuid_scan_takes_the_first_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("version.json");
        std::fs::write(
            &path,
            "{ \"logic_uuid\": \"first\" }\n{ \"logic_uuid\": \"second\" }\n",
        )
        .unwrap();
        assert_eq!(extract_uuid(&path), "first");
    }
}
