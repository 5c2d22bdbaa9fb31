//! End-to-end lifecycle test on the emulation backend.
//!
//! Builds a real vrtbin archive whose `vpp_emu` is a placeholder script,
//! opens a `Device` through the public API, and exercises lookup, the
//! per-BDF exclusive lock, and cleanup. Runs entirely against the per-user
//! fallback directories; no hardware, no root.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Command;

use slash_rt::{Device, Error, Platform};

const SYSTEM_MAP: &str = "<SystemMap><Platform>Emulation</Platform><Type>Full</Type>\
     <ClockFrequency>250000000</ClockFrequency>\
     <Kernel><Name>scale_0</Name><BaseAddress>0x20100000000</BaseAddress><Range>0x10000</Range>\
     <register offset=\"0x00\" name=\"CTRL\" access=\"RW\" description=\"\" range=\"32\"/>\
     <register offset=\"0x04\" name=\"GIER\" access=\"RW\" description=\"\" range=\"32\"/>\
     <register offset=\"0x08\" name=\"IP_IER\" access=\"RW\" description=\"\" range=\"32\"/>\
     <register offset=\"0x0C\" name=\"IP_ISR\" access=\"RW\" description=\"\" range=\"32\"/>\
     <register offset=\"0x10\" name=\"factor\" access=\"RW\" description=\"\" range=\"32\"/>\
     </Kernel></SystemMap>";

/// Builds a vrtbin with the emulation layout: a system map plus a
/// `vpp_emu` that just sleeps (the messenger is never contacted here).
fn build_bundle(dir: &std::path::Path) -> PathBuf {
    let stage = dir.join("stage");
    std::fs::create_dir_all(&stage).unwrap();
    std::fs::write(stage.join("system_map.xml"), SYSTEM_MAP).unwrap();

    let emu = stage.join("vpp_emu");
    std::fs::write(&emu, "#!/bin/sh\nsleep 60\n").unwrap();
    std::fs::set_permissions(&emu, std::fs::Permissions::from_mode(0o755)).unwrap();

    let archive = dir.join("scale.vrtbin");
    let status = Command::new("tar")
        .arg("-cf")
        .arg(&archive)
        .arg("-C")
        .arg(&stage)
        .args(["system_map.xml", "vpp_emu"])
        .status()
        .unwrap();
    assert!(status.success());
    archive
}

#[test]
fn emulation_device_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let bundle = build_bundle(dir.path());

    let mut device = Device::new("d8:00.0", &bundle).expect("emulation device opens");
    assert_eq!(device.platform(), Platform::Emulation);
    assert_eq!(device.frequency(), 0, "no clock off hardware");

    // The system map drives kernel lookup.
    assert!(device.kernel("scale_0").is_ok());
    assert!(matches!(
        device.kernel("nope").unwrap_err(),
        Error::KernelNotFound(_)
    ));

    // A second device on the same BDF is refused before any I/O.
    assert!(matches!(
        Device::new("d8:00.0", &bundle).unwrap_err(),
        Error::DeviceBusy(_)
    ));

    // Cleanup reaps the backend child and releases the lock, after which
    // the BDF can be claimed again.
    device.cleanup();
    drop(device);
    let mut reopened = Device::new("d8:00.0", &bundle).expect("lock released");
    reopened.cleanup();
}
