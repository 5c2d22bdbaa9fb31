//! `slash-sysmap` --- parser for accelerator-bundle system maps.
//!
//! A bundle carries a `system_map.xml` describing the programmed fabric:
//! which execution platform it targets, whether the image is a full or
//! partial (segmented) design, the user-clock ceiling, every kernel's
//! register file, and the QDMA stream bindings. This crate parses that
//! document into typed descriptors shared by the runtime.
//!
//! ```ignore
//! let map = SystemMap::load(Path::new("system_map.xml"))?;
//! for (name, kernel) in &map.kernels {
//!     println!("{name} @ {:#x}", kernel.base_addr);
//! }
//! ```

pub mod kernel;
pub mod qdma;
mod xml;

pub use kernel::{KernelDesc, RegisterDesc};
pub use qdma::{QdmaConnection, StreamDirection};
pub use xml::Element;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors produced while reading a system map.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Reading the file failed.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The XML structure is malformed.
    #[error("malformed XML at byte {pos}: {reason}")]
    Xml {
        /// Byte position of the failure.
        pos: usize,
        /// What went wrong.
        reason: String,
    },
    /// The `Platform` element holds an unrecognized value.
    #[error("unknown platform type `{0}`")]
    UnknownPlatform(String),
    /// A required element is absent.
    #[error("system map is missing the `{0}` element")]
    MissingElement(&'static str),
    /// A numeric field failed to parse.
    #[error("invalid number `{value}` in {context}")]
    InvalidNumber {
        /// The offending literal.
        value: String,
        /// Where it appeared.
        context: &'static str,
    },
}

/// Execution platform a bundle targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// A real PCIe-attached fabric.
    Hardware,
    /// Functional software emulation behind the messenger.
    Emulation,
    /// Cycle-accurate simulation behind the messenger.
    Simulation,
}

impl Platform {
    fn from_tag(tag: &str) -> Result<Self, ParseError> {
        match tag {
            "Hardware" => Ok(Self::Hardware),
            "Emulation" => Ok(Self::Emulation),
            "Simulation" => Ok(Self::Simulation),
            other => Err(ParseError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Programming strategy implied by the bundle contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleType {
    /// Whole-fabric image: written to flash, booted into.
    Flat,
    /// Partial reconfiguration on top of the partition-1 base image.
    Segmented,
}

/// Parsed contents of `system_map.xml`.
#[derive(Debug, Clone)]
pub struct SystemMap {
    /// Target platform.
    pub platform: Platform,
    /// Full vs segmented image.
    pub bundle_type: BundleType,
    /// Maximum user-clock frequency in Hz.
    pub clock_frequency: u64,
    /// Kernels by instance name.
    pub kernels: BTreeMap<String, KernelDesc>,
    /// Stream queue bindings.
    pub qdma_connections: Vec<QdmaConnection>,
}

impl SystemMap {
    /// Reads and parses a system map file.
    pub fn load(path: &Path) -> Result<Self, ParseError> {
        let text = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parses a system map document.
    ///
    /// # Errors
    ///
    /// Fails on malformed XML, an unknown or missing `Platform`, or numeric
    /// fields that do not parse. A missing `Type` defaults to a flat image;
    /// a missing `ClockFrequency` defaults to zero.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let root = xml::parse(input)?;

        let mut platform = None;
        let mut bundle_type = BundleType::Flat;
        let mut clock_frequency = 0;
        let mut kernels = BTreeMap::new();
        let mut qdma_connections = Vec::new();

        for node in &root.children {
            match node.name.as_str() {
                "Platform" => platform = Some(Platform::from_tag(node.text.as_str())?),
                "Type" => {
                    bundle_type = if node.text == "Full" {
                        BundleType::Flat
                    } else {
                        BundleType::Segmented
                    };
                }
                "ClockFrequency" => {
                    clock_frequency = parse_u64(&node.text, "ClockFrequency")?;
                }
                "Kernel" => {
                    let kernel = parse_kernel(node)?;
                    kernels.insert(kernel.name.clone(), kernel);
                }
                "Qdma" => qdma_connections.push(parse_qdma(node)?),
                _ => {}
            }
        }

        Ok(Self {
            platform: platform.ok_or(ParseError::MissingElement("Platform"))?,
            bundle_type,
            clock_frequency,
            kernels,
            qdma_connections,
        })
    }
}

fn parse_kernel(node: &Element) -> Result<KernelDesc, ParseError> {
    let name = node
        .child_text("Name")
        .ok_or(ParseError::MissingElement("Kernel/Name"))?
        .to_string();
    let base_addr = parse_u64(
        node.child_text("BaseAddress")
            .ok_or(ParseError::MissingElement("Kernel/BaseAddress"))?,
        "Kernel/BaseAddress",
    )?;
    let range = parse_u64(
        node.child_text("Range")
            .ok_or(ParseError::MissingElement("Kernel/Range"))?,
        "Kernel/Range",
    )?;

    let mut registers = Vec::new();
    for reg in node.children_named("register") {
        let offset = parse_u64(attr(reg, "offset", "register")?, "register offset")? as u32;
        let width = parse_u64(attr(reg, "range", "register")?, "register range")? as u32;
        registers.push(RegisterDesc::new(
            attr(reg, "name", "register")?,
            offset,
            width,
            attr(reg, "access", "register")?,
            reg.attr("description").unwrap_or_default(),
        ));
    }

    Ok(KernelDesc {
        name,
        base_addr,
        range,
        registers,
    })
}

fn parse_qdma(node: &Element) -> Result<QdmaConnection, ParseError> {
    let direction = match attr(node, "direction", "Qdma")? {
        "HostToDevice" => StreamDirection::HostToDevice,
        "DeviceToHost" => StreamDirection::DeviceToHost,
        other => {
            return Err(ParseError::InvalidNumber {
                value: other.to_string(),
                context: "Qdma direction",
            });
        }
    };
    Ok(QdmaConnection {
        kernel: attr(node, "kernel", "Qdma")?.to_string(),
        qid: parse_u64(attr(node, "qid", "Qdma")?, "Qdma qid")? as u32,
        interface: attr(node, "interface", "Qdma")?.to_string(),
        direction,
    })
}

fn attr<'a>(node: &'a Element, name: &str, context: &'static str) -> Result<&'a str, ParseError> {
    node.attr(name).ok_or(ParseError::MissingElement(context))
}

/// Permissive numeric parse: base-16 literals may carry a `0x` prefix, hex
/// fields from the block design frequently omit it, and decimal fields are
/// plain. Bare literals are tried as decimal first, then as hex.
fn parse_u64(text: &str, context: &'static str) -> Result<u64, ParseError> {
    let text = text.trim();
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
            .or_else(|_| u64::from_str_radix(text, 16))
    };
    parsed.map_err(|_| ParseError::InvalidNumber {
        value: text.to_string(),
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Fixture builders ---------------------------------------------------

    fn register(offset: &str, name: &str) -> String {
        format!(
            r#"<register offset="{offset}" name="{name}" access="RW" description="" range="32"/>"#
        )
    }

    fn map_with(body: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?><SystemMap><Platform>Hardware</Platform>\
             <Type>Full</Type><ClockFrequency>300000000</ClockFrequency>{body}</SystemMap>"
        )
    }

    fn vadd_map() -> String {
        map_with(&format!(
            "<Kernel><Name>vadd_0</Name><BaseAddress>0x20100000000</BaseAddress><Range>0x10000</Range>\
             {}{}{}{}{}{}{}</Kernel>\
             <Qdma kernel=\"vadd_0\" interface=\"in_stream\" qid=\"1\" direction=\"HostToDevice\"/>\
             <Qdma kernel=\"vadd_0\" interface=\"out_stream\" qid=\"2\" direction=\"DeviceToHost\"/>",
            register("0x00", "CTRL"),
            register("0x04", "GIER"),
            register("0x08", "IP_IER"),
            register("0x0C", "IP_ISR"),
            register("0x10", "size"),
            register("0x14", "a_0"),
            register("0x18", "a_1"),
        ))
    }

    // ---- Top-level fields ---------------------------------------------------

    #[test]
    fn parses_platform_type_clock() {
        let map = SystemMap::parse(&vadd_map()).unwrap();
        assert_eq!(map.platform, Platform::Hardware);
        assert_eq!(map.bundle_type, BundleType::Flat);
        assert_eq!(map.clock_frequency, 300_000_000);
    }

    #[test]
    fn non_full_type_is_segmented() {
        let doc = "<SystemMap><Platform>Hardware</Platform><Type>Segmented</Type></SystemMap>";
        let map = SystemMap::parse(doc).unwrap();
        assert_eq!(map.bundle_type, BundleType::Segmented);
    }

    #[test]
    fn emulation_and_simulation_platforms() {
        for (tag, expected) in [
            ("Emulation", Platform::Emulation),
            ("Simulation", Platform::Simulation),
        ] {
            let doc = format!("<SystemMap><Platform>{tag}</Platform></SystemMap>");
            assert_eq!(SystemMap::parse(&doc).unwrap().platform, expected);
        }
    }

    #[test]
    fn unknown_platform_is_fatal() {
        let doc = "<SystemMap><Platform>Fpga</Platform></SystemMap>";
        assert!(matches!(
            SystemMap::parse(doc),
            Err(ParseError::UnknownPlatform(p)) if p == "Fpga"
        ));
    }

    #[test]
    fn missing_platform_is_fatal() {
        assert!(matches!(
            SystemMap::parse("<SystemMap><Type>Full</Type></SystemMap>"),
            Err(ParseError::MissingElement("Platform"))
        ));
    }

    // ---- Kernels ------------------------------------------------------------

    #[test]
    fn parses_kernel_register_file() {
        let map = SystemMap::parse(&vadd_map()).unwrap();
        let kernel = &map.kernels["vadd_0"];
        assert_eq!(kernel.base_addr, 0x201_0000_0000);
        assert_eq!(kernel.range, 0x10000);
        assert_eq!(kernel.registers.len(), 7);
        assert_eq!(kernel.registers[4].name, "size");
        assert_eq!(kernel.registers[4].offset, 0x10);
        assert!(!kernel.registers[4].is_wide());
        assert!(kernel.registers[5].is_wide());
        assert_eq!(kernel.registers[6].name, "a_1");
    }

    #[test]
    fn register_offsets_ascend() {
        let map = SystemMap::parse(&vadd_map()).unwrap();
        let regs = &map.kernels["vadd_0"].registers;
        assert!(regs.windows(2).all(|w| w[0].offset < w[1].offset));
        assert!(regs.iter().all(|r| r.offset % 4 == 0));
    }

    // ---- QDMA connections ---------------------------------------------------

    #[test]
    fn parses_qdma_connections() {
        let map = SystemMap::parse(&vadd_map()).unwrap();
        assert_eq!(map.qdma_connections.len(), 2);
        let h2c = &map.qdma_connections[0];
        assert_eq!(h2c.kernel, "vadd_0");
        assert_eq!(h2c.interface, "in_stream");
        assert_eq!(h2c.qid, 1);
        assert_eq!(h2c.direction, StreamDirection::HostToDevice);
        assert_eq!(map.qdma_connections[1].direction, StreamDirection::DeviceToHost);
    }

    // ---- Numeric parsing ----------------------------------------------------

    #[test]
    fn permissive_hex_parsing() {
        assert_eq!(parse_u64("0x10", "t").unwrap(), 0x10);
        assert_eq!(parse_u64("10", "t").unwrap(), 10);
        assert_eq!(parse_u64("1C", "t").unwrap(), 0x1C);
        assert_eq!(parse_u64(" 0X20 ", "t").unwrap(), 0x20);
        assert!(parse_u64("zz", "t").is_err());
    }
}
