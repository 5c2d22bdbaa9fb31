//! Kernel and register descriptors extracted from the system map.

/// Description of one MMIO register inside a kernel's register file.
///
/// The `wide` flag is computed once at parse time: register names ending in
/// `_<digits>` hold the low 32 bits of a 64-bit argument, with the next
/// descriptor holding the high 32 bits. Marshalling consults the flag instead
/// of re-matching the name on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDesc {
    /// Register name from the block design.
    pub name: String,
    /// Byte offset from the kernel base address. Multiple of 4.
    pub offset: u32,
    /// Register width in bits.
    pub width: u32,
    /// Access string, e.g. `RW`, `RO`, `WO`.
    pub access: String,
    /// Free-form description.
    pub description: String,
    wide: bool,
}

impl RegisterDesc {
    /// Creates a descriptor, deriving the wide-pair flag from the name.
    pub fn new(
        name: impl Into<String>,
        offset: u32,
        width: u32,
        access: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let wide = has_wide_suffix(&name);
        Self {
            name,
            offset,
            width,
            access: access.into(),
            description: description.into(),
            wide,
        }
    }

    /// Whether this descriptor is the low half of a 64-bit argument pair.
    pub fn is_wide(&self) -> bool {
        self.wide
    }
}

/// Matches names of the form `*_<digits>`.
fn has_wide_suffix(name: &str) -> bool {
    match name.rfind('_') {
        Some(idx) => {
            let digits = &name[idx + 1..];
            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Static description of one kernel: its BAR window and register file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelDesc {
    /// Kernel instance name.
    pub name: String,
    /// Absolute base address inside the BAR aperture.
    pub base_addr: u64,
    /// Address range covered by the kernel's register file.
    pub range: u64,
    /// Registers in ascending offset order.
    pub registers: Vec<RegisterDesc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_suffix_detection() {
        assert!(has_wide_suffix("ptr_0"));
        assert!(has_wide_suffix("in_buffer_12"));
        assert!(!has_wide_suffix("size"));
        assert!(!has_wide_suffix("trailing_"));
        assert!(!has_wide_suffix("mixed_1a"));
        assert!(!has_wide_suffix("_"));
        assert!(has_wide_suffix("_7"));
    }

    #[test]
    fn descriptor_precomputes_flag() {
        let wide = RegisterDesc::new("addr_0", 0x10, 32, "RW", "");
        let narrow = RegisterDesc::new("count", 0x18, 32, "RW", "");
        assert!(wide.is_wide());
        assert!(!narrow.is_wide());
    }
}
