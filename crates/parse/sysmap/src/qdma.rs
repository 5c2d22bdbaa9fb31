//! QDMA stream-queue bindings declared in the system map.

use std::fmt;

/// Direction of a stream queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    /// Host-to-card (H2C).
    HostToDevice,
    /// Card-to-host (C2H).
    DeviceToHost,
}

impl StreamDirection {
    /// The short form used by the queue-setup tooling (`h2c` / `c2h`).
    pub fn as_queue_arg(&self) -> &'static str {
        match self {
            Self::HostToDevice => "h2c",
            Self::DeviceToHost => "c2h",
        }
    }
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostToDevice => write!(f, "HostToDevice"),
            Self::DeviceToHost => write!(f, "DeviceToHost"),
        }
    }
}

/// One stream queue binding: kernel port to QDMA queue id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdmaConnection {
    /// Name of the kernel the stream is attached to.
    pub kernel: String,
    /// Queue id, 0..=15.
    pub qid: u32,
    /// AXI-Stream interface name on the kernel.
    pub interface: String,
    /// Data flow direction.
    pub direction: StreamDirection,
}
