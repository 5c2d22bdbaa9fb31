//! `slash-rt` --- host-side runtime for SLASH PCIe accelerator cards.
//!
//! The runtime's public surface is three objects. A [`Device`] owns one
//! card end to end: it extracts the accelerator bundle, reconciles the
//! logic UUID on flash, programs and boots the fabric when needed, walks
//! the PCIe hot-plug re-enumeration dance, sets up the DMA queues, parses
//! the system map, and programs the user clock. A [`Kernel`] is a live view
//! of one kernel's register file with typed argument marshalling and a
//! start/wait state machine. A [`Buffer`] pairs a host mirror with a device
//! allocation and moves bytes in one direction per `sync`; its streaming
//! sibling [`StreamingBuffer`] binds the mirror to a QDMA stream queue
//! instead.
//!
//! Every operation routes transparently through one of three backends fixed
//! by the bundle: real hardware (BAR MMIO and DMA character devices),
//! cycle-accurate simulation, or functional emulation (both behind a JSON
//! messenger to a spawned child process).
//!
//! ```ignore
//! let mut device = Device::new("c4:00.0", "vadd.vrtbin")?;
//! let mut input = Buffer::<u32>::new(&device, 1024, RegionKind::Hbm)?;
//! input.as_mut_slice().fill(7);
//! input.sync(SyncDirection::HostToDevice)?;
//!
//! let mut vadd = device.kernel("vadd_0")?;
//! vadd.call(&args![1024u32, &input])?;
//!
//! input.sync(SyncDirection::DeviceToHost)?;
//! device.cleanup();
//! ```

pub mod ami;
pub mod bdf;
pub mod buffer;
pub mod clkwiz;
pub mod device;
pub mod error;
pub mod hotplug;
pub mod kernel;
pub mod logging;
pub mod messenger;
pub mod paths;
pub mod qdma;
pub mod streaming;
pub mod vrtbin;

pub use bdf::Bdf;
pub use buffer::{Buffer, SyncDirection};
pub use device::{Device, DeviceOptions, ProgramMode};
pub use error::{Error, Result};
pub use kernel::{Arg, Kernel};
pub use streaming::StreamingBuffer;
pub use vrtbin::Vrtbin;

// Re-exported so applications need only this crate.
pub use slash_alloc::{DDR_SIZE, DDR_START, HBM_PORT_SIZE, HBM_SIZE, HBM_START, RegionKind};
pub use slash_sysmap::{BundleType, Platform, StreamDirection};

#[cfg(test)]
pub(crate) mod test_support {
    //! Shared fixtures: an in-process messenger peer and stub system maps.

    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};

    use serde_json::Value;

    /// Spawns a scripted peer answering `replies.len()` requests. Returns
    /// the endpoint and a handle yielding every `(command, data)` seen.
    pub(crate) fn spawn_peer(
        replies: Vec<Vec<u8>>,
    ) -> (String, std::thread::JoinHandle<Vec<(Value, Option<Vec<u8>>)>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for reply in replies {
                let (cmd, more) = read_frame(&mut stream);
                let data = more.then(|| read_frame(&mut stream).0);
                seen.push((serde_json::from_slice(&cmd).unwrap(), data));
                write_frame(&mut stream, &reply);
            }
            seen
        });
        (endpoint, handle)
    }

    fn read_frame(stream: &mut TcpStream) -> (Vec<u8>, bool) {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let more = header[4] != 0;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).unwrap();
        (payload, more)
    }

    fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
        stream.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        stream.write_all(&[0]).unwrap();
        stream.write_all(payload).unwrap();
    }

    /// A one-kernel, one-stream-pair system map for the given platform.
    pub(crate) fn stub_map(platform: &str) -> slash_sysmap::SystemMap {
        let doc = format!(
            "<SystemMap><Platform>{platform}</Platform><Type>Full</Type>\
             <ClockFrequency>300000000</ClockFrequency>\
             <Kernel><Name>vadd_0</Name><BaseAddress>0x20100000000</BaseAddress><Range>0x10000</Range>\
             <register offset=\"0x00\" name=\"CTRL\" access=\"RW\" description=\"\" range=\"32\"/>\
             <register offset=\"0x04\" name=\"GIER\" access=\"RW\" description=\"\" range=\"32\"/>\
             <register offset=\"0x08\" name=\"IP_IER\" access=\"RW\" description=\"\" range=\"32\"/>\
             <register offset=\"0x0C\" name=\"IP_ISR\" access=\"RW\" description=\"\" range=\"32\"/>\
             <register offset=\"0x10\" name=\"size\" access=\"RW\" description=\"\" range=\"32\"/>\
             <register offset=\"0x14\" name=\"in_0\" access=\"RW\" description=\"\" range=\"32\"/>\
             <register offset=\"0x18\" name=\"in_1\" access=\"RW\" description=\"\" range=\"32\"/>\
             </Kernel>\
             <Qdma kernel=\"vadd_0\" interface=\"in_stream\" qid=\"1\" direction=\"HostToDevice\"/>\
             <Qdma kernel=\"vadd_0\" interface=\"out_stream\" qid=\"2\" direction=\"DeviceToHost\"/>\
             </SystemMap>"
        );
        slash_sysmap::SystemMap::parse(&doc).unwrap()
    }
}
