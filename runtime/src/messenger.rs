//! Request/reply messenger for the simulation and emulation backends.
//!
//! The spawned `vpp_sim`/`vpp_emu` child listens on a local TCP port and
//! speaks a small JSON protocol: every request is one JSON frame, optionally
//! followed by a raw data frame, and yields exactly one reply frame. A frame
//! on the wire is a little-endian `u32` payload length, one `more` flag byte
//! announcing a follow-up frame, then the payload.
//!
//! The messenger exists on every platform but only dials the peer on first
//! use, so hardware devices never connect to anything.
//!
//! Emulation-side buffers are addressed by *name*; the convention is the
//! device address formatted in decimal, and the emulator depends on it.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;

use serde_json::{Value, json};
use tracing::debug;

use crate::error::{Error, Result};

/// Endpoint the sim/emu child listens on.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:5555";

/// JSON request/reply channel to the sim/emu peer.
#[derive(Debug)]
pub struct Messenger {
    endpoint: String,
    stream: Mutex<Option<TcpStream>>,
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new()
    }
}

impl Messenger {
    /// Creates a messenger for the default endpoint. No connection is made.
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    /// Creates a messenger for an explicit endpoint. No connection is made.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            stream: Mutex::new(None),
        }
    }

    // -- protocol operations ------------------------------------------------

    /// Sends a bare command and discards the `"OK"` reply.
    pub fn send_command(&self, command: Value) -> Result<()> {
        self.request(&command, None).map(drop)
    }

    /// Tells a freshly spawned simulator to start.
    pub fn start(&self) -> Result<()> {
        self.send_command(json!({ "command": "start" }))
    }

    /// Tells the peer to shut down.
    pub fn exit(&self) -> Result<()> {
        self.send_command(json!({ "command": "exit" }))
    }

    /// Simulation: one MMIO-style register write at an absolute address.
    pub fn write_reg(&self, addr: u64, val: u32) -> Result<()> {
        self.send_command(json!({ "command": "reg", "addr": addr, "val": val }))
    }

    /// Simulation: one MMIO-style register read at an absolute address.
    pub fn fetch_scalar_at(&self, addr: u64) -> Result<u32> {
        let reply = self.request(
            &json!({ "command": "fetch", "type": "scalar", "addr": addr }),
            None,
        )?;
        parse_scalar(&reply)
    }

    /// Simulation: populate device memory at an absolute address.
    pub fn send_buffer_at(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.request(
            &json!({ "command": "populate", "addr": addr, "size": data.len() as u64 }),
            Some(data),
        )
        .map(drop)
    }

    /// Simulation: fetch device memory from an absolute address.
    pub fn fetch_buffer_at(&self, addr: u64, size: u64) -> Result<Vec<u8>> {
        let reply = self.request(
            &json!({ "command": "fetch", "type": "buffer", "addr": addr, "size": size }),
            None,
        )?;
        parse_byte_array(&reply)
    }

    /// Emulation: populate a named buffer.
    pub fn send_buffer(&self, name: &str, data: &[u8]) -> Result<()> {
        self.request(
            &json!({ "command": "populate", "name": name, "size": data.len() as u64 }),
            Some(data),
        )
        .map(drop)
    }

    /// Emulation: fetch a named buffer.
    pub fn fetch_buffer(&self, name: &str) -> Result<Vec<u8>> {
        let reply = self.request(
            &json!({ "command": "fetch", "type": "buffer", "name": name }),
            None,
        )?;
        parse_byte_array(&reply)
    }

    /// Emulation: push bytes into a stream queue.
    pub fn send_stream(&self, name: &str, data: &[u8]) -> Result<()> {
        self.request(&json!({ "command": "stream_in", "name": name }), Some(data))
            .map(drop)
    }

    /// Emulation: drain a stream queue. The reply is the raw byte payload,
    /// which may be shorter or longer than `size`.
    pub fn fetch_stream(&self, name: &str, size: u64) -> Result<Vec<u8>> {
        self.request(
            &json!({ "command": "stream_out", "name": name, "size": size }),
            None,
        )
    }

    /// Emulation: fetch a scalar result by function and argument slot.
    pub fn fetch_scalar(&self, function: &str, arg: &str) -> Result<u32> {
        let reply = self.request(
            &json!({ "command": "fetch", "type": "scalar", "function": function, "arg": arg }),
            None,
        )?;
        parse_scalar(&reply)
    }

    // -- transport ----------------------------------------------------------

    /// One request/reply round trip: the JSON frame, an optional data frame,
    /// then the single reply frame.
    fn request(&self, command: &Value, data: Option<&[u8]>) -> Result<Vec<u8>> {
        let payload = command.to_string();
        debug!(command = %payload, data_len = data.map_or(0, <[u8]>::len), "messenger request");

        let mut guard = self
            .stream
            .lock()
            .map_err(|_| Error::TransportFailed("messenger mutex poisoned".into()))?;
        if guard.is_none() {
            *guard = Some(connect_with_retry(&self.endpoint)?);
        }
        let stream = guard.as_mut().expect("stream populated above");

        let io = (|| {
            write_frame(stream, payload.as_bytes(), data.is_some())?;
            if let Some(data) = data {
                write_frame(stream, data, false)?;
            }
            read_frame(stream)
        })();

        match io {
            Ok(reply) => Ok(reply),
            Err(e) => {
                // A broken stream is not retried; the next request redials.
                *guard = None;
                Err(Error::TransportFailed(e.to_string()))
            }
        }
    }
}

/// Dials the peer, retrying briefly: a freshly spawned sim/emu child needs
/// a moment to bind its listener before the first request lands.
fn connect_with_retry(endpoint: &str) -> Result<TcpStream> {
    let mut last = None;
    for _ in 0..20 {
        match TcpStream::connect(endpoint) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Err(Error::TransportFailed(format!(
        "connecting to {endpoint}: {}",
        last.expect("at least one connect attempt")
    )))
}

fn write_frame(stream: &mut TcpStream, payload: &[u8], more: bool) -> std::io::Result<()> {
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(&[u8::from(more)])?;
    stream.write_all(payload)
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

fn parse_scalar(reply: &[u8]) -> Result<u32> {
    let value: Value = serde_json::from_slice(reply)
        .map_err(|e| Error::TransportFailed(format!("malformed scalar reply: {e}")))?;
    value
        .as_u64()
        .map(|v| v as u32)
        .ok_or_else(|| Error::TransportFailed(format!("non-integer scalar reply: {value}")))
}

fn parse_byte_array(reply: &[u8]) -> Result<Vec<u8>> {
    let value: Value = serde_json::from_slice(reply)
        .map_err(|e| Error::TransportFailed(format!("malformed buffer reply: {e}")))?;
    let array = value
        .as_array()
        .ok_or_else(|| Error::TransportFailed("buffer reply is not an array".into()))?;
    array
        .iter()
        .map(|v| {
            v.as_u64()
                .map(|b| b as u8)
                .ok_or_else(|| Error::TransportFailed("non-integer byte in buffer reply".into()))
        })
        .collect()
}
