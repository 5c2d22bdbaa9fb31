//! QDMA character-device interface.
//!
//! Bulk transfers go through the memory-mapped queue at
//! `/dev/qdma<bus>001-MM-0`; host-to-card streaming uses
//! `/dev/qdma<bus>001-ST-<qid>`. The device is opened and closed per call:
//! simpler, slower, and it sidesteps concurrent-use concerns.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::debug;

use crate::bdf::Bdf;
use crate::error::{Error, Result};

/// Largest single read/write the QDMA driver accepts.
pub const RW_MAX_SIZE: u64 = 0x7FFF_F000;

/// One QDMA queue endpoint.
#[derive(Debug)]
pub struct QdmaIntf {
    path: PathBuf,
    qid: u32,
}

impl QdmaIntf {
    /// The memory-mapped bidirectional queue for a card.
    pub fn mm(bdf: &Bdf) -> Self {
        Self {
            path: PathBuf::from(format!("/dev/qdma{}001-MM-0", bdf.bus_str())),
            qid: 0,
        }
    }

    /// A streaming queue for a card.
    pub fn stream(bdf: &Bdf, qid: u32) -> Self {
        Self {
            path: PathBuf::from(format!("/dev/qdma{}001-ST-{}", bdf.bus_str(), qid)),
            qid,
        }
    }

    /// An endpoint at an explicit path, for tests.
    pub fn with_path(path: PathBuf, qid: u32) -> Self {
        Self { path, qid }
    }

    /// Queue index this endpoint is bound to.
    pub fn qid(&self) -> u32 {
        self.qid
    }

    /// Device node path.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Writes `data` to the device starting at `base`.
    ///
    /// Opens write-only, seeks once when `base` is non-zero, then issues
    /// successive writes capped at [`RW_MAX_SIZE`]. After a successful call
    /// the file offset has advanced by exactly `data.len()`.
    ///
    /// # Errors
    ///
    /// `IoError` on open, seek, or short-write failure.
    pub fn write_buff(&self, data: &[u8], base: u64) -> Result<()> {
        debug!(
            path = %self.path.display(),
            base = format_args!("{base:#x}"),
            len = format_args!("{:#x}", data.len()),
            "qdma write"
        );
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| self.io_err(format!("open for write: {e}")))?;
        if base != 0 {
            self.seek_to(&mut file, base)?;
        }

        let mut done = 0usize;
        while done < data.len() {
            let chunk = (data.len() - done).min(RW_MAX_SIZE as usize);
            let written = file
                .write(&data[done..done + chunk])
                .map_err(|e| self.io_err(format!("write: {e}")))?;
            if written != chunk {
                return Err(self.io_err(format!("short write: {written} of {chunk} bytes")));
            }
            done += chunk;
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes from the device starting at `base`.
    ///
    /// Mirror of [`QdmaIntf::write_buff`].
    pub fn read_buff(&self, buf: &mut [u8], base: u64) -> Result<()> {
        debug!(
            path = %self.path.display(),
            base = format_args!("{base:#x}"),
            len = format_args!("{:#x}", buf.len()),
            "qdma read"
        );
        let mut file = File::open(&self.path)
            .map_err(|e| self.io_err(format!("open for read: {e}")))?;
        if base != 0 {
            self.seek_to(&mut file, base)?;
        }

        let len = buf.len();
        let mut done = 0usize;
        while done < len {
            let chunk = (len - done).min(RW_MAX_SIZE as usize);
            let read = file
                .read(&mut buf[done..done + chunk])
                .map_err(|e| self.io_err(format!("read: {e}")))?;
            if read != chunk {
                return Err(self.io_err(format!("short read: {read} of {chunk} bytes")));
            }
            done += chunk;
        }
        Ok(())
    }

    fn seek_to(&self, file: &mut File, base: u64) -> Result<()> {
        let pos = file
            .seek(SeekFrom::Start(base))
            .map_err(|e| self.io_err(format!("seek: {e}")))?;
        if pos != base {
            return Err(self.io_err(format!("seek landed at {pos:#x}, wanted {base:#x}")));
        }
        Ok(())
    }

    fn io_err(&self, reason: String) -> Error {
        Error::IoError {
            path: self.path.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_device(len: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qdma21001-MM-0");
        std::fs::write(&path, vec![0u8; len]).unwrap();
        (dir, path)
    }

    #[test]
    fn mm_and_stream_paths_use_the_bus_number() {
        let bdf = Bdf::parse("c4:00.0").unwrap();
        assert_eq!(
            QdmaIntf::mm(&bdf).path(),
            std::path::Path::new("/dev/qdmac4001-MM-0")
        );
        assert_eq!(
            QdmaIntf::stream(&bdf, 3).path(),
            std::path::Path::new("/dev/qdmac4001-ST-3")
        );
    }

    #[test]
    fn write_then_read_roundtrip_at_offset() {
        let (_dir, path) = scratch_device(16384);
        let intf = QdmaIntf::with_path(path, 0);

        let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        intf.write_buff(&payload, 8192).unwrap();

        let mut readback = vec![0u8; 4096];
        intf.read_buff(&mut readback, 8192).unwrap();
        assert_eq!(readback, payload);

        // Bytes before the base offset were untouched.
        let mut head = vec![0u8; 16];
        intf.read_buff(&mut head, 0).unwrap();
        assert_eq!(head, vec![0u8; 16]);
    }

    #[test]
    fn zero_byte_transfer_succeeds() {
        let (_dir, path) = scratch_device(64);
        let intf = QdmaIntf::with_path(path, 0);
        intf.write_buff(&[], 0).unwrap();
        intf.read_buff(&mut [], 0).unwrap();
    }

    #[test]
    fn short_read_is_an_io_error() {
        let (_dir, path) = scratch_device(64);
        let intf = QdmaIntf::with_path(path, 0);
        let mut buf = vec![0u8; 128];
        assert!(matches!(
            intf.read_buff(&mut buf, 0).unwrap_err(),
            Error::IoError { .. }
        ));
    }

    #[test]
    fn missing_device_node_is_an_io_error() {
        let intf = QdmaIntf::with_path(PathBuf::from("/nonexistent/qdma00001-MM-0"), 0);
        assert!(matches!(
            intf.write_buff(&[1], 0).unwrap_err(),
            Error::IoError { .. }
        ));
    }
}
