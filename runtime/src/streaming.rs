//! Streaming buffers bound to QDMA stream queues.
//!
//! A [`StreamingBuffer`] is a host mirror bound to one stream queue,
//! resolved by (kernel name, port name) against the device's QDMA
//! connections. The transport name is derived from the direction and queue
//! id --- `streamingBuffer_<qid>` toward the card, `outputStreamingBuffer_<qid>`
//! from it --- and the emulator keys its stream endpoints on exactly those
//! names.

use slash_sysmap::{Platform, StreamDirection};

use crate::device::Device;
use crate::error::{Error, Result};

/// Host mirror bound to a stream queue.
#[derive(Debug)]
pub struct StreamingBuffer<'a, T> {
    device: &'a Device,
    data: Vec<T>,
    name: String,
    direction: StreamDirection,
    qid: u32,
}

impl<'a, T: Copy + Default> StreamingBuffer<'a, T> {
    /// Binds a mirror of `len` elements to the stream queue declared for
    /// `kernel`'s port `port_name`.
    ///
    /// # Errors
    ///
    /// `StreamNotFound` when the system map declares no such connection.
    pub fn new(
        device: &'a Device,
        kernel: &str,
        port_name: &str,
        len: usize,
    ) -> Result<Self> {
        let connection = device
            .qdma_connections()
            .iter()
            .find(|c| c.kernel == kernel && c.interface == port_name)
            .ok_or_else(|| Error::StreamNotFound {
                kernel: kernel.to_string(),
                port: port_name.to_string(),
            })?;

        let name = match connection.direction {
            StreamDirection::HostToDevice => format!("streamingBuffer_{}", connection.qid),
            StreamDirection::DeviceToHost => format!("outputStreamingBuffer_{}", connection.qid),
        };

        Ok(Self {
            device,
            data: vec![T::default(); len],
            name,
            direction: connection.direction,
            qid: connection.qid,
        })
    }

    /// Transport name of the stream endpoint.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of elements in the host mirror.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the mirror holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads the element at `index`.
    pub fn get(&self, index: usize) -> Result<T> {
        self.data.get(index).copied().ok_or(Error::OutOfRange {
            index,
            len: self.data.len(),
        })
    }

    /// Writes the element at `index`.
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        let len = self.data.len();
        match self.data.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::OutOfRange { index, len }),
        }
    }

    /// The host mirror as a slice.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// The host mirror as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Moves the mirror through the stream queue in its declared direction.
    ///
    /// On hardware, host-to-card pushes through the matching ST character
    /// device; card-to-host streaming has no hardware implementation and
    /// fails with `Unsupported`. On emulation the messenger's stream
    /// endpoints take the DMA interface's place, and a card-to-host fetch
    /// resizes the mirror when the returned payload differs from the
    /// nominal size.
    pub fn sync(&mut self) -> Result<()> {
        match self.device.platform() {
            Platform::Hardware => match self.direction {
                StreamDirection::HostToDevice => {
                    let intf = self.device.stream_intf(self.qid).ok_or_else(|| {
                        Error::StreamNotFound {
                            kernel: self.name.clone(),
                            port: format!("queue {}", self.qid),
                        }
                    })?;
                    intf.write_buff(self.bytes(), 0)
                }
                StreamDirection::DeviceToHost => {
                    Err(Error::Unsupported("C2H streaming on hardware"))
                }
            },
            Platform::Emulation => match self.direction {
                StreamDirection::HostToDevice => {
                    self.device.messenger().send_stream(&self.name, self.bytes())
                }
                StreamDirection::DeviceToHost => {
                    let nominal = self.bytes().len() as u64;
                    let fetched = self.device.messenger().fetch_stream(&self.name, nominal)?;
                    self.replace_bytes(&fetched);
                    Ok(())
                }
            },
            Platform::Simulation => Err(Error::Unsupported(
                "streaming buffers on the simulation backend",
            )),
        }
    }

    /// Replaces the mirror contents, resizing to the fetched payload.
    fn replace_bytes(&mut self, fetched: &[u8]) {
        let elem = std::mem::size_of::<T>().max(1);
        self.data = vec![T::default(); fetched.len() / elem];
        let take = fetched.len().min(self.bytes().len());
        self.bytes_mut()[..take].copy_from_slice(&fetched[..take]);
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: T is Copy plain data; length matches the element count.
        unsafe {
            std::slice::from_raw_parts(
                self.data.as_ptr().cast::<u8>(),
                std::mem::size_of_val(self.data.as_slice()),
            )
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.data.as_mut_ptr().cast::<u8>(),
                std::mem::size_of_val(self.data.as_slice()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::test_support::{spawn_peer, stub_map};

    #[test]
    fn names_derive_from_direction_and_qid() {
        let device = Device::stub(Platform::Emulation, stub_map("Emulation"), "127.0.0.1:1");
        let h2c = StreamingBuffer::<u32>::new(&device, "vadd_0", "in_stream", 8).unwrap();
        let c2h = StreamingBuffer::<u32>::new(&device, "vadd_0", "out_stream", 8).unwrap();
        assert_eq!(h2c.name(), "streamingBuffer_1");
        assert_eq!(c2h.name(), "outputStreamingBuffer_2");
    }

    #[test]
    fn unknown_port_is_fatal() {
        let device = Device::stub(Platform::Emulation, stub_map("Emulation"), "127.0.0.1:1");
        let err = StreamingBuffer::<u32>::new(&device, "vadd_0", "bogus", 8).unwrap_err();
        assert!(matches!(
            err,
            Error::StreamNotFound { kernel, port } if kernel == "vadd_0" && port == "bogus"
        ));
    }

    #[test]
    fn emulation_h2c_pushes_through_stream_in() {
        let (endpoint, peer) = spawn_peer(vec![b"\"OK\"".to_vec()]);
        let device = Device::stub(Platform::Emulation, stub_map("Emulation"), &endpoint);
        let mut stream =
            StreamingBuffer::<u8>::new(&device, "vadd_0", "in_stream", 4).unwrap();
        stream.as_mut_slice().copy_from_slice(&[9, 8, 7, 6]);

        stream.sync().unwrap();

        let seen = peer.join().unwrap();
        assert_eq!(seen[0].0["command"], "stream_in");
        assert_eq!(seen[0].0["name"], "streamingBuffer_1");
        assert_eq!(seen[0].1.as_deref(), Some(&[9, 8, 7, 6][..]));
    }

    #[test]
    fn emulation_c2h_resizes_to_the_fetched_payload() {
        let (endpoint, peer) = spawn_peer(vec![vec![1, 0, 2, 0, 3, 0]]);
        let device = Device::stub(Platform::Emulation, stub_map("Emulation"), &endpoint);
        let mut stream =
            StreamingBuffer::<u16>::new(&device, "vadd_0", "out_stream", 8).unwrap();

        stream.sync().unwrap();
        assert_eq!(stream.len(), 3);
        assert_eq!(stream.as_slice(), &[1, 2, 3]);

        let seen = peer.join().unwrap();
        assert_eq!(seen[0].0["command"], "stream_out");
        assert_eq!(seen[0].0["size"], 16);
    }

    #[test]
    fn hardware_c2h_is_unsupported() {
        let device = Device::stub(Platform::Hardware, stub_map("Hardware"), "127.0.0.1:1");
        let mut stream =
            StreamingBuffer::<u32>::new(&device, "vadd_0", "out_stream", 4).unwrap();
        assert!(matches!(
            stream.sync().unwrap_err(),
            Error::Unsupported(_)
        ));
    }

    #[test]
    fn simulation_streaming_is_unsupported() {
        let device = Device::stub(Platform::Simulation, stub_map("Simulation"), "127.0.0.1:1");
        let mut stream =
            StreamingBuffer::<u32>::new(&device, "vadd_0", "in_stream", 4).unwrap();
        assert!(matches!(
            stream.sync().unwrap_err(),
            Error::Unsupported(_)
        ));
    }
}
