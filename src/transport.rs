// src/transport.rs

//! Byte-stream transports and frame I/O.
//!
//! The core consumes a blocking, full-duplex, reliable, ordered byte
//! stream through the [`Transport`] trait. Two implementations ship:
//! [`TcpTransport`] over a `std::net::TcpStream` and an in-process
//! [`MemTransport`] pair for tests and loopback use.
//!
//! On the wire every message is one frame: a packed-int32 length prefix
//! followed by that many body bytes. The first value inside the body is
//! the target channel id (packed int32); the rest is the POF-encoded
//! message. [`FrameReader`] and [`FrameWriter`] own this layer and reject
//! frames beyond a configured maximum before allocating.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::{Error, Result};

/// Blocking byte-stream transport.
///
/// `read` blocks until at least one byte is available and returns 0 only
/// at end-of-stream; `shutdown` unblocks both directions on both ends.
pub trait Transport: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn flush(&self) -> io::Result<()>;
    fn shutdown(&self);
}

/// TCP transport with Nagle disabled.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(TcpTransport { stream })
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        (&self.stream).flush()
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// In-process duplex transport. Chunks written on one side come out of
/// `read` on the other; an empty chunk is the end-of-stream marker.
pub struct MemTransport {
    tx: Sender<Vec<u8>>,
    self_tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
    pending: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
}

impl MemTransport {
    /// Two connected ends of an in-process stream.
    pub fn pair() -> (MemTransport, MemTransport) {
        let (tx_a, rx_a) = unbounded();
        let (tx_b, rx_b) = unbounded();
        let a = MemTransport {
            tx: tx_b.clone(),
            self_tx: tx_a.clone(),
            rx: Mutex::new(rx_a),
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        };
        let b = MemTransport {
            tx: tx_a,
            self_tx: tx_b,
            rx: Mutex::new(rx_b),
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        };
        (a, b)
    }
}

impl Transport for MemTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut pending = self.pending.lock();
                if !pending.is_empty() {
                    let n = buf.len().min(pending.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = pending.pop_front().unwrap();
                    }
                    return Ok(n);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return Ok(0);
            }
            let chunk = {
                let rx = self.rx.lock();
                match rx.recv() {
                    Ok(chunk) => chunk,
                    // Far end dropped entirely.
                    Err(_) => return Ok(0),
                }
            };
            if chunk.is_empty() {
                // End-of-stream marker from either side's shutdown.
                self.closed.store(true, Ordering::Release);
                return Ok(0);
            }
            self.pending.lock().extend(chunk);
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer closed"))?;
        Ok(buf.len())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Wake the far end's reader and our own blocked read.
            let _ = self.tx.send(Vec::new());
            let _ = self.self_tx.send(Vec::new());
        }
    }
}

/// One inbound frame: the target channel and the message body.
#[derive(Debug)]
pub struct InboundFrame {
    pub channel: u32,
    pub body: Bytes,
}

/// Writes length-prefixed frames to a transport.
pub struct FrameWriter {
    transport: Arc<dyn Transport>,
    max_frame_size: usize,
}

impl FrameWriter {
    pub fn new(transport: Arc<dyn Transport>, max_frame_size: usize) -> Self {
        FrameWriter {
            transport,
            max_frame_size,
        }
    }

    /// Emit `[length][channelId][body]` and flush.
    pub fn write_frame(&self, channel: u32, body: &[u8]) -> Result<()> {
        let mut prefix = WriteBuffer::with_capacity(10);
        prefix.write_packed_i32(channel as i32);
        let frame_len = prefix.len() + body.len();
        if frame_len > self.max_frame_size {
            return Err(Error::encoding(format!(
                "outbound frame of {} bytes exceeds maximum {}",
                frame_len, self.max_frame_size
            )));
        }
        let mut head = WriteBuffer::with_capacity(5);
        head.write_packed_i32(frame_len as i32);
        self.write_all(head.as_slice())?;
        self.write_all(prefix.as_slice())?;
        self.write_all(body)?;
        self.transport.flush()?;
        Ok(())
    }

    fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.transport.write(buf)?;
            if n == 0 {
                return Err(Error::from(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "transport refused bytes",
                )));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// Reads length-prefixed frames from a transport.
pub struct FrameReader {
    transport: Arc<dyn Transport>,
    max_frame_size: usize,
}

impl FrameReader {
    pub fn new(transport: Arc<dyn Transport>, max_frame_size: usize) -> Self {
        FrameReader {
            transport,
            max_frame_size,
        }
    }

    /// Next frame, or `None` on a clean end-of-stream at a frame boundary.
    /// End-of-stream inside a frame is an error.
    pub fn read_frame(&self) -> Result<Option<InboundFrame>> {
        let frame_len = match self.read_length()? {
            Some(len) => len,
            None => return Ok(None),
        };
        if frame_len == 0 || frame_len > self.max_frame_size {
            return Err(Error::encoding(format!(
                "inbound frame length {} out of bounds (max {})",
                frame_len, self.max_frame_size
            )));
        }
        let mut body = vec![0u8; frame_len];
        self.read_exact(&mut body)?;
        let mut read = ReadBuffer::new(Bytes::from(body));
        let channel = read.read_packed_i32()?;
        if channel < 0 {
            return Err(Error::encoding(format!("negative channel id {}", channel)));
        }
        let body = read.read_slice(read.remaining())?;
        Ok(Some(InboundFrame {
            channel: channel as u32,
            body,
        }))
    }

    /// Packed-int32 length prefix, read byte by byte. A clean EOF before
    /// the first byte is a graceful close.
    fn read_length(&self) -> Result<Option<usize>> {
        let mut byte = [0u8; 1];
        let mut bytes = Vec::with_capacity(5);
        loop {
            let n = self.transport.read(&mut byte)?;
            if n == 0 {
                if bytes.is_empty() {
                    return Ok(None);
                }
                return Err(Error::encoding("end of stream inside frame length"));
            }
            bytes.push(byte[0]);
            if byte[0] & 0x80 == 0 {
                break;
            }
            if bytes.len() >= 5 {
                return Err(Error::encoding("frame length prefix too long"));
            }
        }
        let mut read = ReadBuffer::new(Bytes::from(bytes));
        let len = read.read_packed_i32()?;
        if len < 0 {
            return Err(Error::encoding(format!("negative frame length {}", len)));
        }
        Ok(Some(len as usize))
    }

    fn read_exact(&self, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.transport.read(buf)?;
            if n == 0 {
                return Err(Error::encoding("end of stream inside frame body"));
            }
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 16 * 1024 * 1024;

    #[test]
    fn mem_pair_frames_roundtrip() {
        let (a, b) = MemTransport::pair();
        let a = Arc::new(a);
        let b: Arc<dyn Transport> = Arc::new(b);

        let writer = FrameWriter::new(a.clone(), MAX);
        let reader = FrameReader::new(b.clone(), MAX);

        writer.write_frame(7, b"hello").unwrap();
        writer.write_frame(0, b"").unwrap();

        let f = reader.read_frame().unwrap().unwrap();
        assert_eq!(f.channel, 7);
        assert_eq!(&f.body[..], b"hello");

        let f = reader.read_frame().unwrap().unwrap();
        assert_eq!(f.channel, 0);
        assert!(f.body.is_empty());
    }

    #[test]
    fn shutdown_reads_as_clean_eof() {
        let (a, b) = MemTransport::pair();
        let a = Arc::new(a);
        let b: Arc<dyn Transport> = Arc::new(b);
        let reader = FrameReader::new(b, MAX);
        a.shutdown();
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn shutdown_unblocks_own_reader() {
        let (a, _b) = MemTransport::pair();
        let a = Arc::new(a);
        let reader = FrameReader::new(a.clone() as Arc<dyn Transport>, MAX);
        let handle = std::thread::spawn(move || reader.read_frame());
        std::thread::sleep(std::time::Duration::from_millis(20));
        a.shutdown();
        assert!(handle.join().unwrap().unwrap().is_none());
    }

    #[test]
    fn write_after_shutdown_fails() {
        let (a, _b) = MemTransport::pair();
        a.shutdown();
        assert!(a.write(b"x").is_err());
    }

    #[test]
    fn oversized_frames_rejected_both_ways() {
        let (a, b) = MemTransport::pair();
        let a = Arc::new(a);
        let b: Arc<dyn Transport> = Arc::new(b);

        let writer = FrameWriter::new(a.clone(), 8);
        assert!(matches!(
            writer.write_frame(1, &[0u8; 32]),
            Err(Error::InvalidEncoding(_))
        ));

        // A generous writer against a strict reader.
        let writer = FrameWriter::new(a, MAX);
        writer.write_frame(1, &[0u8; 64]).unwrap();
        let reader = FrameReader::new(b, 8);
        assert!(matches!(
            reader.read_frame(),
            Err(Error::InvalidEncoding(_))
        ));
    }

    #[test]
    fn truncated_frame_body_is_an_error() {
        let (a, b) = MemTransport::pair();
        let a = Arc::new(a);
        // Length prefix promises 100 bytes, stream ends after 3.
        let mut head = WriteBuffer::new();
        head.write_packed_i32(100);
        a.write(head.as_slice()).unwrap();
        a.write(&[1, 2, 3]).unwrap();
        a.shutdown();

        let reader = FrameReader::new(Arc::new(b) as Arc<dyn Transport>, MAX);
        assert!(matches!(
            reader.read_frame(),
            Err(Error::InvalidEncoding(_))
        ));
    }

    #[test]
    fn tcp_pair_roundtrip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = std::thread::spawn(move || listener.accept().unwrap().0);
        let client = TcpTransport::connect(addr).unwrap();
        let server = TcpTransport::from_stream(accept.join().unwrap()).unwrap();

        let writer = FrameWriter::new(Arc::new(client), MAX);
        let reader = FrameReader::new(Arc::new(server) as Arc<dyn Transport>, MAX);
        writer.write_frame(3, b"over tcp").unwrap();
        let f = reader.read_frame().unwrap().unwrap();
        assert_eq!(f.channel, 3);
        assert_eq!(&f.body[..], b"over tcp");
    }
}
