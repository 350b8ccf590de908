//! Shared transport plumbing for the end-to-end tests: blocking
//! in-memory byte pipes, packet pipes with datagram boundaries, and a
//! recording writer for wire-determinism checks.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};

use probecrypto::rsa::{RsaPrivateKey, RsaPublicKey};
use probetls::config::Certificate;

struct PipeInner {
    state: Mutex<(VecDeque<u8>, bool)>,
    cond: Condvar,
}

/// Reading half of a one-directional in-memory byte stream.
pub struct PipeReader(Arc<PipeInner>);
/// Writing half; dropping it signals EOF.
pub struct PipeWriter(Arc<PipeInner>);

/// A one-directional blocking byte pipe.
pub fn byte_pipe() -> (PipeReader, PipeWriter) {
    let inner = Arc::new(PipeInner {
        state: Mutex::new((VecDeque::new(), false)),
        cond: Condvar::new(),
    });
    (PipeReader(inner.clone()), PipeWriter(inner))
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.state.lock().unwrap();
        while state.0.is_empty() && !state.1 {
            state = self.0.cond.wait(state).unwrap();
        }
        if state.0.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(state.0.len());
        for b in buf[..n].iter_mut() {
            *b = state.0.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.0.state.lock().unwrap();
        state.0.extend(buf.iter());
        self.0.cond.notify_all();
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap();
        state.1 = true;
        self.0.cond.notify_all();
    }
}

/// Tee writer that records everything written through it.
pub struct RecordingWriter<W> {
    inner: W,
    pub log: Arc<Mutex<Vec<u8>>>,
}

impl<W> RecordingWriter<W> {
    pub fn new(inner: W) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner,
                log: log.clone(),
            },
            log,
        )
    }
}

impl<W: Write> Write for RecordingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.lock().unwrap().extend_from_slice(buf);
        self.inner.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Packet pipes (DTLS)
// ---------------------------------------------------------------------------

struct PacketPipeInner {
    state: Mutex<(VecDeque<Vec<u8>>, bool)>,
    cond: Condvar,
}

pub struct PacketPipeReader(Arc<PacketPipeInner>);
pub struct PacketPipeWriter(Arc<PacketPipeInner>);

/// A one-directional pipe that preserves packet boundaries: each
/// `write` is one datagram, each `read` returns exactly one.
pub fn packet_pipe() -> (PacketPipeReader, PacketPipeWriter) {
    let inner = Arc::new(PacketPipeInner {
        state: Mutex::new((VecDeque::new(), false)),
        cond: Condvar::new(),
    });
    (PacketPipeReader(inner.clone()), PacketPipeWriter(inner))
}

impl Read for PacketPipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.state.lock().unwrap();
        while state.0.is_empty() && !state.1 {
            state = self.0.cond.wait(state).unwrap();
        }
        let Some(packet) = state.0.pop_front() else {
            return Ok(0);
        };
        let n = buf.len().min(packet.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }
}

impl Write for PacketPipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.0.state.lock().unwrap();
        state.0.push_back(buf.to_vec());
        self.0.cond.notify_all();
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PacketPipeWriter {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap();
        state.1 = true;
        self.0.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Test identity
// ---------------------------------------------------------------------------

/// Fixed 512-bit RSA keypair. Key generation and X.509 parsing are
/// outside the harness; these stand in for the external parser's
/// output.
pub const TEST_RSA_N: &str = "975a26ae08c19270c144cc4cc9d9b92d682259605c21455ce871c51f9c164fc2c64dedc4d3f56dedb034192323b38a829fdfb322373821f7474551c59f672cdb";
pub const TEST_RSA_E: &str = "010001";
pub const TEST_RSA_D: &str = "80a8eb1ea064e4f6a2e4b80342c7a969d70ef4093ce82f8da62f2892115eca1788c9b4f7055bb1f1591b5842bea0171f6e5826f0197a4ca0715310b280fe1f41";

pub fn test_rsa_public() -> RsaPublicKey {
    RsaPublicKey {
        n: hex_decode(TEST_RSA_N),
        e: hex_decode(TEST_RSA_E),
    }
}

pub fn test_rsa_private() -> RsaPrivateKey {
    RsaPrivateKey {
        public: test_rsa_public(),
        d: hex_decode(TEST_RSA_D),
    }
}

/// The server's certificate: an opaque DER blob plus pre-parsed keys.
pub fn test_certificate() -> Certificate {
    Certificate {
        certificate: vec![vec![0x30, 0x82, 0x00, 0x10, 0xde, 0xad, 0xbe, 0xef]],
        private_key: Some(test_rsa_private()),
        public_key: Some(test_rsa_public()),
        ..Default::default()
    }
}

fn hex_decode(s: &str) -> Vec<u8> {
    hex::decode(s).expect("valid hex")
}
