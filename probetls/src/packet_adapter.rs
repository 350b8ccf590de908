//! Packet-boundary framing over a byte stream, plus the timeout
//! synchronization opcodes the DTLS tests drive.
//!
//! Wire format: a one-byte opcode. `P` carries a 4-byte big-endian
//! length and that many payload bytes. `T` carries an 8-byte
//! big-endian duration in nanoseconds, telling the peer under test to
//! simulate a read timeout; the peer answers with a bare `t` after
//! flushing whatever it had buffered. The replay and damage adaptors
//! wrap an existing packet transport for retransmit and corruption
//! tests.

use std::io::{self, Read, Write};
use std::time::Duration;

use parking_lot::Mutex;

pub const OPCODE_PACKET: u8 = b'P';
pub const OPCODE_TIMEOUT: u8 = b'T';
pub const OPCODE_TIMEOUT_ACK: u8 = b't';

/// A datagram endpoint over a stream transport.
pub struct PacketAdaptor {
    reader: Mutex<Box<dyn Read + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl PacketAdaptor {
    pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> PacketAdaptor {
        PacketAdaptor {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    fn read_exact_locked(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<()> {
        reader.read_exact(buf)
    }

    fn read_opcode(reader: &mut dyn Read) -> io::Result<u8> {
        let mut op = [0u8; 1];
        Self::read_exact_locked(reader, &mut op)?;
        Ok(op[0])
    }

    fn read_packet_body(reader: &mut dyn Read) -> io::Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        Self::read_exact_locked(reader, &mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        Self::read_exact_locked(reader, &mut body)?;
        Ok(body)
    }

    /// Read one `P` packet; any other opcode is an error here.
    pub fn read_packet(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock();
        let opcode = Self::read_opcode(&mut **reader)?;
        if opcode != OPCODE_PACKET {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected opcode '{}'", opcode),
            ));
        }
        Self::read_packet_body(&mut **reader)
    }

    /// Write one `P` packet.
    pub fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        let mut payload = Vec::with_capacity(1 + 4 + packet.len());
        payload.push(OPCODE_PACKET);
        payload.extend_from_slice(&(packet.len() as u32).to_be_bytes());
        payload.extend_from_slice(packet);

        let mut writer = self.writer.lock();
        writer.write_all(&payload)?;
        writer.flush()?;
        Ok(packet.len())
    }

    /// Signal a simulated read timeout of `d` and collect every packet
    /// the peer flushes until it acknowledges with `t`. The collected
    /// packets are the ones the simulated timeout "dropped".
    pub fn send_read_timeout(&self, d: Duration) -> io::Result<Vec<Vec<u8>>> {
        log::debug!("packet adaptor: simulating read timeout of {:?}", d);
        {
            let mut writer = self.writer.lock();
            let mut payload = [0u8; 9];
            payload[0] = OPCODE_TIMEOUT;
            payload[1..].copy_from_slice(&(d.as_nanos() as u64).to_be_bytes());
            writer.write_all(&payload)?;
            writer.flush()?;
        }

        let mut reader = self.reader.lock();
        let mut packets = Vec::new();
        loop {
            match Self::read_opcode(&mut **reader)? {
                OPCODE_TIMEOUT_ACK => return Ok(packets),
                OPCODE_PACKET => {
                    let packet = Self::read_packet_body(&mut **reader)?;
                    log::debug!("packet adaptor: dropping {} byte packet", packet.len());
                    packets.push(packet);
                }
                opcode => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected opcode '{}'", opcode),
                    ))
                }
            }
        }
    }
}

/// Peer-under-test half of the timeout protocol: reads packets, and on
/// a `T` opcode replies with `t` after surfacing the timeout to the
/// caller. Useful for driving the adaptor from tests.
pub struct PacketAckReader<'a> {
    adaptor: &'a PacketAdaptor,
}

impl<'a> PacketAckReader<'a> {
    pub fn new(adaptor: &'a PacketAdaptor) -> PacketAckReader<'a> {
        PacketAckReader { adaptor }
    }

    /// Read one packet, transparently acknowledging any timeouts.
    /// Returns the durations of timeouts consumed along the way.
    pub fn read_packet_acking_timeouts(&self) -> io::Result<(Vec<u8>, Vec<Duration>)> {
        let mut timeouts = Vec::new();
        loop {
            let mut reader = self.adaptor.reader.lock();
            match PacketAdaptor::read_opcode(&mut **reader)? {
                OPCODE_PACKET => {
                    let packet = PacketAdaptor::read_packet_body(&mut **reader)?;
                    return Ok((packet, timeouts));
                }
                OPCODE_TIMEOUT => {
                    let mut nanos = [0u8; 8];
                    PacketAdaptor::read_exact_locked(&mut **reader, &mut nanos)?;
                    drop(reader);
                    timeouts.push(Duration::from_nanos(u64::from_be_bytes(nanos)));
                    let mut writer = self.adaptor.writer.lock();
                    writer.write_all(&[OPCODE_TIMEOUT_ACK])?;
                    writer.flush()?;
                }
                opcode => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unexpected opcode '{}'", opcode),
                    ))
                }
            }
        }
    }
}

/// Replays the previous packet after every write.
pub struct ReplayAdaptor<'a> {
    inner: &'a PacketAdaptor,
    prev_write: Mutex<Option<Vec<u8>>>,
}

impl<'a> ReplayAdaptor<'a> {
    pub fn new(inner: &'a PacketAdaptor) -> ReplayAdaptor<'a> {
        ReplayAdaptor {
            inner,
            prev_write: Mutex::new(None),
        }
    }

    pub fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        let n = self.inner.write_packet(packet)?;
        let mut prev = self.prev_write.lock();
        if let Some(prev_packet) = prev.as_ref() {
            self.inner.write_packet(prev_packet)?;
        }
        *prev = Some(packet.to_vec());
        Ok(n)
    }
}

/// Corrupts the final byte of every write while engaged.
pub struct DamageAdaptor<'a> {
    inner: &'a PacketAdaptor,
    damage: std::sync::atomic::AtomicBool,
}

impl<'a> DamageAdaptor<'a> {
    pub fn new(inner: &'a PacketAdaptor) -> DamageAdaptor<'a> {
        DamageAdaptor {
            inner,
            damage: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_damage(&self, damage: bool) {
        self.damage
            .store(damage, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        if self.damage.load(std::sync::atomic::Ordering::SeqCst) && !packet.is_empty() {
            let mut damaged = packet.to_vec();
            let last = damaged.len() - 1;
            damaged[last] = damaged[last].wrapping_add(1);
            return self.inner.write_packet(&damaged);
        }
        self.inner.write_packet(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// In-memory byte pipe.
    #[derive(Clone, Default)]
    struct Pipe(Arc<Mutex<VecDeque<u8>>>);

    impl Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.0.lock();
            let n = buf.len().min(inner.len());
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "pipe empty"));
            }
            for b in buf[..n].iter_mut() {
                *b = inner.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend(buf.iter());
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn adaptor_pair() -> (PacketAdaptor, PacketAdaptor) {
        let a_to_b = Pipe::default();
        let b_to_a = Pipe::default();
        let a = PacketAdaptor::new(Box::new(b_to_a.clone()), Box::new(a_to_b.clone()));
        let b = PacketAdaptor::new(Box::new(a_to_b), Box::new(b_to_a));
        (a, b)
    }

    #[test]
    fn test_packet_roundtrip() {
        let (a, b) = adaptor_pair();
        a.write_packet(b"datagram one").unwrap();
        a.write_packet(b"").unwrap();
        assert_eq!(b.read_packet().unwrap(), b"datagram one");
        assert_eq!(b.read_packet().unwrap(), b"");
    }

    #[test]
    fn test_timeout_flow() {
        let (driver, shim) = adaptor_pair();

        // The shim flushes two stale packets, then acks the timeout.
        shim.write_packet(b"stale flight 1").unwrap();
        shim.write_packet(b"stale flight 2").unwrap();
        {
            let mut w = shim.writer.lock();
            w.write_all(&[OPCODE_TIMEOUT_ACK]).unwrap();
        }

        let dropped = driver.send_read_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0], b"stale flight 1");

        // The shim sees the T opcode with the right duration.
        let reader = PacketAckReader::new(&shim);
        driver.write_packet(b"post-timeout").unwrap();
        let (packet, timeouts) = reader.read_packet_acking_timeouts().unwrap();
        assert_eq!(packet, b"post-timeout");
        assert_eq!(timeouts, vec![Duration::from_millis(100)]);
    }

    #[test]
    fn test_replay_adaptor() {
        let (a, b) = adaptor_pair();
        let replay = ReplayAdaptor::new(&a);
        replay.write_packet(b"first").unwrap();
        replay.write_packet(b"second").unwrap();
        assert_eq!(b.read_packet().unwrap(), b"first");
        assert_eq!(b.read_packet().unwrap(), b"second");
        assert_eq!(b.read_packet().unwrap(), b"first");
    }

    #[test]
    fn test_damage_adaptor() {
        let (a, b) = adaptor_pair();
        let damage = DamageAdaptor::new(&a);
        damage.write_packet(b"clean").unwrap();
        damage.set_damage(true);
        damage.write_packet(b"dirty").unwrap();
        assert_eq!(b.read_packet().unwrap(), b"clean");
        let got = b.read_packet().unwrap();
        assert_eq!(&got[..4], b"dirt");
        assert_eq!(got[4], b'y' + 1);
    }
}
