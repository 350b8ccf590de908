//! DTLS end-to-end scenarios: datagram framing over packet pipes, the
//! cookie exchange, fragmentation knobs, and the timeout-schedule
//! synchronization through the packet adaptor.

mod common;

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use probetls::cipher::TLS_RSA_WITH_AES_128_GCM_SHA256;
use probetls::config::Config;
use probetls::packet_adapter::{PacketAckReader, PacketAdaptor};
use probetls::{Conn, VERSION_TLS12};

fn dtls_client_config() -> Config {
    Config {
        rand_seed: Some([0u8; 32]),
        server_name: "peer.test".to_string(),
        peer_rsa_key: Some(test_rsa_public()),
        cipher_suites: vec![TLS_RSA_WITH_AES_128_GCM_SHA256],
        now: Some(|| 1_700_000_000),
        ..Default::default()
    }
}

fn dtls_server_config() -> Config {
    Config {
        rand_seed: Some([1u8; 32]),
        certificates: vec![test_certificate()],
        now: Some(|| 1_700_000_000),
        ..Default::default()
    }
}

fn run_dtls_pair(
    client_config: Config,
    server_config: Config,
    client_body: impl FnOnce(&Conn) + Send + 'static,
    server_body: impl FnOnce(&Conn) + Send + 'static,
) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_read, server_write) = packet_pipe();
    let (server_read, client_write) = packet_pipe();

    let client = std::thread::spawn(move || {
        let conn = Conn::dtls_client(
            Box::new(client_read),
            Box::new(client_write),
            Arc::new(client_config),
        );
        conn.handshake().expect("client handshake");
        client_body(&conn);
    });
    let server = std::thread::spawn(move || {
        let conn = Conn::dtls_server(
            Box::new(server_read),
            Box::new(server_write),
            Arc::new(server_config),
        );
        conn.handshake().expect("server handshake");
        server_body(&conn);
    });
    client.join().expect("client thread");
    server.join().expect("server thread");
}

#[test]
fn test_dtls12_handshake_and_data() {
    run_dtls_pair(
        dtls_client_config(),
        dtls_server_config(),
        |conn| {
            assert_eq!(conn.connection_state().version, VERSION_TLS12);
            conn.write(b"datagram payload").expect("write");
            conn.close().expect("close");
        },
        |conn| {
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).expect("read");
            assert_eq!(&buf[..n], b"datagram payload");
            assert_eq!(conn.read(&mut buf).expect("eof"), 0);
        },
    );
}

#[test]
fn test_dtls12_without_cookie_exchange() {
    let cfg = dtls_client_config();
    let mut scfg = dtls_server_config();
    scfg.bugs.skip_hello_verify_request = true;
    run_dtls_pair(
        cfg,
        scfg,
        |conn| {
            conn.write(b"no cookie").expect("write");
            conn.close().expect("close");
        },
        |conn| {
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).expect("read");
            assert_eq!(&buf[..n], b"no cookie");
        },
    );
}

#[test]
fn test_dtls12_small_fragments() {
    let mut cfg = dtls_client_config();
    cfg.bugs.max_handshake_record_length = 17;
    let mut scfg = dtls_server_config();
    scfg.bugs.max_handshake_record_length = 23;
    run_dtls_pair(
        cfg,
        scfg,
        |conn| {
            conn.write(b"fragmented").expect("write");
            conn.close().expect("close");
        },
        |conn| {
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).expect("read");
            assert_eq!(&buf[..n], b"fragmented");
        },
    );
}

#[test]
fn test_dtls12_packed_fragments() {
    let mut cfg = dtls_client_config();
    cfg.bugs.pack_handshake_fragments = 400;
    cfg.bugs.pack_handshake_records = 1200;
    run_dtls_pair(
        cfg,
        dtls_server_config(),
        |conn| {
            conn.write(b"packed").expect("write");
            conn.close().expect("close");
        },
        |conn| {
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).expect("read");
            assert_eq!(&buf[..n], b"packed");
        },
    );
}

/// Stream view of a packet adaptor: reads and writes whole datagrams.
struct AdaptorStream(Arc<PacketAdaptor>);

impl Read for AdaptorStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let packet = self.0.read_packet()?;
        let n = buf.len().min(packet.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }
}

impl Write for AdaptorStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write_packet(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Peer-under-test view: surfaces packets, acknowledges timeout
/// opcodes, and counts them.
struct AckingStream {
    adaptor: Arc<PacketAdaptor>,
    timeouts_seen: Arc<AtomicUsize>,
}

impl Read for AckingStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let reader = PacketAckReader::new(&self.adaptor);
        let (packet, timeouts) = reader.read_packet_acking_timeouts()?;
        self.timeouts_seen.fetch_add(timeouts.len(), Ordering::SeqCst);
        let n = buf.len().min(packet.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }
}

impl Write for AckingStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.adaptor.write_packet(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_dtls_timeout_schedule() {
    // Driver and peer share a P/T/t framed stream: the driver walks
    // its timeout schedule ahead of the first flight and the peer must
    // acknowledge each T opcode before the handshake proceeds.
    let (a_read, b_write) = byte_pipe();
    let (b_read, a_write) = byte_pipe();

    let driver_adaptor = Arc::new(PacketAdaptor::new(Box::new(a_read), Box::new(a_write)));
    let peer_adaptor = Arc::new(PacketAdaptor::new(Box::new(b_read), Box::new(b_write)));
    let timeouts_seen = Arc::new(AtomicUsize::new(0));

    let mut cfg = dtls_client_config();
    cfg.bugs.timeout_schedule =
        vec![Duration::from_millis(100), Duration::from_millis(200)];
    cfg.bugs.packet_adaptor = Some(driver_adaptor.clone());

    let client = std::thread::spawn(move || {
        let conn = Conn::dtls_client(
            Box::new(AdaptorStream(driver_adaptor.clone())),
            Box::new(AdaptorStream(driver_adaptor)),
            Arc::new(cfg),
        );
        conn.handshake().expect("client handshake");
        conn.write(b"after timeouts").expect("write");
        conn.close().expect("close");
    });

    let counter = timeouts_seen.clone();
    let server = std::thread::spawn(move || {
        let conn = Conn::dtls_server(
            Box::new(AckingStream {
                adaptor: peer_adaptor.clone(),
                timeouts_seen: counter,
            }),
            Box::new(AckingStream {
                adaptor: peer_adaptor,
                timeouts_seen: Arc::new(AtomicUsize::new(0)),
            }),
            Arc::new(dtls_server_config()),
        );
        conn.handshake().expect("server handshake");
        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"after timeouts");
    });

    client.join().expect("client thread");
    server.join().expect("server thread");

    assert_eq!(timeouts_seen.load(Ordering::SeqCst), 2);
}
