//! End-to-end handshake scenarios: two endpoints joined by in-memory
//! pipes, each running on its own thread.

mod common;

use std::sync::Arc;

use common::*;
use probetls::cipher::{
    TLS_AES_128_GCM_SHA256, TLS_CHACHA20_POLY1305_SHA256, TLS_RSA_WITH_AES_128_CBC_SHA,
    TLS_RSA_WITH_AES_128_GCM_SHA256,
};
use probetls::config::Config;
use probetls::{Conn, KEY_UPDATE_REQUESTED, VERSION_TLS10, VERSION_TLS12, VERSION_TLS13};

fn client_config() -> Config {
    Config {
        rand_seed: Some([0u8; 32]),
        server_name: "peer.test".to_string(),
        peer_rsa_key: Some(test_rsa_public()),
        now: Some(|| 1_700_000_000),
        ..Default::default()
    }
}

fn server_config() -> Config {
    Config {
        rand_seed: Some([1u8; 32]),
        certificates: vec![test_certificate()],
        now: Some(|| 1_700_000_000),
        ..Default::default()
    }
}

/// Run a client and server to completion over byte pipes; returns the
/// data each side read before EOF plus the client's wire bytes.
fn run_pair(
    client_config: Config,
    server_config: Config,
    client_body: impl FnOnce(&Conn) + Send + 'static,
    server_body: impl FnOnce(&Conn) + Send + 'static,
) -> Vec<u8> {
    let _ = env_logger::builder().is_test(true).try_init();
    let (client_read, server_write) = byte_pipe();
    let (server_read, client_write) = byte_pipe();
    let (recording, log) = RecordingWriter::new(client_write);

    let client = std::thread::spawn(move || {
        let conn = Conn::client(
            Box::new(client_read),
            Box::new(recording),
            Arc::new(client_config),
        );
        conn.handshake().expect("client handshake");
        client_body(&conn);
    });
    let server = std::thread::spawn(move || {
        let conn = Conn::server(
            Box::new(server_read),
            Box::new(server_write),
            Arc::new(server_config),
        );
        conn.handshake().expect("server handshake");
        server_body(&conn);
    });

    client.join().expect("client thread");
    server.join().expect("server thread");
    let bytes = log.lock().unwrap().clone();
    bytes
}

fn exchange_hello(version_check: u16) -> impl FnOnce(&Conn) {
    move |conn: &Conn| {
        assert_eq!(conn.connection_state().version, version_check);
        conn.write(b"hello").expect("write");
        conn.close().expect("close");
    }
}

fn expect_hello_then_eof() -> impl FnOnce(&Conn) {
    |conn: &Conn| {
        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        loop {
            let n = conn.read(&mut buf).expect("read");
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"hello");
    }
}

#[test]
fn test_tls12_rsa_handshake_deterministic_wire() {
    let mut cfg = client_config();
    cfg.cipher_suites = vec![TLS_RSA_WITH_AES_128_GCM_SHA256];
    cfg.max_version = VERSION_TLS12;
    let mut scfg = server_config();
    scfg.max_version = VERSION_TLS12;

    let wire1 = run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS12),
        expect_hello_then_eof(),
    );

    let mut cfg = client_config();
    cfg.cipher_suites = vec![TLS_RSA_WITH_AES_128_GCM_SHA256];
    cfg.max_version = VERSION_TLS12;
    let mut scfg = server_config();
    scfg.max_version = VERSION_TLS12;
    let wire2 = run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS12),
        expect_hello_then_eof(),
    );

    // Identical seeds must reproduce identical wire bytes.
    assert_eq!(wire1, wire2);
    assert!(!wire1.is_empty());
}

#[test]
fn test_tls12_cbc_suite() {
    let mut cfg = client_config();
    cfg.cipher_suites = vec![TLS_RSA_WITH_AES_128_CBC_SHA];
    cfg.max_version = VERSION_TLS12;
    let mut scfg = server_config();
    scfg.max_version = VERSION_TLS12;
    run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS12),
        expect_hello_then_eof(),
    );
}

#[test]
fn test_tls10_cbc_with_record_splitting() {
    let mut cfg = client_config();
    cfg.cipher_suites = vec![TLS_RSA_WITH_AES_128_CBC_SHA];
    cfg.max_version = VERSION_TLS10;
    let mut scfg = server_config();
    scfg.max_version = VERSION_TLS10;
    // The 1/n-1 split is an observable on-the-wire behavior; the peer
    // reassembles transparently.
    run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS10),
        expect_hello_then_eof(),
    );
}

#[test]
fn test_tls13_full_handshake() {
    let mut cfg = client_config();
    cfg.cipher_suites = vec![TLS_AES_128_GCM_SHA256];
    let scfg = server_config();
    run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS13),
        expect_hello_then_eof(),
    );
}

#[test]
fn test_tls13_chacha20_suite() {
    let mut cfg = client_config();
    cfg.cipher_suites = vec![TLS_CHACHA20_POLY1305_SHA256];
    let scfg = server_config();
    run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS13),
        expect_hello_then_eof(),
    );
}

#[test]
fn test_tls13_middlebox_ccs_injection() {
    // The server interleaves the compatibility ChangeCipherSpec; the
    // client consumes it only at its single tolerated point.
    let mut cfg = client_config();
    cfg.bugs.expect_tls13_change_cipher_spec = true;
    let mut scfg = server_config();
    scfg.bugs.send_tls13_change_cipher_spec = true;
    run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS13),
        expect_hello_then_eof(),
    );
}

#[test]
fn test_tls13_key_update_requested() {
    let cfg = client_config();
    let scfg = server_config();
    run_pair(
        cfg,
        scfg,
        |conn| {
            // The client sees the server's KeyUpdate while reading,
            // installs the new inbound secret and schedules its own
            // update for the next write.
            let mut buf = [0u8; 16];
            let n = conn.read(&mut buf).expect("read after key update");
            assert_eq!(&buf[..n], b"ping");
            conn.write(b"pong").expect("write after key update");
            conn.close().expect("close");
        },
        |conn| {
            conn.send_key_update(KEY_UPDATE_REQUESTED)
                .expect("send KeyUpdate");
            conn.write(b"ping").expect("write");
            let mut buf = [0u8; 16];
            let n = conn.read(&mut buf).expect("read");
            assert_eq!(&buf[..n], b"pong");
            let n = conn.read(&mut buf).expect("read EOF");
            assert_eq!(n, 0);
        },
    );
}

#[test]
fn test_tls13_resumption() {
    let cache = Arc::new(probetls::new_lru_client_session_cache(4));

    // First connection mints a ticket.
    let mut cfg = client_config();
    cfg.client_session_cache = Some(cache.clone());
    let mut scfg = server_config();
    *scfg.session_ticket_key.lock() = [7u8; 32];
    run_pair(
        cfg,
        scfg,
        |conn| {
            // Drain until EOF so the NewSessionTicket is processed.
            let mut buf = [0u8; 32];
            while conn.read(&mut buf).expect("read") != 0 {}
            assert!(!conn.connection_state().did_resume);
        },
        |conn| {
            conn.write(b"x").expect("write");
            conn.close().expect("close");
        },
    );

    // Second connection resumes through the PSK.
    let mut cfg = client_config();
    cfg.client_session_cache = Some(cache);
    let mut scfg = server_config();
    *scfg.session_ticket_key.lock() = [7u8; 32];
    run_pair(
        cfg,
        scfg,
        |conn| {
            let mut buf = [0u8; 32];
            while conn.read(&mut buf).expect("read") != 0 {}
            assert!(conn.connection_state().did_resume);
        },
        |conn| {
            assert!(conn.connection_state().did_resume);
            conn.write(b"y").expect("write");
            conn.close().expect("close");
        },
    );
}

#[test]
fn test_tls12_renegotiation_via_hello_request() {
    let mut cfg = client_config();
    cfg.max_version = VERSION_TLS12;
    let mut scfg = server_config();
    scfg.max_version = VERSION_TLS12;
    run_pair(
        cfg,
        scfg,
        |conn| {
            // The HelloRequest arrives during this read and triggers a
            // fresh handshake before data flows.
            let mut buf = [0u8; 32];
            let n = conn.read(&mut buf).expect("read across renegotiation");
            assert_eq!(&buf[..n], b"again");
            assert_eq!(conn.read(&mut buf).expect("eof"), 0);
        },
        |conn| {
            conn.renegotiate().expect("renegotiate");
            conn.write(b"again").expect("write");
            conn.close().expect("close");
        },
    );
}

#[test]
fn test_alpn_negotiation() {
    let mut cfg = client_config();
    cfg.next_protos = vec!["h2".to_string(), "http/1.1".to_string()];
    let mut scfg = server_config();
    scfg.next_protos = vec!["h2".to_string()];
    run_pair(
        cfg,
        scfg,
        |conn| {
            let state = conn.connection_state();
            assert_eq!(state.negotiated_protocol, "h2");
            assert!(state.negotiated_protocol_from_alpn);
            conn.close().expect("close");
        },
        |conn| {
            assert_eq!(conn.connection_state().negotiated_protocol, "h2");
            let mut buf = [0u8; 8];
            let _ = conn.read(&mut buf);
        },
    );
}

#[test]
fn test_exporters_agree() {
    let cfg = client_config();
    let scfg = server_config();
    let exported: Arc<std::sync::Mutex<Vec<Vec<u8>>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let c_exp = exported.clone();
    let s_exp = exported.clone();
    run_pair(
        cfg,
        scfg,
        move |conn| {
            let value = conn
                .export_keying_material(32, b"test label", b"ctx", true)
                .expect("client exporter");
            c_exp.lock().unwrap().push(value);
            conn.close().expect("close");
        },
        move |conn| {
            let value = conn
                .export_keying_material(32, b"test label", b"ctx", true)
                .expect("server exporter");
            s_exp.lock().unwrap().push(value);
            let mut buf = [0u8; 8];
            let _ = conn.read(&mut buf);
        },
    );
    let values = exported.lock().unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0], values[1]);
}

#[test]
fn test_record_padding_on_the_wire() {
    // Extra TLS 1.3 record padding must decrypt transparently.
    let mut cfg = client_config();
    cfg.bugs.record_padding = 117;
    let scfg = server_config();
    run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS13),
        expect_hello_then_eof(),
    );
}

#[test]
fn test_max_padding_cbc() {
    let mut cfg = client_config();
    cfg.cipher_suites = vec![TLS_RSA_WITH_AES_128_CBC_SHA];
    cfg.max_version = VERSION_TLS12;
    cfg.bugs.max_padding = true;
    let mut scfg = server_config();
    scfg.max_version = VERSION_TLS12;
    run_pair(
        cfg,
        scfg,
        exchange_hello(VERSION_TLS12),
        expect_hello_then_eof(),
    );
}

#[test]
fn test_corrupted_finished_is_rejected() {
    let (client_read, server_write) = byte_pipe();
    let (server_read, client_write) = byte_pipe();

    let mut cfg = client_config();
    cfg.bugs.bad_finished = true;
    let scfg = server_config();

    let client = std::thread::spawn(move || {
        let conn = Conn::client(
            Box::new(client_read),
            Box::new(client_write),
            Arc::new(cfg),
        );
        // Either our handshake errors out on the server's alert or the
        // write after it does.
        let result = conn.handshake().and_then(|_| conn.read(&mut [0u8; 8]).map(|_| ()));
        assert!(result.is_err());
    });
    let server = std::thread::spawn(move || {
        let conn = Conn::server(
            Box::new(server_read),
            Box::new(server_write),
            Arc::new(scfg),
        );
        assert!(conn.handshake().is_err());
    });
    client.join().unwrap();
    server.join().unwrap();
}
