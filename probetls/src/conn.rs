//! The connection state machine: record read/write pipelines,
//! handshake message buffering and reassembly, post-handshake message
//! dispatch, alerts, key updates, renegotiation and exporters.
//!
//! Locking discipline: handshake mutex < in mutex < out mutex <
//! negotiated-state mutex. A fatal error latches on the half-connection
//! that produced it.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::alert::*;
use crate::buffer::Block;
use crate::cipher::{cipher_suite_by_id, CipherSuite};
use crate::config::Config;
use crate::error::{Error, TlsResult};
use crate::halfconn::HalfConn;
use crate::messages::{
    parse_handshake, HandshakeMessage, HelloRequestMsg, KeyUpdateMsg, NewSessionTicketMsg,
    ParseContext,
};
use crate::prf::{
    derive_session_psk, hkdf_expand_label, prf_for_version, update_traffic_secret,
};
use crate::session::{encrypt_ticket, ClientSessionState, SessionState};
use crate::{
    wire_to_version, KEY_UPDATE_NOT_REQUESTED, KEY_UPDATE_REQUESTED, MAX_CIPHERTEXT,
    MAX_HANDSHAKE, MAX_PLAINTEXT, RECORD_TYPE_ALERT, RECORD_TYPE_APPLICATION_DATA,
    RECORD_TYPE_CHANGE_CIPHER_SPEC, RECORD_TYPE_HANDSHAKE, TYPE_CLIENT_HELLO, TYPE_HELLO_REQUEST,
    TYPE_HELLO_RETRY_REQUEST, TYPE_SERVER_HELLO, VERSION_TLS10, VERSION_TLS12, VERSION_TLS13,
};

/// Per-direction inbound state.
pub(crate) struct HalfIn {
    pub half: HalfConn,
    pub reader: Box<dyn Read + Send>,
    /// Raw input straight off the wire.
    pub raw_input: Option<Block>,
    /// An application record waiting to be read.
    pub input: Option<Block>,
    /// Handshake bytes awaiting reassembly.
    pub hand: Vec<u8>,
    /// Server side: early data records must be skipped over.
    pub skip_early_data: bool,
    pub seen_handshake_pack_end: bool,
    pub seen_one_byte_record: bool,
    pub expect_tls13_ccs: bool,
    // DTLS reassembly state.
    pub recv_handshake_seq: u16,
    pub hand_msg: Option<Vec<u8>>,
    pub hand_msg_len: usize,
}

/// Per-direction outbound state.
pub(crate) struct HalfOut {
    pub half: HalfConn,
    pub writer: Box<dyn Write + Send>,
    /// Whole-flight packing buffer (PackHandshakeFlight).
    pub pending_flight: Vec<u8>,
    // DTLS fragmentation state.
    pub send_handshake_seq: u16,
    pub pending_fragments: Vec<Vec<u8>>,
    pub pending_packet: Vec<u8>,
}

/// Handshake-scoped state, guarded by the handshake mutex.
pub(crate) struct HandshakeState {
    pub err: Option<Error>,
    /// Whether any handshake has completed on this connection.
    pub done_first_handshake: bool,
    pub client_verify: Vec<u8>,
    pub server_verify: Vec<u8>,
}

/// Negotiated parameters; a leaf mutex readable from either direction.
#[derive(Default)]
pub(crate) struct Negotiated {
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],
    pub did_resume: bool,
    pub extended_master_secret: bool,
    pub peer_certificates: Vec<Vec<u8>>,
    pub ocsp_response: Vec<u8>,
    pub sct_list: Vec<u8>,
    pub alpn_protocol: String,
    pub used_alpn: bool,
    pub server_name: String,
    pub srtp_protection_profile: u16,
    pub quic_transport_params: Vec<u8>,
    /// TLS 1.3 resumption master secret.
    pub resumption_secret: Vec<u8>,
    /// TLS 1.2: the master secret; TLS 1.3: the exporter secret.
    pub exporter_secret: Vec<u8>,
    pub early_exporter_secret: Vec<u8>,
    pub channel_id: Vec<u8>,
}

/// A snapshot of the negotiated connection parameters.
#[derive(Clone, Default)]
pub struct ConnectionState {
    pub handshake_complete: bool,
    pub version: u16,
    pub cipher_suite: u16,
    pub did_resume: bool,
    pub negotiated_protocol: String,
    pub negotiated_protocol_from_alpn: bool,
    pub server_name: String,
    pub peer_certificates: Vec<Vec<u8>>,
    pub srtp_protection_profile: u16,
    pub sct_list: Vec<u8>,
    pub ocsp_response: Vec<u8>,
    pub quic_transport_params: Vec<u8>,
    pub extended_master_secret: bool,
}

/// A TLS or DTLS endpoint over a byte stream.
pub struct Conn {
    pub(crate) is_client: bool,
    pub(crate) is_dtls: bool,
    pub(crate) config: Arc<Config>,

    pub(crate) vers: AtomicU16,
    pub(crate) wire_vers: AtomicU16,
    pub(crate) have_vers: AtomicBool,
    pub(crate) handshake_complete: AtomicBool,
    pub(crate) suite_id: AtomicU16,
    pub(crate) key_update_seen: AtomicBool,
    pub(crate) key_update_requested: AtomicBool,

    pub(crate) hs: Mutex<HandshakeState>,
    pub(crate) inp: Mutex<HalfIn>,
    pub(crate) out: Mutex<HalfOut>,
    pub(crate) neg: Mutex<Negotiated>,
    pub(crate) rng: Mutex<StdRng>,
}

impl Conn {
    fn new(
        is_client: bool,
        is_dtls: bool,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        config: Arc<Config>,
    ) -> Conn {
        let rng = match config.rand_seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_entropy(),
        };
        Conn {
            is_client,
            is_dtls,
            config: config.clone(),
            vers: AtomicU16::new(0),
            wire_vers: AtomicU16::new(0),
            have_vers: AtomicBool::new(false),
            handshake_complete: AtomicBool::new(false),
            suite_id: AtomicU16::new(0),
            key_update_seen: AtomicBool::new(false),
            key_update_requested: AtomicBool::new(false),
            hs: Mutex::new(HandshakeState {
                err: None,
                done_first_handshake: false,
                client_verify: Vec::new(),
                server_verify: Vec::new(),
            }),
            inp: Mutex::new(HalfIn {
                half: HalfConn::new(is_dtls, config.clone()),
                reader,
                raw_input: None,
                input: None,
                hand: Vec::new(),
                skip_early_data: false,
                seen_handshake_pack_end: false,
                seen_one_byte_record: false,
                expect_tls13_ccs: false,
                recv_handshake_seq: 0,
                hand_msg: None,
                hand_msg_len: 0,
            }),
            out: Mutex::new(HalfOut {
                half: HalfConn::new(is_dtls, config),
                writer,
                pending_flight: Vec::new(),
                send_handshake_seq: 0,
                pending_fragments: Vec::new(),
                pending_packet: Vec::new(),
            }),
            neg: Mutex::new(Negotiated::default()),
            rng: Mutex::new(rng),
        }
    }

    /// A TLS client endpoint.
    pub fn client(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        config: Arc<Config>,
    ) -> Conn {
        Conn::new(true, false, reader, writer, config)
    }

    /// A TLS server endpoint.
    pub fn server(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        config: Arc<Config>,
    ) -> Conn {
        Conn::new(false, false, reader, writer, config)
    }

    /// A DTLS client endpoint; each read must deliver one packet.
    pub fn dtls_client(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        config: Arc<Config>,
    ) -> Conn {
        Conn::new(true, true, reader, writer, config)
    }

    /// A DTLS server endpoint.
    pub fn dtls_server(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        config: Arc<Config>,
    ) -> Conn {
        Conn::new(false, true, reader, writer, config)
    }

    // -----------------------------------------------------------------
    // Version plumbing
    // -----------------------------------------------------------------

    pub(crate) fn vers(&self) -> u16 {
        self.vers.load(Ordering::SeqCst)
    }

    pub(crate) fn wire_vers(&self) -> u16 {
        self.wire_vers.load(Ordering::SeqCst)
    }

    pub(crate) fn have_vers(&self) -> bool {
        self.have_vers.load(Ordering::SeqCst)
    }

    pub(crate) fn set_version(&self, wire_vers: u16) -> TlsResult<()> {
        let vers = wire_to_version(wire_vers, self.is_dtls)
            .ok_or_else(|| Error::ProtocolViolation("unknown wire version".to_string()))?;
        self.vers.store(vers, Ordering::SeqCst);
        self.wire_vers.store(wire_vers, Ordering::SeqCst);
        self.have_vers.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn suite(&self) -> Option<&'static CipherSuite> {
        cipher_suite_by_id(self.suite_id.load(Ordering::SeqCst))
    }

    pub(crate) fn set_suite(&self, suite: &'static CipherSuite) {
        self.suite_id.store(suite.id, Ordering::SeqCst);
    }

    pub(crate) fn fill_random(&self, buf: &mut [u8]) {
        self.rng.lock().fill_bytes(buf);
    }

    // -----------------------------------------------------------------
    // Traffic secret installation (TLS 1.3)
    // -----------------------------------------------------------------

    pub(crate) fn use_in_traffic_secret(
        &self,
        inp: &mut HalfIn,
        wire_version: u16,
        suite: &CipherSuite,
        secret: &[u8],
    ) -> TlsResult<()> {
        if !inp.hand.is_empty() {
            return Err(inp.half.set_error(Error::UnexpectedMessage(
                "buffered handshake messages on cipher change".to_string(),
            )));
        }
        let side = if self.is_client {
            crate::halfconn::TrafficDirection::ServerWrite
        } else {
            crate::halfconn::TrafficDirection::ClientWrite
        };
        inp.half.use_traffic_secret(wire_version, suite, secret, side);
        inp.seen_handshake_pack_end = false;
        Ok(())
    }

    pub(crate) fn use_out_traffic_secret(
        &self,
        out: &mut HalfOut,
        wire_version: u16,
        suite: &CipherSuite,
        secret: &[u8],
    ) {
        let side = if self.is_client {
            crate::halfconn::TrafficDirection::ClientWrite
        } else {
            crate::halfconn::TrafficDirection::ServerWrite
        };
        out.half.use_traffic_secret(wire_version, suite, secret, side);
    }

    // -----------------------------------------------------------------
    // Record reading
    // -----------------------------------------------------------------

    /// Read one record from the wire and open it. Returns the inner
    /// content type and the payload block (cursor past any prefix).
    fn do_read_record(&self, inp: &mut HalfIn, want: u8) -> TlsResult<(u8, Block)> {
        loop {
            if self.is_dtls {
                return self.dtls_do_read_record(inp, want);
            }

            let header_len = inp.half.record_header_len();
            let mut b = match inp.raw_input.take() {
                Some(b) => b,
                None => inp.half.pool.new_block(),
            };

            if let Err(err) = b.read_from_until(&mut inp.reader, header_len) {
                let err = match err {
                    Error::UnexpectedEof if b.data.is_empty() => {
                        if self.config.bugs.expect_close_notify {
                            Error::UnexpectedEof
                        } else {
                            Error::CloseNotify
                        }
                    }
                    other => other,
                };
                return Err(inp.half.set_error(err));
            }

            let typ = b.data[0];

            // An SSLv2 record has its high length bit set where the
            // content type belongs.
            if want == RECORD_TYPE_HANDSHAKE && typ == 0x80 {
                let _ = self.send_alert(ALERT_PROTOCOL_VERSION);
                return Err(inp.half.set_error(Error::RecordFraming(
                    "unsupported SSLv2 handshake received".to_string(),
                )));
            }

            let vers = u16::from_be_bytes([b.data[1], b.data[2]]);
            let n = u16::from_be_bytes([b.data[3], b.data[4]]) as usize;

            if typ != RECORD_TYPE_ALERT {
                let expect = if self.have_vers() {
                    let mut expect = self.vers();
                    if expect >= VERSION_TLS13 {
                        expect = VERSION_TLS12;
                    }
                    expect
                } else {
                    self.config.bugs.expect_initial_record_version
                };
                if expect != 0 && vers != expect {
                    let _ = self.send_alert(ALERT_PROTOCOL_VERSION);
                    return Err(inp.half.set_error(Error::RecordFraming(format!(
                        "received record with version {:04x} when expecting version {:04x}",
                        vers, expect
                    ))));
                }
            }
            if n > MAX_CIPHERTEXT {
                let _ = self.send_alert(ALERT_RECORD_OVERFLOW);
                return Err(inp.half.set_error(Error::RecordFraming(format!(
                    "oversized record received with length {}",
                    n
                ))));
            }
            if !self.have_vers() {
                // First-flight sanity check: reject anything that does
                // not look like a TLS handshake.
                if (typ != RECORD_TYPE_ALERT && typ != want) || vers >= 0x1000 || n >= 0x3000 {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(inp.half.set_error(Error::RecordFraming(
                        "first record does not look like a TLS handshake".to_string(),
                    )));
                }
            }

            if let Err(err) = b.read_from_until(&mut inp.reader, header_len + n) {
                let err = match err {
                    Error::CloseNotify => Error::UnexpectedEof,
                    other => other,
                };
                return Err(inp.half.set_error(err));
            }

            let (mut b, rest) = inp.half.pool.split_block(b, header_len + n);
            inp.raw_input = rest;

            let decrypt_result = inp.half.decrypt(&mut b);
            let (off, enc_typ) = match decrypt_result {
                Ok(v) => v,
                Err(alert_value) => {
                    if inp.skip_early_data {
                        inp.half.pool.free_block(b);
                        continue;
                    }
                    let _ = self.send_alert(alert_value);
                    return Err(inp.half.set_error(Error::CryptoFailure(alert_value)));
                }
            };

            if inp.half.cipher.is_none()
                && typ == RECORD_TYPE_APPLICATION_DATA
                && inp.skip_early_data
            {
                inp.half.pool.free_block(b);
                continue;
            }

            b.off = off;
            inp.skip_early_data = false;

            let mut typ = typ;
            if self.vers() >= VERSION_TLS13 && !inp.half.cipher.is_none() {
                if typ != RECORD_TYPE_APPLICATION_DATA {
                    return Err(inp.half.set_error(Error::UnexpectedMessage(
                        "outer record type is not application data".to_string(),
                    )));
                }
                typ = enc_typ;
            }

            let length = b.data.len() - b.off;
            if self.config.bugs.expect_record_splitting
                && typ == RECORD_TYPE_APPLICATION_DATA
                && length != 1
                && !inp.seen_one_byte_record
            {
                return Err(inp.half.set_error(Error::Expectation(
                    "application data records were not split".to_string(),
                )));
            }
            inp.seen_one_byte_record = typ == RECORD_TYPE_APPLICATION_DATA && length == 1;

            return Ok((typ, b));
        }
    }

    /// Consume the middlebox-compatibility ChangeCipherSpec, or fall
    /// through when an alert shows up instead.
    fn read_tls13_change_cipher_spec(&self, inp: &mut HalfIn) -> TlsResult<()> {
        assert!(inp.expect_tls13_ccs);

        let mut b = match inp.raw_input.take() {
            Some(b) => b,
            None => inp.half.pool.new_block(),
        };
        if let Err(err) = b.read_from_until(&mut inp.reader, 1) {
            inp.raw_input = Some(b);
            return Err(inp.half.set_error(Error::RecordFraming(format!(
                "error reading TLS 1.3 ChangeCipherSpec: {}",
                err
            ))));
        }
        if b.data[0] == RECORD_TYPE_ALERT {
            // Not the CCS: clear the expectation and let the caller
            // process the alert.
            inp.raw_input = Some(b);
            inp.expect_tls13_ccs = false;
            return Ok(());
        }
        if let Err(err) = b.read_from_until(&mut inp.reader, 6) {
            inp.raw_input = Some(b);
            return Err(inp.half.set_error(Error::RecordFraming(format!(
                "error reading TLS 1.3 ChangeCipherSpec: {}",
                err
            ))));
        }

        let mut expected = [RECORD_TYPE_CHANGE_CIPHER_SPEC, 3, 1, 0, 1, 1];
        if self.vers() >= VERSION_TLS13 {
            expected[2] = 3;
        }
        if b.data[..6] != expected {
            let got = b.data[..6].to_vec();
            inp.raw_input = Some(b);
            return Err(inp.half.set_error(Error::RecordFraming(format!(
                "invalid TLS 1.3 ChangeCipherSpec: {:02x?}",
                got
            ))));
        }

        let (consumed, rest) = inp.half.pool.split_block(b, 6);
        inp.half.pool.free_block(consumed);
        inp.raw_input = rest;
        inp.expect_tls13_ccs = false;
        Ok(())
    }

    /// Read one record and dispatch by content type, updating the
    /// record layer state.
    pub(crate) fn read_record(&self, inp: &mut HalfIn, want: u8) -> TlsResult<()> {
        match want {
            RECORD_TYPE_APPLICATION_DATA | RECORD_TYPE_ALERT | RECORD_TYPE_HANDSHAKE => {}
            RECORD_TYPE_CHANGE_CIPHER_SPEC => {
                if self.handshake_complete.load(Ordering::SeqCst) {
                    let _ = self.send_alert(ALERT_INTERNAL_ERROR);
                    return Err(inp.half.set_error(Error::UnexpectedMessage(
                        "ChangeCipherSpec requested after handshake complete".to_string(),
                    )));
                }
            }
            _ => {
                let _ = self.send_alert(ALERT_INTERNAL_ERROR);
                return Err(inp.half.set_error(Error::UnexpectedMessage(
                    "unknown record type requested".to_string(),
                )));
            }
        }

        if inp.expect_tls13_ccs {
            self.read_tls13_change_cipher_spec(inp)?;
        }

        loop {
            let (typ, mut b) = self.do_read_record(inp, want)?;
            let data_len = b.data.len() - b.off;
            let max = if self.config.bugs.max_receive_plaintext != 0 {
                self.config.bugs.max_receive_plaintext
            } else {
                MAX_PLAINTEXT
            };
            if data_len > max {
                let _ = self.send_alert(ALERT_RECORD_OVERFLOW);
                inp.half.pool.free_block(b);
                return Err(inp.half.set_error(Error::RecordFraming(
                    "plaintext record too large".to_string(),
                )));
            }

            if typ != RECORD_TYPE_HANDSHAKE {
                inp.seen_handshake_pack_end = false;
            } else if inp.seen_handshake_pack_end {
                inp.half.pool.free_block(b);
                return Err(inp.half.set_error(Error::Expectation(
                    "peer violated ExpectPackedEncryptedHandshake".to_string(),
                )));
            }

            match typ {
                RECORD_TYPE_ALERT => {
                    let data = b.remaining().to_vec();
                    inp.half.pool.free_block(b);
                    if data.len() != 2 {
                        let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                        return Err(inp.half.set_error(Error::UnexpectedMessage(
                            "malformed alert record".to_string(),
                        )));
                    }
                    if Alert(data[1]) == ALERT_CLOSE_NOTIFY {
                        return Err(inp.half.set_error(Error::CloseNotify));
                    }
                    match data[0] {
                        crate::ALERT_LEVEL_WARNING => {
                            if Alert(data[1]) == ALERT_NO_CERTIFICATE {
                                return Err(Error::NoCertificate);
                            }
                            if Alert(data[1]) == ALERT_END_OF_EARLY_DATA {
                                return Err(Error::EndOfEarlyData);
                            }
                            // Other warnings are dropped on the floor;
                            // resume the read loop.
                            log::debug!(
                                "ignoring warning alert {}",
                                Alert(data[1]).description()
                            );
                            continue;
                        }
                        crate::ALERT_LEVEL_ERROR => {
                            return Err(inp.half.set_error(Error::RemoteAlert(Alert(data[1]))));
                        }
                        _ => {
                            let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                            return Err(inp.half.set_error(Error::UnexpectedMessage(
                                "alert with unknown level".to_string(),
                            )));
                        }
                    }
                }

                RECORD_TYPE_CHANGE_CIPHER_SPEC => {
                    let data = b.remaining().to_vec();
                    inp.half.pool.free_block(b);
                    if typ != want || data.len() != 1 || data[0] != 1 {
                        let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                        return Err(inp.half.set_error(Error::UnexpectedMessage(
                            "unexpected or malformed ChangeCipherSpec".to_string(),
                        )));
                    }
                    if !inp.hand.is_empty() {
                        return Err(inp.half.set_error(Error::UnexpectedMessage(
                            "buffered handshake messages on cipher change".to_string(),
                        )));
                    }
                    if let Err(alert) = inp.half.change_cipher_spec() {
                        let _ = self.send_alert(alert);
                        return Err(inp.half.set_error(Error::CryptoFailure(alert)));
                    }
                    return Ok(());
                }

                RECORD_TYPE_APPLICATION_DATA => {
                    if typ != want {
                        inp.half.pool.free_block(b);
                        let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                        return Err(inp.half.set_error(Error::UnexpectedMessage(
                            "application data record not requested".to_string(),
                        )));
                    }
                    inp.input = Some(b);
                    return Ok(());
                }

                RECORD_TYPE_HANDSHAKE => {
                    if typ != want && want != RECORD_TYPE_APPLICATION_DATA {
                        // The peer started a handshake we did not ask
                        // for: answer with a warning and drop it.
                        inp.half.pool.free_block(b);
                        self.send_alert(ALERT_NO_RENEGOTIATION)?;
                        return Ok(());
                    }
                    let data_len = b.data.len() - b.off;
                    inp.hand.extend_from_slice(b.remaining());
                    let pack = self.config.bugs.expect_packed_encrypted_handshake;
                    if pack > 0 && data_len < pack && !inp.half.cipher.is_none() {
                        inp.seen_handshake_pack_end = true;
                    }
                    inp.half.pool.free_block(b);
                    return Ok(());
                }

                _ => {
                    inp.half.pool.free_block(b);
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(inp.half.set_error(Error::UnexpectedMessage(
                        "record with unknown content type".to_string(),
                    )));
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Alerts
    // -----------------------------------------------------------------

    pub(crate) fn send_alert_locked(
        &self,
        out: &mut HalfOut,
        level: u8,
        alert: Alert,
    ) -> TlsResult<()> {
        let two = [level, alert.0];
        if self.config.bugs.fragment_alert {
            self.write_record(out, RECORD_TYPE_ALERT, &two[..1])?;
            self.write_record(out, RECORD_TYPE_ALERT, &two[1..])?;
        } else if self.config.bugs.double_alert {
            let four = [level, alert.0, level, alert.0];
            self.write_record(out, RECORD_TYPE_ALERT, &four)?;
        } else {
            self.write_record(out, RECORD_TYPE_ALERT, &two)?;
        }

        if level == crate::ALERT_LEVEL_ERROR {
            return Err(out.half.set_error(Error::LocalAlert(alert)));
        }
        Ok(())
    }

    /// Send an alert at its default level. For a fatal alert, the
    /// returned error is the latched local error.
    pub(crate) fn send_alert(&self, alert: Alert) -> TlsResult<()> {
        let level = alert.default_level();
        let mut out = self.out.lock();
        self.send_alert_locked(&mut out, level, alert)
    }

    /// Public alert injection hook for the test driver.
    pub fn send_alert_level(&self, level: u8, alert: Alert) -> TlsResult<()> {
        let mut out = self.out.lock();
        self.send_alert_locked(&mut out, level, alert)
    }

    // -----------------------------------------------------------------
    // Record writing
    // -----------------------------------------------------------------

    /// Write a V2-framed record (for V2ClientHello tests).
    pub(crate) fn write_v2_record(&self, out: &mut HalfOut, data: &[u8]) -> TlsResult<usize> {
        let mut record = Vec::with_capacity(2 + data.len());
        record.push(((data.len() >> 8) as u8) | 0x80);
        record.push(data.len() as u8);
        record.extend_from_slice(data);
        out.writer.write_all(&record).map_err(Error::from_io)?;
        out.writer.flush().map_err(Error::from_io)?;
        Ok(data.len())
    }

    /// Write a record, applying the handshake-message fault knobs and
    /// flight packing.
    pub(crate) fn write_record(
        &self,
        out: &mut HalfOut,
        typ: u8,
        data: &[u8],
    ) -> TlsResult<usize> {
        let mut data = std::borrow::Cow::Borrowed(data);

        if typ == RECORD_TYPE_HANDSHAKE && !data.is_empty() {
            let mut msg_type = data[0];
            if self.config.bugs.send_wrong_message_type != 0
                && msg_type == self.config.bugs.send_wrong_message_type
            {
                msg_type = msg_type.wrapping_add(42);
            } else if msg_type == TYPE_SERVER_HELLO
                && self.config.bugs.send_server_hello_as_hello_retry_request
            {
                msg_type = TYPE_HELLO_RETRY_REQUEST;
            }
            if msg_type != data[0] {
                let mut new_data = data.into_owned();
                new_data[0] = msg_type;
                data = std::borrow::Cow::Owned(new_data);
            }

            if self.config.bugs.send_trailing_message_data != 0
                && msg_type == self.config.bugs.send_trailing_message_data
            {
                let mut new_data = data.into_owned();
                new_data.push(0);
                let new_len = new_data.len() - 4;
                new_data[1] = (new_len >> 16) as u8;
                new_data[2] = (new_len >> 8) as u8;
                new_data[3] = new_len as u8;
                data = std::borrow::Cow::Owned(new_data);
            }
        }

        if self.is_dtls {
            return self.dtls_write_record(out, typ, &data);
        }

        if typ == RECORD_TYPE_HANDSHAKE {
            if self.config.bugs.send_hello_request_before_every_handshake_message {
                let hello_req = [TYPE_HELLO_REQUEST, 0, 0, 0];
                let mut prefixed = hello_req.to_vec();
                prefixed.extend_from_slice(&data);
                data = std::borrow::Cow::Owned(prefixed);
            }

            if self.config.bugs.pack_handshake_flight {
                out.pending_flight.extend_from_slice(&data);
                return Ok(data.len());
            }
        }

        self.flush_handshake_locked(out)?;

        if typ == RECORD_TYPE_APPLICATION_DATA
            && self.config.bugs.send_post_handshake_change_cipher_spec
        {
            self.do_write_record(out, RECORD_TYPE_CHANGE_CIPHER_SPEC, &[1])?;
        }

        self.do_write_record(out, typ, &data)
    }

    /// Fragment, frame, seal and write records of `data`.
    pub(crate) fn do_write_record(
        &self,
        out: &mut HalfOut,
        typ: u8,
        data: &[u8],
    ) -> TlsResult<usize> {
        if let Some(err) = &out.half.err {
            return Err(err.clone());
        }

        let header_len = out.half.record_header_len();
        let mut written = 0usize;
        let mut rest = data;
        let mut first = true;
        let is_client_hello =
            typ == RECORD_TYPE_HANDSHAKE && !data.is_empty() && data[0] == TYPE_CLIENT_HELLO;

        while !rest.is_empty() || first {
            let mut m = rest.len();
            if m > MAX_PLAINTEXT && !self.config.bugs.send_large_records {
                m = MAX_PLAINTEXT;
            }
            let max_handshake_len = self.config.bugs.max_handshake_record_length;
            if typ == RECORD_TYPE_HANDSHAKE && max_handshake_len > 0 && m > max_handshake_len {
                m = max_handshake_len;
                // Do not fragment the version field of the first
                // ClientHello record unless asked to.
                if first && is_client_hello && !self.config.bugs.fragment_client_version && m < 6 {
                    m = 6;
                }
            }
            first = false;

            let mut explicit_iv_len = 0;
            let mut explicit_iv_is_seq = false;
            if out.half.version >= crate::VERSION_TLS11 {
                if let crate::cipher::CipherState::Cbc(cbc) = &out.half.cipher {
                    explicit_iv_len = cbc.block_size();
                }
            }
            if explicit_iv_len == 0 {
                if let crate::cipher::CipherState::Aead { explicit_nonce, .. } = &out.half.cipher {
                    if *explicit_nonce {
                        explicit_iv_len = 8;
                        // The explicit nonce rides the sequence number
                        // so tests stay deterministic.
                        explicit_iv_is_seq = true;
                    }
                }
            }

            let mut b = out.half.pool.new_block();
            b.resize(header_len + explicit_iv_len + m);
            b.data[0] = typ;
            if self.vers() >= VERSION_TLS13 && !out.half.cipher.is_none() {
                b.data[0] = RECORD_TYPE_APPLICATION_DATA;
                if self.config.bugs.outer_record_type != 0 {
                    b.data[0] = self.config.bugs.outer_record_type;
                }
            }

            let mut vers = self.vers();
            if vers == 0 {
                // Before the version is negotiated the initial record
                // carries TLS 1.0 for maximum tolerance.
                vers = VERSION_TLS10;
            }
            if self.vers() >= VERSION_TLS13 || out.half.version >= VERSION_TLS13 {
                vers = VERSION_TLS12;
            }
            if self.config.bugs.send_record_version != 0 {
                vers = self.config.bugs.send_record_version;
            }
            if self.vers() == 0 && self.config.bugs.send_initial_record_version != 0 {
                vers = self.config.bugs.send_initial_record_version;
            }
            b.data[1] = (vers >> 8) as u8;
            b.data[2] = vers as u8;
            b.data[3] = (m >> 8) as u8;
            b.data[4] = m as u8;

            if explicit_iv_len > 0 {
                if explicit_iv_is_seq {
                    let seq = out.half.seq;
                    b.data[header_len..header_len + explicit_iv_len].copy_from_slice(&seq);
                } else {
                    self.fill_random(&mut b.data[header_len..header_len + explicit_iv_len]);
                }
            }
            b.data[header_len + explicit_iv_len..].copy_from_slice(&rest[..m]);
            out.half.encrypt(&mut b, explicit_iv_len, typ)?;
            out.writer.write_all(&b.data).map_err(|e| {
                let err = Error::from_io(e);
                out.half.set_error(err.clone());
                err
            })?;
            out.writer.flush().map_err(Error::from_io)?;
            out.half.pool.free_block(b);

            written += m;
            rest = &rest[m..];
        }

        if typ == RECORD_TYPE_CHANGE_CIPHER_SPEC && self.vers() < VERSION_TLS13 {
            if let Err(alert) = out.half.change_cipher_spec() {
                self.send_alert_locked(out, crate::ALERT_LEVEL_ERROR, alert)?;
            }
        }
        Ok(written)
    }

    /// Drain the whole-flight packing buffer into records.
    pub(crate) fn flush_handshake_locked(&self, out: &mut HalfOut) -> TlsResult<()> {
        if self.is_dtls {
            return self.dtls_flush_handshake(out);
        }

        while !out.pending_flight.is_empty() {
            let n = out.pending_flight.len().min(MAX_PLAINTEXT);
            let chunk: Vec<u8> = out.pending_flight.drain(..n).collect();
            self.do_write_record(out, RECORD_TYPE_HANDSHAKE, &chunk)?;
        }
        Ok(())
    }

    /// Public flush entry point.
    pub fn flush_handshake(&self) -> TlsResult<()> {
        let mut out = self.out.lock();
        self.flush_handshake_locked(&mut out)
    }

    // -----------------------------------------------------------------
    // Handshake message reassembly
    // -----------------------------------------------------------------

    /// Accumulate records until one full handshake message is
    /// buffered; returns the raw message bytes (header included).
    pub(crate) fn do_read_handshake(&self, inp: &mut HalfIn) -> TlsResult<Vec<u8>> {
        if self.is_dtls {
            return self.dtls_do_read_handshake(inp);
        }

        while inp.hand.len() < 4 {
            if let Some(err) = &inp.half.err {
                return Err(err.clone());
            }
            self.read_record(inp, RECORD_TYPE_HANDSHAKE)?;
        }

        let n = ((inp.hand[1] as usize) << 16) | ((inp.hand[2] as usize) << 8) | inp.hand[3] as usize;
        if n > MAX_HANDSHAKE {
            let _ = self.send_alert(ALERT_INTERNAL_ERROR);
            return Err(inp.half.set_error(Error::UnexpectedMessage(
                "handshake message too large".to_string(),
            )));
        }
        while inp.hand.len() < 4 + n {
            if let Some(err) = &inp.half.err {
                return Err(err.clone());
            }
            self.read_record(inp, RECORD_TYPE_HANDSHAKE)?;
        }
        Ok(inp.hand.drain(..4 + n).collect())
    }

    /// Read and parse the next handshake message, returning the raw
    /// bytes alongside for transcript hashing.
    pub(crate) fn read_handshake_msg(
        &self,
        inp: &mut HalfIn,
    ) -> TlsResult<(HandshakeMessage, Vec<u8>)> {
        let data = self.do_read_handshake(inp)?;

        let ctx = ParseContext {
            is_dtls: self.is_dtls,
            vers: self.vers(),
            wire_vers: self.wire_vers(),
        };
        match parse_handshake(&ctx, &data) {
            Some(msg) => {
                log::trace!("received handshake message {}", msg.type_name());
                Ok((msg, data))
            }
            None => {
                let _ = self.send_alert(ALERT_DECODE_ERROR);
                Err(inp.half.set_error(Error::ProtocolViolation(
                    "could not decode handshake message".to_string(),
                )))
            }
        }
    }

    // -----------------------------------------------------------------
    // Post-handshake messages
    // -----------------------------------------------------------------

    fn process_tls13_new_session_ticket(
        &self,
        ticket: &NewSessionTicketMsg,
        suite: &'static CipherSuite,
    ) -> TlsResult<()> {
        if self.config.bugs.expect_ticket_early_data && ticket.max_early_data_size == 0 {
            return Err(Error::Expectation(
                "no early_data ticket extension found".to_string(),
            ));
        }
        if self.config.bugs.expect_no_new_session_ticket {
            return Err(Error::Expectation(
                "received unexpected NewSessionTicket".to_string(),
            ));
        }

        let Some(cache) = &self.config.client_session_cache else {
            return Ok(());
        };
        if ticket.ticket_lifetime == 0 {
            return Ok(());
        }

        let neg = self.neg.lock();
        let psk = derive_session_psk(suite, &neg.resumption_secret, &ticket.ticket_nonce);
        let now = self.config.time();
        let session = ClientSessionState {
            session_id: Vec::new(),
            session_ticket: ticket.ticket.clone(),
            vers: self.vers(),
            wire_version: self.wire_vers(),
            cipher_suite: suite.id,
            master_secret: psk,
            server_certificates: neg.peer_certificates.clone(),
            extended_master_secret: false,
            sct_list: neg.sct_list.clone(),
            ocsp_response: neg.ocsp_response.clone(),
            early_alpn: neg.alpn_protocol.clone(),
            ticket_creation_time: now,
            ticket_expiration: now + ticket.ticket_lifetime as u64,
            ticket_age_add: ticket.ticket_age_add,
            max_early_data_size: ticket.max_early_data_size,
        };
        drop(neg);

        let cache_key = self.client_session_cache_key();
        if cache.get(&cache_key).is_none() || !self.config.bugs.use_first_session_ticket {
            cache.put(&cache_key, session);
        }
        Ok(())
    }

    pub(crate) fn client_session_cache_key(&self) -> String {
        // Address identity is delegated to the config's server name;
        // the harness runs one logical peer per connection pair.
        format!("{}:{}", self.config.server_name, self.config.max_version)
    }

    /// Handle one buffered post-handshake message. A HelloRequest on a
    /// pre-1.3 client is surfaced so the caller can restart the
    /// handshake outside the in-direction lock.
    fn handle_post_handshake_message(&self, inp: &mut HalfIn) -> TlsResult<PostHandshakeAction> {
        let (msg, _raw) = self.read_handshake_msg(inp)?;

        if self.vers() < VERSION_TLS13 {
            if !self.is_client {
                let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                return Err(Error::UnexpectedMessage(
                    "unexpected post-handshake message".to_string(),
                ));
            }
            return match msg {
                HandshakeMessage::HelloRequest(_) => Ok(PostHandshakeAction::Renegotiate),
                _ => {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    Err(Error::UnexpectedMessage(
                        "unexpected post-handshake message".to_string(),
                    ))
                }
            };
        }

        match msg {
            HandshakeMessage::NewSessionTicket(ticket) if self.is_client => {
                let suite = self.suite().ok_or(Error::Handshake(
                    "no cipher suite negotiated".to_string(),
                ))?;
                self.process_tls13_new_session_ticket(&ticket, suite)?;
                Ok(PostHandshakeAction::None)
            }
            HandshakeMessage::KeyUpdate(key_update) => {
                self.key_update_seen.store(true, Ordering::SeqCst);
                if self.config.bugs.reject_unsolicited_key_update {
                    return Err(Error::Expectation(
                        "unexpected KeyUpdate message".to_string(),
                    ));
                }
                let suite = self.suite().ok_or(Error::Handshake(
                    "no cipher suite negotiated".to_string(),
                ))?;
                let new_secret = update_traffic_secret(suite.hash, &inp.half.traffic_secret);
                let wire = inp.half.wire_version;
                self.use_in_traffic_secret(inp, wire, suite, &new_secret)?;
                if key_update.key_update_request == KEY_UPDATE_REQUESTED {
                    self.key_update_requested.store(true, Ordering::SeqCst);
                }
                Ok(PostHandshakeAction::None)
            }
            other => {
                let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                Err(Error::UnexpectedMessage(format!(
                    "unexpected post-handshake message {}",
                    other.type_name()
                )))
            }
        }
    }

    // -----------------------------------------------------------------
    // Public I/O surface
    // -----------------------------------------------------------------

    /// Run the handshake if it has not run yet. The first Read or
    /// Write calls this automatically.
    pub fn handshake(&self) -> TlsResult<()> {
        let mut hs = self.hs.lock();
        if let Some(err) = &hs.err {
            return Err(err.clone());
        }
        if self.handshake_complete.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.is_dtls && self.config.bugs.send_split_alert {
            let mut out = self.out.lock();
            out.writer
                .write_all(&[
                    RECORD_TYPE_ALERT,
                    0xfe,
                    0xff,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                    2,
                ])
                .map_err(Error::from_io)?;
            out.writer
                .write_all(&[crate::ALERT_LEVEL_ERROR, ALERT_INTERNAL_ERROR.0])
                .map_err(Error::from_io)?;
            out.writer.flush().map_err(Error::from_io)?;
        }
        if let Some(data) = &self.config.bugs.app_data_before_handshake {
            let data = data.clone();
            let mut out = self.out.lock();
            self.write_record(&mut out, RECORD_TYPE_APPLICATION_DATA, &data)?;
        }

        let result = if self.is_client {
            self.client_handshake(&mut hs)
        } else {
            self.server_handshake(&mut hs)
        };

        match result {
            Ok(()) => {
                hs.done_first_handshake = true;
                if self.config.bugs.send_invalid_record_type {
                    let mut out = self.out.lock();
                    self.write_record(&mut out, 42, b"invalid record")?;
                }
                Ok(())
            }
            Err(err) => {
                hs.err = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Read application data. Returns 0 at a clean close_notify.
    pub fn read(&self, buf: &mut [u8]) -> TlsResult<usize> {
        self.handshake()?;

        // A renegotiation request may force a handshake restart, which
        // must happen outside the in-direction lock.
        loop {
            let mut renegotiate = false;
            {
                let mut inp = self.inp.lock();

                const MAX_CONSECUTIVE_EMPTY_RECORDS: usize = 100;
                for _ in 0..=MAX_CONSECUTIVE_EMPTY_RECORDS {
                    while inp.input.is_none() && inp.half.err.is_none() {
                        if let Err(err) = self.read_record(&mut inp, RECORD_TYPE_APPLICATION_DATA)
                        {
                            return match err {
                                Error::CloseNotify => Ok(0),
                                other => Err(other),
                            };
                        }
                        while !inp.hand.is_empty() && !renegotiate {
                            match self.handle_post_handshake_message(&mut inp) {
                                Ok(PostHandshakeAction::None) => {}
                                Ok(PostHandshakeAction::Renegotiate) => {
                                    renegotiate = true;
                                }
                                Err(err) => return Err(err),
                            }
                        }
                        if renegotiate {
                            break;
                        }
                    }
                    if renegotiate {
                        break;
                    }
                    if let Some(err) = &inp.half.err {
                        return match err {
                            Error::CloseNotify => Ok(0),
                            other => Err(other.clone()),
                        };
                    }

                    let mut input = inp.input.take().expect("input record must be present");
                    let n = input.read(buf);
                    if !input.is_exhausted() && !self.is_dtls {
                        inp.input = Some(input);
                    } else {
                        inp.half.pool.free_block(input);
                    }

                    // If a close_notify is already buffered behind the
                    // data, surface EOF eagerly so a clean shutdown is
                    // visible without another Read.
                    if n != 0 && inp.input.is_none() {
                        let has_buffered_alert = inp
                            .raw_input
                            .as_ref()
                            .map(|ri| !ri.data.is_empty() && ri.data[0] == RECORD_TYPE_ALERT)
                            .unwrap_or(false);
                        if has_buffered_alert {
                            let _ = self.read_record(&mut inp, RECORD_TYPE_APPLICATION_DATA);
                        }
                    }

                    if n != 0 {
                        return Ok(n);
                    }
                }
                if !renegotiate {
                    return Err(Error::Io("no progress".to_string()));
                }
            }

            // Restart the handshake per the peer's HelloRequest.
            self.handshake_complete.store(false, Ordering::SeqCst);
            self.handshake()?;
        }
    }

    /// Write application data.
    pub fn write(&self, buf: &[u8]) -> TlsResult<usize> {
        self.handshake()?;

        let mut out = self.out.lock();
        if let Some(err) = &out.half.err {
            return Err(err.clone());
        }
        if !self.handshake_complete.load(Ordering::SeqCst) {
            return Err(Error::Handshake("handshake not complete".to_string()));
        }

        if self.key_update_requested.swap(false, Ordering::SeqCst) {
            self.send_key_update_locked(&mut out, KEY_UPDATE_NOT_REQUESTED)?;
        }

        if let Some(alert) = self.config.bugs.send_spurious_alert {
            let _ = self.send_alert_locked(&mut out, crate::ALERT_LEVEL_ERROR, alert);
        }

        if self.config.bugs.send_hello_request_before_every_app_data_record {
            self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &[TYPE_HELLO_REQUEST, 0, 0, 0])?;
            self.flush_handshake_locked(&mut out)?;
        }

        // 1/n-1 record splitting against the BEAST condition: TLS ≤ 1.0
        // CBC application writes lead with a one-byte record.
        let mut m = 0usize;
        let mut rest = buf;
        if buf.len() > 1 && self.vers() <= VERSION_TLS10 && !self.is_dtls {
            if matches!(out.half.cipher, crate::cipher::CipherState::Cbc(_)) {
                let n = self.write_record(&mut out, RECORD_TYPE_APPLICATION_DATA, &buf[..1])?;
                m = n;
                rest = &buf[1..];
            }
        }

        let n = self.write_record(&mut out, RECORD_TYPE_APPLICATION_DATA, rest)?;
        Ok(n + m)
    }

    /// Close the connection: send close_notify (or the configured
    /// substitute) and, when expected, wait for the peer's.
    pub fn close(&self) -> TlsResult<()> {
        let _hs = self.hs.lock();
        let mut alert_err = None;

        if self.handshake_complete.load(Ordering::SeqCst) && !self.config.bugs.no_close_notify {
            let alert = self
                .config
                .bugs
                .send_alert_on_shutdown
                .unwrap_or(ALERT_CLOSE_NOTIFY);
            match self.send_alert(alert) {
                // A deliberately fatal shutdown alert latches a local
                // error; that is not a Close failure.
                Err(Error::LocalAlert(_)) | Ok(()) => {}
                Err(err) => alert_err = Some(err),
            }
        }

        if self.handshake_complete.load(Ordering::SeqCst)
            && alert_err.is_none()
            && self.config.bugs.expect_close_notify
        {
            let mut inp = self.inp.lock();
            while inp.half.err.is_none() {
                if let Err(err) = self.read_record(&mut inp, RECORD_TYPE_ALERT) {
                    if err != Error::CloseNotify {
                        alert_err = Some(err);
                    }
                    break;
                }
            }
            if let Some(err) = &inp.half.err {
                if *err != Error::CloseNotify && alert_err.is_none() {
                    alert_err = Some(err.clone());
                }
            }
        }

        match alert_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------
    // Post-handshake senders
    // -----------------------------------------------------------------

    /// Send half of a HelloRequest message to probe buffered-message
    /// handling.
    pub fn send_half_hello_request(&self) -> TlsResult<()> {
        self.handshake()?;
        let mut out = self.out.lock();
        self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &[TYPE_HELLO_REQUEST, 0])?;
        self.flush_handshake_locked(&mut out)
    }

    /// Server: issue a TLS 1.3 NewSessionTicket with the given nonce.
    pub fn send_new_session_ticket(&self, nonce: &[u8]) -> TlsResult<()> {
        if self.is_client || self.vers() < VERSION_TLS13 {
            return Err(Error::Handshake(
                "cannot send post-handshake NewSessionTicket".to_string(),
            ));
        }
        let suite = self
            .suite()
            .ok_or_else(|| Error::Handshake("no cipher suite negotiated".to_string()))?;

        let mut age_add_bytes = [0u8; 4];
        self.fill_random(&mut age_add_bytes);
        let ticket_age_add = u32::from_le_bytes(age_add_bytes);

        let lifetime = match self.config.bugs.send_ticket_lifetime {
            Some(d) => d.as_secs() as u32,
            None => 24 * 60 * 60,
        };

        let neg = self.neg.lock();
        let psk = derive_session_psk(suite, &neg.resumption_secret, nonce);
        let now = self.config.time();
        let state = SessionState {
            vers: self.vers(),
            cipher_suite: suite.id,
            master_secret: psk,
            certificates: neg.peer_certificates.clone(),
            extended_master_secret: false,
            ticket_creation_time: now,
            ticket_expiration: now + lifetime as u64,
            ticket_age_add,
            early_alpn: neg.alpn_protocol.clone().into_bytes(),
        };
        drop(neg);

        let mut msg = NewSessionTicketMsg {
            vers: self.wire_vers(),
            is_dtls: self.is_dtls,
            ticket_lifetime: lifetime,
            ticket_age_add,
            ticket_nonce: nonce.to_vec(),
            max_early_data_size: self.config.max_early_data_size,
            custom_extension: self.config.bugs.custom_ticket_extension.clone(),
            duplicate_early_data_extension: self.config.bugs.duplicate_ticket_early_data,
            ..Default::default()
        };
        if !self.config.bugs.send_empty_session_ticket {
            let key = *self.config.session_ticket_key.lock();
            let mut iv = [0u8; 16];
            self.fill_random(&mut iv);
            msg.ticket = encrypt_ticket(&key, &iv, &state);
        }

        let mut out = self.out.lock();
        self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &msg.marshal())?;
        self.flush_handshake_locked(&mut out)
    }

    /// Send a KeyUpdate and ratchet the outbound traffic secret.
    pub fn send_key_update(&self, key_update_request: u8) -> TlsResult<()> {
        let mut out = self.out.lock();
        self.send_key_update_locked(&mut out, key_update_request)
    }

    pub(crate) fn send_key_update_locked(
        &self,
        out: &mut HalfOut,
        key_update_request: u8,
    ) -> TlsResult<()> {
        if self.vers() < VERSION_TLS13 {
            return Err(Error::Handshake(
                "attempted to send KeyUpdate before TLS 1.3".to_string(),
            ));
        }
        let suite = self
            .suite()
            .ok_or_else(|| Error::Handshake("no cipher suite negotiated".to_string()))?;

        let msg = KeyUpdateMsg { key_update_request };
        self.write_record(out, RECORD_TYPE_HANDSHAKE, &msg.marshal())?;
        self.flush_handshake_locked(out)?;

        let new_secret = update_traffic_secret(suite.hash, &out.half.traffic_secret);
        let wire = out.half.wire_version;
        self.use_out_traffic_secret(out, wire, suite, &new_secret);
        Ok(())
    }

    /// Read one message, requiring a KeyUpdate acknowledgement.
    pub fn read_key_update_ack(&self) -> TlsResult<()> {
        let mut inp = self.inp.lock();
        let (msg, _raw) = self.read_handshake_msg(&mut inp)?;
        let key_update = match msg {
            HandshakeMessage::KeyUpdate(key_update) => key_update,
            other => {
                let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                return Err(Error::UnexpectedMessage(format!(
                    "unexpected message {} when reading KeyUpdate",
                    other.type_name()
                )));
            }
        };
        if key_update.key_update_request != KEY_UPDATE_NOT_REQUESTED {
            return Err(Error::ProtocolViolation(
                "received invalid KeyUpdate message".to_string(),
            ));
        }
        let suite = self
            .suite()
            .ok_or_else(|| Error::Handshake("no cipher suite negotiated".to_string()))?;
        let new_secret = update_traffic_secret(suite.hash, &inp.half.traffic_secret);
        let wire = inp.half.wire_version;
        self.use_in_traffic_secret(&mut inp, wire, suite, &new_secret)
    }

    /// Client: drive a renegotiation. Server: send a HelloRequest and
    /// run the handshake again.
    pub fn renegotiate(&self) -> TlsResult<()> {
        if !self.is_client {
            let hello_req = match &self.config.bugs.bad_hello_request {
                Some(raw) => raw.clone(),
                None => HelloRequestMsg.marshal(),
            };
            let mut out = self.out.lock();
            self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &hello_req)?;
            self.flush_handshake_locked(&mut out)?;
        }
        self.handshake_complete.store(false, Ordering::SeqCst);
        self.handshake()
    }

    /// Write a record that looks like early data, bypassing the record
    /// layer entirely.
    pub fn send_fake_early_data(&self, len: usize) -> TlsResult<()> {
        let mut payload = vec![0u8; 5 + len];
        payload[0] = RECORD_TYPE_APPLICATION_DATA;
        payload[1] = 3;
        payload[2] = 3;
        payload[3] = (len >> 8) as u8;
        payload[4] = len as u8;
        let mut out = self.out.lock();
        out.writer.write_all(&payload).map_err(Error::from_io)?;
        out.writer.flush().map_err(Error::from_io)
    }

    // -----------------------------------------------------------------
    // Introspection and exporters
    // -----------------------------------------------------------------

    /// Snapshot the negotiated state.
    pub fn connection_state(&self) -> ConnectionState {
        let _hs = self.hs.lock();
        let mut state = ConnectionState {
            handshake_complete: self.handshake_complete.load(Ordering::SeqCst),
            ..Default::default()
        };
        if state.handshake_complete {
            let neg = self.neg.lock();
            state.version = self.vers();
            state.cipher_suite = self.suite_id.load(Ordering::SeqCst);
            state.did_resume = neg.did_resume;
            state.negotiated_protocol = neg.alpn_protocol.clone();
            state.negotiated_protocol_from_alpn = neg.used_alpn;
            state.server_name = neg.server_name.clone();
            state.peer_certificates = neg.peer_certificates.clone();
            state.srtp_protection_profile = neg.srtp_protection_profile;
            state.sct_list = neg.sct_list.clone();
            state.ocsp_response = neg.ocsp_response.clone();
            state.quic_transport_params = neg.quic_transport_params.clone();
            state.extended_master_secret = neg.extended_master_secret;
        }
        state
    }

    /// Whether a KeyUpdate has been received.
    pub fn key_update_seen(&self) -> bool {
        self.key_update_seen.load(Ordering::SeqCst)
    }

    fn export_keying_material_tls13(
        &self,
        length: usize,
        secret: &[u8],
        label: &[u8],
        context: &[u8],
    ) -> TlsResult<Vec<u8>> {
        let suite = self
            .suite()
            .ok_or_else(|| Error::Handshake("no cipher suite negotiated".to_string()))?;
        let hash = suite.hash;
        let context_hash = hash.hash(context);
        let empty_hash = hash.hash(&[]);
        let derived = hkdf_expand_label(hash, secret, label, &empty_hash, hash.digest_size());
        Ok(hkdf_expand_label(
            hash,
            &derived,
            b"exporter",
            &context_hash,
            length,
        ))
    }

    /// RFC 5705 exporter over the connection secrets.
    pub fn export_keying_material(
        &self,
        length: usize,
        label: &[u8],
        context: &[u8],
        use_context: bool,
    ) -> TlsResult<Vec<u8>> {
        let _hs = self.hs.lock();
        if !self.handshake_complete.load(Ordering::SeqCst) {
            return Err(Error::Handshake(
                "handshake has not yet been performed".to_string(),
            ));
        }

        let neg = self.neg.lock();
        if self.vers() >= VERSION_TLS13 {
            return self.export_keying_material_tls13(
                length,
                &neg.exporter_secret,
                label,
                context,
            );
        }

        let suite = self
            .suite()
            .ok_or_else(|| Error::Handshake("no cipher suite negotiated".to_string()))?;
        let mut seed = Vec::with_capacity(64 + 2 + context.len());
        seed.extend_from_slice(&neg.client_random);
        seed.extend_from_slice(&neg.server_random);
        if use_context {
            seed.extend_from_slice(&(context.len() as u16).to_be_bytes());
            seed.extend_from_slice(context);
        }
        let mut result = vec![0u8; length];
        prf_for_version(
            self.vers(),
            suite,
            &mut result,
            &neg.exporter_secret,
            label,
            &seed,
        );
        Ok(result)
    }

    /// TLS 1.3 early exporter.
    pub fn export_early_keying_material(
        &self,
        length: usize,
        label: &[u8],
        context: &[u8],
    ) -> TlsResult<Vec<u8>> {
        if self.vers() < VERSION_TLS13 {
            return Err(Error::Handshake(
                "early exporters not defined before TLS 1.3".to_string(),
            ));
        }
        let neg = self.neg.lock();
        if neg.early_exporter_secret.is_empty() {
            return Err(Error::Handshake("no early exporter secret".to_string()));
        }
        self.export_keying_material_tls13(length, &neg.early_exporter_secret, label, context)
    }

    /// Whether the renegotiation-info extension should be withheld.
    pub(crate) fn no_renegotiation_info(&self, hs: &HandshakeState) -> bool {
        if self.config.bugs.no_renegotiation_info {
            return true;
        }
        if !hs.done_first_handshake && self.config.bugs.no_renegotiation_info_in_initial {
            return true;
        }
        if hs.done_first_handshake && self.config.bugs.no_renegotiation_info_after_initial {
            return true;
        }
        false
    }
}

/// Outcome of a post-handshake message.
pub(crate) enum PostHandshakeAction {
    None,
    Renegotiate,
}
