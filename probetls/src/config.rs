//! Connection configuration: certificates, version bounds, session
//! caches, and the flat record of protocol deviations (`ProtocolBugs`)
//! that parameterizes nearly every step of the record and handshake
//! layers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use probecrypto::rsa::{RsaPrivateKey, RsaPublicKey};

use crate::alert::Alert;
use crate::packet_adapter::PacketAdaptor;
use crate::session::{ClientSessionCache, ServerSessionCache};
use crate::{CurveId, CURVE_X25519, MAX_VERSION, MIN_VERSION, VERSION_TLS10, VERSION_TLS12};

/// A certificate chain plus its pre-parsed keys. X.509 parsing is an
/// external concern: the harness moves DER blobs on the wire and
/// consumes keys in parsed form.
#[derive(Clone, Default)]
pub struct Certificate {
    /// DER certificates, leaf first.
    pub certificate: Vec<Vec<u8>>,
    /// The leaf's private key, present on the owning side.
    pub private_key: Option<RsaPrivateKey>,
    /// The leaf's public key, as an external parser would supply it.
    pub public_key: Option<RsaPublicKey>,
    /// Stapled OCSP response, if any.
    pub ocsp_staple: Vec<u8>,
    /// Signed certificate timestamp list, if any.
    pub signed_certificate_timestamp_list: Vec<u8>,
}

/// Values for corrupting the RSA client key exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RsaBadValue {
    #[default]
    None,
    Corrupt,
    TooLong,
    TooShort,
    WrongVersion1,
    WrongVersion2,
    WrongLeadingByte,
    NoZero,
}

/// The shared connection configuration. Read-only once a connection
/// is constructed, except for the one-shot server ticket-key init.
pub struct Config {
    /// Seed for the connection's deterministic RNG; None draws from
    /// the OS.
    pub rand_seed: Option<[u8; 32]>,
    /// Clock override, unix seconds.
    pub now: Option<fn() -> u64>,

    pub certificates: Vec<Certificate>,
    /// The peer's leaf RSA key, standing in for certificate parsing on
    /// the client side of the RSA key exchange.
    pub peer_rsa_key: Option<RsaPublicKey>,

    /// ALPN protocols to offer (client) or select from (server).
    pub next_protos: Vec<String>,
    pub server_name: String,

    pub cipher_suites: Vec<u16>,
    pub prefer_server_cipher_suites: bool,

    pub session_tickets_disabled: bool,
    pub session_ticket_key: Mutex<[u8; 32]>,
    pub ticket_key_initialized: AtomicBool,

    pub client_session_cache: Option<Arc<ClientSessionCache>>,
    pub server_session_cache: Option<Arc<ServerSessionCache>>,

    pub min_version: u16,
    pub max_version: u16,
    pub curve_preferences: Vec<CurveId>,

    /// External PSK for TLS 1.3.
    pub pre_shared_key: Vec<u8>,
    pub pre_shared_key_identity: String,

    pub max_early_data_size: u32,
    pub srtp_protection_profiles: Vec<u16>,
    pub quic_transport_params: Vec<u8>,
    pub pq_experiment_signal: bool,

    pub bugs: ProtocolBugs,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rand_seed: None,
            now: None,
            certificates: Vec::new(),
            peer_rsa_key: None,
            next_protos: Vec::new(),
            server_name: String::new(),
            cipher_suites: Vec::new(),
            prefer_server_cipher_suites: false,
            session_tickets_disabled: false,
            session_ticket_key: Mutex::new([0u8; 32]),
            ticket_key_initialized: AtomicBool::new(false),
            client_session_cache: None,
            server_session_cache: None,
            min_version: 0,
            max_version: 0,
            curve_preferences: Vec::new(),
            pre_shared_key: Vec::new(),
            pre_shared_key_identity: String::new(),
            max_early_data_size: 0,
            srtp_protection_profiles: Vec::new(),
            quic_transport_params: Vec::new(),
            pq_experiment_signal: false,
            bugs: ProtocolBugs::default(),
        }
    }
}

impl Config {
    pub fn time(&self) -> u64 {
        match self.now {
            Some(f) => f(),
            None => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    pub fn min_version(&self, is_dtls: bool) -> u16 {
        let mut ret = if self.min_version != 0 {
            self.min_version
        } else {
            MIN_VERSION
        };
        if is_dtls {
            // There is no DTLS 1.1; map it away.
            if ret < VERSION_TLS10 {
                ret = VERSION_TLS10;
            }
            if ret == crate::VERSION_TLS11 {
                ret = VERSION_TLS12;
            }
        }
        ret
    }

    pub fn max_version(&self, is_dtls: bool) -> u16 {
        let mut ret = if self.max_version != 0 {
            self.max_version
        } else {
            MAX_VERSION
        };
        if is_dtls {
            if ret > VERSION_TLS12 {
                ret = VERSION_TLS12;
            }
            if ret == crate::VERSION_TLS11 {
                ret = VERSION_TLS10;
            }
        }
        ret
    }

    pub fn is_supported_version(&self, wire_vers: u16, is_dtls: bool) -> Option<u16> {
        let vers = crate::wire_to_version(wire_vers, is_dtls)?;
        if vers < self.min_version(is_dtls) || vers > self.max_version(is_dtls) {
            return None;
        }
        Some(vers)
    }

    /// Supported wire versions, newest first.
    pub fn supported_versions(&self, is_dtls: bool) -> Vec<u16> {
        let all = if is_dtls {
            crate::ALL_DTLS_WIRE_VERSIONS
        } else {
            crate::ALL_TLS_WIRE_VERSIONS
        };
        all.iter()
            .copied()
            .filter(|&v| self.is_supported_version(v, is_dtls).is_some())
            .collect()
    }

    pub fn cipher_suites(&self) -> Vec<u16> {
        if self.cipher_suites.is_empty() {
            crate::cipher::default_cipher_suite_ids()
        } else {
            self.cipher_suites.clone()
        }
    }

    pub fn curve_preferences(&self) -> Vec<CurveId> {
        if self.curve_preferences.is_empty() {
            vec![CURVE_X25519]
        } else {
            self.curve_preferences.clone()
        }
    }

    /// One-shot server ticket-key initialization.
    pub(crate) fn server_init(&self, rng: &mut dyn rand::RngCore) {
        if self.session_tickets_disabled {
            return;
        }
        if self.ticket_key_initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut key = self.session_ticket_key.lock();
        if key.iter().all(|&b| b == 0) {
            rng.fill_bytes(&mut key[..]);
        }
    }
}

/// The flat record of named protocol deviations. Every field is a
/// controlled violation consumed at one decision point in the engine;
/// none of them change the shape of the state machine, only its
/// emitted bytes, accepted bytes, or terminal outcome. Mutual
/// exclusion between overlapping knobs is the caller's business.
#[derive(Default)]
pub struct ProtocolBugs {
    // ------------------------------------------------------------------
    // Record-layer faults
    // ------------------------------------------------------------------
    /// Replace every installed cipher with the null cipher.
    pub null_all_ciphers: bool,
    /// Map the internal outgoing sequence number to the wire value; the
    /// function must be monotone non-decreasing.
    pub sequence_number_mapping: Option<fn(u64) -> u64>,
    /// Pad CBC records to the maximum 256 bytes.
    pub max_padding: bool,
    /// Corrupt the first CBC padding byte.
    pub padding_first_byte_bad: bool,
    /// Corrupt the first CBC padding byte only when padding is 256
    /// bytes.
    pub padding_first_byte_bad_if255: bool,
    /// Extra zero padding appended to each TLS 1.3 record.
    pub record_padding: usize,
    /// Omit the inner content type (and contents) of TLS 1.3 records.
    pub omit_record_contents: bool,
    /// Override the outer record type of encrypted TLS 1.3 records.
    pub outer_record_type: u8,
    /// Do not split records at the plaintext limit.
    pub send_large_records: bool,
    /// Lower the inbound plaintext limit.
    pub max_receive_plaintext: usize,
    /// Expect TLS ≤ 1.0 CBC application data to be 1/n-1 split.
    pub expect_record_splitting: bool,
    /// Require this record-layer version on the first inbound record.
    pub expect_initial_record_version: u16,
    /// Override the record-layer version on every outbound record.
    pub send_record_version: u16,
    /// Override the record-layer version before version negotiation.
    pub send_initial_record_version: u16,
    /// Send a record with an invalid content type after handshaking.
    pub send_invalid_record_type: bool,
    /// Fragment outbound handshake messages into records of at most
    /// this many bytes (DTLS: fragments).
    pub max_handshake_record_length: usize,
    /// Allow the first ClientHello fragment to split the version field.
    pub fragment_client_version: bool,
    /// Expect encrypted handshake flights to be packed into one
    /// record; a plaintext-boundary violation after a record shorter
    /// than this is fatal.
    pub expect_packed_encrypted_handshake: usize,
    /// Buffer the entire outgoing flight and emit it as maximally
    /// packed records.
    pub pack_handshake_flight: bool,

    // ------------------------------------------------------------------
    // Alert behavior
    // ------------------------------------------------------------------
    /// Send each alert split across two records.
    pub fragment_alert: bool,
    /// Send two alerts in one record.
    pub double_alert: bool,
    /// Send this spurious fatal alert before each application write.
    pub send_spurious_alert: Option<Alert>,
    /// Do not send close_notify on Close.
    pub no_close_notify: bool,
    /// Send this alert instead of close_notify on Close.
    pub send_alert_on_shutdown: Option<Alert>,
    /// On Close, require the peer's close_notify before our own EOF.
    pub expect_close_notify: bool,
    /// DTLS: write an alert record split across two packets during
    /// Handshake.
    pub send_split_alert: bool,

    // ------------------------------------------------------------------
    // Handshake-message faults
    // ------------------------------------------------------------------
    /// Bump the message type by 42 when sending this message type.
    pub send_wrong_message_type: u8,
    /// Append a trailing byte (without fixing the length) to this
    /// message type.
    pub send_trailing_message_data: u8,
    /// Encode ServerHello with the HelloRetryRequest sentinel type.
    pub send_server_hello_as_hello_retry_request: bool,
    /// Send a HelloRequest before every handshake message.
    pub send_hello_request_before_every_handshake_message: bool,
    /// Send a HelloRequest before every application data record.
    pub send_hello_request_before_every_app_data_record: bool,
    /// Send application data before handshaking.
    pub app_data_before_handshake: Option<Vec<u8>>,
    /// Send the ClientHello in a V2 record.
    pub send_v2_client_hello: bool,
    /// Raw bytes to substitute for a HelloRequest on renegotiation.
    pub bad_hello_request: Option<Vec<u8>>,
    /// Skip sending Finished.
    pub skip_finished: bool,
    /// Corrupt the Finished verify_data.
    pub bad_finished: bool,
    /// Send a second Finished message.
    pub send_extra_finished: bool,
    /// Send the TLS 1.3 client Finished unencrypted.
    pub send_unencrypted_finished: bool,
    /// Omit the Certificate message's payload entirely.
    pub empty_certificate_list: bool,
    /// Skip the CertificateStatus message even when OCSP was
    /// negotiated.
    pub skip_certificate_status: bool,
    /// Corrupt the RSA client key exchange in the selected way.
    pub bad_rsa_client_key_exchange: RsaBadValue,

    // ------------------------------------------------------------------
    // ChangeCipherSpec interleaving
    // ------------------------------------------------------------------
    /// Skip sending ChangeCipherSpec (but still change ciphers).
    pub skip_change_cipher_spec: bool,
    /// Send ChangeCipherSpec after Finished instead of before.
    pub reorder_change_cipher_spec: bool,
    /// Send a stray ChangeCipherSpec record before the handshake
    /// flight.
    pub stray_change_cipher_spec: bool,
    /// Send this many extra ChangeCipherSpec records.
    pub send_extra_change_cipher_spec: usize,
    /// Send ChangeCipherSpec before every post-handshake application
    /// record.
    pub send_post_handshake_change_cipher_spec: bool,
    /// Raw bytes to substitute for the ChangeCipherSpec body.
    pub bad_change_cipher_spec: Option<Vec<u8>>,
    /// Send the TLS 1.3 middlebox-compatibility ChangeCipherSpec.
    pub send_tls13_change_cipher_spec: bool,
    /// Expect (and consume) the peer's middlebox-compatibility
    /// ChangeCipherSpec at its single well-defined point.
    pub expect_tls13_change_cipher_spec: bool,
    /// Application data to send immediately after ChangeCipherSpec,
    /// before Finished.
    pub app_data_after_change_cipher_spec: Option<Vec<u8>>,
    /// Alert to send immediately after ChangeCipherSpec.
    pub alert_after_change_cipher_spec: Option<Alert>,

    // ------------------------------------------------------------------
    // Version negotiation quirks
    // ------------------------------------------------------------------
    /// Override the legacy_version field of the ClientHello.
    pub send_client_version: u16,
    /// Omit the supported_versions extension.
    pub omit_supported_versions: bool,
    /// Override the supported_versions list.
    pub send_supported_versions: Vec<u16>,
    /// Server: negotiate this wire version regardless of the offer.
    pub negotiate_version: u16,
    /// Override the ServerHello legacy_version field.
    pub send_server_hello_version: u16,
    /// Override the server's selected_version extension value.
    pub send_server_supported_version_extension: u16,
    /// Omit the server's selected_version extension in TLS 1.3.
    pub omit_server_supported_version_extension: bool,
    /// Include the fallback SCSV in the ClientHello.
    pub send_fallback_scsv: bool,
    /// Include the renegotiation SCSV in the ClientHello.
    pub send_renegotiation_scsv: bool,
    /// Send the TLS 1.3 anti-downgrade sentinel in the server random.
    pub send_tls13_downgrade_random: bool,
    /// Client: fail if the server random carries the downgrade
    /// sentinel.
    pub check_tls13_downgrade_random: bool,
    /// Client: ignore the downgrade sentinel.
    pub ignore_tls13_downgrade_random: bool,

    // ------------------------------------------------------------------
    // Extension-list perturbations
    // ------------------------------------------------------------------
    /// Add a duplicate (unknown) extension to hello messages.
    pub duplicate_extension: bool,
    /// Body for the custom test extension, sent when non-empty.
    pub custom_extension: String,
    /// Body for the custom unencrypted extension (TLS 1.3 ServerHello).
    pub custom_unencrypted_extension: String,
    /// Expect the peer's custom extension to carry exactly this body.
    pub expected_custom_extension: Option<String>,
    /// Advertise a session ticket extension in TLS 1.3.
    pub advertise_ticket_extension: bool,
    /// Omit the extensions block entirely.
    pub omit_extensions: bool,
    /// Send a present-but-empty extensions block.
    pub empty_extensions: bool,
    /// Pad the ClientHello to at least this size.
    pub pad_client_hello: usize,
    /// Omit the extended_master_secret extension.
    pub no_extended_master_secret: bool,
    /// Require the peer to negotiate extended master secret.
    pub require_extended_master_secret: bool,
    /// Omit the renegotiation_info extension everywhere.
    pub no_renegotiation_info: bool,
    /// Omit renegotiation_info on the initial handshake only.
    pub no_renegotiation_info_in_initial: bool,
    /// Omit renegotiation_info after the initial handshake only.
    pub no_renegotiation_info_after_initial: bool,
    /// Send an empty renegotiation_info payload on renegotiation.
    pub empty_renegotiation_info: bool,
    /// Corrupt the renegotiation_info payload start.
    pub bad_renegotiation_info: bool,
    /// Corrupt the renegotiation_info payload end.
    pub bad_renegotiation_info_end: bool,
    /// Require the peer to send renegotiation_info.
    pub require_renegotiation_info: bool,
    /// Expect this server_name in the ClientHello.
    pub expect_server_name: String,
    /// Server: unconditionally negotiate this ALPN protocol.
    pub alpn_protocol: Option<String>,
    /// Override the compression-methods list in the ClientHello.
    pub send_compression_methods: Vec<u8>,
    /// Override the server's selected compression method.
    pub send_compression_method: u8,

    // ------------------------------------------------------------------
    // Key shares and HelloRetryRequest
    // ------------------------------------------------------------------
    /// Omit the key_share extension from the ClientHello.
    pub missing_key_share: bool,
    /// Omit the key_share from the second ClientHello after HRR.
    pub second_client_hello_missing_key_share: bool,
    /// Send each key share twice.
    pub duplicate_key_shares: bool,
    /// Append a trailing byte to each key share.
    pub trailing_key_share_data: bool,
    /// Server: always send a HelloRetryRequest first.
    pub always_send_hello_retry_request: bool,
    /// Server: send a second HelloRetryRequest.
    pub second_hello_retry_request: bool,
    /// Group to request in the HelloRetryRequest (0 = echo offer).
    pub send_hello_retry_request_curve: u16,
    /// Cookie to send in the HelloRetryRequest.
    pub send_hello_retry_request_cookie: Vec<u8>,
    /// Body for a custom HelloRetryRequest extension.
    pub custom_hello_retry_request_extension: String,
    /// Server: skip the HelloRetryRequest even when one is needed.
    pub skip_hello_retry_request: bool,
    /// Server: skip the DTLS HelloVerifyRequest cookie exchange.
    pub skip_hello_verify_request: bool,
    /// Client: fail if the server sends a HelloRetryRequest.
    pub fail_if_hello_retry_requested: bool,

    // ------------------------------------------------------------------
    // Session tickets and resumption
    // ------------------------------------------------------------------
    /// Server: skip NewSessionTicket in TLS ≤ 1.2 despite negotiating
    /// it.
    pub skip_new_session_ticket: bool,
    /// Server: send a NewSessionTicket with an empty ticket.
    pub send_empty_session_ticket: bool,
    /// Server: issue a fresh ticket on resumption.
    pub renew_ticket_on_resume: bool,
    /// Client: require a NewSessionTicket message.
    pub expect_new_ticket: bool,
    /// Client: fail when a NewSessionTicket arrives (TLS 1.3).
    pub expect_no_new_session_ticket: bool,
    /// Client: never overwrite the first cached ticket.
    pub use_first_session_ticket: bool,
    /// Ticket lifetime to claim, seconds.
    pub send_ticket_lifetime: Option<Duration>,
    /// Body for a custom ticket extension (TLS 1.3).
    pub custom_ticket_extension: String,
    /// Duplicate the early_data ticket extension.
    pub duplicate_ticket_early_data: bool,
    /// Client: require tickets to carry the early_data extension.
    pub expect_ticket_early_data: bool,
    /// Server: fail the handshake if the client offers any session.
    pub fail_if_session_offered: bool,
    /// Server: resume any session without validating its contents.
    pub accept_any_session: bool,
    /// Server: echo this many session-ID bytes on ticket resumption.
    pub ticket_session_id_length: usize,
    /// Server: echo an empty session ID on ticket resumption.
    pub empty_ticket_session_id: bool,
    /// Require the ClientHello to offer a session ticket.
    pub require_session_tickets: bool,
    /// Require the ClientHello to carry a non-empty session ID.
    pub require_session_ids: bool,

    // ------------------------------------------------------------------
    // TLS 1.3 PSK binders
    // ------------------------------------------------------------------
    /// Put the pre_shared_key extension first instead of last.
    pub psk_binder_first: bool,
    /// Omit the binders list from the pre_shared_key extension.
    pub send_no_psk_binder: bool,
    /// Corrupt the first PSK binder.
    pub send_invalid_psk_binder: bool,
    /// Offer a second, bogus PSK identity.
    pub extra_psk_identity: bool,

    // ------------------------------------------------------------------
    // Early data
    // ------------------------------------------------------------------
    /// Send this many bytes of fake 0-RTT records after the
    /// ClientHello.
    pub send_fake_early_data_length: usize,
    /// Omit the early_data extension despite attempting 0-RTT.
    pub omit_early_data_extension: bool,
    /// Offer the early_data extension even without a session.
    pub send_early_data_extension: bool,
    /// Server: accept 0-RTT whenever offered.
    pub always_accept_early_data: bool,
    /// Server: reject 0-RTT whenever offered.
    pub always_reject_early_data: bool,
    /// Client: skip the EndOfEarlyData message.
    pub skip_end_of_early_data: bool,
    /// Send a non-empty EndOfEarlyData message.
    pub non_empty_end_of_early_data: bool,

    // ------------------------------------------------------------------
    // Key update
    // ------------------------------------------------------------------
    /// Treat any unsolicited KeyUpdate as an error.
    pub reject_unsolicited_key_update: bool,

    // ------------------------------------------------------------------
    // DTLS timing and fragmentation
    // ------------------------------------------------------------------
    /// Simulated read timeouts to issue through the packet adaptor.
    pub timeout_schedule: Vec<Duration>,
    /// The packet adaptor carrying this connection, when datagram
    /// framing and timeout opcodes are in play.
    pub packet_adaptor: Option<Arc<PacketAdaptor>>,
    /// Maximum bytes per outbound packet; inbound packets above this
    /// are an error.
    pub max_packet_length: usize,
    /// Shuffle outbound handshake fragments.
    pub reorder_handshake_fragments: bool,
    /// Reverse outbound handshake fragments.
    pub reverse_handshake_fragments: bool,
    /// Split each handshake fragment in two at this offset.
    pub split_fragments: usize,
    /// Emit an empty fragment before and after each message.
    pub send_empty_fragments: bool,
    /// Corrupt the message type of the second fragment.
    pub fragment_message_type_mismatch: bool,
    /// Corrupt the total-length field of the second fragment.
    pub fragment_message_length_mismatch: bool,
    /// Also send each fragmented message whole, before its fragments.
    pub mix_complete_message_with_fragments: bool,
    /// Pack fragments into records of up to this size.
    pub pack_handshake_fragments: usize,
    /// Pack records into packets of up to this size.
    pub pack_handshake_records: usize,
    /// Retransmit the final flight after seeing the peer's Finished.
    pub retransmit_finished: bool,
}
