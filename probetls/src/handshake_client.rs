//! The client side of the handshake: TLS 1.0–1.2 (RSA key exchange,
//! session resumption, renegotiation) and TLS 1.3 (X25519 key share,
//! PSK resumption, HelloRetryRequest), plus the DTLS variants.

use probecrypto::hmac::MacHash;
use probecrypto::x25519;

use crate::alert::*;
use crate::cipher::{
    cipher_suite_by_id, mac_alg_for_suite, new_cipher_state, CipherSuite, TlsMac,
};
use crate::config::RsaBadValue;
use crate::conn::{Conn, HalfIn, HalfOut, HandshakeState};
use crate::error::{Error, TlsResult};
use crate::messages::{
    ClientHelloMsg, ClientKeyExchangeMsg, FinishedMsg, HandshakeMessage, KeyShareEntry,
    PskIdentity, ServerHelloMsg,
};
use crate::prf::{
    derive_secret, extended_master_from_pre_master_secret, finished_hash13,
    keys_from_master_secret, master_from_pre_master_secret, HandshakeHash,
};
use crate::session::ClientSessionState;
use crate::{
    CurveId, CURVE_X25519, DOWNGRADE_TLS12, DOWNGRADE_TLS13, PSK_DHE_KE_MODE,
    RECORD_TYPE_APPLICATION_DATA, RECORD_TYPE_CHANGE_CIPHER_SPEC, RECORD_TYPE_HANDSHAKE,
    SCSV_FALLBACK, SCSV_RENEGOTIATION, VERSION_DTLS10, VERSION_DTLS12, VERSION_TLS12,
    VERSION_TLS13,
};

/// Default signature algorithms to offer.
pub(crate) const DEFAULT_SIGNATURE_ALGORITHMS: &[u16] = &[
    0x0804, // rsa_pss_rsae_sha256
    0x0401, // rsa_pkcs1_sha256
    0x0403, // ecdsa_secp256r1_sha256
];

impl Conn {
    fn wire_version_for(&self, vers: u16) -> u16 {
        if self.is_dtls {
            match vers {
                VERSION_TLS12 => VERSION_DTLS12,
                _ => VERSION_DTLS10,
            }
        } else {
            vers
        }
    }

    /// Write one handshake message and absorb it into the transcript.
    pub(crate) fn write_hs_message(
        &self,
        out: &mut HalfOut,
        transcript: &mut HandshakeHash,
        msg: &[u8],
    ) -> TlsResult<()> {
        let seqno = out.send_handshake_seq;
        transcript.write_handshake(msg, seqno, self.is_dtls);
        self.write_record(out, RECORD_TYPE_HANDSHAKE, msg)?;
        Ok(())
    }

    /// Read one handshake message and absorb it into the transcript.
    pub(crate) fn read_hs_message(
        &self,
        inp: &mut HalfIn,
        transcript: &mut HandshakeHash,
    ) -> TlsResult<HandshakeMessage> {
        let (msg, raw) = self.read_handshake_msg(inp)?;
        let seqno = inp.recv_handshake_seq.wrapping_sub(1);
        transcript.write_handshake(&raw, seqno, self.is_dtls);
        Ok(msg)
    }

    fn lookup_client_session(&self) -> Option<ClientSessionState> {
        let cache = self.config.client_session_cache.as_ref()?;
        let session = cache.get(&self.client_session_cache_key())?;
        if session.ticket_expiration != 0 && session.ticket_expiration < self.config.time() {
            return None;
        }
        Some(session)
    }

    fn build_client_hello(
        &self,
        hs: &HandshakeState,
        session: Option<&ClientSessionState>,
        max_version: u16,
        x25519_public: Option<[u8; 32]>,
    ) -> ClientHelloMsg {
        let bugs = &self.config.bugs;
        let offer_tls13 = max_version >= VERSION_TLS13 && !self.is_dtls;

        let mut hello = ClientHelloMsg {
            is_dtls: self.is_dtls,
            vers: if bugs.send_client_version != 0 {
                bugs.send_client_version
            } else {
                self.wire_version_for(max_version.min(VERSION_TLS12))
            },
            compression_methods: if bugs.send_compression_methods.is_empty() {
                vec![crate::COMPRESSION_NONE]
            } else {
                bugs.send_compression_methods.clone()
            },
            server_name: self.config.server_name.clone(),
            supported_curves: self
                .config
                .curve_preferences()
                .iter()
                .map(|&CurveId(id)| id)
                .collect(),
            supported_points: vec![0],
            alpn_protocols: self.config.next_protos.clone(),
            extended_master_secret: !bugs.no_extended_master_secret,
            quic_transport_params: self.config.quic_transport_params.clone(),
            srtp_protection_profiles: self.config.srtp_protection_profiles.clone(),
            pq_experiment_signal: self.config.pq_experiment_signal,
            custom_extension: bugs.custom_extension.clone(),
            duplicate_extension: bugs.duplicate_extension,
            omit_extensions: bugs.omit_extensions,
            empty_extensions: bugs.empty_extensions,
            pad_to: bugs.pad_client_hello,
            psk_binder_first: bugs.psk_binder_first,
            send_no_psk_binder: bugs.send_no_psk_binder,
            duplicate_key_shares: bugs.duplicate_key_shares,
            trailing_key_share_data: bugs.trailing_key_share_data,
            ..Default::default()
        };
        self.fill_random(&mut hello.random);

        hello.cipher_suites = self.config.cipher_suites();
        if bugs.send_renegotiation_scsv {
            hello.cipher_suites.push(SCSV_RENEGOTIATION);
        }
        if bugs.send_fallback_scsv {
            hello.cipher_suites.push(SCSV_FALLBACK);
        }

        if max_version >= VERSION_TLS12 {
            hello.signature_algorithms = DEFAULT_SIGNATURE_ALGORITHMS.to_vec();
        }

        if offer_tls13 {
            hello.supported_versions = if !bugs.send_supported_versions.is_empty() {
                bugs.send_supported_versions.clone()
            } else {
                self.config.supported_versions(self.is_dtls)
            };
            if bugs.omit_supported_versions {
                hello.supported_versions.clear();
            }
            if let Some(public) = x25519_public {
                if !bugs.missing_key_share {
                    hello.key_shares.push(KeyShareEntry {
                        group: CURVE_X25519.0,
                        key_exchange: public.to_vec(),
                    });
                }
            }
            hello.psk_kem_modes = vec![PSK_DHE_KE_MODE];
        }

        if !self.no_renegotiation_info(hs) {
            let mut renego = if hs.done_first_handshake {
                hs.client_verify.clone()
            } else {
                Vec::new()
            };
            if bugs.empty_renegotiation_info {
                renego.clear();
            }
            if bugs.bad_renegotiation_info && !renego.is_empty() {
                renego[0] ^= 0x80;
            }
            if bugs.bad_renegotiation_info_end && !renego.is_empty() {
                let last = renego.len() - 1;
                renego[last] ^= 0x80;
            }
            hello.secure_renegotiation = Some(renego);
        }

        if bugs.advertise_ticket_extension {
            hello.ticket_supported = true;
        }

        // Session resumption offer.
        if let Some(session) = session {
            if session.vers >= VERSION_TLS13 {
                let age_ms = (self
                    .config
                    .time()
                    .saturating_sub(session.ticket_creation_time))
                    * 1000;
                hello.psk_identities.push(PskIdentity {
                    ticket: session.session_ticket.clone(),
                    obfuscated_ticket_age: (age_ms as u32).wrapping_add(session.ticket_age_add),
                });
                if self.config.bugs.extra_psk_identity {
                    hello.psk_identities.push(PskIdentity {
                        ticket: b"bogus psk identity".to_vec(),
                        obfuscated_ticket_age: 0,
                    });
                }
                hello.early_data = (session.max_early_data_size > 0
                    && !bugs.omit_early_data_extension)
                    || bugs.send_early_data_extension;
            } else if !session.session_ticket.is_empty() {
                hello.ticket_supported = true;
                hello.session_ticket = session.session_ticket.clone();
                // A random session ID detects whether the ticket was
                // accepted: the server echoes it on resumption.
                hello.session_id = vec![0u8; 16];
                self.fill_random(&mut hello.session_id);
            } else {
                hello.session_id = session.session_id.clone();
            }
        } else if !self.config.session_tickets_disabled && max_version < VERSION_TLS13 {
            hello.ticket_supported = true;
        }

        hello
    }

    /// Fill in the PSK binders of a resumption offer.
    fn compute_psk_binders(
        &self,
        hello: &mut ClientHelloMsg,
        session: &ClientSessionState,
        transcript_prefix: &[u8],
    ) {
        let Some(suite) = cipher_suite_by_id(session.cipher_suite) else {
            return;
        };
        let hash = suite.hash;
        let binder_count = hello.psk_identities.len();
        hello.psk_binders = vec![vec![0u8; hash.digest_size()]; binder_count];

        if hello.send_no_psk_binder {
            return;
        }

        let full = hello.marshal();
        let binders_len: usize = 2 + hello
            .psk_binders
            .iter()
            .map(|b| 1 + b.len())
            .sum::<usize>();
        let truncated = &full[..full.len() - binders_len];

        let early_secret = probecrypto::hkdf::extract(hash, &[], &session.master_secret);
        let binder_key = derive_secret(hash, &early_secret, b"res binder", &hash.hash(&[]));

        let mut transcript = Vec::with_capacity(transcript_prefix.len() + truncated.len());
        transcript.extend_from_slice(transcript_prefix);
        transcript.extend_from_slice(truncated);
        let mut binder = finished_hash13(hash, &binder_key, &hash.hash(&transcript));
        if self.config.bugs.send_invalid_psk_binder {
            binder[0] ^= 1;
        }
        for b in hello.psk_binders.iter_mut() {
            *b = binder.clone();
        }
    }

    fn v2_client_hello(&self, hello: &ClientHelloMsg) -> Vec<u8> {
        let mut msg = Vec::new();
        msg.push(1); // CLIENT-HELLO
        msg.extend_from_slice(&hello.vers.to_be_bytes());
        msg.extend_from_slice(&((hello.cipher_suites.len() * 3) as u16).to_be_bytes());
        msg.extend_from_slice(&0u16.to_be_bytes()); // session id
        msg.extend_from_slice(&32u16.to_be_bytes()); // challenge
        for &suite in &hello.cipher_suites {
            msg.push(0);
            msg.extend_from_slice(&suite.to_be_bytes());
        }
        msg.extend_from_slice(&hello.random);
        msg
    }

    /// The full client handshake.
    pub(crate) fn client_handshake(&self, hs: &mut HandshakeState) -> TlsResult<()> {
        let bugs = &self.config.bugs;
        let max_version = self.config.max_version(self.is_dtls);
        let offer_tls13 = max_version >= VERSION_TLS13 && !self.is_dtls;

        let mut x25519_private = [0u8; 32];
        self.fill_random(&mut x25519_private);
        let x25519_public = if offer_tls13 {
            Some(x25519::public_key(&x25519_private))
        } else {
            None
        };

        let session = self.lookup_client_session();
        let mut hello = self.build_client_hello(hs, session.as_ref(), max_version, x25519_public);

        if let Some(session) = &session {
            if !hello.psk_identities.is_empty() {
                self.compute_psk_binders(&mut hello, session, &[]);
            }
        }

        // The transcript hash is not known until the version is; start
        // with the strongest offered hash and rebuild on demand. For
        // the suites here every pre-1.3 PRF hash is SHA-256, so the
        // distinction only matters for TLS ≤ 1.1, handled inside
        // HandshakeHash.
        let placeholder_suite = cipher_suite_by_id(crate::cipher::TLS_AES_128_GCM_SHA256).unwrap();
        let mut transcript = HandshakeHash::new(VERSION_TLS12, placeholder_suite);

        // DTLS: walk the configured timeout schedule before the first
        // flight; each entry emits a T opcode the peer must acknowledge.
        if self.is_dtls {
            self.simulate_packet_loss(None::<fn(&Conn) -> TlsResult<()>>)?;
        }

        let hello_bytes = hello.marshal();
        {
            let mut out = self.out.lock();
            if bugs.stray_change_cipher_spec {
                self.write_record(&mut out, RECORD_TYPE_CHANGE_CIPHER_SPEC, &[1])?;
            }
            if bugs.send_v2_client_hello {
                let v2 = self.v2_client_hello(&hello);
                transcript.write(&v2);
                self.write_v2_record(&mut out, &v2)?;
            } else {
                let seqno = out.send_handshake_seq;
                transcript.write_handshake(&hello_bytes, seqno, self.is_dtls);
                self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &hello_bytes)?;
            }
            self.flush_handshake_locked(&mut out)?;
            if bugs.send_fake_early_data_length > 0 {
                drop(out);
                self.send_fake_early_data(bugs.send_fake_early_data_length)?;
            }
        }

        // DTLS: the server may demand a cookie first; the exchange is
        // excluded from the handshake hash.
        if self.is_dtls {
            let mut inp = self.inp.lock();
            let (msg, _raw) = self.read_handshake_msg(&mut inp)?;
            match msg {
                HandshakeMessage::HelloVerifyRequest(hvr) => {
                    drop(inp);
                    if crate::wire_to_version(hvr.vers, true).is_none() {
                        return Err(Error::ProtocolViolation(
                            "bad HelloVerifyRequest version".to_string(),
                        ));
                    }
                    hello.cookie = hvr.cookie.clone();
                    transcript.reset();
                    let hello_bytes = hello.marshal();
                    let mut out = self.out.lock();
                    let seqno = out.send_handshake_seq;
                    transcript.write_handshake(&hello_bytes, seqno, self.is_dtls);
                    self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &hello_bytes)?;
                    self.flush_handshake_locked(&mut out)?;
                    drop(out);
                }
                HandshakeMessage::ServerHello(server_hello) => {
                    let seqno = inp.recv_handshake_seq.wrapping_sub(1);
                    drop(inp);
                    transcript.write_handshake(&_raw, seqno, self.is_dtls);
                    // No cookie exchange; continue directly.
                    return self.client_handshake_with_server_hello(
                        hs,
                        hello,
                        server_hello,
                        transcript,
                        session,
                        x25519_private,
                    );
                }
                other => {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(Error::UnexpectedMessage(format!(
                        "expected ServerHello or HelloVerifyRequest, got {}",
                        other.type_name()
                    )));
                }
            }
        }

        // Read the ServerHello (or a HelloRetryRequest in TLS 1.3).
        let server_hello = loop {
            let mut inp = self.inp.lock();
            let (msg, raw) = self.read_handshake_msg(&mut inp)?;
            let seqno = inp.recv_handshake_seq.wrapping_sub(1);
            drop(inp);
            match msg {
                HandshakeMessage::ServerHello(server_hello) => {
                    transcript.write_handshake(&raw, seqno, self.is_dtls);
                    break server_hello;
                }
                HandshakeMessage::HelloRetryRequest(hrr) => {
                    if bugs.fail_if_hello_retry_requested {
                        return Err(Error::Expectation(
                            "unexpected HelloRetryRequest".to_string(),
                        ));
                    }
                    // Restart the transcript with the message-hash
                    // construction and send the updated hello.
                    transcript = HandshakeHash::new(
                        VERSION_TLS13,
                        cipher_suite_by_id(hrr.cipher_suite)
                            .unwrap_or(placeholder_suite),
                    );
                    transcript.write(&hello_bytes);
                    transcript.restart_with_message_hash();
                    transcript.write(&raw);

                    if hrr.has_selected_group && hrr.selected_group != CURVE_X25519.0 {
                        let _ = self.send_alert(ALERT_HANDSHAKE_FAILURE);
                        return Err(Error::Handshake(
                            "server requested an unsupported group".to_string(),
                        ));
                    }
                    hello.tls13_cookie = hrr.cookie.clone();
                    if bugs.second_client_hello_missing_key_share {
                        hello.key_shares.clear();
                    }
                    if let Some(session) = &session {
                        if !hello.psk_identities.is_empty() {
                            // Rebind against the restarted transcript.
                            let prefix = transcript.raw_transcript().to_vec();
                            self.compute_psk_binders(&mut hello, session, &prefix);
                        }
                    }
                    let second_hello = hello.marshal();
                    transcript.write(&second_hello);
                    let mut out = self.out.lock();
                    self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &second_hello)?;
                    self.flush_handshake_locked(&mut out)?;
                    drop(out);

                    // Now the true ServerHello follows.
                    let mut inp = self.inp.lock();
                    if bugs.expect_tls13_change_cipher_spec {
                        inp.expect_tls13_ccs = true;
                    }
                    let (msg, raw) = self.read_handshake_msg(&mut inp)?;
                    drop(inp);
                    match msg {
                        HandshakeMessage::ServerHello(server_hello) => {
                            transcript.write(&raw);
                            break server_hello;
                        }
                        other => {
                            let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                            return Err(Error::UnexpectedMessage(format!(
                                "expected ServerHello after HelloRetryRequest, got {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                other => {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(Error::UnexpectedMessage(format!(
                        "expected ServerHello, got {}",
                        other.type_name()
                    )));
                }
            }
        };

        self.client_handshake_with_server_hello(
            hs,
            hello,
            server_hello,
            transcript,
            session,
            x25519_private,
        )
    }

    fn client_handshake_with_server_hello(
        &self,
        hs: &mut HandshakeState,
        hello: ClientHelloMsg,
        server_hello: ServerHelloMsg,
        transcript: HandshakeHash,
        session: Option<ClientSessionState>,
        x25519_private: [u8; 32],
    ) -> TlsResult<()> {
        // Version selection: the selected_version extension wins,
        // otherwise the legacy field.
        let wire_vers = if server_hello.supported_version != 0 {
            server_hello.supported_version
        } else {
            server_hello.vers
        };
        let vers = match self.config.is_supported_version(wire_vers, self.is_dtls) {
            Some(v) => v,
            None => {
                let _ = self.send_alert(ALERT_PROTOCOL_VERSION);
                return Err(Error::ProtocolViolation(format!(
                    "server selected unsupported version {:04x}",
                    wire_vers
                )));
            }
        };
        self.set_version(wire_vers)?;

        let suite = match cipher_suite_by_id(server_hello.cipher_suite) {
            Some(s) if s.tls13 == (vers >= VERSION_TLS13) => s,
            _ => {
                let _ = self.send_alert(ALERT_HANDSHAKE_FAILURE);
                return Err(Error::Handshake(format!(
                    "server chose an unsupported cipher suite {:04x}",
                    server_hello.cipher_suite
                )));
            }
        };
        self.set_suite(suite);

        // Anti-downgrade sentinel.
        if vers < VERSION_TLS13
            && self.config.max_version(self.is_dtls) >= VERSION_TLS13
            && self.config.bugs.check_tls13_downgrade_random
            && !self.config.bugs.ignore_tls13_downgrade_random
        {
            let tail = &server_hello.random[24..];
            if tail == DOWNGRADE_TLS13 || tail == DOWNGRADE_TLS12 {
                return Err(Error::ProtocolViolation(
                    "server sent a downgrade signal".to_string(),
                ));
            }
        }

        {
            let mut neg = self.neg.lock();
            neg.client_random = hello.random;
            neg.server_random = server_hello.random;
        }

        if vers >= VERSION_TLS13 {
            self.client_handshake_tls13(
                hs,
                hello,
                server_hello,
                transcript,
                session,
                suite,
                x25519_private,
            )
        } else {
            self.client_handshake_pre13(hs, hello, server_hello, transcript, session, suite)
        }
    }

    // -----------------------------------------------------------------
    // TLS ≤ 1.2
    // -----------------------------------------------------------------

    fn client_handshake_pre13(
        &self,
        hs: &mut HandshakeState,
        hello: ClientHelloMsg,
        server_hello: ServerHelloMsg,
        mut transcript: HandshakeHash,
        session: Option<ClientSessionState>,
        suite: &'static CipherSuite,
    ) -> TlsResult<()> {
        let bugs = &self.config.bugs;
        let vers = self.vers();
        let wire_vers = self.wire_vers();
        transcript = rebuild_transcript(transcript, vers, suite);

        let exts = &server_hello.extensions;
        if self.config.bugs.require_renegotiation_info && exts.secure_renegotiation.is_none() {
            return Err(Error::Expectation(
                "server did not send renegotiation_info".to_string(),
            ));
        }
        if self.config.bugs.require_extended_master_secret && !exts.extended_master_secret {
            return Err(Error::Expectation(
                "server did not negotiate extended master secret".to_string(),
            ));
        }
        let extended_master_secret = exts.extended_master_secret;

        // Was the session resumed? Ticket resumption is signalled by
        // the server echoing our random session ID; ID resumption by
        // echoing the session's ID.
        let mut resumed = false;
        if let Some(session) = &session {
            if session.vers == vers && session.cipher_suite == server_hello.cipher_suite {
                resumed = !hello.session_id.is_empty()
                    && hello.session_id == server_hello.session_id;
            }
        }

        {
            let mut neg = self.neg.lock();
            neg.extended_master_secret = extended_master_secret;
            neg.alpn_protocol = exts.alpn_protocol.clone().unwrap_or_default();
            neg.used_alpn = exts.alpn_protocol.is_some();
            neg.srtp_protection_profile = exts.srtp_protection_profile;
            neg.sct_list = exts.sct_list.clone();
            neg.did_resume = resumed;
        }

        let master_secret: Vec<u8>;
        if resumed {
            let session = session.as_ref().expect("resumed without session");
            master_secret = session.master_secret.clone();
            {
                let mut neg = self.neg.lock();
                neg.peer_certificates = session.server_certificates.clone();
            }

            // Abbreviated handshake: the server's CCS and Finished come
            // first.
            let expect_ticket = exts.ticket_supported;
            self.finish_client_resumption(
                hs,
                &mut transcript,
                suite,
                &master_secret,
                expect_ticket,
                session,
            )?;
            self.handshake_complete
                .store(true, std::sync::atomic::Ordering::SeqCst);
            return Ok(());
        }

        // Full handshake: certificate flight.
        let mut peer_certs: Vec<Vec<u8>> = Vec::new();
        let mut ocsp_response = Vec::new();
        let mut certificate_requested = false;
        loop {
            let mut inp = self.inp.lock();
            let msg = self.read_hs_message(&mut inp, &mut transcript)?;
            drop(inp);
            match msg {
                HandshakeMessage::Certificate(cert) => {
                    peer_certs = cert.certificates.iter().map(|c| c.data.clone()).collect();
                }
                HandshakeMessage::CertificateStatus(status) => {
                    ocsp_response = status.response;
                }
                HandshakeMessage::CertificateRequest(_) => {
                    certificate_requested = true;
                }
                HandshakeMessage::ServerKeyExchange(_) => {
                    // The RSA key exchange has no ServerKeyExchange;
                    // tolerate and ignore for unknown suites is not an
                    // option here.
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(Error::UnexpectedMessage(
                        "unexpected ServerKeyExchange for RSA key exchange".to_string(),
                    ));
                }
                HandshakeMessage::ServerHelloDone(_) => break,
                other => {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(Error::UnexpectedMessage(format!(
                        "unexpected {} in server flight",
                        other.type_name()
                    )));
                }
            }
        }

        {
            let mut neg = self.neg.lock();
            neg.peer_certificates = peer_certs.clone();
            neg.ocsp_response = ocsp_response;
        }

        // The peer's RSA key arrives from the external certificate
        // parser; the config carries it pre-parsed.
        let peer_key = self
            .config
            .peer_rsa_key
            .clone()
            .ok_or_else(|| Error::Handshake("no peer RSA key configured".to_string()))?;

        let mut out = self.out.lock();

        if certificate_requested {
            // No client certificate: an empty list.
            let empty = crate::messages::CertificateMsg::default().marshal();
            self.write_hs_message(&mut out, &mut transcript, &empty)?;
        }

        // Premaster: offered version followed by 46 random bytes.
        let mut premaster = vec![0u8; 48];
        self.fill_random(&mut premaster[2..]);
        premaster[0] = (hello.vers >> 8) as u8;
        premaster[1] = hello.vers as u8;
        match bugs.bad_rsa_client_key_exchange {
            RsaBadValue::WrongVersion1 => premaster[0] ^= 1,
            RsaBadValue::WrongVersion2 => premaster[1] ^= 1,
            _ => {}
        }

        let mut encrypted = {
            let mut rng = self.rng.lock();
            peer_key
                .encrypt_pkcs1(&mut *rng, &premaster)
                .ok_or_else(|| Error::Handshake("RSA encryption failed".to_string()))?
        };
        match bugs.bad_rsa_client_key_exchange {
            RsaBadValue::Corrupt => {
                let last = encrypted.len() - 1;
                encrypted[last] ^= 1;
            }
            RsaBadValue::TooLong => encrypted.push(0),
            RsaBadValue::TooShort => {
                encrypted.pop();
            }
            _ => {}
        }

        let mut ckx_body = Vec::with_capacity(2 + encrypted.len());
        ckx_body.extend_from_slice(&(encrypted.len() as u16).to_be_bytes());
        ckx_body.extend_from_slice(&encrypted);
        let ckx = ClientKeyExchangeMsg { ciphertext: ckx_body };
        self.write_hs_message(&mut out, &mut transcript, &ckx.marshal())?;

        let master_secret = if extended_master_secret {
            extended_master_from_pre_master_secret(vers, suite, &premaster, &transcript.sum())
        } else {
            let neg = self.neg.lock();
            master_from_pre_master_secret(
                vers,
                suite,
                &premaster,
                &neg.client_random,
                &neg.server_random,
            )
        };

        // Install the pending write cipher, then ChangeCipherSpec.
        self.prepare_pre13_out_cipher(&mut out, suite, &master_secret, wire_vers)?;
        self.send_client_ccs_and_finished(hs, &mut out, &mut transcript, &master_secret)?;
        drop(out);

        // Server's turn: optional NewSessionTicket, CCS, Finished.
        let expect_ticket = server_hello.extensions.ticket_supported;
        self.read_server_ccs_and_finished(
            hs,
            &mut transcript,
            suite,
            &master_secret,
            expect_ticket,
            &peer_certs,
        )?;

        {
            let mut neg = self.neg.lock();
            neg.exporter_secret = master_secret.clone();
        }
        self.handshake_complete
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    pub(crate) fn prepare_pre13_out_cipher(
        &self,
        out: &mut HalfOut,
        suite: &'static CipherSuite,
        master_secret: &[u8],
        wire_vers: u16,
    ) -> TlsResult<()> {
        let neg = self.neg.lock();
        let kb = keys_from_master_secret(
            self.vers(),
            suite,
            master_secret,
            &neg.client_random,
            &neg.server_random,
        );
        drop(neg);
        let (key, iv, mac_key) = if self.is_client {
            (&kb.client_key, &kb.client_iv, &kb.client_mac)
        } else {
            (&kb.server_key, &kb.server_iv, &kb.server_mac)
        };
        let cipher = new_cipher_state(suite, key, iv);
        let mac = if suite.mac_len > 0 {
            Some(TlsMac::new(mac_alg_for_suite(suite), mac_key))
        } else {
            None
        };
        out.half.prepare_cipher_spec(wire_vers, cipher, mac);
        Ok(())
    }

    pub(crate) fn prepare_pre13_in_cipher(
        &self,
        inp: &mut HalfIn,
        suite: &'static CipherSuite,
        master_secret: &[u8],
        wire_vers: u16,
    ) -> TlsResult<()> {
        let neg = self.neg.lock();
        let kb = keys_from_master_secret(
            self.vers(),
            suite,
            master_secret,
            &neg.client_random,
            &neg.server_random,
        );
        drop(neg);
        let (key, iv, mac_key) = if self.is_client {
            (&kb.server_key, &kb.server_iv, &kb.server_mac)
        } else {
            (&kb.client_key, &kb.client_iv, &kb.client_mac)
        };
        let cipher = new_cipher_state(suite, key, iv);
        let mac = if suite.mac_len > 0 {
            Some(TlsMac::new(mac_alg_for_suite(suite), mac_key))
        } else {
            None
        };
        inp.half.prepare_cipher_spec(wire_vers, cipher, mac);
        Ok(())
    }

    /// Send CCS (with its fault knobs) and the client Finished.
    fn send_client_ccs_and_finished(
        &self,
        hs: &mut HandshakeState,
        out: &mut HalfOut,
        transcript: &mut HandshakeHash,
        master_secret: &[u8],
    ) -> TlsResult<()> {
        let bugs = &self.config.bugs;
        let verify = transcript.finished_sum(crate::prf::CLIENT_FINISHED_LABEL, master_secret);
        hs.client_verify = verify.clone();
        let mut finished = FinishedMsg { verify_data: verify };
        if bugs.bad_finished {
            finished.verify_data[0] ^= 1;
        }
        let finished_bytes = finished.marshal();

        let ccs_body: Vec<u8> = bugs
            .bad_change_cipher_spec
            .clone()
            .unwrap_or_else(|| vec![1]);

        if bugs.reorder_change_cipher_spec {
            // Finished first (still in the clear), then the cipher
            // change.
            self.write_hs_message(out, transcript, &finished_bytes)?;
            self.flush_handshake_locked(out)?;
            self.write_record(out, RECORD_TYPE_CHANGE_CIPHER_SPEC, &ccs_body)?;
            return Ok(());
        }

        if !bugs.skip_change_cipher_spec {
            self.write_record(out, RECORD_TYPE_CHANGE_CIPHER_SPEC, &ccs_body)?;
            for _ in 0..bugs.send_extra_change_cipher_spec {
                self.write_record(out, RECORD_TYPE_CHANGE_CIPHER_SPEC, &[1])?;
            }
        } else {
            // Change ciphers without telling the peer.
            if let Err(alert) = out.half.change_cipher_spec() {
                self.send_alert_locked(out, crate::ALERT_LEVEL_ERROR, alert)?;
            }
        }

        if let Some(data) = &bugs.app_data_after_change_cipher_spec {
            self.write_record(out, RECORD_TYPE_APPLICATION_DATA, data)?;
        }
        if let Some(alert) = bugs.alert_after_change_cipher_spec {
            self.send_alert_locked(out, crate::ALERT_LEVEL_ERROR, alert)?;
            return Err(Error::LocalAlert(alert));
        }

        if !bugs.skip_finished {
            self.write_hs_message(out, transcript, &finished_bytes)?;
            if bugs.send_extra_finished {
                self.write_hs_message(out, transcript, &finished_bytes)?;
            }
            self.flush_handshake_locked(out)?;
            if self.is_dtls && bugs.retransmit_finished {
                self.write_record(out, RECORD_TYPE_HANDSHAKE, &finished_bytes)?;
                self.flush_handshake_locked(out)?;
            }
        }
        Ok(())
    }

    /// Read the server's NewSessionTicket/CCS/Finished tail of a full
    /// handshake.
    fn read_server_ccs_and_finished(
        &self,
        hs: &mut HandshakeState,
        transcript: &mut HandshakeHash,
        suite: &'static CipherSuite,
        master_secret: &[u8],
        expect_ticket: bool,
        peer_certs: &[Vec<u8>],
    ) -> TlsResult<()> {
        let mut inp = self.inp.lock();
        let mut new_ticket: Option<Vec<u8>> = None;

        if expect_ticket {
            let msg = self.read_hs_message(&mut inp, transcript)?;
            match msg {
                HandshakeMessage::NewSessionTicket(ticket) => {
                    new_ticket = Some(ticket.ticket);
                }
                other => {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(Error::UnexpectedMessage(format!(
                        "expected NewSessionTicket, got {}",
                        other.type_name()
                    )));
                }
            }
        } else if self.config.bugs.expect_new_ticket {
            return Err(Error::Expectation(
                "server did not negotiate a session ticket".to_string(),
            ));
        }

        // The server's pending cipher installs on its CCS.
        self.prepare_pre13_in_cipher(&mut inp, suite, master_secret, self.wire_vers())?;
        self.read_record(&mut inp, RECORD_TYPE_CHANGE_CIPHER_SPEC)?;

        let expected = transcript.finished_sum(crate::prf::SERVER_FINISHED_LABEL, master_secret);
        let msg = self.read_hs_message(&mut inp, transcript)?;
        let HandshakeMessage::Finished(finished) = msg else {
            let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
            return Err(Error::UnexpectedMessage(
                "expected server Finished".to_string(),
            ));
        };
        if finished.verify_data != expected {
            let _ = self.send_alert(ALERT_HANDSHAKE_FAILURE);
            return Err(Error::Handshake(
                "server Finished verification failed".to_string(),
            ));
        }
        hs.server_verify = expected;
        drop(inp);

        if let Some(ticket) = new_ticket {
            self.store_client_session(suite, master_secret, ticket, peer_certs);
        }
        Ok(())
    }

    fn store_client_session(
        &self,
        suite: &'static CipherSuite,
        master_secret: &[u8],
        ticket: Vec<u8>,
        peer_certs: &[Vec<u8>],
    ) {
        let Some(cache) = &self.config.client_session_cache else {
            return;
        };
        let neg = self.neg.lock();
        let session = ClientSessionState {
            session_id: Vec::new(),
            session_ticket: ticket,
            vers: self.vers(),
            wire_version: self.wire_vers(),
            cipher_suite: suite.id,
            master_secret: master_secret.to_vec(),
            server_certificates: peer_certs.to_vec(),
            extended_master_secret: neg.extended_master_secret,
            sct_list: neg.sct_list.clone(),
            ocsp_response: neg.ocsp_response.clone(),
            early_alpn: neg.alpn_protocol.clone(),
            ticket_creation_time: self.config.time(),
            ticket_expiration: self.config.time() + 7 * 24 * 3600,
            ticket_age_add: 0,
            max_early_data_size: 0,
        };
        drop(neg);
        cache.put(&self.client_session_cache_key(), session);
    }

    /// The abbreviated (resumption) tail: server CCS/Finished first,
    /// then ours.
    fn finish_client_resumption(
        &self,
        hs: &mut HandshakeState,
        transcript: &mut HandshakeHash,
        suite: &'static CipherSuite,
        master_secret: &[u8],
        expect_ticket: bool,
        session: &ClientSessionState,
    ) -> TlsResult<()> {
        let mut inp = self.inp.lock();
        let mut new_ticket = None;
        if expect_ticket {
            let msg = self.read_hs_message(&mut inp, transcript)?;
            match msg {
                HandshakeMessage::NewSessionTicket(ticket) => new_ticket = Some(ticket.ticket),
                other => {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(Error::UnexpectedMessage(format!(
                        "expected NewSessionTicket, got {}",
                        other.type_name()
                    )));
                }
            }
        }

        self.prepare_pre13_in_cipher(&mut inp, suite, master_secret, self.wire_vers())?;
        self.read_record(&mut inp, RECORD_TYPE_CHANGE_CIPHER_SPEC)?;

        let expected = transcript.finished_sum(crate::prf::SERVER_FINISHED_LABEL, master_secret);
        let msg = self.read_hs_message(&mut inp, transcript)?;
        let HandshakeMessage::Finished(finished) = msg else {
            let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
            return Err(Error::UnexpectedMessage(
                "expected server Finished".to_string(),
            ));
        };
        if finished.verify_data != expected {
            let _ = self.send_alert(ALERT_HANDSHAKE_FAILURE);
            return Err(Error::Handshake(
                "server Finished verification failed".to_string(),
            ));
        }
        hs.server_verify = expected.clone();
        drop(inp);

        let mut out = self.out.lock();
        self.prepare_pre13_out_cipher(&mut out, suite, master_secret, self.wire_vers())?;
        self.send_client_ccs_and_finished(hs, &mut out, transcript, master_secret)?;
        drop(out);

        if let Some(ticket) = new_ticket {
            self.store_client_session(suite, master_secret, ticket, &session.server_certificates);
        }
        {
            let mut neg = self.neg.lock();
            neg.exporter_secret = master_secret.to_vec();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // TLS 1.3
    // -----------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn client_handshake_tls13(
        &self,
        hs: &mut HandshakeState,
        hello: ClientHelloMsg,
        server_hello: ServerHelloMsg,
        mut transcript: HandshakeHash,
        session: Option<ClientSessionState>,
        suite: &'static CipherSuite,
        x25519_private: [u8; 32],
    ) -> TlsResult<()> {
        let bugs = &self.config.bugs;
        let wire_vers = self.wire_vers();
        let hash = suite.hash;
        transcript = rebuild_transcript(transcript, VERSION_TLS13, suite);

        // ECDHE shared secret from the server's key share.
        let Some(key_share) = &server_hello.key_share else {
            let _ = self.send_alert(ALERT_MISSING_EXTENSION);
            return Err(Error::ProtocolViolation(
                "server omitted key_share".to_string(),
            ));
        };
        if key_share.group != CURVE_X25519.0 || key_share.key_exchange.len() != 32 {
            let _ = self.send_alert(ALERT_ILLEGAL_PARAMETER);
            return Err(Error::ProtocolViolation(
                "server sent an unusable key share".to_string(),
            ));
        }
        let server_public: [u8; 32] = key_share.key_exchange.as_slice().try_into().unwrap();
        let ecdhe = x25519::x25519(&x25519_private, &server_public);

        // PSK acceptance.
        let mut did_resume = false;
        let psk: Vec<u8> = match server_hello.psk_identity {
            Some(0) if !hello.psk_identities.is_empty() => {
                let session = session.as_ref().expect("offered PSK without session");
                did_resume = true;
                session.master_secret.clone()
            }
            Some(_) => {
                let _ = self.send_alert(ALERT_ILLEGAL_PARAMETER);
                return Err(Error::ProtocolViolation(
                    "server selected an unknown PSK identity".to_string(),
                ));
            }
            None => Vec::new(),
        };

        // Key schedule.
        let zero_ikm = vec![0u8; hash.digest_size()];
        let psk_ikm: &[u8] = if psk.is_empty() { &zero_ikm } else { &psk };
        let early_secret = probecrypto::hkdf::extract(hash, &[], psk_ikm);
        let derived = derive_secret(hash, &early_secret, b"derived", &hash.hash(&[]));
        let handshake_secret = probecrypto::hkdf::extract(hash, &derived, &ecdhe);

        let hello_to_sh_hash = transcript.sum();
        let client_hs_secret =
            derive_secret(hash, &handshake_secret, b"c hs traffic", &hello_to_sh_hash);
        let server_hs_secret =
            derive_secret(hash, &handshake_secret, b"s hs traffic", &hello_to_sh_hash);

        {
            let mut inp = self.inp.lock();
            if bugs.expect_tls13_change_cipher_spec {
                inp.expect_tls13_ccs = true;
            }
            self.use_in_traffic_secret(&mut inp, wire_vers, suite, &server_hs_secret)?;
        }

        // Server flight: EncryptedExtensions, optional certificate
        // material, Finished.
        let mut peer_certs: Vec<Vec<u8>> = Vec::new();
        let mut ocsp_response = Vec::new();
        let mut sct_list = Vec::new();
        let mut ee_seen = false;
        let mut early_data_accepted = false;
        let mut transcript_to_server_finished = Vec::new();

        {
            let mut inp = self.inp.lock();
            loop {
                let pre_msg_hash = transcript.sum();
                let msg = self.read_hs_message(&mut inp, &mut transcript)?;
                match msg {
                    HandshakeMessage::EncryptedExtensions(ee) => {
                        ee_seen = true;
                        early_data_accepted = ee.extensions.early_data;
                        let mut neg = self.neg.lock();
                        neg.alpn_protocol = ee.extensions.alpn_protocol.clone().unwrap_or_default();
                        neg.used_alpn = ee.extensions.alpn_protocol.is_some();
                        neg.quic_transport_params = ee.extensions.quic_transport_params.clone();
                        neg.srtp_protection_profile = ee.extensions.srtp_protection_profile;
                        if let Some(expected) = &bugs.expected_custom_extension {
                            if ee.extensions.custom_extension != *expected {
                                return Err(Error::Expectation(
                                    "missing or mismatched custom extension".to_string(),
                                ));
                            }
                        }
                    }
                    HandshakeMessage::CertificateRequest(_) => {}
                    HandshakeMessage::Certificate(cert) => {
                        peer_certs = cert.certificates.iter().map(|c| c.data.clone()).collect();
                        if let Some(first) = cert.certificates.first() {
                            ocsp_response = first.ocsp_response.clone();
                            sct_list = first.sct_list.clone();
                        }
                    }
                    HandshakeMessage::CompressedCertificate(_) => {
                        return Err(Error::Handshake(
                            "certificate compression not negotiated".to_string(),
                        ));
                    }
                    HandshakeMessage::CertificateVerify(verify) => {
                        // Signature validation is delegated to the
                        // external parser when a key is available.
                        if let Some(peer_key) = &self.config.peer_rsa_key {
                            let mut content = vec![0x20u8; 64];
                            content.extend_from_slice(b"TLS 1.3, server CertificateVerify");
                            content.push(0);
                            content.extend_from_slice(&pre_msg_hash);
                            let digest: [u8; 32] =
                                MacHash::Sha256.hash(&content).try_into().unwrap();
                            if !peer_key.verify_pkcs1_sha256(&digest, &verify.signature) {
                                let _ = self.send_alert(ALERT_DECRYPT_ERROR);
                                return Err(Error::Handshake(
                                    "CertificateVerify signature check failed".to_string(),
                                ));
                            }
                        }
                    }
                    HandshakeMessage::Finished(finished) => {
                        if !ee_seen {
                            let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                            return Err(Error::UnexpectedMessage(
                                "Finished before EncryptedExtensions".to_string(),
                            ));
                        }
                        let expected = finished_hash13(hash, &server_hs_secret, &pre_msg_hash);
                        if finished.verify_data != expected {
                            let _ = self.send_alert(ALERT_DECRYPT_ERROR);
                            return Err(Error::Handshake(
                                "server Finished verification failed".to_string(),
                            ));
                        }
                        hs.server_verify = expected;
                        transcript_to_server_finished = transcript.sum();
                        break;
                    }
                    other => {
                        let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                        return Err(Error::UnexpectedMessage(format!(
                            "unexpected {} in server flight",
                            other.type_name()
                        )));
                    }
                }
            }
        }

        // Application secrets.
        let derived = derive_secret(hash, &handshake_secret, b"derived", &hash.hash(&[]));
        let master_secret =
            probecrypto::hkdf::extract(hash, &derived, &vec![0u8; hash.digest_size()]);
        let client_ap_secret = derive_secret(
            hash,
            &master_secret,
            b"c ap traffic",
            &transcript_to_server_finished,
        );
        let server_ap_secret = derive_secret(
            hash,
            &master_secret,
            b"s ap traffic",
            &transcript_to_server_finished,
        );
        let exporter_secret = derive_secret(
            hash,
            &master_secret,
            b"exp master",
            &transcript_to_server_finished,
        );

        {
            let mut inp = self.inp.lock();
            self.use_in_traffic_secret(&mut inp, wire_vers, suite, &server_ap_secret)?;
        }

        // Client flight.
        {
            let mut out = self.out.lock();
            if bugs.send_tls13_change_cipher_spec {
                self.do_write_record(&mut out, RECORD_TYPE_CHANGE_CIPHER_SPEC, &[1])?;
            }
            if !bugs.send_unencrypted_finished {
                self.use_out_traffic_secret(&mut out, wire_vers, suite, &client_hs_secret);
            }

            if early_data_accepted && !bugs.skip_end_of_early_data {
                let eoed = crate::messages::EndOfEarlyDataMsg {
                    non_empty: bugs.non_empty_end_of_early_data,
                };
                self.write_hs_message(&mut out, &mut transcript, &eoed.marshal())?;
            }

            let verify = finished_hash13(hash, &client_hs_secret, &transcript.sum());
            hs.client_verify = verify.clone();
            let mut finished = FinishedMsg { verify_data: verify };
            if bugs.bad_finished {
                finished.verify_data[0] ^= 1;
            }
            if !bugs.skip_finished {
                let finished_bytes = finished.marshal();
                self.write_hs_message(&mut out, &mut transcript, &finished_bytes)?;
                if bugs.send_extra_finished {
                    self.write_hs_message(&mut out, &mut transcript, &finished_bytes)?;
                }
                self.flush_handshake_locked(&mut out)?;
            }

            self.use_out_traffic_secret(&mut out, wire_vers, suite, &client_ap_secret);
        }

        let resumption_secret =
            derive_secret(hash, &master_secret, b"res master", &transcript.sum());

        {
            let mut neg = self.neg.lock();
            neg.did_resume = did_resume;
            neg.peer_certificates = peer_certs;
            neg.ocsp_response = ocsp_response;
            neg.sct_list = sct_list;
            neg.resumption_secret = resumption_secret;
            neg.exporter_secret = exporter_secret;
        }

        self.handshake_complete
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// Rebuild the placeholder transcript once the real version and suite
/// are known.
pub(crate) fn rebuild_transcript(
    old: HandshakeHash,
    vers: u16,
    suite: &CipherSuite,
) -> HandshakeHash {
    let mut fresh = HandshakeHash::new(vers, suite);
    fresh.write(old.raw_transcript());
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_version_mapping() {
        let conn = Conn::dtls_client(
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
            std::sync::Arc::new(crate::config::Config::default()),
        );
        assert_eq!(conn.wire_version_for(VERSION_TLS12), VERSION_DTLS12);
        assert_eq!(conn.wire_version_for(crate::VERSION_TLS10), VERSION_DTLS10);

        let conn = Conn::client(
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
            std::sync::Arc::new(crate::config::Config::default()),
        );
        assert_eq!(conn.wire_version_for(VERSION_TLS12), VERSION_TLS12);
    }

    #[test]
    fn test_build_client_hello_offers() {
        let config = crate::config::Config {
            server_name: "peer.example".to_string(),
            next_protos: vec!["h2".to_string()],
            ..Default::default()
        };
        let conn = Conn::client(
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
            std::sync::Arc::new(config),
        );
        let hs = HandshakeState {
            err: None,
            done_first_handshake: false,
            client_verify: Vec::new(),
            server_verify: Vec::new(),
        };
        let hello = conn.build_client_hello(&hs, None, VERSION_TLS13, Some([9u8; 32]));
        assert_eq!(hello.server_name, "peer.example");
        assert!(!hello.supported_versions.is_empty());
        assert_eq!(hello.key_shares.len(), 1);
        assert_eq!(hello.alpn_protocols, vec!["h2"]);
        assert!(hello.secure_renegotiation.is_some());

        // A parse round-trip holds.
        let mut parsed = ClientHelloMsg::default();
        assert!(parsed.unmarshal(&hello.marshal()));
        assert_eq!(parsed.key_shares[0].group, CURVE_X25519.0);
    }
}
