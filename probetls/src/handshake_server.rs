//! The server side of the handshake, mirroring the client driver:
//! version and suite negotiation, DTLS cookie exchange, session
//! resumption (tickets and IDs), the TLS 1.3 flight with optional
//! HelloRetryRequest and PSK selection, and ticket issuance.

use probecrypto::hmac::MacHash;
use probecrypto::x25519;

use crate::alert::*;
use crate::cipher::{cipher_suite_by_id, suites_for_version, CipherSuite};
use crate::conn::{Conn, HandshakeState};
use crate::error::{Error, TlsResult};
use crate::messages::{
    CertificateEntry, CertificateMsg, CertificateStatusMsg, CertificateVerifyMsg, ClientHelloMsg,
    EncryptedExtensionsMsg, FinishedMsg, HandshakeMessage, HelloRetryRequestMsg,
    HelloVerifyRequestMsg, KeyShareEntry, NewSessionTicketMsg, ServerExtensions, ServerHelloMsg,
    ServerHelloDoneMsg,
};
use crate::prf::{
    derive_secret, extended_master_from_pre_master_secret, finished_hash13,
    master_from_pre_master_secret, HandshakeHash,
};
use crate::session::{decrypt_ticket, encrypt_ticket, SessionState};
use crate::{
    CURVE_X25519, DOWNGRADE_TLS13, RECORD_TYPE_CHANGE_CIPHER_SPEC, RECORD_TYPE_HANDSHAKE,
    VERSION_TLS10, VERSION_TLS12, VERSION_TLS13,
};

impl Conn {
    /// Negotiate the protocol version from the ClientHello.
    fn negotiate_server_version(&self, hello: &ClientHelloMsg) -> TlsResult<u16> {
        if self.config.bugs.negotiate_version != 0 {
            return Ok(self.config.bugs.negotiate_version);
        }

        if !hello.supported_versions.is_empty() {
            for &wire in &self.config.supported_versions(self.is_dtls) {
                if hello.supported_versions.contains(&wire) {
                    return Ok(wire);
                }
            }
            let _ = self.send_alert(ALERT_PROTOCOL_VERSION);
            return Err(Error::ProtocolViolation(
                "no mutually supported protocol version".to_string(),
            ));
        }

        // Legacy negotiation off the ClientHello version field. DTLS
        // wire versions order inversely.
        let client_vers = match crate::wire_to_version(hello.vers, self.is_dtls) {
            Some(v) => v,
            None if !self.is_dtls && hello.vers > VERSION_TLS12 => VERSION_TLS12,
            _ => {
                let _ = self.send_alert(ALERT_PROTOCOL_VERSION);
                return Err(Error::ProtocolViolation(
                    "client offered an unknown version".to_string(),
                ));
            }
        };
        let vers = client_vers.min(self.config.max_version(self.is_dtls)).min(VERSION_TLS12);
        if vers < self.config.min_version(self.is_dtls) {
            let _ = self.send_alert(ALERT_PROTOCOL_VERSION);
            return Err(Error::ProtocolViolation(
                "client version below minimum".to_string(),
            ));
        }
        Ok(self.wire_version_for_server(vers))
    }

    fn wire_version_for_server(&self, vers: u16) -> u16 {
        if self.is_dtls {
            match vers {
                VERSION_TLS12 => crate::VERSION_DTLS12,
                _ => crate::VERSION_DTLS10,
            }
        } else {
            vers
        }
    }

    fn select_suite(
        &self,
        hello: &ClientHelloMsg,
        vers: u16,
    ) -> TlsResult<&'static CipherSuite> {
        let our_order = self.config.cipher_suites();
        let pick = |id: u16| -> Option<&'static CipherSuite> {
            let suite = cipher_suite_by_id(id)?;
            if suite.tls13 != (vers >= VERSION_TLS13) {
                return None;
            }
            if !suites_for_version(vers).any(|s| s.id == id) {
                return None;
            }
            Some(suite)
        };

        if self.config.prefer_server_cipher_suites {
            for &id in &our_order {
                if hello.cipher_suites.contains(&id) {
                    if let Some(suite) = pick(id) {
                        return Ok(suite);
                    }
                }
            }
        } else {
            for &id in &hello.cipher_suites {
                if our_order.contains(&id) {
                    if let Some(suite) = pick(id) {
                        return Ok(suite);
                    }
                }
            }
        }
        let _ = self.send_alert(ALERT_HANDSHAKE_FAILURE);
        Err(Error::Handshake("no shared cipher suite".to_string()))
    }

    fn check_client_hello_expectations(&self, hello: &ClientHelloMsg) -> TlsResult<()> {
        let bugs = &self.config.bugs;
        if !bugs.expect_server_name.is_empty() && hello.server_name != bugs.expect_server_name {
            return Err(Error::Expectation(
                "missing or wrong server_name".to_string(),
            ));
        }
        if let Some(expected) = &bugs.expected_custom_extension {
            if hello.custom_extension != *expected {
                return Err(Error::Expectation(
                    "missing or mismatched custom extension".to_string(),
                ));
            }
        }
        if bugs.require_session_tickets && !hello.ticket_supported {
            return Err(Error::Expectation(
                "client did not offer session tickets".to_string(),
            ));
        }
        if bugs.require_session_ids && hello.session_id.is_empty() {
            return Err(Error::Expectation(
                "client did not offer a session ID".to_string(),
            ));
        }
        if bugs.require_renegotiation_info && hello.secure_renegotiation.is_none() {
            return Err(Error::Expectation(
                "client did not send renegotiation_info".to_string(),
            ));
        }
        if bugs.require_extended_master_secret && !hello.extended_master_secret {
            return Err(Error::Expectation(
                "client did not offer extended master secret".to_string(),
            ));
        }
        if bugs.fail_if_session_offered
            && (!hello.session_ticket.is_empty()
                || !hello.session_id.is_empty()
                || !hello.psk_identities.is_empty())
        {
            return Err(Error::Expectation(
                "client offered an unexpected session".to_string(),
            ));
        }
        Ok(())
    }

    fn select_alpn(&self, hello: &ClientHelloMsg) -> Option<String> {
        if let Some(forced) = &self.config.bugs.alpn_protocol {
            return Some(forced.clone());
        }
        for ours in &self.config.next_protos {
            if hello.alpn_protocols.iter().any(|p| p == ours) {
                return Some(ours.clone());
            }
        }
        None
    }

    /// The full server handshake.
    pub(crate) fn server_handshake(&self, hs: &mut HandshakeState) -> TlsResult<()> {
        {
            let mut rng = self.rng.lock();
            self.config.server_init(&mut *rng);
        }

        let placeholder_suite = cipher_suite_by_id(crate::cipher::TLS_AES_128_GCM_SHA256).unwrap();
        let mut transcript = HandshakeHash::new(VERSION_TLS12, placeholder_suite);

        // Read the ClientHello, running the DTLS cookie exchange first
        // when applicable.
        let (hello, hello_raw) = {
            let mut inp = self.inp.lock();
            let (msg, raw) = self.read_handshake_msg(&mut inp)?;
            let mut hello = match msg {
                HandshakeMessage::ClientHello(hello) => hello,
                other => {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(Error::UnexpectedMessage(format!(
                        "expected ClientHello, got {}",
                        other.type_name()
                    )));
                }
            };
            let mut raw = raw;

            if self.is_dtls && !self.config.bugs.skip_hello_verify_request {
                drop(inp);
                let mut cookie = vec![0u8; 20];
                self.fill_random(&mut cookie);
                let hvr = HelloVerifyRequestMsg {
                    vers: crate::VERSION_DTLS10,
                    cookie: cookie.clone(),
                };
                {
                    let mut out = self.out.lock();
                    self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &hvr.marshal())?;
                    self.flush_handshake_locked(&mut out)?;
                }

                let mut inp = self.inp.lock();
                let (msg, second_raw) = self.read_handshake_msg(&mut inp)?;
                let second = match msg {
                    HandshakeMessage::ClientHello(hello) => hello,
                    other => {
                        let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                        return Err(Error::UnexpectedMessage(format!(
                            "expected second ClientHello, got {}",
                            other.type_name()
                        )));
                    }
                };
                if second.cookie != cookie {
                    let _ = self.send_alert(ALERT_HANDSHAKE_FAILURE);
                    return Err(Error::Handshake("bad DTLS cookie".to_string()));
                }
                let seqno = inp.recv_handshake_seq.wrapping_sub(1);
                transcript.write_handshake(&second_raw, seqno, true);
                hello = second;
                raw = second_raw;
            } else {
                let seqno = inp.recv_handshake_seq.wrapping_sub(1);
                transcript.write_handshake(&raw, seqno, self.is_dtls);
            }
            (hello, raw)
        };

        self.check_client_hello_expectations(&hello)?;

        let wire_vers = self.negotiate_server_version(&hello)?;
        self.set_version(wire_vers)?;
        let vers = self.vers();

        let suite = self.select_suite(&hello, vers)?;
        self.set_suite(suite);

        let mut transcript = super::handshake_client::rebuild_transcript(
            transcript,
            vers.max(VERSION_TLS10),
            suite,
        );

        {
            let mut neg = self.neg.lock();
            neg.client_random = hello.random;
            neg.server_name = hello.server_name.clone();
            neg.quic_transport_params = hello.quic_transport_params.clone();
        }

        if vers >= VERSION_TLS13 {
            self.server_handshake_tls13(hs, hello, hello_raw, suite, &mut transcript)
        } else {
            self.server_handshake_pre13(hs, hello, suite, &mut transcript)
        }
    }

    // -----------------------------------------------------------------
    // TLS ≤ 1.2
    // -----------------------------------------------------------------

    fn server_handshake_pre13(
        &self,
        hs: &mut HandshakeState,
        hello: ClientHelloMsg,
        suite: &'static CipherSuite,
        transcript: &mut HandshakeHash,
    ) -> TlsResult<()> {
        let bugs = &self.config.bugs;
        let vers = self.vers();
        let wire_vers = self.wire_vers();

        let mut server_random = [0u8; 32];
        self.fill_random(&mut server_random);
        if bugs.send_tls13_downgrade_random
            || (self.config.max_version(self.is_dtls) >= VERSION_TLS13 && !self.is_dtls)
        {
            server_random[24..].copy_from_slice(&DOWNGRADE_TLS13);
        }
        {
            let mut neg = self.neg.lock();
            neg.server_random = server_random;
        }

        // Ticket-based resumption?
        let mut resumed_state: Option<SessionState> = None;
        if !hello.session_ticket.is_empty() && !self.config.session_tickets_disabled {
            let key = *self.config.session_ticket_key.lock();
            if let Some(state) = decrypt_ticket(&key, &hello.session_ticket) {
                let acceptable = self.config.bugs.accept_any_session
                    || (state.vers == vers
                        && state.cipher_suite == suite.id
                        && (state.ticket_expiration == 0
                            || state.ticket_expiration >= self.config.time()));
                if acceptable {
                    resumed_state = Some(state);
                }
            }
        }

        let alpn = self.select_alpn(&hello);
        let extended_master_secret =
            hello.extended_master_secret && !bugs.no_extended_master_secret;
        let negotiate_ticket = hello.ticket_supported
            && !self.config.session_tickets_disabled
            && !bugs.skip_new_session_ticket;

        let mut extensions = ServerExtensions {
            ocsp_stapling: hello.ocsp_stapling
                && self
                    .config
                    .certificates
                    .first()
                    .map(|c| !c.ocsp_staple.is_empty())
                    .unwrap_or(false),
            ticket_supported: negotiate_ticket
                && (resumed_state.is_none() || bugs.renew_ticket_on_resume),
            alpn_protocol: alpn.clone(),
            extended_master_secret,
            sct_list: self
                .config
                .certificates
                .first()
                .map(|c| c.signed_certificate_timestamp_list.clone())
                .unwrap_or_default(),
            custom_extension: bugs.custom_extension.clone(),
            server_name_ack: !hello.server_name.is_empty(),
            quic_transport_params: self.config.quic_transport_params.clone(),
            ..Default::default()
        };
        if hello.secure_renegotiation.is_some() && !self.no_renegotiation_info(hs)
            || hello.has_renegotiation_scsv() && !self.no_renegotiation_info(hs)
        {
            let mut renego = Vec::new();
            if hs.done_first_handshake {
                renego.extend_from_slice(&hs.client_verify);
                renego.extend_from_slice(&hs.server_verify);
            }
            if bugs.empty_renegotiation_info {
                renego.clear();
            }
            extensions.secure_renegotiation = Some(renego);
        }
        if !hello.srtp_protection_profiles.is_empty() {
            for &profile in &self.config.srtp_protection_profiles {
                if hello.srtp_protection_profiles.contains(&profile) {
                    extensions.srtp_protection_profile = profile;
                    break;
                }
            }
        }

        let session_id = if let Some(_state) = &resumed_state {
            // Echo the client's session ID to signal ticket acceptance.
            if bugs.empty_ticket_session_id {
                Vec::new()
            } else if bugs.ticket_session_id_length > 0 {
                let mut id = vec![0u8; bugs.ticket_session_id_length];
                self.fill_random(&mut id);
                id
            } else {
                hello.session_id.clone()
            }
        } else {
            Vec::new()
        };

        let server_hello = ServerHelloMsg {
            is_dtls: self.is_dtls,
            vers: if bugs.send_server_hello_version != 0 {
                bugs.send_server_hello_version
            } else {
                wire_vers
            },
            random: server_random,
            session_id,
            cipher_suite: suite.id,
            compression_method: bugs.send_compression_method,
            extensions,
            omit_extensions: bugs.omit_extensions,
            empty_extensions: bugs.empty_extensions,
            ..Default::default()
        };
        let ticket_negotiated = server_hello.extensions.ticket_supported;

        {
            let mut out = self.out.lock();
            self.write_hs_message(&mut out, transcript, &server_hello.marshal())?;
            self.flush_handshake_locked(&mut out)?;
        }

        {
            let mut neg = self.neg.lock();
            neg.extended_master_secret = extended_master_secret;
            neg.alpn_protocol = alpn.clone().unwrap_or_default();
            neg.used_alpn = alpn.is_some();
            neg.srtp_protection_profile = server_hello.extensions.srtp_protection_profile;
            neg.did_resume = resumed_state.is_some();
        }

        if let Some(state) = resumed_state {
            // Abbreviated handshake.
            let master_secret = state.master_secret.clone();
            let mut out = self.out.lock();
            if ticket_negotiated {
                self.send_session_ticket_pre13(&mut out, transcript, suite, &master_secret)?;
            }
            self.prepare_pre13_out_cipher(&mut out, suite, &master_secret, wire_vers)?;
            self.send_server_ccs_and_finished(hs, &mut out, transcript, &master_secret)?;
            drop(out);

            let mut inp = self.inp.lock();
            self.prepare_pre13_in_cipher(&mut inp, suite, &master_secret, wire_vers)?;
            self.read_record(&mut inp, RECORD_TYPE_CHANGE_CIPHER_SPEC)?;
            let expected =
                transcript.finished_sum(crate::prf::CLIENT_FINISHED_LABEL, &master_secret);
            let msg = self.read_hs_message(&mut inp, transcript)?;
            let HandshakeMessage::Finished(finished) = msg else {
                let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                return Err(Error::UnexpectedMessage(
                    "expected client Finished".to_string(),
                ));
            };
            if finished.verify_data != expected {
                let _ = self.send_alert(ALERT_HANDSHAKE_FAILURE);
                return Err(Error::Handshake(
                    "client Finished verification failed".to_string(),
                ));
            }
            hs.client_verify = expected;
            drop(inp);

            {
                let mut neg = self.neg.lock();
                neg.exporter_secret = master_secret;
            }
            self.handshake_complete
                .store(true, std::sync::atomic::Ordering::SeqCst);
            return Ok(());
        }

        // Full handshake: certificate flight.
        let certificate = self
            .config
            .certificates
            .first()
            .cloned()
            .ok_or_else(|| Error::Handshake("no server certificate configured".to_string()))?;

        {
            let mut out = self.out.lock();
            let cert_msg = CertificateMsg {
                has_request_context: false,
                certificates: certificate
                    .certificate
                    .iter()
                    .map(|data| CertificateEntry {
                        data: data.clone(),
                        ..Default::default()
                    })
                    .collect(),
                empty_certificate_list: bugs.empty_certificate_list,
                ..Default::default()
            };
            self.write_hs_message(&mut out, transcript, &cert_msg.marshal())?;

            if server_hello.extensions.ocsp_stapling && !bugs.skip_certificate_status {
                let status = CertificateStatusMsg {
                    response: certificate.ocsp_staple.clone(),
                };
                self.write_hs_message(&mut out, transcript, &status.marshal())?;
            }

            self.write_hs_message(&mut out, transcript, &ServerHelloDoneMsg.marshal())?;
            self.flush_handshake_locked(&mut out)?;
        }

        // Client key exchange.
        let premaster = {
            let mut inp = self.inp.lock();
            let msg = self.read_hs_message(&mut inp, transcript)?;
            let ckx = match msg {
                HandshakeMessage::Certificate(_) => {
                    // An (empty) client certificate; the next message
                    // carries the key exchange.
                    let msg = self.read_hs_message(&mut inp, transcript)?;
                    match msg {
                        HandshakeMessage::ClientKeyExchange(ckx) => ckx,
                        other => {
                            let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                            return Err(Error::UnexpectedMessage(format!(
                                "expected ClientKeyExchange, got {}",
                                other.type_name()
                            )));
                        }
                    }
                }
                HandshakeMessage::ClientKeyExchange(ckx) => ckx,
                other => {
                    let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                    return Err(Error::UnexpectedMessage(format!(
                        "expected ClientKeyExchange, got {}",
                        other.type_name()
                    )));
                }
            };
            drop(inp);

            let private_key = certificate
                .private_key
                .as_ref()
                .ok_or_else(|| Error::Handshake("no server private key".to_string()))?;

            if ckx.ciphertext.len() < 2 {
                let _ = self.send_alert(ALERT_DECODE_ERROR);
                return Err(Error::ProtocolViolation("short ClientKeyExchange".to_string()));
            }
            let claimed = u16::from_be_bytes([ckx.ciphertext[0], ckx.ciphertext[1]]) as usize;
            let ciphertext = &ckx.ciphertext[2..];
            if claimed != ciphertext.len() {
                let _ = self.send_alert(ALERT_DECODE_ERROR);
                return Err(Error::ProtocolViolation(
                    "ClientKeyExchange length mismatch".to_string(),
                ));
            }

            // Bleichenbacher countermeasure: on any padding or version
            // defect, substitute a random premaster and let Finished
            // fail instead.
            let mut premaster = vec![0u8; 48];
            self.fill_random(&mut premaster[..]);
            if let Some(decrypted) = private_key.decrypt_pkcs1(ciphertext) {
                if decrypted.len() == 48
                    && decrypted[0] == (hello.vers >> 8) as u8
                    && decrypted[1] == hello.vers as u8
                {
                    premaster = decrypted;
                }
            }
            premaster
        };

        let master_secret = if extended_master_secret {
            // The session hash covers the transcript through the
            // ClientKeyExchange.
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

        // Client's CCS and Finished.
        {
            let mut inp = self.inp.lock();
            self.prepare_pre13_in_cipher(&mut inp, suite, &master_secret, wire_vers)?;
            self.read_record(&mut inp, RECORD_TYPE_CHANGE_CIPHER_SPEC)?;
            let expected =
                transcript.finished_sum(crate::prf::CLIENT_FINISHED_LABEL, &master_secret);
            let msg = self.read_hs_message(&mut inp, transcript)?;
            let HandshakeMessage::Finished(finished) = msg else {
                let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                return Err(Error::UnexpectedMessage(
                    "expected client Finished".to_string(),
                ));
            };
            if finished.verify_data != expected {
                let _ = self.send_alert(ALERT_HANDSHAKE_FAILURE);
                return Err(Error::Handshake(
                    "client Finished verification failed".to_string(),
                ));
            }
            hs.client_verify = expected;
        }

        // Our ticket, CCS and Finished.
        {
            let mut out = self.out.lock();
            if ticket_negotiated {
                self.send_session_ticket_pre13(&mut out, transcript, suite, &master_secret)?;
            }
            self.prepare_pre13_out_cipher(&mut out, suite, &master_secret, wire_vers)?;
            self.send_server_ccs_and_finished(hs, &mut out, transcript, &master_secret)?;
        }

        {
            let mut neg = self.neg.lock();
            neg.exporter_secret = master_secret;
        }
        self.handshake_complete
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn send_session_ticket_pre13(
        &self,
        out: &mut crate::conn::HalfOut,
        transcript: &mut HandshakeHash,
        suite: &'static CipherSuite,
        master_secret: &[u8],
    ) -> TlsResult<()> {
        let now = self.config.time();
        let lifetime = match self.config.bugs.send_ticket_lifetime {
            Some(d) => d.as_secs(),
            None => 24 * 3600,
        };
        let neg = self.neg.lock();
        let state = SessionState {
            vers: self.vers(),
            cipher_suite: suite.id,
            master_secret: master_secret.to_vec(),
            certificates: Vec::new(),
            extended_master_secret: neg.extended_master_secret,
            ticket_creation_time: now,
            ticket_expiration: now + lifetime,
            ticket_age_add: 0,
            early_alpn: neg.alpn_protocol.clone().into_bytes(),
        };
        drop(neg);

        let mut msg = NewSessionTicketMsg {
            vers: self.wire_vers(),
            is_dtls: self.is_dtls,
            ticket_lifetime: lifetime as u32,
            ..Default::default()
        };
        if !self.config.bugs.send_empty_session_ticket {
            let key = *self.config.session_ticket_key.lock();
            let mut iv = [0u8; 16];
            self.fill_random(&mut iv);
            msg.ticket = encrypt_ticket(&key, &iv, &state);
        }
        self.write_hs_message(out, transcript, &msg.marshal())
    }

    fn send_server_ccs_and_finished(
        &self,
        hs: &mut HandshakeState,
        out: &mut crate::conn::HalfOut,
        transcript: &mut HandshakeHash,
        master_secret: &[u8],
    ) -> TlsResult<()> {
        let bugs = &self.config.bugs;
        let ccs_body: Vec<u8> = bugs
            .bad_change_cipher_spec
            .clone()
            .unwrap_or_else(|| vec![1]);

        let verify = transcript.finished_sum(crate::prf::SERVER_FINISHED_LABEL, master_secret);
        hs.server_verify = verify.clone();
        let mut finished = FinishedMsg { verify_data: verify };
        if bugs.bad_finished {
            finished.verify_data[0] ^= 1;
        }
        let finished_bytes = finished.marshal();

        if bugs.reorder_change_cipher_spec {
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
        } else if let Err(alert) = out.half.change_cipher_spec() {
            self.send_alert_locked(out, crate::ALERT_LEVEL_ERROR, alert)?;
        }

        if !bugs.skip_finished {
            self.write_hs_message(out, transcript, &finished_bytes)?;
            if bugs.send_extra_finished {
                self.write_hs_message(out, transcript, &finished_bytes)?;
            }
            self.flush_handshake_locked(out)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // TLS 1.3
    // -----------------------------------------------------------------

    /// Try to open a TLS 1.3 PSK offer; returns the PSK and the
    /// selected identity index.
    fn select_psk(&self, hello: &ClientHelloMsg) -> Option<(Vec<u8>, u16)> {
        if hello.psk_identities.is_empty() {
            return None;
        }
        if !hello.psk_kem_modes.contains(&crate::PSK_DHE_KE_MODE) {
            return None;
        }
        let key = *self.config.session_ticket_key.lock();
        for (i, identity) in hello.psk_identities.iter().enumerate() {
            if let Some(state) = decrypt_ticket(&key, &identity.ticket) {
                let acceptable = self.config.bugs.accept_any_session
                    || (state.vers == self.vers()
                        && cipher_suite_by_id(state.cipher_suite)
                            .map(|s| s.hash == self.suite().map(|x| x.hash).unwrap_or(MacHash::Sha256))
                            .unwrap_or(false));
                if acceptable {
                    return Some((state.master_secret, i as u16));
                }
            }
        }
        None
    }

    /// Verify the client's PSK binder against the truncated hello.
    fn verify_psk_binder(
        &self,
        hello_raw: &[u8],
        hello: &ClientHelloMsg,
        psk: &[u8],
        transcript_prefix: &[u8],
        hash: MacHash,
    ) -> TlsResult<()> {
        if hello.psk_binders.is_empty() {
            let _ = self.send_alert(ALERT_DECODE_ERROR);
            return Err(Error::ProtocolViolation("missing PSK binders".to_string()));
        }
        let binders_len: usize = 2 + hello
            .psk_binders
            .iter()
            .map(|b| 1 + b.len())
            .sum::<usize>();
        if hello_raw.len() < binders_len {
            return Err(Error::ProtocolViolation("malformed PSK offer".to_string()));
        }
        let truncated = &hello_raw[..hello_raw.len() - binders_len];

        let early_secret = probecrypto::hkdf::extract(hash, &[], psk);
        let binder_key = derive_secret(hash, &early_secret, b"res binder", &hash.hash(&[]));
        let mut transcript = Vec::with_capacity(transcript_prefix.len() + truncated.len());
        transcript.extend_from_slice(transcript_prefix);
        transcript.extend_from_slice(truncated);
        let expected = finished_hash13(hash, &binder_key, &hash.hash(&transcript));

        if !probecrypto::constant_time::ct_eq(&expected, &hello.psk_binders[0]) {
            let _ = self.send_alert(ALERT_DECRYPT_ERROR);
            return Err(Error::Handshake("PSK binder mismatch".to_string()));
        }
        Ok(())
    }

    fn server_handshake_tls13(
        &self,
        hs: &mut HandshakeState,
        mut hello: ClientHelloMsg,
        mut hello_raw: Vec<u8>,
        suite: &'static CipherSuite,
        transcript: &mut HandshakeHash,
    ) -> TlsResult<()> {
        let bugs = &self.config.bugs;
        let wire_vers = self.wire_vers();
        let hash = suite.hash;

        // HelloRetryRequest, demanded or needed.
        let needs_hrr = hello
            .key_shares
            .iter()
            .all(|share| share.group != CURVE_X25519.0);
        if (bugs.always_send_hello_retry_request || needs_hrr) && !bugs.skip_hello_retry_request {
            let hrr_count = 1 + bugs.second_hello_retry_request as usize;
            for _ in 0..hrr_count {
                let hrr = HelloRetryRequestMsg {
                    vers: wire_vers,
                    session_id: hello.session_id.clone(),
                    cipher_suite: suite.id,
                    has_selected_group: true,
                    selected_group: if bugs.send_hello_retry_request_curve != 0 {
                        bugs.send_hello_retry_request_curve
                    } else {
                        CURVE_X25519.0
                    },
                    cookie: bugs.send_hello_retry_request_cookie.clone(),
                    custom_extension: bugs.custom_hello_retry_request_extension.clone(),
                };
                transcript.restart_with_message_hash();
                let hrr_bytes = hrr.marshal();
                transcript.write(&hrr_bytes);
                {
                    let mut out = self.out.lock();
                    self.write_record(&mut out, RECORD_TYPE_HANDSHAKE, &hrr_bytes)?;
                    if bugs.send_tls13_change_cipher_spec {
                        self.do_write_record(&mut out, RECORD_TYPE_CHANGE_CIPHER_SPEC, &[1])?;
                    }
                    self.flush_handshake_locked(&mut out)?;
                }

                let mut inp = self.inp.lock();
                if bugs.expect_tls13_change_cipher_spec {
                    inp.expect_tls13_ccs = true;
                }
                let (msg, raw) = self.read_handshake_msg(&mut inp)?;
                drop(inp);
                match msg {
                    HandshakeMessage::ClientHello(second) => {
                        transcript.write(&raw);
                        hello = second;
                        hello_raw = raw;
                    }
                    other => {
                        let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                        return Err(Error::UnexpectedMessage(format!(
                            "expected second ClientHello, got {}",
                            other.type_name()
                        )));
                    }
                }
            }
        }

        let Some(client_share) = hello
            .key_shares
            .iter()
            .find(|share| share.group == CURVE_X25519.0 && share.key_exchange.len() == 32)
        else {
            let _ = self.send_alert(ALERT_MISSING_EXTENSION);
            return Err(Error::ProtocolViolation(
                "client offered no usable key share".to_string(),
            ));
        };
        let client_public: [u8; 32] = client_share.key_exchange.as_slice().try_into().unwrap();

        let mut x25519_private = [0u8; 32];
        self.fill_random(&mut x25519_private);
        let server_public = x25519::public_key(&x25519_private);
        let ecdhe = x25519::x25519(&x25519_private, &client_public);

        // PSK selection. The binder is verified against the raw hello
        // bytes with the transcript prefix (everything before this
        // ClientHello).
        let psk_selection = self.select_psk(&hello);
        let (psk, selected_identity, did_resume) = match &psk_selection {
            Some((psk, idx)) => {
                let transcript_all = transcript.raw_transcript().to_vec();
                let prefix_len = transcript_all.len() - hello_raw.len();
                self.verify_psk_binder(
                    &hello_raw,
                    &hello,
                    psk,
                    &transcript_all[..prefix_len],
                    hash,
                )?;
                (psk.clone(), Some(*idx), true)
            }
            None => (Vec::new(), None, false),
        };

        let mut server_random = [0u8; 32];
        self.fill_random(&mut server_random);
        {
            let mut neg = self.neg.lock();
            neg.server_random = server_random;
            neg.did_resume = did_resume;
        }

        let server_hello = ServerHelloMsg {
            is_dtls: self.is_dtls,
            vers: if bugs.send_server_hello_version != 0 {
                bugs.send_server_hello_version
            } else {
                VERSION_TLS12
            },
            random: server_random,
            session_id: hello.session_id.clone(),
            cipher_suite: suite.id,
            compression_method: 0,
            supported_version: if bugs.omit_server_supported_version_extension {
                0
            } else if bugs.send_server_supported_version_extension != 0 {
                bugs.send_server_supported_version_extension
            } else {
                wire_vers
            },
            key_share: Some(KeyShareEntry {
                group: CURVE_X25519.0,
                key_exchange: server_public.to_vec(),
            }),
            psk_identity: selected_identity,
            custom_unencrypted_extension: bugs.custom_unencrypted_extension.clone(),
            ..Default::default()
        };

        {
            let mut out = self.out.lock();
            self.write_hs_message(&mut out, transcript, &server_hello.marshal())?;
            if bugs.send_tls13_change_cipher_spec {
                self.do_write_record(&mut out, RECORD_TYPE_CHANGE_CIPHER_SPEC, &[1])?;
            }
            self.flush_handshake_locked(&mut out)?;
        }

        // Key schedule.
        let zero = vec![0u8; hash.digest_size()];
        let psk_ikm: &[u8] = if psk.is_empty() { &zero } else { &psk };
        let early_secret = probecrypto::hkdf::extract(hash, &[], psk_ikm);
        let derived = derive_secret(hash, &early_secret, b"derived", &hash.hash(&[]));
        let handshake_secret = probecrypto::hkdf::extract(hash, &derived, &ecdhe);

        let hello_to_sh_hash = transcript.sum();
        let client_hs_secret =
            derive_secret(hash, &handshake_secret, b"c hs traffic", &hello_to_sh_hash);
        let server_hs_secret =
            derive_secret(hash, &handshake_secret, b"s hs traffic", &hello_to_sh_hash);

        {
            let mut out = self.out.lock();
            self.use_out_traffic_secret(&mut out, wire_vers, suite, &server_hs_secret);
        }

        let alpn = self.select_alpn(&hello);
        let early_data_accepted = did_resume
            && hello.early_data
            && (bugs.always_accept_early_data || self.config.max_early_data_size > 0)
            && !bugs.always_reject_early_data;

        // Server flight.
        {
            let mut out = self.out.lock();

            let ee = EncryptedExtensionsMsg {
                extensions: ServerExtensions {
                    alpn_protocol: alpn.clone(),
                    quic_transport_params: self.config.quic_transport_params.clone(),
                    server_name_ack: !hello.server_name.is_empty(),
                    custom_extension: bugs.custom_extension.clone(),
                    early_data: early_data_accepted && !bugs.omit_early_data_extension
                        || bugs.send_early_data_extension,
                    pq_experiment_signal: self.config.pq_experiment_signal && hello.pq_experiment_signal,
                    ..Default::default()
                },
                empty: false,
            };
            self.write_hs_message(&mut out, transcript, &ee.marshal())?;

            if !did_resume {
                let certificate = self.config.certificates.first().cloned().ok_or_else(|| {
                    Error::Handshake("no server certificate configured".to_string())
                })?;
                let cert_msg = CertificateMsg {
                    has_request_context: true,
                    request_context: Vec::new(),
                    certificates: certificate
                        .certificate
                        .iter()
                        .enumerate()
                        .map(|(i, data)| CertificateEntry {
                            data: data.clone(),
                            ocsp_response: if i == 0 && hello.ocsp_stapling {
                                certificate.ocsp_staple.clone()
                            } else {
                                Vec::new()
                            },
                            sct_list: if i == 0 && hello.sct_list_supported {
                                certificate.signed_certificate_timestamp_list.clone()
                            } else {
                                Vec::new()
                            },
                        })
                        .collect(),
                    empty_certificate_list: bugs.empty_certificate_list,
                };
                self.write_hs_message(&mut out, transcript, &cert_msg.marshal())?;

                // CertificateVerify, signed with the pre-parsed key.
                let private_key = certificate
                    .private_key
                    .as_ref()
                    .ok_or_else(|| Error::Handshake("no server private key".to_string()))?;
                let mut content = vec![0x20u8; 64];
                content.extend_from_slice(b"TLS 1.3, server CertificateVerify");
                content.push(0);
                content.extend_from_slice(&transcript.sum());
                let digest: [u8; 32] = MacHash::Sha256.hash(&content).try_into().unwrap();
                let signature = private_key
                    .sign_pkcs1_sha256(&digest)
                    .ok_or_else(|| Error::Handshake("signing failed".to_string()))?;
                let verify_msg = CertificateVerifyMsg {
                    has_signature_algorithm: true,
                    signature_algorithm: 0x0401,
                    signature,
                };
                self.write_hs_message(&mut out, transcript, &verify_msg.marshal())?;
            }

            let verify = finished_hash13(hash, &server_hs_secret, &transcript.sum());
            hs.server_verify = verify.clone();
            let mut finished = FinishedMsg { verify_data: verify };
            if bugs.bad_finished {
                finished.verify_data[0] ^= 1;
            }
            if !bugs.skip_finished {
                self.write_hs_message(&mut out, transcript, &finished.marshal())?;
            }
            self.flush_handshake_locked(&mut out)?;
        }

        // Application secrets take effect for our writes immediately
        // after Finished.
        let derived = derive_secret(hash, &handshake_secret, b"derived", &hash.hash(&[]));
        let master_secret = probecrypto::hkdf::extract(hash, &derived, &zero);
        let transcript_to_server_finished = transcript.sum();
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
            let mut out = self.out.lock();
            self.use_out_traffic_secret(&mut out, wire_vers, suite, &server_ap_secret);
        }

        // Client's flight: traffic switches to the handshake secret,
        // optionally after skipped early data.
        {
            let mut inp = self.inp.lock();
            if early_data_accepted {
                inp.skip_early_data = true;
            }
            if bugs.expect_tls13_change_cipher_spec {
                inp.expect_tls13_ccs = true;
            }
            self.use_in_traffic_secret(&mut inp, wire_vers, suite, &client_hs_secret)?;

            loop {
                let pre_msg_hash = transcript.sum();
                let msg = self.read_hs_message(&mut inp, transcript)?;
                match msg {
                    HandshakeMessage::EndOfEarlyData(_) => continue,
                    HandshakeMessage::Certificate(_) => continue,
                    HandshakeMessage::Finished(finished) => {
                        let expected = finished_hash13(hash, &client_hs_secret, &pre_msg_hash);
                        if finished.verify_data != expected {
                            let _ = self.send_alert(ALERT_DECRYPT_ERROR);
                            return Err(Error::Handshake(
                                "client Finished verification failed".to_string(),
                            ));
                        }
                        hs.client_verify = expected.clone();
                        break;
                    }
                    other => {
                        let _ = self.send_alert(ALERT_UNEXPECTED_MESSAGE);
                        return Err(Error::UnexpectedMessage(format!(
                            "unexpected {} in client flight",
                            other.type_name()
                        )));
                    }
                }
            }

            self.use_in_traffic_secret(&mut inp, wire_vers, suite, &client_ap_secret)?;
        }

        let resumption_secret =
            derive_secret(hash, &master_secret, b"res master", &transcript.sum());
        {
            let mut neg = self.neg.lock();
            neg.alpn_protocol = alpn.clone().unwrap_or_default();
            neg.used_alpn = alpn.is_some();
            neg.resumption_secret = resumption_secret;
            neg.exporter_secret = exporter_secret;
        }

        self.handshake_complete
            .store(true, std::sync::atomic::Ordering::SeqCst);

        // Issue a resumption ticket unless disabled.
        if !self.config.session_tickets_disabled && !bugs.skip_new_session_ticket {
            self.send_new_session_ticket(&[0])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn server_conn(config: crate::config::Config) -> Conn {
        Conn::server(
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
            Arc::new(config),
        )
    }

    #[test]
    fn test_version_negotiation_supported_versions() {
        let conn = server_conn(crate::config::Config::default());
        let hello = ClientHelloMsg {
            vers: VERSION_TLS12,
            supported_versions: vec![VERSION_TLS13, VERSION_TLS12],
            ..Default::default()
        };
        assert_eq!(conn.negotiate_server_version(&hello).unwrap(), VERSION_TLS13);
    }

    #[test]
    fn test_version_negotiation_legacy() {
        let conn = server_conn(crate::config::Config::default());
        let hello = ClientHelloMsg {
            vers: crate::VERSION_TLS11,
            ..Default::default()
        };
        assert_eq!(
            conn.negotiate_server_version(&hello).unwrap(),
            crate::VERSION_TLS11
        );
    }

    #[test]
    fn test_suite_selection_respects_version() {
        let conn = server_conn(crate::config::Config::default());
        conn.set_version(VERSION_TLS12).unwrap();
        let hello = ClientHelloMsg {
            cipher_suites: vec![
                crate::cipher::TLS_AES_128_GCM_SHA256,
                crate::cipher::TLS_RSA_WITH_AES_128_GCM_SHA256,
            ],
            ..Default::default()
        };
        let suite = conn.select_suite(&hello, VERSION_TLS12).unwrap();
        assert_eq!(suite.id, crate::cipher::TLS_RSA_WITH_AES_128_GCM_SHA256);
    }

    #[test]
    fn test_alpn_selection() {
        let config = crate::config::Config {
            next_protos: vec!["h2".to_string(), "http/1.1".to_string()],
            ..Default::default()
        };
        let conn = server_conn(config);
        let hello = ClientHelloMsg {
            alpn_protocols: vec!["spdy".to_string(), "http/1.1".to_string()],
            ..Default::default()
        };
        assert_eq!(conn.select_alpn(&hello), Some("http/1.1".to_string()));
    }
}
