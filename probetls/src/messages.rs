//! Handshake message marshalling.
//!
//! Every message knows how to `marshal` itself (including the 4-byte
//! handshake header) and to `unmarshal` from the raw message bytes,
//! returning false on any framing defect. The connection dispatches on
//! the leading type byte.

use crate::{
    COMPRESSION_NONE, EXTENSION_ALPN,
    EXTENSION_CHANNEL_ID, EXTENSION_COOKIE, EXTENSION_CUSTOM, EXTENSION_EARLY_DATA,
    EXTENSION_EXTENDED_MASTER_SECRET, EXTENSION_KEY_SHARE, EXTENSION_NEXT_PROTO_NEG,
    EXTENSION_PQ_EXPERIMENT_SIGNAL, EXTENSION_PRE_SHARED_KEY, EXTENSION_PSK_KEY_EXCHANGE_MODES,
    EXTENSION_QUIC_TRANSPORT_PARAMS, EXTENSION_RENEGOTIATION_INFO, EXTENSION_SERVER_NAME,
    EXTENSION_SESSION_TICKET, EXTENSION_SIGNATURE_ALGORITHMS,
    EXTENSION_SIGNED_CERTIFICATE_TIMESTAMP, EXTENSION_STATUS_REQUEST, EXTENSION_SUPPORTED_CURVES,
    EXTENSION_SUPPORTED_POINTS, EXTENSION_SUPPORTED_VERSIONS, EXTENSION_USE_SRTP,
    EXTENSION_PADDING, SCSV_FALLBACK, SCSV_RENEGOTIATION, TLS13_HELLO_RETRY_REQUEST_RANDOM,
    TYPE_CERTIFICATE, TYPE_CERTIFICATE_REQUEST, TYPE_CERTIFICATE_STATUS, TYPE_CERTIFICATE_VERIFY,
    TYPE_CHANNEL_ID, TYPE_CLIENT_HELLO, TYPE_CLIENT_KEY_EXCHANGE, TYPE_COMPRESSED_CERTIFICATE,
    TYPE_ENCRYPTED_EXTENSIONS, TYPE_END_OF_EARLY_DATA, TYPE_FINISHED, TYPE_HELLO_REQUEST,
    TYPE_HELLO_VERIFY_REQUEST, TYPE_KEY_UPDATE, TYPE_NEW_SESSION_TICKET, TYPE_NEXT_PROTOCOL,
    TYPE_SERVER_HELLO, TYPE_SERVER_HELLO_DONE, TYPE_SERVER_KEY_EXCHANGE, VERSION_TLS12,
    VERSION_TLS13,
};

// ---------------------------------------------------------------------------
// Wire encoding helpers
// ---------------------------------------------------------------------------

pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub(crate) fn put_u24(buf: &mut Vec<u8>, v: usize) {
    buf.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

/// Append a u16-length-prefixed block produced by `f`.
pub(crate) fn with_u16_len(buf: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let mark = buf.len();
    buf.extend_from_slice(&[0, 0]);
    f(buf);
    let len = buf.len() - mark - 2;
    buf[mark..mark + 2].copy_from_slice(&(len as u16).to_be_bytes());
}

/// Append a u24-length-prefixed block produced by `f`.
pub(crate) fn with_u24_len(buf: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let mark = buf.len();
    buf.extend_from_slice(&[0, 0, 0]);
    f(buf);
    let len = buf.len() - mark - 3;
    buf[mark] = (len >> 16) as u8;
    buf[mark + 1] = (len >> 8) as u8;
    buf[mark + 2] = len as u8;
}

/// Append a u8-length-prefixed block produced by `f`.
pub(crate) fn with_u8_len(buf: &mut Vec<u8>, f: impl FnOnce(&mut Vec<u8>)) {
    let mark = buf.len();
    buf.push(0);
    f(buf);
    let len = buf.len() - mark - 1;
    buf[mark] = len as u8;
}

/// Wrap a marshalled body in the handshake header.
fn handshake_message(typ: u8, body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(typ);
    with_u24_len(&mut buf, body);
    buf
}

/// Cursor over raw message bytes; every getter fails softly so
/// unmarshal can collapse to `false`.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn u8(&mut self) -> Option<u8> {
        let (&v, rest) = self.data.split_first()?;
        self.data = rest;
        Some(v)
    }

    pub fn u16(&mut self) -> Option<u16> {
        let v = self.bytes(2)?;
        Some(u16::from_be_bytes([v[0], v[1]]))
    }

    pub fn u24(&mut self) -> Option<usize> {
        let v = self.bytes(3)?;
        Some(((v[0] as usize) << 16) | ((v[1] as usize) << 8) | v[2] as usize)
    }

    pub fn u32(&mut self) -> Option<u32> {
        let v = self.bytes(4)?;
        Some(u32::from_be_bytes([v[0], v[1], v[2], v[3]]))
    }

    pub fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.data.len() < n {
            return None;
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Some(head)
    }

    pub fn u8_vec(&mut self) -> Option<&'a [u8]> {
        let n = self.u8()? as usize;
        self.bytes(n)
    }

    pub fn u16_vec(&mut self) -> Option<&'a [u8]> {
        let n = self.u16()? as usize;
        self.bytes(n)
    }

    pub fn u24_vec(&mut self) -> Option<&'a [u8]> {
        let n = self.u24()?;
        self.bytes(n)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.data)
    }
}

/// Strip and validate the handshake header, returning the body.
fn message_body(expected_type: u8, data: &[u8]) -> Option<&[u8]> {
    if data.len() < 4 || data[0] != expected_type {
        return None;
    }
    let len = ((data[1] as usize) << 16) | ((data[2] as usize) << 8) | data[3] as usize;
    if data.len() != 4 + len {
        return None;
    }
    Some(&data[4..])
}

// ---------------------------------------------------------------------------
// Shared extension structures
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyShareEntry {
    pub group: u16,
    pub key_exchange: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PskIdentity {
    pub ticket: Vec<u8>,
    pub obfuscated_ticket_age: u32,
}

/// Extensions a server can acknowledge, shared between the pre-1.3
/// ServerHello and the TLS 1.3 EncryptedExtensions.
#[derive(Clone, Debug, Default)]
pub struct ServerExtensions {
    pub ocsp_stapling: bool,
    pub ticket_supported: bool,
    pub secure_renegotiation: Option<Vec<u8>>,
    pub alpn_protocol: Option<String>,
    pub extended_master_secret: bool,
    pub srtp_protection_profile: u16,
    pub srtp_master_key_identifier: Vec<u8>,
    pub sct_list: Vec<u8>,
    pub custom_extension: String,
    pub server_name_ack: bool,
    pub supported_points: Vec<u8>,
    pub quic_transport_params: Vec<u8>,
    pub early_data: bool,
    pub channel_id_requested: bool,
    pub pq_experiment_signal: bool,
}

impl ServerExtensions {
    fn marshal(&self, buf: &mut Vec<u8>) {
        if self.server_name_ack {
            put_u16(buf, EXTENSION_SERVER_NAME);
            put_u16(buf, 0);
        }
        if self.ocsp_stapling {
            put_u16(buf, EXTENSION_STATUS_REQUEST);
            put_u16(buf, 0);
        }
        if self.ticket_supported {
            put_u16(buf, EXTENSION_SESSION_TICKET);
            put_u16(buf, 0);
        }
        if let Some(renego) = &self.secure_renegotiation {
            put_u16(buf, EXTENSION_RENEGOTIATION_INFO);
            with_u16_len(buf, |buf| {
                with_u8_len(buf, |buf| buf.extend_from_slice(renego));
            });
        }
        if let Some(proto) = &self.alpn_protocol {
            put_u16(buf, EXTENSION_ALPN);
            with_u16_len(buf, |buf| {
                with_u16_len(buf, |buf| {
                    with_u8_len(buf, |buf| buf.extend_from_slice(proto.as_bytes()));
                });
            });
        }
        if self.extended_master_secret {
            put_u16(buf, EXTENSION_EXTENDED_MASTER_SECRET);
            put_u16(buf, 0);
        }
        if self.srtp_protection_profile != 0 {
            put_u16(buf, EXTENSION_USE_SRTP);
            with_u16_len(buf, |buf| {
                with_u16_len(buf, |buf| put_u16(buf, self.srtp_protection_profile));
                with_u8_len(buf, |buf| {
                    buf.extend_from_slice(&self.srtp_master_key_identifier)
                });
            });
        }
        if !self.sct_list.is_empty() {
            put_u16(buf, EXTENSION_SIGNED_CERTIFICATE_TIMESTAMP);
            with_u16_len(buf, |buf| buf.extend_from_slice(&self.sct_list));
        }
        if !self.custom_extension.is_empty() {
            put_u16(buf, EXTENSION_CUSTOM);
            with_u16_len(buf, |buf| {
                buf.extend_from_slice(self.custom_extension.as_bytes())
            });
        }
        if !self.supported_points.is_empty() {
            put_u16(buf, EXTENSION_SUPPORTED_POINTS);
            with_u16_len(buf, |buf| {
                with_u8_len(buf, |buf| buf.extend_from_slice(&self.supported_points));
            });
        }
        if !self.quic_transport_params.is_empty() {
            put_u16(buf, EXTENSION_QUIC_TRANSPORT_PARAMS);
            with_u16_len(buf, |buf| {
                buf.extend_from_slice(&self.quic_transport_params)
            });
        }
        if self.early_data {
            put_u16(buf, EXTENSION_EARLY_DATA);
            put_u16(buf, 0);
        }
        if self.channel_id_requested {
            put_u16(buf, EXTENSION_CHANNEL_ID);
            put_u16(buf, 0);
        }
        if self.pq_experiment_signal {
            put_u16(buf, EXTENSION_PQ_EXPERIMENT_SIGNAL);
            put_u16(buf, 0);
        }
    }

    /// Absorb one extension. Unknown extensions are ignored; malformed
    /// known extensions return false.
    fn parse_one(&mut self, ext: u16, body: &[u8]) -> bool {
        let mut r = Reader::new(body);
        match ext {
            EXTENSION_SERVER_NAME => {
                self.server_name_ack = true;
                body.is_empty()
            }
            EXTENSION_STATUS_REQUEST => {
                self.ocsp_stapling = true;
                body.is_empty()
            }
            EXTENSION_SESSION_TICKET => {
                self.ticket_supported = true;
                body.is_empty()
            }
            EXTENSION_RENEGOTIATION_INFO => match r.u8_vec() {
                Some(data) if r.is_empty() => {
                    self.secure_renegotiation = Some(data.to_vec());
                    true
                }
                _ => false,
            },
            EXTENSION_ALPN => {
                let Some(mut list) = r.u16_vec().map(Reader::new) else {
                    return false;
                };
                let Some(proto) = list.u8_vec() else {
                    return false;
                };
                if !list.is_empty() || !r.is_empty() {
                    return false;
                }
                self.alpn_protocol = Some(String::from_utf8_lossy(proto).into_owned());
                true
            }
            EXTENSION_EXTENDED_MASTER_SECRET => {
                self.extended_master_secret = true;
                body.is_empty()
            }
            EXTENSION_USE_SRTP => {
                let Some(mut profiles) = r.u16_vec().map(Reader::new) else {
                    return false;
                };
                let Some(profile) = profiles.u16() else {
                    return false;
                };
                let Some(mki) = r.u8_vec() else { return false };
                self.srtp_protection_profile = profile;
                self.srtp_master_key_identifier = mki.to_vec();
                profiles.is_empty() && r.is_empty()
            }
            EXTENSION_SIGNED_CERTIFICATE_TIMESTAMP => {
                self.sct_list = body.to_vec();
                true
            }
            EXTENSION_CUSTOM => {
                self.custom_extension = String::from_utf8_lossy(body).into_owned();
                true
            }
            EXTENSION_SUPPORTED_POINTS => match r.u8_vec() {
                Some(points) if r.is_empty() => {
                    self.supported_points = points.to_vec();
                    true
                }
                _ => false,
            },
            EXTENSION_QUIC_TRANSPORT_PARAMS => {
                self.quic_transport_params = body.to_vec();
                true
            }
            EXTENSION_EARLY_DATA => {
                self.early_data = true;
                body.is_empty()
            }
            EXTENSION_CHANNEL_ID => {
                self.channel_id_requested = true;
                body.is_empty()
            }
            EXTENSION_PQ_EXPERIMENT_SIGNAL => {
                self.pq_experiment_signal = true;
                body.is_empty()
            }
            _ => true,
        }
    }
}

// ---------------------------------------------------------------------------
// ClientHello
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ClientHelloMsg {
    pub is_dtls: bool,
    pub vers: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cookie: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,

    pub server_name: String,
    pub ocsp_stapling: bool,
    pub supported_curves: Vec<u16>,
    pub supported_points: Vec<u8>,
    pub ticket_supported: bool,
    pub session_ticket: Vec<u8>,
    pub signature_algorithms: Vec<u16>,
    pub supported_versions: Vec<u16>,
    pub secure_renegotiation: Option<Vec<u8>>,
    pub alpn_protocols: Vec<String>,
    pub extended_master_secret: bool,
    pub sct_list_supported: bool,
    pub srtp_protection_profiles: Vec<u16>,
    pub srtp_master_key_identifier: Vec<u8>,
    pub key_shares: Vec<KeyShareEntry>,
    pub psk_identities: Vec<PskIdentity>,
    pub psk_binders: Vec<Vec<u8>>,
    pub psk_kem_modes: Vec<u8>,
    pub early_data: bool,
    pub tls13_cookie: Vec<u8>,
    pub custom_extension: String,
    pub quic_transport_params: Vec<u8>,
    pub channel_id_supported: bool,
    pub next_proto_neg: bool,
    pub pq_experiment_signal: bool,

    // Marshal-time deviations.
    pub duplicate_extension: bool,
    pub omit_extensions: bool,
    pub empty_extensions: bool,
    pub pad_to: usize,
    pub psk_binder_first: bool,
    pub send_no_psk_binder: bool,
    pub duplicate_key_shares: bool,
    pub trailing_key_share_data: bool,
}

impl ClientHelloMsg {
    fn marshal_key_shares(&self, buf: &mut Vec<u8>) {
        with_u16_len(buf, |buf| {
            for share in &self.key_shares {
                put_u16(buf, share.group);
                with_u16_len(buf, |buf| {
                    buf.extend_from_slice(&share.key_exchange);
                    if self.trailing_key_share_data {
                        buf.push(0);
                    }
                });
                if self.duplicate_key_shares {
                    put_u16(buf, share.group);
                    with_u16_len(buf, |buf| buf.extend_from_slice(&share.key_exchange));
                }
            }
        });
    }

    fn marshal_psk(&self, buf: &mut Vec<u8>) {
        put_u16(buf, EXTENSION_PRE_SHARED_KEY);
        with_u16_len(buf, |buf| {
            with_u16_len(buf, |buf| {
                for identity in &self.psk_identities {
                    with_u16_len(buf, |buf| buf.extend_from_slice(&identity.ticket));
                    put_u32(buf, identity.obfuscated_ticket_age);
                }
            });
            if !self.send_no_psk_binder {
                with_u16_len(buf, |buf| {
                    for binder in &self.psk_binders {
                        with_u8_len(buf, |buf| buf.extend_from_slice(binder));
                    }
                });
            }
        });
    }

    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_CLIENT_HELLO, |buf| {
            put_u16(buf, self.vers);
            buf.extend_from_slice(&self.random);
            with_u8_len(buf, |buf| buf.extend_from_slice(&self.session_id));
            if self.is_dtls {
                with_u8_len(buf, |buf| buf.extend_from_slice(&self.cookie));
            }
            with_u16_len(buf, |buf| {
                for &suite in &self.cipher_suites {
                    put_u16(buf, suite);
                }
            });
            with_u8_len(buf, |buf| buf.extend_from_slice(&self.compression_methods));

            if self.omit_extensions {
                return;
            }

            let mark = buf.len();
            with_u16_len(buf, |buf| {
                if self.empty_extensions {
                    return;
                }
                if self.duplicate_extension {
                    put_u16(buf, 0x7fd0);
                    put_u16(buf, 0);
                    put_u16(buf, 0x7fd0);
                    put_u16(buf, 0);
                }
                if self.psk_binder_first && !self.psk_identities.is_empty() {
                    self.marshal_psk(buf);
                }
                if !self.server_name.is_empty() {
                    put_u16(buf, EXTENSION_SERVER_NAME);
                    with_u16_len(buf, |buf| {
                        with_u16_len(buf, |buf| {
                            buf.push(0); // host_name
                            with_u16_len(buf, |buf| {
                                buf.extend_from_slice(self.server_name.as_bytes())
                            });
                        });
                    });
                }
                if self.ocsp_stapling {
                    put_u16(buf, EXTENSION_STATUS_REQUEST);
                    with_u16_len(buf, |buf| {
                        buf.push(1); // ocsp
                        put_u16(buf, 0); // responder id list
                        put_u16(buf, 0); // request extensions
                    });
                }
                if !self.supported_curves.is_empty() {
                    put_u16(buf, EXTENSION_SUPPORTED_CURVES);
                    with_u16_len(buf, |buf| {
                        with_u16_len(buf, |buf| {
                            for &curve in &self.supported_curves {
                                put_u16(buf, curve);
                            }
                        });
                    });
                }
                if !self.supported_points.is_empty() {
                    put_u16(buf, EXTENSION_SUPPORTED_POINTS);
                    with_u16_len(buf, |buf| {
                        with_u8_len(buf, |buf| buf.extend_from_slice(&self.supported_points));
                    });
                }
                if self.ticket_supported {
                    put_u16(buf, EXTENSION_SESSION_TICKET);
                    with_u16_len(buf, |buf| buf.extend_from_slice(&self.session_ticket));
                }
                if !self.signature_algorithms.is_empty() {
                    put_u16(buf, EXTENSION_SIGNATURE_ALGORITHMS);
                    with_u16_len(buf, |buf| {
                        with_u16_len(buf, |buf| {
                            for &alg in &self.signature_algorithms {
                                put_u16(buf, alg);
                            }
                        });
                    });
                }
                if !self.supported_versions.is_empty() {
                    put_u16(buf, EXTENSION_SUPPORTED_VERSIONS);
                    with_u16_len(buf, |buf| {
                        with_u8_len(buf, |buf| {
                            for &vers in &self.supported_versions {
                                put_u16(buf, vers);
                            }
                        });
                    });
                }
                if let Some(renego) = &self.secure_renegotiation {
                    put_u16(buf, EXTENSION_RENEGOTIATION_INFO);
                    with_u16_len(buf, |buf| {
                        with_u8_len(buf, |buf| buf.extend_from_slice(renego));
                    });
                }
                if !self.alpn_protocols.is_empty() {
                    put_u16(buf, EXTENSION_ALPN);
                    with_u16_len(buf, |buf| {
                        with_u16_len(buf, |buf| {
                            for proto in &self.alpn_protocols {
                                with_u8_len(buf, |buf| {
                                    buf.extend_from_slice(proto.as_bytes())
                                });
                            }
                        });
                    });
                }
                if self.extended_master_secret {
                    put_u16(buf, EXTENSION_EXTENDED_MASTER_SECRET);
                    put_u16(buf, 0);
                }
                if self.sct_list_supported {
                    put_u16(buf, EXTENSION_SIGNED_CERTIFICATE_TIMESTAMP);
                    put_u16(buf, 0);
                }
                if !self.srtp_protection_profiles.is_empty() {
                    put_u16(buf, EXTENSION_USE_SRTP);
                    with_u16_len(buf, |buf| {
                        with_u16_len(buf, |buf| {
                            for &profile in &self.srtp_protection_profiles {
                                put_u16(buf, profile);
                            }
                        });
                        with_u8_len(buf, |buf| {
                            buf.extend_from_slice(&self.srtp_master_key_identifier)
                        });
                    });
                }
                if !self.key_shares.is_empty() {
                    put_u16(buf, EXTENSION_KEY_SHARE);
                    with_u16_len(buf, |buf| self.marshal_key_shares(buf));
                }
                if !self.psk_kem_modes.is_empty() {
                    put_u16(buf, EXTENSION_PSK_KEY_EXCHANGE_MODES);
                    with_u16_len(buf, |buf| {
                        with_u8_len(buf, |buf| buf.extend_from_slice(&self.psk_kem_modes));
                    });
                }
                if self.early_data {
                    put_u16(buf, EXTENSION_EARLY_DATA);
                    put_u16(buf, 0);
                }
                if !self.tls13_cookie.is_empty() {
                    put_u16(buf, EXTENSION_COOKIE);
                    with_u16_len(buf, |buf| {
                        with_u16_len(buf, |buf| buf.extend_from_slice(&self.tls13_cookie));
                    });
                }
                if !self.custom_extension.is_empty() {
                    put_u16(buf, EXTENSION_CUSTOM);
                    with_u16_len(buf, |buf| {
                        buf.extend_from_slice(self.custom_extension.as_bytes())
                    });
                }
                if !self.quic_transport_params.is_empty() {
                    put_u16(buf, EXTENSION_QUIC_TRANSPORT_PARAMS);
                    with_u16_len(buf, |buf| {
                        buf.extend_from_slice(&self.quic_transport_params)
                    });
                }
                if self.channel_id_supported {
                    put_u16(buf, EXTENSION_CHANNEL_ID);
                    put_u16(buf, 0);
                }
                if self.next_proto_neg {
                    put_u16(buf, EXTENSION_NEXT_PROTO_NEG);
                    put_u16(buf, 0);
                }
                if self.pq_experiment_signal {
                    put_u16(buf, EXTENSION_PQ_EXPERIMENT_SIGNAL);
                    put_u16(buf, 0);
                }
                // pre_shared_key must be last unless deliberately
                // misplaced.
                if !self.psk_binder_first && !self.psk_identities.is_empty() {
                    self.marshal_psk(buf);
                }
                if self.pad_to > 0 {
                    // Account for everything emitted so far plus the
                    // padding extension header itself.
                    let so_far = buf.len() + 4;
                    if so_far < self.pad_to {
                        put_u16(buf, EXTENSION_PADDING);
                        with_u16_len(buf, |buf| {
                            buf.resize(buf.len() + (self.pad_to - so_far), 0);
                        });
                    }
                }
            });
            // An empty, non-omitted extensions block is dropped
            // entirely unless explicitly requested.
            if !self.empty_extensions && buf.len() == mark + 2 {
                buf.truncate(mark);
            }
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_CLIENT_HELLO, data) else {
            return false;
        };
        let mut r = Reader::new(body);

        let Some(vers) = r.u16() else { return false };
        self.vers = vers;
        let Some(random) = r.bytes(32) else { return false };
        self.random.copy_from_slice(random);
        let Some(session_id) = r.u8_vec() else { return false };
        self.session_id = session_id.to_vec();
        if self.is_dtls {
            let Some(cookie) = r.u8_vec() else { return false };
            self.cookie = cookie.to_vec();
        }
        let Some(mut suites) = r.u16_vec().map(Reader::new) else {
            return false;
        };
        self.cipher_suites.clear();
        while !suites.is_empty() {
            let Some(suite) = suites.u16() else { return false };
            self.cipher_suites.push(suite);
        }
        let Some(compressions) = r.u8_vec() else { return false };
        self.compression_methods = compressions.to_vec();

        if r.is_empty() {
            return true;
        }
        let Some(mut exts) = r.u16_vec().map(Reader::new) else {
            return false;
        };
        if !r.is_empty() {
            return false;
        }

        while !exts.is_empty() {
            let Some(ext) = exts.u16() else { return false };
            let Some(ext_body) = exts.u16_vec() else { return false };
            let mut er = Reader::new(ext_body);
            let ok = match ext {
                EXTENSION_SERVER_NAME => (|| {
                    let mut names = Reader::new(er.u16_vec()?);
                    while !names.is_empty() {
                        let name_type = names.u8()?;
                        let name = names.u16_vec()?;
                        if name_type == 0 {
                            self.server_name = String::from_utf8_lossy(name).into_owned();
                        }
                    }
                    Some(())
                })()
                .is_some(),
                EXTENSION_STATUS_REQUEST => {
                    self.ocsp_stapling = !ext_body.is_empty() && ext_body[0] == 1;
                    true
                }
                EXTENSION_SUPPORTED_CURVES => (|| {
                    let mut curves = Reader::new(er.u16_vec()?);
                    self.supported_curves.clear();
                    while !curves.is_empty() {
                        self.supported_curves.push(curves.u16()?);
                    }
                    Some(())
                })()
                .is_some(),
                EXTENSION_SUPPORTED_POINTS => (|| {
                    self.supported_points = er.u8_vec()?.to_vec();
                    Some(())
                })()
                .is_some(),
                EXTENSION_SESSION_TICKET => {
                    self.ticket_supported = true;
                    self.session_ticket = ext_body.to_vec();
                    true
                }
                EXTENSION_SIGNATURE_ALGORITHMS => (|| {
                    let mut algs = Reader::new(er.u16_vec()?);
                    self.signature_algorithms.clear();
                    while !algs.is_empty() {
                        self.signature_algorithms.push(algs.u16()?);
                    }
                    Some(())
                })()
                .is_some(),
                EXTENSION_SUPPORTED_VERSIONS => (|| {
                    let mut versions = Reader::new(er.u8_vec()?);
                    self.supported_versions.clear();
                    while !versions.is_empty() {
                        self.supported_versions.push(versions.u16()?);
                    }
                    Some(())
                })()
                .is_some(),
                EXTENSION_RENEGOTIATION_INFO => (|| {
                    self.secure_renegotiation = Some(er.u8_vec()?.to_vec());
                    Some(())
                })()
                .is_some(),
                EXTENSION_ALPN => (|| {
                    let mut protos = Reader::new(er.u16_vec()?);
                    self.alpn_protocols.clear();
                    while !protos.is_empty() {
                        self.alpn_protocols
                            .push(String::from_utf8_lossy(protos.u8_vec()?).into_owned());
                    }
                    Some(())
                })()
                .is_some(),
                EXTENSION_EXTENDED_MASTER_SECRET => {
                    self.extended_master_secret = true;
                    ext_body.is_empty()
                }
                EXTENSION_SIGNED_CERTIFICATE_TIMESTAMP => {
                    self.sct_list_supported = true;
                    ext_body.is_empty()
                }
                EXTENSION_USE_SRTP => (|| {
                    let mut profiles = Reader::new(er.u16_vec()?);
                    self.srtp_protection_profiles.clear();
                    while !profiles.is_empty() {
                        self.srtp_protection_profiles.push(profiles.u16()?);
                    }
                    self.srtp_master_key_identifier = er.u8_vec()?.to_vec();
                    Some(())
                })()
                .is_some(),
                EXTENSION_KEY_SHARE => (|| {
                    let mut shares = Reader::new(er.u16_vec()?);
                    self.key_shares.clear();
                    while !shares.is_empty() {
                        let group = shares.u16()?;
                        let key_exchange = shares.u16_vec()?.to_vec();
                        self.key_shares.push(KeyShareEntry { group, key_exchange });
                    }
                    Some(())
                })()
                .is_some(),
                EXTENSION_PRE_SHARED_KEY => (|| {
                    let mut identities = Reader::new(er.u16_vec()?);
                    self.psk_identities.clear();
                    while !identities.is_empty() {
                        let ticket = identities.u16_vec()?.to_vec();
                        let obfuscated_ticket_age = identities.u32()?;
                        self.psk_identities.push(PskIdentity {
                            ticket,
                            obfuscated_ticket_age,
                        });
                    }
                    let mut binders = Reader::new(er.u16_vec()?);
                    self.psk_binders.clear();
                    while !binders.is_empty() {
                        self.psk_binders.push(binders.u8_vec()?.to_vec());
                    }
                    Some(())
                })()
                .is_some(),
                EXTENSION_PSK_KEY_EXCHANGE_MODES => (|| {
                    self.psk_kem_modes = er.u8_vec()?.to_vec();
                    Some(())
                })()
                .is_some(),
                EXTENSION_EARLY_DATA => {
                    self.early_data = true;
                    ext_body.is_empty()
                }
                EXTENSION_COOKIE => (|| {
                    self.tls13_cookie = er.u16_vec()?.to_vec();
                    Some(())
                })()
                .is_some(),
                EXTENSION_CUSTOM => {
                    self.custom_extension = String::from_utf8_lossy(ext_body).into_owned();
                    true
                }
                EXTENSION_QUIC_TRANSPORT_PARAMS => {
                    self.quic_transport_params = ext_body.to_vec();
                    true
                }
                EXTENSION_CHANNEL_ID => {
                    self.channel_id_supported = true;
                    ext_body.is_empty()
                }
                EXTENSION_NEXT_PROTO_NEG => {
                    self.next_proto_neg = true;
                    true
                }
                EXTENSION_PQ_EXPERIMENT_SIGNAL => {
                    self.pq_experiment_signal = true;
                    ext_body.is_empty()
                }
                _ => true,
            };
            if !ok {
                return false;
            }
        }
        true
    }

    pub fn has_renegotiation_scsv(&self) -> bool {
        self.cipher_suites.contains(&SCSV_RENEGOTIATION)
    }

    pub fn has_fallback_scsv(&self) -> bool {
        self.cipher_suites.contains(&SCSV_FALLBACK)
    }
}

// ---------------------------------------------------------------------------
// ServerHello / HelloRetryRequest
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ServerHelloMsg {
    pub is_dtls: bool,
    /// legacy_version on the wire.
    pub vers: u16,
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub compression_method: u8,

    /// TLS 1.3 selected_version; zero when absent.
    pub supported_version: u16,
    pub key_share: Option<KeyShareEntry>,
    pub psk_identity: Option<u16>,
    pub custom_unencrypted_extension: String,

    /// Pre-1.3 acknowledged extensions.
    pub extensions: ServerExtensions,
    pub omit_extensions: bool,
    pub empty_extensions: bool,
}

impl ServerHelloMsg {
    /// True when this ServerHello is TLS 1.3-shaped (selected_version
    /// present).
    pub fn is_tls13(&self) -> bool {
        self.supported_version >= VERSION_TLS13
    }

    pub fn marshal(&self) -> Vec<u8> {
        self.marshal_as(TYPE_SERVER_HELLO)
    }

    pub fn marshal_as(&self, typ: u8) -> Vec<u8> {
        handshake_message(typ, |buf| {
            put_u16(buf, self.vers);
            buf.extend_from_slice(&self.random);
            with_u8_len(buf, |buf| buf.extend_from_slice(&self.session_id));
            put_u16(buf, self.cipher_suite);
            buf.push(self.compression_method);

            if self.omit_extensions {
                return;
            }
            let mark = buf.len();
            with_u16_len(buf, |buf| {
                if self.empty_extensions {
                    return;
                }
                if self.supported_version != 0 {
                    put_u16(buf, EXTENSION_SUPPORTED_VERSIONS);
                    with_u16_len(buf, |buf| put_u16(buf, self.supported_version));
                }
                if let Some(share) = &self.key_share {
                    put_u16(buf, EXTENSION_KEY_SHARE);
                    with_u16_len(buf, |buf| {
                        put_u16(buf, share.group);
                        with_u16_len(buf, |buf| buf.extend_from_slice(&share.key_exchange));
                    });
                }
                if let Some(identity) = self.psk_identity {
                    put_u16(buf, EXTENSION_PRE_SHARED_KEY);
                    with_u16_len(buf, |buf| put_u16(buf, identity));
                }
                if !self.custom_unencrypted_extension.is_empty() {
                    put_u16(buf, EXTENSION_CUSTOM);
                    with_u16_len(buf, |buf| {
                        buf.extend_from_slice(self.custom_unencrypted_extension.as_bytes())
                    });
                }
                self.extensions.marshal(buf);
            });
            if !self.empty_extensions && buf.len() == mark + 2 {
                buf.truncate(mark);
            }
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_SERVER_HELLO, data) else {
            return false;
        };
        self.unmarshal_body(body)
    }

    fn unmarshal_body(&mut self, body: &[u8]) -> bool {
        let mut r = Reader::new(body);
        let Some(vers) = r.u16() else { return false };
        self.vers = vers;
        let Some(random) = r.bytes(32) else { return false };
        self.random.copy_from_slice(random);
        let Some(session_id) = r.u8_vec() else { return false };
        self.session_id = session_id.to_vec();
        let Some(suite) = r.u16() else { return false };
        self.cipher_suite = suite;
        let Some(compression) = r.u8() else { return false };
        self.compression_method = compression;

        if r.is_empty() {
            return true;
        }
        let Some(mut exts) = r.u16_vec().map(Reader::new) else {
            return false;
        };
        if !r.is_empty() {
            return false;
        }

        while !exts.is_empty() {
            let Some(ext) = exts.u16() else { return false };
            let Some(ext_body) = exts.u16_vec() else { return false };
            let mut er = Reader::new(ext_body);
            let ok = match ext {
                EXTENSION_SUPPORTED_VERSIONS => match er.u16() {
                    Some(v) if er.is_empty() => {
                        self.supported_version = v;
                        true
                    }
                    _ => false,
                },
                EXTENSION_KEY_SHARE => (|| {
                    let group = er.u16()?;
                    let key_exchange = er.u16_vec()?.to_vec();
                    if !er.is_empty() {
                        return None;
                    }
                    self.key_share = Some(KeyShareEntry { group, key_exchange });
                    Some(())
                })()
                .is_some(),
                EXTENSION_PRE_SHARED_KEY => match er.u16() {
                    Some(identity) if er.is_empty() => {
                        self.psk_identity = Some(identity);
                        true
                    }
                    _ => false,
                },
                _ => self.extensions.parse_one(ext, ext_body),
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// HelloRetryRequest: on the wire, a ServerHello carrying the sentinel
/// random.
#[derive(Clone, Default)]
pub struct HelloRetryRequestMsg {
    pub vers: u16,
    pub session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub has_selected_group: bool,
    pub selected_group: u16,
    pub cookie: Vec<u8>,
    pub custom_extension: String,
}

impl HelloRetryRequestMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_SERVER_HELLO, |buf| {
            put_u16(buf, VERSION_TLS12);
            buf.extend_from_slice(&TLS13_HELLO_RETRY_REQUEST_RANDOM);
            with_u8_len(buf, |buf| buf.extend_from_slice(&self.session_id));
            put_u16(buf, self.cipher_suite);
            buf.push(COMPRESSION_NONE);
            with_u16_len(buf, |buf| {
                put_u16(buf, EXTENSION_SUPPORTED_VERSIONS);
                with_u16_len(buf, |buf| put_u16(buf, self.vers));
                if self.has_selected_group {
                    put_u16(buf, EXTENSION_KEY_SHARE);
                    with_u16_len(buf, |buf| put_u16(buf, self.selected_group));
                }
                if !self.cookie.is_empty() {
                    put_u16(buf, EXTENSION_COOKIE);
                    with_u16_len(buf, |buf| {
                        with_u16_len(buf, |buf| buf.extend_from_slice(&self.cookie));
                    });
                }
                if !self.custom_extension.is_empty() {
                    put_u16(buf, EXTENSION_CUSTOM);
                    with_u16_len(buf, |buf| {
                        buf.extend_from_slice(self.custom_extension.as_bytes())
                    });
                }
            });
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_SERVER_HELLO, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        if r.u16().is_none() {
            return false;
        }
        let Some(random) = r.bytes(32) else { return false };
        if random != TLS13_HELLO_RETRY_REQUEST_RANDOM {
            return false;
        }
        let Some(session_id) = r.u8_vec() else { return false };
        self.session_id = session_id.to_vec();
        let Some(suite) = r.u16() else { return false };
        self.cipher_suite = suite;
        if r.u8() != Some(COMPRESSION_NONE) {
            return false;
        }
        let Some(mut exts) = r.u16_vec().map(Reader::new) else {
            return false;
        };
        while !exts.is_empty() {
            let Some(ext) = exts.u16() else { return false };
            let Some(ext_body) = exts.u16_vec() else { return false };
            let mut er = Reader::new(ext_body);
            match ext {
                EXTENSION_SUPPORTED_VERSIONS => match er.u16() {
                    Some(v) => self.vers = v,
                    None => return false,
                },
                EXTENSION_KEY_SHARE => match er.u16() {
                    Some(group) if er.is_empty() => {
                        self.has_selected_group = true;
                        self.selected_group = group;
                    }
                    _ => return false,
                },
                EXTENSION_COOKIE => match er.u16_vec() {
                    Some(cookie) if !cookie.is_empty() => self.cookie = cookie.to_vec(),
                    _ => return false,
                },
                EXTENSION_CUSTOM => {
                    self.custom_extension = String::from_utf8_lossy(ext_body).into_owned();
                }
                _ => {}
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// EncryptedExtensions
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct EncryptedExtensionsMsg {
    pub extensions: ServerExtensions,
    pub empty: bool,
}

impl EncryptedExtensionsMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_ENCRYPTED_EXTENSIONS, |buf| {
            if self.empty {
                return;
            }
            with_u16_len(buf, |buf| self.extensions.marshal(buf));
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_ENCRYPTED_EXTENSIONS, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        let Some(mut exts) = r.u16_vec().map(Reader::new) else {
            return false;
        };
        if !r.is_empty() {
            return false;
        }
        while !exts.is_empty() {
            let Some(ext) = exts.u16() else { return false };
            let Some(ext_body) = exts.u16_vec() else { return false };
            if !self.extensions.parse_one(ext, ext_body) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct CertificateEntry {
    pub data: Vec<u8>,
    pub ocsp_response: Vec<u8>,
    pub sct_list: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct CertificateMsg {
    pub has_request_context: bool,
    pub request_context: Vec<u8>,
    pub certificates: Vec<CertificateEntry>,
    /// Marshal an empty certificate list regardless of contents.
    pub empty_certificate_list: bool,
}

impl CertificateMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_CERTIFICATE, |buf| {
            if self.has_request_context {
                with_u8_len(buf, |buf| buf.extend_from_slice(&self.request_context));
            }
            with_u24_len(buf, |buf| {
                if self.empty_certificate_list {
                    return;
                }
                for cert in &self.certificates {
                    with_u24_len(buf, |buf| buf.extend_from_slice(&cert.data));
                    if self.has_request_context {
                        with_u16_len(buf, |buf| {
                            if !cert.ocsp_response.is_empty() {
                                put_u16(buf, EXTENSION_STATUS_REQUEST);
                                with_u16_len(buf, |buf| {
                                    buf.push(1); // ocsp
                                    with_u24_len(buf, |buf| {
                                        buf.extend_from_slice(&cert.ocsp_response)
                                    });
                                });
                            }
                            if !cert.sct_list.is_empty() {
                                put_u16(buf, EXTENSION_SIGNED_CERTIFICATE_TIMESTAMP);
                                with_u16_len(buf, |buf| {
                                    buf.extend_from_slice(&cert.sct_list)
                                });
                            }
                        });
                    }
                }
            });
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_CERTIFICATE, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        if self.has_request_context {
            let Some(context) = r.u8_vec() else { return false };
            self.request_context = context.to_vec();
        }
        let Some(mut certs) = r.u24_vec().map(Reader::new) else {
            return false;
        };
        if !r.is_empty() {
            return false;
        }
        self.certificates.clear();
        while !certs.is_empty() {
            let Some(cert) = certs.u24_vec() else { return false };
            let mut entry = CertificateEntry {
                data: cert.to_vec(),
                ..Default::default()
            };
            if self.has_request_context {
                let Some(mut exts) = certs.u16_vec().map(Reader::new) else {
                    return false;
                };
                while !exts.is_empty() {
                    let Some(ext) = exts.u16() else { return false };
                    let Some(ext_body) = exts.u16_vec() else { return false };
                    let mut er = Reader::new(ext_body);
                    match ext {
                        EXTENSION_STATUS_REQUEST => {
                            if er.u8() != Some(1) {
                                return false;
                            }
                            let Some(ocsp) = er.u24_vec() else { return false };
                            entry.ocsp_response = ocsp.to_vec();
                        }
                        EXTENSION_SIGNED_CERTIFICATE_TIMESTAMP => {
                            entry.sct_list = ext_body.to_vec();
                        }
                        _ => {}
                    }
                }
            }
            self.certificates.push(entry);
        }
        true
    }
}

#[derive(Clone, Default)]
pub struct CompressedCertificateMsg {
    pub algorithm: u16,
    pub uncompressed_length: u32,
    pub compressed: Vec<u8>,
}

impl CompressedCertificateMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_COMPRESSED_CERTIFICATE, |buf| {
            put_u16(buf, self.algorithm);
            put_u24(buf, self.uncompressed_length as usize);
            with_u24_len(buf, |buf| buf.extend_from_slice(&self.compressed));
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_COMPRESSED_CERTIFICATE, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        let Some(algorithm) = r.u16() else { return false };
        let Some(uncompressed_length) = r.u24() else { return false };
        let Some(compressed) = r.u24_vec() else { return false };
        if !r.is_empty() {
            return false;
        }
        self.algorithm = algorithm;
        self.uncompressed_length = uncompressed_length as u32;
        self.compressed = compressed.to_vec();
        true
    }
}

#[derive(Clone, Default)]
pub struct CertificateRequestMsg {
    pub has_signature_algorithm: bool,
    pub has_request_context: bool,
    pub request_context: Vec<u8>,
    pub certificate_types: Vec<u8>,
    pub signature_algorithms: Vec<u16>,
    pub certificate_authorities: Vec<Vec<u8>>,
}

impl CertificateRequestMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_CERTIFICATE_REQUEST, |buf| {
            if self.has_request_context {
                with_u8_len(buf, |buf| buf.extend_from_slice(&self.request_context));
                with_u16_len(buf, |buf| {
                    if !self.signature_algorithms.is_empty() {
                        put_u16(buf, EXTENSION_SIGNATURE_ALGORITHMS);
                        with_u16_len(buf, |buf| {
                            with_u16_len(buf, |buf| {
                                for &alg in &self.signature_algorithms {
                                    put_u16(buf, alg);
                                }
                            });
                        });
                    }
                });
                return;
            }
            with_u8_len(buf, |buf| buf.extend_from_slice(&self.certificate_types));
            if self.has_signature_algorithm {
                with_u16_len(buf, |buf| {
                    for &alg in &self.signature_algorithms {
                        put_u16(buf, alg);
                    }
                });
            }
            with_u16_len(buf, |buf| {
                for ca in &self.certificate_authorities {
                    with_u16_len(buf, |buf| buf.extend_from_slice(ca));
                }
            });
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_CERTIFICATE_REQUEST, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        if self.has_request_context {
            let Some(context) = r.u8_vec() else { return false };
            self.request_context = context.to_vec();
            let Some(mut exts) = r.u16_vec().map(Reader::new) else {
                return false;
            };
            while !exts.is_empty() {
                let Some(ext) = exts.u16() else { return false };
                let Some(ext_body) = exts.u16_vec() else { return false };
                if ext == EXTENSION_SIGNATURE_ALGORITHMS {
                    let mut er = Reader::new(ext_body);
                    let Some(mut algs) = er.u16_vec().map(Reader::new) else {
                        return false;
                    };
                    self.signature_algorithms.clear();
                    while !algs.is_empty() {
                        let Some(alg) = algs.u16() else { return false };
                        self.signature_algorithms.push(alg);
                    }
                }
            }
            return r.is_empty();
        }

        let Some(types) = r.u8_vec() else { return false };
        self.certificate_types = types.to_vec();
        if self.has_signature_algorithm {
            let Some(mut algs) = r.u16_vec().map(Reader::new) else {
                return false;
            };
            self.signature_algorithms.clear();
            while !algs.is_empty() {
                let Some(alg) = algs.u16() else { return false };
                self.signature_algorithms.push(alg);
            }
        }
        let Some(mut cas) = r.u16_vec().map(Reader::new) else {
            return false;
        };
        self.certificate_authorities.clear();
        while !cas.is_empty() {
            let Some(ca) = cas.u16_vec() else { return false };
            self.certificate_authorities.push(ca.to_vec());
        }
        r.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct CertificateStatusMsg {
    pub response: Vec<u8>,
}

impl CertificateStatusMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_CERTIFICATE_STATUS, |buf| {
            buf.push(1); // ocsp
            with_u24_len(buf, |buf| buf.extend_from_slice(&self.response));
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_CERTIFICATE_STATUS, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        if r.u8() != Some(1) {
            return false;
        }
        let Some(response) = r.u24_vec() else { return false };
        if !r.is_empty() {
            return false;
        }
        self.response = response.to_vec();
        true
    }
}

// ---------------------------------------------------------------------------
// Key exchange and simple messages
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct ServerKeyExchangeMsg {
    pub key: Vec<u8>,
}

impl ServerKeyExchangeMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_SERVER_KEY_EXCHANGE, |buf| {
            buf.extend_from_slice(&self.key)
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_SERVER_KEY_EXCHANGE, data) else {
            return false;
        };
        self.key = body.to_vec();
        true
    }
}

#[derive(Clone, Default)]
pub struct ServerHelloDoneMsg;

impl ServerHelloDoneMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_SERVER_HELLO_DONE, |_| {})
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        matches!(message_body(TYPE_SERVER_HELLO_DONE, data), Some(body) if body.is_empty())
    }
}

#[derive(Clone, Default)]
pub struct ClientKeyExchangeMsg {
    pub ciphertext: Vec<u8>,
}

impl ClientKeyExchangeMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_CLIENT_KEY_EXCHANGE, |buf| {
            buf.extend_from_slice(&self.ciphertext)
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_CLIENT_KEY_EXCHANGE, data) else {
            return false;
        };
        self.ciphertext = body.to_vec();
        true
    }
}

#[derive(Clone, Default)]
pub struct CertificateVerifyMsg {
    pub has_signature_algorithm: bool,
    pub signature_algorithm: u16,
    pub signature: Vec<u8>,
}

impl CertificateVerifyMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_CERTIFICATE_VERIFY, |buf| {
            if self.has_signature_algorithm {
                put_u16(buf, self.signature_algorithm);
            }
            with_u16_len(buf, |buf| buf.extend_from_slice(&self.signature));
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_CERTIFICATE_VERIFY, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        if self.has_signature_algorithm {
            let Some(alg) = r.u16() else { return false };
            self.signature_algorithm = alg;
        }
        let Some(signature) = r.u16_vec() else { return false };
        if !r.is_empty() {
            return false;
        }
        self.signature = signature.to_vec();
        true
    }
}

#[derive(Clone, Default)]
pub struct NextProtocolMsg {
    pub proto: String,
}

impl NextProtocolMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_NEXT_PROTOCOL, |buf| {
            with_u8_len(buf, |buf| buf.extend_from_slice(self.proto.as_bytes()));
            let pad = 32 - (self.proto.len() + 2) % 32;
            with_u8_len(buf, |buf| buf.resize(buf.len() + pad, 0));
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_NEXT_PROTOCOL, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        let Some(proto) = r.u8_vec() else { return false };
        let Some(_padding) = r.u8_vec() else { return false };
        if !r.is_empty() {
            return false;
        }
        self.proto = String::from_utf8_lossy(proto).into_owned();
        true
    }
}

#[derive(Clone, Default)]
pub struct FinishedMsg {
    pub verify_data: Vec<u8>,
}

impl FinishedMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_FINISHED, |buf| {
            buf.extend_from_slice(&self.verify_data)
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_FINISHED, data) else {
            return false;
        };
        self.verify_data = body.to_vec();
        true
    }
}

#[derive(Clone, Default)]
pub struct HelloRequestMsg;

impl HelloRequestMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_HELLO_REQUEST, |_| {})
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        matches!(message_body(TYPE_HELLO_REQUEST, data), Some(body) if body.is_empty())
    }
}

#[derive(Clone, Default)]
pub struct HelloVerifyRequestMsg {
    pub vers: u16,
    pub cookie: Vec<u8>,
}

impl HelloVerifyRequestMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_HELLO_VERIFY_REQUEST, |buf| {
            put_u16(buf, self.vers);
            with_u8_len(buf, |buf| buf.extend_from_slice(&self.cookie));
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_HELLO_VERIFY_REQUEST, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        let Some(vers) = r.u16() else { return false };
        let Some(cookie) = r.u8_vec() else { return false };
        if !r.is_empty() {
            return false;
        }
        self.vers = vers;
        self.cookie = cookie.to_vec();
        true
    }
}

// ---------------------------------------------------------------------------
// Post-handshake messages
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct NewSessionTicketMsg {
    pub vers: u16,
    pub is_dtls: bool,
    pub ticket_lifetime: u32,
    pub ticket_age_add: u32,
    pub ticket_nonce: Vec<u8>,
    pub ticket: Vec<u8>,
    pub max_early_data_size: u32,
    pub custom_extension: String,
    pub duplicate_early_data_extension: bool,
}

impl NewSessionTicketMsg {
    fn is_tls13(&self) -> bool {
        crate::wire_to_version(self.vers, self.is_dtls)
            .map(|v| v >= VERSION_TLS13)
            .unwrap_or(false)
    }

    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_NEW_SESSION_TICKET, |buf| {
            put_u32(buf, self.ticket_lifetime);
            if self.is_tls13() {
                put_u32(buf, self.ticket_age_add);
                with_u8_len(buf, |buf| buf.extend_from_slice(&self.ticket_nonce));
            }
            with_u16_len(buf, |buf| buf.extend_from_slice(&self.ticket));
            if self.is_tls13() {
                with_u16_len(buf, |buf| {
                    let early_data_reps = if self.max_early_data_size > 0 {
                        1 + self.duplicate_early_data_extension as usize
                    } else {
                        0
                    };
                    for _ in 0..early_data_reps {
                        put_u16(buf, EXTENSION_EARLY_DATA);
                        with_u16_len(buf, |buf| put_u32(buf, self.max_early_data_size));
                    }
                    if !self.custom_extension.is_empty() {
                        put_u16(buf, EXTENSION_CUSTOM);
                        with_u16_len(buf, |buf| {
                            buf.extend_from_slice(self.custom_extension.as_bytes())
                        });
                    }
                });
            }
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_NEW_SESSION_TICKET, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        let Some(lifetime) = r.u32() else { return false };
        self.ticket_lifetime = lifetime;
        if self.is_tls13() {
            let Some(age_add) = r.u32() else { return false };
            self.ticket_age_add = age_add;
            let Some(nonce) = r.u8_vec() else { return false };
            self.ticket_nonce = nonce.to_vec();
        }
        let Some(ticket) = r.u16_vec() else { return false };
        self.ticket = ticket.to_vec();
        if self.is_tls13() {
            let Some(mut exts) = r.u16_vec().map(Reader::new) else {
                return false;
            };
            while !exts.is_empty() {
                let Some(ext) = exts.u16() else { return false };
                let Some(ext_body) = exts.u16_vec() else { return false };
                match ext {
                    EXTENSION_EARLY_DATA => {
                        let mut er = Reader::new(ext_body);
                        let Some(size) = er.u32() else { return false };
                        self.max_early_data_size = size;
                    }
                    EXTENSION_CUSTOM => {
                        self.custom_extension = String::from_utf8_lossy(ext_body).into_owned();
                    }
                    _ => {}
                }
            }
        }
        r.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct KeyUpdateMsg {
    pub key_update_request: u8,
}

impl KeyUpdateMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_KEY_UPDATE, |buf| buf.push(self.key_update_request))
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_KEY_UPDATE, data) else {
            return false;
        };
        if body.len() != 1 || body[0] > crate::KEY_UPDATE_REQUESTED {
            return false;
        }
        self.key_update_request = body[0];
        true
    }
}

#[derive(Clone, Default)]
pub struct EndOfEarlyDataMsg {
    pub non_empty: bool,
}

impl EndOfEarlyDataMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_END_OF_EARLY_DATA, |buf| {
            if self.non_empty {
                buf.push(0);
            }
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        matches!(message_body(TYPE_END_OF_EARLY_DATA, data), Some(body) if body.is_empty())
    }
}

#[derive(Clone, Default)]
pub struct ChannelIdMsg {
    pub channel_id: Vec<u8>,
}

impl ChannelIdMsg {
    pub fn marshal(&self) -> Vec<u8> {
        handshake_message(TYPE_CHANNEL_ID, |buf| {
            put_u16(buf, EXTENSION_CHANNEL_ID);
            with_u16_len(buf, |buf| buf.extend_from_slice(&self.channel_id));
        })
    }

    pub fn unmarshal(&mut self, data: &[u8]) -> bool {
        let Some(body) = message_body(TYPE_CHANNEL_ID, data) else {
            return false;
        };
        let mut r = Reader::new(body);
        if r.u16() != Some(EXTENSION_CHANNEL_ID) {
            return false;
        }
        let Some(id) = r.u16_vec() else { return false };
        if !r.is_empty() {
            return false;
        }
        self.channel_id = id.to_vec();
        true
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A parsed handshake message, tagged by kind.
pub enum HandshakeMessage {
    HelloRequest(HelloRequestMsg),
    ClientHello(ClientHelloMsg),
    ServerHello(ServerHelloMsg),
    HelloRetryRequest(HelloRetryRequestMsg),
    HelloVerifyRequest(HelloVerifyRequestMsg),
    NewSessionTicket(NewSessionTicketMsg),
    EncryptedExtensions(EncryptedExtensionsMsg),
    Certificate(CertificateMsg),
    CompressedCertificate(CompressedCertificateMsg),
    CertificateRequest(CertificateRequestMsg),
    CertificateStatus(CertificateStatusMsg),
    ServerKeyExchange(ServerKeyExchangeMsg),
    ServerHelloDone(ServerHelloDoneMsg),
    ClientKeyExchange(ClientKeyExchangeMsg),
    CertificateVerify(CertificateVerifyMsg),
    NextProtocol(NextProtocolMsg),
    Finished(FinishedMsg),
    ChannelId(ChannelIdMsg),
    KeyUpdate(KeyUpdateMsg),
    EndOfEarlyData(EndOfEarlyDataMsg),
}

impl HandshakeMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            HandshakeMessage::HelloRequest(_) => "HelloRequest",
            HandshakeMessage::ClientHello(_) => "ClientHello",
            HandshakeMessage::ServerHello(_) => "ServerHello",
            HandshakeMessage::HelloRetryRequest(_) => "HelloRetryRequest",
            HandshakeMessage::HelloVerifyRequest(_) => "HelloVerifyRequest",
            HandshakeMessage::NewSessionTicket(_) => "NewSessionTicket",
            HandshakeMessage::EncryptedExtensions(_) => "EncryptedExtensions",
            HandshakeMessage::Certificate(_) => "Certificate",
            HandshakeMessage::CompressedCertificate(_) => "CompressedCertificate",
            HandshakeMessage::CertificateRequest(_) => "CertificateRequest",
            HandshakeMessage::CertificateStatus(_) => "CertificateStatus",
            HandshakeMessage::ServerKeyExchange(_) => "ServerKeyExchange",
            HandshakeMessage::ServerHelloDone(_) => "ServerHelloDone",
            HandshakeMessage::ClientKeyExchange(_) => "ClientKeyExchange",
            HandshakeMessage::CertificateVerify(_) => "CertificateVerify",
            HandshakeMessage::NextProtocol(_) => "NextProtocol",
            HandshakeMessage::Finished(_) => "Finished",
            HandshakeMessage::ChannelId(_) => "ChannelID",
            HandshakeMessage::KeyUpdate(_) => "KeyUpdate",
            HandshakeMessage::EndOfEarlyData(_) => "EndOfEarlyData",
        }
    }
}

/// Context the parser needs from the connection.
pub struct ParseContext {
    pub is_dtls: bool,
    pub vers: u16,
    pub wire_vers: u16,
}

/// Parse a raw handshake message by its type tag. A TLS 1.2
/// ServerHello carrying the sentinel random is reinterpreted as a
/// HelloRetryRequest.
pub fn parse_handshake(ctx: &ParseContext, data: &[u8]) -> Option<HandshakeMessage> {
    if data.len() < 4 {
        return None;
    }

    if data[0] == TYPE_SERVER_HELLO
        && data.len() >= 38
        && u16::from_be_bytes([data[4], data[5]]) == VERSION_TLS12
        && data[6..38] == TLS13_HELLO_RETRY_REQUEST_RANDOM
    {
        let mut m = HelloRetryRequestMsg::default();
        if !m.unmarshal(data) {
            return None;
        }
        return Some(HandshakeMessage::HelloRetryRequest(m));
    }

    macro_rules! parse {
        ($variant:ident, $msg:expr) => {{
            let mut m = $msg;
            if !m.unmarshal(data) {
                return None;
            }
            HandshakeMessage::$variant(m)
        }};
    }

    Some(match data[0] {
        TYPE_HELLO_REQUEST => parse!(HelloRequest, HelloRequestMsg),
        TYPE_CLIENT_HELLO => parse!(
            ClientHello,
            ClientHelloMsg {
                is_dtls: ctx.is_dtls,
                ..Default::default()
            }
        ),
        TYPE_SERVER_HELLO => parse!(
            ServerHello,
            ServerHelloMsg {
                is_dtls: ctx.is_dtls,
                ..Default::default()
            }
        ),
        TYPE_HELLO_VERIFY_REQUEST => parse!(HelloVerifyRequest, HelloVerifyRequestMsg::default()),
        TYPE_NEW_SESSION_TICKET => parse!(
            NewSessionTicket,
            NewSessionTicketMsg {
                vers: ctx.wire_vers,
                is_dtls: ctx.is_dtls,
                ..Default::default()
            }
        ),
        TYPE_ENCRYPTED_EXTENSIONS => parse!(EncryptedExtensions, EncryptedExtensionsMsg::default()),
        TYPE_CERTIFICATE => parse!(
            Certificate,
            CertificateMsg {
                has_request_context: ctx.vers >= VERSION_TLS13,
                ..Default::default()
            }
        ),
        TYPE_COMPRESSED_CERTIFICATE => {
            parse!(CompressedCertificate, CompressedCertificateMsg::default())
        }
        TYPE_CERTIFICATE_REQUEST => parse!(
            CertificateRequest,
            CertificateRequestMsg {
                has_signature_algorithm: ctx.vers >= VERSION_TLS12,
                has_request_context: ctx.vers >= VERSION_TLS13,
                ..Default::default()
            }
        ),
        TYPE_CERTIFICATE_STATUS => parse!(CertificateStatus, CertificateStatusMsg::default()),
        TYPE_SERVER_KEY_EXCHANGE => parse!(ServerKeyExchange, ServerKeyExchangeMsg::default()),
        TYPE_SERVER_HELLO_DONE => parse!(ServerHelloDone, ServerHelloDoneMsg),
        TYPE_CLIENT_KEY_EXCHANGE => parse!(ClientKeyExchange, ClientKeyExchangeMsg::default()),
        TYPE_CERTIFICATE_VERIFY => parse!(
            CertificateVerify,
            CertificateVerifyMsg {
                has_signature_algorithm: ctx.vers >= VERSION_TLS12,
                ..Default::default()
            }
        ),
        TYPE_NEXT_PROTOCOL => parse!(NextProtocol, NextProtocolMsg::default()),
        TYPE_FINISHED => parse!(Finished, FinishedMsg::default()),
        TYPE_CHANNEL_ID => parse!(ChannelId, ChannelIdMsg::default()),
        TYPE_KEY_UPDATE => parse!(KeyUpdate, KeyUpdateMsg::default()),
        TYPE_END_OF_EARLY_DATA => parse!(EndOfEarlyData, EndOfEarlyDataMsg::default()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_roundtrip() {
        let mut hello = ClientHelloMsg {
            vers: VERSION_TLS12,
            random: [7u8; 32],
            session_id: vec![1, 2, 3],
            cipher_suites: vec![0x1301, 0x002f],
            compression_methods: vec![0],
            server_name: "peer.test".to_string(),
            supported_curves: vec![29],
            supported_versions: vec![VERSION_TLS13, VERSION_TLS12],
            signature_algorithms: vec![0x0804],
            alpn_protocols: vec!["h2".to_string(), "http/1.1".to_string()],
            extended_master_secret: true,
            ticket_supported: true,
            session_ticket: b"ticket".to_vec(),
            key_shares: vec![KeyShareEntry {
                group: 29,
                key_exchange: vec![0xab; 32],
            }],
            psk_kem_modes: vec![crate::PSK_DHE_KE_MODE],
            secure_renegotiation: Some(vec![]),
            quic_transport_params: vec![9, 9, 9],
            ..Default::default()
        };
        let data = hello.marshal();
        assert_eq!(data[0], TYPE_CLIENT_HELLO);

        let mut parsed = ClientHelloMsg::default();
        assert!(parsed.unmarshal(&data));
        assert_eq!(parsed.vers, VERSION_TLS12);
        assert_eq!(parsed.server_name, "peer.test");
        assert_eq!(parsed.cipher_suites, vec![0x1301, 0x002f]);
        assert_eq!(parsed.supported_versions, vec![VERSION_TLS13, VERSION_TLS12]);
        assert_eq!(parsed.alpn_protocols, vec!["h2", "http/1.1"]);
        assert!(parsed.extended_master_secret);
        assert_eq!(parsed.key_shares.len(), 1);
        assert_eq!(parsed.key_shares[0].key_exchange.len(), 32);
        assert_eq!(parsed.session_ticket, b"ticket");
        assert_eq!(parsed.secure_renegotiation, Some(vec![]));
        assert_eq!(parsed.quic_transport_params, vec![9, 9, 9]);

        // Marshal is stable.
        hello.random = parsed.random;
        assert_eq!(hello.marshal(), parsed.marshal());
    }

    #[test]
    fn test_client_hello_padding() {
        let hello = ClientHelloMsg {
            vers: VERSION_TLS12,
            cipher_suites: vec![0x1301],
            compression_methods: vec![0],
            supported_versions: vec![VERSION_TLS13],
            pad_to: 512,
            ..Default::default()
        };
        let data = hello.marshal();
        assert!(data.len() >= 512);
        let mut parsed = ClientHelloMsg::default();
        assert!(parsed.unmarshal(&data));
    }

    #[test]
    fn test_client_hello_truncated_rejected() {
        let hello = ClientHelloMsg {
            vers: VERSION_TLS12,
            cipher_suites: vec![0x1301],
            compression_methods: vec![0],
            ..Default::default()
        };
        let mut data = hello.marshal();
        data.pop();
        let mut parsed = ClientHelloMsg::default();
        assert!(!parsed.unmarshal(&data));
    }

    #[test]
    fn test_server_hello_tls13_roundtrip() {
        let hello = ServerHelloMsg {
            vers: VERSION_TLS12,
            random: [9u8; 32],
            session_id: vec![0x55; 32],
            cipher_suite: 0x1301,
            compression_method: 0,
            supported_version: VERSION_TLS13,
            key_share: Some(KeyShareEntry {
                group: 29,
                key_exchange: vec![0xcd; 32],
            }),
            ..Default::default()
        };
        let data = hello.marshal();
        let mut parsed = ServerHelloMsg::default();
        assert!(parsed.unmarshal(&data));
        assert!(parsed.is_tls13());
        assert_eq!(parsed.key_share.as_ref().unwrap().group, 29);
        assert_eq!(parsed.cipher_suite, 0x1301);
    }

    #[test]
    fn test_hello_retry_request_detection() {
        let hrr = HelloRetryRequestMsg {
            vers: VERSION_TLS13,
            session_id: vec![1; 8],
            cipher_suite: 0x1301,
            has_selected_group: true,
            selected_group: 29,
            ..Default::default()
        };
        let data = hrr.marshal();
        let ctx = ParseContext {
            is_dtls: false,
            vers: VERSION_TLS13,
            wire_vers: VERSION_TLS13,
        };
        match parse_handshake(&ctx, &data) {
            Some(HandshakeMessage::HelloRetryRequest(parsed)) => {
                assert!(parsed.has_selected_group);
                assert_eq!(parsed.selected_group, 29);
                assert_eq!(parsed.vers, VERSION_TLS13);
            }
            other => panic!(
                "expected HelloRetryRequest, got {:?}",
                other.map(|m| m.type_name())
            ),
        }
    }

    #[test]
    fn test_new_session_ticket_tls13_roundtrip() {
        let ticket = NewSessionTicketMsg {
            vers: VERSION_TLS13,
            ticket_lifetime: 86400,
            ticket_age_add: 0x11223344,
            ticket_nonce: vec![0, 1],
            ticket: vec![0xaa; 64],
            max_early_data_size: 16384,
            ..Default::default()
        };
        let data = ticket.marshal();
        let mut parsed = NewSessionTicketMsg {
            vers: VERSION_TLS13,
            ..Default::default()
        };
        assert!(parsed.unmarshal(&data));
        assert_eq!(parsed.ticket_age_add, 0x11223344);
        assert_eq!(parsed.max_early_data_size, 16384);
        assert_eq!(parsed.ticket.len(), 64);
    }

    #[test]
    fn test_new_session_ticket_tls12_roundtrip() {
        let ticket = NewSessionTicketMsg {
            vers: VERSION_TLS12,
            ticket_lifetime: 7200,
            ticket: vec![0xbb; 32],
            ..Default::default()
        };
        let data = ticket.marshal();
        let mut parsed = NewSessionTicketMsg {
            vers: VERSION_TLS12,
            ..Default::default()
        };
        assert!(parsed.unmarshal(&data));
        assert_eq!(parsed.ticket_lifetime, 7200);
        assert_eq!(parsed.ticket.len(), 32);
    }

    #[test]
    fn test_key_update_validation() {
        let mut parsed = KeyUpdateMsg::default();
        let good = KeyUpdateMsg {
            key_update_request: crate::KEY_UPDATE_REQUESTED,
        }
        .marshal();
        assert!(parsed.unmarshal(&good));

        let mut bad = good.clone();
        bad[4] = 2;
        assert!(!parsed.unmarshal(&bad));
    }

    #[test]
    fn test_certificate_tls13_roundtrip() {
        let msg = CertificateMsg {
            has_request_context: true,
            certificates: vec![CertificateEntry {
                data: vec![0x30, 0x82, 0x01, 0x02],
                ocsp_response: b"ocsp".to_vec(),
                sct_list: vec![],
            }],
            ..Default::default()
        };
        let data = msg.marshal();
        let mut parsed = CertificateMsg {
            has_request_context: true,
            ..Default::default()
        };
        assert!(parsed.unmarshal(&data));
        assert_eq!(parsed.certificates.len(), 1);
        assert_eq!(parsed.certificates[0].ocsp_response, b"ocsp");
    }

    #[test]
    fn test_finished_and_simple_messages() {
        let fin = FinishedMsg {
            verify_data: vec![1; 12],
        };
        let mut parsed = FinishedMsg::default();
        assert!(parsed.unmarshal(&fin.marshal()));
        assert_eq!(parsed.verify_data, vec![1; 12]);

        let mut done = ServerHelloDoneMsg;
        assert!(done.unmarshal(&ServerHelloDoneMsg.marshal()));

        let mut hr = HelloRequestMsg;
        assert!(hr.unmarshal(&HelloRequestMsg.marshal()));

        let hvr = HelloVerifyRequestMsg {
            vers: crate::VERSION_DTLS12,
            cookie: vec![0xcc; 20],
        };
        let mut parsed = HelloVerifyRequestMsg::default();
        assert!(parsed.unmarshal(&hvr.marshal()));
        assert_eq!(parsed.cookie.len(), 20);
    }

    #[test]
    fn test_wrong_type_tag_rejected() {
        let fin = FinishedMsg {
            verify_data: vec![1; 12],
        };
        let mut data = fin.marshal();
        data[0] = TYPE_SERVER_HELLO_DONE;
        let mut parsed = FinishedMsg::default();
        assert!(!parsed.unmarshal(&data));
    }
}
