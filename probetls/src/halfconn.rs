//! One direction of a connection: cipher state, sequence number and
//! DTLS epoch, and the in-place record seal/open primitives.
//!
//! The sequence number is eight bytes; under DTLS the top two bytes
//! are the epoch. Sequence wraparound within an epoch is a hard
//! failure, never a silent wrap.

use std::sync::Arc;

use probecrypto::constant_time::ct_eq;

use crate::alert::{Alert, ALERT_BAD_RECORD_MAC, ALERT_INTERNAL_ERROR, ALERT_UNEXPECTED_MESSAGE};
use crate::buffer::{Block, BlockPool};
use crate::cipher::{new_cipher_state, CipherState, CipherSuite, TlsMac};
use crate::config::Config;
use crate::error::{Error, TlsResult};
use crate::prf::traffic_keys;
use crate::{
    wire_to_version, DTLS_RECORD_HEADER_LEN, TLS_RECORD_HEADER_LEN, VERSION_TLS11, VERSION_TLS13,
};

/// Key material direction, for picking key-block halves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum TrafficDirection {
    ClientWrite,
    ServerWrite,
}

/// Per-direction record state.
pub struct HalfConn {
    pub is_dtls: bool,
    /// First permanent error; latched.
    pub err: Option<Error>,

    /// Negotiated protocol version of this direction's cipher.
    pub version: u16,
    pub wire_version: u16,

    pub cipher: CipherState,
    pub mac: Option<TlsMac>,
    /// 64-bit sequence number; under DTLS the high 16 bits are the
    /// epoch.
    pub seq: [u8; 8],
    /// Mapped outgoing sequence number (SequenceNumberMapping).
    pub out_seq: [u8; 8],

    /// Cipher prepared by prepare_cipher_spec, installed by
    /// change_cipher_spec.
    pub next_cipher: Option<CipherState>,
    pub next_mac: Option<TlsMac>,
    /// DTLS: the next epoch's starting sequence number.
    pub next_seq: [u8; 6],

    /// TLS 1.3 traffic secret for this direction.
    pub traffic_secret: Vec<u8>,

    pub config: Arc<Config>,
    pub pool: BlockPool,
}

impl HalfConn {
    pub fn new(is_dtls: bool, config: Arc<Config>) -> HalfConn {
        let mut hc = HalfConn {
            is_dtls,
            err: None,
            version: 0,
            wire_version: 0,
            cipher: CipherState::None,
            mac: None,
            seq: [0; 8],
            out_seq: [0; 8],
            next_cipher: None,
            next_mac: None,
            next_seq: [0; 6],
            traffic_secret: Vec::new(),
            config,
            pool: BlockPool::default(),
        };
        hc.update_out_seq();
        hc
    }

    /// Record and return a permanent error for this direction.
    pub fn set_error(&mut self, err: Error) -> Error {
        if self.err.is_none() {
            self.err = Some(err.clone());
        }
        err
    }

    pub fn record_header_len(&self) -> usize {
        if self.is_dtls {
            DTLS_RECORD_HEADER_LEN
        } else {
            TLS_RECORD_HEADER_LEN
        }
    }

    /// Stage the cipher state a later change_cipher_spec installs.
    pub fn prepare_cipher_spec(&mut self, wire_version: u16, cipher: CipherState, mac: Option<TlsMac>) {
        self.wire_version = wire_version;
        self.version = wire_to_version(wire_version, self.is_dtls).expect("unknown version");
        self.next_cipher = Some(cipher);
        self.next_mac = mac;
    }

    /// Atomically install the pending cipher and bump the epoch.
    pub fn change_cipher_spec(&mut self) -> Result<(), Alert> {
        let cipher = self.next_cipher.take().ok_or(ALERT_INTERNAL_ERROR)?;
        self.cipher = cipher;
        self.mac = self.next_mac.take();
        self.inc_epoch();

        if self.config.bugs.null_all_ciphers {
            self.cipher = CipherState::Null;
            self.mac = None;
        }
        Ok(())
    }

    /// Install a TLS 1.3 traffic secret as the active cipher.
    pub fn use_traffic_secret(
        &mut self,
        wire_version: u16,
        suite: &CipherSuite,
        secret: &[u8],
        _side: TrafficDirection,
    ) {
        self.wire_version = wire_version;
        self.version = wire_to_version(wire_version, self.is_dtls).expect("unknown version");
        let (key, iv) = traffic_keys(suite, secret);
        self.cipher = new_cipher_state(suite, &key, &iv);
        if self.config.bugs.null_all_ciphers {
            self.cipher = CipherState::Null;
        }
        self.mac = None;
        self.traffic_secret = secret.to_vec();
        self.inc_epoch();
    }

    /// Drop back to cleartext while still bumping the epoch; used to
    /// resend an unencrypted ClientHello after 0-RTT rejection.
    pub fn reset_cipher(&mut self) {
        self.cipher = CipherState::None;
        self.mac = None;
        self.inc_epoch();
    }

    /// Advance the sequence number. Wraparound within an epoch is
    /// fatal by design of the test harness.
    pub fn inc_seq(&mut self) {
        let limit = if self.is_dtls { 2 } else { 0 };
        let mut increment = 1u64;
        for i in (limit..8).rev() {
            increment += self.seq[i] as u64;
            self.seq[i] = increment as u8;
            increment >>= 8;
        }
        if increment != 0 {
            panic!("TLS: sequence number wraparound");
        }
        self.update_out_seq();
    }

    /// Advance the pending next-epoch sequence (DTLS).
    pub fn inc_next_seq(&mut self) {
        for i in (0..self.next_seq.len()).rev() {
            self.next_seq[i] = self.next_seq[i].wrapping_add(1);
            if self.next_seq[i] != 0 {
                return;
            }
        }
        panic!("TLS: sequence number wraparound");
    }

    /// Bump the epoch: DTLS increments the epoch word and loads the
    /// pending starting sequence; TLS resets the sequence outright.
    pub fn inc_epoch(&mut self) {
        if self.is_dtls {
            for i in (0..2).rev() {
                self.seq[i] = self.seq[i].wrapping_add(1);
                if self.seq[i] != 0 {
                    break;
                }
                if i == 0 {
                    panic!("TLS: epoch number wraparound");
                }
            }
            self.seq[2..].copy_from_slice(&self.next_seq);
            self.next_seq = [0; 6];
        } else {
            self.seq = [0; 8];
        }
        self.update_out_seq();
    }

    /// Refresh the mapped outgoing sequence number.
    pub fn update_out_seq(&mut self) {
        if let Some(mapping) = self.config.bugs.sequence_number_mapping {
            let mapped = mapping(u64::from_be_bytes(self.seq));
            self.out_seq = mapped.to_be_bytes();
            // The epoch bytes are never mapped.
            self.out_seq[..2].copy_from_slice(&self.seq[..2]);
            return;
        }
        self.out_seq = self.seq;
    }

    pub fn epoch(&self) -> u16 {
        u16::from_be_bytes([self.seq[0], self.seq[1]])
    }

    /// Open a record in place. `b` contains the record header and
    /// payload. On success returns the payload prefix length to skip
    /// and the decrypted inner content type (TLS 1.3).
    pub fn decrypt(&mut self, b: &mut Block) -> Result<(usize, u8), Alert> {
        let header_len = self.record_header_len();
        let mut prefix_consumed = 0usize;

        let mut mac_size = 0;
        if let Some(mac) = &self.mac {
            mac_size = mac.size();
        }

        let mut padding_good = 0xffu8;
        let mut explicit_iv_len = 0usize;
        let mut content_type = 0u8;

        // Under DTLS the sequence used for the MAC and AEAD is the one
        // on the wire.
        let seq: [u8; 8] = if self.is_dtls {
            b.data[3..11].try_into().unwrap()
        } else {
            self.seq
        };

        match &mut self.cipher {
            CipherState::None | CipherState::Null => {}
            CipherState::Stream(rc4) => {
                rc4.apply_keystream(&mut b.data[header_len..]);
            }
            CipherState::Aead {
                aead,
                fixed_nonce,
                explicit_nonce,
            } => {
                let mut payload_start = header_len;
                let nonce_input: Vec<u8> = if *explicit_nonce {
                    explicit_iv_len = 8;
                    if b.data.len() - header_len < explicit_iv_len {
                        return Err(ALERT_BAD_RECORD_MAC);
                    }
                    payload_start += 8;
                    b.data[header_len..header_len + 8].to_vec()
                } else {
                    seq.to_vec()
                };
                let nonce = CipherState::aead_nonce(fixed_nonce, *explicit_nonce, &nonce_input);

                let additional_data = if self.version < VERSION_TLS13 {
                    let mut ad = Vec::with_capacity(13);
                    ad.extend_from_slice(&seq);
                    ad.extend_from_slice(&b.data[..3]);
                    let n = (b.data.len() - payload_start).saturating_sub(aead.overhead());
                    ad.extend_from_slice(&(n as u16).to_be_bytes());
                    ad
                } else {
                    b.data[..header_len].to_vec()
                };

                let plaintext = aead
                    .open(&nonce, &additional_data, &b.data[payload_start..])
                    .ok_or(ALERT_BAD_RECORD_MAC)?;
                b.data.truncate(payload_start);
                b.data.extend_from_slice(&plaintext);
            }
            CipherState::Cbc(cbc) => {
                let block_size = cbc.block_size();
                if self.version >= VERSION_TLS11 || self.is_dtls {
                    explicit_iv_len = block_size;
                }

                let payload_len = b.data.len() - header_len;
                let min_len = round_up(explicit_iv_len + mac_size + 1, block_size);
                if payload_len % block_size != 0 || payload_len < min_len {
                    return Err(ALERT_BAD_RECORD_MAC);
                }

                let mut payload_start = header_len;
                if explicit_iv_len > 0 {
                    cbc.set_iv(&b.data[header_len..header_len + explicit_iv_len]);
                    payload_start += explicit_iv_len;
                }
                cbc.decrypt_blocks(&mut b.data[payload_start..]);

                let (new_len, good) = if self.version == crate::VERSION_SSL30 {
                    remove_padding_ssl30(&b.data[payload_start..])
                } else {
                    remove_padding(&b.data[payload_start..])
                };
                padding_good = good;
                b.data.truncate(payload_start + new_len);
            }
        }

        if !self.cipher.is_none() && self.version >= VERSION_TLS13 {
            // Strip record padding; the final nonzero byte is the
            // inner content type.
            let mut end = b.data.len();
            while end > header_len && b.data[end - 1] == 0 {
                end -= 1;
            }
            if end == header_len {
                return Err(ALERT_UNEXPECTED_MESSAGE);
            }
            content_type = b.data[end - 1];
            b.data.truncate(end - 1);
        }

        if let Some(mac) = &self.mac {
            let payload_len = b.data.len() - header_len - explicit_iv_len;
            if payload_len < mac_size {
                return Err(ALERT_BAD_RECORD_MAC);
            }
            let n = payload_len - mac_size;

            // Rewrite the length field to cover the plaintext alone,
            // as the MAC pseudo-header requires.
            b.data[header_len - 2] = (n >> 8) as u8;
            b.data[header_len - 1] = n as u8;

            let data_start = header_len + explicit_iv_len;
            let remote_mac = b.data[data_start + n..data_start + n + mac_size].to_vec();
            let local_mac = mac.mac(&seq, &b.data[..3], n as u16, &b.data[data_start..data_start + n]);

            if !ct_eq(&local_mac, &remote_mac) || padding_good != 0xff {
                return Err(ALERT_BAD_RECORD_MAC);
            }
            b.data.truncate(data_start + n);
        } else if padding_good != 0xff {
            return Err(ALERT_BAD_RECORD_MAC);
        }

        self.inc_seq();
        prefix_consumed += header_len + explicit_iv_len;
        Ok((prefix_consumed, content_type))
    }

    /// Seal a record in place. `b` holds the header, any explicit IV
    /// bytes, and the plaintext; the length field is rewritten to the
    /// sealed length.
    pub fn encrypt(&mut self, b: &mut Block, explicit_iv_len: usize, typ: u8) -> TlsResult<()> {
        let header_len = self.record_header_len();

        if let Some(mac) = &self.mac {
            let payload_len = b.data.len() - header_len - explicit_iv_len;
            let mac_bytes = mac.mac(
                &self.out_seq,
                &b.data[..3],
                payload_len as u16,
                &b.data[header_len + explicit_iv_len..],
            );
            b.data.extend_from_slice(&mac_bytes);
        }

        // TLS 1.3 hides the content type inside the ciphertext and may
        // pad with zeros.
        if !self.cipher.is_none() && self.version >= VERSION_TLS13 {
            let padding = self.config.bugs.record_padding;
            if self.config.bugs.omit_record_contents {
                b.data.truncate(header_len);
            } else {
                b.data.push(typ);
            }
            b.data.resize(b.data.len() + padding, 0);
        }

        match &mut self.cipher {
            CipherState::None | CipherState::Null => {}
            CipherState::Stream(rc4) => {
                rc4.apply_keystream(&mut b.data[header_len..]);
            }
            CipherState::Aead {
                aead,
                fixed_nonce,
                explicit_nonce,
            } => {
                let nonce_input: Vec<u8> = if *explicit_nonce {
                    b.data[header_len..header_len + explicit_iv_len].to_vec()
                } else {
                    self.out_seq.to_vec()
                };
                let nonce = CipherState::aead_nonce(fixed_nonce, *explicit_nonce, &nonce_input);

                let payload_len = b.data.len() - header_len - explicit_iv_len;
                let additional_data = if self.version < VERSION_TLS13 {
                    let mut ad = Vec::with_capacity(13);
                    ad.extend_from_slice(&self.out_seq);
                    ad.extend_from_slice(&b.data[..3]);
                    ad.extend_from_slice(&(payload_len as u16).to_be_bytes());
                    ad
                } else {
                    let mut ad = Vec::with_capacity(5);
                    ad.extend_from_slice(&b.data[..3]);
                    let sealed_len = payload_len + aead.overhead();
                    ad.extend_from_slice(&(sealed_len as u16).to_be_bytes());
                    ad
                };

                let sealed = aead.seal(&nonce, &additional_data, &b.data[header_len + explicit_iv_len..]);
                b.data.truncate(header_len + explicit_iv_len);
                b.data.extend_from_slice(&sealed);
            }
            CipherState::Cbc(cbc) => {
                if explicit_iv_len > 0 {
                    cbc.set_iv(&b.data[header_len..header_len + explicit_iv_len]);
                }
                let payload_start = header_len + explicit_iv_len;
                let payload = b.data[payload_start..].to_vec();
                let (prefix, final_block) = pad_to_block_size(&payload, cbc.block_size(), &self.config);
                b.data.truncate(payload_start);
                b.data.extend_from_slice(&prefix);
                b.data.extend_from_slice(&final_block);
                cbc.encrypt_blocks(&mut b.data[payload_start..]);
            }
        }

        let n = b.data.len() - header_len;
        b.data[header_len - 2] = (n >> 8) as u8;
        b.data[header_len - 1] = n as u8;
        self.inc_seq();
        Ok(())
    }
}

fn round_up(a: usize, b: usize) -> usize {
    a + (b - a % b) % b
}

/// Strip TLS CBC padding in constant time. Returns the new payload
/// length and 0xff iff the padding was well formed (RFC 2246 §6.2.3.2).
pub fn remove_padding(payload: &[u8]) -> (usize, u8) {
    if payload.is_empty() {
        return (payload.len(), 0);
    }

    let padding_len = payload[payload.len() - 1];
    let t = (payload.len() as u64 - 1).wrapping_sub(padding_len as u64);
    // 0xff if padding_len fits within the payload.
    let mut good = ((!t as i64) >> 63) as u8;

    // Check at most 255 trailing bytes, each under a mask that is live
    // only for indices below padding_len.
    let to_check = 255usize.min(payload.len() - 1);
    for i in 0..to_check {
        let t = (padding_len as u64).wrapping_sub(i as u64);
        let mask = ((!t as i64) >> 63) as u8;
        let b = payload[payload.len() - 1 - i];
        good &= !((mask & padding_len) ^ (mask & b));
    }

    // Collapse to all-or-nothing.
    good &= good << 4;
    good &= good << 2;
    good &= good << 1;
    good = ((good as i8) >> 7) as u8;

    let to_remove = (good & padding_len) as usize + 1;
    (payload.len() - to_remove, good)
}

/// SSL 3.0 CBC padding: contents are random; only the length is
/// checked.
pub fn remove_padding_ssl30(payload: &[u8]) -> (usize, u8) {
    if payload.is_empty() {
        return (payload.len(), 0);
    }
    let padding_len = payload[payload.len() - 1] as usize + 1;
    if padding_len > payload.len() {
        return (payload.len(), 0);
    }
    (payload.len() - padding_len, 0xff)
}

/// CBC-pad `payload` for encryption, honoring the MaxPadding and
/// PaddingFirstByteBad knobs. Returns the whole-block prefix and the
/// padded final block(s).
pub fn pad_to_block_size(payload: &[u8], block_size: usize, config: &Config) -> (Vec<u8>, Vec<u8>) {
    let overrun = payload.len() % block_size;
    let prefix = payload[..payload.len() - overrun].to_vec();

    let mut padding_len = block_size - overrun;
    let mut final_size = block_size;
    if config.bugs.max_padding {
        while padding_len + block_size <= 256 {
            padding_len += block_size;
        }
        final_size = 256;
    }

    let mut final_block = vec![(padding_len - 1) as u8; final_size];
    if config.bugs.padding_first_byte_bad
        || (config.bugs.padding_first_byte_bad_if255 && padding_len == 256)
    {
        final_block[overrun] ^= 0xff;
    }
    final_block[..overrun].copy_from_slice(&payload[payload.len() - overrun..]);
    (prefix, final_block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{cipher_suite_by_id, mac_alg_for_suite, TLS_AES_128_GCM_SHA256, TLS_RSA_WITH_AES_128_CBC_SHA, TLS_RSA_WITH_RC4_128_SHA};
    use crate::{RECORD_TYPE_APPLICATION_DATA as APPDATA, VERSION_TLS12};

    fn test_config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    fn make_record(header_len: usize, explicit_iv: usize, payload: &[u8]) -> Block {
        let mut b = Block::new();
        b.resize(header_len + explicit_iv + payload.len());
        b.data[0] = APPDATA;
        b.data[1] = 0x03;
        b.data[2] = 0x03;
        let n = explicit_iv + payload.len();
        b.data[3] = (n >> 8) as u8;
        b.data[4] = n as u8;
        b.data[header_len + explicit_iv..].copy_from_slice(payload);
        b
    }

    fn paired_halves(suite_id: u16, version: u16) -> (HalfConn, HalfConn) {
        let suite = cipher_suite_by_id(suite_id).unwrap();
        let config = test_config();
        let mut out = HalfConn::new(false, config.clone());
        let mut inp = HalfConn::new(false, config);

        let key = vec![0x11u8; suite.key_len];
        let iv = vec![0x22u8; suite.iv_len];
        let mac_key = vec![0x33u8; suite.mac_len];

        let mac = if suite.mac_len > 0 {
            Some(TlsMac::new(mac_alg_for_suite(suite), &mac_key))
        } else {
            None
        };
        let mac2 = if suite.mac_len > 0 {
            Some(TlsMac::new(mac_alg_for_suite(suite), &mac_key))
        } else {
            None
        };

        let wire = if version >= VERSION_TLS13 { VERSION_TLS13 } else { version };
        out.prepare_cipher_spec(wire, new_cipher_state(suite, &key, &iv), mac);
        out.change_cipher_spec().unwrap();
        inp.prepare_cipher_spec(wire, new_cipher_state(suite, &key, &iv), mac2);
        inp.change_cipher_spec().unwrap();
        (out, inp)
    }

    fn roundtrip(suite_id: u16, version: u16, explicit_iv: usize, payload: &[u8]) {
        let (mut out, mut inp) = paired_halves(suite_id, version);
        let mut b = make_record(5, explicit_iv, payload);
        // Fill the explicit IV deterministically.
        for (i, v) in b.data[5..5 + explicit_iv].iter_mut().enumerate() {
            *v = i as u8;
        }
        out.encrypt(&mut b, explicit_iv, APPDATA).unwrap();

        let (prefix, ct) = inp.decrypt(&mut b).unwrap();
        if version >= VERSION_TLS13 {
            assert_eq!(ct, APPDATA);
        }
        assert_eq!(&b.data[prefix..], payload);
        assert_eq!(out.seq[7], 1);
        assert_eq!(inp.seq[7], 1);
    }

    #[test]
    fn test_round_trip_gcm_tls13() {
        roundtrip(TLS_AES_128_GCM_SHA256, VERSION_TLS13, 0, b"hello record");
        roundtrip(TLS_AES_128_GCM_SHA256, VERSION_TLS13, 0, b"");
        roundtrip(TLS_AES_128_GCM_SHA256, VERSION_TLS13, 0, &[0x3cu8; 16384]);
    }

    #[test]
    fn test_round_trip_cbc_tls12() {
        roundtrip(TLS_RSA_WITH_AES_128_CBC_SHA, VERSION_TLS12, 16, b"cbc payload");
        roundtrip(TLS_RSA_WITH_AES_128_CBC_SHA, VERSION_TLS12, 16, &[0u8; 1000]);
    }

    #[test]
    fn test_round_trip_rc4_tls12() {
        roundtrip(TLS_RSA_WITH_RC4_128_SHA, VERSION_TLS12, 0, b"stream bytes");
    }

    #[test]
    fn test_cbc_bad_mac_rejected() {
        let (mut out, mut inp) = paired_halves(TLS_RSA_WITH_AES_128_CBC_SHA, VERSION_TLS12);
        let mut b = make_record(5, 16, b"payload");
        out.encrypt(&mut b, 16, APPDATA).unwrap();
        let last = b.data.len() - 1;
        b.data[last] ^= 1;
        assert_eq!(inp.decrypt(&mut b), Err(ALERT_BAD_RECORD_MAC));
    }

    #[test]
    fn test_tls13_all_zero_record_rejected() {
        let (mut out, mut inp) = paired_halves(TLS_AES_128_GCM_SHA256, VERSION_TLS13);
        // Sealing an empty record with contents omitted produces only
        // padding; the receiver must reject it as unexpected_message.
        let config = Arc::new(Config {
            bugs: crate::config::ProtocolBugs {
                omit_record_contents: true,
                record_padding: 3,
                ..Default::default()
            },
            ..Default::default()
        });
        out.config = config;
        let mut b = make_record(5, 0, b"");
        out.encrypt(&mut b, 0, APPDATA).unwrap();
        assert_eq!(inp.decrypt(&mut b), Err(ALERT_UNEXPECTED_MESSAGE));
    }

    #[test]
    fn test_tls13_padding_stripped() {
        let (mut out, mut inp) = paired_halves(TLS_AES_128_GCM_SHA256, VERSION_TLS13);
        let config = Arc::new(Config {
            bugs: crate::config::ProtocolBugs {
                record_padding: 17,
                ..Default::default()
            },
            ..Default::default()
        });
        out.config = config;
        let mut b = make_record(5, 0, b"padded");
        out.encrypt(&mut b, 0, APPDATA).unwrap();
        let (prefix, ct) = inp.decrypt(&mut b).unwrap();
        assert_eq!(ct, APPDATA);
        assert_eq!(&b.data[prefix..], b"padded");
    }

    #[test]
    fn test_epoch_and_seq_layout_dtls() {
        let mut hc = HalfConn::new(true, test_config());
        hc.inc_seq();
        hc.inc_seq();
        assert_eq!(hc.seq[7], 2);
        assert_eq!(hc.epoch(), 0);

        hc.next_seq = [0, 0, 0, 0, 0, 9];
        hc.inc_epoch();
        assert_eq!(hc.epoch(), 1);
        assert_eq!(hc.seq[2..], [0, 0, 0, 0, 0, 9]);
        assert_eq!(hc.next_seq, [0; 6]);
    }

    #[test]
    #[should_panic(expected = "sequence number wraparound")]
    fn test_seq_wraparound_is_fatal() {
        let mut hc = HalfConn::new(false, test_config());
        hc.seq = [0xff; 8];
        hc.inc_seq();
    }

    #[test]
    #[should_panic(expected = "sequence number wraparound")]
    fn test_dtls_seq_wraparound_is_fatal() {
        let mut hc = HalfConn::new(true, test_config());
        hc.seq = [0, 0, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff];
        hc.inc_seq();
    }

    #[test]
    fn test_sequence_mapping_skips_epoch() {
        let config = Arc::new(Config {
            bugs: crate::config::ProtocolBugs {
                sequence_number_mapping: Some(|x| x + 10),
                ..Default::default()
            },
            ..Default::default()
        });
        let mut hc = HalfConn::new(true, config);
        hc.seq = [0, 1, 0, 0, 0, 0, 0, 5];
        hc.update_out_seq();
        assert_eq!(hc.out_seq[..2], [0, 1]);
        assert_eq!(hc.out_seq[7], 15);
    }

    #[test]
    fn test_remove_padding() {
        // Valid padding: three bytes of 0x02.
        let payload = [b'a', b'b', 2, 2, 2];
        let (n, good) = remove_padding(&payload);
        assert_eq!(good, 0xff);
        assert_eq!(n, 2);

        // Corrupt padding byte.
        let payload = [b'a', b'b', 1, 2, 2];
        let (n, good) = remove_padding(&payload);
        assert_eq!(good, 0);
        assert_eq!(n, 4);

        // Padding length exceeding the payload.
        let payload = [9u8, 9];
        let (_, good) = remove_padding(&payload);
        assert_eq!(good, 0);
    }

    #[test]
    fn test_remove_padding_ssl30_ignores_contents() {
        let payload = [b'x', 0xaa, 0xbb, 2];
        let (n, good) = remove_padding_ssl30(&payload);
        assert_eq!(good, 0xff);
        assert_eq!(n, 1);
    }

    #[test]
    fn test_max_padding_knob() {
        let config = Config {
            bugs: crate::config::ProtocolBugs {
                max_padding: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let (prefix, final_block) = pad_to_block_size(b"abc", 16, &config);
        assert!(prefix.is_empty());
        assert_eq!(final_block.len(), 256);
        assert_eq!(final_block[255], (256 - 3 - 1) as u8 - 0); // 252
        assert_eq!(&final_block[..3], b"abc");
    }

    #[test]
    fn test_reset_cipher_returns_to_cleartext() {
        let (mut out, _) = paired_halves(TLS_AES_128_GCM_SHA256, VERSION_TLS13);
        assert!(!out.cipher.is_none());
        out.reset_cipher();
        assert!(out.cipher.is_none());
    }
}
