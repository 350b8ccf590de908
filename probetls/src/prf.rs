//! Key derivation: the TLS 1.0 and 1.2 PRFs, the TLS 1.3 HKDF
//! schedule, key-block expansion, and the running handshake transcript
//! hash.

use probecrypto::hkdf;
use probecrypto::hmac::{hmac, Hasher, Hmac, MacHash};

use crate::cipher::CipherSuite;
use crate::{VERSION_TLS12, VERSION_TLS13};

pub const MASTER_SECRET_LEN: usize = 48;
pub const FINISHED_VERIFY_LEN: usize = 12;

pub const MASTER_SECRET_LABEL: &[u8] = b"master secret";
pub const EXTENDED_MASTER_SECRET_LABEL: &[u8] = b"extended master secret";
pub const KEY_EXPANSION_LABEL: &[u8] = b"key expansion";
pub const CLIENT_FINISHED_LABEL: &[u8] = b"client finished";
pub const SERVER_FINISHED_LABEL: &[u8] = b"server finished";

/// P_hash (RFC 5246 §5).
fn p_hash(alg: MacHash, result: &mut [u8], secret: &[u8], seed: &[u8]) {
    let mut a = hmac(alg, secret, seed);
    let mut j = 0;
    while j < result.len() {
        let mut h = Hmac::new(alg, secret);
        h.update(&a);
        h.update(seed);
        let b = h.finalize();
        let n = b.len().min(result.len() - j);
        result[j..j + n].copy_from_slice(&b[..n]);
        j += n;
        a = hmac(alg, secret, &a);
    }
}

/// The TLS 1.0/1.1 PRF: P_MD5 ⊕ P_SHA1 over split secret halves.
pub fn prf10(result: &mut [u8], secret: &[u8], label: &[u8], seed: &[u8]) {
    let mut label_and_seed = Vec::with_capacity(label.len() + seed.len());
    label_and_seed.extend_from_slice(label);
    label_and_seed.extend_from_slice(seed);

    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    p_hash(MacHash::Md5, result, s1, &label_and_seed);
    let mut result2 = vec![0u8; result.len()];
    p_hash(MacHash::Sha1, &mut result2, s2, &label_and_seed);
    for (r, b) in result.iter_mut().zip(result2.iter()) {
        *r ^= b;
    }
}

/// The TLS 1.2 PRF over the suite hash.
pub fn prf12(alg: MacHash, result: &mut [u8], secret: &[u8], label: &[u8], seed: &[u8]) {
    let mut label_and_seed = Vec::with_capacity(label.len() + seed.len());
    label_and_seed.extend_from_slice(label);
    label_and_seed.extend_from_slice(seed);
    p_hash(alg, result, secret, &label_and_seed);
}

/// Version-dispatched PRF.
pub fn prf_for_version(
    version: u16,
    suite: &CipherSuite,
    result: &mut [u8],
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
) {
    if version >= VERSION_TLS12 {
        prf12(suite.hash, result, secret, label, seed);
    } else {
        prf10(result, secret, label, seed);
    }
}

/// Master secret from the premaster secret (RFC 5246 §8.1).
pub fn master_from_pre_master_secret(
    version: u16,
    suite: &CipherSuite,
    pre_master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> Vec<u8> {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(client_random);
    seed.extend_from_slice(server_random);

    let mut master = vec![0u8; MASTER_SECRET_LEN];
    prf_for_version(
        version,
        suite,
        &mut master,
        pre_master_secret,
        MASTER_SECRET_LABEL,
        &seed,
    );
    master
}

/// Extended master secret over the session hash (RFC 7627).
pub fn extended_master_from_pre_master_secret(
    version: u16,
    suite: &CipherSuite,
    pre_master_secret: &[u8],
    session_hash: &[u8],
) -> Vec<u8> {
    let mut master = vec![0u8; MASTER_SECRET_LEN];
    prf_for_version(
        version,
        suite,
        &mut master,
        pre_master_secret,
        EXTENDED_MASTER_SECRET_LABEL,
        session_hash,
    );
    master
}

/// The connection key block, split per direction.
pub struct KeyBlock {
    pub client_mac: Vec<u8>,
    pub server_mac: Vec<u8>,
    pub client_key: Vec<u8>,
    pub server_key: Vec<u8>,
    pub client_iv: Vec<u8>,
    pub server_iv: Vec<u8>,
}

/// Expand the master secret into the key block (RFC 5246 §6.3).
pub fn keys_from_master_secret(
    version: u16,
    suite: &CipherSuite,
    master_secret: &[u8],
    client_random: &[u8; 32],
    server_random: &[u8; 32],
) -> KeyBlock {
    let mut seed = Vec::with_capacity(64);
    seed.extend_from_slice(server_random);
    seed.extend_from_slice(client_random);

    let total = 2 * suite.mac_len + 2 * suite.key_len + 2 * suite.iv_len;
    let mut block = vec![0u8; total];
    prf_for_version(
        version,
        suite,
        &mut block,
        master_secret,
        KEY_EXPANSION_LABEL,
        &seed,
    );

    let mut rest = block.as_slice();
    let mut take = |n: usize| {
        let (head, tail) = rest.split_at(n);
        rest = tail;
        head.to_vec()
    };
    KeyBlock {
        client_mac: take(suite.mac_len),
        server_mac: take(suite.mac_len),
        client_key: take(suite.key_len),
        server_key: take(suite.key_len),
        client_iv: take(suite.iv_len),
        server_iv: take(suite.iv_len),
    }
}

// ---------------------------------------------------------------------------
// TLS 1.3 schedule
// ---------------------------------------------------------------------------

/// HKDF-Expand-Label (RFC 8446 §7.1).
pub fn hkdf_expand_label(
    alg: MacHash,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: usize,
) -> Vec<u8> {
    let mut info = Vec::with_capacity(2 + 1 + 6 + label.len() + 1 + context.len());
    info.extend_from_slice(&(length as u16).to_be_bytes());
    info.push((6 + label.len()) as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    hkdf::expand(alg, secret, &info, length)
}

/// Derive-Secret over a transcript hash.
pub fn derive_secret(alg: MacHash, secret: &[u8], label: &[u8], transcript_hash: &[u8]) -> Vec<u8> {
    hkdf_expand_label(alg, secret, label, transcript_hash, alg.digest_size())
}

/// Traffic keys for a TLS 1.3 secret: (key, iv).
pub fn traffic_keys(suite: &CipherSuite, secret: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let key = hkdf_expand_label(suite.hash, secret, b"key", &[], suite.key_len);
    let iv = hkdf_expand_label(suite.hash, secret, b"iv", &[], 12);
    (key, iv)
}

/// The KeyUpdate ratchet.
pub fn update_traffic_secret(alg: MacHash, secret: &[u8]) -> Vec<u8> {
    hkdf_expand_label(alg, secret, b"traffic upd", &[], alg.digest_size())
}

/// Resumption PSK from the resumption master secret and ticket nonce.
pub fn derive_session_psk(suite: &CipherSuite, resumption_secret: &[u8], nonce: &[u8]) -> Vec<u8> {
    hkdf_expand_label(
        suite.hash,
        resumption_secret,
        b"resumption",
        nonce,
        suite.hash.digest_size(),
    )
}

/// The Finished MAC over a TLS 1.3 traffic/base secret.
pub fn finished_hash13(alg: MacHash, base_secret: &[u8], transcript_hash: &[u8]) -> Vec<u8> {
    let finished_key = hkdf_expand_label(alg, base_secret, b"finished", &[], alg.digest_size());
    hmac(alg, &finished_key, transcript_hash)
}

// ---------------------------------------------------------------------------
// Handshake transcript
// ---------------------------------------------------------------------------

/// The running handshake transcript. For TLS ≤ 1.1 the Finished hash
/// is MD5 ‖ SHA-1; for 1.2 and 1.3 it is the suite hash. The raw
/// transcript is retained so HelloRetryRequest can restart it with a
/// message_hash prefix.
#[derive(Clone)]
pub struct HandshakeHash {
    version: u16,
    alg: MacHash,
    transcript: Vec<u8>,
}

impl HandshakeHash {
    pub fn new(version: u16, suite: &CipherSuite) -> HandshakeHash {
        HandshakeHash {
            version,
            alg: suite.hash,
            transcript: Vec::new(),
        }
    }

    pub fn write(&mut self, msg: &[u8]) {
        self.transcript.extend_from_slice(msg);
    }

    /// Absorb a handshake message. Under DTLS the hash covers the
    /// 12-byte DTLS header form (message sequence, zero fragment
    /// offset, full fragment length) regardless of how the message was
    /// fragmented on the wire.
    pub fn write_handshake(&mut self, msg: &[u8], seqno: u16, is_dtls: bool) {
        if !is_dtls {
            self.write(msg);
            return;
        }
        debug_assert!(msg.len() >= 4);
        let mut dtls_form = Vec::with_capacity(msg.len() + 8);
        dtls_form.extend_from_slice(&msg[..4]);
        dtls_form.extend_from_slice(&seqno.to_be_bytes());
        dtls_form.extend_from_slice(&[0, 0, 0]);
        dtls_form.extend_from_slice(&msg[1..4]);
        dtls_form.extend_from_slice(&msg[4..]);
        self.write(&dtls_form);
    }

    /// Drop everything absorbed so far (DTLS discards the pre-cookie
    /// exchange from the Finished hash).
    pub fn reset(&mut self) {
        self.transcript.clear();
    }

    /// The raw transcript bytes absorbed so far.
    pub fn raw_transcript(&self) -> &[u8] {
        &self.transcript
    }

    /// The current transcript hash.
    pub fn sum(&self) -> Vec<u8> {
        if self.version < VERSION_TLS12 {
            let mut out = Vec::with_capacity(36);
            out.extend_from_slice(&MacHash::Md5.hash(&self.transcript));
            out.extend_from_slice(&MacHash::Sha1.hash(&self.transcript));
            out
        } else {
            let mut h = Hasher::new(self.alg);
            h.update(&self.transcript);
            h.finalize()
        }
    }

    /// Finished verify_data for the pre-1.3 PRF.
    pub fn finished_sum(&self, label: &[u8], master_secret: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; FINISHED_VERIFY_LEN];
        let sum = self.sum();
        if self.version >= VERSION_TLS12 {
            prf12(self.alg, &mut out, master_secret, label, &sum);
        } else {
            prf10(&mut out, master_secret, label, &sum);
        }
        out
    }

    /// Collapse the transcript into the TLS 1.3 message_hash
    /// construction after a HelloRetryRequest.
    pub fn restart_with_message_hash(&mut self) {
        debug_assert!(self.version >= VERSION_TLS13);
        let digest = self.sum();
        let mut replaced = Vec::with_capacity(4 + digest.len());
        replaced.push(crate::TYPE_MESSAGE_HASH);
        replaced.extend_from_slice(&[0, 0, digest.len() as u8]);
        replaced.extend_from_slice(&digest);
        self.transcript = replaced;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{cipher_suite_by_id, TLS_AES_128_GCM_SHA256, TLS_RSA_WITH_AES_128_CBC_SHA};

    // RFC 5246-style PRF vector (TLS 1.2, SHA-256), from the widely
    // used prf testcase: secret 9b be 43 6b..., label "test label".
    #[test]
    fn test_prf12_vector() {
        let secret = hex::decode("9bbe436ba940f017b17652849a71db35").unwrap();
        let seed = hex::decode("a0ba9f936cda311827a6f796ffd5198c").unwrap();
        let mut out = vec![0u8; 100];
        prf12(MacHash::Sha256, &mut out, &secret, b"test label", &seed);
        assert_eq!(
            hex::encode(&out[..32]),
            "e3f229ba727be17b8d122620557cd453c2aab21d07c3d495329b52d4e61edb5a"
        );
    }

    #[test]
    fn test_prf10_split_secret() {
        // The two halves overlap by one byte for odd-length secrets;
        // this just pins the construction against accidental change.
        let mut out1 = vec![0u8; 16];
        prf10(&mut out1, b"odd-secret", b"label", b"seed");
        let mut out2 = vec![0u8; 16];
        prf10(&mut out2, b"odd-secret", b"label", b"seed");
        assert_eq!(out1, out2);
        assert_ne!(out1, vec![0u8; 16]);
    }

    #[test]
    fn test_key_block_lengths() {
        let suite = cipher_suite_by_id(TLS_RSA_WITH_AES_128_CBC_SHA).unwrap();
        let kb = keys_from_master_secret(
            crate::VERSION_TLS12,
            suite,
            &[0x42; 48],
            &[1u8; 32],
            &[2u8; 32],
        );
        assert_eq!(kb.client_mac.len(), 20);
        assert_eq!(kb.server_mac.len(), 20);
        assert_eq!(kb.client_key.len(), 16);
        assert_eq!(kb.client_iv.len(), 16);
        assert_ne!(kb.client_key, kb.server_key);
    }

    // RFC 8448 §3, derivation of the client handshake traffic secret
    // inputs: checks Expand-Label against the published key.
    #[test]
    fn test_hkdf_expand_label_rfc8448() {
        let c_hs_traffic = hex::decode(
            "b3eddb126e067f35a780b3abf45e2d8f3b1a950738f52e9600746a0e27a55a21",
        )
        .unwrap();
        let key = hkdf_expand_label(MacHash::Sha256, &c_hs_traffic, b"key", &[], 16);
        assert_eq!(hex::encode(key), "dbfaa693d1762c5b666af5d950258d01");
        let iv = hkdf_expand_label(MacHash::Sha256, &c_hs_traffic, b"iv", &[], 12);
        assert_eq!(hex::encode(iv), "5bd3c71b836e0b76bb73265f");
    }

    #[test]
    fn test_transcript_versions() {
        let suite = cipher_suite_by_id(TLS_AES_128_GCM_SHA256).unwrap();
        let mut h = HandshakeHash::new(crate::VERSION_TLS12, suite);
        h.write(b"msg one");
        h.write(b"msg two");
        assert_eq!(h.sum().len(), 32);

        let legacy = cipher_suite_by_id(TLS_RSA_WITH_AES_128_CBC_SHA).unwrap();
        let mut h = HandshakeHash::new(crate::VERSION_TLS10, legacy);
        h.write(b"msg");
        assert_eq!(h.sum().len(), 36);
    }

    #[test]
    fn test_message_hash_restart() {
        let suite = cipher_suite_by_id(TLS_AES_128_GCM_SHA256).unwrap();
        let mut h = HandshakeHash::new(crate::VERSION_TLS13, suite);
        h.write(b"ClientHello1");
        let ch1_hash = h.sum();
        h.restart_with_message_hash();
        let mut expect = vec![crate::TYPE_MESSAGE_HASH, 0, 0, 32];
        expect.extend_from_slice(&ch1_hash);
        let mut manual = Hasher::new(MacHash::Sha256);
        manual.update(&expect);
        assert_eq!(h.sum(), manual.finalize());
    }
}
