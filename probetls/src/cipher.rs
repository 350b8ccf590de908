//! Cipher suites and the record-layer cipher state.
//!
//! The cipher is a closed sum over the variants the record layer can
//! carry: none (cleartext), null, stream, AEAD with explicit or
//! implicit nonce, and CBC. Each seals and opens with a fixed small
//! interface so the half-connection can stay shape-agnostic.

use probecrypto::aes::{AesCbc, AesGcm};
use probecrypto::chacha20::ChaCha20Poly1305;
use probecrypto::hmac::{Hmac, MacHash};
use probecrypto::rc4::Rc4;

// Cipher suite identifiers.
pub const TLS_RSA_WITH_RC4_128_SHA: u16 = 0x0005;
pub const TLS_RSA_WITH_AES_128_CBC_SHA: u16 = 0x002f;
pub const TLS_RSA_WITH_AES_128_GCM_SHA256: u16 = 0x009c;
pub const TLS_AES_128_GCM_SHA256: u16 = 0x1301;
pub const TLS_AES_256_GCM_SHA384: u16 = 0x1302;
pub const TLS_CHACHA20_POLY1305_SHA256: u16 = 0x1303;

/// Which record cipher a suite installs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BulkCipher {
    Rc4,
    AesCbc,
    AesGcm,
    ChaCha20Poly1305,
}

/// Static description of a cipher suite.
pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
    pub bulk: BulkCipher,
    pub key_len: usize,
    /// MAC digest length; zero for AEAD suites.
    pub mac_len: usize,
    /// Record IV length: CBC block, AEAD fixed-nonce prefix, or the
    /// full TLS 1.3 nonce.
    pub iv_len: usize,
    /// PRF and transcript hash.
    pub hash: MacHash,
    /// Only usable at TLS 1.3 and up.
    pub tls13: bool,
}

impl CipherSuite {
    pub fn is_aead(&self) -> bool {
        self.mac_len == 0
    }

    /// Pre-TLS-1.3 AEADs carry an explicit 8-byte nonce on the wire.
    pub fn has_explicit_nonce(&self, version: u16) -> bool {
        self.is_aead() && self.bulk == BulkCipher::AesGcm && version < crate::VERSION_TLS13
    }
}

static CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite {
        id: TLS_RSA_WITH_RC4_128_SHA,
        name: "TLS_RSA_WITH_RC4_128_SHA",
        bulk: BulkCipher::Rc4,
        key_len: 16,
        mac_len: 20,
        iv_len: 0,
        hash: MacHash::Sha256,
        tls13: false,
    },
    CipherSuite {
        id: TLS_RSA_WITH_AES_128_CBC_SHA,
        name: "TLS_RSA_WITH_AES_128_CBC_SHA",
        bulk: BulkCipher::AesCbc,
        key_len: 16,
        mac_len: 20,
        iv_len: 16,
        hash: MacHash::Sha256,
        tls13: false,
    },
    CipherSuite {
        id: TLS_RSA_WITH_AES_128_GCM_SHA256,
        name: "TLS_RSA_WITH_AES_128_GCM_SHA256",
        bulk: BulkCipher::AesGcm,
        key_len: 16,
        mac_len: 0,
        iv_len: 4,
        hash: MacHash::Sha256,
        tls13: false,
    },
    CipherSuite {
        id: TLS_AES_128_GCM_SHA256,
        name: "TLS_AES_128_GCM_SHA256",
        bulk: BulkCipher::AesGcm,
        key_len: 16,
        mac_len: 0,
        iv_len: 12,
        hash: MacHash::Sha256,
        tls13: true,
    },
    CipherSuite {
        id: TLS_AES_256_GCM_SHA384,
        name: "TLS_AES_256_GCM_SHA384",
        bulk: BulkCipher::AesGcm,
        key_len: 32,
        mac_len: 0,
        iv_len: 12,
        hash: MacHash::Sha384,
        tls13: true,
    },
    CipherSuite {
        id: TLS_CHACHA20_POLY1305_SHA256,
        name: "TLS_CHACHA20_POLY1305_SHA256",
        bulk: BulkCipher::ChaCha20Poly1305,
        key_len: 32,
        mac_len: 0,
        iv_len: 12,
        hash: MacHash::Sha256,
        tls13: true,
    },
];

pub fn cipher_suite_by_id(id: u16) -> Option<&'static CipherSuite> {
    CIPHER_SUITES.iter().find(|s| s.id == id)
}

/// The default offer, newest first.
pub fn default_cipher_suite_ids() -> Vec<u16> {
    CIPHER_SUITES.iter().map(|s| s.id).collect()
}

/// Suites permitted for a negotiated protocol version.
pub fn suites_for_version(version: u16) -> impl Iterator<Item = &'static CipherSuite> {
    let tls13 = version >= crate::VERSION_TLS13;
    CIPHER_SUITES.iter().filter(move |s| s.tls13 == tls13)
}

/// An AEAD instance with its fixed nonce material.
pub enum AeadVariant {
    AesGcm(AesGcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl AeadVariant {
    pub fn overhead(&self) -> usize {
        match self {
            AeadVariant::AesGcm(a) => a.overhead(),
            AeadVariant::ChaCha20Poly1305(a) => a.overhead(),
        }
    }

    pub fn seal(&self, nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        match self {
            AeadVariant::AesGcm(a) => a.seal(nonce, aad, plaintext),
            AeadVariant::ChaCha20Poly1305(a) => a.seal(nonce, aad, plaintext),
        }
    }

    pub fn open(&self, nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        match self {
            AeadVariant::AesGcm(a) => a.open(nonce, aad, ciphertext),
            AeadVariant::ChaCha20Poly1305(a) => a.open(nonce, aad, ciphertext),
        }
    }
}

/// The per-direction record cipher.
pub enum CipherState {
    /// No cipher installed yet: records pass in the clear.
    None,
    /// The null cipher: framing as if encrypted, bytes untouched.
    Null,
    Stream(Rc4),
    Aead {
        aead: AeadVariant,
        /// Fixed nonce: 4-byte prefix (explicit-nonce AEADs) or full
        /// 12-byte XOR mask.
        fixed_nonce: Vec<u8>,
        explicit_nonce: bool,
    },
    Cbc(AesCbc),
}

impl CipherState {
    pub fn is_none(&self) -> bool {
        matches!(self, CipherState::None)
    }

    /// Build the per-record AEAD nonce from the sequence number or the
    /// wire-explicit nonce.
    pub fn aead_nonce(fixed: &[u8], explicit_nonce: bool, seq_or_explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        if explicit_nonce {
            nonce[..fixed.len()].copy_from_slice(fixed);
            nonce[fixed.len()..].copy_from_slice(seq_or_explicit);
        } else {
            nonce.copy_from_slice(fixed);
            for (n, s) in nonce[4..].iter_mut().zip(seq_or_explicit.iter()) {
                *n ^= s;
            }
        }
        nonce
    }
}

/// Construct the record cipher for a suite from its key block slices.
pub fn new_cipher_state(suite: &CipherSuite, key: &[u8], iv: &[u8]) -> CipherState {
    match suite.bulk {
        BulkCipher::Rc4 => CipherState::Stream(Rc4::new(key)),
        BulkCipher::AesCbc => {
            let mut block_iv = [0u8; 16];
            block_iv.copy_from_slice(iv);
            CipherState::Cbc(AesCbc::new(key, &block_iv))
        }
        BulkCipher::AesGcm => CipherState::Aead {
            aead: AeadVariant::AesGcm(AesGcm::new(key)),
            fixed_nonce: iv.to_vec(),
            explicit_nonce: iv.len() == 4,
        },
        BulkCipher::ChaCha20Poly1305 => CipherState::Aead {
            aead: AeadVariant::ChaCha20Poly1305(ChaCha20Poly1305::new(
                key.try_into().expect("chacha20 key length"),
            )),
            fixed_nonce: iv.to_vec(),
            explicit_nonce: false,
        },
    }
}

/// The pre-TLS-1.3 record MAC: HMAC over the sequence number and
/// pseudo-header.
#[derive(Clone)]
pub struct TlsMac {
    alg: MacHash,
    key: Vec<u8>,
}

impl TlsMac {
    pub fn new(alg: MacHash, key: &[u8]) -> TlsMac {
        TlsMac {
            alg,
            key: key.to_vec(),
        }
    }

    pub fn size(&self) -> usize {
        self.alg.digest_size()
    }

    /// MAC(seq ‖ type ‖ version ‖ length ‖ data).
    pub fn mac(&self, seq: &[u8], type_and_version: &[u8], length: u16, data: &[u8]) -> Vec<u8> {
        let mut h = Hmac::new(self.alg, &self.key);
        h.update(seq);
        h.update(type_and_version);
        h.update(&length.to_be_bytes());
        h.update(data);
        h.finalize()
    }
}

/// The record MAC algorithm of a legacy suite, by MAC length.
pub fn mac_alg_for_suite(suite: &CipherSuite) -> MacHash {
    match suite.mac_len {
        20 => MacHash::Sha1,
        32 => MacHash::Sha256,
        _ => MacHash::Sha1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_lookup() {
        let suite = cipher_suite_by_id(TLS_AES_128_GCM_SHA256).unwrap();
        assert!(suite.tls13);
        assert!(suite.is_aead());
        assert!(!suite.has_explicit_nonce(crate::VERSION_TLS13));

        let legacy = cipher_suite_by_id(TLS_RSA_WITH_AES_128_GCM_SHA256).unwrap();
        assert!(legacy.has_explicit_nonce(crate::VERSION_TLS12));
        assert!(cipher_suite_by_id(0x4242).is_none());
    }

    #[test]
    fn test_version_filter() {
        let ids: Vec<u16> = suites_for_version(crate::VERSION_TLS12).map(|s| s.id).collect();
        assert!(ids.contains(&TLS_RSA_WITH_AES_128_CBC_SHA));
        assert!(!ids.contains(&TLS_AES_128_GCM_SHA256));

        let ids: Vec<u16> = suites_for_version(crate::VERSION_TLS13).map(|s| s.id).collect();
        assert_eq!(
            ids,
            vec![
                TLS_AES_128_GCM_SHA256,
                TLS_AES_256_GCM_SHA384,
                TLS_CHACHA20_POLY1305_SHA256
            ]
        );
    }

    #[test]
    fn test_implicit_nonce_construction() {
        let fixed = [0x10u8; 12];
        let seq = [0, 0, 0, 0, 0, 0, 0, 5u8];
        let nonce = CipherState::aead_nonce(&fixed, false, &seq);
        assert_eq!(&nonce[..4], &[0x10; 4]);
        assert_eq!(nonce[11], 0x10 ^ 5);
    }

    #[test]
    fn test_explicit_nonce_construction() {
        let fixed = [0xaau8; 4];
        let explicit = [1, 2, 3, 4, 5, 6, 7, 8u8];
        let nonce = CipherState::aead_nonce(&fixed, true, &explicit);
        assert_eq!(&nonce[..4], &[0xaa; 4]);
        assert_eq!(&nonce[4..], &explicit);
    }
}
