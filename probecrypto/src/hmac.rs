//! HMAC (RFC 2104) over the digest algorithms the TLS stack negotiates.
//!
//! A single algorithm enum keeps the record-layer MAC and the PRF code
//! free of generics; the TLS MAC key and PRF secret sizes are all small
//! enough that returning `Vec<u8>` digests is fine here.

use sha2::Digest as _;

use crate::md5::Md5;
use crate::sha1::Sha1;

/// Digest algorithm selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacHash {
    Md5,
    Sha1,
    Sha256,
    Sha384,
}

impl MacHash {
    /// Output size in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            MacHash::Md5 => 16,
            MacHash::Sha1 => 20,
            MacHash::Sha256 => 32,
            MacHash::Sha384 => 48,
        }
    }

    /// Internal block size in bytes (the HMAC pad width).
    pub fn block_size(self) -> usize {
        match self {
            MacHash::Md5 | MacHash::Sha1 | MacHash::Sha256 => 64,
            MacHash::Sha384 => 128,
        }
    }

    /// One-shot digest.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        let mut h = Hasher::new(self);
        h.update(data);
        h.finalize()
    }
}

/// Streaming digest over any supported algorithm.
#[derive(Clone)]
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
}

impl Hasher {
    pub fn new(alg: MacHash) -> Self {
        match alg {
            MacHash::Md5 => Hasher::Md5(Md5::new()),
            MacHash::Sha1 => Hasher::Sha1(Sha1::new()),
            MacHash::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            MacHash::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
        }
    }

    pub fn algorithm(&self) -> MacHash {
        match self {
            Hasher::Md5(_) => MacHash::Md5,
            Hasher::Sha1(_) => MacHash::Sha1,
            Hasher::Sha256(_) => MacHash::Sha256,
            Hasher::Sha384(_) => MacHash::Sha384,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
        }
    }
}

/// Streaming HMAC state.
#[derive(Clone)]
pub struct Hmac {
    alg: MacHash,
    inner: Hasher,
    opad_key: Vec<u8>,
}

impl Hmac {
    pub fn new(alg: MacHash, key: &[u8]) -> Self {
        let block = alg.block_size();
        let mut padded = vec![0u8; block];
        if key.len() > block {
            let digest = alg.hash(key);
            padded[..digest.len()].copy_from_slice(&digest);
        } else {
            padded[..key.len()].copy_from_slice(key);
        }

        let mut ipad = padded.clone();
        for b in ipad.iter_mut() {
            *b ^= 0x36;
        }
        let mut opad_key = padded;
        for b in opad_key.iter_mut() {
            *b ^= 0x5c;
        }

        let mut inner = Hasher::new(alg);
        inner.update(&ipad);
        Self { alg, inner, opad_key }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Vec<u8> {
        let inner_digest = self.inner.finalize();
        let mut outer = Hasher::new(self.alg);
        outer.update(&self.opad_key);
        outer.update(&inner_digest);
        outer.finalize()
    }

    pub fn mac_size(&self) -> usize {
        self.alg.digest_size()
    }
}

/// One-shot HMAC.
pub fn hmac(alg: MacHash, key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut h = Hmac::new(alg, key);
    h.update(data);
    h.finalize()
}

/// One-shot HMAC-SHA-256, the shape the KEM decapsulation paths want.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    hmac(MacHash::Sha256, key, data).try_into().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc4231_case1() {
        let key = [0x0b; 20];
        let tag = hmac(MacHash::Sha256, &key, b"Hi There");
        assert_eq!(
            hex::encode(tag),
            "b0344c61d8db38535ca8afceaf0bf12b881dc200c9833da726e9376c2e32cff7"
        );
    }

    #[test]
    fn test_rfc4231_case2() {
        let tag = hmac(MacHash::Sha256, b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(tag),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_hmac_sha1_rfc2202() {
        let key = [0x0b; 20];
        let tag = hmac(MacHash::Sha1, &key, b"Hi There");
        assert_eq!(hex::encode(tag), "b617318655057264e28bc0b6fb378c8ef146be00");
    }

    #[test]
    fn test_hmac_md5_rfc2202() {
        let tag = hmac(MacHash::Md5, b"Jefe", b"what do ya want for nothing?");
        assert_eq!(hex::encode(tag), "750c783e6ab0b503eaa86e310a5db738");
    }

    #[test]
    fn test_long_key_is_hashed() {
        let key = [0xaa; 131];
        let tag = hmac(
            MacHash::Sha256,
            &key,
            b"Test Using Larger Than Block-Size Key - Hash Key First",
        );
        assert_eq!(
            hex::encode(tag),
            "60e431591ee0b67f0d8a26aacbf5b77f8e0bc6213728c5140546040f0ee37f54"
        );
    }
}
