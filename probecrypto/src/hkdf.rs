//! HKDF (RFC 5869), the extract-and-expand construction behind the
//! TLS 1.3 key schedule and resumption-PSK derivation.

use crate::hmac::{hmac, Hmac, MacHash};

/// HKDF-Extract: PRK = HMAC-Hash(salt, IKM).
pub fn extract(alg: MacHash, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    let salt = if salt.is_empty() {
        vec![0u8; alg.digest_size()]
    } else {
        salt.to_vec()
    };
    hmac(alg, &salt, ikm)
}

/// HKDF-Expand: OKM of `length` bytes from PRK and info.
pub fn expand(alg: MacHash, prk: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let mut okm = Vec::with_capacity(length);
    let mut block: Vec<u8> = Vec::new();
    let mut counter = 1u8;

    while okm.len() < length {
        let mut h = Hmac::new(alg, prk);
        h.update(&block);
        h.update(info);
        h.update(&[counter]);
        block = h.finalize();
        okm.extend_from_slice(&block);
        counter = counter.checked_add(1).expect("HKDF output too long");
    }

    okm.truncate(length);
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 5869 test case 1.
    #[test]
    fn test_extract_expand() {
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();

        let prk = extract(MacHash::Sha256, &salt, &ikm);
        assert_eq!(
            hex::encode(&prk),
            "077709362c2e32df0ddc3f0dc47bba6390b6c73bb50f9c3122ec844ad7c2b3e5"
        );

        let okm = expand(MacHash::Sha256, &prk, &info, 42);
        assert_eq!(
            hex::encode(&okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_empty_salt_is_zero_block() {
        let a = extract(MacHash::Sha256, &[], b"ikm");
        let b = extract(MacHash::Sha256, &[0u8; 32], b"ikm");
        assert_eq!(a, b);
    }
}
