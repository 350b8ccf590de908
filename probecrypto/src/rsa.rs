//! Minimal RSA for the TLS 1.2 RSA key exchange: big-integer modular
//! exponentiation and PKCS#1 v1.5 type-2 padding.
//!
//! Key generation and X.509 key parsing are external concerns; keys
//! arrive here already split into (n, e) / (n, d) byte strings.

use rand::RngCore;

/// Arbitrary-precision unsigned integer, little-endian u64 limbs.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Bignum {
    limbs: Vec<u64>,
}

impl Bignum {
    fn zero() -> Self {
        Self { limbs: Vec::new() }
    }

    fn one() -> Self {
        Self { limbs: vec![1] }
    }

    fn from_be_bytes(bytes: &[u8]) -> Self {
        let mut limbs = Vec::with_capacity((bytes.len() + 7) / 8);
        for chunk in bytes.rchunks(8) {
            let mut limb = 0u64;
            for &b in chunk {
                limb = (limb << 8) | b as u64;
            }
            limbs.push(limb);
        }
        let mut n = Self { limbs };
        n.trim();
        n
    }

    fn to_be_bytes(&self, width: usize) -> Vec<u8> {
        let mut out = vec![0u8; width];
        let mut idx = width;
        for limb in &self.limbs {
            for shift in 0..8 {
                if idx == 0 {
                    return out;
                }
                idx -= 1;
                out[idx] = (limb >> (shift * 8)) as u8;
            }
        }
        out
    }

    fn trim(&mut self) {
        while self.limbs.last() == Some(&0) {
            self.limbs.pop();
        }
    }

    fn is_zero(&self) -> bool {
        self.limbs.is_empty()
    }

    fn bit_len(&self) -> usize {
        match self.limbs.last() {
            None => 0,
            Some(top) => self.limbs.len() * 64 - top.leading_zeros() as usize,
        }
    }

    fn bit(&self, i: usize) -> bool {
        let limb = i / 64;
        limb < self.limbs.len() && (self.limbs[limb] >> (i % 64)) & 1 == 1
    }

    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        use core::cmp::Ordering;
        if self.limbs.len() != other.limbs.len() {
            return self.limbs.len().cmp(&other.limbs.len());
        }
        for (a, b) in self.limbs.iter().rev().zip(other.limbs.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    /// self -= other; caller guarantees self >= other.
    fn sub_assign(&mut self, other: &Self) {
        let mut borrow = 0u64;
        for i in 0..self.limbs.len() {
            let rhs = other.limbs.get(i).copied().unwrap_or(0);
            let (d1, b1) = self.limbs[i].overflowing_sub(rhs);
            let (d2, b2) = d1.overflowing_sub(borrow);
            self.limbs[i] = d2;
            borrow = (b1 | b2) as u64;
        }
        debug_assert_eq!(borrow, 0);
        self.trim();
    }

    /// self = self * 2 + bit.
    fn shl1_add(&mut self, bit: bool) {
        let mut carry = bit as u64;
        for limb in self.limbs.iter_mut() {
            let next = *limb >> 63;
            *limb = (*limb << 1) | carry;
            carry = next;
        }
        if carry != 0 {
            self.limbs.push(carry);
        }
    }

    fn mul(&self, other: &Self) -> Self {
        if self.is_zero() || other.is_zero() {
            return Self::zero();
        }
        let mut acc = vec![0u128; self.limbs.len() + other.limbs.len()];
        for (i, &a) in self.limbs.iter().enumerate() {
            let mut carry = 0u128;
            for (j, &b) in other.limbs.iter().enumerate() {
                let t = acc[i + j] + a as u128 * b as u128 + carry;
                acc[i + j] = t & 0xffff_ffff_ffff_ffff;
                carry = t >> 64;
            }
            let mut k = i + other.limbs.len();
            while carry != 0 {
                let t = acc[k] + carry;
                acc[k] = t & 0xffff_ffff_ffff_ffff;
                carry = t >> 64;
                k += 1;
            }
        }
        let mut out = Self {
            limbs: acc.into_iter().map(|x| x as u64).collect(),
        };
        out.trim();
        out
    }

    /// self mod m by bitwise long division.
    fn rem(&self, m: &Self) -> Self {
        let mut r = Self::zero();
        for i in (0..self.bit_len()).rev() {
            r.shl1_add(self.bit(i));
            if r.cmp(m) != core::cmp::Ordering::Less {
                r.sub_assign(m);
            }
        }
        r
    }

    /// self^e mod m, square-and-multiply MSB first.
    fn mod_exp(&self, e: &Self, m: &Self) -> Self {
        let base = self.rem(m);
        let mut result = Self::one();
        for i in (0..e.bit_len()).rev() {
            result = result.mul(&result).rem(m);
            if e.bit(i) {
                result = result.mul(&base).rem(m);
            }
        }
        result
    }
}

/// RSA public key, big-endian components.
#[derive(Clone, Debug)]
pub struct RsaPublicKey {
    pub n: Vec<u8>,
    pub e: Vec<u8>,
}

/// RSA private key; only the private exponent path is needed here.
#[derive(Clone, Debug)]
pub struct RsaPrivateKey {
    pub public: RsaPublicKey,
    pub d: Vec<u8>,
}

impl RsaPublicKey {
    /// Modulus size in bytes; every ciphertext has this length.
    pub fn modulus_len(&self) -> usize {
        Bignum::from_be_bytes(&self.n).bit_len().div_ceil(8)
    }

    /// PKCS#1 v1.5 type-2 encryption (the premaster-secret wrap).
    pub fn encrypt_pkcs1(&self, rng: &mut dyn RngCore, msg: &[u8]) -> Option<Vec<u8>> {
        let k = self.modulus_len();
        if msg.len() + 11 > k {
            return None;
        }

        let mut em = vec![0u8; k];
        em[1] = 0x02;
        let pad_len = k - msg.len() - 3;
        for b in em[2..2 + pad_len].iter_mut() {
            *b = loop {
                let v = (rng.next_u32() & 0xff) as u8;
                if v != 0 {
                    break v;
                }
            };
        }
        em[k - msg.len()..].copy_from_slice(msg);

        let n = Bignum::from_be_bytes(&self.n);
        let e = Bignum::from_be_bytes(&self.e);
        let c = Bignum::from_be_bytes(&em).mod_exp(&e, &n);
        Some(c.to_be_bytes(k))
    }
}

/// DigestInfo prefix for SHA-256 (RFC 8017 §9.2).
const SHA256_DIGEST_INFO: [u8; 19] = [
    0x30, 0x31, 0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01,
    0x05, 0x00, 0x04, 0x20,
];

fn emsa_pkcs1_sha256(k: usize, digest: &[u8; 32]) -> Option<Vec<u8>> {
    let t_len = SHA256_DIGEST_INFO.len() + 32;
    if k < t_len + 11 {
        return None;
    }
    let mut em = vec![0xffu8; k];
    em[0] = 0x00;
    em[1] = 0x01;
    em[k - t_len - 1] = 0x00;
    em[k - t_len..k - 32].copy_from_slice(&SHA256_DIGEST_INFO);
    em[k - 32..].copy_from_slice(digest);
    Some(em)
}

impl RsaPublicKey {
    /// PKCS#1 v1.5 signature verification over a SHA-256 digest.
    pub fn verify_pkcs1_sha256(&self, digest: &[u8; 32], signature: &[u8]) -> bool {
        let k = self.modulus_len();
        if signature.len() != k {
            return false;
        }
        let n = Bignum::from_be_bytes(&self.n);
        let e = Bignum::from_be_bytes(&self.e);
        let em = Bignum::from_be_bytes(signature).mod_exp(&e, &n).to_be_bytes(k);
        match emsa_pkcs1_sha256(k, digest) {
            Some(expected) => em == expected,
            None => false,
        }
    }
}

impl RsaPrivateKey {
    /// PKCS#1 v1.5 signature over a SHA-256 digest.
    pub fn sign_pkcs1_sha256(&self, digest: &[u8; 32]) -> Option<Vec<u8>> {
        let k = self.public.modulus_len();
        let em = emsa_pkcs1_sha256(k, digest)?;
        let n = Bignum::from_be_bytes(&self.public.n);
        let d = Bignum::from_be_bytes(&self.d);
        Some(Bignum::from_be_bytes(&em).mod_exp(&d, &n).to_be_bytes(k))
    }

    /// PKCS#1 v1.5 type-2 decryption. None on any padding defect; the TLS
    /// server is expected to countermeasure Bleichenbacher at its own
    /// layer by substituting a random premaster.
    pub fn decrypt_pkcs1(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        let k = self.public.modulus_len();
        if ciphertext.len() != k || k < 11 {
            return None;
        }

        let n = Bignum::from_be_bytes(&self.public.n);
        let d = Bignum::from_be_bytes(&self.d);
        let em = Bignum::from_be_bytes(ciphertext)
            .mod_exp(&d, &n)
            .to_be_bytes(k);

        if em[0] != 0x00 || em[1] != 0x02 {
            return None;
        }
        let sep = em[2..].iter().position(|&b| b == 0)?;
        if sep < 8 {
            return None;
        }
        Some(em[3 + sep..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn bn(hex_str: &str) -> Bignum {
        Bignum::from_be_bytes(&hex::decode(hex_str).unwrap())
    }

    #[test]
    fn test_bignum_rem() {
        let a = bn("01000000000000000000"); // 2^72
        let m = bn("0100000001"); // 2^32 + 1
        // 2^72 mod (2^32+1): 2^32 ≡ -1, so 2^72 = 2^8 * (2^32)^2 ≡ 2^8.
        assert_eq!(a.rem(&m), bn("0100"));
    }

    #[test]
    fn test_mod_exp_small() {
        // 4^13 mod 497 = 445
        let base = Bignum { limbs: vec![4] };
        let e = Bignum { limbs: vec![13] };
        let m = Bignum { limbs: vec![497] };
        assert_eq!(base.mod_exp(&e, &m), Bignum { limbs: vec![445] });
    }

    // 512-bit keypair fixed for tests; p/q discarded, CRT not used.
    const TEST_N: &str = "975a26ae08c19270c144cc4cc9d9b92d682259605c21455ce871c51f9c164fc2c64dedc4d3f56dedb034192323b38a829fdfb322373821f7474551c59f672cdb";
    const TEST_E: &str = "010001";
    const TEST_D: &str = "80a8eb1ea064e4f6a2e4b80342c7a969d70ef4093ce82f8da62f2892115eca1788c9b4f7055bb1f1591b5842bea0171f6e5826f0197a4ca0715310b280fe1f41";

    #[test]
    fn test_pkcs1_roundtrip() {
        let public = RsaPublicKey {
            n: hex::decode(TEST_N).unwrap(),
            e: hex::decode(TEST_E).unwrap(),
        };
        let private = RsaPrivateKey {
            public: public.clone(),
            d: hex::decode(TEST_D).unwrap(),
        };

        let mut rng = StepRng::new(0x0101_0101_0101_0101, 0x1234_5678);
        let msg = b"premaster secret bits";
        let ct = public.encrypt_pkcs1(&mut rng, msg).unwrap();
        assert_eq!(ct.len(), 64);
        assert_eq!(private.decrypt_pkcs1(&ct).as_deref(), Some(msg.as_ref()));
    }

    #[test]
    fn test_pkcs1_sign_verify() {
        let public = RsaPublicKey {
            n: hex::decode(TEST_N).unwrap(),
            e: hex::decode(TEST_E).unwrap(),
        };
        let private = RsaPrivateKey {
            public: public.clone(),
            d: hex::decode(TEST_D).unwrap(),
        };

        let digest = [0x5au8; 32];
        let sig = private.sign_pkcs1_sha256(&digest).unwrap();
        assert!(public.verify_pkcs1_sha256(&digest, &sig));

        let mut wrong = digest;
        wrong[0] ^= 1;
        assert!(!public.verify_pkcs1_sha256(&wrong, &sig));

        let mut bad_sig = sig;
        bad_sig[0] ^= 1;
        assert!(!public.verify_pkcs1_sha256(&digest, &bad_sig));
    }

    #[test]
    fn test_pkcs1_bad_padding() {
        let public = RsaPublicKey {
            n: hex::decode(TEST_N).unwrap(),
            e: hex::decode(TEST_E).unwrap(),
        };
        let private = RsaPrivateKey {
            public: public.clone(),
            d: hex::decode(TEST_D).unwrap(),
        };

        // A random ciphertext essentially never decrypts to valid type-2
        // padding.
        let ct = vec![0x5a; 64];
        assert_eq!(private.decrypt_pkcs1(&ct), None);
    }
}
