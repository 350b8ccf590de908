//! X25519 (RFC 7748), the key-share group the TLS 1.3 handshake driver
//! offers.
//!
//! Field elements use the 51-bit limb representation so multiplication
//! stays in u128 without conditional carries.

/// Key and point size in bytes.
pub const X25519_KEY_SIZE: usize = 32;

const MASK51: u64 = (1 << 51) - 1;

/// Field element in GF(2^255 - 19), five 51-bit limbs.
#[derive(Clone, Copy)]
struct Fe([u64; 5]);

impl Fe {
    const ZERO: Fe = Fe([0; 5]);
    const ONE: Fe = Fe([1, 0, 0, 0, 0]);

    fn from_bytes(b: &[u8; 32]) -> Self {
        let load = |r: &[u8]| u64::from_le_bytes(r.try_into().unwrap());
        Fe([
            load(&b[0..8]) & MASK51,
            (load(&b[6..14]) >> 3) & MASK51,
            (load(&b[12..20]) >> 6) & MASK51,
            (load(&b[19..27]) >> 1) & MASK51,
            (load(&b[24..32]) >> 12) & MASK51,
        ])
    }

    fn to_bytes(self) -> [u8; 32] {
        let mut h = self.carried().0;

        // q = 1 iff h >= p; fold it back in and drop bit 255.
        let mut q = (h[0] + 19) >> 51;
        for limb in &h[1..] {
            q = (limb + q) >> 51;
        }
        h[0] += 19 * q;
        for i in 0..4 {
            let c = h[i] >> 51;
            h[i] &= MASK51;
            h[i + 1] += c;
        }
        h[4] &= MASK51;

        let mut out = [0u8; 32];
        let words = [
            h[0] | (h[1] << 51),
            (h[1] >> 13) | (h[2] << 38),
            (h[2] >> 26) | (h[3] << 25),
            (h[3] >> 39) | (h[4] << 12),
        ];
        for (i, w) in words.iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    fn carried(self) -> Self {
        let mut h = self.0;
        let mut c = 0u64;
        for limb in h.iter_mut() {
            let t = *limb + c;
            *limb = t & MASK51;
            c = t >> 51;
        }
        h[0] += 19 * c;
        let c = h[0] >> 51;
        h[0] &= MASK51;
        h[1] += c;
        Fe(h)
    }

    fn add(&self, other: &Fe) -> Fe {
        let mut h = [0u64; 5];
        for i in 0..5 {
            h[i] = self.0[i] + other.0[i];
        }
        Fe(h).carried()
    }

    fn sub(&self, other: &Fe) -> Fe {
        // Add 2p before subtracting so limbs never underflow.
        const TWO_P: [u64; 5] = [
            0xfffffffffffda,
            0xffffffffffffe,
            0xffffffffffffe,
            0xffffffffffffe,
            0xffffffffffffe,
        ];
        let mut h = [0u64; 5];
        for i in 0..5 {
            h[i] = self.0[i] + TWO_P[i] - other.0[i];
        }
        Fe(h).carried()
    }

    fn mul(&self, other: &Fe) -> Fe {
        let f = self.0.map(|x| x as u128);
        let g = other.0.map(|x| x as u128);
        let g19: [u128; 5] = [g[0], g[1] * 19, g[2] * 19, g[3] * 19, g[4] * 19];

        let mut r = [
            f[0] * g[0] + f[1] * g19[4] + f[2] * g19[3] + f[3] * g19[2] + f[4] * g19[1],
            f[0] * g[1] + f[1] * g[0] + f[2] * g19[4] + f[3] * g19[3] + f[4] * g19[2],
            f[0] * g[2] + f[1] * g[1] + f[2] * g[0] + f[3] * g19[4] + f[4] * g19[3],
            f[0] * g[3] + f[1] * g[2] + f[2] * g[1] + f[3] * g[0] + f[4] * g19[4],
            f[0] * g[4] + f[1] * g[3] + f[2] * g[2] + f[3] * g[1] + f[4] * g[0],
        ];

        let mut h = [0u64; 5];
        let mut c = 0u128;
        for i in 0..5 {
            let t = r[i] + c;
            h[i] = (t as u64) & MASK51;
            c = t >> 51;
        }
        r[0] = h[0] as u128 + c * 19;
        h[0] = (r[0] as u64) & MASK51;
        h[1] += (r[0] >> 51) as u64;
        Fe(h)
    }

    fn square(&self) -> Fe {
        self.mul(self)
    }

    /// a^(p-2) by square-and-multiply, MSB first.
    fn invert(&self) -> Fe {
        const P_MINUS_2: [u64; 4] = [
            0xffffffffffffffeb,
            0xffffffffffffffff,
            0xffffffffffffffff,
            0x7fffffffffffffff,
        ];
        let mut result = Fe::ONE;
        for i in (0..255).rev() {
            result = result.square();
            if (P_MINUS_2[i / 64] >> (i % 64)) & 1 == 1 {
                result = result.mul(self);
            }
        }
        result
    }
}

fn cswap(a: &mut Fe, b: &mut Fe, swap: u64) {
    let mask = swap.wrapping_neg();
    for i in 0..5 {
        let t = mask & (a.0[i] ^ b.0[i]);
        a.0[i] ^= t;
        b.0[i] ^= t;
    }
}

/// RFC 7748 scalar multiplication on the Montgomery u-coordinate.
pub fn x25519(scalar: &[u8; 32], point: &[u8; 32]) -> [u8; 32] {
    let mut k = *scalar;
    k[0] &= 248;
    k[31] &= 127;
    k[31] |= 64;

    let x1 = Fe::from_bytes(point);
    let mut x2 = Fe::ONE;
    let mut z2 = Fe::ZERO;
    let mut x3 = x1;
    let mut z3 = Fe::ONE;
    let a24 = Fe([121665, 0, 0, 0, 0]);

    let mut swap = 0u64;
    for i in (0..255).rev() {
        let bit = ((k[i / 8] >> (i % 8)) & 1) as u64;
        swap ^= bit;
        cswap(&mut x2, &mut x3, swap);
        cswap(&mut z2, &mut z3, swap);
        swap = bit;

        let a = x2.add(&z2);
        let aa = a.square();
        let b = x2.sub(&z2);
        let bb = b.square();
        let e = aa.sub(&bb);
        let c = x3.add(&z3);
        let d = x3.sub(&z3);
        let da = d.mul(&a);
        let cb = c.mul(&b);
        x3 = da.add(&cb).square();
        z3 = x1.mul(&da.sub(&cb).square());
        x2 = aa.mul(&bb);
        z2 = e.mul(&aa.add(&a24.mul(&e)));
    }
    cswap(&mut x2, &mut x3, swap);
    cswap(&mut z2, &mut z3, swap);

    x2.mul(&z2.invert()).to_bytes()
}

/// Public key for a (clamped or unclamped) private scalar.
pub fn public_key(scalar: &[u8; 32]) -> [u8; 32] {
    let mut basepoint = [0u8; 32];
    basepoint[0] = 9;
    x25519(scalar, &basepoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7748 §5.2, first test vector.
    #[test]
    fn test_rfc7748_vector1() {
        let scalar: [u8; 32] =
            hex::decode("a546e36bf0527c9d3b16154b82465edd62144c0ac1fc5a18506a2244ba449ac4")
                .unwrap()
                .try_into()
                .unwrap();
        let point: [u8; 32] =
            hex::decode("e6db6867583030db3594c1a424b15f7c726624ec26b3353b10a903a6d0ab1c4c")
                .unwrap()
                .try_into()
                .unwrap();
        assert_eq!(
            hex::encode(x25519(&scalar, &point)),
            "c3da55379de9c6908e94ea4df28d084f32eccf03491c71f754b4075577a28552"
        );
    }

    // RFC 7748 §6.1 Diffie-Hellman.
    #[test]
    fn test_rfc7748_dh() {
        let alice: [u8; 32] =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .unwrap()
                .try_into()
                .unwrap();
        let bob: [u8; 32] =
            hex::decode("5dab087e624a8a4b79e17f8b83800ee66f3bb1292618b6fd1c2f8b27ff88e0eb")
                .unwrap()
                .try_into()
                .unwrap();

        let alice_pub = public_key(&alice);
        let bob_pub = public_key(&bob);
        assert_eq!(
            hex::encode(alice_pub),
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a"
        );

        let k1 = x25519(&alice, &bob_pub);
        let k2 = x25519(&bob, &alice_pub);
        assert_eq!(k1, k2);
        assert_eq!(
            hex::encode(k1),
            "4a5d9d5ba4ce2de1728e3bf480350f25e07e21c947d19e3376f09b3c1e161742"
        );
    }
}
