//! Field arithmetic for SIKE/p434: F_p in seven 64-bit limbs with
//! Montgomery multiplication (R = 2^448), and the quadratic extension
//! Fp2 = F_p(i) with Karatsuba multiplication.
//!
//! Reductions are conditional subtractions followed by masked adds, so
//! the arithmetic has no data-dependent branches.

use super::params::{P, P1, PX2, R2};

/// Limbs per field element.
pub const FP_WORDS: usize = 7;

/// F_p element, little-endian limbs. Whether the value is in the
/// Montgomery domain is tracked by the caller.
pub type Fp = [u64; FP_WORDS];

/// Double-width intermediate product.
pub type FpX2 = [u64; 2 * FP_WORDS];

/// Fp2 element a + b·i.
#[derive(Clone, Copy, Default)]
pub struct Fp2 {
    pub a: Fp,
    pub b: Fp,
}

#[inline]
fn mul64(a: u64, b: u64) -> (u64, u64) {
    let w = (a as u128) * (b as u128);
    ((w >> 64) as u64, w as u64)
}

#[inline]
fn addc(a: u64, b: u64, carry: u64) -> (u64, u64) {
    let t = a as u128 + b as u128 + carry as u128;
    (t as u64, (t >> 64) as u64)
}

#[inline]
fn subb(a: u64, b: u64, borrow: u64) -> (u64, u64) {
    let t = (a as u128).wrapping_sub(b as u128 + borrow as u128);
    (t as u64, (t >> 127) as u64)
}

/// Accumulate a·b into the three-limb accumulator (v, u, t).
#[inline]
fn accum_mul(v: &mut u64, u: &mut u64, t: &mut u64, a: u64, b: u64) {
    let (hi, lo) = mul64(a, b);
    let (v1, c1) = lo.overflowing_add(*v);
    *v = v1;
    let (u1, c2) = hi.overflowing_add(*u);
    let (u2, c3) = u1.overflowing_add(c1 as u64);
    *u = u2;
    *t += (c2 as u64) + (c3 as u64);
}

/// z = x + y mod 2p.
pub fn fp_add_rdc(z: &mut Fp, x: &Fp, y: &Fp) {
    let mut carry = 0u64;
    for i in 0..FP_WORDS {
        let (w, c) = addc(x[i], y[i], carry);
        z[i] = w;
        carry = c;
    }

    let mut borrow = 0u64;
    for i in 0..FP_WORDS {
        let (w, b) = subb(z[i], PX2[i], borrow);
        z[i] = w;
        borrow = b;
    }

    let mask = 0u64.wrapping_sub(borrow);
    let mut carry = 0u64;
    for i in 0..FP_WORDS {
        let (w, c) = addc(z[i], PX2[i] & mask, carry);
        z[i] = w;
        carry = c;
    }
}

/// z = x - y mod 2p.
pub fn fp_sub_rdc(z: &mut Fp, x: &Fp, y: &Fp) {
    let mut borrow = 0u64;
    for i in 0..FP_WORDS {
        let (w, b) = subb(x[i], y[i], borrow);
        z[i] = w;
        borrow = b;
    }

    let mask = 0u64.wrapping_sub(borrow);
    let mut carry = 0u64;
    for i in 0..FP_WORDS {
        let (w, c) = addc(z[i], PX2[i] & mask, carry);
        z[i] = w;
        carry = c;
    }
}

/// Strong reduction: bring x from [0, 2p) into [0, p).
pub fn fp_rdc_p(x: &mut Fp) {
    let mut borrow = 0u64;
    for i in 0..FP_WORDS {
        let (w, b) = subb(x[i], P[i], borrow);
        x[i] = w;
        borrow = b;
    }

    let mask = 0u64.wrapping_sub(borrow);
    let mut carry = 0u64;
    for i in 0..FP_WORDS {
        let (w, c) = addc(x[i], P[i] & mask, carry);
        x[i] = w;
        carry = c;
    }
}

/// Conditionally swap x and y in constant time; `mask` is 0 or 1.
pub fn fp_swap_cond(x: &mut Fp, y: &mut Fp, mask: u8) {
    let m = 0u64.wrapping_sub((mask & 1) as u64);
    for i in 0..FP_WORDS {
        let t = m & (x[i] ^ y[i]);
        x[i] ^= t;
        y[i] ^= t;
    }
}

/// z = x · y, full double-width product (no reduction).
pub fn fp_mul(z: &mut FpX2, x: &Fp, y: &Fp) {
    let mut t = 0u64;
    let mut u = 0u64;
    let mut v = 0u64;

    for i in 0..FP_WORDS {
        for j in 0..=i {
            accum_mul(&mut v, &mut u, &mut t, x[j], y[i - j]);
        }
        z[i] = v;
        v = u;
        u = t;
        t = 0;
    }

    for i in FP_WORDS..2 * FP_WORDS - 1 {
        for j in (i - FP_WORDS + 1)..FP_WORDS {
            accum_mul(&mut v, &mut u, &mut t, x[j], y[i - j]);
        }
        z[i] = v;
        v = u;
        u = t;
        t = 0;
    }
    z[2 * FP_WORDS - 1] = v;
}

/// Montgomery reduction with R = 2^448. Interleaved-word algorithm;
/// exploits the three zero low words of p + 1. Destroys no inputs but
/// the output aliases its own partial state, as in the reference.
pub fn fp_mont_rdc(z: &mut Fp, x: &FpX2) {
    let mut t = 0u64;
    let mut u = 0u64;
    let mut v = 0u64;
    let mut count = 3usize;

    for i in 0..FP_WORDS {
        for j in 0..i {
            if j + count <= i {
                accum_mul(&mut v, &mut u, &mut t, z[j], P1[i - j]);
            }
        }
        let (v1, c1) = v.overflowing_add(x[i]);
        v = v1;
        let (u1, c2) = u.overflowing_add(c1 as u64);
        u = u1;
        t += c2 as u64;

        z[i] = v;
        v = u;
        u = t;
        t = 0;
    }

    for i in FP_WORDS..2 * FP_WORDS - 1 {
        if count > 0 {
            count -= 1;
        }
        for j in (i - FP_WORDS + 1)..FP_WORDS {
            if j < FP_WORDS - count {
                accum_mul(&mut v, &mut u, &mut t, z[j], P1[i - j]);
            }
        }
        let (v1, c1) = v.overflowing_add(x[i]);
        v = v1;
        let (u1, c2) = u.overflowing_add(c1 as u64);
        u = u1;
        t += c2 as u64;

        z[i - FP_WORDS] = v;
        v = u;
        u = t;
        t = 0;
    }
    let (v1, _) = v.overflowing_add(x[2 * FP_WORDS - 1]);
    z[FP_WORDS - 1] = v1;
}

/// z = x + y over double-width values (no reduction).
pub fn fp2_add_wide(z: &mut FpX2, x: &FpX2, y: &FpX2) {
    let mut carry = 0u64;
    for i in 0..2 * FP_WORDS {
        let (w, c) = addc(x[i], y[i], carry);
        z[i] = w;
        carry = c;
    }
}

/// z = x - y over double-width values, adding p·R back on borrow.
pub fn fp2_sub_wide(z: &mut FpX2, x: &FpX2, y: &FpX2) {
    let mut borrow = 0u64;
    for i in 0..2 * FP_WORDS {
        let (w, b) = subb(x[i], y[i], borrow);
        z[i] = w;
        borrow = b;
    }

    let mask = 0u64.wrapping_sub(borrow);
    let mut carry = 0u64;
    for i in FP_WORDS..2 * FP_WORDS {
        let (w, c) = addc(z[i], P[i - FP_WORDS] & mask, carry);
        z[i] = w;
        carry = c;
    }
}

/// dest = lhs · rhs in the Montgomery domain.
pub fn fp_mul_rdc(dest: &mut Fp, lhs: &Fp, rhs: &Fp) {
    let mut ab: FpX2 = [0; 2 * FP_WORDS];
    fp_mul(&mut ab, lhs, rhs);
    fp_mont_rdc(dest, &ab);
}

/// dest = x^((p-3)/4) via a fixed 80-entry sliding-window strategy with
/// a lookup of x, x^3, x^5, …, x^31.
pub fn p34(dest: &mut Fp, x: &Fp) {
    const POW_STRATEGY: [u8; 80] = [
        0x03, 0x0A, 0x07, 0x05, 0x06, 0x05, 0x03, 0x08, 0x04, 0x07, 0x05, 0x06, 0x04, 0x05, 0x09,
        0x06, 0x03, 0x0B, 0x05, 0x05, 0x02, 0x08, 0x04, 0x07, 0x07, 0x08, 0x05, 0x06, 0x04, 0x08,
        0x05, 0x02, 0x0A, 0x06, 0x05, 0x04, 0x08, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05,
        0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05,
        0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05, 0x05,
        0x05, 0x05, 0x05, 0x05, 0x01,
    ];
    const MUL_STRATEGY: [u8; 80] = [
        0x02, 0x0F, 0x09, 0x08, 0x0E, 0x0C, 0x02, 0x08, 0x05, 0x0F, 0x08, 0x0F, 0x06, 0x06, 0x03,
        0x02, 0x00, 0x0A, 0x09, 0x0D, 0x01, 0x0C, 0x03, 0x07, 0x01, 0x0A, 0x08, 0x0B, 0x02, 0x0F,
        0x0E, 0x01, 0x0B, 0x0C, 0x0E, 0x03, 0x0B, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F,
        0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F,
        0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F, 0x0F,
        0x0F, 0x0F, 0x0F, 0x0F, 0x00,
    ];
    const INITIAL_MUL: usize = 8;

    // lookup[i] = x^(2i+1)
    let mut lookup = [[0u64; FP_WORDS]; 16];
    let mut xx: Fp = [0; FP_WORDS];
    fp_mul_rdc(&mut xx, x, x);
    lookup[0] = *x;
    for i in 1..16 {
        let prev = lookup[i - 1];
        fp_mul_rdc(&mut lookup[i], &prev, &xx);
    }

    *dest = lookup[INITIAL_MUL];
    for i in 0..POW_STRATEGY.len() {
        let tmp = *dest;
        fp_mul_rdc(dest, &tmp, &tmp);
        for _ in 1..POW_STRATEGY[i] {
            let tmp = *dest;
            fp_mul_rdc(dest, &tmp, &tmp);
        }
        let tmp = *dest;
        fp_mul_rdc(dest, &tmp, &lookup[MUL_STRATEGY[i] as usize]);
    }
}

/// dest = lhs + rhs in Fp2.
pub fn fp2_add(dest: &mut Fp2, lhs: &Fp2, rhs: &Fp2) {
    fp_add_rdc(&mut dest.a, &lhs.a, &rhs.a);
    fp_add_rdc(&mut dest.b, &lhs.b, &rhs.b);
}

/// dest = lhs - rhs in Fp2.
pub fn fp2_sub(dest: &mut Fp2, lhs: &Fp2, rhs: &Fp2) {
    fp_sub_rdc(&mut dest.a, &lhs.a, &rhs.a);
    fp_sub_rdc(&mut dest.b, &lhs.b, &rhs.b);
}

/// dest = lhs · rhs in Fp2, Karatsuba over F_p:
/// (a+bi)(c+di) = (ac − bd) + ((b−a)(c−d) + ac + bd)i.
pub fn fp2_mul(dest: &mut Fp2, lhs: &Fp2, rhs: &Fp2) {
    let (a, b) = (&lhs.a, &lhs.b);
    let (c, d) = (&rhs.a, &rhs.b);

    let mut ac: FpX2 = [0; 2 * FP_WORDS];
    let mut bd: FpX2 = [0; 2 * FP_WORDS];
    fp_mul(&mut ac, a, c);
    fp_mul(&mut bd, b, d);

    let mut b_minus_a: Fp = [0; FP_WORDS];
    let mut c_minus_d: Fp = [0; FP_WORDS];
    fp_sub_rdc(&mut b_minus_a, b, a);
    fp_sub_rdc(&mut c_minus_d, c, d);

    let mut ad_plus_bc: FpX2 = [0; 2 * FP_WORDS];
    fp_mul(&mut ad_plus_bc, &b_minus_a, &c_minus_d);
    let tmp = ad_plus_bc;
    fp2_add_wide(&mut ad_plus_bc, &tmp, &ac);
    let tmp = ad_plus_bc;
    fp2_add_wide(&mut ad_plus_bc, &tmp, &bd);
    fp_mont_rdc(&mut dest.b, &ad_plus_bc);

    let mut ac_minus_bd: FpX2 = [0; 2 * FP_WORDS];
    fp2_sub_wide(&mut ac_minus_bd, &ac, &bd);
    fp_mont_rdc(&mut dest.a, &ac_minus_bd);
}

/// dest = x² in Fp2: (a² − b²) + 2ab·i.
pub fn fp2_sqr(dest: &mut Fp2, x: &Fp2) {
    let (a, b) = (&x.a, &x.b);

    let mut a2: Fp = [0; FP_WORDS];
    let mut a_plus_b: Fp = [0; FP_WORDS];
    let mut a_minus_b: Fp = [0; FP_WORDS];
    fp_add_rdc(&mut a2, a, a);
    fp_add_rdc(&mut a_plus_b, a, b);
    fp_sub_rdc(&mut a_minus_b, a, b);

    let mut a2_min_b2: FpX2 = [0; 2 * FP_WORDS];
    let mut ab2: FpX2 = [0; 2 * FP_WORDS];
    fp_mul(&mut a2_min_b2, &a_plus_b, &a_minus_b);
    fp_mul(&mut ab2, &a2, b);
    fp_mont_rdc(&mut dest.a, &a2_min_b2);
    fp_mont_rdc(&mut dest.b, &ab2);
}

/// dest = x⁻¹ in Fp2: conjugate over the norm, with the norm inverted
/// through the p^(3/4) strategy (z⁻¹ = z²·z^((p−3)/4) squared times z).
pub fn fp2_inv(dest: &mut Fp2, x: &Fp2) {
    let (a, b) = (&x.a, &x.b);

    let mut asq: FpX2 = [0; 2 * FP_WORDS];
    let mut bsq: FpX2 = [0; 2 * FP_WORDS];
    fp_mul(&mut asq, a, a);
    fp_mul(&mut bsq, b, b);
    let tmp = asq;
    fp2_add_wide(&mut asq, &tmp, &bsq);

    let mut a2_plus_b2: Fp = [0; FP_WORDS];
    fp_mont_rdc(&mut a2_plus_b2, &asq);

    let mut inv: Fp = a2_plus_b2;
    let tmp = inv;
    fp_mul_rdc(&mut inv, &tmp, &a2_plus_b2);
    let tmp = inv;
    p34(&mut inv, &tmp);
    let tmp = inv;
    fp_mul_rdc(&mut inv, &tmp, &tmp);
    let tmp = inv;
    fp_mul_rdc(&mut inv, &tmp, &a2_plus_b2);

    let mut ac: FpX2 = [0; 2 * FP_WORDS];
    fp_mul(&mut ac, a, &inv);
    fp_mont_rdc(&mut dest.a, &ac);

    let mut minus_b: Fp = [0; FP_WORDS];
    let tmp = minus_b;
    fp_sub_rdc(&mut minus_b, &tmp, b);
    let mut minus_bc: FpX2 = [0; 2 * FP_WORDS];
    fp_mul(&mut minus_bc, &minus_b, &inv);
    fp_mont_rdc(&mut dest.b, &minus_bc);
}

/// Batch inversion of three Fp2 values with two multiplications per
/// output.
pub fn fp2_batch3_inv(x1: &Fp2, x2: &Fp2, x3: &Fp2, y1: &mut Fp2, y2: &mut Fp2, y3: &mut Fp2) {
    let mut x1x2 = Fp2::default();
    let mut t = Fp2::default();

    fp2_mul(&mut x1x2, x1, x2);
    fp2_mul(&mut t, &x1x2, x3);
    let mut inv = Fp2::default();
    fp2_inv(&mut inv, &t);

    let mut tmp2 = Fp2::default();
    fp2_mul(&mut tmp2, &inv, x2);
    fp2_mul(y1, &tmp2, x3);
    fp2_mul(&mut tmp2, &inv, x1);
    fp2_mul(y2, &tmp2, x3);
    fp2_mul(y3, &inv, &x1x2);
}

/// Convert into the Montgomery domain (multiply by R² and reduce).
pub fn to_mont_domain(x: &mut Fp2) {
    let mut wide: FpX2 = [0; 2 * FP_WORDS];
    fp_mul(&mut wide, &x.a, &R2);
    fp_mont_rdc(&mut x.a, &wide);
    fp_mul(&mut wide, &x.b, &R2);
    fp_mont_rdc(&mut x.b, &wide);
}

/// Convert out of the Montgomery domain and strongly reduce.
pub fn from_mont_domain(x: &Fp2, out: &mut Fp2) {
    let mut wide: FpX2 = [0; 2 * FP_WORDS];
    wide[..FP_WORDS].copy_from_slice(&x.a);
    wide[FP_WORDS..].fill(0);
    fp_mont_rdc(&mut out.a, &wide);
    fp_rdc_p(&mut out.a);

    wide[..FP_WORDS].copy_from_slice(&x.b);
    wide[FP_WORDS..].fill(0);
    fp_mont_rdc(&mut out.b, &wide);
    fp_rdc_p(&mut out.b);
}

/// Zero both components through ordinary stores; key material proper
/// is zeroized at the KEM layer.
pub fn fp2_zeroize(x: &mut Fp2) {
    x.a = [0; FP_WORDS];
    x.b = [0; FP_WORDS];
}

#[cfg(test)]
mod tests {
    use super::super::params::ONE;
    use super::*;

    fn fp2_from_small(v: u64) -> Fp2 {
        let mut x = Fp2::default();
        x.a[0] = v;
        to_mont_domain(&mut x);
        x
    }

    fn fp2_equal_normalized(x: &Fp2, y: &Fp2) -> bool {
        let mut xn = Fp2::default();
        let mut yn = Fp2::default();
        from_mont_domain(x, &mut xn);
        from_mont_domain(y, &mut yn);
        xn.a == yn.a && xn.b == yn.b
    }

    #[test]
    fn test_mont_one() {
        // ONE is R mod p; leaving the Montgomery domain yields 1.
        let mut out = Fp2::default();
        from_mont_domain(&ONE, &mut out);
        assert_eq!(out.a[0], 1);
        assert!(out.a[1..].iter().all(|&w| w == 0));
        assert!(out.b.iter().all(|&w| w == 0));
    }

    #[test]
    fn test_mul_identity() {
        let x = fp2_from_small(123456789);
        let mut y = Fp2::default();
        fp2_mul(&mut y, &x, &ONE);
        assert!(fp2_equal_normalized(&x, &y));
    }

    #[test]
    fn test_small_arithmetic() {
        let three = fp2_from_small(3);
        let five = fp2_from_small(5);
        let fifteen = fp2_from_small(15);
        let eight = fp2_from_small(8);

        let mut prod = Fp2::default();
        fp2_mul(&mut prod, &three, &five);
        assert!(fp2_equal_normalized(&prod, &fifteen));

        let mut sum = Fp2::default();
        fp2_add(&mut sum, &three, &five);
        assert!(fp2_equal_normalized(&sum, &eight));

        let mut sq = Fp2::default();
        fp2_sqr(&mut sq, &three);
        let nine = fp2_from_small(9);
        assert!(fp2_equal_normalized(&sq, &nine));
    }

    #[test]
    fn test_i_squared_is_minus_one() {
        let mut i_elem = Fp2::default();
        i_elem.b = ONE.a;

        let mut sq = Fp2::default();
        fp2_sqr(&mut sq, &i_elem);

        let mut minus_one = Fp2::default();
        let zero = Fp2::default();
        fp2_sub(&mut minus_one, &zero, &ONE);
        assert!(fp2_equal_normalized(&sq, &minus_one));
    }

    #[test]
    fn test_inversion() {
        let x = fp2_from_small(0xdeadbeef);
        let mut inv = Fp2::default();
        fp2_inv(&mut inv, &x);
        let mut prod = Fp2::default();
        fp2_mul(&mut prod, &x, &inv);
        assert!(fp2_equal_normalized(&prod, &ONE));
    }

    #[test]
    fn test_inversion_with_imaginary_part() {
        let mut x = fp2_from_small(77);
        x.b = fp2_from_small(12345).a;
        let mut inv = Fp2::default();
        fp2_inv(&mut inv, &x);
        let mut prod = Fp2::default();
        fp2_mul(&mut prod, &x, &inv);
        assert!(fp2_equal_normalized(&prod, &ONE));
    }

    #[test]
    fn test_batch_inv_matches_single() {
        let x1 = fp2_from_small(101);
        let x2 = fp2_from_small(202);
        let x3 = fp2_from_small(303);
        let mut y1 = Fp2::default();
        let mut y2 = Fp2::default();
        let mut y3 = Fp2::default();
        fp2_batch3_inv(&x1, &x2, &x3, &mut y1, &mut y2, &mut y3);

        let mut single = Fp2::default();
        fp2_inv(&mut single, &x2);
        assert!(fp2_equal_normalized(&y2, &single));
    }
}
