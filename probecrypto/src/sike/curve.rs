//! x-only Montgomery curve arithmetic for SIDH: point doubling and
//! tripling ladders, 3- and 4-isogeny computation and evaluation,
//! coefficient recovery and the j-invariant.
//!
//! Points live on the Kummer line as (X : Z). Curve coefficients are
//! kept projectively as (A : C); the doubling and tripling loops take
//! the equivalent forms (A+2C : 4C) and (A+2C : A−2C) respectively.

use super::fp::{
    fp2_add, fp2_inv, fp2_mul, fp2_sqr, fp2_sub, fp_swap_cond, Fp2,
};
use super::params::ONE;

/// Point on the Kummer line.
#[derive(Clone, Copy, Default)]
pub struct ProjectivePoint {
    pub x: Fp2,
    pub z: Fp2,
}

/// Projective curve coefficients (A : C).
#[derive(Clone, Copy, Default)]
pub struct ProjectiveCurveParameters {
    pub a: Fp2,
    pub c: Fp2,
}

/// Context-dependent equivalent coefficients: (A+2C : 4C) for the
/// 2-power tower, (A+2C : A−2C) for the 3-power tower.
#[derive(Clone, Copy, Default)]
pub struct CurveCoefficientsEquiv {
    pub a: Fp2,
    pub c: Fp2,
}

pub fn calc_curve_params_equiv4(cparams: &ProjectiveCurveParameters) -> CurveCoefficientsEquiv {
    let mut coef = CurveCoefficientsEquiv::default();
    fp2_add(&mut coef.c, &cparams.c, &cparams.c);
    let two_c = coef.c;
    fp2_add(&mut coef.a, &cparams.a, &two_c);
    fp2_add(&mut coef.c, &two_c, &two_c);
    coef
}

pub fn calc_curve_params_equiv3(cparams: &ProjectiveCurveParameters) -> CurveCoefficientsEquiv {
    let mut coef = CurveCoefficientsEquiv::default();
    let mut c2 = Fp2::default();
    fp2_add(&mut c2, &cparams.c, &cparams.c);
    fp2_add(&mut coef.a, &cparams.a, &c2);
    fp2_sub(&mut coef.c, &cparams.a, &c2);
    coef
}

/// Recover (A : C) from the tripling form (A+2C : A−2C).
pub fn recover_curve_coefficients3(
    cparams: &mut ProjectiveCurveParameters,
    coef_eq: &CurveCoefficientsEquiv,
) {
    use super::params::HALF;
    fp2_add(&mut cparams.a, &coef_eq.a, &coef_eq.c);
    let t = cparams.a;
    fp2_mul(&mut cparams.a, &t, &HALF);
    fp2_sub(&mut cparams.c, &coef_eq.a, &coef_eq.c);
    let t = cparams.c;
    fp2_mul(&mut cparams.c, &t, &HALF);
    let t = cparams.c;
    fp2_mul(&mut cparams.c, &t, &HALF);
}

/// Recover (A : C) from the doubling form (A+2C : 4C).
pub fn recover_curve_coefficients4(
    cparams: &mut ProjectiveCurveParameters,
    coef_eq: &CurveCoefficientsEquiv,
) {
    use super::params::HALF;
    fp2_mul(&mut cparams.c, &coef_eq.c, &HALF);
    let t = cparams.c;
    fp2_mul(&mut cparams.c, &t, &HALF);
    let mut two_c = Fp2::default();
    fp2_add(&mut two_c, &cparams.c, &cparams.c);
    fp2_sub(&mut cparams.a, &coef_eq.a, &two_c);
}

/// Recover the affine A coefficient of the curve through the affine
/// x-coordinates of P, Q and Q−P.
pub fn recover_coordinate_a(
    cparams: &mut ProjectiveCurveParameters,
    xp: &Fp2,
    xq: &Fp2,
    xr: &Fp2,
) {
    let mut t0 = Fp2::default();
    let mut t1 = Fp2::default();

    fp2_add(&mut t1, xp, xq);
    fp2_mul(&mut t0, xp, xq);
    fp2_mul(&mut cparams.a, xr, &t1);
    let t = cparams.a;
    fp2_add(&mut cparams.a, &t0, &t);
    let t = t0;
    fp2_mul(&mut t0, &t, xr);
    let t = cparams.a;
    fp2_sub(&mut cparams.a, &t, &ONE);
    let t = t0;
    fp2_add(&mut t0, &t, &t);
    let t = t1;
    fp2_add(&mut t1, &t, xr);
    let t = t0;
    fp2_add(&mut t0, &t, &t);
    let t = cparams.a;
    fp2_sqr(&mut cparams.a, &t);
    let t = t0;
    fp2_inv(&mut t0, &t);
    let t = cparams.a;
    fp2_mul(&mut cparams.a, &t, &t0);
    let t = cparams.a;
    fp2_sub(&mut cparams.a, &t, &t1);
}

/// Repeated x-only doubling with coefficients (A+2C : 4C).
pub fn pow2k(p: &mut ProjectivePoint, params: &CurveCoefficientsEquiv, k: u32) {
    let mut t0 = Fp2::default();
    let mut t1 = Fp2::default();

    for _ in 0..k {
        fp2_sub(&mut t0, &p.x, &p.z);
        fp2_add(&mut t1, &p.x, &p.z);
        let t = t0;
        fp2_sqr(&mut t0, &t);
        let t = t1;
        fp2_sqr(&mut t1, &t);
        fp2_mul(&mut p.z, &params.c, &t0);
        fp2_mul(&mut p.x, &p.z.clone(), &t1);
        let t = t1;
        fp2_sub(&mut t1, &t, &t0);
        fp2_mul(&mut t0, &params.a, &t1);
        let t = p.z;
        fp2_add(&mut p.z, &t, &t0);
        let t = p.z;
        fp2_mul(&mut p.z, &t, &t1);
    }
}

/// Repeated x-only tripling with coefficients (A+2C : A−2C).
pub fn pow3k(p: &mut ProjectivePoint, params: &CurveCoefficientsEquiv, k: u32) {
    let mut t0 = Fp2::default();
    let mut t1 = Fp2::default();
    let mut t2 = Fp2::default();
    let mut t3 = Fp2::default();
    let mut t4 = Fp2::default();
    let mut t5 = Fp2::default();
    let mut t6 = Fp2::default();

    for _ in 0..k {
        fp2_sub(&mut t0, &p.x, &p.z);
        fp2_sqr(&mut t2, &t0);
        fp2_add(&mut t1, &p.x, &p.z);
        fp2_sqr(&mut t3, &t1);
        fp2_add(&mut t4, &t1, &t0);
        let t = t0;
        fp2_sub(&mut t0, &t1, &t);
        fp2_sqr(&mut t1, &t4);
        let t = t1;
        fp2_sub(&mut t1, &t, &t3);
        let t = t1;
        fp2_sub(&mut t1, &t, &t2);
        fp2_mul(&mut t5, &t3, &params.a);
        let t = t3;
        fp2_mul(&mut t3, &t5, &t);
        fp2_mul(&mut t6, &t2, &params.c);
        let t = t2;
        fp2_mul(&mut t2, &t, &t6);
        let t = t3;
        fp2_sub(&mut t3, &t2, &t);
        fp2_sub(&mut t2, &t5, &t6);
        let t = t1;
        fp2_mul(&mut t1, &t2, &t);
        fp2_add(&mut t2, &t3, &t1);
        let t = t2;
        fp2_sqr(&mut t2, &t);
        fp2_mul(&mut p.x, &t2, &t4);
        let t = t1;
        fp2_sub(&mut t1, &t3, &t);
        let t = t1;
        fp2_sqr(&mut t1, &t);
        fp2_mul(&mut p.z, &t1, &t0);
    }
}

/// Combined doubling of P and differential addition of Q with respect
/// to Q−P; a24 is the affine (A+2C)/4C.
fn x_dbl_add(
    p: &ProjectivePoint,
    q: &ProjectivePoint,
    q_minus_p: &ProjectivePoint,
    a24: &Fp2,
) -> (ProjectivePoint, ProjectivePoint) {
    let mut t0 = Fp2::default();
    let mut t1 = Fp2::default();
    let mut t2 = Fp2::default();
    let mut dbl_p = ProjectivePoint::default();
    let mut p_add_q = ProjectivePoint::default();

    fp2_add(&mut t0, &p.x, &p.z);
    fp2_sub(&mut t1, &p.x, &p.z);
    fp2_sqr(&mut dbl_p.x, &t0);
    fp2_sub(&mut t2, &q.x, &q.z);
    fp2_add(&mut p_add_q.x, &q.x, &q.z);
    let t = t0;
    fp2_mul(&mut t0, &t, &t2);
    fp2_sqr(&mut dbl_p.z, &t1);
    let t = t1;
    fp2_mul(&mut t1, &t, &p_add_q.x.clone());
    fp2_sub(&mut t2, &dbl_p.x, &dbl_p.z);
    let t = dbl_p.x;
    fp2_mul(&mut dbl_p.x, &t, &dbl_p.z.clone());
    fp2_mul(&mut p_add_q.x, a24, &t2);
    fp2_sub(&mut p_add_q.z, &t0, &t1);
    let t = dbl_p.z;
    fp2_add(&mut dbl_p.z, &p_add_q.x, &t);
    fp2_add(&mut p_add_q.x, &t0, &t1);
    let t = dbl_p.z;
    fp2_mul(&mut dbl_p.z, &t, &t2);
    let t = p_add_q.z;
    fp2_sqr(&mut p_add_q.z, &t);
    let t = p_add_q.x;
    fp2_sqr(&mut p_add_q.x, &t);
    let t = p_add_q.z;
    fp2_mul(&mut p_add_q.z, &q_minus_p.x, &t);
    let t = p_add_q.x;
    fp2_mul(&mut p_add_q.x, &q_minus_p.z, &t);

    (dbl_p, p_add_q)
}

fn cond_swap_points(p: &mut ProjectivePoint, q: &mut ProjectivePoint, choice: u8) {
    for i in 0..2 {
        let (px, qx) = if i == 0 {
            (&mut p.x, &mut q.x)
        } else {
            (&mut p.z, &mut q.z)
        };
        fp_swap_cond(&mut px.a, &mut qx.a, choice);
        fp_swap_cond(&mut px.b, &mut qx.b, choice);
    }
}

/// The right-to-left 3-point ladder: x(P + [scalar]Q) from x(P), x(Q)
/// and x(Q−P). Constant time in the scalar.
pub fn scalar_mul_3pt(
    cparams: &ProjectiveCurveParameters,
    p: &ProjectivePoint,
    q: &ProjectivePoint,
    q_minus_p: &ProjectivePoint,
    nbits: usize,
    scalar: &[u8],
) -> ProjectivePoint {
    // a24 = (A+2C)/4C, affine.
    let mut two_c = Fp2::default();
    fp2_add(&mut two_c, &cparams.c, &cparams.c);
    let mut a24 = Fp2::default();
    fp2_add(&mut a24, &cparams.a, &two_c);
    let mut four_c = Fp2::default();
    fp2_add(&mut four_c, &two_c, &two_c);
    let mut inv4c = Fp2::default();
    fp2_inv(&mut inv4c, &four_c);
    let t = a24;
    fp2_mul(&mut a24, &t, &inv4c);

    let mut r1 = *p;
    let mut r2 = *q_minus_p;
    let mut r0 = *q;

    let mut prev_bit = 0u8;
    for i in 0..nbits {
        let bit = (scalar[i >> 3] >> (i & 7)) & 1;
        cond_swap_points(&mut r1, &mut r2, prev_bit ^ bit);
        prev_bit = bit;
        let (dbl, sum) = x_dbl_add(&r0, &r2, &r1, &a24);
        r0 = dbl;
        r2 = sum;
    }
    cond_swap_points(&mut r1, &mut r2, prev_bit);
    r1
}

/// 4-isogeny defined by a kernel point of exact order 4.
#[derive(Default)]
pub struct Isogeny4 {
    k1: Fp2,
    k2: Fp2,
    k3: Fp2,
}

impl Isogeny4 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the image-curve coefficients (A+2C : 4C) and retain the
    /// kernel products for point evaluation.
    pub fn generate_curve(&mut self, p: &ProjectivePoint) -> CurveCoefficientsEquiv {
        let mut coef = CurveCoefficientsEquiv::default();

        fp2_sub(&mut self.k2, &p.x, &p.z);
        fp2_add(&mut self.k3, &p.x, &p.z);
        fp2_sqr(&mut self.k1, &p.z);
        let t = self.k1;
        fp2_add(&mut self.k1, &t, &t);
        fp2_sqr(&mut coef.c, &self.k1);
        let t = self.k1;
        fp2_add(&mut self.k1, &t, &t);
        fp2_sqr(&mut coef.a, &p.x);
        let t = coef.a;
        fp2_add(&mut coef.a, &t, &t);
        let t = coef.a;
        fp2_sqr(&mut coef.a, &t);
        coef
    }

    /// Push a point through the isogeny.
    pub fn evaluate_point(&self, p: &ProjectivePoint) -> ProjectivePoint {
        let mut t0 = Fp2::default();
        let mut t1 = Fp2::default();
        let mut q = ProjectivePoint::default();

        fp2_add(&mut t0, &p.x, &p.z);
        fp2_sub(&mut t1, &p.x, &p.z);
        fp2_mul(&mut q.x, &t0, &self.k2);
        fp2_mul(&mut q.z, &t1, &self.k3);
        let t = t0;
        fp2_mul(&mut t0, &t, &t1);
        let t = t0;
        fp2_mul(&mut t0, &t, &self.k1);
        fp2_add(&mut t1, &q.x, &q.z);
        let t = q.z;
        fp2_sub(&mut q.z, &q.x, &t);
        let t = t1;
        fp2_sqr(&mut t1, &t);
        let t = q.z;
        fp2_sqr(&mut q.z, &t);
        fp2_add(&mut q.x, &t0, &t1);
        let t = t0;
        fp2_sub(&mut t0, &q.z, &t);
        let t = q.x;
        fp2_mul(&mut q.x, &t, &t1);
        let t = q.z;
        fp2_mul(&mut q.z, &t, &t0);
        q
    }
}

/// 3-isogeny defined by a kernel point of exact order 3.
#[derive(Default)]
pub struct Isogeny3 {
    k1: Fp2,
    k2: Fp2,
}

impl Isogeny3 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the image-curve coefficients (A+2C : A−2C).
    pub fn generate_curve(&mut self, p: &ProjectivePoint) -> CurveCoefficientsEquiv {
        let mut t0 = Fp2::default();
        let mut t1 = Fp2::default();
        let mut t2 = Fp2::default();
        let mut t3 = Fp2::default();
        let mut t4 = Fp2::default();
        let mut coef = CurveCoefficientsEquiv::default();

        fp2_sub(&mut self.k1, &p.x, &p.z);
        fp2_sqr(&mut t0, &self.k1);
        fp2_add(&mut self.k2, &p.x, &p.z);
        fp2_sqr(&mut t1, &self.k2);
        fp2_add(&mut t2, &t0, &t1);
        fp2_add(&mut t3, &self.k1, &self.k2);
        let t = t3;
        fp2_sqr(&mut t3, &t);
        let t = t3;
        fp2_sub(&mut t3, &t, &t2);
        fp2_add(&mut t2, &t1, &t3);
        let t = t3;
        fp2_add(&mut t3, &t, &t0);
        fp2_add(&mut t4, &t3, &t0);
        let t = t4;
        fp2_add(&mut t4, &t, &t);
        let t = t4;
        fp2_add(&mut t4, &t1, &t);
        fp2_mul(&mut coef.c, &t2, &t4);
        fp2_add(&mut t4, &t1, &t2);
        let t = t4;
        fp2_add(&mut t4, &t, &t);
        let t = t4;
        fp2_add(&mut t4, &t0, &t);
        let t = t4;
        fp2_mul(&mut t4, &t3, &t);
        fp2_sub(&mut t0, &t4, &coef.c);
        fp2_add(&mut coef.a, &coef.c, &t0);
        coef
    }

    /// Push a point through the isogeny.
    pub fn evaluate_point(&self, p: &ProjectivePoint) -> ProjectivePoint {
        let mut t0 = Fp2::default();
        let mut t1 = Fp2::default();
        let mut t2 = Fp2::default();
        let mut q = ProjectivePoint::default();

        fp2_add(&mut t0, &p.x, &p.z);
        fp2_sub(&mut t1, &p.x, &p.z);
        let t = t0;
        fp2_mul(&mut t0, &self.k1, &t);
        let t = t1;
        fp2_mul(&mut t1, &self.k2, &t);
        fp2_add(&mut t2, &t0, &t1);
        let t = t0;
        fp2_sub(&mut t0, &t1, &t);
        let t = t2;
        fp2_sqr(&mut t2, &t);
        let t = t0;
        fp2_sqr(&mut t0, &t);
        fp2_mul(&mut q.x, &p.x, &t2);
        fp2_mul(&mut q.z, &p.z, &t0);
        q
    }
}

/// j-invariant of the curve, j = 256(A²−3C²)³ / (C⁴(A²−4C²)).
pub fn j_invariant(cparams: &ProjectiveCurveParameters, j: &mut Fp2) {
    let mut t0 = Fp2::default();
    let mut t1 = Fp2::default();

    fp2_sqr(j, &cparams.a);
    fp2_sqr(&mut t1, &cparams.c);
    fp2_add(&mut t0, &t1, &t1);
    let t = t0;
    fp2_sub(&mut t0, &j.clone(), &t);
    let t = t0;
    fp2_sub(&mut t0, &t, &t1);
    fp2_sub(j, &t0, &t1);
    let t = t1;
    fp2_sqr(&mut t1, &t);
    let t = j.clone();
    fp2_mul(j, &t, &t1);
    let t = t0;
    fp2_add(&mut t0, &t, &t);
    let t = t0;
    fp2_add(&mut t0, &t, &t);
    fp2_sqr(&mut t1, &t0);
    let t = t0;
    fp2_mul(&mut t0, &t, &t1);
    let t = t0;
    fp2_add(&mut t0, &t, &t);
    let t = t0;
    fp2_add(&mut t0, &t, &t);
    let t = j.clone();
    fp2_inv(j, &t);
    let t = j.clone();
    fp2_mul(j, &t0, &t);
}
