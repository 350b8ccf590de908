//! SIKE/p434 KEM: SIDH key generation and derivation over the 2- and
//! 3-isogeny towers, wrapped with the Fujisaki-Okamoto transform.
//!
//! Decapsulation re-encapsulates and compares ciphertexts in constant
//! time; on mismatch the stored random value S replaces the message in
//! the final hash, so failure is indistinguishable by timing.

pub mod curve;
pub mod fp;
pub mod params;

use rand::RngCore;
use sha2::{Digest, Sha256};

use curve::{
    calc_curve_params_equiv3, calc_curve_params_equiv4, j_invariant, pow2k, pow3k,
    recover_coordinate_a, recover_curve_coefficients3, recover_curve_coefficients4,
    scalar_mul_3pt, Isogeny3, Isogeny4, ProjectiveCurveParameters, ProjectivePoint,
};
use fp::{fp2_batch3_inv, fp2_mul, from_mont_domain, to_mont_domain, Fp2};
use params::{
    DomainParams, CIPHERTEXT_SIZE, DOMAIN_A, DOMAIN_B, FP_BYTES, KEM_SIZE, MSG_LEN, ONE,
    PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE, SIX,
};

pub use params::{
    CIPHERTEXT_SIZE as SIKE_CIPHERTEXT_SIZE, KEM_SIZE as SIKE_KEM_SIZE,
    PUBLIC_KEY_SIZE as SIKE_PUBLIC_KEY_SIZE,
};

/// Which torsion tower a key walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyVariant {
    SidhA,
    SidhB,
    Sike,
}

impl KeyVariant {
    fn domain(self) -> &'static DomainParams {
        match self {
            KeyVariant::SidhA => &DOMAIN_A,
            KeyVariant::SidhB | KeyVariant::Sike => &DOMAIN_B,
        }
    }

    fn is_a(self) -> bool {
        matches!(self, KeyVariant::SidhA)
    }
}

/// The starting curve y² = x³ + 6x² + x as projective parameters.
fn init_curve() -> ProjectiveCurveParameters {
    ProjectiveCurveParameters { a: SIX, c: ONE }
}

/// Serialize an Fp2 as a ‖ b, little-endian, leaving Montgomery form.
fn fp2_to_bytes(output: &mut [u8], value: &Fp2) {
    assert!(output.len() >= 2 * FP_BYTES);
    let mut plain = Fp2::default();
    from_mont_domain(value, &mut plain);

    for i in 0..FP_BYTES {
        output[i] = (plain.a[i / 8] >> (8 * (i % 8))) as u8;
        output[i + FP_BYTES] = (plain.b[i / 8] >> (8 * (i % 8))) as u8;
    }
}

/// Inverse of `fp2_to_bytes`; enters Montgomery form.
fn fp2_from_bytes(value: &mut Fp2, input: &[u8]) {
    assert!(input.len() >= 2 * FP_BYTES);
    *value = Fp2::default();
    for i in 0..FP_BYTES {
        value.a[i / 8] |= (input[i] as u64) << (8 * (i % 8));
        value.b[i / 8] |= (input[i + FP_BYTES] as u64) << (8 * (i % 8));
    }
    to_mont_domain(value);
}

/// SIDH/SIKE public key: the x-coordinates of φ(P), φ(Q), φ(Q−P).
#[derive(Clone)]
pub struct PublicKey {
    variant: KeyVariant,
    affine_xp: Fp2,
    affine_xq: Fp2,
    affine_xqmp: Fp2,
}

impl PublicKey {
    pub fn new(variant: KeyVariant) -> Self {
        Self {
            variant,
            affine_xp: Fp2::default(),
            affine_xq: Fp2::default(),
            affine_xqmp: Fp2::default(),
        }
    }

    /// Import from the 330-byte wire encoding. No validation beyond
    /// length is performed.
    pub fn import(&mut self, input: &[u8]) -> Result<(), &'static str> {
        if input.len() != PUBLIC_KEY_SIZE {
            return Err("sike: wrong public key length");
        }
        self.affine_xp = Fp2::default();
        self.affine_xq = Fp2::default();
        self.affine_xqmp = Fp2::default();
        fp2_from_bytes(&mut self.affine_xp, &input[0..SHARED_SECRET_SIZE]);
        fp2_from_bytes(
            &mut self.affine_xq,
            &input[SHARED_SECRET_SIZE..2 * SHARED_SECRET_SIZE],
        );
        fp2_from_bytes(
            &mut self.affine_xqmp,
            &input[2 * SHARED_SECRET_SIZE..3 * SHARED_SECRET_SIZE],
        );
        Ok(())
    }

    pub fn export(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut output = [0u8; PUBLIC_KEY_SIZE];
        fp2_to_bytes(&mut output[0..SHARED_SECRET_SIZE], &self.affine_xp);
        fp2_to_bytes(
            &mut output[SHARED_SECRET_SIZE..2 * SHARED_SECRET_SIZE],
            &self.affine_xq,
        );
        fp2_to_bytes(
            &mut output[2 * SHARED_SECRET_SIZE..3 * SHARED_SECRET_SIZE],
            &self.affine_xqmp,
        );
        output
    }
}

/// SIDH/SIKE private key: the ladder scalar, plus the FO fallback
/// value S for the SIKE variant.
#[derive(Clone)]
pub struct PrivateKey {
    variant: KeyVariant,
    pub scalar: Vec<u8>,
    pub s: Vec<u8>,
}

impl PrivateKey {
    pub fn new(variant: KeyVariant) -> Self {
        let scalar = vec![0u8; variant.domain().secret_byte_len];
        let s = if variant == KeyVariant::Sike {
            vec![0u8; MSG_LEN]
        } else {
            Vec::new()
        };
        Self { variant, scalar, s }
    }

    /// Sample a fresh private key from the RNG, masking the scalar into
    /// the tower's key space.
    pub fn generate(&mut self, rng: &mut dyn RngCore) {
        let dp = self.variant.domain();
        if self.variant == KeyVariant::Sike {
            rng.fill_bytes(&mut self.s);
        }
        rng.fill_bytes(&mut self.scalar);

        let last = self.scalar.len() - 1;
        let rem = dp.secret_bit_len % 8;
        self.scalar[last] &= (1u8 << rem).wrapping_sub(1);
        if rem >= 1 {
            self.scalar[last] |= 1 << (rem - 1);
        }
    }

    /// Import S ‖ scalar (SIKE) or just the scalar (SIDH).
    pub fn import(&mut self, input: &[u8]) -> Result<(), &'static str> {
        if input.len() != self.s.len() + self.scalar.len() {
            return Err("sike: wrong private key length");
        }
        let s_len = self.s.len();
        self.s.copy_from_slice(&input[..s_len]);
        self.scalar.copy_from_slice(&input[s_len..]);
        Ok(())
    }

    pub fn export(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.s.len() + self.scalar.len());
        out.extend_from_slice(&self.s);
        out.extend_from_slice(&self.scalar);
        out
    }

    /// Derive the public key by walking the isogeny tree. Constant
    /// time in the scalar.
    pub fn public_key(&self) -> PublicKey {
        if self.variant.is_a() {
            public_key_gen_a(self)
        } else {
            public_key_gen_b(self)
        }
    }
}

/// Strategy-driven traversal of the 4-isogeny tree; `extra` points are
/// pushed through every isogeny (used during key generation).
fn traverse_tree_a(
    curve: &ProjectiveCurveParameters,
    xr: &mut ProjectivePoint,
    mut extra: Option<&mut [ProjectivePoint; 3]>,
) {
    let strat = DOMAIN_A.strategy;
    let strat_sz = strat.len();
    let mut points: Vec<ProjectivePoint> = Vec::with_capacity(8);
    let mut indices: Vec<usize> = Vec::with_capacity(8);
    let mut i = 0usize;
    let mut sidx = 0usize;

    let mut cparam = calc_curve_params_equiv4(curve);
    let mut phi = Isogeny4::new();

    for j in 1..=strat_sz {
        while i <= strat_sz - j {
            points.push(*xr);
            indices.push(i);
            let k = strat[sidx];
            sidx += 1;
            pow2k(xr, &cparam, 2 * k);
            i += k as usize;
        }

        cparam = phi.generate_curve(xr);
        for point in points.iter_mut() {
            *point = phi.evaluate_point(point);
        }
        if let Some(pts) = extra.as_deref_mut() {
            for point in pts.iter_mut() {
                *point = phi.evaluate_point(point);
            }
        }

        *xr = points.pop().unwrap();
        i = indices.pop().unwrap();
    }
}

/// Strategy-driven traversal of the 3-isogeny tree.
fn traverse_tree_b(
    curve: &ProjectiveCurveParameters,
    xr: &mut ProjectivePoint,
    mut extra: Option<&mut [ProjectivePoint; 3]>,
) {
    let strat = DOMAIN_B.strategy;
    let strat_sz = strat.len();
    let mut points: Vec<ProjectivePoint> = Vec::with_capacity(8);
    let mut indices: Vec<usize> = Vec::with_capacity(8);
    let mut i = 0usize;
    let mut sidx = 0usize;

    let mut cparam = calc_curve_params_equiv3(curve);
    let mut phi = Isogeny3::new();

    for j in 1..=strat_sz {
        while i <= strat_sz - j {
            points.push(*xr);
            indices.push(i);
            let k = strat[sidx];
            sidx += 1;
            pow3k(xr, &cparam, k);
            i += k as usize;
        }

        cparam = phi.generate_curve(xr);
        for point in points.iter_mut() {
            *point = phi.evaluate_point(point);
        }
        if let Some(pts) = extra.as_deref_mut() {
            for point in pts.iter_mut() {
                *point = phi.evaluate_point(point);
            }
        }

        *xr = points.pop().unwrap();
        i = indices.pop().unwrap();
    }
}

fn public_key_gen_a(prv: &PrivateKey) -> PublicKey {
    let mut pub_key = PublicKey::new(KeyVariant::SidhA);
    let init = init_curve();

    let xpa = ProjectivePoint { x: DOMAIN_A.affine_p, z: ONE };
    let xqa = ProjectivePoint { x: DOMAIN_A.affine_q, z: ONE };
    let xra = ProjectivePoint { x: DOMAIN_A.affine_r, z: ONE };

    let mut opposite = [
        ProjectivePoint { x: DOMAIN_B.affine_p, z: ONE },
        ProjectivePoint { x: DOMAIN_B.affine_q, z: ONE },
        ProjectivePoint { x: DOMAIN_B.affine_r, z: ONE },
    ];

    let mut xk = scalar_mul_3pt(
        &init,
        &xpa,
        &xqa,
        &xra,
        DOMAIN_A.secret_bit_len,
        &prv.scalar,
    );
    traverse_tree_a(&init, &mut xk, Some(&mut opposite));

    let mut phi = Isogeny4::new();
    phi.generate_curve(&xk);
    let ev: Vec<ProjectivePoint> = opposite.iter().map(|p| phi.evaluate_point(p)).collect();

    let mut inv_zp = Fp2::default();
    let mut inv_zq = Fp2::default();
    let mut inv_zr = Fp2::default();
    fp2_batch3_inv(&ev[0].z, &ev[1].z, &ev[2].z, &mut inv_zp, &mut inv_zq, &mut inv_zr);

    fp2_mul(&mut pub_key.affine_xp, &ev[0].x, &inv_zp);
    fp2_mul(&mut pub_key.affine_xq, &ev[1].x, &inv_zq);
    fp2_mul(&mut pub_key.affine_xqmp, &ev[2].x, &inv_zr);
    pub_key
}

fn public_key_gen_b(prv: &PrivateKey) -> PublicKey {
    let mut pub_key = PublicKey::new(prv.variant);
    let init = init_curve();

    let xpb = ProjectivePoint { x: DOMAIN_B.affine_p, z: ONE };
    let xqb = ProjectivePoint { x: DOMAIN_B.affine_q, z: ONE };
    let xrb = ProjectivePoint { x: DOMAIN_B.affine_r, z: ONE };

    let mut opposite = [
        ProjectivePoint { x: DOMAIN_A.affine_p, z: ONE },
        ProjectivePoint { x: DOMAIN_A.affine_q, z: ONE },
        ProjectivePoint { x: DOMAIN_A.affine_r, z: ONE },
    ];

    let mut xk = scalar_mul_3pt(
        &init,
        &xpb,
        &xqb,
        &xrb,
        DOMAIN_B.secret_bit_len,
        &prv.scalar,
    );
    traverse_tree_b(&init, &mut xk, Some(&mut opposite));

    let mut phi = Isogeny3::new();
    phi.generate_curve(&xk);
    let ev: Vec<ProjectivePoint> = opposite.iter().map(|p| phi.evaluate_point(p)).collect();

    let mut inv_zp = Fp2::default();
    let mut inv_zq = Fp2::default();
    let mut inv_zr = Fp2::default();
    fp2_batch3_inv(&ev[0].z, &ev[1].z, &ev[2].z, &mut inv_zp, &mut inv_zq, &mut inv_zr);

    fp2_mul(&mut pub_key.affine_xp, &ev[0].x, &inv_zp);
    fp2_mul(&mut pub_key.affine_xq, &ev[1].x, &inv_zq);
    fp2_mul(&mut pub_key.affine_xqmp, &ev[2].x, &inv_zr);
    pub_key
}

/// SIDH shared secret: the j-invariant of the final image curve.
pub fn derive_secret(prv: &PrivateKey, pub_key: &PublicKey) -> Result<Vec<u8>, &'static str> {
    if prv.variant == pub_key.variant
        || (prv.variant == KeyVariant::Sike && pub_key.variant == KeyVariant::SidhB)
    {
        return Err("sike: key variants must differ");
    }

    let mut cparam = ProjectiveCurveParameters::default();
    recover_coordinate_a(
        &mut cparam,
        &pub_key.affine_xp,
        &pub_key.affine_xq,
        &pub_key.affine_xqmp,
    );
    cparam.c = ONE;

    let xp = ProjectivePoint { x: pub_key.affine_xp, z: ONE };
    let xq = ProjectivePoint { x: pub_key.affine_xq, z: ONE };
    let xqmp = ProjectivePoint { x: pub_key.affine_xqmp, z: ONE };

    let dp = prv.variant.domain();
    let mut xk = scalar_mul_3pt(&cparam, &xp, &xq, &xqmp, dp.secret_bit_len, &prv.scalar);

    let mut j_inv = Fp2::default();
    if prv.variant.is_a() {
        traverse_tree_a(&cparam, &mut xk, None);
        let mut phi = Isogeny4::new();
        let coef = phi.generate_curve(&xk);
        recover_curve_coefficients4(&mut cparam, &coef);
    } else {
        traverse_tree_b(&cparam, &mut xk, None);
        let mut phi = Isogeny3::new();
        let coef = phi.generate_curve(&xk);
        recover_curve_coefficients3(&mut cparam, &coef);
    }
    j_invariant(&cparam, &mut j_inv);

    let mut shared = vec![0u8; SHARED_SECRET_SIZE];
    fp2_to_bytes(&mut shared, &j_inv);
    Ok(shared)
}

/// Internal PKE encryption: ciphertext = pkA ‖ (SHA-256(j) ⊕ ptext).
fn encrypt_with(
    sk_a: &PrivateKey,
    pk_a: &PublicKey,
    pk_b: &PublicKey,
    ptext: &[u8],
) -> Result<Vec<u8>, &'static str> {
    if pk_b.variant != KeyVariant::Sike {
        return Err("sike: wrong key type");
    }
    if ptext.len() != KEM_SIZE {
        return Err("sike: wrong message length");
    }

    let j = derive_secret(sk_a, pk_b)?;
    let mut digest: [u8; 32] = Sha256::digest(&j).into();
    for (d, p) in digest.iter_mut().zip(ptext.iter()) {
        *d ^= p;
    }

    let mut out = Vec::with_capacity(CIPHERTEXT_SIZE);
    out.extend_from_slice(&pk_a.export());
    out.extend_from_slice(&digest[..KEM_SIZE]);
    Ok(out)
}

/// Internal PKE decryption.
fn decrypt_with(prv: &PrivateKey, ctext: &[u8]) -> Result<[u8; MSG_LEN], &'static str> {
    if prv.variant != KeyVariant::Sike {
        return Err("sike: wrong key type");
    }
    if ctext.len() != CIPHERTEXT_SIZE {
        return Err("sike: wrong ciphertext length");
    }

    let mut c0 = PublicKey::new(KeyVariant::SidhA);
    c0.import(&ctext[..PUBLIC_KEY_SIZE])?;
    let j = derive_secret(prv, &c0)?;

    let digest: [u8; 32] = Sha256::digest(&j).into();
    let mut n = [0u8; MSG_LEN];
    for i in 0..MSG_LEN {
        n[i] = digest[i] ^ ctext[PUBLIC_KEY_SIZE + i];
    }
    Ok(n)
}

/// KEM encapsulation: derive the ephemeral A-scalar from
/// SHA-256(ptext ‖ pk), encrypt, and hash ptext ‖ ctext into the
/// shared secret.
pub fn encapsulate(
    rng: &mut dyn RngCore,
    pub_key: &PublicKey,
) -> Result<(Vec<u8>, [u8; KEM_SIZE]), &'static str> {
    let mut ptext = [0u8; MSG_LEN];
    rng.fill_bytes(&mut ptext);

    let mut h = Sha256::new();
    h.update(ptext);
    h.update(pub_key.export());
    let digest = h.finalize();

    let mut sk_a = PrivateKey::new(KeyVariant::SidhA);
    sk_a.scalar
        .copy_from_slice(&digest[..DOMAIN_A.secret_byte_len]);

    let pk_a = sk_a.public_key();
    let ctext = encrypt_with(&sk_a, &pk_a, pub_key, &ptext)?;

    let mut h = Sha256::new();
    h.update(ptext);
    h.update(&ctext);
    let shared: [u8; 32] = h.finalize().into();
    Ok((ctext, shared[..KEM_SIZE].try_into().unwrap()))
}

/// KEM decapsulation: re-encapsulate and compare; substitute S on
/// mismatch, in constant time.
pub fn decapsulate(
    prv: &PrivateKey,
    pub_key: &PublicKey,
    ctext: &[u8],
) -> Result<[u8; KEM_SIZE], &'static str> {
    let m = decrypt_with(prv, ctext)?;

    let mut h = Sha256::new();
    h.update(m);
    h.update(pub_key.export());
    let digest = h.finalize();

    let mut sk_a = PrivateKey::new(KeyVariant::SidhA);
    sk_a.scalar
        .copy_from_slice(&digest[..DOMAIN_A.secret_byte_len]);
    let c0 = sk_a.public_key().export();

    let matches = crate::constant_time::ct_eq_u8(&c0, &ctext[..c0.len()]);
    let mask = matches.wrapping_sub(1);
    let mut selected = [0u8; MSG_LEN];
    for i in 0..MSG_LEN {
        selected[i] = (m[i] & !mask) | (prv.s[i] & mask);
    }

    let mut h = Sha256::new();
    h.update(selected);
    h.update(ctext);
    let shared: [u8; 32] = h.finalize().into();
    Ok(shared[..KEM_SIZE].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    #[test]
    fn test_sidh_shared_secret() {
        let mut rng = StepRng::new(0x1357_9bdf_0246_8ace, 0x9e37_79b9_7f4a_7c15);

        let mut prv_a = PrivateKey::new(KeyVariant::SidhA);
        prv_a.generate(&mut rng);
        let mut prv_b = PrivateKey::new(KeyVariant::SidhB);
        prv_b.generate(&mut rng);

        let pub_a = prv_a.public_key();
        let pub_b = prv_b.public_key();

        let s1 = derive_secret(&prv_a, &pub_b).unwrap();
        let s2 = derive_secret(&prv_b, &pub_a).unwrap();
        assert_eq!(s1, s2);
        assert_eq!(s1.len(), SHARED_SECRET_SIZE);
    }

    #[test]
    fn test_kem_round_trip() {
        let mut rng = StepRng::new(0xfeed_f00d_dead_beef, 0x0101_0101_0101_0103);

        let mut prv = PrivateKey::new(KeyVariant::Sike);
        prv.generate(&mut rng);
        let pub_key = prv.public_key();

        let (ctext, ss_enc) = encapsulate(&mut rng, &pub_key).unwrap();
        assert_eq!(ctext.len(), CIPHERTEXT_SIZE);
        let ss_dec = decapsulate(&prv, &pub_key, &ctext).unwrap();
        assert_eq!(ss_enc, ss_dec);
    }

    #[test]
    fn test_kem_corrupt_ciphertext_substitutes_s() {
        let mut rng = StepRng::new(0xabcd_ef01_2345_6789, 0x1111_1111_1111_1117);

        let mut prv = PrivateKey::new(KeyVariant::Sike);
        prv.generate(&mut rng);
        let pub_key = prv.public_key();

        let (mut ctext, ss) = encapsulate(&mut rng, &pub_key).unwrap();
        ctext[0] ^= 1;
        let forged = decapsulate(&prv, &pub_key, &ctext).unwrap();
        assert_ne!(forged, ss);

        // The substituted output is SHA-256(S ‖ ctext): a deterministic
        // value independent of the true secret.
        let mut h = Sha256::new();
        h.update(&prv.s);
        h.update(&ctext);
        let expected: [u8; 32] = h.finalize().into();
        assert_eq!(forged[..], expected[..KEM_SIZE]);
    }

    #[test]
    fn test_keys_export_import() {
        let mut rng = StepRng::new(0x1122_3344_5566_7788, 0x9e37_79b9_7f4a_7c15);
        let mut prv = PrivateKey::new(KeyVariant::Sike);
        prv.generate(&mut rng);

        let pub_key = prv.public_key();
        let exported = pub_key.export();
        let mut imported = PublicKey::new(KeyVariant::Sike);
        imported.import(&exported).unwrap();
        assert_eq!(imported.export()[..], exported[..]);

        let prv_bytes = prv.export();
        let mut prv2 = PrivateKey::new(KeyVariant::Sike);
        prv2.import(&prv_bytes).unwrap();
        assert_eq!(prv2.export(), prv_bytes);
    }
}
