//! AES (FIPS 197) with the modes the TLS record layer and ticket sealer
//! use: GCM, raw CBC (the record layer applies its own padding), and CTR.
//!
//! Table-based and unhurried; the harness favors malformed flights over
//! throughput.

/// Block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;
/// GCM authentication tag size.
pub const GCM_TAG_SIZE: usize = 16;
/// GCM nonce size used on the record layer.
pub const GCM_NONCE_SIZE: usize = 12;

const SBOX: [u8; 256] = [
    0x63, 0x7c, 0x77, 0x7b, 0xf2, 0x6b, 0x6f, 0xc5, 0x30, 0x01, 0x67, 0x2b, 0xfe, 0xd7, 0xab, 0x76,
    0xca, 0x82, 0xc9, 0x7d, 0xfa, 0x59, 0x47, 0xf0, 0xad, 0xd4, 0xa2, 0xaf, 0x9c, 0xa4, 0x72, 0xc0,
    0xb7, 0xfd, 0x93, 0x26, 0x36, 0x3f, 0xf7, 0xcc, 0x34, 0xa5, 0xe5, 0xf1, 0x71, 0xd8, 0x31, 0x15,
    0x04, 0xc7, 0x23, 0xc3, 0x18, 0x96, 0x05, 0x9a, 0x07, 0x12, 0x80, 0xe2, 0xeb, 0x27, 0xb2, 0x75,
    0x09, 0x83, 0x2c, 0x1a, 0x1b, 0x6e, 0x5a, 0xa0, 0x52, 0x3b, 0xd6, 0xb3, 0x29, 0xe3, 0x2f, 0x84,
    0x53, 0xd1, 0x00, 0xed, 0x20, 0xfc, 0xb1, 0x5b, 0x6a, 0xcb, 0xbe, 0x39, 0x4a, 0x4c, 0x58, 0xcf,
    0xd0, 0xef, 0xaa, 0xfb, 0x43, 0x4d, 0x33, 0x85, 0x45, 0xf9, 0x02, 0x7f, 0x50, 0x3c, 0x9f, 0xa8,
    0x51, 0xa3, 0x40, 0x8f, 0x92, 0x9d, 0x38, 0xf5, 0xbc, 0xb6, 0xda, 0x21, 0x10, 0xff, 0xf3, 0xd2,
    0xcd, 0x0c, 0x13, 0xec, 0x5f, 0x97, 0x44, 0x17, 0xc4, 0xa7, 0x7e, 0x3d, 0x64, 0x5d, 0x19, 0x73,
    0x60, 0x81, 0x4f, 0xdc, 0x22, 0x2a, 0x90, 0x88, 0x46, 0xee, 0xb8, 0x14, 0xde, 0x5e, 0x0b, 0xdb,
    0xe0, 0x32, 0x3a, 0x0a, 0x49, 0x06, 0x24, 0x5c, 0xc2, 0xd3, 0xac, 0x62, 0x91, 0x95, 0xe4, 0x79,
    0xe7, 0xc8, 0x37, 0x6d, 0x8d, 0xd5, 0x4e, 0xa9, 0x6c, 0x56, 0xf4, 0xea, 0x65, 0x7a, 0xae, 0x08,
    0xba, 0x78, 0x25, 0x2e, 0x1c, 0xa6, 0xb4, 0xc6, 0xe8, 0xdd, 0x74, 0x1f, 0x4b, 0xbd, 0x8b, 0x8a,
    0x70, 0x3e, 0xb5, 0x66, 0x48, 0x03, 0xf6, 0x0e, 0x61, 0x35, 0x57, 0xb9, 0x86, 0xc1, 0x1d, 0x9e,
    0xe1, 0xf8, 0x98, 0x11, 0x69, 0xd9, 0x8e, 0x94, 0x9b, 0x1e, 0x87, 0xe9, 0xce, 0x55, 0x28, 0xdf,
    0x8c, 0xa1, 0x89, 0x0d, 0xbf, 0xe6, 0x42, 0x68, 0x41, 0x99, 0x2d, 0x0f, 0xb0, 0x54, 0xbb, 0x16,
];

const INV_SBOX: [u8; 256] = [
    0x52, 0x09, 0x6a, 0xd5, 0x30, 0x36, 0xa5, 0x38, 0xbf, 0x40, 0xa3, 0x9e, 0x81, 0xf3, 0xd7, 0xfb,
    0x7c, 0xe3, 0x39, 0x82, 0x9b, 0x2f, 0xff, 0x87, 0x34, 0x8e, 0x43, 0x44, 0xc4, 0xde, 0xe9, 0xcb,
    0x54, 0x7b, 0x94, 0x32, 0xa6, 0xc2, 0x23, 0x3d, 0xee, 0x4c, 0x95, 0x0b, 0x42, 0xfa, 0xc3, 0x4e,
    0x08, 0x2e, 0xa1, 0x66, 0x28, 0xd9, 0x24, 0xb2, 0x76, 0x5b, 0xa2, 0x49, 0x6d, 0x8b, 0xd1, 0x25,
    0x72, 0xf8, 0xf6, 0x64, 0x86, 0x68, 0x98, 0x16, 0xd4, 0xa4, 0x5c, 0xcc, 0x5d, 0x65, 0xb6, 0x92,
    0x6c, 0x70, 0x48, 0x50, 0xfd, 0xed, 0xb9, 0xda, 0x5e, 0x15, 0x46, 0x57, 0xa7, 0x8d, 0x9d, 0x84,
    0x90, 0xd8, 0xab, 0x00, 0x8c, 0xbc, 0xd3, 0x0a, 0xf7, 0xe4, 0x58, 0x05, 0xb8, 0xb3, 0x45, 0x06,
    0xd0, 0x2c, 0x1e, 0x8f, 0xca, 0x3f, 0x0f, 0x02, 0xc1, 0xaf, 0xbd, 0x03, 0x01, 0x13, 0x8a, 0x6b,
    0x3a, 0x91, 0x11, 0x41, 0x4f, 0x67, 0xdc, 0xea, 0x97, 0xf2, 0xcf, 0xce, 0xf0, 0xb4, 0xe6, 0x73,
    0x96, 0xac, 0x74, 0x22, 0xe7, 0xad, 0x35, 0x85, 0xe2, 0xf9, 0x37, 0xe8, 0x1c, 0x75, 0xdf, 0x6e,
    0x47, 0xf1, 0x1a, 0x71, 0x1d, 0x29, 0xc5, 0x89, 0x6f, 0xb7, 0x62, 0x0e, 0xaa, 0x18, 0xbe, 0x1b,
    0xfc, 0x56, 0x3e, 0x4b, 0xc6, 0xd2, 0x79, 0x20, 0x9a, 0xdb, 0xc0, 0xfe, 0x78, 0xcd, 0x5a, 0xf4,
    0x1f, 0xdd, 0xa8, 0x33, 0x88, 0x07, 0xc7, 0x31, 0xb1, 0x12, 0x10, 0x59, 0x27, 0x80, 0xec, 0x5f,
    0x60, 0x51, 0x7f, 0xa9, 0x19, 0xb5, 0x4a, 0x0d, 0x2d, 0xe5, 0x7a, 0x9f, 0x93, 0xc9, 0x9c, 0xef,
    0xa0, 0xe0, 0x3b, 0x4d, 0xae, 0x2a, 0xf5, 0xb0, 0xc8, 0xeb, 0xbb, 0x3c, 0x83, 0x53, 0x99, 0x61,
    0x17, 0x2b, 0x04, 0x7e, 0xba, 0x77, 0xd6, 0x26, 0xe1, 0x69, 0x14, 0x63, 0x55, 0x21, 0x0c, 0x7d,
];

const RCON: [u8; 15] = [
    0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36, 0x6c, 0xd8, 0xab, 0x4d,
];

/// AES block cipher; the key length (16 or 32 bytes) picks the variant.
#[derive(Clone)]
pub struct Aes {
    round_keys: Vec<[u8; 16]>,
}

impl Aes {
    /// Expand `key`. Panics unless the key is 16 or 32 bytes.
    pub fn new(key: &[u8]) -> Self {
        let nk = match key.len() {
            16 => 4,
            32 => 8,
            n => panic!("unsupported AES key length {}", n),
        };
        let rounds = nk + 6;
        let nwords = 4 * (rounds + 1);

        let mut w = vec![[0u8; 4]; nwords];
        for (i, word) in w.iter_mut().take(nk).enumerate() {
            word.copy_from_slice(&key[i * 4..i * 4 + 4]);
        }
        for i in nk..nwords {
            let mut temp = w[i - 1];
            if i % nk == 0 {
                temp.rotate_left(1);
                for b in temp.iter_mut() {
                    *b = SBOX[*b as usize];
                }
                temp[0] ^= RCON[i / nk];
            } else if nk > 6 && i % nk == 4 {
                for b in temp.iter_mut() {
                    *b = SBOX[*b as usize];
                }
            }
            for j in 0..4 {
                w[i][j] = w[i - nk][j] ^ temp[j];
            }
        }

        let round_keys = w
            .chunks_exact(4)
            .map(|c| {
                let mut rk = [0u8; 16];
                for (j, word) in c.iter().enumerate() {
                    rk[j * 4..j * 4 + 4].copy_from_slice(word);
                }
                rk
            })
            .collect();
        Self { round_keys }
    }

    fn rounds(&self) -> usize {
        self.round_keys.len() - 1
    }

    /// Encrypt one block in place.
    pub fn encrypt_block(&self, state: &mut [u8; 16]) {
        let rounds = self.rounds();
        xor_block(state, &self.round_keys[0]);
        for round in 1..rounds {
            sub_bytes(state);
            shift_rows(state);
            mix_columns(state);
            xor_block(state, &self.round_keys[round]);
        }
        sub_bytes(state);
        shift_rows(state);
        xor_block(state, &self.round_keys[rounds]);
    }

    /// Decrypt one block in place.
    pub fn decrypt_block(&self, state: &mut [u8; 16]) {
        let rounds = self.rounds();
        xor_block(state, &self.round_keys[rounds]);
        for round in (1..rounds).rev() {
            inv_shift_rows(state);
            inv_sub_bytes(state);
            xor_block(state, &self.round_keys[round]);
            inv_mix_columns(state);
        }
        inv_shift_rows(state);
        inv_sub_bytes(state);
        xor_block(state, &self.round_keys[0]);
    }
}

#[inline]
fn xor_block(state: &mut [u8; 16], key: &[u8; 16]) {
    for (s, k) in state.iter_mut().zip(key.iter()) {
        *s ^= k;
    }
}

#[inline]
fn sub_bytes(state: &mut [u8; 16]) {
    for b in state.iter_mut() {
        *b = SBOX[*b as usize];
    }
}

#[inline]
fn inv_sub_bytes(state: &mut [u8; 16]) {
    for b in state.iter_mut() {
        *b = INV_SBOX[*b as usize];
    }
}

#[inline]
fn shift_rows(state: &mut [u8; 16]) {
    let tmp = state[1];
    state[1] = state[5];
    state[5] = state[9];
    state[9] = state[13];
    state[13] = tmp;

    state.swap(2, 10);
    state.swap(6, 14);

    let tmp = state[15];
    state[15] = state[11];
    state[11] = state[7];
    state[7] = state[3];
    state[3] = tmp;
}

#[inline]
fn inv_shift_rows(state: &mut [u8; 16]) {
    let tmp = state[13];
    state[13] = state[9];
    state[9] = state[5];
    state[5] = state[1];
    state[1] = tmp;

    state.swap(2, 10);
    state.swap(6, 14);

    let tmp = state[3];
    state[3] = state[7];
    state[7] = state[11];
    state[11] = state[15];
    state[15] = tmp;
}

#[inline]
fn xtime(x: u8) -> u8 {
    (x << 1) ^ (((x >> 7) & 1) * 0x1b)
}

#[inline]
fn gf_mul(x: u8, y: u8) -> u8 {
    let mut result = 0u8;
    let mut a = x;
    let mut b = y;
    for _ in 0..8 {
        if b & 1 != 0 {
            result ^= a;
        }
        let hi = a & 0x80;
        a <<= 1;
        if hi != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    result
}

#[inline]
fn mix_columns(state: &mut [u8; 16]) {
    for col in state.chunks_exact_mut(4) {
        let [a, b, c, d] = [col[0], col[1], col[2], col[3]];
        let e = a ^ b ^ c ^ d;
        col[0] ^= e ^ xtime(a ^ b);
        col[1] ^= e ^ xtime(b ^ c);
        col[2] ^= e ^ xtime(c ^ d);
        col[3] ^= e ^ xtime(d ^ a);
    }
}

#[inline]
fn inv_mix_columns(state: &mut [u8; 16]) {
    for col in state.chunks_exact_mut(4) {
        let [a, b, c, d] = [col[0], col[1], col[2], col[3]];
        col[0] = gf_mul(a, 0x0e) ^ gf_mul(b, 0x0b) ^ gf_mul(c, 0x0d) ^ gf_mul(d, 0x09);
        col[1] = gf_mul(a, 0x09) ^ gf_mul(b, 0x0e) ^ gf_mul(c, 0x0b) ^ gf_mul(d, 0x0d);
        col[2] = gf_mul(a, 0x0d) ^ gf_mul(b, 0x09) ^ gf_mul(c, 0x0e) ^ gf_mul(d, 0x0b);
        col[3] = gf_mul(a, 0x0b) ^ gf_mul(b, 0x0d) ^ gf_mul(c, 0x09) ^ gf_mul(d, 0x0e);
    }
}

/// AES-GCM (SP 800-38D). `seal` returns ciphertext with the tag appended,
/// which is the shape the record layer frames.
pub struct AesGcm {
    aes: Aes,
    h: [u8; 16],
}

impl AesGcm {
    pub fn new(key: &[u8]) -> Self {
        let aes = Aes::new(key);
        let mut h = [0u8; 16];
        aes.encrypt_block(&mut h);
        Self { aes, h }
    }

    /// Tag bytes added by seal.
    pub fn overhead(&self) -> usize {
        GCM_TAG_SIZE
    }

    fn ghash_mul(&self, x: &mut [u8; 16]) {
        let mut z = [0u8; 16];
        let mut v = self.h;

        for i in 0..128 {
            if (x[i / 8] >> (7 - (i % 8))) & 1 == 1 {
                for (zb, vb) in z.iter_mut().zip(v.iter()) {
                    *zb ^= vb;
                }
            }
            let lsb = v[15] & 1;
            for j in (1..16).rev() {
                v[j] = (v[j] >> 1) | ((v[j - 1] & 1) << 7);
            }
            v[0] >>= 1;
            if lsb == 1 {
                v[0] ^= 0xe1;
            }
        }

        *x = z;
    }

    fn ghash(&self, aad: &[u8], ct: &[u8]) -> [u8; 16] {
        let mut y = [0u8; 16];
        for chunk in aad.chunks(16).chain(ct.chunks(16)) {
            for (yb, cb) in y.iter_mut().zip(chunk.iter()) {
                *yb ^= cb;
            }
            self.ghash_mul(&mut y);
        }

        let mut lens = [0u8; 16];
        lens[..8].copy_from_slice(&((aad.len() as u64) * 8).to_be_bytes());
        lens[8..].copy_from_slice(&((ct.len() as u64) * 8).to_be_bytes());
        for (yb, lb) in y.iter_mut().zip(lens.iter()) {
            *yb ^= lb;
        }
        self.ghash_mul(&mut y);
        y
    }

    fn counter_xor(&self, nonce: &[u8; GCM_NONCE_SIZE], start: u32, data: &mut [u8]) {
        let mut counter = [0u8; 16];
        counter[..12].copy_from_slice(nonce);
        let mut n = start;
        for chunk in data.chunks_mut(16) {
            counter[12..].copy_from_slice(&n.to_be_bytes());
            let mut keystream = counter;
            self.aes.encrypt_block(&mut keystream);
            for (d, k) in chunk.iter_mut().zip(keystream.iter()) {
                *d ^= k;
            }
            n = n.wrapping_add(1);
        }
    }

    /// Encrypt and authenticate; returns ciphertext ‖ tag.
    pub fn seal(&self, nonce: &[u8; GCM_NONCE_SIZE], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut out = plaintext.to_vec();
        self.counter_xor(nonce, 2, &mut out);

        let mut tag = self.ghash(aad, &out);
        let mut j0 = [0u8; 16];
        j0[..12].copy_from_slice(nonce);
        j0[15] = 1;
        self.aes.encrypt_block(&mut j0);
        for (t, j) in tag.iter_mut().zip(j0.iter()) {
            *t ^= j;
        }

        out.extend_from_slice(&tag);
        out
    }

    /// Verify and decrypt ciphertext ‖ tag. None on authentication failure.
    pub fn open(
        &self,
        nonce: &[u8; GCM_NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Option<Vec<u8>> {
        if ciphertext.len() < GCM_TAG_SIZE {
            return None;
        }
        let (ct, tag) = ciphertext.split_at(ciphertext.len() - GCM_TAG_SIZE);

        let mut expected = self.ghash(aad, ct);
        let mut j0 = [0u8; 16];
        j0[..12].copy_from_slice(nonce);
        j0[15] = 1;
        self.aes.encrypt_block(&mut j0);
        for (t, j) in expected.iter_mut().zip(j0.iter()) {
            *t ^= j;
        }

        if !crate::constant_time::ct_eq(&expected, tag) {
            return None;
        }

        let mut out = ct.to_vec();
        self.counter_xor(nonce, 2, &mut out);
        Some(out)
    }
}

/// Raw AES-CBC with an installable IV and no padding; the TLS record
/// layer owns the padding rules.
pub struct AesCbc {
    aes: Aes,
    iv: [u8; 16],
}

impl AesCbc {
    pub fn new(key: &[u8], iv: &[u8; 16]) -> Self {
        Self {
            aes: Aes::new(key),
            iv: *iv,
        }
    }

    pub fn block_size(&self) -> usize {
        AES_BLOCK_SIZE
    }

    /// Install an explicit IV (TLS ≥ 1.1 records carry one per record).
    pub fn set_iv(&mut self, iv: &[u8]) {
        self.iv.copy_from_slice(iv);
    }

    /// Encrypt whole blocks in place. `data.len()` must be a multiple of 16.
    pub fn encrypt_blocks(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % AES_BLOCK_SIZE, 0);
        for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            let block: &mut [u8; 16] = chunk.try_into().unwrap();
            xor_block(block, &self.iv);
            self.aes.encrypt_block(block);
            self.iv.copy_from_slice(block);
        }
    }

    /// Decrypt whole blocks in place. `data.len()` must be a multiple of 16.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % AES_BLOCK_SIZE, 0);
        for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            let block: &mut [u8; 16] = chunk.try_into().unwrap();
            let next_iv: [u8; 16] = *block;
            self.aes.decrypt_block(block);
            xor_block(block, &self.iv);
            self.iv = next_iv;
        }
    }
}

/// AES-CTR, used by the session-ticket sealer.
pub struct AesCtr {
    aes: Aes,
}

impl AesCtr {
    pub fn new(key: &[u8]) -> Self {
        Self { aes: Aes::new(key) }
    }

    /// XOR the keystream for `counter_block` into `data` in place.
    pub fn process(&self, counter_block: &[u8; 16], data: &mut [u8]) {
        let mut counter = *counter_block;
        for chunk in data.chunks_mut(16) {
            let mut keystream = counter;
            self.aes.encrypt_block(&mut keystream);
            for (d, k) in chunk.iter_mut().zip(keystream.iter()) {
                *d ^= k;
            }
            for b in counter.iter_mut().rev() {
                *b = b.wrapping_add(1);
                if *b != 0 {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // FIPS 197 Appendix C.1.
    #[test]
    fn test_aes128_block() {
        let key = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let aes = Aes::new(&key);
        let mut block: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        aes.encrypt_block(&mut block);
        assert_eq!(hex::encode(block), "69c4e0d86a7b0430d8cdb78070b4c55a");
        aes.decrypt_block(&mut block);
        assert_eq!(hex::encode(block), "00112233445566778899aabbccddeeff");
    }

    // FIPS 197 Appendix C.3.
    #[test]
    fn test_aes256_block() {
        let key =
            hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f")
                .unwrap();
        let aes = Aes::new(&key);
        let mut block: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        aes.encrypt_block(&mut block);
        assert_eq!(hex::encode(block), "8ea2b7ca516745bfeafc49904b496089");
    }

    // NIST GCM test vector (128-bit key, 96-bit IV, no AAD).
    #[test]
    fn test_gcm_empty() {
        let gcm = AesGcm::new(&[0u8; 16]);
        let nonce = [0u8; 12];
        let sealed = gcm.seal(&nonce, &[], &[]);
        assert_eq!(hex::encode(&sealed), "58e2fccefa7e3061367f1d57a4e7455a");
        assert_eq!(gcm.open(&nonce, &[], &sealed), Some(vec![]));
    }

    #[test]
    fn test_gcm_roundtrip_with_aad() {
        let gcm = AesGcm::new(b"0123456789abcdef0123456789abcdef");
        let nonce = [7u8; 12];
        let sealed = gcm.seal(&nonce, b"header", b"payload bytes");
        assert_eq!(
            gcm.open(&nonce, b"header", &sealed).as_deref(),
            Some(b"payload bytes".as_ref())
        );
        assert_eq!(gcm.open(&nonce, b"h3ader", &sealed), None);

        let mut corrupt = sealed.clone();
        corrupt[0] ^= 1;
        assert_eq!(gcm.open(&nonce, b"header", &corrupt), None);
    }

    #[test]
    fn test_cbc_roundtrip() {
        let iv = [9u8; 16];
        let mut enc = AesCbc::new(&[1u8; 16], &iv);
        let mut dec = AesCbc::new(&[1u8; 16], &iv);
        let mut data = [0x5au8; 48];
        enc.encrypt_blocks(&mut data);
        dec.decrypt_blocks(&mut data);
        assert_eq!(data, [0x5au8; 48]);
    }

    #[test]
    fn test_cbc_chains_across_calls() {
        let iv = [0u8; 16];
        let mut one = AesCbc::new(&[2u8; 16], &iv);
        let mut two = AesCbc::new(&[2u8; 16], &iv);

        let mut a = [0x11u8; 32];
        one.encrypt_blocks(&mut a);

        let mut b1 = [0x11u8; 16];
        let mut b2 = [0x11u8; 16];
        two.encrypt_blocks(&mut b1);
        two.encrypt_blocks(&mut b2);

        assert_eq!(&a[..16], &b1);
        assert_eq!(&a[16..], &b2);
    }

    #[test]
    fn test_ctr_symmetric() {
        let ctr = AesCtr::new(&[3u8; 32]);
        let block = [0u8; 16];
        let mut data = b"ticket state bytes, any length".to_vec();
        ctr.process(&block, &mut data);
        ctr.process(&block, &mut data);
        assert_eq!(&data, b"ticket state bytes, any length");
    }
}
