//! ChaCha20, Poly1305, and the RFC 8439 AEAD composition.

/// Key size in bytes.
pub const CHACHA20_KEY_SIZE: usize = 32;
/// Nonce size in bytes.
pub const CHACHA20_NONCE_SIZE: usize = 12;
/// Poly1305 tag size in bytes.
pub const POLY1305_TAG_SIZE: usize = 16;

const SIGMA: [u32; 4] = [0x61707865, 0x3320646e, 0x79622d32, 0x6b206574];

#[inline]
fn quarter_round(state: &mut [u32; 16], a: usize, b: usize, c: usize, d: usize) {
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(16);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(12);
    state[a] = state[a].wrapping_add(state[b]);
    state[d] = (state[d] ^ state[a]).rotate_left(8);
    state[c] = state[c].wrapping_add(state[d]);
    state[b] = (state[b] ^ state[c]).rotate_left(7);
}

fn chacha20_block(key: &[u8; 32], nonce: &[u8; 12], counter: u32) -> [u8; 64] {
    let mut state = [0u32; 16];
    state[..4].copy_from_slice(&SIGMA);
    for i in 0..8 {
        state[4 + i] = u32::from_le_bytes(key[i * 4..i * 4 + 4].try_into().unwrap());
    }
    state[12] = counter;
    for i in 0..3 {
        state[13 + i] = u32::from_le_bytes(nonce[i * 4..i * 4 + 4].try_into().unwrap());
    }

    let mut working = state;
    for _ in 0..10 {
        quarter_round(&mut working, 0, 4, 8, 12);
        quarter_round(&mut working, 1, 5, 9, 13);
        quarter_round(&mut working, 2, 6, 10, 14);
        quarter_round(&mut working, 3, 7, 11, 15);
        quarter_round(&mut working, 0, 5, 10, 15);
        quarter_round(&mut working, 1, 6, 11, 12);
        quarter_round(&mut working, 2, 7, 8, 13);
        quarter_round(&mut working, 3, 4, 9, 14);
    }

    let mut out = [0u8; 64];
    for i in 0..16 {
        let word = working[i].wrapping_add(state[i]);
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    out
}

/// XOR the ChaCha20 keystream (starting at `counter`) into `data`.
pub fn chacha20_xor(key: &[u8; 32], nonce: &[u8; 12], counter: u32, data: &mut [u8]) {
    let mut ctr = counter;
    for chunk in data.chunks_mut(64) {
        let keystream = chacha20_block(key, nonce, ctr);
        for (d, k) in chunk.iter_mut().zip(keystream.iter()) {
            *d ^= k;
        }
        ctr = ctr.wrapping_add(1);
    }
}

/// Poly1305 one-time authenticator, 26-bit limb arithmetic.
pub struct Poly1305 {
    r: [u32; 5],
    h: [u32; 5],
    pad: [u32; 4],
    buffer: [u8; 16],
    buffer_len: usize,
}

impl Poly1305 {
    pub fn new(key: &[u8; 32]) -> Self {
        // r is clamped per RFC 8439 §2.5.
        let mut r = [0u32; 5];
        r[0] = u32::from_le_bytes(key[0..4].try_into().unwrap()) & 0x3ffffff;
        r[1] = (u32::from_le_bytes(key[3..7].try_into().unwrap()) >> 2) & 0x3ffff03;
        r[2] = (u32::from_le_bytes(key[6..10].try_into().unwrap()) >> 4) & 0x3ffc0ff;
        r[3] = (u32::from_le_bytes(key[9..13].try_into().unwrap()) >> 6) & 0x3f03fff;
        r[4] = (u32::from_le_bytes(key[12..16].try_into().unwrap()) >> 8) & 0x00fffff;

        let mut pad = [0u32; 4];
        for i in 0..4 {
            pad[i] = u32::from_le_bytes(key[16 + i * 4..20 + i * 4].try_into().unwrap());
        }

        Self {
            r,
            h: [0u32; 5],
            pad,
            buffer: [0u8; 16],
            buffer_len: 0,
        }
    }

    fn process_block(&mut self, block: &[u8; 16], partial: bool) {
        let hibit: u32 = if partial { 0 } else { 1 << 24 };

        self.h[0] += u32::from_le_bytes(block[0..4].try_into().unwrap()) & 0x3ffffff;
        self.h[1] += (u32::from_le_bytes(block[3..7].try_into().unwrap()) >> 2) & 0x3ffffff;
        self.h[2] += (u32::from_le_bytes(block[6..10].try_into().unwrap()) >> 4) & 0x3ffffff;
        self.h[3] += (u32::from_le_bytes(block[9..13].try_into().unwrap()) >> 6) & 0x3ffffff;
        self.h[4] += (u32::from_le_bytes(block[12..16].try_into().unwrap()) >> 8) | hibit;

        let [r0, r1, r2, r3, r4] = self.r.map(|x| x as u64);
        let [h0, h1, h2, h3, h4] = self.h.map(|x| x as u64);
        let s1 = r1 * 5;
        let s2 = r2 * 5;
        let s3 = r3 * 5;
        let s4 = r4 * 5;

        let d0 = h0 * r0 + h1 * s4 + h2 * s3 + h3 * s2 + h4 * s1;
        let d1 = h0 * r1 + h1 * r0 + h2 * s4 + h3 * s3 + h4 * s2;
        let d2 = h0 * r2 + h1 * r1 + h2 * r0 + h3 * s4 + h4 * s3;
        let d3 = h0 * r3 + h1 * r2 + h2 * r1 + h3 * r0 + h4 * s4;
        let d4 = h0 * r4 + h1 * r3 + h2 * r2 + h3 * r1 + h4 * r0;

        let mut c;
        let mut d = [d0, d1, d2, d3, d4];
        c = d[0] >> 26;
        self.h[0] = (d[0] & 0x3ffffff) as u32;
        d[1] += c;
        c = d[1] >> 26;
        self.h[1] = (d[1] & 0x3ffffff) as u32;
        d[2] += c;
        c = d[2] >> 26;
        self.h[2] = (d[2] & 0x3ffffff) as u32;
        d[3] += c;
        c = d[3] >> 26;
        self.h[3] = (d[3] & 0x3ffffff) as u32;
        d[4] += c;
        c = d[4] >> 26;
        self.h[4] = (d[4] & 0x3ffffff) as u32;
        self.h[0] += (c * 5) as u32;
        let c = self.h[0] >> 26;
        self.h[0] &= 0x3ffffff;
        self.h[1] += c;
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut rest = data;

        if self.buffer_len > 0 {
            let take = (16 - self.buffer_len).min(rest.len());
            self.buffer[self.buffer_len..self.buffer_len + take].copy_from_slice(&rest[..take]);
            self.buffer_len += take;
            rest = &rest[take..];
            if self.buffer_len == 16 {
                let block = self.buffer;
                self.process_block(&block, false);
                self.buffer_len = 0;
            }
        }

        let mut chunks = rest.chunks_exact(16);
        for block in &mut chunks {
            self.process_block(block.try_into().unwrap(), false);
        }
        let tail = chunks.remainder();
        self.buffer[..tail.len()].copy_from_slice(tail);
        self.buffer_len = tail.len();
    }

    pub fn finalize(mut self) -> [u8; POLY1305_TAG_SIZE] {
        if self.buffer_len > 0 {
            let mut block = [0u8; 16];
            block[..self.buffer_len].copy_from_slice(&self.buffer[..self.buffer_len]);
            block[self.buffer_len] = 1;
            self.process_block(&block, true);
        }

        // Full carry, then compute h + -p and select.
        let mut h = self.h;
        let mut c = h[1] >> 26;
        h[1] &= 0x3ffffff;
        h[2] += c;
        c = h[2] >> 26;
        h[2] &= 0x3ffffff;
        h[3] += c;
        c = h[3] >> 26;
        h[3] &= 0x3ffffff;
        h[4] += c;
        c = h[4] >> 26;
        h[4] &= 0x3ffffff;
        h[0] += c * 5;
        c = h[0] >> 26;
        h[0] &= 0x3ffffff;
        h[1] += c;

        let mut g = [0u32; 5];
        let mut carry = 5u32;
        for i in 0..5 {
            let t = h[i].wrapping_add(carry);
            carry = t >> 26;
            g[i] = t & 0x3ffffff;
        }
        g[4] = g[4].wrapping_sub(1 << 26);

        let mask = (g[4] >> 31).wrapping_sub(1);
        for i in 0..5 {
            h[i] = (h[i] & !mask) | (g[i] & mask);
        }

        // Serialize and add the pad with carry.
        let mut words = [0u32; 4];
        words[0] = h[0] | (h[1] << 26);
        words[1] = (h[1] >> 6) | (h[2] << 20);
        words[2] = (h[2] >> 12) | (h[3] << 14);
        words[3] = (h[3] >> 18) | (h[4] << 8);

        let mut tag = [0u8; POLY1305_TAG_SIZE];
        let mut carry = 0u64;
        for i in 0..4 {
            let t = words[i] as u64 + self.pad[i] as u64 + carry;
            tag[i * 4..i * 4 + 4].copy_from_slice(&(t as u32).to_le_bytes());
            carry = t >> 32;
        }
        tag
    }
}

/// One-shot Poly1305 tag.
pub fn poly1305(key: &[u8; 32], message: &[u8]) -> [u8; POLY1305_TAG_SIZE] {
    let mut p = Poly1305::new(key);
    p.update(message);
    p.finalize()
}

/// ChaCha20-Poly1305 AEAD. `seal` returns ciphertext ‖ tag.
pub struct ChaCha20Poly1305 {
    key: [u8; CHACHA20_KEY_SIZE],
}

impl ChaCha20Poly1305 {
    pub fn new(key: &[u8; CHACHA20_KEY_SIZE]) -> Self {
        Self { key: *key }
    }

    pub fn overhead(&self) -> usize {
        POLY1305_TAG_SIZE
    }

    fn tag(&self, nonce: &[u8; 12], aad: &[u8], ct: &[u8]) -> [u8; POLY1305_TAG_SIZE] {
        let block = chacha20_block(&self.key, nonce, 0);
        let poly_key: [u8; 32] = block[..32].try_into().unwrap();

        let mut mac = Poly1305::new(&poly_key);
        mac.update(aad);
        mac.update(&[0u8; 16][..(16 - aad.len() % 16) % 16]);
        mac.update(ct);
        mac.update(&[0u8; 16][..(16 - ct.len() % 16) % 16]);
        mac.update(&(aad.len() as u64).to_le_bytes());
        mac.update(&(ct.len() as u64).to_le_bytes());
        mac.finalize()
    }

    pub fn seal(&self, nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let mut out = plaintext.to_vec();
        chacha20_xor(&self.key, nonce, 1, &mut out);
        let tag = self.tag(nonce, aad, &out);
        out.extend_from_slice(&tag);
        out
    }

    pub fn open(&self, nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.len() < POLY1305_TAG_SIZE {
            return None;
        }
        let (ct, tag) = ciphertext.split_at(ciphertext.len() - POLY1305_TAG_SIZE);
        let expected = self.tag(nonce, aad, ct);
        if !crate::constant_time::ct_eq(&expected, tag) {
            return None;
        }
        let mut out = ct.to_vec();
        chacha20_xor(&self.key, nonce, 1, &mut out);
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 8439 §2.3.2 block function vector.
    #[test]
    fn test_block_function() {
        let key: [u8; 32] = (0u8..32).collect::<Vec<_>>().try_into().unwrap();
        let nonce: [u8; 12] = hex::decode("000000090000004a00000000")
            .unwrap()
            .try_into()
            .unwrap();
        let block = chacha20_block(&key, &nonce, 1);
        assert_eq!(
            hex::encode(&block[..16]),
            "10f1e7e4d13b5915500fdd1fa32071c4"
        );
    }

    // RFC 8439 §2.5.2.
    #[test]
    fn test_poly1305_vector() {
        let key: [u8; 32] =
            hex::decode("85d6be7857556d337f4452fe42d506a80103808afb0db2fd4abff6af4149f51b")
                .unwrap()
                .try_into()
                .unwrap();
        let tag = poly1305(&key, b"Cryptographic Forum Research Group");
        assert_eq!(hex::encode(tag), "a8061dc1305136c6c22b8baf0c0127a9");
    }

    // RFC 8439 §2.8.2.
    #[test]
    fn test_aead_vector() {
        let key: [u8; 32] =
            hex::decode("808182838485868788898a8b8c8d8e8f909192939495969798999a9b9c9d9e9f")
                .unwrap()
                .try_into()
                .unwrap();
        let nonce: [u8; 12] = hex::decode("070000004041424344454647")
            .unwrap()
            .try_into()
            .unwrap();
        let aad = hex::decode("50515253c0c1c2c3c4c5c6c7").unwrap();
        let plaintext = b"Ladies and Gentlemen of the class of '99: If I could offer you only one tip for the future, sunscreen would be it.";

        let aead = ChaCha20Poly1305::new(&key);
        let sealed = aead.seal(&nonce, &aad, plaintext);
        assert_eq!(
            hex::encode(&sealed[sealed.len() - 16..]),
            "1ae10b594f09e26a7e902ecbd0600691"
        );
        assert_eq!(
            aead.open(&nonce, &aad, &sealed).as_deref(),
            Some(plaintext.as_ref())
        );

        let mut corrupt = sealed;
        let last = corrupt.len() - 1;
        corrupt[last] ^= 1;
        assert_eq!(aead.open(&nonce, &aad, &corrupt), None);
    }
}
