//! RC4 keystream cipher, the stream variant of the record layer.
//!
//! Long deprecated on the wire, but the harness must still speak it to
//! probe peers that do.

/// RC4 cipher state.
#[derive(Clone)]
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    /// Key-schedule the cipher. Key length 1..=256 bytes.
    pub fn new(key: &[u8]) -> Self {
        assert!(!key.is_empty() && key.len() <= 256);

        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        let mut j = 0u8;
        for i in 0..256 {
            j = j
                .wrapping_add(s[i])
                .wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }

        Self { s, i: 0, j: 0 }
    }

    /// XOR the keystream into `data` in place.
    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s
                [(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize];
            *byte ^= k;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6229, 40-bit key 0x0102030405, first 16 keystream bytes.
    #[test]
    fn test_rfc6229_keystream() {
        let mut rc4 = Rc4::new(&[0x01, 0x02, 0x03, 0x04, 0x05]);
        let mut buf = [0u8; 16];
        rc4.apply_keystream(&mut buf);
        assert_eq!(
            hex::encode(buf),
            "b2396305f03dc026e93bb7e30c1e2d32"
        );
    }

    #[test]
    fn test_symmetric() {
        let mut enc = Rc4::new(b"record key");
        let mut dec = Rc4::new(b"record key");
        let mut data = b"application data".to_vec();
        enc.apply_keystream(&mut data);
        assert_ne!(&data, b"application data");
        dec.apply_keystream(&mut data);
        assert_eq!(&data, b"application data");
    }
}
