//! Cryptographic primitives for the probetls test endpoint.
//!
//! The record layer consumes the symmetric ciphers (AES-GCM, AES-CBC,
//! ChaCha20-Poly1305, RC4); the handshake drivers consume X25519 and the
//! minimal RSA helpers; the post-quantum KEMs (NTRU-HRSS and SIKE/p434)
//! are self-contained constant-time implementations.
//!
//! SHA-256/SHA-384 come from the `sha2` crate; MD5 and SHA-1 are provided
//! here because only the legacy TLS PRF still wants them.

pub mod aes;
pub mod chacha20;
pub mod constant_time;
pub mod hkdf;
pub mod hmac;
pub mod hrss;
pub mod md5;
pub mod rc4;
pub mod rsa;
pub mod sha1;
pub mod sike;
pub mod x25519;

pub use constant_time::{ct_eq, ct_eq_u8, secure_zero};
pub use hmac::{hmac, Hmac, MacHash};
