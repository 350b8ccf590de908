//! Session state, the LRU session caches, and server ticket sealing.
//!
//! The LRU is an arena-backed doubly-linked list plus a map from
//! session key to node index, all behind one mutex, so Get and Put are
//! safe against concurrent callers.

use std::collections::HashMap;

use parking_lot::Mutex;
use probecrypto::aes::AesCtr;
use probecrypto::constant_time::ct_eq;
use probecrypto::hmac::{hmac, MacHash};

use crate::messages::{put_u16, put_u32, with_u16_len, with_u24_len, Reader};

/// A session as remembered by a client for resumption.
#[derive(Clone, Default)]
pub struct ClientSessionState {
    /// Session ID supplied by the server; empty when a ticket is used.
    pub session_id: Vec<u8>,
    /// Encrypted ticket (TLS ≤ 1.2) or PSK identity (TLS 1.3).
    pub session_ticket: Vec<u8>,
    pub vers: u16,
    pub wire_version: u16,
    pub cipher_suite: u16,
    /// Master secret (≤ 1.2) or resumption PSK (1.3).
    pub master_secret: Vec<u8>,
    pub server_certificates: Vec<Vec<u8>>,
    pub extended_master_secret: bool,
    pub sct_list: Vec<u8>,
    pub ocsp_response: Vec<u8>,
    pub early_alpn: String,
    pub ticket_creation_time: u64,
    pub ticket_expiration: u64,
    pub ticket_age_add: u32,
    pub max_early_data_size: u32,
}

/// A session as sealed into a server ticket or cached by session ID.
#[derive(Clone, Default)]
pub struct SessionState {
    pub vers: u16,
    pub cipher_suite: u16,
    pub master_secret: Vec<u8>,
    pub certificates: Vec<Vec<u8>>,
    pub extended_master_secret: bool,
    pub ticket_creation_time: u64,
    pub ticket_expiration: u64,
    pub ticket_age_add: u32,
    pub early_alpn: Vec<u8>,
}

impl SessionState {
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        put_u16(&mut buf, self.vers);
        put_u16(&mut buf, self.cipher_suite);
        buf.push(self.extended_master_secret as u8);
        with_u16_len(&mut buf, |buf| buf.extend_from_slice(&self.master_secret));
        buf.extend_from_slice(&self.ticket_creation_time.to_be_bytes());
        buf.extend_from_slice(&self.ticket_expiration.to_be_bytes());
        put_u32(&mut buf, self.ticket_age_add);
        with_u16_len(&mut buf, |buf| buf.extend_from_slice(&self.early_alpn));
        with_u16_len(&mut buf, |buf| {
            for cert in &self.certificates {
                with_u24_len(buf, |buf| buf.extend_from_slice(cert));
            }
        });
        buf
    }

    pub fn unmarshal(data: &[u8]) -> Option<SessionState> {
        let mut r = Reader::new(data);
        let vers = r.u16()?;
        let cipher_suite = r.u16()?;
        let extended_master_secret = r.u8()? != 0;
        let master_secret = r.u16_vec()?.to_vec();
        let creation = u64::from_be_bytes(r.bytes(8)?.try_into().ok()?);
        let expiration = u64::from_be_bytes(r.bytes(8)?.try_into().ok()?);
        let ticket_age_add = r.u32()?;
        let early_alpn = r.u16_vec()?.to_vec();
        let mut certs_reader = Reader::new(r.u16_vec()?);
        if !r.is_empty() {
            return None;
        }
        let mut certificates = Vec::new();
        while !certs_reader.is_empty() {
            certificates.push(certs_reader.u24_vec()?.to_vec());
        }
        Some(SessionState {
            vers,
            cipher_suite,
            master_secret,
            certificates,
            extended_master_secret,
            ticket_creation_time: creation,
            ticket_expiration: expiration,
            ticket_age_add,
            early_alpn,
        })
    }
}

// ---------------------------------------------------------------------------
// LRU cache
// ---------------------------------------------------------------------------

const DEFAULT_SESSION_CACHE_CAPACITY: usize = 64;
const NIL: usize = usize::MAX;

struct LruNode<V> {
    key: String,
    value: V,
    prev: usize,
    next: usize,
}

struct LruInner<V> {
    map: HashMap<String, usize>,
    nodes: Vec<LruNode<V>>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<V> LruInner<V> {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }
}

/// String-keyed LRU with bounded capacity.
pub struct LruCache<V> {
    inner: Mutex<LruInner<V>>,
}

impl<V: Clone> LruCache<V> {
    /// Capacities below one fall back to the default of 64.
    pub fn new(capacity: usize) -> LruCache<V> {
        let capacity = if capacity < 1 {
            DEFAULT_SESSION_CACHE_CAPACITY
        } else {
            capacity
        };
        LruCache {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                nodes: Vec::new(),
                head: NIL,
                tail: NIL,
                capacity,
            }),
        }
    }

    /// Insert or replace; a replaced or inserted entry becomes
    /// most-recently used. At capacity the least-recently used entry
    /// is evicted and its node reused.
    pub fn put(&self, session_key: &str, value: V) {
        let mut inner = self.inner.lock();

        let existing = inner.map.get(session_key).copied();
        if let Some(idx) = existing {
            inner.nodes[idx].value = value;
            inner.move_to_front(idx);
            return;
        }

        if inner.nodes.len() < inner.capacity {
            let idx = inner.nodes.len();
            inner.nodes.push(LruNode {
                key: session_key.to_string(),
                value,
                prev: NIL,
                next: NIL,
            });
            inner.push_front(idx);
            inner.map.insert(session_key.to_string(), idx);
            return;
        }

        // Evict the back node and reuse it.
        let idx = inner.tail;
        let old_key = std::mem::take(&mut inner.nodes[idx].key);
        inner.map.remove(&old_key);
        inner.nodes[idx].key = session_key.to_string();
        inner.nodes[idx].value = value;
        inner.move_to_front(idx);
        inner.map.insert(session_key.to_string(), idx);
    }

    /// Look up and promote to most-recently used.
    pub fn get(&self, session_key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let idx = *inner.map.get(session_key)?;
        inner.move_to_front(idx);
        Some(inner.nodes[idx].value.clone())
    }
}

pub type ClientSessionCache = LruCache<ClientSessionState>;
pub type ServerSessionCache = LruCache<SessionState>;

/// New client session cache; capacity < 1 selects the default.
pub fn new_lru_client_session_cache(capacity: usize) -> ClientSessionCache {
    LruCache::new(capacity)
}

/// New server session cache; capacity < 1 selects the default.
pub fn new_lru_server_session_cache(capacity: usize) -> ServerSessionCache {
    LruCache::new(capacity)
}

// ---------------------------------------------------------------------------
// Server ticket sealing
// ---------------------------------------------------------------------------

const TICKET_IV_LEN: usize = 16;
const TICKET_MAC_LEN: usize = 32;

/// Seal a session into a ticket: iv ‖ AES-128-CTR(state) ‖
/// HMAC-SHA-256(mac_key, iv ‖ ciphertext).
pub fn encrypt_ticket(ticket_key: &[u8; 32], iv: &[u8; 16], state: &SessionState) -> Vec<u8> {
    let mut body = state.marshal();
    let ctr = AesCtr::new(&ticket_key[..16]);
    ctr.process(iv, &mut body);

    let mut out = Vec::with_capacity(TICKET_IV_LEN + body.len() + TICKET_MAC_LEN);
    out.extend_from_slice(iv);
    out.extend_from_slice(&body);
    let tag = hmac(MacHash::Sha256, &ticket_key[16..], &out);
    out.extend_from_slice(&tag);
    out
}

/// Open a sealed ticket. None for any framing or MAC defect.
pub fn decrypt_ticket(ticket_key: &[u8; 32], ticket: &[u8]) -> Option<SessionState> {
    if ticket.len() < TICKET_IV_LEN + TICKET_MAC_LEN {
        return None;
    }
    let (sealed, tag) = ticket.split_at(ticket.len() - TICKET_MAC_LEN);
    let expected = hmac(MacHash::Sha256, &ticket_key[16..], sealed);
    if !ct_eq(&expected, tag) {
        return None;
    }

    let iv: [u8; 16] = sealed[..TICKET_IV_LEN].try_into().ok()?;
    let mut body = sealed[TICKET_IV_LEN..].to_vec();
    let ctr = AesCtr::new(&ticket_key[..16]);
    ctr.process(&iv, &mut body);
    SessionState::unmarshal(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lru_put_get() {
        let cache = LruCache::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = LruCache::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        // Capacity 3: inserting d evicts a, the least recently used.
        cache.put("d", 4);
        assert_eq!(cache.get("a"), None);
        // b promotes to the front; e then evicts c.
        assert_eq!(cache.get("b"), Some(2));
        cache.put("e", 5);
        assert_eq!(cache.get("c"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("d"), Some(4));
        assert_eq!(cache.get("e"), Some(5));
    }

    #[test]
    fn test_lru_replace_promotes() {
        let cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("a", 10);
        cache.put("c", 3);
        // b was the least recently used after a's replacement.
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_lru_default_capacity() {
        let cache: LruCache<u32> = LruCache::new(0);
        for i in 0..65u32 {
            cache.put(&format!("key{}", i), i);
        }
        // 64 entries survive; key0 was evicted.
        assert_eq!(cache.get("key0"), None);
        assert_eq!(cache.get("key1"), Some(1));
        assert_eq!(cache.get("key64"), Some(64));
    }

    #[test]
    fn test_lru_concurrent_access() {
        let cache = Arc::new(LruCache::new(16));
        let mut handles = Vec::new();
        for t in 0..4 {
            let cache = cache.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500u32 {
                    let key = format!("k{}", (t * 31 + i) % 24);
                    cache.put(&key, i);
                    let _ = cache.get(&key);
                    let _ = cache.get("k0");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        // The list is still coherent: a full scan of the window works.
        for i in 0..24 {
            let _ = cache.get(&format!("k{}", i));
        }
    }

    #[test]
    fn test_session_state_roundtrip() {
        let state = SessionState {
            vers: crate::VERSION_TLS12,
            cipher_suite: 0x002f,
            master_secret: vec![0x5a; 48],
            certificates: vec![vec![1, 2, 3], vec![4, 5]],
            extended_master_secret: true,
            ticket_creation_time: 1_700_000_000,
            ticket_expiration: 1_700_086_400,
            ticket_age_add: 0xdeadbeef,
            early_alpn: b"h2".to_vec(),
        };
        let parsed = SessionState::unmarshal(&state.marshal()).unwrap();
        assert_eq!(parsed.vers, state.vers);
        assert_eq!(parsed.master_secret, state.master_secret);
        assert_eq!(parsed.certificates, state.certificates);
        assert!(parsed.extended_master_secret);
        assert_eq!(parsed.ticket_age_add, 0xdeadbeef);
    }

    #[test]
    fn test_ticket_seal_open() {
        let key = [0x42u8; 32];
        let iv = [7u8; 16];
        let state = SessionState {
            vers: crate::VERSION_TLS12,
            cipher_suite: 0x009c,
            master_secret: vec![3; 48],
            ..Default::default()
        };
        let ticket = encrypt_ticket(&key, &iv, &state);
        let opened = decrypt_ticket(&key, &ticket).unwrap();
        assert_eq!(opened.master_secret, state.master_secret);

        let mut corrupt = ticket.clone();
        corrupt[20] ^= 1;
        assert!(decrypt_ticket(&key, &corrupt).is_none());

        assert!(decrypt_ticket(&[9u8; 32], &ticket).is_none());
    }
}
