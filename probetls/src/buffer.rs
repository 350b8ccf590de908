//! Growable record buffers with a per-half-connection free list.
//!
//! A block holds one wire record (or raw input being accumulated) plus
//! a read offset. The free list is an owned stack; the protocol keeps
//! only a block or two in flight per direction, so it never needs
//! trimming.

use std::io::Read;

use crate::error::{Error, TlsResult};

/// One record buffer.
#[derive(Default)]
pub struct Block {
    pub data: Vec<u8>,
    /// Read cursor for `read`.
    pub off: usize,
}

impl Block {
    pub fn new() -> Block {
        Block::default()
    }

    /// Set the length, growing capacity by doubling as needed.
    pub fn resize(&mut self, n: usize) {
        if n > self.data.capacity() {
            self.reserve(n);
        }
        self.data.resize(n, 0);
    }

    /// Ensure capacity of at least n, doubling from a 1024-byte floor.
    pub fn reserve(&mut self, n: usize) {
        if self.data.capacity() >= n {
            return;
        }
        let mut m = self.data.capacity();
        if m == 0 {
            m = 1024;
        }
        while m < n {
            m *= 2;
        }
        self.data.reserve_exact(m - self.data.len());
    }

    /// Read from `r` until the block holds at least n bytes.
    pub fn read_from_until(&mut self, r: &mut dyn Read, n: usize) -> TlsResult<()> {
        if self.data.len() >= n {
            return Ok(());
        }
        self.reserve(n);
        let mut tmp = [0u8; 4096];
        while self.data.len() < n {
            let want = (n - self.data.len()).min(tmp.len());
            let got = r.read(&mut tmp[..want]).map_err(Error::from_io)?;
            if got == 0 {
                return Err(Error::UnexpectedEof);
            }
            self.data.extend_from_slice(&tmp[..got]);
        }
        Ok(())
    }

    /// Copy out from the read cursor.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.data.len() - self.off);
        out[..n].copy_from_slice(&self.data[self.off..self.off + n]);
        self.off += n;
        n
    }

    /// Bytes remaining behind the cursor.
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.off..]
    }

    pub fn is_exhausted(&self) -> bool {
        self.off >= self.data.len()
    }
}

/// Owned free list of blocks.
#[derive(Default)]
pub struct BlockPool {
    free: Vec<Block>,
}

impl BlockPool {
    /// Take a block from the pool, or allocate a fresh one.
    pub fn new_block(&mut self) -> Block {
        match self.free.pop() {
            Some(mut b) => {
                b.data.clear();
                b.off = 0;
                b
            }
            None => Block::new(),
        }
    }

    /// Return a block for reuse.
    pub fn free_block(&mut self, b: Block) {
        self.free.push(b);
    }

    /// Split off the first n bytes of `b` into its own block; the
    /// remainder (if any) comes back as the second value.
    pub fn split_block(&mut self, mut b: Block, n: usize) -> (Block, Option<Block>) {
        if b.data.len() <= n {
            return (b, None);
        }
        let mut rest = self.new_block();
        rest.resize(b.data.len() - n);
        rest.data.copy_from_slice(&b.data[n..]);
        b.data.truncate(n);
        (b, Some(rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_grows_geometrically() {
        let mut b = Block::new();
        b.resize(10);
        assert_eq!(b.data.len(), 10);
        assert!(b.data.capacity() >= 1024);
        b.resize(3000);
        assert!(b.data.capacity() >= 4096);
    }

    #[test]
    fn test_read_from_until() {
        let mut b = Block::new();
        let mut src: &[u8] = b"hello world";
        b.read_from_until(&mut src, 5).unwrap();
        assert!(b.data.len() >= 5);
        assert_eq!(&b.data[..5], b"hello");

        let mut empty: &[u8] = b"";
        let mut c = Block::new();
        assert_eq!(c.read_from_until(&mut empty, 1), Err(Error::UnexpectedEof));
    }

    #[test]
    fn test_split_and_pool() {
        let mut pool = BlockPool::default();
        let mut b = pool.new_block();
        b.data.extend_from_slice(b"0123456789");

        let (head, rest) = pool.split_block(b, 4);
        assert_eq!(&head.data[..], b"0123");
        let rest = rest.unwrap();
        assert_eq!(&rest.data[..], b"456789");

        pool.free_block(head);
        let reused = pool.new_block();
        assert!(reused.data.is_empty());

        let (whole, none) = pool.split_block(rest, 100);
        assert!(none.is_none());
        assert_eq!(&whole.data[..], b"456789");
    }

    #[test]
    fn test_cursor_read() {
        let mut b = Block::new();
        b.data.extend_from_slice(b"abcdef");
        let mut out = [0u8; 4];
        assert_eq!(b.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert!(!b.is_exhausted());
        assert_eq!(b.remaining(), b"ef");
        let mut out2 = [0u8; 4];
        assert_eq!(b.read(&mut out2), 2);
        assert!(b.is_exhausted());
    }
}
