//! Byte stream returned by range reads.

use std::collections::VecDeque;
use std::io::{self, Read};

use bytes::{Buf, Bytes};

/// The bytes of an uncompressed range, one chunk per span in ascending
/// span order.
#[derive(Debug, Clone, Default)]
pub struct Contents {
    chunks: VecDeque<Bytes>,
    remaining: usize,
}

impl Contents {
    /// Stream over `chunks` in order.
    #[must_use]
    pub fn new(chunks: Vec<Bytes>) -> Self {
        let remaining = chunks.iter().map(Bytes::len).sum();
        Self {
            chunks: chunks.into(),
            remaining,
        }
    }

    /// Bytes not yet read.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.remaining
    }

    /// Returns `true` once every byte has been read.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Collects the unread bytes.
    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

impl Read for Contents {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(front) = self.chunks.front_mut() {
            if front.is_empty() {
                let _ = self.chunks.pop_front();
                continue;
            }
            let n = front.len().min(buf.len());
            buf[..n].copy_from_slice(&front[..n]);
            front.advance(n);
            self.remaining -= n;
            return Ok(n);
        }
        Ok(0)
    }
}
