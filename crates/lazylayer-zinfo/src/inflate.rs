//! Raw DEFLATE (RFC 1951) decoder that can start at any block boundary.
//!
//! Decoding proceeds one whole block at a time so callers can observe
//! block boundaries (to place checkpoints) and can resume a stream from a
//! recorded bit position with a preset 32 KiB window.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use std::io::{self, Read};
use std::sync::OnceLock;

use thiserror::Error;

const MAX_BITS: usize = 15;
const MAX_LITLEN_CODES: usize = 286;
const MAX_DIST_CODES: usize = 30;
const FIXED_LITLEN_CODES: usize = 288;
const READ_CHUNK: usize = 64 * 1024;

const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115,
    131, 163, 195, 227, 258,
];
const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const DIST_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
const DIST_EXTRA: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
const CODE_LENGTH_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

/// Failure while decoding a DEFLATE or gzip stream.
#[derive(Debug, Error)]
pub(crate) enum InflateError {
    /// The input ended in the middle of the stream.
    #[error("unexpected end of compressed data")]
    Truncated,
    /// The input violates the format.
    #[error("{0}")]
    Invalid(&'static str),
    /// Reading the underlying source failed.
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

type InflateResult<T> = Result<T, InflateError>;

/// LSB-first bit reader over any byte source.
///
/// Bits past the end of input read as zero when peeked; consuming them
/// fails with [`InflateError::Truncated`].
pub(crate) struct BitReader<R> {
    source: R,
    chunk: Box<[u8]>,
    chunk_pos: usize,
    chunk_len: usize,
    eof: bool,
    bit_buf: u64,
    bit_count: u32,
    bytes_pulled: u64,
}

impl<R: Read> BitReader<R> {
    pub(crate) fn new(source: R) -> Self {
        Self {
            source,
            chunk: vec![0; READ_CHUNK].into_boxed_slice(),
            chunk_pos: 0,
            chunk_len: 0,
            eof: false,
            bit_buf: 0,
            bit_count: 0,
            bytes_pulled: 0,
        }
    }

    /// Number of bits consumed since the start of the source.
    pub(crate) const fn bit_position(&self) -> u64 {
        self.bytes_pulled * 8 - self.bit_count as u64
    }

    fn refill(&mut self) -> io::Result<()> {
        while self.bit_count <= 56 {
            if self.chunk_pos == self.chunk_len {
                if self.eof {
                    break;
                }
                let n = loop {
                    match self.source.read(&mut self.chunk) {
                        Ok(n) => break n,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                };
                if n == 0 {
                    self.eof = true;
                    break;
                }
                self.chunk_pos = 0;
                self.chunk_len = n;
            }
            self.bit_buf |= u64::from(self.chunk[self.chunk_pos]) << self.bit_count;
            self.chunk_pos += 1;
            self.bit_count += 8;
            self.bytes_pulled += 1;
        }
        Ok(())
    }

    /// Returns the next `n` bits (at most 32) without consuming them.
    pub(crate) fn peek(&mut self, n: u32) -> InflateResult<u32> {
        debug_assert!(n <= 32);
        if self.bit_count < n {
            self.refill()?;
        }
        let value = (self.bit_buf & ((1u64 << n) - 1)) as u32;
        Ok(value)
    }

    pub(crate) fn consume(&mut self, n: u32) -> InflateResult<()> {
        if n > self.bit_count {
            return Err(InflateError::Truncated);
        }
        self.bit_buf >>= n;
        self.bit_count -= n;
        Ok(())
    }

    pub(crate) fn bits(&mut self, n: u32) -> InflateResult<u32> {
        if n == 0 {
            return Ok(0);
        }
        let value = self.peek(n)?;
        self.consume(n)?;
        Ok(value)
    }

    pub(crate) fn byte(&mut self) -> InflateResult<u8> {
        Ok(self.bits(8)? as u8)
    }

    pub(crate) fn le_u16(&mut self) -> InflateResult<u16> {
        let value = self.bits(16)? as u16;
        Ok(value)
    }

    pub(crate) fn le_u32(&mut self) -> InflateResult<u32> {
        self.bits(32)
    }

    /// Drops the remaining bits of a partially consumed byte.
    pub(crate) fn align_to_byte(&mut self) {
        let partial = self.bit_count % 8;
        self.bit_buf >>= partial;
        self.bit_count -= partial;
    }

    /// Returns `true` when no input is left.
    pub(crate) fn is_exhausted(&mut self) -> InflateResult<bool> {
        if self.bit_count == 0 {
            self.refill()?;
        }
        Ok(self.bit_count == 0)
    }
}

/// Canonical Huffman decoding table.
struct Huffman {
    counts: [u16; MAX_BITS + 1],
    symbols: Vec<u16>,
}

impl Huffman {
    /// Builds a table from per-symbol code lengths.
    ///
    /// Returns the table and the number of unused codes (`0` for a
    /// complete code). Over-subscribed codes are rejected.
    fn new(lengths: &[u8]) -> InflateResult<(Self, i32)> {
        let table = Self::build(lengths);
        if usize::from(table.counts[0]) == lengths.len() {
            return Ok((table, 0));
        }

        let mut left: i32 = 1;
        for &count in &table.counts[1..] {
            left <<= 1;
            left -= i32::from(count);
            if left < 0 {
                return Err(InflateError::Invalid("over-subscribed Huffman code"));
            }
        }
        Ok((table, left))
    }

    /// Sorts symbols by code length without checking the code is valid.
    fn build(lengths: &[u8]) -> Self {
        let mut counts = [0u16; MAX_BITS + 1];
        for &len in lengths {
            counts[usize::from(len)] += 1;
        }
        let mut symbols = vec![0u16; lengths.len()];
        let mut offsets = [0usize; MAX_BITS + 2];
        for len in 1..=MAX_BITS {
            offsets[len + 1] = offsets[len] + usize::from(counts[len]);
        }
        for (symbol, &len) in lengths.iter().enumerate() {
            if len != 0 {
                let slot = &mut offsets[usize::from(len)];
                symbols[*slot] = symbol as u16;
                *slot += 1;
            }
        }
        Self { counts, symbols }
    }

    fn decode<R: Read>(&self, reader: &mut BitReader<R>) -> InflateResult<u16> {
        let peeked = reader.peek(MAX_BITS as u32)?;
        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;
        for len in 1..=MAX_BITS {
            code |= ((peeked >> (len - 1)) & 1) as i32;
            let count = i32::from(self.counts[len]);
            if code - first < count {
                reader.consume(len as u32)?;
                return Ok(self.symbols[(index + code - first) as usize]);
            }
            index += count;
            first += count;
            first <<= 1;
            code <<= 1;
        }
        if reader.is_exhausted()? {
            return Err(InflateError::Truncated);
        }
        Err(InflateError::Invalid("invalid Huffman code"))
    }
}

fn fixed_tables() -> &'static (Huffman, Huffman) {
    static FIXED: OnceLock<(Huffman, Huffman)> = OnceLock::new();
    FIXED.get_or_init(|| {
        let mut lengths = [0u8; FIXED_LITLEN_CODES];
        lengths[..144].fill(8);
        lengths[144..256].fill(9);
        lengths[256..280].fill(7);
        lengths[280..].fill(8);
        let dist_lengths = [5u8; MAX_DIST_CODES];
        (Huffman::build(&lengths), Huffman::build(&dist_lengths))
    })
}

/// Block-at-a-time DEFLATE decoder.
///
/// Output accumulates in a buffer that starts with the preset window, so
/// back-references into the window resolve like any other history.
pub(crate) struct Inflater<R> {
    reader: BitReader<R>,
    out: Vec<u8>,
}

impl<R: Read> Inflater<R> {
    /// Creates a decoder whose history starts with `window`.
    pub(crate) fn new(reader: BitReader<R>, window: &[u8]) -> Self {
        Self {
            reader,
            out: window.to_vec(),
        }
    }

    pub(crate) const fn reader_mut(&mut self) -> &mut BitReader<R> {
        &mut self.reader
    }

    pub(crate) const fn bit_position(&self) -> u64 {
        self.reader.bit_position()
    }

    /// History plus everything decoded so far.
    pub(crate) fn output(&self) -> &[u8] {
        &self.out
    }

    pub(crate) fn into_output(self) -> Vec<u8> {
        self.out
    }

    /// Drops the oldest `n` bytes of history.
    pub(crate) fn discard_front(&mut self, n: usize) {
        let _ = self.out.drain(..n.min(self.out.len()));
    }

    /// Decodes one complete block. Returns `true` if it was the final one.
    pub(crate) fn inflate_block(&mut self) -> InflateResult<bool> {
        let last = self.reader.bits(1)? == 1;
        match self.reader.bits(2)? {
            0 => self.stored()?,
            1 => {
                let (lit, dist) = fixed_tables();
                self.codes(lit, dist)?;
            }
            2 => {
                let (lit, dist) = self.dynamic_tables()?;
                self.codes(&lit, &dist)?;
            }
            _ => return Err(InflateError::Invalid("invalid block type")),
        }
        Ok(last)
    }

    fn stored(&mut self) -> InflateResult<()> {
        self.reader.align_to_byte();
        let len = self.reader.le_u16()?;
        let nlen = self.reader.le_u16()?;
        if len != !nlen {
            return Err(InflateError::Invalid("stored block length does not match its complement"));
        }
        self.out.reserve(usize::from(len));
        for _ in 0..len {
            let byte = self.reader.byte()?;
            self.out.push(byte);
        }
        Ok(())
    }

    fn dynamic_tables(&mut self) -> InflateResult<(Huffman, Huffman)> {
        let nlen = self.reader.bits(5)? as usize + 257;
        let ndist = self.reader.bits(5)? as usize + 1;
        let ncode = self.reader.bits(4)? as usize + 4;
        if nlen > MAX_LITLEN_CODES || ndist > MAX_DIST_CODES {
            return Err(InflateError::Invalid("too many length or distance codes"));
        }

        let mut lengths = [0u8; MAX_LITLEN_CODES + MAX_DIST_CODES];
        for &slot in &CODE_LENGTH_ORDER[..ncode] {
            lengths[slot] = self.reader.bits(3)? as u8;
        }
        let (lencode, left) = Huffman::new(&lengths[..19])?;
        if left != 0 {
            return Err(InflateError::Invalid("incomplete code length code"));
        }

        let total = nlen + ndist;
        lengths[..19].fill(0);
        let mut index = 0;
        while index < total {
            let symbol = lencode.decode(&mut self.reader)?;
            if symbol < 16 {
                lengths[index] = symbol as u8;
                index += 1;
                continue;
            }
            let (value, repeat) = match symbol {
                16 => {
                    if index == 0 {
                        return Err(InflateError::Invalid("repeat with no previous length"));
                    }
                    (lengths[index - 1], 3 + self.reader.bits(2)? as usize)
                }
                17 => (0, 3 + self.reader.bits(3)? as usize),
                _ => (0, 11 + self.reader.bits(7)? as usize),
            };
            if index + repeat > total {
                return Err(InflateError::Invalid("too many code lengths"));
            }
            lengths[index..index + repeat].fill(value);
            index += repeat;
        }

        if lengths[256] == 0 {
            return Err(InflateError::Invalid("missing end-of-block code"));
        }
        // An incomplete code is only allowed as a single one-bit code.
        let (lit, left) = Huffman::new(&lengths[..nlen])?;
        if left > 0 && (nlen - usize::from(lit.counts[0]) != 1 || lit.counts[1] != 1) {
            return Err(InflateError::Invalid("incomplete literal/length code"));
        }
        let (dist, left) = Huffman::new(&lengths[nlen..total])?;
        if left > 0 && (ndist - usize::from(dist.counts[0]) != 1 || dist.counts[1] != 1) {
            return Err(InflateError::Invalid("incomplete distance code"));
        }
        Ok((lit, dist))
    }

    fn codes(&mut self, lit: &Huffman, dist: &Huffman) -> InflateResult<()> {
        loop {
            let symbol = usize::from(lit.decode(&mut self.reader)?);
            if symbol < 256 {
                self.out.push(symbol as u8);
                continue;
            }
            if symbol == 256 {
                return Ok(());
            }

            let symbol = symbol - 257;
            if symbol >= LENGTH_BASE.len() {
                return Err(InflateError::Invalid("invalid length symbol"));
            }
            let len = usize::from(LENGTH_BASE[symbol])
                + self.reader.bits(u32::from(LENGTH_EXTRA[symbol]))? as usize;

            let symbol = usize::from(dist.decode(&mut self.reader)?);
            if symbol >= DIST_BASE.len() {
                return Err(InflateError::Invalid("invalid distance symbol"));
            }
            let distance = usize::from(DIST_BASE[symbol])
                + self.reader.bits(u32::from(DIST_EXTRA[symbol]))? as usize;
            if distance > self.out.len() {
                return Err(InflateError::Invalid("distance too far back"));
            }

            let start = self.out.len() - distance;
            if distance >= len {
                self.out.extend_from_within(start..start + len);
            } else {
                self.out.reserve(len);
                for i in 0..len {
                    let byte = self.out[start + i];
                    self.out.push(byte);
                }
            }
        }
    }
}
