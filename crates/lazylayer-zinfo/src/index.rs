//! Span index over a gzip stream.
//!
//! A checkpoint is placed at a DEFLATE block boundary roughly every
//! `span_size` uncompressed bytes. Each checkpoint remembers the bit
//! position of the boundary and the 32 KiB of output preceding it, which is
//! all a decoder needs to start there without any earlier data.

use std::fmt;
use std::io::Read;

use lazylayer_common::constants::WINDOW_SIZE;
use lazylayer_common::error::{LazyLayerError, Result};
use lazylayer_common::types::SpanId;

use crate::gzip;
use crate::inflate::{BitReader, InflateError, Inflater};

/// History kept beyond the window before the build buffer is compacted.
const COMPACT_THRESHOLD: usize = 1024 * 1024;

/// Coordinate conversions and span-local decompression for one compressed
/// stream.
///
/// `GzipIndex` is the gzip implementation; another codec plugs in by
/// implementing this trait.
pub trait SpanIndex: Send + Sync + fmt::Debug {
    /// Uncompressed distance the index was built with.
    fn span_size(&self) -> u64;

    /// Number of spans (equal to the number of checkpoints).
    fn span_count(&self) -> usize;

    /// Last valid span id, `None` for a stream without spans.
    fn max_span_id(&self) -> Option<SpanId> {
        let count = u32::try_from(self.span_count()).ok()?;
        count.checked_sub(1).map(SpanId::new)
    }

    /// Span containing `offset`. Offsets past the end map to the last span.
    fn uncompressed_offset_to_span_id(&self, offset: u64) -> Option<SpanId>;

    /// First compressed byte holding data of `span`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::ExceedsMaxSpan` for an unknown span.
    fn start_compressed_offset(&self, span: SpanId) -> Result<u64>;

    /// Exclusive end of the compressed bytes of `span`; `compressed_size`
    /// for the last span.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::ExceedsMaxSpan` for an unknown span.
    fn end_compressed_offset(&self, span: SpanId, compressed_size: u64) -> Result<u64>;

    /// First uncompressed byte of `span`.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::ExceedsMaxSpan` for an unknown span.
    fn start_uncompressed_offset(&self, span: SpanId) -> Result<u64>;

    /// Exclusive end of the uncompressed bytes of `span`;
    /// `uncompressed_size` for the last span.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::ExceedsMaxSpan` for an unknown span.
    fn end_uncompressed_offset(&self, span: SpanId, uncompressed_size: u64) -> Result<u64>;

    /// Decompresses `uncompressed_size` bytes starting at the absolute
    /// `uncompressed_offset`, using only the compressed bytes of `span`
    /// (from [`start_compressed_offset`](Self::start_compressed_offset)).
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Extraction` on corrupt input, an offset
    /// before the span, or data ending before enough output was produced.
    fn extract_span(
        &self,
        compressed: &[u8],
        uncompressed_size: u64,
        uncompressed_offset: u64,
        span: SpanId,
    ) -> Result<Vec<u8>>;
}

/// Decoder state at a span boundary.
#[derive(Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub(crate) span: SpanId,
    pub(crate) compressed_offset: u64,
    pub(crate) bits: u8,
    pub(crate) uncompressed_offset: u64,
    pub(crate) window: Box<[u8]>,
}

impl Checkpoint {
    fn at_bit_position(span: SpanId, bit_position: u64, uncompressed_offset: u64, history: &[u8]) -> Self {
        let consumed = bit_position % 8;
        let (compressed_offset, bits) = if consumed == 0 {
            (bit_position / 8, 0)
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let unused = (8 - consumed) as u8;
            (bit_position / 8 + 1, unused)
        };
        let mut window = vec![0u8; WINDOW_SIZE].into_boxed_slice();
        let tail = &history[history.len().saturating_sub(WINDOW_SIZE)..];
        window[WINDOW_SIZE - tail.len()..].copy_from_slice(tail);
        Self {
            span,
            compressed_offset,
            bits,
            uncompressed_offset,
            window,
        }
    }

    /// Span starting at this checkpoint.
    #[must_use]
    pub const fn span(&self) -> SpanId {
        self.span
    }

    /// First compressed byte not touched by the previous span.
    ///
    /// When [`bits`](Self::bits) is non-zero the span starts inside the
    /// byte before it.
    #[must_use]
    pub const fn compressed_offset(&self) -> u64 {
        self.compressed_offset
    }

    /// Unused high bits of the byte at `compressed_offset - 1` (0..=7).
    #[must_use]
    pub const fn bits(&self) -> u8 {
        self.bits
    }

    /// Uncompressed offset of the boundary.
    #[must_use]
    pub const fn uncompressed_offset(&self) -> u64 {
        self.uncompressed_offset
    }

    /// The 32 KiB of uncompressed output preceding the boundary,
    /// zero-padded at the front near the start of the stream.
    #[must_use]
    pub fn window(&self) -> &[u8] {
        &self.window
    }

    const fn start_byte(&self) -> u64 {
        if self.bits > 0 {
            self.compressed_offset - 1
        } else {
            self.compressed_offset
        }
    }

    const fn skip_bits(&self) -> u32 {
        (8 - self.bits as u32) % 8
    }
}

impl fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpoint")
            .field("span", &self.span)
            .field("compressed_offset", &self.compressed_offset)
            .field("bits", &self.bits)
            .field("uncompressed_offset", &self.uncompressed_offset)
            .finish_non_exhaustive()
    }
}

/// Sizes observed while building an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSizes {
    /// Bytes of the gzip member, header and trailer included.
    pub compressed: u64,
    /// Bytes of decompressed output.
    pub uncompressed: u64,
}

/// Checkpoint table of a gzip stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GzipIndex {
    pub(crate) span_size: u64,
    pub(crate) checkpoints: Vec<Checkpoint>,
}

impl GzipIndex {
    /// Scans a gzip stream once and records its checkpoints.
    ///
    /// Only the first gzip member is indexed. The member trailer is
    /// checked against the decoded output.
    ///
    /// # Errors
    ///
    /// Returns `LazyLayerError::Config` for a zero `span_size` and
    /// `LazyLayerError::Format` for truncated or invalid input.
    pub fn build<R: Read>(reader: R, span_size: u64) -> Result<(Self, StreamSizes)> {
        if span_size == 0 {
            return Err(LazyLayerError::Config {
                message: "span size must be greater than zero".into(),
            });
        }

        let mut inflater = Inflater::new(BitReader::new(reader), &[]);
        gzip::read_header(inflater.reader_mut()).map_err(build_error)?;

        let mut checkpoints: Vec<Checkpoint> = Vec::new();
        let mut crc = flate2::Crc::new();
        let mut flushed: u64 = 0;
        let mut last: Option<u64> = None;
        loop {
            let produced = flushed + inflater.output().len() as u64;
            if last.is_none_or(|at| produced - at >= span_size) {
                let span = SpanId::new(u32::try_from(checkpoints.len()).map_err(|_| {
                    LazyLayerError::format("stream has more spans than span ids")
                })?);
                checkpoints.push(Checkpoint::at_bit_position(
                    span,
                    inflater.bit_position(),
                    produced,
                    inflater.output(),
                ));
                last = Some(produced);
                tracing::trace!(span = %span, uncompressed_offset = produced, "checkpoint");
            }

            let final_block = inflater.inflate_block().map_err(build_error)?;

            let buffered = inflater.output().len();
            if buffered > WINDOW_SIZE + COMPACT_THRESHOLD {
                let drop = buffered - WINDOW_SIZE;
                crc.update(&inflater.output()[..drop]);
                inflater.discard_front(drop);
                flushed += drop as u64;
            }
            if final_block {
                break;
            }
        }
        crc.update(inflater.output());
        let uncompressed = flushed + inflater.output().len() as u64;

        let trailer = gzip::read_trailer(inflater.reader_mut()).map_err(build_error)?;
        if trailer.crc32 != crc.sum() {
            return Err(LazyLayerError::format(format!(
                "gzip CRC-32 mismatch: trailer {:#010x}, data {:#010x}",
                trailer.crc32,
                crc.sum()
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let size_mod_32 = uncompressed as u32;
        if trailer.size != size_mod_32 {
            return Err(LazyLayerError::format(format!(
                "gzip length mismatch: trailer {}, data {uncompressed}",
                trailer.size
            )));
        }
        let compressed = inflater.bit_position() / 8;
        if !inflater.reader_mut().is_exhausted().map_err(build_error)? {
            tracing::debug!(compressed, "ignoring data after the first gzip member");
        }

        while checkpoints
            .last()
            .is_some_and(|c| c.uncompressed_offset >= uncompressed)
        {
            let _ = checkpoints.pop();
        }

        tracing::info!(
            spans = checkpoints.len(),
            span_size,
            compressed,
            uncompressed,
            "built span index"
        );
        Ok((
            Self {
                span_size,
                checkpoints,
            },
            StreamSizes {
                compressed,
                uncompressed,
            },
        ))
    }

    /// All checkpoints in span order.
    #[must_use]
    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    fn checkpoint(&self, span: SpanId) -> Result<&Checkpoint> {
        self.checkpoints
            .get(span.index())
            .ok_or_else(|| LazyLayerError::ExceedsMaxSpan {
                span,
                max_span: self.max_span_id(),
            })
    }
}

impl SpanIndex for GzipIndex {
    fn span_size(&self) -> u64 {
        self.span_size
    }

    fn span_count(&self) -> usize {
        self.checkpoints.len()
    }

    fn uncompressed_offset_to_span_id(&self, offset: u64) -> Option<SpanId> {
        if self.checkpoints.is_empty() {
            return None;
        }
        let after = self
            .checkpoints
            .partition_point(|c| c.uncompressed_offset <= offset);
        self.checkpoints.get(after.saturating_sub(1)).map(|c| c.span)
    }

    fn start_compressed_offset(&self, span: SpanId) -> Result<u64> {
        Ok(self.checkpoint(span)?.start_byte())
    }

    fn end_compressed_offset(&self, span: SpanId, compressed_size: u64) -> Result<u64> {
        let _ = self.checkpoint(span)?;
        Ok(self
            .checkpoints
            .get(span.index() + 1)
            .map_or(compressed_size, |next| next.compressed_offset))
    }

    fn start_uncompressed_offset(&self, span: SpanId) -> Result<u64> {
        Ok(self.checkpoint(span)?.uncompressed_offset)
    }

    fn end_uncompressed_offset(&self, span: SpanId, uncompressed_size: u64) -> Result<u64> {
        let _ = self.checkpoint(span)?;
        Ok(self
            .checkpoints
            .get(span.index() + 1)
            .map_or(uncompressed_size, |next| next.uncompressed_offset))
    }

    fn extract_span(
        &self,
        compressed: &[u8],
        uncompressed_size: u64,
        uncompressed_offset: u64,
        span: SpanId,
    ) -> Result<Vec<u8>> {
        if uncompressed_size == 0 {
            return Ok(Vec::new());
        }
        let checkpoint = self.checkpoint(span)?;
        let extraction = |message: String| LazyLayerError::Extraction { span, message };

        let skip = uncompressed_offset
            .checked_sub(checkpoint.uncompressed_offset)
            .ok_or_else(|| {
                extraction(format!(
                    "offset {uncompressed_offset} precedes the span start {}",
                    checkpoint.uncompressed_offset
                ))
            })?;
        let start = WINDOW_SIZE
            + usize::try_from(skip).map_err(|_| extraction("offset too large".into()))?;
        let end = start
            + usize::try_from(uncompressed_size)
                .map_err(|_| extraction("size too large".into()))?;

        let mut inflater = Inflater::new(BitReader::new(compressed), &checkpoint.window);
        let _ = inflater
            .reader_mut()
            .bits(checkpoint.skip_bits())
            .map_err(|e| extraction(e.to_string()))?;
        while inflater.output().len() < end {
            let final_block = inflater
                .inflate_block()
                .map_err(|e| extraction(e.to_string()))?;
            if final_block && inflater.output().len() < end {
                return Err(extraction(format!(
                    "stream ended after {} bytes, {uncompressed_size} requested",
                    inflater.output().len().saturating_sub(start)
                )));
            }
        }

        let mut out = inflater.into_output();
        out.truncate(end);
        let _ = out.drain(..start);
        tracing::trace!(span = %span, bytes = out.len(), "extracted span");
        Ok(out)
    }
}

fn build_error(err: InflateError) -> LazyLayerError {
    match err {
        InflateError::Io(source) => LazyLayerError::Transport { offset: 0, source },
        other => LazyLayerError::format(other.to_string()),
    }
}
