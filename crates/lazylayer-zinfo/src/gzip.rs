//! gzip member framing (RFC 1952).

use std::io::Read;

use crate::inflate::{BitReader, InflateError};

const ID1: u8 = 0x1f;
const ID2: u8 = 0x8b;
const CM_DEFLATE: u8 = 8;

const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const FRESERVED: u8 = 0xe0;

/// CRC-32 and length recorded after the compressed data of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Trailer {
    pub(crate) crc32: u32,
    /// Uncompressed size modulo 2^32.
    pub(crate) size: u32,
}

/// Consumes a member header, leaving the reader at the first DEFLATE bit.
pub(crate) fn read_header<R: Read>(reader: &mut BitReader<R>) -> Result<(), InflateError> {
    if reader.byte()? != ID1 || reader.byte()? != ID2 {
        return Err(InflateError::Invalid("not a gzip stream"));
    }
    if reader.byte()? != CM_DEFLATE {
        return Err(InflateError::Invalid("unsupported gzip compression method"));
    }
    let flags = reader.byte()?;
    if flags & FRESERVED != 0 {
        return Err(InflateError::Invalid("reserved gzip header flags set"));
    }
    // MTIME, XFL, OS
    for _ in 0..6 {
        let _ = reader.byte()?;
    }
    if flags & FEXTRA != 0 {
        let len = reader.le_u16()?;
        for _ in 0..len {
            let _ = reader.byte()?;
        }
    }
    if flags & FNAME != 0 {
        skip_zero_terminated(reader)?;
    }
    if flags & FCOMMENT != 0 {
        skip_zero_terminated(reader)?;
    }
    if flags & FHCRC != 0 {
        let _ = reader.le_u16()?;
    }
    Ok(())
}

/// Reads the trailer that follows the final DEFLATE block.
pub(crate) fn read_trailer<R: Read>(reader: &mut BitReader<R>) -> Result<Trailer, InflateError> {
    reader.align_to_byte();
    let crc32 = reader.le_u32()?;
    let size = reader.le_u32()?;
    Ok(Trailer { crc32, size })
}

fn skip_zero_terminated<R: Read>(reader: &mut BitReader<R>) -> Result<(), InflateError> {
    while reader.byte()? != 0 {}
    Ok(())
}
