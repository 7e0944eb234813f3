//! Wire-format primitives shared by every decoder in the crate.
//!
//! All integers are big-endian and fixed-width. A string is nullable: one
//! flag byte, then a `u64` byte length and UTF-8 bytes when the flag is 1.
//! Dynamic sequences carry a length prefix whose width is declared per field
//! with a [`LenTag`].

use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use sha2::digest::Update;
use thiserror::Error;

/// Ceiling on string and sequence length prefixes. A defence against
/// corrupted or hostile input, not a format limit.
pub const MAX_LEN: u64 = 4096;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid magic bytes {found:02x?}, expected {expected:02x?}")]
    InvalidMagic {
        expected: &'static [u8],
        found: Vec<u8>,
    },
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("checksum mismatch: stored {stored}, calculated {calculated}")]
    ChecksumMismatch { stored: String, calculated: String },
    #[error("invalid null flag: {0}")]
    InvalidNullFlag(u8),
    #[error("length {0} exceeds the {MAX_LEN} element ceiling")]
    TooLong(u64),
    #[error("sequence field has no length-prefix width")]
    UnknownSequenceLength,
    #[error("nonzero alignment bytes in pack index object")]
    InvalidAlignment,
    #[error("invalid hash: {0}")]
    InvalidHash(String),
}

/// A type that knows how to reconstruct itself from the wire.
///
/// Struct implementations read each field in declared order; types with
/// non-default framing (hashes, checksummed containers) override the whole
/// sequence themselves.
pub trait ArqDecode: Sized {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError>;
}

impl ArqDecode for u8 {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(r.read_u8()?)
    }
}

impl ArqDecode for i8 {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(r.read_i8()?)
    }
}

impl ArqDecode for u32 {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(r.read_u32::<BigEndian>()?)
    }
}

impl ArqDecode for i32 {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(r.read_i32::<BigEndian>()?)
    }
}

impl ArqDecode for u64 {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(r.read_u64::<BigEndian>()?)
    }
}

impl ArqDecode for i64 {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(r.read_i64::<BigEndian>()?)
    }
}

impl ArqDecode for bool {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        Ok(r.read_u8()? == 1)
    }
}

impl<const N: usize> ArqDecode for [u8; N] {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let mut buf = [0u8; N];
        r.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl ArqDecode for String {
    /// Nullable framing: flag byte, then `u64` length and bytes when present.
    /// A flag of 0 consumes nothing further; a flag above 1 is rejected.
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let flag = r.read_u8()?;
        if flag > 1 {
            return Err(DecodeError::InvalidNullFlag(flag));
        }
        if flag != 1 {
            return Ok(String::new());
        }
        let length = r.read_u64::<BigEndian>()?;
        if length > MAX_LEN {
            return Err(DecodeError::TooLong(length));
        }
        let mut buf = vec![0u8; length as usize];
        r.read_exact(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

/// Width of a sequence field's count prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenTag {
    U32,
    U64,
    /// No width declared. Decoding an untagged sequence is an error.
    Untagged,
}

pub fn read_count<R: Read>(r: &mut R, tag: LenTag) -> Result<u64, DecodeError> {
    let n = match tag {
        LenTag::U32 => u64::from(r.read_u32::<BigEndian>()?),
        LenTag::U64 => r.read_u64::<BigEndian>()?,
        LenTag::Untagged => return Err(DecodeError::UnknownSequenceLength),
    };
    if n > MAX_LEN {
        return Err(DecodeError::TooLong(n));
    }
    Ok(n)
}

pub fn read_seq<T: ArqDecode, R: Read>(r: &mut R, tag: LenTag) -> Result<Vec<T>, DecodeError> {
    let n = read_count(r, tag)?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(T::decode(r)?);
    }
    Ok(out)
}

/// Byte-sequence fast path: one bulk read instead of per-element decoding.
pub fn read_data<R: Read>(r: &mut R, tag: LenTag) -> Result<Vec<u8>, DecodeError> {
    let n = read_count(r, tag)?;
    let mut buf = vec![0u8; n as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Seconds/nanoseconds pair as stored on the wire (two `i64`s, no flag byte).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.sec, u32::try_from(self.nsec).ok()?)
    }
}

impl ArqDecode for TimeSpec {
    fn decode<R: Read>(r: &mut R) -> Result<Self, DecodeError> {
        let sec = r.read_i64::<BigEndian>()?;
        let nsec = r.read_i64::<BigEndian>()?;
        Ok(TimeSpec { sec, nsec })
    }
}

/// Nullable millisecond-epoch timestamp: flag byte, then `i64` millis.
/// Any flag other than 1 means absent.
pub fn read_time_millis<R: Read>(r: &mut R) -> Result<Option<DateTime<Utc>>, DecodeError> {
    let flag = r.read_u8()?;
    if flag != 1 {
        return Ok(None);
    }
    let millis = r.read_i64::<BigEndian>()?;
    Ok(DateTime::from_timestamp_millis(millis))
}

/// Mirrors every byte read into a running digest or MAC.
///
/// Checksummed containers decode through one of these and compare the
/// accumulated digest against the trailing hash; the object decrypter uses
/// the same adapter with an HMAC.
pub struct TeeReader<R, D> {
    inner: R,
    digest: D,
}

impl<R: Read, D: Update> TeeReader<R, D> {
    pub fn new(inner: R, digest: D) -> Self {
        Self { inner, digest }
    }

    pub fn digest(&self) -> &D {
        &self.digest
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read, D: Update> Read for TeeReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}
