//! Wire codec for the transfer protocol.
//!
//! Every value is self-delimiting:
//! - fixed-width integers and doubles are written with their natural width
//!   (4 or 8 bytes) in **native byte order**;
//! - strings are `u32 length | raw bytes` (no terminator, no UTF-8 check);
//! - numeric vectors are `u32 element_count | element_count * u64`.
//!
//! Byte order is not negotiated. Both peers must run on hosts with the same
//! endianness; this is a deployment precondition.
//!
//! The codec knows nothing about message boundaries. A chunk stream is simply
//! a sequence of string encodings (see [`crate::streaming::channel`]).

use crate::error::{Result, TransferError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request tag of the file upload handler.
pub const FILE_UPLOAD_TAG: u64 = 1;

/// Auxiliary request payload. Unused, reserved for protocol versioning.
pub const AUX_UNUSED: i32 = 0;

/// First four bytes of every connection ("FRRY").
pub const REQUEST_MAGIC: u32 = 0x4652_5259;

/// Default block size (the unbuffered I/O alignment granularity).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Size of the `u32` length prefix carried by strings and vectors.
pub const LENGTH_PREFIX_SIZE: usize = 4;

// =============================================================================
// Encode / Decode
// =============================================================================

/// A value with a wire encoding.
pub trait Encode {
    /// Append the encoding of `self` to `out`.
    fn encode(&self, out: &mut BytesMut) -> Result<()>;

    /// Number of bytes `encode` will append.
    fn encoded_len(&self) -> usize;
}

/// A value that can be read back from its wire encoding.
pub trait Decode: Sized {
    /// Consume one value from the front of `input`.
    fn decode(input: &mut Bytes) -> Result<Self>;
}

fn ensure_remaining(input: &Bytes, needed: usize) -> Result<()> {
    if input.remaining() < needed {
        return Err(TransferError::TruncatedInput {
            needed,
            remaining: input.remaining(),
        });
    }
    Ok(())
}

fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| TransferError::LengthOverflow(len))
}

/// Encode a single value into a fresh buffer.
pub fn encode_to_bytes<T: Encode + ?Sized>(value: &T) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(value.encoded_len());
    value.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a single value from the front of `input`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode_from_slice<T: Decode>(input: &[u8]) -> Result<(T, usize)> {
    let mut bytes = Bytes::copy_from_slice(input);
    let value = T::decode(&mut bytes)?;
    Ok((value, input.len() - bytes.remaining()))
}

macro_rules! fixed_width {
    ($ty:ty, $put:ident, $get:ident) => {
        impl Encode for $ty {
            fn encode(&self, out: &mut BytesMut) -> Result<()> {
                out.$put(*self);
                Ok(())
            }

            fn encoded_len(&self) -> usize {
                std::mem::size_of::<$ty>()
            }
        }

        impl Decode for $ty {
            fn decode(input: &mut Bytes) -> Result<Self> {
                ensure_remaining(input, std::mem::size_of::<$ty>())?;
                Ok(input.$get())
            }
        }
    };
}

fixed_width!(i32, put_i32_ne, get_i32_ne);
fixed_width!(u32, put_u32_ne, get_u32_ne);
fixed_width!(i64, put_i64_ne, get_i64_ne);
fixed_width!(u64, put_u64_ne, get_u64_ne);
fixed_width!(f64, put_f64_ne, get_f64_ne);

// =============================================================================
// Strings
// =============================================================================

impl Encode for [u8] {
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        let len = length_prefix(self.len())?;
        out.reserve(LENGTH_PREFIX_SIZE + self.len());
        out.put_u32_ne(len);
        out.put_slice(self);
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.len()
    }
}

impl Encode for str {
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        self.as_bytes().encode(out)
    }

    fn encoded_len(&self) -> usize {
        self.as_bytes().encoded_len()
    }
}

impl Encode for Bytes {
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        self.as_ref().encode(out)
    }

    fn encoded_len(&self) -> usize {
        self.as_ref().encoded_len()
    }
}

/// Strings decode as raw bytes: arbitrary content is legal on the wire.
impl Decode for Bytes {
    fn decode(input: &mut Bytes) -> Result<Self> {
        ensure_remaining(input, LENGTH_PREFIX_SIZE)?;
        let len = input.get_u32_ne() as usize;
        ensure_remaining(input, len)?;
        Ok(input.copy_to_bytes(len))
    }
}

// =============================================================================
// Numeric vectors
// =============================================================================

impl Encode for [u64] {
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        let count = length_prefix(self.len())?;
        out.reserve(self.encoded_len());
        out.put_u32_ne(count);
        for v in self {
            out.put_u64_ne(*v);
        }
        Ok(())
    }

    fn encoded_len(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.len() * std::mem::size_of::<u64>()
    }
}

impl Encode for Vec<u64> {
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        self.as_slice().encode(out)
    }

    fn encoded_len(&self) -> usize {
        self.as_slice().encoded_len()
    }
}

impl Decode for Vec<u64> {
    fn decode(input: &mut Bytes) -> Result<Self> {
        ensure_remaining(input, LENGTH_PREFIX_SIZE)?;
        let count = input.get_u32_ne() as usize;
        let byte_len = count
            .checked_mul(std::mem::size_of::<u64>())
            .ok_or(TransferError::LengthOverflow(count))?;
        // Validate we have enough data for all elements before allocating
        ensure_remaining(input, byte_len)?;

        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(input.get_u64_ne());
        }
        Ok(values)
    }
}

// =============================================================================
// WireValue
// =============================================================================

/// Type tag written in front of a self-describing [`WireValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    I32 = 0x01,
    U32 = 0x02,
    I64 = 0x03,
    U64 = 0x04,
    F64 = 0x05,
    Str = 0x06,
    U64Vec = 0x07,
}

impl WireType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::I32),
            0x02 => Some(Self::U32),
            0x03 => Some(Self::I64),
            0x04 => Some(Self::U64),
            0x05 => Some(Self::F64),
            0x06 => Some(Self::Str),
            0x07 => Some(Self::U64Vec),
            _ => None,
        }
    }
}

/// Any value the codec understands.
///
/// Typed streams (such as the chunk stream) carry bare encodings. A
/// `WireValue` additionally carries a one-byte [`WireType`] tag so a
/// heterogeneous sequence can be decoded without out-of-band type knowledge.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(Bytes),
    U64Vec(Vec<u64>),
}

impl WireValue {
    pub fn wire_type(&self) -> WireType {
        match self {
            WireValue::I32(_) => WireType::I32,
            WireValue::U32(_) => WireType::U32,
            WireValue::I64(_) => WireType::I64,
            WireValue::U64(_) => WireType::U64,
            WireValue::F64(_) => WireType::F64,
            WireValue::Str(_) => WireType::Str,
            WireValue::U64Vec(_) => WireType::U64Vec,
        }
    }
}

impl Encode for WireValue {
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        out.put_u8(self.wire_type() as u8);
        match self {
            WireValue::I32(v) => v.encode(out),
            WireValue::U32(v) => v.encode(out),
            WireValue::I64(v) => v.encode(out),
            WireValue::U64(v) => v.encode(out),
            WireValue::F64(v) => v.encode(out),
            WireValue::Str(v) => v.encode(out),
            WireValue::U64Vec(v) => v.encode(out),
        }
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            WireValue::I32(v) => v.encoded_len(),
            WireValue::U32(v) => v.encoded_len(),
            WireValue::I64(v) => v.encoded_len(),
            WireValue::U64(v) => v.encoded_len(),
            WireValue::F64(v) => v.encoded_len(),
            WireValue::Str(v) => v.encoded_len(),
            WireValue::U64Vec(v) => v.encoded_len(),
        }
    }
}

impl Decode for WireValue {
    fn decode(input: &mut Bytes) -> Result<Self> {
        ensure_remaining(input, 1)?;
        let tag = input.get_u8();
        let wire_type = WireType::from_u8(tag)
            .ok_or_else(|| TransferError::protocol(format!("unknown wire type 0x{tag:02x}")))?;

        Ok(match wire_type {
            WireType::I32 => WireValue::I32(i32::decode(input)?),
            WireType::U32 => WireValue::U32(u32::decode(input)?),
            WireType::I64 => WireValue::I64(i64::decode(input)?),
            WireType::U64 => WireValue::U64(u64::decode(input)?),
            WireType::F64 => WireValue::F64(f64::decode(input)?),
            WireType::Str => WireValue::Str(Bytes::decode(input)?),
            WireType::U64Vec => WireValue::U64Vec(Vec::<u64>::decode(input)?),
        })
    }
}

// =============================================================================
// Request header
// =============================================================================

/// First bytes a client writes on a fresh connection.
///
/// `tag` selects the server-side handler; `aux` is forwarded to it untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub tag: u64,
    pub aux: i32,
}

impl RequestHeader {
    /// magic(4) + tag(8) + aux(4)
    pub const SIZE: usize = 16;

    pub fn new(tag: u64, aux: i32) -> Self {
        Self { tag, aux }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        let frame = encode_to_bytes(self)?;
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut raw = [0u8; Self::SIZE];
        r.read_exact(&mut raw).await?;
        let mut payload = Bytes::copy_from_slice(&raw);
        Self::decode(&mut payload)
    }
}

impl Encode for RequestHeader {
    fn encode(&self, out: &mut BytesMut) -> Result<()> {
        REQUEST_MAGIC.encode(out)?;
        self.tag.encode(out)?;
        self.aux.encode(out)
    }

    fn encoded_len(&self) -> usize {
        Self::SIZE
    }
}

impl Decode for RequestHeader {
    fn decode(input: &mut Bytes) -> Result<Self> {
        let magic = u32::decode(input)?;
        if magic != REQUEST_MAGIC {
            return Err(TransferError::protocol(format!(
                "bad request magic: expected {REQUEST_MAGIC:#010x}, got {magic:#010x}"
            )));
        }
        Ok(Self {
            tag: u64::decode(input)?,
            aux: i32::decode(input)?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
