use std::collections::BTreeMap;
use std::fmt;

use anyhow::{bail, Context as _, Result};
use bytes::{Buf, BufMut as _, Bytes, BytesMut};

use crate::kafka::error::DecodeError;
use crate::kafka::{Deserialize, Serialize};

/// Fail with [`DecodeError::Truncated`] unless `buf` holds at least `needed` more bytes.
#[inline]
pub(crate) fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        bail!(DecodeError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

#[inline]
fn get_bytes<B: Buf>(buf: &mut B, len: usize) -> Result<Bytes> {
    ensure_remaining(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

/// Convert a decoded length prefix into a byte count, mapping `-1` to `None`.
#[inline]
pub(crate) fn nullable_len(len: i64) -> Result<Option<usize>> {
    match len {
        -1 => Ok(None),
        len => usize::try_from(len)
            .map(Some)
            .map_err(|_| DecodeError::InvalidLength(len).into()),
    }
}

macro_rules! impl_fixed_width {
    ($($ty:ty => $put:ident, $get:ident;)*) => {$(
        impl Serialize for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            #[inline]
            fn encode_size(&self, _version: i16) -> usize {
                Self::SIZE
            }

            #[inline]
            fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
                buf.$put(*self);
                Ok(())
            }
        }

        impl Deserialize for $ty {
            #[inline]
            fn decode<B: Buf>(buf: &mut B, _version: i16) -> Result<(Self, usize)> {
                let size = <$ty as Serialize>::SIZE;
                ensure_remaining(buf, size)?;
                Ok((buf.$get(), size))
            }
        }
    )*};
}

// INT8, INT16, INT32, INT64 and UINT32 are big-endian fixed width integers
impl_fixed_width! {
    i8 => put_i8, get_i8;
    i16 => put_i16, get_i16;
    i32 => put_i32, get_i32;
    i64 => put_i64, get_i64;
    u32 => put_u32, get_u32;
}

impl Serialize for bool {
    const SIZE: usize = 1;

    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        Self::SIZE
    }

    #[inline]
    fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
        buf.put_u8(*self as u8);
        Ok(())
    }
}

/// BOOLEAN (`bool`)
///
/// Represents a boolean value in a byte. Values 0 and 1 are used to represent false and true
/// respectively. When reading a boolean value, any non-zero value is considered true.
impl Deserialize for bool {
    fn decode<B: Buf>(buf: &mut B, _version: i16) -> Result<(Self, usize)> {
        ensure_remaining(buf, 1)?;
        Ok((buf.get_u8() > 0, 1))
    }
}

#[inline]
fn uvarint_size(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

fn put_uvarint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_uvarint<B: Buf>(buf: &mut B, max_bytes: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;

    for i in 0..max_bytes {
        ensure_remaining(buf, 1)?;
        let b = buf.get_u8();

        // the 10th byte of a 64-bit varint may only carry the top bit
        if i == 9 && b > 1 {
            break;
        }

        value |= u64::from(b & 0x7f) << (i * 7);

        if b < 0x80 {
            return Ok((value, i + 1));
        }
    }

    bail!(DecodeError::VarIntOverflow { max_bytes })
}

/// UNSIGNED_VARINT
///
/// Represents an unsigned 32-bit integer. Encoding follows the variable-length encoding from
/// Google Protocol Buffers, taking at most 5 bytes.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct UnsignedVarInt(pub u32);

impl UnsignedVarInt {
    pub const MAX_SIZE: usize = 5;

    /// Length prefix of a compact field holding `len` items or bytes (encoded as `len + 1`).
    pub(crate) fn compact_len(len: usize) -> Result<Self> {
        len.checked_add(1)
            .and_then(|n| u32::try_from(n).ok())
            .map(Self)
            .with_context(|| format!("compact length {len} exceeds UNSIGNED_VARINT"))
    }
}

impl Serialize for UnsignedVarInt {
    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        uvarint_size(self.0.into())
    }

    #[inline]
    fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
        put_uvarint(buf, self.0.into());
        Ok(())
    }
}

impl Deserialize for UnsignedVarInt {
    fn decode<B: Buf>(buf: &mut B, _version: i16) -> Result<(Self, usize)> {
        let (value, n) = get_uvarint(buf, Self::MAX_SIZE)?;
        match u32::try_from(value) {
            Ok(value) => Ok((Self(value), n)),
            Err(_) => bail!(DecodeError::VarIntOverflow {
                max_bytes: Self::MAX_SIZE
            }),
        }
    }
}

/// VARINT
///
/// Represents a signed 32-bit integer, zig-zag encoded into an [`UnsignedVarInt`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct VarInt(pub i32);

impl VarInt {
    #[inline]
    fn zigzag(self) -> u32 {
        ((self.0 << 1) ^ (self.0 >> 31)) as u32
    }
}

impl Serialize for VarInt {
    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        uvarint_size(self.zigzag().into())
    }

    #[inline]
    fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
        put_uvarint(buf, self.zigzag().into());
        Ok(())
    }
}

impl Deserialize for VarInt {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (UnsignedVarInt(n), size) = UnsignedVarInt::decode(buf, version)?;
        Ok((Self(((n >> 1) as i32) ^ -((n & 1) as i32)), size))
    }
}

/// VARLONG
///
/// Represents a signed 64-bit integer, zig-zag encoded into at most 10 bytes.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct VarLong(pub i64);

impl VarLong {
    pub const MAX_SIZE: usize = 10;

    #[inline]
    fn zigzag(self) -> u64 {
        ((self.0 << 1) ^ (self.0 >> 63)) as u64
    }
}

impl Serialize for VarLong {
    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        uvarint_size(self.zigzag())
    }

    #[inline]
    fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
        put_uvarint(buf, self.zigzag());
        Ok(())
    }
}

impl Deserialize for VarLong {
    fn decode<B: Buf>(buf: &mut B, _version: i16) -> Result<(Self, usize)> {
        let (n, size) = get_uvarint(buf, Self::MAX_SIZE)?;
        Ok((Self(((n >> 1) as i64) ^ -((n & 1) as i64)), size))
    }
}

/// BYTES (`Bytes`)
///
/// Represents a raw sequence of bytes. First the length N is given as an INT32. Then N bytes
/// follow.
///
/// NULLABLE_BYTES (`Option<Bytes>`)
///
/// Same as above, but a null value is encoded with length of -1 and there are no following bytes.
impl Serialize for Bytes {
    const SIZE: usize = 4;

    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        Self::SIZE + self.len()
    }

    fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
        let len = i32::try_from(self.len())
            .with_context(|| format!("{} bytes exceed INT32 length", self.len()))?;
        buf.put_i32(len);
        buf.put_slice(self);
        Ok(())
    }
}

impl Serialize for Option<Bytes> {
    const SIZE: usize = Bytes::SIZE;

    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        self.as_ref().map_or(Self::SIZE, |b| b.encode_size(version))
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        match self {
            Some(bytes) => bytes.encode(buf, version),
            None => (-1i32).encode(buf, version),
        }
    }
}

impl Deserialize for Option<Bytes> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (len, n) = i32::decode(buf, version).context("bytes length")?;
        match nullable_len(len.into())? {
            Some(len) => Ok((Some(get_bytes(buf, len)?), n + len)),
            None => Ok((None, n)),
        }
    }
}

impl Deserialize for Bytes {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        match Option::<Bytes>::decode(buf, version)? {
            (Some(bytes), n) => Ok((bytes, n)),
            (None, _) => bail!(DecodeError::UnexpectedNull),
        }
    }
}

/// COMPACT_BYTES | COMPACT_NULLABLE_BYTES
///
/// First the length N + 1 is given as an UNSIGNED_VARINT. Then N bytes follow. A null value is
/// encoded with a length of 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct CompactBytes(pub Bytes);

impl Serialize for CompactBytes {
    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        uvarint_size(self.0.len() as u64 + 1) + self.0.len()
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        UnsignedVarInt::compact_len(self.0.len())?.encode(buf, version)?;
        buf.put_slice(&self.0);
        Ok(())
    }
}

impl Serialize for Option<CompactBytes> {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        self.as_ref().map_or(1, |b| b.encode_size(version))
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        match self {
            Some(bytes) => bytes.encode(buf, version),
            None => UnsignedVarInt(0).encode(buf, version),
        }
    }
}

impl Deserialize for Option<CompactBytes> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (UnsignedVarInt(len), n) =
            UnsignedVarInt::decode(buf, version).context("compact bytes length")?;

        let Some(len) = (len as usize).checked_sub(1) else {
            return Ok((None, n));
        };

        Ok((Some(CompactBytes(get_bytes(buf, len)?)), n + len))
    }
}

impl Deserialize for CompactBytes {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        match Option::<CompactBytes>::decode(buf, version)? {
            (Some(bytes), n) => Ok((bytes, n)),
            (None, _) => bail!(DecodeError::UnexpectedNull),
        }
    }
}

/// [`Bytes`] wrapper that guarantees UTF-8 encoding.
///
/// Note that this is rather a helper type. For wire-serialized types use either [`Str`] or
/// [`CompactStr`].
#[derive(Clone, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StrBytes(Bytes);

impl StrBytes {
    #[inline]
    pub const fn from_static(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // SAFETY: contents are validated as UTF-8 whenever a StrBytes is constructed
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<Bytes> for StrBytes {
    type Error = anyhow::Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        std::str::from_utf8(&bytes).with_context(|| format!("invalid data: {bytes:x?}"))?;
        Ok(Self(bytes))
    }
}

impl From<String> for StrBytes {
    #[inline]
    fn from(s: String) -> Self {
        Self(Bytes::from(s.into_bytes()))
    }
}

impl From<&'static str> for StrBytes {
    #[inline]
    fn from(s: &'static str) -> Self {
        Self::from_static(s)
    }
}

impl PartialEq<str> for StrBytes {
    #[inline]
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for StrBytes {
    #[inline]
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Debug for StrBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for StrBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// STRING (`Str`)
///
/// Represents a sequence of characters. First the length N is given as an INT16. Then N bytes
/// follow which are the UTF-8 encoding of the character sequence. Length must not be negative.
///
/// NULLABLE_STRING (`Option<Str>`)
///
/// Represents a sequence of characters or null. For non-null strings, first the length N is
/// given as an INT16. Then N bytes follow which are the UTF-8 encoding of the character
/// sequence. A null value is encoded with length of -1 and there are no following bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Str(pub StrBytes);

impl From<&StrBytes> for Str {
    #[inline]
    fn from(s: &StrBytes) -> Self {
        Self(s.clone())
    }
}

impl Serialize for Str {
    // length encoded as INT16
    const SIZE: usize = 2;

    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        Self::SIZE + self.0.len()
    }

    fn encode(&self, buf: &mut BytesMut, _version: i16) -> Result<()> {
        let len = i16::try_from(self.0.len())
            .with_context(|| format!("string of {} bytes exceeds INT16 length", self.0.len()))?;
        buf.put_i16(len);
        buf.put_slice(&self.0 .0);
        Ok(())
    }
}

impl Serialize for Option<Str> {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        // NOTE: null strings still encode as -1 (INT16)
        self.as_ref().map_or(Str::SIZE, |s| s.encode_size(version))
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        match self {
            Some(s) => s.encode(buf, version),
            None => (-1i16).encode(buf, version),
        }
    }
}

impl Deserialize for Option<Str> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (len, n) = i16::decode(buf, version).context("string length")?;

        let Some(len) = nullable_len(len.into())? else {
            return Ok((None, n));
        };

        let bytes = get_bytes(buf, len).context("string chars")?;
        Ok((Some(Str(StrBytes::try_from(bytes)?)), n + len))
    }
}

impl Deserialize for Str {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        match Option::<Str>::decode(buf, version)? {
            (Some(s), n) => Ok((s, n)),
            (None, _) => bail!(DecodeError::UnexpectedNull),
        }
    }
}

/// COMPACT_STRING (`CompactStr`) | COMPACT_NULLABLE_STRING (`Option<CompactStr>`)
///
/// First the length N + 1 is given as an UNSIGNED_VARINT. Then N bytes follow which are the
/// UTF-8 encoding of the character sequence. A null string is represented with a length of 0.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct CompactStr(pub StrBytes);

impl From<&StrBytes> for CompactStr {
    #[inline]
    fn from(s: &StrBytes) -> Self {
        Self(s.clone())
    }
}

impl Serialize for CompactStr {
    #[inline]
    fn encode_size(&self, _version: i16) -> usize {
        uvarint_size(self.0.len() as u64 + 1) + self.0.len()
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        UnsignedVarInt::compact_len(self.0.len())
            .context("compact string length")?
            .encode(buf, version)?;
        buf.put_slice(&self.0 .0);
        Ok(())
    }
}

impl Serialize for Option<CompactStr> {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        self.as_ref().map_or(1, |s| s.encode_size(version))
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        match self {
            Some(s) => s.encode(buf, version),
            None => UnsignedVarInt(0).encode(buf, version),
        }
    }
}

impl Deserialize for Option<CompactStr> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (UnsignedVarInt(len), n) =
            UnsignedVarInt::decode(buf, version).context("compact string length")?;

        let Some(len) = (len as usize).checked_sub(1) else {
            return Ok((None, n));
        };

        let bytes = get_bytes(buf, len).context("compact string chars")?;
        Ok((Some(CompactStr(StrBytes::try_from(bytes)?)), n + len))
    }
}

impl Deserialize for CompactStr {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        match Option::<CompactStr>::decode(buf, version)? {
            (Some(s), n) => Ok((s, n)),
            (None, _) => bail!(DecodeError::UnexpectedNull),
        }
    }
}

fn items_size<T: Serialize>(items: &[T], version: i16) -> usize {
    items.iter().map(|x| x.encode_size(version)).sum()
}

fn encode_items<T: Serialize>(items: &[T], buf: &mut BytesMut, version: i16) -> Result<()> {
    for (i, item) in items.iter().enumerate() {
        item.encode(buf, version)
            .with_context(|| format!("array item {i}"))?;
    }
    Ok(())
}

fn decode_items<T, B>(buf: &mut B, len: usize, version: i16) -> Result<(Vec<T>, usize)>
where
    T: Deserialize,
    B: Buf,
{
    // every item takes at least one byte, so a bogus count cannot trigger a huge allocation
    let mut items = Vec::with_capacity(len.min(buf.remaining()));
    let mut size = 0;

    for i in 0..len {
        let (item, n) = T::decode(buf, version).with_context(|| format!("array item {i}"))?;
        items.push(item);
        size += n;
    }

    Ok((items, size))
}

/// ARRAY
///
/// Represents a sequence of objects of a given type T. Type T can be either a primitive type
/// (e.g. STRING) or a structure. First, the length N is given as an INT32. Then N instances of
/// type T follow. A null array is represented with a length of -1.
///
/// In protocol documentation an array of T instances is referred to as [T].
#[derive(Debug)]
#[repr(transparent)]
pub struct Array<T>(pub T);

impl<T: Serialize> Serialize for Array<&[T]> {
    // array length encoded as INT32
    const SIZE: usize = 4;

    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        Self::SIZE + items_size(self.0, version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let len = i32::try_from(self.0.len()).context("array length exceeds INT32")?;
        buf.put_i32(len);
        encode_items(self.0, buf, version)
    }
}

impl<T: Serialize> Serialize for Array<Option<&[T]>> {
    const SIZE: usize = 4;

    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        self.0.map_or(Self::SIZE, |items| Array(items).encode_size(version))
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        match self.0 {
            Some(items) => Array(items).encode(buf, version),
            None => (-1i32).encode(buf, version),
        }
    }
}

impl<T: Deserialize> Deserialize for Array<Option<Vec<T>>> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (len, n) = i32::decode(buf, version).context("array length")?;

        let Some(len) = nullable_len(len.into())? else {
            return Ok((Self(None), n));
        };

        let (items, size) = decode_items(buf, len, version)?;
        Ok((Self(Some(items)), n + size))
    }
}

impl<T: Deserialize> Deserialize for Array<Vec<T>> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        match Array::<Option<Vec<T>>>::decode(buf, version)? {
            (Array(Some(items)), n) => Ok((Self(items), n)),
            (Array(None), _) => bail!(DecodeError::UnexpectedNull),
        }
    }
}

/// COMPACT_ARRAY
///
/// Represents a sequence of objects of a given type T. Type T can be either a primitive type
/// (e.g. STRING) or a structure. First, the length N + 1 is given as an UNSIGNED_VARINT. Then N
/// instances of type T follow. A null array is represented with a length of 0.
///
/// In protocol documentation an array of T instances is referred to as [T].
#[derive(Debug)]
#[repr(transparent)]
pub struct CompactArray<T>(pub T);

impl<T: Serialize> Serialize for CompactArray<&[T]> {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        uvarint_size(self.0.len() as u64 + 1) + items_size(self.0, version)
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        UnsignedVarInt::compact_len(self.0.len())
            .context("compact array length")?
            .encode(buf, version)?;
        encode_items(self.0, buf, version)
    }
}

impl<T: Serialize> Serialize for CompactArray<Option<&[T]>> {
    #[inline]
    fn encode_size(&self, version: i16) -> usize {
        self.0.map_or(1, |items| CompactArray(items).encode_size(version))
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        match self.0 {
            Some(items) => CompactArray(items).encode(buf, version),
            None => UnsignedVarInt(0).encode(buf, version),
        }
    }
}

impl<T: Deserialize> Deserialize for CompactArray<Option<Vec<T>>> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (UnsignedVarInt(len), n) =
            UnsignedVarInt::decode(buf, version).context("compact array length")?;

        let Some(len) = (len as usize).checked_sub(1) else {
            return Ok((Self(None), n));
        };

        let (items, size) = decode_items(buf, len, version)?;
        Ok((Self(Some(items)), n + size))
    }
}

impl<T: Deserialize> Deserialize for CompactArray<Vec<T>> {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        match CompactArray::<Option<Vec<T>>>::decode(buf, version)? {
            (CompactArray(Some(items)), n) => Ok((Self(items), n)),
            (CompactArray(None), _) => bail!(DecodeError::UnexpectedNull),
        }
    }
}

/// TAG_BUFFER [KIP-482][KIP]
///
/// Tagged fields are kept as raw bytes keyed by their tag and always written in ascending tag
/// order.
///
/// [KIP]: https://cwiki.apache.org/confluence/display/KAFKA/KIP-482%3A+The+Kafka+Protocol+should+Support+Optional+Tagged+Fields
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct TagBuffer(BTreeMap<u32, Bytes>);

impl TagBuffer {
    #[inline]
    pub fn get(&self, tag: u32) -> Option<&Bytes> {
        self.0.get(&tag)
    }

    #[inline]
    pub fn insert(&mut self, tag: u32, value: Bytes) -> Option<Bytes> {
        self.0.insert(tag, value)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Bytes)> {
        self.0.iter().map(|(&tag, value)| (tag, value))
    }
}

impl FromIterator<(u32, Bytes)> for TagBuffer {
    #[inline]
    fn from_iter<T: IntoIterator<Item = (u32, Bytes)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for TagBuffer {
    fn encode_size(&self, _version: i16) -> usize {
        self.0.iter().fold(
            uvarint_size(self.0.len() as u64),
            |size, (&tag, value)| {
                size + uvarint_size(tag.into()) + uvarint_size(value.len() as u64) + value.len()
            },
        )
    }

    fn encode(&self, buf: &mut BytesMut, version: i16) -> Result<()> {
        let len = u32::try_from(self.0.len()).context("number of tagged fields")?;
        UnsignedVarInt(len).encode(buf, version)?;

        for (&tag, value) in self.0.iter() {
            UnsignedVarInt(tag).encode(buf, version)?;

            let len = u32::try_from(value.len())
                .with_context(|| format!("tagged field {tag} - value length"))?;
            UnsignedVarInt(len).encode(buf, version)?;

            buf.put_slice(value);
        }

        Ok(())
    }
}

impl Deserialize for TagBuffer {
    fn decode<B: Buf>(buf: &mut B, version: i16) -> Result<(Self, usize)> {
        let (UnsignedVarInt(len), mut size) =
            UnsignedVarInt::decode(buf, version).context("number of tagged fields")?;

        let mut fields = BTreeMap::new();
        let mut previous = None;

        for i in 0..len {
            let (UnsignedVarInt(tag), n) = UnsignedVarInt::decode(buf, version)
                .with_context(|| format!("tagged field #{i} - tag"))?;
            size += n;

            if let Some(previous) = previous.filter(|&previous| previous >= tag) {
                bail!(DecodeError::TagOrder { previous, tag });
            }
            previous = Some(tag);

            let (UnsignedVarInt(len), n) = UnsignedVarInt::decode(buf, version)
                .with_context(|| format!("tagged field {tag} - value length"))?;
            size += n;

            let value = get_bytes(buf, len as usize)
                .with_context(|| format!("tagged field {tag} - value"))?;
            size += value.len();

            fields.insert(tag, value);
        }

        Ok((Self(fields), size))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn encoded<T: Serialize>(value: &T) -> BytesMut {
        let mut buf = BytesMut::new();
        value.encode(&mut buf, 0).expect("encode");
        assert_eq!(buf.len(), value.encode_size(0), "declared size");
        buf
    }

    #[test]
    fn unsigned_varint_boundaries() {
        for (value, size) in [
            (0, 1),
            (0x7f, 1),
            (0x80, 2),
            (0x3fff, 2),
            (0x4000, 3),
            (0x1f_ffff, 3),
            (0x20_0000, 4),
            (0xfff_ffff, 4),
            (0x1000_0000, 5),
            (u32::MAX, 5),
        ] {
            let buf = encoded(&UnsignedVarInt(value));
            assert_eq!(buf.len(), size, "{value:#x}");
        }

        assert_eq!(&encoded(&UnsignedVarInt(300))[..], &[0xac, 0x02]);
    }

    #[test]
    fn zigzag_small_magnitudes() {
        assert_eq!(&encoded(&VarInt(0))[..], &[0x00]);
        assert_eq!(&encoded(&VarInt(-1))[..], &[0x01]);
        assert_eq!(&encoded(&VarInt(1))[..], &[0x02]);
        assert_eq!(&encoded(&VarInt(-2))[..], &[0x03]);
        assert_eq!(encoded(&VarInt(i32::MIN)).len(), 5);
        assert_eq!(encoded(&VarLong(i64::MIN)).len(), VarLong::MAX_SIZE);
    }

    #[test]
    fn zigzag_extremes_round_trip() {
        for value in [0, -1, 1, i32::MIN, i32::MAX] {
            let buf = encoded(&VarInt(value));
            let (VarInt(decoded), n) = VarInt::deserialize(&mut &buf[..]).expect("varint");
            assert_eq!(decoded, value);
            assert_eq!(n, buf.len());
        }

        for value in [0, -1, 1, i64::MIN, i64::MAX] {
            let buf = encoded(&VarLong(value));
            let (VarLong(decoded), n) = VarLong::deserialize(&mut &buf[..]).expect("varlong");
            assert_eq!(decoded, value);
            assert_eq!(n, buf.len());
        }

        let max = encoded(&VarLong(i64::MAX));
        assert_eq!(max[0], 0xfe);
        assert_eq!(&max[1..], &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01]);

        let min = encoded(&VarLong(i64::MIN));
        assert_eq!(&min[..9], &[0xff; 9]);
        assert_eq!(min[9], 0x01);
    }

    #[test]
    fn non_terminating_varint() {
        let mut buf = &[0xff, 0xff, 0xff, 0xff, 0xff, 0x01][..];
        let err = UnsignedVarInt::deserialize(&mut buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::VarIntOverflow { max_bytes: 5 })
        ));

        let mut buf = &[0xff; 11][..];
        let err = VarLong::deserialize(&mut buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::VarIntOverflow { max_bytes: 10 })
        ));

        let mut buf = &[0x80, 0x80][..];
        let err = VarInt::deserialize(&mut buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn nullable_string_encodings() {
        assert_eq!(&encoded(&None::<Str>)[..], &[0xff, 0xff]);
        assert_eq!(&encoded(&Some(Str(StrBytes::from(""))))[..], &[0x00, 0x00]);
        assert_eq!(&encoded(&Str(StrBytes::from("c")))[..], &[0x00, 0x01, b'c']);

        assert_eq!(&encoded(&None::<CompactStr>)[..], &[0x00]);
        assert_eq!(&encoded(&CompactStr(StrBytes::from("")))[..], &[0x01]);
        assert_eq!(&encoded(&CompactStr(StrBytes::from("ab")))[..], &[0x03, b'a', b'b']);

        let mut buf = &[0xff, 0xff][..];
        let (s, n) = Option::<Str>::deserialize(&mut buf).expect("null string");
        assert_eq!((s, n), (None, 2));

        let mut buf = &[0xff, 0xff][..];
        let err = Str::deserialize(&mut buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::UnexpectedNull)
        ));

        let mut buf = &[0x00][..];
        let (s, n) = Option::<CompactStr>::deserialize(&mut buf).expect("null compact string");
        assert_eq!((s, n), (None, 1));

        let mut buf = &[0x01][..];
        let (s, _) = CompactStr::deserialize(&mut buf).expect("empty compact string");
        assert!(s.0.is_empty());
    }

    #[test]
    fn oversized_string_is_rejected() {
        let s = Str(StrBytes::from("x".repeat(i16::MAX as usize + 1)));
        assert!(s.encode(&mut BytesMut::new(), 0).is_err());

        let s = Str(StrBytes::from("x".repeat(i16::MAX as usize)));
        assert!(s.encode(&mut BytesMut::new(), 0).is_ok());
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut buf = &[0x00, 0x02, 0xc3, 0x28][..];
        assert!(Str::deserialize(&mut buf).is_err());
    }

    #[test]
    fn null_and_empty_arrays_differ() {
        assert_eq!(&encoded(&Array(None::<&[i32]>))[..], &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(&encoded(&Array(&[][..] as &[i32]))[..], &[0, 0, 0, 0]);
        assert_eq!(&encoded(&CompactArray(None::<&[i32]>))[..], &[0x00]);
        assert_eq!(&encoded(&CompactArray(&[7i32][..]))[..], &[0x02, 0, 0, 0, 7]);

        let mut buf = &[0xff, 0xff, 0xff, 0xff][..];
        let (Array(items), _) = Array::<Option<Vec<i32>>>::deserialize(&mut buf).expect("null");
        assert_eq!(items, None);

        let mut buf = &[0, 0, 0, 0][..];
        let (Array(items), _) = Array::<Option<Vec<i32>>>::deserialize(&mut buf).expect("empty");
        assert_eq!(items, Some(vec![]));

        let mut buf = &[0xff, 0xff, 0xff, 0xfe][..];
        assert!(Array::<Option<Vec<i32>>>::deserialize(&mut buf).is_err());
    }

    #[test]
    fn tag_buffer_order() {
        let tags: TagBuffer = [(5, Bytes::from_static(b"x")), (1, Bytes::from_static(b"ab"))]
            .into_iter()
            .collect();

        let buf = encoded(&tags);
        assert_eq!(&buf[..], &[0x02, 0x01, 0x02, b'a', b'b', 0x05, 0x01, b'x']);

        let (decoded, n) = TagBuffer::deserialize(&mut &buf[..]).expect("tag buffer");
        assert_eq!(n, buf.len());
        assert_eq!(decoded, tags);

        let mut buf = &[0x02, 0x05, 0x00, 0x01, 0x00][..];
        let err = TagBuffer::deserialize(&mut buf).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DecodeError>(),
            Some(DecodeError::TagOrder {
                previous: 5,
                tag: 1
            })
        ));
    }

    proptest! {
        #[test]
        fn varint_round_trip(value: i32) {
            let buf = encoded(&VarInt(value));
            let mut input = &buf[..];
            let (VarInt(decoded), n) = VarInt::deserialize(&mut input).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(n, buf.len());
            prop_assert!(input.is_empty());
        }

        #[test]
        fn varlong_round_trip(value: i64) {
            let buf = encoded(&VarLong(value));
            let (VarLong(decoded), n) = VarLong::deserialize(&mut &buf[..]).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(n, buf.len());
        }

        #[test]
        fn unsigned_varint_round_trip(value: u32) {
            let buf = encoded(&UnsignedVarInt(value));
            let (UnsignedVarInt(decoded), n) = UnsignedVarInt::deserialize(&mut &buf[..]).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(n, buf.len());
        }

        #[test]
        fn compact_string_round_trip(s in ".{0,64}") {
            let value = CompactStr(StrBytes::from(s.clone()));
            let buf = encoded(&value);
            let (decoded, n) = CompactStr::deserialize(&mut &buf[..]).unwrap();
            prop_assert_eq!(decoded.0.as_str(), s.as_str());
            prop_assert_eq!(n, buf.len());
        }

        #[test]
        fn nullable_bytes_round_trip(value in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..64))) {
            let value = value.map(Bytes::from);
            let buf = encoded(&value);
            let (decoded, n) = Option::<Bytes>::deserialize(&mut &buf[..]).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(n, buf.len());
        }
    }
}
