//! Canonical binary encoding of the wire beans.
//!
//! The byte representation produced here is normative: transaction references
//! are hashes of marshalled requests, trie nodes are hashed by their
//! marshalled form and signatures are computed over marshalled requests.
//! Two logically equal beans must therefore marshal to equal bytes.

use num_bigint::{BigInt, Sign};

use crate::errors::{ChainError, ChainResult};

/// Escape byte of the compact integer encoding: values above
/// [`COMPACT_INLINE_MAX`] are written as this byte followed by a 4-byte
/// big-endian signed integer.
const COMPACT_ESCAPE: u8 = 0xff;
const COMPACT_INLINE_MAX: u32 = 254;

pub struct MarshallingContext {
    bytes: Vec<u8>,
}

impl MarshallingContext {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.bytes.push(value as u8);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.bytes.push(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.bytes.extend_from_slice(&value.to_bits().to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_bits().to_be_bytes());
    }

    pub fn write_char(&mut self, value: char) {
        self.write_u32(value as u32);
    }

    /// Compact length encoding: a single byte for `0..=254`, otherwise
    /// `0xFF` followed by a 4-byte big-endian signed integer.
    pub fn write_compact_u32(&mut self, value: u32) {
        if value <= COMPACT_INLINE_MAX {
            self.bytes.push(value as u8);
        } else {
            self.bytes.push(COMPACT_ESCAPE);
            self.write_i32(value as i32);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// A length-prefixed byte array (compact length, then the raw bytes).
    pub fn write_byte_array(&mut self, bytes: &[u8]) {
        self.write_compact_u32(bytes.len() as u32);
        self.bytes.extend_from_slice(bytes);
    }

    /// A string as a 2-byte big-endian length followed by its UTF-8 bytes.
    pub fn write_utf(&mut self, value: &str) {
        let encoded = value.as_bytes();
        debug_assert!(encoded.len() <= u16::MAX as usize, "string too long to marshal");
        self.write_u16(encoded.len() as u16);
        self.bytes.extend_from_slice(encoded);
    }

    /// A big integer as a sign byte (-1, 0 or 1) followed, when non-zero,
    /// by the length-prefixed big-endian magnitude.
    pub fn write_big_integer(&mut self, value: &BigInt) {
        match value.sign() {
            Sign::NoSign => self.write_i8(0),
            Sign::Plus => {
                self.write_i8(1);
                self.write_byte_array(&value.magnitude().to_bytes_be());
            }
            Sign::Minus => {
                self.write_i8(-1);
                self.write_byte_array(&value.magnitude().to_bytes_be());
            }
        }
    }
}

impl Default for MarshallingContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct UnmarshallingContext<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> UnmarshallingContext<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, count: usize) -> ChainResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(ChainError::marshalling(format!(
                "unexpected end of stream: needed {count} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> ChainResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_i8(&mut self) -> ChainResult<i8> {
        Ok(self.take(1)?[0] as i8)
    }

    pub fn read_bool(&mut self) -> ChainResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ChainError::marshalling(format!("invalid boolean byte {other}"))),
        }
    }

    pub fn read_u16(&mut self) -> ChainResult<u16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().expect("sized slice");
        Ok(u16::from_be_bytes(bytes))
    }

    pub fn read_i16(&mut self) -> ChainResult<i16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().expect("sized slice");
        Ok(i16::from_be_bytes(bytes))
    }

    pub fn read_i32(&mut self) -> ChainResult<i32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(i32::from_be_bytes(bytes))
    }

    pub fn read_u32(&mut self) -> ChainResult<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("sized slice");
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_i64(&mut self) -> ChainResult<i64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("sized slice");
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> ChainResult<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().expect("sized slice");
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_f32(&mut self) -> ChainResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> ChainResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_char(&mut self) -> ChainResult<char> {
        let code = self.read_u32()?;
        char::from_u32(code)
            .ok_or_else(|| ChainError::marshalling(format!("invalid character code {code}")))
    }

    pub fn read_compact_u32(&mut self) -> ChainResult<u32> {
        let first = self.read_u8()?;
        if first == COMPACT_ESCAPE {
            let value = self.read_i32()?;
            if value < 0 {
                return Err(ChainError::marshalling("negative compact integer".to_string()));
            }
            Ok(value as u32)
        } else {
            Ok(u32::from(first))
        }
    }

    pub fn read_exact(&mut self, count: usize) -> ChainResult<Vec<u8>> {
        Ok(self.take(count)?.to_vec())
    }

    pub fn read_byte_array(&mut self) -> ChainResult<Vec<u8>> {
        let len = self.read_compact_u32()? as usize;
        self.read_exact(len)
    }

    pub fn read_utf(&mut self) -> ChainResult<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|err| ChainError::marshalling(format!("invalid UTF-8 string: {err}")))
    }

    pub fn read_big_integer(&mut self) -> ChainResult<BigInt> {
        match self.read_i8()? {
            0 => Ok(BigInt::from(0)),
            1 => {
                let magnitude = self.read_byte_array()?;
                Ok(BigInt::from_bytes_be(Sign::Plus, &magnitude))
            }
            -1 => {
                let magnitude = self.read_byte_array()?;
                Ok(BigInt::from_bytes_be(Sign::Minus, &magnitude))
            }
            other => Err(ChainError::marshalling(format!("invalid big integer sign {other}"))),
        }
    }
}

/// A bean with a canonical binary form.
pub trait Marshallable: Sized {
    fn marshal(&self, ctx: &mut MarshallingContext);

    fn unmarshal(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Self>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut ctx = MarshallingContext::new();
        self.marshal(&mut ctx);
        ctx.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> ChainResult<Self> {
        let mut ctx = UnmarshallingContext::new(bytes);
        let value = Self::unmarshal(&mut ctx)?;
        if ctx.remaining() > 0 {
            return Err(ChainError::marshalling(format!(
                "{} trailing bytes after unmarshalling",
                ctx.remaining()
            )));
        }
        Ok(value)
    }
}

pub fn marshal_reference_array<T: Marshallable>(items: &[T], ctx: &mut MarshallingContext) {
    ctx.write_compact_u32(items.len() as u32);
    for item in items {
        item.marshal(ctx);
    }
}

pub fn unmarshal_array<T: Marshallable>(ctx: &mut UnmarshallingContext<'_>) -> ChainResult<Vec<T>> {
    let count = ctx.read_compact_u32()? as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(T::unmarshal(ctx)?);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_integers_round_trip() {
        for value in [0u32, 1, 100, 254, 255, 256, 1_000_000] {
            let mut ctx = MarshallingContext::new();
            ctx.write_compact_u32(value);
            let bytes = ctx.into_bytes();
            if value <= 254 {
                assert_eq!(bytes.len(), 1);
            } else {
                assert_eq!(bytes.len(), 5);
            }
            let mut reader = UnmarshallingContext::new(&bytes);
            assert_eq!(reader.read_compact_u32().unwrap(), value);
        }
    }

    #[test]
    fn big_integers_round_trip() {
        for value in ["0", "1", "-1", "1000000000000000", "-123456789123456789123456789"] {
            let parsed: BigInt = value.parse().unwrap();
            let mut ctx = MarshallingContext::new();
            ctx.write_big_integer(&parsed);
            let bytes = ctx.into_bytes();
            let mut reader = UnmarshallingContext::new(&bytes);
            assert_eq!(reader.read_big_integer().unwrap(), parsed);
        }
    }

    #[test]
    fn utf_round_trip() {
        let mut ctx = MarshallingContext::new();
        ctx.write_utf("banyan.lang.Storage");
        ctx.write_utf("");
        let bytes = ctx.into_bytes();
        let mut reader = UnmarshallingContext::new(&bytes);
        assert_eq!(reader.read_utf().unwrap(), "banyan.lang.Storage");
        assert_eq!(reader.read_utf().unwrap(), "");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let mut reader = UnmarshallingContext::new(&[0x00]);
        assert!(reader.read_i32().is_err());
    }
}
