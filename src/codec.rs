//! Primitive wire encodings shared by every PVA message
//!
//! Everything written by this crate is little-endian. Incoming data is read
//! through a [`Reader`], which carries the byte order announced in the header
//! of the message being decoded.

use std::fmt::{self, Display};

use bytes::BufMut;
use nom::number::complete::{
    be_f32, be_f64, be_i16, be_i32, be_i64, be_u16, be_u32, be_u64, le_f32, le_f64, le_i16,
    le_i32, le_i64, le_u16, le_u32, le_u64, le_u8,
};
use thiserror::Error;

/// Marker byte for a null size
const SIZE_NULL: u8 = 0xFF;
/// Marker byte announcing that a 32-bit (or longer) size follows
const SIZE_LONG: u8 = 0xFE;
/// Deepest nesting of types and values a [`Reader`] will follow
pub const MAX_NESTING: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Buffer truncated before the end of the value")]
    Truncated,
    #[error("Invalid size encoding: {0}")]
    InvalidSize(i64),
    #[error("Unexpected null where a value was required")]
    UnexpectedNull,
    #[error("Unsupported type code 0x{0:02x}")]
    InvalidTypeCode(u8),
    #[error("Reference to unknown type ID {0}")]
    UnknownTypeId(u16),
    #[error("Type ID {0} was redefined with a different shape")]
    DuplicateTypeId(u16),
    #[error("String data was not valid UTF-8")]
    InvalidString,
    #[error("Invalid field: {0}")]
    InvalidField(String),
    #[error("Data nested deeper than {MAX_NESTING} levels")]
    TooDeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

type NomResult<'a, T> = nom::IResult<&'a [u8], T>;

macro_rules! read_number {
    ($name:ident, $t:ty, $le:ident, $be:ident) => {
        pub fn $name(&mut self) -> Result<$t, DecodeError> {
            let result: NomResult<$t> = match self.order {
                ByteOrder::Little => $le(self.input),
                ByteOrder::Big => $be(self.input),
            };
            let (rest, value) = result.map_err(|_| DecodeError::Truncated)?;
            self.input = rest;
            Ok(value)
        }
    };
}

/// Cursor over an incoming payload
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    input: &'a [u8],
    order: ByteOrder,
    depth: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8], order: ByteOrder) -> Self {
        Reader {
            input,
            order,
            depth: 0,
        }
    }
    pub fn order(&self) -> ByteOrder {
        self.order
    }
    pub fn remaining(&self) -> usize {
        self.input.len()
    }
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }
    /// The bytes not yet consumed
    pub fn rest(&self) -> &'a [u8] {
        self.input
    }

    pub fn get_u8(&mut self) -> Result<u8, DecodeError> {
        let result: NomResult<u8> = le_u8(self.input);
        let (rest, value) = result.map_err(|_| DecodeError::Truncated)?;
        self.input = rest;
        Ok(value)
    }
    pub fn get_i8(&mut self) -> Result<i8, DecodeError> {
        self.get_u8().map(|v| v as i8)
    }
    pub fn get_bool(&mut self) -> Result<bool, DecodeError> {
        self.get_u8().map(|v| v != 0)
    }
    read_number!(get_u16, u16, le_u16, be_u16);
    read_number!(get_i16, i16, le_i16, be_i16);
    read_number!(get_u32, u32, le_u32, be_u32);
    read_number!(get_i32, i32, le_i32, be_i32);
    read_number!(get_u64, u64, le_u64, be_u64);
    read_number!(get_i64, i64, le_i64, be_i64);
    read_number!(get_f32, f32, le_f32, be_f32);
    read_number!(get_f64, f64, le_f64, be_f64);

    /// Take a fixed number of raw bytes
    pub fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        let (taken, rest) = self
            .input
            .split_at_checked(count)
            .ok_or(DecodeError::Truncated)?;
        self.input = rest;
        Ok(taken)
    }

    /// Run `decode` one nesting level further in
    ///
    /// Fails with [`DecodeError::TooDeep`] past [`MAX_NESTING`] levels, so
    /// hostile input cannot exhaust the stack.
    pub fn nested<T>(
        &mut self,
        decode: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        if self.depth >= MAX_NESTING {
            return Err(DecodeError::TooDeep);
        }
        self.depth += 1;
        let result = decode(self);
        self.depth -= 1;
        result
    }

    /// Check that at least `count` items of `item_size` bytes could follow
    ///
    /// Used before allocating for arrays, so a corrupt size cannot cause a
    /// huge allocation.
    pub fn ensure(&self, count: usize, item_size: usize) -> Result<(), DecodeError> {
        match count.checked_mul(item_size) {
            Some(needed) if needed <= self.input.len() => Ok(()),
            _ => Err(DecodeError::Truncated),
        }
    }

    /// Read a size, where `None` is the encoded null marker
    pub fn get_size(&mut self) -> Result<Option<usize>, DecodeError> {
        match self.get_u8()? {
            SIZE_NULL => Ok(None),
            SIZE_LONG => {
                let size = self.get_i32()?;
                if size == i32::MAX {
                    let size = self.get_i64()?;
                    usize::try_from(size)
                        .map(Some)
                        .map_err(|_| DecodeError::InvalidSize(size))
                } else {
                    usize::try_from(size)
                        .map(Some)
                        .map_err(|_| DecodeError::InvalidSize(size as i64))
                }
            }
            size => Ok(Some(size as usize)),
        }
    }

    /// Read a size where null is not meaningful
    pub fn get_count(&mut self) -> Result<usize, DecodeError> {
        self.get_size()?.ok_or(DecodeError::UnexpectedNull)
    }

    /// Read a string. A null string reads as empty.
    pub fn get_string(&mut self) -> Result<String, DecodeError> {
        let Some(length) = self.get_size()? else {
            return Ok(String::new());
        };
        let raw = self.take(length)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidString)
    }

    pub fn get_bitset(&mut self) -> Result<BitSet, DecodeError> {
        let length = self.get_count()?;
        self.ensure(length, 1)?;
        let mut words = Vec::with_capacity(length.div_ceil(8));
        for _ in 0..length / 8 {
            words.push(self.get_u64()?);
        }
        let tail = length % 8;
        if tail > 0 {
            let mut word = 0u64;
            for (i, byte) in self.take(tail)?.iter().enumerate() {
                word |= (*byte as u64) << (8 * i);
            }
            words.push(word);
        }
        let mut bits = BitSet { words };
        bits.trim();
        Ok(bits)
    }
}

/// Write a size, where `None` is null
pub fn encode_size<B: BufMut>(size: Option<usize>, buffer: &mut B) {
    match size {
        None => buffer.put_u8(SIZE_NULL),
        Some(size) if size < SIZE_LONG as usize => buffer.put_u8(size as u8),
        Some(size) if size < i32::MAX as usize => {
            buffer.put_u8(SIZE_LONG);
            buffer.put_i32_le(size as i32);
        }
        Some(size) => {
            buffer.put_u8(SIZE_LONG);
            buffer.put_i32_le(i32::MAX);
            buffer.put_i64_le(size as i64);
        }
    }
}

pub fn encode_string<B: BufMut>(value: &str, buffer: &mut B) {
    encode_size(Some(value.len()), buffer);
    buffer.put_slice(value.as_bytes());
}

pub fn encode_bitset<B: BufMut>(bits: &BitSet, buffer: &mut B) {
    let length = bits.len().div_ceil(8);
    encode_size(Some(length), buffer);
    for byte in 0..length {
        buffer.put_u8((bits.words[byte / 8] >> (8 * (byte % 8))) as u8);
    }
}

/// Growable set of bit indices
///
/// Bit `i` identifies the field at pre-order index `i` of a structure.
#[derive(Clone, Default)]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        BitSet::default()
    }

    pub fn set(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % 64);
    }

    pub fn clear(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1 << (index % 64));
        }
        self.trim();
    }

    /// Clear every bit in `from..to`
    pub fn clear_range(&mut self, from: usize, to: usize) {
        for index in from..to.min(self.len()) {
            if let Some(word) = self.words.get_mut(index / 64) {
                *word &= !(1 << (index % 64));
            }
        }
        self.trim();
    }

    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1 << (index % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// One past the highest set bit
    pub fn len(&self) -> usize {
        match self.words.last() {
            None => 0,
            Some(word) => (self.words.len() - 1) * 64 + (64 - word.leading_zeros() as usize),
        }
    }

    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        (from..self.len()).find(|i| self.get(*i))
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(|i| self.get(*i))
    }

    /// Add every bit of `other` into this set
    pub fn union_with(&mut self, other: &BitSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (mine, theirs) in self.words.iter_mut().zip(&other.words) {
            *mine |= theirs;
        }
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl PartialEq for BitSet {
    fn eq(&self, other: &Self) -> bool {
        self.words == other.words
    }
}
impl Eq for BitSet {}

impl FromIterator<usize> for BitSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        let mut bits = BitSet::new();
        for index in iter {
            bits.set(index);
        }
        bits
    }
}

impl Display for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (n, index) in self.iter().enumerate() {
            if n > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{index}")?;
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitSet{self}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size_round_trip(size: Option<usize>) -> Option<usize> {
        let mut buffer = Vec::new();
        encode_size(size, &mut buffer);
        let mut reader = Reader::new(&buffer, ByteOrder::Little);
        let decoded = reader.get_size().unwrap();
        assert!(reader.is_empty(), "Trailing bytes after size {size:?}");
        decoded
    }

    #[test]
    fn test_size_round_trip() {
        assert_eq!(size_round_trip(None), None);
        for size in 0..=1025usize {
            assert_eq!(size_round_trip(Some(size)), Some(size));
        }
        for size in [
            i32::MAX as usize - 2,
            i32::MAX as usize - 1,
            i32::MAX as usize,
            i32::MAX as usize + 1,
        ] {
            assert_eq!(size_round_trip(Some(size)), Some(size));
        }
    }

    #[test]
    fn test_size_encoding() {
        let mut buffer = Vec::new();
        encode_size(None, &mut buffer);
        encode_size(Some(253), &mut buffer);
        encode_size(Some(254), &mut buffer);
        assert_eq!(buffer, [0xFF, 0xFD, 0xFE, 0xFE, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_truncated_size() {
        let mut reader = Reader::new(&[0xFE, 0x01, 0x02], ByteOrder::Little);
        assert_eq!(reader.get_size(), Err(DecodeError::Truncated));
        let mut reader = Reader::new(&[], ByteOrder::Little);
        assert_eq!(reader.get_size(), Err(DecodeError::Truncated));
        let mut reader = Reader::new(&[0xFE, 0xFF, 0xFF, 0xFF, 0xFF], ByteOrder::Little);
        assert_eq!(reader.get_size(), Err(DecodeError::InvalidSize(-1)));
    }

    #[test]
    fn test_big_endian_numbers() {
        let mut reader = Reader::new(&[0x00, 0x00, 0x01, 0x02, 0xFE, 0, 0, 1, 0], ByteOrder::Big);
        assert_eq!(reader.get_u32().unwrap(), 0x0102);
        assert_eq!(reader.get_size().unwrap(), Some(256));
    }

    #[test]
    fn test_string() {
        let mut buffer = Vec::new();
        encode_string("Hello", &mut buffer);
        assert_eq!(buffer, b"\x05Hello");
        let mut reader = Reader::new(&buffer, ByteOrder::Little);
        assert_eq!(reader.get_string().unwrap(), "Hello");

        let mut reader = Reader::new(&[0xFF], ByteOrder::Little);
        assert_eq!(reader.get_string().unwrap(), "");
        let mut reader = Reader::new(b"\x05Hel", ByteOrder::Little);
        assert_eq!(reader.get_string(), Err(DecodeError::Truncated));
    }

    fn bitset_round_trip(bits: &BitSet) -> BitSet {
        let mut buffer = Vec::new();
        encode_bitset(bits, &mut buffer);
        let mut reader = Reader::new(&buffer, ByteOrder::Little);
        let decoded = reader.get_bitset().unwrap();
        assert!(reader.is_empty());
        decoded
    }

    #[test]
    fn test_bitset_round_trip() {
        for bits in [
            BitSet::new(),
            BitSet::from_iter([0]),
            BitSet::from_iter([8]),
            BitSet::from_iter([1, 3, 17, 40]),
            BitSet::from_iter([65]),
            BitSet::from_iter([0, 63, 64, 130]),
        ] {
            assert_eq!(bitset_round_trip(&bits), bits);
        }
    }

    #[test]
    fn test_bitset_encoding() {
        let mut buffer = Vec::new();
        encode_bitset(&BitSet::new(), &mut buffer);
        assert_eq!(buffer, [0]);

        buffer.clear();
        encode_bitset(&BitSet::from_iter([0]), &mut buffer);
        assert_eq!(buffer, [1, 0x01]);

        buffer.clear();
        encode_bitset(&BitSet::from_iter([1, 8]), &mut buffer);
        assert_eq!(buffer, [2, 0x02, 0x01]);
    }

    #[test]
    fn test_bitset_big_endian_words() {
        // Full 8-byte groups are written as a long in the sender's byte order
        let data = [9u8, 0x80, 0, 0, 0, 0, 0, 0, 0x01, 0x04];
        let mut reader = Reader::new(&data, ByteOrder::Big);
        let bits = reader.get_bitset().unwrap();
        assert_eq!(bits, BitSet::from_iter([0, 63, 66]));
    }

    #[test]
    fn test_bitset_operations() {
        let mut bits = BitSet::from_iter([2, 5, 70]);
        assert_eq!(bits.len(), 71);
        assert_eq!(bits.cardinality(), 3);
        assert_eq!(bits.next_set_bit(3), Some(5));
        bits.clear_range(0, 6);
        assert_eq!(bits.iter().collect::<Vec<_>>(), vec![70]);
        bits.clear(70);
        assert!(bits.is_empty());
        assert_eq!(bits, BitSet::new());

        let mut bits = BitSet::from_iter([1]);
        bits.union_with(&BitSet::from_iter([1, 100]));
        assert_eq!(format!("{bits}"), "{1, 100}");
    }
}
