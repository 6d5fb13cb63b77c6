//! Scalar and scalar-array values, with their wire encoding and conversions

use std::fmt::{self, Display};

use bytes::BufMut;
use num::cast::AsPrimitive;

use crate::codec::{DecodeError, Reader, encode_size, encode_string};

use super::{DataError, codes};

#[derive(Debug, Clone)]
pub enum ScalarValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    UByte(u8),
    UShort(u16),
    UInt(u32),
    ULong(u64),
    Float(f32),
    Double(f64),
    String(String),
}

/// A number pulled out of any numeric value, used for coercion
#[derive(Debug, Clone, Copy)]
pub(crate) enum Number {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

macro_rules! cast_number {
    ($number:expr, $t:ty) => {
        match $number {
            Number::Signed(v) => v as $t,
            Number::Unsigned(v) => v as $t,
            Number::Float(v) => v as $t,
        }
    };
}

fn parse_number(text: &str) -> Option<Number> {
    let text = text.trim();
    text.parse::<i64>()
        .map(Number::Signed)
        .or_else(|_| text.parse::<u64>().map(Number::Unsigned))
        .or_else(|_| text.parse::<f64>().map(Number::Float))
        .ok()
}

impl ScalarValue {
    /// Default (zero) value for a scalar type code
    pub(crate) fn from_code(code: u8) -> Option<ScalarValue> {
        Some(match code {
            codes::BOOL => ScalarValue::Bool(false),
            codes::BYTE => ScalarValue::Byte(0),
            codes::SHORT => ScalarValue::Short(0),
            codes::INT => ScalarValue::Int(0),
            codes::LONG => ScalarValue::Long(0),
            codes::UBYTE => ScalarValue::UByte(0),
            codes::USHORT => ScalarValue::UShort(0),
            codes::UINT => ScalarValue::UInt(0),
            codes::ULONG => ScalarValue::ULong(0),
            codes::FLOAT => ScalarValue::Float(0.0),
            codes::DOUBLE => ScalarValue::Double(0.0),
            codes::STRING => ScalarValue::String(String::new()),
            _ => return None,
        })
    }

    pub fn type_code(&self) -> u8 {
        match self {
            ScalarValue::Bool(_) => codes::BOOL,
            ScalarValue::Byte(_) => codes::BYTE,
            ScalarValue::Short(_) => codes::SHORT,
            ScalarValue::Int(_) => codes::INT,
            ScalarValue::Long(_) => codes::LONG,
            ScalarValue::UByte(_) => codes::UBYTE,
            ScalarValue::UShort(_) => codes::USHORT,
            ScalarValue::UInt(_) => codes::UINT,
            ScalarValue::ULong(_) => codes::ULONG,
            ScalarValue::Float(_) => codes::FLOAT,
            ScalarValue::Double(_) => codes::DOUBLE,
            ScalarValue::String(_) => codes::STRING,
        }
    }

    pub fn type_name(&self) -> &'static str {
        codes::scalar_name(self.type_code())
    }

    pub(crate) fn encode<B: BufMut>(&self, buffer: &mut B) {
        match self {
            ScalarValue::Bool(v) => buffer.put_u8(*v as u8),
            ScalarValue::Byte(v) => buffer.put_i8(*v),
            ScalarValue::Short(v) => buffer.put_i16_le(*v),
            ScalarValue::Int(v) => buffer.put_i32_le(*v),
            ScalarValue::Long(v) => buffer.put_i64_le(*v),
            ScalarValue::UByte(v) => buffer.put_u8(*v),
            ScalarValue::UShort(v) => buffer.put_u16_le(*v),
            ScalarValue::UInt(v) => buffer.put_u32_le(*v),
            ScalarValue::ULong(v) => buffer.put_u64_le(*v),
            ScalarValue::Float(v) => buffer.put_f32_le(*v),
            ScalarValue::Double(v) => buffer.put_f64_le(*v),
            ScalarValue::String(v) => encode_string(v, buffer),
        }
    }

    /// Decode a new value of the same kind as this one
    pub(crate) fn decode(&mut self, reader: &mut Reader) -> Result<(), DecodeError> {
        match self {
            ScalarValue::Bool(v) => *v = reader.get_bool()?,
            ScalarValue::Byte(v) => *v = reader.get_i8()?,
            ScalarValue::Short(v) => *v = reader.get_i16()?,
            ScalarValue::Int(v) => *v = reader.get_i32()?,
            ScalarValue::Long(v) => *v = reader.get_i64()?,
            ScalarValue::UByte(v) => *v = reader.get_u8()?,
            ScalarValue::UShort(v) => *v = reader.get_u16()?,
            ScalarValue::UInt(v) => *v = reader.get_u32()?,
            ScalarValue::ULong(v) => *v = reader.get_u64()?,
            ScalarValue::Float(v) => *v = reader.get_f32()?,
            ScalarValue::Double(v) => *v = reader.get_f64()?,
            ScalarValue::String(v) => *v = reader.get_string()?,
        }
        Ok(())
    }

    pub(crate) fn number(&self) -> Option<Number> {
        Some(match self {
            ScalarValue::Bool(v) => Number::Unsigned(*v as u64),
            ScalarValue::Byte(v) => Number::Signed(*v as i64),
            ScalarValue::Short(v) => Number::Signed(*v as i64),
            ScalarValue::Int(v) => Number::Signed(*v as i64),
            ScalarValue::Long(v) => Number::Signed(*v),
            ScalarValue::UByte(v) => Number::Unsigned(*v as u64),
            ScalarValue::UShort(v) => Number::Unsigned(*v as u64),
            ScalarValue::UInt(v) => Number::Unsigned(*v as u64),
            ScalarValue::ULong(v) => Number::Unsigned(*v),
            ScalarValue::Float(v) => Number::Float(*v as f64),
            ScalarValue::Double(v) => Number::Float(*v),
            ScalarValue::String(v) => return parse_number(v),
        })
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.number().map(|n| cast_number!(n, f64))
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.number().map(|n| cast_number!(n, i64))
    }

    pub fn is_number(&self) -> bool {
        !matches!(self, ScalarValue::Bool(_) | ScalarValue::String(_))
    }

    /// Assign from another scalar, converting to this value's kind
    pub fn assign(&mut self, other: &ScalarValue) -> Result<(), DataError> {
        if let ScalarValue::String(v) = self {
            *v = other.to_string();
            return Ok(());
        }
        if matches!(self, ScalarValue::Bool(_))
            && let ScalarValue::String(text) = other
        {
            match text.trim().to_ascii_lowercase().as_str() {
                "true" => {
                    *self = ScalarValue::Bool(true);
                    return Ok(());
                }
                "false" => {
                    *self = ScalarValue::Bool(false);
                    return Ok(());
                }
                _ => (),
            }
        }
        self.assign_number(other)
    }

    fn assign_number(&mut self, other: &ScalarValue) -> Result<(), DataError> {
        let number = other
            .number()
            .ok_or_else(|| DataError::cannot_convert(other, self.type_name()))?;
        match self {
            ScalarValue::Bool(v) => {
                *v = match number {
                    Number::Signed(n) => n != 0,
                    Number::Unsigned(n) => n != 0,
                    Number::Float(n) => n != 0.0,
                }
            }
            ScalarValue::Byte(v) => *v = cast_number!(number, i8),
            ScalarValue::Short(v) => *v = cast_number!(number, i16),
            ScalarValue::Int(v) => *v = cast_number!(number, i32),
            ScalarValue::Long(v) => *v = cast_number!(number, i64),
            ScalarValue::UByte(v) => *v = cast_number!(number, u8),
            ScalarValue::UShort(v) => *v = cast_number!(number, u16),
            ScalarValue::UInt(v) => *v = cast_number!(number, u32),
            ScalarValue::ULong(v) => *v = cast_number!(number, u64),
            ScalarValue::Float(v) => *v = cast_number!(number, f32),
            ScalarValue::Double(v) => *v = cast_number!(number, f64),
            ScalarValue::String(v) => *v = other.to_string(),
        }
        Ok(())
    }
}

/// Floats compare by bit pattern, so an unchanged NaN is not a change
impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScalarValue::Bool(a), ScalarValue::Bool(b)) => a == b,
            (ScalarValue::Byte(a), ScalarValue::Byte(b)) => a == b,
            (ScalarValue::Short(a), ScalarValue::Short(b)) => a == b,
            (ScalarValue::Int(a), ScalarValue::Int(b)) => a == b,
            (ScalarValue::Long(a), ScalarValue::Long(b)) => a == b,
            (ScalarValue::UByte(a), ScalarValue::UByte(b)) => a == b,
            (ScalarValue::UShort(a), ScalarValue::UShort(b)) => a == b,
            (ScalarValue::UInt(a), ScalarValue::UInt(b)) => a == b,
            (ScalarValue::ULong(a), ScalarValue::ULong(b)) => a == b,
            (ScalarValue::Float(a), ScalarValue::Float(b)) => a.to_bits() == b.to_bits(),
            (ScalarValue::Double(a), ScalarValue::Double(b)) => a.to_bits() == b.to_bits(),
            (ScalarValue::String(a), ScalarValue::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(v) => write!(f, "{v}"),
            ScalarValue::Byte(v) => write!(f, "{v}"),
            ScalarValue::Short(v) => write!(f, "{v}"),
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::Long(v) => write!(f, "{v}"),
            ScalarValue::UByte(v) => write!(f, "{v}"),
            ScalarValue::UShort(v) => write!(f, "{v}"),
            ScalarValue::UInt(v) => write!(f, "{v}"),
            ScalarValue::ULong(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Double(v) => write!(f, "{v}"),
            ScalarValue::String(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ArrayValue {
    Bool(Vec<bool>),
    Byte(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    UByte(Vec<u8>),
    UShort(Vec<u16>),
    UInt(Vec<u32>),
    ULong(Vec<u64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    String(Vec<String>),
}

fn cast_all<T, U>(from: &[T]) -> Vec<U>
where
    T: AsPrimitive<U>,
    U: Copy + 'static,
{
    from.iter().map(|v| v.as_()).collect()
}

/// Convert any numeric array into a vector of `$t`
macro_rules! convert_array {
    ($source:expr, $t:ty) => {
        match $source {
            ArrayValue::Bool(v) => Some(v.iter().map(|b| (*b as u8).as_()).collect::<Vec<$t>>()),
            ArrayValue::Byte(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::Short(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::Int(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::Long(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::UByte(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::UShort(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::UInt(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::ULong(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::Float(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::Double(v) => Some(cast_all::<_, $t>(v)),
            ArrayValue::String(v) => v
                .iter()
                .map(|s| parse_number(s).map(|n| cast_number!(n, $t)))
                .collect::<Option<Vec<$t>>>(),
        }
    };
}

macro_rules! decode_array {
    ($reader:expr, $count:expr, $size:expr, $get:ident) => {{
        $reader.ensure($count, $size)?;
        (0..$count)
            .map(|_| $reader.$get())
            .collect::<Result<Vec<_>, DecodeError>>()?
    }};
}

impl ArrayValue {
    /// Empty array for an element type code
    pub(crate) fn from_element_code(code: u8) -> Option<ArrayValue> {
        Some(match code {
            codes::BOOL => ArrayValue::Bool(Vec::new()),
            codes::BYTE => ArrayValue::Byte(Vec::new()),
            codes::SHORT => ArrayValue::Short(Vec::new()),
            codes::INT => ArrayValue::Int(Vec::new()),
            codes::LONG => ArrayValue::Long(Vec::new()),
            codes::UBYTE => ArrayValue::UByte(Vec::new()),
            codes::USHORT => ArrayValue::UShort(Vec::new()),
            codes::UINT => ArrayValue::UInt(Vec::new()),
            codes::ULONG => ArrayValue::ULong(Vec::new()),
            codes::FLOAT => ArrayValue::Float(Vec::new()),
            codes::DOUBLE => ArrayValue::Double(Vec::new()),
            codes::STRING => ArrayValue::String(Vec::new()),
            _ => return None,
        })
    }

    pub fn element_code(&self) -> u8 {
        match self {
            ArrayValue::Bool(_) => codes::BOOL,
            ArrayValue::Byte(_) => codes::BYTE,
            ArrayValue::Short(_) => codes::SHORT,
            ArrayValue::Int(_) => codes::INT,
            ArrayValue::Long(_) => codes::LONG,
            ArrayValue::UByte(_) => codes::UBYTE,
            ArrayValue::UShort(_) => codes::USHORT,
            ArrayValue::UInt(_) => codes::UINT,
            ArrayValue::ULong(_) => codes::ULONG,
            ArrayValue::Float(_) => codes::FLOAT,
            ArrayValue::Double(_) => codes::DOUBLE,
            ArrayValue::String(_) => codes::STRING,
        }
    }

    pub fn type_code(&self) -> u8 {
        self.element_code() | codes::VARIABLE_ARRAY
    }

    pub fn type_name(&self) -> &'static str {
        codes::scalar_name(self.element_code())
    }

    pub fn len(&self) -> usize {
        match self {
            ArrayValue::Bool(v) => v.len(),
            ArrayValue::Byte(v) => v.len(),
            ArrayValue::Short(v) => v.len(),
            ArrayValue::Int(v) => v.len(),
            ArrayValue::Long(v) => v.len(),
            ArrayValue::UByte(v) => v.len(),
            ArrayValue::UShort(v) => v.len(),
            ArrayValue::UInt(v) => v.len(),
            ArrayValue::ULong(v) => v.len(),
            ArrayValue::Float(v) => v.len(),
            ArrayValue::Double(v) => v.len(),
            ArrayValue::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same element type, no elements
    pub fn cleared(&self) -> ArrayValue {
        // Every element code has an array form
        ArrayValue::from_element_code(self.element_code()).unwrap_or(ArrayValue::Double(Vec::new()))
    }

    /// Element `index` as a scalar
    pub fn get(&self, index: usize) -> Option<ScalarValue> {
        Some(match self {
            ArrayValue::Bool(v) => ScalarValue::Bool(*v.get(index)?),
            ArrayValue::Byte(v) => ScalarValue::Byte(*v.get(index)?),
            ArrayValue::Short(v) => ScalarValue::Short(*v.get(index)?),
            ArrayValue::Int(v) => ScalarValue::Int(*v.get(index)?),
            ArrayValue::Long(v) => ScalarValue::Long(*v.get(index)?),
            ArrayValue::UByte(v) => ScalarValue::UByte(*v.get(index)?),
            ArrayValue::UShort(v) => ScalarValue::UShort(*v.get(index)?),
            ArrayValue::UInt(v) => ScalarValue::UInt(*v.get(index)?),
            ArrayValue::ULong(v) => ScalarValue::ULong(*v.get(index)?),
            ArrayValue::Float(v) => ScalarValue::Float(*v.get(index)?),
            ArrayValue::Double(v) => ScalarValue::Double(*v.get(index)?),
            ArrayValue::String(v) => ScalarValue::String(v.get(index)?.clone()),
        })
    }

    pub(crate) fn encode<B: BufMut>(&self, buffer: &mut B) {
        encode_size(Some(self.len()), buffer);
        match self {
            ArrayValue::Bool(v) => v.iter().for_each(|x| buffer.put_u8(*x as u8)),
            ArrayValue::Byte(v) => v.iter().for_each(|x| buffer.put_i8(*x)),
            ArrayValue::Short(v) => v.iter().for_each(|x| buffer.put_i16_le(*x)),
            ArrayValue::Int(v) => v.iter().for_each(|x| buffer.put_i32_le(*x)),
            ArrayValue::Long(v) => v.iter().for_each(|x| buffer.put_i64_le(*x)),
            ArrayValue::UByte(v) => buffer.put_slice(v),
            ArrayValue::UShort(v) => v.iter().for_each(|x| buffer.put_u16_le(*x)),
            ArrayValue::UInt(v) => v.iter().for_each(|x| buffer.put_u32_le(*x)),
            ArrayValue::ULong(v) => v.iter().for_each(|x| buffer.put_u64_le(*x)),
            ArrayValue::Float(v) => v.iter().for_each(|x| buffer.put_f32_le(*x)),
            ArrayValue::Double(v) => v.iter().for_each(|x| buffer.put_f64_le(*x)),
            ArrayValue::String(v) => v.iter().for_each(|x| encode_string(x, buffer)),
        }
    }

    pub(crate) fn decode(&mut self, reader: &mut Reader) -> Result<(), DecodeError> {
        let count = reader.get_size()?.unwrap_or(0);
        match self {
            ArrayValue::Bool(v) => *v = decode_array!(reader, count, 1, get_bool),
            ArrayValue::Byte(v) => *v = decode_array!(reader, count, 1, get_i8),
            ArrayValue::Short(v) => *v = decode_array!(reader, count, 2, get_i16),
            ArrayValue::Int(v) => *v = decode_array!(reader, count, 4, get_i32),
            ArrayValue::Long(v) => *v = decode_array!(reader, count, 8, get_i64),
            ArrayValue::UByte(v) => *v = reader.take(count)?.to_vec(),
            ArrayValue::UShort(v) => *v = decode_array!(reader, count, 2, get_u16),
            ArrayValue::UInt(v) => *v = decode_array!(reader, count, 4, get_u32),
            ArrayValue::ULong(v) => *v = decode_array!(reader, count, 8, get_u64),
            ArrayValue::Float(v) => *v = decode_array!(reader, count, 4, get_f32),
            ArrayValue::Double(v) => *v = decode_array!(reader, count, 8, get_f64),
            ArrayValue::String(v) => *v = decode_array!(reader, count, 1, get_string),
        }
        Ok(())
    }

    /// Assign from another array, converting elements to this array's kind
    pub fn assign(&mut self, other: &ArrayValue) -> Result<(), DataError> {
        let target = self.type_name();
        let failed = || DataError::cannot_convert(other, target);
        match self {
            ArrayValue::String(v) => {
                *v = (0..other.len())
                    .filter_map(|i| other.get(i).map(|s| s.to_string()))
                    .collect()
            }
            ArrayValue::Bool(v) => {
                *v = convert_array!(other, f64)
                    .ok_or_else(failed)?
                    .into_iter()
                    .map(|x| x != 0.0)
                    .collect()
            }
            ArrayValue::Byte(v) => *v = convert_array!(other, i8).ok_or_else(failed)?,
            ArrayValue::Short(v) => *v = convert_array!(other, i16).ok_or_else(failed)?,
            ArrayValue::Int(v) => *v = convert_array!(other, i32).ok_or_else(failed)?,
            ArrayValue::Long(v) => *v = convert_array!(other, i64).ok_or_else(failed)?,
            ArrayValue::UByte(v) => *v = convert_array!(other, u8).ok_or_else(failed)?,
            ArrayValue::UShort(v) => *v = convert_array!(other, u16).ok_or_else(failed)?,
            ArrayValue::UInt(v) => *v = convert_array!(other, u32).ok_or_else(failed)?,
            ArrayValue::ULong(v) => *v = convert_array!(other, u64).ok_or_else(failed)?,
            ArrayValue::Float(v) => *v = convert_array!(other, f32).ok_or_else(failed)?,
            ArrayValue::Double(v) => *v = convert_array!(other, f64).ok_or_else(failed)?,
        }
        Ok(())
    }

    /// Replace the contents with a single converted element
    pub fn assign_scalar(&mut self, value: &ScalarValue) -> Result<(), DataError> {
        let mut element = ArrayValue::from_element_code(value.type_code())
            .ok_or_else(|| DataError::cannot_convert(value, self.type_name()))?;
        element.push_scalar(value);
        self.assign(&element)
    }

    fn push_scalar(&mut self, value: &ScalarValue) {
        match (self, value) {
            (ArrayValue::Bool(v), ScalarValue::Bool(x)) => v.push(*x),
            (ArrayValue::Byte(v), ScalarValue::Byte(x)) => v.push(*x),
            (ArrayValue::Short(v), ScalarValue::Short(x)) => v.push(*x),
            (ArrayValue::Int(v), ScalarValue::Int(x)) => v.push(*x),
            (ArrayValue::Long(v), ScalarValue::Long(x)) => v.push(*x),
            (ArrayValue::UByte(v), ScalarValue::UByte(x)) => v.push(*x),
            (ArrayValue::UShort(v), ScalarValue::UShort(x)) => v.push(*x),
            (ArrayValue::UInt(v), ScalarValue::UInt(x)) => v.push(*x),
            (ArrayValue::ULong(v), ScalarValue::ULong(x)) => v.push(*x),
            (ArrayValue::Float(v), ScalarValue::Float(x)) => v.push(*x),
            (ArrayValue::Double(v), ScalarValue::Double(x)) => v.push(*x),
            (ArrayValue::String(v), ScalarValue::String(x)) => v.push(x.clone()),
            _ => (),
        }
    }
}

impl PartialEq for ArrayValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ArrayValue::Bool(a), ArrayValue::Bool(b)) => a == b,
            (ArrayValue::Byte(a), ArrayValue::Byte(b)) => a == b,
            (ArrayValue::Short(a), ArrayValue::Short(b)) => a == b,
            (ArrayValue::Int(a), ArrayValue::Int(b)) => a == b,
            (ArrayValue::Long(a), ArrayValue::Long(b)) => a == b,
            (ArrayValue::UByte(a), ArrayValue::UByte(b)) => a == b,
            (ArrayValue::UShort(a), ArrayValue::UShort(b)) => a == b,
            (ArrayValue::UInt(a), ArrayValue::UInt(b)) => a == b,
            (ArrayValue::ULong(a), ArrayValue::ULong(b)) => a == b,
            (ArrayValue::Float(a), ArrayValue::Float(b)) => {
                a.iter().map(|x| x.to_bits()).eq(b.iter().map(|x| x.to_bits()))
            }
            (ArrayValue::Double(a), ArrayValue::Double(b)) => {
                a.iter().map(|x| x.to_bits()).eq(b.iter().map(|x| x.to_bits()))
            }
            (ArrayValue::String(a), ArrayValue::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for ArrayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for i in 0..self.len() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if let Some(element) = self.get(i) {
                write!(f, "{element}")?;
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteOrder;

    #[test]
    fn test_scalar_coercion() {
        let mut value = ScalarValue::Double(0.0);
        value.assign(&ScalarValue::Float(42.0)).unwrap();
        assert_eq!(value, ScalarValue::Double(42.0));
        value.assign(&ScalarValue::String("3.5".into())).unwrap();
        assert_eq!(value, ScalarValue::Double(3.5));

        let mut value = ScalarValue::Bool(false);
        value.assign(&ScalarValue::Int(1)).unwrap();
        assert_eq!(value, ScalarValue::Bool(true));
        value.assign(&ScalarValue::String("false".into())).unwrap();
        assert_eq!(value, ScalarValue::Bool(false));

        let mut value = ScalarValue::String(String::new());
        value.assign(&ScalarValue::Long(47)).unwrap();
        assert_eq!(value, ScalarValue::String("47".into()));

        let mut value = ScalarValue::Int(0);
        assert!(value.assign(&ScalarValue::String("nope".into())).is_err());
        value.assign(&ScalarValue::Double(-2.7)).unwrap();
        assert_eq!(value, ScalarValue::Int(-2));
    }

    #[test]
    fn test_array_coercion() {
        let mut bytes = ArrayValue::Byte(vec![]);
        bytes.assign(&ArrayValue::Double(vec![1.5, -2.0, 300.0])).unwrap();
        assert_eq!(bytes, ArrayValue::Byte(vec![1, -2, 127]));

        let mut doubles = ArrayValue::Double(vec![]);
        doubles.assign(&ArrayValue::String(vec!["1".into(), "2.5".into()])).unwrap();
        assert_eq!(doubles, ArrayValue::Double(vec![1.0, 2.5]));
        doubles.assign_scalar(&ScalarValue::Int(3)).unwrap();
        assert_eq!(doubles, ArrayValue::Double(vec![3.0]));

        let mut strings = ArrayValue::String(vec![]);
        strings.assign(&ArrayValue::Int(vec![1, 2])).unwrap();
        assert_eq!(strings, ArrayValue::String(vec!["1".into(), "2".into()]));
    }

    #[test]
    fn test_array_decode_rejects_oversized_count() {
        // Claims 1000 doubles but carries only one
        let mut data = vec![0xFE, 0xE8, 0x03, 0x00, 0x00];
        data.extend_from_slice(&1.0f64.to_le_bytes());
        let mut value = ArrayValue::Double(Vec::new());
        let mut reader = Reader::new(&data, ByteOrder::Little);
        assert_eq!(value.decode(&mut reader), Err(DecodeError::Truncated));
    }

    #[test]
    fn test_array_wire_format() {
        let mut buffer = Vec::new();
        ArrayValue::Short(vec![1, -1]).encode(&mut buffer);
        assert_eq!(buffer, [2, 0x01, 0x00, 0xFF, 0xFF]);
        let mut decoded = ArrayValue::Short(Vec::new());
        decoded
            .decode(&mut Reader::new(&buffer, ByteOrder::Little))
            .unwrap();
        assert_eq!(decoded, ArrayValue::Short(vec![1, -1]));
    }
}
