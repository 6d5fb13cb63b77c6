//! Self-describing PVA data: values, structures and their type descriptions
//!
//! Every piece of PVA data is a [`PvaData`]: a named scalar, scalar array,
//! [`Structure`], [`StructureArray`], or variant [`Any`] slot. Fields inside a
//! structure are addressed three ways:
//!
//! - by name, one level at a time, with [`Structure::get`],
//! - by dot-separated path, with [`Structure::locate`],
//! - by pre-order index, with [`Structure::get_index`]. Index 0 is the
//!   structure itself, and each field (containers included) takes the next
//!   index. These indices are the bits of the [`BitSet`] returned by
//!   [`Structure::update`] and sent alongside every incremental update.
//!
//! ```
//! use pvars::data::{PvaData, Structure};
//!
//! let time = Structure::new(
//!     "timeStamp",
//!     "time_t",
//!     vec![
//!         PvaData::long("secondsPastEpoch", 0),
//!         PvaData::int("nanoseconds", 0),
//!         PvaData::int("userTag", 0),
//!     ],
//! )
//! .unwrap();
//! let mut demo = Structure::new(
//!     "demo",
//!     "",
//!     vec![PvaData::double("value", 3.13), time.into()],
//! )
//! .unwrap();
//!
//! let mut newer = demo.clone();
//! newer.locate_mut("timeStamp.nanoseconds").unwrap().set_value(42).unwrap();
//! let changes = demo.update(&newer).unwrap();
//! assert_eq!(changes.iter().collect::<Vec<_>>(), vec![4]);
//! ```

use std::fmt::{self, Display};

use bytes::BufMut;
use thiserror::Error;

use crate::codec::{BitSet, DecodeError, Reader, encode_size};

pub mod nt;
mod registry;
mod scalar;
mod structure;

pub use registry::TypeRegistry;
pub use scalar::{ArrayValue, ScalarValue};
pub use structure::{Element, Structure, StructureArray};

/// Wire type codes
pub(crate) mod codes {
    pub const BOOL: u8 = 0x00;
    pub const BYTE: u8 = 0x20;
    pub const SHORT: u8 = 0x21;
    pub const INT: u8 = 0x22;
    pub const LONG: u8 = 0x23;
    pub const UBYTE: u8 = 0x24;
    pub const USHORT: u8 = 0x25;
    pub const UINT: u8 = 0x26;
    pub const ULONG: u8 = 0x27;
    pub const FLOAT: u8 = 0x42;
    pub const DOUBLE: u8 = 0x43;
    pub const STRING: u8 = 0x60;

    pub const ARRAY_MASK: u8 = 0x18;
    pub const VARIABLE_ARRAY: u8 = 0x08;
    pub const BOUNDED_ARRAY: u8 = 0x10;
    pub const FIXED_ARRAY: u8 = 0x18;

    pub const STRUCTURE: u8 = 0x80;
    pub const UNION: u8 = 0x81;
    pub const ANY: u8 = 0x82;
    pub const STRUCTURE_ARRAY: u8 = 0x88;
    pub const UNION_ARRAY: u8 = 0x89;
    pub const ANY_ARRAY: u8 = 0x8A;

    pub const FULL_TAGGED_ID: u8 = 0xFC;
    pub const FULL_WITH_ID: u8 = 0xFD;
    pub const ONLY_ID: u8 = 0xFE;
    pub const NULL: u8 = 0xFF;

    pub fn scalar_name(code: u8) -> &'static str {
        match code {
            BOOL => "boolean",
            BYTE => "byte",
            SHORT => "short",
            INT => "int",
            LONG => "long",
            UBYTE => "ubyte",
            USHORT => "ushort",
            UINT => "uint",
            ULONG => "ulong",
            FLOAT => "float",
            DOUBLE => "double",
            STRING => "string",
            _ => "unknown",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Structure with unnamed element")]
    UnnamedElement,
    #[error("Cannot locate '{element}' for '{path}'")]
    CannotLocate { element: String, path: String },
    #[error("Element '{element}' of '{path}' is not a structure")]
    NotAStructure { element: String, path: String },
    #[error("Empty path element in '{0}'")]
    EmptyPathElement(String),
    #[error("No element with index {0}")]
    InvalidIndex(usize),
    #[error("Cannot set {target} from '{value}'")]
    CannotConvert { value: String, target: String },
    #[error("Incompatible data: {0}")]
    Incompatible(String),
    #[error("Invalid request '{0}'")]
    InvalidRequest(String),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl DataError {
    pub(crate) fn cannot_convert(value: impl Display, target: &str) -> DataError {
        DataError::CannotConvert {
            value: value.to_string(),
            target: target.to_string(),
        }
    }
}

/// A named piece of PVA data
#[derive(Debug, Clone)]
pub enum PvaData {
    Scalar { name: String, value: ScalarValue },
    Array { name: String, value: ArrayValue },
    Structure(Structure),
    StructureArray(StructureArray),
    Any(Any),
    AnyArray(AnyArray),
}

macro_rules! scalar_constructor {
    ($fn:ident, $t:ty, $variant:ident) => {
        pub fn $fn(name: impl Into<String>, value: $t) -> PvaData {
            PvaData::Scalar {
                name: name.into(),
                value: ScalarValue::$variant(value),
            }
        }
    };
}

impl PvaData {
    pub fn scalar(name: impl Into<String>, value: ScalarValue) -> PvaData {
        PvaData::Scalar {
            name: name.into(),
            value,
        }
    }
    pub fn array(name: impl Into<String>, value: ArrayValue) -> PvaData {
        PvaData::Array {
            name: name.into(),
            value,
        }
    }
    scalar_constructor!(bool, bool, Bool);
    scalar_constructor!(byte, i8, Byte);
    scalar_constructor!(short, i16, Short);
    scalar_constructor!(int, i32, Int);
    scalar_constructor!(long, i64, Long);
    scalar_constructor!(ubyte, u8, UByte);
    scalar_constructor!(ushort, u16, UShort);
    scalar_constructor!(uint, u32, UInt);
    scalar_constructor!(ulong, u64, ULong);
    scalar_constructor!(float, f32, Float);
    scalar_constructor!(double, f64, Double);

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> PvaData {
        PvaData::Scalar {
            name: name.into(),
            value: ScalarValue::String(value.into()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PvaData::Scalar { name, .. } | PvaData::Array { name, .. } => name,
            PvaData::Structure(s) => s.name(),
            PvaData::StructureArray(a) => a.name(),
            PvaData::Any(a) => a.name(),
            PvaData::AnyArray(a) => a.name(),
        }
    }

    pub(crate) fn set_name(&mut self, new_name: impl Into<String>) {
        let new_name = new_name.into();
        match self {
            PvaData::Scalar { name, .. } | PvaData::Array { name, .. } => *name = new_name,
            PvaData::Structure(s) => s.set_name(new_name),
            PvaData::StructureArray(a) => a.name = new_name,
            PvaData::Any(a) => a.name = new_name,
            PvaData::AnyArray(a) => a.name = new_name,
        }
    }

    /// The type as shown by [`PvaData::format_type`]
    pub fn type_name(&self) -> String {
        match self {
            PvaData::Scalar { value, .. } => value.type_name().to_string(),
            PvaData::Array { value, .. } => format!("{}[]", value.type_name()),
            PvaData::Structure(s) => s.display_type_name().to_string(),
            PvaData::StructureArray(a) => format!("{}[]", a.element().display_type_name()),
            PvaData::Any(_) => "any".to_string(),
            PvaData::AnyArray(_) => "any[]".to_string(),
        }
    }

    /// Number of fields below this one in pre-order indexing
    pub fn descendant_count(&self) -> usize {
        match self {
            PvaData::Structure(s) => s.descendant_count(),
            _ => 0,
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarValue> {
        match self {
            PvaData::Scalar { value, .. } => Some(value),
            _ => None,
        }
    }
    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            PvaData::Array { value, .. } => Some(value),
            _ => None,
        }
    }
    pub fn as_structure(&self) -> Option<&Structure> {
        match self {
            PvaData::Structure(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_structure_mut(&mut self) -> Option<&mut Structure> {
        match self {
            PvaData::Structure(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_any(&self) -> Option<&Any> {
        match self {
            PvaData::Any(a) => Some(a),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        self.as_scalar().and_then(|s| s.as_f64())
    }
    pub fn as_i64(&self) -> Option<i64> {
        self.as_scalar().and_then(|s| s.as_i64())
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PvaData::Scalar {
                value: ScalarValue::String(s),
                ..
            } => Some(s),
            _ => None,
        }
    }

    /// An empty copy of this field's type, with a new name
    pub fn clone_type(&self, name: impl Into<String>) -> PvaData {
        let name = name.into();
        match self {
            PvaData::Scalar { value, .. } => PvaData::Scalar {
                name,
                value: ScalarValue::from_code(value.type_code())
                    .unwrap_or(ScalarValue::Double(0.0)),
            },
            PvaData::Array { value, .. } => PvaData::Array {
                name,
                value: value.cleared(),
            },
            PvaData::Structure(s) => PvaData::Structure(s.clone_type(name)),
            PvaData::StructureArray(a) => {
                PvaData::StructureArray(StructureArray::new(name, a.element().clone()))
            }
            PvaData::Any(_) => PvaData::Any(Any::new(name, None)),
            PvaData::AnyArray(_) => PvaData::AnyArray(AnyArray::new(name, Vec::new())),
        }
    }

    /// A deep copy of the value
    pub fn clone_data(&self) -> PvaData {
        self.clone()
    }

    /// Set this value from another, converting into this field's type
    ///
    /// Numbers convert between all numeric kinds, strings are parsed, and
    /// anything scalar can be written into a string. Arrays convert element
    /// by element, and structures field by field.
    pub fn set_value(&mut self, new_value: impl Into<PvaData>) -> Result<(), DataError> {
        self.assign(&new_value.into())
    }

    pub(crate) fn assign(&mut self, new_value: &PvaData) -> Result<(), DataError> {
        // Unwrap variant values into non-variant fields
        if let PvaData::Any(any) = new_value
            && !matches!(self, PvaData::Any(_))
        {
            return match any.get() {
                Some(inner) => self.assign(inner),
                None => Err(DataError::cannot_convert("(empty any)", &self.type_name())),
            };
        }
        match (self, new_value) {
            (PvaData::Scalar { value, .. }, PvaData::Scalar { value: other, .. }) => {
                value.assign(other)
            }
            (PvaData::Scalar { value, .. }, PvaData::Array { value: other, .. })
                if other.len() == 1 =>
            {
                match other.get(0) {
                    Some(element) => value.assign(&element),
                    None => Err(DataError::cannot_convert(other, value.type_name())),
                }
            }
            (PvaData::Array { value, .. }, PvaData::Array { value: other, .. }) => {
                value.assign(other)
            }
            (PvaData::Array { value, .. }, PvaData::Scalar { value: other, .. }) => {
                value.assign_scalar(other)
            }
            (PvaData::Structure(s), PvaData::Structure(other)) => s.assign(other),
            (PvaData::StructureArray(a), PvaData::StructureArray(other)) => a.assign(other),
            (PvaData::Any(a), PvaData::Any(other)) => {
                a.value = other.value.clone();
                Ok(())
            }
            (PvaData::Any(a), other) => {
                a.set(Some(other.clone()));
                Ok(())
            }
            (PvaData::AnyArray(a), PvaData::AnyArray(other)) => {
                a.items = other.items.clone();
                Ok(())
            }
            (this, other) => Err(DataError::cannot_convert(other, &this.type_name())),
        }
    }

    fn same_kind(&self, other: &PvaData) -> bool {
        match (self, other) {
            (PvaData::Scalar { value: a, .. }, PvaData::Scalar { value: b, .. }) => {
                a.type_code() == b.type_code()
            }
            (PvaData::Array { value: a, .. }, PvaData::Array { value: b, .. }) => {
                a.type_code() == b.type_code()
            }
            (PvaData::StructureArray(a), PvaData::StructureArray(b)) => {
                a.element().format_type() == b.element().format_type()
            }
            (PvaData::Any(_), PvaData::Any(_)) | (PvaData::AnyArray(_), PvaData::AnyArray(_)) => {
                true
            }
            _ => false,
        }
    }

    /// Update this field, at pre-order `index`, from `new_value`
    ///
    /// Changed leaves are overwritten and their index set in `changes`.
    /// Returns the index following this field and its descendants.
    pub(crate) fn update(
        &mut self,
        index: usize,
        new_value: &PvaData,
        changes: &mut BitSet,
    ) -> Result<usize, DataError> {
        if let (PvaData::Structure(mine), PvaData::Structure(theirs)) = (&mut *self, new_value) {
            return mine.update_fields(index, theirs, changes);
        }
        if self.same_kind(new_value) {
            if self != new_value {
                let name = self.name().to_string();
                *self = new_value.clone();
                self.set_name(name);
                changes.set(index);
            }
        } else {
            let mut candidate = self.clone();
            candidate.assign(new_value)?;
            if candidate != *self {
                *self = candidate;
                changes.set(index);
            }
        }
        Ok(index + 1)
    }

    pub fn encode_type<B: BufMut>(&self, buffer: &mut B, types: &mut TypeRegistry) {
        match self {
            PvaData::Scalar { value, .. } => buffer.put_u8(value.type_code()),
            PvaData::Array { value, .. } => buffer.put_u8(value.type_code()),
            PvaData::Structure(s) => s.encode_type(buffer, types),
            PvaData::StructureArray(a) => {
                buffer.put_u8(codes::STRUCTURE_ARRAY);
                a.element().encode_type(buffer, types);
            }
            PvaData::Any(_) => buffer.put_u8(codes::ANY),
            PvaData::AnyArray(_) => buffer.put_u8(codes::ANY_ARRAY),
        }
    }

    /// Encode the value only
    pub fn encode<B: BufMut>(&self, buffer: &mut B, types: &mut TypeRegistry) {
        match self {
            PvaData::Scalar { value, .. } => value.encode(buffer),
            PvaData::Array { value, .. } => value.encode(buffer),
            PvaData::Structure(s) => s.encode(buffer, types),
            PvaData::StructureArray(a) => a.encode(buffer, types),
            PvaData::Any(a) => a.encode(buffer, types),
            PvaData::AnyArray(a) => {
                encode_size(Some(a.items.len()), buffer);
                for item in &a.items {
                    item.encode(buffer, types);
                }
            }
        }
    }

    /// Decode a value into this field, which already has the right type
    pub fn decode(&mut self, types: &mut TypeRegistry, reader: &mut Reader) -> Result<(), DecodeError> {
        match self {
            PvaData::Scalar { value, .. } => value.decode(reader),
            PvaData::Array { value, .. } => value.decode(reader),
            PvaData::Structure(s) => reader.nested(|reader| s.decode(types, reader)),
            PvaData::StructureArray(a) => reader.nested(|reader| a.decode(types, reader)),
            PvaData::Any(a) => reader.nested(|reader| a.decode(types, reader)),
            PvaData::AnyArray(a) => reader.nested(|reader| {
                let count = reader.get_size()?.unwrap_or(0);
                reader.ensure(count, 1)?;
                a.items.clear();
                for _ in 0..count {
                    let mut item = Any::default();
                    item.decode(types, reader)?;
                    a.items.push(item);
                }
                Ok(())
            }),
        }
    }

    /// Human readable description of the type only
    pub fn format_type(&self) -> String {
        let mut out = String::new();
        self.format_into(&mut out, 0, false);
        out
    }

    pub(crate) fn format_into(&self, out: &mut String, level: usize, with_values: bool) {
        for _ in 0..level {
            out.push_str("    ");
        }
        out.push_str(&self.type_name());
        out.push(' ');
        out.push_str(self.name());
        match self {
            PvaData::Scalar { value, .. } if with_values => {
                out.push(' ');
                out.push_str(&value.to_string());
            }
            PvaData::Array { value, .. } if with_values => {
                out.push(' ');
                out.push_str(&value.to_string());
            }
            PvaData::Structure(s) => s.format_fields(out, level + 1, with_values),
            PvaData::StructureArray(a) if with_values => {
                for item in a.items() {
                    out.push('\n');
                    PvaData::Structure(item.clone()).format_into(out, level + 1, true);
                }
            }
            PvaData::StructureArray(a) => {
                a.element().format_fields(out, level + 1, false);
            }
            PvaData::Any(a) if with_values => {
                if let Some(value) = a.get() {
                    out.push('\n');
                    value.format_into(out, level + 1, true);
                }
            }
            PvaData::AnyArray(a) if with_values => {
                for value in a.items.iter().filter_map(|i| i.get()) {
                    out.push('\n');
                    value.format_into(out, level + 1, true);
                }
            }
            _ => (),
        }
    }
}

/// Field values compare equal regardless of their names
impl PartialEq for PvaData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (PvaData::Scalar { value: a, .. }, PvaData::Scalar { value: b, .. }) => a == b,
            (PvaData::Array { value: a, .. }, PvaData::Array { value: b, .. }) => a == b,
            (PvaData::Structure(a), PvaData::Structure(b)) => a == b,
            (PvaData::StructureArray(a), PvaData::StructureArray(b)) => a == b,
            (PvaData::Any(a), PvaData::Any(b)) => a == b,
            (PvaData::AnyArray(a), PvaData::AnyArray(b)) => a == b,
            _ => false,
        }
    }
}

impl Display for PvaData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.format_into(&mut out, 0, true);
        f.write_str(&out)
    }
}

/// Variant slot holding zero or one value of any type
#[derive(Debug, Clone, Default)]
pub struct Any {
    name: String,
    value: Option<Box<PvaData>>,
}

impl Any {
    pub fn new(name: impl Into<String>, value: Option<PvaData>) -> Any {
        Any {
            name: name.into(),
            value: value.map(Box::new),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn get(&self) -> Option<&PvaData> {
        self.value.as_deref()
    }
    /// Replace the held value; `None` clears it
    pub fn set(&mut self, value: Option<PvaData>) {
        self.value = value.map(Box::new);
    }

    fn encode<B: BufMut>(&self, buffer: &mut B, types: &mut TypeRegistry) {
        match &self.value {
            None => buffer.put_u8(codes::NULL),
            Some(value) => {
                value.encode_type(buffer, types);
                value.encode(buffer, types);
            }
        }
    }

    fn decode(&mut self, types: &mut TypeRegistry, reader: &mut Reader) -> Result<(), DecodeError> {
        self.value = match types.decode_type("", reader)? {
            None => None,
            Some(mut value) => {
                value.decode(types, reader)?;
                Some(Box::new(value))
            }
        };
        Ok(())
    }
}

impl PartialEq for Any {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnyArray {
    name: String,
    items: Vec<Any>,
}

impl AnyArray {
    pub fn new(name: impl Into<String>, items: Vec<Any>) -> AnyArray {
        AnyArray {
            name: name.into(),
            items,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn items(&self) -> &[Any] {
        &self.items
    }
    pub fn set_items(&mut self, items: Vec<Any>) {
        self.items = items;
    }
}

impl PartialEq for AnyArray {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

macro_rules! from_native {
    ($t:ty, $variant:ident) => {
        impl From<$t> for PvaData {
            fn from(value: $t) -> Self {
                PvaData::scalar("", ScalarValue::$variant(value))
            }
        }
        impl From<Vec<$t>> for PvaData {
            fn from(value: Vec<$t>) -> Self {
                PvaData::array("", ArrayValue::$variant(value))
            }
        }
    };
}

from_native!(bool, Bool);
from_native!(i8, Byte);
from_native!(i16, Short);
from_native!(i32, Int);
from_native!(i64, Long);
from_native!(u8, UByte);
from_native!(u16, UShort);
from_native!(u32, UInt);
from_native!(u64, ULong);
from_native!(f32, Float);
from_native!(f64, Double);
from_native!(String, String);

impl From<&str> for PvaData {
    fn from(value: &str) -> Self {
        PvaData::string("", value)
    }
}

impl From<&PvaData> for PvaData {
    fn from(value: &PvaData) -> Self {
        value.clone()
    }
}

impl From<Structure> for PvaData {
    fn from(value: Structure) -> Self {
        PvaData::Structure(value)
    }
}

impl From<StructureArray> for PvaData {
    fn from(value: StructureArray) -> Self {
        PvaData::StructureArray(value)
    }
}

impl From<Any> for PvaData {
    fn from(value: Any) -> Self {
        PvaData::Any(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteOrder;

    #[test]
    fn test_any_equality() {
        let a = PvaData::from(Any::new("x", Some(PvaData::int("n", 42))));
        let b = PvaData::from(Any::new("y", Some(PvaData::int("n", 42))));
        let c = PvaData::from(Any::new("x", Some(PvaData::int("n", 43))));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, PvaData::int("n", 42));
        assert_eq!(Any::new("a", None), Any::new("b", None));
    }

    #[test]
    fn test_any_set_and_clear() {
        let mut any = Any::new("any", None);
        assert!(any.get().is_none());
        any.set(Some(PvaData::string("s", "text")));
        assert_eq!(any.get().and_then(|v| v.as_str()), Some("text"));
        any.set(None);
        assert!(any.get().is_none());

        let mut field = PvaData::from(Any::new("slot", None));
        field.set_value(3.5).unwrap();
        assert_eq!(field.as_any().and_then(|a| a.get()).and_then(|v| v.as_f64()), Some(3.5));
    }

    #[test]
    fn test_set_value_coercion() {
        let mut value = PvaData::double("value", 0.0);
        value.set_value(42.0f32).unwrap();
        assert_eq!(value.as_f64(), Some(42.0));
        value.set_value(vec![7i32]).unwrap();
        assert_eq!(value.as_f64(), Some(7.0));
        assert!(value.set_value(vec![1, 2]).is_err());

        let mut flag = PvaData::bool("flag", false);
        flag.set_value(1).unwrap();
        assert_eq!(flag.as_scalar(), Some(&ScalarValue::Bool(true)));

        let mut text = PvaData::string("text", "");
        text.set_value(3.25).unwrap();
        assert_eq!(text.as_str(), Some("3.25"));

        let mut bytes = PvaData::array("bytes", ArrayValue::UByte(vec![]));
        bytes.set_value(vec![1.9f64, 2.1, 513.0]).unwrap();
        assert_eq!(bytes.as_array(), Some(&ArrayValue::UByte(vec![1, 2, 255])));
    }

    #[test]
    fn test_any_wire_format() {
        let mut types = TypeRegistry::new();
        let value = PvaData::from(Any::new("any", Some(PvaData::int("", 5))));
        let mut buffer = Vec::new();
        value.encode(&mut buffer, &mut types);
        assert_eq!(buffer, [codes::INT, 5, 0, 0, 0]);

        let mut decoded = value.clone_type("any");
        decoded
            .decode(&mut TypeRegistry::new(), &mut Reader::new(&buffer, ByteOrder::Little))
            .unwrap();
        assert_eq!(decoded, value);

        let empty = PvaData::from(Any::new("any", None));
        buffer.clear();
        empty.encode(&mut buffer, &mut types);
        assert_eq!(buffer, [codes::NULL]);
    }

    #[test]
    fn test_format() {
        let value = PvaData::double("value", 3.5);
        assert_eq!(value.to_string(), "double value 3.5");
        assert_eq!(value.format_type(), "double value");
        let array = PvaData::array("data", ArrayValue::UShort(vec![1, 2]));
        assert_eq!(array.to_string(), "ushort[] data [1, 2]");
    }
}
