use std::collections::HashMap;

use tracing::trace;

use crate::codec::{BitSet, DecodeError, Reader};

use super::{Any, AnyArray, ArrayValue, PvaData, ScalarValue, Structure, StructureArray, codes};

/// How a structure type should be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeReference {
    /// Write the full description, with no ID
    Untracked,
    /// First use on this connection: full description, tagged with the ID
    New(u16),
    /// Already described to the peer, write only the ID
    Described(u16),
}

/// Structure type IDs for one connection
///
/// Outgoing structure shapes are assigned IDs the first time they are
/// described, and afterwards referred to by ID only. Incoming descriptions
/// are remembered by the ID the peer gave them, so later references can be
/// turned back into an empty value of the right type. The peer's numbering
/// starts again with each connection, so a registry must never outlive one.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    received: HashMap<u16, PvaData>,
    assigned: HashMap<Vec<u8>, u16>,
    described: BitSet,
    next_id: u16,
    untracked: bool,
}

impl TypeRegistry {
    pub fn new() -> TypeRegistry {
        TypeRegistry {
            next_id: 1,
            ..Default::default()
        }
    }

    /// A registry that always writes full type descriptions
    ///
    /// Used for connectionless messages, where no ID can be relied on.
    pub fn untracked() -> TypeRegistry {
        TypeRegistry {
            untracked: true,
            ..TypeRegistry::new()
        }
    }

    /// Forget every ID, as for a new connection
    pub fn reset(&mut self) {
        self.received.clear();
        self.assigned.clear();
        self.described = BitSet::new();
        self.next_id = 1;
    }

    /// Number of received type descriptions
    pub fn len(&self) -> usize {
        self.received.len()
    }
    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    pub(crate) fn reference_for(&mut self, structure: &Structure) -> TypeReference {
        if self.untracked {
            return TypeReference::Untracked;
        }
        // Shapes are keyed by their full description
        let mut shape = Vec::new();
        structure.encode_description(&mut shape, &mut TypeRegistry::untracked());

        if let Some(&id) = self.assigned.get(&shape) {
            if self.described.get(id as usize) {
                return TypeReference::Described(id);
            }
            self.described.set(id as usize);
            return TypeReference::New(id);
        }
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        if let Some(old) = self.assigned.iter().find(|(_, v)| **v == id).map(|(k, _)| k.clone()) {
            // Wrapped around: the old shape must be described again
            self.assigned.remove(&old);
        }
        self.assigned.insert(shape, id);
        self.described.set(id as usize);
        TypeReference::New(id)
    }

    /// Read a type description, returning an empty value of that type
    ///
    /// `None` is the null type, as sent for an empty variant.
    pub fn decode_type(&mut self, name: &str, reader: &mut Reader) -> Result<Option<PvaData>, DecodeError> {
        reader.nested(|reader| self.decode_type_at(name, reader))
    }

    fn decode_type_at(&mut self, name: &str, reader: &mut Reader) -> Result<Option<PvaData>, DecodeError> {
        match reader.get_u8()? {
            codes::NULL => Ok(None),
            codes::ONLY_ID => {
                let id = reader.get_u16()?;
                let template = self.received.get(&id).ok_or(DecodeError::UnknownTypeId(id))?;
                let mut value = template.clone_type(name);
                if let PvaData::Structure(s) = &mut value {
                    s.set_type_id(Some(id));
                }
                Ok(Some(value))
            }
            codes::FULL_WITH_ID => {
                let id = reader.get_u16()?;
                let code = reader.get_u8()?;
                let mut value = self.decode_description(name, code, reader)?;
                if let Some(previous) = self.received.get(&id)
                    && previous.format_type() != value.clone_type(previous.name()).format_type()
                {
                    return Err(DecodeError::DuplicateTypeId(id));
                }
                trace!("Registered type {id}: {}", value.type_name());
                if let PvaData::Structure(s) = &mut value {
                    s.set_type_id(Some(id));
                }
                self.received.insert(id, value.clone_type(""));
                Ok(Some(value))
            }
            codes::FULL_TAGGED_ID => {
                let _tag = reader.get_u32()?;
                self.decode_type(name, reader)
            }
            code => self.decode_description(name, code, reader).map(Some),
        }
    }

    fn decode_description(&mut self, name: &str, code: u8, reader: &mut Reader) -> Result<PvaData, DecodeError> {
        match code {
            codes::STRUCTURE => {
                let type_name = reader.get_string()?;
                let count = reader.get_count()?;
                reader.ensure(count, 2)?;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let field_name = reader.get_string()?;
                    let field = self
                        .decode_type(&field_name, reader)?
                        .ok_or(DecodeError::UnexpectedNull)?;
                    fields.push(field);
                }
                let structure = Structure::new(name, type_name, fields)
                    .map_err(|e| DecodeError::InvalidField(e.to_string()))?;
                Ok(PvaData::Structure(structure))
            }
            codes::STRUCTURE_ARRAY => match self.decode_type("", reader)? {
                Some(PvaData::Structure(element)) => {
                    Ok(PvaData::StructureArray(StructureArray::new(name, element)))
                }
                _ => Err(DecodeError::InvalidField(format!(
                    "Element type of structure array '{name}' is not a structure"
                ))),
            },
            codes::ANY => Ok(PvaData::Any(Any::new(name, None))),
            codes::ANY_ARRAY => Ok(PvaData::AnyArray(AnyArray::new(name, Vec::new()))),
            codes::UNION | codes::UNION_ARRAY => Err(DecodeError::InvalidTypeCode(code)),
            code if code & 0x80 == 0 && code & codes::ARRAY_MASK != 0 => {
                match code & codes::ARRAY_MASK {
                    // Fixed arrays drop the size prefix from their values
                    codes::FIXED_ARRAY => return Err(DecodeError::InvalidTypeCode(code)),
                    codes::BOUNDED_ARRAY => {
                        let _bound = reader.get_count()?;
                    }
                    _ => (),
                }
                ArrayValue::from_element_code(code & !codes::ARRAY_MASK)
                    .map(|value| PvaData::array(name, value))
                    .ok_or(DecodeError::InvalidTypeCode(code))
            }
            code => ScalarValue::from_code(code)
                .map(|value| PvaData::scalar(name, value))
                .ok_or(DecodeError::InvalidTypeCode(code)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, encode_string};

    fn sample() -> Structure {
        let inner = Structure::new(
            "alarm",
            "alarm_t",
            vec![PvaData::int("severity", 0), PvaData::string("message", "")],
        )
        .unwrap();
        Structure::new(
            "sample",
            "sample_t",
            vec![
                PvaData::double("value", 1.0),
                PvaData::array("data", ArrayValue::Float(vec![])),
                inner.into(),
                PvaData::Any(Any::new("extra", None)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_type_round_trip() {
        let data = PvaData::Structure(sample());
        let mut sender = TypeRegistry::new();
        let mut buffer = Vec::new();
        data.encode_type(&mut buffer, &mut sender);

        let mut receiver = TypeRegistry::new();
        let mut reader = Reader::new(&buffer, ByteOrder::Little);
        let decoded = receiver.decode_type("sample", &mut reader).unwrap().unwrap();
        assert!(reader.is_empty());
        assert_eq!(decoded.format_type(), data.format_type());
        // The outer and inner structures were both registered
        assert_eq!(receiver.len(), 2);
    }

    #[test]
    fn test_second_encoding_uses_id() {
        let data = PvaData::Structure(sample());
        let mut sender = TypeRegistry::new();
        let mut first = Vec::new();
        data.encode_type(&mut first, &mut sender);
        assert_eq!(first[0], codes::FULL_WITH_ID);

        let mut second = Vec::new();
        data.encode_type(&mut second, &mut sender);
        assert_eq!(second[0], codes::ONLY_ID);
        assert_eq!(second.len(), 3);

        let mut receiver = TypeRegistry::new();
        receiver
            .decode_type("first", &mut Reader::new(&first, ByteOrder::Little))
            .unwrap();
        let renamed = receiver
            .decode_type("renamed", &mut Reader::new(&second, ByteOrder::Little))
            .unwrap()
            .unwrap();
        assert_eq!(renamed.name(), "renamed");
        assert_eq!(renamed.format_type(), data.clone_type("renamed").format_type());
    }

    #[test]
    fn test_untracked_always_describes() {
        let data = PvaData::Structure(sample());
        let mut types = TypeRegistry::untracked();
        let mut first = Vec::new();
        data.encode_type(&mut first, &mut types);
        let mut second = Vec::new();
        data.encode_type(&mut second, &mut types);
        assert_eq!(first[0], codes::STRUCTURE);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_id() {
        let mut types = TypeRegistry::new();
        let data = [codes::ONLY_ID, 0x07, 0x00];
        assert_eq!(
            types.decode_type("x", &mut Reader::new(&data, ByteOrder::Little)),
            Err(DecodeError::UnknownTypeId(7))
        );
    }

    fn describe_with_id(id: u16, field_code: u8) -> Vec<u8> {
        let mut buffer = vec![codes::FULL_WITH_ID];
        buffer.extend(id.to_le_bytes());
        buffer.push(codes::STRUCTURE);
        encode_string("", &mut buffer);
        buffer.push(1);
        encode_string("value", &mut buffer);
        buffer.push(field_code);
        buffer
    }

    #[test]
    fn test_redefined_id() {
        let mut types = TypeRegistry::new();
        let first = describe_with_id(3, codes::DOUBLE);
        types
            .decode_type("a", &mut Reader::new(&first, ByteOrder::Little))
            .unwrap();
        // Same shape again is harmless
        types
            .decode_type("b", &mut Reader::new(&first, ByteOrder::Little))
            .unwrap();
        let other = describe_with_id(3, codes::INT);
        assert_eq!(
            types.decode_type("c", &mut Reader::new(&other, ByteOrder::Little)),
            Err(DecodeError::DuplicateTypeId(3))
        );
        types.reset();
        assert!(types.is_empty());
        assert!(
            types
                .decode_type("c", &mut Reader::new(&other, ByteOrder::Little))
                .is_ok()
        );
    }

    #[test]
    fn test_bad_descriptions() {
        let mut types = TypeRegistry::new();
        assert_eq!(
            types.decode_type("u", &mut Reader::new(&[codes::UNION], ByteOrder::Little)),
            Err(DecodeError::InvalidTypeCode(codes::UNION))
        );
        assert_eq!(
            types.decode_type("s", &mut Reader::new(&[codes::STRUCTURE, 0], ByteOrder::Little)),
            Err(DecodeError::Truncated)
        );
        // Unnamed field
        let mut buffer = vec![codes::STRUCTURE, 0, 1, 0, codes::INT];
        assert!(matches!(
            types.decode_type("s", &mut Reader::new(&buffer, ByteOrder::Little)),
            Err(DecodeError::InvalidField(_))
        ));
        buffer.clear();
        buffer.extend([codes::DOUBLE | codes::BOUNDED_ARRAY, 4]);
        let bounded = types
            .decode_type("b", &mut Reader::new(&buffer, ByteOrder::Little))
            .unwrap()
            .unwrap();
        assert_eq!(bounded.format_type(), "double[] b");
        let fixed = [codes::DOUBLE | codes::FIXED_ARRAY, 4];
        assert_eq!(
            types.decode_type("f", &mut Reader::new(&fixed, ByteOrder::Little)),
            Err(DecodeError::InvalidTypeCode(codes::DOUBLE | codes::FIXED_ARRAY))
        );
    }

    /// `structure a` nested `levels` deep, around a double
    fn nested_description(levels: usize) -> Vec<u8> {
        let mut buffer = Vec::new();
        for _ in 0..levels {
            buffer.push(codes::STRUCTURE);
            encode_string("", &mut buffer);
            buffer.push(1);
            encode_string("a", &mut buffer);
        }
        buffer.push(codes::DOUBLE);
        buffer
    }

    #[test]
    fn test_nesting_limit() {
        let mut types = TypeRegistry::new();
        let shallow = nested_description(10);
        assert!(
            types
                .decode_type("s", &mut Reader::new(&shallow, ByteOrder::Little))
                .is_ok()
        );
        let deep = nested_description(200_000);
        assert_eq!(
            types.decode_type("s", &mut Reader::new(&deep, ByteOrder::Little)),
            Err(DecodeError::TooDeep)
        );
        // Variants holding variants recurse through their values
        let mut anys = vec![codes::ANY; 200_000];
        anys.push(codes::NULL);
        let mut value = PvaData::Any(Any::new("v", None));
        assert_eq!(
            value.decode(&mut types, &mut Reader::new(&anys, ByteOrder::Little)),
            Err(DecodeError::TooDeep)
        );
    }
}
