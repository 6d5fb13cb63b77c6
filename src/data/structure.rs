use std::fmt::{self, Display};

use bytes::BufMut;

use crate::codec::{BitSet, DecodeError, Reader, encode_size, encode_string};

use super::{DataError, PvaData, TypeRegistry, codes, registry::TypeReference};

/// Result of looking up a structure by pre-order index
#[derive(Debug, Clone, Copy)]
pub enum Element<'a> {
    /// Index 0, the structure itself
    Whole(&'a Structure),
    Field(&'a PvaData),
}

impl Element<'_> {
    pub fn name(&self) -> &str {
        match self {
            Element::Whole(s) => s.name(),
            Element::Field(f) => f.name(),
        }
    }
}

/// Ordered, named fields with an optional type name
#[derive(Debug, Clone, Default)]
pub struct Structure {
    pub(super) name: String,
    pub(super) type_name: String,
    pub(super) fields: Vec<PvaData>,
    pub(super) type_id: Option<u16>,
}

impl Structure {
    /// Create a structure. Every field must have a name.
    pub fn new(
        name: impl Into<String>,
        type_name: impl Into<String>,
        fields: Vec<PvaData>,
    ) -> Result<Structure, DataError> {
        if fields.iter().any(|f| f.name().is_empty()) {
            return Err(DataError::UnnamedElement);
        }
        Ok(Structure {
            name: name.into(),
            type_name: type_name.into(),
            fields,
            type_id: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
    pub fn type_name(&self) -> &str {
        &self.type_name
    }
    pub(crate) fn display_type_name(&self) -> &str {
        if self.type_name.is_empty() {
            "structure"
        } else {
            &self.type_name
        }
    }
    /// Type ID this structure was described with, when decoded
    pub fn type_id(&self) -> Option<u16> {
        self.type_id
    }
    pub(crate) fn set_type_id(&mut self, type_id: Option<u16>) {
        self.type_id = type_id;
    }
    pub fn fields(&self) -> &[PvaData] {
        &self.fields
    }
    pub fn len(&self) -> usize {
        self.fields.len()
    }
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Direct field by name. Dotted names are not followed, see [`Structure::locate`].
    pub fn get(&self, name: &str) -> Option<&PvaData> {
        self.fields.iter().find(|f| f.name() == name)
    }
    pub fn get_mut(&mut self, name: &str) -> Option<&mut PvaData> {
        self.fields.iter_mut().find(|f| f.name() == name)
    }

    /// Find a field by dot-separated path, e.g. `"timeStamp.nanoseconds"`
    pub fn locate(&self, path: &str) -> Result<&PvaData, DataError> {
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if segment.is_empty() {
                return Err(DataError::EmptyPathElement(path.to_string()));
            }
            let field = current.get(segment).ok_or_else(|| DataError::CannotLocate {
                element: segment.to_string(),
                path: path.to_string(),
            })?;
            if segments.peek().is_none() {
                return Ok(field);
            }
            current = field.as_structure().ok_or_else(|| DataError::NotAStructure {
                element: segment.to_string(),
                path: path.to_string(),
            })?;
        }
        Err(DataError::EmptyPathElement(path.to_string()))
    }

    pub fn locate_mut(&mut self, path: &str) -> Result<&mut PvaData, DataError> {
        let (first, rest) = match path.split_once('.') {
            Some((first, rest)) => (first, Some(rest)),
            None => (path, None),
        };
        if first.is_empty() || rest.is_some_and(|r| r.is_empty()) {
            return Err(DataError::EmptyPathElement(path.to_string()));
        }
        let field = self
            .get_mut(first)
            .ok_or_else(|| DataError::CannotLocate {
                element: first.to_string(),
                path: path.to_string(),
            })?;
        let Some(rest) = rest else {
            return Ok(field);
        };
        match field {
            PvaData::Structure(s) => s.locate_mut(rest).map_err(|e| match e {
                DataError::CannotLocate { element, .. } => DataError::CannotLocate {
                    element,
                    path: path.to_string(),
                },
                DataError::NotAStructure { element, .. } => DataError::NotAStructure {
                    element,
                    path: path.to_string(),
                },
                DataError::EmptyPathElement(_) => DataError::EmptyPathElement(path.to_string()),
                e => e,
            }),
            _ => Err(DataError::NotAStructure {
                element: first.to_string(),
                path: path.to_string(),
            }),
        }
    }

    /// Number of fields, at any depth, inside this structure
    pub fn descendant_count(&self) -> usize {
        self.fields.iter().map(|f| 1 + f.descendant_count()).sum()
    }

    /// Look up by pre-order index; 0 is this structure
    pub fn get_index(&self, index: usize) -> Option<Element<'_>> {
        if index == 0 {
            Some(Element::Whole(self))
        } else {
            self.field_at(index).map(Element::Field)
        }
    }

    /// Field at a pre-order index. Index 0, the structure itself, is not a field.
    pub fn get_index_mut(&mut self, index: usize) -> Option<&mut PvaData> {
        let mut i = 1;
        for field in self.fields.iter_mut() {
            if i == index {
                return Some(field);
            }
            let count = field.descendant_count();
            if index <= i + count {
                return match field {
                    PvaData::Structure(s) => s.get_index_mut(index - i),
                    _ => None,
                };
            }
            i += 1 + count;
        }
        None
    }

    fn field_at(&self, index: usize) -> Option<&PvaData> {
        let mut i = 1;
        for field in &self.fields {
            if i == index {
                return Some(field);
            }
            let count = field.descendant_count();
            if index <= i + count {
                return match field {
                    PvaData::Structure(s) => s.field_at(index - i),
                    _ => None,
                };
            }
            i += 1 + count;
        }
        None
    }

    /// Pre-order index of a field reference held inside this structure
    pub fn index_of(&self, field: &PvaData) -> Result<usize, DataError> {
        self.find_pointer(field, 0)
            .ok_or_else(|| DataError::CannotLocate {
                element: field.name().to_string(),
                path: self.name.clone(),
            })
    }

    fn find_pointer(&self, target: &PvaData, base: usize) -> Option<usize> {
        let mut i = base + 1;
        for field in &self.fields {
            if std::ptr::eq(field, target) {
                return Some(i);
            }
            if let PvaData::Structure(s) = field
                && let Some(found) = s.find_pointer(target, i)
            {
                return Some(found);
            }
            i += 1 + field.descendant_count();
        }
        None
    }

    /// Pre-order index of the field at a dot-separated path
    pub fn index_of_path(&self, path: &str) -> Result<usize, DataError> {
        let mut index = 0;
        let mut current = self;
        let mut segments = path.split('.').peekable();
        while let Some(segment) = segments.next() {
            if segment.is_empty() {
                return Err(DataError::EmptyPathElement(path.to_string()));
            }
            let mut offset = 1;
            let mut found = None;
            for field in &current.fields {
                if field.name() == segment {
                    found = Some(field);
                    break;
                }
                offset += 1 + field.descendant_count();
            }
            let field = found.ok_or_else(|| DataError::CannotLocate {
                element: segment.to_string(),
                path: path.to_string(),
            })?;
            index += offset;
            if segments.peek().is_none() {
                return Ok(index);
            }
            current = field.as_structure().ok_or_else(|| DataError::NotAStructure {
                element: segment.to_string(),
                path: path.to_string(),
            })?;
        }
        Err(DataError::EmptyPathElement(path.to_string()))
    }

    /// Dot-separated path of the field at a pre-order index
    pub fn path_of_index(&self, index: usize) -> Option<String> {
        let mut i = 1;
        for field in &self.fields {
            if i == index {
                return Some(field.name().to_string());
            }
            let count = field.descendant_count();
            if index <= i + count {
                let PvaData::Structure(s) = field else {
                    return None;
                };
                return s
                    .path_of_index(index - i)
                    .map(|rest| format!("{}.{rest}", field.name()));
            }
            i += 1 + count;
        }
        None
    }

    /// Update this structure to match `new_value`, returning what changed
    ///
    /// Each changed leaf field sets its own pre-order index. Fields that
    /// already hold an equal value are left alone, so comparing against the
    /// same baseline repeatedly only reports the latest differences.
    pub fn update(&mut self, new_value: &Structure) -> Result<BitSet, DataError> {
        let mut changes = BitSet::new();
        self.update_fields(0, new_value, &mut changes)?;
        Ok(changes)
    }

    pub(crate) fn update_fields(
        &mut self,
        index: usize,
        new_value: &Structure,
        changes: &mut BitSet,
    ) -> Result<usize, DataError> {
        if self.fields.len() != new_value.fields.len() {
            return Err(DataError::Incompatible(format!(
                "'{}' has {} fields, update has {}",
                self.name,
                self.fields.len(),
                new_value.fields.len()
            )));
        }
        let mut next = index + 1;
        for (mine, theirs) in self.fields.iter_mut().zip(&new_value.fields) {
            next = mine.update(next, theirs, changes)?;
        }
        Ok(next)
    }

    /// Set every field from another structure of the same layout
    pub fn assign(&mut self, other: &Structure) -> Result<(), DataError> {
        if self.fields.len() != other.fields.len() {
            return Err(DataError::Incompatible(format!(
                "Cannot set '{}' from structure with {} fields",
                self.name,
                other.fields.len()
            )));
        }
        for (mine, theirs) in self.fields.iter_mut().zip(&other.fields) {
            mine.assign(theirs)?;
        }
        Ok(())
    }

    /// Empty copy of the type with a new name
    pub fn clone_type(&self, name: impl Into<String>) -> Structure {
        Structure {
            name: name.into(),
            type_name: self.type_name.clone(),
            fields: self
                .fields
                .iter()
                .map(|f| f.clone_type(f.name()))
                .collect(),
            type_id: self.type_id,
        }
    }

    /// Copy containing only the fields at the given paths
    ///
    /// Structures leading to a selected field are kept, holding only the
    /// selected part. An empty selection copies everything.
    pub fn select<S: AsRef<str>>(&self, paths: &[S]) -> Result<Structure, DataError> {
        if paths.is_empty() {
            return Ok(self.clone());
        }
        for path in paths {
            self.locate(path.as_ref())?;
        }
        let paths: Vec<&str> = paths.iter().map(|p| p.as_ref()).collect();
        Ok(self.select_unchecked(&paths))
    }

    fn select_unchecked(&self, paths: &[&str]) -> Structure {
        let fields = self
            .fields
            .iter()
            .filter_map(|field| {
                let name = field.name();
                if paths.contains(&name) {
                    return Some(field.clone());
                }
                let nested: Vec<&str> = paths
                    .iter()
                    .filter_map(|p| p.strip_prefix(name).and_then(|r| r.strip_prefix('.')))
                    .collect();
                match field {
                    PvaData::Structure(s) if !nested.is_empty() => {
                        Some(PvaData::Structure(s.select_unchecked(&nested)))
                    }
                    _ => None,
                }
            })
            .collect();
        Structure {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            fields,
            type_id: None,
        }
    }

    pub fn encode_type<B: BufMut>(&self, buffer: &mut B, types: &mut TypeRegistry) {
        match types.reference_for(self) {
            TypeReference::Described(id) => {
                buffer.put_u8(codes::ONLY_ID);
                buffer.put_u16_le(id);
                return;
            }
            TypeReference::New(id) => {
                buffer.put_u8(codes::FULL_WITH_ID);
                buffer.put_u16_le(id);
            }
            TypeReference::Untracked => (),
        }
        self.encode_description(buffer, types);
    }

    /// Full description, without any type ID prefix
    pub(crate) fn encode_description<B: BufMut>(&self, buffer: &mut B, types: &mut TypeRegistry) {
        buffer.put_u8(codes::STRUCTURE);
        encode_string(&self.type_name, buffer);
        encode_size(Some(self.fields.len()), buffer);
        for field in &self.fields {
            encode_string(field.name(), buffer);
            field.encode_type(buffer, types);
        }
    }

    pub fn encode<B: BufMut>(&self, buffer: &mut B, types: &mut TypeRegistry) {
        for field in &self.fields {
            field.encode(buffer, types);
        }
    }

    pub fn decode(&mut self, types: &mut TypeRegistry, reader: &mut Reader) -> Result<(), DecodeError> {
        for field in self.fields.iter_mut() {
            field.decode(types, reader)?;
        }
        Ok(())
    }

    /// Encode only the fields whose bits are set
    ///
    /// A set structure bit covers all of its descendants, and bit 0 encodes
    /// everything.
    pub fn encode_elements<B: BufMut>(
        &self,
        changes: &BitSet,
        buffer: &mut B,
        types: &mut TypeRegistry,
    ) -> Result<(), DataError> {
        let mut from = 0;
        while let Some(index) = changes.next_set_bit(from) {
            if index == 0 {
                self.encode(buffer, types);
                return Ok(());
            }
            let field = self.field_at(index).ok_or(DataError::InvalidIndex(index))?;
            field.encode(buffer, types);
            from = index + 1 + field.descendant_count();
        }
        Ok(())
    }

    /// Decode the fields whose bits are set, leaving the others untouched
    pub fn decode_elements(
        &mut self,
        changes: &BitSet,
        types: &mut TypeRegistry,
        reader: &mut Reader,
    ) -> Result<(), DecodeError> {
        let mut from = 0;
        while let Some(index) = changes.next_set_bit(from) {
            if index == 0 {
                return self.decode(types, reader);
            }
            let field = self
                .get_index_mut(index)
                .ok_or_else(|| DecodeError::InvalidField(format!("No element with index {index}")))?;
            field.decode(types, reader)?;
            from = index + 1 + field.descendant_count();
        }
        Ok(())
    }

    pub fn format_type(&self) -> String {
        let mut out = format!("{} {}", self.display_type_name(), self.name);
        self.format_fields(&mut out, 1, false);
        out
    }

    pub(crate) fn format_fields(&self, out: &mut String, level: usize, with_values: bool) {
        for field in &self.fields {
            out.push('\n');
            field.format_into(out, level, with_values);
        }
    }
}

/// Structures compare by their field values; names of the structures
/// themselves are not compared.
impl PartialEq for Structure {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.name() == b.name() && a == b)
    }
}

impl Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = format!("{} {}", self.display_type_name(), self.name);
        self.format_fields(&mut out, 1, true);
        f.write_str(&out)
    }
}

/// Array of structures sharing one element type
#[derive(Debug, Clone)]
pub struct StructureArray {
    pub(crate) name: String,
    element: Structure,
    items: Vec<Structure>,
}

impl StructureArray {
    pub fn new(name: impl Into<String>, element: Structure) -> StructureArray {
        StructureArray {
            name: name.into(),
            element: element.clone_type(""),
            items: Vec::new(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    /// Type template of the elements
    pub fn element(&self) -> &Structure {
        &self.element
    }
    pub fn items(&self) -> &[Structure] {
        &self.items
    }

    /// Replace the items, each converted into the element type
    pub fn set_items(&mut self, items: &[Structure]) -> Result<(), DataError> {
        self.items = items
            .iter()
            .map(|item| {
                let mut element = self.element.clone_type("");
                element.assign(item)?;
                Ok(element)
            })
            .collect::<Result<_, DataError>>()?;
        Ok(())
    }

    pub(crate) fn assign(&mut self, other: &StructureArray) -> Result<(), DataError> {
        self.set_items(&other.items)
    }

    pub(crate) fn encode<B: BufMut>(&self, buffer: &mut B, types: &mut TypeRegistry) {
        encode_size(Some(self.items.len()), buffer);
        for item in &self.items {
            buffer.put_u8(1);
            item.encode(buffer, types);
        }
    }

    pub(crate) fn decode(
        &mut self,
        types: &mut TypeRegistry,
        reader: &mut Reader,
    ) -> Result<(), DecodeError> {
        let count = reader.get_size()?.unwrap_or(0);
        reader.ensure(count, 1)?;
        self.items.clear();
        for _ in 0..count {
            let mut item = self.element.clone_type("");
            // Null elements are kept as empty elements
            if reader.get_bool()? {
                item.decode(types, reader)?;
            }
            self.items.push(item);
        }
        Ok(())
    }
}

impl PartialEq for StructureArray {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::ByteOrder, data::ArrayValue};

    fn time_stamp() -> Structure {
        Structure::new(
            "timeStamp",
            "time_t",
            vec![
                PvaData::long("secondsPastEpoch", 0),
                PvaData::int("nanoseconds", 42),
                PvaData::int("userTag", 0),
            ],
        )
        .unwrap()
    }

    fn alarm() -> Structure {
        Structure::new(
            "alarm",
            "alarm_t",
            vec![
                PvaData::int("severity", 0),
                PvaData::int("status", 0),
                PvaData::string("message", "NONE"),
            ],
        )
        .unwrap()
    }

    fn demo() -> Structure {
        Structure::new(
            "demo",
            "NTBogus",
            vec![
                PvaData::double("value", 3.13),
                time_stamp().into(),
                alarm().into(),
                PvaData::string("extra", "tag"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_unnamed_element() {
        let result = Structure::new("bad", "", vec![PvaData::int("", 1)]);
        assert_eq!(result.unwrap_err(), DataError::UnnamedElement);
    }

    #[test]
    fn test_indices() {
        let data = demo();
        assert_eq!(data.descendant_count(), 10);
        assert!(matches!(data.get_index(0), Some(Element::Whole(_))));
        let names: Vec<String> = (0..=10)
            .map(|i| data.get_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(
            names,
            [
                "demo",
                "value",
                "timeStamp",
                "secondsPastEpoch",
                "nanoseconds",
                "userTag",
                "alarm",
                "severity",
                "status",
                "message",
                "extra"
            ]
        );
        assert!(data.get_index(11).is_none());

        let nano = data.locate("timeStamp.nanoseconds").unwrap();
        assert_eq!(data.index_of(nano).unwrap(), 4);
        assert_eq!(data.index_of_path("alarm.message").unwrap(), 9);
        assert_eq!(data.path_of_index(8).as_deref(), Some("alarm.status"));
        assert!(data.index_of(&PvaData::int("nanoseconds", 42)).is_err());
    }

    #[test]
    fn test_locate() {
        let data = demo();
        assert!(data.get("timeStamp.nanoseconds").is_none());
        assert_eq!(
            data.locate("timeStamp.nanoseconds").unwrap().as_i64(),
            Some(42)
        );
        assert_eq!(
            data.locate("timeStamp.bogus").unwrap_err().to_string(),
            "Cannot locate 'bogus' for 'timeStamp.bogus'"
        );
        assert_eq!(
            data.locate("value.sub").unwrap_err().to_string(),
            "Element 'value' of 'value.sub' is not a structure"
        );
        assert!(matches!(
            data.locate("alarm..status"),
            Err(DataError::EmptyPathElement(_))
        ));

        let mut data = data;
        assert!(matches!(
            data.locate_mut("alarm.nothing"),
            Err(DataError::CannotLocate { element, path }) if element == "nothing" && path == "alarm.nothing"
        ));
        data.locate_mut("alarm.severity").unwrap().set_value(2).unwrap();
        assert_eq!(data.locate("alarm.severity").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn test_update() {
        let mut data = demo();
        let mut newer = data.clone();
        assert!(data.update(&newer).unwrap().is_empty());

        newer.get_mut("value").unwrap().set_value(4.13).unwrap();
        assert_eq!(data.update(&newer).unwrap(), BitSet::from_iter([1]));
        assert_eq!(data.get("value").unwrap().as_f64(), Some(4.13));
        // Same baseline again: nothing left over from the previous diff
        assert!(data.update(&newer).unwrap().is_empty());

        newer.get_mut("value").unwrap().set_value(5.0).unwrap();
        newer.locate_mut("timeStamp.secondsPastEpoch").unwrap().set_value(1).unwrap();
        newer.locate_mut("timeStamp.nanoseconds").unwrap().set_value(2).unwrap();
        newer.locate_mut("timeStamp.userTag").unwrap().set_value(3).unwrap();
        newer.get_mut("extra").unwrap().set_value("other").unwrap();
        let changes = data.update(&newer).unwrap();
        assert_eq!(changes, BitSet::from_iter([1, 3, 4, 5, 10]));
        assert_eq!(data, newer);
    }

    #[test]
    fn test_update_arrays() {
        let make = |values: Vec<f64>| {
            Structure::new(
                "arr",
                "",
                vec![
                    PvaData::array("value", ArrayValue::Double(values)),
                    PvaData::bool("flag", false),
                ],
            )
            .unwrap()
        };
        let mut data = make(vec![1.0, 2.0, 3.0]);
        assert!(data.update(&make(vec![1.0, 2.0, 3.0])).unwrap().is_empty());
        assert_eq!(
            data.update(&make(vec![1.0, 2.5, 3.0])).unwrap(),
            BitSet::from_iter([1])
        );
    }

    #[test]
    fn test_update_nan() {
        let make = |value: f64| {
            Structure::new(
                "nan",
                "",
                vec![
                    PvaData::double("value", value),
                    PvaData::array("waveform", ArrayValue::Float(vec![1.0, f32::NAN])),
                ],
            )
            .unwrap()
        };
        let mut data = make(f64::NAN);
        assert!(data.update(&make(f64::NAN)).unwrap().is_empty());
        assert_eq!(data.update(&make(1.0)).unwrap(), BitSet::from_iter([1]));
        assert_eq!(data.update(&make(f64::NAN)).unwrap(), BitSet::from_iter([1]));
    }

    #[test]
    fn test_update_incompatible() {
        let mut data = demo();
        let other = Structure::new("x", "", vec![PvaData::double("value", 1.0)]).unwrap();
        assert!(matches!(data.update(&other), Err(DataError::Incompatible(_))));
    }

    #[test]
    fn test_type_round_trip() {
        let data = demo();
        let mut sender = TypeRegistry::new();
        let mut buffer = Vec::new();
        PvaData::Structure(data.clone()).encode_type(&mut buffer, &mut sender);

        let mut receiver = TypeRegistry::new();
        let mut reader = Reader::new(&buffer, ByteOrder::Little);
        let decoded = receiver.decode_type("demo", &mut reader).unwrap().unwrap();
        assert!(reader.is_empty());
        assert_eq!(decoded.format_type(), data.format_type());
        assert_eq!(
            data.format_type(),
            "NTBogus demo\n    double value\n    time_t timeStamp\n        long secondsPastEpoch\n        int nanoseconds\n        int userTag\n    alarm_t alarm\n        int severity\n        int status\n        string message\n    string extra"
        );
    }

    #[test]
    fn test_value_round_trip_by_elements() {
        let mut types = TypeRegistry::new();
        let mut data = demo();
        let mut receiver = data.clone_type("demo");

        let mut buffer = Vec::new();
        data.encode_elements(&BitSet::from_iter([0]), &mut buffer, &mut types)
            .unwrap();
        receiver
            .decode_elements(
                &BitSet::from_iter([0]),
                &mut types,
                &mut Reader::new(&buffer, ByteOrder::Little),
            )
            .unwrap();
        assert_eq!(receiver, data);

        // A structure bit carries the whole sub-structure
        let mut newer = data.clone();
        newer.get_mut("value").unwrap().set_value(-1.0).unwrap();
        newer.locate_mut("alarm.message").unwrap().set_value("HIHI").unwrap();
        let mut changes = data.update(&newer).unwrap();
        changes.set(6);
        buffer.clear();
        data.encode_elements(&changes, &mut buffer, &mut types).unwrap();
        receiver
            .decode_elements(&changes, &mut types, &mut Reader::new(&buffer, ByteOrder::Little))
            .unwrap();
        assert_eq!(receiver, data);
    }

    #[test]
    fn test_truncated_value() {
        let mut types = TypeRegistry::new();
        let data = demo();
        let mut buffer = Vec::new();
        data.encode(&mut buffer, &mut types);
        buffer.truncate(buffer.len() - 2);
        let mut receiver = data.clone_type("demo");
        assert_eq!(
            receiver.decode(&mut types, &mut Reader::new(&buffer, ByteOrder::Little)),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn test_select() {
        let data = demo();
        let selected = data.select(&["value", "timeStamp.nanoseconds"]).unwrap();
        assert_eq!(
            selected.format_type(),
            "NTBogus demo\n    double value\n    time_t timeStamp\n        int nanoseconds"
        );
        assert_eq!(data.select::<&str>(&[]).unwrap(), data);
        assert!(data.select(&["missing"]).is_err());
    }

    #[test]
    fn test_structure_array() {
        let element = alarm();
        let mut array = StructureArray::new("alarms", element.clone());
        let mut second = element.clone();
        second.get_mut("severity").unwrap().set_value(2).unwrap();
        array.set_items(&[element, second]).unwrap();

        let field = PvaData::StructureArray(array);
        let mut types = TypeRegistry::new();
        let mut buffer = Vec::new();
        field.encode_type(&mut buffer, &mut types);
        field.encode(&mut buffer, &mut types);

        let mut receiver = TypeRegistry::new();
        let mut reader = Reader::new(&buffer, ByteOrder::Little);
        let mut decoded = receiver.decode_type("alarms", &mut reader).unwrap().unwrap();
        decoded.decode(&mut receiver, &mut reader).unwrap();
        assert_eq!(decoded, field);
        assert_eq!(decoded.format_type(), "alarm_t[] alarms\n    int severity\n    int status\n    string message");
    }
}
