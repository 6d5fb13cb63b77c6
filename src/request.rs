//! Field selection for get, put and monitor requests
//!
//! A request string names the fields an operation should cover:
//!
//! | Request                          | Selected paths                  |
//! |----------------------------------|---------------------------------|
//! | `""`                             | everything                      |
//! | `"value"`                        | `value`                         |
//! | `"value,alarm"`                  | `value`, `alarm`                |
//! | `"field(value,timeStamp.userTag)"` | `value`, `timeStamp.userTag`  |
//!
//! On the wire the selection travels as a "pvRequest" structure, where
//! each selected path is a chain of empty structures below `field`.

use std::{fmt, str::FromStr};

use bytes::BufMut;

use crate::{
    codec::{DecodeError, Reader},
    data::{DataError, PvaData, Structure, TypeRegistry},
};

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRequest {
    paths: Vec<String>,
}

impl FieldRequest {
    /// Select every field
    pub fn all() -> FieldRequest {
        FieldRequest { paths: Vec::new() }
    }

    pub fn parse(request: &str) -> Result<FieldRequest, DataError> {
        let invalid = || DataError::InvalidRequest(request.to_string());
        let mut text = request.trim();

        // Record options are accepted but have no effect
        if let Some(rest) = text.strip_prefix("record[") {
            let end = rest.find(']').ok_or_else(invalid)?;
            text = rest[end + 1..].trim();
        }
        let body = match text.find('(') {
            Some(open) => {
                let keyword = text[..open].trim();
                if !matches!(keyword, "field" | "getField" | "putField") {
                    return Err(invalid());
                }
                text[open + 1..].strip_suffix(')').ok_or_else(invalid)?
            }
            None if text.contains(')') => return Err(invalid()),
            None => text,
        };

        let mut paths = Vec::new();
        for path in body.split(',').map(str::trim) {
            if path.is_empty() {
                continue;
            }
            if path.split('.').any(|s| s.is_empty() || !valid_name(s)) {
                return Err(invalid());
            }
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
        Ok(FieldRequest { paths })
    }

    /// Dot-separated paths of the selected fields. Empty selects everything.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn is_all(&self) -> bool {
        self.paths.is_empty()
    }

    /// The selection as a pvRequest structure
    pub fn to_structure(&self) -> Result<Structure, DataError> {
        let mut tree = Node::default();
        for path in &self.paths {
            tree.insert(path.split('.'));
        }
        Structure::new("", "", vec![tree.into_field("field")?])
    }

    /// Read the selection out of a pvRequest structure
    pub fn from_structure(request: &Structure) -> FieldRequest {
        let mut paths = Vec::new();
        if let Some(PvaData::Structure(field)) = request.get("field") {
            collect_paths(field, "", &mut paths);
        }
        FieldRequest { paths }
    }

    /// Write the pvRequest type and value
    pub fn encode<B: BufMut>(&self, buffer: &mut B, types: &mut TypeRegistry) -> Result<(), DataError> {
        let request = PvaData::Structure(self.to_structure()?);
        request.encode_type(buffer, types);
        request.encode(buffer, types);
        Ok(())
    }

    /// Read a pvRequest. A null request selects everything.
    pub fn decode(types: &mut TypeRegistry, reader: &mut Reader) -> Result<FieldRequest, DecodeError> {
        match types.decode_type("", reader)? {
            None => Ok(FieldRequest::all()),
            Some(mut value) => {
                value.decode(types, reader)?;
                Ok(match value {
                    PvaData::Structure(request) => FieldRequest::from_structure(&request),
                    _ => FieldRequest::all(),
                })
            }
        }
    }
}

impl Default for FieldRequest {
    fn default() -> Self {
        FieldRequest::all()
    }
}

impl FromStr for FieldRequest {
    type Err = DataError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FieldRequest::parse(s)
    }
}

impl fmt::Display for FieldRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field({})", self.paths.join(","))
    }
}

fn valid_name(name: &str) -> bool {
    name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ':')
}

fn collect_paths(structure: &Structure, prefix: &str, paths: &mut Vec<String>) {
    for field in structure.fields() {
        let path = if prefix.is_empty() {
            field.name().to_string()
        } else {
            format!("{prefix}.{}", field.name())
        };
        match field {
            PvaData::Structure(inner) if !inner.is_empty() => collect_paths(inner, &path, paths),
            _ => paths.push(path),
        }
    }
}

/// Ordered tree of path segments
#[derive(Default)]
struct Node {
    children: Vec<(String, Node)>,
}

impl Node {
    fn insert<'a>(&mut self, mut segments: impl Iterator<Item = &'a str>) {
        let Some(segment) = segments.next() else {
            return;
        };
        let index = match self.children.iter().position(|(name, _)| name == segment) {
            Some(index) => index,
            None => {
                self.children.push((segment.to_string(), Node::default()));
                self.children.len() - 1
            }
        };
        self.children[index].1.insert(segments);
    }

    fn into_field(self, name: &str) -> Result<PvaData, DataError> {
        let fields = self
            .children
            .into_iter()
            .map(|(child, node)| node.into_field(&child))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PvaData::Structure(Structure::new(name, "", fields)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ByteOrder;

    fn paths(request: &str) -> Vec<String> {
        FieldRequest::parse(request).unwrap().paths().to_vec()
    }

    #[test]
    fn test_parse() {
        assert!(paths("").is_empty());
        assert!(paths("field()").is_empty());
        assert_eq!(paths("value"), ["value"]);
        assert_eq!(paths("a.b"), ["a.b"]);
        assert_eq!(paths("value,alarm"), ["value", "alarm"]);
        assert_eq!(paths("field(value)"), ["value"]);
        assert_eq!(
            paths("field(value, timeStamp.secondsPastEpoch)"),
            ["value", "timeStamp.secondsPastEpoch"]
        );
        assert_eq!(paths("record[queueSize=4]field(value)"), ["value"]);
        assert_eq!(paths("value,value"), ["value"]);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["field(value", "value)", "a..b", "other(value)", "record[field(x)", "va lue"] {
            assert!(
                matches!(FieldRequest::parse(bad), Err(DataError::InvalidRequest(_))),
                "Expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn test_structure() {
        let request = FieldRequest::parse("field(value,timeStamp.userTag,timeStamp.nanoseconds)").unwrap();
        let structure = request.to_structure().unwrap();
        assert_eq!(
            structure.format_type(),
            "structure \n    structure field\n        structure value\n        structure timeStamp\n            structure userTag\n            structure nanoseconds"
        );
        assert_eq!(FieldRequest::from_structure(&structure), request);

        let all = FieldRequest::all().to_structure().unwrap();
        assert!(FieldRequest::from_structure(&all).is_all());
    }

    #[test]
    fn test_wire() {
        let request = FieldRequest::parse("value,alarm.severity").unwrap();
        let mut buffer = Vec::new();
        request.encode(&mut buffer, &mut TypeRegistry::new()).unwrap();
        let decoded = FieldRequest::decode(
            &mut TypeRegistry::new(),
            &mut Reader::new(&buffer, ByteOrder::Little),
        )
        .unwrap();
        assert_eq!(decoded, request);

        let null = [0xFFu8];
        let decoded =
            FieldRequest::decode(&mut TypeRegistry::new(), &mut Reader::new(&null, ByteOrder::Little)).unwrap();
        assert!(decoded.is_all());
    }
}
