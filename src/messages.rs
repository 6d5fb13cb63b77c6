//! Framing and the fixed-layout PVA messages
//!
//! Every message starts with an eight byte header, followed by a payload in
//! the byte order the header declares. Messages whose payload carries
//! structure data (get, put, monitor, field introspection) depend on the
//! per-connection [`TypeRegistry`](crate::data::TypeRegistry) and are
//! assembled by the client and server circuits from the pieces here.

use std::{
    collections::hash_map::RandomState,
    fmt::{self, Display},
    hash::BuildHasher,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::SystemTime,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use nom::{
    IResult, Parser,
    bytes::complete::tag,
    number::complete::{be_u32, le_u8, le_u32},
};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;

use crate::{
    codec::{ByteOrder, DecodeError, Reader, encode_size, encode_string},
    data::{PvaData, Structure, TypeRegistry},
};

pub const MAGIC: u8 = 0xCA;
pub const PROTOCOL_VERSION: u8 = 2;
pub const HEADER_SIZE: usize = 8;
/// Largest payload accepted from a peer
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Header flag bits
pub mod flags {
    pub const CONTROL: u8 = 0x01;
    pub const SEGMENT_MASK: u8 = 0x30;
    pub const FROM_SERVER: u8 = 0x40;
    pub const BIG_ENDIAN: u8 = 0x80;
}

/// Control message commands
pub mod control {
    pub const SET_BYTE_ORDER: u8 = 0x02;
}

/// Subcommand bits of get, put and monitor requests
pub mod subcommand {
    pub const EXECUTE: u8 = 0x00;
    pub const STOP: u8 = 0x04;
    pub const INIT: u8 = 0x08;
    pub const DESTROY: u8 = 0x10;
    pub const GET: u8 = 0x40;
    pub const START: u8 = 0x44;
    pub const PIPELINE: u8 = 0x80;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Beacon = 0x00,
    ConnectionValidation = 0x01,
    Echo = 0x02,
    Search = 0x03,
    SearchResponse = 0x04,
    CreateChannel = 0x07,
    DestroyChannel = 0x08,
    ConnectionValidated = 0x09,
    Get = 0x0A,
    Put = 0x0B,
    Monitor = 0x0D,
    DestroyRequest = 0x0F,
    GetField = 0x11,
    Message = 0x12,
    CancelRequest = 0x15,
}

impl TryFrom<u8> for Command {
    type Error = MessageError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Command::Beacon,
            0x01 => Command::ConnectionValidation,
            0x02 => Command::Echo,
            0x03 => Command::Search,
            0x04 => Command::SearchResponse,
            0x07 => Command::CreateChannel,
            0x08 => Command::DestroyChannel,
            0x09 => Command::ConnectionValidated,
            0x0A => Command::Get,
            0x0B => Command::Put,
            0x0D => Command::Monitor,
            0x0F => Command::DestroyRequest,
            0x11 => Command::GetField,
            0x12 => Command::Message,
            0x15 => Command::CancelRequest,
            unknown => return Err(MessageError::UnknownCommandId(unknown)),
        })
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured: {0}")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message header")]
    ParsingError(#[from] nom::Err<nom::error::Error<Vec<u8>>>),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u8),
    #[error("Message command ID does not match expected: {0}")]
    IncorrectCommandId(u8),
    #[error("Segmented messages are not supported")]
    Segmented,
    #[error("Message payload of {0} bytes is larger than allowed")]
    TooLarge(usize),
    #[error("Malformed message: {0}")]
    Decode(#[from] DecodeError),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError(err.to_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    /// Payload length, or the value of a control message
    pub payload_size: u32,
}

impl Header {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, (_, version, flags, command)) =
            (tag([MAGIC].as_slice()), le_u8, le_u8, le_u8).parse(input)?;
        let (input, payload_size) = if flags & flags::BIG_ENDIAN != 0 {
            be_u32(input)?
        } else {
            le_u32(input)?
        };
        Ok((
            input,
            Header {
                version,
                flags,
                command,
                payload_size,
            },
        ))
    }

    fn write<B: BufMut>(&self, buffer: &mut B) {
        buffer.put_u8(MAGIC);
        buffer.put_u8(self.version);
        buffer.put_u8(self.flags);
        buffer.put_u8(self.command);
        buffer.put_u32_le(self.payload_size);
    }

    pub fn byte_order(&self) -> ByteOrder {
        if self.flags & flags::BIG_ENDIAN != 0 {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }
    pub fn is_control(&self) -> bool {
        self.flags & flags::CONTROL != 0
    }
    pub fn is_from_server(&self) -> bool {
        self.flags & flags::FROM_SERVER != 0
    }
    pub fn is_segmented(&self) -> bool {
        self.flags & flags::SEGMENT_MASK != 0
    }
}

/// A framed message, with the payload not yet interpreted
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub header: Header,
    pub payload: Bytes,
}

impl RawMessage {
    pub fn new(command: Command, from_server: bool, payload: impl Into<Bytes>) -> RawMessage {
        let payload = payload.into();
        RawMessage {
            header: Header {
                version: PROTOCOL_VERSION,
                flags: if from_server { flags::FROM_SERVER } else { 0 },
                command: command as u8,
                payload_size: payload.len() as u32,
            },
            payload,
        }
    }

    /// A control message, which carries a value instead of a payload
    pub fn control(command: u8, value: u32, from_server: bool) -> RawMessage {
        RawMessage {
            header: Header {
                version: PROTOCOL_VERSION,
                flags: flags::CONTROL | if from_server { flags::FROM_SERVER } else { 0 },
                command,
                payload_size: value,
            },
            payload: Bytes::new(),
        }
    }

    pub fn command(&self) -> Result<Command, MessageError> {
        self.header.command.try_into()
    }

    /// A reader over the payload, in the byte order of the sender
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.payload, self.header.byte_order())
    }

    pub fn write<B: BufMut>(&self, buffer: &mut B) {
        self.header.write(buffer);
        buffer.put_slice(&self.payload);
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        self.write(&mut buffer);
        buffer
    }

    /// Parse every message in a datagram
    pub fn parse_many(mut input: &[u8]) -> Result<Vec<RawMessage>, MessageError> {
        let mut messages = Vec::new();
        while !input.is_empty() {
            let (rest, header) = Header::parse(input)?;
            if header.is_segmented() {
                return Err(MessageError::Segmented);
            }
            let size = if header.is_control() {
                0
            } else {
                header.payload_size as usize
            };
            let (payload, rest) = rest
                .split_at_checked(size)
                .ok_or(MessageError::Decode(DecodeError::Truncated))?;
            messages.push(RawMessage {
                header,
                payload: Bytes::copy_from_slice(payload),
            });
            input = rest;
        }
        Ok(messages)
    }

    pub async fn write_all_messages<W: AsyncWrite + Unpin>(
        messages: &[RawMessage],
        writer: &mut W,
    ) -> io::Result<()> {
        let mut buffer = Vec::new();
        for message in messages {
            message.write(&mut buffer);
        }
        writer.write_all(&buffer).await
    }
}

/// Splits a TCP stream into [`RawMessage`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct PvaCodec;

impl Decoder for PvaCodec {
    type Item = RawMessage;
    type Error = MessageError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let (_, header) = Header::parse(&src[..HEADER_SIZE])?;
        if header.is_control() {
            src.advance(HEADER_SIZE);
            return Ok(Some(RawMessage {
                header,
                payload: Bytes::new(),
            }));
        }
        if header.is_segmented() {
            return Err(MessageError::Segmented);
        }
        let size = header.payload_size as usize;
        if size > MAX_PAYLOAD_SIZE {
            return Err(MessageError::TooLarge(size));
        }
        if src.len() < HEADER_SIZE + size {
            src.reserve(HEADER_SIZE + size - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let payload = src.split_to(size).freeze();
        Ok(Some(RawMessage { header, payload }))
    }
}

/// A message with a fixed layout, independent of any type registry
pub trait PvaMessage: Sized {
    const COMMAND: Command;

    fn encode_payload(&self, buffer: &mut Vec<u8>);
    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError>;

    fn to_message(&self, from_server: bool) -> RawMessage {
        let mut payload = Vec::new();
        self.encode_payload(&mut payload);
        RawMessage::new(Self::COMMAND, from_server, payload)
    }

    fn from_message(message: &RawMessage) -> Result<Self, MessageError> {
        if message.header.command != Self::COMMAND as u8 || message.header.is_control() {
            return Err(MessageError::IncorrectCommandId(message.header.command));
        }
        Self::decode_payload(&mut message.reader())
    }
}

/// 12-byte server identity, carried in beacons and search responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid(pub [u8; 12]);

impl Guid {
    pub fn random() -> Guid {
        let state = RandomState::new();
        let seed = state.hash_one((SystemTime::now(), std::process::id()));
        let extra = state.hash_one(seed);
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..].copy_from_slice(&extra.to_le_bytes()[..4]);
        Guid(bytes)
    }
    fn decode(reader: &mut Reader) -> Result<Guid, DecodeError> {
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(reader.take(12)?);
        Ok(Guid(bytes))
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Write an address as 16 bytes, IPv4 addresses mapped into IPv6
pub fn encode_address<B: BufMut>(address: Option<IpAddr>, buffer: &mut B) {
    let mapped = match address {
        None => Ipv6Addr::UNSPECIFIED,
        Some(IpAddr::V4(v4)) => v4.to_ipv6_mapped(),
        Some(IpAddr::V6(v6)) => v6,
    };
    buffer.put_slice(&mapped.octets());
}

/// Read a 16 byte address. The unspecified address reads as `None`.
pub fn decode_address(reader: &mut Reader) -> Result<Option<IpAddr>, DecodeError> {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(reader.take(16)?);
    let address = Ipv6Addr::from(octets);
    Ok(match address.to_ipv4_mapped() {
        Some(v4) if v4 == Ipv4Addr::UNSPECIFIED => None,
        Some(v4) => Some(IpAddr::V4(v4)),
        None if address.is_unspecified() => None,
        None => Some(IpAddr::V6(address)),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusType {
    #[default]
    Ok = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

/// Outcome of a request, as reported by the peer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    pub kind: StatusType,
    pub message: String,
    pub call_tree: String,
}

impl Status {
    pub fn ok() -> Status {
        Status::default()
    }
    pub fn error(message: impl Into<String>) -> Status {
        Status {
            kind: StatusType::Error,
            message: message.into(),
            call_tree: String::new(),
        }
    }
    /// Ok or warning
    pub fn is_success(&self) -> bool {
        matches!(self.kind, StatusType::Ok | StatusType::Warning)
    }

    pub fn encode<B: BufMut>(&self, buffer: &mut B) {
        if self.kind == StatusType::Ok && self.message.is_empty() && self.call_tree.is_empty() {
            buffer.put_u8(0xFF);
            return;
        }
        buffer.put_u8(self.kind as u8);
        encode_string(&self.message, buffer);
        encode_string(&self.call_tree, buffer);
    }

    pub fn decode(reader: &mut Reader) -> Result<Status, DecodeError> {
        let kind = match reader.get_u8()? {
            0xFF => return Ok(Status::ok()),
            0 => StatusType::Ok,
            1 => StatusType::Warning,
            2 => StatusType::Error,
            3 => StatusType::Fatal,
            other => {
                return Err(DecodeError::InvalidField(format!("Status type {other}")));
            }
        };
        Ok(Status {
            kind,
            message: reader.get_string()?,
            call_tree: reader.get_string()?,
        })
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StatusType::Ok if self.message.is_empty() => write!(f, "OK"),
            kind => write!(f, "{kind:?}: {}", self.message),
        }
    }
}

/// Search flag: the reply is wanted even when nothing was found
pub const SEARCH_REPLY_REQUIRED: u8 = 0x01;
/// Search flag: sent directly to one server rather than broadcast
pub const SEARCH_UNICAST: u8 = 0x80;

/// Channel name search, sent over UDP
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Search {
    pub sequence_id: u32,
    pub flags: u8,
    /// Where replies should go. `None` means the sender of the datagram.
    pub response_address: Option<IpAddr>,
    pub response_port: u16,
    pub protocols: Vec<String>,
    /// Pairs of (search instance id, channel name)
    pub channels: Vec<(u32, String)>,
}

impl Search {
    /// Build the reply to this search from a server
    pub fn respond(
        &self,
        guid: Guid,
        server_address: Option<IpAddr>,
        server_port: u16,
        found: Vec<u32>,
    ) -> SearchResponse {
        SearchResponse {
            guid,
            sequence_id: self.sequence_id,
            server_address,
            server_port,
            protocol: "tcp".to_string(),
            found: !found.is_empty(),
            search_ids: found,
        }
    }
}

impl PvaMessage for Search {
    const COMMAND: Command = Command::Search;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32_le(self.sequence_id);
        buffer.put_u8(self.flags);
        buffer.put_slice(&[0, 0, 0]);
        encode_address(self.response_address, buffer);
        buffer.put_u16_le(self.response_port);
        encode_size(Some(self.protocols.len()), buffer);
        for protocol in &self.protocols {
            encode_string(protocol, buffer);
        }
        // The count is 16 bits wide; any channels beyond it are not sent
        let count = self.channels.len().min(u16::MAX as usize);
        buffer.put_u16_le(count as u16);
        for (id, name) in self.channels.iter().take(count) {
            buffer.put_u32_le(*id);
            encode_string(name, buffer);
        }
    }

    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        let sequence_id = reader.get_u32()?;
        let flags = reader.get_u8()?;
        reader.take(3)?;
        let response_address = decode_address(reader)?;
        let response_port = reader.get_u16()?;
        let protocol_count = reader.get_count()?;
        reader.ensure(protocol_count, 1)?;
        let protocols = (0..protocol_count)
            .map(|_| reader.get_string())
            .collect::<Result<Vec<_>, _>>()?;
        let channel_count = reader.get_u16()? as usize;
        reader.ensure(channel_count, 5)?;
        let mut channels = Vec::with_capacity(channel_count);
        for _ in 0..channel_count {
            channels.push((reader.get_u32()?, reader.get_string()?));
        }
        Ok(Search {
            sequence_id,
            flags,
            response_address,
            response_port,
            protocols,
            channels,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub guid: Guid,
    pub sequence_id: u32,
    /// The server's address. `None` means the sender of the datagram.
    pub server_address: Option<IpAddr>,
    pub server_port: u16,
    pub protocol: String,
    pub found: bool,
    /// Search instance ids this reply answers
    pub search_ids: Vec<u32>,
}

impl PvaMessage for SearchResponse {
    const COMMAND: Command = Command::SearchResponse;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_slice(&self.guid.0);
        buffer.put_u32_le(self.sequence_id);
        encode_address(self.server_address, buffer);
        buffer.put_u16_le(self.server_port);
        encode_string(&self.protocol, buffer);
        buffer.put_u8(self.found as u8);
        buffer.put_u16_le(self.search_ids.len() as u16);
        for id in &self.search_ids {
            buffer.put_u32_le(*id);
        }
    }

    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        let guid = Guid::decode(reader)?;
        let sequence_id = reader.get_u32()?;
        let server_address = decode_address(reader)?;
        let server_port = reader.get_u16()?;
        let protocol = reader.get_string()?;
        let found = reader.get_bool()?;
        let count = reader.get_u16()? as usize;
        reader.ensure(count, 4)?;
        let search_ids = (0..count)
            .map(|_| reader.get_u32())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SearchResponse {
            guid,
            sequence_id,
            server_address,
            server_port,
            protocol,
            found,
            search_ids,
        })
    }
}

/// Periodic server announcement, sent over UDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub guid: Guid,
    pub flags: u8,
    pub sequence_id: u8,
    /// Bumped whenever the set of served channels changes
    pub change_count: u16,
    pub server_address: Option<IpAddr>,
    pub server_port: u16,
    pub protocol: String,
}

impl PvaMessage for Beacon {
    const COMMAND: Command = Command::Beacon;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_slice(&self.guid.0);
        buffer.put_u8(self.flags);
        buffer.put_u8(self.sequence_id);
        buffer.put_u16_le(self.change_count);
        encode_address(self.server_address, buffer);
        buffer.put_u16_le(self.server_port);
        encode_string(&self.protocol, buffer);
        // No server status
        buffer.put_u8(0xFF);
    }

    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        let beacon = Beacon {
            guid: Guid::decode(reader)?,
            flags: reader.get_u8()?,
            sequence_id: reader.get_u8()?,
            change_count: reader.get_u16()?,
            server_address: decode_address(reader)?,
            server_port: reader.get_u16()?,
            protocol: reader.get_string()?,
        };
        // Any server status that follows is ignored
        Ok(beacon)
    }
}

/// Server's opening request for the client to identify itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub buffer_size: u32,
    pub registry_size: u16,
    pub auth_methods: Vec<String>,
}

impl Default for ValidationRequest {
    fn default() -> Self {
        ValidationRequest {
            buffer_size: 0x4000,
            registry_size: 0x7FFF,
            auth_methods: vec!["anonymous".to_string(), "ca".to_string()],
        }
    }
}

impl PvaMessage for ValidationRequest {
    const COMMAND: Command = Command::ConnectionValidation;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32_le(self.buffer_size);
        buffer.put_u16_le(self.registry_size);
        encode_size(Some(self.auth_methods.len()), buffer);
        for method in &self.auth_methods {
            encode_string(method, buffer);
        }
    }

    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        let buffer_size = reader.get_u32()?;
        let registry_size = reader.get_u16()?;
        let count = reader.get_count()?;
        reader.ensure(count, 1)?;
        let auth_methods = (0..count)
            .map(|_| reader.get_string())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ValidationRequest {
            buffer_size,
            registry_size,
            auth_methods,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Anonymous,
    Ca { user: String, host: String },
}

impl Authentication {
    /// Identify as the current OS user and host
    pub fn from_environment() -> Authentication {
        let user = whoami::username();
        let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_string());
        Authentication::Ca { user, host }
    }
    pub fn method(&self) -> &'static str {
        match self {
            Authentication::Anonymous => "anonymous",
            Authentication::Ca { .. } => "ca",
        }
    }
}

/// Client's answer to a [`ValidationRequest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResponse {
    pub buffer_size: u32,
    pub registry_size: u16,
    pub quality_of_service: u16,
    pub auth: Authentication,
}

impl ValidationResponse {
    pub fn new(auth: Authentication) -> ValidationResponse {
        ValidationResponse {
            buffer_size: 0x4000,
            registry_size: 0x7FFF,
            quality_of_service: 0,
            auth,
        }
    }
}

impl PvaMessage for ValidationResponse {
    const COMMAND: Command = Command::ConnectionValidation;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32_le(self.buffer_size);
        buffer.put_u16_le(self.registry_size);
        buffer.put_u16_le(self.quality_of_service);
        encode_string(self.auth.method(), buffer);
        match &self.auth {
            Authentication::Anonymous => buffer.put_u8(0xFF),
            Authentication::Ca { user, host } => {
                let identity = Structure::new(
                    "",
                    "",
                    vec![PvaData::string("user", user), PvaData::string("host", host)],
                );
                // Both fields are named, so this cannot fail
                if let Ok(identity) = identity {
                    let identity = PvaData::Structure(identity);
                    let mut types = TypeRegistry::untracked();
                    identity.encode_type(buffer, &mut types);
                    identity.encode(buffer, &mut types);
                }
            }
        }
    }

    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        let buffer_size = reader.get_u32()?;
        let registry_size = reader.get_u16()?;
        let quality_of_service = reader.get_u16()?;
        let method = reader.get_string()?;
        let mut types = TypeRegistry::new();
        let details = match types.decode_type("", reader)? {
            Some(mut value) => {
                value.decode(&mut types, reader)?;
                Some(value)
            }
            None => None,
        };
        let auth = match (method.as_str(), details) {
            ("ca", Some(PvaData::Structure(details))) => {
                let text = |name: &str| {
                    details
                        .get(name)
                        .and_then(|f| f.as_str())
                        .unwrap_or_default()
                        .to_string()
                };
                Authentication::Ca {
                    user: text("user"),
                    host: text("host"),
                }
            }
            ("anonymous" | "", _) => Authentication::Anonymous,
            (other, _) => {
                return Err(MessageError::InvalidField(
                    "auth method".to_string(),
                    other.to_string(),
                ));
            }
        };
        Ok(ValidationResponse {
            buffer_size,
            registry_size,
            quality_of_service,
            auth,
        })
    }
}

/// Server's final word on connection validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validated {
    pub status: Status,
}

impl PvaMessage for Validated {
    const COMMAND: Command = Command::ConnectionValidated;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        self.status.encode(buffer);
    }
    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        Ok(Validated {
            status: Status::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannel {
    /// Pairs of (client channel id, channel name)
    pub channels: Vec<(u32, String)>,
}

impl PvaMessage for CreateChannel {
    const COMMAND: Command = Command::CreateChannel;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        let count = self.channels.len().min(u16::MAX as usize);
        buffer.put_u16_le(count as u16);
        for (cid, name) in self.channels.iter().take(count) {
            buffer.put_u32_le(*cid);
            encode_string(name, buffer);
        }
    }
    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        let count = reader.get_u16()? as usize;
        reader.ensure(count, 5)?;
        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            channels.push((reader.get_u32()?, reader.get_string()?));
        }
        Ok(CreateChannel { channels })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelResponse {
    pub cid: u32,
    pub sid: u32,
    pub status: Status,
}

impl PvaMessage for CreateChannelResponse {
    const COMMAND: Command = Command::CreateChannel;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32_le(self.cid);
        buffer.put_u32_le(self.sid);
        self.status.encode(buffer);
    }
    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        Ok(CreateChannelResponse {
            cid: reader.get_u32()?,
            sid: reader.get_u32()?,
            status: Status::decode(reader)?,
        })
    }
}

/// Sent by either side to close a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyChannel {
    pub sid: u32,
    pub cid: u32,
}

impl PvaMessage for DestroyChannel {
    const COMMAND: Command = Command::DestroyChannel;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32_le(self.sid);
        buffer.put_u32_le(self.cid);
    }
    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        Ok(DestroyChannel {
            sid: reader.get_u32()?,
            cid: reader.get_u32()?,
        })
    }
}

/// Request for the type of a channel, or of one of its sub-fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetFieldRequest {
    pub sid: u32,
    pub ioid: u32,
    pub sub_field: String,
}

impl PvaMessage for GetFieldRequest {
    const COMMAND: Command = Command::GetField;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32_le(self.sid);
        buffer.put_u32_le(self.ioid);
        encode_string(&self.sub_field, buffer);
    }
    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        Ok(GetFieldRequest {
            sid: reader.get_u32()?,
            ioid: reader.get_u32()?,
            sub_field: reader.get_string()?,
        })
    }
}

/// DestroyRequest or CancelRequest for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestControl {
    pub sid: u32,
    pub ioid: u32,
}

impl RequestControl {
    pub fn destroy(&self, from_server: bool) -> RawMessage {
        self.build(Command::DestroyRequest, from_server)
    }
    pub fn cancel(&self, from_server: bool) -> RawMessage {
        self.build(Command::CancelRequest, from_server)
    }
    fn build(&self, command: Command, from_server: bool) -> RawMessage {
        let mut payload = Vec::with_capacity(8);
        payload.put_u32_le(self.sid);
        payload.put_u32_le(self.ioid);
        RawMessage::new(command, from_server, payload)
    }
    pub fn decode(reader: &mut Reader) -> Result<RequestControl, DecodeError> {
        Ok(RequestControl {
            sid: reader.get_u32()?,
            ioid: reader.get_u32()?,
        })
    }
}

/// Prefix of every get, put and monitor request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationRequest {
    pub sid: u32,
    pub ioid: u32,
    pub subcommand: u8,
}

impl OperationRequest {
    pub fn encode<B: BufMut>(&self, buffer: &mut B) {
        buffer.put_u32_le(self.sid);
        buffer.put_u32_le(self.ioid);
        buffer.put_u8(self.subcommand);
    }
    pub fn decode(reader: &mut Reader) -> Result<OperationRequest, DecodeError> {
        Ok(OperationRequest {
            sid: reader.get_u32()?,
            ioid: reader.get_u32()?,
            subcommand: reader.get_u8()?,
        })
    }
}

/// Prefix of every get, put and monitor response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationResponse {
    pub ioid: u32,
    pub subcommand: u8,
}

impl OperationResponse {
    pub fn encode<B: BufMut>(&self, buffer: &mut B) {
        buffer.put_u32_le(self.ioid);
        buffer.put_u8(self.subcommand);
    }
    pub fn decode(reader: &mut Reader) -> Result<OperationResponse, DecodeError> {
        Ok(OperationResponse {
            ioid: reader.get_u32()?,
            subcommand: reader.get_u8()?,
        })
    }
}

/// Diagnostic text sent by a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    pub ioid: u32,
    pub kind: StatusType,
    pub message: String,
}

impl PvaMessage for ServerMessage {
    const COMMAND: Command = Command::Message;

    fn encode_payload(&self, buffer: &mut Vec<u8>) {
        buffer.put_u32_le(self.ioid);
        buffer.put_u8(self.kind as u8);
        encode_string(&self.message, buffer);
    }
    fn decode_payload(reader: &mut Reader) -> Result<Self, MessageError> {
        let ioid = reader.get_u32()?;
        let kind = match reader.get_u8()? {
            0 => StatusType::Ok,
            1 => StatusType::Warning,
            2 => StatusType::Error,
            _ => StatusType::Fatal,
        };
        Ok(ServerMessage {
            ioid,
            kind,
            message: reader.get_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header() {
        let message = RawMessage::new(Command::GetField, true, vec![1u8, 2, 3]);
        let bytes = message.as_bytes();
        assert_eq!(bytes[..8], [0xCA, 2, 0x40, 0x11, 3, 0, 0, 0]);
        let (rest, header) = Header::parse(&bytes).unwrap();
        assert_eq!(rest, [1, 2, 3]);
        assert!(header.is_from_server());
        assert!(!header.is_control());
        assert_eq!(header.byte_order(), ByteOrder::Little);

        let big = [0xCA, 2, 0x80, 0x02, 0, 0, 0, 4];
        let (_, header) = Header::parse(&big).unwrap();
        assert_eq!(header.payload_size, 4);
        assert_eq!(header.byte_order(), ByteOrder::Big);

        assert!(Header::parse(&[0xCB, 2, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_codec() {
        let mut codec = PvaCodec;
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&RawMessage::control(control::SET_BYTE_ORDER, 0, true).as_bytes());
        let echo = RawMessage::new(Command::Echo, false, vec![9u8; 10]).as_bytes();
        buffer.extend_from_slice(&echo[..12]);

        let first = codec.decode(&mut buffer).unwrap().unwrap();
        assert!(first.header.is_control());
        assert_eq!(first.header.command, control::SET_BYTE_ORDER);
        // Only part of the echo has arrived
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        buffer.extend_from_slice(&echo[12..]);
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.command().unwrap(), Command::Echo);
        assert_eq!(second.payload.as_ref(), [9u8; 10]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_codec_rejects_segments() {
        let mut codec = PvaCodec;
        let mut buffer = BytesMut::from(&[0xCA, 2, 0x10, 0x0A, 1, 0, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut buffer), Err(MessageError::Segmented)));
    }

    #[test]
    fn test_search_layout() {
        let search = Search {
            sequence_id: 7,
            flags: SEARCH_REPLY_REQUIRED,
            response_address: None,
            response_port: 5076,
            protocols: vec!["tcp".into()],
            channels: vec![(1, "demo".into())],
        };
        let message = search.to_message(false);
        let payload = &message.payload;
        assert_eq!(payload[..8], [7, 0, 0, 0, 1, 0, 0, 0]);
        assert_eq!(payload[8..24], [0u8; 16]);
        assert_eq!(payload[24..26], 5076u16.to_le_bytes());
        assert_eq!(Search::from_message(&message).unwrap(), search);

        let parsed = RawMessage::parse_many(&[message.as_bytes(), message.as_bytes()].concat()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(SearchResponse::from_message(&parsed[0]).is_err());
    }

    #[test]
    fn test_search_response() {
        let search = Search {
            sequence_id: 3,
            channels: vec![(4, "a".into()), (5, "b".into())],
            ..Default::default()
        };
        let guid = Guid::random();
        let response = search.respond(guid, Some("10.0.0.2".parse().unwrap()), 5075, vec![5]);
        let decoded = SearchResponse::from_message(&response.to_message(true)).unwrap();
        assert_eq!(decoded, response);
        assert!(decoded.found);
        assert_eq!(decoded.server_address, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_validation() {
        let response = ValidationResponse::new(Authentication::Ca {
            user: "operator".into(),
            host: "console".into(),
        });
        let decoded = ValidationResponse::from_message(&response.to_message(false)).unwrap();
        assert_eq!(decoded, response);

        let anonymous = ValidationResponse::new(Authentication::Anonymous);
        let message = anonymous.to_message(false);
        assert_eq!(message.payload.last(), Some(&0xFF));
        assert_eq!(ValidationResponse::from_message(&message).unwrap(), anonymous);

        let request = ValidationRequest::default();
        assert_eq!(
            ValidationRequest::from_message(&request.to_message(true)).unwrap(),
            request
        );
    }

    #[test]
    fn test_status() {
        let mut buffer = Vec::new();
        Status::ok().encode(&mut buffer);
        assert_eq!(buffer, [0xFF]);
        buffer.clear();
        let error = Status::error("Nope");
        error.encode(&mut buffer);
        assert_eq!(buffer, [2, 4, b'N', b'o', b'p', b'e', 0]);
        let decoded = Status::decode(&mut Reader::new(&buffer, ByteOrder::Little)).unwrap();
        assert_eq!(decoded, error);
        assert!(!decoded.is_success());
        assert_eq!(decoded.to_string(), "Error: Nope");
    }

    #[test]
    fn test_address() {
        let mut buffer = Vec::new();
        encode_address(Some("192.168.1.4".parse().unwrap()), &mut buffer);
        assert_eq!(buffer[10..], [0xFF, 0xFF, 192, 168, 1, 4]);
        let mut reader = Reader::new(&buffer, ByteOrder::Little);
        assert_eq!(decode_address(&mut reader).unwrap(), Some("192.168.1.4".parse().unwrap()));
    }
}
