use std::{
    collections::HashMap,
    net::SocketAddr,
    pin::Pin,
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncWriteExt, split},
    net::TcpStream,
    select,
};
use tokio_stream::{
    Stream, StreamExt, StreamMap,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, debug_span, info, trace, warn};

use crate::{
    codec::{BitSet, Reader, encode_bitset},
    data::{DataError, PvaData, Structure, TypeRegistry},
    messages::{
        Authentication, Command, CreateChannel, CreateChannelResponse, DestroyChannel,
        GetFieldRequest, MessageError, OperationRequest, OperationResponse, PvaCodec, PvaMessage,
        RawMessage, RequestControl, Status, Validated, ValidationRequest, ValidationResponse,
        control, subcommand,
    },
    providers::{Provider, ServerError},
    request::FieldRequest,
};

enum MonitorUpdate {
    Value(Structure),
    /// The subscriber fell behind, missing this many values
    Lagged(u64),
    /// The PV has gone away
    Closed,
}

type MonitorStream = Pin<Box<dyn Stream<Item = MonitorUpdate> + Send>>;

struct ServerChannel {
    cid: u32,
    name: String,
}

#[derive(Default)]
struct MonitorState {
    running: bool,
    /// What this client has been sent, for diffing the next update against
    last_sent: Option<Structure>,
    /// Updates were dropped since the last one sent
    lagged: bool,
}

enum OperationKind {
    Get,
    Put,
    Monitor(MonitorState),
}

struct Operation {
    sid: u32,
    /// Dot paths of the fields this operation serves
    paths: Vec<String>,
    kind: OperationKind,
}

/// One client connection
pub(crate) struct ServerCircuit<P: Provider> {
    peer: SocketAddr,
    provider: P,
    cancel: CancellationToken,
    connection_timeout: Duration,
    last_received_message_at: Instant,
    /// Types the client has described to us
    types: TypeRegistry,
    /// Types we have described to the client
    sent_types: TypeRegistry,
    channels: HashMap<u32, ServerChannel>,
    next_sid: u32,
    operations: HashMap<u32, Operation>,
    monitors: StreamMap<u32, MonitorStream>,
}

/// A response prefixed by ioid and subcommand
fn operation_response(ioid: u32, sub: u8, status: &Status) -> Vec<u8> {
    let mut payload = Vec::new();
    OperationResponse {
        ioid,
        subcommand: sub,
    }
    .encode(&mut payload);
    status.encode(&mut payload);
    payload
}

fn error_status(error: impl ToString) -> Status {
    Status::error(error.to_string())
}

/// Copy the fields of `source` into the same-named fields of `target`
fn merge_into(target: &mut PvaData, source: &PvaData) -> Result<(), DataError> {
    match (target, source) {
        (PvaData::Structure(target), PvaData::Structure(source)) => {
            merge_structure(target, source)
        }
        (target, source) => target.assign(source),
    }
}

fn merge_structure(target: &mut Structure, source: &Structure) -> Result<(), DataError> {
    let name = target.name().to_string();
    for field in source.fields() {
        let destination = target.get_mut(field.name()).ok_or_else(|| {
            DataError::Incompatible(format!("No field '{}' in '{name}'", field.name()))
        })?;
        merge_into(destination, field)?;
    }
    Ok(())
}

/// Apply the fields a client sent, in a selection of `current`
///
/// Returns the proposed value, and the fields of it that were set.
fn apply_put(
    current: &Structure,
    sent: &Structure,
    changes: &BitSet,
) -> Result<(Structure, BitSet), DataError> {
    let mut proposed = current.clone();
    let mut proposed_changes = BitSet::new();
    for index in changes.iter() {
        let paths: Vec<String> = if index == 0 {
            sent.fields().iter().map(|f| f.name().to_string()).collect()
        } else {
            vec![sent.path_of_index(index).ok_or(DataError::InvalidIndex(index))?]
        };
        for path in paths {
            merge_into(proposed.locate_mut(&path)?, sent.locate(&path)?)?;
            proposed_changes.set(current.index_of_path(&path)?);
        }
    }
    Ok((proposed, proposed_changes))
}

impl<P: Provider> ServerCircuit<P> {
    pub(crate) fn new(
        peer: SocketAddr,
        provider: P,
        connection_timeout: Duration,
        cancel: CancellationToken,
    ) -> ServerCircuit<P> {
        ServerCircuit {
            peer,
            provider,
            cancel,
            connection_timeout,
            last_received_message_at: Instant::now(),
            types: TypeRegistry::new(),
            sent_types: TypeRegistry::new(),
            channels: HashMap::new(),
            next_sid: 1,
            operations: HashMap::new(),
            monitors: StreamMap::new(),
        }
    }

    pub(crate) async fn serve(mut self, tcp: TcpStream) {
        let _ = tcp.set_nodelay(true);
        let (tcp_rx, mut tcp_tx) = split(tcp);
        let mut framed = FramedRead::with_capacity(tcp_rx, PvaCodec, 16384usize);

        let greeting = [
            RawMessage::control(control::SET_BYTE_ORDER, 0, true),
            ValidationRequest::default().to_message(true),
        ];
        if let Err(e) = RawMessage::write_all_messages(&greeting, &mut tcp_tx).await {
            warn!("Failed to greet client {}: {e}", self.peer);
            return;
        }

        loop {
            let deadline = self.last_received_message_at + self.connection_timeout;
            let messages_out = select! {
                _ = self.cancel.cancelled() => break,
                incoming = framed.next() => match incoming {
                    Some(Ok(message)) => match self.handle_message(message) {
                        Ok(messages) => messages,
                        Err(e) => {
                            warn!("Client {} sent an invalid message, closing: {e}", self.peer);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        warn!("Error reading from client {}: {e}", self.peer);
                        break;
                    }
                    None => break,
                },
                Some((ioid, update)) = self.monitors.next(), if !self.monitors.is_empty() => {
                    self.handle_update(ioid, update)
                },
                _ = tokio::time::sleep_until(deadline.into()) => {
                    warn!("Nothing heard from client {}, closing", self.peer);
                    break;
                },
            };
            if !messages_out.is_empty()
                && let Err(e) = RawMessage::write_all_messages(&messages_out, &mut tcp_tx).await
            {
                warn!("Failed to write to client {}: {e}", self.peer);
                break;
            }
        }
        debug!("Connection from {} closed", self.peer);
        let _ = tcp_tx.shutdown().await;
    }

    fn handle_message(&mut self, message: RawMessage) -> Result<Vec<RawMessage>, MessageError> {
        self.last_received_message_at = Instant::now();
        if message.header.is_control() {
            return Ok(Vec::new());
        }
        let command = match message.command() {
            Ok(command) => command,
            Err(e) => {
                debug!("Ignoring message from {}: {e}", self.peer);
                return Ok(Vec::new());
            }
        };
        trace!("Received {command:?} from {}", self.peer);
        let mut reader = message.reader();
        Ok(match command {
            Command::ConnectionValidation => {
                let response = ValidationResponse::decode_payload(&mut reader)?;
                match response.auth {
                    Authentication::Ca { user, host } => {
                        info!("Client {} connected as {user}@{host}", self.peer)
                    }
                    Authentication::Anonymous => info!("Client {} connected", self.peer),
                }
                vec![Validated { status: Status::ok() }.to_message(true)]
            }
            Command::Echo => vec![RawMessage::new(Command::Echo, true, message.payload.clone())],
            Command::CreateChannel => {
                let request = CreateChannel::decode_payload(&mut reader)?;
                request
                    .channels
                    .into_iter()
                    .map(|(cid, name)| self.create_channel(cid, name).to_message(true))
                    .collect()
            }
            Command::DestroyChannel => {
                let request = DestroyChannel::decode_payload(&mut reader)?;
                if let Some(channel) = self.channels.remove(&request.sid) {
                    debug!("Client {} closed channel {}", self.peer, channel.name);
                    self.drop_operations(request.sid);
                }
                vec![request.to_message(true)]
            }
            Command::GetField => {
                let request = GetFieldRequest::decode_payload(&mut reader)?;
                vec![self.get_field(request)]
            }
            Command::Get => self.handle_get(&mut reader)?,
            Command::Put => self.handle_put(&mut reader)?,
            Command::Monitor => self.handle_monitor(&mut reader)?,
            Command::DestroyRequest | Command::CancelRequest => {
                let request = RequestControl::decode(&mut reader)?;
                if self.operations.remove(&request.ioid).is_some() {
                    trace!("Released operation {}", request.ioid);
                }
                self.monitors.remove(&request.ioid);
                Vec::new()
            }
            other => {
                debug!("Got unhandled message from client: {other:?}");
                Vec::new()
            }
        })
    }

    fn create_channel(&mut self, cid: u32, name: String) -> CreateChannelResponse {
        let _span = debug_span!("create_channel", cid = cid).entered();
        if !self.provider.provides(&name) {
            debug!("Refusing unknown channel '{name}'");
            return CreateChannelResponse {
                cid,
                sid: 0,
                status: error_status(ServerError::NoSuchPv(name)),
            };
        }
        let sid = self.next_sid;
        self.next_sid = self.next_sid.wrapping_add(1);
        debug!("Client {} opened '{name}' as sid {sid}", self.peer);
        self.channels.insert(sid, ServerChannel { cid, name });
        CreateChannelResponse {
            cid,
            sid,
            status: Status::ok(),
        }
    }

    fn drop_operations(&mut self, sid: u32) {
        let ioids: Vec<u32> = self
            .operations
            .iter()
            .filter(|(_, op)| op.sid == sid)
            .map(|(ioid, _)| *ioid)
            .collect();
        for ioid in ioids {
            self.operations.remove(&ioid);
            self.monitors.remove(&ioid);
        }
    }

    fn channel_name(&self, sid: u32) -> Result<String, ServerError> {
        self.channels
            .get(&sid)
            .map(|c| c.name.clone())
            .ok_or_else(|| ServerError::NoSuchPv(format!("sid {sid}")))
    }

    /// Current value of the fields an operation covers
    fn read_selected(&self, sid: u32, paths: &[String]) -> Result<Structure, ServerError> {
        let name = self.channel_name(sid)?;
        Ok(self.provider.read_value(&name)?.select(paths)?)
    }

    fn get_field(&mut self, request: GetFieldRequest) -> RawMessage {
        let field = self.channel_name(request.sid).and_then(|name| {
            let value = self.provider.read_value(&name)?;
            Ok(if request.sub_field.is_empty() {
                PvaData::Structure(value)
            } else {
                value.locate(&request.sub_field)?.clone()
            })
        });
        let mut payload = Vec::new();
        payload.extend_from_slice(&request.ioid.to_le_bytes());
        match field {
            Ok(field) => {
                Status::ok().encode(&mut payload);
                field.encode_type(&mut payload, &mut self.sent_types);
            }
            Err(e) => error_status(e).encode(&mut payload),
        }
        RawMessage::new(Command::GetField, true, payload)
    }

    /// Register a get or put from its INIT request, replying with the type
    fn init_operation(
        &mut self,
        command: Command,
        request: OperationRequest,
        reader: &mut Reader,
    ) -> Result<RawMessage, MessageError> {
        let fields = FieldRequest::decode(&mut self.types, reader)?;
        let selected = self.read_selected(request.sid, fields.paths());
        let kind = match command {
            Command::Put => OperationKind::Put,
            Command::Monitor => OperationKind::Monitor(MonitorState::default()),
            _ => OperationKind::Get,
        };
        Ok(match selected {
            Ok(selected) => {
                let mut payload =
                    operation_response(request.ioid, request.subcommand, &Status::ok());
                selected.encode_type(&mut payload, &mut self.sent_types);
                self.operations.insert(
                    request.ioid,
                    Operation {
                        sid: request.sid,
                        paths: fields.paths().to_vec(),
                        kind,
                    },
                );
                RawMessage::new(command, true, payload)
            }
            Err(e) => {
                debug!("Refusing {command:?} {}: {e}", request.ioid);
                let payload =
                    operation_response(request.ioid, request.subcommand, &error_status(e));
                RawMessage::new(command, true, payload)
            }
        })
    }

    /// Look up an operation, replying with an error status if it is unknown
    fn operation_paths(
        &self,
        command: Command,
        request: &OperationRequest,
    ) -> Result<Vec<String>, RawMessage> {
        match self.operations.get(&request.ioid) {
            Some(op) if op.sid == request.sid => Ok(op.paths.clone()),
            _ => Err(RawMessage::new(
                command,
                true,
                operation_response(
                    request.ioid,
                    request.subcommand,
                    &Status::error(format!("No operation {}", request.ioid)),
                ),
            )),
        }
    }

    /// Reply with the status, a full bit set and the current value
    fn value_response(
        &mut self,
        command: Command,
        request: &OperationRequest,
        paths: &[String],
    ) -> RawMessage {
        let payload = match self.read_selected(request.sid, paths) {
            Ok(value) => {
                let mut payload =
                    operation_response(request.ioid, request.subcommand, &Status::ok());
                let all: BitSet = [0].into_iter().collect();
                encode_bitset(&all, &mut payload);
                value.encode(&mut payload, &mut self.sent_types);
                payload
            }
            Err(e) => operation_response(request.ioid, request.subcommand, &error_status(e)),
        };
        RawMessage::new(command, true, payload)
    }

    fn handle_get(&mut self, reader: &mut Reader) -> Result<Vec<RawMessage>, MessageError> {
        let request = OperationRequest::decode(reader)?;
        if request.subcommand & subcommand::INIT != 0 {
            return Ok(vec![self.init_operation(Command::Get, request, reader)?]);
        }
        let paths = match self.operation_paths(Command::Get, &request) {
            Ok(paths) => paths,
            Err(reply) => return Ok(vec![reply]),
        };
        let reply = self.value_response(Command::Get, &request, &paths);
        if request.subcommand & subcommand::DESTROY != 0 {
            self.operations.remove(&request.ioid);
        }
        Ok(vec![reply])
    }

    fn handle_put(&mut self, reader: &mut Reader) -> Result<Vec<RawMessage>, MessageError> {
        let request = OperationRequest::decode(reader)?;
        if request.subcommand & subcommand::INIT != 0 {
            return Ok(vec![self.init_operation(Command::Put, request, reader)?]);
        }
        let paths = match self.operation_paths(Command::Put, &request) {
            Ok(paths) => paths,
            Err(reply) => return Ok(vec![reply]),
        };
        let reply = if request.subcommand & subcommand::GET != 0 {
            self.value_response(Command::Put, &request, &paths)
        } else {
            let changes = reader.get_bitset()?;
            let status = match self.write(request.sid, &paths, &changes, reader)? {
                Ok(()) => Status::ok(),
                Err(e) => {
                    debug!("Write to sid {} failed: {e}", request.sid);
                    error_status(e)
                }
            };
            RawMessage::new(
                Command::Put,
                true,
                operation_response(request.ioid, request.subcommand, &status),
            )
        };
        if request.subcommand & subcommand::DESTROY != 0 {
            self.operations.remove(&request.ioid);
        }
        Ok(vec![reply])
    }

    /// Decode the fields a client sent, and pass the result to the provider
    ///
    /// The outer error is a malformed message, the inner a refused write.
    fn write(
        &mut self,
        sid: u32,
        paths: &[String],
        changes: &BitSet,
        reader: &mut Reader,
    ) -> Result<Result<(), ServerError>, MessageError> {
        let name = match self.channel_name(sid) {
            Ok(name) => name,
            Err(e) => return Ok(Err(e)),
        };
        let current = match self.provider.read_value(&name) {
            Ok(current) => current,
            Err(e) => return Ok(Err(e)),
        };
        let mut sent = match current.select(paths) {
            Ok(selected) => selected,
            Err(e) => return Ok(Err(e.into())),
        };
        sent.decode_elements(changes, &mut self.types, reader)?;
        Ok(apply_put(&current, &sent, changes)
            .map_err(ServerError::from)
            .and_then(|(proposed, proposed_changes)| {
                self.provider
                    .write_value(&name, &proposed_changes, proposed)
            }))
    }

    fn handle_monitor(&mut self, reader: &mut Reader) -> Result<Vec<RawMessage>, MessageError> {
        let request = OperationRequest::decode(reader)?;
        let ioid = request.ioid;
        if request.subcommand & subcommand::INIT != 0 {
            let reply = self.init_operation(Command::Monitor, request, reader)?;
            // Pipelined monitors announce a queue size, which is not needed here
            if request.subcommand & subcommand::PIPELINE != 0 {
                let _ = reader.get_u32();
            }
            if self.operations.contains_key(&ioid)
                && let Err(e) = self.start_stream(request.sid, ioid)
            {
                warn!("Could not monitor sid {}: {e}", request.sid);
                self.operations.remove(&ioid);
                let payload = operation_response(ioid, request.subcommand, &error_status(e));
                return Ok(vec![RawMessage::new(Command::Monitor, true, payload)]);
            }
            return Ok(vec![reply]);
        }
        if request.subcommand & subcommand::DESTROY != 0 {
            self.operations.remove(&ioid);
            self.monitors.remove(&ioid);
            return Ok(Vec::new());
        }
        if request.subcommand & subcommand::STOP != 0 {
            let start = request.subcommand & subcommand::GET != 0;
            let Some(Operation {
                kind: OperationKind::Monitor(state),
                ..
            }) = self.operations.get_mut(&ioid)
            else {
                return Ok(Vec::new());
            };
            state.running = start;
            if !start {
                debug!("Stopped monitor {ioid}");
                return Ok(Vec::new());
            }
            // Everything, since this client may have missed any of it
            state.last_sent = None;
            debug!("Started monitor {ioid}");
            return Ok(self.monitor_value(ioid, None).into_iter().collect());
        }
        // Pipeline acknowledgements need no reply
        Ok(Vec::new())
    }

    fn start_stream(&mut self, sid: u32, ioid: u32) -> Result<(), ServerError> {
        let name = self.channel_name(sid)?;
        let receiver = self.provider.monitor_value(&name)?;
        let stream = BroadcastStream::new(receiver)
            .map(|update| match update {
                Ok(value) => MonitorUpdate::Value(value),
                Err(BroadcastStreamRecvError::Lagged(count)) => MonitorUpdate::Lagged(count),
            })
            .chain(tokio_stream::once(MonitorUpdate::Closed));
        self.monitors.insert(ioid, Box::pin(stream));
        Ok(())
    }

    fn handle_update(&mut self, ioid: u32, update: MonitorUpdate) -> Vec<RawMessage> {
        match update {
            MonitorUpdate::Value(value) => self.monitor_value(ioid, Some(value)).into_iter().collect(),
            MonitorUpdate::Lagged(count) => {
                debug!("Monitor {ioid} missed {count} updates");
                if let Some(Operation {
                    kind: OperationKind::Monitor(state),
                    ..
                }) = self.operations.get_mut(&ioid)
                {
                    state.lagged = true;
                }
                self.monitor_value(ioid, None).into_iter().collect()
            }
            MonitorUpdate::Closed => self.monitor_closed(ioid),
        }
    }

    /// Send a monitor update, if it is running and anything changed
    ///
    /// Without a `value`, the current value is read from the provider.
    fn monitor_value(&mut self, ioid: u32, value: Option<Structure>) -> Option<RawMessage> {
        let op = self.operations.get(&ioid)?;
        let sid = op.sid;
        let paths = op.paths.clone();
        let selected = match value {
            Some(value) => value.select(&paths).map_err(ServerError::from),
            None => self.read_selected(sid, &paths),
        };
        let selected = match selected {
            Ok(selected) => selected,
            Err(e) => {
                warn!("Cannot update monitor {ioid}: {e}");
                return None;
            }
        };
        let Some(Operation {
            kind: OperationKind::Monitor(state),
            ..
        }) = self.operations.get_mut(&ioid)
        else {
            return None;
        };
        if !state.running {
            return None;
        }
        let changes = match state.last_sent.as_mut() {
            None => {
                state.last_sent = Some(selected);
                [0].into_iter().collect()
            }
            Some(last_sent) => match last_sent.update(&selected) {
                Ok(changes) => changes,
                Err(e) => {
                    warn!("Value of monitor {ioid} changed layout: {e}");
                    state.last_sent = Some(selected);
                    [0].into_iter().collect()
                }
            },
        };
        if changes.is_empty() {
            return None;
        }
        // After a lag, any changed field may have changed more than once
        let overruns = if std::mem::take(&mut state.lagged) {
            changes.clone()
        } else {
            BitSet::new()
        };
        let last_sent = state.last_sent.as_ref()?;

        let mut payload = Vec::new();
        OperationResponse {
            ioid,
            subcommand: subcommand::EXECUTE,
        }
        .encode(&mut payload);
        encode_bitset(&changes, &mut payload);
        if let Err(e) = last_sent.encode_elements(&changes, &mut payload, &mut self.sent_types) {
            warn!("Cannot encode monitor {ioid}: {e}");
            return None;
        }
        encode_bitset(&overruns, &mut payload);
        Some(RawMessage::new(Command::Monitor, true, payload))
    }

    /// The PV behind a monitor has gone away
    fn monitor_closed(&mut self, ioid: u32) -> Vec<RawMessage> {
        let Some(op) = self.operations.remove(&ioid) else {
            return Vec::new();
        };
        let name = self.channel_name(op.sid).unwrap_or_default();
        debug!("Ending monitor {ioid} of {name}");
        let mut messages = vec![RawMessage::new(
            Command::Monitor,
            true,
            operation_response(
                ioid,
                subcommand::DESTROY,
                &error_status(ServerError::Closed(name.clone())),
            ),
        )];
        // Without the PV the channel is gone too
        if !self.provider.provides(&name)
            && let Some(channel) = self.channels.remove(&op.sid)
        {
            self.drop_operations(op.sid);
            messages.push(
                DestroyChannel {
                    sid: op.sid,
                    cid: channel.cid,
                }
                .to_message(true),
            );
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> Structure {
        Structure::new(
            "",
            "",
            vec![
                PvaData::double("value", 1.0),
                Structure::new(
                    "alarm",
                    "alarm_t",
                    vec![PvaData::int("severity", 0), PvaData::string("message", "")],
                )
                .unwrap()
                .into(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_apply_put_leaf() {
        let current = current();
        let mut sent = current.select(&["alarm.message"]).unwrap();
        sent.locate_mut("alarm.message").unwrap().set_value("HIGH").unwrap();
        let changes: BitSet = [2].into_iter().collect();
        let (proposed, proposed_changes) = apply_put(&current, &sent, &changes).unwrap();
        assert_eq!(proposed.locate("alarm.message").unwrap().as_str(), Some("HIGH"));
        assert_eq!(proposed.get("value").unwrap().as_f64(), Some(1.0));
        assert_eq!(proposed_changes.iter().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_apply_put_whole() {
        let current = current();
        let mut sent = current.select(&["value", "alarm.severity"]).unwrap();
        sent.get_mut("value").unwrap().set_value(5.0).unwrap();
        sent.locate_mut("alarm.severity").unwrap().set_value(2).unwrap();
        let changes: BitSet = [0].into_iter().collect();
        let (proposed, proposed_changes) = apply_put(&current, &sent, &changes).unwrap();
        assert_eq!(proposed.get("value").unwrap().as_f64(), Some(5.0));
        assert_eq!(proposed.locate("alarm.severity").unwrap().as_i64(), Some(2));
        assert_eq!(proposed.locate("alarm.message").unwrap().as_str(), Some(""));
        assert_eq!(proposed_changes.iter().collect::<Vec<_>>(), vec![1, 2]);
    }
}
