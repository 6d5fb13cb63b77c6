use std::{
    cmp::max,
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf, split},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, debug_span, error, info, trace, warn};

use crate::{
    client::{ClientError, MonitorEvent, subscription::MonitorSender},
    codec::{BitSet, Reader, encode_bitset},
    data::{DataError, Element, PvaData, Structure, TypeRegistry},
    messages::{
        Authentication, Command, CreateChannel, CreateChannelResponse, DestroyChannel,
        GetFieldRequest, MessageError, OperationRequest, OperationResponse, PvaCodec, PvaMessage,
        RawMessage, RequestControl, ServerMessage, Status, StatusType, Validated,
        ValidationRequest, ValidationResponse, control, subcommand,
    },
    request::FieldRequest,
};

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

pub(crate) enum CircuitRequest {
    CreateChannel {
        cid: u32,
        name: String,
        reply: Reply<u32>,
        /// Dropped when the server destroys the channel, or the circuit closes
        destroyed: oneshot::Sender<()>,
    },
    DestroyChannel {
        cid: u32,
        sid: u32,
    },
    /// Fetch the type of a channel, or of one field of it
    GetField {
        sid: u32,
        ioid: u32,
        sub_field: String,
        reply: Reply<PvaData>,
    },
    Get {
        sid: u32,
        ioid: u32,
        request: FieldRequest,
        reply: Reply<Structure>,
    },
    Put {
        sid: u32,
        ioid: u32,
        request: FieldRequest,
        value: PvaData,
        reply: Reply<()>,
    },
    /// Start a monitor. Events go to `events` until it is cancelled.
    Monitor {
        sid: u32,
        ioid: u32,
        request: FieldRequest,
        events: MonitorSender,
        reply: Option<Reply<()>>,
    },
    /// Abandon an operation that has not finished
    Cancel {
        sid: u32,
        ioid: u32,
    },
}

/// A validated connection to one server
#[derive(Debug, Clone)]
pub(crate) struct Circuit {
    pub(crate) address: SocketAddr,
    pub(crate) cancel: CancellationToken,
    requests_tx: mpsc::UnboundedSender<CircuitRequest>,
}

impl Circuit {
    pub(crate) async fn connect(
        address: &SocketAddr,
        connection_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Circuit, ClientError> {
        debug!("Connecting new Circuit to {address}");
        let tcp = TcpStream::connect(address).await?;
        tcp.set_nodelay(true)?;
        let (tcp_rx, mut tcp_tx) = split(tcp);
        let mut framed = FramedRead::with_capacity(tcp_rx, PvaCodec, 16384usize);

        tokio::time::timeout(
            connection_timeout,
            Self::validate(&mut framed, &mut tcp_tx),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout(address.to_string()))??;
        debug!("Circuit to {address} validated");

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let inner_cancel = cancel.clone();
        let inner_address = *address;
        tokio::spawn(async move {
            CircuitInternal {
                address: inner_address,
                requests_rx,
                cancel: inner_cancel,
                activity_period: connection_timeout / 2,
                last_echo_sent_at: Instant::now(),
                last_received_message_at: Instant::now(),
                types: TypeRegistry::new(),
                sent_types: TypeRegistry::new(),
                channels: Default::default(),
                operations: Default::default(),
            }
            .circuit_lifecycle(framed, tcp_tx)
            .await;
        });

        Ok(Circuit {
            address: *address,
            cancel,
            requests_tx,
        })
    }

    /// Answer the server's validation request, and wait for it to accept us
    async fn validate(
        framed: &mut FramedRead<ReadHalf<TcpStream>, PvaCodec>,
        tcp_tx: &mut WriteHalf<TcpStream>,
    ) -> Result<(), ClientError> {
        loop {
            let message = framed.next().await.ok_or(ClientError::Disconnected)??;
            if message.header.is_control() {
                continue;
            }
            match message.command()? {
                Command::ConnectionValidation => {
                    let request = ValidationRequest::from_message(&message)?;
                    let auth = if request.auth_methods.iter().any(|m| m == "ca") {
                        Authentication::from_environment()
                    } else {
                        Authentication::Anonymous
                    };
                    debug!("Server offers {:?}, identifying as {auth:?}", request.auth_methods);
                    RawMessage::write_all_messages(
                        &[ValidationResponse::new(auth).to_message(false)],
                        tcp_tx,
                    )
                    .await?;
                }
                Command::ConnectionValidated => {
                    let validated = Validated::from_message(&message)?;
                    return if validated.status.is_success() {
                        Ok(())
                    } else {
                        Err(ClientError::ValidationFailed(validated.status.to_string()))
                    };
                }
                other => debug!("Ignoring {other:?} before validation"),
            }
        }
    }

    pub(crate) fn send(&self, request: CircuitRequest) -> Result<(), ClientError> {
        self.requests_tx
            .send(request)
            .map_err(|_| ClientError::Disconnected)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.requests_tx.is_closed()
    }
}

struct ChannelEntry {
    name: String,
    sid: Option<u32>,
    reply: Option<Reply<u32>>,
    _destroyed: oneshot::Sender<()>,
}

struct MonitorOperation {
    sid: u32,
    template: Option<Structure>,
    events: MonitorSender,
    reply: Option<Reply<()>>,
}

enum Operation {
    GetField {
        sid: u32,
        reply: Reply<PvaData>,
    },
    Get {
        sid: u32,
        template: Option<Structure>,
        reply: Reply<Structure>,
    },
    Put {
        sid: u32,
        template: Option<Structure>,
        value: PvaData,
        reply: Reply<()>,
    },
    Monitor(MonitorOperation),
}

impl Operation {
    fn sid(&self) -> u32 {
        match self {
            Operation::GetField { sid, .. }
            | Operation::Get { sid, .. }
            | Operation::Put { sid, .. } => *sid,
            Operation::Monitor(monitor) => monitor.sid,
        }
    }
}

// Inner circuit state, used to hold async management data
struct CircuitInternal {
    /// A copy of the address we are connected to
    address: SocketAddr,
    /// When the last message was received. Used to calculate Echo timing.
    last_received_message_at: Instant,
    last_echo_sent_at: Instant,
    activity_period: Duration,
    requests_rx: mpsc::UnboundedReceiver<CircuitRequest>,
    cancel: CancellationToken,
    /// Types the server has described to us
    types: TypeRegistry,
    /// Types we have described to the server
    sent_types: TypeRegistry,
    channels: HashMap<u32, ChannelEntry>,
    operations: HashMap<u32, Operation>,
}

impl CircuitInternal {
    async fn circuit_lifecycle(
        &mut self,
        mut framed: FramedRead<ReadHalf<TcpStream>, PvaCodec>,
        mut tcp_tx: WriteHalf<TcpStream>,
    ) {
        debug!("Started circuit to {}", self.address);
        loop {
            let next_timing_stop =
                max(self.last_echo_sent_at, self.last_received_message_at) + self.activity_period;
            let messages_out = select! {
                _ = self.cancel.cancelled() => break,
                incoming = framed.next() => match incoming {
                    Some(Ok(message)) => match self.handle_message(message) {
                        Ok(messages) => messages,
                        Err(e) => {
                            error!("Server {} sent an invalid message, closing: {e}", self.address);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        error!("Got error reading from server {}: {e}", self.address);
                        break;
                    },
                    None => break,
                },
                request = self.requests_rx.recv() => match request {
                    None => break,
                    Some(req) => self.handle_request(req),
                },
                _ = tokio::time::sleep_until(next_timing_stop.into()) => {
                    if self.last_echo_sent_at <= self.last_received_message_at {
                        self.last_echo_sent_at = Instant::now();
                        vec![RawMessage::new(Command::Echo, false, Vec::new())]
                    } else {
                        // We sent an echo already, this is the termination time
                        error!("Received no reply from server, assuming connection dead");
                        break
                    }
                },
            };

            if !messages_out.is_empty() {
                for message in &messages_out {
                    trace!("Sending {:?}", message.header);
                }
                if let Err(e) = RawMessage::write_all_messages(&messages_out, &mut tcp_tx).await {
                    error!("Failed to write messages to io stream, aborting: {e}");
                    break;
                }
            }
        }
        debug!("Circuit to {} closing", self.address);
        self.cancel.cancel();
        let _ = tcp_tx.shutdown().await;
    }

    fn handle_request(&mut self, request: CircuitRequest) -> Vec<RawMessage> {
        match request {
            CircuitRequest::CreateChannel {
                cid,
                name,
                reply,
                destroyed,
            } => {
                let _span = debug_span!("handle_request", cid = cid).entered();
                debug!("Creating channel '{name}'");
                let message = CreateChannel {
                    channels: vec![(cid, name.clone())],
                }
                .to_message(false);
                self.channels.insert(
                    cid,
                    ChannelEntry {
                        name,
                        sid: None,
                        reply: Some(reply),
                        _destroyed: destroyed,
                    },
                );
                vec![message]
            }
            CircuitRequest::DestroyChannel { cid, sid } => {
                let _span = debug_span!("handle_request", cid = cid).entered();
                self.channels.remove(&cid);
                self.operations.retain(|_, op| op.sid() != sid);
                vec![DestroyChannel { sid, cid }.to_message(false)]
            }
            CircuitRequest::GetField {
                sid,
                ioid,
                sub_field,
                reply,
            } => {
                self.operations
                    .insert(ioid, Operation::GetField { sid, reply });
                vec![
                    GetFieldRequest {
                        sid,
                        ioid,
                        sub_field,
                    }
                    .to_message(false),
                ]
            }
            CircuitRequest::Get {
                sid,
                ioid,
                request,
                reply,
            } => match self.init_message(Command::Get, sid, ioid, &request) {
                Ok(message) => {
                    self.operations.insert(
                        ioid,
                        Operation::Get {
                            sid,
                            template: None,
                            reply,
                        },
                    );
                    vec![message]
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                    Vec::new()
                }
            },
            CircuitRequest::Put {
                sid,
                ioid,
                request,
                value,
                reply,
            } => match self.init_message(Command::Put, sid, ioid, &request) {
                Ok(message) => {
                    self.operations.insert(
                        ioid,
                        Operation::Put {
                            sid,
                            template: None,
                            value,
                            reply,
                        },
                    );
                    vec![message]
                }
                Err(e) => {
                    let _ = reply.send(Err(e.into()));
                    Vec::new()
                }
            },
            CircuitRequest::Monitor {
                sid,
                ioid,
                request,
                events,
                reply,
            } => match self.init_message(Command::Monitor, sid, ioid, &request) {
                Ok(message) => {
                    debug!("Starting monitor {ioid} with {request}");
                    self.operations.insert(
                        ioid,
                        Operation::Monitor(MonitorOperation {
                            sid,
                            template: None,
                            events,
                            reply,
                        }),
                    );
                    vec![message]
                }
                Err(e) => {
                    warn!("Could not start monitor: {e}");
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(e.into()));
                    }
                    Vec::new()
                }
            },
            CircuitRequest::Cancel { sid, ioid } => match self.operations.remove(&ioid) {
                Some(_) => {
                    trace!("Cancelling operation {ioid}");
                    vec![RequestControl { sid, ioid }.destroy(false)]
                }
                None => Vec::new(),
            },
        }
    }

    /// The INIT request for an operation, carrying its pvRequest
    fn init_message(
        &mut self,
        command: Command,
        sid: u32,
        ioid: u32,
        request: &FieldRequest,
    ) -> Result<RawMessage, DataError> {
        let mut payload = Vec::new();
        OperationRequest {
            sid,
            ioid,
            subcommand: subcommand::INIT,
        }
        .encode(&mut payload);
        request.encode(&mut payload, &mut self.sent_types)?;
        Ok(RawMessage::new(command, false, payload))
    }

    /// Read the type description that follows a successful INIT status
    fn decode_template(&mut self, reader: &mut Reader) -> Result<Structure, MessageError> {
        match self.types.decode_type("", reader)? {
            Some(PvaData::Structure(template)) => Ok(template),
            Some(other) => Err(MessageError::InvalidField(
                "type".to_string(),
                other.type_name(),
            )),
            None => Err(MessageError::InvalidField(
                "type".to_string(),
                "null".to_string(),
            )),
        }
    }

    fn handle_message(&mut self, message: RawMessage) -> Result<Vec<RawMessage>, MessageError> {
        self.last_received_message_at = Instant::now();
        if message.header.is_control() {
            if message.header.command != control::SET_BYTE_ORDER {
                trace!("Ignoring control message {}", message.header.command);
            }
            return Ok(Vec::new());
        }
        let command = match message.command() {
            Ok(command) => command,
            Err(e) => {
                debug!("Ignoring message from server: {e}");
                return Ok(Vec::new());
            }
        };
        trace!("Received {command:?}");
        let mut reader = message.reader();
        match command {
            // Echo just bumps our last_received message time
            Command::Echo => Ok(Vec::new()),
            Command::CreateChannel => {
                let response = CreateChannelResponse::decode_payload(&mut reader)?;
                self.handle_create_channel(response);
                Ok(Vec::new())
            }
            Command::DestroyChannel => {
                let msg = DestroyChannel::decode_payload(&mut reader)?;
                if let Some(entry) = self.channels.remove(&msg.cid) {
                    debug!("Server destroyed channel '{}'", entry.name);
                    self.operations.retain(|_, op| op.sid() != msg.sid);
                }
                Ok(Vec::new())
            }
            Command::GetField => {
                let ioid = reader.get_u32()?;
                let status = Status::decode(&mut reader)?;
                let Some(Operation::GetField { reply, .. }) = self.take_operation(ioid, |op| {
                    matches!(op, Operation::GetField { .. })
                }) else {
                    return Ok(Vec::new());
                };
                if !status.is_success() {
                    let _ = reply.send(Err(ClientError::Server(status)));
                    return Ok(Vec::new());
                }
                let field = self
                    .types
                    .decode_type("", &mut reader)?
                    .ok_or_else(|| MessageError::InvalidField("type".into(), "null".into()))?;
                let _ = reply.send(Ok(field));
                Ok(Vec::new())
            }
            Command::Get => self.handle_get(&mut reader),
            Command::Put => self.handle_put(&mut reader),
            Command::Monitor => self.handle_monitor(&mut reader),
            Command::Message => {
                let msg = ServerMessage::decode_payload(&mut reader)?;
                match msg.kind {
                    StatusType::Ok => info!("Server {}: {}", self.address, msg.message),
                    StatusType::Warning => warn!("Server {}: {}", self.address, msg.message),
                    StatusType::Error | StatusType::Fatal => {
                        error!("Server {}: {}", self.address, msg.message)
                    }
                }
                Ok(Vec::new())
            }
            other => {
                debug!("Got unhandled message from server: {other:?}");
                Ok(Vec::new())
            }
        }
    }

    /// Remove an operation if it is of the expected kind
    fn take_operation(
        &mut self,
        ioid: u32,
        expected: impl Fn(&Operation) -> bool,
    ) -> Option<Operation> {
        match self.operations.get(&ioid) {
            Some(op) if expected(op) => self.operations.remove(&ioid),
            Some(_) => {
                warn!("Response for operation {ioid} does not match its request");
                None
            }
            None => {
                debug!("Got response for unknown or cancelled operation {ioid}");
                None
            }
        }
    }

    fn handle_create_channel(&mut self, response: CreateChannelResponse) {
        let _span = debug_span!("handle_message", cid = response.cid).entered();
        if !response.status.is_success() {
            if let Some(mut entry) = self.channels.remove(&response.cid) {
                warn!("Server refused channel '{}': {}", entry.name, response.status);
                if let Some(reply) = entry.reply.take() {
                    let _ = reply.send(Err(ClientError::ChannelCreateFailed(
                        response.status.message,
                    )));
                }
            }
            return;
        }
        let Some(entry) = self.channels.get_mut(&response.cid) else {
            debug!("Got message for closed/uncreated channel: {response:?}");
            return;
        };
        debug!("Channel '{}' has sid {}", entry.name, response.sid);
        entry.sid = Some(response.sid);
        if let Some(reply) = entry.reply.take() {
            let _ = reply.send(Ok(response.sid));
        }
    }

    fn handle_get(&mut self, reader: &mut Reader) -> Result<Vec<RawMessage>, MessageError> {
        let response = OperationResponse::decode(reader)?;
        let ioid = response.ioid;
        let Some(Operation::Get {
            sid,
            template,
            reply,
        }) = self.take_operation(ioid, |op| matches!(op, Operation::Get { .. }))
        else {
            return Ok(Vec::new());
        };
        let status = Status::decode(reader)?;
        if !status.is_success() {
            let _ = reply.send(Err(ClientError::Server(status)));
            return Ok(Vec::new());
        }
        if response.subcommand & subcommand::INIT != 0 {
            let template = self.decode_template(reader)?;
            self.operations.insert(
                ioid,
                Operation::Get {
                    sid,
                    template: Some(template),
                    reply,
                },
            );
            return Ok(vec![self.exec_message(Command::Get, sid, ioid, Vec::new())]);
        }
        let Some(mut value) = template else {
            return Err(MessageError::InvalidField(
                "subcommand".into(),
                response.subcommand.to_string(),
            ));
        };
        let changes = reader.get_bitset()?;
        value.decode_elements(&changes, &mut self.types, reader)?;
        let _ = reply.send(Ok(value));
        Ok(Vec::new())
    }

    fn handle_put(&mut self, reader: &mut Reader) -> Result<Vec<RawMessage>, MessageError> {
        let response = OperationResponse::decode(reader)?;
        let ioid = response.ioid;
        let Some(Operation::Put {
            sid,
            template,
            value,
            reply,
        }) = self.take_operation(ioid, |op| matches!(op, Operation::Put { .. }))
        else {
            return Ok(Vec::new());
        };
        let status = Status::decode(reader)?;
        if !status.is_success() {
            let _ = reply.send(Err(ClientError::Server(status)));
            return Ok(Vec::new());
        }
        if response.subcommand & subcommand::INIT == 0 {
            let _ = reply.send(Ok(()));
            return Ok(Vec::new());
        }

        let mut template = self.decode_template(reader)?;
        let changes = match fill_template(&mut template, &value) {
            Ok(changes) => changes,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return Ok(vec![RequestControl { sid, ioid }.destroy(false)]);
            }
        };
        let mut payload = Vec::new();
        encode_bitset(&changes, &mut payload);
        if let Err(e) = template.encode_elements(&changes, &mut payload, &mut self.sent_types) {
            let _ = reply.send(Err(e.into()));
            return Ok(vec![RequestControl { sid, ioid }.destroy(false)]);
        }
        self.operations.insert(
            ioid,
            Operation::Put {
                sid,
                template: Some(template),
                value,
                reply,
            },
        );
        Ok(vec![self.exec_message(Command::Put, sid, ioid, payload)])
    }

    fn handle_monitor(&mut self, reader: &mut Reader) -> Result<Vec<RawMessage>, MessageError> {
        let response = OperationResponse::decode(reader)?;
        let ioid = response.ioid;
        let Some(Operation::Monitor(mut monitor)) =
            self.take_operation(ioid, |op| matches!(op, Operation::Monitor(_)))
        else {
            return Ok(Vec::new());
        };
        let sid = monitor.sid;

        if response.subcommand & subcommand::INIT != 0 {
            let status = Status::decode(reader)?;
            if !status.is_success() {
                warn!("Server refused monitor {ioid}: {status}");
                if let Some(reply) = monitor.reply.take() {
                    let _ = reply.send(Err(ClientError::Server(status)));
                }
                return Ok(Vec::new());
            }
            monitor.template = Some(self.decode_template(reader)?);
            if let Some(reply) = monitor.reply.take() {
                let _ = reply.send(Ok(()));
            }
            self.operations.insert(ioid, Operation::Monitor(monitor));
            let mut payload = Vec::new();
            OperationRequest {
                sid,
                ioid,
                subcommand: subcommand::START,
            }
            .encode(&mut payload);
            return Ok(vec![RawMessage::new(Command::Monitor, false, payload)]);
        }
        if response.subcommand & subcommand::DESTROY != 0 {
            let status = Status::decode(reader)?;
            debug!("Server ended monitor {ioid}: {status}");
            return Ok(Vec::new());
        }

        let Some(template) = monitor.template.as_mut() else {
            return Err(MessageError::InvalidField(
                "subcommand".into(),
                response.subcommand.to_string(),
            ));
        };
        let changes = reader.get_bitset()?;
        template.decode_elements(&changes, &mut self.types, reader)?;
        let overruns = reader.get_bitset()?;

        let event = MonitorEvent {
            changes,
            overruns,
            overrun_count: 0,
            value: template.clone(),
        };
        if monitor.events.deliver(event).is_err() {
            debug!("No more listeners for monitor {ioid}: Cancelling");
            return Ok(vec![RequestControl { sid, ioid }.destroy(false)]);
        }
        self.operations.insert(ioid, Operation::Monitor(monitor));
        Ok(Vec::new())
    }

    /// Execute an operation, destroying it on the server afterwards
    fn exec_message(&self, command: Command, sid: u32, ioid: u32, body: Vec<u8>) -> RawMessage {
        let mut payload = Vec::with_capacity(9 + body.len());
        OperationRequest {
            sid,
            ioid,
            subcommand: subcommand::DESTROY,
        }
        .encode(&mut payload);
        payload.extend_from_slice(&body);
        RawMessage::new(command, false, payload)
    }
}

/// Place a value to be written into the put template, returning the fields set
///
/// Structures are assigned field by field. Anything else goes into the
/// `value` field, or into the only field of the template if it has no
/// `value`.
fn fill_template(template: &mut Structure, value: &PvaData) -> Result<BitSet, DataError> {
    let mut changes = BitSet::new();
    if let PvaData::Structure(fields) = value {
        template.assign(fields)?;
        changes.set(0);
        return Ok(changes);
    }
    let index = match template.index_of_path("value") {
        Ok(index) => index,
        Err(_) => {
            let leaves: Vec<usize> = (1..=template.descendant_count())
                .filter(|i| {
                    matches!(
                        template.get_index(*i),
                        Some(Element::Field(field)) if field.as_structure().is_none()
                    )
                })
                .collect();
            match leaves[..] {
                [index] => index,
                _ => {
                    return Err(DataError::Incompatible(
                        "Write needs a 'value' field, or a single field request".to_string(),
                    ));
                }
            }
        }
    };
    template
        .get_index_mut(index)
        .ok_or(DataError::InvalidIndex(index))?
        .assign(value)?;
    changes.set(index);
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> Structure {
        Structure::new(
            "",
            "",
            vec![
                PvaData::double("value", 0.0),
                Structure::new("alarm", "", vec![PvaData::int("severity", 0)])
                    .unwrap()
                    .into(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_fill_value() {
        let mut value = template();
        let changes = fill_template(&mut value, &PvaData::int("", 4)).unwrap();
        assert_eq!(changes.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(value.get("value").unwrap().as_f64(), Some(4.0));

        let mut value = template();
        assert!(fill_template(&mut value, &PvaData::string("", "1e3")).is_ok());
        assert_eq!(value.get("value").unwrap().as_f64(), Some(1000.0));
        assert!(fill_template(&mut value, &PvaData::string("", "lots")).is_err());
    }

    #[test]
    fn test_fill_single_field() {
        let mut value = template().select(&["alarm.severity"]).unwrap();
        let changes = fill_template(&mut value, &PvaData::int("", 2)).unwrap();
        assert_eq!(changes.iter().collect::<Vec<_>>(), vec![2]);
        assert_eq!(value.locate("alarm.severity").unwrap().as_i64(), Some(2));

        let mut value = template().select(&["alarm"]).unwrap();
        assert!(fill_template(&mut value, &PvaData::int("", 2)).is_ok());
        let mut value = Structure::new("", "", vec![PvaData::int("a", 0), PvaData::int("b", 0)]).unwrap();
        assert!(fill_template(&mut value, &PvaData::int("", 2)).is_err());
    }

    #[test]
    fn test_fill_structure() {
        let mut value = template();
        let mut other = template();
        other.locate_mut("alarm.severity").unwrap().set_value(3).unwrap();
        let changes = fill_template(&mut value, &other.clone().into()).unwrap();
        assert_eq!(changes.iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(value, other);
    }
}
