use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    select,
    sync::{oneshot, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::{
        ClientError, MonitorEvent, Subscription,
        circuit::{Circuit, CircuitRequest},
        client::{ClientInner, IdPool},
        subscription::{MonitorSender, spawn_listener},
    },
    data::{PvaData, Structure},
    request::FieldRequest,
};

/// Pause before retrying a server that could not be connected to
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Looking for a server that hosts the channel
    Searching,
    /// Found a server, creating the channel on it
    Connecting,
    Connected,
    /// Lost the server. Searching will start again.
    Disconnected,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
struct Connection {
    circuit: Circuit,
    sid: u32,
}

struct Monitor {
    request: FieldRequest,
    events: MonitorSender,
}

#[derive(Default)]
struct ChannelConn {
    connection: Option<Connection>,
    /// Monitors by ioid, restarted on every new connection
    subscriptions: HashMap<u32, Monitor>,
}

struct ChannelInner {
    name: String,
    cid: u32,
    client: Arc<ClientInner>,
    state: watch::Sender<ChannelState>,
    conn: Mutex<ChannelConn>,
    close: CancellationToken,
}

/// Closes the channel once the last user handle is gone
struct ChannelHandle(Arc<ChannelInner>);

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.0.close.cancel();
    }
}

/// A named process variable on some server
///
/// The channel finds its server and connects in the background, and
/// reconnects whenever the connection is lost, until it is closed.
/// Clones refer to the same channel.
#[derive(Clone)]
pub struct Channel {
    handle: Arc<ChannelHandle>,
}

impl Channel {
    pub(crate) fn new(client: Arc<ClientInner>, name: &str) -> Channel {
        let inner = Arc::new(ChannelInner {
            name: name.to_string(),
            cid: client.next_cid(),
            close: client.cancel.child_token(),
            client,
            state: watch::Sender::new(ChannelState::Searching),
            conn: Default::default(),
        });
        tokio::spawn(inner.clone().lifecycle());
        Channel {
            handle: Arc::new(ChannelHandle(inner)),
        }
    }

    fn inner(&self) -> &ChannelInner {
        &self.handle.0
    }

    pub fn name(&self) -> &str {
        &self.inner().name
    }

    pub fn state(&self) -> ChannelState {
        *self.inner().state.borrow()
    }

    /// Follow the connection state
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner().state.subscribe()
    }

    /// Wait for the channel to connect, up to the client connect timeout
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connect_within(self.inner().client.connect_timeout).await
    }

    pub async fn connect_within(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut state = self.watch_state();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| {
                matches!(
                    s,
                    ChannelState::Connected | ChannelState::Closing | ChannelState::Closed
                )
            }),
        )
        .await;
        match reached {
            Err(_) => Err(ClientError::ConnectTimeout(self.name().to_string())),
            Ok(Err(_)) => Err(ClientError::ChannelClosed),
            Ok(Ok(state)) if *state == ChannelState::Connected => Ok(()),
            Ok(Ok(_)) => Err(ClientError::ChannelClosed),
        }
    }

    /// Read the fields selected by `request`. An empty request reads everything.
    pub async fn read(&self, request: &str) -> Result<Structure, ClientError> {
        let request = FieldRequest::parse(request)?;
        trace!("Reading {} {request}", self.name());
        self.request(|sid, ioid, reply| CircuitRequest::Get {
            sid,
            ioid,
            request,
            reply,
        })
        .await
    }

    /// Write a value into the fields selected by `request`
    ///
    /// A structure is written field by field. Any other value goes into the
    /// `value` field, or the one field selected, converted to its type.
    pub async fn write(&self, request: &str, value: impl Into<PvaData>) -> Result<(), ClientError> {
        let request = FieldRequest::parse(request)?;
        let value = value.into();
        trace!("Writing {} {request}", self.name());
        self.request(|sid, ioid, reply| CircuitRequest::Put {
            sid,
            ioid,
            request,
            value,
            reply,
        })
        .await
    }

    /// The type of the channel, or of one field when `sub_field` is a path
    pub async fn info(&self, sub_field: &str) -> Result<PvaData, ClientError> {
        let sub_field = sub_field.to_string();
        self.request(|sid, ioid, reply| CircuitRequest::GetField {
            sid,
            ioid,
            sub_field,
            reply,
        })
        .await
    }

    /// Monitor the fields selected by `request`
    ///
    /// `listener` runs on a dedicated thread, once for every update. The
    /// first event after each connection holds the complete value.
    pub fn subscribe<F>(&self, request: &str, listener: F) -> Result<Subscription, ClientError>
    where
        F: FnMut(MonitorEvent) + Send + 'static,
    {
        let request = FieldRequest::parse(request)?;
        if matches!(self.state(), ChannelState::Closing | ChannelState::Closed) {
            return Err(ClientError::ChannelClosed);
        }
        let events = spawn_listener(listener)?;
        let ioid = self.inner().client.ids.acquire();

        let mut conn = self.inner().lock();
        if let Some(connection) = &conn.connection
            && connection
                .circuit
                .send(CircuitRequest::Monitor {
                    sid: connection.sid,
                    ioid,
                    request: request.clone(),
                    events: events.clone(),
                    reply: None,
                })
                .is_err()
        {
            debug!("Circuit closed while subscribing, will subscribe on reconnect");
        }
        conn.subscriptions.insert(ioid, Monitor { request, events });
        drop(conn);
        Ok(Subscription::new(self.clone(), ioid))
    }

    pub(crate) fn unsubscribe(&self, ioid: u32) {
        let mut conn = self.inner().lock();
        // Closing the channel already released everything
        if conn.subscriptions.remove(&ioid).is_none() {
            return;
        }
        if let Some(connection) = &conn.connection {
            let _ = connection.circuit.send(CircuitRequest::Cancel {
                sid: connection.sid,
                ioid,
            });
        }
        drop(conn);
        self.inner().client.ids.release(ioid);
    }

    /// Close the channel, and wait for it to be released on the server
    pub async fn close(&self) {
        self.inner().close.cancel();
        let mut state = self.watch_state();
        let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Send one operation, once connected, and wait for the outcome
    async fn request<T>(
        &self,
        build: impl FnOnce(u32, u32, oneshot::Sender<Result<T, ClientError>>) -> CircuitRequest,
    ) -> Result<T, ClientError> {
        self.connect().await?;
        let connection = self
            .inner()
            .lock()
            .connection
            .clone()
            .ok_or(ClientError::Disconnected)?;
        let guard = RequestGuard::new(self.inner().client.ids.clone(), &connection);
        let (reply, result) = oneshot::channel();
        connection
            .circuit
            .send(build(connection.sid, guard.ioid, reply))?;
        let result = result.await.map_err(|_| ClientError::Disconnected)?;
        guard.finish();
        result
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Holds the id of an operation in flight
///
/// Dropped before the operation finishes, the operation is cancelled on
/// the server.
struct RequestGuard {
    ioid: u32,
    sid: u32,
    circuit: Circuit,
    ids: Arc<IdPool>,
    finished: bool,
}

impl RequestGuard {
    fn new(ids: Arc<IdPool>, connection: &Connection) -> RequestGuard {
        RequestGuard {
            ioid: ids.acquire(),
            sid: connection.sid,
            circuit: connection.circuit.clone(),
            ids,
            finished: false,
        }
    }
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.circuit.send(CircuitRequest::Cancel {
                sid: self.sid,
                ioid: self.ioid,
            });
        }
        self.ids.release(self.ioid);
    }
}

impl ChannelInner {
    fn lock(&self) -> MutexGuard<'_, ChannelConn> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ChannelState) {
        trace!("Channel {} is {state}", self.name);
        self.state.send_replace(state);
    }

    async fn lifecycle(self: Arc<Self>) {
        loop {
            self.set_state(ChannelState::Searching);
            let address = select! {
                _ = self.close.cancelled() => break,
                found = self.client.searcher.search_for(&self.name) => match found {
                    Ok(address) => address,
                    Err(e) => {
                        debug!("Search for {} ended: {e}", self.name);
                        select! {
                            _ = self.close.cancelled() => break,
                            _ = tokio::time::sleep(RETRY_DELAY) => continue,
                        }
                    }
                },
            };

            self.set_state(ChannelState::Connecting);
            let opened = select! {
                _ = self.close.cancelled() => break,
                opened = self.open_on(address) => opened,
            };
            let (connection, destroyed) = match opened {
                Ok(opened) => opened,
                Err(e) => {
                    warn!("Failed to connect {} on {address}: {e}", self.name);
                    select! {
                        _ = self.close.cancelled() => break,
                        _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    }
                }
            };
            self.start_monitors(connection.clone());
            debug!("Channel {} connected to {address}", self.name);
            self.set_state(ChannelState::Connected);

            select! {
                _ = self.close.cancelled() => {
                    self.set_state(ChannelState::Closing);
                    let _ = connection.circuit.send(CircuitRequest::DestroyChannel {
                        cid: self.cid,
                        sid: connection.sid,
                    });
                    break;
                }
                _ = connection.circuit.cancel.cancelled() => debug!("Lost circuit for {}", self.name),
                _ = destroyed => debug!("Server destroyed {}", self.name),
            }
            self.lock().connection = None;
            self.set_state(ChannelState::Disconnected);
        }

        self.set_state(ChannelState::Closing);
        let mut conn = self.lock();
        conn.connection = None;
        for ioid in conn.subscriptions.drain().map(|(ioid, _)| ioid) {
            self.client.ids.release(ioid);
        }
        drop(conn);
        self.set_state(ChannelState::Closed);
    }

    /// Create the channel on a server, and fetch its type
    async fn open_on(
        &self,
        address: SocketAddr,
    ) -> Result<(Connection, oneshot::Receiver<()>), ClientError> {
        let circuit = self.client.circuit_for(address).await?;
        let (reply, created) = oneshot::channel();
        let (destroyed_tx, destroyed) = oneshot::channel();
        circuit.send(CircuitRequest::CreateChannel {
            cid: self.cid,
            name: self.name.clone(),
            reply,
            destroyed: destroyed_tx,
        })?;
        let sid = created.await.map_err(|_| ClientError::Disconnected)??;
        let connection = Connection { circuit, sid };

        let guard = RequestGuard::new(self.client.ids.clone(), &connection);
        let (reply, info) = oneshot::channel();
        connection.circuit.send(CircuitRequest::GetField {
            sid,
            ioid: guard.ioid,
            sub_field: String::new(),
            reply,
        })?;
        let field = info.await.map_err(|_| ClientError::Disconnected)??;
        guard.finish();
        trace!("{} has type {}", self.name, field.type_name());
        Ok((connection, destroyed))
    }

    /// Record a new connection, and restart every monitor on it
    fn start_monitors(&self, connection: Connection) {
        let mut conn = self.lock();
        for (ioid, monitor) in &conn.subscriptions {
            let _ = connection.circuit.send(CircuitRequest::Monitor {
                sid: connection.sid,
                ioid: *ioid,
                request: monitor.request.clone(),
                events: monitor.events.clone(),
                reply: None,
            });
        }
        conn.connection = Some(connection);
    }
}
