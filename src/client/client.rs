use std::{
    collections::{HashMap, HashSet, VecDeque},
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::{io, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    client::{
        Channel, SearcherBuilder,
        circuit::Circuit,
        searcher::{CouldNotFindError, SearchRequest, Searcher},
    },
    codec::DecodeError,
    data::{DataError, PvaData, Structure},
    messages::{Beacon, Command, Guid, MessageError, PvaMessage, RawMessage, Status},
    utils::{
        get_default_broadcast_port, get_default_connection_timeout, new_reusable_udp_socket,
        wrapping_inplace_add,
    },
};

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("{0}")]
    IO(#[from] io::Error),
    #[error("{0}")]
    PVNotFoundError(#[from] CouldNotFindError),
    #[error("Failed to parse message from server: {0}")]
    ServerSentInvalidMessage(#[from] MessageError),
    #[error("Server refused the connection: {0}")]
    ValidationFailed(String),
    #[error("The Client is closing or has closed")]
    ClientClosed,
    #[error("The channel does not exist or is already closed")]
    ChannelClosed,
    #[error("Channel creation failed: {0}")]
    ChannelCreateFailed(String),
    #[error("Timed out waiting for '{0}' to connect")]
    ConnectTimeout(String),
    #[error("Lost connection to the server")]
    Disconnected,
    #[error("Server reported {0}")]
    Server(Status),
    #[error(transparent)]
    Data(#[from] DataError),
}

impl From<DecodeError> for ClientError {
    fn from(err: DecodeError) -> Self {
        ClientError::ServerSentInvalidMessage(err.into())
    }
}

/// Released ids wait for this many later releases before reuse
const ID_QUARANTINE: usize = 256;

/// Hands out request ids
///
/// A released id is only reused once [`ID_QUARANTINE`] other ids have
/// been released after it, so a late reply to a cancelled operation cannot
/// be mistaken for the reply to a new one.
#[derive(Debug)]
pub(crate) struct IdPool {
    state: Mutex<IdState>,
}

#[derive(Debug)]
struct IdState {
    next: u32,
    in_use: HashSet<u32>,
    released: VecDeque<u32>,
}

impl Default for IdPool {
    fn default() -> Self {
        IdPool {
            state: Mutex::new(IdState {
                next: 1,
                in_use: HashSet::new(),
                released: VecDeque::new(),
            }),
        }
    }
}

impl IdPool {
    pub(crate) fn acquire(&self) -> u32 {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let reused = if state.released.len() > ID_QUARANTINE {
            state.released.pop_front()
        } else {
            None
        };
        let id = reused.unwrap_or_else(|| loop {
            let candidate = wrapping_inplace_add(&mut state.next);
            // Only reachable after wrapping around
            if !state.in_use.contains(&candidate) && !state.released.contains(&candidate) {
                break candidate;
            }
        });
        state.in_use.insert(id);
        id
    }
    pub(crate) fn release(&self, id: u32) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.in_use.remove(&id) {
            state.released.push_back(id);
        }
    }
}

pub struct ClientBuilder {
    search_port: u16,
    search_addresses: Option<Vec<SocketAddr>>,
    connect_timeout: Duration,
    connection_timeout: Duration,
    watch_beacons: bool,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            search_port: get_default_broadcast_port(),
            search_addresses: None,
            connect_timeout: get_default_connection_timeout(),
            connection_timeout: get_default_connection_timeout(),
            watch_beacons: true,
        }
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        ClientBuilder::default()
    }
    /// UDP port that searches are broadcast to, and beacons are heard on
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    /// Send searches to exactly these addresses
    pub fn search_addresses(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.search_addresses = Some(addresses);
        self
    }
    /// How long channel operations wait for a channel to connect
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
    /// Silence after which a server connection is considered dead
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
    /// Listen for server beacons, and search again when a new server appears
    pub fn watch_beacons(mut self, watch: bool) -> Self {
        self.watch_beacons = watch;
        self
    }

    pub async fn start(self) -> Result<Client, ClientError> {
        let cancel = CancellationToken::new();
        let searcher = SearcherBuilder::new()
            .search_port(self.search_port)
            .stop_token(cancel.clone())
            .timeout(None);
        let searcher = match self.search_addresses {
            Some(addresses) => searcher.broadcast_to(addresses),
            None => searcher,
        }
        .start()
        .await?;

        if self.watch_beacons
            && let Err(err) =
                watch_broadcasts(self.search_port, searcher.request_sender(), cancel.clone())
        {
            warn!(
                "Failed to create beacon watcher on port {}, will run without: {err:?}",
                self.search_port
            );
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                searcher,
                circuits: Default::default(),
                ids: Default::default(),
                next_cid: AtomicU32::new(1),
                connect_timeout: self.connect_timeout,
                connection_timeout: self.connection_timeout,
                cancel,
            }),
        })
    }
}

/// Shared state behind a [`Client`] and all of its channels
pub(crate) struct ClientInner {
    pub(crate) searcher: Searcher,
    /// Active connections to different servers
    circuits: tokio::sync::Mutex<HashMap<SocketAddr, Circuit>>,
    pub(crate) ids: Arc<IdPool>,
    next_cid: AtomicU32,
    pub(crate) connect_timeout: Duration,
    connection_timeout: Duration,
    pub(crate) cancel: CancellationToken,
}

impl ClientInner {
    pub(crate) fn next_cid(&self) -> u32 {
        self.next_cid.fetch_add(1, Ordering::Relaxed)
    }

    /// Get the open circuit to a server, connecting if there is none
    pub(crate) async fn circuit_for(&self, address: SocketAddr) -> Result<Circuit, ClientError> {
        if self.cancel.is_cancelled() {
            return Err(ClientError::ClientClosed);
        }
        let mut circuits = self.circuits.lock().await;
        if let Some(circuit) = circuits.get(&address)
            && !circuit.is_closed()
        {
            return Ok(circuit.clone());
        }
        let circuit =
            Circuit::connect(&address, self.connection_timeout, self.cancel.child_token()).await?;
        circuits.insert(address, circuit.clone());
        Ok(circuit)
    }
}

/// Entry point for talking to PVA servers
///
/// Dropping the client closes every channel and connection made through it.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub async fn new() -> Result<Client, ClientError> {
        ClientBuilder::new().start().await
    }

    /// A handle to the named channel. Connecting happens in the background.
    pub fn channel(&self, name: &str) -> Channel {
        Channel::new(self.inner.clone(), name)
    }

    /// Read the whole value of a PV once
    pub async fn get(&self, name: &str) -> Result<Structure, ClientError> {
        let channel = self.channel(name);
        let result = channel.read("").await;
        channel.close().await;
        result
    }

    /// Write to the `value` field of a PV once
    pub async fn put(&self, name: &str, value: impl Into<PvaData>) -> Result<(), ClientError> {
        let channel = self.channel(name);
        let result = channel.write("value", value).await;
        channel.close().await;
        result
    }

    pub fn connect_timeout(&self) -> Duration {
        self.inner.connect_timeout
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

/// Watch for beacons, and restart searches whenever a new server appears
fn watch_broadcasts(
    port: u16,
    searcher: mpsc::Sender<SearchRequest>,
    stop: CancellationToken,
) -> Result<(), io::Error> {
    // Bind the socket first, so that we know early if it fails
    let broadcast_socket = new_reusable_udp_socket(SocketAddr::new([0, 0, 0, 0].into(), port))?;

    tokio::spawn(async move {
        let mut buf: Vec<u8> = vec![0; 0xFFFF];
        // Last change count seen from each server
        let mut servers: HashMap<Guid, u16> = HashMap::new();

        loop {
            select! {
                _ = stop.cancelled() => break,
                r = broadcast_socket.recv_from(&mut buf) => match r {
                    Ok((size, addr)) => {
                        let Ok(messages) = RawMessage::parse_many(&buf[..size]) else {
                            continue;
                        };
                        for message in messages {
                            if message.header.command != Command::Beacon as u8 || message.header.is_control() {
                                continue;
                            }
                            let Ok(beacon) = Beacon::from_message(&message) else {
                                continue;
                            };
                            trace!("Observed beacon from {addr}: {beacon:?}");
                            if servers.insert(beacon.guid, beacon.change_count) != Some(beacon.change_count) {
                                debug!("New or changed server {} at {addr}, boosting searches", beacon.guid);
                                let _ = searcher.try_send(SearchRequest::Boost);
                            }
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Got unresumable error whilst watching broadcasts: {e:?}");
                        break;
                    }
                }
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_pool() {
        let pool = IdPool::default();
        assert_eq!(pool.acquire(), 1);
        assert_eq!(pool.acquire(), 2);
        assert_eq!(pool.acquire(), 3);
        pool.release(2);
        pool.release(1);
        // Released ids are not handed straight back out
        assert_eq!(pool.acquire(), 4);
        // Releasing twice, or an unknown id, is harmless
        pool.release(2);
        pool.release(1000);

        let held: Vec<u32> = (0..ID_QUARANTINE).map(|_| pool.acquire()).collect();
        for id in held {
            pool.release(id);
        }
        // Reused oldest first, once enough others were released
        assert_eq!(pool.acquire(), 2);
        assert_eq!(pool.acquire(), 1);
    }
}
