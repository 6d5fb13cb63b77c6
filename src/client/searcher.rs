use std::{
    cmp::min,
    collections::HashMap,
    fmt::Display,
    future,
    net::SocketAddr,
    pin::Pin,
    time::{Duration, Instant},
};
use tokio::{
    io,
    net::UdpSocket,
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    messages::{Command, PvaMessage, RawMessage, Search, SearchResponse},
    utils::{get_default_broadcast_port, get_target_broadcast_ips, wrapping_inplace_add},
};

/// First retry interval; each further retry doubles it
const INITIAL_BACKOFF: Duration = Duration::from_millis(225);
/// Doublings before the interval stops growing (about 30 s)
const MAX_BACKOFF_STEPS: usize = 7;
/// Largest search datagram, kept inside a typical Ethernet MTU
const MAX_SEARCH_BYTES: usize = 1400;
/// Bytes of a search datagram before its channel list
const SEARCH_OVERHEAD: usize = 48;

pub(crate) enum SearchRequest {
    Find(
        String,
        oneshot::Sender<broadcast::Receiver<Option<SocketAddr>>>,
    ),
    /// Restart the back-off of every pending search
    Boost,
}

pub struct SearcherBuilder {
    search_port: u16,
    stop_token: CancellationToken,
    broadcast_addresses: Option<Vec<SocketAddr>>,
    timeout: Option<Duration>,
    /// The socket that is UDP bound to receive replies
    bind_address: SocketAddr,
}

impl Default for SearcherBuilder {
    fn default() -> Self {
        SearcherBuilder {
            search_port: get_default_broadcast_port(),
            stop_token: CancellationToken::new(),
            broadcast_addresses: None,
            timeout: Some(Duration::from_secs(1)),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
        }
    }
}

impl SearcherBuilder {
    pub fn new() -> Self {
        SearcherBuilder::default()
    }
    pub async fn start(self) -> Result<Searcher, io::Error> {
        let (send, request_recv) = mpsc::channel(32);
        let mut searcher = Searcher {
            timeout: self.timeout,
            pending_requests: send,
            stop_token: self.stop_token,
            broadcast_addresses: self
                .broadcast_addresses
                .unwrap_or_else(|| get_target_broadcast_ips(self.search_port)),
            bind_address: self.bind_address,
        };
        searcher
            .start_searching(request_recv)
            .await
            .and(Ok(searcher))
    }
    pub fn stop_token(mut self, token: CancellationToken) -> Self {
        self.stop_token = token.child_token();
        self
    }
    /// Port that searches are sent to, when broadcasting to interfaces
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    /// How long to search before giving up. `None` searches until cancelled.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
    pub fn broadcast_to(mut self, addresses: Vec<SocketAddr>) -> Self {
        self.broadcast_addresses = Some(addresses);
        self
    }
}

#[derive(Debug)]
pub struct Searcher {
    timeout: Option<Duration>,
    /// Submit requests to search for new PVs
    pending_requests: mpsc::Sender<SearchRequest>,
    /// Addresses to send searches to
    broadcast_addresses: Vec<SocketAddr>,
    stop_token: CancellationToken,
    bind_address: SocketAddr,
}

impl Searcher {
    pub async fn start() -> Result<Searcher, io::Error> {
        SearcherBuilder::new().start().await
    }
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
    pub fn broadcast_addresses(&self) -> &[SocketAddr] {
        &self.broadcast_addresses
    }

    async fn start_searching(
        &mut self,
        mut incoming_requests: mpsc::Receiver<SearchRequest>,
    ) -> Result<(), io::Error> {
        let socket = UdpSocket::bind(self.bind_address).await?;
        socket.set_broadcast(true)?;

        let mut state = SearcherInternal {
            broadcast_addresses: self.broadcast_addresses.clone(),
            stop_token: self.stop_token.clone(),
            timeout: self.timeout,
            response_port: socket.local_addr()?.port(),
            ..Default::default()
        };

        tokio::spawn(async move {
            let mut buffer = vec![0u8; 0xFFFF];
            loop {
                let mut requests = Vec::new();
                select! {
                    _ = state.stop_token.cancelled() => break,
                    _ = incoming_requests.recv_many(&mut requests, 32) => if requests.is_empty() { break; } else {
                        state.handle_new_requests(&socket, requests).await
                    },
                    result = socket.recv_from(&mut buffer) => match result {
                        Ok((size, sender)) => state.handle_response(&buffer[..size], sender),
                        Err(e) => {
                            error!("Error waiting for search responses: {e}");
                        },
                    },
                    _ = state.next_attempt() => for message in state.handle_retries_and_timeouts() {
                        state.send(&socket, &message).await;
                    },
                };
            }
            debug!("Searcher stopped");
        });
        Ok(())
    }

    /// Get the SocketAddr for the server serving a specific PV
    pub async fn search_for(&self, name: &str) -> Result<SocketAddr, CouldNotFindError> {
        let (ret_send, ret_recv) = oneshot::channel::<broadcast::Receiver<Option<SocketAddr>>>();
        // Send the request into our async search loop
        self.pending_requests
            .send(SearchRequest::Find(name.to_string(), ret_send))
            .await
            .map_err(|_| CouldNotFindError)?;
        // Get the receiver back from here
        let mut result_receiver = ret_recv.await.map_err(|_| CouldNotFindError)?;
        // Now, wait on this
        result_receiver
            .recv()
            .await
            .unwrap_or(None)
            .ok_or(CouldNotFindError)
    }

    /// Search again for everything pending, as soon as possible
    pub async fn boost(&self) {
        let _ = self.pending_requests.send(SearchRequest::Boost).await;
    }

    pub(crate) fn request_sender(&self) -> mpsc::Sender<SearchRequest> {
        self.pending_requests.clone()
    }

    pub fn stop(&self) {
        self.stop_token.cancel();
    }
    pub fn is_cancelled(&self) -> bool {
        self.stop_token.is_cancelled()
    }
}

impl Drop for Searcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug)]
pub struct CouldNotFindError;

impl Display for CouldNotFindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Could not find the requested PV")
    }
}

impl std::error::Error for CouldNotFindError {}

/// Delay before the next search, after `attempts` searches
fn backoff(attempts: usize) -> Duration {
    INITIAL_BACKOFF * 2u32.pow(min(attempts, MAX_BACKOFF_STEPS) as u32)
}

#[derive(Debug)]
struct SearchAttempt {
    name: String,
    search_expires_at: Option<Instant>,
    /// Search instance ids sent for this name
    active_searches: Vec<u32>,
    attempts: usize,
    next_search_at: Instant,
    /// How are results reported back to the requesters?
    reporter: broadcast::Sender<Option<SocketAddr>>,
}

impl SearchAttempt {
    /// Recalculate timings for a new search with this id
    fn new_search(&mut self, search_id: u32) -> (u32, String) {
        self.next_search_at = Instant::now() + backoff(self.attempts);
        self.attempts += 1;
        self.active_searches.push(search_id);
        (search_id, self.name.clone())
    }
}

impl Default for SearchAttempt {
    fn default() -> Self {
        SearchAttempt {
            name: String::new(),
            search_expires_at: None,
            active_searches: Vec::new(),
            attempts: 0,
            next_search_at: Instant::now(),
            reporter: broadcast::Sender::new(1),
        }
    }
}

/// Handle searcher internal state, inside a single Async context
#[derive(Default)]
struct SearcherInternal {
    broadcast_addresses: Vec<SocketAddr>,
    /// Search IDs of outstanding requests to the PV name
    in_flight: HashMap<u32, String>,
    /// Data about all the PVs we are searching for
    per_pv_info: HashMap<String, SearchAttempt>,
    stop_token: CancellationToken,
    /// The next search instance ID to send
    search_id: u32,
    /// Sequence number of the next search datagram
    sequence_id: u32,
    timeout: Option<Duration>,
    /// Port that replies should be sent to
    response_port: u16,
}

impl SearcherInternal {
    /// Wait until it's time for the next tracked attempt
    fn next_attempt(&self) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
        let next_wake = self
            .per_pv_info
            .values()
            .flat_map(|v| [Some(v.next_search_at), v.search_expires_at])
            .flatten()
            .min();
        match next_wake {
            None => Box::pin(future::pending()),
            Some(instant) => {
                if instant < Instant::now() {
                    Box::pin(future::ready(()))
                } else {
                    Box::pin(tokio::time::sleep_until(tokio::time::Instant::from_std(
                        instant,
                    )))
                }
            }
        }
    }

    /// Pack searches for `channels` into as many datagrams as they need
    fn build_searches(&mut self, channels: Vec<(u32, String)>) -> Vec<RawMessage> {
        let mut batches: Vec<Vec<(u32, String)>> = Vec::new();
        let mut batch_size = SEARCH_OVERHEAD;
        for channel in channels {
            let size = 4 + 5 + channel.1.len();
            match batches.last_mut() {
                Some(batch) if batch_size + size <= MAX_SEARCH_BYTES => batch.push(channel),
                _ => {
                    batch_size = SEARCH_OVERHEAD;
                    batches.push(vec![channel]);
                }
            }
            batch_size += size;
        }
        batches
            .into_iter()
            .map(|channels| {
                Search {
                    sequence_id: wrapping_inplace_add(&mut self.sequence_id),
                    flags: 0,
                    response_address: None,
                    response_port: self.response_port,
                    protocols: vec!["tcp".to_string()],
                    channels,
                }
                .to_message(false)
            })
            .collect()
    }

    async fn send(&self, socket: &UdpSocket, message: &RawMessage) {
        let buffer = message.as_bytes();
        for addr in &self.broadcast_addresses {
            trace!("Sending search packet to: {addr}");
            if let Err(e) = socket.send_to(&buffer, *addr).await {
                warn!("Failed to send search to {addr}: {e}");
            }
        }
    }

    async fn handle_new_requests(&mut self, socket: &UdpSocket, requests: Vec<SearchRequest>) {
        let mut channels = Vec::new();
        for request in requests {
            let (name, waiter_reply) = match request {
                SearchRequest::Find(name, reply) => (name, reply),
                SearchRequest::Boost => {
                    debug!("Restarting search back-off");
                    let now = Instant::now();
                    for info in self.per_pv_info.values_mut() {
                        info.attempts = 0;
                        info.next_search_at = now;
                    }
                    continue;
                }
            };
            // Get or create an entry in our per-PV map to keep track of everything
            let timeout = self.timeout;
            let info = self
                .per_pv_info
                .entry(name.clone())
                .or_insert_with(|| SearchAttempt {
                    name: name.clone(),
                    search_expires_at: timeout.map(|t| Instant::now() + t),
                    ..Default::default()
                });
            // Give the requester a place to wait for replies
            let _ = waiter_reply.send(info.reporter.subscribe());
            if !info.active_searches.is_empty() {
                // Already searching for this, on its own schedule
                continue;
            }
            let search_id = wrapping_inplace_add(&mut self.search_id);
            self.in_flight.insert(search_id, name.clone());
            channels.push(info.new_search(search_id));
            debug!("Sending search for {name}");
        }
        for message in self.build_searches(channels) {
            self.send(socket, &message).await;
        }
    }

    fn handle_response(&mut self, response: &[u8], sender: SocketAddr) {
        let Ok(messages) = RawMessage::parse_many(response) else {
            warn!("Received unparseable search response");
            return;
        };
        for message in messages {
            if message.header.command != Command::SearchResponse as u8 || message.header.is_control() {
                trace!("Ignoring message {} on search socket", message.header.command);
                continue;
            }
            let response = match SearchResponse::from_message(&message) {
                Ok(response) => response,
                Err(e) => {
                    warn!("Received invalid search response: {e}");
                    continue;
                }
            };
            if !response.found {
                continue;
            }
            for search_id in response.search_ids {
                // What was this a response to?
                let Some(pv_name) = self.in_flight.remove(&search_id) else {
                    debug!("Received unrequested or duplicate search response");
                    continue;
                };
                // Clear out any past requests for this and send the notification up
                let Some(info) = self.per_pv_info.remove(&pv_name) else {
                    continue;
                };
                for search_id in info.active_searches {
                    self.in_flight.remove(&search_id);
                }
                let server_origin = SocketAddr::new(
                    response.server_address.unwrap_or(sender.ip()),
                    response.server_port,
                );
                debug!("Found server for {pv_name}: {server_origin} ({})", response.guid);
                let _ = info.reporter.send(Some(server_origin));
            }
        }
    }

    fn handle_retries_and_timeouts(&mut self) -> Vec<RawMessage> {
        let now = Instant::now();

        // Discard expired searches, and any that nobody is waiting for
        self.per_pv_info.retain(|_, v| {
            let expired = v.search_expires_at.is_some_and(|time| time < now);
            let abandoned = v.reporter.receiver_count() == 0;
            if expired || abandoned {
                // Send the termination signal, then remove from the in-flight register
                let _ = v.reporter.send(None);
                for id in v.active_searches.iter() {
                    let _ = self.in_flight.remove(id);
                }
                debug!(
                    "Dropping search for {} ({})",
                    v.name,
                    if expired { "timed out" } else { "no longer wanted" }
                );
                false
            } else {
                true
            }
        });

        let mut channels = Vec::new();
        for info in self.per_pv_info.values_mut() {
            if info.next_search_at > now {
                continue;
            }
            let search_id = wrapping_inplace_add(&mut self.search_id);
            trace!("Sending retry search for: {}", info.name);
            self.in_flight.insert(search_id, info.name.clone());
            channels.push(info.new_search(search_id));
        }
        self.build_searches(channels)
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::{client::SearcherBuilder, messages::Guid};

    #[test]
    fn test_backoff() {
        assert_eq!(backoff(0), Duration::from_millis(225));
        assert_eq!(backoff(1), Duration::from_millis(450));
        assert_eq!(backoff(7), Duration::from_millis(28800));
        assert_eq!(backoff(20), backoff(7));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_search() {
        // Set up a receiver
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = incoming.local_addr().unwrap().port();

        let subtask = tokio::spawn(async move {
            let s = SearcherBuilder::new()
                .broadcast_to(vec![SocketAddr::from(([127, 0, 0, 1], port))])
                .start()
                .await
                .unwrap();
            assert_eq!(
                s.search_for("TEST").await.unwrap(),
                "127.0.0.1:6464".parse::<SocketAddr>().unwrap()
            );
        });

        // Receive and validate this request
        let mut buffer = [0u8; 16384];
        let (size, source) = incoming.recv_from(&mut buffer).await.unwrap();
        let messages = RawMessage::parse_many(&buffer[..size]).unwrap();
        assert_eq!(messages.len(), 1);
        let search = Search::from_message(&messages[0]).unwrap();
        assert_eq!(search.channels.len(), 1);
        assert_eq!(search.channels[0].1, "TEST");
        assert_eq!(search.response_port, source.port());

        // Send a message back
        let response = search.respond(Guid::random(), None, 6464, vec![search.channels[0].0]);
        incoming
            .send_to(&response.to_message(true).as_bytes(), source)
            .await
            .unwrap();

        subtask.await.unwrap();
    }

    #[test]
    fn test_searches_split_into_datagrams() {
        let mut state = SearcherInternal::default();
        assert!(state.build_searches(Vec::new()).is_empty());

        let channels: Vec<_> = (0..70_000u32).map(|i| (i, format!("PV:{i:05}"))).collect();
        let messages = state.build_searches(channels);
        assert!(messages.len() > 1);
        let mut found = 0;
        for message in &messages {
            assert!(message.as_bytes().len() <= MAX_SEARCH_BYTES);
            let search = Search::from_message(message).unwrap();
            assert_eq!(search.channels[0].0, found);
            found += search.channels.len() as u32;
        }
        assert_eq!(found, 70_000);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_search_timeout() {
        let incoming = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = incoming.local_addr().unwrap().port();
        let searcher = SearcherBuilder::new()
            .broadcast_to(vec![SocketAddr::from(([127, 0, 0, 1], port))])
            .timeout(Some(Duration::from_millis(300)))
            .start()
            .await
            .unwrap();
        assert!(searcher.search_for("NOBODY").await.is_err());
    }
}
