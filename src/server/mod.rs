//! The PVA server: answers searches, and serves a [`Provider`]'s PVs to clients

mod circuit;

use std::{
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::{
    io,
    net::{TcpListener, UdpSocket},
    select,
    task::{JoinError, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    messages::{Beacon, Command, Guid, PvaMessage, RawMessage, SEARCH_REPLY_REQUIRED, Search},
    providers::Provider,
    utils::{
        get_default_beacon_period, get_default_broadcast_port, get_default_connection_timeout,
        get_default_server_port, get_target_broadcast_ips, new_reusable_udp_socket,
        wrapping_inplace_add,
    },
};

use circuit::ServerCircuit;

pub struct ServerBuilder<P: Provider> {
    provider: P,
    connection_port: u16,
    search_port: u16,
    beacons: bool,
    beacon_period: Duration,
    connection_timeout: Duration,
}

impl<P: Provider> ServerBuilder<P> {
    pub fn new(provider: P) -> ServerBuilder<P> {
        ServerBuilder {
            provider,
            connection_port: get_default_server_port(),
            search_port: get_default_broadcast_port(),
            beacons: true,
            beacon_period: get_default_beacon_period(),
            connection_timeout: get_default_connection_timeout(),
        }
    }
    /// TCP port to accept clients on. 0 picks any free port.
    pub fn connection_port(mut self, port: u16) -> Self {
        self.connection_port = port;
        self
    }
    /// UDP port to listen for searches on. 0 picks any free port.
    pub fn search_port(mut self, port: u16) -> Self {
        self.search_port = port;
        self
    }
    /// Announce the server with periodic beacons
    pub fn beacons(mut self, enabled: bool) -> Self {
        self.beacons = enabled;
        self
    }
    pub fn beacon_period(mut self, period: Duration) -> Self {
        self.beacon_period = period;
        self
    }
    /// Silence after which a client is considered gone
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub async fn start(self) -> Result<ServerHandle, io::Error> {
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.connection_port)).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == ErrorKind::AddrInUse && self.connection_port != 0 => {
                warn!(
                    "Port {} is in use, listening on a free port instead",
                    self.connection_port
                );
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?
            }
            Err(e) => return Err(e),
        };
        let connection_port = listener.local_addr()?.port();
        let search_socket = new_reusable_udp_socket((Ipv4Addr::UNSPECIFIED, self.search_port))?;
        let search_port = search_socket.local_addr()?.port();
        let guid = Guid::random();
        info!("Server {guid} listening on TCP {connection_port}, searches on UDP {search_port}");

        let cancel = CancellationToken::new();
        let mut tasks = vec![
            tokio::spawn(listen(
                listener,
                self.provider.clone(),
                self.connection_timeout,
                cancel.clone(),
            )),
            tokio::spawn(answer_searches(
                search_socket,
                self.provider,
                guid,
                connection_port,
                cancel.clone(),
            )),
        ];
        if self.beacons {
            let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
            socket.set_broadcast(true)?;
            tasks.push(tokio::spawn(send_beacons(
                socket,
                get_target_broadcast_ips(get_default_broadcast_port()),
                self.beacon_period,
                guid,
                connection_port,
                cancel.clone(),
            )));
        }

        Ok(ServerHandle {
            guid,
            connection_port,
            search_port,
            cancel,
            tasks,
        })
    }
}

/// A running server. Dropping the handle stops it.
pub struct ServerHandle {
    guid: Guid,
    connection_port: u16,
    search_port: u16,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn guid(&self) -> Guid {
        self.guid
    }
    pub fn connection_port(&self) -> u16 {
        self.connection_port
    }
    pub fn search_port(&self) -> u16 {
        self.search_port
    }

    /// Close every connection, and wait for the server to finish
    pub async fn stop(mut self) -> Result<(), JoinError> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait until the server is stopped from elsewhere
    pub async fn join(mut self) -> Result<(), JoinError> {
        self.wait().await
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn wait(&mut self) -> Result<(), JoinError> {
        for task in std::mem::take(&mut self.tasks) {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn listen<P: Provider>(
    listener: TcpListener,
    provider: P,
    connection_timeout: Duration,
    stop: CancellationToken,
) {
    let mut circuits = JoinSet::new();
    loop {
        select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {peer}");
                    let circuit = ServerCircuit::new(peer, provider.clone(), connection_timeout, stop.child_token());
                    circuits.spawn(circuit.serve(stream));
                }
                Err(e) => error!("Failed to accept connection: {e}"),
            },
            Some(_) = circuits.join_next(), if !circuits.is_empty() => (),
        }
    }
    while circuits.join_next().await.is_some() {}
    debug!("Listener stopped");
}

async fn answer_searches<P: Provider>(
    socket: UdpSocket,
    provider: P,
    guid: Guid,
    connection_port: u16,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; 0xFFFF];
    loop {
        select! {
            _ = stop.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((size, origin)) => {
                    for (destination, reply) in search_replies(&buf[..size], origin, &provider, guid, connection_port) {
                        if let Err(e) = socket.send_to(&reply, destination).await {
                            warn!("Failed to send search reply to {destination}: {e}");
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Unreachable ICMP replies to earlier sends surface here
                    debug!("Error receiving searches: {e}");
                }
            },
        }
    }
    debug!("Search responder stopped");
}

/// Replies to each search in a datagram, and where to send them
fn search_replies<P: Provider>(
    datagram: &[u8],
    origin: SocketAddr,
    provider: &P,
    guid: Guid,
    connection_port: u16,
) -> Vec<(SocketAddr, Vec<u8>)> {
    let Ok(messages) = RawMessage::parse_many(datagram) else {
        trace!("Ignoring unparseable datagram from {origin}");
        return Vec::new();
    };
    let mut replies = Vec::new();
    for message in messages {
        if message.header.command != Command::Search as u8 || message.header.is_control() {
            continue;
        }
        let search = match Search::from_message(&message) {
            Ok(search) => search,
            Err(e) => {
                debug!("Invalid search from {origin}: {e}");
                continue;
            }
        };
        if !search.protocols.is_empty() && !search.protocols.iter().any(|p| p == "tcp") {
            continue;
        }
        let found: Vec<u32> = search
            .channels
            .iter()
            .filter(|(_, name)| provider.provides(name))
            .map(|(id, _)| *id)
            .collect();
        if found.is_empty() && search.flags & SEARCH_REPLY_REQUIRED == 0 {
            continue;
        }
        trace!("Answering search from {origin} for {} channels", found.len());
        let destination = SocketAddr::new(
            search.response_address.unwrap_or(origin.ip()),
            match search.response_port {
                0 => origin.port(),
                port => port,
            },
        );
        let reply = search.respond(guid, None, connection_port, found);
        replies.push((destination, reply.to_message(true).as_bytes()));
    }
    replies
}

async fn send_beacons(
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    period: Duration,
    guid: Guid,
    connection_port: u16,
    stop: CancellationToken,
) {
    let mut sequence_id = 0u8;
    let mut interval = tokio::time::interval(period);
    loop {
        select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let beacon = Beacon {
                    guid,
                    flags: 0,
                    sequence_id: wrapping_inplace_add(&mut sequence_id),
                    change_count: 0,
                    server_address: None,
                    server_port: connection_port,
                    protocol: "tcp".to_string(),
                }
                .to_message(true)
                .as_bytes();
                for target in &targets {
                    if let Err(e) = socket.send_to(&beacon, target).await {
                        debug!("Failed to send beacon to {target}: {e}");
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::nt::NtScalar, providers::PvRegistry};

    #[test]
    fn test_search_replies() {
        let registry = PvRegistry::new();
        registry
            .create_pv("known", NtScalar::new(1.0).build().unwrap())
            .unwrap();
        let origin: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let search = |channels: Vec<(u32, &str)>, flags: u8| {
            Search {
                sequence_id: 9,
                flags,
                response_address: None,
                response_port: 41000,
                protocols: vec!["tcp".into()],
                channels: channels.into_iter().map(|(i, n)| (i, n.to_string())).collect(),
            }
            .to_message(false)
            .as_bytes()
        };
        let guid = Guid::random();

        let replies = search_replies(&search(vec![(1, "other"), (2, "known")], 0), origin, &registry, guid, 5075);
        assert_eq!(replies.len(), 1);
        let (destination, reply) = &replies[0];
        assert_eq!(*destination, "127.0.0.1:41000".parse().unwrap());
        let messages = RawMessage::parse_many(reply).unwrap();
        let response = crate::messages::SearchResponse::from_message(&messages[0]).unwrap();
        assert_eq!(response.guid, guid);
        assert_eq!(response.sequence_id, 9);
        assert_eq!(response.server_port, 5075);
        assert!(response.found);
        assert_eq!(response.search_ids, vec![2]);

        assert!(search_replies(&search(vec![(1, "other")], 0), origin, &registry, guid, 5075).is_empty());
        let replies = search_replies(
            &search(vec![(1, "other")], SEARCH_REPLY_REQUIRED),
            origin,
            &registry,
            guid,
            5075,
        );
        assert_eq!(replies.len(), 1);
        assert!(search_replies(b"junk", origin, &registry, guid, 5075).is_empty());
    }
}
