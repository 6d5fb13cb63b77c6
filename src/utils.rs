use num::{FromPrimitive, traits::WrappingAdd};
use pnet::datalink;
use socket2::{Domain, Protocol, Type};
use std::{
    env,
    io::{self},
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// A UDP socket that other processes on this host can bind to as well
pub fn new_reusable_udp_socket<T: ToSocketAddrs>(address: T) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No address to bind"))?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(std::net::UdpSocket::from(socket))
}

/// Increments a mutable reference in place, and returns the original value
pub(crate) fn wrapping_inplace_add<T: WrappingAdd + FromPrimitive + Copy>(value: &mut T) -> T {
    let id = *value;
    if let Some(one) = T::from_u8(1) {
        *value = value.wrapping_add(&one);
    }
    id
}

/// Get the server TCP listen port, either from environment or default 5075
pub fn get_default_server_port() -> u16 {
    env::var("EPICS_PVA_SERVER_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5075u16)
}

/// Get the UDP search and beacon port, either from environment or default 5076
pub fn get_default_broadcast_port() -> u16 {
    env::var("EPICS_PVA_BROADCAST_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(5076u16)
}

/// Get the target list of search addresses, by reading the environment and interfaces
///
/// Hostnames are resolved if in the environment setting, so this will re-resolve
pub fn get_target_broadcast_ips(default_search_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    // Work out if we want to automatically include all local broadcast
    let use_auto_address = env::var("EPICS_PVA_AUTO_ADDR_LIST")
        .map(|v| !v.eq_ignore_ascii_case("no"))
        .unwrap_or(true);
    if use_auto_address {
        ips.extend(
            datalink::interfaces()
                .into_iter()
                .filter(|i| !i.is_loopback())
                .flat_map(|i| i.ips.into_iter())
                .filter(|i| i.is_ipv4())
                .flat_map(|f| (f.broadcast(), default_search_port).to_socket_addrs())
                .flatten(),
        );
    }
    if let Ok(addr_list) = env::var("EPICS_PVA_ADDR_LIST") {
        ips.extend(parse_address_list(&addr_list, default_search_port));
    }
    ips
}

/// Resolve a whitespace separated list of `host` or `host:port` entries
pub(crate) fn parse_address_list(list: &str, default_port: u16) -> Vec<SocketAddr> {
    let mut ips = Vec::new();
    for add in list.split_ascii_whitespace() {
        let resolved = if add.contains(':') {
            add.to_socket_addrs()
        } else {
            (add, default_port).to_socket_addrs()
        };
        match resolved {
            Ok(addr) => {
                debug!("Adding search IP: {add} => {addr:?}");
                ips.extend(addr);
            }
            Err(e) => {
                warn!("Failed to convert '{add}' to address: {e}");
                continue;
            }
        }
    }
    ips
}

/// Seconds of silence after which a connection is considered dead
pub fn get_default_connection_timeout() -> Duration {
    Duration::from_secs_f32(
        env::var("EPICS_PVA_CONN_TMO")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30.0f32)
            .max(0.1f32),
    )
}

pub fn get_default_beacon_period() -> Duration {
    Duration::from_secs_f32(
        env::var("EPICS_PVAS_BEACON_PERIOD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15.0f32)
            .max(0.1f32),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_add() {
        let mut i = 3u32;
        assert_eq!(wrapping_inplace_add(&mut i), 3);
        assert_eq!(i, 4);
        let mut i = u8::MAX;
        assert_eq!(wrapping_inplace_add(&mut i), 255);
        assert_eq!(i, 0);
    }

    #[test]
    fn test_address_list() {
        let ips = parse_address_list("127.0.0.1 127.0.0.2:6000", 5076);
        assert_eq!(
            ips,
            vec![
                "127.0.0.1:5076".parse::<SocketAddr>().unwrap(),
                "127.0.0.2:6000".parse().unwrap()
            ]
        );
    }
}
