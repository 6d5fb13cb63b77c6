// #![warn(missing_docs)]

//! Rust implementation of the EPICS PV Access protocol, client and server.
//!
//! This crate is a pure-rust implementation of [EPICS PV Access] (PVA). It does not
//! depend on the C++ [epics-base] libraries at all.
//!
//! <div class="warning">This is a very early version of this library. Interfaces or
//! structure may be changed around wildly between versions until a comfortable
//! final design is settled upon.</div>
//!
//! PVA moves self-describing structured data: every value travels with (or refers
//! to) a description of its type, and updates only carry the fields that changed,
//! marked in a bit set. PVArs separates:
//!
//! - Primitive wire encodings (sizes, strings, bit sets) in module [codec].
//! - The data model of scalars, arrays, structures and variant fields, with their
//!   type descriptions and change tracking, in module [data].
//! - Framing and (de)serialization of protocol messages, in module [messages].
//! - Field selection for operations ("pvRequest"), in module [request].
//! - A [Client] that searches for PVs and talks to servers over [Channel]s, with
//!   [Pv] and [PvPool] layered on top for applications that just want values.
//! - A server, started with [ServerBuilder], that answers searches and serves the
//!   PVs of a [Provider]. [`providers::PvRegistry`] is a provider of PVs created
//!   at runtime.
//!
//! ## Example
//!
//! Serving a PV, and reading it back with a client. Writes are clamped to 100:
//!
//! ```no_run
//! use pvars::{
//!     Client, ServerBuilder,
//!     data::{PvaData, nt::NtScalar},
//!     providers::{PvRegistry, ServerPv},
//!     codec::BitSet,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = PvRegistry::new();
//!     registry
//!         .create_pv_with_handler(
//!             "demo",
//!             NtScalar::new(3.13).build().unwrap(),
//!             |pv: &ServerPv, _: &BitSet, mut proposed: pvars::data::Structure| {
//!                 let value = proposed.get("value").and_then(PvaData::as_f64).unwrap_or(0.0);
//!                 if let Some(field) = proposed.get_mut("value") {
//!                     field.set_value(value.min(100.0)).map_err(|e| e.to_string())?;
//!                 }
//!                 pv.update(&proposed).map(|_| ()).map_err(|e| e.to_string())
//!             },
//!         )
//!         .unwrap();
//!     let _server = ServerBuilder::new(registry).start().await.unwrap();
//!
//!     let client = Client::new().await.unwrap();
//!     client.put("demo", 250.0).await.unwrap();
//!     let value = client.get("demo").await.unwrap();
//!     println!("{}", value.get("value").unwrap());
//! }
//! ```
//!
//! ## Current Status of crate
//!
//! What is currently present:
//! - Searching by UDP broadcast (and watching beacons to search again when servers
//!   appear), connecting, and creating channels, with automatic reconnection.
//! - Get, put and monitor operations with field selection, in both directions.
//! - Variant (`any`) fields, structure arrays, and the normative `NTScalar` and
//!   `NTScalarArray` types.
//!
//! What this doesn't do:
//! - TLS or certificate authentication, RPC, regular unions, or segmented messages.
//!
//! [EPICS PV Access]:
//!     https://docs.epics-controls.org/en/latest/pv-access/protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base

pub mod client;
pub mod codec;
pub mod data;
pub mod messages;
mod pool;
pub mod providers;
mod pv;
pub mod request;
mod server;
pub mod utils;

pub use crate::client::{
    Channel, ChannelState, Client, ClientBuilder, ClientError, MonitorEvent, Subscription,
};
pub use crate::pool::PvPool;
pub use crate::providers::Provider;
pub use crate::pv::{ListenerId, Pv, PvEvent};
pub use crate::server::{ServerBuilder, ServerHandle};
pub use crate::utils::new_reusable_udp_socket;
