mod channel;
mod circuit;
#[allow(clippy::module_inception)]
mod client;
mod searcher;
mod subscription;

pub use searcher::{CouldNotFindError, Searcher, SearcherBuilder};

pub use channel::{Channel, ChannelState};
pub use client::{Client, ClientBuilder, ClientError};
pub use subscription::{MonitorEvent, Subscription};
