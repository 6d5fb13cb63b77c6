//! Interface between the PVA Server and rust code

pub mod registry;
pub use registry::{PvRegistry, ServerPv, WriteHandler};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::{
    codec::BitSet,
    data::{DataError, Structure},
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServerError {
    #[error("No such PV '{0}'")]
    NoSuchPv(String),
    #[error("PV '{0}' already exists")]
    AlreadyExists(String),
    #[error("PV '{0}' is read-only")]
    ReadOnly(String),
    #[error("PV '{0}' cannot be monitored")]
    NotMonitorable(String),
    #[error("PV '{0}' has been closed")]
    Closed(String),
    #[error("Write rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Provides PV values for a PVA Server
pub trait Provider: Sync + Send + Clone + Default + 'static {
    /// Does this provider control the given PV name?
    fn provides(&self, pv_name: &str) -> bool;

    /// Fetch the complete current value of a PV.
    ///
    /// The type of this value is what clients see as the type of the PV.
    fn read_value(&self, pv_name: &str) -> Result<Structure, ServerError>;

    /// Write a value sent by a client to a PV
    ///
    /// `proposed` is the current value with the client's fields merged
    /// in, and `changes` marks which of its fields the client sent.
    #[allow(unused_variables)]
    fn write_value(
        &mut self,
        pv_name: &str,
        changes: &BitSet,
        proposed: Structure,
    ) -> Result<(), ServerError> {
        Err(ServerError::ReadOnly(pv_name.to_string()))
    }

    /// Request a stream of updates to a PV
    ///
    /// Every complete new value is sent. The stream closing tells
    /// subscribers that the PV has gone away.
    #[allow(unused_variables)]
    fn monitor_value(&mut self, pv_name: &str) -> Result<broadcast::Receiver<Structure>, ServerError> {
        Err(ServerError::NotMonitorable(pv_name.to_string()))
    }
}
