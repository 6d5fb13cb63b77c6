//! A table of PVs served from memory
//!
//! ```
//! use pvars::{data::nt::NtScalar, providers::PvRegistry};
//!
//! let registry = PvRegistry::default();
//! let pv = registry.create_pv("demo", NtScalar::new(3.13).build().unwrap()).unwrap();
//!
//! let mut newer = pv.value();
//! newer.get_mut("value").unwrap().set_value(4.13).unwrap();
//! let changes = pv.update(&newer).unwrap();
//! assert_eq!(changes.iter().collect::<Vec<_>>(), vec![1]);
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{
    codec::BitSet,
    data::Structure,
    providers::{Provider, ServerError},
};

/// Updates buffered for each subscriber before it starts to lag
const UPDATE_QUEUE_SIZE: usize = 16;

/// Decides what happens when a client writes to a PV
///
/// The handler receives the PV, the fields the client set, and the
/// proposed new value. Nothing changes unless it calls [`ServerPv::update`],
/// so it can accept, adjust or refuse the write. Returning an error sends
/// the message back to the client.
pub trait WriteHandler: Send + Sync + 'static {
    fn handle_write(&self, pv: &ServerPv, changes: &BitSet, proposed: Structure)
    -> Result<(), String>;
}

impl<F> WriteHandler for F
where
    F: Fn(&ServerPv, &BitSet, Structure) -> Result<(), String> + Send + Sync + 'static,
{
    fn handle_write(
        &self,
        pv: &ServerPv,
        changes: &BitSet,
        proposed: Structure,
    ) -> Result<(), String> {
        self(pv, changes, proposed)
    }
}

type PvTable = Mutex<HashMap<String, ServerPv>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct PvInner {
    name: String,
    value: Mutex<Structure>,
    /// Taken when the PV closes, which ends every subscription
    sender: Mutex<Option<broadcast::Sender<Structure>>>,
    handler: Option<Box<dyn WriteHandler>>,
    registry: Weak<PvTable>,
}

/// A PV served by a [`PvRegistry`]
#[derive(Clone)]
pub struct ServerPv {
    inner: Arc<PvInner>,
}

impl ServerPv {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// A copy of the current value
    pub fn value(&self) -> Structure {
        lock(&self.inner.value).clone()
    }

    /// Change the value, and send it to every subscriber if anything changed
    ///
    /// `new_value` must have the layout of the current value. Returns the
    /// fields that changed.
    pub fn update(&self, new_value: &Structure) -> Result<BitSet, ServerError> {
        let sender = lock(&self.inner.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(ServerError::Closed(self.inner.name.clone()));
        };
        let mut value = lock(&self.inner.value);
        let changes = value.update(new_value)?;
        if !changes.is_empty() {
            trace!("{} changed {changes}", self.inner.name);
            // No subscribers is not a failure
            let _ = sender.send(value.clone());
        }
        Ok(changes)
    }

    /// Does anyone monitor this PV?
    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.sender)
            .as_ref()
            .is_some_and(|s| s.receiver_count() > 0)
    }

    /// Stop serving the PV. Subscribers are told it has gone away.
    pub fn close(&self) {
        if lock(&self.inner.sender).take().is_some() {
            debug!("Closing PV {}", self.inner.name);
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            let mut pvs = lock(&registry);
            if pvs
                .get(&self.inner.name)
                .is_some_and(|pv| Arc::ptr_eq(&pv.inner, &self.inner))
            {
                pvs.remove(&self.inner.name);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<Structure>, ServerError> {
        lock(&self.inner.sender)
            .as_ref()
            .map(|s| s.subscribe())
            .ok_or_else(|| ServerError::Closed(self.inner.name.clone()))
    }

    fn write(&self, changes: &BitSet, proposed: Structure) -> Result<(), ServerError> {
        match &self.inner.handler {
            None => Err(ServerError::ReadOnly(self.inner.name.clone())),
            Some(handler) => handler
                .handle_write(self, changes, proposed)
                .map_err(ServerError::Rejected),
        }
    }
}

impl fmt::Debug for ServerPv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPv")
            .field("name", &self.inner.name)
            .field("writable", &self.inner.handler.is_some())
            .finish()
    }
}

/// Serves PVs created at runtime
#[derive(Clone, Default)]
pub struct PvRegistry {
    pvs: Arc<PvTable>,
}

impl PvRegistry {
    pub fn new() -> PvRegistry {
        PvRegistry::default()
    }

    /// Serve a read-only PV
    pub fn create_pv(&self, name: &str, initial: Structure) -> Result<ServerPv, ServerError> {
        self.insert(name, initial, None)
    }

    /// Serve a PV that clients can write, through `handler`
    pub fn create_pv_with_handler(
        &self,
        name: &str,
        initial: Structure,
        handler: impl WriteHandler,
    ) -> Result<ServerPv, ServerError> {
        self.insert(name, initial, Some(Box::new(handler)))
    }

    fn insert(
        &self,
        name: &str,
        initial: Structure,
        handler: Option<Box<dyn WriteHandler>>,
    ) -> Result<ServerPv, ServerError> {
        let mut pvs = lock(&self.pvs);
        if pvs.contains_key(name) {
            return Err(ServerError::AlreadyExists(name.to_string()));
        }
        let pv = ServerPv {
            inner: Arc::new(PvInner {
                name: name.to_string(),
                value: Mutex::new(initial),
                sender: Mutex::new(Some(broadcast::Sender::new(UPDATE_QUEUE_SIZE))),
                handler,
                registry: Arc::downgrade(&self.pvs),
            }),
        };
        debug!("Created PV {name}");
        pvs.insert(name.to_string(), pv.clone());
        Ok(pv)
    }

    pub fn get(&self, name: &str) -> Option<ServerPv> {
        lock(&self.pvs).get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.pvs).keys().cloned().collect()
    }

    fn find(&self, name: &str) -> Result<ServerPv, ServerError> {
        self.get(name)
            .ok_or_else(|| ServerError::NoSuchPv(name.to_string()))
    }
}

impl Provider for PvRegistry {
    fn provides(&self, pv_name: &str) -> bool {
        lock(&self.pvs).contains_key(pv_name)
    }

    fn read_value(&self, pv_name: &str) -> Result<Structure, ServerError> {
        Ok(self.find(pv_name)?.value())
    }

    fn write_value(
        &mut self,
        pv_name: &str,
        changes: &BitSet,
        proposed: Structure,
    ) -> Result<(), ServerError> {
        self.find(pv_name)?.write(changes, proposed)
    }

    fn monitor_value(&mut self, pv_name: &str) -> Result<broadcast::Receiver<Structure>, ServerError> {
        self.find(pv_name)?.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PvaData;

    fn initial() -> Structure {
        Structure::new("", "", vec![PvaData::double("value", 1.0), PvaData::int("count", 0)]).unwrap()
    }

    #[test]
    fn test_create_and_read() {
        let registry = PvRegistry::new();
        let pv = registry.create_pv("a", initial()).unwrap();
        assert!(registry.provides("a"));
        assert!(!registry.provides("b"));
        assert_eq!(
            registry.create_pv("a", initial()).unwrap_err(),
            ServerError::AlreadyExists("a".into())
        );
        assert_eq!(registry.read_value("a").unwrap(), pv.value());
        assert!(matches!(registry.read_value("b"), Err(ServerError::NoSuchPv(_))));
    }

    #[test]
    fn test_update_fans_out() {
        let mut registry = PvRegistry::new();
        let pv = registry.create_pv("a", initial()).unwrap();
        assert!(!pv.is_subscribed());
        let mut updates = registry.monitor_value("a").unwrap();
        assert!(pv.is_subscribed());

        let mut newer = pv.value();
        newer.get_mut("count").unwrap().set_value(3).unwrap();
        assert_eq!(pv.update(&newer).unwrap().iter().collect::<Vec<_>>(), vec![2]);
        // Unchanged values are not sent
        assert!(pv.update(&newer).unwrap().is_empty());

        assert_eq!(updates.try_recv().unwrap(), newer);
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn test_read_only_by_default() {
        let mut registry = PvRegistry::new();
        let pv = registry.create_pv("a", initial()).unwrap();
        let result = registry.write_value("a", &BitSet::new(), pv.value());
        assert_eq!(result, Err(ServerError::ReadOnly("a".into())));
    }

    #[test]
    fn test_handler() {
        let mut registry = PvRegistry::new();
        registry
            .create_pv_with_handler("a", initial(), |pv: &ServerPv, _: &BitSet, mut proposed: Structure| {
                let value = proposed.get("value").and_then(PvaData::as_f64).unwrap_or(0.0);
                if value < 0.0 {
                    return Err("Negative".to_string());
                }
                proposed.get_mut("value").unwrap().set_value(value.min(10.0)).unwrap();
                pv.update(&proposed).map(|_| ()).map_err(|e| e.to_string())
            })
            .unwrap();

        let mut proposed = registry.read_value("a").unwrap();
        proposed.get_mut("value").unwrap().set_value(20.0).unwrap();
        registry.write_value("a", &BitSet::new(), proposed.clone()).unwrap();
        assert_eq!(registry.read_value("a").unwrap().get("value").unwrap().as_f64(), Some(10.0));

        proposed.get_mut("value").unwrap().set_value(-1.0).unwrap();
        assert_eq!(
            registry.write_value("a", &BitSet::new(), proposed),
            Err(ServerError::Rejected("Negative".into()))
        );
    }

    #[test]
    fn test_close() {
        let mut registry = PvRegistry::new();
        let pv = registry.create_pv("a", initial()).unwrap();
        let mut updates = registry.monitor_value("a").unwrap();
        pv.close();
        assert!(pv.is_closed());
        assert!(!registry.provides("a"));
        assert!(matches!(
            updates.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
        assert!(matches!(pv.update(&initial()), Err(ServerError::Closed(_))));
        // The name can be used again
        registry.create_pv("a", initial()).unwrap();
    }
}
