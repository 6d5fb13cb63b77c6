use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use crate::{
    client::{Client, ClientError},
    pv::Pv,
};

/// Shares one [`Pv`] per name between its users
///
/// Every [`acquire`](PvPool::acquire) must be matched by a
/// [`release`](PvPool::release). The PV closes with the last release.
pub struct PvPool {
    client: Client,
    pvs: Mutex<HashMap<String, (Pv, usize)>>,
}

impl PvPool {
    pub fn new(client: Client) -> PvPool {
        PvPool {
            client,
            pvs: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Pv, usize)>> {
        self.pvs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The PV for `name`, created if this is its first user
    pub fn acquire(&self, name: &str) -> Result<Pv, ClientError> {
        let mut pvs = self.lock();
        if let Some((pv, references)) = pvs.get_mut(name) {
            *references += 1;
            return Ok(pv.clone());
        }
        debug!("Creating pooled PV {name}");
        let pv = Pv::new(self.client.channel(name))?;
        pvs.insert(name.to_string(), (pv.clone(), 1));
        Ok(pv)
    }

    /// Give back a PV from [`acquire`](PvPool::acquire)
    ///
    /// Returns the number of users left. Releasing a PV the pool does not
    /// hold does nothing.
    pub async fn release(&self, pv: &Pv) -> usize {
        let closing = {
            let mut pvs = self.lock();
            let Some((_, references)) = pvs.get_mut(pv.name()) else {
                return 0;
            };
            *references -= 1;
            if *references > 0 {
                return *references;
            }
            pvs.remove(pv.name())
        };
        if let Some((pv, _)) = closing {
            debug!("Closing pooled PV {}", pv.name());
            pv.close().await;
        }
        0
    }

    /// Users of the PV for `name`
    pub fn references(&self, name: &str) -> usize {
        self.lock().get(name).map_or(0, |(_, references)| *references)
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}
