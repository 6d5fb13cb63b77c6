use std::{
    io,
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tracing::trace;

use crate::{client::Channel, codec::BitSet, data::Structure};

/// Updates the connection will hold for a slow listener before merging them
pub(crate) const MONITOR_QUEUE_SIZE: usize = 4;

/// One monitor update, as delivered to a listener
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    /// Fields that changed, as pre-order indices into `value`
    pub changes: BitSet,
    /// Fields that changed more than once since the previous event
    pub overruns: BitSet,
    /// Updates merged into this one because the listener fell behind
    pub overrun_count: u64,
    /// The complete current value of the requested fields
    pub value: Structure,
}

impl MonitorEvent {
    /// Fold a later event into this one
    fn merge(&mut self, later: MonitorEvent) {
        for index in later.changes.iter() {
            if self.changes.get(index) {
                self.overruns.set(index);
            }
        }
        self.changes.union_with(&later.changes);
        self.overruns.union_with(&later.overruns);
        self.overrun_count += later.overrun_count + 1;
        self.value = later.value;
    }
}

/// The listener thread has finished
#[derive(Debug)]
pub(crate) struct ListenerGone;

type Pending = Arc<Mutex<Option<MonitorEvent>>>;

fn take_pending(pending: &Pending) -> Option<MonitorEvent> {
    pending.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Feeds events to a listener thread
///
/// Once the queue is full, further events merge into one pending event,
/// which the thread picks up after draining the queue.
#[derive(Debug, Clone)]
pub(crate) struct MonitorSender {
    queue: mpsc::Sender<MonitorEvent>,
    pending: Pending,
}

impl MonitorSender {
    /// Hand an event to the listener without waiting for it
    pub(crate) fn deliver(&self, event: MonitorEvent) -> Result<(), ListenerGone> {
        if self.queue.is_closed() {
            return Err(ListenerGone);
        }
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        // Queued events must all be older than the pending one
        if let Some(behind) = pending.as_mut() {
            behind.merge(event);
            return Ok(());
        }
        match self.queue.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                trace!("Listener is behind, merging updates");
                *pending = Some(event);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(ListenerGone),
        }
    }
}

/// Run `listener` on its own thread, for each event delivered to the returned sender
///
/// The thread finishes once every sender has been dropped.
pub(crate) fn spawn_listener<F>(mut listener: F) -> Result<MonitorSender, io::Error>
where
    F: FnMut(MonitorEvent) + Send + 'static,
{
    let (events_tx, mut events_rx) = mpsc::channel::<MonitorEvent>(MONITOR_QUEUE_SIZE);
    let pending = Pending::default();
    let thread_pending = pending.clone();
    thread::Builder::new()
        .name("pva-monitor".to_string())
        .spawn(move || {
            loop {
                let event = match events_rx.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => match take_pending(&thread_pending) {
                        Some(event) => event,
                        None => match events_rx.blocking_recv() {
                            Some(event) => event,
                            None => break,
                        },
                    },
                    Err(TryRecvError::Disconnected) => match take_pending(&thread_pending) {
                        Some(event) => event,
                        None => break,
                    },
                };
                listener(event);
            }
            trace!("Monitor listener finished");
        })?;
    Ok(MonitorSender {
        queue: events_tx,
        pending,
    })
}

/// An active monitor on a channel
///
/// The monitor is restarted whenever the channel reconnects, and stops
/// when this is cancelled or dropped.
pub struct Subscription {
    channel: Channel,
    ioid: u32,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(channel: Channel, ioid: u32) -> Subscription {
        Subscription {
            channel,
            ioid,
            active: true,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Stop receiving events
    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.channel.unsubscribe(self.ioid);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use super::*;
    use crate::data::PvaData;

    fn event(value: i32) -> MonitorEvent {
        MonitorEvent {
            changes: [1].into_iter().collect(),
            overruns: BitSet::new(),
            overrun_count: 0,
            value: Structure::new("", "", vec![PvaData::int("value", value)]).unwrap(),
        }
    }

    #[test]
    fn test_listener_thread() {
        let (seen_tx, seen_rx) = std_mpsc::channel();
        let events = spawn_listener(move |event: MonitorEvent| {
            let _ = seen_tx.send(event.value.get("value").and_then(PvaData::as_i64));
        })
        .unwrap();

        events.deliver(event(7)).unwrap();
        assert_eq!(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(7));

        // Dropping the sender ends the thread, and with it the listener
        drop(events);
        assert!(seen_rx.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_slow_listener_gets_merged_updates() {
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let (seen_tx, seen_rx) = std_mpsc::channel();
        let events = spawn_listener(move |event: MonitorEvent| {
            let _ = gate_rx.recv();
            let _ = seen_tx.send(event);
        })
        .unwrap();

        // Far more than the listener and its queue can hold
        for value in 0..20 {
            events.deliver(event(value)).unwrap();
        }
        for _ in 0..20 {
            gate_tx.send(()).unwrap();
        }

        let mut seen = Vec::new();
        loop {
            let event = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let value = event.value.get("value").and_then(PvaData::as_i64);
            seen.push(event);
            if value == Some(19) {
                break;
            }
        }
        let last = seen.last().unwrap();
        assert!(last.overrun_count > 0);
        assert!(last.overruns.get(1));
        // Every update is either delivered or counted
        let accounted: u64 = seen.iter().map(|e| 1 + e.overrun_count).sum();
        assert_eq!(accounted, 20);
        assert!(seen.len() <= 2 + MONITOR_QUEUE_SIZE);
    }
}
