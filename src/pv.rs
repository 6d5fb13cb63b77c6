//! A PV that follows its own value, for applications that only want
//! the latest value and connection changes

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    client::{Channel, ChannelState, ClientError, Subscription},
    data::{PvaData, Structure},
};

/// Something that happened to a [`Pv`]
#[derive(Debug, Clone, PartialEq)]
pub enum PvEvent {
    Connected,
    Disconnected,
    /// A new complete value
    Value(Structure),
}

/// Identifies a listener added to a [`Pv`], for removing it again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&PvEvent) + Send>;

enum Dispatch {
    Event(PvEvent),
    /// Tell a new listener what it missed
    Greet(ListenerId),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Shared {
    value: Mutex<Option<Structure>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
}

impl Shared {
    fn notify(&self, event: &PvEvent) {
        for (_, listener) in lock(&self.listeners).iter_mut() {
            listener(event);
        }
    }

    fn greet(&self, id: ListenerId) {
        let value = lock(&self.value).clone();
        let mut listeners = lock(&self.listeners);
        let Some((_, listener)) = listeners.iter_mut().find(|(i, _)| *i == id) else {
            return;
        };
        if let Some(value) = value {
            listener(&PvEvent::Connected);
            listener(&PvEvent::Value(value));
        }
    }
}

struct PvInner {
    channel: Channel,
    shared: Arc<Shared>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    subscription: Mutex<Option<Subscription>>,
    next_listener: AtomicU64,
    stop: CancellationToken,
}

impl Drop for PvInner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// A channel monitored as a whole, remembering its latest value
///
/// Listeners run on a notification thread owned by the PV, and must not
/// add or remove listeners themselves. Clones share the same PV.
#[derive(Clone)]
pub struct Pv {
    inner: Arc<PvInner>,
}

impl Pv {
    /// Start following a channel
    pub fn new(channel: Channel) -> Result<Pv, ClientError> {
        let shared = Arc::new(Shared::default());
        let (dispatch, mut queue) = mpsc::unbounded_channel::<Dispatch>();

        let notifier = shared.clone();
        thread::Builder::new()
            .name("pva-pv".to_string())
            .spawn(move || {
                while let Some(item) = queue.blocking_recv() {
                    match item {
                        Dispatch::Event(event) => notifier.notify(&event),
                        Dispatch::Greet(id) => notifier.greet(id),
                    }
                }
            })?;

        let values = shared.clone();
        let value_dispatch = dispatch.clone();
        let subscription = channel.subscribe("", move |event| {
            *lock(&values.value) = Some(event.value.clone());
            let _ = value_dispatch.send(Dispatch::Event(PvEvent::Value(event.value)));
        })?;

        let stop = CancellationToken::new();
        tokio::spawn(follow_state(
            channel.watch_state(),
            shared.clone(),
            dispatch.clone(),
            stop.clone(),
        ));

        Ok(Pv {
            inner: Arc::new(PvInner {
                channel,
                shared,
                dispatch,
                subscription: Mutex::new(Some(subscription)),
                next_listener: AtomicU64::new(1),
                stop,
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.channel.name()
    }

    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// The latest value, if connected and one has arrived
    pub fn read(&self) -> Option<Structure> {
        lock(&self.inner.shared.value).clone()
    }

    /// Write to the `value` field
    pub async fn write(&self, value: impl Into<PvaData>) -> Result<(), ClientError> {
        self.inner.channel.write("value", value).await
    }

    /// Call `listener` with every future event
    ///
    /// If the PV already has a value, the listener first receives
    /// [`PvEvent::Connected`] and that value.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&PvEvent) + Send + 'static,
    {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.shared.listeners).push((id, Box::new(listener)));
        let _ = self.inner.dispatch.send(Dispatch::Greet(id));
        id
    }

    /// Returns whether the listener was present
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.shared.listeners);
        let before = listeners.len();
        listeners.retain(|(i, _)| *i != id);
        listeners.len() != before
    }

    /// Stop following the PV, and close its channel
    pub async fn close(&self) {
        self.inner.stop.cancel();
        drop(lock(&self.inner.subscription).take());
        self.inner.channel.close().await;
    }
}

impl fmt::Debug for Pv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pv")
            .field("name", &self.name())
            .field("state", &self.inner.channel.state())
            .finish()
    }
}

/// Turn channel state changes into connection events
async fn follow_state(
    mut state: watch::Receiver<ChannelState>,
    shared: Arc<Shared>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    stop: CancellationToken,
) {
    let mut connected = false;
    loop {
        let current = *state.borrow_and_update();
        trace!("PV channel is now {current}");
        match current {
            ChannelState::Connected if !connected => {
                connected = true;
                let _ = dispatch.send(Dispatch::Event(PvEvent::Connected));
            }
            ChannelState::Connected => (),
            _ if connected => {
                connected = false;
                // A value from a lost server is no longer current
                lock(&shared.value).take();
                let _ = dispatch.send(Dispatch::Event(PvEvent::Disconnected));
            }
            _ => (),
        }
        if current == ChannelState::Closed {
            break;
        }
        tokio::select! {
            _ = stop.cancelled() => break,
            changed = state.changed() => if changed.is_err() {
                break;
            },
        }
    }
    debug!("Stopped following PV state");
}
