// Change notification bus
// Delivers connection and state events to subscribers through a dispatch context

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use tokio::sync::mpsc;

use crate::auth::StateChange;
use crate::connection::{Connection, ConnectionId, FeatureId};

/// Event topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ConnectionStateChanged,
    ActiveConnectionChanged,
    ScopesChanged,
}

/// Events published on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StateChanged(StateChange),
    ActiveConnectionChanged {
        feature: FeatureId,
        connection: Option<Connection>,
    },
    ScopesChanged {
        connection_id: ConnectionId,
        scopes: Vec<String>,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::StateChanged(_) => Topic::ConnectionStateChanged,
            Event::ActiveConnectionChanged { .. } => Topic::ActiveConnectionChanged,
            Event::ScopesChanged { .. } => Topic::ScopesChanged,
        }
    }
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Execution context in which event delivery runs
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job);
}

/// Runs every job inline on the publishing thread
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateDispatcher;

impl Dispatcher for ImmediateDispatcher {
    fn dispatch(&self, job: Job) {
        job();
    }
}

/// Single dedicated thread running jobs in submission order
///
/// The queue is unbounded: every job is delivered, none are coalesced or
/// dropped for slow listeners.
pub struct ThreadDispatcher {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadDispatcher {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    job();
                }
                tracing::debug!("Dispatch thread exiting");
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop accepting jobs, run the queued ones, then join the thread
    pub fn shutdown(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                tracing::error!("Dispatch thread panicked");
            }
        }
    }
}

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&self, job: Job) {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(job).is_err() {
                    tracing::warn!("Dispatch thread is gone, dropping event delivery");
                }
            }
            None => tracing::warn!("Dispatcher shut down, dropping event delivery"),
        }
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle for a registered listener
/// Stays registered until passed to `ChangeNotifier::unsubscribe`
#[must_use = "a subscription must be released with ChangeNotifier::unsubscribe"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: u64,
    topic: Topic,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

struct Listener {
    id: u64,
    topic: Topic,
    handler: Handler,
}

/// Publish/subscribe bus for connection events
pub struct ChangeNotifier {
    listeners: RwLock<Vec<Listener>>,
    next_id: AtomicU64,
    dispatcher: Arc<dyn Dispatcher>,
}

impl ChangeNotifier {
    pub fn new(dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dispatcher,
        }
    }

    /// Notifier delivering inline, for tests and headless use
    pub fn immediate() -> Self {
        Self::new(Arc::new(ImmediateDispatcher))
    }

    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(Listener {
            id,
            topic,
            handler: Arc::new(handler),
        });
        tracing::debug!(subscription = id, topic = ?topic, "Listener subscribed");
        Subscription { id, topic }
    }

    /// Remove a listener; a delivery already handed to the dispatcher still reaches it
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|l| l.id != subscription.id);
        let removed = listeners.len() != before;
        if removed {
            tracing::debug!(subscription = subscription.id, "Listener unsubscribed");
        }
        removed
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.iter().filter(|l| l.topic == topic).count()
    }

    /// Deliver `event` to every current subscriber of its topic, in subscription order
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        let handlers: Vec<Handler> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .filter(|l| l.topic == topic)
                .map(|l| Arc::clone(&l.handler))
                .collect()
        };

        if handlers.is_empty() {
            return;
        }

        tracing::trace!(topic = ?topic, listeners = handlers.len(), "Publishing event");
        self.dispatcher.dispatch(Box::new(move || {
            for handler in &handlers {
                handler(&event);
            }
        }));
    }
}
