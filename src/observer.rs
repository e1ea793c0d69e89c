//! Asynchronous per-object event bus
//!
//! Every component that emits events owns one [`EventBus`]. Registration,
//! removal and firing all go through one ordered command queue drained by a
//! single worker, so a handler registered after a `fire` never observes that
//! event, and handlers never run on the caller's stack.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Default bound of the command queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// An event that can be dispatched through an [`EventBus`]
pub trait Event: Send + 'static {
    /// Payload-less discriminant handlers register against
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Identifies a registered handler for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<E> = Box<dyn FnMut(&E) + Send>;

enum Command<E: Event> {
    Register {
        kind: E::Kind,
        id: HandlerId,
        handler: Handler<E>,
        once: bool,
    },
    Unregister {
        kind: E::Kind,
        id: HandlerId,
    },
    Fire(E),
}

struct Entry<E> {
    id: HandlerId,
    handler: Handler<E>,
    once: bool,
}

/// Handler table owned by the worker
struct Dispatcher<E: Event> {
    handlers: HashMap<E::Kind, Vec<Entry<E>>>,
}

impl<E: Event> Dispatcher<E> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    fn apply(&mut self, command: Command<E>) {
        match command {
            Command::Register {
                kind,
                id,
                handler,
                once,
            } => {
                self.handlers
                    .entry(kind)
                    .or_default()
                    .push(Entry { id, handler, once });
            }
            Command::Unregister { kind, id } => {
                if let Some(entries) = self.handlers.get_mut(&kind) {
                    entries.retain(|entry| entry.id != id);
                }
            }
            Command::Fire(event) => {
                let kind = event.kind();
                let Some(entries) = self.handlers.get_mut(&kind) else {
                    return;
                };
                for entry in entries.iter_mut() {
                    let result = catch_unwind(AssertUnwindSafe(|| (entry.handler)(&event)));
                    if result.is_err() {
                        error!(kind = ?kind, "Event handler panicked");
                    }
                }
                entries.retain(|entry| !entry.once);
            }
        }
    }
}

/// Ordered, non-blocking event dispatcher
pub struct EventBus<E: Event> {
    tx: Option<mpsc::Sender<Command<E>>>,
    next_id: AtomicU64,
    poisoned: AtomicBool,
}

impl<E: Event> EventBus<E> {
    /// Create a bus with the default queue bound
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a bus whose command queue holds at most `capacity` entries.
    ///
    /// The worker runs as a Tokio task when called inside a runtime and on a
    /// dedicated thread otherwise.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let tx = match spawn_worker(rx) {
            Ok(()) => Some(tx),
            Err(e) => {
                error!(error = %e, "Failed to start event worker");
                None
            }
        };

        Self {
            tx,
            next_id: AtomicU64::new(1),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Register a persistent handler for `kind`
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> HandlerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.register(kind, Box::new(handler), false)
    }

    /// Register a handler that is removed after its first invocation
    pub fn once<F>(&self, kind: E::Kind, handler: F) -> HandlerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.register(kind, Box::new(handler), true)
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn off(&self, kind: E::Kind, id: HandlerId) {
        self.submit(Command::Unregister { kind, id });
    }

    /// Schedule delivery of `event` to every handler of its kind
    pub fn fire(&self, event: E) {
        self.submit(Command::Fire(event));
    }

    /// Whether the queue overflowed and the bus stopped accepting commands
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn register(&self, kind: E::Kind, handler: Handler<E>, once: bool) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.submit(Command::Register {
            kind,
            id,
            handler,
            once,
        });
        id
    }

    fn submit(&self, command: Command<E>) {
        if self.is_poisoned() {
            return;
        }

        let Some(tx) = self.tx.as_ref() else {
            return;
        };

        match tx.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!(
                    capacity = tx.max_capacity(),
                    "Event queue overflow, bus disabled"
                );
                self.poisoned.store(true, Ordering::Release);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event worker gone, command dropped");
            }
        }
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

fn spawn_worker<E: Event>(mut rx: mpsc::Receiver<Command<E>>) -> std::io::Result<()> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let mut dispatcher = Dispatcher::new();
                while let Some(command) = rx.recv().await {
                    dispatcher.apply(command);
                }
            });
            Ok(())
        }
        Err(_) => {
            std::thread::Builder::new()
                .name("rtm-event-bus".to_string())
                .spawn(move || {
                    let mut dispatcher = Dispatcher::new();
                    while let Some(command) = rx.blocking_recv() {
                        dispatcher.apply(command);
                    }
                })?;
            Ok(())
        }
    }
}
