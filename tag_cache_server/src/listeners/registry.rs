//! Listener registration and fan-out of cache change notifications.
//!
//! ```text
//! writer: lock -> mutate -> deep copy -> unlock -> notify_*()
//!                                                   |
//!            +--------------------------------------+---------------------------+
//!            v                                      v                           v
//!      Synchronous                             WorkerPool                    Buffered
//!  (caller thread)                  bounded queue -> N workers   bounded queue -> batch every period
//! ```
//!
//! Every listener receives its own deep copy. Queue pushes block when a queue is full: losing an
//! event is worse than throttling the producer.

use crate::clock::Timestamp;
use crate::errors::ListenerError;
use crate::listeners::dispatch::{deliver, run_buffer, run_worker};
use crate::store::CacheObject;
use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type ListenerId = u64;

/// Notification channels a listener can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    ValueUpdated,
    SupervisionChanged,
    StatusConfirmation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    ValueUpdated(T),
    SupervisionChanged(T),
    StatusConfirmation(T, Timestamp),
}

impl<T> Notification<T> {
    pub fn channel(&self) -> Channel {
        match self {
            Notification::ValueUpdated(_) => Channel::ValueUpdated,
            Notification::SupervisionChanged(_) => Channel::SupervisionChanged,
            Notification::StatusConfirmation(..) => Channel::StatusConfirmation,
        }
    }

    pub fn object(&self) -> &T {
        match self {
            Notification::ValueUpdated(object)
            | Notification::SupervisionChanged(object)
            | Notification::StatusConfirmation(object, _) => object,
        }
    }
}

/// Consumer of cache notifications. Each call owns an independent copy.
pub trait CacheListener<T>: Send + Sync {
    fn on_value_updated(&self, object: T) -> Result<(), ListenerError>;

    fn on_supervision_changed(&self, _object: T) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Periodic "still valid" heartbeat, independent of value changes.
    fn on_status_confirmation(&self, _object: T, _timestamp: Timestamp) -> Result<(), ListenerError> {
        Ok(())
    }

    /// Called by buffered registrations with everything collected during one flush period.
    ///
    /// The default hands every notification to the per-channel callbacks. A failing item does not
    /// stop the rest of the batch; the failures are reported together.
    fn on_batch(&self, batch: Vec<Notification<T>>) -> Result<(), ListenerError> {
        let size = batch.len();
        let mut failures = Vec::new();
        for notification in batch {
            let outcome = match notification {
                Notification::ValueUpdated(object) => self.on_value_updated(object),
                Notification::SupervisionChanged(object) => self.on_supervision_changed(object),
                Notification::StatusConfirmation(object, timestamp) => {
                    self.on_status_confirmation(object, timestamp)
                }
            };
            if let Err(e) = outcome {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ListenerError::Failed(format!(
                "{} of {} batched notifications failed: {}",
                failures.len(),
                size,
                failures.join("; ")
            )))
        }
    }
}

/// Which channels a registration receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channels {
    pub value: bool,
    pub supervision: bool,
    pub confirmation: bool,
}

impl Channels {
    pub const VALUE: Channels = Channels {
        value: true,
        supervision: false,
        confirmation: false,
    };
    pub const SUPERVISION: Channels = Channels {
        value: false,
        supervision: true,
        confirmation: false,
    };
    pub const VALUE_AND_SUPERVISION: Channels = Channels {
        value: true,
        supervision: true,
        confirmation: false,
    };
    pub const ALL: Channels = Channels {
        value: true,
        supervision: true,
        confirmation: true,
    };

    pub fn accepts(&self, channel: Channel) -> bool {
        match channel {
            Channel::ValueUpdated => self.value,
            Channel::SupervisionChanged => self.supervision,
            Channel::StatusConfirmation => self.confirmation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Delivered on the notifying thread before `notify_*` returns.
    Synchronous,
    /// Coalesced and delivered through `on_batch` once per `flush_period`.
    Buffered {
        flush_period: Duration,
        capacity: usize,
    },
    /// Pushed to a bounded queue drained by `workers` threads.
    WorkerPool { workers: usize, queue_capacity: usize },
}

struct QueueSink<T> {
    sender: Mutex<Option<Sender<Notification<T>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

enum Sink<T> {
    Direct(Arc<dyn CacheListener<T>>),
    Queue(QueueSink<T>),
}

struct Registration<T> {
    id: ListenerId,
    channels: Channels,
    sink: Sink<T>,
}

impl<T> Registration<T> {
    /// Stops accepting notifications. Queue threads finish what is already queued.
    fn close(&self) -> Vec<JoinHandle<()>> {
        match &self.sink {
            Sink::Direct(_) => Vec::new(),
            Sink::Queue(queue) => {
                queue.sender.lock().take();
                std::mem::take(&mut *queue.threads.lock())
            }
        }
    }
}

/// Registry of listeners for one cache object type.
pub struct ListenerRegistry<T> {
    name: String,
    registrations: RwLock<Vec<Arc<Registration<T>>>>,
    next_id: AtomicU64,
}

impl<T: CacheObject> ListenerRegistry<T> {
    pub fn new(name: impl Into<String>) -> Self {
        ListenerRegistry {
            name: name.into(),
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(
        &self,
        listener: Arc<dyn CacheListener<T>>,
        channels: Channels,
        policy: DeliveryPolicy,
    ) -> Result<ListenerId, ListenerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sink = match policy {
            DeliveryPolicy::Synchronous => Sink::Direct(listener),
            DeliveryPolicy::WorkerPool {
                workers,
                queue_capacity,
            } => {
                let (sender, receiver) = bounded(queue_capacity.max(1));
                let mut threads = Vec::new();
                for worker in 0..workers.max(1) {
                    let registry = self.name.clone();
                    let listener = Arc::clone(&listener);
                    let receiver = receiver.clone();
                    let handle = thread::Builder::new()
                        .name(format!("{}-listener-{}-{}", self.name, id, worker))
                        .spawn(move || run_worker(registry, listener, receiver))
                        .map_err(|e| ListenerError::Spawn(e.to_string()))?;
                    threads.push(handle);
                }
                Sink::Queue(QueueSink {
                    sender: Mutex::new(Some(sender)),
                    threads: Mutex::new(threads),
                })
            }
            DeliveryPolicy::Buffered {
                flush_period,
                capacity,
            } => {
                let (sender, receiver) = bounded(capacity.max(1));
                let registry = self.name.clone();
                let handle = thread::Builder::new()
                    .name(format!("{}-buffer-{}", self.name, id))
                    .spawn(move || run_buffer(registry, listener, receiver, flush_period, capacity))
                    .map_err(|e| ListenerError::Spawn(e.to_string()))?;
                Sink::Queue(QueueSink {
                    sender: Mutex::new(Some(sender)),
                    threads: Mutex::new(vec![handle]),
                })
            }
        };

        self.registrations.write().push(Arc::new(Registration { id, channels, sink }));
        debug!(registry = %self.name, listener_id = id, ?policy, "Listener registered");
        Ok(id)
    }

    /// Removes a registration. Queued notifications are still delivered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let removed = {
            let mut registrations = self.registrations.write();
            let position = registrations.iter().position(|r| r.id == id);
            position.map(|index| registrations.remove(index))
        };
        match removed {
            Some(registration) => {
                // Threads detach and exit once drained.
                drop(registration.close());
                debug!(registry = %self.name, listener_id = id, "Listener unregistered");
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn notify_value_updated(&self, object: &T) -> usize {
        self.dispatch(object, Channel::ValueUpdated, Notification::ValueUpdated)
    }

    pub fn notify_supervision_changed(&self, object: &T) -> usize {
        self.dispatch(object, Channel::SupervisionChanged, Notification::SupervisionChanged)
    }

    pub fn notify_status_confirmation(&self, object: &T, timestamp: Timestamp) -> usize {
        self.dispatch(object, Channel::StatusConfirmation, |copy| {
            Notification::StatusConfirmation(copy, timestamp)
        })
    }

    /// Returns the number of registrations the notification was handed to.
    fn dispatch(
        &self,
        object: &T,
        channel: Channel,
        wrap: impl Fn(T) -> Notification<T>,
    ) -> usize {
        // Snapshot so listeners may (un)register from inside a callback.
        let targets: Vec<Arc<Registration<T>>> = self
            .registrations
            .read()
            .iter()
            .filter(|r| r.channels.accepts(channel))
            .cloned()
            .collect();

        let mut delivered = 0;
        for registration in targets {
            let notification = wrap(object.deep_copy());
            match &registration.sink {
                Sink::Direct(listener) => {
                    deliver(&self.name, listener.as_ref(), notification);
                    delivered += 1;
                }
                Sink::Queue(queue) => {
                    let sender = queue.sender.lock().clone();
                    match sender {
                        // Blocks while the queue is full.
                        Some(sender) => {
                            if sender.send(notification).is_ok() {
                                delivered += 1;
                            } else {
                                warn!(registry = %self.name, listener_id = registration.id, "Dispatch queue closed, notification dropped");
                            }
                        }
                        None => {
                            debug!(registry = %self.name, listener_id = registration.id, "Registration closing, skipped");
                        }
                    }
                }
            }
        }
        delivered
    }

    /// Closes every registration and waits for queued notifications to be delivered.
    pub fn shutdown(&self) {
        let registrations = std::mem::take(&mut *self.registrations.write());
        let current = thread::current().id();
        let mut joined = 0;
        for registration in registrations {
            for handle in registration.close() {
                if handle.thread().id() == current {
                    continue;
                }
                if handle.join().is_err() {
                    warn!(registry = %self.name, "Dispatch thread terminated abnormally");
                }
                joined += 1;
            }
        }
        if joined > 0 {
            info!(registry = %self.name, threads = joined, "Listener dispatch shut down");
        }
    }
}

impl<T> Drop for ListenerRegistry<T> {
    fn drop(&mut self) {
        let current = thread::current().id();
        for registration in std::mem::take(&mut *self.registrations.get_mut()) {
            for handle in registration.close() {
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
        }
    }
}
