//! Delivery loops behind the asynchronous listener policies.
//!
//! Both loops drain their queue until every sender is gone, so notifications accepted before a
//! shutdown are still delivered.

use crate::listeners::registry::{CacheListener, Notification};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// Hands one notification to a listener. Errors and panics are logged and swallowed so the
/// listener keeps receiving later notifications.
pub(crate) fn deliver<T>(registry: &str, listener: &dyn CacheListener<T>, notification: Notification<T>) {
    let channel = notification.channel();
    let outcome = catch_unwind(AssertUnwindSafe(|| match notification {
        Notification::ValueUpdated(object) => listener.on_value_updated(object),
        Notification::SupervisionChanged(object) => listener.on_supervision_changed(object),
        Notification::StatusConfirmation(object, timestamp) => {
            listener.on_status_confirmation(object, timestamp)
        }
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(registry, ?channel, "Listener failed: {}", e),
        Err(_) => error!(registry, ?channel, "Listener panicked while handling notification"),
    }
}

fn deliver_batch<T>(registry: &str, listener: &dyn CacheListener<T>, batch: Vec<Notification<T>>) {
    if batch.is_empty() {
        return;
    }
    let size = batch.len();
    let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_batch(batch)));
    match outcome {
        Ok(Ok(())) => trace!(registry, size, "Delivered notification batch"),
        Ok(Err(e)) => error!(registry, size, "Batch listener failed: {}", e),
        Err(_) => error!(registry, size, "Batch listener panicked"),
    }
}

/// Worker of a multi-threaded registration. Several workers share one receiver.
pub(crate) fn run_worker<T>(
    registry: String,
    listener: Arc<dyn CacheListener<T>>,
    receiver: Receiver<Notification<T>>,
) {
    while let Ok(notification) = receiver.recv() {
        deliver(&registry, listener.as_ref(), notification);
    }
    trace!(registry = %registry, "Dispatch worker stopped");
}

/// Collects notifications and flushes them every `flush_period`, or earlier once `max_batch`
/// notifications are waiting. The period is kept under a steady stream too.
pub(crate) fn run_buffer<T>(
    registry: String,
    listener: Arc<dyn CacheListener<T>>,
    receiver: Receiver<Notification<T>>,
    flush_period: Duration,
    max_batch: usize,
) {
    let max_batch = max_batch.max(1);
    let mut batch = Vec::new();
    let mut deadline = Instant::now() + flush_period;
    loop {
        let wait = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(wait) {
            Ok(notification) => {
                batch.push(notification);
                if batch.len() >= max_batch {
                    deliver_batch(&registry, listener.as_ref(), std::mem::take(&mut batch));
                }
                if Instant::now() >= deadline {
                    deliver_batch(&registry, listener.as_ref(), std::mem::take(&mut batch));
                    deadline = Instant::now() + flush_period;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                deliver_batch(&registry, listener.as_ref(), std::mem::take(&mut batch));
                deadline = Instant::now() + flush_period;
            }
            Err(RecvTimeoutError::Disconnected) => {
                deliver_batch(&registry, listener.as_ref(), std::mem::take(&mut batch));
                break;
            }
        }
    }
    trace!(registry = %registry, "Buffered dispatcher stopped");
}
