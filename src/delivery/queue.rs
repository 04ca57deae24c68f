//! Ordered per-destination delivery queues
//!
//! Every destination channel gets a lazily spawned actor task fed by its own
//! unbounded channel. The actor is the only sender for its destination, so
//! the order jobs reach the transport is the order they were enqueued.
//!
//! ```text
//!            enqueue(job)
//!                 │
//!     ┌───────────┼───────────┐
//!     ▼           ▼           ▼
//! ┌───────┐   ┌───────┐   ┌───────┐      one actor per destination
//! │ dest A│   │ dest B│   │ dest C│      waits on its budget, then sends
//! └───┬───┘   └───┬───┘   └───┬───┘
//!     └───────────┼───────────┘
//!                 ▼
//!             Transport
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::audit::AuditRecorder;
use super::ratelimit::DestinationLimiter;
use super::transport::{OutboundJob, Transport, TransportError};
use super::DeliveryError;
use crate::metrics;

/// Attempts per job when the platform keeps answering 429
const MAX_RATE_LIMIT_ATTEMPTS: u32 = 3;

/// Backoff when a 429 carries no retry hint
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

struct QueueHandle {
    tx: mpsc::UnboundedSender<OutboundJob>,
    pending: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

/// Shared pieces every actor needs
#[derive(Clone)]
struct ActorContext {
    limiter: Arc<DestinationLimiter>,
    transport: Arc<dyn Transport>,
    audit: AuditRecorder,
}

/// Registry of per-destination actors
pub struct DestinationQueues {
    context: ActorContext,
    handles: Mutex<HashMap<String, QueueHandle>>,
}

impl DestinationQueues {
    pub fn new(
        limiter: Arc<DestinationLimiter>,
        transport: Arc<dyn Transport>,
        audit: AuditRecorder,
    ) -> Self {
        Self {
            context: ActorContext {
                limiter,
                transport,
                audit,
            },
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Append a job to its destination's queue
    pub fn enqueue(&self, job: OutboundJob) -> Result<(), DeliveryError> {
        let key = job.destination.channel.clone();
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| DeliveryError::QueueClosed { destination: key.clone() })?;

        let needs_spawn = handles.get(&key).map_or(true, |h| h.tx.is_closed());
        if needs_spawn {
            let handle = self.spawn_actor(key.clone());
            handles.insert(key.clone(), handle);
        }

        let handle = handles
            .get(&key)
            .ok_or_else(|| DeliveryError::QueueClosed { destination: key.clone() })?;
        handle.pending.fetch_add(1, Ordering::SeqCst);
        if handle.tx.send(job).is_err() {
            handle.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(DeliveryError::QueueClosed { destination: key });
        }
        // The map lock is held here, so sum through the guard
        let depth = handles.values().map(|q| q.pending.load(Ordering::SeqCst)).sum();
        metrics::set_queue_depth(depth);
        Ok(())
    }

    /// Jobs waiting for one destination
    pub fn pending(&self, channel: &str) -> usize {
        self.handles
            .lock()
            .ok()
            .and_then(|h| h.get(channel).map(|q| q.pending.load(Ordering::SeqCst)))
            .unwrap_or(0)
    }

    /// Jobs waiting across all destinations
    pub fn total_pending(&self) -> usize {
        self.handles
            .lock()
            .map(|h| h.values().map(|q| q.pending.load(Ordering::SeqCst)).sum())
            .unwrap_or(0)
    }

    /// Number of live destination actors
    pub fn destinations(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    /// Close every queue and wait until all queued jobs were handled
    pub async fn drain(&self) {
        let handles: Vec<QueueHandle> = match self.handles.lock() {
            Ok(mut map) => map.drain().map(|(_, h)| h).collect(),
            Err(_) => return,
        };
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            drop(handle.tx);
            tasks.push(handle.task);
        }
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Destination actor ended abnormally");
            }
        }
        metrics::set_queue_depth(0);
    }

    /// Abort every actor, dropping queued jobs
    pub fn abort(&self) {
        if let Ok(mut map) = self.handles.lock() {
            for (_, handle) in map.drain() {
                handle.task.abort();
            }
        }
    }

    fn spawn_actor(&self, destination: String) -> QueueHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(run_actor(
            destination,
            rx,
            Arc::clone(&pending),
            self.context.clone(),
        ));
        QueueHandle { tx, pending, task }
    }
}

async fn run_actor(
    destination: String,
    mut rx: mpsc::UnboundedReceiver<OutboundJob>,
    pending: Arc<AtomicUsize>,
    context: ActorContext,
) {
    tracing::debug!(destination = %destination, "Destination actor started");

    while let Some(job) = rx.recv().await {
        context.limiter.until_ready(&job.destination).await;
        send_with_backoff(&context, &job).await;
        pending.fetch_sub(1, Ordering::SeqCst);
    }

    tracing::debug!(destination = %destination, "Destination actor stopped");
}

/// Send one job, retrying the same job on 429 so later jobs cannot overtake it
async fn send_with_backoff(context: &ActorContext, job: &OutboundJob) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match context.transport.send(job).await {
            Ok(()) => {
                metrics::record_delivery("sent");
                return;
            }
            Err(TransportError::RateLimited { retry_after }) if attempt < MAX_RATE_LIMIT_ATTEMPTS => {
                let wait = retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
                tracing::debug!(
                    destination = %job.destination.channel,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "Platform rate limit, holding queue"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                metrics::record_delivery("failed");
                handle_send_error(&context.transport, &context.audit, job, &e).await;
                return;
            }
        }
    }
}

/// Record a failed send and, for rejected payloads, tell the destination
pub(crate) async fn handle_send_error(
    transport: &Arc<dyn Transport>,
    audit: &AuditRecorder,
    job: &OutboundJob,
    error: &TransportError,
) {
    tracing::warn!(
        destination = %job.destination.channel,
        item_id = %job.metadata.item_id,
        error = %error,
        "Delivery failed"
    );
    audit.record_failure(&job.metadata, &error.to_string()).await;

    if let TransportError::InvalidPayload(reason) = error {
        let notice = format!(
            "Failed to deliver an article from <{}>: the message was rejected as invalid ({}).",
            job.metadata.source_url, reason
        );
        if let Err(e) = transport.send_notice(&job.destination, &notice).await {
            tracing::debug!(
                destination = %job.destination.channel,
                error = %e,
                "Failed to send invalid payload notice"
            );
        }
    }
}
