//! Fan-out registry for real-time clients
//!
//! Every subscriber owns a bounded queue. Publishing clones an `Arc` of the
//! event into each queue with `try_send`, so a stalled client loses events
//! instead of slowing ingestion or the other clients. The client map is only
//! locked to join, leave, or take a snapshot of the senders.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

/// One published event as delivered to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubEvent {
    pub event: String,
    pub data: serde_json::Value,
}

/// Subscriber registration handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(u64);

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Outcome of a single publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Clients the event was queued for
    pub delivered: usize,
    /// Clients whose queue was full
    pub dropped: usize,
    /// Clients found gone and removed
    pub pruned: usize,
}

struct HubInner {
    clients: Mutex<HashMap<ClientHandle, mpsc::Sender<Arc<HubEvent>>>>,
    next_id: AtomicU64,
    client_buffer: usize,
    dropped_total: AtomicU64,
}

impl HubInner {
    fn clients(&self) -> MutexGuard<'_, HashMap<ClientHandle, mpsc::Sender<Arc<HubEvent>>>> {
        // Senders hold no invariants a panicking holder could break
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Shared registry of connected clients
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    /// Create a hub whose clients each buffer up to `client_buffer` events
    pub fn new(client_buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                client_buffer: client_buffer.max(1),
                dropped_total: AtomicU64::new(0),
            }),
        }
    }

    /// Register a new client
    pub fn subscribe(&self) -> Subscription {
        let handle = ClientHandle(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.inner.client_buffer);

        let count = {
            let mut clients = self.inner.clients();
            clients.insert(handle, sender);
            clients.len()
        };
        tracing::debug!(client = handle.id(), clients = count, "client subscribed");

        Subscription {
            handle,
            receiver,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a client. Returns false if it was not registered.
    pub fn unsubscribe(&self, handle: ClientHandle) -> bool {
        remove_client(&self.inner, handle)
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.inner.clients().len()
    }

    /// Events dropped on full client queues since the hub was created
    pub fn dropped_total(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    /// Deliver `payload` under `event` to every registered client.
    ///
    /// Never blocks. With no clients this is a no-op.
    pub fn publish(&self, event: &str, payload: serde_json::Value) -> PublishReport {
        let snapshot: Vec<(ClientHandle, mpsc::Sender<Arc<HubEvent>>)> = {
            let clients = self.inner.clients();
            if clients.is_empty() {
                return PublishReport::default();
            }
            clients.iter().map(|(h, s)| (*h, s.clone())).collect()
        };

        let shared = Arc::new(HubEvent {
            event: event.to_string(),
            data: payload,
        });

        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        for (handle, sender) in snapshot {
            match sender.try_send(Arc::clone(&shared)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    tracing::debug!(client = handle.id(), event, "client queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => closed.push(handle),
            }
        }

        if report.dropped > 0 {
            self.inner
                .dropped_total
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
        }

        if !closed.is_empty() {
            let mut clients = self.inner.clients();
            for handle in closed {
                if clients.remove(&handle).is_some() {
                    report.pruned += 1;
                }
            }
        }

        report
    }

    /// Serialize `payload` and publish it
    pub fn publish_json<T: Serialize>(&self, event: &str, payload: &T) -> Result<PublishReport, serde_json::Error> {
        Ok(self.publish(event, serde_json::to_value(payload)?))
    }
}

fn remove_client(inner: &HubInner, handle: ClientHandle) -> bool {
    let (removed, count) = {
        let mut clients = inner.clients();
        let removed = clients.remove(&handle).is_some();
        (removed, clients.len())
    };
    if removed {
        tracing::debug!(client = handle.id(), clients = count, "client unsubscribed");
    }
    removed
}

/// A client's end of the hub. Dropping it unsubscribes the client.
pub struct Subscription {
    handle: ClientHandle,
    receiver: mpsc::Receiver<Arc<HubEvent>>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    /// Wait for the next event. Returns `None` once the client was unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<HubEvent>> {
        self.receiver.recv().await
    }

    /// Take the next event if one is already queued
    pub fn try_recv(&mut self) -> Option<Arc<HubEvent>> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            remove_client(&inner, self.handle);
        }
    }
}
