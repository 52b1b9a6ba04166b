//! Proxy correlation table.
//!
//! Bridges the asynchronous signaling channel to the synchronous `/proxy`
//! HTTP call. Each in-flight request id moves `Dispatched -> Resolved` or
//! `Dispatched -> TimedOut`, never both.
//!
//! The map is guarded by a plain mutex and every critical section is a map
//! operation plus at most one non-blocking one-shot send, so resolution and
//! timeout removal are serialized against each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use pierce_common::ProxyResponse;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

static NEXT_WAIT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CorrelationError {
    #[error("request id already in flight: {0}")]
    DuplicateRequestId(String),
    #[error("no response for {0} before the deadline")]
    TimedOut(String),
    #[error("request {0} abandoned before a response arrived")]
    Abandoned(String),
}

/// Outcome of [`ProxyCorrelationTable::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// The waiter received the response.
    Delivered,
    /// No pending wait under that id: unknown, already resolved, or timed out.
    Unknown,
    /// The wait was pending but its waiter had already gone away.
    WaiterGone,
    /// The wait is addressed to a different device; it stays pending.
    WrongSender,
}

#[derive(Debug)]
struct PendingWait {
    wait_id: u64,
    device_id: String,
    tx: oneshot::Sender<ProxyResponse>,
}

type PendingMap = HashMap<String, PendingWait>;

fn lock(map: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Table of proxy requests awaiting a `proxy_response`.
#[derive(Debug, Clone, Default)]
pub struct ProxyCorrelationTable {
    pending: Arc<Mutex<PendingMap>>,
}

impl ProxyCorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wait for `request_id`, to be answered by `device_id` before `deadline`.
    pub fn begin(
        &self,
        request_id: &str,
        device_id: &str,
        deadline: Instant,
    ) -> Result<WaitHandle, CorrelationError> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(request_id) {
            warn!("rejecting duplicate in-flight request id {}", request_id);
            return Err(CorrelationError::DuplicateRequestId(request_id.to_string()));
        }

        let wait_id = NEXT_WAIT_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(
            request_id.to_string(),
            PendingWait {
                wait_id,
                device_id: device_id.to_string(),
                tx,
            },
        );
        debug!("proxy request {} dispatched to {}", request_id, device_id);

        Ok(WaitHandle {
            request_id: request_id.to_string(),
            wait_id,
            deadline,
            rx: Some(rx),
            pending: Arc::clone(&self.pending),
        })
    }

    /// Hand `response` from `sender_id` to the waiter registered under its
    /// request id. Only the device the request was dispatched to can resolve
    /// it.
    ///
    /// Never blocks: the send happens on a one-shot channel while the entry is
    /// removed, so a concurrent timeout observes either the entry or the value.
    pub fn resolve(&self, sender_id: &str, response: ProxyResponse) -> ResolveOutcome {
        let request_id = response.request_id.clone();
        let mut pending = lock(&self.pending);
        match pending.get(&request_id) {
            None => {
                drop(pending);
                debug!("no pending request for proxy response {}", request_id);
                return ResolveOutcome::Unknown;
            }
            Some(wait) if wait.device_id != sender_id => {
                let device_id = wait.device_id.clone();
                drop(pending);
                warn!(
                    "discarding proxy response {} from {}, request was sent to {}",
                    request_id, sender_id, device_id
                );
                return ResolveOutcome::WrongSender;
            }
            Some(_) => {}
        }
        let Some(wait) = pending.remove(&request_id) else {
            return ResolveOutcome::Unknown;
        };

        match wait.tx.send(response) {
            Ok(()) => {
                drop(pending);
                debug!("proxy response delivered for {}", request_id);
                ResolveOutcome::Delivered
            }
            Err(_) => {
                drop(pending);
                warn!("waiter for {} already gone, discarding response", request_id);
                ResolveOutcome::WaiterGone
            }
        }
    }

    /// Drop the wait for `request_id` without answering it.
    pub fn cancel(&self, request_id: &str) -> bool {
        lock(&self.pending).remove(request_id).is_some()
    }

    /// Abandon every wait addressed to `device_id`; their waiters fail fast.
    pub fn evict_device(&self, device_id: &str) -> usize {
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|_, wait| wait.device_id != device_id);
        let evicted = before - pending.len();
        drop(pending);

        if evicted > 0 {
            info!(
                "evicted {} pending proxy request(s) for disconnected device {}",
                evicted, device_id
            );
        }
        evicted
    }

    pub fn contains(&self, request_id: &str) -> bool {
        lock(&self.pending).contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }
}

/// Caller's side of one pending wait.
///
/// Dropping the handle before the wait completes removes the entry, so a
/// cancelled HTTP call does not leave a dangling wait behind.
#[derive(Debug)]
pub struct WaitHandle {
    request_id: String,
    wait_id: u64,
    deadline: Instant,
    rx: Option<oneshot::Receiver<ProxyResponse>>,
    pending: Arc<Mutex<PendingMap>>,
}

impl WaitHandle {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the response arrives or the deadline elapses.
    pub async fn wait(mut self) -> Result<ProxyResponse, CorrelationError> {
        let outcome = match self.rx.as_mut() {
            None => Err(CorrelationError::Abandoned(self.request_id.clone())),
            Some(rx) => match tokio::time::timeout_at(self.deadline, &mut *rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(CorrelationError::Abandoned(self.request_id.clone())),
                Err(_) => {
                    if remove_entry(&self.pending, &self.request_id, self.wait_id) {
                        info!("proxy request {} timed out", self.request_id);
                        Err(CorrelationError::TimedOut(self.request_id.clone()))
                    } else {
                        // A resolver won the race and sent while holding the lock.
                        rx.try_recv()
                            .map_err(|_| CorrelationError::Abandoned(self.request_id.clone()))
                    }
                }
            },
        };
        self.rx = None;
        outcome
    }
}

fn remove_entry(pending: &Mutex<PendingMap>, request_id: &str, wait_id: u64) -> bool {
    let mut pending = lock(pending);
    match pending.get(request_id) {
        Some(wait) if wait.wait_id == wait_id => {
            pending.remove(request_id);
            true
        }
        _ => false,
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if self.rx.is_some() && remove_entry(&self.pending, &self.request_id, self.wait_id) {
            debug!("proxy wait {} dropped before completion", self.request_id);
        }
    }
}
