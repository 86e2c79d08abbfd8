//! Queue transport.
//!
//! At-least-once delivery with visibility timeouts, SQS-shaped so a
//! networked queue can replace the in-process implementation behind the
//! same trait. Messages carry job ids; ordering across jobs is not
//! required (the conditional job claim makes duplicate delivery safe).

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use fl_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One leased message. Deleting the handle acknowledges the message;
/// letting the visibility timeout lapse redelivers it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub body: String,
    pub handle: u64,
}

#[async_trait::async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueue a message, optionally invisible for `delay`.
    async fn send(&self, body: String, delay: Option<Duration>) -> Result<()>;

    /// Wait up to `wait` for a message, leasing it for `visibility`.
    async fn receive(&self, visibility: Duration, wait: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge (permanently remove) a leased message.
    async fn delete(&self, handle: u64) -> Result<()>;

    /// Push a leased message's redelivery out to `now + delay`.
    async fn change_visibility(&self, handle: u64, delay: Duration) -> Result<()>;

    /// Number of messages waiting (not leased).
    fn depth(&self) -> usize;

    /// Liveness for the health endpoint.
    fn healthy(&self) -> bool {
        true
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Pending {
    body: String,
    ready_at: Instant,
    /// Send order; ready messages are delivered oldest-first.
    seq: u64,
}

struct Leased {
    body: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    pending: Vec<Pending>,
    leased: HashMap<u64, Leased>,
    next_handle: u64,
    next_seq: u64,
}

/// Tokio-native queue for single-process deployments and tests.
pub struct InProcessQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Move expired leases back to pending. Returns the next instant
    /// anything becomes ready, for sleep scheduling.
    fn promote(&self, inner: &mut Inner, now: Instant) -> Option<Instant> {
        let expired: Vec<u64> = inner
            .leased
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(h, _)| *h)
            .collect();
        for handle in expired {
            if let Some(lease) = inner.leased.remove(&handle) {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                inner.pending.push(Pending {
                    body: lease.body,
                    ready_at: now,
                    seq,
                });
            }
        }

        let next_pending = inner
            .pending
            .iter()
            .map(|p| p.ready_at)
            .filter(|t| *t > now)
            .min();
        let next_lease = inner.leased.values().map(|l| l.expires_at).min();
        match (next_pending, next_lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn try_pop(&self, visibility: Duration) -> (Option<Delivery>, Option<Instant>) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let next_wake = self.promote(&mut inner, now);

        let ready_idx = inner
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.ready_at <= now)
            .min_by_key(|(_, p)| p.seq)
            .map(|(i, _)| i);

        match ready_idx {
            Some(i) => {
                let entry = inner.pending.swap_remove(i);
                let handle = inner.next_handle;
                inner.next_handle += 1;
                inner.leased.insert(
                    handle,
                    Leased {
                        body: entry.body.clone(),
                        expires_at: now + visibility,
                    },
                );
                (
                    Some(Delivery {
                        body: entry.body,
                        handle,
                    }),
                    None,
                )
            }
            None => (None, next_wake),
        }
    }
}

#[async_trait::async_trait]
impl QueueTransport for InProcessQueue {
    async fn send(&self, body: String, delay: Option<Duration>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.push(Pending {
                body,
                ready_at: Instant::now() + delay.unwrap_or(Duration::ZERO),
                seq,
            });
        }
        // notify_one stores a permit when no receiver is parked, so a
        // send racing a receive is never lost.
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, visibility: Duration, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let (delivery, next_wake) = self.try_pop(visibility);
            if delivery.is_some() {
                return Ok(delivery);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_wake.unwrap_or(deadline).min(deadline);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, handle: u64) -> Result<()> {
        let removed = self.inner.lock().leased.remove(&handle);
        if removed.is_none() {
            // The lease already expired and was redelivered; harmless,
            // the conditional claim makes the duplicate a no-op.
            tracing::debug!(handle, "delete on expired lease");
        }
        Ok(())
    }

    async fn change_visibility(&self, handle: u64, delay: Duration) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.leased.get_mut(&handle) {
            Some(lease) => {
                lease.expires_at = Instant::now() + delay;
                Ok(())
            }
            None => Err(Error::TransportUnavailable(format!(
                "lease {handle} expired before visibility change"
            ))),
        }
    }

    fn depth(&self) -> usize {
        self.inner.lock().pending.len()
    }
}
