//! The coordination-service contract and an in-process implementation.
//!
//! The runtime never talks to a concrete coordination service directly: the
//! registrar and discovery are written against [`Registry`], which captures
//! the capability surface they need (prefix reads, prefix watches with
//! PUT/DELETE events, leases with keepalive and revocation). [`MemRegistry`]
//! is a lease-aware in-process backend used by the test suite and demos; a
//! production deployment implements the trait against its coordination
//! service (the surface deliberately mirrors an etcd v3 client).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, RpcError};

/// Identifier of a lease granted by the coordination service.
pub type LeaseId = i64;

/// A change to a watched key range, delivered in per-key order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Put { key: String, value: String },
    Delete { key: String },
}

/// One keepalive acknowledgment for a lease.
#[derive(Debug, Clone, Copy)]
pub struct KeepAliveAck {
    pub lease: LeaseId,
    pub ttl: i64,
}

/// Client surface of the coordination service.
#[async_trait]
pub trait Registry: Send + Sync {
    /// All live `(key, value)` pairs under `prefix`.
    async fn get(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Subscribe to changes under `prefix`. Events arrive in application
    /// order per key; the stream ends when the backend goes away.
    async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Event>>;

    /// Grant a lease with the given TTL in seconds.
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Write `key = value` bound to `lease` (0 for no lease). Expiry or
    /// revocation of the lease deletes the key.
    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()>;

    /// Keep `lease` alive until the returned ack stream is dropped or the
    /// lease is revoked. Acknowledgments stream back for observability.
    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::UnboundedReceiver<KeepAliveAck>>;

    /// Revoke `lease`, deleting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Release client resources. Implementations shared between components
    /// may make this a no-op per handle.
    async fn close(&self) -> Result<()>;
}

struct MemLease {
    ttl_secs: i64,
    deadline: Instant,
}

struct MemEntry {
    value: String,
    lease: LeaseId,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct MemState {
    entries: BTreeMap<String, MemEntry>,
    leases: HashMap<LeaseId, MemLease>,
    watchers: Vec<Watcher>,
    next_lease: LeaseId,
}

struct Shared {
    state: Mutex<MemState>,
}

/// In-process, lease-aware key store implementing [`Registry`].
///
/// Handles are cheap clones of shared state, so servers and clients in one
/// process observe the same keys. Leases that miss their keepalive window are
/// expired by a background sweeper, which emits the same DELETE events a
/// revocation would. The store lives while any handle does; `close()` is a
/// per-handle no-op.
#[derive(Clone)]
pub struct MemRegistry {
    shared: Arc<Shared>,
}

impl MemRegistry {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(MemState {
                next_lease: 1,
                ..MemState::default()
            }),
        });
        tokio::spawn(sweep_expired(Arc::downgrade(&shared)));
        MemRegistry { shared }
    }

    /// Erase the shared type for trait-object call sites.
    pub fn handle(&self) -> Arc<dyn Registry> {
        Arc::new(self.clone())
    }
}

impl Default for MemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove a lease and every key bound to it, notifying watchers.
fn drop_lease(state: &mut MemState, lease: LeaseId) -> bool {
    if state.leases.remove(&lease).is_none() {
        return false;
    }
    let doomed: Vec<String> = state
        .entries
        .iter()
        .filter(|(_, entry)| entry.lease == lease)
        .map(|(key, _)| key.clone())
        .collect();
    for key in doomed {
        state.entries.remove(&key);
        notify(state, &Event::Delete { key });
    }
    true
}

fn notify(state: &mut MemState, event: &Event) {
    let key = match event {
        Event::Put { key, .. } | Event::Delete { key } => key,
    };
    state.watchers.retain(|w| {
        if key.starts_with(&w.prefix) {
            w.tx.send(event.clone()).is_ok()
        } else {
            !w.tx.is_closed()
        }
    });
}

async fn sweep_expired(shared: Weak<Shared>) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let now = Instant::now();
        let mut state = state_lock(&shared);
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            debug!(lease, "lease expired");
            drop_lease(&mut state, lease);
        }
    }
}

fn state_lock(shared: &Shared) -> std::sync::MutexGuard<'_, MemState> {
    shared.state.lock().unwrap()
}

#[async_trait]
impl Registry for MemRegistry {
    async fn get(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let state = state_lock(&self.shared);
        Ok(state
            .entries
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<mpsc::UnboundedReceiver<Event>> {
        let (tx, rx) = mpsc::unbounded_channel();
        state_lock(&self.shared).watchers.push(Watcher {
            prefix: prefix.to_owned(),
            tx,
        });
        Ok(rx)
    }

    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(RpcError::Registry(format!(
                "lease ttl must be positive, got {ttl_secs}"
            )));
        }
        let mut state = state_lock(&self.shared);
        let lease = state.next_lease;
        state.next_lease += 1;
        state.leases.insert(
            lease,
            MemLease {
                ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
            },
        );
        Ok(lease)
    }

    async fn put(&self, key: &str, value: &str, lease: LeaseId) -> Result<()> {
        let mut state = state_lock(&self.shared);
        if lease != 0 && !state.leases.contains_key(&lease) {
            return Err(RpcError::Registry(format!("lease {lease} not found")));
        }
        state.entries.insert(
            key.to_owned(),
            MemEntry {
                value: value.to_owned(),
                lease,
            },
        );
        notify(
            &mut state,
            &Event::Put {
                key: key.to_owned(),
                value: value.to_owned(),
            },
        );
        Ok(())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<mpsc::UnboundedReceiver<KeepAliveAck>> {
        let ttl_secs = {
            let state = state_lock(&self.shared);
            match state.leases.get(&lease) {
                Some(l) => l.ttl_secs,
                None => {
                    return Err(RpcError::Registry(format!("lease {lease} not found")));
                }
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            // Refresh well inside the TTL window, as a real lease client does.
            let period = Duration::from_millis((ttl_secs.max(1) as u64) * 1000 / 3);
            loop {
                tokio::time::sleep(period).await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let refreshed = {
                    let mut state = state_lock(&shared);
                    match state.leases.get_mut(&lease) {
                        Some(l) => {
                            l.deadline = Instant::now() + Duration::from_secs(ttl_secs as u64);
                            true
                        }
                        None => false,
                    }
                };
                if !refreshed {
                    break;
                }
                trace!(lease, "lease refreshed");
                if tx
                    .send(KeepAliveAck {
                        lease,
                        ttl: ttl_secs,
                    })
                    .is_err()
                {
                    // Holder dropped the ack stream: stop refreshing and let
                    // the lease run out.
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut state = state_lock(&self.shared);
        if !drop_lease(&mut state, lease) {
            return Err(RpcError::Registry(format!("lease {lease} not found")));
        }
        debug!(lease, "lease revoked");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
