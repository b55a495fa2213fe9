use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::{Result, RpcError};
use crate::registry::{LeaseId, Registry};

/// TTL used when the caller passes zero.
pub const DEFAULT_LEASE_TTL: i64 = 20;

/// A lease-bound service advertisement.
///
/// Registration grants a lease, writes `key = value` bound to it, and starts
/// keepalive so the key stays live while this process does. A background task
/// drains keepalive acknowledgments (logging is all they need). Closing
/// revokes the lease, which deletes the key and fans DELETE events out to
/// discovery watchers.
pub struct Registrar {
    registry: Arc<dyn Registry>,
    lease: LeaseId,
    key: String,
    value: String,
    drain: JoinHandle<()>,
}

impl Registrar {
    pub async fn register(
        registry: Arc<dyn Registry>,
        key: &str,
        value: &str,
        lease_ttl: i64,
    ) -> Result<Self> {
        if key.is_empty() || value.is_empty() {
            return Err(RpcError::Registry(
                "service key and address must not be empty".into(),
            ));
        }
        let ttl = if lease_ttl == 0 {
            DEFAULT_LEASE_TTL
        } else {
            lease_ttl
        };
        let lease = registry.grant(ttl).await?;
        registry.put(key, value, lease).await?;
        let mut acks = registry.keep_alive(lease).await?;
        let drain = tokio::spawn(async move {
            while let Some(ack) = acks.recv().await {
                trace!(lease = ack.lease, ttl = ack.ttl, "lease keepalive ack");
            }
            debug!(lease, "keepalive channel closed");
        });
        info!(%key, %value, lease, ttl, "service registered");
        Ok(Registrar {
            registry,
            lease,
            key: key.to_owned(),
            value: value.to_owned(),
            drain,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Revoke the lease (deleting the advertised key) and release the
    /// registry handle.
    pub async fn close(self) -> Result<()> {
        let revoked = self.registry.revoke(self.lease).await;
        self.drain.abort();
        debug!(key = %self.key, lease = self.lease, "service deregistered");
        let closed = self.registry.close().await;
        revoked.and(closed)
    }
}
