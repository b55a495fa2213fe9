use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::balancer::{Balancer, RandomBalancer};
use crate::client::Client;
use crate::codec::Body;
use crate::discovery::Discovery;
use crate::error::{Result, RpcError};
use crate::options::Options;
use crate::pool::{ConnPool, PoolConfig, PoolLease};
use crate::registry::Registry;

/// How long a call waits for discovery to produce at least one endpoint.
const DISCOVERY_WAIT: Duration = Duration::from_secs(3);
const DISCOVERY_POLL: Duration = Duration::from_millis(50);

struct CachedClient {
    client: Client,
    /// Capacity slot of the pooled connection the client runs on; freed when
    /// the cache entry is evicted.
    _lease: PoolLease,
}

/// A load-balanced client over every live endpoint of a service.
///
/// Composes discovery (which endpoints exist), a balancer (which one to
/// call), and per-endpoint connection caching: one multiplexing [`Client`]
/// per address, rebuilt through the endpoint's connection pool when it dies.
pub struct ClusterClient {
    discovery: Discovery,
    options: Options,
    pool_config: PoolConfig,
    clients: tokio::sync::Mutex<HashMap<String, CachedClient>>,
    pools: Mutex<HashMap<String, Arc<ConnPool>>>,
}

impl ClusterClient {
    /// A cluster client selecting uniformly at random. Swap policies with
    /// [`ClusterClient::set_balancer`].
    pub fn new(registry: Arc<dyn Registry>, options: Options) -> Self {
        ClusterClient {
            discovery: Discovery::new(registry, Arc::new(RandomBalancer::new())),
            options,
            pool_config: PoolConfig::default(),
            clients: tokio::sync::Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Override the per-endpoint pool parameters. `max_cap = 1, max_idle = 0`
    /// degrades to single-shot dialing.
    pub fn with_pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Start following the endpoints registered under `prefix`.
    pub async fn watch(&self, prefix: &str) -> Result<()> {
        self.discovery.watch_service(prefix).await
    }

    /// Swap the selection policy.
    pub fn set_balancer(&self, balancer: Arc<dyn Balancer>) {
        self.discovery.set_balancer(balancer);
    }

    /// Call `service_method` on one balanced endpoint.
    pub async fn call<A: Body, R: Body>(&self, service_method: &str, args: &A) -> Result<R> {
        let addr = self.wait_for_service().await?;
        trace!(%addr, service_method, "endpoint picked");
        let (protocol, host) = split_addr(&addr)?;
        let client = self.client_for(protocol, host).await?;
        client.call(service_method, args).await
    }

    /// Every address discovery currently knows.
    pub fn get_all_service(&self) -> Vec<String> {
        self.discovery.get_all_service()
    }

    /// Tear down cached clients, pools, and the discovery watcher.
    pub async fn close(&self) -> Result<()> {
        let mut clients = self.clients.lock().await;
        for (_, cached) in clients.drain() {
            let _ = cached.client.close().await;
        }
        drop(clients);
        for (_, pool) in self.pools.lock().unwrap().drain() {
            pool.release();
        }
        self.discovery.close().await
    }

    /// Poll discovery with short sleeps until an endpoint shows up or the
    /// deadline passes.
    async fn wait_for_service(&self) -> Result<String> {
        let deadline = Instant::now() + DISCOVERY_WAIT;
        loop {
            if let Some(addr) = self.discovery.get_service() {
                return Ok(addr);
            }
            if Instant::now() >= deadline {
                return Err(RpcError::NoService);
            }
            tokio::time::sleep(DISCOVERY_POLL).await;
        }
    }

    /// The cached client for `addr`, or a fresh one dialed through the
    /// endpoint's pool. A cached client that died is evicted first.
    async fn client_for(&self, protocol: &str, addr: &str) -> Result<Client> {
        let mut clients = self.clients.lock().await;
        if let Some(cached) = clients.get(addr) {
            if cached.client.is_alive() {
                return Ok(cached.client.clone());
            }
            debug!(%addr, "evicting dead cached client");
            if let Some(cached) = clients.remove(addr) {
                let _ = cached.client.close().await;
            }
        }

        let pool = self.pool_for(addr);
        let options = self.options.clone();
        let connect_timeout = options.connect_timeout;
        let dial = async {
            let conn = pool.get().await?;
            let (stream, lease) = conn.into_parts();
            let client = Client::with_stream(protocol, stream, options).await?;
            Ok::<_, RpcError>((client, lease))
        };
        let (client, lease) = if connect_timeout.is_zero() {
            dial.await?
        } else {
            match tokio::time::timeout(connect_timeout, dial).await {
                Ok(result) => result?,
                Err(_) => return Err(RpcError::ConnectTimeout),
            }
        };
        clients.insert(
            addr.to_owned(),
            CachedClient {
                client: client.clone(),
                _lease: lease,
            },
        );
        Ok(client)
    }

    fn pool_for(&self, addr: &str) -> Arc<ConnPool> {
        let mut pools = self.pools.lock().unwrap();
        Arc::clone(
            pools
                .entry(addr.to_owned())
                .or_insert_with(|| ConnPool::new(addr, self.pool_config.clone())),
        )
    }
}

/// Split `protocol@host:port`, rejecting anything that is not exactly that
/// form. Unknown protocols fall back to the plain TCP transport at dial time.
fn split_addr(addr: &str) -> Result<(&str, &str)> {
    match addr.split_once('@') {
        Some((protocol, host))
            if !protocol.is_empty() && !host.is_empty() && !host.contains('@') =>
        {
            Ok((protocol, host))
        }
        _ => Err(RpcError::InvalidAddress(format!(
            "rpc client: wrong address format {addr}, expect protocol@addr"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_addr_accepts_the_exact_form() {
        assert_eq!(
            split_addr("tcp@127.0.0.1:7000").unwrap(),
            ("tcp", "127.0.0.1:7000")
        );
        assert_eq!(
            split_addr("http@example.com:80").unwrap(),
            ("http", "example.com:80")
        );
    }

    #[test]
    fn split_addr_rejects_malformed_strings() {
        for addr in ["127.0.0.1:7000", "@host", "tcp@", "a@b@c", ""] {
            assert!(
                matches!(split_addr(addr), Err(RpcError::InvalidAddress(_))),
                "{addr} should be rejected"
            );
        }
    }
}
