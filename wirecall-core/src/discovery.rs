use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::balancer::Balancer;
use crate::error::Result;
use crate::registry::{Event, Registry};

/// A watch-driven view of the live endpoints under a key prefix.
///
/// `watch_service` seeds the endpoint map with a range read and then applies
/// PUT/DELETE watch events in order, so an entry exists iff the coordination
/// service reports the key live (modulo watch latency). Selection goes
/// through the configured [`Balancer`], which picks among *keys*; the picked
/// key resolves to its address under the same lock, so a returned address was
/// valid at pick time.
pub struct Discovery {
    registry: Arc<dyn Registry>,
    servers: Arc<Mutex<BTreeMap<String, String>>>,
    balancer: Mutex<Arc<dyn Balancer>>,
    cancel: CancellationToken,
}

impl Discovery {
    pub fn new(registry: Arc<dyn Registry>, balancer: Arc<dyn Balancer>) -> Self {
        Discovery {
            registry,
            servers: Arc::new(Mutex::new(BTreeMap::new())),
            balancer: Mutex::new(balancer),
            cancel: CancellationToken::new(),
        }
    }

    /// Seed the endpoint map from `prefix` and keep it current from watch
    /// events until [`Discovery::close`] is called.
    pub async fn watch_service(&self, prefix: &str) -> Result<()> {
        for (key, value) in self.registry.get(prefix).await? {
            self.servers.lock().unwrap().insert(key, value);
        }
        let mut events = self.registry.watch(prefix).await?;
        let servers = Arc::clone(&self.servers);
        let cancel = self.cancel.clone();
        let prefix = prefix.to_owned();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(Event::Put { key, value }) => {
                            debug!(%key, %value, "service endpoint added");
                            servers.lock().unwrap().insert(key, value);
                        }
                        Some(Event::Delete { key }) => {
                            debug!(%key, "service endpoint removed");
                            servers.lock().unwrap().remove(&key);
                        }
                        None => {
                            warn!(%prefix, "service watch stream ended");
                            break;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// One balanced endpoint address, or `None` while the set is empty.
    pub fn get_service(&self) -> Option<String> {
        let servers = self.servers.lock().unwrap();
        let keys: Vec<String> = servers.keys().cloned().collect();
        let balancer = Arc::clone(&self.balancer.lock().unwrap());
        let key = balancer.pick(&keys).ok()?;
        servers.get(&key).cloned()
    }

    /// Every known endpoint address.
    pub fn get_all_service(&self) -> Vec<String> {
        self.servers.lock().unwrap().values().cloned().collect()
    }

    /// Swap the selection policy. Outstanding picks are not retried.
    pub fn set_balancer(&self, balancer: Arc<dyn Balancer>) {
        *self.balancer.lock().unwrap() = balancer;
    }

    /// Stop the watch task and release coordination-service resources.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.registry.close().await
    }
}
