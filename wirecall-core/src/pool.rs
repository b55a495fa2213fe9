use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Result, RpcError};

/// Sizing and reuse parameters for a per-endpoint [`ConnPool`].
///
/// The defaults give a pooled transport; `max_cap = 1, max_idle = 0`
/// degrades to single-shot dialing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections dialed eagerly when the pool is created.
    pub initial_cap: usize,
    /// Hard cap on concurrently held connections; `get` blocks at the cap.
    pub max_cap: usize,
    /// Idle connections kept for reuse; returns beyond this are closed.
    pub max_idle: usize,
    /// Idle connections older than this are closed on next access.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            initial_cap: 0,
            max_cap: 8,
            max_idle: 4,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

struct IdleConn {
    stream: TcpStream,
    since: Instant,
}

/// A bounded pool of raw TCP connections to one endpoint.
///
/// The pool lends: `get` hands the stream out together with a [`PoolLease`]
/// holding its capacity slot. Callers either return a still-healthy stream
/// with `put` or drop it; dropping the lease frees the slot either way, so
/// the pool never considers a lent connection idle.
pub struct ConnPool {
    addr: String,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn>>,
    slots: Arc<Semaphore>,
}

/// The capacity slot of a connection lent out by [`ConnPool::get`]. Freed on
/// drop.
pub struct PoolLease {
    _permit: OwnedSemaphorePermit,
}

/// A connection lent out by the pool.
pub struct PooledConn {
    stream: TcpStream,
    lease: PoolLease,
}

impl PooledConn {
    /// Split into the raw stream and the capacity lease. The lease must be
    /// kept alive for as long as the stream is in use.
    pub fn into_parts(self) -> (TcpStream, PoolLease) {
        (self.stream, self.lease)
    }
}

impl ConnPool {
    pub fn new(addr: &str, config: PoolConfig) -> Arc<Self> {
        let max_cap = config.max_cap.max(1);
        let pool = Arc::new(ConnPool {
            addr: addr.to_owned(),
            idle: Mutex::new(VecDeque::new()),
            slots: Arc::new(Semaphore::new(max_cap)),
            config,
        });
        let warm = pool.config.initial_cap.min(max_cap);
        if warm > 0 {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                for _ in 0..warm {
                    match TcpStream::connect(&pool.addr).await {
                        Ok(stream) => pool.idle.lock().unwrap().push_back(IdleConn {
                            stream,
                            since: Instant::now(),
                        }),
                        Err(e) => {
                            debug!(addr = %pool.addr, error = %e, "pool warm-up dial failed");
                            break;
                        }
                    }
                }
            });
        }
        pool
    }

    /// A live connection: an idle one if fresh enough, otherwise a new dial.
    /// Blocks while the pool is at capacity; fails once the pool is released.
    pub async fn get(&self) -> Result<PooledConn> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| RpcError::Pool("connection pool is closed".into()))?;
        let stream = loop {
            let candidate = self.idle.lock().unwrap().pop_front();
            match candidate {
                Some(idle) => {
                    if idle.since.elapsed() <= self.config.idle_timeout {
                        trace!(addr = %self.addr, "reusing pooled connection");
                        break idle.stream;
                    }
                    trace!(addr = %self.addr, "closing stale pooled connection");
                }
                None => break TcpStream::connect(&self.addr).await?,
            }
        };
        Ok(PooledConn {
            stream,
            lease: PoolLease { _permit: permit },
        })
    }

    /// Return a still-healthy connection for reuse. Closed instead if the
    /// pool is released or already holds `max_idle` idle connections.
    pub fn put(&self, conn: PooledConn) {
        let PooledConn { stream, lease } = conn;
        {
            let mut idle = self.idle.lock().unwrap();
            if !self.slots.is_closed() && idle.len() < self.config.max_idle {
                idle.push_back(IdleConn {
                    stream,
                    since: Instant::now(),
                });
            }
        }
        drop(lease);
    }

    /// Close every idle connection and fail all future `get`s.
    pub fn release(&self) {
        self.slots.close();
        self.idle.lock().unwrap().clear();
        debug!(addr = %self.addr, "connection pool released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        // Keep accepting so dials succeed; accepted sockets are parked.
        (listener, addr)
    }

    fn accept_forever(listener: TcpListener) {
        tokio::spawn(async move {
            let mut parked = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                parked.push(stream);
            }
        });
    }

    #[tokio::test]
    async fn put_makes_a_connection_reusable() {
        let (listener, addr) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(&addr, PoolConfig::default());

        let conn = pool.get().await.unwrap();
        let first_local = conn.stream.local_addr().unwrap();
        pool.put(conn);

        let conn = pool.get().await.unwrap();
        assert_eq!(conn.stream.local_addr().unwrap(), first_local);
    }

    #[tokio::test]
    async fn idle_overflow_is_closed_not_kept() {
        let (listener, addr) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(
            &addr,
            PoolConfig {
                max_idle: 1,
                ..PoolConfig::default()
            },
        );

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_idle_connections_are_replaced() {
        let (listener, addr) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(
            &addr,
            PoolConfig {
                idle_timeout: Duration::from_millis(50),
                ..PoolConfig::default()
            },
        );

        let conn = pool.get().await.unwrap();
        let first_local = conn.stream.local_addr().unwrap();
        pool.put(conn);
        tokio::time::sleep(Duration::from_millis(120)).await;

        let conn = pool.get().await.unwrap();
        assert_ne!(conn.stream.local_addr().unwrap(), first_local);
    }

    #[tokio::test]
    async fn get_blocks_at_capacity_until_a_lease_frees() {
        let (listener, addr) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(
            &addr,
            PoolConfig {
                max_cap: 1,
                ..PoolConfig::default()
            },
        );

        let held = pool.get().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.get()).await;
        assert!(blocked.is_err(), "second get should block at max_cap");

        pool.put(held);
        let conn = tokio::time::timeout(Duration::from_millis(200), pool.get())
            .await
            .expect("get should proceed once the lease frees");
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn release_fails_future_gets() {
        let (listener, addr) = listener().await;
        accept_forever(listener);
        let pool = ConnPool::new(&addr, PoolConfig::default());
        pool.release();
        assert!(matches!(pool.get().await, Err(RpcError::Pool(_))));
    }

    #[tokio::test]
    async fn dial_failure_surfaces_and_frees_the_slot() {
        // Nothing listens on this address: bind then drop to reserve a port.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = ConnPool::new(
            &addr,
            PoolConfig {
                max_cap: 1,
                ..PoolConfig::default()
            },
        );
        assert!(matches!(pool.get().await, Err(RpcError::Io(_))));
        // The failed dial released its slot; the next get still errors on
        // dialing rather than blocking at the cap.
        let second = tokio::time::timeout(Duration::from_millis(500), pool.get()).await;
        assert!(matches!(second, Ok(Err(RpcError::Io(_)))));
    }
}
