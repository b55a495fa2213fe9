use std::sync::atomic::{AtomicU32, Ordering};

use rand::Rng;

use crate::error::{Result, RpcError};

/// A selection policy over a set of server keys.
///
/// Discovery hands `pick` the current *keys* rather than addresses: keys are
/// stable identifiers, so a balancer with internal state stays coherent
/// across transient value rewrites. Neither built-in balancer weighs server
/// health; picking a dead endpoint surfaces as an ordinary dial failure.
pub trait Balancer: Send + Sync {
    /// Pick one key from the slice. Fails with `no server` on empty input.
    fn pick(&self, keys: &[String]) -> Result<String>;
}

/// Uniform random selection.
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        RandomBalancer
    }
}

impl Balancer for RandomBalancer {
    fn pick(&self, keys: &[String]) -> Result<String> {
        if keys.is_empty() {
            return Err(RpcError::NoServer);
        }
        let i = rand::thread_rng().gen_range(0..keys.len());
        Ok(keys[i].clone())
    }
}

/// Round-robin selection with an atomically advancing cursor.
///
/// The cursor starts at a random offset so independent clients do not all
/// hammer the first server. The offset is kept far below the u32 wrap point,
/// which keeps consecutive picks sequential modulo the set size.
#[derive(Debug)]
pub struct RoundRobinBalancer {
    cursor: AtomicU32,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        RoundRobinBalancer {
            cursor: AtomicU32::new(u32::from(rand::random::<u16>())),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for RoundRobinBalancer {
    fn pick(&self, keys: &[String]) -> Result<String> {
        if keys.is_empty() {
            return Err(RpcError::NoServer);
        }
        let n = keys.len() as u32;
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        Ok(keys[i as usize].clone())
    }
}
