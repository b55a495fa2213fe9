//! wirecall: a discovery-aware RPC runtime over TCP.
//!
//! The crate has three layers:
//!
//! - **Wire**: an option prelude negotiates one of three codecs
//!   ([`CodecKind`]); every message after it is a (header, body) frame.
//! - **Point-to-point**: [`Server`] dispatches requests to registered
//!   [`Service`] method tables; [`Client`] multiplexes concurrent calls over
//!   one connection, matching replies by sequence number.
//! - **Cluster**: servers advertise themselves through a lease-bound
//!   [`Registrar`]; [`ClusterClient`] follows those advertisements via
//!   [`Discovery`], picks endpoints with a [`Balancer`], and caches one
//!   pooled connection per endpoint.
//!
//! The coordination service behind registrar/discovery is abstract
//! ([`Registry`]); [`MemRegistry`] is the in-process implementation used in
//! tests and demos.

pub mod balancer;
pub mod client;
pub mod cluster;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod options;
pub mod pool;
pub mod registrar;
pub mod registry;
pub mod server;
pub mod service;

pub use balancer::{Balancer, RandomBalancer, RoundRobinBalancer};
pub use client::{Call, Client};
pub use cluster::ClusterClient;
pub use codec::{Body, CodecKind, Header};
pub use discovery::Discovery;
pub use error::{Result, RpcError};
pub use options::{Options, CONNECTED_STATUS, DEFAULT_RPC_PATH, MAGIC_NUMBER};
pub use pool::{ConnPool, PoolConfig, PoolLease, PooledConn};
pub use registrar::Registrar;
pub use registry::{Event, KeepAliveAck, LeaseId, MemRegistry, Registry};
pub use server::Server;
pub use service::{Method, Service};
