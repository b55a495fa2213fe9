// Each integration test file is compiled as its own binary crate, each
// pulling in its own copy of this module. Helpers used by some test binaries
// but not others trigger false "dead code" warnings in the binaries that
// don't call them.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use wirecall_core::{MemRegistry, Registrar, Server, Service};

/// Argument payload of the test arithmetic service, usable with all codecs.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AddArgs {
    #[prost(int32, tag = "1")]
    pub num1: i32,
    #[prost(int32, tag = "2")]
    pub num2: i32,
}

/// Reply payload of the test arithmetic service.
#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
pub struct AddReply {
    #[prost(int32, tag = "1")]
    pub num: i32,
}

/// An `Arith` service with `Sum` (counted via `counter`) and `Sleep` (sleeps
/// `num1` seconds before answering).
pub fn arith_service(counter: Arc<AtomicUsize>) -> Service {
    Service::new("Arith")
        .unwrap()
        .method("Sum", move |args: AddArgs| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(AddReply {
                    num: args.num1 + args.num2,
                })
            }
        })
        .unwrap()
        .method("Sleep", |args: AddArgs| async move {
            tokio::time::sleep(Duration::from_secs(args.num1.max(0) as u64)).await;
            Ok(AddReply {
                num: args.num1 + args.num2,
            })
        })
        .unwrap()
}

/// A running test server and how to reach it.
pub struct TestNode {
    pub server: Arc<Server>,
    pub addr: String,
    pub sums: Arc<AtomicUsize>,
}

/// Serve the arithmetic service on an ephemeral TCP port.
pub async fn spawn_node() -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let sums = Arc::new(AtomicUsize::new(0));
    let server = Arc::new(Server::new());
    server.register(arith_service(Arc::clone(&sums))).unwrap();
    tokio::spawn(Arc::clone(&server).accept(listener));
    TestNode { server, addr, sums }
}

/// Serve the arithmetic service behind the HTTP CONNECT upgrade.
pub async fn spawn_http_node() -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let sums = Arc::new(AtomicUsize::new(0));
    let server = Arc::new(Server::new());
    server.register(arith_service(Arc::clone(&sums))).unwrap();
    tokio::spawn(Arc::clone(&server).accept_http(listener));
    TestNode { server, addr, sums }
}

/// Spawn a node and advertise it under `key` with a lease of `lease_ttl`
/// seconds.
pub async fn spawn_registered_node(registry: &MemRegistry, key: &str, lease_ttl: i64) -> TestNode {
    let node = spawn_node().await;
    let registrar = Registrar::register(
        registry.handle(),
        key,
        &format!("tcp@{}", node.addr),
        lease_ttl,
    )
    .await
    .unwrap();
    node.server.with_registrar(registrar);
    node
}
