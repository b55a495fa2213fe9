mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{spawn_registered_node, AddArgs, AddReply};
use wirecall_core::{
    ClusterClient, MemRegistry, Options, PoolConfig, RoundRobinBalancer, RpcError,
};

async fn settle() {
    // Give watch events and server teardown a moment to propagate.
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_spreads_calls_evenly() {
    let registry = MemRegistry::new();
    let mut nodes = Vec::new();
    for i in 0..3 {
        nodes.push(spawn_registered_node(&registry, &format!("/arith/node{i}"), 5).await);
    }

    let client = ClusterClient::new(registry.handle(), Options::default());
    client.set_balancer(Arc::new(RoundRobinBalancer::new()));
    client.watch("/arith").await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(client.get_all_service().len(), 3);

    for i in 0..30i32 {
        let reply: AddReply = client
            .call("Arith.Sum", &AddArgs { num1: i, num2: 1 })
            .await
            .unwrap();
        assert_eq!(reply.num, i + 1);
    }

    for node in &nodes {
        assert_eq!(
            node.sums.load(Ordering::SeqCst),
            10,
            "round robin should hand each of 3 nodes exactly 10 of 30 calls"
        );
    }

    client.close().await.unwrap();
    for node in nodes {
        node.server.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failover_after_a_node_deregisters() {
    let registry = MemRegistry::new();
    let node0 = spawn_registered_node(&registry, "/arith/node0", 5).await;
    let node1 = spawn_registered_node(&registry, "/arith/node1", 5).await;

    let client = ClusterClient::new(registry.handle(), Options::default());
    client.set_balancer(Arc::new(RoundRobinBalancer::new()));
    client.watch("/arith").await.unwrap();
    settle().await;

    // Warm up against both nodes.
    for i in 0..4i32 {
        let reply: AddReply = client
            .call("Arith.Sum", &AddArgs { num1: i, num2: 0 })
            .await
            .unwrap();
        assert_eq!(reply.num, i);
    }
    assert!(node0.sums.load(Ordering::SeqCst) > 0);
    assert!(node1.sums.load(Ordering::SeqCst) > 0);

    // Take node0 down: its lease is revoked and its connections die. Calls
    // racing the DELETE event may hit the dead endpoint and fail with a dial
    // error; that is a normal error, not a retry, so keep calling until the
    // live node carries everything.
    node0.server.shutdown().await;
    let mut consecutive_ok = 0;
    for _ in 0..40 {
        match client
            .call::<_, AddReply>("Arith.Sum", &AddArgs { num1: 1, num2: 1 })
            .await
        {
            Ok(reply) => {
                assert_eq!(reply.num, 2);
                consecutive_ok += 1;
                if consecutive_ok >= 5 {
                    break;
                }
            }
            Err(_) => consecutive_ok = 0,
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(
        consecutive_ok >= 5,
        "calls never stabilized on the surviving node"
    );

    let before = node1.sums.load(Ordering::SeqCst);
    for _ in 0..5 {
        let _: AddReply = client
            .call("Arith.Sum", &AddArgs { num1: 1, num2: 1 })
            .await
            .unwrap();
    }
    assert_eq!(node1.sums.load(Ordering::SeqCst), before + 5);

    client.close().await.unwrap();
    node1.server.shutdown().await;
}

#[tokio::test]
async fn no_registered_service_times_out_after_three_seconds() {
    let registry = MemRegistry::new();
    let client = ClusterClient::new(registry.handle(), Options::default());
    client.watch("/nothing").await.unwrap();

    let started = Instant::now();
    let err = client
        .call::<_, AddReply>("Arith.Sum", &AddArgs { num1: 1, num2: 2 })
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::NoService));
    assert_eq!(err.to_string(), "no expect service");
    assert!(
        elapsed >= Duration::from_millis(2900) && elapsed <= Duration::from_secs(5),
        "gave up after {elapsed:?}, expected ~3s"
    );
}

#[tokio::test]
async fn single_shot_pool_configuration_still_serves() {
    let registry = MemRegistry::new();
    let node = spawn_registered_node(&registry, "/arith/node0", 5).await;

    let client = ClusterClient::new(registry.handle(), Options::default()).with_pool_config(
        PoolConfig {
            max_cap: 1,
            max_idle: 0,
            ..PoolConfig::default()
        },
    );
    client.watch("/arith").await.unwrap();

    for _ in 0..3 {
        let reply: AddReply = client
            .call("Arith.Sum", &AddArgs { num1: 2, num2: 2 })
            .await
            .unwrap();
        assert_eq!(reply.num, 4);
    }

    client.close().await.unwrap();
    node.server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_cached_client_is_evicted_and_redialed() {
    let registry = MemRegistry::new();
    let node = spawn_registered_node(&registry, "/arith/node0", 5).await;

    let client = ClusterClient::new(registry.handle(), Options::default());
    client.watch("/arith").await.unwrap();

    let reply: AddReply = client
        .call("Arith.Sum", &AddArgs { num1: 1, num2: 1 })
        .await
        .unwrap();
    assert_eq!(reply.num, 2);

    // Restart the node on the same address so the cached client dies but
    // the endpoint remains valid.
    node.server.shutdown().await;
    settle().await;
    let listener = tokio::net::TcpListener::bind(&node.addr).await.unwrap();
    let sums = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let server = Arc::new(wirecall_core::Server::new());
    server
        .register(common::arith_service(Arc::clone(&sums)))
        .unwrap();
    tokio::spawn(Arc::clone(&server).accept(listener));
    let registrar = wirecall_core::Registrar::register(
        registry.handle(),
        "/arith/node0b",
        &format!("tcp@{}", node.addr),
        5,
    )
    .await
    .unwrap();
    server.with_registrar(registrar);
    settle().await;

    let mut ok = false;
    for _ in 0..20 {
        if let Ok(reply) = client
            .call::<_, AddReply>("Arith.Sum", &AddArgs { num1: 3, num2: 4 })
            .await
        {
            assert_eq!(reply.num, 7);
            ok = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ok, "calls never recovered after the endpoint restarted");
    assert!(sums.load(Ordering::SeqCst) >= 1);

    client.close().await.unwrap();
    server.shutdown().await;
}
