//! Integration tests for circuit creation, relaying, and teardown across
//! real routers on loopback.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test circuit_lifecycle -- --nocapture

use std::sync::{Arc, Once};
use std::time::Duration;

use mixnet::{ProxyCircuit, ProxyContext, RouterConfig, RouterContext};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One-time tracing initialization.
static INIT: Once = Once::new();

/// Initialize tracing for tests. Use RUST_LOG=debug for verbose output.
fn init_tracing() {
    INIT.call_once(|| {
        let filter = if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::EnvFilter::from_default_env()
        } else {
            tracing_subscriber::EnvFilter::new("info")
        };

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Routers in these tests honor client-specified paths so circuits can be
/// pinned to the hops under test.
async fn spawn_router() -> Arc<RouterContext> {
    RouterContext::new(RouterConfig {
        timeout: TEST_TIMEOUT,
        allow_client_path_hints: true,
        ..RouterConfig::default()
    })
    .await
    .expect("router must start")
}

/// Plain TCP echo server standing in for an exit destination.
async fn echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr").to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 32 * 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Collect echoed bytes until `len` arrived; the destination's writes may
/// reach the exit in more than one read.
async fn recv_exact(circuit: &mut ProxyCircuit, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let chunk = circuit.recv_message().await.expect("reply must arrive");
        out.extend(chunk);
    }
    out
}

/// Poll until a router's registry drains or the deadline passes.
async fn wait_no_circuits(router: &RouterContext, what: &str) {
    for _ in 0..100 {
        if router.no_circuits() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{what}: registry still holds circuit state");
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn three_hop_round_trip_and_teardown() {
    init_tracing();
    let r1 = spawn_router().await;
    let r2 = spawn_router().await;
    let r3 = spawn_router().await;
    let dest = echo_server().await;

    let proxy = ProxyContext::new(TEST_TIMEOUT);
    let path = vec![
        r1.addr().to_string(),
        r2.addr().to_string(),
        r3.addr().to_string(),
    ];
    let mut circuit = proxy
        .create_circuit(&path, &dest, &r3.onion_public_key())
        .await
        .expect("3-hop circuit must establish");

    // Registry shape: entry at r1, translated onward hop by hop, exit at r3.
    let id0 = circuit.id();
    assert!(r1.is_entry(id0), "r1 must mark the proxy-side id as entry");
    let id1 = r1.next_of(id0).expect("r1 must map the circuit onward");
    let id2 = r2.next_of(id1).expect("r2 must map the circuit onward");
    assert!(!r2.is_exit(id1), "r2 is a middle hop");
    assert!(r3.is_exit(id2), "r3 must mark the circuit as exit");
    for (router, name) in [(&r1, "r1"), (&r2, "r2"), (&r3, "r3")] {
        router
            .check_invariants()
            .unwrap_or_else(|v| panic!("{name}: {v}"));
    }

    // Single-cell message.
    let msg = vec![0xA5u8; 700];
    circuit.send_message(&msg).await.expect("send");
    assert_eq!(recv_exact(&mut circuit, msg.len()).await, msg);

    // Multi-cell message: sealed payload spans several cells and must
    // reassemble losslessly in both directions.
    let big: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
    circuit.send_message(&big).await.expect("send big");
    assert_eq!(recv_exact(&mut circuit, big.len()).await, big);

    // Teardown propagates DESTROY downstream and DESTROYED back; every
    // hop ends empty.
    circuit.destroy().await.expect("destroy");
    wait_no_circuits(&r1, "r1").await;
    wait_no_circuits(&r2, "r2").await;
    wait_no_circuits(&r3, "r3").await;
    for (router, name) in [(&r1, "r1"), (&r2, "r2"), (&r3, "r3")] {
        router
            .check_invariants()
            .unwrap_or_else(|v| panic!("{name}: {v}"));
    }
}

#[tokio::test]
async fn single_router_is_entry_and_exit() {
    init_tracing();
    let r1 = spawn_router().await;
    let dest = echo_server().await;

    let proxy = ProxyContext::new(TEST_TIMEOUT);
    let path = vec![r1.addr().to_string()];
    let mut circuit = proxy
        .create_circuit(&path, &dest, &r1.onion_public_key())
        .await
        .expect("1-hop circuit must establish");

    let id0 = circuit.id();
    assert!(r1.is_entry(id0), "sole hop is the entry");
    assert!(r1.is_exit(id0), "sole hop is also the exit");
    r1.check_invariants().expect("invariants");

    let msg = b"short path, same onion".to_vec();
    circuit.send_message(&msg).await.expect("send");
    assert_eq!(recv_exact(&mut circuit, msg.len()).await, msg);

    circuit.destroy().await.expect("destroy");
    wait_no_circuits(&r1, "r1").await;
}

#[tokio::test]
async fn parallel_circuits_share_router_link() {
    init_tracing();
    let r1 = spawn_router().await;
    let r2 = spawn_router().await;
    let dest = echo_server().await;

    let proxy = ProxyContext::new(TEST_TIMEOUT);
    let path = vec![r1.addr().to_string(), r2.addr().to_string()];

    let mut first = proxy
        .create_circuit(&path, &dest, &r2.onion_public_key())
        .await
        .expect("first circuit");
    let mut second = proxy
        .create_circuit(&path, &dest, &r2.onion_public_key())
        .await
        .expect("second circuit over the same link");

    assert_ne!(first.id(), second.id(), "circuit ids must be unique");

    let a = vec![1u8; 900];
    let b = vec![2u8; 900];
    first.send_message(&a).await.expect("send on first");
    second.send_message(&b).await.expect("send on second");
    assert_eq!(recv_exact(&mut first, a.len()).await, a);
    assert_eq!(recv_exact(&mut second, b.len()).await, b);

    first.destroy().await.expect("destroy first");
    // The shared r1→r2 link must survive the first teardown.
    let c = vec![3u8; 64];
    second.send_message(&c).await.expect("second circuit still up");
    assert_eq!(recv_exact(&mut second, c.len()).await, c);

    second.destroy().await.expect("destroy second");
    wait_no_circuits(&r1, "r1").await;
    wait_no_circuits(&r2, "r2").await;
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn dial_failure_at_middle_reports_upstream() {
    init_tracing();
    let r1 = spawn_router().await;
    let r2 = spawn_router().await;
    // Nothing listens here; r2's dial must fail.
    let dead_hop = "127.0.0.1:9".to_string();

    let proxy = ProxyContext::new(TEST_TIMEOUT);
    let path = vec![r1.addr().to_string(), r2.addr().to_string(), dead_hop];
    let bogus_key = [7u8; 32];

    let err = proxy
        .create_circuit(&path, "10.0.0.1:80", &bogus_key)
        .await
        .expect_err("creation must fail when the next hop is unreachable");
    let reason = err.to_string();
    assert!(
        reason.contains("failed"),
        "error must surface the dial failure, got: {reason}"
    );

    // The failing hop keeps no state for the unbuilt circuit.
    wait_no_circuits(&r2, "r2").await;
    r2.check_invariants().expect("r2 invariants");
    r1.check_invariants().expect("r1 invariants");
}

#[tokio::test]
async fn proxy_disconnect_tears_down_circuit() {
    init_tracing();
    let r1 = spawn_router().await;
    let r2 = spawn_router().await;
    let dest = echo_server().await;

    let proxy = ProxyContext::new(TEST_TIMEOUT);
    let path = vec![r1.addr().to_string(), r2.addr().to_string()];
    let circuit = proxy
        .create_circuit(&path, &dest, &r2.onion_public_key())
        .await
        .expect("circuit");
    assert!(r1.is_entry(circuit.id()));

    // Dropping the proxy side closes its TLS connection; the entry's
    // reader must propagate teardown downstream.
    drop(circuit);

    wait_no_circuits(&r1, "r1").await;
    wait_no_circuits(&r2, "r2").await;
    r1.check_invariants().expect("r1 invariants");
    r2.check_invariants().expect("r2 invariants");
}
