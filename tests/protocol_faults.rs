//! Adversarial and malformed-input behavior, driven over a raw proxy-side
//! TLS connection speaking cells directly.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test protocol_faults -- --nocapture

use std::sync::{Arc, Once};
use std::time::Duration;

use mixnet::cell::{self, CellType, Directive, CELL_BYTES, TYPE};
use mixnet::circuit::{generate_ephemeral, OnionContext, MAX_MSG_BYTES, MSG_LEN_SIZE};
use mixnet::{RouterConfig, RouterContext, RouterError};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

static INIT: Once = Once::new();

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

/// A circuit ID in the valid range that no test router will have allocated.
const TEST_CIRCUIT_ID: u64 = (1 << 32) + 0x1234;

async fn spawn_router(config: RouterConfig) -> Arc<RouterContext> {
    RouterContext::new(RouterConfig {
        timeout: TEST_TIMEOUT,
        ..config
    })
    .await
    .expect("router must start")
}

/// Anonymous proxy-side TLS connection carrying raw cells.
struct RawProxy {
    stream: tokio_rustls::client::TlsStream<TcpStream>,
}

impl RawProxy {
    async fn connect(addr: &str) -> Self {
        let config = mixnet::crypto::create_proxy_client_config();
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(addr).await.expect("tcp connect");
        let host = addr.rsplit_once(':').expect("host:port").0;
        let server_name = ServerName::try_from(host.to_string()).expect("server name");
        let stream = connector.connect(server_name, tcp).await.expect("tls connect");
        Self { stream }
    }

    async fn send(&mut self, cell_bytes: &[u8]) {
        self.stream.write_all(cell_bytes).await.expect("cell write");
        self.stream.flush().await.expect("cell flush");
    }

    async fn read_cell(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; CELL_BYTES];
        tokio::time::timeout(TEST_TIMEOUT, self.stream.read_exact(&mut buf))
            .await
            .expect("cell must arrive before the deadline")
            .expect("cell read");
        buf
    }

    async fn read_directive(&mut self) -> Directive {
        loop {
            let buf = self.read_cell().await;
            let (_, kind, body) = cell::decode(&buf).expect("well-formed cell");
            if kind == CellType::Dir {
                return cell::decode_directive(body).expect("well-formed directive");
            }
        }
    }

    /// Establish a circuit the way ProxyContext would, returning the
    /// onion context for further traffic.
    async fn create_circuit(&mut self, router: &RouterContext, dest: &str) -> OnionContext {
        let (ephemeral_secret, ephemeral_public) = generate_ephemeral();
        let onion = OnionContext::proxy(&ephemeral_secret, &router.onion_public_key());
        let create = Directive::Create {
            addrs: vec!["proxy".into(), router.addr().to_string()],
            key: ephemeral_public.to_vec(),
            sealed_dest: onion.seal(dest.as_bytes()),
        };
        let create_cell = cell::encode_dir(TEST_CIRCUIT_ID, &create).expect("encode create");
        self.send(&create_cell).await;
        match self.read_directive().await {
            Directive::Created => onion,
            other => panic!("expected CREATED, got {other:?}"),
        }
    }
}

fn expect_error_containing(directive: Directive, needle: &str) {
    match directive {
        Directive::Error { reason } => assert!(
            reason.contains(needle),
            "error reason must mention {needle:?}, got: {reason}"
        ),
        other => panic!("expected ERROR directive, got {other:?}"),
    }
}

// ============================================================================
// Malformed cells
// ============================================================================

#[tokio::test]
async fn unknown_cell_type_reported_to_sender() {
    init_tracing();
    let router = spawn_router(RouterConfig::default()).await;
    let mut proxy = RawProxy::connect(router.addr()).await;

    let mut bad = cell::encode_msg(TEST_CIRCUIT_ID, b"payload").expect("cell");
    bad[TYPE] = 9;
    proxy.send(&bad).await;

    expect_error_containing(proxy.read_directive().await, "cell type");
}

#[tokio::test]
async fn malformed_directive_reported_to_sender() {
    init_tracing();
    let router = spawn_router(RouterConfig::default()).await;
    let mut proxy = RawProxy::connect(router.addr()).await;

    // Plausible length prefix, garbage payload.
    let mut bad = cell::encode_msg(TEST_CIRCUIT_ID, &[]).expect("cell");
    bad[TYPE] = CellType::Dir as u8;
    bad[cell::BODY] = 64;
    bad[cell::BODY + 1] = 0;
    for byte in &mut bad[cell::BODY + 2..cell::BODY + 66] {
        *byte = 0xFE;
    }
    proxy.send(&bad).await;

    expect_error_containing(proxy.read_directive().await, "directive");
}

// ============================================================================
// Path policy
// ============================================================================

#[tokio::test]
async fn client_path_hints_rejected_by_default() {
    init_tracing();
    let router = spawn_router(RouterConfig::default()).await;
    let mut proxy = RawProxy::connect(router.addr()).await;

    let (_, ephemeral_public) = generate_ephemeral();
    let create = Directive::Create {
        addrs: vec![
            "proxy".into(),
            router.addr().to_string(),
            "10.9.9.1:1".into(),
            "10.9.9.2:1".into(),
        ],
        key: ephemeral_public.to_vec(),
        sealed_dest: vec![0u8; 60],
    };
    let create_cell = cell::encode_dir(TEST_CIRCUIT_ID, &create).expect("encode");
    proxy.send(&create_cell).await;

    expect_error_containing(proxy.read_directive().await, "not allowed");
    assert!(router.no_circuits(), "rejected create must leave no state");
}

#[tokio::test]
async fn empty_exit_slot_rejected() {
    init_tracing();
    let router = spawn_router(RouterConfig::default()).await;
    router.set_directory(vec!["10.9.9.1:1".into(), "10.9.9.2:1".into()]);
    let mut proxy = RawProxy::connect(router.addr()).await;

    // The destination is sealed to a specific exit's key, so the exit
    // slot cannot be left for the entry to fill: that create must fail
    // cleanly instead of reaching a random exit that cannot open it.
    let (_, ephemeral_public) = generate_ephemeral();
    let create = Directive::Create {
        addrs: vec![
            "proxy".into(),
            router.addr().to_string(),
            String::new(),
            String::new(),
        ],
        key: ephemeral_public.to_vec(),
        sealed_dest: vec![0u8; 60],
    };
    let create_cell = cell::encode_dir(TEST_CIRCUIT_ID, &create).expect("encode");
    proxy.send(&create_cell).await;

    expect_error_containing(proxy.read_directive().await, "exit");
    assert!(router.no_circuits(), "rejected create must leave no state");
}

#[tokio::test]
async fn empty_directory_cannot_fill_path() {
    init_tracing();
    let router = spawn_router(RouterConfig::default()).await;
    let mut proxy = RawProxy::connect(router.addr()).await;

    let (_, ephemeral_public) = generate_ephemeral();
    let create = Directive::Create {
        addrs: vec![
            "proxy".into(),
            router.addr().to_string(),
            String::new(),
            "10.9.9.2:1".into(),
        ],
        key: ephemeral_public.to_vec(),
        sealed_dest: vec![0u8; 60],
    };
    let create_cell = cell::encode_dir(TEST_CIRCUIT_ID, &create).expect("encode");
    proxy.send(&create_cell).await;

    expect_error_containing(proxy.read_directive().await, "directory");
    assert!(router.no_circuits(), "rejected create must leave no state");
}

// ============================================================================
// Exit-side message limits
// ============================================================================

#[tokio::test]
async fn oversized_message_rejected_circuit_survives() {
    init_tracing();
    let router = spawn_router(RouterConfig {
        allow_client_path_hints: true,
        ..RouterConfig::default()
    })
    .await;
    let mut proxy = RawProxy::connect(router.addr()).await;
    // The destination is never dialed; the message dies in reassembly.
    proxy.create_circuit(&router, "127.0.0.1:1").await;

    let mut body = vec![0u8; MSG_LEN_SIZE];
    body[..MSG_LEN_SIZE].copy_from_slice(&((MAX_MSG_BYTES as u64) + 1).to_le_bytes());
    let oversized = cell::encode_msg(TEST_CIRCUIT_ID, &body).expect("cell");
    proxy.send(&oversized).await;

    expect_error_containing(proxy.read_directive().await, "maximum size");

    // The circuit outlives the failed message until an explicit DESTROY.
    assert!(!router.no_circuits(), "circuit must survive the error");
    let destroy = cell::encode_dir(TEST_CIRCUIT_ID, &Directive::Destroy).expect("encode");
    proxy.send(&destroy).await;
    match proxy.read_directive().await {
        Directive::Destroyed => {}
        other => panic!("expected DESTROYED, got {other:?}"),
    }
}

// ============================================================================
// Adversarial events
// ============================================================================

#[tokio::test]
async fn misauthenticated_create_aborts_handshake() {
    init_tracing();
    let router = spawn_router(RouterConfig {
        allow_client_path_hints: true,
        ..RouterConfig::default()
    })
    .await;
    let mut errs = router.take_errors().expect("error receiver");
    let mut proxy = RawProxy::connect(router.addr()).await;

    let (_, ephemeral_public) = generate_ephemeral();
    let create = Directive::Create {
        addrs: vec!["proxy".into(), router.addr().to_string()],
        key: ephemeral_public.to_vec(),
        // Not sealed to the router's key; open must fail.
        sealed_dest: vec![0xAB; 60],
    };
    let create_cell = cell::encode_dir(TEST_CIRCUIT_ID, &create).expect("encode");
    proxy.send(&create_cell).await;

    let err = tokio::time::timeout(TEST_TIMEOUT, errs.recv())
        .await
        .expect("fatal event must be reported")
        .expect("error channel open");
    assert!(
        matches!(err, RouterError::AuthFail),
        "expected AuthFail, got {err:?}"
    );

    // No CREATED is emitted; the router aborts the connection instead.
    let mut buf = vec![0u8; CELL_BYTES];
    let outcome = tokio::time::timeout(TEST_TIMEOUT, proxy.stream.read_exact(&mut buf)).await;
    match outcome {
        Ok(Err(_)) => {}
        Ok(Ok(_)) => panic!("router must not answer a misauthenticated create"),
        Err(_) => panic!("connection must be torn down, not left hanging"),
    }
    assert!(router.no_circuits(), "aborted create must leave no state");
}

#[tokio::test]
async fn destroy_for_foreign_circuit_is_not_owned() {
    init_tracing();
    let router = spawn_router(RouterConfig {
        allow_client_path_hints: true,
        ..RouterConfig::default()
    })
    .await;
    let mut errs = router.take_errors().expect("error receiver");
    let mut proxy = RawProxy::connect(router.addr()).await;
    proxy.create_circuit(&router, "127.0.0.1:1").await;

    // A DESTROY naming an id that does not ride this connection must not
    // tear anything down.
    let foreign = TEST_CIRCUIT_ID + 1;
    let destroy = cell::encode_dir(foreign, &Directive::Destroy).expect("encode");
    proxy.send(&destroy).await;

    let err = tokio::time::timeout(TEST_TIMEOUT, errs.recv())
        .await
        .expect("NotOwned must be reported")
        .expect("error channel open");
    assert!(
        matches!(err, RouterError::NotOwned(id) if id == foreign),
        "expected NotOwned({foreign:#x}), got {err:?}"
    );
}
