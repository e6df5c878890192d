//! # Router Engine
//!
//! [`RouterContext`] is the runtime environment for one mixnet router: it
//! accepts authenticated connections from proxies and peer routers,
//! demultiplexes fixed-size cells per connection, translates circuit IDs
//! across hops, drives the CREATE/CREATED/DESTROY/DESTROYED protocol, and
//! spawns exit workers that speak plaintext TCP to final destinations.
//!
//! ## Task model
//!
//! Everything concurrent is a spawned task communicating over channels:
//!
//! - one accept task feeding per-connection reader tasks,
//! - three queue actors (relay, proxy request, proxy response) with one
//!   error-handler task each,
//! - one exit worker plus one response reader per exit circuit.
//!
//! A reader task owns its connection's read half and is the only place a
//! given hop's control directives are processed, so per-circuit control
//! ordering needs no extra synchronization.
//!
//! ## Traffic classes
//!
//! Relay cells between routers batch on circuit IDs in `q_relay`; traffic
//! to and from proxies batches on connection IDs in `q_proxy_req` /
//! `q_proxy_resp`. The ID ranges are disjoint so the sink keyspace is
//! shared safely.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::Context;
use rand::rngs::OsRng;
use rand::Rng;
use rustls::pki_types::ServerName;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, error, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::cell::{self, Cell, CellType, Directive, CELL_BYTES};
use crate::circuit::{
    Assembler, Circuit, OnionContext, EXIT_CHANNEL_DEPTH, MAX_MSG_BYTES, SEAL_OVERHEAD,
};
use crate::conn::{Conn, DestWriter, PeerReader};
use crate::crypto;
use crate::directory;
use crate::error::RouterError;
use crate::identity::Keypair;
use crate::queue::{spawn_error_handler, Queue, WriterRef};
use crate::registry::{CircuitRole, Registry, RouteSnapshot};

/// Capacity of the internal error channel surfaced by
/// [`RouterContext::take_errors`].
const ERRS_CHANNEL_SIZE: usize = 64;

/// Largest single destination read forwarded upstream. Sealing adds
/// [`SEAL_OVERHEAD`]; this keeps the sealed response within the message
/// cap the proxy-side reassembly enforces, so any reply the destination
/// can send in one read round-trips.
const MAX_RESPONSE_BYTES: usize = MAX_MSG_BYTES - SEAL_OVERHEAD;

/// Recognized router options.
#[derive(Clone, Debug)]
pub struct RouterConfig {
    /// Location of the policy domain configuration. Opaque to the core;
    /// retained for the external guard.
    pub path: Option<std::path::PathBuf>,
    /// Transport family, e.g. `"tcp"`.
    pub network: String,
    /// Local bind address. `"127.0.0.1:0"` binds an ephemeral loopback
    /// port; any other value is split on `:` and the port bound on all
    /// interfaces.
    pub addr: String,
    /// Queue flush threshold.
    pub batch_size: usize,
    /// I/O and dial deadline.
    pub timeout: Duration,
    /// Subject name for the self-signed certificate.
    pub x509_identity: String,
    /// Honor client-specified intermediate hops in CREATE paths. A known
    /// weakness kept for testing; leave off in production.
    pub allow_client_path_hints: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            path: None,
            network: "tcp".into(),
            addr: "127.0.0.1:0".into(),
            batch_size: 1,
            timeout: Duration::from_secs(10),
            x509_identity: "mixnet-router".into(),
            allow_client_path_hints: false,
        }
    }
}

/// What the reader loop should do after a cell was handled.
enum Flow {
    Continue,
    /// The connection's circuit set drained; stop reading.
    Shutdown,
}

/// Parameters of one exit circuit, handed to its worker.
struct ExitTask {
    dest: String,
    /// Incoming (upstream-side) circuit ID; response cells are stamped
    /// with it.
    id: u64,
    send_key: u64,
    resp_key: u64,
}

/// Runtime environment for one router instance. All state is in-memory
/// and ephemeral.
pub struct RouterContext {
    keypair: Keypair,
    onion_secret: StaticSecret,
    onion_public: [u8; 32],
    addr: String,
    local_addr: SocketAddr,
    network: String,
    timeout: Duration,
    allow_client_path_hints: bool,

    registry: Registry,
    q_relay: Queue,
    q_proxy_req: Queue,
    q_proxy_resp: Queue,

    directory: StdRwLock<Vec<String>>,

    connector: TlsConnector,

    errs_tx: mpsc::Sender<RouterError>,
    errs_rx: StdMutex<Option<mpsc::Receiver<RouterError>>>,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    error_handlers: StdMutex<Vec<JoinHandle<()>>>,
}

impl RouterContext {
    /// Generate keys, bind the listener, and start the queue and accept
    /// tasks.
    pub async fn new(config: RouterConfig) -> anyhow::Result<Arc<Self>> {
        let keypair = Keypair::generate();
        let (certs, key) = crypto::generate_ed25519_cert(&keypair, &config.x509_identity)?;
        let server_config = crypto::create_server_config(certs.clone(), key.clone_key())?;
        let client_config = crypto::create_router_client_config(certs, key)?;

        let onion_secret = StaticSecret::random_from_rng(OsRng);
        let onion_public = PublicKey::from(&onion_secret).to_bytes();

        let bind_addr = if config.addr == "127.0.0.1:0" {
            config.addr.clone()
        } else {
            let port = config
                .addr
                .rsplit(':')
                .next()
                .context("addr must contain a port")?;
            format!("0.0.0.0:{port}")
        };
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        let local_addr = listener.local_addr()?;
        let addr = if config.addr == "127.0.0.1:0" {
            local_addr.to_string()
        } else {
            config.addr.clone()
        };

        let (q_relay, relay_errs) = Queue::spawn("relay", config.batch_size, config.timeout);
        let (q_proxy_req, proxy_req_errs) =
            Queue::spawn("proxy-req", config.batch_size, config.timeout);
        let (q_proxy_resp, proxy_resp_errs) =
            Queue::spawn("proxy-resp", config.batch_size, config.timeout);

        // Each error handler reports on a queue other than the one it
        // serves, so a saturated sink cannot deadlock its own error path.
        let error_handlers = vec![
            spawn_error_handler(relay_errs, q_proxy_resp.clone()),
            spawn_error_handler(proxy_req_errs, q_proxy_resp.clone()),
            spawn_error_handler(proxy_resp_errs, q_relay.clone()),
        ];

        let (errs_tx, errs_rx) = mpsc::channel(ERRS_CHANNEL_SIZE);

        let router = Arc::new(Self {
            keypair,
            onion_secret,
            onion_public,
            addr,
            local_addr,
            network: config.network,
            timeout: config.timeout,
            allow_client_path_hints: config.allow_client_path_hints,
            registry: Registry::new(),
            q_relay,
            q_proxy_req,
            q_proxy_resp,
            directory: StdRwLock::new(Vec::new()),
            connector: TlsConnector::from(Arc::new(client_config)),
            errs_tx,
            errs_rx: StdMutex::new(Some(errs_rx)),
            accept_task: StdMutex::new(None),
            error_handlers: StdMutex::new(error_handlers),
        });

        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let accept_task = tokio::spawn(Self::run_accept_loop(router.clone(), listener, acceptor));
        *router.accept_task.lock().expect("accept task lock") = Some(accept_task);

        info!(addr = %router.addr, identity = %router.keypair.identity(), "router up");
        Ok(router)
    }

    /// Advertised address; what peers must list in CREATE paths.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Static onion public key proxies seal exit material to.
    pub fn onion_public_key(&self) -> [u8; 32] {
        self.onion_public
    }

    /// Receiver of router-internal errors. Can be taken once.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<RouterError>> {
        self.errs_rx.lock().expect("errs lock").take()
    }

    /// Replace the peer directory used for path filling.
    pub fn set_directory(&self, addrs: Vec<String>) {
        *self.directory.write().expect("directory lock") = addrs;
    }

    /// Register this router's address and onion key with a directory
    /// server. One-shot synchronous RPC.
    pub async fn register(&self, dir_addr: &str) -> anyhow::Result<()> {
        let mut stream = self.dial_raw(dir_addr).await?;
        directory::register(&mut stream, &self.addr, self.onion_public).await
    }

    /// Fetch the current peer list from a directory server.
    pub async fn refresh_directory(&self, dir_addr: &str) -> anyhow::Result<()> {
        let mut stream = self.dial_raw(dir_addr).await?;
        let addrs = directory::fetch(&mut stream).await?;
        self.set_directory(addrs);
        Ok(())
    }

    /// Stop the queues and the listener, then close every dialed
    /// connection; readers exit on the resulting EOF.
    pub async fn close(&self) {
        if let Some(task) = self.accept_task.lock().expect("accept task lock").take() {
            task.abort();
        }
        self.q_relay.quit().await;
        self.q_proxy_req.quit().await;
        self.q_proxy_resp.quit().await;
        for handler in self.error_handlers.lock().expect("handler lock").drain(..) {
            handler.abort();
        }
        for conn in self.registry.dialed_conns() {
            let _ = crate::queue::CellWriter::close(&*conn).await;
        }
        info!(addr = %self.addr, "router closed");
    }

    // ------------------------------------------------------------------
    // Test and operational inspection
    // ------------------------------------------------------------------

    pub fn is_entry(&self, id: u64) -> bool {
        self.registry.is_entry(id)
    }

    pub fn is_exit(&self, id: u64) -> bool {
        self.registry.is_exit(id)
    }

    pub fn next_of(&self, id: u64) -> Option<u64> {
        self.registry.next_of(id)
    }

    /// True when no circuit state remains anywhere in the registry.
    pub fn no_circuits(&self) -> bool {
        self.registry.no_circuits()
    }

    /// Structural invariants of the registry maps; see the registry docs.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.registry.check_invariants()
    }

    // ------------------------------------------------------------------
    // Connection plumbing
    // ------------------------------------------------------------------

    async fn run_accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            let (tcp, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "listener accept failed");
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let router = self.clone();
            tokio::spawn(async move {
                let tls = match tokio::time::timeout(router.timeout, acceptor.accept(tcp)).await {
                    Ok(Ok(tls)) => tls,
                    Ok(Err(e)) => {
                        debug!(peer = %peer, error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        debug!(peer = %peer, "TLS handshake timed out");
                        return;
                    }
                };
                let peer_certs = tls.get_ref().1.peer_certificates().map(<[_]>::to_vec);
                let with_proxy = peer_certs.as_ref().map_or(true, |c| c.is_empty());
                let identity = crypto::extract_peer_identity(peer_certs.as_deref());

                let id = router.registry.new_conn_id();
                let (conn, reader) = Conn::new(
                    id,
                    tls.into(),
                    peer.to_string(),
                    with_proxy,
                    identity,
                    router.timeout,
                );
                debug!(conn = id, peer = %peer, with_proxy, "connection accepted");
                router.spawn_reader(conn, reader);
            });
        }
    }

    /// Dial a peer router, register the connection for reuse, and start
    /// its reader.
    async fn dial_router(self: &Arc<Self>, addr: &str) -> Result<Arc<Conn>, RouterError> {
        let tls = self.dial_raw(addr).await.map_err(|e| RouterError::DialFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let peer_certs = tls.get_ref().1.peer_certificates().map(<[_]>::to_vec);
        let identity = crypto::extract_peer_identity(peer_certs.as_deref());

        let id = self.registry.new_conn_id();
        let (conn, reader) = Conn::new(
            id,
            tls.into(),
            addr.to_string(),
            false,
            identity,
            self.timeout,
        );
        self.registry.register_conn(addr, conn.clone());
        debug!(conn = id, peer = addr, "router dialed");
        self.spawn_reader(conn.clone(), reader);
        Ok(conn)
    }

    /// Dial over the authenticated transport without installing a
    /// connection; used for directory RPCs and as the first step of
    /// [`Self::dial_router`].
    async fn dial_raw(
        &self,
        addr: &str,
    ) -> anyhow::Result<tokio_rustls::client::TlsStream<TcpStream>> {
        anyhow::ensure!(self.network == "tcp", "unsupported network {}", self.network);
        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .context("dial timed out")?
            .with_context(|| format!("dial to {addr} failed"))?;
        let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
        let server_name =
            ServerName::try_from(host.to_string()).context("peer address is not a valid name")?;
        let tls = tokio::time::timeout(self.timeout, self.connector.connect(server_name, tcp))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;
        Ok(tls)
    }

    fn spawn_reader(self: &Arc<Self>, conn: Arc<Conn>, reader: PeerReader) {
        let router = self.clone();
        tokio::spawn(async move {
            router.run_reader(conn, reader).await;
        });
    }

    fn report_err(&self, err: RouterError) {
        if self.errs_tx.try_send(err).is_err() {
            debug!("error channel full or unread; dropping report");
        }
    }

    // ------------------------------------------------------------------
    // Per-connection reader
    // ------------------------------------------------------------------

    async fn run_reader(self: Arc<Self>, conn: Arc<Conn>, mut reader: PeerReader) {
        let mut buf = vec![0u8; CELL_BYTES];
        loop {
            match tokio::time::timeout(self.timeout, reader.read_exact(&mut buf)).await {
                Err(_) => {
                    debug!(conn = conn.id(), "read deadline expired");
                    break;
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!(conn = conn.id(), "peer closed");
                    break;
                }
                Ok(Err(e)) => {
                    self.report_err(e.into());
                    break;
                }
                Ok(Ok(_)) => {}
            }

            match self.handle_cell(&conn, &mut buf).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => break,
                Err(e) => {
                    if e.is_fatal() {
                        error!(conn = conn.id(), error = %e, "fatal protocol event");
                    }
                    self.report_err(e);
                    break;
                }
            }
        }
        self.teardown_conn(&conn).await;
    }

    /// Dispatch one whole cell read from `conn`.
    async fn handle_cell(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        buf: &mut Cell,
    ) -> Result<Flow, RouterError> {
        let id = cell::circuit_id(buf);
        let snap = self.registry.route(id);

        // Queue and sink-key selection: proxy links batch per connection,
        // relay links per circuit.
        let mut send_q = &self.q_relay;
        let mut resp_q = &self.q_relay;
        let mut s_key = snap.next_id.unwrap_or(0);
        let mut r_key = snap.prev_id.unwrap_or(0);
        if conn.with_proxy() {
            send_q = &self.q_proxy_req;
            resp_q = &self.q_proxy_resp;
            s_key = conn.sink_key();
            r_key = conn.sink_key();
        } else if snap.entry_prev {
            resp_q = &self.q_proxy_resp;
            r_key = snap
                .prev_conn
                .as_ref()
                .map(|c| c.sink_key())
                .unwrap_or(r_key);
        } else if snap.exit {
            r_key = id;
        }

        let kind = match CellType::try_from(buf[cell::TYPE]) {
            Ok(kind) => kind,
            Err(e) => {
                // Unknown cell type: report toward the sender.
                self.send_error(resp_q, r_key, id, &e, conn).await;
                return Ok(Flow::Continue);
            }
        };

        match kind {
            CellType::Msg => {
                self.handle_msg(conn, buf, id, &snap, send_q, resp_q, s_key, r_key)
                    .await
            }
            CellType::Dir => {
                let directive = match cell::decode_directive(&buf[cell::BODY..]) {
                    Ok(d) => d,
                    Err(e) => {
                        self.send_error(resp_q, r_key, id, &e, conn).await;
                        return Ok(Flow::Continue);
                    }
                };
                match directive {
                    Directive::Create {
                        addrs,
                        key,
                        sealed_dest,
                    } => {
                        self.handle_create(conn, id, addrs, key, sealed_dest, send_q, resp_q, r_key)
                            .await
                    }
                    Directive::Created => {
                        self.relay_upstream(conn, id, &snap, resp_q, r_key, &Directive::Created)
                            .await;
                        Ok(Flow::Continue)
                    }
                    Directive::Destroy => {
                        self.handle_destroy(conn, id, &snap, send_q, resp_q, s_key, r_key)
                            .await
                    }
                    Directive::Destroyed => {
                        self.handle_destroyed(conn, id, &snap, send_q, resp_q, r_key).await
                    }
                    Directive::Error { .. } => {
                        // Relay toward the origin unchanged apart from the ID.
                        if let (Some(prev_id), Some(prev_conn)) =
                            (snap.prev_id, snap.prev_conn.clone())
                        {
                            let mut relayed = buf.clone();
                            cell::set_circuit_id(&mut relayed, prev_id);
                            resp_q
                                .enqueue(r_key, relayed, prev_conn, Some(conn.clone() as WriterRef), id)
                                .await;
                        } else {
                            debug!(conn = conn.id(), id, "dropping error for unknown circuit");
                        }
                        Ok(Flow::Continue)
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_msg(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        buf: &mut Cell,
        id: u64,
        snap: &RouteSnapshot,
        send_q: &Queue,
        resp_q: &Queue,
        s_key: u64,
        r_key: u64,
    ) -> Result<Flow, RouterError> {
        if snap.exit {
            // Terminal hop: hand the body to the circuit's reassembly.
            match conn.exit_sender(id) {
                Some(sender) => {
                    if sender.send(buf[cell::BODY..].to_vec()).await.is_err() {
                        let e = RouterError::BadDirective("circuit is gone".into());
                        self.send_error(resp_q, r_key, id, &e, conn).await;
                    }
                }
                None => {
                    let e = RouterError::BadDirective("no circuit for message".into());
                    self.send_error(resp_q, r_key, id, &e, conn).await;
                }
            }
            return Ok(Flow::Continue);
        }

        // Relay: rewrite the ID in place and forward along the circuit.
        if let (Some(next_id), Some(next_conn)) = (snap.next_id, snap.next_conn.clone()) {
            cell::set_circuit_id(buf, next_id);
            send_q
                .enqueue(s_key, buf.clone(), next_conn, Some(conn.clone() as WriterRef), id)
                .await;
        } else if let (Some(prev_id), Some(prev_conn)) = (snap.prev_id, snap.prev_conn.clone()) {
            cell::set_circuit_id(buf, prev_id);
            resp_q
                .enqueue(r_key, buf.clone(), prev_conn, Some(conn.clone() as WriterRef), id)
                .await;
        } else {
            let e = RouterError::BadDirective("no circuit for message".into());
            self.send_error(resp_q, r_key, id, &e, conn).await;
        }
        Ok(Flow::Continue)
    }

    /// Re-emit a directive toward the previous hop with the translated ID.
    async fn relay_upstream(
        &self,
        conn: &Arc<Conn>,
        id: u64,
        snap: &RouteSnapshot,
        resp_q: &Queue,
        r_key: u64,
        directive: &Directive,
    ) {
        let (Some(prev_id), Some(prev_conn)) = (snap.prev_id, snap.prev_conn.clone()) else {
            debug!(conn = conn.id(), id, "no upstream for directive");
            return;
        };
        match cell::encode_dir(prev_id, directive) {
            Ok(relayed) => {
                resp_q
                    .enqueue(r_key, relayed, prev_conn, Some(conn.clone() as WriterRef), id)
                    .await;
            }
            Err(e) => warn!(error = %e, "could not re-encode directive"),
        }
    }

    // ------------------------------------------------------------------
    // CREATE
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn handle_create(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        id: u64,
        mut addrs: Vec<String>,
        key: Vec<u8>,
        sealed_dest: Vec<u8>,
        send_q: &Queue,
        resp_q: &Queue,
        r_key: u64,
    ) -> Result<Flow, RouterError> {
        let entry = conn.with_proxy();

        if entry {
            if let Err(e) = self.fill_path(&mut addrs) {
                self.send_error(resp_q, r_key, id, &e, conn).await;
                return Ok(Flow::Continue);
            }
        }

        let Some(position) = addrs.iter().position(|a| a == &self.addr) else {
            let e = RouterError::BadDirective("own address missing from path".into());
            self.send_error(resp_q, r_key, id, &e, conn).await;
            return Ok(Flow::Continue);
        };

        if position < addrs.len() - 1 {
            self.create_relay_hop(conn, entry, id, position, addrs, key, sealed_dest, send_q, resp_q, r_key)
                .await
        } else {
            self.create_exit_hop(conn, entry, id, key, sealed_dest, send_q, resp_q, r_key)
                .await
        }
    }

    /// Fill empty intermediate path slots from the directory, honoring
    /// pre-specified hops only when path hints are enabled. Selection is
    /// uniform without replacement, excluding routers already on the
    /// path. Only the slots strictly between the entry and the exit are
    /// ever filled: the exit must be client-specified so the destination
    /// can be sealed to its key, and an empty exit slot is rejected
    /// rather than escalating into an authentication failure there.
    fn fill_path(&self, addrs: &mut [String]) -> Result<(), RouterError> {
        if addrs.len() < 2 {
            return Err(RouterError::BadDirective("path too short".into()));
        }
        let last = addrs.len() - 1;
        if addrs[last].is_empty() {
            return Err(RouterError::BadDirective(
                "exit hop must be client-specified".into(),
            ));
        }
        if addrs.len() <= 3 {
            // No intermediate slots to police or fill.
            return Ok(());
        }
        if !self.allow_client_path_hints && addrs[2..last].iter().any(|slot| !slot.is_empty()) {
            return Err(RouterError::BadDirective(
                "client-specified intermediate hops are not allowed".into(),
            ));
        }
        if addrs[2..last].iter().all(|slot| !slot.is_empty()) {
            return Ok(());
        }

        let directory = self.directory.read().expect("directory lock");
        let mut pool: Vec<String> = directory
            .iter()
            .filter(|candidate| !addrs.contains(*candidate))
            .cloned()
            .collect();
        drop(directory);

        for slot in addrs[2..last].iter_mut() {
            if !slot.is_empty() {
                continue;
            }
            if pool.is_empty() {
                return Err(RouterError::BadDirective(
                    "directory cannot fill requested path".into(),
                ));
            }
            let pick = OsRng.gen_range(0..pool.len());
            *slot = pool.swap_remove(pick);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_relay_hop(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        entry: bool,
        id: u64,
        position: usize,
        addrs: Vec<String>,
        key: Vec<u8>,
        sealed_dest: Vec<u8>,
        send_q: &Queue,
        resp_q: &Queue,
        r_key: u64,
    ) -> Result<Flow, RouterError> {
        let next_addr = addrs[position + 1].clone();

        // Reuse an existing connection to the next hop or dial one. A
        // failed dial leaves no registry state behind.
        let next_conn = match self.registry.lookup_conn(&next_addr) {
            Some(existing) => existing,
            None => match self.dial_router(&next_addr).await {
                Ok(dialed) => dialed,
                Err(e) => {
                    warn!(conn = conn.id(), next = %next_addr, error = %e, "create failed at dial");
                    self.send_error(resp_q, r_key, id, &e, conn).await;
                    return Ok(Flow::Continue);
                }
            },
        };

        let new_id = self.registry.install_circuit(
            conn,
            id,
            entry,
            CircuitRole::Relay {
                next_conn: next_conn.clone(),
            },
        );
        conn.add_circuit(Circuit::relay(id));
        next_conn.add_circuit(Circuit::relay(new_id));

        let forwarded = Directive::Create {
            addrs,
            key,
            sealed_dest,
        };
        let forward_key = if entry { conn.sink_key() } else { new_id };
        match cell::encode_dir(new_id, &forwarded) {
            Ok(next_cell) => {
                send_q
                    .enqueue(
                        forward_key,
                        next_cell,
                        next_conn,
                        Some(conn.clone() as WriterRef),
                        id,
                    )
                    .await;
            }
            Err(e) => {
                self.send_error(resp_q, r_key, id, &e, conn).await;
            }
        }
        Ok(Flow::Continue)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_exit_hop(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        entry: bool,
        id: u64,
        key: Vec<u8>,
        sealed_dest: Vec<u8>,
        send_q: &Queue,
        resp_q: &Queue,
        r_key: u64,
    ) -> Result<Flow, RouterError> {
        let Ok(client_public) = <[u8; 32]>::try_from(key.as_slice()) else {
            let e = RouterError::BadDirective("client key must be 32 bytes".into());
            self.send_error(resp_q, r_key, id, &e, conn).await;
            return Ok(Flow::Continue);
        };
        let onion = Arc::new(OnionContext::exit(&client_public, &self.onion_secret));

        // Misauthenticated destination ciphertext is an adversarial
        // event: abort the handshake with nothing sent upstream. The
        // reader loop logs it as fatal.
        let dest_bytes = onion.open(&sealed_dest)?;
        let dest = String::from_utf8(dest_bytes)
            .map_err(|_| RouterError::BadDirective("destination is not valid UTF-8".into()))?;

        let new_id = self
            .registry
            .install_circuit(conn, id, entry, CircuitRole::Exit);

        let (cell_tx, cell_rx) = mpsc::channel(EXIT_CHANNEL_DEPTH);
        conn.add_circuit(Circuit::exit(id, cell_tx));

        let (send_key, resp_key) = if entry {
            (conn.sink_key(), conn.sink_key())
        } else {
            (new_id, id)
        };
        let task = ExitTask {
            dest,
            id,
            send_key,
            resp_key,
        };
        let router = self.clone();
        let worker_conn = conn.clone();
        let worker_send_q = send_q.clone();
        let worker_resp_q = resp_q.clone();
        tokio::spawn(async move {
            router
                .run_exit_worker(task, cell_rx, onion, worker_conn, worker_send_q, worker_resp_q)
                .await;
        });

        // Tell the previous hop the circuit is up.
        match cell::encode_dir(id, &Directive::Created) {
            Ok(created) => {
                resp_q
                    .enqueue(resp_key, created, conn.clone(), None, id)
                    .await;
            }
            Err(e) => warn!(error = %e, "could not encode CREATED"),
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // DESTROY / DESTROYED
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn handle_destroy(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        id: u64,
        snap: &RouteSnapshot,
        send_q: &Queue,
        resp_q: &Queue,
        s_key: u64,
        r_key: u64,
    ) -> Result<Flow, RouterError> {
        if !conn.member(id) {
            return Err(RouterError::NotOwned(id));
        }

        if snap.exit {
            // Dropping the record closes the exit worker's channel; the
            // worker shuts the destination socket on its way out.
            let down_id = snap.next_id.unwrap_or(id);
            let empty = conn.remove_circuit(id);
            self.registry.remove_circuit_pair(id, down_id);
            if empty {
                self.registry.remove_conn(conn.peer_addr());
            }
            // The destination sink is circuit-keyed only on relay-side
            // entry; a proxy-facing sink is shared by the whole
            // connection and stays.
            if !conn.with_proxy() {
                send_q.close_sink(s_key, None, true, None, None).await;
            }
            let destroyed = cell::encode_dir(id, &Directive::Destroyed)
                .expect("static directive always encodes");
            resp_q
                .close_sink(
                    r_key,
                    Some(destroyed),
                    empty,
                    Some(conn.clone() as WriterRef),
                    Some(conn.clone() as WriterRef),
                )
                .await;
            Ok(Flow::Continue)
        } else {
            // Forward and wait for DESTROYED to come back before deleting
            // local state.
            let (Some(next_id), Some(next_conn)) = (snap.next_id, snap.next_conn.clone()) else {
                let e = RouterError::BadDirective("circuit has no downstream".into());
                self.send_error(resp_q, r_key, id, &e, conn).await;
                return Ok(Flow::Continue);
            };
            let forwarded = cell::encode_dir(next_id, &Directive::Destroy)
                .expect("static directive always encodes");
            send_q
                .enqueue(s_key, forwarded, next_conn, Some(conn.clone() as WriterRef), id)
                .await;
            Ok(Flow::Continue)
        }
    }

    async fn handle_destroyed(
        self: &Arc<Self>,
        conn: &Arc<Conn>,
        id: u64,
        snap: &RouteSnapshot,
        send_q: &Queue,
        resp_q: &Queue,
        r_key: u64,
    ) -> Result<Flow, RouterError> {
        let (Some(prev_id), Some(prev_conn)) = (snap.prev_id, snap.prev_conn.clone()) else {
            debug!(conn = conn.id(), id, "DESTROYED for unknown circuit");
            return Ok(Flow::Continue);
        };

        self.registry.remove_circuit_pair(prev_id, id);
        let empty_down = conn.remove_circuit(id);
        let empty_up = prev_conn.remove_circuit(prev_id);
        if empty_down {
            self.registry.remove_conn(conn.peer_addr());
        }
        if empty_up {
            self.registry.remove_conn(prev_conn.peer_addr());
        }

        // The downstream sink is keyed by the ID riding the downstream
        // link; no more cells are expected on it.
        send_q
            .close_sink(
                id,
                None,
                empty_down,
                Some(conn.clone() as WriterRef),
                Some(prev_conn.clone() as WriterRef),
            )
            .await;
        let destroyed = cell::encode_dir(prev_id, &Directive::Destroyed)
            .expect("static directive always encodes");
        resp_q
            .close_sink(r_key, Some(destroyed), empty_up, Some(prev_conn as WriterRef), None)
            .await;

        if empty_down {
            Ok(Flow::Shutdown)
        } else {
            Ok(Flow::Continue)
        }
    }

    /// Tear down every circuit riding a failed or closed connection:
    /// DESTROYED travels upstream, DESTROY downstream, then all registry
    /// state for the connection is removed. Idempotent.
    async fn teardown_conn(self: &Arc<Self>, conn: &Arc<Conn>) {
        if !conn.begin_teardown() {
            return;
        }
        for circuit_id in conn.circuit_ids() {
            let snap = self.registry.route(circuit_id);
            if snap.exit {
                // Dropping the record below ends the exit worker; there
                // is no downstream router to notify.
                self.registry
                    .remove_circuit_pair(circuit_id, snap.next_id.unwrap_or(circuit_id));
            } else if let Some(prev_id) = snap.prev_id {
                // This connection was the downstream side; notify upstream.
                if let Some(prev_conn) = snap.prev_conn {
                    let (resp_q, r_key) = if snap.entry_prev {
                        (&self.q_proxy_resp, prev_conn.sink_key())
                    } else {
                        (&self.q_relay, prev_id)
                    };
                    self.registry.remove_circuit_pair(prev_id, circuit_id);
                    if prev_conn.remove_circuit(prev_id) {
                        self.registry.remove_conn(prev_conn.peer_addr());
                    }
                    let destroyed = cell::encode_dir(prev_id, &Directive::Destroyed)
                        .expect("static directive always encodes");
                    resp_q
                        .enqueue(r_key, destroyed, prev_conn, None, prev_id)
                        .await;
                }
            } else if let Some(next_id) = snap.next_id {
                // This connection was the upstream side; propagate the
                // teardown downstream.
                if let Some(next_conn) = snap.next_conn {
                    self.registry.remove_circuit_pair(circuit_id, next_id);
                    if next_conn.remove_circuit(next_id) {
                        self.registry.remove_conn(next_conn.peer_addr());
                    }
                    let destroy = cell::encode_dir(next_id, &Directive::Destroy)
                        .expect("static directive always encodes");
                    self.q_relay
                        .enqueue(next_id, destroy, next_conn, None, next_id)
                        .await;
                }
            }
            conn.remove_circuit(circuit_id);
        }

        self.registry.remove_conn(conn.peer_addr());
        self.registry.release_conn_id(conn.id());
        if conn.with_proxy() {
            self.q_proxy_req
                .close_sink(conn.sink_key(), None, false, None, None)
                .await;
            self.q_proxy_resp
                .close_sink(conn.sink_key(), None, true, Some(conn.clone() as WriterRef), None)
                .await;
        }
        let _ = crate::queue::CellWriter::close(&**conn).await;
        debug!(conn = conn.id(), "connection torn down");
    }

    // ------------------------------------------------------------------
    // Exit side
    // ------------------------------------------------------------------

    /// Reassemble messages for one exit circuit and forward them to the
    /// destination, dialing lazily on the first complete message. Ends
    /// when the circuit record is dropped.
    async fn run_exit_worker(
        self: Arc<Self>,
        task: ExitTask,
        mut cell_rx: mpsc::Receiver<Vec<u8>>,
        onion: Arc<OnionContext>,
        upstream: Arc<Conn>,
        send_q: Queue,
        resp_q: Queue,
    ) {
        let mut assembler = Assembler::new();
        let mut dest_writer: Option<Arc<DestWriter>> = None;

        while let Some(body) = cell_rx.recv().await {
            let sealed = match assembler.feed(&body) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    self.send_error(&resp_q, task.resp_key, task.id, &e, &upstream)
                        .await;
                    continue;
                }
            };
            let message = match onion.open(&sealed) {
                Ok(message) => message,
                Err(e) => {
                    warn!(id = task.id, "dropping misauthenticated message");
                    self.send_error(&resp_q, task.resp_key, task.id, &e, &upstream)
                        .await;
                    continue;
                }
            };

            if dest_writer.is_none() {
                match tokio::time::timeout(self.timeout, TcpStream::connect(&task.dest)).await {
                    Ok(Ok(stream)) => {
                        let (read_half, write_half) = stream.into_split();
                        dest_writer = Some(DestWriter::new(write_half, self.timeout));
                        let router = self.clone();
                        let reader_onion = onion.clone();
                        let reader_upstream = upstream.clone();
                        let reader_resp_q = resp_q.clone();
                        let id = task.id;
                        let resp_key = task.resp_key;
                        tokio::spawn(async move {
                            router
                                .run_response_reader(
                                    read_half,
                                    reader_onion,
                                    id,
                                    resp_key,
                                    reader_upstream,
                                    reader_resp_q,
                                )
                                .await;
                        });
                    }
                    Ok(Err(e)) => {
                        let e = RouterError::DialFailed {
                            addr: task.dest.clone(),
                            reason: e.to_string(),
                        };
                        self.send_error(&resp_q, task.resp_key, task.id, &e, &upstream)
                            .await;
                        continue;
                    }
                    Err(_) => {
                        let e = RouterError::DialFailed {
                            addr: task.dest.clone(),
                            reason: "dial timed out".into(),
                        };
                        self.send_error(&resp_q, task.resp_key, task.id, &e, &upstream)
                            .await;
                        continue;
                    }
                }
            }

            let writer = dest_writer.clone().expect("destination dialed above");
            send_q
                .enqueue(
                    task.send_key,
                    message,
                    writer,
                    Some(upstream.clone() as WriterRef),
                    task.id,
                )
                .await;
        }
        debug!(id = task.id, dest = %task.dest, "exit worker done");
    }

    /// Read destination responses, seal and fragment them, and queue the
    /// cells upstream in fragmentation order.
    async fn run_response_reader(
        self: Arc<Self>,
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        onion: Arc<OnionContext>,
        id: u64,
        resp_key: u64,
        upstream: Arc<Conn>,
        resp_q: Queue,
    ) {
        let mut buf = vec![0u8; MAX_RESPONSE_BYTES + 1];
        loop {
            let n = match tokio::time::timeout(self.timeout, read_half.read(&mut buf)).await {
                Err(_) => {
                    self.send_error(&resp_q, resp_key, id, &RouterError::Timeout, &upstream)
                        .await;
                    return;
                }
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::UnexpectedEof
                            | std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::BrokenPipe
                    ) =>
                {
                    return;
                }
                Ok(Err(e)) => {
                    self.send_error(
                        &resp_q,
                        resp_key,
                        id,
                        &RouterError::WriteFailed(e.to_string()),
                        &upstream,
                    )
                    .await;
                    return;
                }
                Ok(Ok(0)) => return,
                Ok(Ok(n)) => n,
            };
            if n > MAX_RESPONSE_BYTES {
                self.send_error(&resp_q, resp_key, id, &RouterError::MsgTooLarge, &upstream)
                    .await;
                return;
            }

            let sealed = onion.seal(&buf[..n]);
            for body in crate::circuit::fragment(&sealed) {
                match cell::encode_msg(id, &body) {
                    Ok(response_cell) => {
                        resp_q
                            .enqueue(resp_key, response_cell, upstream.clone(), None, id)
                            .await;
                    }
                    Err(e) => {
                        warn!(error = %e, "could not encode response fragment");
                        return;
                    }
                }
            }
        }
    }

    /// Report an error toward a peer as an ERROR directive.
    async fn send_error(
        &self,
        queue: &Queue,
        key: u64,
        id: u64,
        err: &RouterError,
        dst: &Arc<Conn>,
    ) {
        let directive = Directive::Error {
            reason: err.to_string(),
        };
        match cell::encode_dir(id, &directive) {
            Ok(report) => {
                queue
                    .enqueue(key, report, dst.clone() as WriterRef, None, id)
                    .await;
            }
            Err(e) => warn!(error = %e, "could not encode error directive"),
        }
    }
}
