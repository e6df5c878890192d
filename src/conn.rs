//! # Peer Connections
//!
//! A [`Conn`] is one authenticated TLS session to a peer router or an
//! anonymous proxy. The reader half is owned by the per-connection reader
//! task; the writer half lives behind a lock and is shared with the
//! batching queues through the [`CellWriter`] capability.
//!
//! Each connection exclusively owns the [`Circuit`] records for the
//! circuit IDs riding on it. The registry references circuits by ID only,
//! so dropping a record here is what actually ends a circuit's life.
//!
//! Lock order: registry → connection → queue. This module's locks are
//! leaves; nothing here calls back into the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_rustls::TlsStream;

use crate::circuit::Circuit;
use crate::identity::Identity;
use crate::queue::CellWriter;

/// TLS stream to a peer, from either the accept or the dial side.
pub type PeerStream = TlsStream<TcpStream>;

/// Read half handed to the per-connection reader task.
pub type PeerReader = ReadHalf<PeerStream>;

/// One authenticated session to a peer router or proxy.
pub struct Conn {
    id: u32,
    peer_addr: String,
    with_proxy: bool,
    peer_identity: Option<Identity>,
    writer: Mutex<WriteHalf<PeerStream>>,
    write_timeout_ms: AtomicU64,
    circuits: StdMutex<HashMap<u64, Circuit>>,
    torn_down: AtomicBool,
}

impl Conn {
    /// Wrap a completed TLS session. Returns the shared connection and
    /// the read half for the reader task.
    pub fn new(
        id: u32,
        stream: PeerStream,
        peer_addr: String,
        with_proxy: bool,
        peer_identity: Option<Identity>,
        timeout: Duration,
    ) -> (Arc<Self>, PeerReader) {
        let (reader, writer) = tokio::io::split(stream);
        let conn = Arc::new(Self {
            id,
            peer_addr,
            with_proxy,
            peer_identity,
            writer: Mutex::new(writer),
            write_timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            circuits: StdMutex::new(HashMap::new()),
            torn_down: AtomicBool::new(false),
        });
        (conn, reader)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The connection ID widened for use as a queue sink key. Connection
    /// IDs and circuit IDs occupy disjoint u64 ranges.
    pub fn sink_key(&self) -> u64 {
        self.id as u64
    }

    /// True iff the peer presented no client certificate.
    pub fn with_proxy(&self) -> bool {
        self.with_proxy
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    pub fn peer_identity(&self) -> Option<Identity> {
        self.peer_identity
    }

    pub fn add_circuit(&self, circuit: Circuit) {
        let mut circuits = self.circuits.lock().expect("circuit table lock poisoned");
        circuits.insert(circuit.id(), circuit);
    }

    /// Remove a circuit record; returns true when the connection's
    /// circuit set is now empty. Callers use this to decide whether to
    /// shut the connection down.
    pub fn remove_circuit(&self, id: u64) -> bool {
        let mut circuits = self.circuits.lock().expect("circuit table lock poisoned");
        circuits.remove(&id);
        circuits.is_empty()
    }

    /// True iff `id` rides on this connection.
    pub fn member(&self, id: u64) -> bool {
        self.circuits
            .lock()
            .expect("circuit table lock poisoned")
            .contains_key(&id)
    }

    /// Channel toward the exit worker for `id`, when this hop is the
    /// circuit's exit.
    pub fn exit_sender(&self, id: u64) -> Option<mpsc::Sender<Vec<u8>>> {
        self.circuits
            .lock()
            .expect("circuit table lock poisoned")
            .get(&id)
            .and_then(Circuit::exit_sender)
    }

    pub fn circuit_ids(&self) -> Vec<u64> {
        self.circuits
            .lock()
            .expect("circuit table lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits
            .lock()
            .expect("circuit table lock poisoned")
            .len()
    }

    /// Marks the connection as being torn down; returns true on the
    /// first call only, so teardown runs once.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.load(Ordering::Relaxed))
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("with_proxy", &self.with_proxy)
            .finish()
    }
}

#[async_trait]
impl CellWriter for Conn {
    async fn write_bytes(&self, buf: &[u8]) -> std::io::Result<()> {
        let deadline = self.write_timeout();
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(deadline, async {
            writer.write_all(buf).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline expired"))?
    }

    async fn close(&self) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }

    fn set_write_timeout(&self, timeout: Duration) {
        self.write_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }
}

/// Write half of an exit circuit's destination socket. Owned by the exit
/// worker, shared with the queue that flushes outbound messages.
pub struct DestWriter {
    writer: Mutex<OwnedWriteHalf>,
    write_timeout_ms: AtomicU64,
}

impl DestWriter {
    pub fn new(writer: OwnedWriteHalf, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(writer),
            write_timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        })
    }
}

#[async_trait]
impl CellWriter for DestWriter {
    async fn write_bytes(&self, buf: &[u8]) -> std::io::Result<()> {
        let deadline = Duration::from_millis(self.write_timeout_ms.load(Ordering::Relaxed));
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(deadline, writer.write_all(buf))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "write deadline expired")
            })?
    }

    async fn close(&self) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await
    }

    fn set_write_timeout(&self, timeout: Duration) {
        self.write_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }
}
