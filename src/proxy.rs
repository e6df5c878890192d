//! # Proxy Client
//!
//! Client half of the mixnet: builds circuits through an entry router and
//! exchanges whole messages with the final destination. The proxy
//! deliberately presents no TLS client certificate; that absence is how
//! the entry router recognizes it as a proxy rather than a peer.
//!
//! The proxy applies the same onion layer and cell framing the exit hop
//! speaks: messages are sealed to the exit's onion key, fragmented into
//! cells, and replies are reassembled and opened here.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::rngs::OsRng;
use rand::RngCore;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::cell::{self, Cell, CellType, Directive, CELL_BYTES};
use crate::circuit::{fragment, generate_ephemeral, Assembler, OnionContext, MAX_MSG_BYTES, SEAL_OVERHEAD};
use crate::crypto;
use crate::registry::MIN_CIRCUIT_ID;

/// Client-side context shared by the circuits of one proxy.
pub struct ProxyContext {
    connector: TlsConnector,
    timeout: Duration,
}

impl ProxyContext {
    pub fn new(timeout: Duration) -> Self {
        let config = crypto::create_proxy_client_config();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
            timeout,
        }
    }

    /// Build a circuit along `path` (entry first, exit last; empty
    /// strings mark hops for the entry router to fill) terminating at
    /// `dest`, which is sealed to the exit router's onion key.
    ///
    /// Blocks until the exit's CREATED travels back, or an ERROR
    /// directive arrives.
    pub async fn create_circuit(
        &self,
        path: &[String],
        dest: &str,
        exit_onion_key: &[u8; 32],
    ) -> anyhow::Result<ProxyCircuit> {
        let entry = path.first().context("path needs at least one router")?;
        anyhow::ensure!(!entry.is_empty(), "entry hop must be specified");

        let tcp = tokio::time::timeout(self.timeout, TcpStream::connect(entry))
            .await
            .context("dial to entry timed out")?
            .with_context(|| format!("dial to entry {entry} failed"))?;
        let host = entry.rsplit_once(':').map(|(h, _)| h).unwrap_or(entry);
        let server_name =
            ServerName::try_from(host.to_string()).context("entry address is not a valid name")?;
        let stream = tokio::time::timeout(self.timeout, self.connector.connect(server_name, tcp))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")?;

        let local_tag = stream.get_ref().0.local_addr()?.to_string();

        let (ephemeral_secret, ephemeral_public) = generate_ephemeral();
        let onion = OnionContext::proxy(&ephemeral_secret, exit_onion_key);
        let sealed_dest = onion.seal(dest.as_bytes());

        // The proxy allocates the ID on its own link; the circuit-id
        // range keeps it clear of connection IDs.
        let id = loop {
            let candidate = OsRng.next_u64();
            if candidate >= MIN_CIRCUIT_ID {
                break candidate;
            }
        };

        let mut addrs = Vec::with_capacity(path.len() + 1);
        addrs.push(local_tag);
        addrs.extend(path.iter().cloned());

        let create = Directive::Create {
            addrs,
            key: ephemeral_public.to_vec(),
            sealed_dest,
        };

        let mut circuit = ProxyCircuit {
            stream,
            id,
            onion,
            assembler: Assembler::new(),
            timeout: self.timeout,
        };
        let create_cell = cell::encode_dir(id, &create)?;
        circuit.write_cell(&create_cell).await?;

        match circuit.read_directive().await? {
            Directive::Created => {
                debug!(id, "circuit established");
                Ok(circuit)
            }
            Directive::Error { reason } => anyhow::bail!("circuit creation failed: {reason}"),
            other => anyhow::bail!("unexpected directive during creation: {other:?}"),
        }
    }
}

/// One established circuit from this proxy through the mixnet.
#[derive(Debug)]
pub struct ProxyCircuit {
    stream: tokio_rustls::client::TlsStream<TcpStream>,
    id: u64,
    onion: OnionContext,
    assembler: Assembler,
    timeout: Duration,
}

impl ProxyCircuit {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Seal a message to the exit and send it, fragmented into cells.
    pub async fn send_message(&mut self, msg: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(
            msg.len() + SEAL_OVERHEAD <= MAX_MSG_BYTES,
            "message exceeds maximum size"
        );
        let sealed = self.onion.seal(msg);
        for body in fragment(&sealed) {
            let fragment_cell = cell::encode_msg(self.id, &body)?;
            self.write_cell(&fragment_cell).await?;
        }
        Ok(())
    }

    /// Reassemble and open the destination's next reply. An ERROR
    /// directive arriving instead surfaces as an error.
    pub async fn recv_message(&mut self) -> anyhow::Result<Vec<u8>> {
        loop {
            let buf = self.read_cell().await?;
            let (_, kind, body) = cell::decode(&buf)?;
            match kind {
                CellType::Msg => {
                    if let Some(sealed) = self.assembler.feed(body)? {
                        return Ok(self.onion.open(&sealed)?);
                    }
                }
                CellType::Dir => match cell::decode_directive(body)? {
                    Directive::Error { reason } => anyhow::bail!("relay error: {reason}"),
                    other => anyhow::bail!("unexpected directive: {other:?}"),
                },
            }
        }
    }

    /// Tear the circuit down and wait for the exit's DESTROYED to travel
    /// back.
    pub async fn destroy(&mut self) -> anyhow::Result<()> {
        let destroy_cell = cell::encode_dir(self.id, &Directive::Destroy)?;
        self.write_cell(&destroy_cell).await?;
        match self.read_directive().await? {
            Directive::Destroyed => Ok(()),
            Directive::Error { reason } => anyhow::bail!("destroy failed: {reason}"),
            other => anyhow::bail!("unexpected directive during destroy: {other:?}"),
        }
    }

    /// Read cells until a directive arrives, discarding message traffic.
    pub async fn read_directive(&mut self) -> anyhow::Result<Directive> {
        loop {
            let buf = self.read_cell().await?;
            let (_, kind, body) = cell::decode(&buf)?;
            if kind == CellType::Dir {
                return Ok(cell::decode_directive(body)?);
            }
        }
    }

    async fn write_cell(&mut self, cell_bytes: &Cell) -> anyhow::Result<()> {
        tokio::time::timeout(self.timeout, async {
            self.stream.write_all(cell_bytes).await?;
            self.stream.flush().await
        })
        .await
        .context("write timed out")??;
        Ok(())
    }

    async fn read_cell(&mut self) -> anyhow::Result<Cell> {
        let mut buf = vec![0u8; CELL_BYTES];
        tokio::time::timeout(self.timeout, self.stream.read_exact(&mut buf))
            .await
            .context("read timed out")?
            .context("read failed")?;
        Ok(buf)
    }
}
