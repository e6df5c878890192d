//! # Directory Protocol
//!
//! Thin client for the external directory service. Two one-shot RPCs run
//! over the same authenticated transport as peer links: register this
//! router's address and onion public key, and fetch the current peer
//! list. Neither is on the steady-state forwarding path.
//!
//! Frames are a u32 big-endian length followed by a bincode payload,
//! bounded on deserialization.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame payload. Directory listings are small; anything
/// larger is a protocol violation.
const MAX_FRAME_SIZE: usize = 256 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DirectoryRequest {
    /// Announce this router's address and 32-byte onion public key.
    Register { addr: String, key: [u8; 32] },
    /// Fetch the ordered list of registered router addresses.
    List,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DirectoryResponse {
    Registered,
    Routers { addrs: Vec<String> },
    Error { message: String },
}

pub async fn write_frame<T, W>(stream: &mut W, value: &T) -> anyhow::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let payload = bincode_options().serialize(value)?;
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<T, R>(stream: &mut R) -> anyhow::Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("directory frame of {len} bytes exceeds limit");
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(bincode_options().deserialize(&payload)?)
}

/// Register `(addr, key)` with the directory over an established stream.
pub async fn register<S>(stream: &mut S, addr: &str, key: [u8; 32]) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(
        stream,
        &DirectoryRequest::Register {
            addr: addr.to_string(),
            key,
        },
    )
    .await?;
    match read_frame::<DirectoryResponse, _>(stream).await? {
        DirectoryResponse::Registered => Ok(()),
        DirectoryResponse::Error { message } => {
            anyhow::bail!("directory rejected registration: {message}")
        }
        other => anyhow::bail!("unexpected directory response {other:?}"),
    }
}

/// Fetch the router list over an established stream.
pub async fn fetch<S>(stream: &mut S) -> anyhow::Result<Vec<String>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &DirectoryRequest::List).await?;
    match read_frame::<DirectoryResponse, _>(stream).await? {
        DirectoryResponse::Routers { addrs } => Ok(addrs),
        DirectoryResponse::Error { message } => {
            anyhow::bail!("directory list failed: {message}")
        }
        other => anyhow::bail!("unexpected directory response {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let request = DirectoryRequest::Register {
            addr: "127.0.0.1:9000".into(),
            key: [3u8; 32],
        };
        write_frame(&mut client, &request).await.unwrap();

        let got: DirectoryRequest = read_frame(&mut server).await.unwrap();
        match got {
            DirectoryRequest::Register { addr, key } => {
                assert_eq!(addr, "127.0.0.1:9000");
                assert_eq!(key, [3u8; 32]);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_against_scripted_server() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let request: DirectoryRequest = read_frame(&mut server).await.unwrap();
            assert!(matches!(request, DirectoryRequest::Register { .. }));
            write_frame(&mut server, &DirectoryResponse::Registered)
                .await
                .unwrap();
        });

        register(&mut client, "127.0.0.1:9000", [9u8; 32])
            .await
            .unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_returns_router_list() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let server_task = tokio::spawn(async move {
            let request: DirectoryRequest = read_frame(&mut server).await.unwrap();
            assert!(matches!(request, DirectoryRequest::List));
            write_frame(
                &mut server,
                &DirectoryResponse::Routers {
                    addrs: vec!["127.0.0.1:9001".into(), "127.0.0.1:9002".into()],
                },
            )
            .await
            .unwrap();
        });

        let addrs = fetch(&mut client).await.unwrap();
        assert_eq!(addrs.len(), 2);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::spawn(async move {
            let huge = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
            let _ = client.write_all(&huge).await;
        });

        let result: anyhow::Result<DirectoryResponse> = read_frame(&mut server).await;
        assert!(result.is_err());
    }
}
