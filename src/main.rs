use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use mixnet::{RouterConfig, RouterContext, RouterError};

#[derive(Parser, Debug)]
#[command(name = "mixnet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local bind address; 127.0.0.1:0 picks an ephemeral loopback port.
    #[arg(short, long, default_value = "127.0.0.1:0")]
    addr: String,

    /// Transport family.
    #[arg(long, default_value = "tcp")]
    network: String,

    /// Policy domain configuration path (consumed by the guard).
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Queue flush threshold in cells.
    #[arg(short, long, default_value = "1")]
    batch_size: usize,

    /// I/O and dial deadline in seconds.
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    /// Subject name for the self-signed certificate.
    #[arg(long, default_value = "mixnet-router")]
    x509_identity: String,

    /// Directory server to register with and fetch peers from.
    #[arg(short, long)]
    dir_addr: Option<String>,

    /// Honor client-specified intermediate hops (testing only).
    #[arg(long)]
    allow_client_path_hints: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = RouterConfig {
        path: args.path,
        network: args.network,
        addr: args.addr,
        batch_size: args.batch_size,
        timeout: Duration::from_secs(args.timeout),
        x509_identity: args.x509_identity,
        allow_client_path_hints: args.allow_client_path_hints,
    };
    let router = RouterContext::new(config).await?;

    if let Some(dir_addr) = &args.dir_addr {
        match router.register(dir_addr).await {
            Ok(()) => info!(dir = %dir_addr, "registered with directory"),
            Err(e) => warn!(dir = %dir_addr, error = %e, "directory registration failed"),
        }
        match router.refresh_directory(dir_addr).await {
            Ok(()) => info!("directory refreshed"),
            Err(e) => warn!(error = %e, "directory refresh failed"),
        }
    }

    let mut errs = router
        .take_errors()
        .expect("error receiver taken once at startup");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal, exiting gracefully");
                break;
            }
            err = errs.recv() => match err {
                Some(e) if e.is_fatal() => {
                    error!(error = %e, "fatal router error");
                    router.close().await;
                    anyhow::bail!("fatal router error: {e}");
                }
                Some(RouterError::PeerClosed) | None => {}
                Some(e) => warn!(error = %e, "router error"),
            }
        }
    }

    router.close().await;
    Ok(())
}
