// p2pstream: LAN chat and call signaling node with a line console.

mod console;

use std::path::PathBuf;

use anyhow::Context;
use p2pstream_node::{config, Node};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("p2pstream {VERSION}");
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    let cfg = config::load(config_path.as_deref())?;
    init_tracing(&cfg.log_level);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let node = Node::start(cfg).await.context("start node")?;
        tokio::select! {
            r = console::run(node.clone()) => r?,
            r = shutdown_signal() => r?,
        }
        node.shutdown();
        Ok::<(), anyhow::Error>(())
    })
}

/// Logs go to stderr so they don't interleave with console output. RUST_LOG wins over the
/// configured level.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
