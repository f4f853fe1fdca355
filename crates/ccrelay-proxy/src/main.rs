//! `ccrelay-proxy` binary entrypoint.
//!
//! Runs the proxy in the foreground until interrupted or terminated. The
//! `ccrelay` launcher is the usual way in; this binary is handy for running
//! the proxy on its own.

use anyhow::Context;
use ccrelay_proxy::StopSignals;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respect `RUST_LOG` if set; otherwise default to proxy-friendly info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config = ccrelay_config::load_config(None)?;
    ccrelay_config::apply_env_overrides(&mut config)?;
    let mut signals = StopSignals::install().context("failed to install signal handlers")?;

    let launch = ccrelay_proxy::start_or_reuse(&config, &ccrelay_config::state_dir())
        .await
        .context("failed to start proxy")?;

    if launch.is_reused() {
        println!("proxy already running at {}", launch.url());
        launch.shutdown().await;
        return Ok(());
    }

    println!("proxy listening at {}", launch.url());
    let signal = signals.recv().await;
    tracing::info!(signal = signal.name(), "shutting down");
    launch.shutdown().await;
    Ok(())
}
