//! BLE Bridge host process
//!
//! Runs the bridge core against the simulated radio and speaks line-delimited
//! JSON on stdin/stdout. Logs go to stderr so they never mix with protocol
//! output.
//!
//! Settings are read from `$BLE_BRIDGE_SETTINGS` if set, otherwise from
//! `settings.json` in the platform config directory. Pass
//! `--write-default-settings` to create that file with the defaults.

mod settings;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ble_mux::{BleBridge, BridgeHandle};
use ble_sim::VirtualRadio;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use settings::Settings;

/// How long pending output may take to flush after shutdown
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Include all our crates in the default filter
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "ble_bridge=info,ble_mux=info,ble_protocol=info,ble_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if std::env::args().any(|arg| arg == "--write-default-settings") {
        let path = Settings::default()
            .save()
            .context("failed to write default settings")?;
        tracing::info!("Wrote default settings to {}", path.display());
        return Ok(());
    }

    tracing::info!("Starting BLE bridge");
    let settings = Settings::load();

    let radio = VirtualRadio::with_peripherals(settings.peripherals)
        .context("invalid simulated peripherals in settings")?;
    let (bridge, streams) =
        BleBridge::new(Arc::new(radio), settings.bridge).context("invalid bridge settings")?;
    let (handle, actor) = BridgeHandle::spawn(bridge);

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let events = tokio::spawn(transport::forward_events(streams, out_tx.clone()));
    let writer = tokio::spawn(transport::write_messages(tokio::io::stdout(), out_rx));

    let served = transport::serve(tokio::io::stdin(), handle.clone(), out_tx).await;
    if let Err(e) = &served {
        tracing::error!("Transport failed: {}", e);
    }

    // Input closed: disconnect everything, then flush what is left
    if handle.shutdown().await.is_ok() {
        actor.await.context("bridge actor panicked")?;
    }
    events.abort();
    match tokio::time::timeout(FLUSH_TIMEOUT, writer).await {
        Ok(joined) => joined.context("output writer panicked")??,
        Err(_) => tracing::warn!("Timed out flushing output"),
    }

    tracing::info!("BLE bridge stopped");
    served.map_err(Into::into)
}
