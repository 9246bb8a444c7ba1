mod listen;
mod scan;
mod send;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use meshlink_core::{
    Connection, ConnectionEvents, Device, DiscoveryEvent, EventStream, RadioCentral,
    TransportError, TransportManager,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::output::OutputFormat;
use crate::radio;
use crate::utils::print_info;

pub const FORGET_DEVICE_HINT: &str =
    "The radio rejected the pairing. Forget it in your system Bluetooth settings and try again.";

pub async fn handle_command(cli: Cli) -> Result<()> {
    // Determine output format
    let output_format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };
    let timeout = cli.timeout_duration();

    let manager = TransportManager::with_log_formatter(
        open_central()?,
        cli.link_config(),
        radio::log_record_formatter(),
    );

    match cli.command {
        Commands::Scan { duration, .. } => scan::handle_scan(&manager, duration, output_format).await,
        Commands::Listen { device, duration } => {
            listen::handle_listen(&manager, &device, timeout, duration, output_format).await
        }
        Commands::Send {
            device,
            text,
            dest,
            channel,
        } => {
            send::handle_send(&manager, &device, &text, channel, dest, timeout, output_format)
                .await
        }
    }
}

/// Follows a failed command's error with advice the user can act on
pub fn print_hint(err: &anyhow::Error) {
    if needs_pairing(err) {
        print_info(FORGET_DEVICE_HINT);
    }
}

fn needs_pairing(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TransportError>()
        .is_some_and(TransportError::is_security)
}

#[cfg(feature = "bluetooth")]
fn open_central() -> Result<Arc<dyn RadioCentral>> {
    Ok(Arc::new(meshlink_core::bluetooth::BtleplugCentral::new()))
}

#[cfg(not(feature = "bluetooth"))]
fn open_central() -> Result<Arc<dyn RadioCentral>> {
    anyhow::bail!("meshlink was built without Bluetooth support, rebuild with --features bluetooth")
}

pub fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Scan until a device whose name or identifier matches `needle` shows up.
///
/// The discovery stream is returned with the device: dropping it clears the
/// registry, which a connect needs.
async fn find_device(
    manager: &TransportManager,
    needle: &str,
    timeout: Duration,
) -> Result<(EventStream<DiscoveryEvent>, Device)> {
    let spinner = spinner(&format!("Looking for {needle}..."));
    let mut discovery = manager
        .discover_devices()
        .await
        .context("Failed to start discovery")?;

    let search = async {
        while let Some(event) = discovery.next().await {
            match event {
                DiscoveryEvent::Found(device) if device.matches(needle) => return Some(device),
                DiscoveryEvent::Found(device) => {
                    debug!(device = %device.id, name = %device.name, "Skipping non-matching radio");
                }
                _ => {}
            }
        }
        None
    };
    let found = tokio::time::timeout(timeout, search).await;
    spinner.finish_and_clear();

    match found {
        Ok(Some(device)) => Ok((discovery, device)),
        Ok(None) => anyhow::bail!("Discovery ended before {needle} was found"),
        Err(_) => anyhow::bail!("No radio matching '{needle}' found within {timeout:?}"),
    }
}

/// Find, connect and resolve a radio's endpoints within `timeout`
async fn open_session(
    manager: &TransportManager,
    needle: &str,
    timeout: Duration,
) -> Result<(Connection, ConnectionEvents)> {
    let (_discovery, device) = find_device(manager, needle, timeout).await?;

    let spinner = spinner(&format!("Connecting to {}...", device.name));
    let session = tokio::time::timeout(timeout, async {
        let connection = manager.connect(&device).await?;
        let events = connection.connect().await?;
        Ok::<_, meshlink_core::TransportError>((connection, events))
    })
    .await;
    spinner.finish_and_clear();

    session
        .with_context(|| format!("Timed out connecting to {}", device.name))?
        .with_context(|| format!("Failed to connect to {}", device.name))
}
