use anyhow::{Context, Result};
use comfy_table::Cell;
use meshlink_core::{DiscoveryEvent, TransportManager};
use std::time::Duration;

use super::spinner;
use crate::output::{OutputFormat, create_table, print_output};
use crate::utils::{format_rssi, print_info, print_success};

pub async fn handle_scan(
    manager: &TransportManager,
    duration: Duration,
    format: OutputFormat,
) -> Result<()> {
    let progress = spinner("Scanning for mesh radios...");
    let mut discovery = manager
        .discover_devices()
        .await
        .context("Failed to start discovery")?;

    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);

    let mut found = 0usize;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = discovery.next() => match event {
                Some(DiscoveryEvent::Found(device)) => {
                    found += 1;
                    progress.set_message(format!(
                        "Scanning for mesh radios... found {found} (latest: {name})",
                        name = device.name
                    ));
                }
                Some(DiscoveryEvent::Lost(id)) => {
                    progress.set_message(format!("Lost {id}"));
                }
                Some(DiscoveryEvent::SignalUpdated(..)) => {}
                None => break,
            },
        }
    }
    progress.finish_and_clear();

    let devices = manager.devices().await?;
    drop(discovery);

    if devices.is_empty() {
        print_info("No radios found");
        return Ok(());
    }

    match format {
        OutputFormat::Json => print_output(&devices, format),
        OutputFormat::Table => {
            print_success(&format!("Found {count} radio(s)", count = devices.len()));
            let mut table = create_table();
            table.set_header(vec!["Name", "Identifier", "RSSI", "First Seen"]);
            for device in &devices {
                table.add_row(vec![
                    Cell::new(&device.name),
                    Cell::new(device.id.as_str()),
                    Cell::new(format_rssi(device.rssi)),
                    Cell::new(device.discovered_at.format("%H:%M:%S").to_string()),
                ]);
            }
            println!("{table}");
        }
    }

    Ok(())
}
