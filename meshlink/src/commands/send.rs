use anyhow::{Context, Result};
use meshlink_core::TransportManager;
use serde::Serialize;
use std::time::Duration;

use super::open_session;
use crate::output::{OutputFormat, print_output};
use crate::radio;
use crate::utils::print_success;

#[derive(Debug, Serialize)]
struct SentMessage {
    pub text: String,
    pub device: String,
    pub destination: String,
    pub channel: u32,
}

pub async fn handle_send(
    manager: &TransportManager,
    device: &str,
    text: &str,
    channel: u32,
    dest: Option<u32>,
    timeout: Duration,
    format: OutputFormat,
) -> Result<()> {
    let (connection, _events) = open_session(manager, device, timeout).await?;

    let sent = tokio::time::timeout(
        timeout,
        connection.send(radio::text_message(text, channel, dest)),
    )
    .await
    .context("Timed out waiting for the radio to accept the message")?;
    let result = sent.context("Failed to send message");

    connection.disconnect(None, false).await?;
    result?;

    let sent_msg = SentMessage {
        text: text.to_string(),
        device: connection.device().name.clone(),
        destination: dest
            .map(|d| format!("{d:08x}"))
            .unwrap_or_else(|| "Broadcast".to_string()),
        channel,
    };

    match format {
        OutputFormat::Json => print_output(&sent_msg, format),
        OutputFormat::Table => {
            print_success(&format!(
                "Message sent to {destination} on channel {channel} via {device}",
                destination = sent_msg.destination,
                device = sent_msg.device
            ));
        }
    }

    Ok(())
}
