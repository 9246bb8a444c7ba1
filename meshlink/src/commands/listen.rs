use anyhow::{Context, Result};
use chrono::Utc;
use colored::*;
use meshlink_core::{ConnectionEvent, TransportManager};
use serde::Serialize;
use std::time::Duration;

use super::open_session;
use crate::output::{OutputFormat, print_json_line};
use crate::radio;
use crate::utils::{format_rssi, print_error, print_info, print_success, print_warning};

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventRecord {
    Data {
        time: String,
        kind: &'static str,
        detail: String,
        raw: String,
    },
    Log {
        time: String,
        line: String,
    },
    Signal {
        time: String,
        rssi: i16,
    },
    Disconnected {
        time: String,
        should_reconnect: bool,
        error: Option<String>,
    },
}

impl EventRecord {
    fn from_event(event: &ConnectionEvent) -> Self {
        let time = Utc::now().to_rfc3339();
        match event {
            ConnectionEvent::Data(frame) => {
                let summary = radio::describe(frame);
                EventRecord::Data {
                    time,
                    kind: summary.kind,
                    detail: summary.detail,
                    raw: hex::encode(frame),
                }
            }
            ConnectionEvent::LogLine(line) => EventRecord::Log {
                time,
                line: line.clone(),
            },
            ConnectionEvent::SignalUpdated(rssi) => EventRecord::Signal { time, rssi: *rssi },
            ConnectionEvent::Disconnected { should_reconnect } => EventRecord::Disconnected {
                time,
                should_reconnect: *should_reconnect,
                error: None,
            },
            ConnectionEvent::Error {
                should_reconnect,
                cause,
            } => EventRecord::Disconnected {
                time,
                should_reconnect: *should_reconnect,
                error: Some(cause.to_string()),
            },
        }
    }
}

fn print_event(event: &ConnectionEvent, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json_line(&EventRecord::from_event(event));
        return;
    }

    let time = Utc::now().format("%H:%M:%S").to_string().dimmed();
    match event {
        ConnectionEvent::Data(frame) => {
            let summary = radio::describe(frame);
            println!(
                "{time} {kind} {detail}",
                kind = format!("[{}]", summary.kind).cyan(),
                detail = summary.detail
            );
        }
        ConnectionEvent::LogLine(line) => {
            println!("{time} {tag} {line}", tag = "[radio]".magenta());
        }
        ConnectionEvent::SignalUpdated(rssi) => {
            println!("{time} {tag} {rssi}", tag = "[rssi]".blue(), rssi = format_rssi(*rssi));
        }
        ConnectionEvent::Disconnected { should_reconnect } => {
            print_info(&format!("Disconnected (reconnect: {should_reconnect})"));
        }
        ConnectionEvent::Error {
            should_reconnect: true,
            cause,
        } => print_warning(&format!("Link lost: {cause}. The radio may come back in range.")),
        ConnectionEvent::Error { cause, .. } => {
            print_error(&format!("Connection failed: {cause}"));
            if cause.is_security() {
                print_info(super::FORGET_DEVICE_HINT);
            }
        }
    }
}

pub async fn handle_listen(
    manager: &TransportManager,
    device: &str,
    timeout: Duration,
    duration: Option<Duration>,
    format: OutputFormat,
) -> Result<()> {
    let (connection, mut events) = open_session(manager, device, timeout).await?;
    if format == OutputFormat::Table {
        print_success(&format!("Connected to {name}", name = connection.device().name));
    }

    let config_id = Utc::now().timestamp() as u32;
    connection
        .send(radio::want_config(config_id))
        .await
        .context("Failed to request radio configuration")?;

    let listen = async {
        while let Some(event) = events.next().await {
            print_event(&event, format);
            if event.is_terminal() {
                return true;
            }
        }
        false
    };
    let stop = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };

    let ended_by_radio = tokio::select! {
        ended = listen => ended,
        _ = stop => false,
    };

    if !ended_by_radio {
        connection.disconnect(None, false).await?;
        if format == OutputFormat::Json {
            print_json_line(&EventRecord::Disconnected {
                time: Utc::now().to_rfc3339(),
                should_reconnect: false,
                error: None,
            });
        } else {
            print_info("Disconnected");
        }
    }

    Ok(())
}
