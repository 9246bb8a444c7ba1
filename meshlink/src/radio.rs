//! Meshtastic protobuf framing for the bytes the transport carries

use meshtastic::Message;
use meshtastic::protobufs;
use meshlink_core::LogFormatter;
use serde::Serialize;
use std::sync::Arc;

pub const BROADCAST_ADDR: u32 = 0xffff_ffff;

/// Ask the radio to stream its node database and configuration
pub fn want_config(config_id: u32) -> Vec<u8> {
    protobufs::ToRadio {
        payload_variant: Some(protobufs::to_radio::PayloadVariant::WantConfigId(config_id)),
        ..Default::default()
    }
    .encode_to_vec()
}

/// A text message packet; the radio assigns the packet id
pub fn text_message(text: &str, channel: u32, destination: Option<u32>) -> Vec<u8> {
    let mesh_packet = protobufs::MeshPacket {
        payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(
            protobufs::Data {
                portnum: protobufs::PortNum::TextMessageApp as i32,
                payload: text.as_bytes().to_vec(),
                ..Default::default()
            },
        )),
        to: destination.unwrap_or(BROADCAST_ADDR),
        channel,
        want_ack: destination.is_some(),
        ..Default::default()
    };

    protobufs::ToRadio {
        payload_variant: Some(protobufs::to_radio::PayloadVariant::Packet(mesh_packet)),
        ..Default::default()
    }
    .encode_to_vec()
}

fn level_name(level: i32) -> &'static str {
    match level {
        50 => "CRIT",
        40 => "ERROR",
        30 => "WARN",
        20 => "INFO",
        10 => "DEBUG",
        5 => "TRACE",
        _ => "LOG",
    }
}

/// Renders LOGRADIO payloads, which carry `LogRecord` protobufs
pub fn log_record_formatter() -> LogFormatter {
    let fallback = meshlink_core::connection::utf8_log_formatter();
    Arc::new(move |bytes: &[u8]| match protobufs::LogRecord::decode(bytes) {
        Ok(record) if !record.message.is_empty() => {
            let message = record.message.trim_end();
            Some(if record.source.is_empty() {
                format!("{} | {}", level_name(record.level), message)
            } else {
                format!("{} | [{}] {}", level_name(record.level), record.source, message)
            })
        }
        _ => fallback(bytes),
    })
}

/// What a FROMRADIO frame contained, for display
#[derive(Debug, Clone, Serialize)]
pub struct FrameSummary {
    pub kind: &'static str,
    pub detail: String,
}

fn describe_packet(packet: &protobufs::MeshPacket) -> FrameSummary {
    let route = format!("{:08x} -> {:08x} ch{}", packet.from, packet.to, packet.channel);
    let detail = match &packet.payload_variant {
        Some(protobufs::mesh_packet::PayloadVariant::Decoded(data))
            if data.portnum == protobufs::PortNum::TextMessageApp as i32 =>
        {
            format!("{route}: {}", String::from_utf8_lossy(&data.payload))
        }
        Some(protobufs::mesh_packet::PayloadVariant::Decoded(data)) => {
            format!("{route}: port {} ({} bytes)", data.portnum, data.payload.len())
        }
        Some(protobufs::mesh_packet::PayloadVariant::Encrypted(bytes)) => {
            format!("{route}: encrypted ({} bytes)", bytes.len())
        }
        None => route,
    };
    FrameSummary {
        kind: "packet",
        detail,
    }
}

/// Decode a FROMRADIO frame. Undecodable frames are shown as hex.
pub fn describe(frame: &[u8]) -> FrameSummary {
    use protobufs::from_radio::PayloadVariant;

    let decoded = match protobufs::FromRadio::decode(frame) {
        Ok(decoded) => decoded,
        Err(_) => {
            return FrameSummary {
                kind: "raw",
                detail: hex::encode(frame),
            };
        }
    };

    match decoded.payload_variant {
        Some(PayloadVariant::Packet(packet)) => describe_packet(&packet),
        Some(PayloadVariant::MyInfo(info)) => FrameSummary {
            kind: "my_info",
            detail: format!("node {:08x}", info.my_node_num),
        },
        Some(PayloadVariant::NodeInfo(node)) => FrameSummary {
            kind: "node_info",
            detail: match node.user {
                Some(user) => format!("{:08x} {} ({})", node.num, user.long_name, user.short_name),
                None => format!("{:08x}", node.num),
            },
        },
        Some(PayloadVariant::Channel(channel)) => FrameSummary {
            kind: "channel",
            detail: format!(
                "index {} {}",
                channel.index,
                channel.settings.map(|s| s.name).unwrap_or_default()
            ),
        },
        Some(PayloadVariant::LogRecord(record)) => FrameSummary {
            kind: "log",
            detail: record.message,
        },
        Some(PayloadVariant::ConfigCompleteId(id)) => FrameSummary {
            kind: "config_complete",
            detail: id.to_string(),
        },
        Some(_) => FrameSummary {
            kind: "other",
            detail: format!("{} bytes", frame.len()),
        },
        None => FrameSummary {
            kind: "empty",
            detail: String::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    #[test]
    fn test_want_config_round_trips() -> Result<()> {
        let decoded = protobufs::ToRadio::decode(want_config(42).as_slice())?;
        assert_eq!(
            decoded.payload_variant,
            Some(protobufs::to_radio::PayloadVariant::WantConfigId(42))
        );
        Ok(())
    }

    #[test]
    fn test_text_message_defaults_to_broadcast() -> Result<()> {
        let decoded = protobufs::ToRadio::decode(text_message("hi", 2, None).as_slice())?;
        let Some(protobufs::to_radio::PayloadVariant::Packet(packet)) = decoded.payload_variant
        else {
            anyhow::bail!("expected a packet");
        };
        assert_eq!(packet.to, BROADCAST_ADDR);
        assert_eq!(packet.channel, 2);
        assert!(!packet.want_ack);
        Ok(())
    }

    #[test]
    fn test_describe_text_packet() -> Result<()> {
        let frame = protobufs::FromRadio {
            payload_variant: Some(protobufs::from_radio::PayloadVariant::Packet(
                protobufs::MeshPacket {
                    from: 0x1234_5678,
                    to: BROADCAST_ADDR,
                    payload_variant: Some(protobufs::mesh_packet::PayloadVariant::Decoded(
                        protobufs::Data {
                            portnum: protobufs::PortNum::TextMessageApp as i32,
                            payload: b"hello mesh".to_vec(),
                            ..Default::default()
                        },
                    )),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }
        .encode_to_vec();

        let summary = describe(&frame);
        assert_eq!(summary.kind, "packet");
        assert!(summary.detail.ends_with("hello mesh"));
        assert!(summary.detail.contains("12345678"));
        Ok(())
    }

    #[test]
    fn test_log_record_formatter() -> Result<()> {
        let format = log_record_formatter();
        let record = protobufs::LogRecord {
            message: "Booted\n".into(),
            source: "Power".into(),
            level: 20,
            ..Default::default()
        }
        .encode_to_vec();
        let line = format(&record).context("no line")?;
        assert_eq!(line, "INFO | [Power] Booted");
        Ok(())
    }
}
