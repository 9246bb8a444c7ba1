use clap::{Parser, Subcommand};
use meshlink_core::LinkConfig;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Output in JSON format
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Connection timeout in seconds
    #[arg(short = 't', long, global = true, default_value = "30")]
    pub timeout: u64,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// How often a connected radio's signal strength is polled (e.g. 10s)
    #[arg(long, global = true, default_value = "10s", value_parser = humantime::parse_duration)]
    pub signal_interval: Duration,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan for nearby Meshtastic radios
    Scan {
        /// How long to scan (e.g. 10s, 1m)
        #[arg(short = 's', long, default_value = "10s", value_parser = humantime::parse_duration)]
        duration: Duration,

        /// Forget radios not heard from for this long (e.g. 30s)
        #[arg(long, value_parser = humantime::parse_duration)]
        evict_after: Option<Duration>,
    },

    /// Connect to a radio and print everything it sends
    Listen {
        /// Radio name or identifier
        #[arg(short = 'b', long)]
        device: String,

        /// Stop after this long (runs until Ctrl-C otherwise)
        #[arg(short = 's', long, value_parser = humantime::parse_duration)]
        duration: Option<Duration>,
    },

    /// Send a text message through a radio
    Send {
        /// Radio name or identifier
        #[arg(short = 'b', long)]
        device: String,

        /// Message text to send
        #[arg(short = 'm', long)]
        text: String,

        /// Destination node ID (broadcast if not specified)
        #[arg(long)]
        dest: Option<u32>,

        /// Channel index
        #[arg(short = 'c', long, default_value = "0")]
        channel: u32,
    },
}

impl Cli {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Transport timings from the command line. The registry is swept at
    /// twice the eviction rate.
    pub fn link_config(&self) -> LinkConfig {
        let config = LinkConfig::default().with_signal_poll_interval(self.signal_interval);
        match self.command {
            Commands::Scan {
                evict_after: Some(evict_after),
                ..
            } => config.with_eviction(evict_after, evict_after / 2),
            _ => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_parse_listen() -> Result<()> {
        let cli = Cli::try_parse_from(["meshlink", "-j", "listen", "-b", "Radio-A", "-s", "2m"])?;
        assert!(cli.json);
        match cli.command {
            Commands::Listen { device, duration } => {
                assert_eq!(device, "Radio-A");
                assert_eq!(duration, Some(Duration::from_secs(120)));
            }
            other => anyhow::bail!("unexpected command {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_scan_defaults() -> Result<()> {
        let cli = Cli::try_parse_from(["meshlink", "scan"])?;
        assert_eq!(cli.timeout_duration(), Duration::from_secs(30));
        assert!(matches!(
            cli.command,
            Commands::Scan { duration, evict_after: None } if duration == Duration::from_secs(10)
        ));
        assert_eq!(cli.link_config(), LinkConfig::default());
        Ok(())
    }

    #[test]
    fn test_link_config_from_flags() -> Result<()> {
        let cli = Cli::try_parse_from([
            "meshlink",
            "scan",
            "--evict-after",
            "1m",
            "--signal-interval",
            "3s",
        ])?;
        let config = cli.link_config();
        assert_eq!(config.signal_poll_interval, Duration::from_secs(3));
        assert_eq!(config.eviction_after, Duration::from_secs(60));
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));

        // Eviction only applies to scans
        let cli = Cli::try_parse_from(["meshlink", "listen", "-b", "Radio-A", "--evict-after", "1m"]);
        assert!(cli.is_err());
        Ok(())
    }
}
