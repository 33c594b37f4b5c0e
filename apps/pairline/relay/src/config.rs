use std::{net::SocketAddr, time::Duration};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use pairline_relay::RelaySettings;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub settings: RelaySettings,
}

#[derive(Debug, Parser)]
#[command(
    name = "pairline-relay",
    author,
    version,
    about = "Pairline signaling relay"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(
        long,
        env = "PAIRLINE_RELAY_LISTEN_ADDR",
        default_value = "127.0.0.1:8080"
    )]
    listen_addr: String,

    /// Peers silent for longer than this are closed and unregistered.
    #[arg(long, env = "PAIRLINE_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 600)]
    idle_timeout_secs: u64,

    /// How often the idle sweep runs.
    #[arg(long, env = "PAIRLINE_RELAY_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    sweep_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PAIRLINE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    shutdown_grace_secs: u64,
}

impl TryFrom<Cli> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(cli.idle_timeout_secs > 0, "idle timeout must be positive");
        ensure!(cli.sweep_interval_secs > 0, "sweep interval must be positive");
        Ok(RelayConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            settings: RelaySettings {
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
                sweep_interval: Duration::from_secs(cli.sweep_interval_secs),
                ..RelaySettings::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn defaults_parse() {
        let cli = Cli::try_parse_from(["pairline-relay"]).unwrap();
        let config = RelayConfig::try_from(cli).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.settings.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.settings.sweep_interval, Duration::from_secs(60));
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_addr() {
        let cli = Cli::try_parse_from(["pairline-relay", "--listen-addr", "nowhere"]).unwrap();
        let err = RelayConfig::try_from(cli).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test_timeout::timeout]
    fn rejects_zero_sweep_interval() {
        let cli =
            Cli::try_parse_from(["pairline-relay", "--sweep-interval-secs", "0"]).unwrap();
        assert!(RelayConfig::try_from(cli).is_err());
    }
}
