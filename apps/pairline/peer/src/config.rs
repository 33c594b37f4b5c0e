use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use pairline_peer::engine::RtcConfig;
use pairline_peer::messenger::{CommandTokens, DEFAULT_QUIT_TOKEN};
use pairline_peer::relay_link::validate_url;
use pairline_peer::session::{Role, SessionConfig, DEFAULT_CHANNEL_LABEL};
use url::Url;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub role: Role,
    pub relay_url: Url,
    pub rtc: RtcConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "pairline-peer",
    author,
    version,
    about = "Pairline peer: opens a direct data channel through the relay"
)]
pub struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Discover a registered worker and offer it a session.
    Client(PeerArgs),
    /// Register and wait for a client's offer.
    Worker(PeerArgs),
}

#[derive(Debug, Args)]
struct PeerArgs {
    /// Identifier to register under. Defaults to `client1` or `worker1`.
    #[arg(long, env = "PAIRLINE_PEER_ID")]
    peer_id: Option<String>,

    #[arg(long, env = "PAIRLINE_RELAY_URL", default_value = "ws://127.0.0.1:8080")]
    relay_url: String,

    /// STUN/TURN server url; repeat for several.
    #[arg(long = "stun")]
    stun: Vec<String>,

    /// Skip STUN and gather host candidates only.
    #[arg(long)]
    localhost_only: bool,

    #[arg(long, env = "PAIRLINE_ANSWER_TIMEOUT_SECS", default_value_t = 30)]
    answer_timeout_secs: u64,

    #[arg(long, env = "PAIRLINE_QUERY_TIMEOUT_SECS", default_value_t = 10)]
    query_timeout_secs: u64,

    #[arg(long, default_value = DEFAULT_CHANNEL_LABEL)]
    channel_label: String,

    /// Payload that ends the session when sent or received.
    #[arg(long, default_value = DEFAULT_QUIT_TOKEN)]
    quit_token: String,

    /// Payload that runs the program of the same name; repeat for several.
    /// Replaces the default set when given.
    #[arg(long = "command")]
    commands: Vec<String>,
}

impl TryFrom<Cli> for PeerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let (role, args) = match cli.mode {
            Mode::Client(args) => (Role::Initiator, args),
            Mode::Worker(args) => (Role::Responder, args),
        };
        let relay_url = validate_url(&args.relay_url)
            .with_context(|| format!("invalid relay url: {}", args.relay_url))?;
        ensure!(args.answer_timeout_secs > 0, "answer timeout must be positive");
        ensure!(args.query_timeout_secs > 0, "query timeout must be positive");
        ensure!(!args.channel_label.is_empty(), "channel label must not be empty");
        ensure!(!args.quit_token.trim().is_empty(), "quit token must not be blank");

        let peer_id = args.peer_id.unwrap_or_else(|| match role {
            Role::Initiator => "client1".to_string(),
            Role::Responder => "worker1".to_string(),
        });
        ensure!(!peer_id.is_empty(), "peer id must not be empty");

        let rtc = if args.localhost_only {
            RtcConfig::localhost()
        } else if args.stun.is_empty() {
            RtcConfig::default()
        } else {
            RtcConfig {
                ice_servers: args.stun,
                ..RtcConfig::default()
            }
        };

        let mut tokens = CommandTokens {
            quit: args.quit_token,
            ..CommandTokens::default()
        };
        if !args.commands.is_empty() {
            tokens.commands = args.commands;
        }

        let mut session = SessionConfig::new(peer_id);
        session.channel_label = args.channel_label;
        session.answer_timeout = Duration::from_secs(args.answer_timeout_secs);
        session.query_timeout = Duration::from_secs(args.query_timeout_secs);
        session.tokens = tokens;

        Ok(PeerConfig {
            role,
            relay_url,
            rtc,
            session,
        })
    }
}
