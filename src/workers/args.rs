//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - optional TOML configuration file (`ferry.toml`) for receiver tuning
//! - merging the two, with the CLI taking precedence

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::core::block::DEFAULT_WINDOW;
use crate::net::Endpoint;

/// Default name of the optional configuration file, looked up in the
/// current working directory.
pub const CONFIG_FILE: &str = "ferry.toml";

/// Ferry - two-party file and message transfer.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a message or a file to a peer.
    Send(SendArgs),
    /// Receive whatever the peer sends.
    Recv(RecvArgs),
}

#[derive(Args, Debug)]
#[command(group = clap::ArgGroup::new("payload")
    .required(true)
    .args(["message", "file", "bigfile"]))]
pub struct SendArgs {
    /// Message to send.
    #[arg(short = 'm', long, value_name = "MESSAGE")]
    pub message: Option<String>,

    /// Label attached to the message.
    #[arg(short = 'i', long, value_name = "INFO", default_value = "", requires = "message")]
    pub info: String,

    /// Small file to send whole in a single frame.
    #[arg(short = 'f', long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Large file to serve over the block protocol.
    #[arg(long, value_name = "PATH")]
    pub bigfile: Option<PathBuf>,

    #[command(flatten)]
    pub endpoint: EndpointArgs,
}

#[derive(Args, Debug)]
pub struct RecvArgs {
    /// Directory to place received files in (default: current directory).
    #[arg(long, value_name = "DIR")]
    pub out: Option<PathBuf>,

    /// Block requests kept in flight per file.
    #[arg(long, value_name = "N")]
    pub window: Option<usize>,

    #[command(flatten)]
    pub endpoint: EndpointArgs,
}

/// Exactly one of `-s` (listen) and `-c` (dial) must be given.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct EndpointArgs {
    /// Listen for the peer on this address.
    #[arg(short = 's', long, value_name = "ADDR")]
    pub serve: Option<String>,

    /// Dial the peer at this address.
    #[arg(short = 'c', long, value_name = "ADDR")]
    pub connect: Option<String>,
}

impl EndpointArgs {
    pub fn endpoint(&self) -> Endpoint {
        match (&self.serve, &self.connect) {
            (Some(addr), None) => Endpoint::Listen(addr.clone()),
            (None, Some(addr)) => Endpoint::Connect(addr.clone()),
            // clap's group makes the remaining combinations unrepresentable
            _ => unreachable!("endpoint group enforces exactly one address"),
        }
    }
}

// ── Configuration file ───────────────────────────────────────────────────────

/// Receiver tuning from `ferry.toml`. Every field is optional; the CLI
/// overrides whatever the file sets.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct FileConfig {
    pub out_dir: Option<PathBuf>,
    pub window: Option<usize>,
}

impl FileConfig {
    /// Load from a TOML file; `None` when it is missing or malformed.
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        toml::from_str(&content).ok()
    }

    /// The configuration next to the working directory, if any.
    pub fn discover() -> Self {
        Self::from_file(Path::new(CONFIG_FILE)).unwrap_or_default()
    }
}

/// Fully resolved receiver configuration.
#[derive(Debug, Clone)]
pub struct RecvConfig {
    pub out_dir: PathBuf,
    pub window: usize,
}

impl RecvArgs {
    /// Merge CLI values over the file config, with built-in defaults last.
    pub fn resolve(&self, file: FileConfig) -> RecvConfig {
        RecvConfig {
            out_dir: self
                .out
                .clone()
                .or(file.out_dir)
                .unwrap_or_else(|| PathBuf::from(".")),
            window: self.window.or(file.window).unwrap_or(DEFAULT_WINDOW).max(1),
        }
    }
}
