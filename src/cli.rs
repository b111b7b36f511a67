use crate::config::FerryConfig;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(about = "Stream a single file to a remote receiver", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = "FERRY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bytes per chunk; both sides must agree
    #[arg(long, global = true, env = "FERRY_BLOCK_SIZE")]
    pub block_size: Option<usize>,

    /// Per-operation timeout in seconds (0 = none)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Bypass the page cache (Linux)
    #[arg(long, global = true)]
    pub direct_io: bool,

    /// Verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a file to a server
    Send {
        /// Server address
        #[arg(long)]
        server: Option<String>,

        /// Server port
        #[arg(long)]
        port: Option<u16>,

        /// File to send; only its last path component is transmitted
        #[arg(long)]
        file: PathBuf,
    },

    /// Receive files into a directory
    Serve {
        /// Address to bind
        #[arg(long)]
        listen: Option<String>,

        /// Port to bind
        #[arg(long)]
        port: Option<u16>,

        /// Directory received files are written to
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

impl Cli {
    /// Default `tracing` directive for the chosen verbosity.
    pub fn log_directive(&self) -> &'static str {
        match self.verbose {
            0 => "ferry=info",
            1 => "ferry=debug",
            _ => "ferry=trace",
        }
    }

    /// Flags given on the command line win over the file.
    pub fn apply_overrides(&self, config: &mut FerryConfig) {
        if let Some(size) = self.block_size {
            config.transfer.block_size = size;
        }
        if let Some(secs) = self.timeout {
            config.transfer.io_timeout_secs = secs;
        }
        if self.direct_io {
            config.transfer.direct_io = true;
        }

        match &self.command {
            Command::Send { server, port, .. } => {
                if let Some(server) = server {
                    config.client.server = server.clone();
                }
                if let Some(port) = port {
                    config.client.port = *port;
                }
            }
            Command::Serve { listen, port, dir } => {
                if let Some(listen) = listen {
                    config.server.listen = listen.clone();
                }
                if let Some(port) = port {
                    config.server.port = *port;
                }
                if let Some(dir) = dir {
                    config.server.dir = dir.clone();
                }
            }
        }
    }
}
