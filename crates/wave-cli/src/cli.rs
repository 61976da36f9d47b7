use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "wavesrv",
    about = "Wave terminal backend: object store, event broker and RPC router",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Server configuration file (TOML)
    #[arg(long, global = true, env = "WAVE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the backend until interrupted
    Serve(ServeArgs),
    /// Call one method on a running backend
    Call(CallArgs),
    /// Print object updates for the given scopes as they happen
    Watch(WatchArgs),
    /// Mint a signed peer token
    Token(TokenArgs),
    /// Print the effective configuration as TOML
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Websocket and health listener address
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Domain socket path
    #[arg(long)]
    pub socket: Option<PathBuf>,
    /// Also serve the parent process over stdin/stdout
    #[arg(long)]
    pub stdio: bool,
}

/// How to reach a running backend.
#[derive(Args)]
pub struct ConnectArgs {
    /// Domain socket path; defaults to the configured one
    #[arg(long)]
    pub socket: Option<PathBuf>,
    /// Peer token issued by `wavesrv token`
    #[arg(long, env = "WAVE_TOKEN")]
    pub token: String,
}

#[derive(Args)]
pub struct CallArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    pub method: String,
    /// Request body as JSON
    pub data: Option<String>,
    /// Forward the call to another route
    #[arg(long)]
    pub route: Option<String>,
    #[arg(long)]
    pub timeout_ms: Option<u64>,
    /// Treat the method as streaming and print every item
    #[arg(long)]
    pub stream: bool,
}

#[derive(Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
    /// Scopes such as `block:<oid>` or `tab:*`
    #[arg(required = true)]
    pub scopes: Vec<String>,
    /// Print this many history entries per scope before watching
    #[arg(long, default_value = "0")]
    pub history: usize,
}

#[derive(Args)]
pub struct TokenArgs {
    /// Hex server auth key
    #[arg(long, env = "WAVE_AUTH_KEY")]
    pub key: String,
    #[arg(long)]
    pub route: Option<String>,
    #[arg(long)]
    pub block: Option<String>,
    #[arg(long)]
    pub tab: Option<String>,
    #[arg(long)]
    pub conn: Option<String>,
    /// Lifetime in seconds; tokens without one do not expire
    #[arg(long)]
    pub ttl: Option<i64>,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Print the built-in defaults instead of the loaded file
    #[arg(long)]
    pub defaults: bool,
}
