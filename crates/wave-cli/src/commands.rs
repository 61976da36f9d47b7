use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use colored::Colorize;
use futures::StreamExt;
use serde_json::Value;
use tracing::info;

use wave_protocol::methods::{self, EventReadHistoryRequest};
use wave_protocol::{AuthKey, AuthToken, TokenClaims};
use wave_pubsub::{events, SubscriptionRequest, WaveEvent};
use wave_rpc::RpcOpts;
use wave_server::config::AUTH_KEY_ENV;
use wave_server::{ServerConfig, WaveServer};
use wave_types::{UpdateEntry, UpdateKind, VersionWatermark};

use crate::cli::*;
use crate::client::WaveClient;

/// The configuration file if one was given, defaults otherwise, with
/// environment overrides applied.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<ServerConfig> {
    let mut config = match path {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

pub async fn run_command(cli: Cli, config: ServerConfig) -> anyhow::Result<()> {
    let format = cli.format;
    match cli.command {
        Command::Serve(args) => cmd_serve(args, config).await,
        Command::Call(args) => cmd_call(args, &config, format).await,
        Command::Watch(args) => cmd_watch(args, &config, format).await,
        Command::Token(args) => cmd_token(args),
        Command::Config(args) => cmd_config(args, config),
    }
}

async fn cmd_serve(args: ServeArgs, mut config: ServerConfig) -> anyhow::Result<()> {
    if let Some(bind) = args.bind {
        config.ws_bind_addr = bind;
    }
    if let Some(socket) = args.socket {
        config.socket_path = Some(socket);
    }
    config.enable_stdio |= args.stdio;
    if config.auth_key.is_none() {
        let key = AuthKey::generate();
        eprintln!(
            "{} no auth key configured; generated one for this run (set {} to keep it):\n  {}",
            "!".yellow().bold(),
            AUTH_KEY_ENV.bold(),
            key.to_hex()
        );
        config.auth_key = Some(key.to_hex());
    }
    config.validate()?;
    info!(data_dir = %config.data_dir.display(), "starting wavesrv");
    WaveServer::new(config)?.serve().await?;
    Ok(())
}

fn socket_for(connect: &ConnectArgs, config: &ServerConfig) -> anyhow::Result<PathBuf> {
    match connect.socket.clone().or_else(|| config.socket_path()) {
        Some(path) => Ok(path),
        None => bail!("no domain socket configured; pass --socket"),
    }
}

fn print_value(value: &Value, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(value)?),
        OutputFormat::Text if value.is_null() => println!("{}", "✓ ok".green()),
        OutputFormat::Text => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

async fn cmd_call(args: CallArgs, config: &ServerConfig, format: OutputFormat) -> anyhow::Result<()> {
    let socket = socket_for(&args.connect, config)?;
    let data: Value = match args.data.as_deref() {
        Some(text) => serde_json::from_str(text).context("request body is not valid JSON")?,
        None => Value::Null,
    };
    let mut opts = match args.timeout_ms {
        Some(ms) => RpcOpts::timeout(Duration::from_millis(ms)),
        None => RpcOpts::default(),
    };
    if let Some(route) = args.route {
        opts = opts.with_route(route);
    }

    let client = WaveClient::connect(&socket, &args.connect.token).await?;
    let result = if args.stream {
        let mut stream = client.endpoint().send_stream(&args.method, data, opts).await?;
        let mut count = 0usize;
        while let Some(item) = stream.next().await {
            print_value(&item?, format)?;
            count += 1;
        }
        if format == OutputFormat::Text {
            println!("{} {} items", "✓".green(), count.to_string().bold());
        }
        Ok(())
    } else {
        let value = client.endpoint().send_command(&args.method, data, opts).await?;
        print_value(&value, format)
    };
    client.close();
    result
}

/// Print one update unless an equal or newer version was already shown.
fn print_update(event: &WaveEvent, watermark: &mut VersionWatermark, format: OutputFormat) -> anyhow::Result<()> {
    let entry: UpdateEntry = match serde_json::from_value(event.data.clone()) {
        Ok(entry) => entry,
        Err(e) => {
            eprintln!("{} malformed update: {e}", "!".yellow());
            return Ok(());
        }
    };
    if !watermark.observe(&entry) {
        return Ok(());
    }
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&entry)?),
        OutputFormat::Text => {
            let ts = chrono::Local::now().format("%H:%M:%S");
            match entry.kind {
                UpdateKind::Update => {
                    let version = entry.obj.as_ref().map(|o| o.version()).unwrap_or_default();
                    println!("{} {} {} v{}", ts.to_string().dimmed(), "update".green(), entry.oref().to_string().cyan(), version);
                }
                UpdateKind::Delete => {
                    println!("{} {} {}", ts.to_string().dimmed(), "delete".red(), entry.oref().to_string().cyan());
                }
            }
        }
    }
    Ok(())
}

async fn cmd_watch(args: WatchArgs, config: &ServerConfig, format: OutputFormat) -> anyhow::Result<()> {
    let socket = socket_for(&args.connect, config)?;
    let mut client = WaveClient::connect(&socket, &args.connect.token).await?;
    let mut watermark = VersionWatermark::new();

    if args.history > 0 {
        for scope in &args.scopes {
            let mut history: Vec<WaveEvent> = client
                .endpoint()
                .call(
                    methods::EVENT_READ_HISTORY,
                    &EventReadHistoryRequest {
                        event: events::WAVEOBJ_UPDATE.into(),
                        scope: scope.clone(),
                        max_items: args.history,
                    },
                    RpcOpts::default(),
                )
                .await?;
            // history comes newest first
            history.reverse();
            for event in &history {
                print_update(event, &mut watermark, format)?;
            }
        }
    }

    let request = args
        .scopes
        .iter()
        .fold(SubscriptionRequest::new(events::WAVEOBJ_UPDATE), |req, scope| req.with_scope(scope.clone()));
    client
        .endpoint()
        .call::<_, ()>(methods::EVENT_SUB, &request, RpcOpts::default())
        .await?;
    if format == OutputFormat::Text {
        eprintln!("watching {} as {}", args.scopes.join(", ").bold(), client.route_id().yellow());
    }

    loop {
        tokio::select! {
            event = client.next_event() => match event {
                Some(event) => print_update(&event, &mut watermark, format)?,
                None => bail!("connection to wavesrv closed"),
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }
    client.close();
    Ok(())
}

fn build_claims(args: &TokenArgs) -> TokenClaims {
    let mut claims = TokenClaims {
        route_id: args.route.clone(),
        block_id: args.block.clone(),
        tab_id: args.tab.clone(),
        conn: args.conn.clone(),
        ..TokenClaims::new()
    };
    claims.exp = args.ttl.map(|ttl| claims.iat + ttl);
    claims
}

fn cmd_token(args: TokenArgs) -> anyhow::Result<()> {
    let key = AuthKey::from_hex(args.key.trim()).context("invalid --key")?;
    let claims = build_claims(&args);
    if claims.route_id.is_none() && claims.block_id.is_none() && claims.conn.is_none() {
        bail!("a token needs --route, --block or --conn");
    }
    println!("{}", AuthToken::sign(&claims, &key)?);
    Ok(())
}

fn cmd_config(args: ConfigArgs, config: ServerConfig) -> anyhow::Result<()> {
    let config = if args.defaults { ServerConfig::default() } else { config };
    print!("{}", config.to_toml()?);
    Ok(())
}
