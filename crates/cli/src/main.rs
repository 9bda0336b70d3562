mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futumcp_core::{AccountMode, BrokerClient};
use futumcp_gateway::{FutuGateway, SimulatedGateway, SimulatedGatewayConfig};
use futumcp_server::McpServer;
use futumcp_tools::{BrokerSessionHandle, Dispatcher};
use serde_json::Value;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, EnvFilter};

use settings::{FileConfig, LogSettings, Overrides, Settings};

#[derive(Parser)]
#[command(name = "futu-mcp")]
#[command(about = "MCP server exposing Futu OpenD market data and account queries as tools")]
#[command(version)]
struct Cli {
    /// Path to the TOML config file (default: ./futu-mcp.toml if present)
    #[arg(short, long, env = "FUTU_MCP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// OpenD host
    #[arg(long, env = "FUTU_API_HOST")]
    host: Option<String>,

    /// OpenD port
    #[arg(long, env = "FUTU_API_PORT")]
    port: Option<u16>,

    /// Trade unlock password
    #[arg(long, env = "FUTU_UNLOCK_PASSWORD", hide_env_values = true)]
    unlock_password: Option<String>,

    /// Trading environment (REAL or SIMULATE)
    #[arg(long, env = "FUTU_ACCOUNT_MODE")]
    account_mode: Option<AccountMode>,

    /// Serve from the in-memory simulated gateway instead of OpenD
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP over stdin/stdout (default)
    Stdio,

    /// Serve MCP over HTTP
    Serve {
        /// Bind address (overrides [server] bind)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// List available tools
    Tools,

    /// Invoke one tool and print its result
    Call {
        /// Tool name (e.g. "get_stock_quote")
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Connect once and print the client status
    Status,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            unlock_password: self.unlock_password.clone(),
            account_mode: self.account_mode,
            log_level: self.log_level.clone(),
            log_file: self.log_file.clone(),
            log_json: self.log_json,
        }
    }
}

/// Logs never go to stdout, which carries the stdio transport.
fn init_tracing(log: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = fmt().with_env_filter(filter).with_target(false);

    match &log.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            let builder = builder.with_ansi(false).with_writer(Mutex::new(file));
            if log.json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
        None => {
            let builder = builder.with_writer(std::io::stderr);
            if log.json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
    }
    Ok(())
}

fn build_client(settings: &Settings, simulate: bool) -> Arc<dyn BrokerClient> {
    if simulate {
        let mut config = SimulatedGatewayConfig::default();
        if let Some(password) = &settings.session.unlock_password {
            config.unlock_password = Some(password.expose().to_string());
        }
        Arc::new(SimulatedGateway::new(config))
    } else {
        Arc::new(FutuGateway::new(settings.gateway.clone()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = FileConfig::load(cli.config.as_deref())?;
    let settings = Settings::resolve(file, cli.overrides())?;
    init_tracing(&settings.log)?;

    tracing::info!(
        host = %settings.session.host,
        port = settings.session.port,
        account_mode = %settings.session.account_mode,
        simulate = cli.simulate,
        "Starting futu-mcp"
    );

    let client = build_client(&settings, cli.simulate);
    let session = Arc::new(BrokerSessionHandle::new(client, settings.session.clone()));
    let dispatcher = Arc::new(Dispatcher::new(session));

    let mut exit_code = 0;
    let outcome = match cli.command.unwrap_or(Commands::Stdio) {
        Commands::Stdio => {
            let mcp = Arc::new(McpServer::new(Arc::clone(&dispatcher)));
            futumcp_server::run_stdio(mcp).await
        }

        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| settings.bind.clone());
            let mcp = Arc::new(McpServer::new(Arc::clone(&dispatcher)));
            futumcp_server::start_server(mcp, &bind).await
        }

        Commands::Tools => {
            println!("Available tools:");
            for tool in dispatcher.tools() {
                let marker = if tool.requires_unlock { " (requires unlock)" } else { "" };
                println!("  {:<24} {}{}", tool.name, tool.description, marker);
            }
            Ok(())
        }

        Commands::Call { tool, args } => {
            // Nothing is connected yet, so bailing out skips no cleanup.
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let result = dispatcher.dispatch(&tool, arguments).await;
            if result.is_error {
                exit_code = 1;
            }
            serde_json::to_string_pretty(&result)
                .map(|out| println!("{}", out))
                .context("cannot render tool result")
        }

        Commands::Status => {
            if let Err(e) = dispatcher.session().ensure_connected().await {
                tracing::warn!(error = %e, "Connection attempt failed");
                exit_code = 1;
            }
            println!("{}", dispatcher.session().status().await);
            Ok(())
        }
    };

    dispatcher.shutdown().await;
    outcome?;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
