use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{debug, info};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use tether::api::{AppState, create_router};
use tether::config::Settings;
use tether::crypto::TokenSealer;
use tether::directory::{HttpDirectory, MemoryDirectory};
use tether::events::{HttpEventBus, MemoryEventBus};
use tether::github::GitProviderClient;
use tether::sandbox::{HttpProvisioner, StaticProvisioner};
use tether::session::{SessionDeps, SessionRegistry};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let settings = Settings::load(cli.common.config.as_deref())?;
    debug!(
        "resolved settings: bind={} data_dir={}",
        settings.bind_addr,
        settings.data_dir.display()
    );

    match cli.command {
        Command::Serve(cmd) => run_serve(settings, cmd),
    }
}

#[tokio::main]
async fn run_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    handle_serve(settings, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tether - session broker between clients and sandboxed runners.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the session broker server
    Serve(ServeCommand),
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Override the bind address from the config
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
    /// Use in-memory collaborators instead of external services
    #[arg(long)]
    local: bool,
}

fn init_logging(opts: &CommonOpts) {
    let level = if opts.trace {
        "trace"
    } else if opts.quiet {
        "error"
    } else {
        match opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    // The log-record bridge picks up the `log` macros used throughout.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn handle_serve(settings: Settings, cmd: ServeCommand) -> Result<()> {
    let sealer = TokenSealer::new(&settings.token_secret);
    let git = GitProviderClient::new(settings.git_api_base.clone());

    let deps = if cmd.local {
        info!("serving with in-memory collaborators (--local)");
        SessionDeps {
            directory: Arc::new(MemoryDirectory::new()),
            provisioner: StaticProvisioner::new(),
            events: Arc::new(MemoryEventBus::new()),
            git,
            sealer,
            default_idle_timeout_ms: settings.default_idle_timeout_ms,
        }
    } else {
        SessionDeps {
            directory: Arc::new(HttpDirectory::new(settings.directory_url.clone())),
            provisioner: Arc::new(HttpProvisioner::new()),
            events: Arc::new(HttpEventBus::new(settings.event_bus_url.clone())),
            git,
            sealer,
            default_idle_timeout_ms: settings.default_idle_timeout_ms,
        }
    };

    let registry = SessionRegistry::new(settings.data_dir.clone(), deps);
    let router = create_router(AppState::new(registry));

    let bind_addr = cmd.bind.unwrap_or(settings.bind_addr);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    info!("tether listening on {}", bind_addr);

    axum::serve(listener, router).await.context("serving")?;
    Ok(())
}
