use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use studypulse::application::bootstrap::bootstrap_workspace;
use studypulse::application::commands::AppState;
use studypulse::application::session::BellNotifier;
use studypulse::build_router;
use studypulse::infrastructure::credential_store::{CredentialStore, KeyringCredentialStore};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const COMMAND_LOG: &str = "commands.log";

#[derive(Parser)]
#[command(name = "studypulse", about = "Study timer, task and note service")]
struct Args {
    /// Workspace holding config/, state/ and logs/
    #[arg(long, env = "STUDYPULSE_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8787", env = "STUDYPULSE_ADDR")]
    addr: SocketAddr,

    /// Ring the terminal bell when a timer period ends
    #[arg(long)]
    bell: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Read the hosted backend API key from stdin and store it in the OS keyring
    SetRemoteKey,
    /// Remove the stored hosted backend API key
    ClearRemoteKey,
}

fn run_key_command(command: Command) -> anyhow::Result<()> {
    let store = KeyringCredentialStore::default();
    match command {
        Command::SetRemoteKey => {
            let mut api_key = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut api_key)
                .context("failed to read api key from stdin")?;
            store.save_api_key(&api_key)?;
            eprintln!("remote api key stored");
        }
        Command::ClearRemoteKey => {
            store.delete_api_key()?;
            eprintln!("remote api key removed");
        }
    }
    Ok(())
}

fn init_tracing(logs_dir: &Path) -> anyhow::Result<()> {
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(COMMAND_LOG))
        .with_context(|| format!("failed to open {}", logs_dir.join(COMMAND_LOG).display()))?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if let Some(command) = args.command {
        return run_key_command(command);
    }

    let workspace_root = match args.workspace {
        Some(path) => path,
        None => std::env::current_dir().context("failed to resolve current directory")?,
    };

    let bootstrap = bootstrap_workspace(&workspace_root)
        .with_context(|| format!("failed to bootstrap {}", workspace_root.display()))?;
    init_tracing(&bootstrap.logs_dir)?;

    let mut state = AppState::open(bootstrap).context("failed to initialize app state")?;
    if args.bell {
        state = state.with_notifier(Arc::new(BellNotifier));
    }
    let state = Arc::new(state);

    info!(
        addr = %args.addr,
        workspace = %state.workspace_root().display(),
        "starting studypulse"
    );

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    axum::serve(listener, build_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down; flushing open sessions");
    state.shutdown_sessions().await;
    Ok(())
}
