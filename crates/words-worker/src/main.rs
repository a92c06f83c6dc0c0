use clap::{Parser, Subcommand};
use words_storage::PostId;
use words_worker::config::loader::{DEFAULT_CONFIG_PATH, load_config};
use words_worker::{AppConfig, Backends, Worker, observability};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Parser)]
#[command(name = "words-worker")]
#[command(about = "Background worker for the words repost pipeline")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to words.toml)
    #[arg(short, long, global = true, env = "WORDS_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
enum Command {
    /// Process queues until interrupted (the default)
    Run,
    /// Queue the repost of one post and exit
    Enqueue {
        /// ID of the published post
        post_id: i64,
        /// Public URL of the post
        post_url: String,
    },
    /// Print the effective configuration as TOML and exit
    PrintConfig,
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    observability::init_tracing();

    let args = Args::parse();
    let config_path = resolve_config_path(args.config);

    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };

    tracing::info!(
        path = %config_path,
        backend = %cfg.storage.backend,
        "Configuration loaded"
    );
    observability::apply_logging_level(&cfg.logging.level);

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => run(&cfg).await,
        Command::Enqueue { post_id, post_url } => {
            enqueue(&cfg, PostId(post_id), post_url).await
        }
        Command::PrintConfig => print_config(&cfg),
    };

    if let Err(err) = result {
        tracing::error!(error = ?err, "Worker failed");
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: &AppConfig) -> anyhow::Result<()> {
    let worker = Worker::start(cfg).await?;
    shutdown_signal().await;
    worker.shutdown().await;
    Ok(())
}

async fn enqueue(cfg: &AppConfig, post_id: PostId, post_url: String) -> anyhow::Result<()> {
    let backends = Backends::connect(cfg).await?;
    let task_id = backends.client(cfg).enqueue_repost(post_id, post_url).await?;
    tracing::info!(%task_id, %post_id, "Repost queued");
    println!("{task_id}");
    Ok(())
}

fn print_config(cfg: &AppConfig) -> anyhow::Result<()> {
    let mut shown = cfg.clone();
    if !shown.telegram.bot_token.is_empty() {
        shown.telegram.bot_token = "***".into();
    }
    shown.storage.postgres.url = words_db_postgres::pool::mask_password(&shown.storage.postgres.url);
    print!("{}", toml::to_string_pretty(&shown)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

/// Configuration path from `--config` or `WORDS_CONFIG`, else words.toml.
fn resolve_config_path(arg: Option<String>) -> String {
    arg.filter(|path| !path.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}
