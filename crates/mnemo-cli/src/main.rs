use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use mnemo_config::AppConfig;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mnemo", version, about = "Mnemo - memory-centric AI companion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat server and the background maintenance loop
    Bot {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on
        #[arg(long, default_value = "3900")]
        port: u16,
    },

    /// Create the database schema and seed the default personas
    DbInit,

    /// One-shot consolidation and decay across all users
    Maintenance,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Bot { host, port } => run_bot(config, host, port).await,
        Commands::DbInit => run_db_init(config).await,
        Commands::Maintenance => run_maintenance(config).await,
        Commands::Version => {
            println!("mnemo {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn validated(config: AppConfig) -> anyhow::Result<AppConfig> {
    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("configuration error: {error}");
        }
        bail!("invalid configuration ({} problems)", errors.len());
    }
    Ok(config)
}

async fn run_bot(config: AppConfig, host: String, port: u16) -> anyhow::Result<()> {
    let config = validated(config)?;
    let context = mnemo_gateway::build(&config).context("failed to build application")?;
    context
        .roles
        .seed_defaults()
        .await
        .context("failed to seed default personas")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = context.scheduler.clone();
    let scheduler_rx = shutdown_rx.clone();
    let maintenance = tokio::spawn(async move {
        scheduler.run(scheduler_rx).await;
    });

    let server = tokio::spawn({
        let engine = context.engine.clone();
        let server_rx = shutdown_rx.clone();
        async move { mnemo_gateway::serve(&host, port, engine, server_rx).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let _ = maintenance.await;
    server.await.context("server task panicked")??;
    Ok(())
}

async fn run_db_init(config: AppConfig) -> anyhow::Result<()> {
    let config = validated(config)?;
    let database = mnemo_db::Database::open(&config.database_path)
        .context("failed to initialize database")?;
    let seeded = mnemo_db::RoleStore::new(database)
        .seed_defaults()
        .await
        .context("failed to seed default personas")?;
    println!(
        "database initialized at {} ({seeded} personas seeded)",
        config.database_path.display()
    );
    Ok(())
}

async fn run_maintenance(config: AppConfig) -> anyhow::Result<()> {
    let config = validated(config)?;
    let context = mnemo_gateway::build(&config).context("failed to build application")?;

    let (_tx, rx) = watch::channel(false);
    let stats = context
        .scheduler
        .run_once(&rx)
        .await
        .context("maintenance sweep failed")?;
    println!(
        "maintenance complete: {} users, {} consolidated, {} decayed, {} conversations pruned",
        stats.users_processed,
        stats.memories_consolidated,
        stats.memories_decayed,
        stats.conversations_pruned
    );
    Ok(())
}
