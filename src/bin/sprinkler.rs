use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use sprinkler::artifact::S3Fetcher;
use sprinkler::generator::StdoutGenerator;
use sprinkler::notify::{OwnerNotifier, SnsNotifier};
use sprinkler::{
    spawn_activator, spawn_cleanup, spawn_scheduler, ActivatorConfig, ActivatorDeps, AuthConfig,
    CleanupConfig, CleanupTask, Config, ControlState, FakeOrchard, OrchardGateway,
    PostgresStore, SchedulerConfig, SchedulerDeps,
};

#[derive(Parser, Debug)]
#[command(
    name = "sprinkler",
    about = "Workflow scheduler for the Orchard orchestration service"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control API server.
    Control,
    /// Run the scheduler, activator, and cleanup loops.
    Scheduler,
    /// Run one cleanup sweep and exit.
    Cleanup,
    /// Run the in-memory fake Orchard service.
    FakeOrchard {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:8081")]
        addr: SocketAddr,
    },
    /// Apply database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Command::Control => run_control().await,
        Command::Scheduler => run_scheduler().await,
        Command::Cleanup => run_cleanup_once().await,
        Command::FakeOrchard { addr } => run_fake_orchard(addr).await,
        Command::Migrate => run_migrate().await,
    }
}

async fn run_control() -> Result<()> {
    let config = Config::from_env()?;
    let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let metrics = sprinkler::metrics::install_recorder()?;
    let state = ControlState {
        store,
        auth: AuthConfig {
            api_key_enabled: config.api_key_enabled,
            api_key_sha256: config.api_key_sha256.clone(),
            xfcc_enabled: config.xfcc_enabled,
            xfcc_header: config.xfcc_header.clone(),
            xfcc_must_contain: config.xfcc_must_contain.clone(),
        },
        metrics,
    };
    let listener = TcpListener::bind(config.control_addr).await?;
    info!(addr = %config.control_addr, "control api listening");
    sprinkler::run_control_server(listener, state).await
}

async fn run_scheduler() -> Result<()> {
    let config = Config::from_env()?;
    let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let orchard = Arc::new(
        OrchardGateway::new(config.orchard_host.clone())
            .with_api_key(config.orchard_api_key_name.clone(), config.orchard_api_key.clone()),
    );
    let fetcher = Arc::new(S3Fetcher::from_env().await);
    let generator = Arc::new(StdoutGenerator::new(config.generator_base_dir.clone(), fetcher));
    let notifier: Arc<dyn OwnerNotifier> = Arc::new(SnsNotifier::from_env().await);

    let (scheduler_handle, scheduler_shutdown) = spawn_scheduler(
        SchedulerDeps {
            store: store.clone(),
            orchard: orchard.clone(),
            generator,
            notifier: notifier.clone(),
        },
        SchedulerConfig {
            poll_interval: config.scheduler_interval,
        },
    );
    let (activator_handle, activator_shutdown) = spawn_activator(
        ActivatorDeps {
            store: store.clone(),
            orchard,
            notifier,
        },
        ActivatorConfig {
            poll_interval: config.activator_interval,
        },
    );
    let (cleanup_handle, cleanup_shutdown) = spawn_cleanup(
        store,
        CleanupConfig {
            interval: config.cleanup_interval,
            scheduler_lock_ttl: config.scheduler_lock_ttl,
            activator_lock_ttl: config.activator_lock_ttl,
            instance_ttl: config.instance_ttl,
        },
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = scheduler_shutdown.send(true);
    let _ = activator_shutdown.send(true);
    let _ = cleanup_shutdown.send(true);
    let _ = tokio::join!(scheduler_handle, activator_handle, cleanup_handle);
    Ok(())
}

async fn run_cleanup_once() -> Result<()> {
    let config = Config::from_env()?;
    let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let task = CleanupTask::new(
        store,
        CleanupConfig {
            interval: config.cleanup_interval,
            scheduler_lock_ttl: config.scheduler_lock_ttl,
            activator_lock_ttl: config.activator_lock_ttl,
            instance_ttl: config.instance_ttl,
        },
    );
    task.sweep().await?;
    info!("cleanup sweep complete");
    Ok(())
}

async fn run_fake_orchard(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    FakeOrchard::new().run(listener).await
}

async fn run_migrate() -> Result<()> {
    let config = Config::from_env()?;
    // Connecting applies pending migrations.
    PostgresStore::connect(&config.database_url).await?;
    info!("database migrations applied");
    Ok(())
}
