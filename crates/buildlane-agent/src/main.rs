//! buildlane build agent.
//!
//! Runs one agent: the dispatch loop with its execution pool, the stale-job
//! sweeper and the notifier, until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use buildlane_config::{LoggingConfig, SystemConfig, load_system_config};
use buildlane_core::StateStore;
use buildlane_db::{BuildJobRepo, MemoryBuildJobRepo, PgBuildJobRepo, PgStateStore};
use buildlane_executor::{ContainerLimits, DockerBuildExecutor};
use buildlane_scheduler::{
    AgentLifecycle, AgentRegistry, DispatchLoop, ExecutionPool, JobCompletion, LogNotifier,
    MemoryStateStore, Outbox, Sweeper, run_notifier,
};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const NOTIFIER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "buildlane-agent")]
#[command(about = "buildlane build agent", long_about = None)]
struct Cli {
    /// Path to the agent configuration
    #[arg(long, env = "BUILDLANE_CONFIG", default_value = "buildlane.kdl")]
    config: PathBuf,

    /// PostgreSQL URL, overrides the `database` node of the configuration
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default)
    Run,
    /// Check the configuration and exit
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_system_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Validate => {
            println!(
                "{}: agent '{}' with {} concurrent builds",
                cli.config.display(),
                config.agent.short_name,
                config.agent.max_concurrent_builds
            );
            Ok(())
        }
        Commands::Run => {
            init_tracing(&config.logging);
            run(config, cli.database_url).await
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: SystemConfig, database_url: Option<String>) -> anyhow::Result<()> {
    let database = database_url
        .map(|url| (url, config.database.as_ref().map_or(10, |db| db.max_connections)))
        .or_else(|| {
            config
                .database
                .as_ref()
                .map(|db| (db.url.clone(), db.max_connections))
        });

    let (store, repo): (Arc<dyn StateStore>, Arc<dyn BuildJobRepo>) = match database {
        Some((url, max_connections)) => {
            info!("Connecting to database...");
            let pool = buildlane_db::create_pool(&url, max_connections).await?;
            buildlane_db::run_migrations(&pool).await?;
            info!("Database connected");
            (
                Arc::new(PgStateStore::new(pool.clone())),
                Arc::new(PgBuildJobRepo::new(pool)),
            )
        }
        None => {
            warn!("No database configured, cluster state is local to this process");
            (
                Arc::new(MemoryStateStore::new()),
                Arc::new(MemoryBuildJobRepo::new()),
            )
        }
    };

    let executor = DockerBuildExecutor::new(ContainerLimits {
        max_cpu_count: config.executor.max_cpu_count,
        max_memory_mb: config.executor.max_memory_mb,
        max_memory_swap_mb: config.executor.max_memory_swap_mb,
    })?;

    let (outbox, events) = Outbox::new();
    let notifier = tokio::spawn(run_notifier(events, Arc::new(LogNotifier)));

    let registry = AgentRegistry::new(store.clone(), outbox);
    let lifecycle = Arc::new(AgentLifecycle::new(registry, &config.agent));
    let pool = Arc::new(ExecutionPool::new(
        Arc::new(executor),
        config.agent.max_concurrent_builds,
    ));
    let completion = Arc::new(JobCompletion::new(
        store.clone(),
        repo.clone(),
        lifecycle.clone(),
    ));
    let dispatch = DispatchLoop::new(store.clone(), lifecycle, pool, completion, &config.scheduler);
    let sweeper = Sweeper::new(store, repo, &config.scheduler)?;

    let shutdown = CancellationToken::new();
    let sweeper_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };
    let mut dispatch_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatch.run(shutdown).await })
    };

    info!(agent = %config.agent.short_name, "Build agent running");
    let finished_early = tokio::select! {
        result = &mut dispatch_task => {
            warn!("Dispatch loop exited before shutdown was requested");
            Some(result?)
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
            None
        }
    };
    shutdown.cancel();

    let dispatched = match finished_early {
        Some(result) => result,
        None => dispatch_task.await?,
    };
    sweeper_task.await?;
    if let Err(e) = &dispatched {
        error!(error = %e, "Dispatch loop failed");
    }
    if tokio::time::timeout(NOTIFIER_DRAIN_TIMEOUT, notifier).await.is_err() {
        warn!("Notifier did not drain in time");
    }
    dispatched?;

    info!("Build agent stopped");
    Ok(())
}
