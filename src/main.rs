use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use shardwise::config::BackendKind;
use shardwise::web::build_router;
use shardwise::{
    AppConfig, MigrationRequest, MigrationState, ShardingContext, TenantKey, TenantRange,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "shardwise")]
#[command(about = "Tenant shard routing, health monitoring and online migration")]
struct Cli {
    /// JSON configuration file (defaults to $SHARDWISE_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the admin HTTP API and the health probe loop.
    Serve,
    /// Print the shard a tenant resolves to.
    Route {
        #[arg(long)]
        tenant: String,
    },
    /// Move tenants from one shard to another and wait for the result.
    Migrate {
        #[arg(long)]
        source: u32,
        #[arg(long)]
        target: u32,
        /// Tenants to move; every tenant on the source when omitted.
        #[arg(long = "tenant")]
        tenants: Vec<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        no_verify: bool,
        #[arg(long)]
        no_rollback: bool,
        #[arg(long)]
        continue_on_error: bool,
        /// Seconds between progress lines.
        #[arg(long, default_value_t = 5)]
        progress_interval: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    let ctx = build_context(config).await?;

    let outcome = match cli.command {
        Command::Serve => serve(&ctx).await,
        Command::Route { tenant } => route(&ctx, &tenant),
        Command::Migrate {
            source,
            target,
            tenants,
            batch_size,
            no_verify,
            no_rollback,
            continue_on_error,
            progress_interval,
        } => {
            let range = if tenants.is_empty() {
                TenantRange::All
            } else {
                TenantRange::keys(&tenants).context("invalid --tenant value")?
            };
            let mut request = MigrationRequest::new(source, target)
                .range(range)
                .verify(!no_verify)
                .rollback_on_error(!no_rollback)
                .continue_on_batch_error(continue_on_error);
            request.batch_size = batch_size;
            migrate(&ctx, request, Duration::from_secs(progress_interval.max(1))).await
        }
    };

    ctx.shutdown().await;
    outcome
}

async fn build_context(config: AppConfig) -> Result<ShardingContext> {
    match config.backend {
        BackendKind::Memory => {
            info!(shards = config.shards.len(), "shard backend: in-memory");
            ShardingContext::in_memory(config)
                .await
                .context("failed to initialize in-memory shards")
        }
        BackendKind::Postgres => postgres_context(config),
    }
}

#[cfg(feature = "postgres")]
fn postgres_context(config: AppConfig) -> Result<ShardingContext> {
    use std::sync::Arc;

    info!(shards = config.shards.len(), "shard backend: postgres");
    let connector = Arc::new(shardwise::storage::PgConnector::new(config.pool.connect_timeout));
    ShardingContext::build(config, connector).context("failed to initialize postgres shards")
}

#[cfg(not(feature = "postgres"))]
fn postgres_context(_config: AppConfig) -> Result<ShardingContext> {
    bail!("this build has no postgres support; rebuild with --features postgres")
}

async fn serve(ctx: &ShardingContext) -> Result<()> {
    let addr = ctx.config.bind_addr()?;
    ctx.monitor.start()?;

    let stop = CancellationToken::new();
    let reporter = {
        let exporter = ctx.exporter.clone();
        let interval = ctx.monitor.probe_interval();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = exporter.log_metrics() {
                            warn!(error = %err, "failed to log shard metrics");
                        }
                    }
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(address = %addr, "shardwise admin API started");

    let served = axum::serve(listener, build_router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error");

    stop.cancel();
    let _ = reporter.await;
    served
}

fn route(ctx: &ShardingContext, tenant: &str) -> Result<()> {
    let tenant = TenantKey::parse(tenant)?;
    let shard_id = ctx.router.shard_for(&tenant)?;
    let dsn = ctx.router.shard_dsn(shard_id)?;
    println!("{} -> shard {} ({})", tenant, shard_id, dsn);
    Ok(())
}

async fn migrate(ctx: &ShardingContext, request: MigrationRequest, every: Duration) -> Result<()> {
    let started = ctx.migrations.start(request)?;
    let id = started.migration_id;
    info!(migration_id = %id, "migration started; press Ctrl+C to cancel");

    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    let mut cancel_sent = false;
    let finished = loop {
        tokio::select! {
            status = ctx.migrations.wait(&id) => break status?,
            _ = ticker.tick() => {
                let status = ctx.migrations.status(&id)?;
                info!(
                    migration_id = %id,
                    state = %status.state,
                    table = status.current_table.as_deref().unwrap_or("-"),
                    migrated = status.migrated_records,
                    total = status.total_records,
                    progress = %format!("{:.1}%", status.progress),
                    eta_seconds = ?status.eta_seconds.map(|s| s.round() as u64),
                    "migration progress"
                );
            }
            signal = tokio::signal::ctrl_c(), if !cancel_sent => {
                if let Err(err) = signal {
                    error!(error = %err, "unable to listen for Ctrl+C");
                }
                cancel_sent = true;
                match ctx.migrations.cancel(&id) {
                    Ok(_) => warn!(migration_id = %id, "cancelling migration"),
                    Err(err) => warn!(migration_id = %id, error = %err, "cancel refused"),
                }
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&finished)?);
    if finished.state != MigrationState::Completed {
        bail!("migration {} ended {}: {}", id, finished.state, finished.message);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shardwise=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
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
}
