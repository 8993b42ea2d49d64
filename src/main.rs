//! Wallet Ledger service
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌────────────┐   ┌───────────────────┐
//! │ Postgres │──▶│ OutboxDispatcher │──▶│ MessageBus │──▶│ saga / consumers  │
//! │ (outbox) │   │  claim + lease   │   │ job queue  │   │ Idempotent guard  │
//! └──────────┘   └──────────────────┘   └────────────┘   └───────────────────┘
//! ```
//!
//! Runs until SIGINT/SIGTERM, then drains in-flight deliveries.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use wallet_ledger::bus::{InMemoryQueue, JobQueue, MemoryCache, MessageBus};
use wallet_ledger::config::AppConfig;
use wallet_ledger::consumer::register_default_consumers;
use wallet_ledger::db::Database;
use wallet_ledger::ledger::{AssetLedger, system_wallet};
use wallet_ledger::logging::init_logging;
use wallet_ledger::outbox::{Outbox, OutboxDispatcher, OutboxStore, PgOutboxStore};

#[derive(Debug, Parser)]
#[command(name = "wallet_ledger", version, about = "Exactly-once wallet ledger service")]
struct Args {
    /// Configuration environment, loads `config/{env}.yaml`
    #[arg(long, env = "APP_ENV", default_value = "dev")]
    env: String,

    /// Dispatcher instance id written to `locked_by` (default: random ULID)
    #[arg(long, env = "INSTANCE_ID")]
    instance_id: Option<String>,

    /// Move a DEAD outbox message back to PENDING and exit
    #[arg(long, value_name = "OUTBOX_ID")]
    requeue_dead: Option<i64>,

    /// Print up to N DEAD outbox messages (newest first) and exit
    #[arg(long, value_name = "LIMIT", conflicts_with = "requeue_dead")]
    list_dead: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.env)?;
    let _log_guard = init_logging(&config);

    info!(
        env = %args.env,
        version = env!("CARGO_PKG_VERSION"),
        "Starting wallet ledger"
    );

    let database_url = config
        .postgres_url
        .clone()
        .context("postgres_url is not configured (set DATABASE_URL)")?;
    let db = Database::connect(&database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.migrate().await.context("Failed to apply migrations")?;
    let pool = db.pool().clone();
    let store = Arc::new(PgOutboxStore::new(pool.clone()));

    if let Some(id) = args.requeue_dead {
        if store.requeue_dead(id).await? {
            info!(outbox_id = id, "DEAD outbox message requeued");
        } else {
            warn!(outbox_id = id, "Outbox message is not DEAD, nothing requeued");
        }
        return Ok(());
    }

    if let Some(limit) = args.list_dead {
        let dead = store.list_dead(limit).await?;
        info!(count = dead.len(), "DEAD outbox messages");
        for m in &dead {
            info!(
                outbox_id = m.id,
                topic = %m.topic,
                msg_type = %m.msg_type,
                attempts = m.attempts,
                dedupe_key = ?m.dedupe_key,
                last_error = ?m.last_error,
                "DEAD"
            );
        }
        return Ok(());
    }

    system_wallet::provision_all(&pool)
        .await
        .context("Failed to provision system wallets")?;

    let queue = Arc::new(InMemoryQueue::new(
        config.bus.default_attempts,
        Duration::from_secs(config.bus.dedupe_window_secs),
        config.bus.failed_job_capacity,
    ));
    let cache = Arc::new(MemoryCache::new());
    let bus = Arc::new(MessageBus::new(
        queue.clone(),
        cache.clone(),
        config.bus.clone(),
    ));
    bus.attach_outbox(Arc::new(Outbox::new(config.dispatcher.max_attempts)));

    let ledger = Arc::new(AssetLedger::new(config.ledger.clone()));
    register_default_consumers(&bus, pool.clone(), ledger, &config.consumer);

    let instance_id = args
        .instance_id
        .unwrap_or_else(|| format!("dispatcher-{}", ulid::Ulid::new()));
    let dispatcher = Arc::new(OutboxDispatcher::new(
        store,
        bus.clone(),
        config.dispatcher.clone(),
        instance_id,
    ));

    let cancel = install_signal_handler();
    let mut tasks = JoinSet::new();
    tasks.spawn(bus.clone().run(cancel.clone()));
    {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { dispatcher.run(cancel).await });
    }
    {
        let dispatcher = dispatcher.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move { dispatcher.run_purge(cancel).await });
    }
    {
        let interval = config.bus.cache_sweep_interval();
        let cancel = cancel.clone();
        tasks.spawn(async move { cache.run_sweep(interval, cancel).await });
    }

    info!(instance_id = %dispatcher.instance_id(), "Wallet ledger running");
    cancel.cancelled().await;

    while let Some(done) = tasks.join_next().await {
        if let Err(e) = done {
            error!(error = %e, "Background task failed");
        }
    }
    queue.close();

    let stats = dispatcher.stats().snapshot();
    info!(
        sent = stats.sent,
        retried = stats.retried,
        dead = stats.dead,
        failed_jobs = queue.failed_jobs().await.len(),
        "Shutdown complete"
    );
    Ok(())
}

/// Cancelled on SIGINT or SIGTERM
fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable, waiting for Ctrl-C only");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Received SIGINT, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C, shutting down");
        }

        trigger.cancel();
    });

    token
}
