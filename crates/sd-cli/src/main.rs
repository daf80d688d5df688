//! `sd` — plan management and the orchestrator runtime.
//!
//! Exit codes: 0 on success, 1 on validation or operational failure.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use sd_barcache::{BarCache, CacheMonitor, MonitorConfig};
use sd_broker_tws::{TwsBroker, TwsConfig};
use sd_config::AppConfig;
use sd_db::{AuditRepository, BarRepository, PgRepository, PlanRepository, Repository};
use sd_orchestrator::{AppContext, NullBarSource, Orchestrator};
use sd_schemas::PlanStatus;

#[derive(Parser)]
#[command(name = "sd")]
#[command(about = "StratDeck: multi-strategy live-trading orchestrator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan management
    Plan {
        #[command(subcommand)]
        cmd: PlanCmd,
    },

    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Run the orchestrator loop until SIGINT/SIGTERM
    Run,
}

#[derive(Subcommand)]
enum PlanCmd {
    /// Validate a plan file and store it PENDING
    Add {
        #[arg(long)]
        user: String,

        /// Path to the plan YAML
        #[arg(long)]
        file: String,

        /// Broker account override recorded with the plan
        #[arg(long)]
        account: Option<String>,
    },

    /// List plans for a user
    List {
        #[arg(long)]
        user: String,

        /// Filter by status (DRAFT|PENDING|ACTIVE|CLOSED|ARCHIVED|FAILED)
        #[arg(long)]
        status: Option<String>,
    },

    /// Close a plan
    Close {
        #[arg(long)]
        id: Uuid,

        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Dev-time .env bootstrap; a missing file is not an error.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Commands::Plan { cmd } => run_plan_cmd(cmd).await,
        Commands::Db { cmd } => run_db_cmd(cmd).await,
        Commands::Run => run_orchestrator().await,
    }
}

async fn repo() -> Result<PgRepository> {
    let pool = sd_db::connect().await.context("database connect failed")?;
    Ok(PgRepository::new(pool))
}

async fn run_plan_cmd(cmd: PlanCmd) -> Result<()> {
    match cmd {
        PlanCmd::Add {
            user,
            file,
            account,
        } => {
            let yaml = std::fs::read_to_string(&file)
                .with_context(|| format!("read plan file {file}"))?;
            // Compile before storing: a plan that cannot compile never
            // reaches the orchestrator.
            let ir = sd_plan::compile(&yaml)
                .map_err(|e| anyhow::anyhow!("plan validation failed: {e}"))?;

            let repo = repo().await?;
            let plan = sd_db::new_plan_record(
                &user,
                &ir.symbol,
                ir.timeframe,
                &ir.name,
                &yaml,
                PlanStatus::Pending,
            );
            repo.create_plan(&plan).await?;
            repo.append_audit(&sd_schemas::AuditRecord {
                id: Uuid::new_v4(),
                plan_id: Some(plan.id),
                topic: "cli".into(),
                event_type: "plan_added".into(),
                payload: serde_json::json!({
                    "user": user,
                    "file": file,
                    "account": account,
                }),
                ts_utc: chrono::Utc::now(),
            })
            .await?;
            println!("plan_id={} name={} symbol={}", plan.id, ir.name, ir.symbol);
            Ok(())
        }

        PlanCmd::List { user, status } => {
            let filter = match status.as_deref() {
                None => None,
                Some(raw) => Some(
                    PlanStatus::parse(raw)
                        .ok_or_else(|| anyhow::anyhow!("unknown status {raw:?}"))?,
                ),
            };
            let repo = repo().await?;
            let plans = repo.list_plans(&user, filter).await?;
            for p in &plans {
                println!(
                    "{}  {:<8}  {:<6}  {:<4}  {}",
                    p.id,
                    p.status.as_str(),
                    p.symbol,
                    p.timeframe,
                    p.name
                );
            }
            println!("total={}", plans.len());
            Ok(())
        }

        PlanCmd::Close { id, reason } => {
            let repo = repo().await?;
            let plan = repo.get_plan(id).await?;
            if matches!(plan.status, PlanStatus::Closed | PlanStatus::Archived) {
                bail!("plan {id} is already {}", plan.status);
            }
            repo.update_plan_status(id, PlanStatus::Closed, reason.as_deref())
                .await?;
            println!("plan_id={id} status=CLOSED");
            Ok(())
        }
    }
}

async fn run_db_cmd(cmd: DbCmd) -> Result<()> {
    let pool = sd_db::connect().await.context("database connect failed")?;
    match cmd {
        DbCmd::Status => {
            let ok = sd_db::status(&pool).await?;
            println!("db_ok={ok}");
            Ok(())
        }
        DbCmd::Migrate => {
            sd_db::migrate(&pool).await?;
            println!("migrations_applied=true");
            Ok(())
        }
    }
}

async fn run_orchestrator() -> Result<()> {
    let config = AppConfig::from_env().context("configuration invalid")?;

    let pg = Arc::new(repo().await?);
    let repo: Arc<dyn Repository> = pg.clone();
    let cache = Arc::new(BarCache::new(
        pg as Arc<dyn BarRepository>,
        config.cache.ttl_ms,
    ));

    let broker = Arc::new(TwsBroker::new(TwsConfig::new(
        config.broker.host.clone(),
        config.broker.port,
        config.broker.client_id,
        !config.live_orders_enabled(),
    )));
    broker.connect().await.context("broker connect failed")?;
    if !broker.is_dry_run() {
        broker.wait_ready().await.context("broker never became ready")?;
    }
    info!(dry_run = broker.is_dry_run(), "broker session up");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let monitor = CacheMonitor::new(
        Arc::clone(&cache),
        MonitorConfig::from_settings(
            config.cache.log_stats_interval_ms,
            config.cache.bar_retention_days,
        ),
    );
    let monitor_handle = monitor.spawn(shutdown_rx.clone());

    let ctx = AppContext {
        repo,
        broker,
        cache,
        config,
    };
    let mut orchestrator = Orchestrator::new(ctx, Arc::new(NullBarSource));

    // SIGINT/SIGTERM flip the shutdown channel; the run loop drains and
    // disconnects before returning.
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("SIGTERM handler installs");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(shutdown_rx).await;
    let _ = monitor_handle.await;
    Ok(())
}
