//! NFL Line Movement Logger
//!
//! Polls The Odds API on a weekly schedule, appends every snapshot to daily
//! and per-game CSV files, and serves the dashboard JSON routes.
//!
//! Modes:
//! - `RUN_ONCE=true`: one ingestion cycle, then exit
//! - `WEB_ONLY=true`: dashboard only, no upstream calls
//! - default: dashboard plus the scheduler loop

use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tracing::{error, info, warn};

use line_movement::config::Config;
use line_movement::dashboard::{self, AppState, HealthState};
use line_movement::feed::{OddsSource, TheOddsApi};
use line_movement::ingest::{is_operational_failure, IngestionPipeline};
use line_movement::quota::QuotaTracker;
use line_movement::schedule::{utc_offset, WeeklySchedule};
use line_movement::store::{AppendBackend, SnapshotStore};

/// Runs one cycle and folds the outcome into the health state.
async fn run_cycle<S: OddsSource, B: AppendBackend>(
    pipeline: &IngestionPipeline<S, B>,
    health: &HealthState,
) {
    let start = std::time::Instant::now();

    match pipeline.run_ingestion_cycle().await {
        Ok(report) => {
            health.record_success(report.records_written).await;
            for warning in &report.warnings {
                warn!("{}", warning);
            }
            info!(
                "Cycle completed: {} rows in {:?} ({}/{} calls this month, {} remaining)",
                report.records_written,
                start.elapsed(),
                report.quota_stats.calls_this_month,
                report.quota_stats.monthly_limit,
                report.quota_stats.remaining
            );
        }
        Err(e) if !is_operational_failure(&e) => {
            warn!("Cycle skipped: {}", e);
        }
        Err(e) => {
            health.record_error().await;
            error!("Cycle failed: {}", e);
        }
    }
}

/// Main scheduling loop: one cycle on startup, then one per slot.
async fn run_scheduler<S: OddsSource, B: AppendBackend>(
    pipeline: &IngestionPipeline<S, B>,
    schedule: &WeeklySchedule,
    health: &HealthState,
) -> Result<()> {
    info!(
        "Starting scheduler ({} calls/week, ~{} calls/month)",
        schedule.calls_per_week(),
        schedule.projected_monthly_calls()
    );

    run_cycle(pipeline, health).await;

    loop {
        let next = schedule
            .next_after(Utc::now())
            .context("schedule has no slots")?;
        info!("Next run at {}", next.with_timezone(&schedule.offset()));

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        run_cycle(pipeline, health).await;
    }
}

async fn bind(port: u16) -> Result<tokio::net::TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Dashboard listening on {}", addr);
    Ok(listener)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("line_movement=info".parse()?),
        )
        .init();

    info!("NFL Line Movement Logger v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let open_store = || {
        SnapshotStore::open_dir(
            &config.data_dir,
            &config.daily_file_prefix,
            config.games_path(),
        )
    };
    let quota = QuotaTracker::new(config.usage_path(), config.monthly_limit);
    let health = HealthState::new();

    let app = dashboard::router(AppState::new(open_store(), quota.clone(), health.clone()));

    if config.web_only {
        info!("Running in web-only mode (WEB_ONLY=true), no API calls will be made");
        axum::serve(bind(config.port).await?, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("Dashboard server failed")?;
        return Ok(());
    }

    let feed_config = config
        .feed
        .clone()
        .context("Feed configuration missing")?;
    info!(
        "Polling {} ({} / {}) with key {}",
        feed_config.sport,
        feed_config.regions,
        feed_config.markets,
        feed_config.redacted_key()
    );
    let pipeline = IngestionPipeline::new(TheOddsApi::new(feed_config)?, open_store(), quota);

    // Check if running in one-shot mode (manual trigger)
    if config.run_once {
        info!("Running in one-shot mode (RUN_ONCE=true)");
        let report = pipeline.run_ingestion_cycle().await.map_err(|e| {
            error!("One-shot cycle failed: {}", e);
            e
        })?;
        for warning in &report.warnings {
            warn!("{}", warning);
        }
        info!(
            "One-shot cycle completed: {} games, {} rows, {} skipped, {} calls remaining",
            report.games, report.records_written, report.skipped_count, report.quota_stats.remaining
        );
        return Ok(());
    }

    let listener = bind(config.port).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Dashboard server error: {}", e);
        }
    });

    let schedule = WeeklySchedule::steady_flow(utc_offset(config.schedule_utc_offset_hours));
    if schedule.projected_monthly_calls() > config.monthly_limit as usize {
        warn!(
            "Schedule projects ~{} calls/month against a limit of {}; late-month cycles will be refused",
            schedule.projected_monthly_calls(),
            config.monthly_limit
        );
    }

    // Handle shutdown gracefully (continuous mode)
    tokio::select! {
        result = run_scheduler(&pipeline, &schedule, &health) => {
            if let Err(e) = result {
                error!("Scheduler error: {:?}", e);
            }
        }
        _ = shutdown_signal() => {}
    }

    Ok(())
}
