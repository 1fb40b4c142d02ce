//! Nexus Background Worker
//!
//! Handles scheduled jobs including:
//! - Webhook replay for unprocessed events (every minute)
//! - Flagging events that exhausted their retries (every 5 minutes)
//! - Billing invariant checks (hourly)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use nexus_billing::BillingService;
use nexus_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};

/// Events re-driven per replay pass
const REPLAY_BATCH_SIZE: i64 = 50;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Nexus Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // Without Stripe configuration there is nothing to replay
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Replay unprocessed webhook events (every minute)
    // Transient database failures back off and retry within the pass; events
    // that keep failing burn one attempt per pass until exhausted.
    let replay_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = replay_billing.clone();
            Box::pin(async move {
                let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
                let result = Retry::spawn(strategy, || async {
                    billing.webhooks.replay_unprocessed(REPLAY_BATCH_SIZE).await
                })
                .await;

                match result {
                    Ok(summary) if summary.attempted > 0 => {
                        info!(
                            attempted = summary.attempted,
                            succeeded = summary.succeeded,
                            failed = summary.failed,
                            "Webhook replay pass complete"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Webhook replay pass failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Webhook replay (every minute)");

    // Job 2: Flag exhausted events for manual review (every 5 minutes)
    let exhausted_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let billing = exhausted_billing.clone();
            Box::pin(async move {
                match billing.webhooks.flag_exhausted_events().await {
                    Ok(flagged) if !flagged.is_empty() => {
                        warn!(
                            count = flagged.len(),
                            "Flagged exhausted webhook events for manual review"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Failed to flag exhausted events"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Exhausted event review flagging (every 5 minutes)");

    // Job 3: Billing invariant checks (hourly)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(
                            checks_run = summary.checks_run,
                            "All billing invariants hold"
                        );
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check run failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (hourly)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Nexus Worker started successfully with 4 scheduled jobs");

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
