use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tracing::{error, info};

use super::executor::{Executor, Outcome};
use crate::storage::subscriptions;

/// Counts from one pass over the subscriptions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub sent: usize,
    pub not_due: usize,
    pub failed: usize,
}

/// Run the executor once for every subscription (or just `only`).
///
/// Per-subscription failures are logged and counted; they never stop the
/// batch. Only failing to list the subscriptions is an error.
pub async fn run_batch(
    executor: &Executor,
    force: bool,
    only: Option<i64>,
    now: NaiveDateTime,
) -> anyhow::Result<BatchSummary> {
    let ids = match only {
        Some(id) => vec![id],
        None => subscriptions::ids(executor.pool())?,
    };

    let mut summary = BatchSummary::default();
    for id in ids {
        match executor.execute(id, force, now).await {
            Ok(Outcome::Sent) => summary.sent += 1,
            Ok(Outcome::NotDue) => summary.not_due += 1,
            Err(e) => {
                error!(subscription = id, "Delivery failed: {}", e);
                summary.failed += 1;
            }
        }
    }

    info!(
        sent = summary.sent,
        not_due = summary.not_due,
        failed = summary.failed,
        forced = force,
        "Batch finished"
    );
    Ok(summary)
}

/// Watch mode: run a batch at local wall-clock time every `every` until
/// interrupted.
pub async fn run_scheduler_loop(executor: Arc<Executor>, every: Duration) {
    info!(every_secs = every.as_secs(), "Scheduler loop started");

    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Local::now().naive_local();
                if let Err(e) = run_batch(&executor, false, None, now).await {
                    error!("Failed to run batch: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Scheduler loop stopping");
                break;
            }
        }
    }
}
