use std::time::Duration;

use anyhow::Result;
use stagecal_core::{ReconcileError, Reconciler, Trigger};
use tokio::time::{MissedTickBehavior, interval};

use crate::render::Render;

/// Trigger a scheduled run every `sync.interval_secs` until interrupted.
pub async fn run(reconciler: &Reconciler) -> Result<()> {
    let period = Duration::from_secs(reconciler.config().sync.interval_secs());
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(interval_secs = period.as_secs(), "Watching");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping");
                return Ok(());
            }
        }

        match reconciler.trigger(Trigger::Scheduled).await {
            Ok(summary) => println!("{}", summary.render()),
            Err(ReconcileError::RunInProgress) => tracing::debug!("Previous run still active"),
            // a broken ledger or store wiring will not heal by waiting
            Err(e) => return Err(e.into()),
        }
    }
}
