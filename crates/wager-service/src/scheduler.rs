//! Background jobs: the regulatory escrow check and periodic backups.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use wager_adapters::BackupManager;
use wager_core::RegulatoryController;

/// Run the escrow check every `period`. Failures are logged and retried on the next tick.
pub fn spawn_regulatory_loop(regulatory: RegulatoryController, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_secs = period.as_secs(), "regulatory scheduler started");
        loop {
            ticker.tick().await;
            match regulatory.check_and_transfer().await {
                Ok(check) if check.transferred => {
                    info!(amount = check.amount, transfers = check.transfers.len(), "escrow transfer completed");
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, kind = err.kind(), "regulatory check failed"),
            }
        }
    })
}

pub fn spawn_backup_loop(backups: Arc<BackupManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so startup is not slowed by a dump.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = backups.create_backup().await {
                error!(error = %err, directory = %backups.directory().display(), "scheduled backup failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wager_core::{Caller, FlagRequest, WagerEngine, WagerEngineConfig};

    #[tokio::test]
    async fn regulatory_loop_moves_escrow_for_an_active_flag() {
        let mut config = WagerEngineConfig::default();
        config.regulatory.initial_platform_float = 10_000;
        let engine = WagerEngine::bootstrap(config).await.unwrap();
        engine
            .admin()
            .raise_flag(
                &Caller::system(),
                FlagRequest {
                    reason: "regulator order".to_string(),
                    effective_from: None,
                    effective_until: None,
                    repeatable: false,
                },
            )
            .await
            .unwrap();

        let handle = spawn_regulatory_loop(engine.regulatory().clone(), Duration::from_secs(3_600));
        for _ in 0..50 {
            if engine.store().platform_float().await.unwrap() != 10_000 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();

        assert_eq!(engine.store().platform_float().await.unwrap(), 8_000);
    }
}
