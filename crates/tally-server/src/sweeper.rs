//! Background purge of expired download tokens

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tally_core::config::RegistrySettings;
use tally_core::CancellationToken;
use tally_workflow::ArtifactRegistry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Purge entries past `expires_at + retention` every `sweep_interval` until `shutdown`
pub fn spawn_sweeper(
    registry: Arc<ArtifactRegistry>,
    settings: RegistrySettings,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = settings.sweep_interval().max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    registry.purge_expired(
                        Utc::now(),
                        settings.retention_after_expiry(),
                        settings.delete_files_on_purge,
                    );
                }
            }
        }
        debug!("Registry sweeper stopped");
    })
}
