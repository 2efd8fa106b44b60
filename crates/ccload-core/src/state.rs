//! Process-wide shared state (spec §9), narrowed from the teacher's
//! provider/credential/user bundle to the channel/key/cooldown/health
//! model this core actually needs.

use std::sync::Arc;

use arc_swap::ArcSwap;
use ccload_common::GlobalConfig;
use ccload_cooldown::CooldownManager;
use ccload_health::HealthCache;
use ccload_selector::Selector;
use ccload_storage::Store;
use tokio::sync::Semaphore;

use crate::channel_cache::ChannelCache;
use crate::forwarder::Forwarder;
use crate::registry::ActiveRequestRegistry;
use crate::retry::RetryOrchestrator;
use crate::telemetry::TelemetrySender;

pub struct AppState {
    pub global: ArcSwap<GlobalConfig>,
    pub store: Arc<dyn Store>,
    pub channels: Arc<ChannelCache>,
    pub cooldowns: Arc<CooldownManager>,
    pub health: Arc<HealthCache>,
    pub selector: Arc<Selector>,
    pub forwarder: Arc<Forwarder>,
    pub retry: Arc<RetryOrchestrator>,
    pub registry: Arc<ActiveRequestRegistry>,
    pub telemetry: TelemetrySender,
    /// Bounds in-flight forwards to `global.max_concurrency` (spec §5).
    /// Settings changes restart the process, so sizing this once at
    /// boot from the initial `GlobalConfig` is sufficient.
    pub concurrency: Arc<Semaphore>,
}

impl AppState {
    pub async fn build(
        global: GlobalConfig,
        store: Arc<dyn Store>,
    ) -> Result<(Arc<Self>, Vec<tokio::task::JoinHandle<()>>), ccload_storage::StorageError> {
        let channels = Arc::new(ChannelCache::new());
        channels.refresh(store.as_ref()).await?;

        let cooldowns = Arc::new(CooldownManager::new(store.clone(), global.cooldown_ceiling_secs));
        cooldowns.load_from_store().await?;

        let health = Arc::new(HealthCache::new());
        health.refresh(store.as_ref(), global.health_window_minutes).await?;

        let selector = Arc::new(Selector::new());
        let forwarder = Arc::new(Forwarder::new());
        let retry = Arc::new(RetryOrchestrator::new(
            channels.clone(),
            cooldowns.clone(),
            health.clone(),
            selector.clone(),
            forwarder.clone(),
        ));
        let registry = Arc::new(ActiveRequestRegistry::new());
        let (telemetry, handles) = crate::telemetry::spawn(store.clone(), global.log_buffer, global.log_workers);
        let concurrency = Arc::new(Semaphore::new(global.max_concurrency.max(1)));

        Ok((
            Arc::new(Self {
                global: ArcSwap::from_pointee(global),
                store,
                channels,
                cooldowns,
                health,
                selector,
                forwarder,
                retry,
                registry,
                telemetry,
                concurrency,
            }),
            handles,
        ))
    }

    /// Re-reads channels and key secrets from the store and invalidates
    /// the selector's SWRR state, per spec §4.2 step 5.
    pub async fn refresh_channels(&self) -> Result<(), ccload_storage::StorageError> {
        self.channels.refresh(self.store.as_ref()).await?;
        self.selector.invalidate();
        Ok(())
    }

    pub fn config(&self) -> Arc<GlobalConfig> {
        self.global.load_full()
    }
}

/// Spawns the periodic health-cache refresh loop driven by `global`'s
/// configured interval; exits once `shutdown` fires.
pub fn spawn_health_refresh(
    state: Arc<AppState>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let config = state.config();
    ccload_health::spawn_refresh_loop(
        state.health.clone(),
        state.store.clone(),
        config.health_window_minutes,
        config.health_update_interval_seconds,
        shutdown,
    )
}

const LOG_CLEANUP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3600);

/// Spawns the periodic log-retention cleanup loop; a negative
/// `log_retention_days` means "forever" and the loop only watches
/// for shutdown. Exits once `shutdown` fires.
pub fn spawn_log_cleanup(
    state: Arc<AppState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LOG_CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let retention_days = state.config().log_retention_days;
                    if retention_days < 0 {
                        continue;
                    }
                    let cutoff = time::OffsetDateTime::now_utc() - time::Duration::days(retention_days);
                    match state.store.cleanup_logs_before(cutoff).await {
                        Ok(deleted) if deleted > 0 => {
                            tracing::info!(event = "log_cleanup", deleted, "removed logs past retention window")
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(event = "log_cleanup_failed", error = %err, "log retention cleanup failed")
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
