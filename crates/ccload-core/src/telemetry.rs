//! Async request-log telemetry (spec §4.8): a bounded channel off the
//! request path feeding a small worker pool that batches writes to the
//! store. A full channel drops the entry rather than blocking a caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ccload_storage::Store;
use ccload_storage::types::LogEntry;
use tokio::sync::mpsc;
use tokio::time::{self as tokio_time, MissedTickBehavior};
use tracing::warn;

const BATCH_SIZE: usize = 100;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DROP_WARN_INTERVAL: u64 = 100;

#[derive(Clone)]
pub struct TelemetrySender {
    tx: mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl TelemetrySender {
    /// Non-blocking: a full buffer drops the entry rather than stalling
    /// the request path. Every `DROP_WARN_INTERVAL`th drop logs a
    /// warning so sustained overload is visible without flooding logs.
    pub fn offer(&self, entry: LogEntry) {
        if self.tx.try_send(entry).is_err() {
            let count = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if count % DROP_WARN_INTERVAL == 0 {
                warn!(event = "telemetry_buffer_full", dropped_total = count, "log entries dropped");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Spawns `workers` writer tasks sharing one receiver end; each batches
/// up to `BATCH_SIZE` entries or flushes every `FLUSH_INTERVAL`,
/// whichever comes first.
pub fn spawn(store: Arc<dyn Store>, buffer: usize, workers: usize) -> (TelemetrySender, Vec<tokio::task::JoinHandle<()>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let mut handles = Vec::with_capacity(workers.max(1));
    for _ in 0..workers.max(1) {
        let store = store.clone();
        let rx = rx.clone();
        handles.push(tokio::spawn(writer_loop(store, rx)));
    }
    (
        TelemetrySender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        handles,
    )
}

async fn writer_loop(store: Arc<dyn Store>, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LogEntry>>>) {
    let mut buffer = Vec::with_capacity(BATCH_SIZE);
    let mut ticker = tokio_time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            entry = async { rx.lock().await.recv().await } => {
                let Some(entry) = entry else {
                    flush(&store, &mut buffer).await;
                    break;
                };
                buffer.push(entry);
                if buffer.len() >= BATCH_SIZE {
                    flush(&store, &mut buffer).await;
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&store, &mut buffer).await;
                }
            }
        }
    }
}

async fn flush(store: &Arc<dyn Store>, buffer: &mut Vec<LogEntry>) {
    if buffer.is_empty() {
        return;
    }
    let mut batch = Vec::new();
    std::mem::swap(buffer, &mut batch);
    if let Err(err) = store.batch_add_logs(&batch).await {
        warn!(event = "telemetry_flush_failed", error = %err, count = batch.len(), "dropping unflushed log batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccload_storage::SeaOrmStore;
    use time::OffsetDateTime;

    fn sample_entry() -> LogEntry {
        LogEntry {
            at: OffsetDateTime::now_utc(),
            channel_id: Some(1),
            model: Some("claude-3-5-sonnet".into()),
            caller_token_hash: None,
            caller_token_id: None,
            status: 200,
            duration_ms: 10,
            first_byte_ms: Some(5),
            is_stream: false,
            message: None,
            input_tokens: 1,
            output_tokens: 2,
            cache_read_input_tokens: 0,
            cache_creation_input_tokens: 0,
            cost_usd: 0.0,
        }
    }

    #[tokio::test]
    async fn offered_entries_are_eventually_persisted() {
        let store = SeaOrmStore::connect("sqlite::memory:").await.unwrap();
        store.sync().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(store);
        let (sender, _handles) = spawn(store.clone(), 16, 1);
        sender.offer(sample_entry());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let now = OffsetDateTime::now_utc();
        let count = store
            .count_logs_range(now - time::Duration::minutes(1), now + time::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn full_buffer_increments_drop_counter() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = TelemetrySender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        sender.offer(sample_entry());
        sender.offer(sample_entry());
        assert_eq!(sender.dropped_count(), 1);
    }
}
