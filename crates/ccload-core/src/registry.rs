//! Active-request registry (spec §4.9): a read-only-from-outside view
//! of in-flight forwards, keyed by a generated request id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ccload_common::ChannelId;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub request_id: String,
    pub channel_id: Option<ChannelId>,
    pub model: Option<String>,
    pub started_at: OffsetDateTime,
    pub caller_token_id: Option<String>,
}

#[derive(Default)]
pub struct ActiveRequestRegistry {
    entries: Mutex<HashMap<String, (ActiveRequest, CancellationToken)>>,
}

/// Guard returned by `register`; removes the entry on drop so every
/// orchestrator exit path (return, `?`, panic unwind, or a detached
/// streaming task outliving the handler) releases it. Holds an `Arc`
/// rather than a borrow so it can be moved into a spawned task.
pub struct ActiveRequestGuard {
    registry: Arc<ActiveRequestRegistry>,
    request_id: String,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.registry.entries.lock().unwrap().remove(&self.request_id);
    }
}

impl ActiveRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes `self` by `Arc` (a cheap refcount bump) rather than `&self`
    /// so the returned guard can own its registry handle and outlive the
    /// caller's stack frame (needed once a streaming response detaches
    /// into its own task).
    pub fn register(
        self: Arc<Self>,
        model: Option<String>,
        caller_token_id: Option<String>,
        cancellation: CancellationToken,
    ) -> (String, ActiveRequestGuard) {
        let request_id = Uuid::new_v4().to_string();
        let entry = ActiveRequest {
            request_id: request_id.clone(),
            channel_id: None,
            model,
            started_at: OffsetDateTime::now_utc(),
            caller_token_id,
        };
        self.entries
            .lock()
            .unwrap()
            .insert(request_id.clone(), (entry, cancellation));
        (
            request_id.clone(),
            ActiveRequestGuard {
                registry: self,
                request_id,
            },
        )
    }

    pub fn set_channel(&self, request_id: &str, channel_id: ChannelId) {
        if let Some((entry, _)) = self.entries.lock().unwrap().get_mut(request_id) {
            entry.channel_id = Some(channel_id);
        }
    }

    pub fn snapshot(&self) -> Vec<ActiveRequest> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|(entry, _)| entry.clone())
            .collect()
    }

    pub fn cancel(&self, request_id: &str) -> bool {
        let guard = self.entries.lock().unwrap();
        match guard.get(request_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight request; used on graceful shutdown so
    /// streaming forwards close their upstream connection promptly
    /// instead of blocking the shutdown deadline.
    pub fn cancel_all(&self) {
        for (_, token) in self.entries.lock().unwrap().values() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_removes_entry_on_drop() {
        let registry = Arc::new(ActiveRequestRegistry::new());
        {
            let (id, _guard) =
                registry.clone().register(Some("m".into()), None, CancellationToken::new());
            assert_eq!(registry.len(), 1);
            assert!(registry.snapshot().iter().any(|e| e.request_id == id));
        }
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn cancel_fires_token() {
        let registry = Arc::new(ActiveRequestRegistry::new());
        let token = CancellationToken::new();
        let (id, _guard) = registry.clone().register(None, None, token.clone());
        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_all_fires_every_token() {
        let registry = Arc::new(ActiveRequestRegistry::new());
        let token_a = CancellationToken::new();
        let token_b = CancellationToken::new();
        let (_, _guard_a) = registry.clone().register(None, None, token_a.clone());
        let (_, _guard_b) = registry.clone().register(None, None, token_b.clone());
        registry.cancel_all();
        assert!(token_a.is_cancelled());
        assert!(token_b.is_cancelled());
    }
}
