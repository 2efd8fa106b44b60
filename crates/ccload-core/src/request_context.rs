//! Per-call ephemeral state (spec §3 RequestContext). The first-byte
//! timer and outbound cancellation token use scoped acquisition: both
//! are released on every exit path via `Drop`/`select!`, per spec §9
//! "timer release on every exit path".

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::auth::CallerIdentity;

pub struct RequestContext {
    pub caller: CallerIdentity,
    pub model: Option<String>,
    pub is_stream: bool,
    pub started_at: std::time::Instant,
    pub cancellation: CancellationToken,
    first_byte_timeout: Duration,
}

impl RequestContext {
    pub fn new(caller: CallerIdentity, model: Option<String>, is_stream: bool, first_byte_timeout: Duration) -> Self {
        Self {
            caller,
            model,
            is_stream,
            started_at: std::time::Instant::now(),
            cancellation: CancellationToken::new(),
            first_byte_timeout,
        }
    }

    /// Races `fut` against the first-byte deadline and cancellation.
    /// Returns `Ok(value)` on success, `Err(TimedOut)` if the deadline
    /// elapsed first, `Err(Cancelled)` if the inbound call was aborted.
    pub async fn race_first_byte<F, T>(&self, fut: F) -> Result<T, FirstByteOutcome>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(FirstByteOutcome::Cancelled),
            _ = tokio::time::sleep(self.first_byte_timeout) => Err(FirstByteOutcome::TimedOut),
            value = fut => Ok(value),
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstByteOutcome {
    TimedOut,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_future_wins_race() {
        let ctx = RequestContext::new(CallerIdentity::default(), None, false, Duration::from_secs(5));
        let result = ctx.race_first_byte(async { 42 }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn timeout_fires_before_slow_future() {
        let ctx = RequestContext::new(CallerIdentity::default(), None, false, Duration::from_millis(10));
        let result = ctx
            .race_first_byte(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                42
            })
            .await;
        assert_eq!(result, Err(FirstByteOutcome::TimedOut));
    }

    #[tokio::test]
    async fn cancellation_wins_over_slow_future() {
        let ctx = RequestContext::new(CallerIdentity::default(), None, false, Duration::from_secs(5));
        ctx.cancellation.cancel();
        let result = ctx
            .race_first_byte(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                42
            })
            .await;
        assert_eq!(result, Err(FirstByteOutcome::Cancelled));
    }
}
