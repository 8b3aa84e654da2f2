use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::directory::StreamDirectory;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically expires inactive streams and invokes `on_expire` for each one
/// outside of the directory's lock.
pub struct Reaper {
    directory: Arc<StreamDirectory>,
    interval: Duration,
}

impl Reaper {
    pub fn new(directory: Arc<StreamDirectory>, interval: Duration) -> Self {
        let interval = if interval.is_zero() { DEFAULT_INTERVAL } else { interval };
        Self { directory, interval }
    }

    /// Runs until `cancel` fires. `on_expire` is called once per expired
    /// stream id, sequentially, after the sweep that discovered it.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, on_expire: F)
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.directory.expire_inactive(Utc::now());
                    for id in expired {
                        info!(stream_id = %id, "reaping inactive stream");
                        on_expire(id).await;
                    }
                    telemetry::metrics::STREAMS_ACTIVE.set(self.directory.active_count() as i64);
                }
                _ = cancel.cancelled() => {
                    info!("reaper stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn zero_interval_is_coerced_to_default() {
        let directory = Arc::new(StreamDirectory::new(Duration::from_secs(300)));
        let reaper = Reaper::new(directory, Duration::ZERO);
        assert_eq!(reaper.interval, DEFAULT_INTERVAL);
    }

    #[tokio::test]
    async fn expired_stream_triggers_callback_exactly_once() {
        let directory = Arc::new(StreamDirectory::new(Duration::from_millis(10)));
        directory.register("abc", Utc::now() - chrono::Duration::seconds(1));

        let reaper = Reaper::new(directory, Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            reaper
                .run(cancel_clone, |_id| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
