use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::Ms;
use crate::store::RemoteStore;

pub(crate) fn system_now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

/// "Now" according to the remote store.
///
/// The local machine's clock may be wrong, so the clock keeps an anchor
/// instant and advances it with the monotonic runtime clock; each sync with
/// the server re-anchors it. The reading and its instant live under one lock.
pub struct ServerClock {
    anchor: std::sync::Mutex<(Ms, Instant)>,
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerClock {
    /// Start from the local wall clock.
    pub fn new() -> Self {
        Self::starting_at(system_now_ms())
    }

    pub fn starting_at(now: Ms) -> Self {
        Self {
            anchor: std::sync::Mutex::new((now, Instant::now())),
        }
    }

    pub fn now(&self) -> Ms {
        let (anchor_ms, anchor) = *self.anchor.lock().unwrap_or_else(|e| e.into_inner());
        anchor_ms + anchor.elapsed().as_millis() as Ms
    }

    /// Re-anchor on a server reading.
    pub fn observe(&self, server_now: Ms) {
        *self.anchor.lock().unwrap_or_else(|e| e.into_inner()) = (server_now, Instant::now());
    }
}

/// Background task that re-syncs the clock with the remote store.
pub async fn run_clock_sync(
    clock: Arc<ServerClock>,
    store: Arc<dyn RemoteStore>,
    every: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match tokio::time::timeout(timeout, store.server_time()).await {
            Ok(Ok(server_now)) => clock.observe(server_now),
            Ok(Err(e)) => debug!("clock sync failed: {e}"),
            Err(_) => debug!("clock sync timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn advances_with_runtime_clock() {
        let clock = ServerClock::starting_at(1_000_000);
        assert_eq!(clock.now(), 1_000_000);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.now(), 1_005_000);
    }

    #[tokio::test(start_paused = true)]
    async fn observe_reanchors() {
        let clock = ServerClock::starting_at(0);
        tokio::time::advance(Duration::from_secs(1)).await;
        clock.observe(50_000);
        assert_eq!(clock.now(), 50_000);
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now(), 50_250);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_observe_keeps_reading_and_instant_paired() {
        const DAY: Ms = 86_400_000;
        let clock = Arc::new(ServerClock::starting_at(0));
        let writers: Vec<_> = (1..=4)
            .map(|k| {
                let clock = clock.clone();
                tokio::spawn(async move {
                    for _ in 0..1_000 {
                        clock.observe(k * 100 * DAY);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for _ in 0..4_000 {
            let now = clock.now();
            let offset = now.rem_euclid(100 * DAY);
            assert!(offset < DAY, "reading paired with a foreign instant: {now}");
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }
    }
}
