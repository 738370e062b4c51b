use std::str::FromStr;
use std::time::Duration;

use crate::model::{Ms, MINUTE_MS};

/// What to do with a chunk whose fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFailurePolicy {
    /// Treat the failure as loaded; the range is refetched only after it is
    /// pruned and re-entered.
    MarkLoaded,
    /// Requeue the chunk until `max_attempts` fetches have failed, then leave
    /// its buckets unloaded so the next window request tries again.
    Retry { max_attempts: u32 },
}

impl FromStr for ChunkFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mark-loaded" => Ok(Self::MarkLoaded),
            "retry" => Ok(Self::Retry { max_attempts: DEFAULT_CHUNK_ATTEMPTS }),
            other => other
                .strip_prefix("retry:")
                .and_then(|n| n.parse().ok())
                .map(|max_attempts| Self::Retry { max_attempts })
                .ok_or_else(|| format!("unknown chunk failure policy: {other}")),
        }
    }
}

pub const DEFAULT_CHUNK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Chunk fetches in flight at once.
    pub max_concurrent_chunks: usize,
    /// Delay between starting successive chunk workers.
    pub chunk_stagger: Duration,
    pub chunk_timeout: Duration,
    pub chunk_failure: ChunkFailurePolicy,
    /// Client-side limit on one long-poll round trip.
    pub feed_timeout: Duration,
    pub feed_backoff: Duration,
    /// Window edges are floored/ceiled to this many minutes.
    pub window_granularity_min: u32,
    pub auto_follow: bool,
    pub auto_follow_interval: Duration,
    /// Width of the auto-follow window.
    pub zoom: Ms,
    pub event_retention: Ms,
    pub clock_sync_interval: Duration,
    pub clock_sync_timeout: Duration,
    pub track_claims: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 3,
            chunk_stagger: Duration::from_millis(250),
            chunk_timeout: Duration::from_secs(30),
            chunk_failure: ChunkFailurePolicy::Retry { max_attempts: DEFAULT_CHUNK_ATTEMPTS },
            feed_timeout: Duration::from_secs(300),
            feed_backoff: Duration::from_secs(1),
            window_granularity_min: 5,
            auto_follow: true,
            auto_follow_interval: Duration::from_secs(5),
            zoom: 24 * 60 * MINUTE_MS,
            event_retention: 6 * 60 * MINUTE_MS,
            clock_sync_interval: Duration::from_secs(60),
            clock_sync_timeout: Duration::from_secs(1),
            track_claims: false,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_ms(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

impl SyncConfig {
    /// Defaults overridden by any `RAE_SYNC_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_concurrent_chunks: env_parse::<usize>("RAE_SYNC_MAX_CONCURRENT_CHUNKS")
                .unwrap_or(d.max_concurrent_chunks)
                .max(1),
            chunk_stagger: env_ms("RAE_SYNC_CHUNK_STAGGER_MS").unwrap_or(d.chunk_stagger),
            chunk_timeout: env_ms("RAE_SYNC_CHUNK_TIMEOUT_MS").unwrap_or(d.chunk_timeout),
            chunk_failure: env_parse("RAE_SYNC_CHUNK_FAILURE").unwrap_or(d.chunk_failure),
            feed_timeout: env_ms("RAE_SYNC_FEED_TIMEOUT_MS").unwrap_or(d.feed_timeout),
            feed_backoff: env_ms("RAE_SYNC_FEED_BACKOFF_MS").unwrap_or(d.feed_backoff),
            window_granularity_min: env_parse::<u32>("RAE_SYNC_WINDOW_GRANULARITY_MIN")
                .unwrap_or(d.window_granularity_min)
                .max(1),
            auto_follow: env_parse("RAE_SYNC_AUTO_FOLLOW").unwrap_or(d.auto_follow),
            auto_follow_interval: env_ms("RAE_SYNC_AUTO_FOLLOW_INTERVAL_MS")
                .unwrap_or(d.auto_follow_interval),
            zoom: env_parse::<Ms>("RAE_SYNC_ZOOM_MIN").map_or(d.zoom, |m| m * MINUTE_MS),
            event_retention: env_parse::<Ms>("RAE_SYNC_EVENT_RETENTION_MIN")
                .map_or(d.event_retention, |m| m * MINUTE_MS),
            clock_sync_interval: env_ms("RAE_SYNC_CLOCK_SYNC_INTERVAL_MS")
                .unwrap_or(d.clock_sync_interval),
            clock_sync_timeout: d.clock_sync_timeout,
            track_claims: env_parse("RAE_SYNC_TRACK_CLAIMS").unwrap_or(d.track_claims),
        }
    }

    pub fn granularity_ms(&self) -> Ms {
        Ms::from(self.window_granularity_min.max(1)) * MINUTE_MS
    }
}
