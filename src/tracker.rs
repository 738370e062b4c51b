use std::collections::{BTreeSet, VecDeque};

use crate::model::*;

/// Which one-hour buckets have been fetched and merged.
///
/// A bucket is keyed by its start instant, always hour-aligned.
#[derive(Debug, Clone, Default)]
pub struct LoadedRanges {
    buckets: BTreeSet<Ms>,
}

/// Window edges as the tracker sees them: floor/ceil to whole hours.
pub fn hour_aligned(window: &Span) -> Span {
    Span::new(floor_to(window.start, HOUR_MS), ceil_to(window.end, HOUR_MS))
}

impl LoadedRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, bucket: Ms) -> bool {
        self.buckets.contains(&bucket)
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Mark every whole-hour bucket in `[lower, upper)`.
    pub fn mark_loaded(&mut self, chunk: &Span) {
        let mut bucket = floor_to(chunk.start, HOUR_MS);
        while bucket < chunk.end {
            self.buckets.insert(bucket);
            bucket += HOUR_MS;
        }
    }

    /// Chunks covering exactly the unloaded buckets of `window`.
    ///
    /// Adjacent unloaded buckets are grouped up to `factor` per chunk; a chunk
    /// never spans a loaded bucket. Chunks starting before `now` are queued at
    /// the front (latest first), the rest are appended in time order.
    pub fn gaps(&self, window: &Span, factor: u32, now: Ms) -> VecDeque<Span> {
        let aligned = hour_aligned(window);
        let max_len = HOUR_MS * Ms::from(factor.max(1));
        let mut chunks = VecDeque::new();

        let mut ts = aligned.start;
        while ts < aligned.end {
            if self.is_loaded(ts) {
                ts += HOUR_MS;
                continue;
            }
            let limit = aligned.end.min(ts + max_len);
            let mut upper = ts;
            while upper < limit && !self.is_loaded(upper) {
                upper += HOUR_MS;
            }
            let chunk = Span::new(ts, upper);
            if chunk.start < now {
                chunks.push_front(chunk);
            } else {
                chunks.push_back(chunk);
            }
            ts = upper;
        }
        chunks
    }

    /// Forget buckets outside `window`, so revisiting them fetches again.
    /// The bucket starting at `window.end` is kept, like the entities the
    /// cache retains on that edge.
    pub fn prune(&mut self, window: &Span) {
        let aligned = hour_aligned(window);
        self.buckets
            .retain(|b| *b >= aligned.start && *b <= aligned.end);
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}
