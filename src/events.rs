use std::collections::VecDeque;

use crate::model::{LogEvent, Ms};

/// Server log events, oldest first, kept for a fixed age.
#[derive(Debug, Clone)]
pub struct EventLog {
    events: VecDeque<LogEvent>,
    retention: Ms,
}

impl EventLog {
    pub fn new(retention: Ms) -> Self {
        Self {
            events: VecDeque::new(),
            retention,
        }
    }

    pub fn push(&mut self, event: LogEvent, now: Ms) {
        self.events.push_back(event);
        self.prune(now);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = LogEvent>, now: Ms) {
        self.events.extend(events);
        self.prune(now);
    }

    /// Drop events older than the retention age.
    pub fn prune(&mut self, now: Ms) {
        self.events.retain(|e| now - e.timestamp <= self.retention);
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
