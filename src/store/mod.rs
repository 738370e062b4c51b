mod http;
mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::model::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection-level failure; the request may not have reached the store.
    Transport(String),
    Status(u16),
    Decode(String),
    /// The store understood the request and refused it.
    Rejected(String),
    NotFound,
    Timeout,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Transport(e) => write!(f, "transport error: {e}"),
            StoreError::Status(code) => write!(f, "unexpected status {code}"),
            StoreError::Decode(e) => write!(f, "malformed response: {e}"),
            StoreError::Rejected(reason) => write!(f, "rejected: {reason}"),
            StoreError::NotFound => write!(f, "not found"),
            StoreError::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}

impl StoreError {
    /// Worth retrying unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::Timeout | StoreError::Status(500..=599))
    }
}

/// The remote data service the sync engine mirrors.
///
/// Range fetches return every entity intersecting `[span.start, span.end)`.
/// Lookups return `Ok(None)` when the store has no such entity.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn tasks_in_range(&self, span: Span, project: Option<ProjectId>) -> Result<Vec<Task>, StoreError>;

    async fn claims_in_range(&self, span: Span) -> Result<Vec<ResourceClaim>, StoreError>;

    async fn task(&self, key: TaskKey) -> Result<Option<Task>, StoreError>;

    async fn tasks_in_group(&self, group_id: u64) -> Result<Vec<Task>, StoreError>;

    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> Result<(), StoreError>;

    async fn copy_task(&self, id: TaskId) -> Result<(), StoreError>;

    /// Changes after `cursor`, in feed order. The store may hold the request
    /// open until something changes.
    async fn changes_since(&self, cursor: Option<u64>) -> Result<Vec<ChangeRecord>, StoreError>;

    async fn most_recent_change_number(&self) -> Result<Option<u64>, StoreError>;

    /// Earliest start and latest end of a project's tasks.
    async fn project_time_window(&self, project: ProjectId) -> Result<Option<Span>, StoreError>;

    async fn resources(&self) -> Result<Vec<Resource>, StoreError>;

    async fn config(&self) -> Result<serde_json::Value, StoreError>;

    async fn server_time(&self) -> Result<Ms, StoreError>;

    async fn recent_log_events(&self) -> Result<Vec<LogEvent>, StoreError>;
}
