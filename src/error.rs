use crate::model::TaskId;
use crate::store::StoreError;

#[derive(Debug)]
pub enum SyncError {
    NotFound(TaskId),
    /// The remote store refused an optimistic write; the local change was rolled back.
    WriteRejected {
        id: TaskId,
        reason: String,
    },
    Store(StoreError),
    Decode(String),
    PollExhausted {
        attempts: u32,
        pending: Vec<TaskId>,
    },
    Disposed,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotFound(id) => write!(f, "task not found: {id}"),
            SyncError::WriteRejected { id, reason } => {
                write!(f, "write to task {id} rejected, rolled back: {reason}")
            }
            SyncError::Store(e) => write!(f, "remote store: {e}"),
            SyncError::Decode(e) => write!(f, "decode error: {e}"),
            SyncError::PollExhausted { attempts, pending } => {
                write!(f, "gave up after {attempts} attempts; still waiting on {pending:?}")
            }
            SyncError::Disposed => write!(f, "sync context disposed"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}
