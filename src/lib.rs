pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod feed;
pub mod loader;
pub mod lookup;
pub mod model;
pub mod mutator;
pub mod observability;
pub mod resources;
pub mod selection;
pub mod store;
pub mod tracker;
pub mod window;

pub use config::{ChunkFailurePolicy, SyncConfig};
pub use context::SyncContext;
pub use error::SyncError;
pub use store::{HttpStore, MemoryStore, RemoteStore, StoreError};
