// ABOUTME: Library root for mls-replicator
// ABOUTME: Incremental replication of MLS Grid resources into local JSON storage

pub mod config;
pub mod credentials;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod fetch;
pub mod lock;
pub mod pacing;
pub mod query;
pub mod replicator;
pub mod resource;
pub mod sink;

pub use config::{DebugProfile, ReplicatorConfig};
pub use credentials::{CredentialProvider, EnvCredentialProvider, StaticCredentialProvider};
pub use cursor::{CursorStore, FileCursorStore, MemoryCursorStore};
pub use driver::{DriverConfig, PaginationDriver, RunStats, StopReason};
pub use error::{ReplicationError, Result};
pub use fetch::{FetchError, FetchResponse, Fetcher, HttpFetcher, Page, Record};
pub use pacing::Pacer;
pub use query::{ReplicationMode, ReplicationQuery};
pub use replicator::Replicator;
pub use resource::{ResourceKind, ResourceRegistry, ResourceSpec};
pub use sink::{JsonFileSink, MemorySink, RecordSink};
