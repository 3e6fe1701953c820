pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod fingerprint;
pub mod kv;
pub mod notifications;
pub mod reconciler;
pub mod watcher;

// Re-export common types
pub use crate::api::{ApiClient, ApiError, Credentials, Session, TurnFiles, UserInfo};
pub use crate::auth::{AuthError, AuthEvent, ConnectionState, TokenManager};
pub use crate::config::TurnsyncConfig;
pub use crate::context::{ConnectionContext, ConnectionRegistry, ContextError};
pub use crate::coordinator::{SubmissionEvent, SubmissionOutcome, WatchCoordinator};
pub use crate::fingerprint::{compute_hash, FingerprintError, FingerprintStore};
pub use crate::kv::{KvStore, MemoryStore, SqliteStore};
pub use crate::notifications::{NotificationChannel, NotificationEvent, ResourceChange};
pub use crate::reconciler::{Classification, ReconcileError, Reconciler};
pub use crate::watcher::{
    OrderSubmitter, OrderValidator, SessionWatcher, ValidatedOrder, ValidationError,
    WatchError, WatchedSession,
};
