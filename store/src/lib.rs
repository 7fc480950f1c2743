//! # Mooring Store
//!
//! Disk-backed half of Mooring: a SQLite object store that keeps one live
//! handle per object, named pins that retain objects on disk, local query
//! execution, and a durable queue of commands replayed against the remote
//! service once it is reachable.
//!
//! ```no_run
//! use mooring_store::{Config, Mooring, NoSession};
//! # use mooring_store::queue::{Command, CommandError, CommandResult, CommandRunner, RunOptions};
//! # use std::sync::Arc;
//! # struct Offline;
//! # #[async_trait::async_trait]
//! # impl CommandRunner for Offline {
//! #     async fn run(&self, _: &Command, _: RunOptions) -> Result<CommandResult, CommandError> {
//! #         Err(CommandError::Retryable("offline".into()))
//! #     }
//! # }
//! # async fn demo() -> mooring_store::Result<()> {
//! let mooring = Mooring::open(&Config::new("app.sqlite"), Arc::new(Offline), Arc::new(NoSession)).await?;
//!
//! let post = mooring.store.create_object("Post")?;
//! post.set("title", "hello")?;
//! mooring.pins.pin(&[post.clone()], None).await?;
//! let pending = mooring.queue.save_eventually(&post).await?;
//! # drop(pending);
//! mooring.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod objects;
pub mod offline_store;
pub mod pins;
mod query;
pub mod queue;

pub use config::{Config, ConfigError, FileLocations, QueueConfig};
pub use context::Mooring;
pub use db::Database;
pub use error::{QueueError, Result, StoreError};
pub use objects::{IdentityMap, LocalObject, ObjectRef};
pub use offline_store::OfflineStore;
pub use pins::{PinRegistry, DEFAULT_PIN, EVENTUALLY_PIN};
pub use queue::{
    Command, CommandError, CommandResult, CommandRunner, Connectivity, EventuallyQueue,
    NoSession, PendingCommand, QueueEvent, QueueState, Reachability, SessionProvider,
};
