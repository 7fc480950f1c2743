//! # Mooring Engine
//!
//! Pure logic behind an offline object store for a remote-object service.
//!
//! This crate has no knowledge of files, databases or the network. It defines
//! the values objects hold, how local edits are queued and merged, and how
//! queries are matched and ordered. The `mooring-store` crate wires it to disk.
//!
//! ## Core Concepts
//!
//! ### Values and pointers
//!
//! Objects hold JSON fields. References to other objects are tagged
//! [`Pointer`] values keyed by the referenced object's local id, never by its
//! server id, so they stay valid before the target is first saved remotely.
//!
//! ### Field operations
//!
//! Edits are expressed as [`FieldOperation`]s (`Set`, `Delete`, `Increment`,
//! `Add`, `AddUnique`, `Remove`, `Relation`). Two edits of the same key merge
//! into one; incompatible pairs fail with [`Error::MergeType`].
//!
//! ### Object state
//!
//! [`ObjectState`] keeps the server-confirmed snapshot apart from the queue of
//! pending [`OperationSet`]s. The estimate seen by callers and queries is the
//! snapshot with every pending set applied.
//!
//! ### Queries
//!
//! A [`QueryState`] describes a query in the remote `where` dialect. A
//! [`Matcher`] compiled from it tests [`Candidate`]s; [`order`] sorts and
//! windows the results.
//!
//! ## Quick Start
//!
//! ```rust
//! use mooring_engine::{Candidate, FieldOperation, Matcher, ObjectState, QueryState};
//! use serde_json::json;
//!
//! // 1. Edit an object
//! let mut state = ObjectState::new("Post");
//! state.perform_operation("score", FieldOperation::set(json!(5))).unwrap();
//! state.perform_operation("score", FieldOperation::increment(2)).unwrap();
//! assert_eq!(state.estimated_value("score"), Some(json!(7)));
//!
//! // 2. Freeze the edits for sending
//! let outgoing = state.begin_save(false).unwrap();
//! assert_eq!(outgoing.to_body(), json!({"score": 7}));
//!
//! // 3. Match it locally
//! let query = QueryState::builder("Post").greater_than("score", json!(5)).build();
//! let matcher = Matcher::compile(&query, Vec::new()).unwrap();
//! assert!(matcher.matches(&Candidate::from_state("local-1", &state), None));
//! ```

pub mod clock;
pub mod error;
pub mod matcher;
pub mod operation;
pub mod operation_set;
pub mod order;
pub mod query;
pub mod record;
pub mod schema;
pub mod state;
pub mod value;

// Re-export main types at crate root
pub use clock::{EnqueueClock, EnqueueStamp};
pub use error::Error;
pub use matcher::{has_read_access, has_write_access, Candidate, Matcher, Subquery};
pub use operation::FieldOperation;
pub use operation_set::{OperationSet, OperationSetId};
pub use order::{apply_window, sort_candidates, SortKey};
pub use query::{QueryBuilder, QueryState};
pub use record::{LocalObjectRecord, RowPayload};
pub use schema::{ClassRegistry, ClassSchema, FieldDef, FieldType};
pub use state::ObjectState;
pub use value::{Fields, Pointer};

/// Type aliases for clarity
pub type LocalId = String;
pub type ClassName = String;
pub type ObjectId = String;
