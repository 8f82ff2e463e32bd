//! convoy-state — embedded object store for Convoy.
//!
//! Backed by [redb](https://docs.rs/redb), holds the proposals (service
//! instances), nodes, active roles, and the persisted proposal queue.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Instances are keyed `{service}/{instance}`, nodes and roles by name, and
//! the queue is a single snapshot row.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Every call runs in its own redb
//! transaction, so a write is visible to every later read.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
