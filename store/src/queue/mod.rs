//! Durable command queue.
//!
//! Mutating commands are persisted before they are sent and replayed in
//! enqueue order, one at a time, until the remote service acknowledges them or
//! they fail for good.

mod command;
mod eventually;
mod reachability;
mod store;

pub use command::*;
pub use eventually::*;
pub use reachability::*;
pub use store::*;
