//! Database module for SQLite persistence.

mod database;
mod eventually;
mod pins;
mod records;

pub use database::*;
pub use eventually::*;
pub use pins::*;
pub use records::*;
