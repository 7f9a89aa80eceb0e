//! Persistent task store (SQLite via sqlx).
//!
//! Four logical tables keyed by task id: task records, paused tasks,
//! modified tasks, and resume data, plus the spill table used by the
//! callback bridge. Rows on the non-record tables carry a last-modified
//! timestamp for age-based purging.

pub mod db;
mod kv;
pub mod migrate;
mod records;
mod spill;
pub mod types;

#[cfg(test)]
mod tests;

pub use db::{TaskStore, DEFAULT_PURGE_AGE};
pub use migrate::MigrationSource;
pub use spill::SpilledUpdate;
pub use types::*;
