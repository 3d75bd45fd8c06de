//! Data layer module
//!
//! SQLite persistence for federation identities, relationships,
//! idempotency records and the durable job queue.

mod database;
mod models;

pub use database::Database;
pub use models::*;
