//! rollcall-store — SQLite persistence for reference sets and enrolled identities.

mod sqlite;

pub use sqlite::{BuildInfo, DbError, SqliteStore};
