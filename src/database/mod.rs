// Database module
// SQLite for agent sessions, LanceDB for chunk vectors

pub mod lancedb;
pub mod sqlite;

pub use sqlite::*;
