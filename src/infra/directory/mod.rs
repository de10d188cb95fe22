// Directory implementations: SQLite for real deployments, DashMap for tests
// and database-less preview runs.

pub mod in_memory;
pub mod sqlite_directory;

pub use in_memory::InMemoryDirectory;
pub use sqlite_directory::SqliteDirectory;
