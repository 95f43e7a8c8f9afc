pub mod db;
pub mod memory;

pub use db::{connect, create_db, DbPool, SqliteStore, StorageError};
pub use memory::MemoryStore;
