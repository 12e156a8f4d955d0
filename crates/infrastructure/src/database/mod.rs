pub mod memory;
pub mod sqlite;

pub use memory::{MemoryStore, MemoryTransaction, MemoryTransactionManager};
pub use sqlite::{SqliteTransaction, SqliteTransactionManager};
