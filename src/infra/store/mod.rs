// Implementations of the SharedStore port.

pub mod in_memory;
pub mod redis_store;
pub mod sqlite_store;

// Re-export for convenience
pub use in_memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use sqlite_store::SqliteSharedStore;
