pub mod shared_store;

#[cfg(test)]
pub mod testing;

pub use shared_store::{lock_key, rate_limit_key, SharedStore, StoreError};
