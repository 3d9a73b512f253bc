pub mod distributed_lock;

pub use distributed_lock::{DistributedLock, LockToken};
