mod lock_manager;
mod locks;
mod wait_for_graph;

pub use lock_manager::{DeadlockInfo, LockManager, LockResult};
pub use locks::{LockMode, LockObject, LockTarget, LOCK_MODE_COUNT};
