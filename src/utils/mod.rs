mod number;
mod other;

pub use number::{align_to_word, ceil_dev};
pub use other::{init_log, lock_state, HandyRwLock};
