pub mod mutex;

pub use self::mutex::{Mutex, MutexGuard};
