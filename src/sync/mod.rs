//! Synchronization primitives built atop the scheduler.

pub mod lock;
pub mod semaphore;

pub use lock::{Lock, LockOutcome};
pub use semaphore::{DownOutcome, Semaphore};
