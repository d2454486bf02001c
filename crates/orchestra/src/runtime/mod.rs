//! Runtime components for process management

pub mod completion;
pub mod exit;
pub mod process;
pub mod waiter;

pub use completion::*;
pub use exit::*;
pub use process::*;
pub use waiter::*;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
