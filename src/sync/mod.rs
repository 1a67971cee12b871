//! Synchronization primitives.
//!
//! Thin wrappers over std or parking_lot locks. With the `single_threaded`
//! feature every wrapper compiles down to a borrow-checked cell instead, and
//! types holding one stop being `Sync`.

mod mutex;

pub(crate) use mutex::{Mutex, RwMutex};
