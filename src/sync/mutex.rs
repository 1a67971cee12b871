//! Mutex wrappers - parking_lot if available, std otherwise, no-op cells
//! under `single_threaded`.
//!
//! Only `lock`, `read` and `write` are exposed; guard types differ per
//! backend and are used exclusively through deref.

#[cfg(all(feature = "parking_lot", not(feature = "single_threaded")))]
mod imp {
    pub use parking_lot::Mutex;

    /// Read/write lock with the same method names as the std wrapper.
    pub struct RwMutex<T>(parking_lot::RwLock<T>);

    impl<T> RwMutex<T> {
        pub const fn new(value: T) -> Self {
            Self(parking_lot::RwLock::new(value))
        }

        pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, T> {
            self.0.read()
        }

        pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, T> {
            self.0.write()
        }
    }
}

#[cfg(all(not(feature = "parking_lot"), not(feature = "single_threaded")))]
mod imp {
    use std::sync::{Mutex as StdMutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

    /// Thin wrapper around std::sync::Mutex.
    pub struct Mutex<T>(StdMutex<T>);

    impl<T> Mutex<T> {
        pub const fn new(value: T) -> Self {
            Self(StdMutex::new(value))
        }

        pub fn lock(&self) -> MutexGuard<'_, T> {
            self.0.lock().expect("mutex poisoned")
        }
    }

    /// Thin wrapper around std::sync::RwLock.
    pub struct RwMutex<T>(RwLock<T>);

    impl<T> RwMutex<T> {
        pub const fn new(value: T) -> Self {
            Self(RwLock::new(value))
        }

        pub fn read(&self) -> RwLockReadGuard<'_, T> {
            self.0.read().expect("rwlock poisoned")
        }

        pub fn write(&self) -> RwLockWriteGuard<'_, T> {
            self.0.write().expect("rwlock poisoned")
        }
    }
}

#[cfg(feature = "single_threaded")]
mod imp {
    use std::cell::{Ref, RefCell, RefMut};

    /// Borrow-checked stand-in for a mutex. Not `Sync`; misuse across threads
    /// is rejected at compile time rather than hidden behind a runtime flag.
    pub struct Mutex<T>(RefCell<T>);

    impl<T> Mutex<T> {
        pub const fn new(value: T) -> Self {
            Self(RefCell::new(value))
        }

        pub fn lock(&self) -> RefMut<'_, T> {
            self.0.borrow_mut()
        }
    }

    /// Borrow-checked stand-in for a read/write lock.
    pub struct RwMutex<T>(RefCell<T>);

    impl<T> RwMutex<T> {
        pub const fn new(value: T) -> Self {
            Self(RefCell::new(value))
        }

        pub fn read(&self) -> Ref<'_, T> {
            self.0.borrow()
        }

        pub fn write(&self) -> RefMut<'_, T> {
            self.0.borrow_mut()
        }
    }
}

pub(crate) use imp::{Mutex, RwMutex};
