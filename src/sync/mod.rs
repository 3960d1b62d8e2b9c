//! Synchronization primitives built on wait queues
//!
//! All primitives here are single-address-space objects shared by reference
//! among routines. They never cross the worker boundary; see the proxy
//! module for the read-only snapshots that do.

pub mod mutex;
pub mod once;
pub mod rwmutex;
pub mod semaphore;
pub mod waitgroup;

pub use mutex::{FairMutex, Mutex};
pub use once::Once;
pub use rwmutex::RwMutex;
pub use semaphore::Semaphore;
pub use waitgroup::WaitGroup;
