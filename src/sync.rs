#[cfg(loom)]
pub use loom::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex, RwLock,
};

#[cfg(not(loom))]
pub use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex, RwLock,
};
