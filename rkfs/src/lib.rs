//! Master daemon of rkfs: the slave registry on top of the `libvfs`
//! namespace, and the QUIC listener slaves connect to.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod protocol;
pub mod server;
pub mod slave;
pub mod stats;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `m`, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
