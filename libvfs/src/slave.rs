//! Seams between the namespace and the slave registry.
//!
//! The namespace never talks to the network itself. Physical deletes,
//! renames and checksum lookups are routed through these traits, which the
//! daemon implements on top of its slave sessions.

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::Result;

/// An in-flight upload or download tracked on a file.
pub trait TransferHandle: Send + Sync {
    /// Asks the transfer to stop. Must not block on the remote side.
    fn abort(&self, reason: &str);

    fn is_finished(&self) -> bool;
}

/// Registry-wide operations the namespace needs.
#[async_trait]
pub trait SlaveOps: Send + Sync {
    /// `true` if a record for `slave` exists, online or not.
    fn is_known(&self, slave: &str) -> bool;

    /// `true` if `slave` is online and done remerging.
    fn is_available(&self, slave: &str) -> bool;

    /// Names of every available slave.
    fn available_slaves(&self) -> BTreeSet<String>;

    /// Physically deletes `path` on one slave. Queued for replay when the
    /// slave is unreachable.
    fn simple_delete(&self, slave: &str, path: &str);

    /// Physically renames `from` to `to_dir/to_name` on one slave. Queued
    /// for replay when the slave is unreachable.
    fn simple_rename(&self, slave: &str, from: &str, to_dir: &str, to_name: &str);

    /// Deletes `path` on every known slave and waits for the online ones to
    /// answer.
    async fn delete_on_all_slaves(&self, path: &str);

    /// Renames `from` on every known slave.
    fn rename_on_all_slaves(&self, from: &str, to_dir: &str, to_name: &str);

    /// Aborts every transfer running under `path`.
    fn cancel_transfers_in_directory(&self, path: &str, reason: &str);

    /// Asks one slave for the checksum of `path`.
    async fn checksum(&self, slave: &str, path: &str) -> Result<u64>;
}

/// The slave whose listing is being merged.
pub trait RemergeSlave: Send + Sync {
    fn name(&self) -> &str;

    /// Whether files with an unknown checksum should have one fetched in the
    /// background during remerge.
    fn checksums_on_remerge(&self) -> bool;

    /// Schedules a background checksum fetch for `path`.
    fn queue_checksum(&self, path: &str);

    fn simple_rename(&self, from: &str, to_dir: &str, to_name: &str);

    fn simple_delete(&self, path: &str);
}
