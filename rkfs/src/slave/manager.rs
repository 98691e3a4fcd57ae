use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use futures::future::join_all;
use libvfs::{SlaveOps, TransferHandle, VfsError};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{MasterError, Result};
use crate::lock;
use crate::protocol::{
    CommandBody, FrameReader, FrameWriter, MasterFrame, NamedError, SlaveFrame, read_frame,
    write_frame,
};
use crate::slave::record::{self, RecordOrigin, SlaveRecord};
use crate::slave::remote::RemoteSlave;
use crate::slave::status::SlaveStatus;
use crate::slave::SlaveContext;
use crate::stats::Window;

/// Every slave the master knows, online or not.
pub struct SlaveManager {
    ctx: Arc<SlaveContext>,
    slaves: RwLock<BTreeMap<String, Arc<RemoteSlave>>>,
    // serialises identify + validate + connect
    accepting: Mutex<()>,
}

impl SlaveManager {
    /// Loads every slave record from the slaves directory.
    pub fn load(ctx: Arc<SlaveContext>) -> Result<Arc<Self>> {
        let dir = ctx.settings.slaves_dir.clone();
        fs::create_dir_all(&dir)?;
        let manager = Arc::new(SlaveManager {
            ctx,
            slaves: RwLock::new(BTreeMap::new()),
            accepting: Mutex::new(()),
        });
        for name in record::list_records(&dir)? {
            match manager.load_slave(&name) {
                Ok(slave) => debug!("Loaded slave '{}'", slave.name()),
                Err(e) => error!("Error loading slave '{name}': {e}"),
            }
        }
        info!(
            "Loaded {} slaves from {}",
            manager.read_slaves().len(),
            dir.display()
        );
        Ok(manager)
    }

    fn load_slave(&self, name: &str) -> Result<Arc<RemoteSlave>> {
        let dir = &self.ctx.settings.slaves_dir;
        let (rec, origin) =
            record::read_record(dir, name)?.ok_or_else(|| MasterError::UnknownSlave(name.to_string()))?;
        if rec.name != name {
            return Err(MasterError::CaseMismatch {
                requested: name.to_string(),
                registered: rec.name,
            });
        }
        if origin == RecordOrigin::Legacy {
            record::write_record(dir, &rec)?;
            let old = record::legacy_record_path(dir, name);
            match fs::remove_file(&old) {
                Ok(()) => info!("Converted slave '{name}' to the current record format"),
                Err(e) => error!("Failed to delete old slave file {}: {e}", old.display()),
            }
        }
        let slave = RemoteSlave::new(Arc::clone(&self.ctx), rec);
        self.write_slaves()
            .insert(name.to_string(), Arc::clone(&slave));
        Ok(slave)
    }

    fn read_slaves(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<RemoteSlave>>> {
        self.slaves
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_slaves(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Arc<RemoteSlave>>> {
        self.slaves
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn context(&self) -> &Arc<SlaveContext> {
        &self.ctx
    }

    /// Looks up a slave by its exact name.
    pub fn remote_slave(&self, name: &str) -> Result<Arc<RemoteSlave>> {
        let slaves = self.read_slaves();
        if let Some(slave) = slaves.get(name) {
            return Ok(Arc::clone(slave));
        }
        match slaves.keys().find(|k| k.eq_ignore_ascii_case(name)) {
            Some(registered) => Err(MasterError::CaseMismatch {
                requested: name.to_string(),
                registered: registered.clone(),
            }),
            None => Err(MasterError::UnknownSlave(name.to_string())),
        }
    }

    /// Registers a new slave and writes its record right away.
    pub fn new_slave(&self, name: &str) -> Result<Arc<RemoteSlave>> {
        let mut slaves = self.write_slaves();
        if let Some(existing) = slaves.keys().find(|k| k.eq_ignore_ascii_case(name)) {
            return Err(MasterError::SlaveExists(existing.clone()));
        }
        let rec = SlaveRecord::new(name);
        record::write_record(&self.ctx.settings.slaves_dir, &rec)?;
        let slave = RemoteSlave::new(Arc::clone(&self.ctx), rec);
        slaves.insert(name.to_string(), Arc::clone(&slave));
        info!("Added slave '{name}'");
        Ok(slave)
    }

    /// Forgets a slave: its record, its session and every file it held.
    pub fn del_slave(&self, name: &str) -> Result<()> {
        let slave = self.remote_slave(name)?;
        record::delete_record(&self.ctx.settings.slaves_dir, name)?;
        slave.mark_deleted();
        slave.set_offline("Slave has been deleted");
        self.write_slaves().remove(name);
        let removed = self.ctx.vfs.root_handle().remove_slave(name)?;
        info!("Deleted slave '{name}', {removed} files lost their copy on it");
        Ok(())
    }

    /// All slaves, sorted by name.
    pub fn slaves(&self) -> Vec<Arc<RemoteSlave>> {
        self.read_slaves().values().cloned().collect()
    }

    pub fn has_available_slaves(&self) -> bool {
        self.read_slaves().values().any(|s| s.is_available())
    }

    pub fn available_remote_slaves(&self) -> Result<Vec<Arc<RemoteSlave>>> {
        let available: Vec<_> = self
            .read_slaves()
            .values()
            .filter(|s| s.is_available())
            .cloned()
            .collect();
        if available.is_empty() {
            return Err(MasterError::NoAvailableSlave);
        }
        Ok(available)
    }

    /// Up to `count` available slaves ordered by free space, skipping
    /// `exempt`. Ties keep name order.
    pub fn find_slaves_by_space(
        &self,
        count: usize,
        exempt: &BTreeSet<String>,
        ascending: bool,
    ) -> Vec<Arc<RemoteSlave>> {
        let mut candidates: Vec<(u64, Arc<RemoteSlave>)> = self
            .read_slaves()
            .values()
            .filter(|s| !exempt.contains(s.name()))
            .filter_map(|s| {
                s.slave_status_available()
                    .ok()
                    .map(|st| (st.disk.space_available, Arc::clone(s)))
            })
            .collect();
        candidates.sort_by(|(a, sa), (b, sb)| {
            let by_space = if ascending { a.cmp(b) } else { b.cmp(a) };
            by_space.then_with(|| sa.name().cmp(sb.name()))
        });
        candidates.into_iter().take(count).map(|(_, s)| s).collect()
    }

    pub fn find_smallest_free_slave(&self) -> Option<Arc<RemoteSlave>> {
        self.find_slaves_by_space(1, &BTreeSet::new(), true)
            .into_iter()
            .next()
    }

    pub fn find_largest_free_slave(&self) -> Option<Arc<RemoteSlave>> {
        self.find_slaves_by_space(1, &BTreeSet::new(), false)
            .into_iter()
            .next()
    }

    /// Sum of the status of every available slave.
    pub fn all_status(&self) -> SlaveStatus {
        self.all_status_array()
            .into_iter()
            .fold(SlaveStatus::default(), SlaveStatus::append)
    }

    pub fn all_status_array(&self) -> Vec<SlaveStatus> {
        self.read_slaves()
            .values()
            .filter_map(|s| s.slave_status_available().ok())
            .collect()
    }

    /// Identifies and validates a freshly connected slave, then hands the
    /// stream to it. A rejected slave is told why before the stream is
    /// dropped.
    pub async fn accept_slave<R, W>(
        &self,
        peer: SocketAddr,
        mut reader: FrameReader<R>,
        mut writer: FrameWriter<W>,
    ) -> Result<Arc<RemoteSlave>>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let hello = tokio::time::timeout(
            self.ctx.settings.handshake_timeout,
            read_frame::<_, SlaveFrame>(&mut reader),
        )
        .await
        .map_err(|_| MasterError::Protocol(format!("{peer} did not identify in time")))??;
        let name = match hello {
            Some(SlaveFrame::Hello { name }) => name,
            Some(other) => {
                return Err(MasterError::Protocol(format!(
                    "{peer} sent {other:?} before identifying"
                )));
            }
            None => {
                return Err(MasterError::Protocol(format!(
                    "{peer} closed the connection before identifying"
                )));
            }
        };

        let rejected = {
            let _guard = lock(&self.accepting);
            match self.validate(&name, peer) {
                Ok(slave) => {
                    slave.connect(peer, reader, writer)?;
                    return Ok(slave);
                }
                Err(e) => e,
            }
        };
        warn!("rejected slave connection from {peer} as '{name}': {rejected}");
        let frame = MasterFrame::Error(NamedError {
            name: error_name(&rejected).to_string(),
            message: rejected.to_string(),
        });
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!("could not tell {peer} about the rejection: {e}");
        }
        Err(rejected)
    }

    fn validate(&self, name: &str, peer: SocketAddr) -> Result<Arc<RemoteSlave>> {
        let slave = self.remote_slave(name)?;
        if slave.is_online() {
            return Err(MasterError::AlreadyOnline(name.to_string()));
        }
        if !slave.check_connect(peer.ip()) {
            return Err(MasterError::AddressRejected {
                addr: peer.ip().to_string(),
                slave: name.to_string(),
            });
        }
        Ok(slave)
    }

    /// Aborts every transfer whose file lies under `path`.
    pub fn cancel_transfers_in_directory(&self, path: &str, reason: &str) {
        for slave in self.slaves() {
            for transfer in slave.transfers() {
                if transfer.is_under(path) {
                    debug!("aborting transfer {} of {}", transfer.id(), transfer.path());
                    transfer.abort(reason);
                }
            }
        }
    }

    /// Issues the delete to every slave and waits for the online ones.
    /// Slaves that cannot take it now get it queued.
    pub async fn delete_on_all_slaves(&self, path: &str) {
        let mut waiting = Vec::new();
        for slave in self.slaves() {
            match slave
                .issue(CommandBody::Delete {
                    path: path.to_string(),
                })
                .await
            {
                Ok(pending) => waiting.push((slave, pending)),
                Err(e) => {
                    debug!("delete of {path} queued for {}: {e}", slave.name());
                    slave.add_queue_delete(path);
                }
            }
        }
        let timeout = self.ctx.settings.delete_timeout;
        let results = join_all(waiting.into_iter().map(|(slave, pending)| async move {
            let result = slave.fetch_response(pending, timeout).await;
            (slave, result)
        }))
        .await;
        for (slave, result) in results {
            if let Err(e) = result {
                slave.delete_failed(path, e);
            }
        }
    }

    pub fn rename_on_all_slaves(&self, from: &str, to_dir: &str, to_name: &str) {
        for slave in self.slaves() {
            slave.rename_detached(from, to_dir, to_name);
        }
    }

    /// Clears the statistics of `window` on every slave.
    pub fn reset(&self, window: Window) {
        for slave in self.slaves() {
            slave.reset_stats(window);
            if let Err(e) = slave.commit_now() {
                error!("Failed to write statistics of {}: {e}", slave.name());
            }
        }
        debug!("reset {window:?} statistics of all slaves");
    }

    /// Tells every slave to stop, then writes everything pending.
    pub fn shutdown(&self) {
        for slave in self.slaves() {
            slave.shutdown();
        }
        let written = self.ctx.vfs.commits().flush_pending();
        info!("slave manager shut down, {written} records written");
    }
}

fn error_name(e: &MasterError) -> &'static str {
    match e {
        MasterError::UnknownSlave(_) => "SlaveNotFound",
        MasterError::CaseMismatch { .. } => "SlaveNameCase",
        MasterError::AlreadyOnline(_) => "AlreadyOnline",
        MasterError::AddressRejected { .. } => "AddressRejected",
        _ => "Error",
    }
}

#[async_trait]
impl SlaveOps for SlaveManager {
    fn is_known(&self, slave: &str) -> bool {
        self.read_slaves().contains_key(slave)
    }

    fn is_available(&self, slave: &str) -> bool {
        self.read_slaves()
            .get(slave)
            .map(|s| s.is_available())
            .unwrap_or(false)
    }

    fn available_slaves(&self) -> BTreeSet<String> {
        self.read_slaves()
            .values()
            .filter(|s| s.is_available())
            .map(|s| s.name().to_string())
            .collect()
    }

    fn simple_delete(&self, slave: &str, path: &str) {
        match self.remote_slave(slave) {
            Ok(s) => s.delete_detached(path),
            Err(e) => debug!("delete of {path} skipped: {e}"),
        }
    }

    fn simple_rename(&self, slave: &str, from: &str, to_dir: &str, to_name: &str) {
        match self.remote_slave(slave) {
            Ok(s) => s.rename_detached(from, to_dir, to_name),
            Err(e) => debug!("rename of {from} skipped: {e}"),
        }
    }

    async fn delete_on_all_slaves(&self, path: &str) {
        SlaveManager::delete_on_all_slaves(self, path).await
    }

    fn rename_on_all_slaves(&self, from: &str, to_dir: &str, to_name: &str) {
        SlaveManager::rename_on_all_slaves(self, from, to_dir, to_name)
    }

    fn cancel_transfers_in_directory(&self, path: &str, reason: &str) {
        SlaveManager::cancel_transfers_in_directory(self, path, reason)
    }

    async fn checksum(&self, slave: &str, path: &str) -> libvfs::Result<u64> {
        let slave = self.remote_slave(slave).map_err(VfsError::from)?;
        slave.checksum_for_path(path).await.map_err(VfsError::from)
    }
}
