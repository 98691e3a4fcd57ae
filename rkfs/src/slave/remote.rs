//! One slave: its persisted record and, while it is connected, its session.
//!
//! A session owns four tasks. The writer drains outbound commands onto the
//! stream. The reader dispatches responses to their waiting callers by
//! index, queues remerge listings and keeps the connection alive with pings.
//! The remerge worker feeds listings through the namespace and the checksum
//! worker fills in checksums the remerge asked for. Every task is tied to
//! the session generation it was started for, so a stale task can never
//! take down a newer connection.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use libvfs::{Commitable, RemergeError, RemergeSlave, TransferHandle};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::PartialRemergeMode;
use crate::error::{MasterError, Result};
use crate::lock;
use crate::protocol::{
    Command, CommandBody, FrameReader, FrameWriter, INDEX_POOL_SIZE, MasterFrame, RemoteErrorKind,
    Response, ResponseBody, SlaveFrame, index_name, read_frame, write_frame,
};
use crate::slave::record::{self, QueuedOperation, SlaveRecord};
use crate::slave::status::{DiskStatus, SlaveStatus, TransferDirection, TransferStatus};
use crate::slave::transfer::RemoteTransfer;
use crate::slave::{RemergeMessage, SlaveContext, SlaveEventKind};
use crate::stats::{TransferStats, Window};

/// How often the reader wakes up without traffic.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Poll interval while the slave's remerge is paused, so it resumes quickly.
const PAUSED_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CHECKSUM_DRAIN_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_ERROR_TIMEOUT_MS: i64 = 60_000;
const DEFAULT_MAX_ERRORS: i64 = 5;

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A command that was sent and whose answer has not been collected yet.
pub struct PendingResponse {
    index: String,
    rx: oneshot::Receiver<ResponseBody>,
}

impl PendingResponse {
    pub fn index(&self) -> &str {
        &self.index
    }
}

#[derive(Default)]
struct QueueDepth {
    remerge: AtomicUsize,
    checksums: AtomicUsize,
}

struct Session {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<MasterFrame>,
    remerge: mpsc::UnboundedSender<RemergeMessage>,
    checksums: mpsc::UnboundedSender<String>,
    depth: Arc<QueueDepth>,
    cancel: CancellationToken,
}

struct LinkState {
    session: Option<Session>,
    generation: u64,
    status: Option<DiskStatus>,
    available: bool,
    remerging: bool,
    init_remerge_completed: bool,
    errors: i64,
    last_network_error: i64,
    last_response: Instant,
    last_command: Instant,
}

pub struct RemoteSlave {
    name: String,
    ctx: Arc<SlaveContext>,
    me: Weak<RemoteSlave>,
    record: Mutex<SlaveRecord>,
    state: Mutex<LinkState>,
    index_pool: Mutex<Vec<String>>,
    index_freed: Notify,
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseBody>>>,
    transfers: Mutex<HashMap<u64, Arc<RemoteTransfer>>>,
    remerge_paused: AtomicBool,
    deleted: AtomicBool,
}

impl RemoteSlave {
    pub fn new(ctx: Arc<SlaveContext>, record: SlaveRecord) -> Arc<RemoteSlave> {
        Arc::new_cyclic(|me| RemoteSlave {
            name: record.name.clone(),
            ctx,
            me: me.clone(),
            record: Mutex::new(record),
            state: Mutex::new(LinkState {
                session: None,
                generation: 0,
                status: None,
                available: false,
                remerging: false,
                init_remerge_completed: false,
                errors: 0,
                last_network_error: now_millis(),
                last_response: Instant::now(),
                last_command: Instant::now(),
            }),
            index_pool: Mutex::new(Vec::new()),
            index_freed: Notify::new(),
            pending: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            remerge_paused: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn record(&self) -> SlaveRecord {
        lock(&self.record).clone()
    }

    /// Schedules the record for writing.
    pub fn commit(&self) {
        if let Some(me) = self.me.upgrade() {
            self.ctx.vfs.commits().add(me);
        }
    }

    /// Writes the record now.
    pub fn commit_now(&self) -> Result<()> {
        self.ctx.vfs.commits().remove(self.commit_key());
        record::write_record(&self.ctx.settings.slaves_dir, &self.record())
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.ctx.vfs.commits().remove(self.commit_key());
    }

    // ---- record: properties, masks, queue, stats ----

    pub fn property(&self, key: &str) -> Option<String> {
        lock(&self.record).properties.get(key).cloned()
    }

    pub fn property_or(&self, key: &str, default: &str) -> String {
        self.property(key).unwrap_or_else(|| default.to_string())
    }

    pub fn set_property(&self, key: &str, value: &str) {
        lock(&self.record)
            .properties
            .insert(key.to_string(), value.to_string());
        self.commit();
    }

    pub fn remove_property(&self, key: &str) -> Result<String> {
        let value = lock(&self.record)
            .properties
            .remove(key)
            .ok_or_else(|| MasterError::KeyNotFound(key.to_string()))?;
        self.commit();
        Ok(value)
    }

    /// `true` if `keyword` is listed in the space separated `keywords`
    /// property.
    pub fn is_member_of(&self, keyword: &str) -> bool {
        self.property("keywords")
            .map(|k| k.split_whitespace().any(|w| w == keyword))
            .unwrap_or(false)
    }

    pub fn add_mask(&self, mask: &str) -> Result<()> {
        lock(&self.record).masks.add_mask(mask)?;
        self.commit();
        Ok(())
    }

    pub fn remove_mask(&self, mask: &str) -> bool {
        let removed = lock(&self.record).masks.remove_mask(mask);
        if removed {
            self.commit();
        }
        removed
    }

    pub fn masks(&self) -> Vec<String> {
        lock(&self.record)
            .masks
            .iter()
            .map(|m| m.as_str().to_string())
            .collect()
    }

    /// `true` if `addr` satisfies one of the slave's masks.
    pub fn check_connect(&self, addr: IpAddr) -> bool {
        lock(&self.record).masks.check(addr)
    }

    pub fn queued_operations(&self) -> Vec<QueuedOperation> {
        lock(&self.record).queue.iter().cloned().collect()
    }

    /// Remembers a delete to replay when the slave comes back. Only an
    /// offline slave queues; an online one should have been sent the
    /// command.
    pub fn add_queue_delete(&self, path: &str) -> bool {
        self.add_queue(QueuedOperation {
            source: path.to_string(),
            destination: None,
        })
    }

    pub fn add_queue_rename(&self, from: &str, to: &str) -> bool {
        self.add_queue(QueuedOperation {
            source: from.to_string(),
            destination: Some(to.to_string()),
        })
    }

    fn add_queue(&self, op: QueuedOperation) -> bool {
        if self.is_online() {
            error!(
                "slave {} is online, refusing to queue {:?}",
                self.name, op
            );
            return false;
        }
        debug!("queued {:?} for {}", op, self.name);
        lock(&self.record).queue.push_back(op);
        self.commit();
        true
    }

    pub fn stats(&self) -> TransferStats {
        lock(&self.record).stats
    }

    pub fn reset_stats(&self, window: Window) {
        lock(&self.record).stats.reset(window);
    }

    // ---- link state ----

    pub fn is_online(&self) -> bool {
        lock(&self.state).session.is_some()
    }

    /// Online and done with the first remerge.
    pub fn is_available(&self) -> bool {
        lock(&self.state).available
    }

    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    pub fn is_remerging(&self) -> bool {
        lock(&self.state).remerging
    }

    pub fn is_remerge_paused(&self) -> bool {
        self.remerge_paused.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.state).session.as_ref().map(|s| s.peer)
    }

    pub fn disk_status(&self) -> Option<DiskStatus> {
        lock(&self.state).status
    }

    /// Milliseconds since the epoch the slave was last online. Now if it is
    /// online, 0 if it never was.
    pub fn last_time_online(&self) -> i64 {
        if self.is_online() {
            return now_millis();
        }
        self.property("lastOnline")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn actual_timeout(&self) -> Duration {
        self.property("timeout")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.ctx.settings.response_timeout)
    }

    fn is_generation(&self, generation: u64) -> bool {
        let st = lock(&self.state);
        st.session.is_some() && st.generation == generation
    }

    fn since_last_response(&self) -> Duration {
        lock(&self.state).last_response.elapsed()
    }

    /// Status of an available slave: disk space plus the load of its
    /// running transfers.
    pub fn slave_status_available(&self) -> Result<SlaveStatus> {
        let disk = {
            let st = lock(&self.state);
            if !st.available {
                return Err(MasterError::unavailable(&self.name, "not available"));
            }
            st.status.unwrap_or_default()
        };
        let mut status = SlaveStatus {
            disk,
            ..Default::default()
        };
        for transfer in lock(&self.transfers).values() {
            let ts = transfer.status();
            match ts.direction {
                TransferDirection::Upload => {
                    status.transfers_up += 1;
                    status.throughput_up += ts.speed;
                }
                TransferDirection::Download => {
                    status.transfers_down += 1;
                    status.throughput_down += ts.speed;
                }
            }
        }
        Ok(status)
    }

    /// Counts a network error. Errors decay by one per `errortimeout`
    /// milliseconds; more than `maxerrors` outstanding takes the slave
    /// offline.
    pub fn add_network_error(&self, err: &str) {
        let mut timeout = self
            .property("errortimeout")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_ERROR_TIMEOUT_MS);
        if timeout <= 0 {
            timeout = DEFAULT_ERROR_TIMEOUT_MS;
        }
        let mut max_errors = self
            .property("maxerrors")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(DEFAULT_MAX_ERRORS);
        if max_errors < 0 {
            max_errors = DEFAULT_MAX_ERRORS;
        }
        let now = now_millis();
        let too_many = {
            let mut st = lock(&self.state);
            st.errors -= (now - st.last_network_error) / timeout;
            if st.errors < 0 {
                st.errors = 0;
            }
            st.errors += 1;
            st.last_network_error = now;
            st.errors > max_errors
        };
        if too_many {
            error!("Too many network errors on {} - {err}", self.name);
            self.set_offline(&format!("Too many network errors - {err}"));
        }
    }

    // ---- connection ----

    /// Hands an identified and validated connection to this slave. Fails
    /// with `AlreadyOnline` if another connection got there first.
    pub fn connect<R, W>(
        self: &Arc<Self>,
        peer: SocketAddr,
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (remerge_tx, remerge_rx) = mpsc::unbounded_channel();
        let (crc_tx, crc_rx) = mpsc::unbounded_channel();
        let depth = Arc::new(QueueDepth::default());
        let generation = {
            let mut st = lock(&self.state);
            if st.session.is_some() {
                return Err(MasterError::AlreadyOnline(self.name.clone()));
            }
            st.generation += 1;
            st.session = Some(Session {
                peer,
                outbound: out_tx,
                remerge: remerge_tx,
                checksums: crc_tx,
                depth: Arc::clone(&depth),
                cancel: cancel.clone(),
            });
            st.errors = 0;
            st.last_network_error = now_millis();
            st.init_remerge_completed = false;
            st.remerging = true;
            st.last_response = Instant::now();
            st.last_command = Instant::now();
            st.generation
        };
        {
            let mut pool = lock(&self.index_pool);
            pool.clear();
            pool.extend((0..INDEX_POOL_SIZE).map(index_name));
        }
        lock(&self.pending).clear();
        lock(&self.transfers).clear();
        self.remerge_paused.store(false, Ordering::SeqCst);
        info!("slave {} connected from {peer}", self.name);

        tokio::spawn(Arc::clone(self).write_loop(writer, out_rx, generation, cancel.clone()));
        tokio::spawn(Arc::clone(self).read_loop(reader, generation, cancel));
        tokio::spawn(Arc::clone(self).remerge_worker(remerge_rx, Arc::clone(&depth), generation));
        tokio::spawn(Arc::clone(self).checksum_worker(crc_rx, depth, generation));
        let me = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = Arc::clone(&me).initialize(generation).await {
                warn!("initialising slave {} failed: {e}", me.name);
                me.set_offline_if(generation, &e.to_string());
            }
        });
        Ok(())
    }

    /// Replays queued operations, then asks for the remerge listing and
    /// waits until the slave has sent all of it.
    async fn initialize(self: Arc<Self>, generation: u64) -> Result<()> {
        self.commit();
        self.process_queue().await?;

        let now = now_millis();
        let (partial, cutoff, instant) = match self.ctx.settings.remerge.partial_mode {
            PartialRemergeMode::Off => (false, 0, false),
            PartialRemergeMode::Connect => self.partial_cutoff("lastConnect"),
            PartialRemergeMode::Disconnect => self.partial_cutoff("lastOnline"),
            PartialRemergeMode::Instant => {
                self.set_available(true);
                info!("Slave added: '{}' status: {:?}", self.name, self.disk_status());
                self.ctx.publish(&self.name, SlaveEventKind::Added);
                (false, 0, true)
            }
        };
        let pending = self
            .issue(CommandBody::Remerge {
                path: "/".to_string(),
                partial,
                skip_age_cutoff: cutoff,
                start_time: if partial { now } else { 0 },
                instant_online: instant,
            })
            .await?;
        self.fetch_response(pending, Duration::ZERO).await?;

        if !self.is_generation(generation) {
            return Ok(());
        }
        self.put_remerge_queue(RemergeMessage::Completed);
        if self.remerge_paused.swap(false, Ordering::SeqCst) {
            let message =
                "Remerge was paused on slave after completion, issuing resume so not to break manual remerges";
            debug!("{message}");
            self.ctx
                .publish(&self.name, SlaveEventKind::Message(message.to_string()));
            self.send_oneway(CommandBody::RemergeResume)?;
        }
        Ok(())
    }

    fn partial_cutoff(&self, property: &str) -> (bool, i64, bool) {
        match self.property(property).and_then(|v| v.parse::<i64>().ok()) {
            Some(cutoff) => (true, cutoff, false),
            None => {
                warn!(
                    "Slave partial remerge mode set to \"off\" for {} as {property} time is undefined, \
                     this may resolve itself automatically on next slave connection",
                    self.name
                );
                (false, 0, false)
            }
        }
    }

    /// Replays queued deletes and renames in order. An operation stays
    /// queued if the slave fails it for any reason but a missing file.
    pub async fn process_queue(&self) -> Result<()> {
        loop {
            let Some(op) = lock(&self.record).queue.front().cloned() else {
                break;
            };
            let result = match &op.destination {
                None => {
                    let pending = self
                        .issue(CommandBody::Delete {
                            path: op.source.clone(),
                        })
                        .await?;
                    self.fetch_response(pending, self.ctx.settings.delete_timeout)
                        .await
                }
                Some(dest) => {
                    let (to_dir, to_name) = split_destination(dest);
                    let pending = self
                        .issue(CommandBody::Rename {
                            from: op.source.clone(),
                            to_dir,
                            to_name,
                        })
                        .await?;
                    self.fetch_response(pending, self.actual_timeout()).await
                }
            };
            match result {
                Ok(_) => {}
                Err(e) if e.is_file_not_found() => {
                    debug!("queued {:?} on {}: already gone", op, self.name)
                }
                Err(e) => return Err(e),
            }
            {
                let mut rec = lock(&self.record);
                if rec.queue.front() == Some(&op) {
                    rec.queue.pop_front();
                }
            }
            self.commit();
        }
        Ok(())
    }

    fn make_available_after_remerge(&self) {
        lock(&self.state).init_remerge_completed = true;
        self.set_property("lastConnect", &now_millis().to_string());
        if self.ctx.settings.remerge.partial_mode == PartialRemergeMode::Instant {
            lock(&self.state).remerging = false;
            self.ctx.publish(
                &self.name,
                SlaveEventKind::Message("Remerge queueprocess finished".to_string()),
            );
        } else {
            {
                let mut st = lock(&self.state);
                st.available = true;
                st.remerging = false;
            }
            info!("Slave added: '{}' status: {:?}", self.name, self.disk_status());
            self.ctx.publish(&self.name, SlaveEventKind::Added);
        }
    }

    pub fn set_offline(&self, reason: &str) {
        debug!("setOffline() {} {reason}", self.name);
        let (session, was_available, resume) = {
            let mut st = lock(&self.state);
            let mut resume = false;
            if st.remerging {
                resume = self.remerge_paused.swap(false, Ordering::SeqCst);
                st.remerging = false;
            }
            let was_available = st.available;
            st.available = false;
            st.status = None;
            (st.session.take(), was_available, resume)
        };
        if let Some(session) = &session {
            if resume {
                // the slave might be blocked on a paused remerge
                let _ = session.outbound.send(MasterFrame::Command(Command {
                    index: String::new(),
                    body: CommandBody::RemergeResume,
                }));
            }
            session.cancel.cancel();
            self.set_property("lastOnline", &now_millis().to_string());
            info!("slave {} went offline: {reason}", self.name);
        }
        lock(&self.pending).clear();
        lock(&self.transfers).clear();
        self.index_freed.notify_waiters();

        let kind = if was_available {
            SlaveEventKind::Deleted {
                reason: reason.to_string(),
            }
        } else {
            SlaveEventKind::Message(reason.to_string())
        };
        self.ctx.publish(&self.name, kind);
    }

    /// Takes the slave offline only if `generation` is still its current
    /// session.
    fn set_offline_if(&self, generation: u64, reason: &str) {
        if self.is_generation(generation) {
            self.set_offline(reason);
        }
    }

    /// Tells the slave to stop and drops the connection.
    pub fn shutdown(&self) {
        if self.send_oneway(CommandBody::Shutdown).is_ok() {
            self.set_offline("shutdown gracefully");
        }
    }

    // ---- commands ----

    /// Sends a command whose response nobody waits for.
    pub fn send_oneway(&self, body: CommandBody) -> Result<()> {
        self.send_command(Command {
            index: String::new(),
            body,
        })
    }

    fn send_command(&self, command: Command) -> Result<()> {
        let mut st = lock(&self.state);
        let Some(session) = &st.session else {
            return Err(MasterError::unavailable(&self.name, "offline"));
        };
        session
            .outbound
            .send(MasterFrame::Command(command))
            .map_err(|_| MasterError::unavailable(&self.name, "connection closed"))?;
        st.last_command = Instant::now();
        Ok(())
    }

    /// Takes a free command index, waiting while all of them are in use.
    pub async fn fetch_index(&self) -> Result<String> {
        loop {
            if !self.is_online() {
                return Err(MasterError::unavailable(
                    &self.name,
                    "Slave was offline or went offline while fetching an index",
                ));
            }
            if let Some(index) = lock(&self.index_pool).pop() {
                return Ok(index);
            }
            error!(
                "Too many commands sent to {}, need to wait for the slave to process commands",
                self.name
            );
            let _ = tokio::time::timeout(POLL_INTERVAL, self.index_freed.notified()).await;
            let idle = self.since_last_response();
            if idle > self.actual_timeout() && lock(&self.index_pool).is_empty() {
                self.set_offline(&format!(
                    "Index pool exhausted and no response from slave in {} milliseconds",
                    idle.as_millis()
                ));
                return Err(MasterError::unavailable(&self.name, "index pool exhausted"));
            }
        }
    }

    fn release_index(&self, index: String) {
        lock(&self.index_pool).push(index);
        self.index_freed.notify_one();
    }

    /// Sends `body` under a fresh index.
    pub async fn issue(&self, body: CommandBody) -> Result<PendingResponse> {
        let index = self.fetch_index().await?;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(index.clone(), tx);
        let command = Command {
            index: index.clone(),
            body,
        };
        if let Err(e) = self.send_command(command) {
            if lock(&self.pending).remove(&index).is_some() {
                self.release_index(index);
            }
            return Err(e);
        }
        Ok(PendingResponse { index, rx })
    }

    /// Waits for the answer to `pending`. A zero `wait` waits as long as
    /// the slave stays online; running out of time takes the slave offline.
    pub async fn fetch_response(
        &self,
        pending: PendingResponse,
        wait: Duration,
    ) -> Result<ResponseBody> {
        let PendingResponse { index, rx } = pending;
        let received = if wait.is_zero() {
            rx.await.ok()
        } else {
            match tokio::time::timeout(wait, rx).await {
                Ok(r) => r.ok(),
                Err(_) => {
                    if lock(&self.pending).remove(&index).is_some() {
                        self.release_index(index.clone());
                    }
                    self.set_offline(&format!(
                        "Slave has taken too long while waiting for reply {index}"
                    ));
                    return Err(MasterError::unavailable(&self.name, "response timed out"));
                }
            }
        };
        let Some(body) = received else {
            return Err(MasterError::unavailable(
                &self.name,
                "Slave went offline while processing command",
            ));
        };
        match body {
            ResponseBody::Error(err) => match err.kind {
                RemoteErrorKind::NotFound | RemoteErrorKind::Io => Err(MasterError::RemoteIo {
                    slave: self.name.clone(),
                    kind: err.kind,
                    message: err.message,
                }),
                RemoteErrorKind::Other => {
                    error!(
                        "Exception on slave {} that is unable to be handled by the master: {}",
                        self.name, err.message
                    );
                    self.set_offline("Exception on slave that is unable to be handled by the master");
                    Err(MasterError::unavailable(&self.name, err.message))
                }
            },
            other => Ok(other),
        }
    }

    /// Pings an available slave. Any failure takes it offline.
    pub async fn is_available_ping(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        let result = match self.issue(CommandBody::Ping).await {
            Ok(pending) => self.fetch_response(pending, self.actual_timeout()).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => {}
            Err(MasterError::RemoteIo { .. }) => {
                self.set_offline(
                    "The slave encountered an IOException while running ping...this is almost not possible",
                );
                return false;
            }
            Err(e) => {
                self.set_offline(&e.to_string());
                return false;
            }
        }
        self.is_available()
    }

    pub async fn checksum_for_path(&self, path: &str) -> Result<u64> {
        let pending = self
            .issue(CommandBody::Checksum {
                path: path.to_string(),
            })
            .await?;
        match self.fetch_response(pending, self.actual_timeout()).await? {
            ResponseBody::Checksum(checksum) => Ok(checksum),
            other => Err(MasterError::Protocol(format!(
                "{} answered a checksum request with {other:?}",
                self.name
            ))),
        }
    }

    /// Deletes `path` on the slave and waits for the answer. A slave that
    /// cannot be reached, or fails the delete, gets it queued; a path that
    /// is already gone counts as deleted.
    pub async fn simple_delete(&self, path: &str) {
        let result = match self
            .issue(CommandBody::Delete {
                path: path.to_string(),
            })
            .await
        {
            Ok(pending) => self
                .fetch_response(pending, self.ctx.settings.delete_timeout)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.delete_failed(path, e);
        }
    }

    /// Settles a delete the slave did not carry out. A path that is already
    /// gone counts as deleted; anything else is queued for the next
    /// connection, and a slave that failed the delete itself goes offline
    /// first.
    pub(crate) fn delete_failed(&self, path: &str, e: MasterError) {
        if e.is_file_not_found() {
            return;
        }
        if !e.is_unavailable() {
            self.set_offline("IOException deleting file, check logs for specific error");
            error!(
                "IOException deleting {path} on {}, file will be deleted when slave comes online: {e}",
                self.name
            );
        }
        self.add_queue_delete(path);
    }

    /// Renames `from` to `to_dir/to_name` on the slave. Queued if the slave
    /// is offline or fails it.
    pub async fn simple_rename(&self, from: &str, to_dir: &str, to_name: &str) {
        let destination = join_destination(to_dir, to_name);
        let result = match self
            .issue(CommandBody::Rename {
                from: from.to_string(),
                to_dir: to_dir.to_string(),
                to_name: to_name.to_string(),
            })
            .await
        {
            Ok(pending) => self
                .fetch_response(pending, self.actual_timeout())
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_unavailable() => {
                self.add_queue_rename(from, &destination);
            }
            Err(e) => {
                self.set_offline(&e.to_string());
                self.add_queue_rename(from, &destination);
            }
        }
    }

    /// Queues the delete right away when offline, otherwise runs it in the
    /// background.
    pub fn delete_detached(&self, path: &str) {
        if !self.is_online() {
            self.add_queue_delete(path);
            return;
        }
        let path = path.to_string();
        self.spawn_detached(move |me| async move { me.simple_delete(&path).await });
    }

    pub fn rename_detached(&self, from: &str, to_dir: &str, to_name: &str) {
        if !self.is_online() {
            self.add_queue_rename(from, &join_destination(to_dir, to_name));
            return;
        }
        let (from, to_dir, to_name) = (from.to_string(), to_dir.to_string(), to_name.to_string());
        self.spawn_detached(move |me| async move {
            me.simple_rename(&from, &to_dir, &to_name).await
        });
    }

    fn spawn_detached<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<RemoteSlave>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(f(me));
            }
            Err(e) => error!("cannot reach slave {} outside the runtime: {e}", self.name),
        }
    }

    // ---- transfers ----

    pub fn transfers(&self) -> Vec<Arc<RemoteTransfer>> {
        lock(&self.transfers).values().cloned().collect()
    }

    pub(crate) fn abort_transfer(&self, transfer: u64, reason: &str) {
        if let Err(e) = self.send_oneway(CommandBody::AbortTransfer {
            transfer,
            reason: reason.to_string(),
        }) {
            debug!("abort of transfer {transfer} on {} not sent: {e}", self.name);
        }
    }

    fn update_transfer(&self, ts: TransferStatus) {
        let (transfer, created) = {
            let mut transfers = lock(&self.transfers);
            match transfers.get(&ts.transfer) {
                Some(t) => (Arc::clone(t), false),
                None => {
                    let t = Arc::new(RemoteTransfer::new(self.me.clone(), &ts));
                    transfers.insert(ts.transfer, Arc::clone(&t));
                    (t, true)
                }
            }
        };
        transfer.update(&ts);
        if created {
            let file = self.ctx.vfs.file(&ts.path);
            let handle: Arc<dyn TransferHandle> = transfer.clone();
            let registered = match ts.direction {
                TransferDirection::Upload => file.add_upload(handle),
                TransferDirection::Download => file.add_download(handle),
            };
            if let Err(e) = registered {
                debug!("transfer {} on {} has no file record: {e}", ts.transfer, ts.path);
            }
        }
        if ts.finished {
            lock(&self.transfers).remove(&ts.transfer);
            {
                let mut rec = lock(&self.record);
                match ts.direction {
                    TransferDirection::Upload => rec.stats.record_upload(ts.transferred),
                    TransferDirection::Download => rec.stats.record_download(ts.transferred),
                }
            }
            self.commit();
        }
    }

    // ---- remerge and checksum queues ----

    fn session_queues(&self) -> Option<(Arc<QueueDepth>, SessionQueues)> {
        let st = lock(&self.state);
        st.session.as_ref().map(|s| {
            (
                Arc::clone(&s.depth),
                SessionQueues {
                    remerge: s.remerge.clone(),
                    checksums: s.checksums.clone(),
                },
            )
        })
    }

    pub fn put_remerge_queue(&self, message: RemergeMessage) {
        debug!("REMERGE: putting message into queue for {}", self.name);
        let Some((depth, queues)) = self.session_queues() else {
            debug!("{} is offline, dropping remerge message", self.name);
            return;
        };
        depth.remerge.fetch_add(1, Ordering::SeqCst);
        if queues.remerge.send(message).is_err() {
            depth.remerge.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn put_checksum_queue(&self, path: &str) {
        debug!("CRC: putting file into queue {path}");
        let Some((depth, queues)) = self.session_queues() else {
            return;
        };
        depth.checksums.fetch_add(1, Ordering::SeqCst);
        if queues.checksums.send(path.to_string()).is_err() {
            depth.checksums.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Remerge listings waiting to be merged.
    pub fn remerge_queue_len(&self) -> usize {
        self.session_queues()
            .map(|(d, _)| d.remerge.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn remerge_worker(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<RemergeMessage>,
        depth: Arc<QueueDepth>,
        generation: u64,
    ) {
        while let Some(message) = rx.recv().await {
            depth.remerge.fetch_sub(1, Ordering::SeqCst);
            if !self.is_generation(generation) {
                break;
            }
            let listing = match message {
                RemergeMessage::Completed => {
                    info!("REMERGE: queue finished for {}", self.name);
                    while depth.checksums.load(Ordering::SeqCst) > 0 && self.is_generation(generation)
                    {
                        tokio::time::sleep(CHECKSUM_DRAIN_INTERVAL).await;
                    }
                    let first = !lock(&self.state).init_remerge_completed;
                    if first && self.is_generation(generation) {
                        self.make_available_after_remerge();
                    }
                    break;
                }
                RemergeMessage::Listing(listing) => listing,
            };
            let me = Arc::clone(&self);
            let policy = self.ctx.settings.remerge.collision_policy;
            let path = listing.path.clone();
            let merged = tokio::task::spawn_blocking(move || {
                me.ctx.vfs.directory(&listing.path).remerge(
                    &listing.files,
                    &*me,
                    listing.last_modified,
                    policy,
                )
            })
            .await;
            match merged {
                Ok(Ok(report)) => debug!("remerged {path} from {}: {report:?}", self.name),
                Ok(Err(RemergeError::UnexpectedDirectory { slave, path })) => {
                    error!("remerge of {slave} aborted: unknown directory {path}");
                    self.set_offline_if(generation, "Remerge found a directory the master does not know");
                    break;
                }
                Ok(Err(e)) => {
                    error!("IOException during remerge of {path} from {}: {e}", self.name);
                    self.set_offline_if(generation, "IOException during remerge");
                    break;
                }
                Err(e) => {
                    error!("remerge task of {} failed: {e}", self.name);
                    self.set_offline_if(generation, "IOException during remerge");
                    break;
                }
            }
        }
    }

    async fn checksum_worker(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
        depth: Arc<QueueDepth>,
        generation: u64,
    ) {
        while let Some(path) = rx.recv().await {
            if !self.is_generation(generation) {
                depth.checksums.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            let result = self.checksum_for_path(&path).await;
            depth.checksums.fetch_sub(1, Ordering::SeqCst);
            match result {
                Ok(checksum) => match self.ctx.vfs.file(&path).set_checksum(checksum) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {
                        debug!("File deleted while getting crc from slave {path}")
                    }
                    Err(e) => warn!("cannot store checksum of {path}: {e}"),
                },
                Err(e) if e.is_unavailable() => {
                    warn!("Slave {} went offline while processing remerge crc queue.", self.name);
                    break;
                }
                Err(e) => error!(
                    "IOException on remerge getting CRC from slave [{}, {path}]: {e}",
                    self.name
                ),
            }
        }
    }

    // ---- session tasks ----

    async fn write_loop<W>(
        self: Arc<Self>,
        mut writer: FrameWriter<W>,
        mut rx: mpsc::UnboundedReceiver<MasterFrame>,
        generation: u64,
        cancel: CancellationToken,
    ) where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => None,
                frame = rx.recv() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                error!("error sending command to {}: {e}", self.name);
                self.set_offline_if(generation, "error sending command");
                break;
            }
        }
        // flush whatever was queued before the cancel
        while let Ok(frame) = rx.try_recv() {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
        debug!("writer of {} stopped", self.name);
    }

    async fn read_loop<R>(
        self: Arc<Self>,
        mut reader: FrameReader<R>,
        generation: u64,
        cancel: CancellationToken,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        debug!("Starting RemoteSlave for {}", self.name);
        let mut ping: Option<String> = None;
        loop {
            let poll = if self.is_remerge_paused() {
                PAUSED_POLL_INTERVAL
            } else {
                POLL_INTERVAL
            };
            let read = tokio::select! {
                _ = cancel.cancelled() => return,
                read = tokio::time::timeout(poll, read_frame::<_, SlaveFrame>(&mut reader)) => read,
            };
            let frame = match read {
                Err(_) => None,
                Ok(Ok(Some(frame))) => {
                    lock(&self.state).last_response = Instant::now();
                    Some(frame)
                }
                Ok(Ok(None)) => {
                    self.set_offline_if(generation, "Slave closed the connection");
                    return;
                }
                Ok(Err(MasterError::Bincode(e))) => {
                    lock(&self.state).last_response = Instant::now();
                    warn!("undecodable frame from {}: {e}", self.name);
                    self.add_network_error(&e.to_string());
                    None
                }
                Ok(Err(e)) => {
                    error!("IOException reading response from {}: {e}", self.name);
                    self.set_offline_if(generation, "IOException reading response");
                    return;
                }
            };
            if !self.is_generation(generation) {
                return;
            }

            let timeout = self.actual_timeout();
            let (since_response, since_command) = {
                let st = lock(&self.state);
                (st.last_response.elapsed(), st.last_command.elapsed())
            };
            if since_response < timeout
                && (since_response > timeout / 2 || since_command > timeout / 2)
            {
                if let Some(lost) = ping.take() {
                    error!("Ping lost, no response from {}, sending new ping", self.name);
                    if lock(&self.pending).remove(&lost).is_some() {
                        self.release_index(lost);
                    }
                }
                match self.issue(CommandBody::Ping).await {
                    Ok(pending) => ping = Some(pending.index.clone()),
                    Err(e) => debug!("ping to {} not sent: {e}", self.name),
                }
            } else if since_response > timeout {
                self.set_offline_if(
                    generation,
                    &format!(
                        "Slave seems to have gone offline, have not received a response in {} milliseconds",
                        since_response.as_millis()
                    ),
                );
                return;
            }

            self.throttle_remerge();

            let Some(frame) = frame else {
                continue;
            };
            match frame {
                SlaveFrame::Response(response) => {
                    if ping.as_deref() == Some(response.index.as_str()) {
                        ping = None;
                    }
                    self.complete(response);
                }
                SlaveFrame::Remerge(listing) => {
                    self.put_remerge_queue(RemergeMessage::Listing(listing))
                }
                SlaveFrame::DiskStatus(status) => lock(&self.state).status = Some(status),
                SlaveFrame::TransferStatus(ts) => self.update_transfer(ts),
                SlaveFrame::Message(text) => {
                    self.ctx.publish(&self.name, SlaveEventKind::Message(text))
                }
                SlaveFrame::Hello { name } => {
                    warn!("{} sent a second hello as {name}, ignoring", self.name)
                }
            }
        }
    }

    /// Asks the slave to pause its listing while too many are queued and to
    /// resume once the queue has drained.
    fn throttle_remerge(&self) {
        if lock(&self.state).init_remerge_completed {
            return;
        }
        let queued = self.remerge_queue_len();
        let remerge = &self.ctx.settings.remerge;
        if self.is_remerge_paused() {
            if queued <= remerge.resume_threshold && self.send_oneway(CommandBody::RemergeResume).is_ok()
            {
                self.remerge_paused.store(false, Ordering::SeqCst);
                debug!("Issued remerge resume to {}, current remerge queue is {queued}", self.name);
            }
        } else if queued > remerge.pause_threshold
            && self.send_oneway(CommandBody::RemergePause).is_ok()
        {
            self.remerge_paused.store(true, Ordering::SeqCst);
            debug!("Issued remerge pause to {}, current remerge queue is {queued}", self.name);
        }
    }

    fn complete(&self, response: Response) {
        let waiter = lock(&self.pending).remove(&response.index);
        match waiter {
            Some(tx) => {
                self.release_index(response.index);
                // the caller may have given up already
                let _ = tx.send(response.body);
            }
            None => debug!(
                "{} answered unknown index {}: {:?}",
                self.name, response.index, response.body
            ),
        }
    }
}

struct SessionQueues {
    remerge: mpsc::UnboundedSender<RemergeMessage>,
    checksums: mpsc::UnboundedSender<String>,
}

fn join_destination(to_dir: &str, to_name: &str) -> String {
    if to_dir.ends_with('/') {
        format!("{to_dir}{to_name}")
    } else {
        format!("{to_dir}/{to_name}")
    }
}

fn split_destination(dest: &str) -> (String, String) {
    match dest.rfind('/') {
        Some(0) => ("/".to_string(), dest[1..].to_string()),
        Some(i) => (dest[..i].to_string(), dest[i + 1..].to_string()),
        None => ("/".to_string(), dest.to_string()),
    }
}

impl RemergeSlave for RemoteSlave {
    fn name(&self) -> &str {
        &self.name
    }

    fn checksums_on_remerge(&self) -> bool {
        self.ctx.settings.remerge.checksums
    }

    fn queue_checksum(&self, path: &str) {
        self.put_checksum_queue(path);
    }

    fn simple_rename(&self, from: &str, to_dir: &str, to_name: &str) {
        self.rename_detached(from, to_dir, to_name);
    }

    fn simple_delete(&self, path: &str) {
        self.delete_detached(path);
    }
}

impl Commitable for RemoteSlave {
    fn descriptive_name(&self) -> String {
        self.name.clone()
    }

    fn commit_key(&self) -> usize {
        self as *const RemoteSlave as usize
    }

    fn write_to_disk(&self) -> libvfs::Result<()> {
        if self.deleted.load(Ordering::SeqCst) {
            return Ok(());
        }
        record::write_record(&self.ctx.settings.slaves_dir, &self.record())?;
        Ok(())
    }
}

impl fmt::Display for RemoteSlave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr() {
            Some(peer) => write!(
                f,
                "{}:address=[{}]port=[{}]",
                self.name,
                peer.ip(),
                peer.port()
            ),
            None => write!(f, "{}:offline", self.name),
        }
    }
}

impl fmt::Debug for RemoteSlave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteSlave").field(&self.name).finish()
    }
}

impl PartialEq for RemoteSlave {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for RemoteSlave {}

impl PartialOrd for RemoteSlave {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RemoteSlave {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_helpers() {
        assert_eq!(join_destination("/a", "b"), "/a/b");
        assert_eq!(join_destination("/", "b"), "/b");
        assert_eq!(split_destination("/a/b"), ("/a".to_string(), "b".to_string()));
        assert_eq!(split_destination("/b"), ("/".to_string(), "b".to_string()));
    }
}
