//! Replicator orchestration (§4.5, C5): the glue between group
//! communication, certification, the ordering monitors and the ring-buffer
//! cache.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cert::{CertIndex, CertOutcome};
use crate::error::{RepError, Result};
use crate::gcache::GCache;
use crate::gsn::{Gsn, UNDEFINED};
use crate::monitor::{Monitor, MonitorEvent};
use crate::stats::ReplicatorStats;
use crate::trx::{TrxHandleMaster, TrxHandleSlave, TrxState};
use crate::writeset::Writeset;
use crate::ReplicatorConfig;

/// The replicator's collaborator for total ordering: hands a gathered
/// writeset to the group and gets back its assigned place in the global
/// sequence (§6).
#[async_trait]
pub trait GroupComm: Send + Sync {
    async fn send(&self, writeset: &Writeset) -> Result<(Gsn, Gsn)>;
    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
}

/// Database-facing callbacks invoked on the applier path (§6).
#[async_trait]
pub trait ApplyCallbacks: Send + Sync {
    async fn apply_cb(&self, writeset: &Writeset) -> Result<()>;
    async fn commit_cb(&self, writeset: &Writeset, commit: bool) -> Result<()>;
    async fn unordered_cb(&self, payload: &[u8]) -> Result<()>;
}

/// State-transfer collaborator, backed by [`GCache::writesets_in_range`] on
/// the donor side (§6). `serve_ist` hands the donor's already-gathered
/// range to the transport; `request_ist` is the joiner's matching pull.
#[async_trait]
pub trait StateTransfer: Send + Sync {
    async fn serve_ist(&self, from_gsn: Gsn, to_gsn: Gsn, writesets: Vec<Writeset>) -> Result<()>;
    async fn request_ist(&self, from_gsn: Gsn) -> Result<Vec<Writeset>>;
}

/// Replica membership state (§4.5): gates which pipeline steps are
/// permitted. Writesets arriving while `Joining` are queued until state
/// transfer completes and the replica becomes `Joined`/`Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Closed,
    Connected,
    Joining,
    Joined,
    Synced,
    Donor,
}

#[derive(Debug, Default)]
struct FlowControl {
    active: bool,
    requested: bool,
    paused_ns: AtomicU64,
}

/// Wraps a GSN so the local/certification monitor always serializes
/// entirely in order, independent of the real apply-time `depends_gsn`
/// computed by certification (§4.5 step 1 vs steps 4/6).
struct SerialEvent(Gsn);

impl MonitorEvent for SerialEvent {
    fn global_seqno(&self) -> Gsn {
        self.0
    }
    fn depends_seqno(&self) -> Gsn {
        self.0 - 1
    }
}

/// Owns one instance each of the collaborators named in §4.5 and drives
/// the nine-step pipeline for every ordered writeset.
pub struct Replicator {
    config: ReplicatorConfig,
    group: Arc<dyn GroupComm>,
    callbacks: Arc<dyn ApplyCallbacks>,
    cert: Mutex<CertIndex>,
    local_monitor: Monitor,
    apply_monitor: Monitor,
    commit_monitor: Monitor,
    gcache: Mutex<GCache>,
    state: RwLock<ReplicaState>,
    flow: FlowControl,
    last_committed: AtomicU64,
    open_transactions: DashMap<i64, Arc<TrxHandleMaster>>,
    state_uuid: Uuid,
    stats: Mutex<ReplicatorStats>,
    shutdown: AtomicBool,
    state_transfer: RwLock<Option<Arc<dyn StateTransfer>>>,
}

impl Replicator {
    pub fn new(
        config: ReplicatorConfig,
        group: Arc<dyn GroupComm>,
        callbacks: Arc<dyn ApplyCallbacks>,
    ) -> Result<Self> {
        let state_uuid = Uuid::new_v4();
        let gcache = GCache::open(&config.gcache_path, config.gcache_size, state_uuid)?;
        let mut stats = ReplicatorStats::default();
        stats.state_uuid = state_uuid;

        Ok(Self {
            cert: Mutex::new(CertIndex::new(config.cert_index_window as i64)),
            local_monitor: Monitor::new("local"),
            apply_monitor: Monitor::new("apply"),
            commit_monitor: Monitor::new("commit"),
            gcache: Mutex::new(gcache),
            state: RwLock::new(ReplicaState::Closed),
            flow: FlowControl::default(),
            last_committed: AtomicU64::new(0),
            open_transactions: DashMap::new(),
            state_uuid,
            stats: Mutex::new(stats),
            shutdown: AtomicBool::new(false),
            state_transfer: RwLock::new(None),
            config,
            group,
            callbacks,
        })
    }

    pub fn membership_state(&self) -> ReplicaState {
        *self.state.read()
    }

    pub fn set_membership_state(&self, state: ReplicaState) {
        *self.state.write() = state;
        info!(?state, "membership state changed");
    }

    /// Registers the collaborator that actually moves IST bytes over the
    /// wire. Optional: a replicator with no configured transport can still
    /// drain and resume as a donor, it just never serves or requests a
    /// range.
    pub fn set_state_transfer(&self, state_transfer: Arc<dyn StateTransfer>) {
        *self.state_transfer.write() = Some(state_transfer);
    }

    /// Replicates a local transaction's gathered writeset: sends it to the
    /// group for ordering, then drives it through the same pipeline a
    /// remote writeset takes.
    #[instrument(skip(self, master))]
    pub async fn replicate_local(&self, master: &Arc<TrxHandleMaster>) -> Result<Arc<TrxHandleSlave>> {
        let (ws, previous_fragment_gsn) = {
            let mut lock = master.lock();
            if !matches!(lock.state(), TrxState::Executing) {
                return Err(RepError::InvalidState(format!(
                    "trx {} not executing",
                    master.shared.trx_id
                )));
            }
            let previous_fragment_gsn = lock.previous_fragment_gsn();
            let last_seen = self.last_committed.load(AtomicOrdering::SeqCst) as Gsn;
            let ws = lock.gather(master.shared.source_id, master.shared.conn_id, last_seen, now_ns())?;
            lock.transition_to(TrxState::Replicating)?;
            (ws, previous_fragment_gsn)
        };

        let (gsn, local_gsn) = self.group.send(&ws).await?;
        let mut ordered = ws;
        // Certification fills in the real depends_gsn (§4.3); this is just
        // a placeholder so the writeset carries a valid `Ordering` between
        // send and certify.
        ordered.ordering = Some(crate::writeset::Ordering {
            assigned_gsn: gsn,
            depends_gsn: UNDEFINED,
            local_gsn,
        });

        let slave = TrxHandleSlave::new(ordered, local_gsn);
        {
            let mut lock = master.lock();
            lock.set_current_fragment(Arc::clone(&slave));
            lock.transition_to(TrxState::Certifying)?;
        }
        self.open_transactions.insert(master.shared.trx_id, Arc::clone(master));

        self.process_ordered(Arc::clone(&slave), previous_fragment_gsn).await?;

        {
            let mut lock = master.lock();
            if slave.is_committed() {
                lock.transition_to(TrxState::Committed)?;
            } else {
                lock.transition_to(TrxState::RolledBack).ok();
            }
        }
        self.open_transactions.remove(&master.shared.trx_id);
        Ok(slave)
    }

    /// Runs the nine-step pipeline from §4.5 for an already-ordered
    /// writeset, whether it originated locally or remotely.
    /// `previous_fragment_gsn` chains a streaming transaction's later
    /// fragments to the one before it (§4.4 "Flags contract"); pass
    /// [`crate::gsn::UNDEFINED`] for a single-fragment transaction or a
    /// writeset with no local master (e.g. IST replay).
    #[instrument(skip(self, slave), fields(gsn = slave.global_seqno()))]
    pub async fn process_ordered(&self, slave: Arc<TrxHandleSlave>, previous_fragment_gsn: Gsn) -> Result<()> {
        let gsn = slave.global_seqno();

        // 1. local monitor: certification must run in strict GSN order.
        self.local_monitor.enter(&SerialEvent(gsn))?;

        // 2. certify.
        let outcome = {
            let mut ws = slave.writeset.lock();
            self.cert.lock().certify(&mut ws, previous_fragment_gsn)
        };
        if outcome == CertOutcome::Conflict {
            let mut s = self.stats.lock();
            s.local_cert_failures += 1;
        }
        slave.mark_certified();
        self.local_monitor.leave(&SerialEvent(gsn));

        // 3. store in the ring-buffer cache.
        {
            let ws = slave.writeset.lock();
            self.gcache.lock().malloc(gsn, &ws)?;
        }

        // 4. apply monitor (real depends_gsn recovers parallelism here).
        self.apply_monitor.enter(&*slave)?;

        // 5. apply callback.
        let apply_result = {
            let ws = slave.writeset.lock().clone();
            self.callbacks.apply_cb(&ws).await
        };
        if let Err(e) = &apply_result {
            warn!(gsn, error = %e, "apply callback failed, writeset will roll back");
        }
        self.apply_monitor.leave(&*slave);

        // 6. commit monitor.
        self.commit_monitor.enter(&*slave)?;

        // 7. commit callback.
        let commit = apply_result.is_ok() && !slave.writeset.lock().is_rollback();
        let commit_result = {
            let ws = slave.writeset.lock().clone();
            self.callbacks.commit_cb(&ws, commit).await
        };
        if commit && commit_result.is_ok() {
            slave.mark_committed();
            self.last_committed.store(gsn.max(0) as u64, AtomicOrdering::SeqCst);
            let mut s = self.stats.lock();
            s.local_commits += 1;
            s.last_committed = gsn;
        }

        // 8. leave commit monitor (local/apply already left above, in order).
        self.commit_monitor.leave(&*slave);

        // 9. shrink the certification window and cache to the configured span.
        self.maintain_window(gsn);

        commit_result?;
        apply_result?;
        Ok(())
    }

    fn maintain_window(&self, gsn: Gsn) {
        let window = self.config.cert_index_window as i64;
        if gsn > window {
            self.cert.lock().trim_to(gsn - window);
            self.gcache.lock().discard(gsn - window);
        }
    }

    /// Aborts a local transaction still in an abortable state, canceling
    /// its monitor slot if it already holds one (§4.4, §5 "Cancellation").
    pub fn abort_local(&self, master: &TrxHandleMaster) -> Result<()> {
        let fragment = {
            let mut lock = master.lock();
            lock.request_abort()?;
            lock.current_fragment()
        };
        if let Some(slave) = fragment {
            let gsn = slave.global_seqno();
            if gsn >= 0 {
                slave.request_exit();
                self.local_monitor.cancel(gsn);
                self.apply_monitor.cancel(gsn);
                self.commit_monitor.cancel(gsn);
            }
        }
        let mut lock = master.lock();
        lock.transition_to(TrxState::Aborting)?;
        lock.transition_to(TrxState::RolledBack)
    }

    /// Drains all three monitors at `gsn` and flips membership to `Donor`,
    /// ahead of serving an incremental state transfer (§5).
    pub async fn become_donor(&self, gsn: Gsn) {
        self.gcache.lock().freeze_purge_at(gsn);
        self.local_monitor.drain(gsn);
        self.apply_monitor.drain(gsn);
        self.commit_monitor.drain(gsn);
        self.set_membership_state(ReplicaState::Donor);
    }

    pub async fn resume_from_donor(&self) {
        self.gcache.lock().unfreeze_purge();
        self.local_monitor.resume();
        self.apply_monitor.resume();
        self.commit_monitor.resume();
        self.set_membership_state(ReplicaState::Synced);
    }

    /// Serves an incremental state transfer range while acting as donor
    /// (§5, §6): gathers `[from_gsn, to_gsn]` out of the cache and hands it
    /// to the configured [`StateTransfer`] collaborator. Must run after
    /// [`Replicator::become_donor`] has frozen the purge watermark at or
    /// beyond `to_gsn`, or the range may already have been reclaimed.
    pub async fn serve_state_transfer(&self, from_gsn: Gsn, to_gsn: Gsn) -> Result<()> {
        let transport = self.state_transfer.read().clone();
        let Some(transport) = transport else {
            return Err(RepError::InconsistentState("no state transfer collaborator configured".into()));
        };
        let writesets = self.gcache.lock().writesets_in_range(from_gsn, to_gsn)?;
        transport.serve_ist(from_gsn, to_gsn, writesets).await
    }

    /// Joiner side of IST (§5, §6): pulls everything from `from_gsn`
    /// onward and replays it through the ordinary ordered pipeline, the
    /// same one a live remote writeset takes.
    pub async fn request_state_transfer(&self, from_gsn: Gsn) -> Result<()> {
        let transport = self.state_transfer.read().clone();
        let Some(transport) = transport else {
            return Err(RepError::InconsistentState("no state transfer collaborator configured".into()));
        };
        let writesets = transport.request_ist(from_gsn).await?;
        for ws in writesets {
            let local_gsn = ws.assigned_gsn();
            let slave = TrxHandleSlave::new(ws, local_gsn);
            self.process_ordered(slave, UNDEFINED).await?;
        }
        Ok(())
    }

    /// Flags backpressure to the group once the apply backlog crosses the
    /// configured high watermark (§5 "Backpressure").
    pub fn assert_flow_control(&self, pending_bytes: usize) -> bool {
        if pending_bytes >= self.config.flow_control_high_watermark {
            true
        } else {
            pending_bytes > self.config.flow_control_low_watermark && self.flow.active
        }
    }

    pub fn open_transaction_count(&self) -> usize {
        self.open_transactions.len()
    }

    pub fn stats(&self) -> ReplicatorStats {
        let mut s = self.stats.lock().clone();
        s.local = self.local_monitor.stats();
        s.apply = self.apply_monitor.stats();
        s.commit = self.commit_monitor.stats();
        s.cert = self.cert.lock().stats();
        s.cert_index_size = self.cert.lock().len();
        s.gcache = self.gcache.lock().stats();
        s.open_transactions = self.open_transactions.len();
        s
    }
}

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writeset::{Key, KeyAccess};
    use std::sync::atomic::AtomicI64;
    use tempfile::tempdir;

    struct FakeGroup {
        next_gsn: AtomicI64,
    }

    #[async_trait]
    impl GroupComm for FakeGroup {
        async fn send(&self, _writeset: &Writeset) -> Result<(Gsn, Gsn)> {
            let gsn = self.next_gsn.fetch_add(1, AtomicOrdering::SeqCst);
            Ok((gsn, gsn))
        }
        async fn pause(&self) -> Result<()> {
            Ok(())
        }
        async fn resume(&self) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingCallbacks {
        applied: Mutex<Vec<i64>>,
        committed: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl ApplyCallbacks for RecordingCallbacks {
        async fn apply_cb(&self, writeset: &Writeset) -> Result<()> {
            self.applied.lock().push(writeset.trx_id);
            Ok(())
        }
        async fn commit_cb(&self, writeset: &Writeset, commit: bool) -> Result<()> {
            if commit {
                self.committed.lock().push(writeset.trx_id);
            }
            Ok(())
        }
        async fn unordered_cb(&self, _payload: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn test_config(dir: &std::path::Path) -> ReplicatorConfig {
        let mut cfg = ReplicatorConfig::default();
        cfg.gcache_path = dir.join("gcache.db");
        cfg.gcache_size = 1024 * 1024;
        cfg
    }

    #[tokio::test]
    async fn local_transaction_commits_end_to_end() {
        let dir = tempdir().unwrap();
        let group = Arc::new(FakeGroup { next_gsn: AtomicI64::new(1) });
        let callbacks = Arc::new(RecordingCallbacks { applied: Mutex::new(vec![]), committed: Mutex::new(vec![]) });
        let repl = Replicator::new(test_config(dir.path()), group, callbacks.clone()).unwrap();

        let master = Arc::new(TrxHandleMaster::new(Uuid::new_v4(), 1, 42));
        {
            let mut lock = master.lock();
            lock.builder_mut()
                .unwrap()
                .append_key(Key::from_str("row-1"), KeyAccess::Exclusive)
                .append_data("accounts", b"balance=10".to_vec())
                .set_flag(crate::writeset::F_COMMIT);
        }

        let slave = repl.replicate_local(&master).await.unwrap();
        assert!(slave.is_committed());
        assert_eq!(callbacks.committed.lock().as_slice(), &[42]);
        assert_eq!(repl.open_transaction_count(), 0);
    }

    #[tokio::test]
    async fn second_transaction_on_same_key_depends_on_the_first() {
        let dir = tempdir().unwrap();
        let group = Arc::new(FakeGroup { next_gsn: AtomicI64::new(1) });
        let callbacks = Arc::new(RecordingCallbacks { applied: Mutex::new(vec![]), committed: Mutex::new(vec![]) });
        let repl = Replicator::new(test_config(dir.path()), group, callbacks.clone()).unwrap();

        let m1 = Arc::new(TrxHandleMaster::new(Uuid::new_v4(), 1, 1));
        {
            let mut lock = m1.lock();
            lock.builder_mut().unwrap().append_key(Key::from_str("hot"), KeyAccess::Exclusive).set_flag(crate::writeset::F_COMMIT);
        }
        let m2 = Arc::new(TrxHandleMaster::new(Uuid::new_v4(), 2, 2));
        {
            let mut lock = m2.lock();
            lock.builder_mut().unwrap().append_key(Key::from_str("hot"), KeyAccess::Exclusive).set_flag(crate::writeset::F_COMMIT);
        }

        let s1 = repl.replicate_local(&m1).await.unwrap();
        let s2 = repl.replicate_local(&m2).await.unwrap();

        assert!(s1.is_committed());
        assert!(s2.is_committed());
        // m2 gathered after m1 committed, so it observed gsn 1 and never
        // conflicts; its dependency still chains to m1's gsn.
        assert_eq!(s2.writeset.lock().depends_gsn(), 1);
        assert_eq!(repl.stats().local_cert_failures, 0);
    }

    struct RecordingStateTransfer {
        served: Mutex<Vec<(Gsn, Gsn, usize)>>,
    }

    #[async_trait]
    impl StateTransfer for RecordingStateTransfer {
        async fn serve_ist(&self, from_gsn: Gsn, to_gsn: Gsn, writesets: Vec<Writeset>) -> Result<()> {
            self.served.lock().push((from_gsn, to_gsn, writesets.len()));
            Ok(())
        }
        async fn request_ist(&self, _from_gsn: Gsn) -> Result<Vec<Writeset>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn donor_serves_the_requested_range_out_of_the_cache() {
        let dir = tempdir().unwrap();
        let group = Arc::new(FakeGroup { next_gsn: AtomicI64::new(1) });
        let callbacks = Arc::new(RecordingCallbacks { applied: Mutex::new(vec![]), committed: Mutex::new(vec![]) });
        let repl = Replicator::new(test_config(dir.path()), group, callbacks).unwrap();
        let transport = Arc::new(RecordingStateTransfer { served: Mutex::new(vec![]) });
        repl.set_state_transfer(transport.clone());

        let master = Arc::new(TrxHandleMaster::new(Uuid::new_v4(), 1, 1));
        {
            let mut lock = master.lock();
            lock.builder_mut().unwrap().append_key(Key::from_str("row"), KeyAccess::Exclusive).set_flag(crate::writeset::F_COMMIT);
        }
        repl.replicate_local(&master).await.unwrap();

        repl.become_donor(1).await;
        repl.serve_state_transfer(1, 1).await.unwrap();

        assert_eq!(transport.served.lock().as_slice(), &[(1, 1, 1)]);
    }
}
