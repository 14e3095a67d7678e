//! Transaction handles (§3, §4.4): the master/slave split between a local,
//! still-gathering transaction and an immutable, ordered view of one.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{RepError, Result};
use crate::gsn::{Gsn, UNDEFINED};
use crate::trx::state::{is_legal_transition, TrxState};
use crate::writeset::{Writeset, WritesetBuilder};

/// Identity common to both views of one transaction (§3, §9): set once
/// when the master is created and carried unchanged into every slave view
/// a fragment produces, rather than duplicated as separate fields on each
/// struct.
pub struct TrxHandleShared {
    pub source_id: Uuid,
    pub conn_id: i64,
    pub trx_id: i64,
}

/// The immutable, ordered view of a writeset once it has a GSN, shared
/// between the replicator pipeline and (for local transactions) the
/// originating master handle.
pub struct TrxHandleSlave {
    pub shared: TrxHandleShared,
    pub local_gsn: Gsn,
    pub writeset: Mutex<Writeset>,
    certified: AtomicBool,
    committed: AtomicBool,
    /// Set when a monitor entry for this slave must unwind early (abort of
    /// the owning master while a fragment is mid-pipeline).
    exit_loop: AtomicBool,
    state: Mutex<TrxState>,
}

impl TrxHandleSlave {
    pub fn new(writeset: Writeset, local_gsn: Gsn) -> Arc<Self> {
        Arc::new(Self {
            shared: TrxHandleShared {
                source_id: writeset.source_id,
                conn_id: writeset.conn_id,
                trx_id: writeset.trx_id,
            },
            local_gsn,
            certified: AtomicBool::new(false),
            committed: AtomicBool::new(false),
            exit_loop: AtomicBool::new(false),
            state: Mutex::new(TrxState::Replicating),
            writeset: Mutex::new(writeset),
        })
    }

    pub fn trx_id(&self) -> i64 {
        self.shared.trx_id
    }

    pub fn global_seqno(&self) -> Gsn {
        self.writeset.lock().assigned_gsn()
    }

    pub fn depends_seqno(&self) -> Gsn {
        self.writeset.lock().depends_gsn()
    }

    pub fn mark_certified(&self) {
        self.certified.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_certified(&self) -> bool {
        self.certified.load(AtomicOrdering::SeqCst)
    }

    pub fn mark_committed(&self) {
        self.committed.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(AtomicOrdering::SeqCst)
    }

    pub fn request_exit(&self) {
        self.exit_loop.store(true, AtomicOrdering::SeqCst);
    }

    pub fn should_exit(&self) -> bool {
        self.exit_loop.load(AtomicOrdering::SeqCst)
    }

    pub fn state(&self) -> TrxState {
        *self.state.lock()
    }

    pub fn transition_to(&self, to: TrxState) -> Result<()> {
        let mut g = self.state.lock();
        if !is_legal_transition(*g, to) {
            return Err(RepError::InvalidState(format!(
                "slave trx {:?}: {:?} -> {:?}",
                self.shared.trx_id, *g, to
            )));
        }
        *g = to;
        Ok(())
    }
}

impl crate::monitor::MonitorEvent for TrxHandleSlave {
    fn global_seqno(&self) -> Gsn {
        TrxHandleSlave::global_seqno(self)
    }
    fn depends_seqno(&self) -> Gsn {
        TrxHandleSlave::depends_seqno(self)
    }
}

struct MasterInner {
    state: TrxState,
    builder: Option<WritesetBuilder>,
    /// The current fragment's ordered view, once replicated. `None` while
    /// still gathering locally.
    fragment: Option<Arc<TrxHandleSlave>>,
    /// GSN of the previous fragment in a streaming (multi-fragment)
    /// transaction, used to chain `depends` (§4.4 "Flags contract").
    previous_fragment_gsn: Gsn,
}

/// A local transaction handle. All state transitions happen under its
/// mutex; [`TrxHandleMaster::lock`] returns an RAII guard so callers can't
/// forget to hold it across a multi-step transition.
pub struct TrxHandleMaster {
    pub shared: TrxHandleShared,
    inner: Mutex<MasterInner>,
}

impl TrxHandleMaster {
    pub fn new(source_id: Uuid, conn_id: i64, trx_id: i64) -> Self {
        Self {
            shared: TrxHandleShared { source_id, conn_id, trx_id },
            inner: Mutex::new(MasterInner {
                state: TrxState::Executing,
                builder: Some(WritesetBuilder::new(source_id, conn_id, trx_id)),
                fragment: None,
                previous_fragment_gsn: UNDEFINED,
            }),
        }
    }

    pub fn trx_id(&self) -> i64 {
        self.shared.trx_id
    }

    pub fn lock(&self) -> TrxHandleLock<'_> {
        TrxHandleLock { guard: self.inner.lock(), trx_id: self.shared.trx_id }
    }
}

/// RAII guard over a master's mutable state: every mutation goes through
/// the guard, never the bare handle.
pub struct TrxHandleLock<'a> {
    guard: MutexGuard<'a, MasterInner>,
    trx_id: i64,
}

impl<'a> TrxHandleLock<'a> {
    pub fn state(&self) -> TrxState {
        self.guard.state
    }

    pub fn transition_to(&mut self, to: TrxState) -> Result<()> {
        if !is_legal_transition(self.guard.state, to) {
            return Err(RepError::InvalidState(format!(
                "master trx {}: {:?} -> {:?}",
                self.trx_id, self.guard.state, to
            )));
        }
        debug!(trx_id = self.trx_id, from = ?self.guard.state, to = ?to, "trx state transition");
        self.guard.state = to;
        Ok(())
    }

    /// Local, brute-force, or victim abort (§4.4 "Abort semantics"): legal
    /// from `Executing`, `Replicating`, or `Certifying` only.
    pub fn request_abort(&mut self) -> Result<()> {
        match self.guard.state {
            TrxState::Executing | TrxState::Replicating | TrxState::Certifying => {
                warn!(trx_id = self.trx_id, from = ?self.guard.state, "aborting transaction");
                self.guard.state = TrxState::MustAbort;
                Ok(())
            }
            other => Err(RepError::InvalidState(format!(
                "trx {} cannot be aborted from state {:?}",
                self.trx_id, other
            ))),
        }
    }

    pub fn builder_mut(&mut self) -> Option<&mut WritesetBuilder> {
        self.guard.builder.as_mut()
    }

    pub fn current_fragment(&self) -> Option<Arc<TrxHandleSlave>> {
        self.guard.fragment.clone()
    }

    /// Freezes the current builder into a writeset ready for replication
    /// and opens a fresh one for the next fragment of a streaming
    /// transaction (§4.4 "Flags contract").
    pub fn gather(&mut self, source_id: Uuid, conn_id: i64, last_seen_gsn: Gsn, timestamp_ns: i64) -> Result<Writeset> {
        let builder = self
            .guard
            .builder
            .take()
            .ok_or_else(|| RepError::InvalidState(format!("trx {} already gathered", self.trx_id)))?;
        self.guard.builder = Some(WritesetBuilder::new(source_id, conn_id, self.trx_id));
        Ok(builder.finalize(last_seen_gsn, timestamp_ns))
    }

    pub fn set_current_fragment(&mut self, slave: Arc<TrxHandleSlave>) {
        self.guard.previous_fragment_gsn = slave.global_seqno();
        self.guard.fragment = Some(slave);
    }

    pub fn previous_fragment_gsn(&self) -> Gsn {
        self.guard.previous_fragment_gsn
    }
}
