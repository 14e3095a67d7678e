//! Ordering monitor (§4.2): a generic GSN-keyed serializer. Entry always
//! proceeds in strict global order; once entered, critical sections for
//! non-dependent events may overlap, recovering parallelism on apply/commit
//! while the local monitor (which every event depends fully on its
//! predecessor for) stays fully serial.

use std::collections::BTreeMap;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{RepError, Result};
use crate::gsn::{Gsn, UNDEFINED};

/// Anything the monitor can order must expose its place in the global
/// sequence and what it depends on.
pub trait MonitorEvent {
    fn global_seqno(&self) -> Gsn;
    fn depends_seqno(&self) -> Gsn;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Waiting,
    Entered,
    Left,
    Canceled,
}

/// Running-average statistics exposed by the monitor (§4.2).
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorStats {
    pub entries: u64,
    pub leaves: u64,
    pub out_of_order_entries: f64,
    pub out_of_order_leaves: f64,
    pub avg_window: f64,
}

struct Inner {
    slots: BTreeMap<Gsn, SlotState>,
    first_gsn: Option<Gsn>,
    last_left: Gsn,
    draining: bool,
    drain_point: Gsn,
    stats: MonitorStats,
}

impl Inner {
    fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            first_gsn: None,
            last_left: UNDEFINED,
            draining: false,
            drain_point: UNDEFINED,
            stats: MonitorStats::default(),
        }
    }

    /// §4.2: all events with gsn <= depends must have completed their
    /// critical section (left, or been canceled out of the sequence); all
    /// events strictly between depends and gsn must at least have entered,
    /// so global entry order is never violated even though their critical
    /// sections may still be running in parallel.
    fn can_enter(&self, gsn: Gsn, depends: Gsn) -> bool {
        let floor = self.first_gsn.unwrap_or(gsn);
        if depends >= floor {
            for (_, st) in self.slots.range(floor..=depends) {
                if !matches!(st, SlotState::Left | SlotState::Canceled) {
                    return false;
                }
            }
        }
        let lo = (depends + 1).max(floor);
        for g in lo..gsn {
            match self.slots.get(&g) {
                Some(SlotState::Entered) | Some(SlotState::Left) | Some(SlotState::Canceled) => {}
                _ => return false,
            }
        }
        true
    }

    fn record_entry(&mut self, gsn: Gsn) {
        let n = self.stats.entries + 1;
        self.stats.entries = n;
        if self.last_left >= 0 && gsn > self.last_left + 1 {
            self.stats.out_of_order_entries =
                (self.stats.out_of_order_entries * (n - 1) as f64 + 1.0) / n as f64;
        } else {
            self.stats.out_of_order_entries =
                (self.stats.out_of_order_entries * (n - 1) as f64) / n as f64;
        }
        let window = (gsn - self.last_left.max(0)) as f64;
        self.stats.avg_window = (self.stats.avg_window * (n - 1) as f64 + window) / n as f64;
    }

    fn record_leave(&mut self, gsn: Gsn) {
        let n = self.stats.leaves + 1;
        self.stats.leaves = n;
        let expected_next = self.last_left + 1;
        if gsn != expected_next {
            self.stats.out_of_order_leaves =
                (self.stats.out_of_order_leaves * (n - 1) as f64 + 1.0) / n as f64;
        } else {
            self.stats.out_of_order_leaves =
                (self.stats.out_of_order_leaves * (n - 1) as f64) / n as f64;
        }
        if gsn > self.last_left {
            self.last_left = gsn;
        }
    }
}

/// A GSN-ordered monitor. One instance backs each of the local, apply and
/// commit critical sections (§4.5).
pub struct Monitor {
    name: &'static str,
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl Monitor {
    pub fn new(name: &'static str) -> Self {
        Self { name, inner: Mutex::new(Inner::new()), cv: Condvar::new() }
    }

    /// Blocks the calling thread until `event` is permitted to enter its
    /// critical section, per the ordering contract in §4.2.
    pub fn enter<E: MonitorEvent>(&self, event: &E) -> Result<()> {
        let gsn = event.global_seqno();
        let depends = {
            let d = event.depends_seqno();
            if d < 0 { gsn - 1 } else { d }
        };

        let mut g = self.inner.lock();
        if g.first_gsn.is_none() {
            g.first_gsn = Some(gsn);
        }
        g.slots.entry(gsn).or_insert(SlotState::Waiting);

        loop {
            match g.slots.get(&gsn) {
                Some(SlotState::Canceled) => {
                    trace!(monitor = self.name, gsn, "enter interrupted: canceled");
                    return Err(RepError::Interrupted(gsn));
                }
                _ => {}
            }

            if g.draining && gsn > g.drain_point {
                g.slots.insert(gsn, SlotState::Canceled);
                warn!(monitor = self.name, gsn, drain_point = g.drain_point, "enter rejected by drain");
                self.cv.notify_all();
                return Err(RepError::Interrupted(gsn));
            }

            if g.can_enter(gsn, depends) {
                g.slots.insert(gsn, SlotState::Entered);
                g.record_entry(gsn);
                debug!(monitor = self.name, gsn, depends, "entered");
                self.cv.notify_all();
                return Ok(());
            }

            self.cv.wait(&mut g);
        }
    }

    /// Releases downstream waiters blocked on `gsn` as a dependency.
    pub fn leave<E: MonitorEvent>(&self, event: &E) {
        let gsn = event.global_seqno();
        let mut g = self.inner.lock();
        g.slots.insert(gsn, SlotState::Left);
        g.record_leave(gsn);
        debug!(monitor = self.name, gsn, "left");
        self.cv.notify_all();
    }

    /// Cancels a pending or in-flight entry. The GSN slot is still marked
    /// resolved so downstream ordering can progress (§4.2, §5).
    pub fn cancel(&self, gsn: Gsn) {
        let mut g = self.inner.lock();
        if g.first_gsn.is_none() {
            g.first_gsn = Some(gsn);
        }
        g.slots.insert(gsn, SlotState::Canceled);
        warn!(monitor = self.name, gsn, "canceled");
        self.cv.notify_all();
    }

    /// Blocks until every event with gsn <= `gsn` has left (or been
    /// canceled), then rejects new entries above `gsn` until [`resume`].
    pub fn drain(&self, gsn: Gsn) {
        let mut g = self.inner.lock();
        g.draining = true;
        g.drain_point = gsn;
        loop {
            let settled = g
                .slots
                .range(..=gsn)
                .all(|(_, st)| matches!(st, SlotState::Left | SlotState::Canceled));
            if settled {
                break;
            }
            self.cv.wait(&mut g);
        }
        debug!(monitor = self.name, gsn, "drained");
    }

    /// Resumes accepting entries above the last drain point.
    pub fn resume(&self) {
        let mut g = self.inner.lock();
        g.draining = false;
        g.drain_point = UNDEFINED;
        self.cv.notify_all();
    }

    pub fn last_left(&self) -> Gsn {
        self.inner.lock().last_left
    }

    pub fn stats(&self) -> MonitorStats {
        self.inner.lock().stats
    }

    pub fn reset_stats(&self) {
        let mut g = self.inner.lock();
        let entries = g.stats.entries;
        let leaves = g.stats.leaves;
        g.stats = MonitorStats { entries, leaves, ..Default::default() };
    }

    /// Drops bookkeeping for slots at or below `gsn`, bounding memory use
    /// once the replicator knows nothing will ever query them again.
    pub fn forget_up_to(&self, gsn: Gsn) {
        let mut g = self.inner.lock();
        let tail = g.slots.split_off(&(gsn + 1));
        g.slots = tail;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimpleEvent {
    pub gsn: Gsn,
    pub depends: Gsn,
}

impl MonitorEvent for SimpleEvent {
    fn global_seqno(&self) -> Gsn {
        self.gsn
    }
    fn depends_seqno(&self) -> Gsn {
        self.depends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_event_enters_and_leaves_immediately() {
        let m = Monitor::new("test");
        let e = SimpleEvent { gsn: 1, depends: UNDEFINED };
        m.enter(&e).unwrap();
        m.leave(&e);
        assert_eq!(m.last_left(), 1);
    }

    #[test]
    fn non_dependent_events_run_in_parallel() {
        let m = Arc::new(Monitor::new("test"));
        let e1 = SimpleEvent { gsn: 1, depends: UNDEFINED };
        m.enter(&e1).unwrap();

        // e2 depends only on gsn 0 (nothing), so it can enter while e1 is
        // still inside its critical section.
        let e2 = SimpleEvent { gsn: 2, depends: 0 };
        let m2 = Arc::clone(&m);
        let handle = thread::spawn(move || {
            m2.enter(&e2).unwrap();
            m2.leave(&e2);
        });
        handle.join().unwrap();
        m.leave(&e1);
        assert_eq!(m.last_left(), 2);
    }

    #[test]
    fn toi_style_event_serializes_on_predecessor_leaving() {
        let m = Arc::new(Monitor::new("test"));
        let e1 = SimpleEvent { gsn: 1, depends: UNDEFINED };
        m.enter(&e1).unwrap();

        let e2 = SimpleEvent { gsn: 2, depends: 1 }; // depends == gsn - 1: TOI-style
        let m2 = Arc::clone(&m);
        let entered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let entered2 = Arc::clone(&entered);
        let handle = thread::spawn(move || {
            m2.enter(&e2).unwrap();
            entered2.store(true, std::sync::atomic::Ordering::SeqCst);
            m2.leave(&e2);
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(std::sync::atomic::Ordering::SeqCst));

        m.leave(&e1);
        handle.join().unwrap();
        assert!(entered.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn cancel_unblocks_successor_without_requiring_leave() {
        let m = Arc::new(Monitor::new("test"));
        let e1 = SimpleEvent { gsn: 1, depends: UNDEFINED };
        m.enter(&e1).unwrap();
        m.cancel(1);

        let e2 = SimpleEvent { gsn: 2, depends: 1 };
        m.enter(&e2).unwrap();
        m.leave(&e2);
        assert_eq!(m.last_left(), 2);
    }

    #[test]
    fn drain_blocks_and_rejects_then_resumes() {
        let m = Arc::new(Monitor::new("test"));
        for gsn in 1..=4 {
            let e = SimpleEvent { gsn, depends: gsn - 1 };
            m.enter(&e).unwrap();
            m.leave(&e);
        }

        m.drain(4);

        let e5 = SimpleEvent { gsn: 5, depends: 4 };
        assert!(matches!(m.enter(&e5), Err(RepError::Interrupted(5))));

        m.resume();
        let e5b = SimpleEvent { gsn: 5, depends: 4 };
        m.enter(&e5b).unwrap();
        m.leave(&e5b);
        assert_eq!(m.last_left(), 5);
    }
}
