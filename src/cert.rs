//! Certification index (§4.3): detects write-write conflicts between an
//! incoming writeset and the sliding window of recently-ordered writesets,
//! and computes the dependency GSN that bounds how far apply may run ahead.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::gsn::{Gsn, UNDEFINED};
use crate::writeset::{Key, Ordering, Writeset};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertOutcome {
    Certified,
    Conflict,
}

#[derive(Debug, Default, Clone)]
struct IndexEntry {
    exclusive_gsn: Option<Gsn>,
    shared_gsns: Vec<Gsn>,
}

impl IndexEntry {
    fn last_touch(&self) -> Gsn {
        let shared_max = self.shared_gsns.iter().copied().max().unwrap_or(UNDEFINED);
        self.exclusive_gsn.unwrap_or(UNDEFINED).max(shared_max)
    }
}

/// Running-average statistics exposed by the index (§4.3, §6).
#[derive(Debug, Clone, Copy, Default)]
pub struct CertStats {
    pub certified: u64,
    pub conflicts: u64,
    pub avg_depends_distance: f64,
    pub avg_cert_interval: f64,
}

/// The sliding-window key → GSN index that backs certification.
pub struct CertIndex {
    entries: HashMap<Key, IndexEntry>,
    /// Keys touched at each GSN, so `trim_to` can remove them in bulk.
    by_gsn: BTreeMap<Gsn, Vec<Key>>,
    first_retained: Gsn,
    max_pa_range: i64,
    stats: CertStats,
}

impl CertIndex {
    pub fn new(max_pa_range: i64) -> Self {
        Self {
            entries: HashMap::new(),
            by_gsn: BTreeMap::new(),
            first_retained: UNDEFINED,
            max_pa_range,
            stats: CertStats::default(),
        }
    }

    /// Certifies `ws` against the current index. `ws` must already carry an
    /// assigned GSN (from the local monitor). `previous_fragment_gsn` is the
    /// prior fragment's assigned GSN for a streaming transaction (§4.4
    /// "Flags contract"), or [`crate::gsn::UNDEFINED`] for a single-fragment
    /// one; every branch below clamps `depends_gsn` to at least that value,
    /// since a later fragment can never be applied ahead of an earlier one
    /// from the same transaction. On [`CertOutcome::Conflict`], `ws` has
    /// already been marked dummy (§4.3) but its GSN slot and
    /// `last_seen`/`assigned` fields are left intact so ordering continues.
    pub fn certify(&mut self, ws: &mut Writeset, previous_fragment_gsn: Gsn) -> CertOutcome {
        let assigned = ws.assigned_gsn();
        debug_assert!(assigned >= 0, "certify requires an already-ordered writeset");
        let last_seen = ws.last_seen_gsn;

        if ws.preordered() {
            let prior = ws.depends_gsn();
            let depends_gsn = if prior >= 0 { prior.min(assigned - 1) } else { assigned - 1 };
            let depends_gsn = depends_gsn.max(previous_fragment_gsn);
            self.populate(ws, assigned);
            ws.ordering = Some(Ordering { assigned_gsn: assigned, depends_gsn, local_gsn: assigned });
            self.stats.certified += 1;
            return CertOutcome::Certified;
        }

        if ws.bypasses_cert_scan() {
            let depends_gsn = (assigned - 1).max(previous_fragment_gsn);
            self.populate(ws, assigned);
            ws.ordering = Some(Ordering {
                assigned_gsn: assigned,
                depends_gsn,
                local_gsn: assigned,
            });
            self.record_success(assigned, depends_gsn, last_seen);
            return CertOutcome::Certified;
        }

        let mut depends = last_seen;
        for entry in &ws.keys {
            let Some(idx) = self.entries.get(&entry.key) else { continue };
            let last_touch = idx.last_touch();
            if last_touch <= last_seen {
                continue;
            }
            let conflicts_exclusive =
                entry.access.is_exclusive() && idx.exclusive_gsn.map(|g| g > last_seen).unwrap_or(false);
            let conflicts_shared_vs_exclusive = idx
                .exclusive_gsn
                .map(|g| g > last_seen)
                .unwrap_or(false)
                && !entry.access.is_exclusive();
            let conflicts_exclusive_vs_shared = entry.access.is_exclusive()
                && idx.shared_gsns.iter().any(|&g| g > last_seen);

            if conflicts_exclusive || conflicts_shared_vs_exclusive || conflicts_exclusive_vs_shared {
                warn!(gsn = assigned, trx_id = ws.trx_id, "certification conflict");
                ws.mark_dummy();
                self.stats.conflicts += 1;
                return CertOutcome::Conflict;
            }

            if idx.exclusive_gsn.map(|g| g > last_seen).unwrap_or(false) {
                depends = depends.max(idx.exclusive_gsn.unwrap());
            }
        }

        let depends_out = depends.max(last_seen);
        let pa_range = (assigned - depends_out - 1).min(self.max_pa_range).max(0);
        let depends_gsn = (assigned - 1 - pa_range).max(depends_out).max(previous_fragment_gsn);

        self.populate(ws, assigned);
        ws.ordering = Some(Ordering { assigned_gsn: assigned, depends_gsn, local_gsn: assigned });
        self.record_success(assigned, depends_gsn, last_seen);
        CertOutcome::Certified
    }

    fn populate(&mut self, ws: &Writeset, gsn: Gsn) {
        if self.first_retained < 0 {
            self.first_retained = gsn;
        }
        let mut touched = Vec::with_capacity(ws.keys.len());
        for entry in &ws.keys {
            let idx = self.entries.entry(entry.key.clone()).or_default();
            if entry.access.is_exclusive() {
                idx.exclusive_gsn = Some(gsn);
                idx.shared_gsns.clear();
            } else {
                idx.shared_gsns.push(gsn);
            }
            touched.push(entry.key.clone());
        }
        self.by_gsn.insert(gsn, touched);
    }

    fn record_success(&mut self, assigned: Gsn, depends: Gsn, last_seen: Gsn) {
        let n = self.stats.certified + 1;
        self.stats.certified = n;
        let dist = (assigned - depends) as f64;
        let interval = (assigned - last_seen) as f64;
        self.stats.avg_depends_distance =
            (self.stats.avg_depends_distance * (n - 1) as f64 + dist) / n as f64;
        self.stats.avg_cert_interval =
            (self.stats.avg_cert_interval * (n - 1) as f64 + interval) / n as f64;
    }

    /// Removes entries referencing only GSNs <= `gsn`, capping index memory
    /// to the configured window (§4.3 "Purge").
    pub fn trim_to(&mut self, gsn: Gsn) {
        let stale: Vec<Gsn> = self.by_gsn.range(..=gsn).map(|(g, _)| *g).collect();
        for g in stale {
            if let Some(keys) = self.by_gsn.remove(&g) {
                for key in keys {
                    if let Some(entry) = self.entries.get_mut(&key) {
                        if entry.exclusive_gsn == Some(g) {
                            entry.exclusive_gsn = None;
                        }
                        entry.shared_gsns.retain(|&s| s != g);
                        if entry.exclusive_gsn.is_none() && entry.shared_gsns.is_empty() {
                            self.entries.remove(&key);
                        }
                    }
                }
            }
        }
        self.first_retained = gsn + 1;
        debug!(gsn, remaining = self.entries.len(), "certification index trimmed");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CertStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writeset::{KeyAccess, Writeset};
    use uuid::Uuid;

    fn ordered(trx_id: i64, last_seen: Gsn, assigned: Gsn, key: &str, access: KeyAccess) -> Writeset {
        let mut b = Writeset::builder(Uuid::new_v4(), 1, trx_id);
        b.append_key(Key::from_str(key), access);
        b.set_flag(crate::writeset::F_COMMIT);
        let mut ws = b.finalize(last_seen, 0);
        ws.ordering = Some(Ordering { assigned_gsn: assigned, depends_gsn: UNDEFINED, local_gsn: assigned });
        ws
    }

    #[test]
    fn disjoint_keys_never_conflict() {
        let mut idx = CertIndex::new(1000);
        let mut a = ordered(1, 0, 1, "a", KeyAccess::Exclusive);
        assert_eq!(idx.certify(&mut a, UNDEFINED), CertOutcome::Certified);

        let mut b = ordered(2, 0, 2, "b", KeyAccess::Exclusive);
        assert_eq!(idx.certify(&mut b, UNDEFINED), CertOutcome::Certified);
        assert_eq!(b.depends_gsn(), 0);
    }

    #[test]
    fn exclusive_exclusive_on_same_key_conflicts() {
        let mut idx = CertIndex::new(1000);
        let mut a = ordered(1, 0, 1, "x", KeyAccess::Exclusive);
        idx.certify(&mut a, UNDEFINED);

        let mut b = ordered(2, 0, 2, "x", KeyAccess::Exclusive);
        assert_eq!(idx.certify(&mut b, UNDEFINED), CertOutcome::Conflict);
        assert!(b.is_dummy());
    }

    #[test]
    fn conflict_free_if_last_seen_covers_the_touch() {
        let mut idx = CertIndex::new(1000);
        let mut a = ordered(1, 0, 1, "x", KeyAccess::Exclusive);
        idx.certify(&mut a, UNDEFINED);

        // b observed gsn 1 before gathering, so a's touch is not a conflict.
        let mut b = ordered(2, 1, 2, "x", KeyAccess::Exclusive);
        assert_eq!(idx.certify(&mut b, UNDEFINED), CertOutcome::Certified);
        assert_eq!(b.depends_gsn(), 1);
    }

    #[test]
    fn shared_shared_never_conflicts() {
        let mut idx = CertIndex::new(1000);
        let mut a = ordered(1, 0, 1, "x", KeyAccess::Shared);
        idx.certify(&mut a, UNDEFINED);

        let mut b = ordered(2, 0, 2, "x", KeyAccess::Shared);
        assert_eq!(idx.certify(&mut b, UNDEFINED), CertOutcome::Certified);
        assert_eq!(b.depends_gsn(), 0);
    }

    #[test]
    fn trim_removes_stale_keys() {
        let mut idx = CertIndex::new(1000);
        let mut a = ordered(1, 0, 1, "x", KeyAccess::Exclusive);
        idx.certify(&mut a, UNDEFINED);
        assert_eq!(idx.len(), 1);

        idx.trim_to(1);
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn toi_writeset_serializes_fully() {
        let mut idx = CertIndex::new(1000);
        let mut ws = ordered(1, 0, 5, "x", KeyAccess::Exclusive);
        ws.flags |= crate::writeset::F_ISOLATION;
        assert_eq!(idx.certify(&mut ws, UNDEFINED), CertOutcome::Certified);
        assert_eq!(ws.depends_gsn(), 4);
    }

    #[test]
    fn preordered_writeset_still_gets_a_clamped_depends_gsn() {
        let mut idx = CertIndex::new(1000);
        let mut ws = ordered(1, 0, 5, "x", KeyAccess::Exclusive);
        ws.flags |= crate::writeset::F_PREORDERED;
        assert_eq!(idx.certify(&mut ws, UNDEFINED), CertOutcome::Certified);
        // Never left at the UNDEFINED placeholder the caller supplied.
        assert_eq!(ws.depends_gsn(), 4);
    }

    #[test]
    fn preordered_writeset_keeps_a_smaller_supplied_depends_gsn() {
        let mut idx = CertIndex::new(1000);
        let mut ws = ordered(1, 0, 5, "x", KeyAccess::Exclusive);
        ws.flags |= crate::writeset::F_PREORDERED;
        ws.ordering = Some(Ordering { assigned_gsn: 5, depends_gsn: 2, local_gsn: 5 });
        assert_eq!(idx.certify(&mut ws, UNDEFINED), CertOutcome::Certified);
        assert_eq!(ws.depends_gsn(), 2);
    }

    #[test]
    fn later_fragment_depends_chains_to_the_previous_fragment() {
        let mut idx = CertIndex::new(1000);
        // First fragment of a streaming transaction: ordinary certification.
        let mut first = ordered(1, 0, 3, "frag-key-1", KeyAccess::Exclusive);
        idx.certify(&mut first, UNDEFINED);

        // Second fragment touches an unrelated, never-certified-against key,
        // so the ordinary key scan alone would let depends_gsn fall behind
        // the first fragment's GSN. The chain clamp must prevent that.
        let mut second = ordered(1, 0, 7, "frag-key-2", KeyAccess::Exclusive);
        assert_eq!(idx.certify(&mut second, 3), CertOutcome::Certified);
        assert_eq!(second.depends_gsn(), 3);
    }
}
