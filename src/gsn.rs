//! Global sequence number — the total order the whole cluster agrees on.

use std::fmt;

/// Global sequence number assigned by the group-communication layer.
///
/// Negative values are sentinels: [`UNDEFINED`] for "not yet assigned" and
/// [`ILLEGAL`] for "this slot was discarded and must never be reused".
pub type Gsn = i64;

/// A GSN has not been assigned yet (e.g. a writeset still gathering, or a
/// `depends_seqno` with no real dependency).
pub const UNDEFINED: Gsn = -1;

/// A GSN slot that existed but has been permanently discarded (e.g. a gcache
/// buffer that was freed). Distinguishing this from [`UNDEFINED`] lets
/// recovery tell "never written" from "written, then reclaimed" apart.
pub const ILLEGAL: Gsn = -2;

#[inline]
pub fn is_undefined(gsn: Gsn) -> bool {
    gsn < 0
}

/// Thin wrapper so call sites that need both a GSN and a human label (e.g.
/// log lines) don't have to carry the label separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderedGsn(pub Gsn);

impl fmt::Display for OrderedGsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if is_undefined(self.0) {
            write!(f, "undefined")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
