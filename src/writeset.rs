//! Writeset: the immutable, ordered bundle of keys and row changes produced
//! by a transaction and carried through replication, certification and apply.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gsn::{Gsn, UNDEFINED};

// Flag bits, deliberately plain `u32` constants (not a `bitflags!` type) to
// match the layout a wire-compatible writeset header would use.
pub const F_COMMIT: u32 = 1 << 0;
pub const F_ROLLBACK: u32 = 1 << 1;
pub const F_ISOLATION: u32 = 1 << 2; // total-order isolation (TOI)
pub const F_PA_UNSAFE: u32 = 1 << 3;
pub const F_COMMUTATIVE: u32 = 1 << 4;
pub const F_NATIVE: u32 = 1 << 5;
pub const F_BEGIN: u32 = 1 << 6;
pub const F_PREORDERED: u32 = 1 << 15;

/// Per-key access mode. Two exclusive accesses, or an exclusive and a shared
/// access, to the same key conflict; two shared accesses do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAccess {
    Shared,
    Exclusive,
}

impl KeyAccess {
    #[inline]
    pub fn is_exclusive(self) -> bool {
        matches!(self, KeyAccess::Exclusive)
    }
}

/// A certification key. `version` lets different key-encoding schemes
/// coexist in the same index; equality is always structural (byte equality
/// of `encoded`), never cross-version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub version: u8,
    pub encoded: Vec<u8>,
}

impl Key {
    pub fn new(version: u8, encoded: impl Into<Vec<u8>>) -> Self {
        Self { version, encoded: encoded.into() }
    }

    pub fn from_str(s: &str) -> Self {
        Self { version: 1, encoded: s.as_bytes().to_vec() }
    }
}

/// One key entry inside a writeset's key set: the key plus how it was
/// accessed by this transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key: Key,
    pub access: KeyAccess,
}

/// A single ordered row change within the writeset's data set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataChange {
    pub table: String,
    pub payload: Vec<u8>,
}

/// A side-effecting action that must run on apply but carries no
/// certification key (e.g. a sequence bump, an unordered log write).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnorderedChange {
    pub payload: Vec<u8>,
}

/// Free-form metadata attached to a writeset (e.g. the originating SQL
/// statement, for diagnostics). Never interpreted by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Annotation {
    pub payload: Vec<u8>,
}

/// The ordering assigned to a writeset once it has passed through the
/// group-communication layer. Absent while the writeset is still local and
/// ungathered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ordering {
    pub assigned_gsn: Gsn,
    pub depends_gsn: Gsn,
    pub local_gsn: Gsn,
}

/// An immutable writeset. `last_seen_gsn` is the GSN the originating
/// transaction had observed when it started gathering; `ordering` is filled
/// in once the group-communication layer assigns a GSN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Writeset {
    pub source_id: Uuid,
    pub conn_id: i64,
    pub trx_id: i64,
    pub timestamp_ns: i64,
    pub flags: u32,
    pub last_seen_gsn: Gsn,
    pub keys: Vec<KeyEntry>,
    pub data: Vec<DataChange>,
    pub unordered: Vec<UnorderedChange>,
    pub annotations: Vec<Annotation>,
    pub ordering: Option<Ordering>,
    /// Checksum over the fields above, computed at `finalize()` and checked
    /// on recovery from the gcache.
    pub checksum: u32,
}

impl Writeset {
    pub fn builder(source_id: Uuid, conn_id: i64, trx_id: i64) -> WritesetBuilder {
        WritesetBuilder::new(source_id, conn_id, trx_id)
    }

    #[inline]
    pub fn is_commit(&self) -> bool {
        self.flags & F_COMMIT != 0
    }

    #[inline]
    pub fn is_rollback(&self) -> bool {
        self.flags & F_ROLLBACK != 0
    }

    #[inline]
    pub fn is_begin(&self) -> bool {
        self.flags & F_BEGIN != 0
    }

    #[inline]
    pub fn is_toi(&self) -> bool {
        self.flags & F_ISOLATION != 0
    }

    #[inline]
    pub fn pa_unsafe(&self) -> bool {
        self.flags & F_PA_UNSAFE != 0
    }

    #[inline]
    pub fn preordered(&self) -> bool {
        self.flags & F_PREORDERED != 0
    }

    /// Forces depends_gsn for writesets bypassing per-key certification
    /// (§4.3): TOI and parallel-apply-unsafe writesets fully serialize.
    #[inline]
    pub fn bypasses_cert_scan(&self) -> bool {
        self.pa_unsafe() || self.is_toi()
    }

    pub fn assigned_gsn(&self) -> Gsn {
        self.ordering.map(|o| o.assigned_gsn).unwrap_or(UNDEFINED)
    }

    pub fn depends_gsn(&self) -> Gsn {
        self.ordering.map(|o| o.depends_gsn).unwrap_or(UNDEFINED)
    }

    /// Marks this writeset as a dummy rollback after a certification
    /// conflict (§4.3): it still consumes its GSN slot in the monitors, but
    /// carries no data and applies as a no-op.
    pub fn mark_dummy(&mut self) {
        self.flags |= F_ROLLBACK;
        self.data.clear();
        self.unordered.clear();
        if let Some(o) = self.ordering.as_mut() {
            o.depends_gsn = UNDEFINED;
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.is_rollback() && self.data.is_empty()
    }

    fn checksum_input(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64 + self.data.len() * 16);
        buf.extend_from_slice(self.source_id.as_bytes());
        buf.extend_from_slice(&self.conn_id.to_le_bytes());
        buf.extend_from_slice(&self.trx_id.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.last_seen_gsn.to_le_bytes());
        for k in &self.keys {
            buf.push(k.access.is_exclusive() as u8);
            buf.push(k.key.version);
            buf.extend_from_slice(&k.key.encoded);
        }
        for d in &self.data {
            buf.extend_from_slice(d.table.as_bytes());
            buf.extend_from_slice(&d.payload);
        }
        for u in &self.unordered {
            buf.extend_from_slice(&u.payload);
        }
        buf
    }

    /// Recomputes and returns the checksum without mutating `self`.
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.checksum_input())
    }

    pub fn verify_checksum(&self) -> crate::Result<()> {
        if self.compute_checksum() != self.checksum {
            return Err(crate::RepError::ChecksumMismatch { gsn: self.assigned_gsn() });
        }
        Ok(())
    }

    /// Serializes to the crate's internal wire form. A real cluster would
    /// use a versioned, cross-language format here (out of scope, §1); this
    /// is the round-trip encoding exercised by the core's own tests and by
    /// the gcache.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        let (ws, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(ws)
    }
}

/// Accumulates keys/data/unordered changes for a local transaction before it
/// is handed to the group-communication layer. Mirrors the append-then-
/// gather lifecycle of a master transaction handle (§3, §4.4).
pub struct WritesetBuilder {
    source_id: Uuid,
    conn_id: i64,
    trx_id: i64,
    flags: u32,
    keys: Vec<KeyEntry>,
    data: Vec<DataChange>,
    unordered: Vec<UnorderedChange>,
    annotations: Vec<Annotation>,
}

impl WritesetBuilder {
    pub fn new(source_id: Uuid, conn_id: i64, trx_id: i64) -> Self {
        Self {
            source_id,
            conn_id,
            trx_id,
            flags: F_BEGIN,
            keys: Vec::new(),
            data: Vec::new(),
            unordered: Vec::new(),
            annotations: Vec::new(),
        }
    }

    pub fn append_key(&mut self, key: Key, access: KeyAccess) -> &mut Self {
        self.keys.push(KeyEntry { key, access });
        self
    }

    pub fn append_data(&mut self, table: impl Into<String>, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.data.push(DataChange { table: table.into(), payload: payload.into() });
        self
    }

    pub fn append_unordered(&mut self, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.unordered.push(UnorderedChange { payload: payload.into() });
        self
    }

    pub fn append_annotation(&mut self, payload: impl Into<Vec<u8>>) -> &mut Self {
        self.annotations.push(Annotation { payload: payload.into() });
        self
    }

    pub fn set_flag(&mut self, flag: u32) -> &mut Self {
        self.flags |= flag;
        self
    }

    pub fn clear_begin(&mut self) -> &mut Self {
        self.flags &= !F_BEGIN;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.data.is_empty() && self.unordered.is_empty()
    }

    /// Freezes the builder into an immutable writeset, not yet assigned a
    /// GSN. `last_seen_gsn` is the GSN observed at gather time (§3).
    pub fn finalize(self, last_seen_gsn: Gsn, timestamp_ns: i64) -> Writeset {
        let mut ws = Writeset {
            source_id: self.source_id,
            conn_id: self.conn_id,
            trx_id: self.trx_id,
            timestamp_ns,
            flags: self.flags,
            last_seen_gsn,
            keys: self.keys,
            data: self.data,
            unordered: self.unordered,
            annotations: self.annotations,
            ordering: None,
            checksum: 0,
        };
        ws.checksum = ws.compute_checksum();
        ws
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_encode_decode() {
        let mut b = Writeset::builder(Uuid::new_v4(), 1, 42);
        b.append_key(Key::from_str("a"), KeyAccess::Exclusive);
        b.append_data("accounts", b"payload".to_vec());
        b.set_flag(F_COMMIT);
        let ws = b.finalize(10, 1234);

        let bytes = ws.encode().unwrap();
        let back = Writeset::decode(&bytes).unwrap();

        assert_eq!(back.source_id, ws.source_id);
        assert_eq!(back.trx_id, ws.trx_id);
        assert_eq!(back.flags, ws.flags);
        assert_eq!(back.keys.len(), ws.keys.len());
        assert_eq!(back.data.len(), ws.data.len());
        back.verify_checksum().unwrap();
    }

    #[test]
    fn checksum_mismatch_detected() {
        let mut b = Writeset::builder(Uuid::new_v4(), 1, 1);
        b.append_key(Key::from_str("k"), KeyAccess::Shared);
        let mut ws = b.finalize(0, 0);
        ws.trx_id = 999; // tamper after finalize
        assert!(ws.verify_checksum().is_err());
    }

    #[test]
    fn mark_dummy_clears_data_and_sets_rollback() {
        let mut b = Writeset::builder(Uuid::new_v4(), 1, 1);
        b.append_data("t", b"x".to_vec());
        let mut ws = b.finalize(5, 0);
        ws.ordering = Some(Ordering { assigned_gsn: 6, depends_gsn: 5, local_gsn: 6 });

        ws.mark_dummy();

        assert!(ws.is_rollback());
        assert!(ws.data.is_empty());
        assert_eq!(ws.depends_gsn(), UNDEFINED);
        assert!(ws.is_dummy());
    }
}
