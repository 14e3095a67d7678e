//! Ring-buffer writeset cache (§4.1, C1): a memory-mapped, length-prefixed
//! ring buffer keyed by GSN. Serves recent writesets for incremental state
//! transfer and survives a crash via a bidirectional scan on open, anchored
//! at the offset recorded in the last clean preamble sync.

use std::fs::OpenOptions;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RepError, Result};
use crate::gsn::{Gsn, UNDEFINED};
use crate::writeset::Writeset;

const PREAMBLE_LEN: usize = 1024;
const RECORD_MAGIC: u32 = 0x4757_5253; // "GWRS"
const RECORD_HEADER_LEN: usize = 24; // magic(4) + len(4) + gsn(8) + flags(4) + pad(4)
const TRAILER_LEN: usize = 4; // len mirrored after the payload, so recovery can walk backward

/// Pool a buffer currently belongs to (§3 "Ring-buffer buffer header").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Used,
    Released,
}

#[derive(Debug, Clone, Copy)]
struct BufferLoc {
    offset: usize,
    record_len: usize,
    pool: Pool,
}

/// Running counters the gcache exposes alongside the replicator's own
/// statistics (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct GCacheStats {
    pub used_bytes: usize,
    pub released_bytes: usize,
    pub free_bytes: usize,
    pub entry_count: usize,
}

/// Memory-mapped ring buffer. `capacity` bounds the arena after the
/// preamble; the preamble itself carries the replica's identity and the
/// GSN range currently held, so a restart can decide whether to request a
/// full or incremental state transfer.
pub struct GCache {
    path: PathBuf,
    mmap: MmapMut,
    capacity: usize,
    write_offset: usize,
    index: BTreeMap<Gsn, BufferLoc>,
    used_bytes: usize,
    released_bytes: usize,
    seqno_min: Gsn,
    seqno_max: Gsn,
    freeze_purge_at: Option<Gsn>,
    gid: Uuid,
}

impl GCache {
    /// Creates a fresh cache file of `total_size` bytes (preamble + arena),
    /// or opens and recovers an existing one.
    pub fn open(path: impl AsRef<Path>, total_size: usize, gid: Uuid) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let is_new = !path.exists();

        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        if is_new {
            file.set_len(total_size as u64)?;
        }
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let capacity = mmap.len().saturating_sub(PREAMBLE_LEN);

        let mut cache = Self {
            path,
            mmap,
            capacity,
            write_offset: 0,
            index: BTreeMap::new(),
            used_bytes: 0,
            released_bytes: 0,
            seqno_min: UNDEFINED,
            seqno_max: UNDEFINED,
            freeze_purge_at: None,
            gid,
        };

        if is_new {
            cache.write_preamble()?;
            info!(path = %cache.path.display(), total_size, "initialized new ring buffer cache");
        } else {
            cache.recover()?;
            info!(
                path = %cache.path.display(),
                entries = cache.index.len(),
                seqno_min = cache.seqno_min,
                seqno_max = cache.seqno_max,
                "recovered ring buffer cache"
            );
        }
        Ok(cache)
    }

    fn write_preamble(&mut self) -> Result<()> {
        let text = format!(
            "version=1\ngid={}\nseqno_min={}\nseqno_max={}\noffset={}\nsynced=0\n",
            self.gid, self.seqno_min, self.seqno_max, self.write_offset
        );
        let bytes = text.into_bytes();
        assert!(bytes.len() <= PREAMBLE_LEN, "preamble grew past its reserved size");
        self.mmap[..bytes.len()].copy_from_slice(&bytes);
        for b in &mut self.mmap[bytes.len()..PREAMBLE_LEN] {
            *b = 0;
        }
        Ok(())
    }

    fn read_preamble(&self) -> Result<(Gsn, Gsn, usize)> {
        let raw = &self.mmap[..PREAMBLE_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = std::str::from_utf8(&raw[..end])
            .map_err(|e| RepError::InconsistentState(format!("preamble not utf8: {e}")))?;
        let mut seqno_min = UNDEFINED;
        let mut seqno_max = UNDEFINED;
        let mut offset = 0usize;
        for line in text.lines() {
            let Some((k, v)) = line.split_once('=') else { continue };
            match k {
                "seqno_min" => seqno_min = v.parse().unwrap_or(UNDEFINED),
                "seqno_max" => seqno_max = v.parse().unwrap_or(UNDEFINED),
                "offset" => offset = v.parse().unwrap_or(0),
                _ => {}
            }
        }
        Ok((seqno_min, seqno_max, offset))
    }

    fn arena(&self) -> &[u8] {
        &self.mmap[PREAMBLE_LEN..]
    }

    fn arena_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[PREAMBLE_LEN..]
    }

    /// Recovery scan (§4.1): anchored at the `offset` persisted in the last
    /// clean preamble sync rather than byte 0, which is stale or garbage
    /// once the ring has wrapped at least once. Walks backward from the
    /// anchor via each record's mirrored trailer length to recover the live
    /// run ending there, then forward from the anchor to pick up anything
    /// appended after that sync but before a crash.
    fn recover(&mut self) -> Result<()> {
        let (seqno_min, seqno_max, persisted_offset) = self.read_preamble()?;
        self.seqno_min = seqno_min;
        self.seqno_max = seqno_max;
        self.index.clear();
        self.used_bytes = 0;
        self.released_bytes = 0;

        if self.capacity < RECORD_HEADER_LEN + TRAILER_LEN {
            self.write_offset = 0;
            return Ok(());
        }
        let anchor = persisted_offset % self.capacity;
        let max_records = self.capacity / (RECORD_HEADER_LEN + TRAILER_LEN) + 1;

        let mut backward = Vec::new();
        let mut cursor = anchor;
        for _ in 0..max_records {
            match self.read_record_ending_at(cursor) {
                Some((gsn, record_start, record_len)) => {
                    backward.push((gsn, record_start, record_len));
                    cursor = record_start;
                }
                None => break,
            }
        }
        backward.reverse();
        let run_start = backward.first().map(|&(_, off, _)| off).unwrap_or(anchor);

        let mut forward = Vec::new();
        let mut offset = anchor;
        for _ in 0..max_records {
            if offset == run_start && !forward.is_empty() {
                break;
            }
            match self.read_record_starting_at(offset) {
                Some((gsn, record_len)) => {
                    forward.push((gsn, offset, record_len));
                    offset = (offset + record_len) % self.capacity;
                }
                None => break,
            }
        }
        if forward.is_empty() {
            warn!(anchor, "no record extends forward of the recovery anchor");
        }

        let mut max_seen = UNDEFINED;
        for (gsn, offset, record_len) in backward.into_iter().chain(forward) {
            self.index.insert(gsn, BufferLoc { offset, record_len, pool: Pool::Used });
            self.used_bytes += record_len;
            max_seen = max_seen.max(gsn);
        }
        self.write_offset = offset;
        if max_seen > self.seqno_max {
            self.seqno_max = max_seen;
        }
        if self.seqno_min < 0 {
            self.seqno_min = self.index.keys().next().copied().unwrap_or(UNDEFINED);
        }
        Ok(())
    }

    /// Validates and reads the record whose header starts at `offset`
    /// (the forward half of recovery).
    fn read_record_starting_at(&self, offset: usize) -> Option<(Gsn, usize)> {
        if offset + RECORD_HEADER_LEN > self.capacity {
            return None;
        }
        let header = self.read_wrapping(offset, RECORD_HEADER_LEN);
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != RECORD_MAGIC {
            return None;
        }
        let len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let gsn = i64::from_le_bytes(header[8..16].try_into().unwrap());
        let record_len = RECORD_HEADER_LEN + len + TRAILER_LEN;
        if record_len > self.capacity {
            return None;
        }
        let payload = self.read_wrapping((offset + RECORD_HEADER_LEN) % self.capacity, len);
        let trailer = self.read_wrapping((offset + RECORD_HEADER_LEN + len) % self.capacity, TRAILER_LEN);
        let trailer_len = u32::from_le_bytes(trailer[..4].try_into().unwrap()) as usize;
        if trailer_len != len {
            return None;
        }
        match Writeset::decode(&payload) {
            Ok(ws) if ws.verify_checksum().is_ok() => Some((gsn, record_len)),
            _ => None,
        }
    }

    /// Validates and reads the record whose trailer ends at `end`, walking
    /// backward via the length mirrored in that trailer (the backward half
    /// of recovery).
    fn read_record_ending_at(&self, end: usize) -> Option<(Gsn, usize, usize)> {
        let trailer = self.read_wrapping_before(end, TRAILER_LEN);
        let len = u32::from_le_bytes(trailer[..4].try_into().unwrap()) as usize;
        let record_len = RECORD_HEADER_LEN + len + TRAILER_LEN;
        if record_len == 0 || record_len > self.capacity {
            return None;
        }
        let record_start = (end + self.capacity - record_len) % self.capacity;
        let header = self.read_wrapping(record_start, RECORD_HEADER_LEN);
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let hdr_len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        if magic != RECORD_MAGIC || hdr_len != len {
            return None;
        }
        let gsn = i64::from_le_bytes(header[8..16].try_into().unwrap());
        let payload = self.read_wrapping((record_start + RECORD_HEADER_LEN) % self.capacity, len);
        match Writeset::decode(&payload) {
            Ok(ws) if ws.verify_checksum().is_ok() => Some((gsn, record_start, record_len)),
            _ => None,
        }
    }

    /// Reads `len` bytes ending (exclusive) at physical offset `end`,
    /// wrapping backward through the arena boundary if needed.
    fn read_wrapping_before(&self, end: usize, len: usize) -> Vec<u8> {
        let capacity = self.capacity.max(1);
        let start = (end + capacity - len) % capacity;
        self.read_wrapping(start, len)
    }

    fn free_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.used_bytes + self.released_bytes)
    }

    /// Reclaims space by popping the physically oldest buffer — the
    /// smallest GSN still in the index — until at least `needed` bytes are
    /// free. The index's GSN order is also the ring's physical order (every
    /// buffer is appended at `write_offset` in increasing GSN order), so the
    /// smallest GSN is always the buffer adjacent to the free region. That
    /// invariant is what makes `free_bytes()` trustworthy: reclaiming must
    /// stop, not skip ahead, the moment that buffer is still `Used`, or a
    /// later `write_wrapping` could overwrite it while the byte-count
    /// accounting still reports enough room (§8 "Cache wrap").
    fn reclaim(&mut self, needed: usize) -> Result<()> {
        while self.free_bytes() < needed {
            let Some((&gsn, loc)) = self.index.iter().next().map(|(g, l)| (*g, *l)) else {
                return Err(RepError::OutOfSpace { requested: needed });
            };
            if loc.pool != Pool::Released {
                return Err(RepError::OutOfSpace { requested: needed });
            }
            self.index.remove(&gsn);
            self.released_bytes -= loc.record_len;
            if self.seqno_min == gsn {
                self.seqno_min = self.index.keys().next().copied().unwrap_or(UNDEFINED);
            }
        }
        Ok(())
    }

    /// Allocates a new buffer for `ws` at `gsn`, wrapping the ring and
    /// reclaiming released space as needed.
    pub fn malloc(&mut self, gsn: Gsn, ws: &Writeset) -> Result<()> {
        let payload = ws.encode()?;
        let record_len = RECORD_HEADER_LEN + payload.len() + TRAILER_LEN;
        if record_len > self.capacity {
            return Err(RepError::OutOfSpace { requested: record_len });
        }
        self.reclaim(record_len)?;

        let mut header = [0u8; RECORD_HEADER_LEN];
        header[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[8..16].copy_from_slice(&gsn.to_le_bytes());

        let start = self.write_offset;
        let mut record = Vec::with_capacity(record_len);
        record.extend_from_slice(&header);
        record.extend_from_slice(&payload);
        record.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.write_wrapping(start, &record);

        self.index.insert(gsn, BufferLoc { offset: start, record_len, pool: Pool::Used });
        self.used_bytes += record_len;
        self.write_offset = (start + record_len) % self.capacity.max(1);
        if self.seqno_min < 0 {
            self.seqno_min = gsn;
        }
        self.seqno_max = self.seqno_max.max(gsn);
        debug!(gsn, record_len, "allocated gcache buffer");
        Ok(())
    }

    fn write_wrapping(&mut self, start: usize, data: &[u8]) {
        let capacity = self.capacity;
        let arena = self.arena_mut();
        let first = (capacity - start).min(data.len());
        arena[start..start + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            arena[..data.len() - first].copy_from_slice(&data[first..]);
        }
    }

    fn read_wrapping(&self, start: usize, len: usize) -> Vec<u8> {
        let capacity = self.capacity;
        let arena = self.arena();
        let first = (capacity - start).min(len);
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&arena[start..start + first]);
        if first < len {
            out.extend_from_slice(&arena[..len - first]);
        }
        out
    }

    /// Reads back the writeset stored at `gsn`, verifying its checksum.
    pub fn get(&self, gsn: Gsn) -> Result<Writeset> {
        let loc = self.index.get(&gsn).ok_or_else(|| RepError::NotFound(format!("gcache entry {gsn}")))?;
        let record = self.read_wrapping(loc.offset, loc.record_len);
        let ws = Writeset::decode(&record[RECORD_HEADER_LEN..])?;
        ws.verify_checksum()?;
        Ok(ws)
    }

    /// Iterates the GSN index over `[from_gsn, to_gsn]` to serve an
    /// incremental state transfer range (§6 `StateTransfer::serve_ist`,
    /// C1 "serve ranges for incremental state transfer").
    pub fn writesets_in_range(&self, from_gsn: Gsn, to_gsn: Gsn) -> Result<Vec<Writeset>> {
        let gsns: Vec<Gsn> = self.index.range(from_gsn..=to_gsn).map(|(&g, _)| g).collect();
        gsns.into_iter().map(|g| self.get(g)).collect()
    }

    /// Moves a buffer from `used` to `released`: still addressable, but
    /// eligible for automatic reclamation under space pressure.
    pub fn discard(&mut self, gsn: Gsn) {
        if let Some(loc) = self.index.get_mut(&gsn) {
            if loc.pool == Pool::Used {
                self.used_bytes -= loc.record_len;
                self.released_bytes += loc.record_len;
                loc.pool = Pool::Released;
            }
        }
    }

    /// Moves a buffer back from `released` to `used`, e.g. because a donor
    /// state transfer needs to serve it again before it's freed.
    pub fn repossess(&mut self, gsn: Gsn) -> Result<()> {
        let loc = self.index.get_mut(&gsn).ok_or_else(|| RepError::NotFound(format!("gcache entry {gsn}")))?;
        if loc.pool == Pool::Released {
            self.released_bytes -= loc.record_len;
            self.used_bytes += loc.record_len;
            loc.pool = Pool::Used;
        }
        Ok(())
    }

    /// Frees released entries at or below `gsn`, respecting a donor freeze
    /// watermark if one is set (§4.1 IST freeze). Like `reclaim`, this only
    /// ever pops from the physically oldest end (smallest GSN) and stops at
    /// the first entry that is still `Used` or past the ceiling — freeing a
    /// later-but-not-earliest entry would leave a gap that isn't physically
    /// contiguous with the write frontier.
    pub fn discard_seqnos(&mut self, gsn: Gsn) {
        let ceiling = match self.freeze_purge_at {
            Some(freeze) => gsn.min(freeze),
            None => gsn,
        };
        loop {
            let Some((&g, loc)) = self.index.iter().next().map(|(g, l)| (*g, *l)) else { break };
            if g > ceiling || loc.pool != Pool::Released {
                break;
            }
            self.index.remove(&g);
            self.released_bytes -= loc.record_len;
        }
        self.seqno_min = self.index.keys().next().copied().unwrap_or(UNDEFINED);
    }

    /// Pins the purge watermark so a concurrent donor transfer keeps
    /// serving a stable GSN range even while new writesets discard theirs.
    pub fn freeze_purge_at(&mut self, gsn: Gsn) {
        self.freeze_purge_at = Some(gsn);
    }

    pub fn unfreeze_purge(&mut self) {
        self.freeze_purge_at = None;
    }

    pub fn seqno_range(&self) -> (Gsn, Gsn) {
        (self.seqno_min, self.seqno_max)
    }

    pub fn contains(&self, gsn: Gsn) -> bool {
        self.index.contains_key(&gsn)
    }

    pub fn stats(&self) -> GCacheStats {
        GCacheStats {
            used_bytes: self.used_bytes,
            released_bytes: self.released_bytes,
            free_bytes: self.free_bytes(),
            entry_count: self.index.len(),
        }
    }

    /// Flushes the preamble so the next open can resume without a full
    /// recovery scan when the shutdown was clean.
    pub fn sync(&mut self) -> Result<()> {
        self.write_preamble()?;
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writeset::{Key, KeyAccess, Writeset};
    use tempfile::tempdir;

    fn sample(trx_id: i64) -> Writeset {
        let mut b = Writeset::builder(Uuid::new_v4(), 1, trx_id);
        b.append_key(Key::from_str("k"), KeyAccess::Exclusive);
        b.append_data("t", b"payload".to_vec());
        b.set_flag(crate::writeset::F_COMMIT);
        b.finalize(0, 0)
    }

    #[test]
    fn malloc_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gcache.db");
        let mut cache = GCache::open(&path, PREAMBLE_LEN + 64 * 1024, Uuid::new_v4()).unwrap();

        let ws = sample(1);
        cache.malloc(1, &ws).unwrap();
        let back = cache.get(1).unwrap();
        assert_eq!(back.trx_id, ws.trx_id);
        assert_eq!(cache.seqno_range(), (1, 1));
    }

    #[test]
    fn discard_then_reclaim_frees_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gcache.db");
        let arena = PREAMBLE_LEN + 4096;
        let mut cache = GCache::open(&path, arena, Uuid::new_v4()).unwrap();

        for gsn in 1..=5 {
            let ws = sample(gsn);
            cache.malloc(gsn, &ws).unwrap();
            cache.discard(gsn);
        }
        let stats_before = cache.stats();
        assert_eq!(stats_before.used_bytes, 0);
        assert!(stats_before.released_bytes > 0);

        cache.discard_seqnos(5);
        let stats_after = cache.stats();
        assert_eq!(stats_after.released_bytes, 0);
        assert_eq!(stats_after.entry_count, 0);
    }

    #[test]
    fn freeze_purge_protects_watermark() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gcache.db");
        let mut cache = GCache::open(&path, PREAMBLE_LEN + 4096, Uuid::new_v4()).unwrap();

        for gsn in 1..=3 {
            let ws = sample(gsn);
            cache.malloc(gsn, &ws).unwrap();
            cache.discard(gsn);
        }
        cache.freeze_purge_at(1);
        cache.discard_seqnos(3);
        assert!(cache.contains(2));
        assert!(cache.contains(3));
        assert!(!cache.contains(1));
    }

    #[test]
    fn wrap_reuses_discarded_space_without_corrupting_live_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gcache.db");
        let record_len = RECORD_HEADER_LEN + sample(0).encode().unwrap().len() + TRAILER_LEN;
        // Room for three records plus a little slack: nothing fits a fourth
        // until the oldest two are discarded and reclaimed.
        let arena = record_len * 3 + record_len / 2;
        let mut cache = GCache::open(&path, PREAMBLE_LEN + arena, Uuid::new_v4()).unwrap();

        for gsn in 1..=3 {
            cache.malloc(gsn, &sample(gsn)).unwrap();
        }
        cache.discard(1);
        cache.discard(2);

        // These two wrap the ring, physically reusing gsn 1 and 2's space.
        cache.malloc(4, &sample(4)).unwrap();
        cache.malloc(5, &sample(5)).unwrap();

        for gsn in [3, 4, 5] {
            assert_eq!(cache.get(gsn).unwrap().trx_id, gsn);
        }
        assert!(!cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn malloc_refuses_to_overwrite_a_still_used_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gcache.db");
        let record_len = RECORD_HEADER_LEN + sample(0).encode().unwrap().len() + TRAILER_LEN;
        // Room for one record and a little slack, never discarded: the
        // second malloc must fail rather than silently wrap over gsn 1.
        let arena = record_len + record_len / 2;
        let mut cache = GCache::open(&path, PREAMBLE_LEN + arena, Uuid::new_v4()).unwrap();

        cache.malloc(1, &sample(1)).unwrap();
        assert!(cache.malloc(2, &sample(2)).is_err());
        assert_eq!(cache.get(1).unwrap().trx_id, 1);
    }

    #[test]
    fn recovery_rebuilds_index_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gcache.db");
        let gid = Uuid::new_v4();
        {
            let mut cache = GCache::open(&path, PREAMBLE_LEN + 64 * 1024, gid).unwrap();
            for gsn in 1..=3 {
                let ws = sample(gsn);
                cache.malloc(gsn, &ws).unwrap();
            }
            cache.sync().unwrap();
        }
        let reopened = GCache::open(&path, PREAMBLE_LEN + 64 * 1024, gid).unwrap();
        assert!(reopened.contains(1));
        assert!(reopened.contains(2));
        assert!(reopened.contains(3));
        assert_eq!(reopened.seqno_range(), (1, 3));
    }
}
