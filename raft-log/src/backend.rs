//! The log-backend seam (spec.md §9 "Dynamic dispatch of backends"): a
//! narrow trait implemented by both the flat-file backend ([`crate::flatfile`])
//! and the KV-engine backend ([`crate::kv`]). Optional operations
//! (checkpoint/reap/recover/sync) are modelled as `Err(LogError::NotSupported)`
//! results rather than an `Option<fn>` table, per the same design note.

use raft_proto::entry::{Entry, LogHeader};
use raft_proto::ids::EntryIndex;

use crate::error::Result;

/// The term/index pair recorded in an entry's header, read without paying
/// for the full payload — used by the leader to refresh a stale cached
/// `prev_term` for a peer (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub index: EntryIndex,
    pub term: i64,
}

pub trait LogBackend: Send {
    /// Appends `entry` durably. Fills in the identity/CRC fields, fails
    /// with `E2Big` (via `LogError::Proto`) and does not touch storage if
    /// the payload is oversized.
    fn write(&mut self, entry: &Entry) -> Result<()>;

    /// Reads the full entry (header + payload) at application `index`.
    fn read_full(&mut self, index: EntryIndex) -> Result<Entry>;

    /// Reads just the header fields of the entry at `index`.
    fn read_header(&mut self, index: EntryIndex) -> Result<EntryMeta>;

    /// Removes `index` and every entry after it, so `count_entries()`
    /// equals `index` afterward (exclusive-keep: suffix truncation after a
    /// leader-forced conflict resolution).
    fn truncate_to(&mut self, index: EntryIndex) -> Result<()>;

    /// `count_entries() = max(0, highest_index + 1 - lowest_index)`. Note
    /// (spec.md §9 open question 2): a byte/key-count alone cannot detect
    /// interior gaps; pair with [`LogBackend::recover_scan`] on first open.
    fn count_entries(&self) -> Result<u64>;

    /// Lowest application index still present (0 unless a reap happened).
    fn lowest_entry_index(&self) -> Result<EntryIndex>;

    /// Writes the persisted `{term, voted_for, seqno}` triple into whichever
    /// of the two rotating slots `seqno mod 2` (after pre-incrementing
    /// `seqno`) selects.
    fn header_write(&mut self, header: &LogHeader) -> Result<()>;

    /// Loads the log header with the larger `seqno` among the two slots,
    /// or `Err(LogError::NoValidHeader)` if neither validates.
    fn header_load(&mut self) -> Result<LogHeader>;

    /// Scans the header chain from the lowest to the highest present entry,
    /// verifying index/term monotonicity (invariant 2). Used once at open
    /// to catch interior gaps that a pure byte-size count would miss.
    fn recover_scan(&mut self) -> Result<()>;

    /// Snapshot + prefix removal support. `Err(NotSupported)` on backends
    /// that don't implement checkpointing (the flat-file backend).
    fn checkpoint(&mut self) -> Result<()> {
        Err(crate::error::LogError::NotSupported("checkpoint"))
    }

    /// Deletes all entries below `prefix_end_idx` after a checkpoint.
    fn reap(&mut self, _prefix_end_idx: EntryIndex) -> Result<()> {
        Err(crate::error::LogError::NotSupported("reap"))
    }

    /// Forces durability of anything buffered beyond the per-write fsync.
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    /// Records the apply-optimized `{last_applied_index, cumulative_crc}`
    /// pair (spec §4.E "Commit and apply") alongside the state-machine
    /// writes it accompanies. Backends without a dedicated slot for this
    /// (the flat-file backend) accept it as a no-op; `count_entries`/
    /// `recover_scan` remain the source of truth for them.
    fn record_applied(&mut self, _index: EntryIndex, _cumulative_crc: u32) -> Result<()> {
        Ok(())
    }
}
