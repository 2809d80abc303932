use uuid::Uuid;

/// Stable 128-bit identity of a single peer (niova: `raft_peer_t`).
pub type PeerId = Uuid;

/// Identity of the raft group; every RPC carries both sender and group id.
pub type RaftId = Uuid;

/// Monotonically non-decreasing signed term number.
pub type Term = i64;

/// Index of an entry in the application log. `-1` denotes "no entry yet".
pub type EntryIndex = i64;

/// Sentinel value of [`EntryIndex`] meaning "no entry yet".
pub const NO_ENTRY: EntryIndex = -1;

/// Sentinel value of [`Term`] used before any term has been observed.
pub const NO_TERM: Term = 0;
