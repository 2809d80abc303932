//! Wire-level binary layouts shared by the raft server and client: the
//! durable [`entry::Entry`]/[`entry::LogHeader`] records and the
//! [`envelope::RpcEnvelope`] carried over the peer and client sockets.

pub mod entry;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod messages;

pub use entry::{Entry, LogHeader, ENTRY_HEADER_SIZE, MAX_ENTRY_DATA, SLOT_SIZE};
pub use envelope::{PayloadKind, RpcEnvelope};
pub use error::{ProtoError, Result};
pub use ids::{EntryIndex, PeerId, RaftId, Term, NO_ENTRY, NO_TERM};
