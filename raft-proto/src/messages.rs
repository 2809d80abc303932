//! Typed bodies carried inside an [`crate::envelope::RpcEnvelope`]'s `data`
//! field. Encoded the same manual-`byteorder` way as the envelope itself —
//! small, fixed-shape structs, no general-purpose serialization framework.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::error::Result;
use crate::ids::{EntryIndex, Term};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteRequest {
    pub proposed_term: Term,
    pub last_log_term: Term,
    pub last_log_index: EntryIndex,
}

impl VoteRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(24);
        buf.write_i64::<LittleEndian>(self.proposed_term)?;
        buf.write_i64::<LittleEndian>(self.last_log_term)?;
        buf.write_i64::<LittleEndian>(self.last_log_index)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        Ok(VoteRequest {
            proposed_term: c.read_i64::<LittleEndian>()?,
            last_log_term: c.read_i64::<LittleEndian>()?,
            last_log_index: c.read_i64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

impl VoteReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(9);
        buf.write_i64::<LittleEndian>(self.term)?;
        buf.write_u8(self.vote_granted as u8)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        Ok(VoteReply {
            term: c.read_i64::<LittleEndian>()?,
            vote_granted: c.read_u8()? != 0,
        })
    }
}

/// One replicated entry as carried inline in an `AppendEntries` request
/// (distinct from [`crate::entry::Entry`], which is the on-disk form; this
/// one is wire-only and never carries the identity/slot fields).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedEntry {
    pub index: EntryIndex,
    pub term: Term,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRequest {
    pub term: Term,
    pub commit_index: EntryIndex,
    pub prev_log_index: EntryIndex,
    pub prev_log_term: Term,
    pub entries: Vec<ReplicatedEntry>,
}

impl AppendRequest {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_i64::<LittleEndian>(self.term)?;
        buf.write_i64::<LittleEndian>(self.commit_index)?;
        buf.write_i64::<LittleEndian>(self.prev_log_index)?;
        buf.write_i64::<LittleEndian>(self.prev_log_term)?;
        buf.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for e in &self.entries {
            buf.write_i64::<LittleEndian>(e.index)?;
            buf.write_i64::<LittleEndian>(e.term)?;
            buf.write_u32::<LittleEndian>(e.data.len() as u32)?;
            buf.write_all(&e.data)?;
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let term = c.read_i64::<LittleEndian>()?;
        let commit_index = c.read_i64::<LittleEndian>()?;
        let prev_log_index = c.read_i64::<LittleEndian>()?;
        let prev_log_term = c.read_i64::<LittleEndian>()?;
        let count = c.read_u32::<LittleEndian>()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let index = c.read_i64::<LittleEndian>()?;
            let term = c.read_i64::<LittleEndian>()?;
            let len = c.read_u32::<LittleEndian>()? as usize;
            let mut data = vec![0u8; len];
            c.read_exact(&mut data)?;
            entries.push(ReplicatedEntry { index, term, data });
        }
        Ok(AppendRequest {
            term,
            commit_index,
            prev_log_index,
            prev_log_term,
            entries,
        })
    }

    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendReply {
    pub term: Term,
    pub stale_term: bool,
    pub non_matching_prev_term: bool,
    pub last_log_index: EntryIndex,
}

impl AppendReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(25);
        buf.write_i64::<LittleEndian>(self.term)?;
        buf.write_u8(self.stale_term as u8)?;
        buf.write_u8(self.non_matching_prev_term as u8)?;
        buf.write_i64::<LittleEndian>(self.last_log_index)?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        Ok(AppendReply {
            term: c.read_i64::<LittleEndian>()?,
            stale_term: c.read_u8()? != 0,
            non_matching_prev_term: c.read_u8()? != 0,
            last_log_index: c.read_i64::<LittleEndian>()?,
        })
    }
}

/// Carries the suspected leader's peer id back to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    pub leader: Uuid,
}

impl Redirect {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(self.leader.as_bytes().to_vec())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut bytes = [0u8; 16];
        let mut c = Cursor::new(buf);
        c.read_exact(&mut bytes)?;
        Ok(Redirect {
            leader: Uuid::from_bytes(bytes),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_request_round_trips_with_entries() {
        let req = AppendRequest {
            term: 3,
            commit_index: 10,
            prev_log_index: 9,
            prev_log_term: 3,
            entries: vec![
                ReplicatedEntry { index: 10, term: 3, data: b"a".to_vec() },
                ReplicatedEntry { index: 11, term: 3, data: b"bb".to_vec() },
            ],
        };
        let encoded = req.encode().unwrap();
        let decoded = AppendRequest::decode(&encoded).unwrap();
        assert_eq!(req, decoded);
        assert!(!decoded.is_heartbeat());
    }

    #[test]
    fn heartbeat_has_no_entries() {
        let req = AppendRequest {
            term: 1,
            commit_index: -1,
            prev_log_index: -1,
            prev_log_term: 0,
            entries: vec![],
        };
        assert!(req.is_heartbeat());
    }
}
