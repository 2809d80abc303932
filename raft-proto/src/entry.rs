//! On-disk layout for a single raft log slot: a fixed 128-byte header
//! followed by a variable-length payload. Two of these slots (index 0 and 1
//! of the file/keyspace) hold rotating [`LogHeader`] snapshots instead of
//! application data; see `is_header_block`.
//!
//! Layout mirrors `examples/dennisss-dacha/pkg/haystack/src/store/needle.rs`
//! and `superblock.rs`: a magic, a CRC, then fields, read/written through a
//! `byteorder::Cursor` rather than `#[repr(C)]` transmutes.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::error::{ProtoError, Result};
use crate::ids::{EntryIndex, Term, NO_TERM};

pub const ENTRY_MAGIC: u64 = 0x1a2b_3c4d_d4c3_b2a1;
pub const LOG_HEADER_MAGIC: u64 = 0xafae_adac_abaa_a9a8;

/// Total size in bytes of one log slot on the flat-file backend.
pub const SLOT_SIZE: usize = 64 * 1024;

/// Fixed size of the header that precedes every entry's payload.
pub const ENTRY_HEADER_SIZE: usize = 128;

/// Largest payload an [`Entry`] may carry.
pub const MAX_ENTRY_DATA: usize = SLOT_SIZE - ENTRY_HEADER_SIZE;

/// The two reserved header slots occupy physical slots 0 and 1; application
/// entry `i` occupies physical slot `i + HEADER_SLOT_COUNT` (invariant 1).
pub const HEADER_SLOT_COUNT: u64 = 2;

/// A single durable log record: either an application entry or, when
/// `is_header_block` is set, the serialized payload of a [`LogHeader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub index: EntryIndex,
    pub term: Term,
    pub is_header_block: bool,
    pub self_id: Uuid,
    pub group_id: Uuid,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(index: EntryIndex, term: Term, self_id: Uuid, group_id: Uuid, data: Vec<u8>) -> Self {
        Entry {
            index,
            term,
            is_header_block: false,
            self_id,
            group_id,
            data,
        }
    }

    /// Serializes this entry into `header(128) || data`. Fails with
    /// [`ProtoError::E2Big`] if the payload is too large; the caller must
    /// not touch storage in that case (boundary behaviour in spec §8).
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_ENTRY_DATA {
            return Err(ProtoError::E2Big(self.data.len(), MAX_ENTRY_DATA));
        }

        let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + self.data.len());
        let mut header = Vec::with_capacity(ENTRY_HEADER_SIZE);
        header.write_u64::<LittleEndian>(ENTRY_MAGIC)?;
        // CRC placeholder; patched in below once the remainder is known.
        header.write_u32::<LittleEndian>(0)?;
        header.write_u32::<LittleEndian>(self.data.len() as u32)?;
        header.write_i64::<LittleEndian>(self.index)?;
        header.write_i64::<LittleEndian>(self.term)?;
        header.write_u8(self.is_header_block as u8)?;
        header.write_all(&[0u8; 7])?; // align to 8 bytes
        header.write_all(self.self_id.as_bytes())?;
        header.write_all(self.group_id.as_bytes())?;
        header.write_all(&vec![0u8; ENTRY_HEADER_SIZE - header.len()])?;
        debug_assert_eq!(header.len(), ENTRY_HEADER_SIZE);

        // CRC covers [data_size .. end of payload), i.e. excludes magic+crc.
        let crc_region_start = 8 + 4;
        let crc = crc32c::crc32c_append(
            crc32c::crc32c(&header[crc_region_start..]),
            &self.data,
        );
        header[8..12].copy_from_slice(&crc.to_le_bytes());

        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Parses `buf` (exactly `header + data_size` bytes) and validates it
    /// against the physical `slot` and expected identities. Returns a
    /// distinct error per spec §4.C so callers can tell a torn write from a
    /// genuine identity/slot mismatch.
    pub fn decode(
        buf: &[u8],
        slot: u64,
        expected_self: Uuid,
        expected_group: Uuid,
    ) -> Result<Entry> {
        if buf.len() < ENTRY_HEADER_SIZE {
            return Err(ProtoError::ShortBuffer {
                need: ENTRY_HEADER_SIZE,
                have: buf.len(),
            });
        }

        let mut cursor = Cursor::new(buf);
        let magic = cursor.read_u64::<LittleEndian>()?;
        if magic != ENTRY_MAGIC {
            return Err(ProtoError::BadMagic {
                expected: ENTRY_MAGIC,
                found: magic,
            });
        }
        let crc = cursor.read_u32::<LittleEndian>()?;
        let data_size = cursor.read_u32::<LittleEndian>()? as usize;
        let index = cursor.read_i64::<LittleEndian>()?;
        let term = cursor.read_i64::<LittleEndian>()?;
        let is_header_block = cursor.read_u8()? != 0;
        let mut pad7 = [0u8; 7];
        cursor.read_exact(&mut pad7)?;
        let mut self_bytes = [0u8; 16];
        cursor.read_exact(&mut self_bytes)?;
        let self_id = Uuid::from_bytes(self_bytes);
        let mut group_bytes = [0u8; 16];
        cursor.read_exact(&mut group_bytes)?;
        let group_id = Uuid::from_bytes(group_bytes);

        if buf.len() < ENTRY_HEADER_SIZE + data_size {
            return Err(ProtoError::ShortBuffer {
                need: ENTRY_HEADER_SIZE + data_size,
                have: buf.len(),
            });
        }
        let data = buf[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + data_size].to_vec();

        // Application slot i holds entry index i (header blocks use their own
        // physical slot 0/1, never run through `decode`'s slot check below
        // those two; callers convert physical slot -> application index).
        if !is_header_block && index != slot as i64 {
            return Err(ProtoError::BadSlot {
                embedded: index,
                slot: slot as i64,
            });
        }

        if self_id != expected_self || group_id != expected_group {
            return Err(ProtoError::WrongIdentity {
                expected_self,
                expected_group,
                found_self: self_id,
                found_group: group_id,
            });
        }

        let crc_region_start = 8 + 4;
        let computed = crc32c::crc32c_append(
            crc32c::crc32c(&buf[crc_region_start..ENTRY_HEADER_SIZE]),
            &data,
        );
        if computed != crc {
            return Err(ProtoError::CrcMismatch {
                expected: crc,
                computed,
            });
        }

        Ok(Entry {
            index,
            term,
            is_header_block,
            self_id,
            group_id,
            data,
        })
    }
}

/// The persisted `{term, voted_for, seqno}` triple. Two slots rotate forever
/// on alternating `seqno` parity (invariant 3) so a torn write leaves one
/// valid copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub term: Term,
    pub seqno: u64,
    pub voted_for: Option<Uuid>,
}

impl LogHeader {
    pub const ENCODED_SIZE: usize = 8 + 8 + 8 + 16; // magic + term + seqno + voted_for

    pub fn initial() -> Self {
        LogHeader {
            term: NO_TERM,
            seqno: 0,
            voted_for: None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::ENCODED_SIZE);
        buf.write_u64::<LittleEndian>(LOG_HEADER_MAGIC)?;
        buf.write_i64::<LittleEndian>(self.term)?;
        buf.write_u64::<LittleEndian>(self.seqno)?;
        buf.write_all(self.voted_for.unwrap_or(Uuid::nil()).as_bytes())?;
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<LogHeader> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(ProtoError::ShortBuffer {
                need: Self::ENCODED_SIZE,
                have: buf.len(),
            });
        }
        let mut cursor = Cursor::new(buf);
        let magic = cursor.read_u64::<LittleEndian>()?;
        if magic != LOG_HEADER_MAGIC {
            return Err(ProtoError::BadMagic {
                expected: LOG_HEADER_MAGIC,
                found: magic,
            });
        }
        let term = cursor.read_i64::<LittleEndian>()?;
        let seqno = cursor.read_u64::<LittleEndian>()?;
        let mut voted = [0u8; 16];
        cursor.read_exact(&mut voted)?;
        let voted_for = {
            let u = Uuid::from_bytes(voted);
            if u.is_nil() {
                None
            } else {
                Some(u)
            }
        };
        Ok(LogHeader {
            term,
            seqno,
            voted_for,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips() {
        let e = Entry::new(5, 2, Uuid::new_v4(), Uuid::new_v4(), b"hello world".to_vec());
        let encoded = e.encode().unwrap();
        let decoded = Entry::decode(&encoded, 5, e.self_id, e.group_id).unwrap();
        assert_eq!(e, decoded);
    }

    #[test]
    fn entry_rejects_oversized_payload() {
        let e = Entry::new(0, 0, Uuid::nil(), Uuid::nil(), vec![0u8; MAX_ENTRY_DATA + 1]);
        match e.encode() {
            Err(ProtoError::E2Big(_, _)) => {}
            other => panic!("expected E2Big, got {:?}", other),
        }
    }

    #[test]
    fn entry_detects_wrong_slot() {
        let e = Entry::new(5, 2, Uuid::nil(), Uuid::nil(), b"x".to_vec());
        let encoded = e.encode().unwrap();
        match Entry::decode(&encoded, 6, Uuid::nil(), Uuid::nil()) {
            Err(ProtoError::BadSlot { embedded: 5, slot: 6 }) => {}
            other => panic!("expected BadSlot, got {:?}", other),
        }
    }

    #[test]
    fn entry_detects_corruption() {
        let e = Entry::new(0, 0, Uuid::nil(), Uuid::nil(), b"payload".to_vec());
        let mut encoded = e.encode().unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        match Entry::decode(&encoded, 0, Uuid::nil(), Uuid::nil()) {
            Err(ProtoError::CrcMismatch { .. }) => {}
            other => panic!("expected CrcMismatch, got {:?}", other),
        }
    }

    #[test]
    fn log_header_round_trips() {
        let h = LogHeader {
            term: 7,
            seqno: 11,
            voted_for: Some(Uuid::new_v4()),
        };
        let encoded = h.encode().unwrap();
        let decoded = LogHeader::decode(&encoded).unwrap();
        assert_eq!(h, decoded);
    }
}
