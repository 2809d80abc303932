//! The fixed-format RPC envelope sent over both the peer and client
//! datagram sockets, plus its trailing payload. Field layout is packed by
//! hand with `byteorder`, the same idiom used for [`crate::entry::Entry`].

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

use crate::error::{ProtoError, Result};

/// Current (and only) envelope wire version.
pub const ENVELOPE_VERSION: u16 = 0;

/// Maximum payload carried by one envelope (keeps a VoteReq/AppendReq/etc.
/// within one UDP datagram).
pub const MAX_ENVELOPE_DATA: usize = 60 * 1024;

const ENVELOPE_HEADER_SIZE: usize =
    2 + 2 + 16 + 16 + 16 + 8 + 1 + 4 + 4 + 4; // see field list below

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    VoteReq = 1,
    VoteRep = 2,
    AppendReq = 3,
    AppendRep = 4,
    ClientReq = 5,
    ClientRep = 6,
    Ping = 7,
    PingRep = 8,
    Redirect = 9,
}

impl PayloadKind {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => PayloadKind::VoteReq,
            2 => PayloadKind::VoteRep,
            3 => PayloadKind::AppendReq,
            4 => PayloadKind::AppendRep,
            5 => PayloadKind::ClientReq,
            6 => PayloadKind::ClientRep,
            7 => PayloadKind::Ping,
            8 => PayloadKind::PingRep,
            9 => PayloadKind::Redirect,
            other => return Err(ProtoError::UnknownPayloadKind(other)),
        })
    }
}

/// `{ type, version, sender_id, group_id, dest_id?, msg_id?, payload_kind,
/// sys_error, app_error, data_size, data[] }` from spec §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEnvelope {
    pub version: u16,
    pub sender_id: Uuid,
    pub group_id: Uuid,
    pub dest_id: Option<Uuid>,
    pub msg_id: Option<u64>,
    pub payload_kind: PayloadKind,
    /// Transport/protocol-level condition (e.g. "not leader", "busy").
    pub sys_error: i32,
    /// Application-level error surfaced to the caller.
    pub app_error: i32,
    pub data: Vec<u8>,
}

impl RpcEnvelope {
    pub fn new(sender_id: Uuid, group_id: Uuid, payload_kind: PayloadKind, data: Vec<u8>) -> Self {
        RpcEnvelope {
            version: ENVELOPE_VERSION,
            sender_id,
            group_id,
            dest_id: None,
            msg_id: None,
            payload_kind,
            sys_error: 0,
            app_error: 0,
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.data.len() > MAX_ENVELOPE_DATA {
            return Err(ProtoError::E2Big(self.data.len(), MAX_ENVELOPE_DATA));
        }
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_SIZE + self.data.len());
        buf.write_u16::<LittleEndian>(self.payload_kind as u8 as u16)?;
        buf.write_u16::<LittleEndian>(self.version)?;
        buf.write_all(self.sender_id.as_bytes())?;
        buf.write_all(self.group_id.as_bytes())?;
        buf.write_all(self.dest_id.unwrap_or(Uuid::nil()).as_bytes())?;
        buf.write_u64::<LittleEndian>(self.msg_id.unwrap_or(0))?;
        buf.write_u8((self.msg_id.is_some()) as u8)?;
        buf.write_i32::<LittleEndian>(self.sys_error)?;
        buf.write_i32::<LittleEndian>(self.app_error)?;
        buf.write_u32::<LittleEndian>(self.data.len() as u32)?;
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<RpcEnvelope> {
        if buf.len() < ENVELOPE_HEADER_SIZE {
            return Err(ProtoError::ShortBuffer {
                need: ENVELOPE_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let mut cursor = Cursor::new(buf);
        let kind_tag = cursor.read_u16::<LittleEndian>()? as u8;
        let version = cursor.read_u16::<LittleEndian>()?;
        let mut sender_bytes = [0u8; 16];
        cursor.read_exact(&mut sender_bytes)?;
        let mut group_bytes = [0u8; 16];
        cursor.read_exact(&mut group_bytes)?;
        let mut dest_bytes = [0u8; 16];
        cursor.read_exact(&mut dest_bytes)?;
        let msg_id_raw = cursor.read_u64::<LittleEndian>()?;
        let msg_id_present = cursor.read_u8()? != 0;
        let sys_error = cursor.read_i32::<LittleEndian>()?;
        let app_error = cursor.read_i32::<LittleEndian>()?;
        let data_size = cursor.read_u32::<LittleEndian>()? as usize;

        if buf.len() < ENVELOPE_HEADER_SIZE + data_size {
            return Err(ProtoError::ShortBuffer {
                need: ENVELOPE_HEADER_SIZE + data_size,
                have: buf.len(),
            });
        }

        let dest_id = {
            let u = Uuid::from_bytes(dest_bytes);
            if u.is_nil() {
                None
            } else {
                Some(u)
            }
        };

        Ok(RpcEnvelope {
            version,
            sender_id: Uuid::from_bytes(sender_bytes),
            group_id: Uuid::from_bytes(group_bytes),
            dest_id,
            msg_id: if msg_id_present { Some(msg_id_raw) } else { None },
            payload_kind: PayloadKind::from_u8(kind_tag)?,
            sys_error,
            app_error,
            data: buf[ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + data_size].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let mut env = RpcEnvelope::new(Uuid::new_v4(), Uuid::new_v4(), PayloadKind::AppendReq, b"hi".to_vec());
        env.dest_id = Some(Uuid::new_v4());
        env.msg_id = Some(0xdead_beef_0001);
        env.sys_error = -1;
        let encoded = env.encode().unwrap();
        let decoded = RpcEnvelope::decode(&encoded).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn envelope_without_dest_or_msg_id() {
        let env = RpcEnvelope::new(Uuid::new_v4(), Uuid::new_v4(), PayloadKind::Ping, vec![]);
        let encoded = env.encode().unwrap();
        let decoded = RpcEnvelope::decode(&encoded).unwrap();
        assert_eq!(decoded.dest_id, None);
        assert_eq!(decoded.msg_id, None);
    }

    #[test]
    fn unknown_payload_kind_is_rejected() {
        let env = RpcEnvelope::new(Uuid::nil(), Uuid::nil(), PayloadKind::Ping, vec![]);
        let mut encoded = env.encode().unwrap();
        encoded[0] = 200;
        match RpcEnvelope::decode(&encoded) {
            Err(ProtoError::UnknownPayloadKind(200)) => {}
            other => panic!("expected UnknownPayloadKind, got {:?}", other),
        }
    }
}
