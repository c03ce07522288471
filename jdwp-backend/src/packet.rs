// JDWP packets
//
// A packet is a command or reply header plus a chain of data segments. The
// segments are concatenated when the packet is framed for the wire.

use crate::protocol::{JdwpError, JdwpResult, HEADER_SIZE, REPLY_FLAG};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Command { command_set: u8, command: u8 },
    Reply { error_code: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub flags: u8,
    pub kind: PacketKind,
    pub segments: Vec<Bytes>,
}

impl Packet {
    pub fn command(id: u32, command_set: u8, command: u8) -> Self {
        Self {
            id,
            flags: 0x00,
            kind: PacketKind::Command {
                command_set,
                command,
            },
            segments: Vec::new(),
        }
    }

    pub fn reply(id: u32, error_code: u16) -> Self {
        Self {
            id,
            flags: REPLY_FLAG,
            kind: PacketKind::Reply { error_code },
            segments: Vec::new(),
        }
    }

    pub fn is_reply(&self) -> bool {
        self.flags & REPLY_FLAG != 0
    }

    pub fn error_code(&self) -> Option<u16> {
        match self.kind {
            PacketKind::Reply { error_code } => Some(error_code),
            PacketKind::Command { .. } => None,
        }
    }

    pub fn data_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    /// All segments as one contiguous buffer.
    pub fn data(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [only] => only.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.data_len());
                for seg in many {
                    buf.put_slice(seg);
                }
                buf.freeze()
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let length = HEADER_SIZE + self.data_len();
        let mut buf = BytesMut::with_capacity(length);

        buf.put_u32(length as u32);
        buf.put_u32(self.id);
        buf.put_u8(self.flags);
        match self.kind {
            PacketKind::Command {
                command_set,
                command,
            } => {
                buf.put_u8(command_set);
                buf.put_u8(command);
            }
            PacketKind::Reply { error_code } => buf.put_u16(error_code),
        }
        for seg in &self.segments {
            buf.put_slice(seg);
        }

        buf.to_vec()
    }

    /// Decode a complete framed packet (header included).
    pub fn decode(mut buf: &[u8]) -> JdwpResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(JdwpError::Protocol("Packet too short".to_string()));
        }

        let length = buf.get_u32() as usize;
        if length != buf.len() + 4 {
            return Err(JdwpError::Protocol(format!(
                "Packet length mismatch: header says {}, got {}",
                length,
                buf.len() + 4
            )));
        }
        let id = buf.get_u32();
        let flags = buf.get_u8();
        let kind = if flags & REPLY_FLAG != 0 {
            PacketKind::Reply {
                error_code: buf.get_u16(),
            }
        } else {
            let command_set = buf.get_u8();
            let command = buf.get_u8();
            PacketKind::Command {
                command_set,
                command,
            }
        };
        let segments = if buf.is_empty() {
            Vec::new()
        } else {
            vec![Bytes::copy_from_slice(buf)]
        };

        Ok(Self {
            id,
            flags,
            kind,
            segments,
        })
    }
}
