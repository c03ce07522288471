// Reply and event encoding
//
// Data is appended to a chain of segments; each new segment is twice the size of
// the previous one, capped at MAX_SEGMENT_SIZE. The first error recorded wins and
// turns the packet into an empty error reply.

use crate::packet::{Packet, PacketKind};
use crate::protocol::ErrorCode;
use crate::reftable::RefTable;
use crate::types::*;
use bytes::{BufMut, Bytes, BytesMut};

const INITIAL_SEGMENT_SIZE: usize = 300;
const MAX_SEGMENT_SIZE: usize = 10_000;

pub struct PacketOutputStream<'a> {
    refs: &'a RefTable,
    id: u32,
    flags: u8,
    kind: PacketKind,
    current: BytesMut,
    segments: Vec<Bytes>,
    error: Option<ErrorCode>,
    exported: Vec<ObjectId>,
}

impl<'a> PacketOutputStream<'a> {
    /// A stream for the reply to command `id`.
    pub fn reply(refs: &'a RefTable, id: u32) -> Self {
        let packet = Packet::reply(id, 0);
        Self::from_header(refs, packet)
    }

    /// A stream for a command sent by the back end (events).
    pub fn command(refs: &'a RefTable, id: u32, command_set: u8, command: u8) -> Self {
        Self::from_header(refs, Packet::command(id, command_set, command))
    }

    fn from_header(refs: &'a RefTable, packet: Packet) -> Self {
        Self {
            refs,
            id: packet.id,
            flags: packet.flags,
            kind: packet.kind,
            current: BytesMut::with_capacity(INITIAL_SEGMENT_SIZE),
            segments: Vec::new(),
            error: None,
            exported: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.error
    }

    /// Record a failure. Objects exported into this packet so far are released
    /// again since the debugger will never see their ids.
    pub fn set_error(&mut self, code: ErrorCode) {
        if self.error.is_some() {
            return;
        }
        self.error = Some(code);
        for id in self.exported.drain(..) {
            self.refs.release(id, 1);
        }
    }

    fn write_bytes(&mut self, mut bytes: &[u8]) {
        if self.error.is_some() {
            return;
        }
        while !bytes.is_empty() {
            let space = self.current.capacity() - self.current.len();
            if space == 0 {
                self.new_segment();
                continue;
            }
            let n = space.min(bytes.len());
            self.current.put_slice(&bytes[..n]);
            bytes = &bytes[n..];
        }
    }

    fn new_segment(&mut self) {
        let size = (self.current.capacity() * 2).min(MAX_SEGMENT_SIZE);
        let full = std::mem::replace(&mut self.current, BytesMut::with_capacity(size));
        self.segments.push(full.freeze());
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    pub fn write_char(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i16(&mut self, v: i16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_f32(&mut self, v: f32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_bytes(&v.to_be_bytes());
    }

    /// Write a JDWP string (4-byte length prefix + UTF-8 bytes)
    pub fn write_string(&mut self, s: &str) {
        self.write_i32(s.len() as i32);
        self.write_bytes(s.as_bytes());
    }

    /// Export an object (or null) and write its id.
    pub fn write_object_ref(&mut self, obj: Option<ObjectRef>) {
        if self.error.is_some() {
            return;
        }
        let id = match obj {
            Some(obj) => {
                let id = self.refs.ref_to_id(obj);
                self.exported.push(id);
                id
            }
            None => 0,
        };
        self.write_u64(id);
    }

    pub fn write_tagged_object(&mut self, tag: TypeTag, obj: Option<ObjectRef>) {
        self.write_u8(tag as u8);
        self.write_object_ref(obj);
    }

    pub fn write_location(&mut self, tag: RefTypeTag, location: &Location) {
        self.write_u8(tag as u8);
        self.write_object_ref(Some(location.class));
        self.write_u64(location.method);
        self.write_u64(location.index);
    }

    /// Write a tagged value.
    pub fn write_value(&mut self, value: &Value) {
        self.write_u8(value.tag as u8);
        match &value.data {
            ValueData::Byte(v) => self.write_u8(*v as u8),
            ValueData::Char(v) => self.write_char(*v),
            ValueData::Float(v) => self.write_f32(*v),
            ValueData::Double(v) => self.write_f64(*v),
            ValueData::Int(v) => self.write_i32(*v),
            ValueData::Long(v) => self.write_i64(*v),
            ValueData::Short(v) => self.write_i16(*v),
            ValueData::Boolean(v) => self.write_bool(*v),
            ValueData::Object(obj) => self.write_object_ref(*obj),
            ValueData::Void => {}
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len() + usize::from(!self.current.is_empty())
    }

    /// Finish the stream. An errored reply carries only its error code.
    pub fn into_packet(mut self) -> Packet {
        let segments = match (self.error, self.kind) {
            (Some(code), PacketKind::Reply { .. }) => {
                self.kind = PacketKind::Reply {
                    error_code: code.code(),
                };
                Vec::new()
            }
            _ => {
                if !self.current.is_empty() {
                    let last = std::mem::take(&mut self.current);
                    self.segments.push(last.freeze());
                }
                std::mem::take(&mut self.segments)
            }
        };
        Packet {
            id: self.id,
            flags: self.flags,
            kind: self.kind,
            segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedVm;
    use std::sync::Arc;

    #[test]
    fn test_segments_chain_and_grow() {
        let vm = Arc::new(SimulatedVm::new());
        let refs = RefTable::new(vm);
        let mut out = PacketOutputStream::reply(&refs, 1);

        let blob = vec![0xAB; 1000];
        out.write_bytes(&blob);
        // 300 + 600 + 100 of a 1200 byte segment
        assert_eq!(out.segment_count(), 3);

        let packet = out.into_packet();
        assert_eq!(packet.data_len(), 1000);
        assert_eq!(packet.segments[0].len(), 300);
        assert_eq!(packet.segments[1].len(), 600);
        assert!(packet.data().iter().all(|b| *b == 0xAB));
    }

    #[test]
    fn test_segment_size_is_capped() {
        let vm = Arc::new(SimulatedVm::new());
        let refs = RefTable::new(vm);
        let mut out = PacketOutputStream::reply(&refs, 1);
        out.write_bytes(&vec![1u8; 40_000]);

        let packet = out.into_packet();
        assert!(packet.segments.iter().all(|s| s.len() <= MAX_SEGMENT_SIZE));
        assert_eq!(packet.data_len(), 40_000);
    }

    #[test]
    fn test_error_reply_drops_payload_and_releases_ids() {
        let vm = Arc::new(SimulatedVm::new());
        let refs = RefTable::new(vm.clone());
        let obj = vm.new_object("Ljava/lang/Object;");

        let mut out = PacketOutputStream::reply(&refs, 9);
        out.write_object_ref(Some(obj));
        let id = refs.ref_to_id(obj);
        assert_eq!(refs.count(id), Some(2));

        out.set_error(ErrorCode::InvalidThread);
        out.write_i32(5);
        assert_eq!(refs.count(id), Some(1));

        let packet = out.into_packet();
        assert_eq!(packet.error_code(), Some(ErrorCode::InvalidThread.code()));
        assert_eq!(packet.data_len(), 0);
    }

    #[test]
    fn test_write_value_and_string() {
        let vm = Arc::new(SimulatedVm::new());
        let refs = RefTable::new(vm);
        let mut out = PacketOutputStream::reply(&refs, 2);
        out.write_value(&Value::int(0x01020304));
        out.write_string("ok");
        let data = out.into_packet().data();
        assert_eq!(&data[..], &[b'I', 1, 2, 3, 4, 0, 0, 0, 2, b'o', b'k']);
    }
}
