// Command argument decoding
//
// Reads JDWP primitives from a command packet. The first failure sticks: every
// later read reports the same error, so a handler can decode all of its
// arguments and check once.

use crate::packet::Packet;
use crate::protocol::ErrorCode;
use crate::reftable::RefTable;
use crate::types::*;
use bytes::{Buf, Bytes};

pub type ReadResult<T> = Result<T, ErrorCode>;

pub struct PacketInputStream<'a> {
    refs: &'a RefTable,
    id: u32,
    command_set: u8,
    command: u8,
    data: Bytes,
    error: Option<ErrorCode>,
}

impl<'a> PacketInputStream<'a> {
    pub fn new(refs: &'a RefTable, packet: &Packet) -> Self {
        let (command_set, command) = match packet.kind {
            crate::packet::PacketKind::Command {
                command_set,
                command,
            } => (command_set, command),
            crate::packet::PacketKind::Reply { .. } => (0, 0),
        };
        Self {
            refs,
            id: packet.id,
            command_set,
            command,
            data: packet.data(),
            error: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn command_set(&self) -> u8 {
        self.command_set
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    pub fn error(&self) -> Option<ErrorCode> {
        self.error
    }

    pub fn remaining(&self) -> usize {
        self.data.remaining()
    }

    fn fail<T>(&mut self, code: ErrorCode) -> ReadResult<T> {
        if self.error.is_none() {
            self.error = Some(code);
        }
        Err(self.error.unwrap_or(code))
    }

    fn require(&mut self, len: usize) -> ReadResult<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.data.remaining() < len {
            return self.fail(ErrorCode::Internal);
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> ReadResult<u8> {
        self.require(1)?;
        Ok(self.data.get_u8())
    }

    pub fn read_bool(&mut self) -> ReadResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_char(&mut self) -> ReadResult<u16> {
        self.require(2)?;
        Ok(self.data.get_u16())
    }

    pub fn read_i16(&mut self) -> ReadResult<i16> {
        self.require(2)?;
        Ok(self.data.get_i16())
    }

    pub fn read_i32(&mut self) -> ReadResult<i32> {
        self.require(4)?;
        Ok(self.data.get_i32())
    }

    pub fn read_i64(&mut self) -> ReadResult<i64> {
        self.require(8)?;
        Ok(self.data.get_i64())
    }

    pub fn read_u64(&mut self) -> ReadResult<u64> {
        self.require(8)?;
        Ok(self.data.get_u64())
    }

    pub fn read_f32(&mut self) -> ReadResult<f32> {
        self.require(4)?;
        Ok(self.data.get_f32())
    }

    pub fn read_f64(&mut self) -> ReadResult<f64> {
        self.require(8)?;
        Ok(self.data.get_f64())
    }

    /// Read a JDWP string (4-byte length prefix + UTF-8 bytes)
    pub fn read_string(&mut self) -> ReadResult<String> {
        let len = self.read_i32()?;
        if len < 0 {
            return self.fail(ErrorCode::InvalidLength);
        }
        let len = len as usize;
        self.require(len)?;
        let bytes = self.data.split_to(len);
        match String::from_utf8(bytes.to_vec()) {
            Ok(s) => Ok(s),
            Err(_) => self.fail(ErrorCode::InvalidString),
        }
    }

    pub fn read_object_id(&mut self) -> ReadResult<ObjectId> {
        self.read_u64()
    }

    /// Resolve an object id; 0 is null.
    pub fn read_object_ref(&mut self) -> ReadResult<Option<ObjectRef>> {
        let id = self.read_object_id()?;
        if id == 0 {
            return Ok(None);
        }
        match self.refs.id_to_ref(id) {
            Some(obj) => Ok(Some(obj)),
            None => self.fail(ErrorCode::InvalidObject),
        }
    }

    pub fn read_thread_ref(&mut self) -> ReadResult<ThreadRef> {
        match self.read_object_ref() {
            Ok(Some(thread)) => Ok(thread),
            Ok(None) => self.fail(ErrorCode::InvalidThread),
            Err(ErrorCode::InvalidObject) => {
                self.error = Some(ErrorCode::InvalidThread);
                Err(ErrorCode::InvalidThread)
            }
            Err(e) => Err(e),
        }
    }

    pub fn read_class_ref(&mut self) -> ReadResult<ClassRef> {
        match self.read_object_ref() {
            Ok(Some(class)) => Ok(class),
            Ok(None) | Err(ErrorCode::InvalidObject) => {
                self.error = Some(ErrorCode::InvalidClass);
                Err(ErrorCode::InvalidClass)
            }
            Err(e) => Err(e),
        }
    }

    pub fn read_method_id(&mut self) -> ReadResult<MethodId> {
        self.read_u64()
    }

    pub fn read_field_id(&mut self) -> ReadResult<FieldId> {
        self.read_u64()
    }

    pub fn read_location(&mut self) -> ReadResult<Location> {
        let _tag = self.read_u8()?;
        let class = self.read_class_ref()?;
        let method = self.read_method_id()?;
        let index = self.read_u64()?;
        Ok(Location {
            class,
            method,
            index,
        })
    }

    /// Read a tagged value.
    pub fn read_value(&mut self) -> ReadResult<Value> {
        let raw = self.read_u8()?;
        let Some(tag) = TypeTag::from_u8(raw) else {
            return self.fail(ErrorCode::InvalidTag);
        };
        let data = match tag {
            TypeTag::Byte => ValueData::Byte(self.read_u8()? as i8),
            TypeTag::Char => ValueData::Char(self.read_char()?),
            TypeTag::Float => ValueData::Float(self.read_f32()?),
            TypeTag::Double => ValueData::Double(self.read_f64()?),
            TypeTag::Int => ValueData::Int(self.read_i32()?),
            TypeTag::Long => ValueData::Long(self.read_i64()?),
            TypeTag::Short => ValueData::Short(self.read_i16()?),
            TypeTag::Boolean => ValueData::Boolean(self.read_bool()?),
            TypeTag::Void => ValueData::Void,
            _ => ValueData::Object(self.read_object_ref()?),
        };
        Ok(Value { tag, data })
    }
}
