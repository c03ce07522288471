// JDWP type definitions
//
// Runtime-side handles, locations, values and the small enums shared by every
// component of the back end.

use serde::{Deserialize, Serialize};
use std::fmt;

// Object IDs are 8 bytes in JDWP
pub type ObjectId = u64;

pub type MethodId = u64;
pub type FieldId = u64;

/// Identity of a runtime object as handed out by the instrumentation layer.
///
/// The slot may be reused once its object has been collected; the generation
/// distinguishes the old occupant from the new one, so two `ObjectRef`s compare
/// equal only when they denote the very same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    slot: u32,
    generation: u32,
}

impl ObjectRef {
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    pub fn slot(self) -> u32 {
        self.slot
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}.{}", self.slot, self.generation)
    }
}

pub type ThreadRef = ObjectRef;
pub type ClassRef = ObjectRef;

// Location identifies a code position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub class: ClassRef,
    pub method: MethodId,
    pub index: u64, // bytecode index (PC)
}

/// One row of a method's line number table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    pub start: u64,
    pub line: i32,
}

/// Counter identifying one debugger connection; bumped by every reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    pub fn next(self) -> Self {
        SessionId(self.0.wrapping_add(1))
    }
}

// Thread status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ThreadStatus {
    Zombie = 0,
    Running = 1,
    Sleeping = 2,
    Monitor = 3,
    Wait = 4,
}

// Suspend status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum SuspendStatus {
    Running = 0,
    Suspended = 1,
}

// Reference type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RefTypeTag {
    Class = 1,
    Interface = 2,
    Array = 3,
}

// Type tags for values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TypeTag {
    Array = 91,      // '['
    Byte = 66,       // 'B'
    Char = 67,       // 'C'
    Object = 76,     // 'L'
    Float = 70,      // 'F'
    Double = 68,     // 'D'
    Int = 73,        // 'I'
    Long = 74,       // 'J'
    Short = 83,      // 'S'
    Void = 86,       // 'V'
    Boolean = 90,    // 'Z'
    String = 115,    // 's'
    Thread = 116,    // 't'
    ThreadGroup = 103, // 'g'
    ClassLoader = 108, // 'l'
    ClassObject = 99,  // 'c'
}

impl TypeTag {
    pub fn from_u8(tag: u8) -> Option<Self> {
        use TypeTag::*;
        Some(match tag {
            91 => Array,
            66 => Byte,
            67 => Char,
            76 => Object,
            70 => Float,
            68 => Double,
            73 => Int,
            74 => Long,
            83 => Short,
            86 => Void,
            90 => Boolean,
            115 => String,
            116 => Thread,
            103 => ThreadGroup,
            108 => ClassLoader,
            99 => ClassObject,
            _ => return None,
        })
    }

    pub fn is_object(self) -> bool {
        matches!(
            self,
            TypeTag::Array
                | TypeTag::Object
                | TypeTag::String
                | TypeTag::Thread
                | TypeTag::ThreadGroup
                | TypeTag::ClassLoader
                | TypeTag::ClassObject
        )
    }
}

// Tagged value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub tag: TypeTag,
    pub data: ValueData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueData {
    Byte(i8),
    Char(u16),
    Float(f32),
    Double(f64),
    Int(i32),
    Long(i64),
    Short(i16),
    Boolean(bool),
    Object(Option<ObjectRef>),
    Void,
}

impl Value {
    pub fn void() -> Self {
        Value {
            tag: TypeTag::Void,
            data: ValueData::Void,
        }
    }

    pub fn int(v: i32) -> Self {
        Value {
            tag: TypeTag::Int,
            data: ValueData::Int(v),
        }
    }

    pub fn object(tag: TypeTag, obj: Option<ObjectRef>) -> Self {
        Value {
            tag,
            data: ValueData::Object(obj),
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self.data {
            ValueData::Object(obj) => obj,
            _ => None,
        }
    }

    /// Format value for display
    pub fn format(&self) -> String {
        match &self.data {
            ValueData::Byte(v) => format!("(byte) {}", v),
            ValueData::Char(v) => format!("(char) '{}'", char::from_u32(*v as u32).unwrap_or('?')),
            ValueData::Float(v) => format!("(float) {}", v),
            ValueData::Double(v) => format!("(double) {}", v),
            ValueData::Int(v) => format!("(int) {}", v),
            ValueData::Long(v) => format!("(long) {}", v),
            ValueData::Short(v) => format!("(short) {}", v),
            ValueData::Boolean(v) => format!("(boolean) {}", v),
            ValueData::Object(None) => "(object) null".to_string(),
            ValueData::Object(Some(obj)) => format!("(object) {}", obj),
            ValueData::Void => "(void)".to_string(),
        }
    }
}

/// Suspend policy for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

impl SuspendPolicy {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SuspendPolicy::None),
            1 => Some(SuspendPolicy::EventThread),
            2 => Some(SuspendPolicy::All),
            _ => None,
        }
    }
}

// Step sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum StepSize {
    Min = 0,
    Line = 1,
}

// Step depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum StepDepth {
    Into = 0,
    Over = 1,
    Out = 2,
}

impl StepSize {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(StepSize::Min),
            1 => Some(StepSize::Line),
            _ => None,
        }
    }
}

impl StepDepth {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(StepDepth::Into),
            1 => Some(StepDepth::Over),
            2 => Some(StepDepth::Out),
            _ => None,
        }
    }
}

/// Event kinds, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    SingleStep = 1,
    Breakpoint = 2,
    FramePop = 3,
    Exception = 4,
    UserDefined = 5,
    ThreadStart = 6,
    ThreadEnd = 7,
    ClassPrepare = 8,
    ClassUnload = 9,
    ClassLoad = 10,
    FieldAccess = 20,
    FieldModification = 21,
    ExceptionCatch = 30,
    MethodEntry = 40,
    MethodExit = 41,
    VmInit = 90,
    VmDeath = 99,
}

impl EventKind {
    pub const ALL: [EventKind; 17] = [
        EventKind::SingleStep,
        EventKind::Breakpoint,
        EventKind::FramePop,
        EventKind::Exception,
        EventKind::UserDefined,
        EventKind::ThreadStart,
        EventKind::ThreadEnd,
        EventKind::ClassPrepare,
        EventKind::ClassUnload,
        EventKind::ClassLoad,
        EventKind::FieldAccess,
        EventKind::FieldModification,
        EventKind::ExceptionCatch,
        EventKind::MethodEntry,
        EventKind::MethodExit,
        EventKind::VmInit,
        EventKind::VmDeath,
    ];

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u8 == v)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a remote invocation calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeKind {
    Constructor,
    Static,
    Instance,
}
