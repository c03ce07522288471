// Instrumentation layer contract
//
// Everything the engine needs from the debugged runtime: thread suspension,
// stack inspection, class metadata, heap liveness, low-level event enabling and
// synchronous method invocation. The engine never talks to the runtime any
// other way.

use crate::protocol::ErrorCode;
use crate::types::*;

pub type RuntimeResult<T> = Result<T, ErrorCode>;

/// The instrumentation interface of the debugged runtime.
///
/// Implementations must be callable from any thread. Calls may be made while
/// the engine holds its internal locks, so an implementation must never call
/// back into the engine synchronously.
pub trait Runtime: Send + Sync {
    /// Every live application thread known to the runtime.
    fn all_threads(&self) -> Vec<ThreadRef>;

    /// Physically suspend a thread.
    ///
    /// Returns `InvalidThread` for a thread that has not started yet and
    /// `ThreadSuspended` for a thread that is already suspended by someone else.
    fn suspend_thread(&self, thread: ThreadRef) -> RuntimeResult<()>;

    fn resume_thread(&self, thread: ThreadRef) -> RuntimeResult<()>;

    fn interrupt_thread(&self, thread: ThreadRef) -> RuntimeResult<()>;

    fn stop_thread(&self, thread: ThreadRef, throwable: ObjectRef) -> RuntimeResult<()>;

    fn thread_status(&self, thread: ThreadRef) -> RuntimeResult<ThreadStatus>;

    /// Make the calling OS thread known to the runtime as an agent thread.
    fn attach_current_thread(&self, name: &str) -> Option<ThreadRef>;

    /// Called on an event thread at the points where the runtime would park a
    /// suspended thread (after its reported events completed and between
    /// invocations). Returns once the thread is no longer suspended.
    fn park_while_suspended(&self, thread: ThreadRef);

    fn frame_count(&self, thread: ThreadRef) -> RuntimeResult<i32>;

    /// Location of the frame `depth` frames below the top (0 = current frame).
    /// Fails with `NoMoreFrames` when the thread has no such frame.
    fn frame_location(&self, thread: ThreadRef, depth: i32) -> RuntimeResult<Location>;

    /// Request a FRAME_POP event when frame `depth` returns. `OpaqueFrame` for
    /// native frames, `Duplicate` if a notification is already pending.
    fn notify_frame_pop(&self, thread: ThreadRef, depth: i32) -> RuntimeResult<()>;

    /// The receiver of frame `depth`, or `None` for static and native frames.
    fn frame_this(&self, thread: ThreadRef, depth: i32) -> Option<ObjectRef>;

    /// Line table of a method, `AbsentInformation` if it has none.
    fn line_table(&self, class: ClassRef, method: MethodId) -> RuntimeResult<Vec<LineEntry>>;

    fn is_method_native(&self, class: ClassRef, method: MethodId) -> bool;

    /// First bytecode index of a method.
    fn method_start(&self, class: ClassRef, method: MethodId) -> RuntimeResult<u64>;

    fn class_signature(&self, class: ClassRef) -> RuntimeResult<String>;

    fn class_type_tag(&self, class: ClassRef) -> RefTypeTag;

    fn object_class(&self, object: ObjectRef) -> RuntimeResult<ClassRef>;

    /// Most specific value tag for an object (string, thread, class, ...).
    fn object_tag(&self, object: ObjectRef) -> TypeTag;

    fn is_assignable(&self, sub: ClassRef, sup: ClassRef) -> bool;

    fn is_instance_of(&self, object: ObjectRef, class: ClassRef) -> bool;

    /// Signatures of all currently loaded (prepared) classes.
    fn loaded_class_signatures(&self) -> Vec<String>;

    /// True once the object has been garbage collected.
    fn is_collected(&self, object: ObjectRef) -> bool;

    /// Keep the object alive until `remove_gc_root`. Fails with
    /// `InvalidObject` if it is already gone.
    fn add_gc_root(&self, object: ObjectRef) -> RuntimeResult<()>;

    fn remove_gc_root(&self, object: ObjectRef);

    /// Enable or disable delivery of an event kind, optionally for one thread.
    fn set_event_mode(
        &self,
        enable: bool,
        kind: EventKind,
        thread: Option<ThreadRef>,
    ) -> RuntimeResult<()>;

    /// Whether thread-scoped event modes can be set before the thread starts.
    fn supports_immediate_event_mode(&self) -> bool {
        true
    }

    fn set_breakpoint(&self, location: Location) -> RuntimeResult<()>;

    fn clear_breakpoint(&self, location: Location) -> RuntimeResult<()>;

    fn set_field_watch(&self, kind: EventKind, class: ClassRef, field: FieldId) -> RuntimeResult<()>;

    fn clear_field_watch(&self, kind: EventKind, class: ClassRef, field: FieldId)
        -> RuntimeResult<()>;

    /// Run a method synchronously on the calling (event) thread.
    fn invoke_method(&self, thread: ThreadRef, call: &InvokeCall) -> RuntimeResult<InvokeOutcome>;

    /// Location of the application-level thread resume method, if the runtime
    /// lets applications resume threads themselves.
    fn thread_resume_location(&self) -> Option<Location> {
        None
    }

    /// The thread the given thread is currently resuming (argument of the
    /// resume method at the top frame).
    fn resumee(&self, _resumer: ThreadRef) -> Option<ThreadRef> {
        None
    }
}

/// A method call requested by the debugger.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeCall {
    pub kind: InvokeKind,
    pub class: ClassRef,
    pub method: MethodId,
    pub instance: Option<ObjectRef>,
    pub args: Vec<Value>,
    pub nonvirtual: bool,
}

/// Result of a completed invocation: the return value, or the thrown exception.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutcome {
    pub value: Value,
    pub exception: Option<ObjectRef>,
}

/// An event delivered by the runtime to the engine's event hook.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    SingleStep {
        thread: ThreadRef,
        location: Location,
    },
    Breakpoint {
        thread: ThreadRef,
        location: Location,
    },
    /// Reported while the frame is still on the stack.
    FramePop {
        thread: ThreadRef,
        location: Location,
    },
    Exception {
        thread: ThreadRef,
        location: Location,
        exception: ObjectRef,
        catch_location: Option<Location>,
    },
    ExceptionCatch {
        thread: ThreadRef,
        location: Location,
        exception: ObjectRef,
    },
    UserDefined {
        thread: ThreadRef,
        object: Option<ObjectRef>,
    },
    ThreadStart {
        thread: ThreadRef,
    },
    ThreadEnd {
        thread: ThreadRef,
    },
    ClassPrepare {
        thread: ThreadRef,
        class: ClassRef,
    },
    ClassLoad {
        thread: ThreadRef,
        class: ClassRef,
    },
    /// Carries no class: unloads are discovered by diffing loaded classes.
    ClassUnload,
    FieldAccess {
        thread: ThreadRef,
        location: Location,
        field_class: ClassRef,
        field: FieldId,
        object: Option<ObjectRef>,
    },
    FieldModification {
        thread: ThreadRef,
        location: Location,
        field_class: ClassRef,
        field: FieldId,
        object: Option<ObjectRef>,
        new_value: Value,
    },
    MethodEntry {
        thread: ThreadRef,
        location: Location,
    },
    MethodExit {
        thread: ThreadRef,
        location: Location,
    },
    VmInit {
        thread: ThreadRef,
    },
    VmDeath,
}

impl RuntimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RuntimeEvent::SingleStep { .. } => EventKind::SingleStep,
            RuntimeEvent::Breakpoint { .. } => EventKind::Breakpoint,
            RuntimeEvent::FramePop { .. } => EventKind::FramePop,
            RuntimeEvent::Exception { .. } => EventKind::Exception,
            RuntimeEvent::ExceptionCatch { .. } => EventKind::ExceptionCatch,
            RuntimeEvent::UserDefined { .. } => EventKind::UserDefined,
            RuntimeEvent::ThreadStart { .. } => EventKind::ThreadStart,
            RuntimeEvent::ThreadEnd { .. } => EventKind::ThreadEnd,
            RuntimeEvent::ClassPrepare { .. } => EventKind::ClassPrepare,
            RuntimeEvent::ClassLoad { .. } => EventKind::ClassLoad,
            RuntimeEvent::ClassUnload => EventKind::ClassUnload,
            RuntimeEvent::FieldAccess { .. } => EventKind::FieldAccess,
            RuntimeEvent::FieldModification { .. } => EventKind::FieldModification,
            RuntimeEvent::MethodEntry { .. } => EventKind::MethodEntry,
            RuntimeEvent::MethodExit { .. } => EventKind::MethodExit,
            RuntimeEvent::VmInit { .. } => EventKind::VmInit,
            RuntimeEvent::VmDeath => EventKind::VmDeath,
        }
    }

    pub fn thread(&self) -> Option<ThreadRef> {
        match self {
            RuntimeEvent::SingleStep { thread, .. }
            | RuntimeEvent::Breakpoint { thread, .. }
            | RuntimeEvent::FramePop { thread, .. }
            | RuntimeEvent::Exception { thread, .. }
            | RuntimeEvent::ExceptionCatch { thread, .. }
            | RuntimeEvent::UserDefined { thread, .. }
            | RuntimeEvent::ThreadStart { thread }
            | RuntimeEvent::ThreadEnd { thread }
            | RuntimeEvent::ClassPrepare { thread, .. }
            | RuntimeEvent::ClassLoad { thread, .. }
            | RuntimeEvent::FieldAccess { thread, .. }
            | RuntimeEvent::FieldModification { thread, .. }
            | RuntimeEvent::MethodEntry { thread, .. }
            | RuntimeEvent::MethodExit { thread, .. }
            | RuntimeEvent::VmInit { thread } => Some(*thread),
            RuntimeEvent::ClassUnload | RuntimeEvent::VmDeath => None,
        }
    }

    pub fn location(&self) -> Option<Location> {
        match self {
            RuntimeEvent::SingleStep { location, .. }
            | RuntimeEvent::Breakpoint { location, .. }
            | RuntimeEvent::FramePop { location, .. }
            | RuntimeEvent::Exception { location, .. }
            | RuntimeEvent::ExceptionCatch { location, .. }
            | RuntimeEvent::FieldAccess { location, .. }
            | RuntimeEvent::FieldModification { location, .. }
            | RuntimeEvent::MethodEntry { location, .. }
            | RuntimeEvent::MethodExit { location, .. } => Some(*location),
            _ => None,
        }
    }

    /// The class an event is attributed to for class filters.
    pub fn class(&self) -> Option<ClassRef> {
        match self {
            RuntimeEvent::ClassPrepare { class, .. } | RuntimeEvent::ClassLoad { class, .. } => {
                Some(*class)
            }
            _ => self.location().map(|l| l.class),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> Location {
        Location {
            class: ObjectRef::new(9, 0),
            method: 3,
            index: 12,
        }
    }

    #[test]
    fn test_event_accessors() {
        let thread = ObjectRef::new(1, 0);
        let ev = RuntimeEvent::Breakpoint {
            thread,
            location: loc(),
        };
        assert_eq!(ev.kind(), EventKind::Breakpoint);
        assert_eq!(ev.thread(), Some(thread));
        assert_eq!(ev.class(), Some(ObjectRef::new(9, 0)));

        let prepare = RuntimeEvent::ClassPrepare {
            thread,
            class: ObjectRef::new(5, 2),
        };
        assert_eq!(prepare.class(), Some(ObjectRef::new(5, 2)));
        assert_eq!(prepare.location(), None);
        assert_eq!(RuntimeEvent::VmDeath.thread(), None);
    }
}
