// Simulated runtime
//
// An in-memory debuggee: objects with generations, classes with methods and
// line tables, threads with call stacks, and a recording of every
// instrumentation call the engine makes. The agent binary runs against it and
// the tests drive it directly.

use crate::engine::PacketSink;
use crate::packet::Packet;
use crate::protocol::{ErrorCode, JdwpResult};
use crate::runtime::{InvokeCall, InvokeOutcome, Runtime, RuntimeResult};
use crate::types::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::trace;

const CLASS_SIG: &str = "Ljava/lang/Class;";
const THREAD_SIG: &str = "Ljava/lang/Thread;";
const STRING_SIG: &str = "Ljava/lang/String;";

#[derive(Debug, Clone)]
enum ObjectKind {
    Instance { class: ClassRef },
    Class { signature: String, superclass: Option<ClassRef>, loaded: bool },
    Thread,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    live: bool,
    kind: ObjectKind,
}

#[derive(Debug, Clone)]
struct MethodInfo {
    name: String,
    native: bool,
    lines: Option<Vec<LineEntry>>,
    start: u64,
}

#[derive(Debug, Default)]
struct SimThread {
    name: String,
    started: bool,
    alive: bool,
    suspended: bool,
    parked: bool,
    suspend_calls: u32,
    resume_calls: u32,
    interrupt_calls: u32,
    stopped_with: Option<ObjectRef>,
    /// Bottom of the stack first.
    frames: Vec<Location>,
    /// Stack heights whose frame has a pop notification armed.
    frame_pops: HashSet<usize>,
}

#[derive(Debug, Default)]
struct BreakpointState {
    active: bool,
    sets: u32,
}

#[derive(Debug)]
struct SimState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: HashMap<ObjectRef, usize>,
    classes: HashMap<String, ClassRef>,
    methods: HashMap<(ClassRef, MethodId), MethodInfo>,
    fields: HashMap<(ClassRef, FieldId), String>,
    next_member_id: u64,
    threads: HashMap<ThreadRef, SimThread>,
    event_modes: HashSet<(EventKind, Option<ThreadRef>)>,
    immediate_event_mode: bool,
    breakpoints: HashMap<Location, BreakpointState>,
    field_watches: HashSet<(EventKind, ClassRef, FieldId)>,
    invoke_outcome: Option<InvokeOutcome>,
    invocations: Vec<(ThreadRef, InvokeCall)>,
    resume_method: Option<Location>,
    /// Resumer to the thread it is resuming.
    resumees: HashMap<ThreadRef, ThreadRef>,
}

impl SimState {
    fn alloc(&mut self, kind: ObjectKind) -> ObjectRef {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation += 1;
                slot.live = true;
                slot.kind = kind;
                ObjectRef::new(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    live: true,
                    kind,
                });
                ObjectRef::new(index, 0)
            }
        }
    }

    fn slot(&self, object: ObjectRef) -> Option<&Slot> {
        self.slots
            .get(object.slot() as usize)
            .filter(|s| s.live && s.generation == object.generation())
    }

    fn slot_mut(&mut self, object: ObjectRef) -> Option<&mut Slot> {
        self.slots
            .get_mut(object.slot() as usize)
            .filter(|s| s.live && s.generation == object.generation())
    }

    fn class_by_signature(&mut self, signature: &str) -> ClassRef {
        if let Some(class) = self.classes.get(signature) {
            return *class;
        }
        let class = self.alloc(ObjectKind::Class {
            signature: signature.to_string(),
            superclass: None,
            loaded: true,
        });
        self.classes.insert(signature.to_string(), class);
        class
    }

    fn signature_of(&self, class: ClassRef) -> Option<&str> {
        match &self.slot(class)?.kind {
            ObjectKind::Class { signature, .. } => Some(signature),
            _ => None,
        }
    }

    fn superclass_of(&self, class: ClassRef) -> Option<ClassRef> {
        match &self.slot(class)?.kind {
            ObjectKind::Class { superclass, .. } => *superclass,
            _ => None,
        }
    }

    fn next_member_id(&mut self) -> u64 {
        self.next_member_id += 1;
        self.next_member_id
    }

    fn thread(&self, thread: ThreadRef) -> RuntimeResult<&SimThread> {
        self.threads.get(&thread).ok_or(ErrorCode::InvalidThread)
    }

    fn thread_mut(&mut self, thread: ThreadRef) -> RuntimeResult<&mut SimThread> {
        self.threads.get_mut(&thread).ok_or(ErrorCode::InvalidThread)
    }

    fn live_thread_mut(&mut self, thread: ThreadRef) -> RuntimeResult<&mut SimThread> {
        match self.threads.get_mut(&thread) {
            Some(t) if t.started && t.alive => Ok(t),
            _ => Err(ErrorCode::InvalidThread),
        }
    }

    fn method(&self, class: ClassRef, method: MethodId) -> RuntimeResult<&MethodInfo> {
        self.methods.get(&(class, method)).ok_or(ErrorCode::InvalidMethodId)
    }
}

/// In-memory implementation of [`Runtime`].
pub struct SimulatedVm {
    state: Mutex<SimState>,
    parked: Condvar,
}

impl Default for SimulatedVm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedVm {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                slots: Vec::new(),
                free: Vec::new(),
                roots: HashMap::new(),
                classes: HashMap::new(),
                methods: HashMap::new(),
                fields: HashMap::new(),
                next_member_id: 0,
                threads: HashMap::new(),
                event_modes: HashSet::new(),
                immediate_event_mode: true,
                breakpoints: HashMap::new(),
                field_watches: HashSet::new(),
                invoke_outcome: None,
                invocations: Vec::new(),
                resume_method: None,
                resumees: HashMap::new(),
            }),
            parked: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock()
    }

    // ----- heap -----

    /// Load (or look up) a class by signature.
    pub fn define_class(&self, signature: &str) -> ClassRef {
        self.lock().class_by_signature(signature)
    }

    pub fn define_subclass(&self, signature: &str, superclass: ClassRef) -> ClassRef {
        let mut state = self.lock();
        let class = state.class_by_signature(signature);
        if let Some(Slot {
            kind: ObjectKind::Class { superclass: sup, .. },
            ..
        }) = state.slot_mut(class)
        {
            *sup = Some(superclass);
        }
        class
    }

    /// Unload a class. Its object stays reachable until collected.
    pub fn unload_class(&self, signature: &str) -> Option<ClassRef> {
        let mut state = self.lock();
        let class = state.classes.remove(signature)?;
        if let Some(Slot {
            kind: ObjectKind::Class { loaded, .. },
            ..
        }) = state.slot_mut(class)
        {
            *loaded = false;
        }
        state.methods.retain(|(c, _), _| *c != class);
        Some(class)
    }

    pub fn new_instance(&self, class: ClassRef) -> ObjectRef {
        self.lock().alloc(ObjectKind::Instance { class })
    }

    pub fn new_object(&self, class_signature: &str) -> ObjectRef {
        let mut state = self.lock();
        let class = state.class_by_signature(class_signature);
        state.alloc(ObjectKind::Instance { class })
    }

    /// Collect an object. Fails (returns false) while it is a GC root or
    /// already gone.
    pub fn collect(&self, object: ObjectRef) -> bool {
        let mut state = self.lock();
        if state.roots.get(&object).is_some_and(|n| *n > 0) {
            return false;
        }
        match state.slot_mut(object) {
            Some(slot) => {
                slot.live = false;
                state.free.push(object.slot());
                true
            }
            None => false,
        }
    }

    pub fn gc_root_count(&self, object: ObjectRef) -> usize {
        self.lock().roots.get(&object).copied().unwrap_or(0)
    }

    // ----- methods -----

    /// Define a method with a line table of `(start index, line)` rows and
    /// return its first location.
    pub fn define_method(&self, class_signature: &str, name: &str, lines: &[(u64, i32)]) -> Location {
        let entries = lines
            .iter()
            .map(|&(start, line)| LineEntry { start, line })
            .collect::<Vec<_>>();
        self.add_method(class_signature, name, false, Some(entries))
    }

    pub fn define_method_without_lines(&self, class_signature: &str, name: &str) -> Location {
        self.add_method(class_signature, name, false, None)
    }

    pub fn define_native_method(&self, class_signature: &str, name: &str) -> Location {
        self.add_method(class_signature, name, true, None)
    }

    fn add_method(&self, class_signature: &str, name: &str, native: bool, lines: Option<Vec<LineEntry>>) -> Location {
        let mut state = self.lock();
        let class = state.class_by_signature(class_signature);
        let method = state.next_member_id();
        let start = lines
            .as_ref()
            .and_then(|l| l.iter().map(|e| e.start).min())
            .unwrap_or(0);
        state.methods.insert(
            (class, method),
            MethodInfo {
                name: name.to_string(),
                native,
                lines,
                start,
            },
        );
        Location {
            class,
            method,
            index: start,
        }
    }

    pub fn method_name(&self, class: ClassRef, method: MethodId) -> Option<String> {
        self.lock().methods.get(&(class, method)).map(|m| m.name.clone())
    }

    pub fn define_field(&self, class_signature: &str, name: &str) -> (ClassRef, FieldId) {
        let mut state = self.lock();
        let class = state.class_by_signature(class_signature);
        let field = state.next_member_id();
        state.fields.insert((class, field), name.to_string());
        (class, field)
    }

    // ----- threads -----

    /// Create a thread object that has not started running yet.
    pub fn spawn_thread(&self, name: &str) -> ThreadRef {
        let mut state = self.lock();
        state.class_by_signature(THREAD_SIG);
        let thread = state.alloc(ObjectKind::Thread);
        state.threads.insert(
            thread,
            SimThread {
                name: name.to_string(),
                alive: true,
                ..SimThread::default()
            },
        );
        thread
    }

    pub fn spawn_started_thread(&self, name: &str) -> ThreadRef {
        let thread = self.spawn_thread(name);
        self.start_thread(thread);
        thread
    }

    pub fn start_thread(&self, thread: ThreadRef) {
        if let Ok(t) = self.lock().thread_mut(thread) {
            t.started = true;
        }
    }

    pub fn end_thread(&self, thread: ThreadRef) {
        if let Ok(t) = self.lock().thread_mut(thread) {
            t.alive = false;
            t.suspended = false;
        }
        self.parked.notify_all();
    }

    pub fn thread_name(&self, thread: ThreadRef) -> Option<String> {
        self.lock().threads.get(&thread).map(|t| t.name.clone())
    }

    /// The application itself suspended the thread.
    pub fn suspend_by_application(&self, thread: ThreadRef) {
        if let Ok(t) = self.lock().thread_mut(thread) {
            t.suspended = true;
        }
    }

    pub fn is_suspended(&self, thread: ThreadRef) -> bool {
        self.lock().threads.get(&thread).is_some_and(|t| t.suspended)
    }

    /// Whether the thread is blocked in `park_while_suspended`.
    pub fn is_parked(&self, thread: ThreadRef) -> bool {
        self.lock().threads.get(&thread).is_some_and(|t| t.parked)
    }

    /// Wait until the thread parks, or the timeout elapses.
    pub fn wait_parked(&self, thread: ThreadRef, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.threads.get(&thread).is_some_and(|t| t.parked) {
                return true;
            }
            if self.parked.wait_until(&mut state, deadline).timed_out() {
                return state.threads.get(&thread).is_some_and(|t| t.parked);
            }
        }
    }

    pub fn suspend_calls(&self, thread: ThreadRef) -> u32 {
        self.lock().threads.get(&thread).map_or(0, |t| t.suspend_calls)
    }

    pub fn resume_calls(&self, thread: ThreadRef) -> u32 {
        self.lock().threads.get(&thread).map_or(0, |t| t.resume_calls)
    }

    pub fn interrupt_calls(&self, thread: ThreadRef) -> u32 {
        self.lock().threads.get(&thread).map_or(0, |t| t.interrupt_calls)
    }

    pub fn stopped_with(&self, thread: ThreadRef) -> Option<ObjectRef> {
        self.lock().threads.get(&thread).and_then(|t| t.stopped_with)
    }

    pub fn push_frame(&self, thread: ThreadRef, location: Location) {
        if let Ok(t) = self.lock().thread_mut(thread) {
            t.frames.push(location);
        }
    }

    pub fn pop_frame(&self, thread: ThreadRef) -> Option<Location> {
        let mut state = self.lock();
        let t = state.thread_mut(thread).ok()?;
        let height = t.frames.len();
        t.frame_pops.remove(&height);
        t.frames.pop()
    }

    pub fn set_top_location(&self, thread: ThreadRef, location: Location) {
        if let Ok(t) = self.lock().thread_mut(thread) {
            match t.frames.last_mut() {
                Some(top) => *top = location,
                None => t.frames.push(location),
            }
        }
    }

    // ----- instrumentation state -----

    pub fn set_immediate_event_mode(&self, immediate: bool) {
        self.lock().immediate_event_mode = immediate;
    }

    pub fn event_mode_enabled(&self, kind: EventKind, thread: Option<ThreadRef>) -> bool {
        self.lock().event_modes.contains(&(kind, thread))
    }

    pub fn breakpoint_active(&self, location: Location) -> bool {
        self.lock().breakpoints.get(&location).is_some_and(|b| b.active)
    }

    /// How many times a trap was installed at `location`.
    pub fn breakpoint_sets(&self, location: Location) -> u32 {
        self.lock().breakpoints.get(&location).map_or(0, |b| b.sets)
    }

    pub fn field_watch_active(&self, kind: EventKind, class: ClassRef, field: FieldId) -> bool {
        self.lock().field_watches.contains(&(kind, class, field))
    }

    pub fn set_invoke_outcome(&self, outcome: InvokeOutcome) {
        self.lock().invoke_outcome = Some(outcome);
    }

    pub fn invocations(&self) -> Vec<(ThreadRef, InvokeCall)> {
        self.lock().invocations.clone()
    }

    /// Define `Thread.resume`, through which application code resumes other
    /// threads. Must happen before a debugger connects to be tracked.
    pub fn define_thread_resume_method(&self) -> Location {
        let location = self.define_method(THREAD_SIG, "resume", &[(0, 1)]);
        self.lock().resume_method = Some(location);
        location
    }

    /// `resumer` is inside `Thread.resume` on `resumee`; `None` when it left.
    pub fn set_resumee(&self, resumer: ThreadRef, resumee: Option<ThreadRef>) {
        let mut state = self.lock();
        match resumee {
            Some(resumee) => state.resumees.insert(resumer, resumee),
            None => state.resumees.remove(&resumer),
        };
    }
}

impl Runtime for SimulatedVm {
    fn all_threads(&self) -> Vec<ThreadRef> {
        let state = self.lock();
        let mut threads: Vec<ThreadRef> = state
            .threads
            .iter()
            .filter(|(_, t)| t.started && t.alive)
            .map(|(r, _)| *r)
            .collect();
        threads.sort_by_key(|t| t.slot());
        threads
    }

    fn suspend_thread(&self, thread: ThreadRef) -> RuntimeResult<()> {
        let mut state = self.lock();
        let t = state.live_thread_mut(thread)?;
        if t.suspended {
            return Err(ErrorCode::ThreadSuspended);
        }
        t.suspended = true;
        t.suspend_calls += 1;
        trace!(%thread, "sim suspend");
        Ok(())
    }

    fn resume_thread(&self, thread: ThreadRef) -> RuntimeResult<()> {
        {
            let mut state = self.lock();
            let t = state.live_thread_mut(thread)?;
            if !t.suspended {
                return Err(ErrorCode::ThreadNotSuspended);
            }
            t.suspended = false;
            t.resume_calls += 1;
        }
        trace!(%thread, "sim resume");
        self.parked.notify_all();
        Ok(())
    }

    fn interrupt_thread(&self, thread: ThreadRef) -> RuntimeResult<()> {
        self.lock().live_thread_mut(thread)?.interrupt_calls += 1;
        Ok(())
    }

    fn stop_thread(&self, thread: ThreadRef, throwable: ObjectRef) -> RuntimeResult<()> {
        self.lock().live_thread_mut(thread)?.stopped_with = Some(throwable);
        Ok(())
    }

    fn thread_status(&self, thread: ThreadRef) -> RuntimeResult<ThreadStatus> {
        let state = self.lock();
        let t = state.thread(thread)?;
        Ok(if t.started && t.alive {
            ThreadStatus::Running
        } else {
            ThreadStatus::Zombie
        })
    }

    fn attach_current_thread(&self, name: &str) -> Option<ThreadRef> {
        Some(self.spawn_started_thread(name))
    }

    fn park_while_suspended(&self, thread: ThreadRef) {
        let mut state = self.lock();
        if !state.threads.get(&thread).is_some_and(|t| t.suspended) {
            return;
        }
        if let Some(t) = state.threads.get_mut(&thread) {
            t.parked = true;
        }
        self.parked.notify_all();
        while state.threads.get(&thread).is_some_and(|t| t.suspended) {
            self.parked.wait(&mut state);
        }
        if let Some(t) = state.threads.get_mut(&thread) {
            t.parked = false;
        }
    }

    fn frame_count(&self, thread: ThreadRef) -> RuntimeResult<i32> {
        Ok(self.lock().thread(thread)?.frames.len() as i32)
    }

    fn frame_location(&self, thread: ThreadRef, depth: i32) -> RuntimeResult<Location> {
        let state = self.lock();
        let frames = &state.thread(thread)?.frames;
        usize::try_from(depth)
            .ok()
            .and_then(|d| frames.len().checked_sub(d + 1))
            .map(|i| frames[i])
            .ok_or(ErrorCode::NoMoreFrames)
    }

    fn notify_frame_pop(&self, thread: ThreadRef, depth: i32) -> RuntimeResult<()> {
        let mut state = self.lock();
        let location = {
            let frames = &state.thread(thread)?.frames;
            usize::try_from(depth)
                .ok()
                .and_then(|d| frames.len().checked_sub(d + 1))
                .map(|i| (i + 1, frames[i]))
        };
        let Some((height, location)) = location else {
            return Err(ErrorCode::NoMoreFrames);
        };
        if state
            .methods
            .get(&(location.class, location.method))
            .is_some_and(|m| m.native)
        {
            return Err(ErrorCode::OpaqueFrame);
        }
        if !state.thread_mut(thread)?.frame_pops.insert(height) {
            return Err(ErrorCode::Duplicate);
        }
        Ok(())
    }

    fn frame_this(&self, _thread: ThreadRef, _depth: i32) -> Option<ObjectRef> {
        None
    }

    fn line_table(&self, class: ClassRef, method: MethodId) -> RuntimeResult<Vec<LineEntry>> {
        self.lock()
            .method(class, method)?
            .lines
            .clone()
            .ok_or(ErrorCode::AbsentInformation)
    }

    fn is_method_native(&self, class: ClassRef, method: MethodId) -> bool {
        self.lock().method(class, method).is_ok_and(|m| m.native)
    }

    fn method_start(&self, class: ClassRef, method: MethodId) -> RuntimeResult<u64> {
        Ok(self.lock().method(class, method)?.start)
    }

    fn class_signature(&self, class: ClassRef) -> RuntimeResult<String> {
        self.lock()
            .signature_of(class)
            .map(str::to_string)
            .ok_or(ErrorCode::InvalidClass)
    }

    fn class_type_tag(&self, class: ClassRef) -> RefTypeTag {
        match self.lock().signature_of(class) {
            Some(sig) if sig.starts_with('[') => RefTypeTag::Array,
            _ => RefTypeTag::Class,
        }
    }

    fn object_class(&self, object: ObjectRef) -> RuntimeResult<ClassRef> {
        let mut state = self.lock();
        let kind = state.slot(object).ok_or(ErrorCode::InvalidObject)?.kind.clone();
        Ok(match kind {
            ObjectKind::Instance { class } => class,
            ObjectKind::Class { .. } => state.class_by_signature(CLASS_SIG),
            ObjectKind::Thread => state.class_by_signature(THREAD_SIG),
        })
    }

    fn object_tag(&self, object: ObjectRef) -> TypeTag {
        let state = self.lock();
        match state.slot(object).map(|s| &s.kind) {
            Some(ObjectKind::Thread) => TypeTag::Thread,
            Some(ObjectKind::Class { .. }) => TypeTag::ClassObject,
            Some(ObjectKind::Instance { class }) => match state.signature_of(*class) {
                Some(STRING_SIG) => TypeTag::String,
                Some(sig) if sig.starts_with('[') => TypeTag::Array,
                _ => TypeTag::Object,
            },
            None => TypeTag::Object,
        }
    }

    fn is_assignable(&self, sub: ClassRef, sup: ClassRef) -> bool {
        let state = self.lock();
        let mut current = Some(sub);
        while let Some(class) = current {
            if class == sup {
                return true;
            }
            current = state.superclass_of(class);
        }
        false
    }

    fn is_instance_of(&self, object: ObjectRef, class: ClassRef) -> bool {
        self.object_class(object)
            .is_ok_and(|own| self.is_assignable(own, class))
    }

    fn loaded_class_signatures(&self) -> Vec<String> {
        let state = self.lock();
        let mut signatures: Vec<String> = state.classes.keys().cloned().collect();
        signatures.sort();
        signatures
    }

    fn is_collected(&self, object: ObjectRef) -> bool {
        self.lock().slot(object).is_none()
    }

    fn add_gc_root(&self, object: ObjectRef) -> RuntimeResult<()> {
        let mut state = self.lock();
        if state.slot(object).is_none() {
            return Err(ErrorCode::InvalidObject);
        }
        *state.roots.entry(object).or_insert(0) += 1;
        Ok(())
    }

    fn remove_gc_root(&self, object: ObjectRef) {
        let mut state = self.lock();
        if let Some(count) = state.roots.get_mut(&object) {
            *count -= 1;
            if *count == 0 {
                state.roots.remove(&object);
            }
        }
    }

    fn set_event_mode(&self, enable: bool, kind: EventKind, thread: Option<ThreadRef>) -> RuntimeResult<()> {
        let mut state = self.lock();
        if let Some(thread) = thread {
            let t = state.thread(thread)?;
            if !t.started && !state.immediate_event_mode {
                return Err(ErrorCode::InvalidThread);
            }
        }
        if enable {
            state.event_modes.insert((kind, thread));
        } else {
            state.event_modes.remove(&(kind, thread));
        }
        Ok(())
    }

    fn supports_immediate_event_mode(&self) -> bool {
        self.lock().immediate_event_mode
    }

    fn set_breakpoint(&self, location: Location) -> RuntimeResult<()> {
        let mut state = self.lock();
        state.method(location.class, location.method)?;
        let bp = state.breakpoints.entry(location).or_default();
        if bp.active {
            return Err(ErrorCode::Duplicate);
        }
        bp.active = true;
        bp.sets += 1;
        Ok(())
    }

    fn clear_breakpoint(&self, location: Location) -> RuntimeResult<()> {
        match self.lock().breakpoints.get_mut(&location) {
            Some(bp) if bp.active => {
                bp.active = false;
                Ok(())
            }
            _ => Err(ErrorCode::NotFound),
        }
    }

    fn set_field_watch(&self, kind: EventKind, class: ClassRef, field: FieldId) -> RuntimeResult<()> {
        if self.lock().field_watches.insert((kind, class, field)) {
            Ok(())
        } else {
            Err(ErrorCode::Duplicate)
        }
    }

    fn clear_field_watch(&self, kind: EventKind, class: ClassRef, field: FieldId) -> RuntimeResult<()> {
        if self.lock().field_watches.remove(&(kind, class, field)) {
            Ok(())
        } else {
            Err(ErrorCode::NotFound)
        }
    }

    fn invoke_method(&self, thread: ThreadRef, call: &InvokeCall) -> RuntimeResult<InvokeOutcome> {
        let mut state = self.lock();
        state.live_thread_mut(thread)?;
        state.method(call.class, call.method)?;
        state.invocations.push((thread, call.clone()));
        if let Some(outcome) = state.invoke_outcome.clone() {
            return Ok(outcome);
        }
        let value = match call.kind {
            InvokeKind::Constructor => {
                let object = state.alloc(ObjectKind::Instance { class: call.class });
                Value::object(TypeTag::Object, Some(object))
            }
            _ => Value::void(),
        };
        Ok(InvokeOutcome {
            value,
            exception: None,
        })
    }

    fn thread_resume_location(&self) -> Option<Location> {
        self.lock().resume_method
    }

    fn resumee(&self, resumer: ThreadRef) -> Option<ThreadRef> {
        self.lock().resumees.get(&resumer).copied()
    }
}

/// Packet sink that keeps everything it is given.
#[derive(Default)]
pub struct RecordingSink {
    packets: Mutex<Vec<Packet>>,
    arrived: Condvar,
}

impl RecordingSink {
    pub fn packets(&self) -> Vec<Packet> {
        self.packets.lock().clone()
    }

    pub fn clear(&self) {
        self.packets.lock().clear();
    }

    /// Wait until at least `n` packets have been sent.
    pub fn wait_for_packets(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut packets = self.packets.lock();
        while packets.len() < n {
            if self.arrived.wait_until(&mut packets, deadline).timed_out() {
                return packets.len() >= n;
            }
        }
        true
    }
}

impl PacketSink for RecordingSink {
    fn send_packet(&self, packet: Packet) -> JdwpResult<()> {
        self.packets.lock().push(packet);
        self.arrived.notify_all();
        Ok(())
    }
}
