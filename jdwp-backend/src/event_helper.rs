// Event helper
//
// Event threads never write to the debugger themselves. They queue commands
// for a single helper thread, which suspends threads as the suspend policy
// asks and writes the Event.Composite packets. The queue is bounded by an
// estimate of the bytes its commands occupy.

use crate::commands::{command_sets, event_set_commands};
use crate::engine::Engine;
use crate::outstream::PacketOutputStream;
use crate::protocol::{JdwpError, JdwpResult};
use crate::runtime::RuntimeEvent;
use crate::types::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Accounting size of a queued command, not counting its events.
const COMMAND_BASE_SIZE: usize = 64;
/// Accounting size of one event inside a composite command.
const EVENT_RECORD_SIZE: usize = 48;

/// Class status reported with class prepare events: verified and prepared.
const CLASS_STATUS_PREPARED: i32 = 3;

/// One event waiting to be reported, with the request it matched.
#[derive(Debug, Clone, PartialEq)]
pub enum EventRecord {
    Event {
        policy: SuspendPolicy,
        request_id: i32,
        event: RuntimeEvent,
    },
    ClassUnload {
        policy: SuspendPolicy,
        request_id: i32,
        signature: String,
    },
}

impl EventRecord {
    pub fn policy(&self) -> SuspendPolicy {
        match self {
            EventRecord::Event { policy, .. } | EventRecord::ClassUnload { policy, .. } => *policy,
        }
    }

    pub fn thread(&self) -> Option<ThreadRef> {
        match self {
            EventRecord::Event { event, .. } => event.thread(),
            EventRecord::ClassUnload { .. } => None,
        }
    }

    fn is_vm_death(&self) -> bool {
        matches!(
            self,
            EventRecord::Event {
                event: RuntimeEvent::VmDeath,
                ..
            }
        )
    }
}

#[derive(Debug)]
enum HelperCommandKind {
    ReportEventComposite {
        policy: SuspendPolicy,
        events: Vec<EventRecord>,
    },
    ReportInvokeDone {
        thread: ThreadRef,
    },
    ReportVmInit {
        thread: ThreadRef,
        policy: SuspendPolicy,
    },
    SuspendThread {
        thread: ThreadRef,
    },
}

#[derive(Debug)]
struct HelperCommand {
    kind: HelperCommandKind,
    session: SessionId,
    size: usize,
    /// Dropping the sender wakes a waiting producer just like sending.
    done: Option<oneshot::Sender<()>>,
}

impl HelperCommand {
    fn new(kind: HelperCommandKind, session: SessionId) -> Self {
        let size = match &kind {
            HelperCommandKind::ReportEventComposite { events, .. } => {
                COMMAND_BASE_SIZE + EVENT_RECORD_SIZE * events.len().saturating_sub(1)
            }
            _ => COMMAND_BASE_SIZE,
        };
        Self {
            kind,
            session,
            size,
            done: None,
        }
    }

    fn complete(mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

#[derive(Debug)]
pub struct CommandQueue {
    commands: VecDeque<HelperCommand>,
    bytes: usize,
    max_bytes: usize,
    hold_events: bool,
    shutdown: bool,
    session: SessionId,
    vm_death_reported: bool,
}

impl CommandQueue {
    fn new(max_bytes: usize) -> Self {
        Self {
            commands: VecDeque::new(),
            bytes: 0,
            max_bytes,
            hold_events: false,
            shutdown: false,
            session: SessionId::default(),
            vm_death_reported: false,
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_held(&self) -> bool {
        self.hold_events
    }
}

/// Queue and worker state of the helper thread.
pub struct EventHelper {
    queue: Mutex<CommandQueue>,
    queue_cv: Condvar,
    block_command_loop: Mutex<bool>,
    block_cv: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventHelper {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            queue: Mutex::new(CommandQueue::new(max_bytes)),
            queue_cv: Condvar::new(),
            block_command_loop: Mutex::new(false),
            block_cv: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn lock_queue(&self) -> MutexGuard<'_, CommandQueue> {
        self.queue.lock()
    }
}

/// Combined suspend policy of an event set: the strongest one asked for.
pub fn combined_policy(events: &[EventRecord]) -> SuspendPolicy {
    events
        .iter()
        .map(EventRecord::policy)
        .max()
        .unwrap_or(SuspendPolicy::None)
}

impl Engine {
    pub(crate) fn start_event_helper(self: &Arc<Self>) -> JdwpResult<()> {
        let mut worker = self.helper.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        {
            let mut queue = self.helper.queue.lock();
            queue.shutdown = false;
            queue.session = self.session();
        }
        let engine = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("jdwp-event-helper".to_string())
            .spawn(move || engine.helper_loop())
            .map_err(JdwpError::Io)?;
        *worker = Some(handle);
        Ok(())
    }

    pub(crate) fn shutdown_event_helper(&self) {
        {
            let mut queue = self.helper.queue.lock();
            queue.hold_events = false;
            queue.shutdown = true;
            self.helper.queue_cv.notify_all();
        }
        self.unblock_command_loop();
        let handle = self.helper.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                warn!("event helper thread panicked");
            }
        }
    }

    /// Drop everything queued for earlier sessions from now on.
    pub(crate) fn reset_event_helper(&self, session: SessionId) {
        {
            let mut queue = self.helper.queue.lock();
            queue.session = session;
            queue.hold_events = false;
            self.helper.queue_cv.notify_all();
        }
        // The debugger that would have resumed a suspend-all set is gone.
        self.unblock_command_loop();
    }

    /// Stop delivering events until `release_events`.
    pub fn hold_events(&self) {
        let mut queue = self.helper.queue.lock();
        queue.hold_events = true;
        self.helper.queue_cv.notify_all();
    }

    pub fn release_events(&self) {
        let mut queue = self.helper.queue.lock();
        queue.hold_events = false;
        self.helper.queue_cv.notify_all();
    }

    /// Let the helper go on after it reported a suspend-all event set.
    pub fn unblock_command_loop(&self) {
        let mut block = self.helper.block_command_loop.lock();
        *block = false;
        self.helper.block_cv.notify_all();
    }

    fn enqueue(&self, mut command: HelperCommand, wait: bool, reporting_vm_death: bool) {
        let (tx, rx) = oneshot::channel();
        if wait {
            command.done = Some(tx);
        }
        let mut waiting = wait;
        {
            let mut queue = self.helper.queue.lock();
            // An oversized command still goes through once the queue drains.
            while !queue.shutdown && !queue.commands.is_empty() && queue.bytes + command.size > queue.max_bytes {
                debug!(bytes = queue.bytes, "event queue full, waiting");
                self.helper.queue_cv.wait(&mut queue);
            }
            if queue.shutdown || queue.vm_death_reported {
                // Nothing goes out after shutdown or VM death and nobody waits for it.
                waiting = false;
            } else {
                queue.bytes += command.size;
                queue.commands.push_back(command);
                if reporting_vm_death {
                    queue.vm_death_reported = true;
                }
            }
            self.helper.queue_cv.notify_all();
        }
        if waiting {
            let _ = rx.blocking_recv();
        }
    }

    fn dequeue(&self) -> Option<HelperCommand> {
        let mut queue = self.helper.queue.lock();
        loop {
            while !queue.shutdown && (queue.hold_events || queue.commands.is_empty()) {
                self.helper.queue_cv.wait(&mut queue);
            }
            let command = queue.commands.pop_front()?;
            queue.bytes -= command.size;
            self.helper.queue_cv.notify_all();
            if command.session != queue.session {
                debug!(session = command.session.0, "dropping command of a stale session");
                command.complete();
                continue;
            }
            return Some(command);
        }
    }

    fn helper_loop(self: Arc<Self>) {
        if let Some(thread) = self.runtime.attach_current_thread("jdwp-event-helper") {
            self.add_debug_thread(thread);
        }
        info!("event helper running");
        while let Some(mut command) = self.dequeue() {
            // Decided before handling so an early resume cannot be missed.
            let block = matches!(
                command.kind,
                HelperCommandKind::ReportEventComposite {
                    policy: SuspendPolicy::All,
                    ..
                }
            );
            if block {
                *self.helper.block_command_loop.lock() = true;
            }
            let kind = std::mem::replace(
                &mut command.kind,
                HelperCommandKind::ReportEventComposite {
                    policy: SuspendPolicy::None,
                    events: Vec::new(),
                },
            );
            self.handle_command(kind);
            command.complete();
            if block {
                self.wait_command_loop_unblocked();
            }
        }
        info!("event helper stopped");
    }

    fn wait_command_loop_unblocked(&self) {
        let mut block = self.helper.block_command_loop.lock();
        while *block && !self.helper.queue.lock().shutdown {
            self.helper.block_cv.wait(&mut block);
        }
    }

    fn handle_command(&self, kind: HelperCommandKind) {
        match kind {
            HelperCommandKind::ReportEventComposite { policy, events } => {
                self.handle_report_event_composite(policy, &events)
            }
            HelperCommandKind::ReportInvokeDone { thread } => self.complete_invoke_request(thread),
            HelperCommandKind::ReportVmInit { thread, policy } => {
                self.handle_report_vm_init(thread, policy)
            }
            HelperCommandKind::SuspendThread { thread } => {
                if let Err(e) = self.suspend_thread(thread, true) {
                    warn!(%thread, "deferred suspend failed: {}", e);
                }
            }
        }
    }

    fn suspend_with_invoke_enabled(&self, policy: SuspendPolicy, thread: ThreadRef) {
        self.enable_invoke_requests(thread);
        let result = if policy == SuspendPolicy::All {
            self.suspend_all()
        } else {
            self.suspend_thread(thread, false)
        };
        if let Err(e) = result {
            warn!(%thread, "suspend for event failed: {}", e);
        }
    }

    fn handle_report_event_composite(&self, policy: SuspendPolicy, events: &[EventRecord]) {
        if policy != SuspendPolicy::None {
            match events.iter().find_map(EventRecord::thread) {
                Some(thread) => self.suspend_with_invoke_enabled(policy, thread),
                None => {
                    if let Err(e) = self.suspend_all() {
                        warn!("suspend for event failed: {}", e);
                    }
                }
            }
        }

        let mut out = PacketOutputStream::command(
            &self.refs,
            self.next_packet_id(),
            command_sets::EVENT,
            event_set_commands::COMPOSITE,
        );
        out.write_u8(policy as u8);
        out.write_i32(events.len() as i32);
        for record in events {
            self.write_event_record(&mut out, record);
        }
        debug!(count = events.len(), ?policy, "reporting event set");
        self.send_packet(out.into_packet());
    }

    fn write_location(&self, out: &mut PacketOutputStream<'_>, location: &Location) {
        out.write_location(self.runtime.class_type_tag(location.class), location);
    }

    fn write_tagged(&self, out: &mut PacketOutputStream<'_>, object: Option<ObjectRef>) {
        let tag = object.map_or(TypeTag::Object, |o| self.runtime.object_tag(o));
        out.write_tagged_object(tag, object);
    }

    fn write_event_record(&self, out: &mut PacketOutputStream<'_>, record: &EventRecord) {
        let (request_id, event) = match record {
            EventRecord::ClassUnload {
                request_id,
                signature,
                ..
            } => {
                out.write_u8(EventKind::ClassUnload as u8);
                out.write_i32(*request_id);
                out.write_string(signature);
                return;
            }
            EventRecord::Event {
                request_id, event, ..
            } => (*request_id, event),
        };
        out.write_u8(event.kind() as u8);
        out.write_i32(request_id);
        match event {
            RuntimeEvent::SingleStep { thread, location }
            | RuntimeEvent::Breakpoint { thread, location }
            | RuntimeEvent::FramePop { thread, location }
            | RuntimeEvent::MethodEntry { thread, location }
            | RuntimeEvent::MethodExit { thread, location }
            | RuntimeEvent::ExceptionCatch {
                thread, location, ..
            } => {
                out.write_object_ref(Some(*thread));
                self.write_location(out, location);
            }
            RuntimeEvent::Exception {
                thread,
                location,
                exception,
                catch_location,
            } => {
                out.write_object_ref(Some(*thread));
                self.write_location(out, location);
                self.write_tagged(out, Some(*exception));
                match catch_location {
                    Some(catch) => self.write_location(out, catch),
                    None => {
                        // Uncaught: an all-zero location.
                        out.write_u8(RefTypeTag::Class as u8);
                        out.write_u64(0);
                        out.write_u64(0);
                        out.write_u64(0);
                    }
                }
            }
            RuntimeEvent::FieldAccess {
                thread,
                location,
                field_class,
                field,
                object,
            } => {
                out.write_object_ref(Some(*thread));
                self.write_location(out, location);
                out.write_u8(self.runtime.class_type_tag(*field_class) as u8);
                out.write_object_ref(Some(*field_class));
                out.write_u64(*field);
                self.write_tagged(out, *object);
            }
            RuntimeEvent::FieldModification {
                thread,
                location,
                field_class,
                field,
                object,
                new_value,
            } => {
                out.write_object_ref(Some(*thread));
                self.write_location(out, location);
                out.write_u8(self.runtime.class_type_tag(*field_class) as u8);
                out.write_object_ref(Some(*field_class));
                out.write_u64(*field);
                self.write_tagged(out, *object);
                out.write_value(new_value);
            }
            RuntimeEvent::ThreadStart { thread }
            | RuntimeEvent::ThreadEnd { thread }
            | RuntimeEvent::VmInit { thread }
            | RuntimeEvent::UserDefined { thread, .. } => out.write_object_ref(Some(*thread)),
            RuntimeEvent::ClassPrepare { thread, class } | RuntimeEvent::ClassLoad { thread, class } => {
                out.write_object_ref(Some(*thread));
                out.write_u8(self.runtime.class_type_tag(*class) as u8);
                out.write_object_ref(Some(*class));
                match self.runtime.class_signature(*class) {
                    Ok(signature) => out.write_string(&signature),
                    Err(e) => out.set_error(e),
                }
                out.write_i32(CLASS_STATUS_PREPARED);
            }
            RuntimeEvent::ClassUnload | RuntimeEvent::VmDeath => {}
        }
    }

    fn handle_report_vm_init(&self, thread: ThreadRef, policy: SuspendPolicy) {
        let suspended = match policy {
            SuspendPolicy::All => self.suspend_all(),
            SuspendPolicy::EventThread => self.suspend_thread(thread, false),
            SuspendPolicy::None => Ok(()),
        };
        if let Err(e) = suspended {
            warn!(%thread, "suspend for VM init failed: {}", e);
        }

        let mut out = PacketOutputStream::command(
            &self.refs,
            self.next_packet_id(),
            command_sets::EVENT,
            event_set_commands::COMPOSITE,
        );
        out.write_u8(policy as u8);
        out.write_i32(1);
        out.write_u8(EventKind::VmInit as u8);
        // Not in response to any request.
        out.write_i32(0);
        out.write_object_ref(Some(thread));
        self.send_packet(out.into_packet());
    }

    /// Queue an event set. Returns its combined suspend policy; when that is
    /// not NONE (or the set reports VM death) the call returns only once the
    /// helper has applied the suspension.
    pub(crate) fn helper_report_events(&self, session: SessionId, events: Vec<EventRecord>) -> SuspendPolicy {
        if events.is_empty() {
            return SuspendPolicy::None;
        }
        let policy = combined_policy(&events);
        let reporting_vm_death = events.iter().any(EventRecord::is_vm_death);
        let wait = policy != SuspendPolicy::None || reporting_vm_death;
        let command = HelperCommand::new(HelperCommandKind::ReportEventComposite { policy, events }, session);
        self.enqueue(command, wait, reporting_vm_death);
        policy
    }

    pub(crate) fn helper_report_invoke_done(&self, session: SessionId, thread: ThreadRef) {
        let command = HelperCommand::new(HelperCommandKind::ReportInvokeDone { thread }, session);
        self.enqueue(command, true, false);
    }

    pub(crate) fn helper_report_vm_init(&self, session: SessionId, thread: ThreadRef, policy: SuspendPolicy) {
        let command = HelperCommand::new(HelperCommandKind::ReportVmInit { thread, policy }, session);
        self.enqueue(command, true, false);
    }

    /// Have the helper apply a deferred suspend to `thread`, which is at its
    /// start event and must not run on before that.
    pub(crate) fn helper_suspend_thread(&self, session: SessionId, thread: ThreadRef) {
        let command = HelperCommand::new(HelperCommandKind::SuspendThread { thread }, session);
        self.enqueue(command, true, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::instream::PacketInputStream;
    use crate::sim::{RecordingSink, SimulatedVm};
    use std::time::Duration;

    fn started(config: EngineConfig) -> (Arc<SimulatedVm>, Arc<Engine>, Arc<RecordingSink>) {
        let vm = Arc::new(SimulatedVm::new());
        let engine = Engine::new(vm.clone(), config);
        engine.start().unwrap();
        let sink = Arc::new(RecordingSink::default());
        engine.on_connect(sink.clone());
        (vm, engine, sink)
    }

    fn breakpoint(vm: &SimulatedVm, thread: ThreadRef, policy: SuspendPolicy) -> EventRecord {
        let location = vm.define_method("LMain;", "main", &[(0, 1)]);
        EventRecord::Event {
            policy,
            request_id: 7,
            event: RuntimeEvent::Breakpoint { thread, location },
        }
    }

    #[test]
    fn test_combined_policy_is_strongest() {
        let vm = SimulatedVm::new();
        let t = vm.spawn_started_thread("t");
        let events = vec![
            breakpoint(&vm, t, SuspendPolicy::None),
            breakpoint(&vm, t, SuspendPolicy::EventThread),
        ];
        assert_eq!(combined_policy(&events), SuspendPolicy::EventThread);
        assert_eq!(combined_policy(&[]), SuspendPolicy::None);
    }

    #[test]
    fn test_event_thread_policy_suspends_before_returning() {
        let (vm, engine, sink) = started(EngineConfig::default());
        let t = vm.spawn_started_thread("t");

        let policy = engine.helper_report_events(engine.session(), vec![breakpoint(&vm, t, SuspendPolicy::EventThread)]);
        assert_eq!(policy, SuspendPolicy::EventThread);
        assert_eq!(engine.suspend_count(t), 1);

        assert!(sink.wait_for_packets(1, Duration::from_secs(5)));
        let packet = &sink.packets()[0];
        let mut input = PacketInputStream::new(engine.refs(), packet);
        assert_eq!(input.read_u8(), Ok(SuspendPolicy::EventThread as u8));
        assert_eq!(input.read_i32(), Ok(1));
        assert_eq!(input.read_u8(), Ok(EventKind::Breakpoint as u8));
        assert_eq!(input.read_i32(), Ok(7));
        assert_eq!(input.read_thread_ref(), Ok(t));
        engine.shutdown();
    }

    #[test]
    fn test_stale_session_commands_are_dropped() {
        let (vm, engine, sink) = started(EngineConfig::default());
        let t = vm.spawn_started_thread("t");
        let stale = engine.session();
        engine.reset_event_helper(stale.next());

        // Waiting commands of the old session still complete.
        engine.helper_report_events(stale, vec![breakpoint(&vm, t, SuspendPolicy::EventThread)]);
        assert_eq!(engine.suspend_count(t), 0);
        std::thread::sleep(Duration::from_millis(50));
        assert!(sink.packets().is_empty());
        engine.shutdown();
    }

    #[test]
    fn test_held_events_wait_for_release() {
        let (vm, engine, sink) = started(EngineConfig::default());
        let t = vm.spawn_started_thread("t");
        engine.hold_events();
        engine.helper_report_events(engine.session(), vec![breakpoint(&vm, t, SuspendPolicy::None)]);
        assert!(!sink.wait_for_packets(1, Duration::from_millis(100)));

        engine.release_events();
        assert!(sink.wait_for_packets(1, Duration::from_secs(5)));
        engine.shutdown();
    }

    #[test]
    fn test_nothing_is_queued_after_vm_death() {
        let (_vm, engine, sink) = started(EngineConfig::default());
        let death = EventRecord::Event {
            policy: SuspendPolicy::None,
            request_id: 0,
            event: RuntimeEvent::VmDeath,
        };
        engine.helper_report_events(engine.session(), vec![death.clone()]);
        assert_eq!(sink.packets().len(), 1);

        engine.helper_report_events(engine.session(), vec![death]);
        assert!(!sink.wait_for_packets(2, Duration::from_millis(100)));
        engine.shutdown();
    }

    #[test]
    fn test_report_after_shutdown_returns() {
        let (vm, engine, sink) = started(EngineConfig::default());
        let t = vm.spawn_started_thread("t");
        engine.shutdown();

        let (tx, rx) = std::sync::mpsc::channel();
        let reporter = {
            let engine = engine.clone();
            let event = breakpoint(&vm, t, SuspendPolicy::EventThread);
            std::thread::spawn(move || {
                engine.helper_report_events(engine.session(), vec![event]);
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        reporter.join().unwrap();
        assert_eq!(engine.suspend_count(t), 0);
        assert!(sink.packets().is_empty());
    }

    #[test]
    fn test_vm_init_reports_single_event() {
        let (vm, engine, sink) = started(EngineConfig::default());
        let main = vm.spawn_started_thread("main");
        engine.report_vm_init(main);

        assert_eq!(engine.suspend_count(main), 1);
        assert!(engine.is_init_complete());
        let packet = &sink.packets()[0];
        let mut input = PacketInputStream::new(engine.refs(), packet);
        assert_eq!(input.read_u8(), Ok(SuspendPolicy::All as u8));
        assert_eq!(input.read_i32(), Ok(1));
        assert_eq!(input.read_u8(), Ok(EventKind::VmInit as u8));
        assert_eq!(input.read_i32(), Ok(0));
        assert_eq!(input.read_thread_ref(), Ok(main));
        engine.shutdown();
    }
}
