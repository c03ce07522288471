// Event handler
//
// One chain of handlers per event kind. The runtime's event hook runs every
// event through the chain of its kind in registration order; each handler
// whose filters pass runs its action, which for debugger requests means
// recording the event for the report.

use crate::class_track::ClassTracker;
use crate::engine::Engine;
use crate::event_filter::{signature_to_classname, Filter};
use crate::event_helper::EventRecord;
use crate::protocol::ErrorCode;
use crate::runtime::RuntimeEvent;
use crate::types::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Stable handle of an installed handler. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerKey(u64);

/// Claims events of one thread before normal dispatch. Returns true when the
/// event was consumed.
pub type RedirectHook = Arc<dyn Fn(&RuntimeEvent) -> bool + Send + Sync>;

/// What a handler does with an event that passed its filters.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerAction {
    /// Record the event for the debugger.
    Report,
    StepFramePop,
    StepExceptionCatch,
    StepMethodEnter,
    /// Breakpoint on the application's thread resume method.
    AppResume,
    AppResumeComplete,
    /// One-shot breakpoint carrying reports held back until it is hit.
    DeferredReport(Vec<EventRecord>),
}

#[derive(Debug)]
pub struct HandlerNode {
    /// Request id seen by the debugger; 0 for internal handlers.
    pub handler_id: i32,
    pub kind: EventKind,
    pub suspend_policy: SuspendPolicy,
    pub(crate) filters: Vec<Option<Filter>>,
    pub(crate) action: HandlerAction,
}

impl HandlerNode {
    pub fn new(kind: EventKind, suspend_policy: SuspendPolicy, filter_count: usize) -> Self {
        Self {
            handler_id: 0,
            kind,
            suspend_policy,
            filters: vec![None; filter_count],
            action: HandlerAction::Report,
        }
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// The thread events are enabled for, if the handler is thread scoped.
    pub fn request_thread(&self) -> Option<ThreadRef> {
        self.filters.iter().flatten().find_map(|f| match f {
            Filter::ThreadOnly(thread) => Some(*thread),
            Filter::Step { thread, .. } => Some(*thread),
            _ => None,
        })
    }

    pub fn location_filter(&self) -> Option<Location> {
        self.filters.iter().flatten().find_map(|f| match f {
            Filter::LocationOnly(location) => Some(*location),
            _ => None,
        })
    }

    pub fn field_filter(&self) -> Option<(ClassRef, FieldId)> {
        self.filters.iter().flatten().find_map(|f| match f {
            Filter::FieldOnly { class, field } => Some((*class, *field)),
            _ => None,
        })
    }
}

/// Everything guarded by the handler lock.
pub struct HandlerState {
    nodes: HashMap<HandlerKey, HandlerNode>,
    chains: BTreeMap<EventKind, Vec<HandlerKey>>,
    next_key: u64,
    request_id_counter: i32,
    pub(crate) class_track: ClassTracker,
    redirect: Option<(ThreadRef, RedirectHook)>,
}

impl Default for HandlerState {
    fn default() -> Self {
        Self {
            nodes: HashMap::new(),
            chains: BTreeMap::new(),
            next_key: 1,
            request_id_counter: 1,
            class_track: ClassTracker::default(),
            redirect: None,
        }
    }
}

impl HandlerState {
    /// Append a node to the chain of its kind.
    pub(crate) fn insert(&mut self, node: HandlerNode) -> HandlerKey {
        let key = HandlerKey(self.next_key);
        self.next_key += 1;
        self.chains.entry(node.kind).or_default().push(key);
        self.nodes.insert(key, node);
        key
    }

    /// Take a node out of its chain. `None` if it is already gone.
    pub(crate) fn deinsert(&mut self, key: HandlerKey) -> Option<HandlerNode> {
        let node = self.nodes.remove(&key)?;
        if let Some(chain) = self.chains.get_mut(&node.kind) {
            chain.retain(|k| *k != key);
        }
        Some(node)
    }

    pub fn node(&self, key: HandlerKey) -> Option<&HandlerNode> {
        self.nodes.get(&key)
    }

    pub(crate) fn node_mut(&mut self, key: HandlerKey) -> Option<&mut HandlerNode> {
        self.nodes.get_mut(&key)
    }

    /// Snapshot of a chain, so handlers may free themselves while it is walked.
    pub(crate) fn chain(&self, kind: EventKind) -> Vec<HandlerKey> {
        self.chains.get(&kind).cloned().unwrap_or_default()
    }

    pub(crate) fn nodes_of(&self, kind: EventKind) -> impl Iterator<Item = &HandlerNode> + '_ {
        self.chains
            .get(&kind)
            .into_iter()
            .flatten()
            .filter_map(move |key| self.nodes.get(key))
    }

    fn find_by_id(&self, kind: EventKind, handler_id: i32) -> Option<HandlerKey> {
        self.chains
            .get(&kind)?
            .iter()
            .copied()
            .find(|key| self.nodes.get(key).is_some_and(|n| n.handler_id == handler_id))
    }

    fn next_request_id(&mut self) -> i32 {
        self.request_id_counter += 1;
        self.request_id_counter
    }

    pub fn len(&self, kind: EventKind) -> usize {
        self.chains.get(&kind).map_or(0, Vec::len)
    }
}

impl Engine {
    fn install_locked(&self, state: &mut HandlerState, mut node: HandlerNode, external: bool) -> Result<HandlerKey, ErrorCode> {
        node.handler_id = if external { state.next_request_id() } else { 0 };
        if let Err(e) = self.install_filters(state, &node) {
            if let Err(clear) = self.clear_filters(state, &mut node) {
                warn!("releasing filters of a failed request: {}", clear);
            }
            return Err(e);
        }
        debug!(kind = %node.kind, id = node.handler_id, "handler installed");
        Ok(state.insert(node))
    }

    /// Install a handler built from a debugger request; returns its request id.
    pub fn install_external(&self, node: HandlerNode) -> Result<i32, ErrorCode> {
        let mut state = self.handlers.lock();
        let key = self.install_locked(&mut state, node, true)?;
        Ok(state.node(key).map_or(0, |n| n.handler_id))
    }

    /// Drop a request that never got installed, releasing what its filters hold.
    pub fn discard_request(&self, mut node: HandlerNode) {
        let mut state = self.handlers.lock();
        if let Err(e) = self.clear_filters(&mut state, &mut node) {
            warn!("discarding request: {}", e);
        }
    }

    fn create_internal(
        &self,
        state: &mut HandlerState,
        kind: EventKind,
        action: HandlerAction,
        thread: Option<ThreadRef>,
        location: Option<Location>,
    ) -> Result<HandlerKey, ErrorCode> {
        let slots = usize::from(thread.is_some()) + usize::from(location.is_some());
        let mut node = HandlerNode::new(kind, SuspendPolicy::None, slots);
        node.action = action;
        let mut filled = Ok(());
        let mut index = 0;
        if let Some(thread) = thread {
            filled = self.set_thread_only_filter(&mut node, index, thread);
            index += 1;
        }
        if let (Ok(()), Some(location)) = (filled, location) {
            filled = self.set_location_only_filter(&mut node, index, location);
        }
        if let Err(e) = filled {
            if let Err(clear) = self.clear_filters(state, &mut node) {
                warn!("releasing filters of a failed handler: {}", clear);
            }
            return Err(e);
        }
        self.install_locked(state, node, false)
    }

    pub(crate) fn create_internal_thread_only(
        &self,
        state: &mut HandlerState,
        kind: EventKind,
        action: HandlerAction,
        thread: ThreadRef,
    ) -> Result<HandlerKey, ErrorCode> {
        self.create_internal(state, kind, action, Some(thread), None)
    }

    pub(crate) fn create_internal_breakpoint(
        &self,
        state: &mut HandlerState,
        action: HandlerAction,
        thread: Option<ThreadRef>,
        location: Location,
    ) -> Result<HandlerKey, ErrorCode> {
        self.create_internal(state, EventKind::Breakpoint, action, thread, Some(location))
    }

    /// Deinsert, then disable and release. Freeing a gone handler is a no-op.
    pub(crate) fn free_handler_locked(&self, state: &mut HandlerState, key: HandlerKey) -> Result<(), ErrorCode> {
        let Some(mut node) = state.deinsert(key) else {
            return Ok(());
        };
        debug!(kind = %node.kind, id = node.handler_id, "handler freed");
        self.deinstall_filters(state, &mut node)
    }

    pub(crate) fn free_internal_locked(&self, state: &mut HandlerState, key: HandlerKey) {
        if let Err(e) = self.free_handler_locked(state, key) {
            warn!("freeing internal handler: {}", e);
        }
    }

    /// EventRequest.Clear. Clearing an id that is already gone succeeds.
    pub fn free_by_id(&self, kind: EventKind, handler_id: i32) -> Result<(), ErrorCode> {
        let mut state = self.handlers.lock();
        match state.find_by_id(kind, handler_id) {
            Some(key) => self.free_handler_locked(&mut state, key),
            None => Ok(()),
        }
    }

    /// Free every debugger request of one kind. Internal handlers stay.
    pub fn free_all(&self, kind: EventKind) -> Result<(), ErrorCode> {
        let mut state = self.handlers.lock();
        for key in state.chain(kind) {
            if state.node(key).is_some_and(|n| n.handler_id != 0) {
                self.free_handler_locked(&mut state, key)?;
            }
        }
        Ok(())
    }

    /// Free the breakpoints set in one class.
    pub fn free_class_breakpoints(&self, class: ClassRef) {
        let mut state = self.handlers.lock();
        for key in state.chain(EventKind::Breakpoint) {
            let in_class = state
                .node(key)
                .and_then(HandlerNode::location_filter)
                .is_some_and(|l| l.class == class);
            if in_class {
                self.free_internal_locked(&mut state, key);
            }
        }
    }

    /// Number of handlers, internal ones included, in the chain of `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.lock().len(kind)
    }

    /// Route every event of `thread` to `hook` first; `None` removes the hook.
    pub fn set_redirect_hook(&self, redirect: Option<(ThreadRef, RedirectHook)>) {
        self.handlers.lock().redirect = redirect;
    }

    fn redirect_for(&self, thread: ThreadRef) -> Option<RedirectHook> {
        match &self.handlers.lock().redirect {
            Some((t, hook)) if *t == thread => Some(Arc::clone(hook)),
            _ => None,
        }
    }

    /// Free every handler and restart request ids. Pending invokes are
    /// detached first so their completions never reach the old debugger.
    pub(crate) fn reset_event_handlers(&self, session: SessionId) {
        let mut state = self.handlers.lock();
        self.detach_invokes();
        self.reset_event_helper(session);
        for kind in EventKind::ALL {
            for key in state.chain(kind) {
                self.free_internal_locked(&mut state, key);
            }
        }
        state.request_id_counter = 1;
    }

    /// The event hook of the runtime. Called on the thread the event happened
    /// on (or any thread for thread-less events).
    pub fn on_event(&self, event: RuntimeEvent) {
        // The class is already gone; unloads are discovered on the next event.
        if let RuntimeEvent::ClassUnload = event {
            self.pending_unloads.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let session = self.session();
        let count = self.event_count.fetch_add(1, Ordering::SeqCst);
        let interval = self.config.compaction_interval.max(1);
        let unloads_pending = self.pending_unloads.load(Ordering::SeqCst) > 0;
        if count.wrapping_add(1) % interval == 0 || unloads_pending {
            let freed = self.refs.compact();
            debug!(freed, "compacted reference table");
        }
        if unloads_pending {
            self.process_class_unloads();
        }

        let kind = event.kind();
        let thread = event.thread();
        if let Some(thread) = thread {
            if let Some(hook) = self.redirect_for(thread) {
                if hook(&event) {
                    return;
                }
            }
        }

        let mut bag = match thread {
            Some(thread) => self.on_event_handler_entry(kind, thread),
            None => Vec::new(),
        };

        let mut held_resumee = None;
        {
            let mut state = self.handlers.lock();
            if let RuntimeEvent::ClassPrepare { class, .. } = &event {
                if let Ok(signature) = self.runtime.class_signature(*class) {
                    state.class_track.add(signature);
                }
            }
            for key in state.chain(kind) {
                let (pass, should_delete) = self.passes_filter(&mut state, key, &event);
                if pass {
                    if let Some(resumee) = self.run_action(&mut state, key, &event, &mut bag) {
                        held_resumee = Some(resumee);
                    }
                }
                if should_delete {
                    if let Err(e) = self.free_handler_locked(&mut state, key) {
                        warn!(%kind, "freeing expired handler: {}", e);
                    }
                }
            }
        }

        // VM death goes out even when nobody asked for it.
        if kind == EventKind::VmDeath && bag.is_empty() {
            info!("reporting VM death");
            bag.push(EventRecord::Event {
                policy: SuspendPolicy::None,
                request_id: 0,
                event: event.clone(),
            });
        }

        if let Some(resumee) = held_resumee {
            self.block_on_debugger_suspend(resumee);
        }

        self.report_events(session, thread, Some(&event), &mut bag);

        if kind == EventKind::VmDeath {
            self.vm_dead.store(true, Ordering::SeqCst);
        }

        if let Some(thread) = thread {
            self.on_event_handler_exit(kind, thread, bag);
        }
    }

    /// Run the action of a handler that wants the event. Returns a thread the
    /// event thread must wait for before it may continue.
    fn run_action(
        &self,
        state: &mut HandlerState,
        key: HandlerKey,
        event: &RuntimeEvent,
        bag: &mut Vec<EventRecord>,
    ) -> Option<ThreadRef> {
        let node = state.node(key)?;
        match node.action {
            HandlerAction::Report => {
                bag.push(EventRecord::Event {
                    policy: node.suspend_policy,
                    request_id: node.handler_id,
                    event: event.clone(),
                });
            }
            HandlerAction::StepFramePop => self.handle_frame_pop(state, event),
            HandlerAction::StepExceptionCatch => self.handle_exception_catch(state, event),
            HandlerAction::StepMethodEnter => self.handle_method_enter(state, event),
            HandlerAction::AppResume => {
                return event.thread().and_then(|t| self.track_app_resume(state, t));
            }
            HandlerAction::AppResumeComplete => self.handle_app_resume_completion(state, event),
            HandlerAction::DeferredReport(_) => {
                let taken = state
                    .node_mut(key)
                    .map(|n| std::mem::replace(&mut n.action, HandlerAction::Report));
                if let Some(HandlerAction::DeferredReport(mut deferred)) = taken {
                    // Deferred events come first in the set.
                    deferred.append(bag);
                    *bag = deferred;
                }
                self.free_internal_locked(state, key);
            }
        }
        None
    }

    fn process_class_unloads(&self) {
        let unloaded = {
            let mut state = self.handlers.lock();
            // Unloads counted from here on are caught by the diff below.
            self.pending_unloads.store(0, Ordering::SeqCst);
            let loaded = self.runtime.loaded_class_signatures();
            state.class_track.process_unloads(&loaded)
        };
        for signature in unloaded {
            self.synthesize_unload_event(signature);
        }
    }

    fn synthesize_unload_event(&self, signature: String) {
        let session = self.session();
        let classname = signature_to_classname(&signature);
        let mut bag = Vec::new();
        {
            let mut state = self.handlers.lock();
            for key in state.chain(EventKind::ClassUnload) {
                let (pass, should_delete) = self.passes_unload_filter(&mut state, key, &classname);
                if pass {
                    if let Some(node) = state.node(key) {
                        bag.push(EventRecord::ClassUnload {
                            policy: node.suspend_policy,
                            request_id: node.handler_id,
                            signature: signature.clone(),
                        });
                    }
                }
                if should_delete {
                    self.free_internal_locked(&mut state, key);
                }
            }
        }
        debug!(%classname, "class unloaded");
        self.report_events(session, None, None, &mut bag);
    }

    /// Hold back a method entry or step report when a breakpoint at the same
    /// location will fire next, so both go out as one event set.
    fn defer_event_report(&self, event: &RuntimeEvent, thread: ThreadRef, bag: &mut Vec<EventRecord>) -> bool {
        let location = match event {
            RuntimeEvent::MethodEntry { location, .. } => {
                if self.runtime.is_method_native(location.class, location.method) {
                    return false;
                }
                match self.runtime.method_start(location.class, location.method) {
                    Ok(start) if start == location.index => *location,
                    _ => return false,
                }
            }
            RuntimeEvent::SingleStep { location, .. } => *location,
            _ => return false,
        };
        let mut state = self.handlers.lock();
        let breakpoint_here = state
            .nodes_of(EventKind::Breakpoint)
            .any(|n| n.location_filter() == Some(location));
        if !breakpoint_here {
            return false;
        }
        let records = std::mem::take(bag);
        match self.create_internal_breakpoint(
            &mut state,
            HandlerAction::DeferredReport(records.clone()),
            Some(thread),
            location,
        ) {
            Ok(_) => {
                debug!(%thread, "deferring event report to the breakpoint");
                true
            }
            Err(e) => {
                warn!(%thread, "cannot defer event report: {}", e);
                *bag = records;
                false
            }
        }
    }

    /// Hand the recorded events to the helper. If the report suspended the
    /// event thread, serve method invocations on it until it is resumed.
    fn report_events(
        &self,
        session: SessionId,
        thread: Option<ThreadRef>,
        event: Option<&RuntimeEvent>,
        bag: &mut Vec<EventRecord>,
    ) {
        if bag.is_empty() {
            return;
        }
        if !self.is_init_complete() {
            debug!(count = bag.len(), "initialization incomplete, events not reported");
            bag.clear();
            return;
        }
        if let (Some(event), Some(thread)) = (event, thread) {
            if self.defer_event_report(event, thread, bag) {
                return;
            }
        }
        let records = std::mem::take(bag);
        let policy = self.helper_report_events(session, records);
        if let Some(thread) = thread {
            if policy != SuspendPolicy::None {
                loop {
                    self.runtime.park_while_suspended(thread);
                    if !self.do_invoke(thread) {
                        break;
                    }
                    self.helper_report_invoke_done(session, thread);
                }
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::sim::SimulatedVm;

    fn setup() -> (Arc<SimulatedVm>, Arc<Engine>) {
        let vm = Arc::new(SimulatedVm::new());
        let engine = Engine::new(vm.clone(), EngineConfig::default());
        (vm, engine)
    }

    fn breakpoint_request(engine: &Engine, location: Location) -> HandlerNode {
        let mut node = HandlerNode::new(EventKind::Breakpoint, SuspendPolicy::None, 1);
        engine.set_location_only_filter(&mut node, 0, location).unwrap();
        node
    }

    #[test]
    fn test_request_ids_start_at_two() {
        let (vm, engine) = setup();
        let location = vm.define_method("LMain;", "main", &[(0, 1)]);
        let first = engine.install_external(breakpoint_request(&engine, location)).unwrap();
        let second = engine.install_external(breakpoint_request(&engine, location)).unwrap();
        assert_eq!(first, 2);
        assert_eq!(second, 3);
    }

    #[test]
    fn test_breakpoint_trap_is_shared() {
        let (vm, engine) = setup();
        let location = vm.define_method("LMain;", "main", &[(0, 1)]);
        let a = engine.install_external(breakpoint_request(&engine, location)).unwrap();
        let b = engine.install_external(breakpoint_request(&engine, location)).unwrap();
        assert_eq!(vm.breakpoint_sets(location), 1);

        engine.free_by_id(EventKind::Breakpoint, a).unwrap();
        assert!(vm.breakpoint_active(location));
        engine.free_by_id(EventKind::Breakpoint, b).unwrap();
        assert!(!vm.breakpoint_active(location));

        // Already gone.
        assert_eq!(engine.free_by_id(EventKind::Breakpoint, b), Ok(()));
    }

    #[test]
    fn test_breakpoint_without_location_is_rejected() {
        let (_vm, engine) = setup();
        let node = HandlerNode::new(EventKind::Breakpoint, SuspendPolicy::None, 0);
        assert_eq!(engine.install_external(node), Err(ErrorCode::Internal));
        assert_eq!(engine.handler_count(EventKind::Breakpoint), 0);
    }

    #[test]
    fn test_free_all_keeps_internal_handlers() {
        let (vm, engine) = setup();
        let location = vm.define_method("LMain;", "main", &[(0, 1)]);
        engine.install_external(breakpoint_request(&engine, location)).unwrap();
        {
            let mut state = engine.handlers.lock();
            engine
                .create_internal_breakpoint(&mut state, HandlerAction::Report, None, location)
                .unwrap();
        }
        assert_eq!(engine.handler_count(EventKind::Breakpoint), 2);

        engine.free_all(EventKind::Breakpoint).unwrap();
        assert_eq!(engine.handler_count(EventKind::Breakpoint), 1);
        assert!(vm.breakpoint_active(location));
    }

    #[test]
    fn test_free_class_breakpoints() {
        let (vm, engine) = setup();
        let main = vm.define_method("LMain;", "main", &[(0, 1)]);
        let other = vm.define_method("LOther;", "run", &[(0, 1)]);
        engine.install_external(breakpoint_request(&engine, main)).unwrap();
        engine.install_external(breakpoint_request(&engine, other)).unwrap();

        engine.free_class_breakpoints(main.class);
        assert!(!vm.breakpoint_active(main));
        assert!(vm.breakpoint_active(other));
    }

    #[test]
    fn test_thread_scoped_event_mode_follows_chain() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let mut node = HandlerNode::new(EventKind::MethodEntry, SuspendPolicy::None, 1);
        engine.set_thread_only_filter(&mut node, 0, t).unwrap();
        let id = engine.install_external(node).unwrap();
        assert!(vm.event_mode_enabled(EventKind::MethodEntry, Some(t)));

        engine.free_by_id(EventKind::MethodEntry, id).unwrap();
        assert!(!vm.event_mode_enabled(EventKind::MethodEntry, Some(t)));
    }

    #[test]
    fn test_redirect_hook_claims_thread_events() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let location = vm.define_method("LMain;", "main", &[(0, 1)]);
        engine.install_external(breakpoint_request(&engine, location)).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.set_redirect_hook(Some((
            t,
            Arc::new(move |event: &RuntimeEvent| {
                sink.lock().push(event.kind());
                true
            }),
        )));
        engine.on_event(RuntimeEvent::Breakpoint { thread: t, location });
        assert_eq!(*seen.lock(), vec![EventKind::Breakpoint]);
        assert!(engine.threads.lock().find(t).is_none());
    }

    #[test]
    fn test_reset_frees_everything_and_restarts_ids() {
        let (vm, engine) = setup();
        let location = vm.define_method("LMain;", "main", &[(0, 1)]);
        engine.install_external(breakpoint_request(&engine, location)).unwrap();
        engine.reset_event_handlers(SessionId(1));
        assert_eq!(engine.handler_count(EventKind::Breakpoint), 0);
        assert!(!vm.breakpoint_active(location));

        let id = engine.install_external(breakpoint_request(&engine, location)).unwrap();
        assert_eq!(id, 2);
    }
}
