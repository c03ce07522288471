// Thread control
//
// Per-thread suspend bookkeeping. Suspends are reference counted: the runtime
// only sees the 0 -> 1 and 1 -> 0 transitions. Threads that cannot be suspended
// yet (not started) get a deferred suspend applied at their start event.

use crate::engine::{Engine, LockSet};
use crate::event_handler::{HandlerAction, HandlerKey, HandlerState};
use crate::event_helper::EventRecord;
use crate::protocol::ErrorCode;
use crate::runtime::{Runtime, RuntimeEvent};
use crate::types::*;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Pre-suspend re-checks the pending application resume this often, since a
/// completed resume is not always signalled.
const APP_RESUME_POLL: Duration = Duration::from_millis(1000);

#[derive(Debug)]
pub struct ThreadNode {
    pub thread: ThreadRef,
    pub suspend_count: i32,
    /// The engine physically suspended this thread and owes it a resume.
    pub to_be_resumed: bool,
    pub pending_interrupt: bool,
    pub is_debug_thread: bool,
    pub suspend_on_start: bool,
    pub is_started: bool,
    pub current_event: Option<EventKind>,
    pub pending_stop: Option<ObjectRef>,
    /// Depth of the frame calling the application resume method, 0 if none.
    pub resume_frame_depth: i32,
    resume_watch: Vec<HandlerKey>,
    event_bag: Vec<EventRecord>,
}

impl ThreadNode {
    fn new(thread: ThreadRef, is_debug_thread: bool) -> Self {
        Self {
            thread,
            suspend_count: 0,
            to_be_resumed: false,
            pending_interrupt: false,
            is_debug_thread,
            suspend_on_start: false,
            is_started: false,
            current_event: None,
            pending_stop: None,
            resume_frame_depth: 0,
            resume_watch: Vec::new(),
            event_bag: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeferredEventMode {
    thread: ThreadRef,
    kind: EventKind,
    enable: bool,
}

/// Threads that are running (started, not ended) and the others the engine
/// has had to track (suspended before start).
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    running: HashMap<ThreadRef, ThreadNode>,
    other: HashMap<ThreadRef, ThreadNode>,
    debug_threads: Vec<ThreadRef>,
    suspend_all_count: i32,
    deferred_modes: Vec<DeferredEventMode>,
}

impl ThreadRegistry {
    pub fn find(&self, thread: ThreadRef) -> Option<&ThreadNode> {
        self.running.get(&thread).or_else(|| self.other.get(&thread))
    }

    fn find_mut(&mut self, thread: ThreadRef) -> Option<&mut ThreadNode> {
        match self.running.get_mut(&thread) {
            Some(node) => Some(node),
            None => self.other.get_mut(&thread),
        }
    }

    pub fn find_running(&self, thread: ThreadRef) -> Option<&ThreadNode> {
        self.running.get(&thread)
    }

    pub fn is_running(&self, thread: ThreadRef) -> bool {
        self.running.contains_key(&thread)
    }

    pub fn suspend_all_count(&self) -> i32 {
        self.suspend_all_count
    }

    pub fn is_debug_thread(&self, thread: ThreadRef) -> bool {
        self.debug_threads.contains(&thread)
    }

    fn new_node(&self, thread: ThreadRef, inherit_suspend_all: bool) -> ThreadNode {
        let is_debug = self.is_debug_thread(thread);
        let mut node = ThreadNode::new(thread, is_debug);
        // A thread first seen while everything is suspended must be caught by
        // the matching resume-all, and must not run before it.
        if inherit_suspend_all && !is_debug && self.suspend_all_count > 0 {
            node.suspend_count = self.suspend_all_count;
            node.suspend_on_start = true;
        }
        node
    }

    fn find_or_insert_other(&mut self, thread: ThreadRef, inherit_suspend_all: bool) -> &mut ThreadNode {
        if self.find(thread).is_none() {
            let node = self.new_node(thread, inherit_suspend_all);
            self.other.insert(thread, node);
        }
        match self.running.get_mut(&thread) {
            Some(node) => node,
            None => self
                .other
                .entry(thread)
                .or_insert_with(|| ThreadNode::new(thread, false)),
        }
    }

    /// The thread is generating an event: make sure it sits in the running list.
    fn enter_running(&mut self, thread: ThreadRef) -> &mut ThreadNode {
        if !self.running.contains_key(&thread) {
            let node = self
                .other
                .remove(&thread)
                .unwrap_or_else(|| self.new_node(thread, true));
            self.running.insert(thread, node);
        }
        self.running
            .entry(thread)
            .or_insert_with(|| ThreadNode::new(thread, false))
    }

    /// Drop bookkeeping for not-yet-started threads nobody holds suspended.
    fn remove_resumed(&mut self) {
        self.other.retain(|_, node| node.suspend_count > 0);
    }

    fn nodes_mut(&mut self) -> impl Iterator<Item = &mut ThreadNode> {
        self.running.values_mut().chain(self.other.values_mut())
    }

    pub fn suspend_count(&self, thread: ThreadRef) -> i32 {
        self.find(thread).map_or(0, |n| n.suspend_count)
    }

    fn pending_app_resume(&self) -> bool {
        self.running.values().any(|n| n.resume_frame_depth > 0)
    }
}

fn common_suspend(runtime: &dyn Runtime, node: &mut ThreadNode) -> Result<(), ErrorCode> {
    match runtime.suspend_thread(node.thread) {
        Ok(()) => {
            node.to_be_resumed = true;
            Ok(())
        }
        // Someone else suspended it; their resume, not ours.
        Err(ErrorCode::ThreadSuspended) => Ok(()),
        Err(e) => Err(e),
    }
}

fn suspend_by_node(runtime: &dyn Runtime, node: &mut ThreadNode) -> Result<(), ErrorCode> {
    if node.is_debug_thread {
        return Ok(());
    }
    if node.suspend_on_start {
        node.suspend_count += 1;
        return Ok(());
    }
    if node.suspend_count == 0 {
        match common_suspend(runtime, node) {
            Ok(()) => {}
            Err(ErrorCode::InvalidThread) => {
                // Not started yet: suspended for real at its start event.
                node.suspend_on_start = true;
            }
            Err(e) => return Err(e),
        }
    }
    node.suspend_count += 1;
    Ok(())
}

fn deferred_suspend_by_node(runtime: &dyn Runtime, node: &mut ThreadNode) -> Result<(), ErrorCode> {
    if node.is_debug_thread {
        return Ok(());
    }
    let mut result = Ok(());
    if node.suspend_count > 0 {
        if let Err(e) = common_suspend(runtime, node) {
            node.suspend_count -= 1;
            result = Err(e);
        }
    }
    node.suspend_on_start = false;
    result
}

fn resume_by_node(runtime: &dyn Runtime, node: &mut ThreadNode) -> Result<(), ErrorCode> {
    if node.is_debug_thread {
        return Ok(());
    }
    if node.suspend_count > 0 {
        node.suspend_count -= 1;
        if node.suspend_count == 0 && node.to_be_resumed && !node.suspend_on_start {
            node.to_be_resumed = false;
            runtime.resume_thread(node.thread)?;
        }
    }
    Ok(())
}

impl Engine {
    /// Take every lock, waiting until no application thread is half way
    /// through resuming another thread.
    pub(crate) fn pre_suspend(&self) -> LockSet<'_> {
        let mut locks = self.lock_all();
        while locks.threads.pending_app_resume() {
            drop(locks);
            {
                let mut threads = self.threads.lock();
                self.threads_cv.wait_for(&mut threads, APP_RESUME_POLL);
            }
            locks = self.lock_all();
        }
        locks
    }

    pub(crate) fn suspend_thread_locked(
        &self,
        threads: &mut ThreadRegistry,
        thread: ThreadRef,
        deferred: bool,
    ) -> Result<(), ErrorCode> {
        let node = threads.find_or_insert_other(thread, true);
        let result = if deferred {
            deferred_suspend_by_node(&*self.runtime, node)
        } else {
            suspend_by_node(&*self.runtime, node)
        };
        debug!(%thread, count = node.suspend_count, deferred, "suspend thread");
        self.threads_cv.notify_all();
        result
    }

    /// Suspend one thread on behalf of the debugger.
    pub fn suspend_thread(&self, thread: ThreadRef, deferred: bool) -> Result<(), ErrorCode> {
        let mut locks = self.pre_suspend();
        self.suspend_thread_locked(&mut locks.threads, thread, deferred)
    }

    /// Undo one debugger suspend. With `unblock` the event helper may go on
    /// after a suspend-all event.
    pub fn resume_thread(&self, thread: ThreadRef, unblock: bool) -> Result<(), ErrorCode> {
        let result = {
            let mut locks = self.lock_all();
            let threads = &mut *locks.threads;
            let result = match threads.find_mut(thread) {
                Some(node) => {
                    let r = resume_by_node(&*self.runtime, node);
                    debug!(%thread, count = node.suspend_count, "resume thread");
                    r
                }
                None => Ok(()),
            };
            threads.remove_resumed();
            self.threads_cv.notify_all();
            result
        };
        if unblock {
            self.unblock_command_loop();
        }
        result
    }

    pub(crate) fn suspend_all_locked(&self, threads: &mut ThreadRegistry) -> Result<(), ErrorCode> {
        let mut result = Ok(());
        if !self.is_vm_dead() {
            let live = self.runtime.all_threads();
            for &thread in &live {
                if threads.is_debug_thread(thread) {
                    continue;
                }
                let node = threads.find_or_insert_other(thread, false);
                if let Err(e) = suspend_by_node(&*self.runtime, node) {
                    warn!(%thread, "suspend-all could not suspend thread: {}", e);
                    result = Err(e);
                }
            }
            // Threads not started yet are tracked only in the other list.
            let pending: Vec<ThreadRef> = threads
                .other
                .keys()
                .copied()
                .filter(|t| !live.contains(t))
                .collect();
            for thread in pending {
                if let Some(node) = threads.other.get_mut(&thread) {
                    suspend_by_node(&*self.runtime, node)?;
                }
            }
        }
        threads.suspend_all_count += 1;
        debug!(count = threads.suspend_all_count, "suspend all");
        self.threads_cv.notify_all();
        result
    }

    pub fn suspend_all(&self) -> Result<(), ErrorCode> {
        let mut locks = self.pre_suspend();
        self.suspend_all_locked(&mut locks.threads)
    }

    pub fn resume_all(&self) -> Result<(), ErrorCode> {
        let result = {
            let mut locks = self.lock_all();
            let threads = &mut *locks.threads;
            let mut result = Ok(());
            for node in threads.nodes_mut() {
                if let Err(e) = resume_by_node(&*self.runtime, node) {
                    result = Err(e);
                }
            }
            if threads.suspend_all_count > 0 {
                threads.suspend_all_count -= 1;
            }
            threads.remove_resumed();
            debug!(count = threads.suspend_all_count, "resume all");
            self.threads_cv.notify_all();
            result
        };
        self.unblock_command_loop();
        result
    }

    pub fn suspend_count(&self, thread: ThreadRef) -> i32 {
        self.threads.lock().suspend_count(thread)
    }

    pub fn is_debug_thread(&self, thread: ThreadRef) -> bool {
        self.threads.lock().is_debug_thread(thread)
    }

    /// Register an internal worker thread; it is never suspended and its
    /// events are ignored.
    pub fn add_debug_thread(&self, thread: ThreadRef) {
        let mut threads = self.threads.lock();
        if !threads.debug_threads.contains(&thread) {
            threads.debug_threads.push(thread);
        }
        if let Some(node) = threads.find_mut(thread) {
            node.is_debug_thread = true;
        }
    }

    pub fn remove_debug_thread(&self, thread: ThreadRef) {
        self.threads.lock().debug_threads.retain(|t| *t != thread);
    }

    /// Interrupt a thread; deferred while it is handling an event.
    pub fn interrupt_thread(&self, thread: ThreadRef) -> Result<(), ErrorCode> {
        let mut threads = self.threads.lock();
        match threads.running.get_mut(&thread) {
            Some(node) if node.current_event.is_some() => {
                node.pending_interrupt = true;
                Ok(())
            }
            _ => self.runtime.interrupt_thread(thread),
        }
    }

    /// Throw `throwable` in a thread; deferred while it is handling an event.
    pub fn stop_thread(&self, thread: ThreadRef, throwable: ObjectRef) -> Result<(), ErrorCode> {
        let mut threads = self.threads.lock();
        match threads.running.get_mut(&thread) {
            Some(node) if node.current_event.is_some() => {
                self.runtime.add_gc_root(throwable)?;
                if let Some(old) = node.pending_stop.replace(throwable) {
                    self.runtime.remove_gc_root(old);
                }
                Ok(())
            }
            _ => self.runtime.stop_thread(thread, throwable),
        }
    }

    /// Thread status as the debugger should see it: a thread busy in the event
    /// hook counts as running.
    pub fn application_thread_status(
        &self,
        thread: ThreadRef,
    ) -> Result<(ThreadStatus, SuspendStatus), ErrorCode> {
        let status = self.runtime.thread_status(thread)?;
        let threads = self.threads.lock();
        let status = match threads.find_running(thread) {
            Some(node) if node.current_event.is_some() => ThreadStatus::Running,
            _ => status,
        };
        let suspended = if threads.suspend_count(thread) > 0 {
            SuspendStatus::Suspended
        } else {
            SuspendStatus::Running
        };
        Ok((status, suspended))
    }

    /// Enable or disable a runtime event kind, optionally for one thread.
    /// Must not be called with the thread registry locked.
    pub(crate) fn set_event_mode(
        &self,
        enable: bool,
        kind: EventKind,
        thread: Option<ThreadRef>,
    ) -> Result<(), ErrorCode> {
        let Some(thread) = thread else {
            return self.runtime.set_event_mode(enable, kind, None);
        };
        if self.runtime.supports_immediate_event_mode() {
            return self.runtime.set_event_mode(enable, kind, Some(thread));
        }
        let mut threads = self.threads.lock();
        match threads.find_running(thread) {
            Some(node) if node.is_started => self.runtime.set_event_mode(enable, kind, Some(thread)),
            _ => {
                threads.deferred_modes.push(DeferredEventMode {
                    thread,
                    kind,
                    enable,
                });
                Ok(())
            }
        }
    }

    /// Called by the event hook before any handler sees the event.
    pub(crate) fn on_event_handler_entry(&self, kind: EventKind, thread: ThreadRef) -> Vec<EventRecord> {
        let (bag, suspend_now) = {
            let mut threads = self.threads.lock();
            let deferred = if kind == EventKind::ThreadStart {
                let (mine, rest): (Vec<_>, Vec<_>) = threads
                    .deferred_modes
                    .drain(..)
                    .partition(|m| m.thread == thread);
                threads.deferred_modes = rest;
                mine
            } else {
                Vec::new()
            };
            let node = threads.enter_running(thread);
            if kind == EventKind::ThreadStart {
                node.is_started = true;
                for mode in deferred {
                    if let Err(e) = self.runtime.set_event_mode(mode.enable, mode.kind, Some(thread)) {
                        warn!(%thread, "deferred event mode failed: {}", e);
                    }
                }
            }
            node.current_event = Some(kind);
            (std::mem::take(&mut node.event_bag), node.suspend_on_start)
        };
        if suspend_now {
            // The helper applies the suspend; the thread parks before any
            // handler runs.
            self.helper_suspend_thread(self.session(), thread);
            self.runtime.park_while_suspended(thread);
        }
        bag
    }

    /// Called by the event hook after the event has been reported.
    pub(crate) fn on_event_handler_exit(&self, kind: EventKind, thread: ThreadRef, mut bag: Vec<EventRecord>) {
        if kind == EventKind::ThreadEnd {
            self.forget_thread(thread);
            return;
        }
        let mut threads = self.threads.lock();
        if let Some(node) = threads.running.get_mut(&thread) {
            if node.pending_interrupt {
                node.pending_interrupt = false;
                if let Err(e) = self.runtime.interrupt_thread(thread) {
                    warn!(%thread, "deferred interrupt failed: {}", e);
                }
            }
            if let Some(throwable) = node.pending_stop.take() {
                if let Err(e) = self.runtime.stop_thread(thread, throwable) {
                    warn!(%thread, "deferred stop failed: {}", e);
                }
                self.runtime.remove_gc_root(throwable);
            }
            node.current_event = None;
            bag.clear();
            node.event_bag = bag;
        }
    }

    /// The thread has ended: drop its step, invoke and registry state.
    fn forget_thread(&self, thread: ThreadRef) {
        let mut handlers = self.handlers.lock();
        self.invokes.lock().remove(thread);
        {
            let mut steps = self.steps.lock();
            self.clear_step_locked(&mut handlers, &mut steps, thread);
            steps.remove(thread);
        }
        let watch = {
            let mut threads = self.threads.lock();
            let node = threads.running.remove(&thread);
            threads.deferred_modes.retain(|m| m.thread != thread);
            self.threads_cv.notify_all();
            node.map(|mut n| {
                if let Some(throwable) = n.pending_stop.take() {
                    self.runtime.remove_gc_root(throwable);
                }
                std::mem::take(&mut n.resume_watch)
            })
        };
        for key in watch.unwrap_or_default() {
            self.free_internal_locked(&mut handlers, key);
        }
    }

    /// Undo every debugger suspend and forget per-session thread state.
    pub(crate) fn reset_threads(&self) {
        let mut handlers = self.handlers.lock();
        let mut watches = Vec::new();
        {
            let mut threads = self.threads.lock();
            for node in threads.nodes_mut() {
                if node.to_be_resumed {
                    if let Err(e) = self.runtime.resume_thread(node.thread) {
                        warn!(thread = %node.thread, "resume on reset failed: {}", e);
                    }
                }
                node.to_be_resumed = false;
                node.suspend_count = 0;
                node.suspend_on_start = false;
                node.resume_frame_depth = 0;
                watches.append(&mut node.resume_watch);
            }
            threads.remove_resumed();
            threads.deferred_modes.clear();
            threads.suspend_all_count = 0;
            self.threads_cv.notify_all();
        }
        for key in watches {
            self.free_internal_locked(&mut handlers, key);
        }
    }

    /// Install the breakpoint that notices application threads resuming
    /// other threads, if the runtime exposes such a method.
    pub(crate) fn install_app_resume_tracking(&self) {
        let Some(location) = self.runtime.thread_resume_location() else {
            return;
        };
        let mut handlers = self.handlers.lock();
        if let Err(e) =
            self.create_internal_breakpoint(&mut handlers, HandlerAction::AppResume, None, location)
        {
            warn!("could not track application thread resumes: {}", e);
        }
    }

    /// `thread` entered the application resume method. Returns the thread it
    /// resumes, which must not proceed while the debugger holds it suspended.
    pub(crate) fn track_app_resume(&self, state: &mut HandlerState, resumer: ThreadRef) -> Option<ThreadRef> {
        let resumee = self.runtime.resumee(resumer)?;
        let depth = self.runtime.frame_count(resumer).ok()?;
        match self.runtime.notify_frame_pop(resumer, 0) {
            Ok(()) | Err(ErrorCode::Duplicate) => {}
            Err(e) => {
                warn!(thread = %resumer, "cannot watch application resume: {}", e);
                return Some(resumee);
            }
        }
        let needs_watch = {
            let mut threads = self.threads.lock();
            match threads.running.get_mut(&resumer) {
                Some(node) => {
                    node.resume_frame_depth = depth;
                    node.resume_watch.is_empty()
                }
                None => false,
            }
        };
        if needs_watch {
            let mut keys = Vec::new();
            for kind in [EventKind::FramePop, EventKind::ExceptionCatch] {
                match self.create_internal_thread_only(
                    state,
                    kind,
                    HandlerAction::AppResumeComplete,
                    resumer,
                ) {
                    Ok(key) => keys.push(key),
                    Err(e) => warn!("cannot watch application resume: {}", e),
                }
            }
            if let Some(node) = self.threads.lock().running.get_mut(&resumer) {
                node.resume_watch = keys;
            }
        }
        Some(resumee)
    }

    /// Frame pop or catch on a resuming thread: the resume may be over.
    pub(crate) fn handle_app_resume_completion(&self, state: &mut HandlerState, event: &RuntimeEvent) {
        let Some(thread) = event.thread() else {
            return;
        };
        let Ok(mut depth) = self.runtime.frame_count(thread) else {
            return;
        };
        if event.kind() == EventKind::FramePop {
            // Reported before the frame is gone.
            depth -= 1;
        }
        let finished_watch = {
            let mut threads = self.threads.lock();
            let Some(node) = threads.running.get_mut(&thread) else {
                return;
            };
            if node.resume_frame_depth > 0 && depth < node.resume_frame_depth {
                node.resume_frame_depth = 0;
                self.threads_cv.notify_all();
                std::mem::take(&mut node.resume_watch)
            } else {
                Vec::new()
            }
        };
        for key in finished_watch {
            self.free_internal_locked(state, key);
        }
    }

    /// Wait while the debugger holds `thread` suspended.
    pub(crate) fn block_on_debugger_suspend(&self, thread: ThreadRef) {
        let mut threads = self.threads.lock();
        while threads.find(thread).is_some_and(|n| n.suspend_count > 0) {
            self.threads_cv.wait(&mut threads);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::sim::SimulatedVm;
    use std::sync::Arc;

    fn setup() -> (Arc<SimulatedVm>, Arc<Engine>) {
        let vm = Arc::new(SimulatedVm::new());
        let engine = Engine::new(vm.clone(), EngineConfig::default());
        (vm, engine)
    }

    #[test]
    fn test_physical_suspend_only_on_transitions() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("worker");

        engine.suspend_thread(t, false).unwrap();
        engine.suspend_thread(t, false).unwrap();
        engine.suspend_thread(t, false).unwrap();
        assert_eq!(vm.suspend_calls(t), 1);
        assert_eq!(engine.suspend_count(t), 3);

        engine.resume_thread(t, false).unwrap();
        engine.resume_thread(t, false).unwrap();
        assert_eq!(vm.resume_calls(t), 0);
        engine.resume_thread(t, false).unwrap();
        assert_eq!(vm.resume_calls(t), 1);
        assert_eq!(engine.suspend_count(t), 0);

        // Extra resumes never drive the count negative.
        engine.resume_thread(t, false).unwrap();
        assert_eq!(engine.suspend_count(t), 0);
        assert_eq!(vm.resume_calls(t), 1);
    }

    #[test]
    fn test_thread_suspended_by_application_is_not_resumed() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("worker");
        vm.suspend_by_application(t);

        engine.suspend_thread(t, false).unwrap();
        assert_eq!(engine.suspend_count(t), 1);
        engine.resume_thread(t, false).unwrap();
        assert_eq!(vm.resume_calls(t), 0);
        assert!(vm.is_suspended(t));
    }

    #[test]
    fn test_unstarted_thread_gets_deferred_suspend() {
        let (vm, engine) = setup();
        let t = vm.spawn_thread("late");

        engine.suspend_thread(t, false).unwrap();
        assert_eq!(engine.suspend_count(t), 1);
        assert_eq!(vm.suspend_calls(t), 0);
        let threads = engine.threads.lock();
        let node = threads.find(t).unwrap();
        assert!(node.suspend_on_start);
        assert!(!threads.is_running(t));
    }

    #[test]
    fn test_deferred_suspend_applies_once_started() {
        let (vm, engine) = setup();
        let t = vm.spawn_thread("late");
        engine.suspend_thread(t, false).unwrap();
        engine.suspend_thread(t, false).unwrap();
        assert_eq!(engine.suspend_count(t), 2);

        vm.start_thread(t);
        engine.suspend_thread(t, true).unwrap();
        assert_eq!(vm.suspend_calls(t), 1);
        assert!(!engine.threads.lock().find(t).unwrap().suspend_on_start);

        engine.resume_thread(t, false).unwrap();
        engine.resume_thread(t, false).unwrap();
        assert_eq!(vm.resume_calls(t), 1);
    }

    #[test]
    fn test_resume_waits_for_handler_lock() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        engine.suspend_thread(t, false).unwrap();

        let handlers = engine.handlers.lock();
        let (tx, rx) = std::sync::mpsc::channel();
        let resumer = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine.resume_thread(t, false).unwrap();
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(vm.is_suspended(t));

        drop(handlers);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        resumer.join().unwrap();
        assert!(!vm.is_suspended(t));
    }

    #[test]
    fn test_debug_threads_are_exempt() {
        let (vm, engine) = setup();
        let helper = vm.spawn_started_thread("helper");
        engine.add_debug_thread(helper);

        engine.suspend_thread(helper, false).unwrap();
        engine.suspend_all().unwrap();
        assert_eq!(vm.suspend_calls(helper), 0);
        assert_eq!(engine.suspend_count(helper), 0);
        assert!(engine.is_debug_thread(helper));
    }

    #[test]
    fn test_suspend_all_and_resume_all() {
        let (vm, engine) = setup();
        let a = vm.spawn_started_thread("a");
        let b = vm.spawn_started_thread("b");

        engine.suspend_thread(a, false).unwrap();
        engine.suspend_all().unwrap();
        assert_eq!(engine.suspend_count(a), 2);
        assert_eq!(engine.suspend_count(b), 1);
        assert_eq!(vm.suspend_calls(a), 1);
        assert_eq!(vm.suspend_calls(b), 1);
        assert_eq!(engine.threads.lock().suspend_all_count(), 1);

        engine.resume_all().unwrap();
        assert_eq!(engine.suspend_count(a), 1);
        assert_eq!(engine.suspend_count(b), 0);
        assert_eq!(vm.resume_calls(b), 1);
        assert_eq!(vm.resume_calls(a), 0);
        assert_eq!(engine.threads.lock().suspend_all_count(), 0);
        // b has no reason to be tracked any more
        assert!(engine.threads.lock().find(b).is_none());
    }

    #[test]
    fn test_thread_started_during_suspend_all_inherits_count() {
        let (vm, engine) = setup();
        let _a = vm.spawn_started_thread("a");
        engine.suspend_all().unwrap();

        let late = vm.spawn_thread("late");
        vm.start_thread(late);
        engine.on_event_handler_entry_for_test(late);

        let threads = engine.threads.lock();
        let node = threads.find(late).unwrap();
        assert_eq!(node.suspend_count, 1);
    }

    #[test]
    fn test_interrupt_deferred_while_handling_event() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let bag = engine.on_event_handler_entry(EventKind::Breakpoint, t);

        engine.interrupt_thread(t).unwrap();
        assert_eq!(vm.interrupt_calls(t), 0);
        let (status, _) = engine.application_thread_status(t).unwrap();
        assert_eq!(status, ThreadStatus::Running);

        engine.on_event_handler_exit(EventKind::Breakpoint, t, bag);
        assert_eq!(vm.interrupt_calls(t), 1);

        engine.interrupt_thread(t).unwrap();
        assert_eq!(vm.interrupt_calls(t), 2);
    }

    #[test]
    fn test_stop_deferred_while_handling_event() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let throwable = vm.new_object("Ljava/lang/ThreadDeath;");
        let bag = engine.on_event_handler_entry(EventKind::Breakpoint, t);

        engine.stop_thread(t, throwable).unwrap();
        assert!(vm.stopped_with(t).is_none());
        engine.on_event_handler_exit(EventKind::Breakpoint, t, bag);
        assert_eq!(vm.stopped_with(t), Some(throwable));
    }

    #[test]
    fn test_thread_end_removes_node() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let bag = engine.on_event_handler_entry(EventKind::ThreadStart, t);
        engine.on_event_handler_exit(EventKind::ThreadStart, t, bag);
        assert!(engine.threads.lock().is_running(t));

        let bag = engine.on_event_handler_entry(EventKind::ThreadEnd, t);
        engine.on_event_handler_exit(EventKind::ThreadEnd, t, bag);
        assert!(engine.threads.lock().find(t).is_none());
    }

    #[test]
    fn test_reset_resumes_everything() {
        let (vm, engine) = setup();
        let a = vm.spawn_started_thread("a");
        engine.suspend_thread(a, false).unwrap();
        engine.suspend_thread(a, false).unwrap();
        engine.suspend_all().unwrap();

        engine.reset_threads();
        assert_eq!(vm.resume_calls(a), 1);
        assert_eq!(engine.suspend_count(a), 0);
        assert_eq!(engine.threads.lock().suspend_all_count(), 0);
    }

    #[test]
    fn test_event_mode_deferred_until_start() {
        let (vm, engine) = setup();
        vm.set_immediate_event_mode(false);
        let t = vm.spawn_thread("late");

        engine.set_event_mode(true, EventKind::Breakpoint, Some(t)).unwrap();
        assert!(!vm.event_mode_enabled(EventKind::Breakpoint, Some(t)));

        vm.start_thread(t);
        let bag = engine.on_event_handler_entry(EventKind::ThreadStart, t);
        assert!(vm.event_mode_enabled(EventKind::Breakpoint, Some(t)));
        engine.on_event_handler_exit(EventKind::ThreadStart, t, bag);
    }

    impl Engine {
        fn on_event_handler_entry_for_test(&self, thread: ThreadRef) {
            let mut threads = self.threads.lock();
            threads.enter_running(thread);
        }
    }
}
