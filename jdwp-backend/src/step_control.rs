// Step control
//
// At most one step request per thread. A pending step keeps single stepping
// enabled only while the thread runs in the frame it started in (or for step
// into, wherever it may stop). Deeper frames are skipped with a frame pop
// notification, and step into uses a method entry watch to find the next
// method worth stopping in.

use crate::engine::Engine;
use crate::event_filter::Filter;
use crate::event_handler::{HandlerAction, HandlerKey, HandlerNode, HandlerState};
use crate::protocol::ErrorCode;
use crate::runtime::RuntimeEvent;
use crate::types::*;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StepRequest {
    pub granularity: StepSize,
    pub depth: StepDepth,
    pub pending: bool,
    /// The frame the step started in has returned.
    pub frame_exited: bool,
    pub from_native: bool,
    pub from_stack_depth: i32,
    pub from_line: Option<i32>,
    line_entries: Vec<LineEntry>,
    catch_handler: Option<HandlerKey>,
    frame_pop_handler: Option<HandlerKey>,
    method_enter_handler: Option<HandlerKey>,
}

impl StepRequest {
    fn new(granularity: StepSize, depth: StepDepth) -> Self {
        Self {
            granularity,
            depth,
            pending: false,
            frame_exited: false,
            from_native: false,
            from_stack_depth: 0,
            from_line: None,
            line_entries: Vec::new(),
            catch_handler: None,
            frame_pop_handler: None,
            method_enter_handler: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct StepTable {
    requests: HashMap<ThreadRef, StepRequest>,
}

impl StepTable {
    pub fn get(&self, thread: ThreadRef) -> Option<&StepRequest> {
        self.requests.get(&thread)
    }

    pub(crate) fn remove(&mut self, thread: ThreadRef) -> Option<StepRequest> {
        self.requests.remove(&thread)
    }

    fn pending_mut(&mut self, thread: ThreadRef) -> Option<&mut StepRequest> {
        self.requests.get_mut(&thread).filter(|r| r.pending)
    }
}

/// Line of a bytecode index. Code before the first entry belongs to the first
/// line.
pub fn find_line(entries: &[LineEntry], index: u64) -> Option<i32> {
    let first = entries.first()?;
    let line = entries
        .iter()
        .take_while(|e| e.start <= index)
        .last()
        .unwrap_or(first)
        .line;
    Some(line)
}

fn step_handler_of(state: &HandlerState, thread: ThreadRef) -> Option<&HandlerNode> {
    state.nodes_of(EventKind::SingleStep).find(|node| {
        node.filters
            .iter()
            .flatten()
            .any(|f| matches!(f, Filter::Step { thread: t, .. } if *t == thread))
    })
}

impl Engine {
    fn set_stepping(&self, thread: ThreadRef, enable: bool) {
        if let Err(e) = self.set_event_mode(enable, EventKind::SingleStep, Some(thread)) {
            warn!(%thread, enable, "cannot change single stepping: {}", e);
        }
    }

    fn has_line_numbers(&self, location: Location) -> bool {
        self.runtime
            .line_table(location.class, location.method)
            .is_ok_and(|table| !table.is_empty())
    }

    /// Would the step handler of `thread` reject every event at `location`?
    fn step_filtered(&self, state: &HandlerState, thread: ThreadRef, location: Location) -> bool {
        step_handler_of(state, thread).is_some_and(|node| self.predict_filtering(node, location))
    }

    /// Capture where the step starts from.
    fn init_step_state(&self, request: &mut StepRequest, thread: ThreadRef) -> Result<(), ErrorCode> {
        request.from_line = None;
        request.line_entries.clear();
        request.from_native = false;
        request.frame_exited = false;
        request.from_stack_depth = self.runtime.frame_count(thread)?;

        let location = match self.runtime.frame_location(thread, 0) {
            Ok(location) => location,
            // No frames at all: step as if from native code.
            Err(ErrorCode::NoMoreFrames) => {
                request.from_native = true;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match self.runtime.notify_frame_pop(thread, 0) {
            Ok(()) | Err(ErrorCode::Duplicate) => {}
            Err(ErrorCode::OpaqueFrame) => request.from_native = true,
            Err(e) => return Err(e),
        }

        if request.granularity == StepSize::Line {
            if let Ok(mut entries) = self.runtime.line_table(location.class, location.method) {
                entries.sort_by_key(|e| e.start);
                request.from_line = find_line(&entries, location.index);
                request.line_entries = entries;
            }
        }
        Ok(())
    }

    fn init_step_events(
        &self,
        state: &mut HandlerState,
        request: &mut StepRequest,
        thread: ThreadRef,
    ) -> Result<(), ErrorCode> {
        if request.depth == StepDepth::Into || request.from_stack_depth > 0 {
            request.catch_handler = Some(self.create_internal_thread_only(
                state,
                EventKind::ExceptionCatch,
                HandlerAction::StepExceptionCatch,
                thread,
            )?);
            request.frame_pop_handler = Some(self.create_internal_thread_only(
                state,
                EventKind::FramePop,
                HandlerAction::StepFramePop,
                thread,
            )?);
        }

        let enable = match request.depth {
            StepDepth::Into => true,
            // Without line information in the current frame, step out of it
            // through the frame pop instead.
            StepDepth::Over => {
                request.from_stack_depth > 0
                    && !(request.granularity == StepSize::Line
                        && !request.from_native
                        && request.from_line.is_none())
            }
            // From Java code the frame pop brings us back; native frames
            // cannot be watched, so step.
            StepDepth::Out => request.from_native && request.from_stack_depth > 0,
        };
        if enable {
            self.set_event_mode(true, EventKind::SingleStep, Some(thread))?;
        }
        Ok(())
    }

    /// Start (or restart) a step on `thread`.
    pub(crate) fn begin_step(&self, thread: ThreadRef, size: StepSize, depth: StepDepth) -> Result<(), ErrorCode> {
        if !self.runtime.all_threads().contains(&thread) {
            return Err(ErrorCode::InvalidThread);
        }
        // Hold the thread still while its stack is examined.
        self.suspend_thread(thread, false)?;

        let armed = {
            let mut state = self.handlers.lock();
            let mut steps = self.steps.lock();
            self.clear_step_locked(&mut state, &mut steps, thread);

            let mut request = StepRequest::new(size, depth);
            let result = self
                .init_step_state(&mut request, thread)
                .and_then(|()| self.init_step_events(&mut state, &mut request, thread));
            request.pending = true;
            steps.requests.insert(thread, request);
            if result.is_err() {
                self.clear_step_locked(&mut state, &mut steps, thread);
            }
            result
        };

        let resumed = self.resume_thread(thread, false);
        match (armed, resumed) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => {
                if let Err(end) = self.end_step(thread) {
                    warn!(%thread, "cancelling step: {}", end);
                }
                Err(e)
            }
            (Ok(()), Ok(())) => {
                debug!(%thread, ?size, ?depth, "step started");
                Ok(())
            }
        }
    }

    /// Stop a pending step: disable stepping and free its internal handlers.
    pub(crate) fn clear_step_locked(&self, state: &mut HandlerState, steps: &mut StepTable, thread: ThreadRef) {
        let Some(request) = steps.pending_mut(thread) else {
            return;
        };
        self.set_stepping(thread, false);
        let handlers = [
            request.catch_handler.take(),
            request.frame_pop_handler.take(),
            request.method_enter_handler.take(),
        ];
        request.pending = false;
        request.line_entries.clear();
        for key in handlers.into_iter().flatten() {
            self.free_internal_locked(state, key);
        }
    }

    pub(crate) fn end_step_locked(&self, state: &mut HandlerState, thread: ThreadRef) -> Result<(), ErrorCode> {
        let mut steps = self.steps.lock();
        self.clear_step_locked(state, &mut steps, thread);
        Ok(())
    }

    pub fn end_step(&self, thread: ThreadRef) -> Result<(), ErrorCode> {
        let mut state = self.handlers.lock();
        self.end_step_locked(&mut state, thread)
    }

    pub fn is_stepping(&self, thread: ThreadRef) -> bool {
        self.steps.lock().get(thread).is_some_and(|r| r.pending)
    }

    /// A single step event passed the other filters of the step handler.
    /// Returns whether the step is complete and should be reported.
    pub(crate) fn handle_step(&self, state: &mut HandlerState, event: &RuntimeEvent) -> bool {
        let (Some(thread), Some(location)) = (event.thread(), event.location()) else {
            return false;
        };
        let mut steps = self.steps.lock();
        let Some(request) = steps.pending_mut(thread) else {
            return false;
        };

        let completed = if request.depth == StepDepth::Into && request.granularity == StepSize::Min {
            true
        } else if request.frame_exited {
            true
        } else {
            let current = match self.runtime.frame_count(thread) {
                Ok(depth) => depth,
                Err(e) => {
                    warn!(%thread, "cannot read stack depth while stepping: {}", e);
                    return false;
                }
            };
            let from = request.from_stack_depth;
            if current < from {
                true
            } else if current > from {
                if request.depth == StepDepth::Into
                    && self.has_line_numbers(location)
                    && !self.step_filtered(state, thread, location)
                {
                    true
                } else {
                    // Deeper than where we started: run freely until the
                    // frame returns, or for step into until a method of
                    // interest is entered.
                    self.set_stepping(thread, false);
                    if request.depth == StepDepth::Into && request.method_enter_handler.is_none() {
                        match self.create_internal_thread_only(
                            state,
                            EventKind::MethodEntry,
                            HandlerAction::StepMethodEnter,
                            thread,
                        ) {
                            Ok(key) => request.method_enter_handler = Some(key),
                            Err(e) => warn!(%thread, "cannot watch method entry: {}", e),
                        }
                    }
                    match self.runtime.notify_frame_pop(thread, 0) {
                        Ok(()) | Err(ErrorCode::Duplicate) => {}
                        Err(e) => warn!(%thread, "cannot watch frame pop: {}", e),
                    }
                    false
                }
            } else {
                match (request.granularity, request.from_line) {
                    (StepSize::Min, _) => true,
                    (StepSize::Line, None) => true,
                    (StepSize::Line, Some(from_line)) => {
                        find_line(&request.line_entries, location.index) != Some(from_line)
                    }
                }
            }
        };

        if completed {
            if let Some(key) = request.method_enter_handler.take() {
                self.free_internal_locked(state, key);
            }
            // Ready to go on from here if the request stays installed.
            if let Err(e) = self.init_step_state(request, thread) {
                warn!(%thread, "cannot re-arm step: {}", e);
            }
            debug!(%thread, "step completed");
        }
        completed
    }

    pub(crate) fn handle_frame_pop(&self, state: &mut HandlerState, event: &RuntimeEvent) {
        let Some(thread) = event.thread() else {
            return;
        };
        let mut steps = self.steps.lock();
        let Some(request) = steps.pending_mut(thread) else {
            return;
        };
        let Ok(depth) = self.runtime.frame_count(thread) else {
            return;
        };
        // The popping frame is still counted.
        let current = depth - 1;
        let from = request.from_stack_depth;
        if from > current {
            request.frame_exited = true;
        }
        if request.depth == StepDepth::Over || (request.depth == StepDepth::Out && from > current) {
            self.set_stepping(thread, true);
        } else if request.method_enter_handler.is_some() && from >= current {
            self.set_stepping(thread, true);
            if let Some(key) = request.method_enter_handler.take() {
                self.free_internal_locked(state, key);
            }
        }
    }

    pub(crate) fn handle_exception_catch(&self, state: &mut HandlerState, event: &RuntimeEvent) {
        let Some(thread) = event.thread() else {
            return;
        };
        let mut steps = self.steps.lock();
        let Some(request) = steps.pending_mut(thread) else {
            return;
        };
        let Ok(current) = self.runtime.frame_count(thread) else {
            return;
        };
        let from = request.from_stack_depth;
        if from > current {
            request.frame_exited = true;
        }
        if (request.depth == StepDepth::Over && from >= current)
            || (request.depth == StepDepth::Out && from > current)
        {
            self.set_stepping(thread, true);
        } else if request.method_enter_handler.is_some() && from >= current {
            self.set_stepping(thread, true);
            if let Some(key) = request.method_enter_handler.take() {
                self.free_internal_locked(state, key);
            }
        }
    }

    /// Step into entered a method while stepping was off.
    pub(crate) fn handle_method_enter(&self, state: &mut HandlerState, event: &RuntimeEvent) {
        let (Some(thread), Some(location)) = (event.thread(), event.location()) else {
            return;
        };
        let mut steps = self.steps.lock();
        let Some(request) = steps.pending_mut(thread) else {
            return;
        };
        crate::invariant!(request.depth == StepDepth::Into, "method entry watch on a non step-into request");
        let interesting = (request.granularity != StepSize::Line || self.has_line_numbers(location))
            && !self.step_filtered(state, thread, location);
        if interesting {
            self.set_stepping(thread, true);
            if let Some(key) = request.method_enter_handler.take() {
                self.free_internal_locked(state, key);
            }
        }
    }

    pub(crate) fn reset_steps(&self) {
        let mut state = self.handlers.lock();
        let mut steps = self.steps.lock();
        let threads: Vec<ThreadRef> = steps.requests.keys().copied().collect();
        for thread in threads {
            self.clear_step_locked(&mut state, &mut steps, thread);
        }
        steps.requests.clear();
    }
}
