// Event filters
//
// Each handler carries a fixed number of filter slots, filled by the
// EventRequest.Set modifiers in order. Filters are evaluated in slot order and
// the first failing one rejects the event.
//
// Installing a handler enables whatever the runtime must deliver for it.
// Breakpoints and field watches are shared: only the first handler at a
// location sets the trap and only the last one clears it.

use crate::engine::Engine;
use crate::event_handler::{HandlerKey, HandlerNode, HandlerState};
use crate::protocol::ErrorCode;
use crate::runtime::RuntimeEvent;
use crate::types::*;
use tracing::{debug, warn};

/// One modifier of an event request.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Reserved by the protocol; always passes.
    Conditional(i32),
    /// Remaining deliveries before the handler deletes itself.
    Count(i32),
    ThreadOnly(ThreadRef),
    /// The event class or any subclass of it.
    ClassOnly(ClassRef),
    LocationOnly(Location),
    FieldOnly {
        class: ClassRef,
        field: FieldId,
    },
    ExceptionOnly {
        exception: Option<ClassRef>,
        caught: bool,
        uncaught: bool,
    },
    InstanceOnly(Option<ObjectRef>),
    ClassMatch(String),
    ClassExclude(String),
    Step {
        thread: ThreadRef,
        size: StepSize,
        depth: StepDepth,
    },
}

impl Filter {
    /// Runtime objects the filter keeps alive while it exists.
    fn held_objects(&self) -> Vec<ObjectRef> {
        match self {
            Filter::ThreadOnly(obj) | Filter::ClassOnly(obj) => vec![*obj],
            Filter::LocationOnly(location) => vec![location.class],
            Filter::FieldOnly { class, .. } => vec![*class],
            Filter::ExceptionOnly { exception, .. } => exception.iter().copied().collect(),
            Filter::InstanceOnly(instance) => instance.iter().copied().collect(),
            Filter::Step { thread, .. } => vec![*thread],
            Filter::Conditional(_)
            | Filter::Count(_)
            | Filter::ClassMatch(_)
            | Filter::ClassExclude(_) => Vec::new(),
        }
    }
}

/// Convert a type signature such as `Ljava/lang/String;` to the dotted class
/// name that class patterns are written against.
pub fn signature_to_classname(signature: &str) -> String {
    let name = match signature.strip_prefix('L') {
        Some(rest) => rest.strip_suffix(';').unwrap_or(rest),
        None => signature,
    };
    name.replace('/', ".")
}

/// Match a class name against a pattern with an optional leading or trailing
/// `*`. Without a wildcard the match must be exact.
pub fn pattern_matches(classname: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        classname.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        classname.starts_with(prefix)
    } else {
        classname == pattern
    }
}

/// What a slot check needs done once the handler is no longer borrowed.
enum SlotCheck {
    Decided(bool),
    Step,
}

fn check_index(node: &HandlerNode, index: usize) -> Result<(), ErrorCode> {
    if index >= node.filters.len() {
        return Err(ErrorCode::IllegalArgument);
    }
    Ok(())
}

/// Kinds whose runtime delivery is switched on permanently or managed by
/// stepping directly; installing a handler for them enables nothing.
fn is_self_managed(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::SingleStep
            | EventKind::ThreadStart
            | EventKind::ThreadEnd
            | EventKind::ClassPrepare
            | EventKind::ClassUnload
            | EventKind::VmInit
            | EventKind::VmDeath
    )
}

impl Engine {
    fn store_filter(&self, node: &mut HandlerNode, index: usize, filter: Filter) -> Result<(), ErrorCode> {
        let held = filter.held_objects();
        for (n, obj) in held.iter().enumerate() {
            if let Err(e) = self.runtime.add_gc_root(*obj) {
                for taken in &held[..n] {
                    self.runtime.remove_gc_root(*taken);
                }
                return Err(e);
            }
        }
        if let Some(old) = node.filters[index].replace(filter) {
            for obj in old.held_objects() {
                self.runtime.remove_gc_root(obj);
            }
        }
        Ok(())
    }

    pub fn set_conditional_filter(&self, node: &mut HandlerNode, index: usize, expr_id: i32) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        self.store_filter(node, index, Filter::Conditional(expr_id))
    }

    pub fn set_count_filter(&self, node: &mut HandlerNode, index: usize, count: i32) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if count <= 0 {
            return Err(ErrorCode::InvalidCount);
        }
        self.store_filter(node, index, Filter::Count(count))
    }

    pub fn set_thread_only_filter(&self, node: &mut HandlerNode, index: usize, thread: ThreadRef) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if node.kind == EventKind::ClassUnload {
            return Err(ErrorCode::IllegalArgument);
        }
        self.store_filter(node, index, Filter::ThreadOnly(thread))
    }

    pub fn set_location_only_filter(&self, node: &mut HandlerNode, index: usize, location: Location) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if !matches!(
            node.kind,
            EventKind::Breakpoint
                | EventKind::FieldAccess
                | EventKind::FieldModification
                | EventKind::SingleStep
                | EventKind::Exception
        ) {
            return Err(ErrorCode::IllegalArgument);
        }
        self.store_filter(node, index, Filter::LocationOnly(location))
    }

    pub fn set_field_only_filter(
        &self,
        node: &mut HandlerNode,
        index: usize,
        class: ClassRef,
        field: FieldId,
    ) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if !matches!(node.kind, EventKind::FieldAccess | EventKind::FieldModification) {
            return Err(ErrorCode::IllegalArgument);
        }
        self.store_filter(node, index, Filter::FieldOnly { class, field })
    }

    pub fn set_class_only_filter(&self, node: &mut HandlerNode, index: usize, class: ClassRef) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if matches!(
            node.kind,
            EventKind::UserDefined | EventKind::ClassUnload | EventKind::ThreadStart | EventKind::ThreadEnd
        ) {
            return Err(ErrorCode::IllegalArgument);
        }
        self.store_filter(node, index, Filter::ClassOnly(class))
    }

    pub fn set_exception_only_filter(
        &self,
        node: &mut HandlerNode,
        index: usize,
        exception: Option<ClassRef>,
        caught: bool,
        uncaught: bool,
    ) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if node.kind != EventKind::Exception {
            return Err(ErrorCode::IllegalArgument);
        }
        self.store_filter(
            node,
            index,
            Filter::ExceptionOnly {
                exception,
                caught,
                uncaught,
            },
        )
    }

    pub fn set_instance_only_filter(
        &self,
        node: &mut HandlerNode,
        index: usize,
        instance: Option<ObjectRef>,
    ) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        self.store_filter(node, index, Filter::InstanceOnly(instance))
    }

    pub fn set_class_match_filter(&self, node: &mut HandlerNode, index: usize, pattern: String) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if matches!(
            node.kind,
            EventKind::UserDefined | EventKind::ThreadStart | EventKind::ThreadEnd
        ) {
            return Err(ErrorCode::IllegalArgument);
        }
        self.store_filter(node, index, Filter::ClassMatch(pattern))
    }

    pub fn set_class_exclude_filter(&self, node: &mut HandlerNode, index: usize, pattern: String) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if matches!(
            node.kind,
            EventKind::UserDefined | EventKind::ThreadStart | EventKind::ThreadEnd
        ) {
            return Err(ErrorCode::IllegalArgument);
        }
        self.store_filter(node, index, Filter::ClassExclude(pattern))
    }

    /// Set a step filter and start the step on `thread`.
    pub fn set_step_filter(
        &self,
        node: &mut HandlerNode,
        index: usize,
        thread: ThreadRef,
        size: StepSize,
        depth: StepDepth,
    ) -> Result<(), ErrorCode> {
        check_index(node, index)?;
        if node.kind != EventKind::SingleStep {
            return Err(ErrorCode::IllegalArgument);
        }
        self.begin_step(thread, size, depth)?;
        if let Err(e) = self.store_filter(node, index, Filter::Step { thread, size, depth }) {
            if let Err(end) = self.end_step(thread) {
                warn!(%thread, "could not cancel step: {}", end);
            }
            return Err(e);
        }
        Ok(())
    }

    /// The object an event happened on, for instance filters.
    fn event_instance(&self, event: &RuntimeEvent) -> Option<ObjectRef> {
        match event {
            RuntimeEvent::FieldAccess { object, .. } | RuntimeEvent::FieldModification { object, .. } => {
                *object
            }
            RuntimeEvent::SingleStep { thread, .. }
            | RuntimeEvent::Breakpoint { thread, .. }
            | RuntimeEvent::FramePop { thread, .. }
            | RuntimeEvent::MethodEntry { thread, .. }
            | RuntimeEvent::MethodExit { thread, .. }
            | RuntimeEvent::Exception { thread, .. }
            | RuntimeEvent::ExceptionCatch { thread, .. } => self.runtime.frame_this(*thread, 0),
            _ => None,
        }
    }

    fn class_name_of(&self, class: Option<ClassRef>) -> Option<String> {
        let signature = self.runtime.class_signature(class?).ok()?;
        Some(signature_to_classname(&signature))
    }

    fn check_filter(&self, filter: &mut Filter, event: &RuntimeEvent, should_delete: &mut bool) -> SlotCheck {
        let thread = event.thread();
        let class = event.class();
        let pass = match filter {
            Filter::Conditional(_) => true,
            Filter::Count(count) => {
                crate::invariant!(*count > 0, "count filter evaluated after expiry");
                *count -= 1;
                if *count <= 0 {
                    *should_delete = true;
                }
                true
            }
            Filter::ThreadOnly(only) => thread == Some(*only),
            Filter::ClassOnly(only) => {
                class.is_some_and(|c| self.runtime.is_assignable(c, *only))
            }
            Filter::LocationOnly(only) => event.location() == Some(*only),
            Filter::FieldOnly { class: fc, field: ff } => match event {
                RuntimeEvent::FieldAccess {
                    field_class, field, ..
                }
                | RuntimeEvent::FieldModification {
                    field_class, field, ..
                } => field == ff && field_class == fc,
                _ => false,
            },
            Filter::ExceptionOnly {
                exception: only,
                caught,
                uncaught,
            } => match event {
                RuntimeEvent::Exception {
                    exception,
                    catch_location,
                    ..
                } => {
                    let wanted = if catch_location.is_some() { *caught } else { *uncaught };
                    wanted && only.map_or(true, |c| self.runtime.is_instance_of(*exception, c))
                }
                _ => false,
            },
            Filter::InstanceOnly(only) => match self.event_instance(event) {
                Some(instance) => *only == Some(instance),
                None => true,
            },
            Filter::ClassMatch(pattern) => self
                .class_name_of(class)
                .is_some_and(|name| pattern_matches(&name, pattern)),
            Filter::ClassExclude(pattern) => !self
                .class_name_of(class)
                .is_some_and(|name| pattern_matches(&name, pattern)),
            Filter::Step { thread: stepper, .. } => {
                if thread != Some(*stepper) {
                    return SlotCheck::Decided(false);
                }
                return SlotCheck::Step;
            }
        };
        SlotCheck::Decided(pass)
    }

    /// Run an event through a handler's filters. Returns whether the handler
    /// wants the event, and whether a count filter has expired so that the
    /// handler must be freed after it ran.
    pub(crate) fn passes_filter(&self, state: &mut HandlerState, key: HandlerKey, event: &RuntimeEvent) -> (bool, bool) {
        let mut should_delete = false;
        let Some(node) = state.node(key) else {
            return (false, false);
        };
        let kind = node.kind;
        let slots = node.filters.len();

        // Internal threads only ever see class lifecycle events.
        if !matches!(
            kind,
            EventKind::ClassPrepare | EventKind::ClassLoad | EventKind::ClassUnload
        ) {
            if let Some(thread) = event.thread() {
                if self.is_debug_thread(thread) {
                    return (false, false);
                }
            }
        }

        for slot in 0..slots {
            let check = {
                let Some(node) = state.node_mut(key) else {
                    return (false, should_delete);
                };
                match node.filters[slot].as_mut() {
                    Some(filter) => self.check_filter(filter, event, &mut should_delete),
                    None => SlotCheck::Decided(true),
                }
            };
            let pass = match check {
                SlotCheck::Decided(pass) => pass,
                SlotCheck::Step => self.handle_step(state, event),
            };
            if !pass {
                return (false, should_delete);
            }
        }
        (true, should_delete)
    }

    /// Filter a synthesized class unload. Only count and class pattern filters
    /// apply; the class itself is gone.
    pub(crate) fn passes_unload_filter(&self, state: &mut HandlerState, key: HandlerKey, classname: &str) -> (bool, bool) {
        let mut should_delete = false;
        let Some(node) = state.node_mut(key) else {
            return (false, false);
        };
        for filter in node.filters.iter_mut().flatten() {
            let pass = match filter {
                Filter::Count(count) => {
                    *count -= 1;
                    if *count <= 0 {
                        should_delete = true;
                    }
                    true
                }
                Filter::ClassMatch(pattern) => pattern_matches(classname, pattern),
                Filter::ClassExclude(pattern) => !pattern_matches(classname, pattern),
                other => {
                    crate::invariant!(false, "filter {:?} on a class unload request", other);
                    true
                }
            };
            if !pass {
                return (false, should_delete);
            }
        }
        (true, should_delete)
    }

    /// True only if every event of `node` at `location` is certain to be
    /// filtered out. Never changes filter state; evaluation stops at a count
    /// filter since its outcome cannot be predicted without consuming it.
    pub(crate) fn predict_filtering(&self, node: &HandlerNode, location: Location) -> bool {
        for filter in node.filters.iter().flatten() {
            match filter {
                Filter::ClassOnly(only) => {
                    if !self.runtime.is_assignable(location.class, *only) {
                        return true;
                    }
                }
                Filter::Count(_) => return false,
                Filter::ClassMatch(pattern) => {
                    let name = self.class_name_of(Some(location.class));
                    if !name.is_some_and(|n| pattern_matches(&n, pattern)) {
                        return true;
                    }
                }
                Filter::ClassExclude(pattern) => {
                    let name = self.class_name_of(Some(location.class));
                    if name.is_some_and(|n| pattern_matches(&n, pattern)) {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Enable what the runtime must deliver for `node`, which is not in its
    /// chain yet.
    pub(crate) fn install_filters(&self, state: &HandlerState, node: &HandlerNode) -> Result<(), ErrorCode> {
        if is_self_managed(node.kind) {
            return Ok(());
        }
        match node.kind {
            EventKind::Breakpoint => {
                let location = node.location_filter().ok_or(ErrorCode::Internal)?;
                if !state.nodes_of(node.kind).any(|n| n.location_filter() == Some(location)) {
                    self.runtime.set_breakpoint(location)?;
                }
            }
            EventKind::FieldAccess | EventKind::FieldModification => {
                let (class, field) = node.field_filter().ok_or(ErrorCode::Internal)?;
                if !state.nodes_of(node.kind).any(|n| n.field_filter() == Some((class, field))) {
                    self.runtime.set_field_watch(node.kind, class, field)?;
                }
            }
            _ => {}
        }
        let thread = node.request_thread();
        if !state.nodes_of(node.kind).any(|n| n.request_thread() == thread) {
            self.set_event_mode(true, node.kind, thread)?;
        }
        debug!(kind = %node.kind, ?thread, "installed event request");
        Ok(())
    }

    /// Undo `install_filters` for a node already removed from its chain.
    fn disable_events(&self, state: &HandlerState, node: &HandlerNode) -> Result<(), ErrorCode> {
        if is_self_managed(node.kind) {
            return Ok(());
        }
        let cleared = match node.kind {
            EventKind::Breakpoint => match node.location_filter() {
                Some(location) => {
                    if state.nodes_of(node.kind).any(|n| n.location_filter() == Some(location)) {
                        Ok(())
                    } else {
                        self.runtime.clear_breakpoint(location)
                    }
                }
                None => Err(ErrorCode::Internal),
            },
            EventKind::FieldAccess | EventKind::FieldModification => match node.field_filter() {
                Some((class, field)) => {
                    if state.nodes_of(node.kind).any(|n| n.field_filter() == Some((class, field))) {
                        Ok(())
                    } else {
                        self.runtime.clear_field_watch(node.kind, class, field)
                    }
                }
                None => Err(ErrorCode::Internal),
            },
            _ => Ok(()),
        };
        // Disable even if clearing the trap failed.
        let thread = node.request_thread();
        let mode = if state.nodes_of(node.kind).any(|n| n.request_thread() == thread) {
            Ok(())
        } else {
            self.set_event_mode(false, node.kind, thread)
        };
        cleared.and(mode)
    }

    /// Release what the filters hold. A step filter ends its step.
    pub(crate) fn clear_filters(&self, state: &mut HandlerState, node: &mut HandlerNode) -> Result<(), ErrorCode> {
        let mut result = Ok(());
        for filter in node.filters.drain(..).flatten() {
            if let Filter::Step { thread, .. } = filter {
                if let Err(e) = self.end_step_locked(state, thread) {
                    result = Err(e);
                }
            }
            for obj in filter.held_objects() {
                self.runtime.remove_gc_root(obj);
            }
        }
        result
    }

    /// Disable and clear a node that has been taken out of its chain.
    pub(crate) fn deinstall_filters(&self, state: &mut HandlerState, node: &mut HandlerNode) -> Result<(), ErrorCode> {
        let disabled = self.disable_events(state, node);
        let cleared = self.clear_filters(state, node);
        disabled.and(cleared)
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
    fn test_signature_to_classname() {
        assert_eq!(signature_to_classname("Ljava/lang/String;"), "java.lang.String");
        assert_eq!(signature_to_classname("[I"), "[I");
        assert_eq!(signature_to_classname("com/foo/Bar"), "com.foo.Bar");
    }

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("java.lang.String", "java.lang.*"));
        assert!(pattern_matches("java.lang.String", "*.String"));
        assert!(pattern_matches("java.lang.String", "*"));
        assert!(pattern_matches("java.lang.String", "java.lang.String"));
        assert!(!pattern_matches("java.lang.StringBuilder", "java.lang.String"));
        assert!(!pattern_matches("java.util.List", "java.lang.*"));
        assert!(!pattern_matches("Foo", "*LongerThanFoo"));
    }

    #[test]
    fn test_setters_validate_slot_and_kind() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let mut node = HandlerNode::new(EventKind::Breakpoint, SuspendPolicy::All, 2);

        assert_eq!(engine.set_count_filter(&mut node, 2, 1), Err(ErrorCode::IllegalArgument));
        assert_eq!(engine.set_count_filter(&mut node, 0, 0), Err(ErrorCode::InvalidCount));
        assert_eq!(
            engine.set_exception_only_filter(&mut node, 0, None, true, true),
            Err(ErrorCode::IllegalArgument)
        );
        assert_eq!(
            engine.set_step_filter(&mut node, 0, t, StepSize::Line, StepDepth::Over),
            Err(ErrorCode::IllegalArgument)
        );
        engine.set_thread_only_filter(&mut node, 1, t).unwrap();
        assert_eq!(node.request_thread(), Some(t));

        let mut unload = HandlerNode::new(EventKind::ClassUnload, SuspendPolicy::None, 1);
        assert_eq!(engine.set_thread_only_filter(&mut unload, 0, t), Err(ErrorCode::IllegalArgument));
        assert_eq!(
            engine.set_class_match_filter(&mut unload, 0, "java.*".into()),
            Ok(())
        );
    }

    #[test]
    fn test_count_filter_passes_until_expiry() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let location = vm.define_method("LMain;", "run", &[(0, 1)]);
        let mut node = HandlerNode::new(EventKind::Breakpoint, SuspendPolicy::None, 2);
        engine.set_location_only_filter(&mut node, 0, location).unwrap();
        engine.set_count_filter(&mut node, 1, 2).unwrap();

        let mut state = HandlerState::default();
        let key = state.insert(node);
        let event = RuntimeEvent::Breakpoint { thread: t, location };

        assert_eq!(engine.passes_filter(&mut state, key, &event), (true, false));
        assert_eq!(engine.passes_filter(&mut state, key, &event), (true, true));
    }

    #[test]
    fn test_failing_filter_short_circuits_count() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let other = vm.spawn_started_thread("other");
        let location = vm.define_method("LMain;", "run", &[(0, 1)]);
        let mut node = HandlerNode::new(EventKind::Breakpoint, SuspendPolicy::None, 2);
        engine.set_thread_only_filter(&mut node, 0, t).unwrap();
        engine.set_count_filter(&mut node, 1, 1).unwrap();

        let mut state = HandlerState::default();
        let key = state.insert(node);
        let miss = RuntimeEvent::Breakpoint { thread: other, location };
        assert_eq!(engine.passes_filter(&mut state, key, &miss), (false, false));
        assert_eq!(state.node(key).unwrap().filters[1], Some(Filter::Count(1)));

        let hit = RuntimeEvent::Breakpoint { thread: t, location };
        assert_eq!(engine.passes_filter(&mut state, key, &hit), (true, true));
    }

    #[test]
    fn test_debug_thread_events_are_suppressed() {
        let (vm, engine) = setup();
        let helper = vm.spawn_started_thread("helper");
        engine.add_debug_thread(helper);
        let class = vm.define_class("LFoo;");

        let mut state = HandlerState::default();
        let started = state.insert(HandlerNode::new(EventKind::ThreadStart, SuspendPolicy::None, 0));
        let prepare = state.insert(HandlerNode::new(EventKind::ClassPrepare, SuspendPolicy::None, 0));

        let start = RuntimeEvent::ThreadStart { thread: helper };
        assert_eq!(engine.passes_filter(&mut state, started, &start), (false, false));
        let prepared = RuntimeEvent::ClassPrepare { thread: helper, class };
        assert_eq!(engine.passes_filter(&mut state, prepare, &prepared), (true, false));
    }

    #[test]
    fn test_exception_filter_caught_and_uncaught() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let location = vm.define_method("LMain;", "run", &[(0, 1)]);
        let npe = vm.define_class("Ljava/lang/NullPointerException;");
        let exception = vm.new_instance(npe);

        let mut node = HandlerNode::new(EventKind::Exception, SuspendPolicy::None, 1);
        engine
            .set_exception_only_filter(&mut node, 0, Some(npe), false, true)
            .unwrap();
        let mut state = HandlerState::default();
        let key = state.insert(node);

        let uncaught = RuntimeEvent::Exception {
            thread: t,
            location,
            exception,
            catch_location: None,
        };
        let caught = RuntimeEvent::Exception {
            thread: t,
            location,
            exception,
            catch_location: Some(location),
        };
        assert!(engine.passes_filter(&mut state, key, &uncaught).0);
        assert!(!engine.passes_filter(&mut state, key, &caught).0);
    }

    #[test]
    fn test_class_patterns_use_dotted_names() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("t");
        let location = vm.define_method("Lcom/acme/Widget;", "paint", &[(0, 1)]);

        let mut node = HandlerNode::new(EventKind::MethodEntry, SuspendPolicy::None, 2);
        engine.set_class_match_filter(&mut node, 0, "com.acme.*".into()).unwrap();
        engine.set_class_exclude_filter(&mut node, 1, "*.Gadget".into()).unwrap();
        let mut state = HandlerState::default();
        let key = state.insert(node);

        let event = RuntimeEvent::MethodEntry { thread: t, location };
        assert!(engine.passes_filter(&mut state, key, &event).0);
    }

    #[test]
    fn test_predict_filtering_has_no_side_effects() {
        let (vm, engine) = setup();
        let location = vm.define_method("Lcom/acme/Widget;", "paint", &[(0, 1)]);

        let mut counted = HandlerNode::new(EventKind::SingleStep, SuspendPolicy::None, 2);
        engine.set_count_filter(&mut counted, 0, 3).unwrap();
        engine.set_class_exclude_filter(&mut counted, 1, "com.acme.*".into()).unwrap();
        assert!(!engine.predict_filtering(&counted, location));
        assert_eq!(counted.filters[0], Some(Filter::Count(3)));

        let mut excluded = HandlerNode::new(EventKind::SingleStep, SuspendPolicy::None, 2);
        engine.set_class_exclude_filter(&mut excluded, 0, "com.acme.*".into()).unwrap();
        engine.set_count_filter(&mut excluded, 1, 3).unwrap();
        assert!(engine.predict_filtering(&excluded, location));
    }

    #[test]
    fn test_unload_filter_uses_only_patterns_and_count() {
        let (_vm, engine) = setup();
        let mut node = HandlerNode::new(EventKind::ClassUnload, SuspendPolicy::None, 2);
        engine.set_class_match_filter(&mut node, 0, "com.acme.*".into()).unwrap();
        engine.set_count_filter(&mut node, 1, 1).unwrap();
        let mut state = HandlerState::default();
        let key = state.insert(node);

        assert_eq!(engine.passes_unload_filter(&mut state, key, "org.other.Thing"), (false, false));
        assert_eq!(engine.passes_unload_filter(&mut state, key, "com.acme.Widget"), (true, true));
    }

    #[test]
    fn test_filters_keep_objects_alive_until_cleared() {
        let (vm, engine) = setup();
        let instance = vm.new_object("Ljava/lang/Object;");
        let mut node = HandlerNode::new(EventKind::Breakpoint, SuspendPolicy::None, 1);
        engine.set_instance_only_filter(&mut node, 0, Some(instance)).unwrap();
        assert!(!vm.collect(instance));

        let mut state = HandlerState::default();
        engine.clear_filters(&mut state, &mut node).unwrap();
        assert!(vm.collect(instance));
    }
}
