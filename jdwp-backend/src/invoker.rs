// Method invocation
//
// The debugger asks a suspended thread to run a method. The request is parked
// here, the thread is resumed, and the thread itself performs the call when it
// returns from reporting its event. The helper thread then re-suspends it and
// sends the reply.

use crate::commands::invoke_options;
use crate::engine::Engine;
use crate::outstream::PacketOutputStream;
use crate::protocol::ErrorCode;
use crate::runtime::{InvokeCall, InvokeOutcome};
use crate::types::*;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    /// The thread sits where it can invoke (stopped at a reported event).
    pub available: bool,
    pub pending: bool,
    pub started: bool,
    /// The debugger that asked is gone; the result is dropped.
    pub detached: bool,
    /// Id of the command packet to reply to.
    pub id: u32,
    pub options: i32,
    call: Option<InvokeCall>,
    outcome: Option<Result<InvokeOutcome, ErrorCode>>,
}

impl InvokeRequest {
    fn single_threaded(&self) -> bool {
        self.options & invoke_options::SINGLE_THREADED != 0
    }
}

#[derive(Debug, Default)]
pub struct InvokeTable {
    requests: HashMap<ThreadRef, InvokeRequest>,
}

impl InvokeTable {
    pub fn get(&self, thread: ThreadRef) -> Option<&InvokeRequest> {
        self.requests.get(&thread)
    }

    pub(crate) fn remove(&mut self, thread: ThreadRef) -> Option<InvokeRequest> {
        self.requests.remove(&thread)
    }
}

/// Objects an invocation keeps alive until it completes.
fn call_roots(call: &InvokeCall) -> Vec<ObjectRef> {
    std::iter::once(call.class)
        .chain(call.instance)
        .chain(call.args.iter().filter_map(Value::as_object))
        .collect()
}

impl Engine {
    /// Queue an invocation on `thread` and let it run.
    pub fn request_invoke(&self, options: i32, id: u32, thread: ThreadRef, call: InvokeCall) -> Result<(), ErrorCode> {
        {
            let mut invokes = self.invokes.lock();
            // Only threads that stopped for an event have an entry.
            let Some(request) = invokes.requests.get_mut(&thread) else {
                return Err(ErrorCode::InvalidThread);
            };
            if request.pending {
                return Err(ErrorCode::AlreadyInvoking);
            }
            if !request.available {
                return Err(ErrorCode::InvalidThread);
            }

            let roots = call_roots(&call);
            for (n, obj) in roots.iter().enumerate() {
                if let Err(e) = self.runtime.add_gc_root(*obj) {
                    for taken in &roots[..n] {
                        self.runtime.remove_gc_root(*taken);
                    }
                    return Err(e);
                }
            }

            request.options = options;
            request.id = id;
            request.detached = false;
            request.started = false;
            request.call = Some(call);
            request.outcome = None;
            request.pending = true;
            request.available = false;
        }
        debug!(%thread, id, options, "invoke requested");

        let resumed = if options & invoke_options::SINGLE_THREADED != 0 {
            self.resume_thread(thread, true)
        } else {
            self.resume_all()
        };
        if let Err(e) = resumed {
            warn!(%thread, "resume for invoke failed: {}", e);
        }
        Ok(())
    }

    /// The thread reported an event and is stopping: invokes may be
    /// requested on it from now on.
    pub(crate) fn enable_invoke_requests(&self, thread: ThreadRef) {
        self.invokes.lock().requests.entry(thread).or_default().available = true;
    }

    /// Run the pending invocation of `thread`, on `thread`. Returns whether
    /// one was run.
    pub(crate) fn do_invoke(&self, thread: ThreadRef) -> bool {
        let call = {
            let mut invokes = self.invokes.lock();
            let Some(request) = invokes.requests.get_mut(&thread) else {
                return false;
            };
            request.available = false;
            if !request.pending || request.started {
                return false;
            }
            request.started = true;
            request.call.clone()
        };
        let Some(call) = call else {
            return false;
        };

        let outcome = self.runtime.invoke_method(thread, &call);
        if let Err(e) = &outcome {
            warn!(%thread, "invocation failed: {}", e);
        }
        if let Some(request) = self.invokes.lock().requests.get_mut(&thread) {
            request.outcome = Some(outcome);
        }
        true
    }

    /// Re-suspend the invoking thread and reply to the debugger.
    pub(crate) fn complete_invoke_request(&self, thread: ThreadRef) {
        let reply = {
            let mut locks = self.pre_suspend();
            let Some(request) = locks.invokes.requests.get_mut(&thread) else {
                return;
            };
            crate::invariant!(request.pending && request.started, "completing an invoke that never ran");
            request.pending = false;
            request.started = false;
            request.available = true;

            let call = request.call.take();
            let outcome = request.outcome.take();
            if let Some(call) = &call {
                for obj in call_roots(call) {
                    self.runtime.remove_gc_root(obj);
                }
            }

            if request.detached {
                None
            } else {
                let id = request.id;
                let suspended = if request.single_threaded() {
                    self.suspend_thread_locked(&mut locks.threads, thread, false)
                } else {
                    self.suspend_all_locked(&mut locks.threads)
                };
                if let Err(e) = suspended {
                    warn!(%thread, "suspend after invoke failed: {}", e);
                }
                Some((id, call.map(|c| c.kind), outcome))
            }
        };

        // Locks are released before the reply goes out.
        let Some((id, kind, outcome)) = reply else {
            debug!(%thread, "invoke completed for a detached debugger");
            return;
        };
        let mut out = PacketOutputStream::reply(&self.refs, id);
        match outcome {
            Some(Ok(outcome)) => {
                let value = match kind {
                    // The new object, not the constructor's void.
                    Some(InvokeKind::Constructor) => {
                        let object = outcome.value.as_object();
                        let tag = object.map_or(TypeTag::Object, |o| self.runtime.object_tag(o));
                        Value::object(tag, object)
                    }
                    _ => outcome.value,
                };
                out.write_value(&value);
                let tag = outcome
                    .exception
                    .map_or(TypeTag::Object, |e| self.runtime.object_tag(e));
                out.write_tagged_object(tag, outcome.exception);
            }
            Some(Err(e)) => out.set_error(e),
            None => out.set_error(ErrorCode::Internal),
        }
        debug!(%thread, id, "invoke completed");
        self.send_packet(out.into_packet());
    }

    pub fn is_invoke_pending(&self, thread: ThreadRef) -> bool {
        self.invokes.lock().get(thread).is_some_and(|r| r.pending)
    }

    /// Abandon the pending invoke of one thread.
    pub fn detach_invoke(&self, thread: ThreadRef) {
        if let Some(request) = self.invokes.lock().requests.get_mut(&thread) {
            request.detached = true;
        }
    }

    /// Abandon every pending invoke; they still run but nobody hears back.
    pub(crate) fn detach_invokes(&self) {
        let mut invokes = self.invokes.lock();
        for request in invokes.requests.values_mut().filter(|r| r.pending) {
            request.detached = true;
        }
    }

    /// Forget idle requests. Ones still running finish detached.
    pub(crate) fn reset_invokes(&self) {
        self.invokes.lock().requests.retain(|_, r| r.pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::instream::PacketInputStream;
    use crate::sim::{RecordingSink, SimulatedVm};
    use std::sync::Arc;

    fn setup() -> (Arc<SimulatedVm>, Arc<Engine>, Arc<RecordingSink>) {
        let vm = Arc::new(SimulatedVm::new());
        let engine = Engine::new(vm.clone(), EngineConfig::default());
        let sink = Arc::new(RecordingSink::default());
        engine.on_connect(sink.clone());
        (vm, engine, sink)
    }

    fn static_call(vm: &SimulatedVm) -> InvokeCall {
        let location = vm.define_method("LMath;", "answer", &[(0, 1)]);
        InvokeCall {
            kind: InvokeKind::Static,
            class: location.class,
            method: location.method,
            instance: None,
            args: vec![Value::int(6), Value::int(7)],
            nonvirtual: false,
        }
    }

    #[test]
    fn test_invoke_needs_available_thread() {
        let (vm, engine, _sink) = setup();
        let t = vm.spawn_started_thread("t");
        let call = static_call(&vm);
        assert_eq!(
            engine.request_invoke(0, 1, t, call),
            Err(ErrorCode::InvalidThread)
        );
        assert!(engine.invokes.lock().get(t).is_none());
    }

    #[test]
    fn test_second_invoke_is_rejected() {
        let (vm, engine, _sink) = setup();
        let t = vm.spawn_started_thread("t");
        engine.suspend_thread(t, false).unwrap();
        engine.enable_invoke_requests(t);
        let call = static_call(&vm);

        engine
            .request_invoke(invoke_options::SINGLE_THREADED, 11, t, call.clone())
            .unwrap();
        let mut other = call.clone();
        other.args.clear();
        assert_eq!(
            engine.request_invoke(invoke_options::SINGLE_THREADED, 12, t, other),
            Err(ErrorCode::AlreadyInvoking)
        );

        let invokes = engine.invokes.lock();
        let request = invokes.get(t).unwrap();
        assert_eq!(request.id, 11);
        assert_eq!(request.call.as_ref(), Some(&call));
    }

    #[test]
    fn test_invoke_round_trip() {
        let (vm, engine, sink) = setup();
        let t = vm.spawn_started_thread("t");
        vm.set_invoke_outcome(InvokeOutcome {
            value: Value::int(42),
            exception: None,
        });
        engine.suspend_thread(t, false).unwrap();
        engine.enable_invoke_requests(t);

        engine
            .request_invoke(invoke_options::SINGLE_THREADED, 21, t, static_call(&vm))
            .unwrap();
        assert_eq!(engine.suspend_count(t), 0);
        assert!(!vm.is_suspended(t));

        assert!(engine.do_invoke(t));
        assert!(!engine.do_invoke(t));
        engine.complete_invoke_request(t);

        assert_eq!(engine.suspend_count(t), 1);
        assert!(vm.is_suspended(t));
        assert!(!engine.is_invoke_pending(t));
        assert_eq!(vm.invocations().len(), 1);

        let packets = sink.packets();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].id, 21);
        assert_eq!(packets[0].error_code(), Some(0));
        let mut input = PacketInputStream::new(engine.refs(), &packets[0]);
        assert_eq!(input.read_value(), Ok(Value::int(42)));
        assert_eq!(input.read_u8(), Ok(TypeTag::Object as u8));
        assert_eq!(input.read_object_ref(), Ok(None));
    }

    #[test]
    fn test_invoke_all_threads_resumes_everyone() {
        let (vm, engine, _sink) = setup();
        let t = vm.spawn_started_thread("t");
        let other = vm.spawn_started_thread("other");
        engine.suspend_all().unwrap();
        engine.enable_invoke_requests(t);

        engine.request_invoke(0, 5, t, static_call(&vm)).unwrap();
        assert!(!vm.is_suspended(other));
        assert!(engine.do_invoke(t));
        engine.complete_invoke_request(t);
        assert!(vm.is_suspended(other));
        assert_eq!(engine.suspend_count(other), 1);
    }

    #[test]
    fn test_detached_invoke_sends_nothing() {
        let (vm, engine, sink) = setup();
        let t = vm.spawn_started_thread("t");
        engine.suspend_thread(t, false).unwrap();
        engine.enable_invoke_requests(t);
        engine
            .request_invoke(invoke_options::SINGLE_THREADED, 3, t, static_call(&vm))
            .unwrap();

        engine.detach_invokes();
        assert!(engine.do_invoke(t));
        engine.complete_invoke_request(t);
        assert!(sink.packets().is_empty());
        assert_eq!(engine.suspend_count(t), 0);
    }
}
