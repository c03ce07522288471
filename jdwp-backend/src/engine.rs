// Engine context
//
// One value owns every table of the back end. Components add their operations
// as `impl Engine` blocks in their own modules; this file holds the shared
// state, the lock chain and the session lifecycle.

use crate::event_handler::HandlerState;
use crate::event_helper::{CommandQueue, EventHelper};
use crate::invoker::InvokeTable;
use crate::packet::Packet;
use crate::protocol::JdwpResult;
use crate::reftable::{RefStore, RefTable};
use crate::runtime::Runtime;
use crate::step_control::StepTable;
use crate::thread_control::ThreadRegistry;
use crate::types::*;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default event queue capacity in bytes.
pub const DEFAULT_QUEUE_BYTES: usize = 50 * 1024;

/// The reference table is compacted after this many events.
pub const DEFAULT_COMPACTION_INTERVAL: u32 = 500;

/// Knobs of the engine itself; the agent derives them from its options string.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Report VM init with suspend policy ALL.
    pub suspend_on_init: bool,
    /// Wait for another debugger after a session ends.
    pub server: bool,
    pub max_queue_bytes: usize,
    pub compaction_interval: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            suspend_on_init: true,
            server: false,
            max_queue_bytes: DEFAULT_QUEUE_BYTES,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
        }
    }
}

/// Where outbound packets go. Implemented by the transport.
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, packet: Packet) -> JdwpResult<()>;
}

/// Every engine lock, acquired outer to inner.
///
/// Fields are declared innermost first so that dropping the set releases the
/// locks in reverse acquisition order.
pub(crate) struct LockSet<'a> {
    pub threads: MutexGuard<'a, ThreadRegistry>,
    pub refs: MutexGuard<'a, RefStore>,
    pub steps: MutexGuard<'a, StepTable>,
    pub queue: MutexGuard<'a, CommandQueue>,
    pub invokes: MutexGuard<'a, InvokeTable>,
    pub handlers: MutexGuard<'a, HandlerState>,
}

pub struct Engine {
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) config: EngineConfig,
    // Lock order: handlers -> invokes -> helper queue -> steps -> refs -> threads
    pub(crate) handlers: Mutex<HandlerState>,
    pub(crate) invokes: Mutex<InvokeTable>,
    pub(crate) helper: EventHelper,
    pub(crate) steps: Mutex<StepTable>,
    pub(crate) refs: RefTable,
    pub(crate) threads: Mutex<ThreadRegistry>,
    pub(crate) threads_cv: Condvar,
    sink: Mutex<Option<Arc<dyn PacketSink>>>,
    init_complete: Mutex<bool>,
    init_cv: Condvar,
    session: AtomicU32,
    pub(crate) vm_dead: AtomicBool,
    next_packet_id: AtomicU32,
    pub(crate) event_count: AtomicU32,
    pub(crate) pending_unloads: AtomicU32,
}

impl Engine {
    pub fn new(runtime: Arc<dyn Runtime>, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            refs: RefTable::new(runtime.clone()),
            helper: EventHelper::new(config.max_queue_bytes),
            runtime,
            config,
            handlers: Mutex::new(HandlerState::default()),
            invokes: Mutex::new(InvokeTable::default()),
            steps: Mutex::new(StepTable::default()),
            threads: Mutex::new(ThreadRegistry::default()),
            threads_cv: Condvar::new(),
            sink: Mutex::new(None),
            init_complete: Mutex::new(false),
            init_cv: Condvar::new(),
            session: AtomicU32::new(0),
            vm_dead: AtomicBool::new(false),
            next_packet_id: AtomicU32::new(1),
            event_count: AtomicU32::new(0),
            pending_unloads: AtomicU32::new(0),
        })
    }

    pub fn runtime(&self) -> &dyn Runtime {
        &*self.runtime
    }

    pub fn refs(&self) -> &RefTable {
        &self.refs
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> SessionId {
        SessionId(self.session.load(Ordering::SeqCst))
    }

    pub fn is_vm_dead(&self) -> bool {
        self.vm_dead.load(Ordering::SeqCst)
    }

    /// Enable the events the engine always needs and start the helper thread.
    pub fn start(self: &Arc<Self>) -> JdwpResult<()> {
        for kind in [
            EventKind::ThreadStart,
            EventKind::ThreadEnd,
            EventKind::ClassPrepare,
            EventKind::ClassUnload,
            EventKind::VmDeath,
        ] {
            self.runtime.set_event_mode(true, kind, None)?;
        }
        self.handlers
            .lock()
            .class_track
            .reset(self.runtime.loaded_class_signatures());
        self.start_event_helper()?;
        info!("JDWP back end started");
        Ok(())
    }

    /// A debugger has connected; events may flow to `sink` from now on.
    pub fn on_connect(&self, sink: Arc<dyn PacketSink>) {
        *self.sink.lock() = Some(sink);
        self.install_app_resume_tracking();
        info!(session = self.session().0, "debugger connected");
    }

    /// Report VM initialization to the debugger and open the event gate.
    pub fn report_vm_init(&self, thread: ThreadRef) {
        let policy = if self.config.suspend_on_init {
            SuspendPolicy::All
        } else {
            SuspendPolicy::None
        };
        self.helper_report_vm_init(self.session(), thread, policy);
        self.signal_init_complete();
    }

    pub fn signal_init_complete(&self) {
        let mut done = self.init_complete.lock();
        *done = true;
        self.init_cv.notify_all();
    }

    pub fn is_init_complete(&self) -> bool {
        *self.init_complete.lock()
    }

    /// Block until initialization completes or the timeout elapses.
    pub fn wait_init_complete(&self, timeout: Duration) -> bool {
        let mut done = self.init_complete.lock();
        if !*done {
            self.init_cv.wait_for(&mut done, timeout);
        }
        *done
    }

    /// End the current debugger session.
    ///
    /// Outstanding invokes are abandoned, every handler is freed, debugger
    /// suspends are undone and all exported ids are forgotten. With `relisten`
    /// the engine stays open for the next session.
    pub fn reset(&self, relisten: bool) {
        let session = SessionId(self.session.fetch_add(1, Ordering::SeqCst)).next();
        *self.init_complete.lock() = false;
        info!(session = session.0, "resetting debugger session");

        self.reset_event_handlers(session);
        *self.sink.lock() = None;
        self.reset_invokes();
        self.reset_steps();
        self.reset_threads();
        self.refs.reset();
        self.handlers
            .lock()
            .class_track
            .reset(self.runtime.loaded_class_signatures());

        if relisten {
            self.signal_init_complete();
        }
    }

    /// Stop the helper thread. Called once, when the debuggee goes away.
    pub fn shutdown(&self) {
        self.vm_dead.store(true, Ordering::SeqCst);
        self.shutdown_event_helper();
        info!("JDWP back end shut down");
    }

    pub(crate) fn next_packet_id(&self) -> u32 {
        self.next_packet_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Hand a packet to the transport. Without a debugger the packet is dropped.
    pub(crate) fn send_packet(&self, packet: Packet) {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                if let Err(e) = sink.send_packet(packet) {
                    warn!("Failed to send packet: {}", e);
                }
            }
            None => debug!(id = packet.id, "no debugger attached, dropping packet"),
        }
    }

    /// Take every engine lock in order.
    pub(crate) fn lock_all(&self) -> LockSet<'_> {
        let handlers = self.handlers.lock();
        let invokes = self.invokes.lock();
        let queue = self.helper.lock_queue();
        let steps = self.steps.lock();
        let refs = self.refs.lock();
        let threads = self.threads.lock();
        LockSet {
            threads,
            refs,
            steps,
            queue,
            invokes,
            handlers,
        }
    }
}
