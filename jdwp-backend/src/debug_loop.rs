// Command loop
//
// Takes command packets off the transport one at a time, runs their handlers
// and sends the replies. Runs on its own OS thread because handlers may block
// (suspend-all waits for resuming threads, invokes wait for the event helper).

use crate::engine::Engine;
use crate::handlers;
use crate::packet::Packet;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub const COMMAND_LOOP_THREAD: &str = "jdwp-command-loop";

/// Why a debugger session's command loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The debugger sent VirtualMachine.Dispose.
    Disposed,
    /// The transport closed underneath us.
    ConnectionLost,
}

/// Serve commands until the debugger disposes or the connection drops.
pub fn run(engine: &Engine, mut inbound: mpsc::Receiver<Packet>) -> SessionEnd {
    let me = engine.runtime().attach_current_thread(COMMAND_LOOP_THREAD);
    if let Some(thread) = me {
        engine.add_debug_thread(thread);
    }
    info!("command loop started");

    let end = loop {
        let Some(packet) = inbound.blocking_recv() else {
            break SessionEnd::ConnectionLost;
        };
        let last = handlers::is_last_command(&packet);
        debug!(id = packet.id, "processing command");
        if let Some(reply) = handlers::dispatch(engine, &packet) {
            engine.send_packet(reply);
        }
        if last {
            break SessionEnd::Disposed;
        }
    };

    if let Some(thread) = me {
        engine.remove_debug_thread(thread);
    }
    info!(?end, "command loop finished");
    end
}

/// Start the command loop on a dedicated thread.
pub fn spawn(engine: Arc<Engine>, inbound: mpsc::Receiver<Packet>) -> std::io::Result<JoinHandle<SessionEnd>> {
    std::thread::Builder::new()
        .name(COMMAND_LOOP_THREAD.to_string())
        .spawn(move || run(&engine, inbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{command_sets, vm_commands};
    use crate::engine::EngineConfig;
    use crate::sim::{RecordingSink, SimulatedVm};
    use std::time::Duration;

    #[test]
    fn test_replies_until_dispose() {
        let vm = Arc::new(SimulatedVm::new());
        let engine = Engine::new(vm, EngineConfig::default());
        let sink = Arc::new(RecordingSink::default());
        engine.on_connect(sink.clone());

        let (tx, rx) = mpsc::channel(8);
        let handle = spawn(engine.clone(), rx).unwrap();
        tx.blocking_send(Packet::command(1, command_sets::VIRTUAL_MACHINE, vm_commands::ID_SIZES))
            .unwrap();
        tx.blocking_send(Packet::command(2, command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE))
            .unwrap();

        assert_eq!(handle.join().unwrap(), SessionEnd::Disposed);
        assert!(sink.wait_for_packets(2, Duration::from_secs(5)));
        let ids: Vec<u32> = sink.packets().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_closed_channel_ends_session() {
        let vm = Arc::new(SimulatedVm::new());
        let engine = Engine::new(vm, EngineConfig::default());
        let (tx, rx) = mpsc::channel::<Packet>(1);
        drop(tx);
        assert_eq!(run(&engine, rx), SessionEnd::ConnectionLost);
        assert_eq!(engine.handler_count(crate::types::EventKind::Breakpoint), 0);
    }
}
