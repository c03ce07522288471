// Command handlers
//
// Each handler decodes its arguments, calls into the engine and writes the
// reply body. Failures become the reply's error code. Invocations reply later,
// from the event helper, so they suppress the immediate reply.

mod class_type;
mod event_request;
mod object_reference;
mod thread_reference;
mod virtual_machine;

use crate::commands::command_sets;
use crate::engine::Engine;
use crate::instream::PacketInputStream;
use crate::outstream::PacketOutputStream;
use crate::packet::{Packet, PacketKind};
use crate::protocol::ErrorCode;
use crate::runtime::InvokeCall;
use crate::types::*;
use tracing::debug;

/// When the reply to a command goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Now,
    /// Sent asynchronously once the work completes.
    Later,
}

pub type HandlerResult = Result<Reply, ErrorCode>;

type In<'a, 'b> = &'a mut PacketInputStream<'b>;
type Out<'a, 'b> = &'a mut PacketOutputStream<'b>;

/// Run one command packet. Returns the reply to send now, if any.
pub fn dispatch(engine: &Engine, packet: &Packet) -> Option<Packet> {
    let PacketKind::Command {
        command_set,
        command,
    } = packet.kind
    else {
        debug!(id = packet.id, "ignoring reply packet from debugger");
        return None;
    };
    let mut input = PacketInputStream::new(engine.refs(), packet);
    let mut out = PacketOutputStream::reply(engine.refs(), packet.id);

    let result = if engine.is_vm_dead() && !allowed_after_death(command_set, command) {
        Err(ErrorCode::VmDead)
    } else {
        match command_set {
            command_sets::VIRTUAL_MACHINE => virtual_machine::handle(engine, command, &mut input, &mut out),
            command_sets::THREAD_REFERENCE => thread_reference::handle(engine, command, &mut input, &mut out),
            command_sets::OBJECT_REFERENCE => object_reference::handle(engine, command, &mut input, &mut out),
            command_sets::CLASS_TYPE => class_type::handle(engine, command, &mut input, &mut out),
            command_sets::EVENT_REQUEST => event_request::handle(engine, command, &mut input, &mut out),
            _ => Err(ErrorCode::NotImplemented),
        }
    };

    match result {
        Ok(Reply::Later) => None,
        Ok(Reply::Now) => Some(out.into_packet()),
        Err(code) => {
            debug!(id = packet.id, command_set, command, "command failed: {}", code);
            out.set_error(code);
            Some(out.into_packet())
        }
    }
}

/// Whether the command ends the session once answered.
pub fn is_last_command(packet: &Packet) -> bool {
    matches!(
        packet.kind,
        PacketKind::Command {
            command_set: command_sets::VIRTUAL_MACHINE,
            command: crate::commands::vm_commands::DISPOSE,
        }
    )
}

fn allowed_after_death(command_set: u8, command: u8) -> bool {
    use crate::commands::vm_commands;
    command_set == command_sets::VIRTUAL_MACHINE
        && matches!(command, vm_commands::DISPOSE | vm_commands::ID_SIZES)
}

fn read_arguments(input: In<'_, '_>) -> Result<Vec<Value>, ErrorCode> {
    let count = input.read_i32()?;
    if count < 0 {
        return Err(ErrorCode::IllegalArgument);
    }
    (0..count).map(|_| input.read_value()).collect()
}

/// Decode the shared tail of the invoke commands and queue the call.
fn invoke(
    engine: &Engine,
    input: In<'_, '_>,
    kind: InvokeKind,
    class: ClassRef,
    instance: Option<ObjectRef>,
    thread: ThreadRef,
) -> HandlerResult {
    let method = input.read_method_id()?;
    let args = read_arguments(input)?;
    let options = input.read_i32()?;
    let call = InvokeCall {
        kind,
        class,
        method,
        instance,
        args,
        nonvirtual: options & crate::commands::invoke_options::NONVIRTUAL != 0,
    };
    engine.request_invoke(options, input.id(), thread, call)?;
    Ok(Reply::Later)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::*;
    use crate::engine::EngineConfig;
    use crate::sim::SimulatedVm;
    use bytes::{BufMut, Bytes};
    use std::sync::Arc;

    pub(super) fn setup() -> (Arc<SimulatedVm>, Arc<Engine>) {
        let vm = Arc::new(SimulatedVm::new());
        let engine = Engine::new(vm.clone(), EngineConfig::default());
        (vm, engine)
    }

    pub(super) fn command(set: u8, cmd: u8, body: Vec<u8>) -> Packet {
        let mut packet = Packet::command(77, set, cmd);
        if !body.is_empty() {
            packet.segments.push(Bytes::from(body));
        }
        packet
    }

    #[test]
    fn test_unknown_command_is_not_implemented() {
        let (_vm, engine) = setup();
        let reply = dispatch(&engine, &command(42, 1, Vec::new())).unwrap();
        assert_eq!(reply.id, 77);
        assert_eq!(reply.error_code(), Some(ErrorCode::NotImplemented.code()));
        assert_eq!(reply.data_len(), 0);
    }

    #[test]
    fn test_truncated_arguments_fail_cleanly() {
        let (_vm, engine) = setup();
        let mut body = Vec::new();
        body.put_u16(1);
        let reply = dispatch(&engine, &command(command_sets::THREAD_REFERENCE, thread_commands::SUSPEND, body)).unwrap();
        assert_ne!(reply.error_code(), Some(0));
    }

    #[test]
    fn test_dead_vm_rejects_commands() {
        let (_vm, engine) = setup();
        engine.vm_dead.store(true, std::sync::atomic::Ordering::SeqCst);
        let reply = dispatch(&engine, &command(command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND, Vec::new())).unwrap();
        assert_eq!(reply.error_code(), Some(ErrorCode::VmDead.code()));
        let reply = dispatch(&engine, &command(command_sets::VIRTUAL_MACHINE, vm_commands::ID_SIZES, Vec::new())).unwrap();
        assert_eq!(reply.error_code(), Some(0));
    }

    #[test]
    fn test_dispose_is_last_command() {
        assert!(is_last_command(&command(command_sets::VIRTUAL_MACHINE, vm_commands::DISPOSE, Vec::new())));
        assert!(!is_last_command(&command(command_sets::VIRTUAL_MACHINE, vm_commands::SUSPEND, Vec::new())));
    }
}
