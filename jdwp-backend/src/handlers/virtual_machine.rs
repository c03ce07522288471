// VirtualMachine command set

use super::{HandlerResult, In, Out, Reply};
use crate::commands::vm_commands;
use crate::engine::Engine;
use crate::protocol::ErrorCode;
use tracing::info;

/// Every id the back end hands out is 8 bytes wide.
const ID_SIZE: i32 = 8;

pub(super) fn handle(engine: &Engine, command: u8, input: In<'_, '_>, out: Out<'_, '_>) -> HandlerResult {
    match command {
        vm_commands::ALL_THREADS => all_threads(engine, out),
        vm_commands::DISPOSE => {
            info!("debugger disposed the connection");
            Ok(Reply::Now)
        }
        vm_commands::ID_SIZES => {
            // field, method, object, reference type, frame
            for _ in 0..5 {
                out.write_i32(ID_SIZE);
            }
            Ok(Reply::Now)
        }
        vm_commands::SUSPEND => {
            engine.suspend_all()?;
            Ok(Reply::Now)
        }
        vm_commands::RESUME => {
            engine.resume_all()?;
            Ok(Reply::Now)
        }
        vm_commands::DISPOSE_OBJECTS => dispose_objects(engine, input),
        vm_commands::HOLD_EVENTS => {
            engine.hold_events();
            Ok(Reply::Now)
        }
        vm_commands::RELEASE_EVENTS => {
            engine.release_events();
            Ok(Reply::Now)
        }
        _ => Err(ErrorCode::NotImplemented),
    }
}

fn all_threads(engine: &Engine, out: Out<'_, '_>) -> HandlerResult {
    let threads: Vec<_> = engine
        .runtime()
        .all_threads()
        .into_iter()
        .filter(|t| !engine.is_debug_thread(*t))
        .collect();
    out.write_i32(threads.len() as i32);
    for thread in threads {
        out.write_object_ref(Some(thread));
    }
    Ok(Reply::Now)
}

fn dispose_objects(engine: &Engine, input: In<'_, '_>) -> HandlerResult {
    let count = input.read_i32()?;
    for _ in 0..count {
        let id = input.read_object_id()?;
        let refs = input.read_i32()?;
        engine.refs().release(id, refs);
    }
    Ok(Reply::Now)
}
