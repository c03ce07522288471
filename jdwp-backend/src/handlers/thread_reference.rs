// ThreadReference command set

use super::{HandlerResult, In, Out, Reply};
use crate::commands::thread_commands;
use crate::engine::Engine;
use crate::protocol::ErrorCode;

pub(super) fn handle(engine: &Engine, command: u8, input: In<'_, '_>, out: Out<'_, '_>) -> HandlerResult {
    let thread = input.read_thread_ref()?;
    match command {
        thread_commands::SUSPEND => engine.suspend_thread(thread, false)?,
        thread_commands::RESUME => engine.resume_thread(thread, true)?,
        thread_commands::STATUS => {
            let (status, suspended) = engine.application_thread_status(thread)?;
            out.write_i32(status as i32);
            out.write_i32(suspended as i32);
        }
        thread_commands::STOP => {
            let throwable = input.read_object_ref()?.ok_or(ErrorCode::InvalidObject)?;
            engine.stop_thread(thread, throwable)?;
        }
        thread_commands::INTERRUPT => engine.interrupt_thread(thread)?,
        thread_commands::SUSPEND_COUNT => out.write_i32(engine.suspend_count(thread)),
        _ => return Err(ErrorCode::NotImplemented),
    }
    Ok(Reply::Now)
}
