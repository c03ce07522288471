// ClassType command set

use super::{invoke, HandlerResult, In, Out};
use crate::commands::class_type_commands;
use crate::engine::Engine;
use crate::protocol::ErrorCode;
use crate::types::InvokeKind;

pub(super) fn handle(engine: &Engine, command: u8, input: In<'_, '_>, _out: Out<'_, '_>) -> HandlerResult {
    let kind = match command {
        class_type_commands::INVOKE_METHOD => InvokeKind::Static,
        class_type_commands::NEW_INSTANCE => InvokeKind::Constructor,
        _ => return Err(ErrorCode::NotImplemented),
    };
    let class = input.read_class_ref()?;
    let thread = input.read_thread_ref()?;
    invoke(engine, input, kind, class, None, thread)
}

#[cfg(test)]
mod tests {
    use super::super::dispatch;
    use super::super::tests::{command, setup};
    use crate::commands::{class_type_commands, command_sets};
    use crate::protocol::ErrorCode;
    use bytes::BufMut;

    #[test]
    fn test_invoke_on_running_thread_is_rejected() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("main");
        let location = vm.define_method("LMath;", "max", &[(0, 1)]);

        let mut body = Vec::new();
        body.put_u64(engine.refs().ref_to_id(location.class));
        body.put_u64(engine.refs().ref_to_id(t));
        body.put_u64(location.method);
        body.put_i32(2);
        body.put_u8(b'I');
        body.put_i32(3);
        body.put_u8(b'I');
        body.put_i32(4);
        body.put_i32(0);
        let reply = dispatch(&engine, &command(command_sets::CLASS_TYPE, class_type_commands::INVOKE_METHOD, body)).unwrap();
        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidThread.code()));
    }
}
