// ObjectReference command set

use super::{invoke, HandlerResult, In, Out, Reply};
use crate::commands::object_reference_commands;
use crate::engine::Engine;
use crate::protocol::ErrorCode;
use crate::types::InvokeKind;

pub(super) fn handle(engine: &Engine, command: u8, input: In<'_, '_>, out: Out<'_, '_>) -> HandlerResult {
    match command {
        object_reference_commands::INVOKE_METHOD => {
            let object = input.read_object_ref()?.ok_or(ErrorCode::InvalidObject)?;
            let thread = input.read_thread_ref()?;
            let class = input.read_class_ref()?;
            invoke(engine, input, InvokeKind::Instance, class, Some(object), thread)
        }
        object_reference_commands::DISABLE_COLLECTION => {
            let id = input.read_object_id()?;
            engine.refs().pin(id)?;
            Ok(Reply::Now)
        }
        object_reference_commands::ENABLE_COLLECTION => {
            let id = input.read_object_id()?;
            engine.refs().unpin(id)?;
            Ok(Reply::Now)
        }
        object_reference_commands::IS_COLLECTED => {
            let id = input.read_object_id()?;
            out.write_bool(engine.refs().is_collected(id)?);
            Ok(Reply::Now)
        }
        _ => Err(ErrorCode::NotImplemented),
    }
}

#[cfg(test)]
mod tests {
    use super::super::dispatch;
    use super::super::tests::{command, setup};
    use crate::commands::{command_sets, object_reference_commands};
    use crate::instream::PacketInputStream;
    use crate::protocol::ErrorCode;
    use bytes::BufMut;

    fn id_body(id: u64) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u64(id);
        body
    }

    #[test]
    fn test_disable_collection_pins() {
        let (vm, engine) = setup();
        let obj = vm.new_object("Ljava/lang/Object;");
        let id = engine.refs().ref_to_id(obj);

        dispatch(&engine, &command(command_sets::OBJECT_REFERENCE, object_reference_commands::DISABLE_COLLECTION, id_body(id))).unwrap();
        assert!(!vm.collect(obj));

        dispatch(&engine, &command(command_sets::OBJECT_REFERENCE, object_reference_commands::ENABLE_COLLECTION, id_body(id))).unwrap();
        assert!(vm.collect(obj));

        let reply = dispatch(&engine, &command(command_sets::OBJECT_REFERENCE, object_reference_commands::IS_COLLECTED, id_body(id))).unwrap();
        let mut input = PacketInputStream::new(engine.refs(), &reply);
        assert_eq!(input.read_bool(), Ok(true));

        let reply = dispatch(&engine, &command(command_sets::OBJECT_REFERENCE, object_reference_commands::ENABLE_COLLECTION, id_body(999))).unwrap();
        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidObject.code()));
    }

    #[test]
    fn test_is_collected_on_live_object() {
        let (vm, engine) = setup();
        let obj = vm.new_object("Ljava/lang/Object;");
        let id = engine.refs().ref_to_id(obj);
        let reply = dispatch(&engine, &command(command_sets::OBJECT_REFERENCE, object_reference_commands::IS_COLLECTED, id_body(id))).unwrap();
        let mut input = PacketInputStream::new(engine.refs(), &reply);
        assert_eq!(input.read_bool(), Ok(false));
    }

    #[test]
    fn test_invoke_replies_later() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("main");
        let obj = vm.new_object("LWidget;");
        let location = vm.define_method("LWidget;", "size", &[(0, 1)]);
        engine.suspend_thread(t, false).unwrap();
        engine.enable_invoke_requests(t);

        let mut body = Vec::new();
        body.put_u64(engine.refs().ref_to_id(obj));
        body.put_u64(engine.refs().ref_to_id(t));
        body.put_u64(engine.refs().ref_to_id(location.class));
        body.put_u64(location.method);
        body.put_i32(0);
        body.put_i32(crate::commands::invoke_options::SINGLE_THREADED);
        let reply = dispatch(&engine, &command(command_sets::OBJECT_REFERENCE, object_reference_commands::INVOKE_METHOD, body));
        assert!(reply.is_none());
        assert!(engine.is_invoke_pending(t));
    }
}
