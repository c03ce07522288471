// EventRequest command set

use super::{HandlerResult, In, Out, Reply};
use crate::commands::{event_commands, modifier_kinds};
use crate::engine::Engine;
use crate::event_handler::HandlerNode;
use crate::protocol::ErrorCode;
use crate::types::*;
use tracing::debug;

pub(super) fn handle(engine: &Engine, command: u8, input: In<'_, '_>, out: Out<'_, '_>) -> HandlerResult {
    match command {
        event_commands::SET => set(engine, input, out),
        event_commands::CLEAR => {
            let kind = read_event_kind(input)?;
            let request_id = input.read_i32()?;
            engine.free_by_id(kind, request_id)?;
            Ok(Reply::Now)
        }
        event_commands::CLEAR_ALL_BREAKPOINTS => {
            engine.free_all(EventKind::Breakpoint)?;
            Ok(Reply::Now)
        }
        _ => Err(ErrorCode::NotImplemented),
    }
}

fn read_event_kind(input: In<'_, '_>) -> Result<EventKind, ErrorCode> {
    EventKind::from_u8(input.read_u8()?).ok_or(ErrorCode::InvalidEventType)
}

fn set(engine: &Engine, input: In<'_, '_>, out: Out<'_, '_>) -> HandlerResult {
    let kind = read_event_kind(input)?;
    let policy = SuspendPolicy::from_u8(input.read_u8()?).ok_or(ErrorCode::IllegalArgument)?;
    let count = input.read_i32()?;
    let count = usize::try_from(count).map_err(|_| ErrorCode::IllegalArgument)?;
    // Every modifier takes at least its kind byte.
    if count > input.remaining() {
        return Err(ErrorCode::IllegalArgument);
    }

    let mut node = HandlerNode::new(kind, policy, count);
    // Filters may already hold objects or a step; drop them on any failure.
    if let Err(e) = read_modifiers(engine, input, &mut node, count) {
        engine.discard_request(node);
        return Err(e);
    }
    let request_id = engine.install_external(node)?;
    debug!(%kind, request_id, "event request set");
    out.write_i32(request_id);
    Ok(Reply::Now)
}

fn read_modifiers(engine: &Engine, input: In<'_, '_>, node: &mut HandlerNode, count: usize) -> Result<(), ErrorCode> {
    for index in 0..count {
        match input.read_u8()? {
            modifier_kinds::COUNT => {
                let count = input.read_i32()?;
                engine.set_count_filter(node, index, count)?;
            }
            modifier_kinds::CONDITIONAL => {
                let expr_id = input.read_i32()?;
                engine.set_conditional_filter(node, index, expr_id)?;
            }
            modifier_kinds::THREAD_ONLY => {
                let thread = input.read_thread_ref()?;
                engine.set_thread_only_filter(node, index, thread)?;
            }
            modifier_kinds::CLASS_ONLY => {
                let class = input.read_class_ref()?;
                engine.set_class_only_filter(node, index, class)?;
            }
            modifier_kinds::CLASS_MATCH => {
                let pattern = input.read_string()?;
                engine.set_class_match_filter(node, index, pattern)?;
            }
            modifier_kinds::CLASS_EXCLUDE => {
                let pattern = input.read_string()?;
                engine.set_class_exclude_filter(node, index, pattern)?;
            }
            modifier_kinds::LOCATION_ONLY => {
                let location = input.read_location()?;
                engine.set_location_only_filter(node, index, location)?;
            }
            modifier_kinds::EXCEPTION_ONLY => {
                // A null class means any exception.
                let exception = input.read_object_ref()?;
                let caught = input.read_bool()?;
                let uncaught = input.read_bool()?;
                engine.set_exception_only_filter(node, index, exception, caught, uncaught)?;
            }
            modifier_kinds::FIELD_ONLY => {
                let class = input.read_class_ref()?;
                let field = input.read_field_id()?;
                engine.set_field_only_filter(node, index, class, field)?;
            }
            modifier_kinds::STEP => {
                let thread = input.read_thread_ref()?;
                let size = StepSize::from_i32(input.read_i32()?).ok_or(ErrorCode::IllegalArgument)?;
                let depth = StepDepth::from_i32(input.read_i32()?).ok_or(ErrorCode::IllegalArgument)?;
                engine.set_step_filter(node, index, thread, size, depth)?;
            }
            modifier_kinds::INSTANCE_ONLY => {
                let instance = input.read_object_ref()?;
                engine.set_instance_only_filter(node, index, instance)?;
            }
            _ => return Err(ErrorCode::IllegalArgument),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::dispatch;
    use super::super::tests::{command, setup};
    use crate::commands::{command_sets, event_commands, modifier_kinds};
    use crate::instream::PacketInputStream;
    use crate::protocol::ErrorCode;
    use crate::types::*;
    use bytes::BufMut;

    fn breakpoint_body(engine: &crate::engine::Engine, location: Location, extra: &[(u8, i32)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.put_u8(EventKind::Breakpoint as u8);
        body.put_u8(SuspendPolicy::EventThread as u8);
        body.put_i32(1 + extra.len() as i32);
        body.put_u8(modifier_kinds::LOCATION_ONLY);
        body.put_u8(RefTypeTag::Class as u8);
        body.put_u64(engine.refs().ref_to_id(location.class));
        body.put_u64(location.method);
        body.put_u64(location.index);
        for &(kind, value) in extra {
            body.put_u8(kind);
            body.put_i32(value);
        }
        body
    }

    #[test]
    fn test_set_and_clear_breakpoint() {
        let (vm, engine) = setup();
        let location = vm.define_method("LMain;", "main", &[(0, 1)]);

        let reply = dispatch(
            &engine,
            &command(command_sets::EVENT_REQUEST, event_commands::SET, breakpoint_body(&engine, location, &[])),
        )
        .unwrap();
        let mut input = PacketInputStream::new(engine.refs(), &reply);
        let request_id = input.read_i32().unwrap();
        assert_eq!(request_id, 2);
        assert!(vm.breakpoint_active(location));

        let mut body = Vec::new();
        body.put_u8(EventKind::Breakpoint as u8);
        body.put_i32(request_id);
        let reply = dispatch(&engine, &command(command_sets::EVENT_REQUEST, event_commands::CLEAR, body)).unwrap();
        assert_eq!(reply.error_code(), Some(0));
        assert!(!vm.breakpoint_active(location));
    }

    #[test]
    fn test_bad_count_modifier_installs_nothing() {
        let (vm, engine) = setup();
        let location = vm.define_method("LMain;", "main", &[(0, 1)]);
        let body = breakpoint_body(&engine, location, &[(modifier_kinds::COUNT, 0)]);
        let reply = dispatch(&engine, &command(command_sets::EVENT_REQUEST, event_commands::SET, body)).unwrap();
        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidCount.code()));
        assert_eq!(engine.handler_count(EventKind::Breakpoint), 0);
        assert!(!vm.breakpoint_active(location));
    }

    #[test]
    fn test_modifier_count_beyond_packet_is_rejected() {
        let (_vm, engine) = setup();
        let mut body = Vec::new();
        body.put_u8(EventKind::Breakpoint as u8);
        body.put_u8(SuspendPolicy::None as u8);
        body.put_i32(0x7fff_ffff);
        let reply = dispatch(&engine, &command(command_sets::EVENT_REQUEST, event_commands::SET, body)).unwrap();
        assert_eq!(reply.error_code(), Some(ErrorCode::IllegalArgument.code()));
        assert_eq!(engine.handler_count(EventKind::Breakpoint), 0);
    }

    #[test]
    fn test_unknown_event_kind() {
        let (_vm, engine) = setup();
        let mut body = Vec::new();
        body.put_u8(77);
        body.put_u8(0);
        body.put_i32(0);
        let reply = dispatch(&engine, &command(command_sets::EVENT_REQUEST, event_commands::SET, body)).unwrap();
        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidEventType.code()));
    }

    #[test]
    fn test_step_request_starts_stepping() {
        let (vm, engine) = setup();
        let t = vm.spawn_started_thread("main");
        let run = vm.define_method("LMain;", "run", &[(0, 10), (4, 11)]);
        vm.push_frame(t, run);

        let mut body = Vec::new();
        body.put_u8(EventKind::SingleStep as u8);
        body.put_u8(SuspendPolicy::EventThread as u8);
        body.put_i32(1);
        body.put_u8(modifier_kinds::STEP);
        body.put_u64(engine.refs().ref_to_id(t));
        body.put_i32(StepSize::Line as i32);
        body.put_i32(StepDepth::Over as i32);
        let reply = dispatch(&engine, &command(command_sets::EVENT_REQUEST, event_commands::SET, body)).unwrap();
        assert_eq!(reply.error_code(), Some(0));
        assert!(engine.is_stepping(t));
        assert!(vm.event_mode_enabled(EventKind::SingleStep, Some(t)));

        let reply = dispatch(&engine, &command(command_sets::EVENT_REQUEST, event_commands::CLEAR_ALL_BREAKPOINTS, Vec::new())).unwrap();
        assert_eq!(reply.error_code(), Some(0));
        assert!(engine.is_stepping(t));
    }
}
