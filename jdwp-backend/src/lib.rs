// JDWP back end
//
// The debuggee side of the Java Debug Wire Protocol:
// - Thread suspension bookkeeping
// - Event request chains and filters
// - Single stepping
// - Object id tables
// - Asynchronous event delivery
// - Method invocation on suspended threads

pub mod class_track;
pub mod commands;
pub mod debug_loop;
pub mod engine;
pub mod event_filter;
pub mod event_handler;
pub mod event_helper;
pub mod handlers;
pub mod instream;
pub mod invoker;
pub mod outstream;
pub mod packet;
pub mod protocol;
pub mod reftable;
pub mod runtime;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod step_control;
pub mod thread_control;
pub mod transport;
pub mod types;

pub use engine::{Engine, EngineConfig, PacketSink};
pub use packet::Packet;
pub use protocol::{ErrorCode, JdwpError, JdwpResult};
pub use runtime::{Runtime, RuntimeEvent};

/// Check an internal invariant. A violation is logged; with the `strict`
/// feature it also panics.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::__invariant_failed(format_args!($($arg)+), file!(), line!());
        }
    };
}

#[doc(hidden)]
pub fn __invariant_failed(message: std::fmt::Arguments<'_>, file: &str, line: u32) {
    tracing::error!(file, line, "invariant violated: {}", message);
    if cfg!(feature = "strict") {
        panic!("invariant violated at {}:{}: {}", file, line, message);
    }
}
