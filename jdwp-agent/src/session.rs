// Debugger sessions
//
// Connects the engine to one debugger at a time: listen/accept or attach,
// report VM init, run the command loop, reset when the debugger goes away.
// In server mode the agent then waits for the next debugger.

use crate::options::AgentOptions;
use anyhow::{anyhow, Result};
use jdwp_backend::debug_loop::{self, SessionEnd};
use jdwp_backend::sim::SimulatedVm;
use jdwp_backend::transport::{self, Connection};
use jdwp_backend::types::ThreadRef;
use jdwp_backend::Engine;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::info;

/// The engine hosted over an in-process debuggee.
pub struct Agent {
    engine: Arc<Engine>,
    main_thread: ThreadRef,
    options: AgentOptions,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Result<Self> {
        let vm = Arc::new(SimulatedVm::new());
        let main_thread = vm.spawn_started_thread("main");
        let entry = vm.define_method("LMain;", "main", &[(0, 1), (4, 2), (9, 3)]);
        vm.push_frame(main_thread, entry);

        let engine = Engine::new(vm, options.engine_config());
        engine.start()?;
        Ok(Self {
            engine,
            main_thread,
            options,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Serve debuggers until the last session ends.
    pub async fn run(&self) -> Result<()> {
        let timeout = self.options.transport_timeout();
        let listener = if self.options.server {
            Some(transport::listen(self.options.address()).await?)
        } else {
            None
        };

        loop {
            let stream = match &listener {
                Some(listener) => transport::accept(listener, timeout).await?.0,
                None => transport::attach(self.options.address(), timeout).await?,
            };
            let end = self.serve(stream).await?;
            info!(?end, session = self.engine.session().0, "debugger session ended");
            if listener.is_none() {
                break;
            }
            info!("waiting for the next debugger");
        }

        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || engine.shutdown()).await?;
        Ok(())
    }

    async fn serve(&self, stream: TcpStream) -> Result<SessionEnd> {
        let Connection { sink, inbound, pump } = transport::spawn_packet_pump(stream);
        self.engine.on_connect(Arc::new(sink));

        // The helper may suspend everything before the debugger gets a word in.
        let engine = self.engine.clone();
        let main_thread = self.main_thread;
        tokio::task::spawn_blocking(move || engine.report_vm_init(main_thread)).await?;

        let command_loop = debug_loop::spawn(self.engine.clone(), inbound)?;
        let end = tokio::task::spawn_blocking(move || command_loop.join())
            .await?
            .map_err(|_| anyhow!("command loop panicked"))?;

        let engine = self.engine.clone();
        let relisten = self.options.server;
        tokio::task::spawn_blocking(move || engine.reset(relisten)).await?;
        pump.shutdown().await;
        Ok(end)
    }
}
