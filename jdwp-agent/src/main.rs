// JDWP agent - debuggee side of the Java Debug Wire Protocol
//
// Hosts the back-end engine and serves debuggers over dt_socket

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

mod options;
mod session;

use options::{AgentOptions, AssertMode, USAGE};
use session::Agent;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent options: `name=value` pairs separated by commas, or `help`
    #[arg(long, env = "JDWP_AGENT_OPTIONS", default_value = "")]
    options: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout carries the usage text
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("jdwp_agent=info".parse()?)
                .add_directive("jdwp_backend=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let extra = std::env::var("JDWP_AGENT_EXTRA_OPTIONS").ok();
    if let Some(extra) = &extra {
        info!("Picked up JDWP_AGENT_EXTRA_OPTIONS: {}", extra);
    }
    let options = AgentOptions::parse(&args.options, extra.as_deref())?;
    if options.help {
        print!("{}", USAGE);
        return Ok(());
    }
    info!("Starting JDWP agent with options {}", serde_json::to_string(&options)?);

    if options.assert == AssertMode::Fatal && !cfg!(feature = "strict") {
        warn!("assert=fatal needs a build with the `strict` feature; violations are only logged");
    }
    if options.onthrow.is_some() || options.onuncaught {
        warn!("onthrow/onuncaught are recorded only; the debugger is served from startup");
    }

    let agent = Agent::new(options)?;
    agent.run().await?;

    info!("JDWP agent shutting down");
    Ok(())
}
