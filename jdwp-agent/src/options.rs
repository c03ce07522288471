// Agent options
//
// The classic `name=value,name=value` option string. A later value overrides
// an earlier one; only one transport may be given.

use anyhow::{bail, Context, Result};
use jdwp_backend::engine::{EngineConfig, DEFAULT_COMPACTION_INTERVAL, DEFAULT_QUEUE_BYTES};
use serde::Serialize;
use std::time::Duration;

pub const USAGE: &str = "\
jdwp-agent usage: --options [help]|[<option>=<value>, ...]

Option Name and Value            Description                     Default
---------------------            -----------                     -------
suspend=y|n                      wait on startup?                y
transport=<name>                 transport name                  none
address=<listen/attach address>  where to listen or attach       \"\"
server=y|n                       listen for debugger?            n
timeout=<ms>                     accept/attach timeout, 0: none  0
launch=<command line>            run debugger on event           none
onthrow=<exception name>         debug on throw                  none
onuncaught=y|n                   debug on any uncaught?          n
strict=y|n                       skip runtime workarounds?       n
assert=y|n|fatal                 check internal invariants       n
queue_size=<bytes>               event queue capacity            51200

Example: jdwp-agent --options transport=dt_socket,server=y,address=8000
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertMode {
    Off,
    On,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentOptions {
    pub transport: String,
    pub address: Option<String>,
    pub server: bool,
    pub suspend: bool,
    /// Accept/attach timeout in milliseconds; 0 waits forever.
    pub timeout: u64,
    /// Exception class, as a signature.
    pub onthrow: Option<String>,
    pub onuncaught: bool,
    pub launch: Option<String>,
    pub strict: bool,
    pub assert: AssertMode,
    pub queue_size: usize,
    pub help: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            transport: String::new(),
            address: None,
            server: false,
            suspend: true,
            timeout: 0,
            onthrow: None,
            onuncaught: false,
            launch: None,
            strict: false,
            assert: AssertMode::Off,
            queue_size: DEFAULT_QUEUE_BYTES,
            help: false,
        }
    }
}

fn parse_switch(name: &str, value: &str) -> Result<bool> {
    match value {
        "y" => Ok(true),
        "n" => Ok(false),
        _ => bail!("bad value for {}: expected y or n, got {:?}", name, value),
    }
}

/// `java.lang.Foo` becomes `Ljava/lang/Foo;`.
fn classname_to_signature(name: &str) -> String {
    format!("L{};", name.replace('.', "/"))
}

impl AgentOptions {
    /// Parse an option string, with extra options (if any) appended.
    pub fn parse(options: &str, extra: Option<&str>) -> Result<Self> {
        let combined = match extra.map(str::trim).filter(|e| !e.is_empty()) {
            Some(extra) if options.is_empty() => extra.to_string(),
            Some(extra) => format!("{},{}", options, extra),
            None => options.to_string(),
        };
        Self::parse_str(&combined).with_context(|| format!("invalid JDWP options: {}", combined))
    }

    fn parse_str(options: &str) -> Result<Self> {
        let mut parsed = AgentOptions::default();
        if options.trim() == "help" {
            parsed.help = true;
            return Ok(parsed);
        }

        let mut transports = 0;
        for item in options.split(',').filter(|s| !s.is_empty()) {
            let Some((name, value)) = item.split_once('=') else {
                bail!("option {:?} has no value", item);
            };
            match name {
                "transport" => {
                    transports += 1;
                    parsed.transport = value.to_string();
                }
                "address" => {
                    if transports == 0 {
                        bail!("address specified without transport");
                    }
                    parsed.address = Some(value.to_string());
                }
                "launch" => parsed.launch = Some(value.to_string()),
                "onthrow" => parsed.onthrow = Some(classname_to_signature(value)),
                "assert" => {
                    parsed.assert = match value {
                        "y" => AssertMode::On,
                        "n" => AssertMode::Off,
                        "fatal" => AssertMode::Fatal,
                        _ => bail!("bad value for assert: {:?}", value),
                    }
                }
                "timeout" => {
                    parsed.timeout = value
                        .parse()
                        .with_context(|| format!("bad timeout: {:?}", value))?;
                }
                "queue_size" => {
                    parsed.queue_size = value
                        .parse()
                        .with_context(|| format!("bad queue_size: {:?}", value))?;
                }
                "server" => parsed.server = parse_switch(name, value)?,
                "suspend" => parsed.suspend = parse_switch(name, value)?,
                "onuncaught" => parsed.onuncaught = parse_switch(name, value)?,
                "strict" => parsed.strict = parse_switch(name, value)?,
                _ => bail!("unknown option {:?}", name),
            }
        }

        if transports == 0 {
            bail!("no transport specified");
        }
        if transports > 1 {
            bail!("multiple transports are not supported");
        }
        if parsed.transport != "dt_socket" {
            bail!("unsupported transport {:?}", parsed.transport);
        }
        if !parsed.server && parsed.address.is_none() {
            bail!("non-server transport must have a connection address specified through the 'address=' option");
        }
        if (parsed.onthrow.is_some() || parsed.onuncaught) && parsed.launch.is_none() {
            bail!("specify launch=<command line> when using onthrow or onuncaught");
        }
        Ok(parsed)
    }

    /// The address to listen on or attach to. A server without an address
    /// takes any free port.
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or("0")
    }

    pub fn transport_timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            suspend_on_init: self.suspend,
            server: self.server,
            max_queue_bytes: self.queue_size,
            compaction_interval: DEFAULT_COMPACTION_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_options() {
        let options = AgentOptions::parse("transport=dt_socket,server=y,address=*:5005,suspend=n", None).unwrap();
        assert_eq!(options.transport, "dt_socket");
        assert!(options.server);
        assert!(!options.suspend);
        assert_eq!(options.address(), "*:5005");
        assert_eq!(options.transport_timeout(), None);

        let config = options.engine_config();
        assert!(!config.suspend_on_init);
        assert!(config.server);
        assert_eq!(config.max_queue_bytes, DEFAULT_QUEUE_BYTES);
    }

    #[test]
    fn test_extra_options_are_appended() {
        let options = AgentOptions::parse("transport=dt_socket,address=8000", Some("timeout=1500,queue_size=4096")).unwrap();
        assert_eq!(options.transport_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(options.queue_size, 4096);

        let options = AgentOptions::parse("", Some("transport=dt_socket,server=y")).unwrap();
        assert!(options.server);
        assert_eq!(options.address(), "0");
    }

    #[test]
    fn test_help() {
        assert!(AgentOptions::parse("help", None).unwrap().help);
    }

    #[test]
    fn test_onthrow_needs_launch() {
        assert!(AgentOptions::parse("transport=dt_socket,server=y,onthrow=java.io.IOException", None).is_err());
        let options = AgentOptions::parse(
            "transport=dt_socket,server=y,onthrow=java.io.IOException,launch=/bin/true",
            None,
        )
        .unwrap();
        assert_eq!(options.onthrow.as_deref(), Some("Ljava/io/IOException;"));
    }

    #[test]
    fn test_rejected_options() {
        for bad in [
            "",
            "server=y",
            "address=8000,transport=dt_socket",
            "transport=dt_socket",
            "transport=dt_shmem,server=y",
            "transport=dt_socket,transport=dt_socket,server=y",
            "transport=dt_socket,server=maybe",
            "transport=dt_socket,server=y,assert=sometimes",
            "transport=dt_socket,server=y,bogus=1",
            "transport=dt_socket,server",
        ] {
            assert!(AgentOptions::parse(bad, None).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_assert_modes() {
        let options = AgentOptions::parse("transport=dt_socket,server=y,assert=fatal", None).unwrap();
        assert_eq!(options.assert, AssertMode::Fatal);
        let json = serde_json::to_string(&options).unwrap();
        assert!(json.contains("\"assert\":\"fatal\""));
    }
}
