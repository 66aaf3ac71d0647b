use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cfg.log_level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(!cfg.json_output)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Machine-readable lifecycle events, one JSON object per line:
/// `{"ts": <rfc3339>, "type": <event>, "payload": <any>}`.
/// Enabled with `--json-output`; a no-op otherwise.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        let written = self.emit_to(&mut io::stderr().lock(), event_type, payload);
        if let Err(error) = written {
            tracing::debug!(target = "command_relay::events", error = %error, "failed to write event");
        }
    }

    /// Write one event line to `out`. Nothing is written when JSON output is
    /// off.
    pub fn emit_to<W: Write, T: Serialize>(
        &self,
        out: &mut W,
        event_type: &str,
        payload: T,
    ) -> io::Result<()> {
        if !self.json_output {
            return Ok(());
        }

        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "type": event_type,
            "payload": payload,
        });
        writeln!(out, "{line}")
    }
}
