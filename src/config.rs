use std::time::Duration;

use clap::Parser;

use crate::{
    broker::BrokerSettings,
    transport::TransportMode,
    tunnel::{TunnelEndpoint, TunnelKind},
};

#[derive(Debug, Parser, Clone)]
#[command(name = "command-relay")]
#[command(about = "Relays commands to a poll-only agent and correlates its results")]
pub struct Config {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 3055)]
    pub port: u16,

    #[arg(long, value_enum, default_value_t = TransportMode::Poll)]
    pub transport: TransportMode,

    #[arg(long, default_value_t = 10)]
    pub poll_batch: usize,

    #[arg(long, default_value_t = 100)]
    pub max_poll_batch: usize,

    #[arg(long, default_value_t = 1_000)]
    pub poll_interval: u64,

    #[arg(long, default_value_t = 30_000)]
    pub result_timeout: u64,

    #[arg(long, default_value_t = 10_000)]
    pub liveness_threshold: u64,

    #[arg(long, default_value_t = 120_000)]
    pub pending_ttl: u64,

    #[arg(long, default_value_t = 300_000)]
    pub result_ttl: u64,

    #[arg(long, default_value_t = 5_000)]
    pub sweep_interval: u64,

    /// Tunnel providers to try, highest priority first.
    #[arg(long = "tunnel", value_enum)]
    pub tunnels: Vec<TunnelKind>,

    #[arg(long, default_value_t = 30_000)]
    pub tunnel_health_interval: u64,

    #[arg(long, default_value_t = 20_000)]
    pub tunnel_url_timeout: u64,

    #[arg(long, default_value_t = 5_000)]
    pub tunnel_probe_timeout: u64,

    #[arg(long)]
    pub local_url: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,
}

impl Config {
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            poll_batch: self.poll_batch.max(1),
            max_poll_batch: self.max_poll_batch.max(1),
            poll_interval: Duration::from_millis(self.poll_interval),
            result_timeout: Duration::from_millis(self.result_timeout),
            liveness_threshold: Duration::from_millis(self.liveness_threshold),
            pending_ttl: Duration::from_millis(self.pending_ttl),
            result_ttl: Duration::from_millis(self.result_ttl),
            sweep_interval: Duration::from_millis(self.sweep_interval.max(1)),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn local_url(&self) -> String {
        self.local_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    /// Endpoint descriptors in the order given on the command line; the
    /// first flag gets the highest priority. Repeated providers are kept once.
    pub fn tunnel_endpoints(&self) -> Vec<TunnelEndpoint> {
        let mut seen = Vec::new();
        for kind in &self.tunnels {
            if !seen.contains(kind) {
                seen.push(*kind);
            }
        }
        seen.into_iter()
            .enumerate()
            .map(|(priority, kind)| {
                TunnelEndpoint::new(kind, priority as u32, self.port)
                    .with_url_timeout(Duration::from_millis(self.tunnel_url_timeout))
                    .with_probe_timeout(Duration::from_millis(self.tunnel_probe_timeout))
            })
            .collect()
    }

    pub fn tunnel_health_interval(&self) -> Duration {
        Duration::from_millis(self.tunnel_health_interval.max(1))
    }
}
