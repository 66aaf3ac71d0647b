//! Priority-ordered tunnel selection with health-checked failover.
//!
//! `Unbound → Probing(i) → Bound(url)`; a failed re-probe while bound goes
//! back to `Probing(0)` and the whole list is scanned again from the top.
//! When every candidate fails the selector settles in `Degraded` and serves
//! the local fallback URL.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::tunnel::{LaunchedTunnel, TunnelError, TunnelProvider};

const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// The verified tunnel currently in use. Replaced wholesale on failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveBinding {
    pub endpoint: String,
    pub url: String,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EndpointStatus {
    Unbound,
    Probing {
        index: usize,
        endpoint: String,
    },
    Bound(ActiveBinding),
    Degraded {
        #[serde(rename = "localUrl")]
        local_url: String,
    },
}

impl EndpointStatus {
    /// Base URL outgoing requests should use, if one is settled.
    pub fn base_url(&self) -> Option<&str> {
        match self {
            EndpointStatus::Bound(binding) => Some(&binding.url),
            EndpointStatus::Degraded { local_url } => Some(local_url),
            EndpointStatus::Unbound | EndpointStatus::Probing { .. } => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EndpointStatus::Unbound => "unbound",
            EndpointStatus::Probing { .. } => "probing",
            EndpointStatus::Bound(_) => "bound",
            EndpointStatus::Degraded { .. } => "degraded",
        }
    }
}

#[derive(Debug)]
struct Active {
    index: usize,
    binding: ActiveBinding,
    tunnel: LaunchedTunnel,
}

pub struct TunnelSelector<P> {
    providers: Vec<P>,
    local_url: String,
    health_interval: Duration,
    active: Option<Active>,
    status: watch::Sender<EndpointStatus>,
}

impl<P: TunnelProvider> TunnelSelector<P> {
    pub fn new(mut providers: Vec<P>, local_url: impl Into<String>, health_interval: Duration) -> Self {
        providers.sort_by_key(|provider| provider.priority());
        let (status, _) = watch::channel(EndpointStatus::Unbound);
        Self {
            providers,
            local_url: local_url.into(),
            health_interval,
            active: None,
            status,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<EndpointStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> EndpointStatus {
        self.status.borrow().clone()
    }

    pub fn base_url(&self) -> Option<String> {
        self.status.borrow().base_url().map(ToOwned::to_owned)
    }

    /// Try each candidate in priority order and bind the first one whose URL
    /// passes its health probe. Any current binding is released first.
    pub async fn scan(&mut self) -> EndpointStatus {
        self.release_binding().await;

        for (index, provider) in self.providers.iter().enumerate() {
            self.status.send_replace(EndpointStatus::Probing {
                index,
                endpoint: provider.name().to_string(),
            });

            match probe_candidate(provider).await {
                Ok((url, tunnel)) => {
                    let binding = ActiveBinding {
                        endpoint: provider.name().to_string(),
                        url,
                        bound_at: Utc::now(),
                    };
                    tracing::info!(
                        target = "command_relay::selector",
                        endpoint = %binding.endpoint,
                        url = %binding.url,
                        "tunnel bound"
                    );
                    self.active = Some(Active {
                        index,
                        binding: binding.clone(),
                        tunnel,
                    });
                    self.status.send_replace(EndpointStatus::Bound(binding));
                    return self.status();
                }
                Err(error) => {
                    tracing::warn!(
                        target = "command_relay::selector",
                        endpoint = provider.name(),
                        error = %error,
                        "tunnel candidate failed, trying next"
                    );
                }
            }
        }

        tracing::info!(
            target = "command_relay::selector",
            local_url = %self.local_url,
            "no tunnel endpoint available, using local fallback"
        );
        self.status.send_replace(EndpointStatus::Degraded {
            local_url: self.local_url.clone(),
        });
        self.status()
    }

    /// Re-probe the bound URL. On failure the binding is dropped and a new
    /// scan starts from the highest-priority candidate.
    pub async fn check_binding(&mut self) -> EndpointStatus {
        let Some(active) = &self.active else {
            return self.status();
        };

        let provider = &self.providers[active.index];
        let probe = provider.health_check(&active.binding.url).await;
        let Err(error) = probe else {
            return self.status();
        };

        tracing::warn!(
            target = "command_relay::selector",
            endpoint = %active.binding.endpoint,
            url = %active.binding.url,
            error = %error,
            "bound tunnel failed health probe, rescanning"
        );
        self.scan().await
    }

    /// Scan, then keep re-probing the binding every `health_interval` until
    /// `cancel` fires. `Degraded` is terminal: the loop idles until shutdown.
    pub async fn run(mut self, cancel: CancellationToken) {
        let scanned = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.scan() => true,
        };

        if scanned {
            while self.active.is_some() {
                let health_interval = self.health_interval;
                let ticked = tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = tokio::time::sleep(health_interval) => true,
                };
                if !ticked {
                    break;
                }
                let checked = tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = self.check_binding() => true,
                };
                if !checked {
                    break;
                }
            }
            cancel.cancelled().await;
        }

        self.release_binding().await;
        self.status.send_replace(EndpointStatus::Unbound);
        tracing::debug!(target = "command_relay::selector", "tunnel selector stopped");
    }

    async fn release_binding(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(
                target = "command_relay::selector",
                endpoint = %active.binding.endpoint,
                "releasing tunnel"
            );
            active.tunnel.terminate(TERMINATE_GRACE).await;
        }
    }
}

/// Launch, find the URL, probe it. Any failure along the way is the same
/// outcome for the caller: skip to the next candidate.
async fn probe_candidate<P: TunnelProvider>(
    provider: &P,
) -> Result<(String, LaunchedTunnel), TunnelError> {
    if !provider.is_available() {
        return Err(TunnelError::Unavailable(provider.name().to_string()));
    }

    let mut tunnel = provider.launch().await?;
    let url = match tunnel
        .wait_for_url(|line| provider.extract_url(line), provider.url_timeout())
        .await
    {
        Ok(url) => url,
        Err(error) => {
            tunnel.terminate(TERMINATE_GRACE).await;
            return Err(error);
        }
    };

    if let Err(error) = provider.health_check(&url).await {
        tunnel.terminate(TERMINATE_GRACE).await;
        return Err(error);
    }
    Ok((url, tunnel))
}
