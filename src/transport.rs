//! Agent transport adapters.
//!
//! The broker itself is transport-agnostic. In `poll` mode the agent pulls
//! batches over HTTP; in `push` mode it holds a WebSocket open and the
//! broker forwards commands the moment they are enqueued. Both modes post
//! results through the same broker operations.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use clap::ValueEnum;
use serde::Serialize;

use crate::{
    broker::Broker,
    protocol::{AgentFrame, BrokerFrame},
};

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    #[default]
    Poll,
    Push,
}

/// Serve one push-mode agent until it disconnects or the broker shuts down.
pub async fn serve_push_agent(mut socket: WebSocket, broker: Broker) {
    tracing::info!(target = "command_relay::transport", "push agent connected");

    if !push_pending(&mut socket, &broker).await {
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = broker.stopped() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            _ = broker.enqueued() => {
                if !push_pending(&mut socket, &broker).await {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_agent_frame(&broker, text.as_str()) {
                            if send_frame(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => broker.record_heartbeat(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(target = "command_relay::transport", error = %error, "push agent socket error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::info!(target = "command_relay::transport", "push agent disconnected");
}

/// Drain one batch and push it. Commands that fail to send are not
/// re-queued. Returns false once the socket is unusable. Only pongs and
/// agent frames refresh liveness, never a push.
async fn push_pending(socket: &mut WebSocket, broker: &Broker) -> bool {
    let commands = broker.drain_for_push();
    if commands.is_empty() {
        return true;
    }

    let count = commands.len();
    if let Err(error) = send_frame(socket, &BrokerFrame::Commands { commands }).await {
        tracing::warn!(
            target = "command_relay::transport",
            dropped = count,
            error = %error,
            "failed to push commands to agent"
        );
        return false;
    }

    if broker.pending_count() > 0 {
        broker.renotify();
    }
    true
}

/// Apply an agent frame to the broker and build the reply, if any.
pub(crate) fn handle_agent_frame(broker: &Broker, raw: &str) -> Option<BrokerFrame> {
    match serde_json::from_str::<AgentFrame>(raw) {
        Ok(AgentFrame::Results { results }) => {
            let outcome = broker.submit_results(results);
            Some(BrokerFrame::Ack {
                accepted_count: outcome.accepted,
            })
        }
        Ok(AgentFrame::Heartbeat { .. }) => {
            broker.record_heartbeat();
            None
        }
        Err(error) => Some(BrokerFrame::Error {
            message: format!("invalid frame: {error}"),
        }),
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &BrokerFrame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    socket.send(Message::Text(text.into())).await
}
