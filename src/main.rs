use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use command_relay::{
    api::api_router,
    broker::Broker,
    config::Config,
    events::{init_logging, EventEmitter},
    selector::{EndpointStatus, TunnelSelector},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;
    let events = EventEmitter::new(cfg.json_output);

    let broker = Broker::new(cfg.broker_settings());
    let sweeper = broker.start();

    let tunnel_cancel = CancellationToken::new();
    let mut tunnel_tasks = Vec::new();
    let tunnel_status = if cfg.tunnels.is_empty() {
        None
    } else {
        let selector = TunnelSelector::new(
            cfg.tunnel_endpoints(),
            cfg.local_url(),
            cfg.tunnel_health_interval(),
        );
        let status = selector.subscribe();
        tunnel_tasks.push(tokio::spawn(selector.run(tunnel_cancel.clone())));
        tunnel_tasks.push(tokio::spawn(report_tunnel_status(
            status.clone(),
            events.clone(),
        )));
        Some(status)
    };

    let router = api_router(broker.clone(), cfg.transport, tunnel_status);
    let bind_addr = cfg.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API on {bind_addr}"))?;

    tracing::info!(
        target = "command_relay::main",
        bind = %bind_addr,
        transport = ?cfg.transport,
        tunnels = cfg.tunnels.len(),
        "command relay listening"
    );
    events.emit(
        "broker_started",
        json!({
            "bind": bind_addr,
            "transport": cfg.transport,
            "tunnels": cfg.tunnels,
            "localUrl": cfg.local_url(),
        }),
    );

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(broker.clone()))
        .await;

    broker.shutdown();
    tunnel_cancel.cancel();
    for task in tunnel_tasks {
        if let Err(error) = task.await {
            tracing::warn!(target = "command_relay::main", error = %error, "tunnel task ended abnormally");
        }
    }
    if let Err(error) = sweeper.await {
        tracing::warn!(target = "command_relay::main", error = %error, "sweeper ended abnormally");
    }

    let pending = broker.pending_count();
    tracing::info!(target = "command_relay::main", pending, "command relay stopped");
    events.emit("broker_stopped", json!({ "pending": pending }));

    served.context("HTTP API server error")
}

/// Resolves on Ctrl-C or SIGTERM. Shutting the broker down here releases
/// every parked caller so graceful shutdown is not held up by long waits.
async fn shutdown_signal(broker: Broker) {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(target = "command_relay::main", error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                tracing::warn!(target = "command_relay::main", error = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!(target = "command_relay::main", "shutdown requested");
    broker.shutdown();
}

async fn report_tunnel_status(mut status: watch::Receiver<EndpointStatus>, events: EventEmitter) {
    loop {
        let current = status.borrow_and_update().clone();
        tracing::info!(
            target = "command_relay::main",
            state = current.label(),
            base_url = ?current.base_url(),
            "tunnel status"
        );
        events.emit("tunnel_status", &current);
        if status.changed().await.is_err() {
            break;
        }
    }
}
