//! hx-server: demo host for the htmx event-routing server.
//!
//! Mounts one server on a WebSocket listener and registers the
//! `some_message` toggle-button handler.

use clap::Parser;
use hx_server::{encode_json, Envelope, HostConfig, HxServer, WebSocketListener};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// hx-server: WebSocket event routing for htmx
#[derive(Parser, Debug)]
#[command(name = "hx-server", version, about = "WebSocket event routing for htmx")]
struct Cli {
    /// Listen address (overrides config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// WebSocket mount path (overrides config file)
    #[arg(long)]
    mount: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.hx-server/config.toml")]
    config: String,

    /// Idle timeout in seconds (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct Toggle {
    state: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let host = match HostConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.mount.as_deref(),
        cli.idle_timeout,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %host.bind,
        mount = %host.mount,
        "starting hx-server"
    );

    let server = Arc::new(HxServer::new(host.server.clone()));
    server.on_connect(|conn| async move {
        info!(conn_id = %conn.id().short(), "client connected");
        Ok(())
    });
    server.on_disconnect(|conn| async move {
        info!(conn_id = %conn.id().short(), "client disconnected");
        Ok(())
    });
    server.listen("some_message", |conn, envelope| async move {
        let next = !current_state(&envelope);
        let vals = encode_json(&Toggle { state: next })?;
        conn.send_text(&toggle_button(&vals, next)).await
    });

    let mut listener = match WebSocketListener::bind(host.bind).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };
    server.mount(&mut listener, &host.mount);

    tokio::select! {
        result = listener.run() => {
            if let Err(e) = result {
                error!(error = %e, "listener error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.shutdown().await;
    info!("hx-server stopped");
}

/// The toggle state the client sent. htmx may deliver it as a JSON boolean
/// (from `hx-vals`) or as a string; anything else counts as `false`.
fn current_state(envelope: &Envelope) -> bool {
    match envelope.get("state") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    }
}

fn toggle_button(vals: &str, state: bool) -> String {
    format!(r#"<button hx-vals='{vals}' id="some_message" hx-trigger="click" ws-send>{state}</button>"#)
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
