// This binary is used by the integration tests as a process to fork and probe.
// It binds the port given in `PORT` (an OS-assigned one when unset), announces
// itself on stdout and answers `GET /` with `RESPONSE_BODY`.
//
// Optional environment variables:
// - STARTUP_DELAY_MILLISECONDS: wait before binding, to exercise readiness checks
// - SILENT: accept connections on `/` but never respond

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use execfork::telemetry::{get_subscriber, init_subscriber};
use std::io::{self, Write};
use std::time::Duration;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so that stdout carries only the announcement
    let subscriber = get_subscriber("spawn_test_server".into(), "info".into(), io::stderr);
    init_subscriber(subscriber);

    let port: u16 = match std::env::var("PORT") {
        Ok(port) => port.parse().context("PORT must be a port number.")?,
        Err(_) => 0,
    };
    let body = std::env::var("RESPONSE_BODY").unwrap_or_else(|_| "PING\n".to_string());
    let silent = std::env::var("SILENT").is_ok();
    let startup_delay = std::env::var("STARTUP_DELAY_MILLISECONDS")
        .ok()
        .map(|ms| ms.parse::<u64>())
        .transpose()
        .context("STARTUP_DELAY_MILLISECONDS must be a number.")?
        .map(Duration::from_millis);

    if let Some(delay) = startup_delay {
        tokio::time::sleep(delay).await;
    }

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind port {}.", port))?;
    let address = listener.local_addr()?;

    let app = Router::new()
        .route(
            "/",
            get(move || async move {
                if silent {
                    std::future::pending::<()>().await;
                }
                body
            }),
        )
        .layer(TraceLayer::new_for_http());

    println!("Server Started! Listening on {}", address);
    io::stdout().flush()?;

    axum::serve(listener, app)
        .await
        .context("Test server stopped unexpectedly.")
}
