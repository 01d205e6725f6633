//! Server assembly: router, CORS, port probing, background tasks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::extract::ws::{close_code, CloseFrame, Message};
use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::handlers::{
    health_handler, hubs_handler, hubstats_handler, metrics_handler, stats_handler, ws_handler,
};
use crate::hub_mesh::{self, RELAY_DEDUP_MAX_AGE_MS};
use crate::state::{AppState, SharedState};

pub struct Server {
    pub state: SharedState,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            state: Arc::new(AppState::new(config)),
        }
    }

    /// Bind (probing ports upward on conflict), then launch the HTTP
    /// server, housekeeping, and the hub-mesh client. Returns the bound
    /// port; the server itself runs on background tasks.
    pub async fn start(&self) -> Result<u16> {
        let config = &self.state.config;
        let (listener, port) =
            bind_with_retries(&config.host, config.port, config.max_port_retries).await?;
        self.state.set_port(port);
        self.state.set_running(true);

        spawn_housekeeping(self.state.clone());
        hub_mesh::bootstrap::spawn(self.state.clone());

        let app = app(self.state.clone());
        tokio::spawn(async move {
            if let Err(err) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                tracing::error!(error = %err, "http server exited");
            }
        });

        Ok(port)
    }

    /// Stop background work and close every socket. Client read tasks end
    /// on their own once the close frames drain.
    pub async fn shutdown(&self) {
        self.state.set_running(false);
        self.state.mesh.clear_links().await;

        let handles: Vec<_> = {
            let mut conns = self.state.connections.write().await;
            conns.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.tx.send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "server shutdown".into(),
            })));
        }
    }
}

/// The HTTP router. `/ws` and `/` both upgrade.
pub fn app(state: SharedState) -> Router {
    let cors = cors_layer(&state.config.cors_origin);
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/hubs", get(hubs_handler))
        .route("/hubstats", get(hubstats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .route("/", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

fn cors_layer(origin: &str) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origin == "*" {
        return cors.allow_origin(Any);
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => cors.allow_origin(value),
        Err(_) => {
            tracing::warn!(origin = %origin, "unparseable CORS origin, allowing any");
            cors.allow_origin(Any)
        }
    }
}

/// Try `port`, `port+1`, … up to `retries` extra ports before giving up.
async fn bind_with_retries(host: &str, port: u16, retries: u16) -> Result<(TcpListener, u16)> {
    let mut last_err = None;
    for offset in 0..=retries {
        let candidate = port.saturating_add(offset);
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                let actual = listener
                    .local_addr()
                    .context("reading bound address")?
                    .port();
                return Ok((listener, actual));
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(anyhow!(
        "no free port in {}..={} on {}: {:?}",
        port,
        port.saturating_add(retries),
        host,
        last_err
    ))
}

/// Periodic sweep of expired relay-dedup entries.
fn spawn_housekeeping(state: SharedState) {
    tokio::spawn(async move {
        let period = Duration::from_millis(state.config.cleanup_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !state.is_running() {
                break;
            }
            let swept = state.mesh.sweep_relayed(RELAY_DEDUP_MAX_AGE_MS).await;
            state.metrics.cleanup_performed();
            if swept > 0 {
                tracing::debug!(swept, "swept expired relay dedup entries");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_probes_past_taken_port() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let (listener, port) = bind_with_retries("127.0.0.1", taken_port, 10).await.unwrap();
        assert_ne!(port, taken_port);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_bind_gives_up_without_retries() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        assert!(bind_with_retries("127.0.0.1", taken_port, 0).await.is_err());
    }
}
