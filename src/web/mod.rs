pub mod handlers;
pub mod routes;
pub mod state;

use crate::config::WebConfig;
use crate::web::state::AppState;
use axum::http::{header, HeaderValue};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Full application router with the HTTP middleware stack applied.
pub fn build_router(state: Arc<AppState>) -> Router {
    routes::api_routes()
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(CompressionLayer::new())
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("no-store"),
                )),
        )
        .with_state(state)
}

pub async fn run_server(config: WebConfig, state: Arc<AppState>) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    let purge_state = Arc::clone(&state);
    let purger = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let (schemas, sessions) = purge_state.purge_expired().await;
            if schemas + sessions > 0 {
                debug!("Purged {} expired schemas and {} idle sessions", schemas, sessions);
            }
        }
    });

    let result = axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;
    purger.abort();
    result
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
