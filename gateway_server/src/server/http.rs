//! Static file server rooted at `relative_path`, plus the REST diagnostics
//! router — the HTTP half of the teacher's two-listener split
//! (`UWServer.http_server` served files, `api/rest.rs` served JSON; both
//! answer on the same port here since they're both plain HTTP GETs).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tower_http::services::ServeDir;
use tracing::info;

use crate::config::ServerConfig;
use crate::ensemble::Ensemble;
use crate::server::rest::{self, SharedAppState};

pub async fn serve_http(ensemble: Arc<Ensemble>, config: &ServerConfig) -> std::io::Result<()> {
    let state = SharedAppState {
        ensemble,
        start_time: Instant::now(),
    };

    let app = rest::router(state).fallback_service(ServeDir::new(&config.relative_path));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    info!(addr = %addr, root = %config.relative_path, "http file server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
