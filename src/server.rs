use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::metrics::stream;
use crate::metrics::SinkView;

/// State shared by the status routes.
pub struct StatusState {
    pub view: SinkView,
}

/// Builds the read-only status `Router`.
pub fn create_router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/api/metrics", get(stream::get_metrics))
        .route("/api/metrics/stream", get(stream::metrics_stream))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Binds `addr` and serves the status routes until `shutdown` fires.
///
/// # Errors
///
/// Fails if the listener cannot be bound.
pub async fn spawn(
    addr: SocketAddr,
    view: SinkView,
    shutdown: CancellationToken,
) -> AppResult<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::io("failed to bind status listener", err))?;
    info!(%addr, "status endpoint listening");

    let app = create_router(Arc::new(StatusState { view }));
    Ok(tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(err) = served {
            warn!(error = %err, "status endpoint exited with error");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricSink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn serves_current_snapshot() {
        let sink = Arc::new(MetricSink::new());
        sink.observe("lag", 4).unwrap();
        let shutdown = CancellationToken::new();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = spawn(addr, sink.view(), shutdown.clone()).await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /api/metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""name":"lag""#));
        assert!(response.contains(r#""count":1"#));

        shutdown.cancel();
        handle.await.unwrap();
    }
}
