use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use super::sink::MetricSnapshot;
use crate::server::StatusState;

// ─── GET /api/metrics ────────────────────────────────────────────
/// Returns the current aggregates as JSON.
pub async fn get_metrics(
    State(state): State<Arc<StatusState>>,
) -> Json<Vec<MetricSnapshot>> {
    Json(state.view.snapshot())
}

// ─── GET /api/metrics/stream ─────────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes the full snapshot list as JSON every 500 ms.
pub async fn metrics_stream(
    State(state): State<Arc<StatusState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(Duration::from_millis(500));

    let stream = IntervalStream::new(interval).map(move |_| {
        let snapshot = state.view.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
