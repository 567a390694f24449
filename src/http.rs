// HTTP surface - health report and forced sync
//
// Routes:
// - GET  /                          service info
// - GET  /api/v1/metrics/health     storage + per-device connectivity
// - POST /api/v1/metrics/sync/force start a cycle now, return immediately

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::health::{HealthReport, HealthReporter};
use crate::scheduler::CollectionScheduler;

pub const API_PREFIX: &str = "/api/v1/metrics";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<CollectionScheduler>,
    pub health: Arc<HealthReporter>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route(&format!("{}/health", API_PREFIX), get(health))
        .route(&format!("{}/sync/force", API_PREFIX), post(force_sync))
        .with_state(state)
}

/// Serves until `shutdown` fires
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP surface listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "scheduler": state.scheduler.state(),
        "health": format!("{}/health", API_PREFIX),
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.health.check().await)
}

async fn force_sync(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    // The cycle logs and records its own result; shutdown waits for it.
    match state.scheduler.force_sync() {
        Some(_) => (
            StatusCode::ACCEPTED,
            Json(json!({ "message": "Collection started in background" })),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "message": "Shutting down" })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::tests::{collector, inventory};
    use crate::poller::DevicePoller;
    use crate::testing::{FakeDeviceApi, MemorySink};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_root_reports_scheduler_state() {
        let app = router(state(Arc::new(MemorySink::default()), FakeDeviceApi::default()));

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["scheduler"], "stopped");
        assert_eq!(json["health"], "/api/v1/metrics/health");
    }

    fn state(sink: Arc<MemorySink>, api: FakeDeviceApi) -> AppState {
        let health_api = FakeDeviceApi::default().failing(&["r2"]);
        let health = Arc::new(HealthReporter::new(
            inventory(&["r1", "r2"]),
            Arc::new(DevicePoller::new(Arc::new(health_api), 2)),
            sink.clone(),
        ));
        let collector = collector(&["r1", "r2"], api, sink, 2, Duration::from_secs(1));
        AppState {
            scheduler: Arc::new(CollectionScheduler::new(collector, Duration::from_secs(60))),
            health,
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let sink = Arc::new(MemorySink::default());
        sink.unreachable.store(true, Ordering::SeqCst);
        let app = router(state(sink, FakeDeviceApi::default()));

        let response = app
            .oneshot(Request::get("/api/v1/metrics/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["components"]["storage"], "disconnected");
        assert_eq!(json["components"]["devices"]["r1"], "connected");
        assert_eq!(json["components"]["devices"]["r2"], "disconnected");
        assert_eq!(json["inventory_size"], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_force_sync_runs_a_cycle() {
        let sink = Arc::new(MemorySink::default());
        let api = FakeDeviceApi::default();
        let opened = Arc::clone(&api.opened);
        let app = router(state(sink, api));

        let response = app
            .oneshot(
                Request::post("/api/v1/metrics/sync/force")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while opened.load(Ordering::SeqCst) < 2 {
            assert!(tokio::time::Instant::now() < deadline, "forced cycle never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_force_sync_refused_after_shutdown() {
        let sink = Arc::new(MemorySink::default());
        let collector = collector(&["r1"], FakeDeviceApi::default(), sink.clone(), 1, Duration::from_secs(1));
        let health = Arc::new(HealthReporter::new(
            inventory(&["r1"]),
            Arc::new(DevicePoller::new(Arc::new(FakeDeviceApi::default()), 1)),
            sink,
        ));
        let app = router(AppState {
            scheduler: Arc::new(CollectionScheduler::new(Arc::clone(&collector), Duration::from_secs(60))),
            health,
        });

        collector.shutdown_forced().await;

        let response = app
            .oneshot(
                Request::post("/api/v1/metrics/sync/force")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
