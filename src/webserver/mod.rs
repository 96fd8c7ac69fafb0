//! HTTP listener for metrics, health and operator-triggered runs.
//!
//! This is the operational surface only; the status UI lives elsewhere and
//! is not part of this process.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::client::ClusterClient;
use crate::metrics;
use crate::run::{enqueue, Request, RunType};
use crate::Error;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    cluster: Arc<dyn ClusterClient>,
    queue: tokio::sync::mpsc::Sender<Request>,
}

impl AppState {
    /// Create the handler state
    pub fn new(cluster: Arc<dyn ClusterClient>, queue: tokio::sync::mpsc::Sender<Request>) -> Self {
        Self { cluster, queue }
    }
}

/// Form payload of the force-run endpoint
#[derive(Debug, Deserialize)]
pub struct ForceRunPayload {
    /// Namespace whose Waybill should be run
    pub namespace: String,
}

/// JSON body returned by the force-run endpoint
#[derive(Debug, Serialize)]
pub struct ForceRunResult {
    /// "success" or "error"
    pub result: String,
    /// Human-readable detail
    pub message: String,
}

/// Build the router for the listener
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/api/v1/forcerun", post(force_run))
        .with_state(state)
}

/// Bind and serve until the process shuts down
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "webserver listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics_text() -> impl IntoResponse {
    match metrics::get().encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}

/// Enqueue a forced run for the namespace's Waybill
async fn force_run(
    State(state): State<AppState>,
    Form(payload): Form<ForceRunPayload>,
) -> (StatusCode, Json<ForceRunResult>) {
    let waybills = match state.cluster.list_waybills().await {
        Ok(waybills) => waybills,
        Err(e) => {
            error!(error = %e, "cannot list waybills to force a run");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ForceRunResult {
                    result: "error".to_string(),
                    message: format!("cannot list waybills: {}", e),
                }),
            );
        }
    };
    let Some(waybill) = waybills
        .iter()
        .find(|wb| wb.namespace() == payload.namespace)
    else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ForceRunResult {
                result: "error".to_string(),
                message: format!("cannot find a Waybill in namespace '{}'", payload.namespace),
            }),
        );
    };
    enqueue(&state.queue, RunType::ForcedRun, waybill).await;
    (
        StatusCode::OK,
        Json(ForceRunResult {
            result: "success".to_string(),
            message: "Run queued".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterClient;
    use crate::crd::{Waybill, WaybillSpec};
    use kube::core::ObjectMeta;

    fn waybill(namespace: &str, auto_apply: Option<bool>) -> Waybill {
        Waybill {
            metadata: ObjectMeta {
                name: Some("main".to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: WaybillSpec {
                auto_apply,
                ..Default::default()
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn force_run_enqueues_a_forced_run_even_with_auto_apply_off() {
        let mut cluster = MockClusterClient::new();
        cluster
            .expect_list_waybills()
            .returning(|| Ok(vec![waybill("app-a", Some(false))]));

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let state = AppState::new(Arc::new(cluster), tx);

        let (status, Json(body)) = force_run(
            State(state),
            Form(ForceRunPayload {
                namespace: "app-a".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.result, "success");
        let request = rx.recv().await.unwrap();
        assert_eq!(request.type_, RunType::ForcedRun);
        assert_eq!(request.waybill.namespace(), "app-a");
    }

    #[tokio::test]
    async fn force_run_rejects_unknown_namespaces() {
        let mut cluster = MockClusterClient::new();
        cluster.expect_list_waybills().returning(|| Ok(Vec::new()));

        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let state = AppState::new(Arc::new(cluster), tx);

        let (status, Json(body)) = force_run(
            State(state),
            Form(ForceRunPayload {
                namespace: "missing".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.result, "error");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        assert_eq!(healthz().await, "ok");
    }
}
