//! Prometheus metrics and HTTP probes
//!
//! Served on `METRICS_ADDR`:
//! - `/healthz`: process is up
//! - `/readyz`: every watcher completed its initial list
//! - `/metrics`: Prometheus text exposition

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ControllerError;

pub struct Metrics {
    registry: Registry,
    pub reconciliations: IntCounter,
    pub reconcile_errors: IntCounterVec,
    pub api_calls: IntCounterVec,
    pub watch_restarts: IntCounterVec,
    pub pool_assignments: IntCounter,
    pub secret_rotations: IntCounter,
    pub vm_channels: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("vm_operator".to_string()), None)?;

        let reconciliations = IntCounter::new("reconciliations_total", "Reconciliation passes")?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new("reconcile_errors_total", "Failed reconciliation attempts by error kind"),
            &["kind"],
        )?;
        let api_calls = IntCounterVec::new(
            Opts::new("api_calls_total", "Mutating cluster API calls by verb"),
            &["verb"],
        )?;
        let watch_restarts = IntCounterVec::new(
            Opts::new("watch_restarts_total", "Watch stream restarts by resource"),
            &["resource"],
        )?;
        let pool_assignments = IntCounter::new("pool_assignments_total", "VM pool assignments")?;
        let secret_rotations = IntCounter::new("display_secret_rotations_total", "Display password rotations")?;
        let vm_channels = IntGauge::new("vm_channels", "Live VM channels")?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(api_calls.clone()))?;
        registry.register(Box::new(watch_restarts.clone()))?;
        registry.register(Box::new(pool_assignments.clone()))?;
        registry.register(Box::new(secret_rotations.clone()))?;
        registry.register(Box::new(vm_channels.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_errors,
            api_calls,
            watch_restarts,
            pool_assignments,
            secret_rotations,
            vm_channels,
        })
    }

    pub fn api_call(&self, verb: &str) {
        self.api_calls.with_label_values(&[verb]).inc();
    }

    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

/// Readiness gates, one per watcher
#[derive(Default)]
pub struct Readiness {
    gates: Mutex<Vec<(String, Arc<AtomicBool>)>>,
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gate that starts closed
    pub fn gate(&self, name: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        if let Ok(mut gates) = self.gates.lock() {
            gates.push((name.to_string(), flag.clone()));
        }
        flag
    }

    pub fn is_ready(&self) -> bool {
        self.gates
            .lock()
            .map(|gates| gates.iter().all(|(_, flag)| flag.load(Ordering::SeqCst)))
            .unwrap_or(false)
    }

    pub fn pending(&self) -> Vec<String> {
        self.gates
            .lock()
            .map(|gates| {
                gates
                    .iter()
                    .filter(|(_, flag)| !flag.load(Ordering::SeqCst))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct ProbeState {
    pub metrics: Arc<Metrics>,
    pub readiness: Arc<Readiness>,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<ProbeState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ready".to_string())
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("waiting for: {}", state.readiness.pending().join(", ")),
        )
    }
}

async fn metrics(State(state): State<ProbeState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve probes until `shutdown` flips
pub async fn serve(addr: SocketAddr, state: ProbeState, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Serving metrics and probes on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> ProbeState {
        ProbeState {
            metrics: Arc::new(Metrics::new().unwrap()),
            readiness: Arc::new(Readiness::new()),
        }
    }

    #[tokio::test]
    async fn test_readyz_waits_for_gates() {
        let state = state();
        let gate = state.readiness.gate("VirtualMachine");

        let response = router(state.clone())
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        gate.store(true, Ordering::SeqCst);
        let response = router(state)
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let state = state();
        state.metrics.reconciliations.inc();
        state.metrics.api_call("create");

        let text = state.metrics.render().unwrap();
        assert!(text.contains("vm_operator_reconciliations_total 1"));
        assert!(text.contains("vm_operator_api_calls_total{verb=\"create\"} 1"));

        let response = router(state)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
