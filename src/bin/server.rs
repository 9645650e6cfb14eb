//! Hive HTTP 服务
//!
//! 启动: cargo run --bin hive-server --features server
//! 工作流事件通过 GET /api/events（SSE）推送。

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use hive::config::load_config;
use hive::core::{
    run_with_graceful_shutdown, RegistryCleanup, ShutdownCoordinator, ShutdownManager,
};
use hive::workflow::{BroadcastEventSink, ResumeOutcome, StartOptions, WorkflowError};
use hive::{HiveBuilder, HiveComponents};

struct AppState {
    hive: HiveComponents,
    events: BroadcastEventSink,
}

#[derive(Deserialize)]
struct StartRequest {
    task: String,
    hitl: Option<bool>,
}

#[derive(Deserialize)]
struct ApprovalRequest {
    approved: bool,
    feedback: Option<String>,
}

#[derive(Deserialize)]
struct StepApprovalRequest {
    approved: bool,
    data: Option<Value>,
}

#[derive(Deserialize)]
struct ClarificationRequest {
    answer: String,
}

fn outcome_response(outcome: ResumeOutcome) -> Response {
    let code = if outcome.is_not_resumable() {
        StatusCode::CONFLICT
    } else {
        StatusCode::OK
    };
    (code, Json(outcome)).into_response()
}

/// POST /api/workflows
async fn api_start(State(state): State<Arc<AppState>>, Json(req): Json<StartRequest>) -> Response {
    match state
        .hive
        .orchestrator
        .start(&req.task, StartOptions { hitl: req.hitl })
        .await
    {
        Ok(id) => (StatusCode::CREATED, Json(json!({ "instance_id": id }))).into_response(),
        Err(e) => {
            let code = match e {
                WorkflowError::EmptyTask => StatusCode::BAD_REQUEST,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (code, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// POST /api/workflows/:id/plan
async fn api_plan(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ApprovalRequest>,
) -> Response {
    outcome_response(
        state
            .hive
            .orchestrator
            .resume_after_plan_approval(&id, req.approved, req.feedback)
            .await,
    )
}

/// POST /api/workflows/:id/step
async fn api_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<StepApprovalRequest>,
) -> Response {
    outcome_response(
        state
            .hive
            .orchestrator
            .resume_after_step_approval(&id, req.approved, req.data)
            .await,
    )
}

/// POST /api/workflows/:id/clarification
async fn api_clarification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ClarificationRequest>,
) -> Response {
    outcome_response(
        state
            .hive
            .orchestrator
            .resume_after_clarification(&id, &req.answer)
            .await,
    )
}

/// GET /api/workflows/:id：上下文与未决请求
async fn api_workflow(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let orch = &state.hive.orchestrator;
    match orch.context(&id).await {
        Some(ctx) => {
            let pending = orch.pending(&id).await;
            Json(json!({ "context": ctx, "pending": pending })).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown or finished workflow" })),
        )
            .into_response(),
    }
}

/// GET /api/health
async fn api_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let reports = state.hive.registry.health_all().await;
    let healthy = reports.iter().all(|r| r.healthy);
    Json(json!({
        "healthy": healthy,
        "mock_mode": state.hive.registry.mock_mode(),
        "services": reports,
    }))
}

/// GET /api/events：SSE 流，推送工作流事件
async fn api_events_sse(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let event_stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    let data = serde_json::to_string(&ev).unwrap_or_default();
                    let event = Event::default().event(ev.kind.name()).data(data);
                    return Some((Ok(event), rx));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "SSE subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/workflows", post(api_start))
        .route("/api/workflows/:id", get(api_workflow))
        .route("/api/workflows/:id/plan", post(api_plan))
        .route("/api/workflows/:id/step", post(api_step))
        .route("/api/workflows/:id/clarification", post(api_clarification))
        .route("/api/health", get(api_health))
        .route("/api/events", get(api_events_sse))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("Config load failed, using defaults: {}", e);
            Default::default()
        }
    };
    let bind = cfg.app.bind.clone();

    let shutdown = Arc::new(ShutdownManager::new());
    let events = BroadcastEventSink::new(256);
    let components = HiveBuilder::new(cfg)
        .with_events(Arc::new(events.clone()))
        .with_cancel_token(shutdown.child_token())
        .build();

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown));
    coordinator.register(RegistryCleanup::new(Arc::clone(&components.registry)));

    let state = Arc::new(AppState {
        hive: components,
        events,
    });
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!("Hive server listening on http://{}", bind);

    let app = {
        let shutdown = Arc::clone(&shutdown);
        async move {
            let serve = axum::serve(listener, router(state))
                .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await });
            if let Err(e) = serve.await {
                tracing::error!("Server error: {}", e);
            }
        }
    };

    run_with_graceful_shutdown(coordinator, app).await;
    Ok(())
}
