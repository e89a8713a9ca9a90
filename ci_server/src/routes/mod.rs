//! HTTP routes: change hooks and the build master API.

pub mod api;
pub mod webhook;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{delete, get, post};
use axum::Router;
use ci_engine::services::agent::AgentStatus;
use ci_engine::services::dispatcher::BuilderStatus;
use ci_engine::{BuildId, BuildMaster, BuildSet, BuildSetId, NewChange, RequestId};

use crate::config::CiConfig;

/// Shared state for CI route handlers.
#[derive(Clone)]
pub struct CiRouterState {
    pub master: Arc<BuildMaster>,
    pub config: CiConfig,
}

/// Build the CI platform's Axum router (nested at `/ci`).
pub fn ci_router(state: CiRouterState) -> Router {
    Router::new()
        // Change hooks
        .route("/webhook/github", post(webhook_handler))
        .route("/api/changes", post(add_change))
        // User triggers
        .route("/api/force", post(force_build))
        .route("/api/try", post(try_build))
        // Status and control
        .route("/api/builders", get(list_builders))
        .route(
            "/api/builders/{builder}/requests/{request_id}",
            delete(cancel_request),
        )
        .route("/api/agents", get(list_agents))
        .route("/api/builds/{build_id}/abort", post(abort_build))
        .route("/api/buildsets/{build_set_id}", get(get_build_set))
        .with_state(state)
}

/// Map an engine error onto an HTTP status, logging server-side failures.
pub(crate) fn engine_error(err: ci_engine::Error) -> StatusCode {
    use ci_engine::Error;

    match err {
        Error::UnknownBuilder(_)
        | Error::UnknownAgent(_)
        | Error::RequestNotFound(_)
        | Error::BuildNotFound(_)
        | Error::BuildSetNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidConfig(_) | Error::NoBuilders => StatusCode::BAD_REQUEST,
        Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        Error::SourceResolution(e) => {
            tracing::error!("Source resolution error: {e}");
            StatusCode::BAD_GATEWAY
        }
    }
}

// ── Change hooks ──

async fn webhook_handler(
    State(state): State<CiRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    );

    webhook::handle_webhook(&state.config, &state.master, &headers, body)
}

async fn add_change(
    State(state): State<CiRouterState>,
    Json(change): Json<NewChange>,
) -> Result<(StatusCode, Json<api::ChangeAccepted>), StatusCode> {
    let change = state.master.add_change(change).map_err(engine_error)?;
    Ok((
        StatusCode::CREATED,
        Json(api::ChangeAccepted {
            change_id: change.id,
        }),
    ))
}

// ── User triggers ──

async fn force_build(
    State(state): State<CiRouterState>,
    Json(req): Json<api::ForceRequest>,
) -> Result<(StatusCode, Json<api::BuildSetAccepted>), StatusCode> {
    state
        .master
        .force_build(req.into())
        .map(|id| (StatusCode::CREATED, Json(api::BuildSetAccepted { build_set_id: id })))
        .map_err(|e| {
            tracing::warn!("Force build rejected: {e}");
            engine_error(e)
        })
}

async fn try_build(
    State(state): State<CiRouterState>,
    Json(req): Json<api::TryRequest>,
) -> Result<(StatusCode, Json<api::BuildSetAccepted>), StatusCode> {
    state
        .master
        .try_build(req.into())
        .map(|id| (StatusCode::CREATED, Json(api::BuildSetAccepted { build_set_id: id })))
        .map_err(|e| {
            tracing::warn!("Try build rejected: {e}");
            engine_error(e)
        })
}

// ── Status and control ──

async fn list_builders(State(state): State<CiRouterState>) -> Json<Vec<BuilderStatus>> {
    Json(state.master.builders())
}

async fn list_agents(State(state): State<CiRouterState>) -> Json<Vec<AgentStatus>> {
    Json(state.master.agents())
}

async fn cancel_request(
    State(state): State<CiRouterState>,
    Path((builder, request_id)): Path<(String, u64)>,
) -> Result<StatusCode, StatusCode> {
    state
        .master
        .cancel_request(&builder, RequestId(request_id))
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(engine_error)
}

async fn abort_build(
    State(state): State<CiRouterState>,
    Path(build_id): Path<u64>,
) -> Result<StatusCode, StatusCode> {
    state
        .master
        .abort_build(BuildId(build_id))
        .map(|()| StatusCode::ACCEPTED)
        .map_err(engine_error)
}

async fn get_build_set(
    State(state): State<CiRouterState>,
    Path(build_set_id): Path<u64>,
) -> Result<Json<BuildSet>, StatusCode> {
    state
        .master
        .build_set(BuildSetId(build_set_id))
        .map(Json)
        .map_err(engine_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use ci_engine::models::builder::{AgentConfig, BuilderConfig};
    use ci_engine::{MasterSetup, Source, SourceResolutionFailure, SourceStamp, TreeHandle};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct PinnedSource;

    #[async_trait]
    impl Source for PinnedSource {
        async fn resolve(
            &self,
            stamp: &SourceStamp,
        ) -> Result<TreeHandle, SourceResolutionFailure> {
            Ok(TreeHandle {
                revision: stamp
                    .revision
                    .clone()
                    .unwrap_or_else(|| ci_engine::Revision::Hash("cafe".into())),
                branch: stamp.branch.clone(),
                patched: stamp.patch.is_some(),
            })
        }
    }

    fn router() -> (Router, Arc<BuildMaster>) {
        let setup = MasterSetup::new()
            .agent(AgentConfig::new("linux-1"))
            .builder(BuilderConfig::new("full", &["linux-1"]));
        let master = Arc::new(BuildMaster::start(setup, Arc::new(PinnedSource)).unwrap());
        let state = CiRouterState {
            master: Arc::clone(&master),
            config: CiConfig::for_tests(),
        };
        (ci_router(state), master)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn force_build_queues_a_request() {
        let (app, master) = router();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/force",
                json!({ "builders": ["full"], "branch": "main", "reason": "release" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["build_set_id"].as_u64().unwrap();

        let response = app
            .clone()
            .oneshot(Request::get("/api/builders").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let builders = body_json(response).await;
        assert_eq!(builders[0]["name"], "full");
        assert_eq!(builders[0]["pending"][0]["build_set_id"], id);

        let response = app
            .oneshot(
                Request::get(format!("/api/buildsets/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["reason"], "release");
        assert_eq!(master.builders()[0].pending.len(), 1);
    }

    #[tokio::test]
    async fn unknown_builders_are_not_found() {
        let (app, _master) = router();
        let response = app
            .oneshot(post_json("/api/force", json!({ "builders": ["nope"] })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_removes_the_pending_request() {
        let (app, master) = router();
        master
            .force_build(ci_engine::ForceBuild {
                builders: vec!["full".into()],
                ..Default::default()
            })
            .unwrap();
        let request_id = master.builders()[0].pending[0].id;

        let uri = format!("/api/builders/full/requests/{request_id}");
        let response = app
            .clone()
            .oneshot(Request::delete(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(Request::delete(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn try_build_carries_the_patch() {
        let (app, master) = router();
        let response = app
            .oneshot(post_json(
                "/api/try",
                json!({
                    "builders": ["full"],
                    "revision": { "kind": "hash", "value": "abc123" },
                    "patch": { "level": 1, "diff": "--- a/x\n+++ b/x\n" }
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let builders = master.builders();
        let pending = &builders[0].pending;
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].mergeable);
    }

    #[tokio::test]
    async fn changes_are_numbered() {
        let (app, master) = router();
        let mut changes = master.subscribe_changes();
        let response = app
            .oneshot(post_json(
                "/api/changes",
                json!({ "who": "ann", "branch": "main", "files": ["src/lib.rs"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["change_id"], 1);
        let change = changes.recv().await.unwrap();
        assert_eq!(change.who, "ann");
        assert!(change.files.contains("src/lib.rs"));
    }

    #[tokio::test]
    async fn missing_build_set_and_build_are_not_found() {
        let (app, _master) = router();
        let response = app
            .clone()
            .oneshot(Request::get("/api/buildsets/99").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::post("/api/builds/5/abort")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
