//! API Module
//!
//! HTTP API layer for the orchestrator: a thin adapter over the scheduler.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod job;
pub mod pipeline;
pub mod worker;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::scheduler::Scheduler;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Run history database, when configured
    pub pool: Option<PgPool>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Pipeline endpoints
        .route(
            "/pipelines",
            post(pipeline::submit_pipeline).get(pipeline::list_pipelines),
        )
        .route("/pipelines/history/{name}", get(pipeline::pipeline_history))
        .route("/pipelines/{id}", get(pipeline::get_pipeline))
        .route("/pipelines/{id}/cancel", post(pipeline::cancel_pipeline))
        // Worker endpoints
        .route("/workers", get(worker::list_workers))
        .route("/workers/heartbeat", post(worker::heartbeat))
        // Job endpoints
        .route("/jobs/{id}/report", post(job::report_job))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dispatcher::{DispatchError, WorkerRpc};
    use crate::registry::WorkerTarget;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use conveyor_core::dto::job::{DispatchAck, JobSpec};
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    struct NoWorkers;

    #[async_trait]
    impl WorkerRpc for NoWorkers {
        async fn dispatch(&self, target: &WorkerTarget, _spec: &JobSpec) -> Result<DispatchAck, DispatchError> {
            Err(DispatchError::Rejected(target.id.clone()))
        }

        async fn cancel(&self, _target: &WorkerTarget, _job_id: Uuid) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn app() -> Router {
        let scheduler = Arc::new(Scheduler::new(&Config::default(), Arc::new(NoWorkers)));
        create_router(AppState {
            scheduler,
            pool: None,
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn definition() -> Value {
        json!({
            "name": "ci",
            "stages": [{
                "name": "build",
                "jobs": [{ "name": "compile", "image": "rust:1", "script": ["cargo build"] }]
            }]
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_submit_and_get_pipeline() {
        let app = app();

        let (status, body) = send(&app, "POST", "/pipelines", Some(definition())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/pipelines/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "Running");
        assert_eq!(body["stages"][0]["jobs"][0]["status"], "Pending");

        let (status, body) = send(&app, "GET", "/pipelines", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = send(&app, "GET", "/pipelines/history/ci", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], id.as_str());
    }

    #[tokio::test]
    async fn test_invalid_definition_is_unprocessable() {
        let (status, body) = send(
            &app(),
            "POST",
            "/pipelines",
            Some(json!({ "name": "ci", "stages": [] })),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["violations"][0]["rule"], "empty_pipeline");
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        let uri = format!("/pipelines/{}", Uuid::new_v4());
        let (status, body) = send(&app(), "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_cancel_twice_conflicts() {
        let app = app();
        let (_, body) = send(&app, "POST", "/pipelines", Some(definition())).await;
        let uri = format!("/pipelines/{}/cancel", body["id"].as_str().unwrap());

        let (status, _) = send(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = send(&app, "POST", &uri, None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_heartbeat_registers_worker() {
        let app = app();
        let hb = json!({
            "worker_id": "w1",
            "address": "http://127.0.0.1:9090",
            "capacity": 2,
            "current_load": 0,
            "held": []
        });

        let (status, _) = send(&app, "POST", "/workers/heartbeat", Some(hb)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = send(&app, "GET", "/workers", None).await;
        assert_eq!(body[0]["id"], "w1");
        assert_eq!(body[0]["health"], "Healthy");
    }

    #[tokio::test]
    async fn test_report_validation() {
        let app = app();
        let job_id = Uuid::new_v4();
        let report = json!({
            "job_id": job_id,
            "attempt": 1,
            "worker_id": "w1",
            "status": "Succeeded",
            "exit_code": 0,
            "reason": null
        });

        // Unknown job
        let uri = format!("/jobs/{}/report", job_id);
        let (status, _) = send(&app, "POST", &uri, Some(report.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Path and body disagree
        let uri = format!("/jobs/{}/report", Uuid::new_v4());
        let (status, _) = send(&app, "POST", &uri, Some(report)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    /// Serves `app` on an ephemeral port and returns a client for it
    async fn serve(app: Router) -> conveyor_client::OrchestratorClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        conveyor_client::OrchestratorClient::new(format!("http://{}", addr))
    }

    #[tokio::test]
    async fn test_orchestrator_client_against_router() {
        use conveyor_core::domain::pipeline::PipelineDefinition;
        use conveyor_core::domain::status::{JobStatus, PipelineStatus};
        use conveyor_core::dto::job::TerminalReport;
        use conveyor_core::dto::worker::Heartbeat;

        let client = serve(app()).await;

        let def: PipelineDefinition = serde_json::from_value(definition()).unwrap();
        let created = client.submit_pipeline(&def).await.unwrap();

        let run = client.get_pipeline(created.id).await.unwrap();
        assert_eq!(run.status, PipelineStatus::Running);
        assert_eq!(client.list_pipelines().await.unwrap()[0].id, created.id);
        assert_eq!(client.pipeline_history("ci").await.unwrap()[0].id, created.id);
        assert!(client.pipeline_history("other").await.unwrap().is_empty());

        let invalid: PipelineDefinition = serde_json::from_value(json!({ "name": "ci", "stages": [] })).unwrap();
        let err = client.submit_pipeline(&invalid).await.unwrap_err();
        assert!(matches!(err, conveyor_client::ClientError::ApiError { status: 422, .. }));

        client
            .send_heartbeat(&Heartbeat {
                worker_id: "w1".to_string(),
                address: "http://127.0.0.1:9090".to_string(),
                capacity: 1,
                current_load: 0,
                held: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(client.list_workers().await.unwrap()[0].id, "w1");

        // Never dispatched, so any report is stale
        let ack = client
            .report_job(&TerminalReport {
                job_id: run.stages[0].jobs[0].id,
                attempt: 1,
                worker_id: "w1".to_string(),
                status: JobStatus::Succeeded,
                exit_code: Some(0),
                reason: None,
            })
            .await
            .unwrap();
        assert!(!ack.applied);

        client.cancel_pipeline(created.id).await.unwrap();
        assert!(client.cancel_pipeline(created.id).await.unwrap_err().is_conflict());
        assert_eq!(
            client.get_pipeline(created.id).await.unwrap().status,
            PipelineStatus::Canceled
        );
        assert!(client.get_pipeline(Uuid::new_v4()).await.unwrap_err().is_not_found());
    }
}
