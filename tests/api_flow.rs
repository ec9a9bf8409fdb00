//! End-to-end tests over the assembled server: project lifecycle, pipeline
//! and history reads, autopilot control, and the SSE stream, all through the
//! HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use vibecc::api::SharedState;
use vibecc::config::ServerConfig;
use vibecc::models::{PipelineState, PipelineUpdate};
use vibecc::server::{build_router, build_state};
use vibecc::store::StateStore;

fn test_server() -> (SharedState, Router) {
    let config = ServerConfig::default();
    let state = build_state(&config, StateStore::open_in_memory().unwrap());
    let router = build_router(Arc::clone(&state));
    (state, router)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn create_project(app: &Router, name: &str, repo: &str) -> String {
    let (status, body) = send(
        app,
        post("/api/v1/projects", json!({ "name": name, "repo": repo })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["data"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn project_lifecycle_over_http() {
    let (_state, app) = test_server();

    let id = create_project(&app, "Demo", "acme/demo").await;

    // Visible in the listing.
    let (status, body) = send(&app, get("/api/v1/projects")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    // Update, then delete.
    let (status, body) = send(
        &app,
        Request::builder()
            .method("PATCH")
            .uri(format!("/api/v1/projects/{id}"))
            .header("content-type", "application/json")
            .body(Body::from(json!({ "max_retries_ci": 9 }).to_string()))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["max_retries_ci"], 9);

    let (status, _) = send(
        &app,
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/v1/projects/{id}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, get(&format!("/api/v1/projects/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pipelines_and_history_reads() {
    let (state, app) = test_server();
    let project_id = create_project(&app, "Demo", "acme/demo").await;

    // Seed one active and one archived pipeline directly in the store.
    {
        let pid = project_id.clone();
        state
            .db
            .call(move |db| {
                let active = db.create_pipeline(&pid, "1", "Active", "ticket-1", "")?;
                db.update_pipeline(&active.id, &PipelineUpdate {
                    state: Some(PipelineState::Coding),
                    ..Default::default()
                })?;

                let done = db.create_pipeline(&pid, "2", "Done", "ticket-2", "")?;
                let done = db.update_pipeline(&done.id, &PipelineUpdate {
                    state: Some(PipelineState::Merged),
                    pr_id: Some(7),
                    ..Default::default()
                })?;
                db.save_to_history(&done)?;
                db.delete_pipeline(&done.id)?;
                Ok(())
            })
            .await
            .unwrap();
    }

    let (status, body) = send(
        &app,
        get(&format!("/api/v1/pipelines?project_id={project_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rows = body["data"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["ticket_id"], "1");
    assert_eq!(rows[0]["state"], "coding");

    let (status, body) = send(
        &app,
        get(&format!("/api/v1/projects/{project_id}/tickets/1/pipeline")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["branch_name"], "ticket-1");

    let (status, body) = send(&app, get("/api/v1/history?final_state=merged")).await;
    assert_eq!(status, StatusCode::OK);
    let records = body["data"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["ticket_id"], "2");
    assert_eq!(records[0]["pr_id"], 7);

    let (status, body) = send(
        &app,
        get(&format!("/api/v1/history/stats?project_id={project_id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total_completed"], 1);
    assert_eq!(body["data"]["total_merged"], 1);
    assert_eq!(body["data"]["total_failed"], 0);
}

#[tokio::test]
async fn autopilot_control_over_http() {
    let (state, app) = test_server();
    let project_id = create_project(&app, "Demo", "acme/demo").await;

    let (status, body) = send(
        &app,
        get(&format!("/api/v1/projects/{project_id}/autopilot")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["running"], false);

    let (status, body) = send(
        &app,
        post(
            &format!("/api/v1/projects/{project_id}/autopilot/start"),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["running"], true);

    let (status, body) = send(
        &app,
        post(
            &format!("/api/v1/projects/{project_id}/autopilot/stop"),
            json!({}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["running"], false);
    assert!(!state.orchestrator.is_autopilot_running(&project_id));
}

#[tokio::test]
async fn sse_stream_delivers_emitted_events() {
    let (state, app) = test_server();

    let resp = app
        .clone()
        .oneshot(get("/api/v1/events/stream"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/event-stream"));

    // The subscription exists once the handler has run; events emitted now
    // must arrive as SSE frames.
    state.bus.pipeline_created("pl-1", "proj-1", "42", "queued");

    let mut body = resp.into_body().into_data_stream();
    let frame = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("frame should arrive")
        .expect("stream should be open")
        .unwrap();
    let text = String::from_utf8_lossy(&frame);
    assert!(text.contains("event: pipeline_created"), "frame: {text}");
    assert!(text.contains("\"ticket_id\":\"42\""), "frame: {text}");
}

#[tokio::test]
async fn sse_stream_respects_project_filter() {
    let (state, app) = test_server();

    let resp = app
        .clone()
        .oneshot(get("/api/v1/events/stream?project_id=p1"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    state.bus.pipeline_completed("other", "p2", "merged");
    state.bus.pipeline_completed("mine", "p1", "merged");

    let mut body = resp.into_body().into_data_stream();
    let frame = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("frame should arrive")
        .expect("stream should be open")
        .unwrap();
    let text = String::from_utf8_lossy(&frame);
    // The p2 event was filtered out; the first frame is the p1 event.
    assert!(text.contains("\"pipeline_id\":\"mine\""), "frame: {text}");
}
