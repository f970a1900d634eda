//! Integration tests for prompt submission against a fake engine endpoint.

use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use renderpod_comfyui::api::{ComfyUIApi, ComfyUIApiError};
use renderpod_core::workflow::WorkflowGraph;
use serde_json::{json, Value};

type Captured = Arc<Mutex<Option<Value>>>;

/// Serve `POST /prompt` answering with `status` and `body`; returns the base URL.
async fn spawn_engine(status: StatusCode, body: String, captured: Captured) -> String {
    let app = Router::new().route(
        "/prompt",
        post(move |Json(payload): Json<Value>| {
            let captured = captured.clone();
            let body = body.clone();
            async move {
                *captured.lock().expect("lock") = Some(payload);
                (status, body)
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

fn graph() -> WorkflowGraph {
    WorkflowGraph::from_value(json!({
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sd15.ckpt"}}
    }))
    .expect("graph")
}

#[tokio::test]
async fn submits_prompt_envelope() {
    let captured = Captured::default();
    let url = spawn_engine(
        StatusCode::OK,
        r#"{"prompt_id": "abc", "number": 3, "node_errors": {}}"#.to_string(),
        captured.clone(),
    )
    .await;

    let response = ComfyUIApi::new(url)
        .submit_workflow(&graph())
        .await
        .expect("submit");

    assert_eq!(response.prompt_id.as_deref(), Some("abc"));
    assert_eq!(response.number, Some(3));
    let payload = captured.lock().expect("lock").clone().expect("request seen");
    assert_eq!(payload["prompt"]["4"]["inputs"]["ckpt_name"], "sd15.ckpt");
}

#[tokio::test]
async fn non_json_success_body_is_tolerated() {
    let url = spawn_engine(StatusCode::OK, "queued".to_string(), Captured::default()).await;
    let response = ComfyUIApi::new(url)
        .submit_workflow(&graph())
        .await
        .expect("submit");
    assert!(response.prompt_id.is_none());
}

#[tokio::test]
async fn rejected_prompt_carries_status_and_truncated_body() {
    let body = format!("{{\"error\": \"{}\"}}", "x".repeat(2000));
    let url = spawn_engine(StatusCode::BAD_REQUEST, body, Captured::default()).await;

    let err = ComfyUIApi::new(url)
        .submit_workflow(&graph())
        .await
        .expect_err("should be rejected");

    assert_eq!(err.status(), Some(400));
    assert_matches!(err, ComfyUIApiError::ApiError { status: 400, body } if body.chars().count() == 500);
}

#[tokio::test]
async fn non_200_success_status_is_rejected() {
    let url = spawn_engine(StatusCode::ACCEPTED, "{}".to_string(), Captured::default()).await;
    let err = ComfyUIApi::new(url)
        .submit_workflow(&graph())
        .await
        .expect_err("only 200 is accepted");
    assert_eq!(err.status(), Some(202));
}

#[tokio::test]
async fn unreachable_engine_is_request_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = ComfyUIApi::new(format!("http://{addr}"))
        .submit_workflow(&graph())
        .await
        .expect_err("connection refused");
    assert_matches!(err, ComfyUIApiError::Request(_));
    assert_eq!(err.status(), None);
}
