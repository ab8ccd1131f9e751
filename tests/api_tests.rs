mod common;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use common::{CHUNK_SIZE, setup};
use file_uploads::{handlers::AppState, routes::routes::routes};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn app() -> (common::TestEnv<file_uploads::storage::MemoryStorage>, Router) {
    let env = setup().await;
    let state = AppState::new(env.lifecycle.clone(), 4 * 1024 * 1024);
    let router = routes().with_state(state);
    (env, router)
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body) = send(router, request).await;
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::delete(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_bytes(uri: &str, body: &'static [u8]) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn health_and_readiness() {
    let (_env, router) = app().await;

    let (status, body) = send_json(&router, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send_json(&router, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["database"]["ok"], true);
    assert_eq!(body["checks"]["storage"]["ok"], true);
}

#[tokio::test]
async fn single_part_upload_flow() {
    let (_env, router) = app().await;

    let (status, created) = send_json(
        &router,
        post_json(
            "/files",
            json!({"filename": "hello.txt", "mime_type": "text/plain", "size": 11}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["file"]["is_multipart"], false);
    assert_eq!(created["file"]["is_finalized"], false);
    assert!(created.get("finalize").is_none());
    assert!(created["file"].get("multipart_token").is_none());

    let id = created["file"]["id"].as_str().unwrap().to_string();
    let upload = created["upload"].as_str().unwrap().to_string();
    assert_eq!(upload, format!("/files/{id}/upload"));

    let (status, body) = send(&router, post_bytes(&upload, b"hello world")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body.is_empty());

    let (status, viewed) = send_json(&router, get(&format!("/files/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(viewed["file"]["is_finalized"], true);
    assert_eq!(viewed["file"]["is_multipart"], Value::Null);
    assert!(viewed.get("upload").is_none());

    let (status, listed) = send_json(&router, get("/files")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["files"].as_array().unwrap().len(), 1);
    assert_eq!(listed["next_continuation_token"], Value::Null);

    let response = router
        .clone()
        .oneshot(get(&format!("/objects/{id}/hello.txt")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    let content = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&content[..], b"hello world");

    let (status, _) = send(&router, post_bytes(&upload, b"again")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn multipart_upload_flow() {
    let (_env, router) = app().await;

    let (status, created) = send_json(
        &router,
        post_json("/files", json!({"filename": "big.bin", "size": CHUNK_SIZE * 10})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["file"]["is_multipart"], true);
    assert_eq!(created["chunk_size"], CHUNK_SIZE);
    let id = created["file"]["id"].as_str().unwrap().to_string();
    let upload = created["upload"].as_str().unwrap().to_string();
    let finalize = created["finalize"].as_str().unwrap().to_string();

    let (status, body) = send(&router, post_bytes(&upload, b"no part")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{}", String::from_utf8_lossy(&body));

    let (status, one) = send_json(&router, post_bytes(&format!("{upload}?part=1"), b"aaa")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["part"], 1);
    let (status, two) = send_json(&router, post_bytes(&format!("{upload}?part=2"), b"bbb")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &router,
        post_json(
            &finalize,
            json!({"hashes": [
                {"part": 1, "hash": one["hash"]},
                {"part": 2, "hash": two["hash"]},
            ]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, viewed) = send_json(&router, get(&format!("/files/{id}"))).await;
    assert_eq!(viewed["file"]["is_finalized"], true);

    let (status, content) = send(&router, get(&format!("/objects/{id}/big.bin"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content, b"aaabbb");
}

#[tokio::test]
async fn abort_and_delete() {
    let (_env, router) = app().await;

    let (_, created) = send_json(
        &router,
        post_json("/files", json!({"filename": "big.bin", "size": CHUNK_SIZE})),
    )
    .await;
    let id = created["file"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&router, delete(&format!("/files/{id}/abort"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, get(&format!("/files/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, created) = send_json(
        &router,
        post_json("/files", json!({"filename": "small.txt", "size": 1})),
    )
    .await;
    let id = created["file"]["id"].as_str().unwrap().to_string();

    let (status, body) = send_json(&router, delete(&format!("/files/{id}/abort"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);

    let (status, _) = send(&router, delete(&format!("/files/{id}"))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, delete(&format!("/files/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn client_errors_are_reported_as_json() {
    let (_env, router) = app().await;

    let (status, body) = send_json(
        &router,
        post_json("/files", json!({"filename": "a/b", "size": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);
    assert!(body["error"].as_str().unwrap().contains("filename"));

    let (status, _) = send(&router, get("/files/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, get(&format!("/files/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&router, get("/files?continuation-token=garbage!")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &router,
        post_json(
            &format!("/files/{}/finalize", uuid::Uuid::new_v4()),
            json!({"hashes": []}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&router, get("/objects/nothing-here")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_part_numbers_are_json_bad_requests() {
    let (_env, router) = app().await;

    let (_, created) = send_json(
        &router,
        post_json("/files", json!({"filename": "big.bin", "size": CHUNK_SIZE})),
    )
    .await;
    let upload = created["upload"].as_str().unwrap().to_string();

    for bad in ["abc", "-1", "1.5"] {
        let (status, body) =
            send_json(&router, post_bytes(&format!("{upload}?part={bad}"), b"x")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "part={bad}");
        assert_eq!(body["status"], 400);
        assert!(body["error"].as_str().unwrap().contains("part"));
    }

    let (status, body) = send_json(&router, post_bytes(&format!("{upload}?part=0"), b"x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    let (status, one) = send_json(&router, post_bytes(&format!("{upload}?part=1"), b"x")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(one["part"], 1);
}

#[tokio::test]
async fn oversized_bodies_are_rejected() {
    let env = setup().await;
    let router = routes().with_state(AppState::new(env.lifecycle.clone(), 4));

    let (_, created) = send_json(
        &router,
        post_json("/files", json!({"filename": "a.txt", "size": 10})),
    )
    .await;
    let upload = created["upload"].as_str().unwrap().to_string();

    let (status, _) = send(&router, post_bytes(&upload, b"0123456789")).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn list_paginates_with_continuation_tokens() {
    let (_env, router) = app().await;

    for i in 0..3 {
        let (_, created) = send_json(
            &router,
            post_json("/files", json!({"filename": format!("f{i}.txt"), "size": 1})),
        )
        .await;
        let upload = created["upload"].as_str().unwrap().to_string();
        send(&router, post_bytes(&upload, b"x")).await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let (_, first) = send_json(&router, get("/files?limit=2")).await;
    assert_eq!(first["files"].as_array().unwrap().len(), 2);
    let token = first["next_continuation_token"].as_str().unwrap().to_string();

    let (_, second) = send_json(
        &router,
        get(&format!("/files?limit=2&continuation-token={token}")),
    )
    .await;
    assert_eq!(second["files"].as_array().unwrap().len(), 1);
    assert_eq!(second["files"][0]["filename"], "f2.txt");
    assert_eq!(second["next_continuation_token"], Value::Null);
}
