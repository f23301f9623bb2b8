//! HTTP API tests
//!
//! Requests are built in memory and passed straight to `HttpServer::handle`,
//! so routing, status mapping and headers are exercised without a socket.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header, Method, Request, Response, StatusCode};
use relay_storage::{Config, HttpServer, RelayStore};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use url::Url;

const BOUNDARY: &str = "relay-test-boundary";
const TOKEN: &str = "test-admin-token";

struct TestRelay {
    server: HttpServer,
    _temp: TempDir,
}

impl TestRelay {
    async fn new(configure: impl FnOnce(&mut Config)) -> Self {
        let temp = TempDir::new().unwrap();
        let mut config = Config {
            storage_dir: temp.path().to_path_buf(),
            max_object_bytes: 1024,
            admin_token: Some(TOKEN.to_string()),
            ..Config::default()
        };
        configure(&mut config);

        let store = Arc::new(RelayStore::open(&config).await.unwrap());
        let server = HttpServer::new(
            store,
            "127.0.0.1:0".parse().unwrap(),
            Url::parse("http://relay.test").unwrap(),
        )
        .with_admin_token(config.admin_token.clone())
        .with_require_content_length(config.require_content_length);

        Self { server, _temp: temp }
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        let remote: SocketAddr = "203.0.113.9:50000".parse().unwrap();
        self.server.handle(req, remote).await
    }

    /// Upload and return the handle from the retrieval URL
    async fn upload_ok(&self, data: &[u8]) -> String {
        let resp = self.send(upload_request("file", data)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let url: String = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        url.rsplit('/').next().unwrap().to_string()
    }
}

fn multipart_body(field: &str, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"upload.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn upload_request(field: &str, data: &[u8]) -> Request<Full<Bytes>> {
    let body = multipart_body(field, data);
    Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn get(path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn admin(method: Method, path: &str, token: Option<&str>, body: &str) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    builder
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn body_bytes(resp: Response<Full<Bytes>>) -> Bytes {
    resp.into_body().collect().await.unwrap().to_bytes()
}

fn content_hash(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

#[tokio::test]
async fn test_upload_then_download() {
    let relay = TestRelay::new(|_| {}).await;

    let resp = relay.send(upload_request("file", b"hello relay")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS], "POST");
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");

    let url: String = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let handle = URL_SAFE_NO_PAD.encode(Sha256::digest(b"hello relay"));
    assert_eq!(url, format!("http://relay.test/download/{}", handle));

    let resp = relay.send(get(&format!("/download/{}", handle))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS], "GET");
    assert_eq!(resp.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    assert_eq!(&body_bytes(resp).await[..], b"hello relay");
}

#[tokio::test]
async fn test_empty_file_upload() {
    let relay = TestRelay::new(|_| {}).await;
    let handle = relay.upload_ok(b"").await;

    let resp = relay.send(get(&format!("/download/{}", handle))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_LENGTH], "0");
    assert!(body_bytes(resp).await.is_empty());
}

#[tokio::test]
async fn test_html_upload_downgraded() {
    let relay = TestRelay::new(|_| {}).await;
    let handle = relay.upload_ok(b"<!DOCTYPE html><html><body>hi</body></html>").await;

    let resp = relay.send(get(&format!("/download/{}", handle))).await;

    assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
}

#[tokio::test]
async fn test_binary_type_sniffed() {
    let relay = TestRelay::new(|_| {}).await;
    let handle = relay.upload_ok(b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR").await;

    let resp = relay.send(get(&format!("/download/{}", handle))).await;

    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
}

#[tokio::test]
async fn test_file_listing() {
    let relay = TestRelay::new(|_| {}).await;
    let a = relay.upload_ok(b"first").await;
    let b = relay.upload_ok(b"second").await;

    let resp = relay.send(get("/files")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS], "GET");

    let names: Vec<String> = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn test_oversized_upload_rejected() {
    let relay = TestRelay::new(|_| {}).await;

    let resp = relay.send(upload_request("file", &[b'x'; 2048])).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

    // declared length far past the ceiling is rejected before reading
    let mut req = upload_request("file", b"small");
    req.headers_mut()
        .insert(header::CONTENT_LENGTH, header::HeaderValue::from_static("100000000"));
    assert_eq!(relay.send(req).await.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let names: Vec<String> = serde_json::from_slice(&body_bytes(relay.send(get("/files")).await).await).unwrap();
    assert!(names.is_empty());
}

#[tokio::test]
async fn test_malformed_uploads() {
    let relay = TestRelay::new(|_| {}).await;

    let resp = relay.send(upload_request("attachment", b"wrong field")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let not_multipart = Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Full::new(Bytes::from_static(b"raw")))
        .unwrap();
    assert_eq!(relay.send(not_multipart).await.status(), StatusCode::BAD_REQUEST);

    let resp = relay.send(upload_request("file", b"")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_length_required_when_configured() {
    let relay = TestRelay::new(|c| c.require_content_length = true).await;

    let mut req = upload_request("file", b"no length");
    req.headers_mut().remove(header::CONTENT_LENGTH);
    assert_eq!(relay.send(req).await.status(), StatusCode::LENGTH_REQUIRED);

    relay.upload_ok(b"with length").await;
}

#[tokio::test]
async fn test_unknown_and_unsafe_handles() {
    let relay = TestRelay::new(|_| {}).await;

    for path in [
        "/download/nope",
        "/download/..%2Fconfig.toml",
        "/download/",
        "/download/config.toml",
        "/nowhere",
    ] {
        let resp = relay.send(get(path)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{}", path);
    }
}

#[tokio::test]
async fn test_preflight() {
    let relay = TestRelay::new(|_| {}).await;
    let req = Request::builder()
        .method(Method::OPTIONS)
        .uri("/upload")
        .body(Full::new(Bytes::new()))
        .unwrap();

    let resp = relay.send(req).await;

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_METHODS], "POST");
}

#[tokio::test]
async fn test_health() {
    let relay = TestRelay::new(|_| {}).await;
    relay.upload_ok(b"counted").await;

    let resp = relay.send(get("/health")).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["objects"], 1);
    assert_eq!(health["max_object_bytes"], 1024);
}

#[tokio::test]
async fn test_admin_requires_token() {
    let relay = TestRelay::new(|_| {}).await;
    let body = format!(r#"{{"content_hash": "{}"}}"#, content_hash(b"x"));

    let resp = relay.send(admin(Method::POST, "/admin/blacklist", None, &body)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = relay.send(admin(Method::POST, "/admin/blacklist", Some("wrong"), &body)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let prefix = &TOKEN[..TOKEN.len() - 1];
    let resp = relay.send(admin(Method::POST, "/admin/blacklist", Some(prefix), &body)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let disabled = TestRelay::new(|c| c.admin_token = None).await;
    let resp = disabled.send(admin(Method::POST, "/admin/blacklist", Some(TOKEN), &body)).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_blacklist_blocks_upload() {
    let relay = TestRelay::new(|_| {}).await;
    let payload = b"not welcome here";
    let hash = content_hash(payload);

    let body = format!(r#"{{"content_hash": "{}"}}"#, hash);
    let resp = relay.send(admin(Method::POST, "/admin/blacklist", Some(TOKEN), &body)).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = relay.send(upload_request("file", payload)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let error: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(error["error"], "Content is blacklisted");

    // unban using the URL-safe form of the hash
    let url_safe = URL_SAFE_NO_PAD.encode(Sha256::digest(payload));
    let resp = relay
        .send(admin(Method::DELETE, &format!("/admin/blacklist/{}", url_safe), Some(TOKEN), ""))
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    relay.upload_ok(payload).await;
}

#[tokio::test]
async fn test_bad_ban_request() {
    let relay = TestRelay::new(|_| {}).await;

    let resp = relay.send(admin(Method::POST, "/admin/blacklist", Some(TOKEN), "not json")).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = relay
        .send(admin(Method::POST, "/admin/blacklist", Some(TOKEN), r#"{"content_hash": "short"}"#))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_delete_and_sweep() {
    let relay = TestRelay::new(|_| {}).await;
    let handle = relay.upload_ok(b"delete me").await;

    let path = format!("/admin/files/{}", handle);
    let resp = relay.send(admin(Method::DELETE, &path, Some(TOKEN), "")).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = relay.send(get(&format!("/download/{}", handle))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = relay.send(admin(Method::DELETE, &path, Some(TOKEN), "")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = relay.send(admin(Method::POST, "/admin/sweep", Some(TOKEN), "")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let report: serde_json::Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(report["expired"], 0);
}
