//! HTTP API for the relay
//!
//! ## Public routes
//! - `POST /upload` - Multipart upload (field `file`), returns the retrieval URL
//! - `GET /download/{handle}` - Serve a live object
//! - `GET /files` - List stored handles
//! - `GET /health` - Health check
//! - `OPTIONS *` - CORS preflight
//!
//! ## Admin routes (`Authorization: Bearer <admin_token>`)
//! - `POST /admin/blacklist` - Ban a content hash, body `{"content_hash": "..."}`
//! - `DELETE /admin/blacklist/{hash}` - Lift a ban
//! - `DELETE /admin/files/{handle}` - Delete an object
//! - `POST /admin/sweep` - Run a retention pass now
//!
//! Admin routes answer 404 when no admin token is configured.
//!
//! ## Example Usage
//!
//! ```bash
//! curl -F file=@notes.txt http://localhost:8080/upload
//! # "http://localhost:8080/download/Xy3...Q"
//!
//! curl -X POST -H "Authorization: Bearer $TOKEN" \
//!      -d '{"content_hash": "n4bQgYhMfWWaL+qgxVrQFaO/TxsrC4Is0V1sFbDwCgg="}' \
//!      http://localhost:8080/admin/blacklist
//! ```

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, HeaderMap, Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use url::Url;

use crate::engine::{RelayStore, UploadMeta};
use crate::error::RelayError;
use crate::response::{self, with_cors};
use crate::sweeper::{sweep_pass, RetentionSweeper};
use crate::writer::stream_error;

/// Room allowed for the multipart envelope when prechecking Content-Length
const MULTIPART_ALLOWANCE: u64 = 16 * 1024;

/// Largest admin JSON body accepted
const ADMIN_BODY_LIMIT: usize = 4 * 1024;

#[derive(Debug, Deserialize)]
struct BanRequest {
    content_hash: String,
}

/// HTTP server state
pub struct HttpServer {
    store: Arc<RelayStore>,
    bind_addr: SocketAddr,
    /// Base for retrieval URLs, always ending in '/'
    public_url: Url,
    admin_token: Option<String>,
    require_content_length: bool,
    sweeper: Option<Arc<RetentionSweeper>>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(store: Arc<RelayStore>, bind_addr: SocketAddr, mut public_url: Url) -> Self {
        if !public_url.path().ends_with('/') {
            let path = format!("{}/", public_url.path());
            public_url.set_path(&path);
        }
        Self {
            store,
            bind_addr,
            public_url,
            admin_token: None,
            require_content_length: false,
            sweeper: None,
        }
    }

    /// Enable admin routes guarded by this bearer token
    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    /// Reject uploads without a Content-Length header (411)
    pub fn with_require_content_length(mut self, required: bool) -> Self {
        self.require_content_length = required;
        self
    }

    /// Route manual sweeps through the background sweeper so its state is tracked
    pub fn with_sweeper(mut self, sweeper: Arc<RetentionSweeper>) -> Self {
        self.sweeper = Some(sweeper);
        self
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "HTTP server listening");

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = server.clone();
                    async move { Ok::<_, Infallible>(server.handle(req, remote_addr).await) }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route one request. Never fails: errors become status codes.
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, remote = %remote_addr, "Incoming request");

        match (method, path.as_str()) {
            (Method::OPTIONS, p) => {
                let methods = if p == "/upload" { "POST" } else { "GET" };
                with_cors(response::no_content(), methods)
            }

            (Method::GET, "/health") => self.handle_health().unwrap_or_else(response::error_response),

            (Method::POST, "/upload") => with_cors(
                self.handle_upload(req, remote_addr)
                    .await
                    .unwrap_or_else(response::error_response),
                "POST",
            ),
            (_, "/upload") => response::method_not_allowed(),

            (Method::GET, "/files") => with_cors(
                self.handle_list().await.unwrap_or_else(response::error_response),
                "GET",
            ),

            (Method::GET, p) if p.starts_with("/download/") => {
                let handle = p.strip_prefix("/download/").unwrap_or("");
                with_cors(
                    self.handle_download(handle)
                        .await
                        .unwrap_or_else(response::error_response),
                    "GET",
                )
            }

            (method, p) if p.starts_with("/admin/") => {
                if let Err(resp) = self.authorize(req.headers()) {
                    return resp;
                }
                self.handle_admin(method, p, req)
                    .await
                    .unwrap_or_else(response::error_response)
            }

            _ => response::not_found("Not found"),
        }
    }

    /// GET /health
    fn handle_health(&self) -> Result<Response<Full<Bytes>>, RelayError> {
        let limits = self.store.limits();
        let body = serde_json::json!({
            "status": "ok",
            "objects": self.store.object_count()?,
            "max_object_bytes": limits.max_object_bytes,
            "retention_secs": limits.retention.num_seconds(),
            "sweeper": self.sweeper.as_ref().map(|s| s.state()),
            "admin_enabled": self.admin_token.is_some(),
        });
        Ok(response::ok(&body))
    }

    /// POST /upload
    async fn handle_upload<B>(
        &self,
        req: Request<B>,
        remote_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, RelayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let ceiling = self.store.limits().max_object_bytes;
        match content_length(req.headers())? {
            None if self.require_content_length => return Err(RelayError::LengthRequired),
            Some(n) if n > ceiling.saturating_add(MULTIPART_ALLOWANCE) => {
                return Err(RelayError::TooLarge { limit: ceiling })
            }
            _ => {}
        }

        let boundary = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| multer::parse_boundary(ct).ok())
            .ok_or_else(|| RelayError::BadRequest("expected multipart/form-data".into()))?;

        let mut multipart = multer::Multipart::new(req.into_body().into_data_stream(), boundary);
        let field = loop {
            match multipart.next_field().await.map_err(multipart_error)? {
                Some(field) if field.name() == Some("file") => break field,
                Some(_) => continue,
                None => {
                    return Err(RelayError::BadRequest(
                        "missing multipart field `file`".into(),
                    ))
                }
            }
        };

        let object = self
            .store
            .upload(
                Box::pin(field),
                UploadMeta {
                    // Content-Length covers the multipart envelope, not the file
                    declared_len: None,
                    origin: remote_addr.ip().to_string(),
                },
            )
            .await?;

        let url = self.download_url(&object.handle)?;
        info!(handle = %object.handle, size = object.size_bytes, origin = %object.origin, "Upload accepted");
        Ok(response::ok(&url.as_str()))
    }

    /// GET /download/{handle}
    async fn handle_download(&self, handle: &str) -> Result<Response<Full<Bytes>>, RelayError> {
        let download = self.store.open_object(handle).await?;
        debug!(handle = %handle, size = download.body.len(), content_type = download.content_type, "Serving object");
        Ok(response::file_response(download.content_type, download.body))
    }

    /// GET /files
    async fn handle_list(&self) -> Result<Response<Full<Bytes>>, RelayError> {
        let names = self.store.list().await?;
        Ok(response::ok(&names))
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response<Full<Bytes>>> {
        let Some(expected) = self.admin_token.as_deref() else {
            return Err(response::not_found("Not found"));
        };
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match presented {
            Some(token) if token_matches(token, expected) => Ok(()),
            _ => Err(response::unauthorized()),
        }
    }

    async fn handle_admin<B>(
        &self,
        method: Method,
        path: &str,
        req: Request<B>,
    ) -> Result<Response<Full<Bytes>>, RelayError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        match (method, path) {
            (Method::POST, "/admin/blacklist") => {
                let body = Limited::new(req.into_body(), ADMIN_BODY_LIMIT)
                    .collect()
                    .await
                    .map_err(|e| RelayError::BadRequest(format!("Failed to read body: {}", e)))?
                    .to_bytes();
                let request: BanRequest = serde_json::from_slice(&body)
                    .map_err(|e| RelayError::BadRequest(format!("Invalid JSON: {}", e)))?;
                let entry = self.store.ban(&request.content_hash)?;
                Ok(response::ok(&entry))
            }
            (Method::DELETE, p) if p.starts_with("/admin/blacklist/") => {
                let hash = p.strip_prefix("/admin/blacklist/").unwrap_or("");
                if self.store.unban(hash)? {
                    Ok(response::no_content())
                } else {
                    Ok(response::not_found("Hash is not blacklisted"))
                }
            }
            (Method::DELETE, p) if p.starts_with("/admin/files/") => {
                let handle = p.strip_prefix("/admin/files/").unwrap_or("");
                self.store.delete(handle).await?;
                Ok(response::no_content())
            }
            (Method::POST, "/admin/sweep") => {
                let report = match &self.sweeper {
                    Some(sweeper) => sweeper.sweep_now().await,
                    None => sweep_pass(&self.store, Utc::now()).await,
                };
                Ok(response::ok(&report))
            }
            _ => Ok(response::not_found("Not found")),
        }
    }

    fn download_url(&self, handle: &str) -> Result<Url, RelayError> {
        self.public_url
            .join(&format!("download/{}", handle))
            .map_err(|e| RelayError::Internal(format!("Failed to build download URL: {}", e)))
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>, RelayError> {
    headers
        .get(header::CONTENT_LENGTH)
        .map(|v| {
            v.to_str()
                .ok()
                .and_then(|s| s.trim().parse::<u64>().ok())
                .ok_or_else(|| RelayError::BadRequest("invalid Content-Length".into()))
        })
        .transpose()
}

fn multipart_error(e: multer::Error) -> RelayError {
    match e {
        multer::Error::StreamReadFailed(inner) => stream_error(inner),
        e => RelayError::BadRequest(format!("Failed to parse multipart body: {}", e)),
    }
}

/// Compare bearer tokens in constant time
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
