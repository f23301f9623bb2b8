//! HTTP response building helpers

use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::error::RelayError;

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(json)))
        .unwrap()
}

/// Build a JSON response with 200 OK status
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, body)
}

/// Build an empty response with 204 No Content status
pub fn no_content() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn error_body(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}

/// Build a 404 Not Found response with message
pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    error_body(StatusCode::NOT_FOUND, message)
}

/// Build a 400 Bad Request response with message
pub fn bad_request(message: &str) -> Response<Full<Bytes>> {
    error_body(StatusCode::BAD_REQUEST, message)
}

pub fn unauthorized() -> Response<Full<Bytes>> {
    let mut resp = error_body(StatusCode::UNAUTHORIZED, "Missing or invalid admin token");
    resp.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Bearer"),
    );
    resp
}

pub fn method_not_allowed() -> Response<Full<Bytes>> {
    error_body(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
}

/// Status for a failed operation
pub fn status_for(error: &RelayError) -> StatusCode {
    match error {
        RelayError::NotFound(_) | RelayError::InvalidHandle(_) => StatusCode::NOT_FOUND,
        RelayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        RelayError::LengthRequired => StatusCode::LENGTH_REQUIRED,
        RelayError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        RelayError::Blacklisted => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Convert a RelayError to an appropriate HTTP response.
///
/// Storage faults are logged here and reported without internal detail.
pub fn error_response(error: RelayError) -> Response<Full<Bytes>> {
    let status = status_for(&error);
    let message = match &error {
        RelayError::NotFound(_) | RelayError::InvalidHandle(_) => "Not found".to_string(),
        e if e.is_client_error() => e.to_string(),
        e => {
            error!(error = %e, "Request failed");
            "Internal storage error".to_string()
        }
    };
    error_body(status, &message)
}

/// Body served for a download, with the sniffed type and nosniff set
pub fn file_response(content_type: &str, body: Bytes) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, body.len())
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .body(Full::new(body))
        .unwrap()
}

/// Attach the relay's CORS headers for the given allowed methods
pub fn with_cors(mut resp: Response<Full<Bytes>>, methods: &'static str) -> Response<Full<Bytes>> {
    let headers = resp.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        header::HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        header::HeaderValue::from_static(methods),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        header::HeaderValue::from_static("Content-Type"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&RelayError::TooLarge { limit: 1 }), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(status_for(&RelayError::Blacklisted), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&RelayError::LengthRequired), StatusCode::LENGTH_REQUIRED);
        assert_eq!(status_for(&RelayError::InvalidHandle("..".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&RelayError::BadRequest("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&RelayError::Database("disk".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_fault_detail_not_exposed() {
        let resp = error_response(RelayError::Database("/var/lib/secret path".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_cors_headers() {
        let resp = with_cors(no_content(), "GET");
        let headers = resp.headers();
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "GET");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], "Content-Type");
    }
}
