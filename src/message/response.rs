use http::{StatusCode, Version};

use super::headers::Headers;
use crate::AGENT;

/// A response in flight. Constructed by a short-circuiting request filter,
/// by the upstream client from a parsed head, or synthesized for errors.
/// `body` is owned for synthesized responses; streamed upstream bodies never
/// pass through it.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub reason: Option<String>,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: None,
            version: Version::HTTP_11,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: StatusCode, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut response = Self::new(status);
        let body = body.into();
        response.headers.set("Content-Type", content_type);
        response.headers.set("Content-Length", body.len().to_string());
        response.body = body;
        response
    }

    pub fn reason(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => self.status.canonical_reason().unwrap_or(""),
        }
    }

    /// Whether the status forbids a message body (1xx, 204, 304).
    pub fn body_forbidden(&self) -> bool {
        self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }

    /// `501 Not Implemented` for a request the proxy refuses to forward.
    pub fn not_implemented(detail: String) -> Self {
        let mut response = Self::with_body(StatusCode::NOT_IMPLEMENTED, "text/plain", detail);
        response.headers.set("Server", AGENT);
        response
    }

    pub fn bad_request(detail: &str) -> Self {
        let mut response =
            Self::with_body(StatusCode::BAD_REQUEST, "text/plain", detail.to_string());
        response.headers.set("Server", AGENT);
        response
    }

    /// `502 Bad Gateway` recording an upstream transport failure. The reason
    /// is preserved in `X-Died` for audit, per the upstream client contract.
    pub fn upstream_error(reason: &str) -> Self {
        let mut response =
            Self::with_body(StatusCode::BAD_GATEWAY, "text/plain", reason.to_string());
        response.headers.set("Server", AGENT);
        response.headers.set("X-Died", reason);
        response
    }

    /// `500` replacing a response whose filters failed.
    pub fn filter_error(diagnostic: &str) -> Self {
        let mut response = Self::with_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            diagnostic.to_string(),
        );
        response.reason = Some("Proxy filter error".to_string());
        response.headers.set("Server", AGENT);
        response.headers.set("X-Died", diagnostic);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::Response;
    use http::StatusCode;

    #[test]
    fn reason_falls_back_to_canonical() {
        let response = Response::new(StatusCode::OK);
        assert_eq!(response.reason(), "OK");
        let mut response = Response::new(StatusCode::INTERNAL_SERVER_ERROR);
        response.reason = Some("Proxy filter error".to_string());
        assert_eq!(response.reason(), "Proxy filter error");
    }

    #[test]
    fn body_forbidden_statuses() {
        assert!(Response::new(StatusCode::CONTINUE).body_forbidden());
        assert!(Response::new(StatusCode::NO_CONTENT).body_forbidden());
        assert!(Response::new(StatusCode::NOT_MODIFIED).body_forbidden());
        assert!(!Response::new(StatusCode::OK).body_forbidden());
    }

    #[test]
    fn upstream_error_records_x_died() {
        let response = Response::upstream_error("connection refused");
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers.get("x-died"), Some("connection refused"));
        assert_eq!(response.body, b"connection refused");
    }
}
