use http::{Method, Uri, Version};

use super::headers::Headers;

/// A client request in flight through the proxy. The URI is always absolute
/// by the time filters observe it. Mutable until dispatched upstream.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, uri: Uri, version: Version) -> Self {
        Self {
            method,
            uri,
            version,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn version_token(&self) -> &'static str {
        version_token(self.version)
    }

    /// Serialize the request head as a `message/http` document, used by the
    /// TRACE echo. The body is not included.
    pub fn to_message_http(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(256);
        buffer.extend_from_slice(self.method.as_str().as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.uri.to_string().as_bytes());
        buffer.push(b' ');
        buffer.extend_from_slice(self.version_token().as_bytes());
        buffer.extend_from_slice(b"\r\n");
        self.headers.write_to(&mut buffer);
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

pub fn version_token(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Protocol minor-version token, e.g. `1.1`, as used in `Via` entries.
pub fn via_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        _ => "1.1",
    }
}

#[cfg(test)]
mod tests {
    use super::Request;
    use http::{Method, Version};

    #[test]
    fn serializes_message_http_echo() {
        let mut request = Request::new(
            Method::TRACE,
            "http://example.com/p".parse().unwrap(),
            Version::HTTP_11,
        );
        request.headers.append("Max-Forwards", "0");
        let echoed = request.to_message_http();
        let text = String::from_utf8(echoed).unwrap();
        assert!(text.starts_with("TRACE http://example.com/p HTTP/1.1\r\n"));
        assert!(text.contains("Max-Forwards: 0\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
