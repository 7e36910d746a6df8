pub mod matching;
pub mod stack;
pub mod standard;

use std::net::SocketAddr;

use anyhow::Result;
use http::{Method, StatusCode, Uri, Version};

use crate::message::{Headers, Response};

pub use matching::MatchPredicate;
pub use stack::{BodySession, BodyStack, FilterEntry, FilterStack, HeaderSelection, HeaderStack};
pub use standard::StandardHeaderFilter;

/// Methods the proxy forwards upstream. CONNECT is tunneled, not forwarded.
pub const PROXIED_METHODS: [Method; 7] = [
    Method::OPTIONS,
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::TRACE,
];

/// All methods the proxy understands, as advertised in `Allow`.
pub const KNOWN_METHODS: [Method; 8] = [
    Method::OPTIONS,
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::TRACE,
    Method::CONNECT,
];

/// URI schemes the upstream client can dispatch.
pub const SUPPORTED_SCHEMES: [&str; 1] = ["http"];

pub fn allow_header_value() -> String {
    KNOWN_METHODS
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Read-only view of the request a filter is working under. Available at
/// every stage, including response stages.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
}

/// Read-only view of the response at response stages. `content_type` is the
/// value observed when filters were selected.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    pub status: StatusCode,
    pub version: Version,
    pub content_type: Option<String>,
}

/// Proxy identity and policy knobs filters may consult.
#[derive(Debug, Clone)]
pub struct ProxyInfo {
    /// `Via` token; `None` disables Via handling.
    pub via: Option<String>,
    pub x_forwarded_for: bool,
    pub agent: &'static str,
}

/// Per-message context handed to header filters. Borrows the connection's
/// state: the hop-by-hop header set extracted from the current message and
/// the short-circuit reply slot.
pub struct FilterContext<'a> {
    pub request: &'a RequestMeta,
    pub response: Option<&'a ResponseMeta>,
    pub peer: SocketAddr,
    pub hop_headers: &'a mut Headers,
    pub reply: &'a mut Option<Response>,
    pub proxy: &'a ProxyInfo,
}

impl FilterContext<'_> {
    pub fn is_request(&self) -> bool {
        self.response.is_none()
    }

    /// Install a synthetic response, bypassing the upstream fetch.
    pub fn short_circuit(&mut self, response: Response) {
        *self.reply = Some(response);
    }
}

/// A filter over message headers. May rewrite the header bag or short-circuit
/// the request by installing a response on the context; never sees a body.
///
/// Filters are shared across connections, so implementations must be
/// reentrant; state scoped to one message belongs in the `begin`/`end`
/// bracket behind the filter's own synchronization.
pub trait HeaderFilter: Send + Sync {
    /// Called once per message, before the first `filter` call.
    fn begin(&self, _request: &RequestMeta, _response: Option<&ResponseMeta>) {}

    fn filter(&self, headers: &mut Headers, ctx: &mut FilterContext<'_>) -> Result<()>;

    /// Called once per message, after the last `filter` call.
    fn end(&self) {}
}

/// A streaming filter over message bodies.
///
/// `data` is the chunk in flight; the filter rewrites it in place and its
/// output is the next filter's input. Bytes the filter is not ready to emit
/// go into `carry`; they are prepended to `data` on the next invocation.
/// `carry` is `None` on the final call, when everything must be flushed
/// into `data`.
pub trait BodyFilter: Send + Sync {
    /// Called once per message, before the first `filter` call.
    fn begin(&self, _request: &RequestMeta, _response: Option<&ResponseMeta>) {}

    fn filter(
        &self,
        data: &mut Vec<u8>,
        request: &RequestMeta,
        response: Option<&ResponseMeta>,
        carry: Option<&mut Vec<u8>>,
    ) -> Result<()>;

    /// Called once per message, after the final `filter` call.
    fn end(&self) {}

    /// Whether this filter can change body length or content. A stack
    /// containing any modifying filter loses upstream `Content-Length`.
    fn will_modify(&self) -> bool {
        true
    }
}
