use anyhow::Result;
use http::{Method, StatusCode};

use crate::message::{Headers, Response};
use crate::message::request::{version_token, via_version};
use crate::util;

use super::{FilterContext, HeaderFilter, allow_header_value};

/// Hop-by-hop headers that are never forwarded, independently of what the
/// `Connection` header names (RFC 2616 §13.5.1, plus the common extensions).
const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "public",
];

/// The RFC 2616 hygiene filter, installed implicitly before any user filter
/// on both header stacks: Via/X-Forwarded-For accounting, hop-by-hop header
/// extraction, Max-Forwards handling, and diagnostic header removal.
pub struct StandardHeaderFilter;

impl HeaderFilter for StandardHeaderFilter {
    fn filter(&self, headers: &mut Headers, ctx: &mut FilterContext<'_>) -> Result<()> {
        let version = match ctx.response {
            Some(response) => response.version,
            None => ctx.request.version,
        };

        // Via: append our token to any list already present.
        if let Some(via) = ctx.proxy.via.as_deref()
            && !via.is_empty()
            && version_token(version).starts_with("HTTP/")
        {
            let entry = format!("{} {}", via_version(version), via);
            let existing = headers.get_all("Via").collect::<Vec<_>>().join(", ");
            if existing.is_empty() {
                headers.set("Via", entry);
            } else {
                headers.set("Via", format!("{existing}, {entry}"));
            }
        }

        if ctx.is_request() && ctx.proxy.x_forwarded_for {
            headers.append("X-Forwarded-For", ctx.peer.ip().to_string());
        }

        // Hop-by-hop headers move out of the message; filters and the
        // connection server reach them through the context.
        let connection_tokens = headers.connection_tokens();
        let moved = headers.remove_matching(|name| {
            HOP_BY_HOP.contains(&name) || connection_tokens.contains(name)
        });
        for line in moved {
            ctx.hop_headers.push_line(line);
        }

        if ctx.is_request() {
            self.handle_max_forwards(headers, ctx);
        }

        if ctx.response.is_some() {
            if !headers.contains("Server") {
                headers.set("Server", ctx.proxy.agent);
            }
            if !headers.contains("Date") {
                headers.set("Date", util::http_date());
            }
        }

        // Client-* diagnostics never travel, and the proxy advertises no
        // content-codings so filters always see identity bytes.
        headers.remove_matching(|name| name.starts_with("client-"));
        headers.remove("Accept-Encoding");

        Ok(())
    }
}

impl StandardHeaderFilter {
    fn handle_max_forwards(&self, headers: &mut Headers, ctx: &mut FilterContext<'_>) {
        let Some(value) = headers.get("Max-Forwards") else {
            return;
        };
        let Ok(remaining) = value.trim().parse::<u64>() else {
            return;
        };
        let method = &ctx.request.method;

        if remaining == 0 {
            if *method == Method::TRACE {
                // Echo the request back as message/http; hop-by-hop headers
                // are already set aside, so the echo shows what would have
                // been forwarded.
                let mut echo = Vec::with_capacity(256);
                echo.extend_from_slice(method.as_str().as_bytes());
                echo.push(b' ');
                echo.extend_from_slice(ctx.request.uri.to_string().as_bytes());
                echo.push(b' ');
                echo.extend_from_slice(version_token(ctx.request.version).as_bytes());
                echo.extend_from_slice(b"\r\n");
                headers.write_to(&mut echo);
                echo.extend_from_slice(b"\r\n");
                ctx.short_circuit(Response::with_body(StatusCode::OK, "message/http", echo));
            } else if *method == Method::OPTIONS {
                let mut response = Response::new(StatusCode::OK);
                response.headers.set("Allow", allow_header_value());
                response.headers.set("Content-Length", "0");
                ctx.short_circuit(response);
            }
            // RFC 2616: Max-Forwards MAY be ignored for other methods.
        } else if *method == Method::TRACE || *method == Method::OPTIONS {
            headers.set("Max-Forwards", (remaining - 1).to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use http::{Method, StatusCode, Version};

    use super::StandardHeaderFilter;
    use crate::filter::{
        FilterContext, HeaderFilter, ProxyInfo, RequestMeta, ResponseMeta,
    };
    use crate::message::{Headers, Response};

    struct Fixture {
        request: RequestMeta,
        response: Option<ResponseMeta>,
        info: ProxyInfo,
        hop: Headers,
        reply: Option<Response>,
    }

    impl Fixture {
        fn request_side(method: Method) -> Self {
            Self {
                request: RequestMeta {
                    method,
                    uri: "http://example.com/p".parse().unwrap(),
                    version: Version::HTTP_11,
                },
                response: None,
                info: ProxyInfo {
                    via: Some("proxyhost (weir/0.1.0)".to_string()),
                    x_forwarded_for: true,
                    agent: "weir/0.1.0",
                },
                hop: Headers::new(),
                reply: None,
            }
        }

        fn response_side() -> Self {
            let mut fixture = Self::request_side(Method::GET);
            fixture.response = Some(ResponseMeta {
                status: StatusCode::OK,
                version: Version::HTTP_11,
                content_type: Some("text/html".to_string()),
            });
            fixture
        }

        fn run(&mut self, headers: &mut Headers) -> Result<()> {
            let mut ctx = FilterContext {
                request: &self.request,
                response: self.response.as_ref(),
                peer: "192.0.2.7:55555".parse().unwrap(),
                hop_headers: &mut self.hop,
                reply: &mut self.reply,
                proxy: &self.info,
            };
            StandardHeaderFilter.filter(headers, &mut ctx)
        }
    }

    #[test]
    fn appends_via_token() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::GET);
        let mut headers = Headers::new();
        headers.append("Via", "1.0 upstreamproxy");
        fixture.run(&mut headers)?;
        assert_eq!(
            headers.get("Via"),
            Some("1.0 upstreamproxy, 1.1 proxyhost (weir/0.1.0)")
        );
        Ok(())
    }

    #[test]
    fn empty_via_disables_the_header() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::GET);
        fixture.info.via = Some(String::new());
        let mut headers = Headers::new();
        fixture.run(&mut headers)?;
        assert!(!headers.contains("Via"));
        Ok(())
    }

    #[test]
    fn appends_client_ip_to_x_forwarded_for() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::GET);
        let mut headers = Headers::new();
        headers.append("X-Forwarded-For", "198.51.100.1");
        fixture.run(&mut headers)?;
        let xff: Vec<_> = headers.get_all("X-Forwarded-For").collect();
        assert_eq!(xff, vec!["198.51.100.1", "192.0.2.7"]);
        Ok(())
    }

    #[test]
    fn moves_hop_by_hop_headers_to_context() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::GET);
        let mut headers = Headers::new();
        headers.append("Connection", "close, X-Custom-Hop");
        headers.append("Keep-Alive", "timeout=5");
        headers.append("X-Custom-Hop", "secret");
        headers.append("Host", "example.com");
        fixture.run(&mut headers)?;

        assert!(!headers.contains("Connection"));
        assert!(!headers.contains("Keep-Alive"));
        assert!(!headers.contains("X-Custom-Hop"));
        assert!(headers.contains("Host"));
        assert_eq!(fixture.hop.get("Connection"), Some("close, X-Custom-Hop"));
        assert_eq!(fixture.hop.get("X-Custom-Hop"), Some("secret"));
        assert!(fixture.hop.connection_tokens().contains("close"));
        Ok(())
    }

    #[test]
    fn strips_client_diagnostics_and_accept_encoding() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::GET);
        let mut headers = Headers::new();
        headers.append("Client-Date", "yesterday");
        headers.append("Client-Peer", "10.0.0.1:80");
        headers.append("Accept-Encoding", "gzip, br");
        headers.append("Accept", "text/html");
        fixture.run(&mut headers)?;
        assert!(!headers.contains("Client-Date"));
        assert!(!headers.contains("Client-Peer"));
        assert!(!headers.contains("Accept-Encoding"));
        assert!(headers.contains("Accept"));
        Ok(())
    }

    #[test]
    fn trace_with_zero_max_forwards_echoes_message_http() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::TRACE);
        fixture.info.via = None;
        fixture.info.x_forwarded_for = false;
        let mut headers = Headers::new();
        headers.append("Max-Forwards", "0");
        headers.append("X-Probe", "1");
        fixture.run(&mut headers)?;

        let reply = fixture.reply.expect("TRACE should short-circuit");
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers.get("Content-Type"), Some("message/http"));
        let body = String::from_utf8(reply.body).unwrap();
        assert!(body.starts_with("TRACE http://example.com/p HTTP/1.1\r\n"));
        assert!(body.contains("X-Probe: 1\r\n"));
        Ok(())
    }

    #[test]
    fn options_with_zero_max_forwards_lists_allowed_methods() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::OPTIONS);
        let mut headers = Headers::new();
        headers.append("Max-Forwards", "0");
        fixture.run(&mut headers)?;

        let reply = fixture.reply.expect("OPTIONS should short-circuit");
        assert_eq!(reply.status, StatusCode::OK);
        let allow = reply.headers.get("Allow").expect("Allow header");
        assert!(allow.contains("GET"));
        assert!(allow.contains("CONNECT"));
        Ok(())
    }

    #[test]
    fn positive_max_forwards_is_decremented_for_trace() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::TRACE);
        let mut headers = Headers::new();
        headers.append("Max-Forwards", "3");
        fixture.run(&mut headers)?;
        assert!(fixture.reply.is_none());
        assert_eq!(headers.get("Max-Forwards"), Some("2"));
        Ok(())
    }

    #[test]
    fn max_forwards_untouched_for_other_methods() -> Result<()> {
        let mut fixture = Fixture::request_side(Method::GET);
        let mut headers = Headers::new();
        headers.append("Max-Forwards", "0");
        fixture.run(&mut headers)?;
        assert!(fixture.reply.is_none());
        assert_eq!(headers.get("Max-Forwards"), Some("0"));
        Ok(())
    }

    #[test]
    fn backfills_server_and_date_on_responses() -> Result<()> {
        let mut fixture = Fixture::response_side();
        let mut headers = Headers::new();
        fixture.run(&mut headers)?;
        assert_eq!(headers.get("Server"), Some("weir/0.1.0"));
        assert!(headers.get("Date").unwrap().ends_with("GMT"));

        let mut headers = Headers::new();
        headers.append("Server", "origin/9");
        fixture.run(&mut headers)?;
        assert_eq!(headers.get("Server"), Some("origin/9"));
        Ok(())
    }
}
