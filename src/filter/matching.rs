use anyhow::{Context, Result, bail};
use http::Method;
use regex::{Regex, RegexBuilder};

use super::{KNOWN_METHODS, RequestMeta, ResponseMeta, SUPPORTED_SCHEMES};

#[derive(Debug, Clone)]
enum MimeRule {
    /// Match any Content-Type, present or not.
    Any,
    /// Match only messages with no Content-Type.
    Absent,
    /// `type/subtype` glob; `None` subtype means `*`.
    Glob {
        kind: String,
        subtype: Option<String>,
    },
}

/// Conjunctive match over a request (and response, at response stages),
/// deciding whether a filter participates in a message. All parsing and
/// validation happens at construction, never at serving time.
#[derive(Debug, Clone)]
pub struct MatchPredicate {
    mime: MimeRule,
    /// `None` matches any method.
    methods: Option<Vec<Method>>,
    /// `None` matches any scheme.
    schemes: Option<Vec<String>>,
    host: Regex,
    path: Regex,
    query: Regex,
}

fn match_all() -> Regex {
    Regex::new(".*").expect("literal regex")
}

impl Default for MatchPredicate {
    /// The registration defaults: `text/*` bodies of `GET`/`POST`/`HEAD`
    /// requests over `http`, any host, path, and query.
    fn default() -> Self {
        Self {
            mime: MimeRule::Glob {
                kind: "text".to_string(),
                subtype: None,
            },
            methods: Some(vec![Method::GET, Method::POST, Method::HEAD]),
            schemes: Some(vec!["http".to_string()]),
            host: match_all(),
            path: match_all(),
            query: match_all(),
        }
    }
}

impl MatchPredicate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A predicate that holds for every message, as used by the implicitly
    /// installed standard header filter.
    pub fn always() -> Self {
        Self {
            mime: MimeRule::Any,
            methods: None,
            schemes: None,
            host: match_all(),
            path: match_all(),
            query: match_all(),
        }
    }

    /// Content-Type glob: `None` matches any, the empty string matches
    /// absent, otherwise `type/subtype` where the subtype may be `*`.
    pub fn mime(mut self, value: Option<&str>) -> Result<Self> {
        self.mime = match value {
            None => MimeRule::Any,
            Some("") => MimeRule::Absent,
            Some(glob) => {
                let (kind, subtype) = glob
                    .split_once('/')
                    .with_context(|| format!("invalid MIME pattern '{glob}'"))?;
                if kind.is_empty() || subtype.is_empty() || kind == "*" {
                    bail!("invalid MIME pattern '{glob}'");
                }
                MimeRule::Glob {
                    kind: kind.to_ascii_lowercase(),
                    subtype: (subtype != "*").then(|| subtype.to_ascii_lowercase()),
                }
            }
        };
        Ok(self)
    }

    /// Comma-separated list of methods the filter applies to.
    pub fn methods(mut self, list: &str) -> Result<Self> {
        let mut methods = Vec::new();
        for token in list.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let method = KNOWN_METHODS
                .iter()
                .find(|method| method.as_str().eq_ignore_ascii_case(token))
                .with_context(|| format!("unknown method '{token}'"))?;
            methods.push(method.clone());
        }
        if methods.is_empty() {
            bail!("method list must name at least one method");
        }
        self.methods = Some(methods);
        Ok(self)
    }

    pub fn any_method(mut self) -> Self {
        self.methods = None;
        self
    }

    /// Comma-separated list of URI schemes; each must be dispatchable.
    pub fn schemes(mut self, list: &str) -> Result<Self> {
        let mut schemes = Vec::new();
        for token in list.split(',') {
            let token = token.trim().to_ascii_lowercase();
            if token.is_empty() {
                continue;
            }
            if !SUPPORTED_SCHEMES.contains(&token.as_str()) {
                bail!("scheme '{token}' is not supported by the upstream client");
            }
            schemes.push(token);
        }
        if schemes.is_empty() {
            bail!("scheme list must name at least one scheme");
        }
        self.schemes = Some(schemes);
        Ok(self)
    }

    /// Case-insensitive regex over the URI authority.
    pub fn host(mut self, pattern: &str) -> Result<Self> {
        self.host = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("invalid host pattern '{pattern}'"))?;
        Ok(self)
    }

    /// Regex over the URI path.
    pub fn path(mut self, pattern: &str) -> Result<Self> {
        self.path =
            Regex::new(pattern).with_context(|| format!("invalid path pattern '{pattern}'"))?;
        Ok(self)
    }

    /// Regex over the URI query (the empty string when absent).
    pub fn query(mut self, pattern: &str) -> Result<Self> {
        self.query =
            Regex::new(pattern).with_context(|| format!("invalid query pattern '{pattern}'"))?;
        Ok(self)
    }

    pub fn matches(&self, request: &RequestMeta, response: Option<&ResponseMeta>) -> bool {
        if let Some(methods) = &self.methods {
            if !methods.contains(&request.method) {
                return false;
            }
        }
        if let Some(schemes) = &self.schemes {
            let scheme = request.uri.scheme_str().unwrap_or("");
            if !schemes.iter().any(|candidate| candidate == scheme) {
                return false;
            }
        }
        let authority = request
            .uri
            .authority()
            .map(|authority| authority.as_str())
            .unwrap_or("");
        if !self.host.is_match(authority) {
            return false;
        }
        if !self.path.is_match(request.uri.path()) {
            return false;
        }
        if !self.query.is_match(request.uri.query().unwrap_or("")) {
            return false;
        }
        if let Some(response) = response {
            if !self.mime_matches(response.content_type.as_deref()) {
                return false;
            }
        }
        true
    }

    fn mime_matches(&self, content_type: Option<&str>) -> bool {
        match &self.mime {
            MimeRule::Any => true,
            MimeRule::Absent => content_type.map_or(true, |value| value.trim().is_empty()),
            MimeRule::Glob { kind, subtype } => {
                let Some(value) = content_type else {
                    return false;
                };
                let media = value.split(';').next().unwrap_or("").trim();
                let Some((observed_kind, observed_subtype)) = media.split_once('/') else {
                    return false;
                };
                if !observed_kind.eq_ignore_ascii_case(kind) {
                    return false;
                }
                match subtype {
                    None => true,
                    Some(subtype) => observed_subtype.eq_ignore_ascii_case(subtype),
                }
            }
        }
    }
}
