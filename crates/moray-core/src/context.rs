//! Per-request context handed to filters

use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{HeaderName, HeaderValue, Request, Response, Uri};
use http_body_util::Full;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::error;

/// Body type alias
pub type Body = Full<Bytes>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Context attached to each request for the duration of pipeline handling.
///
/// The context owns the HTTP request, collects log tags, and carries the
/// cancellation flag. Filters may mutate the request (headers, path) or
/// short-circuit it by setting a response.
#[derive(Debug)]
pub struct RequestContext {
    id: u64,
    request: Request<Body>,
    response: Option<Response<Body>>,
    tags: Vec<String>,
    cancelled: AtomicBool,
}

impl RequestContext {
    /// Wrap an HTTP request into a fresh context
    pub fn new(request: Request<Body>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            request,
            response: None,
            tags: Vec::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Identity of this context, unique within the process.
    ///
    /// Used as the key of the per-request pipeline context table.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying request
    pub fn request(&self) -> &Request<Body> {
        &self.request
    }

    /// Mutable access to the underlying request
    pub fn request_mut(&mut self) -> &mut Request<Body> {
        &mut self.request
    }

    /// Request method as a string slice
    pub fn method(&self) -> &str {
        self.request.method().as_str()
    }

    /// Request path
    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    /// Rewrite the request path, preserving the query string.
    ///
    /// An unparsable path leaves the request untouched.
    pub fn set_path(&mut self, path: &str) {
        let path_and_query = match self.request.uri().query() {
            Some(q) => format!("{path}?{q}"),
            None => path.to_string(),
        };
        let path_and_query = match path_and_query.parse::<PathAndQuery>() {
            Ok(pq) => pq,
            Err(e) => {
                error!(path, error = %e, "rejecting invalid rewritten path");
                return;
            }
        };

        let mut parts = self.request.uri().clone().into_parts();
        parts.path_and_query = Some(path_and_query);
        match Uri::from_parts(parts) {
            Ok(uri) => *self.request.uri_mut() = uri,
            Err(e) => error!(path, error = %e, "rejecting invalid rewritten URI"),
        }
    }

    /// First value of the named request header, if it is valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
    }

    /// Set a request header, replacing any previous value.
    ///
    /// Invalid header names or values are dropped with a log line; filters
    /// use this for outbound annotations and must not fail the request on a
    /// bad annotation.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let name = match name.parse::<HeaderName>() {
            Ok(n) => n,
            Err(e) => {
                error!(header = name, error = %e, "invalid header name");
                return;
            }
        };
        let value = match HeaderValue::from_str(value) {
            Ok(v) => v,
            Err(e) => {
                error!(header = %name, error = %e, "invalid header value");
                return;
            }
        };
        self.request.headers_mut().insert(name, value);
    }

    /// Value of the named cookie from the `Cookie` request header
    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.header(http::header::COOKIE.as_str())?;
        for pair in raw.split(';') {
            if let Some((k, v)) = pair.trim().split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
        None
    }

    /// Attach a log tag to this request
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    /// Tags accumulated so far
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Short-circuit the request with a response
    pub fn set_response(&mut self, response: Response<Body>) {
        self.response = Some(response);
    }

    /// The short-circuit response, if any filter set one
    pub fn response(&self) -> Option<&Response<Body>> {
        self.response.as_ref()
    }

    /// Mark the request as cancelled.
    ///
    /// Filters performing I/O check [`RequestContext::is_cancelled`] and
    /// return promptly; the pipeline engine itself does not check it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Whether the request has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_for(uri: &str) -> RequestContext {
        let req = Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap();
        RequestContext::new(req)
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ctx_for("http://example.com/");
        let b = ctx_for("http://example.com/");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_set_path_preserves_query() {
        let mut ctx = ctx_for("http://example.com/old?a=1");
        ctx.set_path("/new");
        assert_eq!(ctx.path(), "/new");
        assert_eq!(ctx.request().uri().query(), Some("a=1"));
    }

    #[test]
    fn test_headers_roundtrip() {
        let mut ctx = ctx_for("http://example.com/");
        assert_eq!(ctx.header("X-Test"), None);
        ctx.set_header("X-Test", "value");
        assert_eq!(ctx.header("X-Test"), Some("value"));
    }

    #[test]
    fn test_cookie_lookup() {
        let mut ctx = ctx_for("http://example.com/");
        ctx.set_header("Cookie", "auth=token123; theme=dark");
        assert_eq!(ctx.cookie("auth").as_deref(), Some("token123"));
        assert_eq!(ctx.cookie("theme").as_deref(), Some("dark"));
        assert_eq!(ctx.cookie("missing"), None);
    }

    #[test]
    fn test_tags_accumulate() {
        let mut ctx = ctx_for("http://example.com/");
        ctx.add_tag("first");
        ctx.add_tag("second");
        assert_eq!(ctx.tags(), &["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_cancellation_flag() {
        let ctx = ctx_for("http://example.com/");
        assert!(!ctx.is_cancelled());
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }
}
