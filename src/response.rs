//! Deferred HTTP response and the [`IntoResponse`] conversion trait.
//!
//! A [`Response`] is a recipe, not bytes. Handlers and middleware pile up a
//! status, headers, cookies, a body and after-commit hooks; nothing reaches
//! the connection until the dispatcher calls [`Response::commit`] exactly once.
//!
//! ```rust
//! use sluice::Response;
//!
//! Response::new()
//!     .created_with(vec!["alice", "bob"])
//!     .location("/users/42")
//!     .cache_control("no-store")
//!     .after_commit(|| tracing::info!("user created"));
//! ```
//!
//! # Body kinds
//!
//! A response carries at most one body: raw bytes ([`body`](Response::body),
//! [`text`](Response::text), [`html`](Response::html)), a value serialised at
//! commit time ([`json`](Response::json)) or a writer function
//! ([`body_fn`](Response::body_fn)). Every body setter replaces whatever kind
//! was set before, content type included: the last one wins.

use std::fmt;
use std::io::{self, Write};
use std::time::SystemTime;

use bytes::Bytes;
use http::StatusCode;
use serde::Serialize;

use crate::error::{Error, ErrorBody};
use crate::sink::ResponseSink;

pub(crate) const JSON: &str = "application/json;charset=UTF-8";
const HTML: &str = "text/html;charset=UTF-8";
const TEXT: &str = "text/plain;charset=UTF-8";

/// A streaming body: called once at commit time with the connection writer.
pub type BodyFn = Box<dyn FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static>;

type Serializer = Box<dyn FnOnce() -> serde_json::Result<Vec<u8>> + Send + 'static>;
type Hook = Box<dyn FnOnce() + Send + 'static>;

enum Body {
    Empty,
    Raw(Bytes),
    Json(Serializer),
    Stream(BodyFn),
}

// ── Cookie ────────────────────────────────────────────────────────────────────

/// `SameSite` cookie attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// A `Set-Cookie` descriptor.
///
/// `max_age` follows the usual convention: `0` leaves the attribute out
/// (session cookie), a negative value emits `Max-Age=0` (delete now).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub max_age: i64,
    pub path: String,
    pub domain: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl Cookie {
    /// A session cookie scoped to `/`.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            max_age: 0,
            path: "/".to_owned(),
            domain: String::new(),
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = seconds;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = Some(same_site);
        self
    }

    fn has_valid_name(&self) -> bool {
        !self.name.is_empty() && self.name.bytes().all(is_token_byte)
    }
}

/// Serialises as a `Set-Cookie` header value. Bytes that are not valid in a
/// cookie value are dropped; values with spaces or commas are quoted.
impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: String = self
            .value
            .chars()
            .filter(|&c| c == ' ' || c == ',' || (c.is_ascii() && is_cookie_octet(c as u8)))
            .collect();
        if value.contains([' ', ',']) {
            write!(f, "{}=\"{value}\"", self.name)?;
        } else {
            write!(f, "{}={value}", self.name)?;
        }
        if !self.path.is_empty() {
            write!(f, "; Path={}", self.path)?;
        }
        if !self.domain.is_empty() {
            write!(f, "; Domain={}", self.domain.trim_start_matches('.'))?;
        }
        match self.max_age {
            0 => {}
            n if n < 0 => f.write_str("; Max-Age=0")?,
            n => write!(f, "; Max-Age={n}")?,
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        match self.same_site {
            Some(SameSite::Strict) => f.write_str("; SameSite=Strict")?,
            Some(SameSite::Lax) => f.write_str("; SameSite=Lax")?,
            Some(SameSite::None) => f.write_str("; SameSite=None")?,
            None => {}
        }
        Ok(())
    }
}

fn is_cookie_octet(b: u8) -> bool {
    matches!(b, 0x21 | 0x23..=0x2b | 0x2d..=0x3a | 0x3c..=0x5b | 0x5d..=0x7e)
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

// ── Response ──────────────────────────────────────────────────────────────────

/// A pending HTTP response.
///
/// Every mutator takes `self` and returns it, so calls chain. Defaults to
/// `200 OK` with no headers and no body.
pub struct Response {
    status: StatusCode,
    headers: Vec<(String, String)>,
    cookies: Vec<Cookie>,
    body: Body,
    after_commit: Vec<Hook>,
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: Body::Empty,
            after_commit: Vec::new(),
        }
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Accumulated headers, in the order they will be written.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// First value of a header, case-insensitive.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn has_body(&self) -> bool {
        !matches!(self.body, Body::Empty)
    }

    // ── Status ────────────────────────────────────────────────────────────────

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    // Each shorthand comes as a pair: `x()` only sets the status and leaves
    // any earlier body alone, `x_with(body)` also replaces the body.
    fn status_with_body<T>(self, status: StatusCode, body: T) -> Self
    where
        T: Serialize + Send + 'static,
    {
        self.status(status).json(body)
    }

    pub fn created(self) -> Self {
        self.status(StatusCode::CREATED)
    }

    pub fn created_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::CREATED, body)
    }

    pub fn no_content(self) -> Self {
        self.status(StatusCode::NO_CONTENT)
    }

    pub fn moved_permanently(self, location: &str) -> Self {
        self.status(StatusCode::MOVED_PERMANENTLY).location(location)
    }

    pub fn found(self, location: &str) -> Self {
        self.status(StatusCode::FOUND).location(location)
    }

    pub fn not_modified(self) -> Self {
        self.status(StatusCode::NOT_MODIFIED)
    }

    pub fn bad_request(self) -> Self {
        self.status(StatusCode::BAD_REQUEST)
    }

    pub fn bad_request_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::BAD_REQUEST, body)
    }

    pub fn unauthorized(self) -> Self {
        self.status(StatusCode::UNAUTHORIZED)
    }

    pub fn unauthorized_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::UNAUTHORIZED, body)
    }

    pub fn forbidden(self) -> Self {
        self.status(StatusCode::FORBIDDEN)
    }

    pub fn forbidden_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::FORBIDDEN, body)
    }

    pub fn not_found(self) -> Self {
        self.status(StatusCode::NOT_FOUND)
    }

    pub fn not_found_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::NOT_FOUND, body)
    }

    pub fn method_not_allowed(self) -> Self {
        self.status(StatusCode::METHOD_NOT_ALLOWED)
    }

    pub fn method_not_allowed_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::METHOD_NOT_ALLOWED, body)
    }

    pub fn not_acceptable(self) -> Self {
        self.status(StatusCode::NOT_ACCEPTABLE)
    }

    pub fn not_acceptable_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::NOT_ACCEPTABLE, body)
    }

    pub fn proxy_auth_required(self) -> Self {
        self.status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
    }

    pub fn proxy_auth_required_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::PROXY_AUTHENTICATION_REQUIRED, body)
    }

    pub fn conflict(self) -> Self {
        self.status(StatusCode::CONFLICT)
    }

    pub fn conflict_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::CONFLICT, body)
    }

    pub fn precondition_failed(self) -> Self {
        self.status(StatusCode::PRECONDITION_FAILED)
    }

    pub fn internal_server_error(self) -> Self {
        self.status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn internal_server_error_with<T: Serialize + Send + 'static>(self, body: T) -> Self {
        self.status_with_body(StatusCode::INTERNAL_SERVER_ERROR, body)
    }

    /// `500` with an [`ErrorBody`] carrying `err` as its message.
    pub fn error(self, err: impl fmt::Display) -> Self {
        self.internal_server_error_with(ErrorBody::new("InternalServerError", err.to_string()))
    }

    /// Shorthand for a status plus an [`ErrorBody`].
    pub fn error_body(self, status: StatusCode, code: &str, message: &str) -> Self {
        self.status(status).json(ErrorBody::new(code, message))
    }

    // ── Headers ───────────────────────────────────────────────────────────────

    /// Sets a header, replacing every earlier value under the same name.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        match self.headers.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(first) => {
                self.headers[first].1 = value;
                let mut i = 0;
                self.headers.retain(|(k, _)| {
                    i += 1;
                    i - 1 == first || !k.eq_ignore_ascii_case(name)
                });
            }
            None => self.headers.push((name.to_owned(), value)),
        }
        self
    }

    /// Adds a header line, keeping earlier values under the same name.
    pub fn add_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_owned(), value.into()));
        self
    }

    pub fn content_type(self, content_type: &str) -> Self {
        self.header("Content-Type", content_type)
    }

    pub fn location(self, location: &str) -> Self {
        self.header("Location", location)
    }

    pub fn cache_control(self, directive: &str) -> Self {
        self.header("Cache-Control", directive)
    }

    /// Wraps `etag` in quotes.
    pub fn etag(self, etag: &str) -> Self {
        self.header("ETag", format!("\"{etag}\""))
    }

    pub fn last_modified(self, time: SystemTime) -> Self {
        self.header("Last-Modified", httpdate::fmt_http_date(time))
    }

    pub fn expires(self, time: SystemTime) -> Self {
        self.header("Expires", httpdate::fmt_http_date(time))
    }

    pub fn date(self, time: SystemTime) -> Self {
        self.header("Date", httpdate::fmt_http_date(time))
    }

    /// # Panics
    ///
    /// Panics if `delta_seconds` is negative.
    pub fn age(self, delta_seconds: i64) -> Self {
        assert!(delta_seconds >= 0, "age must be greater than or equal to 0, got {delta_seconds}");
        self.header("Age", delta_seconds.to_string())
    }

    pub fn vary(self, headers: &[&str]) -> Self {
        self.header("Vary", headers.join(", "))
    }

    pub fn allow(self, methods: &[&str]) -> Self {
        self.header("Allow", methods.join(", "))
    }

    /// Appends a `Via` hop instead of replacing earlier ones.
    pub fn via(self, via: &str) -> Self {
        self.add_header("Via", via)
    }

    pub fn accept_ranges(self) -> Self {
        self.header("Accept-Ranges", "bytes")
    }

    pub fn content_range(self, value: &str) -> Self {
        self.header("Content-Range", value)
    }

    pub fn content_disposition(self, disposition: &str) -> Self {
        self.header("Content-Disposition", disposition)
    }

    pub fn content_encoding(self, encoding: &str) -> Self {
        self.header("Content-Encoding", encoding)
    }

    pub fn content_language(self, language: &str) -> Self {
        self.header("Content-Language", language)
    }

    pub fn www_authenticate(self, challenge: &str) -> Self {
        self.header("WWW-Authenticate", challenge)
    }

    pub fn proxy_authenticate(self, challenge: &str) -> Self {
        self.header("Proxy-Authenticate", challenge)
    }

    pub fn retry_after_seconds(self, seconds: u64) -> Self {
        self.header("Retry-After", seconds.to_string())
    }

    pub fn retry_after_date(self, time: SystemTime) -> Self {
        self.header("Retry-After", httpdate::fmt_http_date(time))
    }

    /// `Refresh: <seconds>` or `Refresh: <seconds>;url=<url>`.
    pub fn refresh(self, seconds: u64, url: Option<&str>) -> Self {
        match url {
            Some(url) => self.header("Refresh", format!("{seconds};url={url}")),
            None => self.header("Refresh", seconds.to_string()),
        }
    }

    pub fn access_control_allow_credentials(self) -> Self {
        self.header("Access-Control-Allow-Credentials", "true")
    }

    pub fn access_control_allow_headers(self, headers: &[&str]) -> Self {
        self.header("Access-Control-Allow-Headers", headers.join(", "))
    }

    pub fn access_control_allow_methods(self, methods: &[&str]) -> Self {
        self.header("Access-Control-Allow-Methods", methods.join(", "))
    }

    pub fn access_control_allow_origin(self, origin: &str) -> Self {
        self.header("Access-Control-Allow-Origin", origin)
    }

    pub fn access_control_expose_headers(self, headers: &[&str]) -> Self {
        self.header("Access-Control-Expose-Headers", headers.join(", "))
    }

    /// # Panics
    ///
    /// Panics if `max_age` is negative.
    pub fn access_control_max_age(self, max_age: i64) -> Self {
        assert!(max_age >= 0, "max_age must be greater than or equal to 0, got {max_age}");
        self.header("Access-Control-Max-Age", max_age.to_string())
    }

    pub fn content_security_policy(self, directive: &str) -> Self {
        self.header("Content-Security-Policy", directive)
    }

    pub fn strict_transport_security(self, value: &str) -> Self {
        self.header("Strict-Transport-Security", value)
    }

    pub fn referrer_policy(self, policy: &str) -> Self {
        self.header("Referrer-Policy", policy)
    }

    pub fn x_content_type_options(self) -> Self {
        self.header("X-Content-Type-Options", "nosniff")
    }

    pub fn x_frame_options(self, directive: &str) -> Self {
        self.header("X-Frame-Options", directive)
    }

    pub fn server_timing(self, timing: &str) -> Self {
        self.header("Server-Timing", timing)
    }

    // htmx response headers

    pub fn hx_location(self, location: &str) -> Self {
        self.header("HX-Location", location)
    }

    pub fn hx_push_url(self, url: &str) -> Self {
        self.header("HX-Push-Url", url)
    }

    pub fn hx_redirect(self, location: &str) -> Self {
        self.header("HX-Redirect", location)
    }

    pub fn hx_refresh(self) -> Self {
        self.header("HX-Refresh", "true")
    }

    pub fn hx_replace_url(self, url: &str) -> Self {
        self.header("HX-Replace-Url", url)
    }

    pub fn hx_reswap(self, value: &str) -> Self {
        self.header("HX-Reswap", value)
    }

    pub fn hx_retarget(self, selector: &str) -> Self {
        self.header("HX-Retarget", selector)
    }

    pub fn hx_trigger(self, event: &str) -> Self {
        self.header("HX-Trigger", event)
    }

    // ── Cookies ───────────────────────────────────────────────────────────────

    /// Queues a `Set-Cookie` line. Cookies with an invalid name are dropped
    /// at commit time.
    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    // ── Body ──────────────────────────────────────────────────────────────────

    /// Serialises `value` as JSON when the response is committed.
    pub fn json<T: Serialize + Send + 'static>(mut self, value: T) -> Self {
        self.body = Body::Json(Box::new(move || serde_json::to_vec(&value)));
        self.content_type(JSON)
    }

    pub fn html(mut self, html: impl Into<String>) -> Self {
        self.body = Body::Raw(Bytes::from(html.into()));
        self.content_type(HTML)
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Raw(Bytes::from(text.into()));
        self.content_type(TEXT)
    }

    pub fn body(mut self, content_type: &str, data: impl Into<Bytes>) -> Self {
        self.body = Body::Raw(data.into());
        self.content_type(content_type)
    }

    /// Streams the body from `write` at commit time.
    pub fn body_fn<F>(mut self, content_type: &str, write: F) -> Self
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()> + Send + 'static,
    {
        self.body = Body::Stream(Box::new(write));
        self.content_type(content_type)
    }

    // ── Commit ────────────────────────────────────────────────────────────────

    /// Runs `hook` after the response has been committed, whether or not the
    /// write succeeded. Hooks run in registration order.
    pub fn after_commit(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.after_commit.push(Box::new(hook));
        self
    }

    /// Writes headers, cookies, status and body to `sink`, in that order.
    ///
    /// A JSON body is serialised before the status goes out, so a
    /// serialisation failure leaves the sink without a status. After-commit
    /// hooks run once this returns, success or not.
    pub fn commit<S: ResponseSink>(self, sink: &mut S) -> Result<(), Error> {
        let Self { status, headers, cookies, body, after_commit } = self;
        let _hooks = AfterCommit(after_commit);

        for (name, value) in &headers {
            sink.append_header(name, value)?;
        }
        for cookie in &cookies {
            if !cookie.has_valid_name() {
                tracing::warn!(name = %cookie.name, "dropping cookie with invalid name");
                continue;
            }
            sink.append_header("Set-Cookie", &cookie.to_string())?;
        }

        let body = match body {
            Body::Json(serialize) => Body::Raw(Bytes::from(serialize()?)),
            other => other,
        };

        sink.write_head(status)?;
        match body {
            Body::Stream(write) => write(&mut *sink)?,
            Body::Raw(bytes) => sink.write_all(&bytes)?,
            Body::Empty | Body::Json(_) => {}
        }
        sink.flush()?;
        Ok(())
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match self.body {
            Body::Empty => "empty",
            Body::Raw(_) => "raw",
            Body::Json(_) => "json",
            Body::Stream(_) => "stream",
        };
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("body", &body)
            .field("after_commit", &self.after_commit.len())
            .finish()
    }
}

/// Runs the hooks when dropped, so they fire even if the body writer unwinds.
struct AfterCommit(Vec<Hook>);

impl Drop for AfterCommit {
    fn drop(&mut self) {
        for hook in self.0.drain(..) {
            hook();
        }
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into an HTTP [`Response`].
///
/// Implemented for `Response`, `StatusCode`, strings, and `Result<T, E>` where
/// both sides convert, which lets handlers short-circuit with `?` on the
/// `Result<_, Response>` helpers of [`Context`](crate::Context).
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response { Response::new().text(self) }
}

impl IntoResponse for String {
    fn into_response(self) -> Response { Response::new().text(self) }
}

/// Return a status directly from a handler: `return StatusCode::NO_CONTENT`
impl IntoResponse for StatusCode {
    fn into_response(self) -> Response { Response::new().status(self) }
}

impl<T: IntoResponse, E: IntoResponse> IntoResponse for Result<T, E> {
    fn into_response(self) -> Response {
        match self {
            Ok(v) => v.into_response(),
            Err(e) => e.into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;
    use crate::sink::{BufferedSink, WireSink};

    fn committed(res: Response) -> BufferedSink {
        let mut sink = BufferedSink::new();
        res.commit(&mut sink).unwrap();
        sink
    }

    struct BrokenPipe(BufferedSink);

    impl ResponseSink for BrokenPipe {
        fn append_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
            self.0.append_header(name, value)
        }
        fn write_head(&mut self, status: StatusCode) -> Result<(), Error> {
            self.0.write_head(status)
        }
    }

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn defaults_to_empty_200() {
        let sink = committed(Response::new());
        assert_eq!(sink.status(), Some(StatusCode::OK));
        assert!(sink.headers().is_empty());
        assert!(sink.body().is_empty());
    }

    #[test]
    fn raw_body_set_after_json_wins() {
        let sink = committed(Response::new().json(serde_json::json!({"a": 1})).text("plain"));
        assert_eq!(sink.body(), b"plain");
        assert_eq!(sink.headers()["content-type"], TEXT);
        assert_eq!(sink.headers().get_all("content-type").iter().count(), 1);
    }

    #[test]
    fn json_body_set_after_stream_wins() {
        let res = Response::new()
            .body_fn("text/csv", |w| w.write_all(b"a,b"))
            .json(vec![1, 2]);
        let sink = committed(res);
        assert_eq!(sink.body(), b"[1,2]");
        assert_eq!(sink.headers()["content-type"], JSON);
    }

    #[test]
    fn stream_body_is_written_through_the_sink() {
        let sink = committed(Response::new().body_fn("text/csv", |w| {
            w.write_all(b"a,b\n")?;
            w.write_all(b"1,2\n")
        }));
        assert_eq!(sink.body(), b"a,b\n1,2\n");
        assert_eq!(sink.headers()["content-type"], "text/csv");
    }

    #[test]
    fn json_round_trips_common_values() {
        let value = serde_json::json!({
            "object": {"nested": true},
            "array": [1, "two", 3.5],
            "string": "s",
            "number": -7,
            "bool": false,
            "null": null,
        });
        let sink = committed(Response::new().json(value.clone()));
        let back: serde_json::Value = serde_json::from_slice(sink.body()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn shorthand_without_body_keeps_earlier_body() {
        let sink = committed(Response::new().text("kept").not_found());
        assert_eq!(sink.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(sink.body(), b"kept");
    }

    #[test]
    fn shorthand_with_body_sets_json() {
        let sink = committed(Response::new().bad_request_with(ErrorBody::new("BadRequest", "nope")));
        assert_eq!(sink.status(), Some(StatusCode::BAD_REQUEST));
        assert_eq!(sink.body(), br#"{"code":"BadRequest","message":"nope"}"#);
    }

    #[test]
    fn header_replaces_but_add_header_accumulates() {
        let res = Response::new()
            .header("X-A", "1")
            .via("1.1 a")
            .header("x-a", "2")
            .via("1.1 b");
        assert_eq!(
            res.headers(),
            [
                ("X-A".to_owned(), "2".to_owned()),
                ("Via".to_owned(), "1.1 a".to_owned()),
                ("Via".to_owned(), "1.1 b".to_owned()),
            ]
        );
    }

    #[test]
    fn commit_writes_headers_in_order_then_cookies() {
        let res = Response::new()
            .status(StatusCode::ACCEPTED)
            .header("X-First", "1")
            .via("a")
            .via("b")
            .cookie(Cookie::new("sid", "abc").max_age(60).http_only(true))
            .cookie(Cookie::new("theme", "dark"))
            .text("ok");
        let mut sink = WireSink::new(Vec::new());
        res.commit(&mut sink).unwrap();
        let wire = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            wire,
            "HTTP/1.1 202 Accepted\r\n\
             X-First: 1\r\n\
             Via: a\r\n\
             Via: b\r\n\
             Content-Type: text/plain;charset=UTF-8\r\n\
             Set-Cookie: sid=abc; Path=/; Max-Age=60; HttpOnly\r\n\
             Set-Cookie: theme=dark; Path=/\r\n\
             \r\n\
             ok"
        );
    }

    #[test]
    fn after_commit_runs_in_order_once_after_the_write() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (Arc::clone(&log), Arc::clone(&log));
        let res = Response::new()
            .after_commit(move || a.lock().unwrap().push("first"))
            .after_commit(move || b.lock().unwrap().push("second"));
        assert!(log.lock().unwrap().is_empty());

        committed(res);
        assert_eq!(*log.lock().unwrap(), ["first", "second"]);
    }

    #[test]
    fn after_commit_runs_when_the_body_write_fails() {
        let ran = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&ran);
        let res = Response::new()
            .text("lost")
            .after_commit(move || *counter.lock().unwrap() += 1);

        let mut sink = BrokenPipe(BufferedSink::new());
        let err = res.commit(&mut sink).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(sink.0.status(), Some(StatusCode::OK));
        assert_eq!(*ran.lock().unwrap(), 1);
    }

    #[test]
    fn serialisation_failure_happens_before_the_status() {
        struct Unserialisable;
        impl Serialize for Unserialisable {
            fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
                Err(serde::ser::Error::custom("no"))
            }
        }

        let mut sink = BufferedSink::new();
        let err = Response::new().json(Unserialisable).commit(&mut sink).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert_eq!(sink.status(), None);
    }

    #[test]
    fn invalid_cookie_names_are_dropped() {
        let sink = committed(Response::new().cookie(Cookie::new("bad name", "v")));
        assert!(sink.headers().get("set-cookie").is_none());
    }

    #[test]
    fn cookie_values_are_sanitised() {
        let cookie = Cookie::new("a", "x;y\"z")
            .domain(".example.com")
            .max_age(-1)
            .secure(true)
            .same_site(SameSite::Lax);
        assert_eq!(
            cookie.to_string(),
            "a=xyz; Path=/; Domain=example.com; Max-Age=0; Secure; SameSite=Lax"
        );
        assert_eq!(Cookie::new("a", "b c").path("").to_string(), "a=\"b c\"");
    }

    #[test]
    fn etag_and_dates_are_formatted() {
        let t = UNIX_EPOCH + Duration::from_secs(784_111_777);
        let res = Response::new().etag("v1").last_modified(t);
        assert_eq!(res.header_value("etag"), Some("\"v1\""));
        assert_eq!(res.header_value("last-modified"), Some("Sun, 06 Nov 1994 08:49:37 GMT"));
    }

    #[test]
    #[should_panic(expected = "age must be greater than or equal to 0")]
    fn negative_age_panics() {
        let _ = Response::new().age(-1);
    }

    #[test]
    #[should_panic(expected = "max_age must be greater than or equal to 0")]
    fn negative_access_control_max_age_panics() {
        let _ = Response::new().access_control_max_age(-5);
    }

    #[test]
    fn result_converts_either_side() {
        let ok: Result<&'static str, Response> = Ok("fine");
        assert_eq!(ok.into_response().status_code(), StatusCode::OK);

        let err: Result<Response, StatusCode> = Err(StatusCode::GONE);
        assert_eq!(err.into_response().status_code(), StatusCode::GONE);
    }
}
