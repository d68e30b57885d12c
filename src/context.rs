//! Per-request context.
//!
//! A [`Context`] is created once per request, moved through every middleware
//! into the handler, and dropped when the handler returns. It wraps the
//! request head, the unread body, the path values captured by the router and
//! the frozen [`Config`], and it carries a typed key/value store middleware
//! can use to hand data down the chain.
//!
//! Anything derived from the request is computed lazily and at most once:
//!
//! | derived value  | computed on first call to              |
//! |----------------|----------------------------------------|
//! | address chain  | `client_ip`, `remote_ip`, `ips`        |
//! | query values   | `query`, `has_query`, `int_query`, …   |
//! | body bytes     | `raw_body`, `bind_json`, `form_values` |
//! | form values    | `form_values`, `form_value`            |
//!
//! Helpers that can reject a request return `Result<_, Response>`; the error
//! side is the finished rejection, so a handler returning
//! `Result<Response, Response>` can simply use `?`.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::request::Parts;
use http::{HeaderMap, StatusCode, Uri};
use http_body_util::BodyExt;
use http_body_util::combinators::UnsyncBoxBody;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::config::Config;
use crate::error::{BoxError, Error};
use crate::method::Method;
use crate::response::Response;
use crate::validation::{Validate, ValidationError};

/// The request body type every [`Context`] is built from.
pub type Body = UnsyncBoxBody<Bytes, BoxError>;

/// Boxes any `Bytes` body, e.g. hyper's `Incoming` or `Full<Bytes>`.
pub fn box_body<B>(body: B) -> Body
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

// ── Values ────────────────────────────────────────────────────────────────────

/// An ordered multimap of decoded query or form pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values(Vec<(String, String)>);

impl Values {
    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in request order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0.iter().filter(move |(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<(String, String)>> for Values {
    fn from(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }
}

/// Returned by [`Context::get`] when a stored value has another type.
#[derive(Debug, thiserror::Error)]
#[error("value for key '{key}' is not a `{expected}`")]
pub struct TypeMismatch {
    pub key: String,
    pub expected: &'static str,
}

// ── Context ───────────────────────────────────────────────────────────────────

enum RequestBody {
    Unread(Body),
    Read(Bytes),
    // The stream broke; the message is replayed to every later reader.
    Failed(String),
}

/// Everything a handler knows about the request it is serving.
pub struct Context {
    config: Arc<Config>,
    parts: Parts,
    // Only ever touched through `&mut self`; the mutex makes `Context: Sync`
    // without requiring a `Sync` body stream.
    body: Mutex<RequestBody>,
    remote_addr: String,
    path_values: HashMap<String, String>,
    ips: OnceLock<Vec<String>>,
    query: OnceLock<Values>,
    form: Option<Values>,
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Context {
    /// Wraps a request received from `remote_addr` (`host:port` of the socket
    /// peer). The server does this for you; it is public so handlers can be
    /// exercised without a listener.
    pub fn new(req: http::Request<Body>, remote_addr: impl Into<String>, config: Arc<Config>) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            config,
            parts,
            body: Mutex::new(RequestBody::Unread(body)),
            remote_addr: remote_addr.into(),
            path_values: HashMap::new(),
            ips: OnceLock::new(),
            query: OnceLock::new(),
            form: None,
            values: HashMap::new(),
        }
    }

    pub(crate) fn with_path_values(mut self, path_values: HashMap<String, String>) -> Self {
        self.path_values = path_values;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn method(&self) -> &http::Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn path(&self) -> &str {
        self.parts.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// The raw `host:port` of the socket peer.
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// A value captured by a `{name}` or `{*name}` segment of the route.
    pub fn path_value(&self, name: &str) -> Option<&str> {
        self.path_values.get(name).map(String::as_str)
    }

    // ── Client addresses ──────────────────────────────────────────────────────

    /// The full address chain, most-forwarded first. Never empty.
    ///
    /// Resolved on the first call and reused afterwards.
    pub fn ips(&self) -> &[String] {
        self.ips.get_or_init(|| {
            let ips = self.config.ip_resolver().resolve(&self.parts.headers, &self.remote_addr);
            if ips.is_empty() { vec![String::new()] } else { ips }
        })
    }

    /// The address the client claims to have. Only trustworthy when every
    /// proxy in front of the server rewrites the forwarding headers.
    pub fn client_ip(&self) -> &str {
        &self.ips()[0]
    }

    /// The nearest hop: the socket peer when headers are untrusted.
    pub fn remote_ip(&self) -> &str {
        let ips = self.ips();
        &ips[ips.len() - 1]
    }

    // ── Query ─────────────────────────────────────────────────────────────────

    pub fn query_values(&self) -> &Values {
        self.query.get_or_init(|| {
            let raw = self.parts.uri.query().unwrap_or_default();
            serde_urlencoded::from_str::<Vec<(String, String)>>(raw)
                .map(Values)
                .unwrap_or_default()
        })
    }

    /// First decoded value of a query parameter.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query_values().get(key)
    }

    pub fn has_query(&self, key: &str) -> bool {
        self.query_values().contains_key(key)
    }

    /// Integer query parameter, `0` when absent or empty.
    pub fn int_query(&self, key: &str) -> Result<i64, Response> {
        self.int_query_or(key, 0)
    }

    /// Integer query parameter, `default` when absent or empty. A value that
    /// is not an integer is rejected with `400`.
    pub fn int_query_or(&self, key: &str, default: i64) -> Result<i64, Response> {
        match self.query(key) {
            None | Some("") => Ok(default),
            Some(raw) => raw.parse().map_err(|_| {
                Response::new().error_body(
                    StatusCode::BAD_REQUEST,
                    "BadRequest",
                    &format!("invalid value for '{key}'"),
                )
            }),
        }
    }

    // ── Headers ───────────────────────────────────────────────────────────────

    /// First value of a header, case-insensitive. `None` when absent or not
    /// visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Every value of a header, in request order.
    pub fn header_values(&self, name: &str) -> impl Iterator<Item = &str> {
        self.parts.headers.get_all(name).iter().filter_map(|v| v.to_str().ok())
    }

    pub fn accept(&self) -> Option<&str> {
        self.header("Accept")
    }

    pub fn accept_encoding(&self) -> Option<&str> {
        self.header("Accept-Encoding")
    }

    pub fn accept_language(&self) -> Option<&str> {
        self.header("Accept-Language")
    }

    pub fn authorization(&self) -> Option<&str> {
        self.header("Authorization")
    }

    pub fn proxy_authorization(&self) -> Option<&str> {
        self.header("Proxy-Authorization")
    }

    pub fn cache_control(&self) -> Option<&str> {
        self.header("Cache-Control")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// `None` when absent or not a number.
    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")?.parse().ok()
    }

    pub fn host(&self) -> Option<&str> {
        self.header("Host").or_else(|| self.parts.uri.host())
    }

    pub fn origin(&self) -> Option<&str> {
        self.header("Origin")
    }

    pub fn referer(&self) -> Option<&str> {
        self.header("Referer")
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("User-Agent")
    }

    pub fn access_control_request_method(&self) -> Option<&str> {
        self.header("Access-Control-Request-Method")
    }

    /// The comma-separated list split into names.
    pub fn access_control_request_headers(&self) -> Vec<&str> {
        self.header("Access-Control-Request-Headers")
            .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    /// `Date` header, `None` when absent or malformed.
    pub fn date(&self) -> Option<SystemTime> {
        httpdate::parse_http_date(self.header("Date")?).ok()
    }

    pub fn sec_fetch_site(&self) -> Option<&str> {
        self.header("Sec-Fetch-Site")
    }

    pub fn sec_fetch_mode(&self) -> Option<&str> {
        self.header("Sec-Fetch-Mode")
    }

    pub fn sec_fetch_dest(&self) -> Option<&str> {
        self.header("Sec-Fetch-Dest")
    }

    pub fn sec_fetch_user(&self) -> bool {
        self.header("Sec-Fetch-User") == Some("?1")
    }

    // htmx request headers

    pub fn hx_boosted(&self) -> bool {
        self.header("HX-Boosted") == Some("true")
    }

    pub fn hx_current_url(&self) -> Option<&str> {
        self.header("HX-Current-URL")
    }

    pub fn hx_history_restore_request(&self) -> bool {
        self.header("HX-History-Restore-Request") == Some("true")
    }

    pub fn hx_prompt(&self) -> Option<&str> {
        self.header("HX-Prompt")
    }

    pub fn hx_request(&self) -> bool {
        self.header("HX-Request") == Some("true")
    }

    pub fn hx_target(&self) -> Option<&str> {
        self.header("HX-Target")
    }

    pub fn hx_trigger(&self) -> Option<&str> {
        self.header("HX-Trigger")
    }

    pub fn hx_trigger_name(&self) -> Option<&str> {
        self.header("HX-Trigger-Name")
    }

    // ── Cookies ───────────────────────────────────────────────────────────────

    /// Every `name=value` pair across all `Cookie` headers. Surrounding
    /// double quotes are stripped from values; malformed pairs are skipped.
    pub fn cookies(&self) -> Vec<(&str, &str)> {
        self.header_values("Cookie")
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                Some((name, value))
            })
            .collect()
    }

    /// The first cookie called `name`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().into_iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    // ── Conditional requests ──────────────────────────────────────────────────

    pub fn if_match(&self) -> Option<&str> {
        self.header("If-Match")
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.header("If-None-Match")
    }

    /// `Ok(None)` when the header is absent or empty.
    pub fn if_modified_since(&self) -> Result<Option<SystemTime>, httpdate::Error> {
        self.http_date("If-Modified-Since")
    }

    /// `Ok(None)` when the header is absent or empty.
    pub fn if_unmodified_since(&self) -> Result<Option<SystemTime>, httpdate::Error> {
        self.http_date("If-Unmodified-Since")
    }

    fn http_date(&self, name: &str) -> Result<Option<SystemTime>, httpdate::Error> {
        match self.header(name) {
            None | Some("") => Ok(None),
            Some(raw) => httpdate::parse_http_date(raw).map(Some),
        }
    }

    /// Proceeds unless `If-Match` is present and differs from the quoted
    /// `etag`, in which case the request is answered with `412`.
    pub fn conditional_if_match(&self, etag: &str) -> Result<(), Response> {
        match self.if_match() {
            None | Some("") => Ok(()),
            Some(remote) if is_quoted(remote, etag) => Ok(()),
            Some(_) => Err(Response::new().precondition_failed()),
        }
    }

    /// Proceeds unless `If-None-Match` equals the quoted `etag`. A match
    /// answers `GET` and `HEAD` with `304` (carrying the ETag) and every other
    /// method with `412`.
    pub fn conditional_if_none_match(&self, etag: &str) -> Result<(), Response> {
        match self.if_none_match() {
            Some(remote) if is_quoted(remote, etag) => {
                if Method::try_from(&self.parts.method).is_ok_and(Method::is_safe) {
                    Err(Response::new().not_modified().etag(etag))
                } else {
                    Err(Response::new().precondition_failed())
                }
            }
            _ => Ok(()),
        }
    }

    /// Proceeds when the resource changed after `If-Modified-Since`.
    ///
    /// The resource's modification time is the latest of `last_modified`
    /// (the epoch when empty), truncated to whole seconds. When that is not
    /// after the header date the request is answered with `304` and a
    /// `Last-Modified` header. A malformed header is answered with `400`.
    pub fn conditional_if_modified_since(&self, last_modified: &[SystemTime]) -> Result<(), Response> {
        let since = match self.if_modified_since() {
            Ok(None) => return Ok(()),
            Ok(Some(since)) => since,
            Err(_) => return Err(invalid_date("If-Modified-Since")),
        };
        let latest = latest_second(last_modified);
        if latest > since {
            return Ok(());
        }
        Err(Response::new().not_modified().last_modified(latest))
    }

    /// Proceeds when the resource did not change after `If-Unmodified-Since`,
    /// otherwise answers `412`. A malformed header is answered with `400`.
    pub fn conditional_if_unmodified_since(&self, last_modified: &[SystemTime]) -> Result<(), Response> {
        let since = match self.if_unmodified_since() {
            Ok(None) => return Ok(()),
            Ok(Some(since)) => since,
            Err(_) => return Err(invalid_date("If-Unmodified-Since")),
        };
        if latest_second(last_modified) > since {
            return Err(Response::new().precondition_failed());
        }
        Ok(())
    }

    // ── Body ──────────────────────────────────────────────────────────────────

    /// The whole request body. Read from the connection on the first call and
    /// cached; later calls return the same bytes. A failed read is cached too,
    /// so every later call reports the same error.
    pub async fn raw_body(&mut self) -> Result<Bytes, Error> {
        let slot = self.body.get_mut().unwrap_or_else(PoisonError::into_inner);
        let body = match std::mem::replace(slot, RequestBody::Read(Bytes::new())) {
            RequestBody::Read(bytes) => {
                *slot = RequestBody::Read(bytes.clone());
                return Ok(bytes);
            }
            RequestBody::Failed(message) => {
                *slot = RequestBody::Failed(message.clone());
                return Err(Error::Body(message.into()));
            }
            RequestBody::Unread(body) => body,
        };

        let read = body.collect().await;
        let slot = self.body.get_mut().unwrap_or_else(PoisonError::into_inner);
        match read {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                *slot = RequestBody::Read(bytes.clone());
                Ok(bytes)
            }
            Err(err) => {
                *slot = RequestBody::Failed(err.to_string());
                Err(Error::Body(err))
            }
        }
    }

    /// Decodes a JSON body into `T`.
    ///
    /// | failure                 | response                              |
    /// |-------------------------|---------------------------------------|
    /// | body could not be read  | `500` `InternalServerError`           |
    /// | body is empty           | `400` `RequestBodyMissing`            |
    /// | body is not a valid `T` | `400` `InvalidRequestBody`            |
    pub async fn bind_json<T: DeserializeOwned>(&mut self) -> Result<T, Response> {
        let bytes = self.raw_body().await.map_err(|err| Response::new().error(err))?;
        if bytes.is_empty() {
            return Err(Response::new().error_body(
                StatusCode::BAD_REQUEST,
                "RequestBodyMissing",
                "request body is missing",
            ));
        }
        serde_json::from_slice(&bytes).map_err(|err| {
            Response::new().error_body(StatusCode::BAD_REQUEST, "InvalidRequestBody", &err.to_string())
        })
    }

    /// [`bind_json`](Self::bind_json), then [`Validate::validate`].
    ///
    /// A [`ValidationError`] is answered with `400` and the aggregated
    /// violations as body; any other validation error with a `400`
    /// `BadRequest` carrying its message.
    pub async fn bind_valid_json<T: DeserializeOwned + Validate>(&mut self) -> Result<T, Response> {
        let value: T = self.bind_json().await?;
        value.validate().map_err(|err| match err.downcast::<ValidationError>() {
            Ok(invalid) => Response::new().bad_request_with(*invalid),
            Err(other) => {
                Response::new().error_body(StatusCode::BAD_REQUEST, "BadRequest", &other.to_string())
            }
        })?;
        Ok(value)
    }

    /// Fields of an urlencoded or multipart form body.
    ///
    /// Only `POST`, `PUT` and `PATCH` bodies are parsed; other methods and
    /// other content types yield no values. File parts are skipped. The body
    /// is read in full first; decoding of a multipart body stops once it
    /// passes [`Config::max_multipart_memory`]. Parse failures are logged and
    /// leave whatever was decoded before them.
    pub async fn form_values(&mut self) -> &Values {
        if self.form.is_none() {
            let form = self.parse_form().await;
            self.form = Some(form);
        }
        self.form.get_or_insert_with(Values::default)
    }

    /// First value of one form field.
    pub async fn form_value(&mut self, key: &str) -> Option<&str> {
        self.form_values().await.get(key)
    }

    async fn parse_form(&mut self) -> Values {
        if !matches!(self.parts.method, http::Method::POST | http::Method::PUT | http::Method::PATCH) {
            return Values::default();
        }
        let content_type = self.content_type().unwrap_or_default().to_owned();
        let mime = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();

        match mime.as_str() {
            "application/x-www-form-urlencoded" => {
                let bytes = match self.raw_body().await {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        error!(error = %err, "unable to read form body");
                        return Values::default();
                    }
                };
                match serde_urlencoded::from_bytes::<Vec<(String, String)>>(&bytes) {
                    Ok(pairs) => Values(pairs),
                    Err(err) => {
                        error!(error = %err, "unable to parse urlencoded form");
                        Values::default()
                    }
                }
            }
            "multipart/form-data" => self.parse_multipart(&content_type).await,
            _ => Values::default(),
        }
    }

    async fn parse_multipart(&mut self, content_type: &str) -> Values {
        let boundary = match multer::parse_boundary(content_type) {
            Ok(boundary) => boundary,
            Err(err) => {
                error!(error = %err, "unable to parse multipart form");
                return Values::default();
            }
        };
        let body = match self.raw_body().await {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "unable to read multipart body");
                return Values::default();
            }
        };

        let limit = multer::SizeLimit::new().whole_stream(self.config.max_multipart_memory());
        let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(body) });
        let mut multipart =
            multer::Multipart::with_constraints(stream, boundary, multer::Constraints::new().size_limit(limit));

        let mut pairs = Vec::new();
        loop {
            let field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "unable to parse multipart form");
                    break;
                }
            };
            if field.file_name().is_some() {
                continue;
            }
            let Some(name) = field.name().map(str::to_owned) else {
                continue;
            };
            match field.text().await {
                Ok(value) => pairs.push((name, value)),
                Err(err) => {
                    error!(error = %err, field = %name, "unable to read multipart field");
                    break;
                }
            }
        }
        Values(pairs)
    }

    // ── Key/value store ───────────────────────────────────────────────────────

    /// Stores `value` under `key`, replacing any previous value of any type.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// `Ok(None)` when nothing is stored under `key`, `Err` when the stored
    /// value is not a `T`.
    pub fn get<T: Any>(&self, key: &str) -> Result<Option<&T>, TypeMismatch> {
        let Some(value) = self.values.get(key) else {
            return Ok(None);
        };
        value.as_ref().downcast_ref::<T>().map(Some).ok_or_else(|| TypeMismatch {
            key: key.to_owned(),
            expected: type_name::<T>(),
        })
    }

    /// Like [`get`](Self::get), for values the chain guarantees are there.
    ///
    /// # Panics
    ///
    /// Panics when the key is missing or holds another type.
    pub fn must_get<T: Any>(&self, key: &str) -> &T {
        match self.get::<T>(key) {
            Ok(Some(value)) => value,
            Ok(None) => panic!("didn't find key '{key}' in context"),
            Err(err) => panic!("{err}"),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        let req = http::Request::new(box_body(http_body_util::Empty::<Bytes>::new()));
        Self::new(req, "127.0.0.1:40000", Arc::new(Config::default()))
    }
}

fn is_quoted(remote: &str, etag: &str) -> bool {
    remote.len() == etag.len() + 2
        && remote.starts_with('"')
        && remote.ends_with('"')
        && &remote[1..remote.len() - 1] == etag
}

/// The latest of `times`, truncated to whole seconds; the epoch when empty.
fn latest_second(times: &[SystemTime]) -> SystemTime {
    let latest = times.iter().copied().max().unwrap_or(UNIX_EPOCH);
    let secs = latest.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn invalid_date(header: &str) -> Response {
    Response::new().error_body(
        StatusCode::BAD_REQUEST,
        "BadRequest",
        &format!("invalid value for '{header}'"),
    )
}
