//! Commit targets for [`Response::commit`](crate::Response::commit).
//!
//! A sink receives a response in three phases, always in this order:
//!
//! 1. header lines, one call per name/value pair (repeats are not merged),
//! 2. the status, exactly once,
//! 3. body bytes through [`std::io::Write`].
//!
//! [`BufferedSink`] collects everything into an `http::Response` for hyper.
//! [`WireSink`] writes HTTP/1.1 text straight onto any `Write`.

use std::io::{self, Write};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body_util::Full;

use crate::error::Error;

/// Where a committed response goes.
pub trait ResponseSink: Write {
    /// Queues one header line. Only valid before [`write_head`](Self::write_head).
    fn append_header(&mut self, name: &str, value: &str) -> Result<(), Error>;

    /// Sends the status line together with every queued header.
    fn write_head(&mut self, status: StatusCode) -> Result<(), Error>;
}

// ── BufferedSink ──────────────────────────────────────────────────────────────

/// Buffers the whole response in memory, then converts it for hyper.
#[derive(Debug, Default)]
pub struct BufferedSink {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the status has been written.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_response(self) -> http::Response<Full<Bytes>> {
        let mut res = http::Response::new(Full::new(Bytes::from(self.body)));
        *res.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *res.headers_mut() = self.headers;
        res
    }
}

impl ResponseSink for BufferedSink {
    fn append_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let invalid = || Error::InvalidHeader { name: name.to_owned() };
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
        let value = HeaderValue::from_str(value).map_err(|_| invalid())?;
        self.headers.append(header, value);
        Ok(())
    }

    fn write_head(&mut self, status: StatusCode) -> Result<(), Error> {
        self.status.get_or_insert(status);
        Ok(())
    }
}

impl Write for BufferedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Body bytes before a status imply 200, as on the wire.
        self.status.get_or_insert(StatusCode::OK);
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── WireSink ──────────────────────────────────────────────────────────────────

/// Writes an HTTP/1.1 response onto a raw byte stream.
///
/// No `content-length` is added: the body is delimited by closing the
/// stream unless the response carries its own framing headers.
pub struct WireSink<W: Write> {
    inner: W,
    pending: Vec<(String, String)>,
    head_written: bool,
}

impl<W: Write> WireSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, pending: Vec::new(), head_written: false }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ResponseSink for WireSink<W> {
    fn append_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        // Reject anything that would let a value break out of its line.
        if HeaderName::from_bytes(name.as_bytes()).is_err() || HeaderValue::from_str(value).is_err() {
            return Err(Error::InvalidHeader { name: name.to_owned() });
        }
        self.pending.push((name.to_owned(), value.to_owned()));
        Ok(())
    }

    fn write_head(&mut self, status: StatusCode) -> Result<(), Error> {
        if self.head_written {
            return Ok(());
        }
        self.head_written = true;
        write!(
            self.inner,
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )?;
        for (name, value) in self.pending.drain(..) {
            write!(self.inner, "{name}: {value}\r\n")?;
        }
        self.inner.write_all(b"\r\n")?;
        Ok(())
    }
}

impl<W: Write> Write for WireSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.head_written {
            self.write_head(StatusCode::OK).map_err(io::Error::other)?;
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
