//! Transfer-message codec.
//!
//! Text framing, `CR LF` line separator, UTF-8. This module only codes the
//! request/response *head* (request line or status line, plus headers up to
//! the blank line) as ordinary strings — the body is a byte stream handled
//! by [`crate::transfer::server`] / [`crate::transfer::client`], never
//! buffered here.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

const LINE_SEP: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

impl Method {
    fn parse(s: &str) -> Result<Method> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            other => Err(Error::ParseError(format!("unknown method '{other}'"))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok200,
    PartialContent206,
    BadRequest400,
    NotFound404,
    PreconditionFailed412,
    RangeNotSatisfiable416,
    ServerError500,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            StatusCode::Ok200 => 200,
            StatusCode::PartialContent206 => 206,
            StatusCode::BadRequest400 => 400,
            StatusCode::NotFound404 => 404,
            StatusCode::PreconditionFailed412 => 412,
            StatusCode::RangeNotSatisfiable416 => 416,
            StatusCode::ServerError500 => 500,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            StatusCode::Ok200 => "OK",
            StatusCode::PartialContent206 => "Partial content",
            StatusCode::BadRequest400 => "Bad request",
            StatusCode::NotFound404 => "Not found",
            StatusCode::PreconditionFailed412 => "Precondition failed",
            StatusCode::RangeNotSatisfiable416 => "Range not satisfiable",
            StatusCode::ServerError500 => "Internal server error",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, StatusCode::Ok200 | StatusCode::PartialContent206)
    }

    fn from_code(code: u16) -> Result<StatusCode> {
        Ok(match code {
            200 => StatusCode::Ok200,
            206 => StatusCode::PartialContent206,
            400 => StatusCode::BadRequest400,
            404 => StatusCode::NotFound404,
            412 => StatusCode::PreconditionFailed412,
            416 => StatusCode::RangeNotSatisfiable416,
            500 => StatusCode::ServerError500,
            other => return Err(Error::ParseError(format!("unknown status code {other}"))),
        })
    }
}

/// A `bytes <start>-<end?>` request range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

/// A `bytes <start>-<end>/<total>` content-range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

/// Headers, keyed case-insensitively (canonicalized to lower-case).
///
/// Unknown headers are preserved for passthrough but otherwise ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn content_length(&self) -> Result<Option<u64>> {
        self.get("content-length")
            .map(|v| v.parse().map_err(|_| Error::ParseError("bad content-length".into())))
            .transpose()
    }

    pub fn set_content_length(&mut self, len: u64) {
        self.set("content-length", len.to_string());
    }

    pub fn range(&self) -> Result<Option<(String, ByteRange)>> {
        let Some(raw) = self.get("range") else { return Ok(None) };
        let rest = raw
            .split_once(' ')
            .ok_or_else(|| Error::ParseError("bad range header".into()))?;
        let (unit, spec) = rest;
        let (start, end) = spec
            .split_once('-')
            .ok_or_else(|| Error::ParseError("bad range header".into()))?;
        let start: u64 = start.parse().map_err(|_| Error::ParseError("bad range start".into()))?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse().map_err(|_| Error::ParseError("bad range end".into()))?)
        };
        Ok(Some((unit.to_string(), ByteRange { start, end })))
    }

    pub fn set_range(&mut self, start: u64) {
        self.set("range", format!("bytes {start}-"));
    }

    pub fn content_range(&self) -> Result<Option<ContentRange>> {
        let Some(raw) = self.get("content-range") else { return Ok(None) };
        let rest = raw
            .strip_prefix("bytes ")
            .ok_or_else(|| Error::ParseError("bad content-range header".into()))?;
        let (range, total) = rest
            .split_once('/')
            .ok_or_else(|| Error::ParseError("bad content-range header".into()))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| Error::ParseError("bad content-range header".into()))?;
        Ok(Some(ContentRange {
            start: start.parse().map_err(|_| Error::ParseError("bad content-range start".into()))?,
            end: end.parse().map_err(|_| Error::ParseError("bad content-range end".into()))?,
            total: total.parse().map_err(|_| Error::ParseError("bad content-range total".into()))?,
        }))
    }

    pub fn set_content_range(&mut self, start: u64, end: u64, total: u64) {
        self.set("content-range", format!("bytes {start}-{end}/{total}"));
    }

    /// `<alg>=<value>` pair, e.g. from `digest` or `if-digest`.
    pub fn digest_header(&self, key: &str) -> Result<Option<(String, String)>> {
        let Some(raw) = self.get(key) else { return Ok(None) };
        let (alg, value) = raw
            .split_once('=')
            .ok_or_else(|| Error::ParseError(format!("bad {key} header")))?;
        Ok(Some((alg.to_string(), value.to_string())))
    }

    pub fn set_digest_header(&mut self, key: &str, alg: &str, value: &str) {
        self.set(key, format!("{alg}={value}"));
    }

    fn write_lines(&self, out: &mut String) {
        for (k, v) in &self.0 {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str(LINE_SEP);
        }
        out.push_str(LINE_SEP);
    }

    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
        let mut headers = Headers::new();
        for line in lines {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| Error::ParseError(format!("malformed header line '{line}'")))?;
            headers.set(key.trim(), value.trim());
        }
        Ok(headers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub name: String,
    pub headers: Headers,
}

impl Request {
    pub fn new(method: Method, name: impl Into<String>) -> Self {
        Self { method, name: name.into(), headers: Headers::new() }
    }

    /// Request line + headers, terminated by the blank line. No body.
    pub fn to_head_string(&self) -> String {
        let mut out = format!("{} {}{LINE_SEP}", self.method, self.name);
        self.headers.write_lines(&mut out);
        out
    }

    /// Parses a full head (request line + headers + trailing blank line).
    pub fn parse_head(raw: &str) -> Result<Request> {
        let mut lines = raw.split(LINE_SEP);
        let request_line = lines.next().ok_or_else(|| Error::ParseError("empty request".into()))?;
        let (method, name) = request_line
            .split_once(' ')
            .ok_or_else(|| Error::ParseError("malformed request line".into()))?;
        let header_lines = lines.filter(|l| !l.is_empty());
        Ok(Request {
            method: Method::parse(method)?,
            name: name.to_string(),
            headers: Headers::parse_lines(header_lines)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self { status, headers: Headers::new() }
    }

    pub fn to_head_string(&self) -> String {
        let mut out = format!("{} {}{LINE_SEP}", self.status.code(), self.status.text());
        self.headers.write_lines(&mut out);
        out
    }

    pub fn parse_head(raw: &str) -> Result<Response> {
        let mut lines = raw.split(LINE_SEP);
        let status_line = lines.next().ok_or_else(|| Error::ParseError("empty response".into()))?;
        let (code, _text) = status_line
            .split_once(' ')
            .ok_or_else(|| Error::ParseError("malformed status line".into()))?;
        let code: u16 = code.parse().map_err(|_| Error::ParseError("bad status code".into()))?;
        let header_lines = lines.filter(|l| !l.is_empty());
        Ok(Response {
            status: StatusCode::from_code(code)?,
            headers: Headers::parse_lines(header_lines)?,
        })
    }

    /// A 2xx response with no `content-length` has no defined body length —
    /// this is a protocol error, not merely "no body".
    pub fn assert_has_body_if_ok(&self) -> Result<()> {
        if self.status.is_success() && self.headers.content_length()?.is_none() {
            return Err(Error::ProtocolError("2xx response missing content-length".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_with_header_and_method_canonicalization() {
        let mut req = Request::new(Method::Get, "movie.mp4");
        req.headers.set_range(1024);
        req.headers.set_digest_header("if-digest", "sha-256", "abc123");

        let raw = req.to_head_string();
        let lower_method = raw.replacen("GET", "get", 1);
        let parsed = Request::parse_head(&lower_method).unwrap();

        assert_eq!(parsed.method, Method::Get);
        assert_eq!(parsed.name, "movie.mp4");
        assert_eq!(parsed.headers.range().unwrap().unwrap().1.start, 1024);
        assert_eq!(
            parsed.headers.digest_header("if-digest").unwrap().unwrap(),
            ("sha-256".to_string(), "abc123".to_string())
        );
    }

    #[test]
    fn response_round_trips_with_content_range() {
        let mut resp = Response::new(StatusCode::PartialContent206);
        resp.headers.set_content_length(2048);
        resp.headers.set_content_range(1024, 3071, 4096);

        let parsed = Response::parse_head(&resp.to_head_string()).unwrap();
        assert_eq!(parsed.status, StatusCode::PartialContent206);
        assert_eq!(parsed.headers.content_length().unwrap(), Some(2048));
        let cr = parsed.headers.content_range().unwrap().unwrap();
        assert_eq!((cr.start, cr.end, cr.total), (1024, 3071, 4096));
    }

    #[test]
    fn ok_response_without_content_length_is_protocol_error() {
        let resp = Response::new(StatusCode::Ok200);
        assert!(resp.assert_has_body_if_ok().is_err());
    }

    #[test]
    fn error_response_without_content_length_is_fine() {
        let resp = Response::new(StatusCode::NotFound404);
        assert!(resp.assert_has_body_if_ok().is_ok());
    }

    #[test]
    fn range_without_end_parses_as_open_ended() {
        let mut headers = Headers::new();
        headers.set_range(2048);
        let (unit, range) = headers.range().unwrap().unwrap();
        assert_eq!(unit, "bytes");
        assert_eq!(range.start, 2048);
        assert_eq!(range.end, None);
    }

    #[test]
    fn unknown_method_is_parse_error() {
        assert!(Request::parse_head("PUT file\r\n\r\n").is_err());
    }

    #[test]
    fn malformed_header_line_is_parse_error() {
        assert!(Request::parse_head("GET file\r\nnotaheader\r\n\r\n").is_err());
    }
}
