use bytes::{Bytes, BytesMut};
use probekit_common::{Failure, FailureKind};
use thiserror::Error;

/// HTTP wire-format errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed response: {0}")]
    Parser(&'static str),
    #[error("upgrade responses are not supported")]
    Upgrade,
    #[error("invalid url: {0}")]
    UrlParser(String),
    #[error("url has no schema")]
    MissingSchema,
    #[error("url has no host")]
    MissingHost,
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::Parser(_) => FailureKind::Parser,
            Error::Upgrade => FailureKind::Upgrade,
            Error::UrlParser(_) => FailureKind::UrlParser,
            Error::MissingSchema => FailureKind::MissingUrlSchema,
            Error::MissingHost => FailureKind::MissingUrlHost,
        };
        Failure::with_reason(kind, err.to_string())
    }
}

/// A parsed absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub schema: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: String,
    pub fragment: String,
}

impl Url {
    /// Parses `schema://host[:port][/path][?query][#fragment]`.
    ///
    /// The port defaults to 443 for "https" and to 80 otherwise; the path
    /// defaults to "/".
    pub fn parse(raw: &str) -> Result<Url, Error> {
        let (schema, rest) = raw.split_once("://").ok_or(Error::MissingSchema)?;
        if schema.is_empty() || !schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(Error::MissingSchema);
        }

        let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let (authority, mut rest) = rest.split_at(authority_end);
        let authority = authority.rsplit_once('@').map(|(_, host)| host).unwrap_or(authority);

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, after) =
                v6.split_once(']').ok_or_else(|| Error::UrlParser(raw.to_string()))?;
            let port = match after.strip_prefix(':') {
                Some(p) => Some(p),
                None if after.is_empty() => None,
                None => return Err(Error::UrlParser(raw.to_string())),
            };
            (host.to_string(), port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => (host.to_string(), Some(port)),
                None => (authority.to_string(), None),
            }
        };
        if host.is_empty() {
            return Err(Error::MissingHost);
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| Error::UrlParser(raw.to_string()))?,
            None if schema == "https" => 443,
            None => 80,
        };

        let fragment = match rest.split_once('#') {
            Some((before, fragment)) => {
                rest = before;
                fragment.to_string()
            }
            None => String::new(),
        };
        let query = match rest.split_once('?') {
            Some((before, query)) => {
                rest = before;
                query.to_string()
            }
            None => String::new(),
        };
        let path = if rest.is_empty() { "/".to_string() } else { rest.to_string() };

        Ok(Url { schema: schema.to_string(), host, port, path, query, fragment })
    }

    /// Path plus "?query" when a query is present.
    pub fn pathquery(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// A case-insensitive header map with preserved insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets `name` to `value`, replacing an existing entry in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.set(k, v);
        }
        headers
    }
}

/// Serializes a request: request-line, caller headers in order, a Host
/// header (with ":port" iff the port is not 80), a Content-Length header
/// iff the body is non-empty, then the body.
pub fn serialize_request(
    method: &str,
    url: &Url,
    path_override: Option<&str>,
    protocol: &str,
    headers: &Headers,
    body: &[u8],
) -> Bytes {
    let pathquery = match path_override {
        Some(path) => path.to_string(),
        None => url.pathquery(),
    };
    let mut out = BytesMut::with_capacity(128 + body.len());
    out.extend_from_slice(format!("{method} {pathquery} {protocol}\r\n").as_bytes());
    for (name, value) in headers.iter() {
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if url.port != 80 {
        out.extend_from_slice(format!("Host: {}:{}\r\n", url.host, url.port).as_bytes());
    } else {
        out.extend_from_slice(format!("Host: {}\r\n", url.host).as_bytes());
    }
    if !body.is_empty() {
        out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out.freeze()
}

/// A parsed response head plus the body collected by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub http_major: u16,
    pub http_minor: u16,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
}

/// Parser events, in emission order: `Begin`, `Response` once the header
/// block is complete, zero or more `BodyChunk`s, then `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin,
    Response(Response),
    BodyChunk(Bytes),
    End,
}

/// Which half of a header line the last committed bytes belonged to.
/// Transitions other than NOTHING→FIELD, VALUE→FIELD, FIELD→FIELD,
/// FIELD→VALUE and VALUE→VALUE are protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderPos {
    Nothing,
    Field,
    Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    StatusLine,
    StatusAlmostDone,
    HeaderLineStart,
    HeaderField,
    HeaderValueStart,
    HeaderValue,
    HeaderAlmostDone,
    HeadersAlmostDone,
    BodySized,
    BodyUntilEof,
    ChunkSize,
    ChunkExt,
    ChunkSizeAlmostDone,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    TrailerLineStart,
    TrailerLine,
    TrailerAlmostDone,
    LastTrailerAlmostDone,
    Done,
}

/// Incremental HTTP/1.x response parser.
///
/// Feeding the same byte stream split at any boundary yields the same
/// event sequence; headers repeated in a response replace the previously
/// committed value.
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    line: String,
    prev: HeaderPos,
    field: String,
    value: String,
    response: Response,
    remaining: u64,
    chunk_size_line: String,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: State::Start,
            line: String::new(),
            prev: HeaderPos::Nothing,
            field: String::new(),
            value: String::new(),
            response: Response::default(),
            remaining: 0,
            chunk_size_line: String::new(),
        }
    }

    /// Feeds a chunk of bytes, returning the events it produced.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Event>, Error> {
        let mut events = Vec::new();
        let mut pos = 0usize;
        while pos < data.len() {
            match self.state {
                // Body states consume runs of bytes; everything else is
                // byte-at-a-time so that arbitrary splits are equivalent.
                State::BodySized => {
                    let take = ((data.len() - pos) as u64).min(self.remaining) as usize;
                    events.push(Event::BodyChunk(Bytes::copy_from_slice(&data[pos..pos + take])));
                    self.remaining -= take as u64;
                    pos += take;
                    if self.remaining == 0 {
                        self.state = State::Done;
                        events.push(Event::End);
                    }
                }
                State::BodyUntilEof => {
                    events.push(Event::BodyChunk(Bytes::copy_from_slice(&data[pos..])));
                    pos = data.len();
                }
                State::ChunkData => {
                    let take = ((data.len() - pos) as u64).min(self.remaining) as usize;
                    events.push(Event::BodyChunk(Bytes::copy_from_slice(&data[pos..pos + take])));
                    self.remaining -= take as u64;
                    pos += take;
                    if self.remaining == 0 {
                        self.state = State::ChunkDataCr;
                    }
                }
                _ => {
                    self.feed_byte(data[pos], &mut events)?;
                    pos += 1;
                }
            }
        }
        Ok(events)
    }

    /// Signals end of stream. Completes an until-EOF body; anything else
    /// mid-message is a protocol error.
    pub fn eof(&mut self) -> Result<Vec<Event>, Error> {
        match self.state {
            State::BodyUntilEof => {
                self.state = State::Done;
                Ok(vec![Event::End])
            }
            State::Start | State::Done => Ok(Vec::new()),
            _ => Err(Error::Parser("eof inside message")),
        }
    }

    fn feed_byte(&mut self, byte: u8, events: &mut Vec<Event>) -> Result<(), Error> {
        match self.state {
            State::Start => {
                events.push(Event::Begin);
                self.response = Response::default();
                self.prev = HeaderPos::Nothing;
                self.field.clear();
                self.value.clear();
                self.line.clear();
                self.state = State::StatusLine;
                self.status_byte(byte)
            }
            State::StatusLine => self.status_byte(byte),
            State::StatusAlmostDone => {
                if byte != b'\n' {
                    return Err(Error::Parser("expected LF after status line"));
                }
                self.parse_status_line()?;
                self.state = State::HeaderLineStart;
                Ok(())
            }
            State::HeaderLineStart => match byte {
                b'\r' => {
                    self.state = State::HeadersAlmostDone;
                    Ok(())
                }
                b' ' | b'\t' => {
                    // Folded continuation of the previous value line.
                    self.header_piece(HeaderPos::Value, byte)?;
                    self.state = State::HeaderValue;
                    Ok(())
                }
                b':' => Err(Error::Parser("empty header field name")),
                _ => {
                    self.header_piece(HeaderPos::Field, byte)?;
                    self.state = State::HeaderField;
                    Ok(())
                }
            },
            State::HeaderField => match byte {
                b':' => {
                    self.state = State::HeaderValueStart;
                    Ok(())
                }
                b'\r' | b'\n' => Err(Error::Parser("header line without colon")),
                _ => self.header_piece(HeaderPos::Field, byte),
            },
            State::HeaderValueStart => match byte {
                b' ' | b'\t' => Ok(()),
                b'\r' => {
                    // Empty value: commit it through the automaton anyway.
                    self.header_piece_empty_value()?;
                    self.state = State::HeaderAlmostDone;
                    Ok(())
                }
                _ => {
                    self.header_piece(HeaderPos::Value, byte)?;
                    self.state = State::HeaderValue;
                    Ok(())
                }
            },
            State::HeaderValue => match byte {
                b'\r' => {
                    self.state = State::HeaderAlmostDone;
                    Ok(())
                }
                b'\n' => Err(Error::Parser("bare LF in header value")),
                _ => self.header_piece(HeaderPos::Value, byte),
            },
            State::HeaderAlmostDone => {
                if byte != b'\n' {
                    return Err(Error::Parser("expected LF after header line"));
                }
                self.state = State::HeaderLineStart;
                Ok(())
            }
            State::HeadersAlmostDone => {
                if byte != b'\n' {
                    return Err(Error::Parser("expected LF after header block"));
                }
                self.headers_complete(events)
            }
            State::ChunkSize => match byte {
                b'\r' => {
                    self.state = State::ChunkSizeAlmostDone;
                    Ok(())
                }
                b';' => {
                    self.state = State::ChunkExt;
                    Ok(())
                }
                _ => {
                    if !byte.is_ascii_hexdigit() || self.chunk_size_line.len() >= 16 {
                        return Err(Error::Parser("invalid chunk size"));
                    }
                    self.chunk_size_line.push(byte as char);
                    Ok(())
                }
            },
            State::ChunkExt => match byte {
                b'\r' => {
                    self.state = State::ChunkSizeAlmostDone;
                    Ok(())
                }
                _ => Ok(()),
            },
            State::ChunkSizeAlmostDone => {
                if byte != b'\n' {
                    return Err(Error::Parser("expected LF after chunk size"));
                }
                let size = u64::from_str_radix(&self.chunk_size_line, 16)
                    .map_err(|_| Error::Parser("invalid chunk size"))?;
                self.chunk_size_line.clear();
                if size == 0 {
                    self.state = State::TrailerLineStart;
                } else {
                    self.remaining = size;
                    self.state = State::ChunkData;
                }
                Ok(())
            }
            State::ChunkDataCr => {
                if byte != b'\r' {
                    return Err(Error::Parser("expected CR after chunk data"));
                }
                self.state = State::ChunkDataLf;
                Ok(())
            }
            State::ChunkDataLf => {
                if byte != b'\n' {
                    return Err(Error::Parser("expected LF after chunk data"));
                }
                self.state = State::ChunkSize;
                Ok(())
            }
            State::TrailerLineStart => match byte {
                b'\r' => {
                    self.state = State::LastTrailerAlmostDone;
                    Ok(())
                }
                _ => {
                    self.state = State::TrailerLine;
                    Ok(())
                }
            },
            State::TrailerLine => {
                if byte == b'\r' {
                    self.state = State::TrailerAlmostDone;
                }
                Ok(())
            }
            State::TrailerAlmostDone => {
                if byte != b'\n' {
                    return Err(Error::Parser("expected LF after trailer"));
                }
                self.state = State::TrailerLineStart;
                Ok(())
            }
            State::LastTrailerAlmostDone => {
                if byte != b'\n' {
                    return Err(Error::Parser("expected LF ending trailers"));
                }
                self.state = State::Done;
                events.push(Event::End);
                Ok(())
            }
            State::Done => {
                // A fresh message on the same stream.
                self.state = State::Start;
                self.feed_byte(byte, events)
            }
            State::BodySized | State::BodyUntilEof | State::ChunkData => {
                unreachable!("body states consume runs")
            }
        }
    }

    fn status_byte(&mut self, byte: u8) -> Result<(), Error> {
        match byte {
            b'\r' => {
                self.state = State::StatusAlmostDone;
                Ok(())
            }
            b'\n' => Err(Error::Parser("bare LF in status line")),
            _ => {
                if self.line.len() > 8 * 1024 {
                    return Err(Error::Parser("status line too long"));
                }
                self.line.push(byte as char);
                Ok(())
            }
        }
    }

    fn parse_status_line(&mut self) -> Result<(), Error> {
        let line = std::mem::take(&mut self.line);
        let rest = line.strip_prefix("HTTP/").ok_or(Error::Parser("bad protocol"))?;
        let (version, rest) = rest.split_once(' ').ok_or(Error::Parser("bad status line"))?;
        let (major, minor) = version.split_once('.').ok_or(Error::Parser("bad version"))?;
        self.response.http_major =
            major.parse().map_err(|_| Error::Parser("bad major version"))?;
        self.response.http_minor =
            minor.parse().map_err(|_| Error::Parser("bad minor version"))?;
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason),
            None => (rest, ""),
        };
        if code.len() != 3 {
            return Err(Error::Parser("bad status code"));
        }
        self.response.status_code =
            code.parse().map_err(|_| Error::Parser("bad status code"))?;
        self.response.reason = reason.to_string();
        tracing::trace!(status = self.response.status_code, "status line parsed");
        Ok(())
    }

    fn header_piece(&mut self, cur: HeaderPos, byte: u8) -> Result<(), Error> {
        let piece = byte as char;
        match (self.prev, cur) {
            (HeaderPos::Nothing, HeaderPos::Field) => {
                self.field.clear();
                self.field.push(piece);
            }
            (HeaderPos::Value, HeaderPos::Field) => {
                let field = std::mem::take(&mut self.field);
                let value = std::mem::take(&mut self.value);
                self.response.headers.set(field, value);
                self.field.push(piece);
            }
            (HeaderPos::Field, HeaderPos::Field) => self.field.push(piece),
            (HeaderPos::Field, HeaderPos::Value) => {
                self.value.clear();
                self.value.push(piece);
            }
            (HeaderPos::Value, HeaderPos::Value) => self.value.push(piece),
            _ => return Err(Error::Parser("invalid header transition")),
        }
        self.prev = cur;
        Ok(())
    }

    fn header_piece_empty_value(&mut self) -> Result<(), Error> {
        match self.prev {
            HeaderPos::Field => {
                self.value.clear();
                self.prev = HeaderPos::Value;
                Ok(())
            }
            _ => Err(Error::Parser("invalid header transition")),
        }
    }

    fn headers_complete(&mut self, events: &mut Vec<Event>) -> Result<(), Error> {
        if !self.field.is_empty() {
            let field = std::mem::take(&mut self.field);
            let value = std::mem::take(&mut self.value);
            self.response.headers.set(field, value);
        }
        self.prev = HeaderPos::Nothing;

        let response = self.response.clone();
        if response.status_code == 101 {
            return Err(Error::Upgrade);
        }
        tracing::trace!(
            status = response.status_code,
            headers = response.headers.len(),
            "headers complete"
        );
        events.push(Event::Response(response));

        let status = self.response.status_code;
        if (100..200).contains(&status) || status == 204 || status == 304 {
            self.state = State::Done;
            events.push(Event::End);
            return Ok(());
        }
        let chunked = self
            .response
            .headers
            .get("Transfer-Encoding")
            .map(|te| te.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);
        if chunked {
            self.state = State::ChunkSize;
            return Ok(());
        }
        if let Some(length) = self.response.headers.get("Content-Length") {
            let length: u64 =
                length.trim().parse().map_err(|_| Error::Parser("bad content-length"))?;
            if length == 0 {
                self.state = State::Done;
                events.push(Event::End);
            } else {
                self.remaining = length;
                self.state = State::BodySized;
            }
            return Ok(());
        }
        self.state = State::BodyUntilEof;
        Ok(())
    }
}
