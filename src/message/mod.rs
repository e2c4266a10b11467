//! Structural parsing of HTTP message heads.
//!
//! The transfer engine hands over one header line at a time. Once the blank
//! line arrives the collected lines are parsed here into a start line plus an
//! ordered list of header fields, and from there into a [`Response`].

use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Version};
use url::Url;

use crate::response::Response;

pub mod challenge;
pub(crate) mod token;

use self::token::{is_sp_ht, is_token, trim_ows, Scanner};

/// A parsed HTTP message head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpMessage {
    pub(crate) start_line: StartLine,
    pub(crate) headers: Vec<HeaderField>,
}

/// RFC 2616 §5.1 request line or §6.1 status line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StartLine {
    Request {
        method: String,
        uri: Url,
        version: HttpVersion,
    },
    Status {
        version: HttpVersion,
        status: u16,
        reason: String,
    },
}

/// An `HTTP/x.y` version token, kept as sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpVersion(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeaderField {
    pub(crate) name: String,
    pub(crate) value: String,
}

impl HttpVersion {
    fn parse(s: &str) -> Option<HttpVersion> {
        let numbers = s.strip_prefix("HTTP/")?;
        let valid = !numbers.is_empty()
            && numbers.chars().all(|c| c.is_ascii_digit() || c == '.')
            && numbers.starts_with(|c: char| c.is_ascii_digit());
        valid.then(|| HttpVersion(s.to_owned()))
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn to_version(&self) -> Version {
        match self.0.as_str() {
            "HTTP/0.9" => Version::HTTP_09,
            "HTTP/1.0" => Version::HTTP_10,
            "HTTP/2" | "HTTP/2.0" => Version::HTTP_2,
            "HTTP/3" | "HTTP/3.0" => Version::HTTP_3,
            _ => Version::HTTP_11,
        }
    }
}

impl HttpMessage {
    /// Parses the lines of a message head, blank terminator excluded.
    ///
    /// Returns `None` when the start line or any header field is malformed.
    pub(crate) fn parse<S: AsRef<str>>(lines: &[S]) -> Option<HttpMessage> {
        let (head, tail) = lines.split_first()?;
        let start_line = StartLine::parse(head.as_ref())?;
        let headers = parse_header_fields(tail)?;
        Some(HttpMessage {
            start_line,
            headers,
        })
    }

    /// Header fields folded into one value per name.
    ///
    /// Repeated names are joined with `", "` and keep the position of their
    /// first occurrence. Names compare case-insensitively.
    pub(crate) fn headers_joined(&self) -> Vec<(String, String)> {
        let mut joined: Vec<(String, String)> = Vec::with_capacity(self.headers.len());
        for field in &self.headers {
            match joined
                .iter_mut()
                .find(|(name, _)| name.eq_ignore_ascii_case(&field.name))
            {
                Some((_, value)) => {
                    value.push_str(", ");
                    value.push_str(&field.value);
                }
                None => joined.push((field.name.clone(), field.value.clone())),
            }
        }
        joined
    }

    /// Builds the response for a status line head.
    ///
    /// Returns `None` for request lines, status codes outside what
    /// [`StatusCode`] accepts, and field names or values that can not be
    /// represented in a [`HeaderMap`].
    pub(crate) fn into_response(self, url: Url) -> Option<Response> {
        let (version, status) = match self.start_line {
            StartLine::Status {
                ref version,
                status,
                ..
            } => (version.to_version(), StatusCode::from_u16(status).ok()?),
            StartLine::Request { .. } => return None,
        };

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers_joined() {
            let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(value.as_bytes()).ok()?;
            headers.insert(name, value);
        }

        Some(Response::http(url, status, version, headers))
    }

    pub(crate) fn status(&self) -> Option<u16> {
        match self.start_line {
            StartLine::Status { status, .. } => Some(status),
            StartLine::Request { .. } => None,
        }
    }
}

impl StartLine {
    fn parse(line: &str) -> Option<StartLine> {
        // method SP request-target SP version / version SP status SP reason
        let (first, rest) = line.split_once(' ')?;
        let (second, third) = rest.split_once(' ').unwrap_or((rest, ""));

        if let Some(version) = HttpVersion::parse(first) {
            let status = second.parse::<u16>().ok()?;
            if !(100..=999).contains(&status) {
                return None;
            }
            return Some(StartLine::Status {
                version,
                status,
                reason: third.to_owned(),
            });
        }

        let version = HttpVersion::parse(third)?;
        let uri = Url::parse(second).ok()?;
        if !is_token(first) {
            return None;
        }
        Some(StartLine::Request {
            method: first.to_owned(),
            uri,
            version,
        })
    }
}

// RFC 2616 §4.2, folding continuation lines into the field above them.
fn parse_header_fields<S: AsRef<str>>(lines: &[S]) -> Option<Vec<HeaderField>> {
    let mut fields: Vec<HeaderField> = Vec::with_capacity(lines.len());
    for line in lines.iter().map(AsRef::as_ref) {
        if line.starts_with(is_sp_ht) {
            let field = fields.last_mut()?;
            let part = trim_ows(line);
            if field.value.is_empty() {
                field.value.push_str(part);
            } else {
                field.value.push(' ');
                field.value.push_str(part);
            }
            continue;
        }
        fields.push(parse_header_field(line)?);
    }
    Some(fields)
}

fn parse_header_field(line: &str) -> Option<HeaderField> {
    let mut scanner = Scanner::new(line);
    let name = scanner.token()?;
    let value = if scanner.eat(':') {
        trim_ows(scanner.rest())
    } else if scanner.eat(';') && scanner.is_empty() {
        // `name;` is the explicit empty-value form
        ""
    } else {
        return None;
    };
    Some(HeaderField {
        name: name.to_owned(),
        value: value.to_owned(),
    })
}
