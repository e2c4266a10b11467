//! Per-attempt transfer progress.
//!
//! A [`TransferState`] is never mutated in place. Every header line and
//! every body chunk produces a new value, so whatever holds the previous one
//! never observes a half-applied update.

use std::{
    error::Error as StdError,
    fmt,
    fs::File,
    io::{self, Seek, SeekFrom, Write},
    path::PathBuf,
};

use bytes::{Bytes, BytesMut};
use url::Url;

use crate::{body::BodySource, message::HttpMessage, response::Response};

/// Why a response header could not be turned into a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParseError {
    /// A single header line was malformed: not CRLF terminated or not UTF-8.
    SingleLine,
    /// Every line was well formed, but the header as a whole did not make a
    /// valid response, e.g. an out of range status code.
    CompleteHeader,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ParseError::SingleLine => "malformed response header line",
            ParseError::CompleteHeader => "invalid response header",
        })
    }
}

impl StdError for ParseError {}

/// Header lines received so far for the current attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ParsedResponseHeader {
    Partial(Vec<String>),
    Complete,
}

/// Where received body bytes go.
#[derive(Debug)]
pub(crate) enum DataDrain {
    Memory(BytesMut),
    File { path: PathBuf, file: File },
    Ignore,
}

/// The state of one transfer attempt.
pub(crate) struct TransferState {
    url: Url,
    header: ParsedResponseHeader,
    response: Option<Response>,
    body_source: Option<Box<dyn BodySource>>,
    drain: DataDrain,
}

// ===== impl TransferState =====

impl TransferState {
    pub(crate) fn new(url: Url, drain: DataDrain) -> TransferState {
        TransferState {
            url,
            header: ParsedResponseHeader::Partial(Vec::new()),
            response: None,
            body_source: None,
            drain,
        }
    }

    #[inline]
    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    pub(crate) fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    #[inline]
    pub(crate) fn is_header_complete(&self) -> bool {
        matches!(self.header, ParsedResponseHeader::Complete)
    }

    #[inline]
    pub(crate) fn body_source_mut(&mut self) -> Option<&mut (dyn BodySource + 'static)> {
        self.body_source.as_deref_mut()
    }

    #[inline]
    pub(crate) fn drain(&self) -> &DataDrain {
        &self.drain
    }

    /// Splits the state into what survives a finished attempt.
    pub(crate) fn into_parts(self) -> (Option<Response>, DataDrain) {
        (self.response, self.drain)
    }

    /// Replaces the outbound body producer.
    pub(crate) fn with_body_source(self, source: Option<Box<dyn BodySource>>) -> TransferState {
        TransferState {
            body_source: source,
            ..self
        }
    }

    /// Feeds one raw HTTP header line, CRLF included.
    ///
    /// On the blank terminator line the collected lines are parsed into a
    /// response. An interim `1xx` response resets the accumulator so the
    /// final response is parsed from its own lines only; `101 Switching
    /// Protocols` is rejected.
    ///
    /// # Panics
    ///
    /// Panics when called after the response was parsed; the engine must not
    /// deliver header lines past the final blank line.
    pub(crate) fn append_http_header_line(self, data: &[u8]) -> Result<TransferState, ParseError> {
        let line = header_line(data)?;
        let lines = match self.header {
            ParsedResponseHeader::Partial(lines) => lines,
            ParsedResponseHeader::Complete => {
                panic!("header line appended after the response was parsed")
            }
        };

        if !line.is_empty() {
            let mut lines = lines;
            lines.push(line.to_owned());
            return Ok(TransferState {
                header: ParsedResponseHeader::Partial(lines),
                ..self
            });
        }

        let message = HttpMessage::parse(&lines).ok_or(ParseError::CompleteHeader)?;
        match message.status() {
            // the connection would switch protocols; there is no response to transfer
            Some(101) => return Err(ParseError::CompleteHeader),
            Some(100..=199) => {
                log::trace!("skipping interim {:?} response", message.status());
                return Ok(TransferState {
                    header: ParsedResponseHeader::Partial(Vec::new()),
                    ..self
                });
            }
            _ => {}
        }

        let response = message
            .into_response(self.url.clone())
            .ok_or(ParseError::CompleteHeader)?;
        Ok(TransferState {
            header: ParsedResponseHeader::Complete,
            response: Some(response),
            ..self
        })
    }

    /// Feeds one FTP reply line, CRLF included.
    ///
    /// `213` (file size) completes the header with the announced length,
    /// `150` / `125` (data connection opening) complete it with whatever is
    /// known. `226` (transfer complete) and anything after completion leave
    /// the state unchanged.
    pub(crate) fn append_ftp_header_line(
        self,
        data: &[u8],
        expected_content_length: Option<u64>,
    ) -> Result<TransferState, ParseError> {
        let line = header_line(data)?;
        let mut lines = match self.header {
            ParsedResponseHeader::Partial(lines) => lines,
            ParsedResponseHeader::Complete => return Ok(self),
        };

        let code = line.get(..3).unwrap_or_default();
        if code == "226" {
            return Ok(TransferState {
                header: ParsedResponseHeader::Partial(lines),
                ..self
            });
        }
        lines.push(line.to_owned());

        let length = match code {
            "213" => line
                .get(4..)
                .and_then(|size| size.trim().parse::<u64>().ok())
                .or(expected_content_length),
            "150" | "125" => expected_content_length,
            _ => {
                return Ok(TransferState {
                    header: ParsedResponseHeader::Partial(lines),
                    ..self
                })
            }
        };

        let response = Response::ftp(self.url.clone(), length);
        Ok(TransferState {
            header: ParsedResponseHeader::Complete,
            response: Some(response),
            ..self
        })
    }

    /// Routes received body bytes into the drain.
    pub(crate) fn append_body_data(self, data: &[u8]) -> io::Result<TransferState> {
        let drain = self.drain.append(data)?;
        Ok(TransferState { drain, ..self })
    }
}

impl fmt::Debug for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TransferState")
            .field("url", &self.url.as_str())
            .field("header", &self.header)
            .field("response", &self.response)
            .field("body_source", &self.body_source.is_some())
            .field("drain", &self.drain)
            .finish()
    }
}

// ===== impl DataDrain =====

impl DataDrain {
    /// Appends body bytes: memory grows, a file is written at its end.
    pub(crate) fn append(self, data: &[u8]) -> io::Result<DataDrain> {
        match self {
            DataDrain::Memory(mut buf) => {
                buf.extend_from_slice(data);
                Ok(DataDrain::Memory(buf))
            }
            DataDrain::File { path, mut file } => {
                file.seek(SeekFrom::End(0))?;
                file.write_all(data)?;
                Ok(DataDrain::File { path, file })
            }
            DataDrain::Ignore => Ok(DataDrain::Ignore),
        }
    }

    /// The bytes collected in memory, if this drain collects any.
    pub(crate) fn into_bytes(self) -> Option<Bytes> {
        match self {
            DataDrain::Memory(buf) => Some(buf.freeze()),
            DataDrain::File { .. } | DataDrain::Ignore => None,
        }
    }

    pub(crate) fn path(&self) -> Option<&PathBuf> {
        match self {
            DataDrain::File { path, .. } => Some(path),
            DataDrain::Memory(_) | DataDrain::Ignore => None,
        }
    }
}

fn header_line(data: &[u8]) -> Result<&str, ParseError> {
    let line = data.strip_suffix(b"\r\n").ok_or(ParseError::SingleLine)?;
    std::str::from_utf8(line).map_err(|_| ParseError::SingleLine)
}
