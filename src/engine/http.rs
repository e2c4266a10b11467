use std::{collections::VecDeque, io::Write, mem};

use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING};

use super::{
    conn::{self, Connection, ReadOutcome},
    decode::{self, Decoder},
    Action, BodyLength, Callbacks, EngineEvent, Failed, FillResult, HandleId, PauseState, Progress,
    ResultCode, Socket, SocketAction, Step, TransferConfig,
};

const READ_CHUNK: usize = 16 * 1024;
const UPLOAD_CHUNK: usize = 16 * 1024;
const MAX_HEAD: usize = 100 * 1024;
const MAX_HEADERS: usize = 128;

/// One HTTP/1.1 exchange on its own connection.
pub(super) struct HttpTransfer {
    config: TransferConfig,
    conn: Option<Connection>,
    opened: bool,
    out: Vec<u8>,
    out_pos: usize,
    upload: Upload,
    pause: PauseState,
    inbuf: Vec<u8>,
    head: Head,
    decoder: Decoder,
    held: Option<Vec<u8>>,
    eof: bool,
    received_any: bool,
    progress: Progress,
}

enum Upload {
    Idle,
    Length(u64),
    Chunked,
}

enum Head {
    Pending,
    Done(Framing),
}

#[derive(Debug, PartialEq, Eq)]
enum Framing {
    Length(u64),
    Chunked(Chunked),
    Close,
    Finished,
}

#[derive(Debug, PartialEq, Eq)]
enum Chunked {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

/// What the response head says about the body.
#[derive(Debug)]
struct ParsedHead {
    status: u16,
    content_length: Option<u64>,
    chunked: bool,
    content_encoding: Option<String>,
}

// ===== impl HttpTransfer =====

impl HttpTransfer {
    pub(super) fn new(config: TransferConfig) -> HttpTransfer {
        let (upload, expected_sent) = match config.body_length {
            BodyLength::NoBody => (Upload::Idle, Some(0)),
            BodyLength::Length(0) => (Upload::Idle, Some(0)),
            BodyLength::Length(n) => (Upload::Length(n), Some(n)),
            BodyLength::Unknown => (Upload::Chunked, None),
        };
        HttpTransfer {
            out: request_head(&config),
            config,
            conn: None,
            opened: false,
            out_pos: 0,
            upload,
            pause: PauseState::default(),
            inbuf: Vec::new(),
            head: Head::Pending,
            decoder: Decoder::Identity,
            held: None,
            eof: false,
            received_any: false,
            progress: Progress {
                expected_sent,
                ..Progress::default()
            },
        }
    }

    pub(super) fn owns(&self, socket: Socket) -> bool {
        self.conn.as_ref().and_then(Connection::socket) == Some(socket)
    }

    pub(super) fn set_pause(&mut self, pause: PauseState) -> PauseState {
        mem::replace(&mut self.pause, pause)
    }

    pub(super) fn close(&mut self, events: &mut VecDeque<EngineEvent>) {
        if let Some(conn) = &mut self.conn {
            conn.close(events);
        }
    }

    pub(super) fn drive(
        &mut self,
        id: HandleId,
        events: &mut VecDeque<EngineEvent>,
        cb: &mut dyn Callbacks,
    ) -> Step {
        match self.run(id, events, cb) {
            Ok(true) => Step::Done(ResultCode::Ok, None),
            Ok(false) => {
                self.update_interest(events);
                Step::Pending
            }
            Err((code, os_error)) => Step::Done(code, os_error),
        }
    }

    fn run(
        &mut self,
        id: HandleId,
        events: &mut VecDeque<EngineEvent>,
        cb: &mut dyn Callbacks,
    ) -> Result<bool, Failed> {
        if self.conn.is_none() {
            log::trace!("{} {}", self.config.method, self.config.url);
            self.conn = Some(Connection::new(conn::resolve(&self.config.url)?));
        }
        let Some(conn) = self.conn.as_mut() else {
            return Ok(false);
        };
        if !conn.poll_connect(events)? {
            return Ok(false);
        }
        if !self.opened {
            self.opened = true;
            if let Some(socket) = conn.socket() {
                if cb.on_socket_open(id, socket) == Action::Abort {
                    return Err((ResultCode::AbortedByCallback, None));
                }
            }
        }

        self.send(id, cb)?;
        self.receive(id, cb)
    }

    fn send(&mut self, id: HandleId, cb: &mut dyn Callbacks) -> Result<(), Failed> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };
        loop {
            if !conn::write_some(conn, &self.out, &mut self.out_pos)? {
                return Ok(());
            }
            self.out.clear();
            self.out_pos = 0;

            if self.pause.send {
                return Ok(());
            }
            let want = match self.upload {
                Upload::Idle => return Ok(()),
                Upload::Length(remaining) => remaining.min(UPLOAD_CHUNK as u64) as usize,
                Upload::Chunked => UPLOAD_CHUNK,
            };

            let mut buf = vec![0; want];
            let n = match cb.on_read(id, &mut buf) {
                FillResult::Pause => {
                    log::trace!("upload paused");
                    self.pause.send = true;
                    return Ok(());
                }
                FillResult::Abort => return Err((ResultCode::AbortedByCallback, None)),
                FillResult::Bytes(n) => n.min(want),
            };

            match self.upload {
                Upload::Chunked if n == 0 => {
                    self.out.extend_from_slice(b"0\r\n\r\n");
                    self.upload = Upload::Idle;
                }
                Upload::Chunked => {
                    let _ = write!(self.out, "{n:x}\r\n");
                    self.out.extend_from_slice(&buf[..n]);
                    self.out.extend_from_slice(b"\r\n");
                }
                Upload::Length(_) if n == 0 => {
                    log::debug!("request body ended before its declared length");
                    return Err((ResultCode::PartialFile, None));
                }
                Upload::Length(remaining) => {
                    self.out.extend_from_slice(&buf[..n]);
                    let remaining = remaining - n as u64;
                    self.upload = if remaining == 0 {
                        Upload::Idle
                    } else {
                        Upload::Length(remaining)
                    };
                }
                Upload::Idle => {}
            }

            if n > 0 {
                self.progress.sent += n as u64;
                cb.on_progress(id, self.progress);
            }
        }
    }

    fn receive(&mut self, id: HandleId, cb: &mut dyn Callbacks) -> Result<bool, Failed> {
        let mut buf = vec![0; READ_CHUNK];
        loop {
            if matches!(self.head, Head::Pending) {
                self.parse_head(id, cb)?;
            }
            if matches!(self.head, Head::Done(_)) && self.deliver_body(id, cb)? {
                return Ok(true);
            }
            if self.pause.receive {
                return Ok(false);
            }
            if self.eof {
                return Err(self.eof_error());
            }

            let Some(conn) = self.conn.as_mut() else {
                return Ok(false);
            };
            match conn::read_some(conn, &mut buf)? {
                ReadOutcome::Data(n) => {
                    self.inbuf.extend_from_slice(&buf[..n]);
                    self.received_any = true;
                }
                ReadOutcome::Eof => self.eof = true,
                ReadOutcome::WouldBlock => return Ok(false),
            }
        }
    }

    fn eof_error(&self) -> Failed {
        match self.head {
            Head::Pending if !self.received_any => (ResultCode::GotNothing, None),
            Head::Pending => (ResultCode::RecvError, None),
            Head::Done(_) => (ResultCode::PartialFile, None),
        }
    }

    /// Hands every complete head to the header callback, skipping interim
    /// `1xx` heads, and sets up the body framing of the final one. A `101`
    /// head fails the transfer.
    fn parse_head(&mut self, id: HandleId, cb: &mut dyn Callbacks) -> Result<(), Failed> {
        loop {
            let Some(end) = find_head_end(&self.inbuf) else {
                if self.inbuf.len() > MAX_HEAD {
                    log::debug!("response head exceeds {MAX_HEAD} bytes");
                    return Err((ResultCode::WeirdServerReply, None));
                }
                return Ok(());
            };
            let head: Vec<u8> = self.inbuf.drain(..end).collect();
            let parsed = parse_response_head(&head);
            let content_length = parsed.as_ref().and_then(|p| p.content_length);

            for line in lines(&head) {
                // Pausing the header callback is not supported; treat it as proceed.
                if cb.on_header(id, line, content_length) == Action::Abort {
                    return Err((ResultCode::AbortedByCallback, None));
                }
            }

            let parsed = parsed.ok_or((ResultCode::WeirdServerReply, None))?;
            if parsed.status == 101 {
                log::debug!("server switched protocols");
                return Err((ResultCode::WeirdServerReply, None));
            }
            if (100..200).contains(&parsed.status) {
                log::trace!("interim {} response", parsed.status);
                continue;
            }

            if self.config.decompress {
                self.decoder = Decoder::for_encoding(parsed.content_encoding.as_deref());
            }
            let framing = if self.config.no_body || matches!(parsed.status, 204 | 304) {
                Framing::Finished
            } else if parsed.chunked {
                Framing::Chunked(Chunked::Size)
            } else {
                match parsed.content_length {
                    Some(0) => Framing::Finished,
                    Some(n) => Framing::Length(n),
                    None => Framing::Close,
                }
            };
            log::trace!("response {} with {framing:?} framing", parsed.status);

            self.progress.expected_received = parsed.content_length;
            self.head = Head::Done(framing);
            cb.on_progress(id, self.progress);
            return Ok(());
        }
    }

    /// Delivers decoded body bytes until the body ends, more input is needed
    /// or the callback pauses. Returns true at the end of the body.
    fn deliver_body(&mut self, id: HandleId, cb: &mut dyn Callbacks) -> Result<bool, Failed> {
        loop {
            if self.pause.receive {
                return Ok(false);
            }
            if let Some(data) = self.held.take() {
                if !self.deliver(id, data, cb)? {
                    return Ok(false);
                }
            }

            let Head::Done(framing) = &mut self.head else {
                return Ok(false);
            };
            match next_raw(framing, &mut self.inbuf, self.eof)? {
                Some(raw) => {
                    self.progress.received += raw.len() as u64;
                    let decoded = self.decoder.decode(&raw).map_err(bad_encoding)?;
                    cb.on_progress(id, self.progress);
                    if !decoded.is_empty() && !self.deliver(id, decoded, cb)? {
                        return Ok(false);
                    }
                }
                None => {
                    if *framing != Framing::Finished {
                        return Ok(false);
                    }
                    let tail = self.decoder.finish().map_err(bad_encoding)?;
                    if !tail.is_empty() && !self.deliver(id, tail, cb)? {
                        return Ok(false);
                    }
                    return Ok(true);
                }
            }
        }
    }

    fn deliver(&mut self, id: HandleId, data: Vec<u8>, cb: &mut dyn Callbacks) -> Result<bool, Failed> {
        match cb.on_write(id, &data) {
            Action::Proceed => Ok(true),
            Action::Pause => {
                log::trace!("download paused with {} bytes held", data.len());
                self.held = Some(data);
                self.pause.receive = true;
                Ok(false)
            }
            Action::Abort => Err((ResultCode::AbortedByCallback, None)),
        }
    }

    fn update_interest(&mut self, events: &mut VecDeque<EngineEvent>) {
        let write = self.out_pos < self.out.len();
        let read = !self.pause.receive;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if !conn.is_connected() {
            return;
        }
        let action = match (read, write) {
            (true, true) => SocketAction::ReadWrite,
            (true, false) => SocketAction::Read,
            (false, true) => SocketAction::Write,
            (false, false) => SocketAction::None,
        };
        conn.set_interest(action, events);
    }
}

fn bad_encoding(e: std::io::Error) -> Failed {
    log::debug!("content decoding failed: {e}");
    (ResultCode::BadContentEncoding, None)
}

/// Takes the next run of raw body bytes out of `inbuf`.
///
/// Returns `None` when more input is needed or the body is complete, in
/// which case `framing` is [`Framing::Finished`].
fn next_raw(framing: &mut Framing, inbuf: &mut Vec<u8>, eof: bool) -> Result<Option<Vec<u8>>, Failed> {
    loop {
        match framing {
            Framing::Finished => return Ok(None),
            Framing::Close => {
                if !inbuf.is_empty() {
                    return Ok(Some(mem::take(inbuf)));
                }
                if eof {
                    *framing = Framing::Finished;
                }
                return Ok(None);
            }
            Framing::Length(remaining) => {
                if inbuf.is_empty() {
                    return Ok(None);
                }
                let n = (*remaining).min(inbuf.len() as u64) as usize;
                *remaining -= n as u64;
                if *remaining == 0 {
                    *framing = Framing::Finished;
                }
                return Ok(Some(inbuf.drain(..n).collect()));
            }
            Framing::Chunked(state) => match state {
                Chunked::Size => match httparse::parse_chunk_size(inbuf) {
                    Ok(httparse::Status::Complete((used, size))) => {
                        inbuf.drain(..used);
                        *state = if size == 0 {
                            Chunked::Trailer
                        } else {
                            Chunked::Data(size)
                        };
                    }
                    Ok(httparse::Status::Partial) => return Ok(None),
                    Err(_) => {
                        log::debug!("invalid chunk size line");
                        return Err((ResultCode::RecvError, None));
                    }
                },
                Chunked::Data(remaining) => {
                    if inbuf.is_empty() {
                        return Ok(None);
                    }
                    let n = (*remaining).min(inbuf.len() as u64) as usize;
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        *state = Chunked::DataEnd;
                    }
                    return Ok(Some(inbuf.drain(..n).collect()));
                }
                Chunked::DataEnd => {
                    if inbuf.len() < 2 {
                        return Ok(None);
                    }
                    if &inbuf[..2] != b"\r\n" {
                        log::debug!("chunk data not followed by CRLF");
                        return Err((ResultCode::RecvError, None));
                    }
                    inbuf.drain(..2);
                    *state = Chunked::Size;
                }
                Chunked::Trailer => match find(inbuf, b"\r\n") {
                    Some(0) => {
                        inbuf.drain(..2);
                        *framing = Framing::Finished;
                    }
                    Some(end) => {
                        inbuf.drain(..end + 2);
                    }
                    None => return Ok(None),
                },
            },
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    find(buf, b"\r\n\r\n").map(|pos| pos + 4)
}

/// Splits a head into its CRLF terminated lines.
fn lines(head: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = head;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = find(rest, b"\r\n").map_or(rest.len(), |pos| pos + 2);
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

fn parse_response_head(head: &[u8]) -> Option<ParsedHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let mut config = httparse::ParserConfig::default();
    config.allow_obsolete_multiline_headers_in_responses(true);

    match config.parse_response(&mut response, head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return None,
        Err(e) => {
            log::debug!("response head rejected: {e}");
            return None;
        }
    }

    let content_length = find_header(response.headers, CONTENT_LENGTH.as_str())
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.trim().parse().ok());
    let chunked = find_header(response.headers, TRANSFER_ENCODING.as_str())
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.rsplit(',').next())
        .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"));
    let content_encoding = find_header(response.headers, CONTENT_ENCODING.as_str())
        .and_then(|v| std::str::from_utf8(v).ok())
        .map(str::to_owned);

    Some(ParsedHead {
        status: response.code?,
        content_length,
        chunked,
        content_encoding,
    })
}

fn find_header<'a>(headers: &'a [httparse::Header], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value)
}

/// A custom header line from [`TransferConfig::headers`].
#[derive(Debug, PartialEq, Eq)]
enum CustomField<'a> {
    Suppress(&'a str),
    Set(&'a str, &'a str),
}

fn custom_field(line: &str) -> Option<CustomField<'_>> {
    if let Some((name, value)) = line.split_once(':') {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let value = value.trim();
        return Some(if value.is_empty() {
            CustomField::Suppress(name)
        } else {
            CustomField::Set(name, value)
        });
    }
    let name = line.strip_suffix(';')?.trim();
    (!name.is_empty()).then_some(CustomField::Set(name, ""))
}

/// Serializes the request line and header fields.
fn request_head(config: &TransferConfig) -> Vec<u8> {
    let url = &config.url;
    let mut target = url.path().to_owned();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => String::new(),
    };

    // (name, value, added by the engine)
    let mut fields: Vec<(String, String, bool)> = vec![
        ("Host".into(), host, true),
        ("Accept".into(), "*/*".into(), true),
    ];
    match config.body_length {
        BodyLength::NoBody => {}
        BodyLength::Length(n) => fields.push(("Content-Length".into(), n.to_string(), true)),
        BodyLength::Unknown => fields.push(("Transfer-Encoding".into(), "chunked".into(), true)),
    }
    if config.decompress {
        if let Some(encodings) = decode::accept_encoding() {
            fields.push(("Accept-Encoding".into(), encodings.into(), true));
        }
    }

    for line in &config.headers {
        let Some(field) = custom_field(line) else {
            log::warn!("ignoring malformed header line {line:?}");
            continue;
        };
        let name = match field {
            CustomField::Suppress(name) | CustomField::Set(name, _) => name,
        };
        fields.retain(|(n, _, builtin)| !(*builtin && n.eq_ignore_ascii_case(name)));
        if let CustomField::Set(name, value) = field {
            fields.push((name.to_owned(), value.to_owned(), false));
        }
    }

    let mut head = Vec::with_capacity(256);
    let _ = write!(head, "{} {} HTTP/1.1\r\n", config.method, target);
    for (name, value, _) in &fields {
        if value.is_empty() {
            let _ = write!(head, "{name}:\r\n");
        } else {
            let _ = write!(head, "{name}: {value}\r\n");
        }
    }
    head.extend_from_slice(b"\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn config(url: &str, body_length: BodyLength, headers: &[&str]) -> TransferConfig {
        TransferConfig {
            url: Url::parse(url).unwrap(),
            method: "POST".into(),
            headers: headers.iter().map(|s| s.to_string()).collect(),
            body_length,
            no_body: false,
            decompress: false,
        }
    }

    fn head(config: &TransferConfig) -> String {
        String::from_utf8(request_head(config)).unwrap()
    }

    #[test]
    fn request_line_and_builtin_fields() {
        let c = config("http://example.com:8080/a/b?x=1#frag", BodyLength::Length(3), &[]);
        assert_eq!(
            head(&c),
            "POST /a/b?x=1 HTTP/1.1\r\n\
             Host: example.com:8080\r\n\
             Accept: */*\r\n\
             Content-Length: 3\r\n\
             \r\n"
        );
    }

    #[test]
    fn unknown_length_uses_chunked_framing() {
        let c = config("http://example.com/", BodyLength::Unknown, &[]);
        assert!(head(&c).contains("Transfer-Encoding: chunked\r\n"));
    }

    #[test]
    fn custom_lines_override_suppress_and_blank() {
        let c = config(
            "http://example.com/",
            BodyLength::NoBody,
            &["Accept: text/html", "Host:", "X-Empty;", "Expect:", "User-Agent: test"],
        );
        let head = head(&c);
        assert!(head.contains("Accept: text/html\r\n"));
        assert!(!head.contains("*/*"));
        assert!(!head.contains("Host"));
        assert!(head.contains("X-Empty:\r\n"));
        assert!(!head.contains("Expect"));
        assert!(head.contains("User-Agent: test\r\n"));
    }

    #[test]
    fn custom_field_forms() {
        assert_eq!(custom_field("A: b"), Some(CustomField::Set("A", "b")));
        assert_eq!(custom_field("A:"), Some(CustomField::Suppress("A")));
        assert_eq!(custom_field("A;"), Some(CustomField::Set("A", "")));
        assert_eq!(custom_field(": b"), None);
        assert_eq!(custom_field("nonsense"), None);
    }

    #[test]
    fn head_lines_keep_crlf() {
        let head = b"HTTP/1.1 200 OK\r\nA: b\r\n\r\n";
        let lines: Vec<&[u8]> = lines(head).collect();
        assert_eq!(lines, vec![&b"HTTP/1.1 200 OK\r\n"[..], &b"A: b\r\n"[..], &b"\r\n"[..]]);
    }

    #[test]
    fn parsed_head_framing_fields() {
        let parsed = parse_response_head(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\nContent-Encoding: gzip\r\n\r\n",
        )
        .unwrap();
        assert_eq!(parsed.status, 200);
        assert!(parsed.chunked);
        assert_eq!(parsed.content_encoding.as_deref(), Some("gzip"));

        let folded = parse_response_head(b"HTTP/1.1 200 OK\r\nX-A: a\r\n b\r\nContent-Length: 4\r\n\r\n").unwrap();
        assert_eq!(folded.content_length, Some(4));

        assert!(parse_response_head(b"garbage\r\n\r\n").is_none());
    }

    #[test]
    fn chunked_body_with_trailer() {
        let mut framing = Framing::Chunked(Chunked::Size);
        let mut inbuf = b"5\r\nhello\r\n6;ext=1\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n".to_vec();
        let mut body = Vec::new();
        while let Some(raw) = next_raw(&mut framing, &mut inbuf, false).unwrap() {
            body.extend(raw);
        }
        assert_eq!(body, b"hello world");
        assert_eq!(framing, Framing::Finished);
        assert!(inbuf.is_empty());
    }

    #[test]
    fn chunked_body_across_reads() {
        let mut framing = Framing::Chunked(Chunked::Size);
        let mut inbuf = b"a\r\n01234".to_vec();
        assert_eq!(next_raw(&mut framing, &mut inbuf, false).unwrap().unwrap(), b"01234");
        assert!(next_raw(&mut framing, &mut inbuf, false).unwrap().is_none());

        inbuf.extend_from_slice(b"56789\r");
        assert_eq!(next_raw(&mut framing, &mut inbuf, false).unwrap().unwrap(), b"56789");
        assert!(next_raw(&mut framing, &mut inbuf, false).unwrap().is_none());
        assert_eq!(framing, Framing::Chunked(Chunked::DataEnd));

        inbuf.extend_from_slice(b"\nzz\r\n");
        assert_eq!(
            next_raw(&mut framing, &mut inbuf, false).unwrap_err().0,
            ResultCode::RecvError
        );
    }

    #[test]
    fn length_and_close_framing() {
        let mut framing = Framing::Length(4);
        let mut inbuf = b"abcdef".to_vec();
        assert_eq!(next_raw(&mut framing, &mut inbuf, false).unwrap().unwrap(), b"abcd");
        assert_eq!(framing, Framing::Finished);

        let mut framing = Framing::Close;
        let mut inbuf = b"xyz".to_vec();
        assert_eq!(next_raw(&mut framing, &mut inbuf, false).unwrap().unwrap(), b"xyz");
        assert!(next_raw(&mut framing, &mut inbuf, false).unwrap().is_none());
        assert_eq!(framing, Framing::Close);
        assert!(next_raw(&mut framing, &mut inbuf, true).unwrap().is_none());
        assert_eq!(framing, Framing::Finished);
    }
}
