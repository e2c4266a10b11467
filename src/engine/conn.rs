use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    os::fd::AsRawFd,
    vec,
};

use mio::net::TcpStream;
use url::Url;

use super::{EngineEvent, Failed, ResultCode, Socket, SocketAction};

/// Resolves the host of `url`, blocking the calling thread.
pub(super) fn resolve(url: &Url) -> Result<Vec<SocketAddr>, Failed> {
    match url.socket_addrs(|| None) {
        Ok(addrs) if !addrs.is_empty() => Ok(addrs),
        Ok(_) => Err((ResultCode::CouldntResolveHost, None)),
        Err(e) => {
            log::debug!("resolving {:?} failed: {e}", url.host_str());
            Err((ResultCode::CouldntResolveHost, Some(e.kind())))
        }
    }
}

/// A non-blocking TCP connection that tries each resolved address in turn.
pub(super) struct Connection {
    addrs: vec::IntoIter<SocketAddr>,
    stream: Option<TcpStream>,
    connected: bool,
    interest: SocketAction,
    last_error: Option<io::ErrorKind>,
}

impl Connection {
    pub(super) fn new(addrs: Vec<SocketAddr>) -> Connection {
        Connection {
            addrs: addrs.into_iter(),
            stream: None,
            connected: false,
            interest: SocketAction::None,
            last_error: None,
        }
    }

    pub(super) fn socket(&self) -> Option<Socket> {
        self.stream
            .as_ref()
            .map(|s| Socket::from_raw_fd(s.as_raw_fd()))
    }

    #[inline]
    pub(super) fn is_connected(&self) -> bool {
        self.connected
    }

    pub(super) fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref()?.peer_addr().ok()
    }

    /// Starts or finishes connecting.
    ///
    /// Returns `Ok(true)` once connected, `Ok(false)` while the handshake is
    /// pending. A failed address is closed and the next one is tried.
    pub(super) fn poll_connect(&mut self, events: &mut VecDeque<EngineEvent>) -> Result<bool, Failed> {
        loop {
            if self.connected {
                return Ok(true);
            }

            if self.stream.is_none() {
                let Some(addr) = self.addrs.next() else {
                    return Err((ResultCode::CouldntConnect, self.last_error));
                };
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        log::trace!("connecting to {addr}");
                        self.stream = Some(stream);
                        self.set_interest(SocketAction::Write, events);
                    }
                    Err(e) => {
                        log::debug!("connect to {addr} failed: {e}");
                        self.last_error = Some(e.kind());
                    }
                }
                continue;
            }
            let Some(stream) = &self.stream else {
                continue;
            };

            match stream.take_error() {
                Ok(None) => {}
                Ok(Some(e)) | Err(e) => {
                    log::debug!("connect failed: {e}");
                    self.last_error = Some(e.kind());
                    self.close(events);
                    continue;
                }
            }

            match stream.peer_addr() {
                Ok(addr) => {
                    log::trace!("connected to {addr}");
                    if let Err(e) = stream.set_nodelay(true) {
                        log::trace!("TCP_NODELAY not set: {e}");
                    }
                    self.connected = true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(false),
                Err(e) => {
                    self.last_error = Some(e.kind());
                    self.close(events);
                }
            }
        }
    }

    /// Asks the driver to watch for `action`, if that changed.
    pub(super) fn set_interest(&mut self, action: SocketAction, events: &mut VecDeque<EngineEvent>) {
        let Some(socket) = self.socket() else {
            return;
        };
        if self.interest != action {
            self.interest = action;
            events.push_back(EngineEvent::Socket { socket, action });
        }
    }

    /// Unregisters and closes the socket.
    pub(super) fn close(&mut self, events: &mut VecDeque<EngineEvent>) {
        if let Some(socket) = self.socket() {
            events.push_back(EngineEvent::Socket {
                socket,
                action: SocketAction::Unregister,
            });
        }
        self.stream = None;
        self.connected = false;
        self.interest = SocketAction::None;
    }

    pub(super) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stream {
            Some(stream) => stream.read(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    pub(super) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stream {
            Some(stream) => stream.write(buf),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

/// What a non-blocking read produced.
pub(super) enum ReadOutcome {
    Data(usize),
    Eof,
    WouldBlock,
}

/// Reads once, retrying interrupted calls.
pub(super) fn read_some(conn: &mut Connection, buf: &mut [u8]) -> Result<ReadOutcome, Failed> {
    loop {
        return match conn.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("read failed: {e}");
                Err((ResultCode::RecvError, Some(e.kind())))
            }
        };
    }
}

/// Writes `buf[*pos..]` until it is flushed or the socket would block.
///
/// Returns true once everything was written.
pub(super) fn write_some(conn: &mut Connection, buf: &[u8], pos: &mut usize) -> Result<bool, Failed> {
    while *pos < buf.len() {
        match conn.write(&buf[*pos..]) {
            Ok(0) => return Err((ResultCode::SendError, None)),
            Ok(n) => *pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("write failed: {e}");
                return Err((ResultCode::SendError, Some(e.kind())));
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unresolvable_host() {
        let url = Url::parse("http://name.invalid/").unwrap();
        let (code, _) = resolve(&url).unwrap_err();
        assert_eq!(code, ResultCode::CouldntResolveHost);
    }

    #[test]
    fn literal_addresses_resolve_with_default_port() {
        let url = Url::parse("http://127.0.0.1/").unwrap();
        let addrs = resolve(&url).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn running_out_of_addresses_is_couldnt_connect() {
        let mut events = VecDeque::new();
        let mut conn = Connection::new(Vec::new());
        let (code, _) = conn.poll_connect(&mut events).unwrap_err();
        assert_eq!(code, ResultCode::CouldntConnect);
        assert!(events.is_empty());
    }
}
