//! The readiness-driven transfer engine.
//!
//! An [`Engine`] runs many transfers at once without ever blocking on a
//! socket. It tells its driver which sockets to watch and when to wake it
//! through [`EngineEvent`]s, and the driver calls [`Engine::perform`] whenever
//! one of those fires. Finished transfers are reported as [`Completion`]s.
//!
//! Everything a transfer produces (header lines, body bytes, requests for
//! outbound bytes) is handed to a [`Callbacks`] implementation passed into
//! `perform`, so the engine never holds on to its caller.
//!
//! [`MioEngine`] is the built-in implementation: plain HTTP/1.1 and passive
//! mode FTP over non-blocking `mio` sockets.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt, io,
    os::fd::RawFd,
    time::Duration,
};

use url::Url;

mod conn;
mod decode;
mod ftp;
mod http;

use self::{ftp::FtpTransfer, http::HttpTransfer};

/// Identifies one transfer inside an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(usize);

impl HandleId {
    /// Wraps an index.
    #[inline]
    pub fn new(index: usize) -> HandleId {
        HandleId(index)
    }

    /// The wrapped index.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// A socket owned by the engine, identified by its file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Socket(RawFd);

impl Socket {
    /// Wraps a raw file descriptor.
    #[inline]
    pub fn from_raw_fd(fd: RawFd) -> Socket {
        Socket(fd)
    }

    /// The file descriptor.
    #[inline]
    pub fn as_raw_fd(self) -> RawFd {
        self.0
    }
}

/// What the engine wants to be told about a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketAction {
    /// Keep the socket registered but report nothing.
    None,
    /// Report readability.
    Read,
    /// Report writability.
    Write,
    /// Report both.
    ReadWrite,
    /// The socket is about to be closed; forget it.
    Unregister,
}

/// A request to arm the driver's single timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerRequest {
    /// Disarm the timer.
    Cancel,
    /// Call `perform(Perform::Timeout)` as soon as possible.
    Immediate,
    /// Call `perform(Perform::Timeout)` after the delay.
    After(Duration),
}

/// A request from the engine to its driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// Change what is watched on a socket.
    Socket {
        /// The socket.
        socket: Socket,
        /// What to watch for.
        action: SocketAction,
    },
    /// Change the timer.
    Timer(TimerRequest),
}

/// The low level outcome of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResultCode {
    /// The transfer finished.
    Ok,
    /// The URL scheme is not supported by the engine.
    UnsupportedProtocol,
    /// The URL could not be used.
    UrlMalformat,
    /// The host name did not resolve.
    CouldntResolveHost,
    /// No address of the host accepted a connection.
    CouldntConnect,
    /// The engine gave up waiting.
    OperationTimedOut,
    /// Writing to the peer failed.
    SendError,
    /// Reading from the peer failed.
    RecvError,
    /// The peer closed the connection without sending anything.
    GotNothing,
    /// A callback returned [`Action::Abort`] or [`FillResult::Abort`].
    AbortedByCallback,
    /// The peer sent something that is not a valid reply.
    WeirdServerReply,
    /// The connection ended before the announced body length.
    PartialFile,
    /// The body could not be decoded.
    BadContentEncoding,
    /// The FTP server has no such file.
    RemoteFileNotFound,
    /// Anything else.
    Other,
}

/// A finished transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    /// The transfer.
    pub handle: HandleId,
    /// How it ended.
    pub result: ResultCode,
    /// The OS error behind `result`, when there was one.
    pub os_error: Option<io::ErrorKind>,
}

/// The declared length of an outbound body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyLength {
    /// Nothing is uploaded.
    NoBody,
    /// Exactly this many bytes are uploaded.
    Length(u64),
    /// The length is not known up front; HTTP uses chunked framing.
    Unknown,
}

/// Everything an engine needs to run one attempt.
///
/// Engines never follow redirects; each hop is a new attempt.
#[derive(Clone, Debug)]
pub struct TransferConfig {
    /// The target.
    pub url: Url,
    /// The request method.
    pub method: String,
    /// Custom header lines: `Name: value` adds or overrides a field,
    /// `Name:` suppresses a field the engine would add itself, and `Name;`
    /// sends the field with an empty value.
    pub headers: Vec<String>,
    /// The outbound body length.
    pub body_length: BodyLength,
    /// The response has no body (`HEAD`).
    pub no_body: bool,
    /// Advertise and decode the content encodings the engine supports.
    pub decompress: bool,
}

/// Which directions of a transfer are paused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PauseState {
    /// No outbound bytes are requested.
    pub send: bool,
    /// No inbound bytes are delivered.
    pub receive: bool,
}

/// Why `perform` is called.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Perform {
    /// The timer fired; every transfer makes whatever progress it can.
    Timeout,
    /// A watched socket became ready.
    Socket {
        /// The socket.
        socket: Socket,
        /// It can be read, or hit an error.
        readable: bool,
        /// It can be written, or hit an error.
        writable: bool,
    },
}

/// The answer to a header or body callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Keep going.
    Proceed,
    /// Fail the transfer with [`ResultCode::AbortedByCallback`].
    Abort,
    /// Stop delivering in this direction until unpaused. The data passed to
    /// the refusing callback is delivered again after the unpause.
    Pause,
}

/// The answer to a request for outbound bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillResult {
    /// This many bytes were written to the buffer; zero ends the body.
    Bytes(usize),
    /// Fail the transfer with [`ResultCode::AbortedByCallback`].
    Abort,
    /// Stop asking until unpaused.
    Pause,
}

/// The answer to a request to rewind the outbound body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekResult {
    /// The body restarts at the requested offset.
    Ok,
    /// Rewinding failed; the transfer fails.
    Fail,
    /// The body can not be rewound; the engine may work around it.
    CantSeek,
}

/// Byte counts of a running transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Body bytes sent.
    pub sent: u64,
    /// Body bytes that will be sent, when known.
    pub expected_sent: Option<u64>,
    /// Body bytes received, before decoding.
    pub received: u64,
    /// Body bytes announced by the peer, when known.
    pub expected_received: Option<u64>,
}

/// Where an engine delivers what its transfers produce.
///
/// Every call happens inside [`Engine::perform`], on the driver's thread.
pub trait Callbacks {
    /// One raw header line, CRLF included. HTTP delivers the blank line that
    /// ends the head, and the lines of interim `1xx` heads; FTP delivers
    /// every reply line.
    fn on_header(&mut self, handle: HandleId, data: &[u8], content_length: Option<u64>) -> Action;

    /// Decoded body bytes.
    fn on_write(&mut self, handle: HandleId, data: &[u8]) -> Action;

    /// Fill `buf` with outbound body bytes.
    fn on_read(&mut self, handle: HandleId, buf: &mut [u8]) -> FillResult;

    /// Restart the outbound body at `offset`.
    fn on_seek(&mut self, handle: HandleId, offset: u64) -> SeekResult;

    /// Byte counts changed.
    fn on_progress(&mut self, handle: HandleId, progress: Progress);

    /// A socket was opened for `handle`.
    fn on_socket_open(&mut self, handle: HandleId, socket: Socket) -> Action {
        let _ = (handle, socket);
        Action::Proceed
    }
}

/// A transfer engine.
pub trait Engine: Send {
    /// Starts a transfer. The engine asks for a timer or a socket watch
    /// before it does any I/O.
    fn add_handle(&mut self, handle: HandleId, config: TransferConfig);

    /// Stops a transfer, closing its sockets. No completion is reported.
    fn remove_handle(&mut self, handle: HandleId);

    /// Pauses or unpauses the directions of a transfer.
    fn set_pause(&mut self, handle: HandleId, pause: PauseState);

    /// Makes progress, returning the number of transfers still running.
    fn perform(&mut self, perform: Perform, callbacks: &mut dyn Callbacks) -> usize;

    /// Pops the next socket or timer request.
    fn next_event(&mut self) -> Option<EngineEvent>;

    /// Pops the next finished transfer.
    fn next_completion(&mut self) -> Option<Completion>;
}

/// How far one drive of a transfer got.
pub(crate) enum Step {
    Pending,
    Done(ResultCode, Option<io::ErrorKind>),
}

/// A failed drive, carried through `?`.
pub(crate) type Failed = (ResultCode, Option<io::ErrorKind>);

/// The built-in engine: HTTP/1.1 and FTP over non-blocking TCP.
///
/// Host names are resolved synchronously when a transfer first runs. There
/// is no TLS and no connection reuse; every attempt opens its own
/// connection and closes it when done.
#[derive(Default)]
pub struct MioEngine {
    transfers: BTreeMap<HandleId, Transfer>,
    events: VecDeque<EngineEvent>,
    completions: VecDeque<Completion>,
}

enum Transfer {
    Http(HttpTransfer),
    Ftp(FtpTransfer),
    Rejected(ResultCode),
    Finished,
}

// ===== impl MioEngine =====

impl MioEngine {
    /// Creates an engine with no transfers.
    pub fn new() -> MioEngine {
        MioEngine::default()
    }

    fn drive(&mut self, handle: HandleId, callbacks: &mut dyn Callbacks) {
        let Some(transfer) = self.transfers.get_mut(&handle) else {
            return;
        };
        let events = &mut self.events;
        let step = match transfer {
            Transfer::Http(t) => t.drive(handle, events, callbacks),
            Transfer::Ftp(t) => t.drive(handle, events, callbacks),
            Transfer::Rejected(code) => Step::Done(*code, None),
            Transfer::Finished => return,
        };

        if let Step::Done(result, os_error) = step {
            transfer.close(events);
            *transfer = Transfer::Finished;
            log::trace!("transfer {handle:?} finished: {result:?} {os_error:?}");
            self.completions.push_back(Completion {
                handle,
                result,
                os_error,
            });
        }
    }

    fn owner_of(&self, socket: Socket) -> Option<HandleId> {
        self.transfers
            .iter()
            .find(|(_, t)| t.owns(socket))
            .map(|(id, _)| *id)
    }

    fn running(&self) -> usize {
        self.transfers
            .values()
            .filter(|t| !matches!(t, Transfer::Finished))
            .count()
    }
}

impl Engine for MioEngine {
    fn add_handle(&mut self, handle: HandleId, config: TransferConfig) {
        let transfer = if !config.url.has_host() && config.url.scheme() != "file" {
            Transfer::Rejected(ResultCode::UrlMalformat)
        } else {
            match config.url.scheme() {
                "http" => Transfer::Http(HttpTransfer::new(config)),
                "ftp" => Transfer::Ftp(FtpTransfer::new(config)),
                _ => Transfer::Rejected(ResultCode::UnsupportedProtocol),
            }
        };

        if let Some(mut old) = self.transfers.insert(handle, transfer) {
            log::warn!("transfer {handle:?} replaced while still added");
            old.close(&mut self.events);
        }
        self.events.push_back(EngineEvent::Timer(TimerRequest::Immediate));
    }

    fn remove_handle(&mut self, handle: HandleId) {
        if let Some(mut transfer) = self.transfers.remove(&handle) {
            transfer.close(&mut self.events);
        }
    }

    fn set_pause(&mut self, handle: HandleId, pause: PauseState) {
        let Some(transfer) = self.transfers.get_mut(&handle) else {
            return;
        };
        let previous = match transfer {
            Transfer::Http(t) => t.set_pause(pause),
            Transfer::Ftp(t) => t.set_pause(pause),
            Transfer::Rejected(_) | Transfer::Finished => return,
        };
        if (previous.send && !pause.send) || (previous.receive && !pause.receive) {
            self.events.push_back(EngineEvent::Timer(TimerRequest::Immediate));
        }
    }

    fn perform(&mut self, perform: Perform, callbacks: &mut dyn Callbacks) -> usize {
        match perform {
            Perform::Timeout => {
                let handles: Vec<HandleId> = self.transfers.keys().copied().collect();
                for handle in handles {
                    self.drive(handle, callbacks);
                }
            }
            Perform::Socket { socket, .. } => match self.owner_of(socket) {
                Some(handle) => self.drive(handle, callbacks),
                None => log::trace!("readiness on unknown socket {socket:?}"),
            },
        }
        self.running()
    }

    fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    fn next_completion(&mut self) -> Option<Completion> {
        self.completions.pop_front()
    }
}

impl fmt::Debug for MioEngine {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MioEngine")
            .field("transfers", &self.transfers.len())
            .field("running", &self.running())
            .finish()
    }
}

// ===== impl Transfer =====

impl Transfer {
    fn owns(&self, socket: Socket) -> bool {
        match self {
            Transfer::Http(t) => t.owns(socket),
            Transfer::Ftp(t) => t.owns(socket),
            Transfer::Rejected(_) | Transfer::Finished => false,
        }
    }

    fn close(&mut self, events: &mut VecDeque<EngineEvent>) {
        match self {
            Transfer::Http(t) => t.close(events),
            Transfer::Ftp(t) => t.close(events),
            Transfer::Rejected(_) | Transfer::Finished => {}
        }
    }
}
