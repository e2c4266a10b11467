//! The readiness multiplexer in front of an [`Engine`].
//!
//! The multi handle owns the engine, the `mio` poll its sockets are
//! registered with, and the single timer the engine may ask for. Socket and
//! timer requests are drained from the engine after every call into it, and
//! finished transfers are handed back with their result code already mapped
//! to an [`Error`].

use std::{
    collections::HashMap,
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use mio::{event::Event, unix::SourceFd, Events, Interest, Poll, Token, Waker};

use crate::{
    easy::EasyHandle,
    engine::{
        Callbacks, Completion, Engine, EngineEvent, HandleId, PauseState, Perform, ResultCode,
        Socket, SocketAction, TimerRequest,
    },
    error::{Error, ErrorCode},
};

/// Token reserved for the work queue's waker.
pub(crate) const WAKER: Token = Token(usize::MAX);

/// A transfer the engine reported as finished.
pub(crate) type Finished = (HandleId, crate::Result<()>);

pub(crate) struct MultiHandle {
    engine: Box<dyn Engine>,
    poll: Poll,
    sockets: HashMap<Socket, bool>,
    timer: Option<Instant>,
    last_timer: Option<TimerRequest>,
    running: usize,
}

// ===== impl MultiHandle =====

impl MultiHandle {
    pub(crate) fn new(engine: Box<dyn Engine>) -> io::Result<(MultiHandle, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let multi = MultiHandle {
            engine,
            poll,
            sockets: HashMap::new(),
            timer: None,
            last_timer: None,
            running: 0,
        };
        Ok((multi, waker))
    }

    /// Starts the attempt `easy` was configured for.
    ///
    /// # Panics
    ///
    /// Panics when the handle is already added or was not configured.
    pub(crate) fn add(&mut self, easy: &mut EasyHandle) {
        assert!(!easy.is_added(), "easy handle added twice");
        let config = easy
            .take_config()
            .expect("easy handle added without a configuration");
        log::trace!("adding {:?} for {}", easy.id(), config.url);
        self.engine.add_handle(easy.id(), config);
        easy.set_added(true);
        self.running += 1;
        self.process_events();
    }

    /// Stops the attempt of `easy`, if it runs.
    pub(crate) fn remove(&mut self, easy: &mut EasyHandle) {
        if !easy.is_added() {
            return;
        }
        log::trace!("removing {:?}", easy.id());
        self.engine.remove_handle(easy.id());
        easy.set_added(false);
        self.running = self.running.saturating_sub(1);
        self.process_events();
    }

    pub(crate) fn set_pause(&mut self, handle: HandleId, pause: PauseState) {
        self.engine.set_pause(handle, pause);
        self.process_events();
    }

    /// When the engine wants `perform(Timeout)`.
    #[inline]
    pub(crate) fn timer(&self) -> Option<Instant> {
        self.timer
    }

    /// Number of attempts the engine still runs.
    #[inline]
    pub(crate) fn running(&self) -> usize {
        self.running
    }

    /// Waits for socket readiness or the waker, at most `timeout`.
    pub(crate) fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            result => result,
        }
    }

    /// Drives the engine for one readiness event.
    pub(crate) fn socket_ready(&mut self, event: &Event, callbacks: &mut dyn Callbacks) -> Vec<Finished> {
        // Only registered descriptors carry their own fd as the token.
        let Ok(fd) = i32::try_from(event.token().0) else {
            return Vec::new();
        };
        let failed = event.is_error() || event.is_read_closed() || event.is_write_closed();
        let perform = Perform::Socket {
            socket: Socket::from_raw_fd(fd),
            readable: event.is_readable() || failed,
            writable: event.is_writable() || failed,
        };
        self.perform(perform, callbacks)
    }

    /// Drives every transfer when the engine's timer is due.
    pub(crate) fn timer_due(&mut self, now: Instant, callbacks: &mut dyn Callbacks) -> Vec<Finished> {
        match self.timer {
            Some(deadline) if deadline <= now => {
                self.timer = None;
                self.last_timer = None;
                self.perform(Perform::Timeout, callbacks)
            }
            _ => Vec::new(),
        }
    }

    fn perform(&mut self, perform: Perform, callbacks: &mut dyn Callbacks) -> Vec<Finished> {
        let running = self.engine.perform(perform, callbacks);
        self.process_events();

        let mut finished = Vec::new();
        while let Some(completion) = self.engine.next_completion() {
            log::trace!("completion {completion:?}");
            finished.push((completion.handle, transfer_result(&completion)));
        }
        self.running = running;
        finished
    }

    fn process_events(&mut self) {
        while let Some(event) = self.engine.next_event() {
            match event {
                EngineEvent::Socket { socket, action } => self.register(socket, action),
                EngineEvent::Timer(request) => self.arm_timer(request),
            }
        }
    }

    fn register(&mut self, socket: Socket, action: SocketAction) {
        let fd = socket.as_raw_fd();
        let Ok(token) = usize::try_from(fd).map(Token) else {
            log::warn!("refusing to register descriptor {fd}");
            return;
        };
        let registered = self.sockets.get(&socket).copied().unwrap_or(false);
        let registry = self.poll.registry();
        log::trace!("socket {fd}: {action:?}");

        let interest = match action {
            SocketAction::Read => Interest::READABLE,
            SocketAction::Write => Interest::WRITABLE,
            SocketAction::ReadWrite => Interest::READABLE | Interest::WRITABLE,
            SocketAction::None | SocketAction::Unregister => {
                if registered {
                    // The engine may already have closed the descriptor.
                    let _ = registry.deregister(&mut SourceFd(&fd));
                }
                if action == SocketAction::Unregister {
                    self.sockets.remove(&socket);
                } else {
                    self.sockets.insert(socket, false);
                }
                return;
            }
        };

        let result = if registered {
            registry
                .reregister(&mut SourceFd(&fd), token, interest)
                .or_else(|_| registry.register(&mut SourceFd(&fd), token, interest))
        } else {
            registry.register(&mut SourceFd(&fd), token, interest)
        };
        match result {
            Ok(()) => {
                self.sockets.insert(socket, true);
            }
            Err(e) => log::warn!("registering socket {fd} failed: {e}"),
        }
    }

    fn arm_timer(&mut self, request: TimerRequest) {
        if self.timer.is_some() && self.last_timer == Some(request) {
            return;
        }
        let now = Instant::now();
        self.timer = match request {
            TimerRequest::Cancel => None,
            TimerRequest::Immediate => Some(now),
            TimerRequest::After(delay) => Some(now + delay),
        };
        self.last_timer = Some(request);
    }
}

impl std::fmt::Debug for MultiHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MultiHandle")
            .field("sockets", &self.sockets.len())
            .field("timer", &self.timer)
            .field("running", &self.running)
            .finish()
    }
}

/// Maps a low level result, refined by the OS error, to a transfer result.
pub(crate) fn transfer_result(completion: &Completion) -> crate::Result<()> {
    let os_error = completion.os_error;
    let code = match (completion.result, os_error) {
        (ResultCode::Ok, _) => return Ok(()),
        (_, Some(io::ErrorKind::ConnectionRefused)) => ErrorCode::CannotConnectToHost,
        (ResultCode::BadContentEncoding, _) => {
            return Err(Error::decode(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid content encoding",
            )))
        }
        (ResultCode::CouldntConnect, Some(io::ErrorKind::TimedOut)) => ErrorCode::TimedOut,
        (ResultCode::OperationTimedOut, _) => ErrorCode::TimedOut,
        (ResultCode::UnsupportedProtocol, _) => ErrorCode::UnsupportedUrl,
        (ResultCode::UrlMalformat, _) => ErrorCode::BadUrl,
        (ResultCode::CouldntResolveHost, _) => ErrorCode::CannotFindHost,
        (ResultCode::RecvError | ResultCode::SendError, Some(io::ErrorKind::ConnectionReset)) => {
            ErrorCode::NetworkConnectionLost
        }
        (ResultCode::GotNothing | ResultCode::WeirdServerReply, _) => ErrorCode::BadServerResponse,
        (ResultCode::RemoteFileNotFound, _) => ErrorCode::FileDoesNotExist,
        _ => ErrorCode::Unknown,
    };

    Err(match (code, os_error) {
        (ErrorCode::TimedOut, _) => Error::timed_out(),
        (code, Some(kind)) => Error::request(code, io::Error::from(kind)),
        (code, None) => Error::request(code, EngineFailure(completion.result)),
    })
}

#[derive(Debug)]
struct EngineFailure(ResultCode);

impl std::fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "transfer failed: {:?}", self.0)
    }
}

impl std::error::Error for EngineFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(result: ResultCode, os_error: Option<io::ErrorKind>) -> Completion {
        Completion {
            handle: HandleId::new(0),
            result,
            os_error,
        }
    }

    fn code(result: ResultCode, os_error: Option<io::ErrorKind>) -> ErrorCode {
        transfer_result(&completion(result, os_error)).unwrap_err().code()
    }

    #[test]
    fn ok_is_not_an_error() {
        assert!(transfer_result(&completion(ResultCode::Ok, None)).is_ok());
    }

    #[test]
    fn result_codes_are_classified() {
        use io::ErrorKind::*;

        assert_eq!(
            code(ResultCode::CouldntConnect, Some(ConnectionRefused)),
            ErrorCode::CannotConnectToHost
        );
        assert_eq!(
            code(ResultCode::SendError, Some(ConnectionRefused)),
            ErrorCode::CannotConnectToHost
        );
        assert_eq!(
            code(ResultCode::Other, Some(ConnectionRefused)),
            ErrorCode::CannotConnectToHost
        );
        assert_eq!(code(ResultCode::CouldntConnect, None), ErrorCode::Unknown);
        assert_eq!(code(ResultCode::UnsupportedProtocol, None), ErrorCode::UnsupportedUrl);
        assert_eq!(code(ResultCode::UrlMalformat, None), ErrorCode::BadUrl);
        assert_eq!(code(ResultCode::CouldntResolveHost, None), ErrorCode::CannotFindHost);
        assert_eq!(
            code(ResultCode::RecvError, Some(ConnectionReset)),
            ErrorCode::NetworkConnectionLost
        );
        assert_eq!(
            code(ResultCode::SendError, Some(ConnectionReset)),
            ErrorCode::NetworkConnectionLost
        );
        assert_eq!(code(ResultCode::RecvError, None), ErrorCode::Unknown);
        assert_eq!(code(ResultCode::GotNothing, None), ErrorCode::BadServerResponse);
        assert_eq!(code(ResultCode::WeirdServerReply, None), ErrorCode::BadServerResponse);
        assert_eq!(code(ResultCode::AbortedByCallback, None), ErrorCode::Unknown);
        assert_eq!(code(ResultCode::OperationTimedOut, None), ErrorCode::TimedOut);
        assert_eq!(code(ResultCode::CouldntConnect, Some(TimedOut)), ErrorCode::TimedOut);
    }

    #[test]
    fn timeouts_and_decoding_keep_their_kind() {
        let err = transfer_result(&completion(ResultCode::OperationTimedOut, None)).unwrap_err();
        assert!(err.is_timeout());

        let err = transfer_result(&completion(ResultCode::BadContentEncoding, None)).unwrap_err();
        assert!(err.is_decode());
    }

    struct Idle;

    impl Engine for Idle {
        fn add_handle(&mut self, _: HandleId, _: crate::engine::TransferConfig) {}
        fn remove_handle(&mut self, _: HandleId) {}
        fn set_pause(&mut self, _: HandleId, _: PauseState) {}
        fn perform(&mut self, _: Perform, _: &mut dyn Callbacks) -> usize {
            0
        }
        fn next_event(&mut self) -> Option<EngineEvent> {
            None
        }
        fn next_completion(&mut self) -> Option<Completion> {
            None
        }
    }

    #[test]
    fn identical_timer_requests_are_not_rearmed() {
        let (mut multi, _waker) = MultiHandle::new(Box::new(Idle)).unwrap();
        multi.arm_timer(TimerRequest::After(Duration::from_secs(5)));
        let first = multi.timer().unwrap();

        std::thread::sleep(Duration::from_millis(2));
        multi.arm_timer(TimerRequest::After(Duration::from_secs(5)));
        assert_eq!(multi.timer(), Some(first));

        multi.arm_timer(TimerRequest::Immediate);
        assert!(multi.timer().unwrap() < first);

        multi.arm_timer(TimerRequest::Cancel);
        assert_eq!(multi.timer(), None);
    }

    #[test]
    fn unregister_forgets_the_socket() {
        let (mut multi, _waker) = MultiHandle::new(Box::new(Idle)).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        let socket = Socket::from_raw_fd(std::os::fd::AsRawFd::as_raw_fd(&stream));

        multi.register(socket, SocketAction::Read);
        assert_eq!(multi.sockets.get(&socket), Some(&true));
        multi.register(socket, SocketAction::ReadWrite);
        assert_eq!(multi.sockets.get(&socket), Some(&true));
        multi.register(socket, SocketAction::None);
        assert_eq!(multi.sockets.get(&socket), Some(&false));
        multi.register(socket, SocketAction::Unregister);
        assert!(multi.sockets.get(&socket).is_none());
    }
}
