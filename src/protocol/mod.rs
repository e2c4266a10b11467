//! The per-task controller.
//!
//! A [`NativeProtocol`] owns the easy handle of one task and drives it from
//! the first attempt to the task's completion: it configures each attempt,
//! turns engine callbacks into transfer state and delegate calls, and decides
//! on completion whether to redirect, retry with credentials, cache or
//! finish. Scheme specific behaviour lives behind [`ProtocolHandler`].

use std::{io, mem, path::PathBuf, sync::Arc, time::Instant};

use bytes::{Bytes, BytesMut};
use ::http::{
    header::{AUTHORIZATION, CONTENT_ENCODING},
    HeaderValue, StatusCode,
};
use url::Url;

use crate::{
    body,
    cache::{CachePolicy, CachedResponse, UrlCache},
    credential::{self, AuthenticationChallenge, Credential, ProtectionSpace},
    easy::EasyHandle,
    engine::{Action, BodyLength, FillResult, HandleId, PauseState, Progress, SeekResult, TransferConfig},
    error::{Error, ErrorCode},
    multi::MultiHandle,
    redirect::ActionKind,
    request::Request,
    response::Response,
    session::SessionConfig,
    state::{DataDrain, ParseError, TransferState},
    task::{ChallengeDisposition, Completed, RedirectDecision, ResponseDisposition, Task},
    util,
};

mod ftp;
mod http;

pub(crate) use self::{ftp::FtpProtocol, http::HttpProtocol};

/// What to do once an attempt completed.
#[derive(Debug)]
pub(crate) enum CompletionAction {
    Complete,
    Redirect(Request),
}

/// Whether a complete response head is shown to the delegate right away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResponseDelivery {
    Notify,
    Withhold,
}

/// Scheme specific parts of the protocol.
pub(crate) trait ProtocolHandler: Send + Sync {
    fn can_handle(&self, url: &Url) -> bool;

    /// Builds the engine configuration of one attempt.
    fn configure(&self, request: &Request, session: &SessionConfig) -> crate::Result<TransferConfig>;

    fn append_header(
        &self,
        state: TransferState,
        data: &[u8],
        content_length: Option<u64>,
    ) -> Result<TransferState, ParseError>;

    fn on_header_complete(&self, _response: &Response) -> ResponseDelivery {
        ResponseDelivery::Notify
    }

    /// Body bytes of this response are kept back with the response head.
    fn withholds_body(&self, _response: &Response) -> bool {
        false
    }

    fn completion_action(&self, _request: &Request, _response: &Response) -> CompletionAction {
        CompletionAction::Complete
    }

    fn can_cache(&self, _request: &Request, _cached: &CachedResponse) -> bool {
        false
    }

    /// Decides whether a stored response may answer `request`, evicting it
    /// when it may not.
    fn can_respond_from_cache(
        &self,
        cache: &dyn UrlCache,
        request: &Request,
        _cached: &CachedResponse,
    ) -> bool {
        cache.remove_cached_response(request);
        false
    }
}

static REGISTRY: &[&dyn ProtocolHandler] = &[&HttpProtocol, &FtpProtocol];

/// Finds the handler for the scheme of `url`.
pub(crate) fn handler_for(url: &Url) -> Option<&'static dyn ProtocolHandler> {
    REGISTRY.iter().copied().find(|handler| handler.can_handle(url))
}

/// Where the body of a task ends up.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DrainKind {
    Memory,
    File(PathBuf),
    Ignore,
}

impl DrainKind {
    /// Opens a fresh drain; a download file is truncated for every attempt.
    fn open(&self) -> io::Result<DataDrain> {
        Ok(match self {
            DrainKind::Memory => DataDrain::Memory(BytesMut::new()),
            DrainKind::Ignore => DataDrain::Ignore,
            DrainKind::File(path) => DataDrain::File {
                path: path.clone(),
                file: std::fs::File::create(path)?,
            },
        })
    }
}

enum InternalState {
    Initial,
    FulfillingFromCache,
    /// Configured while the task was suspended; added on resume.
    TransferReady(TransferState),
    TransferInProgress(TransferState),
    TransferCompleted {
        response: Response,
        drain: DataDrain,
    },
    TransferFailed,
    WaitingForRedirectCompletionHandler {
        response: Response,
        drain: DataDrain,
    },
    TaskCompleted,
}

impl std::fmt::Debug for InternalState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.pad(match self {
            InternalState::Initial => "Initial",
            InternalState::FulfillingFromCache => "FulfillingFromCache",
            InternalState::TransferReady(_) => "TransferReady",
            InternalState::TransferInProgress(_) => "TransferInProgress",
            InternalState::TransferCompleted { .. } => "TransferCompleted",
            InternalState::TransferFailed => "TransferFailed",
            InternalState::WaitingForRedirectCompletionHandler { .. } => {
                "WaitingForRedirectCompletionHandler"
            }
            InternalState::TaskCompleted => "TaskCompleted",
        })
    }
}

#[derive(Default)]
struct AuthState {
    last: Option<(ProtectionSpace, Credential)>,
    failures: usize,
}

pub(crate) struct NativeProtocol {
    task: Task,
    session: Arc<SessionConfig>,
    handler: &'static dyn ProtocolHandler,
    easy: EasyHandle,
    state: InternalState,
    drain_kind: DrainKind,
    request: Request,
    redirects: Vec<Url>,
    last_redirect_body: Option<BytesMut>,
    cacheable: Option<BytesMut>,
    set_cookies: Vec<HeaderValue>,
    pending_error: Option<Error>,
    retry_send: bool,
    suspended: bool,
    auth: AuthState,
}

// ===== impl NativeProtocol =====

impl NativeProtocol {
    pub(crate) fn new(task: Task, handler: &'static dyn ProtocolHandler, id: HandleId) -> NativeProtocol {
        let session = task.session().clone();
        let drain_kind = task.drain_kind();
        let request = task.original_request().clone();
        NativeProtocol {
            task,
            session,
            handler,
            easy: EasyHandle::new(id),
            state: InternalState::Initial,
            drain_kind,
            request,
            redirects: Vec::new(),
            last_redirect_body: None,
            cacheable: None,
            set_cookies: Vec::new(),
            pending_error: None,
            retry_send: false,
            suspended: false,
            auth: AuthState::default(),
        }
    }

    #[inline]
    pub(crate) fn task(&self) -> &Task {
        &self.task
    }

    #[inline]
    pub(crate) fn id(&self) -> HandleId {
        self.easy.id()
    }

    #[inline]
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.easy.deadline()
    }

    pub(crate) fn is_timed_out(&self, now: Instant) -> bool {
        self.easy.is_timed_out(now)
    }

    pub(crate) fn is_finished(&self) -> bool {
        matches!(self.state, InternalState::TaskCompleted)
    }

    fn take_state(&mut self) -> InternalState {
        mem::replace(&mut self.state, InternalState::TransferFailed)
    }

    // ===== loading =====

    /// Answers from the cache when the request allows it, or starts the
    /// first attempt.
    pub(crate) fn start_loading(&mut self, multi: &mut MultiHandle) {
        assert!(
            matches!(self.state, InternalState::Initial),
            "task {} started twice",
            self.task.task_identifier()
        );
        let request = self.task.original_request().clone();
        match self.cached_response(&request) {
            Ok(Some(cached)) => self.fulfill_from_cache(cached, multi),
            Ok(None) => self.start_new_transfer(request, multi),
            Err(e) => self.fail(e, multi),
        }
    }

    fn cached_response(&self, request: &Request) -> crate::Result<Option<CachedResponse>> {
        let policy = request.cache_policy();
        let cached = match &self.session.cache {
            Some(cache) => match policy {
                CachePolicy::ReloadIgnoringLocalCacheData => None,
                CachePolicy::UseProtocolCachePolicy => cache.cached_response(request).filter(|cached| {
                    self.handler
                        .can_respond_from_cache(&**cache, request, cached)
                }),
                CachePolicy::ReturnCacheDataElseLoad | CachePolicy::ReturnCacheDataDontLoad => {
                    cache.cached_response(request)
                }
            },
            None => None,
        };

        if cached.is_none() && policy == CachePolicy::ReturnCacheDataDontLoad {
            return Err(Error::from_code(ErrorCode::ResourceUnavailable).with_url(request.url().clone()));
        }
        Ok(cached)
    }

    fn fulfill_from_cache(&mut self, cached: CachedResponse, multi: &mut MultiHandle) {
        log::debug!("answering {} from the cache", self.request.url());
        self.state = InternalState::FulfillingFromCache;

        let response = cached.response().clone();
        let data = cached.data().clone();
        if let Some(delegate) = self.task.delegate() {
            if delegate.did_receive_response(&self.task, &response) == ResponseDisposition::Cancel {
                return self.fail(Error::cancelled(), multi);
            }
        }
        self.task.set_response(response.clone());
        if !data.is_empty() {
            self.task.add_received(data.len() as u64);
            if let Some(delegate) = self.task.delegate() {
                delegate.did_receive_data(&self.task, data.clone());
            }
        }

        let drain = match self.drain_kind.open().and_then(|drain| drain.append(&data)) {
            Ok(drain) => drain,
            Err(e) => return self.fail(Error::body(e), multi),
        };
        self.complete_with(response, drain);
    }

    /// Configures the easy handle for `request` and adds it, unless the task
    /// is suspended.
    fn start_new_transfer(&mut self, request: Request, multi: &mut MultiHandle) {
        log::debug!("start transfer {} {}", request.method(), request.url());
        self.task.set_current_request(request.clone());
        self.request = request;
        self.last_redirect_body = None;
        self.cacheable = self.session.cache.as_ref().map(|_| BytesMut::new());
        self.set_cookies.clear();
        self.pending_error = None;
        self.retry_send = false;

        let config = match self.handler.configure(&self.request, &self.session) {
            Ok(config) => config,
            Err(e) => return self.fail(e, multi),
        };
        let source = match self.body_source() {
            Ok(source) => source,
            Err(e) => return self.fail(e, multi),
        };
        let drain = match self.drain_kind.open() {
            Ok(drain) => drain,
            Err(e) => return self.fail(Error::body(e), multi),
        };

        self.task.set_expected_to_send(match config.body_length {
            BodyLength::Length(len) => Some(len),
            BodyLength::NoBody => Some(0),
            BodyLength::Unknown => None,
        });
        let timeout = self
            .request
            .timeout()
            .copied()
            .unwrap_or(self.session.timeout);
        let url = config.url.clone();
        self.easy.configure(config, timeout);

        let state = TransferState::new(url, drain).with_body_source(source);
        if self.suspended {
            self.state = InternalState::TransferReady(state);
        } else {
            self.begin(state, multi);
        }
    }

    fn begin(&mut self, state: TransferState, multi: &mut MultiHandle) {
        self.state = InternalState::TransferInProgress(state);
        multi.add(&mut self.easy);
        self.easy.arm_timeout();
    }

    fn body_source(&self) -> crate::Result<Option<Box<dyn body::BodySource>>> {
        let Some(body) = self.request.body() else {
            return Ok(None);
        };
        match body.source() {
            Ok(Some(source)) => Ok(Some(source)),
            Ok(None) => match self.new_body_stream() {
                Some(stream) => Ok(Some(stream)),
                None => Err(Error::body(io::Error::new(
                    io::ErrorKind::Other,
                    "request body stream was already consumed",
                ))),
            },
            Err(e) => Err(Error::body(e)),
        }
    }

    fn new_body_stream(&self) -> Option<Box<dyn body::BodySource>> {
        let delegate = self.task.delegate()?;
        delegate
            .need_new_body_stream(&self.task)
            .map(body::stream_source)
    }

    // ===== engine callbacks =====

    pub(crate) fn did_receive_header(&mut self, data: &[u8], content_length: Option<u64>) -> Action {
        self.easy.arm_timeout();
        let state = match self.take_state() {
            InternalState::TransferInProgress(state) => state,
            other => panic!("header data received in state {other:?}"),
        };
        log::trace!(
            "{:?} header {:?}",
            self.easy.id(),
            String::from_utf8_lossy(data).trim_end()
        );
        if let Some(value) = set_cookie_value(data) {
            self.set_cookies.push(value);
        }

        let was_complete = state.is_header_complete();
        match self.handler.append_header(state, data, content_length) {
            Ok(state) => {
                let completed = !was_complete && state.is_header_complete();
                let response = state.response().cloned();
                self.state = InternalState::TransferInProgress(state);
                match response {
                    Some(response) if completed => self.header_completed(response, content_length),
                    _ => Action::Proceed,
                }
            }
            Err(e) => {
                log::debug!("bad response header from {}: {e}", self.request.url());
                self.pending_error = Some(Error::parse(e));
                Action::Abort
            }
        }
    }

    fn header_completed(&mut self, response: Response, content_length: Option<u64>) -> Action {
        let encoded = response
            .headers()
            .get(CONTENT_ENCODING)
            .map_or(false, |value| value.as_bytes() != b"identity");
        self.task.set_expected_to_receive(if encoded {
            None
        } else {
            content_length.filter(|&len| len > 0)
        });

        let cookies = mem::take(&mut self.set_cookies);
        if let Some(store) = &self.session.cookie_store {
            if !cookies.is_empty() {
                store.set_cookies(&mut cookies.iter(), response.url());
            }
        }

        if self.handler.on_header_complete(&response) == ResponseDelivery::Withhold {
            log::trace!("withholding {:?} response", response.status());
            return Action::Proceed;
        }
        self.task.set_response(response.clone());
        if let Some(delegate) = self.task.delegate() {
            if delegate.did_receive_response(&self.task, &response) == ResponseDisposition::Cancel {
                log::debug!("delegate cancelled {}", self.request.url());
                self.pending_error = Some(Error::cancelled());
                return Action::Abort;
            }
        }
        Action::Proceed
    }

    pub(crate) fn did_receive_body(&mut self, data: &[u8]) -> Action {
        self.easy.arm_timeout();
        let withheld = match &self.state {
            InternalState::TransferInProgress(state) => match state.response() {
                Some(response) => self.handler.withholds_body(response),
                None => {
                    log::debug!("body data before the response head from {}", self.request.url());
                    self.pending_error = Some(Error::parse(ParseError::CompleteHeader));
                    return Action::Abort;
                }
            },
            other => panic!("body data received in state {other:?}"),
        };
        log::trace!("{:?} body {} bytes", self.easy.id(), data.len());

        if withheld {
            self.last_redirect_body
                .get_or_insert_with(BytesMut::new)
                .extend_from_slice(data);
            return Action::Proceed;
        }

        self.task.add_received(data.len() as u64);
        if let Some(cacheable) = &mut self.cacheable {
            cacheable.extend_from_slice(data);
        }
        if let Some(delegate) = self.task.delegate() {
            delegate.did_receive_data(&self.task, Bytes::copy_from_slice(data));
        }

        let InternalState::TransferInProgress(state) = self.take_state() else {
            unreachable!("checked above");
        };
        match state.append_body_data(data) {
            Ok(state) => {
                self.state = InternalState::TransferInProgress(state);
                Action::Proceed
            }
            Err(e) => {
                log::debug!("writing body data failed: {e}");
                self.pending_error = Some(Error::body(e));
                Action::Abort
            }
        }
    }

    pub(crate) fn fill_write_buffer(&mut self, buf: &mut [u8]) -> FillResult {
        self.easy.arm_timeout();
        let source = match &mut self.state {
            InternalState::TransferInProgress(state) => state.body_source_mut(),
            other => panic!("outbound body requested in state {other:?}"),
        };
        let Some(source) = source else {
            return FillResult::Bytes(0);
        };

        match source.next_chunk(buf.len()) {
            body::Chunk::Data(data) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                let total = self.task.add_sent(len as u64);
                if let Some(delegate) = self.task.delegate() {
                    delegate.did_send_body_data(
                        &self.task,
                        len as u64,
                        total,
                        self.task.bytes_expected_to_send(),
                    );
                }
                FillResult::Bytes(len)
            }
            body::Chunk::Done => FillResult::Bytes(0),
            body::Chunk::RetryLater => {
                self.retry_send = true;
                self.easy.record_pause(PauseState {
                    send: true,
                    ..self.easy.pause()
                });
                FillResult::Pause
            }
            body::Chunk::Error(e) => {
                log::debug!("reading the request body failed: {e}");
                self.pending_error = Some(Error::body(e));
                FillResult::Abort
            }
        }
    }

    pub(crate) fn seek_input_stream(&mut self, offset: u64) -> SeekResult {
        let InternalState::TransferInProgress(state) = &mut self.state else {
            return SeekResult::Fail;
        };
        let Some(source) = state.body_source_mut() else {
            return if offset == 0 {
                SeekResult::Ok
            } else {
                SeekResult::CantSeek
            };
        };

        match source.seek(offset) {
            Ok(true) => SeekResult::Ok,
            Ok(false) if offset == 0 => {
                let Some(stream) = self.new_body_stream() else {
                    log::debug!("no new body stream to rewind {}", self.request.url());
                    return SeekResult::Fail;
                };
                if let InternalState::TransferInProgress(state) = self.take_state() {
                    self.state = InternalState::TransferInProgress(state.with_body_source(Some(stream)));
                }
                SeekResult::Ok
            }
            Ok(false) => SeekResult::CantSeek,
            Err(e) => {
                log::debug!("rewinding the request body failed: {e}");
                SeekResult::Fail
            }
        }
    }

    pub(crate) fn update_progress(&mut self, progress: Progress) {
        self.task.set_progress(progress);
    }

    /// Whether the last fill paused because the source asked to be retried.
    pub(crate) fn take_retry_later(&mut self) -> bool {
        mem::take(&mut self.retry_send)
    }

    // ===== completion =====

    pub(crate) fn transfer_completed(&mut self, result: crate::Result<()>, multi: &mut MultiHandle) {
        multi.remove(&mut self.easy);

        if let Err(error) = result {
            let error = self.pending_error.take().unwrap_or(error);
            self.state = InternalState::TransferFailed;
            return self.fail(error, multi);
        }

        let state = match self.take_state() {
            InternalState::TransferInProgress(state) => state,
            other => panic!("transfer completed in state {other:?}"),
        };
        let (response, drain) = state.into_parts();
        let Some(response) = response else {
            return self.fail(
                Error::request(ErrorCode::BadServerResponse, "transfer ended without a response"),
                multi,
            );
        };

        match self.handler.completion_action(&self.request, &response) {
            // a redirect status that can not be followed
            CompletionAction::Complete
                if self.handler.on_header_complete(&response) == ResponseDelivery::Withhold =>
            {
                self.deliver_withheld(response, drain, multi)
            }
            CompletionAction::Complete => {
                self.state = InternalState::TransferCompleted { response, drain };
                self.finish(multi);
            }
            CompletionAction::Redirect(request) => self.redirect_for(response, drain, request, multi),
        }
    }

    fn redirect_for(&mut self, response: Response, drain: DataDrain, request: Request, multi: &mut MultiHandle) {
        let status = response.status().unwrap_or(StatusCode::FOUND);
        self.redirects.push(self.request.url().clone());

        match self
            .session
            .redirect_policy
            .check(status, request.url(), &self.redirects)
        {
            ActionKind::Follow => {
                log::debug!("redirect {} -> {}", self.request.url(), request.url());
                match self.task.delegate().cloned() {
                    Some(delegate) => {
                        self.state = InternalState::WaitingForRedirectCompletionHandler {
                            response: response.clone(),
                            drain,
                        };
                        let decision = RedirectDecision::new(self.task.clone());
                        delegate.will_perform_redirection(&self.task, &response, request, decision);
                    }
                    None => self.start_new_transfer(request, multi),
                }
            }
            ActionKind::Stop => {
                log::debug!("not following redirect to {}", request.url());
                self.deliver_withheld(response, drain, multi);
            }
            ActionKind::Error(e) => {
                let url = request.url().clone();
                self.fail(Error::redirect(e, url), multi);
            }
        }
    }

    /// Called with the delegate's answer to `will_perform_redirection`.
    pub(crate) fn redirect_decided(&mut self, request: Option<Request>, multi: &mut MultiHandle) {
        let (response, drain) = match self.take_state() {
            InternalState::WaitingForRedirectCompletionHandler { response, drain } => (response, drain),
            other => {
                log::warn!(
                    "redirect decision for task {} in state {other:?}",
                    self.task.task_identifier()
                );
                self.state = other;
                return;
            }
        };
        match request {
            Some(request) => self.start_new_transfer(request, multi),
            None => self.deliver_withheld(response, drain, multi),
        }
    }

    /// Shows the delegate a redirect response that is not followed, together
    /// with its body.
    fn deliver_withheld(&mut self, response: Response, drain: DataDrain, multi: &mut MultiHandle) {
        self.task.set_response(response.clone());
        if let Some(delegate) = self.task.delegate() {
            if delegate.did_receive_response(&self.task, &response) == ResponseDisposition::Cancel {
                return self.fail(Error::cancelled(), multi);
            }
        }

        let mut drain = drain;
        if let Some(body) = self.last_redirect_body.take() {
            let body = body.freeze();
            self.task.add_received(body.len() as u64);
            if let Some(cacheable) = &mut self.cacheable {
                cacheable.extend_from_slice(&body);
            }
            if let Some(delegate) = self.task.delegate() {
                delegate.did_receive_data(&self.task, body.clone());
            }
            drain = match drain.append(&body) {
                Ok(drain) => drain,
                Err(e) => return self.fail(Error::body(e), multi),
            };
        }

        self.state = InternalState::TransferCompleted { response, drain };
        self.finish(multi);
    }

    fn finish(&mut self, multi: &mut MultiHandle) {
        let (response, drain) = match self.take_state() {
            InternalState::TransferCompleted { response, drain } => (response, drain),
            other => panic!("finishing a task in state {other:?}"),
        };

        let unauthorized = response.status() == Some(StatusCode::UNAUTHORIZED);
        let space = if unauthorized {
            ProtectionSpace::from_response(&response)
        } else {
            None
        };
        let (response, drain) = match space {
            Some(space) => match self.authenticate(space, response, drain, multi) {
                Some(unhandled) => unhandled,
                None => return,
            },
            None => (response, drain),
        };

        if !unauthorized {
            if let (Some(store), Some((space, credential))) =
                (&self.session.credential_store, self.auth.last.take())
            {
                store.set(credential, &space);
            }
        }

        if let (Some(cache), Some(data)) = (&self.session.cache, self.cacheable.take()) {
            let cached = CachedResponse::new(response.clone(), data.freeze());
            if self.handler.can_cache(&self.request, &cached) {
                let cached = match self.task.delegate() {
                    Some(delegate) => delegate.will_cache_response(&self.task, cached),
                    None => Some(cached),
                };
                if let Some(cached) = cached {
                    log::trace!("caching response for {}", self.request.url());
                    cache.store_cached_response(cached, &self.request);
                }
            }
        }

        self.complete_with(response, drain);
    }

    /// Answers a 401 challenge.
    ///
    /// Returns the response back when nothing could be retried and the task
    /// completes with it; `None` when a retry started or the task failed.
    fn authenticate(
        &mut self,
        space: ProtectionSpace,
        response: Response,
        drain: DataDrain,
        multi: &mut MultiHandle,
    ) -> Option<(Response, DataDrain)> {
        let stored = self
            .session
            .credential_store
            .as_deref()
            .and_then(|store| credential::lookup(store, &space));
        let last = self.auth.last.as_ref().map(|(_, credential)| credential);
        let repeated = stored.is_some() && stored.as_ref() == last;

        let challenge = AuthenticationChallenge {
            protection_space: space,
            proposed_credential: if repeated { None } else { stored },
            previous_failure_count: self.auth.failures,
            failure_response: response,
        };
        self.auth.failures += 1;

        let disposition = match self.task.delegate() {
            Some(delegate) => delegate.did_receive_challenge(&self.task, &challenge),
            None => ChallengeDisposition::PerformDefaultHandling,
        };
        let credential = match disposition {
            ChallengeDisposition::UseCredential(credential) => credential,
            ChallengeDisposition::PerformDefaultHandling => match challenge.proposed_credential {
                Some(credential) => credential,
                None if repeated => {
                    log::debug!("stored credential for {} was rejected", self.request.url());
                    self.fail(Error::auth_cancelled(), multi);
                    return None;
                }
                None => return Some((challenge.failure_response, drain)),
            },
            ChallengeDisposition::CancelAuthenticationChallenge
            | ChallengeDisposition::RejectProtectionSpace => {
                self.fail(Error::auth_cancelled(), multi);
                return None;
            }
        };

        let mut request = self.task.original_request().clone();
        request.headers_mut().insert(
            AUTHORIZATION,
            util::basic_auth(credential.user(), Some(credential.password())),
        );
        log::debug!("retrying {} as {:?}", request.url(), credential.user());
        self.auth.last = Some((challenge.protection_space, credential));
        self.redirects.clear();
        self.start_new_transfer(request, multi);
        None
    }

    fn complete_with(&mut self, response: Response, drain: DataDrain) {
        self.easy.disarm_timeout();
        self.task.set_response(response.clone());
        let path = drain.path().cloned();
        let body = drain.into_bytes().unwrap_or_default();
        if let (Some(delegate), Some(path)) = (self.task.delegate(), &path) {
            delegate.did_finish_downloading(&self.task, path);
        }
        log::debug!("completed {} with {:?}", self.request.url(), response.status());
        self.state = InternalState::TaskCompleted;
        self.task.complete(Ok(Completed::new(Some(response), body, path)));
    }

    fn fail(&mut self, error: Error, multi: &mut MultiHandle) {
        multi.remove(&mut self.easy);
        self.easy.disarm_timeout();
        let error = if error.url().is_none() {
            error.with_url(self.request.url().clone())
        } else {
            error
        };
        log::debug!("task {} failed: {error}", self.task.task_identifier());
        self.state = InternalState::TaskCompleted;
        self.task.complete(Err(error));
    }

    // ===== task control =====

    pub(crate) fn suspend(&mut self, multi: &mut MultiHandle) {
        if mem::replace(&mut self.suspended, true) {
            return;
        }
        if let InternalState::TransferInProgress(_) = self.state {
            self.easy.set_pause(
                PauseState {
                    send: true,
                    receive: true,
                },
                multi,
            );
            self.easy.disarm_timeout();
        }
    }

    pub(crate) fn resume(&mut self, multi: &mut MultiHandle) {
        if !mem::replace(&mut self.suspended, false) {
            return;
        }
        match self.take_state() {
            InternalState::TransferReady(state) => self.begin(state, multi),
            InternalState::TransferInProgress(state) => {
                self.state = InternalState::TransferInProgress(state);
                self.easy.set_pause(PauseState::default(), multi);
                self.easy.arm_timeout();
            }
            other => self.state = other,
        }
    }

    /// Sends again after a source asked to be retried later.
    pub(crate) fn unpause_send(&mut self, multi: &mut MultiHandle) {
        if self.suspended || !matches!(self.state, InternalState::TransferInProgress(_)) {
            return;
        }
        let pause = PauseState {
            send: false,
            ..self.easy.pause()
        };
        self.easy.set_pause(pause, multi);
    }

    /// Stops the task with `error`, whatever it is doing.
    pub(crate) fn stop_loading(&mut self, error: Error, multi: &mut MultiHandle) {
        if self.is_finished() {
            return;
        }
        log::debug!("stopping {}", self.request.url());
        self.fail(error, multi);
    }

    /// The idle timer expired.
    ///
    /// While the delegate still decides on a redirect, the task completes
    /// with the redirect response instead of failing.
    pub(crate) fn timed_out(&mut self, multi: &mut MultiHandle) {
        match self.take_state() {
            InternalState::WaitingForRedirectCompletionHandler { response, drain } => {
                log::debug!(
                    "timed out waiting for a redirect decision on {}",
                    self.request.url()
                );
                self.complete_with(response, drain);
            }
            other => {
                log::debug!("{} timed out in state {other:?}", self.request.url());
                self.fail(Error::timed_out(), multi);
            }
        }
    }
}

impl std::fmt::Debug for NativeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NativeProtocol")
            .field("task", &self.task.task_identifier())
            .field("easy", &self.easy)
            .field("state", &self.state)
            .field("url", self.request.url())
            .finish()
    }
}

/// The value of a raw `Set-Cookie` header line.
fn set_cookie_value(line: &[u8]) -> Option<HeaderValue> {
    let colon = line.iter().position(|&b| b == b':')?;
    let (name, value) = line.split_at(colon);
    if !name.eq_ignore_ascii_case(b"set-cookie") {
        return None;
    }
    let value = &value[1..];
    let start = value.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = value.iter().rposition(|b| !b.is_ascii_whitespace())?;
    HeaderValue::from_bytes(&value[start..=end]).ok()
}
