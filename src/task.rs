//! Tasks and their delegates.
//!
//! A [`Task`] is one logical request, including every redirect hop and
//! authentication retry. Tasks are created suspended by a [`Session`] and
//! run on the session's work queue once resumed. Progress is reported to an
//! optional [`TaskDelegate`]; the outcome can also be awaited with
//! [`Task::wait`].
//!
//! [`Session`]: crate::Session

use std::{
    fmt,
    io::Read,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::oneshot;

use crate::{
    cache::CachedResponse,
    credential::{AuthenticationChallenge, Credential},
    engine::{HandleId, Progress},
    error::{Error, ErrorCode},
    protocol::DrainKind,
    queue::Poster,
    request::Request,
    response::Response,
    session::SessionConfig,
    sync::Mutex,
};

/// The life cycle of a [`Task`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Transferring, or waiting for the delegate.
    Running,
    /// Created but not resumed, or suspended.
    Suspended,
    /// `cancel()` was called and the task has not completed yet.
    Canceling,
    /// Finished, successfully or not.
    Completed,
}

/// What a delegate wants done with a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// Continue loading.
    Allow,
    /// Cancel the task.
    Cancel,
}

/// How a delegate answers an authentication challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChallengeDisposition {
    /// Retry with this credential.
    UseCredential(Credential),
    /// Retry with the proposed credential, if there is one.
    PerformDefaultHandling,
    /// Cancel the task.
    CancelAuthenticationChallenge,
    /// Cancel the task; the protection space is not supported.
    RejectProtectionSpace,
}

/// Receives the events of a task, on the session's work queue thread.
///
/// Every method has a default; implement the ones of interest. Calls must
/// not block, as every task of the session waits for them.
#[allow(unused_variables)]
pub trait TaskDelegate: Send + Sync {
    /// A redirect is about to be followed.
    ///
    /// The default follows it. `decision` may be answered later and from any
    /// thread; dropping it declines the redirect.
    fn will_perform_redirection(
        &self,
        task: &Task,
        response: &Response,
        new_request: Request,
        decision: RedirectDecision,
    ) {
        decision.follow(new_request);
    }

    /// The final response head arrived.
    fn did_receive_response(&self, task: &Task, response: &Response) -> ResponseDisposition {
        ResponseDisposition::Allow
    }

    /// Body bytes arrived.
    fn did_receive_data(&self, task: &Task, data: Bytes) {}

    /// Body bytes were sent. `expected` is the total upload size, when known.
    fn did_send_body_data(&self, task: &Task, sent: u64, total: u64, expected: Option<u64>) {}

    /// The server asked for credentials.
    fn did_receive_challenge(
        &self,
        task: &Task,
        challenge: &AuthenticationChallenge,
    ) -> ChallengeDisposition {
        ChallengeDisposition::PerformDefaultHandling
    }

    /// A stream body must be sent again, for example after a redirect.
    fn need_new_body_stream(&self, task: &Task) -> Option<Box<dyn Read + Send>> {
        None
    }

    /// A response is about to be cached. Return `None` to skip caching it.
    fn will_cache_response(&self, task: &Task, response: CachedResponse) -> Option<CachedResponse> {
        Some(response)
    }

    /// A download task wrote its body to `location`.
    fn did_finish_downloading(&self, task: &Task, location: &Path) {}

    /// The task finished. Called exactly once.
    fn did_complete(&self, task: &Task, error: Option<&Error>) {}
}

/// The answer to [`TaskDelegate::will_perform_redirection`].
pub struct RedirectDecision {
    task: Option<Task>,
}

/// The outcome of a task.
#[derive(Clone, Debug)]
pub struct Completed {
    response: Option<Response>,
    body: Bytes,
    path: Option<PathBuf>,
}

/// One logical request.
///
/// Cloning a task yields another handle to the same task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

#[derive(Debug)]
pub(crate) enum TaskKind {
    Data,
    Download(PathBuf),
}

struct TaskInner {
    id: usize,
    kind: TaskKind,
    original_request: Request,
    delegate: Option<Arc<dyn TaskDelegate>>,
    session: Arc<SessionConfig>,
    poster: Poster,
    awaited: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    shared: Mutex<Shared>,
}

struct Shared {
    state: TaskState,
    suspend_count: usize,
    handle: Option<HandleId>,
    current_request: Request,
    response: Option<Response>,
    error: Option<ErrorCode>,
    expected_to_send: Option<u64>,
    expected_to_receive: Option<u64>,
    progress: Progress,
    waiter: Option<oneshot::Sender<crate::Result<Completed>>>,
    outcome: Option<crate::Result<Completed>>,
}

enum Wait {
    Done(crate::Result<Completed>),
    Pending(oneshot::Receiver<crate::Result<Completed>>),
}

// ===== impl Task =====

impl Task {
    pub(crate) fn new(
        id: usize,
        kind: TaskKind,
        request: Request,
        delegate: Option<Arc<dyn TaskDelegate>>,
        session: Arc<SessionConfig>,
        poster: Poster,
    ) -> Task {
        let shared = Shared {
            state: TaskState::Suspended,
            suspend_count: 1,
            handle: None,
            current_request: request.clone(),
            response: None,
            error: None,
            expected_to_send: None,
            expected_to_receive: None,
            progress: Progress::default(),
            waiter: None,
            outcome: None,
        };
        Task {
            inner: Arc::new(TaskInner {
                id,
                kind,
                original_request: request,
                delegate,
                session,
                poster,
                awaited: AtomicBool::new(false),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
                shared: Mutex::new(shared),
            }),
        }
    }

    /// Identifies the task within its session.
    #[inline]
    pub fn task_identifier(&self) -> usize {
        self.inner.id
    }

    /// Get the current state.
    pub fn state(&self) -> TaskState {
        self.inner.shared.lock().state
    }

    /// The request the task was created with.
    #[inline]
    pub fn original_request(&self) -> &Request {
        &self.inner.original_request
    }

    /// The request of the current, or last, attempt.
    pub fn current_request(&self) -> Request {
        self.inner.shared.lock().current_request.clone()
    }

    /// The last response shown to the delegate, if any.
    pub fn response(&self) -> Option<Response> {
        self.inner.shared.lock().response.clone()
    }

    /// Why the task failed, once it did.
    pub fn error(&self) -> Option<ErrorCode> {
        self.inner.shared.lock().error
    }

    /// Body bytes sent so far.
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }

    /// Body bytes the current attempt will send, when known.
    pub fn bytes_expected_to_send(&self) -> Option<u64> {
        self.inner.shared.lock().expected_to_send
    }

    /// Body bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Relaxed)
    }

    /// Body bytes announced by the server, when known and not encoded.
    pub fn bytes_expected_to_receive(&self) -> Option<u64> {
        self.inner.shared.lock().expected_to_receive
    }

    /// The last progress report of the engine.
    pub fn progress(&self) -> Progress {
        self.inner.shared.lock().progress
    }

    /// Starts the task, or undoes one `suspend()`.
    pub fn resume(&self) {
        {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                TaskState::Completed | TaskState::Canceling => return,
                TaskState::Running | TaskState::Suspended => {}
            }
            shared.suspend_count = shared.suspend_count.saturating_sub(1);
            if shared.suspend_count > 0 || shared.state == TaskState::Running {
                return;
            }
            shared.state = TaskState::Running;
        }
        log::trace!("resuming task {}", self.inner.id);
        let task = self.clone();
        if !self.inner.poster.post(move |queue| queue.resume_task(&task)) {
            self.complete(Err(Error::cancelled()));
        }
    }

    /// Pauses the task. Calls nest; each needs its own `resume()`.
    pub fn suspend(&self) {
        {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                TaskState::Completed | TaskState::Canceling => return,
                TaskState::Running | TaskState::Suspended => {}
            }
            shared.suspend_count += 1;
            if shared.state != TaskState::Running {
                return;
            }
            shared.state = TaskState::Suspended;
        }
        log::trace!("suspending task {}", self.inner.id);
        let task = self.clone();
        self.inner.poster.post(move |queue| queue.suspend_task(&task));
    }

    /// Cancels the task; it completes with [`ErrorCode::Cancelled`].
    pub fn cancel(&self) {
        {
            let mut shared = self.inner.shared.lock();
            match shared.state {
                TaskState::Completed | TaskState::Canceling => return,
                TaskState::Running | TaskState::Suspended => {}
            }
            shared.state = TaskState::Canceling;
            shared.error = Some(ErrorCode::Cancelled);
        }
        log::debug!("cancelling task {}", self.inner.id);
        let task = self.clone();
        if !self.inner.poster.post(move |queue| queue.cancel_task(&task)) {
            self.complete(Err(Error::cancelled()));
        }
    }

    /// Waits for the task to finish and returns its outcome.
    ///
    /// This does not resume the task. Only the most recent caller receives
    /// the outcome.
    pub async fn wait(&self) -> crate::Result<Completed> {
        self.inner.awaited.store(true, Ordering::Relaxed);
        let rx = match self.register_waiter() {
            Wait::Done(result) => return result,
            Wait::Pending(rx) => rx,
        };
        rx.await.unwrap_or_else(|_| Err(Error::cancelled()))
    }

    fn register_waiter(&self) -> Wait {
        let mut shared = self.inner.shared.lock();
        if let Some(result) = shared.outcome.take() {
            return Wait::Done(result);
        }
        if shared.state == TaskState::Completed {
            return Wait::Done(Err(Error::from_code(
                shared.error.unwrap_or(ErrorCode::Unknown),
            )));
        }
        let (tx, rx) = oneshot::channel();
        shared.waiter = Some(tx);
        Wait::Pending(rx)
    }

    // ===== crate internal =====

    pub(crate) fn mark_awaited(&self) {
        self.inner.awaited.store(true, Ordering::Relaxed);
    }

    pub(crate) fn delegate(&self) -> Option<&Arc<dyn TaskDelegate>> {
        self.inner.delegate.as_ref()
    }

    pub(crate) fn session(&self) -> &Arc<SessionConfig> {
        &self.inner.session
    }

    /// Memory for awaited tasks and tasks nobody listens to, the download
    /// file for download tasks, nothing when a delegate takes the data.
    pub(crate) fn drain_kind(&self) -> DrainKind {
        match &self.inner.kind {
            TaskKind::Download(path) => DrainKind::File(path.clone()),
            TaskKind::Data if self.inner.awaited.load(Ordering::Relaxed) => DrainKind::Memory,
            TaskKind::Data if self.inner.delegate.is_some() => DrainKind::Ignore,
            TaskKind::Data => DrainKind::Memory,
        }
    }

    pub(crate) fn handle(&self) -> Option<HandleId> {
        self.inner.shared.lock().handle
    }

    pub(crate) fn set_handle(&self, handle: Option<HandleId>) {
        self.inner.shared.lock().handle = handle;
    }

    pub(crate) fn set_current_request(&self, request: Request) {
        self.inner.shared.lock().current_request = request;
    }

    pub(crate) fn set_response(&self, response: Response) {
        self.inner.shared.lock().response = Some(response);
    }

    pub(crate) fn set_expected_to_send(&self, len: Option<u64>) {
        self.inner.shared.lock().expected_to_send = len;
    }

    pub(crate) fn set_expected_to_receive(&self, len: Option<u64>) {
        self.inner.shared.lock().expected_to_receive = len;
    }

    /// Adds to the sent counter and returns the new total.
    pub(crate) fn add_sent(&self, len: u64) -> u64 {
        self.inner.bytes_sent.fetch_add(len, Ordering::Relaxed) + len
    }

    /// Adds to the received counter and returns the new total.
    pub(crate) fn add_received(&self, len: u64) -> u64 {
        self.inner.bytes_received.fetch_add(len, Ordering::Relaxed) + len
    }

    pub(crate) fn set_progress(&self, progress: Progress) {
        self.inner.shared.lock().progress = progress;
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// Finishes the task. Only the first call has an effect.
    pub(crate) fn complete(&self, result: crate::Result<Completed>) {
        let waiter = {
            let mut shared = self.inner.shared.lock();
            if shared.state == TaskState::Completed {
                return;
            }
            shared.state = TaskState::Completed;
            shared.handle = None;
            if let Err(e) = &result {
                shared.error = Some(e.code());
            }
            shared.waiter.take()
        };

        if let Some(delegate) = &self.inner.delegate {
            delegate.did_complete(self, result.as_ref().err());
        }
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => self.inner.shared.lock().outcome = Some(result),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("state", &shared.state)
            .field("url", shared.current_request.url())
            .finish()
    }
}

// ===== impl RedirectDecision =====

impl RedirectDecision {
    pub(crate) fn new(task: Task) -> RedirectDecision {
        RedirectDecision { task: Some(task) }
    }

    /// Follow the redirect with `request`, which may differ from the
    /// proposed one.
    pub fn follow(mut self, request: Request) {
        self.send(Some(request));
    }

    /// Do not follow; the task completes with the redirect response.
    pub fn decline(mut self) {
        self.send(None);
    }

    fn send(&mut self, request: Option<Request>) {
        let Some(task) = self.task.take() else {
            return;
        };
        let poster = task.inner.poster.clone();
        poster.post(move |queue| queue.redirect_decided(&task, request));
    }
}

impl Drop for RedirectDecision {
    fn drop(&mut self) {
        self.send(None);
    }
}

impl fmt::Debug for RedirectDecision {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RedirectDecision")
            .field("task", &self.task.as_ref().map(Task::task_identifier))
            .finish()
    }
}

// ===== impl Completed =====

impl Completed {
    pub(crate) fn new(response: Option<Response>, body: Bytes, path: Option<PathBuf>) -> Completed {
        Completed { response, body, path }
    }

    /// The final response.
    #[inline]
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// The status of the final response; `None` for FTP.
    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().and_then(Response::status)
    }

    /// The body, when it was collected in memory.
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consumes the outcome, returning the body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// The body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Where a download task wrote the body.
    pub fn location(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
