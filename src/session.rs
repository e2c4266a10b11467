use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use http::{header::HeaderValue, HeaderMap, Method};

#[cfg(feature = "cookies")]
use crate::cookie;
use crate::{
    cache::UrlCache,
    cookie::CookieStore,
    credential::CredentialStore,
    engine::{Engine, MioEngine},
    error::{Error, ErrorCode},
    into_url::IntoUrl,
    queue::{self, Poster},
    redirect,
    request::{Request, RequestBuilder},
    sync::Mutex,
    task::{Completed, Task, TaskDelegate, TaskKind},
};

/// A group of tasks sharing one configuration and one work queue.
///
/// The `Session` has a work queue thread internally, so it is advised that
/// you create one and **reuse** it. You do **not** have to wrap the
/// `Session` in an [`Rc`] or [`Arc`] to **reuse** it, because it already
/// uses an [`Arc`] internally.
///
/// [`Rc`]: std::rc::Rc
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionRef>,
}

/// A `SessionBuilder` can be used to create a `Session` with custom
/// configuration.
#[must_use]
pub struct SessionBuilder {
    config: Config,
}

type EngineFactory = Box<dyn FnOnce() -> Box<dyn Engine> + Send>;

struct Config {
    error: Option<Error>,
    timeout: Duration,
    headers: HeaderMap,
    user_agent: Option<HeaderValue>,
    accept_language: Option<HeaderValue>,
    decompress: bool,
    redirect_policy: redirect::Policy,
    cookie_store: Option<Arc<dyn CookieStore>>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    cache: Option<Arc<dyn UrlCache>>,
    delegate: Option<Arc<dyn TaskDelegate>>,
    engine: Option<EngineFactory>,
}

/// What every attempt of a session's tasks is configured from.
pub(crate) struct SessionConfig {
    pub(crate) timeout: Duration,
    pub(crate) headers: HeaderMap,
    pub(crate) user_agent: Option<HeaderValue>,
    pub(crate) accept_language: Option<HeaderValue>,
    pub(crate) decompress: bool,
    pub(crate) redirect_policy: redirect::Policy,
    pub(crate) cookie_store: Option<Arc<dyn CookieStore>>,
    pub(crate) credential_store: Option<Arc<dyn CredentialStore>>,
    pub(crate) cache: Option<Arc<dyn UrlCache>>,
}

struct SessionRef {
    config: Arc<SessionConfig>,
    delegate: Option<Arc<dyn TaskDelegate>>,
    poster: Poster,
    next_task_id: AtomicUsize,
    tasks: Mutex<Vec<Task>>,
    invalidated: AtomicBool,
}

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

// ===== impl SessionBuilder =====

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBuilder {
    /// Constructs a new `SessionBuilder`.
    ///
    /// This is the same as `Session::builder()`.
    pub fn new() -> SessionBuilder {
        SessionBuilder {
            config: Config {
                error: None,
                timeout: Duration::from_secs(60),
                headers: HeaderMap::new(),
                user_agent: Some(HeaderValue::from_static(DEFAULT_USER_AGENT)),
                accept_language: None,
                decompress: true,
                redirect_policy: redirect::Policy::default(),
                cookie_store: None,
                credential_store: None,
                cache: None,
                delegate: None,
                engine: None,
            },
        }
    }

    /// Returns a `Session` that uses this `SessionBuilder` configuration.
    ///
    /// # Errors
    ///
    /// This method fails if a configuration value was invalid or the work
    /// queue could not be started.
    pub fn build(self) -> crate::Result<Session> {
        let config = self.config;
        if let Some(err) = config.error {
            return Err(err);
        }

        let engine: Box<dyn Engine> = match config.engine {
            Some(factory) => factory(),
            None => Box::new(MioEngine::new()),
        };
        let poster = queue::spawn(engine).map_err(|e| Error::builder(ErrorCode::Unknown, e))?;
        log::debug!("session started");

        Ok(Session {
            inner: Arc::new(SessionRef {
                config: Arc::new(SessionConfig {
                    timeout: config.timeout,
                    headers: config.headers,
                    user_agent: config.user_agent,
                    accept_language: config.accept_language,
                    decompress: config.decompress,
                    redirect_policy: config.redirect_policy,
                    cookie_store: config.cookie_store,
                    credential_store: config.credential_store,
                    cache: config.cache,
                }),
                delegate: config.delegate,
                poster,
                next_task_id: AtomicUsize::new(1),
                tasks: Mutex::new(Vec::new()),
                invalidated: AtomicBool::new(false),
            }),
        })
    }

    /// Sets the idle timeout of every request.
    ///
    /// The timer restarts whenever data moves. Default is 60 seconds; a
    /// request's own timeout takes precedence.
    pub fn timeout(mut self, timeout: Duration) -> SessionBuilder {
        self.config.timeout = timeout;
        self
    }

    /// Sets headers added to every request.
    ///
    /// A header set on the request replaces the one of the same name here.
    pub fn default_headers(mut self, headers: HeaderMap) -> SessionBuilder {
        self.config.headers = headers;
        self
    }

    /// Sets the `User-Agent` header sent when a request has none.
    pub fn user_agent<V>(mut self, value: V) -> SessionBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => self.config.user_agent = Some(value),
            Err(e) => {
                let e: http::Error = e.into();
                self.config.error = Some(Error::builder(ErrorCode::Unknown, e));
            }
        }
        self
    }

    /// Sets the `Accept-Language` header sent when a request has none.
    pub fn accept_language<V>(mut self, value: V) -> SessionBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => self.config.accept_language = Some(value),
            Err(e) => {
                let e: http::Error = e.into();
                self.config.error = Some(Error::builder(ErrorCode::Unknown, e));
            }
        }
        self
    }

    /// Enable or disable advertising and decoding `gzip` and `deflate`
    /// content encodings.
    ///
    /// Default is `true`. Encodings are only decoded when the matching
    /// feature is enabled.
    pub fn automatic_decompression(mut self, enable: bool) -> SessionBuilder {
        self.config.decompress = enable;
        self
    }

    /// Set a `redirect::Policy` for this session.
    ///
    /// Default will follow redirects up to a maximum of 20.
    pub fn redirect(mut self, policy: redirect::Policy) -> SessionBuilder {
        self.config.redirect_policy = policy;
        self
    }

    /// Follow at most `max` redirects per task.
    pub fn max_redirects(self, max: usize) -> SessionBuilder {
        self.redirect(redirect::Policy::limited(max))
    }

    /// Enable a persistent cookie store for the session.
    ///
    /// Cookies received in responses will be preserved and included in
    /// additional requests.
    ///
    /// By default, no cookie store is used.
    #[cfg(feature = "cookies")]
    #[cfg_attr(docsrs, doc(cfg(feature = "cookies")))]
    pub fn cookie_store(mut self, enable: bool) -> SessionBuilder {
        if enable {
            self.cookie_provider(Arc::new(cookie::Jar::default()))
        } else {
            self.config.cookie_store = None;
            self
        }
    }

    /// Set the persistent cookie store for the session.
    ///
    /// Cookies received in responses will be passed to this store, and
    /// additional requests will query this store for cookies.
    pub fn cookie_provider<C: CookieStore + 'static>(mut self, cookie_store: Arc<C>) -> SessionBuilder {
        self.config.cookie_store = Some(cookie_store as _);
        self
    }

    /// Set the store answering authentication challenges.
    pub fn credential_store<S: CredentialStore + 'static>(mut self, store: Arc<S>) -> SessionBuilder {
        self.config.credential_store = Some(store as _);
        self
    }

    /// Set the cache responses are stored in and answered from.
    pub fn cache<C: UrlCache + 'static>(mut self, cache: Arc<C>) -> SessionBuilder {
        self.config.cache = Some(cache as _);
        self
    }

    /// Set the delegate of tasks created without one.
    pub fn delegate<D: TaskDelegate + 'static>(mut self, delegate: Arc<D>) -> SessionBuilder {
        self.config.delegate = Some(delegate as _);
        self
    }

    /// Replace the built-in engine.
    ///
    /// `factory` runs once, when the session is built.
    pub fn engine<F, E>(mut self, factory: F) -> SessionBuilder
    where
        F: FnOnce() -> E + Send + 'static,
        E: Engine + 'static,
    {
        self.config.engine = Some(Box::new(move || Box::new(factory()) as Box<dyn Engine>));
        self
    }
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("timeout", &self.config.timeout)
            .field("headers", &self.config.headers)
            .field("redirect_policy", &self.config.redirect_policy)
            .field("cookie_store", &self.config.cookie_store.is_some())
            .field("credential_store", &self.config.credential_store.is_some())
            .field("cache", &self.config.cache.is_some())
            .finish()
    }
}

// ===== impl Session =====

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Constructs a new `Session`.
    ///
    /// # Panics
    ///
    /// This method panics if the work queue can not be started.
    ///
    /// Use `Session::builder()` if you wish to handle the failure as an
    /// `Error` instead of panicking.
    pub fn new() -> Session {
        SessionBuilder::new().build().expect("Session::new()")
    }

    /// Creates a `SessionBuilder` to configure a `Session`.
    ///
    /// This is the same as `SessionBuilder::new()`.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a `Request` with the `Method` and `Url`.
    ///
    /// Returns a `RequestBuilder`, which will allow setting headers and
    /// the request body before sending.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let req = url.into_url().map(move |url| Request::new(method, url));
        RequestBuilder::new(self.clone(), req)
    }

    /// Creates a suspended task collecting the body in memory, unless the
    /// session delegate takes it.
    pub fn data_task(&self, request: Request) -> Task {
        self.make_task(TaskKind::Data, request, self.inner.delegate.clone())
    }

    /// Like [`data_task`](Session::data_task), reporting to `delegate`.
    pub fn data_task_with_delegate(&self, request: Request, delegate: Arc<dyn TaskDelegate>) -> Task {
        self.make_task(TaskKind::Data, request, Some(delegate))
    }

    /// Creates a suspended task writing the body to `path`.
    pub fn download_task(&self, request: Request, path: impl Into<PathBuf>) -> Task {
        self.make_task(
            TaskKind::Download(path.into()),
            request,
            self.inner.delegate.clone(),
        )
    }

    /// Like [`download_task`](Session::download_task), reporting to
    /// `delegate`.
    pub fn download_task_with_delegate(
        &self,
        request: Request,
        path: impl Into<PathBuf>,
        delegate: Arc<dyn TaskDelegate>,
    ) -> Task {
        self.make_task(TaskKind::Download(path.into()), request, Some(delegate))
    }

    /// Runs `request` as a data task and waits for its outcome.
    ///
    /// # Errors
    ///
    /// This method fails if the transfer failed, the redirect limit was
    /// exhausted or the task was cancelled.
    pub async fn execute(&self, request: Request) -> crate::Result<Completed> {
        let task = self.data_task(request);
        task.mark_awaited();
        task.resume();
        task.wait().await
    }

    /// Cancels every task and stops the work queue once they completed.
    ///
    /// Tasks created afterwards complete with [`ErrorCode::Cancelled`].
    pub fn invalidate_and_cancel(&self) {
        self.inner.invalidated.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.cancel();
        }
        self.inner.poster.post(|queue| queue.shutdown());
    }

    /// Lets running tasks finish, then stops the work queue.
    ///
    /// Tasks created afterwards complete with [`ErrorCode::Cancelled`].
    pub fn finish_tasks_and_invalidate(&self) {
        self.inner.invalidated.store(true, Ordering::SeqCst);
        self.inner.poster.post(|queue| queue.shutdown());
    }

    fn make_task(&self, kind: TaskKind, request: Request, delegate: Option<Arc<dyn TaskDelegate>>) -> Task {
        let id = self.inner.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(
            id,
            kind,
            request,
            delegate,
            self.inner.config.clone(),
            self.inner.poster.clone(),
        );

        if self.inner.invalidated.load(Ordering::SeqCst) {
            log::debug!("task {id} created on an invalidated session");
            task.complete(Err(Error::cancelled()));
            return task;
        }

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_completed());
        tasks.push(task.clone());
        task
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("timeout", &self.inner.config.timeout)
            .field("redirect_policy", &self.inner.config.redirect_policy)
            .field("invalidated", &self.inner.invalidated.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.poster.post(|queue| queue.shutdown());
    }
}

// ===== impl SessionConfig =====

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_secs(60),
            headers: HeaderMap::new(),
            user_agent: Some(HeaderValue::from_static(DEFAULT_USER_AGENT)),
            accept_language: None,
            decompress: true,
            redirect_policy: redirect::Policy::default(),
            cookie_store: None,
            credential_store: None,
            cache: None,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("timeout", &self.timeout)
            .field("headers", &self.headers)
            .field("decompress", &self.decompress)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_user_agent_fails_build() {
        let err = Session::builder()
            .user_agent("bad\nagent")
            .build()
            .unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn tasks_start_suspended_with_increasing_ids() {
        let session = Session::new();
        let request = session.get("http://127.0.0.1:1/").build().unwrap();
        let first = session.data_task(request.clone());
        let second = session.data_task(request);
        assert!(second.task_identifier() > first.task_identifier());
        assert_eq!(first.state(), crate::task::TaskState::Suspended);
        assert!(first.response().is_none());
    }

    #[test]
    fn invalidated_sessions_refuse_new_tasks() {
        let session = Session::new();
        session.finish_tasks_and_invalidate();
        let request = session.get("http://127.0.0.1:1/").build().unwrap();
        let task = session.data_task(request);
        assert_eq!(task.state(), crate::task::TaskState::Completed);
        assert_eq!(task.error(), Some(ErrorCode::Cancelled));
    }
}
