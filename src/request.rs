use std::{convert::TryFrom, fmt, time::Duration};

use http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderMap, HeaderName, HeaderValue, Method,
};
use url::Url;

use crate::{body::Body, cache::CachePolicy, session::Session, task::Completed, Error, ErrorCode};

/// A request which can be executed with `Session::execute()` or turned into
/// a task with `Session::data_task()`.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Body>,
    timeout: Option<Duration>,
    cache_policy: CachePolicy,
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Session` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    session: Session,
    request: crate::Result<Request>,
}

// ===== impl Request =====

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            cache_policy: CachePolicy::default(),
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    #[inline]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Body> {
        &mut self.body
    }

    /// Get the idle timeout override.
    #[inline]
    pub fn timeout(&self) -> Option<&Duration> {
        self.timeout.as_ref()
    }

    /// Get a mutable reference to the idle timeout override.
    #[inline]
    pub fn timeout_mut(&mut self) -> &mut Option<Duration> {
        &mut self.timeout
    }

    /// Get the cache policy.
    #[inline]
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Get a mutable reference to the cache policy.
    #[inline]
    pub fn cache_policy_mut(&mut self) -> &mut CachePolicy {
        &mut self.cache_policy
    }
}

// ===== impl RequestBuilder =====

impl RequestBuilder {
    pub(crate) fn new(session: Session, request: crate::Result<Request>) -> RequestBuilder {
        let mut builder = RequestBuilder { session, request };

        let auth = builder
            .request
            .as_mut()
            .ok()
            .filter(|req| matches!(req.url.scheme(), "http" | "https"))
            .and_then(|req| extract_authority(&mut req.url));

        if let Some((username, password)) = auth {
            builder.basic_auth(username, password)
        } else {
            builder
        }
    }

    /// Assemble a builder starting from an existing `Session` and a `Request`.
    pub fn from_parts(session: Session, request: Request) -> RequestBuilder {
        RequestBuilder {
            session,
            request: Ok(request),
        }
    }

    /// Add a `Header` to this Request.
    pub fn header<K, V>(self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.header_operation(key, value, false, false)
    }

    /// Add a `Header` to this Request, replacing any value it already had.
    pub fn header_exact<K, V>(self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.header_operation(key, value, false, true)
    }

    fn header_operation<K, V>(
        mut self,
        key: K,
        value: V,
        sensitive: bool,
        overwrite: bool,
    ) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(mut value) => {
                        // We want to potentially make an unsensitive header
                        // to be sensitive, not the reverse. So, don't turn off
                        // a previously sensitive header.
                        if sensitive {
                            value.set_sensitive(true);
                        }

                        if overwrite {
                            req.headers_mut().insert(key, value);
                        } else {
                            req.headers_mut().append(key, value);
                        }
                    }
                    Err(e) => error = Some(Error::builder(ErrorCode::Unknown, e.into())),
                },
                Err(e) => error = Some(Error::builder(ErrorCode::Unknown, e.into())),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of Headers to the existing ones on this Request.
    ///
    /// The headers will be merged in to any already set.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            crate::util::replace_headers(req.headers_mut(), headers);
        }
        self
    }

    /// Enable HTTP basic authentication.
    ///
    /// ```rust
    /// # use rquest_transfer::Error;
    /// # async fn run() -> Result<(), Error> {
    /// let session = rquest_transfer::Session::new();
    /// let resp = session
    ///     .delete("http://httpbin.org/delete")
    ///     .basic_auth("admin", Some("good password"))
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn basic_auth<U, P>(self, username: U, password: Option<P>) -> RequestBuilder
    where
        U: fmt::Display,
        P: fmt::Display,
    {
        let header_value = crate::util::basic_auth(username, password);
        self.header_operation(AUTHORIZATION, header_value, true, true)
    }

    /// Enable HTTP bearer authentication.
    pub fn bearer_auth<T>(self, token: T) -> RequestBuilder
    where
        T: fmt::Display,
    {
        let header_value = format!("Bearer {token}");
        self.header_operation(AUTHORIZATION, header_value, true, true)
    }

    /// Set the request body.
    pub fn body<T: Into<Body>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Send a form body, setting the `Content-Type` to
    /// `application/x-www-form-urlencoded`.
    pub fn form<K, V, I>(mut self, pairs: I) -> RequestBuilder
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        if let Ok(ref mut req) = self.request {
            let body = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish();
            req.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Modify the query string of the URL.
    ///
    /// Pairs are appended, percent-encoded, to any existing query.
    pub fn query<K, V, I>(mut self, pairs: I) -> RequestBuilder
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        if let Ok(ref mut req) = self.request {
            req.url_mut().query_pairs_mut().extend_pairs(pairs);
            if let Some("") = req.url().query() {
                req.url_mut().set_query(None);
            }
        }
        self
    }

    /// Overrides the session's idle timeout for this request.
    ///
    /// The clock restarts whenever the transfer makes progress, so this bounds
    /// a stall, not the whole transfer.
    pub fn timeout(mut self, timeout: Duration) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.timeout_mut() = Some(timeout);
        }
        self
    }

    /// Sets how the session's URL cache is consulted for this request.
    pub fn cache_policy(mut self, policy: CachePolicy) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.cache_policy_mut() = policy;
        }
        self
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Session::execute()`.
    pub fn build(self) -> crate::Result<Request> {
        self.request
    }

    /// Build a `Request`, returning the embedded `Session` alongside it.
    pub fn build_split(self) -> (Session, crate::Result<Request>) {
        (self.session, self.request)
    }

    /// Constructs the Request and runs it as a task to completion.
    ///
    /// # Errors
    ///
    /// This method fails if the transfer failed, the redirect limit was
    /// exhausted or the task was cancelled.
    pub async fn send(self) -> crate::Result<Completed> {
        let request = self.request?;
        self.session.execute(request).await
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => builder
                .field("method", req.method())
                .field("url", &req.url().as_str())
                .field("headers", req.headers())
                .finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}

/// Check the request URL for a "username:password" type authority, and if
/// found, remove it from the URL and return it.
fn extract_authority(url: &mut Url) -> Option<(String, Option<String>)> {
    use percent_encoding::percent_decode;

    if url.has_authority() {
        let username: String = percent_decode(url.username().as_bytes())
            .decode_utf8()
            .ok()?
            .into();
        let password = url.password().and_then(|pass| {
            percent_decode(pass.as_bytes())
                .decode_utf8()
                .ok()
                .map(String::from)
        });
        if !username.is_empty() || password.is_some() {
            url.set_username("")
                .expect("has_authority means set_username shouldn't fail");
            url.set_password(None)
                .expect("has_authority means set_password shouldn't fail");
            return Some((username, password));
        }
    }

    None
}
