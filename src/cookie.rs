//! HTTP Cookies

use http::{
    header::{COOKIE, SET_COOKIE},
    HeaderMap, HeaderValue,
};
use url::Url;

#[cfg(feature = "cookies")]
pub use self::jar::{Cookie, CookieBuilder, Jar};
#[cfg(feature = "cookies")]
pub(crate) use self::jar::extract_response_cookies;

/// Actions for a persistent cookie store providing session support.
///
/// The session stores the `Set-Cookie` fields of every response head it
/// parses, and asks for the cookies of a URL before each attempt.
pub trait CookieStore: Send + Sync {
    /// Store a set of Set-Cookie header values received from `url`
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url);

    /// Get any Cookie values in the store for `url`
    fn cookies(&self, url: &Url) -> Option<Vec<HeaderValue>>;
}

/// Hands the `Set-Cookie` fields of a response head to `store`.
pub(crate) fn store_response_cookies(store: &dyn CookieStore, headers: &HeaderMap, url: &Url) {
    let mut cookies = headers.get_all(SET_COOKIE).iter().peekable();
    if cookies.peek().is_some() {
        store.set_cookies(&mut cookies, url);
    }
}

/// Adds a `Cookie` field for `url`, unless the request already carries one.
pub(crate) fn add_cookie_header(store: &dyn CookieStore, url: &Url, headers: &mut HeaderMap) {
    if headers.contains_key(COOKIE) {
        return;
    }
    let Some(cookies) = store.cookies(url) else {
        return;
    };
    let joined = cookies
        .iter()
        .map(|v| v.as_bytes())
        .collect::<Vec<_>>()
        .join(&b"; "[..]);
    match HeaderValue::from_bytes(&joined) {
        Ok(value) => {
            headers.insert(COOKIE, value);
        }
        Err(e) => log::warn!("dropping unrepresentable Cookie header: {e}"),
    }
}

#[cfg(feature = "cookies")]
mod jar {
    use std::{borrow::Cow, fmt, time::SystemTime};

    use bytes::BufMut;
    use http::{header::SET_COOKIE, HeaderMap, HeaderValue};
    use url::Url;

    use super::CookieStore;
    use crate::sync::RwLock;

    /// A single HTTP cookie.
    #[derive(Debug, Clone)]
    pub struct Cookie<'a>(cookie_crate::Cookie<'a>);

    /// A builder for a `Cookie`.
    #[derive(Debug, Clone)]
    pub struct CookieBuilder<'a>(cookie_crate::CookieBuilder<'a>);

    /// The default `CookieStore` implementation.
    ///
    /// This is the implementation used when calling `cookie_store(true)` on a
    /// `SessionBuilder`. Create one directly to fill it with cookies before
    /// the session starts, then hand it over with `cookie_provider`.
    #[derive(Debug)]
    pub struct Jar(RwLock<cookie_store::CookieStore>);

    // ===== impl Cookie =====

    impl<'a> Cookie<'a> {
        fn parse(value: &'a HeaderValue) -> Result<Cookie<'a>, CookieParseError> {
            std::str::from_utf8(value.as_bytes())
                .map_err(cookie_crate::ParseError::from)
                .and_then(cookie_crate::Cookie::parse)
                .map_err(CookieParseError)
                .map(Cookie)
        }

        /// Creates a new `CookieBuilder` instance from the given name and value.
        #[inline]
        pub fn builder<N, V>(name: N, value: V) -> CookieBuilder<'a>
        where
            N: Into<Cow<'a, str>>,
            V: Into<Cow<'a, str>>,
        {
            CookieBuilder::new(name, value)
        }

        /// Creates a new `Cookie` instance from the given name and value.
        #[inline]
        pub fn new<N, V>(name: N, value: V) -> Cookie<'a>
        where
            N: Into<Cow<'a, str>>,
            V: Into<Cow<'a, str>>,
        {
            Cookie(cookie_crate::Cookie::new(name, value))
        }

        /// The name of the cookie.
        #[inline]
        pub fn name(&self) -> &str {
            self.0.name()
        }

        /// The value of the cookie.
        #[inline]
        pub fn value(&self) -> &str {
            self.0.value()
        }

        /// Returns true if the 'HttpOnly' directive is enabled.
        #[inline]
        pub fn http_only(&self) -> bool {
            self.0.http_only().unwrap_or(false)
        }

        /// Returns true if the 'Secure' directive is enabled.
        #[inline]
        pub fn secure(&self) -> bool {
            self.0.secure().unwrap_or(false)
        }

        /// Returns the path directive of the cookie, if set.
        #[inline]
        pub fn path(&self) -> Option<&str> {
            self.0.path()
        }

        /// Returns the domain directive of the cookie, if set.
        #[inline]
        pub fn domain(&self) -> Option<&str> {
            self.0.domain()
        }

        /// The cookie expiration time.
        pub fn expires(&self) -> Option<SystemTime> {
            match self.0.expires() {
                Some(cookie_crate::Expiration::DateTime(offset)) => Some(SystemTime::from(offset)),
                None | Some(cookie_crate::Expiration::Session) => None,
            }
        }

        /// Converts `self` into a `Cookie` with a static lifetime.
        #[inline]
        pub fn into_owned(self) -> Cookie<'static> {
            Cookie(self.0.into_owned())
        }
    }

    impl fmt::Display for Cookie<'_> {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    // ===== impl CookieBuilder =====

    impl<'c> CookieBuilder<'c> {
        /// Creates a new `CookieBuilder` instance from the given name and value.
        pub fn new<N, V>(name: N, value: V) -> Self
        where
            N: Into<Cow<'c, str>>,
            V: Into<Cow<'c, str>>,
        {
            CookieBuilder(cookie_crate::CookieBuilder::new(name, value))
        }

        /// Set the 'HttpOnly' directive.
        #[inline]
        pub fn http_only(mut self, enabled: bool) -> Self {
            self.0 = self.0.http_only(enabled);
            self
        }

        /// Set the 'Secure' directive.
        #[inline]
        pub fn secure(mut self, enabled: bool) -> Self {
            self.0 = self.0.secure(enabled);
            self
        }

        /// Set the path directive.
        #[inline]
        pub fn path<P>(mut self, path: P) -> Self
        where
            P: Into<Cow<'c, str>>,
        {
            self.0 = self.0.path(path);
            self
        }

        /// Set the domain directive.
        #[inline]
        pub fn domain<D>(mut self, domain: D) -> Self
        where
            D: Into<Cow<'c, str>>,
        {
            self.0 = self.0.domain(domain);
            self
        }

        /// Build the `Cookie`.
        #[inline]
        pub fn build(self) -> Cookie<'c> {
            Cookie(self.0.build())
        }
    }

    pub(crate) fn extract_response_cookies(
        headers: &HeaderMap,
    ) -> impl Iterator<Item = Result<Cookie<'_>, CookieParseError>> {
        headers.get_all(SET_COOKIE).iter().map(Cookie::parse)
    }

    /// Error representing a parse failure of a 'Set-Cookie' header.
    pub(crate) struct CookieParseError(cookie_crate::ParseError);

    impl fmt::Debug for CookieParseError {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    impl fmt::Display for CookieParseError {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    impl std::error::Error for CookieParseError {}

    // ===== impl Jar =====

    impl Jar {
        /// Add a cookie str to this jar.
        ///
        /// # Example
        ///
        /// ```
        /// use rquest_transfer::cookie::Jar;
        /// use url::Url;
        ///
        /// let cookie = "foo=bar; Domain=yolo.local";
        /// let url = "http://yolo.local".parse::<Url>().unwrap();
        ///
        /// let jar = Jar::default();
        /// jar.add_cookie_str(cookie, &url);
        /// ```
        pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
            let cookies = cookie_crate::Cookie::parse(cookie)
                .ok()
                .map(|c| c.into_owned())
                .into_iter();
            self.0.write().store_response_cookies(cookies, url);
        }

        /// Add a cookie to this jar.
        pub fn add_cookie(&self, cookie: Cookie<'_>, url: &Url) {
            if let Err(e) = self.0.write().insert_raw(&cookie.0, url) {
                log::warn!("cookie rejected for {url}: {e}");
            }
        }

        /// Removes the cookie named `name` that applies to `url`.
        pub fn remove(&self, name: &str, url: &Url) {
            if let Some(domain) = url.host_str() {
                self.0.write().remove(domain, url.path(), name);
            }
        }

        /// Clear the contents of the jar.
        pub fn clear(&self) {
            self.0.write().clear();
        }
    }

    impl CookieStore for Jar {
        fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
            let iter = cookie_headers.filter_map(|val| match Cookie::parse(val) {
                Ok(c) => Some(c.0.into_owned()),
                Err(e) => {
                    log::warn!("ignoring unparsable Set-Cookie from {url}: {e}");
                    None
                }
            });

            self.0.write().store_response_cookies(iter, url);
        }

        fn cookies(&self, url: &Url) -> Option<Vec<HeaderValue>> {
            let mut cookies = Vec::new();
            let lock = self.0.read();
            for (name, value) in lock.get_request_values(url) {
                let mut cookie = bytes::BytesMut::with_capacity(64);
                cookie.put(name.as_bytes());
                cookie.put(&b"="[..]);
                cookie.put(value.as_bytes());
                if let Ok(cookie) = HeaderValue::from_maybe_shared(cookie) {
                    cookies.push(cookie);
                }
            }

            if cookies.is_empty() {
                None
            } else {
                Some(cookies)
            }
        }
    }

    impl Default for Jar {
        fn default() -> Self {
            Self(RwLock::new(cookie_store::CookieStore::default()))
        }
    }
}
