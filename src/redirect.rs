//! Redirect Handling
//!
//! By default, a `Session` follows HTTP redirects itself, up to a chain of 20
//! hops. To customize this behavior, a `redirect::Policy` can be used with a
//! `SessionBuilder`. A task delegate is asked to confirm every hop the policy
//! lets through.

use std::{fmt, sync::Arc};

use http::{
    header::{
        AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION,
        PROXY_AUTHORIZATION, TRANSFER_ENCODING, WWW_AUTHENTICATE,
    },
    HeaderMap, Method, StatusCode,
};
use url::Url;

use crate::{
    error::{BoxError, TooManyRedirects},
    request::Request,
    response::Response,
};

/// A type that controls the policy on how to handle the following of redirects.
///
/// The default value has a maximum of 20 redirects it will follow in a chain
/// before failing the task with a too-many-redirects error.
///
/// - `limited` can be used have the same as the default behavior, but adjust the allowed maximum
///   redirect hops in a chain.
/// - `none` can be used to disable all redirect behavior.
/// - `custom` can be used to create a customized policy.
#[derive(Clone)]
pub struct Policy {
    inner: PolicyKind,
}

/// A type that holds information on the next request and previous requests
/// in redirect chain.
#[derive(Debug)]
pub struct Attempt<'a> {
    status: StatusCode,
    next: &'a Url,
    previous: &'a [Url],
}

/// An action to perform when a redirect status code is found.
#[derive(Debug)]
pub struct Action {
    inner: ActionKind,
}

impl Policy {
    /// Create a `Policy` with a maximum number of redirects.
    ///
    /// An `Error` will be returned if the max is reached.
    pub fn limited(max: usize) -> Self {
        Self {
            inner: PolicyKind::Limit(max),
        }
    }

    /// Create a `Policy` that does not follow any redirect.
    ///
    /// The redirect response completes the task like any other response.
    pub fn none() -> Self {
        Self {
            inner: PolicyKind::None,
        }
    }

    /// Create a custom `Policy` using the passed function.
    ///
    /// # Note
    ///
    /// The default `Policy` handles a maximum loop
    /// chain, but the custom variant does not do that for you automatically.
    /// The custom policy should have some way of handling those.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use rquest_transfer::{Error, redirect};
    /// #
    /// # fn run() -> Result<(), Error> {
    /// let custom = redirect::Policy::custom(|attempt| {
    ///     if attempt.previous().len() > 5 {
    ///         attempt.error("too many redirects")
    ///     } else if attempt.url().host_str() == Some("example.domain") {
    ///         // prevent redirects to 'example.domain'
    ///         attempt.stop()
    ///     } else {
    ///         attempt.follow()
    ///     }
    /// });
    /// let session = rquest_transfer::Session::builder().redirect(custom).build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn custom<T>(policy: T) -> Self
    where
        T: Fn(Attempt) -> Action + Send + Sync + 'static,
    {
        Self {
            inner: PolicyKind::Custom(Arc::new(policy)),
        }
    }

    /// Apply this policy to a given [`Attempt`] to produce a [`Action`].
    pub fn redirect(&self, attempt: Attempt) -> Action {
        match self.inner {
            PolicyKind::Custom(ref custom) => custom(attempt),
            PolicyKind::Limit(max) => {
                // The first URL in the previous is the initial URL and not a redirection. It needs
                // to be excluded.
                if attempt.previous.len() > max {
                    attempt.error(TooManyRedirects)
                } else {
                    attempt.follow()
                }
            }
            PolicyKind::None => attempt.stop(),
        }
    }

    pub(crate) fn check(&self, status: StatusCode, next: &Url, previous: &[Url]) -> ActionKind {
        self.redirect(Attempt {
            status,
            next,
            previous,
        })
        .inner
    }
}

impl Default for Policy {
    fn default() -> Policy {
        Policy::limited(20)
    }
}

impl<'a> Attempt<'a> {
    /// Get the type of redirect.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the next URL to redirect to.
    pub fn url(&self) -> &Url {
        self.next
    }

    /// Get the list of previous URLs that have already been requested in this chain.
    pub fn previous(&self) -> &[Url] {
        self.previous
    }

    /// Returns an action meaning the task should follow the next URL.
    pub fn follow(self) -> Action {
        Action {
            inner: ActionKind::Follow,
        }
    }

    /// Returns an action meaning the task should not follow the next URL.
    ///
    /// The 30x response and its body complete the task.
    pub fn stop(self) -> Action {
        Action {
            inner: ActionKind::Stop,
        }
    }

    /// Returns an action failing the redirect with an error.
    pub fn error<E: Into<BoxError>>(self, error: E) -> Action {
        Action {
            inner: ActionKind::Error(error.into()),
        }
    }
}

#[derive(Clone)]
enum PolicyKind {
    Custom(Arc<dyn Fn(Attempt) -> Action + Send + Sync + 'static>),
    Limit(usize),
    None,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Policy").field(&self.inner).finish()
    }
}

impl fmt::Debug for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PolicyKind::Custom(..) => f.pad("Custom"),
            PolicyKind::Limit(max) => f.debug_tuple("Limit").field(&max).finish(),
            PolicyKind::None => f.pad("None"),
        }
    }
}

#[derive(Debug)]
pub(crate) enum ActionKind {
    Follow,
    Stop,
    Error(BoxError),
}

/// Status codes whose response is withheld from the delegate until the
/// redirect is declined.
pub(crate) fn is_redirect_status(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 305..=308)
}

/// Builds the follow-up request for a redirect response.
///
/// Returns `None` when the status is not a redirect, or when `Location` is
/// missing or can not be resolved.
pub(crate) fn redirect_request(response: &Response, from: &Request) -> Option<Request> {
    let status = response.status()?;
    let location = response.headers().get(LOCATION)?.to_str().ok()?;

    let drop_body = match status.as_u16() {
        301 | 302 if from.method() == Method::POST => true,
        303 => true,
        301 | 302 | 305..=308 => false,
        _ => return None,
    };

    let target = resolve_location(location, from.url())?;

    let mut request = from.clone();
    if drop_body {
        *request.method_mut() = Method::GET;
        *request.body_mut() = None;
        remove_content_headers(request.headers_mut());
    }
    remove_sensitive_headers(request.headers_mut(), &target, from.url());
    *request.url_mut() = target;
    Some(request)
}

/// Resolves a `Location` value against the URL of the request it answers.
///
/// A value naming both scheme and host is used as is. Anything else keeps the
/// original scheme and, unless it names its own authority, the original host
/// and port. The path always starts with `/`; query and fragment are carried
/// over without being encoded again.
pub(crate) fn resolve_location(location: &str, original: &Url) -> Option<Url> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }

    if let Ok(url) = Url::parse(location) {
        if url.has_host() {
            return Some(url);
        }
    }

    let (rest, fragment) = match location.split_once('#') {
        Some((rest, fragment)) => (rest, Some(fragment)),
        None => (location, None),
    };
    let (rest, query) = match rest.split_once('?') {
        Some((rest, query)) => (rest, Some(query)),
        None => (rest, None),
    };
    let (authority, path) = match rest.strip_prefix("//") {
        Some(rest) => match rest.find('/') {
            Some(idx) => (Some(&rest[..idx]), &rest[idx..]),
            None => (Some(rest), ""),
        },
        None => (None, rest),
    };

    let mut url = original.clone();
    if let Some(authority) = authority {
        let (host, port) = split_authority(authority)?;
        url.set_host(Some(host)).ok()?;
        url.set_port(port).ok()?;
    }
    if path.starts_with('/') {
        url.set_path(path);
    } else {
        url.set_path(&format!("/{path}"));
    }
    url.set_query(query);
    url.set_fragment(fragment);
    Some(url)
}

fn split_authority(authority: &str) -> Option<(&str, Option<u16>)> {
    let authority = authority.rsplit('@').next()?;
    if authority.is_empty() {
        return None;
    }
    // bracketed IPv6 literals carry colons of their own
    let port_sep = match authority.rfind(']') {
        Some(end) => authority[end..].find(':').map(|i| end + i),
        None => authority.rfind(':'),
    };
    match port_sep {
        Some(idx) => {
            let port = authority[idx + 1..].parse().ok()?;
            Some((&authority[..idx], Some(port)))
        }
        None => Some((authority, None)),
    }
}

fn remove_content_headers(headers: &mut HeaderMap) {
    headers.remove(CONTENT_TYPE);
    headers.remove(CONTENT_LENGTH);
    headers.remove(CONTENT_ENCODING);
    headers.remove(TRANSFER_ENCODING);
}

fn remove_sensitive_headers(headers: &mut HeaderMap, next: &Url, previous: &Url) {
    let cross_host = next.host_str() != previous.host_str()
        || next.port_or_known_default() != previous.port_or_known_default();
    if cross_host {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
        headers.remove("cookie2");
        headers.remove(PROXY_AUTHORIZATION);
        headers.remove(WWW_AUTHENTICATE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Version};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn response(status: u16, location: Option<&'static str>) -> Response {
        let mut headers = HeaderMap::new();
        if let Some(location) = location {
            headers.insert(LOCATION, HeaderValue::from_static(location));
        }
        Response::http(
            url("http://a.example/old"),
            StatusCode::from_u16(status).unwrap(),
            Version::HTTP_11,
            headers,
        )
    }

    fn post() -> Request {
        let mut req = Request::new(Method::POST, url("http://a.example/old"));
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        *req.body_mut() = Some("payload".into());
        req
    }

    #[test]
    fn test_redirect_policy_limit() {
        let policy = Policy::default();
        let next = url("http://x.y/z");
        let mut previous = (0..20)
            .map(|i| url(&format!("http://a.b/c/{i}")))
            .collect::<Vec<_>>();

        match policy.check(StatusCode::FOUND, &next, &previous) {
            ActionKind::Follow => (),
            other => panic!("unexpected {other:?}"),
        }

        previous.push(url("http://a.b.d/e/33"));

        match policy.check(StatusCode::FOUND, &next, &previous) {
            ActionKind::Error(err) if err.is::<TooManyRedirects>() => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_redirect_policy_limit_to_0() {
        let policy = Policy::limited(0);
        let next = url("http://x.y/z");
        let previous = vec![url("http://a.b/c")];

        match policy.check(StatusCode::FOUND, &next, &previous) {
            ActionKind::Error(err) if err.is::<TooManyRedirects>() => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_redirect_policy_custom() {
        let policy = Policy::custom(|attempt| {
            if attempt.url().host_str() == Some("foo") {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let next = url("http://bar/baz");
        match policy.check(StatusCode::FOUND, &next, &[]) {
            ActionKind::Follow => (),
            other => panic!("unexpected {other:?}"),
        }

        let next = url("http://foo/baz");
        match policy.check(StatusCode::FOUND, &next, &[]) {
            ActionKind::Stop => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn see_other_turns_post_into_get() {
        let next = redirect_request(&response(303, Some("/done")), &post()).unwrap();
        assert_eq!(next.method(), Method::GET);
        assert!(next.body().is_none());
        assert!(next.headers().get(CONTENT_TYPE).is_none());
        assert_eq!(next.url().as_str(), "http://a.example/done");

        let mut put = post();
        *put.method_mut() = Method::PUT;
        let next = redirect_request(&response(303, Some("/done")), &put).unwrap();
        assert_eq!(next.method(), Method::GET);
    }

    #[test]
    fn found_on_post_drops_body_but_keeps_other_methods() {
        let next = redirect_request(&response(302, Some("/x")), &post()).unwrap();
        assert_eq!(next.method(), Method::GET);
        assert!(next.body().is_none());

        let mut put = post();
        *put.method_mut() = Method::PUT;
        let next = redirect_request(&response(301, Some("/x")), &put).unwrap();
        assert_eq!(next.method(), Method::PUT);
        assert!(next.body().is_some());
    }

    #[test]
    fn temporary_redirect_preserves_method_and_body() {
        let next = redirect_request(&response(307, Some("/new")), &post()).unwrap();
        assert_eq!(next.method(), Method::POST);
        assert_eq!(next.body().and_then(|b| b.as_bytes()), Some(&b"payload"[..]));

        let next = redirect_request(&response(308, Some("/new")), &post()).unwrap();
        assert_eq!(next.method(), Method::POST);
    }

    #[test]
    fn non_redirect_status_or_missing_location() {
        assert!(redirect_request(&response(304, Some("/x")), &post()).is_none());
        assert!(redirect_request(&response(200, Some("/x")), &post()).is_none());
        assert!(redirect_request(&response(302, None), &post()).is_none());
        assert!(redirect_request(&response(302, Some("")), &post()).is_none());
    }

    #[test]
    fn relative_location_keeps_scheme_host_and_port() {
        let original = url("https://a.example:8443/old");
        let next = resolve_location("/new/path", &original).unwrap();
        assert_eq!(next.as_str(), "https://a.example:8443/new/path");

        let next = resolve_location("/new/path", &url("https://a.example/old")).unwrap();
        assert_eq!(next.as_str(), "https://a.example/new/path");
    }

    #[test]
    fn relative_location_forces_leading_slash() {
        let next = resolve_location("sibling", &url("http://a.example/dir/old")).unwrap();
        assert_eq!(next.as_str(), "http://a.example/sibling");
    }

    #[test]
    fn query_and_fragment_are_not_encoded_again() {
        let next = resolve_location("/p?q=a%20b#frag%21", &url("http://a.example/old?x=1")).unwrap();
        assert_eq!(next.path(), "/p");
        assert_eq!(next.query(), Some("q=a%20b"));
        assert_eq!(next.fragment(), Some("frag%21"));

        let next = resolve_location("/p", &url("http://a.example/old?x=1#f")).unwrap();
        assert_eq!(next.query(), None);
        assert_eq!(next.fragment(), None);
    }

    #[test]
    fn absolute_and_protocol_relative_locations() {
        let original = url("http://a.example/old");
        let next = resolve_location("https://b.example/x", &original).unwrap();
        assert_eq!(next.as_str(), "https://b.example/x");

        let next = resolve_location("//c.example:81/y", &original).unwrap();
        assert_eq!(next.as_str(), "http://c.example:81/y");
    }

    #[test]
    fn test_remove_sensitive_headers() {
        use http::header::ACCEPT;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("let me in"));
        headers.insert(COOKIE, HeaderValue::from_static("foo=bar"));

        let next = url("http://initial-domain.com/path");
        let mut filtered_headers = headers.clone();

        remove_sensitive_headers(&mut headers, &next, &url("http://initial-domain.com/new_path"));
        assert_eq!(headers, filtered_headers);

        filtered_headers.remove(AUTHORIZATION);
        filtered_headers.remove(COOKIE);

        remove_sensitive_headers(&mut headers, &next, &url("http://new-domain.com/path"));
        assert_eq!(headers, filtered_headers);
    }
}
