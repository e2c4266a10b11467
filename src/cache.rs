//! Response caching.
//!
//! A session may carry a [`UrlCache`]. Whether a finished response may be
//! stored, and whether a stored one may still answer a request, is decided
//! by the RFC 7234 rules in [`can_cache`]; anything that fails them on the
//! way out is evicted lazily.

use std::{collections::HashMap, fmt, time::SystemTime};

use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use http::{
    header::{
        AUTHORIZATION, CACHE_CONTROL, DATE, EXPIRES, PRAGMA, PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION, VARY, WWW_AUTHENTICATE,
    },
    HeaderMap, Method,
};

use crate::{request::Request, response::Response, sync::Mutex};

/// How a request consults the session's cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CachePolicy {
    /// Serve a stored response only while it is still fresh.
    #[default]
    UseProtocolCachePolicy,
    /// Always load from the network. The result may still be stored.
    ReloadIgnoringLocalCacheData,
    /// Serve any stored response, stale or not, and load only when there is none.
    ReturnCacheDataElseLoad,
    /// Serve any stored response and fail when there is none.
    ReturnCacheDataDontLoad,
}

/// A response head and body as kept by a [`UrlCache`].
#[derive(Clone)]
pub struct CachedResponse {
    response: Response,
    data: Bytes,
    date: SystemTime,
}

impl CachedResponse {
    /// Wraps a response received now.
    pub fn new(response: Response, data: Bytes) -> CachedResponse {
        CachedResponse {
            response,
            data,
            date: SystemTime::now(),
        }
    }

    /// Sets the time the response was stored at.
    pub fn with_date(mut self, date: SystemTime) -> CachedResponse {
        self.date = date;
        self
    }

    /// The stored response head.
    #[inline]
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// The stored body.
    #[inline]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// When the response was stored.
    #[inline]
    pub fn date(&self) -> SystemTime {
        self.date
    }
}

impl fmt::Debug for CachedResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CachedResponse")
            .field("url", &self.response.url().as_str())
            .field("status", &self.response.status())
            .field("len", &self.data.len())
            .finish()
    }
}

/// Storage for responses, injected into a session.
pub trait UrlCache: Send + Sync {
    /// The stored response for `request`, if any.
    fn cached_response(&self, request: &Request) -> Option<CachedResponse>;

    /// Stores `response` as the answer to `request`.
    fn store_cached_response(&self, response: CachedResponse, request: &Request);

    /// Drops whatever is stored for `request`.
    fn remove_cached_response(&self, request: &Request);
}

/// An in-memory [`UrlCache`] keyed by URL, fragment excluded.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CachedResponse>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }

    /// Number of stored responses.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn key(request: &Request) -> String {
        let mut url = request.url().clone();
        url.set_fragment(None);
        url.into()
    }
}

impl UrlCache for MemoryCache {
    fn cached_response(&self, request: &Request) -> Option<CachedResponse> {
        self.entries.lock().get(&Self::key(request)).cloned()
    }

    fn store_cached_response(&self, response: CachedResponse, request: &Request) {
        self.entries.lock().insert(Self::key(request), response);
    }

    fn remove_cached_response(&self, request: &Request) {
        self.entries.lock().remove(&Self::key(request));
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryCache").field("len", &self.len()).finish()
    }
}

/// `Cache-Control` directives this cache understands.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CacheControl {
    pub(crate) max_age: Option<u64>,
    pub(crate) shared_max_age: Option<u64>,
    pub(crate) no_cache: bool,
    pub(crate) no_store: bool,
}

impl CacheControl {
    pub(crate) fn parse(value: &str) -> CacheControl {
        let mut directives = CacheControl::default();
        for part in value.split(',').map(|p| p.trim().to_ascii_lowercase()) {
            if part == "no-cache" {
                directives.no_cache = true;
            } else if part == "no-store" {
                directives.no_store = true;
            } else if let Some(secs) = directive_argument(&part, "max-age") {
                directives.max_age = Some(secs);
            } else if let Some(secs) = directive_argument(&part, "s-maxage") {
                directives.shared_max_age = Some(secs);
            }
        }
        directives
    }
}

// `name=N` or `name="N"`
fn directive_argument(part: &str, name: &str) -> Option<u64> {
    let argument = part.strip_prefix(name)?.strip_prefix('=')?;
    if argument.contains('=') {
        return None;
    }
    let argument = match argument.strip_prefix('"') {
        Some(quoted) => quoted.strip_suffix('"')?,
        None => argument,
    };
    parse_seconds(argument)
}

fn parse_seconds(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// Obsolete HTTP-date forms, always in GMT: RFC 850 and asctime. Matched
/// after runs of whitespace are collapsed.
const OBSOLETE_DATE_FORMATS: [&str; 2] = ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %d %H:%M:%S %Y"];

fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.to_utc());
    }
    let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
    OBSOLETE_DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&collapsed, format).ok())
        .map(|naive| naive.and_utc())
}

fn header_str<'a>(headers: &'a HeaderMap, name: http::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// RFC 7234 storage eligibility of `cached` as the answer to `request`,
/// judged at `now`.
///
/// Authenticated exchanges, methods other than GET (HEAD only without a
/// body), `no-cache`/`no-store`, responses already expired, any `Vary`, and
/// statuses outside the heuristically cacheable set are all rejected.
pub(crate) fn can_cache(request: &Request, cached: &CachedResponse, now: SystemTime) -> bool {
    let response = cached.response();
    let Some(status) = response.status() else {
        return false;
    };
    let headers = response.headers();
    let now = DateTime::<Utc>::from(now);
    let stored = DateTime::<Utc>::from(cached.date());

    // a Date header can only make a response expire sooner
    let expiration_start = match header_str(headers, DATE).and_then(parse_http_date) {
        Some(date) => date.min(stored),
        None => stored,
    };

    if headers.contains_key(WWW_AUTHENTICATE)
        || headers.contains_key(PROXY_AUTHENTICATE)
        || request.headers().contains_key(AUTHORIZATION)
        || request.headers().contains_key(PROXY_AUTHORIZATION)
    {
        return false;
    }

    match *request.method() {
        Method::GET => {}
        Method::HEAD if cached.data().is_empty() => {}
        _ => return false,
    }

    let mut has_cache_control = false;
    let mut has_max_age = false;
    if let Some(value) = header_str(headers, CACHE_CONTROL) {
        let directives = CacheControl::parse(value);
        if directives.no_cache || directives.no_store {
            return false;
        }

        if let Some(max_age) = directives.max_age {
            has_max_age = true;
            let expiration = i64::try_from(max_age)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|age| expiration_start.checked_add_signed(age));
            match expiration {
                Some(expiration) if now < expiration => {}
                Some(_) => return false,
                // too far out to represent
                None => {}
            }
        }

        // s-maxage overrides Expires even for a private cache
        if directives.shared_max_age.is_some() {
            has_max_age = true;
        }

        has_cache_control = true;
    }

    if !has_cache_control {
        if let Some(pragma) = header_str(headers, PRAGMA) {
            if pragma
                .split(',')
                .any(|p| p.trim().eq_ignore_ascii_case("no-cache"))
            {
                return false;
            }
        }
    }

    if !matches!(
        status.as_u16(),
        200 | 203 | 204 | 206 | 300 | 301 | 404 | 405 | 410 | 414 | 501
    ) {
        return false;
    }

    // no Vary matching, so a varying response is never reused
    if headers.contains_key(VARY) {
        return false;
    }

    if !has_max_age {
        if let Some(expires) = headers.get(EXPIRES) {
            // invalid dates, "0" included, mean already expired
            let Some(expiration) = expires.to_str().ok().and_then(parse_http_date) else {
                return false;
            };
            if now >= expiration {
                return false;
            }
        }
    }

    true
}

/// Whether a stored response may still answer `request`.
///
/// An entry that no longer passes [`can_cache`] is removed from `cache`.
pub(crate) fn can_respond_from_cache(
    cache: &dyn UrlCache,
    request: &Request,
    cached: &CachedResponse,
) -> bool {
    if can_cache(request, cached, SystemTime::now()) {
        true
    } else {
        log::debug!("evicting stale cache entry for {}", request.url());
        cache.remove_cached_response(request);
        false
    }
}
