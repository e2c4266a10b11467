use std::fmt;

use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE},
    HeaderMap, StatusCode, Version,
};
use url::Url;

use crate::message::challenge::Challenge;
#[cfg(feature = "cookies")]
use crate::cookie;

/// The head of a response received for a transfer attempt.
///
/// HTTP responses carry a status, a version and header fields. FTP
/// responses only carry what the server announced about the file size.
#[derive(Clone)]
pub struct Response {
    url: Url,
    status: Option<StatusCode>,
    version: Option<Version>,
    headers: HeaderMap,
    expected_content_length: Option<u64>,
}

impl Response {
    pub(crate) fn http(url: Url, status: StatusCode, version: Version, headers: HeaderMap) -> Response {
        let expected_content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        Response {
            url,
            status: Some(status),
            version: Some(version),
            headers,
            expected_content_length,
        }
    }

    pub(crate) fn ftp(url: Url, expected_content_length: Option<u64>) -> Response {
        Response {
            url,
            status: None,
            version: None,
            headers: HeaderMap::new(),
            expected_content_length,
        }
    }

    /// Get the final `Url` of this `Response`.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the `StatusCode` of this `Response`, `None` for non-HTTP responses.
    #[inline]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Get the `Headers` of this `Response`.
    ///
    /// Repeated fields were joined with `", "` while parsing, so every name
    /// maps to a single value.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The body length announced by the server.
    #[inline]
    pub fn expected_content_length(&self) -> Option<u64> {
        self.expected_content_length
    }

    /// The media type of the `Content-Type` field, lowercased and without
    /// parameters.
    pub fn mime_type(&self) -> Option<String> {
        let value = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        let essence = value.split(';').next()?.trim();
        (!essence.is_empty()).then(|| essence.to_ascii_lowercase())
    }

    /// The `charset` parameter of the `Content-Type` field.
    pub fn text_encoding_name(&self) -> Option<String> {
        let value = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        value.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"').to_owned())
        })
    }

    /// Basic authentication challenges from every `WWW-Authenticate` field.
    pub fn challenges(&self) -> Vec<Challenge> {
        self.headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Challenge::parse_all)
            .collect()
    }

    /// Retrieve the cookies contained in the response.
    ///
    /// Note that invalid 'Set-Cookie' headers will be ignored.
    ///
    /// # Optional
    ///
    /// This requires the optional `cookies` feature to be enabled.
    #[cfg(feature = "cookies")]
    #[cfg_attr(docsrs, doc(cfg(feature = "cookies")))]
    pub fn cookies(&self) -> impl Iterator<Item = cookie::Cookie<'_>> {
        cookie::extract_response_cookies(&self.headers).filter_map(Result::ok)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}
