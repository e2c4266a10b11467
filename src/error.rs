use std::{error::Error as StdError, fmt, io};

use url::Url;

use crate::state::ParseError;

/// A `Result` alias where the `Err` case is `rquest_transfer::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The Errors that may occur when running a transfer.
///
/// Every error carries a normalized [`ErrorCode`], so callers can tell a
/// refused connection from a missing host without inspecting the source chain.
///
/// Note: Errors may include the full URL used to make the `Request`. If the URL
/// contains sensitive information (e.g. an API key as a query parameter), be
/// sure to remove it ([`without_url`](Error::without_url))
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    code: ErrorCode,
    source: Option<BoxError>,
    url: Option<Url>,
}

/// Normalized classification of a failed transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// The connection was refused by the remote host.
    CannotConnectToHost,
    /// The URL scheme is not handled by any registered protocol.
    UnsupportedUrl,
    /// The URL could not be used for a request.
    BadUrl,
    /// The host name could not be resolved.
    CannotFindHost,
    /// The connection was reset while the transfer was in progress.
    NetworkConnectionLost,
    /// The server sent nothing, or something that is not a valid response.
    BadServerResponse,
    /// The transfer was idle for longer than the configured timeout.
    TimedOut,
    /// The task was cancelled.
    Cancelled,
    /// The request carries a body that its method can not send.
    DataLengthExceedsMaximum,
    /// The redirect chain was longer than the configured limit.
    TooManyRedirects,
    /// The authentication challenge was cancelled.
    UserCancelledAuthentication,
    /// A body file does not exist.
    FileDoesNotExist,
    /// A body file can not be read.
    NoPermissionsToReadFile,
    /// Only cached data was allowed and nothing was cached.
    ResourceUnavailable,
    /// Any other failure.
    Unknown,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, code: ErrorCode, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                code,
                source: source.map(Into::into),
                url: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(code: ErrorCode, e: E) -> Error {
        Error::new(Kind::Builder, code, Some(e))
    }

    pub(crate) fn request<E: Into<BoxError>>(code: ErrorCode, e: E) -> Error {
        Error::new(Kind::Request, code, Some(e))
    }

    pub(crate) fn body(e: io::Error) -> Error {
        let code = match e.kind() {
            io::ErrorKind::NotFound => ErrorCode::FileDoesNotExist,
            io::ErrorKind::PermissionDenied => ErrorCode::NoPermissionsToReadFile,
            _ => ErrorCode::Unknown,
        };
        Error::new(Kind::Body, code, Some(e))
    }

    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, ErrorCode::Unknown, Some(e))
    }

    pub(crate) fn parse(e: ParseError) -> Error {
        Error::new(Kind::Parse(e), ErrorCode::BadServerResponse, Some(e))
    }

    pub(crate) fn redirect<E: Into<BoxError>>(e: E, url: Url) -> Error {
        let source = e.into();
        let code = if source.is::<TooManyRedirects>() {
            ErrorCode::TooManyRedirects
        } else {
            ErrorCode::Unknown
        };
        Error::new(Kind::Redirect, code, Some(source)).with_url(url)
    }

    pub(crate) fn timed_out() -> Error {
        Error::new(Kind::Request, ErrorCode::TimedOut, Some(TimedOut))
    }

    pub(crate) fn cancelled() -> Error {
        Error::new(Kind::Cancelled, ErrorCode::Cancelled, None::<Error>)
    }

    pub(crate) fn auth_cancelled() -> Error {
        Error::new(Kind::Auth, ErrorCode::UserCancelledAuthentication, None::<Error>)
    }

    pub(crate) fn from_code(code: ErrorCode) -> Error {
        match code {
            ErrorCode::Cancelled => Error::cancelled(),
            ErrorCode::TimedOut => Error::timed_out(),
            ErrorCode::UserCancelledAuthentication => Error::auth_cancelled(),
            code => Error::new(Kind::Request, code, None::<Error>),
        }
    }

    pub(crate) fn url_bad_scheme(url: Url) -> Error {
        Error::new(Kind::Builder, ErrorCode::UnsupportedUrl, Some(BadScheme)).with_url(url)
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Returns a mutable reference to the URL related to this error
    ///
    /// This is useful if you need to remove sensitive information from the URL
    /// (e.g. an API key in the query), but do not want to remove the URL
    /// entirely.
    pub fn url_mut(&mut self) -> Option<&mut Url> {
        self.inner.url.as_mut()
    }

    /// Add a url related to this error (overwriting any existing)
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related url from this error (if, for example, it contains
    /// sensitive information)
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Returns the normalized classification of this error.
    pub fn code(&self) -> ErrorCode {
        self.inner.code
    }

    /// Returns true if the error was raised while configuring a transfer.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error came from the transport.
    pub fn is_request(&self) -> bool {
        matches!(self.inner.kind, Kind::Request)
    }

    /// Returns true if the redirect chain was too long.
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect)
    }

    /// Returns true if the error is related to the request body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if the error is related to decoding the response's body
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if the response header could not be parsed.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns which part of the response header failed to parse, if any.
    pub fn parse_error(&self) -> Option<ParseError> {
        match self.inner.kind {
            Kind::Parse(e) => Some(e),
            _ => None,
        }
    }

    /// Returns true if the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.kind, Kind::Cancelled)
    }

    /// Returns true if an authentication challenge was cancelled.
    pub fn is_auth(&self) -> bool {
        matches!(self.inner.kind, Kind::Auth)
    }

    /// Returns true if the error is related to connect
    pub fn is_connect(&self) -> bool {
        matches!(
            self.inner.code,
            ErrorCode::CannotConnectToHost | ErrorCode::CannotFindHost
        )
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if self.inner.code == ErrorCode::TimedOut {
            return true;
        }

        let mut source = self.source();

        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }

            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }

            source = err.source();
        }

        false
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("rquest_transfer::Error");

        builder.field("kind", &self.inner.kind);
        builder.field("code", &self.inner.code);

        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Request => write!(f, "error sending request ({})", self.inner.code)?,
            Kind::Body => f.write_str("request body error")?,
            Kind::Decode => f.write_str("error decoding response body")?,
            Kind::Parse(_) => f.write_str("error parsing response header")?,
            Kind::Redirect => f.write_str("error following redirect")?,
            Kind::Cancelled => f.write_str("task cancelled")?,
            Kind::Auth => f.write_str("authentication cancelled")?,
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({})", url.as_str())?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorCode::CannotConnectToHost => "could not connect to the server",
            ErrorCode::UnsupportedUrl => "unsupported URL",
            ErrorCode::BadUrl => "bad URL",
            ErrorCode::CannotFindHost => "a server with the specified hostname could not be found",
            ErrorCode::NetworkConnectionLost => "the network connection was lost",
            ErrorCode::BadServerResponse => "bad server response",
            ErrorCode::TimedOut => "the request timed out",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::DataLengthExceedsMaximum => "request body stream exhausted",
            ErrorCode::TooManyRedirects => "too many HTTP redirects",
            ErrorCode::UserCancelledAuthentication => "user cancelled authentication",
            ErrorCode::FileDoesNotExist => "the file does not exist",
            ErrorCode::NoPermissionsToReadFile => "no permission to read the file",
            ErrorCode::ResourceUnavailable => "the requested resource is not available",
            ErrorCode::Unknown => "unknown error",
        })
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Request,
    Redirect,
    Body,
    Decode,
    Parse(ParseError),
    Cancelled,
    Auth,
}

#[derive(Debug)]
pub(crate) struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl StdError for BadScheme {}

#[derive(Debug)]
pub(crate) struct TooManyRedirects;

impl fmt::Display for TooManyRedirects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("too many HTTP redirects")
    }
}

impl StdError for TooManyRedirects {}
