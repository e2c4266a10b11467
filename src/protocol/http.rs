use std::time::SystemTime;

use http::{
    header::{ACCEPT_LANGUAGE, CONNECTION, CONTENT_TYPE, EXPECT, USER_AGENT},
    HeaderValue, Method,
};
use url::Url;

use super::{CompletionAction, ProtocolHandler, ResponseDelivery};
use crate::{
    cache::{self, CachedResponse, UrlCache},
    cookie,
    engine::{BodyLength, TransferConfig},
    error::{Error, ErrorCode},
    redirect,
    request::Request,
    response::Response,
    session::SessionConfig,
    state::{ParseError, TransferState},
    util,
};

/// `http` and `https`.
#[derive(Debug)]
pub(crate) struct HttpProtocol;

impl ProtocolHandler for HttpProtocol {
    fn can_handle(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
    }

    fn configure(&self, request: &Request, session: &SessionConfig) -> crate::Result<TransferConfig> {
        let url = request.url();
        if !self.can_handle(url) {
            return Err(Error::url_bad_scheme(url.clone()));
        }
        if !url.has_host() {
            return Err(Error::builder(ErrorCode::BadUrl, "HTTP URL must have a host").with_url(url.clone()));
        }

        let method = request.method();
        let body_length = match request.body() {
            None if method == Method::GET => BodyLength::NoBody,
            None => BodyLength::Length(0),
            Some(_) if method == Method::GET => {
                return Err(Error::builder(
                    ErrorCode::DataLengthExceedsMaximum,
                    "GET request must not have a body",
                )
                .with_url(url.clone()));
            }
            Some(body) => match body.content_length().map_err(Error::body)? {
                Some(len) => BodyLength::Length(len),
                None => BodyLength::Unknown,
            },
        };

        let mut headers = session.headers.clone();
        util::replace_headers(&mut headers, request.headers().clone());
        if let Some(store) = &session.cookie_store {
            cookie::add_cookie_header(&**store, url, &mut headers);
        }
        headers
            .entry(CONNECTION)
            .or_insert(HeaderValue::from_static("keep-alive"));
        if let Some(user_agent) = &session.user_agent {
            headers.entry(USER_AGENT).or_insert_with(|| user_agent.clone());
        }
        if let Some(language) = &session.accept_language {
            headers
                .entry(ACCEPT_LANGUAGE)
                .or_insert_with(|| language.clone());
        }

        let mut lines = util::header_lines(&headers);
        if let Some(body) = request.body() {
            if !headers.contains_key(EXPECT) {
                lines.push("Expect:".to_owned());
            }
            let has_data = body.as_bytes().map_or(false, |bytes| !bytes.is_empty()) || body.is_stream();
            if method == Method::POST && !headers.contains_key(CONTENT_TYPE) && has_data {
                lines.push("Content-Type: application/x-www-form-urlencoded".to_owned());
            }
        }

        Ok(TransferConfig {
            url: url.clone(),
            method: method.as_str().to_owned(),
            headers: lines,
            body_length,
            no_body: method == Method::HEAD,
            decompress: session.decompress,
        })
    }

    fn append_header(
        &self,
        state: TransferState,
        data: &[u8],
        _content_length: Option<u64>,
    ) -> Result<TransferState, ParseError> {
        state.append_http_header_line(data)
    }

    fn on_header_complete(&self, response: &Response) -> ResponseDelivery {
        match response.status() {
            Some(status) if redirect::is_redirect_status(status.as_u16()) => ResponseDelivery::Withhold,
            _ => ResponseDelivery::Notify,
        }
    }

    fn withholds_body(&self, response: &Response) -> bool {
        response
            .status()
            .map_or(false, |status| redirect::is_redirect_status(status.as_u16()))
    }

    fn completion_action(&self, request: &Request, response: &Response) -> CompletionAction {
        match redirect::redirect_request(response, request) {
            Some(request) => CompletionAction::Redirect(request),
            None => CompletionAction::Complete,
        }
    }

    fn can_cache(&self, request: &Request, cached: &CachedResponse) -> bool {
        cache::can_cache(request, cached, SystemTime::now())
    }

    fn can_respond_from_cache(&self, cache: &dyn UrlCache, request: &Request, cached: &CachedResponse) -> bool {
        cache::can_respond_from_cache(cache, request, cached)
    }
}
