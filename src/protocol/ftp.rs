use url::Url;

use super::ProtocolHandler;
use crate::{
    engine::{BodyLength, TransferConfig},
    error::{Error, ErrorCode},
    request::Request,
    session::SessionConfig,
    state::{ParseError, TransferState},
};

/// Passive mode `ftp` downloads.
#[derive(Debug)]
pub(crate) struct FtpProtocol;

impl ProtocolHandler for FtpProtocol {
    fn can_handle(&self, url: &Url) -> bool {
        url.scheme() == "ftp"
    }

    fn configure(&self, request: &Request, _session: &SessionConfig) -> crate::Result<TransferConfig> {
        let url = request.url();
        if !url.has_host() {
            return Err(Error::builder(ErrorCode::BadUrl, "FTP URL must have a host").with_url(url.clone()));
        }
        if request.body().is_some() {
            return Err(Error::builder(
                ErrorCode::DataLengthExceedsMaximum,
                "FTP uploads are not supported",
            )
            .with_url(url.clone()));
        }

        Ok(TransferConfig {
            url: url.clone(),
            method: "RETR".to_owned(),
            headers: Vec::new(),
            body_length: BodyLength::NoBody,
            no_body: false,
            decompress: false,
        })
    }

    fn append_header(
        &self,
        state: TransferState,
        data: &[u8],
        content_length: Option<u64>,
    ) -> Result<TransferState, ParseError> {
        state.append_ftp_header_line(data, content_length)
    }
}
