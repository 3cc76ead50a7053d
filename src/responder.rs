use crate::common::{ProxyBody, ResponseBuilder};
use crate::error::ProxyError;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::Response;
use log::error;

/// Turns a per-request proxy failure into the response the caller sees.
pub trait ErrorResponder: Send + Sync {
    fn report_error(&self, err: &ProxyError) -> Response<ProxyBody>;
}

/// Logs the failure and answers with a short plain-text error. Failed dials
/// also ask the client to drop the connection, since the upgrade is dead.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingResponder;

impl ErrorResponder for LoggingResponder {
    fn report_error(&self, err: &ProxyError) -> Response<ProxyBody> {
        error!("Error while proxying request: {}", err);
        let mut response = ResponseBuilder::proxy_error(err.status_code(), &err.to_string());
        if err.is_dial_failure() {
            response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
        }
        response
    }
}
