use hyper::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dial error: {0}")]
    Dial(String),

    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    #[error("Proxy tunnel error: {0}")]
    ProxyTunnel(String),

    #[error("Backend round trip error: {0}")]
    BackendRoundTrip(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("URI error: {0}")]
    Uri(String),
}

impl ProxyError {
    /// Status an error responder answers with for this kind of failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    /// True for the failures of the upgrade dialer.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            ProxyError::Dial(_) | ProxyError::TlsHandshake(_) | ProxyError::ProxyTunnel(_)
        )
    }
}

/// Flattens an error and its sources into one line, hyper's client errors
/// keep the interesting part in the source chain.
pub fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
