use async_trait::async_trait;
use futures::Stream;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File as TokioFile;
use tokio_util::io::ReaderStream;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type shared by every handler, inbound and outbound.
pub type ProxyBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub fn incoming_body(body: Incoming) -> ProxyBody {
    body.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

/// Peer address of the inbound connection, stored in request extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

/// A request handler mounted somewhere in the server.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody>;
}

/// Common response builder utilities
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Creates a not found response
    pub fn not_found(message: &str) -> Response<ProxyBody> {
        Self::error(StatusCode::NOT_FOUND, &format!("Not Found: {}", message))
    }

    pub fn forbidden() -> Response<ProxyBody> {
        Self::error(StatusCode::FORBIDDEN, "Forbidden")
    }

    /// Creates a proxy error response with custom message
    pub fn proxy_error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        Self::error(status, &format!("Proxy Error: {}", message))
    }

    /// Creates a generic plain-text error response
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(message.to_string()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }

    /// 301 to `location`; falls back to 404 if it is not a valid header value
    pub fn moved_permanently(location: &str) -> Response<ProxyBody> {
        match HeaderValue::from_str(location) {
            Ok(value) => {
                let mut response = Response::new(empty_body());
                *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
                response.headers_mut().insert(LOCATION, value);
                response
            }
            Err(_) => Self::not_found(location),
        }
    }
}

/// Streams a file as body frames without reading it into memory.
pub struct StreamingFileBody {
    stream: ReaderStream<TokioFile>,
    len: u64,
}

impl StreamingFileBody {
    pub fn new(file: TokioFile, len: u64) -> Self {
        Self {
            stream: ReaderStream::new(file),
            len,
        }
    }
}

impl Body for StreamingFileBody {
    type Data = Bytes;
    type Error = std::io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match Pin::new(&mut self.stream).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        hyper::body::SizeHint::with_exact(self.len)
    }
}
