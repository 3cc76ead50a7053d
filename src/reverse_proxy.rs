use crate::backend::BackendTarget;
use crate::common::{empty_body, incoming_body, ClientAddr, Handler, ProxyBody};
use crate::config::TransportConfig;
use crate::dialer::UpgradeDialer;
use crate::error::{describe, ProxyError};
use crate::keepalive::PingFrame;
use crate::responder::{ErrorResponder, LoggingResponder};
use crate::splice::UpgradeSession;
use crate::transport::{build_transport, Transport};
use async_trait::async_trait;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

// Headers that describe a single hop and never travel through the proxy.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// `Connection: Upgrade` plus a non-empty `Upgrade` header.
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    });
    let protocol = headers
        .get(UPGRADE)
        .map(|value| !value.as_bytes().iter().all(u8::is_ascii_whitespace))
        .unwrap_or(false);
    wants_upgrade && protocol
}

/// Strips hop-by-hop headers, including any listed in `Connection`.
pub fn remove_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in listed.iter().map(String::as_str).chain(HOP_BY_HOP_HEADERS.iter().copied()) {
        headers.remove(name);
    }
}

/// Backend URI for a request: backend scheme, authority and base path, the
/// request path, and the raw query copied byte for byte.
pub fn build_target_uri(location: &Url, uri: &Uri) -> Result<Uri, ProxyError> {
    let path = uri.path();
    if !path.starts_with('/') {
        return Err(ProxyError::NotFound(path.to_string()));
    }

    let host = location
        .host_str()
        .ok_or_else(|| ProxyError::Config(format!("Backend URL '{}' has no host", location)))?;
    let mut target = match location.port() {
        Some(port) => format!("{}://{}:{}", location.scheme(), host, port),
        None => format!("{}://{}", location.scheme(), host),
    };
    target.push_str(location.path().trim_end_matches('/'));
    target.push_str(path);
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }

    target
        .parse::<Uri>()
        .map_err(|e| ProxyError::Uri(format!("{}: {}", target, e)))
}

fn set_forwarding_headers(headers: &mut HeaderMap, target: &Uri, client: Option<ClientAddr>) {
    if let Some(authority) = target.authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            headers.insert(HOST, value);
        }
    }

    if let Some(ClientAddr(addr)) = client {
        let ip = addr.ip().to_string();
        let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }
}

/// Forwards ordinary requests over the pooled transport and turns upgrade
/// requests into spliced raw streams over a freshly dialed connection.
pub struct UpgradeAwareHandler {
    location: Url,
    transport: Transport,
    dialer: UpgradeDialer,
    responder: Arc<dyn ErrorResponder>,
}

impl UpgradeAwareHandler {
    pub fn new(target: &BackendTarget, transport: &TransportConfig, ping_period: Duration) -> Result<Self, ProxyError> {
        Ok(Self {
            location: target.location().clone(),
            transport: build_transport(target, transport)?,
            dialer: UpgradeDialer::for_backend(target, transport, ping_period),
            responder: Arc::new(LoggingResponder),
        })
    }

    pub fn with_responder(mut self, responder: Arc<dyn ErrorResponder>) -> Self {
        self.responder = responder;
        self
    }

    async fn round_trip(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
        let target = build_target_uri(&self.location, req.uri())?;
        let (mut parts, body) = req.into_parts();
        let client = parts.extensions.get::<ClientAddr>().copied();

        debug!("{} {} -> {}", parts.method, parts.uri, target);
        remove_hop_by_hop_headers(&mut parts.headers);
        set_forwarding_headers(&mut parts.headers, &target, client);
        parts.uri = target;
        parts.version = Version::HTTP_11;

        let response = self
            .transport
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| ProxyError::BackendRoundTrip(describe(&e)))?;

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop_headers(&mut parts.headers);
        Ok(Response::from_parts(parts, incoming_body(body)))
    }

    async fn upgrade(&self, mut req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
        let target = build_target_uri(&self.location, req.uri())?;
        let client_upgrade = hyper::upgrade::on(&mut req);
        let offered = req.headers().get(UPGRADE).cloned();

        let stream = self.dialer.dial(&target).await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake::<_, ProxyBody>(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::Dial(format!("handshake with {} failed: {}", target, e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Backend upgrade connection ended: {}", e);
            }
        });

        let backend_request = upgrade_request(req, &target)?;
        let mut backend_response = sender
            .send_request(backend_request)
            .await
            .map_err(|e| ProxyError::BackendRoundTrip(describe(&e)))?;

        if backend_response.status() != StatusCode::SWITCHING_PROTOCOLS {
            info!("Backend declined upgrade for {} with {}", target, backend_response.status());
            let (parts, body) = backend_response.into_parts();
            return Ok(Response::from_parts(parts, incoming_body(body)));
        }

        let backend_upgrade = hyper::upgrade::on(&mut backend_response);
        let frame = PingFrame::negotiated(backend_response.headers().get(UPGRADE), offered.as_ref());
        let keepalive = self.dialer.keepalive(frame);
        info!("Upgraded connection to {} ({:?} keepalive)", target, frame);

        tokio::spawn(async move {
            match futures::future::try_join(client_upgrade, backend_upgrade).await {
                Ok((client, backend)) => {
                    UpgradeSession::new(TokioIo::new(client), TokioIo::new(backend), keepalive)
                        .run()
                        .await;
                }
                Err(e) => warn!("Upgrade to {} could not be completed: {}", target, e),
            }
        });

        let (parts, _) = backend_response.into_parts();
        Ok(Response::from_parts(parts, empty_body()))
    }
}

// The backend sees the same handshake the client sent, in origin form.
fn upgrade_request(req: Request<ProxyBody>, target: &Uri) -> Result<Request<ProxyBody>, ProxyError> {
    let (parts, _) = req.into_parts();
    let client = parts.extensions.get::<ClientAddr>().copied();
    let path_and_query = target
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut headers = parts.headers;
    for name in ["proxy-connection", "keep-alive", "proxy-authorization", "te", "trailer", "transfer-encoding"] {
        headers.remove(name);
    }
    set_forwarding_headers(&mut headers, target, client);

    let mut request = Request::builder()
        .method(parts.method)
        .uri(path_and_query)
        .version(Version::HTTP_11)
        .body(empty_body())
        .map_err(|e| ProxyError::Http(e.to_string()))?;
    *request.headers_mut() = headers;
    Ok(request)
}

#[async_trait]
impl Handler for UpgradeAwareHandler {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let result = if is_upgrade_request(req.headers()) {
            self.upgrade(req).await
        } else {
            self.round_trip(req).await
        };
        result.unwrap_or_else(|e| self.responder.report_error(&e))
    }
}
