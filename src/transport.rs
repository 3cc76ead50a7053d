use crate::backend::BackendTarget;
use crate::common::ProxyBody;
use crate::config::TransportConfig;
use crate::dialer::{BackendStream, UpgradeDialer};
use crate::error::ProxyError;
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use log::debug;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Pooled HTTP/1.1 client used for every non-upgrade request.
pub type Transport = Client<BackendConnector, ProxyBody>;

/// Connection type handed to the pool.
pub struct BackendIo(TokioIo<BackendStream>);

impl hyper::rt::Read for BackendIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.0), cx, buf)
    }
}

impl hyper::rt::Write for BackendIo {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.0), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.0), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.0), cx)
    }
}

impl Connection for BackendIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// Connector for the pooled client. Reuses the upgrade dialer so ordinary
/// requests and upgrades reach the backend the same way.
#[derive(Clone)]
pub struct BackendConnector {
    dialer: Arc<UpgradeDialer>,
}

impl BackendConnector {
    pub fn new(dialer: UpgradeDialer) -> Self {
        Self { dialer: Arc::new(dialer) }
    }
}

impl tower_service::Service<Uri> for BackendConnector {
    type Response = BackendIo;
    type Error = ProxyError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        Box::pin(async move {
            debug!("Opening pooled connection to {}", dst);
            let stream = dialer.dial(&dst).await?;
            Ok(BackendIo(TokioIo::new(stream)))
        })
    }
}

/// Builds the shared transport for `target`. Built once per server.
pub fn build_transport(target: &BackendTarget, config: &TransportConfig) -> Result<Transport, ProxyError> {
    if target.location().scheme() == "https" && target.tls().is_none() {
        return Err(ProxyError::Config(format!(
            "Backend {} uses https but no TLS configuration was derived",
            target.location()
        )));
    }

    let dialer = UpgradeDialer::for_backend(target, config, std::time::Duration::ZERO);
    let client = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(config.pool_idle_timeout())
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_timer(TokioTimer::new())
        .build(BackendConnector::new(dialer));

    debug!(
        "Transport for {} ready (pool: {} idle per host, {:?} idle timeout)",
        target.location(),
        config.pool_max_idle_per_host,
        config.pool_idle_timeout()
    );
    Ok(client)
}
