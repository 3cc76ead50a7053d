use crate::backend::BackendTarget;
use crate::common::{incoming_body, ClientAddr, Handler};
use crate::config::{normalize_prefix, Config, TransportConfig};
use crate::error::ProxyError;
use crate::filter::FilterServer;
use crate::reverse_proxy::UpgradeAwareHandler;
use crate::router::{Mux, PrefixRouter};
use crate::static_files::StaticFileHandler;
use crate::tls;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use rustls::ServerConfig;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Bound socket the server accepts on, optionally terminating TLS.
pub struct Listener {
    inner: TcpListener,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, tls: Option<Arc<ServerConfig>>) -> Result<Self, ProxyError> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self::from_tcp(inner, tls))
    }

    pub fn from_tcp(inner: TcpListener, tls: Option<Arc<ServerConfig>>) -> Self {
        Self {
            inner,
            tls: tls.map(TlsAcceptor::from),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.inner.local_addr()?)
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

/// Everything needed to assemble a [`ProxyServer`].
pub struct ServerOptions {
    pub api_prefix: String,
    pub static_prefix: String,
    pub static_dir: Option<PathBuf>,
    pub filter: Option<FilterServer>,
    pub backend: BackendTarget,
    pub transport: TransportConfig,
    pub ping_period: Duration,
}

impl ServerOptions {
    pub fn new(backend: BackendTarget) -> Self {
        Self {
            api_prefix: "/".to_string(),
            static_prefix: "/static/".to_string(),
            static_dir: None,
            filter: None,
            backend,
            transport: TransportConfig::default(),
            ping_period: crate::keepalive::DEFAULT_PING_PERIOD,
        }
    }
}

/// Local proxy: API traffic under one prefix, optional static files under another.
pub struct ProxyServer {
    mux: Arc<Mux>,
}

impl ProxyServer {
    pub fn new(options: ServerOptions) -> Result<Self, ProxyError> {
        let api_prefix = normalize_prefix(&options.api_prefix);
        let mut backend: Arc<dyn Handler> = Arc::new(UpgradeAwareHandler::new(
            &options.backend,
            &options.transport,
            options.ping_period,
        )?);
        // filtering sees the path with the prefix already stripped
        if let Some(filter) = options.filter {
            backend = Arc::new(Arc::new(filter).handler_for(backend));
        }
        let api: Arc<dyn Handler> = Arc::new(PrefixRouter::new(api_prefix.clone(), backend));

        let mut mux = Mux::new();
        mux.mount(&api_prefix, api)?;
        info!("Proxying {} to {}", api_prefix, options.backend.location());

        if let Some(dir) = options.static_dir.filter(|dir| !dir.as_os_str().is_empty()) {
            let static_prefix = normalize_prefix(&options.static_prefix);
            let files = StaticFileHandler::new(static_prefix.clone(), &dir)?;
            info!("Serving {} from {}", static_prefix, files.root().display());
            mux.mount(&static_prefix, Arc::new(files))?;
        }

        Ok(Self { mux: Arc::new(mux) })
    }

    pub fn from_config(config: &Config) -> Result<Self, ProxyError> {
        config.validate()?;
        let filter = config.filter.as_ref().map(FilterServer::from_config).transpose()?;
        Self::new(ServerOptions {
            api_prefix: config.api_prefix.clone(),
            static_prefix: config.static_prefix.clone(),
            static_dir: config.static_dir.clone(),
            filter,
            backend: BackendTarget::from_config(&config.backend)?,
            transport: config.transport.clone(),
            ping_period: config.ping_period(),
        })
    }

    /// Listener for `config`, with TLS when `listener_tls` is set.
    pub async fn listener_for(config: &Config) -> Result<Listener, ProxyError> {
        let tls = match &config.listener_tls {
            Some(listener_tls) => Some(Arc::new(tls::server_config(listener_tls)?)),
            None => None,
        };
        Listener::bind(config.listen_addr, tls).await
    }

    /// Serves until a non-recoverable accept error.
    pub async fn serve(&self, listener: Listener) -> Result<(), ProxyError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serves until `shutdown` resolves, then drops the listener. Accepted
    /// connections keep running until they finish on their own.
    pub async fn serve_with_shutdown(
        &self,
        listener: Listener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ProxyError> {
        let Listener { inner, tls } = listener;
        let local_addr = inner.local_addr()?;
        info!(
            "Listening on {}://{}",
            if tls.is_some() { "https" } else { "http" },
            local_addr
        );
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => {
                    info!("Closing listener on {}", local_addr);
                    return Ok(());
                }
                accepted = inner.accept() => accepted,
            };

            let (stream, remote_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    warn!("Accept error on {}: {}", local_addr, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    error!("Listener {} failed: {}", local_addr, e);
                    return Err(ProxyError::Io(e));
                }
            };

            debug!("Accepted connection from {}", remote_addr);
            let mux = self.mux.clone();
            let tls = tls.clone();
            tokio::spawn(async move {
                handle_connection(stream, remote_addr, tls, mux).await;
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, remote_addr: SocketAddr, tls: Option<TlsAcceptor>, mux: Arc<Mux>) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => serve_http(tls_stream, remote_addr, mux).await,
            Err(e) => warn!("Error establishing TLS connection from {}: {}", remote_addr, e),
        },
        None => serve_http(stream, remote_addr, mux).await,
    }
}

async fn serve_http<S>(stream: S, remote_addr: SocketAddr, mux: Arc<Mux>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
        let mux = mux.clone();
        async move {
            let mut req = req.map(incoming_body);
            req.extensions_mut().insert(ClientAddr(remote_addr));
            Ok::<_, Infallible>(mux.handle(req).await)
        }
    });

    if let Err(e) = ServerBuilder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("Error serving connection from {}: {}", remote_addr, e);
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    ) || matches!(e.raw_os_error(), Some(23) | Some(24)) // ENFILE, EMFILE
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn backend() -> BackendTarget {
        BackendTarget::new(Url::parse("http://127.0.0.1:1").unwrap()).unwrap()
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn test_missing_static_dir_is_config_error() {
        let mut options = ServerOptions::new(backend());
        options.static_dir = Some(PathBuf::from("/definitely/not/here"));
        assert!(matches!(ProxyServer::new(options), Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn test_from_config_validates() {
        let config = Config::default();
        assert!(matches!(ProxyServer::from_config(&config), Err(ProxyError::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_returns() {
        let server = ProxyServer::new(ServerOptions::new(backend())).unwrap();
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), None).await.unwrap();
        assert!(!listener.is_tls());
        server
            .serve_with_shutdown(listener, async {})
            .await
            .unwrap();
    }
}
