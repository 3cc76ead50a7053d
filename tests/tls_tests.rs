//! TLS on both sides: a TLS listener in front of a TLS API server, and the
//! dialer's handshake directly, through a tunnel and against an untrusted certificate

use kube_upgrade_proxy::backend::BackendTarget;
use kube_upgrade_proxy::config::{BackendConfig, ListenerTlsConfig, PemSource, TransportConfig};
use kube_upgrade_proxy::dialer::UpgradeDialer;
use kube_upgrade_proxy::error::ProxyError;
use kube_upgrade_proxy::{tls, Listener, ProxyServer, ServerOptions};
use hyper::Uri;
use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Self-signed certificate and key for `localhost`, both PEM
struct Identity {
    cert_pem: String,
    key_pem: String,
}

fn localhost_identity() -> Identity {
    let CertifiedKey { cert, signing_key } = generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    Identity {
        cert_pem: cert.pem(),
        key_pem: signing_key.serialize_pem(),
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).to_string()
}

/// Reads one response with a Content-Length body; returns (head, body)
async fn read_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, String) {
    let head = timeout(Duration::from_secs(5), read_head(stream)).await.unwrap();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    timeout(Duration::from_secs(5), stream.read_exact(&mut body)).await.unwrap().unwrap();
    (head, String::from_utf8_lossy(&body).to_string())
}

/// Plain requests get their request line back; upgrades are switched and echoed
async fn serve_mock<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
    let head = read_head(&mut stream).await;
    let request_line = head.lines().next().unwrap_or_default().to_string();

    if head.to_ascii_lowercase().contains("\r\nupgrade: ") {
        let _ = stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n")
            .await;
        let _ = stream.flush().await;
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() || stream.flush().await.is_err() {
                        break;
                    }
                }
            }
        }
        return;
    }

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        request_line.len(),
        request_line
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
}

/// TLS API server whose certificate comes in as inline PEM
async fn spawn_tls_backend(identity: &Identity) -> SocketAddr {
    let config = tls::server_config(&ListenerTlsConfig {
        certificate: PemSource::Inline(identity.cert_pem.clone()),
        private_key: PemSource::Inline(identity.key_pem.clone()),
        min_version: None,
        max_version: None,
        cipher_suites: Vec::new(),
    })
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls_stream) = acceptor.accept(stream).await {
                    serve_mock(tls_stream).await;
                }
            });
        }
    });
    addr
}

fn backend_config(backend: SocketAddr, trusted: &Identity) -> BackendConfig {
    BackendConfig {
        server: format!("https://{}", backend),
        certificate_authority: Some(PemSource::Inline(trusted.cert_pem.clone())),
        tls_server_name: Some("localhost".to_string()),
        proxy_from_environment: false,
        ..BackendConfig::default()
    }
}

fn dialer_for(config: &BackendConfig) -> UpgradeDialer {
    let target = BackendTarget::from_config(config).unwrap();
    UpgradeDialer::for_backend(&target, &TransportConfig::default(), Duration::ZERO)
}

struct RunningProxy {
    addr: SocketAddr,
    listener_identity: Identity,
    shutdown: oneshot::Sender<()>,
    _cert_dir: TempDir,
}

/// Proxy with a TLS listener whose certificate and key are read from files
async fn start_tls_proxy(backend: BackendConfig) -> RunningProxy {
    let listener_identity = localhost_identity();
    let cert_dir = TempDir::new().unwrap();
    std::fs::write(cert_dir.path().join("proxy.crt"), &listener_identity.cert_pem).unwrap();
    std::fs::write(cert_dir.path().join("proxy.key"), &listener_identity.key_pem).unwrap();
    let listener_tls = ListenerTlsConfig::from_cert_dir(cert_dir.path());

    let mut options = ServerOptions::new(BackendTarget::from_config(&backend).unwrap());
    options.api_prefix = "/api-kube/".to_string();
    options.ping_period = Duration::ZERO;
    let server = ProxyServer::new(options).unwrap();

    let tls_config = Arc::new(tls::server_config(&listener_tls).unwrap());
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), Some(tls_config)).await.unwrap();
    assert!(listener.is_tls());
    let addr = listener.local_addr().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .serve_with_shutdown(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    RunningProxy {
        addr,
        listener_identity,
        shutdown: tx,
        _cert_dir: cert_dir,
    }
}

/// Client-side TLS connection to the proxy, trusting its listener certificate
async fn connect_tls(proxy: &RunningProxy) -> tokio_rustls::client::TlsStream<TcpStream> {
    let config = tls::client_config(&BackendConfig {
        server: "https://localhost".to_string(),
        certificate_authority: Some(PemSource::Inline(proxy.listener_identity.cert_pem.clone())),
        proxy_from_environment: false,
        ..BackendConfig::default()
    })
    .unwrap();
    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    TlsConnector::from(Arc::new(config))
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_request_over_tls_on_both_sides() {
    let backend_identity = localhost_identity();
    let backend = spawn_tls_backend(&backend_identity).await;
    let proxy = start_tls_proxy(backend_config(backend, &backend_identity)).await;

    let mut stream = connect_tls(&proxy).await;
    stream
        .write_all(b"GET /api-kube/api/v1/pods?watch=1 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert_eq!(body, "GET /api/v1/pods?watch=1 HTTP/1.1");

    let _ = proxy.shutdown.send(());
}

#[tokio::test]
async fn test_upgrade_over_tls_on_both_sides() {
    let backend_identity = localhost_identity();
    let backend = spawn_tls_backend(&backend_identity).await;
    let proxy = start_tls_proxy(backend_config(backend, &backend_identity)).await;

    let mut stream = connect_tls(&proxy).await;
    stream
        .write_all(
            b"POST /api-kube/api/v1/namespaces/default/pods/web/attach HTTP/1.1\r\n\
              Host: localhost\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n",
        )
        .await
        .unwrap();
    let head = timeout(Duration::from_secs(5), read_head(&mut stream)).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "{}", head);

    stream.write_all(b"encrypted both ways").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 19];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"encrypted both ways");

    let _ = proxy.shutdown.send(());
}

#[tokio::test]
async fn test_untrusted_backend_is_bad_gateway() {
    let backend_identity = localhost_identity();
    let stranger = localhost_identity();
    let backend = spawn_tls_backend(&backend_identity).await;
    let proxy = start_tls_proxy(backend_config(backend, &stranger)).await;

    let mut stream = connect_tls(&proxy).await;
    stream
        .write_all(b"GET /api-kube/version HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 502"), "{}", head);

    let _ = proxy.shutdown.send(());
}

#[tokio::test]
async fn test_direct_tls_dial() {
    let identity = localhost_identity();
    let backend = spawn_tls_backend(&identity).await;
    let dialer = dialer_for(&backend_config(backend, &identity));
    let uri: Uri = format!("https://{}/version", backend).parse().unwrap();

    let mut stream = dialer.dial(&uri).await.unwrap();
    assert!(stream.is_tls());
    stream
        .write_all(b"GET /version HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    let (head, body) = read_response(&mut stream).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert_eq!(body, "GET /version HTTP/1.1");
}

#[tokio::test]
async fn test_tls_dial_through_tunnel() {
    let identity = localhost_identity();
    let backend = spawn_tls_backend(&identity).await;

    let tunnel = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let tunnel_addr = tunnel.local_addr().unwrap();
    let tunnel_task = tokio::spawn(async move {
        let (mut client, _) = tunnel.accept().await.unwrap();
        let head = read_head(&mut client).await;
        let mut upstream = TcpStream::connect(backend).await.unwrap();
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        head
    });

    let mut config = backend_config(backend, &identity);
    config.proxy_url = Some(format!("http://{}", tunnel_addr));
    let dialer = dialer_for(&config);
    let uri: Uri = format!("https://{}/healthz", backend).parse().unwrap();

    let mut stream = dialer.dial(&uri).await.unwrap();
    assert!(stream.is_tls());
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    stream.flush().await.unwrap();
    let (_, body) = read_response(&mut stream).await;
    assert_eq!(body, "GET /healthz HTTP/1.1");
    drop(stream);

    let head = timeout(Duration::from_secs(5), tunnel_task).await.unwrap().unwrap();
    assert!(head.starts_with(&format!("CONNECT {} HTTP/1.1\r\n", backend)));
}

#[tokio::test]
async fn test_untrusted_certificate_fails_handshake() {
    let identity = localhost_identity();
    let stranger = localhost_identity();
    let backend = spawn_tls_backend(&identity).await;
    let dialer = dialer_for(&backend_config(backend, &stranger));
    let uri: Uri = format!("https://{}/", backend).parse().unwrap();

    let err = dialer.dial(&uri).await.err().unwrap();
    assert!(matches!(err, ProxyError::TlsHandshake(_)), "unexpected error: {:?}", err);
    assert!(err.is_dial_failure());
}
