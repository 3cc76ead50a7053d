//! Integration tests for backend dialing: direct, tunnelled and refused tunnels

use kube_upgrade_proxy::config::BackendConfig;
use kube_upgrade_proxy::dialer::UpgradeDialer;
use kube_upgrade_proxy::error::ProxyError;
use kube_upgrade_proxy::proxy_resolver::{FixedProxy, ProxyResolver};
use kube_upgrade_proxy::tls;
use hyper::Uri;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use url::Url;

/// Reads up to the end of an HTTP header block
async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).to_string()
}

/// Echo server that answers a single connection
async fn spawn_echo_backend() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    addr
}

#[tokio::test]
async fn test_direct_dial_reaches_backend() {
    let backend = spawn_echo_backend().await;
    let dialer = UpgradeDialer::new(None);
    let uri: Uri = format!("http://{}/api/v1/namespaces", backend).parse().unwrap();

    let mut stream = dialer.dial(&uri).await.unwrap();
    assert!(!stream.is_tls());
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn test_dial_refused_is_dial_error() {
    // bind then drop to get a port nobody listens on
    let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let dialer = UpgradeDialer::new(None).with_timeouts(Duration::from_secs(2), Duration::from_secs(2));
    let uri: Uri = format!("http://{}/", addr).parse().unwrap();

    let err = dialer.dial(&uri).await.err().unwrap();
    assert!(matches!(err, ProxyError::Dial(_)), "unexpected error: {:?}", err);
    assert!(err.is_dial_failure());
}

#[tokio::test]
async fn test_connect_tunnel_reaches_backend() {
    let backend = spawn_echo_backend().await;
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();

    let proxy_task = tokio::spawn(async move {
        let (mut client, _) = proxy.accept().await.unwrap();
        let head = read_head(&mut client).await;
        let mut upstream = TcpStream::connect(backend).await.unwrap();
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .unwrap();
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        head
    });

    let resolver: Arc<dyn ProxyResolver> =
        Arc::new(FixedProxy::new(&format!("http://user:pass@{}", proxy_addr)).unwrap());
    let dialer = UpgradeDialer::new(None).with_proxy(resolver);
    let uri: Uri = format!("http://{}/api", backend).parse().unwrap();

    let mut stream = dialer.dial(&uri).await.unwrap();
    stream.write_all(b"through the tunnel").await.unwrap();
    let mut buf = [0u8; 18];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"through the tunnel");
    drop(stream);

    let head = timeout(Duration::from_secs(5), proxy_task).await.unwrap().unwrap();
    assert!(head.starts_with(&format!("CONNECT {} HTTP/1.1\r\n", backend)));
    assert!(head.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
}

#[tokio::test]
async fn test_rejected_tunnel_never_starts_tls() {
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy.local_addr().unwrap();

    let proxy_task = tokio::spawn(async move {
        let (mut client, _) = proxy.accept().await.unwrap();
        let head = read_head(&mut client).await;
        client
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        // anything further would be a TLS ClientHello
        let mut extra = Vec::new();
        let _ = timeout(Duration::from_millis(300), client.read_to_end(&mut extra)).await;
        (head, extra)
    });

    let backend = BackendConfig {
        server: "https://cluster.internal:6443".to_string(),
        insecure_skip_tls_verify: true,
        ..BackendConfig::default()
    };
    let tls_config = Arc::new(tls::client_config(&backend).unwrap());
    let resolver = move |_: &Uri| -> Result<Option<Url>, ProxyError> {
        Ok(Some(Url::parse(&format!("http://{}", proxy_addr)).unwrap()))
    };
    let dialer = UpgradeDialer::new(Some(tls_config)).with_proxy(Arc::new(resolver));

    let uri: Uri = "https://cluster.internal:6443/api/v1/namespaces/default/pods/web/exec"
        .parse()
        .unwrap();
    let err = dialer.dial(&uri).await.err().unwrap();
    assert!(matches!(err, ProxyError::ProxyTunnel(ref msg) if msg.contains("407")), "unexpected error: {:?}", err);

    let (head, extra) = proxy_task.await.unwrap();
    assert!(head.starts_with("CONNECT cluster.internal:6443 HTTP/1.1\r\n"));
    assert!(extra.is_empty());
}
