use crate::config::{BackendConfig, ListenerTlsConfig, PemSource, TlsVersion};
use crate::error::ProxyError;
use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme, SupportedProtocolVersion};
use std::sync::Arc;

const HTTP11_ALPN: &[u8] = b"http/1.1";

/// Loads a certificate chain from PEM.
pub fn load_certs(source: &PemSource) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let pem = source.read()?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read certificate {}: {}", source.describe(), e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Config(format!("No valid certificate found in {}", source.describe())));
    }
    Ok(certs)
}

/// Loads the first private key (PKCS#1, PKCS#8 or SEC1) from PEM.
pub fn load_private_key(source: &PemSource) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let pem = source.read()?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| ProxyError::Config(format!("Failed to read private key {}: {}", source.describe(), e)))?
        .ok_or_else(|| ProxyError::Config(format!("No valid private key found in {}", source.describe())))
}

fn protocol_versions(
    min: Option<TlsVersion>,
    max: Option<TlsVersion>,
) -> Result<Vec<&'static SupportedProtocolVersion>, ProxyError> {
    let min = min.unwrap_or(TlsVersion::Tls12);
    let max = max.unwrap_or(TlsVersion::Tls13);
    let versions: Vec<&'static SupportedProtocolVersion> = [
        (TlsVersion::Tls12, &rustls::version::TLS12),
        (TlsVersion::Tls13, &rustls::version::TLS13),
    ]
    .into_iter()
    .filter(|(version, _)| *version >= min && *version <= max)
    .map(|(_, supported)| supported)
    .collect();

    if versions.is_empty() {
        return Err(ProxyError::Config(format!(
            "No TLS protocol version between {:?} and {:?}",
            min, max
        )));
    }
    Ok(versions)
}

// Accepts both rustls' enum names (TLS13_AES_128_GCM_SHA256) and IANA names (TLS_AES_128_GCM_SHA256).
fn suite_matches(suite: &rustls::SupportedCipherSuite, name: &str) -> bool {
    let own = format!("{:?}", suite.suite());
    let wanted = name.trim().to_ascii_uppercase();
    if own == wanted {
        return true;
    }
    let iana = own
        .strip_prefix("TLS13_")
        .map(|rest| format!("TLS_{}", rest))
        .unwrap_or_else(|| own.clone());
    iana == wanted
}

fn crypto_provider(cipher_suites: &[String]) -> Result<CryptoProvider, ProxyError> {
    let mut provider = rustls::crypto::aws_lc_rs::default_provider();
    if cipher_suites.is_empty() {
        return Ok(provider);
    }

    for name in cipher_suites {
        if !provider.cipher_suites.iter().any(|suite| suite_matches(suite, name)) {
            return Err(ProxyError::Config(format!("Unsupported cipher suite: {}", name)));
        }
    }
    provider
        .cipher_suites
        .retain(|suite| cipher_suites.iter().any(|name| suite_matches(suite, name)));
    debug!("Restricted TLS cipher suites to {:?}", cipher_suites);
    Ok(provider)
}

fn root_store(ca: Option<&PemSource>) -> Result<RootCertStore, ProxyError> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(source) => {
            for cert in load_certs(source)? {
                roots
                    .add(cert)
                    .map_err(|e| ProxyError::Config(format!("Invalid CA certificate in {}: {}", source.describe(), e)))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs()
                .map_err(|e| ProxyError::Config(format!("Failed to load system root certificates: {}", e)))?;
            let (added, ignored) = roots.add_parsable_certificates(native);
            debug!("Loaded {} system root certificates ({} ignored)", added, ignored);
        }
    }
    Ok(roots)
}

/// Client TLS configuration for talking to the backend. ALPN is pinned to
/// HTTP/1.1 since both the pooled transport and the upgrade path speak it.
pub fn client_config(backend: &BackendConfig) -> Result<ClientConfig, ProxyError> {
    let provider = Arc::new(crypto_provider(&backend.cipher_suites)?);
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&protocol_versions(backend.min_version, backend.max_version)?)
        .map_err(|e| ProxyError::Config(format!("Unsupported TLS settings: {}", e)))?;

    let builder = if backend.insecure_skip_tls_verify {
        warn!("TLS verification of the backend certificate is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
    } else {
        builder.with_root_certificates(root_store(backend.certificate_authority.as_ref())?)
    };

    let mut config = match (&backend.client_certificate, &backend.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| ProxyError::Config(format!("Invalid client certificate: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(ProxyError::Config(
                "Client certificate and client key must be supplied together".to_string(),
            ));
        }
    };

    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Ok(config)
}

/// Server TLS configuration for the local listener.
pub fn server_config(listener: &ListenerTlsConfig) -> Result<ServerConfig, ProxyError> {
    let certs = load_certs(&listener.certificate)?;
    let private_key = load_private_key(&listener.private_key)?;

    let provider = Arc::new(crypto_provider(&listener.cipher_suites)?);
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&protocol_versions(listener.min_version, listener.max_version)?)
        .map_err(|e| ProxyError::Config(format!("Unsupported TLS settings: {}", e)))?
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::Config(format!("Failed to create TLS config: {}", e)))?;

    config.alpn_protocols = vec![HTTP11_ALPN.to_vec()];
    Ok(config)
}

/// Certificate verifier for `insecure_skip_tls_verify`. Handshake signatures
/// are still checked so the session keys belong to whoever sent the cert.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
