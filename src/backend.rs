use crate::config::BackendConfig;
use crate::error::ProxyError;
use crate::proxy_resolver::{EnvironmentProxy, FixedProxy, ProxyResolver};
use crate::tls;
use log::{debug, info};
use rustls::ClientConfig;
use std::sync::Arc;
use url::Url;

/// The single upstream: where it lives, how to authenticate to it and which
/// forward proxy (if any) sits on the way.
#[derive(Clone)]
pub struct BackendTarget {
    location: Url,
    tls: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
    proxy: Option<Arc<dyn ProxyResolver>>,
}

impl std::fmt::Debug for BackendTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTarget")
            .field("location", &self.location.as_str())
            .field("tls", &self.tls.is_some())
            .field("server_name", &self.server_name)
            .field("proxy", &self.proxy.is_some())
            .finish()
    }
}

impl BackendTarget {
    /// A target with no TLS and no forward proxy.
    pub fn new(location: Url) -> Result<Self, ProxyError> {
        match location.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ProxyError::Config(format!(
                    "Unsupported backend scheme '{}', expected http or https",
                    other
                )));
            }
        }
        if location.host_str().is_none() {
            return Err(ProxyError::Config(format!("Backend URL '{}' has no host", location)));
        }
        Ok(Self {
            location,
            tls: None,
            server_name: None,
            proxy: None,
        })
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self, ProxyError> {
        let location = Url::parse(&config.server)
            .map_err(|e| ProxyError::Config(format!("Invalid backend server URL '{}': {}", config.server, e)))?;
        let mut target = Self::new(location)?;

        if target.location.scheme() == "https" {
            target.tls = Some(Arc::new(tls::client_config(config)?));
            target.server_name = config.tls_server_name.clone();
        }

        if let Some(raw) = config.proxy_url.as_deref().filter(|raw| !raw.trim().is_empty()) {
            info!("Backend connections go through proxy {}", raw);
            target.proxy = Some(Arc::new(FixedProxy::new(raw)?));
        } else if config.proxy_from_environment {
            let env = EnvironmentProxy::from_env()?;
            if env.is_configured() {
                debug!("Using proxy settings from the environment");
                target.proxy = Some(Arc::new(env));
            }
        }

        Ok(target)
    }

    pub fn with_tls(mut self, tls: Arc<ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = Some(server_name.into());
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ProxyResolver>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn tls(&self) -> Option<&Arc<ClientConfig>> {
        self.tls.as_ref()
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn proxy(&self) -> Option<&Arc<dyn ProxyResolver>> {
        self.proxy.as_ref()
    }

    /// `host[:port]` as it should appear in `Host` and `CONNECT`.
    pub fn authority(&self) -> String {
        let host = self.location.host_str().unwrap_or_default();
        match self.location.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Private copy of the TLS settings, so the dialer and the pooled
    /// transport never share mutable session state.
    pub fn cloned_tls(&self) -> Option<Arc<ClientConfig>> {
        self.tls.as_ref().map(|config| Arc::new(ClientConfig::clone(config)))
    }
}
