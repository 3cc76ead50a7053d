//! Forward-proxy selection for backend connections.
//!
//! A resolver maps the backend URI being dialed to the URL of an HTTP proxy
//! to tunnel through, or to `None` for a direct connection.

use crate::error::ProxyError;
use hyper::Uri;
use ipnet::IpNet;
use log::debug;
use std::net::IpAddr;
use url::Url;

pub trait ProxyResolver: Send + Sync {
    fn proxy_for(&self, target: &Uri) -> Result<Option<Url>, ProxyError>;
}

impl<F> ProxyResolver for F
where
    F: Fn(&Uri) -> Result<Option<Url>, ProxyError> + Send + Sync,
{
    fn proxy_for(&self, target: &Uri) -> Result<Option<Url>, ProxyError> {
        self(target)
    }
}

/// Parses a proxy URL, defaulting to `http://` when no scheme is given.
pub fn parse_proxy_url(raw: &str) -> Result<Url, ProxyError> {
    let raw = raw.trim();
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{}", raw)
    };
    let url = Url::parse(&candidate)
        .map_err(|e| ProxyError::Config(format!("Invalid proxy URL '{}': {}", raw, e)))?;
    if url.scheme() != "http" {
        return Err(ProxyError::Config(format!(
            "Unsupported proxy scheme '{}' in '{}', only http proxies can be tunnelled",
            url.scheme(),
            raw
        )));
    }
    if url.host_str().is_none() {
        return Err(ProxyError::Config(format!("Proxy URL '{}' has no host", raw)));
    }
    Ok(url)
}

/// Sends every connection through the same proxy.
#[derive(Debug, Clone)]
pub struct FixedProxy {
    url: Url,
}

impl FixedProxy {
    pub fn new(raw: &str) -> Result<Self, ProxyError> {
        Ok(Self { url: parse_proxy_url(raw)? })
    }
}

impl ProxyResolver for FixedProxy {
    fn proxy_for(&self, _target: &Uri) -> Result<Option<Url>, ProxyError> {
        Ok(Some(self.url.clone()))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NoProxyEntry {
    Network(IpNet),
    Ip(IpAddr),
    // ".example.com" / "*.example.com": subdomains only
    Subdomains { domain: String, port: Option<u16> },
    // "example.com": the domain and its subdomains
    Domain { domain: String, port: Option<u16> },
}

/// Parsed `NO_PROXY` list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoProxy {
    all: bool,
    entries: Vec<NoProxyEntry>,
}

impl NoProxy {
    pub fn parse(raw: &str) -> Self {
        let mut no_proxy = NoProxy::default();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let item = item.to_lowercase();
            if item == "*" {
                no_proxy.all = true;
                continue;
            }
            if let Ok(net) = item.parse::<IpNet>() {
                no_proxy.entries.push(NoProxyEntry::Network(net));
                continue;
            }
            if let Ok(ip) = item.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
                no_proxy.entries.push(NoProxyEntry::Ip(ip));
                continue;
            }

            let (host, port) = split_host_port(&item);
            let port = port.and_then(|p| p.parse::<u16>().ok());
            if let Some(domain) = host.strip_prefix("*.").or_else(|| host.strip_prefix('.')) {
                no_proxy.entries.push(NoProxyEntry::Subdomains { domain: domain.to_string(), port });
            } else {
                no_proxy.entries.push(NoProxyEntry::Domain { domain: host.to_string(), port });
            }
        }
        no_proxy
    }

    pub fn matches(&self, host: &str, port: u16) -> bool {
        if self.all {
            return true;
        }
        let host = host.trim_start_matches('[').trim_end_matches(']').to_lowercase();
        let ip = host.parse::<IpAddr>().ok();

        self.entries.iter().any(|entry| match entry {
            NoProxyEntry::Network(net) => ip.is_some_and(|ip| net.contains(&ip)),
            NoProxyEntry::Ip(entry_ip) => ip == Some(*entry_ip),
            NoProxyEntry::Subdomains { domain, port: entry_port } => {
                port_matches(*entry_port, port)
                    && host.len() > domain.len()
                    && host.ends_with(&format!(".{}", domain))
            }
            NoProxyEntry::Domain { domain, port: entry_port } => {
                port_matches(*entry_port, port)
                    && (host == *domain || host.ends_with(&format!(".{}", domain)))
            }
        })
    }
}

fn port_matches(entry_port: Option<u16>, port: u16) -> bool {
    entry_port.is_none_or(|p| p == port)
}

fn split_host_port(item: &str) -> (&str, Option<&str>) {
    match item.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (item, None),
    }
}

fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

/// Proxy selection from `HTTPS_PROXY`, `HTTP_PROXY` and `NO_PROXY`
/// (upper or lower case). Loopback targets always connect directly.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentProxy {
    http_proxy: Option<Url>,
    https_proxy: Option<Url>,
    no_proxy: NoProxy,
}

impl EnvironmentProxy {
    pub fn from_env() -> Result<Self, ProxyError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |upper: &str, lower: &str| {
            lookup(upper)
                .or_else(|| lookup(lower))
                .filter(|value| !value.trim().is_empty())
        };

        let http_proxy = var("HTTP_PROXY", "http_proxy").map(|raw| parse_proxy_url(&raw)).transpose()?;
        let https_proxy = var("HTTPS_PROXY", "https_proxy").map(|raw| parse_proxy_url(&raw)).transpose()?;
        let no_proxy = var("NO_PROXY", "no_proxy").map(|raw| NoProxy::parse(&raw)).unwrap_or_default();

        Ok(Self { http_proxy, https_proxy, no_proxy })
    }

    pub fn is_configured(&self) -> bool {
        self.http_proxy.is_some() || self.https_proxy.is_some()
    }
}

impl ProxyResolver for EnvironmentProxy {
    fn proxy_for(&self, target: &Uri) -> Result<Option<Url>, ProxyError> {
        let host = target
            .host()
            .ok_or_else(|| ProxyError::Uri(format!("No host in {}", target)))?;
        let https = target.scheme_str() == Some("https");
        let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });

        if is_loopback(host) || self.no_proxy.matches(host, port) {
            debug!("Connecting directly to {}:{}", host, port);
            return Ok(None);
        }
        let proxy = if https { &self.https_proxy } else { &self.http_proxy };
        Ok(proxy.clone())
    }
}
