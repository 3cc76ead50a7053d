use crate::common::{Handler, ProxyBody, ResponseBuilder};
use crate::config::FilterConfig;
use crate::error::ProxyError;
use async_trait::async_trait;
use hyper::header::HOST;
use hyper::{Request, Response};
use log::info;
use regex::Regex;
use std::sync::Arc;

/// Compiles a comma-separated list of regular expressions, skipping empty entries.
pub fn make_regexps(patterns: &str) -> Result<Vec<Regex>, ProxyError> {
    compile(patterns.split(',').map(str::trim).filter(|p| !p.is_empty()))
}

fn compile<'a, I>(patterns: I) -> Result<Vec<Regex>, ProxyError>
where
    I: IntoIterator<Item = &'a str>,
{
    patterns
        .into_iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| ProxyError::Config(format!("Invalid filter pattern '{}': {}", pattern, e)))
        })
        .collect()
}

fn first_match<'r>(value: &str, patterns: &'r [Regex]) -> Option<&'r Regex> {
    patterns.iter().find(|re| re.is_match(value))
}

/// Accept/reject rules over method, path and host. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct FilterServer {
    accept_paths: Vec<Regex>,
    reject_paths: Vec<Regex>,
    accept_hosts: Vec<Regex>,
    reject_methods: Vec<Regex>,
}

impl FilterServer {
    pub fn new(
        accept_paths: Vec<Regex>,
        reject_paths: Vec<Regex>,
        accept_hosts: Vec<Regex>,
        reject_methods: Vec<Regex>,
    ) -> Self {
        Self {
            accept_paths,
            reject_paths,
            accept_hosts,
            reject_methods,
        }
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self, ProxyError> {
        Ok(Self::new(
            compile(config.accept_paths.iter().map(String::as_str))?,
            compile(config.reject_paths.iter().map(String::as_str))?,
            compile(config.accept_hosts.iter().map(String::as_str))?,
            compile(config.reject_methods.iter().map(String::as_str))?,
        ))
    }

    /// Rejections win; otherwise both path and host must be explicitly accepted.
    pub fn accept(&self, method: &str, path: &str, host: &str) -> bool {
        if let Some(re) = first_match(path, &self.reject_paths) {
            info!("Rejecting path {}, matched {}", path, re);
            return false;
        }
        if let Some(re) = first_match(method, &self.reject_methods) {
            info!("Rejecting method {} for {}, matched {}", method, path, re);
            return false;
        }
        match (first_match(path, &self.accept_paths), first_match(host, &self.accept_hosts)) {
            (Some(path_re), Some(host_re)) => {
                info!("Accepting {} {} from host {}, matched {} and {}", method, path, host, path_re, host_re);
                true
            }
            _ => {
                info!("Rejecting {} {} from host {}: not explicitly accepted", method, path, host);
                false
            }
        }
    }

    pub fn handler_for(self: Arc<Self>, delegate: Arc<dyn Handler>) -> FilteredHandler {
        FilteredHandler { filter: self, delegate }
    }
}

/// Host without its port, matching `net.SplitHostPort` semantics: `[::1]:8001`
/// yields `::1`, a value with no port is returned as-is.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((inner, after)) = rest.split_once(']') {
            if after.is_empty() || after.starts_with(':') {
                return if after.is_empty() { host } else { inner };
            }
        }
        return host;
    }
    match host.rsplit_once(':') {
        Some((name, _)) if !name.contains(':') => name,
        _ => host,
    }
}

fn request_host<B>(req: &Request<B>) -> String {
    let raw = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
        .unwrap_or("");
    strip_port(raw).to_string()
}

/// Applies a [`FilterServer`] before handing the request on.
pub struct FilteredHandler {
    filter: Arc<FilterServer>,
    delegate: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for FilteredHandler {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let host = request_host(&req);
        if self.filter.accept(req.method().as_str(), req.uri().path(), &host) {
            self.delegate.handle(req).await
        } else {
            ResponseBuilder::forbidden()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(accept_paths: &str, reject_paths: &str, accept_hosts: &str, reject_methods: &str) -> FilterServer {
        FilterServer::new(
            make_regexps(accept_paths).unwrap(),
            make_regexps(reject_paths).unwrap(),
            make_regexps(accept_hosts).unwrap(),
            make_regexps(reject_methods).unwrap(),
        )
    }

    #[test]
    fn test_reject_path_beats_accept() {
        let f = filter("^/.*", "^/secrets", "^localhost$", "");
        assert!(!f.accept("GET", "/secrets/foo", "localhost"));
        assert!(f.accept("GET", "/api/v1/pods", "localhost"));
    }

    #[test]
    fn test_empty_accept_list_denies_everything() {
        let f = filter("", "", "^localhost$", "^DELETE$");
        assert!(!f.accept("GET", "/api/v1/pods", "localhost"));
        assert!(!f.accept("DELETE", "/api/v1/pods/x", "localhost"));
    }

    #[test]
    fn test_reject_method_and_host() {
        let f = filter("^/.*", "", "^localhost$,^127\\.0\\.0\\.1$", "^POST$");
        assert!(!f.accept("POST", "/api", "localhost"));
        assert!(f.accept("GET", "/api", "127.0.0.1"));
        assert!(!f.accept("GET", "/api", "evil.example.com"));
    }

    #[test]
    fn test_make_regexps() {
        assert_eq!(make_regexps("^/api, ^/apis ,,").unwrap().len(), 2);
        assert!(make_regexps("").unwrap().is_empty());
        assert!(matches!(make_regexps("(unclosed"), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_from_config() {
        let config = FilterConfig {
            accept_paths: vec!["^.*".to_string()],
            reject_paths: vec!["^/api/.*/pods/.*/exec".to_string()],
            accept_hosts: vec!["^localhost$".to_string()],
            reject_methods: Vec::new(),
        };
        let f = FilterServer::from_config(&config).unwrap();
        assert!(!f.accept("GET", "/api/v1/namespaces/default/pods/web/exec", "localhost"));
        assert!(f.accept("GET", "/api/v1/namespaces", "localhost"));
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("localhost:8001"), "localhost");
        assert_eq!(strip_port("localhost"), "localhost");
        assert_eq!(strip_port("[::1]:8001"), "::1");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("::1"), "::1");
    }
}
