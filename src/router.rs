use crate::common::{Handler, ProxyBody, ResponseBuilder};
use crate::error::ProxyError;
use async_trait::async_trait;
use http::uri::PathAndQuery;
use hyper::{Request, Response, Uri};
use log::{debug, info};
use std::sync::Arc;

/// Removes `prefix` from `path`, keeping a leading `/` on what is left.
/// Paths outside the prefix, and the bare prefix itself, are rejected.
pub fn strip_leave_slash(prefix: &str, path: &str) -> Result<String, ProxyError> {
    let stripped = match path.strip_prefix(prefix) {
        Some(rest) if !prefix.is_empty() && !rest.is_empty() => rest,
        _ => return Err(ProxyError::NotFound(path.to_string())),
    };
    if stripped.starts_with('/') {
        Ok(stripped.to_string())
    } else {
        Ok(format!("/{}", stripped))
    }
}

fn replace_path(uri: &Uri, path: &str) -> Result<Uri, ProxyError> {
    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(
        PathAndQuery::try_from(path_and_query.as_str()).map_err(|e| ProxyError::Uri(e.to_string()))?,
    );
    Uri::from_parts(parts).map_err(|e| ProxyError::Uri(e.to_string()))
}

/// Strips the API prefix before handing the request on.
pub struct PrefixRouter {
    prefix: String,
    delegate: Arc<dyn Handler>,
}

impl PrefixRouter {
    pub fn new(prefix: impl Into<String>, delegate: Arc<dyn Handler>) -> Self {
        Self {
            prefix: prefix.into(),
            delegate,
        }
    }

    pub fn route(&self, path: &str) -> Result<String, ProxyError> {
        strip_leave_slash(&self.prefix, path)
    }
}

#[async_trait]
impl Handler for PrefixRouter {
    async fn handle(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        let rewritten = self
            .route(req.uri().path())
            .and_then(|path| replace_path(req.uri(), &path));
        match rewritten {
            Ok(uri) => {
                *req.uri_mut() = uri;
                self.delegate.handle(req).await
            }
            Err(_) => ResponseBuilder::not_found(req.uri().path()),
        }
    }
}

/// A handler mounted under a prefix ending in `/`.
pub struct ProxyRoute {
    prefix: String,
    handler: Arc<dyn Handler>,
}

impl ProxyRoute {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

/// Dispatches on the longest mounted prefix.
#[derive(Default)]
pub struct Mux {
    routes: Vec<ProxyRoute>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, prefix: &str, handler: Arc<dyn Handler>) -> Result<(), ProxyError> {
        if !prefix.starts_with('/') || !prefix.ends_with('/') {
            return Err(ProxyError::Config(format!(
                "Mount prefix '{}' must begin and end with '/'",
                prefix
            )));
        }
        if self.routes.iter().any(|route| route.prefix == prefix) {
            return Err(ProxyError::Config(format!("Prefix '{}' is already mounted", prefix)));
        }
        info!("Mounted handler at {}", prefix);
        self.routes.push(ProxyRoute {
            prefix: prefix.to_string(),
            handler,
        });
        self.routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(())
    }

    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    fn find(&self, path: &str) -> Option<&ProxyRoute> {
        self.routes.iter().find(|route| path.starts_with(&route.prefix))
    }

    // "/api" for a route mounted at "/api/"
    fn find_slashless(&self, path: &str) -> Option<&ProxyRoute> {
        self.routes
            .iter()
            .find(|route| route.prefix.len() == path.len() + 1 && route.prefix.starts_with(path))
    }
}

#[async_trait]
impl Handler for Mux {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        let path = req.uri().path();
        // "/static" redirects even when "/" would also match it
        if let Some(route) = self.find_slashless(path) {
            let location = match req.uri().query() {
                Some(query) => format!("{}?{}", route.prefix, query),
                None => route.prefix.clone(),
            };
            return ResponseBuilder::moved_permanently(&location);
        }
        if let Some(route) = self.find(path) {
            debug!("{} {} -> route {}", req.method(), path, route.prefix);
            return route.handler.handle(req).await;
        }
        ResponseBuilder::not_found(path)
    }
}
