use crate::common::{empty_body, full_body, Handler, ProxyBody, ResponseBuilder, StreamingFileBody};
use crate::error::ProxyError;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, ALLOW, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, warn};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fs;
use std::path::{Component, Path, PathBuf};

// Characters escaped in a single path segment of a listing link.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'\\')
    .add(b'^')
    .add(b'|');

// HTML Templates

/// Template for directory listing page header
const HTML_DIR_LISTING_HEADER: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Directory listing for {path}</title>
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; }
        h1 { color: #333; }
        ul { list-style: none; padding: 0; }
        li { padding: 8px 0; }
        a { text-decoration: none; color: #0066cc; }
        .directory { font-weight: bold; }
    </style>
</head>
<body>
    <h1>Directory listing for {path}</h1>
    <ul>"#;

const HTML_DIR_LISTING_FOOTER: &str = r#"    </ul>
</body>
</html>"#;

const HTML_DIR_PARENT_LINK: &str = r#"        <li><a href="../">../</a></li>"#;

const HTML_DIR_ENTRY_TEMPLATE: &str = r#"        <li class="{class}"><a href="{href}">{name}</a></li>"#;

const INDEX_FILE: &str = "index.html";

/// Serves files below `root` for requests under `prefix`.
#[derive(Debug, Clone)]
pub struct StaticFileHandler {
    prefix: String,
    root: PathBuf,
}

impl StaticFileHandler {
    pub fn new(prefix: impl Into<String>, root_dir: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let root_dir = root_dir.as_ref();
        let root = root_dir.canonicalize().map_err(|e| {
            ProxyError::Config(format!("Invalid static directory '{}': {}", root_dir.display(), e))
        })?;
        if !root.is_dir() {
            return Err(ProxyError::Config(format!(
                "Static path '{}' is not a directory",
                root.display()
            )));
        }
        Ok(Self {
            prefix: prefix.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a request path to a location under the root. `None` means the
    /// path is outside the prefix or tries to leave the root.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path.strip_prefix(self.prefix.as_str())?;
        let decoded = percent_decode_str(relative).decode_utf8().ok()?;

        let mut resolved = self.root.clone();
        for component in Path::new(&*decoded).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => return None,
            }
        }

        // symlinks may still point elsewhere
        match resolved.canonicalize() {
            Ok(canonical) if canonical.starts_with(&self.root) => Some(canonical),
            Ok(_) => None,
            Err(_) => Some(resolved),
        }
    }

    async fn serve(&self, req: &Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
        let path = req.uri().path();
        let is_head = req.method() == Method::HEAD;

        let file_path = match self.resolve(path) {
            Some(file_path) => file_path,
            None => {
                warn!("Refused static path {}", path);
                return Ok(ResponseBuilder::not_found(path));
            }
        };

        let metadata = match tokio::fs::metadata(&file_path).await {
            Ok(metadata) => metadata,
            Err(_) => return Ok(ResponseBuilder::not_found(path)),
        };

        if metadata.is_dir() {
            if !path.ends_with('/') {
                let location = match req.uri().query() {
                    Some(query) => format!("{}/?{}", path, query),
                    None => format!("{}/", path),
                };
                return Ok(ResponseBuilder::moved_permanently(&location));
            }
            let index = file_path.join(INDEX_FILE);
            if index.is_file() {
                return self.serve_file(&index, is_head).await;
            }
            return self.directory_listing(&file_path, path, is_head).await;
        }

        self.serve_file(&file_path, is_head).await
    }

    async fn serve_file(&self, file_path: &Path, is_head: bool) -> Result<Response<ProxyBody>, ProxyError> {
        let file = tokio::fs::File::open(file_path).await?;
        let metadata = file.metadata().await?;
        let len = metadata.len();

        let body = if is_head {
            empty_body()
        } else {
            StreamingFileBody::new(file, len)
                .map_err(|e| -> crate::common::BoxError { Box::new(e) })
                .boxed()
        };

        let mut response = Response::new(body);
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, header_value(&guess_mime_type(file_path))?);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("public, max-age=3600"));
        if let Ok(modified) = metadata.modified() {
            headers.insert(LAST_MODIFIED, header_value(&httpdate::fmt_http_date(modified))?);
        }
        debug!("Serving {} ({} bytes)", file_path.display(), len);
        Ok(response)
    }

    async fn directory_listing(
        &self,
        dir_path: &Path,
        request_path: &str,
        is_head: bool,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let dir_path = dir_path.to_path_buf();
        let request_path = request_path.to_string();
        let at_root = request_path == self.prefix;

        let html = tokio::task::spawn_blocking(move || -> Result<String, ProxyError> {
            let mut entries: Vec<(String, bool)> = fs::read_dir(&dir_path)?
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| {
                    let is_dir = entry.file_type().ok()?.is_dir();
                    Some((entry.file_name().to_string_lossy().into_owned(), is_dir))
                })
                .collect();
            entries.sort();

            let mut html = HTML_DIR_LISTING_HEADER.replace("{path}", &escape_html(&request_path));
            html.push('\n');
            if !at_root {
                html.push_str(HTML_DIR_PARENT_LINK);
                html.push('\n');
            }
            for (name, is_dir) in entries {
                let encoded = utf8_percent_encode(&name, PATH_SEGMENT).to_string();
                let (href, label) = if is_dir {
                    (format!("{}/", encoded), format!("{}/", name))
                } else {
                    (encoded, name)
                };
                let entry_html = HTML_DIR_ENTRY_TEMPLATE
                    .replace("{class}", if is_dir { "directory" } else { "file" })
                    .replace("{href}", &escape_html(&href))
                    .replace("{name}", &escape_html(&label));
                html.push_str(&entry_html);
                html.push('\n');
            }
            html.push_str(HTML_DIR_LISTING_FOOTER);
            Ok(html)
        })
        .await
        .map_err(|e| ProxyError::Io(std::io::Error::other(e)))??;

        let len = html.len();
        let mut response = Response::new(if is_head { empty_body() } else { full_body(html) });
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        response.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(len));
        Ok(response)
    }
}

#[async_trait]
impl Handler for StaticFileHandler {
    async fn handle(&self, req: Request<ProxyBody>) -> Response<ProxyBody> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            let mut response = ResponseBuilder::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
            response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }
        match self.serve(&req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Static file error for {}: {}", req.uri().path(), e);
                ResponseBuilder::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProxyError> {
    HeaderValue::from_str(value).map_err(|e| ProxyError::Http(e.to_string()))
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Content type for `file_path`, with a charset for textual types.
pub fn guess_mime_type(file_path: &Path) -> String {
    let mime = mime_guess::from_path(file_path).first_or_octet_stream();
    let mime_str = mime.as_ref();
    if mime_str.starts_with("text/") || mime_str == "application/json" || mime_str == "application/xml" {
        format!("{}; charset=utf-8", mime_str)
    } else {
        mime_str.to_string()
    }
}
