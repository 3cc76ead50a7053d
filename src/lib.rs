pub mod backend;
pub mod common;
pub mod config;
pub mod dialer;
pub mod error;
pub mod filter;
pub mod keepalive;
pub mod logging;
pub mod proxy;
pub mod proxy_resolver;
pub mod responder;
pub mod reverse_proxy;
pub mod router;
pub mod splice;
pub mod static_files;
pub mod tls;
pub mod transport;
pub mod version;

pub use config::Config;
pub use error::ProxyError;
pub use proxy::{Listener, ProxyServer, ServerOptions};
