use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube_upgrade_proxy::config::{normalize_prefix, Config, FilterConfig, ListenerTlsConfig, PemSource};
use kube_upgrade_proxy::logging::{self, CustomLogger};
use kube_upgrade_proxy::version::BuildInfo;
use kube_upgrade_proxy::ProxyServer;
use log::info;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[clap(
    author,
    version,
    about = "Local HTTP(S) proxy in front of a Kubernetes-style API server, with upgrade (exec/attach/port-forward) support"
)]
struct Args {
    #[clap(subcommand)]
    command: Option<Command>,

    #[clap(short, long, env = "PROXY_CONFIG", value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short, long, env = "LISTEN_ADDR", value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8001)")]
    listen: Option<String>,

    #[clap(long, env = "API_PREFIX", value_name = "PREFIX", help = "Prefix to serve the proxied API under")]
    api_prefix: Option<String>,

    #[clap(long, env = "CERT_PATH", value_name = "DIR", help = "Directory holding proxy.crt and proxy.key; enables TLS")]
    cert_path: Option<PathBuf>,

    #[clap(long, env = "KUBE_SERVER", value_name = "URL", help = "Backend API server URL")]
    server: Option<String>,

    #[clap(long, value_name = "FILE", help = "CA bundle for the backend")]
    certificate_authority: Option<PathBuf>,

    #[clap(long, value_name = "FILE", help = "Client certificate for the backend")]
    client_certificate: Option<PathBuf>,

    #[clap(long, value_name = "FILE", help = "Client key for the backend")]
    client_key: Option<PathBuf>,

    #[clap(long, help = "Skip backend certificate verification")]
    insecure_skip_tls_verify: bool,

    #[clap(long, value_name = "NAME", help = "Server name to verify the backend certificate against")]
    tls_server_name: Option<String>,

    #[clap(long, env = "PROXY_URL", value_name = "URL", help = "Forward proxy to tunnel backend connections through")]
    proxy_url: Option<String>,

    #[clap(short = 'w', long, value_name = "DIR", help = "Also serve static files from this directory")]
    www: Option<PathBuf>,

    #[clap(short = 'P', long, value_name = "PREFIX", help = "Prefix to serve static files under")]
    www_prefix: Option<String>,

    #[clap(long, value_name = "REGEXES", help = "Comma-separated regexes of paths to accept")]
    accept_paths: Option<String>,

    #[clap(long, value_name = "REGEXES", help = "Comma-separated regexes of paths to reject")]
    reject_paths: Option<String>,

    #[clap(long, value_name = "REGEXES", help = "Comma-separated regexes of hosts to accept")]
    accept_hosts: Option<String>,

    #[clap(long, value_name = "REGEXES", help = "Comma-separated regexes of HTTP methods to reject")]
    reject_methods: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Keepalive ping period for upgraded connections (0 disables)")]
    ping_period: Option<u64>,

    #[clap(long, env = "LOG_LEVEL", value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, env = "LOG_FORMAT", value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Print build information as JSON
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(Command::Version) = args.command {
        println!("{}", BuildInfo::current().to_json());
        return Ok(());
    }

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)
            .with_context(|| format!("Failed to write sample configuration to {}", config_file))?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    init_logging(&args, &config)?;

    config.validate().context("Invalid configuration")?;
    let server = ProxyServer::from_config(&config).context("Failed to build proxy server")?;
    let listener = ProxyServer::listener_for(&config)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen_addr))?;

    let addr = listener.local_addr()?;
    println!("starting to serve on {}", addr);
    info!("Backend: {}", config.backend.server);

    server
        .serve_with_shutdown(listener, shutdown_signal())
        .await
        .context("Proxy server failed")?;

    info!("Proxy server stopped");
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                anyhow::bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file)?
        }
        None => Config::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?;
    }
    if let Some(prefix) = &args.api_prefix {
        config.api_prefix = normalize_prefix(prefix);
    }
    if let Some(dir) = &args.cert_path {
        config.listener_tls = Some(ListenerTlsConfig::from_cert_dir(dir));
    }

    if let Some(server) = &args.server {
        config.backend.server = server.clone();
    }
    if let Some(path) = &args.certificate_authority {
        config.backend.certificate_authority = Some(PemSource::Path(path.clone()));
    }
    if let Some(path) = &args.client_certificate {
        config.backend.client_certificate = Some(PemSource::Path(path.clone()));
    }
    if let Some(path) = &args.client_key {
        config.backend.client_key = Some(PemSource::Path(path.clone()));
    }
    if args.insecure_skip_tls_verify {
        config.backend.insecure_skip_tls_verify = true;
    }
    if let Some(name) = &args.tls_server_name {
        config.backend.tls_server_name = Some(name.clone());
    }
    if let Some(proxy_url) = &args.proxy_url {
        config.backend.proxy_url = Some(proxy_url.clone());
    }

    if let Some(www) = &args.www {
        config.static_dir = Some(www.clone());
    }
    if let Some(prefix) = &args.www_prefix {
        config.static_prefix = normalize_prefix(prefix);
    }

    let filter_flags = [&args.accept_paths, &args.reject_paths, &args.accept_hosts, &args.reject_methods];
    if filter_flags.iter().any(|flag| flag.is_some()) {
        let filter = config.filter.get_or_insert_with(FilterConfig::default);
        if let Some(patterns) = &args.accept_paths {
            filter.accept_paths = split_patterns(patterns);
        }
        if let Some(patterns) = &args.reject_paths {
            filter.reject_paths = split_patterns(patterns);
        }
        if let Some(patterns) = &args.accept_hosts {
            filter.accept_hosts = split_patterns(patterns);
        }
        if let Some(patterns) = &args.reject_methods {
            filter.reject_methods = split_patterns(patterns);
        }
    }

    if let Some(period) = args.ping_period {
        config.ping_period_secs = period;
    }

    Ok(config)
}

fn split_patterns(patterns: &str) -> Vec<String> {
    patterns
        .split(',')
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty())
        .map(str::to_string)
        .collect()
}

fn init_logging(args: &Args, config: &Config) -> Result<()> {
    match &config.logging {
        Some(logging_config) => {
            let mut logging_config = logging_config.clone();
            if let Some(level) = &args.log_level {
                logging_config.level = Some(logging::parse_log_level(level)?);
            }
            if let Some(format) = &args.log_format {
                logging_config.format = Some(logging::parse_log_format(format)?);
            }
            CustomLogger::init(logging_config).context("Failed to initialize logging")?;
        }
        None => {
            logging::init_fallback(args.log_level.as_deref(), args.log_format.as_deref())
                .context("Failed to initialize logging")?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received interrupt, closing listener"),
        _ = terminate => info!("Received terminate signal, closing listener"),
    }
}

const SAMPLE_CONFIG: &str = r#"{
  "listen_addr": "127.0.0.1:8001",
  "api_prefix": "/",
  "static_prefix": "/static/",
  "backend": {
    "server": "https://127.0.0.1:6443",
    "certificate_authority": { "path": "/etc/kubernetes/pki/ca.crt" },
    "client_certificate": { "path": "/etc/kubernetes/pki/client.crt" },
    "client_key": { "path": "/etc/kubernetes/pki/client.key" },
    "proxy_from_environment": true
  },
  "filter": {
    "accept_paths": ["^.*"],
    "reject_paths": ["^/api/.*/pods/.*/exec", "^/api/.*/pods/.*/attach"],
    "accept_hosts": ["^localhost$", "^127\\.0\\.0\\.1$", "^::1$", "^\\[::1\\]$"],
    "reject_methods": []
  },
  "transport": {
    "connect_timeout_secs": 30,
    "tls_handshake_timeout_secs": 10,
    "pool_idle_timeout_secs": 90,
    "pool_max_idle_per_host": 25,
    "tcp_keepalive": true
  },
  "ping_period_secs": 5,
  "logging": {
    "level": "info",
    "format": "text",
    "targets": [{ "type": "stdout" }]
  }
}"#;

fn generate_sample_config(file_path: &str) -> Result<()> {
    // parsed first so the written file matches the Config schema
    let config: Config = serde_json::from_str(SAMPLE_CONFIG)?;
    config.to_file(file_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube_upgrade_proxy::filter::{strip_port, FilterServer};

    #[test]
    fn test_sample_config_accepts_loopback_hosts() {
        let config: Config = serde_json::from_str(SAMPLE_CONFIG).unwrap();
        config.validate().unwrap();
        let filter = FilterServer::from_config(config.filter.as_ref().unwrap()).unwrap();

        for host in ["localhost:8001", "127.0.0.1:8001", "[::1]:8001", "[::1]"] {
            assert!(filter.accept("GET", "/api/v1/pods", strip_port(host)), "{} was rejected", host);
        }
        assert!(!filter.accept("GET", "/api/v1/pods", strip_port("evil.example.com:8001")));
    }
}
