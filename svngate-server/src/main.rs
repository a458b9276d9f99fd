//! svngate server binary.
//!
//! Presents a changeset-based upstream through the SVN WebDAV dialect. The
//! process-wide collaborators (upstream handle, metadata cache, activity
//! registry) are constructed here and threaded through as explicit values.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use svngate_core::{CasePolicy, Credentials, LoaderLimits, MemorySource, SourceRepository};
use svngate_webdav::{BridgeHandler, Config, GatewayState};

/// svngate gateway configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct GatewayConfig {
    /// Listen address.
    listen_addr: String,
    /// URL prefix the gateway is mounted under.
    url_prefix: String,
    /// Optional log file; stderr when unset.
    log_path: Option<String>,
    /// Path comparison case sensitivity.
    case_sensitive: bool,
    upstream: UpstreamConfig,
    loader: LoaderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct UpstreamConfig {
    /// Upstream server URL. `memory:` runs the built-in in-process backend.
    url: String,
    /// Credential triple used for anonymous read access.
    username: String,
    password: String,
    domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoaderConfig {
    max_in_flight_requests: usize,
    max_buffered_megabytes: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            url_prefix: "/svn".to_string(),
            log_path: None,
            case_sensitive: false,
            upstream: UpstreamConfig::default(),
            loader: LoaderConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "memory:".to_string(),
            username: "anonymous".to_string(),
            password: String::new(),
            domain: String::new(),
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let defaults = LoaderLimits::default();
        Self {
            max_in_flight_requests: defaults.max_in_flight,
            max_buffered_megabytes: defaults.max_buffered_bytes / (1024 * 1024),
        }
    }
}

impl GatewayConfig {
    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {path:?}"))?;
        toml::from_str(&text).with_context(|| "failed to parse config TOML")
    }

    fn to_file(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(name = "svngate")]
#[command(about = "SVN-dialect gateway for changeset-based upstream servers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway
    Start {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        addr: Option<String>,

        /// Configuration file (TOML)
        #[arg(short = 'c', long, default_value = "svngate.toml")]
        config: String,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Write a default configuration file
    #[command(name = "init-config")]
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "svngate.toml")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { addr, config, debug } => {
            let config_path = Path::new(&config);
            let file_config = if config_path.exists() {
                GatewayConfig::from_file(config_path)?
            } else {
                GatewayConfig::default()
            };
            init_tracing(&file_config, debug)?;
            serve(file_config, addr, debug).await
        }

        Commands::InitConfig { output } => {
            GatewayConfig::default().to_file(Path::new(&output))?;
            println!("Configuration file created: {output}");
            println!();
            println!("Edit the file to point at your upstream, then start the gateway:");
            println!("  svngate start --config {output}");
            Ok(())
        }
    }
}

fn init_tracing(config: &GatewayConfig, debug: bool) -> Result<()> {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };

    match &config.log_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Arc::new(file))
                        .with_ansi(false),
                )
                .with(env_filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer())
                .with(env_filter)
                .init();
        }
    }
    Ok(())
}

async fn serve(config: GatewayConfig, addr_override: Option<String>, debug: bool) -> Result<()> {
    let source = build_upstream(&config)?;
    let creds = Credentials::new(
        config.upstream.username.clone(),
        config.upstream.password.clone(),
        config.upstream.domain.clone(),
    );
    let policy = if config.case_sensitive {
        CasePolicy::Sensitive
    } else {
        CasePolicy::Insensitive
    };
    let limits = LoaderLimits {
        max_in_flight: config.loader.max_in_flight_requests,
        max_buffered_bytes: config.loader.max_buffered_megabytes * 1024 * 1024,
        ..LoaderLimits::default()
    };

    let state = Arc::new(GatewayState::new(
        Config {
            url_prefix: config.url_prefix.clone(),
            debug,
            ..Config::default()
        },
        source,
        creds,
        policy,
        limits,
    ));
    let handler = Arc::new(BridgeHandler::new(state));

    let addr: SocketAddr = addr_override
        .unwrap_or(config.listen_addr)
        .parse()
        .map_err(|e| anyhow!("invalid listen address: {e}"))?;
    let listener = TcpListener::bind(addr).await?;

    info!("svngate listening on {addr}");
    info!("upstream: {}", config.upstream.url);
    info!("mounted at {}", config.url_prefix);

    loop {
        let (stream, _) = listener.accept().await?;
        let handler = handler.clone();
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(
                    io,
                    service_fn(move |req| handle_request(req, handler.clone())),
                )
                .await
            {
                error!("error serving connection: {e:?}");
            }
        });
    }
}

fn build_upstream(config: &GatewayConfig) -> Result<Arc<dyn SourceRepository>> {
    match config.upstream.url.as_str() {
        "memory:" => Ok(Arc::new(MemorySource::new())),
        other => Err(anyhow!(
            "no upstream client available for {other:?}; this build supports the in-process backend only"
        )),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    handler: Arc<BridgeHandler>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = match handler.handle(req).await {
        Ok(resp) => resp,
        Err(e) => {
            error!(%method, %uri, "request error: {e}");
            svngate_webdav::error_response(&e)
        }
    };

    info!("{} {} -> {}", method, uri.path(), response.status());
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svngate.toml");

        let mut config = GatewayConfig::default();
        config.case_sensitive = true;
        config.loader.max_in_flight_requests = 5;
        config.to_file(&path).unwrap();

        let loaded = GatewayConfig::from_file(&path).unwrap();
        assert!(loaded.case_sensitive);
        assert_eq!(loaded.loader.max_in_flight_requests, 5);
        assert_eq!(loaded.url_prefix, "/svn");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svngate.toml");
        std::fs::write(&path, "listen_addr = \"127.0.0.1:9000\"\n").unwrap();

        let loaded = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(loaded.listen_addr, "127.0.0.1:9000");
        assert_eq!(loaded.upstream.url, "memory:");
        assert!(!loaded.case_sensitive);
    }

    #[test]
    fn test_unknown_upstream_is_rejected() {
        let mut config = GatewayConfig::default();
        config.upstream.url = "https://example.invalid/tfs".to_string();
        assert!(build_upstream(&config).is_err());
    }
}
