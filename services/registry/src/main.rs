//! `registry-server`: serve an OCI registry over HTTP.

use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use eyre::WrapErr;
use registry::{DEFAULT_BUCKET, RegistryBuilder};
use serde::Deserialize;
use storage::{
    DEFAULT_GC_INTERVAL, DEFAULT_SESSION_TTL, RetryPolicy, StorageConfig, Timeouts,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// OCI distribution registry
#[derive(Debug, Parser)]
#[command(name = "registry-server", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short)]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, overriding the configuration file.
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

/// Server configuration file.
///
/// ```toml
/// bind = "0.0.0.0:5000"
/// bucket = "registry"
/// upload-ttl-secs = 300
/// redirect-downloads = true
///
/// [storage.local]
/// path = "/var/lib/registry"
///
/// [retry]
/// attempts = 3
/// delay-ms = 500
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct ServerConfig {
    bind: SocketAddr,
    bucket: String,
    storage: StorageConfig,
    retry: RetryPolicy,
    timeouts: Timeouts,
    upload_ttl_secs: u64,
    gc_interval_secs: u64,
    redirect_downloads: bool,
    presign_expiry_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            bucket: DEFAULT_BUCKET.to_owned(),
            storage: StorageConfig::Memory {},
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
            upload_ttl_secs: DEFAULT_SESSION_TTL.as_secs(),
            gc_interval_secs: DEFAULT_GC_INTERVAL.as_secs(),
            redirect_downloads: false,
            presign_expiry_secs: registry::DEFAULT_PRESIGN_EXPIRY.as_secs(),
        }
    }
}

impl ServerConfig {
    async fn load(path: Option<&Utf8PathBuf>) -> eyre::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("reading {path}"))?;
        toml_edit::de::from_str(&contents).wrap_err_with(|| format!("parsing {path}"))
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .with(tracing_error::ErrorLayer::default())
        .init();
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = ServerConfig::load(args.config.as_ref()).await?;
    let bind = args.bind.unwrap_or(config.bind);

    let storage = config
        .storage
        .clone()
        .build(&config.bucket)
        .await
        .wrap_err("connecting to storage backend")?
        .with_retry(config.retry)
        .with_timeouts(config.timeouts);
    tracing::info!(driver = storage.name(), bucket = %config.bucket, "storage ready");

    let registry = RegistryBuilder::new()
        .storage(storage)
        .bucket(config.bucket)
        .upload_ttl(Duration::from_secs(config.upload_ttl_secs))
        .gc_interval(Duration::from_secs(config.gc_interval_secs))
        .redirect_downloads(config.redirect_downloads)
        .presign_expiry(Duration::from_secs(config.presign_expiry_secs))
        .finish();

    let gc = registry.spawn_gc();
    let app = registry.router();

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .wrap_err_with(|| format!("binding {bind}"))?;
    tracing::info!("OCI registry listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("serving registry")?;

    gc.shutdown().await;
    tracing::info!("registry stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to install Ctrl+C handler: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!("failed to install SIGTERM handler: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: ServerConfig = toml_edit::de::from_str("").unwrap();
        assert_eq!(config.bind.port(), 5000);
        assert_eq!(config.bucket, "registry");
        assert_eq!(config.upload_ttl_secs, 300);
        assert!(matches!(config.storage, StorageConfig::Memory { .. }));
    }

    #[test]
    fn config_file() {
        let config: ServerConfig = toml_edit::de::from_str(
            r#"
            bind = "127.0.0.1:8080"
            bucket = "images"
            redirect-downloads = true

            [storage.memory]

            [retry]
            attempts = 5
            delay-ms = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.port(), 8080);
        assert!(config.redirect_downloads);
        assert_eq!(config.retry, RetryPolicy::new(5, Duration::from_millis(100)));
    }

    #[tokio::test]
    async fn memory_storage_uses_the_registry_bucket() {
        let config: ServerConfig = toml_edit::de::from_str(r#"bucket = "images""#).unwrap();
        let storage = config.storage.build(&config.bucket).await.unwrap();

        let app = RegistryBuilder::new()
            .storage(storage)
            .bucket(config.bucket)
            .build();
        let data = b"AAAA";
        let digest = registry::Digest::compute(data);
        let response = tower::ServiceExt::oneshot(
            app,
            axum::http::Request::builder()
                .method("POST")
                .uri(format!("/v2/app/blobs/uploads/?digest={digest}"))
                .body(axum::body::Body::from(bytes::Bytes::from_static(data)))
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::CREATED);
    }

    #[test]
    fn args_parse() {
        let args = Args::parse_from(["registry-server", "--config", "registry.toml", "--log-json"]);
        assert_eq!(args.config.as_deref(), Some(camino::Utf8Path::new("registry.toml")));
        assert!(args.log_json);
        assert!(args.bind.is_none());
    }
}
