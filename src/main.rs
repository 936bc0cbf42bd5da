use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, ValueEnum};
use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use rustls::crypto::{ring, CryptoProvider};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jsmpeg_relay::config::{AppConfig, ConfigStore, WebConfig};
use jsmpeg_relay::events::{EventBus, SystemEvent};
use jsmpeg_relay::state::AppState;
use jsmpeg_relay::stream::{FfmpegLauncher, SessionRegistry};
use jsmpeg_relay::utils::{bind_camera_listener, bind_tcp_listener};
use jsmpeg_relay::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// jsmpeg-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "jsmpeg-relay")]
#[command(version, about = "Lazy ffmpeg to WebSocket relay for JSMpeg players", long_about = None)]
struct CliArgs {
    /// Configuration file (default: /etc/jsmpeg-relay/config.json)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Enable HTTPS (overrides config file)
    #[arg(long)]
    enable_https: bool,

    /// Path to SSL certificate file (generates self-signed if not provided)
    #[arg(long, value_name = "FILE", requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,

    /// Path to SSL private key file
    #[arg(long, value_name = "FILE", requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,

    /// Transcoder binary (overrides config file)
    #[arg(long, value_name = "PATH")]
    ffmpeg_path: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

type ServerFuture = BoxFuture<'static, (String, std::io::Result<()>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    // Install default crypto provider (required by rustls 0.23+)
    CryptoProvider::install_default(ring::default_provider())
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing::info!("Starting jsmpeg-relay v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().unwrap_or_else(get_config_path);
    tracing::info!("Configuration file: {}", config_path.display());

    let config_store = ConfigStore::new(&config_path).await?;
    let mut config = (*config_store.get()).clone();
    apply_cli_overrides(&mut config, &args);

    if config.cameras.is_empty() {
        tracing::warn!("No cameras configured in {}", config_path.display());
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(SessionRegistry::new(
        config.stream.clone(),
        Arc::new(FfmpegLauncher),
        events.clone(),
    ));
    let state = AppState::new(config_store, registry, events.clone(), shutdown_tx.clone());

    let tls_config = if config.web.https_enabled {
        let cert_dir = config_path
            .parent()
            .map(|dir| dir.join("certs"))
            .unwrap_or_else(|| PathBuf::from("certs"));
        Some(load_tls_config(&config.web, &cert_dir).await?)
    } else {
        None
    };
    let scheme = if tls_config.is_some() { "https" } else { "http" };

    let bind_ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", config.web.bind_address))?;

    let servers: FuturesUnordered<ServerFuture> = FuturesUnordered::new();

    // API and /stream/:name
    let addr = SocketAddr::new(bind_ip, config.web.http_port);
    let listener = bind_tcp_listener(addr)
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
    tracing::info!("Server listening on {}://{}", scheme, addr);
    servers.push(serve(
        "api".to_string(),
        listener,
        web::create_router(state.clone()),
        tls_config.clone(),
    )?);

    // Dedicated per-camera ports; a failure only affects that camera
    for camera in &config.cameras {
        let Some(port) = camera.ws_port else {
            continue;
        };
        let addr = SocketAddr::new(bind_ip, port);
        match bind_camera_listener(&camera.name, addr) {
            Ok(listener) => {
                tracing::info!(camera = %camera.name, "Awaiting WebSocket connections on {}://{}", scheme, addr);
                servers.push(serve(
                    camera.name.clone(),
                    listener,
                    web::create_camera_router(state.clone(), &camera.name),
                    tls_config.clone(),
                )?);
            }
            Err(e) => {
                tracing::error!(camera = %camera.name, "{}", e);
                events.publish(SystemEvent::SystemError {
                    module: "listener".to_string(),
                    severity: "error".to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    let run_servers = async move {
        let mut servers = servers;
        while let Some((name, result)) = servers.next().await {
            match result {
                Ok(()) => tracing::warn!("Listener {} stopped", name),
                Err(e) => tracing::error!("Listener {} failed: {}", name, e),
            }
        }
    };

    tokio::select! {
        _ = shutdown_signal => {}
        _ = run_servers => {
            tracing::error!("All listeners stopped");
        }
    }

    cleanup(&state).await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Serve `app` on `listener`, with TLS when configured
fn serve(
    name: String,
    listener: std::net::TcpListener,
    app: Router,
    tls: Option<RustlsConfig>,
) -> anyhow::Result<ServerFuture> {
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    match tls {
        Some(tls) => {
            let server = axum_server::from_tcp_rustls(listener, tls);
            Ok(Box::pin(async move { (name, server.serve(make_service).await) }))
        }
        None => {
            let listener = tokio::net::TcpListener::from_std(listener)?;
            Ok(Box::pin(async move {
                (name, axum::serve(listener, make_service).await)
            }))
        }
    }
}

/// Apply command line overrides (not persisted)
fn apply_cli_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(addr) = &args.address {
        config.web.bind_address = addr.clone();
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    if args.enable_https {
        config.web.https_enabled = true;
    }
    if let Some(cert_path) = &args.ssl_cert {
        config.web.ssl_cert_path = Some(cert_path.to_string_lossy().to_string());
    }
    if let Some(key_path) = &args.ssl_key {
        config.web.ssl_key_path = Some(key_path.to_string_lossy().to_string());
    }
    if let Some(ffmpeg) = &args.ffmpeg_path {
        config.stream.ffmpeg_path = ffmpeg.clone();
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "jsmpeg_relay=error,tower_http=error",
        LogLevel::Warn => "jsmpeg_relay=warn,tower_http=warn",
        LogLevel::Info => "jsmpeg_relay=info,tower_http=info",
        LogLevel::Verbose => "jsmpeg_relay=debug,tower_http=info",
        LogLevel::Debug => "jsmpeg_relay=debug,tower_http=debug",
        LogLevel::Trace => "jsmpeg_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the configuration file path
fn get_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("JSMPEG_RELAY_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("/etc/jsmpeg-relay/config.json")
}

/// Load configured TLS material, or a self-signed certificate from `cert_dir`
async fn load_tls_config(web: &WebConfig, cert_dir: &Path) -> anyhow::Result<RustlsConfig> {
    if let (Some(cert_path), Some(key_path)) = (&web.ssl_cert_path, &web.ssl_key_path) {
        return Ok(RustlsConfig::from_pem_file(cert_path, key_path).await?);
    }

    let cert_path = cert_dir.join("server.crt");
    let key_path = cert_dir.join("server.key");

    // Only generate if missing
    if !cert_path.exists() || !key_path.exists() {
        tracing::info!("Generating new self-signed TLS certificate");
        let cert = generate_self_signed_cert()?;
        tokio::fs::create_dir_all(cert_dir).await?;
        tokio::fs::write(&cert_path, cert.cert.pem()).await?;
        tokio::fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
    } else {
        tracing::info!("Using existing TLS certificate from {}", cert_dir.display());
    }

    Ok(RustlsConfig::from_pem_file(&cert_path, &key_path).await?)
}

/// Generate a self-signed TLS certificate
fn generate_self_signed_cert() -> anyhow::Result<rcgen::CertifiedKey> {
    let subject_alt_names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];

    Ok(rcgen::generate_simple_self_signed(subject_alt_names)?)
}

/// Stop every session on shutdown
async fn cleanup(state: &Arc<AppState>) {
    state.registry.shutdown_all().await;
    tracing::info!("Sessions stopped");
}
