//! Kafka Relay CLI
//!
//! A transparent, TLS-capable reverse proxy for Kafka. Every broker gets a
//! relay listener; discovery responses are rewritten so clients only ever
//! connect back through the relay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kafka_relay_core::config::{LoggingConfig, RelayConfig};
use kafka_relay_core::metrics::ProxyMetrics;
use kafka_relay_core::network::ListenerManager;
use kafka_relay_core::SharedRegistry;

/// Transparent Kafka reverse proxy.
#[derive(Parser)]
#[command(name = "kafka-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "KAFKA_RELAY_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Validate the configuration and TLS material, then exit.
    #[arg(long)]
    check: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = RelayConfig::from_file(&args.config)?;

    // Override log level from verbosity flag
    let log_config = match args.verbose {
        0 => config.logging.clone(),
        1 => LoggingConfig {
            level: "debug".to_string(),
            ..config.logging.clone()
        },
        _ => LoggingConfig {
            level: "trace".to_string(),
            ..config.logging.clone()
        },
    };
    setup_tracing(&log_config);

    if args.check {
        let registry = SharedRegistry::new(config.build_registry()?);
        ListenerManager::new(&config, registry, Arc::new(ProxyMetrics::new()))?;
        info!(
            config = %args.config.display(),
            brokers = config.brokers.len(),
            "configuration is valid"
        );
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        brokers = config.brokers.len(),
        client_tls = config.client_tls.is_some(),
        broker_tls = config.broker_tls.is_some(),
        "starting kafka relay"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_relay(config, args.config))
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

async fn run_relay(config: RelayConfig, config_path: PathBuf) -> anyhow::Result<()> {
    let metrics = Arc::new(ProxyMetrics::new());
    let registry = SharedRegistry::new(config.build_registry()?);
    let manager = Arc::new(ListenerManager::new(&config, registry, Arc::clone(&metrics))?);

    // Bind before anything else so a taken port fails startup.
    manager.bind().await?;
    let shutdown = manager.shutdown_handle();

    if config.metrics.enabled {
        let metrics_addr = config.metrics.address.clone();
        let metrics = Arc::clone(&metrics);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics, shutdown).await {
                error!(error = %e, "metrics server error");
            }
        });
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received, stopping relay");
            shutdown.cancel();
        }
    });

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(
        Arc::clone(&manager),
        config_path,
        shutdown.clone(),
    ));
    #[cfg(not(unix))]
    let _ = config_path;

    manager.run().await?;

    info!("relay shutdown complete");
    Ok(())
}

/// Re-read the configuration on every SIGHUP and swap the broker registry.
#[cfg(unix)]
async fn reload_on_hangup(manager: Arc<ListenerManager>, path: PathBuf, shutdown: CancellationToken) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGHUP, config reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                info!(config = %path.display(), "SIGHUP received, reloading configuration");
                if let Err(e) = reload(&manager, &path) {
                    error!(error = %e, "configuration reload rejected, keeping current registry");
                }
            }
        }
    }
}

#[cfg(unix)]
fn reload(manager: &ListenerManager, path: &Path) -> anyhow::Result<()> {
    let config = RelayConfig::from_file(path)?;
    manager.reload(&config)?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Pause after a failed `accept` on the metrics listener.
const METRICS_ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<ProxyMetrics>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");
    serve_metrics(listener, metrics, shutdown).await;
    Ok(())
}

/// Serve `/metrics` until shutdown. Accept errors, such as running out of
/// descriptors, are logged and retried.
async fn serve_metrics(listener: TcpListener, metrics: Arc<ProxyMetrics>, shutdown: CancellationToken) {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;

    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, "metrics accept failed, backing off");
                tokio::time::sleep(METRICS_ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    if req.uri().path() != "/metrics" {
                        let mut response = Response::new(Full::new(Bytes::from_static(b"not found\n")));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        return Ok::<_, hyper::Error>(response);
                    }
                    let body = metrics.encode().unwrap_or_default();
                    Ok(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}
