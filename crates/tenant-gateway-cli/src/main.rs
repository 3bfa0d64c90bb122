//! Tenant Gateway CLI
//!
//! Accepts device connections over TCP and TLS, resolves each connection's
//! tenant and relays device data to the backend.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tenant_gateway_core::config::{GatewayConfig, LoggingConfig};
use tenant_gateway_core::metrics::GatewayMetrics;
use tenant_gateway_core::network::{GatewayListener, GatewayServices};
use tenant_gateway_core::tls::TlsServerAcceptor;

/// Multi-tenant device gateway.
#[derive(Parser)]
#[command(name = "tenant-gateway")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Override the plain TCP listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Override the TLS listen address (requires a `listen.tls` section).
    #[arg(long)]
    secure_listen: Option<String>,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::from_file(&args.config)?;

    if let Some(listen) = args.listen {
        config.listen.address = listen;
    }
    if let Some(secure_listen) = args.secure_listen {
        match config.listen.tls.as_mut() {
            Some(tls) => tls.address = secure_listen,
            None => anyhow::bail!("--secure-listen needs a listen.tls section in {}", args.config),
        }
    }

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

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen.address,
        secure_listen = config.listen.tls.as_ref().map(|tls| tls.address.as_str()),
        tenants = config.tenants.len(),
        backend = %config.backend.endpoint,
        "starting tenant gateway"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_gateway(config).await })
}

fn setup_tracing(config: &LoggingConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
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

async fn run_gateway(config: GatewayConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(GatewayMetrics::new());
    let services = Arc::new(GatewayServices::from_config(&config)?.with_metrics(Arc::clone(&metrics)));

    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    let mut listeners = vec![
        GatewayListener::bind(
            &config.listen.address,
            None,
            Arc::clone(&services),
            config.listen.max_connections,
        )
        .await?,
    ];
    if let Some(tls) = &config.listen.tls {
        let acceptor = TlsServerAcceptor::new(tls)?;
        listeners.push(
            GatewayListener::bind(
                &tls.address,
                Some(acceptor),
                Arc::clone(&services),
                config.listen.max_connections,
            )
            .await?,
        );
    }

    let shutdown_handles: Vec<_> = listeners.iter().map(GatewayListener::shutdown_handle).collect();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping gateway");
        for handle in shutdown_handles {
            let _ = handle.send(());
        }
    });

    let tasks: Vec<_> = listeners
        .into_iter()
        .map(|listener| tokio::spawn(async move { listener.run().await }))
        .collect();
    for task in tasks {
        task.await?;
    }

    info!("gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

async fn start_metrics_server(
    addr: &str,
    metrics: Arc<GatewayMetrics>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(address = %addr, "metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = Arc::clone(&metrics);

        tokio::spawn(async move {
            let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                let metrics = Arc::clone(&metrics);
                async move {
                    let body = metrics.encode().unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "metrics connection error");
            }
        });
    }
}
