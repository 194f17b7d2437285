//! Character Device Bridge CLI
//!
//! Opens the character devices listed in a configuration file and connects
//! one of them to this process's stdin and stdout.

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio::signal;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chardev_core::config::{BridgeConfig, LoggingConfig};
use chardev_core::tls::TlsObjects;
use chardev_core::{CharBackend, ChardevEvent, ChardevMetrics, ChardevRegistry, FrontEnd};

/// Room advertised to the device per delivery.
const STDOUT_CHUNK: usize = 4096;

/// Bridge stdin/stdout to a character device.
#[derive(Parser)]
#[command(name = "chardev-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, default_value = "chardev.yaml")]
    config: String,

    /// Device to attach stdin/stdout to (defaults to the first one).
    #[arg(short, long)]
    attach: Option<String>,

    /// Extra device in option-string form, e.g. `socket,id=s,path=/tmp/s,server=on`.
    #[arg(long = "chardev")]
    chardevs: Vec<String>,

    /// Emit JSON logs regardless of the config file.
    #[arg(long)]
    json: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config))?;
    config.chardevs.extend(args.chardevs.iter().cloned());
    config.validate()?;

    // Override log level from verbosity flag
    let mut log_config = match args.verbose {
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
    log_config.json |= args.json;
    setup_tracing(&log_config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        devices = config.chardevs.len(),
        "starting chardev bridge"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move { run_bridge(config, args.attach).await })
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

    // Logs go to stderr; stdout carries device data.
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

/// Writes device output to stdout.
struct StdoutFrontEnd;

impl FrontEnd for StdoutFrontEnd {
    fn can_receive(&self) -> usize {
        STDOUT_CHUNK
    }

    fn receive(&self, buf: &[u8]) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = out.write_all(buf).and_then(|()| out.flush()) {
            warn!(error = %e, "failed to write to stdout");
        }
    }

    fn event(&self, event: ChardevEvent) {
        debug!(?event, "device event");
    }

    fn backend_changed(&self) {
        info!("device reconfigured");
    }
}

async fn run_bridge(config: BridgeConfig, attach: Option<String>) -> anyhow::Result<()> {
    let metrics = Arc::new(ChardevMetrics::new());
    let tls = TlsObjects::from_config(&config)?;
    let registry = Arc::new(ChardevRegistry::new(
        tls,
        Arc::clone(&metrics),
        tokio::runtime::Handle::current(),
    ));

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_clone = Arc::clone(&metrics);
        let metrics_addr = config.metrics.address.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&metrics_addr, metrics_clone).await {
                tracing::error!(error = %e, "metrics server error");
            }
        });
        info!(address = %config.metrics.address, "metrics server started");
    }

    for options in config.device_options()? {
        let label = options.id.clone();
        if let Err(e) = registry.create(options).await {
            registry.cleanup().await;
            return Err(e).with_context(|| format!("opening chardev '{label}'"));
        }
    }
    registry.machine_done()?;

    let target = match attach.or_else(|| registry.labels().into_iter().next()) {
        Some(label) => label,
        None => {
            warn!("no devices configured");
            shutdown_signal().await;
            return Ok(());
        }
    };
    let chr = registry
        .find(&target)
        .with_context(|| format!("no chardev named '{target}'"))?;
    let mut handle = CharBackend::attach(chr)?;
    handle.set_handlers(Arc::new(StdoutFrontEnd), None)?;
    handle.set_open(true);
    info!(chardev = %target, "attached to stdin/stdout");

    tokio::select! {
        () = shutdown_signal() => info!("shutdown signal received, closing devices"),
        result = pump_stdin(&handle) => {
            if let Err(e) = result {
                warn!(error = %e, "stdin pump stopped");
            }
            info!("stdin closed, waiting for shutdown signal");
            shutdown_signal().await;
        }
    }

    drop(handle);
    registry.cleanup().await;
    info!("bridge shutdown complete");
    Ok(())
}

async fn pump_stdin(handle: &CharBackend) -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; STDOUT_CHUNK];
    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        handle.write(&buf[..n], true).await?;
    }
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
    metrics: Arc<ChardevMetrics>,
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
