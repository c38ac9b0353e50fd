//! NAS Storage Manager daemon
//!
//! Opens the storage manager, starts health polling and serves the REST
//! API, the liveness/readiness endpoints and Prometheus metrics until
//! SIGINT or SIGTERM.

use clap::Parser;
use prometheus::{IntGaugeVec, Opts, Registry};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nas_storage_manager::domain::types::GIB;
use nas_storage_manager::scheduler::TaskFilter;
use nas_storage_manager::store;
use nas_storage_manager::{
    ApiServer, ApiServerConfig, DiskProbe, Error, Result, SimulatedBackend,
    SimulatedBackendConfig, SimulatedProbe, StorageConfig, StorageManager, StoreConfig,
    SysfsProbe, SysfsProbeConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// NAS Storage Manager - disks, redundancy groups, pools and volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "STORAGE_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Directory for metadata records (overrides the configured store)
    #[arg(long, env = "STORE_PATH")]
    store_path: Option<PathBuf>,

    /// Keep metadata in memory only
    #[arg(long, env = "MEMORY_STORE", conflicts_with = "store_path")]
    memory_store: bool,

    /// Root of sysfs for disk discovery
    #[arg(long, env = "SYSFS_PATH", default_value = "/sys")]
    sysfs_path: PathBuf,

    /// Use simulated disks instead of sysfs
    #[arg(long, env = "SIMULATED")]
    simulated: bool,

    /// Number of simulated disks
    #[arg(long, env = "SIM_DISKS", default_value = "6")]
    sim_disks: usize,

    /// Size of each simulated disk in GiB
    #[arg(long, env = "SIM_DISK_GIB", default_value = "4096")]
    sim_disk_gib: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting NAS Storage Manager");
    info!("  Version: {}", nas_storage_manager::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Simulated disks: {}", args.simulated);

    let mut config = match &args.config {
        Some(path) => StorageConfig::from_file(path)?,
        None => StorageConfig::default(),
    };
    if args.memory_store {
        config.store = StoreConfig::Memory;
    } else if let Some(path) = &args.store_path {
        config.store = StoreConfig::File {
            path: path.clone(),
            sync_writes: true,
        };
    }

    let probe: Arc<dyn DiskProbe> = if args.simulated {
        Arc::new(SimulatedProbe::with_disks(
            args.sim_disks,
            args.sim_disk_gib * GIB,
        ))
    } else {
        Arc::new(SysfsProbe::new(SysfsProbeConfig {
            sysfs_path: args.sysfs_path.clone(),
            ..SysfsProbeConfig::default()
        }))
    };
    warn!("No device-mapper backend is wired in; storage operations are simulated");
    let backend = Arc::new(SimulatedBackend::new(SimulatedBackendConfig::default()));

    let metadata = store::open(&config.store)?;
    let manager = StorageManager::open(config, backend, probe, metadata).await?;
    if let Err(e) = manager.poll_health().await {
        warn!("Initial disk scan failed: {}", e);
    }
    manager.start_health_monitor();

    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_manager).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    let metrics = Arc::new(StorageMetrics::new()?);
    let metrics_manager = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, metrics, metrics_manager).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: parse_addr(&args.api_addr, "REST API")?,
    };
    let api_server = ApiServer::new(api_config, manager.clone());

    let shutdown = api_server.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown.send(());
    });

    let served = api_server.run().await;

    manager.shutdown().await;
    info!("Storage manager shutdown complete");
    served
}

fn parse_addr(addr: &str, what: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {}: {}", what, addr, e)))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, manager: Arc<StorageManager>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let manager = manager.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let manager = manager.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if manager.is_shut_down() => {
                            text_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down")
                        }
                        "/readyz" => text_response(StatusCode::OK, "ok"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

/// Gauges refreshed from the manager on every scrape
struct StorageMetrics {
    registry: Registry,
    disks: IntGaugeVec,
    groups: IntGaugeVec,
    pools: IntGaugeVec,
    pool_bytes: IntGaugeVec,
    tasks: IntGaugeVec,
}

impl StorageMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();
        let gauge = |name: &str, help: &str, labels: &[&str]| -> Result<IntGaugeVec> {
            let vec = IntGaugeVec::new(Opts::new(name, help), labels)
                .map_err(|e| Error::Internal(format!("Metric {}: {}", name, e)))?;
            registry
                .register(Box::new(vec.clone()))
                .map_err(|e| Error::Internal(format!("Metric {}: {}", name, e)))?;
            Ok(vec)
        };

        Ok(Self {
            disks: gauge("nas_storage_disks", "Disks by health", &["health"])?,
            groups: gauge("nas_storage_groups", "Redundancy groups by state", &["state"])?,
            pools: gauge("nas_storage_pools", "Pools by state", &["state"])?,
            pool_bytes: gauge(
                "nas_storage_pool_bytes",
                "Pool capacity and allocation",
                &["pool", "kind"],
            )?,
            tasks: gauge("nas_storage_tasks", "Tasks by state", &["state"])?,
            registry,
        })
    }

    fn refresh(&self, manager: &StorageManager) {
        self.disks.reset();
        for disk in manager.list_disks() {
            self.disks
                .with_label_values(&[&disk.health.to_string()])
                .inc();
        }

        self.groups.reset();
        for group in manager.list_groups() {
            self.groups
                .with_label_values(&[&group.state.to_string()])
                .inc();
        }

        self.pools.reset();
        self.pool_bytes.reset();
        for pool in manager.list_pools() {
            self.pools.with_label_values(&[&pool.state.to_string()]).inc();
            let id = pool.id.to_string();
            self.pool_bytes
                .with_label_values(&[&id, "total"])
                .set(pool.total_capacity as i64);
            self.pool_bytes
                .with_label_values(&[&id, "allocated"])
                .set(pool.allocated as i64);
            self.pool_bytes
                .with_label_values(&[&id, "reserved"])
                .set(pool.reserved as i64);
        }

        self.tasks.reset();
        for task in manager.list_tasks(&TaskFilter::default()) {
            self.tasks.with_label_values(&[&task.state.to_string()]).inc();
        }
    }

    fn encode(&self) -> std::result::Result<(Vec<u8>, String), prometheus::Error> {
        use prometheus::{Encoder, TextEncoder};

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((buffer, encoder.format_type().to_string()))
    }
}

async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<StorageMetrics>,
    manager: Arc<StorageManager>,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        let manager = manager.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                let manager = manager.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            metrics.refresh(&manager);
                            match metrics.encode() {
                                Ok((buffer, content_type)) => {
                                    let mut response = Response::new(Body::from(buffer));
                                    if let Ok(value) = content_type.parse() {
                                        response.headers_mut().insert("Content-Type", value);
                                    }
                                    response
                                }
                                Err(e) => {
                                    error!("Failed to encode metrics: {}", e);
                                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode failed")
                                }
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
