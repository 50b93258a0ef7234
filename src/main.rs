use clap::Parser;
use log::{error, info};
use pingora::prelude::*;
use pingora::server::configuration::Opt;
use pingora_anomaly::*;
use pingora_proxy::http_proxy_service;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/engine.yaml")]
    config: String,

    /// Upstream backend host
    #[arg(short = 'u', long)]
    upstream_host: Option<String>,

    /// Upstream backend port
    #[arg(short = 'p', long)]
    upstream_port: Option<u16>,

    /// Proxy listening address
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen_addr: String,

    /// Proxy listening port
    #[arg(short = 'P', long, default_value = "6188")]
    listen_port: u16,

    /// Metrics port
    #[arg(short = 'm', long, default_value = "6190")]
    metrics_port: u16,

    /// Seconds between sweeps of expired IP state
    #[arg(long, default_value = "300")]
    purge_interval: u64,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    info!("Starting Pingora anomaly engine...");
    info!("Loading configuration from: {}", args.config);

    let config = EngineConfig::from_file(&args.config).unwrap_or_else(|e| {
        error!("Failed to load configuration from {}: {}", args.config, e);
        error!("Using default configuration");
        EngineConfig::default()
    });

    let engine = match DecisionEngine::new(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("Invalid engine configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Engine ready: {} stages, tracking up to {} IPs",
        engine.stage_names().len(),
        engine.store().capacity()
    );

    let metrics = Arc::new(MetricsCollector::new());

    let upstream_host = args
        .upstream_host
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let upstream_port = args.upstream_port.unwrap_or(8080);

    info!("Upstream backend: {}:{}", upstream_host, upstream_port);

    let proxy = AnomalyProxy::new(
        (upstream_host.clone(), upstream_port),
        engine.clone(),
        metrics.clone(),
    );

    let mut server = match Server::new(Some(Opt::default())) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create server: {}", e);
            std::process::exit(1);
        }
    };
    server.bootstrap();

    let mut proxy_service = http_proxy_service(&server.configuration, proxy);
    let listen_address = format!("{}:{}", args.listen_addr, args.listen_port);
    proxy_service.add_tcp(&listen_address);
    server.add_service(proxy_service);

    // Add built-in Prometheus metrics service
    let metrics_address = format!("{}:{}", args.listen_addr, args.metrics_port);
    let mut prometheus_service_http =
        pingora::services::listening::Service::prometheus_http_service();
    prometheus_service_http.add_tcp(&metrics_address);
    server.add_service(prometheus_service_http);

    // Periodic cleanup task
    let purge_interval = std::time::Duration::from_secs(args.purge_interval.max(1));
    let store = engine.store().clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(purge_interval);
        let purged = store.purge_expired(wall_clock_secs());
        metrics.set_tracked_ips(store.len());
        info!("Purged {} expired IP entries, {} tracked", purged, store.len());
    });

    info!("Anomaly proxy:  http://{}", listen_address);
    info!("Metrics:        http://{}/metrics", metrics_address);
    info!("Upstream:       {}:{}", upstream_host, upstream_port);
    info!("Config:         {}", args.config);

    server.run_forever();
}
