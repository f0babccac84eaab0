use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use olla::admission::rate_limiter::RateLimiter;
use olla::admission::size_validator::SizeValidator;
use olla::admission::{AdmissionChain, Validator};
use olla::balancer::RoundRobinSelector;
use olla::breaker::CircuitBreakerRegistry;
use olla::config::Config;
use olla::discovery::StaticDiscovery;
use olla::dispatch::RequestDispatcher;
use olla::events::EventBus;
use olla::pool::EndpointPoolRegistry;
use olla::stats::{StatsAggregator, StatsConfig as StatsRuntimeConfig};
use olla::streaming::StreamingConfig;
use olla::web::{self, AppState};

#[derive(Parser)]
#[command(name = "olla")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A reverse proxy purpose-built to front a pool of AI inference backends")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Proxy path prefix stripped before target-URL composition
    #[arg(long, value_name = "PREFIX")]
    proxy_prefix: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("olla={},tower_http=info", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting Olla v{}", env!("CARGO_PKG_VERSION"));

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!(config = %cli.config, "configuration loaded");

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(prefix) = cli.proxy_prefix {
        config.server.proxy_prefix = prefix;
    }

    if config.endpoints.is_empty() {
        tracing::warn!("no endpoints configured; every request will fail with NoHealthyEndpoints");
    }

    let discovery: olla::discovery::SharedDiscovery =
        Arc::new(StaticDiscovery::new(&config.endpoints).map_err(|err| {
            olla::errors::OllaError::configuration(format!("invalid endpoint url: {err}"))
        })?);

    let selector: olla::balancer::SharedSelector = Arc::new(RoundRobinSelector::default());

    let events = EventBus::default();

    let breakers = Arc::new(CircuitBreakerRegistry::new(
        config.circuit_breaker.threshold,
        config.circuit_breaker.open_timeout,
        events.clone(),
    ));

    let pools = Arc::new(EndpointPoolRegistry::new(
        config.pool.clone(),
        config.network.connection_timeout,
        config.network.keep_alive,
    ));

    let stats = Arc::new(StatsAggregator::new(StatsRuntimeConfig::from(&config.stats)));

    let rate_limiter = RateLimiter::new(config.rate_limit.clone());
    let size_validator = Arc::new(SizeValidator::new(config.size_limit.clone()));

    let admission = AdmissionChain::new(vec![
        rate_limiter.clone() as Arc<dyn Validator>,
        size_validator as Arc<dyn Validator>,
    ]);

    let streaming_config = StreamingConfig {
        buffer_size: config.streaming.stream_buffer_size,
        read_timeout: config.network.read_timeout,
        client_disconnect_bytes_threshold: config.streaming.client_disconnect_bytes_threshold as u64,
        client_disconnect_time_threshold: config.streaming.client_disconnect_time_threshold,
        last_chunk_inline_capacity: config.streaming.last_chunk_inline_capacity,
    };

    let dispatcher = RequestDispatcher::new(
        discovery,
        selector,
        breakers.clone(),
        pools.clone(),
        stats.clone(),
        events,
        config.server.proxy_prefix.clone(),
        streaming_config,
    );

    let state = Arc::new(AppState {
        dispatcher,
        admission,
        rate_limiter: rate_limiter.clone(),
        proxy_prefix: config.server.proxy_prefix.clone(),
        max_body_size: config.size_limit.max_body_size,
    });

    let sweeper_pools = pools.clone();
    let sweeper_breakers = breakers.clone();
    let pool_sweep_interval = config.pool.sweep_interval;
    let pool_idle_threshold = config.pool.idle_threshold;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(pool_sweep_interval);
        loop {
            ticker.tick().await;
            let survivors = sweeper_pools.sweep(pool_idle_threshold);
            sweeper_breakers.sweep(&|endpoint| survivors.iter().any(|s| s == endpoint), pool_idle_threshold);
        }
    });

    let stats_sweeper = stats.clone();
    let stats_sweep_interval = config.stats.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(stats_sweep_interval);
        loop {
            ticker.tick().await;
            stats_sweeper.sweep();
        }
    });

    let rate_limiter_sweeper = rate_limiter.clone().spawn_sweeper();

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|err| olla::errors::OllaError::configuration(format!("invalid listen address: {err}")))?;

    let router = web::build_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    server.await?;

    rate_limiter_sweeper.stop();
    pools.clear();
    info!("olla shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight requests");
}
