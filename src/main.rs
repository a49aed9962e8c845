//! valdns server binary.
//!
//! Wires configuration, the store, and every data-plane component
//! together explicitly, seeds the store, and serves DNS until SIGINT.
//!
//! ```bash
//! # Run with defaults (store on localhost, listen on :53)
//! valdns
//!
//! # Run with a configuration file and environment overrides
//! valdns -c /etc/valdns/config.json
//! VALDNS_DNS_PORT=:5353 VALDNS_DEVELOPMENT=true valdns
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use valdns::allowlist::AllowedLans;
use valdns::cache::{self, ResponseCache};
use valdns::config::{parse_listen_addr, Config};
use valdns::health::{HealthCheck, HealthCheckService};
use valdns::lb::LoadBalancer;
use valdns::metrics::Metrics;
use valdns::probes::{self, ProbeState};
use valdns::querylog::{self, QueryLogService};
use valdns::seed::Seeder;
use valdns::server::{rate_limit, DnsHandler, DnsServer, HandlerParts, RateLimiter};
use valdns::store::{KeyValueStore, ValkeyStore};
use valdns::upstream::UpstreamForwarder;
use valdns::zone::{RecordType, ZoneRepository};

/// Time allowed for in-flight queries and background tasks to drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

struct Args {
    config_path: Option<PathBuf>,
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut config_path = None;
        let mut check_config = false;

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    config_path = args.next().map(PathBuf::from);
                }
                "--check" => check_config = true,
                "-v" | "--version" => {
                    println!("valdns v{}", valdns::VERSION);
                    std::process::exit(0);
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"valdns v{}

Authoritative and forwarding DNS server backed by a Valkey-compatible store.

USAGE:
    valdns [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file (JSON)
        --check            Validate the configuration and exit
    -v, --version          Print version
    -h, --help             Print this help

Environment overrides use the VALDNS_ prefix, e.g. VALDNS_DNS_PORT=:5353."#,
        valdns::VERSION
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config =
        Config::load_with_env(args.config_path.as_deref()).context("configuration invalid")?;

    if args.check_config {
        println!("configuration OK");
        return Ok(());
    }

    info!(version = valdns::VERSION, "starting valdns");

    // Store first: seeding cannot proceed without it.
    let store: Arc<dyn KeyValueStore> = Arc::new(
        ValkeyStore::connect(&config.valkey)
            .await
            .context("cannot connect to valkey")?,
    );
    store.ping().await.context("valkey did not answer ping")?;

    let metrics = Metrics::new();
    if config.metrics.enabled {
        let addr = parse_listen_addr(&config.metrics.port)?;
        Metrics::install_exporter(addr).context("cannot start metrics exporter")?;
    }

    // Data-plane components, wired explicitly.
    let repository = ZoneRepository::new(Arc::clone(&store));
    let allowed_lans = Arc::new(AllowedLans::new(Arc::clone(&store)));
    let upstream = Arc::new(UpstreamForwarder::new(
        Arc::clone(&store),
        config.dns.upstream.timeout(),
    ));

    let cache = Arc::new(if config.dns.cache.enabled {
        ResponseCache::new(config.dns.cache.size, config.dns.cache.ttl())
    } else {
        ResponseCache::disabled()
    });

    let rate_limiter = Arc::new(if config.dns.rate_limit.enabled {
        RateLimiter::new(
            config.dns.rate_limit.queries_per_sec,
            config.dns.rate_limit.burst,
        )
    } else {
        RateLimiter::disabled()
    });

    let query_log = Arc::new(QueryLogService::new(
        Arc::clone(&store),
        config.dns.query_log.buffer_size,
    ));
    query_log.set_enabled(config.dns.query_log.enabled);
    query_log.restore_counters().await;

    let health = Arc::new(HealthCheckService::new(metrics.clone()));

    let load_balancer = if config.dns.load_balancer.enabled {
        let strategy = config.dns.load_balancer.parsed_strategy()?;
        let lb = if config.dns.health_check.enabled {
            LoadBalancer::new(strategy).with_health(Arc::clone(&health))
        } else {
            LoadBalancer::new(strategy)
        };
        Some(Arc::new(lb))
    } else {
        None
    };

    // Seed configuration (and sample zones in development) before the
    // listeners come up; a store failure here is fatal.
    let seeder = Seeder::new(
        Arc::clone(&allowed_lans),
        Arc::clone(&upstream),
        repository.clone(),
    );
    seeder
        .seed(&config.dns.upstream.server, config.development)
        .await
        .context("store seeding failed")?;

    // Active health probing for every address backend in the store.
    if config.dns.health_check.enabled {
        register_backend_checks(&repository, &health, &config).await;
    }

    let handler = Arc::new(DnsHandler::new(HandlerParts {
        repository,
        allowed_lans,
        upstream,
        cache: Arc::clone(&cache),
        rate_limiter: Arc::clone(&rate_limiter),
        query_log: Arc::clone(&query_log),
        metrics,
        load_balancer,
        enable_allowed_lans_check: config.dns.enable_allowed_lans_check,
    }));

    // Probe endpoints; readiness flips once the listeners are bound.
    let probe_state = ProbeState::new();
    probes::start(
        parse_listen_addr(&config.dns.probes.liveness_port)?,
        parse_listen_addr(&config.dns.probes.readiness_port)?,
        Arc::clone(&probe_state),
    )
    .await
    .context("cannot start probe servers")?;

    // Background tasks share one stop signal.
    let (stop_tx, stop_rx) = watch::channel(false);
    let background = vec![
        cache::spawn_maintenance(Arc::clone(&cache), stop_rx.clone()),
        rate_limit::spawn_cleanup(Arc::clone(&rate_limiter), stop_rx.clone()),
        querylog::spawn_flush(
            Arc::clone(&query_log),
            config.dns.query_log.flush_interval(),
            stop_rx.clone(),
        ),
        querylog::spawn_stats_persistence(Arc::clone(&query_log), stop_rx.clone()),
    ];

    let listen_addr = config.listen_addr()?;
    let server = DnsServer::bind(listen_addr, handler, Arc::clone(&probe_state))
        .await
        .context("cannot bind DNS listeners")?;

    tokio::select! {
        result = server.run(stop_rx) => {
            result.context("DNS server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    // Cooperative shutdown: stop accepting, then drain.
    probe_state.set_ready(false);
    health.stop();
    let _ = stop_tx.send(true);

    let drain = async {
        for task in background {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        warn!("background tasks did not drain in time");
    }

    query_log.flush();
    query_log.persist_counters().await;
    info!("shutdown complete");
    Ok(())
}

/// Register a TCP health check for every A/AAAA backend currently in the
/// store, keyed by address so the load balancer can look verdicts up.
async fn register_backend_checks(
    repository: &ZoneRepository,
    health: &HealthCheckService,
    config: &Config,
) {
    let domains = match repository.list_zones().await {
        Ok(domains) => domains,
        Err(err) => {
            warn!(error = %err, "cannot list zones for health checks");
            return;
        }
    };

    for domain in domains {
        let zone = match repository.get_zone(&domain).await {
            Ok(zone) => zone,
            Err(err) => {
                warn!(zone = %domain, error = %err, "cannot load zone for health checks");
                continue;
            }
        };

        for record in &zone.records {
            if record.disabled || !matches!(record.rtype, RecordType::A | RecordType::Aaaa) {
                continue;
            }
            let Some(address) = record.value() else {
                continue;
            };
            health.add_check(
                address,
                HealthCheck::tcp(
                    address,
                    80,
                    config.dns.health_check.interval(),
                    config.dns.health_check.timeout(),
                ),
            );
        }
    }
}
