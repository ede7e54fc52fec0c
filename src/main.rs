// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:       Configuration tree loaded from JSON, plus env overrides
// - clock:        Injectable time source
// - errors:       Shared error taxonomy
// - record:       The canonical market-data record
// - symbol:       Wire <-> canonical symbol normalization
// - metrics:      Process-wide runtime counters
// - parser:       Wire decoders + validation
// - connection:   Connection Manager (one WebSocket session)
// - subscription: Subscription Manager (symbol/type -> stream -> CM)
// - router:       Dataflow Router + mandatory sinks
// - cache:        Stream Cache
// - exchanges:    Per-exchange wire-naming conventions
// - facade:       Adapter Facade (binds CM pool + SM + Parser per exchange)
// - control:       Control Surface (runtime operations)
//
mod cache;
mod clock;
mod config;
mod connection;
mod control;
mod errors;
mod exchanges;
mod facade;
mod metrics;
mod parser;
mod record;
mod router;
mod subscription;
mod symbol;

use rustls::crypto::{ring, CryptoProvider};
use std::sync::Arc;
use std::time::Duration;

use clock::system_clock;
use config::{Config, EnvOverrides};
use connection::TungsteniteConnector;
use control::ControlSurface;
use facade::AdapterFacade;
use metrics::RuntimeMetrics;
use parser::Parser;
use router::{BackpressurePolicy, BroadcastSink, CacheSink, PublisherSink, Router};
use subscription::{SubscriptionManager, SubscriptionRequest};

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// This is the main runtime for the multi-exchange market-data ingestion
// engine.
//
// Responsibilities:
// - Initialize cryptography backend (rustls) and logging
// - Load configuration, apply environment overrides
// - Build the shared Router/Cache and their sinks
// - Build one Adapter Facade per enabled exchange and wire its CM pool
// - Seed initial subscriptions from configuration
// - Start the Control Surface's periodic snapshot feed
// - Keep the process alive indefinitely
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --------------------------------------------------------
    // IMPORTANT:
    // rustls >= 0.23 requires an explicit CryptoProvider
    // installation. This must be executed exactly once and
    // as early as possible in the process lifecycle.
    //
    // Using the `ring` provider for performance and stability.
    // --------------------------------------------------------
    CryptoProvider::install_default(ring::default_provider())
        .expect("failed to install rustls CryptoProvider");

    // --------------------------------------------------------
    // Load configuration from disk
    //
    // NOTE:
    // - The config file contains sensitive data (the publisher key).
    // - It must not be committed to version control.
    // --------------------------------------------------------
    let base_config: Config = config::load_from_path("config.json")?;
    let exchange_names: Vec<String> = base_config.exchanges.iter().map(|e| e.name.clone()).collect();
    let env_overrides = EnvOverrides::from_env(&exchange_names);

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(env_overrides.log_level.as_deref().unwrap_or("info")),
    )
    .init();

    let cfg = env_overrides.apply(base_config);

    let clock = system_clock();

    // --------------------------------------------------------
    // Shared dataflow: one Router feeding the Publisher / Cache /
    // Broadcast sinks, and one Stream Cache behind the cache sink.
    // --------------------------------------------------------
    let cache = cache::StreamCache::new(Arc::clone(&clock), cfg.cache.clone());
    cache.spawn_sweeper();

    let router = Router::new(cfg.router.channel_capacity, cfg.router.error_streak);

    let publisher = PublisherSink::new(
        &cfg.publisher.url,
        cfg.publisher.connections,
        cfg.publisher.demo,
        cfg.publisher.topic_prefix.clone(),
        Arc::new(TungsteniteConnector),
        Arc::clone(&clock),
        cfg.router.publication_enabled,
    );
    let publisher_sink: Arc<dyn router::Sink> = Arc::clone(&publisher);
    router.register("publisher", publisher_sink, BackpressurePolicy::DropOldest, None).await;
    router.register("cache", CacheSink::new(Arc::clone(&cache)), BackpressurePolicy::DropOldest, None).await;
    let broadcast = BroadcastSink::new(1024);
    let broadcast_sink: Arc<dyn router::Sink> = Arc::clone(&broadcast);
    router.register("broadcast", broadcast_sink, BackpressurePolicy::DropNewest, None).await;

    let control = ControlSurface::new(Arc::clone(&router), Arc::clone(&cache), Arc::clone(&publisher));

    // --------------------------------------------------------
    // Start one Adapter Facade per enabled exchange.
    //
    // Unsupported exchanges are skipped gracefully; each facade owns its
    // own Parser, Subscription Manager, and Connection Manager pool, all
    // feeding the shared Router above.
    // --------------------------------------------------------
    for exchange_cfg in cfg.exchanges.iter().filter(|e| e.enabled) {
        if exchanges::ws_base_url(&exchange_cfg.name).is_none() {
            log::warn!("exchange '{}' is not supported, skipping", exchange_cfg.name);
            continue;
        }

        let parser = Arc::new(Parser::new(Arc::clone(&clock)));
        let sm = SubscriptionManager::new(exchange_cfg.name.clone(), cfg.subscription.clone(), Arc::clone(&clock), None);
        sm.spawn_stats_task();

        let metrics = Arc::new(RuntimeMetrics::default());
        let facade = AdapterFacade::new(
            exchange_cfg.name.clone(),
            parser,
            sm,
            Arc::clone(&router),
            Arc::clone(&cache),
            Arc::new(TungsteniteConnector),
            cfg.connection.clone(),
            Arc::clone(&clock),
            metrics,
        );

        facade.connect(1).await?;
        log::info!("started {} adapter", exchange_cfg.name);

        seed_subscriptions(&facade, &exchange_cfg.pairs).await;
        control.register_adapter(facade).await;
    }

    control.spawn_snapshot_task(Duration::from_secs(5));

    // --------------------------------------------------------
    // Keep the process alive forever; all work runs in background tasks.
    // --------------------------------------------------------
    futures_util::future::pending::<()>().await;

    Ok(())
}

/// Seeds the facade's initial subscriptions from the exchange's configured
/// pairs (trades, tickers, klines, depth) — the config-driven counterpart
/// to the Control Surface's `add_subscription`.
async fn seed_subscriptions(facade: &Arc<AdapterFacade>, pairs: &config::ExchangePairs) {
    let mut requests = Vec::new();
    for symbol in &pairs.trades {
        requests.push(SubscriptionRequest::new(symbol.clone(), record::DataType::Trade));
    }
    for symbol in &pairs.tickers {
        requests.push(SubscriptionRequest::new(symbol.clone(), record::DataType::Ticker));
    }
    for symbol in &pairs.depth {
        requests.push(SubscriptionRequest::new(symbol.clone(), record::DataType::Depth));
    }
    for kline in &pairs.klines {
        if let Some(data_type) = record::DataType::from_kline_interval(&kline.interval) {
            requests.push(SubscriptionRequest::new(kline.symbol.clone(), data_type));
        } else {
            log::warn!("kline interval '{}' has no canonical data type, skipping {}", kline.interval, kline.symbol);
        }
    }

    if requests.is_empty() {
        return;
    }
    match facade.subscribe(requests).await {
        Ok(outcome) => {
            log::info!(
                "{}: seeded {} subscriptions ({} already existing, {} failed)",
                facade.exchange(),
                outcome.succeeded.len(),
                outcome.existing.len(),
                outcome.failed.len()
            );
            for (request, reason) in &outcome.failed {
                log::warn!("{}: failed to seed {} {}: {reason}", facade.exchange(), request.symbol, request.data_type);
            }
        }
        Err(e) => log::error!("{}: failed to seed initial subscriptions: {e}", facade.exchange()),
    }
}
