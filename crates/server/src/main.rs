use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use leafline_compliance::ComplianceGate;
use leafline_pipeline::{CampaignSendHandler, Reconciler, ReconcilerConfig, SendService, SmsSendHandler};
use leafline_provider::SmsProvider;
use leafline_queue::{Queue, QueueBackend, RedisQueueBackend, RedisQueueConfig, WorkerConfig, WorkerPool};
use leafline_server::api::{AppState, router};
use leafline_server::config::LeaflineConfig;
use leafline_server::error::ServerError;
use leafline_server::telemetry;
use leafline_store::Store;
use leafline_store_postgres::{PostgresConfig, PostgresStore};
use leafline_telnyx::{TelnyxConfig, TelnyxProvider, WebhookVerifier};

/// Leafline messaging server.
#[derive(Parser, Debug)]
#[command(name = "leafline-server", about = "HTTP server for the Leafline messaging platform")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "leafline.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();

    let cli = Cli::parse();
    let mut config = LeaflineConfig::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    config.validate()?;

    // Store.
    let database_url = config
        .database
        .url
        .clone()
        .ok_or_else(|| ServerError::Config("database.url is required".into()))?;
    let store: Arc<dyn Store> = Arc::new(
        PostgresStore::new(
            &PostgresConfig::new(database_url)
                .with_pool(config.database.pool.min, config.database.pool.max),
        )
        .await?,
    );
    info!("store connected and migrated");

    // Queue.
    let redis_url = config
        .redis
        .url
        .clone()
        .ok_or_else(|| ServerError::Config("redis.url is required".into()))?;
    let backend: Arc<dyn QueueBackend> =
        Arc::new(RedisQueueBackend::new(&RedisQueueConfig::new(redis_url))?);
    let queue = Queue::new(Arc::clone(&backend));

    // Carrier.
    let api_key = config
        .provider
        .api_key
        .clone()
        .ok_or_else(|| ServerError::Config("provider.api_key is required".into()))?;
    let mut telnyx_config = TelnyxConfig::new(api_key);
    if let Some(profile) = &config.provider.messaging_profile_id {
        telnyx_config = telnyx_config.with_messaging_profile_id(profile.clone());
    }
    if let Some(base_url) = &config.provider.api_base_url {
        telnyx_config = telnyx_config.with_api_base_url(base_url.clone());
    }
    if let Some(public_key) = &config.provider.public_key {
        telnyx_config = telnyx_config.with_public_key(public_key.clone());
    }
    let provider: Arc<dyn SmsProvider> = Arc::new(TelnyxProvider::new(telnyx_config)?);

    let verifier = match &config.provider.public_key {
        Some(key) => Some(
            WebhookVerifier::new(key)
                .map_err(|e| ServerError::Config(format!("provider.public_key: {e}")))?,
        ),
        None => {
            tracing::warn!("provider.public_key not set; webhook signatures are NOT verified");
            None
        }
    };

    // Pipeline.
    let gate = Arc::new(ComplianceGate::new(Arc::clone(&store), config.gate_config()?));
    let send = Arc::new(SendService::new(Arc::clone(&gate), queue.clone()));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&provider),
        ReconcilerConfig {
            opt_out_keywords: gate.config().opt_out_keywords.clone(),
            opt_in_keywords: gate.config().opt_in_keywords.clone(),
            default_messaging_profile: config.provider.messaging_profile_id.clone(),
            ..ReconcilerConfig::default()
        },
    ));

    // Workers.
    let worker_config = WorkerConfig {
        sms_concurrency: config.queue.sms_concurrency,
        campaign_concurrency: config.queue.campaign_concurrency,
        poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
        rate_max: config.queue.rate_limit.max,
        rate_interval: Duration::from_millis(config.queue.rate_limit.interval_ms),
        ..WorkerConfig::default()
    };
    let sms_handler = Arc::new(SmsSendHandler::new(
        Arc::clone(&store),
        Arc::clone(&gate),
        Arc::clone(&provider),
        config.provider.messaging_profile_id.clone(),
    ));
    let campaign_handler = Arc::new(CampaignSendHandler::new(
        Arc::clone(&store),
        Arc::clone(&send),
    ));
    let pool = Arc::new(
        WorkerPool::new(Arc::clone(&backend), worker_config)
            .register(sms_handler)
            .register(campaign_handler),
    );
    let shutdown = CancellationToken::new();
    let worker_handles = pool.spawn(&shutdown);

    // HTTP surface.
    let state = AppState {
        send,
        reconciler,
        queue,
        store,
        verifier,
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    // Drain workers before exit.
    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("shutdown complete");

    Ok(())
}
