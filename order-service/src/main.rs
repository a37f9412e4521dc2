mod api;
mod archiver;
mod carts;
mod config;
mod error;
mod gateway;
mod models;
mod notifier;
mod outbox;
mod queries;
mod reconcile;
mod schema;
mod store;

use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::{Context, Result};
use clap::Parser;
use diesel::Connection;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use rdkafka::config::ClientConfig;
use rdkafka::producer::FutureProducer;
use shared::Product;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Args;
use gateway::signature::WebhookVerifier;
use gateway::{OfflineGateway, PaymentGateway, StripeGateway};
use notifier::{KafkaNotifier, LogNotifier, Notifier};
use store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let store = build_store(&args).await?;
    let notifier = build_notifier(&args)?;
    let gateway: Arc<dyn PaymentGateway> = match &args.stripe_secret_key {
        Some(key) => Arc::new(StripeGateway::new(key.clone())),
        None => {
            warn!("STRIPE_SECRET_KEY not set; payment intents are simulated");
            Arc::new(OfflineGateway)
        }
    };

    let outbox_wake = Arc::new(Notify::new());

    let outbox_processor = outbox::OutboxProcessor::new(
        store.clone(),
        notifier.clone(),
        outbox_wake.clone(),
        Duration::from_secs(args.outbox_interval_secs),
    );
    let cart_archiver = archiver::CartArchiver::new(
        store.clone(),
        chrono::Duration::days(args.cart_retention_days),
        Duration::from_secs(args.archive_interval_secs),
    );

    tokio::spawn(async move {
        outbox_processor.run().await;
    });

    tokio::spawn(async move {
        cart_archiver.run().await;
    });

    let verifier = WebhookVerifier::new(args.stripe_webhook_secret.clone(), args.webhook_tolerance_secs);
    let app_state = api::AppState {
        checkout: Arc::new(carts::Checkout::new(store.clone(), gateway, args.currency.clone())),
        reconciler: Arc::new(reconcile::Reconciler::new(store.clone(), verifier, outbox_wake)),
        queries: Arc::new(queries::OrderQueries::new(store, notifier)),
    };

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Order service web server started on port {}", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn build_store(args: &Args) -> Result<Arc<dyn Store>> {
    let Some(database_url) = &args.database_url else {
        let products: Vec<Product> = match &args.catalog_seed {
            Some(path) => {
                let raw = std::fs::read(path).with_context(|| format!("reading catalog seed {}", path.display()))?;
                serde_json::from_slice(&raw).context("parsing catalog seed")?
            }
            None => Vec::new(),
        };
        warn!(products = products.len(), "DATABASE_URL not set; using the in-memory store");
        return Ok(Arc::new(MemoryStore::with_products(products)));
    };

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let config =
        diesel_async::pooled_connection::AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder().build(config).await?;

    Ok(Arc::new(PgStore::new(pool)))
}

fn build_notifier(args: &Args) -> Result<Arc<dyn Notifier>> {
    let Some(brokers) = &args.kafka_brokers else {
        warn!("KAFKA_BROKERS not set; notifications are only logged");
        return Ok(Arc::new(LogNotifier));
    };

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("message.timeout.ms", "5000")
        .create()?;

    Ok(Arc::new(KafkaNotifier::new(producer, args.notification_topic.clone())))
}
