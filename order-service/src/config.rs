use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "order-service")]
pub struct Args {
    /// PostgreSQL URL. Without one the service runs on an in-memory store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[arg(long, env = "PORT", default_value = "3001")]
    pub port: u16,

    /// Kafka bootstrap servers for customer notifications. Without them
    /// notifications are only logged.
    #[arg(long, env = "KAFKA_BROKERS")]
    pub kafka_brokers: Option<String>,

    #[arg(long, env = "NOTIFICATION_TOPIC", default_value = "customer-notifications")]
    pub notification_topic: String,

    /// Stripe secret key. Without one payment intents are simulated locally.
    #[arg(long, env = "STRIPE_SECRET_KEY")]
    pub stripe_secret_key: Option<String>,

    #[arg(long, env = "STRIPE_WEBHOOK_SECRET")]
    pub stripe_webhook_secret: String,

    #[arg(long, env = "WEBHOOK_TOLERANCE_SECS", default_value = "300")]
    pub webhook_tolerance_secs: i64,

    #[arg(long, env = "CURRENCY", default_value = "gbp")]
    pub currency: String,

    #[arg(long, env = "CART_RETENTION_DAYS", default_value = "30")]
    pub cart_retention_days: i64,

    #[arg(long, env = "ARCHIVE_INTERVAL_SECS", default_value = "3600")]
    pub archive_interval_secs: u64,

    #[arg(long, env = "OUTBOX_INTERVAL_SECS", default_value = "5")]
    pub outbox_interval_secs: u64,

    /// JSON array of products loaded into the in-memory store.
    #[arg(long, env = "CATALOG_SEED")]
    pub catalog_seed: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let args = Args::try_parse_from(["order-service", "--stripe-webhook-secret", "whsec_x"]).unwrap();
        assert_eq!(args.port, 3001);
        assert_eq!(args.webhook_tolerance_secs, 300);
        assert_eq!(args.cart_retention_days, 30);
        assert_eq!(args.currency, "gbp");
    }
}
