//! Shared application state

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use taskforge_billing::{
    EntitlementService, LimitsCache, LimitsResolver, StripeClient, StripeConfig, UsageReporter,
    UsageStore, WebhookHandler,
};

use crate::auth::JwtManager;
use crate::config::Config;

const JWT_EXPIRY_HOURS: i64 = 24;

/// Shared state for all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub jwt: JwtManager,
    pub entitlements: EntitlementService,
    pub webhooks: WebhookHandler,
    pub reporter: UsageReporter,
}

impl AppState {
    /// Wire up the billing services around a connected pool.
    pub fn new(config: Config, pool: PgPool) -> Self {
        let stripe = StripeClient::new(StripeConfig {
            secret_key: config.stripe_secret_key.clone(),
            webhook_secret: config.stripe_webhook_secret.clone(),
        });

        let cache = Arc::new(LimitsCache::new(Duration::from_secs(
            config.limits_cache_ttl_secs,
        )));
        let resolver = Arc::new(LimitsResolver::new(stripe.clone(), cache));

        let reporter = UsageReporter::new(pool.clone(), stripe.clone());
        let reporter_handle = reporter.spawn();

        let entitlements = EntitlementService::new(
            pool.clone(),
            stripe,
            resolver,
            UsageStore::new(pool.clone()),
            reporter_handle,
        );

        let webhooks = WebhookHandler::new(pool.clone(), config.stripe_webhook_secret.clone());
        let jwt = JwtManager::new(&config.jwt_secret, JWT_EXPIRY_HOURS);

        Self {
            pool,
            config: Arc::new(config),
            jwt,
            entitlements,
            webhooks,
            reporter,
        }
    }
}
