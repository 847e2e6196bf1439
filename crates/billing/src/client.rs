//! Stripe client configuration

use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Base URL for raw Stripe API calls made outside of async-stripe
const STRIPE_API_BASE: &str = "https://api.stripe.com/v1";

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
        })
    }
}

/// Stripe billing client
///
/// Wraps the async-stripe client plus a plain reqwest client used for the
/// API surfaces our pinned async-stripe version does not expose (active
/// entitlements, usage record summaries).
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    http: reqwest::Client,
    config: StripeConfig,
    api_base: String,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self {
            client,
            http: reqwest::Client::new(),
            config,
            api_base: STRIPE_API_BASE.to_string(),
        }
    }

    /// Create a new Stripe client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Raw GET against the Stripe API, returning the JSON body.
    ///
    /// `path_and_query` is relative to the API base, e.g.
    /// `"/entitlements/active_entitlements?customer=cus_123"`.
    pub async fn get_raw(&self, path_and_query: &str) -> BillingResult<serde_json::Value> {
        let url = format!("{}{}", self.api_base, path_and_query);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(BillingError::StripeApi(format!(
                "{} returned {}: {}",
                path_and_query, status, message
            )));
        }

        Ok(body)
    }
}
