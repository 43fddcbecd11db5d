//! Stripe client configuration

use doorlist_shared::SubscriptionTier;
use stripe::Client;

use crate::error::{BillingError, BillingResult};

/// Default trial length for eligible new customers
pub const DEFAULT_TRIAL_PERIOD_DAYS: u32 = 30;

/// Configuration for Stripe billing
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs for each subscription tier
    pub price_ids: PriceIds,
    /// Base URL for redirects and payment links
    pub app_base_url: String,
    /// Trial length granted to eligible new customers
    pub trial_period_days: u32,
}

/// Stripe price IDs for subscription tiers
/// Tier hierarchy: Standard → Plus → Elite
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub standard: String,
    pub plus: String,
    pub elite: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?,
            price_ids: PriceIds {
                standard: std::env::var("STRIPE_PRICE_STANDARD").map_err(|_| {
                    BillingError::Config("STRIPE_PRICE_STANDARD not set".to_string())
                })?,
                plus: std::env::var("STRIPE_PRICE_PLUS")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_PLUS not set".to_string()))?,
                elite: std::env::var("STRIPE_PRICE_ELITE")
                    .map_err(|_| BillingError::Config("STRIPE_PRICE_ELITE not set".to_string()))?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            trial_period_days: std::env::var("TRIAL_PERIOD_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TRIAL_PERIOD_DAYS),
        })
    }

    /// Get price ID for a tier
    pub fn price_id_for_tier(&self, tier: SubscriptionTier) -> &str {
        match tier {
            SubscriptionTier::Standard => &self.price_ids.standard,
            SubscriptionTier::Plus => &self.price_ids.plus,
            SubscriptionTier::Elite => &self.price_ids.elite,
        }
    }

    /// Get tier from price ID. This is the authoritative mapping used when a
    /// webhook reports a price the provider changed out from under us.
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        if price_id == self.price_ids.standard {
            Some(SubscriptionTier::Standard)
        } else if price_id == self.price_ids.plus {
            Some(SubscriptionTier::Plus)
        } else if price_id == self.price_ids.elite {
            Some(SubscriptionTier::Elite)
        } else {
            None
        }
    }
}

/// Stripe billing client
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    config: StripeConfig,
}

impl StripeClient {
    /// Create a new Stripe client from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
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
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_123".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                standard: "price_standard".to_string(),
                plus: "price_plus".to_string(),
                elite: "price_elite".to_string(),
            },
            app_base_url: "http://localhost:3000".to_string(),
            trial_period_days: 30,
        }
    }

    #[test]
    fn test_tier_price_mapping_roundtrip() {
        let config = test_config();
        for tier in [
            SubscriptionTier::Standard,
            SubscriptionTier::Plus,
            SubscriptionTier::Elite,
        ] {
            let price_id = config.price_id_for_tier(tier);
            assert_eq!(config.tier_for_price_id(price_id), Some(tier));
        }
    }

    #[test]
    fn test_unknown_price_id() {
        let config = test_config();
        assert_eq!(config.tier_for_price_id("price_unknown"), None);
    }
}
