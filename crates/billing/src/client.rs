//! Stripe client and configuration
//!
//! Wraps the async-stripe client together with the environment-driven
//! configuration: API keys, the webhook signing secret, and the price-id to
//! tier mapping that subscription sync uses to derive a profile's tier.

use nexus_shared::Tier;

use crate::error::{BillingError, BillingResult};

/// Stripe price IDs for each paid tier
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub pro_monthly: String,
    pub pro_annual: String,
    pub agency_monthly: String,
    pub agency_annual: String,
    pub elite_monthly: String,
    pub elite_annual: String,
}

/// Stripe configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let price_ids = PriceIds {
            pro_monthly: std::env::var("STRIPE_PRICE_PRO_MONTHLY").unwrap_or_default(),
            pro_annual: std::env::var("STRIPE_PRICE_PRO_ANNUAL").unwrap_or_default(),
            agency_monthly: std::env::var("STRIPE_PRICE_AGENCY_MONTHLY").unwrap_or_default(),
            agency_annual: std::env::var("STRIPE_PRICE_AGENCY_ANNUAL").unwrap_or_default(),
            elite_monthly: std::env::var("STRIPE_PRICE_ELITE_MONTHLY").unwrap_or_default(),
            elite_annual: std::env::var("STRIPE_PRICE_ELITE_ANNUAL").unwrap_or_default(),
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids,
        })
    }

    /// Map a Stripe price ID to the tier it entitles
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<Tier> {
        // Unconfigured price slots default to "", which must never match
        if price_id.is_empty() {
            return None;
        }
        let p = &self.price_ids;
        if price_id == p.pro_monthly || price_id == p.pro_annual {
            Some(Tier::Pro)
        } else if price_id == p.agency_monthly || price_id == p.agency_annual {
            Some(Tier::Agency)
        } else if price_id == p.elite_monthly || price_id == p.elite_annual {
            Some(Tier::Elite)
        } else {
            None
        }
    }
}

/// Shared Stripe client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

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
                pro_monthly: "price_pro_m".to_string(),
                pro_annual: "price_pro_y".to_string(),
                agency_monthly: "price_agency_m".to_string(),
                agency_annual: "price_agency_y".to_string(),
                elite_monthly: "price_elite_m".to_string(),
                elite_annual: "price_elite_y".to_string(),
            },
        }
    }

    #[test]
    fn test_tier_for_known_price_ids() {
        let config = test_config();
        assert_eq!(config.tier_for_price_id("price_pro_m"), Some(Tier::Pro));
        assert_eq!(config.tier_for_price_id("price_pro_y"), Some(Tier::Pro));
        assert_eq!(config.tier_for_price_id("price_agency_m"), Some(Tier::Agency));
        assert_eq!(config.tier_for_price_id("price_elite_y"), Some(Tier::Elite));
    }

    #[test]
    fn test_unknown_price_id_maps_to_none() {
        let config = test_config();
        assert_eq!(config.tier_for_price_id("price_unknown"), None);
    }

    #[test]
    fn test_empty_price_id_never_matches() {
        let mut config = test_config();
        config.price_ids.agency_annual = String::new();
        // An empty incoming price id must not match the unconfigured
        // (empty) agency annual slot
        assert_eq!(config.tier_for_price_id(""), None);
        assert_eq!(config.tier_for_price_id("price_agency_m"), Some(Tier::Agency));
    }
}
