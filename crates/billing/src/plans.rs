//! Subscription plan catalog
//!
//! One `Plan` per tier, pairing the Stripe price ID with the entitlements the
//! tier grants. The monthly credit allotment is what invoice payments post to
//! the ledger.

use nexus_shared::Tier;

/// Subscription plan configuration
#[derive(Debug, Clone)]
pub struct Plan {
    pub tier: Tier,
    pub stripe_price_id: String,
    /// Credits granted per paid invoice
    pub monthly_credits: i64,
    pub monthly_scan_limit: i32,
}

impl Plan {
    /// Demo tier: 5 scans/month, no recurring credits (signup grant only)
    pub fn demo() -> Self {
        Self {
            tier: Tier::Demo,
            stripe_price_id: String::new(),
            monthly_credits: Tier::Demo.monthly_credits(),
            monthly_scan_limit: Tier::Demo.monthly_scan_limit(),
        }
    }

    /// Pro tier: 50 scans/month, 100K credits per invoice
    pub fn pro(price_id: &str) -> Self {
        Self::paid(Tier::Pro, price_id)
    }

    /// Agency tier: 200 scans/month, 500K credits per invoice
    pub fn agency(price_id: &str) -> Self {
        Self::paid(Tier::Agency, price_id)
    }

    /// Elite tier: effectively unlimited scans, 2M credits per invoice
    pub fn elite(price_id: &str) -> Self {
        Self::paid(Tier::Elite, price_id)
    }

    fn paid(tier: Tier, price_id: &str) -> Self {
        Self {
            tier,
            stripe_price_id: price_id.to_string(),
            monthly_credits: tier.monthly_credits(),
            monthly_scan_limit: tier.monthly_scan_limit(),
        }
    }

    /// Plan for a tier, without price binding
    pub fn for_tier(tier: Tier) -> Self {
        Self {
            tier,
            stripe_price_id: String::new(),
            monthly_credits: tier.monthly_credits(),
            monthly_scan_limit: tier.monthly_scan_limit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pro_plan_allotment() {
        let plan = Plan::pro("price_pro_m");
        assert_eq!(plan.monthly_credits, 100_000);
        assert_eq!(plan.monthly_scan_limit, 50);
    }

    #[test]
    fn test_demo_plan_has_no_recurring_credits() {
        let plan = Plan::demo();
        assert_eq!(plan.monthly_credits, 0);
        assert!(plan.stripe_price_id.is_empty());
    }

    #[test]
    fn test_for_tier_matches_named_constructors() {
        assert_eq!(
            Plan::for_tier(Tier::Agency).monthly_credits,
            Plan::agency("price_x").monthly_credits
        );
        assert_eq!(
            Plan::for_tier(Tier::Elite).monthly_scan_limit,
            Plan::elite("price_y").monthly_scan_limit
        );
    }
}
