//! Shared domain types
//!
//! The tier and subscription-status enums are used by the billing crate, the
//! API server, and the worker. Tier limits live here so every consumer agrees
//! on the same numbers.

use serde::{Deserialize, Serialize};

/// Service tier controlling scan limits and monthly credit allotment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Demo,
    Pro,
    Agency,
    Elite,
}

impl Tier {
    /// Credits granted on each successful subscription invoice
    pub fn monthly_credits(&self) -> i64 {
        match self {
            Tier::Demo => 0,
            Tier::Pro => 100_000,
            Tier::Agency => 500_000,
            Tier::Elite => 2_000_000,
        }
    }

    /// Scans allowed per billing month
    pub fn monthly_scan_limit(&self) -> i32 {
        match self {
            Tier::Demo => 5,
            Tier::Pro => 50,
            Tier::Agency => 200,
            Tier::Elite => 999_999,
        }
    }

    /// One-time credit grant on signup (demo accounts get a trial balance)
    pub fn signup_credits(&self) -> i64 {
        match self {
            Tier::Demo => 1_000,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Demo => "demo",
            Tier::Pro => "pro",
            Tier::Agency => "agency",
            Tier::Elite => "elite",
        }
    }

    /// Parse a tier name; unknown values map to None so callers can decide
    /// whether to fall back to demo or reject.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "demo" => Some(Tier::Demo),
            "pro" => Some(Tier::Pro),
            "agency" => Some(Tier::Agency),
            "elite" => Some(Tier::Elite),
            _ => None,
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Demo
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription lifecycle status, mirroring Stripe's states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    Canceled,
}

impl SubscriptionStatus {
    /// Terminal states no longer drive the profile's tier
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
