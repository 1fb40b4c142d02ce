//! Request-scoped actor context
//!
//! Every data-access call is parameterized by the actor performing it instead
//! of reading identity from ambient session state. The guard below is the
//! single place where row-ownership is decided in application code; the
//! database's Row Level Security policies enforce the same rule independently.

use serde::Serialize;
use uuid::Uuid;

/// Who is performing an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    /// An authenticated end user; may only touch rows they own
    User(Uuid),
    /// The administrative service identity (webhook processor, worker jobs);
    /// bypasses row ownership but is a separate, narrowly-scoped credential
    Service,
}

impl Actor {
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Actor::User(id) => Some(*id),
            Actor::Service => None,
        }
    }
}

/// Typed result of an authorization check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AccessDecision {
    Allowed,
    Denied { reason: String },
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        AccessDecision::Denied {
            reason: reason.into(),
        }
    }

    /// Check whether `actor` may access a row owned by `resource_owner`
    pub fn check(actor: Actor, resource_owner: Uuid) -> Self {
        match actor {
            Actor::Service => AccessDecision::Allowed,
            Actor::User(id) if id == resource_owner => AccessDecision::Allowed,
            Actor::User(_) => AccessDecision::denied("row is owned by another user"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_can_access_own_rows() {
        let user = Uuid::new_v4();
        assert!(AccessDecision::check(Actor::User(user), user).is_allowed());
    }

    #[test]
    fn test_user_denied_for_other_rows() {
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        let decision = AccessDecision::check(Actor::User(user), other);
        assert!(!decision.is_allowed());
        assert!(matches!(decision, AccessDecision::Denied { .. }));
    }

    #[test]
    fn test_service_bypasses_ownership() {
        let owner = Uuid::new_v4();
        assert!(AccessDecision::check(Actor::Service, owner).is_allowed());
    }

    #[test]
    fn test_service_actor_has_no_user_id() {
        assert_eq!(Actor::Service.user_id(), None);
        let id = Uuid::new_v4();
        assert_eq!(Actor::User(id).user_id(), Some(id));
    }
}
