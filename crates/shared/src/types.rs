//! Common types used across Doorlist

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Organization ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(pub Uuid);

impl OrgId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OrgId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OrgId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Event ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier for billing
/// Tier hierarchy: Standard → Plus → Elite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Standard,
    Plus,
    Elite,
}

impl SubscriptionTier {
    /// Guest-list-enabled events included per billing cycle.
    /// Events beyond the quota consume prepaid credits.
    pub fn guest_list_quota(&self) -> u32 {
        match self {
            Self::Standard => 2,
            Self::Plus => 5,
            Self::Elite => u32::MAX,
        }
    }

    /// Ordering rank used for upgrade/downgrade classification
    pub fn rank(&self) -> u8 {
        match self {
            Self::Standard => 0,
            Self::Plus => 1,
            Self::Elite => 2,
        }
    }

    /// The top tier never receives a trial period
    pub fn is_top(&self) -> bool {
        matches!(self, Self::Elite)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Plus => "plus",
            Self::Elite => "elite",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "plus" => Some(Self::Plus),
            "elite" => Some(Self::Elite),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription lifecycle status
///
/// `Incomplete → {Trialing | Active} → {PastDue ↔ Active} →
/// PendingCancellation → Canceled`; `Unpaid` and `IncompleteExpired` are
/// absorbing failure states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    PendingCancellation,
    Unpaid,
    Canceled,
}

impl SubscriptionStatus {
    /// A usable subscription occupies the customer's single subscription slot.
    /// Canceled and expired-incomplete rows are history only.
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Canceled | Self::IncompleteExpired)
    }

    /// Statuses that block creating another subscription
    pub fn blocks_new_subscription(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::PendingCancellation => "pending_cancellation",
            Self::Unpaid => "unpaid",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incomplete" => Some(Self::Incomplete),
            "incomplete_expired" => Some(Self::IncompleteExpired),
            "trialing" => Some(Self::Trialing),
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "pending_cancellation" => Some(Self::PendingCancellation),
            "unpaid" => Some(Self::Unpaid),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(SubscriptionTier::Standard.rank() < SubscriptionTier::Plus.rank());
        assert!(SubscriptionTier::Plus.rank() < SubscriptionTier::Elite.rank());
        assert!(SubscriptionTier::Elite.is_top());
        assert!(!SubscriptionTier::Plus.is_top());
    }

    #[test]
    fn test_tier_roundtrip() {
        for tier in [
            SubscriptionTier::Standard,
            SubscriptionTier::Plus,
            SubscriptionTier::Elite,
        ] {
            assert_eq!(SubscriptionTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(SubscriptionTier::parse("enterprise"), None);
    }

    #[test]
    fn test_status_usability() {
        assert!(SubscriptionStatus::Active.is_usable());
        assert!(SubscriptionStatus::PendingCancellation.is_usable());
        assert!(SubscriptionStatus::PastDue.is_usable());
        assert!(!SubscriptionStatus::Canceled.is_usable());
        assert!(!SubscriptionStatus::IncompleteExpired.is_usable());
    }

    #[test]
    fn test_status_blocks_new_subscription() {
        assert!(SubscriptionStatus::Active.blocks_new_subscription());
        assert!(SubscriptionStatus::Trialing.blocks_new_subscription());
        assert!(!SubscriptionStatus::PastDue.blocks_new_subscription());
        assert!(!SubscriptionStatus::Canceled.blocks_new_subscription());
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::IncompleteExpired,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::PendingCancellation,
            SubscriptionStatus::Unpaid,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), Some(status));
        }
    }
}
