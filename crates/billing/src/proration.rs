//! Proration & Trial Calculator
//!
//! Pure, side-effect-free billing arithmetic consumed by the subscription
//! service and the quote endpoints. All intermediate values stay in f64;
//! rounding to whole cents happens exactly once at the final step so repeated
//! recalculation cannot compound rounding error.

use doorlist_shared::SubscriptionTier;
use serde::Serialize;

/// Trial eligibility rule.
///
/// A brand-new customer (no billing history ever recorded for the
/// organization) subscribing below the top tier receives a trial. An existing
/// or reactivating customer, or a top-tier subscription, never does. The
/// `has_billing_history` input must come from durable history (the customers
/// table, which is never hard-deleted), not from the current request payload.
pub fn trial_eligible(has_billing_history: bool, tier: SubscriptionTier) -> bool {
    !has_billing_history && !tier.is_top()
}

/// Apply a percentage discount to an amount in cents.
///
/// `amount * (1 - pct/100)`, rounded to whole cents only here.
pub fn apply_discount_cents(amount_cents: i64, discount_percentage: Option<f64>) -> i64 {
    match discount_percentage {
        Some(pct) if pct > 0.0 => {
            let discounted = amount_cents as f64 * (1.0 - pct / 100.0);
            discounted.round() as i64
        }
        _ => amount_cents,
    }
}

/// Prorated cost of switching to a new price mid-cycle.
///
/// Takes the provider's quoted upcoming-invoice amount for the new price,
/// subtracts the unamortized value of the current price, floors at zero, then
/// applies the active discount.
pub fn prorated_change_cents(
    upcoming_invoice_cents: i64,
    unused_current_cents: i64,
    discount_percentage: Option<f64>,
) -> i64 {
    let delta = (upcoming_invoice_cents - unused_current_cents).max(0);
    apply_discount_cents(delta, discount_percentage)
}

/// Unamortized value of the current price: the portion of the already-paid
/// period that has not elapsed yet. `remaining_fraction` is clamped to [0, 1].
pub fn unused_current_cents(current_monthly_cents: i64, remaining_fraction: f64) -> i64 {
    let fraction = remaining_fraction.clamp(0.0, 1.0);
    (current_monthly_cents as f64 * fraction).round() as i64
}

/// Quote for one candidate tier
#[derive(Debug, Clone, Serialize)]
pub struct TierQuote {
    pub tier: SubscriptionTier,
    /// Amount charged immediately for switching mid-cycle. Zero for the tier
    /// matching the subscription's current price.
    pub prorated_amount_cents: i64,
    /// Recurring amount after the active discount
    pub monthly_amount_cents: i64,
    pub discount_applied: bool,
}

/// Build the quote for a single candidate tier.
///
/// `upcoming_invoice_cents` is the provider's quote for the candidate price;
/// it is ignored when the candidate is the current tier, which always quotes
/// a prorated amount of zero.
pub fn quote_for_tier(
    tier: SubscriptionTier,
    current_tier: SubscriptionTier,
    monthly_list_cents: i64,
    upcoming_invoice_cents: i64,
    unused_current: i64,
    discount_percentage: Option<f64>,
) -> TierQuote {
    let discount_applied = matches!(discount_percentage, Some(pct) if pct > 0.0);
    let prorated_amount_cents = if tier == current_tier {
        0
    } else {
        prorated_change_cents(upcoming_invoice_cents, unused_current, discount_percentage)
    };

    TierQuote {
        tier,
        prorated_amount_cents,
        monthly_amount_cents: apply_discount_cents(monthly_list_cents, discount_percentage),
        discount_applied,
    }
}
