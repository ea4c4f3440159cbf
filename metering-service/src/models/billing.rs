//! Per-owner billing context and billing period arithmetic.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Per-owner billing state: subscription period bounds (when a
/// subscription exists), the anchor used for rolling periods, and the
/// running credits-used counter bumped on successful commits.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BillingContext {
    pub owner_id: Uuid,
    pub plan_id: Option<Uuid>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub anchor_utc: DateTime<Utc>,
    pub credits_used: Decimal,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Billing period for quota checks.
///
/// Subscription period bounds win when both are present. Otherwise the
/// owner is on 30-day rolling periods from the anchor: period 0 is
/// [anchor, anchor+30d), period 1 is [anchor+30d, anchor+60d), and so on.
pub fn compute_billing_period(
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    if let (Some(start), Some(end)) = (period_start, period_end) {
        return (start, end);
    }

    let period_length = Duration::days(30);
    let elapsed = (now - anchor).max(Duration::zero());
    let periods_elapsed = elapsed.num_seconds() / period_length.num_seconds();
    let start = anchor + period_length * periods_elapsed as i32;
    (start, start + period_length)
}
