//! Adaptive cache expiry
//!
//! Actively updated packages are refreshed often, stale ones rarely: the
//! time-to-live is one hundredth of the record's age, clamped to
//! [`MIN_EXPIRY`, `MAX_EXPIRY`].

use chrono::{DateTime, TimeDelta, Utc};

pub const MIN_EXPIRY: TimeDelta = TimeDelta::hours(1);
pub const MAX_EXPIRY: TimeDelta = TimeDelta::hours(24);

/// Time-to-live for a record last updated `age` ago
pub fn expiry_for_age(age: TimeDelta) -> TimeDelta {
    (age / 100).clamp(MIN_EXPIRY, MAX_EXPIRY)
}

/// Absolute expiry time for a record last updated at `last_update`
pub fn expire_at(last_update: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now + expiry_for_age(now - last_update)
}
