use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use tiered_backup_common::{RetentionDecision, RetentionPolicy, Tier};

/// Day of the week on which weekly backups are taken.
pub const WEEKLY_BACKUP_DAY: Weekday = Weekday::Sun;

/// Classifies a day into at most one retention tier and computes when a
/// backup taken that day expires.
///
/// Tiers are tried in priority order yearly, monthly, weekly, daily. The
/// first tier whose calendar condition holds and whose count is non-zero
/// wins; lower tiers are not considered. On Jan 1 with a yearly count this
/// means no monthly backup is taken that day.
pub struct RetentionScheduler;

impl RetentionScheduler {
    pub fn decide(policy: &RetentionPolicy, today: NaiveDate) -> RetentionDecision {
        match Self::select_tier(policy, today) {
            Some(tier) => RetentionDecision::backup(tier, expiration_date(policy, tier, today)),
            None => RetentionDecision::NoBackup,
        }
    }

    /// The winning tier for `today`, if any.
    pub fn select_tier(policy: &RetentionPolicy, today: NaiveDate) -> Option<Tier> {
        let month_start = today.day() == 1;

        if month_start && today.month() == 1 && policy.yearly > 0 {
            return Some(Tier::Yearly);
        }
        if month_start && policy.monthly > 0 {
            return Some(Tier::Monthly);
        }
        if today.weekday() == WEEKLY_BACKUP_DAY && policy.weekly > 0 {
            return Some(Tier::Weekly);
        }
        if policy.daily > 0 {
            return Some(Tier::Daily);
        }
        None
    }
}

/// Date on which a `tier` backup taken on `today` becomes eligible for
/// deletion.
///
/// Months and years are calendar units: the day of month is kept and clamped
/// to the last day of shorter months (Jan 31 + 1 month = Feb 28/29,
/// Feb 29 + 1 year = Feb 28). Dates past chrono's range saturate at
/// `NaiveDate::MAX`, so the result is strictly after `today` for every
/// `today` except `NaiveDate::MAX` itself, where it equals `today`.
pub fn expiration_date(policy: &RetentionPolicy, tier: Tier, today: NaiveDate) -> NaiveDate {
    let expires = match tier {
        Tier::Daily => today.checked_add_days(Days::new(u64::from(policy.daily))),
        Tier::Weekly => today.checked_add_days(Days::new(u64::from(policy.weekly) * 7)),
        Tier::Monthly => today.checked_add_months(Months::new(policy.monthly)),
        Tier::Yearly => policy
            .yearly
            .checked_mul(12)
            .and_then(|months| today.checked_add_months(Months::new(months))),
    };
    expires.unwrap_or(NaiveDate::MAX)
}
