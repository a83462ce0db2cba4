use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::Tier;

/// Which tier wins when a day is both the first of the month and the weekly anchor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierPrecedence {
    #[default]
    MonthlyFirst,
    WeeklyFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub weekly_anchor: Weekday,
    pub precedence: TierPrecedence,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            weekly_anchor: Weekday::Sun,
            precedence: TierPrecedence::MonthlyFirst,
        }
    }
}

impl Schedule {
    pub fn new(weekly_anchor: Weekday, precedence: TierPrecedence) -> Self {
        Self {
            weekly_anchor,
            precedence,
        }
    }
}

/// Parse a weekday such as `Sun`, `sunday` or `SUN`.
pub fn parse_weekday(s: &str) -> Result<Weekday, ConfigError> {
    Weekday::from_str(s.trim()).map_err(|_| ConfigError::UnknownWeekday(s.to_string()))
}

/// Grandfather-father-son tier for a run started at `now` (UTC calendar date).
pub fn decide_tier(now: DateTime<Utc>, schedule: &Schedule) -> Tier {
    let first_of_month = now.day() == 1;
    let anchor_day = now.weekday() == schedule.weekly_anchor;

    match (first_of_month, anchor_day) {
        (true, true) => match schedule.precedence {
            TierPrecedence::MonthlyFirst => Tier::Monthly,
            TierPrecedence::WeeklyFirst => Tier::Weekly,
        },
        (true, false) => Tier::Monthly,
        (false, true) => Tier::Weekly,
        (false, false) => Tier::Daily,
    }
}
