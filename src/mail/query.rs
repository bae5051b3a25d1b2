use std::sync::LazyLock;

use chrono::{Days, NaiveDate};
use regex::Regex;

use crate::error::ConfigError;

/// Date syntax the provider's search language expects.
pub const DATE_FORMAT: &str = "%m/%d/%Y";

static DATE_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{2}/\d{2}/\d{4}$").unwrap()
});

/// Search bounds for one pass over the templates. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub recency_hours: Option<u32>,
}

impl PollWindow {
    /// Absolute window used by the backward lookup. `to = None` is open-ended.
    pub fn between(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self {
            from,
            to,
            recency_hours: None,
        }
    }

    /// Rolling window used by steady-state cycles.
    pub fn newer_than(hours: u32) -> Self {
        Self {
            from: None,
            to: None,
            recency_hours: Some(hours),
        }
    }
}

/// Parses a strict `MM/DD/YYYY` date.
pub fn parse_date(name: &'static str, value: &str) -> Result<NaiveDate, ConfigError> {
    let invalid = || ConfigError::InvalidDate {
        name,
        value: value.to_string(),
    };
    if !DATE_SHAPE.is_match(value) {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| invalid())
}

#[derive(Debug, Clone)]
pub struct QueryBuilder {
    lookback_days: u32,
}

impl QueryBuilder {
    pub fn new(lookback_days: u32) -> Self {
        Self { lookback_days }
    }

    /// `today` anchors the default lower bound of an open backward window.
    pub fn build(&self, window: &PollWindow, sender: &str, today: NaiveDate) -> String {
        let mut terms = Vec::with_capacity(3);

        if let Some(hours) = window.recency_hours {
            terms.push(format!("newer_than:{hours}h"));
        } else {
            let from = window.from.unwrap_or_else(|| {
                today
                    .checked_sub_days(Days::new(self.lookback_days.into()))
                    .unwrap_or(NaiveDate::MIN)
            });
            terms.push(format!("after:{}", from.format(DATE_FORMAT)));
            if let Some(to) = window.to {
                terms.push(format!("before:{}", to.format(DATE_FORMAT)));
            }
        }

        terms.push(format!("from:{sender}"));
        terms.join(" ")
    }
}
