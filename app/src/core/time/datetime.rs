use std::{
    fmt::Display,
    ops::{Add, Sub},
};

use super::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct DateTime {
    delegate: chrono::DateTime<chrono::Utc>,
}

impl DateTime {
    pub const MIN: DateTime = DateTime {
        delegate: chrono::DateTime::<chrono::Utc>::MIN_UTC,
    };

    pub const MAX: DateTime = DateTime {
        delegate: chrono::DateTime::<chrono::Utc>::MAX_UTC,
    };

    fn new<T: chrono::TimeZone>(delegate: chrono::DateTime<T>) -> Self {
        Self {
            delegate: delegate.with_timezone(&chrono::Utc),
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        match chrono::DateTime::from_timestamp_millis(millis) {
            Some(dt) => dt.into(),
            None if millis < 0 => Self::MIN,
            None => Self::MAX,
        }
    }

    pub fn millis(&self) -> i64 {
        self.delegate.timestamp_millis()
    }

    #[cfg(test)]
    pub fn from_iso(iso8601: &str) -> anyhow::Result<Self> {
        Ok(chrono::DateTime::parse_from_rfc3339(iso8601)?.into())
    }

    pub fn to_iso_string(&self) -> String {
        self.delegate.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    pub fn elapsed_since(&self, since: Self) -> Duration {
        Duration::millis(self.millis().saturating_sub(since.millis()))
    }
}

impl Display for DateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_iso_string())
    }
}

impl Add<Duration> for DateTime {
    type Output = DateTime;

    fn add(self, rhs: Duration) -> Self::Output {
        DateTime::from_millis(self.millis().saturating_add(rhs.as_millis()))
    }
}

impl Sub<Duration> for DateTime {
    type Output = DateTime;

    fn sub(self, rhs: Duration) -> Self::Output {
        DateTime::from_millis(self.millis().saturating_sub(rhs.as_millis()))
    }
}

impl<T: chrono::TimeZone> From<chrono::DateTime<T>> for DateTime {
    fn from(val: chrono::DateTime<T>) -> Self {
        DateTime::new(val)
    }
}
