//! Monthly usage counter per owner

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::OwnerId;

/// Calendar month a usage count belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsageMonth {
    pub year: i32,
    pub month: u32,
}

impl UsageMonth {
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now())
    }

    /// Storage key, e.g. `2024-03`
    pub fn key(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

impl fmt::Display for UsageMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Documents created for one owner in one month
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    pub owner_id: OwnerId,
    pub month: UsageMonth,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_month_key() {
        let at = Utc.with_ymd_and_hms(2024, 3, 31, 23, 59, 59).unwrap();
        assert_eq!(UsageMonth::of(at).key(), "2024-03");
    }

    #[test]
    fn test_month_ordering() {
        let feb = UsageMonth { year: 2024, month: 2 };
        let jan_next = UsageMonth { year: 2025, month: 1 };
        assert!(feb < jan_next);
    }
}
