use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Review status of a suspicious-activity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Reported,
    UnderReview,
    Resolved,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Reported => "reported",
            ActivityStatus::UnderReview => "under_review",
            ActivityStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reported" => Ok(ActivityStatus::Reported),
            "under_review" => Ok(ActivityStatus::UnderReview),
            "resolved" => Ok(ActivityStatus::Resolved),
            other => Err(format!("unknown activity status: {}", other)),
        }
    }
}

/// A flagged transaction or a manual report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousActivityRecord {
    pub id: String,
    pub user_id: String,
    /// Transaction that triggered the flag; absent for manual reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_ref: Option<String>,
    pub reason: String,
    pub status: ActivityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Notification sent on the administrator channel when a rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminAlert {
    pub record_id: String,
    pub user_id: String,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activity_status_round_trips_through_str() {
        for status in [
            ActivityStatus::Reported,
            ActivityStatus::UnderReview,
            ActivityStatus::Resolved,
        ] {
            assert_eq!(status.as_str().parse::<ActivityStatus>(), Ok(status));
        }
        assert!("closed".parse::<ActivityStatus>().is_err());
    }
}
