use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    NotReviewed,
    Pending,
    Approved,
    ChangesRequested,
    Commented,
    Unknown,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::NotReviewed => "not_reviewed",
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::ChangesRequested => "changes_requested",
            ReviewStatus::Commented => "commented",
            ReviewStatus::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ReviewStatus {
        match s {
            "not_reviewed" => ReviewStatus::NotReviewed,
            "pending" => ReviewStatus::Pending,
            "approved" => ReviewStatus::Approved,
            "changes_requested" => ReviewStatus::ChangesRequested,
            "commented" => ReviewStatus::Commented,
            _ => ReviewStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestRecord {
    pub key: String, // "{owner}/{name}#{number}"
    pub id: String,
    pub number: i64,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub html_url: String,
    pub owner: String,
    pub name: String,
    pub draft: bool,
    pub review_status: ReviewStatus,
    pub labels: Vec<Label>,
}

impl PullRequestRecord {
    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

pub fn pr_key(owner: &str, name: &str, number: i64) -> String {
    format!("{owner}/{name}#{number}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn review_status_round_trips_through_db_text() {
        for s in [
            ReviewStatus::NotReviewed,
            ReviewStatus::Pending,
            ReviewStatus::Approved,
            ReviewStatus::ChangesRequested,
            ReviewStatus::Commented,
            ReviewStatus::Unknown,
        ] {
            assert_eq!(ReviewStatus::parse(s.as_str()), s);
        }
        assert_eq!(ReviewStatus::parse("garbage"), ReviewStatus::Unknown);
    }

    #[test]
    fn review_status_serializes_lowercase() {
        let json = serde_json::to_string(&ReviewStatus::ChangesRequested).unwrap();
        assert_eq!(json, "\"changes_requested\"");
    }
}
