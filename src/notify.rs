//! Cross-platform OS notifications for PRs that start waiting on you.
//!
//! Uses notify-rust which supports:
//! - macOS: Native Notification Center
//! - Linux: D-Bus (freedesktop.org standard)
//! - Windows: Toast Notifications

use crate::model::{PullRequestRecord, ReviewStatus};
use log::debug;
use notify_rust::Notification;

/// Above this many new PRs, one summary replaces the individual notifications.
const SUMMARY_THRESHOLD: usize = 3;

/// Send a notification for a new review request.
pub fn notify_review_requested(pr_title: &str, repo: &str) {
    if let Err(e) = Notification::new()
        .summary("Review Requested")
        .body(&format!("{}\n{}", repo, truncate(pr_title, 50)))
        .icon("dialog-information")
        .timeout(5000)
        .show()
    {
        debug!("Notification failed: {e}");
    }
}

/// Send a summary notification when several PRs need a review at once.
pub fn notify_review_summary(count: usize) {
    let body = if count == 1 {
        "1 PR is waiting on your review".to_string()
    } else {
        format!("{} PRs are waiting on your review", count)
    };
    if let Err(e) = Notification::new()
        .summary("prwatch: Reviews Waiting")
        .body(&body)
        .icon("dialog-warning")
        .timeout(5000)
        .show()
    {
        debug!("Notification failed: {e}");
    }
}

/// Newly cached PRs that wait on the user's review.
pub fn waiting_on_review(added: &[PullRequestRecord]) -> Vec<&PullRequestRecord> {
    added
        .iter()
        .filter(|pr| pr.review_status == ReviewStatus::Pending && !pr.draft)
        .collect()
}

pub fn notify_new_review_requests(added: &[PullRequestRecord]) {
    let waiting = waiting_on_review(added);
    if waiting.len() > SUMMARY_THRESHOLD {
        notify_review_summary(waiting.len());
    } else {
        for pr in waiting {
            notify_review_requested(&pr.title, &pr.repo_full_name());
        }
    }
}

/// Truncate a string to a maximum number of characters, adding ellipsis if needed.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(1)).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::tests::node;
    use crate::github::to_record;

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(truncate("ééééé", 3), "éé…");
    }

    #[test]
    fn only_pending_non_drafts_are_announced() {
        let mut pending = to_record(node(1, "2024-05-02T01:00:00Z"), "me");
        pending.review_status = ReviewStatus::Pending;
        let mut draft = pending.clone();
        draft.draft = true;
        let not_reviewed = to_record(node(2, "2024-05-02T01:00:00Z"), "me");

        let added = vec![pending, draft, not_reviewed];
        let waiting = waiting_on_review(&added);
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].number, 1);
    }
}
