//! Review status of a pull request from one reviewer's point of view.
//!
//! A review only counts while it is newer than the head commit: once new
//! commits land, an earlier approval (or change request) goes back to
//! `Pending`.

use crate::error::SyncError;
use crate::model::ReviewStatus;
use crate::repo_ref::RepoRef;
use crate::rest::RestApi;
use chrono::{DateTime, Utc};
use log::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewInput {
    pub author: String,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

fn map_review_state(state: &str) -> ReviewStatus {
    match state.to_ascii_uppercase().as_str() {
        "APPROVED" => ReviewStatus::Approved,
        "CHANGES_REQUESTED" => ReviewStatus::ChangesRequested,
        "COMMENTED" => ReviewStatus::Commented,
        "PENDING" => ReviewStatus::Pending,
        _ => ReviewStatus::NotReviewed,
    }
}

/// Committer date, else author date, else the PR's own `updated_at`.
pub fn head_commit_time(
    committed: Option<DateTime<Utc>>,
    authored: Option<DateTime<Utc>>,
    pr_updated_at: DateTime<Utc>,
) -> DateTime<Utc> {
    committed.or(authored).unwrap_or(pr_updated_at)
}

pub fn resolve_status(
    reviews: &[ReviewInput],
    requested_reviewers: &[String],
    head_commit_at: DateTime<Utc>,
    reviewer: &str,
) -> ReviewStatus {
    // Unsubmitted (draft) reviews carry no timestamp and are ignored.
    let latest = reviews
        .iter()
        .filter(|r| r.author.eq_ignore_ascii_case(reviewer))
        .filter_map(|r| r.submitted_at.map(|at| (at, r)))
        .max_by_key(|(at, _)| *at);

    let Some((submitted_at, review)) = latest else {
        let requested = requested_reviewers
            .iter()
            .any(|login| login.eq_ignore_ascii_case(reviewer));
        return if requested {
            ReviewStatus::Pending
        } else {
            ReviewStatus::NotReviewed
        };
    };

    if submitted_at < head_commit_at {
        return ReviewStatus::Pending;
    }
    map_review_state(&review.state)
}

/// Resolves review status through the REST endpoints, one PR at a time.
pub struct ReviewResolver<'a> {
    api: &'a dyn RestApi,
}

impl<'a> ReviewResolver<'a> {
    pub fn new(api: &'a dyn RestApi) -> Self {
        Self { api }
    }

    pub async fn resolve(&self, repo: &RepoRef, number: i64, reviewer: &str) -> Result<ReviewStatus, SyncError> {
        if !repo.is_resolved() {
            return Ok(ReviewStatus::Unknown);
        }
        let detail = self.api.pull_detail(&repo.owner, &repo.name, number).await?;
        let reviews: Vec<ReviewInput> = self
            .api
            .pull_reviews(&repo.owner, &repo.name, number)
            .await?
            .into_iter()
            .map(|r| ReviewInput {
                author: r.user.map(|u| u.login).unwrap_or_default(),
                state: r.state,
                submitted_at: r.submitted_at,
            })
            .collect();
        let requested: Vec<String> = detail
            .requested_reviewers
            .iter()
            .map(|u| u.login.clone())
            .collect();

        let has_own_review = reviews
            .iter()
            .any(|r| r.author.eq_ignore_ascii_case(reviewer) && r.submitted_at.is_some());
        let head_at = if has_own_review {
            let commit = self.api.commit(&repo.owner, &repo.name, &detail.head.sha).await?;
            head_commit_time(
                commit.commit.committer.and_then(|c| c.date),
                commit.commit.author.and_then(|a| a.date),
                detail.updated_at,
            )
        } else {
            // Without a review of ours the commit time cannot change the answer.
            detail.updated_at
        };

        let status = resolve_status(&reviews, &requested, head_at, reviewer);
        debug!("{}/{}#{number}: {}", repo.owner, repo.name, status.as_str());
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::tests::FakeRest;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn review(author: &str, state: &str, submitted: Option<DateTime<Utc>>) -> ReviewInput {
        ReviewInput {
            author: author.to_string(),
            state: state.to_string(),
            submitted_at: submitted,
        }
    }

    #[test]
    fn no_review_and_requested_is_pending() {
        let status = resolve_status(&[], &["octo".to_string()], at(10, 0), "octo");
        assert_eq!(status, ReviewStatus::Pending);
    }

    #[test]
    fn no_review_and_not_requested_is_not_reviewed() {
        let others = [review("someone", "APPROVED", Some(at(11, 0)))];
        let status = resolve_status(&others, &["other".to_string()], at(10, 0), "octo");
        assert_eq!(status, ReviewStatus::NotReviewed);
    }

    #[test]
    fn review_before_head_commit_is_stale() {
        for state in ["APPROVED", "CHANGES_REQUESTED", "COMMENTED"] {
            let reviews = [review("octo", state, Some(at(9, 0)))];
            assert_eq!(resolve_status(&reviews, &[], at(10, 0), "octo"), ReviewStatus::Pending);
        }
    }

    #[test]
    fn review_after_head_commit_keeps_its_state() {
        let approved = [review("octo", "APPROVED", Some(at(11, 0)))];
        assert_eq!(resolve_status(&approved, &[], at(10, 0), "octo"), ReviewStatus::Approved);
        assert_eq!(ReviewStatus::Approved.as_str(), "approved");

        let changes = [review("Octo", "changes_requested", Some(at(11, 0)))];
        assert_eq!(
            resolve_status(&changes, &[], at(10, 0), "octo"),
            ReviewStatus::ChangesRequested
        );
    }

    #[test]
    fn same_instant_as_head_commit_is_not_stale() {
        let reviews = [review("octo", "COMMENTED", Some(at(10, 0)))];
        assert_eq!(resolve_status(&reviews, &[], at(10, 0), "octo"), ReviewStatus::Commented);
    }

    #[test]
    fn latest_review_wins_regardless_of_order() {
        let reviews = [
            review("octo", "APPROVED", Some(at(12, 0))),
            review("octo", "CHANGES_REQUESTED", Some(at(11, 0))),
            review("octo", "COMMENTED", None),
        ];
        assert_eq!(resolve_status(&reviews, &[], at(10, 0), "octo"), ReviewStatus::Approved);
    }

    #[test]
    fn dismissed_review_counts_as_not_reviewed() {
        let reviews = [review("octo", "DISMISSED", Some(at(12, 0)))];
        assert_eq!(resolve_status(&reviews, &[], at(10, 0), "octo"), ReviewStatus::NotReviewed);
    }

    #[test]
    fn head_commit_time_falls_back() {
        assert_eq!(head_commit_time(Some(at(1, 0)), Some(at(2, 0)), at(3, 0)), at(1, 0));
        assert_eq!(head_commit_time(None, Some(at(2, 0)), at(3, 0)), at(2, 0));
        assert_eq!(head_commit_time(None, None, at(3, 0)), at(3, 0));
    }

    #[tokio::test]
    async fn rest_resolver_uses_commit_timestamp() {
        let fake = FakeRest::default();
        fake.add_pull("acme", "widget", 5, "abc123", &[], at(8, 0));
        fake.add_review("acme", "widget", 5, "octo", "APPROVED", at(9, 0));
        fake.add_commit("acme", "widget", "abc123", Some(at(9, 30)), None);

        let resolver = ReviewResolver::new(&fake);
        let repo = RepoRef { owner: "acme".into(), name: "widget".into() };
        assert_eq!(resolver.resolve(&repo, 5, "octo").await.unwrap(), ReviewStatus::Pending);

        fake.add_commit("acme", "widget", "abc123", Some(at(8, 30)), None);
        assert_eq!(resolver.resolve(&repo, 5, "octo").await.unwrap(), ReviewStatus::Approved);
    }

    #[tokio::test]
    async fn rest_resolver_requested_without_review() {
        let fake = FakeRest::default();
        fake.add_pull("acme", "widget", 6, "def456", &["octo"], at(8, 0));
        let resolver = ReviewResolver::new(&fake);
        let repo = RepoRef { owner: "acme".into(), name: "widget".into() };
        assert_eq!(resolver.resolve(&repo, 6, "octo").await.unwrap(), ReviewStatus::Pending);
    }

    #[tokio::test]
    async fn unresolved_repo_is_unknown_without_calls() {
        let fake = FakeRest::default();
        let resolver = ReviewResolver::new(&fake);
        let status = resolver.resolve(&RepoRef::default(), 1, "octo").await.unwrap();
        assert_eq!(status, ReviewStatus::Unknown);
        assert_eq!(fake.call_count(), 0);
    }
}
