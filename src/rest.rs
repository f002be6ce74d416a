//! REST transport: issue search plus the per-PR detail, review and commit
//! endpoints the review resolver needs.

use crate::error::SyncError;
use crate::github::GitHubClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// GitHub never returns more than this many search results, whatever the paging.
pub const SEARCH_RESULT_CAP: u64 = 1000;

const REVIEWS_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct UserRef {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadRef {
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullDetail {
    pub head: HeadRef,
    #[serde(default)]
    pub requested_reviewers: Vec<UserRef>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestReview {
    pub user: Option<UserRef>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitActor {
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitDetail {
    pub committer: Option<GitActor>,
    pub author: Option<GitActor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestCommit {
    pub commit: CommitDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueLabel {
    pub name: String,
    #[serde(default)]
    pub color: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueSearchItem {
    pub node_id: String,
    pub number: i64,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub html_url: String,
    pub repository_url: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub labels: Vec<IssueLabel>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssueSearchPage {
    pub total_count: u64,
    #[serde(default)]
    pub incomplete_results: bool,
    pub items: Vec<IssueSearchItem>,
}

#[async_trait]
pub trait RestApi: Send + Sync {
    async fn authenticated_login(&self) -> Result<String, SyncError>;
    async fn search_issues(&self, query: &str, page: u32, per_page: u32) -> Result<IssueSearchPage, SyncError>;
    async fn pull_detail(&self, owner: &str, repo: &str, number: i64) -> Result<PullDetail, SyncError>;
    async fn pull_reviews(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<RestReview>, SyncError>;
    async fn commit(&self, owner: &str, repo: &str, sha: &str) -> Result<RestCommit, SyncError>;
}

#[derive(Debug, Serialize)]
struct SearchParams<'a> {
    q: &'a str,
    sort: &'a str,
    order: &'a str,
    per_page: u32,
    page: u32,
}

#[derive(Debug, Serialize)]
struct PageParams {
    per_page: u32,
    page: u32,
}

#[async_trait]
impl RestApi for GitHubClient {
    async fn authenticated_login(&self) -> Result<String, SyncError> {
        let user: UserRef = self.octo.get("/user", None::<&()>).await?;
        Ok(user.login)
    }

    async fn search_issues(&self, query: &str, page: u32, per_page: u32) -> Result<IssueSearchPage, SyncError> {
        let params = SearchParams {
            q: query,
            sort: "updated",
            order: "desc",
            per_page,
            page,
        };
        let result: IssueSearchPage = self.octo.get("/search/issues", Some(&params)).await?;
        Ok(result)
    }

    async fn pull_detail(&self, owner: &str, repo: &str, number: i64) -> Result<PullDetail, SyncError> {
        let route = format!("/repos/{owner}/{repo}/pulls/{number}");
        let detail: PullDetail = self.octo.get(route, None::<&()>).await?;
        Ok(detail)
    }

    async fn pull_reviews(&self, owner: &str, repo: &str, number: i64) -> Result<Vec<RestReview>, SyncError> {
        let route = format!("/repos/{owner}/{repo}/pulls/{number}/reviews");
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let params = PageParams {
                per_page: REVIEWS_PER_PAGE,
                page,
            };
            let batch: Vec<RestReview> = self.octo.get(&route, Some(&params)).await?;
            let n = batch.len();
            out.extend(batch);
            if n < REVIEWS_PER_PAGE as usize {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    async fn commit(&self, owner: &str, repo: &str, sha: &str) -> Result<RestCommit, SyncError> {
        let route = format!("/repos/{owner}/{repo}/commits/{sha}");
        let commit: RestCommit = self.octo.get(route, None::<&()>).await?;
        Ok(commit)
    }
}
