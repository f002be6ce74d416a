use crate::credentials::Token;
use crate::error::SyncError;
use crate::model::{Label, PullRequestRecord, pr_key};
use crate::review::{ReviewInput, head_commit_time, resolve_status};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;

pub const USER_AGENT: &str = concat!("prwatch/v", env!("CARGO_PKG_VERSION"));

/// Thin wrapper over octocrab; implements both the GraphQL and REST seams.
#[derive(Clone)]
pub struct GitHubClient {
    pub(crate) octo: Octocrab,
}

impl GitHubClient {
    pub fn new(token: &Token) -> Result<Self, SyncError> {
        let octo = Octocrab::builder()
            .personal_token(token.expose().to_string())
            .add_header(http::header::USER_AGENT, USER_AGENT.to_string())
            .build()?;
        Ok(Self { octo })
    }
}

#[derive(Debug, serde::Serialize)]
struct GraphQlPayload<V> {
    query: &'static str,
    variables: V,
}

#[derive(Debug, serde::Deserialize)]
struct GraphQlErrorMessage {
    message: String,
}

#[derive(Debug, serde::Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlErrorMessage>>,
}

impl<T> GraphQlResponse<T> {
    fn into_data(self, what: &str) -> Result<T, SyncError> {
        if let Some(errors) = self.errors.filter(|e| !e.is_empty()) {
            let joined = errors.into_iter().map(|e| e.message).collect::<Vec<_>>().join("; ");
            return Err(SyncError::github_api(format!("{what}: {joined}"), None));
        }
        self.data
            .ok_or_else(|| SyncError::github_api(format!("{what}: response has no data"), None))
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PageInfo {
    #[serde(rename = "hasNextPage")]
    pub has_next_page: bool,
    #[serde(rename = "endCursor")]
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RepoOwner {
    pub login: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: RepoOwner,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Actor {
    pub login: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Connection<T> {
    pub nodes: Option<Vec<T>>,
}

impl<T> Connection<T> {
    fn items(&self) -> &[T] {
        self.nodes.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReviewRequestNode {
    #[serde(rename = "requestedReviewer")]
    pub requested_reviewer: Option<RequestedReviewer>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RequestedReviewer {
    #[serde(rename = "__typename")]
    pub typename: Option<String>,
    pub login: Option<String>, // User
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ReviewNode {
    pub author: Option<Actor>,
    pub state: String,
    #[serde(rename = "submittedAt")]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CommitInner {
    #[serde(rename = "committedDate")]
    pub committed_date: Option<DateTime<Utc>>,
    #[serde(rename = "authoredDate")]
    pub authored_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CommitNode {
    pub commit: Option<CommitInner>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct LabelNode {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PullRequestNode {
    pub id: String,
    pub number: i64,
    pub title: String,
    pub url: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    pub repository: Repository,
    #[serde(rename = "isDraft")]
    pub is_draft: bool,
    #[serde(rename = "reviewRequests")]
    pub review_requests: Option<Connection<ReviewRequestNode>>,
    pub reviews: Option<Connection<ReviewNode>>,
    pub commits: Option<Connection<CommitNode>>,
    pub labels: Option<Connection<LabelNode>>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SearchNode {
    #[serde(rename = "__typename")]
    typename: Option<String>,
    #[serde(flatten)]
    fields: serde_json::Value,
}

impl SearchNode {
    /// Search also returns issues; those come back without pull request fields.
    /// A pull request node that does not decode fails the whole page.
    fn into_pull_request(self) -> Result<Option<PullRequestNode>, SyncError> {
        if self.typename.as_deref() != Some("PullRequest") {
            return Ok(None);
        }
        let number = self.fields.get("number").cloned().unwrap_or_default();
        serde_json::from_value(self.fields).map(Some).map_err(|e| {
            SyncError::github_api(format!("malformed pull request {number} in search results: {e}"), None)
        })
    }
}

fn collect_pull_requests(nodes: Vec<SearchNode>) -> Result<Vec<PullRequestNode>, SyncError> {
    nodes
        .into_iter()
        .filter_map(|n| n.into_pull_request().transpose())
        .collect()
}

#[derive(Debug, serde::Deserialize)]
struct SearchResult {
    #[serde(rename = "pageInfo")]
    page_info: PageInfo,
    nodes: Option<Vec<SearchNode>>,
}

#[derive(Debug, serde::Deserialize)]
struct SearchData {
    search: SearchResult,
}

#[derive(Debug, serde::Deserialize)]
struct Viewer {
    login: String,
}

#[derive(Debug, serde::Deserialize)]
struct ViewerData {
    viewer: Viewer,
}

#[derive(Debug, Clone)]
pub struct SearchPage {
    pub nodes: Vec<PullRequestNode>,
    pub page_info: PageInfo,
}

const VIEWER_QUERY: &str = "query { viewer { login } }";

const PULL_REQUESTS_QUERY: &str = r#"
query($search_query: String!, $page_size: Int!, $cursor: String, $author: String!, $review_window: Int!) {
  search(query: $search_query, type: ISSUE, first: $page_size, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    nodes {
      __typename
      ... on PullRequest {
        id
        number
        title
        url
        updatedAt
        isDraft
        repository { name owner { login } }
        reviewRequests(first: 25) {
          nodes {
            requestedReviewer {
              __typename
              ... on User { login }
            }
          }
        }
        reviews(last: $review_window, author: $author) {
          nodes {
            author { login }
            state
            submittedAt
          }
        }
        commits(last: 1) {
          nodes { commit { committedDate authoredDate } }
        }
        labels(first: 10) {
          nodes { name color }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchVars {
    pub search_query: String,
    pub page_size: i32,
    pub cursor: Option<String>,
    pub author: String,
    pub review_window: i32,
}

#[async_trait]
pub trait GraphQlApi: Send + Sync {
    async fn viewer_login(&self) -> Result<String, SyncError>;
    async fn search_pull_requests(&self, vars: SearchVars) -> Result<SearchPage, SyncError>;
}

#[async_trait]
impl GraphQlApi for GitHubClient {
    async fn viewer_login(&self) -> Result<String, SyncError> {
        let payload = GraphQlPayload {
            query: VIEWER_QUERY,
            variables: serde_json::json!({}),
        };
        let resp: GraphQlResponse<ViewerData> = self.octo.graphql(&payload).await?;
        Ok(resp.into_data("viewer query")?.viewer.login)
    }

    async fn search_pull_requests(&self, vars: SearchVars) -> Result<SearchPage, SyncError> {
        let payload = GraphQlPayload {
            query: PULL_REQUESTS_QUERY,
            variables: vars,
        };
        let resp: GraphQlResponse<SearchData> = self.octo.graphql(&payload).await?;
        let search = resp.into_data("pull request search")?.search;
        let nodes = collect_pull_requests(search.nodes.unwrap_or_default())?;
        Ok(SearchPage {
            nodes,
            page_info: search.page_info,
        })
    }
}

fn requested_logins(node: &PullRequestNode) -> Vec<String> {
    let Some(rr) = &node.review_requests else { return Vec::new() };
    rr.items()
        .iter()
        .filter_map(|n| n.requested_reviewer.as_ref())
        .filter(|r| r.typename.as_deref().is_none_or(|t| t == "User"))
        .filter_map(|r| r.login.clone())
        .collect()
}

fn review_inputs(node: &PullRequestNode, viewer_login: &str) -> Vec<ReviewInput> {
    let Some(reviews) = &node.reviews else { return Vec::new() };
    reviews
        .items()
        .iter()
        .map(|r| ReviewInput {
            // `reviews(author:)` already filters; a missing author is the viewer.
            author: r
                .author
                .as_ref()
                .map(|a| a.login.clone())
                .unwrap_or_else(|| viewer_login.to_string()),
            state: r.state.clone(),
            submitted_at: r.submitted_at,
        })
        .collect()
}

fn head_commit_at(node: &PullRequestNode) -> DateTime<Utc> {
    let commit = node
        .commits
        .as_ref()
        .and_then(|c| c.items().last())
        .and_then(|c| c.commit.as_ref());
    head_commit_time(
        commit.and_then(|c| c.committed_date),
        commit.and_then(|c| c.authored_date),
        node.updated_at,
    )
}

pub fn to_record(node: PullRequestNode, viewer_login: &str) -> PullRequestRecord {
    let review_status = resolve_status(
        &review_inputs(&node, viewer_login),
        &requested_logins(&node),
        head_commit_at(&node),
        viewer_login,
    );
    let labels = node
        .labels
        .as_ref()
        .map(|l| {
            l.items()
                .iter()
                .map(|n| Label {
                    name: n.name.clone(),
                    color: n.color.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    let owner = node.repository.owner.login;
    let name = node.repository.name;

    PullRequestRecord {
        key: pr_key(&owner, &name, node.number),
        id: node.id,
        number: node.number,
        title: node.title,
        updated_at: node.updated_at,
        html_url: node.url,
        owner,
        name,
        draft: node.is_draft,
        review_status,
        labels,
    }
}
