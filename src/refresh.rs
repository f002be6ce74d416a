use crate::db::{load_all_prs, now_unix, replace_prs};
use crate::error::SyncError;
use crate::github::{GraphQlApi, SearchVars, to_record};
use crate::model::{Label, PullRequestRecord, ReviewStatus, pr_key};
use crate::repo_ref::parse_repo_ref;
use crate::rest::{IssueSearchItem, RestApi, SEARCH_RESULT_CAP};
use crate::review::ReviewResolver;
use log::{debug, warn};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;
pub const DEFAULT_REVIEW_WINDOW: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SearchScope {
    /// Authored, assigned, mentioned or commented on by you.
    Involves,
    /// Waiting on a review from you.
    ReviewRequested,
}

impl SearchScope {
    pub fn qualifier(&self) -> &'static str {
        match self {
            SearchScope::Involves => "involves:@me",
            SearchScope::ReviewRequested => "review-requested:@me",
        }
    }

    pub fn search_query(&self) -> String {
        format!("type:pr state:open {}", self.qualifier())
    }
}

/// Drops repeated scopes, keeping first-seen order.
pub fn dedup_scopes(scopes: Vec<SearchScope>) -> Vec<SearchScope> {
    let mut seen = HashSet::new();
    scopes.into_iter().filter(|s| seen.insert(*s)).collect()
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub scopes: Vec<SearchScope>,
    pub page_size: u32,
    pub review_window: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            scopes: vec![SearchScope::Involves],
            page_size: DEFAULT_PAGE_SIZE,
            review_window: DEFAULT_REVIEW_WINDOW,
        }
    }
}

impl FetchOptions {
    fn page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone)]
pub struct FetchReport {
    pub total: usize,
    /// Records that were not in the cache before this cycle.
    pub added: Vec<PullRequestRecord>,
    pub removed: Vec<String>,
    pub duration: Duration,
}

/// Dedupes by cache key; a later sighting replaces the earlier one in place.
#[derive(Default)]
struct RecordSet {
    records: Vec<PullRequestRecord>,
    index: HashMap<String, usize>,
}

impl RecordSet {
    fn insert(&mut self, record: PullRequestRecord) {
        match self.index.get(&record.key) {
            Some(&i) => self.records[i] = record,
            None => {
                self.index.insert(record.key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    fn into_vec(self) -> Vec<PullRequestRecord> {
        self.records
    }
}

pub async fn fetch_graphql(
    api: &dyn GraphQlApi,
    options: &FetchOptions,
    viewer_login: &str,
) -> Result<Vec<PullRequestRecord>, SyncError> {
    let mut out = RecordSet::default();

    for scope in &options.scopes {
        let mut cursor: Option<String> = None;
        let mut page_no = 0u32;
        loop {
            let vars = SearchVars {
                search_query: scope.search_query(),
                page_size: options.page_size() as i32,
                cursor: cursor.clone(),
                author: viewer_login.to_string(),
                review_window: options.review_window.max(1) as i32,
            };
            let page = api.search_pull_requests(vars).await?;
            page_no += 1;
            debug!(
                "{}: page {page_no} returned {} pull requests",
                scope.qualifier(),
                page.nodes.len()
            );

            for node in page.nodes {
                out.insert(to_record(node, viewer_login));
            }

            if !page.page_info.has_next_page {
                break;
            }
            cursor = page.page_info.end_cursor;
            if cursor.is_none() {
                break;
            }
        }
    }

    Ok(out.into_vec())
}

fn rest_record(item: IssueSearchItem, review_status: ReviewStatus) -> PullRequestRecord {
    let mut repo = parse_repo_ref(&item.repository_url);
    if !repo.is_resolved() {
        repo = parse_repo_ref(&item.html_url);
    }
    let key = if repo.is_resolved() {
        pr_key(&repo.owner, &repo.name, item.number)
    } else {
        format!("{}#{}", item.node_id, item.number)
    };
    PullRequestRecord {
        key,
        id: item.node_id,
        number: item.number,
        title: item.title,
        updated_at: item.updated_at,
        html_url: item.html_url,
        owner: repo.owner,
        name: repo.name,
        draft: item.draft,
        review_status,
        labels: item
            .labels
            .into_iter()
            .map(|l| Label {
                name: l.name,
                color: l.color,
            })
            .collect(),
    }
}

pub async fn fetch_rest(
    api: &dyn RestApi,
    options: &FetchOptions,
    viewer_login: &str,
) -> Result<Vec<PullRequestRecord>, SyncError> {
    let resolver = ReviewResolver::new(api);
    let per_page = options.page_size();
    let mut out = RecordSet::default();

    for scope in &options.scopes {
        let query = scope.search_query();
        let mut page = 1u32;
        let mut seen = 0u64;
        loop {
            let result = api.search_issues(&query, page, per_page).await?;
            if result.incomplete_results {
                warn!("{}: GitHub reported incomplete search results", scope.qualifier());
            }
            let n = result.items.len();
            debug!("{}: page {page} returned {n} pull requests", scope.qualifier());

            for item in result.items {
                let repo = parse_repo_ref(&item.repository_url);
                let status = match resolver.resolve(&repo, item.number, viewer_login).await {
                    Ok(ReviewStatus::Unknown) => {
                        warn!("Cannot map {} to a repository; review status unknown", item.repository_url);
                        ReviewStatus::Unknown
                    }
                    Ok(status) => status,
                    Err(e) if e.is_authentication() => return Err(e),
                    Err(e) => {
                        warn!("Review status for {} unavailable: {e}", item.html_url);
                        ReviewStatus::Unknown
                    }
                };
                out.insert(rest_record(item, status));
            }

            seen += n as u64;
            let reachable = result.total_count.min(SEARCH_RESULT_CAP);
            if n < per_page as usize || seen >= reachable {
                break;
            }
            page += 1;
        }
    }

    Ok(out.into_vec())
}

/// Writes one fetch cycle into the cache. Either every change lands or none does.
pub fn reconcile(
    conn: &mut Connection,
    records: Vec<PullRequestRecord>,
    duration: Duration,
) -> Result<FetchReport, SyncError> {
    let before: HashSet<String> = load_all_prs(conn)?.into_iter().map(|p| p.key).collect();
    let seen: HashSet<&str> = records.iter().map(|p| p.key.as_str()).collect();

    let added: Vec<PullRequestRecord> = records
        .iter()
        .filter(|p| !before.contains(&p.key))
        .cloned()
        .collect();
    let mut removed: Vec<String> = before
        .iter()
        .filter(|k| !seen.contains(k.as_str()))
        .cloned()
        .collect();
    removed.sort();

    replace_prs(conn, &records, now_unix())?;

    Ok(FetchReport {
        total: records.len(),
        added,
        removed,
        duration,
    })
}

/// Cache contents, most recently updated first. Equal timestamps keep insertion order.
pub fn load_sorted(conn: &Connection) -> Result<Vec<PullRequestRecord>, SyncError> {
    let mut prs = load_all_prs(conn)?;
    prs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(prs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_db;
    use crate::github::tests::{FakeGraphQl, node};
    use crate::rest::IssueSearchPage;
    use crate::rest::tests::{FakeRest, search_item};
    use chrono::{TimeZone, Utc};

    fn at(h: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, h, 0, 0).unwrap()
    }

    #[test]
    fn scopes_build_search_queries() {
        assert_eq!(SearchScope::Involves.search_query(), "type:pr state:open involves:@me");
        assert_eq!(
            SearchScope::ReviewRequested.search_query(),
            "type:pr state:open review-requested:@me"
        );
    }

    #[test]
    fn dedup_scopes_drops_non_adjacent_repeats() {
        let scopes = vec![SearchScope::Involves, SearchScope::ReviewRequested, SearchScope::Involves];
        assert_eq!(
            dedup_scopes(scopes),
            vec![SearchScope::Involves, SearchScope::ReviewRequested]
        );
    }

    #[tokio::test]
    async fn graphql_follows_cursor_until_last_page() {
        let api = FakeGraphQl::default();
        api.push_page(vec![node(1, "2024-05-02T01:00:00Z"), node(2, "2024-05-02T02:00:00Z")], Some("c1"));
        api.push_page(vec![node(3, "2024-05-02T03:00:00Z")], None);

        let prs = fetch_graphql(&api, &FetchOptions::default(), "me").await.unwrap();
        let numbers: Vec<i64> = prs.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(api.cursors(), vec![None, Some("c1".to_string())]);
    }

    #[tokio::test]
    async fn graphql_dedupes_across_scopes() {
        let api = FakeGraphQl::default();
        api.push_page(vec![node(1, "2024-05-02T01:00:00Z"), node(2, "2024-05-02T02:00:00Z")], None);
        api.push_page(vec![node(2, "2024-05-02T05:00:00Z")], None);
        let options = FetchOptions {
            scopes: vec![SearchScope::Involves, SearchScope::ReviewRequested],
            ..FetchOptions::default()
        };

        let prs = fetch_graphql(&api, &options, "me").await.unwrap();
        assert_eq!(prs.len(), 2);
        assert_eq!(prs[1].updated_at, at(5));
        assert_eq!(
            api.queries(),
            vec![
                "type:pr state:open involves:@me".to_string(),
                "type:pr state:open review-requested:@me".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn graphql_page_error_aborts() {
        let api = FakeGraphQl::default();
        api.push_page(vec![node(1, "2024-05-02T01:00:00Z")], Some("c1"));
        api.push_error("connection reset");
        let err = fetch_graphql(&api, &FetchOptions::default(), "me").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn rest_pages_and_resolves_status() {
        let api = FakeRest::default();
        let options = FetchOptions {
            page_size: 2,
            ..FetchOptions::default()
        };
        api.push_search_page(Ok(IssueSearchPage {
            total_count: 3,
            incomplete_results: false,
            items: vec![search_item("acme", "widget", 1, at(1)), search_item("acme", "widget", 2, at(2))],
        }));
        api.push_search_page(Ok(IssueSearchPage {
            total_count: 3,
            incomplete_results: false,
            items: vec![search_item("acme", "gadget", 3, at(3))],
        }));
        api.add_pull("acme", "widget", 1, "s1", &["me"], at(1));
        api.add_pull("acme", "widget", 2, "s2", &[], at(2));
        api.add_review("acme", "widget", 2, "me", "APPROVED", at(4));
        api.add_commit("acme", "widget", "s2", Some(at(2)), None);
        // #3 has no pull detail: the resolver fails and the PR degrades to Unknown.

        let prs = fetch_rest(&api, &options, "me").await.unwrap();
        let statuses: Vec<(String, ReviewStatus)> =
            prs.iter().map(|p| (p.key.clone(), p.review_status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("acme/widget#1".to_string(), ReviewStatus::Pending),
                ("acme/widget#2".to_string(), ReviewStatus::Approved),
                ("acme/gadget#3".to_string(), ReviewStatus::Unknown),
            ]
        );
        assert_eq!(prs[0].labels[0].name, "infra");
    }

    #[tokio::test]
    async fn rest_stops_at_search_result_cap() {
        let api = FakeRest::default();
        // GitHub keeps reporting more matches than search will ever return.
        for page in 0..11i64 {
            api.push_search_page(Ok(IssueSearchPage {
                total_count: 5000,
                incomplete_results: false,
                items: (1..=100).map(|i| search_item("acme", "widget", page * 100 + i, at(1))).collect(),
            }));
        }
        let options = FetchOptions {
            page_size: 100,
            ..FetchOptions::default()
        };

        let prs = fetch_rest(&api, &options, "me").await.unwrap();
        assert_eq!(prs.len() as u64, SEARCH_RESULT_CAP);
        assert_eq!(prs.last().map(|p| p.number), Some(1000));
    }

    #[tokio::test]
    async fn rest_unresolvable_repository_is_unknown() {
        let api = FakeRest::default();
        let mut item = search_item("acme", "widget", 9, at(1));
        item.repository_url = "https://example.com/elsewhere".to_string();
        api.push_search_page(Ok(IssueSearchPage { total_count: 1, incomplete_results: false, items: vec![item] }));

        let prs = fetch_rest(&api, &FetchOptions::default(), "me").await.unwrap();
        assert_eq!(prs[0].review_status, ReviewStatus::Unknown);
        // The key still comes from the web URL.
        assert_eq!(prs[0].key, "acme/widget#9");
    }

    #[tokio::test]
    async fn rest_authentication_failure_propagates() {
        let api = FakeRest::default();
        api.push_search_page(Ok(IssueSearchPage {
            total_count: 1,
            incomplete_results: false,
            items: vec![search_item("acme", "widget", 1, at(1))],
        }));
        *api.fail_detail_with.lock().unwrap() = Some(401);
        let err = fetch_rest(&api, &FetchOptions::default(), "me").await.unwrap_err();
        assert!(err.is_authentication());
    }

    fn record(number: i64, title: &str, updated: chrono::DateTime<Utc>) -> PullRequestRecord {
        let mut r = to_record(node(number, "2024-05-02T00:00:00Z"), "me");
        r.title = title.to_string();
        r.updated_at = updated;
        r
    }

    #[test]
    fn reconcile_replaces_previous_cycle() {
        let mut conn = open_memory_db();
        reconcile(
            &mut conn,
            vec![record(1, "one", at(1)), record(2, "two", at(2)), record(3, "three", at(3))],
            Duration::ZERO,
        )
        .unwrap();

        let report = reconcile(
            &mut conn,
            vec![record(2, "two v2", at(6)), record(3, "three", at(3)), record(4, "four", at(4))],
            Duration::ZERO,
        )
        .unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.removed, vec!["acme/widget#1".to_string()]);
        assert_eq!(report.added.iter().map(|p| p.number).collect::<Vec<_>>(), vec![4]);

        let cached = load_sorted(&conn).unwrap();
        let summary: Vec<(i64, &str)> = cached.iter().map(|p| (p.number, p.title.as_str())).collect();
        assert_eq!(summary, vec![(2, "two v2"), (4, "four"), (3, "three")]);
    }

    #[test]
    fn load_sorted_is_stable_for_equal_timestamps() {
        let mut conn = open_memory_db();
        reconcile(
            &mut conn,
            vec![record(5, "a", at(1)), record(6, "b", at(1)), record(7, "c", at(2))],
            Duration::ZERO,
        )
        .unwrap();
        let order: Vec<i64> = load_sorted(&conn).unwrap().iter().map(|p| p.number).collect();
        assert_eq!(order, vec![7, 5, 6]);
    }
}
