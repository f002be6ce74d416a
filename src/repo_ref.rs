//! Extracts `{owner, name}` from GitHub web and API URLs.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w.-]+$").unwrap());

const GITHUB_HOSTS: [&str; 2] = ["github.com", "api.github.com"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Empty owner or name means the URL could not be mapped to a repository.
    pub fn is_resolved(&self) -> bool {
        !self.owner.is_empty() && !self.name.is_empty()
    }
}

/// Never fails: anything that is not a GitHub repository URL yields empty parts.
pub fn parse_repo_ref(url: &str) -> RepoRef {
    try_parse(url).unwrap_or_default()
}

fn try_parse(raw: &str) -> Option<RepoRef> {
    let url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    if !GITHUB_HOSTS.contains(&host) {
        return None;
    }

    let mut segments = url.path_segments()?.filter(|s| !s.is_empty()).peekable();
    if segments.peek() == Some(&"repos") {
        segments.next();
    }
    let owner = segments.next()?;
    let name = segments.next()?;
    if !SEGMENT.is_match(owner) || !SEGMENT.is_match(name) {
        return None;
    }
    Some(RepoRef {
        owner: owner.to_string(),
        name: name.to_string(),
    })
}
