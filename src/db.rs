use crate::error::SyncError;
use crate::model::{Label, PullRequestRecord, ReviewStatus};
use chrono::DateTime;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TOKEN_KEY: &str = "github-pat";
pub const REFRESH_SCHEDULE_KEY: &str = "refresh-interval";
pub const LAST_MIGRATION_KEY: &str = "last-migration";

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub fn db_path() -> Result<PathBuf, SyncError> {
    let base = dirs::data_dir().ok_or_else(|| {
        SyncError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Failed to resolve data_dir()",
        ))
    })?;
    Ok(base.join("prwatch").join("prs.sqlite"))
}

pub fn open_db(path: &Path) -> Result<Connection, SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_memory_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    init_schema(&conn).unwrap();
    conn
}

fn init_schema(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS prs (
  pr_key TEXT PRIMARY KEY,        -- "{owner}/{name}#{number}"
  id TEXT NOT NULL,               -- GitHub node id
  owner TEXT NOT NULL,
  name TEXT NOT NULL,
  number INTEGER NOT NULL,
  title TEXT NOT NULL,
  url TEXT NOT NULL,
  updated_at_unix INTEGER NOT NULL,
  is_draft INTEGER NOT NULL DEFAULT 0,
  review_status TEXT NOT NULL,    -- not_reviewed | pending | approved | changes_requested | commented | unknown
  labels_json TEXT,
  last_seen_at INTEGER
);

CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#,
    )?;
    Ok(())
}

pub fn get_value(conn: &Connection, key: &str) -> Result<Option<String>, SyncError> {
    let value = conn
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value)
}

pub fn set_value(conn: &Connection, key: &str, value: &str) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn remove_value(conn: &Connection, key: &str) -> Result<(), SyncError> {
    conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
    Ok(())
}

fn labels_to_db_json(labels: &[Label]) -> Option<String> {
    if labels.is_empty() {
        return None;
    }
    serde_json::to_string(labels).ok()
}

fn parse_labels_json(s: Option<&str>) -> Vec<Label> {
    let Some(s) = s else { return Vec::new() };
    serde_json::from_str::<Vec<Label>>(s).unwrap_or_else(|_| Vec::new())
}

/// Rows come back in insertion (rowid) order.
pub fn load_all_prs(conn: &Connection) -> Result<Vec<PullRequestRecord>, SyncError> {
    let mut stmt = conn.prepare(
        r#"
SELECT
  pr_key, id, owner, name, number, title, url,
  updated_at_unix, is_draft, review_status, labels_json
FROM prs
ORDER BY rowid
"#,
    )?;

    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let updated_at_unix: i64 = row.get(7)?;
        let is_draft: i64 = row.get(8)?;
        let review_status: String = row.get(9)?;
        let labels_json: Option<String> = row.get(10)?;
        out.push(PullRequestRecord {
            key: row.get(0)?,
            id: row.get(1)?,
            owner: row.get(2)?,
            name: row.get(3)?,
            number: row.get(4)?,
            title: row.get(5)?,
            html_url: row.get(6)?,
            updated_at: DateTime::from_timestamp(updated_at_unix, 0).unwrap_or_default(),
            draft: is_draft != 0,
            review_status: ReviewStatus::parse(&review_status),
            labels: parse_labels_json(labels_json.as_deref()),
        });
    }
    Ok(out)
}

pub fn count_prs(conn: &Connection) -> Result<i64, SyncError> {
    let n = conn.query_row("SELECT COUNT(*) FROM prs", [], |row| row.get(0))?;
    Ok(n)
}

pub fn upsert_pr(conn: &Connection, pr: &PullRequestRecord, last_seen_at: i64) -> Result<(), SyncError> {
    conn.execute(
        r#"
INSERT INTO prs (
  pr_key, id, owner, name, number, title, url,
  updated_at_unix, is_draft, review_status, labels_json,
  last_seen_at
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6, ?7,
  ?8, ?9, ?10, ?11,
  ?12
)
ON CONFLICT(pr_key) DO UPDATE SET
  id = excluded.id,
  owner = excluded.owner,
  name = excluded.name,
  number = excluded.number,
  title = excluded.title,
  url = excluded.url,
  updated_at_unix = excluded.updated_at_unix,
  is_draft = excluded.is_draft,
  review_status = excluded.review_status,
  labels_json = excluded.labels_json,
  last_seen_at = excluded.last_seen_at
"#,
        params![
            pr.key,
            pr.id,
            pr.owner,
            pr.name,
            pr.number,
            pr.title,
            pr.html_url,
            pr.updated_at.timestamp(),
            pr.draft as i64,
            pr.review_status.as_str(),
            labels_to_db_json(&pr.labels),
            last_seen_at
        ],
    )?;
    Ok(())
}

pub fn delete_prs_not_in(conn: &Connection, keep_pr_keys: &[String]) -> Result<usize, SyncError> {
    if keep_pr_keys.is_empty() {
        let n = conn.execute("DELETE FROM prs", [])?;
        return Ok(n);
    }

    let placeholders = (0..keep_pr_keys.len())
        .map(|_| "?")
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!("DELETE FROM prs WHERE pr_key NOT IN ({placeholders})");

    let mut stmt = conn.prepare(&sql)?;
    let refs: Vec<&str> = keep_pr_keys.iter().map(|s| s.as_str()).collect();
    let n = stmt.execute(rusqlite::params_from_iter(refs))?;
    Ok(n)
}

/// Upserts `prs` and drops every other row in one transaction.
pub fn replace_prs(conn: &mut Connection, prs: &[PullRequestRecord], seen_at: i64) -> Result<usize, SyncError> {
    let tx = conn.transaction()?;
    for pr in prs {
        upsert_pr(&tx, pr, seen_at)?;
    }
    let keep: Vec<String> = prs.iter().map(|p| p.key.clone()).collect();
    let removed = delete_prs_not_in(&tx, &keep)?;
    tx.commit()?;
    Ok(removed)
}
