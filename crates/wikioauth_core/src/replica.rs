use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;

use crate::config::DEFAULT_MAX_SEARCH_RESULTS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaPage {
    pub page_id: i64,
    pub page_title: String,
    pub page_namespace: i64,
    pub page_len: i64,
    pub page_is_redirect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResults {
    pub query: String,
    pub namespace: i64,
    pub count: usize,
    pub results: Vec<ReplicaPage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiStatistics {
    pub total_pages: usize,
    pub content_pages: usize,
    pub redirects: usize,
    pub recent_changes_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentChange {
    pub rc_id: i64,
    pub timestamp: String,
    pub namespace: i64,
    pub title: String,
    pub is_bot: bool,
    pub is_minor: bool,
    pub is_new: bool,
}

/// Read-only handle on a MediaWiki database replica (`page`, `recentchanges`
/// and `user` tables).
#[derive(Debug, Clone)]
pub struct ReplicaDb {
    db_path: PathBuf,
    max_results: usize,
}

impl ReplicaDb {
    pub fn open(db_path: &Path) -> Result<Self> {
        if !db_path.is_file() {
            bail!("wiki replica database not found: {}", db_path.display());
        }
        let replica = Self {
            db_path: db_path.to_path_buf(),
            max_results: DEFAULT_MAX_SEARCH_RESULTS,
        };
        let connection = replica.connect()?;
        if !table_exists(&connection, "page")? {
            bail!(
                "wiki replica {} has no `page` table",
                replica.db_path.display()
            );
        }
        Ok(replica)
    }

    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results.max(1);
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Case-insensitive title substring search within one namespace.
    pub fn search_pages(&self, query: &str, namespace: i64, limit: usize) -> Result<SearchResults> {
        let query = query.trim();
        if query.is_empty() {
            bail!("search query is required");
        }
        let limit = limit.clamp(1, self.max_results);
        let pattern = format!("%{}%", escape_like(&query.replace(' ', "_")));

        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT page_id, page_title, page_namespace, page_len, page_is_redirect
                 FROM page
                 WHERE page_namespace = ?1
                   AND LOWER(page_title) LIKE LOWER(?2) ESCAPE '\\'
                 ORDER BY page_title ASC
                 LIMIT ?3",
            )
            .context("failed to prepare replica page search")?;
        let rows = statement
            .query_map(params![namespace, pattern, limit as i64], |row| {
                Ok(ReplicaPage {
                    page_id: row.get(0)?,
                    page_title: row.get(1)?,
                    page_namespace: row.get(2)?,
                    page_len: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    page_is_redirect: row.get::<_, i64>(4)? != 0,
                })
            })
            .context("failed to run replica page search")?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row.context("failed to decode replica page row")?);
        }
        Ok(SearchResults {
            query: query.to_string(),
            namespace,
            count: results.len(),
            results,
        })
    }

    pub fn statistics(&self) -> Result<WikiStatistics> {
        let connection = self.connect()?;
        let recent_changes_count = if table_exists(&connection, "recentchanges")? {
            count_query(&connection, "SELECT COUNT(*) FROM recentchanges")?
        } else {
            0
        };
        Ok(WikiStatistics {
            total_pages: count_query(&connection, "SELECT COUNT(*) FROM page")?,
            content_pages: count_query(
                &connection,
                "SELECT COUNT(*) FROM page WHERE page_namespace = 0 AND page_is_redirect = 0",
            )?,
            redirects: count_query(
                &connection,
                "SELECT COUNT(*) FROM page WHERE page_is_redirect = 1",
            )?,
            recent_changes_count,
        })
    }

    /// Newest first. Empty when the replica carries no `recentchanges` table.
    pub fn recent_changes(&self, limit: usize) -> Result<Vec<RecentChange>> {
        let connection = self.connect()?;
        if !table_exists(&connection, "recentchanges")? {
            return Ok(Vec::new());
        }
        let limit = limit.clamp(1, self.max_results);
        let mut statement = connection
            .prepare(
                "SELECT rc_id, rc_timestamp, rc_namespace, rc_title, rc_bot, rc_minor, rc_new
                 FROM recentchanges
                 ORDER BY rc_timestamp DESC, rc_id DESC
                 LIMIT ?1",
            )
            .context("failed to prepare recent changes query")?;
        let rows = statement
            .query_map([limit as i64], |row| {
                Ok(RecentChange {
                    rc_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    namespace: row.get(2)?,
                    title: row.get(3)?,
                    is_bot: row.get::<_, i64>(4)? != 0,
                    is_minor: row.get::<_, i64>(5)? != 0,
                    is_new: row.get::<_, i64>(6)? != 0,
                })
            })
            .context("failed to run recent changes query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode recent change row")?);
        }
        Ok(out)
    }

    /// `None` when the user does not exist.
    pub fn user_edit_count(&self, username: &str) -> Result<Option<u64>> {
        let connection = self.connect()?;
        let count = connection
            .query_row(
                "SELECT user_editcount FROM user WHERE user_name = ?1",
                [username.trim()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()
            .with_context(|| format!("failed to look up edit count for {username}"))?;
        Ok(count.map(|count| count.and_then(|value| u64::try_from(value).ok()).unwrap_or(0)))
    }

    fn connect(&self) -> Result<Connection> {
        let connection = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open replica {}", self.db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        Ok(connection)
    }
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

fn count_query(connection: &Connection, sql: &str) -> Result<usize> {
    let count: i64 = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed query: {sql}"))?;
    usize::try_from(count).context("count does not fit into usize")
}
