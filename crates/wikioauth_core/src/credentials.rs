use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

const CREDENTIALS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS social_auth (
    identity TEXT NOT NULL,
    provider TEXT NOT NULL,
    uid TEXT,
    extra_data TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL,
    PRIMARY KEY (identity, provider)
);
CREATE INDEX IF NOT EXISTS idx_social_auth_provider ON social_auth(provider);
"#;

/// One user's stored OAuth credential, written by the identity flow or
/// `wikioauth credentials set`.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub identity: String,
    pub provider: String,
    pub uid: Option<String>,
    pub extra_data: Value,
}

impl CredentialRecord {
    /// Builds a record in the identity-federation layout
    /// (`access_token.oauth_token` / `access_token.oauth_token_secret`).
    pub fn new(
        identity: impl Into<String>,
        provider: impl Into<String>,
        oauth_token: &str,
        oauth_token_secret: &str,
    ) -> Self {
        Self {
            identity: identity.into(),
            provider: provider.into(),
            uid: None,
            extra_data: json!({
                "access_token": {
                    "oauth_token": oauth_token,
                    "oauth_token_secret": oauth_token_secret,
                }
            }),
        }
    }

    pub fn with_username(mut self, username: &str) -> Self {
        if let Value::Object(map) = &mut self.extra_data {
            map.insert("username".to_string(), Value::String(username.to_string()));
        } else {
            let mut map = Map::new();
            map.insert("username".to_string(), Value::String(username.to_string()));
            self.extra_data = Value::Object(map);
        }
        self
    }

    pub fn with_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }

    pub fn access_token(&self) -> Option<&str> {
        let token = match self.extra_data.get("access_token") {
            Some(Value::Object(nested)) => nested.get("oauth_token").and_then(Value::as_str),
            Some(Value::String(flat)) => Some(flat.as_str()),
            _ => None,
        };
        token.filter(|value| !value.trim().is_empty())
    }

    pub fn access_token_secret(&self) -> Option<&str> {
        self.extra_data
            .get("access_token")
            .and_then(|value| value.get("oauth_token_secret"))
            .or_else(|| self.extra_data.get("access_token_secret"))
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn display_name(&self) -> Option<&str> {
        self.extra_data
            .get("username")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn is_complete(&self) -> bool {
        self.access_token().is_some() && self.access_token_secret().is_some()
    }
}

/// Read side of the credential store, keyed by `(identity, provider)`.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, identity: &str, provider: &str) -> Result<Option<CredentialRecord>>;
}

impl CredentialStore for [CredentialRecord] {
    fn lookup(&self, identity: &str, provider: &str) -> Result<Option<CredentialRecord>> {
        Ok(self
            .iter()
            .find(|record| record.identity == identity && record.provider == provider)
            .cloned())
    }
}

impl CredentialStore for Vec<CredentialRecord> {
    fn lookup(&self, identity: &str, provider: &str) -> Result<Option<CredentialRecord>> {
        self.as_slice().lookup(identity, provider)
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for &T {
    fn lookup(&self, identity: &str, provider: &str) -> Result<Option<CredentialRecord>> {
        (**self).lookup(identity, provider)
    }
}

impl<T: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<T> {
    fn lookup(&self, identity: &str, provider: &str) -> Result<Option<CredentialRecord>> {
        (**self).lookup(identity, provider)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub identity: String,
    pub provider: String,
    pub uid: Option<String>,
    pub username: Option<String>,
    pub complete: bool,
    pub token_fingerprint: Option<String>,
    pub updated_at_unix: i64,
}

/// SQLite-backed store. A connection is opened per call so the store can be
/// shared between threads without locking.
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    db_path: PathBuf,
}

impl SqliteCredentialStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create credential store directory {}",
                    parent.display()
                )
            })?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        let connection = store.connect()?;
        connection
            .execute_batch(CREDENTIALS_SCHEMA_SQL)
            .context("failed to initialize credential store schema")?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Inserts or replaces the record for `(identity, provider)`; re-authorising
    /// a user overwrites the previous token pair.
    pub fn upsert(&self, record: &CredentialRecord) -> Result<()> {
        let connection = self.connect()?;
        let extra_data = serde_json::to_string(&record.extra_data)
            .context("failed to serialize credential extra_data")?;
        connection
            .execute(
                "INSERT INTO social_auth (identity, provider, uid, extra_data, updated_at_unix)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(identity, provider) DO UPDATE SET
                   uid = excluded.uid,
                   extra_data = excluded.extra_data,
                   updated_at_unix = excluded.updated_at_unix",
                params![
                    record.identity,
                    record.provider,
                    record.uid,
                    extra_data,
                    unix_timestamp()?
                ],
            )
            .with_context(|| {
                format!(
                    "failed to store {} credentials for {}",
                    record.provider, record.identity
                )
            })?;
        Ok(())
    }

    pub fn remove(&self, identity: &str, provider: &str) -> Result<bool> {
        let connection = self.connect()?;
        let deleted = connection
            .execute(
                "DELETE FROM social_auth WHERE identity = ?1 AND provider = ?2",
                params![identity, provider],
            )
            .with_context(|| format!("failed to remove {provider} credentials for {identity}"))?;
        Ok(deleted > 0)
    }

    pub fn list(&self) -> Result<Vec<CredentialSummary>> {
        let connection = self.connect()?;
        let mut statement = connection
            .prepare(
                "SELECT identity, provider, uid, extra_data, updated_at_unix
                 FROM social_auth
                 ORDER BY identity ASC, provider ASC",
            )
            .context("failed to prepare credential listing query")?;
        let rows = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("failed to run credential listing query")?;

        let mut out = Vec::new();
        for row in rows {
            let (identity, provider, uid, extra_data, updated_at_unix) =
                row.context("failed to decode credential row")?;
            let record = CredentialRecord {
                identity,
                provider,
                uid,
                extra_data: parse_extra_data(&extra_data)?,
            };
            out.push(CredentialSummary {
                username: record.display_name().map(ToString::to_string),
                complete: record.is_complete(),
                token_fingerprint: record.access_token().map(token_fingerprint),
                identity: record.identity,
                provider: record.provider,
                uid: record.uid,
                updated_at_unix,
            });
        }
        Ok(out)
    }

    fn connect(&self) -> Result<Connection> {
        let connection = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open {}", self.db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        Ok(connection)
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn lookup(&self, identity: &str, provider: &str) -> Result<Option<CredentialRecord>> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                "SELECT uid, extra_data FROM social_auth WHERE identity = ?1 AND provider = ?2",
                params![identity, provider],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to look up {provider} credentials for {identity}"))?;

        let Some((uid, extra_data)) = row else {
            return Ok(None);
        };
        Ok(Some(CredentialRecord {
            identity: identity.to_string(),
            provider: provider.to_string(),
            uid,
            extra_data: parse_extra_data(&extra_data)?,
        }))
    }
}

/// Short SHA-256 prefix used to tell tokens apart without printing them.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest
        .iter()
        .take(6)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn parse_extra_data(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("failed to decode credential extra_data JSON")
}

fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::{CredentialRecord, CredentialStore, SqliteCredentialStore, token_fingerprint};

    #[test]
    fn reads_nested_identity_federation_layout() {
        let record = CredentialRecord::new("alice", "mediawiki", "tok", "sec").with_username("Alice");
        assert_eq!(record.access_token(), Some("tok"));
        assert_eq!(record.access_token_secret(), Some("sec"));
        assert_eq!(record.display_name(), Some("Alice"));
        assert!(record.is_complete());
    }

    #[test]
    fn reads_flat_layout() {
        let record = CredentialRecord {
            identity: "bob".to_string(),
            provider: "mediawiki".to_string(),
            uid: None,
            extra_data: json!({"access_token": "tok", "access_token_secret": "sec"}),
        };
        assert_eq!(record.access_token(), Some("tok"));
        assert_eq!(record.access_token_secret(), Some("sec"));
        assert!(record.display_name().is_none());
    }

    #[test]
    fn blank_or_missing_fields_make_record_incomplete() {
        let blank = CredentialRecord::new("carol", "mediawiki", "tok", "   ");
        assert!(!blank.is_complete());

        let missing = CredentialRecord {
            identity: "dave".to_string(),
            provider: "mediawiki".to_string(),
            uid: None,
            extra_data: json!({"access_token": {"oauth_token": "tok"}}),
        };
        assert!(missing.access_token_secret().is_none());
        assert!(!missing.is_complete());

        let empty = CredentialRecord {
            identity: "erin".to_string(),
            provider: "mediawiki".to_string(),
            uid: None,
            extra_data: json!({}),
        };
        assert!(!empty.is_complete());
    }

    #[test]
    fn slice_store_matches_identity_and_provider() {
        let records = vec![
            CredentialRecord::new("alice", "mediawiki", "a-tok", "a-sec"),
            CredentialRecord::new("alice", "other", "o-tok", "o-sec"),
        ];
        let found = records
            .lookup("alice", "mediawiki")
            .expect("lookup")
            .expect("record");
        assert_eq!(found.access_token(), Some("a-tok"));
        assert!(records.lookup("bob", "mediawiki").expect("lookup").is_none());
    }

    #[test]
    fn sqlite_store_round_trips_and_overwrites_on_reauth() {
        let temp = tempdir().expect("tempdir");
        let store =
            SqliteCredentialStore::open(&temp.path().join("data").join("credentials.db"))
                .expect("open store");

        assert!(store.lookup("alice", "mediawiki").expect("lookup").is_none());

        store
            .upsert(
                &CredentialRecord::new("alice", "mediawiki", "first", "secret-1")
                    .with_uid("12345")
                    .with_username("Alice"),
            )
            .expect("insert");
        store
            .upsert(&CredentialRecord::new("alice", "mediawiki", "second", "secret-2"))
            .expect("overwrite");

        let record = store
            .lookup("alice", "mediawiki")
            .expect("lookup")
            .expect("record");
        assert_eq!(record.access_token(), Some("second"));
        assert_eq!(record.access_token_secret(), Some("secret-2"));
        assert!(record.uid.is_none());

        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert!(listed[0].complete);
        assert_eq!(
            listed[0].token_fingerprint.as_deref(),
            Some(token_fingerprint("second").as_str())
        );

        assert!(store.remove("alice", "mediawiki").expect("remove"));
        assert!(!store.remove("alice", "mediawiki").expect("remove again"));
        assert!(store.lookup("alice", "mediawiki").expect("lookup").is_none());
    }

    #[test]
    fn fingerprint_is_short_and_stable() {
        let first = token_fingerprint("token-a");
        assert_eq!(first.len(), 12);
        assert_eq!(first, token_fingerprint("token-a"));
        assert_ne!(first, token_fingerprint("token-b"));
    }
}
