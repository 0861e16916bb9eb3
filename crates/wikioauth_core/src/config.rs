use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_WIKI_URL: &str = "https://meta.wikimedia.org";
pub const DEFAULT_USER_AGENT: &str = "wikioauth/0.1";
pub const DEFAULT_PROVIDER: &str = "mediawiki";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_CONTRIBUTIONS: usize = 50;
pub const DEFAULT_CONTRIBUTIONS: usize = 10;
pub const DEFAULT_MAX_SEARCH_RESULTS: usize = 100;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub oauth: OAuthSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub replica: ReplicaSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct OAuthSection {
    pub provider: Option<String>,
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LimitsSection {
    pub max_contributions: Option<usize>,
    pub max_search_results: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ReplicaSection {
    pub db_path: Option<PathBuf>,
}

/// Effective settings after applying env overrides and defaults.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub wiki_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub provider: String,
    pub consumer_key: Option<String>,
    pub consumer_secret: Option<String>,
    pub max_contributions: usize,
    pub max_search_results: usize,
    pub replica_db_path: Option<PathBuf>,
}

impl std::fmt::Debug for ResolvedSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSettings")
            .field("wiki_url", &self.wiki_url)
            .field("user_agent", &self.user_agent)
            .field("timeout_ms", &self.timeout_ms)
            .field("provider", &self.provider)
            .field("consumer_key", &self.consumer_key)
            .field(
                "consumer_secret",
                &self.consumer_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("max_contributions", &self.max_contributions)
            .field("max_search_results", &self.max_search_results)
            .field("replica_db_path", &self.replica_db_path)
            .finish()
    }
}

impl ResolvedSettings {
    pub fn has_consumer(&self) -> bool {
        self.consumer_key.is_some() && self.consumer_secret.is_some()
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "wiki_url={}\nuser_agent={}\ntimeout_ms={}\nprovider={}\nconsumer={}\nmax_contributions={}\nmax_search_results={}\nreplica_db_path={}",
            self.wiki_url,
            self.user_agent,
            self.timeout_ms,
            self.provider,
            if self.has_consumer() {
                "configured"
            } else {
                "missing"
            },
            self.max_contributions,
            self.max_search_results,
            self.replica_db_path
                .as_deref()
                .map(|path| path.to_string_lossy().replace('\\', "/"))
                .unwrap_or_else(|| "<none>".to_string())
        )
    }
}

impl AppConfig {
    /// Resolve effective settings: env > config > default.
    pub fn resolve(&self) -> ResolvedSettings {
        self.resolve_with_lookup(|key| env::var(key).ok())
    }

    pub fn resolve_with_lookup<F>(&self, lookup_env: F) -> ResolvedSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_text = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let config_text = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };

        let wiki_url = env_text("WIKI_URL")
            .or_else(|| config_text(&self.wiki.url))
            .unwrap_or_else(|| DEFAULT_WIKI_URL.to_string());
        let user_agent = env_text("WIKI_USER_AGENT")
            .or_else(|| config_text(&self.wiki.user_agent))
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let timeout_ms = env_text("WIKI_HTTP_TIMEOUT_MS")
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.wiki.timeout_ms)
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        let provider = env_text("WIKIOAUTH_PROVIDER")
            .or_else(|| config_text(&self.oauth.provider))
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());
        let consumer_key =
            env_text("MEDIAWIKI_CONSUMER_KEY").or_else(|| config_text(&self.oauth.consumer_key));
        let consumer_secret = env_text("MEDIAWIKI_CONSUMER_SECRET")
            .or_else(|| config_text(&self.oauth.consumer_secret));
        let max_contributions = env_text("WIKIOAUTH_MAX_CONTRIBUTIONS")
            .and_then(|value| value.parse::<usize>().ok())
            .or(self.limits.max_contributions)
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONTRIBUTIONS);
        let max_search_results = self
            .limits
            .max_search_results
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_SEARCH_RESULTS);
        let replica_db_path = env_text("WIKI_REPLICA_DB")
            .map(PathBuf::from)
            .or_else(|| self.replica.db_path.clone());

        ResolvedSettings {
            wiki_url,
            user_agent,
            timeout_ms,
            provider,
            consumer_key,
            consumer_secret,
            max_contributions,
            max_search_results,
            replica_db_path,
        }
    }
}

/// Load and parse an AppConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    if !config_path.exists() {
        return Ok(AppConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: AppConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub set_wiki_url: Option<String>,
    pub set_consumer_key: Option<String>,
    pub set_consumer_secret: Option<String>,
    pub set_replica_db_path: Option<PathBuf>,
}

/// Update selected keys while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_config(config_path: &Path, patch: &ConfigPatch) -> Result<bool> {
    if patch.set_wiki_url.is_none()
        && patch.set_consumer_key.is_none()
        && patch.set_consumer_secret.is_none()
        && patch.set_replica_db_path.is_none()
    {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;

    if let Some(url) = &patch.set_wiki_url {
        if url.trim().is_empty() {
            bail!("wiki url cannot be empty");
        }
        section_table(root_table, "wiki", config_path)?
            .insert("url".to_string(), Value::String(url.trim().to_string()));
    }
    if let Some(key) = &patch.set_consumer_key {
        section_table(root_table, "oauth", config_path)?
            .insert("consumer_key".to_string(), Value::String(key.trim().to_string()));
    }
    if let Some(secret) = &patch.set_consumer_secret {
        section_table(root_table, "oauth", config_path)?.insert(
            "consumer_secret".to_string(),
            Value::String(secret.trim().to_string()),
        );
    }
    if let Some(db_path) = &patch.set_replica_db_path {
        section_table(root_table, "replica", config_path)?.insert(
            "db_path".to_string(),
            Value::String(db_path.to_string_lossy().replace('\\', "/")),
        );
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

fn section_table<'a>(
    root: &'a mut toml::map::Map<String, Value>,
    name: &str,
    config_path: &Path,
) -> Result<&'a mut toml::map::Map<String, Value>> {
    root.entry(name.to_string())
        .or_insert_with(|| Value::Table(Default::default()))
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[{name}] must be a table in {}", config_path.display()))
}
