use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR_NAME: &str = ".wikioauth";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const CREDENTIALS_DB_FILENAME: &str = "credentials.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub credentials_db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "project_root={} ({})\nstate_dir={}\ndata_dir={}\ncredentials_db={}\nconfig_path={} ({})",
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            normalize_for_display(&self.state_dir),
            normalize_for_display(&self.data_dir),
            normalize_for_display(&self.credentials_db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env);

    let state_dir = project_root.join(STATE_DIR_NAME);
    let data_dir = state_dir.join("data");

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (
            absolutize(path, &project_root),
            ValueSource::Flag,
        )
    } else if let Some(value) = non_empty(lookup_env("WIKIOAUTH_CONFIG")) {
        (
            absolutize(Path::new(&value), &project_root),
            ValueSource::Env,
        )
    } else {
        (state_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    Ok(ResolvedPaths {
        credentials_db_path: data_dir.join(CREDENTIALS_DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        config_source,
    })
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = write_text_file(
        &paths.config_path,
        &render_materialized_config(),
        options.force,
    )?;

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config() -> String {
    format!(
        "# wikioauth configuration (materialized by `wikioauth init`)\n# Environment variables override every key below.\n\n[wiki]\nurl = \"{}\"\n# user_agent = \"{}\"\n# timeout_ms = {}\n\n[oauth]\nprovider = \"{}\"\n# consumer_key = \"\"     # env: MEDIAWIKI_CONSUMER_KEY\n# consumer_secret = \"\"  # env: MEDIAWIKI_CONSUMER_SECRET\n\n[limits]\nmax_contributions = {}\nmax_search_results = {}\n\n[replica]\n# db_path = \"/path/to/replica.db\"  # env: WIKI_REPLICA_DB\n",
        crate::config::DEFAULT_WIKI_URL,
        crate::config::DEFAULT_USER_AGENT,
        crate::config::DEFAULT_TIMEOUT_MS,
        crate::config::DEFAULT_PROVIDER,
        crate::config::DEFAULT_MAX_CONTRIBUTIONS,
        crate::config::DEFAULT_MAX_SEARCH_RESULTS,
    )
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return (absolutize(path, &context.cwd), ValueSource::Flag);
    }

    if let Some(value) = non_empty(lookup_env("WIKIOAUTH_PROJECT_ROOT")) {
        return (absolutize(Path::new(&value), &context.cwd), ValueSource::Env);
    }

    detect_project_root_heuristic(&context.cwd)
}

fn detect_project_root_heuristic(cwd: &Path) -> (PathBuf, ValueSource) {
    let mut seen = HashSet::new();
    let mut cursor = Some(cwd);
    while let Some(current) = cursor {
        if seen.insert(normalize_for_display(current)) && current.join(STATE_DIR_NAME).is_dir() {
            return (current.to_path_buf(), ValueSource::Heuristic);
        }
        cursor = current.parent();
    }
    (cwd.to_path_buf(), ValueSource::Default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, STATE_DIR_NAME, ValueSource, init_layout,
        resolve_paths_with_lookup,
    };
    use crate::config::load_config;

    #[test]
    fn resolve_paths_prefers_flag_over_env() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("cwd");
        let from_flag = temp.path().join("flag-root");
        fs::create_dir_all(&cwd).expect("create cwd");

        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };
        let context = ResolutionContext { cwd: cwd.clone() };

        let env = HashMap::from([(
            "WIKIOAUTH_PROJECT_ROOT".to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);

        let resolved = resolve_paths_with_lookup(&context, &overrides, |key| env.get(key).cloned())
            .expect("resolve paths");
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
        assert_eq!(
            resolved.credentials_db_path,
            from_flag.join(STATE_DIR_NAME).join("data").join("credentials.db")
        );
    }

    #[test]
    fn resolve_paths_uses_env_config_relative_to_root() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        let context = ResolutionContext { cwd: root.clone() };
        let env = HashMap::from([
            (
                "WIKIOAUTH_PROJECT_ROOT".to_string(),
                root.to_string_lossy().to_string(),
            ),
            ("WIKIOAUTH_CONFIG".to_string(), "conf/app.toml".to_string()),
        ]);

        let resolved = resolve_paths_with_lookup(&context, &PathOverrides::default(), |key| {
            env.get(key).cloned()
        })
        .expect("resolve paths");
        assert_eq!(resolved.root_source, ValueSource::Env);
        assert_eq!(resolved.config_source, ValueSource::Env);
        assert_eq!(resolved.config_path, root.join("conf").join("app.toml"));
    }

    #[test]
    fn heuristic_finds_state_dir_in_ancestor() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(STATE_DIR_NAME)).expect("create state dir");
        fs::create_dir_all(&nested).expect("create nested");

        let resolved = resolve_paths_with_lookup(
            &ResolutionContext { cwd: nested },
            &PathOverrides::default(),
            |_| None,
        )
        .expect("resolve");
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn init_layout_creates_dirs_and_parseable_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");

        let context = ResolutionContext { cwd: root.clone() };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths_with_lookup(&context, &overrides, |_| None).expect("resolve");

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert_eq!(report.created_dirs.len(), 2);
        assert!(report.wrote_config);
        assert!(paths.data_dir.exists());

        let config = load_config(&paths.config_path).expect("load materialized config");
        assert_eq!(config.oauth.provider.as_deref(), Some("mediawiki"));
        assert_eq!(config.limits.max_contributions, Some(50));

        let second = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(second.created_dirs.is_empty());
        assert!(!second.wrote_config);
    }
}
