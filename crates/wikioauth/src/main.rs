use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use wikioauth_core::config::{
    ConfigPatch, DEFAULT_CONTRIBUTIONS, ResolvedSettings, load_config, patch_config,
};
use wikioauth_core::credentials::{CredentialRecord, CredentialStore, SqliteCredentialStore};
use wikioauth_core::operations::UserWiki;
use wikioauth_core::replica::ReplicaDb;
use wikioauth_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout,
    normalize_for_display, resolve_paths,
};
use wikioauth_core::session::{SessionFactory, SessionSettings};

#[derive(Debug, Parser)]
#[command(
    name = "wikioauth",
    version,
    about = "Act on a MediaWiki wiki with per-user OAuth credentials"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Credentials(CredentialsArgs),
    #[command(about = "Profile of the user behind a stored credential")]
    Profile(IdentityArgs),
    #[command(name = "user-info", about = "Edit count, registration and groups")]
    UserInfo(IdentityArgs),
    #[command(about = "Recent contributions of the user")]
    Contributions(ContributionsArgs),
    #[command(about = "Current wikitext of a page, read as the user")]
    Page(PageArgs),
    #[command(about = "Save a page as the user")]
    Edit(EditArgs),
    #[command(about = "Search page titles in the wiki replica")]
    Search(SearchArgs),
    #[command(about = "Page and recent change counts from the wiki replica")]
    Stats,
    #[command(name = "recent-changes", about = "Newest entries of the replica recentchanges table")]
    RecentChanges(RecentChangesArgs),
    #[command(name = "user-edit-count", about = "Edit count of a wiki user from the replica")]
    UserEditCount(UserEditCountArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, value_name = "URL", help = "Set wiki.url in config")]
    wiki_url: Option<String>,
    #[arg(long, value_name = "KEY", help = "Set oauth.consumer_key in config")]
    consumer_key: Option<String>,
    #[arg(long, value_name = "SECRET", help = "Set oauth.consumer_secret in config")]
    consumer_secret: Option<String>,
    #[arg(long, value_name = "PATH", help = "Set replica.db_path in config")]
    replica_db: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CredentialsArgs {
    #[command(subcommand)]
    command: CredentialsSubcommand,
}

#[derive(Debug, Subcommand)]
enum CredentialsSubcommand {
    #[command(about = "Store (or replace) a user's OAuth access token pair")]
    Set {
        identity: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        secret: String,
        #[arg(long, help = "Wiki username to cache alongside the tokens")]
        username: Option<String>,
        #[arg(long, help = "Provider-side user id")]
        uid: Option<String>,
        #[arg(long)]
        provider: Option<String>,
    },
    Show {
        identity: String,
        #[arg(long)]
        provider: Option<String>,
    },
    Remove {
        identity: String,
        #[arg(long)]
        provider: Option<String>,
    },
    List,
}

#[derive(Debug, Args)]
struct IdentityArgs {
    identity: String,
}

#[derive(Debug, Args)]
struct ContributionsArgs {
    identity: String,
    #[arg(long, default_value_t = DEFAULT_CONTRIBUTIONS)]
    limit: usize,
}

#[derive(Debug, Args)]
struct PageArgs {
    identity: String,
    title: String,
}

#[derive(Debug, Args)]
struct EditArgs {
    identity: String,
    title: String,
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    text: Option<String>,
    #[arg(long, value_name = "PATH", help = "Read the new page text from a file")]
    file: Option<PathBuf>,
    #[arg(long, default_value = "")]
    summary: String,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[arg(long, default_value_t = 0)]
    namespace: i64,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
struct RecentChangesArgs {
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Args)]
struct UserEditCountArgs {
    #[arg(help = "Wiki username (user_name in the replica)")]
    username: String,
}

#[derive(Debug, Serialize)]
struct UserEditCountOutput {
    username: String,
    exists: bool,
    edit_count: u64,
}

struct LoadedRuntime {
    paths: ResolvedPaths,
    settings: ResolvedSettings,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Credentials(CredentialsArgs { command })) => {
            run_credentials(&runtime, command)
        }
        Some(Commands::Profile(IdentityArgs { identity })) => {
            let loaded = load_runtime(&runtime)?;
            let profile = user_wiki(&loaded)?
                .fetch_profile(&identity)
                .with_context(|| format!("failed to load profile for {identity}"))?;
            print_json(&profile)
        }
        Some(Commands::UserInfo(IdentityArgs { identity })) => {
            let loaded = load_runtime(&runtime)?;
            let info = user_wiki(&loaded)?
                .fetch_user_info(&identity)
                .with_context(|| format!("failed to load user info for {identity}"))?;
            print_json(&info)
        }
        Some(Commands::Contributions(args)) => {
            let loaded = load_runtime(&runtime)?;
            let contributions = user_wiki(&loaded)?
                .fetch_contributions(&args.identity, args.limit)
                .with_context(|| format!("failed to load contributions for {}", args.identity))?;
            print_json(&contributions)
        }
        Some(Commands::Page(args)) => {
            let loaded = load_runtime(&runtime)?;
            let page = user_wiki(&loaded)?
                .fetch_page_content(&args.identity, &args.title)
                .with_context(|| format!("failed to read page {}", args.title))?;
            print_json(&page)
        }
        Some(Commands::Edit(args)) => run_edit(&runtime, args),
        Some(Commands::Search(args)) => {
            let loaded = load_runtime(&runtime)?;
            let results = open_replica(&loaded)?.search_pages(&args.query, args.namespace, args.limit)?;
            print_json(&results)
        }
        Some(Commands::Stats) => {
            let loaded = load_runtime(&runtime)?;
            print_json(&open_replica(&loaded)?.statistics()?)
        }
        Some(Commands::RecentChanges(args)) => {
            let loaded = load_runtime(&runtime)?;
            print_json(&open_replica(&loaded)?.recent_changes(args.limit)?)
        }
        Some(Commands::UserEditCount(UserEditCountArgs { username })) => {
            let loaded = load_runtime(&runtime)?;
            let edit_count = open_replica(&loaded)?.user_edit_count(&username)?;
            print_json(&UserEditCountOutput {
                exists: edit_count.is_some(),
                edit_count: edit_count.unwrap_or(0),
                username,
            })
        }
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

/// Installed once the project `.env` is loaded so its `RUST_LOG` applies.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;
    let patched = patch_config(
        &paths.config_path,
        &ConfigPatch {
            set_wiki_url: args.wiki_url,
            set_consumer_key: args.consumer_key,
            set_consumer_secret: args.consumer_secret,
            set_replica_db_path: args.replica_db,
        },
    )?;
    let store = SqliteCredentialStore::open(&paths.credentials_db_path)?;

    println!("Initialized wikioauth runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("credentials_db: {}", normalize_for_display(store.db_path()));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("patched_config: {patched}");
    if runtime.diagnostics {
        let settings = load_config(&paths.config_path)?.resolve();
        print_diagnostics(&paths, &settings);
    }
    Ok(())
}

fn run_credentials(runtime: &RuntimeOptions, command: CredentialsSubcommand) -> Result<()> {
    let loaded = load_runtime(runtime)?;
    let store = SqliteCredentialStore::open(&loaded.paths.credentials_db_path)?;
    let provider_or_default =
        |provider: Option<String>| provider.unwrap_or_else(|| loaded.settings.provider.clone());

    match command {
        CredentialsSubcommand::Set {
            identity,
            token,
            secret,
            username,
            uid,
            provider,
        } => {
            let provider = provider_or_default(provider);
            let mut record = CredentialRecord::new(&identity, &provider, &token, &secret);
            if let Some(username) = username.as_deref() {
                record = record.with_username(username);
            }
            if let Some(uid) = uid.as_deref() {
                record = record.with_uid(uid);
            }
            if !record.is_complete() {
                bail!("--token and --secret must both be non-empty");
            }
            store.upsert(&record)?;
            println!("stored: {identity} ({provider})");
            println!("credentials_db: {}", normalize_for_display(store.db_path()));
        }
        CredentialsSubcommand::Show { identity, provider } => {
            let provider = provider_or_default(provider);
            let Some(record) = store.lookup(&identity, &provider)? else {
                bail!("no {provider} credentials stored for {identity}");
            };
            println!("identity: {}", record.identity);
            println!("provider: {}", record.provider);
            println!("uid: {}", record.uid.as_deref().unwrap_or("<none>"));
            println!("username: {}", record.display_name().unwrap_or("<none>"));
            println!("complete: {}", format_flag(record.is_complete()));
            println!(
                "token_fingerprint: {}",
                record
                    .access_token()
                    .map(wikioauth_core::credentials::token_fingerprint)
                    .unwrap_or_else(|| "<none>".to_string())
            );
        }
        CredentialsSubcommand::Remove { identity, provider } => {
            let provider = provider_or_default(provider);
            let removed = store.remove(&identity, &provider)?;
            println!("removed: {}", format_flag(removed));
        }
        CredentialsSubcommand::List => {
            print_json(&store.list()?)?;
        }
    }
    Ok(())
}

fn run_edit(runtime: &RuntimeOptions, args: EditArgs) -> Result<()> {
    let text = match (&args.text, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("edit requires --text or --file"),
    };

    let loaded = load_runtime(runtime)?;
    let result = user_wiki(&loaded)?.submit_edit(&args.identity, &args.title, &text, &args.summary);
    print_json(&result)?;
    if !result.success {
        bail!(
            "edit of {} failed: {}",
            args.title,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<LoadedRuntime> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_config(&paths.config_path)?.resolve();
    if runtime.diagnostics {
        print_diagnostics(&paths, &settings);
    }
    Ok(LoadedRuntime { paths, settings })
}

fn user_wiki(loaded: &LoadedRuntime) -> Result<UserWiki<SessionFactory<SqliteCredentialStore>>> {
    let store = SqliteCredentialStore::open(&loaded.paths.credentials_db_path)?;
    let factory = SessionFactory::new(store, SessionSettings::from_resolved(&loaded.settings));
    Ok(UserWiki::new(factory).with_max_contributions(loaded.settings.max_contributions))
}

fn open_replica(loaded: &LoadedRuntime) -> Result<ReplicaDb> {
    let Some(db_path) = loaded.settings.replica_db_path.as_deref() else {
        bail!("no wiki replica configured (set replica.db_path or WIKI_REPLICA_DB)");
    };
    let db_path = absolutize(db_path, &loaded.paths.project_root);
    Ok(ReplicaDb::open(&db_path)?.with_max_results(loaded.settings.max_search_results))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }
    init_tracing();

    resolve_paths(&context, &overrides)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON output")?
    );
    Ok(())
}

/// Written to stderr so JSON on stdout stays machine-readable.
fn print_diagnostics(paths: &ResolvedPaths, settings: &ResolvedSettings) {
    eprintln!(
        "[diagnostics]\n{}\n{}",
        paths.diagnostics(),
        settings.diagnostics()
    );
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use clap::Parser;
    use tempfile::tempdir;

    use super::{Cli, Commands, CredentialsSubcommand, RuntimeOptions, resolve_runtime_paths};

    #[test]
    fn contributions_limit_defaults_to_ten() {
        let cli = Cli::try_parse_from(["wikioauth", "contributions", "alice"]).expect("parse");
        match cli.command {
            Some(Commands::Contributions(args)) => {
                assert_eq!(args.identity, "alice");
                assert_eq!(args.limit, 10);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn edit_requires_text_or_file() {
        assert!(Cli::try_parse_from(["wikioauth", "edit", "alice", "Sandbox"]).is_err());
        assert!(
            Cli::try_parse_from([
                "wikioauth", "edit", "alice", "Sandbox", "--text", "a", "--file", "b.txt"
            ])
            .is_err()
        );
        let cli = Cli::try_parse_from([
            "wikioauth", "edit", "alice", "Sandbox", "--text", "hello", "--summary", "hi",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Some(Commands::Edit(_))));
    }

    #[test]
    fn user_edit_count_takes_a_username() {
        let cli = Cli::try_parse_from(["wikioauth", "user-edit-count", "Alice"]).expect("parse");
        match cli.command {
            Some(Commands::UserEditCount(args)) => assert_eq!(args.username, "Alice"),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["wikioauth", "user-edit-count"]).is_err());
    }

    #[test]
    fn project_env_is_loaded_while_resolving_paths() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join(".env"),
            "WIKIOAUTH_PROJECT_ENV_MARKER=from-project-env\n",
        )
        .expect("write .env");

        let runtime = RuntimeOptions {
            project_root: Some(temp.path().to_path_buf()),
            config: None,
            diagnostics: false,
        };
        let paths = resolve_runtime_paths(&runtime).expect("paths");
        assert_eq!(paths.project_root, temp.path());
        assert_eq!(
            std::env::var("WIKIOAUTH_PROJECT_ENV_MARKER").as_deref(),
            Ok("from-project-env")
        );
    }

    #[test]
    fn global_flags_parse_after_subcommands() {
        let cli = Cli::try_parse_from([
            "wikioauth",
            "credentials",
            "set",
            "alice",
            "--token",
            "t",
            "--secret",
            "s",
            "--diagnostics",
            "--project-root",
            "/tmp/project",
        ])
        .expect("parse");
        assert!(cli.diagnostics);
        assert_eq!(
            cli.project_root.as_deref(),
            Some(std::path::Path::new("/tmp/project"))
        );
        match cli.command {
            Some(Commands::Credentials(args)) => {
                assert!(matches!(args.command, CredentialsSubcommand::Set { .. }));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
