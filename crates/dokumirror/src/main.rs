use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use dokumirror_core::config::{MirrorConfig, load_config};
use dokumirror_core::hierarchy::{EntryKind, SubpageEntry, Subpages};
use dokumirror_core::migrate::{latest_version, migrate_database, pending_migration_count};
use dokumirror_core::navigation::Navigator;
use dokumirror_core::page::Page;
use dokumirror_core::remote::{DokuWikiClient, DokuWikiClientConfig, RemoteSource};
use dokumirror_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready_for_sync, init_layout, inspect_runtime, normalize_for_display,
    resolve_paths,
};
use dokumirror_core::search::{
    ConfiguredBackend, DEFAULT_QUERY_LIMIT, DEFAULT_SUGGEST_LIMIT, MAX_QUERY_LIMIT,
    MAX_SUGGEST_LIMIT, SearchIndex,
};
use dokumirror_core::store::PageStore;
use dokumirror_core::sync::{SyncOptions, SyncOrchestrator, SyncStats};
use dokumirror_core::transform::{ContentTransformer, DEFAULT_EXCERPT_LENGTH};
use serde::Serialize;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(
    name = "dokumirror",
    version,
    about = "Mirror a DokuWiki into a local page store and search index"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[arg(short, long, global = true, help = "Log at debug level (overrides RUST_LOG)")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    format: OutputFormat,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            format: cli.format,
        }
    }

    fn json(&self) -> bool {
        self.format == OutputFormat::Json
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the .dokumirror/ layout and a commented config.toml
    Init(InitArgs),
    Db(DbArgs),
    /// Pull pages from DokuWiki (incremental unless --full)
    Sync(SyncArgs),
    /// Pull a single page and report the outcome
    #[command(name = "sync-page")]
    SyncPage { id: String },
    /// Store, index and migration statistics
    Stats,
    /// Print one stored page
    Show { id: String },
    /// List stored pages by id prefix, namespace prefix or recency
    List(ListArgs),
    Search(SearchArgs),
    Suggest(SuggestArgs),
    /// Subpage tree shown under a page
    Subpages { id: String },
    /// Group entries (namespaces and standalone pages) under a prefix
    Groups(GroupsArgs),
    /// Rebuild the search index from the page store
    Reindex,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
    #[arg(long, help = "Skip writing .dokumirror/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, help = "List and pull every page instead of recent changes")]
    full: bool,
    #[arg(long, value_name = "NS", conflicts_with = "full", help = "Only pull pages under a namespace")]
    namespace: Option<String>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, value_name = "PREFIX", conflicts_with_all = ["namespace", "recent"])]
    prefix: Option<String>,
    #[arg(long, value_name = "NS", conflicts_with = "recent")]
    namespace: Option<String>,
    #[arg(long, value_name = "N", help = "Most recently modified pages")]
    recent: Option<usize>,
}

#[derive(Debug, Args)]
struct SearchArgs {
    query: String,
    #[arg(long, default_value_t = DEFAULT_QUERY_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
struct SuggestArgs {
    query: String,
    #[arg(long, default_value_t = DEFAULT_SUGGEST_LIMIT)]
    limit: usize,
}

#[derive(Debug, Args)]
struct GroupsArgs {
    #[arg(long, default_value = "team")]
    prefix: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    load_dotenv(None);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Db(DbArgs {
            command: DbSubcommand::Migrate,
        })) => run_db_migrate(&runtime),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::SyncPage { id }) => run_sync_page(&runtime, &id),
        Some(Commands::Stats) => run_stats(&runtime),
        Some(Commands::Show { id }) => run_show(&runtime, &id),
        Some(Commands::List(args)) => run_list(&runtime, args),
        Some(Commands::Search(args)) => run_search(&runtime, args),
        Some(Commands::Suggest(args)) => run_suggest(&runtime, args),
        Some(Commands::Subpages { id }) => run_subpages(&runtime, &id),
        Some(Commands::Groups(args)) => run_groups(&runtime, args),
        Some(Commands::Reindex) => run_reindex(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Load `.env` from the cwd chain, or from `project_root` once it is known.
/// Variables already set in the environment win.
fn load_dotenv(project_root: Option<&Path>) {
    let result = match project_root {
        Some(root) => dotenvy::from_path(root.join(".env")).map(|_| ()),
        None => dotenvy::dotenv().map(|_| ()),
    };
    if let Err(error) = result
        && !error.not_found()
    {
        warn!(%error, "failed to load .env");
    }
}

struct Mirror {
    paths: ResolvedPaths,
    config: MirrorConfig,
    store: Arc<PageStore>,
}

impl Mirror {
    fn open(runtime: &RuntimeOptions) -> Result<Self> {
        let paths = resolve_runtime_paths(runtime)?;
        let config = load_config(&paths.config_path)?;
        let store = Arc::new(PageStore::open(&paths.db_path)?);
        Ok(Self {
            paths,
            config,
            store,
        })
    }

    fn search_index(&self) -> Result<SearchIndex<ConfiguredBackend>> {
        let backend = ConfiguredBackend::from_config(&self.config, &self.paths.search_db_path)?;
        Ok(SearchIndex::new(
            backend,
            Arc::clone(&self.store),
            self.config.routes.clone(),
        ))
    }

    fn navigator(&self) -> Navigator {
        Navigator::new(
            Arc::clone(&self.store),
            self.config.hierarchy.clone(),
            self.config.routes.clone(),
        )
    }

    fn orchestrator(&self) -> Result<SyncOrchestrator<DokuWikiClient, ConfiguredBackend>> {
        let client = DokuWikiClient::new(DokuWikiClientConfig::from_config(&self.config))?;
        let transformer = ContentTransformer::new(
            self.config.routes.clone(),
            self.config
                .sync
                .excerpt_length
                .unwrap_or(DEFAULT_EXCERPT_LENGTH),
        )
        .context("failed to compile content rules")?;
        Ok(SyncOrchestrator::new(
            client,
            Arc::clone(&self.store),
            self.search_index()?,
            transformer,
            SyncOptions::from_config(&self.config.sync),
        ))
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    let migrations = migrate_database(&paths)?;

    if runtime.json() {
        return print_json(&json!({
            "project_root": normalize_for_display(&paths.project_root),
            "db_path": normalize_for_display(&paths.db_path),
            "config_path": normalize_for_display(&paths.config_path),
            "created_dirs": report.created_dirs.len(),
            "wrote_config": report.wrote_config,
            "schema_version": migrations.current_version,
        }));
    }

    println!("Initialized dokumirror runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("schema_version: {}", migrations.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = migrate_database(&paths)?;

    if runtime.json() {
        let applied: Vec<_> = report
            .applied
            .iter()
            .map(|migration| json!({ "version": migration.version, "name": migration.name }))
            .collect();
        return print_json(&json!({
            "applied": applied,
            "current_version": report.current_version,
        }));
    }

    println!("db migrate");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("applied: {}", report.applied.len());
    for migration in &report.applied {
        println!("  - v{:03}_{}", migration.version, migration.name);
    }
    println!("current_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn ensure_ready_for_sync(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_sync(&paths, &status)
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    ensure_ready_for_sync(runtime)?;
    let mirror = Mirror::open(runtime)?;
    let mut orchestrator = mirror.orchestrator()?;
    let (mode, stats) = match (&args.namespace, args.full) {
        (Some(namespace), _) => ("namespace", orchestrator.namespace_sync(namespace)?),
        (None, true) => ("full", orchestrator.full_sync()?),
        (None, false) => ("incremental", orchestrator.incremental_sync()?),
    };
    let last_sync = mirror.store.last_sync_timestamp()?;

    if runtime.json() {
        return print_json(&json!({
            "mode": mode,
            "stats": stats,
            "last_sync": last_sync,
            "requests": orchestrator.remote().request_count(),
        }));
    }

    println!("sync");
    println!("mode: {mode}");
    print_sync_stats(&stats);
    println!("requests: {}", orchestrator.remote().request_count());
    println!("last_sync: {}", format_optional(last_sync));
    print_diagnostics(runtime, &mirror.paths);
    Ok(())
}

fn run_sync_page(runtime: &RuntimeOptions, id: &str) -> Result<()> {
    ensure_ready_for_sync(runtime)?;
    let mirror = Mirror::open(runtime)?;
    let mut orchestrator = mirror.orchestrator()?;
    let outcome = orchestrator
        .sync_page(id)
        .with_context(|| format!("failed to sync page {id}"))?;

    if runtime.json() {
        return print_json(&outcome);
    }
    println!("sync-page");
    println!("page_id: {}", outcome.page_id);
    println!("created: {}", outcome.created);
    println!("indexed: {}", outcome.indexed);
    Ok(())
}

fn run_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let pending = pending_migration_count(&paths)?;
    let mirror = Mirror::open(runtime)?;
    let stats = mirror.store.stats()?;

    if runtime.json() {
        return print_json(&json!({
            "store": stats,
            "db_size_bytes": status.db_size_bytes,
            "pending_migrations": pending,
            "latest_schema_version": latest_version(),
            "search_backend": mirror.config.search_backend().as_str(),
            "warnings": status.warnings,
        }));
    }

    println!("stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("document_count: {}", stats.document_count);
    println!("last_sync: {}", format_optional(stats.last_sync));
    println!("schema_version: {}", stats.schema_version);
    println!("pending_migrations: {pending}");
    println!("db_size_bytes: {}", format_optional(status.db_size_bytes));
    println!("search_backend: {}", mirror.config.search_backend().as_str());
    print_warnings(&status.warnings);
    if pending > 0 {
        println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_show(runtime: &RuntimeOptions, id: &str) -> Result<()> {
    let mirror = Mirror::open(runtime)?;
    let Some(page) = mirror.store.find_by_id(id.trim())? else {
        if runtime.json() {
            return print_json(&json!({ "page_id": id, "found": false }));
        }
        println!("page_id: {id}");
        println!("found: false");
        return Ok(());
    };

    if runtime.json() {
        return print_json(&page);
    }
    println!("page_id: {}", page.id);
    println!("title: {}", page.title);
    println!("namespace: {}", page.namespace());
    println!("last_modified: {}", page.last_modified);
    println!("revision: {}", format_optional(page.revision));
    println!("size_bytes: {}", format_optional(page.size_bytes));
    println!("url: {}", mirror.config.routes.page_href(&page.id));
    println!("excerpt: {}", page.excerpt);
    println!("toc: {}", page.table_of_contents.len());
    for entry in &page.table_of_contents {
        println!(
            "  {}{} (#{})",
            "  ".repeat(usize::from(entry.level.saturating_sub(1))),
            entry.title,
            entry.anchor_id
        );
    }
    Ok(())
}

fn run_list(runtime: &RuntimeOptions, args: ListArgs) -> Result<()> {
    let mirror = Mirror::open(runtime)?;
    let pages = match (&args.prefix, &args.namespace, args.recent) {
        (Some(prefix), _, _) => mirror.store.find_by_id_prefix(prefix)?,
        (None, Some(namespace), _) => mirror.store.find_by_namespace_prefix(namespace)?,
        (None, None, Some(limit)) => mirror.store.most_recently_modified(limit)?,
        (None, None, None) => mirror.store.all_pages()?,
    };
    let summaries: Vec<_> = pages.iter().map(Page::summary).collect();

    if runtime.json() {
        return print_json(&summaries);
    }
    println!("pages: {}", summaries.len());
    for summary in &summaries {
        println!(
            "  - {} | {} | {}",
            summary.id, summary.title, summary.last_modified
        );
    }
    Ok(())
}

fn run_search(runtime: &RuntimeOptions, args: SearchArgs) -> Result<()> {
    let mirror = Mirror::open(runtime)?;
    let index = mirror.search_index()?;
    let limit = args.limit.clamp(1, MAX_QUERY_LIMIT);
    let pages = index.query(&args.query, limit)?;
    let highlights: Vec<_> = pages
        .iter()
        .map(|page| index.highlight(page, &args.query))
        .collect();

    if runtime.json() {
        let results: Vec<_> = pages
            .iter()
            .zip(&highlights)
            .map(|(page, highlight)| {
                json!({
                    "id": page.id,
                    "title": page.title,
                    "url": mirror.config.routes.page_href(&page.id),
                    "last_modified": page.last_modified,
                    "highlight": highlight,
                })
            })
            .collect();
        return print_json(&json!({
            "query": args.query,
            "backend": index.backend_name(),
            "results": results,
        }));
    }

    println!("search");
    println!("query: {}", args.query);
    println!("backend: {}", index.backend_name());
    println!("results: {}", pages.len());
    for (page, highlight) in pages.iter().zip(&highlights) {
        println!("  - {} ({})", page.title, page.id);
        println!("    match: {:?}", highlight.match_level);
        println!("    excerpt: {}", highlight.content_excerpt_highlighted);
    }
    Ok(())
}

fn run_suggest(runtime: &RuntimeOptions, args: SuggestArgs) -> Result<()> {
    let mirror = Mirror::open(runtime)?;
    let index = mirror.search_index()?;
    let suggestions = index.suggest(&args.query, args.limit.clamp(1, MAX_SUGGEST_LIMIT))?;

    if runtime.json() {
        return print_json(&suggestions);
    }
    println!("suggestions: {}", suggestions.len());
    for suggestion in &suggestions {
        println!(
            "  - {} | {} | {}",
            suggestion.title, suggestion.namespace, suggestion.url
        );
    }
    Ok(())
}

fn run_subpages(runtime: &RuntimeOptions, id: &str) -> Result<()> {
    let mirror = Mirror::open(runtime)?;
    let subpages = mirror.navigator().subpages(id.trim())?;

    if runtime.json() {
        return print_json(&subpages);
    }
    println!("subpages of {id}");
    match &subpages {
        Subpages::Hidden { count } => {
            println!("status: hidden");
            println!("count: {count}");
        }
        Subpages::Listed { entries } => {
            println!("status: listed");
            println!("entries: {}", entries.len());
            print_entries(entries, 1);
        }
    }
    Ok(())
}

fn print_entries(entries: &[SubpageEntry], depth: usize) {
    for entry in entries {
        let marker = match entry.kind {
            EntryKind::Folder => "+",
            EntryKind::Page => "-",
        };
        println!(
            "{}{marker} {} -> {}",
            "  ".repeat(depth),
            entry.title,
            entry.href
        );
        print_entries(&entry.children, depth + 1);
    }
}

fn run_groups(runtime: &RuntimeOptions, args: GroupsArgs) -> Result<()> {
    let mirror = Mirror::open(runtime)?;
    let groups = mirror.navigator().groups(&args.prefix)?;

    if runtime.json() {
        return print_json(&groups);
    }
    println!("groups under {}", args.prefix);
    println!("entries: {}", groups.len());
    for group in &groups {
        println!(
            "  - {} [{:?}] -> {}",
            group.display_name, group.kind, group.href
        );
    }
    Ok(())
}

fn run_reindex(runtime: &RuntimeOptions) -> Result<()> {
    let mirror = Mirror::open(runtime)?;
    let index = mirror.search_index()?;
    let report = index.reindex_all()?;

    if runtime.json() {
        return print_json(&report);
    }
    println!("reindex");
    println!("backend: {}", index.backend_name());
    println!("succeeded: {}", report.succeeded);
    println!("failed: {}", report.failed);
    for item in &report.items {
        if let Some(error) = &item.error {
            println!("  - {}: {error}", item.id);
        }
    }
    Ok(())
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };
    let paths = resolve_paths(&context, &overrides);
    load_dotenv(Some(&paths.project_root));
    Ok(paths)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode JSON output")?
    );
    Ok(())
}

fn print_sync_stats(stats: &SyncStats) {
    println!("processed: {}", stats.processed);
    println!("created: {}", stats.created);
    println!("updated: {}", stats.updated);
    println!("errors: {}", stats.errors);
    println!("index_failures: {}", stats.index_failures);
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("warnings:");
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn format_optional<T: ToString>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "n/a".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "dokumirror",
            "search",
            "vpn access",
            "--limit",
            "5",
            "--format",
            "json",
            "--project-root",
            "/tmp/mirror",
        ])
        .expect("parse");
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.project_root, Some(PathBuf::from("/tmp/mirror")));
        match cli.command {
            Some(Commands::Search(args)) => {
                assert_eq!(args.query, "vpn access");
                assert_eq!(args.limit, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn sync_rejects_full_with_namespace() {
        assert!(Cli::try_parse_from(["dokumirror", "sync", "--full", "--namespace", "team"]).is_err());
        let cli = Cli::try_parse_from(["dokumirror", "sync", "--namespace", "team"]).expect("parse");
        assert!(matches!(
            cli.command,
            Some(Commands::Sync(SyncArgs { full: false, namespace: Some(_) }))
        ));
    }

    #[test]
    fn groups_default_to_team_prefix() {
        let cli = Cli::try_parse_from(["dokumirror", "groups"]).expect("parse");
        match cli.command {
            Some(Commands::Groups(args)) => assert_eq!(args.prefix, "team"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn sync_page_requires_initialized_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = RuntimeOptions {
            project_root: Some(temp.path().to_path_buf()),
            data_dir: None,
            config: None,
            diagnostics: false,
            format: OutputFormat::Text,
        };
        let error = run_sync_page(&runtime, "team:it").expect_err("must fail");
        assert!(error.to_string().contains("sync needs an initialized layout"));
        assert!(!temp.path().join(".dokumirror").exists());
    }

    #[test]
    fn clap_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
