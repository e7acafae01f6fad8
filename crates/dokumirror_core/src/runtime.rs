use std::env;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const STATE_DIR_NAME: &str = ".dokumirror";
pub const DB_FILENAME: &str = "dokumirror.db";
pub const SEARCH_DB_FILENAME: &str = "search.db";
pub const CONFIG_FILENAME: &str = "config.toml";
pub const MIGRATIONS_POLICY_MESSAGE: &str =
    "Run `dokumirror db migrate` to apply pending schema migrations.";

const ENV_PROJECT_ROOT: &str = "DOKUMIRROR_PROJECT_ROOT";
const ENV_DATA_DIR: &str = "DOKUMIRROR_DATA_DIR";
const ENV_CONFIG: &str = "DOKUMIRROR_CONFIG";

/// Where a resolved path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSource {
    Flag,
    Env,
    /// Nearest ancestor of the working directory holding `.dokumirror/`.
    Ancestor,
    WorkingDir,
    Default,
}

impl fmt::Display for PathSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Ancestor => "ancestor",
            Self::WorkingDir => "cwd",
            Self::Default => "default",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        Ok(Self {
            cwd: env::current_dir().context("failed to read current directory")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    /// FTS5 index used when `[search].backend = "sqlite"`.
    pub search_db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: PathSource,
    pub data_source: PathSource,
    pub config_source: PathSource,
}

impl ResolvedPaths {
    /// Default layout under `project_root`.
    pub fn for_root(project_root: PathBuf, root_source: PathSource) -> Self {
        let state_dir = project_root.join(STATE_DIR_NAME);
        let data_dir = state_dir.join("data");
        Self {
            db_path: data_dir.join(DB_FILENAME),
            search_db_path: data_dir.join(SEARCH_DB_FILENAME),
            config_path: state_dir.join(CONFIG_FILENAME),
            project_root,
            state_dir,
            data_dir,
            root_source,
            data_source: PathSource::Default,
            config_source: PathSource::Default,
        }
    }

    fn relocate_data_dir(&mut self, data_dir: PathBuf, source: PathSource) {
        self.db_path = data_dir.join(DB_FILENAME);
        self.search_db_path = data_dir.join(SEARCH_DB_FILENAME);
        self.data_dir = data_dir;
        self.data_source = source;
    }

    pub fn diagnostics(&self) -> String {
        let rows: [(&str, &Path, Option<PathSource>); 6] = [
            ("project_root", &self.project_root, Some(self.root_source)),
            ("state_dir", &self.state_dir, None),
            ("data_dir", &self.data_dir, Some(self.data_source)),
            ("db_path", &self.db_path, None),
            ("search_db_path", &self.search_db_path, None),
            ("config_path", &self.config_path, Some(self.config_source)),
        ];
        let mut out = String::new();
        for (label, path, source) in rows {
            out.push_str(label);
            out.push('=');
            out.push_str(&normalize_for_display(path));
            if let Some(source) = source {
                out.push_str(&format!(" ({source})"));
            }
            out.push('\n');
        }
        out.push_str("policy=");
        out.push_str(MIGRATIONS_POLICY_MESSAGE);
        out
    }
}

pub fn resolve_paths(context: &ResolutionContext, overrides: &PathOverrides) -> ResolvedPaths {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

/// Precedence for every path: flag, then env, then the layout default.
/// The project root additionally falls back to ancestor detection before the cwd.
fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> ResolvedPaths
where
    F: Fn(&str) -> Option<String>,
{
    let cwd = context.cwd.as_path();
    let (root, root_source) =
        match pick_override(overrides.project_root.as_deref(), lookup_env(ENV_PROJECT_ROOT)) {
            Some((path, source)) => (absolutize(&path, cwd), source),
            None => match find_state_ancestor(cwd) {
                Some(root) => (root, PathSource::Ancestor),
                None => (cwd.to_path_buf(), PathSource::WorkingDir),
            },
        };

    let mut paths = ResolvedPaths::for_root(root, root_source);
    if let Some((path, source)) =
        pick_override(overrides.data_dir.as_deref(), lookup_env(ENV_DATA_DIR))
    {
        let data_dir = absolutize(&path, &paths.project_root);
        paths.relocate_data_dir(data_dir, source);
    }
    if let Some((path, source)) = pick_override(overrides.config.as_deref(), lookup_env(ENV_CONFIG))
    {
        paths.config_path = absolutize(&path, &paths.project_root);
        paths.config_source = source;
    }
    paths
}

fn pick_override(flag: Option<&Path>, env_value: Option<String>) -> Option<(PathBuf, PathSource)> {
    if let Some(path) = flag {
        return Some((path.to_path_buf(), PathSource::Flag));
    }
    let value = env_value?;
    let value = value.trim();
    (!value.is_empty()).then(|| (PathBuf::from(value), PathSource::Env))
}

fn find_state_ancestor(cwd: &Path) -> Option<PathBuf> {
    cwd.ancestors()
        .find(|candidate| candidate.join(STATE_DIR_NAME).is_dir())
        .map(Path::to_path_buf)
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let db_size_bytes = match fs::metadata(&paths.db_path) {
        Ok(metadata) => Some(metadata.len()),
        Err(error) if error.kind() == ErrorKind::NotFound => None,
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to inspect {}", paths.db_path.display()));
        }
    };
    let status = RuntimeStatus {
        state_dir_exists: paths.state_dir.is_dir(),
        data_dir_exists: paths.data_dir.is_dir(),
        db_exists: db_size_bytes.is_some(),
        db_size_bytes,
        config_exists: paths.config_path.is_file(),
        warnings: Vec::new(),
    };

    let mut warnings = Vec::new();
    if !status.state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ not found under {}; run `dokumirror init`",
            normalize_for_display(&paths.project_root)
        ));
    }
    if !status.config_exists {
        warnings.push(format!(
            "no config at {}; using built-in defaults and environment",
            normalize_for_display(&paths.config_path)
        ));
    }
    Ok(RuntimeStatus { warnings, ..status })
}

pub fn ensure_runtime_ready_for_sync(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if status.state_dir_exists {
        return Ok(());
    }
    bail!(
        "sync needs an initialized layout, but {} does not exist\nrun: dokumirror init --project-root {}",
        normalize_for_display(&paths.state_dir),
        normalize_for_display(&paths.project_root)
    )
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    /// Overwrite an existing config file.
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.state_dir, &paths.data_dir] {
        if dir.is_dir() {
            continue;
        }
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        created_dirs.push(dir.clone());
    }

    let wrote_config = options.materialize_config
        && write_config(&paths.config_path, &render_materialized_config(), options.force)?;
    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

/// Returns false when the file exists and `force` is off.
fn write_config(path: &Path, content: &str, force: bool) -> Result<bool> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut open = OpenOptions::new();
    open.write(true);
    if force {
        open.create(true).truncate(true);
    } else {
        open.create_new(true);
    }
    let mut file = match open.open(path) {
        Ok(file) => file,
        Err(error) if !force && error.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to open {}", path.display()));
        }
    };
    file.write_all(content.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn render_materialized_config() -> String {
    concat!(
        "# dokumirror configuration (materialized by `dokumirror init`)\n",
        "# Credentials are read from the environment (DOKUWIKI_USERNAME, DOKUWIKI_PASSWORD,\n",
        "# TYPESENSE_API_KEY); a .env file in the project root is loaded automatically.\n",
        "\n",
        "[remote]\n",
        "# url = \"https://wiki.example.org\"\n",
        "# jsonrpc_endpoint = \"/lib/exe/jsonrpc.php\"\n",
        "# timeout_ms = 30000\n",
        "# html_methods = [\"core.getPageHTML\", \"wiki.getPageHTML\", \"core.renderPage\"]\n",
        "\n",
        "[search]\n",
        "# backend = \"typesense\"   # or \"sqlite\"\n",
        "# host = \"localhost\"\n",
        "# port = 8108\n",
        "# protocol = \"http\"\n",
        "# collection = \"wiki_pages\"\n",
        "\n",
        "[sync]\n",
        "# batch_size = 50\n",
        "# batch_pause_ms = 100\n",
        "# list_depth = 0\n",
        "# excerpt_length = 200\n",
        "# since_skew_secs = 0\n",
        "\n",
        "[routes]\n",
        "# page_prefix = \"/wiki/\"\n",
        "# media_route = \"/wiki/fetch\"\n",
        "\n",
        "[hierarchy]\n",
        "# max_subpage_entries = 50\n",
        "# group_cache_ttl_secs = 300\n",
    )
    .to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::tempdir;

    use super::*;
    use crate::config::load_config;

    fn context_at(cwd: &Path) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
        }
    }

    #[test]
    fn flag_beats_env_for_project_root() {
        let temp = tempdir().expect("tempdir");
        let from_flag = temp.path().join("flag-root");
        let env = HashMap::from([(
            ENV_PROJECT_ROOT.to_string(),
            temp.path().join("env-root").to_string_lossy().to_string(),
        )]);
        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };

        let resolved =
            resolve_paths_with_lookup(&context_at(temp.path()), &overrides, |key| env.get(key).cloned());
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, PathSource::Flag);
        assert_eq!(resolved.db_path, from_flag.join(".dokumirror/data/dokumirror.db"));
        assert_eq!(resolved.search_db_path, from_flag.join(".dokumirror/data/search.db"));
    }

    #[test]
    fn env_data_dir_is_relative_to_root_and_blank_env_is_ignored() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let env = HashMap::from([
            (ENV_PROJECT_ROOT.to_string(), root.to_string_lossy().to_string()),
            (ENV_DATA_DIR.to_string(), "var/data".to_string()),
            (ENV_CONFIG.to_string(), "  ".to_string()),
        ]);

        let resolved = resolve_paths_with_lookup(
            &context_at(temp.path()),
            &PathOverrides::default(),
            |key| env.get(key).cloned(),
        );
        assert_eq!(resolved.root_source, PathSource::Env);
        assert_eq!(resolved.data_dir, root.join("var/data"));
        assert_eq!(resolved.db_path, root.join("var/data").join(DB_FILENAME));
        assert_eq!(resolved.data_source, PathSource::Env);
        assert_eq!(resolved.config_path, root.join(".dokumirror/config.toml"));
        assert_eq!(resolved.config_source, PathSource::Default);
    }

    #[test]
    fn root_falls_back_to_ancestor_then_cwd() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a/b");
        fs::create_dir_all(&nested).expect("nested");

        let bare = resolve_paths_with_lookup(&context_at(&nested), &PathOverrides::default(), |_| None);
        assert_eq!(bare.project_root, nested);
        assert_eq!(bare.root_source, PathSource::WorkingDir);

        fs::create_dir_all(root.join(STATE_DIR_NAME)).expect("state dir");
        let detected =
            resolve_paths_with_lookup(&context_at(&nested), &PathOverrides::default(), |_| None);
        assert_eq!(detected.project_root, root);
        assert_eq!(detected.root_source, PathSource::Ancestor);
        assert!(detected.diagnostics().contains("(ancestor)"));
    }

    #[test]
    fn init_creates_layout_once_and_respects_force() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_root(temp.path().to_path_buf(), PathSource::Flag);

        let report = init_layout(&paths, &InitOptions::default()).expect("init");
        assert_eq!(report.created_dirs.len(), 2);
        assert!(report.wrote_config);
        let config = load_config(&paths.config_path).expect("materialized config parses");
        assert!(config.remote.url.is_none());

        fs::write(&paths.config_path, "[sync]\nbatch_size = 5\n").expect("edit config");
        let again = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(again.created_dirs.is_empty());
        assert!(!again.wrote_config);
        assert_eq!(load_config(&paths.config_path).expect("kept").sync.batch_size, Some(5));

        let forced = init_layout(
            &paths,
            &InitOptions {
                force: true,
                ..InitOptions::default()
            },
        )
        .expect("forced init");
        assert!(forced.wrote_config);
        assert_eq!(load_config(&paths.config_path).expect("reset").sync.batch_size, None);
    }

    #[test]
    fn sync_readiness_requires_init() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::for_root(temp.path().to_path_buf(), PathSource::Flag);

        let status = inspect_runtime(&paths).expect("inspect");
        assert_eq!(status.warnings.len(), 2);
        assert_eq!(status.db_size_bytes, None);
        let err = ensure_runtime_ready_for_sync(&paths, &status).expect_err("must fail");
        assert!(err.to_string().contains("sync needs an initialized layout"));

        init_layout(&paths, &InitOptions::default()).expect("init");
        let status = inspect_runtime(&paths).expect("inspect");
        assert!(status.warnings.is_empty());
        ensure_runtime_ready_for_sync(&paths, &status).expect("ready");
    }
}
