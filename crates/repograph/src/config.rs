#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{IoDirection, Language};

pub const CONFIG_FILENAME: &str = "repograph.toml";
pub const GITHUB_TOKEN_ENV: &str = "REPOGRAPH_GITHUB_TOKEN";
pub const GRAPH_CREDENTIAL_ENV: &str = "REPOGRAPH_GRAPH_CREDENTIAL";

static GITHUB_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:https?://)?github\.com/([\w.-]+)/([\w.-]+?)(?:\.git)?/?(?:@([\w./-]+))?$")
        .unwrap()
});

static GITHUB_SHORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\w.-]+)/([\w.-]+)(?:@([\w./-]+))?$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    Hard,
    Soft,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoSignature {
    /// Callee text to match: a bare name (`open`), a dotted suffix
    /// (`json.load`) or a method name (`to_csv`).
    pub callee: String,
    pub direction: IoDirection,
}

impl IoSignature {
    fn new(callee: &str, direction: IoDirection) -> Self {
        Self {
            callee: callee.to_string(),
            direction,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub languages: Vec<Language>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub max_file_size: u64,
    pub io_signatures: Vec<IoSignature>,
    pub route_decorators: Vec<String>,
    /// Parser/resolver worker threads; 0 uses all available cores.
    pub workers: usize,
    pub batch_size: usize,
    pub write_retries: u32,
    pub fetch_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub http_timeout_secs: u64,
    pub store_busy_timeout_ms: u64,
    pub delete_policy: DeletePolicy,
    /// Environment variable holding the remote hosting token.
    pub github_token_env: Option<String>,
    /// Environment variable holding the graph store credential.
    pub graph_credential_env: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            languages: vec![Language::Python],
            include: default_include_patterns(),
            exclude: default_exclude_patterns(),
            max_file_size: 1024 * 1024,
            io_signatures: default_io_signatures(),
            route_decorators: default_route_decorators(),
            workers: 0,
            batch_size: 500,
            write_retries: 3,
            fetch_retries: 4,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            http_timeout_secs: 30,
            store_busy_timeout_ms: 5_000,
            delete_policy: DeletePolicy::Hard,
            github_token_env: None,
            graph_credential_env: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.languages.is_empty() {
            return Err(ConfigError::Invalid("no languages selected".into()));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry_base_delay_ms exceeds retry_max_delay_ms".into(),
            ));
        }
        for pattern in self.include.iter().chain(&self.exclude) {
            globset::Glob::new(pattern)
                .map_err(|err| ConfigError::Invalid(format!("bad glob '{pattern}': {err}")))?;
        }
        Ok(())
    }
}

pub fn config_path(project_root: &Path) -> PathBuf {
    project_root.join(CONFIG_FILENAME)
}

pub fn load_config_file(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| ConfigError::Invalid(format!("{}: {err}", path.display())))?;
    parse_config(&raw)
}

/// Loads `repograph.toml` from the project root, falling back to defaults.
pub fn load_config(project_root: &Path) -> Result<PipelineConfig, ConfigError> {
    let path = config_path(project_root);
    if !path.exists() {
        return Ok(PipelineConfig::default());
    }
    load_config_file(&path)
}

pub fn parse_config(raw: &str) -> Result<PipelineConfig, ConfigError> {
    let config: PipelineConfig = toml::from_str(raw)?;
    config.validate()?;
    Ok(config)
}

/// Where the repository snapshot comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryCoordinate {
    Local {
        root: PathBuf,
    },
    GitHub {
        owner: String,
        repo: String,
        git_ref: Option<String>,
    },
}

impl RepositoryCoordinate {
    /// Accepts a local directory, `owner/repo[@ref]` or a github.com URL.
    /// Existing local paths win over the short GitHub form.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidRepository(raw.to_string()));
        }
        if let Some(caps) = GITHUB_URL.captures(trimmed) {
            return Ok(Self::github_from(&caps));
        }
        let as_path = Path::new(trimmed);
        if as_path.exists() {
            return Ok(Self::Local {
                root: as_path.to_path_buf(),
            });
        }
        if let Some(caps) = GITHUB_SHORT.captures(trimmed) {
            return Ok(Self::github_from(&caps));
        }
        Err(ConfigError::InvalidRepository(raw.to_string()))
    }

    fn github_from(caps: &regex::Captures<'_>) -> Self {
        Self::GitHub {
            owner: caps[1].to_string(),
            repo: caps[2].to_string(),
            git_ref: caps.get(3).map(|m| m.as_str().to_string()),
        }
    }
}

impl fmt::Display for RepositoryCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { root } => write!(f, "{}", root.display()),
            Self::GitHub {
                owner,
                repo,
                git_ref: Some(git_ref),
            } => write!(f, "github.com/{owner}/{repo}@{git_ref}"),
            Self::GitHub { owner, repo, .. } => write!(f, "github.com/{owner}/{repo}"),
        }
    }
}

/// Connection parameters for the graph store.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct GraphConnection {
    pub uri: String,
    pub principal: Option<String>,
    pub credential: Option<String>,
}

impl fmt::Debug for GraphConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphConnection")
            .field("uri", &self.uri)
            .field("principal", &self.principal)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    File(PathBuf),
    Memory,
}

impl GraphConnection {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            principal: None,
            credential: None,
        }
    }

    pub fn sqlite(path: &Path) -> Self {
        Self::new(format!("sqlite://{}", path.display()))
    }

    pub fn location(&self) -> Result<StoreLocation, ConfigError> {
        let uri = self.uri.trim();
        if uri.is_empty() {
            return Err(ConfigError::MissingGraphUri);
        }
        if let Some(principal) = &self.principal
            && self.credential.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::MissingCredential(principal.clone()));
        }
        if uri == "sqlite::memory:" {
            return Ok(StoreLocation::Memory);
        }
        match uri.strip_prefix("sqlite://") {
            Some(path) if !path.is_empty() => Ok(StoreLocation::File(PathBuf::from(path))),
            _ => Err(ConfigError::UnsupportedScheme(uri.to_string())),
        }
    }
}

/// Resolves a credential: explicit value first, then the configured
/// environment variable (which must exist if named), then the default one.
pub fn resolve_credential(
    explicit: Option<String>,
    configured_env: Option<&str>,
    default_env: &str,
) -> Result<Option<String>, ConfigError> {
    if explicit.is_some() {
        return Ok(explicit);
    }
    if let Some(var) = configured_env {
        return std::env::var(var)
            .map(Some)
            .map_err(|_| ConfigError::MissingEnv(var.to_string()));
    }
    Ok(std::env::var(default_env).ok().filter(|v| !v.is_empty()))
}

pub fn default_include_patterns() -> Vec<String> {
    vec!["**/*.py", "**/*.pyw", "*.py", "*.pyw"]
        .into_iter()
        .map(std::string::ToString::to_string)
        .collect()
}

pub fn default_exclude_patterns() -> Vec<String> {
    vec![
        "**/.git/**",
        "**/__pycache__/**",
        "**/.venv/**",
        "**/venv/**",
        "**/env/**",
        "**/.tox/**",
        "**/.nox/**",
        "**/.pytest_cache/**",
        "**/.mypy_cache/**",
        "**/.ruff_cache/**",
        "**/*.egg-info/**",
        "**/.eggs/**",
        "**/site-packages/**",
        "**/node_modules/**",
        "**/build/**",
        "**/dist/**",
    ]
    .into_iter()
    .map(std::string::ToString::to_string)
    .collect()
}

pub fn default_io_signatures() -> Vec<IoSignature> {
    use IoDirection::{Read, Write};
    vec![
        IoSignature::new("open", Read),
        IoSignature::new("read_csv", Read),
        IoSignature::new("read_json", Read),
        IoSignature::new("read_excel", Read),
        IoSignature::new("read_parquet", Read),
        IoSignature::new("json.load", Read),
        IoSignature::new("np.load", Read),
        IoSignature::new("requests.get", Read),
        IoSignature::new("to_csv", Write),
        IoSignature::new("to_json", Write),
        IoSignature::new("to_excel", Write),
        IoSignature::new("to_parquet", Write),
        IoSignature::new("json.dump", Write),
        IoSignature::new("np.save", Write),
        IoSignature::new("requests.post", Write),
        IoSignature::new("requests.put", Write),
    ]
}

pub fn default_route_decorators() -> Vec<String> {
    ["route", "get", "post", "put", "delete", "patch"]
        .into_iter()
        .map(std::string::ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_github_coordinates() {
        let coord = RepositoryCoordinate::parse("https://github.com/acme/widgets.git").unwrap();
        assert_eq!(
            coord,
            RepositoryCoordinate::GitHub {
                owner: "acme".into(),
                repo: "widgets".into(),
                git_ref: None,
            }
        );

        let coord = RepositoryCoordinate::parse("acme/widgets@v1.2").unwrap();
        assert_eq!(
            coord,
            RepositoryCoordinate::GitHub {
                owner: "acme".into(),
                repo: "widgets".into(),
                git_ref: Some("v1.2".into()),
            }
        );
    }

    #[test]
    fn existing_directory_is_local() {
        let dir = tempfile::TempDir::new().unwrap();
        let coord = RepositoryCoordinate::parse(dir.path().to_str().unwrap()).unwrap();
        assert!(matches!(coord, RepositoryCoordinate::Local { .. }));
    }

    #[test]
    fn graph_uri_validation() {
        assert!(matches!(
            GraphConnection::new("").location(),
            Err(ConfigError::MissingGraphUri)
        ));
        assert!(matches!(
            GraphConnection::new("bolt://localhost:7687").location(),
            Err(ConfigError::UnsupportedScheme(_))
        ));
        assert_eq!(
            GraphConnection::new("sqlite::memory:").location().unwrap(),
            StoreLocation::Memory
        );

        let mut conn = GraphConnection::new("sqlite:///tmp/g.db");
        conn.principal = Some("neo".into());
        assert!(matches!(
            conn.location(),
            Err(ConfigError::MissingCredential(_))
        ));
        conn.credential = Some("secret".into());
        assert_eq!(
            conn.location().unwrap(),
            StoreLocation::File(PathBuf::from("/tmp/g.db"))
        );
        assert!(!format!("{conn:?}").contains("secret"));
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg = parse_config(
            r#"
            batch_size = 25
            delete_policy = "soft"
            route_decorators = ["route"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.delete_policy, DeletePolicy::Soft);
        assert_eq!(cfg.route_decorators, vec!["route".to_string()]);
        assert_eq!(cfg.max_file_size, 1024 * 1024);
    }

    #[test]
    fn rejects_zero_batch_size() {
        assert!(parse_config("batch_size = 0").is_err());
    }

    #[test]
    fn named_but_unset_env_is_an_error() {
        let err = resolve_credential(None, Some("REPOGRAPH_TEST_SURELY_UNSET_VAR"), "X").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv(_)));
    }
}
