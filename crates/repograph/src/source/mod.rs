#![forbid(unsafe_code)]

//! Source loaders: enumerate a repository snapshot as
//! `(path, content, content_hash)` triples, lazily.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use crate::config::{PipelineConfig, RepositoryCoordinate};
use crate::error::{ConfigError, FetchError, PipelineError};
use crate::types::{Language, SkipReason, SkippedFile, SourceFile};
use crate::utils::hash_bytes;

pub mod local;
pub mod remote;

pub use local::LocalLoader;
pub use remote::GitHubLoader;

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_LEN: usize = 8_000;

#[derive(Debug, Clone)]
pub enum LoadItem {
    Loaded(SourceFile),
    Skipped(SkippedFile),
    Failed(FetchError),
}

pub type LoadIter<'a> = Box<dyn Iterator<Item = LoadItem> + Send + 'a>;

/// A repository snapshot, listed once and then loaded path by path.
///
/// `load` takes `&self` so the pipeline can fetch from many worker
/// threads at once.
pub trait SourceLoader: Send + Sync {
    /// Human-readable repository coordinate for logs and provenance.
    fn describe(&self) -> String;

    /// Snapshot identity known to the host (commit SHA), if any. Valid
    /// after `candidates` has been called.
    fn snapshot(&self) -> Option<String>;

    /// Lists candidate paths in sorted order. An `Err` means the snapshot
    /// itself could not be listed.
    fn candidates(&mut self) -> Result<Vec<String>, PipelineError>;

    /// Reads or fetches one listed path.
    fn load(&self, path: &str) -> LoadItem;

    /// Lists the snapshot, then loads each file lazily on this thread.
    fn files(&mut self) -> Result<LoadIter<'_>, PipelineError> {
        let paths = self.candidates()?;
        let this = &*self;
        Ok(Box::new(paths.into_iter().map(move |path| this.load(&path))))
    }
}

pub fn open_loader(
    coordinate: &RepositoryCoordinate,
    credential: Option<String>,
    config: &PipelineConfig,
) -> Result<Box<dyn SourceLoader>, PipelineError> {
    let filter = FileFilter::new(config)?;
    match coordinate {
        RepositoryCoordinate::Local { root } => {
            if !root.is_dir() {
                return Err(ConfigError::MissingRoot(root.display().to_string()).into());
            }
            Ok(Box::new(LocalLoader::new(root, filter)))
        }
        RepositoryCoordinate::GitHub {
            owner,
            repo,
            git_ref,
        } => Ok(Box::new(GitHubLoader::new(
            owner,
            repo,
            git_ref.clone(),
            credential,
            config,
            filter,
        ))),
    }
}

/// Include/exclude globs, language filter and size ceiling.
#[derive(Debug, Clone)]
pub struct FileFilter {
    include: GlobSet,
    exclude: GlobSet,
    /// `exclude` patterns of the form `<dir>/**`, matched against the
    /// directory path itself so whole subtrees are pruned from the walk.
    exclude_dirs: GlobSet,
    languages: Vec<Language>,
    max_file_size: u64,
}

impl FileFilter {
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            include: build_globset(&config.include)?,
            exclude: build_globset(&config.exclude)?,
            exclude_dirs: build_globset(&directory_patterns(&config.exclude))?,
            languages: config.languages.clone(),
            max_file_size: config.max_file_size,
        })
    }

    pub fn is_excluded_dir(&self, rel_dir: &str) -> bool {
        self.exclude_dirs.is_match(rel_dir) || self.exclude.is_match(format!("{rel_dir}/"))
    }

    /// Whether a path is a candidate at all. Non-candidates are silently
    /// ignored rather than reported as skipped.
    pub fn is_candidate(&self, rel_path: &str) -> bool {
        !self.exclude.is_match(rel_path) && self.include.is_match(rel_path)
    }

    /// Size/language checks that can run before content is read.
    pub fn precheck(&self, rel_path: &str, size: u64) -> Option<SkipReason> {
        let language = detect_language(rel_path);
        if language == Language::Unknown || !self.languages.contains(&language) {
            return Some(SkipReason::UnsupportedLanguage);
        }
        if size > self.max_file_size {
            return Some(SkipReason::TooLarge {
                size,
                limit: self.max_file_size,
            });
        }
        None
    }

    /// Turns raw bytes into a loaded file or a skip.
    pub fn classify(&self, rel_path: &str, bytes: Vec<u8>) -> LoadItem {
        let size = bytes.len() as u64;
        if let Some(reason) = self.precheck(rel_path, size) {
            return skipped(rel_path, reason);
        }
        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
        if sniff.contains(&0) {
            return skipped(rel_path, SkipReason::Binary);
        }
        let content_hash = hash_bytes(&bytes);
        match String::from_utf8(bytes) {
            Ok(content) => LoadItem::Loaded(SourceFile {
                path: rel_path.to_string(),
                content,
                content_hash,
                language: detect_language(rel_path),
            }),
            Err(_) => skipped(rel_path, SkipReason::Binary),
        }
    }
}

pub(crate) fn skipped(rel_path: &str, reason: SkipReason) -> LoadItem {
    if matches!(reason, SkipReason::TooLarge { .. } | SkipReason::Binary) {
        warn!(path = rel_path, %reason, "skipping file");
    }
    LoadItem::Skipped(SkippedFile {
        path: rel_path.to_string(),
        reason,
    })
}

/// Directory globs for patterns that exclude a whole subtree.
fn directory_patterns(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .filter_map(|pattern| pattern.strip_suffix("/**"))
        .filter(|dir| !dir.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, ConfigError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|err| ConfigError::Invalid(format!("bad glob '{pattern}': {err}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| ConfigError::Invalid(err.to_string()))
}

pub fn detect_language(path: &str) -> Language {
    let ext = Path::new(path)
        .extension()
        .and_then(|v| v.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "py" | "pyw" => Language::Python,
        _ => Language::Unknown,
    }
}
