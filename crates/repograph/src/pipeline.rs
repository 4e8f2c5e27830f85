#![forbid(unsafe_code)]

//! Run orchestration: load, parse, resolve, write, prune.
//!
//! The loader lists the snapshot once; fetching and parsing then fan out
//! over a rayon pool, one file per task. Resolution waits for every file to be parsed (or recorded as failed),
//! then consults a frozen symbol table. Writes are strictly sequential.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::{
    GITHUB_TOKEN_ENV, GRAPH_CREDENTIAL_ENV, GraphConnection, PipelineConfig, RepositoryCoordinate,
    resolve_credential,
};
use crate::db::{GraphStore, PruneScope, SqliteGraphStore};
use crate::error::{FetchError, ParseError, PipelineError, PipelineResult, StoreError};
use crate::parser::{ParseOptions, ParsedFile, parse_file};
use crate::resolution::{self, Resolution};
use crate::source::{LoadItem, SourceLoader, open_loader};
use crate::types::{
    Edge, FileRecord, Language, RunError, RunRecord, RunStatus, RunSummary, SkippedFile,
};
use crate::upsert::{UpsertEngine, WriteReport};
use crate::utils::{hash_sha256, unix_now};

/// Run-level cancellation signal. Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Parsing,
    Resolving,
    Writing,
    Pruning,
}

#[derive(Debug, Clone)]
pub struct RunProgress {
    pub phase: RunPhase,
    pub current: usize,
    /// 0 when the total is not known up front.
    pub total: usize,
    pub current_file: Option<String>,
}

/// Everything a caller supplies for one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub repository: RepositoryCoordinate,
    /// Access token for the hosting API.
    pub credential: Option<String>,
    pub graph: GraphConnection,
    pub config: PipelineConfig,
}

impl RunRequest {
    pub fn new(repository: RepositoryCoordinate, graph: GraphConnection) -> Self {
        Self {
            repository,
            credential: None,
            graph,
            config: PipelineConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    #[must_use]
    pub fn with_languages(mut self, languages: Vec<Language>) -> Self {
        self.config.languages = languages;
        self
    }

    #[must_use]
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.config.max_file_size = max_file_size;
        self
    }
}

pub fn run(request: &RunRequest, cancel: &CancellationToken) -> PipelineResult<RunSummary> {
    run_with_progress(request, cancel, None)
}

/// Validates every setup parameter before touching the repository or the
/// store's contents, then runs the pipeline.
pub fn run_with_progress(
    request: &RunRequest,
    cancel: &CancellationToken,
    on_progress: Option<&(dyn Fn(RunProgress) + Sync)>,
) -> PipelineResult<RunSummary> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }
    let config = &request.config;
    config.validate()?;

    let mut graph = request.graph.clone();
    if graph.credential.is_none() {
        graph.credential = resolve_credential(
            None,
            config.graph_credential_env.as_deref(),
            GRAPH_CREDENTIAL_ENV,
        )?;
    }
    graph.location()?;

    let token = match request.repository {
        RepositoryCoordinate::GitHub { .. } => resolve_credential(
            request.credential.clone(),
            config.github_token_env.as_deref(),
            GITHUB_TOKEN_ENV,
        )?,
        RepositoryCoordinate::Local { .. } => None,
    };
    let mut loader = open_loader(&request.repository, token, config)?;
    let mut store = SqliteGraphStore::connect(&graph, config)?;

    run_with(loader.as_mut(), &mut store, config, cancel, on_progress)
}

enum FileOutcome {
    Parsed(ParsedFile),
    Skipped(SkippedFile),
    FetchFailed(FetchError),
    ParseFailed { error: ParseError, content_hash: String },
}

/// Runs the pipeline against an already opened loader and store.
pub fn run_with(
    loader: &mut dyn SourceLoader,
    store: &mut dyn GraphStore,
    config: &PipelineConfig,
    cancel: &CancellationToken,
    on_progress: Option<&(dyn Fn(RunProgress) + Sync)>,
) -> PipelineResult<RunSummary> {
    let started = Instant::now();
    let started_at = unix_now();
    let repository = loader.describe();
    let run_id = new_run_id(&repository);
    info!(run_id = %run_id, repository = %repository, store = %store.describe(), "run started");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()
        .map_err(std::io::Error::other)?;

    let paths = loader.candidates()?;
    let outcomes = {
        let loader: &dyn SourceLoader = loader;
        let options = ParseOptions::from_config(config);
        let total = paths.len();
        let seen = AtomicUsize::new(0);
        pool.install(|| {
            paths
                .par_iter()
                .with_max_len(1)
                .filter_map(|path| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let outcome = load_and_parse(loader.load(path), &options);
                    let current = seen.fetch_add(1, Ordering::Relaxed) + 1;
                    if let Some(cb) = on_progress {
                        cb(RunProgress {
                            phase: RunPhase::Parsing,
                            current,
                            total,
                            current_file: Some(path.clone()),
                        });
                    }
                    Some(outcome)
                })
                .collect::<Vec<_>>()
        })
    };

    let mut summary = RunSummary {
        run_id: run_id.clone(),
        repository,
        snapshot: String::new(),
        status: RunStatus::Succeeded,
        files_seen: outcomes.len(),
        files_parsed: 0,
        files_skipped: Vec::new(),
        nodes_created: 0,
        nodes_updated: 0,
        nodes_deleted: 0,
        edges_created: 0,
        edges_deleted: 0,
        edges_dropped: 0,
        errors: Vec::new(),
        duration_ms: 0,
    };

    let mut parsed = Vec::new();
    let mut fetch_failures: Vec<FetchError> = Vec::new();
    let mut protected: HashSet<String> = HashSet::new();
    let mut fingerprint: Vec<(String, String)> = Vec::new();
    for outcome in outcomes {
        match outcome {
            FileOutcome::Parsed(file) => {
                fingerprint.push((file.path.clone(), file.content_hash.clone()));
                parsed.push(file);
            }
            FileOutcome::Skipped(skipped) => summary.files_skipped.push(skipped),
            FileOutcome::FetchFailed(err) => {
                protected.insert(err.path.clone());
                fetch_failures.push(err);
            }
            FileOutcome::ParseFailed {
                error,
                content_hash,
            } => {
                protected.insert(error.path.clone());
                fingerprint.push((error.path.clone(), content_hash));
                summary.errors.push(RunError::ParseError {
                    path: error.path,
                    line: error.line,
                    message: error.message,
                });
            }
        }
    }
    parsed.sort_by(|a, b| a.path.cmp(&b.path));
    summary
        .files_skipped
        .sort_by(|a, b| a.path.cmp(&b.path));
    summary.files_parsed = parsed.len();
    if let Some(err) = fetch_failure(&mut fetch_failures) {
        summary.errors.insert(0, err);
    }
    summary.snapshot = loader
        .snapshot()
        .unwrap_or_else(|| content_snapshot(&mut fingerprint));

    if cancel.is_cancelled() {
        return Ok(finish(store, summary, RunStatus::Cancelled, started, started_at));
    }

    if let Some(cb) = on_progress {
        cb(RunProgress {
            phase: RunPhase::Resolving,
            current: 0,
            total: parsed.len(),
            current_file: None,
        });
    }
    let resolution: Resolution = pool.install(|| resolution::resolve(&parsed));
    debug!(
        nodes = resolution.nodes.len(),
        edges = resolution.edges.len(),
        dropped = resolution.dropped,
        "resolved snapshot"
    );
    summary.edges_dropped = resolution.dropped;

    if cancel.is_cancelled() {
        return Ok(finish(store, summary, RunStatus::Cancelled, started, started_at));
    }

    let engine = UpsertEngine::from_config(config);
    let report: WriteReport = engine.write(
        store,
        &resolution.nodes,
        &resolution.edges,
        cancel,
        on_progress,
    );
    summary.nodes_created = report.nodes_created;
    summary.nodes_updated = report.nodes_updated;
    summary.edges_created = report.edges_created;
    summary.edges_dropped += report.skipped_edges;
    let complete = report.is_complete();
    let cancelled = report.cancelled;
    summary.errors.extend(report.errors);

    if cancelled {
        return Ok(finish(store, summary, RunStatus::Cancelled, started, started_at));
    }
    if !complete {
        return Ok(finish(store, summary, RunStatus::Failed, started, started_at));
    }

    if let Some(cb) = on_progress {
        cb(RunProgress {
            phase: RunPhase::Pruning,
            current: 0,
            total: 0,
            current_file: None,
        });
    }
    let status = match prune_and_sync(store, config, &run_id, &parsed, &resolution, &protected) {
        Ok((nodes_deleted, edges_deleted)) => {
            summary.nodes_deleted = nodes_deleted;
            summary.edges_deleted = edges_deleted;
            RunStatus::Succeeded
        }
        Err(err) => {
            error!(error = %err, "pruning previous snapshot failed");
            summary.errors.push(RunError::WriteError {
                batch: report.batches_written,
                message: format!("prune failed: {err}"),
                unwritten: Vec::new(),
            });
            RunStatus::Failed
        }
    };

    Ok(finish(store, summary, status, started, started_at))
}

fn load_and_parse(item: LoadItem, options: &ParseOptions) -> FileOutcome {
    match item {
        LoadItem::Loaded(file) => match parse_file(&file, options) {
            Ok(parsed) => FileOutcome::Parsed(parsed),
            Err(error) => {
                warn!(path = %error.path, line = ?error.line, error = %error.message, "parse failed");
                FileOutcome::ParseFailed {
                    error,
                    content_hash: file.content_hash,
                }
            }
        },
        LoadItem::Skipped(skipped) => FileOutcome::Skipped(skipped),
        LoadItem::Failed(err) => FileOutcome::FetchFailed(err),
    }
}

/// Folds every failed fetch into one report entry naming all paths.
fn fetch_failure(failures: &mut [FetchError]) -> Option<RunError> {
    let first = failures.first()?.to_string();
    failures.sort_by(|a, b| a.path.cmp(&b.path));
    let paths: Vec<String> = failures.iter().map(|f| f.path.clone()).collect();
    warn!(count = paths.len(), "files could not be fetched");
    Some(RunError::FetchError {
        message: format!("{} file(s) could not be fetched; first error: {first}", paths.len()),
        paths,
    })
}

/// SHA-256 over the sorted `(path, content_hash)` list.
fn content_snapshot(fingerprint: &mut [(String, String)]) -> String {
    fingerprint.sort();
    let joined: Vec<String> = fingerprint
        .iter()
        .map(|(path, hash)| format!("{path}\t{hash}"))
        .collect();
    hash_sha256(&joined.join("\n"))
}

fn prune_and_sync(
    store: &mut dyn GraphStore,
    config: &PipelineConfig,
    run_id: &str,
    parsed: &[ParsedFile],
    resolution: &Resolution,
    protected: &HashSet<String>,
) -> Result<(usize, usize), StoreError> {
    let nodes: HashSet<String> = resolution.nodes.iter().map(|n| n.id.clone()).collect();
    let edges: HashSet<Edge> = resolution.edges.iter().cloned().collect();
    let stats = store.prune(
        &PruneScope {
            nodes: &nodes,
            edges: &edges,
            protected_files: protected,
        },
        config.delete_policy,
    )?;

    let indexed_at = unix_now();
    let records: Vec<FileRecord> = parsed
        .iter()
        .map(|file| FileRecord {
            path: file.path.clone(),
            content_hash: file.content_hash.clone(),
            language: file.language,
            size: file.size,
            indexed_at,
            run_id: run_id.to_string(),
        })
        .collect();
    store.sync_files(&records, protected)?;
    Ok((stats.nodes_deleted, stats.edges_deleted))
}

fn finish(
    store: &mut dyn GraphStore,
    mut summary: RunSummary,
    status: RunStatus,
    started: Instant,
    started_at: i64,
) -> RunSummary {
    summary.status = status;
    summary.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let record = RunRecord {
        started_at,
        finished_at: unix_now(),
        summary,
    };
    if let Err(err) = store.record_run(&record) {
        error!(run_id = %record.summary.run_id, error = %err, "failed to record run");
    }
    let summary = record.summary;

    info!(
        run_id = %summary.run_id,
        status = summary.status.as_str(),
        files_seen = summary.files_seen,
        files_parsed = summary.files_parsed,
        files_skipped = summary.files_skipped.len(),
        nodes_created = summary.nodes_created,
        nodes_updated = summary.nodes_updated,
        nodes_deleted = summary.nodes_deleted,
        edges_created = summary.edges_created,
        edges_deleted = summary.edges_deleted,
        edges_dropped = summary.edges_dropped,
        errors = summary.errors.len(),
        duration_ms = summary.duration_ms,
        "run finished"
    );
    summary
}

fn new_run_id(repository: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seed = format!("{repository}|{nanos}|{}", std::process::id());
    hash_sha256(&seed)[..16].to_string()
}
