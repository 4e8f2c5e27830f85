//! Integration tests for whole pipeline runs

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use repograph::config::{DeletePolicy, GraphConnection, PipelineConfig, RepositoryCoordinate};
use repograph::db::{BatchStats, GraphStore, PruneScope, PruneStats, SqliteGraphStore};
use repograph::error::{ConfigError, PipelineError, StoreError, StoreResult};
use repograph::graph;
use repograph::pipeline::{self, CancellationToken, RunRequest};
use repograph::source::{FileFilter, LoadItem, LocalLoader, SourceLoader};
use repograph::types::{
    Edge, EdgeKind, FileRecord, Language, Node, NodeKind, RunError, RunRecord, RunStatus,
    RunSummary, SourceFile,
};
use repograph::utils::hash_sha256;
use tempfile::TempDir;

fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }
}

fn run_local(
    root: &Path,
    store: &mut dyn GraphStore,
    config: &PipelineConfig,
    cancel: &CancellationToken,
) -> RunSummary {
    let mut loader = LocalLoader::new(root, FileFilter::new(config).unwrap());
    pipeline::run_with(&mut loader, store, config, cancel, None).unwrap()
}

fn ingest(root: &Path, store: &mut SqliteGraphStore) -> RunSummary {
    run_local(
        root,
        store,
        &PipelineConfig::default(),
        &CancellationToken::new(),
    )
}

fn one(store: &SqliteGraphStore, kind: NodeKind, name: &str) -> Node {
    let found: Vec<Node> = store
        .find_nodes_by_name(name)
        .unwrap()
        .into_iter()
        .filter(|n| n.kind() == kind)
        .collect();
    assert_eq!(found.len(), 1, "expected one {kind} named {name}: {found:?}");
    found.into_iter().next().unwrap()
}

fn targets(store: &SqliteGraphStore, source: &Node, kind: EdgeKind) -> Vec<String> {
    store
        .edges_from(&source.id, Some(kind))
        .unwrap()
        .into_iter()
        .map(|e| e.target)
        .collect()
}

const BASE_AND_HELPER: &str = "class Base:\n    pass\n\n\ndef helper():\n    return 1\n";
const CHILD: &str = "import A\nfrom A import Base\n\n\nclass Child(Base):\n    def build(self):\n        return helper()\n";

#[test]
fn test_two_file_scenario() {
    let temp = TempDir::new().unwrap();
    write_files(temp.path(), &[("A.py", BASE_AND_HELPER), ("B.py", CHILD)]);
    let mut store = SqliteGraphStore::open_in_memory().unwrap();

    let summary = ingest(temp.path(), &mut store);
    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.files_seen, 2);
    assert_eq!(summary.files_parsed, 2);
    assert!(summary.errors.is_empty());

    let base = one(&store, NodeKind::Class, "Base");
    let child = one(&store, NodeKind::Class, "Child");
    let build = one(&store, NodeKind::Function, "build");
    let helper = one(&store, NodeKind::Function, "helper");
    let file_a = one(&store, NodeKind::File, "A.py");
    let file_b = one(&store, NodeKind::File, "B.py");
    let module_a = one(&store, NodeKind::Module, "A");

    assert_eq!(targets(&store, &child, EdgeKind::Extends), vec![base.id.clone()]);
    assert_eq!(targets(&store, &build, EdgeKind::Calls), vec![helper.id.clone()]);
    assert_eq!(targets(&store, &build, EdgeKind::BelongsTo), vec![child.id.clone()]);
    assert_eq!(targets(&store, &child, EdgeKind::BelongsTo), vec![file_b.id.clone()]);
    assert_eq!(targets(&store, &helper, EdgeKind::BelongsTo), vec![file_a.id.clone()]);
    assert_eq!(targets(&store, &file_b, EdgeKind::Imports), vec![module_a.id.clone()]);
    assert_eq!(targets(&store, &module_a, EdgeKind::BelongsTo), vec![file_a.id.clone()]);
    assert_eq!(module_a.owner_file.as_deref(), Some("A.py"));

    let deps: Vec<String> = graph::depends_on(&store, &child.id, 5)
        .unwrap()
        .into_iter()
        .map(|d| d.node.id)
        .collect();
    assert_eq!(deps, vec![base.id.clone()]);

    let deps: Vec<String> = graph::depends_on(&store, &build.id, 5)
        .unwrap()
        .into_iter()
        .map(|d| d.node.id)
        .collect();
    assert_eq!(deps, vec![helper.id]);
    assert_eq!(store.dangling_edge_count().unwrap(), 0);
}

#[test]
fn test_parse_error_is_isolated() {
    let temp = TempDir::new().unwrap();
    let valid: Vec<(String, String)> = (0..10)
        .map(|i| (format!("pkg/mod{i}.py"), format!("def f{i}():\n    return {i}\n")))
        .collect();
    let mut files: Vec<(&str, &str)> = valid
        .iter()
        .map(|(p, c)| (p.as_str(), c.as_str()))
        .collect();
    files.push(("pkg/broken.py", "def broken(:\n    pass\n"));
    write_files(temp.path(), &files);

    let mut store = SqliteGraphStore::open_in_memory().unwrap();
    let summary = ingest(temp.path(), &mut store);

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.files_seen, 11);
    assert_eq!(summary.files_parsed, 10);
    let parse_errors: Vec<&RunError> = summary.parse_errors().collect();
    assert_eq!(parse_errors.len(), 1);
    assert!(matches!(
        parse_errors[0],
        RunError::ParseError { path, line: Some(_), .. } if path == "pkg/broken.py"
    ));

    for i in 0..10 {
        one(&store, NodeKind::Function, &format!("f{i}"));
    }
    assert!(store.find_nodes_by_name("broken").unwrap().is_empty());
    assert_eq!(store.nodes_by_kind(NodeKind::File).unwrap().len(), 10);
    assert_eq!(store.files().unwrap().len(), 10);
}

#[test]
fn test_parse_error_protects_previous_entities() {
    let temp = TempDir::new().unwrap();
    write_files(temp.path(), &[("A.py", BASE_AND_HELPER), ("B.py", CHILD)]);
    let mut store = SqliteGraphStore::open_in_memory().unwrap();
    ingest(temp.path(), &mut store);
    // Module nodes are re-derived by importers, so only declarations count.
    let declared: Vec<Node> = store
        .nodes_owned_by("A.py")
        .unwrap()
        .into_iter()
        .filter(|n| n.kind() != NodeKind::Module)
        .collect();
    assert_eq!(declared.len(), 3);

    write_files(temp.path(), &[("A.py", "class Base(:\n")]);
    let summary = ingest(temp.path(), &mut store);

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.parse_errors().count(), 1);
    assert_eq!(summary.nodes_deleted, 0);
    for node in &declared {
        assert_eq!(store.node(&node.id).unwrap().as_ref(), Some(node));
    }
    assert_eq!(store.dangling_edge_count().unwrap(), 0);
    assert!(store.files().unwrap().iter().any(|f| f.path == "A.py"));
}

#[test]
fn test_resync_removes_deleted_function() {
    let temp = TempDir::new().unwrap();
    write_files(temp.path(), &[("A.py", BASE_AND_HELPER), ("B.py", CHILD)]);
    let mut store = SqliteGraphStore::open_in_memory().unwrap();
    ingest(temp.path(), &mut store);

    let helper = one(&store, NodeKind::Function, "helper");
    let build = one(&store, NodeKind::Function, "build");
    assert_eq!(targets(&store, &build, EdgeKind::Calls), vec![helper.id.clone()]);

    write_files(temp.path(), &[("A.py", "class Base:\n    pass\n")]);
    let summary = ingest(temp.path(), &mut store);

    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.nodes_deleted, 1);
    assert!(summary.edges_deleted >= 2);
    assert!(store.node(&helper.id).unwrap().is_none());
    assert!(targets(&store, &build, EdgeKind::Calls).is_empty());
    assert!(store.edges_to(&helper.id, None).unwrap().is_empty());
    assert_eq!(store.dangling_edge_count().unwrap(), 0);
    one(&store, NodeKind::Class, "Base");
}

/// Every live non-File node that has an owner belongs to exactly one thing.
fn assert_single_owner(store: &SqliteGraphStore) {
    for kind in NodeKind::ALL {
        for node in store.nodes_by_kind(kind).unwrap() {
            let owners = targets(store, &node, EdgeKind::BelongsTo).len();
            match (kind, &node.owner_file) {
                (NodeKind::File, _) | (_, None) => assert_eq!(owners, 0, "{node:?}"),
                (_, Some(_)) => assert_eq!(owners, 1, "{node:?}"),
            }
        }
    }
}

#[test]
fn test_removed_callee_of_unparsable_file_is_pruned_cleanly() {
    for policy in [DeletePolicy::Hard, DeletePolicy::Soft] {
        let temp = TempDir::new().unwrap();
        write_files(
            temp.path(),
            &[
                ("a.py", "from b import helper\n\n\ndef go():\n    return helper()\n"),
                ("b.py", "def helper():\n    return 1\n\n\ndef other():\n    return 2\n"),
            ],
        );
        let config = PipelineConfig {
            delete_policy: policy,
            ..PipelineConfig::default()
        };
        let mut store = SqliteGraphStore::open_in_memory().unwrap();
        run_local(temp.path(), &mut store, &config, &CancellationToken::new());
        let helper = one(&store, NodeKind::Function, "helper");
        let go = one(&store, NodeKind::Function, "go");
        assert_eq!(targets(&store, &go, EdgeKind::Calls), vec![helper.id.clone()]);

        write_files(
            temp.path(),
            &[
                ("a.py", "from b import helper\n\n\ndef go(:\n    return helper()\n"),
                ("b.py", "def other():\n    return 2\n"),
            ],
        );
        let summary = run_local(temp.path(), &mut store, &config, &CancellationToken::new());

        assert_eq!(summary.status, RunStatus::Succeeded, "{policy:?}");
        assert_eq!(summary.parse_errors().count(), 1);
        assert!(store.node(&helper.id).unwrap().is_none(), "{policy:?}");
        assert_eq!(store.node(&go.id).unwrap().as_ref(), Some(&go));
        assert!(targets(&store, &go, EdgeKind::Calls).is_empty());
        assert!(store.edges_to(&helper.id, None).unwrap().is_empty());
        one(&store, NodeKind::Function, "other");
        assert_single_owner(&store);
        assert_eq!(store.dangling_edge_count().unwrap(), 0);
    }
}

#[test]
fn test_moved_function_keeps_one_entity() {
    let temp = TempDir::new().unwrap();
    write_files(
        temp.path(),
        &[
            ("A.py", "def util(x):\n    return x\n\n\nclass Base:\n    pass\n"),
            ("B.py", "def caller():\n    return util(1)\n"),
        ],
    );
    let mut store = SqliteGraphStore::open_in_memory().unwrap();
    ingest(temp.path(), &mut store);
    let old = one(&store, NodeKind::Function, "util");
    assert_eq!(old.owner_file.as_deref(), Some("A.py"));

    write_files(
        temp.path(),
        &[
            ("A.py", "class Base:\n    pass\n"),
            ("C.py", "def util(x):\n    return x\n"),
        ],
    );
    let summary = ingest(temp.path(), &mut store);
    assert_eq!(summary.status, RunStatus::Succeeded);

    let moved = one(&store, NodeKind::Function, "util");
    let file_c = one(&store, NodeKind::File, "C.py");
    let caller = one(&store, NodeKind::Function, "caller");
    assert_eq!(moved.owner_file.as_deref(), Some("C.py"));
    assert_eq!(moved.attrs, old.attrs);
    assert!(store.node(&old.id).unwrap().is_none());

    assert_eq!(targets(&store, &moved, EdgeKind::BelongsTo), vec![file_c.id]);
    assert_eq!(targets(&store, &caller, EdgeKind::Calls), vec![moved.id.clone()]);
    assert_eq!(targets(&store, &moved, EdgeKind::HasParameter).len(), 1);
    assert_eq!(store.dangling_edge_count().unwrap(), 0);
}

#[test]
fn test_pre_cancelled_run_writes_nothing() {
    let temp = TempDir::new().unwrap();
    write_files(temp.path(), &[("A.py", BASE_AND_HELPER)]);
    let mut store = SqliteGraphStore::open_in_memory().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let summary = run_local(temp.path(), &mut store, &PipelineConfig::default(), &cancel);
    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(summary.nodes_created, 0);
    assert_eq!(store.node_count().unwrap(), 0);

    let runs = store.recent_runs(5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].summary.status, RunStatus::Cancelled);
}

#[test]
fn test_setup_errors_are_fatal() {
    let temp = TempDir::new().unwrap();
    let local = RepositoryCoordinate::Local {
        root: temp.path().to_path_buf(),
    };
    let cancel = CancellationToken::new();

    let request = RunRequest::new(local.clone(), GraphConnection::new(""));
    assert!(matches!(
        pipeline::run(&request, &cancel),
        Err(PipelineError::Config(ConfigError::MissingGraphUri))
    ));

    let request = RunRequest::new(local.clone(), GraphConnection::new("bolt://graph:7687"));
    assert!(matches!(
        pipeline::run(&request, &cancel),
        Err(PipelineError::Config(ConfigError::UnsupportedScheme(_)))
    ));

    let graph = GraphConnection {
        uri: "sqlite::memory:".to_string(),
        principal: Some("ingest".to_string()),
        credential: Some(String::new()),
    };
    let request = RunRequest::new(local.clone(), graph);
    assert!(matches!(
        pipeline::run(&request, &cancel),
        Err(PipelineError::Config(ConfigError::MissingCredential(_)))
    ));

    let bad_config = PipelineConfig {
        batch_size: 0,
        ..PipelineConfig::default()
    };
    let request =
        RunRequest::new(local, GraphConnection::new("sqlite::memory:")).with_config(bad_config);
    assert!(matches!(
        pipeline::run(&request, &cancel),
        Err(PipelineError::Config(ConfigError::Invalid(_)))
    ));
}

#[test]
fn test_run_against_sqlite_file() {
    let temp = TempDir::new().unwrap();
    let repo = temp.path().join("repo");
    write_files(&repo, &[("A.py", BASE_AND_HELPER), ("B.py", CHILD)]);
    let db_path = temp.path().join("graph.db");

    let request = RunRequest::new(
        RepositoryCoordinate::Local { root: repo },
        GraphConnection::sqlite(&db_path),
    );
    let summary = pipeline::run(&request, &CancellationToken::new()).unwrap();
    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.snapshot.len(), 64);

    let store =
        SqliteGraphStore::connect(&GraphConnection::sqlite(&db_path), &PipelineConfig::default())
            .unwrap();
    assert_eq!(store.node_count().unwrap(), summary.nodes_created);
    let runs = store.recent_runs(1).unwrap();
    assert_eq!(runs[0].summary.run_id, summary.run_id);
}

/// Delegates to an in-memory store and misbehaves on demand.
struct TestStore {
    inner: SqliteGraphStore,
    failures_left: usize,
    cancel_after_write: Option<CancellationToken>,
    attempts: usize,
}

impl TestStore {
    fn new(inner: SqliteGraphStore) -> Self {
        Self {
            inner,
            failures_left: 0,
            cancel_after_write: None,
            attempts: 0,
        }
    }
}

impl GraphStore for TestStore {
    fn describe(&self) -> String {
        format!("test({})", self.inner.describe())
    }

    fn upsert_batch(&mut self, nodes: &[Node], edges: &[Edge]) -> StoreResult<BatchStats> {
        self.attempts += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        let stats = self.inner.upsert_batch(nodes, edges)?;
        if let Some(cancel) = &self.cancel_after_write {
            cancel.cancel();
        }
        Ok(stats)
    }

    fn prune(&mut self, scope: &PruneScope<'_>, policy: DeletePolicy) -> StoreResult<PruneStats> {
        self.inner.prune(scope, policy)
    }

    fn sync_files(&mut self, files: &[FileRecord], protected: &HashSet<String>) -> StoreResult<()> {
        self.inner.sync_files(files, protected)
    }

    fn record_run(&mut self, record: &RunRecord) -> StoreResult<()> {
        self.inner.record_run(record)
    }
}

fn fast_retries(write_retries: u32) -> PipelineConfig {
    PipelineConfig {
        write_retries,
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        ..PipelineConfig::default()
    }
}

#[test]
fn test_transient_write_failures_are_retried() {
    let temp = TempDir::new().unwrap();
    write_files(temp.path(), &[("A.py", BASE_AND_HELPER), ("B.py", CHILD)]);
    let mut store = TestStore::new(SqliteGraphStore::open_in_memory().unwrap());
    store.failures_left = 2;

    let summary = run_local(temp.path(), &mut store, &fast_retries(3), &CancellationToken::new());
    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.errors);
    assert!(summary.errors.is_empty());
    assert_eq!(store.attempts, 3);
    assert_eq!(store.inner.node_count().unwrap(), summary.nodes_created);
}

#[test]
fn test_persistent_write_failure_fails_without_pruning() {
    let temp = TempDir::new().unwrap();
    write_files(temp.path(), &[("A.py", BASE_AND_HELPER), ("B.py", CHILD)]);
    let mut store = TestStore::new(SqliteGraphStore::open_in_memory().unwrap());
    run_local(temp.path(), &mut store, &fast_retries(0), &CancellationToken::new());
    let nodes_before = store.inner.node_count().unwrap();

    std::fs::remove_file(temp.path().join("B.py")).unwrap();
    store.failures_left = usize::MAX;
    store.attempts = 0;
    let summary = run_local(temp.path(), &mut store, &fast_retries(2), &CancellationToken::new());

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(store.attempts, 3);
    assert_eq!(summary.nodes_deleted, 0);
    let Some(RunError::WriteError {
        batch, unwritten, ..
    }) = summary.errors.last()
    else {
        panic!("expected a write error, got {:?}", summary.errors);
    };
    assert_eq!(*batch, 0);
    assert!(unwritten.contains(&"Class A.Base".to_string()), "{unwritten:?}");
    assert!(unwritten.contains(&"Function A.helper".to_string()));

    assert_eq!(store.inner.node_count().unwrap(), nodes_before);
    one(&store.inner, NodeKind::Class, "Child");
    assert_eq!(store.inner.dangling_edge_count().unwrap(), 0);
    let runs = store.inner.recent_runs(1).unwrap();
    assert_eq!(runs[0].summary.status, RunStatus::Failed);
}

#[test]
fn test_cancel_between_batches_skips_pruning() {
    let temp = TempDir::new().unwrap();
    write_files(temp.path(), &[("A.py", BASE_AND_HELPER), ("B.py", CHILD)]);
    let mut store = TestStore::new(SqliteGraphStore::open_in_memory().unwrap());
    run_local(temp.path(), &mut store, &PipelineConfig::default(), &CancellationToken::new());

    std::fs::remove_file(temp.path().join("B.py")).unwrap();
    write_files(
        temp.path(),
        &[("C.py", "def one():\n    pass\n\n\ndef two():\n    pass\n")],
    );
    let cancel = CancellationToken::new();
    store.cancel_after_write = Some(cancel.clone());
    let config = PipelineConfig {
        batch_size: 2,
        ..PipelineConfig::default()
    };
    let summary = run_local(temp.path(), &mut store, &config, &cancel);

    assert_eq!(summary.status, RunStatus::Cancelled);
    assert_eq!(store.attempts, 1);
    assert_eq!(summary.nodes_deleted, 0);
    one(&store.inner, NodeKind::Class, "Child");
    assert!(store.inner.find_nodes_by_name("two").unwrap().is_empty());
    assert_eq!(store.inner.dangling_edge_count().unwrap(), 0);
    let runs = store.inner.recent_runs(1).unwrap();
    assert_eq!(runs[0].summary.status, RunStatus::Cancelled);
}

/// Serves files from memory; each `load` waits until `expected` loads
/// have started.
struct RendezvousLoader {
    files: Vec<(String, String)>,
    expected: usize,
    started: Mutex<usize>,
    all_started: Condvar,
    timed_out: AtomicBool,
}

impl SourceLoader for RendezvousLoader {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn snapshot(&self) -> Option<String> {
        Some("fixed".to_string())
    }

    fn candidates(&mut self) -> Result<Vec<String>, PipelineError> {
        Ok(self.files.iter().map(|(path, _)| path.clone()).collect())
    }

    fn load(&self, path: &str) -> LoadItem {
        let mut started = self.started.lock().unwrap();
        *started += 1;
        self.all_started.notify_all();
        let (guard, wait) = self
            .all_started
            .wait_timeout_while(started, Duration::from_secs(5), |n| *n < self.expected)
            .unwrap();
        drop(guard);
        if wait.timed_out() {
            self.timed_out.store(true, Ordering::SeqCst);
        }

        let content = self
            .files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, c)| c.clone())
            .unwrap();
        LoadItem::Loaded(SourceFile {
            path: path.to_string(),
            content_hash: hash_sha256(&content),
            content,
            language: Language::Python,
        })
    }
}

#[test]
fn test_files_are_loaded_concurrently() {
    let mut loader = RendezvousLoader {
        files: vec![
            ("A.py".to_string(), BASE_AND_HELPER.to_string()),
            ("B.py".to_string(), CHILD.to_string()),
        ],
        expected: 2,
        started: Mutex::new(0),
        all_started: Condvar::new(),
        timed_out: AtomicBool::new(false),
    };
    let config = PipelineConfig {
        workers: 2,
        ..PipelineConfig::default()
    };
    let mut store = SqliteGraphStore::open_in_memory().unwrap();

    let summary = pipeline::run_with(
        &mut loader,
        &mut store,
        &config,
        &CancellationToken::new(),
        None,
    )
    .unwrap();

    assert!(!loader.timed_out.load(Ordering::SeqCst), "loads ran one at a time");
    assert_eq!(summary.status, RunStatus::Succeeded);
    assert_eq!(summary.files_parsed, 2);
    assert_eq!(summary.snapshot, "fixed");
    one(&store, NodeKind::Class, "Child");
}
