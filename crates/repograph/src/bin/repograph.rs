use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use repograph::config::{self, GraphConnection, PipelineConfig, RepositoryCoordinate};
use repograph::db::SqliteGraphStore;
use repograph::graph;
use repograph::pipeline::{self, CancellationToken, RunPhase, RunProgress, RunRequest};
use repograph::types::{
    EdgeKind, NeighborhoodQuery, Node, NodeKind, RunError, RunStatus, RunSummary,
    TraversalDirection,
};

#[derive(Debug, Parser)]
#[command(name = "repograph")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Ingest a source repository into a typed property graph")]
struct Cli {
    /// Also write logs to this file.
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse a repository snapshot and merge it into the graph.
    Run(RunArgs),
    /// Show the most recent runs recorded in a graph.
    Status(StatusArgs),
    /// List what an entity transitively depends on (imports, calls, bases).
    Deps(DepsArgs),
    /// Show the nodes and edges around an entity.
    Neighbors(NeighborsArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Local path, `owner/repo[@ref]` or a github.com URL.
    repository: String,
    #[arg(short = 'g', long = "graph")]
    graph: String,
    #[arg(long = "principal")]
    principal: Option<String>,
    #[arg(long = "credential")]
    credential: Option<String>,
    /// Hosting API token; defaults to REPOGRAPH_GITHUB_TOKEN.
    #[arg(long = "token")]
    token: Option<String>,
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
    #[arg(long = "max-file-size")]
    max_file_size: Option<u64>,
    #[arg(short = 'j', long = "json")]
    json: bool,
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[arg(short = 'g', long = "graph")]
    graph: String,
    #[arg(short = 'l', long = "limit", default_value_t = 5)]
    limit: usize,
    #[arg(short = 'j', long = "json")]
    json: bool,
}

#[derive(Debug, Args)]
struct DepsArgs {
    /// Qualified name, file path or bare name.
    name: String,
    #[arg(short = 'g', long = "graph")]
    graph: String,
    #[arg(short = 'd', long = "depth", default_value_t = 10)]
    depth: usize,
    #[arg(short = 'j', long = "json")]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    Out,
    In,
    Both,
}

impl From<DirectionArg> for TraversalDirection {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Out => Self::Outgoing,
            DirectionArg::In => Self::Incoming,
            DirectionArg::Both => Self::Both,
        }
    }
}

#[derive(Debug, Args)]
struct NeighborsArgs {
    /// Qualified name, file path or bare name.
    name: String,
    #[arg(short = 'g', long = "graph")]
    graph: String,
    #[arg(short = 'd', long = "depth", default_value_t = 1)]
    depth: usize,
    #[arg(long = "direction", value_enum, default_value = "both")]
    direction: DirectionArg,
    /// Follow only these edge kinds, e.g. `--edge CALLS --edge IMPORTS`.
    #[arg(short = 'e', long = "edge", value_parser = parse_edge_kind)]
    edges: Vec<EdgeKind>,
    /// Report only these node kinds, e.g. `--kind Function`.
    #[arg(short = 'k', long = "kind", value_parser = parse_node_kind)]
    kinds: Vec<NodeKind>,
    #[arg(short = 'l', long = "limit", default_value_t = 200)]
    limit: usize,
    #[arg(short = 'j', long = "json")]
    json: bool,
}

fn parse_edge_kind(raw: &str) -> Result<EdgeKind, String> {
    EdgeKind::from_label(&raw.to_ascii_uppercase()).ok_or_else(|| format!("unknown edge kind: {raw}"))
}

fn parse_node_kind(raw: &str) -> Result<NodeKind, String> {
    NodeKind::from_label(raw).ok_or_else(|| format!("unknown node kind: {raw}"))
}

fn main() {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file.as_ref());

    match cli.command {
        Command::Run(args) => run_pipeline(args),
        Command::Status(args) => run_status(args),
        Command::Deps(args) => run_deps(args),
        Command::Neighbors(args) => run_neighbors(args),
    }
}

fn init_logging(log_file: Option<&PathBuf>) -> Option<WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repograph=info"))
    };
    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter())
            .with_writer(std::io::stderr)
            .init();
        return None;
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), PathBuf::from);
    let file_name = path
        .file_name()
        .map_or_else(|| "repograph.log".into(), |name| name.to_os_string());
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Some(guard)
}

fn run_pipeline(args: RunArgs) {
    let repository = RepositoryCoordinate::parse(&args.repository).unwrap_or_else(|err| {
        eprintln!("{err}");
        std::process::exit(2);
    });

    let mut cfg = load_run_config(args.config.as_ref(), &repository).unwrap_or_else(|err| {
        eprintln!("Failed to load config: {err}");
        std::process::exit(2);
    });
    if let Some(max_file_size) = args.max_file_size {
        cfg.max_file_size = max_file_size;
    }

    let graph = GraphConnection {
        uri: args.graph,
        principal: args.principal,
        credential: args.credential,
    };
    let mut request = RunRequest::new(repository, graph).with_config(cfg);
    if let Some(token) = args.token {
        request = request.with_credential(token);
    }

    let bar = (!args.quiet && !args.json).then(create_progress_bar);
    let on_progress = |progress: RunProgress| {
        if let Some(bar) = &bar {
            show_progress(bar, &progress);
        }
    };

    let cancel = CancellationToken::new();
    let result = pipeline::run_with_progress(&request, &cancel, Some(&on_progress));
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }

    let summary = result.unwrap_or_else(|err| {
        eprintln!("Run failed: {err}");
        std::process::exit(2);
    });

    if args.json {
        let json = serde_json::to_string_pretty(&summary).unwrap_or_default();
        println!("{json}");
    } else {
        print_summary(&summary);
    }

    if summary.status != RunStatus::Succeeded {
        std::process::exit(1);
    }
}

fn load_run_config(
    explicit: Option<&PathBuf>,
    repository: &RepositoryCoordinate,
) -> Result<PipelineConfig, repograph::error::ConfigError> {
    match (explicit, repository) {
        (Some(path), _) => config::load_config_file(path),
        (None, RepositoryCoordinate::Local { root }) => config::load_config(root),
        (None, RepositoryCoordinate::GitHub { .. }) => Ok(PipelineConfig::default()),
    }
}

fn open_graph(connection: &GraphConnection) -> SqliteGraphStore {
    SqliteGraphStore::connect(connection, &PipelineConfig::default()).unwrap_or_else(|err| {
        eprintln!("Failed to open graph: {err}");
        std::process::exit(2);
    })
}

/// Exits unless `name` matches at least one node.
fn resolve_name(store: &SqliteGraphStore, name: &str) -> Vec<Node> {
    let found = graph::lookup(store, name).unwrap_or_else(|err| {
        eprintln!("Lookup failed: {err}");
        std::process::exit(1);
    });
    if found.is_empty() {
        eprintln!("No node named {name}");
        std::process::exit(1);
    }
    found
}

fn run_deps(args: DepsArgs) {
    let store = open_graph(&GraphConnection::new(args.graph));
    let mut report = Vec::new();
    for start in resolve_name(&store, &args.name) {
        let deps = graph::depends_on(&store, &start.id, args.depth).unwrap_or_else(|err| {
            eprintln!("Traversal failed: {err}");
            std::process::exit(1);
        });
        report.push((start, deps));
    }

    if args.json {
        let value: Vec<serde_json::Value> = report
            .iter()
            .map(|(start, deps)| {
                serde_json::json!({
                    "node": start,
                    "depends_on": deps
                        .iter()
                        .map(|d| serde_json::json!({ "depth": d.depth, "node": d.node }))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
        return;
    }

    for (start, deps) in &report {
        println!("{}", describe_node(start));
        if deps.is_empty() {
            println!("  (no dependencies)");
        }
        for dep in deps {
            println!("  {:>2}  {}", dep.depth, describe_node(&dep.node));
        }
    }
}

fn run_neighbors(args: NeighborsArgs) {
    let store = open_graph(&GraphConnection::new(args.graph));
    let roots: Vec<String> = resolve_name(&store, &args.name)
        .into_iter()
        .map(|node| node.id)
        .collect();
    let query = NeighborhoodQuery {
        depth: args.depth,
        direction: args.direction.into(),
        edge_kinds: args.edges,
        node_kinds: args.kinds,
        max_edges: args.limit,
        include_roots: true,
    };
    let around = graph::neighborhood(&store, &roots, &query).unwrap_or_else(|err| {
        eprintln!("Traversal failed: {err}");
        std::process::exit(1);
    });

    if args.json {
        println!("{}", serde_json::to_string_pretty(&around).unwrap_or_default());
        return;
    }

    println!("Nodes ({}):", around.nodes.len());
    for node in around.nodes.values() {
        println!("  {}", describe_node(node));
    }
    println!("Edges ({}):", around.edges.len());
    for edge in &around.edges {
        let name = |id: &str| {
            around
                .nodes
                .get(id)
                .map_or_else(|| id.to_string(), |n| n.qualified_name.clone())
        };
        println!("  {} -[{}]-> {}", name(&edge.source), edge.kind, name(&edge.target));
    }
    if around.truncated {
        println!("(stopped at {} edges; raise --limit to see more)", args.limit);
    }
}

fn describe_node(node: &Node) -> String {
    match &node.owner_file {
        Some(owner) if node.kind() != NodeKind::File => {
            format!("{} {} ({owner})", node.kind(), node.qualified_name)
        }
        _ => format!("{} {}", node.kind(), node.qualified_name),
    }
}

fn run_status(args: StatusArgs) {
    let connection = GraphConnection::new(args.graph);
    let store = open_graph(&connection);
    let runs = store.recent_runs(args.limit).unwrap_or_else(|err| {
        eprintln!("Failed to read run history: {err}");
        std::process::exit(1);
    });

    if args.json {
        let json = serde_json::to_string_pretty(&runs).unwrap_or_default();
        println!("{json}");
        return;
    }

    println!("Graph: {}", connection.uri);
    match (store.node_count(), store.edge_count()) {
        (Ok(nodes), Ok(edges)) => println!("Nodes: {nodes}  Edges: {edges}"),
        (Err(err), _) | (_, Err(err)) => eprintln!("Failed to count graph: {err}"),
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return;
    }
    println!();
    for record in &runs {
        let s = &record.summary;
        println!(
            "{}  {:<9}  {}  snapshot {}  +{} nodes ~{} -{}  +{} edges -{}  {} error(s)",
            s.run_id,
            s.status.as_str(),
            s.repository,
            short(&s.snapshot),
            s.nodes_created,
            s.nodes_updated,
            s.nodes_deleted,
            s.edges_created,
            s.edges_deleted,
            s.errors.len(),
        );
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Run {} {}", summary.run_id, summary.status.as_str());
    println!("Repository: {}", summary.repository);
    println!("Snapshot:   {}", short(&summary.snapshot));
    println!(
        "Files:      {} seen, {} parsed, {} skipped",
        summary.files_seen,
        summary.files_parsed,
        summary.files_skipped.len()
    );
    println!(
        "Nodes:      {} created, {} updated, {} deleted",
        summary.nodes_created, summary.nodes_updated, summary.nodes_deleted
    );
    println!(
        "Edges:      {} created, {} deleted, {} dropped",
        summary.edges_created, summary.edges_deleted, summary.edges_dropped
    );
    println!("Completed in {}ms", summary.duration_ms);

    for skipped in &summary.files_skipped {
        println!("  skipped {}: {}", skipped.path, skipped.reason);
    }
    for err in &summary.errors {
        match err {
            RunError::FetchError { paths, message } => {
                println!("  fetch error: {message}");
                for path in paths {
                    println!("    {path}");
                }
            }
            RunError::ParseError {
                path,
                line: Some(line),
                message,
            } => println!("  parse error: {path}:{line}: {message}"),
            RunError::ParseError { path, message, .. } => {
                println!("  parse error: {path}: {message}");
            }
            RunError::WriteError {
                batch,
                message,
                unwritten,
            } => println!(
                "  write error in batch {batch}: {message} ({} unwritten)",
                unwritten.len()
            ),
        }
    }
}

fn create_progress_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn show_progress(bar: &ProgressBar, progress: &RunProgress) {
    let phase = match progress.phase {
        RunPhase::Parsing => "Parsing",
        RunPhase::Resolving => "Resolving",
        RunPhase::Writing => "Writing",
        RunPhase::Pruning => "Pruning",
    };
    let count = if progress.total > 0 {
        format!("{}/{}", progress.current, progress.total)
    } else {
        progress.current.to_string()
    };
    let file = progress
        .current_file
        .as_ref()
        .map(|f| format!(" {f}"))
        .unwrap_or_default();
    bar.set_message(format!("{phase}: {count}{file}"));
}

fn short(snapshot: &str) -> &str {
    snapshot.get(..12).unwrap_or(snapshot)
}
