//! Integration tests for the GitHub loader against a local HTTP host

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use repograph::config::PipelineConfig;
use repograph::db::SqliteGraphStore;
use repograph::pipeline::{self, CancellationToken};
use repograph::source::{FileFilter, GitHubLoader, LoadItem, SourceLoader};
use repograph::types::{NodeKind, RunError, RunStatus, RunSummary};

struct Reply {
    status: u16,
    headers: Vec<(&'static str, String)>,
    body: String,
}

impl Reply {
    fn ok(body: &str) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

type Handler = dyn Fn(&str, usize) -> Reply + Send + Sync;

/// Minimal HTTP/1.1 host: one request per connection, routed by target.
struct MockHost {
    addr: SocketAddr,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    authorization: Arc<Mutex<Vec<String>>>,
}

impl MockHost {
    fn serve(handler: impl Fn(&str, usize) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let authorization = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let (hits_ref, auth_ref) = (Arc::clone(&hits), Arc::clone(&authorization));
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let (handler, hits, auth) =
                    (Arc::clone(&handler), Arc::clone(&hits_ref), Arc::clone(&auth_ref));
                thread::spawn(move || respond(stream, &*handler, &hits, &auth));
            }
        });
        Self {
            addr,
            hits,
            authorization,
        }
    }

    fn api_base(&self) -> String {
        format!("http://{}/", self.addr)
    }

    fn hits(&self, target: &str) -> usize {
        self.hits.lock().unwrap().get(target).copied().unwrap_or(0)
    }
}

fn respond(
    stream: TcpStream,
    handler: &Handler,
    hits: &Mutex<HashMap<String, usize>>,
    authorization: &Mutex<Vec<String>>,
) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let target = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("authorization")
        {
            authorization.lock().unwrap().push(value.trim().to_string());
        }
    }

    let hit = {
        let mut hits = hits.lock().unwrap();
        let count = hits.entry(target.clone()).or_insert(0);
        *count += 1;
        *count
    };
    let reply = handler(&target, hit);

    let reason = if reply.status == 200 { "OK" } else { "Error" };
    let mut head = format!(
        "HTTP/1.1 {} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n",
        reply.status,
        reply.body.len()
    );
    for (name, value) in &reply.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str("\r\n");
    let mut stream = stream;
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(reply.body.as_bytes());
    let _ = stream.flush();
}

const COMMIT: &str = "/repos/acme/widgets/commits/main";
const TREE: &str = "/repos/acme/widgets/git/trees/c0ffee?recursive=1";

/// Commit and tree routes for `blobs` as `(path, sha)`.
fn snapshot_routes(target: &str, blobs: &[(&str, &str)]) -> Option<Reply> {
    match target {
        COMMIT => Some(Reply::ok(r#"{"sha":"c0ffee"}"#)),
        TREE => {
            let entries: Vec<String> = blobs
                .iter()
                .map(|(path, sha)| {
                    format!(r#"{{"path":"{path}","type":"blob","sha":"{sha}","size":40}}"#)
                })
                .chain([r#"{"path":"pkg","type":"tree","sha":"t1"}"#.to_string()])
                .collect();
            Some(Reply::ok(&format!(
                r#"{{"sha":"c0ffee","tree":[{}],"truncated":false}}"#,
                entries.join(",")
            )))
        }
        _ => None,
    }
}

fn blob(sha: &str) -> String {
    format!("/repos/acme/widgets/git/blobs/{sha}")
}

fn fast_fetch_config() -> PipelineConfig {
    PipelineConfig {
        fetch_retries: 2,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 5,
        workers: 4,
        ..PipelineConfig::default()
    }
}

fn loader_for(host: &MockHost, config: &PipelineConfig) -> GitHubLoader {
    GitHubLoader::new(
        "acme",
        "widgets",
        Some("main".to_string()),
        Some("t0ken".to_string()),
        config,
        FileFilter::new(config).unwrap(),
    )
    .with_api_base(&host.api_base())
}

fn run_remote(host: &MockHost, store: &mut SqliteGraphStore) -> RunSummary {
    let config = fast_fetch_config();
    let mut loader = loader_for(host, &config);
    pipeline::run_with(&mut loader, store, &config, &CancellationToken::new(), None).unwrap()
}

#[test]
fn test_transient_failures_retry_and_exhausted_paths_are_reported() {
    let host = MockHost::serve(|target, hit| {
        let blobs = [("a.py", "flaky"), ("b.py", "down"), ("c.py", "good"), ("README.md", "doc")];
        if let Some(reply) = snapshot_routes(target, &blobs) {
            return reply;
        }
        match target.rsplit('/').next().unwrap_or("") {
            "flaky" if hit == 1 => Reply::status(503).header("Retry-After", "0"),
            "flaky" => Reply::ok("def alpha():\n    return 1\n"),
            "down" => Reply::status(500),
            "good" => Reply::ok("def gamma():\n    return alpha()\n"),
            _ => Reply::status(404),
        }
    });

    let mut store = SqliteGraphStore::open_in_memory().unwrap();
    let summary = run_remote(&host, &mut store);

    assert_eq!(summary.status, RunStatus::Succeeded, "{:?}", summary.errors);
    assert_eq!(summary.snapshot, "c0ffee");
    assert_eq!(summary.files_seen, 3);
    assert_eq!(summary.files_parsed, 2);
    assert_eq!(summary.errors.len(), 1);
    assert!(matches!(
        &summary.errors[0],
        RunError::FetchError { paths, .. } if paths == &vec!["b.py".to_string()]
    ));

    assert_eq!(host.hits(&blob("flaky")), 2);
    assert_eq!(host.hits(&blob("down")), 3);
    assert_eq!(host.hits(&blob("good")), 1);
    assert_eq!(host.hits(&blob("doc")), 0);
    assert!(
        host.authorization
            .lock()
            .unwrap()
            .iter()
            .all(|value| value == "Bearer t0ken")
    );

    let alpha = store.find_nodes_by_name("alpha").unwrap();
    assert_eq!(alpha.len(), 1);
    assert_eq!(alpha[0].owner_file.as_deref(), Some("a.py"));
    assert_eq!(store.nodes_by_kind(NodeKind::File).unwrap().len(), 2);
    assert!(store.files().unwrap().iter().all(|f| f.path != "b.py"));
}

#[test]
fn test_rate_limit_reset_is_retried_and_not_found_is_not() {
    let host = MockHost::serve(|target, hit| {
        if let Some(reply) = snapshot_routes(target, &[("a.py", "limited"), ("b.py", "gone")]) {
            return reply;
        }
        match target.rsplit('/').next().unwrap_or("") {
            "limited" if hit == 1 => Reply::status(403)
                .header("X-RateLimit-Remaining", "0")
                .header("X-RateLimit-Reset", "0"),
            "limited" => Reply::ok("x = 1\n"),
            _ => Reply::status(404),
        }
    });

    let config = fast_fetch_config();
    let mut loader = loader_for(&host, &config);
    let paths = loader.candidates().unwrap();
    assert_eq!(paths, vec!["a.py".to_string(), "b.py".to_string()]);
    assert_eq!(loader.snapshot().as_deref(), Some("c0ffee"));

    assert!(matches!(loader.load("a.py"), LoadItem::Loaded(file) if file.content == "x = 1\n"));
    assert_eq!(host.hits(&blob("limited")), 2);

    let LoadItem::Failed(err) = loader.load("b.py") else {
        panic!("404 should fail the file");
    };
    assert_eq!(err.status, Some(404));
    assert!(!err.retryable);
    assert_eq!(host.hits(&blob("gone")), 1);
}

#[test]
fn test_unlistable_snapshot_is_fatal() {
    let host = MockHost::serve(|_, _| Reply::status(404));
    let config = fast_fetch_config();
    let mut loader = loader_for(&host, &config);
    let mut store = SqliteGraphStore::open_in_memory().unwrap();

    let result = pipeline::run_with(
        &mut loader,
        &mut store,
        &config,
        &CancellationToken::new(),
        None,
    );
    assert!(result.is_err());
    assert_eq!(host.hits(COMMIT), 1);
    assert_eq!(store.node_count().unwrap(), 0);
}
