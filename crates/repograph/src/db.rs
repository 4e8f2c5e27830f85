#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::config::{DeletePolicy, GraphConnection, PipelineConfig, StoreLocation};
use crate::error::{PipelineResult, StoreError, StoreResult};
use crate::types::{
    Edge, EdgeKind, FileRecord, Language, Node, NodeKind, RunRecord, RunSummary,
};
use crate::utils::unix_now;

pub const SCHEMA_SQL: &str = include_str!("db/schema.sql");

const NODE_COLUMNS: &str = "id, kind, name, qualified_name, owner_file, attrs";

/// Counts for one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub edges_created: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub nodes_deleted: usize,
    pub edges_deleted: usize,
}

/// What the current snapshot still contains. Anything else is pruned,
/// except entities owned by `protected_files` and the targets of their
/// outgoing edges.
#[derive(Debug, Clone, Copy)]
pub struct PruneScope<'a> {
    pub nodes: &'a HashSet<String>,
    pub edges: &'a HashSet<Edge>,
    pub protected_files: &'a HashSet<String>,
}

/// Write side of the graph store as the pipeline sees it.
///
/// `upsert_batch` is all-or-nothing: either every node and edge of the
/// batch is merged or the store is left as it was.
pub trait GraphStore: Send {
    fn describe(&self) -> String;

    fn upsert_batch(&mut self, nodes: &[Node], edges: &[Edge]) -> StoreResult<BatchStats>;

    fn prune(&mut self, scope: &PruneScope<'_>, policy: DeletePolicy) -> StoreResult<PruneStats>;

    /// Replaces the per-file table with `files`, keeping rows for
    /// `protected` paths untouched.
    fn sync_files(&mut self, files: &[FileRecord], protected: &HashSet<String>)
    -> StoreResult<()>;

    fn record_run(&mut self, record: &RunRecord) -> StoreResult<()>;
}

impl<S: GraphStore + ?Sized> GraphStore for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn upsert_batch(&mut self, nodes: &[Node], edges: &[Edge]) -> StoreResult<BatchStats> {
        (**self).upsert_batch(nodes, edges)
    }

    fn prune(&mut self, scope: &PruneScope<'_>, policy: DeletePolicy) -> StoreResult<PruneStats> {
        (**self).prune(scope, policy)
    }

    fn sync_files(
        &mut self,
        files: &[FileRecord],
        protected: &HashSet<String>,
    ) -> StoreResult<()> {
        (**self).sync_files(files, protected)
    }

    fn record_run(&mut self, record: &RunRecord) -> StoreResult<()> {
        (**self).record_run(record)
    }
}

/// SQLite-backed graph: one row per node, one row per
/// `(source, kind, target)` edge.
#[derive(Debug)]
pub struct SqliteGraphStore {
    conn: Connection,
    location: StoreLocation,
}

impl SqliteGraphStore {
    pub fn open(location: &StoreLocation, busy_timeout: Duration) -> StoreResult<Self> {
        let conn = match location {
            StoreLocation::File(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)?
            }
            StoreLocation::Memory => Connection::open_in_memory()?,
        };
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!(store = ?location, "graph store ready");
        Ok(Self {
            conn,
            location: location.clone(),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::open(&StoreLocation::Memory, Duration::from_secs(5))
    }

    /// Validates the connection parameters and opens the store they name.
    pub fn connect(connection: &GraphConnection, config: &PipelineConfig) -> PipelineResult<Self> {
        let location = connection.location()?;
        let store = Self::open(
            &location,
            Duration::from_millis(config.store_busy_timeout_ms),
        )?;
        Ok(store)
    }

    pub fn node(&self, id: &str) -> StoreResult<Option<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ? AND stale = 0");
        let node = self
            .conn
            .query_row(&sql, params![id], row_to_node)
            .optional()?;
        Ok(node)
    }

    pub fn nodes_by_kind(&self, kind: NodeKind) -> StoreResult<Vec<Node>> {
        self.query_nodes(
            "WHERE kind = ? AND stale = 0 ORDER BY qualified_name",
            kind.label(),
        )
    }

    pub fn find_nodes_by_name(&self, name: &str) -> StoreResult<Vec<Node>> {
        self.query_nodes("WHERE name = ? AND stale = 0 ORDER BY qualified_name", name)
    }

    pub fn find_nodes_by_qualified_name(&self, qualified_name: &str) -> StoreResult<Vec<Node>> {
        self.query_nodes(
            "WHERE qualified_name = ? AND stale = 0 ORDER BY kind, id",
            qualified_name,
        )
    }

    pub fn nodes_owned_by(&self, path: &str) -> StoreResult<Vec<Node>> {
        self.query_nodes(
            "WHERE owner_file = ? AND stale = 0 ORDER BY qualified_name",
            path,
        )
    }

    fn query_nodes(&self, clause: &str, value: &str) -> StoreResult<Vec<Node>> {
        let sql = format!("SELECT {NODE_COLUMNS} FROM nodes {clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![value], row_to_node)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn edges_from(&self, source: &str, kind: Option<EdgeKind>) -> StoreResult<Vec<Edge>> {
        self.query_edges("source", source, kind)
    }

    pub fn edges_to(&self, target: &str, kind: Option<EdgeKind>) -> StoreResult<Vec<Edge>> {
        self.query_edges("target", target, kind)
    }

    fn query_edges(
        &self,
        column: &str,
        id: &str,
        kind: Option<EdgeKind>,
    ) -> StoreResult<Vec<Edge>> {
        let mut sql =
            format!("SELECT source, target, kind FROM edges WHERE {column} = ? AND stale = 0");
        let mut params_vec: Vec<String> = vec![id.to_string()];

        if let Some(kind) = kind {
            sql.push_str(" AND kind = ?");
            params_vec.push(kind.label().to_string());
        }
        sql.push_str(" ORDER BY source, kind, target");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params_vec), row_to_edge)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn edges_by_kind(&self, kind: EdgeKind) -> StoreResult<Vec<Edge>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, target, kind FROM edges
             WHERE kind = ? AND stale = 0
             ORDER BY source, target",
        )?;
        let rows = stmt.query_map(params![kind.label()], row_to_edge)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn node_count(&self) -> StoreResult<usize> {
        self.count("SELECT COUNT(*) FROM nodes WHERE stale = 0")
    }

    pub fn edge_count(&self) -> StoreResult<usize> {
        self.count("SELECT COUNT(*) FROM edges WHERE stale = 0")
    }

    /// Soft-deleted `(nodes, edges)`.
    pub fn stale_counts(&self) -> StoreResult<(usize, usize)> {
        Ok((
            self.count("SELECT COUNT(*) FROM nodes WHERE stale = 1")?,
            self.count("SELECT COUNT(*) FROM edges WHERE stale = 1")?,
        ))
    }

    /// Edges with a missing endpoint. Always zero unless the store was
    /// modified behind the pipeline's back.
    pub fn dangling_edge_count(&self) -> StoreResult<usize> {
        self.count(
            "SELECT COUNT(*) FROM edges e
             WHERE NOT EXISTS (SELECT 1 FROM nodes n WHERE n.id = e.source)
                OR NOT EXISTS (SELECT 1 FROM nodes n WHERE n.id = e.target)",
        )
    }

    fn count(&self, sql: &str) -> StoreResult<usize> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    pub fn files(&self) -> StoreResult<Vec<FileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, content_hash, language, size, indexed_at, run_id
             FROM files ORDER BY path",
        )?;
        let rows = stmt.query_map([], |row| {
            let language_raw: String = row.get(2)?;
            Ok(FileRecord {
                path: row.get(0)?,
                content_hash: row.get(1)?,
                language: Language::from_str_lossy(&language_raw),
                size: u64::try_from(row.get::<_, i64>(3)?).unwrap_or(0),
                indexed_at: row.get(4)?,
                run_id: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Most recent runs first.
    pub fn recent_runs(&self, limit: usize) -> StoreResult<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT started_at, finished_at, summary FROM runs
             ORDER BY finished_at DESC, started_at DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(
            params![i64::try_from(limit).unwrap_or(i64::MAX)],
            |row| {
                let raw: String = row.get(2)?;
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, raw))
            },
        )?;

        let mut results = Vec::new();
        for row in rows {
            let (started_at, finished_at, raw) = row?;
            let summary: RunSummary = serde_json::from_str(&raw)?;
            results.push(RunRecord {
                started_at,
                finished_at,
                summary,
            });
        }
        Ok(results)
    }
}

impl GraphStore for SqliteGraphStore {
    fn describe(&self) -> String {
        match &self.location {
            StoreLocation::File(path) => format!("sqlite://{}", path.display()),
            StoreLocation::Memory => "sqlite::memory:".to_string(),
        }
    }

    fn upsert_batch(&mut self, nodes: &[Node], edges: &[Edge]) -> StoreResult<BatchStats> {
        let now = unix_now();
        let mut stats = BatchStats::default();
        let tx = self.conn.transaction()?;
        {
            let mut existing = tx.prepare(
                "SELECT kind, name, qualified_name, owner_file, attrs, stale
                 FROM nodes WHERE id = ?",
            )?;
            let mut insert = tx.prepare(
                "INSERT INTO nodes (id, kind, name, qualified_name, owner_file, attrs, stale, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            )?;
            let mut update = tx.prepare(
                "UPDATE nodes SET kind = ?2, name = ?3, qualified_name = ?4, owner_file = ?5,
                    attrs = ?6, stale = 0, updated_at = ?7
                 WHERE id = ?1",
            )?;

            for node in nodes {
                let attrs = serde_json::to_string(&node.attrs)?;
                let kind = node.kind().label();
                let current = existing
                    .query_row(params![node.id], |row| {
                        Ok(StoredNode {
                            kind: row.get(0)?,
                            name: row.get(1)?,
                            qualified_name: row.get(2)?,
                            owner_file: row.get(3)?,
                            attrs: row.get(4)?,
                            stale: row.get::<_, i64>(5)? != 0,
                        })
                    })
                    .optional()?;

                let row_params = params![
                    node.id,
                    kind,
                    node.name,
                    node.qualified_name,
                    node.owner_file,
                    attrs,
                    now,
                ];
                match current {
                    None => {
                        insert.execute(row_params)?;
                        stats.nodes_created += 1;
                    }
                    Some(stored) if stored.matches(kind, node, &attrs) => {}
                    Some(_) => {
                        update.execute(row_params)?;
                        stats.nodes_updated += 1;
                    }
                }
            }

            let mut node_exists = tx.prepare("SELECT 1 FROM nodes WHERE id = ?")?;
            let mut existing_edge = tx.prepare(
                "SELECT stale FROM edges WHERE source = ? AND kind = ? AND target = ?",
            )?;
            let mut insert_edge = tx.prepare(
                "INSERT INTO edges (source, target, kind, stale) VALUES (?, ?, ?, 0)",
            )?;
            let mut revive_edge = tx.prepare(
                "UPDATE edges SET stale = 0 WHERE source = ? AND kind = ? AND target = ?",
            )?;

            for edge in edges {
                for endpoint in [&edge.source, &edge.target] {
                    if !node_exists.exists(params![endpoint])? {
                        return Err(StoreError::Rejected(format!(
                            "{} edge {} -> {} references missing node {endpoint}",
                            edge.kind, edge.source, edge.target
                        )));
                    }
                }
                let label = edge.kind.label();
                let stale: Option<i64> = existing_edge
                    .query_row(params![edge.source, label, edge.target], |row| row.get(0))
                    .optional()?;
                match stale {
                    None => {
                        insert_edge.execute(params![edge.source, edge.target, label])?;
                        stats.edges_created += 1;
                    }
                    Some(0) => {}
                    Some(_) => {
                        revive_edge.execute(params![edge.source, label, edge.target])?;
                        stats.edges_created += 1;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(stats)
    }

    fn prune(&mut self, scope: &PruneScope<'_>, policy: DeletePolicy) -> StoreResult<PruneStats> {
        let tx = self.conn.transaction()?;
        let live_only = policy == DeletePolicy::Soft;

        let owners: Vec<(String, Option<String>)> = {
            let sql = if live_only {
                "SELECT id, owner_file FROM nodes WHERE stale = 0"
            } else {
                "SELECT id, owner_file FROM nodes"
            };
            let mut stmt = tx.prepare(sql)?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<_, _>>()?
        };
        let edges: Vec<Edge> = {
            let sql = if live_only {
                "SELECT source, target, kind FROM edges WHERE stale = 0"
            } else {
                "SELECT source, target, kind FROM edges"
            };
            let mut stmt = tx.prepare(sql)?;
            let rows = stmt.query_map([], row_to_edge)?;
            rows.collect::<Result<_, _>>()?
        };

        let protected: HashSet<&str> = owners
            .iter()
            .filter(|(_, owner)| {
                owner
                    .as_ref()
                    .is_some_and(|path| scope.protected_files.contains(path))
            })
            .map(|(id, _)| id.as_str())
            .collect();

        // Protected files keep unowned targets alive; owned targets follow
        // their own file.
        let unowned: HashSet<&str> = owners
            .iter()
            .filter(|(_, owner)| owner.is_none())
            .map(|(id, _)| id.as_str())
            .collect();
        let mut pinned = protected.clone();
        for edge in &edges {
            if protected.contains(edge.source.as_str()) && unowned.contains(edge.target.as_str()) {
                pinned.insert(edge.target.as_str());
            }
        }

        let doomed_edges: Vec<&Edge> = edges
            .iter()
            .filter(|edge| !scope.edges.contains(*edge) && !pinned.contains(edge.source.as_str()))
            .collect();
        let doomed_nodes: HashSet<&str> = owners
            .iter()
            .map(|(id, _)| id.as_str())
            .filter(|id| !scope.nodes.contains(*id) && !pinned.contains(id))
            .collect();

        let mut stats = PruneStats {
            nodes_deleted: doomed_nodes.len(),
            edges_deleted: 0,
        };

        match policy {
            DeletePolicy::Hard => {
                let before = count_rows(&tx, "SELECT COUNT(*) FROM edges")?;
                {
                    let mut delete_edge = tx.prepare(
                        "DELETE FROM edges WHERE source = ? AND kind = ? AND target = ?",
                    )?;
                    for edge in &doomed_edges {
                        delete_edge.execute(params![edge.source, edge.kind.label(), edge.target])?;
                    }
                    let mut delete_node = tx.prepare("DELETE FROM nodes WHERE id = ?")?;
                    for id in &doomed_nodes {
                        delete_node.execute(params![id])?;
                    }
                }
                let after = count_rows(&tx, "SELECT COUNT(*) FROM edges")?;
                stats.edges_deleted = before.saturating_sub(after);
            }
            DeletePolicy::Soft => {
                let mut marked: HashSet<&Edge> = doomed_edges.into_iter().collect();
                for edge in &edges {
                    if doomed_nodes.contains(edge.source.as_str())
                        || doomed_nodes.contains(edge.target.as_str())
                    {
                        marked.insert(edge);
                    }
                }
                {
                    let mut stale_edge = tx.prepare(
                        "UPDATE edges SET stale = 1 WHERE source = ? AND kind = ? AND target = ?",
                    )?;
                    for edge in &marked {
                        stale_edge.execute(params![edge.source, edge.kind.label(), edge.target])?;
                    }
                    let mut stale_node = tx.prepare("UPDATE nodes SET stale = 1 WHERE id = ?")?;
                    for id in &doomed_nodes {
                        stale_node.execute(params![id])?;
                    }
                }
                stats.edges_deleted = marked.len();
            }
        }

        tx.commit()?;
        Ok(stats)
    }

    fn sync_files(
        &mut self,
        files: &[FileRecord],
        protected: &HashSet<String>,
    ) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        {
            let mut upsert = tx.prepare(
                "INSERT INTO files (path, content_hash, language, size, indexed_at, run_id)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(path) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    language = excluded.language,
                    size = excluded.size,
                    indexed_at = excluded.indexed_at,
                    run_id = excluded.run_id",
            )?;
            for file in files {
                upsert.execute(params![
                    file.path,
                    file.content_hash,
                    file.language.as_str(),
                    i64::try_from(file.size).unwrap_or(i64::MAX),
                    file.indexed_at,
                    file.run_id,
                ])?;
            }

            let current: HashSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
            let known: Vec<String> = {
                let mut stmt = tx.prepare("SELECT path FROM files")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };
            let mut delete = tx.prepare("DELETE FROM files WHERE path = ?")?;
            for path in known {
                if !current.contains(path.as_str()) && !protected.contains(&path) {
                    delete.execute(params![path])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn record_run(&mut self, record: &RunRecord) -> StoreResult<()> {
        let summary = &record.summary;
        self.conn.execute(
            "INSERT OR REPLACE INTO runs (run_id, repository, snapshot, status, started_at, finished_at, summary)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                summary.run_id,
                summary.repository,
                summary.snapshot,
                summary.status.as_str(),
                record.started_at,
                record.finished_at,
                serde_json::to_string(summary)?,
            ],
        )?;
        Ok(())
    }
}

struct StoredNode {
    kind: String,
    name: String,
    qualified_name: String,
    owner_file: Option<String>,
    attrs: String,
    stale: bool,
}

impl StoredNode {
    fn matches(&self, kind: &str, node: &Node, attrs: &str) -> bool {
        !self.stale
            && self.kind == kind
            && self.name == node.name
            && self.qualified_name == node.qualified_name
            && self.owner_file == node.owner_file
            && self.attrs == attrs
    }
}

fn count_rows(conn: &Connection, sql: &str) -> StoreResult<usize> {
    let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    let raw_attrs: String = row.get(5)?;
    let attrs = serde_json::from_str(&raw_attrs).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Node {
        id: row.get(0)?,
        name: row.get(2)?,
        qualified_name: row.get(3)?,
        owner_file: row.get(4)?,
        attrs,
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<Edge> {
    let raw_kind: String = row.get(2)?;
    let kind = EdgeKind::from_label(&raw_kind).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown edge kind {raw_kind}").into(),
        )
    })?;
    Ok(Edge {
        source: row.get(0)?,
        target: row.get(1)?,
        kind,
    })
}
