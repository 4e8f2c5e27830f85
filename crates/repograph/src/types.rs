#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Class,
    Function,
    Variable,
    Module,
    Decorator,
    Exception,
    DataFile,
    Script,
    ApiEndpoint,
}

impl NodeKind {
    pub const ALL: [Self; 10] = [
        Self::File,
        Self::Class,
        Self::Function,
        Self::Variable,
        Self::Module,
        Self::Decorator,
        Self::Exception,
        Self::DataFile,
        Self::Script,
        Self::ApiEndpoint,
    ];

    /// Graph label as used by the query catalog.
    pub const fn label(self) -> &'static str {
        match self {
            Self::File => "File",
            Self::Class => "Class",
            Self::Function => "Function",
            Self::Variable => "Variable",
            Self::Module => "Module",
            Self::Decorator => "Decorator",
            Self::Exception => "Exception",
            Self::DataFile => "DataFile",
            Self::Script => "Script",
            Self::ApiEndpoint => "APIEndpoint",
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.label().eq_ignore_ascii_case(raw))
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    BelongsTo,
    Extends,
    Calls,
    HasParameter,
    Imports,
    Decorates,
    Raises,
    ReadsFrom,
    WritesTo,
    Executes,
    ListensTo,
}

impl EdgeKind {
    pub const ALL: [Self; 11] = [
        Self::BelongsTo,
        Self::Extends,
        Self::Calls,
        Self::HasParameter,
        Self::Imports,
        Self::Decorates,
        Self::Raises,
        Self::ReadsFrom,
        Self::WritesTo,
        Self::Executes,
        Self::ListensTo,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            Self::BelongsTo => "BELONGS_TO",
            Self::Extends => "EXTENDS",
            Self::Calls => "CALLS",
            Self::HasParameter => "HAS_PARAMETER",
            Self::Imports => "IMPORTS",
            Self::Decorates => "DECORATES",
            Self::Raises => "RAISES",
            Self::ReadsFrom => "READS_FROM",
            Self::WritesTo => "WRITES_TO",
            Self::Executes => "EXECUTES",
            Self::ListensTo => "LISTENS_TO",
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.label() == raw)
    }

    /// Edge kinds whose transitive closure forms `DEPENDS_ON`.
    pub const fn is_dependency(self) -> bool {
        matches!(self, Self::Imports | Self::Calls | Self::Extends)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    Unknown,
}

impl Language {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        match raw {
            "python" => Self::Python,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableScope {
    Module,
    Function,
    Parameter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoDirection {
    Read,
    Write,
}

/// Kind-specific attributes. The variant fixes the node kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeAttrs {
    File {
        language: Language,
        content_hash: String,
        size: u64,
    },
    Class {
        start_line: i64,
        end_line: i64,
        docstring: Option<String>,
        external: bool,
    },
    Function {
        start_line: i64,
        end_line: i64,
        parameter_count: usize,
        parameters: Vec<String>,
        is_async: bool,
        is_method: bool,
        docstring: Option<String>,
        returns: Option<String>,
    },
    Variable {
        declared_in: VariableScope,
        line: i64,
    },
    Module {
        is_external: bool,
    },
    Decorator,
    Exception {
        line: i64,
    },
    DataFile,
    Script,
    ApiEndpoint {
        method: String,
        route: String,
    },
}

impl NodeAttrs {
    pub const fn kind(&self) -> NodeKind {
        match self {
            Self::File { .. } => NodeKind::File,
            Self::Class { .. } => NodeKind::Class,
            Self::Function { .. } => NodeKind::Function,
            Self::Variable { .. } => NodeKind::Variable,
            Self::Module { .. } => NodeKind::Module,
            Self::Decorator => NodeKind::Decorator,
            Self::Exception { .. } => NodeKind::Exception,
            Self::DataFile => NodeKind::DataFile,
            Self::Script => NodeKind::Script,
            Self::ApiEndpoint { .. } => NodeKind::ApiEndpoint,
        }
    }
}

/// Common identity envelope shared by every entity kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub qualified_name: String,
    /// Repository-relative path of the file that declares this entity.
    /// `None` for entities that are only referenced (external modules,
    /// external base classes, data files).
    pub owner_file: Option<String>,
    pub attrs: NodeAttrs,
}

impl Node {
    pub const fn kind(&self) -> NodeKind {
        self.attrs.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(source: impl Into<String>, kind: EdgeKind, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind,
        }
    }
}

/// One file as produced by a source loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
    pub content_hash: String,
    pub language: Language,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Binary,
    TooLarge { size: u64, limit: u64 },
    UnsupportedLanguage,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary content"),
            Self::TooLarge { size, limit } => write!(f, "{size} bytes exceeds limit of {limit}"),
            Self::UnsupportedLanguage => f.write_str("unsupported language"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunError {
    FetchError {
        paths: Vec<String>,
        message: String,
    },
    ParseError {
        path: String,
        line: Option<i64>,
        message: String,
    },
    WriteError {
        batch: usize,
        message: String,
        unwritten: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Structured report returned by every pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub repository: String,
    pub snapshot: String,
    pub status: RunStatus,
    pub files_seen: usize,
    pub files_parsed: usize,
    pub files_skipped: Vec<SkippedFile>,
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub nodes_deleted: usize,
    pub edges_created: usize,
    pub edges_deleted: usize,
    pub edges_dropped: usize,
    pub errors: Vec<RunError>,
    pub duration_ms: u64,
}

impl RunSummary {
    pub const fn entities_written(&self) -> usize {
        self.nodes_created + self.nodes_updated
    }

    pub const fn edges_written(&self) -> usize {
        self.edges_created
    }

    pub fn parse_errors(&self) -> impl Iterator<Item = &RunError> {
        self.errors
            .iter()
            .filter(|err| matches!(err, RunError::ParseError { .. }))
    }
}

/// Per-file state recorded by the last successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    pub language: Language,
    pub size: u64,
    pub indexed_at: i64,
    pub run_id: String,
}

/// A row of the run provenance table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub started_at: i64,
    pub finished_at: i64,
    pub summary: RunSummary,
}

/// Nodes and edges around a set of roots, as returned by `graph::neighborhood`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighborhood {
    pub roots: Vec<String>,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    /// The edge budget ran out before the walk finished.
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalDirection {
    Outgoing,
    Incoming,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborhoodQuery {
    pub depth: usize,
    pub direction: TraversalDirection,
    /// Edge kinds to follow; empty follows every kind.
    pub edge_kinds: Vec<EdgeKind>,
    /// Node kinds to report. The walk still passes through other kinds.
    pub node_kinds: Vec<NodeKind>,
    pub max_edges: usize,
    pub include_roots: bool,
}

impl Default for NeighborhoodQuery {
    fn default() -> Self {
        Self {
            depth: 1,
            direction: TraversalDirection::Both,
            edge_kinds: Vec::new(),
            node_kinds: Vec::new(),
            max_edges: 200,
            include_roots: true,
        }
    }
}
