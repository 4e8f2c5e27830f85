#![forbid(unsafe_code)]

//! Cross-file resolution.
//!
//! `SymbolTable::build` indexes every parsed file once and is read-only
//! afterwards, so per-file resolution can fan out across the worker pool.
//! A reference that matches more than one candidate at the first step that
//! matches anything is dropped rather than guessed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::parser::{ClassDecl, ImportForm, ImportOccurrence, ParsedFile, UNKNOWN_RECEIVER};
use crate::types::{Edge, EdgeKind, IoDirection, Node, NodeAttrs, VariableScope};
use crate::utils::{
    class_id, data_file_id, decorator_id, endpoint_id, exception_id, external_class_id, file_id,
    function_id, module_id, script_id, variable_id,
};

#[derive(Debug, Clone)]
struct FunctionEntry {
    id: String,
    is_method: bool,
}

#[derive(Debug, Clone)]
struct ClassEntry {
    id: String,
    path: String,
    qualified_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    /// An in-repository module file.
    Module(String),
    /// `from <file> import name`.
    Symbol { path: String, name: String },
    /// Something outside the repository, by dotted name.
    External(String),
}

#[derive(Debug, Default)]
struct FileImports {
    bindings: HashMap<String, Binding>,
    /// `import a.b` statements by full dotted name.
    modules: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BaseTarget {
    Class(String),
    External(String),
}

enum Target<'t> {
    File(&'t str),
    Class(&'t ClassEntry),
    External(String),
    Unknown,
}

enum Lookup<'t> {
    Found(&'t FunctionEntry),
    Ambiguous(usize),
    Missing,
}

struct ImportTarget {
    name: String,
    file: Option<String>,
}

/// Frozen index over all successfully parsed files.
#[derive(Debug, Default)]
pub struct SymbolTable {
    files: HashSet<String>,
    modules: HashMap<String, String>,
    module_suffixes: HashMap<String, Vec<String>>,
    functions: HashMap<(String, String), Vec<FunctionEntry>>,
    functions_by_name: HashMap<String, Vec<FunctionEntry>>,
    classes: HashMap<(String, String), ClassEntry>,
    classes_by_name: HashMap<String, Vec<ClassEntry>>,
    class_by_id: HashMap<String, ClassEntry>,
    top_level: HashMap<String, Vec<String>>,
    imports: HashMap<String, FileImports>,
    /// Per class id, one entry per declared base. `None` marks a base that
    /// matched several classes.
    class_bases: HashMap<String, Vec<Option<BaseTarget>>>,
}

/// Nodes and edges derived from one file.
#[derive(Debug, Default)]
pub struct FileResolution {
    pub path: String,
    pub nodes: Vec<Node>,
    pub edges: BTreeSet<Edge>,
    pub dropped: usize,
    index: HashMap<String, usize>,
}

impl FileResolution {
    fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }

    /// Later declarations with the same identity replace earlier ones.
    fn push_node(&mut self, node: Node) {
        match self.index.get(&node.id) {
            Some(&pos) => self.nodes[pos] = node,
            None => {
                self.index.insert(node.id.clone(), self.nodes.len());
                self.nodes.push(node);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    fn edge(&mut self, source: &str, kind: EdgeKind, target: &str) {
        self.edges.insert(Edge::new(source, kind, target));
    }
}

/// The merged, de-duplicated graph for a whole snapshot.
#[derive(Debug, Default, Clone)]
pub struct Resolution {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub dropped: usize,
}

/// Builds the symbol table, resolves every file in parallel and merges the
/// results in input order. Call from inside the worker pool.
pub fn resolve(files: &[ParsedFile]) -> Resolution {
    let table = SymbolTable::build(files);
    let per_file: Vec<FileResolution> = files
        .par_iter()
        .map(|file| table.resolve_file(file))
        .collect();
    merge(per_file)
}

/// Keeps the first copy of entities shared between files (modules,
/// endpoints, data files) and only that copy's ownership edge.
pub fn merge(files: Vec<FileResolution>) -> Resolution {
    let mut nodes = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut edges = BTreeSet::new();
    let mut dropped = 0;

    for file in files {
        let mut duplicates = HashSet::new();
        for node in file.nodes {
            if seen.contains(&node.id) {
                duplicates.insert(node.id);
            } else {
                seen.insert(node.id.clone());
                nodes.push(node);
            }
        }
        for edge in file.edges {
            if edge.kind == EdgeKind::BelongsTo && duplicates.contains(&edge.source) {
                continue;
            }
            edges.insert(edge);
        }
        dropped += file.dropped;
    }

    let before = edges.len();
    let edges: Vec<Edge> = edges
        .into_iter()
        .filter(|edge| seen.contains(&edge.source) && seen.contains(&edge.target))
        .collect();
    if edges.len() < before {
        debug!(count = before - edges.len(), "dropped edges with unknown endpoints");
        dropped += before - edges.len();
    }

    Resolution {
        nodes,
        edges,
        dropped,
    }
}

/// `pkg/sub/mod.py` -> `pkg.sub.mod`, `pkg/__init__.py` -> `pkg`.
pub fn module_name_for_path(path: &str) -> String {
    let stem = path
        .strip_suffix(".py")
        .or_else(|| path.strip_suffix(".pyw"))
        .unwrap_or(path);
    if stem == "__init__" {
        return String::new();
    }
    let stem = stem.strip_suffix("/__init__").unwrap_or(stem);
    stem.replace('/', ".")
}

fn join_module(prefix: &str, name: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('.') {
        format!("{prefix}{name}")
    } else {
        format!("{prefix}.{name}")
    }
}

fn parent_scope(qualified_name: &str) -> Option<&str> {
    qualified_name.rsplit_once('.').map(|(parent, _)| parent)
}

/// `a.b.c`, `a.b`, `a`.
fn scope_prefixes(qualified_name: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(qualified_name), |q| parent_scope(*q))
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or(path)
        .to_string()
}

fn key(path: &str, qualified_name: &str) -> (String, String) {
    (path.to_string(), qualified_name.to_string())
}

fn pick(candidates: &[FunctionEntry]) -> Option<Lookup<'_>> {
    match candidates {
        [] => None,
        [only] => Some(Lookup::Found(only)),
        many => Some(Lookup::Ambiguous(many.len())),
    }
}

impl SymbolTable {
    pub fn build(files: &[ParsedFile]) -> Self {
        let mut table = Self::default();

        for file in files {
            let path = file.path.as_str();
            table.files.insert(file.path.clone());

            let module = module_name_for_path(path);
            if !module.is_empty() {
                let mut rest = module.as_str();
                while let Some((_, suffix)) = rest.split_once('.') {
                    table
                        .module_suffixes
                        .entry(suffix.to_string())
                        .or_default()
                        .push(file.path.clone());
                    rest = suffix;
                }
                table.modules.insert(module, file.path.clone());
            }

            let top_level = table.top_level.entry(file.path.clone()).or_default();
            for function in &file.functions {
                if function.parent.is_none() {
                    top_level.push(function.name.clone());
                }
            }
            for class in &file.classes {
                if class.parent.is_none() {
                    top_level.push(class.name.clone());
                }
            }

            for function in &file.functions {
                let entry = FunctionEntry {
                    id: function_id(path, &function.qualified_name, function.arity()),
                    is_method: function.class.is_some(),
                };
                let slot = table
                    .functions
                    .entry(key(path, &function.qualified_name))
                    .or_default();
                if slot.iter().any(|f| f.id == entry.id) {
                    continue;
                }
                slot.push(entry.clone());
                table
                    .functions_by_name
                    .entry(function.name.clone())
                    .or_default()
                    .push(entry);
            }

            for class in &file.classes {
                let entry = ClassEntry {
                    id: class_id(path, &class.qualified_name),
                    path: file.path.clone(),
                    qualified_name: class.qualified_name.clone(),
                };
                if table.class_by_id.contains_key(&entry.id) {
                    continue;
                }
                table
                    .classes
                    .insert(key(path, &class.qualified_name), entry.clone());
                table
                    .classes_by_name
                    .entry(class.name.clone())
                    .or_default()
                    .push(entry.clone());
                table.class_by_id.insert(entry.id.clone(), entry);
            }
        }

        let imports: Vec<(String, FileImports)> = files
            .iter()
            .map(|file| (file.path.clone(), table.file_imports(file)))
            .collect();
        table.imports = imports.into_iter().collect();

        let mut class_bases = HashMap::new();
        for file in files {
            for class in &file.classes {
                let targets = class
                    .bases
                    .iter()
                    .map(|base| table.resolve_base(&file.path, class, base))
                    .collect();
                class_bases.insert(class_id(&file.path, &class.qualified_name), targets);
            }
        }
        table.class_bases = class_bases;

        debug!(
            files = table.files.len(),
            functions = table.functions_by_name.values().map(Vec::len).sum::<usize>(),
            classes = table.class_by_id.len(),
            "symbol table built"
        );
        table
    }

    fn functions_at(&self, path: &str, qualified_name: &str) -> &[FunctionEntry] {
        self.functions
            .get(&key(path, qualified_name))
            .map_or(&[], Vec::as_slice)
    }

    fn class_at(&self, path: &str, qualified_name: &str) -> Option<&ClassEntry> {
        self.classes.get(&key(path, qualified_name))
    }

    fn binding(&self, path: &str, name: &str) -> Option<&Binding> {
        self.imports.get(path).and_then(|i| i.bindings.get(name))
    }

    fn declares(&self, path: &str, name: &str) -> bool {
        !self.functions_at(path, name).is_empty() || self.class_at(path, name).is_some()
    }

    fn module_file(&self, base: &str, package_only: bool) -> Option<String> {
        if !package_only && !base.is_empty() {
            let module = format!("{base}.py");
            if self.files.contains(&module) {
                return Some(module);
            }
        }
        let package = if base.is_empty() {
            "__init__.py".to_string()
        } else {
            format!("{base}/__init__.py")
        };
        self.files.contains(&package).then_some(package)
    }

    /// Maps an import to a repository file: `a/b.py` or `a/b/__init__.py`,
    /// relative to the importer for dotted-relative imports.
    fn resolve_module(&self, importer: &str, module: &str, level: usize) -> Option<String> {
        let importer_dir = Path::new(importer).parent().unwrap_or(Path::new(""));
        if level > 0 {
            let mut base = importer_dir;
            for _ in 1..level {
                base = base.parent()?;
            }
            let base = base.to_string_lossy().replace('\\', "/");
            let joined = match (base.is_empty(), module.is_empty()) {
                (_, true) => base,
                (true, false) => module.replace('.', "/"),
                (false, false) => format!("{base}/{}", module.replace('.', "/")),
            };
            return self.module_file(&joined, module.is_empty());
        }

        if module.is_empty() {
            return None;
        }
        if let Some(path) = self.modules.get(module) {
            return Some(path.clone());
        }
        let sibling = importer_dir
            .join(module.replace('.', "/"))
            .to_string_lossy()
            .replace('\\', "/");
        if let Some(path) = self.module_file(&sibling, false) {
            return Some(path);
        }
        match self.module_suffixes.get(module).map(Vec::as_slice) {
            Some([only]) => Some(only.clone()),
            _ => None,
        }
    }

    fn file_imports(&self, file: &ParsedFile) -> FileImports {
        let path = file.path.as_str();
        let mut imports = FileImports::default();

        for import in &file.imports {
            match &import.form {
                ImportForm::Module => {
                    let resolved = self.resolve_module(path, &import.module, 0);
                    imports
                        .modules
                        .insert(import.module.clone(), resolved.clone());
                    let (local, binding) = match &import.alias {
                        Some(alias) => (
                            alias.clone(),
                            resolved.map_or_else(
                                || Binding::External(import.module.clone()),
                                Binding::Module,
                            ),
                        ),
                        None => {
                            let head = import.module.split('.').next().unwrap_or_default();
                            (
                                head.to_string(),
                                self.resolve_module(path, head, 0).map_or_else(
                                    || Binding::External(head.to_string()),
                                    Binding::Module,
                                ),
                            )
                        }
                    };
                    imports.bindings.insert(local, binding);
                }
                ImportForm::From { name } if name == "*" => {
                    let Some(target) = self.resolve_module(path, &import.module, import.level)
                    else {
                        continue;
                    };
                    for symbol in self.top_level.get(&target).into_iter().flatten() {
                        imports
                            .bindings
                            .entry(symbol.clone())
                            .or_insert_with(|| Binding::Symbol {
                                path: target.clone(),
                                name: symbol.clone(),
                            });
                    }
                }
                ImportForm::From { name } => {
                    let Some(local) = import.binding() else {
                        continue;
                    };
                    let binding = match self.resolve_module(path, &import.module, import.level) {
                        Some(target) if self.declares(&target, name) => Binding::Symbol {
                            path: target,
                            name: name.clone(),
                        },
                        target => {
                            let submodule = join_module(&import.module, name);
                            match (
                                self.resolve_module(path, &submodule, import.level),
                                target,
                            ) {
                                (Some(sub), _) => Binding::Module(sub),
                                (None, Some(target)) => Binding::Symbol {
                                    path: target,
                                    name: name.clone(),
                                },
                                (None, None) => {
                                    Binding::External(join_module(&import.module_text(), name))
                                }
                            }
                        }
                    };
                    imports.bindings.insert(local.to_string(), binding);
                }
            }
        }
        imports
    }

    fn import_target(&self, importer: &str, import: &ImportOccurrence) -> ImportTarget {
        let resolved = self.resolve_module(importer, &import.module, import.level);
        // `from pkg import sub` targets the submodule unless `pkg` itself
        // declares `sub`.
        let resolved = match (&import.form, resolved) {
            (ImportForm::From { name }, resolved)
                if name != "*"
                    && resolved
                        .as_deref()
                        .is_none_or(|target| !self.declares(target, name)) =>
            {
                let submodule = join_module(&import.module, name);
                self.resolve_module(importer, &submodule, import.level)
                    .or(resolved)
            }
            (_, resolved) => resolved,
        };
        match resolved {
            Some(path) => {
                let name = module_name_for_path(&path);
                ImportTarget {
                    name: if name.is_empty() { path.clone() } else { name },
                    file: Some(path),
                }
            }
            None => ImportTarget {
                name: import.module_text(),
                file: None,
            },
        }
    }

    fn qualifier(&self, path: &str, qualifier: &str) -> Target<'_> {
        if let Some(module) = self
            .imports
            .get(path)
            .and_then(|i| i.modules.get(qualifier))
        {
            return match module {
                Some(file) => Target::File(file),
                None => Target::External(qualifier.to_string()),
            };
        }

        let (head, rest) = match qualifier.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (qualifier, None),
        };
        match (self.binding(path, head), rest) {
            (Some(Binding::Module(file)), None) => Target::File(file),
            (Some(Binding::Module(file)), Some(rest)) => {
                let submodule = join_module(&module_name_for_path(file), rest);
                self.modules
                    .get(&submodule)
                    .map_or(Target::Unknown, |file| Target::File(file))
            }
            (Some(Binding::Symbol { path: file, name }), None) => self
                .class_at(file, name)
                .map_or(Target::Unknown, Target::Class),
            (Some(Binding::External(full)), rest) => Target::External(
                rest.map_or_else(|| full.clone(), |rest| join_module(full, rest)),
            ),
            (None, None) => self
                .class_at(path, head)
                .map_or(Target::Unknown, Target::Class),
            _ => Target::Unknown,
        }
    }

    fn unique_class(&self, name: &str, written: &str) -> Option<BaseTarget> {
        match self.classes_by_name.get(name).map(Vec::as_slice) {
            Some([only]) => Some(BaseTarget::Class(only.id.clone())),
            Some([_, _, ..]) => None,
            _ => Some(BaseTarget::External(written.to_string())),
        }
    }

    fn resolve_base(&self, path: &str, class: &ClassDecl, written: &str) -> Option<BaseTarget> {
        let Some((qualifier, name)) = written.rsplit_once('.') else {
            let enclosing = class
                .parent
                .as_deref()
                .into_iter()
                .flat_map(scope_prefixes)
                .map(|scope| format!("{scope}.{written}"));
            for qualified_name in enclosing.chain(std::iter::once(written.to_string())) {
                if qualified_name == class.qualified_name {
                    continue;
                }
                if let Some(found) = self.class_at(path, &qualified_name) {
                    return Some(BaseTarget::Class(found.id.clone()));
                }
            }
            return match self.binding(path, written) {
                Some(Binding::Symbol { path: file, name }) => Some(
                    self.class_at(file, name)
                        .map_or_else(
                            || BaseTarget::External(written.to_string()),
                            |found| BaseTarget::Class(found.id.clone()),
                        ),
                ),
                Some(Binding::External(full)) => Some(BaseTarget::External(full.clone())),
                Some(Binding::Module(_)) => Some(BaseTarget::External(written.to_string())),
                None => self.unique_class(written, written),
            };
        };

        match self.qualifier(path, qualifier) {
            Target::File(file) => Some(self.class_at(file, name).map_or_else(
                || BaseTarget::External(written.to_string()),
                |found| BaseTarget::Class(found.id.clone()),
            )),
            Target::Class(outer) => Some(
                self.class_at(&outer.path, &format!("{}.{name}", outer.qualified_name))
                    .map_or_else(
                        || BaseTarget::External(written.to_string()),
                        |found| BaseTarget::Class(found.id.clone()),
                    ),
            ),
            Target::External(full) => Some(BaseTarget::External(join_module(&full, name))),
            Target::Unknown => self.unique_class(name, written),
        }
    }

    fn enclosing_class(&self, path: &str, function: &str) -> Option<&ClassEntry> {
        scope_prefixes(function)
            .skip(1)
            .find_map(|scope| self.class_at(path, scope))
    }

    /// Breadth-first through the class and its in-repository bases; the
    /// first level with any match decides.
    fn method_in_hierarchy(&self, class: &ClassEntry, method: &str) -> Lookup<'_> {
        let mut visited: HashSet<&str> = HashSet::from([class.id.as_str()]);
        let mut level = vec![class];
        while !level.is_empty() {
            let found: Vec<&FunctionEntry> = level
                .iter()
                .flat_map(|c| self.functions_at(&c.path, &format!("{}.{method}", c.qualified_name)))
                .collect();
            match found.as_slice() {
                [] => {}
                [only] => return Lookup::Found(*only),
                many => return Lookup::Ambiguous(many.len()),
            }

            let mut next = Vec::new();
            for current in &level {
                for base in self.class_bases.get(&current.id).into_iter().flatten() {
                    let Some(BaseTarget::Class(base_id)) = base else {
                        continue;
                    };
                    if let Some(entry) = self.class_by_id.get(base_id) {
                        if visited.insert(entry.id.as_str()) {
                            next.push(entry);
                        }
                    }
                }
            }
            level = next;
        }
        Lookup::Missing
    }

    fn unique_function(&self, name: &str, methods: bool) -> Lookup<'_> {
        let candidates: Vec<&FunctionEntry> = self
            .functions_by_name
            .get(name)
            .into_iter()
            .flatten()
            .filter(|f| f.is_method == methods)
            .collect();
        match candidates.as_slice() {
            [] => Lookup::Missing,
            [only] => Lookup::Found(*only),
            many => Lookup::Ambiguous(many.len()),
        }
    }

    fn resolve_call(&self, path: &str, caller: Option<&str>, callee: &str) -> Lookup<'_> {
        match callee.rsplit_once('.') {
            None => self.resolve_bare_call(path, caller, callee),
            Some((receiver, method)) => {
                self.resolve_attribute_call(path, caller, receiver, method)
            }
        }
    }

    fn resolve_bare_call(&self, path: &str, caller: Option<&str>, name: &str) -> Lookup<'_> {
        // Enclosing function scopes, innermost first. Class bodies are not
        // part of a method's lookup chain.
        for scope in caller.into_iter().flat_map(scope_prefixes) {
            if self.class_at(path, scope).is_some() {
                continue;
            }
            if let Some(found) = pick(self.functions_at(path, &format!("{scope}.{name}"))) {
                return found;
            }
        }
        if let Some(found) = pick(self.functions_at(path, name)) {
            return found;
        }
        if self.class_at(path, name).is_some() {
            return Lookup::Missing;
        }
        match self.binding(path, name) {
            Some(Binding::Symbol { path: file, name }) => {
                return pick(self.functions_at(file, name)).unwrap_or(Lookup::Missing);
            }
            Some(_) => return Lookup::Missing,
            None => {}
        }
        self.unique_function(name, false)
    }

    fn resolve_attribute_call(
        &self,
        path: &str,
        caller: Option<&str>,
        receiver: &str,
        method: &str,
    ) -> Lookup<'_> {
        if matches!(receiver, "self" | "cls") {
            return caller
                .and_then(|c| self.enclosing_class(path, c))
                .map_or(Lookup::Missing, |class| self.method_in_hierarchy(class, method));
        }
        if receiver == UNKNOWN_RECEIVER {
            return self.unique_function(method, true);
        }
        match self.qualifier(path, receiver) {
            Target::File(file) => pick(self.functions_at(file, method)).unwrap_or(Lookup::Missing),
            Target::Class(class) => self.method_in_hierarchy(class, method),
            Target::External(_) => Lookup::Missing,
            Target::Unknown => self.unique_function(method, true),
        }
    }

    /// Turns one parsed file into nodes and edges against the frozen index.
    pub fn resolve_file(&self, file: &ParsedFile) -> FileResolution {
        let path = file.path.as_str();
        let mut out = FileResolution::new(path);
        let file_node = file_id(path);
        let module = module_name_for_path(path);
        let qualify = |name: &str| join_module(&module, name);
        let owned = || Some(path.to_string());

        out.push_node(Node {
            id: file_node.clone(),
            name: file_name(path),
            qualified_name: path.to_string(),
            owner_file: owned(),
            attrs: NodeAttrs::File {
                language: file.language,
                content_hash: file.content_hash.clone(),
                size: file.size,
            },
        });

        for class in &file.classes {
            let id = class_id(path, &class.qualified_name);
            out.push_node(Node {
                id: id.clone(),
                name: class.name.clone(),
                qualified_name: qualify(&class.qualified_name),
                owner_file: owned(),
                attrs: NodeAttrs::Class {
                    start_line: class.start_line,
                    end_line: class.end_line,
                    docstring: class.docstring.clone(),
                    external: false,
                },
            });
            out.edge(&id, EdgeKind::BelongsTo, &file_node);

            for base in self.class_bases.get(&id).into_iter().flatten() {
                match base {
                    Some(BaseTarget::Class(target)) => out.edge(&id, EdgeKind::Extends, target),
                    Some(BaseTarget::External(name)) => {
                        let external = external_class_id(name);
                        out.push_node(Node {
                            id: external.clone(),
                            name: name.rsplit('.').next().unwrap_or(name).to_string(),
                            qualified_name: name.clone(),
                            owner_file: None,
                            attrs: NodeAttrs::Class {
                                start_line: 0,
                                end_line: 0,
                                docstring: None,
                                external: true,
                            },
                        });
                        out.edge(&id, EdgeKind::Extends, &external);
                    }
                    None => {
                        debug!(path, class = %class.qualified_name, "ambiguous base class dropped");
                        out.dropped += 1;
                    }
                }
            }
        }

        let mut function_ids: HashMap<&str, String> = HashMap::new();
        for function in &file.functions {
            let id = function_id(path, &function.qualified_name, function.arity());
            function_ids.insert(function.qualified_name.as_str(), id.clone());
            out.push_node(Node {
                id: id.clone(),
                name: function.name.clone(),
                qualified_name: qualify(&function.qualified_name),
                owner_file: owned(),
                attrs: NodeAttrs::Function {
                    start_line: function.start_line,
                    end_line: function.end_line,
                    parameter_count: function.arity(),
                    parameters: function.parameters.clone(),
                    is_async: function.is_async,
                    is_method: function.class.is_some(),
                    docstring: function.docstring.clone(),
                    returns: function.returns.clone(),
                },
            });
            let owner = function
                .class
                .as_deref()
                .map_or_else(|| file_node.clone(), |class| class_id(path, class));
            out.edge(&id, EdgeKind::BelongsTo, &owner);

            for parameter in &function.parameters {
                let param_id = variable_id(&id, parameter);
                out.push_node(Node {
                    id: param_id.clone(),
                    name: parameter.clone(),
                    qualified_name: qualify(&format!("{}.{parameter}", function.qualified_name)),
                    owner_file: owned(),
                    attrs: NodeAttrs::Variable {
                        declared_in: VariableScope::Parameter,
                        line: function.start_line,
                    },
                });
                out.edge(&id, EdgeKind::HasParameter, &param_id);
                out.edge(&param_id, EdgeKind::BelongsTo, &file_node);
            }
        }

        for variable in &file.variables {
            let (scope, declared_in, qualified_name) = match &variable.function {
                Some(function) => match function_ids.get(function.as_str()) {
                    Some(id) => (
                        id.clone(),
                        VariableScope::Function,
                        format!("{function}.{}", variable.name),
                    ),
                    None => continue,
                },
                None => (file_node.clone(), VariableScope::Module, variable.name.clone()),
            };
            let id = variable_id(&scope, &variable.name);
            if out.contains(&id) {
                continue;
            }
            out.push_node(Node {
                id: id.clone(),
                name: variable.name.clone(),
                qualified_name: qualify(&qualified_name),
                owner_file: owned(),
                attrs: NodeAttrs::Variable {
                    declared_in,
                    line: variable.line,
                },
            });
            out.edge(&id, EdgeKind::BelongsTo, &file_node);
        }

        for import in &file.imports {
            let target = self.import_target(path, import);
            let id = module_id(&target.name);
            out.push_node(Node {
                id: id.clone(),
                name: target.name.clone(),
                qualified_name: target.name.clone(),
                owner_file: target.file.clone(),
                attrs: NodeAttrs::Module {
                    is_external: target.file.is_none(),
                },
            });
            out.edge(&file_node, EdgeKind::Imports, &id);
            if let Some(target_file) = &target.file {
                out.edge(&id, EdgeKind::BelongsTo, &file_id(target_file));
            }
        }

        for call in &file.calls {
            let Some(caller) = call.caller.as_deref() else {
                continue;
            };
            let Some(source) = function_ids.get(caller) else {
                continue;
            };
            match self.resolve_call(path, Some(caller), &call.callee) {
                Lookup::Found(target) => out.edge(source, EdgeKind::Calls, &target.id),
                Lookup::Ambiguous(candidates) => {
                    debug!(path, caller, callee = %call.callee, candidates, "ambiguous call dropped");
                    out.dropped += 1;
                }
                Lookup::Missing => {
                    trace!(path, caller, callee = %call.callee, "unresolved call");
                    out.dropped += 1;
                }
            }
        }

        if file.is_script() {
            let id = script_id(path);
            out.push_node(Node {
                id: id.clone(),
                name: file_name(path),
                qualified_name: path.to_string(),
                owner_file: owned(),
                attrs: NodeAttrs::Script,
            });
            out.edge(&id, EdgeKind::BelongsTo, &file_node);
            for call in file.executed_calls() {
                match self.resolve_call(path, None, &call.callee) {
                    Lookup::Found(target) => out.edge(&id, EdgeKind::Executes, &target.id),
                    Lookup::Ambiguous(_) | Lookup::Missing => out.dropped += 1,
                }
            }
        }

        for decorator in &file.decorators {
            let target = if decorator.on_class {
                file.classes
                    .iter()
                    .any(|class| class.qualified_name == decorator.target)
                    .then(|| class_id(path, &decorator.target))
            } else {
                function_ids.get(decorator.target.as_str()).cloned()
            };
            let Some(target) = target else {
                continue;
            };
            let id = decorator_id(path, &decorator.name);
            out.push_node(Node {
                id: id.clone(),
                name: decorator.name.clone(),
                qualified_name: decorator.name.clone(),
                owner_file: owned(),
                attrs: NodeAttrs::Decorator,
            });
            out.edge(&id, EdgeKind::BelongsTo, &file_node);
            out.edge(&id, EdgeKind::Decorates, &target);
        }

        for raise in &file.raises {
            let id = exception_id(path, &raise.exception);
            if !out.contains(&id) {
                out.push_node(Node {
                    id: id.clone(),
                    name: raise.exception.clone(),
                    qualified_name: raise.exception.clone(),
                    owner_file: owned(),
                    attrs: NodeAttrs::Exception { line: raise.line },
                });
                out.edge(&id, EdgeKind::BelongsTo, &file_node);
            }
            if let Some(function) = raise
                .function
                .as_deref()
                .and_then(|f| function_ids.get(f))
            {
                out.edge(function, EdgeKind::Raises, &id);
            }
        }

        for io in &file.io {
            let id = data_file_id(&io.target);
            out.push_node(Node {
                id: id.clone(),
                name: io.target.clone(),
                qualified_name: io.target.clone(),
                owner_file: None,
                attrs: NodeAttrs::DataFile,
            });
            let kind = match io.direction {
                IoDirection::Read => EdgeKind::ReadsFrom,
                IoDirection::Write => EdgeKind::WritesTo,
            };
            out.edge(&file_node, kind, &id);
        }

        for route in &file.routes {
            let Some(handler) = function_ids.get(route.handler.as_str()) else {
                continue;
            };
            let id = endpoint_id(&route.method, &route.route);
            let name = format!("{} {}", route.method, route.route);
            out.push_node(Node {
                id: id.clone(),
                name: name.clone(),
                qualified_name: name,
                owner_file: owned(),
                attrs: NodeAttrs::ApiEndpoint {
                    method: route.method.clone(),
                    route: route.route.clone(),
                },
            });
            out.edge(&id, EdgeKind::BelongsTo, &file_node);
            out.edge(&id, EdgeKind::ListensTo, handler);
        }

        out
    }
}
