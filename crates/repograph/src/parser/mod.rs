#![forbid(unsafe_code)]

//! Structural parsing: one source file in, its declarations and the raw
//! reference occurrences out. Nothing here looks beyond the file itself;
//! cross-file meaning is assigned later by the resolver.

use crate::config::{IoSignature, PipelineConfig};
use crate::error::ParseError;
use crate::types::{IoDirection, Language, SourceFile};

pub mod python;

/// Stand-in for a call receiver that is not a plain dotted name, as in
/// `open(p).close()` or `items[0].save()`.
pub const UNKNOWN_RECEIVER: &str = "<expr>";

/// Per-run knobs the parser needs from the configuration.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    pub io_signatures: Vec<IoSignature>,
    pub route_decorators: Vec<String>,
}

impl ParseOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            io_signatures: config.io_signatures.clone(),
            route_decorators: config.route_decorators.clone(),
        }
    }
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDecl {
    pub name: String,
    /// Dotted path through enclosing classes/functions, e.g. `Outer.Inner`.
    pub qualified_name: String,
    /// Qualified name of the enclosing class or function, if nested.
    pub parent: Option<String>,
    pub bases: Vec<String>,
    pub start_line: i64,
    pub end_line: i64,
    pub docstring: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDecl {
    pub name: String,
    pub qualified_name: String,
    pub parent: Option<String>,
    /// Set when the direct parent scope is a class.
    pub class: Option<String>,
    pub parameters: Vec<String>,
    pub start_line: i64,
    pub end_line: i64,
    pub is_async: bool,
    pub docstring: Option<String>,
    pub returns: Option<String>,
}

impl FunctionDecl {
    pub fn arity(&self) -> usize {
        self.parameters.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDecl {
    pub name: String,
    /// Enclosing function; `None` for module-level bindings.
    pub function: Option<String>,
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportForm {
    /// `import a.b [as c]`
    Module,
    /// `from a.b import name [as c]`
    From { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOccurrence {
    pub form: ImportForm,
    /// Dotted module text without leading dots.
    pub module: String,
    /// Number of leading dots on a relative import.
    pub level: usize,
    pub alias: Option<String>,
    pub line: i64,
}

impl ImportOccurrence {
    /// Name this import binds in the importing module's namespace, if any.
    pub fn binding(&self) -> Option<&str> {
        if let Some(alias) = &self.alias {
            return Some(alias);
        }
        match &self.form {
            ImportForm::Module => self.module.split('.').next(),
            ImportForm::From { name } if name == "*" => None,
            ImportForm::From { name } => Some(name),
        }
    }

    /// The import as written, e.g. `..pkg.mod`.
    pub fn module_text(&self) -> String {
        format!("{}{}", ".".repeat(self.level), self.module)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOccurrence {
    /// Innermost enclosing function; `None` at module or class level.
    pub caller: Option<String>,
    /// Dotted callee text. Receivers that are not plain names are
    /// rendered as `<expr>`, e.g. `<expr>.close`.
    pub callee: String,
    pub line: i64,
    pub in_main_guard: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaiseOccurrence {
    pub function: Option<String>,
    pub exception: String,
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoratorOccurrence {
    /// Qualified name of the decorated function or class.
    pub target: String,
    pub on_class: bool,
    /// Decorator expression without call arguments, e.g. `app.route`.
    pub name: String,
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoOccurrence {
    pub function: Option<String>,
    pub direction: IoDirection,
    /// Literal path or URL passed as the first argument.
    pub target: String,
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOccurrence {
    pub handler: String,
    pub method: String,
    pub route: String,
    pub line: i64,
}

/// Everything a single file declares and references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFile {
    pub path: String,
    pub language: Language,
    pub content_hash: String,
    pub size: u64,
    pub classes: Vec<ClassDecl>,
    pub functions: Vec<FunctionDecl>,
    pub variables: Vec<VariableDecl>,
    pub imports: Vec<ImportOccurrence>,
    pub calls: Vec<CallOccurrence>,
    pub raises: Vec<RaiseOccurrence>,
    pub decorators: Vec<DecoratorOccurrence>,
    pub io: Vec<IoOccurrence>,
    pub routes: Vec<RouteOccurrence>,
    pub has_main_guard: bool,
    pub has_shebang: bool,
}

impl ParsedFile {
    pub fn empty(file: &SourceFile) -> Self {
        Self {
            path: file.path.clone(),
            language: file.language,
            content_hash: file.content_hash.clone(),
            size: file.content.len() as u64,
            classes: Vec::new(),
            functions: Vec::new(),
            variables: Vec::new(),
            imports: Vec::new(),
            calls: Vec::new(),
            raises: Vec::new(),
            decorators: Vec::new(),
            io: Vec::new(),
            routes: Vec::new(),
            has_main_guard: false,
            has_shebang: false,
        }
    }

    pub fn is_script(&self) -> bool {
        self.has_main_guard || self.has_shebang
    }

    /// Module-level calls that run when the file is executed directly.
    pub fn executed_calls(&self) -> impl Iterator<Item = &CallOccurrence> {
        let shebang = self.has_shebang;
        self.calls
            .iter()
            .filter(move |call| call.caller.is_none() && (call.in_main_guard || shebang))
    }
}

pub fn parse_file(file: &SourceFile, options: &ParseOptions) -> Result<ParsedFile, ParseError> {
    match file.language {
        Language::Python => python::parse(file, options),
        Language::Unknown => Err(ParseError {
            path: file.path.clone(),
            line: None,
            message: "no parser for this language".to_string(),
        }),
    }
}
