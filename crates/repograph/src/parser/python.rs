#![forbid(unsafe_code)]

use std::collections::HashSet;

use tree_sitter::{Node as TsNode, Parser};

use crate::error::ParseError;
use crate::parser::{
    CallOccurrence, ClassDecl, DecoratorOccurrence, FunctionDecl, ImportForm, ImportOccurrence,
    IoOccurrence, ParseOptions, ParsedFile, RaiseOccurrence, RouteOccurrence, UNKNOWN_RECEIVER,
    VariableDecl,
};
use crate::types::{IoDirection, SourceFile};

pub fn parse(file: &SourceFile, options: &ParseOptions) -> Result<ParsedFile, ParseError> {
    let mut parser = Parser::new();
    let language = tree_sitter::Language::new(tree_sitter_python::LANGUAGE);
    parser
        .set_language(&language)
        .map_err(|err| parse_error(file, None, err.to_string()))?;

    let tree = parser
        .parse(&file.content, None)
        .ok_or_else(|| parse_error(file, None, "parser produced no tree".to_string()))?;
    let root = tree.root_node();
    if root.has_error() {
        let (line, message) = match first_error(root) {
            Some(node) if node.is_missing() => (
                Some(line_of(node)),
                format!("missing `{}`", node.kind()),
            ),
            Some(node) => (Some(line_of(node)), "invalid syntax".to_string()),
            None => (None, "invalid syntax".to_string()),
        };
        return Err(parse_error(file, line, message));
    }

    let mut walker = Walker {
        source: &file.content,
        options,
        scopes: Vec::new(),
        in_main_guard: false,
        seen_variables: HashSet::new(),
        out: ParsedFile::empty(file),
    };
    walker.out.has_shebang = file.content.starts_with("#!");
    walker.walk(root);
    Ok(walker.out)
}

fn parse_error(file: &SourceFile, line: Option<i64>, message: String) -> ParseError {
    ParseError {
        path: file.path.clone(),
        line,
        message,
    }
}

fn first_error(node: TsNode<'_>) -> Option<TsNode<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() || child.is_missing() {
            if let Some(found) = first_error(child) {
                return Some(found);
            }
        }
    }
    None
}

fn line_of(node: TsNode<'_>) -> i64 {
    node.start_position().row as i64 + 1
}

fn end_line_of(node: TsNode<'_>) -> i64 {
    node.end_position().row as i64 + 1
}

fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

fn is_async(node: TsNode<'_>) -> bool {
    let mut cursor = node.walk();
    node.children(&mut cursor)
        .take_while(|child| child.kind() != "def")
        .any(|child| child.kind() == "async")
}

/// `open("x", "w")` style writes are only visible through the mode flag.
fn mode_writes(mode: &str) -> bool {
    mode.contains(['w', 'a', 'x', '+'])
}

fn matches_signature(callee: &str, signature: &str) -> bool {
    callee == signature
        || callee
            .strip_suffix(signature)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Class,
    Function,
}

#[derive(Debug)]
struct Scope {
    kind: ScopeKind,
    qualified_name: String,
}

struct Walker<'a> {
    source: &'a str,
    options: &'a ParseOptions,
    scopes: Vec<Scope>,
    in_main_guard: bool,
    seen_variables: HashSet<(Option<String>, String)>,
    out: ParsedFile,
}

impl<'a> Walker<'a> {
    fn text(&self, node: TsNode<'_>) -> &'a str {
        node.utf8_text(self.source.as_bytes()).unwrap_or("")
    }

    fn qualify(&self, name: &str) -> String {
        match self.scopes.last() {
            Some(scope) => format!("{}.{name}", scope.qualified_name),
            None => name.to_string(),
        }
    }

    fn parent(&self) -> Option<String> {
        self.scopes.last().map(|scope| scope.qualified_name.clone())
    }

    fn in_class_body(&self) -> bool {
        matches!(self.scopes.last(), Some(scope) if scope.kind == ScopeKind::Class)
    }

    fn current_function(&self) -> Option<String> {
        match self.scopes.last() {
            Some(scope) if scope.kind == ScopeKind::Function => Some(scope.qualified_name.clone()),
            _ => None,
        }
    }

    fn walk(&mut self, node: TsNode<'_>) {
        match node.kind() {
            "function_definition" => self.visit_function(node, &[]),
            "class_definition" => self.visit_class(node, &[]),
            "decorated_definition" => self.visit_decorated(node),
            "import_statement" => self.visit_import(node),
            "import_from_statement" => self.visit_import_from(node),
            "future_import_statement" => {}
            "call" => {
                self.visit_call(node);
                self.walk_children(node);
            }
            "raise_statement" => {
                self.visit_raise(node);
                self.walk_children(node);
            }
            "assignment" => {
                self.visit_assignment(node);
                self.walk_children(node);
            }
            "if_statement" if self.scopes.is_empty() && self.is_main_guard(node) => {
                self.out.has_main_guard = true;
                if let Some(body) = node.child_by_field_name("consequence") {
                    self.in_main_guard = true;
                    self.walk(body);
                    self.in_main_guard = false;
                }
                let mut cursor = node.walk();
                for alternative in node.children_by_field_name("alternative", &mut cursor) {
                    self.walk(alternative);
                }
            }
            _ => self.walk_children(node),
        }
    }

    fn walk_children(&mut self, node: TsNode<'_>) {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            self.walk(child);
        }
    }

    fn visit_decorated(&mut self, node: TsNode<'_>) {
        let mut cursor = node.walk();
        let decorators: Vec<TsNode<'_>> = node
            .named_children(&mut cursor)
            .filter(|child| child.kind() == "decorator")
            .collect();
        match node.child_by_field_name("definition") {
            Some(def) if def.kind() == "function_definition" => self.visit_function(def, &decorators),
            Some(def) if def.kind() == "class_definition" => self.visit_class(def, &decorators),
            Some(def) => self.walk(def),
            None => {}
        }
    }

    fn visit_function(&mut self, node: TsNode<'_>, decorators: &[TsNode<'_>]) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(name_node).to_string();
        let qualified_name = self.qualify(&name);
        let class = match self.scopes.last() {
            Some(scope) if scope.kind == ScopeKind::Class => Some(scope.qualified_name.clone()),
            _ => None,
        };
        let parameters = node
            .child_by_field_name("parameters")
            .map(|params| self.parameters(params))
            .unwrap_or_default();
        let body = node.child_by_field_name("body");

        self.out.functions.push(FunctionDecl {
            name,
            qualified_name: qualified_name.clone(),
            parent: self.parent(),
            class,
            parameters,
            start_line: line_of(node),
            end_line: end_line_of(node),
            is_async: is_async(node),
            docstring: body.and_then(|b| self.docstring(b)),
            returns: node
                .child_by_field_name("return_type")
                .map(|r| self.text(r).to_string()),
        });

        for decorator in decorators {
            self.visit_decorator(*decorator, &qualified_name, false);
        }

        self.scopes.push(Scope {
            kind: ScopeKind::Function,
            qualified_name,
        });
        if let Some(body) = body {
            self.walk(body);
        }
        self.scopes.pop();
    }

    fn visit_class(&mut self, node: TsNode<'_>, decorators: &[TsNode<'_>]) {
        let Some(name_node) = node.child_by_field_name("name") else {
            return;
        };
        let name = self.text(name_node).to_string();
        let qualified_name = self.qualify(&name);
        let bases = node
            .child_by_field_name("superclasses")
            .map(|args| self.bases(args))
            .unwrap_or_default();
        let body = node.child_by_field_name("body");

        self.out.classes.push(ClassDecl {
            name,
            qualified_name: qualified_name.clone(),
            parent: self.parent(),
            bases,
            start_line: line_of(node),
            end_line: end_line_of(node),
            docstring: body.and_then(|b| self.docstring(b)),
        });

        for decorator in decorators {
            self.visit_decorator(*decorator, &qualified_name, true);
        }

        self.scopes.push(Scope {
            kind: ScopeKind::Class,
            qualified_name,
        });
        if let Some(body) = body {
            self.walk(body);
        }
        self.scopes.pop();
    }

    fn parameters(&self, params: TsNode<'_>) -> Vec<String> {
        let mut cursor = params.walk();
        params
            .named_children(&mut cursor)
            .filter_map(|param| self.parameter_name(param))
            .collect()
    }

    fn parameter_name(&self, node: TsNode<'_>) -> Option<String> {
        match node.kind() {
            "identifier" => Some(self.text(node).to_string()),
            "default_parameter" | "typed_default_parameter" => node
                .child_by_field_name("name")
                .map(|name| self.text(name).to_string()),
            "typed_parameter" | "list_splat_pattern" | "dictionary_splat_pattern" => {
                let mut cursor = node.walk();
                let first = node.named_children(&mut cursor).next()?;
                self.parameter_name(first)
            }
            _ => None,
        }
    }

    fn bases(&self, args: TsNode<'_>) -> Vec<String> {
        let mut cursor = args.walk();
        args.named_children(&mut cursor)
            .filter_map(|arg| match arg.kind() {
                "identifier" | "attribute" => self.dotted(arg),
                // Generic[T], Protocol[T]
                "subscript" => arg
                    .child_by_field_name("value")
                    .and_then(|value| self.dotted(value)),
                _ => None,
            })
            .filter(|base| base != "object")
            .collect()
    }

    fn docstring(&self, body: TsNode<'_>) -> Option<String> {
        let mut cursor = body.walk();
        let first = body
            .named_children(&mut cursor)
            .find(|child| child.kind() != "comment")?;
        if first.kind() != "expression_statement" {
            return None;
        }
        let mut inner = first.walk();
        let expr = first.named_children(&mut inner).next()?;
        self.string_literal(expr)
            .map(|doc| doc.trim().to_string())
            .filter(|doc| !doc.is_empty())
    }

    /// Value of a plain string literal. f-strings and implicit
    /// concatenations are not literals.
    fn string_literal(&self, node: TsNode<'_>) -> Option<String> {
        if node.kind() != "string" {
            return None;
        }
        let mut value = String::new();
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            match child.kind() {
                "string_content" | "escape_sequence" => value.push_str(self.text(child)),
                "interpolation" => return None,
                _ => {}
            }
        }
        Some(value)
    }

    /// `a.b.c` for plain name chains, `None` for anything else.
    fn dotted(&self, node: TsNode<'_>) -> Option<String> {
        match node.kind() {
            "identifier" => Some(self.text(node).to_string()),
            "attribute" => {
                let object = self.dotted(node.child_by_field_name("object")?)?;
                let attribute = node.child_by_field_name("attribute")?;
                Some(format!("{object}.{}", self.text(attribute)))
            }
            _ => None,
        }
    }

    fn callee(&self, function: TsNode<'_>) -> Option<String> {
        if let Some(dotted) = self.dotted(function) {
            return Some(dotted);
        }
        if function.kind() == "attribute" {
            let attribute = function.child_by_field_name("attribute")?;
            return Some(format!("{UNKNOWN_RECEIVER}.{}", self.text(attribute)));
        }
        None
    }

    fn positional_args<'t>(&self, args: TsNode<'t>) -> Vec<TsNode<'t>> {
        if args.kind() != "argument_list" {
            return Vec::new();
        }
        let mut cursor = args.walk();
        args.named_children(&mut cursor)
            .filter(|arg| {
                !matches!(
                    arg.kind(),
                    "keyword_argument" | "comment" | "list_splat" | "dictionary_splat"
                )
            })
            .collect()
    }

    fn keyword_arg<'t>(&self, args: TsNode<'t>, name: &str) -> Option<TsNode<'t>> {
        if args.kind() != "argument_list" {
            return None;
        }
        let mut cursor = args.walk();
        args.named_children(&mut cursor)
            .filter(|arg| arg.kind() == "keyword_argument")
            .find(|arg| {
                arg.child_by_field_name("name")
                    .is_some_and(|n| self.text(n) == name)
            })
            .and_then(|arg| arg.child_by_field_name("value"))
    }

    fn visit_call(&mut self, node: TsNode<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let Some(callee) = self.callee(function) else {
            return;
        };
        let line = line_of(node);

        if let Some(args) = node.child_by_field_name("arguments") {
            self.visit_io(&callee, args, line);
        }

        // Class-body calls run at definition time and have no function caller.
        self.out.calls.push(CallOccurrence {
            caller: self.current_function(),
            callee,
            line,
            in_main_guard: self.in_main_guard,
        });
    }

    fn visit_io(&mut self, callee: &str, args: TsNode<'_>, line: i64) {
        let Some(signature) = self
            .options
            .io_signatures
            .iter()
            .find(|sig| matches_signature(callee, &sig.callee))
        else {
            return;
        };
        let positional = self.positional_args(args);
        let Some(target) = positional
            .first()
            .and_then(|arg| self.string_literal(*arg))
            .filter(|target| !target.is_empty())
        else {
            return;
        };

        let mut direction = signature.direction;
        if callee.rsplit('.').next() == Some("open") {
            let mode = positional
                .get(1)
                .copied()
                .or_else(|| self.keyword_arg(args, "mode"))
                .and_then(|arg| self.string_literal(arg));
            direction = match mode {
                Some(mode) if mode_writes(&mode) => IoDirection::Write,
                _ => IoDirection::Read,
            };
        }

        self.out.io.push(IoOccurrence {
            function: self.current_function(),
            direction,
            target,
            line,
        });
    }

    fn visit_raise(&mut self, node: TsNode<'_>) {
        let mut cursor = node.walk();
        let Some(expr) = node
            .named_children(&mut cursor)
            .find(|child| child.kind() != "comment")
        else {
            return;
        };
        let target = if expr.kind() == "call" {
            expr.child_by_field_name("function")
        } else {
            Some(expr)
        };
        let Some(exception) = target.and_then(|t| self.dotted(t)) else {
            return;
        };
        self.out.raises.push(RaiseOccurrence {
            function: self.current_function(),
            exception,
            line: line_of(node),
        });
    }

    fn visit_assignment(&mut self, node: TsNode<'_>) {
        if self.in_class_body() {
            return;
        }
        let Some(left) = node.child_by_field_name("left") else {
            return;
        };
        let mut names = Vec::new();
        self.target_names(left, &mut names);

        let function = self.current_function();
        let line = line_of(node);
        for name in names {
            if !self.seen_variables.insert((function.clone(), name.clone())) {
                continue;
            }
            self.out.variables.push(VariableDecl {
                name,
                function: function.clone(),
                line,
            });
        }
    }

    fn target_names(&self, node: TsNode<'_>, names: &mut Vec<String>) {
        match node.kind() {
            "identifier" => names.push(self.text(node).to_string()),
            "pattern_list" | "tuple_pattern" | "list_pattern" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    self.target_names(child, names);
                }
            }
            _ => {}
        }
    }

    fn visit_import(&mut self, node: TsNode<'_>) {
        let line = line_of(node);
        let mut cursor = node.walk();
        for child in node.children_by_field_name("name", &mut cursor) {
            let (module, alias) = match child.kind() {
                "dotted_name" => (compact(self.text(child)), None),
                "aliased_import" => {
                    let Some(name) = child.child_by_field_name("name") else {
                        continue;
                    };
                    (
                        compact(self.text(name)),
                        child
                            .child_by_field_name("alias")
                            .map(|a| self.text(a).to_string()),
                    )
                }
                _ => continue,
            };
            self.out.imports.push(ImportOccurrence {
                form: ImportForm::Module,
                module,
                level: 0,
                alias,
                line,
            });
        }
    }

    fn visit_import_from(&mut self, node: TsNode<'_>) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        let raw = compact(self.text(module_node));
        let level = raw.chars().take_while(|c| *c == '.').count();
        let module = raw[level..].to_string();
        let line = line_of(node);

        let mut names: Vec<(String, Option<String>)> = Vec::new();
        let mut cursor = node.walk();
        for child in node.children_by_field_name("name", &mut cursor) {
            match child.kind() {
                "dotted_name" => names.push((compact(self.text(child)), None)),
                "aliased_import" => {
                    if let Some(name) = child.child_by_field_name("name") {
                        names.push((
                            compact(self.text(name)),
                            child
                                .child_by_field_name("alias")
                                .map(|a| self.text(a).to_string()),
                        ));
                    }
                }
                _ => {}
            }
        }
        let mut cursor = node.walk();
        if node
            .named_children(&mut cursor)
            .any(|child| child.kind() == "wildcard_import")
        {
            names.push(("*".to_string(), None));
        }

        for (name, alias) in names {
            self.out.imports.push(ImportOccurrence {
                form: ImportForm::From { name },
                module: module.clone(),
                level,
                alias,
                line,
            });
        }
    }

    fn visit_decorator(&mut self, node: TsNode<'_>, target: &str, on_class: bool) {
        let mut cursor = node.walk();
        let Some(expr) = node
            .named_children(&mut cursor)
            .find(|child| child.kind() != "comment")
        else {
            return;
        };
        let (callee, args) = if expr.kind() == "call" {
            (
                expr.child_by_field_name("function"),
                expr.child_by_field_name("arguments"),
            )
        } else {
            (Some(expr), None)
        };
        let Some(name) = callee.and_then(|c| self.dotted(c)) else {
            return;
        };
        let line = line_of(node);

        if !on_class
            && let Some((method, route)) = args.and_then(|args| self.route(&name, args))
        {
            self.out.routes.push(RouteOccurrence {
                handler: target.to_string(),
                method,
                route,
                line,
            });
        }
        self.out.decorators.push(DecoratorOccurrence {
            target: target.to_string(),
            on_class,
            name,
            line,
        });
    }

    /// `(METHOD, /path)` for `@<app>.<verb>("/path", ...)` decorators.
    fn route(&self, decorator: &str, args: TsNode<'_>) -> Option<(String, String)> {
        let (_, verb) = decorator.rsplit_once('.')?;
        if !self.options.route_decorators.iter().any(|d| d == verb) {
            return None;
        }
        let route = self
            .positional_args(args)
            .first()
            .and_then(|arg| self.string_literal(*arg))
            .filter(|route| route.starts_with('/'))?;
        let method = if verb == "route" {
            self.keyword_arg(args, "methods")
                .and_then(|list| self.first_string_element(list))
                .unwrap_or_else(|| "GET".to_string())
        } else {
            verb.to_string()
        };
        Some((method.to_ascii_uppercase(), route))
    }

    fn first_string_element(&self, list: TsNode<'_>) -> Option<String> {
        if !matches!(list.kind(), "list" | "tuple") {
            return None;
        }
        let mut cursor = list.walk();
        let first = list.named_children(&mut cursor).next()?;
        self.string_literal(first)
    }

    fn is_main_guard(&self, node: TsNode<'_>) -> bool {
        let Some(condition) = node.child_by_field_name("condition") else {
            return false;
        };
        let normalized: String = self
            .text(condition)
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| if c == '\'' { '"' } else { c })
            .collect();
        normalized == r#"__name__=="__main__""# || normalized == r#""__main__"==__name__"#
    }
}
