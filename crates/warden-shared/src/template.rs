//! Template renderer.
//!
//! Templates are plain text files with a small handlebars-like syntax:
//!
//! - `{{#if X}}...{{/if}}` keeps the block when `X` is truthy
//! - `{{#unless X}}...{{/unless}}` keeps it when `X` is falsy
//! - `{{#each X}}...{{/each}}` repeats the block per element of the sequence `X`;
//!   inside it `{{prop}}` reads element properties, `{{item}}` the element itself and
//!   `{{@index}}` the zero-based position
//! - `{{X}}` and `{{X | default:V}}` substitute a dotted-path value
//!
//! Falsy values: absent, null, `false`, `0`, `""`, `"0"`, `"false"`.
//!
//! Blocks are resolved before variables, and loop bodies are evaluated once per
//! element against that element's scope, so conditionals and variables inside a loop
//! see per-iteration values with the outer context as fallback.

use crate::error::{WardenError, WardenResult};
use crate::fsutil::{write_text, WriteOptions, WriteReport};
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

/// Suffix tried when the literal template name does not exist
pub const TEMPLATE_SUFFIX: &str = ".tmpl";

/// Substitution values: a JSON object
pub type TemplateContext = Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    If,
    Unless,
    Each,
}

impl BlockKind {
    fn name(&self) -> &'static str {
        match self {
            BlockKind::If => "if",
            BlockKind::Unless => "unless",
            BlockKind::Each => "each",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Var { path: String, default: Option<String> },
    Block { kind: BlockKind, expr: String, body: Vec<Node> },
}

fn tag_regex() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("static regex"))
}

/// Parser state: document nodes plus the stack of currently open blocks
struct Parser {
    template: String,
    root: Vec<Node>,
    open: Vec<(BlockKind, String, Vec<Node>)>,
}

impl Parser {
    fn syntax(&self, message: String) -> WardenError {
        WardenError::TemplateSyntax {
            template: self.template.clone(),
            message,
        }
    }

    fn current(&mut self) -> &mut Vec<Node> {
        match self.open.last_mut() {
            Some((_, _, body)) => body,
            None => &mut self.root,
        }
    }

    fn open_block(&mut self, tag: &str) -> WardenResult<()> {
        let (name, expr) = tag.split_once(char::is_whitespace).unwrap_or((tag, ""));
        let kind = match name {
            "if" => BlockKind::If,
            "unless" => BlockKind::Unless,
            "each" => BlockKind::Each,
            other => return Err(self.syntax(format!("unknown block '#{}'", other))),
        };
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(self.syntax(format!("'#{}' needs an argument", name)));
        }
        self.open.push((kind, expr.to_string(), Vec::new()));
        Ok(())
    }

    fn close_block(&mut self, tag: &str) -> WardenResult<()> {
        let close = tag.trim();
        let Some((kind, expr, body)) = self.open.pop() else {
            return Err(self.syntax(format!("'/{}' without matching open tag", close)));
        };
        if kind.name() != close {
            return Err(self.syntax(format!(
                "'/{}' closes '#{} {}'",
                close,
                kind.name(),
                expr
            )));
        }
        self.current().push(Node::Block { kind, expr, body });
        Ok(())
    }

    fn variable(&mut self, tag: &str) -> WardenResult<()> {
        let (path, default) = match tag.split_once('|') {
            Some((path, filter)) => {
                let filter = filter.trim();
                let Some(value) = filter.strip_prefix("default:") else {
                    return Err(self.syntax(format!("unsupported filter '{}'", filter)));
                };
                (path.trim(), Some(unquote(value.trim()).to_string()))
            }
            None => (tag.trim(), None),
        };
        self.current().push(Node::Var {
            path: path.to_string(),
            default,
        });
        Ok(())
    }

    fn finish(mut self) -> WardenResult<Vec<Node>> {
        if let Some((kind, expr, _)) = self.open.pop() {
            return Err(self.syntax(format!("unclosed '#{} {}'", kind.name(), expr)));
        }
        Ok(self.root)
    }
}

fn parse(template: &str, source: &str) -> WardenResult<Vec<Node>> {
    let mut parser = Parser {
        template: template.to_string(),
        root: Vec::new(),
        open: Vec::new(),
    };
    let mut last = 0;

    for caps in tag_regex().captures_iter(source) {
        let (Some(whole), Some(tag)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > last {
            parser
                .current()
                .push(Node::Text(source[last..whole.start()].to_string()));
        }
        last = whole.end();

        let tag = tag.as_str();
        if let Some(open) = tag.strip_prefix('#') {
            parser.open_block(open)?;
        } else if let Some(close) = tag.strip_prefix('/') {
            parser.close_block(close)?;
        } else {
            parser.variable(tag)?;
        }
    }

    if last < source.len() {
        parser.current().push(Node::Text(source[last..].to_string()));
    }
    parser.finish()
}

fn unquote(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Lookup scope; loop bodies push one per element.
struct Scope<'a> {
    vars: &'a Value,
    item: Option<&'a Value>,
    index: Option<&'a Value>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn root(vars: &'a Value) -> Self {
        Self {
            vars,
            item: None,
            index: None,
            parent: None,
        }
    }

    fn lookup(&self, path: &str) -> Option<&'a Value> {
        let local = match path {
            "item" | "this" => self.item.or_else(|| lookup_path(self.vars, path)),
            "@index" => self.index,
            _ => lookup_path(self.vars, path),
        };
        match local {
            Some(v) => Some(v),
            None => self.parent.and_then(|p| p.lookup(path)),
        }
    }
}

fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Truthiness used by `#if` / `#unless`
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(Value::String(s)) => !(s.is_empty() || s == "0" || s == "false"),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) if items.iter().all(|v| !v.is_object() && !v.is_array()) => {
            items.iter().map(to_text).collect::<Vec<_>>().join(", ")
        }
        other => other.to_string(),
    }
}

fn eval(template: &str, nodes: &[Node], scope: &Scope<'_>, out: &mut String) -> WardenResult<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var { path, default } => {
                let value = scope.lookup(path);
                let empty = matches!(value, None | Some(Value::Null))
                    || matches!(value, Some(Value::String(s)) if s.is_empty());
                if empty {
                    if let Some(d) = default {
                        out.push_str(d);
                    }
                } else if let Some(v) = value {
                    out.push_str(&to_text(v));
                }
            }
            Node::Block { kind, expr, body } => match kind {
                BlockKind::If => {
                    if is_truthy(scope.lookup(expr)) {
                        eval(template, body, scope, out)?;
                    }
                }
                BlockKind::Unless => {
                    if !is_truthy(scope.lookup(expr)) {
                        eval(template, body, scope, out)?;
                    }
                }
                BlockKind::Each => match scope.lookup(expr) {
                    None | Some(Value::Null) => {}
                    Some(Value::Array(items)) => {
                        for (i, element) in items.iter().enumerate() {
                            let index = Value::from(i);
                            let child = Scope {
                                vars: element,
                                item: Some(element),
                                index: Some(&index),
                                parent: Some(scope),
                            };
                            eval(template, body, &child, out)?;
                        }
                    }
                    Some(_) => {
                        return Err(WardenError::TemplateSyntax {
                            template: template.to_string(),
                            message: format!("'#each {}' needs a sequence", expr),
                        })
                    }
                },
            },
        }
    }
    Ok(())
}

/// Render template source text against `context`.
pub fn render_source(name: &str, source: &str, context: &TemplateContext) -> WardenResult<String> {
    let nodes = parse(name, source)?;
    let mut out = String::with_capacity(source.len());
    eval(name, &nodes, &Scope::root(context), &mut out)?;
    Ok(out)
}

/// Resolves named templates on a search path and renders them.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    search_path: Vec<PathBuf>,
}

impl TemplateRenderer {
    pub fn new(search_path: Vec<PathBuf>) -> Self {
        Self { search_path }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::new(vec![root.into()])
    }

    /// First existing `<dir>/<name>` or `<dir>/<name>.tmpl` on the search path
    pub fn resolve(&self, name: &str) -> WardenResult<PathBuf> {
        if name.split('/').any(|part| part == "..") {
            return Err(WardenError::TemplateNotFound(name.to_string()));
        }
        for dir in &self.search_path {
            let literal = dir.join(name);
            if literal.is_file() {
                return Ok(literal);
            }
            let suffixed = dir.join(format!("{}{}", name, TEMPLATE_SUFFIX));
            if suffixed.is_file() {
                return Ok(suffixed);
            }
        }
        Err(WardenError::TemplateNotFound(name.to_string()))
    }

    pub fn render(&self, name: &str, context: &TemplateContext) -> WardenResult<String> {
        let path = self.resolve(name)?;
        let source = std::fs::read_to_string(&path)?;
        debug!("Rendering template {} from {}", name, path.display());
        render_source(name, &source, context)
    }

    /// Render `name` and persist it at `target`.
    pub fn write(
        &self,
        name: &str,
        target: &Path,
        context: &TemplateContext,
        opts: &WriteOptions,
    ) -> WardenResult<WriteReport> {
        let rendered = self.render(name, context)?;
        write_text(target, &rendered, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn render(src: &str, ctx: Value) -> String {
        render_source("test", src, &ctx).unwrap()
    }

    #[test]
    fn test_if_unless() {
        let t = "{{#if a}}yes{{/if}}{{#unless a}}no{{/unless}}";
        assert_eq!(render(t, json!({"a": "1"})), "yes");
        assert_eq!(render(t, json!({})), "no");
        assert_eq!(render(t, json!({"a": "false"})), "no");
        assert_eq!(render(t, json!({"a": "0"})), "no");
        assert_eq!(render(t, json!({"a": ""})), "no");
        assert_eq!(render(t, json!({"a": true})), "yes");
    }

    #[test]
    fn test_each_scalar_index() {
        let t = "{{#each xs}}{{@index}}:{{item}};{{/each}}";
        assert_eq!(render(t, json!({"xs": ["a", "b"]})), "0:a;1:b;");
        assert_eq!(render(t, json!({"xs": []})), "");
        assert_eq!(render(t, json!({})), "");
    }

    #[test]
    fn test_each_objects_with_conditionals_and_outer_scope() {
        let t = "{{#each zones}}zone {{name}}{{#if primary}} (primary){{/if}} via {{server}}\n{{/each}}";
        let ctx = json!({
            "server": "ns1",
            "zones": [{"name": "a.com", "primary": true}, {"name": "b.com"}]
        });
        assert_eq!(render(t, ctx), "zone a.com (primary) via ns1\nzone b.com via ns1\n");
    }

    #[test]
    fn test_nested_blocks() {
        let t = "{{#if tls}}{{#unless self_signed}}acme{{/unless}}{{/if}}";
        assert_eq!(render(t, json!({"tls": 1, "self_signed": false})), "acme");
        assert_eq!(render(t, json!({"tls": 1, "self_signed": true})), "");
    }

    #[test]
    fn test_default_and_dotted_paths() {
        let t = "{{db.port | default: 5432 }}/{{db.name}}/{{missing}}";
        assert_eq!(render(t, json!({"db": {"name": "app"}})), "5432/app/");
        assert_eq!(render(t, json!({"db": {"port": 6000, "name": ""}})), "6000//");
        assert_eq!(render("{{x | default:\"a b\"}}", json!({})), "a b");
    }

    #[test]
    fn test_syntax_errors() {
        assert!(render_source("t", "{{#if a}}x", &json!({})).is_err());
        assert!(render_source("t", "{{/if}}", &json!({})).is_err());
        assert!(render_source("t", "{{#if a}}{{/each}}", &json!({})).is_err());
        assert!(render_source("t", "{{#each a}}{{/each}}", &json!({"a": "str"})).is_err());
    }

    #[test]
    fn test_resolve_suffix_and_not_found() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("mail")).unwrap();
        std::fs::write(tmp.path().join("mail/main.cf.tmpl"), "host={{h}}").unwrap();
        let renderer = TemplateRenderer::with_root(tmp.path());

        assert_eq!(
            renderer.render("mail/main.cf", &json!({"h": "mx"})).unwrap(),
            "host=mx"
        );
        assert!(matches!(
            renderer.render("mail/absent", &json!({})),
            Err(WardenError::TemplateNotFound(_))
        ));
        assert!(renderer.resolve("../etc/passwd").is_err());
    }

    #[test]
    fn test_write_normalizes_line_endings() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("conf"), "a={{a}}\r\nb\r\n").unwrap();
        let renderer = TemplateRenderer::with_root(tmp.path());
        let target = tmp.path().join("out/conf");
        renderer
            .write("conf", &target, &json!({"a": 1}), &WriteOptions::default())
            .unwrap();
        assert_eq!(std::fs::read_to_string(target).unwrap(), "a=1\nb\n");
    }
}
