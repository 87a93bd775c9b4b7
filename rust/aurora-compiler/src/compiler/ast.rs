//! AST definitions for Aurora Scheme.
//!
//! Nodes live in an arena owned by [`Ast`] and are addressed by [`Handle`]s.
//! A node is never moved once allocated; passes only rewrite its logical
//! fields (children, body, parameters). Side tables hold the results of the
//! analysis passes: one [`Scope`] per lambda, the set of applications in
//! tail position, and the rename map produced by scope analysis.

use crate::compiler::tokens::Span;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Special forms and primitive operators recognised by the compiler.
pub const KEYWORDS: &[&str] = &[
    "quote", "quasiquote", "unquote", "lambda", "define", "set!", "if", "cond", "else", "let",
    "and", "or", "begin", "call/cc", "fork", "import", "native", "display", "newline", "car",
    "cdr", "cons", "+", "-", "*", "/", "%", "pow", "=", "<", ">", "<=", ">=", "not",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// Arena index of a node (or of a heap object derived from one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(pub usize);

impl Handle {
    /// Label naming the code block compiled from this lambda.
    pub fn label(self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuoteKind {
    None,
    Quote,
    Quasiquote,
    Unquote,
}

/// An element of a lambda body or an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Child {
    Node(Handle),
    Number(f64),
    Boolean(bool),
    /// Quoted atom, stored without the leading `'`.
    Symbol(String),
    Variable(String),
    Keyword(String),
}

impl Child {
    pub fn as_node(&self) -> Option<Handle> {
        match self {
            Child::Node(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Child::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_keyword(&self, name: &str) -> bool {
        matches!(self, Child::Keyword(k) if k == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LambdaNode {
    pub parent: Option<Handle>,
    pub parameters: Vec<String>,
    pub body: Vec<Child>,
}

impl LambdaNode {
    /// Add a parameter; a name that is already present is ignored.
    pub fn add_parameter(&mut self, name: &str) {
        if !self.parameters.iter().any(|p| p == name) {
            self.parameters.push(name.to_string());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationNode {
    pub parent: Option<Handle>,
    pub children: Vec<Child>,
    pub quote: QuoteKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringNode {
    pub parent: Option<Handle>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Lambda(LambdaNode),
    Application(ApplicationNode),
    Str(StringNode),
}

impl Node {
    pub fn parent(&self) -> Option<Handle> {
        match self {
            Node::Lambda(l) => l.parent,
            Node::Application(a) => a.parent,
            Node::Str(s) => s.parent,
        }
    }

    fn set_parent(&mut self, parent: Handle) {
        match self {
            Node::Lambda(l) => l.parent = Some(parent),
            Node::Application(a) => a.parent = Some(parent),
            Node::Str(s) => s.parent = Some(parent),
        }
    }
}

/// Lexical scope of one lambda.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scope {
    pub parent: Option<Handle>,
    pub children: Vec<Handle>,
    pub bound: Vec<String>,
}

impl Scope {
    pub fn binds(&self, name: &str) -> bool {
        self.bound.iter().any(|b| b == name)
    }

    pub fn bind(&mut self, name: &str) {
        if !self.binds(name) {
            self.bound.push(name.to_string());
        }
    }
}

/// Where a renamed variable came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub owner: Handle,
    pub original: String,
}

#[derive(Debug, Clone)]
pub struct Ast {
    nodes: Vec<Node>,
    top: Handle,
    /// Source position of each node, when it came from text.
    pub spans: HashMap<Handle, Span>,
    pub scopes: BTreeMap<Handle, Scope>,
    pub tail_calls: BTreeSet<Handle>,
    /// Renamed variable → owner lambda and original name.
    pub variables: BTreeMap<String, VariableInfo>,
    /// Native libraries declared with `(native Lib)`.
    pub natives: BTreeSet<String>,
    /// Modules imported with `(import Alias "path")`, alias → path.
    pub dependencies: BTreeMap<String, String>,
    pub(crate) analysed: bool,
}

impl Default for Ast {
    fn default() -> Self {
        Self::new()
    }
}

impl Ast {
    /// Create an AST holding an empty top-level lambda.
    pub fn new() -> Self {
        let mut ast = Self {
            nodes: Vec::new(),
            top: Handle(0),
            spans: HashMap::new(),
            scopes: BTreeMap::new(),
            tail_calls: BTreeSet::new(),
            variables: BTreeMap::new(),
            natives: BTreeSet::new(),
            dependencies: BTreeMap::new(),
            analysed: false,
        };
        ast.top = ast.make_lambda(None);
        ast
    }

    pub fn top(&self) -> Handle {
        self.top
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_analysed(&self) -> bool {
        self.analysed
    }

    // ── Factories ──

    fn alloc(&mut self, node: Node) -> Handle {
        let handle = Handle(self.nodes.len());
        self.nodes.push(node);
        handle
    }

    pub fn make_lambda(&mut self, parent: Option<Handle>) -> Handle {
        self.alloc(Node::Lambda(LambdaNode { parent, parameters: Vec::new(), body: Vec::new() }))
    }

    pub fn make_application(&mut self, parent: Option<Handle>, quote: QuoteKind) -> Handle {
        self.alloc(Node::Application(ApplicationNode { parent, children: Vec::new(), quote }))
    }

    pub fn make_string(&mut self, parent: Option<Handle>, content: &str) -> Handle {
        self.alloc(Node::Str(StringNode { parent, content: content.to_string() }))
    }

    // ── Access ──

    pub fn get(&self, handle: Handle) -> Option<&Node> {
        self.nodes.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut Node> {
        self.nodes.get_mut(handle.0)
    }

    pub fn lambda(&self, handle: Handle) -> Option<&LambdaNode> {
        match self.get(handle) {
            Some(Node::Lambda(l)) => Some(l),
            _ => None,
        }
    }

    pub fn application(&self, handle: Handle) -> Option<&ApplicationNode> {
        match self.get(handle) {
            Some(Node::Application(a)) => Some(a),
            _ => None,
        }
    }

    pub fn string(&self, handle: Handle) -> Option<&str> {
        match self.get(handle) {
            Some(Node::Str(s)) => Some(&s.content),
            _ => None,
        }
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        (0..self.nodes.len()).map(Handle)
    }

    pub fn lambdas(&self) -> Vec<Handle> {
        self.handles().filter(|h| self.lambda(*h).is_some()).collect()
    }

    pub fn span_of(&self, handle: Handle) -> Option<Span> {
        self.spans.get(&handle).copied()
    }

    /// The lambda that lexically contains `handle` (a lambda contains itself).
    pub fn enclosing_lambda(&self, handle: Handle) -> Handle {
        let mut cursor = Some(handle);
        while let Some(h) = cursor {
            match self.get(h) {
                Some(Node::Lambda(_)) => return h,
                Some(node) => cursor = node.parent(),
                None => break,
            }
        }
        self.top
    }

    pub fn is_tail_call(&self, handle: Handle) -> bool {
        self.tail_calls.contains(&handle)
    }

    /// Original (pre-rename) name of a variable.
    pub fn original_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.variables.get(name).map(|v| v.original.as_str()).unwrap_or(name)
    }

    // ── Mutation ──

    /// Append `child` to a lambda body or application, fixing up its parent.
    pub fn push_child(&mut self, parent: Handle, child: Child) {
        if let Child::Node(h) = &child {
            if let Some(node) = self.get_mut(*h) {
                node.set_parent(parent);
            }
        }
        match self.get_mut(parent) {
            Some(Node::Lambda(l)) => l.body.push(child),
            Some(Node::Application(a)) => a.children.push(child),
            _ => {}
        }
    }

    pub fn add_parameter(&mut self, lambda: Handle, name: &str) {
        if let Some(Node::Lambda(l)) = self.get_mut(lambda) {
            l.add_parameter(name);
        }
    }

    // ── Pretty printing ──

    /// Render a node back to source text using original variable names.
    pub fn render(&self, handle: Handle) -> String {
        self.render_with(handle, &|name: &str| self.original_name(name).to_string())
    }

    /// Render a node, mapping every variable name through `name_of`.
    pub fn render_with(&self, handle: Handle, name_of: &dyn Fn(&str) -> String) -> String {
        self.render_node(handle, name_of, false)
    }

    /// Render the top-level lambda's body as a sequence of top-level forms.
    pub fn render_program(&self, name_of: &dyn Fn(&str) -> String) -> String {
        let Some(top) = self.lambda(self.top) else { return String::new() };
        top.body.iter().map(|c| self.render_child(c, name_of, false)).collect::<Vec<_>>().join("\n")
    }

    fn render_node(&self, handle: Handle, name_of: &dyn Fn(&str) -> String, in_quote: bool) -> String {
        match self.get(handle) {
            Some(Node::Str(s)) => format!("{:?}", s.content),
            Some(Node::Lambda(l)) => {
                let params: Vec<String> = l.parameters.iter().map(|p| name_of(p)).collect();
                let body: Vec<String> =
                    l.body.iter().map(|c| self.render_child(c, name_of, false)).collect();
                format!("(lambda ({}) {})", params.join(" "), body.join(" "))
            }
            Some(Node::Application(a)) => {
                let quoted = matches!(a.quote, QuoteKind::Quote | QuoteKind::Quasiquote);
                let inner = match a.quote {
                    QuoteKind::Unquote => false,
                    _ => in_quote || quoted,
                };
                let items: Vec<String> =
                    a.children.iter().map(|c| self.render_child(c, name_of, inner)).collect();
                let list = format!("({})", items.join(" "));
                match a.quote {
                    QuoteKind::None => list,
                    QuoteKind::Quote if in_quote => list,
                    QuoteKind::Quote => format!("'{}", list),
                    QuoteKind::Quasiquote => format!("`{}", list),
                    QuoteKind::Unquote => match items.as_slice() {
                        [single] => format!(",{}", single),
                        _ => format!(",{}", list),
                    },
                }
            }
            None => String::from("<invalid>"),
        }
    }

    fn render_child(&self, child: &Child, name_of: &dyn Fn(&str) -> String, in_quote: bool) -> String {
        match child {
            Child::Node(h) => self.render_node(*h, name_of, in_quote),
            Child::Number(n) => format_number(*n),
            Child::Boolean(true) => "#t".into(),
            Child::Boolean(false) => "#f".into(),
            Child::Symbol(s) if in_quote => s.clone(),
            Child::Symbol(s) => format!("'{}", s),
            Child::Variable(v) => name_of(v),
            Child::Keyword(k) => k.clone(),
        }
    }
}

/// Format a number the way Scheme prints it: integral values without a
/// fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ast_has_top_lambda() {
        let ast = Ast::new();
        assert_eq!(ast.top(), Handle(0));
        assert!(ast.lambda(ast.top()).is_some());
    }

    #[test]
    fn test_duplicate_parameters_ignored() {
        let mut ast = Ast::new();
        let l = ast.make_lambda(Some(ast.top()));
        ast.add_parameter(l, "x");
        ast.add_parameter(l, "y");
        ast.add_parameter(l, "x");
        assert_eq!(ast.lambda(l).unwrap().parameters, vec!["x", "y"]);
    }

    #[test]
    fn test_push_child_sets_parent() {
        let mut ast = Ast::new();
        let top = ast.top();
        let app = ast.make_application(None, QuoteKind::None);
        ast.push_child(top, Child::Node(app));
        assert_eq!(ast.get(app).unwrap().parent(), Some(top));
        assert_eq!(ast.enclosing_lambda(app), top);
    }

    #[test]
    fn test_render_quoted() {
        let mut ast = Ast::new();
        let top = ast.top();
        let q = ast.make_application(None, QuoteKind::Quote);
        ast.push_child(q, Child::Number(1.0));
        ast.push_child(q, Child::Symbol("a".into()));
        ast.push_child(top, Child::Node(q));
        assert_eq!(ast.render(q), "'(1 a)");
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(15.0), "15");
        assert_eq!(format_number(-2.0), "-2");
        assert_eq!(format_number(2.5), "2.5");
    }
}
