//! Module loading and linking.
//!
//! `(import Alias "path")` makes the top-level definitions of another file
//! visible as `Alias.name`. The loader discovers the import graph depth
//! first, orders it so dependencies come before their importers, and links
//! everything into one program: each dependency's top-level names are
//! qualified as `<module>.name` and alias references are rewritten to match.

use crate::compiler::ail::Program;
use crate::compiler::ast::{Ast, Child};
use crate::compiler::emit::source_hash;
use crate::CompileError;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("module not found: \"{import}\" (imported from {from})")]
    NotFound { import: String, from: String },
    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
    #[error("circular dependency between modules: {}", .modules.join(", "))]
    CircularDependency { modules: Vec<String> },
    #[error("in module {module}: {message}")]
    Module { module: String, message: String },
}

/// Where module sources come from.
pub trait SourceProvider {
    /// Locate `import` as written inside the module at `from`.
    fn resolve(&self, from: &Path, import: &str) -> Option<PathBuf>;
    fn read(&self, path: &Path) -> Result<String, LoaderError>;
}

fn sibling(from: &Path, import: &str) -> PathBuf {
    match from.parent() {
        Some(dir) => dir.join(import),
        None => PathBuf::from(import),
    }
}

/// Filesystem sources. Imports resolve next to the importing file first,
/// then under each search root, with or without a `.scm` extension.
#[derive(Debug, Clone, Default)]
pub struct FsSources {
    search_roots: Vec<PathBuf>,
}

impl FsSources {
    pub fn new(search_roots: Vec<PathBuf>) -> Self {
        Self { search_roots }
    }

    pub fn add_root(&mut self, root: PathBuf) {
        if !self.search_roots.contains(&root) {
            self.search_roots.push(root);
        }
    }
}

impl SourceProvider for FsSources {
    fn resolve(&self, from: &Path, import: &str) -> Option<PathBuf> {
        let mut candidates = vec![sibling(from, import)];
        candidates.extend(self.search_roots.iter().map(|root| root.join(import)));
        candidates
            .into_iter()
            .flat_map(|p| [p.clone(), p.with_extension("scm")])
            .find(|p| p.is_file())
    }

    fn read(&self, path: &Path) -> Result<String, LoaderError> {
        std::fs::read_to_string(path).map_err(|e| LoaderError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// In-memory sources keyed by path, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MemorySources {
    files: BTreeMap<PathBuf, String>,
}

impl MemorySources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        self.insert(path, source);
        self
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, source: impl Into<String>) {
        self.files.insert(path.into(), source.into());
    }
}

impl SourceProvider for MemorySources {
    fn resolve(&self, from: &Path, import: &str) -> Option<PathBuf> {
        [sibling(from, import), PathBuf::from(import)]
            .into_iter()
            .find(|p| self.files.contains_key(p))
    }

    fn read(&self, path: &Path) -> Result<String, LoaderError> {
        self.files.get(path).cloned().ok_or_else(|| LoaderError::Io {
            path: path.display().to_string(),
            message: "no such file".into(),
        })
    }
}

/// A linked module ready to run.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub qualified_name: String,
    pub path: PathBuf,
    /// The root module's own imports, alias → path as written.
    pub dependencies: BTreeMap<String, String>,
    /// Native libraries declared anywhere in the module graph.
    pub natives: BTreeSet<String>,
    pub ast: Ast,
    pub program: Program,
}

struct Unit {
    path: PathBuf,
    qualified: String,
    ast: Ast,
    /// alias → index of the imported unit
    imports: BTreeMap<String, usize>,
}

pub struct ModuleLoader<P: SourceProvider> {
    provider: P,
}

impl<P: SourceProvider> ModuleLoader<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Load, link and compile the module at `path`.
    pub fn load(&self, path: &Path) -> Result<LoadedModule, CompileError> {
        let source = self.provider.read(path)?;
        self.load_source(path, &source)
    }

    /// Like [`load`](Self::load) with the root module's source already in hand.
    pub fn load_source(&self, path: &Path, source: &str) -> Result<LoadedModule, CompileError> {
        let units = self.discover(path, source)?;
        let order = topological_order(&units)?;
        let root = &units[0];
        let dependencies = root.ast.dependencies.clone();
        let natives: BTreeSet<String> = units.iter().flat_map(|u| u.ast.natives.iter().cloned()).collect();

        if units.len() == 1 {
            let program = compile_unit(root, source)?;
            return Ok(LoadedModule {
                qualified_name: root.qualified.clone(),
                path: path.to_path_buf(),
                dependencies,
                natives,
                ast: root.ast.clone(),
                program,
            });
        }

        let linked = link(&units, &order, &natives);
        debug!(bytes = linked.len(), "linked module source");
        let mut ast = crate::parse(&linked)?;
        crate::analyse(&mut ast)?;
        let mut program = crate::compile_ast(&ast)?;
        program.source_hash = source_hash(&linked);
        info!(root = %root.qualified, modules = units.len(), "loaded module graph");
        Ok(LoadedModule {
            qualified_name: root.qualified.clone(),
            path: path.to_path_buf(),
            dependencies,
            natives,
            ast,
            program,
        })
    }

    /// Depth-first walk of the import graph. Unit 0 is the root.
    fn discover(&self, root_path: &Path, root_source: &str) -> Result<Vec<Unit>, CompileError> {
        let mut units: Vec<Unit> = Vec::new();
        let mut index: BTreeMap<PathBuf, usize> = BTreeMap::new();
        let mut names: HashSet<String> = HashSet::new();
        let mut stack = vec![(root_path.to_path_buf(), Some(root_source.to_string()))];
        let mut pending_imports: Vec<(usize, String, PathBuf)> = Vec::new();

        while let Some((path, source)) = stack.pop() {
            if index.contains_key(&path) {
                continue;
            }
            let source = match source {
                Some(s) => s,
                None => self.provider.read(&path)?,
            };
            let qualified = unique_name(&path, &mut names);
            let mut ast = crate::parse(&source).map_err(|e| in_module(&qualified, e))?;
            crate::analyse(&mut ast).map_err(|e| in_module(&qualified, e))?;
            debug!(module = %qualified, path = %path.display(), "resolved module");

            let id = units.len();
            for (alias, import) in &ast.dependencies {
                let resolved = self.provider.resolve(&path, import).ok_or_else(|| LoaderError::NotFound {
                    import: import.clone(),
                    from: path.display().to_string(),
                })?;
                pending_imports.push((id, alias.clone(), resolved.clone()));
                stack.push((resolved, None));
            }
            index.insert(path.clone(), id);
            units.push(Unit { path, qualified, ast, imports: BTreeMap::new() });
        }

        for (id, alias, path) in pending_imports {
            if let Some(target) = index.get(&path) {
                units[id].imports.insert(alias, *target);
            }
        }
        Ok(units)
    }
}

fn in_module(module: &str, err: CompileError) -> CompileError {
    CompileError::Module(LoaderError::Module { module: module.to_string(), message: err.to_string() })
}

/// File stem reduced to identifier characters, made unique with a suffix.
fn unique_name(path: &Path, taken: &mut HashSet<String>) -> String {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let mut base: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if base.is_empty() {
        base = "module".into();
    }
    let mut name = base.clone();
    let mut n = 2;
    while !taken.insert(name.clone()) {
        name = format!("{}_{}", base, n);
        n += 1;
    }
    name
}

/// Kahn's algorithm: dependencies first. Anything left over sits on a cycle.
fn topological_order(units: &[Unit]) -> Result<Vec<usize>, LoaderError> {
    let mut remaining: Vec<usize> = units.iter().map(|u| u.imports.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); units.len()];
    for (id, unit) in units.iter().enumerate() {
        for target in unit.imports.values() {
            dependents[*target].push(id);
        }
    }
    let mut ready: VecDeque<usize> = (0..units.len()).filter(|i| remaining[*i] == 0).collect();
    let mut order = Vec::with_capacity(units.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for dependent in &dependents[id] {
            remaining[*dependent] -= 1;
            if remaining[*dependent] == 0 {
                ready.push_back(*dependent);
            }
        }
    }
    if order.len() < units.len() {
        let mut modules: Vec<String> = (0..units.len())
            .filter(|i| !order.contains(i))
            .map(|i| units[i].qualified.clone())
            .collect();
        modules.sort();
        return Err(LoaderError::CircularDependency { modules });
    }
    Ok(order)
}

fn compile_unit(unit: &Unit, source: &str) -> Result<Program, CompileError> {
    let mut program = crate::compile_ast(&unit.ast)?;
    program.source_hash = source_hash(source);
    Ok(program)
}

/// Render every module in dependency order as one source text.
fn link(units: &[Unit], order: &[usize], natives: &BTreeSet<String>) -> String {
    let mut out = String::new();
    for lib in natives {
        out.push_str(&format!("(native {})\n", lib));
    }
    for &id in order {
        let unit = &units[id];
        let ast = &unit.ast;
        let top = ast.top();
        let is_root = id == 0;
        let qualified_of: BTreeMap<&str, &str> = unit
            .imports
            .iter()
            .map(|(alias, target)| (alias.as_str(), units[*target].qualified.as_str()))
            .collect();

        let name_of = |name: &str| -> String {
            if let Some(info) = ast.variables.get(name) {
                return if info.owner == top && !is_root {
                    format!("{}.{}", unit.qualified, info.original)
                } else {
                    info.original.clone()
                };
            }
            if let Some((alias, member)) = name.split_once('.') {
                if let Some(q) = qualified_of.get(alias) {
                    return format!("{}.{}", q, member);
                }
            }
            name.to_string()
        };

        out.push_str(&format!("; module {} ({})\n", unit.qualified, unit.path.display()));
        let Some(lambda) = ast.lambda(top) else { continue };
        for child in &lambda.body {
            let Child::Node(h) = child else { continue };
            let skip = ast.application(*h).is_some_and(|a| {
                a.children.first().is_some_and(|c| c.is_keyword("import") || c.is_keyword("native"))
            });
            if !skip {
                out.push_str(&ast.render_with(*h, &name_of));
                out.push('\n');
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader(files: &[(&str, &str)]) -> ModuleLoader<MemorySources> {
        let mut sources = MemorySources::new();
        for (path, src) in files {
            sources.insert(*path, *src);
        }
        ModuleLoader::new(sources)
    }

    #[test]
    fn test_single_module_compiles_directly() {
        let module = loader(&[("main.scm", "(display 1)")]).load(Path::new("main.scm")).unwrap();
        assert_eq!(module.qualified_name, "main");
        assert!(module.dependencies.is_empty());
        assert!(module.program.source_hash.starts_with("sha256:"));
    }

    #[test]
    fn test_alias_references_are_qualified() {
        let l = loader(&[
            ("app/main.scm", "(import M \"math-utils.scm\") (display (M.square 3))"),
            ("app/math-utils.scm", "(define (square x) (* x x)) (define unused 0)"),
        ]);
        let module = l.load(Path::new("app/main.scm")).unwrap();
        assert_eq!(module.dependencies.get("M").map(String::as_str), Some("math-utils.scm"));
        let originals: Vec<&String> = module.program.top_level.values().collect();
        assert!(originals.iter().any(|n| *n == "math-utils.square"));
        assert!(originals.iter().any(|n| *n == "math-utils.unused"));
        let text = module.ast.render(module.ast.top());
        assert!(text.contains("(display (math-utils.square 3))"));
    }

    #[test]
    fn test_dependency_locals_keep_their_names() {
        let l = loader(&[
            ("main.scm", "(import L \"lib.scm\") (display (L.f 1))"),
            ("lib.scm", "(define x 10) (define (f x) (+ x 1))"),
        ]);
        let module = l.load(Path::new("main.scm")).unwrap();
        let text = module.ast.render(module.ast.top());
        assert!(text.contains("(define lib.x 10)"));
        assert!(text.contains("(define lib.f (lambda (x) (+ x 1)))"));
    }

    #[test]
    fn test_dependencies_come_first() {
        let l = loader(&[
            ("main.scm", "(import A \"a.scm\") (display A.v)"),
            ("a.scm", "(import B \"b.scm\") (define v B.w)"),
            ("b.scm", "(define w 5)"),
        ]);
        let module = l.load(Path::new("main.scm")).unwrap();
        let text = module.ast.render(module.ast.top());
        let b = text.find("(define b.w 5)").unwrap();
        let a = text.find("(define a.v b.w)").unwrap();
        let main = text.find("(display a.v)").unwrap();
        assert!(b < a && a < main);
    }

    #[test]
    fn test_natives_are_collected() {
        let l = loader(&[
            ("main.scm", "(import L \"lib.scm\") (display (L.root 4))"),
            ("lib.scm", "(native Math) (define (root x) (Math.sqrt x))"),
        ]);
        let module = l.load(Path::new("main.scm")).unwrap();
        assert!(module.natives.contains("Math"));
        assert!(module.program.natives.contains("Math"));
    }

    #[test]
    fn test_circular_dependency_lists_modules() {
        let l = loader(&[
            ("main.scm", "(import A \"a.scm\") (display 1)"),
            ("a.scm", "(import B \"b.scm\") (define x 1)"),
            ("b.scm", "(import A \"a.scm\") (define y 2)"),
        ]);
        match l.load(Path::new("main.scm")) {
            Err(CompileError::Module(LoaderError::CircularDependency { modules })) => {
                assert_eq!(modules, vec!["a", "b", "main"]);
            }
            other => panic!("expected a cycle, got {:?}", other.map(|m| m.qualified_name)),
        }
    }

    #[test]
    fn test_missing_import() {
        let l = loader(&[("main.scm", "(import A \"nowhere.scm\")")]);
        assert!(matches!(
            l.load(Path::new("main.scm")),
            Err(CompileError::Module(LoaderError::NotFound { .. }))
        ));
    }

    #[test]
    fn test_parse_error_names_module() {
        let l = loader(&[("main.scm", "(import A \"a.scm\")"), ("a.scm", "(define")]);
        let err = l.load(Path::new("main.scm")).unwrap_err();
        assert!(err.to_string().contains("in module a"));
    }

    #[test]
    fn test_unique_names() {
        let mut taken = HashSet::new();
        assert_eq!(unique_name(Path::new("x/util.scm"), &mut taken), "util");
        assert_eq!(unique_name(Path::new("y/util.scm"), &mut taken), "util_2");
        assert_eq!(unique_name(Path::new("my lib.scm"), &mut taken), "my_lib");
    }
}
