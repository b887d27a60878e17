//! Symbol tables and scopes.
//!
//! Scopes form a parent-linked tree rooted at the program scope; lookup
//! climbs the chain. Symbols live in one arena so passes can refer to
//! them by id.

use indexmap::IndexMap;

use metrail_dsl::position::Position;

use crate::types::Type;

pub type SymbolId = usize;
pub type ScopeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Metric,
    Capref,
    Decorator,
    Pattern,
}

/// What a symbol denotes after resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Index into the program's metric table.
    Metric(usize),
    /// Capture group `group` of compiled pattern `pattern`.
    Capture { pattern: usize, group: usize },
    /// Index into the checker's decorator declarations.
    Decorator(usize),
    /// Index into the checker's pattern fragments.
    Fragment(usize),
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub ty: Type,
    pub binding: Binding,
    pub pos: Position,
}

#[derive(Debug)]
struct Scope {
    parent: Option<ScopeId>,
    symbols: IndexMap<String, SymbolId>,
}

/// Arena of scopes and symbols for one compile.
#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
}

/// The program (root) scope.
pub const ROOT_SCOPE: ScopeId = 0;

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: vec![Scope {
                parent: None,
                symbols: IndexMap::new(),
            }],
            symbols: Vec::new(),
        }
    }

    pub fn push_scope(&mut self, parent: ScopeId) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope {
            parent: Some(parent),
            symbols: IndexMap::new(),
        });
        id
    }

    /// Declare a symbol in `scope`. On a name already present in that
    /// scope the existing symbol id is returned as the error.
    pub fn declare(&mut self, scope: ScopeId, symbol: Symbol) -> Result<SymbolId, SymbolId> {
        if let Some(&existing) = self.scopes[scope].symbols.get(&symbol.name) {
            return Err(existing);
        }
        let id = self.symbols.len();
        self.scopes[scope]
            .symbols
            .insert(symbol.name.clone(), id);
        self.symbols.push(symbol);
        Ok(id)
    }

    /// Add a symbol to the arena without binding a name (capture
    /// references are looked up against patterns, not scopes).
    pub fn add_unnamed(&mut self, symbol: Symbol) -> SymbolId {
        let id = self.symbols.len();
        self.symbols.push(symbol);
        id
    }

    /// Look a name up, climbing the scope chain.
    pub fn lookup(&self, mut scope: ScopeId, name: &str) -> Option<SymbolId> {
        loop {
            if let Some(&id) = self.scopes[scope].symbols.get(name) {
                return Some(id);
            }
            scope = self.scopes[scope].parent?;
        }
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Symbol {
        Symbol {
            name: name.into(),
            kind: SymbolKind::Metric,
            ty: Type::Int,
            binding: Binding::Metric(0),
            pos: Position::default(),
        }
    }

    #[test]
    fn test_lookup_climbs_chain() {
        let mut t = SymbolTable::new();
        let outer = t.push_scope(ROOT_SCOPE);
        let inner = t.push_scope(outer);
        let id = t.declare(ROOT_SCOPE, sym("m")).unwrap();
        assert_eq!(t.lookup(inner, "m"), Some(id));
        assert_eq!(t.lookup(inner, "missing"), None);
    }

    #[test]
    fn test_shadowing_resolves_innermost() {
        let mut t = SymbolTable::new();
        let inner = t.push_scope(ROOT_SCOPE);
        let outer_id = t.declare(ROOT_SCOPE, sym("m")).unwrap();
        let inner_id = t.declare(inner, sym("m")).unwrap();
        assert_eq!(t.lookup(inner, "m"), Some(inner_id));
        assert_eq!(t.lookup(ROOT_SCOPE, "m"), Some(outer_id));
    }

    #[test]
    fn test_duplicate_in_same_scope_rejected() {
        let mut t = SymbolTable::new();
        let first = t.declare(ROOT_SCOPE, sym("m")).unwrap();
        assert_eq!(t.declare(ROOT_SCOPE, sym("m")), Err(first));
    }
}
