//! Nested symbol scopes with free-variable promotion.

use gosling_object::Value;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Builtin,
    Free,
    /// The scope a function's own name resolves to inside its body, so
    /// recursion does not allocate a local slot.
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
    /// The static shape of the binding, when known.
    pub ty: Option<Value>,
}

impl Symbol {
    /// The storageless symbol produced for the blank identifier.
    fn blank() -> Symbol {
        Symbol {
            name: "_".to_string(),
            scope: SymbolScope::Global,
            index: 0,
            ty: None,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.name == "_"
    }
}

/// One scope in the tree. The root scope is the global scope; entering a
/// function or loop encloses the current table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    pub outer: Option<Box<SymbolTable>>,
    store: FxHashMap<String, Symbol>,
    pub num_definitions: usize,
    pub free_symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enclosed(outer: SymbolTable) -> Self {
        Self {
            outer: Some(Box::new(outer)),
            ..Self::default()
        }
    }

    fn scope_kind(&self) -> SymbolScope {
        if self.outer.is_none() {
            SymbolScope::Global
        } else {
            SymbolScope::Local
        }
    }

    pub fn define(&mut self, name: &str) -> Symbol {
        if name == "_" {
            return Symbol::blank();
        }
        if let Some(existing) = self.store.get(name) {
            return existing.clone();
        }
        let symbol = Symbol {
            name: name.to_string(),
            scope: self.scope_kind(),
            index: self.num_definitions,
            ty: None,
        };
        self.store.insert(name.to_string(), symbol.clone());
        self.num_definitions += 1;
        symbol
    }

    /// Define with a static type. A pre-existing symbol that already has a
    /// type is returned unchanged, which is how forward declarations of
    /// top-level functions avoid being overwritten.
    pub fn define_with_type(&mut self, name: &str, ty: Option<Value>) -> Symbol {
        if name == "_" {
            return Symbol::blank();
        }
        if let Some(existing) = self.store.get(name) {
            if existing.ty.is_some() {
                return existing.clone();
            }
        }
        let symbol = Symbol {
            name: name.to_string(),
            scope: self.scope_kind(),
            index: self.num_definitions,
            ty,
        };
        self.store.insert(name.to_string(), symbol.clone());
        self.num_definitions += 1;
        symbol
    }

    /// Insert a builtin at its fixed index. Never counted in
    /// `num_definitions`.
    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
            ty: Some(Value::Builtin(index)),
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Install the self-reference symbol for the function being compiled.
    pub fn define_function_name(&mut self, name: &str, ty: Option<Value>) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
            ty,
        };
        self.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Remove a short-lived entry, recursing outward when absent here.
    pub fn delete(&mut self, name: &str) {
        if self.store.remove(name).is_some() {
            self.num_definitions = self.num_definitions.saturating_sub(1);
        } else if let Some(outer) = self.outer.as_mut() {
            outer.delete(name);
        }
    }

    /// Restore a previously deleted symbol.
    pub fn reset(&mut self, symbol: Symbol) {
        self.store.insert(symbol.name.clone(), symbol);
        self.num_definitions += 1;
    }

    /// Resolve a name, promoting enclosing-function locals to free
    /// variables in this scope on first reference.
    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.store.get(name) {
            return Some(symbol.clone());
        }
        let outer = self.outer.as_mut()?;
        let symbol = outer.resolve(name)?;
        match symbol.scope {
            SymbolScope::Global | SymbolScope::Builtin | SymbolScope::Function => Some(symbol),
            SymbolScope::Local | SymbolScope::Free => Some(self.define_free(symbol)),
        }
    }

    fn define_free(&mut self, original: Symbol) -> Symbol {
        self.free_symbols.push(original.clone());
        let symbol = Symbol {
            name: original.name.clone(),
            scope: SymbolScope::Free,
            index: self.free_symbols.len() - 1,
            ty: original.ty,
        };
        self.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }

    /// Whether a name is defined in this scope directly (no outer lookup,
    /// no promotion).
    pub fn is_defined_here(&self, name: &str) -> bool {
        self.store.contains_key(name)
    }
}
