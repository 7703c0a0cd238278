//! Type descriptors for dynamic dispatch.
//!
//! The evaluator is untyped except where dynamic semantics need type
//! identity: interface satisfaction, type assertions, and method lookup
//! with promotion through embedded fields. This table holds exactly that
//! much structure and nothing else.

use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::ir::FuncId;
use crate::val::Value;

#[cfg(test)]
mod typ_test;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// A struct field. `embedded` carries the field's type when it is an
/// embedded (anonymous) field, which makes its methods candidates for
/// promotion into the outer type's method set.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: Arc<str>,
    pub embedded: Option<TypeId>,
}

impl FieldDef {
    pub fn plain(name: &str) -> Self {
        Self { name: Arc::from(name), embedded: None }
    }

    pub fn embedded(name: &str, ty: TypeId) -> Self {
        Self { name: Arc::from(name), embedded: Some(ty) }
    }
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    /// A named scalar or opaque type; asserts compare ids only.
    Prim,
    Struct { fields: Vec<FieldDef> },
    Iface { methods: Vec<Arc<str>> },
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: Arc<str>,
    pub kind: TypeKind,
    /// Methods declared directly on this type.
    pub methods: Vec<(Arc<str>, FuncId)>,
    /// Zero value, yielded by failed comma-ok assertions.
    pub zero: Value,
}

/// How a resolved method is reached from a receiver of the queried type.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodEntry {
    /// Field indices to walk from the receiver to the declaring value.
    pub path: Vec<usize>,
    pub target: MethodTarget,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodTarget {
    /// Concrete method body.
    Func(FuncId),
    /// The value at `path` is interface-typed; dispatch re-resolves
    /// against whatever it holds when the call happens.
    Dynamic,
}

#[derive(Debug, Default)]
pub struct TypeTable {
    defs: Vec<TypeDef>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: TypeDef) -> TypeId {
        let id = TypeId(self.defs.len() as u32);
        self.defs.push(def);
        id
    }

    pub fn def(&self, id: TypeId) -> Result<&TypeDef> {
        self.defs
            .get(id.0 as usize)
            .ok_or_else(|| anyhow!("unknown type id {}", id.0))
    }

    pub fn name(&self, id: TypeId) -> &str {
        self.defs
            .get(id.0 as usize)
            .map(|d| &*d.name)
            .unwrap_or("<unknown>")
    }

    pub fn is_iface(&self, id: TypeId) -> bool {
        matches!(
            self.defs.get(id.0 as usize).map(|d| &d.kind),
            Some(TypeKind::Iface { .. })
        )
    }

    /// Resolve `name` on `ty`, including promotion through embedded
    /// fields. Shallower declarations shadow deeper ones; two candidates
    /// at the same depth are ambiguous and resolve to nothing.
    pub fn method(&self, ty: TypeId, name: &str) -> Option<MethodEntry> {
        // Breadth-first over embedding depth.
        let mut frontier: Vec<(TypeId, Vec<usize>)> = vec![(ty, Vec::new())];
        let mut seen = crate::util::fast_map::FastHashSet::default();
        seen.insert(ty);
        while !frontier.is_empty() {
            let mut hits: Vec<MethodEntry> = Vec::new();
            for (tid, path) in &frontier {
                let def = self.defs.get(tid.0 as usize)?;
                if let Some((_, func)) = def.methods.iter().find(|(n, _)| &**n == name) {
                    hits.push(MethodEntry { path: path.clone(), target: MethodTarget::Func(*func) });
                } else if let TypeKind::Iface { methods } = &def.kind {
                    if methods.iter().any(|m| &**m == name) {
                        hits.push(MethodEntry { path: path.clone(), target: MethodTarget::Dynamic });
                    }
                }
            }
            match hits.len() {
                1 => return hits.pop(),
                n if n > 1 => return None,
                _ => {}
            }
            let mut next = Vec::new();
            for (tid, path) in frontier {
                if let Some(def) = self.defs.get(tid.0 as usize) {
                    if let TypeKind::Struct { fields } = &def.kind {
                        for (i, field) in fields.iter().enumerate() {
                            if let Some(fty) = field.embedded {
                                if seen.insert(fty) {
                                    let mut p = path.clone();
                                    p.push(i);
                                    next.push((fty, p));
                                }
                            }
                        }
                    }
                }
            }
            frontier = next;
        }
        None
    }

    /// An interface's required method names, or an error if `id` does not
    /// name an interface type.
    pub fn iface_methods(&self, id: TypeId) -> Result<&[Arc<str>]> {
        match &self.def(id)?.kind {
            TypeKind::Iface { methods } => Ok(methods),
            _ => Err(anyhow!("type {} is not an interface", self.name(id))),
        }
    }

    /// Whether `concrete`'s method set covers every method `iface` names.
    pub fn satisfies(&self, concrete: TypeId, iface: TypeId) -> Result<bool> {
        let methods = self.iface_methods(iface)?;
        Ok(methods.iter().all(|m| self.method(concrete, m).is_some()))
    }

    pub fn zero(&self, id: TypeId) -> Result<Value> {
        Ok(self.def(id)?.zero.clone())
    }
}
