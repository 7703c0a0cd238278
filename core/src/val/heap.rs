//! Handle-based heap arena.
//!
//! Every reference value points at a cell through a [`HeapId`]. Cells live
//! for the duration of the run; identity is handle equality, so cyclic data
//! never confuses comparison or rendering. Cells are individually locked so
//! tasks touching distinct cells never contend.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use parking_lot::RwLock;

use super::{MapData, Value};

/// Index of a cell in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

/// One step of an interior access path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathSeg {
    Field(usize),
    Index(usize),
}

#[derive(Default)]
pub struct Heap {
    cells: RwLock<Vec<Arc<RwLock<Value>>>>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&self, init: Value) -> HeapId {
        let mut cells = self.cells.write();
        let id = HeapId(cells.len() as u32);
        cells.push(Arc::new(RwLock::new(init)));
        id
    }

    pub fn alloc_map(&self, zero: Value) -> HeapId {
        self.alloc(Value::MapStore(MapData::new(zero)))
    }

    fn cell(&self, id: HeapId) -> Result<Arc<RwLock<Value>>> {
        self.cells
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or_else(|| anyhow!("invalid heap handle {}", id.0))
    }

    /// Read the value at `path` inside cell `id`. `Err` is a runtime panic
    /// message (bad field or out-of-range index), not a host fault.
    pub fn read(&self, id: HeapId, path: &[PathSeg]) -> Result<std::result::Result<Value, String>> {
        let cell = self.cell(id)?;
        let guard = cell.read();
        Ok(navigate(&guard, path).map(|v| v.clone()))
    }

    /// Write `value` at `path` inside cell `id`.
    pub fn write(
        &self,
        id: HeapId,
        path: &[PathSeg],
        value: Value,
    ) -> Result<std::result::Result<(), String>> {
        let cell = self.cell(id)?;
        let mut guard = cell.write();
        Ok(navigate_mut(&mut guard, path).map(|slot| *slot = value))
    }

    /// Run `f` with mutable access to the value at `path`.
    pub fn with_mut<T>(
        &self,
        id: HeapId,
        path: &[PathSeg],
        f: impl FnOnce(&mut Value) -> T,
    ) -> Result<std::result::Result<T, String>> {
        let cell = self.cell(id)?;
        let mut guard = cell.write();
        Ok(navigate_mut(&mut guard, path).map(f))
    }

    /// Run `f` with shared access to the value at `path`.
    pub fn with<T>(
        &self,
        id: HeapId,
        path: &[PathSeg],
        f: impl FnOnce(&Value) -> T,
    ) -> Result<std::result::Result<T, String>> {
        let cell = self.cell(id)?;
        let guard = cell.read();
        Ok(navigate(&guard, path).map(f))
    }

    /// Heap-aware rendering: follows slice and map handles so aggregate
    /// contents print, which plain `Display` cannot do. Depth is bounded
    /// so cyclic structures terminate.
    pub fn render(&self, v: &Value) -> Result<String> {
        let mut out = String::new();
        self.render_into(v, &mut out, 0)?;
        Ok(out)
    }

    fn render_into(&self, v: &Value, out: &mut String, depth: usize) -> Result<()> {
        const MAX_RENDER_DEPTH: usize = 8;
        if depth > MAX_RENDER_DEPTH {
            out.push_str("...");
            return Ok(());
        }
        match v {
            Value::Slice(s) => {
                out.push('[');
                for i in 0..s.len {
                    if i > 0 {
                        out.push(' ');
                    }
                    let path = {
                        let mut p = s.path.clone();
                        p.push(PathSeg::Index(s.off + i));
                        p
                    };
                    match self.read(s.cell, &path)? {
                        Ok(elem) => self.render_into(&elem, out, depth + 1)?,
                        Err(_) => out.push('?'),
                    }
                }
                out.push(']');
            }
            Value::Map(id) => {
                let cell = self.cell(*id)?;
                let guard = cell.read();
                match &*guard {
                    Value::MapStore(data) => {
                        out.push_str("map[");
                        let mut pairs: Vec<(String, &Value)> = data
                            .iter()
                            .map(|(k, v)| (k.to_string(), v))
                            .collect();
                        pairs.sort_by(|a, b| a.0.cmp(&b.0));
                        for (i, (k, val)) in pairs.iter().enumerate() {
                            if i > 0 {
                                out.push(' ');
                            }
                            out.push_str(k);
                            out.push(':');
                            self.render_into(val, out, depth + 1)?;
                        }
                        out.push(']');
                    }
                    other => return Err(anyhow!("map handle points at {}", other.type_name())),
                }
            }
            Value::Pointer(p) => match self.read(p.cell, &p.path)? {
                Ok(target) => {
                    out.push('&');
                    self.render_into(&target, out, depth + 1)?;
                }
                Err(_) => out.push_str("<bad pointer>"),
            },
            Value::Struct(s) => {
                out.push('{');
                for (i, field) in s.fields.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    self.render_into(field, out, depth + 1)?;
                }
                out.push('}');
            }
            Value::Array(vals) => {
                out.push('[');
                for (i, elem) in vals.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    self.render_into(elem, out, depth + 1)?;
                }
                out.push(']');
            }
            Value::Iface(Some(i)) => self.render_into(&i.value, out, depth + 1)?,
            other => {
                let _ = write!(out, "{}", other);
            }
        }
        Ok(())
    }
}

fn navigate<'a>(root: &'a Value, path: &[PathSeg]) -> Result<&'a Value, String> {
    let mut cur = root;
    for seg in path {
        cur = match (seg, cur) {
            (PathSeg::Field(i), Value::Struct(s)) => s
                .fields
                .get(*i)
                .ok_or_else(|| format!("runtime error: invalid field index {i}"))?,
            (PathSeg::Index(i), Value::Array(vals)) => vals
                .get(*i)
                .ok_or_else(|| "runtime error: index out of range".to_string())?,
            (_, other) => {
                return Err(format!(
                    "runtime error: invalid address into {}",
                    other.type_name()
                ));
            }
        };
    }
    Ok(cur)
}

fn navigate_mut<'a>(root: &'a mut Value, path: &[PathSeg]) -> Result<&'a mut Value, String> {
    let mut cur = root;
    for seg in path {
        cur = match (seg, cur) {
            (PathSeg::Field(i), Value::Struct(s)) => Arc::make_mut(s)
                .fields
                .get_mut(*i)
                .ok_or_else(|| format!("runtime error: invalid field index {i}"))?,
            (PathSeg::Index(i), Value::Array(vals)) => Arc::make_mut(vals)
                .get_mut(*i)
                .ok_or_else(|| "runtime error: index out of range".to_string())?,
            (_, other) => {
                return Err(format!(
                    "runtime error: invalid address into {}",
                    other.type_name()
                ));
            }
        };
    }
    Ok(cur)
}
