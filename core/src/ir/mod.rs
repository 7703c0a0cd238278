//! SSA-form intermediate representation.
//!
//! A [`Program`] is a set of [`Function`]s over a shared type table. Each
//! function is a graph of [`BasicBlock`]s; every instruction that produces
//! a value writes exactly one virtual register, assigned once per static
//! instruction. Block-argument merging is expressed with [`Op::Phi`].

use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::typ::{TypeId, TypeTable};
use crate::util::fast_map::FastHashMap;
use crate::val::Value;


pub type FuncId = usize;
pub type BlockId = usize;

/// Virtual register index, unique within its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u32);

/// Source position carried for frame introspection and panic reports.
#[derive(Debug, Clone)]
pub struct Loc {
    pub file: Arc<str>,
    pub line: u32,
}

impl Loc {
    pub fn new<S: AsRef<str>>(file: S, line: u32) -> Self {
        Self { file: Arc::from(file.as_ref()), line }
    }

    pub fn render(&self) -> String {
        format!("{}:{}", self.file, self.line)
    }
}

/// An instruction operand: a register or an immediate value.
#[derive(Debug, Clone)]
pub enum Operand {
    Reg(Reg),
    Lit(Value),
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Lit(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinKind {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    AndNot,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnKind {
    Neg,
    Not,
    BitNot,
}

/// Target of a numeric conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinOp {
    Len,
    Cap,
    Append,
    Copy,
    Delete,
    Close,
    /// Writes the rendered arguments plus newline through the platform's
    /// write primitive.
    Println,
}

/// One arm of a select.
#[derive(Debug, Clone)]
pub enum SelectCase {
    Send { chan: Operand, value: Operand },
    Recv { chan: Operand },
}

#[derive(Debug, Clone)]
pub enum Op {
    BinOp { op: BinKind, x: Operand, y: Operand },
    UnOp { op: UnKind, x: Operand },
    /// Merge point: one incoming operand per predecessor block. All phis
    /// at a block head read their inputs simultaneously.
    Phi { edges: Vec<(BlockId, Operand)> },
    Convert { x: Operand, to: NumKind },

    Call { callee: Operand, args: Vec<Operand> },
    /// Interface method call: resolves `method` against the dynamic type
    /// of the boxed value.
    Invoke { iface: Operand, method: Arc<str>, args: Vec<Operand> },
    MakeClosure { func: FuncId, captures: Vec<Operand> },
    /// Produce a bound method value from a receiver.
    BindMethod { recv: Operand, method: Arc<str> },

    MakeIface { ty: TypeId, x: Operand },
    /// Interface-to-interface conversion; statically checked, never fails.
    ChangeIface { x: Operand },
    /// `comma_ok` selects the two-result form; the single-result form
    /// panics on failure.
    TypeAssert { x: Operand, ty: TypeId, comma_ok: bool },

    /// Allocate a fresh heap cell holding `zero`, yielding its address.
    Alloc { zero: Value },
    Load { ptr: Operand },
    Store { ptr: Operand, value: Operand },
    FieldAddr { ptr: Operand, field: usize },
    Field { x: Operand, field: usize },
    IndexAddr { x: Operand, index: Operand },
    Index { x: Operand, index: Operand },
    /// Reslice of a slice or string; bounds default to 0 and len.
    SliceOf { x: Operand, low: Option<Operand>, high: Option<Operand> },
    MakeSlice { len: Operand, cap: Operand, zero: Value },
    MakeStruct { ty: TypeId, fields: Vec<Operand> },
    MakeMap { zero: Value },
    Lookup { map: Operand, key: Operand, comma_ok: bool },
    MapUpdate { map: Operand, key: Operand, value: Operand },
    Extract { tuple: Operand, index: usize },

    MakeChan { cap: Operand, zero: Value },
    Send { chan: Operand, value: Operand },
    Recv { chan: Operand, comma_ok: bool },
    /// Yields a tuple: chosen case index, receive ok flag, received value.
    /// A non-blocking select yields index == cases.len() when no case is
    /// ready.
    Select { cases: Vec<SelectCase>, blocking: bool },

    Go { callee: Operand, args: Vec<Operand> },
    Defer { callee: Operand, args: Vec<Operand> },
    Panic { x: Operand },
    Recover,
    /// Write a named result slot before the function returns.
    SetResult { index: usize, x: Operand },
    Builtin { op: BuiltinOp, args: Vec<Operand> },

    Jump { target: BlockId },
    Branch { cond: Operand, then_b: BlockId, else_b: BlockId },
    /// Stores the listed values into the result slots, then unwinds the
    /// frame's defers.
    Return { values: Vec<Operand> },
}

#[derive(Debug, Clone)]
pub struct Instr {
    pub dest: Option<Reg>,
    pub op: Op,
    pub loc: Loc,
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub instrs: Vec<Instr>,
}

/// A named result slot, pre-initialized to its zero value on entry.
#[derive(Debug, Clone)]
pub struct ResultDecl {
    pub name: Arc<str>,
    pub zero: Value,
}

#[derive(Debug)]
pub struct Function {
    /// Empty for anonymous functions; frames then report `<closure>`.
    pub name: Arc<str>,
    pub loc: Loc,
    /// Registers bound to closure captures, before params.
    pub captures: Vec<Reg>,
    pub params: Vec<Reg>,
    pub results: Vec<ResultDecl>,
    pub blocks: Vec<BasicBlock>,
    pub reg_count: u32,
}

impl Function {
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    pub fn display_name(&self) -> &str {
        if self.is_anonymous() { "<closure>" } else { &self.name }
    }
}

/// A complete module ready for execution.
#[derive(Debug)]
pub struct Program {
    pub funcs: Vec<Arc<Function>>,
    pub types: TypeTable,
    by_name: FastHashMap<Arc<str>, FuncId>,
    entry: Option<FuncId>,
}

impl Program {
    pub fn func(&self, id: FuncId) -> Result<&Arc<Function>> {
        self.funcs.get(id).ok_or_else(|| anyhow!("unknown function id {id}"))
    }

    pub fn func_by_name(&self, name: &str) -> Option<&Arc<Function>> {
        self.by_name.get(name).map(|id| &self.funcs[*id])
    }

    pub fn entry(&self) -> Result<&Arc<Function>> {
        match self.entry {
            Some(id) => self.func(id),
            None => self
                .func_by_name("main")
                .ok_or_else(|| anyhow!("program has no entry function")),
        }
    }
}

/// Builds one function. Obtained from [`ProgramBuilder::func`].
pub struct FuncBuilder {
    name: Arc<str>,
    loc: Loc,
    captures: Vec<Reg>,
    params: Vec<Reg>,
    results: Vec<ResultDecl>,
    blocks: Vec<BasicBlock>,
    cur: BlockId,
    next_reg: u32,
    line: u32,
}

impl FuncBuilder {
    fn new(name: &str, loc: Loc) -> Self {
        let line = loc.line;
        Self {
            name: Arc::from(name),
            loc,
            captures: Vec::new(),
            params: Vec::new(),
            results: Vec::new(),
            blocks: vec![BasicBlock::default()],
            cur: 0,
            next_reg: 0,
            line,
        }
    }

    fn fresh(&mut self) -> Reg {
        let r = Reg(self.next_reg);
        self.next_reg += 1;
        r
    }

    pub fn param(&mut self) -> Reg {
        let r = self.fresh();
        self.params.push(r);
        r
    }

    pub fn capture(&mut self) -> Reg {
        let r = self.fresh();
        self.captures.push(r);
        r
    }

    /// Declare a result slot; `name` may be empty for an unnamed result.
    pub fn result(&mut self, name: &str, zero: Value) -> usize {
        self.results.push(ResultDecl { name: Arc::from(name), zero });
        self.results.len() - 1
    }

    pub fn new_block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock::default());
        self.blocks.len() - 1
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.cur = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.cur
    }

    /// Set the source line attached to subsequently emitted instructions.
    pub fn at_line(&mut self, line: u32) {
        self.line = line;
    }

    /// Emit a value-producing instruction and return its register.
    pub fn emit(&mut self, op: Op) -> Reg {
        let dest = self.fresh();
        let loc = Loc { file: self.loc.file.clone(), line: self.line };
        self.blocks[self.cur]
            .instrs
            .push(Instr { dest: Some(dest), op, loc });
        dest
    }

    /// Reserve a register to be written by a later `emit_to`, so phi
    /// edges can reference values from blocks not yet filled in.
    pub fn reserve(&mut self) -> Reg {
        self.fresh()
    }

    /// Emit an instruction writing a previously reserved register.
    pub fn emit_to(&mut self, dest: Reg, op: Op) {
        let loc = Loc { file: self.loc.file.clone(), line: self.line };
        self.blocks[self.cur]
            .instrs
            .push(Instr { dest: Some(dest), op, loc });
    }

    /// Emit an instruction with no result (stores, sends, terminators).
    pub fn emit_void(&mut self, op: Op) {
        let loc = Loc { file: self.loc.file.clone(), line: self.line };
        self.blocks[self.cur].instrs.push(Instr { dest: None, op, loc });
    }

    pub fn ret(&mut self, values: Vec<Operand>) {
        self.emit_void(Op::Return { values });
    }

    pub fn jump(&mut self, target: BlockId) {
        self.emit_void(Op::Jump { target });
    }

    pub fn branch(&mut self, cond: impl Into<Operand>, then_b: BlockId, else_b: BlockId) {
        self.emit_void(Op::Branch { cond: cond.into(), then_b, else_b });
    }
}

/// Collects functions and types into a [`Program`].
pub struct ProgramBuilder {
    funcs: Vec<Option<Function>>,
    names: Vec<Arc<str>>,
    types: TypeTable,
    entry: Option<FuncId>,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            funcs: Vec::new(),
            names: Vec::new(),
            types: TypeTable::new(),
            entry: None,
        }
    }

    pub fn types(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    /// Reserve a function id so mutually recursive functions and closures
    /// can reference each other before their bodies exist.
    pub fn declare(&mut self, name: &str) -> FuncId {
        let id = self.funcs.len();
        self.funcs.push(None);
        self.names.push(Arc::from(name));
        id
    }

    pub fn func(&mut self, id: FuncId, loc: Loc) -> FuncBuilder {
        FuncBuilder::new(&self.names[id], loc)
    }

    pub fn define(&mut self, id: FuncId, fb: FuncBuilder) {
        self.funcs[id] = Some(Function {
            name: fb.name,
            loc: fb.loc,
            captures: fb.captures,
            params: fb.params,
            results: fb.results,
            blocks: fb.blocks,
            reg_count: fb.next_reg,
        });
    }

    pub fn set_entry(&mut self, id: FuncId) {
        self.entry = Some(id);
    }

    pub fn build(self) -> Result<Program> {
        let mut funcs = Vec::with_capacity(self.funcs.len());
        let mut by_name = FastHashMap::default();
        for (id, f) in self.funcs.into_iter().enumerate() {
            let f = f.ok_or_else(|| {
                anyhow!("function {} declared but never defined", self.names[id])
            })?;
            if !f.name.is_empty() {
                by_name.insert(f.name.clone(), id);
            }
            funcs.push(Arc::new(f));
        }
        Ok(Program {
            funcs,
            types: self.types,
            by_name,
            entry: self.entry,
        })
    }
}
