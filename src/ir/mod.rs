//! JIR: the intermediate representation admitted by the JIT.
//!
//! A module is a self-contained unit: it owns a private [`ModuleContext`]
//! (its constant pool), defines functions and data globals, and refers to
//! other symbols by name only. Modules are moved into the pipeline and are
//! deliberately not `Clone`, so the caller cannot keep an alias to an
//! admitted module.
//!
//! All values are 64-bit integers. Functions take at most six parameters
//! and return one value.
//!
//! # Text Format
//!
//! ```text
//! ; Comments start with semicolon
//! module arith
//!
//! global counter = 0
//! global hidden seed = 42
//! extern puts
//!
//! define mul(%a, %b) {
//! entry:
//!     %r = mul %a, %b
//!     ret %r
//! }
//!
//! define hidden clamp(%x) {
//! entry:
//!     %small = icmp slt %x, 10
//!     condbr %small, ^done, ^cap
//! cap:
//!     br ^done
//! done:
//!     %v = phi [%x, ^entry], [10, ^cap]
//!     ret %v
//! }
//! ```

use crate::core::error::{JitError, JitResult};
use hashbrown::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod parser;

/// Maximum number of integer arguments passed in registers.
pub const MAX_PARAMS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Linkage {
    #[default]
    Exported,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
}

/// A symbol defined by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinedSymbol {
    pub name: String,
    pub linkage: Linkage,
    pub kind: SymbolKind,
}

/// Private constant pool of a module.
///
/// Every context gets a fresh id; contexts are never shared between modules.
#[derive(Debug)]
pub struct ModuleContext {
    id: ContextId,
    constants: Vec<i64>,
    index: HashMap<i64, ConstId>,
}

impl ModuleContext {
    pub fn new() -> Self {
        static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            id: ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed)),
            constants: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn intern_const(&mut self, value: i64) -> ConstId {
        if let Some(&id) = self.index.get(&value) {
            return id;
        }
        let id = ConstId(self.constants.len() as u32);
        self.constants.push(value);
        self.index.insert(value, id);
        id
    }

    pub fn constant(&self, id: ConstId) -> i64 {
        self.constants[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }
}

impl Default for ModuleContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Value(ValueId),
    Const(ConstId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    And,
    Or,
    Xor,
    Shl,
    AShr,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::SDiv => "sdiv",
            BinaryOp::SRem => "srem",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
            BinaryOp::Shl => "shl",
            BinaryOp::AShr => "ashr",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "add" => Some(BinaryOp::Add),
            "sub" => Some(BinaryOp::Sub),
            "mul" => Some(BinaryOp::Mul),
            "sdiv" => Some(BinaryOp::SDiv),
            "srem" => Some(BinaryOp::SRem),
            "and" => Some(BinaryOp::And),
            "or" => Some(BinaryOp::Or),
            "xor" => Some(BinaryOp::Xor),
            "shl" => Some(BinaryOp::Shl),
            "ashr" => Some(BinaryOp::AShr),
            _ => None,
        }
    }

    /// Division can trap, so it is never removed even when unused.
    pub fn may_trap(self) -> bool {
        matches!(self, BinaryOp::SDiv | BinaryOp::SRem)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
}

impl IntPredicate {
    pub fn name(self) -> &'static str {
        match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Slt => "slt",
            IntPredicate::Sle => "sle",
            IntPredicate::Sgt => "sgt",
            IntPredicate::Sge => "sge",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(IntPredicate::Eq),
            "ne" => Some(IntPredicate::Ne),
            "slt" => Some(IntPredicate::Slt),
            "sle" => Some(IntPredicate::Sle),
            "sgt" => Some(IntPredicate::Sgt),
            "sge" => Some(IntPredicate::Sge),
            _ => None,
        }
    }

    pub fn evaluate(self, lhs: i64, rhs: i64) -> bool {
        match self {
            IntPredicate::Eq => lhs == rhs,
            IntPredicate::Ne => lhs != rhs,
            IntPredicate::Slt => lhs < rhs,
            IntPredicate::Sle => lhs <= rhs,
            IntPredicate::Sgt => lhs > rhs,
            IntPredicate::Sge => lhs >= rhs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    Binary {
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
    },
    Icmp {
        pred: IntPredicate,
        lhs: Operand,
        rhs: Operand,
    },
    Copy(Operand),
    Call {
        callee: String,
        args: Vec<Operand>,
    },
    Load {
        global: String,
    },
    Store {
        global: String,
        value: Operand,
    },
    AddrOf {
        symbol: String,
    },
    Phi {
        incoming: Vec<(Operand, BlockId)>,
    },
    Ret(Option<Operand>),
    Br(BlockId),
    CondBr {
        cond: Operand,
        then_block: BlockId,
        else_block: BlockId,
    },
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Ret(_) | InstKind::Br(_) | InstKind::CondBr { .. }
        )
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, InstKind::Phi { .. })
    }

    /// Instructions whose only effect is their result.
    pub fn is_pure(&self) -> bool {
        match self {
            InstKind::Binary { op, .. } => !op.may_trap(),
            InstKind::Icmp { .. }
            | InstKind::Copy(_)
            | InstKind::Load { .. }
            | InstKind::AddrOf { .. }
            | InstKind::Phi { .. } => true,
            _ => false,
        }
    }

    pub fn operands(&self) -> Vec<Operand> {
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            InstKind::Copy(op) => vec![*op],
            InstKind::Call { args, .. } => args.clone(),
            InstKind::Store { value, .. } => vec![*value],
            InstKind::Phi { incoming } => incoming.iter().map(|(op, _)| *op).collect(),
            InstKind::Ret(Some(op)) => vec![*op],
            InstKind::CondBr { cond, .. } => vec![*cond],
            InstKind::Load { .. } | InstKind::AddrOf { .. } | InstKind::Ret(None) | InstKind::Br(_) => {
                Vec::new()
            }
        }
    }

    /// Apply `f` to every operand in place.
    pub fn map_operands(&mut self, mut f: impl FnMut(Operand) -> Operand) {
        match self {
            InstKind::Binary { lhs, rhs, .. } | InstKind::Icmp { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            InstKind::Copy(op) | InstKind::Store { value: op, .. } | InstKind::Ret(Some(op)) => {
                *op = f(*op)
            }
            InstKind::CondBr { cond, .. } => *cond = f(*cond),
            InstKind::Call { args, .. } => {
                for arg in args.iter_mut() {
                    *arg = f(*arg);
                }
            }
            InstKind::Phi { incoming } => {
                for (op, _) in incoming.iter_mut() {
                    *op = f(*op);
                }
            }
            InstKind::Load { .. } | InstKind::AddrOf { .. } | InstKind::Ret(None) | InstKind::Br(_) => {}
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br(target) => vec![*target],
            InstKind::CondBr {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            _ => Vec::new(),
        }
    }

    /// Symbol this instruction refers to by name, if any.
    pub fn symbol_ref(&self) -> Option<&str> {
        match self {
            InstKind::Call { callee, .. } => Some(callee),
            InstKind::Load { global } | InstKind::Store { global, .. } => Some(global),
            InstKind::AddrOf { symbol } => Some(symbol),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
}

impl Block {
    pub fn terminator(&self) -> Option<&Inst> {
        self.insts.last().filter(|inst| inst.kind.is_terminator())
    }

    pub fn phis(&self) -> impl Iterator<Item = &Inst> {
        self.insts.iter().take_while(|inst| inst.kind.is_phi())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    pub params: Vec<ValueId>,
    /// Names of all values, indexed by `ValueId`.
    pub value_names: Vec<String>,
    /// Entry block first.
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn value_count(&self) -> usize {
        self.value_names.len()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Inst> {
        self.blocks.iter().flat_map(|b| b.insts.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub name: String,
    pub linkage: Linkage,
    pub init: i64,
}

/// An IR module: private context, definitions and external references.
#[derive(Debug)]
pub struct Module {
    name: String,
    context: ModuleContext,
    functions: Vec<Function>,
    globals: Vec<Global>,
    externals: Vec<String>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: ModuleContext::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            externals: Vec::new(),
        }
    }

    /// Parse the text format, naming the module `name` unless the text
    /// carries a `module` header.
    pub fn parse(name: &str, text: &str) -> JitResult<Self> {
        parser::parse_module(name, text)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn context(&self) -> &ModuleContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ModuleContext {
        &mut self.context
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Split borrow used by transforms that intern constants while
    /// rewriting function bodies.
    pub fn parts_mut(&mut self) -> (&mut ModuleContext, &mut [Function]) {
        (&mut self.context, &mut self.functions)
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    pub fn externals(&self) -> &[String] {
        &self.externals
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn add_global(&mut self, global: Global) {
        self.globals.push(global);
    }

    pub fn declare_external(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.externals.contains(&name) {
            self.externals.push(name);
        }
    }

    pub fn constant(&self, id: ConstId) -> i64 {
        self.context.constant(id)
    }

    /// Symbols this module defines, functions first.
    pub fn defined_symbols(&self) -> Vec<DefinedSymbol> {
        let functions = self.functions.iter().map(|f| DefinedSymbol {
            name: f.name.clone(),
            linkage: f.linkage,
            kind: SymbolKind::Function,
        });
        let globals = self.globals.iter().map(|g| DefinedSymbol {
            name: g.name.clone(),
            linkage: g.linkage,
            kind: SymbolKind::Data,
        });
        functions.chain(globals).collect()
    }

    pub fn defines(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.name == name) || self.globals.iter().any(|g| g.name == name)
    }

    /// Names referenced but not defined here, sorted.
    pub fn external_references(&self) -> Vec<String> {
        let mut refs: HashSet<&str> = self.externals.iter().map(String::as_str).collect();
        for function in &self.functions {
            for inst in function.instructions() {
                if let Some(symbol) = inst.kind.symbol_ref() {
                    refs.insert(symbol);
                }
            }
        }
        let mut refs: Vec<String> = refs
            .into_iter()
            .filter(|name| !self.defines(name))
            .map(str::to_string)
            .collect();
        refs.sort();
        refs
    }

    /// Structural checks every admitted module must pass.
    pub fn verify(&self) -> JitResult<()> {
        let invalid = |reason: String| JitError::InvalidModule {
            module: self.name.clone(),
            reason,
        };

        let mut seen = HashSet::new();
        for symbol in self.defined_symbols() {
            if !seen.insert(symbol.name.clone()) {
                return Err(invalid(format!("`{}` is defined more than once", symbol.name)));
            }
        }

        for function in &self.functions {
            if function.params.len() > MAX_PARAMS {
                return Err(invalid(format!(
                    "`{}` takes {} parameters, at most {} are supported",
                    function.name,
                    function.params.len(),
                    MAX_PARAMS
                )));
            }
            if function.blocks.is_empty() {
                return Err(invalid(format!("`{}` has no blocks", function.name)));
            }
            self.verify_function(function).map_err(invalid)?;
        }
        Ok(())
    }

    fn verify_function(&self, function: &Function) -> Result<(), String> {
        let block_count = function.blocks.len() as u32;
        let value_count = function.value_count() as u32;
        let check_operand = |op: &Operand| -> Result<(), String> {
            match op {
                Operand::Value(v) if v.0 >= value_count => {
                    Err(format!("`{}` uses unknown value #{}", function.name, v.0))
                }
                Operand::Const(c) if c.0 as usize >= self.context.len() => {
                    Err(format!("`{}` uses unknown constant #{}", function.name, c.0))
                }
                _ => Ok(()),
            }
        };

        for block in &function.blocks {
            let Some(last) = block.insts.last() else {
                return Err(format!("block `{}` in `{}` is empty", block.name, function.name));
            };
            if !last.kind.is_terminator() {
                return Err(format!(
                    "block `{}` in `{}` does not end with a terminator",
                    block.name, function.name
                ));
            }

            let mut phis_done = false;
            for (idx, inst) in block.insts.iter().enumerate() {
                if inst.kind.is_terminator() && idx + 1 != block.insts.len() {
                    return Err(format!(
                        "terminator in the middle of block `{}` in `{}`",
                        block.name, function.name
                    ));
                }
                if inst.kind.is_phi() {
                    if phis_done {
                        return Err(format!(
                            "phi after non-phi instruction in block `{}` of `{}`",
                            block.name, function.name
                        ));
                    }
                } else {
                    phis_done = true;
                }
                for op in inst.kind.operands() {
                    check_operand(&op)?;
                }
                for succ in inst.kind.successors() {
                    if succ.0 >= block_count {
                        return Err(format!("`{}` branches to unknown block", function.name));
                    }
                }
                if let InstKind::Phi { incoming } = &inst.kind {
                    if incoming.iter().any(|(_, b)| b.0 >= block_count) {
                        return Err(format!("phi in `{}` names unknown block", function.name));
                    }
                }
                if let InstKind::Call { callee, args } = &inst.kind {
                    if args.len() > MAX_PARAMS {
                        return Err(format!(
                            "call to `{}` passes {} arguments, at most {} are supported",
                            callee,
                            args.len(),
                            MAX_PARAMS
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Split into a data-only module (if there are globals) and one module
    /// per function. Each part gets its own fresh context.
    pub fn split_per_function(self) -> (Option<Module>, Vec<Module>) {
        let Module {
            name,
            context,
            functions,
            globals,
            externals,
        } = self;

        let data = if globals.is_empty() {
            None
        } else {
            let mut data = Module::new(format!("{name}.data"));
            data.globals = globals;
            Some(data)
        };

        let parts = functions
            .into_iter()
            .map(|mut function| {
                let mut part = Module::new(format!("{}.{}", name, function.name));
                for block in &mut function.blocks {
                    for inst in &mut block.insts {
                        inst.kind.map_operands(|op| match op {
                            Operand::Const(c) => {
                                Operand::Const(part.context.intern_const(context.constant(c)))
                            }
                            other => other,
                        });
                    }
                }
                part.externals = externals.clone();
                part.functions.push(function);
                part
            })
            .collect();

        (data, parts)
    }

    fn fmt_operand(&self, function: &Function, op: Operand) -> String {
        match op {
            Operand::Value(v) => format!("%{}", function.value_names[v.0 as usize]),
            Operand::Const(c) => self.context.constant(c).to_string(),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "module {}", self.name)?;
        for global in &self.globals {
            match global.linkage {
                Linkage::Exported => writeln!(f, "global {} = {}", global.name, global.init)?,
                Linkage::Hidden => writeln!(f, "global hidden {} = {}", global.name, global.init)?,
            }
        }
        for external in &self.externals {
            writeln!(f, "extern {external}")?;
        }

        for function in &self.functions {
            let params: Vec<String> = function
                .params
                .iter()
                .map(|p| format!("%{}", function.value_names[p.0 as usize]))
                .collect();
            let hidden = if function.linkage == Linkage::Hidden { "hidden " } else { "" };
            writeln!(f, "\ndefine {}{}({}) {{", hidden, function.name, params.join(", "))?;

            for block in &function.blocks {
                writeln!(f, "{}:", block.name)?;
                for inst in &block.insts {
                    let op = |o: Operand| self.fmt_operand(function, o);
                    let block_name = |b: BlockId| function.block(b).name.clone();
                    let body = match &inst.kind {
                        InstKind::Binary { op: bin, lhs, rhs } => {
                            format!("{} {}, {}", bin.name(), op(*lhs), op(*rhs))
                        }
                        InstKind::Icmp { pred, lhs, rhs } => {
                            format!("icmp {} {}, {}", pred.name(), op(*lhs), op(*rhs))
                        }
                        InstKind::Copy(src) => format!("copy {}", op(*src)),
                        InstKind::Call { callee, args } => {
                            let args: Vec<String> = args.iter().map(|a| op(*a)).collect();
                            format!("call @{}({})", callee, args.join(", "))
                        }
                        InstKind::Load { global } => format!("load @{global}"),
                        InstKind::Store { global, value } => format!("store @{}, {}", global, op(*value)),
                        InstKind::AddrOf { symbol } => format!("addr @{symbol}"),
                        InstKind::Phi { incoming } => {
                            let incoming: Vec<String> = incoming
                                .iter()
                                .map(|(v, b)| format!("[{}, ^{}]", op(*v), block_name(*b)))
                                .collect();
                            format!("phi {}", incoming.join(", "))
                        }
                        InstKind::Ret(Some(v)) => format!("ret {}", op(*v)),
                        InstKind::Ret(None) => "ret".to_string(),
                        InstKind::Br(target) => format!("br ^{}", block_name(*target)),
                        InstKind::CondBr {
                            cond,
                            then_block,
                            else_block,
                        } => format!(
                            "condbr {}, ^{}, ^{}",
                            op(*cond),
                            block_name(*then_block),
                            block_name(*else_block)
                        ),
                    };
                    match inst.result {
                        Some(result) => writeln!(
                            f,
                            "    %{} = {}",
                            function.value_names[result.0 as usize], body
                        )?,
                        None => writeln!(f, "    {body}")?,
                    }
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}
