// The transform layer applies a swappable module rewrite before compilation. A transform
// either returns the rewritten module or an error; the error fails the responsibility and the
// module never reaches the compile layer. Any Fn(Module) -> JitResult<Module> closure is a
// transform, IdentityTransform passes modules through unchanged, and PassPipeline is the
// default optimizer: it verifies the module, then runs constant folding, copy propagation and
// dead value elimination over every function until none of them reports a change.

//! Optimization transform stage and the default pass pipeline.

use super::IrLayer;
use crate::core::error::{JitError, JitResult};
use crate::ir::{BinaryOp, Function, InstKind, Module, ModuleContext, Operand, ValueId};
use crate::orc::MaterializationResponsibility;
use hashbrown::{HashMap, HashSet};
use std::sync::Arc;

/// A whole-module rewrite run immediately before compilation.
pub trait ModuleTransform: Send + Sync {
    fn transform(&self, module: Module) -> JitResult<Module>;
}

impl<F> ModuleTransform for F
where
    F: Fn(Module) -> JitResult<Module> + Send + Sync,
{
    fn transform(&self, module: Module) -> JitResult<Module> {
        self(module)
    }
}

/// Leaves modules untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl ModuleTransform for IdentityTransform {
    fn transform(&self, module: Module) -> JitResult<Module> {
        Ok(module)
    }
}

pub struct IrTransformLayer {
    transform: Arc<dyn ModuleTransform>,
    next: Arc<dyn IrLayer>,
}

impl IrTransformLayer {
    pub fn new(transform: Arc<dyn ModuleTransform>, next: Arc<dyn IrLayer>) -> Self {
        Self { transform, next }
    }
}

impl IrLayer for IrTransformLayer {
    fn emit(&self, r: MaterializationResponsibility, module: Module) {
        let name = module.name().to_string();
        match self.transform.transform(module) {
            Ok(module) => {
                log::trace!("transformed `{}`", name);
                self.next.emit(r, module)
            }
            Err(e) => {
                log::warn!("transform of `{}` failed: {}", name, e);
                r.fail(e)
            }
        }
    }
}

/// A rewrite of one function. Returns whether anything changed.
pub trait FunctionPass: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, module: &str, context: &mut ModuleContext, function: &mut Function) -> JitResult<bool>;
}

const MAX_ROUNDS: usize = 8;

/// Ordered list of function passes run to a fixed point.
pub struct PassPipeline {
    passes: Vec<Box<dyn FunctionPass>>,
}

impl PassPipeline {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    pub fn with_pass(mut self, pass: impl FunctionPass + 'static) -> Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    fn run_function(&self, module: &str, context: &mut ModuleContext, function: &mut Function) -> JitResult<()> {
        for round in 0..MAX_ROUNDS {
            let mut changed = false;
            for pass in &self.passes {
                if pass.run(module, context, function)? {
                    log::trace!("{} changed `{}` (round {})", pass.name(), function.name, round);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(())
    }
}

impl Default for PassPipeline {
    /// Constant folding, copy propagation and dead value elimination.
    fn default() -> Self {
        Self::new()
            .with_pass(ConstantFold)
            .with_pass(CopyPropagation)
            .with_pass(DeadValueElimination)
    }
}

impl ModuleTransform for PassPipeline {
    fn transform(&self, mut module: Module) -> JitResult<Module> {
        module.verify()?;
        let name = module.name().to_string();
        let (context, functions) = module.parts_mut();
        for function in functions.iter_mut() {
            self.run_function(&name, context, function)?;
        }
        Ok(module)
    }
}

fn fold_binary(op: BinaryOp, lhs: i64, rhs: i64) -> Option<i64> {
    Some(match op {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::SDiv => return lhs.checked_div(rhs),
        BinaryOp::SRem => return lhs.checked_rem(rhs),
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,
        BinaryOp::Shl => lhs.wrapping_shl(rhs as u32),
        BinaryOp::AShr => lhs.wrapping_shr(rhs as u32),
    })
}

/// Evaluates operations on constants, including comparisons and
/// conditional branches. A constant trapping division is an error.
pub struct ConstantFold;

impl FunctionPass for ConstantFold {
    fn name(&self) -> &'static str {
        "constant-fold"
    }

    fn run(&self, module: &str, context: &mut ModuleContext, function: &mut Function) -> JitResult<bool> {
        let mut changed = false;
        for block in &mut function.blocks {
            for inst in &mut block.insts {
                let folded = match &inst.kind {
                    InstKind::Binary {
                        op,
                        lhs: Operand::Const(l),
                        rhs: Operand::Const(r),
                    } => {
                        let (lhs, rhs) = (context.constant(*l), context.constant(*r));
                        match fold_binary(*op, lhs, rhs) {
                            Some(value) => InstKind::Copy(Operand::Const(context.intern_const(value))),
                            None => {
                                let reason = if rhs == 0 {
                                    format!("division by zero in `{}`", function.name)
                                } else {
                                    format!("overflow in `{} {}, {}` in `{}`", op.name(), lhs, rhs, function.name)
                                };
                                return Err(JitError::Optimization {
                                    module: module.to_string(),
                                    reason,
                                });
                            }
                        }
                    }
                    InstKind::Icmp {
                        pred,
                        lhs: Operand::Const(l),
                        rhs: Operand::Const(r),
                    } => {
                        let value = pred.evaluate(context.constant(*l), context.constant(*r)) as i64;
                        InstKind::Copy(Operand::Const(context.intern_const(value)))
                    }
                    InstKind::CondBr {
                        cond: Operand::Const(c),
                        then_block,
                        else_block,
                    } => {
                        if context.constant(*c) != 0 {
                            InstKind::Br(*then_block)
                        } else {
                            InstKind::Br(*else_block)
                        }
                    }
                    _ => continue,
                };
                inst.kind = folded;
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Replaces uses of `%v = copy x` with `x`.
pub struct CopyPropagation;

impl FunctionPass for CopyPropagation {
    fn name(&self) -> &'static str {
        "copy-propagation"
    }

    fn run(&self, _module: &str, _context: &mut ModuleContext, function: &mut Function) -> JitResult<bool> {
        let copies: HashMap<ValueId, Operand> = function
            .instructions()
            .filter_map(|inst| match (&inst.kind, inst.result) {
                (InstKind::Copy(src), Some(dst)) if *src != Operand::Value(dst) => Some((dst, *src)),
                _ => None,
            })
            .collect();
        if copies.is_empty() {
            return Ok(false);
        }

        let resolve = |mut op: Operand| {
            let mut steps = 0;
            while let Operand::Value(v) = op {
                match copies.get(&v) {
                    Some(next) if steps <= copies.len() => {
                        op = *next;
                        steps += 1;
                    }
                    _ => break,
                }
            }
            op
        };

        let mut changed = false;
        for block in &mut function.blocks {
            for inst in &mut block.insts {
                if matches!(inst.kind, InstKind::Copy(_)) {
                    continue;
                }
                inst.kind.map_operands(|op| {
                    let new = resolve(op);
                    changed |= new != op;
                    new
                });
            }
        }
        Ok(changed)
    }
}

/// Removes side-effect-free instructions whose result is never used.
pub struct DeadValueElimination;

impl FunctionPass for DeadValueElimination {
    fn name(&self) -> &'static str {
        "dead-value-elimination"
    }

    fn run(&self, _module: &str, _context: &mut ModuleContext, function: &mut Function) -> JitResult<bool> {
        let mut changed = false;
        loop {
            let used: HashSet<ValueId> = function
                .instructions()
                .flat_map(|inst| inst.kind.operands())
                .filter_map(|op| match op {
                    Operand::Value(v) => Some(v),
                    Operand::Const(_) => None,
                })
                .collect();

            let mut removed = 0;
            for block in &mut function.blocks {
                let before = block.insts.len();
                block.insts.retain(|inst| match inst.result {
                    Some(v) => !inst.kind.is_pure() || used.contains(&v),
                    None => true,
                });
                removed += before - block.insts.len();
            }
            if removed == 0 {
                break;
            }
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn optimize(text: &str) -> JitResult<Module> {
        PassPipeline::default().transform(Module::parse("opt", text)?)
    }

    #[test]
    fn test_constant_expression_folds_to_return() {
        let module = optimize(
            "define seven() {\nentry:\n  %a = add 3, 4\n  %b = copy %a\n  %unused = mul %b, 2\n  ret %b\n}\n",
        )
        .unwrap();
        let function = module.function("seven").unwrap();
        assert_eq!(function.blocks[0].insts.len(), 1);
        match &function.blocks[0].insts[0].kind {
            InstKind::Ret(Some(Operand::Const(c))) => assert_eq!(module.constant(*c), 7),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_constant_branch_becomes_jump() {
        let module = optimize(
            "define pick() {\nentry:\n  %c = icmp slt 1, 2\n  condbr %c, ^yes, ^no\nyes:\n  ret 1\nno:\n  ret 0\n}\n",
        )
        .unwrap();
        let entry = &module.function("pick").unwrap().blocks[0];
        assert!(matches!(entry.terminator().unwrap().kind, InstKind::Br(_)));
    }

    #[test]
    fn test_constant_division_by_zero_fails() {
        let err = optimize("define bad() {\nentry:\n  %r = sdiv 1, 0\n  ret %r\n}\n").unwrap_err();
        match err {
            JitError::Optimization { module, reason } => {
                assert_eq!(module, "opt");
                assert!(reason.contains("division by zero"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_calls_and_stores_survive() {
        let module = optimize(
            "global g = 0\nextern side\ndefine f(%x) {\nentry:\n  %ignored = call @side(%x)\n  store @g, %x\n  ret 0\n}\n",
        )
        .unwrap();
        assert_eq!(module.function("f").unwrap().blocks[0].insts.len(), 3);
    }

    #[test]
    fn test_closure_transform() {
        let rename = |mut module: Module| -> JitResult<Module> {
            module.set_name("renamed");
            Ok(module)
        };
        let module = rename.transform(Module::new("m")).unwrap();
        assert_eq!(module.name(), "renamed");
        assert_eq!(
            PassPipeline::default().pass_names(),
            vec!["constant-fold", "copy-propagation", "dead-value-elimination"]
        );
    }
}
