//! Bytecode emission with emit-time peephole optimization.
//!
//! The compiler appends instructions one at a time; every emission
//! inspects the tail of the stream and may rewrite the last one or two
//! instructions into a fused form:
//!
//! - two constants under a binary operator fold into one constant;
//! - `x ± a`, `a ± x`, `a·x`, `(k·x+c)·a`, `(k·x+c)/a` and like-variable
//!   sums fuse into a single [`Instr::VarMul`] record;
//! - `x^k` for small integer `k` becomes a dedicated power instruction;
//! - `x·x` becomes `x^2`;
//! - an optimizable fixed-arity function over constant arguments is
//!   invoked at compile time.
//!
//! Every rewrite leaves the recorded stack-depth bookkeeping a safe upper
//! bound for the runtime stack.

use super::instruction::Instr;
use crate::error::ParserError;
use crate::token::{is_unary_plus, BinOp, BulkFunCallback, FunCallback, StrFunCallback, Value};

/// Append-only instruction stream with stack-depth tracking.
pub(crate) struct Bytecode {
    rpn: Vec<Instr>,
    /// Upper bound of the runtime stack depth after the last emission.
    stack_pos: usize,
    max_stack: usize,
    optimize: bool,
}

/// Affine view of a tail instruction: `(slot, mul, add)` such that the
/// instruction pushes `mul * slab[slot] + add` (constants have no slot and
/// `mul == 0`).
fn affine(instr: &Instr) -> Option<(Option<usize>, Value, Value)> {
    match instr {
        Instr::Val(v) => Some((None, 0.0, *v)),
        Instr::Var(s) => Some((Some(*s), 1.0, 0.0)),
        Instr::VarMul { slot, mul, add } => Some((Some(*slot), *mul, *add)),
        _ => None,
    }
}

impl Bytecode {
    pub(crate) fn new(optimize: bool) -> Self {
        Self {
            rpn: Vec::with_capacity(50),
            stack_pos: 0,
            max_stack: 0,
            optimize,
        }
    }

    fn push_depth(&mut self) {
        self.stack_pos += 1;
        self.max_stack = self.max_stack.max(self.stack_pos);
    }

    /// Append a constant.
    pub(crate) fn add_val(&mut self, val: Value) {
        self.push_depth();
        self.rpn.push(Instr::Val(val));
    }

    /// Append a variable read.
    pub(crate) fn add_var(&mut self, slot: usize) {
        self.push_depth();
        self.rpn.push(Instr::Var(slot));
    }

    /// Fold the two trailing constants under `op` into one.
    fn constant_fold(&mut self, op: BinOp) {
        let sz = self.rpn.len();
        let (Instr::Val(y), Instr::Val(x)) = (self.rpn[sz - 1].clone(), &mut self.rpn[sz - 2])
        else {
            debug_assert!(false, "constant_fold on non-constant tail");
            return;
        };
        *x = op.apply(*x, y);
        self.rpn.pop();
    }

    /// Append a built-in binary operator, applying tail rewrites first.
    #[allow(
        clippy::float_cmp,
        reason = "power and divisor patterns match exact literal values, as emitted"
    )]
    pub(crate) fn add_op(&mut self, op: BinOp) {
        let mut optimized = false;

        if self.optimize && self.rpn.len() >= 2 {
            let sz = self.rpn.len();

            if matches!((&self.rpn[sz - 2], &self.rpn[sz - 1]), (Instr::Val(_), Instr::Val(_))) {
                self.constant_fold(op);
                optimized = true;
            } else {
                match op {
                    BinOp::Pow => {
                        // Small integer powers of a plain variable.
                        if let (Instr::Var(slot), Instr::Val(k)) =
                            (&self.rpn[sz - 2], &self.rpn[sz - 1])
                        {
                            let (slot, k) = (*slot, *k);
                            let fused = if k == 0.0 {
                                Some(Instr::Val(1.0))
                            } else if k == 1.0 {
                                Some(Instr::Var(slot))
                            } else if k == 2.0 {
                                Some(Instr::VarPow2(slot))
                            } else if k == 3.0 {
                                Some(Instr::VarPow3(slot))
                            } else if k == 4.0 {
                                Some(Instr::VarPow4(slot))
                            } else {
                                None
                            };
                            if let Some(instr) = fused {
                                self.rpn[sz - 2] = instr;
                                self.rpn.pop();
                                optimized = true;
                            }
                        }
                    }

                    BinOp::Add | BinOp::Sub => {
                        // Affine fusion over any mix of constants, plain
                        // variables and already-fused records, as long as
                        // at most one distinct variable is involved.
                        if let (Some((sa, ma, ca)), Some((sb, mb, cb))) =
                            (affine(&self.rpn[sz - 2]), affine(&self.rpn[sz - 1]))
                        {
                            let slot = match (sa, sb) {
                                (Some(a), Some(b)) if a == b => Some(a),
                                (Some(a), None) => Some(a),
                                (None, Some(b)) => Some(b),
                                _ => None,
                            };
                            if let Some(slot) = slot {
                                let sign = if op == BinOp::Sub { -1.0 } else { 1.0 };
                                self.rpn[sz - 2] = Instr::VarMul {
                                    slot,
                                    mul: ma + sign * mb,
                                    add: ca + sign * cb,
                                };
                                self.rpn.pop();
                                optimized = true;
                            }
                        }
                    }

                    BinOp::Mul => {
                        let fused = match (&self.rpn[sz - 2], &self.rpn[sz - 1]) {
                            (Instr::Val(a), Instr::Var(s)) | (Instr::Var(s), Instr::Val(a)) => {
                                Some(Instr::VarMul {
                                    slot: *s,
                                    mul: *a,
                                    add: 0.0,
                                })
                            }
                            // a·(k·x+c) and (k·x+c)·a scale both coefficients.
                            (Instr::Val(a), Instr::VarMul { slot, mul, add })
                            | (Instr::VarMul { slot, mul, add }, Instr::Val(a)) => {
                                Some(Instr::VarMul {
                                    slot: *slot,
                                    mul: mul * a,
                                    add: add * a,
                                })
                            }
                            (Instr::Var(a), Instr::Var(b)) if a == b => {
                                Some(Instr::VarPow2(*a))
                            }
                            _ => None,
                        };
                        if let Some(instr) = fused {
                            self.rpn[sz - 2] = instr;
                            self.rpn.pop();
                            optimized = true;
                        }
                    }

                    BinOp::Div => {
                        let fused = match (&self.rpn[sz - 2], &self.rpn[sz - 1]) {
                            (Instr::VarMul { slot, mul, add }, Instr::Val(d)) if *d != 0.0 => {
                                Some(Instr::VarMul {
                                    slot: *slot,
                                    mul: mul / d,
                                    add: add / d,
                                })
                            }
                            _ => None,
                        };
                        if let Some(instr) = fused {
                            self.rpn[sz - 2] = instr;
                            self.rpn.pop();
                            optimized = true;
                        }
                    }

                    _ => {}
                }
            }
        }

        if !optimized {
            self.stack_pos -= 1;
            self.rpn.push(Instr::Bin(op));
        }
    }

    /// Append an assignment to `slot`.
    pub(crate) fn add_assign(&mut self, slot: usize) {
        self.stack_pos -= 1;
        self.rpn.push(Instr::Assign(slot));
    }

    /// Append an `If`/`Else`/`EndIf` marker; jump offsets are resolved in
    /// [`Bytecode::finalize`].
    pub(crate) fn add_if(&mut self) {
        self.rpn.push(Instr::If { jump: 0 });
    }

    pub(crate) fn add_else(&mut self) {
        self.rpn.push(Instr::Else { jump: 0 });
    }

    pub(crate) fn add_endif(&mut self) {
        self.rpn.push(Instr::EndIf);
    }

    /// Append a numeric function call.
    ///
    /// `argc` is the number of collected arguments, negated for variadic
    /// functions. An optimizable function over all-constant arguments is
    /// invoked right here and replaced by its result; a callback error
    /// aborts compilation. The canonical unary plus is elided entirely.
    pub(crate) fn add_fun(
        &mut self,
        cb: &FunCallback,
        argc: i32,
        optimizable: bool,
    ) -> Result<(), ParserError> {
        let n = argc.unsigned_abs() as usize;

        if optimizable && self.optimize && argc > 0 {
            if is_unary_plus(cb) {
                return Ok(());
            }

            let sz = self.rpn.len();
            let foldable = sz >= n
                && self.rpn[sz - n..]
                    .iter()
                    .all(|i| matches!(i, Instr::Val(_)));
            if foldable {
                let args: Vec<Value> = self.rpn[sz - n..]
                    .iter()
                    .map(|i| match i {
                        Instr::Val(v) => *v,
                        _ => unreachable!(),
                    })
                    .collect();
                let val = cb(&args)?;
                self.rpn.truncate(sz - n);
                self.rpn.push(Instr::Val(val));
                self.stack_pos = self.stack_pos + 1 - n;
                self.max_stack = self.max_stack.max(self.stack_pos);
                return Ok(());
            }
        }

        self.rpn.push(Instr::Fun {
            cb: cb.clone(),
            argc,
            optimizable,
        });
        self.stack_pos = self.stack_pos + 1 - n;
        self.max_stack = self.max_stack.max(self.stack_pos);
        Ok(())
    }

    /// Append a bulk function call.
    pub(crate) fn add_bulk_fun(&mut self, cb: &BulkFunCallback, argc: usize) {
        self.stack_pos = self.stack_pos + 1 - argc;
        self.max_stack = self.max_stack.max(self.stack_pos);
        self.rpn.push(Instr::FunBulk {
            cb: cb.clone(),
            argc,
        });
    }

    /// Append a string function call; `idx` references the string pool.
    pub(crate) fn add_str_fun(&mut self, cb: &StrFunCallback, argc: usize, idx: usize) {
        self.stack_pos = self.stack_pos + 1 - argc;
        self.max_stack = self.max_stack.max(self.stack_pos);
        self.rpn.push(Instr::FunStr {
            cb: cb.clone(),
            argc,
            idx,
        });
    }

    /// Append the terminator and resolve the conditional jump offsets:
    /// each `If` jumps forward to its `Else`, each `Else` to its `EndIf`.
    ///
    /// An `If` left without a branch is tolerated here; the compiler
    /// reports it as a missing else clause and discards the program.
    pub(crate) fn finalize(&mut self) -> Result<(), ParserError> {
        self.rpn.push(Instr::End);

        enum Marker {
            If,
            Else,
            EndIf,
        }

        let mut if_stack: Vec<usize> = Vec::new();
        let mut else_stack: Vec<usize> = Vec::new();
        for i in 0..self.rpn.len() {
            let marker = match &self.rpn[i] {
                Instr::If { .. } => Marker::If,
                Instr::Else { .. } => Marker::Else,
                Instr::EndIf => Marker::EndIf,
                _ => continue,
            };
            match marker {
                Marker::If => if_stack.push(i),
                Marker::Else => {
                    let idx = if_stack
                        .pop()
                        .ok_or_else(|| ParserError::internal("unmatched else marker"))?;
                    self.rpn[idx] = Instr::If { jump: i - idx };
                    else_stack.push(i);
                }
                Marker::EndIf => {
                    let idx = else_stack
                        .pop()
                        .ok_or_else(|| ParserError::internal("unmatched endif marker"))?;
                    self.rpn[idx] = Instr::Else { jump: i - idx };
                }
            }
        }
        Ok(())
    }

    /// Number of stack slots an evaluation of this program needs.
    pub(crate) const fn stack_required(&self) -> usize {
        self.max_stack + 1
    }

    pub(crate) fn len(&self) -> usize {
        self.rpn.len()
    }

    pub(crate) fn instructions(&self) -> &[Instr] {
        &self.rpn
    }

    pub(crate) fn into_instructions(self) -> Vec<Instr> {
        self.rpn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn code(optimize: bool) -> Bytecode {
        Bytecode::new(optimize)
    }

    #[test]
    fn test_constant_folding() {
        let mut bc = code(true);
        bc.add_val(2.0);
        bc.add_val(3.0);
        bc.add_op(BinOp::Mul);
        assert!(matches!(bc.instructions(), [Instr::Val(v)] if *v == 6.0));
    }

    #[test]
    fn test_no_folding_when_disabled() {
        let mut bc = code(false);
        bc.add_val(2.0);
        bc.add_val(3.0);
        bc.add_op(BinOp::Mul);
        assert_eq!(bc.len(), 3);
        assert!(matches!(bc.instructions()[2], Instr::Bin(BinOp::Mul)));
    }

    #[test]
    fn test_small_power_fusion() {
        for (k, expect_pow2, expect_pow3) in [(2.0, true, false), (3.0, false, true)] {
            let mut bc = code(true);
            bc.add_var(0);
            bc.add_val(k);
            bc.add_op(BinOp::Pow);
            assert_eq!(bc.len(), 1);
            assert_eq!(matches!(bc.instructions()[0], Instr::VarPow2(0)), expect_pow2);
            assert_eq!(matches!(bc.instructions()[0], Instr::VarPow3(0)), expect_pow3);
        }

        let mut bc = code(true);
        bc.add_var(0);
        bc.add_val(0.0);
        bc.add_op(BinOp::Pow);
        assert!(matches!(bc.instructions(), [Instr::Val(v)] if *v == 1.0));
    }

    #[test]
    fn test_affine_fusion_add() {
        // 3 + x -> VARMUL(mul=1, add=3)
        let mut bc = code(true);
        bc.add_val(3.0);
        bc.add_var(7);
        bc.add_op(BinOp::Add);
        match bc.instructions() {
            [Instr::VarMul { slot, mul, add }] => {
                assert_eq!(*slot, 7);
                assert_eq!(*mul, 1.0);
                assert_eq!(*add, 3.0);
            }
            other => panic!("expected VarMul, got {other:?}"),
        }
    }

    #[test]
    fn test_affine_fusion_sub_var_val() {
        // x - 4 -> VARMUL(mul=1, add=-4)
        let mut bc = code(true);
        bc.add_var(1);
        bc.add_val(4.0);
        bc.add_op(BinOp::Sub);
        match bc.instructions() {
            [Instr::VarMul { slot, mul, add }] => {
                assert_eq!((*slot, *mul, *add), (1, 1.0, -4.0));
            }
            other => panic!("expected VarMul, got {other:?}"),
        }
    }

    #[test]
    fn test_affine_fusion_same_variable() {
        // x + x -> VARMUL(mul=2, add=0); x + y stays unfused.
        let mut bc = code(true);
        bc.add_var(0);
        bc.add_var(0);
        bc.add_op(BinOp::Add);
        assert!(
            matches!(bc.instructions(), [Instr::VarMul { mul, add, .. }] if *mul == 2.0 && *add == 0.0)
        );

        let mut bc = code(true);
        bc.add_var(0);
        bc.add_var(1);
        bc.add_op(BinOp::Add);
        assert_eq!(bc.len(), 3);
    }

    #[test]
    fn test_scalar_times_variable() {
        // 2*(3*b+1) -> 6*b+2
        let mut bc = code(true);
        bc.add_val(3.0);
        bc.add_var(2);
        bc.add_op(BinOp::Mul);
        bc.add_val(1.0);
        bc.add_op(BinOp::Add);
        bc.add_val(2.0);
        bc.add_op(BinOp::Mul);
        match bc.instructions() {
            [Instr::VarMul { slot, mul, add }] => {
                assert_eq!((*slot, *mul, *add), (2, 6.0, 2.0));
            }
            other => panic!("expected VarMul, got {other:?}"),
        }
    }

    #[test]
    fn test_varmul_div() {
        // 4*a/2 -> 2*a
        let mut bc = code(true);
        bc.add_val(4.0);
        bc.add_var(0);
        bc.add_op(BinOp::Mul);
        bc.add_val(2.0);
        bc.add_op(BinOp::Div);
        assert!(
            matches!(bc.instructions(), [Instr::VarMul { mul, add, .. }] if *mul == 2.0 && *add == 0.0)
        );
    }

    #[test]
    fn test_square_fusion() {
        let mut bc = code(true);
        bc.add_var(3);
        bc.add_var(3);
        bc.add_op(BinOp::Mul);
        assert!(matches!(bc.instructions(), [Instr::VarPow2(3)]));
    }

    #[test]
    fn test_function_fold() {
        let cb: FunCallback = Arc::new(|args| Ok(args[0] + args[1]));
        let mut bc = code(true);
        bc.add_val(2.0);
        bc.add_val(5.0);
        bc.add_fun(&cb, 2, true).expect("fold");
        assert!(matches!(bc.instructions(), [Instr::Val(v)] if *v == 7.0));
    }

    #[test]
    fn test_function_fold_error_aborts() {
        let cb: FunCallback = Arc::new(|_| {
            Err(ParserError::new(crate::ErrorCode::DomainError))
        });
        let mut bc = code(true);
        bc.add_val(-1.0);
        let err = bc.add_fun(&cb, 1, true).expect_err("callback error");
        assert_eq!(err.code(), crate::ErrorCode::DomainError);
    }

    #[test]
    fn test_function_not_folded_over_variables() {
        let cb: FunCallback = Arc::new(|args| Ok(args[0]));
        let mut bc = code(true);
        bc.add_var(0);
        bc.add_fun(&cb, 1, true).expect("emit");
        assert_eq!(bc.len(), 2);
        assert!(matches!(bc.instructions()[1], Instr::Fun { .. }));
    }

    #[test]
    fn test_unary_plus_elided() {
        let cb = crate::unary_plus();
        let mut bc = code(true);
        bc.add_var(0);
        bc.add_fun(&cb, 1, true).expect("emit");
        assert!(matches!(bc.instructions(), [Instr::Var(0)]));
    }

    #[test]
    fn test_finalize_resolves_jumps() {
        let mut bc = code(true);
        bc.add_var(0); // condition
        bc.add_if();
        bc.add_val(1.0);
        bc.add_else();
        bc.add_val(2.0);
        bc.add_endif();
        bc.finalize().expect("finalize");

        let instrs = bc.instructions();
        assert!(matches!(instrs[1], Instr::If { jump: 2 }));
        assert!(matches!(instrs[3], Instr::Else { jump: 2 }));
        assert!(matches!(instrs[6], Instr::End));
    }

    #[test]
    fn test_stack_tracking_is_upper_bound() {
        let mut bc = code(true);
        bc.add_val(1.0);
        bc.add_val(2.0);
        bc.add_val(3.0);
        bc.add_op(BinOp::Mul);
        bc.add_op(BinOp::Add);
        assert!(bc.stack_required() >= 2);
    }
}
