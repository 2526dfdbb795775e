//! The stack virtual machine.
//!
//! A single dispatch loop over the instruction stream with one program
//! counter and an integer stack index into a pre-sized value buffer.
//! The same loop serves scalar and bulk evaluation: bulk mode adds the
//! element `offset` to every variable slot and hands `(offset, thread)`
//! to bulk callbacks, so one compiled expression evaluates element-wise
//! over a caller-supplied input vector.
//!
//! # Safety Model
//!
//! Variable storage is accessed through [`VarSlab`], a `Sync` wrapper
//! around the caller's `&mut [Value]`. The façade validates before any
//! run that every referenced slot plus the maximal offset is in bounds,
//! which makes the raw reads and writes sound. Parallel bulk evaluation
//! relies on the documented caller contract that `Assign` destinations
//! are distinct per element.
//!
//! Stack-index underflow cannot occur on bytecode produced by the
//! compiler; if it ever does, it is a compiler bug and panics via the
//! slice bounds check rather than corrupting memory.

use super::Program;
use super::instruction::Instr;
use crate::error::ParserError;
use crate::token::Value;

/// Shared view of the caller-owned variable slab.
///
/// Workers of a parallel bulk evaluation all hold the same `VarSlab`;
/// reads target `slot + offset` for the worker's own offsets and writes
/// are covered by the caller's distinct-destination contract.
pub(crate) struct VarSlab {
    ptr: *mut Value,
    len: usize,
}

// SAFETY: All access goes through `get`/`set` on indices validated against
// `len` before an evaluation starts; concurrent writers target disjoint
// elements per the bulk-mode caller contract.
unsafe impl Send for VarSlab {}
// SAFETY: see above.
unsafe impl Sync for VarSlab {}

impl VarSlab {
    pub(crate) fn new(slab: &mut [Value]) -> Self {
        Self {
            ptr: slab.as_mut_ptr(),
            len: slab.len(),
        }
    }

    #[inline]
    fn get(&self, idx: usize) -> Value {
        debug_assert!(idx < self.len, "variable slot out of bounds");
        // SAFETY: idx was validated against the slab length before the run.
        unsafe { *self.ptr.add(idx) }
    }

    #[inline]
    fn set(&self, idx: usize, val: Value) {
        debug_assert!(idx < self.len, "variable slot out of bounds");
        // SAFETY: idx was validated against the slab length before the run;
        // concurrent writes go to disjoint elements (caller contract).
        unsafe { *self.ptr.add(idx) = val }
    }
}

/// Execute the program for one element.
///
/// `stack` must provide at least [`Program::stack_required`] slots and be
/// exclusive to this call (partitioned per worker in bulk mode).
#[allow(
    clippy::float_cmp,
    reason = "the conditional jump tests for exact zero, like the comparison operators"
)]
pub(crate) fn run(
    prog: &Program,
    vars: &VarSlab,
    offset: usize,
    thread: usize,
    stack: &mut [Value],
) -> Result<Value, ParserError> {
    let rpn = &prog.rpn;
    let mut sidx = 0usize;
    let mut pc = 0usize;

    while pc < rpn.len() {
        match &rpn[pc] {
            Instr::Bin(op) => {
                sidx -= 1;
                stack[sidx - 1] = op.apply(stack[sidx - 1], stack[sidx]);
            }

            Instr::Val(v) => {
                stack[sidx] = *v;
                sidx += 1;
            }

            Instr::Var(slot) => {
                stack[sidx] = vars.get(slot + offset);
                sidx += 1;
            }

            Instr::VarMul { slot, mul, add } => {
                // Plain multiply-then-add: keeps results identical to the
                // unfused instruction sequence.
                stack[sidx] = vars.get(slot + offset) * mul + add;
                sidx += 1;
            }

            Instr::VarPow2(slot) => {
                let x = vars.get(slot + offset);
                stack[sidx] = x * x;
                sidx += 1;
            }

            Instr::VarPow3(slot) => {
                let x = vars.get(slot + offset);
                stack[sidx] = x * x * x;
                sidx += 1;
            }

            Instr::VarPow4(slot) => {
                let x = vars.get(slot + offset);
                let x2 = x * x;
                stack[sidx] = x2 * x2;
                sidx += 1;
            }

            Instr::Assign(slot) => {
                sidx -= 1;
                let v = stack[sidx];
                vars.set(slot + offset, v);
                stack[sidx - 1] = v;
            }

            Instr::If { jump } => {
                sidx -= 1;
                if stack[sidx] == 0.0 {
                    pc += jump;
                }
            }

            Instr::Else { jump } => pc += jump,

            Instr::EndIf => {}

            Instr::Fun { cb, argc, .. } => {
                if *argc == 0 {
                    stack[sidx] = cb(&[])?;
                    sidx += 1;
                } else {
                    let n = argc.unsigned_abs() as usize;
                    let base = if *argc < 0 {
                        // Malformed variadic/conditional combinations can
                        // reach here with too few values; report instead
                        // of corrupting the stack.
                        sidx.checked_sub(n)
                            .ok_or_else(|| ParserError::internal("variadic call underflow"))?
                    } else {
                        sidx - n
                    };
                    stack[base] = cb(&stack[base..base + n])?;
                    sidx = base + 1;
                }
            }

            Instr::FunBulk { cb, argc } => {
                if *argc == 0 {
                    stack[sidx] = cb(offset, thread, &[])?;
                    sidx += 1;
                } else {
                    let base = sidx - argc;
                    stack[base] = cb(offset, thread, &stack[base..base + argc])?;
                    sidx = base + 1;
                }
            }

            Instr::FunStr { cb, argc, idx } => {
                let s = &prog.strings[*idx];
                if *argc == 0 {
                    stack[sidx] = cb(s, &[])?;
                    sidx += 1;
                } else {
                    let base = sidx - argc;
                    stack[base] = cb(s, &stack[base..base + argc])?;
                    sidx = base + 1;
                }
            }

            Instr::End => break,
        }
        pc += 1;
    }

    Ok(stack[prog.num_results - 1])
}

/// Fast path for programs of a single producing instruction: dispatch
/// once, skip the loop and the stack entirely.
pub(crate) fn run_short(
    prog: &Program,
    vars: &VarSlab,
    offset: usize,
) -> Result<Value, ParserError> {
    match &prog.rpn[0] {
        Instr::Val(v) => Ok(*v),
        Instr::Var(slot) => Ok(vars.get(slot + offset)),
        Instr::VarMul { slot, mul, add } => Ok(vars.get(slot + offset) * mul + add),
        Instr::VarPow2(slot) => {
            let x = vars.get(slot + offset);
            Ok(x * x)
        }
        Instr::VarPow3(slot) => {
            let x = vars.get(slot + offset);
            Ok(x * x * x)
        }
        Instr::VarPow4(slot) => {
            let x = vars.get(slot + offset);
            let x2 = x * x;
            Ok(x2 * x2)
        }
        Instr::Fun { cb, argc: 0, .. } => cb(&[]),
        Instr::FunBulk { cb, argc: 0 } => cb(offset, 0, &[]),
        Instr::FunStr { cb, argc: 0, idx } => cb(&prog.strings[*idx], &[]),
        _ => Err(ParserError::internal("short dispatch on a non-producing instruction")),
    }
}
