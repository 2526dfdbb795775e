//! Bytecode instruction definitions.
//!
//! One instruction is one fixed-shape record; the whole compiled program
//! is a flat `Vec<Instr>` terminated by [`Instr::End`]. Variable access
//! goes through *slots*, indices into the caller-owned value slab passed
//! to every evaluation, never through raw pointers; that also makes the
//! bulk-mode offset arithmetic explicit.

use crate::token::{BinOp, BulkFunCallback, FunCallback, StrFunCallback, Value};
use std::fmt;

/// A single bytecode instruction.
#[derive(Clone)]
pub enum Instr {
    /// Push an inline constant.
    Val(Value),
    /// Push the variable at `slot` (+ bulk offset).
    Var(usize),
    /// Push `mul * x + add` for the variable at `slot`. Product of the
    /// affine fusion rewrites.
    VarMul { slot: usize, mul: Value, add: Value },
    /// Push `x^2`.
    VarPow2(usize),
    /// Push `x^3`.
    VarPow3(usize),
    /// Push `x^4`.
    VarPow4(usize),
    /// Pop two, push the combined value.
    Bin(BinOp),
    /// Pop one, store it into the variable at `slot` (+ bulk offset),
    /// push it back.
    Assign(usize),
    /// Pop the condition; when zero, advance the program counter by
    /// `jump` (landing on the matching [`Instr::Else`]).
    If { jump: usize },
    /// Unconditionally advance the program counter by `jump` (landing on
    /// the matching [`Instr::EndIf`]).
    Else { jump: usize },
    /// Branch join point; no effect.
    EndIf,
    /// Call a numeric function. Non-negative `argc` pops exactly that
    /// many arguments; negative `argc` is a variadic call with `-argc`
    /// collected arguments.
    Fun {
        cb: FunCallback,
        argc: i32,
        optimizable: bool,
    },
    /// Call a bulk function; receives the element offset and worker
    /// thread index in addition to its arguments.
    FunBulk { cb: BulkFunCallback, argc: usize },
    /// Call a string-prefixed function; `idx` references the string pool
    /// of the compiled program.
    FunStr {
        cb: StrFunCallback,
        argc: usize,
        idx: usize,
    },
    /// Terminator; every finalized program ends with exactly one.
    End,
}

impl Instr {
    /// The variable slot this instruction reads or writes, if any.
    pub(crate) fn slot(&self) -> Option<usize> {
        match self {
            Self::Var(s)
            | Self::VarMul { slot: s, .. }
            | Self::VarPow2(s)
            | Self::VarPow3(s)
            | Self::VarPow4(s)
            | Self::Assign(s) => Some(*s),
            _ => None,
        }
    }
}

impl fmt::Debug for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Val(v) => write!(f, "VAL[{v}]"),
            Self::Var(s) => write!(f, "VAR[{s}]"),
            Self::VarMul { slot, mul, add } => write!(f, "VARMUL[{slot}]*{mul}+{add}"),
            Self::VarPow2(s) => write!(f, "VARPOW2[{s}]"),
            Self::VarPow3(s) => write!(f, "VARPOW3[{s}]"),
            Self::VarPow4(s) => write!(f, "VARPOW4[{s}]"),
            Self::Bin(op) => write!(f, "{}", op.symbol()),
            Self::Assign(s) => write!(f, "ASSIGN[{s}]"),
            Self::If { jump } => write!(f, "IF[+{jump}]"),
            Self::Else { jump } => write!(f, "ELSE[+{jump}]"),
            Self::EndIf => write!(f, "ENDIF"),
            Self::Fun { argc, .. } => write!(f, "CALL[argc:{argc}]"),
            Self::FunBulk { argc, .. } => write!(f, "CALL_BULK[argc:{argc}]"),
            Self::FunStr { argc, idx, .. } => write!(f, "CALL_STR[argc:{argc} idx:{idx}]"),
            Self::End => write!(f, "END"),
        }
    }
}
