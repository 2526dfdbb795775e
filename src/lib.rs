//! Mathematical expression parser and bytecode evaluator.
//!
//! Takes a textual arithmetic expression such as
//! `sin(2*x) + (a>0 ? 1 : -1)`, compiles it once into a compact
//! reverse-Polish bytecode, and evaluates that bytecode repeatedly
//! (optionally element-wise over a whole input vector) with
//! user-supplied variables, constants, functions and operators bound by
//! name.
//!
//! # Features
//! - Shunting-yard compilation to a flat instruction stream
//! - Emit-time peephole optimization: constant folding, affine fusion
//!   (`k·x + c`), small integer powers, compile-time function folding
//! - Stack-machine evaluation with a short-form fast path
//! - Bulk evaluation over per-element variable offsets; optional Rayon
//!   parallelism behind the `parallel` feature
//! - Pluggable numeric literal readers and a per-parser locale
//! - User-defined functions (fixed and variadic), string-prefixed and
//!   bulk functions, binary/prefix/postfix operators
//!
//! # Usage
//!
//! Variables live in a caller-owned slab; a binding maps a name to a slot
//! index into it:
//!
//! ```
//! use exprvm::Parser;
//! use std::sync::Arc;
//!
//! let mut parser = Parser::new();
//! parser.define_var("x", 0).expect("define");
//! parser.define_fun("mean", Arc::new(|args| {
//!     Ok(args.iter().sum::<f64>() / args.len() as f64)
//! }), -1, true).expect("define");
//!
//! parser.set_expr("mean(x, 2*x, 6)").expect("set");
//! let mut vars = [3.0];
//! assert_eq!(parser.eval(&mut vars).expect("eval"), 5.0);
//! ```
//!
//! Bulk mode evaluates one compiled expression over an input vector by
//! adding the element index to every variable slot:
//!
//! ```
//! use exprvm::Parser;
//!
//! let mut parser = Parser::new();
//! parser.define_var("x", 0).expect("define");
//! parser.set_expr("2*x+1").expect("set");
//!
//! let mut xs = [0.0, 1.0, 2.0, 3.0, 4.0];
//! let mut out = [0.0; 5];
//! parser.eval_bulk(&mut xs, &mut out).expect("bulk");
//! assert_eq!(out, [1.0, 3.0, 5.0, 7.0, 9.0]);
//! ```

mod error;
mod evaluator;
mod parser;
mod reader;
mod token;
pub mod valident;

#[cfg(feature = "parallel")]
mod parallel;


pub use error::{ErrorCode, ParserError};
pub use evaluator::Instr;
pub use parser::{PREC_SIGN, Parser, VarFactory};
pub use token::{
    Assoc, BinOp, BulkFunCallback, FunCallback, StrFunCallback, Value, prec, unary_plus,
};
pub use valident::{NumLocale, ValIdentCallback};

/// Maximum accepted expression length in bytes.
pub const MAX_EXPR_LEN: usize = 20_000;

/// Maximum accepted identifier length in bytes.
pub const MAX_IDENT_LEN: usize = 100;
