//! The parser façade.
//!
//! [`Parser`] owns the symbol tables, the locale and character-class
//! configuration, the compiled program and the evaluation stack buffer.
//! Symbols are defined up front, the expression text is set once, and the
//! first evaluation compiles it to bytecode; subsequent evaluations reuse
//! the program until a table mutation or a new expression invalidates it.
//!
//! Variable bindings are *slots*: indices into a caller-owned `&mut
//! [Value]` slab passed to every evaluation. The parser never owns
//! variable storage, and bulk mode reads slot `s` of element `i` at
//! `slab[s + i]`.
//!
//! # Example
//!
//! ```
//! use exprvm::Parser;
//!
//! let mut parser = Parser::new();
//! parser.define_var("x", 0).expect("define");
//! parser.set_expr("2*x+1").expect("set");
//!
//! let mut vars = [3.0];
//! assert_eq!(parser.eval(&mut vars).expect("eval"), 7.0);
//! ```

use crate::error::{ErrorCode, ParserError};
use crate::evaluator::execution::{self, VarSlab};
use crate::evaluator::{Instr, Program, compiler};
use crate::reader::TokenReader;
use crate::token::{Assoc, BulkFunCallback, FunCallback, FuncDef, StrFunCallback, Value, prec};
use crate::valident::{self, NumLocale, ValIdentCallback};
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Callback that materializes a variable binding on first reference to an
/// unknown identifier, returning the slot it should live at.
pub type VarFactory = Box<dyn FnMut(&str) -> Option<usize> + Send>;

/// Default precedence for sign-like prefix operators; binds tighter than
/// `^`, so `-2^2` evaluates to `4`.
pub const PREC_SIGN: i32 = prec::INFIX;

/// Built-in operator symbols a user binary operator may not shadow while
/// built-ins are enabled.
const BUILTIN_SYMBOLS: [&str; 18] = [
    "<=", ">=", "!=", "==", "<", ">", "+", "-", "*", "/", "^", "&&", "||", "=", "(", ")", "?", ":",
];

/// Name → binding maps, shared with the token reader during compilation.
pub(crate) struct SymbolTable {
    pub vars: FxHashMap<String, usize>,
    pub consts: FxHashMap<String, Value>,
    pub str_consts: FxHashMap<String, usize>,
    pub str_var_buf: Vec<String>,
    pub funs: FxHashMap<String, FuncDef>,
    pub bin_oprts: FxHashMap<String, FuncDef>,
    pub infix_oprts: FxHashMap<String, FuncDef>,
    pub postfix_oprts: FxHashMap<String, FuncDef>,
}

/// Tokenizer configuration.
pub(crate) struct Settings {
    pub locale: NumLocale,
    pub name_chars: String,
    pub oprt_chars: String,
    pub infix_chars: String,
    pub builtin_ops: bool,
}

/// Which table a callback definition targets; decides the conflict rules
/// and the identifier character class.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Target {
    Fun,
    Bin,
    Infix,
    Postfix,
}

/// A mathematical expression parser and bytecode evaluator.
pub struct Parser {
    symbols: SymbolTable,
    settings: Settings,
    val_idents: Vec<ValIdentCallback>,
    var_factory: Option<VarFactory>,
    optimize: bool,
    expr: String,
    program: Option<Program>,
    stack_buf: Vec<Value>,
    last_used: FxHashMap<String, Option<usize>>,
}

impl Parser {
    /// Create a parser with default configuration: built-in operators
    /// enabled, optimizer enabled, `.`/`,` locale, and the locale-aware
    /// decimal float reader registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable {
                vars: FxHashMap::default(),
                consts: FxHashMap::default(),
                str_consts: FxHashMap::default(),
                str_var_buf: Vec::new(),
                funs: FxHashMap::default(),
                bin_oprts: FxHashMap::default(),
                infix_oprts: FxHashMap::default(),
                postfix_oprts: FxHashMap::default(),
            },
            settings: Settings {
                locale: NumLocale::default(),
                name_chars: "0123456789_abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ"
                    .to_owned(),
                oprt_chars: "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ+-*^/?<>=#!$%&|~'_{}"
                    .to_owned(),
                infix_chars: "/+-*^?<>=#!$%&|~'_".to_owned(),
                builtin_ops: true,
            },
            val_idents: vec![Arc::new(valident::parse_float)],
            var_factory: None,
            optimize: true,
            expr: String::new(),
            program: None,
            stack_buf: Vec::new(),
            last_used: FxHashMap::default(),
        }
    }

    // =========================================================================
    // Symbol definition
    // =========================================================================

    /// Bind `name` to `slot` of the value slab passed at evaluation time.
    ///
    /// # Errors
    ///
    /// Fails when the name is invalid, too long, or collides with a
    /// constant. The table is unchanged on error.
    pub fn define_var(&mut self, name: &str, slot: usize) -> Result<(), ParserError> {
        self.check_len(name)?;
        if self.symbols.consts.contains_key(name) {
            return Err(ParserError::for_name(ErrorCode::NameConflict, name));
        }
        self.check_name(name, &self.settings.name_chars, ErrorCode::InvalidName)?;
        log::trace!("define variable {name:?} -> slot {slot}");
        self.symbols.vars.insert(name.to_owned(), slot);
        self.invalidate();
        Ok(())
    }

    /// Remove a variable binding; does nothing if it never existed.
    pub fn remove_var(&mut self, name: &str) {
        if self.symbols.vars.remove(name).is_some() {
            self.invalidate();
        }
    }

    /// Remove all variable bindings.
    pub fn clear_vars(&mut self) {
        self.symbols.vars.clear();
        self.invalidate();
    }

    /// Bind `name` to an immediate constant value. Redefining a constant
    /// overwrites it.
    ///
    /// # Errors
    ///
    /// Fails when the name is invalid or too long.
    pub fn define_const(&mut self, name: &str, val: Value) -> Result<(), ParserError> {
        self.check_len(name)?;
        self.check_name(name, &self.settings.name_chars, ErrorCode::InvalidName)?;
        self.symbols.consts.insert(name.to_owned(), val);
        self.invalidate();
        Ok(())
    }

    /// Bind `name` to a string constant, usable as the leading argument of
    /// string functions.
    ///
    /// # Errors
    ///
    /// Fails when the name is invalid, too long or already bound to a
    /// string constant.
    pub fn define_str_const(&mut self, name: &str, val: &str) -> Result<(), ParserError> {
        if self.symbols.str_consts.contains_key(name) {
            return Err(ParserError::for_name(ErrorCode::NameConflict, name));
        }
        self.check_len(name)?;
        self.check_name(name, &self.settings.name_chars, ErrorCode::InvalidName)?;
        self.symbols.str_var_buf.push(val.to_owned());
        self.symbols
            .str_consts
            .insert(name.to_owned(), self.symbols.str_var_buf.len() - 1);
        self.invalidate();
        Ok(())
    }

    /// Remove all numeric and string constants.
    pub fn clear_consts(&mut self) {
        self.symbols.consts.clear();
        self.symbols.str_consts.clear();
        self.symbols.str_var_buf.clear();
        self.invalidate();
    }

    /// Define a numeric function. `argc` is the argument count; `-1`
    /// declares a variadic function receiving all collected arguments.
    /// Optimizable functions may be invoked at compile time over constant
    /// arguments.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name, an arity below `-1`, or a name conflict
    /// with an operator table.
    pub fn define_fun(
        &mut self,
        name: &str,
        cb: FunCallback,
        argc: i32,
        optimizable: bool,
    ) -> Result<(), ParserError> {
        if argc < -1 {
            return Err(ParserError::for_name(ErrorCode::InvalidFunPtr, name));
        }
        self.add_callback(name, FuncDef::fun(cb, argc, optimizable), Target::Fun)
    }

    /// Define a bulk function; its callback additionally receives the
    /// element offset and worker thread index of the bulk evaluation.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or a name conflict.
    pub fn define_bulk_fun(
        &mut self,
        name: &str,
        cb: BulkFunCallback,
        argc: usize,
    ) -> Result<(), ParserError> {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_possible_wrap,
            reason = "arities beyond i32 are not expressible in a real expression"
        )]
        let argc = argc as i32;
        self.add_callback(name, FuncDef::bulk(cb, argc), Target::Fun)
    }

    /// Define a string-prefixed function taking a string followed by
    /// `argc` numeric arguments.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or a name conflict.
    pub fn define_str_fun(
        &mut self,
        name: &str,
        cb: StrFunCallback,
        argc: usize,
    ) -> Result<(), ParserError> {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_possible_wrap,
            reason = "arities beyond i32 are not expressible in a real expression"
        )]
        let argc = argc as i32;
        self.add_callback(name, FuncDef::str_fun(cb, argc), Target::Fun)
    }

    /// Remove all function bindings.
    pub fn clear_funs(&mut self) {
        self.symbols.funs.clear();
        self.invalidate();
    }

    /// Define a binary operator with explicit precedence and
    /// associativity.
    ///
    /// # Errors
    ///
    /// Fails on a negative precedence, an invalid name, a conflict with
    /// another table, or (while built-in operators are enabled) a name
    /// shadowing a built-in symbol.
    pub fn define_oprt(
        &mut self,
        name: &str,
        cb: FunCallback,
        precedence: i32,
        assoc: Assoc,
        optimizable: bool,
    ) -> Result<(), ParserError> {
        if precedence < 0 {
            return Err(ParserError::for_name(ErrorCode::OprtPriority, name));
        }
        if self.settings.builtin_ops && BUILTIN_SYMBOLS.contains(&name) {
            return Err(ParserError::for_name(ErrorCode::BuiltinOverload, name));
        }
        self.add_callback(
            name,
            FuncDef::oprt(cb, 2, precedence, assoc, optimizable),
            Target::Bin,
        )
    }

    /// Define a prefix (infix-unary) operator. [`PREC_SIGN`] is the usual
    /// precedence for sign operators.
    ///
    /// # Errors
    ///
    /// Fails on a negative precedence, an invalid name or a conflict.
    pub fn define_infix_oprt(
        &mut self,
        name: &str,
        cb: FunCallback,
        optimizable: bool,
    ) -> Result<(), ParserError> {
        self.define_infix_oprt_prec(name, cb, PREC_SIGN, optimizable)
    }

    /// Define a prefix operator with explicit precedence.
    ///
    /// # Errors
    ///
    /// Fails on a negative precedence, an invalid name or a conflict.
    pub fn define_infix_oprt_prec(
        &mut self,
        name: &str,
        cb: FunCallback,
        precedence: i32,
        optimizable: bool,
    ) -> Result<(), ParserError> {
        if precedence < 0 {
            return Err(ParserError::for_name(ErrorCode::OprtPriority, name));
        }
        self.add_callback(
            name,
            FuncDef::oprt(cb, 1, precedence, Assoc::Left, optimizable),
            Target::Infix,
        )
    }

    /// Define a postfix operator.
    ///
    /// # Errors
    ///
    /// Fails on an invalid name or a conflict.
    pub fn define_postfix_oprt(
        &mut self,
        name: &str,
        cb: FunCallback,
        optimizable: bool,
    ) -> Result<(), ParserError> {
        self.add_callback(
            name,
            FuncDef::oprt(cb, 1, prec::POSTFIX, Assoc::Left, optimizable),
            Target::Postfix,
        )
    }

    /// Remove all user binary operators.
    pub fn clear_oprts(&mut self) {
        self.symbols.bin_oprts.clear();
        self.invalidate();
    }

    /// Remove all infix operators.
    pub fn clear_infix_oprts(&mut self) {
        self.symbols.infix_oprts.clear();
        self.invalidate();
    }

    /// Remove all postfix operators.
    pub fn clear_postfix_oprts(&mut self) {
        self.symbols.postfix_oprts.clear();
        self.invalidate();
    }

    /// Shared definition path for functions and operators.
    ///
    /// Conflict rules: a name may live in at most one of the function and
    /// postfix tables; the infix and binary tables tolerate each other but
    /// conflict with everything else. Redefinition within one table
    /// overwrites.
    fn add_callback(
        &mut self,
        name: &str,
        def: FuncDef,
        target: Target,
    ) -> Result<(), ParserError> {
        self.check_len(name)?;

        let s = &self.symbols;
        let conflict = (target != Target::Fun && s.funs.contains_key(name))
            || (target != Target::Postfix && s.postfix_oprts.contains_key(name))
            || (!matches!(target, Target::Infix | Target::Bin)
                && (s.infix_oprts.contains_key(name) || s.bin_oprts.contains_key(name)));
        if conflict {
            return Err(ParserError::for_name(ErrorCode::NameConflict, name));
        }

        let (charset, bad_name) = match target {
            Target::Fun => (&self.settings.name_chars, ErrorCode::InvalidName),
            Target::Bin => (&self.settings.oprt_chars, ErrorCode::InvalidBinOprtIdent),
            Target::Infix => (&self.settings.infix_chars, ErrorCode::InvalidInfixIdent),
            Target::Postfix => (&self.settings.oprt_chars, ErrorCode::InvalidPostfixIdent),
        };
        self.check_name(name, charset, bad_name)?;

        log::trace!("define callback {name:?}");
        let table = match target {
            Target::Fun => &mut self.symbols.funs,
            Target::Bin => &mut self.symbols.bin_oprts,
            Target::Infix => &mut self.symbols.infix_oprts,
            Target::Postfix => &mut self.symbols.postfix_oprts,
        };
        table.insert(name.to_owned(), def);
        self.invalidate();
        Ok(())
    }

    fn check_len(&self, name: &str) -> Result<(), ParserError> {
        if name.len() > crate::MAX_IDENT_LEN {
            return Err(ParserError::for_name(ErrorCode::IdentifierTooLong, name));
        }
        Ok(())
    }

    fn check_name(
        &self,
        name: &str,
        charset: &str,
        code: ErrorCode,
    ) -> Result<(), ParserError> {
        let leading_digit = name.chars().next().is_some_and(|c| c.is_ascii_digit());
        if name.is_empty() || leading_digit || name.chars().any(|c| !charset.contains(c)) {
            return Err(ParserError::for_name(code, name));
        }
        Ok(())
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Register a value identifier; later registrations are tried first.
    pub fn add_val_ident(&mut self, ident: ValIdentCallback) {
        self.val_idents.push(ident);
        self.invalidate();
    }

    /// Install the variable factory consulted for unknown identifiers.
    pub fn set_var_factory(&mut self, factory: VarFactory) {
        self.var_factory = Some(factory);
        self.invalidate();
    }

    /// Remove the variable factory.
    pub fn clear_var_factory(&mut self) {
        self.var_factory = None;
        self.invalidate();
    }

    /// Set the decimal separator used by the literal readers.
    pub fn set_decimal_sep(&mut self, sep: char) {
        self.settings.locale.decimal_sep = sep;
        self.invalidate();
    }

    /// Set or disable the thousands separator used by the literal readers.
    pub fn set_thousands_sep(&mut self, sep: Option<char>) {
        self.settings.locale.thousands_sep = sep;
        self.invalidate();
    }

    /// Set the function argument separator.
    pub fn set_arg_sep(&mut self, sep: char) {
        self.settings.locale.arg_sep = sep;
        self.invalidate();
    }

    /// Restore the default `.`/`,` locale without a thousands separator.
    pub fn reset_locale(&mut self) {
        self.settings.locale = NumLocale::default();
        self.invalidate();
    }

    /// The current locale configuration.
    #[must_use]
    pub const fn locale(&self) -> NumLocale {
        self.settings.locale
    }

    /// Set the characters allowed in function, variable and constant
    /// names.
    pub fn set_name_chars(&mut self, chars: &str) {
        self.settings.name_chars = chars.to_owned();
        self.invalidate();
    }

    /// Set the characters allowed in binary and postfix operator names.
    pub fn set_oprt_chars(&mut self, chars: &str) {
        self.settings.oprt_chars = chars.to_owned();
        self.invalidate();
    }

    /// Set the characters allowed in infix operator names.
    pub fn set_infix_chars(&mut self, chars: &str) {
        self.settings.infix_chars = chars.to_owned();
        self.invalidate();
    }

    /// Enable or disable the peephole optimizer.
    pub fn enable_optimizer(&mut self, enable: bool) {
        self.optimize = enable;
        self.invalidate();
    }

    /// Enable or disable the built-in arithmetic, comparison and logical
    /// operators. Parentheses, the argument separator, assignment and the
    /// conditional operator stay active.
    pub fn enable_builtin_oprt(&mut self, enable: bool) {
        self.settings.builtin_ops = enable;
        self.invalidate();
    }

    /// Are the built-in operators enabled?
    #[must_use]
    pub const fn has_builtin_oprt(&self) -> bool {
        self.settings.builtin_ops
    }

    // =========================================================================
    // Expression handling
    // =========================================================================

    /// Set the expression text; compilation happens lazily on the first
    /// evaluation.
    ///
    /// # Errors
    ///
    /// Fails when the text exceeds [`MAX_EXPR_LEN`](crate::MAX_EXPR_LEN)
    /// or the decimal and argument separators collide.
    pub fn set_expr(&mut self, expr: &str) -> Result<(), ParserError> {
        if self.settings.locale.arg_sep == self.settings.locale.decimal_sep {
            return Err(ParserError::new(ErrorCode::Locale));
        }
        if expr.len() >= crate::MAX_EXPR_LEN {
            return Err(ParserError::at(ErrorCode::ExpressionTooLong, 0));
        }
        self.expr.clear();
        self.expr.push_str(expr);
        self.invalidate();
        Ok(())
    }

    /// The current expression text, exactly as set.
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// The compiled instruction stream, when a program exists.
    #[must_use]
    pub fn bytecode(&self) -> Option<&[Instr]> {
        self.program.as_ref().map(|p| p.rpn.as_slice())
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Evaluate the expression against the caller's variable slab.
    ///
    /// # Errors
    ///
    /// Compilation errors on the first call after a change; evaluation
    /// errors from user callbacks; [`ErrorCode::InvalidVarPtr`] when the
    /// slab is too small for the referenced slots.
    pub fn eval(&mut self, vars: &mut [Value]) -> Result<Value, ParserError> {
        self.ensure_compiled()?;
        let Some(prog) = self.program.as_ref() else {
            return Err(ParserError::internal("program missing after compilation"));
        };
        Self::validate_slab(prog, vars.len(), 1).map_err(|mut e| {
            e.set_expr(&self.expr);
            e
        })?;

        let slab = VarSlab::new(vars);
        let result = if prog.is_short() {
            execution::run_short(prog, &slab, 0)
        } else {
            execution::run(prog, &slab, 0, 0, &mut self.stack_buf[..prog.stack_required])
        };
        result.map_err(|mut e| {
            e.set_expr(&self.expr);
            e
        })
    }

    /// Evaluate and return every top-level comma-separated result, in
    /// source order.
    ///
    /// # Errors
    ///
    /// As [`Parser::eval`].
    pub fn eval_multi(&mut self, vars: &mut [Value]) -> Result<Vec<Value>, ParserError> {
        self.ensure_compiled()?;
        let Some(prog) = self.program.as_ref() else {
            return Err(ParserError::internal("program missing after compilation"));
        };
        Self::validate_slab(prog, vars.len(), 1).map_err(|mut e| {
            e.set_expr(&self.expr);
            e
        })?;

        let slab = VarSlab::new(vars);
        if prog.is_short() {
            let v = execution::run_short(prog, &slab, 0).map_err(|mut e| {
                e.set_expr(&self.expr);
                e
            })?;
            return Ok(vec![v]);
        }
        let stack = &mut self.stack_buf[..prog.stack_required];
        execution::run(prog, &slab, 0, 0, stack).map_err(|mut e| {
            e.set_expr(&self.expr);
            e
        })?;
        Ok(stack[..prog.num_results].to_vec())
    }

    /// Number of top-level comma-separated results of the current
    /// expression.
    ///
    /// # Errors
    ///
    /// Compilation errors on the first call after a change.
    pub fn num_results(&mut self) -> Result<usize, ParserError> {
        self.ensure_compiled()?;
        Ok(self.program.as_ref().map_or(1, |p| p.num_results))
    }

    /// Evaluate element-wise over `results.len()` offsets: element `i`
    /// reads every variable slot `s` at `vars[s + i]`.
    ///
    /// # Errors
    ///
    /// As [`Parser::eval`]; the slab must cover the highest slot plus the
    /// last offset.
    pub fn eval_bulk(
        &mut self,
        vars: &mut [Value],
        results: &mut [Value],
    ) -> Result<(), ParserError> {
        self.ensure_compiled()?;
        let Some(prog) = self.program.as_ref() else {
            return Err(ParserError::internal("program missing after compilation"));
        };
        Self::validate_slab(prog, vars.len(), results.len()).map_err(|mut e| {
            e.set_expr(&self.expr);
            e
        })?;

        let slab = VarSlab::new(vars);
        let stack = &mut self.stack_buf[..prog.stack_required];
        for (i, out) in results.iter_mut().enumerate() {
            *out = execution::run(prog, &slab, i, 0, stack).map_err(|mut e| {
                e.set_expr(&self.expr);
                e
            })?;
        }
        Ok(())
    }

    /// Numerical differentiation with respect to the variable at `slot`,
    /// using a five-point stencil of fourth order.
    ///
    /// Pass `eps = 0.0` to pick a step width from the magnitude of `at`.
    ///
    /// # Errors
    ///
    /// As [`Parser::eval`].
    #[allow(
        clippy::float_cmp,
        reason = "0.0 is the documented sentinel for the automatic step width"
    )]
    pub fn diff(
        &mut self,
        vars: &mut [Value],
        slot: usize,
        at: Value,
        eps: Value,
    ) -> Result<Value, ParserError> {
        if slot >= vars.len() {
            return Err(ParserError::for_name(ErrorCode::InvalidVarPtr, "slot"));
        }
        let eps = if eps == 0.0 {
            if at == 0.0 { 1e-10 } else { 1e-7 * at }
        } else {
            eps
        };

        let saved = vars[slot];
        let mut f = [0.0; 4];
        let mut failure = None;
        for (fi, step) in f.iter_mut().zip([2.0f64, 1.0, -1.0, -2.0]) {
            vars[slot] = step.mul_add(eps, at);
            match self.eval(vars) {
                Ok(v) => *fi = v,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        vars[slot] = saved;
        if let Some(e) = failure {
            return Err(e);
        }

        Ok((8.0 * f[1] - f[0] - 8.0 * f[2] + f[3]) / (12.0 * eps))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Variables referenced by the current expression, sorted by name;
    /// the slot is `None` for identifiers that are not bound (only
    /// reachable without a variable factory).
    ///
    /// Factory-created bindings are installed as a side effect, exactly
    /// as a regular compilation would.
    ///
    /// # Errors
    ///
    /// Any compilation error other than an unknown identifier.
    pub fn used_vars(&mut self) -> Result<Vec<(String, Option<usize>)>, ParserError> {
        self.compile_program(true).map_err(|mut e| {
            e.set_expr(&self.expr);
            e
        })?;
        let mut used: Vec<_> = self
            .last_used
            .iter()
            .map(|(name, slot)| (name.clone(), *slot))
            .collect();
        used.sort();
        Ok(used)
    }

    /// Defined variables as `(name, slot)` pairs.
    pub fn vars(&self) -> impl Iterator<Item = (&str, usize)> {
        self.symbols.vars.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Defined constants as `(name, value)` pairs.
    pub fn consts(&self) -> impl Iterator<Item = (&str, Value)> {
        self.symbols.consts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Names of all defined functions (numeric, bulk and string).
    pub fn funs(&self) -> impl Iterator<Item = &str> {
        self.symbols.funs.keys().map(String::as_str)
    }

    // =========================================================================
    // Compilation plumbing
    // =========================================================================

    fn invalidate(&mut self) {
        self.program = None;
    }

    pub(crate) fn ensure_compiled(&mut self) -> Result<(), ParserError> {
        if self.program.is_some() {
            return Ok(());
        }
        let program = self.compile_program(false).map_err(|mut e| {
            e.set_expr(&self.expr);
            e
        })?;
        self.stack_buf = vec![0.0; program.stack_required];
        self.program = Some(program);
        Ok(())
    }

    pub(crate) fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }

    /// The slab must cover the highest referenced slot for every offset
    /// of the evaluation.
    pub(crate) fn validate_slab(
        prog: &Program,
        slab_len: usize,
        n_offsets: usize,
    ) -> Result<(), ParserError> {
        let Some(max_slot) = prog.max_slot else {
            return Ok(());
        };
        let last = max_slot.checked_add(n_offsets.saturating_sub(1));
        match last {
            Some(last) if last < slab_len => Ok(()),
            _ => Err(ParserError::for_name(
                ErrorCode::InvalidVarPtr,
                "variable slab too small",
            )),
        }
    }

    fn compile_program(&mut self, ignore_undefined: bool) -> Result<Program, ParserError> {
        if self.settings.locale.arg_sep == self.settings.locale.decimal_sep {
            return Err(ParserError::new(ErrorCode::Locale));
        }
        if self.settings.name_chars.is_empty()
            || self.settings.oprt_chars.is_empty()
            || self.settings.infix_chars.is_empty()
        {
            return Err(ParserError::new(ErrorCode::InvalidCharacters));
        }
        if self.expr.trim().is_empty() {
            return Err(ParserError::new(ErrorCode::EmptyExpression));
        }

        let mut reader = TokenReader::new(
            &self.expr,
            &self.symbols,
            &self.settings,
            &self.val_idents,
            self.var_factory.as_mut(),
            ignore_undefined,
        );
        let result = compiler::compile(&mut reader, self.optimize);
        let (new_vars, used) = reader.into_results();

        // Factory-created bindings survive even a failed compilation.
        self.symbols.vars.extend(new_vars);
        self.last_used = used;
        result
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("expr", &self.expr)
            .field("vars", &self.symbols.vars.len())
            .field("consts", &self.symbols.consts.len())
            .field("funs", &self.symbols.funs.len())
            .field("compiled", &self.program.is_some())
            .finish()
    }
}
