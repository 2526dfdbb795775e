//! The shunting-yard compiler.
//!
//! Consumes the token stream and drives bytecode emission. Three stacks
//! carry the compilation state:
//!
//! - an *operator stack* of pending operators, function headers, open
//!   parens and conditional markers;
//! - a *value stack* of operand placeholders, used only for type checking
//!   (number / variable / string) and assignment-target validation;
//! - an *argument-count stack*, pushed on `(` and on `?`, incremented on
//!   the argument separator, popped on `)` and on `:`. The bottom entry
//!   counts the top-level comma-separated results.
//!
//! Reduction emits bytecode through [`Bytecode`], which applies the
//! peephole rewrites on the fly.

use super::Program;
use super::bytecode::Bytecode;
use super::instruction::Instr;
use crate::error::{ErrorCode, ParserError};
use crate::reader::TokenReader;
use crate::token::{Assoc, FunKind, Token};

/// Operand placeholder on the compiler's value stack.
enum StackItem {
    Val,
    Var { slot: usize },
    Str { idx: usize },
}

impl StackItem {
    fn is_str(&self) -> bool {
        matches!(self, Self::Str { .. })
    }
}

struct Frame {
    opt: Vec<Token>,
    val: Vec<StackItem>,
    rpn: Bytecode,
    strings: Vec<String>,
}

/// Compile the reader's expression into a [`Program`].
pub(crate) fn compile(
    reader: &mut TokenReader<'_>,
    optimize: bool,
) -> Result<Program, ParserError> {
    let mut f = Frame {
        opt: Vec::new(),
        val: Vec::new(),
        rpn: Bytecode::new(optimize),
        strings: Vec::new(),
    };
    let mut arg_count: Vec<usize> = vec![1];
    let mut if_else_counter = 0i32;
    let mut prev_was_open = false;

    loop {
        let tok = reader.next()?;
        let pos = reader.pos();

        match &tok {
            Token::Str(s) => {
                // A string is only meaningful beneath a pending function.
                if f.opt.is_empty() {
                    return Err(ParserError::with_token(
                        ErrorCode::StrResult,
                        pos,
                        format!("\"{s}\""),
                    ));
                }
                let idx = f.strings.len();
                f.strings.push(s.clone());
                f.val.push(StackItem::Str { idx });
            }

            Token::Var { slot, .. } => {
                f.val.push(StackItem::Var { slot: *slot });
                f.rpn.add_var(*slot);
            }

            Token::Val(v) => {
                f.val.push(StackItem::Val);
                f.rpn.add_val(*v);
            }

            Token::Else => {
                match arg_count.last() {
                    None => return Err(ParserError::at(ErrorCode::MisplacedColon, pos)),
                    Some(n) if *n > 1 => {
                        return Err(ParserError::at(ErrorCode::UnexpectedArgSep, pos));
                    }
                    Some(_) => {}
                }
                arg_count.pop();

                if_else_counter -= 1;
                if if_else_counter < 0 {
                    return Err(ParserError::at(ErrorCode::MisplacedColon, pos));
                }

                apply_remaining(&mut f, pos)?;
                f.rpn.add_else();
                f.opt.push(tok.clone());
            }

            Token::ArgSep => {
                // A separator directly under a pending `?` would smuggle
                // extra values into one conditional branch.
                if matches!(f.opt.last(), Some(Token::If)) {
                    return Err(ParserError::at(ErrorCode::UnexpectedArgSep, pos));
                }
                match arg_count.last_mut() {
                    None => return Err(ParserError::at(ErrorCode::UnexpectedArgSep, pos)),
                    Some(n) => *n += 1,
                }
                apply_remaining(&mut f, pos)?;
            }

            Token::End => {
                apply_remaining(&mut f, pos)?;
            }

            Token::Close => {
                // An open paren as the previous token marks a zero-argument
                // call: take back the count the paren seeded.
                if prev_was_open {
                    match arg_count.last_mut() {
                        None => return Err(ParserError::internal("argument counter underflow")),
                        Some(n) => *n -= 1,
                    }
                }

                apply_remaining(&mut f, pos)?;

                if matches!(f.opt.last(), Some(Token::Open)) {
                    let n_args = arg_count
                        .pop()
                        .ok_or_else(|| ParserError::internal("argument counter underflow"))?;
                    f.opt.pop();

                    let head_is_fun = matches!(f.opt.last(), Some(Token::Fun { .. }));
                    if n_args > 1 && !head_is_fun {
                        return Err(ParserError::at(ErrorCode::UnexpectedArg, pos));
                    }
                    if head_is_fun {
                        apply_func(&mut f, n_args, pos)?;
                    }
                }
            }

            Token::If | Token::Assign | Token::Bin(_) | Token::OprtBin { .. } => {
                if matches!(tok, Token::If) {
                    if_else_counter += 1;
                    arg_count.push(1);
                }

                // Reduce while the stacked operator binds at least as
                // tightly; associativity only matters between equals.
                loop {
                    let (p1, same, is_infix) = match f.opt.last() {
                        None | Some(Token::Open | Token::Else | Token::If) => break,
                        Some(top) => (
                            top.precedence(),
                            top.same_code(&tok),
                            matches!(top, Token::OprtInfix { .. }),
                        ),
                    };
                    let p2 = tok.precedence();
                    if same {
                        let assoc = tok.associativity();
                        if (assoc == Assoc::Right && p1 <= p2) || (assoc == Assoc::Left && p1 < p2)
                        {
                            break;
                        }
                    } else if p1 < p2 {
                        break;
                    }

                    if is_infix {
                        apply_func(&mut f, 1, pos)?;
                    } else {
                        apply_bin_oprt(&mut f, pos)?;
                    }
                }

                if matches!(tok, Token::If) {
                    f.rpn.add_if();
                }
                f.opt.push(tok.clone());
            }

            Token::Open => {
                arg_count.push(1);
                f.opt.push(tok.clone());
            }

            Token::OprtInfix { .. } | Token::Fun { .. } => f.opt.push(tok.clone()),

            Token::OprtPostfix { .. } => {
                f.opt.push(tok.clone());
                apply_func(&mut f, 1, pos)?;
            }
        }

        prev_was_open = matches!(tok, Token::Open);

        if matches!(tok, Token::End) {
            f.rpn.finalize()?;
            break;
        }
    }

    if if_else_counter > 0 {
        return Err(ParserError::new(ErrorCode::MissingElseClause));
    }

    if arg_count.len() != 1 {
        return Err(ParserError::internal("argument counter imbalance"));
    }
    let num_results = arg_count[0];
    if num_results == 0 {
        return Err(ParserError::internal("no final result"));
    }

    if f.val.is_empty() {
        return Err(ParserError::new(ErrorCode::EmptyExpression));
    }
    // The value stack is dead now; every leftover must be numeric.
    while let Some(item) = f.val.pop() {
        if item.is_str() {
            return Err(ParserError::new(ErrorCode::StrResult));
        }
    }

    let stack_required = f.rpn.stack_required();
    let rpn = f.rpn.into_instructions();
    let max_slot = rpn.iter().filter_map(Instr::slot).max();

    log::debug!(
        "compiled {} instructions, stack {}, {} result(s)",
        rpn.len(),
        stack_required,
        num_results
    );

    Ok(Program {
        rpn,
        stack_required,
        num_results,
        strings: f.strings,
        max_slot,
    })
}

/// Apply the function header on top of the operator stack with
/// `collected` arguments, emitting the matching call instruction.
///
/// Binary user operators ignore `collected` and always take two; infix
/// and postfix operators are applied with one.
fn apply_func(f: &mut Frame, collected: usize, pos: usize) -> Result<(), ParserError> {
    if !f.opt.last().is_some_and(Token::has_callback) {
        return Ok(());
    }
    let Some(fun_tok) = f.opt.pop() else {
        return Ok(());
    };

    let (name, def, is_bin) = match &fun_tok {
        Token::OprtBin { name, def } => (name.as_str(), def, true),
        Token::OprtInfix { name, def }
        | Token::OprtPostfix { name, def }
        | Token::Fun { name, def } => (name.as_str(), def, false),
        _ => return Err(ParserError::internal("callback token expected")),
    };

    // Binary operators carry no separator, so their count is intrinsic.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        reason = "argument counts are bounded by expression length"
    )]
    let arg_count = if is_bin { 2 } else { collected as i32 };

    let is_str = def.is_str();
    // `argc` counts numeric arguments only; the leading string is extra.
    let arg_required = def.argc + i32::from(is_str);
    let arg_numerical = arg_count - i32::from(is_str);

    if def.argc >= 0 && arg_count > arg_required {
        return Err(ParserError::with_token(
            ErrorCode::TooManyParams,
            pos.saturating_sub(1),
            name,
        ));
    }
    if !is_bin && arg_count < arg_required {
        return Err(ParserError::with_token(
            ErrorCode::TooFewParams,
            pos.saturating_sub(1),
            name,
        ));
    }

    // Pop the numeric arguments; strings may not hide among them.
    let mut str_in_numeric_position = false;
    for _ in 0..arg_numerical {
        let Some(item) = f.val.pop() else {
            return Err(ParserError::internal("value stack underflow"));
        };
        if item.is_str() {
            if is_str {
                str_in_numeric_position = true;
            } else {
                return Err(ParserError::with_token(ErrorCode::ValExpected, pos, name));
            }
        }
    }

    match &def.kind {
        FunKind::Str(cb) => {
            let Some(item) = f.val.pop() else {
                return Err(ParserError::internal("value stack underflow"));
            };
            let StackItem::Str { idx } = item else {
                return Err(ParserError::with_token(ErrorCode::StringExpected, pos, name));
            };
            if str_in_numeric_position {
                return Err(ParserError::with_token(ErrorCode::ValExpected, pos, name));
            }
            #[allow(
                clippy::cast_sign_loss,
                reason = "arg_numerical is non-negative for fixed-arity string functions"
            )]
            f.rpn.add_str_fun(cb, arg_numerical as usize, idx);
        }

        FunKind::Bulk(cb) => {
            #[allow(
                clippy::cast_sign_loss,
                reason = "bulk functions have fixed non-negative arity"
            )]
            f.rpn.add_bulk_fun(cb, arg_numerical as usize);
        }

        FunKind::Num(cb) => {
            if def.argc == -1 && arg_count == 0 {
                return Err(ParserError::with_token(ErrorCode::TooFewParams, pos, name));
            }
            let emitted = if def.argc == -1 {
                -arg_numerical
            } else {
                arg_numerical
            };
            f.rpn.add_fun(cb, emitted, def.optimizable)?;
        }
    }

    // Placeholder for the call result.
    f.val.push(StackItem::Val);
    Ok(())
}

/// Reduce the binary operator (built-in or user-defined) on top of the
/// operator stack.
fn apply_bin_oprt(f: &mut Frame, pos: usize) -> Result<(), ParserError> {
    if matches!(f.opt.last(), Some(Token::OprtBin { .. })) {
        return apply_func(f, 2, pos);
    }

    if f.val.len() < 2 {
        return Err(ParserError::internal("not enough values for binary operator"));
    }
    let Some(rhs) = f.val.pop() else {
        return Err(ParserError::internal("value stack underflow"));
    };
    let Some(lhs) = f.val.pop() else {
        return Err(ParserError::internal("value stack underflow"));
    };
    let Some(op_tok) = f.opt.pop() else {
        return Err(ParserError::internal("operator stack underflow"));
    };

    if rhs.is_str() || lhs.is_str() {
        return Err(ParserError::with_token(
            ErrorCode::OprtTypeConflict,
            pos,
            op_tok.text(),
        ));
    }

    match op_tok {
        Token::Assign => {
            let StackItem::Var { slot } = lhs else {
                return Err(ParserError::for_name(ErrorCode::UnexpectedOperator, "="));
            };
            f.rpn.add_assign(slot);
        }
        Token::Bin(op) => f.rpn.add_op(op),
        _ => return Err(ParserError::internal("binary operator token expected")),
    }

    f.val.push(StackItem::Val);
    Ok(())
}

/// Close every conditional whose `:` branch is complete, emitting the
/// matching `EndIf` markers.
fn apply_if_else(f: &mut Frame, pos: usize) -> Result<(), ParserError> {
    while matches!(f.opt.last(), Some(Token::Else)) {
        f.opt.pop();

        // Both branch values and the condition collapse into one result.
        for _ in 0..2 {
            let Some(branch) = f.val.pop() else {
                return Err(ParserError::internal("value stack underflow"));
            };
            if branch.is_str() {
                return Err(ParserError::at(ErrorCode::UnexpectedStr, pos));
            }
        }
        if f.val.pop().is_none() {
            return Err(ParserError::internal("value stack underflow"));
        }
        f.val.push(StackItem::Val);

        match f.opt.pop() {
            Some(Token::If) => {}
            _ => return Err(ParserError::at(ErrorCode::MisplacedColon, pos)),
        }
        f.rpn.add_endif();
    }
    Ok(())
}

/// Reduce everything down to the innermost open paren or pending `?`.
fn apply_remaining(f: &mut Frame, pos: usize) -> Result<(), ParserError> {
    loop {
        enum Step {
            Infix,
            Binary,
            IfElse,
        }
        let step = match f.opt.last() {
            None | Some(Token::Open | Token::If) => break,
            Some(Token::OprtInfix { .. }) => Step::Infix,
            Some(Token::Bin(_) | Token::OprtBin { .. } | Token::Assign) => Step::Binary,
            Some(Token::Else) => Step::IfElse,
            Some(_) => return Err(ParserError::internal("unexpected token on operator stack")),
        };
        match step {
            Step::Infix => apply_func(f, 1, pos)?,
            Step::Binary => apply_bin_oprt(f, pos)?,
            Step::IfElse => apply_if_else(f, pos)?,
        }
    }
    Ok(())
}
