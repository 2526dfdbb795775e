//! The token reader.
//!
//! Produces exactly one token per call, consulting the symbol tables and
//! the registered value identifiers. The reader is state-aware: after a
//! value or closing paren it expects an operator, postfix operator or the
//! end of input; everywhere else it expects a value, prefix operator,
//! function or opening paren. Recognition order at each position:
//! whitespace, string literal, operator names (longest match), identifier
//! names (longest match, leading digit forbidden), numeric literals via
//! the value identifiers (latest registration first).

use crate::error::{ErrorCode, ParserError};
use crate::parser::{Settings, SymbolTable, VarFactory};
use crate::token::{BinOp, Token};
use crate::valident::ValIdentCallback;
use rustc_hash::FxHashMap;

/// Slot placeholder for variables that are referenced but unbound; only
/// reachable in the used-variables query, whose program is discarded.
pub(crate) const UNBOUND_SLOT: usize = usize::MAX;

/// Two-character built-in operators, scanned before the one-character set.
const BUILTIN2: [(&str, BinOp); 6] = [
    ("<=", BinOp::Le),
    (">=", BinOp::Ge),
    ("!=", BinOp::Ne),
    ("==", BinOp::Eq),
    ("&&", BinOp::And),
    ("||", BinOp::Or),
];

const BUILTIN1: [(char, BinOp); 7] = [
    ('<', BinOp::Lt),
    ('>', BinOp::Gt),
    ('+', BinOp::Add),
    ('-', BinOp::Sub),
    ('*', BinOp::Mul),
    ('/', BinOp::Div),
    ('^', BinOp::Pow),
];

/// What the previous token was, which decides what may come next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Last {
    Start,
    /// Value, variable, string or constant.
    Val,
    Open,
    Close,
    ArgSep,
    /// Binary operator (built-in or user), `=`, `?` or `:`.
    Oprt,
    Infix,
    Postfix,
    /// Function name; only an opening paren may follow.
    Fun,
}

pub(crate) struct TokenReader<'p> {
    expr: &'p str,
    pos: usize,
    symbols: &'p SymbolTable,
    settings: &'p Settings,
    val_idents: &'p [ValIdentCallback],
    factory: Option<&'p mut VarFactory>,
    ignore_undefined: bool,
    /// Variables materialized by the factory during this compilation.
    new_vars: FxHashMap<String, usize>,
    /// Every variable referenced, with its slot when bound.
    used_vars: FxHashMap<String, Option<usize>>,
    paren_depth: usize,
    last: Last,
}

impl<'p> TokenReader<'p> {
    pub(crate) fn new(
        expr: &'p str,
        symbols: &'p SymbolTable,
        settings: &'p Settings,
        val_idents: &'p [ValIdentCallback],
        factory: Option<&'p mut VarFactory>,
        ignore_undefined: bool,
    ) -> Self {
        Self {
            expr,
            pos: 0,
            symbols,
            settings,
            val_idents,
            factory,
            ignore_undefined,
            new_vars: FxHashMap::default(),
            used_vars: FxHashMap::default(),
            paren_depth: 0,
            last: Last::Start,
        }
    }

    /// Current byte position, for diagnostics.
    pub(crate) const fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn into_results(
        self,
    ) -> (FxHashMap<String, usize>, FxHashMap<String, Option<usize>>) {
        (self.new_vars, self.used_vars)
    }

    fn rest(&self) -> &'p str {
        &self.expr[self.pos..]
    }

    fn expecting_operand(&self) -> bool {
        matches!(
            self.last,
            Last::Start | Last::Open | Last::ArgSep | Last::Oprt | Last::Infix | Last::Fun
        )
    }

    /// Produce the next token.
    pub(crate) fn next(&mut self) -> Result<Token, ParserError> {
        self.skip_whitespace()?;

        let Some(c) = self.rest().chars().next() else {
            return self.end_token();
        };

        // A function name must be followed by its argument list.
        if self.last == Last::Fun && c != '(' {
            return Err(ParserError::at(ErrorCode::MissingParens, self.pos));
        }

        if c == '"' {
            return self.read_string();
        }

        if self.expecting_operand() {
            self.read_operand_token(c)
        } else {
            self.read_operator_token(c)
        }
    }

    fn skip_whitespace(&mut self) -> Result<(), ParserError> {
        while let Some(c) = self.rest().chars().next() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else if (c as u32) < 0x20 {
                return Err(ParserError::with_token(
                    ErrorCode::InvalidCharacters,
                    self.pos,
                    c.escape_default().to_string(),
                ));
            } else {
                break;
            }
        }
        Ok(())
    }

    fn end_token(&mut self) -> Result<Token, ParserError> {
        if self.last == Last::Fun || self.paren_depth > 0 {
            return Err(ParserError::new(ErrorCode::MissingParens));
        }
        if self.expecting_operand() && self.last != Last::Start {
            return Err(ParserError::at(ErrorCode::UnexpectedEof, self.pos));
        }
        Ok(Token::End)
    }

    fn read_string(&mut self) -> Result<Token, ParserError> {
        let start = self.pos;
        if !self.expecting_operand() {
            return Err(ParserError::at(ErrorCode::UnexpectedStr, start));
        }
        let body = &self.rest()[1..];
        let Some(len) = body.find('"') else {
            return Err(ParserError::at(ErrorCode::UnterminatedString, start));
        };
        let content = body[..len].to_owned();
        self.pos += len + 2;
        self.last = Last::Val;
        Ok(Token::Str(content))
    }

    /// Longest name in `table` that prefixes the remaining input.
    fn match_name<'t, T>(&self, table: &'t FxHashMap<String, T>) -> Option<(&'t str, &'t T)> {
        let rest = self.rest();
        let mut best: Option<(&str, &T)> = None;
        for (name, def) in table {
            if rest.starts_with(name.as_str())
                && best.is_none_or(|(b, _)| name.len() > b.len())
            {
                best = Some((name, def));
            }
        }
        best
    }

    fn match_builtin(&self) -> Option<(usize, BinOp)> {
        if !self.settings.builtin_ops {
            return None;
        }
        let rest = self.rest();
        for (sym, op) in BUILTIN2 {
            if rest.starts_with(sym) {
                return Some((2, op));
            }
        }
        for (sym, op) in BUILTIN1 {
            if rest.starts_with(sym) {
                return Some((1, op));
            }
        }
        None
    }

    /// Longest run of name characters, rejecting a leading digit.
    fn scan_ident(&self) -> Option<&'p str> {
        let rest = self.rest();
        let first = rest.chars().next()?;
        if first.is_ascii_digit() || !self.settings.name_chars.contains(first) {
            return None;
        }
        let len = rest
            .char_indices()
            .find(|(_, c)| !self.settings.name_chars.contains(*c))
            .map_or(rest.len(), |(i, _)| i);
        Some(&rest[..len])
    }

    fn advance(&mut self, bytes: usize, last: Last) {
        self.pos += bytes;
        self.last = last;
    }

    fn read_operator_token(&mut self, c: char) -> Result<Token, ParserError> {
        let pos = self.pos;

        // User binary operators win over built-ins on longer matches; a
        // shadowing conflict at equal length is rejected at definition
        // time while built-ins are enabled.
        let user = self.match_name(&self.symbols.bin_oprts);
        let builtin = self.match_builtin();
        let user_len = user.map_or(0, |(n, _)| n.len());
        if let Some((name, def)) = user
            && user_len >= builtin.map_or(0, |(len, _)| len)
        {
            let tok = Token::OprtBin {
                name: name.to_owned(),
                def: def.clone(),
            };
            self.advance(user_len, Last::Oprt);
            return Ok(tok);
        }
        if let Some((len, op)) = builtin {
            self.advance(len, Last::Oprt);
            return Ok(Token::Bin(op));
        }

        match c {
            '(' => return Err(ParserError::with_token(ErrorCode::UnexpectedParens, pos, "(")),
            ')' => {
                if self.paren_depth == 0 {
                    return Err(ParserError::with_token(ErrorCode::UnexpectedParens, pos, ")"));
                }
                self.paren_depth -= 1;
                self.advance(1, Last::Close);
                return Ok(Token::Close);
            }
            '?' => {
                self.advance(1, Last::Oprt);
                return Ok(Token::If);
            }
            ':' => {
                self.advance(1, Last::Oprt);
                return Ok(Token::Else);
            }
            '=' => {
                self.advance(1, Last::Oprt);
                return Ok(Token::Assign);
            }
            c if c == self.settings.locale.arg_sep => {
                self.advance(c.len_utf8(), Last::ArgSep);
                return Ok(Token::ArgSep);
            }
            _ => {}
        }

        if let Some((name, def)) = self.match_name(&self.symbols.postfix_oprts) {
            let tok = Token::OprtPostfix {
                name: name.to_owned(),
                def: def.clone(),
            };
            self.advance(name.len(), Last::Postfix);
            return Ok(tok);
        }

        // Nothing fits an operator position; classify what is actually
        // here for the diagnostic.
        if let Some(name) = self.scan_ident() {
            let code = if self.symbols.funs.contains_key(name) {
                ErrorCode::UnexpectedFun
            } else if self.symbols.vars.contains_key(name) || self.new_vars.contains_key(name) {
                ErrorCode::UnexpectedVar
            } else if self.symbols.consts.contains_key(name) {
                ErrorCode::UnexpectedVal
            } else {
                ErrorCode::UnassignableToken
            };
            return Err(ParserError::with_token(code, pos, name));
        }
        for ident in self.val_idents.iter().rev() {
            if let Some((_, val)) = ident(self.rest(), &self.settings.locale) {
                return Err(ParserError::with_token(
                    ErrorCode::UnexpectedVal,
                    pos,
                    val.to_string(),
                ));
            }
        }
        Err(self.unassignable(pos))
    }

    fn read_operand_token(&mut self, c: char) -> Result<Token, ParserError> {
        let pos = self.pos;

        match c {
            '(' => {
                self.paren_depth += 1;
                self.advance(1, Last::Open);
                return Ok(Token::Open);
            }
            ')' => {
                // Only a zero-argument call may close right after opening.
                if self.last == Last::Open && self.paren_depth > 0 {
                    self.paren_depth -= 1;
                    self.advance(1, Last::Close);
                    return Ok(Token::Close);
                }
                return Err(ParserError::with_token(ErrorCode::UnexpectedParens, pos, ")"));
            }
            c if c == self.settings.locale.arg_sep => {
                return Err(ParserError::at(ErrorCode::UnexpectedArgSep, pos));
            }
            _ => {}
        }

        // Prefix operators come before the built-in scan so that `-` can
        // negate where a value is expected.
        if let Some((name, def)) = self.match_name(&self.symbols.infix_oprts) {
            let tok = Token::OprtInfix {
                name: name.to_owned(),
                def: def.clone(),
            };
            self.advance(name.len(), Last::Infix);
            return Ok(tok);
        }

        if let Some((_, op)) = self.match_builtin() {
            return Err(ParserError::with_token(
                ErrorCode::UnexpectedOperator,
                pos,
                op.symbol(),
            ));
        }
        match c {
            '?' => return Err(ParserError::with_token(ErrorCode::UnexpectedConditional, pos, "?")),
            ':' => return Err(ParserError::at(ErrorCode::MisplacedColon, pos)),
            '=' => return Err(ParserError::with_token(ErrorCode::UnexpectedOperator, pos, "=")),
            _ => {}
        }

        if let Some(name) = self.scan_ident() {
            return self.resolve_ident(name, pos);
        }

        // Numeric literal: later registrations take priority.
        for ident in self.val_idents.iter().rev() {
            if let Some((consumed, val)) = ident(self.rest(), &self.settings.locale) {
                self.advance(consumed, Last::Val);
                return Ok(Token::Val(val));
            }
        }

        Err(self.unassignable(pos))
    }

    fn resolve_ident(&mut self, name: &str, pos: usize) -> Result<Token, ParserError> {
        let len = name.len();

        if let Some(def) = self.symbols.funs.get(name) {
            let tok = Token::Fun {
                name: name.to_owned(),
                def: def.clone(),
            };
            self.advance(len, Last::Fun);
            return Ok(tok);
        }

        if let Some(&slot) = self
            .symbols
            .vars
            .get(name)
            .or_else(|| self.new_vars.get(name))
        {
            self.used_vars.insert(name.to_owned(), Some(slot));
            let tok = Token::Var {
                name: name.to_owned(),
                slot,
            };
            self.advance(len, Last::Val);
            return Ok(tok);
        }

        if let Some(&val) = self.symbols.consts.get(name) {
            self.advance(len, Last::Val);
            return Ok(Token::Val(val));
        }

        if let Some(&idx) = self.symbols.str_consts.get(name) {
            let s = self.symbols.str_var_buf[idx].clone();
            self.advance(len, Last::Val);
            return Ok(Token::Str(s));
        }

        // Unknown identifier: give the variable factory a chance to
        // materialize a binding.
        if let Some(factory) = self.factory.as_mut()
            && let Some(slot) = factory(name)
        {
            let name = name.to_owned();
            self.new_vars.insert(name.clone(), slot);
            self.used_vars.insert(name.clone(), Some(slot));
            self.advance(len, Last::Val);
            return Ok(Token::Var { name, slot });
        }

        if self.ignore_undefined {
            let name = name.to_owned();
            self.used_vars.insert(name.clone(), None);
            self.advance(len, Last::Val);
            return Ok(Token::Var {
                name,
                slot: UNBOUND_SLOT,
            });
        }

        Err(ParserError::with_token(
            ErrorCode::UnassignableToken,
            pos,
            name,
        ))
    }

    fn unassignable(&self, pos: usize) -> ParserError {
        let word: String = self
            .rest()
            .chars()
            .take_while(|c| !c.is_whitespace() && !matches!(c, '(' | ')'))
            .take(16)
            .collect();
        ParserError::with_token(ErrorCode::UnassignableToken, pos, word)
    }
}
