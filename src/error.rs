use std::fmt;

/// Error classification for everything that can go wrong while defining
/// symbols, tokenizing, compiling or evaluating an expression.
///
/// Each code maps to a message template; `$TOK$` and `$POS$` placeholders
/// are substituted when the error is displayed. Keeping the catalogue
/// code-indexed lets embedders swap the English defaults for localized
/// tables without touching the error type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Token could not be matched against any symbol table entry.
    UnassignableToken,
    /// Function, variable or constant name contains invalid characters.
    InvalidName,
    /// Binary operator identifier contains invalid characters.
    InvalidBinOprtIdent,
    /// Infix operator identifier contains invalid characters.
    InvalidInfixIdent,
    /// Postfix operator identifier contains invalid characters.
    InvalidPostfixIdent,
    /// A callback was rejected at definition time.
    InvalidFunPtr,
    /// Variable storage is missing or out of bounds for this evaluation.
    InvalidVarPtr,
    /// The expression is empty.
    EmptyExpression,
    /// Operator in a position where an operand was expected.
    UnexpectedOperator,
    /// Input ended while an operand was still expected.
    UnexpectedEof,
    /// Argument separator outside of a function argument list.
    UnexpectedArgSep,
    /// Parenthesis in an illegal position.
    UnexpectedParens,
    /// Function name in a position where an operator was expected.
    UnexpectedFun,
    /// Literal value in an illegal position.
    UnexpectedVal,
    /// Variable in an illegal position.
    UnexpectedVar,
    /// Argument list used without a function.
    UnexpectedArg,
    /// String token in a position where it is not allowed.
    UnexpectedStr,
    /// The conditional operator appeared without a preceding value.
    UnexpectedConditional,
    /// Closing parenthesis is missing.
    MissingParens,
    /// Too many arguments passed to a function.
    TooManyParams,
    /// Too few arguments passed to a function.
    TooFewParams,
    /// Division by zero reported by a callback.
    DivByZero,
    /// Domain error reported by a callback.
    DomainError,
    /// Name already bound in a conflicting symbol table.
    NameConflict,
    /// Operator priority outside the legal range.
    OprtPriority,
    /// User operator shadows an enabled built-in operator.
    BuiltinOverload,
    /// String literal without a closing quote.
    UnterminatedString,
    /// String function called with a non-string leading argument.
    StringExpected,
    /// String used where a numeric argument is expected.
    ValExpected,
    /// Operand types do not fit the operator.
    OprtTypeConflict,
    /// A string escaped to the top level of the expression.
    StrResult,
    /// A `?` is missing its `:` branch.
    MissingElseClause,
    /// A `:` without a matching `?`.
    MisplacedColon,
    /// Identifier longer than [`MAX_IDENT_LEN`](crate::MAX_IDENT_LEN).
    IdentifierTooLong,
    /// Expression longer than [`MAX_EXPR_LEN`](crate::MAX_EXPR_LEN).
    ExpressionTooLong,
    /// Non-printable characters in the expression.
    InvalidCharacters,
    /// Decimal separator and argument separator collide.
    Locale,
    /// Invariant violation inside the parser itself.
    Internal,
}

impl ErrorCode {
    /// Message template for this code. `$TOK$` and `$POS$` are substituted
    /// with the offending token and its byte position on display.
    pub const fn template(self) -> &'static str {
        match self {
            Self::UnassignableToken => "unexpected token \"$TOK$\" found at position $POS$",
            Self::InvalidName => "invalid function, variable or constant name: \"$TOK$\"",
            Self::InvalidBinOprtIdent => "invalid binary operator identifier: \"$TOK$\"",
            Self::InvalidInfixIdent => "invalid infix operator identifier: \"$TOK$\"",
            Self::InvalidPostfixIdent => "invalid postfix operator identifier: \"$TOK$\"",
            Self::InvalidFunPtr => "invalid callback function",
            Self::InvalidVarPtr => "invalid variable storage for \"$TOK$\"",
            Self::EmptyExpression => "expression is empty",
            Self::UnexpectedOperator => "unexpected operator \"$TOK$\" found at position $POS$",
            Self::UnexpectedEof => "unexpected end of expression at position $POS$",
            Self::UnexpectedArgSep => "unexpected argument separator at position $POS$",
            Self::UnexpectedParens => "unexpected parenthesis \"$TOK$\" at position $POS$",
            Self::UnexpectedFun => "unexpected function \"$TOK$\" at position $POS$",
            Self::UnexpectedVal => "unexpected value \"$TOK$\" found at position $POS$",
            Self::UnexpectedVar => "unexpected variable \"$TOK$\" found at position $POS$",
            Self::UnexpectedArg => "function arguments used without a function (position $POS$)",
            Self::UnexpectedStr => "unexpected string token found at position $POS$",
            Self::UnexpectedConditional => {
                "the \"$TOK$\" operator must be preceded by a closing bracket"
            }
            Self::MissingParens => "missing parenthesis",
            Self::TooManyParams => {
                "too many parameters for function \"$TOK$\" at expression position $POS$"
            }
            Self::TooFewParams => {
                "too few parameters for function \"$TOK$\" at expression position $POS$"
            }
            Self::DivByZero => "divide by zero",
            Self::DomainError => "domain error",
            Self::NameConflict => "name conflict",
            Self::OprtPriority => {
                "invalid value for operator priority (must be greater or equal to zero)"
            }
            Self::BuiltinOverload => {
                "user defined binary operator \"$TOK$\" conflicts with a built in operator"
            }
            Self::UnterminatedString => "unterminated string starting at position $POS$",
            Self::StringExpected => "string function called with a non string type of argument",
            Self::ValExpected => "string value used where a numerical argument is expected",
            Self::OprtTypeConflict => {
                "no suitable overload for operator \"$TOK$\" at position $POS$"
            }
            Self::StrResult => "strings must only be used as function arguments",
            Self::MissingElseClause => "if-then-else operator is missing an else clause",
            Self::MisplacedColon => "misplaced colon at position $POS$",
            Self::IdentifierTooLong => "identifier too long",
            Self::ExpressionTooLong => "expression too long",
            Self::InvalidCharacters => "invalid non printable characters found in expression",
            Self::Locale => "decimal separator is identic to function argument separator",
            Self::Internal => "internal error",
        }
    }
}

/// The single failure channel of the crate.
///
/// Carries the error code, the byte position inside the expression (when
/// known), the offending token text and the full expression text. The
/// expression is attached by the parser façade once compilation or
/// evaluation fails, so errors shown to a user always have full context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserError {
    code: ErrorCode,
    pos: Option<usize>,
    token: String,
    expr: String,
}

impl ParserError {
    /// Create an error carrying only a code.
    #[must_use]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            pos: None,
            token: String::new(),
            expr: String::new(),
        }
    }

    /// Create an error at a byte position inside the expression.
    #[must_use]
    pub fn at(code: ErrorCode, pos: usize) -> Self {
        Self {
            code,
            pos: Some(pos),
            token: String::new(),
            expr: String::new(),
        }
    }

    /// Create an error at a position with the offending token text.
    #[must_use]
    pub fn with_token(code: ErrorCode, pos: usize, token: impl Into<String>) -> Self {
        Self {
            code,
            pos: Some(pos),
            token: token.into(),
            expr: String::new(),
        }
    }

    /// Create an error with token text but no position (definition-time
    /// failures happen before any expression exists).
    #[must_use]
    pub fn for_name(code: ErrorCode, token: impl Into<String>) -> Self {
        Self {
            code,
            pos: None,
            token: token.into(),
            expr: String::new(),
        }
    }

    /// Invariant violation inside the parser; the token text names the
    /// broken invariant.
    pub(crate) fn internal(what: &str) -> Self {
        Self::for_name(ErrorCode::Internal, what)
    }

    pub(crate) fn set_expr(&mut self, expr: &str) {
        if self.expr.is_empty() {
            self.expr = expr.to_owned();
        }
    }

    /// The error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Byte position inside the expression, if known.
    #[must_use]
    pub const fn pos(&self) -> Option<usize> {
        self.pos
    }

    /// The offending token text (may be empty).
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The expression the error refers to (empty for definition-time
    /// errors).
    #[must_use]
    pub fn expr(&self) -> &str {
        &self.expr
    }
}

impl fmt::Display for ParserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut msg = self.code.template().to_owned();
        if let Some(pos) = self.pos {
            msg = msg.replace("$POS$", &pos.to_string());
        } else {
            // Strip the whole position clause when no position is known.
            msg = msg
                .replace(" at position $POS$", "")
                .replace(" at expression position $POS$", "")
                .replace(" (position $POS$)", "")
                .replace(" starting at position $POS$", "");
        }
        msg = msg.replace("$TOK$", &self.token);
        write!(f, "{msg}")?;
        if self.code == ErrorCode::Internal && !self.token.is_empty() {
            write!(f, " ({})", self.token)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParserError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_substitution() {
        let err = ParserError::with_token(ErrorCode::UnassignableToken, 4, "@@");
        let msg = err.to_string();
        assert!(msg.contains("\"@@\""), "token not substituted: {msg}");
        assert!(msg.contains("position 4"), "position not substituted: {msg}");
    }

    #[test]
    fn test_message_without_position() {
        let err = ParserError::for_name(ErrorCode::UnexpectedOperator, "=");
        let msg = err.to_string();
        assert!(!msg.contains("$POS$"), "placeholder leaked: {msg}");
        assert!(msg.contains('='));
    }

    #[test]
    fn test_expr_attached_once() {
        let mut err = ParserError::new(ErrorCode::EmptyExpression);
        err.set_expr("a+b");
        err.set_expr("should not overwrite");
        assert_eq!(err.expr(), "a+b");
    }
}
