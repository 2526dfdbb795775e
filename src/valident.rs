//! Numeric literal recognition.
//!
//! Literal reading is pluggable: the token reader holds a chain of *value
//! identifier* callbacks, each of which inspects the remaining expression
//! text and either claims a prefix of it as a literal or passes. Callbacks
//! registered later are tried first, so a hex reader added on top of the
//! default decimal reader wins for `0x…` prefixes.
//!
//! Locale is a per-parser configuration value handed to every identifier;
//! there is no process-global locale state.

use crate::token::Value;
use std::sync::Arc;

/// Value identifier callback.
///
/// Inspects the start of `rest` and returns `Some((consumed_bytes, value))`
/// on a successful match, `None` to let the next identifier try.
pub type ValIdentCallback = Arc<dyn Fn(&str, &NumLocale) -> Option<(usize, Value)> + Send + Sync>;

/// Per-parser numeric locale configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumLocale {
    /// Decimal separator, `'.'` by default.
    pub decimal_sep: char,
    /// Optional digit grouping separator, disabled by default.
    pub thousands_sep: Option<char>,
    /// Function argument separator, `','` by default.
    pub arg_sep: char,
}

impl Default for NumLocale {
    fn default() -> Self {
        Self {
            decimal_sep: '.',
            thousands_sep: None,
            arg_sep: ',',
        }
    }
}

/// Locale-aware decimal float reader; the default identifier of every
/// parser.
///
/// Accepts `123`, `1.5`, `.5`, `1e9`, `2.5e-3` with the configured decimal
/// separator, and digit grouping with the configured thousands separator.
/// Signs are not part of literals; negation is an infix operator concern.
#[allow(
    clippy::cast_precision_loss,
    reason = "literal digits beyond f64 precision round like any float parse"
)]
pub fn parse_float(rest: &str, locale: &NumLocale) -> Option<(usize, Value)> {
    let bytes = rest.as_bytes();
    let mut i = 0;
    let mut normalized = String::new();

    // Integer part, possibly with grouping separators between digits.
    while i < bytes.len() {
        let c = rest[i..].chars().next()?;
        if c.is_ascii_digit() {
            normalized.push(c);
            i += 1;
        } else if locale.thousands_sep == Some(c)
            && !normalized.is_empty()
            && rest[i + c.len_utf8()..]
                .chars()
                .next()
                .is_some_and(|d| d.is_ascii_digit())
        {
            i += c.len_utf8();
        } else {
            break;
        }
    }

    // Fraction part.
    if let Some(c) = rest[i..].chars().next()
        && c == locale.decimal_sep
    {
        let frac_start = i + c.len_utf8();
        let frac_digits = rest[frac_start..]
            .bytes()
            .take_while(u8::is_ascii_digit)
            .count();
        if frac_digits > 0 {
            normalized.push('.');
            normalized.push_str(&rest[frac_start..frac_start + frac_digits]);
            i = frac_start + frac_digits;
        }
    }

    if normalized.is_empty() || !normalized.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }

    // Exponent part; only consumed when well-formed, otherwise the literal
    // ends before the 'e' (so `2e` parses as `2` followed by a name).
    if let Some(exp) = rest[i..].strip_prefix(['e', 'E']) {
        let sign_len = usize::from(exp.starts_with(['+', '-']));
        let exp_digits = exp[sign_len..].bytes().take_while(u8::is_ascii_digit).count();
        if exp_digits > 0 {
            normalized.push('e');
            normalized.push_str(&exp[..sign_len + exp_digits]);
            i += 1 + sign_len + exp_digits;
        }
    }

    normalized.parse::<Value>().ok().map(|v| (i, v))
}

/// Hexadecimal integer reader; matches `0x` followed by hex digits.
#[allow(
    clippy::cast_precision_loss,
    reason = "hex literals above 2^53 round like any float parse"
)]
pub fn parse_hex(rest: &str, _locale: &NumLocale) -> Option<(usize, Value)> {
    let digits = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))?;
    let len = digits.bytes().take_while(u8::is_ascii_hexdigit).count();
    if len == 0 {
        return None;
    }
    let v = u64::from_str_radix(&digits[..len], 16).ok()?;
    Some((2 + len, v as Value))
}

/// Binary integer reader; matches `#` followed by binary digits.
#[allow(
    clippy::cast_precision_loss,
    reason = "binary literals above 2^53 round like any float parse"
)]
pub fn parse_bin(rest: &str, _locale: &NumLocale) -> Option<(usize, Value)> {
    let digits = rest.strip_prefix('#')?;
    let len = digits.bytes().take_while(|b| *b == b'0' || *b == b'1').count();
    if len == 0 {
        return None;
    }
    let v = u64::from_str_radix(&digits[..len], 2).ok()?;
    Some((1 + len, v as Value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc() -> NumLocale {
        NumLocale::default()
    }

    #[test]
    fn test_float_basic() {
        assert_eq!(parse_float("42", &loc()), Some((2, 42.0)));
        assert_eq!(parse_float("3.25+x", &loc()), Some((4, 3.25)));
        assert_eq!(parse_float(".5*2", &loc()), Some((2, 0.5)));
        assert_eq!(parse_float("x", &loc()), None);
    }

    #[test]
    fn test_float_exponent() {
        assert_eq!(parse_float("1e3", &loc()), Some((3, 1000.0)));
        assert_eq!(parse_float("2.5e-2", &loc()), Some((6, 0.025)));
        // Malformed exponent ends the literal before the 'e'.
        assert_eq!(parse_float("2e+", &loc()), Some((1, 2.0)));
        assert_eq!(parse_float("2exp", &loc()), Some((1, 2.0)));
    }

    #[test]
    fn test_float_no_sign() {
        assert_eq!(parse_float("-2", &loc()), None);
        assert_eq!(parse_float("+2", &loc()), None);
    }

    #[test]
    fn test_float_locale() {
        let german = NumLocale {
            decimal_sep: ',',
            thousands_sep: Some('.'),
            arg_sep: ';',
        };
        assert_eq!(parse_float("1,5", &german), Some((3, 1.5)));
        assert_eq!(parse_float("1.000,5", &german), Some((7, 1000.5)));
        // '.' is grouping only between digits.
        assert_eq!(parse_float("1.", &german), Some((1, 1.0)));
    }

    #[test]
    fn test_hex() {
        assert_eq!(parse_hex("0xff", &loc()), Some((4, 255.0)));
        assert_eq!(parse_hex("0x1A+1", &loc()), Some((4, 26.0)));
        assert_eq!(parse_hex("0x", &loc()), None);
        assert_eq!(parse_hex("12", &loc()), None);
    }

    #[test]
    fn test_bin() {
        assert_eq!(parse_bin("#1011", &loc()), Some((5, 11.0)));
        assert_eq!(parse_bin("#2", &loc()), None);
        assert_eq!(parse_bin("1011", &loc()), None);
    }
}
