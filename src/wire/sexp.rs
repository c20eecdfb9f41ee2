//! Restricted s-expression reader and printer.
//!
//! The reader knows lists, strings, integers, symbols and keywords and nothing else: no reader
//! macros, no quoting, no `#` dispatch. Reading never has side effects. A symbol whose name would
//! read as something else is printed between bars, `|12|`.
use chumsky::prelude::*;
use itertools::Itertools;
use std::fmt;

type Err<'a> = extra::Err<Rich<'a, char>>;

/// Deepest list nesting accepted by [`read`].
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ReadError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
    Nil,
    Int(i64),
    Str(String),
    Symbol(String),
    /// Keyword name without the leading colon.
    Keyword(String),
    /// Non-empty list, an empty one is always [`Sexp::Nil`].
    List(Vec<Sexp>),
}

impl Sexp {
    pub fn list(items: Vec<Sexp>) -> Sexp {
        if items.is_empty() {
            Sexp::Nil
        } else {
            Sexp::List(items)
        }
    }

    pub fn string(s: impl Into<String>) -> Sexp {
        Sexp::Str(s.into())
    }

    pub fn symbol(s: impl Into<String>) -> Sexp {
        Sexp::Symbol(s.into())
    }

    pub fn keyword(s: impl Into<String>) -> Sexp {
        Sexp::Keyword(s.into())
    }

    /// A string or `nil` for `None`.
    pub fn opt_string(s: Option<impl Into<String>>) -> Sexp {
        s.map(Sexp::string).unwrap_or(Sexp::Nil)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Sexp::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Sexp::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Sexp::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Sexp::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&str> {
        match self {
            Sexp::Keyword(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list, `nil` reads as an empty list.
    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::Nil => Some(&[]),
            Sexp::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<i64> for Sexp {
    fn from(value: i64) -> Self {
        Sexp::Int(value)
    }
}

impl From<&str> for Sexp {
    fn from(value: &str) -> Self {
        Sexp::Str(value.to_string())
    }
}

impl From<String> for Sexp {
    fn from(value: String) -> Self {
        Sexp::Str(value)
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Nil => f.write_str("nil"),
            Sexp::Int(i) => write!(f, "{i}"),
            Sexp::Str(s) => write_delimited(f, s, '"'),
            Sexp::Symbol(s) if is_plain_symbol(s) => f.write_str(s),
            Sexp::Symbol(s) => write_delimited(f, s, '|'),
            Sexp::Keyword(s) => write!(f, ":{s}"),
            Sexp::List(items) => write!(f, "({})", items.iter().join(" ")),
        }
    }
}

fn write_delimited(f: &mut fmt::Formatter<'_>, s: &str, delimiter: char) -> fmt::Result {
    write!(f, "{delimiter}")?;
    for c in s.chars() {
        if c == delimiter || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    write!(f, "{delimiter}")
}

/// True if the name reads back as the same symbol without bars.
fn is_plain_symbol(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_atom_char) && matches!(classify(s), Ok(Sexp::Symbol(_)))
}

fn is_atom_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | '"' | ';' | '\'' | '`' | ',' | '#' | '|' | '\\')
}

fn is_integer_token(s: &str) -> bool {
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

fn classify(token: &str) -> Result<Sexp, String> {
    if is_integer_token(token) {
        return token
            .parse::<i64>()
            .map(Sexp::Int)
            .map_err(|e| format!("integer `{token}`: {e}"));
    }
    if let Some(name) = token.strip_prefix(':') {
        if name.is_empty() || name.contains(':') {
            return Err(format!("invalid keyword `{token}`"));
        }
        return Ok(Sexp::Keyword(name.to_string()));
    }
    if token.eq_ignore_ascii_case("nil") {
        return Ok(Sexp::Nil);
    }
    Ok(Sexp::Symbol(token.to_string()))
}

fn parser<'a>() -> impl Parser<'a, &'a str, Sexp, Err<'a>> {
    let sexp = recursive(|sexp| {
        let escape = just('\\').ignore_then(any());
        let string = none_of("\\\"")
            .or(escape.clone())
            .repeated()
            .collect::<String>()
            .delimited_by(just('"'), just('"'))
            .map(Sexp::Str)
            .labelled("string");

        let bar_symbol = none_of("\\|")
            .or(escape)
            .repeated()
            .collect::<String>()
            .delimited_by(just('|'), just('|'))
            .map(Sexp::Symbol)
            .labelled("symbol");

        let atom = any()
            .filter(|c: &char| is_atom_char(*c))
            .repeated()
            .at_least(1)
            .to_slice()
            .try_map(|token: &str, span| classify(token).map_err(|e| Rich::custom(span, e)))
            .labelled("atom");

        let list = sexp
            .padded()
            .repeated()
            .collect::<Vec<_>>()
            .padded()
            .delimited_by(just('('), just(')'))
            .map(Sexp::list)
            .labelled("list");

        choice((string, bar_symbol, list, atom)).padded()
    });

    sexp.then_ignore(end())
}

/// Deepest list nesting of `input`, parentheses inside strings and bars are skipped.
fn nesting_depth(input: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    let mut quote = None;
    let mut escaped = false;
    for c in input.chars() {
        if let Some(delimiter) = quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                _ if c == delimiter => quote = None,
                _ => {}
            }
            continue;
        }
        match c {
            '"' | '|' => quote = Some(c),
            '(' => {
                depth += 1;
                max = max.max(depth);
            }
            ')' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    max
}

/// Read exactly one s-expression from `input`.
pub fn read(input: &str) -> Result<Sexp, ReadError> {
    let depth = nesting_depth(input);
    if depth > MAX_DEPTH {
        return Err(ReadError(format!(
            "nesting depth {depth} exceeds the limit of {MAX_DEPTH}"
        )));
    }

    parser()
        .parse(input)
        .into_result()
        .map_err(|errors| ReadError(errors.iter().map(|e| e.to_string()).join("; ")))
}
