//! Core request operations.
//!
//! A request form that reads as a list headed by a `slink:` symbol is served by the server itself,
//! anything else is program text for the runtime.
use crate::error::Error;
use crate::wire::{sexp, Sexp};
use strum_macros::{Display, EnumString};

pub const PREFIX: &str = "slink:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
enum Name {
    ConnectionInfo,
    Arglist,
    FindDefinition,
    Backtrace,
    FrameLocals,
    DebuggerInfo,
    InvokeRestart,
    Abort,
    Continue,
    ThrowToToplevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    ConnectionInfo,
    Arglist(String),
    FindDefinition(String),
    Backtrace { start: usize, end: Option<usize> },
    FrameLocals(usize),
    DebuggerInfo { start: usize, end: Option<usize> },
    InvokeRestart { level: usize, index: usize },
    Abort,
    Continue,
    ThrowToToplevel,
}

impl Operation {
    /// True for operations that need an open debug level.
    pub fn needs_debugger(&self) -> bool {
        match self {
            Operation::ConnectionInfo | Operation::Arglist(_) | Operation::FindDefinition(_) => {
                false
            }
            Operation::Backtrace { .. }
            | Operation::FrameLocals(_)
            | Operation::DebuggerInfo { .. }
            | Operation::InvokeRestart { .. }
            | Operation::Abort
            | Operation::Continue
            | Operation::ThrowToToplevel => true,
        }
    }

    /// Recognize a core operation.
    ///
    /// Returns `Ok(None)` for program text. A `slink:` form with an unknown name or bad
    /// arguments is an error.
    pub fn parse(form: &str) -> Result<Option<Operation>, Error> {
        let Ok(Sexp::List(items)) = sexp::read(form) else {
            return Ok(None);
        };
        let Some(name) = items[0].as_symbol().and_then(|s| s.strip_prefix(PREFIX)) else {
            return Ok(None);
        };
        let op_name: Name = name
            .parse()
            .map_err(|_| Error::Request(format!("unknown operation {PREFIX}{name}")))?;
        let args = &items[1..];
        let bad_args = || Error::Request(format!("bad arguments for {PREFIX}{op_name}"));

        let op = match (op_name, args) {
            (Name::ConnectionInfo, []) => Operation::ConnectionInfo,
            (Name::Arglist, [Sexp::Str(name)]) => Operation::Arglist(name.clone()),
            (Name::FindDefinition, [Sexp::Str(name)]) => Operation::FindDefinition(name.clone()),
            (Name::Backtrace, _) => {
                let (start, end) = range(args).ok_or_else(bad_args)?;
                Operation::Backtrace { start, end }
            }
            (Name::DebuggerInfo, _) => {
                let (start, end) = range(args).ok_or_else(bad_args)?;
                Operation::DebuggerInfo { start, end }
            }
            (Name::FrameLocals, [frame]) => {
                Operation::FrameLocals(index(frame).ok_or_else(bad_args)?)
            }
            (Name::InvokeRestart, [level, restart]) => Operation::InvokeRestart {
                level: index(level).ok_or_else(bad_args)?,
                index: index(restart).ok_or_else(bad_args)?,
            },
            (Name::Abort, []) => Operation::Abort,
            (Name::Continue, []) => Operation::Continue,
            (Name::ThrowToToplevel, []) => Operation::ThrowToToplevel,
            _ => return Err(bad_args()),
        };
        Ok(Some(op))
    }
}

fn index(sexp: &Sexp) -> Option<usize> {
    sexp.as_int().and_then(|i| usize::try_from(i).ok())
}

/// `START` or `START END`, END may be nil.
fn range(args: &[Sexp]) -> Option<(usize, Option<usize>)> {
    match args {
        [] => Some((0, None)),
        [start] => Some((index(start)?, None)),
        [start, Sexp::Nil] => Some((index(start)?, None)),
        [start, end] => Some((index(start)?, Some(index(end)?))),
        _ => None,
    }
}
