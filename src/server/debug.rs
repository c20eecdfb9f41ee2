//! Per worker debug session stack.
//!
//! Every trapped condition opens a new level. A level is closed by a restart, which either
//! resolves it (the trapping evaluation resumes or retries) or unwinds to a lower level. Unwinding
//! is an ordinary return value: nothing here relies on stack unwinding.
use crate::error::Error;
use crate::runtime::{Condition, ConditionKind};
use crate::wire::{RestartDesc, Sexp};

/// Where a level was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A request evaluation trapped a condition.
    Evaluation,
    /// The worker was interrupted while idle at a prompt.
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugState {
    Running,
    AtPrompt(usize),
}

/// What choosing a restart does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartKind {
    /// Runtime restart, by index into the condition restarts.
    Runtime(usize),
    /// Evaluate the interrupted request again.
    Retry,
    /// Leave the level, returning to where it was opened.
    Continue,
    /// Unwind to the given level, 0 is the top level.
    Unwind(usize),
}

/// Non-local exit to a lower debug level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unwind {
    pub target: usize,
    pub reason: Option<String>,
}

impl Unwind {
    pub fn to_top(reason: Option<String>) -> Self {
        Self { target: 0, reason }
    }
}

/// How a level resolved without unwinding past its opener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resume(Sexp),
    Retry,
}

/// Result of performing a request that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escape {
    /// The request failed, debug levels are untouched.
    Abort(Option<String>),
    /// Leave levels down to `Unwind::target`.
    Unwind(Unwind),
    /// Close the current level with a resolution.
    Resolve(Resolution),
}

impl From<Unwind> for Escape {
    fn from(unwind: Unwind) -> Self {
        Escape::Unwind(unwind)
    }
}

pub struct DebugLevel {
    pub condition: Condition,
    pub origin: Origin,
    restarts: Vec<(RestartDesc, RestartKind)>,
}

impl DebugLevel {
    pub fn restarts(&self) -> impl Iterator<Item = &RestartDesc> {
        self.restarts.iter().map(|(desc, _)| desc)
    }

    pub fn description(&self) -> String {
        self.condition.to_string()
    }
}

fn restart(name: &str, description: String, kind: RestartKind) -> (RestartDesc, RestartKind) {
    (
        RestartDesc {
            name: name.to_string(),
            description,
        },
        kind,
    )
}

#[derive(Default)]
pub struct DebugStack {
    levels: Vec<DebugLevel>,
}

impl DebugStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DebugState {
        match self.levels.len() {
            0 => DebugState::Running,
            n => DebugState::AtPrompt(n),
        }
    }

    pub fn level(&self) -> usize {
        self.levels.len()
    }

    pub fn current(&self) -> Option<&DebugLevel> {
        self.levels.last()
    }

    /// Open a new level for a trapped condition and return its number.
    pub fn enter(&mut self, condition: Condition, origin: Origin) -> usize {
        let level = self.levels.len() + 1;

        let mut restarts: Vec<_> = condition
            .restarts
            .iter()
            .enumerate()
            .map(|(i, r)| restart(&r.name, r.description.clone(), RestartKind::Runtime(i)))
            .collect();
        if condition.kind == ConditionKind::Interrupt {
            restarts.push(match origin {
                Origin::Evaluation => restart(
                    "RETRY",
                    "Evaluate the interrupted form again.".to_string(),
                    RestartKind::Retry,
                ),
                Origin::Prompt => restart(
                    "CONTINUE",
                    format!("Return to debug level {}.", level - 1),
                    RestartKind::Continue,
                ),
            });
        }
        for k in (1..level).rev() {
            restarts.push(restart(
                "ABORT",
                format!("Return to debug level {k}."),
                RestartKind::Unwind(k),
            ));
        }
        restarts.push(restart(
            "ABORT",
            "Return to top level.".to_string(),
            RestartKind::Unwind(0),
        ));

        self.levels.push(DebugLevel {
            condition,
            origin,
            restarts,
        });
        level
    }

    /// Close the innermost level.
    pub fn leave(&mut self) -> Option<DebugLevel> {
        self.levels.pop()
    }

    /// Find restart `index` of `level`. Only the current level accepts restarts.
    pub fn restart(&self, level: usize, index: usize) -> Result<RestartKind, Error> {
        let current = self
            .current()
            .ok_or_else(|| Error::DebugMachine("not in the debugger".to_string()))?;
        if level != self.level() {
            return Err(Error::DebugMachine(format!(
                "restart for level {level} requested, current level is {}",
                self.level()
            )));
        }
        current
            .restarts
            .get(index)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| Error::DebugMachine(format!("no restart {index} at level {level}")))
    }

    /// First restart of the current level with the given name.
    pub fn find_restart(&self, name: &str) -> Option<RestartKind> {
        self.current()?
            .restarts
            .iter()
            .find(|(desc, _)| desc.name == name)
            .map(|(_, kind)| *kind)
    }

    /// Innermost abort: one level down.
    pub fn abort_restart(&self) -> Option<RestartKind> {
        self.current()?
            .restarts
            .iter()
            .find(|(_, kind)| matches!(kind, RestartKind::Unwind(_)))
            .map(|(_, kind)| *kind)
    }
}
