//! Language runtime collaborator interface.
//!
//! The server never evaluates program text itself. Everything runtime specific (evaluation,
//! backtraces, restarts, introspection) goes through the [`Runtime`] trait.
pub mod calc;

use crate::wire::Sexp;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// Error signaled by the evaluated program.
    Error,
    /// Evaluation stopped at a safe point because the client asked for it.
    Interrupt,
    /// Evaluation stopped because the connection is going away.
    Cancelled,
}

/// Restart offered by the runtime for a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeRestart {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub description: String,
    pub locals: Vec<Binding>,
}

/// Trapped runtime condition, the reason for entering the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub kind: ConditionKind,
    pub type_name: String,
    pub description: String,
    pub restarts: Vec<RuntimeRestart>,
    /// Innermost frame first.
    pub frames: Vec<Frame>,
}

impl Condition {
    pub fn error(type_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: ConditionKind::Error,
            type_name: type_name.into(),
            description: description.into(),
            restarts: vec![],
            frames: vec![],
        }
    }

    pub fn interrupt() -> Self {
        Self {
            kind: ConditionKind::Interrupt,
            type_name: "INTERRUPT".to_string(),
            description: "Interrupted by the client".to_string(),
            restarts: vec![],
            frames: vec![],
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: ConditionKind::Cancelled,
            type_name: "CANCELLED".to_string(),
            description: "connection closed".to_string(),
            restarts: vec![],
            frames: vec![],
        }
    }

    pub fn with_restart(mut self, name: &str, description: &str) -> Self {
        self.restarts.push(RuntimeRestart {
            name: name.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn with_frames(mut self, frames: Vec<Frame>) -> Self {
        self.frames = frames;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ConditionKind::Cancelled
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.description)
    }
}

/// What a runtime restart asks the trapping evaluation to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartAction {
    /// The form that trapped returns this value.
    Resume(Sexp),
    /// Evaluate the form again.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
}

/// Services the server offers to an evaluation in progress.
pub trait EvalContext {
    /// Send program output to the client.
    fn write_output(&mut self, text: &str);

    /// Ask the client for a line of input and block until it arrives.
    ///
    /// Fails with an interrupt or cancelled condition if the read is abandoned.
    fn read_string(&mut self) -> Result<String, Condition>;

    /// Safe point. Long running evaluations must call this periodically.
    fn check_interrupt(&mut self) -> Result<(), Condition>;
}

/// A language runtime plugged into the server.
pub trait Runtime: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn features(&self) -> Vec<String> {
        vec![]
    }

    /// Evaluate program text in a package.
    fn evaluate(
        &self,
        form: &str,
        package: &str,
        ctx: &mut dyn EvalContext,
    ) -> Result<Sexp, Condition>;

    /// Descriptions of frames `start..end` of a trapped condition.
    fn compute_backtrace(
        &self,
        condition: &Condition,
        start: usize,
        end: usize,
    ) -> anyhow::Result<Vec<String>> {
        let end = end.min(condition.frames.len());
        let start = start.min(end);
        Ok(condition.frames[start..end]
            .iter()
            .map(|f| f.description.clone())
            .collect())
    }

    /// Local bindings of a frame of a trapped condition.
    fn frame_locals(&self, condition: &Condition, frame: usize) -> anyhow::Result<Vec<Binding>> {
        condition
            .frames
            .get(frame)
            .map(|f| f.locals.clone())
            .ok_or_else(|| anyhow::anyhow!("no frame {frame}"))
    }

    /// Invoke runtime restart number `index` of `condition.restarts`.
    fn invoke_restart(
        &self,
        condition: &Condition,
        index: usize,
    ) -> Result<RestartAction, Condition>;

    fn arglist(&self, name: &str) -> Option<String>;

    fn find_definition(&self, name: &str) -> anyhow::Result<Location>;
}
