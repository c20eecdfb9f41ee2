//! Worker threads.
//!
//! One worker serves one outermost request. While it sits at a debugger prompt it serves the
//! nested requests addressed to it, strictly one at a time in arrival order.
use crate::error::Error;
use crate::runtime::{Condition, EvalContext, RestartAction};
use crate::server::connection::Session;
use crate::server::debug::{
    DebugStack, DebugState, Escape, Origin, Resolution, RestartKind, Unwind,
};
use crate::server::operation::Operation;
use crate::wire::{FrameDesc, Message, RequestId, ReturnValue, Sexp, WorkerRef};
use log::{debug, warn};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

const CONNECTION_CLOSED: &str = "connection closed";

pub struct WorkerRequest {
    pub form: String,
    pub package: String,
    pub id: RequestId,
}

/// Mailbox event.
pub enum WorkerEvent {
    /// Nested request, served at a debugger prompt.
    Request(WorkerRequest),
    ReadReply { tag: u64, text: String },
    /// Look at the interrupt flag.
    Wake,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run a runtime call, turning a panic into an error message.
fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| format!("panic: {}", panic_message(payload)))
}

struct Worker {
    session: Arc<Session>,
    me: WorkerRef,
    mailbox: Receiver<WorkerEvent>,
    interrupt: Arc<AtomicBool>,
    /// Nested requests received while the worker was busy.
    backlog: VecDeque<WorkerRequest>,
    debug: DebugStack,
    next_tag: u64,
    /// A debug level above the current prompt was closed since the last prompt request.
    returned_to_prompt: bool,
}

/// Worker thread body: serve `request`, answer it, then retire.
pub(super) fn run(
    session: Arc<Session>,
    me: WorkerRef,
    mailbox: Receiver<WorkerEvent>,
    interrupt: Arc<AtomicBool>,
    request: WorkerRequest,
) {
    debug!(target: "dispatch", "worker {me} started for request {}", request.id);

    let mut worker = Worker {
        session: session.clone(),
        me,
        mailbox,
        interrupt,
        backlog: VecDeque::new(),
        debug: DebugStack::new(),
        next_tag: 0,
        returned_to_prompt: false,
    };

    let value = return_value(worker.perform(&request));
    session.send_return(me, value, request.id);

    let live = {
        let mut workers = session.workers.lock().unwrap();
        workers.release(me);
        workers.len()
    };

    // requests that raced with the release still get their answer
    let mut leftovers: Vec<_> = worker.backlog.drain(..).collect();
    for event in worker.mailbox.try_iter() {
        match event {
            WorkerEvent::Request(request) => leftovers.push(request),
            WorkerEvent::ReadReply { tag, .. } => {
                session.background(Error::TagNotFound { worker: me, tag }.to_string());
            }
            WorkerEvent::Wake => {}
        }
    }
    for request in leftovers {
        session.send_return(
            me,
            ReturnValue::Abort(Some(format!("worker {me} finished"))),
            request.id,
        );
    }

    debug!(target: "dispatch", "worker {me} finished, {live} workers left");
}

fn return_value(result: Result<Sexp, Escape>) -> ReturnValue {
    match result {
        Ok(value) => ReturnValue::Ok(value),
        Err(Escape::Abort(reason)) => ReturnValue::Abort(reason),
        Err(Escape::Unwind(unwind)) => ReturnValue::Abort(unwind.reason),
        Err(Escape::Resolve(_)) => ReturnValue::Abort(None),
    }
}

impl Worker {
    fn perform(&mut self, request: &WorkerRequest) -> Result<Sexp, Escape> {
        match Operation::parse(&request.form) {
            Ok(Some(op)) => self.execute(op),
            Ok(None) => self.evaluate(&request.form, &request.package),
            Err(e) => Err(Escape::Abort(Some(e.to_string()))),
        }
    }

    fn evaluate(&mut self, form: &str, package: &str) -> Result<Sexp, Escape> {
        let runtime = self.session.runtime.clone();
        loop {
            let condition = match guarded(|| runtime.evaluate(form, package, &mut *self)) {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(condition)) => condition,
                Err(panic) => Condition::error("RUNTIME-PANIC", panic),
            };
            if condition.is_cancelled() || self.session.is_cancelled() {
                return Err(Unwind::to_top(Some(CONNECTION_CLOSED.to_string())).into());
            }

            match self.debug_loop(condition, Origin::Evaluation)? {
                Resolution::Resume(value) => return Ok(value),
                Resolution::Retry => continue,
            }
        }
    }

    /// Open a debug level for `condition` and serve the prompt until the level closes.
    fn debug_loop(&mut self, condition: Condition, origin: Origin) -> Result<Resolution, Unwind> {
        let level = self.debug.enter(condition, origin);
        self.announce(level);

        let outcome = self.prompt(level);

        self.debug.leave();
        self.session.notify(Message::DebugReturn {
            worker: self.me,
            level,
        });
        self.returned_to_prompt = true;
        debug!(target: "debugger", "worker {} left level {level}", self.me);
        outcome
    }

    fn announce(&self, level: usize) {
        let Some(current) = self.debug.current() else {
            return;
        };
        let description = current.description();
        let restarts = current.restarts().cloned().collect();

        let runtime = self.session.runtime.clone();
        let length = self.session.config.backtrace_length;
        let backtrace = guarded(|| runtime.compute_backtrace(&current.condition, 0, length))
            .and_then(|frames| frames.map_err(|e| format!("{e:#}")));

        debug!(target: "debugger", "worker {} entered level {level}: {description}", self.me);
        let (backtrace, failure) = match backtrace {
            Ok(frames) => (frames, None),
            Err(e) => (vec![], Some(e)),
        };
        self.session.notify(Message::DebugEnter {
            worker: self.me,
            level,
            description,
            restarts,
            backtrace: frames(0, backtrace),
        });
        if let Some(e) = failure {
            self.machine_error(Error::DebugMachine(format!("backtrace: {e}")));
        }
    }

    /// Serve the prompt of `level` until it is resolved or unwound.
    fn prompt(&mut self, level: usize) -> Result<Resolution, Unwind> {
        loop {
            let event = match self.backlog.pop_front() {
                Some(request) => WorkerEvent::Request(request),
                None => match self.mailbox.recv() {
                    Ok(event) => event,
                    Err(_) => return Err(Unwind::to_top(Some(CONNECTION_CLOSED.to_string()))),
                },
            };

            match event {
                WorkerEvent::Request(request) => {
                    self.returned_to_prompt = false;
                    let result = self.perform(&request);
                    let id = request.id;
                    match result {
                        Ok(value) => self.session.send_return(self.me, ReturnValue::Ok(value), id),
                        Err(Escape::Abort(reason)) => {
                            self.session
                                .send_return(self.me, ReturnValue::Abort(reason), id)
                        }
                        Err(Escape::Resolve(resolution)) => {
                            self.session.send_return(self.me, ReturnValue::Abort(None), id);
                            return Ok(resolution);
                        }
                        Err(Escape::Unwind(unwind)) => {
                            self.session.send_return(
                                self.me,
                                ReturnValue::Abort(unwind.reason.clone()),
                                id,
                            );
                            if unwind.target < level {
                                return Err(unwind);
                            }
                        }
                    }
                    self.activate(level);
                }
                WorkerEvent::Wake => {
                    if self.session.is_cancelled() {
                        return Err(Unwind::to_top(Some(CONNECTION_CLOSED.to_string())));
                    }
                    if self.interrupt.swap(false, Ordering::SeqCst) {
                        self.returned_to_prompt = false;
                        if let Err(unwind) = self.debug_loop(Condition::interrupt(), Origin::Prompt)
                        {
                            if unwind.target < level {
                                return Err(unwind);
                            }
                        }
                        self.activate(level);
                    }
                }
                WorkerEvent::ReadReply { tag, .. } => {
                    let e = Error::TagNotFound {
                        worker: self.me,
                        tag,
                    };
                    warn!(target: "debugger", "{e}");
                    self.session.background(e.to_string());
                }
            }
        }
    }

    /// Tell the client the prompt of `level` is active again after an inner level closed.
    fn activate(&mut self, level: usize) {
        if self.returned_to_prompt {
            self.session.notify(Message::DebugActivate {
                worker: self.me,
                level,
            });
            self.returned_to_prompt = false;
        }
    }

    /// Report a failure of the debugger itself, the failing request is aborted.
    fn machine_error(&self, e: Error) -> Escape {
        warn!(target: "debugger", "worker {}: {e}", self.me);
        let text = e.to_string();
        self.session.notify(Message::DebugConditionText {
            worker: self.me,
            text: text.clone(),
        });
        Escape::Abort(Some(text))
    }

    fn execute(&mut self, op: Operation) -> Result<Sexp, Escape> {
        if op.needs_debugger() && self.debug.state() == DebugState::Running {
            return Err(Escape::Abort(Some(format!(
                "worker {} is not in the debugger",
                self.me
            ))));
        }
        let runtime = self.session.runtime.clone();

        match op {
            Operation::ConnectionInfo => Ok(self.connection_info()),
            Operation::Arglist(name) => Ok(Sexp::opt_string(runtime.arglist(&name))),
            Operation::FindDefinition(name) => match runtime.find_definition(&name) {
                Ok(location) => Ok(Sexp::List(vec![
                    Sexp::keyword("file"),
                    Sexp::string(location.file),
                    Sexp::keyword("line"),
                    Sexp::Int(location.line as i64),
                ])),
                Err(e) => Err(Escape::Abort(Some(format!("{e:#}")))),
            },
            Operation::Backtrace { start, end } => {
                let frames = self.backtrace(start, end)?;
                Ok(frames_sexp(&frames))
            }
            Operation::FrameLocals(frame) => {
                let condition = self.current_condition();
                let locals = guarded(|| runtime.frame_locals(&condition, frame))
                    .and_then(|locals| locals.map_err(|e| format!("{e:#}")))
                    .map_err(|e| self.machine_error(Error::DebugMachine(format!("locals: {e}"))))?;
                Ok(Sexp::list(
                    locals
                        .into_iter()
                        .map(|b| Sexp::List(vec![Sexp::string(b.name), Sexp::string(b.value)]))
                        .collect(),
                ))
            }
            Operation::DebuggerInfo { start, end } => {
                let frames = self.backtrace(start, end)?;
                let Some(current) = self.debug.current() else {
                    return Err(Escape::Abort(None));
                };
                Ok(Sexp::List(vec![
                    Sexp::keyword("condition"),
                    Sexp::string(current.description()),
                    Sexp::keyword("restarts"),
                    Sexp::list(
                        current
                            .restarts()
                            .map(|r| {
                                Sexp::List(vec![
                                    Sexp::string(r.name.as_str()),
                                    Sexp::string(r.description.as_str()),
                                ])
                            })
                            .collect(),
                    ),
                    Sexp::keyword("frames"),
                    frames_sexp(&frames),
                ]))
            }
            Operation::InvokeRestart { level, index } => {
                let kind = self
                    .debug
                    .restart(level, index)
                    .map_err(|e| self.machine_error(e))?;
                self.restart(kind)
            }
            Operation::Abort => {
                let kind = self.debug.abort_restart().ok_or(Escape::Abort(None))?;
                self.restart(kind)
            }
            Operation::Continue => match self.debug.find_restart("CONTINUE") {
                Some(kind) => self.restart(kind),
                None => Err(Escape::Abort(Some("no CONTINUE restart".to_string()))),
            },
            Operation::ThrowToToplevel => Err(Unwind::to_top(None).into()),
        }
    }

    fn restart(&mut self, kind: RestartKind) -> Result<Sexp, Escape> {
        debug!(target: "debugger", "worker {} restart {kind:?} at level {}", self.me, self.debug.level());
        match kind {
            RestartKind::Runtime(index) => {
                let condition = self.current_condition();
                let runtime = self.session.runtime.clone();
                match guarded(|| runtime.invoke_restart(&condition, index)) {
                    Ok(Ok(RestartAction::Resume(value))) => {
                        Err(Escape::Resolve(Resolution::Resume(value)))
                    }
                    Ok(Ok(RestartAction::Retry)) => Err(Escape::Resolve(Resolution::Retry)),
                    Ok(Err(condition)) => Err(self.machine_error(Error::DebugMachine(format!(
                        "restart {index}: {condition}"
                    )))),
                    Err(panic) => Err(self.machine_error(Error::DebugMachine(format!(
                        "restart {index}: {panic}"
                    )))),
                }
            }
            RestartKind::Retry => Err(Escape::Resolve(Resolution::Retry)),
            RestartKind::Continue => Err(Escape::Resolve(Resolution::Resume(Sexp::Nil))),
            RestartKind::Unwind(target) => Err(Unwind {
                target,
                reason: None,
            }
            .into()),
        }
    }

    fn current_condition(&self) -> Condition {
        self.debug
            .current()
            .map(|level| level.condition.clone())
            .unwrap_or_else(Condition::cancelled)
    }

    fn backtrace(&self, start: usize, end: Option<usize>) -> Result<Vec<FrameDesc>, Escape> {
        let condition = self.current_condition();
        let runtime = self.session.runtime.clone();
        let end = end.unwrap_or(usize::MAX);
        guarded(|| runtime.compute_backtrace(&condition, start, end))
            .and_then(|frames| frames.map_err(|e| format!("{e:#}")))
            .map(|descriptions| frames(start, descriptions))
            .map_err(|e| self.machine_error(Error::DebugMachine(format!("backtrace: {e}"))))
    }

    fn connection_info(&self) -> Sexp {
        let runtime = &self.session.runtime;
        Sexp::List(vec![
            Sexp::keyword("pid"),
            Sexp::Int(std::process::id() as i64),
            Sexp::keyword("version"),
            Sexp::string(env!("CARGO_PKG_VERSION")),
            Sexp::keyword("runtime"),
            Sexp::List(vec![
                Sexp::keyword("name"),
                Sexp::string(runtime.name()),
                Sexp::keyword("version"),
                Sexp::string(runtime.version()),
            ]),
            Sexp::keyword("features"),
            Sexp::list(runtime.features().into_iter().map(Sexp::Str).collect()),
            Sexp::keyword("package"),
            Sexp::string(self.session.config.default_package.as_str()),
        ])
    }
}

fn frames(start: usize, descriptions: Vec<String>) -> Vec<FrameDesc> {
    descriptions
        .into_iter()
        .enumerate()
        .map(|(i, description)| FrameDesc {
            index: start + i,
            description,
        })
        .collect()
}

fn frames_sexp(frames: &[FrameDesc]) -> Sexp {
    Sexp::list(
        frames
            .iter()
            .map(|f| {
                Sexp::List(vec![
                    Sexp::Int(f.index as i64),
                    Sexp::string(f.description.as_str()),
                ])
            })
            .collect(),
    )
}

impl EvalContext for Worker {
    fn write_output(&mut self, text: &str) {
        self.session.write_output(text);
    }

    fn read_string(&mut self) -> Result<String, Condition> {
        self.check_interrupt()?;
        self.next_tag += 1;
        let tag = self.next_tag;
        self.session.notify(Message::ReadStringRequest {
            worker: self.me,
            tag,
        });

        loop {
            let event = self.mailbox.recv().map_err(|_| Condition::cancelled())?;
            match event {
                WorkerEvent::ReadReply { tag: got, text } if got == tag => return Ok(text),
                WorkerEvent::ReadReply { tag: got, .. } => {
                    self.session.background(
                        Error::TagNotFound {
                            worker: self.me,
                            tag: got,
                        }
                        .to_string(),
                    );
                }
                WorkerEvent::Request(request) => self.backlog.push_back(request),
                WorkerEvent::Wake => {
                    if let Err(condition) = self.check_interrupt() {
                        self.session.notify(Message::ReadAborted {
                            worker: self.me,
                            tag,
                        });
                        return Err(condition);
                    }
                }
            }
        }
    }

    fn check_interrupt(&mut self) -> Result<(), Condition> {
        if self.session.is_cancelled() {
            return Err(Condition::cancelled());
        }
        if self.interrupt.swap(false, Ordering::SeqCst) {
            debug!(target: "debugger", "worker {} interrupted", self.me);
            return Err(Condition::interrupt());
        }
        Ok(())
    }
}
