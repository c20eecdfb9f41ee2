//! Client state machine.
//!
//! Mirrors the nesting of every worker on the server side: one stack of frames per worker, grown
//! by outgoing requests and `DebugEnter`, shrunk by `Return` and `DebugReturn`. The machine is
//! pure. It never performs I/O, it only answers with the [`Effect`]s a message produced.
use crate::error::Error;
use crate::wire::{FrameDesc, Message, RequestId, RestartDesc, ReturnValue, Sexp, WorkerRef, WorkerTarget};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Receives the value of a successful evaluation.
pub type Continuation = Box<dyn FnOnce(Sexp) + Send>;

/// What the client knows about an open debug level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggerView {
    pub level: usize,
    pub description: String,
    pub restarts: Vec<RestartDesc>,
    pub backtrace: Vec<FrameDesc>,
}

pub enum ClientStateFrame {
    Idle,
    Evaluating {
        id: RequestId,
        continuation: Option<Continuation>,
    },
    Debugging(DebuggerView),
}

/// Shape of a frame, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Idle,
    Evaluating(RequestId),
    Debugging(usize),
}

impl ClientStateFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            ClientStateFrame::Idle => FrameKind::Idle,
            ClientStateFrame::Evaluating { id, .. } => FrameKind::Evaluating(*id),
            ClientStateFrame::Debugging(view) => FrameKind::Debugging(view.level),
        }
    }
}

/// Work for the connection layer, produced by [`ClientStateMachine::handle`].
pub enum Effect {
    /// A request finished. The continuation is present only for successful evaluations.
    Returned {
        worker: Option<WorkerRef>,
        id: RequestId,
        value: ReturnValue,
        continuation: Option<Continuation>,
    },
    EnterDebugger {
        worker: WorkerRef,
        view: DebuggerView,
    },
    ActivateDebugger {
        worker: WorkerRef,
        level: usize,
    },
    ExitDebugger {
        worker: WorkerRef,
        level: usize,
    },
    DebugText {
        worker: WorkerRef,
        text: String,
    },
    ReadString {
        worker: WorkerRef,
        tag: u64,
    },
    ReadAborted {
        worker: WorkerRef,
        tag: u64,
    },
    Output(String),
    Features(Vec<String>),
    Background(String),
    OutputChannel(u16),
}

#[derive(Default)]
pub struct ClientStateMachine {
    /// Live workers, a worker absent from here is idle.
    stacks: BTreeMap<WorkerRef, Vec<ClientStateFrame>>,
    /// Outermost requests the server has not bound to a worker yet.
    unbound: IndexMap<RequestId, Option<Continuation>>,
    /// Nested requests whose debug level closed before the server answered them. The server
    /// still answers each of them exactly once, at whatever prompt or exit the worker reaches.
    orphans: HashMap<RequestId, (WorkerRef, Option<Continuation>)>,
    pending_reads: BTreeSet<(WorkerRef, u64)>,
    next_id: RequestId,
}

fn desync(msg: impl Into<String>) -> Error {
    Error::Desync(msg.into())
}

impl ClientStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an evaluation.
    ///
    /// With `worker` set the request is nested: it is evaluated at the debugger prompt of that
    /// worker, which must be waiting at a prompt with no other nested request outstanding.
    pub fn evaluate(
        &mut self,
        form: &str,
        package: &str,
        worker: Option<WorkerRef>,
        continuation: Option<Continuation>,
    ) -> Result<(RequestId, Message), Error> {
        let target = match worker {
            None => WorkerTarget::New,
            Some(w) => {
                if !matches!(self.top(w), FrameKind::Debugging(_)) {
                    return Err(Error::Request(format!(
                        "worker {w} is not waiting at a debugger prompt"
                    )));
                }
                WorkerTarget::Ref(w)
            }
        };

        self.next_id += 1;
        let id = self.next_id;
        match target {
            WorkerTarget::New => {
                self.unbound.insert(id, continuation);
            }
            WorkerTarget::Ref(w) => self
                .stacks
                .entry(w)
                .or_default()
                .push(ClientStateFrame::Evaluating { id, continuation }),
        }

        let request = Message::Request {
            form: form.to_string(),
            package: package.to_string(),
            worker: target,
            id,
        };
        Ok((id, request))
    }

    /// Interrupts never change local state, the server answers with events.
    pub fn interrupt(&self, worker: WorkerRef) -> Message {
        Message::Interrupt { worker }
    }

    /// Answer a pending read.
    pub fn return_string(
        &mut self,
        worker: WorkerRef,
        tag: u64,
        text: &str,
    ) -> Result<Message, Error> {
        if !self.pending_reads.remove(&(worker, tag)) {
            return Err(Error::TagNotFound { worker, tag });
        }
        Ok(Message::ReadStringReply {
            worker,
            tag,
            text: text.to_string(),
        })
    }

    /// Consume a server message.
    pub fn handle(&mut self, message: Message) -> Result<Vec<Effect>, Error> {
        let effect = match message {
            Message::WorkerAssigned { id, worker } => {
                let continuation = self.unbound.shift_remove(&id).ok_or_else(|| {
                    desync(format!("worker {worker} assigned to unknown request {id}"))
                })?;
                if self.stacks.contains_key(&worker) {
                    return Err(desync(format!(
                        "worker {worker} assigned to request {id} while busy"
                    )));
                }
                self.stacks
                    .insert(worker, vec![ClientStateFrame::Evaluating { id, continuation }]);
                return Ok(vec![]);
            }
            Message::Return { worker, value, id } => {
                let (worker, continuation) = self.pop_evaluation(worker, id)?;
                let continuation = match value {
                    ReturnValue::Ok(_) => continuation,
                    ReturnValue::Abort(_) => None,
                };
                Effect::Returned {
                    worker,
                    id,
                    value,
                    continuation,
                }
            }
            Message::DebugEnter {
                worker,
                level,
                description,
                restarts,
                backtrace,
            } => {
                let expected = self.debug_level(worker) + 1;
                if level != expected {
                    return Err(desync(format!(
                        "worker {worker} entered debug level {level}, expected {expected}"
                    )));
                }
                let stack = self
                    .stacks
                    .get_mut(&worker)
                    .ok_or_else(|| desync(format!("debugger entered on idle worker {worker}")))?;
                let view = DebuggerView {
                    level,
                    description,
                    restarts,
                    backtrace,
                };
                stack.push(ClientStateFrame::Debugging(view.clone()));
                Effect::EnterDebugger { worker, view }
            }
            Message::DebugActivate { worker, level } => {
                if self.innermost_level(worker).map(|(_, l)| l) != Some(level) {
                    return Err(desync(format!(
                        "worker {worker} activated level {level} which is not the innermost"
                    )));
                }
                Effect::ActivateDebugger { worker, level }
            }
            Message::DebugReturn { worker, level } => {
                let Some((pos, innermost)) = self.innermost_level(worker) else {
                    return Err(desync(format!(
                        "worker {worker} left level {level} outside the debugger"
                    )));
                };
                if innermost != level {
                    return Err(desync(format!(
                        "worker {worker} left level {level}, innermost is {innermost}"
                    )));
                }
                // requests sent to the closing prompt are answered later, at another prompt
                // or when the worker finishes
                if let Some(stack) = self.stacks.get_mut(&worker) {
                    for frame in stack.drain(pos + 1..) {
                        if let ClientStateFrame::Evaluating { id, continuation } = frame {
                            self.orphans.insert(id, (worker, continuation));
                        }
                    }
                }
                self.pop(worker);
                Effect::ExitDebugger { worker, level }
            }
            Message::DebugConditionText { worker, text } => Effect::DebugText { worker, text },
            Message::ReadStringRequest { worker, tag } => {
                self.pending_reads.insert((worker, tag));
                Effect::ReadString { worker, tag }
            }
            Message::ReadAborted { worker, tag } => {
                if !self.pending_reads.remove(&(worker, tag)) {
                    return Err(desync(format!(
                        "worker {worker} aborted unknown read {tag}"
                    )));
                }
                Effect::ReadAborted { worker, tag }
            }
            Message::Output { text } => Effect::Output(text),
            Message::FeatureUpdate { features } => Effect::Features(features),
            Message::BackgroundMessage { text } => Effect::Background(text),
            Message::OutputChannel { port } => Effect::OutputChannel(port),
            unexpected @ (Message::Request { .. }
            | Message::Interrupt { .. }
            | Message::ReadStringReply { .. }) => {
                return Err(desync(format!(
                    "server sent client message :{}",
                    unexpected.kind()
                )));
            }
        };
        Ok(vec![effect])
    }

    /// Drop every outstanding request, used when the connection is lost.
    pub fn abort_all(&mut self, reason: &str) -> Vec<Effect> {
        let mut effects = vec![];
        for (id, _) in self.unbound.drain(..) {
            effects.push(Effect::Returned {
                worker: None,
                id,
                value: ReturnValue::Abort(Some(reason.to_string())),
                continuation: None,
            });
        }
        for (worker, stack) in std::mem::take(&mut self.stacks) {
            for frame in stack.into_iter().rev() {
                if let ClientStateFrame::Evaluating { id, .. } = frame {
                    effects.push(Effect::Returned {
                        worker: Some(worker),
                        id,
                        value: ReturnValue::Abort(Some(reason.to_string())),
                        continuation: None,
                    });
                }
            }
        }
        for (id, (worker, _)) in self.orphans.drain() {
            effects.push(Effect::Returned {
                worker: Some(worker),
                id,
                value: ReturnValue::Abort(Some(reason.to_string())),
                continuation: None,
            });
        }
        self.pending_reads.clear();
        effects
    }

    fn pop_evaluation(
        &mut self,
        worker: WorkerRef,
        id: RequestId,
    ) -> Result<(Option<WorkerRef>, Option<Continuation>), Error> {
        if let Some(continuation) = self.unbound.shift_remove(&id) {
            return Ok((None, continuation));
        }
        if let Some((owner, continuation)) = self.orphans.remove(&id) {
            if owner != worker {
                return Err(desync(format!(
                    "return for request {id} on worker {worker}, it was sent to worker {owner}"
                )));
            }
            return Ok((Some(worker), continuation));
        }

        // A nested request may be covered by levels the worker entered before serving it, an
        // interrupt at the prompt for example. A level opened by the request itself always
        // closes before its return, so those levels can only be someone else's.
        let pos = self.stacks.get(&worker).and_then(|stack| {
            let pos = stack
                .iter()
                .rposition(|f| !matches!(f, ClientStateFrame::Debugging(_)))?;
            let covered = pos + 1 < stack.len();
            let matches = stack[pos].kind() == FrameKind::Evaluating(id);
            (matches && (pos > 0 || !covered)).then_some(pos)
        });
        let Some(pos) = pos else {
            return Err(desync(format!(
                "return for request {id} on worker {worker} does not match {:?}",
                self.top(worker)
            )));
        };

        let frame = match self.stacks.get_mut(&worker) {
            Some(stack) => stack.remove(pos),
            None => return Err(desync(format!("request {id} is not pending"))),
        };
        if self.stacks.get(&worker).is_some_and(Vec::is_empty) {
            self.stacks.remove(&worker);
            self.pending_reads.retain(|(w, _)| *w != worker);
        }
        match frame {
            ClientStateFrame::Evaluating { continuation, .. } => Ok((Some(worker), continuation)),
            _ => Err(desync(format!("request {id} is not pending"))),
        }
    }

    /// Position and level of the innermost open debug level of a worker.
    fn innermost_level(&self, worker: WorkerRef) -> Option<(usize, usize)> {
        self.stacks.get(&worker)?.iter().enumerate().rev().find_map(|(pos, f)| match f {
            ClientStateFrame::Debugging(view) => Some((pos, view.level)),
            _ => None,
        })
    }

    fn pop(&mut self, worker: WorkerRef) -> Option<ClientStateFrame> {
        let stack = self.stacks.get_mut(&worker)?;
        let frame = stack.pop();
        if stack.is_empty() {
            self.stacks.remove(&worker);
            self.pending_reads.retain(|(w, _)| *w != worker);
        }
        frame
    }

    /// Top frame of a worker stack.
    pub fn top(&self, worker: WorkerRef) -> FrameKind {
        self.stacks
            .get(&worker)
            .and_then(|stack| stack.last())
            .map(ClientStateFrame::kind)
            .unwrap_or(FrameKind::Idle)
    }

    /// Frames of a worker stack including the idle base.
    pub fn depth(&self, worker: WorkerRef) -> usize {
        1 + self.stacks.get(&worker).map(Vec::len).unwrap_or_default()
    }

    pub fn debug_level(&self, worker: WorkerRef) -> usize {
        self.stacks
            .get(&worker)
            .map(|stack| {
                stack
                    .iter()
                    .filter(|f| matches!(f, ClientStateFrame::Debugging(_)))
                    .count()
            })
            .unwrap_or_default()
    }

    /// Innermost debugger view of a worker.
    pub fn debugger(&self, worker: WorkerRef) -> Option<&DebuggerView> {
        self.stacks.get(&worker)?.iter().rev().find_map(|f| match f {
            ClientStateFrame::Debugging(view) => Some(view),
            _ => None,
        })
    }

    /// Kinds of every frame of a worker stack, bottom first, starting with the idle base.
    pub fn frames(&self, worker: WorkerRef) -> Vec<FrameKind> {
        std::iter::once(FrameKind::Idle)
            .chain(
                self.stacks
                    .get(&worker)
                    .into_iter()
                    .flatten()
                    .map(ClientStateFrame::kind),
            )
            .collect()
    }

    /// Workers with at least one frame above idle.
    pub fn busy_workers(&self) -> Vec<WorkerRef> {
        self.stacks.keys().copied().collect()
    }

    /// Workers waiting at a debugger prompt.
    pub fn prompts(&self) -> Vec<(WorkerRef, usize)> {
        self.stacks
            .keys()
            .filter_map(|w| match self.top(*w) {
                FrameKind::Debugging(level) => Some((*w, level)),
                _ => None,
            })
            .collect()
    }

    pub fn pending_reads(&self) -> Vec<(WorkerRef, u64)> {
        self.pending_reads.iter().copied().collect()
    }

    /// No request outstanding at all.
    pub fn is_idle(&self) -> bool {
        self.stacks.is_empty() && self.unbound.is_empty() && self.orphans.is_empty()
    }
}
