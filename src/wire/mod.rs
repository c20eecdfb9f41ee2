//! Wire protocol: message types and their s-expression representation.
//!
//! Every frame carries exactly one [`Message`], printed as a list headed by a keyword:
//!
//! ```text
//! (:rex "(+ 1 2)" "USER" :new 1)
//! (:return 5 (:ok 3) 1)
//! (:debug 5 1 "division by zero" (("ABORT" "Return to top level")) ((0 "(/ 1 0)")))
//! ```
pub mod codec;
pub mod sexp;

use crate::error::ProtocolError;
use itertools::Itertools;
pub use sexp::Sexp;
use std::fmt;
use strum_macros::IntoStaticStr;

pub type RequestId = u64;

/// Small integer handle identifying a worker across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerRef(pub u32);

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTarget {
    /// Spawn a fresh worker.
    New,
    /// Nested request for a worker parked at a debugger prompt.
    Ref(WorkerRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnValue {
    Ok(Sexp),
    Abort(Option<String>),
}

/// Restart as shown to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartDesc {
    pub name: String,
    pub description: String,
}

/// Backtrace frame as shown to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDesc {
    pub index: usize,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum Message {
    // --------------------------------- client to server ------------------------------------------
    Request {
        form: String,
        package: String,
        worker: WorkerTarget,
        id: RequestId,
    },
    Interrupt {
        worker: WorkerRef,
    },
    ReadStringReply {
        worker: WorkerRef,
        tag: u64,
        text: String,
    },

    // --------------------------------- server to client ------------------------------------------
    WorkerAssigned {
        id: RequestId,
        worker: WorkerRef,
    },
    Return {
        worker: WorkerRef,
        value: ReturnValue,
        id: RequestId,
    },
    DebugEnter {
        worker: WorkerRef,
        level: usize,
        description: String,
        restarts: Vec<RestartDesc>,
        backtrace: Vec<FrameDesc>,
    },
    DebugActivate {
        worker: WorkerRef,
        level: usize,
    },
    DebugReturn {
        worker: WorkerRef,
        level: usize,
    },
    DebugConditionText {
        worker: WorkerRef,
        text: String,
    },
    ReadStringRequest {
        worker: WorkerRef,
        tag: u64,
    },
    ReadAborted {
        worker: WorkerRef,
        tag: u64,
    },
    Output {
        text: String,
    },
    FeatureUpdate {
        features: Vec<String>,
    },
    BackgroundMessage {
        text: String,
    },
    OutputChannel {
        port: u16,
    },
}

impl Message {
    /// Short message kind name, for logs.
    pub fn kind(&self) -> &'static str {
        self.into()
    }

    pub fn to_sexp(&self) -> Sexp {
        let worker = |w: &WorkerRef| Sexp::Int(w.0 as i64);
        let kw = Sexp::keyword;

        let items = match self {
            Message::Request {
                form,
                package,
                worker: target,
                id,
            } => vec![
                kw("rex"),
                Sexp::string(form.as_str()),
                Sexp::string(package.as_str()),
                match target {
                    WorkerTarget::New => kw("new"),
                    WorkerTarget::Ref(w) => worker(w),
                },
                Sexp::Int(*id as i64),
            ],
            Message::Interrupt { worker: w } => vec![kw("interrupt"), worker(w)],
            Message::ReadStringReply {
                worker: w,
                tag,
                text,
            } => vec![
                kw("return-string"),
                worker(w),
                Sexp::Int(*tag as i64),
                Sexp::string(text.as_str()),
            ],
            Message::WorkerAssigned { id, worker: w } => {
                vec![kw("worker-assigned"), Sexp::Int(*id as i64), worker(w)]
            }
            Message::Return {
                worker: w,
                value,
                id,
            } => {
                let value = match value {
                    ReturnValue::Ok(v) => Sexp::List(vec![kw("ok"), v.clone()]),
                    ReturnValue::Abort(reason) => {
                        Sexp::List(vec![kw("abort"), Sexp::opt_string(reason.clone())])
                    }
                };
                vec![kw("return"), worker(w), value, Sexp::Int(*id as i64)]
            }
            Message::DebugEnter {
                worker: w,
                level,
                description,
                restarts,
                backtrace,
            } => vec![
                kw("debug"),
                worker(w),
                Sexp::Int(*level as i64),
                Sexp::string(description.as_str()),
                Sexp::list(
                    restarts
                        .iter()
                        .map(|r| {
                            Sexp::List(vec![
                                Sexp::string(r.name.as_str()),
                                Sexp::string(r.description.as_str()),
                            ])
                        })
                        .collect(),
                ),
                Sexp::list(
                    backtrace
                        .iter()
                        .map(|f| {
                            Sexp::List(vec![
                                Sexp::Int(f.index as i64),
                                Sexp::string(f.description.as_str()),
                            ])
                        })
                        .collect(),
                ),
            ],
            Message::DebugActivate { worker: w, level } => {
                vec![kw("debug-activate"), worker(w), Sexp::Int(*level as i64)]
            }
            Message::DebugReturn { worker: w, level } => {
                vec![kw("debug-return"), worker(w), Sexp::Int(*level as i64)]
            }
            Message::DebugConditionText { worker: w, text } => {
                vec![kw("debug-condition"), worker(w), Sexp::string(text.as_str())]
            }
            Message::ReadStringRequest { worker: w, tag } => {
                vec![kw("read-string"), worker(w), Sexp::Int(*tag as i64)]
            }
            Message::ReadAborted { worker: w, tag } => {
                vec![kw("read-aborted"), worker(w), Sexp::Int(*tag as i64)]
            }
            Message::Output { text } => vec![kw("write-string"), Sexp::string(text.as_str())],
            Message::FeatureUpdate { features } => vec![
                kw("new-features"),
                Sexp::list(features.iter().map(|f| Sexp::string(f.as_str())).collect()),
            ],
            Message::BackgroundMessage { text } => {
                vec![kw("background-message"), Sexp::string(text.as_str())]
            }
            Message::OutputChannel { port } => {
                vec![kw("output-channel"), Sexp::Int(*port as i64)]
            }
        };

        Sexp::List(items)
    }

    pub fn from_sexp(sexp: &Sexp) -> Result<Message, ProtocolError> {
        let items = sexp
            .as_list()
            .filter(|items| !items.is_empty())
            .ok_or_else(|| malformed(format!("expected a non-empty list, got {sexp}")))?;
        let head = items[0]
            .as_keyword()
            .ok_or_else(|| malformed(format!("message must start with a keyword: {sexp}")))?;
        let mut args = Args::new(head, &items[1..]);

        let message = match head {
            "rex" => Message::Request {
                form: args.string()?,
                package: args.string()?,
                worker: args.target()?,
                id: args.unsigned()?,
            },
            "interrupt" => Message::Interrupt {
                worker: args.worker()?,
            },
            "return-string" => Message::ReadStringReply {
                worker: args.worker()?,
                tag: args.unsigned()?,
                text: args.string()?,
            },
            "worker-assigned" => Message::WorkerAssigned {
                id: args.unsigned()?,
                worker: args.worker()?,
            },
            "return" => Message::Return {
                worker: args.worker()?,
                value: args.return_value()?,
                id: args.unsigned()?,
            },
            "debug" => Message::DebugEnter {
                worker: args.worker()?,
                level: args.level()?,
                description: args.string()?,
                restarts: args
                    .list()?
                    .iter()
                    .map(|r| {
                        let mut pair = Args::new("restart", pair_items(r)?);
                        let restart = RestartDesc {
                            name: pair.string()?,
                            description: pair.string()?,
                        };
                        pair.finish()?;
                        Ok(restart)
                    })
                    .collect::<Result<_, ProtocolError>>()?,
                backtrace: args
                    .list()?
                    .iter()
                    .map(|f| {
                        let mut pair = Args::new("frame", pair_items(f)?);
                        let frame = FrameDesc {
                            index: pair.unsigned()? as usize,
                            description: pair.string()?,
                        };
                        pair.finish()?;
                        Ok(frame)
                    })
                    .collect::<Result<_, ProtocolError>>()?,
            },
            "debug-activate" => Message::DebugActivate {
                worker: args.worker()?,
                level: args.level()?,
            },
            "debug-return" => Message::DebugReturn {
                worker: args.worker()?,
                level: args.level()?,
            },
            "debug-condition" => Message::DebugConditionText {
                worker: args.worker()?,
                text: args.string()?,
            },
            "read-string" => Message::ReadStringRequest {
                worker: args.worker()?,
                tag: args.unsigned()?,
            },
            "read-aborted" => Message::ReadAborted {
                worker: args.worker()?,
                tag: args.unsigned()?,
            },
            "write-string" => Message::Output {
                text: args.string()?,
            },
            "new-features" => Message::FeatureUpdate {
                features: args
                    .list()?
                    .iter()
                    .map(|f| {
                        f.as_str()
                            .map(ToOwned::to_owned)
                            .ok_or_else(|| malformed(format!("feature must be a string: {f}")))
                    })
                    .collect::<Result<_, _>>()?,
            },
            "background-message" => Message::BackgroundMessage {
                text: args.string()?,
            },
            "output-channel" => Message::OutputChannel {
                port: u16::try_from(args.unsigned()?)
                    .map_err(|_| malformed("port out of range".to_string()))?,
            },
            unknown => return Err(malformed(format!("unknown message kind :{unknown}"))),
        };
        args.finish()?;

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sexp())
    }
}

fn malformed(msg: String) -> ProtocolError {
    ProtocolError::Malformed(msg)
}

fn pair_items(sexp: &Sexp) -> Result<&[Sexp], ProtocolError> {
    sexp.as_list()
        .ok_or_else(|| malformed(format!("expected a list, got {sexp}")))
}

/// Positional argument reader over a message body.
struct Args<'a> {
    kind: &'a str,
    items: &'a [Sexp],
    pos: usize,
}

impl<'a> Args<'a> {
    fn new(kind: &'a str, items: &'a [Sexp]) -> Self {
        Self {
            kind,
            items,
            pos: 0,
        }
    }

    fn next(&mut self) -> Result<&'a Sexp, ProtocolError> {
        let item = self.items.get(self.pos).ok_or_else(|| {
            malformed(format!(
                "{}: missing argument {}",
                self.kind,
                self.pos + 1
            ))
        })?;
        self.pos += 1;
        Ok(item)
    }

    fn error(&self, expected: &str, got: &Sexp) -> ProtocolError {
        malformed(format!(
            "{}: argument {} must be {expected}, got {got}",
            self.kind, self.pos
        ))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let item = self.next()?;
        item.as_str()
            .map(ToOwned::to_owned)
            .ok_or_else(|| self.error("a string", item))
    }

    fn unsigned(&mut self) -> Result<u64, ProtocolError> {
        let item = self.next()?;
        item.as_int()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| self.error("a non-negative integer", item))
    }

    fn level(&mut self) -> Result<usize, ProtocolError> {
        let item = self.next()?;
        item.as_int()
            .filter(|i| *i > 0)
            .map(|i| i as usize)
            .ok_or_else(|| self.error("a positive debug level", item))
    }

    fn worker(&mut self) -> Result<WorkerRef, ProtocolError> {
        let item = self.next()?;
        item.as_int()
            .filter(|i| *i > 0)
            .and_then(|i| u32::try_from(i).ok())
            .map(WorkerRef)
            .ok_or_else(|| self.error("a worker reference", item))
    }

    fn target(&mut self) -> Result<WorkerTarget, ProtocolError> {
        if self.items.get(self.pos).and_then(Sexp::as_keyword) == Some("new") {
            self.pos += 1;
            return Ok(WorkerTarget::New);
        }
        self.worker().map(WorkerTarget::Ref)
    }

    fn list(&mut self) -> Result<&'a [Sexp], ProtocolError> {
        let item = self.next()?;
        item.as_list().ok_or_else(|| self.error("a list", item))
    }

    fn return_value(&mut self) -> Result<ReturnValue, ProtocolError> {
        let item = self.next()?;
        let parts = item.as_list().ok_or_else(|| self.error("(:ok ..) or (:abort ..)", item))?;
        match parts {
            [status, value] if status.as_keyword() == Some("ok") => Ok(ReturnValue::Ok(value.clone())),
            [status, Sexp::Nil] if status.as_keyword() == Some("abort") => {
                Ok(ReturnValue::Abort(None))
            }
            [status, Sexp::Str(reason)] if status.as_keyword() == Some("abort") => {
                Ok(ReturnValue::Abort(Some(reason.clone())))
            }
            _ => Err(self.error("(:ok ..) or (:abort ..)", item)),
        }
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos == self.items.len() {
            return Ok(());
        }
        Err(malformed(format!(
            "{}: unexpected trailing arguments {}",
            self.kind,
            self.items[self.pos..].iter().join(" ")
        )))
    }
}
