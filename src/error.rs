use crate::wire::sexp::ReadError;
use crate::wire::WorkerRef;
use std::string::FromUtf8Error;
use std::time::Duration;

/// Framing and decoding errors. Any of them poisons the byte stream: there is no
/// resynchronization marker, so the connection that produced one must be closed.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame header truncated after {0} of 3 bytes")]
    TruncatedHeader(usize),
    #[error("frame payload truncated: expected {expected} bytes, got {got}")]
    TruncatedPayload { expected: usize, got: usize },
    #[error("payload of {0} bytes exceeds the frame limit")]
    TooLarge(usize),
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("payload syntax: {0}")]
    Syntax(#[from] ReadError),
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl ProtocolError {
    /// True if the underlying read gave up because of a socket read timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::IO(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- connection level errors -----------------------------------
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("connection idle for more than {0:?}")]
    IdleTimeout(Duration),
    #[error("connection closed")]
    ConnectionClosed,

    // --------------------------------- stale or unknown entities ---------------------------------
    #[error("no worker {0}")]
    RefNotFound(WorkerRef),
    #[error("worker {worker} has no pending read with tag {tag}")]
    TagNotFound { worker: WorkerRef, tag: u64 },

    // --------------------------------- request level errors --------------------------------------
    #[error("request failed: {0}")]
    Request(String),
    #[error("debugger: {0}")]
    DebugMachine(String),

    // --------------------------------- client errors ---------------------------------------------
    #[error("client state out of sync with server: {0}")]
    Desync(String),
}

impl Error {
    /// Return a hint to a connection owner - keep serving after error or close the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::RefNotFound(_) => false,
            Error::TagNotFound { .. } => false,
            Error::Request(_) => false,
            Error::DebugMachine(_) => false,

            Error::Protocol(_) => true,
            Error::IO(_) => true,
            Error::IdleTimeout(_) => true,
            Error::ConnectionClosed => true,
            Error::Desync(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "slink", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "slink", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
