//! Client side of the protocol: a connection driving a [`ClientStateMachine`].
pub mod console;
pub mod state;

use crate::error::Error;
use crate::wire::{codec, Message, RequestId, ReturnValue, WorkerRef};
use log::{debug, error, warn};
use state::{ClientStateMachine, Continuation, DebuggerView, Effect};
use std::io::{BufReader, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Client events. Called from the connection reader thread, never with internal locks held.
pub trait ClientHook: Send + Sync {
    /// A request finished. `worker` is `None` if the request never reached a worker.
    fn on_return(&self, worker: Option<WorkerRef>, id: RequestId, value: &ReturnValue);

    fn on_debug_enter(&self, worker: WorkerRef, view: &DebuggerView);

    fn on_debug_activate(&self, worker: WorkerRef, level: usize);

    fn on_debug_return(&self, worker: WorkerRef, level: usize);

    /// The worker waits for a line of input, answer with [`Client::return_string`].
    fn on_read_string(&self, worker: WorkerRef, tag: u64);

    fn on_output(&self, text: &str);

    fn on_read_aborted(&self, _worker: WorkerRef, _tag: u64) {}

    fn on_debug_text(&self, _worker: WorkerRef, _text: &str) {}

    fn on_features(&self, _features: &[String]) {}

    fn on_background(&self, _text: &str) {}

    /// The connection is gone, `error` is set if it did not end cleanly.
    fn on_disconnect(&self, _error: Option<&Error>) {}
}

struct Shared {
    writer: Mutex<TcpStream>,
    state: Mutex<ClientStateMachine>,
    hook: Arc<dyn ClientHook>,
    connected: AtomicBool,
    features: Mutex<Vec<String>>,
    peer: SocketAddr,
}

impl Shared {
    fn send(&self, message: &Message) -> Result<(), Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        let mut writer = self.writer.lock().unwrap();
        codec::write_message(&mut *writer, message)?;
        Ok(())
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            self.run_effect(effect);
        }
    }

    fn run_effect(&self, effect: Effect) {
        match effect {
            Effect::Returned {
                worker,
                id,
                value,
                continuation,
            } => {
                if let (Some(continuation), ReturnValue::Ok(v)) = (continuation, &value) {
                    continuation(v.clone());
                }
                self.hook.on_return(worker, id, &value);
            }
            Effect::EnterDebugger { worker, view } => self.hook.on_debug_enter(worker, &view),
            Effect::ActivateDebugger { worker, level } => {
                self.hook.on_debug_activate(worker, level)
            }
            Effect::ExitDebugger { worker, level } => self.hook.on_debug_return(worker, level),
            Effect::DebugText { worker, text } => self.hook.on_debug_text(worker, &text),
            Effect::ReadString { worker, tag } => self.hook.on_read_string(worker, tag),
            Effect::ReadAborted { worker, tag } => self.hook.on_read_aborted(worker, tag),
            Effect::Output(text) => self.hook.on_output(&text),
            Effect::Features(features) => {
                self.hook.on_features(&features);
                *self.features.lock().unwrap() = features;
            }
            Effect::Background(text) => self.hook.on_background(&text),
            Effect::OutputChannel(port) => {
                let addr = SocketAddr::new(self.peer.ip(), port);
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        let hook = self.hook.clone();
                        thread::spawn(move || stream_output(stream, hook));
                    }
                    Err(e) => warn!(target: "client", "connect output channel {addr}: {e}"),
                }
            }
        }
    }
}

/// Forward raw output from the side channel, keeping multibyte characters whole.
fn stream_output(mut stream: TcpStream, hook: Arc<dyn ClientHook>) {
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = vec![];
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        let valid = match std::str::from_utf8(&pending) {
            Ok(_) => pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => pending.len(),
        };
        let rest = pending.split_off(valid);
        hook.on_output(&String::from_utf8_lossy(&pending));
        pending = rest;
    }
    if !pending.is_empty() {
        hook.on_output(&String::from_utf8_lossy(&pending));
    }
}

pub struct Client {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl Client {
    pub fn connect(addr: impl ToSocketAddrs, hook: Arc<dyn ClientHook>) -> Result<Self, Error> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);

        let shared = Arc::new(Shared {
            writer: Mutex::new(stream),
            state: Mutex::new(ClientStateMachine::new()),
            hook,
            connected: AtomicBool::new(true),
            features: Mutex::default(),
            peer,
        });

        let reader_shared = shared.clone();
        let reader = thread::Builder::new()
            .name("slink-client-reader".to_string())
            .spawn(move || read_loop(reader_shared, reader))?;

        Ok(Self {
            shared,
            reader: Some(reader),
        })
    }

    /// Send an evaluation request and return its id.
    ///
    /// `worker` selects a worker waiting at a debugger prompt for a nested evaluation.
    /// The continuation runs only if the request returns a value.
    pub fn evaluate(
        &self,
        form: &str,
        package: &str,
        worker: Option<WorkerRef>,
        continuation: Option<Continuation>,
    ) -> Result<RequestId, Error> {
        if !self.is_connected() {
            return Err(Error::ConnectionClosed);
        }
        let (id, message) = self
            .shared
            .state
            .lock()
            .unwrap()
            .evaluate(form, package, worker, continuation)?;
        self.shared.send(&message)?;
        Ok(id)
    }

    pub fn interrupt(&self, worker: WorkerRef) -> Result<(), Error> {
        let message = self.shared.state.lock().unwrap().interrupt(worker);
        self.shared.send(&message)
    }

    pub fn return_string(&self, worker: WorkerRef, tag: u64, text: &str) -> Result<(), Error> {
        let message = self
            .shared
            .state
            .lock()
            .unwrap()
            .return_string(worker, tag, text)?;
        self.shared.send(&message)
    }

    /// Inspect the state machine.
    pub fn with_state<T>(&self, f: impl FnOnce(&ClientStateMachine) -> T) -> T {
        f(&self.shared.state.lock().unwrap())
    }

    pub fn features(&self) -> Vec<String> {
        self.shared.features.lock().unwrap().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Close the connection and wait for the reader thread.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Ok(writer) = self.shared.writer.lock() {
            _ = writer.shutdown(Shutdown::Both);
        }
        if let Some(reader) = self.reader.take() {
            _ = reader.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_loop(shared: Arc<Shared>, mut reader: BufReader<TcpStream>) {
    let failure = loop {
        let message = match codec::read_message(&mut reader) {
            Ok(Some(message)) => message,
            Ok(None) => break None,
            Err(e) => break Some(Error::Protocol(e)),
        };
        debug!(target: "client", "{} from {}", message.kind(), shared.peer);

        let effects = shared.state.lock().unwrap().handle(message);
        match effects {
            Ok(effects) => shared.run_effects(effects),
            Err(e) => {
                error!(target: "client", "{e}");
                break Some(e);
            }
        }
    };

    shared.connected.store(false, Ordering::SeqCst);
    if let Ok(writer) = shared.writer.lock() {
        _ = writer.shutdown(Shutdown::Both);
    }
    let effects = shared.state.lock().unwrap().abort_all("connection closed");
    shared.run_effects(effects);
    shared.hook.on_disconnect(failure.as_ref());
}
