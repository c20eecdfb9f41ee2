use crate::config::Config;
use crate::error::{Error, ProtocolError};
use crate::runtime::Runtime;
use crate::server::dispatch::{self, Workers};
use crate::{muted_error, weak_error};
use crate::wire::{codec, Message, RequestId, ReturnValue, WorkerRef};
use log::{debug, info, warn};
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How long the server waits for the client to connect to the output side channel.
const SIDE_CHANNEL_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Connection context shared by the reader loop and every worker of one connection.
pub struct Session {
    pub(super) runtime: Arc<dyn Runtime>,
    pub(super) config: Arc<Config>,
    pub(super) workers: Mutex<Workers>,
    peer: SocketAddr,
    writer: Mutex<Option<TcpStream>>,
    output: Mutex<Option<TcpStream>>,
    state: Mutex<ConnectionState>,
    cancelled: AtomicBool,
}

impl Session {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        runtime: Arc<dyn Runtime>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            runtime,
            config,
            workers: Mutex::new(Workers::default()),
            peer,
            writer: Mutex::new(Some(stream)),
            output: Mutex::new(None),
            state: Mutex::new(ConnectionState::Open),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// True once teardown has started, workers must stop at the next safe point.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Write one message. Frames are written whole, concurrent senders are serialized.
    pub fn send(&self, message: &Message) -> Result<(), Error> {
        let mut writer = self.writer.lock().unwrap();
        let stream = writer.as_mut().ok_or(Error::ConnectionClosed)?;
        codec::write_message(stream, message)?;
        Ok(())
    }

    /// Send a message, losing it quietly if the connection is already gone.
    pub fn notify(&self, message: Message) {
        if let Err(e) = self.send(&message) {
            debug!(target: "dispatch", "drop {} for {}: {e}", message.kind(), self.peer);
        }
    }

    /// Answer a request. Every request gets exactly one answer through here.
    pub fn send_return(&self, worker: WorkerRef, value: ReturnValue, id: RequestId) {
        self.workers.lock().unwrap().in_flight.remove(&id);
        self.notify(Message::Return { worker, value, id });
    }

    pub fn background(&self, text: impl Into<String>) {
        self.notify(Message::BackgroundMessage { text: text.into() });
    }

    /// Forward worker output to the side channel if there is one, or as an `Output` message.
    pub fn write_output(&self, text: &str) {
        {
            let mut output = self.output.lock().unwrap();
            if let Some(stream) = output.as_mut() {
                let written = stream
                    .write_all(text.as_bytes())
                    .and_then(|_| stream.flush());
                if weak_error!(written, "output channel:").is_some() {
                    return;
                }
                // side channel is broken, fall back to the main socket
                *output = None;
            }
        }
        self.notify(Message::Output {
            text: text.to_string(),
        });
    }

    /// Open the dedicated output channel, fall back to `Output` messages if the client never
    /// connects.
    fn open_side_channel(&self) -> Result<(), Error> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        self.send(&Message::OutputChannel { port })?;

        let deadline = Instant::now() + SIDE_CHANNEL_ACCEPT_TIMEOUT;
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    *self.output.lock().unwrap() = Some(stream);
                    debug!(target: "dispatch", "output channel on port {port} for {}", self.peer);
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        warn!(target: "dispatch", "client {} never connected to the output channel", self.peer);
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Tear the connection down. Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ConnectionState::Open {
                return;
            }
            *state = ConnectionState::Closing;
        }
        self.cancelled.store(true, Ordering::SeqCst);

        let aborted = {
            let mut workers = self.workers.lock().unwrap();
            workers.cancel_all()
        };
        if aborted > 0 {
            info!(target: "dispatch", "connection {} closed with {aborted} requests in flight", self.peer);
        }

        if let Some(stream) = self.writer.lock().unwrap().take() {
            muted_error!(stream.shutdown(Shutdown::Both), "shutdown socket:");
        }
        if let Some(stream) = self.output.lock().unwrap().take() {
            muted_error!(stream.shutdown(Shutdown::Both), "shutdown output channel:");
        }

        *self.state.lock().unwrap() = ConnectionState::Closed;
    }
}

/// Server side of one client connection.
pub struct Connection {
    session: Arc<Session>,
    reader: BufReader<TcpStream>,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        runtime: Arc<dyn Runtime>,
        config: Arc<Config>,
    ) -> Result<Self, Error> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(config.idle_timeout())?;
        let peer = stream.peer_addr()?;
        let reader = BufReader::new(stream.try_clone()?);
        let session = Arc::new(Session::new(stream, peer, runtime, config));
        Ok(Self { session, reader })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Serve the connection until the peer goes away or the stream breaks.
    pub fn run(mut self) -> Result<(), Error> {
        let result = self.serve();
        self.session.shutdown();
        result
    }

    fn serve(&mut self) -> Result<(), Error> {
        if self.session.config.dedicated_output {
            self.session.open_side_channel()?;
        }
        self.session.send(&Message::FeatureUpdate {
            features: self.session.runtime.features(),
        })?;

        loop {
            let message = match codec::read_message(&mut self.reader) {
                Ok(Some(message)) => message,
                Ok(None) => return Ok(()),
                Err(e) if e.is_timeout() => {
                    let timeout = self.session.config.idle_timeout().unwrap_or_default();
                    return Err(Error::IdleTimeout(timeout));
                }
                Err(ProtocolError::IO(_)) if self.session.is_cancelled() => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = dispatch::dispatch(&self.session, message) {
                if e.is_fatal() {
                    return Err(e);
                }
                self.session.background(e.to_string());
            }
        }
    }
}
