#![allow(dead_code)]

use slink::config::Config;
use slink::runtime::calc::Calc;
use slink::runtime::Runtime;
use slink::server::{Server, ShutdownHandle};
use slink::wire::{codec, Message, RequestId, ReturnValue, Sexp, WorkerRef, WorkerTarget};
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: ShutdownHandle,
}

/// Start a calculator server on an ephemeral port.
pub fn start_server(config: Config) -> TestServer {
    start_server_with(config, Arc::new(Calc::new()))
}

pub fn start_server_with(config: Config, runtime: Arc<dyn Runtime>) -> TestServer {
    let config = Config {
        listen: "127.0.0.1:0".to_string(),
        ..config
    };
    let server = Server::bind(config, runtime).unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_handle();
    thread::spawn(move || server.run(false));
    TestServer { addr, shutdown }
}

pub fn start_default_server() -> TestServer {
    start_server(Config::default())
}

/// Raw protocol peer, everything the server sends is checked by hand.
pub struct WireClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl WireClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    /// Connect and consume the greeting.
    pub fn connect_ready(addr: SocketAddr) -> Self {
        let mut client = Self::connect(addr);
        assert!(matches!(client.recv(), Message::FeatureUpdate { .. }));
        client
    }

    pub fn send(&mut self, message: &Message) {
        codec::write_message(&mut self.stream, message).unwrap();
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    pub fn close_write(&self) {
        self.stream.shutdown(Shutdown::Write).unwrap();
    }

    pub fn recv(&mut self) -> Message {
        match codec::read_message(&mut self.reader) {
            Ok(Some(message)) => message,
            Ok(None) => panic!("server closed the connection"),
            Err(e) => panic!("read message: {e}"),
        }
    }

    /// Wait until the server closes the connection.
    pub fn expect_closed(&mut self) {
        loop {
            match codec::read_message(&mut self.reader) {
                Ok(Some(Message::BackgroundMessage { .. })) => continue,
                Ok(Some(message)) => panic!("expected close, got {message}"),
                Ok(None) => return,
                Err(e) if e.is_timeout() => panic!("connection still open"),
                Err(_) => return,
            }
        }
    }

    pub fn request(&mut self, form: &str, worker: WorkerTarget, id: RequestId) {
        self.send(&Message::Request {
            form: form.to_string(),
            package: "USER".to_string(),
            worker,
            id,
        });
    }

    /// Start an outermost request and return the worker bound to it.
    pub fn spawn(&mut self, form: &str, id: RequestId) -> WorkerRef {
        self.request(form, WorkerTarget::New, id);
        match self.recv() {
            Message::WorkerAssigned { id: got, worker } if got == id => worker,
            other => panic!("expected worker assignment for {id}, got {other}"),
        }
    }

    pub fn nested(&mut self, worker: WorkerRef, form: &str, id: RequestId) {
        self.request(form, WorkerTarget::Ref(worker), id);
    }

    pub fn expect(&mut self, expected: Message) {
        let got = self.recv();
        assert_eq!(got, expected);
    }

    pub fn expect_return(&mut self, worker: WorkerRef, value: ReturnValue, id: RequestId) {
        self.expect(Message::Return { worker, value, id });
    }

    pub fn expect_ok(&mut self, worker: WorkerRef, value: Sexp, id: RequestId) {
        self.expect_return(worker, ReturnValue::Ok(value), id);
    }

    pub fn expect_abort(&mut self, worker: WorkerRef, id: RequestId) {
        self.expect_return(worker, ReturnValue::Abort(None), id);
    }

    /// Expect a debugger entry and return its restarts as (name, description).
    pub fn expect_debug_enter(&mut self, worker: WorkerRef, level: usize) -> Vec<(String, String)> {
        match self.recv() {
            Message::DebugEnter {
                worker: got_worker,
                level: got_level,
                restarts,
                ..
            } => {
                assert_eq!((got_worker, got_level), (worker, level));
                restarts
                    .into_iter()
                    .map(|r| (r.name, r.description))
                    .collect()
            }
            other => panic!("expected debugger level {level}, got {other}"),
        }
    }

    pub fn expect_debug_return(&mut self, worker: WorkerRef, level: usize) {
        self.expect(Message::DebugReturn { worker, level });
    }
}

pub fn restarts(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(name, description)| (name.to_string(), description.to_string()))
        .collect()
}
