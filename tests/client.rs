mod wire_client;

use slink::client::state::{DebuggerView, FrameKind};
use slink::client::{Client, ClientHook};
use slink::error::Error;
use slink::wire::{RequestId, ReturnValue, Sexp, WorkerRef};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wire_client::start_default_server;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
enum Event {
    Return(Option<WorkerRef>, RequestId, ReturnValue),
    DebugEnter(WorkerRef, usize, usize),
    DebugActivate(WorkerRef, usize),
    DebugReturn(WorkerRef, usize),
    ReadString(WorkerRef, u64),
    Output(String),
    Disconnect(bool),
}

struct Recorder {
    tx: Mutex<Sender<Event>>,
}

impl Recorder {
    fn new() -> (Arc<Self>, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(Self { tx: Mutex::new(tx) }), rx)
    }

    fn push(&self, event: Event) {
        _ = self.tx.lock().unwrap().send(event);
    }
}

impl ClientHook for Recorder {
    fn on_return(&self, worker: Option<WorkerRef>, id: RequestId, value: &ReturnValue) {
        self.push(Event::Return(worker, id, value.clone()));
    }

    fn on_debug_enter(&self, worker: WorkerRef, view: &DebuggerView) {
        self.push(Event::DebugEnter(worker, view.level, view.restarts.len()));
    }

    fn on_debug_activate(&self, worker: WorkerRef, level: usize) {
        self.push(Event::DebugActivate(worker, level));
    }

    fn on_debug_return(&self, worker: WorkerRef, level: usize) {
        self.push(Event::DebugReturn(worker, level));
    }

    fn on_read_string(&self, worker: WorkerRef, tag: u64) {
        self.push(Event::ReadString(worker, tag));
    }

    fn on_output(&self, text: &str) {
        self.push(Event::Output(text.to_string()));
    }

    fn on_disconnect(&self, error: Option<&Error>) {
        self.push(Event::Disconnect(error.is_some()));
    }
}

fn next(rx: &Receiver<Event>) -> Event {
    rx.recv_timeout(EVENT_TIMEOUT).expect("client event")
}

#[test]
fn test_evaluation_with_continuation() {
    let server = start_default_server();
    let (recorder, rx) = Recorder::new();
    let client = Client::connect(server.addr, recorder).unwrap();

    let (value_tx, value_rx) = mpsc::channel();
    let id = client
        .evaluate(
            "(* 6 7)",
            "USER",
            None,
            Some(Box::new(move |value: Sexp| {
                _ = value_tx.send(value);
            })),
        )
        .unwrap();

    match next(&rx) {
        Event::Return(Some(_), got, ReturnValue::Ok(Sexp::Int(42))) => assert_eq!(got, id),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(value_rx.recv_timeout(EVENT_TIMEOUT).unwrap(), Sexp::Int(42));
    assert!(client.with_state(|state| state.is_idle()));
    assert_eq!(client.features(), vec!["calc", "integers"]);
}

#[test]
fn test_debugger_round_trip() {
    let server = start_default_server();
    let (recorder, rx) = Recorder::new();
    let client = Client::connect(server.addr, recorder).unwrap();

    let outer = client.evaluate("(/ 1 0)", "USER", None, None).unwrap();
    let Event::DebugEnter(worker, 1, 1) = next(&rx) else {
        panic!("expected debugger");
    };
    client.with_state(|state| {
        assert_eq!(state.top(worker), FrameKind::Debugging(1));
        assert_eq!(state.prompts(), vec![(worker, 1)]);
        assert!(!state.is_idle());
    });

    // a nested evaluation needs a prompt
    let unknown = client.evaluate("(+ 1 1)", "USER", Some(WorkerRef(77)), None);
    assert!(matches!(unknown, Err(Error::Request(_))));

    let nested = client
        .evaluate("(/ 2 0)", "USER", Some(worker), None)
        .unwrap();
    assert_eq!(next(&rx), Event::DebugEnter(worker, 2, 2));
    assert_eq!(client.with_state(|state| state.debug_level(worker)), 2);

    let abort = client
        .evaluate("(slink:abort)", "USER", Some(worker), None)
        .unwrap();
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), abort, ReturnValue::Abort(None))
    );
    assert_eq!(next(&rx), Event::DebugReturn(worker, 2));
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), nested, ReturnValue::Abort(None))
    );
    assert_eq!(next(&rx), Event::DebugActivate(worker, 1));

    let restart = client
        .evaluate("(slink:invoke-restart 1 0)", "USER", Some(worker), None)
        .unwrap();
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), restart, ReturnValue::Abort(None))
    );
    assert_eq!(next(&rx), Event::DebugReturn(worker, 1));
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), outer, ReturnValue::Abort(None))
    );
    assert!(client.with_state(|state| state.is_idle()));
}

#[test]
fn test_interrupt_then_nested_request() {
    let server = start_default_server();
    let (recorder, rx) = Recorder::new();
    let client = Client::connect(server.addr, recorder).unwrap();

    let outer = client.evaluate("(/ 1 0)", "USER", None, None).unwrap();
    let Event::DebugEnter(worker, 1, 1) = next(&rx) else {
        panic!("expected debugger");
    };

    // the interrupt reaches the prompt first, the request is served one level deeper
    client.interrupt(worker).unwrap();
    let nested = client
        .evaluate("(+ 1 2)", "USER", Some(worker), None)
        .unwrap();
    assert_eq!(next(&rx), Event::DebugEnter(worker, 2, 3));
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), nested, ReturnValue::Ok(Sexp::Int(3)))
    );
    assert_eq!(client.with_state(|state| state.debug_level(worker)), 2);

    let cont = client
        .evaluate("(slink:continue)", "USER", Some(worker), None)
        .unwrap();
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), cont, ReturnValue::Abort(None))
    );
    assert_eq!(next(&rx), Event::DebugReturn(worker, 2));
    assert_eq!(next(&rx), Event::DebugActivate(worker, 1));

    // a request sent just before its level closes is answered after the close
    let restart = client
        .evaluate("(slink:abort)", "USER", Some(worker), None)
        .unwrap();
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), restart, ReturnValue::Abort(None))
    );
    let late = client
        .evaluate("(+ 2 2)", "USER", Some(worker), None)
        .unwrap();
    assert_eq!(next(&rx), Event::DebugReturn(worker, 1));
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), outer, ReturnValue::Abort(None))
    );
    match next(&rx) {
        Event::Return(Some(got_worker), got, ReturnValue::Abort(Some(_))) => {
            assert_eq!((got_worker, got), (worker, late));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(client.is_connected());
    assert!(client.with_state(|state| state.is_idle()));
}

#[test]
fn test_read_string_and_output() {
    let server = start_default_server();
    let (recorder, rx) = Recorder::new();
    let client = Client::connect(server.addr, recorder).unwrap();

    let id = client
        .evaluate("(print (read-line))", "USER", None, None)
        .unwrap();
    let Event::ReadString(worker, tag) = next(&rx) else {
        panic!("expected read request");
    };
    assert_eq!(
        client.with_state(|state| state.pending_reads()),
        vec![(worker, tag)]
    );
    client.return_string(worker, tag, "ping").unwrap();
    assert!(client.with_state(|state| state.pending_reads().is_empty()));

    assert_eq!(next(&rx), Event::Output("ping\n".to_string()));
    assert_eq!(
        next(&rx),
        Event::Return(Some(worker), id, ReturnValue::Ok(Sexp::string("ping")))
    );
}

#[test]
fn test_disconnect_aborts_outstanding_requests() {
    let server = start_default_server();
    let (recorder, rx) = Recorder::new();
    let client = Client::connect(server.addr, recorder).unwrap();

    let id = client
        .evaluate("(sleep 60000)", "USER", None, None)
        .unwrap();
    // wait for the worker binding before tearing down
    while client.with_state(|state| state.busy_workers().is_empty()) {
        std::thread::sleep(Duration::from_millis(10));
    }
    server.shutdown.shutdown();

    match next(&rx) {
        Event::Return(_, got, ReturnValue::Abort(Some(reason))) => {
            assert_eq!(got, id);
            assert_eq!(reason, "connection closed");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(next(&rx), Event::Disconnect(_)));
    assert!(!client.is_connected());
    assert!(client.with_state(|state| state.is_idle()));
    assert!(matches!(
        client.evaluate("(+ 1 1)", "USER", None, None),
        Err(Error::ConnectionClosed)
    ));
}
