//! Routing of client messages to workers.
use crate::error::Error;
use crate::server::connection::Session;
use crate::server::registry::ThreadRegistry;
use crate::server::worker::{self, WorkerEvent, WorkerRequest};
use crate::wire::{Message, RequestId, ReturnValue, WorkerRef, WorkerTarget};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

/// Connection-local worker identity, never reused.
pub type WorkerId = u64;

pub(super) struct WorkerHandle {
    mailbox: Sender<WorkerEvent>,
    interrupt: Arc<AtomicBool>,
}

/// Live workers of a connection.
///
/// Mailbox sends happen with this structure locked, so once a worker handle is removed no new
/// event can reach the worker.
#[derive(Default)]
pub struct Workers {
    registry: ThreadRegistry<WorkerId>,
    handles: HashMap<WorkerId, WorkerHandle>,
    pub(super) in_flight: HashMap<RequestId, WorkerRef>,
    next_id: WorkerId,
}

impl Workers {
    fn handle(&self, r: WorkerRef) -> Result<&WorkerHandle, Error> {
        let id = self.registry.lookup(r)?;
        self.handles.get(&id).ok_or(Error::RefNotFound(r))
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Remove a finished worker. Returns false if it was already gone.
    pub(super) fn release(&mut self, r: WorkerRef) -> bool {
        match self.registry.release(r) {
            Some(id) => self.handles.remove(&id).is_some(),
            None => false,
        }
    }

    /// Forget every worker and request. Dropping the mailboxes fails every blocked worker.
    ///
    /// Returns the number of requests that were still in flight.
    pub(super) fn cancel_all(&mut self) -> usize {
        for handle in self.handles.values() {
            handle.interrupt.store(true, Ordering::SeqCst);
        }
        self.handles.clear();
        self.registry.clear();
        let aborted = self.in_flight.len();
        for (id, r) in self.in_flight.drain() {
            debug!(target: "dispatch", "request {id} on worker {r} aborted by teardown");
        }
        aborted
    }
}

/// Handle one message from the client.
///
/// Non-fatal errors are returned to the caller, which reports them to the client.
pub fn dispatch(session: &Arc<Session>, message: Message) -> Result<(), Error> {
    debug!(target: "dispatch", "{} from {}", message.kind(), session.peer());

    match message {
        Message::Request {
            form,
            package,
            worker: WorkerTarget::New,
            id,
        } => spawn_worker(session, WorkerRequest { form, package, id }),
        Message::Request {
            form,
            package,
            worker: WorkerTarget::Ref(r),
            id,
        } => {
            let routed = {
                let mut workers = session.workers.lock().unwrap();
                let routed = workers.handle(r).and_then(|handle| {
                    handle
                        .mailbox
                        .send(WorkerEvent::Request(WorkerRequest { form, package, id }))
                        .map_err(|_| Error::RefNotFound(r))
                });
                if routed.is_ok() {
                    workers.in_flight.insert(id, r);
                }
                routed
            };
            if let Err(e) = routed {
                session.send_return(r, ReturnValue::Abort(Some(e.to_string())), id);
            }
            Ok(())
        }
        Message::Interrupt { worker: r } => {
            let workers = session.workers.lock().unwrap();
            let handle = workers.handle(r)?;
            handle.interrupt.store(true, Ordering::SeqCst);
            _ = handle.mailbox.send(WorkerEvent::Wake);
            Ok(())
        }
        Message::ReadStringReply {
            worker: r,
            tag,
            text,
        } => {
            let workers = session.workers.lock().unwrap();
            workers
                .handle(r)?
                .mailbox
                .send(WorkerEvent::ReadReply { tag, text })
                .map_err(|_| Error::RefNotFound(r))
        }
        unexpected => {
            warn!(target: "dispatch", "unexpected {} from client {}", unexpected.kind(), session.peer());
            session.background(format!(
                "unexpected message :{} from client ignored",
                unexpected.kind()
            ));
            Ok(())
        }
    }
}

fn spawn_worker(session: &Arc<Session>, request: WorkerRequest) -> Result<(), Error> {
    let (tx, rx) = mpsc::channel();
    let interrupt = Arc::new(AtomicBool::new(false));
    let id = request.id;

    let r = {
        let mut workers = session.workers.lock().unwrap();
        let worker_id = workers.next_id;
        workers.next_id += 1;
        let r = workers.registry.allocate(worker_id);
        workers.handles.insert(
            worker_id,
            WorkerHandle {
                mailbox: tx,
                interrupt: interrupt.clone(),
            },
        );
        workers.in_flight.insert(id, r);
        r
    };
    // the client must learn the binding before anything the worker says
    session.notify(Message::WorkerAssigned { id, worker: r });

    let worker_session = session.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("slink-worker-{r}"))
        .spawn(move || worker::run(worker_session, r, rx, interrupt, request));
    if let Err(e) = spawned {
        warn!(target: "dispatch", "spawn worker {r}: {e}");
        session.workers.lock().unwrap().release(r);
        session.send_return(r, ReturnValue::Abort(Some(format!("spawn worker: {e}"))), id);
    }
    Ok(())
}
