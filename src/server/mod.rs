//! Interaction server: accepts editor connections and serves them with a [`Runtime`].
//!
//! Every connection gets its own reader thread, and every outermost request its own worker
//! thread. Connections share nothing but the runtime.
pub mod connection;
pub mod debug;
pub mod dispatch;
pub mod operation;
pub mod registry;
pub mod worker;

use crate::config::Config;
use crate::runtime::Runtime;
use anyhow::Context;
use connection::{Connection, ConnectionState, Session};
use log::{debug, info, warn};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

pub struct Server {
    listener: TcpListener,
    runtime: Arc<dyn Runtime>,
    config: Arc<Config>,
    sessions: Arc<Mutex<Vec<Weak<Session>>>>,
}

impl Server {
    /// Bind the configured listen address.
    pub fn bind(config: Config, runtime: Arc<dyn Runtime>) -> anyhow::Result<Self> {
        let listener =
            TcpListener::bind(&config.listen).with_context(|| format!("bind {}", config.listen))?;
        Ok(Self {
            listener,
            runtime,
            config: Arc::new(config),
            sessions: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for closing every live connection from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sessions: self.sessions.clone(),
        }
    }

    /// Accept connections forever, or until the first connection ends if `oneshot` is set.
    pub fn run(&self, oneshot: bool) -> anyhow::Result<()> {
        info!(target: "dispatch", "listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(v) => v,
                Err(err) => {
                    warn!(target: "dispatch", "accept failed: {err:#}");
                    continue;
                }
            };
            info!(target: "dispatch", "client connected: {peer}");

            let connection =
                match Connection::new(stream, self.runtime.clone(), self.config.clone()) {
                    Ok(c) => c,
                    Err(err) => {
                        warn!(target: "dispatch", "failed to init connection with {peer}: {err:#}");
                        continue;
                    }
                };
            {
                let mut sessions = self.sessions.lock().unwrap();
                sessions.retain(|s| s.strong_count() > 0);
                sessions.push(Arc::downgrade(connection.session()));
            }

            if oneshot {
                serve(connection, peer);
                return Ok(());
            }
            thread::Builder::new()
                .name(format!("slink-conn-{peer}"))
                .spawn(move || serve(connection, peer))?;
        }
    }
}

fn serve(connection: Connection, peer: SocketAddr) {
    match connection.run() {
        Ok(()) => info!(target: "dispatch", "client {peer} disconnected"),
        Err(err) => warn!(target: "dispatch", "connection with {peer} closed: {err:#}"),
    }
}

#[derive(Clone)]
pub struct ShutdownHandle {
    sessions: Arc<Mutex<Vec<Weak<Session>>>>,
}

impl ShutdownHandle {
    /// Tear down every live connection.
    pub fn shutdown(&self) {
        let sessions: Vec<_> = self.sessions.lock().unwrap().drain(..).collect();
        for session in sessions.iter().filter_map(Weak::upgrade) {
            if session.state() == ConnectionState::Open {
                debug!(target: "dispatch", "closing connection with {}", session.peer());
                session.shutdown();
            }
        }
    }
}
