//! One endpoint connection to the daemon: hello handshake, serial/reply
//! correlation, and fan-out of unsolicited messages to registered handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bus_core::config::ListenSpec;
use bus_core::{Disposition, Message, Serial, SessionHandle, PROTOCOL_VERSION};
use bus_daemon::transport::{connect, read_message, write_message, Stream};
use tokio::io::{AsyncWriteExt, ReadHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connect: {0}")]
    Connect(#[source] std::io::Error),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("disconnected from bus")]
    Disconnected,
    #[error("call timed out")]
    Timeout,
    #[error("runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("{call} failed: {disposition:?}")]
    Call {
        call: &'static str,
        disposition: Disposition,
    },
}

/// Daemon answer to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub disposition: Disposition,
    pub session: SessionHandle,
}

impl Reply {
    /// `Ok` on a successful disposition, else `ClientError::Call`.
    pub fn ok_or_call(self, call: &'static str) -> Result<Reply, ClientError> {
        if self.disposition.is_success() {
            Ok(self)
        } else {
            Err(ClientError::Call {
                call,
                disposition: self.disposition,
            })
        }
    }
}

/// Receives messages the daemon sends without a matching call. Runs on the
/// connection's reader task: must not block.
pub trait BusHandler: Send + Sync {
    fn on_message(&self, conn: &BusConnection, msg: &Message);

    fn on_disconnected(&self) {}
}

pub type HandlerId = u64;

struct Inner {
    unique_name: String,
    guid: String,
    out: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<HashMap<Serial, oneshot::Sender<Reply>>>,
    handlers: RwLock<Vec<(HandlerId, Arc<dyn BusHandler>)>>,
    next_serial: AtomicU32,
    next_handler: AtomicU64,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap-to-clone handle to a live daemon connection.
#[derive(Clone)]
pub struct BusConnection {
    inner: Arc<Inner>,
}

impl BusConnection {
    /// Connect and complete the hello handshake. Spawns the reader and writer
    /// tasks on the current runtime.
    pub async fn connect(
        spec: &ListenSpec,
        user: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let stream = tokio::time::timeout(timeout, connect(spec))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(ClientError::Connect)?;
        let (mut reader, mut writer) = tokio::io::split(stream);
        let hello = Message::Hello {
            protocol_version: PROTOCOL_VERSION,
            user: user.to_string(),
        };
        write_message(&mut writer, &hello).await.map_err(ClientError::Connect)?;
        let welcome = tokio::time::timeout(timeout, read_message(&mut reader))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(ClientError::Connect)?;
        let (unique_name, guid) = match welcome {
            Some(Message::Welcome { unique_name, guid }) => (unique_name, guid),
            Some(other) => {
                return Err(ClientError::Handshake(format!("unexpected {}", other.kind())))
            }
            None => return Err(ClientError::Handshake("connection closed by daemon".into())),
        };
        info!(name = %unique_name, bus = %spec, "connected to bus");

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let conn = BusConnection {
            inner: Arc::new(Inner {
                unique_name,
                guid,
                out: Mutex::new(Some(tx)),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(Vec::new()),
                next_serial: AtomicU32::new(1),
                next_handler: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        };
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, &msg).await {
                    debug!(error = %e, "bus write failed");
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
        let reader_conn = conn.clone();
        tokio::spawn(async move { reader_conn.read_loop(reader).await });
        Ok(conn)
    }

    async fn read_loop(self, mut reader: ReadHalf<Stream>) {
        loop {
            match read_message(&mut reader).await {
                Ok(Some(Message::Reply {
                    serial,
                    disposition,
                    session,
                })) => {
                    let waiter = lock(&self.inner.pending).remove(&serial);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(Reply {
                                disposition,
                                session,
                            });
                        }
                        None if disposition.is_success() && session.is_valid() => {
                            // A join that completed after its caller gave up.
                            warn!(serial, session = %session, "late join reply, leaving session");
                            let leave = Message::LeaveSession {
                                serial: self.next_serial(),
                                session,
                            };
                            if let Err(e) = self.send(leave) {
                                debug!(session = %session, error = %e, "cannot leave session");
                            }
                        }
                        None => debug!(serial, ?disposition, "reply with no pending call"),
                    }
                }
                Ok(Some(msg)) => {
                    let handlers: Vec<Arc<dyn BusHandler>> = self
                        .inner
                        .handlers
                        .read()
                        .unwrap_or_else(PoisonError::into_inner)
                        .iter()
                        .map(|(_, h)| h.clone())
                        .collect();
                    for h in handlers {
                        h.on_message(&self, &msg);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "bus read failed");
                    break;
                }
            }
        }
        info!(name = %self.inner.unique_name, "disconnected from bus");
        self.inner.closed.store(true, Ordering::SeqCst);
        lock(&self.inner.out).take();
        lock(&self.inner.pending).clear();
        let handlers: Vec<Arc<dyn BusHandler>> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for h in handlers {
            h.on_disconnected();
        }
    }

    /// Unique name the daemon assigned to this endpoint.
    pub fn unique_name(&self) -> &str {
        &self.inner.unique_name
    }

    pub fn guid(&self) -> &str {
        &self.inner.guid
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn next_serial(&self) -> Serial {
        loop {
            let s = self.inner.next_serial.fetch_add(1, Ordering::Relaxed);
            if s != 0 {
                return s;
            }
        }
    }

    /// Queue a message without waiting for an answer.
    pub fn send(&self, msg: Message) -> Result<(), ClientError> {
        match lock(&self.inner.out).as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| ClientError::Disconnected),
            None => Err(ClientError::Disconnected),
        }
    }

    /// Send the message `build` makes for a fresh serial and wait for its reply.
    pub async fn call(
        &self,
        build: impl FnOnce(Serial) -> Message,
        timeout: Duration,
    ) -> Result<Reply, ClientError> {
        let serial = self.next_serial();
        let msg = build(serial);
        let kind = msg.kind();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(serial, tx);
        if let Err(e) = self.send(msg) {
            lock(&self.inner.pending).remove(&serial);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                debug!(call = kind, serial, disposition = ?reply.disposition, "reply");
                Ok(reply)
            }
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                lock(&self.inner.pending).remove(&serial);
                warn!(call = kind, serial, "call timed out");
                Err(ClientError::Timeout)
            }
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn BusHandler>) -> HandlerId {
        let id = self.inner.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    pub fn remove_handler(&self, id: HandlerId) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(h, _)| *h != id);
    }

    /// Stop sending; the daemon sees end of stream and drops the endpoint.
    pub fn close(&self) {
        lock(&self.inner.out).take();
    }
}
