//! Task queue from the bus worker threads to the thread that owns
//! application state. Workers post; the owner dispatches to its listener.

use std::sync::mpsc;
use std::time::Duration;

use bus_core::SessionHandle;
use tracing::debug;

/// Something the owning context should learn about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Echo answer to one of our pings.
    PingReply { sender: String, message: String },
    /// A ping our service answered.
    PingReceived { sender: String, message: String },
    FoundName { name: String },
    LostName { name: String },
    SessionJoined { session: SessionHandle, joiner: String },
    SessionLost { session: SessionHandle },
}

/// Callbacks run on the dispatching thread. Only `on_ping_reply` is required.
pub trait PingListener {
    fn on_ping_reply(&mut self, sender: &str, message: &str);

    fn on_ping_received(&mut self, _sender: &str, _message: &str) {}

    fn on_name_found(&mut self, _name: &str) {}

    fn on_name_lost(&mut self, _name: &str) {}

    fn on_session_joined(&mut self, _session: SessionHandle, _joiner: &str) {}

    fn on_session_lost(&mut self, _session: SessionHandle) {}
}

/// Sending side, cloned into every worker-side component.
#[derive(Clone)]
pub struct UiPoster {
    tx: mpsc::Sender<UiEvent>,
}

impl UiPoster {
    /// Post an event. Returns false once the queue has been dropped.
    pub fn post(&self, event: UiEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(mpsc::SendError(event)) => {
                debug!(?event, "ui queue gone, event dropped");
                false
            }
        }
    }
}

/// Receiving side. Not `Sync`: exactly one thread dispatches.
pub struct UiQueue {
    tx: mpsc::Sender<UiEvent>,
    rx: mpsc::Receiver<UiEvent>,
}

impl Default for UiQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UiQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub fn poster(&self) -> UiPoster {
        UiPoster {
            tx: self.tx.clone(),
        }
    }

    /// Run every pending event through `listener`. Returns how many ran.
    pub fn dispatch(&self, listener: &mut dyn PingListener) -> usize {
        let mut n = 0;
        while let Ok(event) = self.rx.try_recv() {
            deliver(listener, event);
            n += 1;
        }
        n
    }

    /// Wait up to `timeout` for the first event, then drain the rest.
    pub fn dispatch_timeout(&self, listener: &mut dyn PingListener, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => {
                deliver(listener, event);
                1 + self.dispatch(listener)
            }
            Err(_) => 0,
        }
    }
}

fn deliver(listener: &mut dyn PingListener, event: UiEvent) {
    match event {
        UiEvent::PingReply { sender, message } => listener.on_ping_reply(&sender, &message),
        UiEvent::PingReceived { sender, message } => listener.on_ping_received(&sender, &message),
        UiEvent::FoundName { name } => listener.on_name_found(&name),
        UiEvent::LostName { name } => listener.on_name_lost(&name),
        UiEvent::SessionJoined { session, joiner } => listener.on_session_joined(session, &joiner),
        UiEvent::SessionLost { session } => listener.on_session_lost(session),
    }
}
