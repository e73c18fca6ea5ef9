//! Service side of the ping exchange: owns and advertises a well-known name,
//! hosts sessions on a port, and echoes every ping it receives.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bus_core::{Disposition, Message, SessionHandle, SessionPort};
use tracing::{debug, info, warn};

use crate::connection::{BusConnection, BusHandler, ClientError, HandlerId};
use crate::runtime::BusHandle;
use crate::ui::{UiEvent, UiPoster};

struct HostEvents {
    port: SessionPort,
    sessions: Arc<Mutex<BTreeSet<SessionHandle>>>,
    ui: UiPoster,
}

impl HostEvents {
    fn sessions(&self) -> MutexGuard<'_, BTreeSet<SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BusHandler for HostEvents {
    fn on_message(&self, conn: &BusConnection, msg: &Message) {
        match msg {
            Message::AcceptJoiner { serial, port, joiner } => {
                let disposition = if *port == self.port {
                    Disposition::Success
                } else {
                    Disposition::Rejected
                };
                debug!(joiner = %joiner, port, ?disposition, "join request");
                let reply = Message::Reply {
                    serial: *serial,
                    disposition,
                    session: SessionHandle::NONE,
                };
                if let Err(e) = conn.send(reply) {
                    warn!(error = %e, "cannot answer join request");
                }
            }
            Message::SessionJoined { port, session, joiner } if *port == self.port => {
                info!(session = %session, joiner = %joiner, "joiner admitted");
                self.sessions().insert(*session);
                self.ui.post(UiEvent::SessionJoined {
                    session: *session,
                    joiner: joiner.clone(),
                });
            }
            Message::SessionLost { session } => {
                if self.sessions().remove(session) {
                    info!(session = %session, "hosted session ended");
                    self.ui.post(UiEvent::SessionLost { session: *session });
                }
            }
            Message::Ping {
                serial,
                session,
                sender,
                destination,
                text,
            } => {
                if !self.sessions().contains(session) {
                    debug!(session = %session, "ping on a session we do not host");
                    return;
                }
                self.ui.post(UiEvent::PingReceived {
                    sender: sender.clone(),
                    message: text.clone(),
                });
                // Answer as the name we were pinged at.
                let echo = Message::PingReply {
                    serial: *serial,
                    session: *session,
                    sender: destination.clone(),
                    destination: sender.clone(),
                    text: text.clone(),
                };
                if let Err(e) = conn.send(echo) {
                    warn!(session = %session, error = %e, "cannot send ping reply");
                }
            }
            _ => {}
        }
    }

    fn on_disconnected(&self) {
        let ended = std::mem::take(&mut *self.sessions());
        for session in ended {
            warn!(session = %session, "hosted session lost with the bus connection");
            self.ui.post(UiEvent::SessionLost { session });
        }
    }
}

/// A running ping service. Stop with [`PingService::stop`].
pub struct PingService {
    bus: BusHandle,
    name: String,
    port: SessionPort,
    sessions: Arc<Mutex<BTreeSet<SessionHandle>>>,
    handler: HandlerId,
}

impl PingService {
    /// Request `name`, bind `port` and advertise `name`. Joiners on `port` are
    /// always accepted.
    pub fn start(bus: &BusHandle, name: &str, port: SessionPort) -> Result<Self, ClientError> {
        let sessions = Arc::new(Mutex::new(BTreeSet::new()));
        let handler = bus.connection().add_handler(Arc::new(HostEvents {
            port,
            sessions: sessions.clone(),
            ui: bus.ui().clone(),
        }));
        let service = Self {
            bus: bus.clone(),
            name: name.to_string(),
            port,
            sessions,
            handler,
        };
        // On error `service` drops and its handler goes with it.
        service.register()?;
        info!(name, port, "ping service started");
        Ok(service)
    }

    fn register(&self) -> Result<(), ClientError> {
        let name = self.name.clone();
        let reply = self
            .bus
            .call(move |serial| Message::RequestName { serial, name })?;
        if reply.disposition != Disposition::AlreadyOwner {
            reply.ok_or_call("RequestName")?;
        }
        let port = self.port;
        self.bus
            .call(move |serial| Message::BindSessionPort { serial, port })?
            .ok_or_call("BindSessionPort")?;
        let name = self.name.clone();
        self.bus
            .call(move |serial| Message::AdvertiseName { serial, name })?
            .ok_or_call("AdvertiseName")?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sessions currently hosted.
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Cancel the advertisement, unbind the port and release the name.
    pub fn stop(self) -> Result<(), ClientError> {
        let name = self.name.clone();
        self.bus
            .call(move |serial| Message::CancelAdvertiseName { serial, name })?
            .ok_or_call("CancelAdvertiseName")?;
        let port = self.port;
        self.bus
            .call(move |serial| Message::UnbindSessionPort { serial, port })?
            .ok_or_call("UnbindSessionPort")?;
        let name = self.name.clone();
        self.bus
            .call(move |serial| Message::ReleaseName { serial, name })?
            .ok_or_call("ReleaseName")?;
        info!(name = %self.name, "ping service stopped");
        Ok(())
    }
}

impl Drop for PingService {
    fn drop(&mut self) {
        self.bus.connection().remove_handler(self.handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::{PingListener, UiQueue};

    #[derive(Default)]
    struct Lost(Vec<SessionHandle>);

    impl PingListener for Lost {
        fn on_ping_reply(&mut self, _: &str, _: &str) {}

        fn on_session_lost(&mut self, session: SessionHandle) {
            self.0.push(session);
        }
    }

    #[test]
    fn disconnect_ends_hosted_sessions() {
        let queue = UiQueue::new();
        let sessions = Arc::new(Mutex::new(BTreeSet::from([
            SessionHandle::from_raw(5),
            SessionHandle::from_raw(9),
        ])));
        let host = HostEvents {
            port: 42,
            sessions: sessions.clone(),
            ui: queue.poster(),
        };

        host.on_disconnected();
        assert!(sessions.lock().unwrap().is_empty());
        let mut lost = Lost::default();
        assert_eq!(queue.dispatch(&mut lost), 2);
        assert_eq!(lost.0, vec![SessionHandle::from_raw(5), SessionHandle::from_raw(9)]);

        host.on_disconnected();
        assert_eq!(queue.dispatch(&mut lost), 0);
    }
}
