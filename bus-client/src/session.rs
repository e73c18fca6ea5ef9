//! Session client: discover advertised names, join a session to a named
//! peer, leave it again.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bus_core::name::is_legal_bus_name;
use bus_core::session::SessionEnd;
use bus_core::{Disposition, Message, PeerName, SessionHandle, SessionPort, DEFAULT_SESSION_PORT};
use tracing::{debug, info, warn};

use crate::connection::{BusConnection, BusHandler, ClientError, HandlerId};
use crate::runtime::BusHandle;
use crate::ui::{UiEvent, UiPoster};

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("{0:?} is not a legal bus name")]
    InvalidName(String),
    #[error("join refused: {0:?}")]
    Refused(Disposition),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// A known peer and whether its name is still advertised.
struct Known {
    peer: PeerName,
    advertised: bool,
}

/// Peers this client knows, keyed by name, with their joined session.
#[derive(Clone, Default)]
pub struct SessionTable {
    peers: Arc<Mutex<BTreeMap<String, Known>>>,
}

impl SessionTable {
    fn peers(&self) -> MutexGuard<'_, BTreeMap<String, Known>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True for a non-zero handle this client joined and has not left or lost.
    pub fn is_live(&self, handle: SessionHandle) -> bool {
        handle.is_valid() && self.peers().values().any(|k| k.peer.session() == handle)
    }

    pub fn peer_of(&self, handle: SessionHandle) -> Option<String> {
        if !handle.is_valid() {
            return None;
        }
        self.peers()
            .values()
            .find(|k| k.peer.session() == handle)
            .map(|k| k.peer.name().to_string())
    }

    pub fn snapshot(&self) -> Vec<PeerName> {
        self.peers().values().map(|k| k.peer.clone()).collect()
    }

    /// Record a discovered name. True if it was new.
    fn found(&self, name: &str) -> bool {
        let mut peers = self.peers();
        match peers.get_mut(name) {
            Some(k) => !std::mem::replace(&mut k.advertised, true),
            None => {
                peers.insert(
                    name.to_string(),
                    Known {
                        peer: PeerName::discovered(name),
                        advertised: true,
                    },
                );
                true
            }
        }
    }

    /// Forget a name that is no longer advertised. A peer with a session up
    /// stays until that session ends.
    fn lost(&self, name: &str) {
        let mut peers = self.peers();
        let Some(k) = peers.get_mut(name) else {
            return;
        };
        if k.peer.is_connected() {
            k.advertised = false;
        } else {
            peers.remove(name);
        }
    }

    fn joined(&self, name: &str, handle: SessionHandle) {
        self.peers()
            .entry(name.to_string())
            .or_insert_with(|| Known {
                peer: PeerName::discovered(name),
                advertised: false,
            })
            .peer
            .on_join(handle);
    }

    /// End `handle`. Returns the peer it belonged to.
    fn end(&self, handle: SessionHandle, why: SessionEnd) -> Option<String> {
        if !handle.is_valid() {
            return None;
        }
        let mut peers = self.peers();
        let (name, known) = peers.iter_mut().find(|(_, k)| k.peer.session() == handle)?;
        known.peer.on_end(handle, why);
        let name = name.clone();
        if !known.advertised {
            peers.remove(&name);
        }
        Some(name)
    }

    /// End every live session. Returns the handles that were live.
    fn end_all(&self, why: SessionEnd) -> Vec<SessionHandle> {
        let mut peers = self.peers();
        let mut ended = Vec::new();
        for known in peers.values_mut() {
            let handle = known.peer.session();
            if handle.is_valid() {
                known.peer.on_end(handle, why);
                ended.push(handle);
            }
        }
        peers.retain(|_, k| k.advertised);
        ended
    }
}

struct SessionEvents {
    table: SessionTable,
    ui: UiPoster,
}

impl BusHandler for SessionEvents {
    fn on_message(&self, _conn: &BusConnection, msg: &Message) {
        match msg {
            Message::FoundAdvertisedName { name, prefix } => {
                if self.table.found(name) {
                    info!(name = %name, prefix = %prefix, "found advertised name");
                    self.ui.post(UiEvent::FoundName { name: name.clone() });
                }
            }
            Message::LostAdvertisedName { name, .. } => {
                info!(name = %name, "lost advertised name");
                self.table.lost(name);
                self.ui.post(UiEvent::LostName { name: name.clone() });
            }
            Message::SessionLost { session } => {
                if let Some(peer) = self.table.end(*session, SessionEnd::Lost) {
                    warn!(session = %session, peer = %peer, "session lost");
                    self.ui.post(UiEvent::SessionLost { session: *session });
                }
            }
            _ => {}
        }
    }

    fn on_disconnected(&self) {
        for session in self.table.end_all(SessionEnd::Lost) {
            warn!(session = %session, "session lost with the bus connection");
            self.ui.post(UiEvent::SessionLost { session });
        }
    }
}

/// Joins and leaves sessions on behalf of the owning context.
pub struct SessionClient {
    bus: BusHandle,
    table: SessionTable,
    port: SessionPort,
    handler: HandlerId,
}

impl SessionClient {
    pub fn new(bus: &BusHandle) -> Self {
        Self::with_port(bus, DEFAULT_SESSION_PORT)
    }

    /// Client joining hosts on `port`.
    pub fn with_port(bus: &BusHandle, port: SessionPort) -> Self {
        let table = SessionTable::default();
        let handler = bus.connection().add_handler(Arc::new(SessionEvents {
            table: table.clone(),
            ui: bus.ui().clone(),
        }));
        Self {
            bus: bus.clone(),
            table,
            port,
            handler,
        }
    }

    /// Shared view of joined sessions, for components that send on them.
    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    /// Start discovering names beginning with `prefix`.
    pub fn find_advertised_name(&self, prefix: &str) -> Result<(), ClientError> {
        let prefix = prefix.to_string();
        let reply = self
            .bus
            .call(move |serial| Message::FindAdvertisedName { serial, prefix })?;
        match reply.disposition {
            Disposition::AlreadyDiscovering => Ok(()),
            _ => reply.ok_or_call("FindAdvertisedName").map(|_| ()),
        }
    }

    /// Join a session to `peer`. Returns a non-zero handle or the reason.
    pub fn try_join(&self, peer: &str) -> Result<SessionHandle, JoinError> {
        if !is_legal_bus_name(peer) {
            return Err(JoinError::InvalidName(peer.to_string()));
        }
        let host = peer.to_string();
        let port = self.port;
        let reply = self
            .bus
            .call(move |serial| Message::JoinSession { serial, host, port })?;
        if reply.disposition != Disposition::Success || !reply.session.is_valid() {
            return Err(JoinError::Refused(reply.disposition));
        }
        self.table.joined(peer, reply.session);
        info!(peer, session = %reply.session, "session joined");
        Ok(reply.session)
    }

    /// Join a session to `peer`. Zero on any failure.
    pub fn join(&self, peer: &str) -> SessionHandle {
        match self.try_join(peer) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer, error = %e, "join failed");
                SessionHandle::NONE
            }
        }
    }

    /// Leave `handle`. Zero or unknown handles are a no-op. The handle is
    /// forgotten locally whether or not the daemon call succeeds.
    pub fn leave(&self, handle: SessionHandle) {
        if !handle.is_valid() {
            debug!("leave without a session, ignored");
            return;
        }
        let Some(peer) = self.table.end(handle, SessionEnd::Left) else {
            debug!(session = %handle, "leave of unknown session, ignored");
            return;
        };
        match self
            .bus
            .call(move |serial| Message::LeaveSession { serial, session: handle })
        {
            Ok(r) if r.disposition.is_success() => {
                info!(session = %handle, peer = %peer, "session left")
            }
            Ok(r) => warn!(session = %handle, disposition = ?r.disposition, "leave refused"),
            Err(e) => warn!(session = %handle, error = %e, "leave failed"),
        }
    }

    pub fn peers(&self) -> Vec<PeerName> {
        self.table.snapshot()
    }

    pub fn is_connected(&self, handle: SessionHandle) -> bool {
        self.table.is_live(handle)
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.bus.connection().remove_handler(self.handler);
    }
}
