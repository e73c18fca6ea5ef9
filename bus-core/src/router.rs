//! Host-driven daemon core: BusRouter receives connection events and decoded
//! messages from the transport and returns outbound actions. No I/O.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::name::{is_legal_bus_name, is_legal_well_known_name, unique_name};
use crate::policy::{AccessPolicy, Request, PING_INTERFACE};
use crate::protocol::{Disposition, Message, Serial, PROTOCOL_VERSION};
use crate::session::{SessionHandle, SessionPort};

/// Daemon-local identifier of one connected endpoint.
pub type EndpointId = u64;

/// Action for the transport to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Send(EndpointId, Message),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("first frame was {0}, expected Hello")]
    NotHello(&'static str),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("user {0:?} denied by policy")]
    Denied(String),
}

/// Validate the first frame of a connection; returns the claimed user.
pub fn accept_hello(msg: &Message) -> Result<&str, RouteError> {
    match msg {
        Message::Hello {
            protocol_version,
            user,
        } => {
            if *protocol_version != PROTOCOL_VERSION {
                return Err(RouteError::Version(*protocol_version));
            }
            Ok(user)
        }
        other => Err(RouteError::NotHello(other.kind())),
    }
}

#[derive(Default)]
struct Endpoint {
    unique_name: String,
    owned: BTreeSet<String>,
    advertised: BTreeSet<String>,
    finding: BTreeSet<String>,
    ports: BTreeSet<SessionPort>,
    sessions: BTreeSet<SessionHandle>,
}

/// Two-party session between a host (bound the port) and a joiner.
#[derive(Debug, Clone, Copy)]
struct Session {
    host: EndpointId,
    joiner: EndpointId,
    port: SessionPort,
}

impl Session {
    fn other(&self, ep: EndpointId) -> Option<EndpointId> {
        if ep == self.host {
            Some(self.joiner)
        } else if ep == self.joiner {
            Some(self.host)
        } else {
            None
        }
    }
}

struct PendingJoin {
    joiner: EndpointId,
    joiner_serial: Serial,
    host: EndpointId,
    port: SessionPort,
}

/// Main coordinator. Host passes events; router returns actions.
pub struct BusRouter {
    guid: String,
    policy: AccessPolicy,
    next_endpoint: EndpointId,
    next_serial: Serial,
    endpoints: HashMap<EndpointId, Endpoint>,
    unique: HashMap<String, EndpointId>,
    owners: HashMap<String, EndpointId>,
    advertised: HashMap<String, EndpointId>,
    sessions: HashMap<SessionHandle, Session>,
    pending_joins: HashMap<Serial, PendingJoin>,
}

impl BusRouter {
    pub fn new(policy: AccessPolicy) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().simple().to_string(),
            policy,
            next_endpoint: 1,
            next_serial: 1,
            endpoints: HashMap::new(),
            unique: HashMap::new(),
            owners: HashMap::new(),
            advertised: HashMap::new(),
            sessions: HashMap::new(),
            pending_joins: HashMap::new(),
        }
    }

    /// Daemon guid (32 hex chars).
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn unique_name(&self, ep: EndpointId) -> Option<&str> {
        self.endpoints.get(&ep).map(|e| e.unique_name.as_str())
    }

    /// Endpoint owning a well-known or unique name.
    pub fn resolve(&self, name: &str) -> Option<EndpointId> {
        self.owners
            .get(name)
            .or_else(|| self.unique.get(name))
            .copied()
    }

    /// New endpoint completed its hello. Returns its id and the `Welcome` to send.
    pub fn on_connected(&mut self, user: &str) -> Result<(EndpointId, Vec<Outbound>), RouteError> {
        if !self.policy.is_allowed(Request::Connect { user }) {
            warn!(user, "connection denied by policy");
            return Err(RouteError::Denied(user.to_string()));
        }
        let ep = self.next_endpoint;
        self.next_endpoint += 1;
        let name = unique_name(&self.guid[..8], ep);
        self.unique.insert(name.clone(), ep);
        self.endpoints.insert(
            ep,
            Endpoint {
                unique_name: name.clone(),
                ..Endpoint::default()
            },
        );
        info!(endpoint = ep, name = %name, user, "endpoint connected");
        let welcome = Message::Welcome {
            unique_name: name,
            guid: self.guid.clone(),
        };
        Ok((ep, vec![Outbound::Send(ep, welcome)]))
    }

    /// Endpoint went away: release everything it held and tell affected peers.
    pub fn on_disconnected(&mut self, ep: EndpointId) -> Vec<Outbound> {
        let Some(endpoint) = self.endpoints.remove(&ep) else {
            return vec![];
        };
        info!(endpoint = ep, name = %endpoint.unique_name, "endpoint disconnected");
        self.unique.remove(&endpoint.unique_name);
        let mut actions = Vec::new();
        for name in &endpoint.advertised {
            self.advertised.remove(name);
            actions.extend(self.lost_name_notices(name, ep));
        }
        for name in &endpoint.owned {
            self.owners.remove(name);
        }
        for handle in &endpoint.sessions {
            if let Some(session) = self.sessions.remove(handle) {
                if let Some(other) = session.other(ep) {
                    if let Some(e) = self.endpoints.get_mut(&other) {
                        e.sessions.remove(handle);
                    }
                    actions.push(Outbound::Send(other, Message::SessionLost { session: *handle }));
                }
            }
        }
        let orphaned: Vec<Serial> = self
            .pending_joins
            .iter()
            .filter(|(_, p)| p.joiner == ep || p.host == ep)
            .map(|(s, _)| *s)
            .collect();
        for serial in orphaned {
            if let Some(p) = self.pending_joins.remove(&serial) {
                if p.host == ep {
                    actions.push(reply(p.joiner, p.joiner_serial, Disposition::Unreachable));
                }
            }
        }
        actions
    }

    /// Process one decoded message from `ep`.
    pub fn on_message(&mut self, ep: EndpointId, msg: Message) -> Vec<Outbound> {
        if !self.endpoints.contains_key(&ep) {
            warn!(endpoint = ep, kind = msg.kind(), "message from unknown endpoint");
            return vec![];
        }
        debug!(endpoint = ep, kind = msg.kind(), "message");
        match msg {
            Message::RequestName { serial, name } => {
                let d = self.request_name(ep, &name);
                vec![reply(ep, serial, d)]
            }
            Message::ReleaseName { serial, name } => self.release_name(ep, serial, &name),
            Message::AdvertiseName { serial, name } => self.advertise_name(ep, serial, name),
            Message::CancelAdvertiseName { serial, name } => {
                if self.advertised.get(&name) == Some(&ep) {
                    let mut actions = vec![reply(ep, serial, Disposition::Success)];
                    actions.extend(self.cancel_advertise(ep, &name));
                    actions
                } else {
                    vec![reply(ep, serial, Disposition::Failed)]
                }
            }
            Message::FindAdvertisedName { serial, prefix } => self.find_name(ep, serial, prefix),
            Message::CancelFindAdvertisedName { serial, prefix } => {
                let removed = self
                    .endpoints
                    .get_mut(&ep)
                    .is_some_and(|e| e.finding.remove(&prefix));
                vec![reply(ep, serial, success_or_failed(removed))]
            }
            Message::BindSessionPort { serial, port } => {
                let added = port != 0
                    && self
                        .endpoints
                        .get_mut(&ep)
                        .is_some_and(|e| e.ports.insert(port));
                vec![reply(ep, serial, success_or_failed(added))]
            }
            Message::UnbindSessionPort { serial, port } => {
                let removed = self
                    .endpoints
                    .get_mut(&ep)
                    .is_some_and(|e| e.ports.remove(&port));
                vec![reply(ep, serial, success_or_failed(removed))]
            }
            Message::JoinSession { serial, host, port } => {
                self.join_session(ep, serial, &host, port)
            }
            Message::LeaveSession { serial, session } => self.leave_session(ep, serial, session),
            Message::Reply {
                serial,
                disposition,
                ..
            } => self.on_accept_reply(ep, serial, disposition),
            Message::Ping {
                serial,
                session,
                sender,
                destination,
                text,
            } => self.route_ping(ep, serial, session, sender, destination, text, false),
            Message::PingReply {
                serial,
                session,
                sender,
                destination,
                text,
            } => self.route_ping(ep, serial, session, sender, destination, text, true),
            other => {
                warn!(endpoint = ep, kind = other.kind(), "unexpected message from endpoint");
                vec![]
            }
        }
    }

    fn request_name(&mut self, ep: EndpointId, name: &str) -> Disposition {
        if !is_legal_well_known_name(name) {
            return Disposition::Failed;
        }
        if !self.policy.is_allowed(Request::Own { name }) {
            return Disposition::Denied;
        }
        match self.owners.get(name) {
            Some(owner) if *owner == ep => Disposition::AlreadyOwner,
            Some(_) => Disposition::Exists,
            None => {
                self.owners.insert(name.to_string(), ep);
                if let Some(e) = self.endpoints.get_mut(&ep) {
                    e.owned.insert(name.to_string());
                }
                info!(endpoint = ep, name, "name acquired");
                Disposition::PrimaryOwner
            }
        }
    }

    fn release_name(&mut self, ep: EndpointId, serial: Serial, name: &str) -> Vec<Outbound> {
        let d = match self.owners.get(name) {
            None => Disposition::NonExistent,
            Some(owner) if *owner != ep => Disposition::NotOwner,
            Some(_) => Disposition::Released,
        };
        let mut actions = vec![reply(ep, serial, d)];
        if d == Disposition::Released {
            self.owners.remove(name);
            if let Some(e) = self.endpoints.get_mut(&ep) {
                e.owned.remove(name);
            }
            if self.advertised.get(name) == Some(&ep) {
                actions.extend(self.cancel_advertise(ep, name));
            }
            info!(endpoint = ep, name, "name released");
        }
        actions
    }

    fn advertise_name(&mut self, ep: EndpointId, serial: Serial, name: String) -> Vec<Outbound> {
        let d = if !is_legal_well_known_name(&name) {
            Disposition::Failed
        } else if !self.policy.is_allowed(Request::Own { name: &name }) {
            Disposition::Denied
        } else if self.owners.get(&name) != Some(&ep) {
            Disposition::NotOwner
        } else if self.advertised.contains_key(&name) {
            Disposition::AlreadyAdvertising
        } else {
            Disposition::Success
        };
        let mut actions = vec![reply(ep, serial, d)];
        if d == Disposition::Success {
            self.advertised.insert(name.clone(), ep);
            if let Some(e) = self.endpoints.get_mut(&ep) {
                e.advertised.insert(name.clone());
            }
            for (finder, e) in &self.endpoints {
                if *finder == ep {
                    continue;
                }
                for prefix in e.finding.iter().filter(|p| name.starts_with(p.as_str())) {
                    actions.push(Outbound::Send(
                        *finder,
                        Message::FoundAdvertisedName {
                            name: name.clone(),
                            prefix: prefix.clone(),
                        },
                    ));
                }
            }
            info!(endpoint = ep, name = %name, "name advertised");
        }
        actions
    }

    fn cancel_advertise(&mut self, ep: EndpointId, name: &str) -> Vec<Outbound> {
        self.advertised.remove(name);
        if let Some(e) = self.endpoints.get_mut(&ep) {
            e.advertised.remove(name);
        }
        self.lost_name_notices(name, ep)
    }

    fn lost_name_notices(&self, name: &str, advertiser: EndpointId) -> Vec<Outbound> {
        let mut actions = Vec::new();
        for (finder, e) in &self.endpoints {
            if *finder == advertiser {
                continue;
            }
            for prefix in e.finding.iter().filter(|p| name.starts_with(p.as_str())) {
                actions.push(Outbound::Send(
                    *finder,
                    Message::LostAdvertisedName {
                        name: name.to_string(),
                        prefix: prefix.clone(),
                    },
                ));
            }
        }
        actions
    }

    fn find_name(&mut self, ep: EndpointId, serial: Serial, prefix: String) -> Vec<Outbound> {
        let inserted = self
            .endpoints
            .get_mut(&ep)
            .is_some_and(|e| e.finding.insert(prefix.clone()));
        if !inserted {
            return vec![reply(ep, serial, Disposition::AlreadyDiscovering)];
        }
        let mut found: Vec<&String> = self
            .advertised
            .iter()
            .filter(|(name, owner)| **owner != ep && name.starts_with(prefix.as_str()))
            .map(|(name, _)| name)
            .collect();
        found.sort();
        let mut actions = vec![reply(ep, serial, Disposition::Success)];
        actions.extend(found.into_iter().map(|name| {
            Outbound::Send(
                ep,
                Message::FoundAdvertisedName {
                    name: name.clone(),
                    prefix: prefix.clone(),
                },
            )
        }));
        actions
    }

    fn join_session(
        &mut self,
        ep: EndpointId,
        serial: Serial,
        host: &str,
        port: SessionPort,
    ) -> Vec<Outbound> {
        if !is_legal_bus_name(host) {
            return vec![reply(ep, serial, Disposition::Failed)];
        }
        let Some(host_ep) = self.resolve(host) else {
            debug!(endpoint = ep, host, "join: no such host");
            return vec![reply(ep, serial, Disposition::NoSession)];
        };
        if host_ep == ep {
            return vec![reply(ep, serial, Disposition::Failed)];
        }
        let bound = self
            .endpoints
            .get(&host_ep)
            .is_some_and(|e| e.ports.contains(&port));
        if !bound {
            debug!(endpoint = ep, host, port, "join: port not bound");
            return vec![reply(ep, serial, Disposition::NoSession)];
        }
        let already = self
            .sessions
            .values()
            .any(|s| s.host == host_ep && s.joiner == ep && s.port == port);
        if already {
            return vec![reply(ep, serial, Disposition::AlreadyJoined)];
        }
        let joiner = match self.endpoints.get(&ep) {
            Some(e) => e.unique_name.clone(),
            None => return vec![],
        };
        let accept_serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        self.pending_joins.insert(
            accept_serial,
            PendingJoin {
                joiner: ep,
                joiner_serial: serial,
                host: host_ep,
                port,
            },
        );
        vec![Outbound::Send(
            host_ep,
            Message::AcceptJoiner {
                serial: accept_serial,
                port,
                joiner,
            },
        )]
    }

    fn on_accept_reply(
        &mut self,
        ep: EndpointId,
        serial: Serial,
        disposition: Disposition,
    ) -> Vec<Outbound> {
        match self.pending_joins.get(&serial) {
            Some(p) if p.host == ep => {}
            _ => {
                debug!(endpoint = ep, serial, "reply with no pending join");
                return vec![];
            }
        }
        let Some(p) = self.pending_joins.remove(&serial) else {
            return vec![];
        };
        if !disposition.is_success() {
            info!(host = ep, joiner = p.joiner, port = p.port, "joiner rejected");
            return vec![reply(p.joiner, p.joiner_serial, Disposition::Rejected)];
        }
        let sessions = &self.sessions;
        let handle =
            SessionHandle::allocate(&mut rand::thread_rng(), |h| sessions.contains_key(&h));
        self.sessions.insert(
            handle,
            Session {
                host: p.host,
                joiner: p.joiner,
                port: p.port,
            },
        );
        let mut joiner_name = String::new();
        if let Some(e) = self.endpoints.get_mut(&p.joiner) {
            e.sessions.insert(handle);
            joiner_name = e.unique_name.clone();
        }
        if let Some(e) = self.endpoints.get_mut(&p.host) {
            e.sessions.insert(handle);
        }
        info!(session = %handle, host = p.host, joiner = p.joiner, port = p.port, "session joined");
        vec![
            Outbound::Send(
                p.host,
                Message::SessionJoined {
                    port: p.port,
                    session: handle,
                    joiner: joiner_name,
                },
            ),
            Outbound::Send(
                p.joiner,
                Message::Reply {
                    serial: p.joiner_serial,
                    disposition: Disposition::Success,
                    session: handle,
                },
            ),
        ]
    }

    fn leave_session(
        &mut self,
        ep: EndpointId,
        serial: Serial,
        handle: SessionHandle,
    ) -> Vec<Outbound> {
        let other = self.sessions.get(&handle).and_then(|s| s.other(ep));
        let Some(other) = other else {
            return vec![reply(ep, serial, Disposition::NoSession)];
        };
        self.sessions.remove(&handle);
        for id in [ep, other] {
            if let Some(e) = self.endpoints.get_mut(&id) {
                e.sessions.remove(&handle);
            }
        }
        info!(endpoint = ep, session = %handle, "session left");
        vec![
            reply(ep, serial, Disposition::Success),
            Outbound::Send(other, Message::SessionLost { session: handle }),
        ]
    }

    /// Keep `claimed` only if `ep` owns it; otherwise use the unique name.
    fn stamp_sender(&self, ep: EndpointId, claimed: &str) -> String {
        if self.resolve(claimed) == Some(ep) {
            claimed.to_string()
        } else {
            self.unique_name(ep).unwrap_or_default().to_string()
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn route_ping(
        &mut self,
        ep: EndpointId,
        serial: Serial,
        session: SessionHandle,
        sender: String,
        destination: String,
        text: String,
        is_reply: bool,
    ) -> Vec<Outbound> {
        let Some(peer) = self.sessions.get(&session).and_then(|s| s.other(ep)) else {
            return vec![reply(ep, serial, Disposition::NoSession)];
        };
        if self.resolve(&destination) != Some(peer) {
            return vec![reply(ep, serial, Disposition::NoSession)];
        }
        let allowed = if is_reply {
            self.policy.is_allowed(Request::SendReply)
                && self.policy.is_allowed(Request::ReceiveReply)
        } else {
            self.policy.is_allowed(Request::Send {
                interface: PING_INTERFACE,
            }) && self.policy.is_allowed(Request::Receive {
                interface: PING_INTERFACE,
            })
        };
        if !allowed {
            return vec![reply(ep, serial, Disposition::Denied)];
        }
        let sender = self.stamp_sender(ep, &sender);
        let msg = if is_reply {
            Message::PingReply {
                serial,
                session,
                sender,
                destination,
                text,
            }
        } else {
            Message::Ping {
                serial,
                session,
                sender,
                destination,
                text,
            }
        };
        vec![Outbound::Send(peer, msg)]
    }
}

fn reply(to: EndpointId, serial: Serial, disposition: Disposition) -> Outbound {
    Outbound::Send(
        to,
        Message::Reply {
            serial,
            disposition,
            session: SessionHandle::NONE,
        },
    )
}

fn success_or_failed(ok: bool) -> Disposition {
    if ok {
        Disposition::Success
    } else {
        Disposition::Failed
    }
}
