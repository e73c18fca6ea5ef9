//! Bus wire protocol: message types, dispositions and version.

use serde::{Deserialize, Serialize};

use crate::session::{SessionHandle, SessionPort};

/// Current protocol version. Sent in `Hello`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Serial of a bus call, unique per sending endpoint.
pub type Serial = u32;

/// Outcome of a bus call, as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    Success,
    /// RequestName: caller is now the primary owner.
    PrimaryOwner,
    AlreadyOwner,
    /// RequestName: another endpoint owns the name.
    Exists,
    /// ReleaseName: endpoint gave the name up.
    Released,
    NonExistent,
    NotOwner,
    AlreadyAdvertising,
    AlreadyDiscovering,
    /// JoinSession/LeaveSession: no such host, port or session.
    NoSession,
    /// JoinSession: host went away before answering.
    Unreachable,
    /// JoinSession: host declined the joiner.
    Rejected,
    AlreadyJoined,
    /// Access policy refused the call.
    Denied,
    Failed,
}

impl Disposition {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Disposition::Success | Disposition::PrimaryOwner | Disposition::Released
        )
    }
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First frame from a connecting endpoint.
    Hello { protocol_version: u8, user: String },
    /// Daemon answer to `Hello`: the endpoint's unique name and the daemon guid.
    Welcome { unique_name: String, guid: String },

    RequestName { serial: Serial, name: String },
    ReleaseName { serial: Serial, name: String },
    AdvertiseName { serial: Serial, name: String },
    CancelAdvertiseName { serial: Serial, name: String },
    FindAdvertisedName { serial: Serial, prefix: String },
    CancelFindAdvertisedName { serial: Serial, prefix: String },
    BindSessionPort { serial: Serial, port: SessionPort },
    UnbindSessionPort { serial: Serial, port: SessionPort },
    JoinSession { serial: Serial, host: String, port: SessionPort },
    LeaveSession { serial: Serial, session: SessionHandle },

    /// Answer to any call above, and to `AcceptJoiner`. `session` is non-zero
    /// only for a successful join.
    Reply {
        serial: Serial,
        disposition: Disposition,
        session: SessionHandle,
    },

    /// Daemon asks a session host whether to admit `joiner`. Host answers with
    /// `Reply { disposition: Success | Rejected }`.
    AcceptJoiner {
        serial: Serial,
        port: SessionPort,
        joiner: String,
    },
    /// Sent to the host once a joiner is admitted.
    SessionJoined {
        port: SessionPort,
        session: SessionHandle,
        joiner: String,
    },
    SessionLost { session: SessionHandle },
    FoundAdvertisedName { name: String, prefix: String },
    LostAdvertisedName { name: String, prefix: String },

    /// Echo request routed within a session. `sender` is stamped by the daemon.
    Ping {
        serial: Serial,
        session: SessionHandle,
        sender: String,
        destination: String,
        text: String,
    },
    /// Echo answer, routed back to the ping's sender.
    PingReply {
        serial: Serial,
        session: SessionHandle,
        sender: String,
        destination: String,
        text: String,
    },
}

impl Message {
    /// Serial of a call, for messages that carry one.
    pub fn serial(&self) -> Option<Serial> {
        match self {
            Message::RequestName { serial, .. }
            | Message::ReleaseName { serial, .. }
            | Message::AdvertiseName { serial, .. }
            | Message::CancelAdvertiseName { serial, .. }
            | Message::FindAdvertisedName { serial, .. }
            | Message::CancelFindAdvertisedName { serial, .. }
            | Message::BindSessionPort { serial, .. }
            | Message::UnbindSessionPort { serial, .. }
            | Message::JoinSession { serial, .. }
            | Message::LeaveSession { serial, .. }
            | Message::Reply { serial, .. }
            | Message::AcceptJoiner { serial, .. }
            | Message::Ping { serial, .. }
            | Message::PingReply { serial, .. } => Some(*serial),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "Hello",
            Message::Welcome { .. } => "Welcome",
            Message::RequestName { .. } => "RequestName",
            Message::ReleaseName { .. } => "ReleaseName",
            Message::AdvertiseName { .. } => "AdvertiseName",
            Message::CancelAdvertiseName { .. } => "CancelAdvertiseName",
            Message::FindAdvertisedName { .. } => "FindAdvertisedName",
            Message::CancelFindAdvertisedName { .. } => "CancelFindAdvertisedName",
            Message::BindSessionPort { .. } => "BindSessionPort",
            Message::UnbindSessionPort { .. } => "UnbindSessionPort",
            Message::JoinSession { .. } => "JoinSession",
            Message::LeaveSession { .. } => "LeaveSession",
            Message::Reply { .. } => "Reply",
            Message::AcceptJoiner { .. } => "AcceptJoiner",
            Message::SessionJoined { .. } => "SessionJoined",
            Message::SessionLost { .. } => "SessionLost",
            Message::FoundAdvertisedName { .. } => "FoundAdvertisedName",
            Message::LostAdvertisedName { .. } => "LostAdvertisedName",
            Message::Ping { .. } => "Ping",
            Message::PingReply { .. } => "PingReply",
        }
    }
}
