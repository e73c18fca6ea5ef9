//! One-shot echo over a joined session. Replies reach the owning context
//! through the UI queue.

use std::sync::Arc;

use bus_core::name::name_suffix;
use bus_core::{Message, SessionHandle};
use tracing::{debug, warn};

use crate::connection::{BusConnection, BusHandler, HandlerId};
use crate::runtime::BusHandle;
use crate::session::SessionTable;
use crate::ui::{UiEvent, UiPoster};

/// Text sent by [`PingChannel::ping`].
pub const DEFAULT_PING_TEXT: &str = "ping";

/// Characters of a sender name shown to users.
pub const SENDER_SUFFIX_LEN: usize = 10;

/// Last ten characters of `sender`, or all of it when shorter.
pub fn sender_suffix(sender: &str) -> &str {
    name_suffix(sender, SENDER_SUFFIX_LEN)
}

struct ReplyEvents {
    ui: UiPoster,
}

impl BusHandler for ReplyEvents {
    fn on_message(&self, _conn: &BusConnection, msg: &Message) {
        if let Message::PingReply { sender, text, session, .. } = msg {
            debug!(sender = %sender, session = %session, "ping reply");
            self.ui.post(UiEvent::PingReply {
                sender: sender.clone(),
                message: text.clone(),
            });
        }
    }
}

pub struct PingChannel {
    bus: BusHandle,
    sessions: SessionTable,
    handler: HandlerId,
}

impl PingChannel {
    /// Ping over sessions recorded in `sessions`.
    pub fn new(bus: &BusHandle, sessions: &SessionTable) -> Self {
        let handler = bus.connection().add_handler(Arc::new(ReplyEvents {
            ui: bus.ui().clone(),
        }));
        Self {
            bus: bus.clone(),
            sessions: sessions.clone(),
            handler,
        }
    }

    pub fn ping(&self, handle: SessionHandle, peer: &str) {
        self.ping_with(handle, peer, DEFAULT_PING_TEXT);
    }

    /// Send `text` to `peer` over `handle`. Returns without sending when the
    /// handle is zero or not a live session.
    pub fn ping_with(&self, handle: SessionHandle, peer: &str, text: &str) {
        if !handle.is_valid() {
            debug!(peer, "ping without a session, ignored");
            return;
        }
        if !self.sessions.is_live(handle) {
            debug!(session = %handle, peer, "ping on a session that is not live, ignored");
            return;
        }
        let conn = self.bus.connection();
        let msg = Message::Ping {
            serial: conn.next_serial(),
            session: handle,
            sender: conn.unique_name().to_string(),
            destination: peer.to_string(),
            text: text.to_string(),
        };
        if let Err(e) = conn.send(msg) {
            warn!(session = %handle, peer, error = %e, "ping not sent");
        }
    }
}

impl Drop for PingChannel {
    fn drop(&mut self) {
        self.bus.connection().remove_handler(self.handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_of_short_and_long_names() {
        assert_eq!(sender_suffix("test.peer"), "test.peer");
        assert_eq!(sender_suffix(":0123abcd.17"), "123abcd.17");
        assert_eq!(sender_suffix(""), "");
        assert_eq!(sender_suffix("peer.été.café"), "r.été.café");
    }
}
