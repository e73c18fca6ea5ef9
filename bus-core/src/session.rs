//! Session handles, ports and the per-session state machine.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Port a session host binds and joiners address.
pub type SessionPort = u16;

/// Port used by the simple ping service and its clients.
pub const DEFAULT_SESSION_PORT: SessionPort = 42;

/// Opaque identifier of one joined session. Zero means "no session".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SessionHandle(u32);

impl SessionHandle {
    pub const NONE: SessionHandle = SessionHandle(0);

    pub fn from_raw(id: u32) -> Self {
        SessionHandle(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Non-zero handles are the only ones usable for send, ping or leave.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Random non-zero handle not rejected by `taken`.
    pub fn allocate<R: Rng>(rng: &mut R, mut taken: impl FnMut(SessionHandle) -> bool) -> Self {
        loop {
            let id: u32 = rng.gen();
            let handle = SessionHandle(id);
            if handle.is_valid() && !taken(handle) {
                return handle;
            }
        }
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client view of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connected(SessionHandle),
}

/// What ended a connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Left,
    Lost,
}

impl SessionState {
    /// Apply a join result. A zero handle leaves the state unconnected.
    pub fn on_join(self, handle: SessionHandle) -> Self {
        match self {
            SessionState::Unconnected if handle.is_valid() => SessionState::Connected(handle),
            other => other,
        }
    }

    /// Apply leave or disconnection for `handle`. Other handles are ignored.
    pub fn on_end(self, handle: SessionHandle, _why: SessionEnd) -> Self {
        match self {
            SessionState::Connected(h) if h == handle => SessionState::Unconnected,
            other => other,
        }
    }

    /// Handle usable for ping, or `None` when not connected.
    pub fn pingable(self) -> Option<SessionHandle> {
        match self {
            SessionState::Connected(h) => Some(h),
            SessionState::Unconnected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_none() {
        assert!(!SessionHandle::NONE.is_valid());
        assert!(!SessionHandle::default().is_valid());
        assert!(SessionHandle::from_raw(9).is_valid());
    }

    #[test]
    fn allocate_skips_zero_and_taken() {
        let mut rng = rand::thread_rng();
        let first = SessionHandle::allocate(&mut rng, |_| false);
        assert!(first.is_valid());
        let second = SessionHandle::allocate(&mut rng, |h| h == first);
        assert!(second.is_valid());
        assert_ne!(first, second);
    }

    #[test]
    fn state_machine() {
        let h = SessionHandle::from_raw(5);
        let s = SessionState::Unconnected.on_join(SessionHandle::NONE);
        assert_eq!(s, SessionState::Unconnected);
        assert_eq!(s.pingable(), None);

        let s = s.on_join(h);
        assert_eq!(s.pingable(), Some(h));
        // A second join while connected keeps the first session.
        assert_eq!(s.on_join(SessionHandle::from_raw(6)), s);
        // Ending a different session is ignored.
        assert_eq!(s.on_end(SessionHandle::from_raw(6), SessionEnd::Lost), s);

        assert_eq!(s.on_end(h, SessionEnd::Left), SessionState::Unconnected);
        assert_eq!(s.on_end(h, SessionEnd::Lost), SessionState::Unconnected);
    }
}
