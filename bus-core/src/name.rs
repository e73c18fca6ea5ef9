//! Bus names: well-known name validation, unique names, discovered peer names.

use serde::{Deserialize, Serialize};

use crate::session::{SessionEnd, SessionHandle, SessionState};

/// Maximum length of any bus name in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// True if `name` is a legal well-known bus name: two or more dot-separated
/// elements of `[A-Za-z0-9_-]`, no element empty or starting with a digit.
pub fn is_legal_well_known_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.starts_with(':') {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        let mut chars = element.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '-' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// True if `name` has the unique-name shape `:<guid>.<n>`.
pub fn is_unique_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix(':') else {
        return false;
    };
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut parts = rest.split('.');
    let (Some(guid), Some(n), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    !guid.is_empty()
        && guid.chars().all(|c| c.is_ascii_alphanumeric())
        && !n.is_empty()
        && n.chars().all(|c| c.is_ascii_digit())
}

/// True if `name` is usable as a session host or ping destination.
pub fn is_legal_bus_name(name: &str) -> bool {
    is_unique_name(name) || is_legal_well_known_name(name)
}

/// Build the unique name for the `n`th endpoint of daemon `guid_short`.
pub fn unique_name(guid_short: &str, n: u64) -> String {
    format!(":{guid_short}.{n}")
}

/// Last `n` characters of `s` (the whole string when shorter). Char-boundary safe.
pub fn name_suffix(s: &str, n: usize) -> &str {
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let skip = count - n;
    match s.char_indices().nth(skip) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Connectivity of a discovered name as seen by one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameState {
    Discovered,
    Connected,
}

/// An advertised name a client has discovered, with its session if joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerName {
    name: String,
    session: SessionState,
}

impl PeerName {
    pub fn discovered(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            session: SessionState::Unconnected,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NameState {
        match self.session {
            SessionState::Connected(_) => NameState::Connected,
            SessionState::Unconnected => NameState::Discovered,
        }
    }

    /// Joined session, or `SessionHandle::NONE`.
    pub fn session(&self) -> SessionHandle {
        self.session.pingable().unwrap_or(SessionHandle::NONE)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NameState::Connected
    }

    pub fn on_join(&mut self, handle: SessionHandle) {
        self.session = self.session.on_join(handle);
    }

    pub fn on_end(&mut self, handle: SessionHandle, why: SessionEnd) {
        self.session = self.session.on_end(handle, why);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_names() {
        assert!(is_legal_well_known_name("test.peer"));
        assert!(is_legal_well_known_name("org.alljoyn.bus.samples.simple"));
        assert!(is_legal_well_known_name("a_b.c-d"));
        assert!(!is_legal_well_known_name("single"));
        assert!(!is_legal_well_known_name("a..b"));
        assert!(!is_legal_well_known_name("a.1b"));
        assert!(!is_legal_well_known_name(".a.b"));
        assert!(!is_legal_well_known_name("a.b."));
        assert!(!is_legal_well_known_name("a.b c"));
        assert!(!is_legal_well_known_name(""));
        assert!(!is_legal_well_known_name(&format!("a.{}", "b".repeat(MAX_NAME_LEN))));
    }

    #[test]
    fn unique_names() {
        let n = unique_name("a1b2c3d4", 7);
        assert_eq!(n, ":a1b2c3d4.7");
        assert!(is_unique_name(&n));
        assert!(is_legal_bus_name(&n));
        assert!(!is_unique_name("a1b2.7"));
        assert!(!is_unique_name(":a1b2"));
        assert!(!is_unique_name(":a1b2.x"));
        assert!(!is_unique_name(":.3"));
        assert!(!is_legal_well_known_name(&n));
    }

    #[test]
    fn suffix_of_short_and_long_names() {
        assert_eq!(name_suffix("test.peer", 10), "test.peer");
        assert_eq!(name_suffix("org.example.service", 10), "le.service");
        assert_eq!(name_suffix("", 10), "");
        assert_eq!(name_suffix("ééééééééééé", 10), "éééééééééé");
    }

    #[test]
    fn peer_name_state_follows_session() {
        let mut p = PeerName::discovered("test.peer");
        assert_eq!(p.state(), NameState::Discovered);
        p.on_join(SessionHandle::NONE);
        assert_eq!(p.state(), NameState::Discovered);
        p.on_join(SessionHandle::from_raw(17));
        assert_eq!(p.state(), NameState::Connected);
        assert_eq!(p.session().get(), 17);
        p.on_end(SessionHandle::from_raw(17), SessionEnd::Lost);
        assert!(!p.is_connected());
        assert_eq!(p.session(), SessionHandle::NONE);
    }
}
