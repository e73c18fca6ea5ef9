//! Access policy: ordered allow/deny rules evaluated by the router.

use std::fmt;

/// Interface carried by ping traffic; checked against send/receive rules.
pub const PING_INTERFACE: &str = "org.alljoyn.bus.samples.simple.SimpleInterface";

/// Name pattern: `*`, an exact name, or a prefix ending in `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Any,
    Exact(String),
    Prefix(String),
}

impl Pattern {
    pub fn parse(s: &str) -> Self {
        if s == "*" {
            Pattern::Any
        } else if let Some(prefix) = s.strip_suffix('*') {
            Pattern::Prefix(prefix.to_string())
        } else {
            Pattern::Exact(s.to_string())
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(e) => e == value,
            Pattern::Prefix(p) => value.starts_with(p.as_str()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => f.write_str("*"),
            Pattern::Exact(e) => f.write_str(e),
            Pattern::Prefix(p) => write!(f, "{p}*"),
        }
    }
}

/// What a rule applies to. Attribute names follow the busconfig XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    SendInterface(Pattern),
    ReceiveInterface(Pattern),
    Own(Pattern),
    User(Pattern),
    SendRequestedReply(bool),
    ReceiveRequestedReply(bool),
}

impl Matcher {
    /// XML attribute name and value for this matcher.
    pub fn attribute(&self) -> (&'static str, String) {
        match self {
            Matcher::SendInterface(p) => ("send_interface", p.to_string()),
            Matcher::ReceiveInterface(p) => ("receive_interface", p.to_string()),
            Matcher::Own(p) => ("own", p.to_string()),
            Matcher::User(p) => ("user", p.to_string()),
            Matcher::SendRequestedReply(b) => ("send_requested_reply", b.to_string()),
            Matcher::ReceiveRequestedReply(b) => ("receive_requested_reply", b.to_string()),
        }
    }

    /// Build a matcher from an XML attribute. `None` for unknown attributes or bad booleans.
    pub fn from_attribute(key: &str, value: &str) -> Option<Self> {
        let flag = || match value {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        };
        Some(match key {
            "send_interface" => Matcher::SendInterface(Pattern::parse(value)),
            "receive_interface" => Matcher::ReceiveInterface(Pattern::parse(value)),
            "own" => Matcher::Own(Pattern::parse(value)),
            "user" => Matcher::User(Pattern::parse(value)),
            "send_requested_reply" => Matcher::SendRequestedReply(flag()?),
            "receive_requested_reply" => Matcher::ReceiveRequestedReply(flag()?),
            _ => return None,
        })
    }

    fn applies_to(&self, request: &Request<'_>) -> bool {
        match (self, request) {
            (Matcher::SendInterface(p), Request::Send { interface }) => p.matches(interface),
            (Matcher::ReceiveInterface(p), Request::Receive { interface }) => p.matches(interface),
            (Matcher::Own(p), Request::Own { name }) => p.matches(name),
            (Matcher::User(p), Request::Connect { user }) => p.matches(user),
            (Matcher::SendRequestedReply(b), Request::SendReply) => *b,
            (Matcher::ReceiveRequestedReply(b), Request::ReceiveReply) => *b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Allow,
    Deny,
}

impl Effect {
    pub fn element(self) -> &'static str {
        match self {
            Effect::Allow => "allow",
            Effect::Deny => "deny",
        }
    }
}

/// Rule context. Mandatory rules are evaluated after default ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Default,
    Mandatory,
}

impl Context {
    pub fn as_str(self) -> &'static str {
        match self {
            Context::Default => "default",
            Context::Mandatory => "mandatory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(Context::Default),
            "mandatory" => Some(Context::Mandatory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub context: Context,
    pub effect: Effect,
    pub matcher: Matcher,
}

/// One access check made by the router.
#[derive(Debug, Clone, Copy)]
pub enum Request<'a> {
    Connect { user: &'a str },
    Own { name: &'a str },
    Send { interface: &'a str },
    Receive { interface: &'a str },
    SendReply,
    ReceiveReply,
}

/// Ordered rule list. The last matching rule wins; no match denies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessPolicy {
    rules: Vec<PolicyRule>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wildcard allow on every matcher, as the launcher configures the daemon.
    pub fn allow_all() -> Self {
        let mut p = Self::new();
        for m in [
            Matcher::SendInterface(Pattern::Any),
            Matcher::ReceiveInterface(Pattern::Any),
            Matcher::Own(Pattern::Any),
            Matcher::User(Pattern::Any),
            Matcher::SendRequestedReply(true),
            Matcher::ReceiveRequestedReply(true),
        ] {
            p.push(Context::Default, Effect::Allow, m);
        }
        p
    }

    pub fn push(&mut self, context: Context, effect: Effect, matcher: Matcher) {
        self.rules.push(PolicyRule {
            context,
            effect,
            matcher,
        });
    }

    pub fn allow(mut self, matcher: Matcher) -> Self {
        self.push(Context::Default, Effect::Allow, matcher);
        self
    }

    pub fn deny(mut self, matcher: Matcher) -> Self {
        self.push(Context::Default, Effect::Deny, matcher);
        self
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn is_allowed(&self, request: Request<'_>) -> bool {
        let pick = |ctx: Context| {
            self.rules
                .iter()
                .rev()
                .find(|r| r.context == ctx && r.matcher.applies_to(&request))
                .map(|r| r.effect)
        };
        let effect = pick(Context::Mandatory).or_else(|| pick(Context::Default));
        effect == Some(Effect::Allow)
    }
}
