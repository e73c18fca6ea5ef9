//! Bus configuration: listen specs, connection limits, access policy, and the
//! busconfig XML payload handed to the daemon at start.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::policy::{AccessPolicy, Context, Effect, Matcher};

/// Bus type written to `<type>`.
pub const DEFAULT_BUS_TYPE: &str = "alljoyn";

/// Port used by `tcp:` specs that leave `port` out.
pub const DEFAULT_TCP_PORT: u16 = 9955;

pub const DEFAULT_AUTH_TIMEOUT_MS: u32 = 32768;
pub const DEFAULT_MAX_INCOMPLETE_CONNECTIONS: u32 = 16;
pub const DEFAULT_MAX_COMPLETED_CONNECTIONS: u32 = 64;

/// A transport address the daemon listens on (or a client connects to).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenSpec {
    Tcp { addr: IpAddr, port: u16 },
    UnixPath(PathBuf),
    /// Linux abstract socket namespace.
    UnixAbstract(String),
}

impl ListenSpec {
    pub fn tcp(addr: IpAddr, port: u16) -> Self {
        ListenSpec::Tcp { addr, port }
    }

    /// Spec a client can connect to once the daemon bound `bound`.
    /// Unspecified addresses map to loopback; the bound port replaces port 0.
    pub fn connectable(&self, bound: Option<SocketAddr>) -> ListenSpec {
        match self {
            ListenSpec::Tcp { addr, port } => {
                let port = bound.map(|b| b.port()).unwrap_or(*port);
                let addr = match addr {
                    IpAddr::V4(a) if a.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
                    IpAddr::V6(a) if a.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
                    a => *a,
                };
                ListenSpec::Tcp { addr, port }
            }
            other => other.clone(),
        }
    }
}

impl fmt::Display for ListenSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenSpec::Tcp { addr, port } => write!(f, "tcp:addr={addr},port={port}"),
            ListenSpec::UnixPath(p) => write!(f, "unix:path={}", p.display()),
            ListenSpec::UnixAbstract(name) => write!(f, "unix:abstract={name}"),
        }
    }
}

impl FromStr for ListenSpec {
    type Err = ListenSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (transport, args) = s
            .split_once(':')
            .ok_or_else(|| ListenSpecError::MissingTransport(s.to_string()))?;
        let mut pairs = Vec::new();
        for pair in args.split(',').filter(|p| !p.is_empty()) {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| ListenSpecError::BadPair(pair.to_string()))?;
            pairs.push((k.trim(), v.trim()));
        }
        match transport {
            "tcp" => {
                let mut addr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
                let mut port = DEFAULT_TCP_PORT;
                for (k, v) in pairs {
                    match k {
                        "addr" => {
                            addr = v
                                .parse()
                                .map_err(|_| ListenSpecError::BadValue("addr", v.to_string()))?
                        }
                        "port" => {
                            port = v
                                .parse()
                                .map_err(|_| ListenSpecError::BadValue("port", v.to_string()))?
                        }
                        other => return Err(ListenSpecError::UnknownKey(other.to_string())),
                    }
                }
                Ok(ListenSpec::Tcp { addr, port })
            }
            "unix" => {
                let mut spec = None;
                for (k, v) in pairs {
                    let next = match k {
                        "path" if !v.is_empty() => ListenSpec::UnixPath(PathBuf::from(v)),
                        "abstract" if !v.is_empty() => ListenSpec::UnixAbstract(v.to_string()),
                        "path" | "abstract" => {
                            return Err(ListenSpecError::BadValue("unix", v.to_string()))
                        }
                        other => return Err(ListenSpecError::UnknownKey(other.to_string())),
                    };
                    if spec.replace(next).is_some() {
                        return Err(ListenSpecError::Conflict);
                    }
                }
                spec.ok_or(ListenSpecError::MissingKey("path or abstract"))
            }
            other => Err(ListenSpecError::UnknownTransport(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenSpecError {
    #[error("listen spec {0:?} has no transport prefix")]
    MissingTransport(String),
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),
    #[error("malformed key=value pair {0:?}")]
    BadPair(String),
    #[error("unknown key {0:?}")]
    UnknownKey(String),
    #[error("missing key {0}")]
    MissingKey(&'static str),
    #[error("bad value for {0}: {1:?}")]
    BadValue(&'static str, String),
    #[error("unix spec needs exactly one of path or abstract")]
    Conflict,
}

/// Connection limits enforced by the daemon transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Time a new connection has to complete its hello, in milliseconds.
    pub auth_timeout_ms: u32,
    pub max_incomplete_connections: u32,
    pub max_completed_connections: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            max_incomplete_connections: DEFAULT_MAX_INCOMPLETE_CONNECTIONS,
            max_completed_connections: DEFAULT_MAX_COMPLETED_CONNECTIONS,
        }
    }
}

/// `<alljoyn module="...">` block with its properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    pub name: String,
    pub properties: Vec<(String, String)>,
}

impl ModuleConfig {
    /// IP name service module on all interfaces.
    pub fn ipns_all_interfaces() -> Self {
        Self {
            name: "ipns".to_string(),
            properties: vec![("interfaces".to_string(), "*".to_string())],
        }
    }
}

/// Immutable daemon configuration. Build with [`BusConfiguration::builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfiguration {
    bus_type: String,
    listen: Vec<ListenSpec>,
    limits: Limits,
    policy: AccessPolicy,
    modules: Vec<ModuleConfig>,
}

impl BusConfiguration {
    pub fn builder() -> BusConfigurationBuilder {
        BusConfigurationBuilder::default()
    }

    pub fn bus_type(&self) -> &str {
        &self.bus_type
    }

    pub fn listen(&self) -> &[ListenSpec] {
        &self.listen
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn policy(&self) -> &AccessPolicy {
        &self.policy
    }

    pub fn modules(&self) -> &[ModuleConfig] {
        &self.modules
    }

    /// Render the busconfig XML payload.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<busconfig>");
        out.push_str(&format!("<type>{}</type>", escape(&self.bus_type)));
        for spec in &self.listen {
            out.push_str(&format!("<listen>{}</listen>", escape(&spec.to_string())));
        }
        for ctx in [Context::Default, Context::Mandatory] {
            let rules: Vec<_> = self.policy.rules().iter().filter(|r| r.context == ctx).collect();
            if rules.is_empty() {
                continue;
            }
            out.push_str(&format!("<policy context=\"{}\">", ctx.as_str()));
            for rule in rules {
                let (k, v) = rule.matcher.attribute();
                out.push_str(&format!("<{} {}=\"{}\"/>", rule.effect.element(), k, escape(&v)));
            }
            out.push_str("</policy>");
        }
        let l = self.limits;
        out.push_str(&format!("<limit auth_timeout=\"{}\"/>", l.auth_timeout_ms));
        out.push_str(&format!(
            "<limit max_incomplete_connections=\"{}\"/>",
            l.max_incomplete_connections
        ));
        out.push_str(&format!(
            "<limit max_completed_connections=\"{}\"/>",
            l.max_completed_connections
        ));
        for m in &self.modules {
            out.push_str(&format!("<alljoyn module=\"{}\">", escape(&m.name)));
            for (k, v) in &m.properties {
                out.push_str(&format!("<property {}=\"{}\"/>", k, escape(v)));
            }
            out.push_str("</alljoyn>");
        }
        out.push_str("</busconfig>");
        out
    }

    /// Parse a busconfig XML payload.
    pub fn from_xml(xml: &str) -> Result<Self, ConfigError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut parser = XmlParser::default();
        loop {
            match reader.read_event()? {
                Event::Start(e) => parser.open(&e)?,
                Event::Empty(e) => {
                    parser.open(&e)?;
                    parser.close();
                }
                Event::End(_) => parser.close(),
                Event::Text(t) => parser.text(&t.unescape()?)?,
                Event::CData(t) => parser.text(&String::from_utf8_lossy(&t.into_inner()))?,
                Event::Eof => break,
                Event::Decl(_) | Event::Comment(_) | Event::DocType(_) | Event::PI(_) => {}
            }
        }
        if !parser.saw_root {
            return Err(ConfigError::MissingRoot);
        }
        parser.builder.build()
    }
}

impl FromStr for BusConfiguration {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_xml(s)
    }
}

#[derive(Debug, Default)]
pub struct BusConfigurationBuilder {
    bus_type: Option<String>,
    listen: Vec<ListenSpec>,
    limits: Limits,
    policy: AccessPolicy,
    modules: Vec<ModuleConfig>,
}

impl BusConfigurationBuilder {
    pub fn bus_type(mut self, t: impl Into<String>) -> Self {
        self.bus_type = Some(t.into());
        self
    }

    /// Add a listen spec. Duplicates are dropped.
    pub fn listen(mut self, spec: ListenSpec) -> Self {
        if !self.listen.contains(&spec) {
            self.listen.push(spec);
        }
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn module(mut self, module: ModuleConfig) -> Self {
        self.modules.push(module);
        self
    }

    pub fn build(self) -> Result<BusConfiguration, ConfigError> {
        if self.listen.is_empty() {
            return Err(ConfigError::NoListen);
        }
        Ok(BusConfiguration {
            bus_type: self.bus_type.unwrap_or_else(|| DEFAULT_BUS_TYPE.to_string()),
            listen: self.listen,
            limits: self.limits,
            policy: self.policy,
            modules: self.modules,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("missing <busconfig> root element")]
    MissingRoot,
    #[error("unexpected element <{0}>")]
    UnknownElement(String),
    #[error("bad attribute {attr:?} on <{element}>")]
    BadAttribute { element: String, attr: String },
    #[error("unexpected text {0:?}")]
    UnexpectedText(String),
    #[error("bad limit {name}={value:?}")]
    BadLimit { name: String, value: String },
    #[error("listen: {0}")]
    Listen(#[from] ListenSpecError),
    #[error("configuration has no <listen> address")]
    NoListen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    Root,
    Type,
    Listen,
    Policy(Context),
    Rule,
    Limit,
    Module,
    Property,
}

#[derive(Default)]
struct XmlParser {
    stack: Vec<Element>,
    builder: BusConfigurationBuilder,
    saw_root: bool,
}

impl XmlParser {
    fn open(&mut self, e: &BytesStart<'_>) -> Result<(), ConfigError> {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let attrs = attributes(e)?;
        let bad_attr = |attr: &str| ConfigError::BadAttribute {
            element: name.clone(),
            attr: attr.to_string(),
        };
        let parent = self.stack.last().copied();
        let element = match (parent, name.as_str()) {
            (None, "busconfig") if !self.saw_root => {
                self.saw_root = true;
                Element::Root
            }
            (Some(Element::Root), "type") => Element::Type,
            (Some(Element::Root), "listen") => Element::Listen,
            (Some(Element::Root), "policy") => {
                let ctx = match attrs.as_slice() {
                    [] => Context::Default,
                    [(k, v)] if k == "context" => Context::parse(v).ok_or_else(|| bad_attr(k))?,
                    [(k, _), ..] => return Err(bad_attr(k)),
                };
                Element::Policy(ctx)
            }
            (Some(Element::Policy(ctx)), "allow" | "deny") => {
                let effect = if name == "allow" { Effect::Allow } else { Effect::Deny };
                for (k, v) in &attrs {
                    let matcher = Matcher::from_attribute(k, v).ok_or_else(|| bad_attr(k))?;
                    self.builder.policy.push(ctx, effect, matcher);
                }
                Element::Rule
            }
            (Some(Element::Root), "limit") => {
                for (k, v) in &attrs {
                    let n: u32 = v.parse().map_err(|_| ConfigError::BadLimit {
                        name: k.clone(),
                        value: v.clone(),
                    })?;
                    let limits = &mut self.builder.limits;
                    match k.as_str() {
                        "auth_timeout" => limits.auth_timeout_ms = n,
                        "max_incomplete_connections" => limits.max_incomplete_connections = n,
                        "max_completed_connections" => limits.max_completed_connections = n,
                        _ => {
                            return Err(ConfigError::BadLimit {
                                name: k.clone(),
                                value: v.clone(),
                            })
                        }
                    }
                }
                Element::Limit
            }
            (Some(Element::Root), "alljoyn") => {
                let module = match attrs.as_slice() {
                    [(k, v)] if k == "module" => v.clone(),
                    [(k, _), ..] => return Err(bad_attr(k)),
                    [] => return Err(bad_attr("module")),
                };
                self.builder.modules.push(ModuleConfig {
                    name: module,
                    properties: Vec::new(),
                });
                Element::Module
            }
            (Some(Element::Module), "property") => {
                if let Some(m) = self.builder.modules.last_mut() {
                    m.properties.extend(attrs);
                }
                Element::Property
            }
            _ => return Err(ConfigError::UnknownElement(name.clone())),
        };
        self.stack.push(element);
        Ok(())
    }

    fn close(&mut self) {
        self.stack.pop();
    }

    fn text(&mut self, text: &str) -> Result<(), ConfigError> {
        match self.stack.last() {
            Some(Element::Type) => self.builder.bus_type = Some(text.to_string()),
            Some(Element::Listen) => {
                let spec: ListenSpec = text.parse()?;
                if !self.builder.listen.contains(&spec) {
                    self.builder.listen.push(spec);
                }
            }
            _ => return Err(ConfigError::UnexpectedText(text.to_string())),
        }
        Ok(())
    }
}

fn attributes(e: &BytesStart<'_>) -> Result<Vec<(String, String)>, ConfigError> {
    let mut out = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        out.push((key, value));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Pattern, Request};

    const SAMPLE: &str = "<busconfig>  <type>alljoyn</type>  \
        <listen> unix:abstract=alljoyn</listen>  \
        <listen>tcp:addr=0.0.0.0,port=0</listen>  <policy context=\"default\">    \
        <allow send_interface=\"*\"/>    <allow receive_interface=\"*\"/>    <allow own=\"*\"/>    \
        <allow user=\"*\"/>    <allow send_requested_reply=\"true\"/>    \
        <allow receive_requested_reply=\"true\"/>  </policy>  <limit auth_timeout=\"32768\"/>  \
        <limit max_incomplete_connections=\"16\"/>  <limit max_completed_connections=\"64\"/>  \
        <alljoyn module=\"ipns\">    <property interfaces=\"*\"/>  </alljoyn></busconfig>";

    #[test]
    fn parse_listen_specs() {
        let tcp: ListenSpec = "tcp:addr=0.0.0.0,port=0".parse().unwrap();
        assert_eq!(tcp, ListenSpec::tcp(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        assert_eq!(tcp.to_string(), "tcp:addr=0.0.0.0,port=0");

        let default_port: ListenSpec = "tcp:addr=127.0.0.1".parse().unwrap();
        assert_eq!(
            default_port,
            ListenSpec::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_TCP_PORT)
        );

        let abs: ListenSpec = "unix:abstract=alljoyn".parse().unwrap();
        assert_eq!(abs, ListenSpec::UnixAbstract("alljoyn".into()));
        let path: ListenSpec = "unix:path=/tmp/bus.sock".parse().unwrap();
        assert_eq!(path.to_string(), "unix:path=/tmp/bus.sock");
    }

    #[test]
    fn reject_bad_listen_specs() {
        assert!(matches!(
            "tcp".parse::<ListenSpec>(),
            Err(ListenSpecError::MissingTransport(_))
        ));
        assert!(matches!(
            "bluetooth:addr=1".parse::<ListenSpec>(),
            Err(ListenSpecError::UnknownTransport(_))
        ));
        assert!(matches!(
            "tcp:addr".parse::<ListenSpec>(),
            Err(ListenSpecError::BadPair(_))
        ));
        assert!(matches!(
            "tcp:port=99999".parse::<ListenSpec>(),
            Err(ListenSpecError::BadValue("port", _))
        ));
        assert!(matches!(
            "tcp:host=x".parse::<ListenSpec>(),
            Err(ListenSpecError::UnknownKey(_))
        ));
        assert!(matches!(
            "unix:".parse::<ListenSpec>(),
            Err(ListenSpecError::MissingKey(_))
        ));
        assert!(matches!(
            "unix:path=/a,abstract=b".parse::<ListenSpec>(),
            Err(ListenSpecError::Conflict)
        ));
    }

    #[test]
    fn connectable_maps_unspecified_to_loopback() {
        let spec: ListenSpec = "tcp:addr=0.0.0.0,port=0".parse().unwrap();
        let bound: SocketAddr = "0.0.0.0:41234".parse().unwrap();
        assert_eq!(
            spec.connectable(Some(bound)).to_string(),
            "tcp:addr=127.0.0.1,port=41234"
        );
        let v6: ListenSpec = "tcp:addr=::,port=7".parse().unwrap();
        assert_eq!(v6.connectable(None).to_string(), "tcp:addr=::1,port=7");
    }

    #[test]
    fn parse_sample_payload() {
        let cfg = BusConfiguration::from_xml(SAMPLE).unwrap();
        assert_eq!(cfg.bus_type(), "alljoyn");
        assert_eq!(cfg.listen().len(), 2);
        assert_eq!(cfg.listen()[0], ListenSpec::UnixAbstract("alljoyn".into()));
        assert_eq!(cfg.limits(), Limits::default());
        assert_eq!(cfg.policy(), &AccessPolicy::allow_all());
        assert_eq!(cfg.modules(), &[ModuleConfig::ipns_all_interfaces()]);
    }

    #[test]
    fn xml_roundtrip_preserves_configuration() {
        let mut policy =
            AccessPolicy::allow_all().deny(Matcher::Own(Pattern::parse("org.secret.*")));
        policy.push(
            Context::Mandatory,
            Effect::Deny,
            Matcher::User(Pattern::Exact("mallory".into())),
        );
        let cfg = BusConfiguration::builder()
            .listen("tcp:addr=0.0.0.0,port=0".parse().unwrap())
            .listen("unix:path=/tmp/a&b.sock".parse().unwrap())
            .limits(Limits {
                auth_timeout_ms: 500,
                max_incomplete_connections: 2,
                max_completed_connections: 3,
            })
            .policy(policy)
            .module(ModuleConfig::ipns_all_interfaces())
            .build()
            .unwrap();
        let xml = cfg.to_xml();
        assert!(xml.contains("a&amp;b.sock"));
        let parsed = BusConfiguration::from_xml(&xml).unwrap();
        assert_eq!(parsed, cfg);
        assert!(!parsed.policy().is_allowed(Request::Connect { user: "mallory" }));
    }

    #[test]
    fn builder_dedups_and_requires_listen() {
        assert!(matches!(
            BusConfiguration::builder().build(),
            Err(ConfigError::NoListen)
        ));
        let spec: ListenSpec = "tcp:addr=0.0.0.0,port=0".parse().unwrap();
        let cfg = BusConfiguration::builder()
            .listen(spec.clone())
            .listen(spec)
            .build()
            .unwrap();
        assert_eq!(cfg.listen().len(), 1);
        assert_eq!(cfg.bus_type(), DEFAULT_BUS_TYPE);
    }

    #[test]
    fn reject_bad_payloads() {
        assert!(matches!(
            BusConfiguration::from_xml("<busconfig><type>alljoyn</type></busconfig>"),
            Err(ConfigError::NoListen)
        ));
        assert!(matches!(
            BusConfiguration::from_xml("<config/>"),
            Err(ConfigError::UnknownElement(_))
        ));
        assert!(matches!(BusConfiguration::from_xml(""), Err(ConfigError::MissingRoot)));
        assert!(matches!(
            BusConfiguration::from_xml(
                "<busconfig><listen>tcp:port=1</listen><limit max_sessions=\"3\"/></busconfig>"
            ),
            Err(ConfigError::BadLimit { .. })
        ));
        assert!(matches!(
            BusConfiguration::from_xml(
                "<busconfig><listen>tcp:port=1</listen><limit auth_timeout=\"soon\"/></busconfig>"
            ),
            Err(ConfigError::BadLimit { .. })
        ));
        assert!(matches!(
            BusConfiguration::from_xml(
                "<busconfig><listen>tcp:port=1</listen>\
                 <policy><allow eavesdrop=\"true\"/></policy></busconfig>"
            ),
            Err(ConfigError::BadAttribute { .. })
        ));
        assert!(matches!(
            BusConfiguration::from_xml("<busconfig><listen>ble:x=1</listen></busconfig>"),
            Err(ConfigError::Listen(_))
        ));
        assert!(matches!(
            BusConfiguration::from_xml("<busconfig>stray<listen>tcp:port=1</listen></busconfig>"),
            Err(ConfigError::UnexpectedText(_))
        ));
    }
}
