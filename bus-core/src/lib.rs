//! Message bus core: configuration, access policy, wire protocol and the
//! session router. Host-driven: no I/O; host passes events and receives actions.

pub mod config;
pub mod name;
pub mod policy;
pub mod protocol;
pub mod router;
pub mod session;
pub mod wire;

pub use config::{BusConfiguration, BusConfigurationBuilder, ConfigError, Limits, ListenSpec};
pub use name::{NameState, PeerName};
pub use policy::{AccessPolicy, Matcher, Pattern};
pub use protocol::{Disposition, Message, Serial, PROTOCOL_VERSION};
pub use router::{BusRouter, EndpointId, Outbound, RouteError};
pub use session::{SessionHandle, SessionPort, SessionState, DEFAULT_SESSION_PORT};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
