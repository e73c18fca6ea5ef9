//! Client side of the local message bus: starts the embedded daemon, connects
//! to it, joins sessions to advertised names and exchanges pings.
//! Bus work runs on worker threads; results reach the owning thread through [`UiQueue`].

pub mod connection;
pub mod ffi;
pub mod launcher;
pub mod ping;
pub mod runtime;
pub mod service;
pub mod session;
pub mod ui;

pub use connection::{BusConnection, BusHandler, ClientError, HandlerId, Reply};
pub use launcher::{
    launch_configuration, DaemonHandle, DaemonLauncher, LaunchError, MulticastLock,
    NoopMulticastLock,
};
pub use ping::{sender_suffix, PingChannel, DEFAULT_PING_TEXT, SENDER_SUFFIX_LEN};
pub use runtime::{BusHandle, BusRuntime, DEFAULT_CALL_TIMEOUT};
pub use service::PingService;
pub use session::{JoinError, SessionClient, SessionTable};
pub use ui::{PingListener, UiEvent, UiPoster, UiQueue};
