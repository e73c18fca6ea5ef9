//! C ABI for linking bus-client as a static library from Android (NDK) or other C/C++ hosts.
//! Handles are opaque pointers; functions return 0 on success and a negative status on error.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::time::Duration;

use bus_core::{AccessPolicy, ListenSpec, SessionHandle};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::launcher::{DaemonLauncher, LaunchError};
use crate::ping::PingChannel;
use crate::runtime::BusRuntime;
use crate::session::SessionClient;
use crate::ui::{PingListener, UiQueue};

const ERR_ARG: c_int = -1;
const ERR_ALREADY_RUNNING: c_int = -2;
const ERR_DAEMON: c_int = -3;

const DEFAULT_LOG: &str = "bus_client=info,bus_daemon=info,bus_core=info";

/// Ping reply callback: `(ctx, sender, message)`. Strings are valid only for the call.
pub type PingReplyCallback =
    extern "C" fn(ctx: *mut c_void, sender: *const c_char, message: *const c_char);

struct FfiClient {
    // Field order is drop order: components before the runtime they use.
    ping: PingChannel,
    session: SessionClient,
    runtime: BusRuntime,
    queue: UiQueue,
    callback: Option<PingReplyCallback>,
    ctx: *mut c_void,
}

struct CallbackListener {
    callback: Option<PingReplyCallback>,
    ctx: *mut c_void,
}

impl PingListener for CallbackListener {
    fn on_ping_reply(&mut self, sender: &str, message: &str) {
        let Some(cb) = self.callback else {
            return;
        };
        match (CString::new(sender), CString::new(message)) {
            (Ok(s), Ok(m)) => cb(self.ctx, s.as_ptr(), m.as_ptr()),
            _ => warn!("ping reply with interior NUL dropped"),
        }
    }
}

fn c_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(p) }.to_str().ok()
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`. Returns 0 if installed,
/// 1 if one was already present.
#[no_mangle]
pub extern "C" fn bus_logging_init() -> c_int {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG));
    match tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Create a launcher. Returns opaque handle.
#[no_mangle]
pub extern "C" fn bus_launcher_create() -> *mut c_void {
    Box::into_raw(Box::new(DaemonLauncher::new())) as *mut c_void
}

/// Destroy launcher, stopping its daemon. No-op if h is null.
#[no_mangle]
pub extern "C" fn bus_launcher_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut DaemonLauncher) };
}

fn launch_status(r: Result<(), LaunchError>) -> c_int {
    match r {
        Ok(()) => 0,
        Err(LaunchError::AlreadyRunning) => ERR_ALREADY_RUNNING,
        Err(e) => {
            warn!(error = %e, "daemon launch failed");
            ERR_DAEMON
        }
    }
}

/// Start a daemon listening on `listen_spec` plus the fixed TCP listener,
/// wildcard-allow policy. 0 on success, -1 bad argument, -2 already running, -3 daemon error.
#[no_mangle]
pub extern "C" fn bus_launcher_start(h: *mut c_void, listen_spec: *const c_char) -> c_int {
    if h.is_null() {
        return ERR_ARG;
    }
    let Some(spec) = c_str(listen_spec).and_then(|s| s.parse::<ListenSpec>().ok()) else {
        return ERR_ARG;
    };
    let launcher = unsafe { &mut *(h as *mut DaemonLauncher) };
    launch_status(launcher.start(spec, AccessPolicy::allow_all()).map(|_| ()))
}

/// Start a daemon from raw argv and busconfig XML. Same status codes as `bus_launcher_start`.
#[no_mangle]
pub extern "C" fn bus_run_daemon(
    h: *mut c_void,
    argv: *const *const c_char,
    argc: c_int,
    config_xml: *const c_char,
) -> c_int {
    if h.is_null() || argv.is_null() || argc <= 0 {
        return ERR_ARG;
    }
    let Some(xml) = c_str(config_xml) else {
        return ERR_ARG;
    };
    let mut args = Vec::with_capacity(argc as usize);
    for i in 0..argc as usize {
        let arg = unsafe { *argv.add(i) };
        match c_str(arg) {
            Some(a) => args.push(a.to_string()),
            None => return ERR_ARG,
        }
    }
    let launcher = unsafe { &mut *(h as *mut DaemonLauncher) };
    launch_status(launcher.run_daemon(args, xml).map(|_| ()))
}

/// Copy the daemon's client connect spec (NUL-terminated) into out_buf.
/// Returns bytes written excluding NUL, or -1 if not running or out_buf too small.
#[no_mangle]
pub extern "C" fn bus_launcher_connect_spec(
    h: *mut c_void,
    out_buf: *mut c_char,
    out_len: usize,
) -> c_int {
    if h.is_null() || out_buf.is_null() {
        return ERR_ARG;
    }
    let launcher = unsafe { &*(h as *const DaemonLauncher) };
    let Some(handle) = launcher.handle() else {
        return ERR_ARG;
    };
    let spec = handle.connect_spec().to_string();
    if spec.len() + 1 > out_len {
        return ERR_ARG;
    }
    unsafe {
        out_buf.copy_from_nonoverlapping(spec.as_ptr() as *const c_char, spec.len());
        *out_buf.add(spec.len()) = 0;
    }
    spec.len() as c_int
}

/// Stop the launcher's daemon and wait for it. 0 on success.
#[no_mangle]
pub extern "C" fn bus_launcher_stop(h: *mut c_void) -> c_int {
    if h.is_null() {
        return ERR_ARG;
    }
    let launcher = unsafe { &mut *(h as *mut DaemonLauncher) };
    launch_status(launcher.stop())
}

/// Connect a client to the daemon at `connect_spec`. `callback` (may be null)
/// runs inside `bus_client_dispatch` on the calling thread. Returns handle or null.
#[no_mangle]
pub extern "C" fn bus_client_create(
    connect_spec: *const c_char,
    callback: Option<PingReplyCallback>,
    ctx: *mut c_void,
) -> *mut c_void {
    let Some(spec) = c_str(connect_spec).and_then(|s| s.parse::<ListenSpec>().ok()) else {
        return std::ptr::null_mut();
    };
    let queue = UiQueue::new();
    let runtime = match BusRuntime::connect(&spec, queue.poster()) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "client connect failed");
            return std::ptr::null_mut();
        }
    };
    let session = SessionClient::new(runtime.handle());
    let ping = PingChannel::new(runtime.handle(), session.table());
    let client = FfiClient {
        ping,
        session,
        runtime,
        queue,
        callback,
        ctx,
    };
    Box::into_raw(Box::new(client)) as *mut c_void
}

/// Destroy client, closing its connection. No-op if h is null.
#[no_mangle]
pub extern "C" fn bus_client_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut FfiClient) };
}

/// Start discovering names with `prefix`. 0 on success, -1 on error.
#[no_mangle]
pub extern "C" fn bus_client_find_advertised_name(h: *mut c_void, prefix: *const c_char) -> c_int {
    if h.is_null() {
        return ERR_ARG;
    }
    let Some(prefix) = c_str(prefix) else {
        return ERR_ARG;
    };
    let client = unsafe { &*(h as *const FfiClient) };
    match client.session.find_advertised_name(prefix) {
        Ok(()) => 0,
        Err(e) => {
            warn!(error = %e, "find advertised name failed");
            ERR_ARG
        }
    }
}

/// Join a session to `name`. Returns the session id, or 0 on failure.
#[no_mangle]
pub extern "C" fn bus_client_join_session(h: *mut c_void, name: *const c_char) -> u32 {
    if h.is_null() {
        return 0;
    }
    let Some(name) = c_str(name) else {
        return 0;
    };
    let client = unsafe { &*(h as *const FfiClient) };
    client.session.join(name).get()
}

/// Leave session `id`. Zero or unknown ids are ignored. Returns 0, or -1 if h is null.
#[no_mangle]
pub extern "C" fn bus_client_leave_session(h: *mut c_void, id: u32) -> c_int {
    if h.is_null() {
        return ERR_ARG;
    }
    let client = unsafe { &*(h as *const FfiClient) };
    client.session.leave(SessionHandle::from_raw(id));
    0
}

/// Ping `name` over session `id`. A zero or dead id is a silent no-op.
/// Returns 0, or -1 on bad arguments.
#[no_mangle]
pub extern "C" fn bus_client_ping(h: *mut c_void, id: u32, name: *const c_char) -> c_int {
    if h.is_null() {
        return ERR_ARG;
    }
    let Some(name) = c_str(name) else {
        return ERR_ARG;
    };
    let client = unsafe { &*(h as *const FfiClient) };
    client.ping.ping(SessionHandle::from_raw(id), name);
    0
}

/// Run pending callbacks on this thread, waiting up to `timeout_ms` for the first.
/// Returns how many events ran, or -1 if h is null.
#[no_mangle]
pub extern "C" fn bus_client_dispatch(h: *mut c_void, timeout_ms: u32) -> c_int {
    if h.is_null() {
        return ERR_ARG;
    }
    let client = unsafe { &*(h as *const FfiClient) };
    let mut listener = CallbackListener {
        callback: client.callback,
        ctx: client.ctx,
    };
    let n = if timeout_ms == 0 {
        client.queue.dispatch(&mut listener)
    } else {
        client
            .queue
            .dispatch_timeout(&mut listener, Duration::from_millis(timeout_ms.into()))
    };
    c_int::try_from(n).unwrap_or(c_int::MAX)
}
