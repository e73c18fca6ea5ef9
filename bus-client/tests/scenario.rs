//! End-to-end: embedded daemon, a ping service and a client in one process.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use bus_client::ffi;
use bus_client::{
    sender_suffix, BusConnection, BusHandler, BusRuntime, DaemonLauncher, LaunchError,
    PingChannel, PingListener, PingService, SessionClient, UiQueue,
};
use bus_core::{
    AccessPolicy, Disposition, ListenSpec, Message, SessionHandle, DEFAULT_SESSION_PORT,
};

const SERVICE_NAME: &str = "test.peer";

#[derive(Default)]
struct Recorder {
    replies: Vec<(String, String, ThreadId)>,
    found: Vec<String>,
    joined: Vec<(SessionHandle, String)>,
    received: Vec<String>,
    lost: Vec<SessionHandle>,
}

impl PingListener for Recorder {
    fn on_ping_reply(&mut self, sender: &str, message: &str) {
        self.replies
            .push((sender.to_string(), message.to_string(), thread::current().id()));
    }

    fn on_ping_received(&mut self, _sender: &str, message: &str) {
        self.received.push(message.to_string());
    }

    fn on_name_found(&mut self, name: &str) {
        self.found.push(name.to_string());
    }

    fn on_session_joined(&mut self, session: SessionHandle, joiner: &str) {
        self.joined.push((session, joiner.to_string()));
    }

    fn on_session_lost(&mut self, session: SessionHandle) {
        self.lost.push(session);
    }
}

/// Dispatch on this thread until `done` holds or five seconds pass.
fn pump(queue: &UiQueue, rec: &mut Recorder, done: impl Fn(&Recorder) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(rec) && Instant::now() < deadline {
        queue.dispatch_timeout(rec, Duration::from_millis(100));
    }
}

fn start_daemon(launcher: &mut DaemonLauncher) -> ListenSpec {
    let listen: ListenSpec = "tcp:addr=0.0.0.0,port=0".parse().unwrap();
    let handle = launcher.start(listen, AccessPolicy::allow_all()).unwrap();
    handle.connect_spec().clone()
}

#[test]
fn discover_join_ping_leave() {
    let mut launcher = DaemonLauncher::new();
    let spec = start_daemon(&mut launcher);
    let again = launcher.start(spec.clone(), AccessPolicy::allow_all());
    assert!(matches!(again, Err(LaunchError::AlreadyRunning)));

    let service_queue = UiQueue::new();
    let service_rt = BusRuntime::connect(&spec, service_queue.poster()).unwrap();
    let service =
        PingService::start(service_rt.handle(), SERVICE_NAME, DEFAULT_SESSION_PORT).unwrap();

    let queue = UiQueue::new();
    let rt = BusRuntime::connect(&spec, queue.poster()).unwrap();
    let sessions = SessionClient::new(rt.handle());
    let pings = PingChannel::new(rt.handle(), sessions.table());
    let mut rec = Recorder::default();

    sessions.find_advertised_name("test").unwrap();
    pump(&queue, &mut rec, |r| r.found.iter().any(|n| n == SERVICE_NAME));
    assert!(rec.found.iter().any(|n| n == SERVICE_NAME));

    assert!(!sessions.join("nobody.here").is_valid());

    let handle = sessions.join(SERVICE_NAME);
    assert!(handle.is_valid());
    assert!(sessions.is_connected(handle));

    pings.ping(handle, SERVICE_NAME);
    pump(&queue, &mut rec, |r| !r.replies.is_empty());
    assert_eq!(rec.replies.len(), 1);
    let (sender, message, on) = &rec.replies[0];
    assert_eq!(sender_suffix(sender), SERVICE_NAME);
    assert_eq!(message, "ping");
    assert_eq!(*on, thread::current().id());

    let mut host = Recorder::default();
    pump(&service_queue, &mut host, |r| !r.received.is_empty());
    assert_eq!(host.joined.len(), 1);
    assert_eq!(host.joined[0].0, handle);
    assert_eq!(host.received, vec!["ping".to_string()]);
    assert_eq!(service.sessions(), vec![handle]);

    sessions.leave(SessionHandle::NONE);
    assert!(sessions.is_connected(handle));
    sessions.leave(handle);
    assert!(!sessions.is_connected(handle));

    pings.ping(handle, SERVICE_NAME);
    queue.dispatch_timeout(&mut rec, Duration::from_millis(300));
    assert_eq!(rec.replies.len(), 1);

    drop(pings);
    drop(sessions);
    rt.shutdown();
    service.stop().unwrap();
    service_rt.shutdown();
    launcher.stop().unwrap();
    assert!(!launcher.is_running());
}

/// Poll `done` every 20 ms for up to five seconds.
fn wait_until(done: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
    true
}

#[test]
fn service_disconnect_loses_session() {
    let mut launcher = DaemonLauncher::new();
    let spec = start_daemon(&mut launcher);

    let service_queue = UiQueue::new();
    let service_rt = BusRuntime::connect(&spec, service_queue.poster()).unwrap();
    let service =
        PingService::start(service_rt.handle(), SERVICE_NAME, DEFAULT_SESSION_PORT).unwrap();

    let queue = UiQueue::new();
    let rt = BusRuntime::connect(&spec, queue.poster()).unwrap();
    let sessions = SessionClient::new(rt.handle());
    let pings = PingChannel::new(rt.handle(), sessions.table());
    sessions.find_advertised_name("test").unwrap();
    let handle = sessions.join(SERVICE_NAME);
    assert!(handle.is_valid());

    service.stop().unwrap();
    service_rt.shutdown();

    let mut rec = Recorder::default();
    pump(&queue, &mut rec, |r| r.lost.contains(&handle));
    assert_eq!(rec.lost, vec![handle]);
    assert!(!sessions.is_connected(handle));
    assert!(sessions.peers().iter().all(|p| p.session() != handle));

    pings.ping(handle, SERVICE_NAME);
    queue.dispatch_timeout(&mut rec, Duration::from_millis(300));
    assert!(rec.replies.is_empty());

    drop(pings);
    drop(sessions);
    rt.shutdown();
    launcher.stop().unwrap();
}

#[test]
fn daemon_stop_ends_joined_sessions() {
    let mut launcher = DaemonLauncher::new();
    let spec = start_daemon(&mut launcher);

    let service_queue = UiQueue::new();
    let service_rt = BusRuntime::connect(&spec, service_queue.poster()).unwrap();
    let service =
        PingService::start(service_rt.handle(), SERVICE_NAME, DEFAULT_SESSION_PORT).unwrap();

    let queue = UiQueue::new();
    let rt = BusRuntime::connect(&spec, queue.poster()).unwrap();
    let sessions = SessionClient::new(rt.handle());
    sessions.find_advertised_name("test").unwrap();
    let handle = sessions.join(SERVICE_NAME);
    assert!(handle.is_valid());
    assert!(wait_until(|| service.sessions() == vec![handle]));

    launcher.stop().unwrap();

    assert!(wait_until(|| !rt.handle().connection().is_connected()));
    assert!(wait_until(|| !sessions.is_connected(handle)));
    assert!(sessions.peers().iter().all(|p| p.session() != handle));
    assert!(wait_until(|| service.sessions().is_empty()));

    let mut rec = Recorder::default();
    pump(&queue, &mut rec, |r| r.lost.contains(&handle));
    assert_eq!(rec.lost, vec![handle]);
    let mut host = Recorder::default();
    pump(&service_queue, &mut host, |r| r.lost.contains(&handle));
    assert!(host.lost.contains(&handle));

    drop(sessions);
    rt.shutdown();
    drop(service);
    service_rt.shutdown();
}

/// Host that records what the bus sends and holds join requests until told to answer.
#[derive(Default)]
struct SlowHost {
    pending: Mutex<Option<u32>>,
    seen: Mutex<Vec<Message>>,
}

impl BusHandler for SlowHost {
    fn on_message(&self, _conn: &BusConnection, msg: &Message) {
        if let Message::AcceptJoiner { serial, .. } = msg {
            *self.pending.lock().unwrap() = Some(*serial);
        }
        self.seen.lock().unwrap().push(msg.clone());
    }
}

#[test]
fn join_accepted_after_timeout_is_left() {
    let mut launcher = DaemonLauncher::new();
    let spec = start_daemon(&mut launcher);

    let host_queue = UiQueue::new();
    let host_rt = BusRuntime::connect(&spec, host_queue.poster()).unwrap();
    let host = Arc::new(SlowHost::default());
    host_rt.handle().connection().add_handler(host.clone());
    let bus = host_rt.handle();
    let name = SERVICE_NAME.to_string();
    bus.call(move |serial| Message::RequestName { serial, name }).unwrap();
    bus.call(|serial| Message::BindSessionPort { serial, port: DEFAULT_SESSION_PORT })
        .unwrap()
        .ok_or_call("BindSessionPort")
        .unwrap();

    let queue = UiQueue::new();
    let rt = BusRuntime::connect_with_timeout(&spec, queue.poster(), Duration::from_millis(300))
        .unwrap();
    let sessions = SessionClient::new(rt.handle());
    assert!(!sessions.join(SERVICE_NAME).is_valid());
    assert!(sessions.peers().is_empty());

    let serial = host.pending.lock().unwrap().take().unwrap();
    bus.connection()
        .send(Message::Reply {
            serial,
            disposition: Disposition::Success,
            session: SessionHandle::NONE,
        })
        .unwrap();

    let joined = || {
        host.seen.lock().unwrap().iter().find_map(|m| match m {
            Message::SessionJoined { session, .. } => Some(*session),
            _ => None,
        })
    };
    assert!(wait_until(|| joined().is_some()));
    let session = joined().unwrap();
    assert!(wait_until(|| host
        .seen
        .lock()
        .unwrap()
        .contains(&Message::SessionLost { session })));
    assert!(!sessions.is_connected(session));

    drop(sessions);
    rt.shutdown();
    host_rt.shutdown();
    launcher.stop().unwrap();
}

struct Collected {
    replies: Mutex<Vec<(String, String, ThreadId)>>,
}

extern "C" fn collect(ctx: *mut c_void, sender: *const c_char, message: *const c_char) {
    let collected = unsafe { &*(ctx as *const Collected) };
    let sender = unsafe { CStr::from_ptr(sender) }.to_string_lossy().into_owned();
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned();
    collected
        .replies
        .lock()
        .unwrap()
        .push((sender, message, thread::current().id()));
}

#[test]
fn c_abi_ping_round_trip() {
    let launcher = ffi::bus_launcher_create();
    let listen = CString::new("tcp:addr=0.0.0.0,port=0").unwrap();
    assert_eq!(ffi::bus_launcher_start(launcher, listen.as_ptr()), 0);
    let mut buf = [0 as c_char; 128];
    assert!(ffi::bus_launcher_connect_spec(launcher, buf.as_mut_ptr(), buf.len()) > 0);
    let spec_text = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().unwrap().to_string();
    let spec: ListenSpec = spec_text.parse().unwrap();

    let service_queue = UiQueue::new();
    let service_rt = BusRuntime::connect(&spec, service_queue.poster()).unwrap();
    let service =
        PingService::start(service_rt.handle(), SERVICE_NAME, DEFAULT_SESSION_PORT).unwrap();

    let collected = Box::new(Collected {
        replies: Mutex::new(Vec::new()),
    });
    let ctx = &*collected as *const Collected as *mut c_void;
    let connect = CString::new(spec_text).unwrap();
    let client = ffi::bus_client_create(connect.as_ptr(), Some(collect), ctx);
    assert!(!client.is_null());

    let prefix = CString::new("test").unwrap();
    assert_eq!(ffi::bus_client_find_advertised_name(client, prefix.as_ptr()), 0);
    let unknown = CString::new("nobody.here").unwrap();
    assert_eq!(ffi::bus_client_join_session(client, unknown.as_ptr()), 0);

    let name = CString::new(SERVICE_NAME).unwrap();
    let id = ffi::bus_client_join_session(client, name.as_ptr());
    assert_ne!(id, 0);
    assert_eq!(ffi::bus_client_ping(client, id, name.as_ptr()), 0);

    let deadline = Instant::now() + Duration::from_secs(5);
    while collected.replies.lock().unwrap().is_empty() && Instant::now() < deadline {
        ffi::bus_client_dispatch(client, 100);
    }
    {
        let replies = collected.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(sender_suffix(&replies[0].0), SERVICE_NAME);
        assert_eq!(replies[0].1, "ping");
        assert_eq!(replies[0].2, thread::current().id());
    }

    assert_eq!(ffi::bus_client_leave_session(client, 0), 0);
    assert_eq!(ffi::bus_client_leave_session(client, id), 0);
    assert_eq!(ffi::bus_client_ping(client, id, name.as_ptr()), 0);
    ffi::bus_client_dispatch(client, 300);
    assert_eq!(collected.replies.lock().unwrap().len(), 1);

    ffi::bus_client_destroy(client);
    drop(service);
    service_rt.shutdown();
    assert_eq!(ffi::bus_launcher_stop(launcher), 0);
    ffi::bus_launcher_destroy(launcher);
}
