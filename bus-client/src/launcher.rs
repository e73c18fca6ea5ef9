//! Daemon launcher: builds the bus configuration, starts one daemon per
//! launcher on a dedicated thread, and holds the multicast lock while it runs.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use bus_core::config::{BusConfiguration, ConfigError, Limits, ListenSpec, ModuleConfig};
use bus_core::AccessPolicy;
use bus_daemon::{launcher_argv, resolve_configuration, Daemon, DaemonArgs, DaemonError, Settings};
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Platform resource that lets the process receive multicast traffic.
/// Held for the whole lifetime of the daemon thread.
pub trait MulticastLock: Send {
    fn acquire(&mut self);
    fn release(&mut self);
}

/// Lock for platforms that need none.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMulticastLock;

impl MulticastLock for NoopMulticastLock {
    fn acquire(&mut self) {}
    fn release(&mut self) {}
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("daemon already running")]
    AlreadyRunning,
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error("spawn daemon thread: {0}")]
    Thread(#[source] std::io::Error),
    #[error("daemon thread exited unexpectedly")]
    Exited,
}

/// Where a started daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonHandle {
    bound: Vec<ListenSpec>,
    guid: String,
}

impl DaemonHandle {
    /// Connectable spec for every listener, in configuration order.
    pub fn bound(&self) -> &[ListenSpec] {
        &self.bound
    }

    /// Spec clients use: the first listener.
    pub fn connect_spec(&self) -> &ListenSpec {
        &self.bound[0]
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }
}

struct Running {
    handle: DaemonHandle,
    stop: oneshot::Sender<()>,
    thread: JoinHandle<()>,
}

type SharedLock = Arc<Mutex<Box<dyn MulticastLock>>>;

/// Starts and stops one daemon.
pub struct DaemonLauncher {
    lock: SharedLock,
    running: Option<Running>,
}

impl Default for DaemonLauncher {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration the launcher hands the daemon: `listen` plus a fixed
/// `tcp:addr=0.0.0.0,port=0` listener, fixed limits, `policy` and the name
/// service module on all interfaces.
pub fn launch_configuration(
    listen: ListenSpec,
    policy: AccessPolicy,
) -> Result<BusConfiguration, ConfigError> {
    BusConfiguration::builder()
        .listen(listen)
        .listen(ListenSpec::tcp(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        .limits(Limits::default())
        .policy(policy)
        .module(ModuleConfig::ipns_all_interfaces())
        .build()
}

impl DaemonLauncher {
    pub fn new() -> Self {
        Self::with_multicast_lock(NoopMulticastLock)
    }

    pub fn with_multicast_lock(lock: impl MulticastLock + 'static) -> Self {
        Self {
            lock: Arc::new(Mutex::new(Box::new(lock))),
            running: None,
        }
    }

    /// Start a daemon listening on `listen`. Blocks until every listener is
    /// bound. A second start while one is running fails with `AlreadyRunning`.
    pub fn start(
        &mut self,
        listen: ListenSpec,
        policy: AccessPolicy,
    ) -> Result<DaemonHandle, LaunchError> {
        let xml = launch_configuration(listen, policy)?.to_xml();
        self.run_daemon(launcher_argv(), &xml)
    }

    /// Start a daemon from raw `argv` and busconfig payload. Blocks; call from
    /// a thread that is not running async code.
    pub fn run_daemon(
        &mut self,
        argv: Vec<String>,
        config_xml: &str,
    ) -> Result<DaemonHandle, LaunchError> {
        if self.is_running() {
            return Err(LaunchError::AlreadyRunning);
        }
        let args = DaemonArgs::from_argv(argv).map_err(DaemonError::from)?;
        let config = resolve_configuration(&args, Some(config_xml), &Settings::default())?;

        let (ready_tx, ready_rx) = oneshot::channel::<Result<DaemonHandle, DaemonError>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let lock = self.lock.clone();
        with_lock(&lock, |l| l.acquire());
        let spawned = thread::Builder::new()
            .name("bus-daemon-launcher".to_string())
            .spawn(move || {
                let _held = Held(lock);
                serve(&config, ready_tx, stop_rx);
            });
        let thread = match spawned {
            Ok(t) => t,
            Err(e) => {
                with_lock(&self.lock, |l| l.release());
                return Err(LaunchError::Thread(e));
            }
        };

        match ready_rx.blocking_recv() {
            Ok(Ok(handle)) => {
                info!(connect = %handle.connect_spec(), "daemon started");
                self.running = Some(Running {
                    handle: handle.clone(),
                    stop: stop_tx,
                    thread,
                });
                Ok(handle)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                warn!(error = %e, "daemon failed to start");
                Err(LaunchError::Daemon(e))
            }
            Err(_) => {
                let _ = thread.join();
                Err(LaunchError::Exited)
            }
        }
    }

    /// True while the daemon thread is alive. Reaps a thread that exited.
    pub fn is_running(&mut self) -> bool {
        match &self.running {
            Some(r) if r.thread.is_finished() => {
                if let Some(r) = self.running.take() {
                    let _ = r.thread.join();
                }
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn handle(&self) -> Option<&DaemonHandle> {
        self.running.as_ref().map(|r| &r.handle)
    }

    /// Stop the daemon and wait for its thread. No-op when not running.
    pub fn stop(&mut self) -> Result<(), LaunchError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        let _ = running.stop.send(());
        match running.thread.join() {
            Ok(()) => {
                info!("daemon stopped");
                Ok(())
            }
            Err(_) => Err(LaunchError::Exited),
        }
    }
}

impl Drop for DaemonLauncher {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "daemon stop failed");
        }
    }
}

fn with_lock(lock: &SharedLock, f: impl FnOnce(&mut dyn MulticastLock)) {
    let mut guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut **guard);
}

/// Releases the multicast lock when the daemon thread ends, even by panic.
struct Held(SharedLock);

impl Drop for Held {
    fn drop(&mut self) {
        with_lock(&self.0, |l| l.release());
    }
}

/// Daemon thread body: bind, report the outcome on `ready`, serve until stopped.
fn serve(
    config: &BusConfiguration,
    ready: oneshot::Sender<Result<DaemonHandle, DaemonError>>,
    stop: oneshot::Receiver<()>,
) {
    let rt = match bus_daemon::runtime() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    rt.block_on(async move {
        let daemon = match Daemon::bind(config).await {
            Ok(d) => d,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let handle = DaemonHandle {
            bound: daemon.bound().to_vec(),
            guid: daemon.guid().to_string(),
        };
        let _ = ready.send(Ok(handle));
        daemon
            .run(async {
                let _ = stop.await;
            })
            .await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingLock {
        acquired: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl MulticastLock for CountingLock {
        fn acquire(&mut self) {
            self.acquired.fetch_add(1, Ordering::SeqCst);
        }
        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn loopback(port: u16) -> ListenSpec {
        ListenSpec::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn configuration_merges_fixed_parts() {
        let cfg = launch_configuration(
            "unix:abstract=alljoyn".parse().unwrap(),
            AccessPolicy::allow_all(),
        )
        .unwrap();
        assert_eq!(cfg.listen().len(), 2);
        assert_eq!(cfg.listen()[1].to_string(), "tcp:addr=0.0.0.0,port=0");
        assert_eq!(cfg.limits(), Limits::default());
        let xml = cfg.to_xml();
        assert!(xml.contains("<limit auth_timeout=\"32768\"/>"));
        assert!(xml.contains("<alljoyn module=\"ipns\"><property interfaces=\"*\"/></alljoyn>"));
        assert_eq!(BusConfiguration::from_xml(&xml).unwrap(), cfg);
    }

    #[test]
    fn fixed_listener_is_deduplicated() {
        let cfg = launch_configuration(
            "tcp:addr=0.0.0.0,port=0".parse().unwrap(),
            AccessPolicy::allow_all(),
        )
        .unwrap();
        assert_eq!(cfg.listen().len(), 1);
    }

    #[test]
    fn second_start_is_rejected_until_stopped() {
        let lock = CountingLock::default();
        let mut launcher = DaemonLauncher::with_multicast_lock(lock.clone());
        let first = launcher.start(loopback(0), AccessPolicy::allow_all()).unwrap();
        assert!(launcher.is_running());

        let again = launcher.start(loopback(0), AccessPolicy::allow_all());
        assert!(matches!(again, Err(LaunchError::AlreadyRunning)));
        assert_eq!(launcher.handle(), Some(&first));
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 1);

        launcher.stop().unwrap();
        assert!(!launcher.is_running());
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);

        launcher.start(loopback(0), AccessPolicy::allow_all()).unwrap();
        launcher.stop().unwrap();
        assert_eq!(lock.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(lock.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bind_failure_reports_and_releases_lock() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let lock = CountingLock::default();
        let mut launcher = DaemonLauncher::with_multicast_lock(lock.clone());
        let r = launcher.start(loopback(port), AccessPolicy::allow_all());
        assert!(matches!(r, Err(LaunchError::Daemon(DaemonError::Bind { .. }))));
        assert!(!launcher.is_running());
        assert_eq!(lock.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn raw_run_needs_config_service_payload() {
        let mut launcher = DaemonLauncher::new();
        let r = launcher.run_daemon(vec!["bus-daemon".into(), "--bogus".into()], "<busconfig/>");
        assert!(matches!(r, Err(LaunchError::Daemon(DaemonError::Args(_)))));
        let r = launcher.run_daemon(launcher_argv(), "<busconfig><type>alljoyn</type></busconfig>");
        assert!(matches!(
            r,
            Err(LaunchError::Daemon(DaemonError::Config(ConfigError::NoListen)))
        ));
    }

    #[test]
    fn stop_when_idle_is_noop() {
        let mut launcher = DaemonLauncher::new();
        assert!(launcher.stop().is_ok());
        assert!(launcher.handle().is_none());
    }
}
