//! Daemon server: binds every listen spec, enforces connection limits and the
//! auth timeout, and drives the router from each connection's frame loop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bus_core::config::{BusConfiguration, Limits, ListenSpec};
use bus_core::router::accept_hello;
use bus_core::{BusRouter, EndpointId, Message, Outbound};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::transport::{read_message, write_message, Listener, Stream};
use crate::DaemonError;

const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Router plus the outbound queue of every completed connection.
struct Hub {
    router: BusRouter,
    senders: HashMap<EndpointId, mpsc::UnboundedSender<Message>>,
}

impl Hub {
    /// Queue actions in router order; called with the hub locked.
    fn deliver(&self, actions: Vec<Outbound>) {
        for action in actions {
            match action {
                Outbound::Send(to, msg) => {
                    if let Some(tx) = self.senders.get(&to) {
                        let _ = tx.send(msg);
                    }
                }
            }
        }
    }
}

#[derive(Clone)]
struct ConnCtx {
    hub: Arc<Mutex<Hub>>,
    limits: Limits,
    completed: Arc<Semaphore>,
    shutdown: watch::Receiver<bool>,
}

/// A daemon whose listeners are bound. Call [`Daemon::run`] to serve.
pub struct Daemon {
    listeners: Vec<(Listener, ListenSpec)>,
    bound: Vec<ListenSpec>,
    hub: Arc<Mutex<Hub>>,
    guid: String,
    limits: Limits,
    grace: Duration,
}

impl Daemon {
    /// Bind every listen spec of `config`. Fails on the first spec that cannot be bound.
    pub async fn bind(config: &BusConfiguration) -> Result<Self, DaemonError> {
        let mut listeners = Vec::new();
        let mut bound = Vec::new();
        for spec in config.listen() {
            let bind_err = |source| DaemonError::Bind {
                spec: spec.to_string(),
                source,
            };
            let listener = Listener::bind(spec).await.map_err(bind_err)?;
            let connect = listener.connect_spec(spec).map_err(bind_err)?;
            info!(listen = %spec, connect = %connect, "listening");
            bound.push(connect);
            listeners.push((listener, spec.clone()));
        }
        let router = BusRouter::new(config.policy().clone());
        let guid = router.guid().to_string();
        Ok(Self {
            listeners,
            bound,
            hub: Arc::new(Mutex::new(Hub {
                router,
                senders: HashMap::new(),
            })),
            guid,
            limits: config.limits(),
            grace: DEFAULT_GRACE,
        })
    }

    /// How long `run` waits for open connections after shutdown.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Connectable spec per listener, in configuration order. TCP port 0 is
    /// replaced by the bound port.
    pub fn bound(&self) -> &[ListenSpec] {
        &self.bound
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// Serve until `shutdown` completes, then close every connection.
    pub async fn run(self, shutdown: impl Future<Output = ()>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let max_incomplete = self.limits.max_incomplete_connections;
        let max_completed = self.limits.max_completed_connections;
        let incomplete = Arc::new(Semaphore::new(max_incomplete as usize));
        let completed = Arc::new(Semaphore::new(max_completed as usize));
        let ctx = ConnCtx {
            hub: self.hub.clone(),
            limits: self.limits,
            completed: completed.clone(),
            shutdown: stop_rx,
        };
        let mut accepts = JoinSet::new();
        for (listener, spec) in self.listeners {
            accepts.spawn(accept_loop(listener, spec, ctx.clone(), incomplete.clone()));
        }
        drop(ctx);

        shutdown.await;
        info!("daemon shutting down");
        let _ = stop_tx.send(true);
        while accepts.join_next().await.is_some() {}

        // Every live connection holds one permit; wait for all to come back.
        let drained = async {
            let _i = incomplete.acquire_many(max_incomplete).await;
            let _c = completed.acquire_many(max_completed).await;
        };
        if tokio::time::timeout(self.grace, drained).await.is_err() {
            warn!("connections still open after shutdown grace period");
        }
        info!("daemon stopped");
    }
}

async fn accept_loop(
    listener: Listener,
    spec: ListenSpec,
    ctx: ConnCtx,
    incomplete: Arc<Semaphore>,
) {
    let mut stop = ctx.shutdown.clone();
    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = stop.changed() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                let Ok(permit) = incomplete.clone().try_acquire_owned() else {
                    warn!(
                        peer = %peer,
                        listen = %spec,
                        "max incomplete connections reached, dropping"
                    );
                    continue;
                };
                debug!(peer = %peer, listen = %spec, "accepted");
                tokio::spawn(serve_connection(stream, peer, permit, ctx.clone()));
            }
            Err(e) => {
                warn!(listen = %spec, error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    #[cfg(unix)]
    if let ListenSpec::UnixPath(path) = &spec {
        let _ = std::fs::remove_file(path);
    }
}

async fn serve_connection(
    stream: Stream,
    peer: String,
    incomplete: OwnedSemaphorePermit,
    ctx: ConnCtx,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut shutdown = ctx.shutdown.clone();
    let auth_timeout = Duration::from_millis(ctx.limits.auth_timeout_ms.into());

    let hello = tokio::select! {
        r = tokio::time::timeout(auth_timeout, read_message(&mut reader)) => r,
        _ = shutdown.changed() => return,
    };
    let hello = match hello {
        Ok(Ok(Some(m))) => m,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!(peer = %peer, error = %e, "hello read failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "auth timeout");
            return;
        }
    };
    let user = match accept_hello(&hello) {
        Ok(u) => u.to_string(),
        Err(e) => {
            warn!(peer = %peer, error = %e, "hello rejected");
            return;
        }
    };
    let Ok(_completed) = ctx.completed.clone().try_acquire_owned() else {
        warn!(peer = %peer, "max completed connections reached, dropping");
        return;
    };
    drop(incomplete);

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let ep = {
        let mut hub = ctx.hub.lock().await;
        match hub.router.on_connected(&user) {
            Ok((ep, actions)) => {
                hub.senders.insert(ep, tx);
                hub.deliver(actions);
                ep
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "connection refused");
                return;
            }
        }
    };

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &msg).await {
                debug!(endpoint = ep, error = %e, "write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    loop {
        let msg = tokio::select! {
            r = read_message(&mut reader) => r,
            _ = shutdown.changed() => break,
        };
        match msg {
            Ok(Some(msg)) => {
                let mut hub = ctx.hub.lock().await;
                let actions = hub.router.on_message(ep, msg);
                hub.deliver(actions);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(endpoint = ep, error = %e, "read failed");
                break;
            }
        }
    }

    {
        let mut hub = ctx.hub.lock().await;
        hub.senders.remove(&ep);
        let actions = hub.router.on_disconnected(ep);
        hub.deliver(actions);
    }
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connect;
    use bus_core::{Disposition, PROTOCOL_VERSION};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::oneshot;

    fn loopback_config(limits: Limits) -> BusConfiguration {
        BusConfiguration::builder()
            .listen(ListenSpec::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
            .limits(limits)
            .policy(bus_core::AccessPolicy::allow_all())
            .build()
            .unwrap()
    }

    type Running = (ListenSpec, oneshot::Sender<()>, tokio::task::JoinHandle<()>);

    async fn start(limits: Limits) -> Running {
        let daemon = Daemon::bind(&loopback_config(limits))
            .await
            .unwrap()
            .with_grace(Duration::from_millis(500));
        let spec = daemon.bound()[0].clone();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(daemon.run(async {
            let _ = stop_rx.await;
        }));
        (spec, stop_tx, task)
    }

    async fn hello(spec: &ListenSpec) -> (Stream, String) {
        let mut s = connect(spec).await.unwrap();
        write_message(
            &mut s,
            &Message::Hello {
                protocol_version: PROTOCOL_VERSION,
                user: "test".into(),
            },
        )
        .await
        .unwrap();
        match read_message(&mut s).await.unwrap() {
            Some(Message::Welcome { unique_name, .. }) => (s, unique_name),
            other => panic!("expected Welcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_welcome_and_request_name() {
        let (spec, stop, task) = start(Limits::default()).await;
        let (mut s, name) = hello(&spec).await;
        assert!(name.starts_with(':'));
        write_message(
            &mut s,
            &Message::RequestName {
                serial: 1,
                name: "test.peer".into(),
            },
        )
        .await
        .unwrap();
        match read_message(&mut s).await.unwrap() {
            Some(Message::Reply { serial: 1, disposition, .. }) => {
                assert_eq!(disposition, Disposition::PrimaryOwner)
            }
            other => panic!("expected Reply, got {other:?}"),
        }
        let _ = stop.send(());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn bad_version_is_closed() {
        let (spec, stop, task) = start(Limits::default()).await;
        let mut s = connect(&spec).await.unwrap();
        write_message(
            &mut s,
            &Message::Hello {
                protocol_version: 99,
                user: "test".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(read_message(&mut s).await, Ok(None) | Err(_)));
        let _ = stop.send(());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn auth_timeout_closes_silent_connection() {
        let limits = Limits {
            auth_timeout_ms: 50,
            ..Limits::default()
        };
        let (spec, stop, task) = start(limits).await;
        let mut s = connect(&spec).await.unwrap();
        let r = tokio::time::timeout(Duration::from_secs(5), read_message(&mut s)).await;
        assert!(matches!(r, Ok(Ok(None)) | Ok(Err(_))));
        let _ = stop.send(());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn completed_limit_drops_extra_connection() {
        let limits = Limits {
            max_completed_connections: 1,
            ..Limits::default()
        };
        let (spec, stop, task) = start(limits).await;
        let (_first, _) = hello(&spec).await;
        let mut second = connect(&spec).await.unwrap();
        write_message(
            &mut second,
            &Message::Hello {
                protocol_version: PROTOCOL_VERSION,
                user: "test".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(read_message(&mut second).await, Ok(None) | Err(_)));
        let _ = stop.send(());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_releases_name() {
        let (spec, stop, task) = start(Limits::default()).await;
        let (mut a, _) = hello(&spec).await;
        let req = Message::RequestName {
            serial: 1,
            name: "test.peer".into(),
        };
        write_message(&mut a, &req).await.unwrap();
        read_message(&mut a).await.unwrap();
        drop(a);

        let (mut b, _) = hello(&spec).await;
        // The first endpoint's teardown may race with this request; retry briefly.
        let mut got = None;
        for serial in 2..50 {
            write_message(
                &mut b,
                &Message::RequestName {
                    serial,
                    name: "test.peer".into(),
                },
            )
            .await
            .unwrap();
            if let Some(Message::Reply { disposition, .. }) = read_message(&mut b).await.unwrap() {
                if disposition == Disposition::PrimaryOwner {
                    got = Some(disposition);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(got, Some(Disposition::PrimaryOwner));
        let _ = stop.send(());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unbindable_spec_fails() {
        let (spec, stop, task) = start(Limits::default()).await;
        let ListenSpec::Tcp { addr, port } = spec else {
            panic!("tcp spec expected");
        };
        let taken = BusConfiguration::builder()
            .listen(ListenSpec::tcp(addr, port))
            .build()
            .unwrap();
        assert!(matches!(Daemon::bind(&taken).await, Err(DaemonError::Bind { .. })));
        let _ = stop.send(());
        task.await.unwrap();
    }
}
