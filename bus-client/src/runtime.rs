//! Process-wide bus handle: a dedicated worker runtime plus one daemon
//! connection, passed explicitly to every component that talks to the bus.

use std::time::Duration;

use bus_core::config::ListenSpec;
use bus_core::{Message, Serial};
use tokio::sync::oneshot;
use tracing::info;

use crate::connection::{BusConnection, ClientError, Reply};
use crate::ui::UiPoster;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);
const WORKER_THREADS: usize = 2;
const SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Owns the "bus-worker" runtime. Dropping it closes the connection.
pub struct BusRuntime {
    rt: Option<tokio::runtime::Runtime>,
    handle: BusHandle,
}

impl BusRuntime {
    /// Start the worker runtime and connect to the daemon at `spec`.
    /// Blocks; call from a thread that is not running async code.
    pub fn connect(spec: &ListenSpec, ui: UiPoster) -> Result<Self, ClientError> {
        Self::connect_with_timeout(spec, ui, DEFAULT_CALL_TIMEOUT)
    }

    pub fn connect_with_timeout(
        spec: &ListenSpec,
        ui: UiPoster,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("bus-worker")
            .enable_all()
            .build()
            .map_err(ClientError::Runtime)?;
        let user = std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string());
        let conn = rt.block_on(BusConnection::connect(spec, &user, timeout))?;
        let handle = BusHandle {
            exec: rt.handle().clone(),
            conn,
            ui,
            timeout,
        };
        Ok(Self {
            rt: Some(rt),
            handle,
        })
    }

    pub fn handle(&self) -> &BusHandle {
        &self.handle
    }

    /// Close the connection and stop the worker threads (bounded wait).
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(rt) = self.rt.take() {
            self.handle.conn.close();
            rt.shutdown_timeout(SHUTDOWN_WAIT);
            info!("bus runtime stopped");
        }
    }
}

impl Drop for BusRuntime {
    fn drop(&mut self) {
        self.close();
    }
}

/// Clonable access to the worker runtime, the connection and the UI queue.
#[derive(Clone)]
pub struct BusHandle {
    exec: tokio::runtime::Handle,
    conn: BusConnection,
    ui: UiPoster,
    timeout: Duration,
}

impl BusHandle {
    pub fn connection(&self) -> &BusConnection {
        &self.conn
    }

    pub fn ui(&self) -> &UiPoster {
        &self.ui
    }

    /// Run a call on the worker runtime and wait for its reply.
    /// Blocks; panics if called from inside an async context.
    pub fn call(
        &self,
        build: impl FnOnce(Serial) -> Message + Send + 'static,
    ) -> Result<Reply, ClientError> {
        let conn = self.conn.clone();
        let timeout = self.timeout;
        let (tx, rx) = oneshot::channel();
        self.exec.spawn(async move {
            let _ = tx.send(conn.call(build, timeout).await);
        });
        rx.blocking_recv().map_err(|_| ClientError::Disconnected)?
    }
}
