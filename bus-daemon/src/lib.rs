//! Minimal local message bus daemon.
//!
//! [`run_daemon`] is the raw entry point: argv plus an optional busconfig XML
//! payload, blocking until a termination signal. Embedders that need the bound
//! addresses use [`configure`], [`Daemon::bind`] and [`Daemon::run`] directly.

pub mod args;
pub mod config;
pub mod server;
pub mod transport;

use std::ffi::OsString;
use std::path::PathBuf;

use bus_core::config::{BusConfiguration, ConfigError};
use clap::Parser;
use tracing::{info, warn};

pub use args::{launcher_argv, DaemonArgs};
pub use config::Settings;
pub use server::Daemon;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("arguments: {0}")]
    Args(#[from] clap::Error),
    #[error("--config-service given but no configuration payload")]
    MissingPayload,
    #[error("read {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("bind {spec}: {source}")]
    Bind {
        spec: String,
        source: std::io::Error,
    },
    #[error("runtime: {0}")]
    Runtime(std::io::Error),
}

/// Pick the configuration source: `--config-file`, then the service payload
/// (with `--config-service`), then `settings`.
pub fn resolve_configuration(
    args: &DaemonArgs,
    payload: Option<&str>,
    settings: &Settings,
) -> Result<BusConfiguration, DaemonError> {
    if let Some(path) = &args.config_file {
        let xml = std::fs::read_to_string(path).map_err(|source| DaemonError::ReadConfig {
            path: path.clone(),
            source,
        })?;
        return Ok(BusConfiguration::from_xml(&xml)?);
    }
    if args.config_service {
        let xml = payload.ok_or(DaemonError::MissingPayload)?;
        return Ok(BusConfiguration::from_xml(xml)?);
    }
    if payload.is_some() {
        warn!("configuration payload ignored without --config-service");
    }
    Ok(settings.bus_configuration()?)
}

/// Parse `argv` and build the daemon configuration. Settings come from the
/// usual file and environment sources.
pub fn configure<I, T>(argv: I, payload: Option<&str>) -> Result<BusConfiguration, DaemonError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = DaemonArgs::try_parse_from(argv)?;
    if !args.nofork {
        info!("daemon runs in the foreground; forking is not supported");
    }
    resolve_configuration(&args, payload, &config::load())
}

/// Multi-threaded runtime the daemon serves on.
pub fn runtime() -> Result<tokio::runtime::Runtime, DaemonError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("bus-daemon")
        .build()
        .map_err(DaemonError::Runtime)
}

/// Run a daemon until Ctrl+C or SIGTERM. Blocks the calling thread.
pub fn run_daemon<I, T>(argv: I, payload: Option<&str>) -> Result<(), DaemonError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let config = configure(argv, payload)?;
    let grace = config::load().shutdown_grace();
    runtime()?.block_on(async {
        let daemon = Daemon::bind(&config).await?.with_grace(grace);
        info!(guid = daemon.guid(), "daemon started");
        daemon.run(wait_for_signal()).await;
        Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

/// `shutdown_signal`, never resolving if signal handlers cannot be installed.
pub async fn wait_for_signal() {
    if let Err(e) = shutdown_signal().await {
        warn!(error = %e, "cannot install signal handlers; stop the daemon externally");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_core::config::ListenSpec;
    use std::io::Write;

    const XML: &str = "<busconfig><type>alljoyn</type>\
        <listen>tcp:addr=127.0.0.1,port=0</listen></busconfig>";

    fn args(argv: &[&str]) -> DaemonArgs {
        DaemonArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn service_payload_used_with_flag() {
        let a = args(&launcher_argv_str());
        let cfg = resolve_configuration(&a, Some(XML), &Settings::default()).unwrap();
        assert_eq!(cfg.listen().len(), 1);
        assert!(matches!(cfg.listen()[0], ListenSpec::Tcp { port: 0, .. }));
    }

    fn launcher_argv_str() -> Vec<&'static str> {
        vec!["bus-daemon", "--config-service", "--nofork", "--no-bt"]
    }

    #[test]
    fn service_flag_without_payload_fails() {
        let r = resolve_configuration(&args(&launcher_argv_str()), None, &Settings::default());
        assert!(matches!(r, Err(DaemonError::MissingPayload)));
    }

    #[test]
    fn config_file_wins() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            "<busconfig><listen>unix:path=/tmp/bus-test.sock</listen></busconfig>"
        )
        .unwrap();
        let path = f.path().to_string_lossy().to_string();
        let a = args(&["bus-daemon", "--config-service", "--config-file", &path]);
        let cfg = resolve_configuration(&a, Some(XML), &Settings::default()).unwrap();
        assert_eq!(
            cfg.listen(),
            &[ListenSpec::UnixPath("/tmp/bus-test.sock".into())]
        );
    }

    #[test]
    fn settings_used_otherwise() {
        let settings = Settings {
            listen: vec!["tcp:addr=127.0.0.1,port=7".into()],
            ..Settings::default()
        };
        let cfg = resolve_configuration(&args(&["bus-daemon"]), Some(XML), &settings).unwrap();
        assert_eq!(cfg.listen()[0].to_string(), "tcp:addr=127.0.0.1,port=7");
    }

    #[test]
    fn bad_payload_is_config_error() {
        let a = args(&launcher_argv_str());
        let r = resolve_configuration(&a, Some("<nope/>"), &Settings::default());
        assert!(matches!(r, Err(DaemonError::Config(_))));
    }

    #[test]
    fn missing_config_file() {
        let a = args(&["bus-daemon", "--config-file", "/nonexistent/bus.xml"]);
        let r = resolve_configuration(&a, None, &Settings::default());
        assert!(matches!(r, Err(DaemonError::ReadConfig { .. })));
    }
}
