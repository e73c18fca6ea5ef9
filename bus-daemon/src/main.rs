// Local message bus daemon: listen transports, connection limits, session router.

use std::io::Read;

use anyhow::{Context, Result};
use bus_daemon::{config, resolve_configuration, runtime, wait_for_signal, Daemon, DaemonArgs};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = DaemonArgs::parse();
    let settings = config::load();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&settings.log)
                .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG)),
        )
        .init();

    let payload = if args.config_service {
        let mut xml = String::new();
        std::io::stdin()
            .read_to_string(&mut xml)
            .context("read configuration payload from stdin")?;
        Some(xml)
    } else {
        None
    };
    let bus_config = resolve_configuration(&args, payload.as_deref(), &settings)
        .context("daemon configuration")?;

    let rt = runtime()?;
    rt.block_on(async {
        let daemon = Daemon::bind(&bus_config)
            .await
            .context("bind listen addresses")?
            .with_grace(settings.shutdown_grace());
        for spec in daemon.bound() {
            tracing::info!(connect = %spec, "accepting connections");
        }
        daemon.run(wait_for_signal()).await;
        Ok(())
    })
}
