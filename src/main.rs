//! `suspendd`: power-management daemon entry point.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use suspend_core::clock::SystemClockSource;
use suspend_core::config::DaemonConfig;
use suspend_core::hal::NullHal;
use suspend_core::transport::Transport;

/// Idle-watcher and alarm-heartbeat cadence are driven off the config file;
/// the RTC liveness sample is a fixed cadence per §4.D ("every 5 minutes").
const RTC_LIVENESS_INTERVAL_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "suspendd", about = "Suspend/alarm coordination daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "SUSPENDD_CONFIG", default_value = "/etc/suspendd.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = DaemonConfig::from_file(&args.config)?;
    info!(path = %args.config, "loaded configuration");

    let socket_path = config.ipc_socket_path.clone();
    let idle_granularity_ms = config.suspend.wait_idle_granularity_ms;

    // A production build wires a platform-specific `PlatformHal`; `NullHal`
    // keeps this binary runnable without real hardware, same boundary as
    // spec.md's hardware-abstraction Non-goal.
    let hal: Arc<dyn suspend_core::hal::PlatformHal> = Arc::new(NullHal::default());

    let transport = Transport::bind(&socket_path, config, hal, Box::new(SystemClockSource))?;
    let core = transport.core().clone();

    let idle_core = core.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
            idle_granularity_ms.max(50),
        ));
        loop {
            ticker.tick().await;
            idle_core.post_idle_tick();
        }
    });

    let alarm_core = core.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            ticker.tick().await;
            alarm_core.alarm_heartbeat();
        }
    });

    let liveness_core = core.clone();
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(RTC_LIVENESS_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if let Some(rtc) = liveness_core.hal.read_rtc() {
                liveness_core.alarms.check_rtc_liveness(rtc);
            }
        }
    });

    info!(socket = %socket_path, "suspendd starting");
    transport.serve().await.map_err(|e| {
        error!(error = %e, "transport exited");
        anyhow::anyhow!(e)
    })
}
