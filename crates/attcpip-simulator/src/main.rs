//! at-simulator binary entry point.
//!
//! Usage: at-simulator [--port <port>] [--telemetry-port <port>]

use anyhow::Context;
use attcpip_protocol::Parameters;
use attcpip_simulator::{AtSimulator, SimulatorError, SimulatorOptions};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Simulated AT hardware controller.
#[derive(Parser, Debug)]
#[command(name = "at-simulator")]
#[command(about = "Simulated AT TCP/IP hardware controller")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "AT_SIMULATOR_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port for commands and events.
    #[arg(long, env = "AT_SIMULATOR_PORT", default_value = "5000")]
    port: u16,

    /// Port for telemetry. Without it telemetry shares the command port.
    #[arg(long, env = "AT_SIMULATOR_TELEMETRY_PORT")]
    telemetry_port: Option<u16>,

    /// Telemetry publish interval in milliseconds.
    #[arg(long, default_value = "1000")]
    telemetry_interval_ms: u64,

    /// Answer `enable` by going to FAULT.
    #[arg(long)]
    go_to_fault_on_enable: bool,

    /// Additional command names to accept.
    #[arg(long = "command")]
    commands: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write JSONL logs to this file instead of stderr only.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    observability::init_with_config(observability::LogConfig {
        service_name: "at-simulator".into(),
        default_level: args.log_level.clone(),
        log_path: args.log_file.clone(),
        also_stderr: true,
    })
    .context("failed to initialise logging")?;

    let options = SimulatorOptions {
        cmd_evt_addr: SocketAddr::new(args.host, args.port),
        telemetry_addr: args.telemetry_port.map(|port| SocketAddr::new(args.host, port)),
        go_to_fault_on_enable: args.go_to_fault_on_enable,
        extra_commands: args.commands.clone(),
        ..Default::default()
    };
    let simulator = AtSimulator::start_with(options)
        .await
        .context("failed to start simulator")?;

    info!(
        cmd_evt = %simulator.cmd_evt_addr(),
        telemetry_port = ?simulator.telemetry_port(),
        interval_ms = args.telemetry_interval_ms,
        "Simulator ready"
    );

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.telemetry_interval_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => publish_telemetry(&simulator, started.elapsed()),
            _ = &mut ctrl_c => {
                info!("Received shutdown signal, exiting...");
                break;
            }
        }
    }

    Ok(())
}

/// Publish a slowly moving mount position.
fn publish_telemetry(simulator: &AtSimulator, elapsed: Duration) {
    let t = elapsed.as_secs_f64();
    let mut parameters = Parameters::new();
    parameters.insert("azimuth".to_string(), serde_json::json!((t * 0.5) % 360.0));
    parameters.insert("elevation".to_string(), serde_json::json!(45.0 + 10.0 * (t / 60.0).sin()));
    parameters.insert("summaryState".to_string(), serde_json::json!(simulator.summary_state().code()));

    match simulator.emit_telemetry("mountPosition", parameters) {
        Ok(()) => {}
        Err(SimulatorError::NoClient(link)) => debug!(link, "No client for telemetry"),
        Err(e) => warn!(error = %e, "Failed to publish telemetry"),
    }
}
