//! CloudLink demo: runs the agent core against the in-process loopback
//! engine.
//!
//! ```text
//!   LoopbackCloud ──"help"──▶ engine driver ──▶ cl-cli worker ──▶ handler
//!        ▲                                                         │
//!        └──────────────────────── reply ◀─────────────────────────┘
//!   main ──send_data──▶ transaction ──▶ engine ──on_complete──▶ main
//! ```
//!
//! Run with `RUST_LOG=debug` to see every lifecycle step.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use tracing_subscriber::EnvFilter;

use cloudlink::config::{CommandConfig, DataConfig};
use cloudlink::services::InboundRequest;
use cloudlink::datapoints::Timestamp;
use cloudlink::{
    CloudRequest, DataPoint, DataPointCollection, HandlerResult, Instance, SendData, Service,
    StartConfig, StopBehavior, Timeout, Transport, Value, loopback,
};

const DEVICE_ID: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xc0, 0xff, 0xee, 0x01];

fn command_handler(request: &InboundRequest) -> HandlerResult {
    let text = request.payload_str().unwrap_or_default();
    info!("demo: command '{}'", text);
    match text.trim() {
        "help" => Ok(b"commands: help, uptime".to_vec()),
        "uptime" => Ok(b"up".to_vec()),
        other => Err(cloudlink::error::HandlerError::new(1, format!("unknown command '{other}'"))),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = StartConfig::new(0x0300_0000, DEVICE_ID, "demo-device", "edp12.devicecloud.com");
    config.services.command = Some(CommandConfig::default());
    config.services.data = Some(DataConfig::default());

    let (engine, cloud) = loopback();
    let instance = Instance::start(config, engine).context("starting agent")?;
    instance
        .register(Service::Command, command_handler)
        .context("registering command handler")?;
    instance
        .start_transport(Transport::Tcp, Timeout::millis(1_000))
        .context("starting tcp")?;

    cloud.push(CloudRequest::command("help"));
    cloud.push(CloudRequest::command("reboot"));
    let finished = cloud.wait_for_finished(2, Duration::from_secs(2));
    for f in &finished {
        info!(
            "demo: {} reply '{}' (error: {:?})",
            f.service,
            String::from_utf8_lossy(&f.reply),
            f.error
        );
    }
    if finished.len() != 2 {
        bail!("cloud saw {} of 2 replies", finished.len());
    }

    let reply = instance
        .send_data(
            SendData::new("telemetry/demo", b"{\"temp\":21.5}".to_vec()),
            Timeout::millis(1_000),
        )
        .context("sending telemetry")?;
    info!("demo: send_data acknowledged ({} bytes)", reply.response.len());

    let mut samples = DataPointCollection::new();
    samples
        .add_stream_extra("temp", "float ts_epoch_ms", Some("C"), None)
        .context("declaring stream")?;
    for (ms, value) in [(1_000, 21.5), (2_000, 21.7)] {
        samples
            .add("temp", DataPoint::new(Value::Float(value)).at(Timestamp::EpochMs(ms)))
            .context("adding sample")?;
    }
    instance
        .send_datapoints(Transport::Tcp, &mut samples, false, Timeout::millis(1_000))
        .context("sending data points")?;
    info!("demo: data points uploaded");

    while let Some(event) = instance.next_event() {
        info!("demo: event {:?}", event);
    }

    if let Err(e) = instance.stop(StopBehavior::Graceful) {
        warn!("demo: stop failed: {}", e);
    }
    Ok(())
}
