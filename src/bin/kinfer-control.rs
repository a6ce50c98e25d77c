//! Entry point: parses CLI arguments, wires the catalog, motor driver,
//! shutdown manager, logger, and chosen adapters into one [`ControlLoop`],
//! runs it to completion, then ramps motors down and drains the logger.

use clap::{Parser, ValueEnum};
use kinfer_control::adapters::command::{CommandSource, DummyCommandSource, Keyboard, UdpCommandSource};
use kinfer_control::adapters::imu::DummyImu;
use kinfer_control::adapters::policy::{DummyPolicyRuntime, PolicyArchive, PolicyMetadata, PolicyRuntime};
use kinfer_control::catalog::RobotConfig;
use kinfer_control::control_loop::ControlLoop;
use kinfer_control::driver::MotorDriver;
use kinfer_control::error::{FirmwareError, Result};
use kinfer_control::logger::{default_log_path, Logger};
use kinfer_control::shutdown::ShutdownManager;
use std::collections::HashMap;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CommandSourceKind {
    Keyboard,
    Udp,
    Dummy,
}

#[derive(Debug, Parser)]
#[command(name = "kinfer-control", about = "Onboard control firmware for a CAN-actuated humanoid")]
struct Args {
    /// Name prefix for CAN interfaces, e.g. "can" discovers can0..can<count-1>.
    #[arg(long, default_value = "can")]
    interface_prefix: String,

    /// Number of CAN interfaces to probe, starting from 0.
    #[arg(long, default_value_t = 7)]
    interface_count: u8,

    /// Path to a .kinfer policy archive. If omitted, runs with a dummy
    /// zero-action policy for bench testing.
    #[arg(long)]
    policy: Option<String>,

    #[arg(long, value_enum, default_value_t = CommandSourceKind::Dummy)]
    command_source: CommandSourceKind,

    #[arg(long, default_value_t = 10000)]
    udp_port: u16,

    /// Maximum PD gain scaling applied during steady-state operation, in [0, 1].
    #[arg(long, default_value_t = 1.0)]
    max_scaling: f64,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "startup failure");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let interfaces: Vec<String> =
        (0..args.interface_count).map(|i| format!("{}{}", args.interface_prefix, i)).collect();

    let shutdown = ShutdownManager::new();
    shutdown.spawn_signal_listener();
    shutdown.register_cleanup("startup_complete_marker", || info!("shutdown sequence beginning"));

    let robot = RobotConfig::new();
    let mut driver = MotorDriver::discover(&interfaces, robot.clone(), args.max_scaling).await?;

    let startup_samples = driver.startup_sequence().await?;
    info!(joints = startup_samples.len(), "startup safety check passed");

    let home_positions: HashMap<u8, f64> = robot.iter().map(|d| (d.can_id, d.joint_bias)).collect();
    driver.enable_and_home(&home_positions).await?;

    let policy_name = args.policy.clone().unwrap_or_else(|| "dummy".to_string());
    let log_path = default_log_path(&policy_name, unix_timestamp());
    let (logger, logger_handle) = Logger::spawn(&log_path)?;
    info!(path = %log_path.display(), "telemetry log opened");

    let max_scaling = args.max_scaling;
    let command_source_kind = args.command_source;
    let udp_port = args.udp_port;

    let (mut driver, loop_result) = match args.policy {
        Some(path) => {
            let archive = PolicyArchive::load(&path)?;
            let policy = EmbeddedRuntime::new(archive);
            dispatch_command_source(driver, shutdown.clone(), logger.clone(), policy, command_source_kind, udp_port, max_scaling).await
        }
        None => {
            let metadata = default_metadata(&robot);
            let policy = DummyPolicyRuntime::new(metadata);
            dispatch_command_source(driver, shutdown.clone(), logger.clone(), policy, command_source_kind, udp_port, max_scaling).await
        }
    };

    // The loop always hands the driver back, on the error path too, so
    // ramp-down/close/log-drain run unconditionally here rather than through
    // `shutdown.register_cleanup` (see DESIGN.md) — a `CriticalFault` (or any
    // other tick error) must not skip ramp-down and leave motors powered at
    // their last commanded torque.
    shutdown.execute_shutdown();
    let ramp_down_result = driver.ramp_down().await;
    drop(driver);
    logger.shutdown(logger_handle).await;

    if let Err(e) = loop_result {
        error!(error = %e, "control loop aborted, ramped down and shut down");
        return Err(e);
    }
    ramp_down_result
}

fn default_metadata(robot: &RobotConfig) -> PolicyMetadata {
    PolicyMetadata {
        joint_names: robot.iter().map(|d| d.full_name.to_string()).collect(),
        command_names: vec![
            "vx".into(),
            "vy".into(),
            "yaw_rate".into(),
            "base_height".into(),
            "base_roll".into(),
            "base_pitch".into(),
        ],
        joint_biases: robot.iter().map(|d| d.joint_bias).collect(),
    }
}

/// Wraps an embedder-supplied `PolicyArchive` without running real
/// inference; kept distinct from `DummyPolicyRuntime` so a future embedder
/// can slot in a real ONNX session behind the same construction site.
struct EmbeddedRuntime {
    metadata: PolicyMetadata,
}

impl EmbeddedRuntime {
    fn new(archive: PolicyArchive) -> Self {
        EmbeddedRuntime { metadata: archive.metadata }
    }
}

impl PolicyRuntime for EmbeddedRuntime {
    fn init(&mut self) -> kinfer_control::adapters::policy::Carry {
        kinfer_control::adapters::policy::Carry(Vec::new())
    }

    fn step(
        &mut self,
        _observation: &[f64],
        carry: kinfer_control::adapters::policy::Carry,
    ) -> (Vec<f64>, kinfer_control::adapters::policy::Carry) {
        (vec![0.0; self.metadata.joint_names.len()], carry)
    }

    fn metadata(&self) -> &PolicyMetadata {
        &self.metadata
    }
}

async fn dispatch_command_source<P: PolicyRuntime>(
    driver: MotorDriver,
    shutdown: ShutdownManager,
    logger: Logger,
    policy: P,
    kind: CommandSourceKind,
    udp_port: u16,
    max_scaling: f64,
) -> (MotorDriver, Result<()>) {
    match kind {
        CommandSourceKind::Keyboard => {
            let (_tx, rx) = std::sync::mpsc::channel();
            let source = Keyboard::spawn(rx);
            run_loop(driver, source, policy, logger, shutdown, max_scaling).await
        }
        CommandSourceKind::Udp => match UdpCommandSource::bind(udp_port).map_err(FirmwareError::Io) {
            Ok(source) => run_loop(driver, source, policy, logger, shutdown, max_scaling).await,
            Err(e) => (driver, Err(e)),
        },
        CommandSourceKind::Dummy => {
            run_loop(driver, DummyCommandSource, policy, logger, shutdown, max_scaling).await
        }
    }
}

async fn run_loop<C: CommandSource, P: PolicyRuntime>(
    driver: MotorDriver,
    command_source: C,
    policy: P,
    logger: Logger,
    shutdown: ShutdownManager,
    max_scaling: f64,
) -> (MotorDriver, Result<()>) {
    let control_loop = ControlLoop::new(driver, DummyImu, command_source, policy, logger, shutdown, max_scaling);
    control_loop.run().await
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
