//! The 50 Hz scheduler: coordinates actuator I/O, IMU sampling, command
//! ingestion, policy inference, and structured logging.

use crate::adapters::{CommandSource, Imu, PolicyRuntime};
use crate::driver::MotorDriver;
use crate::error::Result;
use crate::logger::{LogRecord, Logger, TickTimings};
use crate::shutdown::ShutdownManager;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const TICK_PERIOD: Duration = Duration::from_millis(20);

/// Drives one control loop run to completion. Owns none of its
/// collaborators' lifetimes beyond the run; the caller constructs and
/// registers shutdown cleanups for the driver and logger separately.
pub struct ControlLoop<I, C, P> {
    driver: MotorDriver,
    imu: I,
    command_source: C,
    policy: P,
    logger: Logger,
    shutdown: ShutdownManager,
    joint_order: Vec<String>,
    max_scaling: f64,
}

impl<I, C, P> ControlLoop<I, C, P>
where
    I: Imu,
    C: CommandSource,
    P: PolicyRuntime,
{
    pub fn new(
        driver: MotorDriver,
        imu: I,
        command_source: C,
        policy: P,
        logger: Logger,
        shutdown: ShutdownManager,
        max_scaling: f64,
    ) -> Self {
        let joint_order = policy.metadata().joint_names.clone();
        ControlLoop { driver, imu, command_source, policy, logger, shutdown, joint_order, max_scaling }
    }

    /// Runs ticks until the shutdown manager reports a shutdown is in
    /// progress, or until a tick surfaces an error (a `CriticalFault`, a
    /// bus-level I/O error, etc.). Soft-deadline paced: overruns shift the
    /// next deadline forward rather than trying to catch up.
    ///
    /// Always hands the motor driver back alongside the outcome — on the
    /// error path too — so the caller can still ramp down and close buses
    /// in order even when a tick aborted the loop. The driver must never be
    /// dropped without a ramp-down first; see spec §4.E/§7.
    pub async fn run(mut self) -> (MotorDriver, Result<()>) {
        let mut carry = self.policy.init();
        let mut tick: u64 = 0;
        let mut next_deadline = Instant::now() + TICK_PERIOD;

        let outcome: Result<()> = loop {
            if self.shutdown.is_shutting_down() {
                break Ok(());
            }

            let tick_start = Instant::now();
            let mut timings = TickTimings::default();

            let t0 = Instant::now();
            let (angles, velocities, torques, temperatures) =
                match self.driver.get_ordered_joint_data(&self.joint_order).await {
                    Ok(data) => data,
                    Err(e) => break Err(e),
                };
            timings.joints_read_us = t0.elapsed().as_micros() as u64;

            let t0 = Instant::now();
            let imu_sample = self.imu.read();
            timings.imu_read_us = t0.elapsed().as_micros() as u64;

            let t0 = Instant::now();
            let command_snapshot = self.command_source.snapshot();
            timings.command_read_us = t0.elapsed().as_micros() as u64;

            let observation = build_observation(
                &angles,
                &velocities,
                &imu_sample.projected_gravity,
                &imu_sample.gyroscope,
                &self.policy.metadata().command_names,
                &command_snapshot.commands,
            );

            let t0 = Instant::now();
            let (action, next_carry) = self.policy.step(&observation, carry);
            carry = next_carry;
            timings.policy_step_us = t0.elapsed().as_micros() as u64;

            let t0 = Instant::now();
            let targets =
                merge_targets(self.driver.robot(), &self.joint_order, &action, &command_snapshot.joint_overrides);
            if let Err(e) = self.driver.set_pd_targets(&targets, self.max_scaling).await {
                break Err(e);
            }
            timings.action_apply_us = t0.elapsed().as_micros() as u64;

            let t0 = Instant::now();
            if let Err(e) = self.driver.flush_can_buses() {
                break Err(e);
            }
            timings.bus_flush_us = t0.elapsed().as_micros() as u64;

            self.logger.log(LogRecord {
                timestamp: unix_now(),
                tick,
                timings,
                joint_angles: angles,
                joint_velocities: velocities,
                joint_torques: torques,
                joint_temperatures: temperatures,
                projected_gravity: imu_sample.projected_gravity,
                gyroscope: imu_sample.gyroscope,
                command_vector: self.policy.metadata().command_names.iter().map(|n| command_snapshot.commands.get(n).copied().unwrap_or(0.0)).collect(),
                action_vector: action,
            });

            let elapsed = tick_start.elapsed();
            if elapsed > TICK_PERIOD {
                warn!(tick, overrun_us = (elapsed - TICK_PERIOD).as_micros() as u64, "tick overran period");
            }
            tokio::time::sleep_until(next_deadline.into()).await;
            next_deadline += TICK_PERIOD;
            tick += 1;
        };

        match &outcome {
            Ok(()) => info!(ticks_run = tick, "control loop exiting for shutdown"),
            Err(e) => tracing::error!(ticks_run = tick, error = %e, "control loop aborted by error"),
        }
        (self.driver, outcome)
    }
}

fn unix_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

/// Concatenates joint angles, joint velocities, projected gravity,
/// gyroscope, and the command vector (in the policy's declared ordering)
/// into one flat observation.
fn build_observation(
    angles: &[f64],
    velocities: &[f64],
    gravity: &[f64; 3],
    gyro: &[f64; 3],
    command_names: &[String],
    commands: &std::collections::HashMap<String, f64>,
) -> Vec<f64> {
    let mut observation = Vec::with_capacity(angles.len() + velocities.len() + 6 + command_names.len());
    observation.extend_from_slice(angles);
    observation.extend_from_slice(velocities);
    observation.extend_from_slice(gravity);
    observation.extend_from_slice(gyro);
    for name in command_names {
        observation.push(commands.get(name).copied().unwrap_or(0.0));
    }
    observation
}

/// Merges the policy's action vector (angles, in joint order) with any
/// per-joint overrides from the command source; overrides win.
fn merge_targets(
    robot: &crate::catalog::RobotConfig,
    joint_order: &[String],
    action: &[f64],
    overrides: &std::collections::HashMap<String, f64>,
) -> std::collections::HashMap<u8, f64> {
    let mut targets = std::collections::HashMap::new();
    for (name, &value) in joint_order.iter().zip(action.iter()) {
        let target = overrides.get(name).copied().unwrap_or(value);
        if let Some(id) = robot.id_for_name(name) {
            targets.insert(id, target);
        }
    }
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_concatenates_in_the_documented_order() {
        let mut commands = std::collections::HashMap::new();
        commands.insert("vx".to_string(), 0.5);
        let observation = build_observation(
            &[1.0, 2.0],
            &[0.1, 0.2],
            &[0.0, 0.0, -9.81],
            &[0.01, 0.02, 0.03],
            &["vx".to_string()],
            &commands,
        );
        assert_eq!(observation, vec![1.0, 2.0, 0.1, 0.2, 0.0, 0.0, -9.81, 0.01, 0.02, 0.03, 0.5]);
    }

    #[test]
    fn joint_overrides_take_precedence_over_the_policy_action() {
        let mut overrides = std::collections::HashMap::new();
        overrides.insert("dof_left_elbow_02".to_string(), 1.23);
        let robot = crate::catalog::RobotConfig::new();
        let targets = merge_targets(&robot, &["dof_left_elbow_02".to_string()], &[0.0], &overrides);
        assert_eq!(targets.get(&14).copied(), Some(1.23));
    }
}
